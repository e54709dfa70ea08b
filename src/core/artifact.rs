//! Artifact pointers: opaque descriptors resolved by a backend-agnostic loader.

use serde::{Deserialize, Serialize};

/// A pointer to a persisted artifact, or the artifact itself inline.
///
/// Artifacts in the external store are owned by the record holding the
/// pointer; deleting the record must delete the artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "backend")]
pub enum ArtifactPointer {
    /// Payload stored directly in the record.
    Inline {
        /// The artifact payload.
        payload: serde_json::Value,
    },
    /// Key into the filesystem artifact store.
    File {
        /// Store-relative key.
        key: String,
        /// Size in bytes, when known.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size: Option<u64>,
        /// MIME type, when known.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content_type: Option<String>,
    },
}

impl ArtifactPointer {
    /// Creates an inline pointer holding the payload directly.
    #[must_use]
    pub const fn inline(payload: serde_json::Value) -> Self {
        Self::Inline { payload }
    }

    /// Creates a file-backed pointer.
    #[must_use]
    pub fn file(key: impl Into<String>, size: Option<u64>, content_type: Option<String>) -> Self {
        Self::File {
            key: key.into(),
            size,
            content_type,
        }
    }

    /// The storage key, if this pointer is file-backed.
    #[must_use]
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::Inline { .. } => None,
            Self::File { key, .. } => Some(key),
        }
    }
}
