//! Artifact store: backend-agnostic persistence for stage outputs.
//!
//! Artifacts (parsed text, chunk sets, summaries, generated workflow JSON)
//! are stored either inline in the owning record or behind a key in an
//! object store. The [`ArtifactStore`] trait is the seam to cloud object
//! storage; [`FsArtifactStore`] is the filesystem backend used by the CLI
//! and tests.

use std::path::PathBuf;

use crate::core::ArtifactPointer;
use crate::error::{Result, StorageError};

/// Object-store operations used by the core.
pub trait ArtifactStore: Send + Sync {
    /// Stores bytes under a key and returns a pointer.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn store(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<ArtifactPointer>;

    /// Loads the bytes behind a pointer. Inline pointers resolve without
    /// touching the backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the pointer cannot be resolved.
    fn load(&self, pointer: &ArtifactPointer) -> Result<Vec<u8>>;

    /// Deletes the artifact behind a pointer. Inline pointers are a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if deletion fails.
    fn delete(&self, pointer: &ArtifactPointer) -> Result<()>;
}

/// Convenience: stores a JSON value and returns a pointer.
///
/// # Errors
///
/// Returns an error if serialization or the write fails.
pub fn store_json(
    store: &dyn ArtifactStore,
    key: &str,
    value: &serde_json::Value,
) -> Result<ArtifactPointer> {
    let bytes = serde_json::to_vec(value).map_err(StorageError::from)?;
    store.store(key, &bytes, "application/json")
}

/// Convenience: loads and parses a JSON artifact.
///
/// # Errors
///
/// Returns an error if the load or parse fails.
pub fn load_json(store: &dyn ArtifactStore, pointer: &ArtifactPointer) -> Result<serde_json::Value> {
    let bytes = store.load(pointer)?;
    serde_json::from_slice(&bytes).map_err(|e| StorageError::Serialization(e.to_string()).into())
}

/// Builds a dated export key:
/// `exports/{workflow-name}/{YYYY}/{MM}/{DD}/{run_id}_{ts}_{filename}`.
#[must_use]
pub fn export_key(workflow_name: &str, run_id: &str, timestamp: i64, filename: &str) -> String {
    let slug: String = workflow_name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");

    let (year, month, day) = civil_date(timestamp);
    format!("exports/{slug}/{year:04}/{month:02}/{day:02}/{run_id}_{timestamp}_{filename}")
}

/// Converts a Unix timestamp to a (year, month, day) civil date in UTC.
///
/// Days-from-epoch algorithm; exact for the full i64 second range we store.
#[allow(clippy::cast_possible_truncation)]
fn civil_date(timestamp: i64) -> (i64, u32, u32) {
    let days = timestamp.div_euclid(86_400);
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let year = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    let year = if month <= 2 { year + 1 } else { year };
    (year, month, day)
}

/// Filesystem-backed artifact store.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    /// Creates a store rooted at `root`. The directory is created on first
    /// write, not here.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        // Keys are store-relative; refuse anything that escapes the root.
        if key.contains("..") || key.starts_with('/') {
            return Err(StorageError::Artifact(format!("invalid artifact key: {key}")).into());
        }
        Ok(self.root.join(key))
    }
}

impl ArtifactStore for FsArtifactStore {
    fn store(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<ArtifactPointer> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::Artifact(format!("mkdir failed: {e}")))?;
        }
        std::fs::write(&path, bytes)
            .map_err(|e| StorageError::Artifact(format!("write failed for {key}: {e}")))?;
        Ok(ArtifactPointer::file(
            key,
            Some(bytes.len() as u64),
            Some(content_type.to_string()),
        ))
    }

    fn load(&self, pointer: &ArtifactPointer) -> Result<Vec<u8>> {
        match pointer {
            ArtifactPointer::Inline { payload } => {
                serde_json::to_vec(payload).map_err(|e| StorageError::Serialization(e.to_string()).into())
            }
            ArtifactPointer::File { key, .. } => {
                let path = self.path_for(key)?;
                crate::io::read_to_bytes(&path)
            }
        }
    }

    fn delete(&self, pointer: &ArtifactPointer) -> Result<()> {
        match pointer {
            ArtifactPointer::Inline { .. } => Ok(()),
            ArtifactPointer::File { key, .. } => {
                let path = self.path_for(key)?;
                if path.exists() {
                    std::fs::remove_file(&path)
                        .map_err(|e| StorageError::Artifact(format!("delete failed: {e}")))?;
                }
                Ok(())
            }
        }
    }
}
