//! Collections: named document sets that scope retrieval.

use serde::{Deserialize, Serialize};

/// A named set of documents owned by a user/org.
///
/// Collections reference documents without owning them; deleting a
/// collection never deletes its documents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collection {
    /// Collection id (UUID v4).
    pub id: String,
    /// Display name.
    pub name: String,
    /// Owning user id.
    pub user_id: String,
    /// Owning organization id.
    pub org_id: String,
    /// Unix timestamp of creation.
    pub created_at: i64,
}

impl Collection {
    /// Creates a new collection.
    #[must_use]
    pub fn new(name: &str, user_id: &str, org_id: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            user_id: user_id.to_string(),
            org_id: org_id.to_string(),
            created_at: super::current_timestamp(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_collection() {
        let coll = Collection::new("Q3 deals", "u1", "org1");
        assert_eq!(coll.name, "Q3 deals");
        assert!(!coll.id.is_empty());
    }
}
