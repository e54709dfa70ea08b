//! Persistent storage: `SQLite` record store and the artifact store.

mod artifact;
pub mod schema;
mod sqlite;

pub use artifact::{ArtifactStore, FsArtifactStore, export_key, load_json, store_json};
pub use sqlite::{ChunkFilter, ChunkRow, SqliteStore, StoreStats};

/// Shared handle to the record store.
///
/// Reads are short and writes are single-writer per job, so a mutex around
/// the connection is sufficient (see the concurrency notes in the crate
/// docs). Async callers hold the lock only across individual queries.
pub type SharedStore = std::sync::Arc<std::sync::Mutex<SqliteStore>>;

/// Wraps a store in a [`SharedStore`] handle.
#[must_use]
pub fn shared(store: SqliteStore) -> SharedStore {
    std::sync::Arc::new(std::sync::Mutex::new(store))
}

/// Runs a closure against the locked store.
///
/// # Errors
///
/// Returns an error if the lock is poisoned or the closure fails.
pub fn with_store<T>(
    store: &SharedStore,
    f: impl FnOnce(&mut SqliteStore) -> crate::Result<T>,
) -> crate::Result<T> {
    let mut guard = store.lock().map_err(|_| crate::Error::InvalidState {
        message: "store lock poisoned".to_string(),
    })?;
    f(&mut guard)
}
