//! Database schema definitions.
//!
//! Contains SQL schema and migration logic for the engine's `SQLite`
//! database: documents, chunks (with FTS5 and embeddings), collections,
//! chat sessions and messages, workflow templates and runs, extractions,
//! job states, and the extraction dedup cache.

/// Current schema version.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// SQL schema for initial database setup.
pub const SCHEMA_SQL: &str = r"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_info (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- Uploaded documents
CREATE TABLE IF NOT EXISTS documents (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    org_id TEXT NOT NULL,
    filename TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    byte_size INTEGER NOT NULL,
    page_count INTEGER,
    status TEXT NOT NULL,
    parser TEXT,
    parse_artifact TEXT,  -- JSON ArtifactPointer
    created_at INTEGER NOT NULL,
    UNIQUE (org_id, content_hash)
);

CREATE INDEX IF NOT EXISTS idx_documents_hash ON documents(content_hash);
CREATE INDEX IF NOT EXISTS idx_documents_user ON documents(user_id);

-- Collections (named document sets)
CREATE TABLE IF NOT EXISTS collections (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    user_id TEXT NOT NULL,
    org_id TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS collection_documents (
    collection_id TEXT NOT NULL,
    document_id TEXT NOT NULL,
    PRIMARY KEY (collection_id, document_id),
    FOREIGN KEY (collection_id) REFERENCES collections(id) ON DELETE CASCADE,
    FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
);

-- Retrieval chunks. The full chunk record is stored as JSON in `data`;
-- filter columns are duplicated for indexing.
CREATE TABLE IF NOT EXISTS document_chunks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    chunk_id TEXT NOT NULL,
    document_id TEXT NOT NULL,
    chunk_index INTEGER NOT NULL,
    kind TEXT NOT NULL,
    section_id TEXT NOT NULL,
    page_number INTEGER NOT NULL,
    text TEXT NOT NULL,
    data TEXT NOT NULL,  -- JSON serialized DocChunk
    created_at INTEGER NOT NULL,
    UNIQUE (document_id, chunk_id),
    FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_chunks_document ON document_chunks(document_id, chunk_index);
CREATE INDEX IF NOT EXISTS idx_chunks_section ON document_chunks(document_id, section_id);

-- Chunk embeddings for dense retrieval
CREATE TABLE IF NOT EXISTS chunk_embeddings (
    chunk_rowid INTEGER PRIMARY KEY,
    embedding BLOB NOT NULL,  -- f32 array serialized as little-endian bytes
    dimensions INTEGER NOT NULL,
    model_name TEXT,
    created_at INTEGER NOT NULL,
    FOREIGN KEY (chunk_rowid) REFERENCES document_chunks(id) ON DELETE CASCADE
);

-- FTS5 virtual table for BM25 full-text search over chunk text
CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
    text,
    content='document_chunks',
    content_rowid='id',
    tokenize='porter unicode61'
);

-- Triggers to keep the FTS5 index in sync with document_chunks
CREATE TRIGGER IF NOT EXISTS chunks_ai AFTER INSERT ON document_chunks BEGIN
    INSERT INTO chunks_fts(rowid, text) VALUES (new.id, new.text);
END;

CREATE TRIGGER IF NOT EXISTS chunks_ad AFTER DELETE ON document_chunks BEGIN
    INSERT INTO chunks_fts(chunks_fts, rowid, text) VALUES('delete', old.id, old.text);
END;

CREATE TRIGGER IF NOT EXISTS chunks_au AFTER UPDATE ON document_chunks BEGIN
    INSERT INTO chunks_fts(chunks_fts, rowid, text) VALUES('delete', old.id, old.text);
    INSERT INTO chunks_fts(chunks_fts, rowid, text) VALUES (new.id, new.text);
END;

-- Chat sessions
CREATE TABLE IF NOT EXISTS chat_sessions (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    org_id TEXT NOT NULL,
    collection_id TEXT,
    message_count INTEGER NOT NULL DEFAULT 0,
    summary TEXT,  -- JSON ConversationSummary
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS session_documents (
    session_id TEXT NOT NULL,
    document_id TEXT NOT NULL,
    position INTEGER NOT NULL,
    PRIMARY KEY (session_id, document_id),
    FOREIGN KEY (session_id) REFERENCES chat_sessions(id) ON DELETE CASCADE,
    FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
);

-- Append-only chat message log
CREATE TABLE IF NOT EXISTS chat_messages (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    seq INTEGER NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    data TEXT NOT NULL,  -- JSON serialized ChatMessage
    created_at INTEGER NOT NULL,
    UNIQUE (session_id, seq),
    FOREIGN KEY (session_id) REFERENCES chat_sessions(id) ON DELETE CASCADE
);

-- Workflow templates (immutable per version)
CREATE TABLE IF NOT EXISTS workflows (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    domain TEXT NOT NULL,
    version INTEGER NOT NULL,
    active INTEGER NOT NULL DEFAULT 1,
    data TEXT NOT NULL,  -- JSON serialized WorkflowTemplate
    created_at INTEGER NOT NULL,
    UNIQUE (name, version)
);

-- Workflow runs
CREATE TABLE IF NOT EXISTS workflow_runs (
    id TEXT PRIMARY KEY,
    workflow_id TEXT NOT NULL,
    status TEXT NOT NULL,
    data TEXT NOT NULL,  -- JSON serialized WorkflowRun
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_runs_workflow ON workflow_runs(workflow_id);

-- One-shot structured extractions
CREATE TABLE IF NOT EXISTS extractions (
    id TEXT PRIMARY KEY,
    document_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    org_id TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    status TEXT NOT NULL,
    data TEXT NOT NULL,  -- JSON serialized ExtractionRecord
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_extractions_user ON extractions(user_id, status);
CREATE INDEX IF NOT EXISTS idx_extractions_hash ON extractions(content_hash, status);

-- Excel templates (thin record; internals live behind TemplateFillOps)
CREATE TABLE IF NOT EXISTS excel_templates (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    data TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

-- Template-fill runs
CREATE TABLE IF NOT EXISTS template_fill_runs (
    id TEXT PRIMARY KEY,
    template_id TEXT NOT NULL,
    status TEXT NOT NULL,
    data TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

-- Job states: exactly one parent FK must be set
CREATE TABLE IF NOT EXISTS job_states (
    id TEXT PRIMARY KEY,
    extraction_id TEXT,
    document_id TEXT,
    workflow_run_id TEXT,
    template_fill_run_id TEXT,
    status TEXT NOT NULL,
    data TEXT NOT NULL,  -- JSON serialized JobState
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    CHECK (
        (extraction_id IS NOT NULL) + (document_id IS NOT NULL) +
        (workflow_run_id IS NOT NULL) + (template_fill_run_id IS NOT NULL) = 1
    )
);

CREATE INDEX IF NOT EXISTS idx_jobs_extraction ON job_states(extraction_id);
CREATE INDEX IF NOT EXISTS idx_jobs_document ON job_states(document_id);
CREATE INDEX IF NOT EXISTS idx_jobs_run ON job_states(workflow_run_id);
CREATE INDEX IF NOT EXISTS idx_jobs_fill ON job_states(template_fill_run_id);

-- Extraction dedup cache keyed by content hash
CREATE TABLE IF NOT EXISTS cache_entries (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
";

/// SQL to check if schema is initialized.
pub const CHECK_SCHEMA_SQL: &str = r"
SELECT COUNT(*) FROM sqlite_master
WHERE type='table' AND name='schema_info';
";

/// SQL to get schema version.
pub const GET_VERSION_SQL: &str = r"
SELECT value FROM schema_info WHERE key = 'version';
";

/// SQL to set schema version.
pub const SET_VERSION_SQL: &str = r"
INSERT OR REPLACE INTO schema_info (key, value) VALUES ('version', ?);
";

/// Migrations from older schema versions.
pub struct Migration {
    /// Version this migration upgrades from.
    pub from_version: u32,
    /// Version this migration upgrades to.
    pub to_version: u32,
    /// SQL statements to execute.
    pub sql: &'static str,
}

/// Available migrations.
pub const MIGRATIONS: &[Migration] = &[];

/// Gets migrations needed to upgrade from a version.
#[must_use]
pub fn get_migrations_from(current_version: u32) -> Vec<&'static Migration> {
    MIGRATIONS
        .iter()
        .filter(|m| m.from_version >= current_version && m.to_version <= CURRENT_SCHEMA_VERSION)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_version() {
        const _: () = assert!(CURRENT_SCHEMA_VERSION >= 1);
    }

    #[test]
    fn test_schema_sql_not_empty() {
        assert!(!SCHEMA_SQL.is_empty());
        assert!(SCHEMA_SQL.contains("CREATE TABLE"));
        assert!(SCHEMA_SQL.contains("chunks_fts"));
    }

    #[test]
    fn test_job_state_exclusivity_check_present() {
        assert!(SCHEMA_SQL.contains("(workflow_run_id IS NOT NULL)"));
        assert!(SCHEMA_SQL.contains("= 1"));
    }

    #[test]
    fn test_migrations_ordered() {
        for migration in MIGRATIONS {
            assert!(migration.to_version > migration.from_version);
        }
    }
}
