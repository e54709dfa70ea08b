//! `SQLite` store implementation.
//!
//! Persists every record family from the data model: documents, chunks
//! (with FTS5 index and embedding BLOBs), collections, chat sessions and
//! messages, workflow templates and runs, extractions, job states, and the
//! extraction dedup cache. All writes are transactional where they span
//! rows; chat turns persist atomically.

// SQLite stores all integers as i64. These casts are intentional and safe
// because we only store non-negative values that fit in usize.
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_wrap)]

use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use std::path::{Path, PathBuf};

use crate::core::{
    ChatMessage, ChatSession, Collection, ConversationSummary, DocChunk, Document, DocumentStatus,
    ExtractionRecord, ExtractionStatus, JobParent, JobState, WorkflowRun, WorkflowTemplate,
    current_timestamp,
};
use crate::error::{Result, StorageError};
use crate::storage::schema::{
    CHECK_SCHEMA_SQL, CURRENT_SCHEMA_VERSION, GET_VERSION_SQL, SCHEMA_SQL, SET_VERSION_SQL,
};

/// A chunk with its storage rowid.
///
/// The rowid is the global key used by retrieval (fusion, re-ranking,
/// expansion); the structured `chunk_id` is unique per document.
#[derive(Debug, Clone)]
pub struct ChunkRow {
    /// Storage rowid (global key).
    pub rowid: i64,
    /// The chunk record.
    pub chunk: DocChunk,
}

/// Scope filter applied to chunk queries.
#[derive(Debug, Clone, Default)]
pub struct ChunkFilter {
    /// Restrict to documents in this collection.
    pub collection_id: Option<String>,
    /// Restrict to these document ids (takes precedence over collection).
    pub document_ids: Option<Vec<String>>,
}

impl ChunkFilter {
    /// Filter scoped to a list of documents.
    #[must_use]
    pub fn documents(ids: &[String]) -> Self {
        Self {
            collection_id: None,
            document_ids: Some(ids.to_vec()),
        }
    }

    /// Filter scoped to a single document.
    #[must_use]
    pub fn document(id: &str) -> Self {
        Self {
            collection_id: None,
            document_ids: Some(vec![id.to_string()]),
        }
    }
}

/// Store statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct StoreStats {
    /// Number of documents.
    pub document_count: usize,
    /// Number of chunks across all documents.
    pub chunk_count: usize,
    /// Number of chunks with embeddings.
    pub embedding_count: usize,
    /// Number of chat sessions.
    pub session_count: usize,
    /// Number of workflow runs.
    pub run_count: usize,
    /// Schema version.
    pub schema_version: u32,
    /// Database file size in bytes (if file-backed).
    pub db_size: Option<u64>,
}

/// SQLite-backed store for the full data model.
pub struct SqliteStore {
    /// `SQLite` connection.
    conn: Connection,
    /// Path to the database file (None for in-memory).
    path: Option<PathBuf>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").field("path", &self.path).finish()
    }
}

impl SqliteStore {
    /// Opens or creates a `SQLite` database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Database(e.to_string()))?;
        }

        let conn = Connection::open(&path).map_err(StorageError::from)?;

        conn.execute("PRAGMA foreign_keys = ON;", [])
            .map_err(StorageError::from)?;

        // WAL mode for concurrent readers alongside the single writer
        let _: String = conn
            .query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))
            .map_err(StorageError::from)?;

        Ok(Self {
            conn,
            path: Some(path),
        })
    }

    /// Creates an in-memory `SQLite` database. Useful for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be created.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(StorageError::from)?;
        conn.execute("PRAGMA foreign_keys = ON;", [])
            .map_err(StorageError::from)?;

        Ok(Self { conn, path: None })
    }

    /// Returns the database path (None for in-memory).
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Initializes storage (creates schema, runs migrations). Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if schema creation or migration fails.
    pub fn init(&mut self) -> Result<()> {
        let is_init: i64 = self
            .conn
            .query_row(CHECK_SCHEMA_SQL, [], |row| row.get(0))
            .map_err(StorageError::from)?;

        if is_init == 0 {
            self.conn
                .execute_batch(SCHEMA_SQL)
                .map_err(StorageError::from)?;
            self.set_schema_version(CURRENT_SCHEMA_VERSION)?;
        } else if let Some(current) = self.get_schema_version()?
            && current < CURRENT_SCHEMA_VERSION
        {
            for migration in crate::storage::schema::get_migrations_from(current) {
                self.conn
                    .execute_batch(migration.sql)
                    .map_err(|e| StorageError::Migration(e.to_string()))?;
            }
            self.set_schema_version(CURRENT_SCHEMA_VERSION)?;
        }

        Ok(())
    }

    /// Resets all stored state. Deletes all data but preserves the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if deletion fails.
    pub fn reset(&mut self) -> Result<()> {
        self.conn
            .execute_batch(
                r"
            DELETE FROM chunk_embeddings;
            DELETE FROM document_chunks;
            DELETE FROM chat_messages;
            DELETE FROM session_documents;
            DELETE FROM chat_sessions;
            DELETE FROM collection_documents;
            DELETE FROM collections;
            DELETE FROM job_states;
            DELETE FROM workflow_runs;
            DELETE FROM workflows;
            DELETE FROM extractions;
            DELETE FROM template_fill_runs;
            DELETE FROM excel_templates;
            DELETE FROM cache_entries;
            DELETE FROM documents;
        ",
            )
            .map_err(StorageError::from)?;
        Ok(())
    }

    /// Checks if storage is initialized.
    ///
    /// # Errors
    ///
    /// Returns an error if the check cannot be performed.
    pub fn is_initialized(&self) -> Result<bool> {
        let count: i64 = self
            .conn
            .query_row(CHECK_SCHEMA_SQL, [], |row| row.get(0))
            .map_err(StorageError::from)?;
        Ok(count > 0)
    }

    fn get_schema_version(&self) -> Result<Option<u32>> {
        let version: Option<String> = self
            .conn
            .query_row(GET_VERSION_SQL, [], |row| row.get(0))
            .optional()
            .map_err(StorageError::from)?;
        Ok(version.and_then(|v| v.parse().ok()))
    }

    fn set_schema_version(&self, version: u32) -> Result<()> {
        self.conn
            .execute(SET_VERSION_SQL, params![version.to_string()])
            .map_err(StorageError::from)?;
        Ok(())
    }

    /// Resolves a [`ChunkFilter`] to an optional document-id list.
    fn resolve_filter(&self, filter: &ChunkFilter) -> Result<Option<Vec<String>>> {
        if let Some(ref ids) = filter.document_ids {
            return Ok(Some(ids.clone()));
        }
        if let Some(ref collection_id) = filter.collection_id {
            return Ok(Some(self.collection_documents(collection_id)?));
        }
        Ok(None)
    }

    fn placeholders(n: usize) -> String {
        std::iter::repeat_n("?", n).collect::<Vec<_>>().join(", ")
    }
}

// ==================== Document Operations ====================

impl SqliteStore {
    /// Inserts a document.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::DuplicateDocument`] when the org already has
    /// a document with the same content hash.
    pub fn insert_document(&mut self, doc: &Document) -> Result<()> {
        let artifact = doc
            .parse_artifact
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(StorageError::from)?;

        let result = self.conn.execute(
            r"
            INSERT INTO documents (
                id, user_id, org_id, filename, content_hash, byte_size,
                page_count, status, parser, parse_artifact, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
            params![
                doc.id,
                doc.user_id,
                doc.org_id,
                doc.filename,
                doc.content_hash,
                doc.byte_size as i64,
                doc.page_count.map(i64::from),
                doc.status.as_str(),
                doc.parser,
                artifact,
                doc.created_at,
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StorageError::DuplicateDocument {
                    hash: doc.content_hash.clone(),
                }
                .into())
            }
            Err(e) => Err(StorageError::from(e).into()),
        }
    }

    /// Retrieves a document by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_document(&self, id: &str) -> Result<Option<Document>> {
        self.conn
            .query_row(
                "SELECT id, user_id, org_id, filename, content_hash, byte_size,
                        page_count, status, parser, parse_artifact, created_at
                 FROM documents WHERE id = ?",
                params![id],
                Self::map_document,
            )
            .optional()
            .map_err(|e| StorageError::from(e).into())
    }

    /// Finds a document by org and content hash (dedup lookup).
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn find_document_by_hash(&self, org_id: &str, hash: &str) -> Result<Option<Document>> {
        self.conn
            .query_row(
                "SELECT id, user_id, org_id, filename, content_hash, byte_size,
                        page_count, status, parser, parse_artifact, created_at
                 FROM documents WHERE org_id = ? AND content_hash = ?",
                params![org_id, hash],
                Self::map_document,
            )
            .optional()
            .map_err(|e| StorageError::from(e).into())
    }

    /// Updates a document record.
    ///
    /// # Errors
    ///
    /// Returns an error if the document does not exist or the write fails.
    pub fn update_document(&mut self, doc: &Document) -> Result<()> {
        let artifact = doc
            .parse_artifact
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(StorageError::from)?;

        let updated = self.conn.execute(
            r"
            UPDATE documents
            SET filename = ?, page_count = ?, status = ?, parser = ?, parse_artifact = ?
            WHERE id = ?
            ",
            params![
                doc.filename,
                doc.page_count.map(i64::from),
                doc.status.as_str(),
                doc.parser,
                artifact,
                doc.id,
            ],
        )?;
        if updated == 0 {
            return Err(StorageError::DocumentNotFound { id: doc.id.clone() }.into());
        }
        Ok(())
    }

    /// Lists documents for an org, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn list_documents(&self, org_id: &str) -> Result<Vec<Document>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, user_id, org_id, filename, content_hash, byte_size,
                    page_count, status, parser, parse_artifact, created_at
             FROM documents WHERE org_id = ? ORDER BY created_at DESC",
        )?;
        let docs = stmt
            .query_map(params![org_id], Self::map_document)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StorageError::from)?;
        Ok(docs)
    }

    /// Deletes a document. Chunks cascade via foreign key.
    ///
    /// # Errors
    ///
    /// Returns an error if deletion fails.
    pub fn delete_document(&mut self, id: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM documents WHERE id = ?", params![id])?;
        Ok(())
    }

    fn map_document(row: &rusqlite::Row<'_>) -> rusqlite::Result<Document> {
        let status: String = row.get(7)?;
        let artifact: Option<String> = row.get(9)?;
        Ok(Document {
            id: row.get(0)?,
            user_id: row.get(1)?,
            org_id: row.get(2)?,
            filename: row.get(3)?,
            content_hash: row.get(4)?,
            byte_size: row.get::<_, i64>(5)? as u64,
            page_count: row.get::<_, Option<i64>>(6)?.map(|p| p as u32),
            status: DocumentStatus::parse(&status).unwrap_or(DocumentStatus::Failed),
            parser: row.get(8)?,
            parse_artifact: artifact.and_then(|a| serde_json::from_str(&a).ok()),
            created_at: row.get(10)?,
        })
    }
}

// ==================== Chunk Operations ====================

impl SqliteStore {
    /// Adds chunks for a document in one transaction. Returns rowids in
    /// input order.
    ///
    /// # Errors
    ///
    /// Returns an error if insertion fails (including duplicate chunk ids
    /// within a document).
    pub fn add_chunks(&mut self, chunks: &[DocChunk]) -> Result<Vec<i64>> {
        let tx = self.conn.transaction().map_err(StorageError::from)?;
        let now = current_timestamp();
        let mut rowids = Vec::with_capacity(chunks.len());

        {
            let mut stmt = tx
                .prepare(
                    r"
                    INSERT INTO document_chunks (
                        chunk_id, document_id, chunk_index, kind, section_id,
                        page_number, text, data, created_at
                    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                    ",
                )
                .map_err(StorageError::from)?;

            for chunk in chunks {
                let data = serde_json::to_string(chunk).map_err(StorageError::from)?;
                let kind = serde_json::to_value(chunk.kind)
                    .map_err(StorageError::from)?
                    .as_str()
                    .unwrap_or("narrative")
                    .to_string();
                stmt.execute(params![
                    chunk.chunk_id,
                    chunk.document_id,
                    chunk.chunk_index as i64,
                    kind,
                    chunk.section_id,
                    i64::from(chunk.page_number),
                    chunk.text,
                    data,
                    now,
                ])
                .map_err(StorageError::from)?;
                rowids.push(tx.last_insert_rowid());
            }
        }

        tx.commit().map_err(StorageError::from)?;
        Ok(rowids)
    }

    /// Retrieves a chunk by storage rowid.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_chunk_row(&self, rowid: i64) -> Result<Option<ChunkRow>> {
        self.conn
            .query_row(
                "SELECT id, data FROM document_chunks WHERE id = ?",
                params![rowid],
                Self::map_chunk_row,
            )
            .optional()
            .map_err(|e| StorageError::from(e).into())
    }

    /// Retrieves a chunk by document and structured chunk id.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_chunk(&self, document_id: &str, chunk_id: &str) -> Result<Option<ChunkRow>> {
        self.conn
            .query_row(
                "SELECT id, data FROM document_chunks WHERE document_id = ? AND chunk_id = ?",
                params![document_id, chunk_id],
                Self::map_chunk_row,
            )
            .optional()
            .map_err(|e| StorageError::from(e).into())
    }

    /// Retrieves all chunks for a document in chunk-index order.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn chunks_for_document(&self, document_id: &str) -> Result<Vec<ChunkRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, data FROM document_chunks WHERE document_id = ? ORDER BY chunk_index",
        )?;
        let rows = stmt
            .query_map(params![document_id], Self::map_chunk_row)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StorageError::from)?;
        Ok(rows)
    }

    /// Counts chunks for a document.
    ///
    /// # Errors
    ///
    /// Returns an error if the count query fails.
    pub fn chunk_count(&self, document_id: &str) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM document_chunks WHERE document_id = ?",
            params![document_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn map_chunk_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChunkRow> {
        let rowid: i64 = row.get(0)?;
        let data: String = row.get(1)?;
        let chunk: DocChunk = serde_json::from_str(&data).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
        })?;
        Ok(ChunkRow { rowid, chunk })
    }
}

// ==================== Embedding & Search Operations ====================

impl SqliteStore {
    /// Stores embeddings for multiple chunks in a batch.
    ///
    /// # Errors
    ///
    /// Returns an error if any embedding cannot be stored.
    pub fn store_embeddings_batch(
        &mut self,
        embeddings: &[(i64, Vec<f32>)],
        model_name: Option<&str>,
    ) -> Result<()> {
        let tx = self.conn.transaction().map_err(StorageError::from)?;
        let now = current_timestamp();

        {
            let mut stmt = tx
                .prepare(
                    r"
                    INSERT OR REPLACE INTO chunk_embeddings (chunk_rowid, embedding, dimensions, model_name, created_at)
                    VALUES (?, ?, ?, ?, ?)
                    ",
                )
                .map_err(StorageError::from)?;

            for (rowid, embedding) in embeddings {
                let bytes: Vec<u8> = embedding.iter().flat_map(|f| f.to_le_bytes()).collect();
                stmt.execute(params![rowid, bytes, embedding.len() as i64, model_name, now])
                    .map_err(StorageError::from)?;
            }
        }

        tx.commit().map_err(StorageError::from)?;
        Ok(())
    }

    /// Checks if a chunk has an embedding.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn has_embedding(&self, rowid: i64) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM chunk_embeddings WHERE chunk_rowid = ?",
            params![rowid],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Returns chunk embeddings under the given scope filter.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn embeddings_for_filter(&self, filter: &ChunkFilter) -> Result<Vec<(i64, Vec<f32>)>> {
        let doc_ids = self.resolve_filter(filter)?;

        let (sql, param_values): (String, Vec<String>) = match doc_ids {
            Some(ids) => {
                if ids.is_empty() {
                    return Ok(Vec::new());
                }
                (
                    format!(
                        "SELECT e.chunk_rowid, e.embedding
                         FROM chunk_embeddings e
                         JOIN document_chunks c ON c.id = e.chunk_rowid
                         WHERE c.document_id IN ({})",
                        Self::placeholders(ids.len())
                    ),
                    ids,
                )
            }
            None => (
                "SELECT chunk_rowid, embedding FROM chunk_embeddings".to_string(),
                Vec::new(),
            ),
        };

        let mut stmt = self.conn.prepare(&sql)?;
        let results = stmt
            .query_map(params_from_iter(param_values.iter()), |row| {
                let rowid: i64 = row.get(0)?;
                let bytes: Vec<u8> = row.get(1)?;
                let embedding: Vec<f32> = bytes
                    .chunks_exact(4)
                    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                    .collect();
                Ok((rowid, embedding))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StorageError::from)?;

        Ok(results)
    }

    /// Performs FTS5 BM25 full-text search under the given scope filter.
    ///
    /// Returns chunk rowids and scores (higher is better).
    ///
    /// # Errors
    ///
    /// Returns an error if the search fails.
    pub fn search_fts(
        &self,
        query: &str,
        filter: &ChunkFilter,
        limit: usize,
    ) -> Result<Vec<(i64, f64)>> {
        // Convert space-separated terms to an OR query. Each term is quoted
        // so FTS5 special characters (?, *, ^) are treated as literals.
        let fts_query = query
            .split_whitespace()
            .map(|term| format!("\"{}\"", term.replace('"', "\"\"")))
            .collect::<Vec<_>>()
            .join(" OR ");

        if fts_query.is_empty() {
            return Ok(Vec::new());
        }

        let doc_ids = self.resolve_filter(filter)?;
        let mut param_values: Vec<String> = vec![fts_query];

        // bm25() returns negative scores, more negative = better; negate so
        // higher = better.
        let mut sql = String::from(
            "SELECT f.rowid, -bm25(f) AS score
             FROM chunks_fts f
             JOIN document_chunks c ON c.id = f.rowid
             WHERE f MATCH ?",
        );
        if let Some(ids) = doc_ids {
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            sql.push_str(&format!(
                " AND c.document_id IN ({})",
                Self::placeholders(ids.len())
            ));
            param_values.extend(ids);
        }
        sql.push_str(" ORDER BY score DESC LIMIT ?");
        param_values.push(limit.to_string());

        let mut stmt = self.conn.prepare(&sql)?;
        let results = stmt
            .query_map(params_from_iter(param_values.iter()), |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StorageError::from)?;

        Ok(results)
    }
}

// ==================== Collection Operations ====================

impl SqliteStore {
    /// Inserts a collection.
    ///
    /// # Errors
    ///
    /// Returns an error if insertion fails.
    pub fn insert_collection(&mut self, collection: &Collection) -> Result<()> {
        self.conn.execute(
            "INSERT INTO collections (id, name, user_id, org_id, created_at) VALUES (?, ?, ?, ?, ?)",
            params![
                collection.id,
                collection.name,
                collection.user_id,
                collection.org_id,
                collection.created_at
            ],
        )?;
        Ok(())
    }

    /// Adds a document to a collection (idempotent).
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn add_document_to_collection(&mut self, collection_id: &str, document_id: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO collection_documents (collection_id, document_id) VALUES (?, ?)",
            params![collection_id, document_id],
        )?;
        Ok(())
    }

    /// Lists document ids in a collection.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn collection_documents(&self, collection_id: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT document_id FROM collection_documents WHERE collection_id = ?")?;
        let ids = stmt
            .query_map(params![collection_id], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StorageError::from)?;
        Ok(ids)
    }
}

// ==================== Session & Message Operations ====================

impl SqliteStore {
    /// Inserts a chat session.
    ///
    /// # Errors
    ///
    /// Returns an error if insertion fails.
    pub fn insert_session(&mut self, session: &ChatSession) -> Result<()> {
        let tx = self.conn.transaction().map_err(StorageError::from)?;
        tx.execute(
            "INSERT INTO chat_sessions (id, user_id, org_id, collection_id, message_count, summary, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                session.id,
                session.user_id,
                session.org_id,
                session.collection_id,
                session.message_count as i64,
                session
                    .summary
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()
                    .map_err(StorageError::from)?,
                session.created_at
            ],
        )
        .map_err(StorageError::from)?;
        for (position, doc_id) in session.document_ids.iter().enumerate() {
            tx.execute(
                "INSERT INTO session_documents (session_id, document_id, position) VALUES (?, ?, ?)",
                params![session.id, doc_id, position as i64],
            )
            .map_err(StorageError::from)?;
        }
        tx.commit().map_err(StorageError::from)?;
        Ok(())
    }

    /// Retrieves a session with its document list.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_session(&self, id: &str) -> Result<Option<ChatSession>> {
        let session = self
            .conn
            .query_row(
                "SELECT id, user_id, org_id, collection_id, message_count, summary, created_at
                 FROM chat_sessions WHERE id = ?",
                params![id],
                |row| {
                    let summary: Option<String> = row.get(5)?;
                    Ok(ChatSession {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        org_id: row.get(2)?,
                        collection_id: row.get(3)?,
                        document_ids: Vec::new(),
                        message_count: row.get::<_, i64>(4)? as usize,
                        summary: summary.and_then(|s| serde_json::from_str(&s).ok()),
                        created_at: row.get(6)?,
                    })
                },
            )
            .optional()
            .map_err(StorageError::from)?;

        let Some(mut session) = session else {
            return Ok(None);
        };

        let mut stmt = self.conn.prepare(
            "SELECT document_id FROM session_documents WHERE session_id = ? ORDER BY position",
        )?;
        session.document_ids = stmt
            .query_map(params![id], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StorageError::from)?;

        Ok(Some(session))
    }

    /// Attaches a document to a session.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn add_session_document(&mut self, session_id: &str, document_id: &str) -> Result<()> {
        let position: i64 = self.conn.query_row(
            "SELECT COALESCE(MAX(position) + 1, 0) FROM session_documents WHERE session_id = ?",
            params![session_id],
            |row| row.get(0),
        )?;
        self.conn.execute(
            "INSERT OR IGNORE INTO session_documents (session_id, document_id, position) VALUES (?, ?, ?)",
            params![session_id, document_id, position],
        )?;
        Ok(())
    }

    /// Updates the cached conversation summary (last-writer-wins).
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn update_session_summary(
        &mut self,
        session_id: &str,
        summary: &ConversationSummary,
    ) -> Result<()> {
        let json = serde_json::to_string(summary).map_err(StorageError::from)?;
        let updated = self.conn.execute(
            "UPDATE chat_sessions SET summary = ? WHERE id = ?",
            params![json, session_id],
        )?;
        if updated == 0 {
            return Err(StorageError::SessionNotFound {
                id: session_id.to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Appends a user/assistant message pair in a single transaction and
    /// bumps the session message count.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is missing or the write fails.
    pub fn append_chat_turn(
        &mut self,
        user_message: &ChatMessage,
        assistant_message: &ChatMessage,
    ) -> Result<()> {
        let session_id = user_message.session_id.clone();
        let tx = self.conn.transaction().map_err(StorageError::from)?;

        let base_seq: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(seq) + 1, 0) FROM chat_messages WHERE session_id = ?",
                params![session_id],
                |row| row.get(0),
            )
            .map_err(StorageError::from)?;

        for (offset, message) in [user_message, assistant_message].into_iter().enumerate() {
            let data = serde_json::to_string(message).map_err(StorageError::from)?;
            tx.execute(
                "INSERT INTO chat_messages (id, session_id, seq, role, content, data, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
                params![
                    message.id,
                    session_id,
                    base_seq + offset as i64,
                    message.role.as_str(),
                    message.content,
                    data,
                    message.created_at
                ],
            )
            .map_err(StorageError::from)?;
        }

        let updated = tx
            .execute(
                "UPDATE chat_sessions SET message_count = message_count + 2 WHERE id = ?",
                params![session_id],
            )
            .map_err(StorageError::from)?;
        if updated == 0 {
            return Err(StorageError::SessionNotFound { id: session_id }.into());
        }

        tx.commit().map_err(StorageError::from)?;
        Ok(())
    }

    /// Retrieves a session's messages in order.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_messages(&self, session_id: &str) -> Result<Vec<ChatMessage>> {
        let mut stmt = self
            .conn
            .prepare("SELECT data FROM chat_messages WHERE session_id = ? ORDER BY seq")?;
        let messages = stmt
            .query_map(params![session_id], |row| {
                let data: String = row.get(0)?;
                serde_json::from_str(&data).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        0,
                        rusqlite::types::Type::Text,
                        Box::new(e),
                    )
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StorageError::from)?;
        Ok(messages)
    }
}

// ==================== Workflow Template & Run Operations ====================

impl SqliteStore {
    /// Inserts a workflow template version.
    ///
    /// # Errors
    ///
    /// Returns an error if insertion fails.
    pub fn insert_template(&mut self, template: &WorkflowTemplate) -> Result<()> {
        let data = serde_json::to_string(template).map_err(StorageError::from)?;
        self.conn.execute(
            "INSERT INTO workflows (id, name, domain, version, active, data, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                template.id,
                template.name,
                template.domain,
                i64::from(template.version),
                i64::from(template.active),
                data,
                current_timestamp()
            ],
        )?;
        Ok(())
    }

    /// Retrieves a template by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_template(&self, id: &str) -> Result<Option<WorkflowTemplate>> {
        self.conn
            .query_row(
                "SELECT data FROM workflows WHERE id = ?",
                params![id],
                Self::map_json_column,
            )
            .optional()
            .map_err(|e| StorageError::from(e).into())
    }

    /// Finds the latest active version of a template by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn find_template_by_name(&self, name: &str) -> Result<Option<WorkflowTemplate>> {
        self.conn
            .query_row(
                "SELECT data FROM workflows WHERE name = ? AND active = 1
                 ORDER BY version DESC LIMIT 1",
                params![name],
                Self::map_json_column,
            )
            .optional()
            .map_err(|e| StorageError::from(e).into())
    }

    /// Inserts a workflow run.
    ///
    /// # Errors
    ///
    /// Returns an error if insertion fails.
    pub fn insert_run(&mut self, run: &WorkflowRun) -> Result<()> {
        let data = serde_json::to_string(run).map_err(StorageError::from)?;
        self.conn.execute(
            "INSERT INTO workflow_runs (id, workflow_id, status, data, created_at)
             VALUES (?, ?, ?, ?, ?)",
            params![run.id, run.workflow_id, run.status.as_str(), data, run.created_at],
        )?;
        Ok(())
    }

    /// Retrieves a workflow run.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_run(&self, id: &str) -> Result<Option<WorkflowRun>> {
        self.conn
            .query_row(
                "SELECT data FROM workflow_runs WHERE id = ?",
                params![id],
                Self::map_json_column,
            )
            .optional()
            .map_err(|e| StorageError::from(e).into())
    }

    /// Rewrites a workflow run record.
    ///
    /// # Errors
    ///
    /// Returns an error if the run does not exist or the write fails.
    pub fn update_run(&mut self, run: &WorkflowRun) -> Result<()> {
        let data = serde_json::to_string(run).map_err(StorageError::from)?;
        let updated = self.conn.execute(
            "UPDATE workflow_runs SET status = ?, data = ? WHERE id = ?",
            params![run.status.as_str(), data, run.id],
        )?;
        if updated == 0 {
            return Err(StorageError::RunNotFound { id: run.id.clone() }.into());
        }
        Ok(())
    }

    fn map_json_column<T: serde::de::DeserializeOwned>(
        row: &rusqlite::Row<'_>,
    ) -> rusqlite::Result<T> {
        let data: String = row.get(0)?;
        serde_json::from_str(&data).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
    }
}

// ==================== Extraction Operations ====================

impl SqliteStore {
    /// Inserts an extraction record.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::ExtractionInFlight`] when the user already
    /// has a non-terminal extraction.
    pub fn insert_extraction(&mut self, record: &ExtractionRecord) -> Result<()> {
        if self.active_extraction_count(&record.user_id)? > 0 {
            return Err(StorageError::ExtractionInFlight {
                user_id: record.user_id.clone(),
            }
            .into());
        }
        let data = serde_json::to_string(record).map_err(StorageError::from)?;
        self.conn.execute(
            "INSERT INTO extractions (id, document_id, user_id, org_id, content_hash, status, data, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                record.id,
                record.document_id,
                record.user_id,
                record.org_id,
                record.content_hash,
                record.status.as_str(),
                data,
                record.created_at
            ],
        )?;
        Ok(())
    }

    /// Retrieves an extraction record.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_extraction(&self, id: &str) -> Result<Option<ExtractionRecord>> {
        self.conn
            .query_row(
                "SELECT data FROM extractions WHERE id = ?",
                params![id],
                Self::map_json_column,
            )
            .optional()
            .map_err(|e| StorageError::from(e).into())
    }

    /// Rewrites an extraction record.
    ///
    /// # Errors
    ///
    /// Returns an error if the record does not exist or the write fails.
    pub fn update_extraction(&mut self, record: &ExtractionRecord) -> Result<()> {
        let data = serde_json::to_string(record).map_err(StorageError::from)?;
        let updated = self.conn.execute(
            "UPDATE extractions SET status = ?, data = ? WHERE id = ?",
            params![record.status.as_str(), data, record.id],
        )?;
        if updated == 0 {
            return Err(StorageError::ExtractionNotFound {
                id: record.id.clone(),
            }
            .into());
        }
        Ok(())
    }

    /// Counts a user's active (non-terminal) extractions.
    ///
    /// # Errors
    ///
    /// Returns an error if the count query fails.
    pub fn active_extraction_count(&self, user_id: &str) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM extractions WHERE user_id = ? AND status IN ('pending', 'processing')",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Finds a completed extraction for a content hash (history lookup).
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn find_completed_extraction_by_hash(
        &self,
        content_hash: &str,
    ) -> Result<Option<ExtractionRecord>> {
        self.conn
            .query_row(
                "SELECT data FROM extractions WHERE content_hash = ? AND status = 'completed'
                 ORDER BY created_at DESC LIMIT 1",
                params![content_hash],
                Self::map_json_column,
            )
            .optional()
            .map_err(|e| StorageError::from(e).into())
    }
}

// ==================== Job State Operations ====================

impl SqliteStore {
    /// Inserts a job state. The parent exclusivity constraint is enforced
    /// by a CHECK in the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if insertion fails.
    pub fn insert_job(&mut self, job: &JobState) -> Result<()> {
        let data = serde_json::to_string(job).map_err(StorageError::from)?;
        let (extraction_id, document_id, run_id, fill_id) = Self::parent_columns(&job.parent);
        self.conn.execute(
            "INSERT INTO job_states (id, extraction_id, document_id, workflow_run_id,
                                     template_fill_run_id, status, data, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                job.id,
                extraction_id,
                document_id,
                run_id,
                fill_id,
                job.status.as_str(),
                data,
                job.created_at,
                job.updated_at
            ],
        )?;
        Ok(())
    }

    /// Retrieves a job state by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_job(&self, id: &str) -> Result<Option<JobState>> {
        self.conn
            .query_row(
                "SELECT data FROM job_states WHERE id = ?",
                params![id],
                Self::map_json_column,
            )
            .optional()
            .map_err(|e| StorageError::from(e).into())
    }

    /// Retrieves the job state for a parent entity.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_job_for_parent(&self, parent: &JobParent) -> Result<Option<JobState>> {
        let (column, id) = match parent {
            JobParent::Extraction(id) => ("extraction_id", id),
            JobParent::Document(id) => ("document_id", id),
            JobParent::WorkflowRun(id) => ("workflow_run_id", id),
            JobParent::TemplateFillRun(id) => ("template_fill_run_id", id),
        };
        let sql = format!("SELECT data FROM job_states WHERE {column} = ? ORDER BY created_at DESC LIMIT 1");
        self.conn
            .query_row(&sql, params![id], Self::map_json_column)
            .optional()
            .map_err(|e| StorageError::from(e).into())
    }

    /// Rewrites a job state.
    ///
    /// # Errors
    ///
    /// Returns an error if the job does not exist or the write fails.
    pub fn update_job(&mut self, job: &JobState) -> Result<()> {
        let data = serde_json::to_string(job).map_err(StorageError::from)?;
        let updated = self.conn.execute(
            "UPDATE job_states SET status = ?, data = ?, updated_at = ? WHERE id = ?",
            params![job.status.as_str(), data, job.updated_at, job.id],
        )?;
        if updated == 0 {
            return Err(StorageError::JobNotFound { id: job.id.clone() }.into());
        }
        Ok(())
    }

    fn parent_columns(
        parent: &JobParent,
    ) -> (Option<&str>, Option<&str>, Option<&str>, Option<&str>) {
        match parent {
            JobParent::Extraction(id) => (Some(id.as_str()), None, None, None),
            JobParent::Document(id) => (None, Some(id.as_str()), None, None),
            JobParent::WorkflowRun(id) => (None, None, Some(id.as_str()), None),
            JobParent::TemplateFillRun(id) => (None, None, None, Some(id.as_str())),
        }
    }
}

// ==================== Cache & Stats ====================

impl SqliteStore {
    /// Writes an entry to the dedup cache.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn cache_put(&mut self, key: &str, value: &serde_json::Value) -> Result<()> {
        let json = serde_json::to_string(value).map_err(StorageError::from)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO cache_entries (key, value, created_at) VALUES (?, ?, ?)",
            params![key, json, current_timestamp()],
        )?;
        Ok(())
    }

    /// Reads an entry from the dedup cache.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub fn cache_get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        self.conn
            .query_row(
                "SELECT value FROM cache_entries WHERE key = ?",
                params![key],
                Self::map_json_column,
            )
            .optional()
            .map_err(|e| StorageError::from(e).into())
    }

    /// Gathers store statistics.
    ///
    /// # Errors
    ///
    /// Returns an error if any count query fails.
    pub fn stats(&self) -> Result<StoreStats> {
        let count = |sql: &str| -> Result<usize> {
            let n: i64 = self.conn.query_row(sql, [], |row| row.get(0))?;
            Ok(n as usize)
        };

        Ok(StoreStats {
            document_count: count("SELECT COUNT(*) FROM documents")?,
            chunk_count: count("SELECT COUNT(*) FROM document_chunks")?,
            embedding_count: count("SELECT COUNT(*) FROM chunk_embeddings")?,
            session_count: count("SELECT COUNT(*) FROM chat_sessions")?,
            run_count: count("SELECT COUNT(*) FROM workflow_runs")?,
            schema_version: self.get_schema_version()?.unwrap_or(0),
            db_size: self
                .path
                .as_ref()
                .and_then(|p| std::fs::metadata(p).ok().map(|m| m.len())),
        })
    }
}
