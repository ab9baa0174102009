//! SQLite-backed document store with a synchronized lexical index.
//!
//! The `documents` table is the authoritative copy of all knowledge entries.
//! An external-content FTS5 table (`documents_fts`) over
//! `(content, entities, problem_class)` is kept in sync by triggers, so any
//! external writer using the same schema keeps the lexical index consistent
//! within its own transaction. WAL journaling allows concurrent readers
//! alongside a writer across processes.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use serde::Serialize;

use crate::error::Result;

/// One durable knowledge entry.
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub id: i64,
    pub content: String,
    pub entities: Vec<String>,
    pub problem_class: String,
    pub timestamp: NaiveDateTime,
}

/// Relational table of documents plus the trigger-maintained FTS5 index.
pub struct DocumentStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl DocumentStore {
    /// Open (or create) the store at `path` and ensure the schema exists.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let conn = Self::open_connection(path)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        })
    }

    fn open_connection(path: &Path) -> Result<Connection> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA busy_timeout=5000;",
        )?;
        Self::init_schema(&conn)?;
        Ok(conn)
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS documents (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 content TEXT,
                 entities TEXT,
                 problem_class TEXT,
                 timestamp DATETIME DEFAULT CURRENT_TIMESTAMP
             );
             CREATE VIRTUAL TABLE IF NOT EXISTS documents_fts USING fts5(
                 content, entities, problem_class,
                 content='documents', content_rowid='id'
             );
             CREATE TRIGGER IF NOT EXISTS documents_ai AFTER INSERT ON documents BEGIN
                 INSERT INTO documents_fts(rowid, content, entities, problem_class)
                 VALUES (new.id, new.content, new.entities, new.problem_class);
             END;
             CREATE TRIGGER IF NOT EXISTS documents_ad AFTER DELETE ON documents BEGIN
                 INSERT INTO documents_fts(documents_fts, rowid, content, entities, problem_class)
                 VALUES ('delete', old.id, old.content, old.entities, old.problem_class);
             END;
             CREATE TRIGGER IF NOT EXISTS documents_au AFTER UPDATE ON documents BEGIN
                 INSERT INTO documents_fts(documents_fts, rowid, content, entities, problem_class)
                 VALUES ('delete', old.id, old.content, old.entities, old.problem_class);
                 INSERT INTO documents_fts(rowid, content, entities, problem_class)
                 VALUES (new.id, new.content, new.entities, new.problem_class);
             END;",
        )?;
        Ok(())
    }

    /// Insert a document and return its assigned id.
    pub fn insert(&self, content: &str, entities: &[String], problem_class: &str) -> Result<i64> {
        let entities_json = serde_json::to_string(entities).unwrap_or_else(|_| "[]".to_string());
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO documents (content, entities, problem_class) VALUES (?1, ?2, ?3)",
            params![content, entities_json, problem_class],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Insert a batch of documents in one transaction; ids in input order.
    pub fn insert_batch(&self, items: &[(String, Vec<String>, String)]) -> Result<Vec<i64>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut ids = Vec::with_capacity(items.len());
        for (content, entities, problem_class) in items {
            let entities_json =
                serde_json::to_string(entities).unwrap_or_else(|_| "[]".to_string());
            tx.execute(
                "INSERT INTO documents (content, entities, problem_class) VALUES (?1, ?2, ?3)",
                params![content, entities_json, problem_class],
            )?;
            ids.push(tx.last_insert_rowid());
        }
        tx.commit()?;
        Ok(ids)
    }

    /// Replace all mutable fields of `id`. Returns the affected row count
    /// (0 when the document does not exist).
    pub fn update(
        &self,
        id: i64,
        content: &str,
        entities: &[String],
        problem_class: &str,
    ) -> Result<usize> {
        let entities_json = serde_json::to_string(entities).unwrap_or_else(|_| "[]".to_string());
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE documents
             SET content = ?1, entities = ?2, problem_class = ?3, timestamp = CURRENT_TIMESTAMP
             WHERE id = ?4",
            params![content, entities_json, problem_class, id],
        )?;
        Ok(changed)
    }

    /// Delete one row. Used by the facade to roll back an `add` whose vector
    /// could not be persisted.
    pub(crate) fn remove(&self, id: i64) -> Result<usize> {
        let conn = self.conn.lock();
        Ok(conn.execute("DELETE FROM documents WHERE id = ?1", params![id])?)
    }

    pub fn get(&self, id: i64) -> Result<Option<Document>> {
        let conn = self.conn.lock();
        let doc = conn
            .query_row(
                "SELECT id, content, entities, problem_class, timestamp
                 FROM documents WHERE id = ?1",
                params![id],
                Self::row_to_document,
            )
            .optional()?;
        Ok(doc)
    }

    /// All documents, newest first.
    pub fn all(&self) -> Result<Vec<Document>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, content, entities, problem_class, timestamp
             FROM documents ORDER BY id DESC",
        )?;
        let rows = stmt.query_map([], Self::row_to_document)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    pub fn count(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Fetch `(id, content)` for the given ids; the result order is
    /// unspecified (the facade re-imposes hit order).
    pub fn contents_by_ids(&self, ids: &[i64]) -> Result<Vec<(i64, String)>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; ids.len()].join(",");
        let sql =
            format!("SELECT id, content FROM documents WHERE id IN ({placeholders})");
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(ids.iter()), |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// `(id, content)` of every document, in id order (index rebuild feed).
    pub fn ids_and_contents(&self) -> Result<Vec<(i64, String)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id, content FROM documents ORDER BY id ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Rank-ordered full-text search over content, entities, and problem
    /// class. Propagates query syntax errors; the facade decides whether to
    /// swallow them.
    pub fn fts_search(&self, query: &str, limit: usize) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT content FROM documents_fts
             WHERE documents_fts MATCH ?1 ORDER BY rank LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![query, limit as i64], |row| row.get::<_, String>(0))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Close the connection, delete the database files, and reopen a fresh
    /// empty schema at the same path.
    pub fn reset(&self) -> Result<()> {
        let mut conn = self.conn.lock();
        // Swap in a throwaway handle so the on-disk files are closed before
        // removal; SQLite keeps WAL sidecars alive otherwise.
        *conn = Connection::open_in_memory()?;
        for suffix in ["", "-wal", "-shm"] {
            let target = PathBuf::from(format!("{}{}", self.path.display(), suffix));
            if target.exists() {
                fs::remove_file(&target)?;
            }
        }
        *conn = Self::open_connection(&self.path)?;
        Ok(())
    }

    fn row_to_document(row: &rusqlite::Row<'_>) -> rusqlite::Result<Document> {
        let entities_json: String = row.get(2)?;
        Ok(Document {
            id: row.get(0)?,
            content: row.get(1)?,
            entities: serde_json::from_str(&entities_json).unwrap_or_default(),
            problem_class: row.get(3)?,
            timestamp: row.get(4)?,
        })
    }
}
