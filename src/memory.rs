//! Memory facade: hybrid retrieval over the document store and vector index.
//!
//! One `Memory` instance owns a SQLite document store and an in-memory cache
//! of the flat vector index file. Multiple processes may hold independent
//! facades over the same files:
//!
//! - every mutation of the index file happens under a filesystem advisory
//!   lock keyed on the index path, as a read-latest / modify / write-back
//!   cycle, so the persisted file is never a partial state;
//! - readers detect out-of-date in-memory state by comparing the file's
//!   mtime against a cached watermark and reload under the lock.
//!
//! The document row is authoritative; the vector file is rebuildable. On
//! startup a missing, unreadable, or inconsistent index (count mismatch
//! against the document table, changed dimension or metric) is rebuilt by
//! re-encoding every document, which restores the one-vector-per-document
//! invariant after any recoverable corruption.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use fs2::FileExt;
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};

use crate::config::{MemoryConfig, StorePaths};
use crate::embedding::{self, DOCUMENT_PREFIX, Embedder, QUERY_PREFIX};
use crate::error::{LoamError, Result};
use crate::store::{Document, DocumentStore};
use crate::vector::{Metric, SearchHit, VectorIndex, codec, l2_normalize};

/// Vector phase over-fetch factor: retrieve `3k` candidates, filter, keep `k`.
const VECTOR_OVERFETCH: usize = 3;
/// Candidate count for `find_similar` (merge-candidate lookup).
const SIMILAR_CANDIDATES: usize = 3;

/// Input to [`Memory::add_batch`].
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub content: String,
    pub entities: Vec<String>,
    pub problem_class: String,
}

/// Advisory lock on the index file, held for the duration of a
/// read-modify-write cycle (or a reload). Released on drop.
struct IndexLock {
    file: File,
}

impl IndexLock {
    fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        file.lock_exclusive()
            .map_err(|err| LoamError::lock(format!("{}: {err}", path.display())))?;
        Ok(Self { file })
    }
}

impl Drop for IndexLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// Persistent hybrid memory store.
pub struct Memory {
    paths: StorePaths,
    metric: Metric,
    distance_threshold: f32,
    use_prefixes: bool,
    embedder: Arc<dyn Embedder>,
    store: DocumentStore,
    index: RwLock<VectorIndex>,
    index_mtime: Mutex<Option<SystemTime>>,
}

impl Memory {
    /// Open the store described by `config`, using the process-wide shared
    /// encoder for its model id.
    pub fn open(config: &MemoryConfig) -> Result<Self> {
        let embedder = embedding::shared(&config.embedding_model)?;
        Self::with_embedder(config, embedder)
    }

    /// Open the store with an explicit encoder instance.
    pub fn with_embedder(config: &MemoryConfig, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let paths = config.store_paths();
        let store = DocumentStore::open(&paths.db)?;
        let memory = Self {
            metric: config.metric,
            distance_threshold: config.distance_threshold,
            use_prefixes: config.use_prefixes,
            index: RwLock::new(VectorIndex::new(config.metric, embedder.dimension())),
            index_mtime: Mutex::new(None),
            embedder,
            store,
            paths,
        };
        memory.load_or_build_index()?;
        Ok(memory)
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn distance_threshold(&self) -> f32 {
        self.distance_threshold
    }

    pub fn paths(&self) -> &StorePaths {
        &self.paths
    }

    /// Number of documents (equal to the number of vectors in any committed
    /// state).
    pub fn count(&self) -> Result<u64> {
        self.store.count()
    }

    pub fn get_document(&self, id: i64) -> Result<Option<Document>> {
        self.store.get(id)
    }

    /// All documents, newest first.
    pub fn get_all(&self) -> Result<Vec<Document>> {
        self.store.all()
    }

    /// Insert a document and its vector. The row is written first (it is
    /// authoritative); if encoding or the index write fails the row is
    /// removed again so the failure is not observable through `search`.
    pub fn add(&self, content: &str, entities: &[String], problem_class: &str) -> Result<i64> {
        let id = self.store.insert(content, entities, problem_class)?;
        let vector = match self.encode_document(content) {
            Ok(vector) => vector,
            Err(err) => {
                self.rollback_row(id);
                return Err(err);
            }
        };
        if let Err(err) = self.upsert_vectors(&[(id, vector)]) {
            self.rollback_row(id);
            return Err(err);
        }
        debug!("added document {id}");
        Ok(id)
    }

    /// Bulk insertion: one database transaction, one batch encode, one
    /// locked index write.
    pub fn add_batch(&self, items: &[NewDocument]) -> Result<Vec<i64>> {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let rows: Vec<(String, Vec<String>, String)> = items
            .iter()
            .map(|d| (d.content.clone(), d.entities.clone(), d.problem_class.clone()))
            .collect();
        let ids = self.store.insert_batch(&rows)?;

        let texts: Vec<String> = items.iter().map(|d| self.document_text(&d.content)).collect();
        let vectors = match self.embedder.embed(&texts) {
            Ok(vectors) => vectors,
            Err(err) => {
                for &id in &ids {
                    self.rollback_row(id);
                }
                return Err(err);
            }
        };

        let mut entries = Vec::with_capacity(ids.len());
        for (&id, mut vector) in ids.iter().zip(vectors) {
            if self.metric == Metric::Cosine {
                l2_normalize(&mut vector);
            }
            entries.push((id, vector));
        }
        if let Err(err) = self.upsert_vectors(&entries) {
            for &id in &ids {
                self.rollback_row(id);
            }
            return Err(err);
        }
        debug!("added {} documents in batch", ids.len());
        Ok(ids)
    }

    /// Replace all mutable fields of a document and its vector. The old and
    /// new vector are swapped inside a single lock acquisition, so the
    /// window is not observable to concurrent searchers.
    pub fn update_document(
        &self,
        id: i64,
        content: &str,
        entities: &[String],
        problem_class: &str,
    ) -> Result<()> {
        let changed = self.store.update(id, content, entities, problem_class)?;
        if changed == 0 {
            return Err(LoamError::not_found(format!("document {id}")));
        }
        let vector = self.encode_document(content)?;
        self.upsert_vectors(&[(id, vector)])?;
        debug!("updated document {id}");
        Ok(())
    }

    /// Hybrid retrieval: vector phase first, lexical top-up for the
    /// remaining slots, exact-content deduplication throughout.
    pub fn search(
        &self,
        query: &str,
        k: usize,
        distance_threshold: Option<f32>,
    ) -> Result<Vec<String>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        self.refresh_if_stale()?;
        let threshold = distance_threshold.unwrap_or(self.distance_threshold);

        let mut results: Vec<String> = Vec::new();

        let index_len = self.index.read().len();
        if index_len > 0 {
            let query_vector = self.encode_query(query)?;
            let search_k = (k * VECTOR_OVERFETCH).min(index_len);
            let hits = self.index.read().search(&query_vector, search_k)?;
            let found_ids: Vec<i64> = hits
                .into_iter()
                .filter(|hit| self.metric.within_threshold(hit.score, threshold))
                .map(|hit| hit.id)
                .take(k)
                .collect();

            if !found_ids.is_empty() {
                let by_id: HashMap<i64, String> =
                    self.store.contents_by_ids(&found_ids)?.into_iter().collect();
                for id in &found_ids {
                    if let Some(content) = by_id.get(id)
                        && !results.contains(content)
                    {
                        results.push(content.clone());
                    }
                }
            }
        }

        if results.len() < k {
            let remaining = k - results.len();
            match self.store.fts_search(query, remaining) {
                Ok(contents) => {
                    for content in contents {
                        if !results.contains(&content) {
                            results.push(content);
                        }
                    }
                }
                // Lexical query syntax errors are swallowed; the vector
                // phase result stands on its own.
                Err(err) => debug!("lexical query failed ({err}); vector results only"),
            }
        }
        Ok(results)
    }

    /// Nearest candidates with ids and scores, for the reflection worker's
    /// merge lookup. Returns at most three hits passing `threshold`.
    pub fn find_similar(&self, content: &str, threshold: f32) -> Result<Vec<SearchHit>> {
        self.refresh_if_stale()?;
        if self.index.read().is_empty() {
            return Ok(Vec::new());
        }
        let query_vector = self.encode_query(content)?;
        let hits = self.index.read().search(&query_vector, SIMILAR_CANDIDATES)?;
        Ok(hits
            .into_iter()
            .filter(|hit| self.metric.within_threshold(hit.score, threshold))
            .collect())
    }

    /// Reset the store to empty: database files removed and reopened with a
    /// fresh schema, index file replaced by an empty one.
    ///
    /// The database file is shared with the task queue, so other handles
    /// over the same store (a `TaskQueue`, another facade) must be reopened
    /// after a clear.
    pub fn clear(&self) -> Result<()> {
        let _lock = IndexLock::acquire(&self.paths.lock)?;
        self.store.reset()?;
        if self.paths.index.exists() {
            fs::remove_file(&self.paths.index)?;
        }
        self.write_index_locked(VectorIndex::new(self.metric, self.embedder.dimension()))?;
        info!("memory store cleared");
        Ok(())
    }

    // =========================================================================
    // Encoding
    // =========================================================================

    fn document_text(&self, content: &str) -> String {
        if self.use_prefixes {
            format!("{DOCUMENT_PREFIX}{content}")
        } else {
            content.to_string()
        }
    }

    fn query_text(&self, query: &str) -> String {
        if self.use_prefixes {
            format!("{QUERY_PREFIX}{query}")
        } else {
            query.to_string()
        }
    }

    fn encode_document(&self, content: &str) -> Result<Vec<f32>> {
        let mut vector = self.embedder.embed_one(&self.document_text(content))?;
        if self.metric == Metric::Cosine {
            l2_normalize(&mut vector);
        }
        Ok(vector)
    }

    fn encode_query(&self, query: &str) -> Result<Vec<f32>> {
        let mut vector = self.embedder.embed_one(&self.query_text(query))?;
        if self.metric == Metric::Cosine {
            l2_normalize(&mut vector);
        }
        Ok(vector)
    }

    // =========================================================================
    // Index file protocol
    // =========================================================================

    fn load_or_build_index(&self) -> Result<()> {
        let _lock = IndexLock::acquire(&self.paths.lock)?;
        let doc_count = self.store.count()?;

        let loaded = if self.paths.index.exists() {
            match codec::read_index(&self.paths.index) {
                Ok(index)
                    if index.metric() == self.metric
                        && index.dimension() == self.embedder.dimension()
                        && index.len() as u64 == doc_count =>
                {
                    Some(index)
                }
                Ok(index) => {
                    info!(
                        "vector index out of sync ({} vectors for {doc_count} documents); rebuilding",
                        index.len()
                    );
                    None
                }
                Err(err) => {
                    warn!("unreadable vector index ({err}); rebuilding from the document table");
                    None
                }
            }
        } else {
            None
        };

        match loaded {
            Some(index) => {
                *self.index.write() = index;
                *self.index_mtime.lock() = file_mtime(&self.paths.index);
            }
            None => {
                let index = self.rebuild_index()?;
                self.write_index_locked(index)?;
            }
        }
        Ok(())
    }

    /// Re-encode every document. Caller must hold the index lock.
    fn rebuild_index(&self) -> Result<VectorIndex> {
        let rows = self.store.ids_and_contents()?;
        let mut index = VectorIndex::new(self.metric, self.embedder.dimension());
        if rows.is_empty() {
            return Ok(index);
        }
        let texts: Vec<String> = rows
            .iter()
            .map(|(_, content)| self.document_text(content))
            .collect();
        let vectors = self.embedder.embed(&texts)?;
        for ((id, _), mut vector) in rows.into_iter().zip(vectors) {
            if self.metric == Metric::Cosine {
                l2_normalize(&mut vector);
            }
            index.add(id, &vector)?;
        }
        info!("rebuilt vector index with {} vectors", index.len());
        Ok(index)
    }

    /// Read-latest / upsert / write-back under the advisory lock.
    fn upsert_vectors(&self, entries: &[(i64, Vec<f32>)]) -> Result<()> {
        let _lock = IndexLock::acquire(&self.paths.lock)?;
        let mut index = self.latest_index_for_write()?;
        for (id, vector) in entries {
            index.remove(*id);
            index.add(*id, vector)?;
        }
        self.write_index_locked(index)
    }

    /// Freshest index image for a mutation. Caller must hold the index lock.
    fn latest_index_for_write(&self) -> Result<VectorIndex> {
        if !self.paths.index.exists() {
            return Ok(VectorIndex::new(self.metric, self.embedder.dimension()));
        }
        match codec::read_index(&self.paths.index) {
            Ok(index)
                if index.metric() == self.metric
                    && index.dimension() == self.embedder.dimension() =>
            {
                Ok(index)
            }
            Ok(_) => {
                warn!("vector index shape changed; rebuilding from the document table");
                self.rebuild_index()
            }
            Err(err) => {
                warn!("unreadable vector index ({err}); rebuilding from the document table");
                self.rebuild_index()
            }
        }
    }

    /// Persist `index` and install it as the in-memory copy. Caller must
    /// hold the index lock.
    fn write_index_locked(&self, index: VectorIndex) -> Result<()> {
        codec::write_index(&index, &self.paths.index)?;
        let mtime = file_mtime(&self.paths.index);
        *self.index.write() = index;
        *self.index_mtime.lock() = mtime;
        Ok(())
    }

    /// Reload the in-memory index when another process has advanced the
    /// file's mtime past our watermark.
    fn refresh_if_stale(&self) -> Result<()> {
        let Some(disk_mtime) = file_mtime(&self.paths.index) else {
            return Ok(());
        };
        let stale = match *self.index_mtime.lock() {
            Some(cached) => disk_mtime > cached,
            None => true,
        };
        if !stale {
            return Ok(());
        }

        let _lock = IndexLock::acquire(&self.paths.lock)?;
        match codec::read_index(&self.paths.index) {
            Ok(index) => {
                *self.index.write() = index;
                *self.index_mtime.lock() = Some(disk_mtime);
                debug!("vector index reloaded from disk");
            }
            // Keep serving the current in-memory copy; the next write path
            // will repair the file.
            Err(err) => warn!("could not reload vector index ({err}); keeping in-memory copy"),
        }
        Ok(())
    }

    fn rollback_row(&self, id: i64) {
        if let Err(err) = self.store.remove(id) {
            warn!("could not roll back document {id} after a failed index write: {err}");
        }
    }
}

fn file_mtime(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).ok().and_then(|meta| meta.modified().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::hashing::HashingEmbedder;
    use tempfile::TempDir;

    fn config_in(dir: &TempDir) -> MemoryConfig {
        MemoryConfig {
            base_path: dir.path().join("mem"),
            ..MemoryConfig::default()
        }
    }

    #[test]
    fn prefixes_are_applied_on_both_paths() {
        let dir = TempDir::new().unwrap();
        let mut config = config_in(&dir);
        config.use_prefixes = true;
        let memory =
            Memory::with_embedder(&config, Arc::new(HashingEmbedder::new(16))).unwrap();
        assert!(memory.document_text("abc").starts_with(DOCUMENT_PREFIX));
        assert!(memory.query_text("abc").starts_with(QUERY_PREFIX));

        config.use_prefixes = false;
        config.base_path = dir.path().join("mem2");
        let memory =
            Memory::with_embedder(&config, Arc::new(HashingEmbedder::new(16))).unwrap();
        assert_eq!(memory.document_text("abc"), "abc");
        assert_eq!(memory.query_text("abc"), "abc");
    }

    #[test]
    fn lock_file_is_created_next_to_index() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        let _memory =
            Memory::with_embedder(&config, Arc::new(HashingEmbedder::new(16))).unwrap();
        assert!(config.store_paths().lock.exists());
        assert!(config.store_paths().index.exists());
    }
}
