//! Store configuration and file layout.
//!
//! All knobs can come from the environment (`LOAM_*` variables) or be set
//! directly on [`MemoryConfig`]. A configuration resolves to a set of
//! [`StorePaths`]: the SQLite database, the vector index file, and the
//! advisory lock sentinel next to it.

use std::env;
use std::path::{Path, PathBuf};

use crate::error::{LoamError, Result};
use crate::vector::Metric;

/// Default base path for the shared store (`<base>.db` / `<base>.faiss`).
pub const DEFAULT_BASE_PATH: &str = "ace_memory";
/// Directory holding per-session store files.
pub const USER_DATA_DIR: &str = "user_data";
/// File-name prefix for per-session stores.
const SESSION_FILE_PREFIX: &str = "ace_memory_";

#[cfg(feature = "embeddings-model2vec")]
pub const DEFAULT_EMBEDDING_MODEL: &str = "minishlab/potion-base-32M";
#[cfg(not(feature = "embeddings-model2vec"))]
pub const DEFAULT_EMBEDDING_MODEL: &str = "hashing-512";

/// Prompt locale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    En,
    Ja,
}

impl Language {
    pub fn parse(s: &str) -> Language {
        match s.to_ascii_lowercase().as_str() {
            "ja" => Language::Ja,
            _ => Language::En,
        }
    }
}

/// Whether sessions share one store or get isolated per-session files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Shared,
    Isolated,
}

impl Mode {
    pub fn parse(s: &str) -> Mode {
        match s.to_ascii_lowercase().as_str() {
            "isolated" => Mode::Isolated,
            _ => Mode::Shared,
        }
    }
}

/// Resolved file locations of one store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePaths {
    pub db: PathBuf,
    pub index: PathBuf,
    pub lock: PathBuf,
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    PathBuf::from(format!("{}{}", path.display(), suffix))
}

/// Configuration of a memory store and its reflection pipeline.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Base path of the shared store; `.db` / `.faiss` are appended.
    pub base_path: PathBuf,
    /// When set, files live under `user_data/` keyed by this id.
    pub session_id: Option<String>,
    /// Encoder model id (see the `embedding` module).
    pub embedding_model: String,
    pub metric: Metric,
    /// Relevance cutoff for `search`; metric-dependent default.
    pub distance_threshold: f32,
    pub language: Language,
    pub mode: Mode,
    /// Apply the query/document prefix convention around the encoder.
    pub use_prefixes: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        let metric = Metric::L2;
        Self {
            base_path: PathBuf::from(DEFAULT_BASE_PATH),
            session_id: None,
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            metric,
            distance_threshold: default_threshold(metric),
            language: Language::En,
            mode: Mode::Shared,
            use_prefixes: model_wants_prefixes(DEFAULT_EMBEDDING_MODEL),
        }
    }
}

impl MemoryConfig {
    /// Read configuration from `LOAM_*` environment variables, falling back
    /// to defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let base_path = env::var("LOAM_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_BASE_PATH));
        let embedding_model =
            env::var("LOAM_EMBEDDING_MODEL").unwrap_or_else(|_| DEFAULT_EMBEDDING_MODEL.to_string());
        let metric = match env::var("LOAM_DISTANCE_METRIC") {
            Ok(raw) => Metric::parse(&raw)?,
            Err(_) => Metric::L2,
        };
        let distance_threshold = match env::var("LOAM_DISTANCE_THRESHOLD") {
            Ok(raw) => raw.parse::<f32>().map_err(|_| {
                LoamError::invalid_config(format!("bad LOAM_DISTANCE_THRESHOLD '{raw}'"))
            })?,
            Err(_) => default_threshold(metric),
        };
        let language = env::var("LOAM_LANG")
            .map(|raw| Language::parse(&raw))
            .unwrap_or(Language::En);
        let mode = env::var("LOAM_MODE")
            .map(|raw| Mode::parse(&raw))
            .unwrap_or(Mode::Shared);
        let use_prefixes = model_wants_prefixes(&embedding_model);

        Ok(Self {
            base_path,
            session_id: None,
            embedding_model,
            metric,
            distance_threshold,
            language,
            mode,
            use_prefixes,
        })
    }

    /// Derive the configuration of a per-session store.
    pub fn for_session(&self, session_id: &str) -> Self {
        let mut config = self.clone();
        config.session_id = Some(session_id.to_string());
        config
    }

    /// Resolve the backing file paths for this configuration.
    ///
    /// Without a session id the index lives at the deterministic
    /// `<base>.faiss` next to `<base>.db`. Per-session stores live in a
    /// `user_data/` directory next to the base path.
    pub fn store_paths(&self) -> StorePaths {
        let (db, index) = match &self.session_id {
            Some(session_id) => {
                let data_dir = match self.base_path.parent() {
                    Some(parent) if !parent.as_os_str().is_empty() => parent.join(USER_DATA_DIR),
                    _ => PathBuf::from(USER_DATA_DIR),
                };
                let stem = data_dir.join(format!("{SESSION_FILE_PREFIX}{session_id}"));
                (with_suffix(&stem, ".db"), with_suffix(&stem, ".faiss"))
            }
            None => (
                with_suffix(&self.base_path, ".db"),
                with_suffix(&self.base_path, ".faiss"),
            ),
        };
        let lock = with_suffix(&index, ".lock");
        StorePaths { db, index, lock }
    }
}

/// Default relevance cutoff, calibrated per metric (squared-L2 distance vs
/// inner-product similarity).
pub fn default_threshold(metric: Metric) -> f32 {
    match metric {
        Metric::L2 => 1.8,
        Metric::Cosine => 0.7,
    }
}

fn model_wants_prefixes(model_id: &str) -> bool {
    model_id.to_lowercase().contains("ruri")
}
