//! # Loam
//!
//! A persistent memory substrate and learning loop for conversational agents.
//!
//! ## Features
//!
//! - Hybrid retrieval: flat vector search backed by SQLite FTS5 keyword search
//! - Durable task queue colocated in the same database
//! - Background reflection worker that distills interactions into knowledge
//!   entries through an external language oracle
//! - Multi-process coordination over shared files (advisory lock + mtime
//!   freshness reload)

// Core modules
mod agent;
mod config;
pub mod embedding;
mod error;
mod memory;
mod prompts;
mod queue;
mod store;
pub mod vector;
pub mod worker;

// Re-exports for the public API
pub use agent::{AgentMemory, SessionRegistry};
pub use config::{Language, MemoryConfig, Mode, StorePaths};
pub use embedding::Embedder;
pub use embedding::hashing::HashingEmbedder;
#[cfg(feature = "embeddings-model2vec")]
pub use embedding::static_model::StaticModelEmbedder;
pub use error::{LoamError, Result};
pub use memory::{Memory, NewDocument};
pub use prompts::PromptSet;
pub use queue::{Task, TaskQueue, TaskStatus};
pub use store::Document;
pub use vector::{Metric, SearchHit, VectorIndex};
pub use worker::decision::OracleDecision;
pub use worker::{Oracle, ReflectionWorker, WorkerHandle, WorkerOptions};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
