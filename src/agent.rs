//! Agent-facing surface.
//!
//! The agent graph sees exactly two operations per turn: [`AgentMemory::recall`]
//! before responding and [`AgentMemory::observe`] after. Everything else
//! (reflection, merging, index maintenance) happens behind the queue.
//!
//! [`SessionRegistry`] hands out one `AgentMemory` per session, lazily
//! constructed. In shared mode every session maps to the same store; in
//! isolated mode each session gets its own files under `user_data/`.

use std::collections::HashMap;
use std::sync::Arc;

use log::info;
use parking_lot::Mutex;

use crate::config::{MemoryConfig, Mode};
use crate::embedding::Embedder;
use crate::error::Result;
use crate::memory::Memory;
use crate::queue::TaskQueue;

/// Narrow read/write surface exposed to the agent graph.
pub struct AgentMemory {
    memory: Memory,
    queue: TaskQueue,
}

impl AgentMemory {
    /// Open the store and queue described by `config`.
    pub fn open(config: &MemoryConfig) -> Result<Self> {
        let memory = Memory::open(config)?;
        let queue = TaskQueue::open(&config.store_paths().db)?;
        Ok(Self { memory, queue })
    }

    /// Open with an explicit encoder instance.
    pub fn with_embedder(config: &MemoryConfig, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let memory = Memory::with_embedder(config, embedder)?;
        let queue = TaskQueue::open(&config.store_paths().db)?;
        Ok(Self { memory, queue })
    }

    /// Contextually relevant knowledge entries for `query`, best first.
    pub fn recall(&self, query: &str, k: usize) -> Result<Vec<String>> {
        self.memory.search(query, k, None)
    }

    /// Enqueue one interaction for background reflection.
    pub fn observe(&self, user_input: &str, agent_output: &str) -> Result<()> {
        self.queue.enqueue(user_input, agent_output)?;
        Ok(())
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }
}

/// Lazily-constructed map of per-session stores. Sessions are long-lived
/// relative to the process, so there is no removal API.
pub struct SessionRegistry {
    config: MemoryConfig,
    sessions: Mutex<HashMap<String, Arc<AgentMemory>>>,
}

impl SessionRegistry {
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// The `AgentMemory` for `session_id`, constructing it on first use.
    /// In shared mode every session resolves to the same instance.
    pub fn for_session(&self, session_id: &str) -> Result<Arc<AgentMemory>> {
        let (key, config) = match self.config.mode {
            Mode::Shared => (String::new(), self.config.clone()),
            Mode::Isolated => (
                session_id.to_string(),
                self.config.for_session(session_id),
            ),
        };

        let mut sessions = self.sessions.lock();
        if let Some(existing) = sessions.get(&key) {
            return Ok(existing.clone());
        }
        let agent = Arc::new(AgentMemory::open(&config)?);
        if self.config.mode == Mode::Isolated {
            info!("opened isolated memory store for session '{session_id}'");
        }
        sessions.insert(key, agent.clone());
        Ok(agent)
    }
}
