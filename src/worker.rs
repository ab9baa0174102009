//! Background reflection worker.
//!
//! The worker drains the task queue on a dedicated thread, analyzes each
//! interaction through the language oracle, and applies the resulting
//! decision to the memory store. It shares no in-memory state with the
//! request path: coordination happens exclusively through the queue and the
//! store files, so the worker may run in a different process from the agent.
//!
//! Error policy (per task):
//! - oracle transport errors and store failures mark the task `failed`;
//! - unparseable or empty oracle output marks the task `done` without
//!   mutation, so a poison message can never loop.

pub mod decision;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::config::Language;
use crate::error::Result;
use crate::memory::Memory;
use crate::prompts::{self, PromptSet};
use crate::queue::{Task, TaskQueue};
use crate::vector::{Metric, SearchHit};

use self::decision::{OracleDecision, parse_decision};

/// Cap (in characters) on the agent-output prefix in the locality probe.
const PROBE_OUTPUT_CAP: usize = 200;
/// Candidate documents offered to the oracle for merging.
const MAX_MERGE_CANDIDATES: usize = 3;

/// Synchronous language-oracle client. The worker treats it as a black box;
/// retries, backoff, and streaming are the implementation's concern.
pub trait Oracle: Send + Sync {
    fn invoke(&self, prompt: &str) -> Result<String>;
}

/// Tuning knobs for the worker loop.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Sleep between polls when the queue is empty.
    pub poll_interval: Duration,
    /// Sleep after an unexpected loop-level error.
    pub error_backoff: Duration,
    /// Prompt locale.
    pub language: Language,
    /// Cutoff for surfacing merge candidates; more permissive than the
    /// search threshold. Defaults per metric when unset.
    pub merge_threshold: Option<f32>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            error_backoff: Duration::from_secs(5),
            language: Language::En,
            merge_threshold: None,
        }
    }
}

fn default_merge_threshold(metric: Metric) -> f32 {
    match metric {
        Metric::L2 => 0.4,
        Metric::Cosine => 0.5,
    }
}

/// Long-lived reflection loop over a memory store and its task queue.
pub struct ReflectionWorker {
    memory: Memory,
    queue: TaskQueue,
    oracle: Arc<dyn Oracle>,
    prompts: &'static PromptSet,
    merge_threshold: f32,
    options: WorkerOptions,
}

impl ReflectionWorker {
    pub fn new(
        memory: Memory,
        queue: TaskQueue,
        oracle: Arc<dyn Oracle>,
        options: WorkerOptions,
    ) -> Self {
        let merge_threshold = options
            .merge_threshold
            .unwrap_or_else(|| default_merge_threshold(memory.metric()));
        let prompts = PromptSet::for_language(options.language);
        Self {
            memory,
            queue,
            oracle,
            prompts,
            merge_threshold,
            options,
        }
    }

    /// Claim and process at most one task. Returns whether a task was
    /// handled. This is the unit the loop repeats and the tests drive.
    pub fn process_next(&self) -> Result<bool> {
        let Some(task) = self.queue.claim_pending()? else {
            return Ok(false);
        };
        debug!("processing task {}", task.id);
        match self.process(&task) {
            Ok(()) => self.queue.mark_done(task.id)?,
            Err(err) => {
                warn!("task {} failed: {err}", task.id);
                self.queue.mark_failed(task.id, &err.to_string())?;
            }
        }
        Ok(true)
    }

    /// Unified analysis and synthesis for one interaction.
    fn process(&self, task: &Task) -> Result<()> {
        // Surface merge candidates near the raw interaction before asking
        // the oracle anything.
        let probe = build_probe(&task.user_input, &task.agent_output);
        let candidates = self.memory.find_similar(&probe, self.merge_threshold)?;
        let existing_docs = self.existing_docs_block(&candidates)?;

        let prompt = prompts::render(
            self.prompts.unified_analysis,
            &[
                ("user_input", task.user_input.as_str()),
                ("agent_output", task.agent_output.as_str()),
                ("existing_docs", existing_docs.as_str()),
            ],
        );
        let response = self.oracle.invoke(&prompt)?;

        let Some(decision) = parse_decision(&response) else {
            warn!(
                "task {}: oracle response had no usable JSON; completing without mutation",
                task.id
            );
            return Ok(());
        };

        match decision {
            OracleDecision::Discard => {
                debug!("task {}: ignored (should_store=false)", task.id);
            }
            OracleDecision::Keep => {
                debug!("task {}: knowledge kept (redundant)", task.id);
            }
            OracleDecision::Insert {
                content,
                entities,
                problem_class,
            } => {
                let structured = self.structure_as_knowledge_model(task, &content);
                let id = self.memory.add(&structured, &entities, &problem_class)?;
                info!("task {}: stored new knowledge entry {id}", task.id);
            }
            OracleDecision::Update {
                target_id,
                content,
                entities,
                problem_class,
            } => {
                let structured = self.structure_as_knowledge_model(task, &content);
                if self.memory.get_document(target_id)?.is_some() {
                    self.memory
                        .update_document(target_id, &structured, &entities, &problem_class)?;
                    info!("task {}: merged into document {target_id}", task.id);
                } else {
                    warn!(
                        "task {}: update target {target_id} does not exist; storing as new",
                        task.id
                    );
                    let id = self.memory.add(&structured, &entities, &problem_class)?;
                    info!("task {}: stored new knowledge entry {id}", task.id);
                }
            }
        }
        Ok(())
    }

    fn existing_docs_block(&self, candidates: &[SearchHit]) -> Result<String> {
        let mut blocks = Vec::new();
        for hit in candidates.iter().take(MAX_MERGE_CANDIDATES) {
            if let Some(doc) = self.memory.get_document(hit.id)? {
                blocks.push(format!("ID: {}\nContent: {}", doc.id, doc.content));
            }
        }
        if blocks.is_empty() {
            Ok("None".to_string())
        } else {
            Ok(blocks.join("\n---\n"))
        }
    }

    /// Convert the raw analysis into the structural knowledge-model form
    /// with a second oracle call, falling back to the raw analysis when the
    /// call fails or returns nothing.
    fn structure_as_knowledge_model(&self, task: &Task, raw_analysis: &str) -> String {
        let context = format!(
            "User Input: {}\n\nAgent Response: {}\n\nAnalysis:\n{}",
            task.user_input, task.agent_output, raw_analysis
        );
        let prompt = prompts::render(self.prompts.knowledge_model, &[("context", &context)]);
        match self.oracle.invoke(&prompt) {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => {
                warn!("empty structuring response; storing the raw analysis");
                raw_analysis.to_string()
            }
            Err(err) => {
                warn!("knowledge-model structuring failed ({err}); storing the raw analysis");
                raw_analysis.to_string()
            }
        }
    }

    /// Move the worker onto a dedicated thread. The returned handle stops
    /// the loop at its next iteration boundary.
    pub fn spawn(self) -> WorkerHandle {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let thread = thread::spawn(move || {
            info!("reflection worker started");
            self.run(&flag);
            info!("reflection worker stopped");
        });
        WorkerHandle {
            running,
            thread: Some(thread),
        }
    }

    fn run(&self, running: &AtomicBool) {
        while running.load(Ordering::Relaxed) {
            match self.process_next() {
                Ok(true) => {}
                Ok(false) => thread::sleep(self.options.poll_interval),
                Err(err) => {
                    error!("worker loop error: {err}");
                    thread::sleep(self.options.error_backoff);
                }
            }
        }
    }
}

/// Handle to a spawned worker thread.
pub struct WorkerHandle {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Request a stop and wait for the loop to observe it. In-flight oracle
    /// calls are not preempted.
    pub fn stop(mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

/// Locality probe: the user input plus a capped prefix of the agent output.
fn build_probe(user_input: &str, agent_output: &str) -> String {
    let prefix: String = agent_output.chars().take(PROBE_OUTPUT_CAP).collect();
    format!("{user_input}\n{prefix}")
}
