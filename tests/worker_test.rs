use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tempfile::TempDir;

use loam::{
    HashingEmbedder, LoamError, Memory, MemoryConfig, Oracle, ReflectionWorker, TaskQueue,
    TaskStatus, WorkerOptions,
};

/// Oracle stub that replays a fixed script of responses and records every
/// prompt it receives.
struct ScriptedOracle {
    responses: Mutex<VecDeque<Result<String, String>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedOracle {
    fn new(responses: Vec<Result<String, String>>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

impl Oracle for ScriptedOracle {
    fn invoke(&self, prompt: &str) -> loam::Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        match self.responses.lock().unwrap().pop_front() {
            Some(Ok(text)) => Ok(text),
            Some(Err(msg)) => Err(LoamError::oracle(msg)),
            None => Ok(String::new()),
        }
    }
}

struct Fixture {
    worker: ReflectionWorker,
    oracle: Arc<ScriptedOracle>,
    /// Independent facades over the same files, for assertions.
    memory: Memory,
    queue: TaskQueue,
}

fn fixture(dir: &TempDir, responses: Vec<Result<String, String>>) -> Fixture {
    let config = MemoryConfig {
        base_path: dir.path().join("reflect"),
        embedding_model: "hashing-64".to_string(),
        ..MemoryConfig::default()
    };
    let embedder = Arc::new(HashingEmbedder::new(64));
    let oracle = Arc::new(ScriptedOracle::new(responses));

    let worker_memory = Memory::with_embedder(&config, embedder.clone()).unwrap();
    let worker_queue = TaskQueue::open(&config.store_paths().db).unwrap();
    let worker = ReflectionWorker::new(
        worker_memory,
        worker_queue,
        oracle.clone(),
        WorkerOptions::default(),
    );

    let memory = Memory::with_embedder(&config, embedder).unwrap();
    let queue = TaskQueue::open(&config.store_paths().db).unwrap();
    Fixture {
        worker,
        oracle,
        memory,
        queue,
    }
}

fn task_status(queue: &TaskQueue, id: i64) -> TaskStatus {
    queue
        .list_recent(50)
        .unwrap()
        .into_iter()
        .find(|t| t.id == id)
        .unwrap()
        .status
}

const KEPT: &str = r#"{"should_store": true, "action": "KEPT", "target_doc_id": null,
    "analysis": "", "entities": [], "problem_class": "", "rationale": "covered"}"#;

#[test]
fn idle_worker_reports_no_task() {
    let dir = TempDir::new().unwrap();
    let f = fixture(&dir, vec![]);
    assert!(!f.worker.process_next().unwrap());
}

#[test]
fn kept_decision_leaves_store_untouched() {
    let dir = TempDir::new().unwrap();
    let f = fixture(&dir, vec![Ok(KEPT.to_string())]);

    f.memory
        .add("the capital of france is paris", &[], "Geography")
        .unwrap();
    let id = f.queue.enqueue("what is the capital of france", "Paris").unwrap();

    assert!(f.worker.process_next().unwrap());
    assert_eq!(f.memory.count().unwrap(), 1);
    assert_eq!(task_status(&f.queue, id), TaskStatus::Done);
}

#[test]
fn new_decision_stores_the_structured_model() {
    let dir = TempDir::new().unwrap();
    let unified = r#"{"should_store": true, "action": "NEW", "target_doc_id": null,
        "analysis": "raw lesson about scheduling",
        "entities": ["meeting", "timezone"], "problem_class": "Scheduling",
        "rationale": "novel"}"#;
    let f = fixture(
        &dir,
        vec![
            Ok(unified.to_string()),
            Ok("## Entities\nmeeting\n## Constraints\nno overlaps".to_string()),
        ],
    );

    let id = f
        .queue
        .enqueue("schedule a meeting", "booked for 3pm UTC")
        .unwrap();
    assert!(f.worker.process_next().unwrap());

    assert_eq!(f.memory.count().unwrap(), 1);
    let doc = &f.memory.get_all().unwrap()[0];
    assert_eq!(doc.content, "## Entities\nmeeting\n## Constraints\nno overlaps");
    assert_eq!(doc.entities, vec!["meeting".to_string(), "timezone".to_string()]);
    assert_eq!(doc.problem_class, "Scheduling");
    assert_eq!(task_status(&f.queue, id), TaskStatus::Done);

    // Two oracle calls: unified analysis, then knowledge-model structuring.
    let prompts = f.oracle.prompts();
    assert_eq!(prompts.len(), 2);
    assert!(prompts[0].contains("schedule a meeting"));
    assert!(prompts[1].contains("raw lesson about scheduling"));
}

#[test]
fn update_decision_merges_into_the_target() {
    let dir = TempDir::new().unwrap();

    // Seed first so the unified response can reference the real id.
    let f = fixture(&dir, vec![]);
    let target = f
        .memory
        .add("the capital of france is paris", &[], "Geography")
        .unwrap();

    let unified = format!(
        r#"{{"should_store": true, "action": "UPDATE", "target_doc_id": {target},
            "analysis": "merged", "entities": ["a", "b"], "problem_class": "X"}}"#
    );
    *f.oracle.responses.lock().unwrap() = VecDeque::from(vec![
        Ok(unified),
        Ok("structured: merged".to_string()),
    ]);

    let id = f
        .queue
        .enqueue("tell me about france", "paris is the capital")
        .unwrap();
    assert!(f.worker.process_next().unwrap());

    assert_eq!(f.memory.count().unwrap(), 1);
    let doc = f.memory.get_document(target).unwrap().unwrap();
    assert_eq!(doc.content, "structured: merged");
    assert_eq!(doc.entities, vec!["a".to_string(), "b".to_string()]);
    assert_eq!(doc.problem_class, "X");
    assert_eq!(task_status(&f.queue, id), TaskStatus::Done);
}

#[test]
fn update_with_missing_target_stores_a_new_entry() {
    let dir = TempDir::new().unwrap();
    let unified = r#"{"should_store": true, "action": "UPDATE", "target_doc_id": 9999,
        "analysis": "orphan merge", "entities": [], "problem_class": ""}"#;
    let f = fixture(
        &dir,
        vec![Ok(unified.to_string()), Ok("structured orphan".to_string())],
    );

    let id = f.queue.enqueue("q", "a").unwrap();
    assert!(f.worker.process_next().unwrap());

    assert_eq!(f.memory.count().unwrap(), 1);
    assert_eq!(f.memory.get_all().unwrap()[0].content, "structured orphan");
    assert_eq!(task_status(&f.queue, id), TaskStatus::Done);
}

#[test]
fn structuring_failure_falls_back_to_the_raw_analysis() {
    let dir = TempDir::new().unwrap();
    let unified = r#"{"should_store": true, "action": "NEW",
        "analysis": "raw analysis text", "entities": [], "problem_class": ""}"#;
    let f = fixture(
        &dir,
        vec![Ok(unified.to_string()), Err("model overloaded".to_string())],
    );

    let id = f.queue.enqueue("q", "a").unwrap();
    assert!(f.worker.process_next().unwrap());

    assert_eq!(f.memory.count().unwrap(), 1);
    assert_eq!(f.memory.get_all().unwrap()[0].content, "raw analysis text");
    assert_eq!(task_status(&f.queue, id), TaskStatus::Done);
}

#[test]
fn poison_message_completes_without_mutation() {
    let dir = TempDir::new().unwrap();
    let f = fixture(&dir, vec![Ok("I am sorry, I cannot comply.".to_string())]);

    let id = f.queue.enqueue("q", "a").unwrap();
    assert!(f.worker.process_next().unwrap());

    assert_eq!(f.memory.count().unwrap(), 0);
    assert_eq!(task_status(&f.queue, id), TaskStatus::Done);
}

#[test]
fn empty_oracle_response_completes_without_mutation() {
    let dir = TempDir::new().unwrap();
    let f = fixture(&dir, vec![Ok(String::new())]);

    let id = f.queue.enqueue("q", "a").unwrap();
    assert!(f.worker.process_next().unwrap());
    assert_eq!(f.memory.count().unwrap(), 0);
    assert_eq!(task_status(&f.queue, id), TaskStatus::Done);
}

#[test]
fn should_store_false_completes_without_mutation() {
    let dir = TempDir::new().unwrap();
    let f = fixture(
        &dir,
        vec![Ok(r#"{"should_store": false, "action": "NEW"}"#.to_string())],
    );

    let id = f.queue.enqueue("hello", "hi there").unwrap();
    assert!(f.worker.process_next().unwrap());
    assert_eq!(f.memory.count().unwrap(), 0);
    assert_eq!(task_status(&f.queue, id), TaskStatus::Done);
}

#[test]
fn fenced_response_is_unwrapped() {
    let dir = TempDir::new().unwrap();
    let f = fixture(&dir, vec![Ok(format!("```json\n{KEPT}\n```"))]);

    let id = f.queue.enqueue("q", "a").unwrap();
    assert!(f.worker.process_next().unwrap());
    assert_eq!(f.memory.count().unwrap(), 0);
    assert_eq!(task_status(&f.queue, id), TaskStatus::Done);
}

#[test]
fn oracle_transport_error_fails_the_task() {
    let dir = TempDir::new().unwrap();
    let f = fixture(&dir, vec![Err("connection refused".to_string())]);

    let id = f.queue.enqueue("q", "a").unwrap();
    assert!(f.worker.process_next().unwrap());

    assert_eq!(f.memory.count().unwrap(), 0);
    let task = f
        .queue
        .list_recent(10)
        .unwrap()
        .into_iter()
        .find(|t| t.id == id)
        .unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error_msg.unwrap().contains("connection refused"));
}

#[test]
fn merge_candidates_are_offered_to_the_oracle() {
    let dir = TempDir::new().unwrap();
    let f = fixture(&dir, vec![Ok(KEPT.to_string())]);

    let target = f
        .memory
        .add("the capital of france is paris", &[], "Geography")
        .unwrap();
    // A near-duplicate interaction: the locality probe lands next to the
    // seeded document, which must appear in the unified prompt.
    f.queue
        .enqueue("the capital of france is paris", "yes")
        .unwrap();
    assert!(f.worker.process_next().unwrap());

    let prompts = f.oracle.prompts();
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].contains(&format!("ID: {target}")));
    assert!(prompts[0].contains("the capital of france is paris"));
}

#[test]
fn unrelated_interactions_offer_no_candidates() {
    let dir = TempDir::new().unwrap();
    let f = fixture(&dir, vec![Ok(KEPT.to_string())]);

    f.memory
        .add("the capital of france is paris", &[], "Geography")
        .unwrap();
    f.queue
        .enqueue("compile error in the scheduler", "fixed the borrow")
        .unwrap();
    assert!(f.worker.process_next().unwrap());

    let prompts = f.oracle.prompts();
    assert!(prompts[0].contains("Similar existing knowledge:\nNone"));
}

#[test]
fn spawned_worker_drains_the_queue_and_stops() {
    let dir = TempDir::new().unwrap();
    let config = MemoryConfig {
        base_path: dir.path().join("spawned"),
        embedding_model: "hashing-64".to_string(),
        ..MemoryConfig::default()
    };
    let embedder = Arc::new(HashingEmbedder::new(64));
    let oracle = Arc::new(ScriptedOracle::new(vec![Ok(KEPT.to_string())]));

    let worker = ReflectionWorker::new(
        Memory::with_embedder(&config, embedder.clone()).unwrap(),
        TaskQueue::open(&config.store_paths().db).unwrap(),
        oracle,
        WorkerOptions {
            poll_interval: Duration::from_millis(20),
            ..WorkerOptions::default()
        },
    );

    let queue = TaskQueue::open(&config.store_paths().db).unwrap();
    let id = queue.enqueue("q", "a").unwrap();

    let handle = worker.spawn();
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if task_status(&queue, id) == TaskStatus::Done {
            break;
        }
        assert!(Instant::now() < deadline, "worker did not finish in time");
        std::thread::sleep(Duration::from_millis(20));
    }
    // stop() is observed at the next loop boundary and joins the thread.
    handle.stop();
}
