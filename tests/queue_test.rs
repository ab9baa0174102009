use std::time::Duration;

use tempfile::TempDir;

use loam::{TaskQueue, TaskStatus};

fn open_queue(dir: &TempDir) -> TaskQueue {
    TaskQueue::open(&dir.path().join("queue.db")).unwrap()
}

#[test]
fn enqueue_then_fetch_is_fifo() {
    let dir = TempDir::new().unwrap();
    let queue = open_queue(&dir);

    let first = queue.enqueue("first question", "first answer").unwrap();
    let second = queue.enqueue("second question", "second answer").unwrap();
    assert!(second > first);

    let task = queue.fetch_pending().unwrap().unwrap();
    assert_eq!(task.id, first);
    assert_eq!(task.user_input, "first question");
    assert_eq!(task.agent_output, "first answer");
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.retries, 0);
    assert!(task.error_msg.is_none());

    // fetch_pending does not claim: the same task comes back.
    let again = queue.fetch_pending().unwrap().unwrap();
    assert_eq!(again.id, first);
}

#[test]
fn fetch_on_empty_queue_returns_none() {
    let dir = TempDir::new().unwrap();
    let queue = open_queue(&dir);
    assert!(queue.fetch_pending().unwrap().is_none());
    assert!(queue.claim_pending().unwrap().is_none());
}

#[test]
fn claim_transitions_to_processing() {
    let dir = TempDir::new().unwrap();
    let queue = open_queue(&dir);

    let first = queue.enqueue("a", "b").unwrap();
    queue.enqueue("c", "d").unwrap();

    let claimed = queue.claim_pending().unwrap().unwrap();
    assert_eq!(claimed.id, first);
    assert_eq!(claimed.status, TaskStatus::Processing);

    // The claimed task is no longer visible as pending.
    let next = queue.fetch_pending().unwrap().unwrap();
    assert_ne!(next.id, first);
}

#[test]
fn explicit_mark_processing_follows_fetch() {
    let dir = TempDir::new().unwrap();
    let queue = open_queue(&dir);

    let id = queue.enqueue("a", "b").unwrap();
    let task = queue.fetch_pending().unwrap().unwrap();
    queue.mark_processing(task.id).unwrap();

    let listed = queue.list_recent(1).unwrap();
    assert_eq!(listed[0].id, id);
    assert_eq!(listed[0].status, TaskStatus::Processing);
}

#[test]
fn done_and_failed_are_reachable_from_processing() {
    let dir = TempDir::new().unwrap();
    let queue = open_queue(&dir);

    let ok = queue.enqueue("a", "b").unwrap();
    let bad = queue.enqueue("c", "d").unwrap();

    queue.claim_pending().unwrap().unwrap();
    queue.mark_done(ok).unwrap();
    queue.claim_pending().unwrap().unwrap();
    queue.mark_failed(bad, "oracle exploded").unwrap();

    let tasks = queue.list_recent(10).unwrap();
    let ok_task = tasks.iter().find(|t| t.id == ok).unwrap();
    let bad_task = tasks.iter().find(|t| t.id == bad).unwrap();
    assert_eq!(ok_task.status, TaskStatus::Done);
    assert!(ok_task.error_msg.is_none());
    assert_eq!(bad_task.status, TaskStatus::Failed);
    assert_eq!(bad_task.error_msg.as_deref(), Some("oracle exploded"));
}

#[test]
fn terminal_states_are_never_left() {
    let dir = TempDir::new().unwrap();
    let queue = open_queue(&dir);

    let id = queue.enqueue("a", "b").unwrap();
    queue.claim_pending().unwrap().unwrap();
    queue.mark_done(id).unwrap();

    queue.mark_processing(id).unwrap();
    queue.mark_failed(id, "too late").unwrap();
    let task = &queue.list_recent(1).unwrap()[0];
    assert_eq!(task.status, TaskStatus::Done);
    assert!(task.error_msg.is_none());

    // A terminal task is invisible to fetch and claim.
    assert!(queue.fetch_pending().unwrap().is_none());
    assert!(queue.claim_pending().unwrap().is_none());
}

#[test]
fn pending_cannot_jump_straight_to_done() {
    let dir = TempDir::new().unwrap();
    let queue = open_queue(&dir);

    let id = queue.enqueue("a", "b").unwrap();
    queue.mark_done(id).unwrap();
    assert_eq!(queue.list_recent(1).unwrap()[0].status, TaskStatus::Pending);
}

#[test]
fn list_recent_is_newest_first_and_limited() {
    let dir = TempDir::new().unwrap();
    let queue = open_queue(&dir);

    for i in 0..5 {
        queue.enqueue(&format!("q{i}"), "a").unwrap();
    }
    let tasks = queue.list_recent(3).unwrap();
    assert_eq!(tasks.len(), 3);
    assert_eq!(tasks[0].user_input, "q4");
    assert_eq!(tasks[2].user_input, "q2");
}

#[test]
fn clear_removes_everything() {
    let dir = TempDir::new().unwrap();
    let queue = open_queue(&dir);
    queue.enqueue("a", "b").unwrap();
    queue.enqueue("c", "d").unwrap();
    queue.clear().unwrap();
    assert!(queue.list_recent(10).unwrap().is_empty());
}

#[test]
fn recover_stale_requeues_with_retry_accounting() {
    let dir = TempDir::new().unwrap();
    let queue = open_queue(&dir);

    let id = queue.enqueue("a", "b").unwrap();
    queue.claim_pending().unwrap().unwrap();

    // Everything processing is "stale" with a zero max age.
    let requeued = queue.recover_stale(Duration::ZERO, 2).unwrap();
    assert_eq!(requeued, 1);
    let task = &queue.list_recent(1).unwrap()[0];
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.retries, 1);

    // Second round: still under the budget.
    queue.claim_pending().unwrap().unwrap();
    assert_eq!(queue.recover_stale(Duration::ZERO, 2).unwrap(), 1);
    assert_eq!(queue.list_recent(1).unwrap()[0].retries, 2);

    // Budget exhausted: the task fails instead of looping forever.
    queue.claim_pending().unwrap().unwrap();
    assert_eq!(queue.recover_stale(Duration::ZERO, 2).unwrap(), 0);
    let task = &queue.list_recent(1).unwrap()[0];
    assert_eq!(task.id, id);
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error_msg.as_deref().unwrap().contains("retry limit"));
}

#[test]
fn recover_stale_ignores_fresh_processing_tasks() {
    let dir = TempDir::new().unwrap();
    let queue = open_queue(&dir);

    queue.enqueue("a", "b").unwrap();
    queue.claim_pending().unwrap().unwrap();

    let requeued = queue.recover_stale(Duration::from_secs(3600), 3).unwrap();
    assert_eq!(requeued, 0);
    assert_eq!(
        queue.list_recent(1).unwrap()[0].status,
        TaskStatus::Processing
    );
}

#[test]
fn recover_stale_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let queue = open_queue(&dir);

    queue.enqueue("a", "b").unwrap();
    queue.claim_pending().unwrap().unwrap();
    assert_eq!(queue.recover_stale(Duration::ZERO, 5).unwrap(), 1);
    // Nothing is processing anymore; a second sweep changes nothing.
    assert_eq!(queue.recover_stale(Duration::ZERO, 5).unwrap(), 0);
    assert_eq!(queue.list_recent(1).unwrap()[0].retries, 1);
}
