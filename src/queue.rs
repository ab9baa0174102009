//! Durable task queue for reflection work.
//!
//! A single `task_queue` table colocated in the store's SQLite database.
//! Tasks move `pending → processing → (done | failed)`; terminal states are
//! never left. Delivery is at-least-once: a worker crash between claiming
//! and finishing leaves the task `processing`, which is operator-recoverable
//! through [`TaskQueue::recover_stale`].

use std::path::Path;
use std::time::Duration;

use chrono::NaiveDateTime;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde::Serialize;

use crate::error::{LoamError, Result};

/// Task lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<TaskStatus> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "done" => Ok(TaskStatus::Done),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(LoamError::invalid_argument(format!(
                "unknown task status '{other}'"
            ))),
        }
    }
}

/// One unit of pending reflection work: a snapshot of an interaction.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: i64,
    pub user_input: String,
    pub agent_output: String,
    pub status: TaskStatus,
    pub retries: i64,
    pub error_msg: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// FIFO work queue backed by the `task_queue` table.
pub struct TaskQueue {
    conn: Mutex<Connection>,
}

const TASK_COLUMNS: &str =
    "id, user_input, agent_output, status, retries, error_msg, created_at, updated_at";

impl TaskQueue {
    /// Open (or create) the queue in the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA busy_timeout=5000;
             CREATE TABLE IF NOT EXISTS task_queue (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 user_input TEXT,
                 agent_output TEXT,
                 status TEXT DEFAULT 'pending',
                 retries INTEGER DEFAULT 0,
                 error_msg TEXT,
                 created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                 updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
             );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Append an interaction with status `pending`. Immediately visible to
    /// any worker's next fetch.
    pub fn enqueue(&self, user_input: &str, agent_output: &str) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO task_queue (user_input, agent_output) VALUES (?1, ?2)",
            params![user_input, agent_output],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Oldest `pending` task (FIFO by id), without claiming it.
    pub fn fetch_pending(&self) -> Result<Option<Task>> {
        let conn = self.conn.lock();
        let task = conn
            .query_row(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM task_queue
                     WHERE status = 'pending' ORDER BY id ASC LIMIT 1"
                ),
                [],
                row_to_task,
            )
            .optional()?;
        Ok(task)
    }

    /// Claim the oldest `pending` task: the select and the transition to
    /// `processing` run in one immediate transaction, so competing workers
    /// never claim the same task.
    pub fn claim_pending(&self) -> Result<Option<Task>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let task = tx
            .query_row(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM task_queue
                     WHERE status = 'pending' ORDER BY id ASC LIMIT 1"
                ),
                [],
                row_to_task,
            )
            .optional()?;
        let task = match task {
            Some(mut task) => {
                tx.execute(
                    "UPDATE task_queue
                     SET status = 'processing', updated_at = CURRENT_TIMESTAMP
                     WHERE id = ?1",
                    params![task.id],
                )?;
                task.status = TaskStatus::Processing;
                Some(task)
            }
            None => None,
        };
        tx.commit()?;
        Ok(task)
    }

    /// `pending → processing`. A no-op for tasks in any other state.
    pub fn mark_processing(&self, id: i64) -> Result<()> {
        self.transition(id, TaskStatus::Processing, "status = 'pending'", None)
    }

    /// `processing → done`. A no-op unless the task is `processing`.
    pub fn mark_done(&self, id: i64) -> Result<()> {
        self.transition(id, TaskStatus::Done, "status = 'processing'", None)
    }

    /// `processing → failed`, recording the diagnostic message.
    pub fn mark_failed(&self, id: i64, error_msg: &str) -> Result<()> {
        self.transition(
            id,
            TaskStatus::Failed,
            "status = 'processing'",
            Some(error_msg),
        )
    }

    fn transition(
        &self,
        id: i64,
        to: TaskStatus,
        guard: &str,
        error_msg: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            &format!(
                "UPDATE task_queue
                 SET status = ?1, error_msg = ?2, updated_at = CURRENT_TIMESTAMP
                 WHERE id = ?3 AND {guard}"
            ),
            params![to.as_str(), error_msg, id],
        )?;
        if changed == 0 {
            log::warn!("ignored transition of task {id} to '{}'", to.as_str());
        }
        Ok(())
    }

    /// Most recent tasks (newest first), for observability.
    pub fn list_recent(&self, limit: usize) -> Result<Vec<Task>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM task_queue ORDER BY id DESC LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit as i64], row_to_task)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Recovery sweep for tasks stranded in `processing` (worker crashed
    /// between claim and terminal state). Tasks older than `max_age` return
    /// to `pending` with an incremented retry counter while under
    /// `max_retries`; tasks at the budget become `failed`. Idempotent.
    /// Returns the number of tasks re-queued.
    pub fn recover_stale(&self, max_age: Duration, max_retries: u32) -> Result<usize> {
        let age_modifier = format!("-{} seconds", max_age.as_secs());
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "UPDATE task_queue
             SET status = 'failed',
                 error_msg = 'stale processing task exceeded retry limit',
                 updated_at = CURRENT_TIMESTAMP
             WHERE status = 'processing'
               AND updated_at <= datetime('now', ?1)
               AND retries >= ?2",
            params![age_modifier, max_retries],
        )?;
        let requeued = tx.execute(
            "UPDATE task_queue
             SET status = 'pending', retries = retries + 1,
                 updated_at = CURRENT_TIMESTAMP
             WHERE status = 'processing'
               AND updated_at <= datetime('now', ?1)
               AND retries < ?2",
            params![age_modifier, max_retries],
        )?;
        tx.commit()?;
        Ok(requeued)
    }

    /// Wholesale reset: delete every task.
    pub fn clear(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM task_queue", [])?;
        Ok(())
    }
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let status_raw: String = row.get(3)?;
    let status = TaskStatus::parse(&status_raw).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            format!("unknown task status '{status_raw}'").into(),
        )
    })?;
    Ok(Task {
        id: row.get(0)?,
        user_input: row.get(1)?,
        agent_output: row.get(2)?,
        status,
        retries: row.get(4)?,
        error_msg: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}
