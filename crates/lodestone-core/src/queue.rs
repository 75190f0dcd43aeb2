//! Durable job queue for the conversion pipeline.
//!
//! Jobs survive process restarts: they live in a SQLite table and move
//! through queued → active → {completed, failed}. A worker claims the
//! oldest queued job atomically; a failed run re-queues the job until its
//! attempt budget is exhausted, after which it stays visible as failed
//! rather than disappearing. Records of any state older than a cutoff are
//! removed by the cleanup job.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

const SCHEMA_CREATE_JOBS: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    payload TEXT NOT NULL,
    tracing TEXT NOT NULL,
    state TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL,
    error TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
)
"#;

const SCHEMA_CREATE_JOBS_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state, id);
CREATE INDEX IF NOT EXISTS idx_jobs_updated ON jobs(updated_at);
"#;

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The work a job performs, matched exhaustively by the processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobKind {
    /// Convert an uploaded index into a queryable dump database.
    Convert {
        repository: String,
        commit: String,
        root: String,
        /// Path of the raw upload awaiting conversion.
        filename: PathBuf,
    },
    /// Remove job records older than the configured max age.
    CleanOldJobs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

/// A claimed job, handed to a worker.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: i64,
    pub kind: JobKind,
    /// Tracing fields captured at enqueue time, re-attached to the
    /// processing span so the run links back to its producer.
    pub tracing: HashMap<String, String>,
    /// Attempts including the current one.
    pub attempts: u32,
    pub max_attempts: u32,
}

/// SQLite-backed job queue. Thread-safe; every method takes `&self`.
pub struct JobQueue {
    conn: Mutex<Connection>,
}

impl JobQueue {
    pub fn open(path: &Path) -> Result<Self, QueueError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::initialize(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn in_memory() -> Result<Self, QueueError> {
        let conn = Connection::open_in_memory()?;
        Self::initialize(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn initialize(conn: &Connection) -> Result<(), QueueError> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute(SCHEMA_CREATE_JOBS, [])?;
        conn.execute_batch(SCHEMA_CREATE_JOBS_INDEXES)?;
        Ok(())
    }

    /// Add a job to the queue.
    pub fn enqueue(
        &self,
        kind: &JobKind,
        tracing: &HashMap<String, String>,
        max_attempts: u32,
    ) -> Result<i64, QueueError> {
        let now = now_unix();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO jobs (payload, tracing, state, attempts, max_attempts, created_at, updated_at) \
             VALUES (?1, ?2, 'queued', 0, ?3, ?4, ?4)",
            params![
                serde_json::to_string(kind)?,
                serde_json::to_string(tracing)?,
                max_attempts,
                now
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!(job_id = id, "enqueued job");
        Ok(id)
    }

    /// Claim the oldest queued job, marking it active. Returns `None` when
    /// the queue is empty.
    pub fn dequeue(&self) -> Result<Option<Job>, QueueError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let row: Option<(i64, String, String, u32, u32)> = tx
            .query_row(
                "SELECT id, payload, tracing, attempts, max_attempts FROM jobs \
                 WHERE state = 'queued' ORDER BY id LIMIT 1",
                [],
                |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
                },
            )
            .optional()?;

        let Some((id, payload, tracing, attempts, max_attempts)) = row else {
            return Ok(None);
        };

        tx.execute(
            "UPDATE jobs SET state = 'active', attempts = attempts + 1, updated_at = ?1 WHERE id = ?2",
            params![now_unix(), id],
        )?;
        tx.commit()?;

        Ok(Some(Job {
            id,
            kind: serde_json::from_str(&payload)?,
            tracing: serde_json::from_str(&tracing)?,
            attempts: attempts + 1,
            max_attempts,
        }))
    }

    pub fn mark_complete(&self, job_id: i64) -> Result<(), QueueError> {
        self.conn.lock().execute(
            "UPDATE jobs SET state = 'completed', error = NULL, updated_at = ?1 WHERE id = ?2",
            params![now_unix(), job_id],
        )?;
        Ok(())
    }

    /// Record a failed run. The job re-queues while attempts remain, and
    /// lands in the terminal failed state once they are exhausted.
    ///
    /// Returns true when the job will be retried.
    pub fn mark_failed(&self, job_id: i64, error: &str) -> Result<bool, QueueError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let counts: Option<(u32, u32)> = tx
            .query_row(
                "SELECT attempts, max_attempts FROM jobs WHERE id = ?1",
                [job_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((attempts, max_attempts)) = counts else {
            return Ok(false);
        };

        let retry = attempts < max_attempts;
        let state = if retry { "queued" } else { "failed" };
        tx.execute(
            "UPDATE jobs SET state = ?1, error = ?2, updated_at = ?3 WHERE id = ?4",
            params![state, error, now_unix(), job_id],
        )?;
        tx.commit()?;
        Ok(retry)
    }

    /// Remove job records older than `max_age_secs`, regardless of state.
    /// Stuck active jobs from a killed worker age out here too; their
    /// claims are never released any other way.
    pub fn clean_old_jobs(&self, max_age_secs: i64) -> Result<usize, QueueError> {
        let cutoff = now_unix() - max_age_secs;
        let removed = self
            .conn
            .lock()
            .execute("DELETE FROM jobs WHERE updated_at < ?1", [cutoff])?;
        if removed > 0 {
            debug!(removed, "cleaned old jobs");
        }
        Ok(removed)
    }

    /// Number of jobs currently in `state` (operator visibility).
    pub fn count_in_state(&self, state: JobState) -> Result<i64, QueueError> {
        let count: i64 = self.conn.lock().query_row(
            "SELECT COUNT(*) FROM jobs WHERE state = ?1",
            [state.as_str()],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn convert_kind(repo: &str) -> JobKind {
        JobKind::Convert {
            repository: repo.to_string(),
            commit: "a".repeat(40),
            root: String::new(),
            filename: PathBuf::from("/uploads/x.gz"),
        }
    }

    #[test]
    fn test_enqueue_dequeue_fifo() {
        let queue = JobQueue::in_memory().unwrap();
        let tracing = HashMap::new();
        let first = queue.enqueue(&convert_kind("repo-1"), &tracing, 3).unwrap();
        let second = queue.enqueue(&convert_kind("repo-2"), &tracing, 3).unwrap();

        let job = queue.dequeue().unwrap().unwrap();
        assert_eq!(job.id, first);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.kind, convert_kind("repo-1"));

        let job = queue.dequeue().unwrap().unwrap();
        assert_eq!(job.id, second);
        assert!(queue.dequeue().unwrap().is_none());
    }

    #[test]
    fn test_tracing_context_round_trips() {
        let queue = JobQueue::in_memory().unwrap();
        let mut tracing = HashMap::new();
        tracing.insert("trace_id".to_string(), "abc123".to_string());
        queue.enqueue(&JobKind::CleanOldJobs, &tracing, 1).unwrap();

        let job = queue.dequeue().unwrap().unwrap();
        assert_eq!(job.kind, JobKind::CleanOldJobs);
        assert_eq!(job.tracing.get("trace_id").map(String::as_str), Some("abc123"));
    }

    #[test]
    fn test_failed_jobs_retry_until_exhausted() {
        let queue = JobQueue::in_memory().unwrap();
        let id = queue.enqueue(&convert_kind("repo"), &HashMap::new(), 2).unwrap();

        let job = queue.dequeue().unwrap().unwrap();
        assert_eq!(job.id, id);
        assert!(queue.mark_failed(id, "parse error").unwrap());
        assert_eq!(queue.count_in_state(JobState::Queued).unwrap(), 1);

        let job = queue.dequeue().unwrap().unwrap();
        assert_eq!(job.attempts, 2);
        assert!(!queue.mark_failed(id, "parse error").unwrap());
        assert_eq!(queue.count_in_state(JobState::Failed).unwrap(), 1);
        assert!(queue.dequeue().unwrap().is_none());
    }

    #[test]
    fn test_mark_complete() {
        let queue = JobQueue::in_memory().unwrap();
        let id = queue.enqueue(&convert_kind("repo"), &HashMap::new(), 3).unwrap();
        queue.dequeue().unwrap().unwrap();
        queue.mark_complete(id).unwrap();
        assert_eq!(queue.count_in_state(JobState::Completed).unwrap(), 1);
        assert_eq!(queue.count_in_state(JobState::Active).unwrap(), 0);
    }

    #[test]
    fn test_clean_removes_aged_records_in_any_state() {
        let queue = JobQueue::in_memory().unwrap();
        let done = queue.enqueue(&convert_kind("repo-1"), &HashMap::new(), 3).unwrap();
        queue.dequeue().unwrap().unwrap();
        queue.mark_complete(done).unwrap();

        // A job stuck active because its worker was killed.
        let stuck = queue.enqueue(&convert_kind("repo-2"), &HashMap::new(), 3).unwrap();
        queue.dequeue().unwrap().unwrap();

        // Backdate both records past the cutoff.
        queue
            .conn
            .lock()
            .execute("UPDATE jobs SET updated_at = updated_at - 1000", [])
            .unwrap();

        assert_eq!(queue.clean_old_jobs(500).unwrap(), 2);
        assert_eq!(queue.count_in_state(JobState::Completed).unwrap(), 0);
        assert_eq!(queue.count_in_state(JobState::Active).unwrap(), 0);
        let _ = (done, stuck);
    }
}
