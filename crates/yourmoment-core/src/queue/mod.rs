//! Background work queue.
//!
//! A named-queue broker backed by the application database: `enqueue`
//! returns a task id, `revoke` marks a task revoked, and workers `claim`
//! tasks one at a time. Claiming is a single guarded UPDATE inside a
//! transaction so concurrent workers never take the same task.
//!
//! Four pipeline queues (`discovery`, `preparation`, `generation`,
//! `posting`) plus `maintenance` for periodic jobs.

use serde::{Deserialize, Serialize};

use crate::error::{QueueError, StorageError};
use crate::storage::{new_id, now_string, DbPool};

/// All named queues, in worker scan order: later pipeline stages drain
/// first so in-flight work finishes before new discovery begins.
pub const QUEUES: &[&str] = &[
    "posting",
    "generation",
    "preparation",
    "discovery",
    "maintenance",
];

/// A claimed or inspected queue task.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct QueueTask {
    pub id: String,
    pub queue: String,
    pub process_id: Option<String>,
    pub payload: String,
    pub status: String,
    pub attempts: i64,
    pub claimed_at: Option<String>,
    pub finished_at: Option<String>,
    pub error: Option<String>,
    pub created_at: String,
}

impl QueueTask {
    /// Deserialize the task payload.
    pub fn payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, QueueError> {
        serde_json::from_str(&self.payload).map_err(|e| QueueError::Unavailable {
            message: format!("task {} has malformed payload: {e}", self.id),
        })
    }
}

/// Per-queue depth summary.
#[derive(Debug, Clone, Serialize)]
pub struct QueueDepth {
    pub queue: String,
    pub queued: i64,
    pub claimed: i64,
}

fn unavailable(e: StorageError) -> QueueError {
    QueueError::Unavailable {
        message: e.to_string(),
    }
}

/// Enqueue a task, returning its id.
pub async fn enqueue<T: Serialize>(
    pool: &DbPool,
    queue: &str,
    process_id: Option<&str>,
    payload: &T,
) -> Result<String, QueueError> {
    let id = new_id();
    let payload_json = serde_json::to_string(payload).map_err(|e| QueueError::Unavailable {
        message: format!("payload serialization failed: {e}"),
    })?;

    sqlx::query(
        "INSERT INTO queue_tasks (id, queue, process_id, payload, status, created_at) \
         VALUES (?, ?, ?, ?, 'queued', ?)",
    )
    .bind(&id)
    .bind(queue)
    .bind(process_id)
    .bind(&payload_json)
    .bind(now_string())
    .execute(pool)
    .await
    .map_err(|e| unavailable(StorageError::Query { source: e }))?;

    tracing::debug!(task_id = %id, queue, "task enqueued");
    Ok(id)
}

/// Revoke a task. Queued tasks never run; a claimed task observes the
/// revocation at its next cancellation check.
pub async fn revoke(pool: &DbPool, task_id: &str) -> Result<(), QueueError> {
    sqlx::query(
        "UPDATE queue_tasks SET status = 'revoked', finished_at = ? \
         WHERE id = ? AND status IN ('queued', 'claimed')",
    )
    .bind(now_string())
    .bind(task_id)
    .execute(pool)
    .await
    .map_err(|e| unavailable(StorageError::Query { source: e }))?;
    Ok(())
}

/// Whether a task has been revoked.
pub async fn is_revoked(pool: &DbPool, task_id: &str) -> Result<bool, QueueError> {
    let row: Option<(String,)> = sqlx::query_as("SELECT status FROM queue_tasks WHERE id = ?")
        .bind(task_id)
        .fetch_optional(pool)
        .await
        .map_err(|e| unavailable(StorageError::Query { source: e }))?;
    Ok(matches!(row, Some((status,)) if status == "revoked"))
}

/// Current state of a task.
pub async fn task_state(pool: &DbPool, task_id: &str) -> Result<String, QueueError> {
    let row: Option<(String,)> = sqlx::query_as("SELECT status FROM queue_tasks WHERE id = ?")
        .bind(task_id)
        .fetch_optional(pool)
        .await
        .map_err(|e| unavailable(StorageError::Query { source: e }))?;
    row.map(|r| r.0).ok_or_else(|| QueueError::TaskNotFound {
        task_id: task_id.to_string(),
    })
}

/// Claim the oldest queued task on a queue, if any.
///
/// The claim is a guarded UPDATE inside a transaction: two workers can never
/// claim the same task.
pub async fn claim_next(pool: &DbPool, queue: &str) -> Result<Option<QueueTask>, QueueError> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| unavailable(StorageError::Connection { source: e }))?;

    let candidate: Option<(String,)> = sqlx::query_as(
        "SELECT id FROM queue_tasks WHERE queue = ? AND status = 'queued' \
         ORDER BY created_at, id LIMIT 1",
    )
    .bind(queue)
    .fetch_optional(&mut *tx)
    .await
    .map_err(|e| unavailable(StorageError::Query { source: e }))?;

    let Some((task_id,)) = candidate else {
        tx.commit()
            .await
            .map_err(|e| unavailable(StorageError::Connection { source: e }))?;
        return Ok(None);
    };

    let claimed = sqlx::query(
        "UPDATE queue_tasks \
         SET status = 'claimed', claimed_at = ?, attempts = attempts + 1 \
         WHERE id = ? AND status = 'queued'",
    )
    .bind(now_string())
    .bind(&task_id)
    .execute(&mut *tx)
    .await
    .map_err(|e| unavailable(StorageError::Query { source: e }))?;

    tx.commit()
        .await
        .map_err(|e| unavailable(StorageError::Connection { source: e }))?;

    if claimed.rows_affected() == 0 {
        return Ok(None);
    }

    let task = sqlx::query_as::<_, QueueTask>("SELECT * FROM queue_tasks WHERE id = ?")
        .bind(&task_id)
        .fetch_one(pool)
        .await
        .map_err(|e| unavailable(StorageError::Query { source: e }))?;
    Ok(Some(task))
}

/// Mark a claimed task done.
pub async fn complete(pool: &DbPool, task_id: &str) -> Result<(), QueueError> {
    sqlx::query(
        "UPDATE queue_tasks SET status = 'done', finished_at = ? WHERE id = ? AND status = 'claimed'",
    )
    .bind(now_string())
    .bind(task_id)
    .execute(pool)
    .await
    .map_err(|e| unavailable(StorageError::Query { source: e }))?;
    Ok(())
}

/// Record a task failure.
///
/// When the task has attempts left it returns to `queued` for a retry;
/// otherwise it is marked `failed`. Returns true when a retry was scheduled.
pub async fn fail(
    pool: &DbPool,
    task_id: &str,
    error: &str,
    max_retries: i64,
) -> Result<bool, QueueError> {
    let retried = sqlx::query(
        "UPDATE queue_tasks SET status = 'queued', error = ? \
         WHERE id = ? AND status = 'claimed' AND attempts <= ?",
    )
    .bind(error)
    .bind(task_id)
    .bind(max_retries)
    .execute(pool)
    .await
    .map_err(|e| unavailable(StorageError::Query { source: e }))?;

    if retried.rows_affected() == 1 {
        return Ok(true);
    }

    sqlx::query(
        "UPDATE queue_tasks SET status = 'failed', error = ?, finished_at = ? \
         WHERE id = ? AND status = 'claimed'",
    )
    .bind(error)
    .bind(now_string())
    .bind(task_id)
    .execute(pool)
    .await
    .map_err(|e| unavailable(StorageError::Query { source: e }))?;
    Ok(false)
}

/// Depths of every named queue.
pub async fn depths(pool: &DbPool) -> Result<Vec<QueueDepth>, QueueError> {
    let mut out = Vec::with_capacity(QUEUES.len());
    for queue in QUEUES {
        let row: (i64, i64) = sqlx::query_as(
            "SELECT COALESCE(SUM(status = 'queued'), 0), COALESCE(SUM(status = 'claimed'), 0) \
             FROM queue_tasks WHERE queue = ?",
        )
        .bind(queue)
        .fetch_one(pool)
        .await
        .map_err(|e| unavailable(StorageError::Query { source: e }))?;
        out.push(QueueDepth {
            queue: (*queue).to_string(),
            queued: row.0,
            claimed: row.1,
        });
    }
    Ok(out)
}

/// Revoke all queued tasks. Returns how many were cleared.
pub async fn clear_queued(pool: &DbPool) -> Result<u64, QueueError> {
    let result = sqlx::query(
        "UPDATE queue_tasks SET status = 'revoked', finished_at = ? WHERE status = 'queued'",
    )
    .bind(now_string())
    .execute(pool)
    .await
    .map_err(|e| unavailable(StorageError::Query { source: e }))?;
    Ok(result.rows_affected())
}

/// Broker reachability check: a trivial round-trip through the task table.
pub async fn health_check(pool: &DbPool) -> Result<(), QueueError> {
    sqlx::query("SELECT COUNT(*) FROM queue_tasks")
        .execute(pool)
        .await
        .map_err(|e| unavailable(StorageError::Query { source: e }))?;
    Ok(())
}
