//! CRUD operations for monitoring processes and their join tables.
//!
//! Process status strings and the four pipeline stages are modeled here so
//! every column name and queue name derives from one place.

use super::{new_id, now_string, DbPool};
use crate::error::StorageError;

/// Lifecycle states of a monitoring process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Created,
    Running,
    Stopped,
    Completed,
    Failed,
}

impl ProcessStatus {
    /// Stored string form.
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessStatus::Created => "created",
            ProcessStatus::Running => "running",
            ProcessStatus::Stopped => "stopped",
            ProcessStatus::Completed => "completed",
            ProcessStatus::Failed => "failed",
        }
    }

    /// Parse the stored string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(ProcessStatus::Created),
            "running" => Some(ProcessStatus::Running),
            "stopped" => Some(ProcessStatus::Stopped),
            "completed" => Some(ProcessStatus::Completed),
            "failed" => Some(ProcessStatus::Failed),
            _ => None,
        }
    }
}

/// The four pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Discovery,
    Preparation,
    Generation,
    Posting,
}

impl Stage {
    /// Named queue carrying this stage's tasks.
    pub fn queue(self) -> &'static str {
        match self {
            Stage::Discovery => "discovery",
            Stage::Preparation => "preparation",
            Stage::Generation => "generation",
            Stage::Posting => "posting",
        }
    }

    /// Column recording the currently enqueued task id for this stage.
    pub fn task_column(self) -> &'static str {
        match self {
            Stage::Discovery => "discovery_task_id",
            Stage::Preparation => "preparation_task_id",
            Stage::Generation => "generation_task_id",
            Stage::Posting => "posting_task_id",
        }
    }

    /// Column counting successful record transitions in this stage.
    pub fn counter_column(self) -> &'static str {
        match self {
            Stage::Discovery => "articles_discovered",
            Stage::Preparation => "articles_prepared",
            Stage::Generation => "comments_generated",
            Stage::Posting => "comments_posted",
        }
    }

    /// Column counting per-record errors in this stage.
    pub fn error_column(self) -> &'static str {
        match self {
            Stage::Discovery => "errors_in_discovery",
            Stage::Preparation => "errors_in_preparation",
            Stage::Generation => "errors_in_generation",
            Stage::Posting => "errors_in_posting",
        }
    }

    /// The stage that follows this one, if any.
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Discovery => Some(Stage::Preparation),
            Stage::Preparation => Some(Stage::Generation),
            Stage::Generation => Some(Stage::Posting),
            Stage::Posting => None,
        }
    }

    /// Parse a queue name back into a stage.
    pub fn from_queue(queue: &str) -> Option<Stage> {
        match queue {
            "discovery" => Some(Stage::Discovery),
            "preparation" => Some(Stage::Preparation),
            "generation" => Some(Stage::Generation),
            "posting" => Some(Stage::Posting),
            _ => None,
        }
    }
}

/// A monitoring process row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MonitoringProcessRow {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub description: Option<String>,
    pub category_filter: Option<i64>,
    pub task_filter: Option<i64>,
    pub tab_filter: Option<String>,
    pub search_filter: Option<String>,
    pub sort_option: Option<String>,
    pub max_duration_minutes: i64,
    pub generate_only: bool,
    pub hide_comments: bool,
    pub status: String,
    pub is_active: bool,
    pub llm_provider_id: Option<String>,
    pub started_at: Option<String>,
    pub stopped_at: Option<String>,
    pub last_activity_at: Option<String>,
    pub discovery_task_id: Option<String>,
    pub preparation_task_id: Option<String>,
    pub generation_task_id: Option<String>,
    pub posting_task_id: Option<String>,
    pub articles_discovered: i64,
    pub articles_prepared: i64,
    pub comments_generated: i64,
    pub comments_posted: i64,
    pub errors_in_discovery: i64,
    pub errors_in_preparation: i64,
    pub errors_in_generation: i64,
    pub errors_in_posting: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl MonitoringProcessRow {
    /// Parsed status.
    pub fn status(&self) -> Option<ProcessStatus> {
        ProcessStatus::parse(&self.status)
    }

    /// Whether the process is currently running.
    pub fn is_running(&self) -> bool {
        self.status == "running"
    }

    /// Recorded task id for a stage.
    pub fn task_id_for(&self, stage: Stage) -> Option<&str> {
        match stage {
            Stage::Discovery => self.discovery_task_id.as_deref(),
            Stage::Preparation => self.preparation_task_id.as_deref(),
            Stage::Generation => self.generation_task_id.as_deref(),
            Stage::Posting => self.posting_task_id.as_deref(),
        }
    }
}

/// Fields for creating a new process.
#[derive(Debug, Clone)]
pub struct NewProcess {
    pub user_id: String,
    pub name: String,
    pub description: Option<String>,
    pub category_filter: Option<i64>,
    pub task_filter: Option<i64>,
    pub tab_filter: Option<String>,
    pub search_filter: Option<String>,
    pub sort_option: Option<String>,
    pub max_duration_minutes: i64,
    pub generate_only: bool,
    pub hide_comments: bool,
    pub llm_provider_id: Option<String>,
}

/// Insert a new process in status `created`.
pub async fn create_process(
    pool: &DbPool,
    new: &NewProcess,
) -> Result<MonitoringProcessRow, StorageError> {
    let id = new_id();
    let now = now_string();

    sqlx::query(
        "INSERT INTO monitoring_processes \
         (id, user_id, name, description, category_filter, task_filter, tab_filter, search_filter, \
          sort_option, max_duration_minutes, generate_only, hide_comments, status, is_active, \
          llm_provider_id, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'created', 1, ?, ?, ?)",
    )
    .bind(&id)
    .bind(&new.user_id)
    .bind(&new.name)
    .bind(&new.description)
    .bind(new.category_filter)
    .bind(new.task_filter)
    .bind(&new.tab_filter)
    .bind(&new.search_filter)
    .bind(&new.sort_option)
    .bind(new.max_duration_minutes)
    .bind(new.generate_only)
    .bind(new.hide_comments)
    .bind(&new.llm_provider_id)
    .bind(&now)
    .bind(&now)
    .execute(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;

    get_process(pool, &id)
        .await?
        .ok_or_else(|| StorageError::Query {
            source: sqlx::Error::RowNotFound,
        })
}

/// Fetch a process by id.
pub async fn get_process(
    pool: &DbPool,
    process_id: &str,
) -> Result<Option<MonitoringProcessRow>, StorageError> {
    sqlx::query_as::<_, MonitoringProcessRow>("SELECT * FROM monitoring_processes WHERE id = ?")
        .bind(process_id)
        .fetch_optional(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })
}

/// Fetch a process scoped to its owner.
///
/// Inactive (soft-deleted) processes are hidden unless `include_inactive`.
pub async fn get_process_for_user(
    pool: &DbPool,
    process_id: &str,
    user_id: &str,
    include_inactive: bool,
) -> Result<Option<MonitoringProcessRow>, StorageError> {
    let sql = if include_inactive {
        "SELECT * FROM monitoring_processes WHERE id = ? AND user_id = ?"
    } else {
        "SELECT * FROM monitoring_processes WHERE id = ? AND user_id = ? AND is_active = 1"
    };
    sqlx::query_as::<_, MonitoringProcessRow>(sql)
        .bind(process_id)
        .bind(user_id)
        .fetch_optional(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })
}

/// List a user's active processes, newest first.
pub async fn list_processes_for_user(
    pool: &DbPool,
    user_id: &str,
    running_only: bool,
    limit: i64,
    offset: i64,
) -> Result<Vec<MonitoringProcessRow>, StorageError> {
    let sql = if running_only {
        "SELECT * FROM monitoring_processes \
         WHERE user_id = ? AND is_active = 1 AND status = 'running' \
         ORDER BY created_at DESC LIMIT ? OFFSET ?"
    } else {
        "SELECT * FROM monitoring_processes \
         WHERE user_id = ? AND is_active = 1 \
         ORDER BY created_at DESC LIMIT ? OFFSET ?"
    };
    sqlx::query_as::<_, MonitoringProcessRow>(sql)
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })
}

/// List every running process (duration watchdog input).
pub async fn list_running(pool: &DbPool) -> Result<Vec<MonitoringProcessRow>, StorageError> {
    sqlx::query_as::<_, MonitoringProcessRow>(
        "SELECT * FROM monitoring_processes WHERE status = 'running' AND is_active = 1",
    )
    .fetch_all(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })
}

/// Count a user's running processes (concurrency cap check).
pub async fn count_running_for_user(pool: &DbPool, user_id: &str) -> Result<i64, StorageError> {
    let count: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM monitoring_processes \
         WHERE user_id = ? AND status = 'running' AND is_active = 1",
    )
    .bind(user_id)
    .fetch_one(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;
    Ok(count.0)
}

/// Transition `created → running`, stamping `started_at`.
///
/// Returns false when the process was not in `created`.
pub async fn mark_running(pool: &DbPool, process_id: &str) -> Result<bool, StorageError> {
    let now = now_string();
    let result = sqlx::query(
        "UPDATE monitoring_processes \
         SET status = 'running', started_at = ?, last_activity_at = ?, updated_at = ? \
         WHERE id = ? AND status = 'created' AND is_active = 1",
    )
    .bind(&now)
    .bind(&now)
    .bind(&now)
    .bind(process_id)
    .execute(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;
    Ok(result.rows_affected() == 1)
}

/// Revert a failed start back to `created`.
pub async fn revert_to_created(pool: &DbPool, process_id: &str) -> Result<(), StorageError> {
    sqlx::query(
        "UPDATE monitoring_processes \
         SET status = 'created', started_at = NULL, last_activity_at = NULL, \
             discovery_task_id = NULL, updated_at = ? \
         WHERE id = ?",
    )
    .bind(now_string())
    .bind(process_id)
    .execute(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;
    Ok(())
}

/// Transition a running process to a terminal status, stamping `stopped_at`.
///
/// Returns false when the process was not running (the stop is idempotent).
pub async fn mark_terminal(
    pool: &DbPool,
    process_id: &str,
    status: ProcessStatus,
) -> Result<bool, StorageError> {
    debug_assert!(matches!(
        status,
        ProcessStatus::Stopped | ProcessStatus::Completed | ProcessStatus::Failed
    ));
    let now = now_string();
    let result = sqlx::query(
        "UPDATE monitoring_processes \
         SET status = ?, stopped_at = ?, last_activity_at = ?, updated_at = ? \
         WHERE id = ? AND status = 'running'",
    )
    .bind(status.as_str())
    .bind(&now)
    .bind(&now)
    .bind(&now)
    .bind(process_id)
    .execute(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;
    Ok(result.rows_affected() == 1)
}

/// Soft-delete a process.
pub async fn soft_delete(pool: &DbPool, process_id: &str) -> Result<(), StorageError> {
    let now = now_string();
    sqlx::query(
        "UPDATE monitoring_processes \
         SET is_active = 0, stopped_at = COALESCE(stopped_at, ?), last_activity_at = ?, updated_at = ? \
         WHERE id = ?",
    )
    .bind(&now)
    .bind(&now)
    .bind(&now)
    .bind(process_id)
    .execute(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;
    Ok(())
}

/// Record the enqueued task id for a stage.
pub async fn record_stage_task(
    pool: &DbPool,
    process_id: &str,
    stage: Stage,
    task_id: &str,
) -> Result<(), StorageError> {
    let sql = format!(
        "UPDATE monitoring_processes SET {} = ?, last_activity_at = ?, updated_at = ? WHERE id = ?",
        stage.task_column()
    );
    sqlx::query(&sql)
        .bind(task_id)
        .bind(now_string())
        .bind(now_string())
        .bind(process_id)
        .execute(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })?;
    Ok(())
}

/// Add a stage's success counter.
pub async fn add_stage_count(
    pool: &DbPool,
    process_id: &str,
    stage: Stage,
    amount: i64,
) -> Result<(), StorageError> {
    let sql = format!(
        "UPDATE monitoring_processes SET {col} = {col} + ?, last_activity_at = ?, updated_at = ? WHERE id = ?",
        col = stage.counter_column()
    );
    sqlx::query(&sql)
        .bind(amount)
        .bind(now_string())
        .bind(now_string())
        .bind(process_id)
        .execute(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })?;
    Ok(())
}

/// Add a stage's error counter.
pub async fn add_stage_errors(
    pool: &DbPool,
    process_id: &str,
    stage: Stage,
    amount: i64,
) -> Result<(), StorageError> {
    let sql = format!(
        "UPDATE monitoring_processes SET {col} = {col} + ?, last_activity_at = ?, updated_at = ? WHERE id = ?",
        col = stage.error_column()
    );
    sqlx::query(&sql)
        .bind(amount)
        .bind(now_string())
        .bind(now_string())
        .bind(process_id)
        .execute(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })?;
    Ok(())
}

// --- Join-table operations ---

/// Replace a process's login associations with the given set.
///
/// Existing associations are deactivated, then reactivated or inserted for
/// the new list, so attribution history survives edits.
pub async fn set_login_associations(
    pool: &DbPool,
    process_id: &str,
    login_ids: &[String],
) -> Result<(), StorageError> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| StorageError::Connection { source: e })?;

    sqlx::query("UPDATE monitoring_process_logins SET is_active = 0 WHERE monitoring_process_id = ?")
        .bind(process_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| StorageError::Query { source: e })?;

    for login_id in login_ids {
        let reactivated = sqlx::query(
            "UPDATE monitoring_process_logins SET is_active = 1 \
             WHERE monitoring_process_id = ? AND mymoment_login_id = ?",
        )
        .bind(process_id)
        .bind(login_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| StorageError::Query { source: e })?;

        if reactivated.rows_affected() == 0 {
            sqlx::query(
                "INSERT INTO monitoring_process_logins \
                 (id, monitoring_process_id, mymoment_login_id, is_active, created_at) \
                 VALUES (?, ?, ?, 1, ?)",
            )
            .bind(new_id())
            .bind(process_id)
            .bind(login_id)
            .bind(now_string())
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::Query { source: e })?;
        }
    }

    tx.commit()
        .await
        .map_err(|e| StorageError::Connection { source: e })
}

/// Replace a process's prompt associations with the given set and weights.
pub async fn set_prompt_associations(
    pool: &DbPool,
    process_id: &str,
    prompts: &[(String, f64)],
) -> Result<(), StorageError> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| StorageError::Connection { source: e })?;

    sqlx::query("UPDATE monitoring_process_prompts SET is_active = 0 WHERE monitoring_process_id = ?")
        .bind(process_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| StorageError::Query { source: e })?;

    for (prompt_id, weight) in prompts {
        let reactivated = sqlx::query(
            "UPDATE monitoring_process_prompts SET is_active = 1, weight = ? \
             WHERE monitoring_process_id = ? AND prompt_template_id = ?",
        )
        .bind(weight)
        .bind(process_id)
        .bind(prompt_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| StorageError::Query { source: e })?;

        if reactivated.rows_affected() == 0 {
            sqlx::query(
                "INSERT INTO monitoring_process_prompts \
                 (id, monitoring_process_id, prompt_template_id, weight, is_active, created_at) \
                 VALUES (?, ?, ?, ?, 1, ?)",
            )
            .bind(new_id())
            .bind(process_id)
            .bind(prompt_id)
            .bind(weight)
            .bind(now_string())
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::Query { source: e })?;
        }
    }

    tx.commit()
        .await
        .map_err(|e| StorageError::Connection { source: e })
}

/// Deactivate all of a process's associations (soft delete path).
pub async fn deactivate_associations(pool: &DbPool, process_id: &str) -> Result<(), StorageError> {
    sqlx::query("UPDATE monitoring_process_logins SET is_active = 0 WHERE monitoring_process_id = ?")
        .bind(process_id)
        .execute(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })?;
    sqlx::query("UPDATE monitoring_process_prompts SET is_active = 0 WHERE monitoring_process_id = ?")
        .bind(process_id)
        .execute(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })?;
    Ok(())
}

/// Active login ids associated with a process.
pub async fn login_ids_for_process(
    pool: &DbPool,
    process_id: &str,
) -> Result<Vec<String>, StorageError> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT mymoment_login_id FROM monitoring_process_logins \
         WHERE monitoring_process_id = ? AND is_active = 1 ORDER BY created_at",
    )
    .bind(process_id)
    .fetch_all(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;
    Ok(rows.into_iter().map(|r| r.0).collect())
}

/// Active prompt template ids associated with a process.
pub async fn prompt_ids_for_process(
    pool: &DbPool,
    process_id: &str,
) -> Result<Vec<String>, StorageError> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT prompt_template_id FROM monitoring_process_prompts \
         WHERE monitoring_process_id = ? AND is_active = 1 ORDER BY created_at",
    )
    .bind(process_id)
    .fetch_all(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;
    Ok(rows.into_iter().map(|r| r.0).collect())
}
