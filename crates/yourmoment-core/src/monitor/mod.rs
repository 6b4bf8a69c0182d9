//! Monitoring orchestrator: the four-stage comment pipeline.
//!
//! A monitoring process is a finite-duration, cancellable unit of work with
//! four sequential stages (Discovery → Preparation → Generation → Posting),
//! each an independently schedulable queue task keyed by process id. Stage
//! code follows one pattern throughout: *read a small snapshot → do network
//! I/O → one batched write*; a database transaction is never held across a
//! suspension point.
//!
//! Cancellation and the wall-clock duration budget are checked at every
//! stage boundary and between records, never mid-HTTP-call.

pub mod discovery;
pub mod generation;
pub mod posting;
pub mod preparation;
pub mod runner;
pub mod service;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{CryptoError, QueueError, SessionError, StorageError};
use crate::llm::gateway::LlmGateway;
use crate::queue;
use crate::ratelimit::ScrapingRateLimiter;
use crate::scraper::ArticleFilters;
use crate::session::SessionManager;
use crate::storage::{processes, providers, DbPool};
use crate::vault::CredentialVault;

pub use processes::{ProcessStatus, Stage};
pub use service::{MonitoringService, StopReason};

/// Errors from orchestrator operations.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    /// Input or configuration is malformed.
    #[error("validation error: {message}")]
    Validation {
        /// What is wrong.
        message: String,
    },

    /// Resource missing, soft-deleted, or owned by another user.
    #[error("{what} not found")]
    NotFound {
        /// Human-readable resource description.
        what: String,
    },

    /// The process is not in a status that allows the operation.
    #[error("process {process_id} cannot {action} (status: {status})")]
    InvalidState {
        process_id: String,
        action: String,
        status: String,
    },

    /// Database failure.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Background queue failure.
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// Platform session failure.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Credential decryption failure.
    #[error("credential error: {0}")]
    Crypto(#[from] CryptoError),
}

/// Payload carried by every pipeline queue task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagePayload {
    /// The process this task belongs to.
    pub process_id: String,
}

/// Shared dependencies handed to every stage execution.
#[derive(Clone)]
pub struct StageContext {
    pub pool: DbPool,
    pub vault: Arc<CredentialVault>,
    pub sessions: Arc<SessionManager>,
    pub gateway: Arc<LlmGateway>,
    pub limiter: Arc<ScrapingRateLimiter>,
    pub config: Arc<Config>,
}

/// Immutable configuration snapshot read at the start of a stage.
///
/// The snapshot is the authoritative input for the stage run; later edits to
/// the process, prompts, or logins do not affect work in flight (a running
/// process rejects edits anyway).
#[derive(Debug, Clone)]
pub struct ProcessSnapshot {
    pub process_id: String,
    pub user_id: String,
    pub login_ids: Vec<String>,
    pub prompt_ids: Vec<String>,
    pub llm_provider_id: Option<String>,
    pub filters: ArticleFilters,
    pub generate_only: bool,
    pub hide_comments: bool,
    pub max_duration_minutes: i64,
    pub started_at: Option<String>,
}

/// Read a process configuration snapshot in one short read pass.
///
/// The LLM provider falls back to the user's newest active provider when the
/// process does not pin one.
pub async fn read_snapshot(
    pool: &DbPool,
    process_id: &str,
) -> Result<ProcessSnapshot, MonitorError> {
    let process = processes::get_process(pool, process_id)
        .await?
        .ok_or_else(|| MonitorError::NotFound {
            what: format!("monitoring process {process_id}"),
        })?;

    let login_ids = processes::login_ids_for_process(pool, process_id).await?;
    let prompt_ids = processes::prompt_ids_for_process(pool, process_id).await?;

    let llm_provider_id = match process.llm_provider_id.clone() {
        Some(id) => Some(id),
        None => providers::list_active_providers(pool, &process.user_id)
            .await?
            .first()
            .map(|p| p.id.clone()),
    };

    tracing::info!(
        process_id,
        logins = login_ids.len(),
        prompts = prompt_ids.len(),
        "read process snapshot"
    );

    Ok(ProcessSnapshot {
        process_id: process.id,
        user_id: process.user_id,
        login_ids,
        prompt_ids,
        llm_provider_id,
        filters: ArticleFilters {
            tab: process.tab_filter,
            category: process.category_filter,
            task: process.task_filter,
            search: process.search_filter,
            sort: process.sort_option,
        },
        generate_only: process.generate_only,
        hide_comments: process.hide_comments,
        max_duration_minutes: process.max_duration_minutes,
        started_at: process.started_at,
    })
}

/// Decision taken at a stage or record boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageControl {
    /// Keep working.
    Continue,
    /// The process was stopped or the task revoked: return promptly.
    Cancelled,
    /// The wall-clock budget is exhausted: finish up as `completed`.
    DurationExceeded,
}

/// Whether a process has exhausted its wall-clock budget.
pub fn duration_exceeded(started_at: Option<&str>, max_duration_minutes: i64) -> bool {
    let Some(started) = started_at.and_then(crate::storage::parse_stored) else {
        return false;
    };
    Utc::now() - started >= chrono::Duration::minutes(max_duration_minutes)
}

/// Cheap boundary check: cancellation first, then the duration budget.
pub async fn check_control(
    pool: &DbPool,
    process_id: &str,
    task_id: &str,
) -> Result<StageControl, MonitorError> {
    let Some(process) = processes::get_process(pool, process_id).await? else {
        return Ok(StageControl::Cancelled);
    };
    if !process.is_running() || !process.is_active {
        return Ok(StageControl::Cancelled);
    }
    if queue::is_revoked(pool, task_id).await? {
        return Ok(StageControl::Cancelled);
    }
    if duration_exceeded(process.started_at.as_deref(), process.max_duration_minutes) {
        return Ok(StageControl::DurationExceeded);
    }
    Ok(StageControl::Continue)
}

/// Transition a process to `completed` because its budget ran out, without
/// enqueueing further stages.
pub async fn complete_for_duration(pool: &DbPool, process_id: &str) -> Result<(), MonitorError> {
    if processes::mark_terminal(pool, process_id, ProcessStatus::Completed).await? {
        tracing::info!(process_id, "process completed: duration budget exhausted");
    }
    Ok(())
}

/// Summary of one stage execution, logged and returned to the worker.
#[derive(Debug, Clone, Default)]
pub struct StageReport {
    /// Records successfully advanced.
    pub processed: u64,
    /// Per-record errors absorbed.
    pub errors: u64,
    /// Whether a follow-up task was enqueued.
    pub next_enqueued: bool,
}

/// Enqueue a stage task for a process and record its id on the process row.
pub async fn enqueue_stage(
    pool: &DbPool,
    process_id: &str,
    stage: Stage,
) -> Result<String, MonitorError> {
    let task_id = queue::enqueue(
        pool,
        stage.queue(),
        Some(process_id),
        &StagePayload {
            process_id: process_id.to_string(),
        },
    )
    .await?;
    processes::record_stage_task(pool, process_id, stage, &task_id).await?;
    tracing::debug!(process_id, stage = stage.queue(), task_id = %task_id, "stage enqueued");
    Ok(task_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{init_test_db, to_stored};

    #[test]
    fn duration_not_exceeded_without_start() {
        assert!(!duration_exceeded(None, 1));
    }

    #[test]
    fn duration_exceeded_after_budget() {
        let started = to_stored(Utc::now() - chrono::Duration::seconds(90));
        assert!(duration_exceeded(Some(&started), 1));
    }

    #[test]
    fn duration_within_budget() {
        let started = to_stored(Utc::now() - chrono::Duration::seconds(30));
        assert!(!duration_exceeded(Some(&started), 1));
    }

    #[tokio::test]
    async fn snapshot_reads_associations_and_filters() {
        let pool = init_test_db().await.expect("init db");
        let fixture = crate::storage::comments::test_fixtures::seed(&pool).await;

        let snapshot = read_snapshot(&pool, &fixture.process_id).await.expect("snapshot");
        assert_eq!(snapshot.user_id, fixture.user_id);
        assert!(snapshot.login_ids.is_empty());
        assert!(snapshot.prompt_ids.is_empty());
        assert_eq!(snapshot.filters.tab.as_deref(), Some("alle"));
        assert!(!snapshot.generate_only);
    }

    #[tokio::test]
    async fn snapshot_missing_process_is_not_found() {
        let pool = init_test_db().await.expect("init db");
        let err = read_snapshot(&pool, "missing").await.unwrap_err();
        assert!(matches!(err, MonitorError::NotFound { .. }));
    }
}
