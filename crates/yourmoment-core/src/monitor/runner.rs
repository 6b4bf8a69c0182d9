//! Worker and scheduler loops.
//!
//! The worker claims tasks from the named queues (later pipeline stages
//! drain first), dispatches them to the stage implementations, and absorbs
//! per-task failures: transient stage errors re-enqueue the task up to the
//! retry budget (never for posting), fatal configuration errors mark the
//! whole process failed.
//!
//! The scheduler enqueues periodic maintenance jobs: the hourly session
//! sweep, rate-limiter bucket cleanup, daily failed-comment cleanup, and the
//! duration watchdog that completes over-budget processes even when no
//! worker currently runs one of their stages.

use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::{discovery, generation, posting, preparation};
use super::{MonitorError, ProcessStatus, Stage, StageContext, StagePayload};
use crate::queue::{self, QueueTask};
use crate::storage::{comments, processes, to_stored};

/// Payload of a maintenance queue task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenancePayload {
    /// One of: `session_sweep`, `rate_limit_cleanup`, `comment_cleanup`,
    /// `duration_watchdog`.
    pub job: String,
}

/// How long failed comments are kept before the daily cleanup soft-deletes
/// them.
const FAILED_COMMENT_MAX_AGE_HOURS: i64 = 24;

/// Claim and run tasks until cancelled.
pub async fn worker_loop(ctx: StageContext, cancel: CancellationToken) {
    let poll_interval = Duration::from_secs(ctx.config.queue.poll_interval_seconds.max(1));
    tracing::info!("worker joined the pool");

    loop {
        if cancel.is_cancelled() {
            tracing::info!("worker shutting down");
            return;
        }

        let mut worked = false;
        for queue_name in queue::QUEUES {
            match queue::claim_next(&ctx.pool, queue_name).await {
                Ok(Some(task)) => {
                    run_claimed_task(&ctx, &task).await;
                    worked = true;
                    break;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(queue = queue_name, error = %e, "claim failed");
                }
            }
        }

        if !worked {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(poll_interval) => {}
            }
        }
    }
}

/// Execute one claimed task, recording its outcome on the queue.
pub async fn run_claimed_task(ctx: &StageContext, task: &QueueTask) {
    let outcome = dispatch(ctx, task).await;

    match outcome {
        Ok(()) => {
            if let Err(e) = queue::complete(&ctx.pool, &task.id).await {
                tracing::error!(task_id = %task.id, error = %e, "failed to complete task");
            }
        }
        Err(e) => {
            let fatal = matches!(
                e,
                MonitorError::Validation { .. } | MonitorError::NotFound { .. }
            );
            // Posting is at-most-once: its tasks never retry. Fatal errors
            // never retry either and additionally fail the process.
            let max_retries = if fatal || task.queue == "posting" {
                0
            } else {
                ctx.config.queue.max_retries
            };

            let retried = queue::fail(&ctx.pool, &task.id, &e.to_string(), max_retries)
                .await
                .unwrap_or(false);

            if fatal {
                if let Some(process_id) = task.process_id.as_deref() {
                    let _ = processes::mark_terminal(&ctx.pool, process_id, ProcessStatus::Failed)
                        .await;
                    tracing::error!(process_id, task_id = %task.id, error = %e, "process failed");
                }
            } else {
                tracing::warn!(task_id = %task.id, error = %e, retried, "task failed");
            }
        }
    }
}

async fn dispatch(ctx: &StageContext, task: &QueueTask) -> Result<(), MonitorError> {
    if task.queue == "maintenance" {
        let payload: MaintenancePayload = task.payload()?;
        return run_maintenance_job(ctx, &payload.job).await;
    }

    let Some(stage) = Stage::from_queue(&task.queue) else {
        return Err(MonitorError::Validation {
            message: format!("unknown queue: {}", task.queue),
        });
    };
    let payload: StagePayload = task.payload()?;

    tracing::info!(
        process_id = %payload.process_id,
        stage = stage.queue(),
        task_id = %task.id,
        attempt = task.attempts,
        "stage task starting"
    );

    let report = match stage {
        Stage::Discovery => discovery::execute(ctx, &payload, &task.id).await?,
        Stage::Preparation => preparation::execute(ctx, &payload, &task.id).await?,
        Stage::Generation => generation::execute(ctx, &payload, &task.id).await?,
        Stage::Posting => posting::execute(ctx, &payload, &task.id).await?,
    };

    tracing::info!(
        process_id = %payload.process_id,
        stage = stage.queue(),
        processed = report.processed,
        errors = report.errors,
        next_enqueued = report.next_enqueued,
        "stage task finished"
    );
    Ok(())
}

/// Run one maintenance job by name.
pub async fn run_maintenance_job(ctx: &StageContext, job: &str) -> Result<(), MonitorError> {
    match job {
        "session_sweep" => {
            ctx.sessions.sweep_expired().await?;
            let removed =
                crate::storage::users::delete_expired_user_sessions(&ctx.pool, &to_stored(Utc::now()))
                    .await?;
            if removed > 0 {
                tracing::info!(removed, "deleted expired user sessions");
            }
        }
        "rate_limit_cleanup" => {
            ctx.limiter.limiter().cleanup();
        }
        "comment_cleanup" => {
            let cutoff = to_stored(Utc::now() - chrono::Duration::hours(FAILED_COMMENT_MAX_AGE_HOURS));
            let swept = comments::cleanup_failed_older_than(&ctx.pool, &cutoff).await?;
            if swept > 0 {
                tracing::info!(swept, "soft-deleted stale failed comments");
            }
        }
        "duration_watchdog" => {
            duration_watchdog(ctx).await?;
        }
        other => {
            return Err(MonitorError::Validation {
                message: format!("unknown maintenance job: {other}"),
            });
        }
    }
    Ok(())
}

/// Complete running processes whose wall-clock budget ran out.
///
/// Backstop for the in-stage boundary checks: it also catches processes
/// whose worker died mid-stage.
pub async fn duration_watchdog(ctx: &StageContext) -> Result<u64, MonitorError> {
    let running = processes::list_running(&ctx.pool).await?;
    let mut completed = 0;

    for process in running {
        if !super::duration_exceeded(process.started_at.as_deref(), process.max_duration_minutes) {
            continue;
        }

        for stage in [
            Stage::Discovery,
            Stage::Preparation,
            Stage::Generation,
            Stage::Posting,
        ] {
            if let Some(task_id) = process.task_id_for(stage) {
                queue::revoke(&ctx.pool, task_id).await?;
            }
        }
        if processes::mark_terminal(&ctx.pool, &process.id, ProcessStatus::Completed).await? {
            completed += 1;
            tracing::info!(process_id = %process.id, "watchdog completed over-budget process");
        }
    }

    Ok(completed)
}

/// Run the periodic scheduler until cancelled.
///
/// Enqueues maintenance jobs on their intervals; the watchdog runs every
/// minute, sweep and bucket cleanup hourly, comment cleanup daily.
pub async fn scheduler_loop(ctx: StageContext, cancel: CancellationToken) {
    let mut ticks: u64 = 0;
    tracing::info!("scheduler started");

    loop {
        if cancel.is_cancelled() {
            tracing::info!("scheduler shutting down");
            return;
        }

        if let Err(e) = schedule_tick(&ctx, ticks).await {
            tracing::error!(error = %e, "scheduler tick failed");
        }
        ticks += 1;

        tokio::select! {
            () = cancel.cancelled() => {}
            () = tokio::time::sleep(Duration::from_secs(60)) => {}
        }
    }
}

async fn schedule_tick(ctx: &StageContext, ticks: u64) -> Result<(), MonitorError> {
    enqueue_maintenance(ctx, "duration_watchdog").await?;
    if ticks % 60 == 0 {
        enqueue_maintenance(ctx, "session_sweep").await?;
        enqueue_maintenance(ctx, "rate_limit_cleanup").await?;
    }
    if ticks % (60 * 24) == 0 {
        enqueue_maintenance(ctx, "comment_cleanup").await?;
    }
    Ok(())
}

async fn enqueue_maintenance(ctx: &StageContext, job: &str) -> Result<(), MonitorError> {
    queue::enqueue(
        &ctx.pool,
        "maintenance",
        None,
        &MaintenancePayload {
            job: job.to_string(),
        },
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::testing::{self, TestHarness};

    #[tokio::test]
    async fn worker_runs_a_full_pipeline_cycle() {
        let harness = TestHarness::new().await;
        let login = harness.add_login("Konto A").await;
        let prompts = harness.add_prompts(1).await;
        let process_id = harness
            .create_started_process(&[login], &prompts, false, 60)
            .await;

        harness.platform.serve_article_index(&["101"]).await;
        harness
            .platform
            .serve_article_detail("101", "Mein Hund heisst Bello und ist drei Jahre alt.")
            .await;
        harness
            .llm
            .serve_generation("Ein sehr gelungener Text mit vielen lebendigen Details darin.")
            .await;
        harness.platform.serve_comment_post("101", "c-777").await;

        // Drain tasks one at a time, exactly like the worker loop does.
        for _ in 0..4 {
            let mut ran = false;
            for queue_name in queue::QUEUES {
                if let Some(task) = queue::claim_next(&harness.ctx.pool, queue_name)
                    .await
                    .expect("claim")
                {
                    run_claimed_task(&harness.ctx, &task).await;
                    ran = true;
                    break;
                }
            }
            assert!(ran, "expected a task to be available");
        }

        let process = harness.process(&process_id).await;
        assert_eq!(process.articles_discovered, 1);
        assert_eq!(process.articles_prepared, 1);
        assert_eq!(process.comments_generated, 1);
        assert_eq!(process.comments_posted, 1);
        // The cycle loops: a fresh discovery task is queued.
        assert!(process.discovery_task_id.is_some());
        assert!(process.is_running());
    }

    #[tokio::test]
    async fn fatal_stage_error_fails_the_process() {
        let harness = TestHarness::new().await;
        let login = harness.add_login("Konto A").await;
        let prompts = harness.add_prompts(1).await;
        let process_id = harness
            .create_started_process(&[login], &prompts, false, 60)
            .await;

        // Remove the login association underneath the running process: the
        // discovery snapshot validation is a fatal configuration error.
        sqlx::query("UPDATE monitoring_process_logins SET is_active = 0 WHERE monitoring_process_id = ?")
            .bind(&process_id)
            .execute(&harness.ctx.pool)
            .await
            .expect("strip logins");

        let task = queue::claim_next(&harness.ctx.pool, "discovery")
            .await
            .expect("claim")
            .expect("task");
        run_claimed_task(&harness.ctx, &task).await;

        let process = harness.process(&process_id).await;
        assert_eq!(process.status, "failed");
        assert_eq!(
            queue::task_state(&harness.ctx.pool, &task.id).await.expect("state"),
            "failed"
        );
    }

    #[tokio::test]
    async fn watchdog_completes_over_budget_processes() {
        let harness = TestHarness::new().await;
        let login = harness.add_login("Konto A").await;
        let prompts = harness.add_prompts(1).await;
        let process_id = harness
            .create_started_process(&[login], &prompts, false, 1)
            .await;
        testing::backdate_start(&harness, &process_id, 120).await;

        let completed = duration_watchdog(&harness.ctx).await.expect("watchdog");
        assert_eq!(completed, 1);

        let process = harness.process(&process_id).await;
        assert_eq!(process.status, "completed");

        // The pending discovery task was revoked.
        let task_id = process.discovery_task_id.expect("task id");
        assert!(queue::is_revoked(&harness.ctx.pool, &task_id).await.expect("revoked"));

        // Running it again is a no-op.
        assert_eq!(duration_watchdog(&harness.ctx).await.expect("watchdog"), 0);
    }

    #[tokio::test]
    async fn watchdog_leaves_in_budget_processes_alone() {
        let harness = TestHarness::new().await;
        let login = harness.add_login("Konto A").await;
        let prompts = harness.add_prompts(1).await;
        let process_id = harness
            .create_started_process(&[login], &prompts, false, 60)
            .await;

        assert_eq!(duration_watchdog(&harness.ctx).await.expect("watchdog"), 0);
        assert!(harness.process(&process_id).await.is_running());
    }

    #[tokio::test]
    async fn maintenance_jobs_run() {
        let harness = TestHarness::new().await;

        run_maintenance_job(&harness.ctx, "session_sweep")
            .await
            .expect("sweep");
        run_maintenance_job(&harness.ctx, "rate_limit_cleanup")
            .await
            .expect("cleanup");
        run_maintenance_job(&harness.ctx, "comment_cleanup")
            .await
            .expect("comments");
        run_maintenance_job(&harness.ctx, "duration_watchdog")
            .await
            .expect("watchdog");

        let err = run_maintenance_job(&harness.ctx, "defrag").await.unwrap_err();
        assert!(matches!(err, MonitorError::Validation { .. }));
    }

    #[tokio::test]
    async fn cancelled_task_is_not_rerun_after_stop() {
        let harness = TestHarness::new().await;
        let login = harness.add_login("Konto A").await;
        let prompts = harness.add_prompts(1).await;
        let process_id = harness
            .create_started_process(&[login], &prompts, false, 60)
            .await;

        testing::stop(&harness, &process_id).await;

        // The revoked discovery task is invisible to the worker.
        assert!(queue::claim_next(&harness.ctx.pool, "discovery")
            .await
            .expect("claim")
            .is_none());

        // And no records ever transition under the stopped process.
        let rows =
            crate::storage::comments::list_by_status(&harness.ctx.pool, &process_id, "discovered")
                .await
                .expect("list");
        assert!(rows.is_empty());
    }
}
