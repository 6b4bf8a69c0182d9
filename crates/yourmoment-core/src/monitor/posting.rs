//! Stage 4 — Posting.
//!
//! Submits every `generated` record's comment through the matching login's
//! platform session and advances the record to `posted` with the platform's
//! newly assigned comment id.
//!
//! Posting is at-most-once: a record whose `(article, login)` pair already
//! has a posted row within the process is failed with a duplicate-post
//! message, and failed posts are never retried (a retried post after a lost
//! response would be worse than a missing one).

use super::{
    check_control, complete_for_duration, enqueue_stage, read_snapshot, MonitorError, Stage,
    StageContext, StageControl, StagePayload, StageReport,
};
use crate::storage::{comments, processes};

/// Error message recorded on duplicate-suppressed records.
pub const DUPLICATE_POST_MESSAGE: &str = "duplicate post suppressed";

/// Run posting for one process.
pub async fn execute(
    ctx: &StageContext,
    payload: &StagePayload,
    task_id: &str,
) -> Result<StageReport, MonitorError> {
    let process_id = payload.process_id.as_str();
    let snapshot = read_snapshot(&ctx.pool, process_id).await?;
    let mut report = StageReport::default();

    if snapshot.generate_only {
        tracing::warn!(process_id, "posting skipped: process is generate-only");
    } else {
        let rows = comments::list_by_status(&ctx.pool, process_id, "generated").await?;

        for row in &rows {
            match check_control(&ctx.pool, process_id, task_id).await? {
                StageControl::Continue => {}
                StageControl::Cancelled => {
                    tracing::info!(process_id, "posting cancelled");
                    return Ok(report);
                }
                StageControl::DurationExceeded => {
                    complete_for_duration(&ctx.pool, process_id).await?;
                    return Ok(report);
                }
            }

            match post_row(ctx, process_id, row).await {
                Ok(()) => {
                    report.processed += 1;
                    tracing::debug!(process_id, comment_id = %row.id, "record posted");
                }
                Err(message) => {
                    comments::mark_failed(&ctx.pool, &row.id, &message).await?;
                    report.errors += 1;
                    tracing::warn!(process_id, comment_id = %row.id, error = %message, "posting failed");
                }
            }
        }

        if report.processed > 0 {
            processes::add_stage_count(&ctx.pool, process_id, Stage::Posting, report.processed as i64)
                .await?;
        }
        if report.errors > 0 {
            processes::add_stage_errors(&ctx.pool, process_id, Stage::Posting, report.errors as i64)
                .await?;
        }
        tracing::info!(
            process_id,
            posted = report.processed,
            errors = report.errors,
            "posting finished"
        );
    }

    match check_control(&ctx.pool, process_id, task_id).await? {
        StageControl::Continue => {
            // Start the next monitoring cycle.
            enqueue_stage(&ctx.pool, process_id, Stage::Discovery).await?;
            report.next_enqueued = true;
        }
        StageControl::Cancelled => {}
        StageControl::DurationExceeded => {
            complete_for_duration(&ctx.pool, process_id).await?;
        }
    }

    Ok(report)
}

/// Post one record. Returns a failure message for per-record errors.
async fn post_row(
    ctx: &StageContext,
    process_id: &str,
    row: &comments::AiCommentRow,
) -> Result<(), String> {
    let login_id = row
        .mymoment_login_id
        .as_deref()
        .ok_or_else(|| "record has no login attribution".to_string())?;
    let comment = row
        .comment_content
        .as_deref()
        .ok_or_else(|| "record has no comment content".to_string())?;

    // At-most-once: a prior row for the same (article, login) may already be
    // posted within this process.
    let duplicate = comments::exists_posted_for_article_login(
        &ctx.pool,
        process_id,
        &row.mymoment_article_id,
        login_id,
    )
    .await
    .map_err(|e| e.to_string())?;
    if duplicate {
        return Err(DUPLICATE_POST_MESSAGE.to_string());
    }

    let mut session = ctx
        .sessions
        .get_or_create(login_id)
        .await
        .map_err(|e| format!("session acquisition failed: {e}"))?;

    let platform_comment_id = session
        .post_comment(&row.mymoment_article_id, comment, None)
        .await
        .map_err(|e| format!("comment submission failed: {e}"))?;
    let _ = ctx.sessions.save_state(login_id, &session).await;

    let advanced = comments::mark_posted(&ctx.pool, &row.id, &platform_comment_id, login_id)
        .await
        .map_err(|e| e.to_string())?;
    if !advanced {
        return Err("record left the generated status mid-stage".to_string());
    }
    Ok(())
}
