//! Stage 2 — Preparation.
//!
//! Fetches the full article body for every `discovered` record and advances
//! it to `prepared`. Records sharing an article id coalesce: the body is
//! fetched once and fanned out to every row. Per-record failures move the
//! row to `failed` and increment the stage error counter.

use std::collections::HashMap;

use super::{
    check_control, complete_for_duration, enqueue_stage, MonitorError, Stage, StageContext,
    StageControl, StagePayload, StageReport,
};
use crate::scraper::ArticleDetail;
use crate::storage::{comments, processes, to_stored};

/// Run preparation for one process.
pub async fn execute(
    ctx: &StageContext,
    payload: &StagePayload,
    task_id: &str,
) -> Result<StageReport, MonitorError> {
    let process_id = payload.process_id.as_str();
    let rows = comments::list_by_status(&ctx.pool, process_id, "discovered").await?;
    let mut report = StageReport::default();

    // Coalesce rows by article: one fetch per article id, via the login of
    // the first row that references it.
    let mut order: Vec<String> = Vec::new();
    let mut by_article: HashMap<String, Vec<comments::AiCommentRow>> = HashMap::new();
    for row in rows {
        if !by_article.contains_key(&row.mymoment_article_id) {
            order.push(row.mymoment_article_id.clone());
        }
        by_article
            .entry(row.mymoment_article_id.clone())
            .or_default()
            .push(row);
    }

    for article_id in order {
        match check_control(&ctx.pool, process_id, task_id).await? {
            StageControl::Continue => {}
            StageControl::Cancelled => {
                tracing::info!(process_id, "preparation cancelled");
                return Ok(report);
            }
            StageControl::DurationExceeded => {
                complete_for_duration(&ctx.pool, process_id).await?;
                return Ok(report);
            }
        }

        let group = by_article.remove(&article_id).unwrap_or_default();
        let Some(first) = group.first() else { continue };
        let login_id = first.mymoment_login_id.clone().unwrap_or_default();

        match fetch_article(ctx, &login_id, &article_id).await {
            Ok(detail) => {
                let published = detail.published_at.map(to_stored);
                let edited = detail.edited_at.map(to_stored);
                for row in &group {
                    let advanced = comments::mark_prepared(
                        &ctx.pool,
                        &row.id,
                        &detail.content,
                        &detail.raw_html,
                        published.as_deref(),
                        edited.as_deref(),
                    )
                    .await?;
                    if advanced {
                        report.processed += 1;
                        tracing::debug!(
                            process_id,
                            comment_id = %row.id,
                            article_id = %article_id,
                            "record prepared"
                        );
                    }
                }
            }
            Err(e) => {
                tracing::warn!(process_id, article_id = %article_id, error = %e, "preparation failed for article");
                let message = format!("article fetch failed: {e}");
                for row in &group {
                    comments::mark_failed(&ctx.pool, &row.id, &message).await?;
                    report.errors += 1;
                }
            }
        }
    }

    if report.processed > 0 {
        processes::add_stage_count(&ctx.pool, process_id, Stage::Preparation, report.processed as i64)
            .await?;
    }
    if report.errors > 0 {
        processes::add_stage_errors(&ctx.pool, process_id, Stage::Preparation, report.errors as i64)
            .await?;
    }
    tracing::info!(
        process_id,
        prepared = report.processed,
        errors = report.errors,
        "preparation finished"
    );

    match check_control(&ctx.pool, process_id, task_id).await? {
        StageControl::Continue => {
            enqueue_stage(&ctx.pool, process_id, Stage::Generation).await?;
            report.next_enqueued = true;
        }
        StageControl::Cancelled => {}
        StageControl::DurationExceeded => {
            complete_for_duration(&ctx.pool, process_id).await?;
        }
    }

    Ok(report)
}

async fn fetch_article(
    ctx: &StageContext,
    login_id: &str,
    article_id: &str,
) -> Result<ArticleDetail, MonitorError> {
    let mut session = ctx.sessions.get_or_create(login_id).await?;
    let detail = session
        .fetch_article(article_id)
        .await
        .map_err(crate::error::SessionError::Scrape)?;
    ctx.sessions.save_state(login_id, &session).await?;
    Ok(detail)
}
