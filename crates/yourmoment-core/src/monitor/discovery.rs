//! Stage 1 — Discovery.
//!
//! Lists articles per associated login and creates one AIComment record per
//! (article × login × prompt) in status `discovered`, carrying metadata
//! only. The configuration snapshot is read before any network I/O; all new
//! rows land in a single batched write.

use super::{
    check_control, complete_for_duration, enqueue_stage, read_snapshot, MonitorError, Stage,
    StageContext, StageControl, StagePayload, StageReport,
};
use crate::scraper::ArticleMetadata;
use crate::storage::{comments, processes};

/// Run discovery for one process.
pub async fn execute(
    ctx: &StageContext,
    payload: &StagePayload,
    task_id: &str,
) -> Result<StageReport, MonitorError> {
    let process_id = payload.process_id.as_str();
    let snapshot = read_snapshot(&ctx.pool, process_id).await?;

    if snapshot.login_ids.is_empty() {
        return Err(MonitorError::Validation {
            message: format!("process {process_id} has no active logins"),
        });
    }
    if snapshot.prompt_ids.is_empty() {
        return Err(MonitorError::Validation {
            message: format!("process {process_id} has no active prompt templates"),
        });
    }

    let page_limit = ctx.config.scraper.page_limit as usize;
    let mut report = StageReport::default();
    let mut scraped: Vec<(ArticleMetadata, String)> = Vec::new();

    for login_id in &snapshot.login_ids {
        match check_control(&ctx.pool, process_id, task_id).await? {
            StageControl::Continue => {}
            StageControl::Cancelled => {
                tracing::info!(process_id, "discovery cancelled");
                return Ok(report);
            }
            StageControl::DurationExceeded => {
                complete_for_duration(&ctx.pool, process_id).await?;
                return Ok(report);
            }
        }

        // The tab filter must be explicitly configured; a missing filter is
        // a configuration error, not a transient failure.
        if snapshot.filters.tab.is_none() {
            tracing::warn!(
                process_id,
                login_id,
                "no tab filter configured, skipping article discovery for login"
            );
            report.errors += 1;
            continue;
        }

        let articles = match scrape_login(ctx, login_id, &snapshot.filters, page_limit).await {
            Ok(articles) => articles,
            Err(e) => {
                tracing::warn!(process_id, login_id, error = %e, "discovery failed for login");
                report.errors += 1;
                continue;
            }
        };

        tracing::info!(
            process_id,
            login_id,
            articles = articles.len(),
            "articles discovered for login"
        );
        for article in articles {
            scraped.push((article, login_id.clone()));
        }
    }

    if report.errors > 0 {
        processes::add_stage_errors(&ctx.pool, process_id, Stage::Discovery, report.errors as i64)
            .await?;
    }

    // Cross product: every scraped article × every prompt, deduplicated
    // against existing rows inside the batch insert.
    let mut new_rows = Vec::with_capacity(scraped.len() * snapshot.prompt_ids.len());
    for (article, login_id) in &scraped {
        for prompt_id in &snapshot.prompt_ids {
            new_rows.push(comments::NewDiscoveredComment {
                mymoment_article_id: article.id.clone(),
                user_id: snapshot.user_id.clone(),
                mymoment_login_id: login_id.clone(),
                monitoring_process_id: process_id.to_string(),
                prompt_template_id: prompt_id.clone(),
                llm_provider_id: snapshot.llm_provider_id.clone(),
                article_title: article.title.clone(),
                article_author: article.author.clone(),
                article_category: article.category_id,
                article_task_id: article.task_id,
                article_url: article.url.clone(),
                is_hidden: snapshot.hide_comments,
            });
        }
    }

    if !new_rows.is_empty() {
        let inserted = comments::insert_discovered_batch(&ctx.pool, &new_rows).await?;
        report.processed = inserted;
        processes::add_stage_count(&ctx.pool, process_id, Stage::Discovery, inserted as i64)
            .await?;
        tracing::info!(process_id, inserted, "discovery records created");
    }

    match check_control(&ctx.pool, process_id, task_id).await? {
        StageControl::Continue => {
            enqueue_stage(&ctx.pool, process_id, Stage::Preparation).await?;
            report.next_enqueued = true;
        }
        StageControl::Cancelled => {}
        StageControl::DurationExceeded => {
            complete_for_duration(&ctx.pool, process_id).await?;
        }
    }

    Ok(report)
}

async fn scrape_login(
    ctx: &StageContext,
    login_id: &str,
    filters: &crate::scraper::ArticleFilters,
    page_limit: usize,
) -> Result<Vec<ArticleMetadata>, MonitorError> {
    let mut session = ctx.sessions.get_or_create(login_id).await?;
    let articles = session
        .list_articles(filters, page_limit)
        .await
        .map_err(crate::error::SessionError::Scrape)?;
    ctx.sessions.save_state(login_id, &session).await?;
    Ok(articles)
}
