//! Stage 3 — Generation.
//!
//! For every `prepared` record, renders the prompt template against the
//! article snapshot, walks the provider chain through the LLM gateway,
//! enforces the AI-disclosure prefix, validates the result, and advances the
//! record to `generated`.
//!
//! When the process is generate-only the pipeline loops back to Discovery
//! for the next cycle instead of enqueueing Posting.

use super::{
    check_control, complete_for_duration, enqueue_stage, read_snapshot, MonitorError,
    ProcessSnapshot, Stage, StageContext, StageControl, StagePayload, StageReport,
};
use crate::content::{ensure_ai_prefix, render_prompt, validate_comment, PromptContext};
use crate::llm::factory::ProviderGenerationConfig;
use crate::storage::{comments, logins, parse_stored, processes, prompts, providers};

/// Run generation for one process.
pub async fn execute(
    ctx: &StageContext,
    payload: &StagePayload,
    task_id: &str,
) -> Result<StageReport, MonitorError> {
    let process_id = payload.process_id.as_str();
    let snapshot = read_snapshot(&ctx.pool, process_id).await?;
    let rows = comments::list_by_status(&ctx.pool, process_id, "prepared").await?;
    let mut report = StageReport::default();

    for row in &rows {
        match check_control(&ctx.pool, process_id, task_id).await? {
            StageControl::Continue => {}
            StageControl::Cancelled => {
                tracing::info!(process_id, "generation cancelled");
                return Ok(report);
            }
            StageControl::DurationExceeded => {
                complete_for_duration(&ctx.pool, process_id).await?;
                return Ok(report);
            }
        }

        match generate_for_row(ctx, &snapshot, row).await {
            Ok(()) => {
                report.processed += 1;
                tracing::debug!(process_id, comment_id = %row.id, "record generated");
            }
            Err(message) => {
                comments::mark_failed(&ctx.pool, &row.id, &message).await?;
                report.errors += 1;
                tracing::warn!(process_id, comment_id = %row.id, error = %message, "generation failed");
            }
        }
    }

    if report.processed > 0 {
        processes::add_stage_count(&ctx.pool, process_id, Stage::Generation, report.processed as i64)
            .await?;
    }
    if report.errors > 0 {
        processes::add_stage_errors(&ctx.pool, process_id, Stage::Generation, report.errors as i64)
            .await?;
    }
    tracing::info!(
        process_id,
        generated = report.processed,
        errors = report.errors,
        "generation finished"
    );

    match check_control(&ctx.pool, process_id, task_id).await? {
        StageControl::Continue => {
            // Generate-only processes skip Posting and start the next
            // monitoring cycle instead.
            let next = if snapshot.generate_only {
                Stage::Discovery
            } else {
                Stage::Posting
            };
            enqueue_stage(&ctx.pool, process_id, next).await?;
            report.next_enqueued = true;
        }
        StageControl::Cancelled => {}
        StageControl::DurationExceeded => {
            complete_for_duration(&ctx.pool, process_id).await?;
        }
    }

    Ok(report)
}

/// Generate one record. Returns a failure message for per-record errors.
async fn generate_for_row(
    ctx: &StageContext,
    snapshot: &ProcessSnapshot,
    row: &comments::AiCommentRow,
) -> Result<(), String> {
    let template_id = row
        .prompt_template_id
        .as_deref()
        .ok_or_else(|| "record has no prompt template".to_string())?;
    let template = prompts::get_template(&ctx.pool, template_id)
        .await
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("prompt template {template_id} no longer exists"))?;

    let platform_username = match row.mymoment_login_id.as_deref() {
        Some(login_id) => match logins::get_login(&ctx.pool, login_id).await {
            Ok(Some(login)) => ctx
                .vault
                .decrypt(&login.username_encrypted)
                .unwrap_or_default(),
            _ => String::new(),
        },
        None => String::new(),
    };

    let context = PromptContext {
        article_title: row.article_title.clone(),
        article_content: row.article_content.clone(),
        article_author: row.article_author.clone(),
        article_category: row.article_category,
        article_published_at: row.article_published_at.as_deref().and_then(parse_stored),
        article_url: row.article_url.clone(),
        platform_username,
    };
    let user_prompt = render_prompt(&template.user_prompt_template, &context);

    let chain = build_provider_chain(ctx, snapshot, row)
        .await
        .map_err(|e| e.to_string())?;

    let outcome = ctx
        .gateway
        .generate(&chain, &template.system_prompt, &user_prompt)
        .await
        .map_err(|e| e.to_string())?;

    let prefix = &ctx.config.llm.ai_comment_prefix;
    let comment = ensure_ai_prefix(prefix, outcome.structure.comment_content.trim());

    let validation = validate_comment(
        &comment,
        prefix,
        ctx.config.llm.min_comment_length,
        ctx.config.llm.max_comment_length,
    );
    if !validation.is_valid {
        return Err(format!(
            "generated comment failed validation: {}",
            validation.errors.join("; ")
        ));
    }

    let advanced = comments::mark_generated(
        &ctx.pool,
        &row.id,
        &comment,
        &outcome.model_used,
        &outcome.provider_used,
        outcome.tokens,
        Some(outcome.generation_time_ms),
    )
    .await
    .map_err(|e| e.to_string())?;
    if !advanced {
        return Err("record left the prepared status mid-stage".to_string());
    }
    Ok(())
}

/// Build the provider chain: the record's (or process's) preferred provider
/// first, then the user's remaining active providers.
async fn build_provider_chain(
    ctx: &StageContext,
    snapshot: &ProcessSnapshot,
    row: &comments::AiCommentRow,
) -> Result<Vec<ProviderGenerationConfig>, MonitorError> {
    let preferred_id = row
        .llm_provider_id
        .clone()
        .or_else(|| snapshot.llm_provider_id.clone());

    let mut active = providers::list_active_providers(&ctx.pool, &snapshot.user_id).await?;
    if let Some(preferred_id) = preferred_id {
        if let Some(pos) = active.iter().position(|p| p.id == preferred_id) {
            let preferred = active.remove(pos);
            active.insert(0, preferred);
        }
    }

    let mut chain = Vec::with_capacity(active.len());
    for provider in active {
        let api_key = ctx.vault.decrypt_api_key(&provider.api_key_encrypted)?;
        let base_url = match provider.provider_name.as_str() {
            "openai" => ctx.config.llm.openai_base_url.clone(),
            "mistral" => ctx.config.llm.mistral_base_url.clone(),
            _ => None,
        };
        chain.push(ProviderGenerationConfig {
            provider_id: provider.id,
            provider_name: provider.provider_name,
            model_name: provider.model_name,
            api_key,
            max_tokens: provider.max_tokens,
            temperature: provider.temperature,
            base_url,
        });
    }
    Ok(chain)
}
