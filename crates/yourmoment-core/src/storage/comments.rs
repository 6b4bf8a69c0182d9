//! CRUD operations for AI comment records.
//!
//! An AIComment is the pipeline's unit of work: one (article × login ×
//! prompt) triple moving through `discovered → prepared → generated →
//! posted`, with `failed` and `deleted` reachable from any non-terminal
//! state. Every transition is a guarded UPDATE whose WHERE clause names the
//! required current status, so a row can never move backwards even under
//! buggy callers; table CHECK constraints enforce the field invariants.

use super::{new_id, now_string, DbPool};
use crate::error::StorageError;

/// A full AI comment row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AiCommentRow {
    pub id: String,
    pub mymoment_article_id: String,
    pub mymoment_comment_id: Option<String>,
    pub user_id: String,
    pub mymoment_login_id: Option<String>,
    pub monitoring_process_id: String,
    pub prompt_template_id: Option<String>,
    pub llm_provider_id: Option<String>,
    pub article_title: String,
    pub article_author: String,
    pub article_category: Option<i64>,
    pub article_task_id: Option<i64>,
    pub article_url: String,
    pub article_content: String,
    pub article_raw_html: String,
    pub article_published_at: Option<String>,
    pub article_edited_at: Option<String>,
    pub article_scraped_at: String,
    pub comment_content: Option<String>,
    pub ai_model_name: Option<String>,
    pub ai_provider_name: Option<String>,
    pub generation_tokens: Option<i64>,
    pub generation_time_ms: Option<i64>,
    pub status: String,
    pub created_at: String,
    pub posted_at: Option<String>,
    pub failed_at: Option<String>,
    pub error_message: Option<String>,
    pub retry_count: i64,
    pub is_active: bool,
    pub is_hidden: bool,
}

/// Fields captured at discovery time for a new record.
#[derive(Debug, Clone)]
pub struct NewDiscoveredComment {
    pub mymoment_article_id: String,
    pub user_id: String,
    pub mymoment_login_id: String,
    pub monitoring_process_id: String,
    pub prompt_template_id: String,
    pub llm_provider_id: Option<String>,
    pub article_title: String,
    pub article_author: String,
    pub article_category: Option<i64>,
    pub article_task_id: Option<i64>,
    pub article_url: String,
    pub is_hidden: bool,
}

/// Batch-insert discovered records in one transaction, deduplicating against
/// existing rows on `(article, process, login, prompt)`.
///
/// Returns the number of rows actually inserted.
pub async fn insert_discovered_batch(
    pool: &DbPool,
    items: &[NewDiscoveredComment],
) -> Result<u64, StorageError> {
    let now = now_string();
    let mut inserted = 0u64;

    let mut tx = pool
        .begin()
        .await
        .map_err(|e| StorageError::Connection { source: e })?;

    for item in items {
        let exists: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM ai_comments \
             WHERE mymoment_article_id = ? AND monitoring_process_id = ? \
               AND mymoment_login_id = ? AND prompt_template_id = ?",
        )
        .bind(&item.mymoment_article_id)
        .bind(&item.monitoring_process_id)
        .bind(&item.mymoment_login_id)
        .bind(&item.prompt_template_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| StorageError::Query { source: e })?;

        if exists.0 > 0 {
            continue;
        }

        sqlx::query(
            "INSERT INTO ai_comments \
             (id, mymoment_article_id, user_id, mymoment_login_id, monitoring_process_id, \
              prompt_template_id, llm_provider_id, article_title, article_author, \
              article_category, article_task_id, article_url, article_content, article_raw_html, \
              article_scraped_at, status, created_at, is_active, is_hidden) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, '', '', ?, 'discovered', ?, 1, ?)",
        )
        .bind(new_id())
        .bind(&item.mymoment_article_id)
        .bind(&item.user_id)
        .bind(&item.mymoment_login_id)
        .bind(&item.monitoring_process_id)
        .bind(&item.prompt_template_id)
        .bind(&item.llm_provider_id)
        .bind(&item.article_title)
        .bind(&item.article_author)
        .bind(item.article_category)
        .bind(item.article_task_id)
        .bind(&item.article_url)
        .bind(&now)
        .bind(&now)
        .bind(item.is_hidden)
        .execute(&mut *tx)
        .await
        .map_err(|e| StorageError::Query { source: e })?;

        inserted += 1;
    }

    tx.commit()
        .await
        .map_err(|e| StorageError::Connection { source: e })?;

    Ok(inserted)
}

/// Fetch a comment row by id.
pub async fn get_comment(
    pool: &DbPool,
    comment_id: &str,
) -> Result<Option<AiCommentRow>, StorageError> {
    sqlx::query_as::<_, AiCommentRow>("SELECT * FROM ai_comments WHERE id = ?")
        .bind(comment_id)
        .fetch_optional(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })
}

/// List a process's active rows in a given status, oldest first.
pub async fn list_by_status(
    pool: &DbPool,
    process_id: &str,
    status: &str,
) -> Result<Vec<AiCommentRow>, StorageError> {
    sqlx::query_as::<_, AiCommentRow>(
        "SELECT * FROM ai_comments \
         WHERE monitoring_process_id = ? AND status = ? AND is_active = 1 \
         ORDER BY created_at, id",
    )
    .bind(process_id)
    .bind(status)
    .fetch_all(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })
}

/// Advance `discovered → prepared`, writing the fetched article body.
///
/// Returns false when the row was not in `discovered`.
pub async fn mark_prepared(
    pool: &DbPool,
    comment_id: &str,
    article_content: &str,
    article_raw_html: &str,
    article_published_at: Option<&str>,
    article_edited_at: Option<&str>,
) -> Result<bool, StorageError> {
    let result = sqlx::query(
        "UPDATE ai_comments \
         SET status = 'prepared', article_content = ?, article_raw_html = ?, \
             article_published_at = ?, article_edited_at = ?, article_scraped_at = ? \
         WHERE id = ? AND status = 'discovered'",
    )
    .bind(article_content)
    .bind(article_raw_html)
    .bind(article_published_at)
    .bind(article_edited_at)
    .bind(now_string())
    .bind(comment_id)
    .execute(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;
    Ok(result.rows_affected() == 1)
}

/// Advance `prepared → generated`, storing the comment payload.
///
/// Returns false when the row was not in `prepared`.
pub async fn mark_generated(
    pool: &DbPool,
    comment_id: &str,
    comment_content: &str,
    ai_model_name: &str,
    ai_provider_name: &str,
    generation_tokens: Option<i64>,
    generation_time_ms: Option<i64>,
) -> Result<bool, StorageError> {
    let result = sqlx::query(
        "UPDATE ai_comments \
         SET status = 'generated', comment_content = ?, ai_model_name = ?, ai_provider_name = ?, \
             generation_tokens = ?, generation_time_ms = ? \
         WHERE id = ? AND status = 'prepared'",
    )
    .bind(comment_content)
    .bind(ai_model_name)
    .bind(ai_provider_name)
    .bind(generation_tokens)
    .bind(generation_time_ms)
    .bind(comment_id)
    .execute(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;
    Ok(result.rows_affected() == 1)
}

/// Advance `generated → posted`, recording the platform comment id.
///
/// Returns false when the row was not in `generated`.
pub async fn mark_posted(
    pool: &DbPool,
    comment_id: &str,
    mymoment_comment_id: &str,
    mymoment_login_id: &str,
) -> Result<bool, StorageError> {
    let result = sqlx::query(
        "UPDATE ai_comments \
         SET status = 'posted', mymoment_comment_id = ?, mymoment_login_id = ?, posted_at = ? \
         WHERE id = ? AND status = 'generated'",
    )
    .bind(mymoment_comment_id)
    .bind(mymoment_login_id)
    .bind(now_string())
    .bind(comment_id)
    .execute(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;
    Ok(result.rows_affected() == 1)
}

/// Move a non-terminal row to `failed` with an error message.
///
/// `comment_content` is backfilled to the empty string when still unset so
/// the content constraint holds for post-preparation statuses.
pub async fn mark_failed(
    pool: &DbPool,
    comment_id: &str,
    error_message: &str,
) -> Result<bool, StorageError> {
    let result = sqlx::query(
        "UPDATE ai_comments \
         SET status = 'failed', error_message = ?, failed_at = ?, \
             comment_content = COALESCE(comment_content, '') \
         WHERE id = ? AND status IN ('discovered', 'prepared', 'generated')",
    )
    .bind(error_message)
    .bind(now_string())
    .bind(comment_id)
    .execute(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;
    Ok(result.rows_affected() == 1)
}

/// Soft-delete a row (any non-posted status).
pub async fn soft_delete_comment(pool: &DbPool, comment_id: &str) -> Result<bool, StorageError> {
    let result = sqlx::query(
        "UPDATE ai_comments \
         SET status = 'deleted', is_active = 0, comment_content = COALESCE(comment_content, '') \
         WHERE id = ? AND status NOT IN ('posted', 'deleted')",
    )
    .bind(comment_id)
    .execute(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;
    Ok(result.rows_affected() == 1)
}

/// Soft-delete failed rows older than `cutoff`. Returns how many.
pub async fn cleanup_failed_older_than(
    pool: &DbPool,
    cutoff: &str,
) -> Result<u64, StorageError> {
    let result = sqlx::query(
        "UPDATE ai_comments \
         SET status = 'deleted', is_active = 0, comment_content = COALESCE(comment_content, '') \
         WHERE status = 'failed' AND is_active = 1 AND created_at < ?",
    )
    .bind(cutoff)
    .execute(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;
    Ok(result.rows_affected())
}

/// Whether a posted row already exists for `(article, login)` within the
/// process (duplicate post suppression).
pub async fn exists_posted_for_article_login(
    pool: &DbPool,
    process_id: &str,
    article_id: &str,
    login_id: &str,
) -> Result<bool, StorageError> {
    let count: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM ai_comments \
         WHERE monitoring_process_id = ? AND mymoment_article_id = ? \
           AND mymoment_login_id = ? AND status = 'posted'",
    )
    .bind(process_id)
    .bind(article_id)
    .bind(login_id)
    .fetch_one(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;
    Ok(count.0 > 0)
}

/// Aggregate comment statistics for a user.
#[derive(Debug, Clone, Default)]
pub struct CommentStatistics {
    pub total: i64,
    pub posted: i64,
    pub generated: i64,
    pub failed: i64,
    pub success_rate: f64,
    pub avg_generation_time_ms: f64,
}

/// Compute a user's comment statistics over active rows.
pub async fn user_statistics(
    pool: &DbPool,
    user_id: &str,
) -> Result<CommentStatistics, StorageError> {
    let row: (i64, i64, i64, i64, Option<f64>) = sqlx::query_as(
        "SELECT COUNT(*), \
                COALESCE(SUM(status = 'posted'), 0), \
                COALESCE(SUM(status = 'generated'), 0), \
                COALESCE(SUM(status = 'failed'), 0), \
                AVG(generation_time_ms) \
         FROM ai_comments WHERE user_id = ? AND is_active = 1",
    )
    .bind(user_id)
    .fetch_one(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;

    let (total, posted, generated, failed, avg_ms) = row;
    Ok(CommentStatistics {
        total,
        posted,
        generated,
        failed,
        success_rate: if total > 0 {
            posted as f64 / total as f64 * 100.0
        } else {
            0.0
        },
        avg_generation_time_ms: avg_ms.unwrap_or(0.0),
    })
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use super::*;
    use crate::storage::{logins, processes, prompts, users};

    /// Seeded graph of one user, one login, one prompt, and one process.
    pub struct Fixture {
        pub user_id: String,
        pub login_id: String,
        pub prompt_id: String,
        pub process_id: String,
    }

    pub async fn seed(pool: &DbPool) -> Fixture {
        let hash = users::hash_password("pw").expect("hash");
        let user = users::create_user(pool, "owner@example.ch", &hash)
            .await
            .expect("user");
        let login = logins::create_login(pool, &user.id, "A", "u", "p", false)
            .await
            .expect("login");
        let prompt = prompts::create_system_template(pool, "S", None, "s", "u {article_title}")
            .await
            .expect("prompt");
        let process = processes::create_process(
            pool,
            &processes::NewProcess {
                user_id: user.id.clone(),
                name: "P".to_string(),
                description: None,
                category_filter: None,
                task_filter: None,
                tab_filter: Some("alle".to_string()),
                search_filter: None,
                sort_option: None,
                max_duration_minutes: 60,
                generate_only: false,
                hide_comments: false,
                llm_provider_id: None,
            },
        )
        .await
        .expect("process");

        Fixture {
            user_id: user.id,
            login_id: login.id,
            prompt_id: prompt.id,
            process_id: process.id,
        }
    }

    pub fn discovered(fixture: &Fixture, article_id: &str) -> NewDiscoveredComment {
        NewDiscoveredComment {
            mymoment_article_id: article_id.to_string(),
            user_id: fixture.user_id.clone(),
            mymoment_login_id: fixture.login_id.clone(),
            monitoring_process_id: fixture.process_id.clone(),
            prompt_template_id: fixture.prompt_id.clone(),
            llm_provider_id: None,
            article_title: "Titel".to_string(),
            article_author: "Autor".to_string(),
            article_category: Some(4),
            article_task_id: None,
            article_url: format!("https://platform.example/article/{article_id}/"),
            is_hidden: false,
        }
    }
}
