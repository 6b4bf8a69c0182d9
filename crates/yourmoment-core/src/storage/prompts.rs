//! CRUD operations for prompt templates.
//!
//! Templates come in two categories: SYSTEM templates (owned by nobody,
//! usable by everyone) and USER templates (owned by one user). The category
//! consistency rule is enforced by a table CHECK constraint.

use super::{new_id, now_string, DbPool};
use crate::error::StorageError;

/// A prompt template for comment generation.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PromptTemplateRow {
    pub id: String,
    pub user_id: Option<String>,
    pub name: String,
    pub description: Option<String>,
    pub system_prompt: String,
    pub user_prompt_template: String,
    pub category: String,
    pub is_active: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// Create a SYSTEM template (no owner).
pub async fn create_system_template(
    pool: &DbPool,
    name: &str,
    description: Option<&str>,
    system_prompt: &str,
    user_prompt_template: &str,
) -> Result<PromptTemplateRow, StorageError> {
    insert_template(pool, None, name, description, system_prompt, user_prompt_template, "SYSTEM")
        .await
}

/// Create a USER template owned by `user_id`.
pub async fn create_user_template(
    pool: &DbPool,
    user_id: &str,
    name: &str,
    description: Option<&str>,
    system_prompt: &str,
    user_prompt_template: &str,
) -> Result<PromptTemplateRow, StorageError> {
    insert_template(
        pool,
        Some(user_id),
        name,
        description,
        system_prompt,
        user_prompt_template,
        "USER",
    )
    .await
}

async fn insert_template(
    pool: &DbPool,
    user_id: Option<&str>,
    name: &str,
    description: Option<&str>,
    system_prompt: &str,
    user_prompt_template: &str,
    category: &str,
) -> Result<PromptTemplateRow, StorageError> {
    let id = new_id();
    let now = now_string();

    sqlx::query(
        "INSERT INTO prompt_templates \
         (id, user_id, name, description, system_prompt, user_prompt_template, category, is_active, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?, ?)",
    )
    .bind(&id)
    .bind(user_id)
    .bind(name)
    .bind(description)
    .bind(system_prompt)
    .bind(user_prompt_template)
    .bind(category)
    .bind(&now)
    .bind(&now)
    .execute(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;

    get_template(pool, &id)
        .await?
        .ok_or_else(|| StorageError::Query {
            source: sqlx::Error::RowNotFound,
        })
}

/// Fetch a template by id.
pub async fn get_template(
    pool: &DbPool,
    template_id: &str,
) -> Result<Option<PromptTemplateRow>, StorageError> {
    sqlx::query_as::<_, PromptTemplateRow>("SELECT * FROM prompt_templates WHERE id = ?")
        .bind(template_id)
        .fetch_optional(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })
}

/// Fetch a template accessible to a user: their own USER templates or any
/// SYSTEM template.
pub async fn get_accessible_template(
    pool: &DbPool,
    template_id: &str,
    user_id: &str,
) -> Result<Option<PromptTemplateRow>, StorageError> {
    sqlx::query_as::<_, PromptTemplateRow>(
        "SELECT * FROM prompt_templates \
         WHERE id = ? AND is_active = 1 \
           AND (category = 'SYSTEM' OR (category = 'USER' AND user_id = ?))",
    )
    .bind(template_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })
}

/// List the templates a user can attach to a monitoring process.
pub async fn list_accessible_templates(
    pool: &DbPool,
    user_id: &str,
) -> Result<Vec<PromptTemplateRow>, StorageError> {
    sqlx::query_as::<_, PromptTemplateRow>(
        "SELECT * FROM prompt_templates \
         WHERE is_active = 1 AND (category = 'SYSTEM' OR user_id = ?) \
         ORDER BY category DESC, created_at DESC",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })
}

/// Seed the default SYSTEM template if no SYSTEM template exists yet.
///
/// Returns the id of the default template (existing or newly created).
pub async fn seed_default_template(pool: &DbPool) -> Result<String, StorageError> {
    let existing: Option<(String,)> = sqlx::query_as(
        "SELECT id FROM prompt_templates WHERE category = 'SYSTEM' AND is_active = 1 LIMIT 1",
    )
    .fetch_optional(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;

    if let Some((id,)) = existing {
        return Ok(id);
    }

    let template = create_system_template(
        pool,
        "Standard-Kommentargenerator",
        Some("Systemvorlage für konstruktive deutsche Kommentare"),
        "Du bist ein hilfreicher KI-Assistent, der konstruktive und höfliche Kommentare \
         zu deutschen Texten verfasst. Deine Aufgabe ist es, einen kurzen, relevanten \
         Kommentar zu schreiben, der den Inhalt würdigt oder eine hilfreiche Frage stellt. \
         Der Kommentar soll freundlich, respektvoll und auf Deutsch verfasst sein.",
        "Bitte verfasse einen kurzen Kommentar zu folgendem Artikel:\n\n\
         Titel: {article_title}\n\
         Autor: {article_author}\n\
         Inhalt: {article_content}\n\n\
         Der Kommentar soll konstruktiv und freundlich sein.",
    )
    .await?;

    tracing::info!(template_id = %template.id, "seeded default prompt template");
    Ok(template.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{init_test_db, users};

    async fn seed_user(pool: &DbPool) -> String {
        let hash = users::hash_password("pw").expect("hash");
        users::create_user(pool, "owner@example.ch", &hash)
            .await
            .expect("user")
            .id
    }

    #[tokio::test]
    async fn system_template_has_no_owner() {
        let pool = init_test_db().await.expect("init db");
        let template = create_system_template(&pool, "Standard", None, "sys", "user {article_title}")
            .await
            .expect("create");
        assert_eq!(template.category, "SYSTEM");
        assert!(template.user_id.is_none());
    }

    #[tokio::test]
    async fn user_template_requires_owner() {
        let pool = init_test_db().await.expect("init db");
        let user_id = seed_user(&pool).await;

        let template = create_user_template(&pool, &user_id, "Meine Vorlage", None, "sys", "user")
            .await
            .expect("create");
        assert_eq!(template.category, "USER");
        assert_eq!(template.user_id.as_deref(), Some(user_id.as_str()));

        // The category consistency constraint rejects a USER template with no
        // owner.
        let result = sqlx::query(
            "INSERT INTO prompt_templates \
             (id, user_id, name, system_prompt, user_prompt_template, category, is_active, created_at, updated_at) \
             VALUES ('x', NULL, 'bad', 's', 'u', 'USER', 1, '2024-01-01T00:00:00+00:00', '2024-01-01T00:00:00+00:00')",
        )
        .execute(&pool)
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn accessibility_rules() {
        let pool = init_test_db().await.expect("init db");
        let owner = seed_user(&pool).await;
        let hash = users::hash_password("pw").expect("hash");
        let other = users::create_user(&pool, "other@example.ch", &hash)
            .await
            .expect("other")
            .id;

        let system = create_system_template(&pool, "S", None, "s", "u").await.expect("sys");
        let user_template = create_user_template(&pool, &owner, "U", None, "s", "u")
            .await
            .expect("user");

        // System templates are accessible to everyone.
        assert!(get_accessible_template(&pool, &system.id, &other)
            .await
            .expect("query")
            .is_some());
        // User templates only to their owner.
        assert!(get_accessible_template(&pool, &user_template.id, &owner)
            .await
            .expect("query")
            .is_some());
        assert!(get_accessible_template(&pool, &user_template.id, &other)
            .await
            .expect("query")
            .is_none());
    }

    #[tokio::test]
    async fn seed_default_is_idempotent() {
        let pool = init_test_db().await.expect("init db");
        let first = seed_default_template(&pool).await.expect("first");
        let second = seed_default_template(&pool).await.expect("second");
        assert_eq!(first, second);

        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM prompt_templates WHERE category = 'SYSTEM'")
                .fetch_one(&pool)
                .await
                .expect("count");
        assert_eq!(count.0, 1);
    }
}
