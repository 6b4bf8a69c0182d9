//! CRUD operations for LLM provider configurations.
//!
//! API keys are stored encrypted; decryption happens in the LLM gateway just
//! before client construction and the plaintext never outlives the call.

use super::{new_id, now_string, DbPool};
use crate::error::StorageError;

/// Provider names accepted by the gateway.
pub const SUPPORTED_PROVIDERS: &[&str] = &["openai", "mistral"];

/// A per-user LLM provider configuration (API key encrypted at rest).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LlmProviderRow {
    pub id: String,
    pub user_id: String,
    pub provider_name: String,
    pub api_key_encrypted: String,
    pub model_name: String,
    pub max_tokens: Option<i64>,
    pub temperature: Option<f64>,
    pub is_active: bool,
    pub last_used: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Create a provider configuration.
pub async fn create_provider(
    pool: &DbPool,
    user_id: &str,
    provider_name: &str,
    api_key_encrypted: &str,
    model_name: &str,
    max_tokens: Option<i64>,
    temperature: Option<f64>,
) -> Result<LlmProviderRow, StorageError> {
    let id = new_id();
    let now = now_string();

    sqlx::query(
        "INSERT INTO llm_providers \
         (id, user_id, provider_name, api_key_encrypted, model_name, max_tokens, temperature, is_active, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?, ?)",
    )
    .bind(&id)
    .bind(user_id)
    .bind(provider_name)
    .bind(api_key_encrypted)
    .bind(model_name)
    .bind(max_tokens)
    .bind(temperature)
    .bind(&now)
    .bind(&now)
    .execute(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;

    get_provider(pool, &id)
        .await?
        .ok_or_else(|| StorageError::Query {
            source: sqlx::Error::RowNotFound,
        })
}

/// Fetch a provider by id.
pub async fn get_provider(
    pool: &DbPool,
    provider_id: &str,
) -> Result<Option<LlmProviderRow>, StorageError> {
    sqlx::query_as::<_, LlmProviderRow>("SELECT * FROM llm_providers WHERE id = ?")
        .bind(provider_id)
        .fetch_optional(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })
}

/// Fetch a provider by id, scoped to its owner.
pub async fn get_provider_for_user(
    pool: &DbPool,
    provider_id: &str,
    user_id: &str,
) -> Result<Option<LlmProviderRow>, StorageError> {
    sqlx::query_as::<_, LlmProviderRow>(
        "SELECT * FROM llm_providers WHERE id = ? AND user_id = ?",
    )
    .bind(provider_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })
}

/// List a user's active providers, newest first.
pub async fn list_active_providers(
    pool: &DbPool,
    user_id: &str,
) -> Result<Vec<LlmProviderRow>, StorageError> {
    sqlx::query_as::<_, LlmProviderRow>(
        "SELECT * FROM llm_providers WHERE user_id = ? AND is_active = 1 ORDER BY created_at DESC",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })
}

/// Record that a provider was used for generation.
pub async fn touch_last_used(pool: &DbPool, provider_id: &str) -> Result<(), StorageError> {
    sqlx::query("UPDATE llm_providers SET last_used = ? WHERE id = ?")
        .bind(now_string())
        .bind(provider_id)
        .execute(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })?;
    Ok(())
}

/// Deactivate a provider configuration.
pub async fn deactivate_provider(pool: &DbPool, provider_id: &str) -> Result<(), StorageError> {
    sqlx::query("UPDATE llm_providers SET is_active = 0, updated_at = ? WHERE id = ?")
        .bind(now_string())
        .bind(provider_id)
        .execute(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })?;
    Ok(())
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
    async fn create_and_list_providers() {
        let pool = init_test_db().await.expect("init db");
        let user_id = seed_user(&pool).await;

        create_provider(&pool, &user_id, "openai", "enc-key", "gpt-4.1", Some(400), Some(0.7))
            .await
            .expect("openai");
        create_provider(
            &pool,
            &user_id,
            "mistral",
            "enc-key2",
            "mistral-small-latest",
            None,
            None,
        )
        .await
        .expect("mistral");

        let providers = list_active_providers(&pool, &user_id).await.expect("list");
        assert_eq!(providers.len(), 2);
    }

    #[tokio::test]
    async fn unsupported_provider_name_rejected() {
        let pool = init_test_db().await.expect("init db");
        let user_id = seed_user(&pool).await;
        assert!(
            create_provider(&pool, &user_id, "huggingface", "k", "m", None, None)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn temperature_out_of_range_rejected() {
        let pool = init_test_db().await.expect("init db");
        let user_id = seed_user(&pool).await;
        assert!(
            create_provider(&pool, &user_id, "openai", "k", "m", None, Some(1.5))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn inactive_providers_not_listed() {
        let pool = init_test_db().await.expect("init db");
        let user_id = seed_user(&pool).await;
        let provider = create_provider(&pool, &user_id, "openai", "k", "m", None, None)
            .await
            .expect("provider");

        deactivate_provider(&pool, &provider.id).await.expect("deactivate");
        assert!(list_active_providers(&pool, &user_id)
            .await
            .expect("list")
            .is_empty());
    }

    #[tokio::test]
    async fn ownership_scoping() {
        let pool = init_test_db().await.expect("init db");
        let user_id = seed_user(&pool).await;
        let hash = users::hash_password("pw").expect("hash");
        let other = users::create_user(&pool, "other@example.ch", &hash)
            .await
            .expect("other");

        let provider = create_provider(&pool, &user_id, "openai", "k", "m", None, None)
            .await
            .expect("provider");

        assert!(get_provider_for_user(&pool, &provider.id, &other.id)
            .await
            .expect("query")
            .is_none());
    }
}
