//! CRUD operations for platform logins.
//!
//! Credentials are stored encrypted; this module never sees plaintext. The
//! hard-delete guard lives here: a login with active sessions or monitoring
//! process references cannot be removed.

use super::{new_id, now_string, DbPool};
use crate::error::StorageError;

/// A stored platform credential pair (encrypted at rest).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PlatformLogin {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub username_encrypted: String,
    pub password_encrypted: String,
    pub is_admin: bool,
    pub is_active: bool,
    pub last_used: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Create a login. `name` must be unique per user and non-empty.
pub async fn create_login(
    pool: &DbPool,
    user_id: &str,
    name: &str,
    username_encrypted: &str,
    password_encrypted: &str,
    is_admin: bool,
) -> Result<PlatformLogin, StorageError> {
    let id = new_id();
    let now = now_string();

    sqlx::query(
        "INSERT INTO platform_logins \
         (id, user_id, name, username_encrypted, password_encrypted, is_admin, is_active, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, 1, ?, ?)",
    )
    .bind(&id)
    .bind(user_id)
    .bind(name)
    .bind(username_encrypted)
    .bind(password_encrypted)
    .bind(is_admin)
    .bind(&now)
    .bind(&now)
    .execute(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;

    get_login(pool, &id)
        .await?
        .ok_or_else(|| StorageError::Query {
            source: sqlx::Error::RowNotFound,
        })
}

/// Fetch a login by id.
pub async fn get_login(pool: &DbPool, login_id: &str) -> Result<Option<PlatformLogin>, StorageError> {
    sqlx::query_as::<_, PlatformLogin>("SELECT * FROM platform_logins WHERE id = ?")
        .bind(login_id)
        .fetch_optional(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })
}

/// Fetch a login by id, scoped to its owner.
pub async fn get_login_for_user(
    pool: &DbPool,
    login_id: &str,
    user_id: &str,
) -> Result<Option<PlatformLogin>, StorageError> {
    sqlx::query_as::<_, PlatformLogin>(
        "SELECT * FROM platform_logins WHERE id = ? AND user_id = ?",
    )
    .bind(login_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })
}

/// List a user's logins, active first, newest first.
pub async fn list_logins_for_user(
    pool: &DbPool,
    user_id: &str,
) -> Result<Vec<PlatformLogin>, StorageError> {
    sqlx::query_as::<_, PlatformLogin>(
        "SELECT * FROM platform_logins WHERE user_id = ? ORDER BY is_active DESC, created_at DESC",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })
}

/// Update a login's credentials (already encrypted by the caller).
pub async fn update_credentials(
    pool: &DbPool,
    login_id: &str,
    username_encrypted: &str,
    password_encrypted: &str,
) -> Result<(), StorageError> {
    sqlx::query(
        "UPDATE platform_logins \
         SET username_encrypted = ?, password_encrypted = ?, updated_at = ? WHERE id = ?",
    )
    .bind(username_encrypted)
    .bind(password_encrypted)
    .bind(now_string())
    .bind(login_id)
    .execute(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;
    Ok(())
}

/// Record that a login was used. `last_used` only ever moves forward.
pub async fn touch_last_used(pool: &DbPool, login_id: &str) -> Result<(), StorageError> {
    let now = now_string();
    sqlx::query(
        "UPDATE platform_logins SET last_used = ? \
         WHERE id = ? AND (last_used IS NULL OR last_used < ?)",
    )
    .bind(&now)
    .bind(login_id)
    .bind(&now)
    .execute(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;
    Ok(())
}

/// Deactivate a login so it is no longer selectable for new sessions.
pub async fn deactivate_login(pool: &DbPool, login_id: &str) -> Result<(), StorageError> {
    sqlx::query("UPDATE platform_logins SET is_active = 0, updated_at = ? WHERE id = ?")
        .bind(now_string())
        .bind(login_id)
        .execute(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })?;
    Ok(())
}

/// Whether the login currently has active, unexpired platform sessions.
pub async fn has_active_sessions(pool: &DbPool, login_id: &str) -> Result<bool, StorageError> {
    let count: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM platform_sessions \
         WHERE mymoment_login_id = ? AND is_active = 1 AND expires_at > ?",
    )
    .bind(login_id)
    .bind(now_string())
    .fetch_one(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;
    Ok(count.0 > 0)
}

/// Whether any monitoring process still references the login.
pub async fn is_referenced_by_process(
    pool: &DbPool,
    login_id: &str,
) -> Result<bool, StorageError> {
    let count: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM monitoring_process_logins WHERE mymoment_login_id = ? AND is_active = 1",
    )
    .bind(login_id)
    .fetch_one(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;
    Ok(count.0 > 0)
}

/// Hard-delete a login.
///
/// Refuses while the login has active sessions or is referenced by a
/// monitoring process; returns `Ok(false)` in that case.
pub async fn delete_login(pool: &DbPool, login_id: &str) -> Result<bool, StorageError> {
    if has_active_sessions(pool, login_id).await? || is_referenced_by_process(pool, login_id).await?
    {
        return Ok(false);
    }

    sqlx::query("DELETE FROM platform_logins WHERE id = ?")
        .bind(login_id)
        .execute(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })?;
    Ok(true)
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
    async fn create_and_fetch_login() {
        let pool = init_test_db().await.expect("init db");
        let user_id = seed_user(&pool).await;

        let login = create_login(&pool, &user_id, "Klasse 3a", "enc-user", "enc-pass", false)
            .await
            .expect("create");
        assert_eq!(login.name, "Klasse 3a");
        assert!(!login.is_admin);
        assert!(login.is_active);
        assert!(login.last_used.is_none());
    }

    #[tokio::test]
    async fn name_unique_per_user() {
        let pool = init_test_db().await.expect("init db");
        let user_id = seed_user(&pool).await;

        create_login(&pool, &user_id, "A", "u", "p", false)
            .await
            .expect("first");
        assert!(create_login(&pool, &user_id, "A", "u", "p", false)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn empty_name_rejected() {
        let pool = init_test_db().await.expect("init db");
        let user_id = seed_user(&pool).await;
        assert!(create_login(&pool, &user_id, "", "u", "p", false).await.is_err());
    }

    #[tokio::test]
    async fn last_used_is_monotonic() {
        let pool = init_test_db().await.expect("init db");
        let user_id = seed_user(&pool).await;
        let login = create_login(&pool, &user_id, "A", "u", "p", false)
            .await
            .expect("login");

        touch_last_used(&pool, &login.id).await.expect("touch");
        let first = get_login(&pool, &login.id)
            .await
            .expect("get")
            .expect("found")
            .last_used
            .expect("set");

        // A manual attempt to move last_used backwards is ignored.
        sqlx::query(
            "UPDATE platform_logins SET last_used = ? WHERE id = ? AND (last_used IS NULL OR last_used < ?)",
        )
        .bind("2000-01-01T00:00:00+00:00")
        .bind(&login.id)
        .bind("2000-01-01T00:00:00+00:00")
        .execute(&pool)
        .await
        .expect("update");

        let after = get_login(&pool, &login.id)
            .await
            .expect("get")
            .expect("found")
            .last_used
            .expect("still set");
        assert_eq!(after, first);
    }

    #[tokio::test]
    async fn delete_guard_blocks_with_active_session() {
        let pool = init_test_db().await.expect("init db");
        let user_id = seed_user(&pool).await;
        let login = create_login(&pool, &user_id, "A", "u", "p", false)
            .await
            .expect("login");

        crate::storage::sessions::insert_session(
            &pool,
            &login.id,
            "blob",
            "2999-01-01T00:00:00+00:00",
        )
        .await
        .expect("session");

        assert!(!delete_login(&pool, &login.id).await.expect("guarded"));

        crate::storage::sessions::deactivate_sessions_for_login(&pool, &login.id)
            .await
            .expect("deactivate");
        assert!(delete_login(&pool, &login.id).await.expect("deleted"));
    }
}
