//! CRUD operations for platform session rows.
//!
//! Invariant: at most one active, non-expired session per login. Creation
//! deactivates prior sessions inside the same transaction; the sweep
//! deactivates expired rows instead of deleting them so the history stays
//! auditable.

use super::{new_id, now_string, DbPool};
use crate::error::StorageError;

/// A persisted platform session (session data encrypted at rest).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PlatformSessionRow {
    pub id: String,
    pub mymoment_login_id: String,
    pub session_data_encrypted: String,
    pub expires_at: String,
    pub is_active: bool,
    pub last_accessed: String,
    pub created_at: String,
}

/// Fetch the active, non-expired session for a login, if any.
pub async fn get_active_session(
    pool: &DbPool,
    login_id: &str,
) -> Result<Option<PlatformSessionRow>, StorageError> {
    sqlx::query_as::<_, PlatformSessionRow>(
        "SELECT * FROM platform_sessions \
         WHERE mymoment_login_id = ? AND is_active = 1 AND expires_at > ? \
         ORDER BY created_at DESC LIMIT 1",
    )
    .bind(login_id)
    .bind(now_string())
    .fetch_optional(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })
}

/// Insert a new session, deactivating any prior sessions for the login in
/// the same transaction so the one-active-session invariant holds.
pub async fn insert_session(
    pool: &DbPool,
    login_id: &str,
    session_data_encrypted: &str,
    expires_at: &str,
) -> Result<PlatformSessionRow, StorageError> {
    let id = new_id();
    let now = now_string();

    let mut tx = pool
        .begin()
        .await
        .map_err(|e| StorageError::Connection { source: e })?;

    sqlx::query("UPDATE platform_sessions SET is_active = 0 WHERE mymoment_login_id = ?")
        .bind(login_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| StorageError::Query { source: e })?;

    sqlx::query(
        "INSERT INTO platform_sessions \
         (id, mymoment_login_id, session_data_encrypted, expires_at, is_active, last_accessed, created_at) \
         VALUES (?, ?, ?, ?, 1, ?, ?)",
    )
    .bind(&id)
    .bind(login_id)
    .bind(session_data_encrypted)
    .bind(expires_at)
    .bind(&now)
    .bind(&now)
    .execute(&mut *tx)
    .await
    .map_err(|e| StorageError::Query { source: e })?;

    tx.commit()
        .await
        .map_err(|e| StorageError::Connection { source: e })?;

    sqlx::query_as::<_, PlatformSessionRow>("SELECT * FROM platform_sessions WHERE id = ?")
        .bind(&id)
        .fetch_one(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })
}

/// Update the stored session blob (e.g. after a cookie refresh).
pub async fn update_session_data(
    pool: &DbPool,
    session_id: &str,
    session_data_encrypted: &str,
) -> Result<(), StorageError> {
    sqlx::query(
        "UPDATE platform_sessions SET session_data_encrypted = ?, last_accessed = ? WHERE id = ?",
    )
    .bind(session_data_encrypted)
    .bind(now_string())
    .bind(session_id)
    .execute(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;
    Ok(())
}

/// Touch a session's `last_accessed` timestamp.
pub async fn touch_last_accessed(pool: &DbPool, session_id: &str) -> Result<(), StorageError> {
    sqlx::query("UPDATE platform_sessions SET last_accessed = ? WHERE id = ?")
        .bind(now_string())
        .bind(session_id)
        .execute(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })?;
    Ok(())
}

/// Extend a session's expiry (renewal).
pub async fn renew_session(
    pool: &DbPool,
    session_id: &str,
    expires_at: &str,
) -> Result<(), StorageError> {
    sqlx::query(
        "UPDATE platform_sessions SET expires_at = ?, last_accessed = ? WHERE id = ?",
    )
    .bind(expires_at)
    .bind(now_string())
    .bind(session_id)
    .execute(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;
    Ok(())
}

/// Deactivate every session for a login.
pub async fn deactivate_sessions_for_login(
    pool: &DbPool,
    login_id: &str,
) -> Result<u64, StorageError> {
    let result =
        sqlx::query("UPDATE platform_sessions SET is_active = 0 WHERE mymoment_login_id = ?")
            .bind(login_id)
            .execute(pool)
            .await
            .map_err(|e| StorageError::Query { source: e })?;
    Ok(result.rows_affected())
}

/// Deactivate all expired sessions. Returns how many were swept.
pub async fn sweep_expired(pool: &DbPool) -> Result<u64, StorageError> {
    let result = sqlx::query(
        "UPDATE platform_sessions SET is_active = 0 WHERE is_active = 1 AND expires_at <= ?",
    )
    .bind(now_string())
    .execute(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;
    Ok(result.rows_affected())
}

/// Count active, non-expired sessions for a login (test and audit helper).
pub async fn count_active_for_login(pool: &DbPool, login_id: &str) -> Result<i64, StorageError> {
    let count: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM platform_sessions \
         WHERE mymoment_login_id = ? AND is_active = 1 AND expires_at > ?",
    )
    .bind(login_id)
    .bind(now_string())
    .fetch_one(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;
    Ok(count.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{init_test_db, logins, users};

    async fn seed_login(pool: &DbPool) -> String {
        let hash = users::hash_password("pw").expect("hash");
        let user = users::create_user(pool, "owner@example.ch", &hash)
            .await
            .expect("user");
        logins::create_login(pool, &user.id, "A", "u", "p", false)
            .await
            .expect("login")
            .id
    }

    #[tokio::test]
    async fn at_most_one_active_session_per_login() {
        let pool = init_test_db().await.expect("init db");
        let login_id = seed_login(&pool).await;

        insert_session(&pool, &login_id, "blob1", "2999-01-01T00:00:00+00:00")
            .await
            .expect("first");
        insert_session(&pool, &login_id, "blob2", "2999-01-01T00:00:00+00:00")
            .await
            .expect("second");
        insert_session(&pool, &login_id, "blob3", "2999-01-01T00:00:00+00:00")
            .await
            .expect("third");

        assert_eq!(count_active_for_login(&pool, &login_id).await.expect("count"), 1);

        let active = get_active_session(&pool, &login_id)
            .await
            .expect("query")
            .expect("one active");
        assert_eq!(active.session_data_encrypted, "blob3");
    }

    #[tokio::test]
    async fn expired_sessions_are_not_returned() {
        let pool = init_test_db().await.expect("init db");
        let login_id = seed_login(&pool).await;

        insert_session(&pool, &login_id, "blob", "2000-01-01T00:00:00+00:00")
            .await
            .expect("expired session");

        assert!(get_active_session(&pool, &login_id)
            .await
            .expect("query")
            .is_none());
    }

    #[tokio::test]
    async fn sweep_deactivates_but_keeps_rows() {
        let pool = init_test_db().await.expect("init db");
        let login_id = seed_login(&pool).await;

        insert_session(&pool, &login_id, "blob", "2000-01-01T00:00:00+00:00")
            .await
            .expect("expired session");

        let swept = sweep_expired(&pool).await.expect("sweep");
        assert_eq!(swept, 1);

        // The row still exists for audit, just deactivated.
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM platform_sessions")
            .fetch_one(&pool)
            .await
            .expect("count");
        assert_eq!(count.0, 1);
    }

    #[tokio::test]
    async fn renew_extends_expiry() {
        let pool = init_test_db().await.expect("init db");
        let login_id = seed_login(&pool).await;

        let session = insert_session(&pool, &login_id, "blob", "2099-01-01T00:00:00+00:00")
            .await
            .expect("session");
        renew_session(&pool, &session.id, "2100-01-01T00:00:00+00:00")
            .await
            .expect("renew");

        let refreshed = get_active_session(&pool, &login_id)
            .await
            .expect("query")
            .expect("active");
        assert_eq!(refreshed.expires_at, "2100-01-01T00:00:00+00:00");
    }
}
