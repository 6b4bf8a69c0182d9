//! CRUD operations for users and hashed session-token tracking.
//!
//! Passwords are stored as bcrypt hashes. Session tokens (JWTs issued by the
//! out-of-scope API layer) are tracked only as SHA-256 hashes so a database
//! leak never exposes a usable token.

use sha2::{Digest, Sha256};

use super::{new_id, now_string, DbPool};
use crate::error::StorageError;

/// A registered user.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct User {
    pub id: String,
    pub email: String,
    pub password_hash: String,
    pub is_active: bool,
    pub is_verified: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// Bcrypt cost factor for password hashing.
const BCRYPT_COST: u32 = 12;

/// Hash a plaintext password for storage.
pub fn hash_password(password: &str) -> Result<String, StorageError> {
    bcrypt::hash(password, BCRYPT_COST).map_err(|e| StorageError::Query {
        source: sqlx::Error::Protocol(format!("password hashing failed: {e}")),
    })
}

/// Verify a plaintext password against a stored hash.
pub fn verify_password(password: &str, hash: &str) -> bool {
    bcrypt::verify(password, hash).unwrap_or(false)
}

/// Hash a session token for storage and lookup.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Create a new user. The email must be unique.
pub async fn create_user(
    pool: &DbPool,
    email: &str,
    password_hash: &str,
) -> Result<User, StorageError> {
    let id = new_id();
    let now = now_string();

    sqlx::query(
        "INSERT INTO users (id, email, password_hash, is_active, is_verified, created_at, updated_at) \
         VALUES (?, ?, ?, 1, 0, ?, ?)",
    )
    .bind(&id)
    .bind(email)
    .bind(password_hash)
    .bind(&now)
    .bind(&now)
    .execute(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;

    get_user(pool, &id)
        .await?
        .ok_or_else(|| StorageError::Query {
            source: sqlx::Error::RowNotFound,
        })
}

/// Fetch a user by id.
pub async fn get_user(pool: &DbPool, user_id: &str) -> Result<Option<User>, StorageError> {
    sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_optional(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })
}

/// Fetch a user by email.
pub async fn get_user_by_email(pool: &DbPool, email: &str) -> Result<Option<User>, StorageError> {
    sqlx::query_as::<_, User>("SELECT * FROM users WHERE email = ?")
        .bind(email)
        .fetch_optional(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })
}

/// Record a session token hash for a user.
pub async fn create_user_session(
    pool: &DbPool,
    user_id: &str,
    token: &str,
    expires_at: &str,
) -> Result<String, StorageError> {
    let id = new_id();
    sqlx::query(
        "INSERT INTO user_sessions (id, user_id, token_hash, expires_at, created_at) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(user_id)
    .bind(hash_token(token))
    .bind(expires_at)
    .bind(now_string())
    .execute(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;
    Ok(id)
}

/// Delete expired session rows. Returns how many were removed.
pub async fn delete_expired_user_sessions(pool: &DbPool, now: &str) -> Result<u64, StorageError> {
    let result = sqlx::query("DELETE FROM user_sessions WHERE expires_at <= ?")
        .bind(now)
        .execute(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })?;
    Ok(result.rows_affected())
}
