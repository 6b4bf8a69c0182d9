//! CRUD operations for tracked students and article versions.
//!
//! Version rows carry a SHA-256 content hash and a per-article monotonic
//! version number. The active-version cap is enforced by the versioning
//! service; this module provides the primitives.

use super::{new_id, now_string, DbPool};
use crate::error::StorageError;

/// A student whose articles are periodically snapshotted.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TrackedStudentRow {
    pub id: String,
    pub user_id: String,
    pub admin_login_id: String,
    pub student_name: String,
    pub content_changes_only: bool,
    pub last_backup_at: Option<String>,
    pub is_active: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// One snapshot of a student's article.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ArticleVersionRow {
    pub id: String,
    pub user_id: String,
    pub tracked_student_id: String,
    pub mymoment_article_id: String,
    pub version_number: i64,
    pub article_title: String,
    pub article_url: String,
    pub article_content: String,
    pub article_raw_html: String,
    pub content_hash: String,
    pub scraped_at: String,
    pub is_active: bool,
}

/// Create a tracked student. The admin flag on the login is validated by the
/// versioning service.
pub async fn create_tracked_student(
    pool: &DbPool,
    user_id: &str,
    admin_login_id: &str,
    student_name: &str,
    content_changes_only: bool,
) -> Result<TrackedStudentRow, StorageError> {
    let id = new_id();
    let now = now_string();

    sqlx::query(
        "INSERT INTO tracked_students \
         (id, user_id, admin_login_id, student_name, content_changes_only, is_active, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, 1, ?, ?)",
    )
    .bind(&id)
    .bind(user_id)
    .bind(admin_login_id)
    .bind(student_name)
    .bind(content_changes_only)
    .bind(&now)
    .bind(&now)
    .execute(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;

    get_tracked_student(pool, &id)
        .await?
        .ok_or_else(|| StorageError::Query {
            source: sqlx::Error::RowNotFound,
        })
}

/// Fetch a tracked student by id.
pub async fn get_tracked_student(
    pool: &DbPool,
    student_id: &str,
) -> Result<Option<TrackedStudentRow>, StorageError> {
    sqlx::query_as::<_, TrackedStudentRow>("SELECT * FROM tracked_students WHERE id = ?")
        .bind(student_id)
        .fetch_optional(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })
}

/// List a user's active tracked students.
pub async fn list_tracked_students(
    pool: &DbPool,
    user_id: &str,
) -> Result<Vec<TrackedStudentRow>, StorageError> {
    sqlx::query_as::<_, TrackedStudentRow>(
        "SELECT * FROM tracked_students WHERE user_id = ? AND is_active = 1 ORDER BY created_at",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })
}

/// Stamp the student's last successful backup time.
pub async fn touch_last_backup(pool: &DbPool, student_id: &str) -> Result<(), StorageError> {
    sqlx::query("UPDATE tracked_students SET last_backup_at = ?, updated_at = ? WHERE id = ?")
        .bind(now_string())
        .bind(now_string())
        .bind(student_id)
        .execute(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })?;
    Ok(())
}

/// The latest active version of an article, if any.
pub async fn latest_active_version(
    pool: &DbPool,
    student_id: &str,
    article_id: &str,
) -> Result<Option<ArticleVersionRow>, StorageError> {
    sqlx::query_as::<_, ArticleVersionRow>(
        "SELECT * FROM article_versions \
         WHERE tracked_student_id = ? AND mymoment_article_id = ? AND is_active = 1 \
         ORDER BY version_number DESC LIMIT 1",
    )
    .bind(student_id)
    .bind(article_id)
    .fetch_optional(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })
}

/// The highest version number ever assigned for an article (active or not).
pub async fn max_version_number(
    pool: &DbPool,
    student_id: &str,
    article_id: &str,
) -> Result<i64, StorageError> {
    let row: (Option<i64>,) = sqlx::query_as(
        "SELECT MAX(version_number) FROM article_versions \
         WHERE tracked_student_id = ? AND mymoment_article_id = ?",
    )
    .bind(student_id)
    .bind(article_id)
    .fetch_one(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;
    Ok(row.0.unwrap_or(0))
}

/// Insert a new version row.
#[allow(clippy::too_many_arguments)]
pub async fn insert_version(
    pool: &DbPool,
    user_id: &str,
    student_id: &str,
    article_id: &str,
    version_number: i64,
    title: &str,
    url: &str,
    content: &str,
    raw_html: &str,
    content_hash: &str,
) -> Result<ArticleVersionRow, StorageError> {
    let id = new_id();

    sqlx::query(
        "INSERT INTO article_versions \
         (id, user_id, tracked_student_id, mymoment_article_id, version_number, article_title, \
          article_url, article_content, article_raw_html, content_hash, scraped_at, is_active) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1)",
    )
    .bind(&id)
    .bind(user_id)
    .bind(student_id)
    .bind(article_id)
    .bind(version_number)
    .bind(title)
    .bind(url)
    .bind(content)
    .bind(raw_html)
    .bind(content_hash)
    .bind(now_string())
    .execute(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;

    sqlx::query_as::<_, ArticleVersionRow>("SELECT * FROM article_versions WHERE id = ?")
        .bind(&id)
        .fetch_one(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })
}

/// Count active versions for an article.
pub async fn active_version_count(
    pool: &DbPool,
    student_id: &str,
    article_id: &str,
) -> Result<i64, StorageError> {
    let count: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM article_versions \
         WHERE tracked_student_id = ? AND mymoment_article_id = ? AND is_active = 1",
    )
    .bind(student_id)
    .bind(article_id)
    .fetch_one(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;
    Ok(count.0)
}

/// Soft-delete the oldest active versions until at most `max_versions`
/// remain. Returns how many were deactivated.
pub async fn enforce_version_cap(
    pool: &DbPool,
    student_id: &str,
    article_id: &str,
    max_versions: i64,
) -> Result<u64, StorageError> {
    let result = sqlx::query(
        "UPDATE article_versions SET is_active = 0 \
         WHERE id IN ( \
             SELECT id FROM article_versions \
             WHERE tracked_student_id = ? AND mymoment_article_id = ? AND is_active = 1 \
             ORDER BY version_number ASC \
             LIMIT MAX(0, ( \
                 SELECT COUNT(*) FROM article_versions \
                 WHERE tracked_student_id = ? AND mymoment_article_id = ? AND is_active = 1 \
             ) - ?) \
         )",
    )
    .bind(student_id)
    .bind(article_id)
    .bind(student_id)
    .bind(article_id)
    .bind(max_versions)
    .execute(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;
    Ok(result.rows_affected())
}

/// List an article's versions, newest first.
pub async fn list_versions(
    pool: &DbPool,
    student_id: &str,
    article_id: &str,
    active_only: bool,
) -> Result<Vec<ArticleVersionRow>, StorageError> {
    let sql = if active_only {
        "SELECT * FROM article_versions \
         WHERE tracked_student_id = ? AND mymoment_article_id = ? AND is_active = 1 \
         ORDER BY version_number DESC"
    } else {
        "SELECT * FROM article_versions \
         WHERE tracked_student_id = ? AND mymoment_article_id = ? \
         ORDER BY version_number DESC"
    };
    sqlx::query_as::<_, ArticleVersionRow>(sql)
        .bind(student_id)
        .bind(article_id)
        .fetch_all(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{init_test_db, logins, users};

    async fn seed_student(pool: &DbPool) -> TrackedStudentRow {
        let hash = users::hash_password("pw").expect("hash");
        let user = users::create_user(pool, "owner@example.ch", &hash)
            .await
            .expect("user");
        let login = logins::create_login(pool, &user.id, "Admin", "u", "p", true)
            .await
            .expect("login");
        create_tracked_student(pool, &user.id, &login.id, "Lena M.", true)
            .await
            .expect("student")
    }

    #[tokio::test]
    async fn version_numbers_are_monotonic() {
        let pool = init_test_db().await.expect("init db");
        let student = seed_student(&pool).await;

        for i in 1..=3 {
            let next = max_version_number(&pool, &student.id, "art-1").await.expect("max") + 1;
            assert_eq!(next, i);
            insert_version(
                &pool,
                &student.user_id,
                &student.id,
                "art-1",
                next,
                "T",
                "u",
                &format!("content {i}"),
                "",
                &format!("hash{i}"),
            )
            .await
            .expect("insert");
        }

        let versions = list_versions(&pool, &student.id, "art-1", false).await.expect("list");
        assert_eq!(
            versions.iter().map(|v| v.version_number).collect::<Vec<_>>(),
            vec![3, 2, 1]
        );
    }

    #[tokio::test]
    async fn cap_soft_deletes_oldest_first() {
        let pool = init_test_db().await.expect("init db");
        let student = seed_student(&pool).await;

        for i in 1..=5 {
            insert_version(
                &pool,
                &student.user_id,
                &student.id,
                "art-1",
                i,
                "T",
                "u",
                &format!("content {i}"),
                "",
                &format!("hash{i}"),
            )
            .await
            .expect("insert");
        }

        let deactivated = enforce_version_cap(&pool, &student.id, "art-1", 3)
            .await
            .expect("cap");
        assert_eq!(deactivated, 2);

        let active = list_versions(&pool, &student.id, "art-1", true).await.expect("list");
        assert_eq!(
            active.iter().map(|v| v.version_number).collect::<Vec<_>>(),
            vec![5, 4, 3]
        );

        // The deactivated rows still exist.
        let all = list_versions(&pool, &student.id, "art-1", false).await.expect("list all");
        assert_eq!(all.len(), 5);
    }

    #[tokio::test]
    async fn cap_is_noop_when_under_limit() {
        let pool = init_test_db().await.expect("init db");
        let student = seed_student(&pool).await;
        insert_version(
            &pool,
            &student.user_id,
            &student.id,
            "art-1",
            1,
            "T",
            "u",
            "c",
            "",
            "h",
        )
        .await
        .expect("insert");

        assert_eq!(
            enforce_version_cap(&pool, &student.id, "art-1", 3).await.expect("cap"),
            0
        );
        assert_eq!(active_version_count(&pool, &student.id, "art-1").await.expect("count"), 1);
    }

    #[tokio::test]
    async fn articles_are_capped_independently() {
        let pool = init_test_db().await.expect("init db");
        let student = seed_student(&pool).await;

        for article in ["art-1", "art-2"] {
            for i in 1..=4 {
                insert_version(
                    &pool,
                    &student.user_id,
                    &student.id,
                    article,
                    i,
                    "T",
                    "u",
                    "c",
                    "",
                    &format!("{article}-h{i}"),
                )
                .await
                .expect("insert");
            }
        }

        enforce_version_cap(&pool, &student.id, "art-1", 2).await.expect("cap");
        assert_eq!(active_version_count(&pool, &student.id, "art-1").await.expect("c1"), 2);
        assert_eq!(active_version_count(&pool, &student.id, "art-2").await.expect("c2"), 4);
    }
}
