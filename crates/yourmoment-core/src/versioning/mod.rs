//! Student article versioning.
//!
//! Tracked students reference an admin login; their articles are snapshotted
//! into version rows carrying a SHA-256 content hash and a per-article
//! monotonic version number. At most `max_versions` versions stay active per
//! article, oldest soft-deleted first.

use sha2::{Digest, Sha256};

use crate::error::VersioningError;
use crate::storage::{logins, students, DbPool};

/// A fetched article payload to snapshot.
#[derive(Debug, Clone)]
pub struct ArticlePayload {
    pub mymoment_article_id: String,
    pub title: String,
    pub url: String,
    pub content: String,
    pub raw_html: String,
}

/// Outcome of a snapshot attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionOutcome {
    /// A new version row was created with this version number.
    Created { version_number: i64 },
    /// The content hash matched the latest active version; nothing stored.
    Unchanged,
}

/// Compute the canonical content hash for version comparison.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// Service for creating and capping article versions.
pub struct VersioningService {
    pool: DbPool,
    max_versions: i64,
}

impl VersioningService {
    /// Build the service with the configured per-article version cap.
    pub fn new(pool: DbPool, max_versions: i64) -> Self {
        Self { pool, max_versions }
    }

    /// Register a tracked student after validating the admin login.
    pub async fn track_student(
        &self,
        user_id: &str,
        admin_login_id: &str,
        student_name: &str,
        content_changes_only: bool,
    ) -> Result<students::TrackedStudentRow, VersioningError> {
        let login = logins::get_login(&self.pool, admin_login_id)
            .await?
            .filter(|l| l.is_active && l.user_id == user_id);

        match login {
            Some(login) if login.is_admin => {}
            _ => {
                return Err(VersioningError::AdminRequired {
                    login_id: admin_login_id.to_string(),
                });
            }
        }

        Ok(students::create_tracked_student(
            &self.pool,
            user_id,
            admin_login_id,
            student_name,
            content_changes_only,
        )
        .await?)
    }

    /// Snapshot an article for a tracked student.
    ///
    /// When the student is configured for content-changes-only and the hash
    /// of the fetched content equals the latest active version, no new
    /// version is created. Otherwise the next version number is assigned and
    /// the active-version cap enforced, oldest first.
    pub async fn create_version(
        &self,
        student_id: &str,
        payload: &ArticlePayload,
    ) -> Result<VersionOutcome, VersioningError> {
        let student = students::get_tracked_student(&self.pool, student_id)
            .await?
            .filter(|s| s.is_active)
            .ok_or_else(|| VersioningError::StudentNotFound {
                student_id: student_id.to_string(),
            })?;

        let hash = content_hash(&payload.content);

        if student.content_changes_only {
            let latest = students::latest_active_version(
                &self.pool,
                student_id,
                &payload.mymoment_article_id,
            )
            .await?;
            if let Some(latest) = latest {
                if latest.content_hash == hash {
                    tracing::debug!(
                        student_id,
                        article_id = %payload.mymoment_article_id,
                        "content unchanged, skipping version"
                    );
                    return Ok(VersionOutcome::Unchanged);
                }
            }
        }

        let version_number = students::max_version_number(
            &self.pool,
            student_id,
            &payload.mymoment_article_id,
        )
        .await?
            + 1;

        students::insert_version(
            &self.pool,
            &student.user_id,
            student_id,
            &payload.mymoment_article_id,
            version_number,
            &payload.title,
            &payload.url,
            &payload.content,
            &payload.raw_html,
            &hash,
        )
        .await?;

        let deactivated = students::enforce_version_cap(
            &self.pool,
            student_id,
            &payload.mymoment_article_id,
            self.max_versions,
        )
        .await?;

        students::touch_last_backup(&self.pool, student_id).await?;

        tracing::info!(
            student_id,
            article_id = %payload.mymoment_article_id,
            version_number,
            deactivated,
            "article version created"
        );
        Ok(VersionOutcome::Created { version_number })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{init_test_db, users};

    struct Setup {
        service: VersioningService,
        user_id: String,
        admin_login_id: String,
        member_login_id: String,
    }

    async fn setup(max_versions: i64) -> Setup {
        let pool = init_test_db().await.expect("init db");
        let hash = users::hash_password("pw").expect("hash");
        let user = users::create_user(&pool, "owner@example.ch", &hash)
            .await
            .expect("user");
        let admin = logins::create_login(&pool, &user.id, "Admin", "u", "p", true)
            .await
            .expect("admin");
        let member = logins::create_login(&pool, &user.id, "Member", "u", "p", false)
            .await
            .expect("member");

        Setup {
            service: VersioningService::new(pool, max_versions),
            user_id: user.id,
            admin_login_id: admin.id,
            member_login_id: member.id,
        }
    }

    fn payload(article_id: &str, content: &str) -> ArticlePayload {
        ArticlePayload {
            mymoment_article_id: article_id.to_string(),
            title: "Mein Haustier".to_string(),
            url: format!("https://platform.example/article/{article_id}/"),
            content: content.to_string(),
            raw_html: format!("<p>{content}</p>"),
        }
    }

    #[test]
    fn hash_is_stable_sha256_hex() {
        let a = content_hash("Mein Hund heisst Bello.");
        let b = content_hash("Mein Hund heisst Bello.");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, content_hash("Etwas anderes"));
    }

    #[tokio::test]
    async fn tracking_requires_admin_login() {
        let setup = setup(3).await;

        let err = setup
            .service
            .track_student(&setup.user_id, &setup.member_login_id, "Lena", true)
            .await
            .unwrap_err();
        assert!(matches!(err, VersioningError::AdminRequired { .. }));

        setup
            .service
            .track_student(&setup.user_id, &setup.admin_login_id, "Lena", true)
            .await
            .expect("admin login accepted");
    }

    #[tokio::test]
    async fn unchanged_content_is_skipped() {
        let setup = setup(3).await;
        let student = setup
            .service
            .track_student(&setup.user_id, &setup.admin_login_id, "Lena", true)
            .await
            .expect("student");

        let first = setup
            .service
            .create_version(&student.id, &payload("art-1", "Inhalt A"))
            .await
            .expect("first");
        assert_eq!(first, VersionOutcome::Created { version_number: 1 });

        let second = setup
            .service
            .create_version(&student.id, &payload("art-1", "Inhalt A"))
            .await
            .expect("second");
        assert_eq!(second, VersionOutcome::Unchanged);

        let third = setup
            .service
            .create_version(&student.id, &payload("art-1", "Inhalt B"))
            .await
            .expect("third");
        assert_eq!(third, VersionOutcome::Created { version_number: 2 });
    }

    #[tokio::test]
    async fn every_fetch_versioned_when_changes_only_disabled() {
        let setup = setup(5).await;
        let student = setup
            .service
            .track_student(&setup.user_id, &setup.admin_login_id, "Lena", false)
            .await
            .expect("student");

        for expected in 1..=3 {
            let outcome = setup
                .service
                .create_version(&student.id, &payload("art-1", "immer gleich"))
                .await
                .expect("version");
            assert_eq!(
                outcome,
                VersionOutcome::Created {
                    version_number: expected
                }
            );
        }
    }

    #[tokio::test]
    async fn cap_keeps_highest_versions_active() {
        let setup = setup(3).await;
        let student = setup
            .service
            .track_student(&setup.user_id, &setup.admin_login_id, "Lena", true)
            .await
            .expect("student");

        for i in 1..=5 {
            setup
                .service
                .create_version(&student.id, &payload("art-1", &format!("Inhalt {i}")))
                .await
                .expect("version");
        }

        let pool = &setup.service.pool;
        let active = students::list_versions(pool, &student.id, "art-1", true)
            .await
            .expect("active");
        assert_eq!(
            active.iter().map(|v| v.version_number).collect::<Vec<_>>(),
            vec![5, 4, 3]
        );

        let all = students::list_versions(pool, &student.id, "art-1", false)
            .await
            .expect("all");
        assert_eq!(all.len(), 5);
        assert_eq!(all.iter().filter(|v| !v.is_active).count(), 2);

        let refreshed = students::get_tracked_student(pool, &student.id)
            .await
            .expect("student")
            .expect("found");
        assert!(refreshed.last_backup_at.is_some());
    }
}
