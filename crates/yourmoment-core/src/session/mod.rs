//! Platform session manager.
//!
//! Maintains the `(login) → platform session` mapping in persistent storage:
//! at most one live session per login, TTL-based expiry, renewal when the
//! remaining life drops below a threshold, and an hourly sweep that
//! deactivates (never deletes) expired rows.
//!
//! Concurrent `get_or_create` calls for the same login serialize on a
//! per-login mutex so the one-active-session invariant survives races.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;

use crate::config::{MonitoringConfig, ScraperConfig};
use crate::error::SessionError;
use crate::ratelimit::ScrapingRateLimiter;
use crate::scraper::{PlatformSession, SessionState};
use crate::storage::{logins, sessions, to_stored, DbPool};
use crate::vault::CredentialVault;

/// Manages platform sessions across logins.
pub struct SessionManager {
    pool: DbPool,
    vault: Arc<CredentialVault>,
    limiter: Arc<ScrapingRateLimiter>,
    base_url: String,
    request_timeout: Duration,
    acquire_timeout: Duration,
    ttl: chrono::Duration,
    refresh_threshold: chrono::Duration,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionManager {
    /// Build a session manager from configuration.
    pub fn new(
        pool: DbPool,
        vault: Arc<CredentialVault>,
        limiter: Arc<ScrapingRateLimiter>,
        scraper: &ScraperConfig,
        monitoring: &MonitoringConfig,
    ) -> Self {
        Self {
            pool,
            vault,
            limiter,
            base_url: scraper.base_url.clone(),
            request_timeout: Duration::from_secs(scraper.request_timeout_seconds),
            acquire_timeout: Duration::from_secs(scraper.session_acquire_timeout_seconds),
            ttl: chrono::Duration::hours(monitoring.session_ttl_hours),
            refresh_threshold: chrono::Duration::hours(monitoring.session_refresh_threshold_hours),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Get a usable scraping session for a login, creating one if needed.
    ///
    /// An existing active session is reused while its remaining life is at
    /// least the refresh threshold; otherwise prior sessions are deactivated
    /// and a fresh authentication runs. The whole operation is bounded by
    /// the session-acquire timeout.
    pub async fn get_or_create(&self, login_id: &str) -> Result<PlatformSession, SessionError> {
        let lock = self.lock_for(login_id).await;
        let _guard = lock.lock().await;

        tokio::time::timeout(self.acquire_timeout, self.acquire(login_id))
            .await
            .map_err(|_| SessionError::AcquireTimeout {
                seconds: self.acquire_timeout.as_secs(),
            })?
    }

    async fn acquire(&self, login_id: &str) -> Result<PlatformSession, SessionError> {
        let login = logins::get_login(&self.pool, login_id)
            .await?
            .filter(|l| l.is_active)
            .ok_or_else(|| SessionError::LoginUnavailable {
                login_id: login_id.to_string(),
            })?;

        if let Some(existing) = sessions::get_active_session(&self.pool, login_id).await? {
            let usable = crate::storage::parse_stored(&existing.expires_at)
                .map(|expires| expires - Utc::now() >= self.refresh_threshold)
                .unwrap_or(false);

            if usable {
                let state_json = self.vault.decrypt_session_data(&existing.session_data_encrypted)?;
                if let Ok(state) = serde_json::from_value::<SessionState>(state_json) {
                    if state.authenticated {
                        sessions::touch_last_accessed(&self.pool, &existing.id).await?;
                        tracing::debug!(login_id, session_id = %existing.id, "reusing platform session");
                        return Ok(PlatformSession::from_state(
                            &self.base_url,
                            self.request_timeout,
                            Arc::clone(&self.limiter),
                            state,
                        )?);
                    }
                }
            }
        }

        // No usable session: deactivate what is left and authenticate fresh.
        sessions::deactivate_sessions_for_login(&self.pool, login_id).await?;

        let (username, password) = self
            .vault
            .decrypt_credentials(&login.username_encrypted, &login.password_encrypted)?;

        let mut session = PlatformSession::new(
            &self.base_url,
            self.request_timeout,
            Arc::clone(&self.limiter),
        )?;
        session.authenticate(&username, &password).await?;

        let state = serde_json::to_value(session.export_state()).map_err(|e| {
            SessionError::Crypto(crate::error::CryptoError::Encrypt {
                message: format!("session state serialization failed: {e}"),
            })
        })?;
        let blob = self.vault.encrypt_session_data(&state)?;
        let expires_at = to_stored(Utc::now() + self.ttl);
        let row = sessions::insert_session(&self.pool, login_id, &blob, &expires_at).await?;
        logins::touch_last_used(&self.pool, login_id).await?;

        tracing::info!(login_id, session_id = %row.id, "created platform session");
        Ok(session)
    }

    /// Persist a session's current state back to its active row.
    ///
    /// Called after scraping work so refreshed cookies survive the worker.
    pub async fn save_state(
        &self,
        login_id: &str,
        session: &PlatformSession,
    ) -> Result<(), SessionError> {
        let Some(row) = sessions::get_active_session(&self.pool, login_id).await? else {
            return Ok(());
        };
        let state = serde_json::to_value(session.export_state()).map_err(|e| {
            SessionError::Crypto(crate::error::CryptoError::Encrypt {
                message: format!("session state serialization failed: {e}"),
            })
        })?;
        let blob = self.vault.encrypt_session_data(&state)?;
        sessions::update_session_data(&self.pool, &row.id, &blob).await?;
        Ok(())
    }

    /// Drop a login's active session (e.g. after the platform rejected it).
    pub async fn invalidate(&self, login_id: &str) -> Result<(), SessionError> {
        sessions::deactivate_sessions_for_login(&self.pool, login_id).await?;
        Ok(())
    }

    /// Verify a login's credentials with a live authentication.
    ///
    /// Opens a throwaway session, authenticates, and closes it again
    /// without persisting anything. Used when credentials are saved or
    /// edited.
    pub async fn verify_login(&self, login_id: &str) -> Result<(), SessionError> {
        let login = logins::get_login(&self.pool, login_id)
            .await?
            .filter(|l| l.is_active)
            .ok_or_else(|| SessionError::LoginUnavailable {
                login_id: login_id.to_string(),
            })?;

        let (username, password) = self
            .vault
            .decrypt_credentials(&login.username_encrypted, &login.password_encrypted)?;

        let mut session = PlatformSession::new(
            &self.base_url,
            self.request_timeout,
            Arc::clone(&self.limiter),
        )?;
        session.authenticate(&username, &password).await?;
        session.close();

        logins::touch_last_used(&self.pool, login_id).await?;
        Ok(())
    }

    /// Deactivate expired sessions. Wired to the hourly scheduler job.
    pub async fn sweep_expired(&self) -> Result<u64, SessionError> {
        let swept = sessions::sweep_expired(&self.pool).await?;
        if swept > 0 {
            tracing::info!(swept, "deactivated expired platform sessions");
        }
        Ok(swept)
    }

    async fn lock_for(&self, login_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(
            locks
                .entry(login_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MonitoringConfig, ScraperConfig};
    use crate::storage::{init_test_db, users};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const LOGIN_PAGE: &str = r#"
        <form id="login-form" method="post" action="/accounts/login/">
            <input type="hidden" name="csrfmiddlewaretoken" value="tok123">
        </form>
    "#;

    const INDEX_PAGE: &str = r#"
        <input type="hidden" name="csrfmiddlewaretoken" value="tok456">
        <div class="article-list"></div>
    "#;

    async fn mock_platform(server: &MockServer, expected_logins: u64) {
        Mock::given(method("GET"))
            .and(path("/accounts/login/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(LOGIN_PAGE))
            .expect(expected_logins)
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/accounts/login/"))
            .respond_with(
                ResponseTemplate::new(302)
                    .append_header("set-cookie", "sessionid=s1; Path=/")
                    .append_header("location", "/articles/"),
            )
            .expect(expected_logins)
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/articles/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(INDEX_PAGE))
            .mount(server)
            .await;
    }

    struct Setup {
        pool: DbPool,
        manager: SessionManager,
        login_id: String,
    }

    async fn setup(server: &MockServer) -> Setup {
        let pool = init_test_db().await.expect("init db");
        let vault = Arc::new(
            CredentialVault::from_key_bytes(&(0..32).collect::<Vec<u8>>()).expect("vault"),
        );
        let limiter = Arc::new(ScrapingRateLimiter::new(
            &server.uri(),
            Duration::ZERO,
            Duration::ZERO,
        ));

        let hash = users::hash_password("pw").expect("hash");
        let user = users::create_user(&pool, "owner@example.ch", &hash)
            .await
            .expect("user");
        let (u, p) = vault.encrypt_credentials("lena", "geheim").expect("enc");
        let login = logins::create_login(&pool, &user.id, "A", &u, &p, false)
            .await
            .expect("login");

        let scraper_cfg = ScraperConfig {
            base_url: server.uri(),
            ..ScraperConfig::default()
        };
        let manager = SessionManager::new(
            pool.clone(),
            vault,
            limiter,
            &scraper_cfg,
            &MonitoringConfig::default(),
        );

        Setup {
            pool,
            manager,
            login_id: login.id,
        }
    }

    #[tokio::test]
    async fn creates_then_reuses_session() {
        let server = MockServer::start().await;
        mock_platform(&server, 1).await;
        let setup = setup(&server).await;

        let first = setup.manager.get_or_create(&setup.login_id).await.expect("first");
        assert!(first.is_authenticated());

        // A second acquisition reuses the stored session: the login mocks
        // are asserted to have been hit exactly once.
        let second = setup.manager.get_or_create(&setup.login_id).await.expect("second");
        assert!(second.is_authenticated());

        assert_eq!(
            sessions::count_active_for_login(&setup.pool, &setup.login_id)
                .await
                .expect("count"),
            1
        );
    }

    #[tokio::test]
    async fn near_expiry_session_is_replaced() {
        let server = MockServer::start().await;
        mock_platform(&server, 2).await;
        let setup = setup(&server).await;

        setup.manager.get_or_create(&setup.login_id).await.expect("first");

        // Shrink the session's remaining life below the refresh threshold.
        let soon = to_stored(Utc::now() + chrono::Duration::minutes(10));
        sqlx::query("UPDATE platform_sessions SET expires_at = ? WHERE is_active = 1")
            .bind(&soon)
            .execute(&setup.pool)
            .await
            .expect("age session");

        setup.manager.get_or_create(&setup.login_id).await.expect("renewed");
        assert_eq!(
            sessions::count_active_for_login(&setup.pool, &setup.login_id)
                .await
                .expect("count"),
            1
        );
    }

    #[tokio::test]
    async fn inactive_login_is_rejected() {
        let server = MockServer::start().await;
        let setup = setup(&server).await;

        logins::deactivate_login(&setup.pool, &setup.login_id)
            .await
            .expect("deactivate");

        let err = setup.manager.get_or_create(&setup.login_id).await.unwrap_err();
        assert!(matches!(err, SessionError::LoginUnavailable { .. }));
    }

    #[tokio::test]
    async fn concurrent_acquisition_authenticates_once() {
        let server = MockServer::start().await;
        mock_platform(&server, 1).await;
        let setup = Arc::new(setup(&server).await);

        let a = {
            let s = Arc::clone(&setup);
            tokio::spawn(async move { s.manager.get_or_create(&s.login_id).await })
        };
        let b = {
            let s = Arc::clone(&setup);
            tokio::spawn(async move { s.manager.get_or_create(&s.login_id).await })
        };

        a.await.expect("join").expect("first acquire");
        b.await.expect("join").expect("second acquire");

        assert_eq!(
            sessions::count_active_for_login(&setup.pool, &setup.login_id)
                .await
                .expect("count"),
            1
        );
    }

    #[tokio::test]
    async fn verify_login_authenticates_without_persisting() {
        let server = MockServer::start().await;
        mock_platform(&server, 1).await;
        let setup = setup(&server).await;

        setup.manager.verify_login(&setup.login_id).await.expect("verify");

        // No session row was persisted; last_used was touched.
        assert_eq!(
            sessions::count_active_for_login(&setup.pool, &setup.login_id)
                .await
                .expect("count"),
            0
        );
        let login = logins::get_login(&setup.pool, &setup.login_id)
            .await
            .expect("get")
            .expect("found");
        assert!(login.last_used.is_some());
    }

    #[tokio::test]
    async fn sweep_deactivates_expired() {
        let server = MockServer::start().await;
        mock_platform(&server, 1).await;
        let setup = setup(&server).await;

        setup.manager.get_or_create(&setup.login_id).await.expect("session");
        sqlx::query("UPDATE platform_sessions SET expires_at = '2000-01-01T00:00:00+00:00'")
            .execute(&setup.pool)
            .await
            .expect("expire");

        assert_eq!(setup.manager.sweep_expired().await.expect("sweep"), 1);
        assert_eq!(
            sessions::count_active_for_login(&setup.pool, &setup.login_id)
                .await
                .expect("count"),
            0
        );
    }
}
