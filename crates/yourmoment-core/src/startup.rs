//! Startup wiring: configuration → vault → database → limiter → services.
//!
//! The binary builds one [`AppState`] and hands pieces of it to the worker,
//! the scheduler, and the CLI commands. There is no global state; everything
//! is passed explicitly.

use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::error::{CryptoError, StorageError};
use crate::llm::gateway::LlmGateway;
use crate::monitor::{MonitoringService, StageContext};
use crate::ratelimit::ScrapingRateLimiter;
use crate::session::SessionManager;
use crate::storage::{self, DbPool};
use crate::vault::CredentialVault;

/// Errors during application startup.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    /// Vault key material could not be established.
    #[error("vault initialization failed: {0}")]
    Vault(#[from] CryptoError),

    /// Database could not be opened or migrated.
    #[error("database initialization failed: {0}")]
    Storage(#[from] StorageError),
}

/// Fully wired application state.
pub struct AppState {
    pub config: Arc<Config>,
    pub pool: DbPool,
    pub vault: Arc<CredentialVault>,
    pub limiter: Arc<ScrapingRateLimiter>,
    pub sessions: Arc<SessionManager>,
    pub gateway: Arc<LlmGateway>,
    pub monitoring: MonitoringService,
}

impl AppState {
    /// Initialize every service from configuration.
    ///
    /// Startup sequence:
    /// 1. Establish vault key material (env var → key file → generate)
    /// 2. Initialize the database and run migrations
    /// 3. Build the scraping rate limiter from the per-domain delays
    /// 4. Create the session manager and LLM gateway
    /// 5. Create the monitoring service
    pub async fn init(config: Config) -> Result<AppState, StartupError> {
        let config = Arc::new(config);

        let vault = Arc::new(CredentialVault::from_config(&config.security)?);
        let pool = storage::init_db(&config.storage.db_path).await?;

        let limiter = Arc::new(ScrapingRateLimiter::new(
            &config.scraper.base_url,
            Duration::from_secs_f64(config.scraper.platform_delay_seconds),
            Duration::from_secs_f64(config.scraper.default_delay_seconds),
        ));

        let sessions = Arc::new(SessionManager::new(
            pool.clone(),
            Arc::clone(&vault),
            Arc::clone(&limiter),
            &config.scraper,
            &config.monitoring,
        ));

        let gateway = Arc::new(LlmGateway::new(&config.llm));
        let monitoring = MonitoringService::new(pool.clone(), &config.monitoring);

        tracing::info!(
            db_path = %config.storage.db_path,
            platform = %config.scraper.base_url,
            "application state initialized"
        );

        Ok(AppState {
            config,
            pool,
            vault,
            limiter,
            sessions,
            gateway,
            monitoring,
        })
    }

    /// The context shared by all pipeline stage executions.
    pub fn stage_context(&self) -> StageContext {
        StageContext {
            pool: self.pool.clone(),
            vault: Arc::clone(&self.vault),
            sessions: Arc::clone(&self.sessions),
            gateway: Arc::clone(&self.gateway),
            limiter: Arc::clone(&self.limiter),
            config: Arc::clone(&self.config),
        }
    }
}
