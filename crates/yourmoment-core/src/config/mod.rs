//! Configuration management for yourMoment.
//!
//! Supports three-layer configuration loading:
//! 1. Built-in defaults
//! 2. TOML config file (`~/.yourmoment/config.toml`)
//! 3. Environment variable overrides (`YOURMOMENT_` prefix)
//!
//! CLI flag overrides are applied by the binary crate after loading.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

/// Top-level configuration for the yourMoment service.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Data storage configuration.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Encryption key management.
    #[serde(default)]
    pub security: SecurityConfig,

    /// Platform scraping configuration.
    #[serde(default)]
    pub scraper: ScraperConfig,

    /// LLM gateway and comment generation settings.
    #[serde(default)]
    pub llm: LlmConfig,

    /// Monitoring pipeline settings.
    #[serde(default)]
    pub monitoring: MonitoringConfig,

    /// Background queue settings.
    #[serde(default)]
    pub queue: QueueConfig,
}

/// Data storage configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

/// Encryption key management.
///
/// The vault key is resolved in order: `encryption_key` (base64-url, usually
/// injected via `YOURMOMENT_SECURITY__ENCRYPTION_KEY`), then `key_file`, then
/// a freshly generated key persisted to `key_file` with 0600 permissions.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SecurityConfig {
    /// Base64-url-encoded 32-byte encryption key.
    #[serde(default)]
    pub encryption_key: Option<String>,

    /// Path to the key file used when no key is set in the environment.
    #[serde(default = "default_key_file")]
    pub key_file: String,

    /// Secret used to sign and hash user session tokens.
    #[serde(default)]
    pub jwt_secret: Option<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            encryption_key: None,
            key_file: default_key_file(),
            jwt_secret: None,
        }
    }
}

/// Platform scraping configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScraperConfig {
    /// Base URL of the myMoment platform.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,

    /// Timeout for acquiring (authenticating) a platform session.
    #[serde(default = "default_session_acquire_timeout_seconds")]
    pub session_acquire_timeout_seconds: u64,

    /// Maximum articles fetched per login during discovery.
    #[serde(default = "default_page_limit")]
    pub page_limit: u32,

    /// Minimum seconds between requests to the platform domain.
    #[serde(default = "default_platform_delay_seconds")]
    pub platform_delay_seconds: f64,

    /// Minimum seconds between requests to any other domain.
    #[serde(default = "default_other_delay_seconds")]
    pub default_delay_seconds: f64,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_seconds: default_request_timeout_seconds(),
            session_acquire_timeout_seconds: default_session_acquire_timeout_seconds(),
            page_limit: default_page_limit(),
            platform_delay_seconds: default_platform_delay_seconds(),
            default_delay_seconds: default_other_delay_seconds(),
        }
    }
}

/// LLM gateway and comment generation settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmConfig {
    /// Per-call generation timeout in seconds.
    #[serde(default = "default_generation_timeout_seconds")]
    pub generation_timeout_seconds: u64,

    /// Minimum seconds between calls to the same provider.
    #[serde(default = "default_min_call_interval_seconds")]
    pub min_call_interval_seconds: f64,

    /// Whether to fall back to the next active provider on failure.
    #[serde(default = "default_fallback")]
    pub fallback_to_next_provider: bool,

    /// Minimum comment length in characters, excluding the AI prefix.
    #[serde(default = "default_min_comment_length")]
    pub min_comment_length: usize,

    /// Maximum comment length in characters, excluding the AI prefix.
    #[serde(default = "default_max_comment_length")]
    pub max_comment_length: usize,

    /// Disclosure prefix every posted comment must carry.
    #[serde(default = "default_ai_comment_prefix")]
    pub ai_comment_prefix: String,

    /// Override URL for the OpenAI endpoint (proxies, tests).
    #[serde(default)]
    pub openai_base_url: Option<String>,

    /// Override URL for the Mistral endpoint (proxies, tests).
    #[serde(default)]
    pub mistral_base_url: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            generation_timeout_seconds: default_generation_timeout_seconds(),
            min_call_interval_seconds: default_min_call_interval_seconds(),
            fallback_to_next_provider: default_fallback(),
            min_comment_length: default_min_comment_length(),
            max_comment_length: default_max_comment_length(),
            ai_comment_prefix: default_ai_comment_prefix(),
            openai_base_url: None,
            mistral_base_url: None,
        }
    }
}

/// Monitoring pipeline settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitoringConfig {
    /// Maximum concurrently running processes per user.
    #[serde(default = "default_max_concurrent_processes")]
    pub max_concurrent_processes_per_user: i64,

    /// Default wall-clock budget for new processes, in minutes.
    #[serde(default = "default_max_duration_minutes")]
    pub default_max_duration_minutes: i64,

    /// Platform session lifetime in hours.
    #[serde(default = "default_session_ttl_hours")]
    pub session_ttl_hours: i64,

    /// Remaining session life below which a session is renewed, in hours.
    #[serde(default = "default_session_refresh_threshold_hours")]
    pub session_refresh_threshold_hours: i64,

    /// Maximum active versions kept per tracked article.
    #[serde(default = "default_max_versions")]
    pub max_versions_per_article: i64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            max_concurrent_processes_per_user: default_max_concurrent_processes(),
            default_max_duration_minutes: default_max_duration_minutes(),
            session_ttl_hours: default_session_ttl_hours(),
            session_refresh_threshold_hours: default_session_refresh_threshold_hours(),
            max_versions_per_article: default_max_versions(),
        }
    }
}

/// Background queue settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
    /// Seconds a worker sleeps between claim attempts when all queues are empty.
    #[serde(default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: u64,

    /// Maximum re-enqueue attempts for pre-posting stage tasks.
    #[serde(default = "default_max_retries")]
    pub max_retries: i64,

    /// Base backoff between retries, in seconds (doubled per attempt).
    #[serde(default = "default_retry_backoff_seconds")]
    pub retry_backoff_seconds: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: default_poll_interval_seconds(),
            max_retries: default_max_retries(),
            retry_backoff_seconds: default_retry_backoff_seconds(),
        }
    }
}

// --- Default value functions for serde ---

fn default_db_path() -> String {
    "~/.yourmoment/yourmoment.db".to_string()
}
fn default_key_file() -> String {
    "~/.yourmoment/encryption.key".to_string()
}
fn default_base_url() -> String {
    "https://new.mymoment.ch".to_string()
}
fn default_request_timeout_seconds() -> u64 {
    30
}
fn default_session_acquire_timeout_seconds() -> u64 {
    60
}
fn default_page_limit() -> u32 {
    20
}
fn default_platform_delay_seconds() -> f64 {
    2.0
}
fn default_other_delay_seconds() -> f64 {
    1.0
}
fn default_generation_timeout_seconds() -> u64 {
    30
}
fn default_min_call_interval_seconds() -> f64 {
    2.0
}
fn default_fallback() -> bool {
    true
}
fn default_min_comment_length() -> usize {
    50
}
fn default_max_comment_length() -> usize {
    500
}
fn default_ai_comment_prefix() -> String {
    "[Dieser Kommentar stammt von einem KI-ChatBot.]".to_string()
}
fn default_max_concurrent_processes() -> i64 {
    10
}
fn default_max_duration_minutes() -> i64 {
    60
}
fn default_session_ttl_hours() -> i64 {
    24
}
fn default_session_refresh_threshold_hours() -> i64 {
    1
}
fn default_max_versions() -> i64 {
    10
}
fn default_poll_interval_seconds() -> u64 {
    2
}
fn default_max_retries() -> i64 {
    3
}
fn default_retry_backoff_seconds() -> u64 {
    120
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// The loading sequence:
    /// 1. Determine config file path (argument > `YOURMOMENT_CONFIG` env var > default)
    /// 2. Parse TOML file (or use defaults if the default path doesn't exist)
    /// 3. Apply environment variable overrides
    pub fn load(config_path: Option<&str>) -> Result<Config, ConfigError> {
        let (path, explicit) = Self::resolve_config_path(config_path);

        let mut config = match std::fs::read_to_string(&path) {
            Ok(contents) => toml::from_str::<Config>(&contents)
                .map_err(|e| ConfigError::ParseError { source: e })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if explicit {
                    return Err(ConfigError::FileNotFound {
                        path: path.display().to_string(),
                    });
                }
                Config::default()
            }
            Err(_) => {
                return Err(ConfigError::FileNotFound {
                    path: path.display().to_string(),
                });
            }
        };

        config.apply_env_overrides()?;

        Ok(config)
    }

    /// Load configuration and validate it, returning all validation errors at once.
    pub fn load_and_validate(config_path: Option<&str>) -> Result<Config, Vec<ConfigError>> {
        let config = Config::load(config_path).map_err(|e| vec![e])?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration, returning all errors found (not just the first).
    pub fn validate(&self) -> Result<(), Vec<ConfigError>> {
        let mut errors = Vec::new();

        if self.storage.db_path.is_empty() {
            errors.push(ConfigError::MissingField {
                field: "storage.db_path".to_string(),
            });
        }

        if self.security.encryption_key.is_none() && self.security.key_file.is_empty() {
            errors.push(ConfigError::MissingField {
                field: "security.encryption_key or security.key_file".to_string(),
            });
        }

        if url::Url::parse(&self.scraper.base_url).is_err() {
            errors.push(ConfigError::InvalidValue {
                field: "scraper.base_url".to_string(),
                message: format!("'{}' is not a valid URL", self.scraper.base_url),
            });
        }

        if self.scraper.page_limit == 0 {
            errors.push(ConfigError::InvalidValue {
                field: "scraper.page_limit".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        if self.llm.min_comment_length >= self.llm.max_comment_length {
            errors.push(ConfigError::InvalidValue {
                field: "llm.max_comment_length".to_string(),
                message: "must be greater than min_comment_length".to_string(),
            });
        }

        if self.llm.ai_comment_prefix.trim().is_empty() {
            errors.push(ConfigError::MissingField {
                field: "llm.ai_comment_prefix".to_string(),
            });
        }

        if self.monitoring.max_concurrent_processes_per_user <= 0 {
            errors.push(ConfigError::InvalidValue {
                field: "monitoring.max_concurrent_processes_per_user".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        if self.monitoring.default_max_duration_minutes <= 0 {
            errors.push(ConfigError::InvalidValue {
                field: "monitoring.default_max_duration_minutes".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        if self.monitoring.session_refresh_threshold_hours >= self.monitoring.session_ttl_hours {
            errors.push(ConfigError::InvalidValue {
                field: "monitoring.session_refresh_threshold_hours".to_string(),
                message: "must be less than session_ttl_hours".to_string(),
            });
        }

        if self.monitoring.max_versions_per_article <= 0 {
            errors.push(ConfigError::InvalidValue {
                field: "monitoring.max_versions_per_article".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        if self.queue.max_retries < 0 {
            errors.push(ConfigError::InvalidValue {
                field: "queue.max_retries".to_string(),
                message: "must not be negative".to_string(),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Resolve the config file path from arguments, env vars, or default.
    ///
    /// Returns `(path, explicit)` where `explicit` is true if the path was
    /// explicitly provided rather than using the default.
    fn resolve_config_path(config_path: Option<&str>) -> (PathBuf, bool) {
        if let Some(path) = config_path {
            return (expand_tilde(path), true);
        }

        if let Ok(env_path) = env::var("YOURMOMENT_CONFIG") {
            return (expand_tilde(&env_path), true);
        }

        (expand_tilde("~/.yourmoment/config.toml"), false)
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables use the `YOURMOMENT_` prefix with double
    /// underscores separating nested keys (e.g., `YOURMOMENT_STORAGE__DB_PATH`).
    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        // Storage
        if let Ok(val) = env::var("YOURMOMENT_STORAGE__DB_PATH") {
            self.storage.db_path = val;
        }

        // Security
        if let Ok(val) = env::var("YOURMOMENT_ENCRYPTION_KEY") {
            self.security.encryption_key = Some(val);
        }
        if let Ok(val) = env::var("YOURMOMENT_SECURITY__ENCRYPTION_KEY") {
            self.security.encryption_key = Some(val);
        }
        if let Ok(val) = env::var("YOURMOMENT_SECURITY__KEY_FILE") {
            self.security.key_file = val;
        }
        if let Ok(val) = env::var("YOURMOMENT_SECURITY__JWT_SECRET") {
            self.security.jwt_secret = Some(val);
        }

        // Scraper
        if let Ok(val) = env::var("YOURMOMENT_SCRAPER__BASE_URL") {
            self.scraper.base_url = val;
        }
        if let Ok(val) = env::var("YOURMOMENT_SCRAPER__REQUEST_TIMEOUT_SECONDS") {
            self.scraper.request_timeout_seconds =
                parse_env_u64("YOURMOMENT_SCRAPER__REQUEST_TIMEOUT_SECONDS", &val)?;
        }
        if let Ok(val) = env::var("YOURMOMENT_SCRAPER__PAGE_LIMIT") {
            self.scraper.page_limit = parse_env_u32("YOURMOMENT_SCRAPER__PAGE_LIMIT", &val)?;
        }
        if let Ok(val) = env::var("YOURMOMENT_SCRAPER__PLATFORM_DELAY_SECONDS") {
            self.scraper.platform_delay_seconds =
                parse_env_f64("YOURMOMENT_SCRAPER__PLATFORM_DELAY_SECONDS", &val)?;
        }

        // LLM
        if let Ok(val) = env::var("YOURMOMENT_LLM__GENERATION_TIMEOUT_SECONDS") {
            self.llm.generation_timeout_seconds =
                parse_env_u64("YOURMOMENT_LLM__GENERATION_TIMEOUT_SECONDS", &val)?;
        }
        if let Ok(val) = env::var("YOURMOMENT_LLM__AI_COMMENT_PREFIX") {
            self.llm.ai_comment_prefix = val;
        }
        if let Ok(val) = env::var("YOURMOMENT_LLM__FALLBACK_TO_NEXT_PROVIDER") {
            self.llm.fallback_to_next_provider =
                parse_env_bool("YOURMOMENT_LLM__FALLBACK_TO_NEXT_PROVIDER", &val)?;
        }

        // Monitoring
        if let Ok(val) = env::var("YOURMOMENT_MONITORING__MAX_CONCURRENT_PROCESSES_PER_USER") {
            self.monitoring.max_concurrent_processes_per_user = parse_env_i64(
                "YOURMOMENT_MONITORING__MAX_CONCURRENT_PROCESSES_PER_USER",
                &val,
            )?;
        }
        if let Ok(val) = env::var("YOURMOMENT_MONITORING__DEFAULT_MAX_DURATION_MINUTES") {
            self.monitoring.default_max_duration_minutes = parse_env_i64(
                "YOURMOMENT_MONITORING__DEFAULT_MAX_DURATION_MINUTES",
                &val,
            )?;
        }
        if let Ok(val) = env::var("YOURMOMENT_MONITORING__SESSION_TTL_HOURS") {
            self.monitoring.session_ttl_hours =
                parse_env_i64("YOURMOMENT_MONITORING__SESSION_TTL_HOURS", &val)?;
        }
        if let Ok(val) = env::var("YOURMOMENT_MONITORING__MAX_VERSIONS_PER_ARTICLE") {
            self.monitoring.max_versions_per_article =
                parse_env_i64("YOURMOMENT_MONITORING__MAX_VERSIONS_PER_ARTICLE", &val)?;
        }

        // Queue
        if let Ok(val) = env::var("YOURMOMENT_QUEUE__POLL_INTERVAL_SECONDS") {
            self.queue.poll_interval_seconds =
                parse_env_u64("YOURMOMENT_QUEUE__POLL_INTERVAL_SECONDS", &val)?;
        }
        if let Ok(val) = env::var("YOURMOMENT_QUEUE__MAX_RETRIES") {
            self.queue.max_retries = parse_env_i64("YOURMOMENT_QUEUE__MAX_RETRIES", &val)?;
        }

        Ok(())
    }
}

/// Expand `~` at the start of a path to the user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    } else if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}

/// Parse an environment variable value as `u32`.
fn parse_env_u32(var_name: &str, val: &str) -> Result<u32, ConfigError> {
    val.parse::<u32>().map_err(|_| ConfigError::InvalidValue {
        field: var_name.to_string(),
        message: format!("'{val}' is not a valid u32"),
    })
}

/// Parse an environment variable value as `u64`.
fn parse_env_u64(var_name: &str, val: &str) -> Result<u64, ConfigError> {
    val.parse::<u64>().map_err(|_| ConfigError::InvalidValue {
        field: var_name.to_string(),
        message: format!("'{val}' is not a valid u64"),
    })
}

/// Parse an environment variable value as `i64`.
fn parse_env_i64(var_name: &str, val: &str) -> Result<i64, ConfigError> {
    val.parse::<i64>().map_err(|_| ConfigError::InvalidValue {
        field: var_name.to_string(),
        message: format!("'{val}' is not a valid i64"),
    })
}

/// Parse an environment variable value as `f64`.
fn parse_env_f64(var_name: &str, val: &str) -> Result<f64, ConfigError> {
    val.parse::<f64>().map_err(|_| ConfigError::InvalidValue {
        field: var_name.to_string(),
        message: format!("'{val}' is not a valid f64"),
    })
}

/// Parse an environment variable value as a boolean.
///
/// Accepts: `true`, `false`, `1`, `0`, `yes`, `no` (case-insensitive).
fn parse_env_bool(var_name: &str, val: &str) -> Result<bool, ConfigError> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            field: var_name.to_string(),
            message: format!("'{val}' is not a valid boolean (use true/false/1/0/yes/no)"),
        }),
    }
}
