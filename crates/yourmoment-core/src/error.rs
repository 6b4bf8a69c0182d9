//! Error types for the yourMoment core library.
//!
//! Each concern has its own error enum to provide clear error boundaries.
//! The library uses `thiserror` for structured, typed errors.

/// Errors related to configuration loading, parsing, and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required configuration field is absent.
    #[error("missing required config field: {field}")]
    MissingField {
        /// The name of the missing field.
        field: String,
    },

    /// A configuration field has an unacceptable value.
    #[error("invalid value for config field '{field}': {message}")]
    InvalidValue {
        /// The name of the invalid field.
        field: String,
        /// A description of why the value is invalid.
        message: String,
    },

    /// The configuration file does not exist at the specified path.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// The path that was searched.
        path: String,
    },

    /// TOML deserialization failed.
    #[error("failed to parse config file: {source}")]
    ParseError {
        /// The underlying TOML parse error.
        #[source]
        source: toml::de::Error,
    },
}

/// Errors from the credential vault.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Key material could not be loaded or persisted.
    #[error("encryption key error: {message}")]
    Key {
        /// Details about what went wrong with the key.
        message: String,
    },

    /// Encryption of a plaintext failed.
    #[error("encryption failed: {message}")]
    Encrypt {
        /// Details about the failure.
        message: String,
    },

    /// Decryption failed: wrong key, tampered token, or malformed ciphertext.
    #[error("invalid encryption token: data may be corrupted or the key is wrong")]
    Decrypt,
}

/// Errors from scraping the myMoment platform.
#[derive(Debug, thiserror::Error)]
pub enum ScrapeError {
    /// Network-level failure talking to the platform.
    #[error("platform request failed: {source}")]
    Network {
        /// The underlying HTTP client error.
        #[source]
        source: reqwest::Error,
    },

    /// Login was rejected or the session is no longer authenticated.
    #[error("platform authentication failed: {message}")]
    AuthFailed {
        /// Details about the rejection.
        message: String,
    },

    /// The platform returned an error status for a non-auth request.
    #[error("platform error (HTTP {status}): {message}")]
    Http {
        /// The HTTP status code.
        status: u16,
        /// The response body or a summary of it.
        message: String,
    },

    /// The page did not contain the expected structure.
    #[error("unexpected platform HTML: {message}")]
    UnexpectedHtml {
        /// What was missing or malformed.
        message: String,
    },

    /// A filter required for the requested listing is not configured.
    #[error("missing required filter: {field}")]
    MissingFilter {
        /// The filter field that is absent.
        field: String,
    },
}

/// Errors from platform session management.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The login does not exist, is inactive, or belongs to another user.
    #[error("platform login not found or inactive: {login_id}")]
    LoginUnavailable {
        /// The login id that was requested.
        login_id: String,
    },

    /// Credential decryption failed.
    #[error("credential error: {0}")]
    Crypto(#[from] CryptoError),

    /// Authentication against the platform failed.
    #[error("platform error: {0}")]
    Scrape(#[from] ScrapeError),

    /// Database failure while reading or writing session rows.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Session acquisition exceeded its timeout.
    #[error("session acquisition timed out after {seconds}s")]
    AcquireTimeout {
        /// Number of seconds waited.
        seconds: u64,
    },
}

/// Errors from interacting with LLM providers (OpenAI, Mistral).
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// HTTP request to the LLM endpoint failed.
    #[error("LLM HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// LLM API returned an error response.
    #[error("LLM API error (status {status}): {message}")]
    Api {
        /// The HTTP status code.
        status: u16,
        /// The error message from the API.
        message: String,
    },

    /// LLM provider rate limit hit.
    #[error("LLM rate limited, retry after {retry_after_secs} seconds")]
    RateLimited {
        /// Seconds to wait before retrying.
        retry_after_secs: u64,
    },

    /// The call exceeded the configured generation timeout.
    #[error("LLM call timed out after {seconds}s")]
    Timeout {
        /// The timeout that was exceeded.
        seconds: u64,
    },

    /// LLM response could not be parsed into the structured comment schema.
    #[error("failed to parse LLM response: {0}")]
    Parse(String),

    /// Unknown provider name in a configuration row.
    #[error("unsupported LLM provider: {name}")]
    UnsupportedProvider {
        /// The provider name that was rejected.
        name: String,
    },

    /// All providers in the fallback chain failed.
    #[error("all {attempts} LLM providers failed, last error: {last_error}")]
    ProviderExhausted {
        /// How many providers were tried.
        attempts: usize,
        /// Message from the final failure.
        last_error: String,
    },
}

/// Errors from SQLite storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Failed to connect to the SQLite database.
    #[error("database connection error: {source}")]
    Connection {
        /// The underlying SQLx error.
        #[source]
        source: sqlx::Error,
    },

    /// Database migration failed.
    #[error("database migration error: {source}")]
    Migration {
        /// The underlying migration error.
        #[source]
        source: sqlx::migrate::MigrateError,
    },

    /// A database query failed.
    #[error("database query error: {source}")]
    Query {
        /// The underlying SQLx error.
        #[source]
        source: sqlx::Error,
    },
}

/// Errors from the background work queue.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The queue backend is unreachable.
    #[error("background queue unavailable: {message}")]
    Unavailable {
        /// Details about the failure.
        message: String,
    },

    /// Storage failure underneath the queue.
    #[error("queue storage error: {0}")]
    Storage(#[from] StorageError),

    /// The referenced task does not exist.
    #[error("queue task not found: {task_id}")]
    TaskNotFound {
        /// The task id that was requested.
        task_id: String,
    },
}

/// Errors from student article versioning.
#[derive(Debug, thiserror::Error)]
pub enum VersioningError {
    /// The referenced login is not flagged as an admin login.
    #[error("login {login_id} is not an admin login")]
    AdminRequired {
        /// The offending login id.
        login_id: String,
    },

    /// The tracked student does not exist or is inactive.
    #[error("tracked student not found: {student_id}")]
    StudentNotFound {
        /// The student id that was requested.
        student_id: String,
    },

    /// Storage failure.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}
