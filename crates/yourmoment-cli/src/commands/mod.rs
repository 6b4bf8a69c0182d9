//! Subcommand implementations.

pub mod db;
pub mod queue;
pub mod scheduler;
pub mod server;
pub mod user;
pub mod worker;

use yourmoment_core::config::Config;
use yourmoment_core::startup::AppState;

/// Command outcome classification for exit codes.
#[derive(Debug)]
pub enum CommandError {
    /// The user supplied something invalid (exit code 1).
    User(String),
    /// The system failed underneath the command (exit code 2).
    System(anyhow::Error),
}

impl From<anyhow::Error> for CommandError {
    fn from(source: anyhow::Error) -> Self {
        CommandError::System(source)
    }
}

/// Load and validate configuration, reporting problems as user errors.
pub fn load_config(config_path: Option<&str>) -> Result<Config, CommandError> {
    Config::load_and_validate(config_path).map_err(|errors| {
        let rendered: Vec<String> = errors.iter().map(ToString::to_string).collect();
        CommandError::User(format!("invalid configuration:\n  {}", rendered.join("\n  ")))
    })
}

/// Load configuration and initialize the full application state.
pub async fn init_state(config_path: Option<&str>) -> Result<AppState, CommandError> {
    let config = load_config(config_path)?;
    AppState::init(config)
        .await
        .map_err(|e| CommandError::System(anyhow::anyhow!(e)))
}
