//! `user` subcommand: account management.

use clap::Args;
use yourmoment_core::storage::{self, users};

use super::CommandError;

#[derive(Args)]
pub struct UserArgs {
    #[command(subcommand)]
    pub action: UserAction,
}

#[derive(clap::Subcommand)]
pub enum UserAction {
    /// Create a user account
    Create {
        /// Email address (unique)
        #[arg(long)]
        email: String,
        /// Password; prompted interactively when omitted
        #[arg(long)]
        password: Option<String>,
    },
}

pub async fn execute(config_path: Option<&str>, args: UserArgs) -> Result<(), CommandError> {
    let config = super::load_config(config_path)?;

    match args.action {
        UserAction::Create { email, password } => {
            if !email.contains('@') {
                return Err(CommandError::User(format!(
                    "'{email}' is not a valid email address"
                )));
            }

            let password = match password {
                Some(password) => password,
                None => dialoguer::Password::new()
                    .with_prompt("Password")
                    .with_confirmation("Repeat password", "Passwords do not match")
                    .interact()
                    .map_err(|e| CommandError::System(anyhow::anyhow!(e)))?,
            };
            if password.len() < 8 {
                return Err(CommandError::User(
                    "password must be at least 8 characters".to_string(),
                ));
            }

            let pool = storage::init_db(&config.storage.db_path)
                .await
                .map_err(|e| CommandError::System(anyhow::anyhow!(e)))?;

            if users::get_user_by_email(&pool, &email)
                .await
                .map_err(|e| CommandError::System(anyhow::anyhow!(e)))?
                .is_some()
            {
                pool.close().await;
                return Err(CommandError::User(format!(
                    "a user with email '{email}' already exists"
                )));
            }

            let hash = users::hash_password(&password)
                .map_err(|e| CommandError::System(anyhow::anyhow!(e)))?;
            let user = users::create_user(&pool, &email, &hash)
                .await
                .map_err(|e| CommandError::System(anyhow::anyhow!(e)))?;
            pool.close().await;

            println!("User created: {} ({})", user.email, user.id);
        }
    }

    Ok(())
}
