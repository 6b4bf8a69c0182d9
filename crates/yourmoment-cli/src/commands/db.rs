//! `db` subcommand: migrate, seed, reset, stats.

use clap::Args;
use yourmoment_core::config::expand_tilde;
use yourmoment_core::storage;

use super::CommandError;

#[derive(Args)]
pub struct DbArgs {
    #[command(subcommand)]
    pub action: DbAction,
}

#[derive(clap::Subcommand)]
pub enum DbAction {
    /// Create or update the database schema
    Migrate,
    /// Install the default system prompt template
    Seed,
    /// Delete the database file (asks for confirmation)
    Reset {
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
    /// Show row counts per table
    Stats,
}

pub async fn execute(config_path: Option<&str>, args: DbArgs) -> Result<(), CommandError> {
    let config = super::load_config(config_path)?;

    match args.action {
        DbAction::Migrate => {
            // init_db runs the embedded migrations.
            let pool = storage::init_db(&config.storage.db_path)
                .await
                .map_err(|e| CommandError::System(anyhow::anyhow!(e)))?;
            pool.close().await;
            println!("Database migrated: {}", config.storage.db_path);
        }
        DbAction::Seed => {
            let pool = storage::init_db(&config.storage.db_path)
                .await
                .map_err(|e| CommandError::System(anyhow::anyhow!(e)))?;
            let template_id = storage::prompts::seed_default_template(&pool)
                .await
                .map_err(|e| CommandError::System(anyhow::anyhow!(e)))?;
            pool.close().await;
            println!("Default prompt template available: {template_id}");
        }
        DbAction::Reset { yes } => {
            let path = expand_tilde(&config.storage.db_path);
            if !path.exists() {
                println!("Nothing to reset: {} does not exist", path.display());
                return Ok(());
            }

            if !yes {
                let confirmed = dialoguer::Confirm::new()
                    .with_prompt(format!(
                        "Delete {} and all its data?",
                        path.display()
                    ))
                    .default(false)
                    .interact()
                    .map_err(|e| CommandError::System(anyhow::anyhow!(e)))?;
                if !confirmed {
                    return Err(CommandError::User("reset aborted".to_string()));
                }
            }

            std::fs::remove_file(&path).map_err(|e| {
                CommandError::System(anyhow::anyhow!("failed to delete database: {e}"))
            })?;
            // WAL sidecar files, if present.
            for suffix in ["-wal", "-shm"] {
                let _ = std::fs::remove_file(format!("{}{suffix}", path.display()));
            }
            println!("Database deleted: {}", path.display());
        }
        DbAction::Stats => {
            let pool = storage::init_db(&config.storage.db_path)
                .await
                .map_err(|e| CommandError::System(anyhow::anyhow!(e)))?;

            let tables = [
                "users",
                "platform_logins",
                "platform_sessions",
                "llm_providers",
                "prompt_templates",
                "monitoring_processes",
                "ai_comments",
                "tracked_students",
                "article_versions",
                "queue_tasks",
            ];
            println!("{:<24} rows", "table");
            for table in tables {
                let count: (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
                    .fetch_one(&pool)
                    .await
                    .map_err(|e| CommandError::System(anyhow::anyhow!(e)))?;
                println!("{table:<24} {}", count.0);
            }
            pool.close().await;
        }
    }

    Ok(())
}
