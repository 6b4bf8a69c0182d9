//! `queue` subcommand: inspect and manage the background work broker.

use clap::Args;
use yourmoment_core::{queue, storage};

use super::CommandError;

#[derive(Args)]
pub struct QueueArgs {
    #[command(subcommand)]
    pub action: QueueAction,
}

#[derive(clap::Subcommand)]
pub enum QueueAction {
    /// Show queue depths
    Info,
    /// Check broker reachability
    Health,
    /// Revoke all queued tasks
    Clear,
}

pub async fn execute(config_path: Option<&str>, args: QueueArgs) -> Result<(), CommandError> {
    let config = super::load_config(config_path)?;
    let pool = storage::init_db(&config.storage.db_path)
        .await
        .map_err(|e| CommandError::System(anyhow::anyhow!(e)))?;

    let result = match args.action {
        QueueAction::Info => {
            let depths = queue::depths(&pool)
                .await
                .map_err(|e| CommandError::System(anyhow::anyhow!(e)))?;
            println!("{:<14} {:>8} {:>8}", "queue", "queued", "claimed");
            for depth in depths {
                println!("{:<14} {:>8} {:>8}", depth.queue, depth.queued, depth.claimed);
            }
            Ok(())
        }
        QueueAction::Health => match queue::health_check(&pool).await {
            Ok(()) => {
                println!("Queue broker reachable");
                Ok(())
            }
            Err(e) => Err(CommandError::System(anyhow::anyhow!(e))),
        },
        QueueAction::Clear => {
            let cleared = queue::clear_queued(&pool)
                .await
                .map_err(|e| CommandError::System(anyhow::anyhow!(e)))?;
            println!("Revoked {cleared} queued task(s)");
            Ok(())
        }
    };

    pool.close().await;
    result
}
