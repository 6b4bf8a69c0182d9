//! `scheduler` subcommand: run the periodic-task dispatcher.

use tokio_util::sync::CancellationToken;
use yourmoment_core::monitor::runner;

use super::CommandError;

pub async fn execute(config_path: Option<&str>) -> Result<(), CommandError> {
    let state = super::init_state(config_path).await?;
    let ctx = state.stage_context();

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, stopping scheduler");
            signal_cancel.cancel();
        }
    });

    runner::scheduler_loop(ctx, cancel).await;
    Ok(())
}
