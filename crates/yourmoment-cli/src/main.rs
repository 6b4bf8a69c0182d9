/// yourMoment CLI.
///
/// Entry point for the yourmoment binary. Parses CLI arguments, initializes
/// logging, and dispatches to subcommand handlers.
///
/// Exit codes: 0 success, 1 user error (validation, configuration),
/// 2 system error (database, queue, platform).
mod commands;

use clap::Parser;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use commands::CommandError;

/// Monitoring and AI commenting service for the myMoment platform
#[derive(Parser)]
#[command(name = "yourmoment")]
#[command(version)]
#[command(about = "Monitoring and AI commenting service for the myMoment platform")]
#[command(after_help = "\
Quick start:
  1. yourmoment db migrate      — create the database schema
  2. yourmoment db seed         — install the default prompt template
  3. yourmoment user create     — create the first user
  4. yourmoment worker          — join the work pool")]
struct Cli {
    /// Path to config.toml
    #[arg(short = 'c', long, global = true)]
    config: Option<String>,

    /// Enable verbose logging (debug level)
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Start the HTTP listener (handled by the API deployment)
    Server,
    /// Join the background work pool
    Worker,
    /// Run the periodic-task dispatcher
    Scheduler,
    /// Database management
    Db(commands::db::DbArgs),
    /// User management
    User(commands::user::UserArgs),
    /// Background queue management
    Queue(commands::queue::QueueArgs),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize tracing-subscriber.
    //
    // Priority: RUST_LOG env var > --verbose/--quiet flags > default (info).
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else if cli.verbose {
        EnvFilter::new("yourmoment=debug,yourmoment_core=debug,info")
    } else if cli.quiet {
        EnvFilter::new("error")
    } else {
        EnvFilter::new("yourmoment=info,yourmoment_core=info,warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(cli.verbose)
        .compact()
        .init();

    let result = match cli.command {
        Commands::Server => commands::server::execute(),
        Commands::Worker => commands::worker::execute(cli.config.as_deref()).await,
        Commands::Scheduler => commands::scheduler::execute(cli.config.as_deref()).await,
        Commands::Db(args) => commands::db::execute(cli.config.as_deref(), args).await,
        Commands::User(args) => commands::user::execute(cli.config.as_deref(), args).await,
        Commands::Queue(args) => commands::queue::execute(cli.config.as_deref(), args).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(CommandError::User(message)) => {
            eprintln!("Error: {message}");
            ExitCode::from(1)
        }
        Err(CommandError::System(source)) => {
            eprintln!("System error: {source:#}");
            ExitCode::from(2)
        }
    }
}
