use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use insightwatch_core::{AppConfig, CoreError, ErrorExt};
use tracing_subscriber::EnvFilter;

mod control;
mod daemon;

const DEFAULT_LOG_FILTER: &str =
    "insightwatch=info,background_service=info,database=info,reddit_client=info,service_control=info";

#[derive(Parser)]
#[command(name = "insightwatch")]
#[command(about = "Watches a Reddit community for valuable posts and keeps a digest")]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to ./insightwatch.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the monitoring daemon in the foreground
    Run,

    /// Run a single check now and print the digest
    Check,

    /// Print a digest of stored insights
    Digest {
        /// First day to include (YYYY-MM-DD, UTC); defaults to today
        #[arg(long)]
        since: Option<NaiveDate>,
    },

    /// Start the daemon in the background
    Start,

    /// Stop the background daemon
    Stop,

    /// Stop then start the background daemon
    Restart,

    /// Show process liveness and daemon health
    Status,

    /// Show the daemon log
    Logs {
        /// Number of lines to show
        #[arg(short = 'n', long, default_value_t = 50)]
        lines: usize,

        /// Keep printing as the log grows
        #[arg(short, long)]
        follow: bool,
    },

    /// Kill stray daemon processes and port holders, then clear the service record
    Cleanup,
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            report_failure(&e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = AppConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run => daemon::run(config).await,
        Commands::Check => daemon::check(config).await,
        Commands::Digest { since } => daemon::digest(config, since).await,
        Commands::Start => control::start(config, cli.config).await,
        Commands::Stop => control::stop(config, cli.config).await,
        Commands::Restart => control::restart(config, cli.config).await,
        Commands::Status => control::status(config, cli.config).await,
        Commands::Logs { lines, follow } => control::logs(config, cli.config, lines, follow).await,
        Commands::Cleanup => control::cleanup(config, cli.config).await,
    }
}

fn report_failure(error: &anyhow::Error) {
    match error.downcast_ref::<CoreError>() {
        Some(core) => {
            eprintln!("Error: {}", core.user_friendly_message());
            if let Some(hint) = core.remediation_hint() {
                eprintln!("Hint: {}", hint);
            }
        }
        None => match error.downcast_ref::<insightwatch_core::ConfigError>() {
            Some(config) => {
                eprintln!("Error: {}", config.user_friendly_message());
                if let Some(hint) = config.remediation_hint() {
                    eprintln!("Hint: {}", hint);
                }
            }
            None => eprintln!("Error: {:#}", error),
        },
    }
}
