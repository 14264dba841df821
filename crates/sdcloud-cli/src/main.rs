//! sdcloud CLI: a thin HTTP client for the job-orchestration service.

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(name = "sdcloud")]
#[command(about = "Client for the sdcloud job-orchestration service", long_about = None)]
struct Cli {
    /// API server base URL
    #[arg(long, env = "SDCLOUD_API_URL", default_value = "http://localhost:3000")]
    api_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Schedule a new job
    Schedule(commands::schedule::ScheduleArgs),
    /// Check status of a job
    CheckStatus(commands::check_status::CheckStatusArgs),
    /// Download output of an already finished job
    Download(commands::download::DownloadArgs),
    /// Cancel a job
    Cancel(commands::cancel::CancelArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let client = reqwest::Client::new();

    match cli.command {
        Commands::Schedule(args) => commands::schedule::run(&client, &cli.api_url, args).await,
        Commands::CheckStatus(args) => commands::check_status::run(&client, &cli.api_url, args).await,
        Commands::Download(args) => commands::download::run(&client, &cli.api_url, args).await,
        Commands::Cancel(args) => commands::cancel::run(&client, &cli.api_url, args).await,
    }
}
