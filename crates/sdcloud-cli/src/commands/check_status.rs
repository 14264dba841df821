//! `sdcloud check-status` — grounded on
//! `original_source/cli/sd_cli/commands/check_status.py`.

use anyhow::Result;
use clap::Args;

use super::api;

#[derive(Args)]
pub struct CheckStatusArgs {
    /// Job ID to check
    #[arg(short = 'j', long = "job-id")]
    job_id: String,

    /// Keep polling every 5 seconds until the job reaches a terminal state
    #[arg(short, long)]
    follow: bool,
}

pub async fn run(client: &reqwest::Client, base_url: &str, args: CheckStatusArgs) -> Result<()> {
    api::poll_with_optional_follow(client, base_url, &args.job_id, args.follow).await?;
    Ok(())
}
