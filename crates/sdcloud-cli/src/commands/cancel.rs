//! `sdcloud cancel` — grounded on
//! `original_source/cli/sd_cli/commands/cancel.py`.

use anyhow::Result;
use clap::Args;

use super::api;

#[derive(Args)]
pub struct CancelArgs {
    /// Job ID to cancel
    #[arg(short = 'j', long = "job-id")]
    job_id: String,
}

pub async fn run(client: &reqwest::Client, base_url: &str, args: CancelArgs) -> Result<()> {
    let status = api::cancel_job(client, base_url, &args.job_id).await?;
    println!(
        "Job ID: {}\nStatus: {}\nProgress: {}/{}\n",
        args.job_id, status.status, status.progress.0, status.progress.1
    );
    Ok(())
}
