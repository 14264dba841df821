//! `sdcloud download` — grounded on `original_source/cli/sd_cli/commands/download.py`
//! and `original_source/cli/sd_cli/utils/download_result.py`.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Args;

use super::api;

#[derive(Args)]
pub struct DownloadArgs {
    /// Job ID whose result to download
    #[arg(short = 'j', long = "job-id")]
    job_id: String,

    /// Path where output will be downloaded. If it ends with .zip, the zip
    /// archive itself is saved there; otherwise a directory with this name
    /// is created and the archive is extracted into it.
    #[arg(short, long)]
    output: PathBuf,
}

pub async fn run(client: &reqwest::Client, base_url: &str, args: DownloadArgs) -> Result<()> {
    let status = api::check_status(client, base_url, &args.job_id).await?;
    match status.status.as_str() {
        "FAILED" => bail!("Cannot download output of failed job"),
        "SUCCEEDED" => {}
        _ => bail!("Job is still pending, wait until job is completed"),
    }

    download_result(client, base_url, &args.job_id, &args.output).await
}

/// Fetch the download URL and either save the zip archive directly at
/// `output`, or extract it into a directory named `output`.
pub async fn download_result(
    client: &reqwest::Client,
    base_url: &str,
    job_id: &str,
    output: &PathBuf,
) -> Result<()> {
    let download_url = api::get_download_url(client, base_url, job_id).await?;

    let bytes = client
        .get(&download_url)
        .send()
        .await
        .context("downloading job result")?
        .bytes()
        .await
        .context("reading job result body")?;

    if output.extension().and_then(|ext| ext.to_str()) == Some("zip") {
        tokio::fs::write(output, &bytes)
            .await
            .with_context(|| format!("writing {}", output.display()))?;
        return Ok(());
    }

    let tmp = tempfile::NamedTempFile::new().context("creating temp file for result archive")?;
    tokio::fs::write(tmp.path(), &bytes)
        .await
        .context("writing result archive to temp file")?;

    let output = output.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let file = std::fs::File::open(tmp.path())?;
        let mut archive = zip::ZipArchive::new(file).context("opening result archive")?;
        std::fs::create_dir_all(&output)
            .with_context(|| format!("creating output directory {}", output.display()))?;
        archive
            .extract(&output)
            .context("extracting result archive")?;
        Ok(())
    })
    .await
    .context("extraction task panicked")??;

    Ok(())
}
