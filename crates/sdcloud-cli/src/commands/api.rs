//! Thin wrappers around the service's HTTP surface, shared by every
//! subcommand. Grounded on `original_source/cli/sd_cli/api/service.py`'s
//! `Service*Command` classes: one function per endpoint, returning the
//! decoded JSON body.

use anyhow::{Context, Result, bail};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct JobStatus {
    pub status: String,
    pub progress: (i64, i64),
    pub logs: Option<String>,
}

pub async fn check_status(client: &reqwest::Client, base_url: &str, job_id: &str) -> Result<JobStatus> {
    let url = format!("{}/check_status", base_url.trim_end_matches('/'));
    let resp = client
        .get(url)
        .query(&[("job_id", job_id)])
        .send()
        .await
        .context("sending check_status request")?;
    let resp = error_for_status(resp).await?;
    resp.json().await.context("decoding check_status response")
}

pub async fn get_download_url(client: &reqwest::Client, base_url: &str, job_id: &str) -> Result<String> {
    let url = format!("{}/get_download_url", base_url.trim_end_matches('/'));
    let resp = client
        .get(url)
        .query(&[("job_id", job_id)])
        .send()
        .await
        .context("sending get_download_url request")?;
    let resp = error_for_status(resp).await?;
    #[derive(Deserialize)]
    struct Body {
        download_url: String,
    }
    let body: Body = resp.json().await.context("decoding get_download_url response")?;
    Ok(body.download_url)
}

pub async fn cancel_job(client: &reqwest::Client, base_url: &str, job_id: &str) -> Result<JobStatus> {
    let url = format!("{}/cancel_job", base_url.trim_end_matches('/'));
    let resp = client
        .get(url)
        .query(&[("job_id", job_id)])
        .send()
        .await
        .context("sending cancel_job request")?;
    let resp = error_for_status(resp).await?;
    resp.json().await.context("decoding cancel_job response")
}

/// Surface a non-2xx response as an operational failure with whatever body
/// the server sent (the service only includes a message body in dev mode,
/// per spec.md §6 — an empty body in production still becomes a useful exit
/// code 1 failure, just without detail).
async fn error_for_status(resp: reqwest::Response) -> Result<reqwest::Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    bail!("request failed with status {status}: {body}");
}

fn print_progress(job_id: &str, status: &JobStatus) {
    println!(
        "Job ID: {job_id}\nStatus: {}\nProgress: {}/{}\n",
        status.status, status.progress.0, status.progress.1
    );
}

/// Poll `check_status` every 5 seconds (sleeping before every check,
/// including the first) until the job reaches a terminal state. Mirrors
/// `schedule.py`'s post-submission `--follow` loop.
pub async fn follow_until_terminal(client: &reqwest::Client, base_url: &str, job_id: &str) -> Result<JobStatus> {
    loop {
        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        let status = check_status(client, base_url, job_id).await?;
        print_progress(job_id, &status);

        match status.status.as_str() {
            "FAILED" => {
                if let Some(logs) = &status.logs {
                    println!("Logs from failed stage:\n{logs}");
                }
                bail!("job failed");
            }
            "SUCCEEDED" => return Ok(status),
            _ => {}
        }
    }
}

/// Check once immediately, then keep polling every 5 seconds only while
/// `follow` is set and the job hasn't reached a terminal state. Mirrors
/// `check_status.py`'s loop exactly.
pub async fn poll_with_optional_follow(
    client: &reqwest::Client,
    base_url: &str,
    job_id: &str,
    follow: bool,
) -> Result<JobStatus> {
    loop {
        let status = check_status(client, base_url, job_id).await?;
        print_progress(job_id, &status);

        match status.status.as_str() {
            "FAILED" => bail!("job failed"),
            "SUCCEEDED" => return Ok(status),
            _ => {}
        }
        if !follow {
            return Ok(status);
        }
        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
    }
}
