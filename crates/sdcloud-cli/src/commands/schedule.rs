//! `sdcloud schedule` — grounded on `original_source/cli/sd_cli/commands/schedule.py`.
//! One clap arg per `RunConfig` field; the multipart form this builds must
//! match the field names `sdcloud_api::routes::jobs::build_run_config` reads.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use reqwest::multipart::{Form, Part};

use super::{api, download};

#[derive(Args)]
pub struct ScheduleArgs {
    /// Wait until the job completes before exiting
    #[arg(short, long)]
    follow: bool,

    /// Download the result once the job completes. Implies --follow.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Path to the input massing mesh (.obj, .fbx, or .glb)
    #[arg(short = 'i', long = "input-mesh")]
    input_mesh: PathBuf,

    /// Paths to style images that should influence the result
    #[arg(short = 's', long = "style-images-paths", num_args = 0..)]
    style_images_paths: Vec<PathBuf>,

    /// Weight of influence for each style image: either one per image, or
    /// three per image (one per pipeline stage)
    #[arg(long = "style-images-weights", num_args = 0..)]
    style_images_weights: Vec<f32>,

    #[arg(long, default_value = "best quality, a multi-floor building, extremely detailed, a lot of windows")]
    pos_prompt: String,
    #[arg(long, default_value = "worst quality, bad quality, simple, wardrobe")]
    neg_prompt: String,
    #[arg(long, default_value_t = 7.5)]
    prompt_strength: f32,
    #[arg(long, default_value_t = 42)]
    random_seed: u64,
    #[arg(long, default_value_t = 2048)]
    texture_resolution: u32,

    /// Style-specific LoRA checkpoints to use
    #[arg(short = 'l', long, num_args = 0..)]
    loras: Vec<String>,
    /// Weight of influence for each LoRA; same count as --loras
    #[arg(long = "loras-weights", num_args = 0..)]
    loras_weights: Vec<f32>,

    #[arg(long, default_value_t = 4)]
    n_cameras: usize,
    /// Single value broadcast to every camera, or one per camera
    #[arg(long, num_args = 1.., default_values_t = [0.0])]
    camera_yaws: Vec<f32>,
    #[arg(long, num_args = 1.., default_values_t = [std::f32::consts::FRAC_PI_2])]
    camera_pitches: Vec<f32>,

    #[arg(long, default_value = "none")]
    total_remesh_mode: String,
    #[arg(long, default_value = "Marigold")]
    depth_algorithm: String,

    #[arg(long)]
    disable_3d: bool,
    #[arg(long)]
    disable_displacement: bool,
    #[arg(long)]
    enable_semantics: bool,
    #[arg(long)]
    enable_uv_texture_upscale: bool,

    #[arg(long, default_value_t = 20)]
    stage_1_steps: u32,
    #[arg(long, default_value_t = 20)]
    stage_2_steps: u32,
}

pub async fn run(client: &reqwest::Client, base_url: &str, args: ScheduleArgs) -> Result<()> {
    let follow = args.follow || args.output.is_some();

    let mesh_bytes = tokio::fs::read(&args.input_mesh)
        .await
        .with_context(|| format!("reading {}", args.input_mesh.display()))?;
    let mesh_name = file_name(&args.input_mesh);

    let mut form = Form::new()
        .part("input_mesh", Part::bytes(mesh_bytes).file_name(mesh_name))
        .text("pos_prompt", args.pos_prompt)
        .text("neg_prompt", args.neg_prompt)
        .text("prompt_strength", args.prompt_strength.to_string())
        .text("random_seed", args.random_seed.to_string())
        .text("texture_resolution", args.texture_resolution.to_string())
        .text("n_cameras", args.n_cameras.to_string())
        .text("total_remesh_mode", args.total_remesh_mode)
        .text("depth_algorithm", args.depth_algorithm)
        .text("disable_3d", args.disable_3d.to_string())
        .text("disable_displacement", args.disable_displacement.to_string())
        .text("enable_semantics", args.enable_semantics.to_string())
        .text("enable_uv_texture_upscale", args.enable_uv_texture_upscale.to_string())
        .text("stage_1_steps", args.stage_1_steps.to_string())
        .text("stage_2_steps", args.stage_2_steps.to_string());

    for path in &args.style_images_paths {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        form = form.part("style_images", Part::bytes(bytes).file_name(file_name(path)));
    }
    for weight in &args.style_images_weights {
        form = form.text("style_images_weights", weight.to_string());
    }
    for lora in &args.loras {
        form = form.text("loras", lora.clone());
    }
    for weight in &args.loras_weights {
        form = form.text("loras_weights", weight.to_string());
    }
    for yaw in &args.camera_yaws {
        form = form.text("camera_yaws", yaw.to_string());
    }
    for pitch in &args.camera_pitches {
        form = form.text("camera_pitches", pitch.to_string());
    }

    let url = format!("{}/schedule_job", base_url.trim_end_matches('/'));
    let resp = client
        .post(url)
        .multipart(form)
        .send()
        .await
        .context("sending schedule_job request")?;

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("request failed with status {status}: {body}");
    }

    #[derive(serde::Deserialize)]
    struct Body {
        job_id: String,
    }
    let body: Body = resp.json().await.context("decoding schedule_job response")?;
    println!("Job ID: {}", body.job_id);

    if follow {
        api::follow_until_terminal(client, base_url, &body.job_id).await?;
    }

    if let Some(output) = &args.output {
        download::download_result(client, base_url, &body.job_id, output).await?;
    }

    Ok(())
}

fn file_name(path: &PathBuf) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("upload")
        .to_string()
}
