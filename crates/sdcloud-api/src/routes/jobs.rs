//! Job submission, status, download, and cancellation.
//!
//! Grounded on `buildit_api::routes::pipelines`'s `Json`/`Query`/`State`
//! extractor pattern and `?`-propagated `ApiError`s, generalized from JSON
//! bodies to the multipart submission spec.md §4.6 requires: the mesh and
//! style images travel as file fields, every `RunConfig` scalar travels as a
//! text field on the same form.

use std::collections::HashMap;

use axum::Json;
use axum::Router;
use axum::extract::{Multipart, Query, State};
use axum::routing::{get, post};
use serde::Deserialize;
use serde_json::json;

use sdcloud_core::{Job, JobId, JobStatus};
use sdcloud_pipeline::{DepthAlgorithm, RemeshMode, RunConfig, plan};

use crate::{ApiError, AppState};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/schedule_job", post(schedule_job))
        .route("/check_status", get(check_status))
        .route("/get_download_url", get(get_download_url))
        .route("/cancel_job", get(cancel_job))
}

#[derive(Debug, Deserialize)]
struct JobIdQuery {
    job_id: String,
}

fn parse_job_id(raw: &str) -> Result<JobId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::not_found(format!("malformed job id: {raw}")))
}

/// Accumulates a multipart form into the pieces a submission needs: the
/// single `input_mesh` file, the repeated `style_images` files in upload
/// order, and every other field as raw text (possibly repeated, for the
/// vector-valued `RunConfig` fields like `camera_yaws`).
#[derive(Default)]
struct SubmissionForm {
    text: HashMap<String, Vec<String>>,
    input_mesh: Option<(String, Vec<u8>)>,
    style_images: Vec<(String, Vec<u8>)>,
}

impl SubmissionForm {
    async fn collect(mut multipart: Multipart) -> Result<Self, ApiError> {
        let mut form = SubmissionForm::default();
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| ApiError::internal(format!("reading multipart field: {e}")))?
        {
            let Some(name) = field.name().map(str::to_string) else {
                continue;
            };
            let file_name = field.file_name().map(str::to_string);

            match name.as_str() {
                "input_mesh" => {
                    let file_name = file_name.unwrap_or_else(|| "input_mesh.obj".to_string());
                    let bytes = field
                        .bytes()
                        .await
                        .map_err(|e| ApiError::internal(format!("reading input_mesh: {e}")))?;
                    form.input_mesh = Some((file_name, bytes.to_vec()));
                }
                "style_images" => {
                    let file_name = file_name.unwrap_or_else(|| "style_image".to_string());
                    let bytes = field
                        .bytes()
                        .await
                        .map_err(|e| ApiError::internal(format!("reading style_images: {e}")))?;
                    form.style_images.push((file_name, bytes.to_vec()));
                }
                _ => {
                    let text = field
                        .text()
                        .await
                        .map_err(|e| ApiError::internal(format!("reading field {name}: {e}")))?;
                    form.text.entry(name).or_default().push(text);
                }
            }
        }
        Ok(form)
    }

    fn one(&self, name: &str) -> Option<&str> {
        self.text.get(name).and_then(|v| v.last()).map(String::as_str)
    }

    fn many(&self, name: &str) -> Vec<String> {
        self.text.get(name).cloned().unwrap_or_default()
    }
}

fn required(env: sdcloud_config::Environment, form: &SubmissionForm, name: &str) -> Result<String, ApiError> {
    form.one(name)
        .map(str::to_string)
        .ok_or_else(|| ApiError::validation(env, format!("missing required field: {name}")))
}

fn parse_field<T: std::str::FromStr>(
    env: sdcloud_config::Environment,
    name: &str,
    raw: &str,
) -> Result<T, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::validation(env, format!("invalid value for {name}: {raw}")))
}

fn parse_many<T: std::str::FromStr>(
    env: sdcloud_config::Environment,
    name: &str,
    values: &[String],
) -> Result<Vec<T>, ApiError> {
    values
        .iter()
        .map(|v| parse_field(env, name, v))
        .collect::<Result<Vec<T>, ApiError>>()
}

fn truthy(raw: &str) -> bool {
    matches!(raw.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

/// Build a [`RunConfig`] from the submitted form's text fields.
fn build_run_config(
    env: sdcloud_config::Environment,
    form: &SubmissionForm,
    style_image_count: usize,
) -> Result<RunConfig, ApiError> {
    let pos_prompt = required(env, form, "pos_prompt")?;
    let neg_prompt = form.one("neg_prompt").unwrap_or("").to_string();
    let prompt_strength = parse_field(env, "prompt_strength", &required(env, form, "prompt_strength")?)?;
    let random_seed = form
        .one("random_seed")
        .map(|v| parse_field(env, "random_seed", v))
        .transpose()?;
    let texture_resolution =
        parse_field(env, "texture_resolution", &required(env, form, "texture_resolution")?)?;

    let style_images_weights = parse_many(env, "style_images_weights", &form.many("style_images_weights"))?;

    let loras = form.many("loras");
    let loras_weights = parse_many(env, "loras_weights", &form.many("loras_weights"))?;

    let n_cameras = parse_field(env, "n_cameras", &required(env, form, "n_cameras")?)?;
    let camera_yaws = parse_many(env, "camera_yaws", &form.many("camera_yaws"))?;
    let camera_pitches = parse_many(env, "camera_pitches", &form.many("camera_pitches"))?;

    let total_remesh_mode: RemeshMode =
        parse_field(env, "total_remesh_mode", &required(env, form, "total_remesh_mode")?)?;
    let depth_algorithm: DepthAlgorithm =
        parse_field(env, "depth_algorithm", &required(env, form, "depth_algorithm")?)?;

    let disable_3d = form.one("disable_3d").map(truthy).unwrap_or(false);
    let disable_displacement = form.one("disable_displacement").map(truthy).unwrap_or(false);
    let enable_semantics = form.one("enable_semantics").map(truthy).unwrap_or(false);
    let enable_uv_texture_upscale = form.one("enable_uv_texture_upscale").map(truthy).unwrap_or(false);

    let stage_1_steps = form
        .one("stage_1_steps")
        .map(|v| parse_field(env, "stage_1_steps", v))
        .transpose()?
        .unwrap_or(20);
    let stage_2_steps = form
        .one("stage_2_steps")
        .map(|v| parse_field(env, "stage_2_steps", v))
        .transpose()?
        .unwrap_or(20);

    Ok(RunConfig {
        pos_prompt,
        neg_prompt,
        prompt_strength,
        random_seed,
        texture_resolution,
        style_image_count,
        style_images_weights,
        loras,
        loras_weights,
        n_cameras,
        camera_yaws,
        camera_pitches,
        total_remesh_mode,
        depth_algorithm,
        disable_3d,
        disable_displacement,
        enable_semantics,
        enable_uv_texture_upscale,
        stage_1_steps,
        stage_2_steps,
    })
}

fn style_image_file_name(index: usize, original: &str) -> String {
    let ext = std::path::Path::new(original)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("png");
    format!("{index:03}_original.{ext}")
}

/// `POST /schedule_job`: validate the submission, stage its files into the
/// job's shared scratch directory, plan its stages, and persist the job row
/// at `QUEUED`. The promoter picks it up on its next tick.
async fn schedule_job(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<serde_json::Value>, ApiError> {
    let env = state.settings.env;
    let form = SubmissionForm::collect(multipart).await?;

    let (mesh_name, mesh_bytes) = form
        .input_mesh
        .as_ref()
        .ok_or_else(|| ApiError::validation(env, "missing required file field: input_mesh"))?;
    let _ = mesh_name;

    let config = build_run_config(env, &form, form.style_images.len())?;
    config
        .validate()
        .map_err(|e| ApiError::from_core(e, env))?;

    let job_id = JobId::new();
    let job_dir = sdcloud_storage::get_tmp_dir(&state.tmp_dir(), job_id)
        .map_err(|e| ApiError::from_core(e, env))?;

    let input_dir = job_dir.join("job/input");
    std::fs::write(input_dir.join("input_mesh.obj"), mesh_bytes)
        .map_err(|e| ApiError::internal(format!("staging input_mesh: {e}")))?;
    for (idx, (file_name, bytes)) in form.style_images.iter().enumerate() {
        let name = style_image_file_name(idx, file_name);
        std::fs::write(input_dir.join(name), bytes)
            .map_err(|e| ApiError::internal(format!("staging style image {idx}: {e}")))?;
    }

    sdcloud_storage::save_data(&state.store, job_id, &job_dir)
        .await
        .map_err(|e| ApiError::from_core(e, env))?;
    let _ = std::fs::remove_dir_all(&job_dir);

    let steps = plan(&config);
    let payload = serde_json::to_value(&config)
        .map_err(|e| ApiError::internal(format!("serializing submission: {e}")))?;
    let mut job = Job::new(steps, payload);
    job.id = job_id;

    state
        .job_repo
        .create(&job)
        .await
        .map_err(ApiError::from)?;

    Ok(Json(json!({ "job_id": job.id.to_string() })))
}

/// `GET /check_status?job_id=...`: current lifecycle state, `[progress,
/// total]`, and logs (populated only once a stage has failed).
async fn check_status(
    State(state): State<AppState>,
    Query(q): Query<JobIdQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let job_id = parse_job_id(&q.job_id)?;
    let job = state.job_repo.get(job_id).await.map_err(ApiError::from)?;

    Ok(Json(json!({
        "status": job.status.to_string(),
        "progress": [job.progress, job.total],
        "logs": job.logs,
    })))
}

/// `GET /get_download_url?job_id=...`: only meaningful once the job has
/// `SUCCEEDED` — the `cleanup` stage deletes the archive this URL points at
/// for every other terminal state.
async fn get_download_url(
    State(state): State<AppState>,
    Query(q): Query<JobIdQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let job_id = parse_job_id(&q.job_id)?;
    let job = state.job_repo.get(job_id).await.map_err(ApiError::from)?;

    if job.status != JobStatus::Succeeded {
        return Err(ApiError::conflict(format!(
            "job {job_id} is not SUCCEEDED (status: {})",
            job.status
        )));
    }

    let url = sdcloud_storage::public_download_url(&state.settings.public_base_url, job_id)
        .map_err(|e| ApiError::from_core(e, state.settings.env))?;

    Ok(Json(json!({ "download_url": url.to_string() })))
}

/// `GET /cancel_job?job_id=...`: marks the job `CANCELLED` and best-effort
/// revokes its most recently dispatched task. A worker already running that
/// task will still finish it; the poller's revoked-task check on the next
/// tick is what actually stops progress.
async fn cancel_job(
    State(state): State<AppState>,
    Query(q): Query<JobIdQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let job_id = parse_job_id(&q.job_id)?;
    let mut job = state.job_repo.get(job_id).await.map_err(ApiError::from)?;

    if let Some(task_id) = job.task_ids.last().cloned() {
        state
            .broker
            .revoke(&task_id)
            .await
            .map_err(|e| ApiError::from_core(e, state.settings.env))?;
    }
    job.cancel();
    state.job_repo.update(&job).await.map_err(ApiError::from)?;

    Ok(Json(json!({
        "status": job.status.to_string(),
        "progress": [job.progress, job.total],
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn style_image_file_name_zero_pads_and_keeps_extension() {
        assert_eq!(style_image_file_name(0, "photo.png"), "000_original.png");
        assert_eq!(style_image_file_name(12, "ref.jpg"), "012_original.jpg");
    }

    #[test]
    fn truthy_accepts_common_spellings() {
        assert!(truthy("true"));
        assert!(truthy("1"));
        assert!(!truthy("false"));
        assert!(!truthy(""));
    }
}
