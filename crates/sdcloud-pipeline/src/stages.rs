//! Concrete stage implementations.
//!
//! Every stage but [`PlannerStage`] and [`CleanupStage`] follows the same
//! shape the original `queues/cpu.py` and `queues/gpu.py` tasks share:
//! `load_data` the shared archive, `load_context`, run one container with an
//! interpolated command, `save_context`, `save_data`. That shared sequence
//! lives in [`run_standard_stage`]; each [`StandardStage`] only supplies its
//! image, pool, and command template.

use std::sync::Arc;

use sdcloud_core::{Error, Result, StageId, StageOutcome};
use sdcloud_executor::{ContainerSpec, interpolate};
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::execution::StageExecutionContext;
use crate::registry::{StageRegistry, StageTask};
use crate::submission::RunConfig;

/// Fixed internal path some stage containers still mount the output
/// directory at a second time, matching the original's style-image
/// compatibility bind.
const OUTPUT_ALIAS_PATH: &str = "/workdir/blender_workdir/job/output";

/// Path segments the planner stage precomputes under
/// `{output_dir}/{config_filename}/`, in the original's numbering.
const STAGE_OUTPUT_PATHS: &[(&str, &str)] = &[
    ("preprocessed_massings_path", "00_preprocessed_massings"),
    ("prior_renders_path", "01_priors"),
    ("generated_textures_path", "02_gen_textures"),
    ("projection_output", "03_projection"),
    ("semantics_output_dir", "04_semantics"),
    ("refinement_output_dir", "05_refinement"),
    ("total_grid_output_dir", "06_total_grid"),
    ("displacement_output", "07_displacement"),
    ("upscaled_textures_path", "08_upscale"),
    ("final_path", "09_final_blend"),
    ("final_render", "99_final_render"),
];

async fn run_container(
    ectx: &StageExecutionContext,
    task_function: &str,
    image: String,
    command: String,
    gpu: bool,
) -> Result<String> {
    let spec = ContainerSpec {
        task_function: task_function.to_string(),
        task_id: ectx.task_id.clone(),
        image,
        command,
        input_dir: ectx.input_dir(),
        output_dir: ectx.output_dir(),
        output_alias_path: OUTPUT_ALIAS_PATH.to_string(),
        gpu,
    };

    info!(container = %spec.container_name(), "running stage container");

    match ectx.runner.run_container(&spec).await? {
        StageOutcome::Success { log } => {
            debug!(container = %spec.container_name(), bytes = log.len(), "stage container finished");
            Ok(log)
        }
        StageOutcome::Fatal { log, reason } => Err(Error::StageFailed(format!(
            "{task_function} failed ({reason:?}): {log}"
        ))),
    }
}

/// A stage whose container takes the shared context as-is and writes its
/// outputs back unchanged except for the paths it was told to use.
///
/// `command_template` is the script name and its `{name}`-interpolated
/// arguments only; `run` prepends the cpu pool's `${BLENDERPY}` wrapper or
/// the gpu pool's `python3` invocation depending on `gpu`.
pub struct StandardStage {
    id: StageId,
    image_name: &'static str,
    gpu: bool,
    command_template: &'static str,
}

impl StandardStage {
    pub fn new(id: &str, image_name: &'static str, gpu: bool, command_template: &'static str) -> Self {
        Self {
            id: id.parse().expect("static stage id"),
            image_name,
            gpu,
            command_template,
        }
    }
}

#[async_trait::async_trait]
impl StageTask for StandardStage {
    fn id(&self) -> &StageId {
        &self.id
    }

    async fn run(
        &self,
        ectx: &StageExecutionContext,
        context: Value,
        _payload: &Value,
    ) -> Result<Value> {
        sdcloud_storage::load_data(&ectx.store, ectx.job_id, &ectx.job_dir).await?;
        let context = {
            let loaded = sdcloud_storage::load_context(&ectx.job_dir)?;
            if loaded.is_null() { context } else { loaded }
        };

        let args = interpolate(self.command_template, &context)?;
        let command = if self.gpu {
            format!("python3 /workdir/sd_scripts/{args}")
        } else {
            format!("${{BLENDERPY}} /workdir/tools/{args}")
        };
        run_container(
            ectx,
            self.id.name(),
            ectx.image(self.image_name),
            command,
            self.gpu,
        )
        .await?;

        sdcloud_storage::save_context(&ectx.job_dir, &context)?;
        sdcloud_storage::save_data(&ectx.store, ectx.job_id, &ectx.job_dir).await?;
        let _ = std::fs::remove_dir_all(&ectx.job_dir);

        Ok(context)
    }
}

/// The first stage: accepts the full submission payload, derives the
/// generated config via a container invocation, and seeds the context every
/// later stage reads from.
pub struct PlannerStage {
    id: StageId,
    image_name: &'static str,
}

impl PlannerStage {
    pub fn new() -> Self {
        Self {
            id: "cpu.prestage_0".parse().expect("static stage id"),
            image_name: "sd-tools",
        }
    }
}

impl Default for PlannerStage {
    fn default() -> Self {
        Self::new()
    }
}

fn multivalue_flag(flag: &str, values: &[String]) -> Vec<String> {
    if values.is_empty() {
        Vec::new()
    } else {
        std::iter::once(flag.to_string())
            .chain(values.iter().cloned())
            .collect()
    }
}

/// Build the config-generator CLI invocation from the typed submission,
/// mirroring `prestage_0`'s imperative argument list in the original.
fn config_generator_args(config: &RunConfig) -> Vec<String> {
    let mut args = vec![
        "--workdir".to_string(),
        "/workdir/job/output".to_string(),
        "--pos_prompt".to_string(),
        format!("'{}'", config.pos_prompt.trim_matches('\'')),
        "--neg_prompt".to_string(),
        format!("'{}'", config.neg_prompt.trim_matches('\'')),
        "--prompt_strength".to_string(),
        config.prompt_strength.to_string(),
    ];
    if let Some(seed) = config.random_seed {
        args.push("--random_seed".to_string());
        args.push(seed.to_string());
    }
    if config.disable_displacement {
        args.push("--disable_displacement".to_string());
    }
    args.push("--texture_resolution".to_string());
    args.push(config.texture_resolution.to_string());

    args.extend(multivalue_flag(
        "--style_images_weights",
        &config
            .style_images_weights
            .iter()
            .map(|w| w.to_string())
            .collect::<Vec<_>>(),
    ));
    args.extend(multivalue_flag("--loras", &config.loras));
    args.extend(multivalue_flag(
        "--loras_weights",
        &config
            .loras_weights
            .iter()
            .map(|w| w.to_string())
            .collect::<Vec<_>>(),
    ));

    if config.disable_3d {
        args.push("--disable_3d".to_string());
    }
    if config.enable_uv_texture_upscale {
        args.push("--enable_uv_texture_upscale".to_string());
    }
    if config.enable_semantics {
        args.push("--enable_semantics".to_string());
    }

    args.push("--n_cameras".to_string());
    args.push(config.n_cameras.to_string());
    args.extend(multivalue_flag(
        "--camera_pitches",
        &config
            .camera_pitches
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>(),
    ));
    args.extend(multivalue_flag(
        "--camera_yaws",
        &config
            .camera_yaws
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>(),
    ));

    args.push("--total_remesh_mode".to_string());
    args.push(serde_json::to_value(config.total_remesh_mode)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default());

    args
}

#[async_trait::async_trait]
impl StageTask for PlannerStage {
    fn id(&self) -> &StageId {
        &self.id
    }

    fn is_planner(&self) -> bool {
        true
    }

    async fn run(
        &self,
        ectx: &StageExecutionContext,
        _context: Value,
        payload: &Value,
    ) -> Result<Value> {
        let config: RunConfig = serde_json::from_value(payload.clone())
            .map_err(|e| Error::InvalidInput(format!("planner payload: {e}")))?;

        sdcloud_storage::load_data(&ectx.store, ectx.job_id, &ectx.job_dir).await?;

        let config_filename = "generated_config";
        let mut context = json!({
            "local_output_dir": ectx.output_dir().display().to_string(),
            "local_input_dir": ectx.input_dir().display().to_string(),
            "docker_output_dir": "/workdir/job/output",
            "docker_input_dir": "/workdir/job/input",
            "config_path": "/workdir/job/output/generated_config.py",
            "config_filename": config_filename,
        });

        let args = config_generator_args(&config).join(" ");
        let command = format!(
            "${{BLENDERPY}} /workdir/tools/config_generator.py {args} > /workdir/job/output/runtime_params_raw"
        );

        run_container(ectx, "prestage_0", ectx.image(self.image_name), command, false).await?;

        let raw_path = ectx.output_dir().join("runtime_params_raw");
        let raw = std::fs::read_to_string(&raw_path)
            .map_err(|e| Error::Internal(format!("reading runtime params: {e}")))?;
        let first_line = raw
            .lines()
            .next()
            .ok_or_else(|| Error::Internal("empty runtime params file".to_string()))?;
        let fields: Vec<&str> = first_line.split_whitespace().skip(1).collect();
        if fields.len() < 4 {
            return Err(Error::Internal(format!(
                "malformed runtime params line: {first_line}"
            )));
        }
        context["random_subset_size"] = json!(fields[0]);
        context["config_path"] = json!(fields[1]);
        context["output_dir"] = json!(fields[2]);
        context["massings_paths"] = json!(fields[3]);

        let output_dir = fields[2];
        for (key, suffix) in STAGE_OUTPUT_PATHS {
            context[*key] = json!(format!("{output_dir}/{config_filename}/{suffix}"));
        }

        sdcloud_storage::save_context(&ectx.job_dir, &context)?;
        sdcloud_storage::save_data(&ectx.store, ectx.job_id, &ectx.job_dir).await?;
        let _ = std::fs::remove_dir_all(&ectx.job_dir);

        Ok(context)
    }
}

/// The final step: frees the job's shared archive now that every
/// downstream stage has consumed it.
pub struct CleanupStage {
    id: StageId,
}

impl CleanupStage {
    pub fn new() -> Self {
        Self {
            id: "cpu.cleanup".parse().expect("static stage id"),
        }
    }
}

impl Default for CleanupStage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl StageTask for CleanupStage {
    fn id(&self) -> &StageId {
        &self.id
    }

    async fn run(
        &self,
        ectx: &StageExecutionContext,
        context: Value,
        _payload: &Value,
    ) -> Result<Value> {
        sdcloud_storage::delete_data(&ectx.store, ectx.job_id).await?;
        let _ = std::fs::remove_dir_all(&ectx.job_dir);
        Ok(context)
    }
}

/// Registers the full stage roster: the planner, every numbered stage the
/// plan can emit, `stage_6` kept dispatchable but unreachable (the planner
/// never emits it — see the Open Question resolution in DESIGN.md), and
/// cleanup. `stage_5` is deliberately not registered at all: unlike
/// `stage_6` it has no counterpart in what the planner emits or what any
/// other stage's context depends on.
pub fn default_registry() -> StageRegistry {
    let mut registry = StageRegistry::new();

    registry.register(Arc::new(PlannerStage::new()));

    registry.register(Arc::new(StandardStage::new(
        "cpu.stage_0",
        "sd-tools",
        false,
        "preprocess_input.py -i {massings_paths} -w /workdir/ -o {preprocessed_massings_path} --random_subset_size {random_subset_size}",
    )));
    registry.register(Arc::new(StandardStage::new(
        "cpu.stage_1",
        "sd-tools",
        false,
        "render_priors.py /workdir/{preprocessed_massings_path} /workdir/{prior_renders_path}",
    )));
    registry.register(Arc::new(StandardStage::new(
        "gpu.stage_2",
        "sd_comfywr",
        true,
        "generate_textures.py /workdir/{prior_renders_path} /workdir/{generated_textures_path} --config /workdir/{config_path}",
    )));
    registry.register(Arc::new(StandardStage::new(
        "cpu.stage_3",
        "sd-tools",
        false,
        "make_projected_rgb.py /workdir/{preprocessed_massings_path} /workdir/{prior_renders_path} /workdir/{generated_textures_path}/ /workdir/{projection_output}",
    )));
    registry.register(Arc::new(StandardStage::new(
        "gpu.stage_4",
        "sd_comfywr",
        true,
        "generate_semantics.py /workdir/{prior_renders_path} /workdir/{semantics_output_dir} --config /workdir/{config_path}",
    )));
    registry.register(Arc::new(StandardStage::new(
        "cpu.stage_6",
        "sd-tools",
        false,
        "make_total_recursive_grid.py /workdir/{preprocessed_massings_path} /workdir/{prior_renders_path} /workdir/{generated_textures_path}/ /workdir/{total_grid_output_dir}",
    )));
    registry.register(Arc::new(StandardStage::new(
        "cpu.stage_7",
        "sd-tools",
        false,
        "make_displacement_map.py /workdir/{preprocessed_massings_path} /workdir/{prior_renders_path} /workdir/{generated_textures_path}/ /workdir/{displacement_output}",
    )));
    registry.register(Arc::new(StandardStage::new(
        "gpu.stage_8",
        "sd_comfywr",
        true,
        "upscale_textures.py /workdir/{generated_textures_path} /workdir/{upscaled_textures_path} --config /workdir/{config_path}",
    )));
    registry.register(Arc::new(StandardStage::new(
        "cpu.stage_9",
        "sd-tools",
        false,
        "make_final_blend.py /workdir/{preprocessed_massings_path} /workdir/{prior_renders_path} /workdir/{generated_textures_path} /workdir/{projection_output} /workdir/{displacement_output}/ /workdir/{upscaled_textures_path} /workdir/{final_path}",
    )));

    registry.register(Arc::new(CleanupStage::new()));

    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_generator_args_includes_required_flags() {
        let config = RunConfig {
            pos_prompt: "a chair".into(),
            neg_prompt: String::new(),
            prompt_strength: 0.8,
            random_seed: Some(7),
            texture_resolution: 1024,
            style_image_count: 0,
            style_images_weights: vec![],
            loras: vec!["japanese_shop_v0.1".into()],
            loras_weights: vec![1.0],
            n_cameras: 1,
            camera_yaws: vec![0.0],
            camera_pitches: vec![0.0],
            total_remesh_mode: crate::submission::RemeshMode::SmoothGeneric,
            depth_algorithm: crate::submission::DepthAlgorithm::Marigold,
            disable_3d: false,
            disable_displacement: false,
            enable_semantics: false,
            enable_uv_texture_upscale: false,
            stage_1_steps: 20,
            stage_2_steps: 20,
        };
        let args = config_generator_args(&config).join(" ");
        assert!(args.contains("--pos_prompt 'a chair'"));
        assert!(args.contains("--loras japanese_shop_v0.1"));
        assert!(args.contains("--total_remesh_mode smooth_generic"));
    }

    #[test]
    fn default_registry_resolves_every_plannable_stage() {
        let registry = default_registry();
        for id in [
            "cpu.prestage_0",
            "cpu.stage_0",
            "cpu.stage_1",
            "gpu.stage_2",
            "cpu.stage_3",
            "gpu.stage_4",
            "cpu.stage_7",
            "gpu.stage_8",
            "cpu.stage_9",
            "cpu.cleanup",
        ] {
            let stage_id: StageId = id.parse().unwrap();
            assert!(registry.get(&stage_id).is_ok(), "missing {id}");
        }
    }

    #[test]
    fn stage_6_is_registered_but_never_planned() {
        let registry = default_registry();
        let stage_id: StageId = "cpu.stage_6".parse().unwrap();
        assert!(registry.get(&stage_id).is_ok());
    }

    #[test]
    fn stage_5_is_not_registered() {
        let registry = default_registry();
        let stage_id: StageId = "cpu.stage_5".parse().unwrap();
        assert!(registry.get(&stage_id).is_err());
    }
}
