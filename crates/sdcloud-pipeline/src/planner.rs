//! Maps a validated [`RunConfig`] to the ordered list of stages a job runs.
//!
//! Grounded on the literal conditional-append list built in the original
//! submission handler: a fixed prefix, then each optional stage appended only
//! when its flag allows it, then a fixed `cleanup` suffix this system adds
//! (the original never frees its shared archive explicitly).

use sdcloud_core::StageId;

use crate::submission::RunConfig;

/// Build the ordered stage plan for a submission. Pure: same input always
/// produces the same plan.
pub fn plan(config: &RunConfig) -> Vec<StageId> {
    let mut steps = Vec::new();
    let push = |steps: &mut Vec<StageId>, s: &str| steps.push(s.parse().expect("static stage id"));

    push(&mut steps, "cpu.prestage_0");
    push(&mut steps, "cpu.stage_0");
    push(&mut steps, "cpu.stage_1");
    push(&mut steps, "gpu.stage_2");

    if !config.disable_3d {
        push(&mut steps, "cpu.stage_3");
    }
    if config.enable_semantics {
        push(&mut steps, "gpu.stage_4");
    }
    if !config.disable_displacement {
        push(&mut steps, "cpu.stage_7");
    }
    if config.enable_uv_texture_upscale && !config.disable_3d {
        push(&mut steps, "gpu.stage_8");
    }
    if !config.disable_3d {
        push(&mut steps, "cpu.stage_9");
    }

    push(&mut steps, "cpu.cleanup");

    steps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::submission::{DepthAlgorithm, RemeshMode};

    fn base() -> RunConfig {
        RunConfig {
            pos_prompt: "a wooden chair".into(),
            neg_prompt: "".into(),
            prompt_strength: 0.8,
            random_seed: Some(42),
            texture_resolution: 2048,
            style_image_count: 0,
            style_images_weights: vec![],
            loras: vec![],
            loras_weights: vec![],
            n_cameras: 1,
            camera_yaws: vec![0.0],
            camera_pitches: vec![0.0],
            total_remesh_mode: RemeshMode::SmoothGeneric,
            depth_algorithm: DepthAlgorithm::Marigold,
            disable_3d: false,
            disable_displacement: false,
            enable_semantics: false,
            enable_uv_texture_upscale: false,
            stage_1_steps: 20,
            stage_2_steps: 20,
        }
    }

    fn names(steps: &[StageId]) -> Vec<String> {
        steps.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn default_flags_produce_the_full_3d_pipeline() {
        let steps = plan(&base());
        assert_eq!(
            names(&steps),
            vec![
                "cpu.prestage_0",
                "cpu.stage_0",
                "cpu.stage_1",
                "gpu.stage_2",
                "cpu.stage_3",
                "cpu.stage_7",
                "cpu.stage_9",
                "cpu.cleanup",
            ]
        );
    }

    #[test]
    fn disable_3d_drops_stage_3_upscale_and_stage_9() {
        let mut cfg = base();
        cfg.disable_3d = true;
        cfg.enable_uv_texture_upscale = true; // would be invalid per validate(), plan() doesn't care
        let steps = plan(&cfg);
        assert_eq!(
            names(&steps),
            vec![
                "cpu.prestage_0",
                "cpu.stage_0",
                "cpu.stage_1",
                "gpu.stage_2",
                "cpu.stage_7",
                "cpu.cleanup",
            ]
        );
    }

    #[test]
    fn every_optional_flag_enabled_includes_every_optional_stage() {
        let mut cfg = base();
        cfg.enable_semantics = true;
        cfg.enable_uv_texture_upscale = true;
        let steps = plan(&cfg);
        assert_eq!(
            names(&steps),
            vec![
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
            ]
        );
    }

    #[test]
    fn disable_displacement_drops_stage_7_only() {
        let mut cfg = base();
        cfg.disable_displacement = true;
        let steps = plan(&cfg);
        assert!(!names(&steps).contains(&"cpu.stage_7".to_string()));
        assert!(names(&steps).contains(&"cpu.stage_3".to_string()));
    }

    #[test]
    fn stage_5_and_stage_6_never_appear_in_any_plan() {
        let mut cfg = base();
        cfg.enable_semantics = true;
        cfg.enable_uv_texture_upscale = true;
        cfg.disable_displacement = false;
        let steps = plan(&cfg);
        let names = names(&steps);
        assert!(!names.iter().any(|n| n.ends_with("stage_5")));
        assert!(!names.iter().any(|n| n.ends_with("stage_6")));
    }
}
