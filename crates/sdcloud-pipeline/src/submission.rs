//! Submission flags and their validation rules.

use sdcloud_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// LoRA adapters the generative containers actually ship weights for.
pub const SUPPORTED_LORAS: &[&str] = &["japanese_shop_v0.1", "cyberpunk_v0.1"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemeshMode {
    None,
    SmoothGeneric,
    SharpGeneric,
    SmoothOrganic,
    NoneOrganic,
    HardSurface,
    SmoothedHardSurface,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DepthAlgorithm {
    Marigold,
    DepthAnythingV2,
}

impl std::str::FromStr for RemeshMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| Error::InvalidInput(format!("unknown total_remesh_mode: {s}")))
    }
}

impl std::str::FromStr for DepthAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| Error::InvalidInput(format!("unknown depth_algorithm: {s}")))
    }
}

/// The submitted job configuration: generation parameters plus the feature
/// flags that drive [`crate::planner::plan`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub pos_prompt: String,
    pub neg_prompt: String,
    pub prompt_strength: f32,
    pub random_seed: Option<u64>,
    pub texture_resolution: u32,

    pub style_image_count: usize,
    pub style_images_weights: Vec<f32>,

    pub loras: Vec<String>,
    pub loras_weights: Vec<f32>,

    pub n_cameras: usize,
    pub camera_yaws: Vec<f32>,
    pub camera_pitches: Vec<f32>,

    pub total_remesh_mode: RemeshMode,
    pub depth_algorithm: DepthAlgorithm,

    pub disable_3d: bool,
    pub disable_displacement: bool,
    pub enable_semantics: bool,
    pub enable_uv_texture_upscale: bool,

    pub stage_1_steps: u32,
    pub stage_2_steps: u32,
}

impl RunConfig {
    /// Validate cross-field constraints. Independent of stage execution so
    /// it can run at submission time before any scratch directory exists.
    pub fn validate(&self) -> Result<()> {
        let weights = self.style_images_weights.len();
        if weights != self.style_image_count && weights != 3 * self.style_image_count {
            return Err(Error::InvalidInput(format!(
                "style_images_weights has {weights} entries but {} style images were uploaded (expected {} or {})",
                self.style_image_count,
                self.style_image_count,
                3 * self.style_image_count
            )));
        }

        if self.loras.len() != self.loras_weights.len() {
            return Err(Error::InvalidInput(format!(
                "loras has {} entries but loras_weights has {}",
                self.loras.len(),
                self.loras_weights.len()
            )));
        }
        for lora in &self.loras {
            if !SUPPORTED_LORAS.contains(&lora.as_str()) {
                return Err(Error::InvalidInput(format!(
                    "unsupported lora: {lora} (supported: {SUPPORTED_LORAS:?})"
                )));
            }
        }

        for (name, values) in [
            ("camera_yaws", &self.camera_yaws),
            ("camera_pitches", &self.camera_pitches),
        ] {
            if values.len() != 1 && values.len() != self.n_cameras {
                return Err(Error::InvalidInput(format!(
                    "{name} has {} entries, expected 1 or n_cameras ({})",
                    values.len(),
                    self.n_cameras
                )));
            }
        }

        if self.enable_uv_texture_upscale && self.disable_3d {
            return Err(Error::InvalidInput(
                "enable_uv_texture_upscale requires 3D output, but disable_3d was set".into(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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
            n_cameras: 2,
            camera_yaws: vec![0.0, 90.0],
            camera_pitches: vec![0.0, 0.0],
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

    #[test]
    fn valid_config_passes() {
        assert!(base().validate().is_ok());
    }

    #[test]
    fn mismatched_style_weight_count_is_rejected() {
        let mut cfg = base();
        cfg.style_image_count = 2;
        cfg.style_images_weights = vec![1.0];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn style_weights_may_be_either_one_or_three_per_style_image() {
        let mut cfg = base();
        cfg.style_image_count = 2;
        cfg.style_images_weights = vec![1.0, 1.0];
        assert!(cfg.validate().is_ok());

        cfg.style_images_weights = vec![1.0; 6];
        assert!(cfg.validate().is_ok());

        cfg.style_images_weights = vec![1.0; 4];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn unsupported_lora_is_rejected() {
        let mut cfg = base();
        cfg.loras = vec!["not_a_real_lora".into()];
        cfg.loras_weights = vec![1.0];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn mismatched_camera_angle_counts_are_rejected() {
        let mut cfg = base();
        cfg.camera_pitches.push(45.0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn single_camera_angle_broadcasts_to_every_camera() {
        let mut cfg = base();
        cfg.n_cameras = 4;
        cfg.camera_yaws = vec![0.0];
        cfg.camera_pitches = vec![0.0];
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn remesh_mode_and_depth_algorithm_parse_from_their_wire_names() {
        assert_eq!(
            "smooth_generic".parse::<RemeshMode>().unwrap(),
            RemeshMode::SmoothGeneric
        );
        assert!("not_a_mode".parse::<RemeshMode>().is_err());
        assert_eq!(
            "DepthAnythingV2".parse::<DepthAlgorithm>().unwrap(),
            DepthAlgorithm::DepthAnythingV2
        );
        assert!("depthanythingv2".parse::<DepthAlgorithm>().is_err());
    }

    #[test]
    fn uv_upscale_without_3d_is_rejected() {
        let mut cfg = base();
        cfg.disable_3d = true;
        cfg.enable_uv_texture_upscale = true;
        assert!(cfg.validate().is_err());
    }
}
