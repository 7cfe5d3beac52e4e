//! Configuration of the optimizer.
//!
//! [Options] can be deserialized from TOML. Missing fields take their default
//! value, unknown fields are an error.

use serde::{Deserialize, Serialize};

use crate::{Error, NUM_CAM_PARAMS, Result};

pub const DEFAULT_TRUST_REGION_RADIUS_INIT: f64 = 1000.0;
pub const DEFAULT_TRUST_REGION_RADIUS_GAIN: f64 = 10.0;
pub const DEFAULT_TRUST_REGION_RADIUS_DECREMENT: f64 = 0.1;
pub const DEFAULT_LM_MSE_THRESHOLD: f64 = 1e-16;
pub const DEFAULT_LM_DELTA_THRESHOLD: f64 = 1e-8;
pub const DEFAULT_LM_MAX_ITERATIONS: usize = 100;
pub const DEFAULT_CG_MAX_ITERATIONS: usize = 1000;
pub const DEFAULT_CG_TOLERANCE: f64 = 1e-20;

fn default_trust_region_radius_init() -> f64 {
    DEFAULT_TRUST_REGION_RADIUS_INIT
}

fn default_trust_region_radius_gain() -> f64 {
    DEFAULT_TRUST_REGION_RADIUS_GAIN
}

fn default_trust_region_radius_decrement() -> f64 {
    DEFAULT_TRUST_REGION_RADIUS_DECREMENT
}

fn default_lm_mse_threshold() -> f64 {
    DEFAULT_LM_MSE_THRESHOLD
}

fn default_lm_delta_threshold() -> f64 {
    DEFAULT_LM_DELTA_THRESHOLD
}

const fn default_lm_max_iterations() -> usize {
    DEFAULT_LM_MAX_ITERATIONS
}

const fn default_cg_max_iterations() -> usize {
    DEFAULT_CG_MAX_ITERATIONS
}

fn default_cg_tolerance() -> f64 {
    DEFAULT_CG_TOLERANCE
}

const fn default_camera_block_dim() -> usize {
    NUM_CAM_PARAMS
}

/// Which parameters are optimized.
#[derive(Clone, Debug, PartialEq, Eq, Copy, Default, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BundleMode {
    /// Refine cameras and points jointly using the Schur complement.
    #[default]
    CamerasAndPoints,
    /// Keep points fixed and refine only the cameras.
    CamerasOnly,
    /// Keep cameras fixed and refine only the points.
    PointsOnly,
}

impl BundleMode {
    pub fn optimizes_cameras(&self) -> bool {
        matches!(self, Self::CamerasAndPoints | Self::CamerasOnly)
    }

    pub fn optimizes_points(&self) -> bool {
        matches!(self, Self::CamerasAndPoints | Self::PointsOnly)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Options {
    /// Initial trust region radius. The damping added to the normal
    /// equations is its inverse. Defaults to
    /// [DEFAULT_TRUST_REGION_RADIUS_INIT].
    #[serde(default = "default_trust_region_radius_init")]
    pub trust_region_radius_init: f64,
    /// Factor applied to the radius after a successful iteration.
    #[serde(default = "default_trust_region_radius_gain")]
    pub trust_region_radius_gain: f64,
    /// Factor applied to the radius after an unsuccessful iteration.
    #[serde(default = "default_trust_region_radius_decrement")]
    pub trust_region_radius_decrement: f64,
    /// Stop once the mean squared error falls below this.
    #[serde(default = "default_lm_mse_threshold")]
    pub lm_mse_threshold: f64,
    /// Stop once a successful iteration improves the mean squared error by a
    /// smaller fraction than this.
    #[serde(default = "default_lm_delta_threshold")]
    pub lm_delta_threshold: f64,
    #[serde(default = "default_lm_max_iterations")]
    pub lm_max_iterations: usize,
    /// Number of iterations that must run before the relative improvement
    /// criterion may stop the optimization.
    #[serde(default)]
    pub lm_min_iterations: usize,
    #[serde(default = "default_cg_max_iterations")]
    pub cg_max_iterations: usize,
    /// Conjugate gradient stops once `|r|^2 / |b|^2` is below this.
    #[serde(default = "default_cg_tolerance")]
    pub cg_tolerance: f64,
    /// Parameters per camera. Only [NUM_CAM_PARAMS] is supported.
    #[serde(default = "default_camera_block_dim")]
    pub camera_block_dim: usize,
    #[serde(default)]
    pub bundle_mode: BundleMode,
    /// Worker threads for residual and Jacobian evaluation. `None` uses the
    /// rayon default.
    #[serde(default)]
    pub num_threads: Option<usize>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            trust_region_radius_init: default_trust_region_radius_init(),
            trust_region_radius_gain: default_trust_region_radius_gain(),
            trust_region_radius_decrement: default_trust_region_radius_decrement(),
            lm_mse_threshold: default_lm_mse_threshold(),
            lm_delta_threshold: default_lm_delta_threshold(),
            lm_max_iterations: default_lm_max_iterations(),
            lm_min_iterations: 0,
            cg_max_iterations: default_cg_max_iterations(),
            cg_tolerance: default_cg_tolerance(),
            camera_block_dim: default_camera_block_dim(),
            bundle_mode: BundleMode::default(),
            num_threads: None,
        }
    }
}

impl Options {
    /// Parse options from TOML and validate them.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let opts: Self = toml::from_str(s)?;
        opts.validate()?;
        Ok(opts)
    }

    pub fn validate(&self) -> Result<()> {
        if self.camera_block_dim != NUM_CAM_PARAMS {
            return Err(Error::InconsistentData(format!(
                "camera_block_dim must be {NUM_CAM_PARAMS}, got {}",
                self.camera_block_dim
            )));
        }
        if !(self.trust_region_radius_init > 0.0) {
            return Err(Error::InconsistentData(format!(
                "trust_region_radius_init must be positive, got {}",
                self.trust_region_radius_init
            )));
        }
        if !(self.trust_region_radius_gain > 1.0) {
            return Err(Error::InconsistentData(format!(
                "trust_region_radius_gain must be greater than one, got {}",
                self.trust_region_radius_gain
            )));
        }
        if !(self.trust_region_radius_decrement > 0.0 && self.trust_region_radius_decrement < 1.0) {
            return Err(Error::InconsistentData(format!(
                "trust_region_radius_decrement must be between zero and one, got {}",
                self.trust_region_radius_decrement
            )));
        }
        for (name, value) in [
            ("lm_mse_threshold", self.lm_mse_threshold),
            ("lm_delta_threshold", self.lm_delta_threshold),
            ("cg_tolerance", self.cg_tolerance),
        ] {
            if !(value >= 0.0) {
                return Err(Error::InconsistentData(format!(
                    "{name} must not be negative, got {value}"
                )));
            }
        }
        if self.num_threads == Some(0) {
            return Err(Error::InconsistentData(
                "num_threads must be at least one".into(),
            ));
        }
        Ok(())
    }
}
