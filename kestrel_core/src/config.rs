// kestrel_core/src/config.rs

use serde::{Deserialize, Serialize};

use crate::error::{Result, SlamError};

// =========================================================================
// == Top-Level Configuration ==
// =========================================================================

/// # SlamConfig
/// All tunables of a SLAM session. Every section falls back to its default
/// when it is missing, so an empty TOML table is a valid configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SlamConfig {
    #[serde(default)]
    pub noise: NoiseConfig,

    #[serde(default)]
    pub landmarks: LandmarkConfig,

    #[serde(default)]
    pub solver: SolverConfig,
}

impl SlamConfig {
    /// Rejects values the session cannot operate with.
    pub fn validate(&self) -> Result<()> {
        let all_positive = |sigmas: &[f64]| sigmas.iter().all(|s| s.is_finite() && *s > 0.0);

        if !all_positive(&self.noise.prior_sigmas) {
            return Err(SlamError::InvalidConfig(
                "noise.prior_sigmas must be positive".into(),
            ));
        }
        if !all_positive(&self.noise.odometry_sigmas) {
            return Err(SlamError::InvalidConfig(
                "noise.odometry_sigmas must be positive".into(),
            ));
        }
        if !all_positive(&self.noise.pixel_sigmas) || !all_positive(&[self.noise.pose_landmark_sigma])
        {
            return Err(SlamError::InvalidConfig(
                "landmark measurement sigmas must be positive".into(),
            ));
        }
        // A single view cannot triangulate anything.
        if self.landmarks.min_observations < 2 {
            return Err(SlamError::InvalidConfig(format!(
                "landmarks.min_observations must be at least 2, got {}",
                self.landmarks.min_observations
            )));
        }
        if !(self.landmarks.reprojection_error_threshold > 0.0) {
            return Err(SlamError::InvalidConfig(
                "landmarks.reprojection_error_threshold must be positive".into(),
            ));
        }
        if self.solver.max_iterations == 0 {
            return Err(SlamError::InvalidConfig(
                "solver.max_iterations must be non-zero".into(),
            ));
        }
        if !(self.solver.lambda_up > 1.0 && self.solver.lambda_down > 0.0 && self.solver.lambda_down < 1.0)
        {
            return Err(SlamError::InvalidConfig(
                "solver lambda factors must satisfy lambda_up > 1 > lambda_down > 0".into(),
            ));
        }
        Ok(())
    }
}

// =========================================================================
// == Configuration Sub-Structs ==
// =========================================================================

/// Measurement noise, expressed as standard deviations.
///
/// Pose sigmas are ordered `[tx, ty, tz, rx, ry, rz]` (meters, radians).
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct NoiseConfig {
    /// Anchor on the first pose. Strong, but finite.
    pub prior_sigmas: [f64; 6],
    pub odometry_sigmas: [f64; 6],
    /// Isotropic sigma of a relative-pose landmark measurement.
    pub pose_landmark_sigma: f64,
    /// Pixel noise in u and v.
    pub pixel_sigmas: [f64; 2],
}

impl Default for NoiseConfig {
    fn default() -> Self {
        Self {
            prior_sigmas: [0.001; 6],
            odometry_sigmas: [0.01; 6],
            pose_landmark_sigma: 0.4,
            pixel_sigmas: [1.0, 1.0],
        }
    }
}

/// What happens to deferred landmarks that were not seen in the latest frame.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Keep accumulating observations for as long as the caller keeps the id.
    #[default]
    KeepAccumulating,
    /// Only keep deferred landmarks that are tracked in consecutive frames.
    DropUntracked,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct LandmarkConfig {
    /// Observations needed before a deferred landmark is considered for promotion.
    pub min_observations: usize,
    /// Upper bound on the triangulation error (0.5 * sum of squared whitened
    /// pixel residuals) a promoted landmark may have.
    pub reprojection_error_threshold: f64,
    pub retention: RetentionPolicy,
    /// Sliding window, in poses, beyond which committed landmarks are pruned.
    /// `None` keeps every landmark forever.
    pub max_age: Option<u64>,
    /// Minimum angle between any two viewing rays for a triangulation to be
    /// considered well conditioned.
    pub min_parallax_deg: f64,
}

impl Default for LandmarkConfig {
    fn default() -> Self {
        Self {
            min_observations: 3,
            reprojection_error_threshold: 4.0,
            retention: RetentionPolicy::KeepAccumulating,
            max_age: Some(20),
            min_parallax_deg: 1.0,
        }
    }
}

/// Levenberg-Marquardt parameters of the bundled dense smoother.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct SolverConfig {
    pub max_iterations: usize,
    pub initial_lambda: f64,
    pub lambda_up: f64,
    pub lambda_down: f64,
    /// Stop once an accepted step improves the error by less than this fraction.
    pub relative_tolerance: f64,
    /// Stop once the total error drops below this value.
    pub absolute_tolerance: f64,
    /// Give up trying to improve (and accept the current estimate) past this damping.
    pub max_lambda: f64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            initial_lambda: 1e-3,
            lambda_up: 10.0,
            lambda_down: 0.1,
            relative_tolerance: 1e-9,
            absolute_tolerance: 1e-12,
            max_lambda: 1e10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(SlamConfig::default().validate().is_ok());
    }

    #[test]
    fn test_single_observation_promotion_is_rejected() {
        let mut config = SlamConfig::default();
        config.landmarks.min_observations = 1;
        assert!(matches!(
            config.validate(),
            Err(SlamError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_non_positive_sigma_is_rejected() {
        let mut config = SlamConfig::default();
        config.noise.odometry_sigmas[3] = 0.0;
        assert!(config.validate().is_err());
    }
}
