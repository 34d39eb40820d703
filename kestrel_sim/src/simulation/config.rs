// kestrel_sim/src/simulation/config.rs

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use kestrel_core::prelude::{PinholeCalibration, SlamConfig};
use nalgebra::{Isometry3, Translation3, UnitQuaternion};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// =========================================================================
// == Top-Level Configuration ==
// =========================================================================

/// # ScenarioConfig
/// Everything one simulation run needs. This struct is the root of the data
/// parsed from a `scenario.toml` file.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)] // Fail if the TOML has fields not in our struct
pub struct ScenarioConfig {
    #[serde(default)]
    pub simulation: Simulation,

    #[serde(default)]
    pub world: World,

    #[serde(default)]
    pub sensors: Sensors,

    #[serde(default)]
    pub camera: PinholeCalibration,

    /// Passed to the SLAM session unchanged.
    #[serde(default)]
    pub slam: SlamConfig,
}

impl ScenarioConfig {
    /// Layers the built-in defaults, the scenario file and `KESTREL_`
    /// environment variables, in that order. Nested keys use `__` in
    /// variable names, e.g. `KESTREL_SIMULATION__STEPS=50`.
    pub fn load(path: &Path) -> Result<Self, figment::Error> {
        Self::figment(path).extract()
    }

    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(ScenarioConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("KESTREL_").split("__"))
    }
}

// =========================================================================
// == Configuration Sub-Structs ==
// These map directly to the sections in a scenario.toml file.
// =========================================================================

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct Simulation {
    /// Optional seed for the pseudo-random number generator for determinism.
    pub seed: Option<u64>,
    /// Number of poses, the initial one included.
    pub steps: usize,
    /// Where to write the final graph snapshot, if anywhere.
    pub output: Option<PathBuf>,
}

impl Default for Simulation {
    fn default() -> Self {
        Self {
            seed: None,
            steps: 30,
            output: None,
        }
    }
}

/// The shape of the ground-truth camera path.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type")] // `type = "..."` in the TOML selects the variant
#[serde(rename_all = "PascalCase")]
pub enum Trajectory {
    /// Moves along +X, looking down +Z.
    Straight { step_length: f64 },
    /// Circles a center point, always looking at it.
    Circle { radius: f64, step_angle_deg: f64 },
}

impl Default for Trajectory {
    fn default() -> Self {
        Trajectory::Straight { step_length: 0.5 }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct World {
    pub trajectory: Trajectory,
    pub start: Pose,
    pub num_landmarks: usize,
    /// Rigid fiducials observed as relative poses instead of pixels.
    pub num_fiducials: usize,
    /// Depth band in front of a straight trajectory where landmarks are placed.
    pub min_depth: f64,
    pub max_depth: f64,
}

impl Default for World {
    fn default() -> Self {
        Self {
            trajectory: Trajectory::default(),
            start: Pose::default(),
            num_landmarks: 60,
            num_fiducials: 2,
            min_depth: 4.0,
            max_depth: 10.0,
        }
    }
}

/// Sensor noise (standard deviations) and visibility limits.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct Sensors {
    pub odometry_translation_sigma: f64,
    pub odometry_rotation_sigma: f64,
    pub pixel_sigma: f64,
    pub image_width: f64,
    pub image_height: f64,
    pub max_range: f64,
    /// Fiducials are only detected this close to the camera.
    pub fiducial_range: f64,
    pub fiducial_sigma: f64,
}

impl Default for Sensors {
    fn default() -> Self {
        Self {
            odometry_translation_sigma: 0.005,
            odometry_rotation_sigma: 0.002,
            pixel_sigma: 0.5,
            image_width: 640.0,
            image_height: 480.0,
            max_range: 15.0,
            fiducial_range: 6.0,
            fiducial_sigma: 0.02,
        }
    }
}

// =========================================================================
// == Helper Structs for Nested Configuration ==
// =========================================================================

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct Pose {
    pub translation: [f64; 3],
    /// Roll, pitch, yaw in degrees.
    pub rotation_deg: [f64; 3],
}

impl Pose {
    pub fn to_isometry(&self) -> Isometry3<f64> {
        let [x, y, z] = self.translation;
        let [roll, pitch, yaw] = self.rotation_deg.map(f64::to_radians);
        Isometry3::from_parts(
            Translation3::new(x, y, z),
            UnitQuaternion::from_euler_angles(roll, pitch, yaw),
        )
    }
}
