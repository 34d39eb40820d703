// kestrel_core/src/graph/factors.rs

use nalgebra::{Isometry3, Point2, Vector2, Vector6};

use crate::models::PinholeCalibration;
use crate::types::{Key, LandmarkId, PoseIndex};

/// A probabilistic constraint between graph variables.
///
/// Noise is carried as per-axis standard deviations; pose sigmas use the
/// tangent order `[tx, ty, tz, rx, ry, rz]`.
#[derive(Debug, Clone, PartialEq)]
pub enum Factor {
    /// Anchors a pose to an absolute value.
    PosePrior {
        pose: PoseIndex,
        prior: Isometry3<f64>,
        sigmas: Vector6<f64>,
    },
    /// Relative rigid motion `from^-1 * to`. Used for odometry (pose to pose)
    /// and for pose-constrained landmarks (pose to landmark).
    Between {
        from: Key,
        to: Key,
        measured: Isometry3<f64>,
        sigmas: Vector6<f64>,
    },
    /// Pixel observation of a point landmark from a camera pose.
    Projection {
        pose: PoseIndex,
        landmark: LandmarkId,
        measured: Point2<f64>,
        sigmas: Vector2<f64>,
        calibration: PinholeCalibration,
    },
}

impl Factor {
    /// The variables this factor connects.
    pub fn keys(&self) -> Vec<Key> {
        match self {
            Factor::PosePrior { pose, .. } => vec![Key::Pose(*pose)],
            Factor::Between { from, to, .. } => vec![*from, *to],
            Factor::Projection { pose, landmark, .. } => {
                vec![Key::Pose(*pose), Key::Landmark(*landmark)]
            }
        }
    }

    pub fn involves(&self, key: Key) -> bool {
        self.keys().contains(&key)
    }

    /// Dimension of the factor's residual.
    pub fn residual_dim(&self) -> usize {
        match self {
            Factor::PosePrior { .. } | Factor::Between { .. } => 6,
            Factor::Projection { .. } => 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_projection_factor_keys() {
        let factor = Factor::Projection {
            pose: 2,
            landmark: 9,
            measured: Point2::new(10.0, 20.0),
            sigmas: Vector2::new(1.0, 1.0),
            calibration: PinholeCalibration::default(),
        };
        assert_eq!(factor.keys(), vec![Key::Pose(2), Key::Landmark(9)]);
        assert!(factor.involves(Key::Landmark(9)));
        assert!(!factor.involves(Key::Pose(9)));
        assert_eq!(factor.residual_dim(), 2);
    }
}
