// kestrel_core/src/types.rs

use nalgebra::{Isometry3, Point3};
use std::fmt;

// --- Core Type Aliases ---
/// The temporal step of a pose node. Pose indices are dense and start at 0.
pub type PoseIndex = u64;
/// Caller-supplied landmark identifier. Stable for the landmark's lifetime,
/// not required to be dense or ordered.
pub type LandmarkId = u64;

// --- Core Identifier ---
/// A variable in the factor graph.
///
/// Poses and landmarks live in separate namespaces, so `Pose(3)` and
/// `Landmark(3)` are different variables. The derived ordering puts every
/// pose before every landmark, which gives solver and store maps a stable
/// iteration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Key {
    Pose(PoseIndex),
    Landmark(LandmarkId),
}

impl Key {
    pub fn is_pose(&self) -> bool {
        matches!(self, Key::Pose(_))
    }

    pub fn as_landmark(&self) -> Option<LandmarkId> {
        match self {
            Key::Landmark(id) => Some(*id),
            Key::Pose(_) => None,
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Pose(index) => write!(f, "x{}", index),
            Key::Landmark(id) => write!(f, "l{}", id),
        }
    }
}

/// The estimate held for a landmark. The variant is fixed once the landmark
/// is created: point features stay points, pose-constrained landmarks stay
/// rigid transforms.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LandmarkEstimate {
    Point(Point3<f64>),
    Pose(Isometry3<f64>),
}

impl LandmarkEstimate {
    /// Position of the landmark in the world frame, whatever its kind.
    pub fn position(&self) -> Point3<f64> {
        match self {
            LandmarkEstimate::Point(p) => *p,
            LandmarkEstimate::Pose(iso) => Point3::from(iso.translation.vector),
        }
    }

    /// Dimension of the landmark's tangent space (3 for points, 6 for poses).
    pub fn dim(&self) -> usize {
        match self {
            LandmarkEstimate::Point(_) => 3,
            LandmarkEstimate::Pose(_) => 6,
        }
    }

    pub fn same_kind(&self, other: &LandmarkEstimate) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    pub fn kind_str(&self) -> &'static str {
        match self {
            LandmarkEstimate::Point(_) => "point",
            LandmarkEstimate::Pose(_) => "pose",
        }
    }
}

/// A value of any graph variable, as handed to and returned by a solver.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Variable {
    Pose(Isometry3<f64>),
    Point(Point3<f64>),
}

impl Variable {
    pub fn dim(&self) -> usize {
        match self {
            Variable::Pose(_) => 6,
            Variable::Point(_) => 3,
        }
    }
}

impl From<LandmarkEstimate> for Variable {
    fn from(estimate: LandmarkEstimate) -> Self {
        match estimate {
            LandmarkEstimate::Point(p) => Variable::Point(p),
            LandmarkEstimate::Pose(iso) => Variable::Pose(iso),
        }
    }
}
