// kestrel_core/src/lifecycle/mod.rs

//! Landmark lifecycle: `Unseen -> Deferred -> Committed`, with
//! `Deferred -> Unseen` when an accumulator is dropped and
//! `Committed -> Unseen` when a landmark is pruned.

use nalgebra::Point3;
use std::fmt;

use crate::types::{LandmarkId, PoseIndex};

// --- Lifecycle Data Structures ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LandmarkState {
    Unseen,
    Deferred,
    Committed,
}

/// Why a deferred landmark was not promoted. Never an error: the landmark
/// stays deferred and is retried on a later pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Rejection {
    /// Too little parallax, or a single observing pose.
    DegenerateGeometry,
    /// The triangulated point lies behind at least one observing camera.
    BehindCamera,
    ReprojectionTooHigh { error: f64 },
    /// Non-positive error, the solver's "no solution" sentinel.
    NoSolution,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::DegenerateGeometry => write!(f, "degenerate geometry"),
            Rejection::BehindCamera => write!(f, "behind camera"),
            Rejection::ReprojectionTooHigh { error } => {
                write!(f, "reprojection error {:.3} too high", error)
            }
            Rejection::NoSolution => write!(f, "no solution"),
        }
    }
}

/// Outcome of one `promote_ready_landmarks` pass, in ascending id order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PromotionReport {
    pub promoted: Vec<(LandmarkId, Point3<f64>)>,
    pub rejected: Vec<(LandmarkId, Rejection)>,
}

impl PromotionReport {
    pub fn is_empty(&self) -> bool {
        self.promoted.is_empty() && self.rejected.is_empty()
    }
}

/// An observation edge between a pose and a committed landmark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LandmarkEdge {
    pub pose: PoseIndex,
    pub landmark: LandmarkId,
}

/// Counters for logging. `deferred` and `committed` are current sizes, the
/// rest are running totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LifecycleStats {
    pub deferred: usize,
    pub committed: usize,
    pub promoted: usize,
    pub rejected: usize,
    pub dropped: usize,
    pub pruned: usize,
}

// --- Implementation sub-modules ---
mod accumulator;
mod manager;

// --- Re-export the public structs for a clean API ---
pub use accumulator::{DeferredLandmarkAccumulator, PointObservation};
pub use manager::LandmarkLifecycleManager;
