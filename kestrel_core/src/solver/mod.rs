// kestrel_core/src/solver/mod.rs

use nalgebra::{DMatrix, Isometry3, Point2, Point3, Vector2};
use std::collections::BTreeMap;
use std::fmt::Debug;

use crate::error::Result;
use crate::graph::Factor;
use crate::models::PinholeCalibration;
use crate::types::{Key, LandmarkEstimate, LandmarkId, PoseIndex, Variable};

// --- Solver Data Structures ---

/// Updated estimates returned by a solver, already partitioned by node kind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SolverOutput {
    pub poses: BTreeMap<PoseIndex, Isometry3<f64>>,
    pub landmarks: BTreeMap<LandmarkId, LandmarkEstimate>,
}

/// One observation of a not-yet-initialized point landmark.
#[derive(Debug, Clone, PartialEq)]
pub struct DeferredObservation {
    pub pose: PoseIndex,
    /// Current estimate of the observing pose (camera-to-world).
    pub pose_estimate: Isometry3<f64>,
    pub measured: Point2<f64>,
    pub sigmas: Vector2<f64>,
    pub calibration: PinholeCalibration,
}

/// Quality diagnostics of a triangulation attempt.
///
/// `reprojection_error` is `0.5 * sum(|whitened residual|^2)` over every
/// observation. A found solution always reports a strictly positive error,
/// so a non-positive or non-finite value means no solution was found.
#[derive(Debug, Clone, PartialEq)]
pub struct DeferredEvaluation {
    pub estimate: Option<Point3<f64>>,
    pub reprojection_error: f64,
    pub is_degenerate: bool,
    pub is_behind_camera: bool,
}

impl DeferredEvaluation {
    pub fn degenerate() -> Self {
        Self {
            estimate: None,
            reprojection_error: 0.0,
            is_degenerate: true,
            is_behind_camera: false,
        }
    }
}

// --- The SolverAdapter Trait ("Contract") ---
/// The contract for an incremental nonlinear least-squares backend.
///
/// The solver owns the full factor graph. Each `update` adds new factors and
/// initial values and returns the current estimate of every variable.
pub trait SolverAdapter: Debug + Send {
    /// Performs one incremental update.
    ///
    /// Must be atomic: on `Err` (typically `SolveFailed`) the solver's graph
    /// is exactly what it was before the call.
    fn update(
        &mut self,
        factors: &[Factor],
        initial_values: &BTreeMap<Key, Variable>,
    ) -> Result<SolverOutput>;

    /// Marginal covariance of one variable of the solved graph, in its
    /// tangent space. `NotFound` if the key has not been solved.
    fn marginal_covariance(&self, key: Key) -> Result<DMatrix<f64>>;

    /// Marginal covariances of several variables at once. Backends that
    /// factorize the whole system should override this to factorize once;
    /// the default queries each key on its own.
    fn marginal_covariances(&self, keys: &[Key]) -> Result<BTreeMap<Key, DMatrix<f64>>> {
        keys.iter()
            .map(|key| Ok((*key, self.marginal_covariance(*key)?)))
            .collect()
    }

    /// Triangulates a point from its accumulated observations and reports the
    /// diagnostics the promotion gate needs. Never mutates the graph.
    fn evaluate_deferred_landmark(&self, observations: &[DeferredObservation]) -> DeferredEvaluation;

    /// Forgets a landmark and every factor attached to it. `NotFound` if the
    /// solver never saw it.
    fn remove_landmark(&mut self, id: LandmarkId) -> Result<()>;
}

// --- Implementation sub-modules ---
mod dense;
pub mod manifold;
pub mod triangulation;

// --- Re-export the public structs for a clean API ---
pub use dense::DenseSmoother;
