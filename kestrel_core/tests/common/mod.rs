// kestrel_core/tests/common/mod.rs

#![allow(dead_code)]

use kestrel_core::prelude::*;
use nalgebra::{DMatrix, Isometry3, Point2, Point3};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Dense smoother whose updates can be made to fail on demand.
#[derive(Debug)]
pub struct FailingSolver {
    inner: DenseSmoother,
    fail: Arc<AtomicBool>,
}

impl FailingSolver {
    pub fn new(config: &SlamConfig) -> (Self, Arc<AtomicBool>) {
        let fail = Arc::new(AtomicBool::new(false));
        let solver = Self {
            inner: DenseSmoother::from_config(config),
            fail: Arc::clone(&fail),
        };
        (solver, fail)
    }
}

impl SolverAdapter for FailingSolver {
    fn update(
        &mut self,
        factors: &[Factor],
        initial_values: &BTreeMap<Key, Variable>,
    ) -> Result<SolverOutput> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SlamError::SolveFailed {
                reason: "forced failure".into(),
            });
        }
        self.inner.update(factors, initial_values)
    }

    fn marginal_covariance(&self, key: Key) -> Result<DMatrix<f64>> {
        self.inner.marginal_covariance(key)
    }

    fn marginal_covariances(&self, keys: &[Key]) -> Result<BTreeMap<Key, DMatrix<f64>>> {
        self.inner.marginal_covariances(keys)
    }

    fn evaluate_deferred_landmark(&self, observations: &[DeferredObservation]) -> DeferredEvaluation {
        self.inner.evaluate_deferred_landmark(observations)
    }

    fn remove_landmark(&mut self, id: LandmarkId) -> Result<()> {
        self.inner.remove_landmark(id)
    }
}

pub fn dense_session() -> SlamSession {
    SlamSession::with_dense_smoother(SlamConfig::default(), PinholeCalibration::default())
        .expect("default config is valid")
}

pub fn forward(meters: f64) -> Isometry3<f64> {
    Isometry3::translation(meters, 0.0, 0.0)
}

/// Pixel of `point` seen from the session's latest pose, shifted by `offset`.
pub fn pixel_from_latest(session: &SlamSession, point: &Point3<f64>, offset: [f64; 2]) -> Point2<f64> {
    let index = session.latest_pose_index().expect("session is initialized");
    let pose = session.get_pose(index).expect("latest pose exists").estimate;
    let pixel = PinholeCalibration::default()
        .project(&pose, point)
        .expect("point is in front of the camera");
    Point2::new(pixel.x + offset[0], pixel.y + offset[1])
}
