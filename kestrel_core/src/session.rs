// kestrel_core/src/session.rs

use nalgebra::{DMatrix, Isometry3, Point2, Point3};
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use tracing::info;

use crate::config::SlamConfig;
use crate::error::{Result, SlamError};
use crate::graph::{GraphSnapshot, GraphStore, IncrementalGraphBuilder, LandmarkNode, PoseNode, SolveSummary};
use crate::lifecycle::{LandmarkLifecycleManager, LandmarkState, LifecycleStats, PromotionReport};
use crate::models::PinholeCalibration;
use crate::solver::{DenseSmoother, SolverAdapter};
use crate::types::{Key, LandmarkId, PoseIndex};

/// # SlamSession
/// One SLAM session: the graph builder (with its store and solver), the
/// landmark lifecycle and the configuration they were built from.
///
/// Observations are always attached to the latest pose. A typical cycle is
/// `add_odometry`, a batch of observations, `solve`, `promote_with_config`,
/// `prune_with_config`.
#[derive(Debug)]
pub struct SlamSession {
    config: SlamConfig,
    builder: IncrementalGraphBuilder,
    lifecycle: LandmarkLifecycleManager,
}

impl SlamSession {
    pub fn new(
        config: SlamConfig,
        calibration: PinholeCalibration,
        solver: Box<dyn SolverAdapter>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            builder: IncrementalGraphBuilder::new(solver, &config.noise),
            lifecycle: LandmarkLifecycleManager::new(calibration, &config),
            config,
        })
    }

    /// A session backed by the bundled dense smoother.
    pub fn with_dense_smoother(config: SlamConfig, calibration: PinholeCalibration) -> Result<Self> {
        let solver = DenseSmoother::from_config(&config);
        Self::new(config, calibration, Box::new(solver))
    }

    fn current_pose(&self) -> Result<PoseIndex> {
        self.builder.latest_pose_index().ok_or_else(|| {
            SlamError::invalid_state("no pose to attach the observation to, initialize first")
        })
    }

    // --- Pose chain ---

    pub fn initialize(&mut self, prior: Option<Isometry3<f64>>) -> Result<()> {
        self.builder.initialize(prior)
    }

    pub fn add_odometry(&mut self, delta: Isometry3<f64>) -> Result<PoseIndex> {
        self.builder.add_odometry(delta)
    }

    // --- Observations ---

    pub fn observe_point_landmark(&mut self, id: LandmarkId, pixel: Point2<f64>) -> Result<LandmarkState> {
        let pose = self.current_pose()?;
        self.lifecycle
            .observe_point_landmark(&mut self.builder, pose, id, pixel)
    }

    pub fn observe_point_landmarks(&mut self, observations: &[(LandmarkId, Point2<f64>)]) -> Result<()> {
        let pose = self.current_pose()?;
        self.lifecycle
            .observe_point_landmarks(&mut self.builder, pose, observations)
    }

    pub fn observe_point_landmark_with_depth(
        &mut self,
        id: LandmarkId,
        pixel: Point2<f64>,
        point_in_camera: Point3<f64>,
    ) -> Result<LandmarkState> {
        let pose = self.current_pose()?;
        self.lifecycle.observe_point_landmark_with_depth(
            &mut self.builder,
            pose,
            id,
            pixel,
            point_in_camera,
        )
    }

    pub fn observe_pose_constrained_landmark(
        &mut self,
        id: LandmarkId,
        relative_pose: Isometry3<f64>,
    ) -> Result<LandmarkState> {
        let pose = self.current_pose()?;
        self.lifecycle
            .observe_pose_constrained_landmark(&mut self.builder, pose, id, relative_pose)
    }

    pub fn drop_deferred(&mut self, id: LandmarkId) -> Result<()> {
        self.lifecycle.drop_deferred(&mut self.builder, id)
    }

    // --- Solving ---

    pub fn solve(&mut self) -> Result<SolveSummary> {
        self.builder.solve()
    }

    /// Throws away the pending buffer after a failed solve, together with
    /// the poses and landmarks that only existed in it.
    /// Returns the keys that were rolled back.
    pub fn discard_pending(&mut self) -> Vec<Key> {
        let discarded = self.builder.discard_pending();
        self.lifecycle
            .forget_discarded(&mut self.builder, &discarded);
        discarded.initial_values().keys().copied().collect()
    }

    pub fn promote_ready_landmarks(
        &mut self,
        min_observations: usize,
        reprojection_error_threshold: f64,
    ) -> Result<PromotionReport> {
        self.lifecycle.promote_ready_landmarks(
            &mut self.builder,
            min_observations,
            reprojection_error_threshold,
        )
    }

    /// `promote_ready_landmarks` with the configured gate.
    pub fn promote_with_config(&mut self) -> Result<PromotionReport> {
        let landmarks = &self.config.landmarks;
        self.lifecycle.promote_ready_landmarks(
            &mut self.builder,
            landmarks.min_observations,
            landmarks.reprojection_error_threshold,
        )
    }

    /// Prunes landmarks first observed more than `max_age` poses before the
    /// latest pose.
    pub fn prune_stale(&mut self, max_age: u64) -> Result<Vec<LandmarkId>> {
        let current = self.builder.latest_pose_index().unwrap_or(0);
        self.lifecycle
            .prune_stale(&mut self.builder, current, max_age)
    }

    /// `prune_stale` with the configured window; a no-op without one.
    pub fn prune_with_config(&mut self) -> Result<Vec<LandmarkId>> {
        match self.config.landmarks.max_age {
            Some(max_age) => self.prune_stale(max_age),
            None => Ok(Vec::new()),
        }
    }

    // --- Queries ---

    pub fn get_pose(&self, index: PoseIndex) -> Result<&PoseNode> {
        self.builder.store().get_pose(index)
    }

    pub fn get_landmark(&self, id: LandmarkId) -> Result<&LandmarkNode> {
        self.builder.store().get_landmark(id)
    }

    /// Marginal covariance of a solved node. Computed on first request after
    /// a solve and cached until the next one.
    pub fn get_covariance(&mut self, key: Key) -> Result<DMatrix<f64>> {
        self.builder.marginal_covariance(key)
    }

    pub fn update_marginals(&mut self) -> Result<usize> {
        self.builder.update_marginals()
    }

    pub fn latest_pose_index(&self) -> Option<PoseIndex> {
        self.builder.latest_pose_index()
    }

    pub fn observation_count(&self, id: LandmarkId) -> usize {
        self.lifecycle.observation_count(id)
    }

    pub fn landmark_state(&self, id: LandmarkId) -> LandmarkState {
        self.lifecycle.state(id)
    }

    pub fn stats(&self) -> LifecycleStats {
        self.lifecycle.stats()
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        self.builder.store().snapshot()
    }

    pub fn store(&self) -> &GraphStore {
        self.builder.store()
    }

    pub fn builder(&self) -> &IncrementalGraphBuilder {
        &self.builder
    }

    pub fn lifecycle(&self) -> &LandmarkLifecycleManager {
        &self.lifecycle
    }

    pub fn config(&self) -> &SlamConfig {
        &self.config
    }

    pub fn log_summary(&self) {
        let stats = self.stats();
        info!(
            poses = self.store().num_poses(),
            landmarks = self.store().num_landmarks(),
            deferred = stats.deferred,
            promoted = stats.promoted,
            rejected = stats.rejected,
            dropped = stats.dropped,
            pruned = stats.pruned,
            "session summary"
        );
    }
}

// =========================================================================
// == Shared Session ==
// =========================================================================

/// A session that several threads can drive.
///
/// Store, pending buffer and accumulators are only consistent between whole
/// calls, so every call goes through one exclusive lock.
#[derive(Debug, Clone)]
pub struct SharedSession {
    inner: Arc<Mutex<SlamSession>>,
}

impl SharedSession {
    pub fn new(session: SlamSession) -> Self {
        Self {
            inner: Arc::new(Mutex::new(session)),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, SlamSession> {
        self.inner.lock()
    }

    /// Runs `f` with exclusive access to the session.
    pub fn with<R>(&self, f: impl FnOnce(&mut SlamSession) -> R) -> R {
        let mut session = self.inner.lock();
        f(&mut session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn session() -> SlamSession {
        SlamSession::with_dense_smoother(SlamConfig::default(), PinholeCalibration::default())
            .unwrap()
    }

    #[test]
    fn test_invalid_config_is_refused() {
        let mut config = SlamConfig::default();
        config.landmarks.min_observations = 0;
        let err = SlamSession::with_dense_smoother(config, PinholeCalibration::default()).unwrap_err();
        assert!(matches!(err, SlamError::InvalidConfig(_)));
    }

    #[test]
    fn test_observation_before_initialize_is_invalid() {
        let mut s = session();
        let err = s
            .observe_point_landmark(1, Point2::new(10.0, 10.0))
            .unwrap_err();
        assert!(matches!(err, SlamError::InvalidState(_)));
    }

    #[test]
    fn test_discard_pending_resets_landmarks_seen_in_rolled_back_poses() {
        let mut s = session();
        s.initialize(None).unwrap();
        s.solve().unwrap();

        s.add_odometry(Isometry3::translation(1.0, 0.0, 0.0)).unwrap();
        s.observe_point_landmark(3, Point2::new(320.0, 240.0)).unwrap();
        s.observe_pose_constrained_landmark(4, Isometry3::translation(0.0, 0.0, 2.0))
            .unwrap();

        let rolled_back = s.discard_pending();
        assert_eq!(rolled_back, vec![Key::Pose(1), Key::Landmark(4)]);
        assert_eq!(s.landmark_state(3), LandmarkState::Unseen);
        assert_eq!(s.landmark_state(4), LandmarkState::Unseen);
        assert!(!s.store().is_deferred(3));
        assert_eq!(s.latest_pose_index(), Some(0));
    }

    #[test]
    fn test_discard_pending_forgets_edges_to_surviving_landmarks() {
        let mut s = session();
        s.initialize(None).unwrap();
        s.observe_pose_constrained_landmark(5, Isometry3::translation(0.0, 0.0, 2.0))
            .unwrap();
        s.observe_point_landmark_with_depth(6, Point2::new(320.0, 240.0), Point3::new(0.0, 0.0, 4.0))
            .unwrap();
        s.solve().unwrap();
        let edges_before = s.lifecycle().landmark_edges();
        assert_eq!(s.observation_count(5), 1);
        assert_eq!(s.observation_count(6), 1);

        // New factors on the committed landmarks from the surviving pose 0.
        s.observe_pose_constrained_landmark(5, Isometry3::translation(0.0, 0.0, 2.0))
            .unwrap();
        s.observe_point_landmark(6, Point2::new(320.0, 240.0)).unwrap();
        assert_eq!(s.observation_count(5), 2);
        assert_eq!(s.observation_count(6), 2);

        assert!(s.discard_pending().is_empty());
        assert_eq!(s.observation_count(5), 1);
        assert_eq!(s.observation_count(6), 1);
        assert_eq!(s.lifecycle().landmark_edges(), edges_before);
        assert_eq!(s.landmark_state(5), LandmarkState::Committed);
        assert!(s.builder().pending().is_empty());
    }

    #[test]
    fn test_prune_with_config_respects_missing_window() {
        let mut config = SlamConfig::default();
        config.landmarks.max_age = None;
        let mut s = SlamSession::with_dense_smoother(config, PinholeCalibration::default()).unwrap();
        s.initialize(None).unwrap();
        s.observe_pose_constrained_landmark(1, Isometry3::identity()).unwrap();
        for _ in 0..5 {
            s.add_odometry(Isometry3::translation(1.0, 0.0, 0.0)).unwrap();
        }
        assert!(s.prune_with_config().unwrap().is_empty());
        assert_eq!(s.prune_stale(2).unwrap(), vec![1]);
    }

    #[test]
    fn test_shared_session_serializes_callers() {
        let shared = SharedSession::new(session());
        shared.with(|s| s.initialize(None)).unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let shared = shared.clone();
                thread::spawn(move || {
                    for _ in 0..5 {
                        shared
                            .with(|s| s.add_odometry(Isometry3::translation(0.5, 0.0, 0.0)))
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let session = shared.lock();
        assert_eq!(session.latest_pose_index(), Some(20));
        assert_eq!(session.builder().robot_edges().len(), 20);
    }
}
