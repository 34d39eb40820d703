// kestrel_core/src/graph/builder.rs

use nalgebra::{DMatrix, Isometry3, Vector6};
use std::collections::BTreeMap;
use tracing::{debug, error, info, warn};

use crate::config::NoiseConfig;
use crate::error::{Result, SlamError};
use crate::graph::{Factor, GraphStore, PendingUpdateBuffer};
use crate::solver::SolverAdapter;
use crate::types::{Key, LandmarkEstimate, LandmarkId, PoseIndex, Variable};

/// One odometry constraint of the pose chain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RobotEdge {
    pub from: PoseIndex,
    pub to: PoseIndex,
    pub measured: Isometry3<f64>,
}

/// What one call to `solve()` pushed through the solver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SolveSummary {
    pub factors: usize,
    pub new_variables: usize,
    pub poses: usize,
    pub landmarks: usize,
}

/// # IncrementalGraphBuilder
/// Owns the store, the pending buffer and the solver of one session.
///
/// Every new factor goes to the pending buffer first. Nothing reaches the
/// solver until `solve()`, which either commits the whole buffer or leaves
/// everything as it was.
#[derive(Debug)]
pub struct IncrementalGraphBuilder {
    store: GraphStore,
    pending: PendingUpdateBuffer,
    solver: Box<dyn SolverAdapter>,
    prior_sigmas: Vector6<f64>,
    odometry_sigmas: Vector6<f64>,
    latest: Option<PoseIndex>,
    robot_edges: Vec<RobotEdge>,
    solved: bool,
}

impl IncrementalGraphBuilder {
    pub fn new(solver: Box<dyn SolverAdapter>, noise: &NoiseConfig) -> Self {
        Self {
            store: GraphStore::new(),
            pending: PendingUpdateBuffer::new(),
            solver,
            prior_sigmas: Vector6::from_column_slice(&noise.prior_sigmas),
            odometry_sigmas: Vector6::from_column_slice(&noise.odometry_sigmas),
            latest: None,
            robot_edges: Vec::new(),
            solved: false,
        }
    }

    // --- Pose chain ---

    /// Creates pose 0, anchored by a prior factor at `prior` (identity when
    /// `None`).
    pub fn initialize(&mut self, prior: Option<Isometry3<f64>>) -> Result<()> {
        if self.latest.is_some() {
            return Err(SlamError::AlreadyInitialized);
        }
        let prior = prior.unwrap_or_else(Isometry3::identity);

        self.pending
            .insert_initial(Key::Pose(0), Variable::Pose(prior))?;
        self.pending.push_factor(Factor::PosePrior {
            pose: 0,
            prior,
            sigmas: self.prior_sigmas,
        });
        self.store.upsert_pose(0, prior);
        self.latest = Some(0);
        debug!("initialized pose chain at x0");
        Ok(())
    }

    /// Appends the next pose, `delta` after the latest one. Initializes the
    /// chain with an identity prior first if needed.
    pub fn add_odometry(&mut self, delta: Isometry3<f64>) -> Result<PoseIndex> {
        let from = match self.latest {
            Some(index) => index,
            None => {
                self.initialize(None)?;
                0
            }
        };
        let to = from + 1;
        let guess = self.store.get_pose(from)?.estimate * delta;

        self.pending
            .insert_initial(Key::Pose(to), Variable::Pose(guess))?;
        self.pending.push_factor(Factor::Between {
            from: Key::Pose(from),
            to: Key::Pose(to),
            measured: delta,
            sigmas: self.odometry_sigmas,
        });
        self.store.upsert_pose(to, guess);
        self.robot_edges.push(RobotEdge {
            from,
            to,
            measured: delta,
        });
        self.latest = Some(to);
        debug!(pose = to, "added odometry");
        Ok(to)
    }

    // --- Generic factors ---

    pub fn add_factor(
        &mut self,
        factor: Factor,
        initial_values: BTreeMap<Key, Variable>,
    ) -> Result<()> {
        self.add_factors(vec![factor], initial_values)
    }

    /// Queues factors together with initial guesses for the keys they
    /// introduce. Checked as a whole before anything is queued:
    /// - an initial value may only be given for a key the graph has never seen
    /// - every key a factor references must resolve
    pub fn add_factors(
        &mut self,
        factors: Vec<Factor>,
        initial_values: BTreeMap<Key, Variable>,
    ) -> Result<()> {
        for (key, value) in &initial_values {
            if self.store.contains(*key) || self.pending.has_initial(*key) {
                return Err(SlamError::invalid_state(format!(
                    "{} already exists, refusing a second initial value",
                    key
                )));
            }
            if let Some(id) = key.as_landmark() {
                if self.store.is_deferred(id) {
                    return Err(SlamError::invalid_state(format!(
                        "landmark {} is still deferred",
                        id
                    )));
                }
            } else if !matches!(value, Variable::Pose(_)) {
                return Err(SlamError::invalid_state(format!(
                    "pose {} needs a pose value",
                    key
                )));
            }
        }
        for factor in &factors {
            for key in factor.keys() {
                let resolvable = self.store.contains(key)
                    || self.pending.has_initial(key)
                    || initial_values.contains_key(&key);
                if !resolvable {
                    return Err(SlamError::invalid_state(format!(
                        "factor references unknown key {}",
                        key
                    )));
                }
            }
        }

        for (key, value) in initial_values {
            self.pending.insert_initial(key, value)?;
        }
        for factor in factors {
            self.pending.push_factor(factor);
        }
        Ok(())
    }

    /// Creates a landmark node with a provisional estimate and queues the
    /// factors that constrain it.
    pub fn insert_landmark(
        &mut self,
        id: LandmarkId,
        estimate: LandmarkEstimate,
        owner: PoseIndex,
        factors: Vec<Factor>,
    ) -> Result<()> {
        let mut initial = BTreeMap::new();
        initial.insert(Key::Landmark(id), Variable::from(estimate));
        self.add_factors(factors, initial)?;
        self.store.upsert_landmark(id, estimate, owner)
    }

    // --- Solving ---

    /// Hands the pending buffer to the solver and writes the result into
    /// the store.
    ///
    /// On solver failure the store and the pending buffer are left exactly
    /// as they were, so the caller can retry or `discard_pending`.
    ///
    /// Once the solver accepts the update it owns the buffer, which is
    /// cleared even if the store then refuses the returned estimates. That
    /// only happens with an adapter that changes a landmark's kind or returns
    /// a deferred id; the store keeps its previous estimates until the next
    /// solve.
    pub fn solve(&mut self) -> Result<SolveSummary> {
        if self.pending.is_empty() {
            debug!("solve with an empty buffer, nothing to do");
            return Ok(SolveSummary::default());
        }

        let output = self
            .solver
            .update(self.pending.factors(), self.pending.initial_values())
            .inspect_err(|e| warn!(error = %e, pending = self.pending.len(), "solve failed"))?;

        let summary = SolveSummary {
            factors: self.pending.len(),
            new_variables: self.pending.initial_values().len(),
            poses: output.poses.len(),
            landmarks: output.landmarks.len(),
        };
        self.pending.clear();
        self.store
            .apply_solution(&output)
            .inspect_err(|e| error!(error = %e, "store refused the solver output"))?;
        self.solved = true;
        info!(
            factors = summary.factors,
            new_variables = summary.new_variables,
            poses = summary.poses,
            landmarks = summary.landmarks,
            "solved"
        );
        Ok(summary)
    }

    /// Drops the pending buffer. Poses and landmarks that only existed as
    /// provisional guesses in it are removed from the store. Returns the
    /// discarded buffer.
    pub fn discard_pending(&mut self) -> PendingUpdateBuffer {
        let discarded = std::mem::take(&mut self.pending);
        for key in discarded.initial_values().keys() {
            match key {
                Key::Pose(index) => self.store.rollback_pose(*index),
                Key::Landmark(id) => self.store.rollback_landmark(*id),
            }
        }
        self.robot_edges
            .retain(|edge| !discarded.has_initial(Key::Pose(edge.to)));
        self.latest = self.store.poses().last().map(|node| node.index);

        if !discarded.is_empty() {
            warn!(
                keys = discarded.initial_values().len(),
                factors = discarded.len(),
                "discarded pending update"
            );
        }
        discarded
    }

    /// Removes a landmark from the store, the pending buffer and the solver.
    pub fn forget_landmark(&mut self, id: LandmarkId) -> Result<()> {
        self.store.prune_landmark(id)?;
        self.pending.discard_key(Key::Landmark(id));
        match self.solver.remove_landmark(id) {
            // Provisional landmarks never reached the solver.
            Ok(()) | Err(SlamError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    // --- Uncertainty ---

    /// Marginal covariance of a solved node, cached in the store until the
    /// next solve.
    pub fn marginal_covariance(&mut self, key: Key) -> Result<DMatrix<f64>> {
        if let Ok(cached) = self.store.get_covariance(key) {
            return Ok(cached.clone());
        }
        if !self.store.contains(key) || self.pending.has_initial(key) {
            return Err(SlamError::NotFound(key));
        }
        let covariance = self.solver.marginal_covariance(key)?;
        self.store.set_covariance(key, covariance.clone())?;
        Ok(covariance)
    }

    /// Recomputes and caches the covariance of every solved node. Returns
    /// the number of nodes updated.
    pub fn update_marginals(&mut self) -> Result<usize> {
        let keys: Vec<Key> = self
            .store
            .poses()
            .map(|node| Key::Pose(node.index))
            .chain(self.store.landmarks().map(|node| Key::Landmark(node.id)))
            .filter(|key| !self.pending.has_initial(*key))
            .collect();

        let covariances = self.solver.marginal_covariances(&keys)?;
        for (key, covariance) in covariances {
            self.store.set_covariance(key, covariance)?;
        }
        debug!(nodes = keys.len(), "updated marginals");
        Ok(keys.len())
    }

    // --- Accessors ---

    pub fn latest_pose_index(&self) -> Option<PoseIndex> {
        self.latest
    }

    pub fn is_initialized(&self) -> bool {
        self.latest.is_some()
    }

    /// True once at least one solve has succeeded.
    pub fn estimate_available(&self) -> bool {
        self.solved
    }

    pub fn pending(&self) -> &PendingUpdateBuffer {
        &self.pending
    }

    pub fn robot_edges(&self) -> &[RobotEdge] {
        &self.robot_edges
    }

    pub fn store(&self) -> &GraphStore {
        &self.store
    }

    pub(crate) fn store_mut(&mut self) -> &mut GraphStore {
        &mut self.store
    }

    pub fn solver(&self) -> &dyn SolverAdapter {
        self.solver.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SolverConfig;
    use crate::solver::{DeferredEvaluation, DeferredObservation, DenseSmoother, SolverOutput};
    use approx::assert_abs_diff_eq;
    use nalgebra::Point3;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Wraps the dense smoother and fails every update while `fail` is set.
    /// Counts single-key covariance queries.
    #[derive(Debug)]
    struct FlakySolver {
        inner: DenseSmoother,
        fail: bool,
        single_queries: Arc<AtomicUsize>,
    }

    impl SolverAdapter for FlakySolver {
        fn update(
            &mut self,
            factors: &[Factor],
            initial_values: &BTreeMap<Key, Variable>,
        ) -> Result<SolverOutput> {
            if self.fail {
                return Err(SlamError::solve_failed("forced failure"));
            }
            self.inner.update(factors, initial_values)
        }

        fn marginal_covariance(&self, key: Key) -> Result<DMatrix<f64>> {
            self.single_queries.fetch_add(1, Ordering::SeqCst);
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

    fn builder() -> IncrementalGraphBuilder {
        IncrementalGraphBuilder::new(
            Box::new(DenseSmoother::new(SolverConfig::default(), 1.0)),
            &NoiseConfig::default(),
        )
    }

    fn flaky_builder(fail: bool) -> IncrementalGraphBuilder {
        counting_builder(fail).0
    }

    fn counting_builder(fail: bool) -> (IncrementalGraphBuilder, Arc<AtomicUsize>) {
        let single_queries = Arc::new(AtomicUsize::new(0));
        let builder = IncrementalGraphBuilder::new(
            Box::new(FlakySolver {
                inner: DenseSmoother::new(SolverConfig::default(), 1.0),
                fail,
                single_queries: Arc::clone(&single_queries),
            }),
            &NoiseConfig::default(),
        );
        (builder, single_queries)
    }

    fn forward(meters: f64) -> Isometry3<f64> {
        Isometry3::translation(meters, 0.0, 0.0)
    }

    #[test]
    fn test_initialize_twice_fails() {
        let mut b = builder();
        b.initialize(None).unwrap();
        assert_eq!(b.initialize(None).unwrap_err(), SlamError::AlreadyInitialized);
    }

    #[test]
    fn test_odometry_lazily_initializes_and_advances() {
        let mut b = builder();
        assert_eq!(b.latest_pose_index(), None);
        for expected in 1..=4 {
            assert_eq!(b.add_odometry(forward(1.0)).unwrap(), expected);
            assert_eq!(b.latest_pose_index(), Some(expected));
        }
        assert_eq!(b.robot_edges().len(), 4);

        // Provisional guesses are readable before any solve.
        let x4 = b.store().get_pose(4).unwrap().estimate.translation.vector;
        assert_abs_diff_eq!(x4.x, 4.0, epsilon = 1e-12);
        assert!(!b.estimate_available());

        b.solve().unwrap();
        assert!(b.estimate_available());
        assert!(b.pending().is_empty());
        for index in 0..=4 {
            assert!(b.store().get_pose(index).is_ok());
        }
    }

    #[test]
    fn test_empty_solve_is_noop() {
        let mut b = builder();
        assert_eq!(b.solve().unwrap(), SolveSummary::default());
        assert_eq!(b.store().num_poses(), 0);
    }

    #[test]
    fn test_dangling_factor_is_refused() {
        let mut b = builder();
        b.initialize(None).unwrap();
        let factor = Factor::Between {
            from: Key::Pose(0),
            to: Key::Landmark(3),
            measured: forward(1.0),
            sigmas: Vector6::repeat(0.4),
        };
        let err = b.add_factor(factor, BTreeMap::new()).unwrap_err();
        assert!(matches!(err, SlamError::InvalidState(_)));
        assert_eq!(b.pending().len(), 1);
    }

    #[test]
    fn test_initial_value_for_existing_key_is_refused() {
        let mut b = builder();
        b.initialize(None).unwrap();
        b.solve().unwrap();

        let mut initial = BTreeMap::new();
        initial.insert(Key::Pose(0), Variable::Pose(forward(3.0)));
        let err = b
            .add_factor(
                Factor::PosePrior {
                    pose: 0,
                    prior: forward(3.0),
                    sigmas: Vector6::repeat(1.0),
                },
                initial,
            )
            .unwrap_err();
        assert!(matches!(err, SlamError::InvalidState(_)));
        assert!(b.pending().is_empty());
    }

    #[test]
    fn test_failed_solve_preserves_store_and_buffer() {
        let mut b = flaky_builder(true);
        b.add_odometry(forward(1.0)).unwrap();
        b.add_odometry(forward(1.0)).unwrap();
        let store_before = b.store().clone();
        let pending_before = b.pending().clone();

        let err = b.solve().unwrap_err();
        assert!(matches!(err, SlamError::SolveFailed { .. }));
        assert_eq!(b.store(), &store_before);
        assert_eq!(b.pending(), &pending_before);
        assert!(!b.estimate_available());
    }

    #[test]
    fn test_discard_pending_rolls_back_provisional_poses() {
        let mut b = builder();
        b.add_odometry(forward(1.0)).unwrap();
        b.solve().unwrap();
        b.add_odometry(forward(1.0)).unwrap();
        b.add_odometry(forward(1.0)).unwrap();

        let discarded = b.discard_pending();
        let keys: Vec<Key> = discarded.initial_values().keys().copied().collect();
        assert_eq!(keys, vec![Key::Pose(2), Key::Pose(3)]);
        assert_eq!(discarded.len(), 2);
        assert_eq!(b.latest_pose_index(), Some(1));
        assert_eq!(b.robot_edges().len(), 1);
        assert!(b.store().get_pose(2).is_err());
        assert!(b.pending().is_empty());

        // The chain continues from the last solved pose.
        assert_eq!(b.add_odometry(forward(1.0)).unwrap(), 2);
    }

    #[test]
    fn test_discard_pending_rolls_back_provisional_landmarks() {
        let mut b = builder();
        b.initialize(None).unwrap();
        b.solve().unwrap();
        let edge = Factor::Between {
            from: Key::Pose(0),
            to: Key::Landmark(4),
            measured: forward(2.0),
            sigmas: Vector6::repeat(0.4),
        };
        let estimate = LandmarkEstimate::Pose(forward(2.0));
        b.insert_landmark(4, estimate, 0, vec![edge.clone()]).unwrap();
        assert!(b.store().contains(Key::Landmark(4)));

        let discarded = b.discard_pending();
        assert!(discarded.has_initial(Key::Landmark(4)));
        assert!(!b.store().contains(Key::Landmark(4)));
        assert!(b.store().contains(Key::Pose(0)));

        // The id is free again.
        b.insert_landmark(4, estimate, 0, vec![edge]).unwrap();
        b.solve().unwrap();
        assert!(b.store().get_landmark(4).is_ok());
    }

    #[test]
    fn test_landmark_insertion_and_forgetting() {
        let mut b = builder();
        b.initialize(None).unwrap();
        let edge = Factor::Between {
            from: Key::Pose(0),
            to: Key::Landmark(9),
            measured: forward(2.0),
            sigmas: Vector6::repeat(0.4),
        };
        b.insert_landmark(9, LandmarkEstimate::Pose(forward(2.0)), 0, vec![edge])
            .unwrap();
        b.solve().unwrap();
        assert_eq!(b.store().get_landmark(9).unwrap().owner, 0);

        // A committed id cannot be inserted again.
        let point = LandmarkEstimate::Point(Point3::new(0.0, 0.0, 5.0));
        assert!(b.insert_landmark(9, point, 0, Vec::new()).is_err());

        b.forget_landmark(9).unwrap();
        assert!(!b.store().contains(Key::Landmark(9)));
        assert!(matches!(
            b.forget_landmark(9),
            Err(SlamError::NotFound(Key::Landmark(9)))
        ));
    }

    #[test]
    fn test_marginal_covariance_is_cached_until_next_solve() {
        let mut b = builder();
        b.add_odometry(forward(1.0)).unwrap();
        assert!(matches!(
            b.marginal_covariance(Key::Pose(1)),
            Err(SlamError::NotFound(_))
        ));
        b.solve().unwrap();

        let c1 = b.marginal_covariance(Key::Pose(1)).unwrap();
        assert_eq!(c1.shape(), (6, 6));
        assert!(b.store().get_covariance(Key::Pose(1)).is_ok());

        assert_eq!(b.update_marginals().unwrap(), 2);
        b.add_odometry(forward(1.0)).unwrap();
        b.solve().unwrap();
        assert!(b.store().get_covariance(Key::Pose(1)).is_err());

        let c1_after = b.marginal_covariance(Key::Pose(1)).unwrap();
        assert_abs_diff_eq!(c1_after[(0, 0)], c1[(0, 0)], epsilon = 1e-9);
    }

    #[test]
    fn test_update_marginals_uses_one_batch_query() {
        let (mut b, single_queries) = counting_builder(false);
        for _ in 0..5 {
            b.add_odometry(forward(1.0)).unwrap();
        }
        b.solve().unwrap();

        assert_eq!(b.update_marginals().unwrap(), 6);
        assert_eq!(single_queries.load(Ordering::SeqCst), 0);
        for index in 0..=5 {
            assert_eq!(b.store().get_covariance(Key::Pose(index)).unwrap().shape(), (6, 6));
        }
        // Served from the cache, not the solver.
        b.marginal_covariance(Key::Pose(3)).unwrap();
        assert_eq!(single_queries.load(Ordering::SeqCst), 0);
    }

    /// Returns every landmark as a point on its first update only.
    #[derive(Debug)]
    struct MislabelingSolver {
        inner: DenseSmoother,
        armed: bool,
    }

    impl SolverAdapter for MislabelingSolver {
        fn update(
            &mut self,
            factors: &[Factor],
            initial_values: &BTreeMap<Key, Variable>,
        ) -> Result<SolverOutput> {
            let mut output = self.inner.update(factors, initial_values)?;
            if std::mem::take(&mut self.armed) {
                for estimate in output.landmarks.values_mut() {
                    *estimate = LandmarkEstimate::Point(estimate.position());
                }
            }
            Ok(output)
        }

        fn marginal_covariance(&self, key: Key) -> Result<DMatrix<f64>> {
            self.inner.marginal_covariance(key)
        }

        fn evaluate_deferred_landmark(&self, observations: &[DeferredObservation]) -> DeferredEvaluation {
            self.inner.evaluate_deferred_landmark(observations)
        }

        fn remove_landmark(&mut self, id: LandmarkId) -> Result<()> {
            self.inner.remove_landmark(id)
        }
    }

    #[test]
    fn test_refused_solver_output_does_not_block_the_next_solve() {
        let mut b = IncrementalGraphBuilder::new(
            Box::new(MislabelingSolver {
                inner: DenseSmoother::new(SolverConfig::default(), 1.0),
                armed: true,
            }),
            &NoiseConfig::default(),
        );
        b.initialize(None).unwrap();
        let edge = Factor::Between {
            from: Key::Pose(0),
            to: Key::Landmark(2),
            measured: forward(2.0),
            sigmas: Vector6::repeat(0.4),
        };
        b.insert_landmark(2, LandmarkEstimate::Pose(forward(2.0)), 0, vec![edge])
            .unwrap();

        let err = b.solve().unwrap_err();
        assert!(matches!(err, SlamError::InvalidState(_)));
        assert!(b.pending().is_empty());
        assert!(matches!(
            b.store().get_landmark(2).unwrap().estimate,
            LandmarkEstimate::Pose(_)
        ));

        // The solver already holds the first update; the next one goes through.
        b.add_odometry(forward(1.0)).unwrap();
        b.solve().unwrap();
        assert!(b.estimate_available());
        assert!(b.store().get_pose(1).is_ok());
    }
}
