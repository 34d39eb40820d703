// kestrel_core/src/lifecycle/manager.rs

use nalgebra::{Isometry3, Point2, Point3, Vector2, Vector6};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

use crate::config::{RetentionPolicy, SlamConfig};
use crate::error::{Result, SlamError};
use crate::graph::{Factor, IncrementalGraphBuilder, PendingUpdateBuffer};
use crate::lifecycle::{
    DeferredLandmarkAccumulator, LandmarkEdge, LandmarkState, LifecycleStats, PointObservation,
    PromotionReport, Rejection,
};
use crate::models::camera::MIN_DEPTH;
use crate::models::PinholeCalibration;
use crate::solver::{DeferredEvaluation, DeferredObservation};
use crate::types::{Key, LandmarkEstimate, LandmarkId, PoseIndex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LandmarkKind {
    Point,
    Pose,
}

/// Bookkeeping for a landmark that has a node in the graph.
#[derive(Debug, Clone, PartialEq)]
struct CommittedLandmark {
    kind: LandmarkKind,
    /// Every pose this landmark was observed from, in observation order.
    observed_from: Vec<PoseIndex>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Totals {
    promoted: usize,
    rejected: usize,
    dropped: usize,
    pruned: usize,
}

/// # LandmarkLifecycleManager
/// Decides, per observation, whether a factor goes straight to the builder
/// or waits in a deferred accumulator, and promotes deferred landmarks once
/// their triangulation passes the quality gate.
///
/// The manager holds the per-session observation state. The graph itself is
/// passed in on every call so one session owns exactly one of each.
#[derive(Debug, Clone)]
pub struct LandmarkLifecycleManager {
    accumulators: BTreeMap<LandmarkId, DeferredLandmarkAccumulator>,
    committed: BTreeMap<LandmarkId, CommittedLandmark>,
    calibration: PinholeCalibration,
    pixel_sigmas: Vector2<f64>,
    pose_landmark_sigmas: Vector6<f64>,
    retention: RetentionPolicy,
    totals: Totals,
}

impl LandmarkLifecycleManager {
    pub fn new(calibration: PinholeCalibration, config: &SlamConfig) -> Self {
        Self {
            accumulators: BTreeMap::new(),
            committed: BTreeMap::new(),
            calibration,
            pixel_sigmas: Vector2::from_column_slice(&config.noise.pixel_sigmas),
            pose_landmark_sigmas: Vector6::repeat(config.noise.pose_landmark_sigma),
            retention: config.landmarks.retention,
            totals: Totals::default(),
        }
    }

    pub fn calibration(&self) -> &PinholeCalibration {
        &self.calibration
    }

    fn projection(&self, pose: PoseIndex, id: LandmarkId, pixel: Point2<f64>) -> Factor {
        Factor::Projection {
            pose,
            landmark: id,
            measured: pixel,
            sigmas: self.pixel_sigmas,
            calibration: self.calibration,
        }
    }

    fn committed_mut(&mut self, id: LandmarkId, kind: LandmarkKind) -> Result<&mut CommittedLandmark> {
        match self.committed.get_mut(&id) {
            Some(record) if record.kind == kind => Ok(record),
            Some(_) => Err(SlamError::invalid_state(format!(
                "landmark {} was committed as a different kind",
                id
            ))),
            None => Err(SlamError::NotFound(Key::Landmark(id))),
        }
    }

    // =========================================================================
    // == Observations ==
    // =========================================================================

    /// A pixel sighting of a point feature from `pose`.
    ///
    /// Unseen ids open a deferred accumulator, deferred ids accumulate, and
    /// committed ids get a projection factor right away.
    pub fn observe_point_landmark(
        &mut self,
        builder: &mut IncrementalGraphBuilder,
        pose: PoseIndex,
        id: LandmarkId,
        pixel: Point2<f64>,
    ) -> Result<LandmarkState> {
        builder.store().get_pose(pose)?;

        if self.committed.contains_key(&id) {
            let factor = self.projection(pose, id, pixel);
            let record = self.committed_mut(id, LandmarkKind::Point)?;
            builder.add_factor(factor, BTreeMap::new())?;
            record.observed_from.push(pose);
            debug!(landmark = id, pose, "projection factor on committed landmark");
            return Ok(LandmarkState::Committed);
        }

        let observation = PointObservation { pose, pixel };
        match self.accumulators.get_mut(&id) {
            Some(acc) => {
                acc.push(observation);
                debug!(landmark = id, pose, count = acc.len(), "deferred observation");
            }
            None => {
                builder.store_mut().open_deferred(id)?;
                self.accumulators
                    .insert(id, DeferredLandmarkAccumulator::new(observation));
                debug!(landmark = id, pose, "opened deferred landmark");
            }
        }
        Ok(LandmarkState::Deferred)
    }

    /// All point sightings of one frame. After recording them, deferred ids
    /// missing from the frame are dropped under `RetentionPolicy::DropUntracked`.
    ///
    /// Stops at the first structural error; sightings before it stay recorded.
    pub fn observe_point_landmarks(
        &mut self,
        builder: &mut IncrementalGraphBuilder,
        pose: PoseIndex,
        observations: &[(LandmarkId, Point2<f64>)],
    ) -> Result<()> {
        for (id, pixel) in observations {
            self.observe_point_landmark(builder, pose, *id, *pixel)?;
        }

        if self.retention == RetentionPolicy::DropUntracked {
            let tracked: BTreeSet<LandmarkId> = observations.iter().map(|(id, _)| *id).collect();
            let untracked: Vec<LandmarkId> = self
                .accumulators
                .keys()
                .filter(|id| !tracked.contains(id))
                .copied()
                .collect();
            for id in &untracked {
                self.remove_accumulator(builder, *id);
            }
            if !untracked.is_empty() {
                debug!(dropped = untracked.len(), "dropped untracked deferred landmarks");
            }
        }
        Ok(())
    }

    /// A sighting that also carries the point's position in the camera
    /// frame (stereo or depth camera). The landmark is initialized at once;
    /// a deferred id is committed together with everything it accumulated.
    pub fn observe_point_landmark_with_depth(
        &mut self,
        builder: &mut IncrementalGraphBuilder,
        pose: PoseIndex,
        id: LandmarkId,
        pixel: Point2<f64>,
        point_in_camera: Point3<f64>,
    ) -> Result<LandmarkState> {
        if self.committed.contains_key(&id) {
            return self.observe_point_landmark(builder, pose, id, pixel);
        }
        if point_in_camera.z <= MIN_DEPTH {
            return Err(SlamError::invalid_state(format!(
                "landmark {} measured at non-positive depth {}",
                id, point_in_camera.z
            )));
        }
        let estimate = builder.store().get_pose(pose)?.estimate * point_in_camera;

        let mut sightings: Vec<PointObservation> = self
            .accumulators
            .get(&id)
            .map(|acc| acc.observations().to_vec())
            .unwrap_or_default();
        sightings.push(PointObservation { pose, pixel });

        let was_deferred = self.accumulators.contains_key(&id);
        self.commit_point(builder, id, estimate, &sightings)?;
        if was_deferred {
            self.accumulators.remove(&id);
        }
        debug!(landmark = id, pose, observations = sightings.len(), "initialized landmark from depth");
        Ok(LandmarkState::Committed)
    }

    /// A relative-pose measurement of a landmark that is itself a rigid body
    /// (e.g. a fiducial). One measurement is enough to seed it, so these
    /// landmarks skip the deferred state.
    pub fn observe_pose_constrained_landmark(
        &mut self,
        builder: &mut IncrementalGraphBuilder,
        pose: PoseIndex,
        id: LandmarkId,
        relative_pose: Isometry3<f64>,
    ) -> Result<LandmarkState> {
        if self.accumulators.contains_key(&id) {
            return Err(SlamError::invalid_state(format!(
                "landmark {} is deferred as a point feature",
                id
            )));
        }
        let pose_estimate = builder.store().get_pose(pose)?.estimate;
        let factor = Factor::Between {
            from: Key::Pose(pose),
            to: Key::Landmark(id),
            measured: relative_pose,
            sigmas: self.pose_landmark_sigmas,
        };

        if self.committed.contains_key(&id) {
            let record = self.committed_mut(id, LandmarkKind::Pose)?;
            builder.add_factor(factor, BTreeMap::new())?;
            record.observed_from.push(pose);
            debug!(landmark = id, pose, "relative-pose factor on committed landmark");
            return Ok(LandmarkState::Committed);
        }

        let seed = pose_estimate * relative_pose;
        builder.insert_landmark(id, LandmarkEstimate::Pose(seed), pose, vec![factor])?;
        self.committed.insert(
            id,
            CommittedLandmark {
                kind: LandmarkKind::Pose,
                observed_from: vec![pose],
            },
        );
        debug!(landmark = id, pose, "committed pose landmark");
        Ok(LandmarkState::Committed)
    }

    // =========================================================================
    // == Promotion ==
    // =========================================================================

    /// Tries to promote every deferred landmark with at least
    /// `min_observations` sightings, in ascending id order.
    ///
    /// Quality failures are reported in the returned `PromotionReport` and
    /// leave the landmark deferred. Only structural failures are errors.
    pub fn promote_ready_landmarks(
        &mut self,
        builder: &mut IncrementalGraphBuilder,
        min_observations: usize,
        reprojection_error_threshold: f64,
    ) -> Result<PromotionReport> {
        let mut report = PromotionReport::default();
        let candidates: Vec<LandmarkId> = self
            .accumulators
            .iter()
            .filter(|(_, acc)| !acc.is_committed() && acc.len() >= min_observations)
            .map(|(id, _)| *id)
            .collect();

        let outcome = candidates.into_iter().try_for_each(|id| {
            self.promote_one(builder, id, reprojection_error_threshold, &mut report)
        });
        // Committed accumulators are swept even when a later candidate failed.
        self.accumulators.retain(|_, acc| !acc.is_committed());
        outcome?;

        if !report.promoted.is_empty() {
            info!(
                promoted = report.promoted.len(),
                rejected = report.rejected.len(),
                deferred = self.accumulators.len(),
                "landmark promotion"
            );
        }
        Ok(report)
    }

    fn promote_one(
        &mut self,
        builder: &mut IncrementalGraphBuilder,
        id: LandmarkId,
        threshold: f64,
        report: &mut PromotionReport,
    ) -> Result<()> {
        let Some(acc) = self.accumulators.get(&id) else {
            return Ok(());
        };
        let sightings = acc.observations().to_vec();
        let observations = self.deferred_observations(builder, &sightings)?;
        let evaluation = builder.solver().evaluate_deferred_landmark(&observations);

        match gate(&evaluation, threshold) {
            Err(rejection) => {
                debug!(landmark = id, reason = %rejection, "promotion rejected");
                self.totals.rejected += 1;
                report.rejected.push((id, rejection));
            }
            Ok(point) => {
                self.commit_point(builder, id, point, &sightings)?;
                if let Some(acc) = self.accumulators.get_mut(&id) {
                    acc.mark_committed();
                }
                debug!(
                    landmark = id,
                    error = evaluation.reprojection_error,
                    observations = sightings.len(),
                    "promoted landmark"
                );
                self.totals.promoted += 1;
                report.promoted.push((id, point));
            }
        }
        Ok(())
    }

    fn deferred_observations(
        &self,
        builder: &IncrementalGraphBuilder,
        sightings: &[PointObservation],
    ) -> Result<Vec<DeferredObservation>> {
        sightings
            .iter()
            .map(|s| {
                Ok(DeferredObservation {
                    pose: s.pose,
                    pose_estimate: builder.store().get_pose(s.pose)?.estimate,
                    measured: s.pixel,
                    sigmas: self.pixel_sigmas,
                    calibration: self.calibration,
                })
            })
            .collect()
    }

    /// Turns a set of sightings into a committed point landmark: closes the
    /// deferred guard, creates the node and queues one projection factor per
    /// sighting. The guard is reopened if the builder refuses the landmark.
    fn commit_point(
        &mut self,
        builder: &mut IncrementalGraphBuilder,
        id: LandmarkId,
        point: Point3<f64>,
        sightings: &[PointObservation],
    ) -> Result<()> {
        let owner = sightings.first().map(|s| s.pose).ok_or_else(|| {
            SlamError::invalid_state(format!("landmark {} has no observations", id))
        })?;
        let factors = sightings
            .iter()
            .map(|s| self.projection(s.pose, id, s.pixel))
            .collect();

        let was_deferred = builder.store().is_deferred(id);
        builder.store_mut().close_deferred(id);
        if let Err(e) = builder.insert_landmark(id, LandmarkEstimate::Point(point), owner, factors) {
            if was_deferred {
                builder.store_mut().open_deferred(id)?;
            }
            return Err(e);
        }

        self.committed.insert(
            id,
            CommittedLandmark {
                kind: LandmarkKind::Point,
                observed_from: sightings.iter().map(|s| s.pose).collect(),
            },
        );
        Ok(())
    }

    // =========================================================================
    // == Forgetting ==
    // =========================================================================

    /// Removes every committed landmark first observed before
    /// `current_pose_index - max_age` from the store, the solver and the
    /// pending buffer. Pruned ids become unseen again. Returns the pruned ids.
    pub fn prune_stale(
        &mut self,
        builder: &mut IncrementalGraphBuilder,
        current_pose_index: PoseIndex,
        max_age: u64,
    ) -> Result<Vec<LandmarkId>> {
        let cutoff = current_pose_index.saturating_sub(max_age);
        let stale = builder.store().landmarks_owned_before(cutoff);

        for id in &stale {
            builder.forget_landmark(*id)?;
            self.committed.remove(id);
        }
        if !stale.is_empty() {
            self.totals.pruned += stale.len();
            info!(pruned = stale.len(), cutoff, "pruned stale landmarks");
        }
        Ok(stale)
    }

    /// Gives up on a deferred landmark. `NotFound` if the id is not deferred.
    pub fn drop_deferred(
        &mut self,
        builder: &mut IncrementalGraphBuilder,
        id: LandmarkId,
    ) -> Result<()> {
        if !self.accumulators.contains_key(&id) {
            return Err(SlamError::NotFound(Key::Landmark(id)));
        }
        self.remove_accumulator(builder, id);
        warn!(landmark = id, "dropped deferred landmark");
        Ok(())
    }

    fn remove_accumulator(&mut self, builder: &mut IncrementalGraphBuilder, id: LandmarkId) {
        if self.accumulators.remove(&id).is_some() {
            builder.store_mut().close_deferred(id);
            self.totals.dropped += 1;
        }
    }

    /// Reconciles lifecycle state with a builder whose pending buffer was
    /// just discarded: rolled-back landmarks become unseen, sightings from
    /// rolled-back poses are forgotten, and every discarded direct factor
    /// takes its observation edge with it.
    pub(crate) fn forget_discarded(
        &mut self,
        builder: &mut IncrementalGraphBuilder,
        discarded: &PendingUpdateBuffer,
    ) {
        let rolled_back = discarded.initial_values();
        let poses: Vec<PoseIndex> = rolled_back
            .keys()
            .filter_map(|key| match key {
                Key::Pose(index) => Some(*index),
                Key::Landmark(_) => None,
            })
            .collect();

        for id in rolled_back.keys().filter_map(Key::as_landmark) {
            self.committed.remove(&id);
        }
        for factor in discarded.factors() {
            let (pose, id) = match factor {
                Factor::Projection { pose, landmark, .. } => (*pose, *landmark),
                Factor::Between {
                    from: Key::Pose(pose),
                    to: Key::Landmark(id),
                    ..
                } => (*pose, *id),
                _ => continue,
            };
            if let Some(record) = self.committed.get_mut(&id) {
                if let Some(at) = record.observed_from.iter().rposition(|p| *p == pose) {
                    record.observed_from.remove(at);
                }
            }
        }

        let emptied: Vec<LandmarkId> = self
            .accumulators
            .iter_mut()
            .filter_map(|(id, acc)| {
                acc.remove_poses(&poses);
                acc.is_empty().then_some(*id)
            })
            .collect();
        for id in emptied {
            self.accumulators.remove(&id);
            builder.store_mut().close_deferred(id);
        }
    }

    // =========================================================================
    // == Queries ==
    // =========================================================================

    /// Sightings accumulated (deferred) or factors added (committed) for `id`.
    /// Zero for unseen ids.
    pub fn observation_count(&self, id: LandmarkId) -> usize {
        if let Some(acc) = self.accumulators.get(&id) {
            return acc.len();
        }
        self.committed
            .get(&id)
            .map_or(0, |record| record.observed_from.len())
    }

    pub fn state(&self, id: LandmarkId) -> LandmarkState {
        if self.accumulators.contains_key(&id) {
            LandmarkState::Deferred
        } else if self.committed.contains_key(&id) {
            LandmarkState::Committed
        } else {
            LandmarkState::Unseen
        }
    }

    pub fn deferred_ids(&self) -> Vec<LandmarkId> {
        self.accumulators.keys().copied().collect()
    }

    pub fn accumulator(&self, id: LandmarkId) -> Option<&DeferredLandmarkAccumulator> {
        self.accumulators.get(&id)
    }

    /// Every pose-to-landmark observation edge of the committed landmarks.
    pub fn landmark_edges(&self) -> Vec<LandmarkEdge> {
        self.committed
            .iter()
            .flat_map(|(id, record)| {
                record.observed_from.iter().map(move |pose| LandmarkEdge {
                    pose: *pose,
                    landmark: *id,
                })
            })
            .collect()
    }

    pub fn stats(&self) -> LifecycleStats {
        LifecycleStats {
            deferred: self.accumulators.len(),
            committed: self.committed.len(),
            promoted: self.totals.promoted,
            rejected: self.totals.rejected,
            dropped: self.totals.dropped,
            pruned: self.totals.pruned,
        }
    }
}

/// The promotion quality gate, checked in order: geometry, cheirality,
/// existence of a solution, error bound.
fn gate(evaluation: &DeferredEvaluation, threshold: f64) -> std::result::Result<Point3<f64>, Rejection> {
    if evaluation.is_degenerate {
        return Err(Rejection::DegenerateGeometry);
    }
    if evaluation.is_behind_camera {
        return Err(Rejection::BehindCamera);
    }
    let error = evaluation.reprojection_error;
    let point = match evaluation.estimate {
        Some(point) if error.is_finite() && error > 0.0 => point,
        _ => return Err(Rejection::NoSolution),
    };
    if error > threshold {
        return Err(Rejection::ReprojectionTooHigh { error });
    }
    Ok(point)
}
