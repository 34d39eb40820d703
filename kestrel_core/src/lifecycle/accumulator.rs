// kestrel_core/src/lifecycle/accumulator.rs

use nalgebra::Point2;

use crate::types::PoseIndex;

/// One pixel sighting of a point landmark.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointObservation {
    pub pose: PoseIndex,
    pub pixel: Point2<f64>,
}

/// Observations of a point landmark that cannot be initialized yet.
///
/// Lives in the lifecycle manager's arena from the first sighting of an id
/// until the id is promoted or dropped. `committed` is raised by a successful
/// promotion; committed accumulators are swept from the arena at the end of
/// the promotion pass.
#[derive(Debug, Clone, PartialEq)]
pub struct DeferredLandmarkAccumulator {
    observations: Vec<PointObservation>,
    committed: bool,
}

impl DeferredLandmarkAccumulator {
    pub fn new(first: PointObservation) -> Self {
        Self {
            observations: vec![first],
            committed: false,
        }
    }

    pub fn push(&mut self, observation: PointObservation) {
        self.observations.push(observation);
    }

    pub fn observations(&self) -> &[PointObservation] {
        &self.observations
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    /// Pose index of the first sighting.
    pub fn first_pose(&self) -> Option<PoseIndex> {
        self.observations.first().map(|o| o.pose)
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    pub(crate) fn mark_committed(&mut self) {
        self.committed = true;
    }

    /// Forgets every sighting made from one of `poses`. Returns how many
    /// observations were removed.
    pub(crate) fn remove_poses(&mut self, poses: &[PoseIndex]) -> usize {
        let before = self.observations.len();
        self.observations.retain(|o| !poses.contains(&o.pose));
        before - self.observations.len()
    }
}
