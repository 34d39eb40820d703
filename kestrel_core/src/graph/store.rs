// kestrel_core/src/graph/store.rs

use nalgebra::{DMatrix, Isometry3};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

use crate::error::{Result, SlamError};
use crate::solver::SolverOutput;
use crate::types::{Key, LandmarkEstimate, LandmarkId, PoseIndex};

/// Estimated pose of the camera/robot at one time step.
#[derive(Debug, Clone, PartialEq)]
pub struct PoseNode {
    pub index: PoseIndex,
    pub estimate: Isometry3<f64>,
    /// 6x6 marginal covariance, tangent order `[t, r]`. Only present right
    /// after a covariance query; any solve clears it.
    pub covariance: Option<DMatrix<f64>>,
}

/// Estimated landmark, either a 3-D point or a rigid transform.
#[derive(Debug, Clone, PartialEq)]
pub struct LandmarkNode {
    pub id: LandmarkId,
    pub estimate: LandmarkEstimate,
    pub covariance: Option<DMatrix<f64>>,
    /// Pose index of the landmark's first observation. Drives pruning.
    pub owner: PoseIndex,
}

/// The authoritative mapping from key to current estimate.
///
/// Besides solved estimates, the store holds provisional guesses for nodes
/// created since the last solve; those are overwritten by the next
/// successful solve.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphStore {
    poses: BTreeMap<PoseIndex, PoseNode>,
    landmarks: BTreeMap<LandmarkId, LandmarkNode>,
    /// Ids whose deferred accumulator is still open.
    deferred: BTreeSet<LandmarkId>,
}

impl GraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    // --- Poses ---

    pub fn upsert_pose(&mut self, index: PoseIndex, estimate: Isometry3<f64>) {
        self.poses
            .entry(index)
            .and_modify(|node| node.estimate = estimate)
            .or_insert(PoseNode {
                index,
                estimate,
                covariance: None,
            });
    }

    pub fn get_pose(&self, index: PoseIndex) -> Result<&PoseNode> {
        self.poses
            .get(&index)
            .ok_or(SlamError::NotFound(Key::Pose(index)))
    }

    /// Removes a provisional pose whose initial guess was discarded before it
    /// ever reached the solver.
    pub(crate) fn rollback_pose(&mut self, index: PoseIndex) {
        self.poses.remove(&index);
    }

    pub fn poses(&self) -> impl Iterator<Item = &PoseNode> {
        self.poses.values()
    }

    pub fn num_poses(&self) -> usize {
        self.poses.len()
    }

    // --- Landmarks ---

    /// Inserts or overwrites a landmark estimate.
    ///
    /// `owner` is only recorded when the node is created; an existing node
    /// keeps the pose index of its first observation.
    pub fn upsert_landmark(
        &mut self,
        id: LandmarkId,
        estimate: LandmarkEstimate,
        owner: PoseIndex,
    ) -> Result<()> {
        if self.deferred.contains(&id) {
            return Err(SlamError::invalid_state(format!(
                "landmark {} is still under deferred accumulation",
                id
            )));
        }
        match self.landmarks.get_mut(&id) {
            Some(node) => {
                if !node.estimate.same_kind(&estimate) {
                    return Err(SlamError::invalid_state(format!(
                        "landmark {} is a {} landmark, cannot store a {} estimate",
                        id,
                        node.estimate.kind_str(),
                        estimate.kind_str()
                    )));
                }
                node.estimate = estimate;
            }
            None => {
                self.landmarks.insert(
                    id,
                    LandmarkNode {
                        id,
                        estimate,
                        covariance: None,
                        owner,
                    },
                );
            }
        }
        Ok(())
    }

    pub fn get_landmark(&self, id: LandmarkId) -> Result<&LandmarkNode> {
        self.landmarks
            .get(&id)
            .ok_or(SlamError::NotFound(Key::Landmark(id)))
    }

    pub fn prune_landmark(&mut self, id: LandmarkId) -> Result<LandmarkNode> {
        self.landmarks
            .remove(&id)
            .ok_or(SlamError::NotFound(Key::Landmark(id)))
    }

    /// Removes a provisional landmark whose initial guess was discarded
    /// before it ever reached the solver.
    pub(crate) fn rollback_landmark(&mut self, id: LandmarkId) {
        self.landmarks.remove(&id);
    }

    pub fn landmarks(&self) -> impl Iterator<Item = &LandmarkNode> {
        self.landmarks.values()
    }

    pub fn num_landmarks(&self) -> usize {
        self.landmarks.len()
    }

    /// Ids of every landmark first observed strictly before `cutoff`, ascending.
    pub fn landmarks_owned_before(&self, cutoff: PoseIndex) -> Vec<LandmarkId> {
        self.landmarks
            .values()
            .filter(|node| node.owner < cutoff)
            .map(|node| node.id)
            .collect()
    }

    pub fn contains(&self, key: Key) -> bool {
        match key {
            Key::Pose(index) => self.poses.contains_key(&index),
            Key::Landmark(id) => self.landmarks.contains_key(&id),
        }
    }

    // --- Deferred guard ---

    pub fn open_deferred(&mut self, id: LandmarkId) -> Result<()> {
        if self.landmarks.contains_key(&id) {
            return Err(SlamError::invalid_state(format!(
                "landmark {} is already committed",
                id
            )));
        }
        self.deferred.insert(id);
        Ok(())
    }

    pub fn close_deferred(&mut self, id: LandmarkId) {
        self.deferred.remove(&id);
    }

    pub fn is_deferred(&self, id: LandmarkId) -> bool {
        self.deferred.contains(&id)
    }

    // --- Covariances ---

    pub fn set_covariance(&mut self, key: Key, matrix: DMatrix<f64>) -> Result<()> {
        let expected = match key {
            Key::Pose(_) => 6,
            Key::Landmark(id) => self.get_landmark(id)?.estimate.dim(),
        };
        if matrix.nrows() != expected || matrix.ncols() != expected {
            return Err(SlamError::invalid_state(format!(
                "covariance for {} must be {}x{}, got {}x{}",
                key,
                expected,
                expected,
                matrix.nrows(),
                matrix.ncols()
            )));
        }
        match key {
            Key::Pose(index) => {
                self.poses
                    .get_mut(&index)
                    .ok_or(SlamError::NotFound(key))?
                    .covariance = Some(matrix);
            }
            Key::Landmark(id) => {
                self.landmarks
                    .get_mut(&id)
                    .ok_or(SlamError::NotFound(key))?
                    .covariance = Some(matrix);
            }
        }
        Ok(())
    }

    /// The cached covariance for `key`. `NotFound` when the key is absent or
    /// nothing has been cached since the last solve.
    pub fn get_covariance(&self, key: Key) -> Result<&DMatrix<f64>> {
        let cached = match key {
            Key::Pose(index) => self.get_pose(index)?.covariance.as_ref(),
            Key::Landmark(id) => self.get_landmark(id)?.covariance.as_ref(),
        };
        cached.ok_or(SlamError::NotFound(key))
    }

    pub fn invalidate_covariances(&mut self) {
        self.poses.values_mut().for_each(|n| n.covariance = None);
        self.landmarks.values_mut().for_each(|n| n.covariance = None);
    }

    // --- Solver results ---

    /// Writes a complete solver result. Everything is validated before the
    /// first write, so an `Err` leaves the store untouched.
    pub fn apply_solution(&mut self, output: &SolverOutput) -> Result<()> {
        for (id, estimate) in &output.landmarks {
            if self.deferred.contains(id) {
                return Err(SlamError::invalid_state(format!(
                    "solver returned landmark {} which is still deferred",
                    id
                )));
            }
            if let Some(node) = self.landmarks.get(id) {
                if !node.estimate.same_kind(estimate) {
                    return Err(SlamError::invalid_state(format!(
                        "solver changed the kind of landmark {}",
                        id
                    )));
                }
            }
        }

        for (index, estimate) in &output.poses {
            self.upsert_pose(*index, *estimate);
        }
        for (id, estimate) in &output.landmarks {
            match self.landmarks.get_mut(id) {
                Some(node) => node.estimate = *estimate,
                None => warn!(
                    landmark = *id,
                    "solver returned a landmark unknown to the store, ignoring it"
                ),
            }
        }
        self.invalidate_covariances();
        Ok(())
    }

    /// A serializable copy of every estimate in the store.
    pub fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            poses: self
                .poses
                .values()
                .map(|node| PoseRecord {
                    index: node.index,
                    translation: node.estimate.translation.vector.into(),
                    rotation_xyzw: node.estimate.rotation.coords.into(),
                })
                .collect(),
            landmarks: self
                .landmarks
                .values()
                .map(|node| {
                    let (translation, rotation_xyzw) = match &node.estimate {
                        LandmarkEstimate::Point(p) => (p.coords.into(), None),
                        LandmarkEstimate::Pose(iso) => (
                            iso.translation.vector.into(),
                            Some(iso.rotation.coords.into()),
                        ),
                    };
                    LandmarkRecord {
                        id: node.id,
                        owner: node.owner,
                        translation,
                        rotation_xyzw,
                    }
                })
                .collect(),
        }
    }
}

// =========================================================================
// == Snapshot ==
// =========================================================================

/// Plain-data view of the store. Persistence layers serialize this; the core
/// defines no file format of its own.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub poses: Vec<PoseRecord>,
    pub landmarks: Vec<LandmarkRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseRecord {
    pub index: PoseIndex,
    pub translation: [f64; 3],
    pub rotation_xyzw: [f64; 4],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LandmarkRecord {
    pub id: LandmarkId,
    pub owner: PoseIndex,
    pub translation: [f64; 3],
    /// Present for pose landmarks only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation_xyzw: Option<[f64; 4]>,
}
