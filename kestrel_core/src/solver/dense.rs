// kestrel_core/src/solver/dense.rs

use nalgebra::{DMatrix, DVector, Isometry3, Point3, Vector2};
use std::collections::BTreeMap;
use tracing::{debug, trace};

use crate::config::{SlamConfig, SolverConfig};
use crate::error::{Result, SlamError};
use crate::graph::Factor;
use crate::models::camera::MIN_DEPTH;
use crate::solver::manifold::{local_pose, retract};
use crate::solver::triangulation;
use crate::solver::{DeferredEvaluation, DeferredObservation, SolverAdapter, SolverOutput};
use crate::types::{Key, LandmarkEstimate, LandmarkId, Variable};

const JACOBIAN_EPS: f64 = 1e-6;
const STEP_TOLERANCE: f64 = 1e-12;

/// A reference `SolverAdapter`: keeps the whole factor graph and re-solves it
/// with dense Levenberg-Marquardt on every update.
///
/// Exact but O(n^3) in the number of variables, so it suits short sessions
/// or sessions kept small by landmark pruning.
#[derive(Debug, Clone)]
pub struct DenseSmoother {
    config: SolverConfig,
    /// Minimum ray parallax, in radians, for a triangulation to be accepted.
    min_parallax: f64,
    factors: Vec<Factor>,
    values: BTreeMap<Key, Variable>,
}

/// Summary of one Levenberg-Marquardt run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptimizationReport {
    pub iterations: usize,
    pub initial_error: f64,
    pub final_error: f64,
}

/// Column offset and dimension of every variable in the linear system.
struct Ordering {
    slots: BTreeMap<Key, (usize, usize)>,
    dim: usize,
}

impl Ordering {
    fn new(values: &BTreeMap<Key, Variable>) -> Self {
        let mut slots = BTreeMap::new();
        let mut dim = 0;
        for (key, value) in values {
            slots.insert(*key, (dim, value.dim()));
            dim += value.dim();
        }
        Self { slots, dim }
    }
}

impl DenseSmoother {
    pub fn new(config: SolverConfig, min_parallax_deg: f64) -> Self {
        Self {
            config,
            min_parallax: min_parallax_deg.to_radians(),
            factors: Vec::new(),
            values: BTreeMap::new(),
        }
    }

    pub fn from_config(config: &SlamConfig) -> Self {
        Self::new(config.solver.clone(), config.landmarks.min_parallax_deg)
    }

    pub fn num_factors(&self) -> usize {
        self.factors.len()
    }

    pub fn num_variables(&self) -> usize {
        self.values.len()
    }

    /// Total error `0.5 * sum |r|^2` of the current graph.
    pub fn total_error(&self) -> Result<f64> {
        total_error(&self.factors, &self.values)
    }

    fn output(&self) -> SolverOutput {
        let mut output = SolverOutput::default();
        for (key, value) in &self.values {
            match (key, value) {
                (Key::Pose(index), Variable::Pose(pose)) => {
                    output.poses.insert(*index, *pose);
                }
                (Key::Landmark(id), Variable::Point(p)) => {
                    output.landmarks.insert(*id, LandmarkEstimate::Point(*p));
                }
                (Key::Landmark(id), Variable::Pose(pose)) => {
                    output.landmarks.insert(*id, LandmarkEstimate::Pose(*pose));
                }
                // Rejected on insertion, see `update`.
                (Key::Pose(_), Variable::Point(_)) => {}
            }
        }
        output
    }

    /// Runs Levenberg-Marquardt on `values` in place.
    fn optimize(
        &self,
        factors: &[Factor],
        values: &mut BTreeMap<Key, Variable>,
    ) -> Result<OptimizationReport> {
        let ordering = Ordering::new(values);
        let initial_error = total_error(factors, values)?;
        let mut error = initial_error;
        let mut lambda = self.config.initial_lambda;

        if error <= self.config.absolute_tolerance {
            return Ok(OptimizationReport {
                iterations: 0,
                initial_error,
                final_error: error,
            });
        }

        for iteration in 1..=self.config.max_iterations {
            let (h, g) = linearize(factors, values, &ordering)?;

            // Inner loop: raise the damping until a step reduces the error.
            loop {
                let mut damped = h.clone();
                for i in 0..ordering.dim {
                    damped[(i, i)] += lambda * (1.0 + h[(i, i)]);
                }

                let Some(cholesky) = damped.cholesky() else {
                    lambda *= self.config.lambda_up;
                    if lambda > self.config.max_lambda {
                        return Err(SlamError::solve_failed("singular linear system"));
                    }
                    continue;
                };
                let delta = cholesky.solve(&(-&g));

                if delta.norm() < STEP_TOLERANCE {
                    return Ok(OptimizationReport {
                        iterations: iteration,
                        initial_error,
                        final_error: error,
                    });
                }

                let candidate = apply_step(values, &delta, &ordering);
                let candidate_error = total_error(factors, &candidate).unwrap_or(f64::INFINITY);

                if candidate_error < error {
                    let improvement = (error - candidate_error) / error;
                    *values = candidate;
                    error = candidate_error;
                    lambda = (lambda * self.config.lambda_down).max(1e-15);
                    trace!(iteration, error, lambda, "accepted step");

                    if improvement < self.config.relative_tolerance
                        || error <= self.config.absolute_tolerance
                    {
                        return Ok(OptimizationReport {
                            iterations: iteration,
                            initial_error,
                            final_error: error,
                        });
                    }
                    break;
                }

                lambda *= self.config.lambda_up;
                if lambda > self.config.max_lambda {
                    // No direction improves the error: a local minimum.
                    return Ok(OptimizationReport {
                        iterations: iteration,
                        initial_error,
                        final_error: error,
                    });
                }
            }
        }

        Err(SlamError::solve_failed(format!(
            "no convergence after {} iterations (error {:.3e})",
            self.config.max_iterations, error
        )))
    }
}

impl SolverAdapter for DenseSmoother {
    fn update(
        &mut self,
        factors: &[Factor],
        initial_values: &BTreeMap<Key, Variable>,
    ) -> Result<SolverOutput> {
        // Work on a copy so a failure leaves the graph untouched.
        let mut values = self.values.clone();
        for (key, value) in initial_values {
            if matches!((key, value), (Key::Pose(_), Variable::Point(_))) {
                return Err(SlamError::invalid_state(format!(
                    "pose {} cannot take a point value",
                    key
                )));
            }
            if values.insert(*key, *value).is_some() {
                return Err(SlamError::invalid_state(format!(
                    "{} already has a value in the solver",
                    key
                )));
            }
        }
        for factor in factors {
            if let Some(missing) = factor.keys().into_iter().find(|k| !values.contains_key(k)) {
                return Err(SlamError::invalid_state(format!(
                    "factor references unknown key {}",
                    missing
                )));
            }
        }

        let mut all_factors = self.factors.clone();
        all_factors.extend_from_slice(factors);

        let report = self.optimize(&all_factors, &mut values)?;
        debug!(
            iterations = report.iterations,
            initial_error = report.initial_error,
            final_error = report.final_error,
            variables = values.len(),
            factors = all_factors.len(),
            "dense smoother update"
        );

        self.factors = all_factors;
        self.values = values;
        Ok(self.output())
    }

    fn marginal_covariance(&self, key: Key) -> Result<DMatrix<f64>> {
        let mut blocks = self.marginal_covariances(&[key])?;
        blocks.remove(&key).ok_or(SlamError::NotFound(key))
    }

    /// One linearization and one inversion of the information matrix, shared
    /// by every requested key.
    fn marginal_covariances(&self, keys: &[Key]) -> Result<BTreeMap<Key, DMatrix<f64>>> {
        if let Some(missing) = keys.iter().find(|key| !self.values.contains_key(*key)) {
            return Err(SlamError::NotFound(*missing));
        }
        if keys.is_empty() {
            return Ok(BTreeMap::new());
        }
        let ordering = Ordering::new(&self.values);
        let (h, _) = linearize(&self.factors, &self.values, &ordering)?;
        let cholesky = h.cholesky().ok_or_else(|| {
            SlamError::solve_failed("information matrix is not positive definite")
        })?;
        let covariance = cholesky.inverse();

        Ok(keys
            .iter()
            .map(|key| {
                let (offset, dim) = ordering.slots[key];
                let block = covariance.view((offset, offset), (dim, dim)).into_owned();
                // Symmetrize away round-off.
                (*key, (&block + block.transpose()) * 0.5)
            })
            .collect())
    }

    fn evaluate_deferred_landmark(&self, observations: &[DeferredObservation]) -> DeferredEvaluation {
        triangulation::evaluate(observations, self.min_parallax)
    }

    fn remove_landmark(&mut self, id: LandmarkId) -> Result<()> {
        let key = Key::Landmark(id);
        if self.values.remove(&key).is_none() {
            return Err(SlamError::NotFound(key));
        }
        self.factors.retain(|f| !f.involves(key));
        Ok(())
    }
}

// =========================================================================
// == Factor Evaluation ==
// =========================================================================

fn pose_of(values: &BTreeMap<Key, Variable>, key: Key) -> Result<Isometry3<f64>> {
    match values.get(&key) {
        Some(Variable::Pose(pose)) => Ok(*pose),
        Some(Variable::Point(_)) => Err(SlamError::invalid_state(format!(
            "{} is a point, expected a pose",
            key
        ))),
        None => Err(SlamError::NotFound(key)),
    }
}

fn point_of(values: &BTreeMap<Key, Variable>, key: Key) -> Result<Point3<f64>> {
    match values.get(&key) {
        Some(Variable::Point(p)) => Ok(*p),
        Some(Variable::Pose(_)) => Err(SlamError::invalid_state(format!(
            "{} is a pose, expected a point",
            key
        ))),
        None => Err(SlamError::NotFound(key)),
    }
}

/// Whitened residual of one factor.
fn residual(factor: &Factor, values: &BTreeMap<Key, Variable>) -> Result<DVector<f64>> {
    match factor {
        Factor::PosePrior { pose, prior, sigmas } => {
            let x = pose_of(values, Key::Pose(*pose))?;
            let e = local_pose(prior, &x).component_div(sigmas);
            Ok(DVector::from_column_slice(e.as_slice()))
        }
        Factor::Between {
            from,
            to,
            measured,
            sigmas,
        } => {
            let a = pose_of(values, *from)?;
            let b = pose_of(values, *to)?;
            let predicted = a.inverse() * b;
            let e = local_pose(measured, &predicted).component_div(sigmas);
            Ok(DVector::from_column_slice(e.as_slice()))
        }
        Factor::Projection {
            pose,
            landmark,
            measured,
            sigmas,
            calibration,
        } => {
            let x = pose_of(values, Key::Pose(*pose))?;
            let p = point_of(values, Key::Landmark(*landmark))?;
            let mut p_cam = x.inverse_transform_point(&p);
            // Keep the residual finite for points drifting behind the camera.
            p_cam.z = p_cam.z.max(2.0 * MIN_DEPTH);
            let Some(predicted) = calibration.project_camera_point(&p_cam) else {
                return Err(SlamError::solve_failed("projection at zero depth"));
            };
            let e = Vector2::new(
                (predicted.x - measured.x) / sigmas.x,
                (predicted.y - measured.y) / sigmas.y,
            );
            Ok(DVector::from_column_slice(e.as_slice()))
        }
    }
}

fn total_error(factors: &[Factor], values: &BTreeMap<Key, Variable>) -> Result<f64> {
    let mut sum = 0.0;
    for factor in factors {
        sum += residual(factor, values)?.norm_squared();
    }
    let error = 0.5 * sum;
    if !error.is_finite() {
        return Err(SlamError::solve_failed("non-finite error"));
    }
    Ok(error)
}

/// Gauss-Newton approximation `H = J^T J`, `g = J^T r` with numerical
/// (central difference) Jacobians per factor and variable.
fn linearize(
    factors: &[Factor],
    values: &BTreeMap<Key, Variable>,
    ordering: &Ordering,
) -> Result<(DMatrix<f64>, DVector<f64>)> {
    let mut h = DMatrix::<f64>::zeros(ordering.dim, ordering.dim);
    let mut g = DVector::<f64>::zeros(ordering.dim);
    let mut scratch = values.clone();

    for factor in factors {
        let r0 = residual(factor, values)?;
        let keys = factor.keys();

        let mut blocks = Vec::with_capacity(keys.len());
        for key in &keys {
            let (offset, dim) = ordering.slots[key];
            let base = values[key];
            let mut jac = DMatrix::<f64>::zeros(r0.len(), dim);
            for axis in 0..dim {
                let mut step = DVector::<f64>::zeros(dim);
                step[axis] = JACOBIAN_EPS;
                scratch.insert(*key, retract(&base, step.rows(0, dim)));
                let r_plus = residual(factor, &scratch)?;
                step[axis] = -JACOBIAN_EPS;
                scratch.insert(*key, retract(&base, step.rows(0, dim)));
                let r_minus = residual(factor, &scratch)?;
                jac.set_column(axis, &((r_plus - r_minus) / (2.0 * JACOBIAN_EPS)));
            }
            scratch.insert(*key, base);
            blocks.push((offset, dim, jac));
        }

        for (offset_a, dim_a, jac_a) in &blocks {
            let mut g_block = g.rows_mut(*offset_a, *dim_a);
            g_block += jac_a.transpose() * &r0;
            for (offset_b, dim_b, jac_b) in &blocks {
                let mut h_block = h.view_mut((*offset_a, *offset_b), (*dim_a, *dim_b));
                h_block += jac_a.transpose() * jac_b;
            }
        }
    }

    if h.iter().chain(g.iter()).any(|v| !v.is_finite()) {
        return Err(SlamError::solve_failed("non-finite linearization"));
    }
    Ok((h, g))
}

fn apply_step(
    values: &BTreeMap<Key, Variable>,
    delta: &DVector<f64>,
    ordering: &Ordering,
) -> BTreeMap<Key, Variable> {
    values
        .iter()
        .map(|(key, value)| {
            let (offset, dim) = ordering.slots[key];
            (*key, retract(value, delta.rows(offset, dim)))
        })
        .collect()
}
