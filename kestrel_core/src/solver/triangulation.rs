// kestrel_core/src/solver/triangulation.rs

//! Multi-view point triangulation with geometric validation.
//!
//! 1. Check that the viewing rays have enough parallax
//! 2. Triangulate with linear DLT over every view
//! 3. Refine by Gauss-Newton on the whitened reprojection error
//! 4. Report cheirality and the final error

use nalgebra::{Matrix3, Matrix4, Point3, SymmetricEigen, Vector2, Vector3};
use tracing::trace;

use crate::models::camera::MIN_DEPTH;
use crate::solver::{DeferredEvaluation, DeferredObservation};

const REFINE_ITERATIONS: usize = 10;
const HOMOGENEOUS_EPS: f64 = 1e-10;

/// Largest angle, in radians, between any two viewing rays.
pub fn max_parallax(observations: &[DeferredObservation]) -> f64 {
    let rays: Vec<Vector3<f64>> = observations
        .iter()
        .map(|o| o.calibration.bearing_world(&o.pose_estimate, &o.measured))
        .collect();

    let mut best = 0.0_f64;
    for (i, a) in rays.iter().enumerate() {
        for b in rays.iter().skip(i + 1) {
            let cos = a.dot(b).clamp(-1.0, 1.0);
            best = best.max(cos.acos());
        }
    }
    best
}

/// Linear triangulation over every observation (DLT).
///
/// Each view contributes the two rows `x * P[2] - P[0]` and `y * P[2] - P[1]`
/// of the homogeneous system `A X = 0`, where `P = [R_cw | t_cw]` and `(x, y)`
/// are normalized image coordinates. The solution is the eigenvector of
/// `A^T A` with the smallest eigenvalue.
pub fn triangulate_dlt(observations: &[DeferredObservation]) -> Option<Point3<f64>> {
    let mut ata = Matrix4::<f64>::zeros();

    for obs in observations {
        let xn = obs.calibration.normalize(&obs.measured);
        let pose_cw = obs.pose_estimate.inverse();
        let r = pose_cw.rotation.to_rotation_matrix();
        let t = pose_cw.translation.vector;

        let mut p = nalgebra::Matrix3x4::<f64>::zeros();
        p.fixed_view_mut::<3, 3>(0, 0).copy_from(r.matrix());
        p.set_column(3, &t);

        let row_x = p.row(2) * xn.x - p.row(0);
        let row_y = p.row(2) * xn.y - p.row(1);
        ata += row_x.transpose() * row_x + row_y.transpose() * row_y;
    }

    let eigen = SymmetricEigen::new(ata);
    let (min_idx, _) = eigen
        .eigenvalues
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))?;
    let x = eigen.eigenvectors.column(min_idx);

    if x[3].abs() < HOMOGENEOUS_EPS {
        return None;
    }
    let point = Point3::new(x[0] / x[3], x[1] / x[3], x[2] / x[3]);
    point.coords.iter().all(|c| c.is_finite()).then_some(point)
}

/// Whitened pixel residual of one observation, or `None` if the point is
/// behind that camera.
fn whitened_residual(obs: &DeferredObservation, point: &Point3<f64>) -> Option<Vector2<f64>> {
    let predicted = obs.calibration.project(&obs.pose_estimate, point)?;
    let r = predicted - obs.measured;
    Some(Vector2::new(r.x / obs.sigmas.x, r.y / obs.sigmas.y))
}

/// `0.5 * sum |r|^2` over the observations in front of their camera.
pub fn reprojection_error(observations: &[DeferredObservation], point: &Point3<f64>) -> f64 {
    0.5 * observations
        .iter()
        .filter_map(|o| whitened_residual(o, point))
        .map(|r| r.norm_squared())
        .sum::<f64>()
}

fn in_front_of_all(observations: &[DeferredObservation], point: &Point3<f64>) -> bool {
    observations
        .iter()
        .all(|o| o.pose_estimate.inverse_transform_point(point).z > MIN_DEPTH)
}

/// Gauss-Newton refinement of a point with fixed cameras.
fn refine(observations: &[DeferredObservation], initial: Point3<f64>) -> Point3<f64> {
    const EPS: f64 = 1e-6;
    let mut point = initial;
    let mut error = reprojection_error(observations, &point);

    for _ in 0..REFINE_ITERATIONS {
        let mut h = Matrix3::<f64>::zeros();
        let mut g = Vector3::<f64>::zeros();

        for obs in observations {
            let Some(r0) = whitened_residual(obs, &point) else {
                return point;
            };
            let mut jac = nalgebra::Matrix2x3::<f64>::zeros();
            for axis in 0..3 {
                let mut plus = point;
                let mut minus = point;
                plus[axis] += EPS;
                minus[axis] -= EPS;
                let (Some(rp), Some(rm)) =
                    (whitened_residual(obs, &plus), whitened_residual(obs, &minus))
                else {
                    return point;
                };
                jac.set_column(axis, &((rp - rm) / (2.0 * EPS)));
            }
            h += jac.transpose() * jac;
            g += jac.transpose() * r0;
        }

        let Some(step) = h.cholesky().map(|c| c.solve(&(-g))) else {
            break;
        };
        let candidate = point + step;
        let candidate_error = reprojection_error(observations, &candidate);
        if !in_front_of_all(observations, &candidate) || candidate_error >= error {
            break;
        }
        point = candidate;
        error = candidate_error;
        if step.norm() < 1e-10 {
            break;
        }
    }
    point
}

/// Full triangulation with the diagnostics used by the promotion gate.
pub fn evaluate(observations: &[DeferredObservation], min_parallax_rad: f64) -> DeferredEvaluation {
    let mut distinct_poses: Vec<_> = observations.iter().map(|o| o.pose).collect();
    distinct_poses.sort_unstable();
    distinct_poses.dedup();
    if distinct_poses.len() < 2 {
        return DeferredEvaluation::degenerate();
    }

    let parallax = max_parallax(observations);
    if parallax < min_parallax_rad {
        trace!(parallax, "rays are nearly parallel");
        return DeferredEvaluation::degenerate();
    }

    let Some(initial) = triangulate_dlt(observations) else {
        return DeferredEvaluation::degenerate();
    };

    if !in_front_of_all(observations, &initial) {
        return DeferredEvaluation {
            estimate: Some(initial),
            reprojection_error: reprojection_error(observations, &initial),
            is_degenerate: false,
            is_behind_camera: true,
        };
    }

    let point = refine(observations, initial);
    // Exact measurements give an error of 0.0, which would read as "no solution".
    let error = reprojection_error(observations, &point).max(f64::MIN_POSITIVE);
    DeferredEvaluation {
        estimate: Some(point),
        reprojection_error: error,
        is_degenerate: false,
        is_behind_camera: false,
    }
}
