// kestrel_core/src/solver/manifold.rs

//! Tangent-space helpers for rigid transforms.
//!
//! Pose increments are 6-vectors `[tx, ty, tz, rx, ry, rz]` applied on the
//! right: `x ⊕ δ = x * Isometry3::new(t, r)`. `local` is the exact inverse
//! of `retract`.

use nalgebra::{DVectorView, Isometry3, Point3, UnitQuaternion, Vector3, Vector6};

use crate::types::Variable;

pub fn retract_pose(pose: &Isometry3<f64>, delta: &Vector6<f64>) -> Isometry3<f64> {
    let increment = Isometry3::new(
        Vector3::new(delta[0], delta[1], delta[2]),
        Vector3::new(delta[3], delta[4], delta[5]),
    );
    pose * increment
}

/// Tangent vector taking `a` to `b`, i.e. `retract_pose(a, local_pose(a, b)) == b`.
pub fn local_pose(a: &Isometry3<f64>, b: &Isometry3<f64>) -> Vector6<f64> {
    let d = a.inverse() * b;
    let t = d.translation.vector;
    let r = rotation_log(&d.rotation);
    Vector6::new(t.x, t.y, t.z, r.x, r.y, r.z)
}

/// Rotation vector of a unit quaternion. Uses `atan2` so small angles keep
/// full precision, which the numerical Jacobians rely on.
fn rotation_log(q: &UnitQuaternion<f64>) -> Vector3<f64> {
    let (w, v) = if q.w < 0.0 {
        (-q.w, -q.imag())
    } else {
        (q.w, q.imag())
    };
    let n = v.norm();
    if n < 1e-12 {
        return v * 2.0;
    }
    v * (2.0 * n.atan2(w) / n)
}

/// Applies a tangent increment to any graph variable. `delta` must have the
/// variable's dimension.
pub fn retract(value: &Variable, delta: DVectorView<f64>) -> Variable {
    match value {
        Variable::Pose(pose) => {
            let d = Vector6::from_iterator(delta.iter().copied());
            Variable::Pose(retract_pose(pose, &d))
        }
        Variable::Point(p) => Variable::Point(Point3::new(
            p.x + delta[0],
            p.y + delta[1],
            p.z + delta[2],
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use nalgebra::DVector;

    #[test]
    fn test_local_inverts_retract() {
        let pose = Isometry3::from_parts(
            Vector3::new(1.0, -2.0, 0.5).into(),
            UnitQuaternion::from_euler_angles(0.1, -0.4, 1.2),
        );
        let delta = Vector6::new(0.3, -0.1, 0.2, 0.05, 0.4, -0.2);
        let moved = retract_pose(&pose, &delta);
        let recovered = local_pose(&pose, &moved);
        for i in 0..6 {
            assert_abs_diff_eq!(recovered[i], delta[i], epsilon = 1e-12);
        }
    }

    #[test]
    fn test_local_of_identical_poses_is_zero() {
        let pose = Isometry3::translation(4.0, 5.0, 6.0);
        assert_abs_diff_eq!(local_pose(&pose, &pose).norm(), 0.0, epsilon = 1e-15);
    }

    #[test]
    fn test_retract_point_is_addition() {
        let delta = DVector::from_vec(vec![1.0, 2.0, 3.0]);
        let moved = retract(&Variable::Point(Point3::new(1.0, 1.0, 1.0)), delta.rows(0, 3));
        assert_eq!(moved, Variable::Point(Point3::new(2.0, 3.0, 4.0)));
    }
}
