// kestrel_core/src/models/camera.rs

use nalgebra::{Isometry3, Matrix3, Point2, Point3, Vector3};
use serde::{Deserialize, Serialize};

/// Minimum camera-frame depth for a point to count as "in front of" a camera.
pub const MIN_DEPTH: f64 = 1e-6;

/// Pinhole intrinsics `fx fy skew cx cy`, assumed static for a whole session.
///
/// The graph core never inspects these values; it only carries the
/// calibration inside projection factors and deferred observations so the
/// solver can interpret them.
///
/// Camera frame convention: +Z forward (optical axis), +X right, +Y down.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PinholeCalibration {
    pub fx: f64,
    pub fy: f64,
    #[serde(default)]
    pub skew: f64,
    pub cx: f64,
    pub cy: f64,
}

impl Default for PinholeCalibration {
    fn default() -> Self {
        // 640x480 sensor with a ~65 degree horizontal field of view.
        Self {
            fx: 500.0,
            fy: 500.0,
            skew: 0.0,
            cx: 320.0,
            cy: 240.0,
        }
    }
}

impl PinholeCalibration {
    pub fn new(fx: f64, fy: f64, skew: f64, cx: f64, cy: f64) -> Self {
        Self {
            fx,
            fy,
            skew,
            cx,
            cy,
        }
    }

    /// The 3x3 intrinsic matrix `K`.
    pub fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.fx, self.skew, self.cx, //
            0.0, self.fy, self.cy, //
            0.0, 0.0, 1.0,
        )
    }

    /// Projects a point already expressed in the camera frame.
    /// Returns `None` for points on or behind the image plane.
    pub fn project_camera_point(&self, p_cam: &Point3<f64>) -> Option<Point2<f64>> {
        if p_cam.z <= MIN_DEPTH {
            return None;
        }
        let x = p_cam.x / p_cam.z;
        let y = p_cam.y / p_cam.z;
        Some(Point2::new(
            self.fx * x + self.skew * y + self.cx,
            self.fy * y + self.cy,
        ))
    }

    /// Projects a world point into a camera whose pose (camera-to-world) is `pose`.
    pub fn project(&self, pose: &Isometry3<f64>, p_world: &Point3<f64>) -> Option<Point2<f64>> {
        let p_cam = pose.inverse_transform_point(p_world);
        self.project_camera_point(&p_cam)
    }

    /// Normalized image coordinates `[x/z, y/z, 1]` of a pixel.
    pub fn normalize(&self, pixel: &Point2<f64>) -> Vector3<f64> {
        let y = (pixel.y - self.cy) / self.fy;
        let x = (pixel.x - self.cx - self.skew * y) / self.fx;
        Vector3::new(x, y, 1.0)
    }

    /// Unit viewing ray through `pixel`, in the world frame.
    pub fn bearing_world(&self, pose: &Isometry3<f64>, pixel: &Point2<f64>) -> Vector3<f64> {
        (pose.rotation * self.normalize(pixel)).normalize()
    }
}
