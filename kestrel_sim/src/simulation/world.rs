// kestrel_sim/src/simulation/world.rs

use anyhow::{ensure, Context};
use kestrel_core::prelude::{LandmarkId, PinholeCalibration};
use nalgebra::{Isometry3, Point2, Point3, Translation3, UnitQuaternion, Vector3};
use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::simulation::config::{Sensors, Trajectory, World};
use crate::simulation::prng::SimulationRng;

/// Fiducial ids start here so they never collide with point landmark ids.
pub const FIDUCIAL_ID_BASE: LandmarkId = 1_000_000;

/// Everything the sensors report at one pose.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub index: usize,
    /// Noisy motion from the previous pose. `None` for the first frame.
    pub odometry: Option<Isometry3<f64>>,
    pub pixels: Vec<(LandmarkId, Point2<f64>)>,
    pub fiducials: Vec<(LandmarkId, Isometry3<f64>)>,
}

/// Ground truth of one run: the camera trajectory, point landmarks
/// (id = index) and rigid fiducials (id = `FIDUCIAL_ID_BASE + index`).
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticWorld {
    poses: Vec<Isometry3<f64>>,
    points: Vec<Point3<f64>>,
    fiducials: Vec<Isometry3<f64>>,
}

impl SyntheticWorld {
    pub fn generate(world: &World, steps: usize, rng: &mut SimulationRng) -> anyhow::Result<Self> {
        ensure!(steps > 0, "a run needs at least one pose");
        ensure!(
            world.max_depth > world.min_depth && world.min_depth > 0.0,
            "world depth band [{}, {}] is empty",
            world.min_depth,
            world.max_depth
        );

        let start = world.start.to_isometry();
        let rng = &mut rng.0;

        let (poses, points, fiducials): (Vec<_>, Vec<_>, Vec<_>) = match world.trajectory {
            Trajectory::Straight { step_length } => {
                ensure!(step_length > 0.0, "step_length must be positive");
                let length = step_length * (steps - 1) as f64;
                let poses = (0..steps)
                    .map(|k| start * Isometry3::translation(step_length * k as f64, 0.0, 0.0))
                    .collect();
                let points = (0..world.num_landmarks)
                    .map(|_| {
                        start
                            * Point3::new(
                                rng.gen_range(-2.0..length + 2.0),
                                rng.gen_range(-2.0..2.0),
                                rng.gen_range(world.min_depth..world.max_depth),
                            )
                    })
                    .collect();
                let fiducials = (0..world.num_fiducials)
                    .map(|_| start * Isometry3::translation(rng.gen_range(0.0..=length), 0.0, 3.0))
                    .collect();
                (poses, points, fiducials)
            }
            Trajectory::Circle {
                radius,
                step_angle_deg,
            } => {
                ensure!(radius > 0.0, "circle radius must be positive");
                let step = step_angle_deg.to_radians();
                let poses = (0..steps)
                    .map(|k| {
                        let theta = step * k as f64;
                        // Camera on the circle, optical axis through the center.
                        let position = Translation3::new(radius * theta.sin(), 0.0, -radius * theta.cos());
                        let rotation = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), -theta);
                        start * Isometry3::from_parts(position, rotation)
                    })
                    .collect();
                let half = radius / 2.0;
                let points = (0..world.num_landmarks)
                    .map(|_| {
                        start
                            * Point3::new(
                                rng.gen_range(-half..half),
                                rng.gen_range(-1.0..1.0),
                                rng.gen_range(-half..half),
                            )
                    })
                    .collect();
                let fiducials = (0..world.num_fiducials)
                    .map(|_| {
                        start
                            * Isometry3::translation(
                                rng.gen_range(-half..half),
                                0.0,
                                rng.gen_range(-half..half),
                            )
                    })
                    .collect();
                (poses, points, fiducials)
            }
        };

        Ok(Self {
            poses,
            points,
            fiducials,
        })
    }

    pub fn poses(&self) -> &[Isometry3<f64>] {
        &self.poses
    }

    pub fn points(&self) -> &[Point3<f64>] {
        &self.points
    }

    pub fn fiducials(&self) -> &[Isometry3<f64>] {
        &self.fiducials
    }

    /// Simulates the sensor readings at pose `index`.
    pub fn frame(
        &self,
        index: usize,
        sensors: &Sensors,
        calibration: &PinholeCalibration,
        rng: &mut SimulationRng,
    ) -> anyhow::Result<Frame> {
        let pose = self
            .poses
            .get(index)
            .with_context(|| format!("pose {} is past the end of the trajectory", index))?;
        let rng = &mut rng.0;

        let odometry = match index {
            0 => None,
            _ => {
                let truth = self.poses[index - 1].inverse() * pose;
                let t = gaussian_vector(rng, sensors.odometry_translation_sigma)?;
                let r = gaussian_vector(rng, sensors.odometry_rotation_sigma)?;
                Some(truth * Isometry3::new(t, r))
            }
        };

        let pixel_noise = Normal::new(0.0, sensors.pixel_sigma).context("invalid pixel_sigma")?;
        let mut pixels = Vec::new();
        for (id, point) in self.points.iter().enumerate() {
            let p_cam = pose.inverse_transform_point(point);
            if p_cam.coords.norm() > sensors.max_range {
                continue;
            }
            let Some(pixel) = calibration.project_camera_point(&p_cam) else {
                continue;
            };
            let noisy = Point2::new(
                pixel.x + pixel_noise.sample(rng),
                pixel.y + pixel_noise.sample(rng),
            );
            let inside = (0.0..sensors.image_width).contains(&noisy.x)
                && (0.0..sensors.image_height).contains(&noisy.y);
            if inside {
                pixels.push((id as LandmarkId, noisy));
            }
        }

        let mut fiducials = Vec::new();
        for (i, fiducial) in self.fiducials.iter().enumerate() {
            let relative = pose.inverse() * fiducial;
            let offset = relative.translation.vector;
            if offset.z <= 0.0 || offset.norm() > sensors.fiducial_range {
                continue;
            }
            let t = gaussian_vector(rng, sensors.fiducial_sigma)?;
            let r = gaussian_vector(rng, sensors.fiducial_sigma)?;
            fiducials.push((FIDUCIAL_ID_BASE + i as LandmarkId, relative * Isometry3::new(t, r)));
        }

        Ok(Frame {
            index,
            odometry,
            pixels,
            fiducials,
        })
    }
}

fn gaussian_vector<R: Rng>(rng: &mut R, sigma: f64) -> anyhow::Result<Vector3<f64>> {
    let normal = Normal::new(0.0, sigma).context("noise sigma must be finite and non-negative")?;
    Ok(Vector3::new(
        normal.sample(rng),
        normal.sample(rng),
        normal.sample(rng),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn world(trajectory: Trajectory) -> World {
        World {
            trajectory,
            ..World::default()
        }
    }

    #[test]
    fn test_same_seed_same_world() {
        let config = world(Trajectory::default());
        let a = SyntheticWorld::generate(&config, 10, &mut SimulationRng::from_seed(5)).unwrap();
        let b = SyntheticWorld::generate(&config, 10, &mut SimulationRng::from_seed(5)).unwrap();
        let c = SyntheticWorld::generate(&config, 10, &mut SimulationRng::from_seed(6)).unwrap();
        assert_eq!(a, b);
        assert_ne!(a.points(), c.points());
    }

    #[test]
    fn test_straight_trajectory_spacing() {
        let config = world(Trajectory::Straight { step_length: 0.25 });
        let w = SyntheticWorld::generate(&config, 5, &mut SimulationRng::from_seed(1)).unwrap();
        assert_eq!(w.poses().len(), 5);
        assert_abs_diff_eq!(w.poses()[4].translation.vector.x, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_circle_cameras_look_at_center() {
        let config = world(Trajectory::Circle {
            radius: 8.0,
            step_angle_deg: 10.0,
        });
        let w = SyntheticWorld::generate(&config, 6, &mut SimulationRng::from_seed(2)).unwrap();
        for pose in w.poses() {
            let center = pose.inverse_transform_point(&Point3::origin());
            assert_abs_diff_eq!(center.x, 0.0, epsilon = 1e-9);
            assert_abs_diff_eq!(center.z, 8.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_noiseless_frame_matches_ground_truth() {
        let config = world(Trajectory::default());
        let mut rng = SimulationRng::from_seed(9);
        let w = SyntheticWorld::generate(&config, 4, &mut rng).unwrap();
        let sensors = Sensors {
            odometry_translation_sigma: 0.0,
            odometry_rotation_sigma: 0.0,
            pixel_sigma: 0.0,
            fiducial_sigma: 0.0,
            ..Sensors::default()
        };
        let calibration = PinholeCalibration::default();

        let first = w.frame(0, &sensors, &calibration, &mut rng).unwrap();
        assert!(first.odometry.is_none());

        let frame = w.frame(2, &sensors, &calibration, &mut rng).unwrap();
        let delta = frame.odometry.unwrap();
        assert_abs_diff_eq!(delta.translation.vector.x, 0.5, epsilon = 1e-12);
        assert!(!frame.pixels.is_empty());
        for (id, pixel) in &frame.pixels {
            let expected = calibration
                .project(&w.poses()[2], &w.points()[*id as usize])
                .unwrap();
            assert_abs_diff_eq!(pixel.coords, expected.coords, epsilon = 1e-9);
        }
        assert!(w.frame(4, &sensors, &calibration, &mut rng).is_err());
    }

    #[test]
    fn test_empty_depth_band_is_rejected() {
        let config = World {
            min_depth: 5.0,
            max_depth: 5.0,
            ..World::default()
        };
        assert!(SyntheticWorld::generate(&config, 3, &mut SimulationRng::from_seed(0)).is_err());
    }
}
