// kestrel_sim/src/simulation/runner.rs

use anyhow::Context;
use kestrel_core::prelude::*;
use tracing::{debug, info, warn};

use crate::simulation::config::ScenarioConfig;
use crate::simulation::prng::SimulationRng;
use crate::simulation::world::SyntheticWorld;

/// Outcome of one simulated run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub steps: usize,
    /// Root-mean-square translation error of the estimated trajectory.
    pub trajectory_rmse: f64,
    pub landmarks: usize,
    pub stats: LifecycleStats,
    pub failed_solves: usize,
    pub snapshot: GraphSnapshot,
}

/// Drives one SLAM session through a synthetic world.
///
/// Per step: odometry, the frame's observations, solve, promote, prune. A
/// failed solve keeps its pending buffer and is retried on the next step.
pub fn run(config: &ScenarioConfig) -> anyhow::Result<RunReport> {
    let steps = config.simulation.steps;
    let mut rng = SimulationRng::from_optional_seed(config.simulation.seed);
    let world = SyntheticWorld::generate(&config.world, steps, &mut rng)?;

    let mut session = SlamSession::with_dense_smoother(config.slam.clone(), config.camera)
        .context("invalid SLAM configuration")?;
    session.initialize(Some(world.poses()[0]))?;
    info!(
        steps,
        landmarks = world.points().len(),
        fiducials = world.fiducials().len(),
        "starting run"
    );

    let mut failed_solves = 0;
    for index in 0..steps {
        let frame = world.frame(index, &config.sensors, &config.camera, &mut rng)?;
        if let Some(delta) = frame.odometry {
            session.add_odometry(delta)?;
        }
        session.observe_point_landmarks(&frame.pixels)?;
        for (id, relative) in &frame.fiducials {
            session.observe_pose_constrained_landmark(*id, *relative)?;
        }

        if !try_solve(&mut session, &mut failed_solves)? {
            continue;
        }
        let promotion = session.promote_with_config()?;
        let pruned = session.prune_with_config()?;
        debug!(
            step = index,
            observed = frame.pixels.len(),
            promoted = promotion.promoted.len(),
            rejected = promotion.rejected.len(),
            pruned = pruned.len(),
            "step done"
        );
    }
    // Landmarks promoted on the last step are still pending.
    try_solve(&mut session, &mut failed_solves)?;

    let trajectory_rmse = trajectory_rmse(&session, &world)?;
    session.log_summary();
    info!(trajectory_rmse, failed_solves, "run finished");

    Ok(RunReport {
        steps,
        trajectory_rmse,
        landmarks: session.store().num_landmarks(),
        stats: session.stats(),
        failed_solves,
        snapshot: session.snapshot(),
    })
}

/// Solves, treating `SolveFailed` as a recoverable miss. Returns whether the
/// solve succeeded.
fn try_solve(session: &mut SlamSession, failed_solves: &mut usize) -> anyhow::Result<bool> {
    match session.solve() {
        Ok(_) => Ok(true),
        Err(SlamError::SolveFailed { reason }) => {
            *failed_solves += 1;
            warn!(%reason, pending = session.builder().pending().len(), "solve failed, retrying next step");
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

fn trajectory_rmse(session: &SlamSession, world: &SyntheticWorld) -> anyhow::Result<f64> {
    let mut sum = 0.0;
    for (index, truth) in world.poses().iter().enumerate() {
        let estimate = session.get_pose(index as PoseIndex)?.estimate;
        sum += (estimate.translation.vector - truth.translation.vector).norm_squared();
    }
    Ok((sum / world.poses().len() as f64).sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::config::Trajectory;

    fn scenario(seed: u64, steps: usize) -> ScenarioConfig {
        let mut config = ScenarioConfig::default();
        config.simulation.seed = Some(seed);
        config.simulation.steps = steps;
        config.world.num_landmarks = 30;
        config
    }

    #[test]
    fn test_straight_run_tracks_ground_truth() {
        let report = run(&scenario(3, 10)).unwrap();
        assert_eq!(report.steps, 10);
        assert_eq!(report.snapshot.poses.len(), 10);
        assert!(report.trajectory_rmse < 0.25, "rmse {}", report.trajectory_rmse);
        assert!(report.stats.promoted > 0);
    }

    #[test]
    fn test_runs_are_deterministic_per_seed() {
        let a = run(&scenario(11, 6)).unwrap();
        let b = run(&scenario(11, 6)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_circle_run() {
        let mut config = scenario(4, 8);
        config.world.trajectory = Trajectory::Circle {
            radius: 8.0,
            step_angle_deg: 5.0,
        };
        let report = run(&config).unwrap();
        assert!(report.trajectory_rmse < 0.25, "rmse {}", report.trajectory_rmse);
    }

    #[test]
    fn test_invalid_slam_config_fails_the_run() {
        let mut config = scenario(1, 3);
        config.slam.landmarks.min_observations = 1;
        assert!(run(&config).is_err());
    }
}
