// kestrel_sim/src/cli.rs

use clap::Parser;
use std::path::PathBuf;

use crate::simulation::config::ScenarioConfig;

/// Kestrel: run an incremental landmark-SLAM session over a synthetic world.
///
/// Command-line values override whatever the scenario file and the
/// `KESTREL_` environment variables set.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// The path to the scenario TOML file to run.
    #[arg(short, long, default_value = "assets/scenarios/straight_corridor.toml")]
    pub scenario: PathBuf,

    /// Seed for the world generator and the sensor noise.
    #[arg(long)]
    pub seed: Option<u64>,

    /// Number of poses to simulate.
    #[arg(long)]
    pub steps: Option<usize>,

    /// Log filter, e.g. `debug` or `info,kestrel_core=debug`. Falls back to
    /// `RUST_LOG`, then `info`.
    #[arg(long)]
    pub log_level: Option<String>,

    /// Write the final graph snapshot to this TOML file.
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

impl Cli {
    pub fn apply_overrides(&self, config: &mut ScenarioConfig) {
        if let Some(seed) = self.seed {
            config.simulation.seed = Some(seed);
        }
        if let Some(steps) = self.steps {
            config.simulation.steps = steps;
        }
        if let Some(output) = &self.output {
            config.simulation.output = Some(output.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides_scenario_values() {
        let cli = Cli::parse_from(["kestrel_sim", "--seed", "7", "--steps", "12", "-o", "out.toml"]);
        let mut config = ScenarioConfig::default();
        cli.apply_overrides(&mut config);
        assert_eq!(config.simulation.seed, Some(7));
        assert_eq!(config.simulation.steps, 12);
        assert_eq!(config.simulation.output, Some(PathBuf::from("out.toml")));
    }

    #[test]
    fn test_cli_defaults_leave_scenario_alone() {
        let cli = Cli::parse_from(["kestrel_sim"]);
        let mut config = ScenarioConfig::default();
        cli.apply_overrides(&mut config);
        assert_eq!(config.simulation.steps, ScenarioConfig::default().simulation.steps);
        assert_eq!(cli.scenario, PathBuf::from("assets/scenarios/straight_corridor.toml"));
    }
}
