// kestrel_sim/src/main.rs

use anyhow::{ensure, Context};
use clap::Parser;
use kestrel_sim::prelude::*;
use std::fs;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // `--log-level` wins over RUST_LOG; `info` when neither is set.
    let filter = match &cli.log_level {
        Some(level) => EnvFilter::try_new(level).context("invalid --log-level filter")?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // --- 1. Load Configuration ---
    ensure!(
        cli.scenario.exists(),
        "scenario file {} not found",
        cli.scenario.display()
    );
    let mut config = ScenarioConfig::load(&cli.scenario)
        .with_context(|| format!("failed to load scenario {}", cli.scenario.display()))?;
    cli.apply_overrides(&mut config);
    info!("Loaded scenario from '{}'", cli.scenario.display());

    // --- 2. Run ---
    let report = run(&config)?;
    println!(
        "{} poses, {} landmarks, trajectory RMSE {:.4} m ({} promoted, {} rejected, {} pruned, {} failed solves)",
        report.steps,
        report.landmarks,
        report.trajectory_rmse,
        report.stats.promoted,
        report.stats.rejected,
        report.stats.pruned,
        report.failed_solves
    );

    // --- 3. Persist ---
    if let Some(path) = &config.simulation.output {
        let text = toml::to_string_pretty(&report.snapshot).context("failed to serialize snapshot")?;
        fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))?;
        info!("Wrote snapshot to '{}'", path.display());
    }
    Ok(())
}
