// kestrel_sim/src/prelude.rs

// Re-export the entire kestrel_core prelude so you can easily access
// pure types like `SlamSession`, `Key`, `SlamConfig`, etc.
pub use kestrel_core::prelude::*;

// Re-export common simulation-specific types for easy access.
pub use crate::cli::Cli;
pub use crate::simulation::config::{ScenarioConfig, Sensors, Simulation, Trajectory, World};
pub use crate::simulation::prng::SimulationRng;
pub use crate::simulation::runner::{run, RunReport};
pub use crate::simulation::world::{Frame, SyntheticWorld};
