// kestrel_sim/src/simulation/prng.rs

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::info;

/// A newtype wrapper around `ChaCha8Rng`.
/// This is the central, deterministic pseudo-random number generator for the simulation.
pub struct SimulationRng(pub ChaCha8Rng);

impl SimulationRng {
    pub fn from_seed(seed: u64) -> Self {
        Self(ChaCha8Rng::seed_from_u64(seed))
    }

    /// Seeds from `seed`, or draws and logs a fresh seed so the run can be
    /// reproduced with `--seed`.
    pub fn from_optional_seed(seed: Option<u64>) -> Self {
        let seed = seed.unwrap_or_else(|| {
            let drawn = rand::random::<u64>();
            info!(seed = drawn, "no seed configured, drew one");
            drawn
        });
        Self::from_seed(seed)
    }
}
