// kestrel_sim/src/simulation/mod.rs

//! Synthetic-world simulation: scenario configuration, world generation and
//! the loop that drives a SLAM session through it.

pub mod config;
pub mod prng;
pub mod runner;
pub mod world;
