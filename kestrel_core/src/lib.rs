// kestrel_core/src/lib.rs

// This file defines the public modules of the library.
pub mod config;
pub mod error;
pub mod graph;
pub mod lifecycle;
pub mod models;
pub mod prelude;
pub mod session;
pub mod solver;
pub mod types;
