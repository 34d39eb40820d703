// kestrel_core/src/graph/mod.rs

//! The solved graph and the machinery that feeds it.
//!
//! `GraphStore` holds the current estimate of every node. The
//! `IncrementalGraphBuilder` buffers new factors and initial guesses and
//! pushes them through a `SolverAdapter` on `solve()`.

// --- Declare the implementation sub-modules ---
mod buffer;
mod builder;
mod factors;
mod store;

// --- Re-export the public structs for a clean API ---
pub use buffer::PendingUpdateBuffer;
pub use builder::{IncrementalGraphBuilder, RobotEdge, SolveSummary};
pub use factors::Factor;
pub use store::{GraphSnapshot, GraphStore, LandmarkNode, LandmarkRecord, PoseNode, PoseRecord};
