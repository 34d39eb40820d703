// kestrel_core/src/prelude.rs

// --- Core Abstractions (The main contracts of the library) ---
pub use crate::solver::{DeferredEvaluation, DeferredObservation, SolverAdapter, SolverOutput};
pub use crate::types::{Key, LandmarkEstimate, LandmarkId, PoseIndex, Variable};

// --- Errors and Configuration ---
pub use crate::config::{LandmarkConfig, NoiseConfig, RetentionPolicy, SlamConfig, SolverConfig};
pub use crate::error::{Result, SlamError};

// --- Core Data Structures (The "nouns" of the library) ---
pub use crate::graph::{
    Factor, GraphSnapshot, GraphStore, IncrementalGraphBuilder, LandmarkNode, PendingUpdateBuffer,
    PoseNode, SolveSummary,
};
pub use crate::lifecycle::{
    LandmarkLifecycleManager, LandmarkState, LifecycleStats, PromotionReport, Rejection,
};
pub use crate::session::{SharedSession, SlamSession};

// --- Concrete Implementations (Export common ones for convenience) ---
pub use crate::models::PinholeCalibration;
pub use crate::solver::DenseSmoother;
