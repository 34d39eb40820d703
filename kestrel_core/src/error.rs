// kestrel_core/src/error.rs

use crate::types::Key;
use thiserror::Error;

/// Every failure the SLAM core can surface to a caller.
///
/// Promotion-gate rejections are not errors: a landmark that fails
/// the quality gate simply stays deferred, see `lifecycle::Rejection`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SlamError {
    /// A query named a key that is not in the graph.
    #[error("key {0} not found")]
    NotFound(Key),

    /// `initialize` was called on a graph that already has pose 0.
    #[error("graph is already initialized")]
    AlreadyInitialized,

    /// A structural invariant would be violated by the requested operation.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The solver did not converge or hit a singular system. Graph state is
    /// unchanged and the pending buffer is preserved.
    #[error("solve failed: {reason}")]
    SolveFailed { reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, SlamError>;

impl SlamError {
    pub(crate) fn solve_failed(reason: impl Into<String>) -> Self {
        SlamError::SolveFailed {
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_state(message: impl Into<String>) -> Self {
        SlamError::InvalidState(message.into())
    }
}
