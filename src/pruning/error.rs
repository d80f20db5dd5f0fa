//! Pruning-specific error types.
//!
//! Every variant carries enough context to diagnose the failure without a
//! debugger: the offending policy string, the shapes involved, the requested
//! and achievable sparsity.

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, PruningError>;

/// Pruning operation errors with detailed context.
#[derive(Debug, Error)]
pub enum PruningError {
    /// Policy name does not resolve to a known (rule, distribution) pair.
    ///
    /// Raised before any mask computation begins.
    #[error("Unknown pruning policy '{name}' (expected one of: {known})")]
    UnknownPolicy {
        /// The rejected policy string
        name: String,
        /// Comma-separated list of accepted names
        known: String,
    },

    /// A data-dependent scoring rule ran without a batch.
    #[error("Scoring rule '{rule}' requires a data batch but none was available")]
    DataUnavailable {
        /// Rule that needed the data
        rule: String,
    },

    /// The global target cannot be met without pushing a tensor below its
    /// keep floor.
    ///
    /// Normally recovered by clamping; surfaced as an error only when the
    /// configuration asks for strict budgets.
    #[error("Sparsity budget infeasible: requested {requested:.6}, largest feasible {achieved:.6}")]
    BudgetInfeasible {
        /// Requested global sparsity
        requested: f64,
        /// Largest sparsity reachable under the keep floor
        achieved: f64,
    },

    /// Mask and tensor shapes diverge.
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        /// Expected shape
        expected: Vec<usize>,
        /// Actual shape found
        got: Vec<usize>,
    },

    /// Masks must contain only 0.0 or 1.0.
    #[error("Invalid sparsity mask: {reason}")]
    InvalidMask {
        /// Reason for invalidity
        reason: String,
    },

    /// Sparsity target outside `[0, 1)`.
    #[error("Invalid sparsity value {value}: {constraint}")]
    InvalidSparsity {
        /// Provided value
        value: f64,
        /// Constraint description
        constraint: String,
    },

    /// Network exposes no prunable tensors.
    #[error("Network '{network}' has no prunable tensors")]
    NoParameters {
        /// Network name
        network: String,
    },

    /// Architecture name not recognised.
    #[error("Unknown architecture '{name}'")]
    UnknownArchitecture {
        /// The rejected architecture string
        name: String,
    },

    /// Non-finite values detected in scores or signals.
    #[error("Numerical instability in {method}: {details}")]
    NumericalInstability {
        /// Method that detected the instability
        method: String,
        /// What was detected
        details: String,
    },

    /// Filesystem failure while persisting artifacts or loading config.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PruningError {
    /// Whether the run must abort before any training resource is allocated.
    #[must_use]
    pub fn is_validation_error(&self) -> bool {
        matches!(
            self,
            PruningError::UnknownPolicy { .. }
                | PruningError::ShapeMismatch { .. }
                | PruningError::UnknownArchitecture { .. }
                | PruningError::InvalidSparsity { .. }
        )
    }
}
