//! Error types for effsparse

use effective_sparsity::PruningError;
use std::process::ExitCode;
use thiserror::Error;

/// Result type alias for CLI operations
pub(crate) type Result<T> = std::result::Result<T, CliError>;

/// CLI error types
#[derive(Error, Debug)]
pub(crate) enum CliError {
    /// Conflicting or out-of-range arguments
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Failure inside the pruning library
    #[error(transparent)]
    Pruning(#[from] PruningError),

    /// Report could not be rendered
    #[error("Output error: {0}")]
    Output(#[from] serde_json::Error),
}

impl CliError {
    /// Get exit code for this error
    pub(crate) fn exit_code(&self) -> ExitCode {
        match self {
            Self::InvalidArgument(_) => ExitCode::from(2),
            Self::Pruning(PruningError::UnknownPolicy { .. } | PruningError::UnknownArchitecture { .. }) => {
                ExitCode::from(2)
            }
            Self::Pruning(PruningError::Io(_)) => ExitCode::from(7),
            Self::Pruning(_) => ExitCode::from(1),
            Self::Output(_) => ExitCode::from(4),
        }
    }
}
