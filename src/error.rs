//! Error types for AFQMC propagation and population control.

use thiserror::Error;

/// Error type shared by walkers, propagators and the population controller.
#[derive(Debug, Error)]
pub enum AfqmcError {
    /// A rank-1 update denominator or overlap ratio fell under the numerical floor.
    /// Absorbed locally as walker death.
    #[error("Numerical degeneracy: {0}")]
    NumericalDegeneracy(String),

    /// Every walker on every rank carries zero weight.
    #[error("Population collapse: total walker weight is zero after step {step}")]
    PopulationCollapse { step: usize },

    /// Checkpoint record length or walker count disagrees with the configuration.
    #[error("Checkpoint format mismatch: expected {expected} {what}, found {found}")]
    CheckpointFormatMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    /// A collective or point-to-point call failed or timed out.
    #[error("Communication failure on rank {rank}: {message}")]
    CommunicationFailure { rank: usize, message: String },

    /// Inconsistent run configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Operation not available for this walker or propagator variant.
    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl AfqmcError {
    /// True for errors that only kill a single walker.
    pub fn is_walker_death(&self) -> bool {
        matches!(self, AfqmcError::NumericalDegeneracy(_))
    }
}

/// Result type for AFQMC operations.
pub type Result<T> = std::result::Result<T, AfqmcError>;
