//! Error types for the RLHF pipeline

use thiserror::Error;

/// Main error type for the RLHF pipeline
#[derive(Error, Debug)]
pub enum RlhfError {
    /// Malformed feedback or an unknown enum value; surfaced to the submitter
    #[error("Invalid feedback: {0}")]
    InvalidFeedback(String),

    /// The replay buffer holds fewer experiences than a batch needs
    #[error("Insufficient samples: {available} available, {requested} requested")]
    InsufficientSamples { available: usize, requested: usize },

    /// A training step was aborted (non-finite reward, loss or gradient)
    #[error("Training failed: {0}")]
    TrainingFailed(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RlhfError {
    /// Not-ready signals are expected control flow, not failures
    pub fn is_not_ready(&self) -> bool {
        matches!(self, RlhfError::InsufficientSamples { .. })
    }
}

/// Result type alias for RLHF operations
pub type Result<T> = std::result::Result<T, RlhfError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insufficient_samples_is_not_ready() {
        let err = RlhfError::InsufficientSamples {
            available: 3,
            requested: 32,
        };
        assert!(err.is_not_ready());
        assert_eq!(
            err.to_string(),
            "Insufficient samples: 3 available, 32 requested"
        );
    }

    #[test]
    fn test_training_failed_is_not_not_ready() {
        let err = RlhfError::TrainingFailed("NaN loss".to_string());
        assert!(!err.is_not_ready());
        assert_eq!(err.to_string(), "Training failed: NaN loss");
    }
}
