use thiserror::Error;

/// The error type for floodseg operations.
#[derive(Error, Debug)]
pub enum FloodSegError {
    /// Hyperparameters are inconsistent or out of range.
    #[error("Invalid configuration: {reason}")]
    InvalidConfiguration { reason: String },

    #[error("Unknown dataset '{name}'. Available: {available}")]
    UnknownDataset { name: String, available: String },

    /// The requested feature was not compiled into this build.
    #[error("{capability} is not available in this build: {hint}")]
    CapabilityUnavailable { capability: String, hint: String },

    #[error("Invalid tensor shape: expected {expected}, got {actual}")]
    InvalidTensorShape { expected: String, actual: String },

    /// A sample or batch violates the data invariants.
    #[error("Dataset error: {message}")]
    DatasetError { message: String },

    #[error("Checkpoint error: {reason}")]
    CheckpointError { reason: String },

    #[error("Export failed: {reason}")]
    ExportError { reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(feature = "backbone")]
impl From<backbones::BackboneError> for FloodSegError {
    fn from(err: backbones::BackboneError) -> Self {
        match err {
            backbones::BackboneError::WeightLoadingFailed { reason } => Self::CheckpointError {
                reason: format!("pretrained backbone: {reason}"),
            },
            other => Self::InvalidConfiguration {
                reason: other.to_string(),
            },
        }
    }
}

/// A specialized `Result` type for floodseg operations.
pub type FloodSegResult<T> = Result<T, FloodSegError>;
