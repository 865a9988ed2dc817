use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackboneError {
    #[error("Unknown backbone model '{name}'. Available: {available}")]
    UnknownModel { name: String, available: String },

    #[error("Stage index {index} is out of range for a backbone with {num_stages} stages")]
    InvalidStageIndex { index: usize, num_stages: usize },

    #[error("Backbone construction failed: {reason}")]
    Construction { reason: String },

    #[error("Failed to load pretrained weights: {reason}")]
    WeightLoadingFailed { reason: String },
}

impl From<swin_transformer::SwinError> for BackboneError {
    fn from(err: swin_transformer::SwinError) -> Self {
        match err {
            swin_transformer::SwinError::InvalidOutIndex { index, num_stages } => {
                Self::InvalidStageIndex { index, num_stages }
            }
            other => Self::Construction {
                reason: other.to_string(),
            },
        }
    }
}

pub type BackboneResult<T> = Result<T, BackboneError>;
