use thiserror::Error;

#[derive(Error, Debug)]
pub enum SwinError {
    /// A requested output stage does not exist.
    #[error("Invalid output stage {index}: the network has {num_stages} stages")]
    InvalidOutIndex { index: usize, num_stages: usize },

    #[error("Invalid Swin configuration: {reason}")]
    InvalidConfiguration { reason: String },
}

pub type SwinResult<T> = Result<T, SwinError>;
