//! Semantic segmentation of aerial disaster imagery.
//!
//! The model pairs a feature extractor (a convolution stem feeding a transformer, or a staged
//! Swin backbone) with an optional top-down fusion neck and an atrous decoder head. Training
//! blends cross-entropy with soft Dice, groups learning rates per backbone stage, releases a
//! frozen backbone on schedule and keeps a weight-averaged shadow model for validation.

pub mod averaging;
pub mod checkpoint;
pub mod config;
#[cfg(feature = "train")]
pub mod dataset;
pub mod error;
pub mod export;
pub mod losses;
pub mod metadata;
pub mod metrics;
pub mod models;
pub mod policy;
pub mod precision;
mod record_paths;
pub mod schedule;
pub mod telemetry;
#[cfg(feature = "train")]
pub mod training;

pub use config::TrainingConfig;
pub use error::{FloodSegError, FloodSegResult};
pub use models::{EncoderKind, SegmentationModel, SegmentationModelConfig};
#[cfg(feature = "train")]
pub use training::{run, Trainer};
