//! Swin Transformer (shifted-window hierarchical vision transformer) as a feature extractor.
//!
//! The network is organised as explicit stages so callers can select which stage outputs to
//! return and address each stage's parameters separately (freezing, learning-rate groups).
//! Stage `i > 0` starts with a patch-merging downsample, which matches the layout of the
//! public timm checkpoints.

mod attention;
mod block;
mod error;
mod model;
mod stage;
mod window;

pub use attention::{WindowAttention, WindowAttentionConfig};
pub use block::{Mlp, MlpConfig, SwinBlock, SwinBlockConfig};
pub use error::{SwinError, SwinResult};
pub use model::{PatchEmbed, PatchEmbedConfig, SwinTransformer, SwinTransformerConfig, SwinTransformerRecord};
pub use stage::{PatchMerging, PatchMergingConfig, SwinStage, SwinStageConfig};
