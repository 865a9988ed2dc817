//! Feature-extractor backbones for segmentation models.
//!
//! Backbones are exposed through [`StagedBackbone`], which returns an ordered list of stage
//! outputs and lets callers address parameters stage by stage. Concrete networks are built
//! from string identifiers via [`create_backbone`].

mod error;
#[cfg(feature = "pretrained")]
mod pretrained;
mod registry;
mod staged;

pub use error::{BackboneError, BackboneResult};
#[cfg(feature = "pretrained")]
pub use pretrained::{load_pretrained, weights_cache_dir};
pub use registry::{available_models, create_backbone, stage_window, swin_config, NUM_STAGES};
pub use staged::{trainable_params, BackboneWrapper, RequireGrad, StagedBackbone, TrainableParams};
pub use swin_transformer::{SwinTransformer, SwinTransformerConfig};
