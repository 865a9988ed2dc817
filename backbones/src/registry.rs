use burn::prelude::*;
use swin_transformer::SwinTransformerConfig;

use crate::{
    error::{BackboneError, BackboneResult},
    staged::BackboneWrapper,
};

/// Stage count shared by every registered architecture.
pub const NUM_STAGES: usize = 4;

const MODELS: &[&str] = &[
    "swin_base_patch4_window12_384",
    "swin_base_patch4_window7_224",
    "swin_large_patch4_window12_384",
    "swin_large_patch4_window7_224",
    "swin_small_patch4_window7_224",
    "swin_tiny_patch4_window7_224",
];

/// Registered model identifiers, sorted.
pub fn available_models() -> &'static [&'static str] {
    MODELS
}

/// Architecture configuration for a registered model identifier.
pub fn swin_config(model_id: &str) -> BackboneResult<SwinTransformerConfig> {
    let config = match model_id {
        "swin_tiny_patch4_window7_224" => SwinTransformerConfig::tiny(),
        "swin_small_patch4_window7_224" => SwinTransformerConfig::small(),
        "swin_base_patch4_window7_224" => SwinTransformerConfig::base(),
        "swin_base_patch4_window12_384" => SwinTransformerConfig::base().with_window_size(12),
        "swin_large_patch4_window7_224" => SwinTransformerConfig::large(),
        "swin_large_patch4_window12_384" => SwinTransformerConfig::large().with_window_size(12),
        _ => {
            return Err(BackboneError::UnknownModel {
                name: model_id.to_string(),
                available: MODELS.join(", "),
            })
        }
    };
    Ok(config)
}

/// Stages consumed when the deepest requested stage is `out_index`: the stage itself and up to
/// two predecessors, deduplicated and ascending.
pub fn stage_window(out_index: usize, num_stages: usize) -> BackboneResult<Vec<usize>> {
    if out_index >= num_stages {
        return Err(BackboneError::InvalidStageIndex {
            index: out_index,
            num_stages,
        });
    }
    let mut window = vec![
        out_index.saturating_sub(2),
        out_index.saturating_sub(1),
        out_index,
    ];
    window.dedup();
    Ok(window)
}

/// Builds the registered backbone returning the stage window ending at `out_index`.
pub fn create_backbone<B: Backend>(
    model_id: &str,
    out_index: usize,
    device: &B::Device,
) -> BackboneResult<BackboneWrapper<B>> {
    let config = swin_config(model_id)?.with_out_indices(stage_window(out_index, NUM_STAGES)?);
    Ok(BackboneWrapper::Swin(config.init(device)?))
}
