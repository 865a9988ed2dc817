//! Loading published Swin checkpoints (timm layout) into [`BackboneWrapper`].

use std::path::{Path, PathBuf};

use burn::{prelude::*, record::FullPrecisionSettings, record::Recorder};
use burn_import::pytorch::{LoadArgs, PyTorchFileRecorder};
use swin_transformer::SwinTransformerRecord;

use crate::{
    error::{BackboneError, BackboneResult},
    staged::BackboneWrapper,
};

/// Directory searched for bare checkpoint file names.
pub fn weights_cache_dir() -> Option<PathBuf> {
    dirs::cache_dir().map(|dir| dir.join("floodseg").join("weights"))
}

fn resolve(path: &Path) -> BackboneResult<PathBuf> {
    if path.exists() {
        return Ok(path.to_path_buf());
    }
    weights_cache_dir()
        .map(|dir| dir.join(path))
        .filter(|candidate| candidate.exists())
        .ok_or_else(|| BackboneError::WeightLoadingFailed {
            reason: format!("checkpoint '{}' not found", path.display()),
        })
}

/// Loads a PyTorch state dict into the backbone. Keys for stages that were not built are
/// ignored, so a truncated backbone accepts a full checkpoint.
pub fn load_pretrained<B: Backend>(
    backbone: BackboneWrapper<B>,
    path: &Path,
    device: &B::Device,
) -> BackboneResult<BackboneWrapper<B>> {
    let path = resolve(path)?;
    let load_args = LoadArgs::new(path.clone())
        .with_key_remap("^model\\.(.+)", "$1")
        .with_key_remap("^layers\\.(\\d+)\\.(.+)", "stages.$1.$2");
    let recorder = PyTorchFileRecorder::<FullPrecisionSettings>::default();

    match backbone {
        BackboneWrapper::Swin(model) => {
            let record: SwinTransformerRecord<B> =
                recorder
                    .load(load_args, device)
                    .map_err(|e| BackboneError::WeightLoadingFailed {
                        reason: format!("{}: {e}", path.display()),
                    })?;
            Ok(BackboneWrapper::Swin(model.load_record(record)))
        }
    }
}
