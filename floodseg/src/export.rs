//! Inference interchange export.

use std::{
    fs,
    path::{Path, PathBuf},
};

use burn::{
    prelude::*,
    record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder},
    tensor::Distribution,
};
use serde::{Deserialize, Serialize};

use crate::{
    error::{FloodSegError, FloodSegResult},
    models::SegmentationModel,
};

pub const INPUT_NAME: &str = "input";
pub const OUTPUT_NAME: &str = "logits";
pub const OPSET_VERSION: usize = 17;

fn export_error(reason: impl Into<String>) -> FloodSegError {
    FloodSegError::ExportError {
        reason: reason.into(),
    }
}

/// Named tensor with its axis names; axes listed in `dynamic_axes` may vary at run time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorSpec {
    pub name: String,
    pub axes: Vec<String>,
    pub dynamic_axes: Vec<String>,
}

/// Description of an exported artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportManifest {
    pub format: String,
    pub opset: usize,
    pub num_classes: usize,
    pub encoder: String,
    pub input: TensorSpec,
    pub output: TensorSpec,
    /// Shape used to trace and validate the export.
    pub example_shape: [usize; 4],
    pub weights: String,
}

impl ExportManifest {
    pub fn new(num_classes: usize, encoder: &str, example_shape: [usize; 4], weights: String) -> Self {
        let dynamic = vec!["batch".to_string(), "height".to_string(), "width".to_string()];
        let axes = |channels: &str| {
            vec![
                "batch".to_string(),
                channels.to_string(),
                "height".to_string(),
                "width".to_string(),
            ]
        };
        Self {
            format: "burn-mpk".into(),
            opset: OPSET_VERSION,
            num_classes,
            encoder: encoder.to_string(),
            input: TensorSpec {
                name: INPUT_NAME.into(),
                axes: axes("channels"),
                dynamic_axes: dynamic.clone(),
            },
            output: TensorSpec {
                name: OUTPUT_NAME.into(),
                axes: axes("classes"),
                dynamic_axes: dynamic,
            },
            example_shape,
            weights,
        }
    }
}

/// Writes a trained model in a form inference runtimes can load.
pub trait InferenceExporter<B: Backend> {
    /// Exports `model` to `path` using `example_shape` (`[1, 3, S, S]`) as the representative
    /// input. Returns the files written.
    fn export(
        &self,
        model: &SegmentationModel<B>,
        example_shape: [usize; 4],
        path: &Path,
    ) -> FloodSegResult<Vec<PathBuf>>;
}

/// Record file plus a JSON manifest describing inputs, outputs and dynamic axes.
#[derive(Debug, Clone, Default)]
pub struct RecordBundleExporter;

impl RecordBundleExporter {
    pub const fn new() -> Self {
        Self
    }
}

impl<B: Backend> InferenceExporter<B> for RecordBundleExporter {
    fn export(
        &self,
        model: &SegmentationModel<B>,
        example_shape: [usize; 4],
        path: &Path,
    ) -> FloodSegResult<Vec<PathBuf>> {
        let [batch, channels, height, width] = example_shape;
        let device = model.devices().into_iter().next().unwrap_or_default();
        let example = Tensor::<B, 4>::random(example_shape, Distribution::Normal(0.0, 1.0), &device);
        let logits = model
            .forward(example)
            .map_err(|err| export_error(format!("trace forward failed: {err}")))?;
        let expected = [batch, model.num_classes(), height, width];
        if logits.dims() != expected || channels != 3 {
            return Err(export_error(format!(
                "expected logits {expected:?} from input {example_shape:?}, got {:?}",
                logits.dims()
            )));
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let weights = path.with_extension("mpk");
        NamedMpkFileRecorder::<FullPrecisionSettings>::new()
            .record(model.clone().into_record(), weights.clone())
            .map_err(|err| export_error(format!("cannot write {}: {err}", weights.display())))?;

        let weights_name = weights
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default()
            .to_string();
        let manifest = ExportManifest::new(
            model.num_classes(),
            model.encoder_kind().as_str(),
            example_shape,
            weights_name,
        );
        let manifest_path = path.with_extension("json");
        let json = serde_json::to_string_pretty(&manifest)
            .map_err(|err| export_error(format!("cannot serialize manifest: {err}")))?;
        fs::write(&manifest_path, json)?;

        tracing::info!(path = %manifest_path.display(), "exported model");
        Ok(vec![weights, manifest_path])
    }
}
