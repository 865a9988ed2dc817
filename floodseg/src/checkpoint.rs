//! Checkpoint files, resume state and tolerant weight loading.

use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::{Path, PathBuf},
};

use burn::{
    module::{AutodiffModule, ModuleMapper, ParamId},
    optim::Optimizer,
    prelude::*,
    record::{FullPrecisionSettings, NamedMpkFileRecorder, Record, Recorder},
    tensor::{backend::AutodiffBackend, DType},
};
use serde::{Deserialize, Serialize};

use crate::{
    config::TrainingConfig,
    error::{FloodSegError, FloodSegResult},
    models::{SegmentationModel, SegmentationModelRecord},
    precision::GradScaler,
    record_paths::{collect_params, StoredParam},
    schedule::WarmupCosineSchedule,
};

pub const BEST_CHECKPOINT: &str = "cnn_transformer_seg_best.mpk";
pub const FINAL_CHECKPOINT: &str = "cnn_transformer_seg_final.mpk";

type FileRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

fn checkpoint_error(reason: impl Into<String>) -> FloodSegError {
    FloodSegError::CheckpointError {
        reason: reason.into(),
    }
}

/// Weights plus validation summary and the configuration that produced them.
#[derive(Record)]
pub struct CheckpointRecord<B: Backend> {
    pub model: SegmentationModelRecord<B>,
    /// `None` for checkpoints written by a resumed run.
    pub epoch: Option<usize>,
    pub miou: f64,
    pub acc: Option<f64>,
    /// JSON rendering of the run configuration.
    pub cfg: String,
    pub encoder: String,
    pub num_params: usize,
}

/// Validation summary stored next to the weights.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CheckpointSummary {
    pub epoch: Option<usize>,
    pub miou: f64,
    pub acc: Option<f64>,
}

pub fn best_checkpoint_path(save_dir: &Path) -> PathBuf {
    save_dir.join(BEST_CHECKPOINT)
}

pub fn final_checkpoint_path(save_dir: &Path) -> PathBuf {
    save_dir.join(FINAL_CHECKPOINT)
}

fn sibling(checkpoint: &Path, suffix: &str) -> PathBuf {
    let stem = checkpoint
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("checkpoint");
    checkpoint.with_file_name(format!("{stem}.{suffix}"))
}

/// `<stem>.optim.mpk` next to a checkpoint.
pub fn optimizer_path(checkpoint: &Path) -> PathBuf {
    sibling(checkpoint, "optim.mpk")
}

/// `<stem>.state.json` next to a checkpoint.
pub fn state_path(checkpoint: &Path) -> PathBuf {
    sibling(checkpoint, "state.json")
}

/// Writes `model` with its summary to `path`, creating parent directories.
pub fn save_checkpoint<B: Backend>(
    path: &Path,
    model: &SegmentationModel<B>,
    summary: CheckpointSummary,
    config: &TrainingConfig,
) -> FloodSegResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let record = CheckpointRecord {
        model: model.clone().into_record(),
        epoch: summary.epoch,
        miou: summary.miou,
        acc: summary.acc,
        cfg: config.to_json()?,
        encoder: model.encoder_kind().as_str().to_string(),
        num_params: model.num_params(),
    };

    FileRecorder::new()
        .record(record, path.to_path_buf())
        .map_err(|err| checkpoint_error(format!("cannot write {}: {err}", path.display())))?;
    tracing::info!(path = %path.display(), miou = summary.miou, "checkpoint saved");
    Ok(())
}

pub fn load_checkpoint<B: Backend>(path: &Path, device: &B::Device) -> FloodSegResult<CheckpointRecord<B>> {
    if !path.is_file() {
        return Err(checkpoint_error(format!("{} does not exist", path.display())));
    }
    FileRecorder::new()
        .load(path.to_path_buf(), device)
        .map_err(|err| checkpoint_error(format!("cannot read {}: {err}", path.display())))
}

/// Names and sizes of the optimizer's parameter groups, used to decide whether saved
/// optimizer state still applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupLayout {
    pub name: String,
    pub params: usize,
}

/// Training-loop state saved beside a checkpoint for resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeState {
    pub schedule: WarmupCosineSchedule,
    pub scaler: GradScaler,
    pub groups: Vec<GroupLayout>,
    pub averaged_updates: u64,
}

impl ResumeState {
    pub fn save(&self, checkpoint: &Path) -> FloodSegResult<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|err| checkpoint_error(format!("cannot serialize resume state: {err}")))?;
        fs::write(state_path(checkpoint), json)?;
        Ok(())
    }

    /// `None` when the checkpoint has no readable state file.
    pub fn load(checkpoint: &Path) -> Option<Self> {
        let path = state_path(checkpoint);
        let json = fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&json) {
            Ok(state) => Some(state),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "ignoring unreadable resume state");
                None
            }
        }
    }
}

pub fn save_optimizer<B, M, O>(optimizer: &O, checkpoint: &Path) -> FloodSegResult<()>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    let path = optimizer_path(checkpoint);
    FileRecorder::new()
        .record(optimizer.to_record(), path.clone())
        .map_err(|err| checkpoint_error(format!("cannot write {}: {err}", path.display())))
}

/// Restores optimizer state saved with [`save_optimizer`]; `None` when absent or unreadable.
pub fn load_optimizer<B, M, O>(optimizer: O, checkpoint: &Path, device: &B::Device) -> Option<O>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    let path = optimizer_path(checkpoint);
    if !path.is_file() {
        return None;
    }
    match FileRecorder::new().load::<O::Record>(path.clone(), device) {
        Ok(record) => Some(optimizer.load_record(record)),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "ignoring unreadable optimizer state");
            None
        }
    }
}

/// Outcome of applying checkpoint weights to a model. Parameters are matched by their field
/// path in the module tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: usize,
    /// Parameters whose stored tensor has a different shape.
    pub skipped: usize,
    /// Model parameters with no stored counterpart.
    pub missing: usize,
    /// Stored tensors with no model counterpart.
    pub unexpected: usize,
}

impl LoadReport {
    pub const fn is_exact(&self) -> bool {
        self.skipped == 0 && self.missing == 0 && self.unexpected == 0
    }
}

/// Float parameters of a record item by path.
fn float_params<T: Serialize>(item: &T, with_data: bool) -> FloodSegResult<BTreeMap<String, StoredParam>> {
    let params = collect_params(item, with_data)
        .map_err(|err| checkpoint_error(format!("cannot list record parameters: {err}")))?;
    Ok(params.into_iter().filter(|(_, param)| param.is_float()).collect())
}

/// Replaces the values of the listed parameters, keeping their trainability.
struct Graft {
    values: HashMap<ParamId, TensorData>,
}

impl<B: Backend> ModuleMapper<B> for Graft {
    fn map_float<const D: usize>(&mut self, id: ParamId, tensor: Tensor<B, D>) -> Tensor<B, D> {
        let Some(data) = self.values.remove(&id) else {
            return tensor;
        };
        let require_grad = tensor.is_require_grad();
        Tensor::from_data(data.convert::<B::FloatElem>(), &tensor.device()).set_require_grad(require_grad)
    }
}

/// Applies `record` to `model`. When every parameter path and shape agrees the record is
/// loaded as is, keeping its parameter ids; otherwise each parameter whose path and shape
/// match is copied and the rest keep their current values.
pub fn apply_weights<B: Backend>(
    model: SegmentationModel<B>,
    record: SegmentationModelRecord<B>,
    device: &B::Device,
) -> FloodSegResult<(SegmentationModel<B>, LoadReport)> {
    let expected = float_params(&model.clone().into_record().into_item::<FullPrecisionSettings>(), false)?;
    let item = record.into_item::<FullPrecisionSettings>();
    let stored = float_params(&item, false)?;

    let same_layout = expected.len() == stored.len()
        && expected
            .iter()
            .all(|(path, param)| stored.get(path).is_some_and(|other| other.shape == param.shape));
    if same_layout {
        let record = SegmentationModelRecord::<B>::from_item::<FullPrecisionSettings>(item, device);
        let report = LoadReport {
            loaded: expected.len(),
            ..LoadReport::default()
        };
        return Ok((model.load_record(record), report));
    }

    let mut stored = float_params(&item, true)?;
    let mut report = LoadReport::default();
    let mut values = HashMap::new();
    for (path, param) in &expected {
        let Some(candidate) = stored.remove(path) else {
            report.missing += 1;
            continue;
        };
        if candidate.shape != param.shape {
            tracing::debug!(%path, stored = ?candidate.shape, model = ?param.shape, "shape mismatch");
            report.skipped += 1;
            continue;
        }
        report.loaded += 1;
        let data = TensorData::from_bytes(candidate.bytes, candidate.shape, DType::F32);
        values.insert(ParamId::deserialize(&param.id), data);
    }
    report.unexpected = stored.len();

    let model = model.map(&mut Graft { values });
    Ok((model, report))
}

/// Model after a resume attempt. `report` is `None` when nothing was loaded.
pub struct Resumed<B: Backend> {
    pub model: SegmentationModel<B>,
    pub report: Option<LoadReport>,
    pub state: Option<ResumeState>,
}

impl<B: Backend> Resumed<B> {
    fn from_scratch(model: SegmentationModel<B>) -> Self {
        Self {
            model,
            report: None,
            state: None,
        }
    }

    pub const fn is_resumed(&self) -> bool {
        self.report.is_some()
    }
}

/// Loads `path` into `model`. Any failure to read or match the checkpoint is logged and the
/// model is handed back untouched, so training proceeds from scratch.
pub fn resume<B: Backend>(model: SegmentationModel<B>, path: &Path, device: &B::Device) -> Resumed<B> {
    let record = match load_checkpoint::<B>(path, device) {
        Ok(record) => record,
        Err(err) => {
            tracing::warn!(error = %err, "resume skipped, training from scratch");
            return Resumed::from_scratch(model);
        }
    };

    let encoder = model.encoder_kind();
    if record.encoder != encoder.as_str() {
        tracing::warn!(
            checkpoint = %record.encoder,
            model = encoder.as_str(),
            "checkpoint was trained with a different encoder, training from scratch"
        );
        return Resumed::from_scratch(model);
    }

    let (model, report) = match apply_weights(model.clone(), record.model, device) {
        Ok(applied) => applied,
        Err(err) => {
            tracing::warn!(error = %err, "resume skipped, training from scratch");
            return Resumed::from_scratch(model);
        }
    };
    if report.is_exact() {
        tracing::info!(path = %path.display(), params = report.loaded, "resumed weights");
    } else {
        tracing::warn!(
            path = %path.display(),
            loaded = report.loaded,
            skipped = report.skipped,
            missing = report.missing,
            unexpected = report.unexpected,
            "partial weight load"
        );
    }

    Resumed {
        model,
        report: Some(report),
        state: ResumeState::load(path),
    }
}
