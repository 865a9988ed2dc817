//! Epoch and step orchestration.
//!
//! A [`Trainer`] owns the model, the optimizer with its parameter groups, the learning-rate
//! schedule, the averaged shadow model and the loss scaler. Each epoch runs the training
//! steps, validates the shadow model, applies the scheduled unfreeze and keeps the best
//! checkpoint.

use std::{collections::HashMap, path::Path, sync::Arc};

use burn::{
    data::dataloader::DataLoader,
    module::{AutodiffModule, ModuleVisitor, ParamId},
    optim::{AdamWConfig, GradientsAccumulator, GradientsParams, Optimizer},
    prelude::*,
    tensor::{backend::AutodiffBackend, ElementConversion},
};

use crate::{
    averaging::WeightAveraging,
    checkpoint::{
        self, best_checkpoint_path, final_checkpoint_path, save_checkpoint, CheckpointSummary,
        GroupLayout, ResumeState,
    },
    config::TrainingConfig,
    dataset::{self, SegmentationBatch},
    error::FloodSegResult,
    export::{InferenceExporter, RecordBundleExporter},
    losses::SegmentationLoss,
    metrics::{evaluate, SegmentationMetrics},
    models::SegmentationModel,
    policy::{backbone_stage_count, build_param_groups, set_backbone_trainable, FreezePolicy, ParamGroup},
    precision::{GradScaler, PrecisionPolicy},
    schedule::{steps_per_epoch, WarmupCosineSchedule},
    telemetry::Heartbeat,
};

/// Pings sent at start-up and after each validation.
const HEARTBEAT_BURST: usize = 3;

/// Where the run stands in the freeze schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingPhase {
    /// Backbone frozen until the scheduled unfreeze.
    FrozenWarmup,
    /// The scheduled unfreeze has happened.
    Unfrozen,
    /// Trainability never changes during the run.
    Static,
}

/// `+{epoch}` for resumed runs, zero-padded otherwise.
pub fn epoch_label(epoch: usize, resumed: bool) -> String {
    if resumed {
        format!("+{epoch}")
    } else {
        format!("{epoch:03}")
    }
}

/// Values of one training step. `loss` is read from the tensor that was backpropagated.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutput {
    pub loss: f64,
    pub cross_entropy: f64,
    pub dice: Option<f64>,
    pub optimizer_stepped: bool,
    /// Learning rate of the first group after this step.
    pub lr: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EpochSummary {
    pub label: String,
    pub train_loss: f64,
    pub metrics: SegmentationMetrics,
    pub improved: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FitSummary {
    pub epochs: Vec<EpochSummary>,
    pub best_miou: f64,
}

/// Moves each gradient into the container of the group that owns its parameter.
struct SplitGroups<'a> {
    source: &'a mut GradientsParams,
    owner: HashMap<ParamId, usize>,
    groups: Vec<GradientsParams>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for SplitGroups<'_> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        let Some(&group) = self.owner.get(&id) else {
            return;
        };
        if let Some(grad) = self.source.remove::<B::InnerBackend, D>(id) {
            self.groups[group].register::<B::InnerBackend, D>(id, grad);
        }
    }
}

fn split_by_group<B: AutodiffBackend, M: AutodiffModule<B>>(
    grads: &mut GradientsParams,
    model: &M,
    groups: &[ParamGroup],
) -> Vec<GradientsParams> {
    let owner = groups
        .iter()
        .enumerate()
        .flat_map(|(index, group)| group.params.iter().map(move |id| (*id, index)))
        .collect();
    let mut split = SplitGroups {
        source: grads,
        owner,
        groups: groups.iter().map(|_| GradientsParams::new()).collect(),
    };
    model.visit(&mut split);
    split.groups
}

fn scalar<B: Backend>(tensor: Tensor<B, 1>) -> f64 {
    tensor.into_scalar().elem::<f64>()
}

pub struct Trainer<'a, B: AutodiffBackend, O: Optimizer<SegmentationModel<B>, B>> {
    config: &'a TrainingConfig,
    device: B::Device,
    num_classes: usize,
    model: SegmentationModel<B>,
    loss: SegmentationLoss,
    optimizer: O,
    make_optimizer: Box<dyn Fn() -> O + 'a>,
    groups: Vec<ParamGroup>,
    accumulator: GradientsAccumulator<SegmentationModel<B>>,
    pending: usize,
    steps_per_epoch: usize,
    schedule: WarmupCosineSchedule,
    averaging: WeightAveraging<B, SegmentationModel<B>>,
    scaler: GradScaler,
    freeze: FreezePolicy,
    phase: TrainingPhase,
    best_miou: f64,
    resumed: bool,
    heartbeat: Heartbeat,
    exporter: Box<dyn InferenceExporter<B::InnerBackend> + 'a>,
}

impl<'a, B: AutodiffBackend, O: Optimizer<SegmentationModel<B>, B>> Trainer<'a, B, O> {
    /// Prepares a run over `batches_per_epoch` training batches.
    ///
    /// Resumes from `config.resume` when set, applies the initial freeze, builds the parameter
    /// groups and a fresh optimizer from `make_optimizer`.
    pub fn new(
        config: &'a TrainingConfig,
        model: SegmentationModel<B>,
        batches_per_epoch: usize,
        precision: PrecisionPolicy,
        heartbeat: Heartbeat,
        make_optimizer: impl Fn() -> O + 'a,
        device: B::Device,
    ) -> FloodSegResult<Self> {
        config.validate()?;
        let num_classes = config.classes()?;

        let (model, resume_state, resumed) = match config.resume_path() {
            Some(path) => {
                let outcome = checkpoint::resume(model, path, &device);
                let resumed = outcome.is_resumed();
                (outcome.model, outcome.state, resumed)
            }
            None => (model, None, false),
        };

        let freeze = FreezePolicy::resolve(
            &model.encoder_kind(),
            config.freeze_backbone,
            config.auto_freeze_epochs,
            backbone_stage_count(&model),
        );
        let (model, phase) = match freeze {
            FreezePolicy::Disabled => (model, TrainingPhase::Static),
            FreezePolicy::Frozen => {
                tracing::info!("backbone frozen for all epochs");
                (set_backbone_trainable(model, false, None), TrainingPhase::Static)
            }
            FreezePolicy::AutoFreeze { unfreeze_epoch, .. } => {
                tracing::info!(epochs = unfreeze_epoch, "backbone frozen for warmup epochs");
                (set_backbone_trainable(model, false, None), TrainingPhase::FrozenWarmup)
            }
        };

        let groups = build_param_groups(&model, config.lr, config.layerwise_backbone_lr);
        let steps_per_epoch = steps_per_epoch(batches_per_epoch, config.grad_accum);
        let mut optimizer = make_optimizer();
        let mut schedule = WarmupCosineSchedule::new(steps_per_epoch * config.epochs);
        let mut scaler = precision.grad_scaler();
        let mut averaging = WeightAveraging::new(&model, config.averaging);

        if let (Some(state), Some(path)) = (resume_state, config.resume_path()) {
            if state.groups == group_layout(&groups) {
                if let Some(restored) = checkpoint::load_optimizer(make_optimizer(), path, &device) {
                    optimizer = restored;
                    tracing::info!("restored optimizer state");
                }
            } else {
                tracing::warn!("parameter groups changed since the checkpoint, optimizer state not restored");
            }
            schedule = state.schedule;
            if scaler.is_enabled() && state.scaler.is_enabled() {
                scaler = state.scaler;
            }
            averaging.set_updates(state.averaged_updates);
            tracing::info!(step = schedule.steps_taken(), "restored scheduler state");
        }

        log_groups(&groups);

        Ok(Self {
            config,
            device,
            num_classes,
            model,
            loss: config.loss_config().init(),
            optimizer,
            make_optimizer: Box::new(make_optimizer),
            groups,
            accumulator: GradientsAccumulator::new(),
            pending: 0,
            steps_per_epoch,
            schedule,
            averaging,
            scaler,
            freeze,
            phase,
            best_miou: -1.0,
            resumed,
            heartbeat,
            exporter: Box::new(RecordBundleExporter::new()),
        })
    }

    /// Replaces the exporter used at the end of [`Trainer::fit`].
    pub fn with_exporter(mut self, exporter: impl InferenceExporter<B::InnerBackend> + 'a) -> Self {
        self.exporter = Box::new(exporter);
        self
    }

    pub const fn model(&self) -> &SegmentationModel<B> {
        &self.model
    }

    pub fn averaged_model(&self) -> &SegmentationModel<B::InnerBackend> {
        self.averaging.model()
    }

    pub fn groups(&self) -> &[ParamGroup] {
        &self.groups
    }

    pub const fn phase(&self) -> TrainingPhase {
        self.phase
    }

    pub const fn schedule(&self) -> &WarmupCosineSchedule {
        &self.schedule
    }

    pub const fn best_miou(&self) -> f64 {
        self.best_miou
    }

    pub const fn is_resumed(&self) -> bool {
        self.resumed
    }

    /// Drops gradients left over from an incomplete accumulation window.
    pub fn start_epoch(&mut self) {
        self.accumulator = GradientsAccumulator::new();
        self.pending = 0;
    }

    /// Forward, loss and backward on one batch; every `grad_accum` batches the optimizer
    /// updates each group, the schedule advances and the shadow model is refreshed.
    pub fn train_step(&mut self, batch: SegmentationBatch<B>) -> FloodSegResult<StepOutput> {
        batch.validate(self.num_classes)?;

        let logits = self.model.forward(batch.images)?;
        let losses = self.loss.forward(logits, batch.masks);
        let loss = scalar(losses.total.clone());
        let cross_entropy = scalar(losses.cross_entropy);
        let dice = losses.dice.map(scalar);

        let accum = self.config.grad_accum.max(1);
        let scaled = self.scaler.scale(losses.total.div_scalar(accum as f64));
        let grads = GradientsParams::from_grads(scaled.backward(), &self.model);
        self.accumulator.accumulate(&self.model, grads);
        self.pending += 1;

        let optimizer_stepped = self.pending == accum;
        if optimizer_stepped {
            self.apply_update();
        }

        Ok(StepOutput {
            loss,
            cross_entropy,
            dice,
            optimizer_stepped,
            lr: self.current_lr(),
        })
    }

    fn apply_update(&mut self) {
        self.pending = 0;
        let mut grads = self.accumulator.grads();
        let found_inf = self.scaler.unscale(&mut grads, &self.model);

        if found_inf {
            tracing::warn!(scale = self.scaler.scale_factor(), "non-finite gradients, step skipped");
        } else {
            let factor = self.schedule.current_factor();
            let per_group = split_by_group(&mut grads, &self.model, &self.groups);
            for (group, grads) in self.groups.iter().zip(per_group) {
                if grads.is_empty() {
                    continue;
                }
                self.model = self.optimizer.step(group.lr * factor, self.model.clone(), grads);
            }
        }

        self.scaler.update(found_inf);
        self.schedule.step();
        self.averaging.update(&self.model);
    }

    /// Learning rate the first group will use on the next update.
    pub fn current_lr(&self) -> f64 {
        self.groups
            .first()
            .map_or(0.0, |group| group.lr * self.schedule.current_factor())
    }

    /// Releases the scheduled backbone stage after validation of `unfreeze_epoch`, then
    /// rebuilds the parameter groups, the optimizer and the schedule for the remaining epochs.
    /// Returns whether the transition happened.
    pub fn maybe_unfreeze(&mut self, epoch: usize) -> bool {
        let FreezePolicy::AutoFreeze {
            unfreeze_epoch,
            stage,
        } = self.freeze
        else {
            return false;
        };
        if self.phase != TrainingPhase::FrozenWarmup || epoch != unfreeze_epoch {
            return false;
        }

        tracing::info!(epoch, stage, "unfreezing deepest backbone stage");
        self.model = set_backbone_trainable(self.model.clone(), true, Some(&[stage]));
        self.groups = build_param_groups(&self.model, self.config.lr, self.config.layerwise_backbone_lr);
        self.optimizer = (self.make_optimizer)();
        self.start_epoch();

        let remaining = self.config.epochs.saturating_sub(epoch).max(1);
        self.schedule = WarmupCosineSchedule::new(self.steps_per_epoch * remaining);
        self.phase = TrainingPhase::Unfrozen;

        log_groups(&self.groups);
        tracing::info!(total_steps = self.schedule.total_steps(), "optimizer and scheduler rebuilt");
        true
    }

    /// Keeps the averaged model as the best checkpoint when `metrics` strictly improves on
    /// the best mIoU so far.
    pub fn record_validation(&mut self, epoch: usize, metrics: &SegmentationMetrics) -> FloodSegResult<bool> {
        if metrics.miou <= self.best_miou {
            return Ok(false);
        }
        self.best_miou = metrics.miou;
        let summary = CheckpointSummary {
            epoch: (!self.resumed).then_some(epoch),
            miou: metrics.miou,
            acc: Some(metrics.accuracy),
        };
        save_checkpoint(
            &best_checkpoint_path(&self.config.save_path()),
            self.averaging.model(),
            summary,
            self.config,
        )?;
        Ok(true)
    }

    /// Validates the shadow model, applies the scheduled unfreeze and the best-checkpoint
    /// decision.
    pub fn finish_epoch(
        &mut self,
        epoch: usize,
        train_loss: f64,
        val_loader: Arc<dyn DataLoader<B::InnerBackend, SegmentationBatch<B::InnerBackend>>>,
    ) -> FloodSegResult<EpochSummary> {
        let label = epoch_label(epoch, self.resumed);
        let metrics = evaluate(self.averaging.model(), val_loader, self.num_classes, &self.heartbeat)?;
        tracing::info!(
            epoch = %label,
            loss = format!("{train_loss:.4}"),
            miou = format!("{:.4}", metrics.miou),
            acc = format!("{:.4}", metrics.accuracy),
            "validation"
        );
        self.heartbeat.burst(HEARTBEAT_BURST);

        self.maybe_unfreeze(epoch);
        let improved = self.record_validation(epoch, &metrics)?;

        Ok(EpochSummary {
            label,
            train_loss,
            metrics,
            improved,
        })
    }

    /// Runs every epoch, then writes the final checkpoint and the optional export.
    pub fn fit(
        &mut self,
        train_loader: Arc<dyn DataLoader<B, SegmentationBatch<B>>>,
        val_loader: Arc<dyn DataLoader<B::InnerBackend, SegmentationBatch<B::InnerBackend>>>,
    ) -> FloodSegResult<FitSummary> {
        let batches = train_loader.num_items().div_ceil(self.config.batch_size.max(1));
        let log_interval = self.config.log_interval();
        let mut epochs = Vec::with_capacity(self.config.epochs);

        tracing::info!(epochs = self.config.epochs, batches, "starting training");
        self.heartbeat.burst(HEARTBEAT_BURST);

        for epoch in 1..=self.config.epochs {
            let label = epoch_label(epoch, self.resumed);
            self.start_epoch();
            let mut running_loss = 0.0;

            for (index, batch) in train_loader.iter().enumerate() {
                let step = index + 1;
                let output = self.train_step(batch)?;
                running_loss += output.loss;

                if step % log_interval == 0 {
                    tracing::info!(
                        epoch = %label,
                        step = format!("{step:04}/{batches:04}"),
                        lr = format!("{:.2e}", output.lr),
                        loss = format!("{:.4}", output.loss),
                        "train"
                    );
                    self.heartbeat.ping();
                }
            }

            let train_loss = running_loss / batches.max(1) as f64;
            epochs.push(self.finish_epoch(epoch, train_loss, val_loader.clone())?);
        }

        self.save_final()?;
        if self.config.export_onnx {
            let size = self.config.image_size;
            self.exporter.export(
                &self.model.valid(),
                [1, 3, size, size],
                Path::new(&self.config.onnx_path),
            )?;
        }

        Ok(FitSummary {
            epochs,
            best_miou: self.best_miou,
        })
    }

    /// Writes the final averaged checkpoint with optimizer and loop state for resume.
    pub fn save_final(&self) -> FloodSegResult<()> {
        let path = final_checkpoint_path(&self.config.save_path());
        let summary = CheckpointSummary {
            epoch: None,
            miou: self.best_miou,
            acc: None,
        };
        save_checkpoint(&path, self.averaging.model(), summary, self.config)?;
        checkpoint::save_optimizer(&self.optimizer, &path)?;
        ResumeState {
            schedule: self.schedule,
            scaler: self.scaler,
            groups: group_layout(&self.groups),
            averaged_updates: self.averaging.updates(),
        }
        .save(&path)
    }

    pub const fn device(&self) -> &B::Device {
        &self.device
    }
}

fn group_layout(groups: &[ParamGroup]) -> Vec<GroupLayout> {
    groups
        .iter()
        .map(|group| GroupLayout {
            name: group.name.clone(),
            params: group.params.len(),
        })
        .collect()
}

fn log_groups(groups: &[ParamGroup]) {
    for group in groups {
        tracing::info!(group = %group.name, params = group.params.len(), lr = group.lr, "parameter group");
    }
}

/// Builds loaders, model and an AdamW trainer from `config`, then trains.
pub fn run<B: AutodiffBackend>(
    config: &TrainingConfig,
    device: B::Device,
    precision: PrecisionPolicy,
) -> FloodSegResult<FitSummary> {
    B::seed(config.seed);

    let train_loader = dataset::train_loader::<B>(config, &device)?;
    let val_loader = dataset::eval_loader::<B::InnerBackend>(config, "val", &device)?;
    let batches = train_loader.num_items().div_ceil(config.batch_size);

    let model = config.model_config()?.init::<B>(&device)?;
    tracing::info!(
        encoder = model.encoder_kind().as_str(),
        params = model.num_params(),
        "model initialized"
    );

    let weight_decay = config.weight_decay as f32;
    let epsilon = precision.optimizer_epsilon();
    let mut trainer = Trainer::new(
        config,
        model,
        batches,
        precision,
        Heartbeat::from_config(config.heartbeat.as_deref()),
        move || {
            AdamWConfig::new()
                .with_weight_decay(weight_decay)
                .with_epsilon(epsilon)
                .init::<B, SegmentationModel<B>>()
        },
        device,
    )?;
    trainer.fit(train_loader, val_loader)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{losses::SegmentationLossConfig, models::ResizeMode};
    use burn::{
        backend::{Autodiff, NdArray},
        optim::AdamWConfig,
    };

    type TestBackend = Autodiff<NdArray>;

    fn tiny_config(save_dir: &Path) -> TrainingConfig {
        TrainingConfig::new()
            .with_num_classes(Some(2))
            .with_embed_dim(32)
            .with_num_heads(2)
            .with_num_layers(1)
            .with_downsample(8)
            .with_image_size(8)
            .with_amp(false)
            .with_heartbeat(None)
            .with_resize_mode(ResizeMode::Nearest)
            .with_save_dir(save_dir.to_string_lossy().into_owned())
    }

    fn trainer<'a>(
        config: &'a TrainingConfig,
        batches: usize,
    ) -> Trainer<'a, TestBackend, impl Optimizer<SegmentationModel<TestBackend>, TestBackend>> {
        let device = Default::default();
        let model = config.model_config().unwrap().init::<TestBackend>(&device).unwrap();
        Trainer::new(
            config,
            model,
            batches,
            PrecisionPolicy::Full,
            Heartbeat::disabled(),
            || AdamWConfig::new().init::<TestBackend, SegmentationModel<TestBackend>>(),
            device,
        )
        .unwrap()
    }

    fn scenario_a_batch() -> SegmentationBatch<TestBackend> {
        let device = Default::default();
        let mut labels = [[0i64; 4]; 4];
        labels[1][2] = 255;
        SegmentationBatch::new(
            Tensor::random([1, 3, 4, 4], burn::tensor::Distribution::Normal(0.0, 1.0), &device),
            Tensor::<TestBackend, 2, Int>::from_ints(labels, &device).unsqueeze::<3>(),
        )
    }

    #[test]
    fn single_step_with_ignored_pixel() {
        let dir = tempfile::tempdir().unwrap();
        let config = tiny_config(dir.path());
        let mut trainer = trainer(&config, 1);
        let batch = scenario_a_batch();

        let before: Vec<f32> = trainer.model().forward(batch.images.clone()).unwrap().into_data().to_vec().unwrap();
        let output = trainer.train_step(batch.clone()).unwrap();
        let after: Vec<f32> = trainer.model().forward(batch.images.clone()).unwrap().into_data().to_vec().unwrap();

        assert!(output.loss.is_finite());
        assert!(output.optimizer_stepped);
        assert!(output.dice.is_some());
        assert_ne!(before, after);
        assert_eq!(trainer.schedule().steps_taken(), 1);

        // The ignored pixel receives no gradient from either loss term.
        let logits = trainer.model().forward(batch.images).unwrap();
        let logits = Tensor::<TestBackend, 4>::from_data(logits.into_data(), &Default::default()).require_grad();
        let losses = SegmentationLossConfig::new().init().forward(logits.clone(), batch.masks);
        let grads = losses.total.backward();
        let grad = logits.grad(&grads).unwrap();

        let ignored: Vec<f32> = grad.clone().slice([0..1, 0..2, 1..2, 2..3]).into_data().to_vec().unwrap();
        assert!(ignored.iter().all(|g| *g == 0.0), "{ignored:?}");
        let labelled: Vec<f32> = grad.slice([0..1, 0..2, 0..1, 0..1]).into_data().to_vec().unwrap();
        assert!(labelled.iter().any(|g| *g != 0.0));
    }

    #[test]
    fn accumulation_delays_the_update() {
        let dir = tempfile::tempdir().unwrap();
        let config = tiny_config(dir.path()).with_grad_accum(2);
        let mut trainer = trainer(&config, 4);

        let first = trainer.train_step(scenario_a_batch()).unwrap();
        let second = trainer.train_step(scenario_a_batch()).unwrap();

        assert!(!first.optimizer_stepped);
        assert!(second.optimizer_stepped);
        assert_eq!(trainer.schedule().steps_taken(), 1);
        assert_eq!(trainer.schedule().total_steps(), 2 * config.epochs);
    }

    #[test]
    fn best_checkpoint_requires_strict_improvement() {
        let dir = tempfile::tempdir().unwrap();
        let config = tiny_config(dir.path());
        let mut trainer = trainer(&config, 1);
        let metrics = |miou| SegmentationMetrics {
            miou,
            accuracy: 0.5,
            per_class_iou: vec![miou; 2],
        };

        assert!(trainer.record_validation(1, &metrics(0.0)).unwrap());
        assert!(!trainer.record_validation(2, &metrics(0.0)).unwrap());
        assert!(trainer.record_validation(3, &metrics(0.3)).unwrap());
        assert_eq!(trainer.best_miou(), 0.3);

        let record = checkpoint::load_checkpoint::<NdArray>(&best_checkpoint_path(dir.path()), &Default::default()).unwrap();
        assert_eq!(record.epoch, Some(3));
        assert_eq!(record.acc, Some(0.5));
    }

    #[test]
    fn final_checkpoint_resumes_with_loop_state() {
        let dir = tempfile::tempdir().unwrap();
        let config = tiny_config(dir.path());
        let mut first = trainer(&config, 1);
        first.train_step(scenario_a_batch()).unwrap();
        first.save_final().unwrap();

        let final_path = final_checkpoint_path(dir.path());
        let resumed_config = tiny_config(dir.path()).with_resume(final_path.to_string_lossy().into_owned());
        let resumed = trainer(&resumed_config, 1);

        assert!(resumed.is_resumed());
        assert_eq!(resumed.schedule().steps_taken(), 1);
        assert_eq!(epoch_label(4, resumed.is_resumed()), "+4");
    }

    #[test]
    fn vanilla_encoder_never_changes_phase() {
        let dir = tempfile::tempdir().unwrap();
        let config = tiny_config(dir.path());
        let mut trainer = trainer(&config, 1);

        assert_eq!(trainer.phase(), TrainingPhase::Static);
        assert!(!trainer.maybe_unfreeze(config.auto_freeze_epochs));
        let names: Vec<_> = trainer.groups().iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, ["head", "encoder"]);
    }

    fn write_pairs(root: &Path, split: &str, stems: &[&str]) {
        use image::{GrayImage, Luma, Rgb, RgbImage};

        let image_dir = root.join(split).join(format!("{split}-org-img"));
        let label_dir = root.join(split).join(format!("{split}-label-img"));
        std::fs::create_dir_all(&image_dir).unwrap();
        std::fs::create_dir_all(&label_dir).unwrap();
        for (index, stem) in stems.iter().enumerate() {
            RgbImage::from_fn(8, 8, |x, y| Rgb([(x * 30) as u8, (y * 30) as u8, 90]))
                .save(image_dir.join(format!("{stem}.jpg")))
                .unwrap();
            GrayImage::from_fn(8, 8, |x, _| Luma([u8::from((x as usize + index) % 2 == 0)]))
                .save(label_dir.join(format!("{stem}_lab.png")))
                .unwrap();
        }
    }

    #[test]
    fn validation_fails_on_undecodable_sample() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        write_pairs(&data, "val", &["2"]);
        std::fs::write(data.join("val/val-org-img/1.jpg"), b"truncated").unwrap();
        image::GrayImage::new(8, 8)
            .save(data.join("val/val-label-img/1_lab.png"))
            .unwrap();

        let config = tiny_config(&dir.path().join("runs"))
            .with_root(data.to_string_lossy().into_owned())
            .with_num_workers(0);
        let trainer = trainer(&config, 1);
        let loader = dataset::eval_loader::<NdArray>(&config, "val", &Default::default()).unwrap();

        let err = evaluate(trainer.averaged_model(), loader, 2, &Heartbeat::disabled()).unwrap_err();
        assert!(matches!(err, crate::FloodSegError::DatasetError { .. }), "{err}");
    }

    #[cfg(feature = "backbone")]
    #[test]
    fn fit_unfreezes_on_schedule_and_writes_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        write_pairs(&data, "train", &["1", "2"]);
        write_pairs(&data, "val", &["1", "2"]);
        let save_dir = dir.path().join("runs");
        let config = tiny_config(&save_dir)
            .with_root(data.to_string_lossy().into_owned())
            .with_encoder(crate::models::EncoderKind::Backbone)
            .with_out_index(0)
            .with_auto_freeze_epochs(1)
            .with_epochs(2)
            .with_batch_size(2)
            .with_grad_accum(1)
            .with_num_workers(0);
        let device = Default::default();
        let train_loader = dataset::train_loader::<TestBackend>(&config, &device).unwrap();
        let val_loader = dataset::eval_loader::<NdArray>(&config, "val", &device).unwrap();

        let mut trainer = trainer(&config, 1);
        let initial: Vec<_> = trainer.groups().iter().map(|g| g.name.clone()).collect();
        assert_eq!(initial, ["head"]);
        assert_eq!(trainer.schedule().total_steps(), 2);

        let summary = trainer.fit(train_loader, val_loader).unwrap();

        assert_eq!(summary.epochs.len(), 2);
        assert_eq!(summary.epochs[0].label, "001");
        assert!(summary.epochs[0].improved);
        assert!(summary.best_miou >= 0.0);
        assert_eq!(trainer.phase(), TrainingPhase::Unfrozen);
        let names: Vec<_> = trainer.groups().iter().map(|g| g.name.clone()).collect();
        assert_eq!(names, ["head", "stage0"]);
        // Rebuilt for the single remaining epoch, then stepped once.
        assert_eq!(trainer.schedule().total_steps(), 1);
        assert_eq!(trainer.schedule().steps_taken(), 1);

        let best = best_checkpoint_path(&save_dir);
        let last = final_checkpoint_path(&save_dir);
        assert!(best.is_file());
        assert!(last.is_file());
        assert!(checkpoint::state_path(&last).is_file());
        let record = checkpoint::load_checkpoint::<NdArray>(&best, &Default::default()).unwrap();
        assert!(record.epoch.is_some());
        let state = ResumeState::load(&last).unwrap();
        assert_eq!(state.groups, group_layout(trainer.groups()));
    }

    #[test]
    fn epoch_labels() {
        assert_eq!(epoch_label(7, false), "007");
        assert_eq!(epoch_label(7, true), "+7");
    }

    #[cfg(feature = "backbone")]
    #[test]
    fn auto_freeze_releases_deepest_stage() {
        let dir = tempfile::tempdir().unwrap();
        let config = tiny_config(dir.path())
            .with_encoder(crate::models::EncoderKind::Backbone)
            .with_out_index(0)
            .with_auto_freeze_epochs(2)
            .with_epochs(5);
        let mut trainer = trainer(&config, 3);

        assert_eq!(trainer.phase(), TrainingPhase::FrozenWarmup);
        let initial: Vec<_> = trainer.groups().iter().map(|g| g.name.clone()).collect();
        assert_eq!(initial, ["head"]);

        assert!(!trainer.maybe_unfreeze(1));
        assert!(trainer.maybe_unfreeze(2));
        assert!(!trainer.maybe_unfreeze(2));

        assert_eq!(trainer.phase(), TrainingPhase::Unfrozen);
        let names: Vec<_> = trainer.groups().iter().map(|g| g.name.clone()).collect();
        assert!(names.contains(&"stage0".to_string()));
        assert!(!initial.contains(&"stage0".to_string()));
        assert_eq!(trainer.schedule().total_steps(), 3 * 3);
        assert_eq!(trainer.schedule().steps_taken(), 0);
    }
}
