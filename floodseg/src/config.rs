//! Run configuration.

use std::path::{Path, PathBuf};

use burn::config::Config;

use crate::{
    averaging::AveragingStrategy,
    error::{FloodSegError, FloodSegResult},
    losses::{SegmentationLossConfig, IGNORE_INDEX},
    metadata,
    models::{
        stem_depth, BackboneEncoderConfig, EncoderKind, ResizeMode, SegmentationModelConfig,
        VanillaEncoderConfig, NORM_GROUPS,
    },
    telemetry::DEFAULT_HEARTBEAT_ADDR,
};

pub const DEFAULT_ROOT: &str = "FloodNet-Supervised_v1.0";
pub const DEFAULT_DATASET: &str = "floodnet";

/// Every hyperparameter of a training run.
///
/// Built once from defaults and overrides, checked with [`TrainingConfig::resolve`], then
/// passed by reference. Serialized as JSON with [`Config::save`] and [`Config::load`].
#[derive(Config, Debug)]
pub struct TrainingConfig {
    /// Dataset root directory.
    #[config(default = "DEFAULT_ROOT.to_string()")]
    pub root: String,
    /// Key into the dataset catalog.
    #[config(default = "DEFAULT_DATASET.to_string()")]
    pub dataset: String,
    /// Side of the square training crops.
    #[config(default = 512)]
    pub image_size: usize,
    /// Filled from the catalog when absent.
    #[config(default = "None")]
    pub num_classes: Option<usize>,
    #[config(default = 4)]
    pub batch_size: usize,
    #[config(default = 20)]
    pub epochs: usize,
    #[config(default = 5e-4)]
    pub lr: f64,
    #[config(default = 1e-4)]
    pub weight_decay: f64,
    /// Batches accumulated per optimizer step.
    #[config(default = 1)]
    pub grad_accum: usize,
    #[config(default = 2)]
    pub num_workers: usize,
    /// Mixed precision, honoured only on capable backends.
    #[config(default = true)]
    pub amp: bool,
    #[config(default = "\"checkpoints_cnnxformer\".to_string()")]
    pub save_dir: String,
    #[config(default = true)]
    pub imagenet_norm: bool,

    #[config(default = 128)]
    pub embed_dim: usize,
    #[config(default = 4)]
    pub num_heads: usize,
    #[config(default = 2)]
    pub num_layers: usize,
    #[config(default = 16)]
    pub downsample: usize,

    #[config(default = false)]
    pub export_onnx: bool,
    #[config(default = "\"cnn_transformer_seg.onnx\".to_string()")]
    pub onnx_path: String,
    /// Checkpoint to resume from; empty starts from scratch.
    #[config(default = "String::new()")]
    pub resume: String,
    #[config(default = 0.5)]
    pub dice_weight: f64,

    #[config(default = "EncoderKind::Vanilla")]
    pub encoder: EncoderKind,
    #[config(default = "\"swin_tiny_patch4_window7_224\".to_string()")]
    pub backbone_model: String,
    #[config(default = 3)]
    pub out_index: usize,
    /// Local PyTorch checkpoint with pretrained backbone weights.
    #[config(default = "None")]
    pub backbone_weights: Option<String>,
    #[config(default = false)]
    pub freeze_backbone: bool,
    /// Epochs with a frozen backbone before the deepest stage is released; `0` disables.
    #[config(default = 8)]
    pub auto_freeze_epochs: usize,
    #[config(default = true)]
    pub layerwise_backbone_lr: bool,

    #[config(default = 42)]
    pub seed: u64,
    /// Set by platform detection before the run starts.
    #[config(default = false)]
    pub jetson: bool,
    /// UDP heartbeat target; `None` disables it.
    #[config(default = "Some(DEFAULT_HEARTBEAT_ADDR.to_string())")]
    pub heartbeat: Option<String>,
    /// Fail on images without a label instead of skipping them.
    #[config(default = true)]
    pub strict_pairs: bool,
    #[config(default = "ResizeMode::Bilinear")]
    pub resize_mode: ResizeMode,
    #[config(default = "AveragingStrategy::RunningMean")]
    pub averaging: AveragingStrategy,
}

fn invalid(reason: impl Into<String>) -> FloodSegError {
    FloodSegError::InvalidConfiguration {
        reason: reason.into(),
    }
}

impl TrainingConfig {
    /// Applies catalog-derived values and validates the result.
    pub fn resolve(mut self) -> FloodSegResult<Self> {
        let meta = metadata::dataset_metadata(&self.dataset)?;
        self.dataset = meta.key.to_string();
        if meta.key != DEFAULT_DATASET && self.root == DEFAULT_ROOT {
            self.root = meta.default_root.to_string();
        }
        if self.num_classes.is_none() {
            self.num_classes = Some(meta.num_classes());
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> FloodSegResult<()> {
        let num_classes = self.classes()?;
        if num_classes == 0 || num_classes as i64 >= IGNORE_INDEX {
            return Err(invalid(format!(
                "num_classes must be in 1..{IGNORE_INDEX}, got {num_classes}"
            )));
        }
        for (name, value) in [
            ("batch_size", self.batch_size),
            ("epochs", self.epochs),
            ("grad_accum", self.grad_accum),
            ("image_size", self.image_size),
        ] {
            if value == 0 {
                return Err(invalid(format!("{name} must be at least 1")));
            }
        }
        if !self.lr.is_finite() || self.lr <= 0.0 {
            return Err(invalid(format!("lr must be positive, got {}", self.lr)));
        }
        if !self.dice_weight.is_finite() || self.dice_weight < 0.0 {
            return Err(invalid(format!(
                "dice_weight must be non-negative, got {}",
                self.dice_weight
            )));
        }

        match self.encoder {
            EncoderKind::Vanilla => {
                stem_depth(self.downsample)?;
                if self.num_heads == 0 || self.embed_dim % self.num_heads != 0 {
                    return Err(invalid(format!(
                        "embed_dim {} must be divisible by num_heads {}",
                        self.embed_dim, self.num_heads
                    )));
                }
                if self.embed_dim % (2 * NORM_GROUPS) != 0 {
                    return Err(invalid(format!(
                        "embed_dim {} must be divisible by {}",
                        self.embed_dim,
                        2 * NORM_GROUPS
                    )));
                }
            }
            EncoderKind::Backbone => self.backbone_config().check_capability()?,
        }

        let stride = self.encoder_stride();
        if self.image_size % stride != 0 {
            return Err(invalid(format!(
                "image_size {} must be divisible by the encoder stride {stride}",
                self.image_size
            )));
        }
        Ok(())
    }

    /// Class count, from the config or the catalog.
    pub fn classes(&self) -> FloodSegResult<usize> {
        match self.num_classes {
            Some(n) => Ok(n),
            None => metadata::num_classes(&self.dataset),
        }
    }

    /// Total stride of the deepest feature map consumed by the decoder.
    pub fn encoder_stride(&self) -> usize {
        match self.encoder {
            EncoderKind::Vanilla => self.downsample,
            EncoderKind::Backbone => 4 << self.out_index.min(3),
        }
    }

    pub fn validation_batch_size(&self) -> usize {
        (self.batch_size / 2).max(1)
    }

    /// Optimizer steps between step log lines.
    pub const fn log_interval(&self) -> usize {
        if self.jetson {
            10
        } else {
            1
        }
    }

    pub fn resume_path(&self) -> Option<&Path> {
        (!self.resume.is_empty()).then(|| Path::new(&self.resume))
    }

    pub fn save_path(&self) -> PathBuf {
        PathBuf::from(&self.save_dir)
    }

    fn backbone_config(&self) -> BackboneEncoderConfig {
        BackboneEncoderConfig::new()
            .with_model_id(self.backbone_model.clone())
            .with_out_index(self.out_index)
            .with_weights(self.backbone_weights.clone())
    }

    pub fn model_config(&self) -> FloodSegResult<SegmentationModelConfig> {
        let vanilla = VanillaEncoderConfig::new()
            .with_embed_dim(self.embed_dim)
            .with_num_heads(self.num_heads)
            .with_num_layers(self.num_layers)
            .with_downsample(self.downsample);

        Ok(SegmentationModelConfig::new(self.classes()?)
            .with_encoder(self.encoder.clone())
            .with_vanilla(vanilla)
            .with_backbone(self.backbone_config())
            .with_freeze_backbone(self.freeze_backbone)
            .with_resize(self.resize_mode.clone()))
    }

    pub fn loss_config(&self) -> SegmentationLossConfig {
        SegmentationLossConfig::new()
            .with_dice_weight(self.dice_weight)
            .with_ignore_index(IGNORE_INDEX)
    }

    /// Flat JSON rendering stored inside checkpoints.
    pub fn to_json(&self) -> FloodSegResult<String> {
        serde_json::to_string(self).map_err(|err| FloodSegError::CheckpointError {
            reason: format!("cannot serialize configuration: {err}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_resolve_against_catalog() {
        let config = TrainingConfig::new().resolve().unwrap();

        assert_eq!(config.num_classes, Some(10));
        assert_eq!(config.root, DEFAULT_ROOT);
        assert_eq!(config.validation_batch_size(), 2);
        assert_eq!(config.log_interval(), 1);
        assert!(config.resume_path().is_none());
    }

    #[test]
    fn other_dataset_uses_its_root() {
        let config = TrainingConfig::new()
            .with_dataset("RescueNet".into())
            .resolve()
            .unwrap();

        assert_eq!(config.dataset, "rescuenet");
        assert_eq!(config.root, "RescueNet");
        assert_eq!(config.num_classes, Some(11));
    }

    #[test]
    fn explicit_root_is_kept() {
        let config = TrainingConfig::new()
            .with_dataset("rescuenet".into())
            .with_root("/data/rn".into())
            .resolve()
            .unwrap();
        assert_eq!(config.root, "/data/rn");
    }

    #[test]
    fn rejects_bad_values() {
        assert!(TrainingConfig::new().with_downsample(4).resolve().is_err());
        assert!(TrainingConfig::new().with_embed_dim(130).resolve().is_err());
        assert!(TrainingConfig::new().with_embed_dim(136).resolve().is_err());
        assert!(TrainingConfig::new().with_image_size(500).resolve().is_err());
        assert!(TrainingConfig::new().with_grad_accum(0).resolve().is_err());
        assert!(TrainingConfig::new().with_dice_weight(-1.0).resolve().is_err());
        assert!(TrainingConfig::new().with_num_classes(Some(255)).resolve().is_err());
        assert!(matches!(
            TrainingConfig::new().with_dataset("cityscapes".into()).resolve(),
            Err(FloodSegError::UnknownDataset { .. })
        ));
    }

    #[test]
    fn jetson_logs_every_tenth_step() {
        let config = TrainingConfig::new().with_jetson(true);
        assert_eq!(config.log_interval(), 10);
    }

    #[test]
    fn json_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = TrainingConfig::new().with_epochs(3).with_encoder(EncoderKind::Backbone);

        config.save(&path).unwrap();
        let loaded = TrainingConfig::load(&path).unwrap();

        assert_eq!(loaded.epochs, 3);
        assert_eq!(loaded.encoder, EncoderKind::Backbone);
        assert_eq!(loaded.heartbeat.as_deref(), Some(DEFAULT_HEARTBEAT_ADDR));
    }

    #[test]
    fn model_config_carries_encoder_settings() {
        let model = TrainingConfig::new()
            .with_embed_dim(64)
            .with_downsample(8)
            .model_config()
            .unwrap();

        assert_eq!(model.num_classes, 10);
        assert_eq!(model.vanilla.embed_dim, 64);
        assert_eq!(model.vanilla.downsample, 8);
    }
}
