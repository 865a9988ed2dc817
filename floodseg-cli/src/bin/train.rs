//! Segmentation training entry point.
//!
//! ## Usage
//!
//! ```bash
//! # Train the vanilla CNN + transformer encoder on FloodNet
//! cargo run --bin train -- --root FloodNet-Supervised_v1.0
//!
//! # Swin backbone with a frozen warm-up, on RescueNet, using the GPU
//! cargo run --bin train --no-default-features --features wgpu -- \
//!     --dataset rescuenet --encoder swin --auto-freeze-epochs 8
//!
//! # Start from a JSON configuration and override a few fields
//! cargo run --bin train -- --config run.json --epochs 10
//! ```

use std::path::PathBuf;

use anyhow::{ensure, Context, Result};
use burn::backend::Autodiff;
use clap::Parser;
use floodseg::{
    metadata, models::ResizeMode, precision::PrecisionPolicy, training::FitSummary, EncoderKind,
    TrainingConfig,
};
use floodseg_cli::{
    create_device, get_backend_name, platform, supports_reduced_precision, HalfBackend,
    SelectedBackend,
};
use tracing_subscriber::EnvFilter;

const CLI_BATCH_SIZE: usize = 32;
const CLI_EPOCHS: usize = 40;
const CLI_NUM_WORKERS: usize = 8;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON configuration to start from
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write the resolved configuration to this path and exit
    #[arg(long)]
    save_config: Option<PathBuf>,

    /// List the known datasets and exit
    #[arg(long)]
    list_datasets: bool,

    /// Dataset root containing the train/val/test splits
    #[arg(long)]
    root: Option<String>,

    /// Dataset catalog key
    #[arg(long)]
    dataset: Option<String>,

    #[arg(long)]
    image_size: Option<usize>,

    /// Override the class count from the dataset catalog
    #[arg(long)]
    num_classes: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    lr: Option<f64>,

    #[arg(long)]
    weight_decay: Option<f64>,

    /// Micro-batches accumulated per optimizer step
    #[arg(long)]
    grad_accum_steps: Option<usize>,

    #[arg(long)]
    num_workers: Option<usize>,

    /// Train in full precision
    #[arg(long)]
    no_amp: bool,

    #[arg(long)]
    save_dir: Option<String>,

    /// Skip ImageNet mean/std normalization
    #[arg(long)]
    no_imagenet_norm: bool,

    #[arg(long)]
    embed_dim: Option<usize>,

    #[arg(long)]
    num_heads: Option<usize>,

    #[arg(long)]
    num_layers: Option<usize>,

    /// Stem stride of the vanilla encoder
    #[arg(long, value_parser = ["8", "16", "32"])]
    downsample: Option<String>,

    /// Write an inference bundle after training
    #[arg(long)]
    export_onnx: bool,

    #[arg(long)]
    onnx_path: Option<String>,

    /// Checkpoint to resume from
    #[arg(long)]
    resume: Option<String>,

    /// Weight of the dice term; 0 disables it
    #[arg(long)]
    dice_weight: Option<f64>,

    /// Encoder family: vanilla or swin
    #[arg(long)]
    encoder: Option<EncoderKind>,

    /// Backbone model identifier
    #[arg(long)]
    swin_model: Option<String>,

    /// Backbone stage whose features feed the decoder
    #[arg(long)]
    swin_out_index: Option<usize>,

    /// Pretrained backbone weights to load
    #[arg(long)]
    backbone_weights: Option<String>,

    /// Keep the backbone frozen for the whole run
    #[arg(long)]
    freeze_backbone: bool,

    /// Epochs before the deepest backbone stage is released; 0 trains everything
    #[arg(long)]
    auto_freeze_epochs: Option<usize>,

    /// Train the backbone at the base learning rate
    #[arg(long)]
    no_layerwise_backbone_lr: bool,

    #[arg(long)]
    seed: Option<u64>,

    /// UDP address that receives liveness pings
    #[arg(long)]
    heartbeat: Option<String>,

    #[arg(long, conflicts_with = "heartbeat")]
    no_heartbeat: bool,

    /// Skip images without a label instead of failing
    #[arg(long)]
    lenient_pairs: bool,

    /// Nearest-neighbour decoder upsampling
    #[arg(long)]
    nearest_resize: bool,
}

impl Args {
    fn base_config(&self) -> Result<TrainingConfig> {
        match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file: {}", path.display()))?;
                serde_json::from_str::<TrainingConfig>(&text)
                    .with_context(|| format!("Failed to parse config file: {}", path.display()))
            }
            None => Ok(TrainingConfig::new()
                .with_batch_size(CLI_BATCH_SIZE)
                .with_epochs(CLI_EPOCHS)
                .with_num_workers(CLI_NUM_WORKERS)),
        }
    }

    fn into_config(self) -> Result<TrainingConfig> {
        let mut config = self.base_config()?;

        if let Some(root) = self.root {
            config.root = root;
        }
        if let Some(dataset) = self.dataset {
            config.dataset = dataset;
        }
        if let Some(image_size) = self.image_size {
            config.image_size = image_size;
        }
        if self.num_classes.is_some() {
            config.num_classes = self.num_classes;
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(epochs) = self.epochs {
            config.epochs = epochs;
        }
        if let Some(lr) = self.lr {
            config.lr = lr;
        }
        if let Some(weight_decay) = self.weight_decay {
            config.weight_decay = weight_decay;
        }
        if let Some(grad_accum) = self.grad_accum_steps {
            config.grad_accum = grad_accum;
        }
        if let Some(num_workers) = self.num_workers {
            config.num_workers = num_workers;
        }
        if let Some(save_dir) = self.save_dir {
            config.save_dir = save_dir;
        }
        if let Some(embed_dim) = self.embed_dim {
            config.embed_dim = embed_dim;
        }
        if let Some(num_heads) = self.num_heads {
            config.num_heads = num_heads;
        }
        if let Some(num_layers) = self.num_layers {
            config.num_layers = num_layers;
        }
        if let Some(downsample) = self.downsample {
            config.downsample = downsample
                .parse()
                .with_context(|| format!("Invalid downsample factor: {downsample}"))?;
        }
        if let Some(onnx_path) = self.onnx_path {
            config.onnx_path = onnx_path;
        }
        if let Some(resume) = self.resume {
            config.resume = resume;
        }
        if let Some(dice_weight) = self.dice_weight {
            config.dice_weight = dice_weight;
        }
        if let Some(encoder) = self.encoder {
            config.encoder = encoder;
        }
        if let Some(model) = self.swin_model {
            config.backbone_model = model;
        }
        if let Some(out_index) = self.swin_out_index {
            config.out_index = out_index;
        }
        if self.backbone_weights.is_some() {
            config.backbone_weights = self.backbone_weights;
        }
        if let Some(epochs) = self.auto_freeze_epochs {
            config.auto_freeze_epochs = epochs;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if let Some(addr) = self.heartbeat {
            config.heartbeat = Some(addr);
        }
        if self.no_heartbeat {
            config.heartbeat = None;
        }

        config.amp &= !self.no_amp;
        config.imagenet_norm &= !self.no_imagenet_norm;
        config.export_onnx |= self.export_onnx;
        config.freeze_backbone |= self.freeze_backbone;
        config.layerwise_backbone_lr &= !self.no_layerwise_backbone_lr;
        config.strict_pairs &= !self.lenient_pairs;
        if self.nearest_resize {
            config.resize_mode = ResizeMode::Nearest;
        }

        Ok(config)
    }
}

fn train(config: &TrainingConfig, precision: PrecisionPolicy) -> Result<FitSummary> {
    let device = create_device();
    let summary = match precision {
        PrecisionPolicy::Mixed => floodseg::run::<Autodiff<HalfBackend>>(config, device, precision),
        PrecisionPolicy::Full => {
            floodseg::run::<Autodiff<SelectedBackend>>(config, device, precision)
        }
    };
    summary.context("Training failed")
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();

    if args.list_datasets {
        for key in metadata::list_datasets() {
            let meta = metadata::dataset_metadata(key)?;
            println!("{key}\t{} classes\t{}", meta.num_classes(), meta.default_root);
        }
        return Ok(());
    }

    let save_config = args.save_config.clone();
    let mut config = args.into_config()?;
    config.jetson |= platform::is_jetson();
    let config = config.resolve().context("Invalid training configuration")?;

    if let Some(path) = save_config {
        std::fs::write(&path, config.to_json()?)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        tracing::info!(path = %path.display(), "configuration written");
        return Ok(());
    }

    ensure!(
        std::path::Path::new(&config.root).is_dir(),
        "Dataset root does not exist: {}",
        config.root
    );

    let precision =
        PrecisionPolicy::resolve(config.amp, supports_reduced_precision(), get_backend_name());

    tracing::info!(
        backend = get_backend_name(),
        jetson = config.jetson,
        ?precision,
        dataset = %config.dataset,
        root = %config.root,
        encoder = config.encoder.as_str(),
        classes = ?config.num_classes,
        batch_size = config.batch_size,
        epochs = config.epochs,
        lr = config.lr,
        heartbeat = config.heartbeat.as_deref().unwrap_or("off"),
        "starting training"
    );

    let summary = train(&config, precision)?;
    tracing::info!(
        epochs = summary.epochs.len(),
        best_miou = summary.best_miou,
        save_dir = %config.save_dir,
        "training finished"
    );

    Ok(())
}
