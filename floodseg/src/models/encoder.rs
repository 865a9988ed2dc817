use burn::{
    module::{Ignored, Param},
    nn::{
        transformer::{TransformerEncoder, TransformerEncoderConfig, TransformerEncoderInput},
        Initializer,
    },
    prelude::*,
};

use super::blocks::{resize, ConvNormAct, ConvNormActConfig, ResizeMode};
use crate::error::{FloodSegError, FloodSegResult};

#[cfg(feature = "backbone")]
use backbones::{BackboneWrapper, StagedBackbone};

/// Which feature extractor a model is built with.
#[derive(Config, Debug, PartialEq, Eq, Hash)]
pub enum EncoderKind {
    /// Strided convolution stem followed by a transformer over the flattened grid.
    Vanilla,
    /// Registered hierarchical backbone, optionally pretrained.
    Backbone,
}

impl EncoderKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Vanilla => "vanilla",
            Self::Backbone => "backbone",
        }
    }
}

impl std::str::FromStr for EncoderKind {
    type Err = FloodSegError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "vanilla" => Ok(Self::Vanilla),
            "backbone" | "timm" | "swin" => Ok(Self::Backbone),
            other => Err(FloodSegError::InvalidConfiguration {
                reason: format!("unknown encoder '{other}', expected 'vanilla' or 'backbone'"),
            }),
        }
    }
}

/// Number of stride-2 stem blocks for a supported total downsample factor.
pub fn stem_depth(downsample: usize) -> FloodSegResult<usize> {
    match downsample {
        8 => Ok(3),
        16 => Ok(4),
        32 => Ok(5),
        other => Err(FloodSegError::InvalidConfiguration {
            reason: format!("downsample must be one of 8, 16 or 32, got {other}"),
        }),
    }
}

#[derive(Config, Debug)]
pub struct VanillaEncoderConfig {
    #[config(default = "3")]
    pub in_channels: usize,
    #[config(default = "128")]
    pub embed_dim: usize,
    #[config(default = "4")]
    pub num_heads: usize,
    #[config(default = "2")]
    pub num_layers: usize,
    /// Total stride of the stem: 8, 16 or 32.
    #[config(default = "16")]
    pub downsample: usize,
    #[config(default = "2048")]
    pub d_ff: usize,
    #[config(default = "0.1")]
    pub dropout: f64,
    /// Side of the stored positional grid, resized to the feature map at run time.
    #[config(default = "32")]
    pub pos_grid: usize,
    #[config(default = "ResizeMode::Bilinear")]
    pub resize: ResizeMode,
}

impl VanillaEncoderConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> FloodSegResult<VanillaEncoder<B>> {
        let depth = stem_depth(self.downsample)?;
        if self.num_heads == 0 || self.embed_dim % self.num_heads != 0 {
            return Err(FloodSegError::InvalidConfiguration {
                reason: format!(
                    "embed_dim {} must be divisible by num_heads {}",
                    self.embed_dim, self.num_heads
                ),
            });
        }

        let widths = [64, 128, self.embed_dim];
        let mut in_channels = self.in_channels;
        let stem = (0..depth)
            .map(|i| {
                let out_channels = widths[i.min(2)];
                let block = ConvNormActConfig::new(in_channels, out_channels)
                    .with_stride(2)
                    .init(device);
                in_channels = out_channels;
                block
            })
            .collect();

        let pos_embed = Initializer::Normal {
            mean: 0.0,
            std: 1.0,
        }
        .init([1, self.embed_dim, self.pos_grid, self.pos_grid], device);

        let transformer =
            TransformerEncoderConfig::new(self.embed_dim, self.d_ff, self.num_heads, self.num_layers)
                .with_dropout(self.dropout)
                .with_norm_first(false)
                .init(device);

        Ok(VanillaEncoder {
            stem,
            pos_embed,
            transformer,
            embed_dim: self.embed_dim,
            resize: Ignored(self.resize.clone()),
        })
    }
}

/// Convolution stem plus a global self-attention stack over the stem's output grid.
#[derive(Module, Debug)]
pub struct VanillaEncoder<B: Backend> {
    stem: Vec<ConvNormAct<B>>,
    pos_embed: Param<Tensor<B, 4>>,
    transformer: TransformerEncoder<B>,
    embed_dim: usize,
    resize: Ignored<ResizeMode>,
}

impl<B: Backend> VanillaEncoder<B> {
    /// `[b, 3, H, W]` -> `[b, embed_dim, H / downsample, W / downsample]`.
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.stem.iter().fold(x, |x, block| block.forward(x));
        let [b, c, h, w] = x.dims();

        let pos = resize(self.pos_embed.val(), [h, w], &self.resize.0);
        let tokens = (x + pos).flatten::<3>(2, 3).swap_dims(1, 2);
        let tokens = self.transformer.forward(TransformerEncoderInput::new(tokens));

        tokens.swap_dims(1, 2).reshape([b, c, h, w])
    }

    pub const fn embed_dim(&self) -> usize {
        self.embed_dim
    }
}

pub(crate) fn missing_backbone() -> FloodSegError {
    FloodSegError::CapabilityUnavailable {
        capability: "backbone encoder".into(),
        hint: "rebuild floodseg with the `backbone` feature or use the vanilla encoder".into(),
    }
}

/// Hierarchical backbone selection.
#[derive(Config, Debug)]
pub struct BackboneEncoderConfig {
    #[config(default = "\"swin_tiny_patch4_window7_224\".to_string()")]
    pub model_id: String,
    /// Deepest stage consumed; up to two shallower stages are fused with it.
    #[config(default = "3")]
    pub out_index: usize,
    /// Local PyTorch checkpoint with pretrained weights.
    #[config(default = "None")]
    pub weights: Option<String>,
}

impl BackboneEncoderConfig {
    fn weights_path(&self) -> Option<&str> {
        self.weights.as_deref().filter(|path| !path.is_empty())
    }

    /// Fails when the build cannot honour this selection.
    pub fn check_capability(&self) -> FloodSegResult<()> {
        if cfg!(not(feature = "backbone")) {
            return Err(missing_backbone());
        }
        if self.weights_path().is_some() && cfg!(not(feature = "pretrained")) {
            return Err(FloodSegError::CapabilityUnavailable {
                capability: "pretrained backbone weights".into(),
                hint: "rebuild floodseg with the `pretrained` feature".into(),
            });
        }
        Ok(())
    }

    #[cfg(feature = "backbone")]
    pub fn init<B: Backend>(&self, device: &B::Device) -> FloodSegResult<BackboneWrapper<B>> {
        self.check_capability()?;
        let backbone = backbones::create_backbone(&self.model_id, self.out_index, device)?;

        #[cfg(feature = "pretrained")]
        if let Some(path) = self.weights_path() {
            let backbone = backbones::load_pretrained(backbone, std::path::Path::new(path), device)?;
            tracing::info!(model = %self.model_id, path, "loaded pretrained backbone");
            return Ok(backbone);
        }

        Ok(backbone)
    }
}

/// The feature extractor chosen at construction time.
#[derive(Module, Debug)]
pub enum FeatureExtractor<B: Backend> {
    Vanilla(VanillaEncoder<B>),
    #[cfg(feature = "backbone")]
    Backbone(BackboneWrapper<B>),
}

impl<B: Backend> FeatureExtractor<B> {
    /// Feature maps, shallow to deep. The vanilla encoder yields exactly one.
    pub fn forward(&self, x: Tensor<B, 4>) -> Vec<Tensor<B, 4>> {
        match self {
            Self::Vanilla(encoder) => vec![encoder.forward(x)],
            #[cfg(feature = "backbone")]
            Self::Backbone(backbone) => backbone.forward_features(x),
        }
    }

    /// Channel counts matching [`forward`](Self::forward).
    pub fn out_channels(&self) -> Vec<usize> {
        match self {
            Self::Vanilla(encoder) => vec![encoder.embed_dim()],
            #[cfg(feature = "backbone")]
            Self::Backbone(backbone) => backbone.out_channels(),
        }
    }

    pub fn kind(&self) -> EncoderKind {
        match self {
            Self::Vanilla(_) => EncoderKind::Vanilla,
            #[cfg(feature = "backbone")]
            Self::Backbone(_) => EncoderKind::Backbone,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::{backend::NdArray, tensor::Distribution};

    type TestBackend = NdArray;

    fn small_config() -> VanillaEncoderConfig {
        VanillaEncoderConfig::new()
            .with_embed_dim(32)
            .with_num_heads(4)
            .with_num_layers(1)
            .with_d_ff(64)
            .with_pos_grid(4)
    }

    #[test]
    fn stem_reduces_by_downsample() {
        let device = Default::default();
        for (downsample, side) in [(8, 8), (16, 4), (32, 2)] {
            let encoder = small_config()
                .with_downsample(downsample)
                .init::<TestBackend>(&device)
                .unwrap();
            let x = Tensor::<TestBackend, 4>::random([2, 3, 64, 64], Distribution::Normal(0.0, 1.0), &device);

            assert_eq!(encoder.forward(x).dims(), [2, 32, side, side]);
        }
    }

    #[test]
    fn unsupported_downsample_is_rejected() {
        let device = Default::default();
        let err = small_config()
            .with_downsample(4)
            .init::<TestBackend>(&device)
            .unwrap_err();

        assert!(matches!(err, FloodSegError::InvalidConfiguration { .. }));
    }

    #[test]
    fn encoder_kind_parses_aliases() {
        assert_eq!("Vanilla".parse::<EncoderKind>().unwrap(), EncoderKind::Vanilla);
        assert_eq!("timm".parse::<EncoderKind>().unwrap(), EncoderKind::Backbone);
        assert!("resnet".parse::<EncoderKind>().is_err());
    }

    #[cfg(not(feature = "backbone"))]
    #[test]
    fn backbone_capability_missing() {
        assert!(matches!(
            BackboneEncoderConfig::new().check_capability(),
            Err(FloodSegError::CapabilityUnavailable { .. })
        ));
    }

    #[cfg(all(feature = "backbone", not(feature = "pretrained")))]
    #[test]
    fn pretrained_weights_need_feature() {
        let config = BackboneEncoderConfig::new().with_weights(Some("swin_tiny.pth".into()));

        assert!(matches!(
            config.check_capability(),
            Err(FloodSegError::CapabilityUnavailable { .. })
        ));
        assert!(BackboneEncoderConfig::new()
            .with_weights(Some(String::new()))
            .check_capability()
            .is_ok());
    }
}
