use burn::{
    module::{Ignored, ModuleVisitor},
    prelude::*,
};

use super::{
    blocks::{resize, ResizeMode},
    encoder::{BackboneEncoderConfig, EncoderKind, FeatureExtractor, VanillaEncoderConfig},
    head::{SegmentationHead, SegmentationHeadConfig},
    neck::{FpnNeck, FpnNeckConfig},
};
use crate::error::{FloodSegError, FloodSegResult};

#[cfg(feature = "backbone")]
use backbones::{BackboneWrapper, StagedBackbone};

/// Encoder, optional fusion neck and atrous decoder.
#[derive(Config, Debug)]
pub struct SegmentationModelConfig {
    pub num_classes: usize,
    #[config(default = "EncoderKind::Vanilla")]
    pub encoder: EncoderKind,
    #[config(default = "VanillaEncoderConfig::new()")]
    pub vanilla: VanillaEncoderConfig,
    #[config(default = "BackboneEncoderConfig::new()")]
    pub backbone: BackboneEncoderConfig,
    /// Keep every backbone parameter frozen for the whole run.
    #[config(default = "false")]
    pub freeze_backbone: bool,
    #[config(default = "ResizeMode::Bilinear")]
    pub resize: ResizeMode,
}

impl SegmentationModelConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> FloodSegResult<SegmentationModel<B>> {
        if self.num_classes == 0 {
            return Err(FloodSegError::InvalidConfiguration {
                reason: "num_classes must be at least 1".into(),
            });
        }

        let encoder = match self.encoder {
            EncoderKind::Vanilla => FeatureExtractor::Vanilla(
                self.vanilla
                    .clone()
                    .with_resize(self.resize.clone())
                    .init(device)?,
            ),
            EncoderKind::Backbone => self.init_backbone(device)?,
        };

        let channels = encoder.out_channels();
        let width = *channels
            .last()
            .ok_or_else(|| FloodSegError::InvalidConfiguration {
                reason: "encoder produces no feature maps".into(),
            })?;
        let neck = if channels.len() > 1 {
            Some(
                FpnNeckConfig::new(channels, width)
                    .with_resize(self.resize.clone())
                    .init(device)?,
            )
        } else {
            None
        };

        Ok(SegmentationModel {
            encoder,
            neck,
            head: SegmentationHeadConfig::new(width, self.num_classes).init(device),
            num_classes: self.num_classes,
            resize: Ignored(self.resize.clone()),
        })
    }

    #[cfg(feature = "backbone")]
    fn init_backbone<B: Backend>(&self, device: &B::Device) -> FloodSegResult<FeatureExtractor<B>> {
        let backbone = self.backbone.init(device)?;
        let backbone = if self.freeze_backbone {
            backbone.with_trainable(false, None)
        } else {
            backbone
        };
        Ok(FeatureExtractor::Backbone(backbone))
    }

    #[cfg(not(feature = "backbone"))]
    fn init_backbone<B: Backend>(&self, _device: &B::Device) -> FloodSegResult<FeatureExtractor<B>> {
        Err(super::encoder::missing_backbone())
    }
}

#[derive(Module, Debug)]
pub struct SegmentationModel<B: Backend> {
    encoder: FeatureExtractor<B>,
    neck: Option<FpnNeck<B>>,
    head: SegmentationHead<B>,
    num_classes: usize,
    resize: Ignored<ResizeMode>,
}

impl<B: Backend> SegmentationModel<B> {
    /// `[b, 3, H, W]` -> logits `[b, num_classes, H, W]`.
    pub fn forward(&self, images: Tensor<B, 4>) -> FloodSegResult<Tensor<B, 4>> {
        let [_, _, h, w] = images.dims();
        let mut features = self.encoder.forward(images);

        let fused = match &self.neck {
            Some(neck) => neck.forward(features)?,
            None => features.pop().ok_or_else(|| FloodSegError::InvalidTensorShape {
                expected: "one feature map".into(),
                actual: "none".into(),
            })?,
        };
        let logits = self.head.forward(fused)?;

        Ok(resize(logits, [h, w], &self.resize.0))
    }

    pub const fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn encoder_kind(&self) -> EncoderKind {
        self.encoder.kind()
    }

    pub const fn encoder(&self) -> &FeatureExtractor<B> {
        &self.encoder
    }

    /// Visits the neck and decoder parameters.
    pub fn visit_decoder<V: ModuleVisitor<B>>(&self, visitor: &mut V) {
        if let Some(neck) = &self.neck {
            neck.visit(visitor);
        }
        self.head.visit(visitor);
    }

    #[cfg(feature = "backbone")]
    pub fn backbone(&self) -> Option<&BackboneWrapper<B>> {
        match &self.encoder {
            FeatureExtractor::Backbone(backbone) => Some(backbone),
            FeatureExtractor::Vanilla(_) => None,
        }
    }

    /// Toggles gradient tracking on the whole backbone, or on the listed stages only. Models
    /// without a backbone are returned unchanged.
    pub fn with_backbone_trainable(mut self, trainable: bool, stages: Option<&[usize]>) -> Self {
        #[cfg(feature = "backbone")]
        {
            self.encoder = match self.encoder {
                FeatureExtractor::Backbone(backbone) => {
                    FeatureExtractor::Backbone(backbone.with_trainable(trainable, stages))
                }
                other => other,
            };
        }
        #[cfg(not(feature = "backbone"))]
        let _ = (trainable, stages);
        self
    }
}
