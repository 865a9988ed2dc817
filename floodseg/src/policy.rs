//! Learning-rate groups and backbone freezing.

use burn::{
    module::{ModuleVisitor, ParamId},
    prelude::*,
};

use crate::models::{EncoderKind, FeatureExtractor, SegmentationModel};

#[cfg(feature = "backbone")]
use backbones::StagedBackbone;

/// Stage multipliers under the layerwise policy, shallow to deep.
pub const LAYERWISE_STAGE_MULTIPLIERS: [f64; 4] = [0.02, 0.05, 0.10, 0.20];
/// Layerwise multiplier for stages past the table.
pub const LAYERWISE_FALLBACK_MULTIPLIER: f64 = 0.05;
/// Multiplier of every stage when the layerwise policy is off.
pub const UNIFORM_STAGE_MULTIPLIER: f64 = 0.10;
/// Multiplier of backbone parameters that belong to no stage.
pub const RESIDUAL_BACKBONE_MULTIPLIER: f64 = 0.1;
/// Multiplier of the vanilla encoder, which has no stage structure.
pub const UNSTAGED_ENCODER_MULTIPLIER: f64 = 0.1;

pub fn stage_multiplier(stage: usize, layerwise: bool) -> f64 {
    if layerwise {
        LAYERWISE_STAGE_MULTIPLIERS
            .get(stage)
            .copied()
            .unwrap_or(LAYERWISE_FALLBACK_MULTIPLIER)
    } else {
        UNIFORM_STAGE_MULTIPLIER
    }
}

/// Named set of parameters sharing one learning rate.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamGroup {
    pub name: String,
    pub params: Vec<ParamId>,
    pub lr: f64,
}

impl ParamGroup {
    fn new(name: impl Into<String>, params: Vec<ParamId>, lr: f64) -> Self {
        Self {
            name: name.into(),
            params,
            lr,
        }
    }
}

#[derive(Default)]
struct TrainableIds(Vec<ParamId>);

impl<B: Backend> ModuleVisitor<B> for TrainableIds {
    fn visit_float<const D: usize>(&mut self, id: ParamId, tensor: &Tensor<B, D>) {
        if tensor.is_require_grad() {
            self.0.push(id);
        }
    }
}

/// Ids of every parameter of `module` that currently requires gradients.
pub fn trainable_param_ids<B: Backend, M: Module<B>>(module: &M) -> Vec<ParamId> {
    let mut ids = TrainableIds::default();
    module.visit(&mut ids);
    ids.0
}

/// Partitions the trainable parameters of `model` into learning-rate groups.
///
/// Order: `head` (neck and decoder, base rate), `encoder` (vanilla encoder at the reduced
/// rate), `stage{i}` per backbone stage, `backbone` (backbone parameters outside any stage).
/// Empty groups are dropped; when nothing qualifies a single `all` group at the base rate is
/// returned.
pub fn build_param_groups<B: Backend>(
    model: &SegmentationModel<B>,
    base_lr: f64,
    #[cfg_attr(not(feature = "backbone"), allow(unused_variables))] layerwise: bool,
) -> Vec<ParamGroup> {
    let mut head = TrainableIds::default();
    model.visit_decoder(&mut head);
    let mut groups = vec![ParamGroup::new("head", head.0, base_lr)];

    match model.encoder() {
        FeatureExtractor::Vanilla(encoder) => {
            groups.push(ParamGroup::new(
                "encoder",
                trainable_param_ids(encoder),
                base_lr * UNSTAGED_ENCODER_MULTIPLIER,
            ));
        }
        #[cfg(feature = "backbone")]
        FeatureExtractor::Backbone(backbone) => {
            for (stage, params) in backbone.stage_params().into_iter().enumerate() {
                groups.push(ParamGroup::new(
                    format!("stage{stage}"),
                    params,
                    base_lr * stage_multiplier(stage, layerwise),
                ));
            }
            groups.push(ParamGroup::new(
                "backbone",
                backbone.residual_params(),
                base_lr * RESIDUAL_BACKBONE_MULTIPLIER,
            ));
        }
    }
    groups.retain(|group| !group.params.is_empty());
    if groups.is_empty() {
        let all = trainable_param_ids(model);
        if !all.is_empty() {
            groups.push(ParamGroup::new("all", all, base_lr));
        }
    }
    groups
}

/// Sets gradient tracking on the backbone (all stages, or only `stages`).
pub fn set_backbone_trainable<B: Backend>(
    model: SegmentationModel<B>,
    trainable: bool,
    stages: Option<&[usize]>,
) -> SegmentationModel<B> {
    model.with_backbone_trainable(trainable, stages)
}

/// How the backbone's trainability evolves over the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreezePolicy {
    /// Everything trains from the first step.
    Disabled,
    /// The backbone never trains.
    Frozen,
    /// The backbone starts frozen; `stage` becomes trainable after epoch `unfreeze_epoch`.
    AutoFreeze { unfreeze_epoch: usize, stage: usize },
}

impl FreezePolicy {
    /// `num_stages` is the staged backbone's instantiated stage count, if any.
    pub fn resolve(
        encoder: &EncoderKind,
        freeze_backbone: bool,
        auto_freeze_epochs: usize,
        num_stages: Option<usize>,
    ) -> Self {
        if *encoder != EncoderKind::Backbone {
            return Self::Disabled;
        }
        if freeze_backbone {
            return Self::Frozen;
        }
        match num_stages {
            Some(stages) if stages > 0 && auto_freeze_epochs > 0 => Self::AutoFreeze {
                unfreeze_epoch: auto_freeze_epochs,
                stage: stages - 1,
            },
            _ => Self::Disabled,
        }
    }

    /// Whether the backbone must be frozen before the first step.
    pub const fn starts_frozen(&self) -> bool {
        !matches!(self, Self::Disabled)
    }
}

/// Instantiated stage count of the model's backbone, `None` for the vanilla encoder.
pub fn backbone_stage_count<B: Backend>(model: &SegmentationModel<B>) -> Option<usize> {
    match model.encoder() {
        FeatureExtractor::Vanilla(_) => None,
        #[cfg(feature = "backbone")]
        FeatureExtractor::Backbone(backbone) => Some(backbone.num_stages()),
    }
}
