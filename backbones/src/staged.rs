use burn::{
    module::{ModuleMapper, ModuleVisitor, ParamId},
    prelude::*,
};
use swin_transformer::SwinTransformer;

/// A hierarchical feature extractor whose parameters are addressable per stage.
///
/// Stage parameter listings only contain parameters that currently require gradients, so
/// freezing a stage removes it from any optimizer group built afterwards.
pub trait StagedBackbone<B: Backend>: Module<B> {
    /// Selected stage outputs, shallow to deep, as `[batch, channels, height, width]`.
    fn forward_features(&self, input: Tensor<B, 4>) -> Vec<Tensor<B, 4>>;

    /// Channel count of every tensor returned by [`forward_features`](Self::forward_features).
    fn out_channels(&self) -> Vec<usize>;

    fn num_stages(&self) -> usize;

    /// Trainable parameter ids of each stage, indexed by stage.
    fn stage_params(&self) -> Vec<Vec<ParamId>>;

    /// Trainable parameter ids that belong to no stage (patch embedding and similar).
    fn residual_params(&self) -> Vec<ParamId>;

    /// Sets gradient tracking for the listed stages, or for every parameter when `stages` is
    /// `None`. Unknown stage indices are ignored.
    fn with_trainable(self, trainable: bool, stages: Option<&[usize]>) -> Self;
}

/// Collects the ids of parameters that require gradients.
#[derive(Default)]
pub struct TrainableParams {
    pub ids: Vec<ParamId>,
}

impl<B: Backend> ModuleVisitor<B> for TrainableParams {
    fn visit_float<const D: usize>(&mut self, id: ParamId, tensor: &Tensor<B, D>) {
        if tensor.is_require_grad() {
            self.ids.push(id);
        }
    }
}

/// Ids of all trainable parameters of `module`, in visiting order.
pub fn trainable_params<B: Backend, M: Module<B>>(module: &M) -> Vec<ParamId> {
    let mut collector = TrainableParams::default();
    module.visit(&mut collector);
    collector.ids
}

/// Switches gradient tracking on every float parameter it maps.
pub struct RequireGrad(pub bool);

impl<B: Backend> ModuleMapper<B> for RequireGrad {
    fn map_float<const D: usize>(&mut self, _id: ParamId, tensor: Tensor<B, D>) -> Tensor<B, D> {
        tensor.set_require_grad(self.0)
    }
}

impl<B: Backend> StagedBackbone<B> for SwinTransformer<B> {
    fn forward_features(&self, input: Tensor<B, 4>) -> Vec<Tensor<B, 4>> {
        self.forward(input)
    }

    fn out_channels(&self) -> Vec<usize> {
        SwinTransformer::out_channels(self)
    }

    fn num_stages(&self) -> usize {
        SwinTransformer::num_stages(self)
    }

    fn stage_params(&self) -> Vec<Vec<ParamId>> {
        (0..SwinTransformer::num_stages(self))
            .map(|i| {
                let mut collector = TrainableParams::default();
                self.visit_stage(i, &mut collector);
                collector.ids
            })
            .collect()
    }

    fn residual_params(&self) -> Vec<ParamId> {
        let mut collector = TrainableParams::default();
        self.visit_stem(&mut collector);
        collector.ids
    }

    fn with_trainable(self, trainable: bool, stages: Option<&[usize]>) -> Self {
        let mut mapper = RequireGrad(trainable);
        match stages {
            None => self.map(&mut mapper),
            Some(stages) => stages
                .iter()
                .fold(self, |model, &i| model.map_stage(i, &mut mapper)),
        }
    }
}

/// Every backbone the registry can build.
#[derive(Module, Debug)]
pub enum BackboneWrapper<B: Backend> {
    Swin(SwinTransformer<B>),
}

impl<B: Backend> StagedBackbone<B> for BackboneWrapper<B> {
    fn forward_features(&self, input: Tensor<B, 4>) -> Vec<Tensor<B, 4>> {
        match self {
            Self::Swin(model) => model.forward_features(input),
        }
    }

    fn out_channels(&self) -> Vec<usize> {
        match self {
            Self::Swin(model) => StagedBackbone::out_channels(model),
        }
    }

    fn num_stages(&self) -> usize {
        match self {
            Self::Swin(model) => StagedBackbone::num_stages(model),
        }
    }

    fn stage_params(&self) -> Vec<Vec<ParamId>> {
        match self {
            Self::Swin(model) => model.stage_params(),
        }
    }

    fn residual_params(&self) -> Vec<ParamId> {
        match self {
            Self::Swin(model) => model.residual_params(),
        }
    }

    fn with_trainable(self, trainable: bool, stages: Option<&[usize]>) -> Self {
        match self {
            Self::Swin(model) => Self::Swin(model.with_trainable(trainable, stages)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::create_backbone;
    use burn::backend::{Autodiff, NdArray};
    use swin_transformer::SwinTransformerConfig;

    type TestBackend = Autodiff<NdArray>;

    fn small_backbone() -> BackboneWrapper<TestBackend> {
        let device = Default::default();
        let model = SwinTransformerConfig::new()
            .with_embed_dim(16)
            .with_depths([1, 1, 1, 1])
            .with_num_heads([2, 2, 4, 4])
            .with_window_size(4)
            .with_out_indices(vec![1, 2, 3])
            .init(&device)
            .unwrap();
        BackboneWrapper::Swin(model)
    }

    #[test]
    fn registry_backbone_reports_window_channels() {
        let device = Default::default();
        let backbone = create_backbone::<NdArray>("swin_tiny_patch4_window7_224", 2, &device).unwrap();

        assert_eq!(backbone.out_channels(), vec![96, 192, 384]);
        assert_eq!(StagedBackbone::num_stages(&backbone), 3);
    }

    #[test]
    fn freezing_everything_empties_groups() {
        let backbone = small_backbone();
        let total = trainable_params(&backbone).len();
        assert!(total > 0);

        let frozen = backbone.with_trainable(false, None);

        assert!(trainable_params(&frozen).is_empty());
        assert!(frozen.stage_params().iter().all(Vec::is_empty));
        assert!(frozen.residual_params().is_empty());
    }

    #[test]
    fn unfreezing_one_stage_restores_only_that_stage() {
        let backbone = small_backbone().with_trainable(false, None);
        let before: Vec<usize> = small_backbone().stage_params().iter().map(Vec::len).collect();

        let partially = backbone.with_trainable(true, Some(&[3]));
        let groups = partially.stage_params();

        assert!(groups[..3].iter().all(Vec::is_empty));
        assert_eq!(groups[3].len(), before[3]);
        assert!(partially.residual_params().is_empty());
    }

    #[test]
    fn stage_groups_and_residual_cover_all_params() {
        let backbone = small_backbone();
        let grouped: usize = backbone.stage_params().iter().map(Vec::len).sum::<usize>()
            + backbone.residual_params().len();

        assert_eq!(grouped, trainable_params(&backbone).len());
    }
}
