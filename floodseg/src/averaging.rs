//! Shadow copy of the model whose weights average the training trajectory.

use std::{collections::HashMap, marker::PhantomData};

use burn::{
    module::{AutodiffModule, ModuleMapper, ModuleVisitor, ParamId},
    prelude::*,
    tensor::backend::AutodiffBackend,
};
use serde::{Deserialize, Serialize};

/// How a new snapshot is folded into the average.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum AveragingStrategy {
    /// Equal weight for every snapshot: `avg += (p - avg) / (n + 1)`.
    RunningMean,
    /// `avg = decay * avg + (1 - decay) * p`; the first snapshot is copied.
    Exponential { decay: f64 },
}

impl AveragingStrategy {
    fn weight(&self, updates: u64) -> f64 {
        match self {
            Self::RunningMean => 1.0 / (updates + 1) as f64,
            Self::Exponential { .. } if updates == 0 => 1.0,
            Self::Exponential { decay } => 1.0 - decay,
        }
    }
}

struct Snapshot<B: Backend> {
    tensors: HashMap<ParamId, Tensor<B, 1>>,
}

impl<B: Backend> ModuleVisitor<B> for Snapshot<B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, tensor: &Tensor<B, D>) {
        let numel = tensor.shape().num_elements();
        self.tensors.insert(id, tensor.clone().reshape([numel]));
    }
}

struct Blend<B: Backend> {
    incoming: HashMap<ParamId, Tensor<B, 1>>,
    weight: f64,
}

impl<B: Backend> ModuleMapper<B> for Blend<B> {
    fn map_float<const D: usize>(&mut self, id: ParamId, current: Tensor<B, D>) -> Tensor<B, D> {
        let Some(incoming) = self.incoming.remove(&id) else {
            return current;
        };
        let incoming = incoming.reshape(current.shape());
        current.clone() + (incoming - current).mul_scalar(self.weight)
    }
}

/// Keeps a gradient-free average of an autodiff model, updated after each optimizer step.
pub struct WeightAveraging<B: AutodiffBackend, M: AutodiffModule<B>> {
    shadow: M::InnerModule,
    updates: u64,
    strategy: AveragingStrategy,
    _backend: PhantomData<B>,
}

impl<B: AutodiffBackend, M: AutodiffModule<B>> WeightAveraging<B, M> {
    /// Starts from a copy of `model` with no snapshots averaged yet.
    pub fn new(model: &M, strategy: AveragingStrategy) -> Self {
        Self {
            shadow: model.valid(),
            updates: 0,
            strategy,
            _backend: PhantomData,
        }
    }

    /// Folds the current weights of `model` into the average.
    pub fn update(&mut self, model: &M) {
        let mut snapshot = Snapshot {
            tensors: HashMap::new(),
        };
        model.valid().visit(&mut snapshot);

        let mut blend = Blend {
            incoming: snapshot.tensors,
            weight: self.strategy.weight(self.updates),
        };
        self.shadow = self.shadow.clone().map(&mut blend);
        self.updates += 1;
    }

    /// The averaged model, for evaluation and checkpointing.
    pub const fn model(&self) -> &M::InnerModule {
        &self.shadow
    }

    pub const fn updates(&self) -> u64 {
        self.updates
    }

    /// Restores the snapshot count of a resumed run.
    pub fn set_updates(&mut self, updates: u64) {
        self.updates = updates;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::{
        backend::{Autodiff, NdArray},
        module::Param,
        nn::{Linear, LinearConfig},
    };

    type TestBackend = Autodiff<NdArray>;

    fn with_weight(model: &Linear<TestBackend>, value: f32) -> Linear<TestBackend> {
        let mut model = model.clone();
        let shape = model.weight.shape();
        model.weight = Param::initialized(
            model.weight.id,
            Tensor::full(shape, value, &Default::default()),
        );
        model
    }

    fn shadow_mean(averaging: &WeightAveraging<TestBackend, Linear<TestBackend>>) -> f32 {
        averaging.model().weight.val().mean().into_scalar()
    }

    #[test]
    fn running_mean_weights_snapshots_equally() {
        let base = LinearConfig::new(4, 2).init::<TestBackend>(&Default::default());
        let mut averaging = WeightAveraging::new(&base, AveragingStrategy::RunningMean);

        for value in [1.0, 3.0, 5.0] {
            averaging.update(&with_weight(&base, value));
        }

        assert_eq!(averaging.updates(), 3);
        assert!((shadow_mean(&averaging) - 3.0).abs() < 1e-6);
    }

    #[test]
    fn first_update_copies_weights() {
        let base = LinearConfig::new(4, 2).init::<TestBackend>(&Default::default());
        let mut averaging = WeightAveraging::new(&base, AveragingStrategy::Exponential { decay: 0.5 });

        averaging.update(&with_weight(&base, 1.0));
        assert!((shadow_mean(&averaging) - 1.0).abs() < 1e-6);

        averaging.update(&with_weight(&base, 3.0));
        assert!((shadow_mean(&averaging) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn training_model_is_left_untouched() {
        let base = LinearConfig::new(4, 2).init::<TestBackend>(&Default::default());
        let trained = with_weight(&base, 2.0);
        let mut averaging = WeightAveraging::new(&base, AveragingStrategy::RunningMean);

        averaging.update(&trained);

        let value: f32 = trained.weight.val().mean().into_scalar();
        assert!((value - 2.0).abs() < 1e-6);
    }
}
