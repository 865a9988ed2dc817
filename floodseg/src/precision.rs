//! Mixed-precision policy and dynamic loss scaling.

use burn::{
    module::{AutodiffModule, ModuleVisitor, ParamId},
    optim::GradientsParams,
    prelude::*,
    tensor::{backend::AutodiffBackend, ElementConversion},
};
use serde::{Deserialize, Serialize};

/// Numeric precision a run trains in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrecisionPolicy {
    Full,
    /// Reduced-precision compute with dynamic loss scaling.
    Mixed,
}

impl PrecisionPolicy {
    /// Mixed precision only when it is requested and the backend supports it.
    pub fn resolve(requested: bool, backend_supports_reduced: bool, backend: &str) -> Self {
        match (requested, backend_supports_reduced) {
            (true, true) => Self::Mixed,
            (true, false) => {
                tracing::warn!(backend, "mixed precision is unavailable on this backend, training in full precision");
                Self::Full
            }
            _ => Self::Full,
        }
    }

    pub fn grad_scaler(&self) -> GradScaler {
        match self {
            Self::Mixed => GradScaler::new(),
            Self::Full => GradScaler::disabled(),
        }
    }

    /// AdamW denominator epsilon. Under mixed precision the optimizer state lives in half
    /// precision, where `1e-8` flushes to zero, so the smallest normal-range value is used.
    pub const fn optimizer_epsilon(&self) -> f32 {
        match self {
            Self::Mixed => HALF_EPSILON,
            Self::Full => FULL_EPSILON,
        }
    }
}

const FULL_EPSILON: f32 = 1e-8;
const HALF_EPSILON: f32 = 1e-4;

/// Dynamic loss scaling.
///
/// The loss is multiplied by `scale` before backpropagation and gradients are divided by it
/// before the optimizer step. A non-finite gradient skips the step and halves the scale; every
/// `growth_interval` consecutive finite steps double it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GradScaler {
    enabled: bool,
    scale: f64,
    growth_factor: f64,
    backoff_factor: f64,
    growth_interval: usize,
    growth_tracker: usize,
}

impl Default for GradScaler {
    fn default() -> Self {
        Self::new()
    }
}

impl GradScaler {
    pub const INITIAL_SCALE: f64 = 65536.0;

    pub const fn new() -> Self {
        Self {
            enabled: true,
            scale: Self::INITIAL_SCALE,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
            growth_tracker: 0,
        }
    }

    /// A pass-through scaler for full-precision runs.
    pub const fn disabled() -> Self {
        Self {
            enabled: false,
            scale: 1.0,
            ..Self::new()
        }
    }

    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub const fn scale_factor(&self) -> f64 {
        self.scale
    }

    pub fn scale<B: Backend>(&self, loss: Tensor<B, 1>) -> Tensor<B, 1> {
        if self.enabled {
            loss.mul_scalar(self.scale)
        } else {
            loss
        }
    }

    /// Divides every gradient of `model` by the scale in place and reports whether any of them
    /// is non-finite.
    pub fn unscale<B: AutodiffBackend, M: AutodiffModule<B>>(
        &self,
        grads: &mut GradientsParams,
        model: &M,
    ) -> bool {
        if !self.enabled {
            return false;
        }
        let mut unscale = Unscale::<B> {
            grads,
            inv_scale: 1.0 / self.scale,
            total: None,
        };
        model.visit(&mut unscale);

        unscale
            .total
            .map(|total| !total.into_scalar().elem::<f64>().is_finite())
            .unwrap_or(false)
    }

    /// Adjusts the scale after a step attempt.
    pub fn update(&mut self, found_inf: bool) {
        if !self.enabled {
            return;
        }
        if found_inf {
            self.scale *= self.backoff_factor;
            self.growth_tracker = 0;
        } else {
            self.growth_tracker += 1;
            if self.growth_tracker == self.growth_interval {
                self.scale *= self.growth_factor;
                self.growth_tracker = 0;
            }
        }
    }
}

struct Unscale<'a, B: AutodiffBackend> {
    grads: &'a mut GradientsParams,
    inv_scale: f64,
    total: Option<Tensor<B::InnerBackend, 1>>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for Unscale<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        let Some(grad) = self.grads.remove::<B::InnerBackend, D>(id) else {
            return;
        };
        let grad = grad.mul_scalar(self.inv_scale);
        let sum = grad.clone().sum();
        self.total = Some(match self.total.take() {
            Some(total) => total + sum,
            None => sum,
        });
        self.grads.register::<B::InnerBackend, D>(id, grad);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::{
        backend::{Autodiff, NdArray},
        nn::{Linear, LinearConfig},
    };

    type TestBackend = Autodiff<NdArray>;

    #[test]
    fn amp_falls_back_on_cpu() {
        assert_eq!(PrecisionPolicy::resolve(true, false, "NdArray"), PrecisionPolicy::Full);
        assert_eq!(PrecisionPolicy::resolve(true, true, "CUDA"), PrecisionPolicy::Mixed);
        assert!(!PrecisionPolicy::Full.grad_scaler().is_enabled());
    }

    #[test]
    fn mixed_epsilon_survives_half_precision() {
        use burn::tensor::f16;

        let mixed = f16::from_f32(PrecisionPolicy::Mixed.optimizer_epsilon());
        assert!(mixed.is_normal());
        assert_eq!(f16::from_f32(PrecisionPolicy::Full.optimizer_epsilon()), f16::ZERO);
        assert!(PrecisionPolicy::Full.optimizer_epsilon() < PrecisionPolicy::Mixed.optimizer_epsilon());
    }

    #[test]
    fn scale_backs_off_and_grows() {
        let mut scaler = GradScaler::new();
        scaler.update(true);
        assert_eq!(scaler.scale_factor(), 32768.0);

        for _ in 0..2000 {
            scaler.update(false);
        }
        assert_eq!(scaler.scale_factor(), 65536.0);
    }

    #[test]
    fn unscale_restores_true_gradients() {
        let device = Default::default();
        let model: Linear<TestBackend> = LinearConfig::new(3, 1).with_bias(false).init(&device);
        let x = Tensor::<TestBackend, 2>::ones([1, 3], &device);
        let scaler = GradScaler::new();

        let loss = model.forward(x).sum();
        let mut grads = GradientsParams::from_grads(scaler.scale(loss).backward(), &model);

        let found_inf = scaler.unscale(&mut grads, &model);
        let grad = grads
            .get::<<TestBackend as AutodiffBackend>::InnerBackend, 2>(model.weight.id)
            .unwrap();

        assert!(!found_inf);
        let values = grad.into_data().to_vec::<f32>().unwrap();
        assert!(values.iter().all(|v| (v - 1.0).abs() < 1e-6), "{values:?}");
    }

    #[test]
    fn disabled_scaler_is_identity() {
        let device = Default::default();
        let scaler = GradScaler::disabled();
        let loss = Tensor::<NdArray, 1>::from_floats([2.5], &device);

        let value: f32 = scaler.scale(loss).into_scalar();
        assert_eq!(value, 2.5);
    }
}
