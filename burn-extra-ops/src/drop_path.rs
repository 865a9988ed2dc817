//! Stochastic depth.
//!
//! Drops whole samples of a residual branch with probability `drop_prob` and rescales the
//! survivors. The mask is only drawn on autodiff backends, so the same module evaluates
//! deterministically once a model has been converted with `valid()`.

use burn::{prelude::*, tensor::Distribution};

#[derive(Config, Debug)]
pub struct DropPathConfig {
    /// Probability of dropping a sample's branch.
    #[config(default = "0.0")]
    pub drop_prob: f64,
    /// Rescale kept samples by `1 / (1 - drop_prob)`.
    #[config(default = "true")]
    pub scale_by_keep: bool,
}

impl DropPathConfig {
    pub const fn init(&self) -> DropPath {
        DropPath {
            drop_prob: self.drop_prob,
            scale_by_keep: self.scale_by_keep,
        }
    }
}

#[derive(Module, Clone, Debug)]
pub struct DropPath {
    drop_prob: f64,
    scale_by_keep: bool,
}

impl DropPath {
    /// # Shapes
    /// - input: `[batch, ...]`
    /// - output: same as input
    pub fn forward<B: Backend, const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        if !B::ad_enabled() || self.drop_prob == 0.0 {
            return x;
        }
        let keep_prob = 1.0 - self.drop_prob;
        let mut mask_shape = [1; D];
        mask_shape[0] = x.dims()[0];
        let mask = Tensor::random(mask_shape, Distribution::Bernoulli(keep_prob), &x.device());

        if self.scale_by_keep {
            x * mask / keep_prob
        } else {
            x * mask
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};

    #[test]
    fn inner_backend_is_identity() {
        let device = Default::default();
        let drop_path = DropPathConfig::new().with_drop_prob(0.9).init();
        let x = Tensor::<NdArray, 3>::ones([4, 5, 6], &device);

        let out = drop_path.forward(x.clone());

        let diff: f32 = (out - x).abs().sum().into_scalar();
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn autodiff_backend_drops_whole_samples() {
        let device = Default::default();
        let drop_path = DropPathConfig::new().with_drop_prob(0.5).init();
        let x = Tensor::<Autodiff<NdArray>, 3>::ones([16, 4, 4], &device);

        let out = drop_path.forward(x);

        for i in 0..16 {
            let sum: f32 = out.clone().slice([i..i + 1, 0..4, 0..4]).sum().into_scalar();
            assert!(sum.abs() < 1e-6 || (sum - 32.0).abs() < 1e-4, "sample {i}: {sum}");
        }
    }
}
