use burn::{
    module::Ignored,
    nn::conv::{Conv2d, Conv2dConfig},
    prelude::*,
};

use super::blocks::{normalize_layout, resize, ConvNormAct, ConvNormActConfig, ResizeMode};
use crate::error::{FloodSegError, FloodSegResult};

/// Top-down feature pyramid fusion of several backbone stages into the shallowest resolution.
#[derive(Config, Debug)]
pub struct FpnNeckConfig {
    /// Channel count of every input scale, shallow to deep.
    pub in_channels: Vec<usize>,
    pub out_channels: usize,
    #[config(default = "ResizeMode::Bilinear")]
    pub resize: ResizeMode,
}

impl FpnNeckConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> FloodSegResult<FpnNeck<B>> {
        if self.in_channels.len() < 2 {
            return Err(FloodSegError::InvalidConfiguration {
                reason: format!(
                    "feature fusion needs at least two scales, got {}",
                    self.in_channels.len()
                ),
            });
        }

        let laterals = self
            .in_channels
            .iter()
            .map(|&channels| {
                Conv2dConfig::new([channels, self.out_channels], [1, 1])
                    .with_bias(false)
                    .init(device)
            })
            .collect();
        let refinements = (1..self.in_channels.len())
            .map(|_| ConvNormActConfig::new(self.out_channels, self.out_channels).init(device))
            .collect();

        Ok(FpnNeck {
            laterals,
            refinements,
            resize: Ignored(self.resize.clone()),
        })
    }
}

#[derive(Module, Debug)]
pub struct FpnNeck<B: Backend> {
    laterals: Vec<Conv2d<B>>,
    /// `refinements[i]` follows the merge into scale `i`.
    refinements: Vec<ConvNormAct<B>>,
    resize: Ignored<ResizeMode>,
}

impl<B: Backend> FpnNeck<B> {
    /// Fuses `features` (shallow to deep) into one map at the first feature's resolution.
    pub fn forward(&self, features: Vec<Tensor<B, 4>>) -> FloodSegResult<Tensor<B, 4>> {
        if features.len() != self.laterals.len() {
            return Err(FloodSegError::InvalidTensorShape {
                expected: format!("{} feature maps", self.laterals.len()),
                actual: format!("{} feature maps", features.len()),
            });
        }

        let mut projected = features
            .into_iter()
            .zip(&self.laterals)
            .map(|(feature, lateral)| {
                let expected = lateral.weight.dims()[1];
                normalize_layout(feature, expected).map(|feature| lateral.forward(feature))
            })
            .collect::<FloodSegResult<Vec<_>>>()?;

        let Some(mut fused) = projected.pop() else {
            return Err(FloodSegError::InvalidTensorShape {
                expected: "at least one feature map".into(),
                actual: "none".into(),
            });
        };
        for (shallower, refine) in projected.into_iter().zip(&self.refinements).rev() {
            let [_, _, h, w] = shallower.dims();
            fused = refine.forward(resize(fused, [h, w], &self.resize.0) + shallower);
        }
        Ok(fused)
    }
}
