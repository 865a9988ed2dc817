use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        GroupNorm, GroupNormConfig, PaddingConfig2d,
    },
    prelude::*,
    tensor::{
        activation::silu,
        module::interpolate,
        ops::{InterpolateMode, InterpolateOptions},
    },
};

use crate::error::{FloodSegError, FloodSegResult};

/// Number of groups used by every group normalization in the model.
pub const NORM_GROUPS: usize = 8;

/// Interpolation used for every spatial resize in the model.
///
/// Some backends only implement the backward pass of nearest-neighbour resizing; select
/// `Nearest` to train on them.
#[derive(Config, Debug, PartialEq, Eq, Hash)]
pub enum ResizeMode {
    Bilinear,
    Nearest,
}

impl Default for ResizeMode {
    fn default() -> Self {
        Self::Bilinear
    }
}

/// Resizes `[b, c, h, w]` to `size`; a no-op when the size already matches.
pub fn resize<B: Backend>(tensor: Tensor<B, 4>, size: [usize; 2], mode: &ResizeMode) -> Tensor<B, 4> {
    let [_, _, h, w] = tensor.dims();
    if [h, w] == size {
        return tensor;
    }
    let mode = match mode {
        ResizeMode::Bilinear => InterpolateMode::Bilinear,
        ResizeMode::Nearest => InterpolateMode::Nearest,
    };
    interpolate(tensor, size, InterpolateOptions::new(mode))
}

/// Returns the tensor in `[b, c, h, w]` layout with `c == expected`, permuting a channel-last
/// tensor when its last axis carries the channels.
pub fn normalize_layout<B: Backend>(tensor: Tensor<B, 4>, expected: usize) -> FloodSegResult<Tensor<B, 4>> {
    let dims = tensor.dims();
    if dims[1] == expected {
        Ok(tensor)
    } else if dims[3] == expected {
        Ok(tensor.permute([0, 3, 1, 2]))
    } else {
        Err(FloodSegError::InvalidTensorShape {
            expected: format!("{expected} channels on axis 1 or 3"),
            actual: format!("{dims:?}"),
        })
    }
}

/// `conv (no bias) -> GroupNorm(8) -> SiLU`.
#[derive(Config, Debug)]
pub struct ConvNormActConfig {
    in_channels: usize,
    out_channels: usize,
    #[config(default = "3")]
    kernel_size: usize,
    #[config(default = "1")]
    stride: usize,
    #[config(default = "1")]
    dilation: usize,
}

impl ConvNormActConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ConvNormAct<B> {
        let padding = self.dilation * (self.kernel_size / 2);
        ConvNormAct {
            conv: Conv2dConfig::new(
                [self.in_channels, self.out_channels],
                [self.kernel_size, self.kernel_size],
            )
            .with_stride([self.stride, self.stride])
            .with_dilation([self.dilation, self.dilation])
            .with_padding(PaddingConfig2d::Explicit(padding, padding))
            .with_bias(false)
            .init(device),
            norm: GroupNormConfig::new(NORM_GROUPS, self.out_channels).init(device),
        }
    }
}

#[derive(Module, Debug)]
pub struct ConvNormAct<B: Backend> {
    conv: Conv2d<B>,
    norm: GroupNorm<B>,
}

impl<B: Backend> ConvNormAct<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        silu(self.norm.forward(self.conv.forward(x)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::{backend::NdArray, tensor::Distribution};

    type TestBackend = NdArray;

    #[test]
    fn channel_last_input_is_permuted() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 4>::random([2, 5, 7, 16], Distribution::Normal(0.0, 1.0), &device);

        let fixed = normalize_layout(x.clone(), 16).unwrap();

        assert_eq!(fixed.dims(), [2, 16, 5, 7]);
        assert_eq!(
            fixed.permute([0, 2, 3, 1]).into_data().to_vec::<f32>().unwrap(),
            x.into_data().to_vec::<f32>().unwrap()
        );
    }

    #[test]
    fn unmatched_channels_are_rejected() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 4>::zeros([1, 3, 8, 8], &device);

        assert!(matches!(
            normalize_layout(x, 16),
            Err(FloodSegError::InvalidTensorShape { .. })
        ));
    }

    #[test]
    fn strided_block_halves_resolution() {
        let device = Default::default();
        let block = ConvNormActConfig::new(3, 16).with_stride(2).init::<TestBackend>(&device);
        let x = Tensor::<TestBackend, 4>::random([1, 3, 32, 24], Distribution::Normal(0.0, 1.0), &device);

        assert_eq!(block.forward(x).dims(), [1, 16, 16, 12]);
    }
}
