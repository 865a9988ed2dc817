use burn::{
    nn::conv::{Conv2d, Conv2dConfig},
    prelude::*,
    tensor::activation::silu,
};

use super::blocks::{normalize_layout, ConvNormAct, ConvNormActConfig};
use crate::error::FloodSegResult;

/// Atrous spatial pyramid pooling: parallel dilated branches plus a global-context branch.
#[derive(Config, Debug)]
pub struct AsppConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    /// Dilation of each convolution branch; rate `1` uses a 1x1 kernel.
    #[config(default = "[1, 6, 12, 18]")]
    pub rates: [usize; 4],
}

impl AsppConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Aspp<B> {
        let branches = self
            .rates
            .iter()
            .map(|&rate| {
                let kernel_size = if rate == 1 { 1 } else { 3 };
                ConvNormActConfig::new(self.in_channels, self.out_channels)
                    .with_kernel_size(kernel_size)
                    .with_dilation(rate)
                    .init(device)
            })
            .collect();
        let branch_count = self.rates.len() + 1;

        Aspp {
            branches,
            pool_proj: Conv2dConfig::new([self.in_channels, self.out_channels], [1, 1])
                .with_bias(false)
                .init(device),
            project: Conv2dConfig::new([branch_count * self.out_channels, self.out_channels], [1, 1])
                .with_bias(false)
                .init(device),
        }
    }
}

#[derive(Module, Debug)]
pub struct Aspp<B: Backend> {
    branches: Vec<ConvNormAct<B>>,
    pool_proj: Conv2d<B>,
    project: Conv2d<B>,
}

impl<B: Backend> Aspp<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [_, _, h, w] = x.dims();

        // Global context: average, project, then broadcast back over the grid.
        let pooled = silu(self.pool_proj.forward(x.clone().mean_dim(2).mean_dim(3)))
            .repeat_dim(2, h)
            .repeat_dim(3, w);

        let mut outputs: Vec<_> = self
            .branches
            .iter()
            .map(|branch| branch.forward(x.clone()))
            .collect();
        outputs.push(pooled);

        self.project.forward(Tensor::cat(outputs, 1))
    }
}

/// Decoder producing class scores at feature resolution.
#[derive(Config, Debug)]
pub struct SegmentationHeadConfig {
    pub in_channels: usize,
    pub num_classes: usize,
}

impl SegmentationHeadConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> SegmentationHead<B> {
        let hidden = self.in_channels / 2;
        SegmentationHead {
            aspp: AsppConfig::new(self.in_channels, hidden).init(device),
            classifier: Conv2dConfig::new([hidden, self.num_classes], [1, 1]).init(device),
            in_channels: self.in_channels,
        }
    }
}

#[derive(Module, Debug)]
pub struct SegmentationHead<B: Backend> {
    aspp: Aspp<B>,
    classifier: Conv2d<B>,
    in_channels: usize,
}

impl<B: Backend> SegmentationHead<B> {
    /// `[b, in_channels, h, w]` (or channel-last) -> `[b, num_classes, h, w]`.
    pub fn forward(&self, x: Tensor<B, 4>) -> FloodSegResult<Tensor<B, 4>> {
        let x = normalize_layout(x, self.in_channels)?;
        Ok(self.classifier.forward(silu(self.aspp.forward(x))))
    }

    pub const fn in_channels(&self) -> usize {
        self.in_channels
    }
}
