use burn::{
    nn::{LayerNorm, LayerNormConfig, Linear, LinearConfig},
    prelude::*,
    tensor::ElementConversion,
};

use crate::{
    block::{SwinBlock, SwinBlockConfig},
    window::shifted_window_mask,
};

/// Halves the token grid by concatenating each 2x2 neighbourhood (`4c` channels) and
/// projecting it to `2c`.
#[derive(Config, Debug)]
pub struct PatchMergingConfig {
    dim: usize,
}

impl PatchMergingConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> PatchMerging<B> {
        PatchMerging {
            norm: LayerNormConfig::new(4 * self.dim).init(device),
            reduction: LinearConfig::new(4 * self.dim, 2 * self.dim)
                .with_bias(false)
                .init(device),
        }
    }
}

#[derive(Module, Debug)]
pub struct PatchMerging<B: Backend> {
    norm: LayerNorm<B>,
    reduction: Linear<B>,
}

impl<B: Backend> PatchMerging<B> {
    /// `[b, h * w, c]` -> `[b, ceil(h/2) * ceil(w/2), 2c]`; odd grids are zero padded.
    pub fn forward(&self, x: Tensor<B, 3>, h: usize, w: usize) -> Tensor<B, 3> {
        let [b, _, c] = x.dims();
        let grid = x.reshape([b, h, w, c]);
        let grid = if h % 2 == 1 || w % 2 == 1 {
            grid.permute([0, 3, 1, 2])
                .pad((0, w % 2, 0, h % 2), B::FloatElem::from_elem(0.0))
                .permute([0, 2, 3, 1])
        } else {
            grid
        };
        let (h2, w2) = (h.div_ceil(2), w.div_ceil(2));

        // Channel order per 2x2 cell: (0,0), (1,0), (0,1), (1,1).
        let merged = grid
            .reshape([b, h2, 2, w2, 2, c])
            .permute([0, 1, 3, 4, 2, 5])
            .reshape([b, h2 * w2, 4 * c]);

        self.reduction.forward(self.norm.forward(merged))
    }
}

/// One resolution level: an optional downsample followed by `depth` blocks that alternate
/// regular and shifted windows.
#[derive(Config, Debug)]
pub struct SwinStageConfig {
    /// Channel width of the blocks in this stage.
    dim: usize,
    depth: usize,
    num_heads: usize,
    #[config(default = "7")]
    window_size: usize,
    #[config(default = "4.0")]
    mlp_ratio: f64,
    #[config(default = "0.0")]
    drop: f64,
    #[config(default = "0.0")]
    attn_drop: f64,
    /// Per-block stochastic depth rates; missing entries default to `0`.
    #[config(default = "Vec::new()")]
    drop_path: Vec<f64>,
    /// Merge patches from the previous stage (`dim / 2` channels) before the blocks.
    #[config(default = "false")]
    downsample: bool,
}

impl SwinStageConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> SwinStage<B> {
        let blocks = (0..self.depth)
            .map(|i| {
                SwinBlockConfig::new(self.dim, self.num_heads)
                    .with_window_size(self.window_size)
                    .with_shift_size(if i % 2 == 0 { 0 } else { self.window_size / 2 })
                    .with_mlp_ratio(self.mlp_ratio)
                    .with_drop(self.drop)
                    .with_attn_drop(self.attn_drop)
                    .with_drop_path(self.drop_path.get(i).copied().unwrap_or(0.0))
                    .init(device)
            })
            .collect();

        SwinStage {
            downsample: self
                .downsample
                .then(|| PatchMergingConfig::new(self.dim / 2).init(device)),
            blocks,
            window_size: self.window_size,
            shift_size: self.window_size / 2,
        }
    }
}

#[derive(Module, Debug)]
pub struct SwinStage<B: Backend> {
    downsample: Option<PatchMerging<B>>,
    blocks: Vec<SwinBlock<B>>,
    window_size: usize,
    shift_size: usize,
}

impl<B: Backend> SwinStage<B> {
    /// Returns the stage output together with its grid size.
    pub fn forward(&self, x: Tensor<B, 3>, h: usize, w: usize) -> (Tensor<B, 3>, usize, usize) {
        let (x, h, w) = match &self.downsample {
            Some(merge) => (merge.forward(x, h, w), h.div_ceil(2), w.div_ceil(2)),
            None => (x, h, w),
        };

        let ws = self.window_size;
        let mask = self.blocks.iter().any(SwinBlock::is_shifted).then(|| {
            shifted_window_mask(h.div_ceil(ws) * ws, w.div_ceil(ws) * ws, ws, self.shift_size, &x.device())
        });

        let x = self
            .blocks
            .iter()
            .fold(x, |x, block| block.forward(x, h, w, mask.clone()));
        (x, h, w)
    }
}
