use burn::{
    nn::{Dropout, DropoutConfig, Gelu, LayerNorm, LayerNormConfig, Linear, LinearConfig},
    prelude::*,
    tensor::ElementConversion,
};
use burn_extra_ops::{roll, DropPath, DropPathConfig};

use crate::{
    attention::{WindowAttention, WindowAttentionConfig},
    window::{window_partition, window_reverse},
};

#[derive(Config, Debug)]
pub struct MlpConfig {
    in_features: usize,
    hidden_features: usize,
    #[config(default = "0.0")]
    drop: f64,
}

impl MlpConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Mlp<B> {
        Mlp {
            fc1: LinearConfig::new(self.in_features, self.hidden_features).init(device),
            act: Gelu::new(),
            fc2: LinearConfig::new(self.hidden_features, self.in_features).init(device),
            drop: DropoutConfig::new(self.drop).init(),
        }
    }
}

#[derive(Module, Debug)]
pub struct Mlp<B: Backend> {
    fc1: Linear<B>,
    act: Gelu,
    fc2: Linear<B>,
    drop: Dropout,
}

impl<B: Backend> Mlp<B> {
    pub fn forward<const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        let x = self.drop.forward(self.act.forward(self.fc1.forward(x)));
        self.drop.forward(self.fc2.forward(x))
    }
}

/// One transformer block: (shifted) window attention followed by an MLP, both pre-norm with
/// residual connections.
#[derive(Config, Debug)]
pub struct SwinBlockConfig {
    dim: usize,
    num_heads: usize,
    #[config(default = "7")]
    window_size: usize,
    /// `0` for regular windows, usually `window_size / 2` for shifted ones.
    #[config(default = "0")]
    shift_size: usize,
    #[config(default = "4.0")]
    mlp_ratio: f64,
    #[config(default = "0.0")]
    drop: f64,
    #[config(default = "0.0")]
    attn_drop: f64,
    #[config(default = "0.0")]
    drop_path: f64,
}

impl SwinBlockConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> SwinBlock<B> {
        SwinBlock {
            window_size: self.window_size,
            shift_size: self.shift_size,
            norm1: LayerNormConfig::new(self.dim).init(device),
            attn: WindowAttentionConfig::new(self.dim, self.window_size, self.num_heads)
                .with_attn_drop(self.attn_drop)
                .with_proj_drop(self.drop)
                .init(device),
            norm2: LayerNormConfig::new(self.dim).init(device),
            mlp: MlpConfig::new(self.dim, (self.dim as f64 * self.mlp_ratio) as usize)
                .with_drop(self.drop)
                .init(device),
            drop_path: DropPathConfig::new().with_drop_prob(self.drop_path).init(),
        }
    }
}

#[derive(Module, Debug)]
pub struct SwinBlock<B: Backend> {
    window_size: usize,
    shift_size: usize,
    norm1: LayerNorm<B>,
    attn: WindowAttention<B>,
    norm2: LayerNorm<B>,
    mlp: Mlp<B>,
    drop_path: DropPath,
}

impl<B: Backend> SwinBlock<B> {
    pub const fn is_shifted(&self) -> bool {
        self.shift_size > 0
    }

    /// # Shapes
    /// - x: `[batch, h * w, dim]`
    /// - mask: shifted-window mask for the padded grid, used only by shifted blocks
    /// - output: same as `x`
    pub fn forward(&self, x: Tensor<B, 3>, h: usize, w: usize, mask: Option<Tensor<B, 3>>) -> Tensor<B, 3> {
        let [b, _, c] = x.dims();
        let ws = self.window_size;
        let shortcut = x.clone();

        let pad_r = (ws - w % ws) % ws;
        let pad_b = (ws - h % ws) % ws;
        let grid = self.norm1.forward(x).reshape([b, h, w, c]);
        let grid = if pad_r > 0 || pad_b > 0 {
            grid.permute([0, 3, 1, 2])
                .pad((0, pad_r, 0, pad_b), B::FloatElem::from_elem(0.0))
                .permute([0, 2, 3, 1])
        } else {
            grid
        };
        let [_, hp, wp, _] = grid.dims();

        let shift = self.shift_size as i64;
        let (grid, mask) = if self.is_shifted() {
            (roll(grid, &[-shift, -shift], &[1, 2]), mask)
        } else {
            (grid, None)
        };

        let windows = window_partition(grid, ws);
        let num_windows = windows.dims()[0];
        let attended = self
            .attn
            .forward(windows.reshape([num_windows, ws * ws, c]), mask)
            .reshape([num_windows, ws, ws, c]);
        let grid = window_reverse(attended, ws, hp, wp);

        let grid = if self.is_shifted() {
            roll(grid, &[shift, shift], &[1, 2])
        } else {
            grid
        };
        let grid = if pad_r > 0 || pad_b > 0 {
            grid.slice([0..b, 0..h, 0..w, 0..c])
        } else {
            grid
        };

        let x = shortcut + self.drop_path.forward(grid.reshape([b, h * w, c]));
        x.clone() + self.drop_path.forward(self.mlp.forward(self.norm2.forward(x)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::shifted_window_mask;
    use burn::{backend::NdArray, tensor::Distribution};

    type TestBackend = NdArray;

    #[test]
    fn shifted_block_handles_unaligned_grid() {
        let device = Default::default();
        let block = SwinBlockConfig::new(32, 2)
            .with_window_size(4)
            .with_shift_size(2)
            .init::<TestBackend>(&device);
        // 10x6 pads to 12x8.
        let x = Tensor::<TestBackend, 3>::random([2, 60, 32], Distribution::Normal(0.0, 1.0), &device);
        let mask = shifted_window_mask::<TestBackend>(12, 8, 4, 2, &device);

        assert_eq!(block.forward(x, 10, 6, Some(mask)).dims(), [2, 60, 32]);
    }

    #[test]
    fn regular_block_ignores_mask() {
        let device = Default::default();
        let block = SwinBlockConfig::new(16, 2).with_window_size(4).init::<TestBackend>(&device);
        let x = Tensor::<TestBackend, 3>::random([1, 64, 16], Distribution::Normal(0.0, 1.0), &device);

        assert!(!block.is_shifted());
        assert_eq!(block.forward(x, 8, 8, None).dims(), [1, 64, 16]);
    }
}
