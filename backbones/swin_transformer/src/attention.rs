use burn::{
    module::Param,
    nn::{Dropout, DropoutConfig, Linear, LinearConfig},
    prelude::*,
    tensor::activation::softmax,
};
use burn_extra_ops::trunc_normal;

use crate::window::relative_position_index;

/// Multi-head self-attention restricted to a `window_size x window_size` window, with a
/// learned relative position bias.
#[derive(Config, Debug)]
pub struct WindowAttentionConfig {
    dim: usize,
    window_size: usize,
    num_heads: usize,
    #[config(default = "true")]
    qkv_bias: bool,
    #[config(default = "0.0")]
    attn_drop: f64,
    #[config(default = "0.0")]
    proj_drop: f64,
}

impl WindowAttentionConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> WindowAttention<B> {
        let span = 2 * self.window_size - 1;
        let table = trunc_normal(
            Tensor::zeros([span * span, self.num_heads], device),
            0.0,
            0.02,
            -2.0,
            2.0,
        );

        WindowAttention {
            num_heads: self.num_heads,
            window_size: self.window_size,
            scale: ((self.dim / self.num_heads) as f64).powf(-0.5),
            relative_position_bias_table: Param::from_tensor(table),
            qkv: LinearConfig::new(self.dim, 3 * self.dim)
                .with_bias(self.qkv_bias)
                .init(device),
            attn_drop: DropoutConfig::new(self.attn_drop).init(),
            proj: LinearConfig::new(self.dim, self.dim).init(device),
            proj_drop: DropoutConfig::new(self.proj_drop).init(),
        }
    }
}

#[derive(Module, Debug)]
pub struct WindowAttention<B: Backend> {
    num_heads: usize,
    window_size: usize,
    scale: f64,
    relative_position_bias_table: Param<Tensor<B, 2>>,
    qkv: Linear<B>,
    attn_drop: Dropout,
    proj: Linear<B>,
    proj_drop: Dropout,
}

impl<B: Backend> WindowAttention<B> {
    /// # Shapes
    /// - x: `[num_windows * batch, window_size², dim]`
    /// - mask: `[num_windows, window_size², window_size²]`, additive
    /// - output: same as `x`
    pub fn forward(&self, x: Tensor<B, 3>, mask: Option<Tensor<B, 3>>) -> Tensor<B, 3> {
        let [b, n, c] = x.dims();
        let heads = self.num_heads;
        let head_dim = c / heads;

        let qkv = self
            .qkv
            .forward(x)
            .reshape([b, n, 3, heads, head_dim])
            .permute([2, 0, 3, 1, 4]);
        let part = |i: usize| qkv.clone().narrow(0, i, 1).reshape([b, heads, n, head_dim]);
        let (q, k, v) = (part(0) * self.scale, part(1), part(2));

        let attn = q.matmul(k.swap_dims(2, 3)) + self.relative_bias(n).unsqueeze::<4>();

        let attn = match mask {
            Some(mask) => {
                let nw = mask.dims()[0];
                let masked = attn.reshape([b / nw, nw, heads, n, n]) + mask.unsqueeze_dim::<4>(1).unsqueeze::<5>();
                masked.reshape([b, heads, n, n])
            }
            None => attn,
        };
        let attn = self.attn_drop.forward(softmax(attn, 3));

        let out = attn.matmul(v).swap_dims(1, 2).reshape([b, n, c]);
        self.proj_drop.forward(self.proj.forward(out))
    }

    /// Bias `[heads, n, n]` gathered from the table.
    fn relative_bias(&self, n: usize) -> Tensor<B, 3> {
        let table = self.relative_position_bias_table.val();
        let index = relative_position_index(self.window_size);
        let index = Tensor::<B, 1, Int>::from_data(TensorData::new(index, [n * n]), &table.device());

        table
            .select(0, index)
            .reshape([n, n, self.num_heads])
            .permute([2, 0, 1])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::{backend::NdArray, tensor::Distribution};

    type TestBackend = NdArray;

    #[test]
    fn output_keeps_token_layout() {
        let device = Default::default();
        let attention = WindowAttentionConfig::new(32, 4, 4).init::<TestBackend>(&device);
        let x = Tensor::<TestBackend, 3>::random([6, 16, 32], Distribution::Normal(0.0, 1.0), &device);

        assert_eq!(attention.forward(x.clone(), None).dims(), [6, 16, 32]);

        let mask = Tensor::<TestBackend, 3>::zeros([3, 16, 16], &device);
        assert_eq!(attention.forward(x, Some(mask)).dims(), [6, 16, 32]);
    }
}
