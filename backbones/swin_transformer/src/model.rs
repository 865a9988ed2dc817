use burn::{
    module::{ModuleMapper, ModuleVisitor},
    nn::{
        conv::{Conv2d, Conv2dConfig},
        Dropout, DropoutConfig, LayerNorm, LayerNormConfig,
    },
    prelude::*,
    tensor::ElementConversion,
};

use crate::{
    error::{SwinError, SwinResult},
    stage::{SwinStage, SwinStageConfig},
};

#[derive(Config, Debug)]
pub struct PatchEmbedConfig {
    #[config(default = "4")]
    patch_size: usize,
    #[config(default = "3")]
    in_channels: usize,
    #[config(default = "96")]
    embed_dim: usize,
    #[config(default = "true")]
    norm: bool,
}

impl PatchEmbedConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> PatchEmbed<B> {
        PatchEmbed {
            patch_size: self.patch_size,
            proj: Conv2dConfig::new(
                [self.in_channels, self.embed_dim],
                [self.patch_size, self.patch_size],
            )
            .with_stride([self.patch_size, self.patch_size])
            .init(device),
            norm: self
                .norm
                .then(|| LayerNormConfig::new(self.embed_dim).init(device)),
        }
    }
}

/// Non-overlapping patch projection. Images whose sides are not a multiple of the patch size
/// are zero padded on the bottom/right.
#[derive(Module, Debug)]
pub struct PatchEmbed<B: Backend> {
    patch_size: usize,
    proj: Conv2d<B>,
    norm: Option<LayerNorm<B>>,
}

impl<B: Backend> PatchEmbed<B> {
    /// `[b, c, H, W]` -> tokens `[b, h * w, embed_dim]` plus the token grid `(h, w)`.
    pub fn forward(&self, x: Tensor<B, 4>) -> (Tensor<B, 3>, usize, usize) {
        let [_, _, height, width] = x.dims();
        let p = self.patch_size;
        let (pad_h, pad_w) = ((p - height % p) % p, (p - width % p) % p);
        let x = if pad_h > 0 || pad_w > 0 {
            x.pad((0, pad_w, 0, pad_h), B::FloatElem::from_elem(0.0))
        } else {
            x
        };

        let x = self.proj.forward(x);
        let [b, c, h, w] = x.dims();
        let tokens = x.flatten::<3>(2, 3).swap_dims(1, 2);
        let tokens = match &self.norm {
            Some(norm) => norm.forward(tokens),
            None => tokens,
        };
        debug_assert_eq!(tokens.dims(), [b, h * w, c]);
        (tokens, h, w)
    }
}

/// Swin Transformer V1 truncated to the deepest requested output stage.
#[derive(Config, Debug)]
pub struct SwinTransformerConfig {
    #[config(default = "4")]
    pub patch_size: usize,
    #[config(default = "3")]
    pub in_channels: usize,
    #[config(default = "96")]
    pub embed_dim: usize,
    #[config(default = "[2, 2, 6, 2]")]
    pub depths: [usize; 4],
    #[config(default = "[3, 6, 12, 24]")]
    pub num_heads: [usize; 4],
    #[config(default = "7")]
    pub window_size: usize,
    #[config(default = "4.0")]
    pub mlp_ratio: f64,
    #[config(default = "0.0")]
    pub drop_rate: f64,
    #[config(default = "0.0")]
    pub attn_drop_rate: f64,
    #[config(default = "0.2")]
    pub drop_path_rate: f64,
    /// Stage indices whose outputs `forward` returns, shallow to deep.
    #[config(default = "vec![0, 1, 2, 3]")]
    pub out_indices: Vec<usize>,
}

impl SwinTransformerConfig {
    pub fn tiny() -> Self {
        Self::new()
    }

    pub fn small() -> Self {
        Self::new().with_depths([2, 2, 18, 2]).with_drop_path_rate(0.3)
    }

    pub fn base() -> Self {
        Self::new()
            .with_embed_dim(128)
            .with_depths([2, 2, 18, 2])
            .with_num_heads([4, 8, 16, 32])
            .with_drop_path_rate(0.5)
    }

    pub fn large() -> Self {
        Self::new()
            .with_embed_dim(192)
            .with_depths([2, 2, 18, 2])
            .with_num_heads([6, 12, 24, 48])
            .with_drop_path_rate(0.5)
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> SwinResult<SwinTransformer<B>> {
        let num_stages = self.depths.len();
        if self.out_indices.is_empty() {
            return Err(SwinError::InvalidConfiguration {
                reason: "at least one output stage must be selected".into(),
            });
        }
        if let Some(&index) = self.out_indices.iter().find(|&&i| i >= num_stages) {
            return Err(SwinError::InvalidOutIndex { index, num_stages });
        }
        for (dim, heads) in (0..num_stages)
            .map(|i| self.embed_dim << i)
            .zip(self.num_heads)
        {
            if heads == 0 || dim % heads != 0 {
                return Err(SwinError::InvalidConfiguration {
                    reason: format!("width {dim} is not divisible into {heads} heads"),
                });
            }
        }

        let deepest = self.out_indices.iter().copied().max().unwrap_or(0);
        let total_depth: usize = self.depths.iter().sum();
        let rates: Vec<f64> = (0..total_depth)
            .map(|i| {
                if total_depth > 1 {
                    self.drop_path_rate * i as f64 / (total_depth - 1) as f64
                } else {
                    0.0
                }
            })
            .collect();

        let mut offset = 0;
        let stages = (0..=deepest)
            .map(|i| {
                let depth = self.depths[i];
                let stage = SwinStageConfig::new(self.embed_dim << i, depth, self.num_heads[i])
                    .with_window_size(self.window_size)
                    .with_mlp_ratio(self.mlp_ratio)
                    .with_drop(self.drop_rate)
                    .with_attn_drop(self.attn_drop_rate)
                    .with_drop_path(rates[offset..offset + depth].to_vec())
                    .with_downsample(i > 0)
                    .init(device);
                offset += depth;
                stage
            })
            .collect();

        Ok(SwinTransformer {
            patch_embed: PatchEmbedConfig::new()
                .with_patch_size(self.patch_size)
                .with_in_channels(self.in_channels)
                .with_embed_dim(self.embed_dim)
                .init(device),
            pos_drop: DropoutConfig::new(self.drop_rate).init(),
            stages,
            embed_dim: self.embed_dim,
            out_mask: self.out_indices.iter().fold(0, |mask, &i| mask | (1 << i)),
        })
    }
}

#[derive(Module, Debug)]
pub struct SwinTransformer<B: Backend> {
    patch_embed: PatchEmbed<B>,
    pos_drop: Dropout,
    stages: Vec<SwinStage<B>>,
    embed_dim: usize,
    /// Bit `i` set when stage `i` is returned by `forward`.
    out_mask: usize,
}

impl<B: Backend> SwinTransformer<B> {
    /// Returns the selected stage outputs as `[b, c_i, h_i, w_i]`, shallow to deep.
    pub fn forward(&self, x: Tensor<B, 4>) -> Vec<Tensor<B, 4>> {
        let (tokens, h, w) = self.patch_embed.forward(x);
        let mut state = (self.pos_drop.forward(tokens), h, w);
        let mut outputs = Vec::new();

        for (i, stage) in self.stages.iter().enumerate() {
            let (x, h, w) = state;
            state = stage.forward(x, h, w);
            if self.is_output(i) {
                let (x, h, w) = &state;
                let [b, _, c] = x.dims();
                outputs.push(x.clone().reshape([b, *h, *w, c]).permute([0, 3, 1, 2]));
            }
        }
        outputs
    }

    fn is_output(&self, stage: usize) -> bool {
        self.out_mask & (1 << stage) != 0
    }

    /// Channel widths of the tensors returned by `forward`.
    pub fn out_channels(&self) -> Vec<usize> {
        (0..self.stages.len())
            .filter(|&i| self.is_output(i))
            .map(|i| self.embed_dim << i)
            .collect()
    }

    /// Number of instantiated stages (the deepest selected stage plus one).
    pub fn num_stages(&self) -> usize {
        self.stages.len()
    }

    pub fn stage(&self, index: usize) -> Option<&SwinStage<B>> {
        self.stages.get(index)
    }

    /// Visits the patch embedding parameters.
    pub fn visit_stem<V: ModuleVisitor<B>>(&self, visitor: &mut V) {
        self.patch_embed.visit(visitor);
    }

    /// Visits the parameters of stage `index`; out-of-range indices visit nothing.
    pub fn visit_stage<V: ModuleVisitor<B>>(&self, index: usize, visitor: &mut V) {
        if let Some(stage) = self.stages.get(index) {
            stage.visit(visitor);
        }
    }

    pub fn map_stem<M: ModuleMapper<B>>(mut self, mapper: &mut M) -> Self {
        self.patch_embed = self.patch_embed.map(mapper);
        self
    }

    /// Rewrites the parameters of stage `index`; out-of-range indices are ignored.
    pub fn map_stage<M: ModuleMapper<B>>(mut self, index: usize, mapper: &mut M) -> Self {
        if index < self.stages.len() {
            let stage = self.stages.remove(index).map(mapper);
            self.stages.insert(index, stage);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::{
        backend::NdArray,
        module::ParamId,
        tensor::Distribution,
    };

    type TestBackend = NdArray;

    fn tiny_config() -> SwinTransformerConfig {
        SwinTransformerConfig::new()
            .with_embed_dim(16)
            .with_depths([1, 1, 2, 1])
            .with_num_heads([2, 2, 4, 4])
            .with_window_size(4)
    }

    #[test]
    fn returns_selected_stages_in_nchw() {
        let device = Default::default();
        let model = tiny_config()
            .with_out_indices(vec![1, 2])
            .init::<TestBackend>(&device)
            .unwrap();
        let x = Tensor::<TestBackend, 4>::random([1, 3, 64, 64], Distribution::Normal(0.0, 1.0), &device);

        let out = model.forward(x);

        assert_eq!(model.num_stages(), 3);
        assert_eq!(model.out_channels(), vec![32, 64]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].dims(), [1, 32, 8, 8]);
        assert_eq!(out[1].dims(), [1, 64, 4, 4]);
    }

    #[test]
    fn pads_inputs_not_divisible_by_patch() {
        let device = Default::default();
        let model = tiny_config()
            .with_out_indices(vec![0])
            .init::<TestBackend>(&device)
            .unwrap();
        let x = Tensor::<TestBackend, 4>::zeros([2, 3, 30, 18], &device);

        assert_eq!(model.forward(x)[0].dims(), [2, 16, 8, 5]);
    }

    #[test]
    fn rejects_out_of_range_stage() {
        let device = Default::default();
        let err = tiny_config()
            .with_out_indices(vec![4])
            .init::<TestBackend>(&device)
            .unwrap_err();

        assert!(matches!(err, SwinError::InvalidOutIndex { index: 4, num_stages: 4 }));
    }

    struct CountIds(Vec<ParamId>);

    impl<B: Backend> ModuleVisitor<B> for CountIds {
        fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
            self.0.push(id);
        }
    }

    #[test]
    fn stage_visitors_partition_parameters() {
        let device = Default::default();
        let model = tiny_config()
            .with_out_indices(vec![0, 1])
            .init::<TestBackend>(&device)
            .unwrap();

        let mut all = CountIds(Vec::new());
        model.visit(&mut all);

        let mut parts = CountIds(Vec::new());
        model.visit_stem(&mut parts);
        for i in 0..model.num_stages() {
            model.visit_stage(i, &mut parts);
        }

        assert_eq!(all.0.len(), parts.0.len());
        assert!(all.0.iter().all(|id| parts.0.contains(id)));
    }
}
