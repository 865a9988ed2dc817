//! Pixel-wise segmentation losses with an ignore label.
//!
//! The training objective is
//! ```text
//! loss = CE(logits, targets) + dice_weight * (1 - mean_c(2 * |P_c ∩ T_c| / (|P_c| + |T_c| + eps)))
//! ```
//! where pixels labelled `ignore_index` contribute to neither term.

use burn::{
    prelude::*,
    tensor::activation::{log_softmax, softmax},
};

/// Label value marking pixels excluded from loss and metrics.
pub const IGNORE_INDEX: i64 = 255;

/// Float mask `[b, h, w]` of pixels whose label is not `ignore_index`, and the labels with
/// ignored pixels replaced by class `0` and clamped into `[0, num_classes)`.
fn split_valid<B: Backend>(
    targets: Tensor<B, 3, Int>,
    num_classes: usize,
    ignore_index: i64,
) -> (Tensor<B, 3>, Tensor<B, 3, Int>) {
    let ignored = targets.clone().equal_elem(ignore_index);
    let safe = targets
        .mask_fill(ignored.clone(), 0)
        .clamp(0, num_classes as i64 - 1);
    (ignored.bool_not().float(), safe)
}

/// Mean cross-entropy over pixels whose label differs from `ignore_index`.
///
/// # Shapes
/// - logits: `[batch, classes, height, width]`
/// - targets: `[batch, height, width]`
/// - output: `[1]`
pub fn cross_entropy_with_ignore<B: Backend>(
    logits: Tensor<B, 4>,
    targets: Tensor<B, 3, Int>,
    ignore_index: i64,
) -> Tensor<B, 1> {
    let [_, num_classes, _, _] = logits.dims();
    let (valid, safe) = split_valid(targets, num_classes, ignore_index);

    let log_probs = log_softmax(logits, 1);
    let picked = log_probs
        .gather(1, safe.unsqueeze_dim::<4>(1))
        .squeeze::<3>(1);

    let count = valid.clone().sum().clamp_min(1.0);
    (picked * valid).sum().neg() / count
}

/// Soft multiclass Dice loss; ignored pixels are removed from both the probabilities and the
/// one-hot targets before aggregating over batch and space.
pub fn dice_loss<B: Backend>(
    logits: Tensor<B, 4>,
    targets: Tensor<B, 3, Int>,
    num_classes: usize,
    ignore_index: i64,
    eps: f64,
) -> Tensor<B, 1> {
    let device = logits.device();
    let (valid, safe) = split_valid(targets, num_classes, ignore_index);
    let valid = valid.unsqueeze_dim::<4>(1);

    let classes = Tensor::<B, 1, Int>::arange(0..num_classes as i64, &device)
        .float()
        .reshape([1, num_classes, 1, 1]);
    let one_hot = (safe.float().unsqueeze_dim::<4>(1) - classes)
        .abs()
        .lower_elem(0.5)
        .float()
        * valid.clone();
    let probs = softmax(logits, 1) * valid;

    let reduce = |t: Tensor<B, 4>| t.sum_dim(0).sum_dim(2).sum_dim(3).flatten::<1>(0, 3);
    let intersection = reduce(probs.clone() * one_hot.clone()).mul_scalar(2.0);
    let denominator = reduce(probs + one_hot).add_scalar(eps);

    (intersection / denominator).mean().neg().add_scalar(1.0)
}

#[derive(Config, Debug)]
pub struct SegmentationLossConfig {
    /// Weight of the Dice term; `0` disables it.
    #[config(default = 0.5)]
    pub dice_weight: f64,
    #[config(default = 255)]
    pub ignore_index: i64,
    #[config(default = 1e-6)]
    pub eps: f64,
}

impl SegmentationLossConfig {
    pub fn init(&self) -> SegmentationLoss {
        SegmentationLoss {
            dice_weight: self.dice_weight,
            ignore_index: self.ignore_index,
            eps: self.eps,
        }
    }
}

/// Cross-entropy blended with soft Dice.
#[derive(Debug, Clone)]
pub struct SegmentationLoss {
    dice_weight: f64,
    ignore_index: i64,
    eps: f64,
}

/// Loss tensors of one forward pass; `total` is the value to backpropagate.
#[derive(Debug, Clone)]
pub struct LossOutput<B: Backend> {
    pub total: Tensor<B, 1>,
    pub cross_entropy: Tensor<B, 1>,
    pub dice: Option<Tensor<B, 1>>,
}

impl SegmentationLoss {
    pub fn forward<B: Backend>(&self, logits: Tensor<B, 4>, targets: Tensor<B, 3, Int>) -> LossOutput<B> {
        let [_, num_classes, _, _] = logits.dims();
        let cross_entropy = cross_entropy_with_ignore(logits.clone(), targets.clone(), self.ignore_index);

        if self.dice_weight <= 0.0 {
            return LossOutput {
                total: cross_entropy.clone(),
                cross_entropy,
                dice: None,
            };
        }

        let dice = dice_loss(logits, targets, num_classes, self.ignore_index, self.eps);
        LossOutput {
            total: cross_entropy.clone() + dice.clone().mul_scalar(self.dice_weight),
            cross_entropy,
            dice: Some(dice),
        }
    }

    pub const fn ignore_index(&self) -> i64 {
        self.ignore_index
    }
}
