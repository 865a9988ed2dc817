//! Confusion-matrix evaluation: per-class IoU, mean IoU and pixel accuracy.

use burn::prelude::*;

use crate::error::{FloodSegError, FloodSegResult};

const EPS: f64 = 1e-6;

/// Square matrix of pixel counts, row = true class, column = predicted class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfusionMatrix {
    num_classes: usize,
    counts: Vec<u64>,
}

impl ConfusionMatrix {
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            counts: vec![0; num_classes * num_classes],
        }
    }

    pub const fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn get(&self, truth: usize, predicted: usize) -> u64 {
        self.counts[truth * self.num_classes + predicted]
    }

    /// Counts pixel pairs whose true label lies in `[0, num_classes)`; all others are skipped.
    pub fn update_from_slices(&mut self, predictions: &[i64], targets: &[i64]) {
        let n = self.num_classes as i64;
        for (&pred, &truth) in predictions.iter().zip(targets) {
            if !(0..n).contains(&truth) {
                continue;
            }
            let pred = pred.clamp(0, n - 1);
            self.counts[(truth * n + pred) as usize] += 1;
        }
    }

    /// Accumulates a batch of predicted and true class maps, both `[b, h, w]`.
    pub fn update<B: Backend>(
        &mut self,
        predictions: Tensor<B, 3, Int>,
        targets: Tensor<B, 3, Int>,
    ) -> FloodSegResult<()> {
        if predictions.dims() != targets.dims() {
            return Err(FloodSegError::InvalidTensorShape {
                expected: format!("{:?}", targets.dims()),
                actual: format!("{:?}", predictions.dims()),
            });
        }
        let predictions = int_values(predictions)?;
        let targets = int_values(targets)?;
        self.update_from_slices(&predictions, &targets);
        Ok(())
    }

    pub fn merge(&mut self, other: &Self) {
        for (count, extra) in self.counts.iter_mut().zip(&other.counts) {
            *count += extra;
        }
    }

    /// Number of valid pixels seen so far.
    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    fn correct(&self) -> u64 {
        (0..self.num_classes).map(|c| self.get(c, c)).sum()
    }

    pub fn per_class_iou(&self) -> Vec<f64> {
        (0..self.num_classes)
            .map(|c| {
                let tp = self.get(c, c) as f64;
                let row: u64 = (0..self.num_classes).map(|p| self.get(c, p)).sum();
                let col: u64 = (0..self.num_classes).map(|t| self.get(t, c)).sum();
                let fn_ = row as f64 - tp;
                let fp = col as f64 - tp;
                tp / (tp + fp + fn_ + EPS)
            })
            .collect()
    }

    /// Unweighted mean of the per-class IoU, absent classes included.
    pub fn mean_iou(&self) -> f64 {
        if self.num_classes == 0 {
            return 0.0;
        }
        self.per_class_iou().iter().sum::<f64>() / self.num_classes as f64
    }

    pub fn pixel_accuracy(&self) -> f64 {
        self.correct() as f64 / (self.total() as f64 + EPS)
    }

    pub fn metrics(&self) -> SegmentationMetrics {
        SegmentationMetrics {
            miou: self.mean_iou(),
            accuracy: self.pixel_accuracy(),
            per_class_iou: self.per_class_iou(),
        }
    }
}

fn int_values<B: Backend>(tensor: Tensor<B, 3, Int>) -> FloodSegResult<Vec<i64>> {
    tensor
        .into_data()
        .convert::<i64>()
        .to_vec::<i64>()
        .map_err(|err| FloodSegError::DatasetError {
            message: format!("cannot read class map: {err:?}"),
        })
}

/// Summary of one validation pass.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentationMetrics {
    pub miou: f64,
    pub accuracy: f64,
    pub per_class_iou: Vec<f64>,
}

#[cfg(feature = "train")]
pub use evaluation::evaluate;

#[cfg(feature = "train")]
mod evaluation {
    use std::sync::Arc;

    use burn::{data::dataloader::DataLoader, prelude::*};

    use super::{ConfusionMatrix, SegmentationMetrics};
    use crate::{
        dataset::SegmentationBatch, error::FloodSegResult, models::SegmentationModel,
        telemetry::Heartbeat,
    };

    /// Runs `model` over every validation batch and accumulates a confusion matrix.
    /// A batch with undecodable samples or out-of-range labels fails the pass.
    ///
    /// `model` lives on a non-autodiff backend, so no gradients are tracked.
    pub fn evaluate<B: Backend>(
        model: &SegmentationModel<B>,
        loader: Arc<dyn DataLoader<B, SegmentationBatch<B>>>,
        num_classes: usize,
        heartbeat: &Heartbeat,
    ) -> FloodSegResult<SegmentationMetrics> {
        let mut confusion = ConfusionMatrix::new(num_classes);

        for (index, batch) in loader.iter().enumerate() {
            batch.validate(num_classes)?;
            let logits = model.forward(batch.images)?;
            let predictions = logits.argmax(1).squeeze::<3>(1);
            confusion.update(predictions, batch.masks)?;
            tracing::debug!(batch = index + 1, valid_pixels = confusion.total(), "evaluated batch");
            heartbeat.ping();
        }

        Ok(confusion.metrics())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    #[test]
    fn matrix_counts_only_valid_pixels() {
        let device = Default::default();
        let preds = Tensor::<NdArray, 3, Int>::from_ints([[[0, 1], [2, 1]]], &device);
        let targets = Tensor::<NdArray, 3, Int>::from_ints([[[0, 255], [2, 0]]], &device);

        let mut confusion = ConfusionMatrix::new(3);
        confusion.update(preds, targets).unwrap();

        assert_eq!(confusion.total(), 3);
        assert_eq!(confusion.get(0, 0), 1);
        assert_eq!(confusion.get(0, 1), 1);
        assert_eq!(confusion.get(2, 2), 1);
    }

    #[test]
    fn perfect_prediction_scores_one() {
        let mut confusion = ConfusionMatrix::new(2);
        confusion.update_from_slices(&[0, 1, 1, 0], &[0, 1, 1, 0]);

        let metrics = confusion.metrics();
        assert!((metrics.miou - 1.0).abs() < 1e-5);
        assert!((metrics.accuracy - 1.0).abs() < 1e-5);
    }

    #[test]
    fn iou_from_counts() {
        let mut confusion = ConfusionMatrix::new(2);
        // truth 0: predicted 0 twice, 1 once; truth 1: predicted 1 once.
        confusion.update_from_slices(&[0, 0, 1, 1], &[0, 0, 0, 1]);

        let iou = confusion.per_class_iou();
        assert!((iou[0] - 2.0 / 3.0).abs() < 1e-5);
        assert!((iou[1] - 0.5).abs() < 1e-5);
        assert!((confusion.pixel_accuracy() - 0.75).abs() < 1e-5);
    }

    #[test]
    fn empty_matrix_is_finite() {
        let confusion = ConfusionMatrix::new(4);
        assert_eq!(confusion.mean_iou(), 0.0);
        assert_eq!(confusion.pixel_accuracy(), 0.0);
    }

    #[test]
    fn merge_adds_counts() {
        let mut a = ConfusionMatrix::new(2);
        a.update_from_slices(&[0], &[0]);
        let mut b = ConfusionMatrix::new(2);
        b.update_from_slices(&[1, 0], &[1, 1]);

        a.merge(&b);
        assert_eq!(a.total(), 3);
        assert_eq!(a.get(1, 0), 1);
    }

    #[test]
    fn mismatched_shapes_are_rejected() {
        let device = Default::default();
        let preds = Tensor::<NdArray, 3, Int>::zeros([1, 2, 2], &device);
        let targets = Tensor::<NdArray, 3, Int>::zeros([1, 2, 3], &device);

        let mut confusion = ConfusionMatrix::new(2);
        assert!(confusion.update(preds, targets).is_err());
    }
}
