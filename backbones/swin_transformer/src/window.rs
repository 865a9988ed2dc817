//! Window partitioning helpers and the shifted-window attention mask.

use burn::prelude::*;

/// `[b, h, w, c]` -> `[b * (h / ws) * (w / ws), ws, ws, c]`, windows in row-major order.
pub(crate) fn window_partition<B: Backend>(x: Tensor<B, 4>, ws: usize) -> Tensor<B, 4> {
    let [b, h, w, c] = x.dims();
    x.reshape([b, h / ws, ws, w / ws, ws, c])
        .permute([0, 1, 3, 2, 4, 5])
        .reshape([b * (h / ws) * (w / ws), ws, ws, c])
}

/// Inverse of [`window_partition`].
pub(crate) fn window_reverse<B: Backend>(
    windows: Tensor<B, 4>,
    ws: usize,
    h: usize,
    w: usize,
) -> Tensor<B, 4> {
    let [n, _, _, c] = windows.dims();
    let b = n / ((h / ws) * (w / ws));
    windows
        .reshape([b, h / ws, w / ws, ws, ws, c])
        .permute([0, 1, 3, 2, 4, 5])
        .reshape([b, h, w, c])
}

/// Index into the relative position bias table for every (query, key) pair of a window.
pub(crate) fn relative_position_index(ws: usize) -> Vec<i64> {
    let area = ws * ws;
    let span = (2 * ws - 1) as i64;
    let mut index = Vec::with_capacity(area * area);
    for q in 0..area {
        for k in 0..area {
            let dy = (q / ws) as i64 - (k / ws) as i64 + ws as i64 - 1;
            let dx = (q % ws) as i64 - (k % ws) as i64 + ws as i64 - 1;
            index.push(dy * span + dx);
        }
    }
    index
}

/// Additive mask `[num_windows, ws², ws²]` for shifted-window attention on a padded
/// `hp x wp` grid: `0` between tokens of the same region, `-100` otherwise.
pub(crate) fn shifted_window_mask<B: Backend>(
    hp: usize,
    wp: usize,
    ws: usize,
    shift: usize,
    device: &B::Device,
) -> Tensor<B, 3> {
    let region = |pos: usize, len: usize| {
        if pos < len - ws {
            0
        } else if pos < len - shift {
            1
        } else {
            2
        }
    };
    let (rows, cols, area) = (hp / ws, wp / ws, ws * ws);
    let mut data = Vec::with_capacity(rows * cols * area * area);
    for wr in 0..rows {
        for wc in 0..cols {
            let labels: Vec<usize> = (0..area)
                .map(|k| region(wr * ws + k / ws, hp) * 3 + region(wc * ws + k % ws, wp))
                .collect();
            for a in &labels {
                data.extend(labels.iter().map(|b| if a == b { 0.0f32 } else { -100.0 }));
            }
        }
    }
    Tensor::from_data(TensorData::new(data, [rows * cols, area, area]), device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::{backend::NdArray, tensor::Distribution};

    type TestBackend = NdArray;

    #[test]
    fn partition_then_reverse_is_identity() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 4>::random([2, 14, 21, 8], Distribution::Normal(0.0, 1.0), &device);

        let windows = window_partition(x.clone(), 7);
        assert_eq!(windows.dims(), [2 * 2 * 3, 7, 7, 8]);

        let restored = window_reverse(windows, 7, 14, 21);
        let diff: f32 = (restored - x).abs().max().into_scalar();
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn relative_index_spans_bias_table() {
        let index = relative_position_index(7);
        assert_eq!(index.len(), 49 * 49);
        assert_eq!(index.iter().copied().min(), Some(0));
        assert_eq!(index.iter().copied().max(), Some(13 * 13 - 1));
        // Self-attention of a token always hits the table centre.
        assert_eq!(index[0], 6 * 13 + 6);
    }

    #[test]
    fn shifted_mask_blocks_cross_region_pairs() {
        let device = Default::default();
        let mask = shifted_window_mask::<TestBackend>(14, 14, 7, 3, &device);
        assert_eq!(mask.dims(), [4, 49, 49]);

        let values: Vec<f32> = mask.into_data().iter::<f32>().collect();
        // First window lies entirely in region (0, 0).
        assert!(values[..49 * 49].iter().all(|v| *v == 0.0));
        // Last window mixes regions, so some pairs are masked.
        assert!(values[3 * 49 * 49..].iter().any(|v| *v == -100.0));
    }
}
