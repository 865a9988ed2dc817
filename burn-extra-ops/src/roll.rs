use burn::prelude::*;

/// Cyclically shift `input` by `shifts[i]` along `dims[i]`.
///
/// Positive shifts move elements towards higher indices, matching `torch.roll`.
pub fn roll<B: Backend, const D: usize>(
    input: Tensor<B, D>,
    shifts: &[i64],
    dims: &[usize],
) -> Tensor<B, D> {
    shifts
        .iter()
        .zip(dims)
        .fold(input, |acc, (&shift, &dim)| roll_dim(acc, shift, dim))
}

fn roll_dim<B: Backend, const D: usize>(input: Tensor<B, D>, shift: i64, dim: usize) -> Tensor<B, D> {
    let size = input.dims()[dim] as i64;
    if size == 0 {
        return input;
    }
    let start = (size - shift).rem_euclid(size) as usize;
    if start == 0 {
        return input;
    }
    let size = size as usize;
    let head = input.clone().narrow(dim, start, size - start);
    let tail = input.narrow(dim, 0, start);
    Tensor::cat(vec![head, tail], dim)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    #[test]
    fn positive_shift_moves_forward() {
        let device = Default::default();
        let x = Tensor::<NdArray, 1>::from_floats([0.0, 1.0, 2.0, 3.0], &device);

        let values: Vec<f32> = roll(x, &[1], &[0]).into_data().iter::<f32>().collect();

        assert_eq!(values, vec![3.0, 0.0, 1.0, 2.0]);
    }

    #[test]
    fn opposite_shifts_cancel_on_two_dims() {
        let device = Default::default();
        let x = Tensor::<NdArray, 1>::from_floats(
            [0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0],
            &device,
        )
        .reshape([1, 3, 3, 1]);

        let shifted = roll(x.clone(), &[-1, -1], &[1, 2]);
        let first: Vec<f32> = shifted.clone().into_data().iter::<f32>().collect();
        let restored = roll(shifted, &[1, 1], &[1, 2]);

        assert_eq!(first, vec![4.0, 5.0, 3.0, 7.0, 8.0, 6.0, 1.0, 2.0, 0.0]);
        let diff: f32 = (restored - x).abs().sum().into_scalar();
        assert_eq!(diff, 0.0);
    }
}
