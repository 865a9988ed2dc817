use burn::{prelude::*, tensor::Distribution};

use crate::erfinv::Erfinv;

/// Refill `x` with samples from `N(mean, std²)` truncated to `[a, b]`.
///
/// Inverse-CDF sampling: draw uniformly between the CDF values of the bounds and map back
/// through `erfinv`.
pub fn trunc_normal<B: Backend, const D: usize>(
    x: Tensor<B, D>,
    mean: f64,
    std: f64,
    a: f64,
    b: f64,
) -> Tensor<B, D> {
    let cdf = |v: f64| (1.0 + libm::erf(v / core::f64::consts::SQRT_2)) / 2.0;
    let low = cdf((a - mean) / std);
    let high = cdf((b - mean) / std);

    x.random_like(Distribution::Uniform(2.0 * low - 1.0, 2.0 * high - 1.0))
        .erfinv()
        .mul_scalar(std * core::f64::consts::SQRT_2)
        .add_scalar(mean)
        .clamp(a, b)
}
