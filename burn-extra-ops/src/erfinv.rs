//! Inverse error function.
//!
//! Rational approximation (Giles-style split at |y| = 0.7) refined with two Newton steps.

use burn::prelude::*;
use core::f64::consts::PI;

const CENTRAL: f64 = 0.7;
const A: [f64; 4] = [0.886226899, -1.645349621, 0.914624893, -0.140543331];
const B: [f64; 4] = [-2.118377725, 1.442710462, -0.329097515, 0.012229801];
const C: [f64; 4] = [-1.970840454, -1.624906493, 3.429567803, 1.641345311];
const D_: [f64; 2] = [3.543889200, 1.637067800];

pub trait Erfinv {
    fn erfinv(self) -> Self;
}

impl<Bk: Backend, const N: usize> Erfinv for Tensor<Bk, N> {
    fn erfinv(self) -> Self {
        erfinv(self)
    }
}

/// Element-wise inverse error function. `|y| >= 1` maps to `±inf`.
pub fn erfinv<Bk: Backend, const N: usize>(y: Tensor<Bk, N>) -> Tensor<Bk, N> {
    let magnitude = y.clone().abs();

    let z = y.clone().powf_scalar(2.0);
    let num = ((z.clone() * A[3] + A[2]) * z.clone() + A[1]) * z.clone() + A[0];
    let den = (((z.clone() * B[3] + B[2]) * z.clone() + B[1]) * z.clone() + B[0]) * z + 1.0;
    let central = y.clone() * num / den;

    // Clamp keeps the log finite; those lanes are overwritten below.
    let w = ((magnitude.clone().clamp_max(0.999_999) * -1.0 + 1.0) / 2.0)
        .log()
        .neg()
        .sqrt();
    let num = ((w.clone() * C[3] + C[2]) * w.clone() + C[1]) * w.clone() + C[0];
    let den = (w.clone() * D_[1] + D_[0]) * w + 1.0;
    let outer = y.clone().sign() * num / den;

    let mut x = central.mask_where(magnitude.clone().greater_elem(CENTRAL), outer);

    let two_over_sqrt_pi = 2.0 / PI.sqrt();
    for _ in 0..2 {
        let step = (x.clone().erf() - y.clone())
            / ((-x.clone().powf_scalar(2.0)).exp() * two_over_sqrt_pi);
        x = x - step;
    }

    let saturated = magnitude.greater_equal_elem(1.0);
    let infinite = y.sign() * f64::INFINITY;
    x.mask_where(saturated, infinite)
}
