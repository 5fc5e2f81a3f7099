//! # CPU Numeric Kernels
//!
//! Dense linear algebra and scalar helpers shared by the layer implementations.
//!
//! ## Submodules
//!
//! - [`blas`]: strided `addmm`, `addmv`, `addr` and `mul` over [`Tensor`]s,
//!   parallelized across output rows with [`rayon`] when the output is row-major.
//!
//! ## Conventions
//!
//! - Operands may be any strided view; outputs are written through their strides.
//! - Shape disagreement is a programming error and panics with a diagnostic.
//! - The output may share storage with an operand; the operand is snapshotted first.
//!
//! ## Feature Flags
//!
//! - `exact-exp`: [`exp_minus_approx`] evaluates `exp(-x)` exactly instead of
//!   with the polynomial approximation.
//!
//! [`Tensor`]: crate::tensors::Tensor

pub mod blas;

pub use blas::{addmm, addmv, addr, mul};

/// Approximates `exp(-x)` for `x >= 0`.
///
/// A fourth order polynomial in `x` raised to the 8th power, then inverted.
/// Inputs of 13 and above return exactly `0`.
#[cfg(not(feature = "exact-exp"))]
#[must_use]
pub fn exp_minus_approx(x: f64) -> f64 {
    const A0: f64 = 1.0;
    const A1: f64 = 0.125;
    const A2: f64 = 0.007_812_5;
    const A3: f64 = 0.000_325_520_83;
    const A4: f64 = 1.017_252_6e-5;

    if x < 13.0 {
        let mut y = A0 + x * (A1 + x * (A2 + x * (A3 + x * A4)));
        y *= y;
        y *= y;
        y *= y;
        1.0 / y
    } else {
        0.0
    }
}

/// Evaluates `exp(-x)`.
#[cfg(feature = "exact-exp")]
#[must_use]
pub fn exp_minus_approx(x: f64) -> f64 {
    (-x).exp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exp_minus_tracks_the_exponential() {
        for i in 0..120 {
            let x = f64::from(i) * 0.1;
            let expected = (-x).exp();
            assert!(
                (exp_minus_approx(x) - expected).abs() < 1e-3,
                "exp(-{x}) = {expected}, got {}",
                exp_minus_approx(x)
            );
        }
    }

    #[test]
    fn exp_minus_of_zero_is_one() {
        assert_eq!(exp_minus_approx(0.0), 1.0);
    }

    #[cfg(not(feature = "exact-exp"))]
    #[test]
    fn exp_minus_cuts_off_at_thirteen() {
        assert_eq!(exp_minus_approx(13.0), 0.0);
        assert_eq!(exp_minus_approx(50.0), 0.0);
        assert!(exp_minus_approx(12.9) > 0.0);
    }
}
