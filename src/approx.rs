//! Tolerance-graded comparison of floating point values and tensors.
//!
//! Forward kernels accumulate in different orders depending on layout and
//! thread count, and softmax uses an approximate exponential. Outputs are
//! compared against references with these grades rather than with `==`.

use crate::tensors::Tensor;

/// Largest absolute difference still considered [`ApproxEquality::Relative`] for `f32`.
pub const F32_MAX_ERROR: f32 = 1e-3;

/// Largest absolute difference still considered [`ApproxEquality::Partial`] for `f32`.
pub const F32_AVG_ERROR: f32 = 1e-5;

/// Largest absolute difference still considered [`ApproxEquality::Precise`] for `f32`.
pub const F32_MIN_ERROR: f32 = 1e-6;

/// `f64` counterpart of [`F32_MAX_ERROR`].
pub const F64_MAX_ERROR: f64 = 1e-3;

/// `f64` counterpart of [`F32_AVG_ERROR`].
pub const F64_AVG_ERROR: f64 = 1e-6;

/// `f64` counterpart of [`F32_MIN_ERROR`].
pub const F64_MIN_ERROR: f64 = 1e-13;

/// How close two values are, from best to worst.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ApproxEquality {
    /// Below the minimum error.
    Precise = 0,

    /// Below the average error.
    Partial = 1,

    /// Below the maximum error.
    Relative = 2,

    /// Not equal.
    Scarce = 3,
}

/// Grades the distance between `self` and `rhs`.
pub trait RelativeEq<Rhs: ?Sized> {
    /// The grade of the worst element pair.
    fn approx_eq(&self, rhs: &Rhs) -> ApproxEquality;
}

macro_rules! grade_float {
    ($t:ty, $min:expr, $avg:expr, $max:expr) => {
        impl RelativeEq<Self> for $t {
            fn approx_eq(&self, rhs: &Self) -> ApproxEquality {
                let dif = (self - rhs).abs();
                if dif < $min {
                    ApproxEquality::Precise
                } else if dif < $avg {
                    ApproxEquality::Partial
                } else if dif < $max {
                    ApproxEquality::Relative
                } else {
                    ApproxEquality::Scarce
                }
            }
        }
    };
}

grade_float!(f32, F32_MIN_ERROR, F32_AVG_ERROR, F32_MAX_ERROR);
grade_float!(f64, F64_MIN_ERROR, F64_AVG_ERROR, F64_MAX_ERROR);

fn worst<'a, T, U, I>(pairs: I) -> ApproxEquality
where
    T: RelativeEq<U> + 'a,
    U: 'a,
    I: Iterator<Item = (&'a T, &'a U)>,
{
    let mut eq = ApproxEquality::Precise;
    for (a, b) in pairs {
        eq = eq.max(a.approx_eq(b));
        if eq == ApproxEquality::Scarce {
            break;
        }
    }
    eq
}

impl<T: RelativeEq<U>, U> RelativeEq<[U]> for [T] {
    fn approx_eq(&self, rhs: &[U]) -> ApproxEquality {
        if self.len() != rhs.len() {
            return ApproxEquality::Scarce;
        }
        worst(self.iter().zip(rhs))
    }
}

impl<const N: usize, T: RelativeEq<U>, U> RelativeEq<[U; N]> for [T; N] {
    fn approx_eq(&self, rhs: &[U; N]) -> ApproxEquality {
        worst(self.iter().zip(rhs))
    }
}

impl RelativeEq<Self> for Tensor {
    /// Tensors of different shapes are [`ApproxEquality::Scarce`].
    fn approx_eq(&self, rhs: &Self) -> ApproxEquality {
        if self.sizes() != rhs.sizes() {
            return ApproxEquality::Scarce;
        }
        self.to_vec().approx_eq(&rhs.to_vec()[..])
    }
}

impl RelativeEq<[f32]> for Tensor {
    fn approx_eq(&self, rhs: &[f32]) -> ApproxEquality {
        self.to_vec()[..].approx_eq(rhs)
    }
}

impl RelativeEq<[f32]> for Vec<f32> {
    fn approx_eq(&self, rhs: &[f32]) -> ApproxEquality {
        self[..].approx_eq(rhs)
    }
}

/// Whether `a` and `b` are [`ApproxEquality::Precise`]ly equal.
pub fn approx_eq<A: RelativeEq<B> + ?Sized, B: ?Sized>(a: &A, b: &B) -> bool {
    a.approx_eq(b) == ApproxEquality::Precise
}

/// Whether `a` and `b` are equal within the maximum error.
pub fn roughly_eq<A: RelativeEq<B> + ?Sized, B: ?Sized>(a: &A, b: &B) -> bool {
    a.approx_eq(b) <= ApproxEquality::Relative
}
