use num_traits::{Float, FromPrimitive};
use std::fmt::Debug;

/// A trait for types that can flow through the network and the formula VM.
/// Implemented by `f64` and by the forward-mode [`Dual`](crate::autodiff::Dual).
pub trait Scalar: Float + FromPrimitive + Debug + 'static {
    /// Lifts a plain constant into the scalar type.
    fn constant(value: f64) -> Self {
        Self::from_f64(value).unwrap_or_else(Self::nan)
    }

    /// Logistic function. Only ever exponentiates a non-positive argument, so neither the
    /// value nor a dual tangent overflows at large `|self|`.
    fn sigmoid(self) -> Self {
        if self >= Self::zero() {
            Self::one() / (Self::one() + (-self).exp())
        } else {
            let e = self.exp();
            e / (Self::one() + e)
        }
    }
}

impl<T: Float + FromPrimitive + Debug + 'static> Scalar for T {}

/// Source of uniform noise for the stochastic gates.
///
/// Sampling is kept behind this trait so that training-mode forward passes can be made
/// deterministic in tests.
pub trait NoiseSource {
    /// Returns a sample from U(low, high).
    fn uniform(&mut self, low: f64, high: f64) -> f64;
}
