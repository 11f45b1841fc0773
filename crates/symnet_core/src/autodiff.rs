use num_traits::{Float, FromPrimitive, Num, NumCast, One, ToPrimitive, Zero};
use std::ops::{
    Add, AddAssign, Div, DivAssign, Mul, MulAssign, Neg, Rem, RemAssign, Sub, SubAssign,
};

/// Dual number for forward-mode differentiation.
/// val: real part
/// eps: tangent (derivative) part
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Dual {
    pub val: f64,
    pub eps: f64,
}

impl Dual {
    pub fn new(val: f64, eps: f64) -> Self {
        Self { val, eps }
    }

    /// A value we differentiate with respect to (tangent seeded with 1).
    pub fn variable(val: f64) -> Self {
        Self::new(val, 1.0)
    }

    /// A value held fixed during differentiation.
    pub fn fixed(val: f64) -> Self {
        Self::new(val, 0.0)
    }
}

/// Evaluates `f` at `x` and returns `(f(x), f'(x))`.
pub fn derivative<F>(f: F, x: f64) -> (f64, f64)
where
    F: Fn(Dual) -> Dual,
{
    let out = f(Dual::variable(x));
    (out.val, out.eps)
}

/// Evaluates a two-argument `f` and returns `(f(a, b), ∂f/∂a, ∂f/∂b)`.
pub fn partials2<F>(f: F, a: f64, b: f64) -> (f64, f64, f64)
where
    F: Fn(Dual, Dual) -> Dual,
{
    let da = f(Dual::variable(a), Dual::fixed(b));
    let db = f(Dual::fixed(a), Dual::variable(b));
    (da.val, da.eps, db.eps)
}

impl Zero for Dual {
    fn zero() -> Self {
        Self::new(0.0, 0.0)
    }
    fn is_zero(&self) -> bool {
        self.val == 0.0 && self.eps == 0.0
    }
}

impl One for Dual {
    fn one() -> Self {
        Self::new(1.0, 0.0)
    }
}

impl Add for Dual {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self::new(self.val + rhs.val, self.eps + rhs.eps)
    }
}

impl Sub for Dual {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self::new(self.val - rhs.val, self.eps - rhs.eps)
    }
}

impl Mul for Dual {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self {
        Self::new(self.val * rhs.val, self.val * rhs.eps + self.eps * rhs.val)
    }
}

impl Div for Dual {
    type Output = Self;
    fn div(self, rhs: Self) -> Self {
        let denom = rhs.val * rhs.val;
        Self::new(
            self.val / rhs.val,
            (self.eps * rhs.val - self.val * rhs.eps) / denom,
        )
    }
}

impl Neg for Dual {
    type Output = Self;
    fn neg(self) -> Self {
        Self::new(-self.val, -self.eps)
    }
}

impl Rem for Dual {
    type Output = Self;
    fn rem(self, rhs: Self) -> Self {
        // d/dx (x mod c) = 1 away from the jumps.
        Self::new(self.val % rhs.val, self.eps)
    }
}

impl AddAssign for Dual {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}
impl SubAssign for Dual {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}
impl MulAssign for Dual {
    fn mul_assign(&mut self, rhs: Self) {
        *self = *self * rhs;
    }
}
impl DivAssign for Dual {
    fn div_assign(&mut self, rhs: Self) {
        *self = *self / rhs;
    }
}
impl RemAssign for Dual {
    fn rem_assign(&mut self, rhs: Self) {
        *self = *self % rhs;
    }
}

impl Num for Dual {
    type FromStrRadixErr = ();
    fn from_str_radix(str: &str, radix: u32) -> Result<Self, Self::FromStrRadixErr> {
        f64::from_str_radix(str, radix)
            .map(Self::fixed)
            .map_err(|_| ())
    }
}

impl ToPrimitive for Dual {
    fn to_i64(&self) -> Option<i64> {
        self.val.to_i64()
    }
    fn to_u64(&self) -> Option<u64> {
        self.val.to_u64()
    }
    fn to_f64(&self) -> Option<f64> {
        Some(self.val)
    }
}

impl FromPrimitive for Dual {
    fn from_i64(n: i64) -> Option<Self> {
        Some(Self::fixed(n as f64))
    }
    fn from_u64(n: u64) -> Option<Self> {
        Some(Self::fixed(n as f64))
    }
    fn from_f64(n: f64) -> Option<Self> {
        Some(Self::fixed(n))
    }
}

impl NumCast for Dual {
    fn from<T: ToPrimitive>(n: T) -> Option<Self> {
        n.to_f64().map(Self::fixed)
    }
}

impl Float for Dual {
    fn nan() -> Self {
        Self::fixed(f64::NAN)
    }
    fn infinity() -> Self {
        Self::fixed(f64::INFINITY)
    }
    fn neg_infinity() -> Self {
        Self::fixed(f64::NEG_INFINITY)
    }
    fn neg_zero() -> Self {
        Self::new(-0.0, -0.0)
    }
    fn min_value() -> Self {
        Self::fixed(f64::MIN)
    }
    fn min_positive_value() -> Self {
        Self::fixed(f64::MIN_POSITIVE)
    }
    fn max_value() -> Self {
        Self::fixed(f64::MAX)
    }
    fn is_nan(self) -> bool {
        self.val.is_nan()
    }
    fn is_infinite(self) -> bool {
        self.val.is_infinite()
    }
    fn is_finite(self) -> bool {
        self.val.is_finite()
    }
    fn is_normal(self) -> bool {
        self.val.is_normal()
    }
    fn classify(self) -> std::num::FpCategory {
        self.val.classify()
    }
    fn floor(self) -> Self {
        Self::fixed(self.val.floor())
    }
    fn ceil(self) -> Self {
        Self::fixed(self.val.ceil())
    }
    fn round(self) -> Self {
        Self::fixed(self.val.round())
    }
    fn trunc(self) -> Self {
        Self::fixed(self.val.trunc())
    }
    fn fract(self) -> Self {
        Self::new(self.val.fract(), self.eps)
    }
    fn abs(self) -> Self {
        Self::new(
            self.val.abs(),
            if self.val >= 0.0 { self.eps } else { -self.eps },
        )
    }
    fn signum(self) -> Self {
        Self::fixed(self.val.signum())
    }
    fn is_sign_positive(self) -> bool {
        self.val.is_sign_positive()
    }
    fn is_sign_negative(self) -> bool {
        self.val.is_sign_negative()
    }
    fn mul_add(self, a: Self, b: Self) -> Self {
        self * a + b
    }
    fn recip(self) -> Self {
        Self::one() / self
    }

    fn powi(self, n: i32) -> Self {
        if n == 0 {
            return Self::one();
        }
        let val_pow = self.val.powi(n);
        Self::new(val_pow, (n as f64) * self.val.powi(n - 1) * self.eps)
    }

    fn powf(self, n: Self) -> Self {
        // x^y = exp(y * ln(x)); the ln term only matters when the exponent carries a tangent.
        let val_pow = self.val.powf(n.val);
        let base_term = if self.eps == 0.0 {
            0.0
        } else {
            n.val * self.val.powf(n.val - 1.0) * self.eps
        };
        let exp_term = if n.eps == 0.0 {
            0.0
        } else {
            val_pow * self.val.ln() * n.eps
        };
        Self::new(val_pow, base_term + exp_term)
    }

    fn sqrt(self) -> Self {
        let s = self.val.sqrt();
        Self::new(s, self.eps / (2.0 * s))
    }

    fn exp(self) -> Self {
        let e = self.val.exp();
        Self::new(e, e * self.eps)
    }

    fn exp2(self) -> Self {
        let e = self.val.exp2();
        Self::new(e, e * std::f64::consts::LN_2 * self.eps)
    }
    fn ln(self) -> Self {
        Self::new(self.val.ln(), self.eps / self.val)
    }
    fn log(self, base: Self) -> Self {
        self.ln() / base.ln()
    }
    fn log2(self) -> Self {
        Self::new(self.val.log2(), self.eps / (self.val * std::f64::consts::LN_2))
    }
    fn log10(self) -> Self {
        Self::new(
            self.val.log10(),
            self.eps / (self.val * std::f64::consts::LN_10),
        )
    }

    fn max(self, other: Self) -> Self {
        if self.val > other.val {
            self
        } else {
            other
        }
    }
    fn min(self, other: Self) -> Self {
        if self.val < other.val {
            self
        } else {
            other
        }
    }

    fn abs_sub(self, other: Self) -> Self {
        if self.val > other.val {
            self - other
        } else {
            Self::zero()
        }
    }

    fn cbrt(self) -> Self {
        let c = self.val.cbrt();
        Self::new(c, self.eps / (3.0 * c * c))
    }
    fn hypot(self, other: Self) -> Self {
        (self * self + other * other).sqrt()
    }

    fn sin(self) -> Self {
        Self::new(self.val.sin(), self.eps * self.val.cos())
    }
    fn cos(self) -> Self {
        Self::new(self.val.cos(), -self.eps * self.val.sin())
    }
    fn tan(self) -> Self {
        let t = self.val.tan();
        Self::new(t, self.eps * (1.0 + t * t))
    }
    fn asin(self) -> Self {
        Self::new(
            self.val.asin(),
            self.eps / (1.0 - self.val * self.val).sqrt(),
        )
    }
    fn acos(self) -> Self {
        Self::new(
            self.val.acos(),
            -self.eps / (1.0 - self.val * self.val).sqrt(),
        )
    }
    fn atan(self) -> Self {
        Self::new(self.val.atan(), self.eps / (1.0 + self.val * self.val))
    }
    fn atan2(self, other: Self) -> Self {
        let denom = self.val * self.val + other.val * other.val;
        Self::new(
            self.val.atan2(other.val),
            (other.val * self.eps - self.val * other.eps) / denom,
        )
    }
    fn sin_cos(self) -> (Self, Self) {
        (self.sin(), self.cos())
    }

    fn exp_m1(self) -> Self {
        Self::new(self.val.exp_m1(), self.val.exp() * self.eps)
    }
    fn ln_1p(self) -> Self {
        Self::new(self.val.ln_1p(), self.eps / (1.0 + self.val))
    }
    fn sinh(self) -> Self {
        Self::new(self.val.sinh(), self.eps * self.val.cosh())
    }
    fn cosh(self) -> Self {
        Self::new(self.val.cosh(), self.eps * self.val.sinh())
    }
    fn tanh(self) -> Self {
        let t = self.val.tanh();
        Self::new(t, self.eps * (1.0 - t * t))
    }
    fn asinh(self) -> Self {
        Self::new(
            self.val.asinh(),
            self.eps / (self.val * self.val + 1.0).sqrt(),
        )
    }
    fn acosh(self) -> Self {
        Self::new(
            self.val.acosh(),
            self.eps / (self.val * self.val - 1.0).sqrt(),
        )
    }
    fn atanh(self) -> Self {
        Self::new(self.val.atanh(), self.eps / (1.0 - self.val * self.val))
    }

    fn integer_decode(self) -> (u64, i16, i8) {
        self.val.integer_decode()
    }
}

#[cfg(test)]
mod tests {
    use super::{derivative, partials2, Dual};
    use num_traits::Float;

    #[test]
    fn derivative_of_sine_is_cosine() {
        let (value, slope) = derivative(|x| x.sin(), 0.3);
        assert!((value - 0.3_f64.sin()).abs() < 1e-15);
        assert!((slope - 0.3_f64.cos()).abs() < 1e-15);
    }

    #[test]
    fn partials_of_product() {
        let (value, da, db) = partials2(|a, b| a * b, 2.0, -3.0);
        assert_eq!(value, -6.0);
        assert_eq!(da, -3.0);
        assert_eq!(db, 2.0);
    }

    #[test]
    fn powf_with_constant_exponent_handles_negative_base() {
        let out = Dual::variable(-2.0).powf(Dual::fixed(2.0));
        assert!((out.val - 4.0).abs() < 1e-12);
        assert!((out.eps + 4.0).abs() < 1e-12);
    }

    #[test]
    fn clamping_through_max_min_kills_tangent() {
        let clamped = Dual::variable(1.7)
            .max(Dual::fixed(0.0))
            .min(Dual::fixed(1.0));
        assert_eq!(clamped.val, 1.0);
        assert_eq!(clamped.eps, 0.0);

        let inside = Dual::variable(0.4)
            .max(Dual::fixed(0.0))
            .min(Dual::fixed(1.0));
        assert_eq!(inside.eps, 1.0);
    }

    #[test]
    fn tanh_and_atan_match_closed_forms() {
        let (_, d_tanh) = derivative(|x| x.tanh(), 0.5);
        let t = 0.5_f64.tanh();
        assert!((d_tanh - (1.0 - t * t)).abs() < 1e-14);

        let (_, d_atan) = derivative(|x| x.atan(), 2.0);
        assert!((d_atan - 0.2).abs() < 1e-14);
    }
}
