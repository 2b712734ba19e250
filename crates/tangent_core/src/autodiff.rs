use crate::error::{IntegratorError, Result};
use crate::traits::{CopyMap, DaeFunction, DaeModel, DaeRef, Signature};
use num_traits::{Float, FromPrimitive, Num, NumCast, One, ToPrimitive, Zero};
use std::ops::{
    Add, AddAssign, Div, DivAssign, Mul, MulAssign, Neg, Rem, RemAssign, Sub, SubAssign,
};
use std::sync::Arc;

/// Simple Dual Number for Forward Mode AD
/// val: real part
/// eps: infinitesimal part
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Dual {
    pub val: f64,
    pub eps: f64,
}

impl Dual {
    pub fn new(val: f64, eps: f64) -> Self {
        Self { val, eps }
    }

    pub fn constant(val: f64) -> Self {
        Self::new(val, 0.0)
    }

    /// Applies a scalar function given its value and derivative at `self.val`.
    fn chain(self, value: f64, derivative: f64) -> Self {
        Self::new(value, derivative * self.eps)
    }
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
        // a % b = a - b * trunc(a / b); trunc is locally constant.
        let q = (self.val / rhs.val).trunc();
        Self::new(self.val % rhs.val, self.eps - q * rhs.eps)
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
            .map(Self::constant)
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
        Some(Self::constant(n as f64))
    }
    fn from_u64(n: u64) -> Option<Self> {
        Some(Self::constant(n as f64))
    }
    fn from_f64(n: f64) -> Option<Self> {
        Some(Self::constant(n))
    }
}

impl NumCast for Dual {
    fn from<T: ToPrimitive>(n: T) -> Option<Self> {
        n.to_f64().map(Self::constant)
    }
}

impl Float for Dual {
    fn nan() -> Self {
        Self::constant(f64::NAN)
    }
    fn infinity() -> Self {
        Self::constant(f64::INFINITY)
    }
    fn neg_infinity() -> Self {
        Self::constant(f64::NEG_INFINITY)
    }
    fn neg_zero() -> Self {
        Self::new(-0.0, -0.0)
    }
    fn min_value() -> Self {
        Self::constant(f64::MIN)
    }
    fn min_positive_value() -> Self {
        Self::constant(f64::MIN_POSITIVE)
    }
    fn max_value() -> Self {
        Self::constant(f64::MAX)
    }
    fn is_nan(self) -> bool {
        self.val.is_nan() || self.eps.is_nan()
    }
    fn is_infinite(self) -> bool {
        self.val.is_infinite()
    }
    fn is_finite(self) -> bool {
        self.val.is_finite() && self.eps.is_finite()
    }
    fn is_normal(self) -> bool {
        self.val.is_normal()
    }
    fn classify(self) -> std::num::FpCategory {
        self.val.classify()
    }
    fn floor(self) -> Self {
        Self::constant(self.val.floor())
    }
    fn ceil(self) -> Self {
        Self::constant(self.val.ceil())
    }
    fn round(self) -> Self {
        Self::constant(self.val.round())
    }
    fn trunc(self) -> Self {
        Self::constant(self.val.trunc())
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
        Self::constant(self.val.signum())
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
        self.chain(self.val.powi(n), (n as f64) * self.val.powi(n - 1))
    }

    fn powf(self, n: Self) -> Self {
        // x^y = exp(y * ln(x)); a constant exponent avoids ln of non-positive bases.
        let val_pow = self.val.powf(n.val);
        if n.eps == 0.0 {
            return self.chain(val_pow, n.val * self.val.powf(n.val - 1.0));
        }
        let eps_new = val_pow * (n.eps * self.val.ln() + n.val * self.eps / self.val);
        Self::new(val_pow, eps_new)
    }

    fn sqrt(self) -> Self {
        let s = self.val.sqrt();
        Self::new(s, self.eps / (2.0 * s))
    }

    fn exp(self) -> Self {
        let e = self.val.exp();
        self.chain(e, e)
    }
    fn exp2(self) -> Self {
        let e = self.val.exp2();
        self.chain(e, e * std::f64::consts::LN_2)
    }
    fn ln(self) -> Self {
        self.chain(self.val.ln(), 1.0 / self.val)
    }
    fn log(self, base: Self) -> Self {
        self.ln() / base.ln()
    }
    fn log2(self) -> Self {
        self.chain(self.val.log2(), 1.0 / (self.val * std::f64::consts::LN_2))
    }
    fn log10(self) -> Self {
        self.chain(self.val.log10(), 1.0 / (self.val * std::f64::consts::LN_10))
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
        if self.val <= other.val {
            Self::zero()
        } else {
            self - other
        }
    }

    fn cbrt(self) -> Self {
        let c = self.val.cbrt();
        self.chain(c, 1.0 / (3.0 * c * c))
    }
    fn hypot(self, other: Self) -> Self {
        (self * self + other * other).sqrt()
    }

    fn sin(self) -> Self {
        self.chain(self.val.sin(), self.val.cos())
    }
    fn cos(self) -> Self {
        self.chain(self.val.cos(), -self.val.sin())
    }
    fn tan(self) -> Self {
        let t = self.val.tan();
        self.chain(t, 1.0 + t * t)
    }
    fn asin(self) -> Self {
        self.chain(self.val.asin(), 1.0 / (1.0 - self.val * self.val).sqrt())
    }
    fn acos(self) -> Self {
        self.chain(self.val.acos(), -1.0 / (1.0 - self.val * self.val).sqrt())
    }
    fn atan(self) -> Self {
        self.chain(self.val.atan(), 1.0 / (1.0 + self.val * self.val))
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
        self.chain(self.val.exp_m1(), self.val.exp())
    }
    fn ln_1p(self) -> Self {
        self.chain(self.val.ln_1p(), 1.0 / (1.0 + self.val))
    }
    fn sinh(self) -> Self {
        self.chain(self.val.sinh(), self.val.cosh())
    }
    fn cosh(self) -> Self {
        self.chain(self.val.cosh(), self.val.sinh())
    }
    fn tanh(self) -> Self {
        let t = self.val.tanh();
        self.chain(t, 1.0 - t * t)
    }
    fn asinh(self) -> Self {
        self.chain(self.val.asinh(), 1.0 / (self.val * self.val + 1.0).sqrt())
    }
    fn acosh(self) -> Self {
        self.chain(self.val.acosh(), 1.0 / (self.val * self.val - 1.0).sqrt())
    }
    fn atanh(self) -> Self {
        self.chain(self.val.atanh(), 1.0 / (1.0 - self.val * self.val))
    }

    fn integer_decode(self) -> (u64, i16, i8) {
        self.val.integer_decode()
    }
}

/// Hyper-dual number `val + e1·ε₁ + e2·ε₂ + e12·ε₁ε₂` with `ε₁² = ε₂² = 0`.
///
/// One sweep in hyper-dual arithmetic yields a mixed second derivative in `e12`,
/// which is what differentiating a tangent system needs.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct HyperDual {
    pub val: f64,
    pub e1: f64,
    pub e2: f64,
    pub e12: f64,
}

impl HyperDual {
    pub fn new(val: f64, e1: f64, e2: f64, e12: f64) -> Self {
        Self { val, e1, e2, e12 }
    }

    pub fn constant(val: f64) -> Self {
        Self::new(val, 0.0, 0.0, 0.0)
    }

    /// Applies a scalar function given its value and first two derivatives at `self.val`.
    fn chain(self, value: f64, d1: f64, d2: f64) -> Self {
        Self::new(
            value,
            d1 * self.e1,
            d1 * self.e2,
            d1 * self.e12 + d2 * self.e1 * self.e2,
        )
    }

    fn is_constant(&self) -> bool {
        self.e1 == 0.0 && self.e2 == 0.0 && self.e12 == 0.0
    }
}

impl Zero for HyperDual {
    fn zero() -> Self {
        Self::constant(0.0)
    }
    fn is_zero(&self) -> bool {
        self.val == 0.0 && self.is_constant()
    }
}

impl One for HyperDual {
    fn one() -> Self {
        Self::constant(1.0)
    }
}

impl Add for HyperDual {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self::new(
            self.val + rhs.val,
            self.e1 + rhs.e1,
            self.e2 + rhs.e2,
            self.e12 + rhs.e12,
        )
    }
}

impl Sub for HyperDual {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self::new(
            self.val - rhs.val,
            self.e1 - rhs.e1,
            self.e2 - rhs.e2,
            self.e12 - rhs.e12,
        )
    }
}

impl Mul for HyperDual {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self {
        Self::new(
            self.val * rhs.val,
            self.val * rhs.e1 + self.e1 * rhs.val,
            self.val * rhs.e2 + self.e2 * rhs.val,
            self.val * rhs.e12 + self.e1 * rhs.e2 + self.e2 * rhs.e1 + self.e12 * rhs.val,
        )
    }
}

impl Div for HyperDual {
    type Output = Self;
    fn div(self, rhs: Self) -> Self {
        self * rhs.recip()
    }
}

impl Neg for HyperDual {
    type Output = Self;
    fn neg(self) -> Self {
        Self::new(-self.val, -self.e1, -self.e2, -self.e12)
    }
}

impl Rem for HyperDual {
    type Output = Self;
    fn rem(self, rhs: Self) -> Self {
        let q = (self.val / rhs.val).trunc();
        Self::new(
            self.val % rhs.val,
            self.e1 - q * rhs.e1,
            self.e2 - q * rhs.e2,
            self.e12 - q * rhs.e12,
        )
    }
}

impl AddAssign for HyperDual {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}
impl SubAssign for HyperDual {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}
impl MulAssign for HyperDual {
    fn mul_assign(&mut self, rhs: Self) {
        *self = *self * rhs;
    }
}
impl DivAssign for HyperDual {
    fn div_assign(&mut self, rhs: Self) {
        *self = *self / rhs;
    }
}
impl RemAssign for HyperDual {
    fn rem_assign(&mut self, rhs: Self) {
        *self = *self % rhs;
    }
}

impl Num for HyperDual {
    type FromStrRadixErr = ();
    fn from_str_radix(str: &str, radix: u32) -> Result<Self, Self::FromStrRadixErr> {
        f64::from_str_radix(str, radix)
            .map(Self::constant)
            .map_err(|_| ())
    }
}

impl ToPrimitive for HyperDual {
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

impl FromPrimitive for HyperDual {
    fn from_i64(n: i64) -> Option<Self> {
        Some(Self::constant(n as f64))
    }
    fn from_u64(n: u64) -> Option<Self> {
        Some(Self::constant(n as f64))
    }
    fn from_f64(n: f64) -> Option<Self> {
        Some(Self::constant(n))
    }
}

impl NumCast for HyperDual {
    fn from<T: ToPrimitive>(n: T) -> Option<Self> {
        n.to_f64().map(Self::constant)
    }
}

impl Float for HyperDual {
    fn nan() -> Self {
        Self::constant(f64::NAN)
    }
    fn infinity() -> Self {
        Self::constant(f64::INFINITY)
    }
    fn neg_infinity() -> Self {
        Self::constant(f64::NEG_INFINITY)
    }
    fn neg_zero() -> Self {
        Self::new(-0.0, -0.0, -0.0, -0.0)
    }
    fn min_value() -> Self {
        Self::constant(f64::MIN)
    }
    fn min_positive_value() -> Self {
        Self::constant(f64::MIN_POSITIVE)
    }
    fn max_value() -> Self {
        Self::constant(f64::MAX)
    }
    fn is_nan(self) -> bool {
        self.val.is_nan() || self.e1.is_nan() || self.e2.is_nan() || self.e12.is_nan()
    }
    fn is_infinite(self) -> bool {
        self.val.is_infinite()
    }
    fn is_finite(self) -> bool {
        self.val.is_finite() && self.e1.is_finite() && self.e2.is_finite() && self.e12.is_finite()
    }
    fn is_normal(self) -> bool {
        self.val.is_normal()
    }
    fn classify(self) -> std::num::FpCategory {
        self.val.classify()
    }
    fn floor(self) -> Self {
        Self::constant(self.val.floor())
    }
    fn ceil(self) -> Self {
        Self::constant(self.val.ceil())
    }
    fn round(self) -> Self {
        Self::constant(self.val.round())
    }
    fn trunc(self) -> Self {
        Self::constant(self.val.trunc())
    }
    fn fract(self) -> Self {
        Self::new(self.val.fract(), self.e1, self.e2, self.e12)
    }
    fn abs(self) -> Self {
        if self.val >= 0.0 {
            self
        } else {
            -self
        }
    }
    fn signum(self) -> Self {
        Self::constant(self.val.signum())
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
        let r = 1.0 / self.val;
        self.chain(r, -r * r, 2.0 * r * r * r)
    }

    fn powi(self, n: i32) -> Self {
        match n {
            0 => Self::one(),
            1 => self,
            _ => {
                let n_f = n as f64;
                self.chain(
                    self.val.powi(n),
                    n_f * self.val.powi(n - 1),
                    n_f * (n_f - 1.0) * self.val.powi(n - 2),
                )
            }
        }
    }

    fn powf(self, n: Self) -> Self {
        // A constant exponent avoids ln of non-positive bases.
        if n.is_constant() {
            let c = n.val;
            return self.chain(
                self.val.powf(c),
                c * self.val.powf(c - 1.0),
                c * (c - 1.0) * self.val.powf(c - 2.0),
            );
        }
        (n * self.ln()).exp()
    }

    fn sqrt(self) -> Self {
        let s = self.val.sqrt();
        self.chain(s, 0.5 / s, -0.25 / (s * self.val))
    }

    fn exp(self) -> Self {
        let e = self.val.exp();
        self.chain(e, e, e)
    }
    fn exp2(self) -> Self {
        let e = self.val.exp2();
        let ln2 = std::f64::consts::LN_2;
        self.chain(e, e * ln2, e * ln2 * ln2)
    }
    fn ln(self) -> Self {
        let r = 1.0 / self.val;
        self.chain(self.val.ln(), r, -r * r)
    }
    fn log(self, base: Self) -> Self {
        self.ln() / base.ln()
    }
    fn log2(self) -> Self {
        let r = 1.0 / self.val;
        let ln2 = std::f64::consts::LN_2;
        self.chain(self.val.log2(), r / ln2, -r * r / ln2)
    }
    fn log10(self) -> Self {
        let r = 1.0 / self.val;
        let ln10 = std::f64::consts::LN_10;
        self.chain(self.val.log10(), r / ln10, -r * r / ln10)
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
        if self.val <= other.val {
            Self::zero()
        } else {
            self - other
        }
    }

    fn cbrt(self) -> Self {
        let c = self.val.cbrt();
        self.chain(c, 1.0 / (3.0 * c * c), -2.0 / (9.0 * c.powi(5)))
    }
    fn hypot(self, other: Self) -> Self {
        (self * self + other * other).sqrt()
    }

    fn sin(self) -> Self {
        let (s, c) = self.val.sin_cos();
        self.chain(s, c, -s)
    }
    fn cos(self) -> Self {
        let (s, c) = self.val.sin_cos();
        self.chain(c, -s, -c)
    }
    fn tan(self) -> Self {
        let t = self.val.tan();
        let d1 = 1.0 + t * t;
        self.chain(t, d1, 2.0 * t * d1)
    }
    fn asin(self) -> Self {
        let r = 1.0 / (1.0 - self.val * self.val).sqrt();
        self.chain(self.val.asin(), r, self.val * r * r * r)
    }
    fn acos(self) -> Self {
        let r = 1.0 / (1.0 - self.val * self.val).sqrt();
        self.chain(self.val.acos(), -r, -self.val * r * r * r)
    }
    fn atan(self) -> Self {
        let r = 1.0 / (1.0 + self.val * self.val);
        self.chain(self.val.atan(), r, -2.0 * self.val * r * r)
    }
    fn atan2(self, other: Self) -> Self {
        // Both forms differ from atan2 by a locally constant multiple of π/2.
        let local = if other.val.abs() >= self.val.abs() {
            (self / other).atan()
        } else {
            -(other / self).atan()
        };
        Self {
            val: self.val.atan2(other.val),
            ..local
        }
    }
    fn sin_cos(self) -> (Self, Self) {
        (self.sin(), self.cos())
    }

    fn exp_m1(self) -> Self {
        let e = self.val.exp();
        self.chain(self.val.exp_m1(), e, e)
    }
    fn ln_1p(self) -> Self {
        let r = 1.0 / (1.0 + self.val);
        self.chain(self.val.ln_1p(), r, -r * r)
    }
    fn sinh(self) -> Self {
        let (s, c) = (self.val.sinh(), self.val.cosh());
        self.chain(s, c, s)
    }
    fn cosh(self) -> Self {
        let (s, c) = (self.val.sinh(), self.val.cosh());
        self.chain(c, s, c)
    }
    fn tanh(self) -> Self {
        let t = self.val.tanh();
        let d1 = 1.0 - t * t;
        self.chain(t, d1, -2.0 * t * d1)
    }
    fn asinh(self) -> Self {
        let r = 1.0 / (self.val * self.val + 1.0).sqrt();
        self.chain(self.val.asinh(), r, -self.val * r * r * r)
    }
    fn acosh(self) -> Self {
        let r = 1.0 / (self.val * self.val - 1.0).sqrt();
        self.chain(self.val.acosh(), r, -self.val * r * r * r)
    }
    fn atanh(self) -> Self {
        let r = 1.0 / (1.0 - self.val * self.val);
        self.chain(self.val.atanh(), r, 2.0 * self.val * r * r)
    }

    fn integer_decode(self) -> (u64, i16, i8) {
        self.val.integer_decode()
    }
}

// --- DaeFunction adapters ---

/// Wraps a scalar-generic model and derives exact derivatives with [`Dual`] sweeps.
///
/// `jvp` costs one dual evaluation. `vjp` builds the transposed product from one
/// dual sweep per input entry, which is fine for the small systems this crate targets.
/// `second_jvp` is one [`HyperDual`] sweep.
#[derive(Debug, Clone)]
pub struct Differentiable<M> {
    model: M,
}

impl<M> Differentiable<M>
where
    M: DaeModel<f64> + DaeModel<Dual> + DaeModel<HyperDual> + Clone + Send + Sync + 'static,
{
    pub fn new(model: M) -> Self {
        Self { model }
    }

    pub fn shared(model: M) -> DaeRef {
        Arc::new(Self::new(model))
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    fn dual_outputs(&self) -> Vec<Vec<Dual>> {
        DaeModel::<Dual>::signature(&self.model)
            .outputs
            .iter()
            .map(|&n| vec![Dual::zero(); n])
            .collect()
    }

    fn apply_dual(&self, t: f64, inputs: &[Vec<Dual>], outputs: &mut [Vec<Dual>]) {
        let in_refs: Vec<&[Dual]> = inputs.iter().map(Vec::as_slice).collect();
        let mut out_refs: Vec<&mut [Dual]> = outputs.iter_mut().map(Vec::as_mut_slice).collect();
        self.model.apply(Dual::constant(t), &in_refs, &mut out_refs);
    }
}

impl<M> DaeFunction for Differentiable<M>
where
    M: DaeModel<f64> + DaeModel<Dual> + DaeModel<HyperDual> + Clone + Send + Sync + 'static,
{
    fn signature(&self) -> Signature {
        DaeModel::<f64>::signature(&self.model)
    }

    fn eval(&self, t: f64, inputs: &[&[f64]], outputs: &mut [&mut [f64]]) {
        self.model.apply(t, inputs, outputs);
    }

    fn is_differentiable(&self) -> bool {
        true
    }

    fn jvp(
        &self,
        t: f64,
        inputs: &[&[f64]],
        seeds: &[&[f64]],
        tangents: &mut [&mut [f64]],
    ) -> Result<()> {
        let signature = DaeFunction::signature(self);
        check_blocks("inputs", inputs, &signature.inputs)?;
        check_blocks("seeds", seeds, &signature.inputs)?;

        let dual_inputs: Vec<Vec<Dual>> = inputs
            .iter()
            .zip(seeds)
            .map(|(values, dirs)| {
                values
                    .iter()
                    .zip(dirs.iter())
                    .map(|(&v, &d)| Dual::new(v, d))
                    .collect()
            })
            .collect();
        let mut dual_out = self.dual_outputs();
        self.apply_dual(t, &dual_inputs, &mut dual_out);

        for (target, block) in tangents.iter_mut().zip(&dual_out) {
            for (dst, src) in target.iter_mut().zip(block) {
                *dst = src.eps;
            }
        }
        Ok(())
    }

    fn vjp(
        &self,
        t: f64,
        inputs: &[&[f64]],
        adj_seeds: &[&[f64]],
        sensitivities: &mut [&mut [f64]],
    ) -> Result<()> {
        let signature = DaeFunction::signature(self);
        check_blocks("inputs", inputs, &signature.inputs)?;
        check_blocks("adjoint seeds", adj_seeds, &signature.outputs)?;

        let mut dual_inputs: Vec<Vec<Dual>> = inputs
            .iter()
            .map(|values| values.iter().map(|&v| Dual::constant(v)).collect())
            .collect();
        let mut dual_out = self.dual_outputs();

        // Column (b, j) of the Jacobian, contracted with the adjoint seeds.
        for b in 0..dual_inputs.len() {
            for j in 0..dual_inputs[b].len() {
                dual_inputs[b][j].eps = 1.0;
                self.apply_dual(t, &dual_inputs, &mut dual_out);
                dual_inputs[b][j].eps = 0.0;

                let mut sum = 0.0;
                for (seed, block) in adj_seeds.iter().zip(&dual_out) {
                    for (w, out) in seed.iter().zip(block) {
                        sum += w * out.eps;
                    }
                }
                sensitivities[b][j] = sum;
            }
        }
        Ok(())
    }

    fn is_twice_differentiable(&self) -> bool {
        true
    }

    fn second_jvp(
        &self,
        t: f64,
        inputs: &[&[f64]],
        first: &[&[f64]],
        second: &[&[f64]],
        cross: &[&[f64]],
        out: &mut [&mut [f64]],
    ) -> Result<()> {
        let signature = DaeFunction::signature(self);
        check_blocks("inputs", inputs, &signature.inputs)?;
        check_blocks("first seeds", first, &signature.inputs)?;
        check_blocks("second seeds", second, &signature.inputs)?;
        check_blocks("cross seeds", cross, &signature.inputs)?;

        let hyper_inputs: Vec<Vec<HyperDual>> = (0..inputs.len())
            .map(|b| {
                (0..inputs[b].len())
                    .map(|j| {
                        HyperDual::new(inputs[b][j], first[b][j], second[b][j], cross[b][j])
                    })
                    .collect()
            })
            .collect();
        let mut hyper_out: Vec<Vec<HyperDual>> = signature
            .outputs
            .iter()
            .map(|&n| vec![HyperDual::zero(); n])
            .collect();

        let in_refs: Vec<&[HyperDual]> = hyper_inputs.iter().map(Vec::as_slice).collect();
        let mut out_refs: Vec<&mut [HyperDual]> =
            hyper_out.iter_mut().map(Vec::as_mut_slice).collect();
        self.model.apply(HyperDual::constant(t), &in_refs, &mut out_refs);

        for (target, block) in out.iter_mut().zip(&hyper_out) {
            for (dst, src) in target.iter_mut().zip(block) {
                *dst = src.e12;
            }
        }
        Ok(())
    }

    fn deep_copy(&self, _copies: &mut CopyMap) -> DaeRef {
        Arc::new(self.clone())
    }
}

/// Wraps an `f64`-only model. Evaluates, but offers no derivatives.
#[derive(Debug, Clone)]
pub struct Opaque<M> {
    model: M,
}

impl<M> Opaque<M>
where
    M: DaeModel<f64> + Clone + Send + Sync + 'static,
{
    pub fn new(model: M) -> Self {
        Self { model }
    }

    pub fn shared(model: M) -> DaeRef {
        Arc::new(Self::new(model))
    }
}

impl<M> DaeFunction for Opaque<M>
where
    M: DaeModel<f64> + Clone + Send + Sync + 'static,
{
    fn signature(&self) -> Signature {
        self.model.signature()
    }

    fn eval(&self, t: f64, inputs: &[&[f64]], outputs: &mut [&mut [f64]]) {
        self.model.apply(t, inputs, outputs);
    }

    fn deep_copy(&self, _copies: &mut CopyMap) -> DaeRef {
        Arc::new(self.clone())
    }
}

pub(crate) fn check_blocks(what: &str, blocks: &[&[f64]], expected: &[usize]) -> Result<()> {
    if blocks.len() != expected.len() {
        return Err(IntegratorError::invalid(format!(
            "{what}: expected {} blocks, got {}",
            expected.len(),
            blocks.len()
        )));
    }
    for (index, (block, &size)) in blocks.iter().zip(expected).enumerate() {
        if block.len() != size {
            return Err(IntegratorError::invalid(format!(
                "{what}: block {index} has length {}, expected {size}",
                block.len()
            )));
        }
    }
    Ok(())
}
