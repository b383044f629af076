//! Forward-mode automatic differentiation with dual numbers.
//!
//! A [`Dual`] carries a value together with its derivative along one seed direction.
//! Running a lowered [`Program`](crate::lower::Program) over duals instead of plain
//! `f64`s yields a partial derivative without building a symbolic derivative graph,
//! which is useful for a quick gradient check or for expressions whose symbolic
//! derivatives grow too large to compile.

use std::ops::{Add, Div, Mul, Neg, Sub};

use crate::expr::powi;
use crate::operators::sign;

/// Number types a lowered program can be evaluated over.
pub trait Scalar:
    Copy
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
{
    fn from_f64(value: f64) -> Self;
    fn abs(self) -> Self;
    fn sign(self) -> Self;
    fn exp(self) -> Self;
    fn ln(self) -> Self;
    fn sqrt(self) -> Self;
    fn sin(self) -> Self;
    fn cos(self) -> Self;
    fn tan(self) -> Self;
    fn powi(self, exp: i64) -> Self;
    fn powf(self, exp: f64) -> Self;
    fn pow(self, exponent: Self) -> Self;
    /// `self * a + b`
    fn mul_add(self, a: Self, b: Self) -> Self;
}

impl Scalar for f64 {
    fn from_f64(value: f64) -> Self {
        value
    }

    fn abs(self) -> Self {
        f64::abs(self)
    }

    fn sign(self) -> Self {
        sign(self)
    }

    fn exp(self) -> Self {
        f64::exp(self)
    }

    fn ln(self) -> Self {
        f64::ln(self)
    }

    fn sqrt(self) -> Self {
        f64::sqrt(self)
    }

    fn sin(self) -> Self {
        f64::sin(self)
    }

    fn cos(self) -> Self {
        f64::cos(self)
    }

    fn tan(self) -> Self {
        f64::tan(self)
    }

    fn powi(self, exp: i64) -> Self {
        powi(self, exp)
    }

    fn powf(self, exp: f64) -> Self {
        f64::powf(self, exp)
    }

    fn pow(self, exponent: Self) -> Self {
        f64::powf(self, exponent)
    }

    fn mul_add(self, a: Self, b: Self) -> Self {
        f64::mul_add(self, a, b)
    }
}

/// A value paired with its derivative along one direction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dual {
    pub value: f64,
    pub tangent: f64,
}

impl Dual {
    pub fn new(value: f64, tangent: f64) -> Self {
        Self { value, tangent }
    }

    /// A quantity that does not depend on the seed variable.
    pub fn constant(value: f64) -> Self {
        Self::new(value, 0.0)
    }

    /// The seed variable itself.
    pub fn variable(value: f64) -> Self {
        Self::new(value, 1.0)
    }

    /// Chain rule for a unary function with the given value and derivative at `self.value`.
    fn chain(self, value: f64, derivative: f64) -> Self {
        Self::new(value, derivative * self.tangent)
    }
}

impl Add for Dual {
    type Output = Dual;

    fn add(self, rhs: Dual) -> Dual {
        Dual::new(self.value + rhs.value, self.tangent + rhs.tangent)
    }
}

impl Sub for Dual {
    type Output = Dual;

    fn sub(self, rhs: Dual) -> Dual {
        Dual::new(self.value - rhs.value, self.tangent - rhs.tangent)
    }
}

impl Mul for Dual {
    type Output = Dual;

    fn mul(self, rhs: Dual) -> Dual {
        Dual::new(
            self.value * rhs.value,
            self.tangent * rhs.value + self.value * rhs.tangent,
        )
    }
}

impl Div for Dual {
    type Output = Dual;

    fn div(self, rhs: Dual) -> Dual {
        Dual::new(
            self.value / rhs.value,
            (self.tangent * rhs.value - self.value * rhs.tangent) / (rhs.value * rhs.value),
        )
    }
}

impl Neg for Dual {
    type Output = Dual;

    fn neg(self) -> Dual {
        Dual::new(-self.value, -self.tangent)
    }
}

impl Scalar for Dual {
    fn from_f64(value: f64) -> Self {
        Dual::constant(value)
    }

    fn abs(self) -> Self {
        self.chain(self.value.abs(), sign(self.value))
    }

    fn sign(self) -> Self {
        Dual::constant(sign(self.value))
    }

    fn exp(self) -> Self {
        let e = self.value.exp();
        self.chain(e, e)
    }

    fn ln(self) -> Self {
        self.chain(self.value.ln(), 1.0 / self.value)
    }

    fn sqrt(self) -> Self {
        let s = self.value.sqrt();
        self.chain(s, 0.5 / s)
    }

    fn sin(self) -> Self {
        self.chain(self.value.sin(), self.value.cos())
    }

    fn cos(self) -> Self {
        self.chain(self.value.cos(), -self.value.sin())
    }

    fn tan(self) -> Self {
        let t = self.value.tan();
        self.chain(t, 1.0 + t * t)
    }

    fn powi(self, exp: i64) -> Self {
        if exp == 0 {
            return Dual::constant(1.0);
        }
        self.chain(powi(self.value, exp), exp as f64 * powi(self.value, exp - 1))
    }

    fn powf(self, exp: f64) -> Self {
        self.chain(self.value.powf(exp), exp * self.value.powf(exp - 1.0))
    }

    fn pow(self, exponent: Self) -> Self {
        // A constant exponent must not touch ln(base), which is NaN for negative bases
        if exponent.tangent == 0.0 {
            return self.powf(exponent.value);
        }
        let value = self.value.powf(exponent.value);
        if self.tangent == 0.0 {
            return Dual::new(value, value * self.value.ln() * exponent.tangent);
        }
        Dual::new(
            value,
            value
                * (exponent.tangent * self.value.ln()
                    + exponent.value * self.tangent / self.value),
        )
    }

    fn mul_add(self, a: Self, b: Self) -> Self {
        self * a + b
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn test_arithmetic_rules() {
        let x = Dual::variable(3.0);
        let c = Dual::constant(2.0);

        let product = x * x * c;
        assert_eq!(product, Dual::new(18.0, 12.0));

        let quotient = c / x;
        assert!(close(quotient.value, 2.0 / 3.0));
        assert!(close(quotient.tangent, -2.0 / 9.0));

        assert_eq!(-(x - c), Dual::new(-1.0, -1.0));
    }

    #[test]
    fn test_function_rules() {
        let x = Dual::variable(0.5);
        assert!(close(Scalar::sin(x).tangent, 0.5f64.cos()));
        assert!(close(Scalar::exp(x).tangent, 0.5f64.exp()));
        assert!(close(Scalar::ln(x).tangent, 2.0));
        assert!(close(Scalar::sqrt(x).tangent, 0.5 / 0.5f64.sqrt()));
        assert!(close(Scalar::powi(x, 3).tangent, 3.0 * 0.25));
        assert!(close(Scalar::tan(x).tangent, 1.0 / 0.5f64.cos().powi(2)));
        assert_eq!(Scalar::sign(x).tangent, 0.0);
        assert_eq!(Scalar::abs(Dual::variable(-2.0)).tangent, -1.0);
    }

    #[test]
    fn test_pow_with_negative_base() {
        // d/dx x^2 at x = -3 through the general power
        let x = Dual::variable(-3.0);
        let result = Scalar::pow(x, Dual::constant(2.0));
        assert_eq!(result, Dual::new(9.0, -6.0));

        // d/dy 2^y at y = 3
        let result = Scalar::pow(Dual::constant(2.0), Dual::variable(3.0));
        assert!(close(result.tangent, 8.0 * 2.0f64.ln()));
    }
}
