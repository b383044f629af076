//! Symbolic differentiation of expression graphs.
//!
//! Derivatives are graphs themselves, so they can be simplified, substituted, printed and
//! compiled exactly like the expression they came from, and differentiated again for
//! higher orders.
//!
//! # Rules
//! - Sum rule, and an n-ary product rule with one term per factor that depends on the
//!   variable
//! - Quotient rule, reducing to `f'/g` when the denominator is free of the variable
//! - Power rule for literal exponents and the general `d f^g = f^g (g' ln f + g f'/f)`,
//!   reducing to the literal form when `g` is free of the variable
//! - Chain rule for every unary function: `d|f| = sign(f) f'`, `d sign(f) = 0`,
//!   `d tan f = (1 + tan^2 f) f'`

use crate::expr::Expr;

impl Expr {
    /// Computes the partial derivative with respect to `wrt` and simplifies it.
    ///
    /// A symbol that does not occur in the expression has derivative `0`.
    ///
    /// # Example
    /// ```
    /// # use lambdify_jit::expr::Expr;
    /// let x = Expr::symbol("x");
    /// let f = x.clone().powi(3) + x.clone().sin();
    /// let df = f.derivative("x");
    /// assert_eq!(df, Expr::Add(vec![
    ///     Expr::Mul(vec![Expr::Const(3.0), x.clone().powi(2)]),
    ///     x.cos(),
    /// ]));
    /// ```
    pub fn derivative(&self, wrt: &str) -> Expr {
        self.derivative_raw(wrt).simplify()
    }

    /// Differentiates with respect to each variable in turn.
    ///
    /// `derive_wrt(&["x", "y"])` is `∂²f/∂y∂x`. An empty list returns the
    /// simplified expression itself.
    pub fn derive_wrt(&self, variables: &[&str]) -> Expr {
        variables
            .iter()
            .fold(self.simplify(), |expr, var| expr.derivative(var))
    }

    /// First partial derivatives in the order of `variables`.
    pub fn gradient_exprs<S: AsRef<str>>(&self, variables: &[S]) -> Vec<Expr> {
        variables
            .iter()
            .map(|var| self.derivative(var.as_ref()))
            .collect()
    }

    /// Second partial derivatives; entry `[i][j]` is `∂²f/∂v_i∂v_j`.
    pub fn hessian_exprs<S: AsRef<str>>(&self, variables: &[S]) -> Vec<Vec<Expr>> {
        self.gradient_exprs(variables)
            .iter()
            .map(|first| first.gradient_exprs(variables))
            .collect()
    }

    /// Unsimplified derivative. Subtrees free of `wrt` short-circuit to `0`.
    fn derivative_raw(&self, wrt: &str) -> Expr {
        if !self.contains_symbol(wrt) {
            return Expr::Const(0.0);
        }

        match self {
            Expr::Const(_) => Expr::Const(0.0),
            Expr::Symbol(name) => Expr::Const(if name == wrt { 1.0 } else { 0.0 }),

            Expr::Add(terms) => Expr::Add(terms.iter().map(|t| t.derivative_raw(wrt)).collect()),

            // d(f1 f2 ... fn) = Σ_i f1 ... f_i' ... fn
            Expr::Mul(factors) => Expr::Add(
                factors
                    .iter()
                    .enumerate()
                    .filter(|(_, factor)| factor.contains_symbol(wrt))
                    .map(|(i, factor)| {
                        let mut term = factors.clone();
                        term[i] = factor.derivative_raw(wrt);
                        Expr::Mul(term)
                    })
                    .collect(),
            ),

            Expr::Sub(left, right) => left.derivative_raw(wrt) - right.derivative_raw(wrt),

            Expr::Div(num, den) => {
                if !den.contains_symbol(wrt) {
                    return num.derivative_raw(wrt) / den.as_ref().clone();
                }
                // (g f' - f g') / g^2
                let f = num.as_ref().clone();
                let g = den.as_ref().clone();
                (g.clone() * num.derivative_raw(wrt) - f * den.derivative_raw(wrt)) / g.powi(2)
            }

            Expr::Pow(base, exp) => Expr::Mul(vec![
                Expr::Const(*exp as f64),
                base.as_ref().clone().powi(exp.saturating_sub(1)),
                base.derivative_raw(wrt),
            ]),

            Expr::PowFloat(base, exp) => Expr::Mul(vec![
                Expr::Const(*exp),
                base.as_ref().clone().powf(exp - 1.0),
                base.derivative_raw(wrt),
            ]),

            Expr::PowExpr(base, exponent) => {
                let f = base.as_ref().clone();
                let g = exponent.as_ref().clone();
                if !exponent.contains_symbol(wrt) {
                    // g f^(g-1) f'
                    return Expr::Mul(vec![g.clone(), f.pow(g - 1.0), base.derivative_raw(wrt)]);
                }
                if !base.contains_symbol(wrt) {
                    // f^g ln(f) g'
                    return Expr::Mul(vec![self.clone(), f.ln(), exponent.derivative_raw(wrt)]);
                }
                // f^g (g' ln f + g f' / f)
                Expr::Mul(vec![
                    self.clone(),
                    exponent.derivative_raw(wrt) * f.clone().ln()
                        + g * base.derivative_raw(wrt) / f,
                ])
            }

            Expr::Neg(inner) => -inner.derivative_raw(wrt),

            Expr::Abs(inner) => inner.as_ref().clone().sign() * inner.derivative_raw(wrt),

            Expr::Sign(_) => Expr::Const(0.0),

            Expr::Exp(inner) => self.clone() * inner.derivative_raw(wrt),

            Expr::Ln(inner) => inner.derivative_raw(wrt) / inner.as_ref().clone(),

            // f' / (2 sqrt f)
            Expr::Sqrt(inner) => inner.derivative_raw(wrt) / (2.0 * self.clone()),

            Expr::Sin(inner) => inner.as_ref().clone().cos() * inner.derivative_raw(wrt),

            Expr::Cos(inner) => -(inner.as_ref().clone().sin() * inner.derivative_raw(wrt)),

            Expr::Tan(inner) => (1.0 + self.clone().powi(2)) * inner.derivative_raw(wrt),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::parse;
    use std::collections::HashMap;

    fn var(name: &str) -> Expr {
        Expr::symbol(name)
    }

    fn c(value: f64) -> Expr {
        Expr::Const(value)
    }

    /// Compares a symbolic derivative against a central finite difference.
    fn check_numeric(text: &str, wrt: &str, point: &[(&str, f64)]) {
        let expr = parse(text).unwrap();
        let derivative = expr.derivative(wrt);
        let env: HashMap<String, f64> = point.iter().map(|(k, v)| (k.to_string(), *v)).collect();

        let h = 1e-6;
        let mut plus = env.clone();
        let mut minus = env.clone();
        *plus.get_mut(wrt).unwrap() += h;
        *minus.get_mut(wrt).unwrap() -= h;
        let numeric = (expr.eval(&plus).unwrap() - expr.eval(&minus).unwrap()) / (2.0 * h);
        let symbolic = derivative.eval(&env).unwrap();
        assert!(
            (numeric - symbolic).abs() < 1e-5 * (1.0 + symbolic.abs()),
            "d/d{wrt} {text}: numeric {numeric}, symbolic {symbolic} ({derivative})"
        );
    }

    #[test]
    fn test_basic_rules() {
        assert_eq!(c(3.0).derivative("x"), c(0.0));
        assert_eq!(var("x").derivative("x"), c(1.0));
        assert_eq!(var("y").derivative("x"), c(0.0));
        assert_eq!((var("x") + var("y")).derivative("x"), c(1.0));
        assert_eq!((var("x") * var("y")).derivative("x"), var("y"));
        assert_eq!(
            var("x").powi(2).derivative("x"),
            Expr::Mul(vec![c(2.0), var("x")])
        );
        assert_eq!(var("x").exp().derivative("x"), var("x").exp());
        assert_eq!(var("x").sign().derivative("x"), c(0.0));
    }

    #[test]
    fn test_absent_symbol_is_zero() {
        let expr = parse("sin(x) * exp(y)").unwrap();
        assert_eq!(expr.derivative("z"), c(0.0));
    }

    #[test]
    fn test_abs_uses_sign() {
        let derivative = var("x").abs().derivative("x");
        assert_eq!(derivative, var("x").sign());
    }

    #[test]
    fn test_against_finite_differences() {
        let point = [("x", 0.7), ("y", 1.9)];
        for text in [
            "x*y*x + 3*y",
            "x / (1 + y^2)",
            "(x + 1) / (x - 3)",
            "sqrt(x*y)",
            "ln(x + y) * cos(x)",
            "tan(x*y)",
            "x^2.5 - y^(-3)",
            "x^y",
            "2^x",
            "y^x",
            "abs(x - y) * exp(-x)",
            "-(sin(x)) / y",
        ] {
            check_numeric(text, "x", &point);
            check_numeric(text, "y", &point);
        }
    }

    #[test]
    fn test_higher_order() {
        let expr = parse("x^3 * y^2").unwrap();
        // ∂²/∂x∂y = 6 x^2 y
        let mixed = expr.derive_wrt(&["x", "y"]);
        let env = HashMap::from([("x".to_string(), 2.0), ("y".to_string(), 3.0)]);
        assert_eq!(mixed.eval(&env).unwrap(), 72.0);

        // ∂³/∂x³ = 6 y^2
        let third = expr.derive_wrt(&["x", "x", "x"]);
        assert_eq!(third.eval(&env).unwrap(), 54.0);

        assert_eq!(expr.derive_wrt(&[]), expr.simplify());
    }

    #[test]
    fn test_gradient_and_hessian() {
        let expr = parse("x^2 * y + y^3").unwrap();
        let vars = ["x", "y"];
        let env = HashMap::from([("x".to_string(), 1.0), ("y".to_string(), 2.0)]);

        let gradient: Vec<f64> = expr
            .gradient_exprs(&vars)
            .iter()
            .map(|d| d.eval(&env).unwrap())
            .collect();
        assert_eq!(gradient, vec![4.0, 13.0]);

        let hessian: Vec<Vec<f64>> = expr
            .hessian_exprs(&vars)
            .iter()
            .map(|row| row.iter().map(|d| d.eval(&env).unwrap()).collect())
            .collect();
        assert_eq!(hessian, vec![vec![4.0, 2.0], vec![2.0, 12.0]]);
    }
}
