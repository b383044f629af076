//! Expression graph for representing algebraic formulas.
//!
//! This module defines [`Expr`], the immutable tree every other stage of the crate works on:
//!
//! - Leaf nodes: numeric literals (`Const`) and named symbols (`Symbol`)
//! - N-ary operators: `Add` and `Mul` over any number of operands
//! - Binary operators: `Sub`, `Div` and the general power `PowExpr`
//! - Powers with a literal exponent: `Pow` (integer) and `PowFloat`
//! - Unary functions: `Neg`, `Abs`, `Sign`, `Exp`, `Ln`, `Sqrt`, `Sin`, `Cos`, `Tan`
//!
//! Nodes own their children. None of the operations in this crate mutate a graph in
//! place; simplification, substitution and differentiation all return a new tree, so a
//! graph built once can be shared between a model, its derivatives and its printed source.
//!
//! # Expression Simplification
//! The simplify method performs algebraic clean-up that holds for every real input:
//! - Flattening nested sums and products, folding their constant operands
//! - Identity rules (e.g. x + 0 → x, x * 1 → x, x^1 → x)
//! - Collecting like terms (x + x → 2 * x) and equal positive powers (x * x → x^2)
//! - Constant folding of functions (e.g. ln(1) → 0), unless the result is not finite
//!
//! Rewrites that change the value for some real inputs, such as x / x → 1, are not applied.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::ops;

use crate::errors::LambdifyError;
use crate::operators::sign;

/// A node in an algebraic expression graph.
///
/// The expression tree is built recursively using `Box<Expr>` for unary and binary
/// operators and `Vec<Expr>` for the n-ary sum and product.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A constant floating point value
    Const(f64),
    /// A named symbol, either a variable or a parameter awaiting substitution
    Symbol(String),
    /// Sum of any number of expressions
    Add(Vec<Expr>),
    /// Product of any number of expressions
    Mul(Vec<Expr>),
    /// Difference of two expressions
    Sub(Box<Expr>, Box<Expr>),
    /// Quotient of two expressions
    Div(Box<Expr>, Box<Expr>),
    /// Exponentiation of an expression by an integer constant
    Pow(Box<Expr>, i64),
    /// Exponentiation of an expression by a floating point constant
    PowFloat(Box<Expr>, f64),
    /// Exponentiation of an expression by another expression
    PowExpr(Box<Expr>, Box<Expr>),
    /// Negation of an expression
    Neg(Box<Expr>),
    /// Absolute value of an expression
    Abs(Box<Expr>),
    /// Sign of an expression: -1, 0 or 1
    Sign(Box<Expr>),
    /// Exponential function of an expression
    Exp(Box<Expr>),
    /// Natural logarithm of an expression
    Ln(Box<Expr>),
    /// Square root of an expression
    Sqrt(Box<Expr>),
    /// Sine of an expression (argument in radians)
    Sin(Box<Expr>),
    /// Cosine of an expression (argument in radians)
    Cos(Box<Expr>),
    /// Tangent of an expression (argument in radians)
    Tan(Box<Expr>),
}

impl Expr {
    /// Creates a symbol node.
    pub fn symbol(name: impl Into<String>) -> Self {
        Expr::Symbol(name.into())
    }

    /// Creates a numeric literal.
    pub fn constant(value: f64) -> Self {
        Expr::Const(value)
    }

    /// Creates an n-ary sum.
    pub fn add(terms: Vec<Expr>) -> Self {
        Expr::Add(terms)
    }

    /// Creates an n-ary product.
    pub fn mul(factors: Vec<Expr>) -> Self {
        Expr::Mul(factors)
    }

    pub fn powi(self, exp: i64) -> Self {
        Expr::Pow(Box::new(self), exp)
    }

    pub fn powf(self, exp: f64) -> Self {
        Expr::PowFloat(Box::new(self), exp)
    }

    pub fn pow(self, exponent: Expr) -> Self {
        Expr::PowExpr(Box::new(self), Box::new(exponent))
    }

    pub fn abs(self) -> Self {
        Expr::Abs(Box::new(self))
    }

    pub fn sign(self) -> Self {
        Expr::Sign(Box::new(self))
    }

    pub fn exp(self) -> Self {
        Expr::Exp(Box::new(self))
    }

    pub fn ln(self) -> Self {
        Expr::Ln(Box::new(self))
    }

    pub fn sqrt(self) -> Self {
        Expr::Sqrt(Box::new(self))
    }

    pub fn sin(self) -> Self {
        Expr::Sin(Box::new(self))
    }

    pub fn cos(self) -> Self {
        Expr::Cos(Box::new(self))
    }

    pub fn tan(self) -> Self {
        Expr::Tan(Box::new(self))
    }

    /// Returns the value of a literal node.
    pub fn as_const(&self) -> Option<f64> {
        match self {
            Expr::Const(value) => Some(*value),
            _ => None,
        }
    }

    /// Returns true if the expression contains no symbols.
    pub fn is_constant(&self) -> bool {
        match self {
            Expr::Const(_) => true,
            Expr::Symbol(_) => false,
            _ => self.children().into_iter().all(Expr::is_constant),
        }
    }

    /// Returns the direct operands of this node, in order.
    pub fn children(&self) -> Vec<&Expr> {
        match self {
            Expr::Const(_) | Expr::Symbol(_) => Vec::new(),
            Expr::Add(items) | Expr::Mul(items) => items.iter().collect(),
            Expr::Sub(left, right) | Expr::Div(left, right) | Expr::PowExpr(left, right) => {
                vec![left.as_ref(), right.as_ref()]
            }
            Expr::Pow(inner, _)
            | Expr::PowFloat(inner, _)
            | Expr::Neg(inner)
            | Expr::Abs(inner)
            | Expr::Sign(inner)
            | Expr::Exp(inner)
            | Expr::Ln(inner)
            | Expr::Sqrt(inner)
            | Expr::Sin(inner)
            | Expr::Cos(inner)
            | Expr::Tan(inner) => vec![inner.as_ref()],
        }
    }

    /// Rebuilds this node with every direct operand replaced by `f(operand)`.
    ///
    /// Leaves are returned unchanged.
    pub fn map_children<F>(&self, mut f: F) -> Expr
    where
        F: FnMut(&Expr) -> Expr,
    {
        match self {
            Expr::Const(_) | Expr::Symbol(_) => self.clone(),
            Expr::Add(terms) => Expr::Add(terms.iter().map(&mut f).collect()),
            Expr::Mul(factors) => Expr::Mul(factors.iter().map(&mut f).collect()),
            Expr::Sub(left, right) => Expr::Sub(Box::new(f(left)), Box::new(f(right))),
            Expr::Div(left, right) => Expr::Div(Box::new(f(left)), Box::new(f(right))),
            Expr::PowExpr(base, exponent) => {
                Expr::PowExpr(Box::new(f(base)), Box::new(f(exponent)))
            }
            Expr::Pow(base, exp) => Expr::Pow(Box::new(f(base)), *exp),
            Expr::PowFloat(base, exp) => Expr::PowFloat(Box::new(f(base)), *exp),
            Expr::Neg(inner) => Expr::Neg(Box::new(f(inner))),
            Expr::Abs(inner) => Expr::Abs(Box::new(f(inner))),
            Expr::Sign(inner) => Expr::Sign(Box::new(f(inner))),
            Expr::Exp(inner) => Expr::Exp(Box::new(f(inner))),
            Expr::Ln(inner) => Expr::Ln(Box::new(f(inner))),
            Expr::Sqrt(inner) => Expr::Sqrt(Box::new(f(inner))),
            Expr::Sin(inner) => Expr::Sin(Box::new(f(inner))),
            Expr::Cos(inner) => Expr::Cos(Box::new(f(inner))),
            Expr::Tan(inner) => Expr::Tan(Box::new(f(inner))),
        }
    }

    /// Returns the names of all symbols in the expression, sorted alphabetically.
    pub fn free_symbols(&self) -> BTreeSet<String> {
        let mut symbols = BTreeSet::new();
        self.collect_symbols(&mut symbols);
        symbols
    }

    fn collect_symbols(&self, symbols: &mut BTreeSet<String>) {
        match self {
            Expr::Symbol(name) => {
                symbols.insert(name.clone());
            }
            _ => {
                for child in self.children() {
                    child.collect_symbols(symbols);
                }
            }
        }
    }

    /// Returns true if the symbol `name` occurs anywhere in the expression.
    pub fn contains_symbol(&self, name: &str) -> bool {
        match self {
            Expr::Symbol(symbol) => symbol == name,
            _ => self.children().into_iter().any(|c| c.contains_symbol(name)),
        }
    }

    /// Total number of nodes in the tree.
    pub fn node_count(&self) -> usize {
        1 + self
            .children()
            .into_iter()
            .map(Expr::node_count)
            .sum::<usize>()
    }

    /// Length of the longest root-to-leaf path. A leaf has depth 1.
    pub fn depth(&self) -> usize {
        1 + self
            .children()
            .into_iter()
            .map(Expr::depth)
            .max()
            .unwrap_or(0)
    }

    /// Evaluates the expression by walking the tree.
    ///
    /// This is the reference semantics the compiled backends are checked against. It is
    /// much slower than a lowered [`Program`](crate::lower::Program) and is meant for
    /// one-off values and tests.
    ///
    /// # Errors
    /// Returns `LambdifyError::UnboundSymbol` if a symbol has no entry in `env`.
    pub fn eval(&self, env: &HashMap<String, f64>) -> Result<f64, LambdifyError> {
        let value = match self {
            Expr::Const(value) => *value,
            Expr::Symbol(name) => *env
                .get(name)
                .ok_or_else(|| LambdifyError::UnboundSymbol(name.clone()))?,
            Expr::Add(terms) => terms
                .iter()
                .try_fold(0.0, |acc, term| Ok::<_, LambdifyError>(acc + term.eval(env)?))?,
            Expr::Mul(factors) => factors
                .iter()
                .try_fold(1.0, |acc, f| Ok::<_, LambdifyError>(acc * f.eval(env)?))?,
            Expr::Sub(left, right) => left.eval(env)? - right.eval(env)?,
            Expr::Div(left, right) => left.eval(env)? / right.eval(env)?,
            Expr::Pow(base, exp) => powi(base.eval(env)?, *exp),
            Expr::PowFloat(base, exp) => base.eval(env)?.powf(*exp),
            Expr::PowExpr(base, exponent) => base.eval(env)?.powf(exponent.eval(env)?),
            Expr::Neg(inner) => -inner.eval(env)?,
            Expr::Abs(inner) => inner.eval(env)?.abs(),
            Expr::Sign(inner) => sign(inner.eval(env)?),
            Expr::Exp(inner) => inner.eval(env)?.exp(),
            Expr::Ln(inner) => inner.eval(env)?.ln(),
            Expr::Sqrt(inner) => inner.eval(env)?.sqrt(),
            Expr::Sin(inner) => inner.eval(env)?.sin(),
            Expr::Cos(inner) => inner.eval(env)?.cos(),
            Expr::Tan(inner) => inner.eval(env)?.tan(),
        };
        Ok(value)
    }

    /// Simplifies the expression by folding constants and applying basic algebraic rules.
    ///
    /// # Constant Folding
    /// - Evaluates constant operands of sums and products: 2 + x + 3 → x + 5
    /// - Evaluates functions of constants: exp(0) → 1, ln(1) → 0
    /// - Leaves non-finite results symbolic: 1 / 0 and ln(-1) are kept as written
    ///
    /// # Identity Rules
    /// - Additive identity: x + 0 → x, x - 0 → x, 0 - x → -x
    /// - Multiplicative identity: x * 1 → x, x / 1 → x
    /// - Annihilation: x * 0 → 0, 0 / x → 0
    /// - Cancellation: x - x → 0
    ///
    /// # Collection
    /// - Like terms: 2*x + 3*x → 5*x, x - (-x) keeps its structure
    /// - Equal bases with positive integer powers: x * x^2 → x^3
    ///
    /// # Exponent Rules
    /// - Zero exponent: x^0 → 1
    /// - First power: x^1 → x
    /// - Nested integer exponents: (x^a)^b → x^(a*b)
    /// - Integral float exponents become integer powers
    ///
    /// # Special Function Simplification
    /// - Absolute value: |-3| → 3, ||x|| → |x|, |-x| → |x|, |x^2| → x^2
    /// - Double negation: -(-x) → x
    /// - Inverse pairs: ln(exp(x)) → x, sqrt(x^2) → |x|
    ///
    /// # Returns
    /// A new simplified expression tree
    pub fn simplify(&self) -> Expr {
        match self {
            // Base cases - constants and symbols remain unchanged
            Expr::Const(_) | Expr::Symbol(_) => self.clone(),

            Expr::Add(terms) => simplify_add(terms.iter().map(Expr::simplify).collect()),

            Expr::Mul(factors) => simplify_mul(factors.iter().map(Expr::simplify).collect()),

            Expr::Sub(left, right) => {
                let l = left.simplify();
                let r = right.simplify();
                match (&l, &r) {
                    // Fold constants: 3 - 2 -> 1
                    (Expr::Const(a), Expr::Const(b)) => fold(a - b).unwrap_or(Expr::Sub(
                        Box::new(l.clone()),
                        Box::new(r.clone()),
                    )),
                    // Identity: x - 0 -> x
                    (_, Expr::Const(b)) if *b == 0.0 => l,
                    // 0 - x -> -x
                    (Expr::Const(a), _) if *a == 0.0 => negate(r),
                    // Zero: x - x -> 0
                    (a, b) if a == b => Expr::Const(0.0),
                    _ => Expr::Sub(Box::new(l), Box::new(r)),
                }
            }

            Expr::Div(left, right) => {
                let l = left.simplify();
                let r = right.simplify();
                match (&l, &r) {
                    // Fold constants: 6 / 2 -> 3
                    (Expr::Const(a), Expr::Const(b)) => fold(a / b).unwrap_or(Expr::Div(
                        Box::new(l.clone()),
                        Box::new(r.clone()),
                    )),
                    // Zero numerator: 0 / x -> 0
                    (Expr::Const(a), _) if *a == 0.0 => Expr::Const(0.0),
                    // Identity: x / 1 -> x
                    (_, Expr::Const(b)) if *b == 1.0 => l,
                    // Division by negative one: x / (-1) -> -x
                    (_, Expr::Const(b)) if *b == -1.0 => negate(l),
                    _ => Expr::Div(Box::new(l), Box::new(r)),
                }
            }

            Expr::Pow(base, exp) => simplify_pow(base.simplify(), *exp),

            Expr::PowFloat(base, exp) => simplify_powf(base.simplify(), *exp),

            Expr::PowExpr(base, exponent) => {
                let b = base.simplify();
                let e = exponent.simplify();
                match e {
                    // A constant exponent reduces to one of the literal power forms
                    Expr::Const(c) => simplify_powf(b, c),
                    _ => Expr::PowExpr(Box::new(b), Box::new(e)),
                }
            }

            Expr::Neg(inner) => negate(inner.simplify()),

            Expr::Abs(inner) => {
                let e = inner.simplify();
                match e {
                    // Fold constants: abs(-3) -> 3
                    Expr::Const(a) => Expr::Const(a.abs()),
                    // Nested abs: abs(abs(x)) -> abs(x)
                    Expr::Abs(_) => e,
                    // abs(-x) -> abs(x)
                    Expr::Neg(inner) => Expr::Abs(inner),
                    // abs(x^2) -> x^2 (even powers are never negative)
                    Expr::Pow(_, exp) if exp % 2 == 0 => e,
                    _ => Expr::Abs(Box::new(e)),
                }
            }

            Expr::Sign(inner) => match inner.simplify() {
                Expr::Const(a) => Expr::Const(sign(a)),
                e => Expr::Sign(Box::new(e)),
            },

            Expr::Exp(inner) => match inner.simplify() {
                Expr::Const(a) => fold(a.exp()).unwrap_or(Expr::Exp(Box::new(Expr::Const(a)))),
                e => Expr::Exp(Box::new(e)),
            },

            Expr::Ln(inner) => match inner.simplify() {
                Expr::Const(a) => fold(a.ln()).unwrap_or(Expr::Ln(Box::new(Expr::Const(a)))),
                // ln(exp(x)) -> x
                Expr::Exp(inner) => *inner,
                e => Expr::Ln(Box::new(e)),
            },

            Expr::Sqrt(inner) => match inner.simplify() {
                Expr::Const(a) => {
                    fold(a.sqrt()).unwrap_or(Expr::Sqrt(Box::new(Expr::Const(a))))
                }
                // sqrt(x^2) -> abs(x)
                Expr::Pow(x, 2) => Expr::Abs(x),
                e => Expr::Sqrt(Box::new(e)),
            },

            Expr::Sin(inner) => match inner.simplify() {
                Expr::Const(a) => Expr::Const(a.sin()),
                e => Expr::Sin(Box::new(e)),
            },

            Expr::Cos(inner) => match inner.simplify() {
                Expr::Const(a) => Expr::Const(a.cos()),
                e => Expr::Cos(Box::new(e)),
            },

            Expr::Tan(inner) => match inner.simplify() {
                Expr::Const(a) => fold(a.tan()).unwrap_or(Expr::Tan(Box::new(Expr::Const(a)))),
                e => Expr::Tan(Box::new(e)),
            },
        }
    }
}

/// Integer power with the exponent clamped into `i32` range.
pub(crate) fn powi(base: f64, exp: i64) -> f64 {
    match i32::try_from(exp) {
        Ok(exp) => base.powi(exp),
        Err(_) => base.powf(exp as f64),
    }
}

/// Wraps a folded value in a literal, refusing values that are not finite.
pub(crate) fn fold(value: f64) -> Option<Expr> {
    if value.is_finite() {
        Some(Expr::Const(value))
    } else {
        tracing::warn!(value, "constant fold is not finite, left symbolic");
        None
    }
}

/// Negates an already simplified expression.
fn negate(e: Expr) -> Expr {
    match e {
        Expr::Const(a) => Expr::Const(-a),
        // Double negation: -(-x) -> x
        Expr::Neg(inner) => *inner,
        // Factor out negation: -(c*x) -> (-c)*x
        Expr::Mul(mut factors) if matches!(factors.first(), Some(Expr::Const(_))) => {
            if let Some(Expr::Const(c)) = factors.first_mut() {
                *c = -*c;
            }
            simplify_mul(factors)
        }
        _ => Expr::Neg(Box::new(e)),
    }
}

/// Splits a simplified term into its numeric coefficient and the remaining factor.
fn split_coefficient(term: Expr) -> (f64, Expr) {
    match term {
        Expr::Neg(inner) => {
            let (c, rest) = split_coefficient(*inner);
            (-c, rest)
        }
        Expr::Mul(mut factors) if factors.len() >= 2 => {
            match factors.first().and_then(Expr::as_const) {
                Some(c) => {
                    factors.remove(0);
                    let rest = if factors.len() == 1 {
                        factors.remove(0)
                    } else {
                        Expr::Mul(factors)
                    };
                    (c, rest)
                }
                None => (1.0, Expr::Mul(factors)),
            }
        }
        other => (1.0, other),
    }
}

/// Rebuilds `coefficient * rest` without re-simplifying `rest`.
fn with_coefficient(coefficient: f64, rest: Expr) -> Expr {
    if coefficient == 1.0 {
        return rest;
    }
    if coefficient == -1.0 {
        return Expr::Neg(Box::new(rest));
    }
    match rest {
        Expr::Mul(factors) => {
            let mut all = Vec::with_capacity(factors.len() + 1);
            all.push(Expr::Const(coefficient));
            all.extend(factors);
            Expr::Mul(all)
        }
        other => Expr::Mul(vec![Expr::Const(coefficient), other]),
    }
}

/// Simplifies a sum whose operands are already simplified.
fn simplify_add(terms: Vec<Expr>) -> Expr {
    let mut constants: Vec<f64> = Vec::new();
    let mut collected: Vec<(f64, Expr)> = Vec::new();

    let mut pending = terms;
    pending.reverse();
    while let Some(term) = pending.pop() {
        match term {
            Expr::Const(c) => constants.push(c),
            // Flatten nested sums, keeping operand order
            Expr::Add(inner) => pending.extend(inner.into_iter().rev()),
            other => {
                let (coefficient, rest) = split_coefficient(other);
                // Combine like terms: c1*x + c2*x -> (c1+c2)*x
                match collected
                    .iter_mut()
                    .find(|(c, seen)| *seen == rest && (*c + coefficient).is_finite())
                {
                    Some((c, _)) => *c += coefficient,
                    None => collected.push((coefficient, rest)),
                }
            }
        }
    }

    let mut out: Vec<Expr> = collected
        .into_iter()
        .filter(|(c, _)| *c != 0.0)
        .map(|(c, rest)| with_coefficient(c, rest))
        .collect();

    match fold(constants.iter().sum()) {
        Some(Expr::Const(sum)) if sum == 0.0 && !out.is_empty() => {}
        Some(constant) => out.push(constant),
        // An overflowing sum keeps its operands
        None => out.extend(constants.into_iter().map(Expr::Const)),
    }
    if out.len() == 1 {
        return out.remove(0);
    }
    Expr::Add(out)
}

/// Simplifies a product whose operands are already simplified.
fn simplify_mul(factors: Vec<Expr>) -> Expr {
    let mut constants: Vec<f64> = Vec::new();
    let mut negative = false;
    let mut collected: Vec<(Expr, i64)> = Vec::new();

    let mut pending = factors;
    pending.reverse();
    while let Some(factor) = pending.pop() {
        match factor {
            Expr::Const(c) => constants.push(c),
            // Flatten nested products
            Expr::Mul(inner) => pending.extend(inner.into_iter().rev()),
            // Pull negation into the coefficient
            Expr::Neg(inner) => {
                negative = !negative;
                pending.push(*inner);
            }
            other => {
                let (base, exp) = match other {
                    Expr::Pow(base, exp) if exp > 0 => (*base, exp),
                    other => (other, 1),
                };
                // Merge positive powers of an equal base: x * x^2 -> x^3
                match collected
                    .iter_mut()
                    .find(|(seen, e)| *e > 0 && *seen == base && exp > 0)
                {
                    Some((_, e)) => *e += exp,
                    None => collected.push((base, exp)),
                }
            }
        }
    }

    let product: f64 = constants.iter().product();
    let product = if negative { -product } else { product };
    // Zero property: x * 0 -> 0
    if product == 0.0 {
        return Expr::Const(0.0);
    }

    let rest: Vec<Expr> = collected
        .into_iter()
        .map(|(base, exp)| if exp == 1 { base } else { simplify_pow(base, exp) })
        .collect();

    let constant = match fold(product) {
        Some(_) => product,
        None => {
            // An overflowing product keeps its operands
            if let (true, Some(first)) = (negative, constants.first_mut()) {
                *first = -*first;
            }
            let mut all: Vec<Expr> = constants.into_iter().map(Expr::Const).collect();
            all.extend(rest);
            return Expr::Mul(all);
        }
    };

    match rest.len() {
        0 => Expr::Const(constant),
        1 => with_coefficient(constant, rest.into_iter().next().unwrap_or(Expr::Const(1.0))),
        _ => with_coefficient(constant, Expr::Mul(rest)),
    }
}

/// Simplifies `base^exp` where `base` is already simplified.
fn simplify_pow(base: Expr, exp: i64) -> Expr {
    match (base, exp) {
        // x^0 -> 1 (including 0^0 = 1 by convention)
        (_, 0) => Expr::Const(1.0),
        // Identity: x^1 -> x
        (base, 1) => base,
        // Fold constants: 2^3 -> 8
        (Expr::Const(a), exp) => {
            fold(powi(a, exp)).unwrap_or(Expr::Pow(Box::new(Expr::Const(a)), exp))
        }
        // Nested exponents: (x^a)^b -> x^(a*b)
        (Expr::Pow(inner, inner_exp), exp) => match inner_exp.checked_mul(exp) {
            Some(product) => simplify_pow(*inner, product),
            None => Expr::Pow(Box::new(Expr::Pow(inner, inner_exp)), exp),
        },
        (base, exp) => Expr::Pow(Box::new(base), exp),
    }
}

/// Simplifies `base^exp` for a float exponent where `base` is already simplified.
fn simplify_powf(base: Expr, exp: f64) -> Expr {
    if exp.fract() == 0.0 && exp.abs() <= i32::MAX as f64 {
        return simplify_pow(base, exp as i64);
    }
    match base {
        Expr::Const(a) => {
            fold(a.powf(exp)).unwrap_or(Expr::PowFloat(Box::new(Expr::Const(a)), exp))
        }
        base => Expr::PowFloat(Box::new(base), exp),
    }
}

impl From<f64> for Expr {
    fn from(value: f64) -> Self {
        Expr::Const(value)
    }
}

impl ops::Add for Expr {
    type Output = Expr;

    fn add(self, rhs: Expr) -> Expr {
        Expr::Add(vec![self, rhs])
    }
}

impl ops::Add<f64> for Expr {
    type Output = Expr;

    fn add(self, rhs: f64) -> Expr {
        Expr::Add(vec![self, Expr::Const(rhs)])
    }
}

impl ops::Sub for Expr {
    type Output = Expr;

    fn sub(self, rhs: Expr) -> Expr {
        Expr::Sub(Box::new(self), Box::new(rhs))
    }
}

impl ops::Sub<f64> for Expr {
    type Output = Expr;

    fn sub(self, rhs: f64) -> Expr {
        Expr::Sub(Box::new(self), Box::new(Expr::Const(rhs)))
    }
}

impl ops::Mul for Expr {
    type Output = Expr;

    fn mul(self, rhs: Expr) -> Expr {
        Expr::Mul(vec![self, rhs])
    }
}

impl ops::Mul<f64> for Expr {
    type Output = Expr;

    fn mul(self, rhs: f64) -> Expr {
        Expr::Mul(vec![Expr::Const(rhs), self])
    }
}

impl ops::Add<Expr> for f64 {
    type Output = Expr;

    fn add(self, rhs: Expr) -> Expr {
        Expr::Add(vec![Expr::Const(self), rhs])
    }
}

impl ops::Mul<Expr> for f64 {
    type Output = Expr;

    fn mul(self, rhs: Expr) -> Expr {
        Expr::Mul(vec![Expr::Const(self), rhs])
    }
}

impl ops::Div for Expr {
    type Output = Expr;

    fn div(self, rhs: Expr) -> Expr {
        Expr::Div(Box::new(self), Box::new(rhs))
    }
}

impl ops::Div<f64> for Expr {
    type Output = Expr;

    fn div(self, rhs: f64) -> Expr {
        Expr::Div(Box::new(self), Box::new(Expr::Const(rhs)))
    }
}

impl ops::Neg for Expr {
    type Output = Expr;

    fn neg(self) -> Expr {
        Expr::Neg(Box::new(self))
    }
}

/// Implements string formatting for expressions.
///
/// This implementation converts expressions to their standard mathematical notation:
/// - Constants are formatted as numbers
/// - Symbols are formatted as their names
/// - Sums, products and binary operations are wrapped in parentheses
/// - Functions use function call notation
/// - Absolute value uses |x| notation
/// - Exponents use ^
/// - Negation uses - prefix
impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Const(val) => write!(f, "{val}"),
            Expr::Symbol(name) => write!(f, "{name}"),
            Expr::Add(terms) => write_joined(f, terms, " + "),
            Expr::Mul(factors) => write_joined(f, factors, " * "),
            Expr::Sub(left, right) => write!(f, "({left} - {right})"),
            Expr::Div(left, right) => write!(f, "({left} / {right})"),
            Expr::Pow(base, exp) => write!(f, "({base}^{exp})"),
            Expr::PowFloat(base, exp) => write!(f, "({base}^{exp})"),
            Expr::PowExpr(base, exponent) => write!(f, "({base}^{exponent})"),
            Expr::Neg(expr) => write!(f, "-({expr})"),
            Expr::Abs(expr) => write!(f, "|{expr}|"),
            Expr::Sign(expr) => write!(f, "sign({expr})"),
            Expr::Exp(expr) => write!(f, "exp({expr})"),
            Expr::Ln(expr) => write!(f, "ln({expr})"),
            Expr::Sqrt(expr) => write!(f, "sqrt({expr})"),
            Expr::Sin(expr) => write!(f, "sin({expr})"),
            Expr::Cos(expr) => write!(f, "cos({expr})"),
            Expr::Tan(expr) => write!(f, "tan({expr})"),
        }
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, items: &[Expr], sep: &str) -> fmt::Result {
    write!(f, "(")?;
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, "{sep}")?;
        }
        write!(f, "{item}")?;
    }
    write!(f, ")")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var(name: &str) -> Expr {
        Expr::symbol(name)
    }

    fn c(value: f64) -> Expr {
        Expr::Const(value)
    }

    #[test]
    fn test_simplify() {
        // 2 + 3 → 5
        assert_eq!((c(2.0) + c(3.0)).simplify(), c(5.0));

        // x + 0 → x
        assert_eq!((var("x") + 0.0).simplify(), var("x"));

        // x * 1 → x
        assert_eq!((var("x") * 1.0).simplify(), var("x"));

        // x * 0 → 0
        assert_eq!((var("x") * 0.0).simplify(), c(0.0));

        // x / 1 → x
        assert_eq!((var("x") / 1.0).simplify(), var("x"));

        // x^0 → 1, x^1 → x
        assert_eq!(var("x").powi(0).simplify(), c(1.0));
        assert_eq!(var("x").powi(1).simplify(), var("x"));

        // |-3| → 3
        assert_eq!(c(-3.0).abs().simplify(), c(3.0));

        // ||x|| → |x|
        assert_eq!(var("x").abs().abs().simplify(), var("x").abs());
    }

    #[test]
    fn test_division_by_self_is_kept() {
        // x / x is undefined at x = 0, so it must not collapse to 1
        let expr = (var("x") / var("x")).simplify();
        assert_eq!(expr, Expr::Div(Box::new(var("x")), Box::new(var("x"))));
    }

    #[test]
    fn test_nary_flattening_and_folding() {
        let expr = Expr::add(vec![
            c(2.0),
            Expr::add(vec![var("x"), c(3.0)]),
            Expr::add(vec![var("y")]),
        ]);
        assert_eq!(expr.simplify(), Expr::Add(vec![var("x"), var("y"), c(5.0)]));

        let expr = Expr::mul(vec![c(2.0), Expr::mul(vec![var("x"), c(3.0)])]);
        assert_eq!(expr.simplify(), Expr::Mul(vec![c(6.0), var("x")]));

        assert_eq!(Expr::add(vec![]).simplify(), c(0.0));
        assert_eq!(Expr::mul(vec![]).simplify(), c(1.0));
    }

    #[test]
    fn test_collect_like_terms() {
        // x + x → 2 * x
        assert_eq!(
            (var("x") + var("x")).simplify(),
            Expr::Mul(vec![c(2.0), var("x")])
        );

        // 2*x + 3*x - 5*x collapses entirely
        let expr = Expr::add(vec![2.0 * var("x"), 3.0 * var("x"), -(5.0 * var("x"))]);
        assert_eq!(expr.simplify(), c(0.0));

        // x * x^2 → x^3
        assert_eq!((var("x") * var("x").powi(2)).simplify(), var("x").powi(3));

        // x * x^-1 is left alone
        let expr = (var("x") * var("x").powi(-1)).simplify();
        assert_eq!(expr, Expr::Mul(vec![var("x"), var("x").powi(-1)]));
    }

    #[test]
    fn test_complex_simplifications() {
        // (x + 0) * (y + 0) → x * y
        let expr = (var("x") + 0.0) * (var("y") + 0.0);
        assert_eq!(expr.simplify(), Expr::Mul(vec![var("x"), var("y")]));

        // -(-x) → x
        assert_eq!((-(-var("x"))).simplify(), var("x"));

        // (1 * x) * (y * 1) → x * y
        let expr = (1.0 * var("x")) * (var("y") * 1.0);
        assert_eq!(expr.simplify(), Expr::Mul(vec![var("x"), var("y")]));

        // -(3 * x) → -3 * x
        assert_eq!(
            (-(3.0 * var("x"))).simplify(),
            Expr::Mul(vec![c(-3.0), var("x")])
        );

        // x - x → 0
        assert_eq!((var("x") - var("x")).simplify(), c(0.0));
    }

    #[test]
    fn test_special_functions() {
        assert_eq!(var("x").abs().abs().simplify(), var("x").abs());
        assert_eq!(var("x").powi(2).sqrt().simplify(), var("x").abs());
        assert_eq!(var("x").exp().ln().simplify(), var("x"));
        assert_eq!(c(0.0).exp().simplify(), c(1.0));
        assert_eq!(c(1.0).ln().simplify(), c(0.0));
        assert_eq!(var("x").powf(0.5).simplify(), var("x").powf(0.5));
        assert_eq!(var("x").powf(3.0).simplify(), var("x").powi(3));
        assert_eq!(var("x").pow(c(2.0)).simplify(), var("x").powi(2));
        assert_eq!(var("x").powi(2).powi(3).simplify(), var("x").powi(6));
        assert_eq!(c(-2.0).sign().simplify(), c(-1.0));
        assert_eq!(c(0.0).sign().simplify(), c(0.0));
    }

    #[test]
    fn test_non_finite_folds_are_kept() {
        let expr = (c(1.0) / c(0.0)).simplify();
        assert_eq!(expr, Expr::Div(Box::new(c(1.0)), Box::new(c(0.0))));

        let expr = c(-1.0).ln().simplify();
        assert_eq!(expr, c(-1.0).ln());

        let expr = c(-4.0).sqrt().simplify();
        assert_eq!(expr, c(-4.0).sqrt());
    }

    #[test]
    fn test_overflowing_folds_are_kept() {
        let expr = (c(1e200) * c(1e200)).simplify();
        assert_eq!(expr, Expr::Mul(vec![c(1e200), c(1e200)]));
        assert_eq!(expr.eval(&HashMap::new()).unwrap(), f64::INFINITY);

        let expr = (c(1e308) + c(1e308)).simplify();
        assert_eq!(expr, Expr::Add(vec![c(1e308), c(1e308)]));

        let expr = (c(-1e308) - c(1e308)).simplify();
        assert_eq!(expr, c(-1e308) - c(1e308));

        // Finite folds next to symbols still collapse
        let expr = (c(2.0) * var("x") * c(3.0)).simplify();
        assert_eq!(expr, Expr::Mul(vec![c(6.0), var("x")]));
    }

    #[test]
    fn test_eval() {
        let expr = Expr::add(vec![2.0 * var("x"), var("y").powi(2), var("x").sin()]);
        let env = HashMap::from([("x".to_string(), 0.0), ("y".to_string(), 3.0)]);
        assert_eq!(expr.eval(&env).unwrap(), 9.0);

        let err = var("z").eval(&env).unwrap_err();
        assert!(matches!(err, LambdifyError::UnboundSymbol(name) if name == "z"));
    }

    #[test]
    fn test_simplify_preserves_value() {
        let expr = Expr::add(vec![
            var("x") * var("x"),
            -(2.0 * var("x")),
            (var("y") - 0.0) / 1.0,
            var("x").powi(2).powi(2).sqrt(),
            c(1.0).exp() * var("y"),
        ]);
        let env = HashMap::from([("x".to_string(), -1.5), ("y".to_string(), 0.25)]);
        let before = expr.eval(&env).unwrap();
        let after = expr.simplify().eval(&env).unwrap();
        assert!((before - after).abs() < 1e-12);
    }

    #[test]
    fn test_free_symbols_and_metrics() {
        let expr = (var("b") + var("a")) * var("b").exp();
        let symbols: Vec<String> = expr.free_symbols().into_iter().collect();
        assert_eq!(symbols, vec!["a", "b"]);
        assert!(expr.contains_symbol("a"));
        assert!(!expr.contains_symbol("c"));
        assert!(!expr.is_constant());
        assert!((c(2.0) + c(1.0).sin()).is_constant());
        assert_eq!(expr.node_count(), 6);
        assert_eq!(expr.depth(), 3);
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", c(5.0)), "5");
        assert_eq!(format!("{}", var("x")), "x");

        let sum = var("x") + var("y");
        assert_eq!(format!("{sum}"), "(x + y)");

        let product = Expr::mul(vec![var("x"), var("y"), var("z")]);
        assert_eq!(format!("{product}"), "(x * y * z)");

        assert_eq!(format!("{}", var("x").exp()), "exp(x)");
        assert_eq!(format!("{}", var("x").abs()), "|x|");

        let complex = (var("x").powi(2) + var("y")) / var("z");
        assert_eq!(format!("{complex}"), "(((x^2) + y) / z)");
    }
}
