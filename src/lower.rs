//! Lowering of expression graphs into a linear stack program.
//!
//! A [`Program`] is a post-order sequence of [`LinearOp`]s over an implicit value stack.
//! It is the single representation every backend consumes: the Cranelift builder turns
//! each op into IR, the array interpreter runs each op over a whole chunk of points, and
//! the forward-mode evaluator runs it over dual numbers.
//!
//! Lowering resolves symbol names to input indices once, so nothing downstream needs to
//! know about names.

use std::collections::HashMap;

use crate::dual::{Dual, Scalar};
use crate::errors::{BuilderError, LambdifyError};
use crate::expr::Expr;

/// Linear operation for flattened expression evaluation
#[derive(Debug, Clone, PartialEq)]
pub enum LinearOp {
    /// Load constant value
    LoadConst(f64),
    /// Load variable by index
    LoadVar(u32),
    /// Add two values from stack positions
    Add,
    /// Subtract two values from stack positions
    Sub,
    /// Multiply two values from stack positions
    Mul,
    /// Divide two values from stack positions
    Div,
    /// Absolute value of stack top
    Abs,
    /// Sign of stack top
    Sign,
    /// Negate stack top
    Neg,
    /// Power operation with constant exponent
    PowConst(i64),
    /// Power operation with floating point constant exponent
    PowFloat(f64),
    /// Power operation with expression exponent
    PowExpr,
    /// Exponential of stack top
    Exp,
    /// Natural log of stack top
    Ln,
    /// Square root of stack top
    Sqrt,
    /// Sine of stack top (argument in radians)
    Sin,
    /// Cosine of stack top (argument in radians)
    Cos,
    /// Tangent of stack top (argument in radians)
    Tan,
    /// a × b + c  (fused)
    Fma,
    /// a × b − c  (fused)
    Fmsub,
}

impl LinearOp {
    /// Number of stack values the op consumes.
    pub fn arity(&self) -> usize {
        match self {
            LinearOp::LoadConst(_) | LinearOp::LoadVar(_) => 0,
            LinearOp::Add | LinearOp::Sub | LinearOp::Mul | LinearOp::Div | LinearOp::PowExpr => 2,
            LinearOp::Fma | LinearOp::Fmsub => 3,
            _ => 1,
        }
    }

    /// Applies a unary op. Other ops leave the value untouched.
    pub fn apply1<T: Scalar>(&self, x: T) -> T {
        match self {
            LinearOp::Abs => x.abs(),
            LinearOp::Sign => x.sign(),
            LinearOp::Neg => -x,
            LinearOp::PowConst(e) => x.powi(*e),
            LinearOp::PowFloat(e) => x.powf(*e),
            LinearOp::Exp => x.exp(),
            LinearOp::Ln => x.ln(),
            LinearOp::Sqrt => x.sqrt(),
            LinearOp::Sin => x.sin(),
            LinearOp::Cos => x.cos(),
            LinearOp::Tan => x.tan(),
            _ => x,
        }
    }

    /// Applies a binary op to `(left, right)`. Other ops return `left`.
    pub fn apply2<T: Scalar>(&self, l: T, r: T) -> T {
        match self {
            LinearOp::Add => l + r,
            LinearOp::Sub => l - r,
            LinearOp::Mul => l * r,
            LinearOp::Div => l / r,
            LinearOp::PowExpr => l.pow(r),
            _ => l,
        }
    }

    /// Applies a fused op to `(a, b, c)`. Other ops return `a`.
    pub fn apply3<T: Scalar>(&self, a: T, b: T, c: T) -> T {
        match self {
            LinearOp::Fma => a.mul_add(b, c),
            LinearOp::Fmsub => a.mul_add(b, -c),
            _ => a,
        }
    }
}

/// Flattened expression representation for efficient evaluation
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    /// Linear sequence of operations
    pub ops: Vec<LinearOp>,
    /// Number of input slots the program reads from
    pub n_inputs: usize,
    /// Pre-computed constant result (if expression is constant)
    pub constant_result: Option<f64>,
}

/// Lowers an expression into a stack program.
///
/// `var_map` assigns each symbol its position in the input slice. The number of inputs
/// of the program is one more than the largest index in the map, so a program can be
/// handed a slice holding variables it never reads.
///
/// A constant expression lowers to a single load with `constant_result` set.
///
/// # Errors
/// Returns `LambdifyError::VariableNotFound` for a symbol missing from `var_map`.
pub fn lower(expr: &Expr, var_map: &HashMap<String, u32>) -> Result<Program, LambdifyError> {
    let n_inputs = var_map
        .values()
        .max()
        .map(|max| *max as usize + 1)
        .unwrap_or(0);

    if let Some(constant) = evaluate_constant(expr) {
        return Ok(Program::constant(constant, n_inputs));
    }

    let mut ops = Vec::with_capacity(expr.node_count());
    lower_recursive(expr, var_map, &mut ops)?;

    Ok(Program {
        ops,
        n_inputs,
        constant_result: None,
    })
}

/// Tries to evaluate an expression as a constant.
fn evaluate_constant(expr: &Expr) -> Option<f64> {
    if !expr.is_constant() {
        return None;
    }
    expr.eval(&HashMap::new()).ok()
}

fn lower_recursive(
    expr: &Expr,
    var_map: &HashMap<String, u32>,
    ops: &mut Vec<LinearOp>,
) -> Result<(), LambdifyError> {
    match expr {
        Expr::Const(val) => ops.push(LinearOp::LoadConst(*val)),
        Expr::Symbol(name) => {
            let index = var_map
                .get(name)
                .ok_or_else(|| LambdifyError::VariableNotFound(name.clone()))?;
            ops.push(LinearOp::LoadVar(*index));
        }
        // n-ary nodes lower to a left fold of binary ops
        Expr::Add(terms) => lower_nary(terms, 0.0, LinearOp::Add, var_map, ops)?,
        Expr::Mul(factors) => lower_nary(factors, 1.0, LinearOp::Mul, var_map, ops)?,
        Expr::Sub(left, right) => lower_binary(left, right, LinearOp::Sub, var_map, ops)?,
        Expr::Div(left, right) => lower_binary(left, right, LinearOp::Div, var_map, ops)?,
        Expr::PowExpr(base, exponent) => {
            lower_binary(base, exponent, LinearOp::PowExpr, var_map, ops)?
        }
        Expr::Pow(base, exp) => {
            lower_recursive(base, var_map, ops)?;
            ops.push(LinearOp::PowConst(*exp));
        }
        Expr::PowFloat(base, exp) => {
            lower_recursive(base, var_map, ops)?;
            ops.push(LinearOp::PowFloat(*exp));
        }
        Expr::Neg(inner) => lower_unary(inner, LinearOp::Neg, var_map, ops)?,
        Expr::Abs(inner) => lower_unary(inner, LinearOp::Abs, var_map, ops)?,
        Expr::Sign(inner) => lower_unary(inner, LinearOp::Sign, var_map, ops)?,
        Expr::Exp(inner) => lower_unary(inner, LinearOp::Exp, var_map, ops)?,
        Expr::Ln(inner) => lower_unary(inner, LinearOp::Ln, var_map, ops)?,
        Expr::Sqrt(inner) => lower_unary(inner, LinearOp::Sqrt, var_map, ops)?,
        Expr::Sin(inner) => lower_unary(inner, LinearOp::Sin, var_map, ops)?,
        Expr::Cos(inner) => lower_unary(inner, LinearOp::Cos, var_map, ops)?,
        Expr::Tan(inner) => lower_unary(inner, LinearOp::Tan, var_map, ops)?,
    }
    Ok(())
}

fn lower_nary(
    items: &[Expr],
    identity: f64,
    op: LinearOp,
    var_map: &HashMap<String, u32>,
    ops: &mut Vec<LinearOp>,
) -> Result<(), LambdifyError> {
    let Some((first, rest)) = items.split_first() else {
        ops.push(LinearOp::LoadConst(identity));
        return Ok(());
    };
    lower_recursive(first, var_map, ops)?;
    for item in rest {
        lower_recursive(item, var_map, ops)?;
        ops.push(op.clone());
    }
    Ok(())
}

fn lower_binary(
    left: &Expr,
    right: &Expr,
    op: LinearOp,
    var_map: &HashMap<String, u32>,
    ops: &mut Vec<LinearOp>,
) -> Result<(), LambdifyError> {
    lower_recursive(left, var_map, ops)?;
    lower_recursive(right, var_map, ops)?;
    ops.push(op);
    Ok(())
}

fn lower_unary(
    inner: &Expr,
    op: LinearOp,
    var_map: &HashMap<String, u32>,
    ops: &mut Vec<LinearOp>,
) -> Result<(), LambdifyError> {
    lower_recursive(inner, var_map, ops)?;
    ops.push(op);
    Ok(())
}

impl Program {
    /// A program that ignores its inputs and yields `value`.
    pub fn constant(value: f64, n_inputs: usize) -> Self {
        Self {
            ops: vec![LinearOp::LoadConst(value)],
            n_inputs,
            constant_result: Some(value),
        }
    }

    /// Deepest the value stack gets while running the program.
    pub fn max_stack_depth(&self) -> usize {
        let mut depth = 0usize;
        let mut max = 0usize;
        for op in &self.ops {
            depth = depth.saturating_sub(op.arity()) + 1;
            max = max.max(depth);
        }
        max
    }

    /// Checks that every op finds its operands and exactly one value is left.
    ///
    /// # Errors
    /// Returns `BuilderError::MalformedProgram` describing the first violation.
    pub fn validate(&self) -> Result<(), BuilderError> {
        let mut depth = 0usize;
        for (position, op) in self.ops.iter().enumerate() {
            if let LinearOp::LoadVar(index) = op {
                if *index as usize >= self.n_inputs {
                    return Err(BuilderError::MalformedProgram(format!(
                        "op {position} reads input {index} of {}",
                        self.n_inputs
                    )));
                }
            }
            if depth < op.arity() {
                return Err(BuilderError::MalformedProgram(format!(
                    "op {position} ({op:?}) needs {} operands, stack holds {depth}",
                    op.arity()
                )));
            }
            depth = depth - op.arity() + 1;
        }
        if depth != 1 {
            return Err(BuilderError::MalformedProgram(format!(
                "{depth} values left on the stack"
            )));
        }
        Ok(())
    }

    /// Runs the program over any [`Scalar`] type, reading inputs through `load`.
    ///
    /// The program is expected to be valid; see [`Program::validate`].
    pub fn eval_scalar<T, F>(&self, load: F) -> T
    where
        T: Scalar,
        F: Fn(u32) -> T,
    {
        if let Some(c) = self.constant_result {
            return T::from_f64(c);
        }

        let nan = T::from_f64(f64::NAN);
        let mut stack: Vec<T> = Vec::with_capacity(self.max_stack_depth());
        for op in &self.ops {
            let value = match op {
                LinearOp::LoadConst(c) => T::from_f64(*c),
                LinearOp::LoadVar(index) => load(*index),
                _ => match op.arity() {
                    1 => op.apply1(stack.pop().unwrap_or(nan)),
                    2 => {
                        let r = stack.pop().unwrap_or(nan);
                        let l = stack.pop().unwrap_or(nan);
                        op.apply2(l, r)
                    }
                    _ => {
                        let c = stack.pop().unwrap_or(nan);
                        let b = stack.pop().unwrap_or(nan);
                        let a = stack.pop().unwrap_or(nan);
                        op.apply3(a, b, c)
                    }
                },
            };
            stack.push(value);
        }
        stack.pop().unwrap_or(nan)
    }

    /// Evaluates the program at a single point.
    pub fn eval(&self, inputs: &[f64]) -> f64 {
        self.eval_scalar(|index| inputs[index as usize])
    }

    /// Evaluates the program and its partial derivative with respect to input `seed`.
    pub fn eval_dual(&self, inputs: &[f64], seed: usize) -> Dual {
        self.eval_scalar(|index| {
            let value = inputs[index as usize];
            if index as usize == seed {
                Dual::variable(value)
            } else {
                Dual::constant(value)
            }
        })
    }

    /// Gradient by forward-mode differentiation, one pass per input.
    pub fn forward_gradient(&self, inputs: &[f64]) -> Vec<f64> {
        (0..self.n_inputs)
            .map(|seed| self.eval_dual(inputs, seed).tangent)
            .collect()
    }
}
