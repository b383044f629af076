//! Compiled kernels behind a single interface for both backends.
//!
//! A [`Kernel`] owns the lowered program of one expression and a point-wise function for
//! it. With the JIT backend the function is native code, with the interpreter it runs the
//! stack program directly. Array evaluation goes through [`Kernel::eval_columns`], which
//! splits the points in chunks and hands the chunks to rayon.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;

use rayon::prelude::*;

use crate::builder::{build_combined_function, build_function};
use crate::config::{Backend, LambdifyOptions};
use crate::dual::Dual;
use crate::errors::LambdifyError;
use crate::expr::Expr;
use crate::interp;
use crate::lower::{lower, Program};
use crate::opt::optimize;
use crate::types::{CombinedFunction, ScalarFunction};

/// A lowered expression with an evaluation function attached.
///
/// Cloning is cheap: the program and the compiled function are shared.
#[derive(Clone)]
pub struct Kernel {
    backend: Backend,
    program: Arc<Program>,
    point: ScalarFunction,
    chunk_size: usize,
    parallel: bool,
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("backend", &self.backend)
            .field("ops", &self.program.ops.len())
            .field("n_inputs", &self.program.n_inputs)
            .finish()
    }
}

impl Kernel {
    /// Lowers `expr` against `var_map` and compiles it for the configured backend.
    ///
    /// # Example
    /// ```
    /// # use std::collections::HashMap;
    /// # use lambdify_jit::config::{Backend, LambdifyOptions};
    /// # use lambdify_jit::convert::parse;
    /// # use lambdify_jit::kernel::Kernel;
    /// let expr = parse("x * y + 1").unwrap();
    /// let vars = HashMap::from([("x".to_string(), 0), ("y".to_string(), 1)]);
    /// let options = LambdifyOptions::default().with_backend(Backend::Interpreter);
    /// let kernel = Kernel::compile(&expr, &vars, &options).unwrap();
    ///
    /// let mut out = vec![0.0; 3];
    /// kernel.eval_columns(&[&[1.0, 2.0, 3.0], &[2.0, 2.0, 2.0]], &mut out).unwrap();
    /// assert_eq!(out, vec![3.0, 5.0, 7.0]);
    /// ```
    ///
    /// # Errors
    /// Returns `VariableNotFound` for a symbol missing from `var_map` and `Build` when
    /// code generation fails.
    pub fn compile(
        expr: &Expr,
        var_map: &HashMap<String, u32>,
        options: &LambdifyOptions,
    ) -> Result<Self, LambdifyError> {
        let mut program = lower(expr, var_map)?;
        tracing::trace!(ops = program.ops.len(), nodes = expr.node_count(), "lowered expression");
        if options.optimize {
            program = optimize(program);
        }
        Self::from_program(program, options)
    }

    /// Wraps an already lowered program.
    pub fn from_program(
        program: Program,
        options: &LambdifyOptions,
    ) -> Result<Self, LambdifyError> {
        let program = Arc::new(program);
        let point: ScalarFunction = match options.backend {
            Backend::Jit => build_function(&program)?,
            Backend::Interpreter => {
                program.validate()?;
                let program = Arc::clone(&program);
                Arc::new(move |inputs: &[f64]| {
                    assert!(
                        inputs.len() >= program.n_inputs,
                        "Input slice has {} values, kernel reads {}",
                        inputs.len(),
                        program.n_inputs
                    );
                    program.eval(inputs)
                })
            }
        };

        Ok(Self {
            backend: options.backend,
            program,
            point,
            chunk_size: options.chunk_size.max(1),
            parallel: options.parallel,
        })
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    /// The point-wise function. It panics on a slice shorter than [`Kernel::n_inputs`].
    pub fn function(&self) -> &ScalarFunction {
        &self.point
    }

    pub fn n_inputs(&self) -> usize {
        self.program.n_inputs
    }

    /// Evaluates the kernel at one point.
    pub fn eval_point(&self, inputs: &[f64]) -> f64 {
        (self.point)(inputs)
    }

    /// Value and directional derivative along input `seed`, in dual numbers.
    pub fn eval_dual(&self, inputs: &[f64], seed: usize) -> Dual {
        self.program.eval_dual(inputs, seed)
    }

    /// Evaluates the kernel element-wise: `out[i] = f(columns[0][i], columns[1][i], ...)`.
    ///
    /// Columns past the ones the kernel reads are ignored but must still have the same
    /// length as `out`.
    ///
    /// # Errors
    /// Returns `InvalidInputLength` when fewer columns than inputs are given and
    /// `ColumnLengthMismatch` when a column length differs from `out.len()`.
    pub fn eval_columns(&self, columns: &[&[f64]], out: &mut [f64]) -> Result<(), LambdifyError> {
        check_columns(columns, self.program.n_inputs, out.len())?;
        if out.is_empty() {
            return Ok(());
        }

        let chunk_size = self.chunk_size;
        let run = |(index, chunk): (usize, &mut [f64])| {
            let start = index * chunk_size;
            self.eval_range(columns, start..start + chunk.len(), chunk);
        };

        if self.parallel && out.len() > chunk_size {
            out.par_chunks_mut(chunk_size).enumerate().for_each(run);
        } else {
            out.chunks_mut(chunk_size).enumerate().for_each(run);
        }
        Ok(())
    }

    /// Evaluates the points `range` into `out`.
    fn eval_range(&self, columns: &[&[f64]], range: Range<usize>, out: &mut [f64]) {
        match self.backend {
            Backend::Interpreter => interp::eval_chunk(&self.program, columns, range, out),
            Backend::Jit => {
                let mut row = vec![0.0; self.program.n_inputs];
                for (slot, point) in out.iter_mut().zip(range) {
                    for (value, column) in row.iter_mut().zip(columns) {
                        *value = column[point];
                    }
                    *slot = (self.point)(&row);
                }
            }
        }
    }
}

/// Checks that `columns` feed `n_inputs` inputs with `n_points` points each.
pub(crate) fn check_columns(
    columns: &[&[f64]],
    n_inputs: usize,
    n_points: usize,
) -> Result<(), LambdifyError> {
    if columns.len() < n_inputs {
        return Err(LambdifyError::InvalidInputLength {
            expected: n_inputs,
            got: columns.len(),
        });
    }
    if let Some((column, values)) = columns
        .iter()
        .enumerate()
        .find(|(_, values)| values.len() != n_points)
    {
        return Err(LambdifyError::ColumnLengthMismatch {
            column,
            expected: n_points,
            got: values.len(),
        });
    }
    Ok(())
}

/// Compiles several expressions into one function writing all results.
///
/// With the JIT backend this is a single native function sharing variable loads between
/// the outputs.
pub fn compile_combined(
    exprs: &[Expr],
    var_map: &HashMap<String, u32>,
    options: &LambdifyOptions,
) -> Result<CombinedFunction, LambdifyError> {
    let programs = exprs
        .iter()
        .map(|expr| {
            let program = lower(expr, var_map)?;
            Ok(if options.optimize {
                optimize(program)
            } else {
                program
            })
        })
        .collect::<Result<Vec<_>, LambdifyError>>()?;
    let results_len = programs.len();

    match options.backend {
        Backend::Jit => build_combined_function(&programs, results_len),
        Backend::Interpreter => {
            for program in &programs {
                program.validate()?;
            }
            Ok(Arc::new(move |inputs: &[f64], results: &mut [f64]| {
                assert_eq!(
                    results.len(),
                    results_len,
                    "Results buffer has incorrect length"
                );
                for (slot, program) in results.iter_mut().zip(&programs) {
                    *slot = program.eval(inputs);
                }
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::parse;

    fn vars(names: &[&str]) -> HashMap<String, u32> {
        names
            .iter()
            .enumerate()
            .map(|(i, v)| (v.to_string(), i as u32))
            .collect()
    }

    fn both_backends() -> [LambdifyOptions; 2] {
        [
            LambdifyOptions::default(),
            LambdifyOptions::default().with_backend(Backend::Interpreter),
        ]
    }

    #[test]
    fn test_backends_agree() {
        let expr = parse("exp(-x) * sin(y) + x^3 / (1 + y^2) - sqrt(abs(x*y))").unwrap();
        let map = vars(&["x", "y"]);
        let jit = Kernel::compile(&expr, &map, &LambdifyOptions::default()).unwrap();
        let interp = Kernel::compile(
            &expr,
            &map,
            &LambdifyOptions::default().with_backend(Backend::Interpreter),
        )
        .unwrap();

        for point in [[0.5, 1.5], [-2.0, 0.25], [3.0, -1.0]] {
            let a = jit.eval_point(&point);
            let b = interp.eval_point(&point);
            assert!((a - b).abs() < 1e-12, "{point:?}: {a} vs {b}");
        }
    }

    #[test]
    fn test_eval_columns_chunks() {
        let expr = parse("x*x - y").unwrap();
        let xs: Vec<f64> = (0..1000).map(|i| i as f64 * 0.01).collect();
        let ys: Vec<f64> = (0..1000).map(|i| i as f64).collect();

        for options in both_backends() {
            for parallel in [false, true] {
                let options = options.clone().with_chunk_size(7).with_parallel(parallel);
                let kernel = Kernel::compile(&expr, &vars(&["x", "y"]), &options).unwrap();
                let mut out = vec![0.0; xs.len()];
                kernel.eval_columns(&[&xs, &ys], &mut out).unwrap();
                for i in 0..xs.len() {
                    assert!((out[i] - (xs[i] * xs[i] - ys[i])).abs() < 1e-9);
                }
            }
        }
    }

    #[test]
    fn test_column_validation() {
        let expr = parse("x + y").unwrap();
        for options in both_backends() {
            let kernel = Kernel::compile(&expr, &vars(&["x", "y"]), &options).unwrap();

            let mut out = vec![0.0; 2];
            let err = kernel.eval_columns(&[&[1.0, 2.0]], &mut out).unwrap_err();
            assert!(matches!(
                err,
                LambdifyError::InvalidInputLength { expected: 2, got: 1 }
            ));

            let err = kernel
                .eval_columns(&[&[1.0, 2.0], &[1.0]], &mut out)
                .unwrap_err();
            assert!(matches!(
                err,
                LambdifyError::ColumnLengthMismatch {
                    column: 1,
                    expected: 2,
                    got: 1
                }
            ));

            let mut empty: Vec<f64> = Vec::new();
            kernel.eval_columns(&[&[], &[]], &mut empty).unwrap();
            assert!(empty.is_empty());
        }
    }

    #[test]
    fn test_constant_kernel_broadcasts() {
        let expr = parse("2 * 3 + 1").unwrap();
        for options in both_backends() {
            let kernel = Kernel::compile(&expr, &vars(&["x"]), &options).unwrap();
            let mut out = vec![0.0; 4];
            kernel.eval_columns(&[&[1.0, 2.0, 3.0, 4.0]], &mut out).unwrap();
            assert_eq!(out, vec![7.0; 4]);
        }
    }

    #[test]
    fn test_unknown_variable() {
        let expr = parse("x + z").unwrap();
        let err = Kernel::compile(&expr, &vars(&["x"]), &LambdifyOptions::default()).unwrap_err();
        assert!(matches!(err, LambdifyError::VariableNotFound(name) if name == "z"));
    }

    #[test]
    fn test_combined() {
        let exprs = vec![parse("x + y").unwrap(), parse("x * y").unwrap(), parse("5").unwrap()];
        for options in both_backends() {
            let f = compile_combined(&exprs, &vars(&["x", "y"]), &options).unwrap();
            let mut results = vec![0.0; 3];
            f(&[2.0, 3.0], &mut results);
            assert_eq!(results, vec![5.0, 6.0, 5.0]);
        }
    }

    #[test]
    fn test_dual() {
        let expr = parse("x^2 * y").unwrap();
        let kernel =
            Kernel::compile(&expr, &vars(&["x", "y"]), &LambdifyOptions::default()).unwrap();
        let d = kernel.eval_dual(&[3.0, 2.0], 0);
        assert_eq!(d.value, 18.0);
        assert_eq!(d.tangent, 12.0);
    }
}
