//! Systems of expressions sharing one variable ordering.
//!
//! All expressions of a [`ModelSystem`] are compiled into a single combined function,
//! so one call evaluates every output and variable loads are shared between them. The
//! columns of the Jacobian are compiled the same way, one combined function per
//! variable.
//!
//! # Example
//!
//! ```
//! use lambdify_jit::system::ModelSystem;
//!
//! let system = ModelSystem::new(vec![
//!     "2*x + y".to_string(),   // first expression
//!     "x^2 + z".to_string(),   // second expression
//! ]).unwrap();
//!
//! // Variables are automatically sorted (x, y, z)
//! let results = system.eval(&[1.0, 2.0, 3.0]).unwrap();
//! assert_eq!(results, vec![4.0, 4.0]); // [2*1 + 2, 1^2 + 3]
//!
//! // Compute derivatives
//! let dx = system.gradient(&[1.0, 2.0, 3.0], "x").unwrap();
//! assert_eq!(dx, vec![2.0, 2.0]); // [d/dx(2x + y), d/dx(x^2 + z)]
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use itertools::Itertools;
use rayon::prelude::*;

use crate::backends::matrix::Matrix;
use crate::config::LambdifyOptions;
use crate::convert::{extract_all_symbols, parse};
use crate::errors::LambdifyError;
use crate::expr::Expr;
use crate::kernel::compile_combined;
use crate::types::{CombinedFunction, MatrixFunction};

/// Several expressions evaluated together.
#[derive(Clone)]
pub struct ModelSystem {
    exprs: Vec<Expr>,
    variable_map: HashMap<String, u32>,
    sorted_variables: Vec<String>,
    options: LambdifyOptions,
    combined_fun: CombinedFunction,
    /// Jacobian columns: the derivatives of every output with respect to one variable
    jacobian_funs: HashMap<String, CombinedFunction>,
}

impl std::fmt::Debug for ModelSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelSystem")
            .field("exprs", &self.exprs.iter().map(ToString::to_string).collect_vec())
            .field("sorted_variables", &self.sorted_variables)
            .field("backend", &self.options.backend)
            .finish()
    }
}

impl ModelSystem {
    /// Parses every formula and compiles the system with default options.
    ///
    /// Variables are collected from all formulas and sorted alphabetically.
    ///
    /// # Example
    /// ```
    /// # use lambdify_jit::system::ModelSystem;
    /// let system = ModelSystem::new(vec![
    ///     "2*x + y".to_string(),
    ///     "x^2 + z".to_string()
    /// ]).unwrap();
    /// assert_eq!(system.sorted_variables(), &["x", "y", "z"]);
    /// ```
    pub fn new(expressions: Vec<String>) -> Result<Self, LambdifyError> {
        let sorted_variables = extract_all_symbols(&expressions)?;
        let exprs = parse_all(&expressions)?;
        Self::from_exprs(exprs, &sorted_variables, &LambdifyOptions::default())
    }

    /// Parses every formula and uses `variable_map` as the input layout.
    ///
    /// # Example
    /// ```
    /// # use lambdify_jit::system::ModelSystem;
    /// # use std::collections::HashMap;
    /// let var_map: HashMap<String, u32> = [
    ///     ("y".to_string(), 0),
    ///     ("x".to_string(), 1),
    /// ].into_iter().collect();
    ///
    /// let system = ModelSystem::from_var_map(
    ///     vec!["2*x + y".to_string(), "x - y".to_string()],
    ///     &var_map
    /// ).unwrap();
    /// assert_eq!(system.eval(&[1.0, 3.0]).unwrap(), vec![7.0, 2.0]);
    /// ```
    pub fn from_var_map(
        expressions: Vec<String>,
        variable_map: &HashMap<String, u32>,
    ) -> Result<Self, LambdifyError> {
        let sorted_variables: Vec<String> = variable_map
            .iter()
            .sorted_by(|(a, i), (b, j)| i.cmp(j).then_with(|| a.cmp(b)))
            .map(|(var, _)| var.clone())
            .collect();
        let exprs = parse_all(&expressions)?;
        Self::from_exprs(exprs, &sorted_variables, &LambdifyOptions::default())
    }

    /// Compiles already built graphs with an explicit variable order.
    ///
    /// Expressions are simplified first when `options.simplify` is set. The Jacobian
    /// columns are compiled up front when `options.derivative_order` is at least 1.
    pub fn from_exprs<S: AsRef<str>>(
        exprs: Vec<Expr>,
        variables: &[S],
        options: &LambdifyOptions,
    ) -> Result<Self, LambdifyError> {
        options.validate()?;
        let span = tracing::debug_span!("build_system", outputs = exprs.len());
        let _guard = span.enter();

        let exprs: Vec<Expr> = if options.simplify {
            exprs.iter().map(Expr::simplify).collect()
        } else {
            exprs
        };

        let sorted_variables: Vec<String> = variables
            .iter()
            .map(|v| v.as_ref().to_string())
            .unique()
            .collect();
        let variable_map: HashMap<String, u32> = sorted_variables
            .iter()
            .enumerate()
            .map(|(i, v)| (v.clone(), i as u32))
            .collect();

        let missing = exprs
            .iter()
            .flat_map(Expr::free_symbols)
            .filter(|name| !variable_map.contains_key(name))
            .sorted()
            .dedup()
            .join(", ");
        if !missing.is_empty() {
            return Err(LambdifyError::VariableNotFound(missing));
        }

        let combined_fun = compile_combined(&exprs, &variable_map, options)?;

        let mut jacobian_funs = HashMap::new();
        if options.derivative_order >= 1 {
            for var in &sorted_variables {
                let column: Vec<Expr> = exprs.iter().map(|expr| expr.derivative(var)).collect();
                jacobian_funs.insert(
                    var.clone(),
                    compile_combined(&column, &variable_map, options)?,
                );
            }
        }

        tracing::debug!(
            outputs = exprs.len(),
            variables = sorted_variables.len(),
            jacobian_columns = jacobian_funs.len(),
            "compiled system"
        );

        Ok(Self {
            exprs,
            variable_map,
            sorted_variables,
            options: options.clone(),
            combined_fun,
            jacobian_funs,
        })
    }

    /// Evaluates all expressions into a pre-allocated buffer.
    ///
    /// # Example
    /// ```
    /// # use lambdify_jit::system::ModelSystem;
    /// let system = ModelSystem::new(vec![
    ///     "x + y".to_string(),
    ///     "x * y".to_string(),
    /// ]).unwrap();
    ///
    /// let mut results = vec![0.0; 2];
    /// system.eval_into(&[2.0, 3.0], &mut results).unwrap();
    /// assert_eq!(results, vec![5.0, 6.0]);
    /// ```
    ///
    /// # Errors
    /// Returns `InvalidInputLength` if the number of inputs doesn't match the number of
    /// variables and `InvalidOutputLength` if `results` is not one slot per expression.
    pub fn eval_into<'a>(
        &self,
        inputs: &[f64],
        results: &'a mut [f64],
    ) -> Result<&'a [f64], LambdifyError> {
        self.validate_input_length(inputs)?;
        self.validate_output_length(results.len())?;
        (self.combined_fun)(inputs, results);
        Ok(results)
    }

    /// Evaluates all expressions, allocating the result vector.
    pub fn eval(&self, inputs: &[f64]) -> Result<Vec<f64>, LambdifyError> {
        let mut results = vec![0.0; self.exprs.len()];
        self.eval_into(inputs, &mut results)?;
        Ok(results)
    }

    /// Evaluates the system for many input sets on the rayon thread pool.
    ///
    /// Input sets are handed out in groups of `chunk_size`.
    ///
    /// # Example
    /// ```
    /// # use lambdify_jit::system::ModelSystem;
    /// let system = ModelSystem::new(vec![
    ///     "x + y".to_string(),
    ///     "x * y".to_string(),
    /// ]).unwrap();
    ///
    /// let input_sets = vec![vec![1.0, 2.0], vec![3.0, 4.0]];
    /// let results = system.eval_parallel(&input_sets).unwrap();
    /// assert_eq!(results, vec![vec![3.0, 2.0], vec![7.0, 12.0]]);
    /// ```
    pub fn eval_parallel(&self, input_sets: &[Vec<f64>]) -> Result<Vec<Vec<f64>>, LambdifyError> {
        for inputs in input_sets {
            self.validate_input_length(inputs)?;
        }

        let n_outputs = self.exprs.len();
        let fun = Arc::clone(&self.combined_fun);
        let evaluate = move |inputs: &Vec<f64>| {
            let mut results = vec![0.0; n_outputs];
            fun(inputs, &mut results);
            results
        };

        if !self.options.parallel {
            return Ok(input_sets.iter().map(evaluate).collect());
        }
        Ok(input_sets
            .par_chunks(self.options.chunk_size)
            .flat_map_iter(|chunk| chunk.iter().map(&evaluate))
            .collect())
    }

    /// Partial derivatives of every output with respect to `variable`, one column of the
    /// Jacobian.
    ///
    /// # Example
    /// ```
    /// # use lambdify_jit::system::ModelSystem;
    /// let system = ModelSystem::new(vec![
    ///     "x^2*y".to_string(),  // f1
    ///     "x*y^2".to_string(),  // f2
    /// ]).unwrap();
    ///
    /// let gradient = system.gradient(&[2.0, 3.0], "x").unwrap();
    /// assert_eq!(gradient, vec![12.0, 9.0]); // ∂f1/∂x, ∂f2/∂x
    /// ```
    pub fn gradient(&self, inputs: &[f64], variable: &str) -> Result<Vec<f64>, LambdifyError> {
        self.validate_input_length(inputs)?;
        let fun = self.jacobian_column(variable)?;
        let mut results = vec![0.0; self.exprs.len()];
        fun(inputs, &mut results);
        Ok(results)
    }

    /// The Jacobian at `inputs`: row `i` holds the derivatives of output `i`.
    ///
    /// `variables` selects and orders the columns; `None` means all variables in input
    /// order.
    ///
    /// # Example
    /// ```
    /// # use lambdify_jit::system::ModelSystem;
    /// let system = ModelSystem::new(vec![
    ///     "x^2*y".to_string(),  // f1
    ///     "x*y^2".to_string(),  // f2
    /// ]).unwrap();
    ///
    /// let jacobian = system.jacobian(&[2.0, 3.0], None).unwrap();
    /// assert_eq!(jacobian, vec![vec![12.0, 4.0], vec![9.0, 12.0]]);
    /// ```
    pub fn jacobian(
        &self,
        inputs: &[f64],
        variables: Option<&[String]>,
    ) -> Result<Vec<Vec<f64>>, LambdifyError> {
        self.validate_input_length(inputs)?;

        let variables = variables.unwrap_or(&self.sorted_variables);
        let n_outputs = self.exprs.len();
        let mut results = vec![Vec::with_capacity(variables.len()); n_outputs];

        // Columns are computed one variable at a time and transposed into rows
        let mut column = vec![0.0; n_outputs];
        for var in variables {
            self.jacobian_column(var)?(inputs, &mut column);
            for (row, &value) in results.iter_mut().zip(&column) {
                row.push(value);
            }
        }
        Ok(results)
    }

    /// Writes the full Jacobian into any [`Matrix`] of shape `(outputs, variables)`.
    ///
    /// # Errors
    /// Returns `InvalidOutputLength` when the matrix has the wrong shape.
    pub fn jacobian_into<M: Matrix>(
        &self,
        inputs: &[f64],
        out: &mut M,
    ) -> Result<(), LambdifyError> {
        self.validate_input_length(inputs)?;
        let n_outputs = self.exprs.len();
        let n_vars = self.sorted_variables.len();
        let (rows, cols) = out.dims();
        if (rows, cols) != (n_outputs, n_vars) {
            return Err(LambdifyError::InvalidOutputLength {
                expected: n_outputs * n_vars,
                got: rows * cols,
            });
        }

        let mut column = vec![0.0; n_outputs];
        for (j, var) in self.sorted_variables.iter().enumerate() {
            self.jacobian_column(var)?(inputs, &mut column);
            for (i, &value) in column.iter().enumerate() {
                out.set(i, j, value);
            }
        }
        Ok(())
    }

    /// Compiles one function filling the Jacobian restricted to `variables`.
    ///
    /// # Example
    /// ```
    /// # use lambdify_jit::system::ModelSystem;
    /// let system = ModelSystem::new(vec![
    ///     "x^2*y + z".to_string(),    // f1
    ///     "x*y^2 - z^2".to_string(),  // f2
    /// ]).unwrap();
    ///
    /// let jacobian_fn = system.jacobian_wrt(&["x", "y"]).unwrap();
    /// let mut results = vec![vec![0.0; 2]; 2];
    /// jacobian_fn(&[2.0, 3.0, 1.0], &mut results);
    /// assert_eq!(results, vec![vec![12.0, 4.0], vec![9.0, 12.0]]);
    /// ```
    ///
    /// # Errors
    /// Returns `VariableNotFound` if a name is not a system variable.
    pub fn jacobian_wrt(&self, variables: &[&str]) -> Result<MatrixFunction, LambdifyError> {
        self.check_known(variables)?;

        let derivatives: Vec<Expr> = self
            .exprs
            .iter()
            .cartesian_product(variables)
            .map(|(expr, var)| expr.derivative(var))
            .collect();
        let fun = compile_combined(&derivatives, &self.variable_map, &self.options)?;
        let n_vars = variables.len();
        let n_outputs = self.exprs.len();

        Ok(Arc::new(move |inputs: &[f64], results: &mut [Vec<f64>]| {
            let mut flat = vec![0.0; n_vars * n_outputs];
            fun(inputs, &mut flat);
            for (row, values) in results.iter_mut().zip(flat.chunks(n_vars.max(1))) {
                row[..n_vars].copy_from_slice(values);
            }
        }))
    }

    /// Compiles the mixed partial derivative of every output, taken in the order of
    /// `variables`.
    ///
    /// # Example
    /// ```
    /// # use lambdify_jit::system::ModelSystem;
    /// let system = ModelSystem::new(vec![
    ///     "x^2*y".to_string(),  // f1
    ///     "x*y^2".to_string(),  // f2
    /// ]).unwrap();
    ///
    /// let derivatives = system.derive_wrt(&["x", "y"]).unwrap();
    /// let mut results = vec![0.0; 2];
    /// derivatives(&[2.0, 3.0], &mut results);
    /// assert_eq!(results, vec![4.0, 6.0]); // 2x, 2y
    /// ```
    pub fn derive_wrt(&self, variables: &[&str]) -> Result<CombinedFunction, LambdifyError> {
        self.check_known(variables)?;
        let derivatives: Vec<Expr> = self
            .exprs
            .iter()
            .map(|expr| expr.derive_wrt(variables))
            .collect();
        compile_combined(&derivatives, &self.variable_map, &self.options)
    }

    pub fn exprs(&self) -> &[Expr] {
        &self.exprs
    }

    /// Returns the variables in input order.
    pub fn sorted_variables(&self) -> &[String] {
        &self.sorted_variables
    }

    /// Returns the map of variable names to their indices.
    pub fn variables(&self) -> &HashMap<String, u32> {
        &self.variable_map
    }

    /// Returns the compiled evaluation function.
    pub fn fun(&self) -> &CombinedFunction {
        &self.combined_fun
    }

    pub fn num_outputs(&self) -> usize {
        self.exprs.len()
    }

    fn jacobian_column(&self, variable: &str) -> Result<&CombinedFunction, LambdifyError> {
        if !self.variable_map.contains_key(variable) {
            return Err(LambdifyError::VariableNotFound(variable.to_string()));
        }
        self.jacobian_funs
            .get(variable)
            .ok_or_else(|| LambdifyError::DerivativeNotFound(variable.to_string()))
    }

    fn check_known(&self, variables: &[&str]) -> Result<(), LambdifyError> {
        match variables
            .iter()
            .find(|var| !self.variable_map.contains_key(**var))
        {
            Some(var) => Err(LambdifyError::VariableNotFound(var.to_string())),
            None => Ok(()),
        }
    }

    fn validate_input_length(&self, inputs: &[f64]) -> Result<(), LambdifyError> {
        if inputs.len() != self.sorted_variables.len() {
            return Err(LambdifyError::InvalidInputLength {
                expected: self.sorted_variables.len(),
                got: inputs.len(),
            });
        }
        Ok(())
    }

    fn validate_output_length(&self, len: usize) -> Result<(), LambdifyError> {
        if len != self.exprs.len() {
            return Err(LambdifyError::InvalidOutputLength {
                expected: self.exprs.len(),
                got: len,
            });
        }
        Ok(())
    }
}

fn parse_all(expressions: &[String]) -> Result<Vec<Expr>, LambdifyError> {
    expressions.iter().map(|text| parse(text)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Backend;

    #[test]
    fn test_system_with_different_variables() -> Result<(), Box<dyn std::error::Error>> {
        let system = ModelSystem::new(vec![
            "2*x + y".to_string(),   // uses x, y
            "z^2".to_string(),       // uses only z
            "x + y + z".to_string(), // uses all
        ])?;

        assert_eq!(system.sorted_variables(), &["x", "y", "z"]);
        assert_eq!(system.eval(&[1.0, 2.0, 3.0])?, vec![4.0, 9.0, 6.0]);
        Ok(())
    }

    #[test]
    fn test_invalid_lengths() {
        let system = ModelSystem::new(vec!["x + y".to_string(), "y + z".to_string()]).unwrap();
        assert!(matches!(
            system.eval(&[1.0, 2.0]),
            Err(LambdifyError::InvalidInputLength { expected: 3, got: 2 })
        ));

        let mut results = vec![0.0; 3];
        assert!(matches!(
            system.eval_into(&[1.0, 2.0, 3.0], &mut results),
            Err(LambdifyError::InvalidOutputLength { expected: 2, got: 3 })
        ));
    }

    #[test]
    fn test_custom_variable_map() -> Result<(), Box<dyn std::error::Error>> {
        let var_map = HashMap::from([("alpha".to_string(), 1), ("beta".to_string(), 0)]);
        let system = ModelSystem::from_var_map(
            vec!["2*alpha + beta".to_string(), "alpha^2 - beta".to_string()],
            &var_map,
        )?;
        assert_eq!(system.eval(&[2.0, 1.0])?, vec![4.0, -1.0]);
        Ok(())
    }

    #[test]
    fn test_error_undefined_variable() {
        let var_map = HashMap::from([("x".to_string(), 0), ("y".to_string(), 1)]);
        let result = ModelSystem::from_var_map(
            vec!["x + y".to_string(), "x + undefined_var".to_string()],
            &var_map,
        );
        assert!(matches!(
            result,
            Err(LambdifyError::VariableNotFound(name)) if name == "undefined_var"
        ));
    }

    #[test]
    fn test_empty_system() -> Result<(), Box<dyn std::error::Error>> {
        let system = ModelSystem::new(vec![])?;
        assert!(system.eval(&[])?.is_empty());
        Ok(())
    }

    #[test]
    fn test_derive_wrt() -> Result<(), Box<dyn std::error::Error>> {
        let system = ModelSystem::new(vec!["x^2*y".to_string(), "x*y^2".to_string()])?;

        let dx = system.derive_wrt(&["x"])?;
        let mut results = vec![0.0, 0.0];
        dx(&[2.0, 3.0], &mut results);
        assert_eq!(results, vec![12.0, 9.0]);

        let dxy = system.derive_wrt(&["x", "y"])?;
        dxy(&[2.0, 3.0], &mut results);
        assert_eq!(results, vec![4.0, 6.0]);

        assert!(matches!(
            system.derive_wrt(&["w"]),
            Err(LambdifyError::VariableNotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn test_jacobian_wrt() -> Result<(), Box<dyn std::error::Error>> {
        let system = ModelSystem::new(vec![
            "x^2*y + z".to_string(),   // f1
            "x*y^2 - z^2".to_string(), // f2
        ])?;

        let jacobian_fn = system.jacobian_wrt(&["x", "y", "z"])?;
        let mut results = vec![vec![0.0; 3]; 2];
        jacobian_fn(&[2.0, 3.0, 1.0], &mut results);
        assert_eq!(results[0], vec![12.0, 4.0, 1.0]);
        assert_eq!(results[1], vec![9.0, 12.0, -2.0]);

        // Reuse the buffer with a subset in a different order
        let jacobian_fn = system.jacobian_wrt(&["z", "x"])?;
        let mut results = vec![vec![0.0; 2]; 2];
        jacobian_fn(&[1.0, 2.0, 3.0], &mut results);
        assert_eq!(results, vec![vec![1.0, 4.0], vec![-6.0, 4.0]]);

        assert!(matches!(
            system.jacobian_wrt(&["x", "w"]),
            Err(LambdifyError::VariableNotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn test_jacobian_selected_columns() -> Result<(), Box<dyn std::error::Error>> {
        let system = ModelSystem::new(vec!["x*y".to_string(), "y - x".to_string()])?;
        let order = vec!["y".to_string(), "x".to_string()];
        let jacobian = system.jacobian(&[2.0, 5.0], Some(&order))?;
        assert_eq!(jacobian, vec![vec![2.0, 5.0], vec![1.0, -1.0]]);
        Ok(())
    }

    #[cfg(feature = "ndarray")]
    #[test]
    fn test_jacobian_into_matrix() -> Result<(), Box<dyn std::error::Error>> {
        let system = ModelSystem::new(vec!["x^2*y".to_string(), "x*y^2".to_string()])?;
        let mut out = <ndarray::Array2<f64> as Matrix>::zeros(2, 2);
        system.jacobian_into(&[2.0, 3.0], &mut out)?;
        assert_eq!(out.flat_slice(), &[12.0, 4.0, 9.0, 12.0]);

        let mut wrong = <ndarray::Array2<f64> as Matrix>::zeros(2, 3);
        assert!(matches!(
            system.jacobian_into(&[2.0, 3.0], &mut wrong),
            Err(LambdifyError::InvalidOutputLength { expected: 4, got: 6 })
        ));
        Ok(())
    }

    #[test]
    fn test_eval_parallel_matches_serial() -> Result<(), Box<dyn std::error::Error>> {
        let exprs = vec![parse("sin(x) * y")?, parse("x^2 - exp(-y)")?];
        let options = LambdifyOptions::default().with_chunk_size(3);
        let system = ModelSystem::from_exprs(exprs, &["x", "y"], &options)?;

        let input_sets: Vec<Vec<f64>> = (0..20)
            .map(|i| vec![i as f64 * 0.1, 1.0 - i as f64 * 0.05])
            .collect();
        let parallel = system.eval_parallel(&input_sets)?;
        for (inputs, results) in input_sets.iter().zip(&parallel) {
            assert_eq!(results, &system.eval(inputs)?);
        }

        assert!(system.eval_parallel(&[vec![1.0]]).is_err());
        Ok(())
    }

    #[test]
    fn test_interpreter_without_jacobian() -> Result<(), Box<dyn std::error::Error>> {
        let options = LambdifyOptions::default()
            .with_backend(Backend::Interpreter)
            .with_derivative_order(0);
        let system = ModelSystem::from_exprs(vec![parse("x * y")?], &["x", "y"], &options)?;
        assert_eq!(system.eval(&[3.0, 4.0])?, vec![12.0]);
        assert!(matches!(
            system.gradient(&[3.0, 4.0], "x"),
            Err(LambdifyError::DerivativeNotFound(_))
        ));

        // Compiled on demand regardless of derivative_order
        let dx = system.derive_wrt(&["x"])?;
        let mut results = vec![0.0];
        dx(&[3.0, 4.0], &mut results);
        assert_eq!(results, vec![4.0]);
        Ok(())
    }
}
