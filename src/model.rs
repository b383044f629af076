//! Lambdified models: an expression turned into compiled numerical functions.
//!
//! A [`Model`] is built once from a formula or a graph. Parameters are substituted first,
//! the remaining free symbols become the ordered input variables, and the result is
//! compiled together with its first and second partial derivatives.
//!
//! # Example
//!
//! ```
//! use lambdify_jit::model::Model;
//!
//! let model = Model::new("2*x + y^2").unwrap();
//! assert_eq!(model.eval(&[1.0, 2.0]).unwrap(), 6.0);
//! assert_eq!(model.gradient(&[1.0, 2.0]).unwrap(), vec![2.0, 4.0]);
//! assert_eq!(
//!     model.hessian(&[1.0, 2.0]).unwrap(),
//!     vec![vec![0.0, 0.0], vec![0.0, 2.0]]
//! );
//! ```
//!
//! # Variable Handling
//!
//! Variables are either taken from the expression and sorted alphabetically, or given
//! explicitly with [`ModelBuilder::variables`] and [`Model::from_var_map`]. Input slices
//! follow that order.

use std::collections::{BTreeSet, HashMap};

use colored::Colorize;
use itertools::Itertools;

use crate::backends::vector::Vector;
use crate::builder::get_clif_ir;
use crate::config::LambdifyOptions;
use crate::convert::parse;
use crate::errors::LambdifyError;
use crate::expr::Expr;
use crate::kernel::{check_columns, Kernel};
use crate::printer::to_rust_source;
use crate::substitute::Substitution;
use crate::system::ModelSystem;
use crate::types::ScalarFunction;

/// A compiled expression with its derivatives.
#[derive(Clone)]
pub struct Model {
    /// Graph as given, before parameters were fixed
    original: Expr,
    /// Graph after substitution and simplification, the one that is compiled
    expr: Expr,
    parameters: Substitution,
    var_map: HashMap<String, u32>,
    sorted_variables: Vec<String>,
    options: LambdifyOptions,
    kernel: Kernel,
    first_order: Vec<Kernel>,
    second_order: Vec<Vec<Kernel>>,
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{{")?;
        writeln!(f, "    {}: {}", "Expression".cyan(), self.expr)?;
        writeln!(f, "    {}: {:?}", "Variables".cyan(), self.sorted_variables)?;
        writeln!(f, "    {}: {:?}", "Parameters".cyan(), self.parameters)?;
        writeln!(f, "    {}: {:?}", "Backend".cyan(), self.options.backend)?;
        writeln!(
            f,
            "    {}: {}",
            "Compiled derivatives".cyan(),
            self.first_order.len() + self.second_order.iter().map(Vec::len).sum::<usize>()
        )?;
        writeln!(f, "}}")
    }
}

impl std::fmt::Display for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}({}) = {}",
            "f".cyan(),
            self.sorted_variables.join(", "),
            self.expr
        )?;
        if !self.parameters.is_empty() {
            let fixed = self
                .parameters
                .iter()
                .map(|(name, value)| format!("{name} = {value}"))
                .join(", ");
            write!(f, "  {} {}", "where".cyan(), fixed)?;
        }
        Ok(())
    }
}

/// Step-by-step construction of a [`Model`].
///
/// # Example
/// ```
/// # use lambdify_jit::model::Model;
/// # use lambdify_jit::config::{Backend, LambdifyOptions};
/// let model = Model::builder("a*x^2 + b")
///     .parameter("a", 3.0)
///     .parameter("b", 1.0)
///     .options(LambdifyOptions::default().with_backend(Backend::Interpreter))
///     .build()
///     .unwrap();
/// assert_eq!(model.sorted_variables(), &["x"]);
/// assert_eq!(model.eval(&[2.0]).unwrap(), 13.0);
/// ```
#[derive(Debug)]
pub struct ModelBuilder {
    source: Result<Expr, LambdifyError>,
    parameters: Substitution,
    variables: Option<Vec<String>>,
    options: LambdifyOptions,
}

/// Anything a model can be built from: a graph or formula text.
pub trait IntoExpr {
    fn into_expr(self) -> Result<Expr, LambdifyError>;
}

impl IntoExpr for Expr {
    fn into_expr(self) -> Result<Expr, LambdifyError> {
        Ok(self)
    }
}

impl IntoExpr for &Expr {
    fn into_expr(self) -> Result<Expr, LambdifyError> {
        Ok(self.clone())
    }
}

impl IntoExpr for &str {
    fn into_expr(self) -> Result<Expr, LambdifyError> {
        parse(self)
    }
}

impl IntoExpr for String {
    fn into_expr(self) -> Result<Expr, LambdifyError> {
        parse(&self)
    }
}

impl ModelBuilder {
    /// Fixes the symbol `name` to a constant or a sub-graph before compilation.
    pub fn parameter(mut self, name: impl Into<String>, value: impl Into<Expr>) -> Self {
        self.parameters.insert(name, value);
        self
    }

    /// Fixes every symbol in `parameters`.
    pub fn parameters(mut self, parameters: &Substitution) -> Self {
        self.parameters.merge(parameters);
        self
    }

    /// Sets the input order explicitly. Every free symbol left after substitution must
    /// be listed; names that do not occur are accepted and ignored by the kernels.
    pub fn variables<S: AsRef<str>>(mut self, order: &[S]) -> Self {
        self.variables = Some(order.iter().map(|v| v.as_ref().to_string()).collect());
        self
    }

    pub fn options(mut self, options: LambdifyOptions) -> Self {
        self.options = options;
        self
    }

    /// Substitutes, simplifies and compiles.
    ///
    /// # Errors
    /// Returns the parse error of the source text, `VariableNotFound` for free symbols
    /// that are neither parameters nor variables, `Config` for invalid options and
    /// `Build` when code generation fails.
    pub fn build(self) -> Result<Model, LambdifyError> {
        Model::build(self.source?, self.parameters, self.variables, self.options)
    }
}

impl Model {
    /// Parses `text` and compiles it with default options.
    ///
    /// Variables are sorted alphabetically.
    ///
    /// # Example
    /// ```
    /// # use lambdify_jit::model::Model;
    /// let model = Model::new("2*x + y^2").unwrap();
    /// let result = model.eval(&[1.0, 2.0]).unwrap(); // x=1, y=2 -> 2*1 + 2^2 = 6
    /// assert_eq!(result, 6.0);
    /// ```
    pub fn new(text: &str) -> Result<Self, LambdifyError> {
        Self::builder(text).build()
    }

    /// Parses `text` and uses `variables` as the input layout.
    ///
    /// Only the relative order of the indices matters: the map is renumbered to
    /// `0..n` so input slices never have gaps.
    ///
    /// # Example
    /// ```
    /// # use lambdify_jit::model::Model;
    /// # use std::collections::HashMap;
    /// let mut vars = HashMap::new();
    /// vars.insert("y".to_string(), 0); // y will be first in input arrays
    /// vars.insert("x".to_string(), 1); // x will be second
    ///
    /// let model = Model::from_var_map("2*x + y^2", &vars).unwrap();
    /// assert_eq!(model.eval(&[2.0, 1.0]).unwrap(), 6.0);
    /// ```
    pub fn from_var_map(
        text: &str,
        variables: &HashMap<String, u32>,
    ) -> Result<Self, LambdifyError> {
        let order: Vec<&String> = variables
            .iter()
            .sorted_by(|(a, i), (b, j)| i.cmp(j).then_with(|| a.cmp(b)))
            .map(|(name, _)| name)
            .collect();
        Self::builder(text).variables(&order).build()
    }

    /// Compiles an existing graph with an explicit variable order.
    pub fn from_expr<S: AsRef<str>>(expr: Expr, variables: &[S]) -> Result<Self, LambdifyError> {
        Self::builder(expr).variables(variables).build()
    }

    /// Starts a [`ModelBuilder`] from a graph or formula text.
    pub fn builder(source: impl IntoExpr) -> ModelBuilder {
        ModelBuilder {
            source: source.into_expr(),
            parameters: Substitution::new(),
            variables: None,
            options: LambdifyOptions::default(),
        }
    }

    fn build(
        original: Expr,
        parameters: Substitution,
        variables: Option<Vec<String>>,
        options: LambdifyOptions,
    ) -> Result<Self, LambdifyError> {
        options.validate()?;
        let span = tracing::debug_span!("build_model", nodes = original.node_count());
        let _guard = span.enter();

        let substituted = original.substitute(&parameters);
        // The default input layout must not depend on what simplification cancels
        let sorted_variables: Vec<String> = match variables {
            Some(order) => order.into_iter().unique().collect(),
            None => substituted.free_symbols().into_iter().collect(),
        };
        let expr = if options.simplify {
            substituted.simplify()
        } else {
            substituted
        };

        let free = expr.free_symbols();

        let listed: BTreeSet<&str> = sorted_variables.iter().map(String::as_str).collect();
        let missing = free
            .iter()
            .filter(|name| !listed.contains(name.as_str()))
            .join(", ");
        if !missing.is_empty() {
            return Err(LambdifyError::VariableNotFound(missing));
        }

        let var_map: HashMap<String, u32> = sorted_variables
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i as u32))
            .collect();

        let kernel = Kernel::compile(&expr, &var_map, &options)?;

        let gradient = if options.derivative_order >= 1 {
            expr.gradient_exprs(&sorted_variables)
        } else {
            Vec::new()
        };
        let first_order = gradient
            .iter()
            .map(|derivative| Kernel::compile(derivative, &var_map, &options))
            .collect::<Result<Vec<_>, _>>()?;

        // Mixed partials are symmetric, so only the upper triangle is compiled
        let mut second_order: Vec<Vec<Kernel>> = Vec::new();
        if options.derivative_order >= 2 {
            let n = sorted_variables.len();
            for (i, first) in gradient.iter().enumerate() {
                let mut row = Vec::with_capacity(n);
                for (j, variable) in sorted_variables.iter().enumerate() {
                    let kernel = match second_order.get(j).and_then(|r| r.get(i)) {
                        Some(mirror) if j < i => mirror.clone(),
                        _ => Kernel::compile(&first.derivative(variable), &var_map, &options)?,
                    };
                    row.push(kernel);
                }
                second_order.push(row);
            }
        }

        tracing::debug!(
            variables = sorted_variables.len(),
            parameters = parameters.len(),
            derivatives = first_order.len() + second_order.iter().map(Vec::len).sum::<usize>(),
            backend = ?options.backend,
            "compiled model"
        );

        Ok(Self {
            original,
            expr,
            parameters,
            var_map,
            sorted_variables,
            options,
            kernel,
            first_order,
            second_order,
        })
    }

    /// Fixes more symbols and recompiles.
    ///
    /// The fixed symbols drop out of the variable list; the remaining variables keep
    /// their relative order. Earlier sub-graph parameters are substituted as well, so a
    /// symbol they introduced can be fixed here. Entries for symbols already fixed
    /// replace the old value.
    ///
    /// # Example
    /// ```
    /// # use lambdify_jit::model::Model;
    /// # use lambdify_jit::substitute::Substitution;
    /// let model = Model::new("m * x + c").unwrap();
    /// assert_eq!(model.sorted_variables(), &["c", "m", "x"]);
    ///
    /// let line = model.with_parameters(&Substitution::from([("m", 2.0), ("c", 1.0)])).unwrap();
    /// assert_eq!(line.sorted_variables(), &["x"]);
    /// assert_eq!(line.eval(&[3.0]).unwrap(), 7.0);
    /// ```
    pub fn with_parameters(&self, parameters: &Substitution) -> Result<Self, LambdifyError> {
        let mut merged = Substitution::new();
        for (name, value) in self.parameters.iter() {
            merged.insert(name, value.substitute(parameters));
        }
        merged.merge(parameters);
        let variables = self
            .sorted_variables
            .iter()
            .filter(|name| !parameters.contains(name))
            .cloned()
            .collect();
        Self::build(
            self.original.clone(),
            merged,
            Some(variables),
            self.options.clone(),
        )
    }

    /// Evaluates the model at one point.
    ///
    /// # Example
    /// ```
    /// # use lambdify_jit::model::Model;
    /// let model = Model::new("2*x + y^2").unwrap();
    /// assert_eq!(model.eval(&[1.0, 2.0]).unwrap(), 6.0);
    /// assert_eq!(model.eval(&vec![1.0, 2.0]).unwrap(), 6.0);
    /// ```
    ///
    /// # Errors
    /// Returns `InvalidInputLength` if the length of values doesn't match the number of
    /// variables.
    pub fn eval<V: Vector>(&self, values: &V) -> Result<f64, LambdifyError> {
        let values = values.as_slice();
        self.validate_input_length(values)?;
        Ok(self.kernel.eval_point(values))
    }

    /// Evaluates the model element-wise over one column per variable.
    ///
    /// # Example
    /// ```
    /// # use lambdify_jit::model::Model;
    /// let model = Model::new("x * y").unwrap();
    /// let mut out = vec![0.0; 3];
    /// model.eval_columns(&[&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]], &mut out).unwrap();
    /// assert_eq!(out, vec![4.0, 10.0, 18.0]);
    /// ```
    ///
    /// # Errors
    /// Returns `InvalidInputLength` when the number of columns differs from the number of
    /// variables and `ColumnLengthMismatch` when a column differs in length from `out`.
    pub fn eval_columns(&self, columns: &[&[f64]], out: &mut [f64]) -> Result<(), LambdifyError> {
        if columns.len() != self.sorted_variables.len() {
            return Err(LambdifyError::InvalidInputLength {
                expected: self.sorted_variables.len(),
                got: columns.len(),
            });
        }
        check_columns(columns, self.sorted_variables.len(), out.len())?;
        self.kernel.eval_columns(columns, out)
    }

    /// All first partial derivatives at `values`, in variable order.
    ///
    /// Without compiled first derivatives (`derivative_order = 0`) the gradient is taken
    /// in forward mode instead.
    pub fn gradient(&self, values: &[f64]) -> Result<Vec<f64>, LambdifyError> {
        self.validate_input_length(values)?;
        if self.first_order.len() != self.sorted_variables.len() {
            return Ok(self.kernel.program().forward_gradient(values));
        }
        Ok(self
            .first_order
            .iter()
            .map(|kernel| kernel.eval_point(values))
            .collect())
    }

    /// The matrix of second partial derivatives at `values`.
    ///
    /// # Errors
    /// Returns `DerivativeNotFound` when the model was built with `derivative_order < 2`.
    pub fn hessian(&self, values: &[f64]) -> Result<Vec<Vec<f64>>, LambdifyError> {
        self.validate_input_length(values)?;
        if self.second_order.len() != self.sorted_variables.len() {
            return Err(LambdifyError::DerivativeNotFound(format!(
                "second order derivatives are not compiled (derivative_order = {})",
                self.options.derivative_order
            )));
        }
        Ok(self
            .second_order
            .iter()
            .map(|row| row.iter().map(|kernel| kernel.eval_point(values)).collect())
            .collect())
    }

    /// The compiled first derivative with respect to `variable`.
    ///
    /// # Example
    /// ```
    /// # use lambdify_jit::model::Model;
    /// let model = Model::new("2*x + y^2").unwrap();
    /// let dy = model.derivative("y").unwrap();
    /// assert_eq!(dy(&[1.0, 2.0]), 4.0);
    /// ```
    ///
    /// # Errors
    /// Returns `DerivativeNotFound` if `variable` is not an input of the model or first
    /// derivatives were not compiled.
    pub fn derivative(&self, variable: &str) -> Result<&ScalarFunction, LambdifyError> {
        self.sorted_variables
            .iter()
            .position(|name| name == variable)
            .and_then(|i| self.first_order.get(i))
            .map(Kernel::function)
            .ok_or_else(|| LambdifyError::DerivativeNotFound(variable.to_string()))
    }

    /// Compiles the mixed partial derivative taken in the order of `variables`.
    ///
    /// # Example
    /// ```
    /// # use lambdify_jit::model::Model;
    /// let model = Model::new("x^2 * y^2").unwrap();
    /// let dxdy = model.derive_wrt(&["x", "y"]).unwrap();
    /// assert_eq!(dxdy.eval_point(&[2.0, 3.0]), 24.0); // 4xy
    /// ```
    ///
    /// # Errors
    /// Returns `DerivativeNotFound` listing every name that is not a model variable.
    pub fn derive_wrt(&self, variables: &[&str]) -> Result<Kernel, LambdifyError> {
        self.check_known(variables)?;
        let derivative = self.expr.derive_wrt(variables);
        Kernel::compile(&derivative, &self.var_map, &self.options)
    }

    /// Compiles several first derivatives into one system evaluated in a single call.
    ///
    /// # Example
    /// ```
    /// # use lambdify_jit::model::Model;
    /// let model = Model::new("x^2 + y^2 + z^2").unwrap();
    /// let derivatives = model.derive_wrt_stack(&["x", "y"]).unwrap();
    /// let mut results = vec![0.0, 0.0];
    /// derivatives.eval_into(&[2.0, 3.0, 4.0], &mut results).unwrap();
    /// assert_eq!(results, vec![4.0, 6.0]);
    /// ```
    pub fn derive_wrt_stack(&self, variables: &[&str]) -> Result<ModelSystem, LambdifyError> {
        self.check_known(variables)?;
        let derivatives = self.expr.gradient_exprs(variables);
        let options = self.options.clone().with_derivative_order(0);
        ModelSystem::from_exprs(derivatives, &self.sorted_variables, &options)
    }

    /// Gradient by forward-mode differentiation of the compiled program, one dual-number
    /// pass per variable.
    pub fn forward_gradient(&self, values: &[f64]) -> Result<Vec<f64>, LambdifyError> {
        self.validate_input_length(values)?;
        Ok(self.kernel.program().forward_gradient(values))
    }

    /// Rust source of an element-wise function computing the model.
    pub fn source(&self, fn_name: &str) -> String {
        to_rust_source(&self.expr, fn_name, &self.sorted_variables)
    }

    /// Cranelift IR of the model's kernel.
    pub fn clif_ir(&self) -> Result<String, LambdifyError> {
        get_clif_ir(self.kernel.program())
    }

    /// The compiled graph, after substitution and simplification.
    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    pub fn parameters(&self) -> &Substitution {
        &self.parameters
    }

    pub fn options(&self) -> &LambdifyOptions {
        &self.options
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    /// Returns the map of variable names to their indices.
    pub fn variables(&self) -> &HashMap<String, u32> {
        &self.var_map
    }

    /// Returns the variables in input order.
    pub fn sorted_variables(&self) -> &[String] {
        &self.sorted_variables
    }

    fn check_known(&self, variables: &[&str]) -> Result<(), LambdifyError> {
        let unknown = variables
            .iter()
            .filter(|name| !self.var_map.contains_key(**name))
            .unique()
            .join(", ");
        if unknown.is_empty() {
            Ok(())
        } else {
            Err(LambdifyError::DerivativeNotFound(unknown))
        }
    }

    /// Validates that the input length matches the number of variables.
    fn validate_input_length(&self, values: &[f64]) -> Result<(), LambdifyError> {
        if values.len() != self.sorted_variables.len() {
            return Err(LambdifyError::InvalidInputLength {
                expected: self.sorted_variables.len(),
                got: values.len(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Backend;

    fn interpreter() -> LambdifyOptions {
        LambdifyOptions::default().with_backend(Backend::Interpreter)
    }

    #[test]
    fn test_basic_model() -> Result<(), Box<dyn std::error::Error>> {
        let model = Model::new("2*x + y^2")?;
        assert_eq!(model.sorted_variables(), &["x", "y"]);
        assert_eq!(model.eval(&[1.0, 2.0])?, 6.0);
        assert_eq!(model.gradient(&[1.0, 2.0])?, vec![2.0, 4.0]);
        assert_eq!(
            model.hessian(&[1.0, 2.0])?,
            vec![vec![0.0, 0.0], vec![0.0, 2.0]]
        );
        Ok(())
    }

    #[test]
    fn test_input_length() {
        let model = Model::new("x + y").unwrap();
        let err = model.eval(&[1.0]).unwrap_err();
        assert!(matches!(
            err,
            LambdifyError::InvalidInputLength { expected: 2, got: 1 }
        ));
        assert!(model.gradient(&[1.0, 2.0, 3.0]).is_err());
    }

    #[test]
    fn test_unknown_variable() {
        let vars = HashMap::from([("x".to_string(), 0)]);
        let err = Model::from_var_map("x + y + z", &vars).unwrap_err();
        assert!(matches!(err, LambdifyError::VariableNotFound(names) if names == "y, z"));
    }

    #[test]
    fn test_var_map_gaps_are_renumbered() {
        let vars = HashMap::from([("b".to_string(), 7), ("a".to_string(), 3)]);
        let model = Model::from_var_map("a - b", &vars).unwrap();
        assert_eq!(model.sorted_variables(), &["a", "b"]);
        assert_eq!(model.variables()["b"], 1);
        assert_eq!(model.eval(&[5.0, 2.0]).unwrap(), 3.0);
    }

    #[test]
    fn test_parameters_substituted() {
        let model = Model::builder("a * exp(-k * t)")
            .parameter("a", 2.0)
            .parameter("k", 0.5)
            .build()
            .unwrap();
        assert_eq!(model.sorted_variables(), &["t"]);
        assert!(!model.expr().contains_symbol("a"));
        let expected = 2.0 * (-1.0f64).exp();
        assert!((model.eval(&[2.0]).unwrap() - expected).abs() < 1e-12);
        assert!((model.gradient(&[2.0]).unwrap()[0] + 0.5 * expected).abs() < 1e-12);
    }

    #[test]
    fn test_parameter_as_subgraph() {
        let model = Model::builder("v^2")
            .parameter("v", Expr::symbol("x") + 1.0)
            .build()
            .unwrap();
        assert_eq!(model.sorted_variables(), &["x"]);
        assert_eq!(model.eval(&[2.0]).unwrap(), 9.0);
    }

    #[test]
    fn test_explicit_order_with_unused_variable() {
        let model = Model::builder("x * y")
            .variables(&["y", "w", "x"])
            .build()
            .unwrap();
        assert_eq!(model.eval(&[2.0, 100.0, 3.0]).unwrap(), 6.0);
        assert_eq!(model.gradient(&[2.0, 100.0, 3.0]).unwrap(), vec![3.0, 0.0, 2.0]);
    }

    #[test]
    fn test_with_parameters() {
        let model = Model::new("a*x^2 + b*x + c").unwrap();
        let fixed = model
            .with_parameters(&Substitution::from([("a", 1.0), ("c", 4.0)]))
            .unwrap();
        assert_eq!(fixed.sorted_variables(), &["b", "x"]);
        assert_eq!(fixed.eval(&[2.0, 3.0]).unwrap(), 19.0);

        let fixed = fixed.with_parameters(&Substitution::from([("b", 0.0)])).unwrap();
        assert_eq!(fixed.sorted_variables(), &["x"]);
        assert_eq!(fixed.parameters().len(), 3);
        assert_eq!(fixed.eval(&[3.0]).unwrap(), 13.0);
    }

    #[test]
    fn test_with_parameters_fixes_subgraph_symbols() {
        let model = Model::builder("v^2")
            .parameter("v", Expr::symbol("x") + 1.0)
            .build()
            .unwrap();
        assert_eq!(model.sorted_variables(), &["x"]);

        let fixed = model
            .with_parameters(&Substitution::from([("x", 2.0)]))
            .unwrap();
        assert!(fixed.sorted_variables().is_empty());
        assert_eq!(fixed.eval(&Vec::<f64>::new()).unwrap(), 9.0);
        assert_eq!(fixed.parameters().len(), 2);
    }

    #[test]
    fn test_default_order_ignores_simplification() {
        let simplified = Model::new("x - x + y").unwrap();
        let raw = Model::builder("x - x + y")
            .options(LambdifyOptions::default().with_simplify(false))
            .build()
            .unwrap();
        let system = ModelSystem::new(vec!["x - x + y".to_string()]).unwrap();

        assert_eq!(simplified.sorted_variables(), &["x", "y"]);
        assert_eq!(raw.sorted_variables(), simplified.sorted_variables());
        assert_eq!(system.sorted_variables(), simplified.sorted_variables());
        assert_eq!(simplified.eval(&[5.0, 2.0]).unwrap(), 2.0);
    }

    #[test]
    fn test_backends_agree() {
        let text = "sin(x) * exp(-y^2) + sqrt(x^2 + y^2) / (1 + abs(x - y))";
        let jit = Model::new(text).unwrap();
        let interp = Model::builder(text).options(interpreter()).build().unwrap();

        let point = [0.3, -1.2];
        assert!((jit.eval(&point).unwrap() - interp.eval(&point).unwrap()).abs() < 1e-12);

        let g1 = jit.gradient(&point).unwrap();
        let g2 = interp.gradient(&point).unwrap();
        for (a, b) in g1.iter().zip(&g2) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn test_forward_gradient_matches_symbolic() {
        let model = Model::new("x^3 * y + ln(x) * cos(y) + x^y").unwrap();
        let point = [1.5, 0.7];
        let symbolic = model.gradient(&point).unwrap();
        let forward = model.forward_gradient(&point).unwrap();
        for (a, b) in symbolic.iter().zip(&forward) {
            assert!((a - b).abs() < 1e-10, "{a} vs {b}");
        }
    }

    #[test]
    fn test_derivative_order_zero() {
        let options = LambdifyOptions::default().with_derivative_order(0);
        let model = Model::builder("x^2 * y").options(options).build().unwrap();
        assert_eq!(model.gradient(&[3.0, 2.0]).unwrap(), vec![12.0, 9.0]);
        assert!(matches!(
            model.derivative("x"),
            Err(LambdifyError::DerivativeNotFound(_))
        ));
        assert!(matches!(
            model.hessian(&[3.0, 2.0]),
            Err(LambdifyError::DerivativeNotFound(_))
        ));
    }

    #[test]
    fn test_derive_wrt() {
        let model = Model::new("x^3 * y^2").unwrap();
        let dxxy = model.derive_wrt(&["x", "x", "y"]).unwrap();
        assert_eq!(dxxy.eval_point(&[2.0, 3.0]), 72.0); // 12xy

        let err = model.derive_wrt(&["x", "q"]).unwrap_err();
        assert!(matches!(err, LambdifyError::DerivativeNotFound(name) if name == "q"));
    }

    #[test]
    fn test_derive_wrt_stack() {
        let model = Model::new("x^2 * y").unwrap();
        let system = model.derive_wrt_stack(&["y", "x"]).unwrap();
        assert_eq!(system.eval(&[3.0, 2.0]).unwrap(), vec![9.0, 12.0]);
    }

    #[test]
    fn test_eval_columns() {
        let model = Model::builder("x - 2*y").options(interpreter()).build().unwrap();
        let xs = [1.0, 2.0, 3.0];
        let ys = [0.5, 1.0, 1.5];
        let mut out = [0.0; 3];
        model.eval_columns(&[&xs, &ys], &mut out).unwrap();
        assert_eq!(out, [0.0, 0.0, 0.0]);

        let err = model.eval_columns(&[&xs], &mut out).unwrap_err();
        assert!(matches!(err, LambdifyError::InvalidInputLength { .. }));
    }

    #[test]
    fn test_constant_model() {
        let model = Model::builder("a * b")
            .parameter("a", 2.0)
            .parameter("b", 3.0)
            .build()
            .unwrap();
        assert!(model.sorted_variables().is_empty());
        assert_eq!(model.eval(&Vec::<f64>::new()).unwrap(), 6.0);
        assert!(model.gradient(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_parse_error() {
        assert!(matches!(Model::new("(x + "), Err(LambdifyError::Parse(_))));
        assert!(matches!(
            Model::new("floor(x)"),
            Err(LambdifyError::Convert(_))
        ));
    }

    #[test]
    fn test_source_and_display() {
        let model = Model::builder("a * x").parameter("a", 2.0).build().unwrap();
        let source = model.source("scaled");
        assert!(source.contains("pub fn scaled(x: &[f64], __out: &mut [f64])"));
        let shown = model.to_string();
        assert!(shown.contains("(x)"));
        assert!(shown.contains("a = 2"));
        assert!(model.clif_ir().unwrap().contains("function"));
    }
}
