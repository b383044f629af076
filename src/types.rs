use std::sync::Arc;

/// Type alias for a compiled function that evaluates a single expression at one point.
///
/// This represents a function that:
/// - Takes a slice of input values corresponding to variables in order
/// - Returns a single f64 result from evaluating the expression
/// - Is both Send and Sync for thread safety
///
/// Both the JIT and the interpreter backend produce this type.
pub type ScalarFunction = Arc<dyn Fn(&[f64]) -> f64 + Send + Sync>;

/// Type alias for a compiled function that evaluates multiple expressions at once.
///
/// This represents a function that:
/// - Takes a slice of input values corresponding to variables
/// - Takes a mutable slice to store the results
/// - Evaluates multiple expressions and writes results into the output slice
/// - Is both Send and Sync for thread safety
pub type CombinedFunction = Arc<dyn Fn(&[f64], &mut [f64]) + Send + Sync>;

/// Type alias for a compiled function that evaluates multiple expressions into a matrix.
///
/// This represents a function that:
/// - Takes a slice of input values corresponding to variables
/// - Takes a mutable slice of vectors to store the matrix results
/// - Each inner vector represents a row in the result matrix
/// - Is both Send and Sync for thread safety
pub type MatrixFunction = Arc<dyn Fn(&[f64], &mut [Vec<f64>]) + Send + Sync>;
