//! Symbolic expression graphs turned into fast numerical functions.
//!
//! Formulas are parsed with [evalexpr](https://github.com/ISibboI/evalexpr) into an
//! immutable expression graph. The graph can be substituted, simplified and
//! differentiated symbolically. It is then lowered to a small stack program that runs
//! either as native code compiled with
//! [Cranelift](https://github.com/bytecodealliance/wasmtime/tree/main/cranelift) or in
//! an array-oriented interpreter.
//!
//! # Features
//!
//! - Substitution of parameters by constants or sub-graphs, with constant folding
//! - Symbolic partial derivatives of any order, plus forward mode with dual numbers
//! - JIT-compiled point-wise kernels and chunked, parallel evaluation over columns
//! - Rust source and Cranelift IR output
//!
//! # Example
//!
//! ```rust
//! use lambdify_jit::prelude::*;
//!
//! // Fix the amplitude, keep `x` and `w` as variables
//! let model = Model::builder("a * exp(-x^2 / w)")
//!     .parameter("a", 2.0)
//!     .build()
//!     .unwrap();
//! assert_eq!(model.sorted_variables(), &["w", "x"]);
//!
//! // Evaluate at a point and over columns
//! assert_eq!(model.eval(&[1.0, 0.0]).unwrap(), 2.0);
//! let mut out = vec![0.0; 2];
//! model.eval_columns(&[&[1.0, 1.0], &[0.0, 0.0]], &mut out).unwrap();
//! assert_eq!(out, vec![2.0, 2.0]);
//!
//! // Gradient [∂/∂w, ∂/∂x]
//! let gradient = model.gradient(&[1.0, 0.0]).unwrap();
//! assert_eq!(gradient, vec![0.0, 0.0]);
//! ```

pub use model::Model;
pub use system::ModelSystem;

pub mod prelude {
    pub use crate::backends::matrix::Matrix;
    pub use crate::backends::vector::Vector;
    pub use crate::config::{Backend, LambdifyOptions};
    pub use crate::convert::parse;
    pub use crate::errors::LambdifyError;
    pub use crate::expr::Expr;
    pub use crate::kernel::Kernel;
    pub use crate::model::{Model, ModelBuilder};
    pub use crate::substitute::Substitution;
    pub use crate::system::ModelSystem;
}

/// Vector and matrix types accepted by the evaluation entry points
pub mod backends {
    pub mod matrix;
    pub mod vector;
}
/// JIT compilation of lowered programs using Cranelift
pub mod builder;
/// Compilation and evaluation options
pub mod config;
/// Conversion from parsed expressions to expression graphs
pub mod convert;
/// Symbolic differentiation
pub mod diff;
/// Forward-mode dual numbers
pub mod dual;
/// Error types for the various failure modes
pub mod errors;
/// Expression graph representation and simplification
pub mod expr;
/// Array-oriented interpreter backend
pub mod interp;
/// Backend-independent compiled kernels
pub mod kernel;
/// Logger setup for binaries
pub mod logging;
/// Lowering of graphs into stack programs
pub mod lower;
/// High-level lambdified models
pub mod model;
/// Peephole optimisation of lowered programs
pub mod opt;
/// Rust source output
pub mod printer;
/// Substitution and generalised replacement
pub mod substitute;
/// Systems of expressions
pub mod system;
/// Shared function pointer types
pub mod types;
/// Math intrinsics linked into JIT-compiled code
pub(crate) mod operators;
