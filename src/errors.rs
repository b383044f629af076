//! Error types for the lambdify-jit crate.
//!
//! This module defines the various error types that can occur while parsing expressions,
//! lowering expression graphs and JIT compiling them. The main error types are:
//!
//! - `ConvertError`: Errors during conversion from the evalexpr AST to an expression graph
//! - `BuilderError`: Errors during JIT compilation with Cranelift
//! - `LambdifyError`: High-level errors when building and evaluating models
//!
//! Each error type implements the standard Error trait and provides detailed error messages.

use cranelift_codegen::CodegenError;
use cranelift_module::ModuleError;
use evalexpr::{DefaultNumericTypes, EvalexprError};
use thiserror::Error;

/// Errors that can occur during conversion from the evalexpr AST to an expression graph.
#[derive(Error, Debug)]
pub enum ConvertError {
    /// Error when a `^` node does not have exactly two operands
    #[error("Malformed exponentiation: {0}")]
    ExpOperator(String),
    /// Error when encountering an operator that is not supported by our implementation
    #[error("Unsupported operator: {0}")]
    UnsupportedOperator(String),
    /// Error when encountering a function that is not supported by our implementation
    #[error("Unsupported function: {0}")]
    UnsupportedFunction(String),
    /// Error when the root node does not have exactly one child
    #[error("Expected single child for root node: {0}")]
    RootNode(String),
    /// Error when a constant value is not numeric
    #[error("Expected numeric constant: {0}")]
    ConstOperator(String),
    /// Error when a function is called with the wrong number of arguments
    #[error("Function {name} expects {expected} argument(s), got {got}")]
    Arity {
        name: String,
        expected: usize,
        got: usize,
    },
}

/// Errors that can occur during JIT compilation of lowered programs.
///
/// This enum represents various failure modes in the process of converting a
/// [`Program`](crate::lower::Program) into machine code using Cranelift.
#[derive(Error, Debug)]
pub enum BuilderError {
    /// Error when the target machine architecture is not supported
    #[error("host machine is not supported: {0}")]
    HostMachineNotSupported(String),
    /// Error when a Cranelift setting is rejected
    #[error("invalid compiler setting: {0}")]
    Setting(String),
    /// Error during Cranelift code generation
    #[error("codegen error: {0}")]
    CodegenError(CodegenError),
    /// Error in the Cranelift JIT module
    #[error("module error: {0}")]
    ModuleError(ModuleError),
    /// Error when defining the JIT function
    #[error("function error: {0}")]
    FunctionError(String),
    /// Error when declaring the JIT function or an imported intrinsic
    #[error("declaration error: {0}")]
    DeclarationError(String),
    /// Error when the stack program is not balanced
    #[error("malformed program: {0}")]
    MalformedProgram(String),
}

/// High-level errors that can occur when building, differentiating and evaluating models.
///
/// This enum wraps lower-level errors from the parsing, lowering and JIT compilation
/// stages and adds the validation failures of the evaluation entry points.
#[derive(Debug, Error)]
pub enum LambdifyError {
    /// Error when parsing the initial expression string with evalexpr
    #[error("Failed to parse expression")]
    Parse(#[from] EvalexprError<DefaultNumericTypes>),
    /// Error when converting the evalexpr AST into an expression graph
    #[error("Failed to build expression graph")]
    Convert(#[from] ConvertError),
    /// Error when JIT compiling a lowered program
    #[error("Failed to build JIT function")]
    Build(#[from] BuilderError),
    /// Error when trying to get a derivative for a variable that doesn't exist
    #[error("Derivative not found for variable: {0}")]
    DerivativeNotFound(String),
    /// Error when the input length is not the same as the number of variables
    #[error("Invalid input length: expected {expected}, got {got}")]
    InvalidInputLength { expected: usize, got: usize },
    /// Error when a symbol has no index in the variable map
    #[error("Variable not found: {0}")]
    VariableNotFound(String),
    /// Error when the output length is not the same as the number of results
    #[error("Invalid output length: expected {expected}, got {got}")]
    InvalidOutputLength { expected: usize, got: usize },
    /// Error when array-valued inputs do not all have the same number of points
    #[error("Column {column} has {got} points, expected {expected}")]
    ColumnLengthMismatch {
        column: usize,
        expected: usize,
        got: usize,
    },
    /// Error when a reference evaluation meets a symbol without a value
    #[error("No value bound to symbol: {0}")]
    UnboundSymbol(String),
    /// Error when options cannot be read or parsed
    #[error("Invalid configuration: {0}")]
    Config(String),
}
