//! Conversion module for transforming evalexpr AST nodes into expression graphs.
//!
//! This module handles converting the AST nodes from the evalexpr crate into our own
//! [`Expr`] type. Identifiers become symbols, `+` and `*` chains become n-ary nodes and
//! function calls are mapped onto the supported unary functions.
//!
//! The main entry points are [`parse`], which goes from a string to a graph, and
//! `build_ast`, which recursively traverses an already parsed evalexpr tree.

use std::collections::{BTreeSet, HashMap};

use evalexpr::{build_operator_tree, Node, Operator, Value};

use crate::errors::{ConvertError, LambdifyError};
use crate::expr::Expr;

/// Parses a formula into an expression graph.
///
/// The graph is returned exactly as written; call [`Expr::simplify`] to clean it up.
///
/// # Errors
/// Returns `LambdifyError::Parse` if evalexpr rejects the text, or
/// `LambdifyError::Convert` if it uses an operator or function that has no
/// counterpart in [`Expr`].
///
/// # Example
/// ```
/// # use lambdify_jit::convert::parse;
/// let expr = parse("2*x + y^2").unwrap();
/// assert_eq!(expr.free_symbols().len(), 2);
/// ```
pub fn parse(text: &str) -> Result<Expr, LambdifyError> {
    let tree: Node = build_operator_tree(text)?;
    Ok(build_ast(&tree)?)
}

/// Converts an evalexpr AST node into an expression graph.
///
/// # Supported operations
/// * Basic arithmetic: +, -, *, / and unary minus
/// * Identifiers: any evalexpr identifier becomes a [`Expr::Symbol`]
/// * Constants: integer and floating point literals
/// * Functions: abs, sign, exp, ln, log, sqrt, sin, cos, tan, with or without a `math::` prefix
/// * Exponentiation: `^` with an integer, float or symbolic exponent
pub fn build_ast(node: &Node) -> Result<Expr, ConvertError> {
    match node.operator() {
        // Sums and products flatten directly nested chains into one n-ary node
        Operator::Add => {
            let mut terms = Vec::with_capacity(node.children().len());
            for child in node.children() {
                match build_ast(child)? {
                    Expr::Add(inner) => terms.extend(inner),
                    other => terms.push(other),
                }
            }
            Ok(Expr::Add(terms))
        }
        Operator::Mul => {
            let mut factors = Vec::with_capacity(node.children().len());
            for child in node.children() {
                match build_ast(child)? {
                    Expr::Mul(inner) => factors.extend(inner),
                    other => factors.push(other),
                }
            }
            Ok(Expr::Mul(factors))
        }
        Operator::Div => {
            let (left, right) = binary(node, "/")?;
            Ok(Expr::Div(Box::new(left), Box::new(right)))
        }
        Operator::Sub => {
            let (left, right) = binary(node, "-")?;
            Ok(Expr::Sub(Box::new(left), Box::new(right)))
        }
        Operator::Const { value } => match value {
            Value::Float(f) => Ok(Expr::Const(*f)),
            Value::Int(i) => Ok(Expr::Const(*i as f64)),
            _ => Err(ConvertError::ConstOperator(format!("{value:?}"))),
        },
        Operator::VariableIdentifierRead { identifier } => Ok(Expr::Symbol(identifier.to_string())),
        Operator::Neg => {
            let children = node.children();
            match children {
                [inner] => Ok(Expr::Neg(Box::new(build_ast(inner)?))),
                _ => Err(ConvertError::UnsupportedOperator(format!(
                    "negation with {} operands",
                    children.len()
                ))),
            }
        }
        Operator::FunctionIdentifier { identifier } => {
            let name = identifier.strip_prefix("math::").unwrap_or(identifier.as_str());
            let build: fn(Expr) -> Expr = match name {
                "abs" => Expr::abs,
                "sign" | "signum" => Expr::sign,
                "exp" => Expr::exp,
                "ln" | "log" => Expr::ln,
                "sqrt" => Expr::sqrt,
                "sin" => Expr::sin,
                "cos" => Expr::cos,
                "tan" => Expr::tan,
                _ => return Err(ConvertError::UnsupportedFunction(identifier.to_string())),
            };
            let argument = single_argument(node, name)?;
            Ok(build(build_ast(argument)?))
        }
        Operator::RootNode => {
            let children = node.children();
            match children {
                [inner] => build_ast(inner),
                _ => Err(ConvertError::RootNode(format!("{} children", children.len()))),
            }
        }
        // Exponentiation picks the narrowest power node the exponent allows
        Operator::Exp => {
            let (base, exponent) = binary(node, "^")?;
            Ok(match exponent.simplify() {
                Expr::Const(c) if c.fract() == 0.0 && c.abs() <= i32::MAX as f64 => {
                    Expr::Pow(Box::new(base), c as i64)
                }
                Expr::Const(c) => Expr::PowFloat(Box::new(base), c),
                _ => Expr::PowExpr(Box::new(base), Box::new(exponent)),
            })
        }
        other => Err(ConvertError::UnsupportedOperator(format!("{other:?}"))),
    }
}

fn binary(node: &Node, symbol: &str) -> Result<(Expr, Expr), ConvertError> {
    match node.children() {
        [left, right] => Ok((build_ast(left)?, build_ast(right)?)),
        children if symbol == "^" => Err(ConvertError::ExpOperator(format!(
            "expected 2 operands, got {}",
            children.len()
        ))),
        children => Err(ConvertError::UnsupportedOperator(format!(
            "{symbol} with {} operands",
            children.len()
        ))),
    }
}

/// Returns the single argument of a unary function call.
///
/// evalexpr passes several arguments as one tuple child, wrapped in the root node of
/// the call's parentheses.
fn single_argument<'a>(node: &'a Node, name: &str) -> Result<&'a Node, ConvertError> {
    match node.children() {
        [argument] => {
            let inner = match (argument.operator(), argument.children()) {
                (Operator::RootNode, [only]) => only,
                _ => argument,
            };
            match inner.operator() {
                Operator::Tuple => Err(ConvertError::Arity {
                    name: name.to_string(),
                    expected: 1,
                    got: inner.children().len(),
                }),
                _ => Ok(argument),
            }
        }
        children => Err(ConvertError::Arity {
            name: name.to_string(),
            expected: 1,
            got: children.len(),
        }),
    }
}

/// Extracts variables from an expression tree and assigns them indices.
///
/// Variables are numbered in alphabetical order.
pub fn extract_symbols(node: &Node) -> HashMap<String, u32> {
    let mut symbols = BTreeSet::new();
    extract_symbols_from_node(node, &mut symbols);

    symbols
        .into_iter()
        .enumerate()
        .map(|(i, v)| (v, i as u32))
        .collect()
}

/// Extracts and sorts all unique variables from a collection of formulas.
///
/// # Errors
/// Returns `LambdifyError::Parse` if any formula cannot be parsed.
///
/// # Example
/// ```
/// # use lambdify_jit::convert::extract_all_symbols;
/// let formulas = vec!["2*x + y".to_string(), "z + x^2".to_string()];
/// let variables = extract_all_symbols(&formulas).unwrap();
/// assert_eq!(variables, vec!["x".to_string(), "y".to_string(), "z".to_string()]);
/// ```
pub fn extract_all_symbols(formulas: &[String]) -> Result<Vec<String>, LambdifyError> {
    let mut all_symbols = BTreeSet::new();
    for formula in formulas {
        let tree: Node = build_operator_tree(formula)?;
        extract_symbols_from_node(&tree, &mut all_symbols);
    }
    Ok(all_symbols.into_iter().collect())
}

fn extract_symbols_from_node(node: &Node, symbols: &mut BTreeSet<String>) {
    match node.operator() {
        Operator::VariableIdentifierRead { identifier } => {
            symbols.insert(identifier.to_string());
        }
        _ => {
            for child in node.children() {
                extract_symbols_from_node(child, symbols);
            }
        }
    }
}
