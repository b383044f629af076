//! Rust source printer.
//!
//! Turns a graph into Rust source that can be pasted into another crate, for when a
//! formula should be compiled ahead of time instead of JIT-compiled at run time. The
//! printed function evaluates the formula element-wise over one slice per variable.

use std::collections::{HashMap, HashSet};
use std::fmt::Write;

use crate::expr::Expr;

/// Prints `expr` as a single Rust expression in `f64` method syntax.
///
/// Symbols are printed as identifiers, so the expression is valid wherever `f64`
/// bindings with those names are in scope. Names that are not valid identifiers are
/// sanitised, keywords are printed as raw identifiers and names that would collide
/// after sanitising get a numeric suffix.
///
/// # Example
/// ```
/// # use lambdify_jit::convert::parse;
/// # use lambdify_jit::printer::to_rust_expr;
/// let expr = parse("x^2 + sqrt(y)").unwrap();
/// assert_eq!(to_rust_expr(&expr), "(x.powi(2) + y.sqrt())");
/// ```
pub fn to_rust_expr(expr: &Expr) -> String {
    let mut printer = Printer {
        symbols: unique_identifiers(expr.free_symbols().iter().map(String::as_str)),
        ..Printer::default()
    };
    printer.render(expr)
}

/// Prints a function `fn_name(v1: &[f64], ..., out: &mut [f64])` computing
/// `out[i] = expr(v1[i], ...)` for every point.
///
/// Sub-expressions that occur more than once are computed once per point and bound
/// to `__cseN` locals. Generated locals start with two underscores; symbol identifiers
/// never do.
///
/// # Example
/// ```
/// # use lambdify_jit::convert::parse;
/// # use lambdify_jit::printer::to_rust_source;
/// let expr = parse("exp(x*y) + x*y").unwrap();
/// let source = to_rust_source(&expr, "f", &["x", "y"]);
/// assert!(source.contains("pub fn f(x: &[f64], y: &[f64], __out: &mut [f64])"));
/// assert!(source.contains("let __cse0 = (x * y);"));
/// ```
pub fn to_rust_source<S: AsRef<str>>(expr: &Expr, fn_name: &str, variables: &[S]) -> String {
    let mut counts = HashMap::new();
    count_subtrees(expr, &mut counts);

    // Variables claim their identifiers first, unlisted symbols after them
    let free = expr.free_symbols();
    let listed: Vec<&str> = variables.iter().map(AsRef::as_ref).collect();
    let ordered = listed.iter().copied().chain(
        free.iter()
            .map(String::as_str)
            .filter(|name| !listed.contains(name)),
    );
    let mut printer = Printer {
        counts,
        symbols: unique_identifiers(ordered),
        ..Printer::default()
    };
    let result = printer.render(expr);

    let mut seen = HashSet::new();
    let names: Vec<&String> = listed
        .iter()
        .filter(|name| seen.insert(**name))
        .filter_map(|name| printer.symbols.get(*name))
        .collect();
    let params = names
        .iter()
        .map(|name| format!("{name}: &[f64], "))
        .collect::<String>();

    let mut source = String::new();
    // Writing to a String cannot fail
    let _ = writeln!(source, "#[allow(unused_variables, non_snake_case, clippy::all)]");
    let _ = writeln!(source, "pub fn {}({params}__out: &mut [f64]) {{", identifier(fn_name));
    let _ = writeln!(source, "    for __i in 0..__out.len() {{");
    for name in &names {
        let _ = writeln!(source, "        let {name} = {name}[__i];");
    }
    for binding in &printer.bindings {
        let _ = writeln!(source, "        {binding}");
    }
    let _ = writeln!(source, "        __out[__i] = {result};");
    let _ = writeln!(source, "    }}");
    let _ = writeln!(source, "}}");
    source
}

/// Counts the occurrences of every compound subtree, keyed by its printed form.
/// The children of a repeated subtree are only counted for its first occurrence.
fn count_subtrees(expr: &Expr, counts: &mut HashMap<String, usize>) {
    if matches!(expr, Expr::Const(_) | Expr::Symbol(_)) {
        return;
    }
    let count = counts.entry(expr.to_string()).or_insert(0);
    *count += 1;
    if *count == 1 {
        for child in expr.children() {
            count_subtrees(child, counts);
        }
    }
}

#[derive(Default)]
struct Printer {
    /// Symbol name to printed identifier
    symbols: HashMap<String, String>,
    counts: HashMap<String, usize>,
    hoisted: HashMap<String, String>,
    bindings: Vec<String>,
}

impl Printer {
    fn render(&mut self, expr: &Expr) -> String {
        match expr {
            Expr::Const(value) => return literal(*value),
            Expr::Symbol(name) => return self.symbol(name),
            _ => {}
        }

        let key = expr.to_string();
        if let Some(name) = self.hoisted.get(&key) {
            return name.clone();
        }

        let code = self.render_node(expr);
        if self.counts.get(&key).copied().unwrap_or(0) > 1 {
            let name = format!("__cse{}", self.bindings.len());
            self.bindings.push(format!("let {name} = {code};"));
            self.hoisted.insert(key, name.clone());
            name
        } else {
            code
        }
    }

    fn symbol(&self, name: &str) -> String {
        self.symbols
            .get(name)
            .cloned()
            .unwrap_or_else(|| identifier(name))
    }

    fn render_node(&mut self, expr: &Expr) -> String {
        match expr {
            Expr::Const(value) => literal(*value),
            Expr::Symbol(name) => self.symbol(name),
            Expr::Add(terms) => self.join(terms, " + ", "0.0_f64"),
            Expr::Mul(factors) => self.join(factors, " * ", "1.0_f64"),
            Expr::Sub(left, right) => format!("({} - {})", self.render(left), self.render(right)),
            Expr::Div(left, right) => format!("({} / {})", self.render(left), self.render(right)),
            Expr::Pow(base, exp) => match i32::try_from(*exp) {
                Ok(exp) => format!("{}.powi({exp})", self.render(base)),
                Err(_) => format!("{}.powf({})", self.render(base), literal(*exp as f64)),
            },
            Expr::PowFloat(base, exp) => format!("{}.powf({})", self.render(base), literal(*exp)),
            Expr::PowExpr(base, exponent) => {
                format!("{}.powf({})", self.render(base), self.render(exponent))
            }
            Expr::Neg(inner) => format!("(-{})", self.render(inner)),
            Expr::Abs(inner) => format!("{}.abs()", self.render(inner)),
            Expr::Sign(inner) => format!(
                "({{ let __s: f64 = {}; \
                 if __s > 0.0 {{ 1.0 }} else if __s < 0.0 {{ -1.0 }} else {{ __s * 0.0 }} }})",
                self.render(inner)
            ),
            Expr::Exp(inner) => format!("{}.exp()", self.render(inner)),
            Expr::Ln(inner) => format!("{}.ln()", self.render(inner)),
            Expr::Sqrt(inner) => format!("{}.sqrt()", self.render(inner)),
            Expr::Sin(inner) => format!("{}.sin()", self.render(inner)),
            Expr::Cos(inner) => format!("{}.cos()", self.render(inner)),
            Expr::Tan(inner) => format!("{}.tan()", self.render(inner)),
        }
    }

    fn join(&mut self, items: &[Expr], sep: &str, empty: &str) -> String {
        if items.is_empty() {
            return empty.to_string();
        }
        let parts: Vec<String> = items.iter().map(|item| self.render(item)).collect();
        format!("({})", parts.join(sep))
    }
}

/// A float literal that is valid as a method receiver.
fn literal(value: f64) -> String {
    if value.is_nan() {
        "f64::NAN".to_string()
    } else if value == f64::INFINITY {
        "f64::INFINITY".to_string()
    } else if value == f64::NEG_INFINITY {
        "f64::NEG_INFINITY".to_string()
    } else if value.is_sign_negative() {
        format!("({value:?}_f64)")
    } else {
        format!("{value:?}_f64")
    }
}

const KEYWORDS: &[&str] = &[
    "abstract", "as", "async", "await", "become", "box", "break", "const", "continue", "do",
    "dyn", "else", "enum", "extern", "false", "final", "fn", "for", "gen", "if", "impl", "in",
    "let", "loop", "macro", "match", "mod", "move", "mut", "override", "priv", "pub", "ref",
    "return", "static", "struct", "trait", "true", "try", "type", "typeof", "unsafe",
    "unsized", "use", "virtual", "where", "while", "yield",
];

/// Maps a symbol name onto a Rust identifier that never starts with `__`.
fn identifier(name: &str) -> String {
    let mut ident: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if ident.is_empty() || ident.starts_with(|c: char| c.is_ascii_digit()) {
        ident.insert(0, '_');
    }
    if ident.starts_with("__") || ident == "_" {
        ident.insert(0, 'v');
    }
    match ident.as_str() {
        // Keywords that cannot be raw identifiers
        "self" | "Self" | "super" | "crate" => ident + "_",
        kw if KEYWORDS.contains(&kw) => format!("r#{ident}"),
        _ => ident,
    }
}

/// Assigns every name an identifier, suffixing `_1`, `_2`, ... on collisions. Earlier
/// names keep the plain form.
fn unique_identifiers<'a>(names: impl Iterator<Item = &'a str>) -> HashMap<String, String> {
    let mut symbols = HashMap::new();
    let mut used = HashSet::new();
    for name in names {
        if symbols.contains_key(name) {
            continue;
        }
        let base = identifier(name);
        let mut candidate = base.clone();
        let mut suffix = 1;
        while !used.insert(candidate.trim_start_matches("r#").to_string()) {
            candidate = format!("{base}_{suffix}");
            suffix += 1;
        }
        symbols.insert(name.to_string(), candidate);
    }
    symbols
}
