//! Substitution engine.
//!
//! Substitution fixes some symbols of a graph, typically the parameters of a model, and
//! collapses whatever became constant. All replacement happens in one pass over the
//! original tree, so replacements are never themselves substituted again:
//! substituting `x -> y` and `y -> x` swaps the two symbols.

use std::collections::BTreeMap;

use crate::expr::{fold, Expr};

/// An ordered mapping from symbol names to replacement graphs.
///
/// # Example
/// ```
/// # use lambdify_jit::expr::Expr;
/// # use lambdify_jit::substitute::Substitution;
/// let subs = Substitution::new()
///     .with("m", 2.0)
///     .with("v", Expr::symbol("t") * 9.81);
/// let kinetic = (0.5 * Expr::symbol("m") * Expr::symbol("v").powi(2)).substitute(&subs);
/// assert!(!kinetic.contains_symbol("m"));
/// assert!(kinetic.contains_symbol("t"));
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Substitution {
    entries: BTreeMap<String, Expr>,
}

impl Substitution {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces the entry for `name`.
    pub fn with(mut self, name: impl Into<String>, replacement: impl Into<Expr>) -> Self {
        self.insert(name, replacement);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, replacement: impl Into<Expr>) {
        self.entries.insert(name.into(), replacement.into());
    }

    pub fn get(&self, name: &str) -> Option<&Expr> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Symbol names in alphabetical order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Expr)> {
        self.entries.iter().map(|(name, expr)| (name.as_str(), expr))
    }

    /// Adds every entry of `other`, which wins on conflicts.
    pub fn merge(&mut self, other: &Substitution) {
        for (name, expr) in other.iter() {
            self.insert(name, expr.clone());
        }
    }
}

impl<S: Into<String>> FromIterator<(S, f64)> for Substitution {
    fn from_iter<I: IntoIterator<Item = (S, f64)>>(iter: I) -> Self {
        let mut subs = Substitution::new();
        for (name, value) in iter {
            subs.insert(name, value);
        }
        subs
    }
}

impl<S: Into<String>, const N: usize> From<[(S, f64); N]> for Substitution {
    fn from(pairs: [(S, f64); N]) -> Self {
        pairs.into_iter().collect()
    }
}

impl Expr {
    /// Replaces every symbol named in `subs` simultaneously, then folds constant subtrees.
    ///
    /// Symbols absent from `subs` are left alone and entries naming symbols that do not
    /// occur are ignored.
    pub fn substitute(&self, subs: &Substitution) -> Expr {
        self.insert(
            |node| matches!(node, Expr::Symbol(name) if subs.contains(name)),
            |node| match node {
                Expr::Symbol(name) => subs.get(name).cloned().unwrap_or_else(|| node.clone()),
                other => other.clone(),
            },
        )
        .fold_constants()
    }

    /// Replaces every node matching `predicate` with `replacement(node)`.
    ///
    /// Matching is top-down: once a node is replaced its subtree is not visited, and the
    /// replacement itself is not searched again.
    pub fn insert<P, R>(&self, predicate: P, replacement: R) -> Expr
    where
        P: Fn(&Expr) -> bool,
        R: Fn(&Expr) -> Expr,
    {
        self.insert_with(&predicate, &replacement)
    }

    fn insert_with(
        &self,
        predicate: &dyn Fn(&Expr) -> bool,
        replacement: &dyn Fn(&Expr) -> Expr,
    ) -> Expr {
        if predicate(self) {
            return replacement(self);
        }
        self.map_children(|child| child.insert_with(predicate, replacement))
    }

    /// Replaces every occurrence of the sub-graph `from` with `to`.
    pub fn xreplace(&self, from: &Expr, to: &Expr) -> Expr {
        self.insert(|node| node == from, |_| to.clone())
    }

    /// Evaluates every constant-only subtree bottom-up.
    ///
    /// Unlike [`Expr::simplify`] no algebraic rule is applied, so the shape of the
    /// non-constant part of the graph is preserved. Subtrees whose value would not be
    /// finite stay as written.
    pub fn fold_constants(&self) -> Expr {
        match self {
            Expr::Const(_) | Expr::Symbol(_) => self.clone(),
            _ => {
                let folded = self.map_children(Expr::fold_constants);
                if !folded.children().into_iter().all(|c| c.as_const().is_some()) {
                    return folded;
                }
                let value = folded.eval(&Default::default()).ok();
                value.and_then(fold).unwrap_or(folded)
            }
        }
    }
}
