//! Lightweight peephole optimiser for lowered stack programs.
//!
//! Pass pipeline
//! -------------
//!  1. **fold_consts**  – constant propagation through every op whose operands
//!                        are all known at compile time.
//!  2. **fuse_fma**     – recognise `a*b+c`, `c+a*b` and `a*b-c` sequences and emit
//!                        the dedicated `Fma` / `Fmsub` opcode.
//!
//! The optimiser iterates the full pipeline until a fix-point is reached, so you
//! can call [`optimize`] once and get the fully cleaned program.
//!
//! Folding never produces a non-finite literal: `1/0` or `ln(-1)` stay as ops and
//! evaluate at run time exactly as the unoptimised program would.

use crate::dual::Scalar;
use crate::lower::{LinearOp, Program};

/// Run all optimisation passes until nothing changes.
pub fn optimize(program: Program) -> Program {
    if program.constant_result.is_some() {
        return program;
    }

    let mut ops = program.ops;
    loop {
        let len_before = ops.len();
        ops = fold_consts(ops);
        ops = fuse_fma(ops);
        if ops.len() == len_before {
            break;
        }
    }

    let constant_result = match ops.as_slice() {
        [LinearOp::LoadConst(c)] => Some(*c),
        _ => None,
    };
    tracing::trace!(ops = ops.len(), "optimised program");

    Program {
        ops,
        constant_result,
        ..program
    }
}

// ────────────────────────────────────────────────────────────────────────────
//  Pass 1 – constant folding
// ────────────────────────────────────────────────────────────────────────────
fn fold_consts(ops: Vec<LinearOp>) -> Vec<LinearOp> {
    use LinearOp::*;

    // The walk mirrors the program's effect on an auxiliary stack that stores
    // `Some(value)` for compile-time constants. The top of that stack is always
    // produced by the last op in `out`, so folding an op with k constant operands
    // means dropping the last k loads.
    let mut out: Vec<LinearOp> = Vec::with_capacity(ops.len());
    let mut cstk: Vec<Option<f64>> = Vec::with_capacity(8);

    for op in ops {
        let arity = op.arity();
        if arity == 0 {
            cstk.push(match op {
                LoadConst(c) => Some(c),
                _ => None,
            });
            out.push(op);
            continue;
        }

        if cstk.len() < arity {
            // Malformed input; leave the rest untouched for validation to report
            out.push(op);
            cstk.clear();
            continue;
        }
        let operands: Vec<Option<f64>> = cstk.split_off(cstk.len() - arity);
        let folded = match operands.as_slice() {
            [Some(x)] => Some(op.apply1(*x)),
            [Some(l), Some(r)] => Some(op.apply2(*l, *r)),
            [Some(a), Some(b), Some(c)] => Some(op.apply3(*a, *b, *c)),
            _ => None,
        };

        match folded {
            Some(value) if value.is_finite() => {
                out.truncate(out.len() - arity);
                out.push(LoadConst(value));
                cstk.push(Some(value));
            }
            _ => {
                out.push(op);
                cstk.push(None);
            }
        }
    }
    out
}

// ────────────────────────────────────────────────────────────────────────────
//  Pass 2 – FMA / FMSUB fusion (pattern length = 5 ops)
// ────────────────────────────────────────────────────────────────────────────
fn is_load(op: &LinearOp) -> bool {
    matches!(op, LinearOp::LoadVar(_) | LinearOp::LoadConst(_))
}

fn fuse_fma(ops: Vec<LinearOp>) -> Vec<LinearOp> {
    use LinearOp::*;
    let mut out = Vec::with_capacity(ops.len());
    let mut i = 0;

    while i < ops.len() {
        if let Some(window) = ops.get(i..i + 5) {
            match window {
                // a*b + c  and  a*b - c
                [a, b, Mul, c, tail @ (Add | Sub)] if is_load(a) && is_load(b) && is_load(c) => {
                    out.extend([a.clone(), b.clone(), c.clone()]);
                    out.push(if matches!(tail, Add) { Fma } else { Fmsub });
                    i += 5;
                    continue;
                }
                // c + a*b  (loads have no side effects, so they can be reordered)
                [c, a, b, Mul, Add] if is_load(a) && is_load(b) && is_load(c) => {
                    out.extend([a.clone(), b.clone(), c.clone()]);
                    out.push(Fma);
                    i += 5;
                    continue;
                }
                _ => {}
            }
        }
        out.push(ops[i].clone());
        i += 1;
    }
    out
}
