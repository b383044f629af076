//! Array-oriented interpreter for lowered programs.
//!
//! Where the JIT backend runs the whole program once per point, the interpreter runs
//! each op once per chunk: the value stack holds columns instead of scalars and every op
//! is a tight loop over a chunk of points. The dispatch cost is paid once per op and
//! chunk, which keeps the interpreter within a small factor of compiled code for large
//! arrays without any compilation step.

use std::ops::Range;

use crate::lower::{LinearOp, Program};

/// Evaluates `program` for the points `range` of `columns`, writing into `out`.
///
/// `columns[i]` holds the values of input `i`. `out` must be exactly `range.len()` long
/// and every column read by the program must cover `range`.
pub fn eval_chunk(program: &Program, columns: &[&[f64]], range: Range<usize>, out: &mut [f64]) {
    debug_assert_eq!(out.len(), range.len());

    if let Some(c) = program.constant_result {
        out.fill(c);
        return;
    }

    let n = range.len();
    let mut stack: Vec<Vec<f64>> = Vec::with_capacity(program.max_stack_depth());
    // Buffers of consumed operands are recycled instead of reallocated
    let mut pool: Vec<Vec<f64>> = Vec::new();
    let take = |pool: &mut Vec<Vec<f64>>| pool.pop().unwrap_or_else(|| Vec::with_capacity(n));

    for op in &program.ops {
        match op {
            LinearOp::LoadConst(c) => {
                let mut buf = take(&mut pool);
                buf.clear();
                buf.resize(n, *c);
                stack.push(buf);
            }
            LinearOp::LoadVar(index) => {
                let mut buf = take(&mut pool);
                buf.clear();
                buf.extend_from_slice(&columns[*index as usize][range.clone()]);
                stack.push(buf);
            }
            _ => match op.arity() {
                1 => {
                    if let Some(x) = stack.last_mut() {
                        for v in x.iter_mut() {
                            *v = op.apply1(*v);
                        }
                    }
                }
                2 => {
                    let (Some(r), Some(l)) = (stack.pop(), stack.last_mut()) else {
                        out.fill(f64::NAN);
                        return;
                    };
                    for (a, b) in l.iter_mut().zip(&r) {
                        *a = op.apply2(*a, *b);
                    }
                    pool.push(r);
                }
                _ => {
                    let (Some(c), Some(b), Some(a)) = (stack.pop(), stack.pop(), stack.last_mut())
                    else {
                        out.fill(f64::NAN);
                        return;
                    };
                    for ((x, y), z) in a.iter_mut().zip(&b).zip(&c) {
                        *x = op.apply3(*x, *y, *z);
                    }
                    pool.push(b);
                    pool.push(c);
                }
            },
        }
    }

    match stack.pop() {
        Some(result) => out.copy_from_slice(&result),
        None => out.fill(f64::NAN),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::parse;
    use crate::lower::lower;
    use crate::opt::optimize;
    use std::collections::HashMap;

    fn program(text: &str, vars: &[&str]) -> Program {
        let var_map: HashMap<String, u32> = vars
            .iter()
            .enumerate()
            .map(|(i, v)| (v.to_string(), i as u32))
            .collect();
        lower(&parse(text).unwrap(), &var_map).unwrap()
    }

    #[test]
    fn test_matches_pointwise() {
        let p = optimize(program("x*y + sin(x) - y^3/(1 + abs(x)) + 2^x", &["x", "y"]));
        let xs: Vec<f64> = (0..50).map(|i| i as f64 * 0.1 - 2.0).collect();
        let ys: Vec<f64> = (0..50).map(|i| (i as f64).sqrt()).collect();
        let mut out = vec![0.0; 50];
        eval_chunk(&p, &[&xs, &ys], 0..50, &mut out);
        for i in 0..50 {
            let expected = p.eval(&[xs[i], ys[i]]);
            assert!((out[i] - expected).abs() < 1e-12, "point {i}");
        }
    }

    #[test]
    fn test_sub_range() {
        let p = program("x - y", &["x", "y"]);
        let xs = [1.0, 2.0, 3.0, 4.0];
        let ys = [0.5, 0.5, 0.5, 0.5];
        let mut out = vec![0.0; 2];
        eval_chunk(&p, &[&xs, &ys], 1..3, &mut out);
        assert_eq!(out, vec![1.5, 2.5]);
    }

    #[test]
    fn test_constant_and_empty() {
        let p = program("1 + 2", &["x"]);
        let mut out = vec![0.0; 3];
        eval_chunk(&p, &[&[0.0, 0.0, 0.0]], 0..3, &mut out);
        assert_eq!(out, vec![3.0; 3]);

        let p = program("x", &["x"]);
        let mut out: Vec<f64> = Vec::new();
        eval_chunk(&p, &[&[]], 0..0, &mut out);
        assert!(out.is_empty());
    }
}
