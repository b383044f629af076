//! Benchmarks for compiled expression kernels
//!
//! Compares hand-written Rust, the Cranelift JIT backend and the array interpreter on
//! single points and on column data, and measures how long building a model takes.

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use lambdify_jit::prelude::*;

/// Expressions shared by all benchmark groups, together with a direct Rust version.
struct Case {
    name: &'static str,
    source: &'static str,
    direct: fn(&[f64]) -> f64,
}

// Variables are sorted alphabetically, so `a`, `b` and `c` map to indices 0, 1 and 2.
const CASES: &[Case] = &[
    Case {
        name: "linear",
        source: "2.2 * a + 1.1",
        direct: |v| 2.2 * v[0] + 1.1,
    },
    Case {
        name: "polynomial",
        source: "(a^3 + 2*a^2 - 5*a + 1) / (b^2 + 3*b + 2)",
        direct: |v| {
            let (a, b) = (v[0], v[1]);
            (a.powi(3) + 2.0 * a.powi(2) - 5.0 * a + 1.0) / (b.powi(2) + 3.0 * b + 2.0)
        },
    },
    Case {
        name: "nested",
        source: "((a + b) * (a - b)) / ((c + 1) * (c - 1))",
        direct: |v| ((v[0] + v[1]) * (v[0] - v[1])) / ((v[2] + 1.0) * (v[2] - 1.0)),
    },
    Case {
        name: "transcendental",
        source: "exp(-a^2 / b) * sin(c) + ln(b) * cos(a)",
        direct: |v| (-v[0].powi(2) / v[1]).exp() * v[2].sin() + v[1].ln() * v[0].cos(),
    },
    Case {
        name: "very_complex",
        source: "(a^3 + b^2*c - 2*a*b + c) / ((a+b)*(b+c)*(a+c) + 1) + sqrt(a*b*c) - sqrt((a+b+c)^3)",
        direct: |v| {
            let (a, b, c) = (v[0], v[1], v[2]);
            (a.powi(3) + b.powi(2) * c - 2.0 * a * b + c) / ((a + b) * (b + c) * (a + c) + 1.0)
                + (a * b * c).sqrt()
                - (a + b + c).powi(3).sqrt()
        },
    },
];

const POINT: [f64; 3] = [2.5, 1.8, 0.7];

fn model(source: &str, backend: Backend) -> Model {
    let options = LambdifyOptions::default()
        .with_backend(backend)
        .with_derivative_order(0);
    Model::builder(source)
        .options(options)
        .build()
        .expect("benchmark expression must compile")
}

fn benchmark_point_evaluation(c: &mut Criterion) {
    let mut group = c.benchmark_group("Point Evaluation");

    for case in CASES {
        let jit = model(case.source, Backend::Jit);
        let interpreter = model(case.source, Backend::Interpreter);
        let inputs = &POINT[..jit.kernel().n_inputs()];

        group.bench_with_input(BenchmarkId::new("Direct", case.name), inputs, |b, inputs| {
            b.iter(|| black_box((case.direct)(black_box(inputs))))
        });
        group.bench_with_input(BenchmarkId::new("JIT", case.name), inputs, |b, inputs| {
            b.iter(|| black_box(jit.kernel().eval_point(black_box(inputs))))
        });
        group.bench_with_input(
            BenchmarkId::new("Interpreter", case.name),
            inputs,
            |b, inputs| b.iter(|| black_box(interpreter.kernel().eval_point(black_box(inputs)))),
        );
    }

    group.finish();
}

fn benchmark_column_evaluation(c: &mut Criterion) {
    let mut group = c.benchmark_group("Column Evaluation");
    let case = &CASES[CASES.len() - 1];

    for n_points in [1_000usize, 100_000] {
        let columns: Vec<Vec<f64>> = POINT
            .iter()
            .map(|base| (0..n_points).map(|i| base + i as f64 * 1e-5).collect())
            .collect();
        let views: Vec<&[f64]> = columns.iter().map(Vec::as_slice).collect();
        let mut out = vec![0.0; n_points];

        group.throughput(Throughput::Elements(n_points as u64));

        group.bench_function(BenchmarkId::new("Direct", n_points), |b| {
            b.iter(|| {
                for (i, slot) in out.iter_mut().enumerate() {
                    *slot = (case.direct)(&[views[0][i], views[1][i], views[2][i]]);
                }
                black_box(&out);
            })
        });

        for (label, backend) in [("JIT", Backend::Jit), ("Interpreter", Backend::Interpreter)] {
            let compiled = model(case.source, backend);
            group.bench_function(BenchmarkId::new(label, n_points), |b| {
                b.iter(|| {
                    compiled
                        .eval_columns(black_box(&views), &mut out)
                        .expect("columns match the model");
                    black_box(&out);
                })
            });
        }
    }

    group.finish();
}

fn benchmark_compilation_time(c: &mut Criterion) {
    let mut group = c.benchmark_group("Compilation Time");

    for case in CASES {
        for (label, backend) in [("JIT", Backend::Jit), ("Interpreter", Backend::Interpreter)] {
            group.bench_with_input(BenchmarkId::new(label, case.name), case.source, |b, source| {
                b.iter(|| black_box(model(source, backend)))
            });
        }
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_point_evaluation,
    benchmark_column_evaluation,
    benchmark_compilation_time
);
criterion_main!(benches);
