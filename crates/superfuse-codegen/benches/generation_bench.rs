//! Benchmark for fused kernel generation
//!
//! Measures the full pipeline on alternating vector/cube chains of increasing length, plus the
//! request parse on its own. Set `SUPERFUSE_TRACING_PROFILE` to run under the workspace
//! subscriber with stage timing.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::env;
use superfuse_codegen::{FusionGenerator, FusionRequest};
use superfuse_tracing::{init_global_tracing, TracingConfig};

fn install_tracing() {
    if env::var_os("SUPERFUSE_TRACING_PROFILE").is_none() {
        return;
    }
    if let Err(err) = init_global_tracing(&TracingConfig::from_env()) {
        eprintln!("tracing disabled: {err}");
    }
}

fn chain_request(len: usize, options: &str) -> String {
    let operators: Vec<String> = (0..len)
        .map(|i| {
            if i % 2 == 0 {
                format!(
                    r#"{{ "name": "add{i}", "kernel_type": "KERNEL_TYPE_AIV_ONLY", "block_dim": 40,
                         "params": ["x", "y"], "functions": {{ "vector": "add_kernel_{i}" }} }}"#
                )
            } else {
                format!(
                    r#"{{ "name": "mm{i}", "kernel_type": "KERNEL_TYPE_AIC_ONLY", "block_dim": 20,
                         "params": ["a", "b", "c"], "functions": {{ "cube": "mm_kernel_{i}" }} }}"#
                )
            }
        })
        .collect();
    format!(
        r#"{{ "kernel_name": "bench", "options": "{options}", "operators": [{}] }}"#,
        operators.join(",")
    )
}

fn benchmark_generation(c: &mut Criterion) {
    install_tracing();
    let generator = FusionGenerator::new();
    let mut group = c.benchmark_group("generate");
    for len in [2usize, 8, 32] {
        let request = FusionRequest::parse(&chain_request(len, "")).unwrap();
        group.bench_with_input(BenchmarkId::new("early_start", len), &request, |b, request| {
            b.iter(|| black_box(generator.generate(black_box(request)).unwrap()))
        });

        let request = FusionRequest::parse(&chain_request(len, "early-start=0")).unwrap();
        group.bench_with_input(BenchmarkId::new("barrier_only", len), &request, |b, request| {
            b.iter(|| black_box(generator.generate(black_box(request)).unwrap()))
        });
    }
    group.finish();
}

fn benchmark_parse(c: &mut Criterion) {
    let json = chain_request(32, "split-mode=2:profiling=1");
    c.bench_function("parse_request", |b| {
        b.iter(|| {
            let request = FusionRequest::parse(black_box(&json)).unwrap();
            black_box(request);
        })
    });
}

criterion_group!(benches, benchmark_generation, benchmark_parse);
criterion_main!(benches);
