//! Benchmarks for the scheduler.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use vmspawn::config::SchedulerConfig;
use vmspawn::testing::{generate_data_graph, run_data_graph};

fn scheduler_benchmark(c: &mut Criterion) {
    let small = Arc::new(generate_data_graph(1, 5, 5, 2));
    c.bench_function("dag_5_spawns_5_writes", |b| {
        b.iter(|| black_box(run_data_graph(Arc::clone(&small), SchedulerConfig::new(), None, None)))
    });

    let wide = Arc::new(generate_data_graph(2, 12, 20, 4));
    let config = SchedulerConfig::new().with_pipe_capacity(128).with_max_depth(16);
    c.bench_function("dag_12_spawns_20_writes_small_pipes", |b| {
        b.iter(|| black_box(run_data_graph(Arc::clone(&wide), config.clone(), None, None)))
    });
}

criterion_group!(benches, scheduler_benchmark);
criterion_main!(benches);
