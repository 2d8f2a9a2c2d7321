//! Benchmarks for stage graph planning.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use medallion::pipeline::{StageDefinition, StageGraph, StageGraphBuilder};

/// `width` bronze stages, one silver per bronze, and a single gold over all
/// silver stages.
fn wide_graph(width: usize) -> StageGraph {
    let mut builder = StageGraphBuilder::new("wide");
    for i in 0..width {
        builder = builder
            .stage(StageDefinition::bronze(format!("raw_{i}")))
            .stage(StageDefinition::silver(format!("clean_{i}")).depends_on(format!("raw_{i}")));
    }
    let gold = (0..width).fold(StageDefinition::gold("report"), |stage, i| {
        stage.depends_on(format!("clean_{i}"))
    });
    builder.stage(gold).build().expect("wide graph is valid")
}

fn graph_benchmark(c: &mut Criterion) {
    let graph = wide_graph(500);

    c.bench_function("topological_order_all", |b| {
        b.iter(|| graph.topological_order(black_box("all")))
    });

    c.bench_function("plan_dependencies", |b| {
        let order = graph.topological_order("all").expect("plan");
        b.iter(|| graph.plan_dependencies(black_box(&order)))
    });

    c.bench_function("build_wide_graph", |b| b.iter(|| wide_graph(black_box(100))));
}

criterion_group!(benches, graph_benchmark);
criterion_main!(benches);
