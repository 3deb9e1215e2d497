//! Benchmarks for graph construction and cache keying.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;

use stepgraph::cache::compute_cache_key;
use stepgraph::core::{Artifact, ArtifactKind};
use stepgraph::graph::{Graph, GraphBuilder};
use stepgraph::step::StepSpec;
use stepgraph::testing::EmitComponent;

/// A layered graph where every step consumes two steps of the previous layer.
fn layered(width: usize, depth: usize) -> Graph {
    let mut builder = GraphBuilder::new("layered");
    for layer in 0..depth {
        for i in 0..width {
            let mut step = StepSpec::new(format!("s{layer}_{i}"), Arc::new(EmitComponent::new()))
                .output("out", ArtifactKind::Dataset);
            if layer > 0 {
                let prev = layer - 1;
                step = step
                    .input("left", ArtifactKind::Dataset, format!("s{prev}_{i}"), "out")
                    .input("right", ArtifactKind::Dataset, format!("s{prev}_{}", (i + 1) % width), "out");
            }
            builder.add_step(step);
        }
    }
    match builder.build() {
        Ok(graph) => graph,
        Err(e) => panic!("benchmark graph is invalid: {e}"),
    }
}

fn graph_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("build");
    for (width, depth) in [(10, 10), (25, 40), (50, 100)] {
        group.bench_with_input(
            BenchmarkId::from_parameter(width * depth),
            &(width, depth),
            |b, &(w, d)| b.iter(|| black_box(layered(w, d))),
        );
    }
    group.finish();

    let graph = layered(50, 100);
    c.bench_function("topological_order_5000", |b| {
        b.iter(|| black_box(graph.topological_order().len()));
    });

    let step = StepSpec::new("keyed", Arc::new(EmitComponent::new()))
        .param("dimensions", serde_json::json!(50))
        .param("num_leaves", serde_json::json!(500));
    let input = Artifact::imported(ArtifactKind::Dataset, "gs://bucket/examples");
    c.bench_function("cache_key", |b| {
        b.iter(|| black_box(compute_cache_key(&step, &[("examples", Some(&input))])));
    });
}

criterion_group!(benches, graph_benchmark);
criterion_main!(benches);
