//! Graph construction and run-driver benchmarks.
//!
//! `build_chain` measures resolution, binding checks and topological sorting
//! alone. `run_fan_out` measures scheduling overhead with a zero-work body.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use std::sync::Arc;
use thought_orchestrator::config::EngineConfig;
use thought_orchestrator::graph::{self, Binding, NodeSpec, WorkflowSpec};
use thought_orchestrator::sandbox::{EchoExecutor, ExecutionOutput, FnExecutor};
use thought_orchestrator::thought::{CapabilityPolicy, Schema, ValueType};
use thought_orchestrator::{Engine, Origin, RawDefinition, ThoughtRegistry};
use tokio::runtime::Runtime;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn step() -> RawDefinition {
    RawDefinition::new("step", "step")
        .with_inputs(Schema::new().with_field("n", ValueType::Integer))
        .with_outputs(Schema::new().with_field("n", ValueType::Integer))
}

fn chain(len: usize) -> WorkflowSpec {
    let mut spec = WorkflowSpec::new("chain");
    for i in 0..len {
        let binding = if i == 0 {
            Binding::literal(0)
        } else {
            Binding::output(format!("s{}", i - 1), "n")
        };
        spec = spec.node(NodeSpec::new(format!("s{i}"), "step").input("n", binding));
    }
    spec
}

fn fan_out(width: usize) -> WorkflowSpec {
    let mut spec = WorkflowSpec::new("fan-out").node(NodeSpec::new("root", "noop"));
    for i in 0..width {
        spec = spec.node(NodeSpec::new(format!("leaf{i}"), "noop").after("root"));
    }
    spec
}

// ---------------------------------------------------------------------------
// Bench: graph::build over a chain
// ---------------------------------------------------------------------------

fn bench_build_chain(c: &mut Criterion) {
    let registry = ThoughtRegistry::new(CapabilityPolicy::default());
    registry.register(step(), Origin::Registered).expect("bench: register");

    let mut group = c.benchmark_group("build_chain");
    for len in [10usize, 100, 1000] {
        let spec = chain(len);
        group.bench_with_input(BenchmarkId::new("nodes", len), &spec, |b, spec| {
            b.iter(|| {
                let graph = graph::build(black_box(spec), &registry).expect("bench: build");
                black_box(graph.len())
            })
        });
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Bench: full run of a fan-out workflow
// ---------------------------------------------------------------------------

fn bench_run_fan_out(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let executor = FnExecutor::new().with_handler("noop", |_| async { Ok(ExecutionOutput::value(json!({}))) });
    let engine = rt.block_on(async {
        let config = EngineConfig::default().with_worker_pool_size(8);
        let engine = Engine::new(config, Arc::new(executor)).expect("bench: engine");
        engine.define(RawDefinition::new("noop", "noop")).expect("bench: define");
        engine
    });

    let mut group = c.benchmark_group("run_fan_out");
    group.sample_size(20);
    for width in [10usize, 100] {
        let spec = fan_out(width);
        group.bench_with_input(BenchmarkId::new("leaves", width), &spec, |b, spec| {
            b.to_async(&rt).iter(|| async {
                let report = engine.submit(spec).expect("bench: submit").wait().await;
                black_box(report.status)
            })
        });
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Bench: echo body through the sandbox boundary
// ---------------------------------------------------------------------------

fn bench_echo_single_node(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let engine = rt.block_on(async {
        let engine = Engine::new(EngineConfig::default(), Arc::new(EchoExecutor)).expect("bench: engine");
        engine
            .define(RawDefinition::new("echo", "echo").with_inputs(Schema::new().with_field("n", ValueType::Integer)))
            .expect("bench: define");
        engine
    });
    let spec = WorkflowSpec::new("echo").node(NodeSpec::new("e", "echo").input("n", Binding::literal(1)));

    c.bench_function("echo_single_node", |b| {
        b.to_async(&rt).iter(|| async {
            let report = engine.submit(&spec).expect("bench: submit").wait().await;
            black_box(report.status)
        })
    });
}

criterion_group!(benches, bench_build_chain, bench_run_fan_out, bench_echo_single_node);
criterion_main!(benches);
