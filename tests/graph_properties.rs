//! Randomised checks over generated workflows: every dependency finishes
//! before its dependant starts, any back edge is reported as a cycle, and
//! required inputs only bind to outputs that are always produced.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use std::sync::Arc;
use thought_orchestrator::config::EngineConfig;
use thought_orchestrator::graph::{Binding, GraphError, NodeSpec, WorkflowSpec};
use thought_orchestrator::sandbox::{ExecutionOutput, FnExecutor};
use thought_orchestrator::scheduler::{Engine, RunStatus};
use thought_orchestrator::thought::{Schema, ValueType};
use thought_orchestrator::RawDefinition;

const GRAPHS: u64 = 20;

/// A random DAG: edges only run from lower to higher index.
fn random_dag(rng: &mut StdRng, size: usize) -> (WorkflowSpec, Vec<(usize, usize)>) {
    let mut spec = WorkflowSpec::new("random");
    let mut edges = Vec::new();
    for i in 0..size {
        let mut node = NodeSpec::new(format!("n{i}"), "record");
        for j in 0..i {
            if rng.gen_bool(0.25) {
                node = node.after(format!("n{j}"));
                edges.push((j, i));
            }
        }
        spec = spec.node(node);
    }
    (spec, edges)
}

#[tokio::test]
async fn test_random_dags_respect_dependencies() {
    let log: Arc<Mutex<Vec<(String, &'static str)>>> = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&log);
    let executor = FnExecutor::new().with_handler("record", move |ctx| {
        let log = Arc::clone(&recorder);
        async move {
            log.lock().push((ctx.node.as_str().to_string(), "start"));
            tokio::task::yield_now().await;
            log.lock().push((ctx.node.as_str().to_string(), "end"));
            Ok(ExecutionOutput::value(json!({})))
        }
    });
    let engine = Engine::new(EngineConfig::default(), Arc::new(executor)).expect("test: engine");
    engine.define(RawDefinition::new("record", "record")).expect("test: define");

    let mut rng = StdRng::seed_from_u64(0x7407);
    for _ in 0..GRAPHS {
        log.lock().clear();
        let size = rng.gen_range(1..=12);
        let (spec, edges) = random_dag(&mut rng, size);
        let report = engine.submit(&spec).expect("test: acyclic").wait().await;
        assert_eq!(report.status, RunStatus::Succeeded);

        let events = log.lock().clone();
        let at = |node: usize, what: &str| {
            let id = format!("n{node}");
            events
                .iter()
                .position(|(n, w)| *n == id && *w == what)
                .expect("test: node recorded")
        };
        for (from, to) in edges {
            assert!(
                at(from, "end") < at(to, "start"),
                "n{to} started before n{from} finished"
            );
        }
        assert_eq!(events.len(), size * 2);
    }
}

#[tokio::test]
async fn test_back_edge_is_always_a_cycle() {
    let engine = Engine::new(
        EngineConfig::default(),
        Arc::new(FnExecutor::new()),
    )
    .expect("test: engine");
    engine.define(RawDefinition::new("record", "record")).expect("test: define");

    let mut rng = StdRng::seed_from_u64(0xC7C1E);
    for _ in 0..GRAPHS {
        let size = rng.gen_range(2..=10);
        // A chain n0 -> n1 -> ... plus one edge from a later node back to an earlier one.
        let back_from = rng.gen_range(1..size);
        let back_to = rng.gen_range(0..back_from);
        let mut spec = WorkflowSpec::new("cyclic");
        for i in 0..size {
            let mut node = NodeSpec::new(format!("n{i}"), "record");
            if i > 0 {
                node = node.after(format!("n{}", i - 1));
            }
            if i == back_to {
                node = node.after(format!("n{back_from}"));
            }
            spec = spec.node(node);
        }
        match engine.submit(&spec) {
            Err(GraphError::CycleDetected { nodes }) => assert!(!nodes.is_empty()),
            other => panic!("expected a cycle, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_required_input_never_binds_to_optional_output() {
    let seen: Arc<Mutex<Vec<bool>>> = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&seen);
    let executor = FnExecutor::new()
        .with_handler("emit", |_| async { Ok(ExecutionOutput::value(json!({}))) })
        .with_handler("take", move |ctx| {
            let seen = Arc::clone(&recorder);
            async move {
                seen.lock().push(ctx.inputs.contains_key("v"));
                Ok(ExecutionOutput::value(json!({})))
            }
        });
    let engine = Engine::new(EngineConfig::default(), Arc::new(executor)).expect("test: engine");
    for (name, body, outputs, inputs) in [
        ("emit-required", "emit", Schema::new().with_field("v", ValueType::String), Schema::new()),
        ("emit-optional", "emit", Schema::new().with_optional("v", ValueType::String), Schema::new()),
        ("take-required", "take", Schema::new(), Schema::new().with_field("v", ValueType::String)),
        ("take-optional", "take", Schema::new(), Schema::new().with_optional("v", ValueType::String)),
    ] {
        engine
            .define(RawDefinition::new(name, body).with_inputs(inputs).with_outputs(outputs))
            .expect("test: define");
    }

    let mut rng = StdRng::seed_from_u64(0x0B7);
    for _ in 0..GRAPHS {
        let producer_required = rng.gen_bool(0.5);
        let consumer_required = rng.gen_bool(0.5);
        let producer = if producer_required { "emit-required" } else { "emit-optional" };
        let consumer = if consumer_required { "take-required" } else { "take-optional" };
        let spec = WorkflowSpec::new("pair")
            .node(NodeSpec::new("p", producer))
            .node(NodeSpec::new("c", consumer).input("v", Binding::output("p", "v")));

        match engine.submit(&spec) {
            Err(GraphError::SchemaMismatch { node, input, .. }) => {
                assert!(consumer_required && !producer_required);
                assert_eq!(node.as_str(), "c");
                assert_eq!(input, "v");
            }
            Ok(handle) => {
                assert!(!consumer_required || producer_required);
                seen.lock().clear();
                let report = handle.wait().await;
                // The producers emit nothing, so only an optional input may be bound here.
                if producer_required {
                    assert_eq!(report.status, RunStatus::Failed);
                    assert!(seen.lock().is_empty());
                } else {
                    assert_eq!(report.status, RunStatus::Succeeded);
                    assert_eq!(*seen.lock(), vec![false]);
                }
            }
            Err(other) => panic!("unexpected build error: {other:?}"),
        }
    }
}
