//! Prometheus metrics for the thought engine.
//!
//! ## Usage
//!
//! Call [`init_metrics`] once at process startup. The helper functions
//! (`record_node_outcome`, `inc_approval`, …) are no-ops if `init_metrics`
//! was never called, so the engine always runs; observability simply
//! degrades.
//!
//! ## Metrics Exposed
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `thought_nodes_total` | Counter | `outcome` |
//! | `thought_node_duration_seconds` | Histogram | `thought` |
//! | `thought_approvals_total` | Counter | `decision` |
//! | `thought_approvals_pending` | Gauge | (none) |
//! | `thought_runs_total` | Counter | `status` |
//! | `thought_commits_total` | Counter | `origin` |

use crate::EngineError;
use prometheus::{
    core::Collector, CounterVec, Encoder, HistogramOpts, HistogramVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

// ── Internal metrics bundle ────────────────────────────────────────────────

/// Every engine metric, stored in a single [`OnceLock`].
pub struct Metrics {
    /// Private registry owning all descriptors.
    pub registry: Registry,
    /// Terminal node outcomes.
    pub nodes_total: CounterVec,
    /// Per-attempt execution latency.
    pub node_duration: HistogramVec,
    /// Approval decisions.
    pub approvals_total: CounterVec,
    /// Requests awaiting a decision.
    pub approvals_pending: IntGauge,
    /// Terminal run statuses.
    pub runs_total: CounterVec,
    /// Committed thought versions by origin.
    pub commits_total: CounterVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

// ── Initialisation ─────────────────────────────────────────────────────────

fn register<C>(registry: &Registry, collector: Result<C, prometheus::Error>) -> Result<C, EngineError>
where
    C: Collector + Clone + 'static,
{
    let collector = collector.map_err(|e| EngineError::Metrics(format!("metrics init failed: {e}")))?;
    registry
        .register(Box::new(collector.clone()))
        .map_err(|e| EngineError::Metrics(format!("metrics registration failed: {e}")))?;
    Ok(collector)
}

/// Initialise all metrics in a private registry.
///
/// Calling it a second time is a no-op.
///
/// # Errors
///
/// Returns [`EngineError::Metrics`] if descriptor construction or
/// registration fails.
///
/// # Panics
///
/// This function never panics.
pub fn init_metrics() -> Result<(), EngineError> {
    if METRICS.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();
    let nodes_total = register(
        &registry,
        CounterVec::new(
            Opts::new("thought_nodes_total", "Nodes reaching a terminal state"),
            &["outcome"],
        ),
    )?;
    let node_duration = register(
        &registry,
        HistogramVec::new(
            HistogramOpts::new(
                "thought_node_duration_seconds",
                "Wall-clock duration of one node attempt",
            ),
            &["thought"],
        ),
    )?;
    let approvals_total = register(
        &registry,
        CounterVec::new(
            Opts::new("thought_approvals_total", "Approval decisions recorded"),
            &["decision"],
        ),
    )?;
    let approvals_pending = register(
        &registry,
        IntGauge::new("thought_approvals_pending", "Approval requests awaiting a decision"),
    )?;
    let runs_total = register(
        &registry,
        CounterVec::new(
            Opts::new("thought_runs_total", "Runs reaching a terminal status"),
            &["status"],
        ),
    )?;
    let commits_total = register(
        &registry,
        CounterVec::new(
            Opts::new("thought_commits_total", "Thought versions committed"),
            &["origin"],
        ),
    )?;

    // A racing initialiser builds identical descriptors; either value is fine.
    let _ = METRICS.set(Metrics {
        registry,
        nodes_total,
        node_duration,
        approvals_total,
        approvals_pending,
        runs_total,
        commits_total,
    });

    Ok(())
}

fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

fn inc(counter: Option<&CounterVec>, label: &str) {
    if let Some(c) = counter.and_then(|c| c.get_metric_with_label_values(&[label]).ok()) {
        c.inc();
    }
}

// ── Public helper functions ────────────────────────────────────────────────

/// Count a node reaching a terminal state (`succeeded`, `failed`, `cancelled`).
///
/// # Panics
///
/// This function never panics.
pub fn record_node_outcome(outcome: &str) {
    inc(metrics().map(|m| &m.nodes_total), outcome);
}

/// Observe the duration of one node attempt.
///
/// # Panics
///
/// This function never panics.
pub fn record_node_latency(thought: &str, d: Duration) {
    if let Some(m) = metrics() {
        if let Ok(h) = m.node_duration.get_metric_with_label_values(&[thought]) {
            h.observe(d.as_secs_f64());
        }
    }
}

/// Count an approval decision (`approve`, `reject`, `edit`).
///
/// # Panics
///
/// This function never panics.
pub fn inc_approval(decision: &str) {
    inc(metrics().map(|m| &m.approvals_total), decision);
}

/// Set the number of pending approval requests.
///
/// # Panics
///
/// This function never panics.
pub fn set_approvals_pending(pending: usize) {
    if let Some(m) = metrics() {
        m.approvals_pending
            .set(i64::try_from(pending).unwrap_or(i64::MAX));
    }
}

/// Count a run reaching a terminal status.
///
/// # Panics
///
/// This function never panics.
pub fn record_run(status: &str) {
    inc(metrics().map(|m| &m.runs_total), status);
}

/// Count a committed thought version.
///
/// # Panics
///
/// This function never panics.
pub fn record_commit(origin: &str) {
    inc(metrics().map(|m| &m.commits_total), origin);
}

/// Gather and encode all metrics in the Prometheus text exposition format.
///
/// Empty if metrics are not initialised or encoding fails.
///
/// # Panics
///
/// This function never panics.
pub fn gather_metrics() -> String {
    let Some(m) = metrics() else {
        return String::new();
    };
    let families = m.registry.gather();
    let mut buffer = Vec::new();
    if TextEncoder::new().encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Counter values keyed by label, for one labelled counter family.
fn counter_values(counter: &CounterVec, label: &str) -> HashMap<String, u64> {
    let mut values = HashMap::new();
    for family in counter.collect() {
        for metric in family.get_metric() {
            let key = metric
                .get_label()
                .iter()
                .find(|l| l.get_name() == label)
                .map_or("unknown", |l| l.get_value());
            values.insert(key.to_string(), metric.get_counter().get_value() as u64);
        }
    }
    values
}

/// A structured snapshot of the engine counters.
#[derive(Debug, Default)]
pub struct MetricsSummary {
    /// Node outcomes keyed by outcome label.
    pub nodes_total: HashMap<String, u64>,
    /// Approval decisions keyed by decision label.
    pub approvals_total: HashMap<String, u64>,
    /// Run statuses keyed by status label.
    pub runs_total: HashMap<String, u64>,
    /// Current pending approvals.
    pub approvals_pending: i64,
}

/// Current counter values; zeroed if metrics are not initialised.
///
/// # Panics
///
/// This function never panics.
pub fn get_metrics_summary() -> MetricsSummary {
    let Some(m) = metrics() else {
        return MetricsSummary::default();
    };
    MetricsSummary {
        nodes_total: counter_values(&m.nodes_total, "outcome"),
        approvals_total: counter_values(&m.approvals_total, "decision"),
        runs_total: counter_values(&m.runs_total, "status"),
        approvals_pending: m.approvals_pending.get(),
    }
}
