//! Triggers: when a workflow runs.
//!
//! Every firing builds a fresh graph from the workflow spec against the
//! registry as it is at that moment, then admits it as an independent run.
//! A firing whose build fails is logged and skipped; the trigger stays armed.

use super::run::{self, RunHandle};
use super::EngineShared;
use crate::graph::{self, WorkflowSpec};
use crate::sandbox::{CancelSignal, CancelSource};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Recently fired runs kept on a [`TriggerHandle`].
const RECENT_RUNS: usize = 128;

/// Predicate over an external event payload.
pub type EventPredicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// An event delivered from outside the engine (webhook, file watcher, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalEvent {
    /// Where the event came from.
    pub source: String,
    /// Event body.
    #[serde(default)]
    pub payload: Value,
}

impl ExternalEvent {
    /// An event from `source`.
    pub fn new(source: impl Into<String>, payload: Value) -> Self {
        Self {
            source: source.into(),
            payload,
        }
    }
}

/// When a workflow runs.
#[derive(Clone)]
pub enum Trigger {
    /// Once, now.
    Immediate,
    /// Every `interval`, first firing one interval from now.
    Periodic {
        /// Time between firings.
        interval: Duration,
    },
    /// Whenever an [`ExternalEvent`] from `source` satisfies `predicate`.
    EventDriven {
        /// Event source to listen to.
        source: String,
        /// Filter over the payload.
        predicate: EventPredicate,
    },
}

impl Trigger {
    /// A periodic trigger.
    pub fn periodic(interval: Duration) -> Self {
        Self::Periodic { interval }
    }

    /// Fire on events from `source` whose payload satisfies `predicate`.
    pub fn on_event<F>(source: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        Self::EventDriven {
            source: source.into(),
            predicate: Arc::new(predicate),
        }
    }

    /// Fire on every event from `source`.
    pub fn on_any(source: impl Into<String>) -> Self {
        Self::on_event(source, |_| true)
    }
}

impl fmt::Debug for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Immediate => f.write_str("Immediate"),
            Self::Periodic { interval } => f.debug_struct("Periodic").field("interval", interval).finish(),
            Self::EventDriven { source, .. } => f
                .debug_struct("EventDriven")
                .field("source", source)
                .finish_non_exhaustive(),
        }
    }
}

#[derive(Default)]
struct Fired {
    count: AtomicU64,
    recent: Mutex<VecDeque<RunHandle>>,
}

impl Fired {
    fn push(&self, handle: RunHandle) {
        self.count.fetch_add(1, Ordering::Relaxed);
        let mut recent = self.recent.lock();
        if recent.len() >= RECENT_RUNS {
            recent.pop_front();
        }
        recent.push_back(handle);
    }
}

/// Handle to an armed trigger. Dropping it does not disarm the trigger.
pub struct TriggerHandle {
    stop: CancelSource,
    fired: Arc<Fired>,
    task: JoinHandle<()>,
}

impl fmt::Debug for TriggerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerHandle")
            .field("fired", &self.fire_count())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl TriggerHandle {
    /// Disarm the trigger. Runs already started are unaffected.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Whether the trigger has stopped firing.
    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled() || self.task.is_finished()
    }

    /// Times the trigger admitted a run.
    pub fn fire_count(&self) -> u64 {
        self.fired.count.load(Ordering::Relaxed)
    }

    /// Most recently admitted runs, oldest first.
    pub fn runs(&self) -> Vec<RunHandle> {
        self.fired.recent.lock().iter().cloned().collect()
    }
}

/// Build `spec` now and admit it as a run.
fn fire(shared: &Arc<EngineShared>, spec: &WorkflowSpec, fired: &Fired) {
    match graph::build(spec, shared.registry.as_ref()) {
        Ok(graph) => {
            let handle = run::spawn(Arc::clone(shared), graph);
            debug!(workflow = %spec.name, run_id = %handle.run_id(), "trigger: fired");
            fired.push(handle);
        }
        Err(e) => warn!(workflow = %spec.name, error = %e, "trigger: build failed, firing skipped"),
    }
}

/// Arm `trigger` for `spec`.
pub(crate) fn arm(
    shared: Arc<EngineShared>,
    trigger: Trigger,
    spec: WorkflowSpec,
    external: broadcast::Receiver<ExternalEvent>,
) -> TriggerHandle {
    let stop = CancelSource::new();
    let fired = Arc::new(Fired::default());
    info!(workflow = %spec.name, trigger = ?trigger, "trigger: armed");
    let task = tokio::spawn(run_trigger(
        shared,
        trigger,
        spec,
        external,
        stop.signal(),
        Arc::clone(&fired),
    ));
    TriggerHandle { stop, fired, task }
}

async fn run_trigger(
    shared: Arc<EngineShared>,
    trigger: Trigger,
    spec: WorkflowSpec,
    mut external: broadcast::Receiver<ExternalEvent>,
    mut stop: CancelSignal,
    fired: Arc<Fired>,
) {
    match trigger {
        Trigger::Immediate => fire(&shared, &spec, &fired),
        Trigger::Periodic { interval } => {
            let period = interval.max(Duration::from_millis(1));
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => fire(&shared, &spec, &fired),
                }
            }
        }
        Trigger::EventDriven { source, predicate } => loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                received = external.recv() => match received {
                    Ok(event) if event.source == source && predicate(&event.payload) => {
                        fire(&shared, &spec, &fired);
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(workflow = %spec.name, skipped, "trigger: event stream lagged");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        },
    }
    debug!(workflow = %spec.name, "trigger: disarmed");
}
