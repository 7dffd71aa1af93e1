//! Run status stream.
//!
//! Every engine owns one [`EventBus`]. Publishing never blocks: a subscriber
//! that falls behind by more than the buffer capacity observes
//! `RecvError::Lagged` and skips ahead.

use crate::approval::ApprovalRequest;
use crate::graph::{NodeId, RunId};
use crate::sandbox::ErrorKind;
use crate::scheduler::node::NodeState;
use crate::scheduler::run::RunStatus;
use crate::thought::{Origin, ThoughtId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

/// Something observable happened inside the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    /// A run was admitted.
    RunStarted {
        /// Run id.
        run_id: RunId,
        /// Workflow name.
        workflow: String,
        /// Node count.
        nodes: usize,
    },
    /// A node changed state.
    NodeTransition {
        /// Owning run.
        run_id: RunId,
        /// Node id.
        node: NodeId,
        /// Previous state.
        from: NodeState,
        /// New state.
        to: NodeState,
    },
    /// A decision is needed.
    ApprovalRequested {
        /// The open request.
        request: ApprovalRequest,
    },
    /// One execution attempt failed.
    NodeAttemptFailed {
        /// Owning run.
        run_id: RunId,
        /// Node id.
        node: NodeId,
        /// 1-based attempt number.
        attempt: u32,
        /// Failure classification.
        kind: ErrorKind,
        /// Error text.
        message: String,
        /// Whether another attempt is scheduled.
        will_retry: bool,
    },
    /// A new thought version became resolvable.
    ThoughtCommitted {
        /// Committed id.
        id: ThoughtId,
        /// Authoring origin.
        origin: Origin,
        /// Commit time.
        committed_at: DateTime<Utc>,
    },
    /// A thought-originated proposal never reached the gate, or a human
    /// rejected it.
    ProposalRejected {
        /// Thought name the proposal targeted.
        thought: String,
        /// Node that produced the proposal, if any.
        proposed_by: Option<NodeId>,
        /// Validation summary or decision.
        reason: String,
    },
    /// A run reached its terminal status.
    RunFinished {
        /// Run id.
        run_id: RunId,
        /// Terminal status.
        status: RunStatus,
    },
}

/// Broadcast hub for [`RunEvent`]s. Clone is cheap.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RunEvent>,
}

impl EventBus {
    /// A bus buffering up to `capacity` events per subscriber (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Dropped silently when nobody is subscribed.
    pub fn publish(&self, event: RunEvent) {
        let _ = self.tx.send(event);
    }

    /// A new subscriber that sees events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.tx.subscribe()
    }

    /// Current subscriber count.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
