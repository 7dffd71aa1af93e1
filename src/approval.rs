//! # ApprovalGate — asynchronous human decision protocol
//!
//! ## Responsibility
//! Hold pending [`ApprovalRequest`]s for gated nodes and proposed thought
//! modifications, and deliver exactly one [`Decision`] per request to the
//! party waiting on it.
//!
//! ## Guarantees
//! - Exactly-once: a request is removed from the pending set under a lock
//!   before its decision is delivered; a second `resolve` observes
//!   `AlreadyResolved`
//! - Independent: requests never block one another and may be resolved in
//!   any order, concurrently
//! - Transport-free: the gate knows nothing about chat sessions or HTTP;
//!   front ends poll [`ApprovalGate::pending`] or subscribe to run events
//!
//! ## NOT Responsible For
//! - Acting on decisions (see: `scheduler`)
//! - Validating edited definitions (see: `self_modify`)

use crate::graph::{NodeId, RunId};
use crate::metrics;
use crate::thought::{RawDefinition, ThoughtDefinition, ThoughtId};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::info;
use uuid::Uuid;

/// How many closed request ids are remembered for `AlreadyResolved` reporting.
const CLOSED_CAPACITY: usize = 4096;

// ── Types ────────────────────────────────────────────────────────────────────

/// Identity of one approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub Uuid);

impl RequestId {
    /// A fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What an approval request is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ApprovalSubject {
    /// A gated node waiting to run.
    Node {
        /// Owning run.
        run_id: RunId,
        /// Node waiting on the decision.
        node: NodeId,
        /// Pinned thought version the node would run.
        thought: ThoughtId,
    },
    /// A proposed new thought version.
    Modification {
        /// Run whose node proposed it, if any.
        run_id: Option<RunId>,
        /// Node that proposed it, if any.
        proposed_by: Option<NodeId>,
        /// Name of the thought being defined or changed.
        thought: String,
    },
}

/// A pending decision surfaced to a human.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    /// Request identity.
    pub id: RequestId,
    /// What is being approved.
    pub subject: ApprovalSubject,
    /// Human-readable description of the pending action.
    pub rendering: String,
    /// Capabilities the action would run with.
    pub capabilities: Vec<String>,
    /// When the request was created.
    pub requested_at: DateTime<Utc>,
}

/// A human decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", content = "definition", rename_all = "snake_case")]
pub enum Decision {
    /// Proceed as proposed.
    Approve,
    /// Do not proceed.
    Reject,
    /// Proceed with this replacement definition instead.
    Edit(RawDefinition),
}

impl Decision {
    /// Metric and log label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::Edit(_) => "edit",
        }
    }
}

/// Approval protocol misuse.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApprovalError {
    /// The request already received a decision.
    #[error("approval request {id} already resolved")]
    AlreadyResolved {
        /// Request id.
        id: RequestId,
    },

    /// No such request.
    #[error("approval request {id} not found")]
    NotFound {
        /// Request id.
        id: RequestId,
    },

    /// The request was withdrawn (its run was cancelled) before a decision.
    #[error("approval request {id} was withdrawn")]
    Withdrawn {
        /// Request id.
        id: RequestId,
    },

    /// An `Edit` decision renamed the thought under review. Other faults in
    /// the edited definition surface when the pipeline commits it.
    #[error("edit for approval request {id} rejected: {reason}")]
    InvalidEdit {
        /// Request id.
        id: RequestId,
        /// Why the edit was refused.
        reason: String,
    },
}

/// Receives the single decision for one request.
///
/// Resolves to `Err` if the request is withdrawn.
pub type DecisionReceiver = oneshot::Receiver<Decision>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Closed {
    Decided,
    Withdrawn,
}

#[derive(Default)]
struct GateState {
    pending: HashMap<RequestId, (ApprovalRequest, oneshot::Sender<Decision>)>,
    closed: HashMap<RequestId, Closed>,
    closed_order: VecDeque<RequestId>,
}

impl GateState {
    fn close(&mut self, id: RequestId, how: Closed) {
        if self.closed_order.len() >= CLOSED_CAPACITY {
            if let Some(oldest) = self.closed_order.pop_front() {
                self.closed.remove(&oldest);
            }
        }
        self.closed.insert(id, how);
        self.closed_order.push_back(id);
    }
}

// ── Gate ─────────────────────────────────────────────────────────────────────

/// Registry of pending approval requests.
///
/// # Thread Safety
///
/// All state sits behind one `parking_lot::Mutex` held only for map updates;
/// decisions are delivered after the lock is released.
///
/// # Example
///
/// ```rust
/// use thought_orchestrator::approval::{ApprovalGate, ApprovalSubject, Decision};
/// use thought_orchestrator::graph::{NodeId, RunId};
/// use thought_orchestrator::thought::ThoughtId;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let gate = ApprovalGate::new();
/// let subject = ApprovalSubject::Node {
///     run_id: RunId::new(),
///     node: NodeId::new("write"),
///     thought: ThoughtId::new("write_file", 1),
/// };
/// let (request, rx) = gate.request_approval(subject, "write /tmp/out".into(), vec![]);
/// gate.resolve(request.id, Decision::Approve).unwrap();
/// assert_eq!(rx.await.unwrap(), Decision::Approve);
/// assert!(gate.resolve(request.id, Decision::Reject).is_err());
/// # }
/// ```
#[derive(Default)]
pub struct ApprovalGate {
    state: Mutex<GateState>,
}

impl fmt::Debug for ApprovalGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApprovalGate")
            .field("pending", &self.state.lock().pending.len())
            .finish()
    }
}

impl ApprovalGate {
    /// An empty gate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a request and return it with the receiver for its decision.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn request_approval(
        &self,
        subject: ApprovalSubject,
        rendering: String,
        capabilities: Vec<String>,
    ) -> (ApprovalRequest, DecisionReceiver) {
        let request = ApprovalRequest {
            id: RequestId::new(),
            subject,
            rendering,
            capabilities,
            requested_at: Utc::now(),
        };
        let (tx, rx) = oneshot::channel();
        let pending = {
            let mut state = self.state.lock();
            state.pending.insert(request.id, (request.clone(), tx));
            state.pending.len()
        };
        metrics::set_approvals_pending(pending);
        info!(request_id = %request.id, subject = ?request.subject, "approval: requested");
        (request, rx)
    }

    /// Record the decision for `id` and deliver it.
    ///
    /// # Returns
    ///
    /// - `Ok(())` if this call recorded the decision
    /// - `Err(AlreadyResolved)` if a decision was already recorded
    /// - `Err(Withdrawn)` if the request was withdrawn
    /// - `Err(NotFound)` if the id was never issued (or has aged out)
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn resolve(&self, id: RequestId, decision: Decision) -> Result<(), ApprovalError> {
        let (tx, pending) = {
            let mut state = self.state.lock();
            match state.pending.remove(&id) {
                Some((_, tx)) => {
                    state.close(id, Closed::Decided);
                    (tx, state.pending.len())
                }
                None => {
                    return Err(match state.closed.get(&id) {
                        Some(Closed::Decided) => ApprovalError::AlreadyResolved { id },
                        Some(Closed::Withdrawn) => ApprovalError::Withdrawn { id },
                        None => ApprovalError::NotFound { id },
                    })
                }
            }
        };
        metrics::set_approvals_pending(pending);
        metrics::inc_approval(decision.label());
        info!(request_id = %id, decision = decision.label(), "approval: resolved");
        // The waiter may be gone if its run finished meanwhile; the decision is still recorded.
        let _ = tx.send(decision);
        Ok(())
    }

    /// Withdraw a pending request; its receiver observes a closed channel.
    ///
    /// Returns `true` if the request was pending.
    pub fn withdraw(&self, id: RequestId) -> bool {
        let pending = {
            let mut state = self.state.lock();
            if state.pending.remove(&id).is_none() {
                return false;
            }
            state.close(id, Closed::Withdrawn);
            state.pending.len()
        };
        metrics::set_approvals_pending(pending);
        info!(request_id = %id, "approval: withdrawn");
        true
    }

    /// Every pending request, oldest first.
    pub fn pending(&self) -> Vec<ApprovalRequest> {
        let mut requests: Vec<ApprovalRequest> = self
            .state
            .lock()
            .pending
            .values()
            .map(|(r, _)| r.clone())
            .collect();
        requests.sort_by_key(|r| r.requested_at);
        requests
    }

    /// A pending request by id.
    pub fn get(&self, id: RequestId) -> Option<ApprovalRequest> {
        self.state.lock().pending.get(&id).map(|(r, _)| r.clone())
    }

    /// Number of pending requests.
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }
}

// ── Rendering ────────────────────────────────────────────────────────────────

/// Human-readable description of running `definition` on `inputs`.
pub fn render_node(node: &NodeId, definition: &ThoughtDefinition, inputs: &Map<String, Value>) -> String {
    let mut text = format!("Run {} as node '{node}'", definition.id);
    if !definition.description.is_empty() {
        text.push_str(&format!(": {}", definition.description));
    }
    if definition.side_effecting {
        text.push_str("\n  side-effecting");
    }
    if !definition.capabilities.is_empty() {
        let caps: Vec<String> = definition.capabilities.iter().map(ToString::to_string).collect();
        text.push_str(&format!("\n  capabilities: {}", caps.join(", ")));
    }
    if !inputs.is_empty() {
        let rendered = serde_json::to_string(inputs).unwrap_or_default();
        text.push_str(&format!("\n  inputs: {rendered}"));
    }
    text
}

/// Human-readable description of registering `raw` on top of `base_version`.
pub fn render_modification(raw: &RawDefinition, base_version: Option<u32>) -> String {
    let action = match base_version {
        Some(v) => format!("Replace {}@v{v} with a new version", raw.name),
        None => format!("Define new thought '{}'", raw.name),
    };
    let mut text = action;
    if !raw.description.is_empty() {
        text.push_str(&format!(": {}", raw.description));
    }
    text.push_str(&format!("\n  body: {}", raw.body));
    if !raw.capabilities.is_empty() {
        text.push_str(&format!("\n  capabilities: {}", raw.capabilities.join(", ")));
    }
    if raw.side_effecting {
        text.push_str("\n  side-effecting");
    }
    text
}
