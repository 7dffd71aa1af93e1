//! # Run driver
//!
//! ## Responsibility
//! Drive one [`WorkflowGraph`] instance to a terminal status: promote nodes
//! to Ready as their upstreams succeed, route gated nodes through the
//! approval gate, dispatch Ready nodes into the sandbox as worker slots free
//! up, apply retry policy, and propagate failures downstream.
//!
//! ## Guarantees
//! - Ordered: a node becomes Ready only after every upstream node Succeeded
//! - Slot-free waiting: a node awaiting approval holds no worker slot
//! - Single writer: all node state for a run is owned by its driver task;
//!   observers read snapshots through a watch channel
//! - Deterministic dispatch: among Ready nodes, the earliest in topological
//!   order (ties by creation order) takes the next free slot
//!
//! ## NOT Responsible For
//! - Building or type-checking the graph (see: `graph`)
//! - Executing bodies (see: `sandbox`)

use super::events::RunEvent;
use super::node::{FailureKind, FailureRecord, NodeReport, NodeState};
use super::retry::RetryPolicy;
use super::EngineShared;
use crate::approval::{self, ApprovalSubject, Decision, RequestId};
use crate::graph::{Binding, GraphNode, NodeId, RunId, WorkflowGraph};
use crate::metrics;
use crate::sandbox::{
    CancelSignal, CancelSource, ErrorKind, ExecutionError, ExecutionOutput, ExecutionRequest,
    SandboxGrant,
};
use crate::thought::{Origin, RawDefinition, ThoughtDefinition};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit};
use tracing::{debug, error, info, warn};

// ── Run-level types ──────────────────────────────────────────────────────────

/// Status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// At least one node is not terminal.
    Running,
    /// Every node succeeded.
    Succeeded,
    /// Some node failed or was cancelled, or the run was cancelled.
    Failed,
}

impl RunStatus {
    /// Lowercase label for logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final record of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    /// Run id.
    pub run_id: RunId,
    /// Workflow name.
    pub workflow: String,
    /// Terminal status.
    pub status: RunStatus,
    /// Per-node outcome, in topological order.
    pub nodes: Vec<NodeReport>,
    /// Nodes that ended Failed.
    pub failed: Vec<NodeId>,
    /// Nodes that ended Cancelled.
    pub cancelled: Vec<NodeId>,
    /// Admission time.
    pub started_at: DateTime<Utc>,
    /// Completion time.
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunReport {
    /// A report for a run with no nodes yet.
    pub fn empty(run_id: RunId, workflow: impl Into<String>) -> Self {
        Self {
            run_id,
            workflow: workflow.into(),
            status: RunStatus::Running,
            nodes: Vec::new(),
            failed: Vec::new(),
            cancelled: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// A node's report by id.
    pub fn node(&self, id: &str) -> Option<&NodeReport> {
        self.nodes.iter().find(|n| n.id.as_str() == id)
    }

    /// A succeeded node's output.
    pub fn output(&self, id: &str) -> Option<&Value> {
        self.node(id).and_then(|n| n.output.as_ref())
    }
}

#[derive(Debug, Clone, Default)]
struct RunView {
    states: BTreeMap<NodeId, NodeState>,
    report: Option<RunReport>,
}

/// Caller-side handle to a submitted run. Clone is cheap.
#[derive(Clone)]
pub struct RunHandle {
    run_id: RunId,
    workflow: String,
    cancel: Arc<CancelSource>,
    view: watch::Receiver<RunView>,
}

impl fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunHandle")
            .field("run_id", &self.run_id)
            .field("workflow", &self.workflow)
            .field("status", &self.status())
            .finish()
    }
}

impl RunHandle {
    /// Run id.
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Workflow name.
    pub fn workflow(&self) -> &str {
        &self.workflow
    }

    /// Current status.
    pub fn status(&self) -> RunStatus {
        self.view
            .borrow()
            .report
            .as_ref()
            .map_or(RunStatus::Running, |r| r.status)
    }

    /// Current state of every node.
    pub fn snapshot(&self) -> BTreeMap<NodeId, NodeState> {
        self.view.borrow().states.clone()
    }

    /// Current state of one node.
    pub fn node_state(&self, node: &str) -> Option<NodeState> {
        self.view.borrow().states.get(&NodeId::new(node)).copied()
    }

    /// Request cancellation. Idempotent; a finished run is unaffected.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the run to finish.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub async fn wait(&self) -> RunReport {
        let mut view = self.view.clone();
        let finished = view
            .wait_for(|v| v.report.is_some())
            .await
            .ok()
            .and_then(|v| v.report.clone());
        finished.unwrap_or_else(|| {
            // The driver is gone without reporting; surface what is known.
            let mut report = RunReport::empty(self.run_id, self.workflow.clone());
            report.status = RunStatus::Failed;
            report
        })
    }

    /// Wait until `node` reaches `state`.
    ///
    /// Returns `false` if the run finished without the node reaching it.
    pub async fn wait_for_node_state(&self, node: &str, state: NodeState) -> bool {
        let id = NodeId::new(node);
        let mut view = self.view.clone();
        let reached = match view
            .wait_for(|v| v.states.get(&id) == Some(&state) || v.report.is_some())
            .await
        {
            Ok(v) => v.states.get(&id) == Some(&state),
            Err(_) => false,
        };
        reached
    }
}

// ── Driver ───────────────────────────────────────────────────────────────────

enum DriverMsg {
    Finished {
        index: usize,
        attempt: u32,
        result: Result<ExecutionOutput, ExecutionError>,
    },
    Decision {
        index: usize,
        request: RequestId,
        decision: Option<Decision>,
    },
    RetryDue {
        index: usize,
    },
    EditCommitted {
        index: usize,
        result: Result<Arc<ThoughtDefinition>, String>,
    },
}

struct NodeRuntime {
    definition: Arc<ThoughtDefinition>,
    grant: SandboxGrant,
    retry: RetryPolicy,
    state: NodeState,
    attempts: u32,
    remaining_upstream: usize,
    approved: bool,
    approval: Option<RequestId>,
    /// A human edit is being committed off the driver task.
    editing: bool,
    output: Option<Value>,
    failure: Option<FailureRecord>,
}

struct RunDriver {
    run_id: RunId,
    graph: WorkflowGraph,
    shared: Arc<EngineShared>,
    nodes: Vec<NodeRuntime>,
    /// `(topological position, index)` of nodes waiting for a slot.
    ready: BTreeSet<(usize, usize)>,
    running: usize,
    cancelled: bool,
    tx: mpsc::UnboundedSender<DriverMsg>,
    view: watch::Sender<RunView>,
    cancel: CancelSignal,
    started_at: DateTime<Utc>,
}

/// Admit `graph` as a new run and start its driver.
pub(crate) fn spawn(shared: Arc<EngineShared>, graph: WorkflowGraph) -> RunHandle {
    let run_id = RunId::new();
    let cancel = Arc::new(CancelSource::new());
    let nodes: Vec<NodeRuntime> = graph
        .nodes()
        .iter()
        .map(|n| runtime_for(&shared, n, Arc::clone(&n.definition)))
        .collect();
    let states = graph
        .nodes()
        .iter()
        .map(|n| (n.id.clone(), NodeState::Pending))
        .collect();
    let (view_tx, view_rx) = watch::channel(RunView {
        states,
        report: None,
    });
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = RunHandle {
        run_id,
        workflow: graph.name().to_string(),
        cancel: Arc::clone(&cancel),
        view: view_rx,
    };
    let driver = RunDriver {
        run_id,
        graph,
        shared,
        nodes,
        ready: BTreeSet::new(),
        running: 0,
        cancelled: false,
        tx,
        view: view_tx,
        cancel: cancel.signal(),
        started_at: Utc::now(),
    };
    tokio::spawn(driver.drive(rx));
    handle
}

fn runtime_for(shared: &EngineShared, node: &GraphNode, definition: Arc<ThoughtDefinition>) -> NodeRuntime {
    NodeRuntime {
        grant: shared.sandbox.grant_for(&definition),
        retry: RetryPolicy::resolve(definition.retry.as_ref(), &shared.retry_defaults),
        definition,
        state: NodeState::Pending,
        attempts: 0,
        remaining_upstream: node.upstream.len(),
        approved: false,
        approval: None,
        editing: false,
        output: None,
        failure: None,
    }
}

impl RunDriver {
    async fn drive(mut self, mut rx: mpsc::UnboundedReceiver<DriverMsg>) {
        info!(
            run_id = %self.run_id,
            workflow = %self.graph.name(),
            nodes = self.graph.len(),
            "run: started"
        );
        self.shared.events.publish(RunEvent::RunStarted {
            run_id: self.run_id,
            workflow: self.graph.name().to_string(),
            nodes: self.graph.len(),
        });

        let roots: Vec<usize> = self
            .graph
            .order()
            .iter()
            .copied()
            .filter(|&i| self.nodes[i].remaining_upstream == 0)
            .collect();
        for index in roots {
            self.promote(index);
        }

        let mut cancel = self.cancel.clone();
        loop {
            if self.running == 0 && self.nodes.iter().all(|n| n.state.is_terminal()) {
                break;
            }
            let has_ready = !self.ready.is_empty() && !self.cancelled;
            let slots = Arc::clone(&self.shared.slots);
            tokio::select! {
                biased;
                _ = cancel.cancelled(), if !self.cancelled => self.cancel_all(),
                Some(msg) = rx.recv() => self.handle(msg),
                permit = slots.acquire_owned(), if has_ready => {
                    let Ok(permit) = permit else {
                        error!(run_id = %self.run_id, "run: worker pool closed");
                        self.cancel_all();
                        continue;
                    };
                    if let Some((_, index)) = self.ready.pop_first() {
                        self.dispatch(index, permit);
                    }
                }
            }
        }

        self.finish().await;
    }

    fn handle(&mut self, msg: DriverMsg) {
        match msg {
            DriverMsg::Finished {
                index,
                attempt,
                result,
            } => {
                self.running = self.running.saturating_sub(1);
                self.on_finished(index, attempt, result);
            }
            DriverMsg::Decision {
                index,
                request,
                decision,
            } => self.on_decision(index, request, decision),
            DriverMsg::RetryDue { index } => {
                if self.nodes[index].state == NodeState::Ready && !self.cancelled {
                    self.enqueue(index);
                }
            }
            DriverMsg::EditCommitted { index, result } => self.on_edit_committed(index, result),
        }
    }

    // ── State transitions ────────────────────────────────────────────────

    fn transition(&mut self, index: usize, to: NodeState) -> bool {
        let from = self.nodes[index].state;
        let id = self.graph.nodes()[index].id.clone();
        if !from.can_transition_to(to) {
            warn!(run_id = %self.run_id, node = %id, from = %from, to = %to, "run: illegal transition ignored");
            return false;
        }
        self.nodes[index].state = to;
        debug!(
            run_id = %self.run_id,
            node = %id,
            thought = %self.nodes[index].definition.id,
            from = %from,
            to = %to,
            "run: node transition"
        );
        if to.is_terminal() {
            metrics::record_node_outcome(to.as_str());
        }
        self.view.send_modify(|v| {
            v.states.insert(id.clone(), to);
        });
        self.shared.events.publish(RunEvent::NodeTransition {
            run_id: self.run_id,
            node: id,
            from,
            to,
        });
        true
    }

    fn enqueue(&mut self, index: usize) {
        let position = self.graph.position_of(index).unwrap_or(index);
        self.ready.insert((position, index));
    }

    fn needs_approval(&self, index: usize) -> bool {
        let node = &self.nodes[index];
        !node.approved
            && (node.definition.side_effecting
                || !self.shared.registry.is_trusted(&node.definition.id))
    }

    /// Move a node to Ready, then either queue it or send it to the gate.
    fn promote(&mut self, index: usize) {
        if !self.transition(index, NodeState::Ready) {
            return;
        }
        let missing = self.missing_inputs(index);
        if !missing.is_empty() {
            self.fail(
                index,
                FailureKind::Validation,
                format!("required inputs have no value: {}", missing.join(", ")),
            );
            return;
        }
        if self.needs_approval(index) {
            self.request_approval(index);
        } else {
            self.enqueue(index);
        }
    }

    fn request_approval(&mut self, index: usize) {
        if !self.transition(index, NodeState::AwaitingApproval) {
            return;
        }
        let node_id = self.graph.nodes()[index].id.clone();
        let definition = Arc::clone(&self.nodes[index].definition);
        let inputs = self.bind_inputs(index);
        let (request, decision_rx) = self.shared.approvals.request_approval(
            ApprovalSubject::Node {
                run_id: self.run_id,
                node: node_id.clone(),
                thought: definition.id.clone(),
            },
            approval::render_node(&node_id, &definition, &inputs),
            self.nodes[index]
                .grant
                .capabilities()
                .iter()
                .map(ToString::to_string)
                .collect(),
        );
        let request_id = request.id;
        self.nodes[index].approval = Some(request_id);
        info!(
            run_id = %self.run_id,
            node = %node_id,
            thought = %definition.id,
            request_id = %request_id,
            "run: node awaiting approval"
        );
        self.shared
            .events
            .publish(RunEvent::ApprovalRequested { request });
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let decision = decision_rx.await.ok();
            let _ = tx.send(DriverMsg::Decision {
                index,
                request: request_id,
                decision,
            });
        });
    }

    fn fail(&mut self, index: usize, kind: FailureKind, message: String) {
        let to = match kind {
            FailureKind::Rejected | FailureKind::RunCancelled | FailureKind::UpstreamFailed { .. } => {
                NodeState::Cancelled
            }
            FailureKind::Execution { .. } | FailureKind::Validation => NodeState::Failed,
        };
        if !self.transition(index, to) {
            return;
        }
        warn!(
            run_id = %self.run_id,
            node = %self.graph.nodes()[index].id,
            reason = %message,
            "run: node did not succeed"
        );
        self.nodes[index].failure = Some(FailureRecord { kind, message });
        self.cancel_descendants(index);
    }

    /// Cancel every transitive dependent of `origin` that is not yet terminal.
    fn cancel_descendants(&mut self, origin: usize) {
        let upstream = self.graph.nodes()[origin].id.clone();
        let mut queue: VecDeque<usize> = self.graph.nodes()[origin].downstream.iter().copied().collect();
        let mut seen = BTreeSet::new();
        while let Some(index) = queue.pop_front() {
            if !seen.insert(index) {
                continue;
            }
            if !self.nodes[index].state.is_terminal() {
                self.withdraw(index);
                self.ready.retain(|&(_, i)| i != index);
                if self.transition(index, NodeState::Cancelled) {
                    self.nodes[index].failure = Some(FailureRecord {
                        kind: FailureKind::UpstreamFailed {
                            upstream: upstream.clone(),
                        },
                        message: format!("upstream node '{upstream}' did not succeed"),
                    });
                }
            }
            queue.extend(self.graph.nodes()[index].downstream.iter().copied());
        }
    }

    fn withdraw(&mut self, index: usize) {
        if let Some(request) = self.nodes[index].approval.take() {
            self.shared.approvals.withdraw(request);
        }
    }

    fn cancel_all(&mut self) {
        self.cancelled = true;
        self.ready.clear();
        info!(run_id = %self.run_id, "run: cancellation requested");
        for index in 0..self.nodes.len() {
            if self.nodes[index].state.is_terminal() {
                continue;
            }
            self.withdraw(index);
            if self.transition(index, NodeState::Cancelled) {
                self.nodes[index].failure = Some(FailureRecord {
                    kind: FailureKind::RunCancelled,
                    message: "run cancelled".to_string(),
                });
            }
        }
    }

    // ── Dispatch ─────────────────────────────────────────────────────────

    fn bind_inputs(&self, index: usize) -> Map<String, Value> {
        let mut inputs = Map::new();
        for (name, binding) in &self.graph.nodes()[index].inputs {
            let value = match binding {
                Binding::Literal(v) => Some(v.clone()),
                Binding::From { node, output } => self
                    .graph
                    .node_by_id(node)
                    .and_then(|n| self.nodes[n.index].output.as_ref())
                    .and_then(|o| o.get(output))
                    .cloned(),
            };
            if let Some(value) = value {
                inputs.insert(name.clone(), value);
            }
        }
        inputs
    }

    /// Required inputs of the node's definition that bound to nothing.
    fn missing_inputs(&self, index: usize) -> Vec<String> {
        let inputs = self.bind_inputs(index);
        self.nodes[index]
            .definition
            .inputs
            .required_fields()
            .filter(|name| inputs.get(*name).map_or(true, Value::is_null))
            .map(str::to_string)
            .collect()
    }

    fn dispatch(&mut self, index: usize, permit: OwnedSemaphorePermit) {
        if !self.transition(index, NodeState::Running) {
            return;
        }
        let inputs = self.bind_inputs(index);
        let node = &mut self.nodes[index];
        node.approval = None;
        node.attempts += 1;
        let attempt = node.attempts;
        let grant = node.grant.clone();
        let request = ExecutionRequest {
            run_id: self.run_id,
            node: self.graph.nodes()[index].id.clone(),
            definition: Arc::clone(&node.definition),
            inputs,
            attempt,
            cancel: self.cancel.clone(),
        };
        debug!(
            run_id = %self.run_id,
            node = %request.node,
            thought = %request.definition.id,
            attempt,
            "run: dispatching"
        );
        self.running += 1;
        let sandbox = self.shared.sandbox.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let thought = request.definition.id.name.clone();
            let started = Instant::now();
            let result = sandbox.execute(request, &grant).await;
            metrics::record_node_latency(&thought, started.elapsed());
            drop(permit);
            let _ = tx.send(DriverMsg::Finished {
                index,
                attempt,
                result,
            });
        });
    }

    fn on_finished(&mut self, index: usize, attempt: u32, result: Result<ExecutionOutput, ExecutionError>) {
        if self.nodes[index].state != NodeState::Running {
            return;
        }
        match result {
            Ok(output) => self.on_success(index, output),
            Err(err) => self.on_attempt_failed(index, attempt, err),
        }
    }

    fn on_success(&mut self, index: usize, output: ExecutionOutput) {
        let ExecutionOutput { value, proposals } = output;
        let node_id = self.graph.nodes()[index].id.clone();
        if let Err(issues) = self.nodes[index].definition.outputs.check_value(&value) {
            self.fail(
                index,
                FailureKind::Validation,
                format!("output does not match schema: {}", issues.join("; ")),
            );
            return;
        }
        self.nodes[index].output = Some(value);
        if !self.transition(index, NodeState::Succeeded) {
            return;
        }
        info!(
            run_id = %self.run_id,
            node = %node_id,
            thought = %self.nodes[index].definition.id,
            attempts = self.nodes[index].attempts,
            "run: node succeeded"
        );
        for proposal in proposals {
            self.submit_proposal(&node_id, proposal);
        }
        let downstream = self.graph.nodes()[index].downstream.clone();
        for next in downstream {
            let node = &mut self.nodes[next];
            node.remaining_upstream = node.remaining_upstream.saturating_sub(1);
            if node.remaining_upstream == 0 && node.state == NodeState::Pending {
                self.promote(next);
            }
        }
    }

    fn on_attempt_failed(&mut self, index: usize, attempt: u32, err: ExecutionError) {
        let kind = err.kind();
        if kind == ErrorKind::Cancelled && self.cancelled {
            return;
        }
        let delay = self.nodes[index].retry.next_delay(kind, attempt);
        let node_id = self.graph.nodes()[index].id.clone();
        warn!(
            run_id = %self.run_id,
            node = %node_id,
            attempt,
            kind = %kind,
            error = %err,
            will_retry = delay.is_some(),
            "run: attempt failed"
        );
        self.shared.events.publish(RunEvent::NodeAttemptFailed {
            run_id: self.run_id,
            node: node_id,
            attempt,
            kind,
            message: err.to_string(),
            will_retry: delay.is_some(),
        });
        match delay {
            Some(delay) => {
                if self.transition(index, NodeState::Ready) {
                    self.schedule_retry(index, delay);
                }
            }
            None => self.fail(index, FailureKind::Execution { error: kind }, err.to_string()),
        }
    }

    fn schedule_retry(&self, index: usize, delay: Duration) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(DriverMsg::RetryDue { index });
        });
    }

    // ── Approval decisions ───────────────────────────────────────────────

    fn on_decision(&mut self, index: usize, request: RequestId, decision: Option<Decision>) {
        let node = &self.nodes[index];
        if node.state != NodeState::AwaitingApproval || node.approval != Some(request) {
            return;
        }
        self.nodes[index].approval = None;
        match decision {
            Some(Decision::Approve) => {
                self.nodes[index].approved = true;
                if self.transition(index, NodeState::Ready) {
                    self.enqueue(index);
                }
            }
            Some(Decision::Reject) => {
                self.fail(index, FailureKind::Rejected, "rejected at approval gate".to_string());
            }
            Some(Decision::Edit(raw)) => self.apply_edit(index, raw),
            None => {
                self.fail(index, FailureKind::Rejected, "approval request withdrawn".to_string());
            }
        }
    }

    /// Commit a human edit on the blocking pool; the node stays
    /// AwaitingApproval until [`DriverMsg::EditCommitted`] comes back.
    fn apply_edit(&mut self, index: usize, raw: RawDefinition) {
        self.nodes[index].editing = true;
        let shared = Arc::clone(&self.shared);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let committed =
                tokio::task::spawn_blocking(move || shared.pipeline.propose_and_commit(raw, Origin::HumanEdit)).await;
            let result = match committed {
                Ok(result) => result.map_err(|e| e.to_string()),
                Err(e) => Err(format!("commit task failed: {e}")),
            };
            let _ = tx.send(DriverMsg::EditCommitted { index, result });
        });
    }

    /// Rebind the node to the committed version, or fail it.
    fn on_edit_committed(&mut self, index: usize, result: Result<Arc<ThoughtDefinition>, String>) {
        let node = &self.nodes[index];
        if node.state != NodeState::AwaitingApproval || !node.editing {
            return;
        }
        self.nodes[index].editing = false;
        let definition = match result {
            Ok(definition) => definition,
            Err(e) => {
                self.fail(index, FailureKind::Validation, format!("edit rejected: {e}"));
                return;
            }
        };
        let issues = rebind_issues(&self.graph, index, &definition);
        if !issues.is_empty() {
            self.fail(
                index,
                FailureKind::Validation,
                format!("{} cannot replace the node's binding: {}", definition.id, issues.join("; ")),
            );
            return;
        }
        info!(
            run_id = %self.run_id,
            node = %self.graph.nodes()[index].id,
            thought = %definition.id,
            "run: node rebound to edited version"
        );
        let mut rebound = runtime_for(&self.shared, &self.graph.nodes()[index], definition);
        rebound.state = NodeState::AwaitingApproval;
        rebound.remaining_upstream = 0;
        rebound.attempts = self.nodes[index].attempts;
        self.nodes[index] = rebound;
        self.promote(index);
    }

    // ── Proposals ────────────────────────────────────────────────────────

    fn submit_proposal(&self, proposed_by: &NodeId, raw: RawDefinition) {
        let report = self.shared.pipeline.propose(raw.clone());
        if !report.overall_pass {
            info!(
                run_id = %self.run_id,
                node = %proposed_by,
                thought = %report.thought,
                summary = %report.summary,
                "run: proposal failed validation"
            );
            self.shared.events.publish(RunEvent::ProposalRejected {
                thought: report.thought.clone(),
                proposed_by: Some(proposed_by.clone()),
                reason: report.summary,
            });
            return;
        }
        let base_version = report.base_version;
        let proposal_id = report.proposal_id;
        let Some(validated) = report.into_validated() else {
            return;
        };
        let (request, decision_rx) = self.shared.approvals.request_approval(
            ApprovalSubject::Modification {
                run_id: Some(self.run_id),
                proposed_by: Some(proposed_by.clone()),
                thought: raw.name.clone(),
            },
            approval::render_modification(&raw, base_version),
            raw.capabilities.clone(),
        );
        self.shared
            .events
            .publish(RunEvent::ApprovalRequested { request });
        let pipeline = self.shared.pipeline.clone();
        let events = self.shared.events.clone();
        let proposed_by = proposed_by.clone();
        tokio::spawn(async move {
            let decision = decision_rx.await;
            // Commits write to the store; keep them off the async workers.
            let commit = tokio::task::spawn_blocking(move || match decision {
                Ok(Decision::Approve) => pipeline.commit(validated).map(|_| true),
                Ok(Decision::Edit(edited)) => {
                    pipeline.mark_rejected(proposal_id);
                    pipeline
                        .propose_and_commit(edited, Origin::HumanEdit)
                        .map(|_| true)
                }
                Ok(Decision::Reject) | Err(_) => {
                    pipeline.mark_rejected(proposal_id);
                    Ok(false)
                }
            })
            .await;
            let reason = match commit {
                Ok(Ok(true)) => return,
                Ok(Ok(false)) => "rejected at approval gate".to_string(),
                Ok(Err(e)) => {
                    warn!(thought = %raw.name, error = %e, "run: approved proposal did not commit");
                    e.to_string()
                }
                Err(e) => {
                    error!(thought = %raw.name, error = %e, "run: proposal commit task failed");
                    e.to_string()
                }
            };
            events.publish(RunEvent::ProposalRejected {
                thought: raw.name.clone(),
                proposed_by: Some(proposed_by),
                reason,
            });
        });
    }

    // ── Completion ───────────────────────────────────────────────────────

    fn report(&self) -> RunReport {
        let mut nodes = Vec::with_capacity(self.graph.len());
        let mut failed = Vec::new();
        let mut cancelled = Vec::new();
        for graph_node in self.graph.topological() {
            let node = &self.nodes[graph_node.index];
            match node.state {
                NodeState::Failed => failed.push(graph_node.id.clone()),
                NodeState::Cancelled => cancelled.push(graph_node.id.clone()),
                _ => {}
            }
            nodes.push(NodeReport {
                id: graph_node.id.clone(),
                thought: node.definition.id.clone(),
                state: node.state,
                attempts: node.attempts,
                output: node.output.clone(),
                failure: node.failure.clone(),
            });
        }
        let status = if !self.cancelled && nodes.iter().all(|n| n.state == NodeState::Succeeded) {
            RunStatus::Succeeded
        } else {
            RunStatus::Failed
        };
        RunReport {
            run_id: self.run_id,
            workflow: self.graph.name().to_string(),
            status,
            nodes,
            failed,
            cancelled,
            started_at: self.started_at,
            finished_at: Some(Utc::now()),
        }
    }

    async fn finish(self) {
        let report = self.report();
        let store = Arc::clone(&self.shared.store);
        let record = report.clone();
        match tokio::task::spawn_blocking(move || store.put_run(&record)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(run_id = %self.run_id, error = %e, "run: failed to persist report"),
            Err(e) => error!(run_id = %self.run_id, error = %e, "run: persist task failed"),
        }
        metrics::record_run(report.status.as_str());
        info!(
            run_id = %self.run_id,
            status = %report.status,
            failed = report.failed.len(),
            cancelled = report.cancelled.len(),
            "run: finished"
        );
        let status = report.status;
        self.view.send_modify(|v| v.report = Some(report));
        self.shared.events.publish(RunEvent::RunFinished {
            run_id: self.run_id,
            status,
        });
    }
}

/// Ways `definition` fails to fit node `index`'s bindings in `graph`.
fn rebind_issues(graph: &WorkflowGraph, index: usize, definition: &ThoughtDefinition) -> Vec<String> {
    let node = &graph.nodes()[index];
    let mut issues = Vec::new();
    for (name, binding) in &node.inputs {
        match definition.inputs.field(name) {
            None => issues.push(format!("input '{name}' is not declared")),
            Some(field) => {
                if let Binding::Literal(v) = binding {
                    if !field.ty.matches(v) && !(v.is_null() && !field.required) {
                        issues.push(format!("literal for '{name}' is not {}", field.ty));
                    }
                }
            }
        }
    }
    for name in definition.inputs.required_fields() {
        if !node.inputs.contains_key(name) {
            issues.push(format!("required input '{name}' is unbound"));
        }
    }
    for &consumer in &node.downstream {
        for binding in graph.nodes()[consumer].inputs.values() {
            if let Binding::From { node: producer, output } = binding {
                if *producer == node.id && definition.outputs.field(output).is_none() {
                    issues.push(format!("output '{output}' is no longer produced"));
                }
            }
        }
    }
    issues
}
