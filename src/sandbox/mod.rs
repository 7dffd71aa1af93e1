//! # Sandbox — capability-scoped execution boundary
//!
//! ## Responsibility
//! Run one node body through an externally supplied [`ThoughtExecutor`],
//! enforcing the node's [`SandboxGrant`] before the body starts and the
//! wall-clock limit while it runs.
//!
//! ## Guarantees
//! - Checked first: a definition declaring a capability the grant does not
//!   cover fails with `CapabilityDenied` before any body code runs
//! - Bounded: a body exceeding its timeout gets a cooperative cancellation
//!   signal, then is aborted after the grace window; it is never left running
//!   detached, and the call returns `Timeout`
//! - Isolated: each execution receives an owned copy of its bound inputs; no
//!   state is shared between concurrent executions
//!
//! ## NOT Responsible For
//! - Process isolation or filesystem jailing (executors provide those)
//! - Retry decisions (see: `scheduler::retry`)

pub mod executors;
pub mod process;

use crate::graph::{NodeId, RunId};
use crate::thought::{Capability, CapabilityPolicy, RawDefinition, ThoughtDefinition, ThoughtId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};

pub use executors::{EchoExecutor, FnExecutor};
pub use process::ProcessExecutor;

/// Classification of an execution failure, used for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The body needed a capability outside its grant.
    CapabilityDenied,
    /// The body exceeded its wall-clock limit.
    Timeout,
    /// A retryable failure.
    Transient,
    /// A non-retryable failure.
    Permanent,
    /// The run was cancelled while the body ran.
    Cancelled,
}

impl ErrorKind {
    /// Returns `true` for kinds a retry policy may re-attempt.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient | Self::Timeout)
    }

    /// Metric label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CapabilityDenied => "capability_denied",
            Self::Timeout => "timeout",
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by [`SandboxBoundary::execute`] and by executors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutionError {
    /// A capability outside the grant was required.
    #[error("capability denied for {thought}: {capability}")]
    CapabilityDenied {
        /// Thought that asked.
        thought: ThoughtId,
        /// The uncovered capability.
        capability: String,
    },

    /// The wall-clock limit elapsed.
    #[error("execution timed out after {elapsed_ms}ms")]
    Timeout {
        /// Time spent before termination.
        elapsed_ms: u64,
    },

    /// A retryable failure.
    #[error("transient execution error: {0}")]
    Transient(String),

    /// A non-retryable failure.
    #[error("permanent execution error: {0}")]
    Permanent(String),

    /// The run was cancelled.
    #[error("execution cancelled")]
    Cancelled,
}

impl ExecutionError {
    /// The failure classification.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CapabilityDenied { .. } => ErrorKind::CapabilityDenied,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Transient(_) => ErrorKind::Transient,
            Self::Permanent(_) => ErrorKind::Permanent,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }
}

/// The narrowed capability set and limits for one node execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxGrant {
    thought: ThoughtId,
    capabilities: BTreeSet<Capability>,
    timeout: Duration,
}

impl SandboxGrant {
    /// A grant with explicit contents.
    pub fn new(
        thought: ThoughtId,
        capabilities: impl IntoIterator<Item = Capability>,
        timeout: Duration,
    ) -> Self {
        Self {
            thought,
            capabilities: capabilities.into_iter().collect(),
            timeout,
        }
    }

    /// Declared capabilities of `definition` intersected with `policy`;
    /// timeout from the definition, else `default_timeout`.
    pub fn derive(
        definition: &ThoughtDefinition,
        policy: &CapabilityPolicy,
        default_timeout: Duration,
    ) -> Self {
        Self {
            thought: definition.id.clone(),
            capabilities: policy.narrow(definition.capabilities.iter()),
            timeout: definition.timeout().unwrap_or(default_timeout),
        }
    }

    /// Thought this grant was issued for.
    pub fn thought(&self) -> &ThoughtId {
        &self.thought
    }

    /// Granted capabilities.
    pub fn capabilities(&self) -> &BTreeSet<Capability> {
        &self.capabilities
    }

    /// Wall-clock limit.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Returns `true` if some granted capability covers `capability`.
    pub fn allows(&self, capability: &Capability) -> bool {
        self.capabilities.iter().any(|c| c.covers(capability))
    }

    /// Check `capability` against the grant.
    ///
    /// Executors call this before touching a resource; bodies that skip it
    /// are the executor's responsibility.
    ///
    /// # Errors
    ///
    /// [`ExecutionError::CapabilityDenied`] if the grant does not cover it.
    pub fn require(&self, capability: &Capability) -> Result<(), ExecutionError> {
        if self.allows(capability) {
            Ok(())
        } else {
            Err(ExecutionError::CapabilityDenied {
                thought: self.thought.clone(),
                capability: capability.to_string(),
            })
        }
    }
}

/// Owner side of a cancellation signal.
#[derive(Debug)]
pub struct CancelSource {
    tx: watch::Sender<bool>,
}

impl CancelSource {
    /// A fresh, un-fired source.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// A receiver observing this source.
    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            rx: self.tx.subscribe(),
        }
    }

    /// Fire the signal. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Whether the signal has fired.
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver side of a cancellation signal; cheap to clone.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_, rx) = watch::channel(false);
        Self { rx }
    }

    /// Whether the signal has fired.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the signal fires. Pends forever if the source is dropped
    /// without firing.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Everything an executor sees for one attempt.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Owning run.
    pub run_id: RunId,
    /// Node being executed.
    pub node: NodeId,
    /// Thought identity.
    pub thought: ThoughtId,
    /// Opaque body reference.
    pub body: String,
    /// Bound inputs, owned by this attempt.
    pub inputs: Map<String, Value>,
    /// 1-based attempt number.
    pub attempt: u32,
    /// The capability grant for this execution.
    pub grant: SandboxGrant,
    /// Fires when the body should stop (timeout or run cancellation).
    pub cancel: CancelSignal,
}

/// What a successful body returns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionOutput {
    /// The node's output value, checked against its output schema.
    pub value: Value,
    /// Thought definitions this body proposes to add or change.
    pub proposals: Vec<RawDefinition>,
}

impl ExecutionOutput {
    /// An output with no proposals.
    pub fn value(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            proposals: Vec::new(),
        }
    }

    /// Attach a proposed definition.
    pub fn with_proposal(mut self, proposal: RawDefinition) -> Self {
        self.proposals.push(proposal);
        self
    }
}

/// The externally supplied body runner.
///
/// Implementations must honour `ctx.cancel` where they can and must check
/// `ctx.grant` before using a capability-scoped resource.
#[async_trait]
pub trait ThoughtExecutor: Send + Sync {
    /// Run one attempt of a node body.
    async fn run(&self, ctx: ExecutionContext) -> Result<ExecutionOutput, ExecutionError>;
}

/// One execution request handed to the boundary.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// Owning run.
    pub run_id: RunId,
    /// Node being executed.
    pub node: NodeId,
    /// Pinned definition.
    pub definition: Arc<ThoughtDefinition>,
    /// Bound inputs.
    pub inputs: Map<String, Value>,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Run-level cancellation.
    pub cancel: CancelSignal,
}

/// Enforces grants and limits around a [`ThoughtExecutor`].
#[derive(Clone)]
pub struct SandboxBoundary {
    executor: Arc<dyn ThoughtExecutor>,
    policy: CapabilityPolicy,
    default_timeout: Duration,
    grace: Duration,
}

impl fmt::Debug for SandboxBoundary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxBoundary")
            .field("default_timeout", &self.default_timeout)
            .field("grace", &self.grace)
            .finish_non_exhaustive()
    }
}

impl SandboxBoundary {
    /// Create a boundary around `executor`.
    ///
    /// # Arguments
    ///
    /// * `policy`: process-wide capability allow-list grants are narrowed by
    /// * `default_timeout`: limit for thoughts that declare none
    /// * `grace`: cooperative window between the cancel signal and abort
    pub fn new(
        executor: Arc<dyn ThoughtExecutor>,
        policy: CapabilityPolicy,
        default_timeout: Duration,
        grace: Duration,
    ) -> Self {
        Self {
            executor,
            policy,
            default_timeout,
            grace,
        }
    }

    /// The grant a node instantiating `definition` receives.
    pub fn grant_for(&self, definition: &ThoughtDefinition) -> SandboxGrant {
        SandboxGrant::derive(definition, &self.policy, self.default_timeout)
    }

    /// Execute one attempt under `grant`.
    ///
    /// # Returns
    ///
    /// - `Ok(output)` when the body completes within its limit
    /// - `Err(CapabilityDenied)` before the body runs, if the definition
    ///   declares anything the grant does not cover
    /// - `Err(Timeout)` if the limit elapsed; the body has been stopped
    /// - `Err(Cancelled)` if the run was cancelled; the body has been stopped
    /// - `Err(Permanent)` if the body panicked, or whatever error it returned
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub async fn execute(
        &self,
        request: ExecutionRequest,
        grant: &SandboxGrant,
    ) -> Result<ExecutionOutput, ExecutionError> {
        let ExecutionRequest {
            run_id,
            node,
            definition,
            inputs,
            attempt,
            mut cancel,
        } = request;

        if grant.thought != definition.id {
            return Err(ExecutionError::Permanent(format!(
                "grant issued for {} used for {}",
                grant.thought, definition.id
            )));
        }
        if let Some(missing) = definition.capabilities.iter().find(|c| !grant.allows(c)) {
            warn!(
                run_id = %run_id,
                node = %node,
                thought = %definition.id,
                capability = %missing,
                "sandbox: capability denied"
            );
            return Err(ExecutionError::CapabilityDenied {
                thought: definition.id.clone(),
                capability: missing.to_string(),
            });
        }
        if cancel.is_cancelled() {
            return Err(ExecutionError::Cancelled);
        }

        let stop = CancelSource::new();
        let ctx = ExecutionContext {
            run_id,
            node: node.clone(),
            thought: definition.id.clone(),
            body: definition.body.clone(),
            inputs,
            attempt,
            grant: grant.clone(),
            cancel: stop.signal(),
        };

        let executor = Arc::clone(&self.executor);
        let started = Instant::now();
        let mut task = tokio::spawn(async move { executor.run(ctx).await });

        let interrupted = tokio::select! {
            joined = &mut task => {
                return match joined {
                    Ok(result) => result,
                    Err(e) if e.is_panic() => {
                        warn!(node = %node, thought = %definition.id, "sandbox: body panicked");
                        Err(ExecutionError::Permanent("body panicked".to_string()))
                    }
                    Err(_) => Err(ExecutionError::Cancelled),
                };
            }
            _ = tokio::time::sleep(grant.timeout) => ExecutionError::Timeout {
                elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            },
            _ = cancel.cancelled() => ExecutionError::Cancelled,
        };

        stop.cancel();
        if tokio::time::timeout(self.grace, &mut task).await.is_err() {
            debug!(node = %node, thought = %definition.id, "sandbox: grace elapsed, aborting body");
            task.abort();
            let _ = task.await;
        }
        warn!(
            run_id = %run_id,
            node = %node,
            thought = %definition.id,
            error = %interrupted,
            "sandbox: execution interrupted"
        );
        Err(interrupted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thought::{Origin, RawDefinition};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn definition(raw: RawDefinition) -> Arc<ThoughtDefinition> {
        Arc::new(ThoughtDefinition::from_raw(raw, 1, Origin::Registered).expect("valid"))
    }

    fn request(def: &Arc<ThoughtDefinition>, cancel: CancelSignal) -> ExecutionRequest {
        let mut inputs = Map::new();
        inputs.insert("text".to_string(), json!("hi"));
        ExecutionRequest {
            run_id: RunId::new(),
            node: NodeId::new("n"),
            definition: Arc::clone(def),
            inputs,
            attempt: 1,
            cancel,
        }
    }

    fn boundary(executor: Arc<dyn ThoughtExecutor>, policy: CapabilityPolicy) -> SandboxBoundary {
        SandboxBoundary::new(executor, policy, Duration::from_secs(5), Duration::from_millis(50))
    }

    #[test]
    fn test_grant_narrows_to_policy() {
        let def = definition(
            RawDefinition::new("t", "b")
                .with_capability("fs.write:/tmp/a")
                .with_capability("network"),
        );
        let policy = CapabilityPolicy::from_strings(&["fs.write:/tmp"]).expect("valid");
        let grant = SandboxGrant::derive(&def, &policy, Duration::from_secs(1));
        assert_eq!(grant.capabilities().len(), 1);
        assert!(grant.allows(&"fs.write:/tmp/a/b".parse().expect("valid")));
        assert!(grant.require(&Capability::Network).is_err());
        assert_eq!(grant.timeout(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_execute_returns_body_output() {
        let def = definition(RawDefinition::new("echo", "echo"));
        let sandbox = boundary(Arc::new(EchoExecutor), CapabilityPolicy::default());
        let grant = sandbox.grant_for(&def);
        let out = sandbox
            .execute(request(&def, CancelSignal::never()), &grant)
            .await
            .expect("success");
        assert_eq!(out.value, json!({"text": "hi"}));
    }

    #[tokio::test]
    async fn test_denied_capability_never_runs_body() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let executor = FnExecutor::new().with_handler("b", move |_ctx| {
            let flag = Arc::clone(&flag);
            async move {
                flag.store(true, Ordering::SeqCst);
                Ok(ExecutionOutput::value(json!({})))
            }
        });
        let def = definition(RawDefinition::new("t", "b").with_capability("shell.exec"));
        let sandbox = boundary(Arc::new(executor), CapabilityPolicy::default());
        let grant = sandbox.grant_for(&def);
        let err = sandbox
            .execute(request(&def, CancelSignal::never()), &grant)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CapabilityDenied);
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_timeout_stops_uncooperative_body() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        let executor = FnExecutor::new().with_handler("slow", move |_ctx| {
            let flag = Arc::clone(&flag);
            async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                flag.store(true, Ordering::SeqCst);
                Ok(ExecutionOutput::default())
            }
        });
        let def = definition(RawDefinition::new("slow", "slow").with_timeout(Duration::from_millis(50)));
        let sandbox = boundary(Arc::new(executor), CapabilityPolicy::default());
        let grant = sandbox.grant_for(&def);
        let started = Instant::now();
        let err = sandbox
            .execute(request(&def, CancelSignal::never()), &grant)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cooperative_body_sees_cancel_signal() {
        let observed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&observed);
        let executor = FnExecutor::new().with_handler("coop", move |mut ctx| {
            let flag = Arc::clone(&flag);
            async move {
                ctx.cancel.cancelled().await;
                flag.store(true, Ordering::SeqCst);
                Err(ExecutionError::Cancelled)
            }
        });
        let def = definition(RawDefinition::new("coop", "coop").with_timeout(Duration::from_millis(20)));
        let sandbox = boundary(Arc::new(executor), CapabilityPolicy::default());
        let grant = sandbox.grant_for(&def);
        let err = sandbox
            .execute(request(&def, CancelSignal::never()), &grant)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(observed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_run_cancel_interrupts_body() {
        let executor = FnExecutor::new().with_handler("wait", |_ctx| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(ExecutionOutput::default())
        });
        let def = definition(RawDefinition::new("wait", "wait"));
        let sandbox = boundary(Arc::new(executor), CapabilityPolicy::default());
        let grant = sandbox.grant_for(&def);
        let source = CancelSource::new();
        let req = request(&def, source.signal());
        let handle = tokio::spawn(async move { sandbox.execute(req, &grant).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        source.cancel();
        let err = handle.await.expect("join").unwrap_err();
        assert_eq!(err, ExecutionError::Cancelled);
    }

    #[tokio::test]
    async fn test_panicking_body_is_permanent() {
        let executor = FnExecutor::new().with_handler("boom", |ctx| async move {
            if ctx.attempt > 0 {
                panic!("boom");
            }
            Ok(ExecutionOutput::default())
        });
        let def = definition(RawDefinition::new("boom", "boom"));
        let sandbox = boundary(Arc::new(executor), CapabilityPolicy::default());
        let grant = sandbox.grant_for(&def);
        let err = sandbox
            .execute(request(&def, CancelSignal::never()), &grant)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Permanent);
    }

    #[tokio::test]
    async fn test_grant_for_other_thought_rejected() {
        let def = definition(RawDefinition::new("a", "echo"));
        let sandbox = boundary(Arc::new(EchoExecutor), CapabilityPolicy::default());
        let grant = SandboxGrant::new(ThoughtId::new("b", 1), [], Duration::from_secs(1));
        let err = sandbox
            .execute(request(&def, CancelSignal::never()), &grant)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Permanent);
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(ErrorKind::Transient.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(!ErrorKind::Permanent.is_retryable());
        assert!(!ErrorKind::CapabilityDenied.is_retryable());
        assert!(!ErrorKind::Cancelled.is_retryable());
    }
}
