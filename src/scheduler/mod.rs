//! # Execution Scheduler
//!
//! ## Responsibility
//! Own the engine's shared components (registry, approval gate,
//! self-modification pipeline, sandbox, worker pool, event bus, store) and
//! admit runs: directly via [`Engine::submit`] or through a [`Trigger`].
//!
//! ## Guarantees
//! - Bounded concurrency: at most `worker_pool_size` node bodies execute at
//!   once across every run of the engine
//! - Run independence: each run owns its node state; runs share only the
//!   registry, whose versions a built graph has already pinned
//! - Observable: every state change is published on the [`EventBus`]
//!
//! ## NOT Responsible For
//! - Deciding approvals (humans do, through [`Engine::resolve_approval`])
//! - Executing bodies (see: `sandbox`)

pub mod events;
pub mod node;
pub mod retry;
pub mod run;
pub mod trigger;

pub use events::{EventBus, RunEvent};
pub use node::{FailureKind, FailureRecord, NodeReport, NodeState};
pub use retry::{RetryPolicy, RetryStrategy};
pub use run::{RunHandle, RunReport, RunStatus};
pub use trigger::{EventPredicate, ExternalEvent, Trigger, TriggerHandle};

use crate::approval::{ApprovalError, ApprovalGate, ApprovalSubject, Decision, RequestId};
use crate::config::validation::{self, ConfigError};
use crate::config::{EngineConfig, RetryDefaults};
use crate::graph::{self, GraphError, RunId, WorkflowGraph, WorkflowSpec};
use crate::registry::ThoughtRegistry;
use crate::sandbox::{SandboxBoundary, ThoughtExecutor};
use crate::self_modify::SelfModificationPipeline;
use crate::store::{FileStore, MemoryStore, StateStore, StoreError};
use crate::thought::{Origin, RawDefinition, ThoughtId};
use crate::EngineError;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, Semaphore};
use tracing::{debug, info};

/// Components every run and trigger of one engine shares.
pub(crate) struct EngineShared {
    pub(crate) registry: Arc<ThoughtRegistry>,
    pub(crate) approvals: Arc<ApprovalGate>,
    pub(crate) pipeline: SelfModificationPipeline,
    pub(crate) sandbox: SandboxBoundary,
    pub(crate) slots: Arc<Semaphore>,
    pub(crate) events: EventBus,
    pub(crate) store: Arc<dyn StateStore>,
    pub(crate) retry_defaults: RetryDefaults,
}

/// The thought orchestration engine.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use thought_orchestrator::config::EngineConfig;
/// use thought_orchestrator::graph::{Binding, NodeSpec, WorkflowSpec};
/// use thought_orchestrator::sandbox::EchoExecutor;
/// use thought_orchestrator::scheduler::Engine;
/// use thought_orchestrator::thought::RawDefinition;
///
/// # async fn demo() -> Result<(), thought_orchestrator::EngineError> {
/// let engine = Engine::new(EngineConfig::default(), Arc::new(EchoExecutor))?;
/// engine.define(RawDefinition::new("echo", "echo"))?;
/// let spec = WorkflowSpec::new("demo")
///     .node(NodeSpec::new("a", "echo").input("x", Binding::literal(1)));
/// let report = engine.submit(&spec)?.wait().await;
/// println!("{}", report.status);
/// # Ok(()) }
/// ```
pub struct Engine {
    config: Arc<EngineConfig>,
    shared: Arc<EngineShared>,
    external: broadcast::Sender<ExternalEvent>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("worker_pool_size", &self.config.worker_pool_size)
            .field("thoughts", &self.shared.registry.len())
            .field("pending_approvals", &self.shared.approvals.pending_count())
            .finish()
    }
}

impl Engine {
    /// Build an engine from a validated configuration.
    ///
    /// Persistence goes to a [`FileStore`] under `state_dir` when set, to a
    /// [`MemoryStore`] otherwise.
    ///
    /// # Errors
    ///
    /// [`EngineError::Config`] if the configuration is invalid,
    /// [`EngineError::Store`] if the state directory cannot be opened.
    pub fn new(config: EngineConfig, executor: Arc<dyn ThoughtExecutor>) -> Result<Self, EngineError> {
        let store: Arc<dyn StateStore> = match &config.state_dir {
            Some(dir) => Arc::new(FileStore::open(dir)?),
            None => Arc::new(MemoryStore::new()),
        };
        Self::with_store(config, executor, store)
    }

    /// Build an engine persisting to `store`.
    ///
    /// # Errors
    ///
    /// [`EngineError::Config`] if the configuration is invalid.
    pub fn with_store(
        config: EngineConfig,
        executor: Arc<dyn ThoughtExecutor>,
        store: Arc<dyn StateStore>,
    ) -> Result<Self, EngineError> {
        validation::validate(&config).map_err(|errors| {
            ConfigError::Validation(
                errors
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("\n"),
            )
        })?;
        let policy = config.capability_policy().map_err(|errors| {
            ConfigError::Validation(
                errors
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("\n"),
            )
        })?;

        let events = EventBus::new(config.event_buffer);
        let registry = Arc::new(ThoughtRegistry::new(policy.clone()));
        let pipeline =
            SelfModificationPipeline::new(Arc::clone(&registry), Arc::clone(&store), events.clone());
        let sandbox = SandboxBoundary::new(
            executor,
            policy,
            config.default_timeout(),
            config.cancel_grace(),
        );
        let shared = Arc::new(EngineShared {
            registry,
            approvals: Arc::new(ApprovalGate::new()),
            pipeline,
            sandbox,
            slots: Arc::new(Semaphore::new(config.worker_pool_size)),
            events,
            store,
            retry_defaults: config.retry,
        });
        let (external, _) = broadcast::channel(config.event_buffer.max(1));
        info!(
            worker_pool_size = config.worker_pool_size,
            capabilities = ?config.allowed_capabilities,
            "engine: started"
        );
        Ok(Self {
            config: Arc::new(config),
            shared,
            external,
        })
    }

    /// Reload persisted definitions into the registry.
    ///
    /// Versions already present are skipped. Returns how many were restored.
    ///
    /// # Errors
    ///
    /// [`EngineError::Store`] if the store cannot be read,
    /// [`EngineError::Registry`] if a chain has a gap.
    pub fn restore(&self) -> Result<usize, EngineError> {
        let mut restored = 0;
        for definition in self.shared.store.list_definitions()? {
            let present = self
                .shared
                .registry
                .latest_version(&definition.id.name)
                .unwrap_or(0);
            if definition.id.version <= present {
                continue;
            }
            self.shared.registry.restore(definition)?;
            restored += 1;
        }
        info!(restored, "engine: restored definitions");
        Ok(restored)
    }

    /// The immutable process configuration.
    pub fn config(&self) -> &Arc<EngineConfig> {
        &self.config
    }

    /// The thought registry.
    pub fn registry(&self) -> &Arc<ThoughtRegistry> {
        &self.shared.registry
    }

    /// The approval gate.
    pub fn approvals(&self) -> &Arc<ApprovalGate> {
        &self.shared.approvals
    }

    /// The self-modification pipeline.
    pub fn pipeline(&self) -> &SelfModificationPipeline {
        &self.shared.pipeline
    }

    /// The persistence store.
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.shared.store
    }

    /// Define (or add a version of) a thought authored by an operator.
    ///
    /// Goes through the same validation and compatibility checks as a
    /// self-modification, but the committed version is trusted.
    ///
    /// Blocks the calling thread while the store persists the version. From
    /// async code on a busy runtime, call it inside
    /// [`tokio::task::spawn_blocking`].
    ///
    /// # Errors
    ///
    /// [`EngineError::SelfModify`] if validation or the commit fails.
    pub fn define(&self, raw: RawDefinition) -> Result<ThoughtId, EngineError> {
        let definition = self
            .shared
            .pipeline
            .propose_and_commit(raw, Origin::Registered)?;
        Ok(definition.id.clone())
    }

    /// Define `raw` unless the trusted head of its chain already matches it.
    ///
    /// Returns `None` when the head was kept. Lets a process re-declare its
    /// thoughts after [`Engine::restore`] without growing every chain by one
    /// version per restart. Blocks like [`Engine::define`].
    ///
    /// # Errors
    ///
    /// As [`Engine::define`].
    pub fn define_if_changed(&self, raw: RawDefinition) -> Result<Option<ThoughtId>, EngineError> {
        let registry = &self.shared.registry;
        if let Ok(head) = registry.resolve(&raw.name, None) {
            if registry.is_trusted(&head.id) && head.to_raw() == raw {
                debug!(thought = %head.id, "engine: definition unchanged");
                return Ok(None);
            }
        }
        self.define(raw).map(Some)
    }

    /// Build `spec` against the registry as it is now.
    ///
    /// # Errors
    ///
    /// Any [`GraphError`] from graph construction.
    pub fn build(&self, spec: &WorkflowSpec) -> Result<WorkflowGraph, GraphError> {
        graph::build(spec, self.shared.registry.as_ref())
    }

    /// Build `spec` and start it as a new run.
    ///
    /// # Errors
    ///
    /// Any [`GraphError`] from graph construction; no run is started.
    pub fn submit(&self, spec: &WorkflowSpec) -> Result<RunHandle, GraphError> {
        Ok(self.submit_graph(self.build(spec)?))
    }

    /// Start an already built graph as a new run.
    pub fn submit_graph(&self, graph: WorkflowGraph) -> RunHandle {
        run::spawn(Arc::clone(&self.shared), graph)
    }

    /// Arm `trigger` to run `spec` each time it fires.
    pub fn schedule(&self, trigger: Trigger, spec: WorkflowSpec) -> TriggerHandle {
        trigger::arm(
            Arc::clone(&self.shared),
            trigger,
            spec,
            self.external.subscribe(),
        )
    }

    /// Deliver an external event to event-driven triggers.
    ///
    /// Returns how many armed triggers received it.
    pub fn publish_event(&self, event: ExternalEvent) -> usize {
        self.external.send(event).unwrap_or(0)
    }

    /// Record a human decision.
    ///
    /// An `Edit` must keep the name of the thought under review.
    ///
    /// # Errors
    ///
    /// [`ApprovalError::InvalidEdit`] for an edit renaming the thought,
    /// otherwise as [`ApprovalGate::resolve`].
    pub fn resolve_approval(&self, id: RequestId, decision: Decision) -> Result<(), ApprovalError> {
        if let (Decision::Edit(raw), Some(request)) = (&decision, self.shared.approvals.get(id)) {
            let expected = match &request.subject {
                ApprovalSubject::Node { thought, .. } => thought.name.as_str(),
                ApprovalSubject::Modification { thought, .. } => thought.as_str(),
            };
            if raw.name != expected {
                return Err(ApprovalError::InvalidEdit {
                    id,
                    reason: format!("edit renames '{expected}' to '{}'", raw.name),
                });
            }
        }
        self.shared.approvals.resolve(id, decision)
    }

    /// Subscribe to the run status stream.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.shared.events.subscribe()
    }

    /// A finished run's report.
    ///
    /// # Errors
    ///
    /// [`StoreError`] if the record exists but cannot be read.
    pub fn run(&self, run_id: RunId) -> Result<Option<RunReport>, StoreError> {
        self.shared.store.get_run(run_id)
    }

    /// Worker slots currently free.
    pub fn available_workers(&self) -> usize {
        self.shared.slots.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::EchoExecutor;

    fn engine() -> Engine {
        Engine::new(EngineConfig::default(), Arc::new(EchoExecutor)).expect("test: engine")
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = EngineConfig::default().with_worker_pool_size(0);
        assert!(matches!(
            Engine::new(config, Arc::new(EchoExecutor)),
            Err(EngineError::Config(_))
        ));
        let config = EngineConfig::default().with_capabilities(["teleport"]);
        assert!(Engine::new(config, Arc::new(EchoExecutor)).is_err());
    }

    #[tokio::test]
    async fn test_define_registers_trusted_version() {
        let engine = engine();
        let id = engine.define(RawDefinition::new("echo", "echo")).expect("test: define");
        assert_eq!(id, ThoughtId::new("echo", 1));
        assert!(engine.registry().is_trusted(&id));
        assert!(engine.store().get_definition("echo", 1).expect("test: store").is_some());
    }

    #[tokio::test]
    async fn test_define_rejects_capability_outside_policy() {
        let engine = engine();
        let err = engine
            .define(RawDefinition::new("sh", "ls").with_capability("shell.exec"))
            .expect_err("test: policy");
        assert!(matches!(err, EngineError::SelfModify(_)));
    }

    #[tokio::test]
    async fn test_restore_from_store() {
        let dir = tempfile::tempdir().expect("test: tempdir");
        let config = EngineConfig {
            state_dir: Some(dir.path().to_path_buf()),
            ..EngineConfig::default()
        };
        let first = Engine::new(config.clone(), Arc::new(EchoExecutor)).expect("test: engine");
        first.define(RawDefinition::new("a", "a")).expect("test: define");
        first.define(RawDefinition::new("a", "a2")).expect("test: define");

        let second = Engine::new(config, Arc::new(EchoExecutor)).expect("test: engine");
        assert_eq!(second.restore().expect("test: restore"), 2);
        assert_eq!(second.registry().latest_version("a"), Some(2));
        assert!(second.registry().is_trusted(&ThoughtId::new("a", 2)));
        assert_eq!(second.restore().expect("test: restore again"), 0);
    }

    #[tokio::test]
    async fn test_redeclaring_after_restore_keeps_unchanged_heads() {
        let dir = tempfile::tempdir().expect("test: tempdir");
        let config = EngineConfig {
            state_dir: Some(dir.path().to_path_buf()),
            ..EngineConfig::default()
        };
        let declared = RawDefinition::new("a", "a").describe("first");
        let first = Engine::new(config.clone(), Arc::new(EchoExecutor)).expect("test: engine");
        assert_eq!(
            first.define_if_changed(declared.clone()).expect("test: define"),
            Some(ThoughtId::new("a", 1))
        );

        let second = Engine::new(config, Arc::new(EchoExecutor)).expect("test: engine");
        assert_eq!(second.restore().expect("test: restore"), 1);
        assert_eq!(second.define_if_changed(declared.clone()).expect("test: same"), None);
        assert_eq!(second.registry().latest_version("a"), Some(1));

        let changed = RawDefinition { body: "a2".to_string(), ..declared };
        assert_eq!(
            second.define_if_changed(changed).expect("test: changed"),
            Some(ThoughtId::new("a", 2))
        );
    }

    #[tokio::test]
    async fn test_untrusted_head_is_redefined_even_when_equal() {
        let engine = engine();
        let raw = RawDefinition::new("b", "b");
        engine
            .pipeline()
            .propose_and_commit(raw.clone(), Origin::SelfModified)
            .expect("test: self-modified");
        assert_eq!(
            engine.define_if_changed(raw).expect("test: define"),
            Some(ThoughtId::new("b", 2))
        );
        assert!(engine.registry().is_trusted(&ThoughtId::new("b", 2)));
    }

    #[tokio::test]
    async fn test_edit_must_keep_name() {
        let engine = engine();
        let (request, _rx) = engine.approvals().request_approval(
            ApprovalSubject::Modification {
                run_id: None,
                proposed_by: None,
                thought: "summarise".to_string(),
            },
            "define summarise".to_string(),
            Vec::new(),
        );
        let err = engine
            .resolve_approval(request.id, Decision::Edit(RawDefinition::new("other", "b")))
            .expect_err("test: rename");
        assert!(matches!(err, ApprovalError::InvalidEdit { .. }));
        assert!(engine.resolve_approval(request.id, Decision::Approve).is_ok());
    }

    #[tokio::test]
    async fn test_malformed_edit_is_left_to_the_pipeline() {
        let engine = engine();
        let (request, rx) = engine.approvals().request_approval(
            ApprovalSubject::Modification {
                run_id: None,
                proposed_by: None,
                thought: "summarise".to_string(),
            },
            "define summarise".to_string(),
            Vec::new(),
        );
        let malformed = RawDefinition::new("summarise", "");
        engine
            .resolve_approval(request.id, Decision::Edit(malformed.clone()))
            .expect("test: same-name edit recorded");
        assert_eq!(rx.await.expect("test: decision"), Decision::Edit(malformed));
        assert!(matches!(
            engine.resolve_approval(request.id, Decision::Approve),
            Err(ApprovalError::AlreadyResolved { .. })
        ));
    }

    #[tokio::test]
    async fn test_publish_event_without_triggers() {
        let engine = engine();
        assert_eq!(engine.publish_event(ExternalEvent::new("x", serde_json::Value::Null)), 0);
    }
}
