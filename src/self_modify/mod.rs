//! # Self-Modification Pipeline
//!
//! Validates, versions, and atomically publishes new or edited thought
//! definitions without disturbing runs already in flight.
//!
//! ## Module map
//! - [`gate`]: well-formedness, capability, and compatibility checks
//! - [`history`]: bounded log of proposals and their outcomes
//!
//! ## Guarantees
//! - Two-step: `propose` only evaluates; nothing reaches the registry until
//!   `commit` is handed the [`ValidatedDefinition`] a passing report carries
//! - Atomic: commit re-checks compatibility against the chain head and
//!   persists the candidate while holding the registry write lock; readers
//!   see either the old head or the new one
//! - Pinned: runs built before a commit keep their `Arc` to the old version
//! - Conflict-rejecting: of two concurrent edits, both land if each is
//!   compatible with the head it commits on top of; an edit that no longer
//!   fits the head is rejected with [`SelfModifyError::Conflict`], never queued

pub mod gate;
pub mod history;

use crate::metrics;
use crate::registry::{RegistryError, ThoughtRegistry};
use crate::scheduler::events::{EventBus, RunEvent};
use crate::store::{StateStore, StoreError};
use crate::thought::{Origin, RawDefinition, ThoughtDefinition};
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

pub use gate::{CheckOutcome, ValidatedDefinition, ValidationReport};
pub use history::{ModificationLog, ModificationOutcome, ModificationRecord};

// ─── Error ────────────────────────────────────────────────────────────────────

/// Errors produced by the pipeline.
#[derive(Debug, Error)]
pub enum SelfModifyError {
    /// The proposal failed validation.
    #[error("proposal for '{thought}' failed validation: {summary}")]
    Validation {
        /// Thought name.
        thought: String,
        /// Report summary.
        summary: String,
    },

    /// The proposal no longer fits the chain head at commit time.
    #[error("conflicting edit of '{name}' on top of v{head_version}: {reason}")]
    Conflict {
        /// Thought name.
        name: String,
        /// Head version the edit collided with.
        head_version: u32,
        /// Compatibility issues.
        reason: String,
    },

    /// The registry refused the definition.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The definition could not be persisted; nothing was published.
    #[error(transparent)]
    Store(#[from] StoreError),
}

// ─── Pipeline ─────────────────────────────────────────────────────────────────

/// Validates and commits thought definitions into a shared registry.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use thought_orchestrator::registry::ThoughtRegistry;
/// use thought_orchestrator::scheduler::events::EventBus;
/// use thought_orchestrator::self_modify::SelfModificationPipeline;
/// use thought_orchestrator::store::MemoryStore;
/// use thought_orchestrator::thought::{CapabilityPolicy, RawDefinition};
///
/// let registry = Arc::new(ThoughtRegistry::new(CapabilityPolicy::default()));
/// let pipeline = SelfModificationPipeline::new(
///     Arc::clone(&registry),
///     Arc::new(MemoryStore::new()),
///     EventBus::new(16),
/// );
/// let report = pipeline.propose(RawDefinition::new("greet", "echo hello"));
/// assert!(report.overall_pass);
/// let committed = pipeline.commit(report.into_validated().unwrap()).unwrap();
/// assert_eq!(committed.id.version, 1);
/// assert!(!registry.is_trusted(&committed.id));
/// ```
#[derive(Debug, Clone)]
pub struct SelfModificationPipeline {
    registry: Arc<ThoughtRegistry>,
    store: Arc<dyn StateStore>,
    events: EventBus,
    history: ModificationLog,
}

impl SelfModificationPipeline {
    /// Create a pipeline committing into `registry` and persisting to `store`.
    pub fn new(registry: Arc<ThoughtRegistry>, store: Arc<dyn StateStore>, events: EventBus) -> Self {
        Self {
            registry,
            store,
            events,
            history: ModificationLog::default(),
        }
    }

    /// The registry commits land in.
    pub fn registry(&self) -> &Arc<ThoughtRegistry> {
        &self.registry
    }

    /// Proposal history.
    pub fn history(&self) -> &ModificationLog {
        &self.history
    }

    /// Evaluate a thought-authored proposal. Committed versions start untrusted.
    pub fn propose(&self, raw: RawDefinition) -> ValidationReport {
        self.propose_with_origin(raw, Origin::SelfModified)
    }

    /// Evaluate a proposal with an explicit authoring origin.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn propose_with_origin(&self, raw: RawDefinition, origin: Origin) -> ValidationReport {
        let head = self.registry.resolve(&raw.name, None).ok();
        let report = gate::evaluate(raw, origin, self.registry.policy(), head.as_deref());
        self.history.record(ModificationRecord {
            proposal_id: report.proposal_id,
            thought: report.thought.clone(),
            origin,
            base_version: report.base_version,
            outcome: if report.overall_pass {
                ModificationOutcome::Validated
            } else {
                ModificationOutcome::ValidationFailed
            },
            summary: report.summary.clone(),
            created_at: report.evaluated_at,
        });
        if report.overall_pass {
            info!(thought = %report.thought, origin = %origin, "self_modify: proposal validated");
        } else {
            warn!(thought = %report.thought, summary = %report.summary, "self_modify: proposal rejected");
        }
        report
    }

    /// Publish a validated definition as the new head of its chain.
    ///
    /// # Returns
    ///
    /// - `Ok(definition)` with the newly assigned version
    /// - `Err(Conflict)` if the head changed incompatibly since `propose`
    /// - `Err(Store)` if persistence failed; nothing was published
    /// - `Err(Registry)` if the registry refused the definition
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn commit(&self, validated: ValidatedDefinition) -> Result<Arc<ThoughtDefinition>, SelfModifyError> {
        let ValidatedDefinition {
            proposal_id,
            raw,
            origin,
            ..
        } = validated;
        let name = raw.name.clone();

        let mut conflict: Option<(u32, String)> = None;
        let mut store_failure: Option<StoreError> = None;
        let result = self.registry.register_with(raw, origin, |head, candidate| {
            if let Some(head) = head {
                let issues = gate::compatibility_issues(
                    &head.inputs,
                    &head.outputs,
                    &candidate.inputs,
                    &candidate.outputs,
                );
                if !issues.is_empty() {
                    let reason = issues.join("; ");
                    conflict = Some((head.id.version, reason.clone()));
                    return Err(reason);
                }
            }
            if let Err(e) = self.store.put_definition(candidate) {
                let reason = e.to_string();
                store_failure = Some(e);
                return Err(reason);
            }
            Ok(())
        });

        match result {
            Ok(definition) => {
                self.history.update(
                    proposal_id,
                    ModificationOutcome::Committed {
                        version: definition.id.version,
                    },
                    None,
                );
                metrics::record_commit(&origin.to_string());
                info!(thought = %definition.id, origin = %origin, "self_modify: committed");
                self.events.publish(RunEvent::ThoughtCommitted {
                    id: definition.id.clone(),
                    origin,
                    committed_at: Utc::now(),
                });
                Ok(definition)
            }
            Err(e) => {
                let err = if let Some(source) = store_failure {
                    SelfModifyError::Store(source)
                } else if let Some((head_version, reason)) = conflict {
                    SelfModifyError::Conflict {
                        name,
                        head_version,
                        reason,
                    }
                } else {
                    SelfModifyError::Registry(e)
                };
                let outcome = match err {
                    SelfModifyError::Conflict { .. } => ModificationOutcome::Conflict,
                    _ => ModificationOutcome::Failed,
                };
                self.history.update(proposal_id, outcome, Some(err.to_string()));
                warn!(error = %err, "self_modify: commit failed");
                Err(err)
            }
        }
    }

    /// Propose and, if the report passes, commit in one step.
    ///
    /// # Errors
    ///
    /// [`SelfModifyError::Validation`] if the report fails, otherwise as
    /// [`SelfModificationPipeline::commit`].
    pub fn propose_and_commit(
        &self,
        raw: RawDefinition,
        origin: Origin,
    ) -> Result<Arc<ThoughtDefinition>, SelfModifyError> {
        let report = self.propose_with_origin(raw, origin);
        let thought = report.thought.clone();
        let summary = report.summary.clone();
        match report.into_validated() {
            Some(validated) => self.commit(validated),
            None => Err(SelfModifyError::Validation { thought, summary }),
        }
    }

    /// Record that a human rejected a proposal at the approval gate.
    pub fn mark_rejected(&self, proposal_id: uuid::Uuid) {
        self.history
            .update(proposal_id, ModificationOutcome::Rejected, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::thought::{CapabilityPolicy, Schema, ValueType};

    fn pipeline() -> (SelfModificationPipeline, Arc<MemoryStore>) {
        let registry = Arc::new(ThoughtRegistry::new(
            CapabilityPolicy::from_strings(&["llm.call"]).expect("valid"),
        ));
        let store = Arc::new(MemoryStore::new());
        let store_dyn: Arc<dyn StateStore> = Arc::clone(&store) as Arc<dyn StateStore>;
        (SelfModificationPipeline::new(registry, store_dyn, EventBus::new(16)), store)
    }

    fn v1() -> RawDefinition {
        RawDefinition::new("reply", "reply_v1")
            .with_inputs(Schema::new().with_field("text", ValueType::String))
            .with_outputs(Schema::new().with_field("reply", ValueType::String))
            .with_capability("llm.call")
    }

    #[test]
    fn test_commit_persists_and_marks_untrusted() {
        let (pipeline, store) = pipeline();
        let report = pipeline.propose(v1());
        let def = pipeline
            .commit(report.into_validated().expect("validated"))
            .expect("commit");
        assert_eq!(def.id.version, 1);
        assert_eq!(def.origin, Origin::SelfModified);
        assert!(!pipeline.registry().is_trusted(&def.id));
        assert!(store.get_definition("reply", 1).expect("get").is_some());
        assert!(matches!(
            pipeline.history().records()[0].outcome,
            ModificationOutcome::Committed { version: 1 }
        ));
    }

    #[test]
    fn test_human_edit_is_trusted() {
        let (pipeline, _) = pipeline();
        let def = pipeline
            .propose_and_commit(v1(), Origin::HumanEdit)
            .expect("commit");
        assert!(pipeline.registry().is_trusted(&def.id));
    }

    #[test]
    fn test_failed_validation_never_reaches_registry() {
        let (pipeline, _) = pipeline();
        let err = pipeline
            .propose_and_commit(v1().with_capability("shell.exec"), Origin::SelfModified)
            .unwrap_err();
        assert!(matches!(err, SelfModifyError::Validation { .. }));
        assert!(pipeline.registry().resolve("reply", None).is_err());
    }

    #[test]
    fn test_compatible_concurrent_edits_both_land() {
        let (pipeline, _) = pipeline();
        pipeline.propose_and_commit(v1(), Origin::Registered).expect("v1");
        let a = pipeline.propose(v1().describe("edit a")).into_validated().expect("a");
        let b = pipeline.propose(v1().describe("edit b")).into_validated().expect("b");
        assert_eq!(pipeline.commit(a).expect("a").id.version, 2);
        let latest = pipeline.commit(b).expect("b");
        assert_eq!(latest.id.version, 3);
        assert_eq!(
            pipeline.registry().resolve("reply", None).expect("resolve").description,
            "edit b"
        );
    }

    #[test]
    fn test_incompatible_edit_after_head_moved_conflicts() {
        let (pipeline, _) = pipeline();
        pipeline.propose_and_commit(v1(), Origin::Registered).expect("v1");
        // Validated against v1, which has no `tone` output.
        let stale = pipeline.propose(v1().describe("stale")).into_validated().expect("stale");
        let extended = v1().with_outputs(
            Schema::new()
                .with_field("reply", ValueType::String)
                .with_field("tone", ValueType::String),
        );
        pipeline.propose_and_commit(extended, Origin::Registered).expect("v2");
        let err = pipeline.commit(stale).unwrap_err();
        assert!(
            matches!(err, SelfModifyError::Conflict { head_version: 2, .. }),
            "{err}"
        );
        assert_eq!(
            pipeline.registry().resolve("reply", None).expect("resolve").id.version,
            2
        );
    }

    #[test]
    fn test_pinned_arc_survives_commit() {
        let (pipeline, _) = pipeline();
        pipeline.propose_and_commit(v1(), Origin::Registered).expect("v1");
        let pinned = pipeline.registry().resolve("reply", None).expect("resolve");
        pipeline
            .propose_and_commit(v1().describe("v2"), Origin::SelfModified)
            .expect("v2");
        assert_eq!(pinned.id.version, 1);
        assert_eq!(pinned.body, "reply_v1");
    }
}
