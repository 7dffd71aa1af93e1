//! # Validation Gate
//!
//! Checks every proposed thought definition before it may be committed:
//! 1. `well_formed`: name, body, schema field names, capability syntax,
//!    retry and timeout bounds
//! 2. `capabilities`: every declared capability is inside the process-wide
//!    allow-list
//! 3. `compatibility`: the proposal can replace the current head of its
//!    version chain without breaking workflows that bind to it
//!
//! A passing report carries a [`ValidatedDefinition`], the only value the
//! pipeline's `commit` accepts. Compatibility is checked again at commit time
//! against whatever the head is then.

use crate::thought::{CapabilityPolicy, Origin, RawDefinition, Schema, ThoughtDefinition};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Check name: definition well-formedness.
pub const CHECK_WELL_FORMED: &str = "well_formed";
/// Check name: capability allow-list.
pub const CHECK_CAPABILITIES: &str = "capabilities";
/// Check name: compatibility with the chain head.
pub const CHECK_COMPATIBILITY: &str = "compatibility";

// ─── Outcomes ─────────────────────────────────────────────────────────────────

/// Outcome of a single check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum CheckOutcome {
    /// The check passed.
    Pass,
    /// The check failed with a description.
    Fail(String),
    /// The check did not apply (e.g. first version of a thought).
    Skipped(String),
}

impl CheckOutcome {
    /// Return `true` if the check did not fail.
    pub fn is_ok(&self) -> bool {
        !matches!(self, CheckOutcome::Fail(_))
    }

    fn from_issues(issues: Vec<String>) -> Self {
        if issues.is_empty() {
            Self::Pass
        } else {
            Self::Fail(issues.join("; "))
        }
    }
}

/// A definition that passed every check. Only the gate constructs these.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedDefinition {
    pub(crate) proposal_id: Uuid,
    pub(crate) raw: RawDefinition,
    pub(crate) origin: Origin,
    pub(crate) base_version: Option<u32>,
}

impl ValidatedDefinition {
    /// The proposal this came from.
    pub fn proposal_id(&self) -> Uuid {
        self.proposal_id
    }

    /// The validated definition.
    pub fn definition(&self) -> &RawDefinition {
        &self.raw
    }

    /// Authoring origin the committed version will carry.
    pub fn origin(&self) -> Origin {
        self.origin
    }

    /// Head version the proposal was checked against.
    pub fn base_version(&self) -> Option<u32> {
        self.base_version
    }
}

/// Results of every check applied to one proposal.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    /// Unique id of the proposal.
    pub proposal_id: Uuid,
    /// Thought name as proposed.
    pub thought: String,
    /// Authoring origin.
    pub origin: Origin,
    /// Head version at evaluation time, if the thought exists.
    pub base_version: Option<u32>,
    /// Results keyed by check name.
    pub checks: BTreeMap<String, CheckOutcome>,
    /// Whether every check passed or was skipped.
    pub overall_pass: bool,
    /// Human-readable summary.
    pub summary: String,
    /// When evaluation completed.
    pub evaluated_at: DateTime<Utc>,
    #[serde(skip)]
    validated: Option<ValidatedDefinition>,
}

impl ValidationReport {
    /// Return `true` if a specific check passed.
    pub fn check_passed(&self, name: &str) -> bool {
        matches!(self.checks.get(name), Some(CheckOutcome::Pass))
    }

    /// The committable definition, if the proposal passed.
    pub fn validated(&self) -> Option<&ValidatedDefinition> {
        self.validated.as_ref()
    }

    /// Consume the report, yielding the committable definition if it passed.
    pub fn into_validated(self) -> Option<ValidatedDefinition> {
        self.validated
    }
}

// ─── Checks ───────────────────────────────────────────────────────────────────

/// Evaluate `raw` against `policy` and the current chain `head`.
///
/// # Panics
///
/// This function never panics.
pub fn evaluate(
    raw: RawDefinition,
    origin: Origin,
    policy: &CapabilityPolicy,
    head: Option<&ThoughtDefinition>,
) -> ValidationReport {
    let mut checks = BTreeMap::new();

    checks.insert(
        CHECK_WELL_FORMED.to_string(),
        CheckOutcome::from_issues(raw.issues()),
    );

    let capabilities = match raw.parsed_capabilities() {
        Some(parsed) => CheckOutcome::from_issues(
            parsed
                .iter()
                .filter(|c| !policy.permits(c))
                .map(|c| format!("capability '{c}' is not allowed by policy"))
                .collect(),
        ),
        None => CheckOutcome::Skipped("capabilities did not parse".to_string()),
    };
    checks.insert(CHECK_CAPABILITIES.to_string(), capabilities);

    let compatibility = match head {
        Some(head) => CheckOutcome::from_issues(compatibility_issues(
            &head.inputs,
            &head.outputs,
            &raw.inputs,
            &raw.outputs,
        )),
        None => CheckOutcome::Skipped("no existing version".to_string()),
    };
    checks.insert(CHECK_COMPATIBILITY.to_string(), compatibility);

    let overall_pass = checks.values().all(CheckOutcome::is_ok);
    let failed: Vec<&str> = checks
        .iter()
        .filter(|(_, o)| !o.is_ok())
        .map(|(k, _)| k.as_str())
        .collect();
    let base_version = head.map(|h| h.id.version);
    let summary = if overall_pass {
        match base_version {
            Some(v) => format!("'{}' may replace v{v}", raw.name),
            None => format!("'{}' may be defined", raw.name),
        }
    } else {
        format!("'{}' failed: {}", raw.name, failed.join(", "))
    };

    let proposal_id = Uuid::new_v4();
    let thought = raw.name.clone();
    let validated = overall_pass.then(|| ValidatedDefinition {
        proposal_id,
        raw,
        origin,
        base_version,
    });

    ValidationReport {
        proposal_id,
        thought,
        origin,
        base_version,
        checks,
        overall_pass,
        summary,
        evaluated_at: Utc::now(),
        validated,
    }
}

/// Every way replacing a version with schemas `head_*` by one with `new_*`
/// would break existing bindings.
///
/// - every head input is still declared, accepts what it accepted before, and
///   does not become required if it was optional
/// - every input the new version adds is optional
/// - every head output is still declared, still fits its old type, and stays
///   required if it was required
///
/// # Panics
///
/// This function never panics.
pub fn compatibility_issues(
    head_inputs: &Schema,
    head_outputs: &Schema,
    new_inputs: &Schema,
    new_outputs: &Schema,
) -> Vec<String> {
    let mut issues = Vec::new();

    for (name, old) in head_inputs.fields() {
        match new_inputs.field(name) {
            None => issues.push(format!("input '{name}' removed")),
            Some(new) => {
                if !new.ty.accepts(old.ty) {
                    issues.push(format!("input '{name}' narrowed from {} to {}", old.ty, new.ty));
                }
                if new.required && !old.required {
                    issues.push(format!("input '{name}' became required"));
                }
            }
        }
    }
    for (name, new) in new_inputs.fields() {
        if head_inputs.field(name).is_none() && new.required {
            issues.push(format!("new input '{name}' must be optional"));
        }
    }

    for (name, old) in head_outputs.fields() {
        match new_outputs.field(name) {
            None => issues.push(format!("output '{name}' removed")),
            Some(new) => {
                if !old.ty.accepts(new.ty) {
                    issues.push(format!("output '{name}' changed from {} to {}", old.ty, new.ty));
                }
                if old.required && !new.required {
                    issues.push(format!("output '{name}' became optional"));
                }
            }
        }
    }

    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thought::ValueType;

    fn head() -> ThoughtDefinition {
        ThoughtDefinition::from_raw(
            RawDefinition::new("summarise", "v1")
                .with_inputs(
                    Schema::new()
                        .with_field("text", ValueType::String)
                        .with_optional("style", ValueType::String),
                )
                .with_outputs(Schema::new().with_field("summary", ValueType::String)),
            1,
            Origin::Registered,
        )
        .expect("valid")
    }

    fn policy() -> CapabilityPolicy {
        CapabilityPolicy::from_strings(&["llm.call"]).expect("valid")
    }

    #[test]
    fn test_new_thought_skips_compatibility() {
        let report = evaluate(RawDefinition::new("fresh", "b"), Origin::SelfModified, &policy(), None);
        assert!(report.overall_pass);
        assert_eq!(
            report.checks.get(CHECK_COMPATIBILITY),
            Some(&CheckOutcome::Skipped("no existing version".to_string()))
        );
        assert!(report.validated().is_some());
        assert_eq!(report.base_version, None);
    }

    #[test]
    fn test_compatible_extension_passes() {
        let raw = head()
            .to_raw()
            .with_inputs(
                Schema::new()
                    .with_field("text", ValueType::String)
                    .with_optional("style", ValueType::String)
                    .with_optional("max_words", ValueType::Integer),
            )
            .with_outputs(
                Schema::new()
                    .with_field("summary", ValueType::String)
                    .with_optional("keywords", ValueType::Array),
            );
        let h = head();
        let report = evaluate(raw, Origin::SelfModified, &policy(), Some(&h));
        assert!(report.overall_pass, "{}", report.summary);
        assert_eq!(report.base_version, Some(1));
    }

    #[test]
    fn test_breaking_changes_fail() {
        let raw = RawDefinition::new("summarise", "v2")
            .with_inputs(
                Schema::new()
                    .with_field("text", ValueType::Integer)
                    .with_field("style", ValueType::String)
                    .with_field("lang", ValueType::String),
            )
            .with_outputs(Schema::new());
        let h = head();
        let report = evaluate(raw, Origin::SelfModified, &policy(), Some(&h));
        assert!(!report.overall_pass);
        let Some(CheckOutcome::Fail(detail)) = report.checks.get(CHECK_COMPATIBILITY) else {
            panic!("expected compatibility failure");
        };
        assert!(detail.contains("narrowed"));
        assert!(detail.contains("became required"));
        assert!(detail.contains("must be optional"));
        assert!(detail.contains("removed"));
        assert!(report.into_validated().is_none());
    }

    #[test]
    fn test_capability_outside_policy_fails() {
        let raw = RawDefinition::new("shell", "b").with_capability("shell.exec");
        let report = evaluate(raw, Origin::SelfModified, &policy(), None);
        assert!(!report.overall_pass);
        assert!(!report.check_passed(CHECK_CAPABILITIES));
        assert!(report.summary.contains(CHECK_CAPABILITIES));
    }

    #[test]
    fn test_malformed_fails_and_skips_capabilities() {
        let raw = RawDefinition::new("bad name", "b").with_capability("teleport");
        let report = evaluate(raw, Origin::SelfModified, &policy(), None);
        assert!(!report.check_passed(CHECK_WELL_FORMED));
        assert!(matches!(
            report.checks.get(CHECK_CAPABILITIES),
            Some(CheckOutcome::Skipped(_))
        ));
    }

    #[test]
    fn test_widening_types_is_compatible() {
        let head_in = Schema::new().with_field("n", ValueType::Integer);
        let head_out = Schema::new().with_field("x", ValueType::Number);
        let new_in = Schema::new().with_field("n", ValueType::Number);
        let new_out = Schema::new().with_field("x", ValueType::Integer);
        assert!(compatibility_issues(&head_in, &head_out, &new_in, &new_out).is_empty());
        assert_eq!(
            compatibility_issues(&new_in, &new_out, &head_in, &head_out).len(),
            2
        );
    }
}
