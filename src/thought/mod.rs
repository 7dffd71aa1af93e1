//! # Thought — versioned unit of automation
//!
//! ## Responsibility
//! Define the data model for thoughts: the raw, user- or thought-authored
//! [`RawDefinition`] and the immutable, versioned [`ThoughtDefinition`] the
//! registry hands out.
//!
//! ## Guarantees
//! - Immutable: a `ThoughtDefinition` is never mutated after creation; a new
//!   version is a new value sharing the name
//! - Checkable: [`RawDefinition::issues`] reports every well-formedness problem
//!   at once instead of stopping at the first
//!
//! ## NOT Responsible For
//! - Version assignment and storage (see: `registry`)
//! - Compatibility between versions (see: `self_modify::gate`)

pub mod capability;
pub mod schema;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

pub use capability::{Capability, CapabilityPolicy};
pub use schema::{FieldSpec, Schema, ValueType};

/// Maximum length of a thought name.
const MAX_NAME_LEN: usize = 64;

/// Stable identity of one thought version: `name@vN`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThoughtId {
    /// Stable thought name shared by every version.
    pub name: String,
    /// Monotonic version, starting at 1.
    pub version: u32,
}

impl ThoughtId {
    /// Create an identity from its parts.
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

impl fmt::Display for ThoughtId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@v{}", self.name, self.version)
    }
}

/// How a definition version entered the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Supplied by an operator or planner at the engine boundary.
    Registered,
    /// Reloaded from the persistence store at startup.
    Restored,
    /// Authored by an executing thought and committed by the pipeline.
    SelfModified,
    /// Authored by a human through an `Edit` approval decision.
    HumanEdit,
}

impl Origin {
    /// Returns `true` if versions with this origin start out untrusted.
    pub fn starts_untrusted(self) -> bool {
        matches!(self, Self::SelfModified)
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Registered => "registered",
            Self::Restored => "restored",
            Self::SelfModified => "self_modified",
            Self::HumanEdit => "human_edit",
        };
        f.write_str(s)
    }
}

/// Backoff between retry attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// Same delay before every retry.
    Fixed {
        /// Delay in milliseconds.
        delay_ms: u64,
    },
    /// Delay doubles each retry, capped at `max_ms`.
    Exponential {
        /// First delay in milliseconds.
        initial_ms: u64,
        /// Upper bound in milliseconds.
        max_ms: u64,
    },
    /// Delay grows by `increment_ms` each retry.
    Linear {
        /// First delay in milliseconds.
        initial_ms: u64,
        /// Added per further retry.
        increment_ms: u64,
    },
}

/// Retry policy a thought declares for transient failures.
///
/// `retry = {}` opts into retries with the engine's configured defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySpec {
    /// Total attempts including the first. `None` uses the engine default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    /// Backoff between attempts. `None` uses the engine default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<Backoff>,
    /// Add up to 25% random jitter to each delay.
    #[serde(default)]
    pub jitter: bool,
}

impl RetrySpec {
    /// `max_attempts` total attempts using the engine default backoff.
    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            backoff: None,
            jitter: false,
        }
    }

    /// Set an explicit backoff.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }
}

/// A thought definition as authored, before validation and versioning.
///
/// This is the form planners, humans, and self-modifying thoughts submit.
/// Capabilities are kept as strings so that unsupported entries surface as
/// validation issues rather than parse failures.
///
/// # Example
///
/// ```rust
/// use thought_orchestrator::thought::RawDefinition;
/// let raw: RawDefinition = toml::from_str(r#"
///     name = "write_file"
///     body = "write_file.sh"
///     side_effecting = true
///     capabilities = ["fs.write:/tmp"]
///     [inputs]
///     path = { type = "string" }
/// "#).unwrap();
/// assert!(raw.issues().is_empty());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDefinition {
    /// Stable thought name.
    pub name: String,
    /// Human-readable summary for catalogues and approval prompts.
    #[serde(default)]
    pub description: String,
    /// Declared inputs.
    #[serde(default)]
    pub inputs: Schema,
    /// Declared outputs.
    #[serde(default)]
    pub outputs: Schema,
    /// Capability strings (`fs.write:/tmp`, `shell.exec`, …).
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Opaque reference to the execution body, interpreted by the executor.
    pub body: String,
    /// Whether running this thought has effects outside the engine.
    #[serde(default)]
    pub side_effecting: bool,
    /// Retry policy for transient failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySpec>,
    /// Per-thought wall-clock limit overriding the engine default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl RawDefinition {
    /// Minimal definition with empty schemas and no capabilities.
    pub fn new(name: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            inputs: Schema::new(),
            outputs: Schema::new(),
            capabilities: Vec::new(),
            body: body.into(),
            side_effecting: false,
            retry: None,
            timeout_ms: None,
        }
    }

    /// Set the description.
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the input schema.
    pub fn with_inputs(mut self, inputs: Schema) -> Self {
        self.inputs = inputs;
        self
    }

    /// Set the output schema.
    pub fn with_outputs(mut self, outputs: Schema) -> Self {
        self.outputs = outputs;
        self
    }

    /// Declare a capability.
    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    /// Mark as side-effecting.
    pub fn side_effecting(mut self) -> Self {
        self.side_effecting = true;
        self
    }

    /// Attach a retry policy.
    pub fn with_retry(mut self, retry: RetrySpec) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Set a per-thought timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Every well-formedness problem with this definition.
    ///
    /// Checks the name, body reference, schema field names, capability
    /// syntax, retry bounds, and timeout. Capability *permission* is not
    /// checked here; that depends on the process policy.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn issues(&self) -> Vec<String> {
        let mut issues = Vec::new();

        if !is_valid_name(&self.name) {
            issues.push(format!(
                "invalid thought name '{}': use 1-{MAX_NAME_LEN} ASCII alphanumerics, '_' or '-'",
                self.name
            ));
        }
        if self.body.trim().is_empty() {
            issues.push("body reference must not be empty".to_string());
        }
        if let Err(fields) = self.inputs.well_formed() {
            issues.extend(fields.into_iter().map(|f| format!("inputs: {f}")));
        }
        if let Err(fields) = self.outputs.well_formed() {
            issues.extend(fields.into_iter().map(|f| format!("outputs: {f}")));
        }
        if let Err(errors) = capability::parse_capabilities(&self.capabilities) {
            issues.extend(errors.into_iter().map(|e| e.to_string()));
        }
        if let Some(retry) = &self.retry {
            if retry.max_attempts == Some(0) {
                issues.push("retry.max_attempts must be at least 1".to_string());
            }
            if let Some(Backoff::Exponential { initial_ms, max_ms }) = &retry.backoff {
                if initial_ms > max_ms {
                    issues.push("retry.backoff.initial_ms must be <= max_ms".to_string());
                }
            }
        }
        if self.timeout_ms == Some(0) {
            issues.push("timeout_ms must be > 0".to_string());
        }
        issues
    }

    /// Parsed capability set, or `None` if any entry is unsupported.
    pub fn parsed_capabilities(&self) -> Option<BTreeSet<Capability>> {
        capability::parse_capabilities(&self.capabilities).ok()
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// An immutable, versioned thought definition.
///
/// Shared as `Arc<ThoughtDefinition>`; a workflow run holds the exact `Arc`
/// it resolved at build time for its whole lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThoughtDefinition {
    /// Name and version.
    pub id: ThoughtId,
    /// Human-readable summary.
    pub description: String,
    /// Declared inputs.
    pub inputs: Schema,
    /// Declared outputs.
    pub outputs: Schema,
    /// Declared capability requirements.
    pub capabilities: BTreeSet<Capability>,
    /// Opaque execution body reference.
    pub body: String,
    /// Whether running this thought has external effects.
    pub side_effecting: bool,
    /// Retry policy for transient failures.
    pub retry: Option<RetrySpec>,
    /// Per-thought timeout in milliseconds.
    pub timeout_ms: Option<u64>,
    /// How this version entered the registry.
    pub origin: Origin,
    /// When this version was created.
    pub created_at: DateTime<Utc>,
}

impl ThoughtDefinition {
    /// Build a versioned definition from a raw one.
    ///
    /// # Returns
    ///
    /// - `Ok(definition)` if the raw definition is well-formed
    /// - `Err(issues)` listing every problem found
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn from_raw(raw: RawDefinition, version: u32, origin: Origin) -> Result<Self, Vec<String>> {
        let issues = raw.issues();
        if !issues.is_empty() {
            return Err(issues);
        }
        let capabilities = capability::parse_capabilities(&raw.capabilities)
            .map_err(|errs| errs.into_iter().map(|e| e.to_string()).collect::<Vec<_>>())?;
        Ok(Self {
            id: ThoughtId::new(raw.name, version),
            description: raw.description,
            inputs: raw.inputs,
            outputs: raw.outputs,
            capabilities,
            body: raw.body,
            side_effecting: raw.side_effecting,
            retry: raw.retry,
            timeout_ms: raw.timeout_ms,
            origin,
            created_at: Utc::now(),
        })
    }

    /// The authored form of this definition, e.g. as a base for an edit.
    pub fn to_raw(&self) -> RawDefinition {
        RawDefinition {
            name: self.id.name.clone(),
            description: self.description.clone(),
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
            capabilities: self.capabilities.iter().map(ToString::to_string).collect(),
            body: self.body.clone(),
            side_effecting: self.side_effecting,
            retry: self.retry.clone(),
            timeout_ms: self.timeout_ms,
        }
    }

    /// Per-thought timeout, if declared.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RawDefinition {
        RawDefinition::new("write_file", "scripts/write.sh")
            .describe("Write text to a file")
            .with_inputs(
                Schema::new()
                    .with_field("path", ValueType::String)
                    .with_field("text", ValueType::String),
            )
            .with_capability("fs.write:/tmp")
            .side_effecting()
    }

    #[test]
    fn test_thought_id_display() {
        assert_eq!(ThoughtId::new("reply", 3).to_string(), "reply@v3");
    }

    #[test]
    fn test_well_formed_definition_has_no_issues() {
        assert!(sample().issues().is_empty());
    }

    #[test]
    fn test_issues_collects_every_problem() {
        let mut raw = sample();
        raw.name = "bad name!".to_string();
        raw.body = "  ".to_string();
        raw.capabilities.push("teleport".to_string());
        raw.timeout_ms = Some(0);
        raw.retry = Some(RetrySpec::attempts(0));
        let issues = raw.issues();
        assert_eq!(issues.len(), 5, "{issues:?}");
    }

    #[test]
    fn test_exponential_backoff_bounds_checked() {
        let raw = sample().with_retry(RetrySpec::attempts(3).with_backoff(Backoff::Exponential {
            initial_ms: 500,
            max_ms: 100,
        }));
        assert_eq!(raw.issues().len(), 1);
    }

    #[test]
    fn test_from_raw_assigns_identity() {
        let def = ThoughtDefinition::from_raw(sample(), 2, Origin::Registered).expect("valid");
        assert_eq!(def.id, ThoughtId::new("write_file", 2));
        assert!(def
            .capabilities
            .contains(&"fs.write:/tmp".parse().expect("valid")));
        assert!(def.side_effecting);
    }

    #[test]
    fn test_from_raw_rejects_malformed() {
        let raw = RawDefinition::new("", "");
        let issues = ThoughtDefinition::from_raw(raw, 1, Origin::Registered).unwrap_err();
        assert_eq!(issues.len(), 2);
    }

    #[test]
    fn test_to_raw_round_trips_authored_fields() {
        let raw = sample().with_timeout(Duration::from_secs(5));
        let def = ThoughtDefinition::from_raw(raw.clone(), 1, Origin::Registered).expect("valid");
        assert_eq!(def.to_raw(), raw);
        assert_eq!(def.timeout(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_only_self_modified_starts_untrusted() {
        assert!(Origin::SelfModified.starts_untrusted());
        assert!(!Origin::HumanEdit.starts_untrusted());
        assert!(!Origin::Registered.starts_untrusted());
        assert!(!Origin::Restored.starts_untrusted());
    }

    #[test]
    fn test_retry_spec_toml_shape() {
        let spec: RetrySpec = toml::from_str(
            r#"
            max_attempts = 3
            backoff = { kind = "fixed", delay_ms = 50 }
            "#,
        )
        .expect("parse");
        assert_eq!(spec.backoff, Some(Backoff::Fixed { delay_ms: 50 }));
        assert!(!spec.jitter);
    }
}
