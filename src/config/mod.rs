//! # Engine Configuration
//!
//! ## Responsibility
//! Parse and validate the process-wide engine settings: worker-pool size,
//! default timeout, cancellation grace window, capability allow-list, retry
//! defaults and the optional state directory.
//!
//! ## Guarantees
//! - Deterministic: same TOML input always produces the same `EngineConfig`
//! - Validated: all semantic constraints are checked before a config is accepted
//! - Complete defaults: an empty file is a valid configuration
//! - Schema-exportable: JSON Schema output enables IDE autocomplete
//!
//! ## NOT Responsible For
//! - Hot reload: the configuration is immutable once the engine starts
//! - Applying the settings (that belongs to `scheduler`)

pub mod loader;
pub mod validation;

use crate::thought::capability::CapabilityParseError;
use crate::thought::CapabilityPolicy;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

// ── Default value functions ──────────────────────────────────────────────

fn default_worker_pool_size() -> usize {
    4
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_cancel_grace_ms() -> u64 {
    2_000
}

fn default_allowed_capabilities() -> Vec<String> {
    vec!["llm.call".to_string()]
}

fn default_event_buffer() -> usize {
    256
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    5_000
}

// ── Config structs ───────────────────────────────────────────────────────

/// Process-wide engine settings.
///
/// # Example
///
/// ```toml
/// worker_pool_size = 8
/// default_timeout_ms = 10000
/// allowed_capabilities = ["llm.call", "fs.read:/data"]
/// state_dir = "/var/lib/thoughts"
///
/// [retry]
/// max_attempts = 5
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Concurrent node executions across all runs.
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,

    /// Timeout for thoughts that declare none.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,

    /// Cooperative cancellation window before an execution is aborted.
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,

    /// Global capability allow-list, in capability string syntax.
    #[serde(default = "default_allowed_capabilities")]
    pub allowed_capabilities: Vec<String>,

    /// Capacity of the run-event broadcast channel.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    /// Defaults for thoughts that opt into retries without details.
    #[serde(default)]
    pub retry: RetryDefaults,

    /// Directory for file persistence; in-memory when unset.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
}

/// Retry defaults applied when a thought's `retry` table omits a field.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RetryDefaults {
    /// Total attempts including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial exponential backoff delay.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Cap on the exponential backoff delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryDefaults {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: default_worker_pool_size(),
            default_timeout_ms: default_timeout_ms(),
            cancel_grace_ms: default_cancel_grace_ms(),
            allowed_capabilities: default_allowed_capabilities(),
            event_buffer: default_event_buffer(),
            retry: RetryDefaults::default(),
            state_dir: None,
        }
    }
}

impl EngineConfig {
    /// Default per-execution timeout.
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// Cancellation grace window.
    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    /// Parse the allow-list into a [`CapabilityPolicy`].
    ///
    /// # Errors
    ///
    /// Every capability string that fails to parse.
    pub fn capability_policy(&self) -> Result<CapabilityPolicy, Vec<CapabilityParseError>> {
        CapabilityPolicy::from_strings(&self.allowed_capabilities)
    }

    /// Builder-style override of the allow-list.
    pub fn with_capabilities<S: Into<String>>(mut self, caps: impl IntoIterator<Item = S>) -> Self {
        self.allowed_capabilities = caps.into_iter().map(Into::into).collect();
        self
    }

    /// Builder-style override of the worker-pool size.
    pub fn with_worker_pool_size(mut self, size: usize) -> Self {
        self.worker_pool_size = size;
        self
    }

    /// Builder-style override of the default timeout.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }
}

/// Generate the JSON Schema for [`EngineConfig`].
///
/// # Panics
///
/// This function never panics.
pub fn json_schema() -> schemars::schema::RootSchema {
    schemars::schema_for!(EngineConfig)
}
