//! # thought-orchestrator
//!
//! A versioned, approval-gated orchestration engine for composable automation
//! units ("thoughts") over Tokio.
//!
//! ## Architecture
//!
//! ```text
//! RawDefinition ──► SelfModificationPipeline ──► ThoughtRegistry (versioned)
//!                                                      │ resolve + pin
//! WorkflowSpec ───────────► graph::build ──────► WorkflowGraph (acyclic)
//!                                                      │
//! Trigger ──► Engine ──► run driver ──► ApprovalGate (side-effecting / untrusted)
//!                            │
//!                            └──► SandboxBoundary ──► ThoughtExecutor
//! ```
//!
//! Every committed definition and every finished run is written to the
//! [`store::StateStore`]; every state change is published as a
//! [`scheduler::RunEvent`].

// ── Lint policy ───────────────────────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(missing_docs)]

use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub mod approval;
pub mod config;
pub mod graph;
pub mod metrics;
pub mod registry;
pub mod sandbox;
pub mod scheduler;
pub mod self_modify;
pub mod store;
pub mod thought;

// Re-exports for convenience
pub use approval::{ApprovalGate, ApprovalRequest, Decision, RequestId};
pub use config::EngineConfig;
pub use graph::{Binding, NodeId, NodeSpec, RunId, WorkflowGraph, WorkflowSpec};
pub use registry::ThoughtRegistry;
pub use sandbox::{ExecutionError, ExecutionOutput, ThoughtExecutor};
pub use scheduler::{Engine, RunHandle, RunReport, RunStatus, Trigger};
pub use thought::{Origin, RawDefinition, ThoughtDefinition, ThoughtId};

/// Initialise the global tracing subscriber.
///
/// Reads the `LOG_FORMAT` environment variable to choose output format:
/// - `"json"`: structured JSON output for log aggregators
/// - anything else (including unset): human-readable pretty output
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=info`).
///
/// # Errors
///
/// Returns [`EngineError::Other`] if the global subscriber has already
/// been set (e.g. by a previous call or a test harness).
///
/// # Panics
///
/// This function never panics.
///
/// # Example
///
/// ```no_run
/// # use thought_orchestrator::{init_tracing, EngineError};
/// # fn example() -> Result<(), EngineError> {
/// init_tracing()?;
/// # Ok(()) }
/// ```
pub fn init_tracing() -> Result<(), EngineError> {
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let result = match format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .with_span_list(true)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init(),
    };

    result.map_err(|e| EngineError::Other(format!("tracing init failed: {e}")))
}

/// Top-level engine errors.
///
/// Every component error converts into a variant here, for callers that want
/// a single error type.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Registry lookup or registration failed.
    #[error(transparent)]
    Registry(#[from] registry::RegistryError),

    /// A workflow could not be built.
    #[error(transparent)]
    Graph(#[from] graph::GraphError),

    /// Approval protocol misuse.
    #[error(transparent)]
    Approval(#[from] approval::ApprovalError),

    /// A node body failed.
    #[error(transparent)]
    Execution(#[from] sandbox::ExecutionError),

    /// A proposal failed validation or commit.
    #[error(transparent)]
    SelfModify(#[from] self_modify::SelfModifyError),

    /// Persistence failed.
    #[error(transparent)]
    Store(#[from] store::StoreError),

    /// Configuration is missing or invalid.
    #[error(transparent)]
    Config(#[from] config::validation::ConfigError),

    /// Metrics registration failed.
    #[error("metrics error: {0}")]
    Metrics(String),

    /// Catch-all for errors that do not fit a specific variant.
    #[error("{0}")]
    Other(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_errors_convert() {
        let err: EngineError = graph::GraphError::InvalidSpec("bad".to_string()).into();
        assert!(matches!(err, EngineError::Graph(_)));
        assert!(err.to_string().contains("bad"));

        let err: EngineError = sandbox::ExecutionError::Cancelled.into();
        assert!(matches!(err, EngineError::Execution(_)));
    }

    #[test]
    fn test_config_error_display_includes_message() {
        let err: EngineError =
            config::validation::ConfigError::Validation("worker_pool_size".to_string()).into();
        assert!(err.to_string().contains("worker_pool_size"));
    }

    #[test]
    fn test_init_tracing_second_call_returns_err() {
        // The first call may fail if another test installed a subscriber.
        let _ = init_tracing();
        let result = init_tracing();
        assert!(result.is_err(), "double init must return Err, not panic");
    }
}
