//! Node lifecycle within one run.
//!
//! ```text
//! Pending ──► Ready ──► Running ──► Succeeded
//!               │  ▲        │
//!               ▼  │        ├──► Failed
//!      AwaitingApproval     └──► Ready (retry)
//!               │
//!               └──► Failed (edit rejected by validation)
//! ```
//!
//! Any non-terminal state may move to `Cancelled`. Terminal states never
//! change again.

use crate::sandbox::ErrorKind;
use crate::graph::NodeId;
use crate::thought::ThoughtId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// State of one node instance in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// Waiting on upstream nodes.
    Pending,
    /// Every upstream succeeded; waiting for a worker slot or the gate.
    Ready,
    /// Blocked on a human decision. Holds no worker slot.
    AwaitingApproval,
    /// Executing in the sandbox.
    Running,
    /// Completed with a schema-conforming output.
    Succeeded,
    /// Ended without an output.
    Failed,
    /// Rejected, cancelled, or downstream of a failure.
    Cancelled,
}

impl NodeState {
    /// Whether the state is final.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Whether `self → next` is a legal transition.
    pub fn can_transition_to(self, next: NodeState) -> bool {
        use NodeState::*;
        matches!(
            (self, next),
            (Pending, Ready)
                | (Pending, Cancelled)
                | (Ready, AwaitingApproval)
                | (Ready, Running)
                | (Ready, Failed)
                | (Ready, Cancelled)
                | (AwaitingApproval, Running)
                | (AwaitingApproval, Ready)
                | (AwaitingApproval, Failed)
                | (AwaitingApproval, Cancelled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Ready)
        )
    }

    /// Lowercase label for logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a node did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureKind {
    /// The last execution attempt failed.
    Execution {
        /// Classification of the last error.
        error: ErrorKind,
    },
    /// A human rejected the node.
    Rejected,
    /// An upstream node failed or was cancelled.
    UpstreamFailed {
        /// The node whose failure propagated.
        upstream: NodeId,
    },
    /// The run was cancelled.
    RunCancelled,
    /// The output broke the output schema, or an edited definition did not
    /// validate.
    Validation,
}

/// Failure details recorded on a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Failure category.
    pub kind: FailureKind,
    /// Human-readable detail.
    pub message: String,
}

/// Final view of one node in a [`RunReport`](super::RunReport).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeReport {
    /// Node id.
    pub id: NodeId,
    /// Thought version the node ran (or would have run).
    pub thought: ThoughtId,
    /// State at the end of the run.
    pub state: NodeState,
    /// Execution attempts made.
    pub attempts: u32,
    /// Output, if the node succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Why the node did not succeed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use NodeState::*;

    const ALL: [NodeState; 7] = [Pending, Ready, AwaitingApproval, Running, Succeeded, Failed, Cancelled];

    #[test]
    fn test_terminal_states_are_final() {
        for from in [Succeeded, Failed, Cancelled] {
            assert!(from.is_terminal());
            for to in ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_every_live_state_can_cancel() {
        for from in [Pending, Ready, AwaitingApproval, Running] {
            assert!(!from.is_terminal());
            assert!(from.can_transition_to(Cancelled));
        }
    }

    #[test]
    fn test_pending_cannot_skip_ready() {
        assert!(!Pending.can_transition_to(Running));
        assert!(!Pending.can_transition_to(AwaitingApproval));
        assert!(!Ready.can_transition_to(Succeeded));
    }

    #[test]
    fn test_ready_node_can_fail_before_dispatch() {
        assert!(Ready.can_transition_to(Failed));
        assert!(!Pending.can_transition_to(Failed));
    }

    #[test]
    fn test_serialized_names() {
        assert_eq!(
            serde_json::to_value(AwaitingApproval).expect("test: serialize"),
            serde_json::json!("awaiting_approval")
        );
        assert_eq!(AwaitingApproval.to_string(), "awaiting_approval");
    }
}
