//! # Graph — workflow specifications and validated execution graphs
//!
//! ## Responsibility
//! Describe a workflow as a list of [`NodeSpec`]s with input bindings, and
//! turn it into an acyclic, type-checked, version-pinned [`WorkflowGraph`].
//!
//! ## Guarantees
//! - Pure: building performs no execution and no side effects
//! - All-or-nothing: a build either yields a complete graph or an error; no
//!   partial graph is ever observable
//! - Deterministic: the topological order breaks ties by node creation order
//! - Pinned: every node holds the exact definition `Arc` resolved at build time
//!
//! ## NOT Responsible For
//! - Executing nodes (see: `scheduler`)

pub mod builder;

use crate::thought::{ThoughtDefinition, ThoughtId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

pub use builder::build;

/// Identity of a node within one workflow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    /// Create a node id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Identity of one workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// A fresh random run id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a node input gets its value.
///
/// In TOML: `text = { literal = "hello" }` or
/// `text = { from = { node = "fetch", output = "body" } }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Binding {
    /// A constant value.
    Literal(Value),
    /// A declared output of another node in the same workflow.
    From {
        /// Producer node.
        node: NodeId,
        /// Producer output field.
        output: String,
    },
}

impl Binding {
    /// A constant binding.
    pub fn literal(value: impl Into<Value>) -> Self {
        Self::Literal(value.into())
    }

    /// A binding to `node`'s `output` field.
    pub fn output(node: impl Into<String>, output: impl Into<String>) -> Self {
        Self::From {
            node: NodeId::new(node),
            output: output.into(),
        }
    }
}

/// One node of a workflow request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Node identity, unique within the workflow.
    pub id: NodeId,
    /// Thought to instantiate.
    pub thought: String,
    /// Pin a specific version; latest when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    /// Input bindings keyed by input field name.
    #[serde(default)]
    pub inputs: BTreeMap<String, Binding>,
    /// Ordering-only dependencies: run after these nodes succeed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub after: Vec<NodeId>,
}

impl NodeSpec {
    /// A node instantiating the latest version of `thought`.
    pub fn new(id: impl Into<String>, thought: impl Into<String>) -> Self {
        Self {
            id: NodeId::new(id),
            thought: thought.into(),
            version: None,
            inputs: BTreeMap::new(),
            after: Vec::new(),
        }
    }

    /// Pin a version.
    pub fn version(mut self, version: u32) -> Self {
        self.version = Some(version);
        self
    }

    /// Bind an input.
    pub fn input(mut self, name: impl Into<String>, binding: Binding) -> Self {
        self.inputs.insert(name.into(), binding);
        self
    }

    /// Add an ordering-only dependency.
    pub fn after(mut self, node: impl Into<String>) -> Self {
        self.after.push(NodeId::new(node));
        self
    }
}

/// A workflow request: named set of node specs.
///
/// # Example
///
/// ```rust
/// use thought_orchestrator::graph::{Binding, NodeSpec, WorkflowSpec};
/// let spec = WorkflowSpec::new("summarise")
///     .node(NodeSpec::new("read", "code_file_read").input("path", Binding::literal("src/lib.rs")))
///     .node(NodeSpec::new("reply", "reply").input("text", Binding::output("read", "content")));
/// assert_eq!(spec.nodes.len(), 2);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSpec {
    /// Workflow name, used in logs and run records.
    pub name: String,
    /// Nodes in creation order.
    #[serde(default, rename = "node")]
    pub nodes: Vec<NodeSpec>,
}

impl WorkflowSpec {
    /// An empty workflow.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
        }
    }

    /// Append a node.
    pub fn node(mut self, node: NodeSpec) -> Self {
        self.nodes.push(node);
        self
    }

    /// Parse a workflow from TOML (`[[node]]` tables).
    ///
    /// # Errors
    ///
    /// [`GraphError::InvalidSpec`] if the TOML is malformed.
    pub fn from_toml(content: &str) -> Result<Self, GraphError> {
        toml::from_str(content).map_err(|e| GraphError::InvalidSpec(e.to_string()))
    }

    /// Parse a workflow from JSON.
    ///
    /// # Errors
    ///
    /// [`GraphError::InvalidSpec`] if the JSON is malformed.
    pub fn from_json(content: &str) -> Result<Self, GraphError> {
        serde_json::from_str(content).map_err(|e| GraphError::InvalidSpec(e.to_string()))
    }
}

/// Build-time failures. The whole request is rejected; nothing is scheduled.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GraphError {
    /// Dependencies form at least one cycle.
    #[error("cycle detected among nodes: {}", join_ids(.nodes))]
    CycleDetected {
        /// Nodes left unordered, in creation order.
        nodes: Vec<NodeId>,
    },

    /// A thought name, version, node, or output could not be resolved.
    #[error("unresolved reference in node '{node}': {reference}")]
    UnresolvedReference {
        /// Node holding the reference.
        node: NodeId,
        /// What failed to resolve.
        reference: String,
    },

    /// A binding does not fit the declared schemas.
    #[error("schema mismatch at {node}.{input}: {detail}")]
    SchemaMismatch {
        /// Consumer node.
        node: NodeId,
        /// Consumer input field.
        input: String,
        /// Explanation.
        detail: String,
    },

    /// Two nodes share an id.
    #[error("duplicate node id '{0}'")]
    DuplicateNode(NodeId),

    /// The workflow document could not be parsed.
    #[error("invalid workflow spec: {0}")]
    InvalidSpec(String),
}

fn join_ids(ids: &[NodeId]) -> String {
    ids.iter().map(NodeId::as_str).collect::<Vec<_>>().join(", ")
}

/// Kind of dependency between two nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EdgeKind {
    /// Producer output feeds consumer input.
    Data {
        /// Producer output field.
        output: String,
        /// Consumer input field.
        input: String,
    },
    /// Ordering only.
    Order,
}

/// A directed dependency `from → to` between node indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    /// Producer index.
    pub from: usize,
    /// Consumer index.
    pub to: usize,
    /// Dependency kind.
    pub kind: EdgeKind,
}

/// One node of a validated graph.
#[derive(Debug, Clone)]
pub struct GraphNode {
    /// Node identity.
    pub id: NodeId,
    /// Creation index (position in the `WorkflowSpec`).
    pub index: usize,
    /// Definition pinned at build time.
    pub definition: Arc<ThoughtDefinition>,
    /// Input bindings.
    pub inputs: BTreeMap<String, Binding>,
    /// Distinct upstream node indices, ascending.
    pub upstream: Vec<usize>,
    /// Distinct downstream node indices, ascending.
    pub downstream: Vec<usize>,
}

/// An acyclic, type-checked execution graph.
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    pub(crate) name: String,
    pub(crate) nodes: Vec<GraphNode>,
    pub(crate) edges: Vec<Edge>,
    pub(crate) order: Vec<usize>,
    pub(crate) position: Vec<usize>,
}

impl WorkflowGraph {
    /// Workflow name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Nodes in creation order.
    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    /// Node by creation index.
    pub fn node(&self, index: usize) -> Option<&GraphNode> {
        self.nodes.get(index)
    }

    /// Node by id.
    pub fn node_by_id(&self, id: &NodeId) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.id == *id)
    }

    /// Every edge.
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Node indices in topological order.
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    /// Nodes in topological order.
    pub fn topological(&self) -> impl Iterator<Item = &GraphNode> {
        self.order.iter().filter_map(|&i| self.nodes.get(i))
    }

    /// Position of node `index` in the topological order.
    pub fn position_of(&self, index: usize) -> Option<usize> {
        self.position.get(index).copied()
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns `true` for a workflow with no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Versions this graph is pinned to, in creation order.
    pub fn pinned_versions(&self) -> Vec<ThoughtId> {
        self.nodes.iter().map(|n| n.definition.id.clone()).collect()
    }
}
