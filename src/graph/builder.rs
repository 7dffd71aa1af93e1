//! Workflow spec → validated [`WorkflowGraph`].
//!
//! Validation runs in a fixed order so the first reported error is stable:
//! duplicate ids, thought resolution, bindings, required inputs, ordering
//! edges, and finally cycle detection.

use super::{Binding, Edge, EdgeKind, GraphError, GraphNode, NodeId, WorkflowGraph, WorkflowSpec};
use crate::registry::DefinitionSource;
use crate::thought::ValueType;
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};
use tracing::debug;

/// Build a validated execution graph from `spec`, resolving thoughts through
/// `source`.
///
/// # Returns
///
/// - `Ok(graph)` with every node pinned to its resolved definition and a
///   topological order that places producers before consumers, ties broken
///   by creation order
/// - `Err(GraphError)` describing the first problem found; no partial graph
///   is produced
///
/// # Panics
///
/// This function never panics.
pub fn build<S>(spec: &WorkflowSpec, source: &S) -> Result<WorkflowGraph, GraphError>
where
    S: DefinitionSource + ?Sized,
{
    let mut index_of: HashMap<&NodeId, usize> = HashMap::with_capacity(spec.nodes.len());
    for (i, node) in spec.nodes.iter().enumerate() {
        if index_of.insert(&node.id, i).is_some() {
            return Err(GraphError::DuplicateNode(node.id.clone()));
        }
    }

    let mut definitions = Vec::with_capacity(spec.nodes.len());
    for node in &spec.nodes {
        let def = source
            .resolve_definition(&node.thought, node.version)
            .map_err(|e| GraphError::UnresolvedReference {
                node: node.id.clone(),
                reference: e.to_string(),
            })?;
        definitions.push(def);
    }

    let mut edges = Vec::new();
    for (to, node) in spec.nodes.iter().enumerate() {
        let def = &definitions[to];
        for (input, binding) in &node.inputs {
            let Some(field) = def.inputs.field(input) else {
                return Err(GraphError::SchemaMismatch {
                    node: node.id.clone(),
                    input: input.clone(),
                    detail: format!("{} declares no input '{input}'", def.id),
                });
            };
            match binding {
                Binding::Literal(value) => {
                    let null_ok = value.is_null() && !field.required;
                    if !null_ok && !field.ty.matches(value) {
                        return Err(GraphError::SchemaMismatch {
                            node: node.id.clone(),
                            input: input.clone(),
                            detail: format!(
                                "literal of type {} where {} is expected",
                                ValueType::of(value),
                                field.ty
                            ),
                        });
                    }
                }
                Binding::From {
                    node: producer,
                    output,
                } => {
                    let Some(&from) = index_of.get(producer) else {
                        return Err(GraphError::UnresolvedReference {
                            node: node.id.clone(),
                            reference: format!("no node '{producer}' in workflow"),
                        });
                    };
                    let producer_def = &definitions[from];
                    let Some(produced) = producer_def.outputs.field(output) else {
                        return Err(GraphError::UnresolvedReference {
                            node: node.id.clone(),
                            reference: format!(
                                "{producer} ({}) declares no output '{output}'",
                                producer_def.id
                            ),
                        });
                    };
                    if !field.ty.accepts(produced.ty) {
                        return Err(GraphError::SchemaMismatch {
                            node: node.id.clone(),
                            input: input.clone(),
                            detail: format!(
                                "{producer}.{output} produces {} where {} is expected",
                                produced.ty, field.ty
                            ),
                        });
                    }
                    if field.required && !produced.required {
                        return Err(GraphError::SchemaMismatch {
                            node: node.id.clone(),
                            input: input.clone(),
                            detail: format!(
                                "required input is bound to optional output {producer}.{output}"
                            ),
                        });
                    }
                    edges.push(Edge {
                        from,
                        to,
                        kind: EdgeKind::Data {
                            output: output.clone(),
                            input: input.clone(),
                        },
                    });
                }
            }
        }

        if let Some(missing) = def
            .inputs
            .required_fields()
            .find(|name| !node.inputs.contains_key(*name))
        {
            return Err(GraphError::SchemaMismatch {
                node: node.id.clone(),
                input: missing.to_string(),
                detail: "required input is not bound".to_string(),
            });
        }

        for dep in &node.after {
            let Some(&from) = index_of.get(dep) else {
                return Err(GraphError::UnresolvedReference {
                    node: node.id.clone(),
                    reference: format!("no node '{dep}' to run after"),
                });
            };
            edges.push(Edge {
                from,
                to,
                kind: EdgeKind::Order,
            });
        }
    }

    let n = spec.nodes.len();
    let mut upstream: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); n];
    let mut downstream: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); n];
    for edge in &edges {
        upstream[edge.to].insert(edge.from);
        downstream[edge.from].insert(edge.to);
    }

    let order = topological_order(&upstream, &downstream).map_err(|residual| {
        GraphError::CycleDetected {
            nodes: residual.into_iter().map(|i| spec.nodes[i].id.clone()).collect(),
        }
    })?;
    let mut position = vec![0; n];
    for (pos, &i) in order.iter().enumerate() {
        position[i] = pos;
    }

    let nodes = spec
        .nodes
        .iter()
        .zip(definitions)
        .enumerate()
        .map(|(index, (node, definition))| GraphNode {
            id: node.id.clone(),
            index,
            definition,
            inputs: node.inputs.clone(),
            upstream: upstream[index].iter().copied().collect(),
            downstream: downstream[index].iter().copied().collect(),
        })
        .collect();

    debug!(workflow = %spec.name, nodes = n, edges = edges.len(), "graph: built");

    Ok(WorkflowGraph {
        name: spec.name.clone(),
        nodes,
        edges,
        order,
        position,
    })
}

/// Kahn's algorithm with a min-heap on creation index.
///
/// Returns the order, or the residual node indices (ascending) when a cycle
/// prevents completion.
fn topological_order(
    upstream: &[BTreeSet<usize>],
    downstream: &[BTreeSet<usize>],
) -> Result<Vec<usize>, Vec<usize>> {
    let n = upstream.len();
    let mut in_degree: Vec<usize> = upstream.iter().map(BTreeSet::len).collect();
    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| Reverse(i))
        .collect();

    let mut order = Vec::with_capacity(n);
    while let Some(Reverse(i)) = ready.pop() {
        order.push(i);
        for &next in &downstream[i] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.push(Reverse(next));
            }
        }
    }

    if order.len() == n {
        Ok(order)
    } else {
        Err((0..n).filter(|&i| in_degree[i] > 0).collect())
    }
}
