//! # Flow Graph Model
//!
//! Declarative graph definitions and their validated, executable form.
//!
//! A graph is loaded from JSON (see `resources/flows/`) and validated
//! before use:
//!
//! - node ids are unique and every edge references an existing node;
//! - exactly one start node (no incoming edges);
//! - one or more terminal nodes (no outgoing edges), each of a terminal
//!   node type (`END`, `AUTH_SUCCESS`);
//! - every `TASK_EXECUTION` node resolves to a registered executor;
//! - the graph is acyclic, or every cycle passes through a node carrying a
//!   `retry_limit` property that bounds it.
//!
//! Nodes live in an id-keyed map and edges are id pairs, never owning
//! references.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use shared::errors::{ServiceError, ServiceResult};

use super::context::FlowType;

// =============================================================================
// Definition Types
// =============================================================================

/// Node classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeType {
    Start,
    End,
    TaskExecution,
    Prompt,
    AuthSuccess,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "START",
            Self::End => "END",
            Self::TaskExecution => "TASK_EXECUTION",
            Self::Prompt => "PROMPT",
            Self::AuthSuccess => "AUTH_SUCCESS",
        }
    }

    /// Whether a node of this type may have no outgoing edges.
    fn may_terminate(&self) -> bool {
        matches!(self, Self::End | Self::AuthSuccess)
    }
}

/// One required-or-optional input a node consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSpec {
    pub name: String,
    #[serde(default = "default_true")]
    pub required: bool,
}

fn default_true() -> bool {
    true
}

/// Executor binding of a `TASK_EXECUTION` node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    pub name: String,
    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
}

/// A client-selectable branch out of a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub id: String,
    pub next_node: String,
}

/// A node as declared in the graph definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDefinition {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default)]
    pub input_data: Vec<InputSpec>,
    #[serde(default)]
    pub next: Vec<String>,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub executor: Option<ExecutorConfig>,
    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
}

impl NodeDefinition {
    /// Bound on re-entries for nodes participating in a cycle.
    pub fn retry_limit(&self) -> Option<u64> {
        self.properties.get("retry_limit").and_then(|v| v.as_u64())
    }

    /// All outgoing edges: explicit actions plus the plain `next` list.
    fn successors(&self) -> impl Iterator<Item = &str> {
        self.actions
            .iter()
            .map(|a| a.next_node.as_str())
            .chain(self.next.iter().map(String::as_str))
    }

    pub fn is_terminal(&self) -> bool {
        self.next.is_empty() && self.actions.is_empty()
    }
}

/// The raw declarative document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphDefinition {
    pub id: String,
    #[serde(rename = "type")]
    pub flow_type: FlowType,
    pub nodes: Vec<NodeDefinition>,
}

// =============================================================================
// Validated Graph
// =============================================================================

/// A validated, executable flow graph.
#[derive(Debug, Clone)]
pub struct FlowGraph {
    pub id: String,
    pub flow_type: FlowType,
    nodes: HashMap<String, NodeDefinition>,
    start_node: String,
}

impl FlowGraph {
    /// Validates a definition against the set of registered executor names.
    pub fn from_definition(
        definition: GraphDefinition,
        known_executors: &HashSet<String>,
    ) -> ServiceResult<Self> {
        if definition.nodes.is_empty() {
            return Err(graph_error(&definition.id, "graph has no nodes"));
        }

        let mut nodes: HashMap<String, NodeDefinition> = HashMap::new();
        for node in definition.nodes {
            if nodes.insert(node.id.clone(), node).is_some() {
                return Err(graph_error(&definition.id, "duplicate node id"));
            }
        }

        // Every edge must land on a declared node.
        let mut incoming: HashMap<&str, usize> = nodes.keys().map(|k| (k.as_str(), 0)).collect();
        for node in nodes.values() {
            for target in node.successors() {
                match incoming.get_mut(target) {
                    Some(count) => *count += 1,
                    None => {
                        return Err(graph_error(
                            &definition.id,
                            format!("edge from '{}' references unknown node '{}'", node.id, target),
                        ))
                    }
                }
            }
        }

        // Exactly one start node: a node with no incoming edges.
        let starts: Vec<&str> = incoming
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| *id)
            .collect();
        if starts.len() != 1 {
            return Err(graph_error(
                &definition.id,
                format!("expected exactly one start node, found {}", starts.len()),
            ));
        }
        let start_node = starts[0].to_string();

        // Terminal nodes exist and are of a terminal node type.
        let mut terminals = 0;
        for node in nodes.values() {
            if node.is_terminal() {
                terminals += 1;
                if !node.node_type.may_terminate() {
                    return Err(graph_error(
                        &definition.id,
                        format!("node '{}' has no successors but type {}", node.id, node.node_type.as_str()),
                    ));
                }
            }
        }
        if terminals == 0 {
            return Err(graph_error(&definition.id, "graph has no terminal node"));
        }

        // Executor bindings must resolve.
        for node in nodes.values() {
            if node.node_type == NodeType::TaskExecution {
                let executor = node.executor.as_ref().ok_or_else(|| {
                    graph_error(
                        &definition.id,
                        format!("TASK_EXECUTION node '{}' has no executor", node.id),
                    )
                })?;
                if !known_executors.contains(&executor.name) {
                    return Err(graph_error(
                        &definition.id,
                        format!("node '{}' references unknown executor '{}'", node.id, executor.name),
                    ));
                }
            }
        }

        // Cycles are permitted only when bounded by a retry limit.
        check_cycles(&definition.id, &nodes, &start_node)?;

        Ok(Self { id: definition.id, flow_type: definition.flow_type, nodes, start_node })
    }

    pub fn start_node(&self) -> &str {
        &self.start_node
    }

    pub fn node(&self, id: &str) -> ServiceResult<&NodeDefinition> {
        self.nodes.get(id).ok_or_else(|| {
            ServiceError::server("FLW-1002", format!("graph '{}' has no node '{}'", self.id, id))
        })
    }

    /// Selects the next node out of `node`.
    ///
    /// Explicit actions require the client's `action_id`; otherwise the
    /// single outgoing edge is taken. `None` means the flow terminates here.
    pub fn next_node(
        &self,
        node: &NodeDefinition,
        action_id: Option<&str>,
    ) -> ServiceResult<Option<String>> {
        if !node.actions.is_empty() {
            let action_id = action_id.ok_or_else(|| {
                ServiceError::client(
                    "FLW-1003",
                    format!("node '{}' requires an action_id to continue", node.id),
                )
            })?;
            let action = node.actions.iter().find(|a| a.id == action_id).ok_or_else(|| {
                ServiceError::client(
                    "FLW-1004",
                    format!("unknown action '{}' for node '{}'", action_id, node.id),
                )
            })?;
            return Ok(Some(action.next_node.clone()));
        }

        match node.next.as_slice() {
            [] => Ok(None),
            [only] => Ok(Some(only.clone())),
            _ => Err(ServiceError::server(
                "FLW-1005",
                format!("node '{}' has multiple successors but no actions", node.id),
            )),
        }
    }
}

fn graph_error(graph_id: &str, detail: impl Into<String>) -> ServiceError {
    ServiceError::server("FLW-1001", format!("invalid graph '{}': {}", graph_id, detail.into()))
}

/// Depth-first search rejecting cycles that contain no retry-limited node.
fn check_cycles(
    graph_id: &str,
    nodes: &HashMap<String, NodeDefinition>,
    start: &str,
) -> ServiceResult<()> {
    let Some((start, _)) = nodes.get_key_value(start) else {
        return Ok(());
    };
    let mut visited: HashSet<&str> = HashSet::new();
    let mut path: Vec<&str> = Vec::new();
    let mut on_path: HashSet<&str> = HashSet::new();

    fn visit<'a>(
        graph_id: &str,
        nodes: &'a HashMap<String, NodeDefinition>,
        current: &'a str,
        visited: &mut HashSet<&'a str>,
        path: &mut Vec<&'a str>,
        on_path: &mut HashSet<&'a str>,
    ) -> ServiceResult<()> {
        visited.insert(current);
        path.push(current);
        on_path.insert(current);

        if let Some(node) = nodes.get(current) {
            for target in node.successors() {
                if on_path.contains(target) {
                    // Back edge: the cycle runs from `target` to `current`.
                    let cycle_start = path.iter().position(|n| *n == target).unwrap_or(0);
                    let bounded = path[cycle_start..]
                        .iter()
                        .filter_map(|id| nodes.get(*id))
                        .any(|n| n.retry_limit().is_some());
                    if !bounded {
                        return Err(graph_error(
                            graph_id,
                            format!("unbounded cycle through node '{}'", target),
                        ));
                    }
                } else if !visited.contains(target) {
                    visit(graph_id, nodes, target, visited, path, on_path)?;
                }
            }
        }

        path.pop();
        on_path.remove(current);
        Ok(())
    }

    visit(graph_id, nodes, start.as_str(), &mut visited, &mut path, &mut on_path)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn executors() -> HashSet<String> {
        ["credentials", "sms_otp", "auth_assert"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn parse(doc: serde_json::Value) -> GraphDefinition {
        serde_json::from_value(doc).expect("definition parses")
    }

    fn basic_graph() -> serde_json::Value {
        json!({
            "id": "auth_basic",
            "type": "AUTHENTICATION",
            "nodes": [
                {"id": "start", "type": "START", "next": ["creds"]},
                {
                    "id": "creds",
                    "type": "TASK_EXECUTION",
                    "executor": {"name": "credentials"},
                    "input_data": [
                        {"name": "username"},
                        {"name": "password"}
                    ],
                    "next": ["done"]
                },
                {"id": "done", "type": "AUTH_SUCCESS",
                 "executor": {"name": "auth_assert"}}
            ]
        })
    }

    #[test]
    fn valid_graph_builds() {
        let graph = FlowGraph::from_definition(parse(basic_graph()), &executors()).unwrap();
        assert_eq!(graph.start_node(), "start");
        assert_eq!(graph.flow_type, FlowType::Authentication);
        assert!(graph.node("creds").unwrap().executor.is_some());
    }

    #[test]
    fn two_roots_are_rejected() {
        let mut doc = basic_graph();
        doc["nodes"].as_array_mut().unwrap().push(json!({
            "id": "orphan", "type": "START", "next": ["done"]
        }));
        let err = FlowGraph::from_definition(parse(doc), &executors()).unwrap_err();
        assert!(err.description.contains("exactly one start node"));
    }

    #[test]
    fn dangling_edge_is_rejected() {
        let mut doc = basic_graph();
        doc["nodes"][1]["next"] = json!(["nowhere"]);
        let err = FlowGraph::from_definition(parse(doc), &executors()).unwrap_err();
        assert!(err.description.contains("unknown node"));
    }

    #[test]
    fn unknown_executor_is_rejected() {
        let mut doc = basic_graph();
        doc["nodes"][1]["executor"]["name"] = json!("teleport");
        let err = FlowGraph::from_definition(parse(doc), &executors()).unwrap_err();
        assert!(err.description.contains("unknown executor"));
    }

    #[test]
    fn non_terminal_type_without_successors_is_rejected() {
        let mut doc = basic_graph();
        // A PROMPT node with no outgoing edges.
        doc["nodes"][2] = json!({"id": "done", "type": "PROMPT"});
        let err = FlowGraph::from_definition(parse(doc), &executors()).unwrap_err();
        assert!(err.description.contains("no successors"));
    }

    #[test]
    fn unbounded_cycle_is_rejected() {
        let doc = json!({
            "id": "loopy",
            "type": "AUTHENTICATION",
            "nodes": [
                {"id": "start", "type": "START", "next": ["a"]},
                {"id": "a", "type": "TASK_EXECUTION",
                 "executor": {"name": "credentials"}, "next": ["b"]},
                {"id": "b", "type": "TASK_EXECUTION",
                 "executor": {"name": "sms_otp"}, "next": ["a", "done"],
                 "actions": []},
                {"id": "done", "type": "END"}
            ]
        });
        // Two successors need actions; give them.
        let mut doc = doc;
        doc["nodes"][2]["next"] = json!([]);
        doc["nodes"][2]["actions"] = json!([
            {"id": "again", "next_node": "a"},
            {"id": "finish", "next_node": "done"}
        ]);
        let err = FlowGraph::from_definition(parse(doc), &executors()).unwrap_err();
        assert!(err.description.contains("unbounded cycle"));
    }

    #[test]
    fn retry_limited_cycle_is_accepted() {
        let doc = json!({
            "id": "retryable",
            "type": "AUTHENTICATION",
            "nodes": [
                {"id": "start", "type": "START", "next": ["otp"]},
                {"id": "otp", "type": "TASK_EXECUTION",
                 "executor": {"name": "sms_otp"},
                 "properties": {"retry_limit": 3},
                 "actions": [
                     {"id": "again", "next_node": "otp"},
                     {"id": "finish", "next_node": "done"}
                 ]},
                {"id": "done", "type": "END"}
            ]
        });
        assert!(FlowGraph::from_definition(parse(doc), &executors()).is_ok());
    }

    #[test]
    fn action_selects_branch_and_single_edge_advances() {
        let doc = json!({
            "id": "branching",
            "type": "AUTHENTICATION",
            "nodes": [
                {"id": "start", "type": "START", "next": ["choose"]},
                {"id": "choose", "type": "PROMPT",
                 "actions": [
                     {"id": "password", "next_node": "creds"},
                     {"id": "finish", "next_node": "done"}
                 ]},
                {"id": "creds", "type": "TASK_EXECUTION",
                 "executor": {"name": "credentials"}, "next": ["done"]},
                {"id": "done", "type": "END"}
            ]
        });
        let graph = FlowGraph::from_definition(parse(doc), &executors()).unwrap();

        let choose = graph.node("choose").unwrap();
        assert_eq!(
            graph.next_node(choose, Some("password")).unwrap(),
            Some("creds".to_string())
        );
        assert!(graph.next_node(choose, None).is_err());
        assert!(graph.next_node(choose, Some("bogus")).is_err());

        let creds = graph.node("creds").unwrap();
        assert_eq!(graph.next_node(creds, None).unwrap(), Some("done".to_string()));

        let done = graph.node("done").unwrap();
        assert_eq!(graph.next_node(done, None).unwrap(), None);
    }
}
