use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::graph::GraphError;

/// Kind of computation a node performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    /// Delegates to the configured [`AgentInvoker`](crate::workflow::invoker::AgentInvoker).
    Agent,
    Trigger,
    Action,
    Logic,
    Integration,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Agent => "agent",
            NodeType::Trigger => "trigger",
            NodeType::Action => "action",
            NodeType::Logic => "logic",
            NodeType::Integration => "integration",
        }
    }
}

/// A single node in a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    /// Display name; falls back to `Node <id>` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Agent bound to this node, for `agent` nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<Uuid>,
    /// Opaque per-node configuration forwarded to handlers.
    #[serde(default)]
    pub data: Value,
}

impl NodeSpec {
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("Node {}", self.id))
    }
}

/// A directed dependency between two nodes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub source: String,
    pub target: String,
}

/// Immutable workflow definition submitted for execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowSpec {
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub connections: Vec<EdgeSpec>,
    /// Opaque configuration forwarded to node handlers.
    #[serde(default)]
    pub settings: serde_json::Map<String, Value>,
}

/// Non-fatal observations produced by structural validation.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    /// Nodes with neither incoming nor outgoing edges, while other nodes
    /// are connected. Legal, but usually a mistake worth logging.
    pub disconnected: Vec<String>,
}

impl WorkflowSpec {
    pub fn node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Structural validation: unique node ids, known edge endpoints, no
    /// self-loops, no multi-edges. Disconnected nodes are reported but
    /// do not fail validation.
    pub fn validate(&self) -> Result<ValidationReport, GraphError> {
        let mut seen = std::collections::HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.id.as_str()) {
                return Err(GraphError::DuplicateNode(node.id.clone()));
            }
        }

        let mut seen_edges = std::collections::HashSet::new();
        for edge in &self.connections {
            if !seen.contains(edge.source.as_str()) {
                return Err(GraphError::UnknownEndpoint(edge.source.clone()));
            }
            if !seen.contains(edge.target.as_str()) {
                return Err(GraphError::UnknownEndpoint(edge.target.clone()));
            }
            if edge.source == edge.target {
                return Err(GraphError::SelfLoop(edge.source.clone()));
            }
            if !seen_edges.insert((edge.source.as_str(), edge.target.as_str())) {
                return Err(GraphError::DuplicateEdge(
                    edge.source.clone(),
                    edge.target.clone(),
                ));
            }
        }

        let mut connected = std::collections::HashSet::new();
        for edge in &self.connections {
            connected.insert(edge.source.as_str());
            connected.insert(edge.target.as_str());
        }

        let mut report = ValidationReport::default();
        if !connected.is_empty() {
            report.disconnected = self
                .nodes
                .iter()
                .filter(|n| !connected.contains(n.id.as_str()))
                .map(|n| n.id.clone())
                .collect();
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(id: &str, node_type: NodeType) -> NodeSpec {
        NodeSpec {
            id: id.to_string(),
            node_type,
            name: None,
            agent_id: None,
            data: Value::Null,
        }
    }

    fn edge(source: &str, target: &str) -> EdgeSpec {
        EdgeSpec {
            source: source.to_string(),
            target: target.to_string(),
        }
    }

    #[test]
    fn parses_workflow_json() {
        let spec: WorkflowSpec = serde_json::from_value(json!({
            "nodes": [
                {"id": "start", "type": "trigger"},
                {"id": "summarize", "type": "agent", "name": "Summarizer"}
            ],
            "connections": [
                {"source": "start", "target": "summarize"}
            ]
        }))
        .unwrap();

        assert_eq!(spec.node_count(), 2);
        assert_eq!(spec.node("summarize").unwrap().node_type, NodeType::Agent);
        assert_eq!(spec.node("start").unwrap().display_name(), "Node start");
        assert_eq!(spec.node("summarize").unwrap().display_name(), "Summarizer");
    }

    #[test]
    fn rejects_duplicate_node_ids() {
        let spec = WorkflowSpec {
            nodes: vec![node("a", NodeType::Action), node("a", NodeType::Action)],
            ..Default::default()
        };
        assert!(matches!(
            spec.validate(),
            Err(GraphError::DuplicateNode(id)) if id == "a"
        ));
    }

    #[test]
    fn rejects_unknown_edge_endpoint() {
        let spec = WorkflowSpec {
            nodes: vec![node("a", NodeType::Action)],
            connections: vec![edge("a", "ghost")],
            ..Default::default()
        };
        assert!(matches!(
            spec.validate(),
            Err(GraphError::UnknownEndpoint(id)) if id == "ghost"
        ));
    }

    #[test]
    fn rejects_self_loops_and_multi_edges() {
        let looped = WorkflowSpec {
            nodes: vec![node("a", NodeType::Action)],
            connections: vec![edge("a", "a")],
            ..Default::default()
        };
        assert!(matches!(looped.validate(), Err(GraphError::SelfLoop(_))));

        let doubled = WorkflowSpec {
            nodes: vec![node("a", NodeType::Action), node("b", NodeType::Action)],
            connections: vec![edge("a", "b"), edge("a", "b")],
            ..Default::default()
        };
        assert!(matches!(doubled.validate(), Err(GraphError::DuplicateEdge(_, _))));
    }

    #[test]
    fn reports_disconnected_nodes_without_failing() {
        let spec = WorkflowSpec {
            nodes: vec![
                node("a", NodeType::Action),
                node("b", NodeType::Action),
                node("island", NodeType::Action),
            ],
            connections: vec![edge("a", "b")],
            ..Default::default()
        };
        let report = spec.validate().unwrap();
        assert_eq!(report.disconnected, vec!["island".to_string()]);
    }
}
