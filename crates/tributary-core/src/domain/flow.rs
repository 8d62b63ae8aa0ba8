//! Flow topology model
//!
//! A flow is owned and mutated by the external flow registry. The orchestrator
//! only reads it, walks its graph, and reports lifecycle transitions back
//! through the registry callbacks.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

use super::ids::{ComponentId, FlowId, StepId};

/// Flow lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowStatus {
    /// Flow is not running and owns no workloads
    Inactive,

    /// Flow start was requested and no orchestrator has claimed it yet
    Starting,

    /// An orchestrator claimed the flow and is provisioning its workloads
    Preparing,

    /// Flow is running
    Active,

    /// Flow stop was requested
    Stopping,
}

/// A single step of a flow graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowNode {
    /// Node ID, unique within the flow
    pub id: StepId,

    /// Component that executes this node
    pub component_id: ComponentId,

    /// Component function to invoke
    #[serde(default)]
    pub function: String,

    /// Credential (secret) reference
    #[serde(default, rename = "credentials_id")]
    pub credentials_id: Option<String>,

    /// Static fields handed to the component
    #[serde(default)]
    pub fields: Value,

    /// Node-level settings
    #[serde(default)]
    pub node_settings: Value,

    /// Node runs with privileged control-message rights
    #[serde(default)]
    pub privileged: bool,
}

impl FlowNode {
    /// Create a node with empty fields and settings
    pub fn new(id: impl Into<StepId>, component_id: impl Into<ComponentId>, function: &str) -> Self {
        Self {
            id: id.into(),
            component_id: component_id.into(),
            function: function.to_string(),
            credentials_id: None,
            fields: Value::Object(Default::default()),
            node_settings: Value::Object(Default::default()),
            privileged: false,
        }
    }
}

/// A directed edge between two flow nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowEdge {
    /// Source node
    pub source: StepId,

    /// Target node
    pub target: StepId,
}

/// Flow graph
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowGraph {
    /// Nodes of the graph
    #[serde(default)]
    pub nodes: Vec<FlowNode>,

    /// Edges of the graph
    #[serde(default)]
    pub edges: Vec<FlowEdge>,
}

/// Aggregate: Flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flow {
    /// Unique identifier
    pub id: FlowId,

    /// Flow graph
    pub graph: FlowGraph,

    /// Lifecycle status
    pub status: FlowStatus,

    /// User that started the flow
    #[serde(default)]
    pub started_by: Option<String>,

    /// Owning tenant
    #[serde(default)]
    pub tenant: Option<String>,

    /// Orchestrator instance that claimed the preparation of this flow
    #[serde(default)]
    pub preparing_by: Option<String>,
}

impl Flow {
    /// Create a new flow in the given status
    pub fn new(id: impl Into<FlowId>, graph: FlowGraph, status: FlowStatus) -> Self {
        Self {
            id: id.into(),
            graph,
            status,
            started_by: None,
            tenant: None,
            preparing_by: None,
        }
    }

    /// All nodes of the flow graph
    pub fn nodes(&self) -> &[FlowNode] {
        &self.graph.nodes
    }

    /// Node properties by node id
    pub fn node(&self, node_id: &StepId) -> Option<&FlowNode> {
        self.graph.nodes.iter().find(|node| &node.id == node_id)
    }

    /// The entry node: the first node that is no edge's target
    pub fn first_node(&self) -> Option<&FlowNode> {
        let targets: HashSet<&StepId> = self.graph.edges.iter().map(|e| &e.target).collect();
        self.graph
            .nodes
            .iter()
            .find(|node| !targets.contains(&node.id))
    }

    /// Ids of the nodes that directly follow `step_id`, in edge order
    pub fn next_steps(&self, step_id: &StepId) -> Vec<StepId> {
        self.graph
            .edges
            .iter()
            .filter(|edge| &edge.source == step_id)
            .map(|edge| edge.target.clone())
            .collect()
    }

    /// Flow start was requested
    pub fn is_starting(&self) -> bool {
        self.status == FlowStatus::Starting
    }

    /// Flow is being provisioned
    pub fn is_preparing(&self) -> bool {
        self.status == FlowStatus::Preparing
    }

    /// Flow stop was requested
    pub fn is_stopping(&self) -> bool {
        self.status == FlowStatus::Stopping
    }

    /// Flow needs workloads (everything except inactive flows)
    pub fn is_managed(&self) -> bool {
        self.status != FlowStatus::Inactive
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(source: &str, target: &str) -> FlowEdge {
        FlowEdge {
            source: StepId::from(source),
            target: StepId::from(target),
        }
    }

    fn diamond() -> Flow {
        let graph = FlowGraph {
            nodes: vec![
                FlowNode::new("b", "comp-b", "process"),
                FlowNode::new("a", "comp-a", "trigger"),
                FlowNode::new("c", "comp-c", "process"),
                FlowNode::new("d", "comp-d", "sink"),
            ],
            edges: vec![edge("a", "b"), edge("a", "c"), edge("b", "d"), edge("c", "d")],
        };
        Flow::new("flow-1", graph, FlowStatus::Active)
    }

    #[test]
    fn test_first_node_ignores_declaration_order() {
        let flow = diamond();
        assert_eq!(flow.first_node().map(|n| n.id.as_str()), Some("a"));
    }

    #[test]
    fn test_next_steps_follow_edges() {
        let flow = diamond();
        assert_eq!(
            flow.next_steps(&StepId::from("a")),
            vec![StepId::from("b"), StepId::from("c")]
        );
        assert!(flow.next_steps(&StepId::from("d")).is_empty());
    }

    #[test]
    fn test_node_lookup_and_status() {
        let flow = diamond();
        assert_eq!(
            flow.node(&StepId::from("c")).map(|n| n.component_id.as_str()),
            Some("comp-c")
        );
        assert!(flow.node(&StepId::from("zz")).is_none());
        assert!(flow.is_managed());
        assert!(!flow.is_stopping());
    }

    #[test]
    fn test_flow_deserializes_camel_case() {
        let flow: Flow = serde_json::from_value(serde_json::json!({
            "id": "f1",
            "status": "preparing",
            "startedBy": "user-1",
            "graph": {
                "nodes": [{ "id": "s1", "componentId": "c1", "function": "run", "credentials_id": "secret-1" }],
                "edges": []
            }
        }))
        .unwrap();

        assert!(flow.is_preparing());
        assert_eq!(flow.started_by.as_deref(), Some("user-1"));
        assert_eq!(flow.nodes()[0].credentials_id.as_deref(), Some("secret-1"));
    }
}
