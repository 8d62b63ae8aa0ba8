//! Component and workload model

use serde::{Deserialize, Serialize};

use super::ids::{ComponentId, FlowId, StepId};

/// Special capabilities granted to a component
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpecialFlags {
    /// Component may send orchestrator control messages
    #[serde(default)]
    pub privileged_component: bool,
}

/// Component registry entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Component {
    /// Unique identifier
    pub id: ComponentId,

    /// One shared instance serves every flow that uses this component
    #[serde(default)]
    pub is_global: bool,

    /// Special capabilities
    #[serde(default)]
    pub special_flags: SpecialFlags,
}

impl Component {
    /// Create a flow-scoped component
    pub fn local(id: impl Into<ComponentId>) -> Self {
        Self {
            id: id.into(),
            is_global: false,
            special_flags: SpecialFlags::default(),
        }
    }

    /// Create a global component
    pub fn global(id: impl Into<ComponentId>) -> Self {
        Self {
            is_global: true,
            ..Self::local(id)
        }
    }
}

/// Workload scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadKind {
    /// Backs exactly one node of one flow
    Flow,

    /// Backs a global component shared across flows
    Global,
}

/// A running compute unit as reported by the deployment driver.
///
/// Workloads are discovered on every reconciliation tick and never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workload {
    /// Driver-level name
    pub name: String,

    /// Owning flow, for flow-scoped workloads
    #[serde(default)]
    pub flow_id: Option<FlowId>,

    /// Backed node, for flow-scoped workloads
    #[serde(default)]
    pub node_id: Option<StepId>,

    /// Component running in the workload
    pub component_id: ComponentId,

    /// Workload scope
    #[serde(rename = "type")]
    pub kind: WorkloadKind,
}

impl Workload {
    /// Workload backing one flow node
    pub fn for_node(flow_id: &FlowId, node_id: &StepId, component_id: &ComponentId) -> Self {
        Self {
            name: format!("flow-{}-{}", flow_id, node_id),
            flow_id: Some(flow_id.clone()),
            node_id: Some(node_id.clone()),
            component_id: component_id.clone(),
            kind: WorkloadKind::Flow,
        }
    }

    /// Workload backing a global component
    pub fn for_global(component_id: &ComponentId) -> Self {
        Self {
            name: format!("global-{}", component_id),
            flow_id: None,
            node_id: None,
            component_id: component_id.clone(),
            kind: WorkloadKind::Global,
        }
    }

    /// Check if this workload is a shared global component
    pub fn is_global(&self) -> bool {
        self.kind == WorkloadKind::Global
    }
}
