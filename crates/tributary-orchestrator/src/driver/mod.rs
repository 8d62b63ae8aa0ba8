//! Deployment driver integration
//!
//! The driver owns the compute platform. The reconciler only lists, creates
//! and destroys workloads through it; placement is the driver's business.

use std::collections::HashMap;
use std::fmt::Debug;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tributary_core::{Component, FlowId, StepId, Workload};

use crate::error::OrchestratorResult;

/// Interface for deployment platform operations
#[async_trait]
pub trait DeploymentDriver: Send + Sync + Debug {
    /// All workloads currently known to the platform
    async fn list_workloads(&self) -> OrchestratorResult<Vec<Workload>>;

    /// Create a workload; creating an existing workload is not an error
    async fn create_workload(&self, request: CreateWorkload) -> OrchestratorResult<Workload>;

    /// Destroy a workload; destroying a missing workload is not an error
    async fn destroy_workload(&self, workload: &Workload) -> OrchestratorResult<()>;
}

/// Scheduling options passed through to the platform
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadOptions {
    pub replicas: u32,
    #[serde(default)]
    pub image_pull_policy: Option<String>,
}

/// Request to create one workload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWorkload {
    /// Set for flow-scoped workloads
    #[serde(default)]
    pub flow_id: Option<FlowId>,

    /// Set for flow-scoped workloads
    #[serde(default)]
    pub node_id: Option<StepId>,

    pub component: Component,

    pub env_vars: HashMap<String, String>,

    pub options: WorkloadOptions,
}

impl CreateWorkload {
    /// Request for a flow node
    pub fn for_node(
        flow_id: &FlowId,
        node_id: &StepId,
        component: Component,
        env_vars: HashMap<String, String>,
        options: WorkloadOptions,
    ) -> Self {
        Self {
            flow_id: Some(flow_id.clone()),
            node_id: Some(node_id.clone()),
            component,
            env_vars,
            options,
        }
    }

    /// Request for a global component
    pub fn for_global(component: Component, env_vars: HashMap<String, String>, options: WorkloadOptions) -> Self {
        Self {
            flow_id: None,
            node_id: None,
            component,
            env_vars,
            options,
        }
    }

    /// Identity of the workload this request creates
    pub fn workload(&self) -> Workload {
        match (&self.flow_id, &self.node_id) {
            (Some(flow_id), Some(node_id)) => Workload::for_node(flow_id, node_id, &self.component.id),
            _ => Workload::for_global(&self.component.id),
        }
    }
}

pub mod memory;

pub use memory::InMemoryDeploymentDriver;
