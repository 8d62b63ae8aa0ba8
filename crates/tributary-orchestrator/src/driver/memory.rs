//! In-memory deployment driver
//!
//! Keeps workloads in a map keyed by name and records every create and
//! destroy call, so callers can assert on convergence.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info};
use tributary_core::{ComponentId, Workload};

use super::{CreateWorkload, DeploymentDriver};
use crate::error::{OrchestratorError, OrchestratorResult};

/// In-memory implementation of DeploymentDriver
#[derive(Debug, Clone, Default)]
pub struct InMemoryDeploymentDriver {
    workloads: Arc<RwLock<HashMap<String, CreateWorkload>>>,
    created: Arc<RwLock<Vec<String>>>,
    destroyed: Arc<RwLock<Vec<String>>>,
    failing_components: Arc<RwLock<HashSet<ComponentId>>>,
}

impl InMemoryDeploymentDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workload that already runs on the platform
    pub async fn insert(&self, request: CreateWorkload) {
        let name = request.workload().name;
        self.workloads.write().await.insert(name, request);
    }

    /// Make every create for `component_id` fail
    pub async fn fail_creates_for(&self, component_id: ComponentId) {
        self.failing_components.write().await.insert(component_id);
    }

    /// Undo [`fail_creates_for`](Self::fail_creates_for)
    pub async fn clear_failures(&self) {
        self.failing_components.write().await.clear();
    }

    /// Names of workloads created, in call order
    pub async fn created(&self) -> Vec<String> {
        self.created.read().await.clone()
    }

    /// Names of workloads destroyed, in call order
    pub async fn destroyed(&self) -> Vec<String> {
        self.destroyed.read().await.clone()
    }

    /// The create request behind a running workload
    pub async fn request(&self, name: &str) -> Option<CreateWorkload> {
        self.workloads.read().await.get(name).cloned()
    }
}

#[async_trait]
impl DeploymentDriver for InMemoryDeploymentDriver {
    async fn list_workloads(&self) -> OrchestratorResult<Vec<Workload>> {
        let workloads = self.workloads.read().await;
        let mut list: Vec<Workload> = workloads.values().map(CreateWorkload::workload).collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(list)
    }

    async fn create_workload(&self, request: CreateWorkload) -> OrchestratorResult<Workload> {
        if self
            .failing_components
            .read()
            .await
            .contains(&request.component.id)
        {
            return Err(OrchestratorError::DriverError(format!(
                "Failed to create workload for component {}",
                request.component.id
            )));
        }

        let workload = request.workload();
        self.created.write().await.push(workload.name.clone());

        let mut workloads = self.workloads.write().await;
        if workloads.contains_key(&workload.name) {
            debug!(workload = %workload.name, "Workload already exists");
        } else {
            info!(workload = %workload.name, "Created workload");
            workloads.insert(workload.name.clone(), request);
        }
        Ok(workload)
    }

    async fn destroy_workload(&self, workload: &Workload) -> OrchestratorResult<()> {
        self.destroyed.write().await.push(workload.name.clone());
        if self.workloads.write().await.remove(&workload.name).is_some() {
            info!(workload = %workload.name, "Destroyed workload");
        }
        Ok(())
    }
}
