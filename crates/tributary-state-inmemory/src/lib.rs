//! In-memory state store implementation for the Tributary orchestrator
//!
//! This crate provides in-memory implementations of the store and registry
//! interfaces defined in the tributary-core crate. It is primarily useful for
//! development, testing, and single-process deployments where persistence is
//! not required.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

pub mod repositories;
pub use repositories::{
    InMemoryComponentRegistry,
    InMemoryExecutionStateRepository,
    InMemoryFlowRegistry,
    InMemoryFlowStateRepository,
};

use repositories::DuplicateKey;
use tributary_core::{
    Component, ComponentId, ComponentRegistry, DuplicateMessageRecord, ExecutionId,
    ExecutionRecord, ExecutionStateRepository, Flow, FlowExecId, FlowExecutionCounters, FlowId,
    FlowRegistry, FlowStateRepository,
};

/// Provider for in-memory state store repositories
///
/// Repositories created from the same provider share their tables.
#[derive(Clone, Default)]
pub struct InMemoryStateStoreProvider {
    // Shared storage for execution journal records
    executions: Arc<RwLock<HashMap<ExecutionId, ExecutionRecord>>>,

    // Shared storage for flow execution counters
    flow_states: Arc<RwLock<HashMap<FlowExecId, FlowExecutionCounters>>>,

    // Shared storage for the duplicate delivery audit
    duplicates: Arc<RwLock<HashMap<DuplicateKey, DuplicateMessageRecord>>>,

    // Shared storage for flows
    flows: Arc<RwLock<HashMap<FlowId, Flow>>>,

    // Shared storage for components
    components: Arc<RwLock<HashMap<ComponentId, Component>>>,
}

impl InMemoryStateStoreProvider {
    /// Create a new in-memory state store provider
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the stores and registries the orchestrator needs
    pub fn create_repositories(&self) -> (
        Arc<dyn ExecutionStateRepository>,
        Arc<dyn FlowStateRepository>,
        Arc<dyn FlowRegistry>,
        Arc<dyn ComponentRegistry>,
    ) {
        (
            Arc::new(self.execution_state_repository()),
            Arc::new(self.flow_state_repository()),
            Arc::new(self.flow_registry()),
            Arc::new(self.component_registry()),
        )
    }

    /// Execution journal store
    pub fn execution_state_repository(&self) -> InMemoryExecutionStateRepository {
        InMemoryExecutionStateRepository::new(self.executions.clone())
    }

    /// Counters store with its duplicate audit
    pub fn flow_state_repository(&self) -> InMemoryFlowStateRepository {
        InMemoryFlowStateRepository::new(self.flow_states.clone(), self.duplicates.clone())
    }

    /// Flow registry over the shared flow table
    pub fn flow_registry(&self) -> InMemoryFlowRegistry {
        InMemoryFlowRegistry::new(self.flows.clone())
    }

    /// Component registry over the shared component table
    pub fn component_registry(&self) -> InMemoryComponentRegistry {
        InMemoryComponentRegistry::new(self.components.clone())
    }
}
