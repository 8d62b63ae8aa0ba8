use std::collections::HashMap;
use std::sync::Arc;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, error};

use tributary_core::{
    domain::counters::duplicate_message_stats,
    Component, ComponentId, ComponentRegistry, CoreError, DuplicateMessageRecord,
    DuplicateMessageStats, ExecutionId, ExecutionRecord, ExecutionStateRepository, Flow,
    FlowExecId, FlowExecutionCounters, FlowId, FlowRegistry, FlowStateRepository, FlowStatus,
    MessageId, StepId,
};

/// Key of a duplicate audit row
pub type DuplicateKey = (FlowExecId, StepId, MessageId);

/// In-memory implementation of the ExecutionStateRepository
pub struct InMemoryExecutionStateRepository {
    executions: Arc<RwLock<HashMap<ExecutionId, ExecutionRecord>>>,
}

impl InMemoryExecutionStateRepository {
    /// Create a new in-memory execution journal
    pub fn new(executions: Arc<RwLock<HashMap<ExecutionId, ExecutionRecord>>>) -> Self {
        Self { executions }
    }

    async fn update<F>(&self, id: &ExecutionId, apply: F) -> Result<(), CoreError>
    where
        F: FnOnce(&mut ExecutionRecord, DateTime<Utc>) -> Result<(), CoreError> + Send,
    {
        let mut executions = self.executions.write().await;
        let record = executions
            .get_mut(id)
            .ok_or_else(|| CoreError::ExecutionNotFound(id.to_string()))?;
        apply(record, Utc::now())
    }
}

#[async_trait]
impl ExecutionStateRepository for InMemoryExecutionStateRepository {
    async fn create_execution(&self, record: ExecutionRecord) -> Result<ExecutionRecord, CoreError> {
        let mut executions = self.executions.write().await;
        if executions.contains_key(&record.execution_id) {
            return Err(CoreError::DuplicateKey(format!(
                "executionId {}",
                record.execution_id
            )));
        }
        executions.insert(record.execution_id.clone(), record.clone());
        Ok(record)
    }

    async fn find_execution(&self, id: &ExecutionId) -> Result<Option<ExecutionRecord>, CoreError> {
        let executions = self.executions.read().await;
        Ok(executions.get(id).cloned())
    }

    async fn find_by_flow_exec_id(&self, flow_exec_id: &FlowExecId) -> Result<Vec<ExecutionRecord>, CoreError> {
        let executions = self.executions.read().await;
        Ok(executions
            .values()
            .filter(|record| &record.flow_exec_id == flow_exec_id)
            .cloned()
            .collect())
    }

    async fn update_state(&self, id: &ExecutionId, state: &str) -> Result<(), CoreError> {
        self.update(id, |record, now| record.begin_state(state, now)).await
    }

    async fn complete_state(&self, id: &ExecutionId, state: &str) -> Result<(), CoreError> {
        self.update(id, |record, now| record.complete_state(state, now)).await
    }

    async fn mark_state_error(&self, id: &ExecutionId, state: &str, error: &str) -> Result<(), CoreError> {
        self.update(id, |record, _| record.mark_state_error(state, error)).await
    }

    async fn initialize_step(&self, id: &ExecutionId, step_id: &StepId) -> Result<(), CoreError> {
        self.update(id, |record, _| record.initialize_step(step_id)).await
    }

    async fn mark_step_counter_updated(&self, id: &ExecutionId, step_id: &StepId) -> Result<(), CoreError> {
        self.update(id, |record, _| record.mark_step_counter_updated(step_id)).await
    }

    async fn mark_step_message_sent(&self, id: &ExecutionId, step_id: &StepId) -> Result<(), CoreError> {
        self.update(id, |record, now| record.mark_step_message_sent(step_id, now)).await
    }

    async fn mark_step_error(&self, id: &ExecutionId, step_id: &StepId, error: &str) -> Result<(), CoreError> {
        self.update(id, |record, now| record.mark_step_error(step_id, error, now)).await
    }

    async fn mark_completed(&self, id: &ExecutionId) -> Result<(), CoreError> {
        self.update(id, |record, now| {
            record.mark_completed(now);
            Ok(())
        })
        .await
    }

    async fn purge_completed_before(&self, cutoff: DateTime<Utc>) -> Result<usize, CoreError> {
        let mut executions = self.executions.write().await;
        let before = executions.len();
        executions.retain(|_, record| match record.completed_at {
            Some(completed_at) if record.is_completed => completed_at >= cutoff,
            _ => true,
        });
        Ok(before - executions.len())
    }
}

/// In-memory implementation of the FlowStateRepository
///
/// Lock order is always `states` before `duplicates`.
pub struct InMemoryFlowStateRepository {
    states: Arc<RwLock<HashMap<FlowExecId, FlowExecutionCounters>>>,
    duplicates: Arc<RwLock<HashMap<DuplicateKey, DuplicateMessageRecord>>>,
}

impl InMemoryFlowStateRepository {
    /// Create a new in-memory counters store
    pub fn new(
        states: Arc<RwLock<HashMap<FlowExecId, FlowExecutionCounters>>>,
        duplicates: Arc<RwLock<HashMap<DuplicateKey, DuplicateMessageRecord>>>,
    ) -> Self {
        Self { states, duplicates }
    }
}

#[async_trait]
impl FlowStateRepository for InMemoryFlowStateRepository {
    async fn find(&self, flow_exec_id: &FlowExecId) -> Result<Option<FlowExecutionCounters>, CoreError> {
        let states = self.states.read().await;
        Ok(states.get(flow_exec_id).cloned())
    }

    async fn increment_counts(
        &self,
        flow_id: &FlowId,
        flow_exec_id: &FlowExecId,
        started: i64,
        succeeded: i64,
    ) -> Result<FlowExecutionCounters, CoreError> {
        let now = Utc::now();
        let mut states = self.states.write().await;
        let row = states
            .entry(flow_exec_id.clone())
            .or_insert_with(|| FlowExecutionCounters::new(flow_exec_id.clone(), Some(flow_id.clone()), now));
        if row.flow_id.is_none() {
            row.flow_id = Some(flow_id.clone());
        }
        row.apply_counts(started, succeeded, now);
        Ok(row.clone())
    }

    async fn insert_if_absent(
        &self,
        flow_id: &FlowId,
        flow_exec_id: &FlowExecId,
        tenant: Option<String>,
    ) -> Result<FlowExecutionCounters, CoreError> {
        let now = Utc::now();
        let mut states = self.states.write().await;
        let row = states.entry(flow_exec_id.clone()).or_insert_with(|| {
            let mut row = FlowExecutionCounters::new(flow_exec_id.clone(), Some(flow_id.clone()), now);
            row.tenant = tenant;
            row.started = 1;
            row
        });
        Ok(row.clone())
    }

    async fn push_nodes(
        &self,
        flow_exec_id: &FlowExecId,
        started: &[StepId],
        succeeded: &[StepId],
    ) -> Result<FlowExecutionCounters, CoreError> {
        let now = Utc::now();
        let mut states = self.states.write().await;
        let row = states
            .entry(flow_exec_id.clone())
            .or_insert_with(|| FlowExecutionCounters::new(flow_exec_id.clone(), None, now));
        row.push_nodes(started, succeeded, now);
        Ok(row.clone())
    }

    async fn increment_step_out(
        &self,
        flow_exec_id: &FlowExecId,
        step_id: &StepId,
    ) -> Result<Option<FlowExecutionCounters>, CoreError> {
        let mut states = self.states.write().await;
        Ok(states.get_mut(flow_exec_id).map(|row| {
            row.record_step_out(step_id, Utc::now());
            row.clone()
        }))
    }

    async fn increment_errors(
        &self,
        flow_exec_id: &FlowExecId,
        step_id: &StepId,
    ) -> Result<Option<FlowExecutionCounters>, CoreError> {
        let mut states = self.states.write().await;
        Ok(states.get_mut(flow_exec_id).map(|row| {
            row.record_error(step_id, Utc::now());
            row.clone()
        }))
    }

    async fn process_step(
        &self,
        flow_exec_id: &FlowExecId,
        step_id: &StepId,
        message_id: &MessageId,
        payload: &Value,
    ) -> Result<bool, CoreError> {
        // the write guard spans the existence check and the increment
        let mut states = self.states.write().await;
        let Some(row) = states.get_mut(flow_exec_id) else {
            debug!(flow_exec_id = %flow_exec_id, step_id = %step_id, "No counters row, step not processed");
            return Ok(false);
        };

        if row.has_processed(step_id, message_id) {
            let audit = DuplicateMessageRecord {
                flow_exec_id: flow_exec_id.clone(),
                step_id: step_id.clone(),
                message_id: message_id.clone(),
                original_message: payload.clone(),
                detected_at: Utc::now(),
            };
            match self.record_duplicate(audit).await {
                Ok(()) => {}
                Err(err) if err.is_duplicate_key() => {}
                Err(err) => {
                    error!(
                        flow_exec_id = %flow_exec_id,
                        step_id = %step_id,
                        message_id = %message_id,
                        error = %err,
                        "Failed to track duplicate message"
                    );
                }
            }
            return Ok(false);
        }

        row.record_step_in(step_id, message_id.clone(), Utc::now());
        Ok(true)
    }

    async fn record_duplicate(&self, record: DuplicateMessageRecord) -> Result<(), CoreError> {
        let mut duplicates = self.duplicates.write().await;
        let key = record.key();
        if duplicates.contains_key(&key) {
            return Err(CoreError::DuplicateKey(format!(
                "duplicate message {}/{}/{}",
                key.0, key.1, key.2
            )));
        }
        duplicates.insert(key, record);
        Ok(())
    }

    async fn duplicate_messages(
        &self,
        flow_exec_id: &FlowExecId,
        step_id: Option<StepId>,
        limit: usize,
    ) -> Result<Vec<DuplicateMessageRecord>, CoreError> {
        let duplicates = self.duplicates.read().await;
        let mut rows: Vec<DuplicateMessageRecord> = duplicates
            .values()
            .filter(|record| &record.flow_exec_id == flow_exec_id)
            .filter(|record| step_id.as_ref().map_or(true, |step| &record.step_id == step))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.detected_at.cmp(&a.detected_at));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn duplicate_message_stats(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DuplicateMessageStats>, CoreError> {
        let duplicates = self.duplicates.read().await;
        Ok(duplicate_message_stats(duplicates.values(), from, to))
    }

    async fn delete(&self, flow_exec_id: &FlowExecId) -> Result<(), CoreError> {
        let mut states = self.states.write().await;
        states.remove(flow_exec_id);
        Ok(())
    }

    async fn purge_duplicates_before(&self, cutoff: DateTime<Utc>) -> Result<usize, CoreError> {
        let mut duplicates = self.duplicates.write().await;
        let before = duplicates.len();
        duplicates.retain(|_, record| record.detected_at >= cutoff);
        Ok(before - duplicates.len())
    }
}

/// In-memory implementation of the FlowRegistry
///
/// Besides the registry contract it exposes `save`, `remove` and `set_status`
/// so callers can play the role of the flow CRUD API.
pub struct InMemoryFlowRegistry {
    flows: Arc<RwLock<HashMap<FlowId, Flow>>>,
}

impl InMemoryFlowRegistry {
    /// Create a new in-memory flow registry
    pub fn new(flows: Arc<RwLock<HashMap<FlowId, Flow>>>) -> Self {
        Self { flows }
    }

    /// Insert or replace a flow
    pub async fn save(&self, flow: Flow) {
        let mut flows = self.flows.write().await;
        flows.insert(flow.id.clone(), flow);
    }

    /// Remove a flow
    pub async fn remove(&self, id: &FlowId) -> Option<Flow> {
        let mut flows = self.flows.write().await;
        flows.remove(id)
    }

    /// Request a lifecycle transition
    pub async fn set_status(&self, id: &FlowId, status: FlowStatus) -> Result<(), CoreError> {
        self.with_flow(id, |flow| {
            flow.status = status;
            if status != FlowStatus::Preparing {
                flow.preparing_by = None;
            }
        })
        .await
    }

    async fn with_flow<F>(&self, id: &FlowId, apply: F) -> Result<(), CoreError>
    where
        F: FnOnce(&mut Flow) + Send,
    {
        let mut flows = self.flows.write().await;
        let flow = flows
            .get_mut(id)
            .ok_or_else(|| CoreError::FlowNotFound(id.to_string()))?;
        apply(flow);
        Ok(())
    }
}

#[async_trait]
impl FlowRegistry for InMemoryFlowRegistry {
    async fn find_all(&self) -> Result<Vec<Flow>, CoreError> {
        let flows = self.flows.read().await;
        let mut all: Vec<Flow> = flows.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    async fn find_by_id(&self, id: &FlowId) -> Result<Option<Flow>, CoreError> {
        let flows = self.flows.read().await;
        Ok(flows.get(id).cloned())
    }

    async fn on_starting(&self, id: &FlowId, orchestrator_id: &str) -> Result<bool, CoreError> {
        let mut flows = self.flows.write().await;
        let flow = flows
            .get_mut(id)
            .ok_or_else(|| CoreError::FlowNotFound(id.to_string()))?;
        match flow.status {
            FlowStatus::Starting => {
                flow.status = FlowStatus::Preparing;
                flow.preparing_by = Some(orchestrator_id.to_string());
                Ok(true)
            }
            FlowStatus::Preparing => Ok(flow.preparing_by.as_deref() == Some(orchestrator_id)),
            _ => Ok(false),
        }
    }

    async fn preparing_by(&self, id: &FlowId, orchestrator_id: &str) -> Result<bool, CoreError> {
        let flows = self.flows.read().await;
        Ok(flows.get(id).map_or(false, |flow| {
            flow.is_preparing() && flow.preparing_by.as_deref() == Some(orchestrator_id)
        }))
    }

    async fn on_prepared(&self, id: &FlowId) -> Result<(), CoreError> {
        self.with_flow(id, |flow| flow.preparing_by = None).await
    }

    async fn on_started(&self, id: &FlowId) -> Result<(), CoreError> {
        self.with_flow(id, |flow| flow.status = FlowStatus::Active).await
    }

    async fn on_stopped(&self, id: &FlowId) -> Result<(), CoreError> {
        self.with_flow(id, |flow| {
            flow.status = FlowStatus::Inactive;
            flow.preparing_by = None;
        })
        .await
    }
}

/// In-memory implementation of the ComponentRegistry
pub struct InMemoryComponentRegistry {
    components: Arc<RwLock<HashMap<ComponentId, Component>>>,
}

impl InMemoryComponentRegistry {
    /// Create a new in-memory component registry
    pub fn new(components: Arc<RwLock<HashMap<ComponentId, Component>>>) -> Self {
        Self { components }
    }

    /// Insert or replace a component
    pub async fn save(&self, component: Component) {
        let mut components = self.components.write().await;
        components.insert(component.id.clone(), component);
    }
}

#[async_trait]
impl ComponentRegistry for InMemoryComponentRegistry {
    async fn find_by_id(&self, id: &ComponentId) -> Result<Option<Component>, CoreError> {
        let components = self.components.read().await;
        Ok(components.get(id).cloned())
    }
}
