//! Repository traits for the Tributary orchestrator
//!
//! Every durable store and external registry the orchestrator talks to is
//! reached through one of these traits. Multiple orchestrator processes may
//! share a store, so each mutation is a single atomic operation on one record.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use super::component::Component;
use super::counters::{DuplicateMessageRecord, DuplicateMessageStats, FlowExecutionCounters};
use super::execution::ExecutionRecord;
use super::flow::Flow;
use super::ids::{ComponentId, ExecutionId, FlowExecId, FlowId, MessageId, StepId};
use crate::CoreError;

/// Store for execution journal records
///
/// Mutations of a record whose `is_completed` flag is set fail with
/// [`CoreError::ExecutionCompleted`]; `mark_completed` is the only exception.
#[async_trait]
pub trait ExecutionStateRepository: Send + Sync {
    /// Insert a new record; fails with [`CoreError::DuplicateKey`] if the id exists
    async fn create_execution(&self, record: ExecutionRecord) -> Result<ExecutionRecord, CoreError>;

    /// Find a record by execution id
    async fn find_execution(&self, id: &ExecutionId) -> Result<Option<ExecutionRecord>, CoreError>;

    /// All records of a flow execution
    async fn find_by_flow_exec_id(&self, flow_exec_id: &FlowExecId) -> Result<Vec<ExecutionRecord>, CoreError>;

    /// Enter `state` and append it to the history
    async fn update_state(&self, id: &ExecutionId, state: &str) -> Result<(), CoreError>;

    /// Complete the open history entry for `state`
    async fn complete_state(&self, id: &ExecutionId, state: &str) -> Result<(), CoreError>;

    /// Record an error against `state`
    async fn mark_state_error(&self, id: &ExecutionId, state: &str, error: &str) -> Result<(), CoreError>;

    /// Create the step tracking entry unless it exists
    async fn initialize_step(&self, id: &ExecutionId, step_id: &StepId) -> Result<(), CoreError>;

    /// Flag the step's counter side effect
    async fn mark_step_counter_updated(&self, id: &ExecutionId, step_id: &StepId) -> Result<(), CoreError>;

    /// Flag the step's publish side effect
    async fn mark_step_message_sent(&self, id: &ExecutionId, step_id: &StepId) -> Result<(), CoreError>;

    /// Record a step failure
    async fn mark_step_error(&self, id: &ExecutionId, step_id: &StepId, error: &str) -> Result<(), CoreError>;

    /// Terminally complete the record; idempotent
    async fn mark_completed(&self, id: &ExecutionId) -> Result<(), CoreError>;

    /// Delete records completed before `cutoff`; returns the number removed
    async fn purge_completed_before(&self, cutoff: DateTime<Utc>) -> Result<usize, CoreError>;
}

/// Store for flow execution progress counters and the duplicate audit
#[async_trait]
pub trait FlowStateRepository: Send + Sync {
    /// Find the counters row of a flow execution
    async fn find(&self, flow_exec_id: &FlowExecId) -> Result<Option<FlowExecutionCounters>, CoreError>;

    /// Increment started/succeeded, creating the row if absent
    ///
    /// May fail with [`CoreError::DuplicateKey`] when a concurrent creator wins
    /// the insert; the caller retries.
    async fn increment_counts(
        &self,
        flow_id: &FlowId,
        flow_exec_id: &FlowExecId,
        started: i64,
        succeeded: i64,
    ) -> Result<FlowExecutionCounters, CoreError>;

    /// Create the row with `started = 1` unless it exists
    async fn insert_if_absent(
        &self,
        flow_id: &FlowId,
        flow_exec_id: &FlowExecId,
        tenant: Option<String>,
    ) -> Result<FlowExecutionCounters, CoreError>;

    /// Append node markers, creating the row if absent
    async fn push_nodes(
        &self,
        flow_exec_id: &FlowExecId,
        started: &[StepId],
        succeeded: &[StepId],
    ) -> Result<FlowExecutionCounters, CoreError>;

    /// Count a step-state notification; `None` if the row does not exist
    async fn increment_step_out(
        &self,
        flow_exec_id: &FlowExecId,
        step_id: &StepId,
    ) -> Result<Option<FlowExecutionCounters>, CoreError>;

    /// Count an error against the row and the step; `None` if the row does not exist
    async fn increment_errors(
        &self,
        flow_exec_id: &FlowExecId,
        step_id: &StepId,
    ) -> Result<Option<FlowExecutionCounters>, CoreError>;

    /// Accept a delivery atomically
    ///
    /// Returns `false` without mutating counters when the row does not exist or
    /// `message_id` was already accepted for the step. Duplicates are audited
    /// best-effort.
    async fn process_step(
        &self,
        flow_exec_id: &FlowExecId,
        step_id: &StepId,
        message_id: &MessageId,
        payload: &Value,
    ) -> Result<bool, CoreError>;

    /// Insert an audit row; fails with [`CoreError::DuplicateKey`] if its key exists
    async fn record_duplicate(&self, record: DuplicateMessageRecord) -> Result<(), CoreError>;

    /// Audit rows of a flow execution, newest first
    async fn duplicate_messages(
        &self,
        flow_exec_id: &FlowExecId,
        step_id: Option<StepId>,
        limit: usize,
    ) -> Result<Vec<DuplicateMessageRecord>, CoreError>;

    /// Audit rows within a window grouped per flow execution and step
    async fn duplicate_message_stats(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DuplicateMessageStats>, CoreError>;

    /// Remove the counters row
    async fn delete(&self, flow_exec_id: &FlowExecId) -> Result<(), CoreError>;

    /// Delete audit rows detected before `cutoff`; returns the number removed
    async fn purge_duplicates_before(&self, cutoff: DateTime<Utc>) -> Result<usize, CoreError>;
}

/// External flow registry
#[async_trait]
pub trait FlowRegistry: Send + Sync {
    /// All flows
    async fn find_all(&self) -> Result<Vec<Flow>, CoreError>;

    /// Find a flow by ID
    async fn find_by_id(&self, id: &FlowId) -> Result<Option<Flow>, CoreError>;

    /// Claim a starting flow for `orchestrator_id` and move it to preparing
    ///
    /// Returns `true` when this orchestrator owns the preparation afterwards.
    async fn on_starting(&self, id: &FlowId, orchestrator_id: &str) -> Result<bool, CoreError>;

    /// The flow is preparing and owned by `orchestrator_id`
    async fn preparing_by(&self, id: &FlowId, orchestrator_id: &str) -> Result<bool, CoreError>;

    /// All workloads of the flow are provisioned
    async fn on_prepared(&self, id: &FlowId) -> Result<(), CoreError>;

    /// The flow is running
    async fn on_started(&self, id: &FlowId) -> Result<(), CoreError>;

    /// The flow has been torn down
    async fn on_stopped(&self, id: &FlowId) -> Result<(), CoreError>;
}

/// External component registry
#[async_trait]
pub trait ComponentRegistry: Send + Sync {
    /// Find a component by ID
    async fn find_by_id(&self, id: &ComponentId) -> Result<Option<Component>, CoreError>;
}
