//! Progress counter store
//!
//! Wraps a [`FlowStateRepository`] with the retry discipline for racing
//! creators: an increment that loses the insert race to another process sees
//! a duplicate-key error and is replayed, a bounded number of times.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use crate::domain::counters::{
    DuplicateMessageRecord, DuplicateMessageStats, FlowExecutionCounters, DEFAULT_DUPLICATE_LIMIT,
};
use crate::domain::ids::{FlowExecId, FlowId, MessageId, StepId};
use crate::domain::repository::FlowStateRepository;
use crate::CoreError;

/// Bounded retry with exponential backoff for duplicate-key conflicts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,

    /// Delay before the first retry; doubled on each further retry
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(25),
        }
    }
}

impl RetryPolicy {
    /// Create a policy; at least one attempt is always made
    pub fn new(max_attempts: u32, initial_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
        }
    }

    /// Run `op` until it succeeds, fails with a non-duplicate error, or attempts run out
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, CoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CoreError>>,
    {
        let mut backoff = self.initial_backoff;
        let mut attempt = 1;
        loop {
            match op().await {
                Err(err) if err.is_duplicate_key() && attempt < self.max_attempts => {
                    debug!(operation, attempt, "Duplicate key on upsert, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                    attempt += 1;
                }
                Err(err) if err.is_duplicate_key() => {
                    warn!(operation, attempts = attempt, "Giving up after repeated duplicate key errors");
                    return Err(err);
                }
                other => return other,
            }
        }
    }
}

/// Durable started/succeeded/error tallies per flow execution and step
#[derive(Clone)]
pub struct ProgressCounterStore {
    repository: Arc<dyn FlowStateRepository>,
    retry: RetryPolicy,
}

impl ProgressCounterStore {
    /// Create a store with the default retry policy
    pub fn new(repository: Arc<dyn FlowStateRepository>) -> Self {
        Self::with_retry(repository, RetryPolicy::default())
    }

    /// Create a store with an explicit retry policy
    pub fn with_retry(repository: Arc<dyn FlowStateRepository>, retry: RetryPolicy) -> Self {
        Self { repository, retry }
    }

    /// Increment started/succeeded, creating the row on first use
    pub async fn upsert_count(
        &self,
        flow_id: &FlowId,
        flow_exec_id: &FlowExecId,
        started: i64,
        succeeded: i64,
    ) -> Result<FlowExecutionCounters, CoreError> {
        self.retry
            .run("upsert_count", || {
                self.repository
                    .increment_counts(flow_id, flow_exec_id, started, succeeded)
            })
            .await
    }

    /// Create the row with `started = 1` unless it exists
    pub async fn upsert_state(
        &self,
        flow_id: &FlowId,
        flow_exec_id: &FlowExecId,
        tenant: Option<&str>,
    ) -> Result<FlowExecutionCounters, CoreError> {
        self.retry
            .run("upsert_state", || {
                self.repository
                    .insert_if_absent(flow_id, flow_exec_id, tenant.map(str::to_string))
            })
            .await
    }

    /// Append started/succeeded node markers
    pub async fn upsert(
        &self,
        flow_exec_id: &FlowExecId,
        started: &[StepId],
        succeeded: &[StepId],
    ) -> Result<FlowExecutionCounters, CoreError> {
        self.retry
            .run("upsert", || {
                self.repository.push_nodes(flow_exec_id, started, succeeded)
            })
            .await
    }

    /// Accept a delivery for a step; `false` for duplicates and unknown executions
    pub async fn process_step(
        &self,
        flow_exec_id: &FlowExecId,
        step_id: &StepId,
        message_id: &MessageId,
        payload: &Value,
    ) -> Result<bool, CoreError> {
        self.repository
            .process_step(flow_exec_id, step_id, message_id, payload)
            .await
    }

    /// Count a step-state notification
    pub async fn record_step_out(
        &self,
        flow_exec_id: &FlowExecId,
        step_id: &StepId,
    ) -> Result<Option<FlowExecutionCounters>, CoreError> {
        self.repository.increment_step_out(flow_exec_id, step_id).await
    }

    /// Count a step error
    pub async fn record_step_error(
        &self,
        flow_exec_id: &FlowExecId,
        step_id: &StepId,
    ) -> Result<Option<FlowExecutionCounters>, CoreError> {
        self.repository.increment_errors(flow_exec_id, step_id).await
    }

    /// Counters row of a flow execution
    pub async fn find_by_flow_exec_id(
        &self,
        flow_exec_id: &FlowExecId,
    ) -> Result<Option<FlowExecutionCounters>, CoreError> {
        self.repository.find(flow_exec_id).await
    }

    /// Remove the counters row
    pub async fn delete(&self, flow_exec_id: &FlowExecId) -> Result<(), CoreError> {
        self.repository.delete(flow_exec_id).await
    }

    /// Rejected duplicate deliveries, newest first
    pub async fn duplicate_messages(
        &self,
        flow_exec_id: &FlowExecId,
        step_id: Option<&StepId>,
        limit: Option<usize>,
    ) -> Result<Vec<DuplicateMessageRecord>, CoreError> {
        self.repository
            .duplicate_messages(
                flow_exec_id,
                step_id.cloned(),
                limit.unwrap_or(DEFAULT_DUPLICATE_LIMIT),
            )
            .await
    }

    /// Duplicate deliveries per flow execution and step within a window
    pub async fn duplicate_message_stats(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DuplicateMessageStats>, CoreError> {
        self.repository.duplicate_message_stats(from, to).await
    }

    /// Drop audit rows detected before `cutoff`
    pub async fn purge_duplicates_before(&self, cutoff: DateTime<Utc>) -> Result<usize, CoreError> {
        self.repository.purge_duplicates_before(cutoff).await
    }
}
