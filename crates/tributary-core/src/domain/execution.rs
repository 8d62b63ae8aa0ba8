//! Execution journal records
//!
//! One [`ExecutionRecord`] tracks a single processing attempt of an inbound
//! delivery or flow start. State and step bookkeeping lives on the record
//! itself so every store applies the same invariants.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ids::{ExecutionId, FlowExecId, StepId};
use crate::CoreError;

/// State every new execution starts in
pub const INITIAL_STATE: &str = "STARTED";

/// Completed executions are kept for this many days
pub const EXECUTION_RETENTION_DAYS: i64 = 7;

/// One entry of the state history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateHistoryEntry {
    /// State name
    pub state: String,

    /// When the state was entered
    pub started_at: DateTime<Utc>,

    /// When the state completed
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,

    /// Error recorded against this state
    #[serde(default)]
    pub error: Option<String>,
}

/// Per-step bookkeeping of the counter-bump-then-publish pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepExecution {
    /// Step the pair targets
    pub step_id: StepId,

    /// Counter side effect done
    pub counter_updated: bool,

    /// Publish side effect done
    pub message_sent: bool,

    /// When the step finished (successfully or not)
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,

    /// Last error
    #[serde(default)]
    pub error: Option<String>,
}

impl StepExecution {
    fn new(step_id: StepId) -> Self {
        Self {
            step_id,
            counter_updated: false,
            message_sent: false,
            completed_at: None,
            error: None,
        }
    }

    /// Both side effects are done
    pub fn is_completed(&self) -> bool {
        self.counter_updated && self.message_sent && self.completed_at.is_some()
    }
}

/// Durable idempotency ledger entry for one processing attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    /// Unique key of the processing attempt
    pub execution_id: ExecutionId,

    /// Flow execution this attempt belongs to
    pub flow_exec_id: FlowExecId,

    /// Last state entered
    pub current_state: String,

    /// Every state entered, in order
    pub state_history: Vec<StateHistoryEntry>,

    /// Step dispatch bookkeeping
    pub step_executions: Vec<StepExecution>,

    /// Message that triggered the execution
    pub input_message: Value,

    /// Terminal flag
    pub is_completed: bool,

    /// When the execution was marked completed
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionRecord {
    /// Create a fresh record in [`INITIAL_STATE`]
    pub fn new(
        execution_id: ExecutionId,
        flow_exec_id: FlowExecId,
        input_message: Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            execution_id,
            flow_exec_id,
            current_state: INITIAL_STATE.to_string(),
            state_history: vec![StateHistoryEntry {
                state: INITIAL_STATE.to_string(),
                started_at: now,
                completed_at: None,
                error: None,
            }],
            step_executions: Vec::new(),
            input_message,
            is_completed: false,
            completed_at: None,
        }
    }

    /// A state counts as completed once any history entry for it has `completed_at`
    pub fn is_state_completed(&self, state: &str) -> bool {
        self.state_history
            .iter()
            .any(|entry| entry.state == state && entry.completed_at.is_some())
    }

    /// Step bookkeeping, if initialized
    pub fn step(&self, step_id: &StepId) -> Option<&StepExecution> {
        self.step_executions.iter().find(|s| &s.step_id == step_id)
    }

    fn ensure_mutable(&self) -> Result<(), CoreError> {
        if self.is_completed {
            return Err(CoreError::ExecutionCompleted(self.execution_id.to_string()));
        }
        Ok(())
    }

    fn step_mut(&mut self, step_id: &StepId) -> Result<&mut StepExecution, CoreError> {
        let execution_id = self.execution_id.to_string();
        self.step_executions
            .iter_mut()
            .find(|s| &s.step_id == step_id)
            .ok_or_else(|| {
                CoreError::StateStoreError(format!(
                    "step {} not initialized for execution {}",
                    step_id, execution_id
                ))
            })
    }

    /// Enter a state
    pub fn begin_state(&mut self, state: &str, now: DateTime<Utc>) -> Result<(), CoreError> {
        self.ensure_mutable()?;
        self.current_state = state.to_string();
        self.state_history.push(StateHistoryEntry {
            state: state.to_string(),
            started_at: now,
            completed_at: None,
            error: None,
        });
        Ok(())
    }

    /// Complete the newest open, error-free history entry for `state`
    pub fn complete_state(&mut self, state: &str, now: DateTime<Utc>) -> Result<(), CoreError> {
        self.ensure_mutable()?;
        if let Some(entry) = self
            .state_history
            .iter_mut()
            .rev()
            .find(|entry| entry.state == state && entry.completed_at.is_none() && entry.error.is_none())
        {
            entry.completed_at = Some(now);
        }
        Ok(())
    }

    /// Record an error against the latest open entry for `state`
    pub fn mark_state_error(&mut self, state: &str, error: &str) -> Result<(), CoreError> {
        self.ensure_mutable()?;
        if let Some(entry) = self
            .state_history
            .iter_mut()
            .rev()
            .find(|entry| entry.state == state && entry.completed_at.is_none())
        {
            entry.error = Some(error.to_string());
        }
        Ok(())
    }

    /// Initialize step bookkeeping unless it already exists
    pub fn initialize_step(&mut self, step_id: &StepId) -> Result<(), CoreError> {
        self.ensure_mutable()?;
        if self.step(step_id).is_none() {
            self.step_executions.push(StepExecution::new(step_id.clone()));
        }
        Ok(())
    }

    /// Flag the counter side effect of a step as done
    pub fn mark_step_counter_updated(&mut self, step_id: &StepId) -> Result<(), CoreError> {
        self.ensure_mutable()?;
        self.step_mut(step_id)?.counter_updated = true;
        Ok(())
    }

    /// Flag the publish side effect of a step as done
    pub fn mark_step_message_sent(&mut self, step_id: &StepId, now: DateTime<Utc>) -> Result<(), CoreError> {
        self.ensure_mutable()?;
        let step = self.step_mut(step_id)?;
        step.message_sent = true;
        step.completed_at = Some(now);
        step.error = None;
        Ok(())
    }

    /// Record a step failure
    pub fn mark_step_error(&mut self, step_id: &StepId, error: &str, now: DateTime<Utc>) -> Result<(), CoreError> {
        self.ensure_mutable()?;
        let step = self.step_mut(step_id)?;
        step.error = Some(error.to_string());
        step.completed_at = Some(now);
        Ok(())
    }

    /// Mark the execution terminally done; repeated calls keep the first timestamp
    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        if !self.is_completed {
            self.is_completed = true;
            self.completed_at = Some(now);
        }
    }

    /// Completed longer than `retention` ago
    pub fn is_expired(&self, now: DateTime<Utc>, retention: Duration) -> bool {
        match self.completed_at {
            Some(completed_at) if self.is_completed => completed_at + retention <= now,
            _ => false,
        }
    }
}

/// Outcome of initializing an execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionStart {
    /// Execution already finished; the caller must skip all work
    pub is_completed: bool,

    /// State to resume from
    pub current_state: String,
}

impl ExecutionStart {
    /// Fresh execution
    pub fn fresh() -> Self {
        Self {
            is_completed: false,
            current_state: INITIAL_STATE.to_string(),
        }
    }
}
