//! Execution journal
//!
//! Idempotency wrapper keyed by an execution id. Every named state and every
//! dispatched step is recorded in the [`ExecutionStateRepository`], so
//! replaying the same execution after a crash or a redelivery either skips
//! finished work or resumes where the previous attempt stopped.
//!
//! State names must be unique per logical step of an execution: a state is
//! considered done as soon as any history entry with that name completed.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, info};

use crate::domain::execution::{ExecutionRecord, ExecutionStart};
use crate::domain::ids::{ExecutionId, FlowExecId, StepId};
use crate::domain::repository::ExecutionStateRepository;
use crate::CoreError;

/// State-machine executor over the journal store
#[derive(Clone)]
pub struct ExecutionJournal {
    repository: Arc<dyn ExecutionStateRepository>,
}

impl ExecutionJournal {
    /// Create a journal over a store
    pub fn new(repository: Arc<dyn ExecutionStateRepository>) -> Self {
        Self { repository }
    }

    /// Run `work` once for `(execution_id, state)`
    ///
    /// Returns `Ok(None)` when the state already completed. A failure is
    /// recorded against the state and returned; the state stays incomplete
    /// so the next call retries `work`.
    pub async fn execute_state<T, E, F, Fut>(
        &self,
        execution_id: &ExecutionId,
        state: &str,
        work: F,
    ) -> Result<Option<T>, E>
    where
        E: From<CoreError> + Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if self.is_state_completed(execution_id, state).await? {
            debug!(execution_id = %execution_id, state, "State already completed, skipping");
            return Ok(None);
        }

        let outcome = async {
            self.repository.update_state(execution_id, state).await?;
            let result = work().await?;
            self.repository.complete_state(execution_id, state).await?;
            Ok::<T, E>(result)
        }
        .await;

        match outcome {
            Ok(result) => Ok(Some(result)),
            Err(err) => {
                let message = err.to_string();
                if let Err(mark_err) = self
                    .repository
                    .mark_state_error(execution_id, state, &message)
                    .await
                {
                    error!(execution_id = %execution_id, state, error = %mark_err, "Failed to record state error");
                }
                Err(err)
            }
        }
    }

    /// Run the counter-then-publish pair of one step, each side effect at most once
    pub async fn execute_step<E, U, UFut, S, SFut>(
        &self,
        execution_id: &ExecutionId,
        step_id: &StepId,
        update_counter: U,
        send_message: S,
    ) -> Result<(), E>
    where
        E: From<CoreError> + Display,
        U: FnOnce() -> UFut,
        UFut: Future<Output = Result<(), E>>,
        S: FnOnce() -> SFut,
        SFut: Future<Output = Result<(), E>>,
    {
        let outcome = async {
            self.repository.initialize_step(execution_id, step_id).await?;
            let record = self.require(execution_id).await?;
            let step = record.step(step_id);

            if !step.map_or(false, |s| s.counter_updated) {
                update_counter().await?;
                self.repository
                    .mark_step_counter_updated(execution_id, step_id)
                    .await?;
            }

            if !step.map_or(false, |s| s.message_sent) {
                send_message().await?;
                self.repository
                    .mark_step_message_sent(execution_id, step_id)
                    .await?;
            }
            Ok::<(), E>(())
        }
        .await;

        if let Err(err) = &outcome {
            let message = err.to_string();
            if let Err(mark_err) = self
                .repository
                .mark_step_error(execution_id, step_id, &message)
                .await
            {
                error!(execution_id = %execution_id, step_id = %step_id, error = %mark_err, "Failed to record step error");
            }
        }
        outcome
    }

    /// Create the record if needed and report where processing should resume
    pub async fn initialize_execution(
        &self,
        execution_id: &ExecutionId,
        flow_exec_id: &FlowExecId,
        input_message: &Value,
    ) -> Result<ExecutionStart, CoreError> {
        if let Some(existing) = self.repository.find_execution(execution_id).await? {
            return Ok(Self::resume(existing));
        }

        let record = ExecutionRecord::new(
            execution_id.clone(),
            flow_exec_id.clone(),
            input_message.clone(),
            chrono::Utc::now(),
        );
        match self.repository.create_execution(record).await {
            Ok(_) => Ok(ExecutionStart::fresh()),
            Err(err) if err.is_duplicate_key() => {
                // a concurrent delivery created it first
                let existing = self.require(execution_id).await?;
                Ok(Self::resume(existing))
            }
            Err(err) => Err(err),
        }
    }

    /// Terminally complete the execution; idempotent
    pub async fn complete_execution(&self, execution_id: &ExecutionId) -> Result<(), CoreError> {
        self.repository.mark_completed(execution_id).await
    }

    /// Find an execution record
    pub async fn find_execution(&self, execution_id: &ExecutionId) -> Result<Option<ExecutionRecord>, CoreError> {
        self.repository.find_execution(execution_id).await
    }

    /// All execution records of a flow execution
    pub async fn find_by_flow_exec_id(&self, flow_exec_id: &FlowExecId) -> Result<Vec<ExecutionRecord>, CoreError> {
        self.repository.find_by_flow_exec_id(flow_exec_id).await
    }

    /// Both side effects of the step are done
    pub async fn is_step_completed(&self, execution_id: &ExecutionId, step_id: &StepId) -> Result<bool, CoreError> {
        Ok(self
            .repository
            .find_execution(execution_id)
            .await?
            .and_then(|record| record.step(step_id).map(|s| s.is_completed()))
            .unwrap_or(false))
    }

    /// Drop records completed before `cutoff`
    pub async fn purge_completed_before(&self, cutoff: chrono::DateTime<chrono::Utc>) -> Result<usize, CoreError> {
        self.repository.purge_completed_before(cutoff).await
    }

    async fn is_state_completed(&self, execution_id: &ExecutionId, state: &str) -> Result<bool, CoreError> {
        Ok(self
            .repository
            .find_execution(execution_id)
            .await?
            .map_or(false, |record| record.is_state_completed(state)))
    }

    async fn require(&self, execution_id: &ExecutionId) -> Result<ExecutionRecord, CoreError> {
        self.repository
            .find_execution(execution_id)
            .await?
            .ok_or_else(|| CoreError::ExecutionNotFound(execution_id.to_string()))
    }

    fn resume(existing: ExecutionRecord) -> ExecutionStart {
        if existing.is_completed {
            info!(execution_id = %existing.execution_id, "Execution already completed, skipping");
        } else {
            info!(
                execution_id = %existing.execution_id,
                current_state = %existing.current_state,
                "Resuming execution"
            );
        }
        ExecutionStart {
            is_completed: existing.is_completed,
            current_state: existing.current_state,
        }
    }
}
