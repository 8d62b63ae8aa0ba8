//! Inbound message handling
//!
//! Consumes the backchannel and the error queue. Every backchannel delivery
//! maps onto one journal execution whose id is derived from the delivery
//! itself, so a redelivered message resumes or skips instead of repeating
//! side effects.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, info_span, warn, Instrument};
use tributary_core::{
    CoreError, ExecutionId, ExecutionJournal, Flow, FlowId, FlowRegistry, ProgressCounterStore,
    StepId, INITIAL_STATE,
};

use crate::broker::{
    InboundMessage, MessageHandler, MESSAGE_ID_HEADER, ORCHESTRATOR_TOKEN_HEADER,
    REBOUND_REASON_HEADER,
};
use crate::dispatch::{DispatchContext, DispatchTarget, MessageDispatcher};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::token::ContinuationClaims;

/// Journal state names, one per logical step
pub mod states {
    pub const STEP_STATE_RECORD_OUT: &str = "STEP_STATE_RECORD_OUT";
    pub const STEP_STATE_COUNT_SUCCESS: &str = "STEP_STATE_COUNT_SUCCESS";
    pub const STEP_STATE_CHECK_PROGRESS: &str = "STEP_STATE_CHECK_PROGRESS";
    pub const RUN_NEXT_STEPS_COUNT: &str = "RUN_NEXT_STEPS_COUNT";
    pub const RUN_NEXT_STEPS_CHECK_PROGRESS: &str = "RUN_NEXT_STEPS_CHECK_PROGRESS";
    pub const RUN_NEXT_STEPS_DISPATCH: &str = "RUN_NEXT_STEPS_DISPATCH";
    pub const VOID_COUNT_SUCCESS: &str = "VOID_COUNT_SUCCESS";
    pub const VOID_CHECK_PROGRESS: &str = "VOID_CHECK_PROGRESS";
    pub const NEXT_STEPS_COUNT: &str = "NEXT_STEPS_COUNT";
    pub const NEXT_STEPS_DISPATCH: &str = "NEXT_STEPS_DISPATCH";
    pub const FLOW_STATE_CREATE: &str = "FLOW_STATE_CREATE";
    pub const FIRST_STEP_DISPATCH: &str = "FIRST_STEP_DISPATCH";
}

const RUN_NEXT_STEPS_COMMAND: &str = "run-next-steps";
const VOID_COMMAND: &str = "void";

/// What a backchannel delivery amounted to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    /// The execution had already completed
    AlreadyProcessed,
    /// A step-state notification was counted
    StepStateRecorded { flow_complete: bool },
    /// A `void` command advanced the counters
    Voided { flow_complete: bool },
    /// A `run-next-steps` command fanned out to explicit targets
    RanNextSteps(usize),
    /// The graph successors were dispatched
    Dispatched(usize),
}

/// Journal key of a delivery
///
/// Uses the broker message id, then the step runtime's message id header, and
/// falls back to a digest of the token and body.
pub fn execution_id_for(message: &InboundMessage, claims: &ContinuationClaims) -> ExecutionId {
    let suffix = message
        .message_id
        .clone()
        .or_else(|| message.header(MESSAGE_ID_HEADER).map(str::to_string))
        .unwrap_or_else(|| {
            let mut hasher = Sha256::new();
            hasher.update(message.routing_key.as_bytes());
            hasher.update(message.header(ORCHESTRATOR_TOKEN_HEADER).unwrap_or_default().as_bytes());
            hasher.update(&message.body);
            hex::encode(hasher.finalize())
        });
    ExecutionId::from(format!("msg-{}-{}-{}", claims.flow_exec_id, claims.step_id, suffix))
}

/// A verified `run-next-steps` target
#[derive(Debug, Clone, PartialEq)]
struct RunTarget {
    flow: Flow,
    step_id: StepId,
}

/// Handles backchannel and error queue deliveries
#[derive(Clone)]
pub struct InboundHandler {
    flows: Arc<dyn FlowRegistry>,
    journal: ExecutionJournal,
    counters: ProgressCounterStore,
    dispatcher: MessageDispatcher,
}

impl InboundHandler {
    pub fn new(
        flows: Arc<dyn FlowRegistry>,
        journal: ExecutionJournal,
        counters: ProgressCounterStore,
        dispatcher: MessageDispatcher,
    ) -> Self {
        Self {
            flows,
            journal,
            counters,
            dispatcher,
        }
    }

    /// Backchannel consumer entry point; failures are logged
    pub async fn handle_message(&self, message: InboundMessage) {
        let span = info_span!("inbound_message", routing_key = %message.routing_key);
        async {
            if let Err(err) = self.process_message(&message).await {
                error!(
                    error = %err,
                    task_id = message.header("taskId").unwrap_or_default(),
                    step_id = message.header("stepId").unwrap_or_default(),
                    "Failed to process result"
                );
            }
        }
        .instrument(span)
        .await
    }

    fn verify(&self, message: &InboundMessage) -> OrchestratorResult<ContinuationClaims> {
        let token = message.header(ORCHESTRATOR_TOKEN_HEADER).ok_or_else(|| {
            OrchestratorError::TokenError("Missing orchestrator token".to_string())
        })?;
        self.dispatcher.signer().verify(token)
    }

    /// Process one backchannel delivery
    pub async fn process_message(&self, message: &InboundMessage) -> OrchestratorResult<MessageOutcome> {
        let content: Value = serde_json::from_slice(&message.body)?;
        let claims = self.verify(message)?;
        let execution_id = execution_id_for(message, &claims);
        let span = info_span!(
            "execution",
            execution_id = %execution_id,
            flow_id = %claims.flow_id,
            step_id = %claims.step_id,
            flow_exec_id = %claims.flow_exec_id,
        );

        self.run_execution(message, &claims, &execution_id, content)
            .instrument(span)
            .await
    }

    async fn run_execution(
        &self,
        message: &InboundMessage,
        claims: &ContinuationClaims,
        execution_id: &ExecutionId,
        content: Value,
    ) -> OrchestratorResult<MessageOutcome> {
        let start = self
            .journal
            .initialize_execution(execution_id, &claims.flow_exec_id, &content)
            .await?;
        if start.is_completed {
            info!("Message already fully processed, skipping");
            return Ok(MessageOutcome::AlreadyProcessed);
        }
        if start.current_state != INITIAL_STATE {
            info!(current_state = %start.current_state, "Resuming execution");
        }

        let flow = self
            .flows
            .find_by_id(&claims.flow_id)
            .await?
            .ok_or_else(|| CoreError::FlowNotFound(claims.flow_id.to_string()))?;

        let outcome = if message.is_step_state() {
            self.record_step_state(execution_id, claims).await?
        } else {
            self.route(execution_id, claims, &flow, content).await?
        };

        self.journal.complete_execution(execution_id).await?;
        Ok(outcome)
    }

    async fn record_step_state(
        &self,
        execution_id: &ExecutionId,
        claims: &ContinuationClaims,
    ) -> OrchestratorResult<MessageOutcome> {
        self.journal
            .execute_state(execution_id, states::STEP_STATE_RECORD_OUT, || async {
                self.counters
                    .record_step_out(&claims.flow_exec_id, &claims.step_id)
                    .await?;
                Ok::<(), OrchestratorError>(())
            })
            .await?;

        let flow_complete = self
            .advance(
                execution_id,
                (states::STEP_STATE_COUNT_SUCCESS, states::STEP_STATE_CHECK_PROGRESS),
                claims,
                0,
            )
            .await?;
        Ok(MessageOutcome::StepStateRecorded { flow_complete })
    }

    /// Count `started` new steps and one success, then check progress
    ///
    /// The count and the check are separate states; a failed check is
    /// retried without counting again.
    async fn advance(
        &self,
        execution_id: &ExecutionId,
        (count_state, check_state): (&str, &str),
        claims: &ContinuationClaims,
        started: i64,
    ) -> OrchestratorResult<bool> {
        let counted = self
            .journal
            .execute_state(execution_id, count_state, || async {
                self.counters
                    .upsert_count(&claims.flow_id, &claims.flow_exec_id, started, 1)
                    .await
                    .map_err(OrchestratorError::from)
            })
            .await?;

        let complete = self
            .journal
            .execute_state(execution_id, check_state, || async {
                let counters = match counted {
                    Some(counters) => Some(counters),
                    None => self.counters.find_by_flow_exec_id(&claims.flow_exec_id).await?,
                };
                match counters {
                    Some(counters) => {
                        self.dispatcher
                            .check_flow_progress(&claims.flow_id, &claims.step_id, &counters)
                            .await
                    }
                    None => {
                        debug!(flow_exec_id = %claims.flow_exec_id, "Counters already cleaned up");
                        Ok(false)
                    }
                }
            })
            .await?;
        Ok(complete.unwrap_or(false))
    }

    async fn route(
        &self,
        execution_id: &ExecutionId,
        claims: &ContinuationClaims,
        flow: &Flow,
        mut content: Value,
    ) -> OrchestratorResult<MessageOutcome> {
        if claims.special_flags.privileged_component {
            let command = content
                .get("command")
                .and_then(Value::as_str)
                .map(str::to_string);
            match command.as_deref() {
                Some(RUN_NEXT_STEPS_COMMAND) => {
                    let targets = self.verify_run_next_steps(flow, &content).await?;
                    strip_command(&mut content);
                    return self.run_next_steps(execution_id, claims, targets, &content).await;
                }
                Some(VOID_COMMAND) => {
                    let flow_complete = self
                        .advance(
                            execution_id,
                            (states::VOID_COUNT_SUCCESS, states::VOID_CHECK_PROGRESS),
                            claims,
                            0,
                        )
                        .await?;
                    return Ok(MessageOutcome::Voided { flow_complete });
                }
                Some(other) => {
                    debug!(command = other, "Unknown command, following the graph");
                    strip_command(&mut content);
                }
                None => {}
            }
        }

        let targets = self.dispatcher.next_step_targets(flow, &claims.step_id).await?;
        if targets.is_empty() {
            return Ok(MessageOutcome::Dispatched(0));
        }

        let count = targets.len();
        self.journal
            .execute_state(execution_id, states::NEXT_STEPS_COUNT, || async {
                self.counters
                    .upsert_count(&claims.flow_id, &claims.flow_exec_id, count as i64, 0)
                    .await?;
                Ok::<(), OrchestratorError>(())
            })
            .await?;

        self.dispatch(execution_id, states::NEXT_STEPS_DISPATCH, claims, &targets, &content)
            .await?;
        Ok(MessageOutcome::Dispatched(count))
    }

    async fn run_next_steps(
        &self,
        execution_id: &ExecutionId,
        claims: &ContinuationClaims,
        targets: Vec<RunTarget>,
        content: &Value,
    ) -> OrchestratorResult<MessageOutcome> {
        let count = targets.len();
        self.advance(
            execution_id,
            (states::RUN_NEXT_STEPS_COUNT, states::RUN_NEXT_STEPS_CHECK_PROGRESS),
            claims,
            count as i64,
        )
        .await?;

        let mut resolved = Vec::with_capacity(count);
        for target in targets {
            let node = target
                .flow
                .node(&target.step_id)
                .ok_or_else(|| CoreError::NodeNotFound(target.step_id.to_string()))?;
            let component = self.dispatcher.resolve_component(&node.component_id).await?;
            resolved.push(DispatchTarget {
                flow: target.flow,
                step_id: target.step_id,
                component,
            });
        }

        self.dispatch(execution_id, states::RUN_NEXT_STEPS_DISPATCH, claims, &resolved, content)
            .await?;
        Ok(MessageOutcome::RanNextSteps(count))
    }

    async fn dispatch(
        &self,
        execution_id: &ExecutionId,
        state: &str,
        claims: &ContinuationClaims,
        targets: &[DispatchTarget],
        content: &Value,
    ) -> OrchestratorResult<()> {
        let context = DispatchContext {
            execution_id,
            flow_exec_id: &claims.flow_exec_id,
            api_key: claims.api_key.as_deref(),
            message: content,
        };
        self.journal
            .execute_state(execution_id, state, || self.dispatcher.dispatch_all(context, targets))
            .await?;
        Ok(())
    }

    /// Resolve every `run-next-steps` target before anything is mutated
    async fn verify_run_next_steps(&self, flow: &Flow, content: &Value) -> OrchestratorResult<Vec<RunTarget>> {
        let parameters = content
            .get("parameters")
            .and_then(Value::as_array)
            .filter(|parameters| !parameters.is_empty())
            .ok_or_else(|| {
                OrchestratorError::ValidationError(format!(
                    "Message is missing \"parameters\" or \"parameters\" have wrong format. Expected array [\"flowId:stepId\"] got {}",
                    content.get("parameters").unwrap_or(&Value::Null)
                ))
            })?;

        let mut targets = Vec::with_capacity(parameters.len());
        for parameter in parameters {
            let target = parameter.as_str().ok_or_else(|| {
                OrchestratorError::ValidationError(format!("Invalid target {}", parameter))
            })?;
            targets.push(self.verify_target(flow, target).await?);
        }
        Ok(targets)
    }

    async fn verify_target(&self, flow: &Flow, target: &str) -> OrchestratorResult<RunTarget> {
        let (flow_id, step_id) = match target.split_once(':') {
            Some((flow_id, step_id)) => (FlowId::from(flow_id), StepId::from(step_id)),
            None => (flow.id.clone(), StepId::from(target)),
        };

        let target_flow = self.flows.find_by_id(&flow_id).await?.ok_or_else(|| {
            OrchestratorError::ValidationError(format!("Target flow \"{}\" not started", flow_id))
        })?;

        if target_flow.started_by != flow.started_by {
            return Err(OrchestratorError::ValidationError(format!(
                "Execution not permitted for user \"{}\"",
                flow.started_by.as_deref().unwrap_or_default()
            )));
        }

        if target_flow.node(&step_id).is_none() {
            return Err(OrchestratorError::ValidationError(format!(
                "Target step \"{}\" not found in flow \"{}\"",
                step_id, flow_id
            )));
        }

        Ok(RunTarget {
            flow: target_flow,
            step_id,
        })
    }

    /// Error queue consumer entry point; failures are logged
    pub async fn handle_error(&self, message: InboundMessage) {
        if let Err(err) = self.process_error(&message).await {
            error!(error = %err, "Failed to process step error");
        }
    }

    /// Count a step error reported on the error queue
    pub async fn process_error(&self, message: &InboundMessage) -> OrchestratorResult<()> {
        let claims = self.verify(message)?;
        let payload = serde_json::from_slice::<Value>(&message.body).unwrap_or_else(|_| {
            warn!(
                flow_id = %claims.flow_id,
                step_id = %claims.step_id,
                flow_exec_id = %claims.flow_exec_id,
                "Failed to parse error message payload"
            );
            Value::Object(Default::default())
        });

        self.counters
            .record_step_error(&claims.flow_exec_id, &claims.step_id)
            .await?;

        error!(
            flow_id = %claims.flow_id,
            step_id = %claims.step_id,
            flow_exec_id = %claims.flow_exec_id,
            tenant = claims.tenant.as_deref().unwrap_or_default(),
            rebound_reason = message.header(REBOUND_REASON_HEADER).unwrap_or_default(),
            payload = %payload,
            "Step error happened"
        );
        Ok(())
    }
}

fn strip_command(content: &mut Value) {
    if let Some(object) = content.as_object_mut() {
        object.remove("command");
        object.remove("parameters");
    }
}

/// Subscribes [`InboundHandler::handle_message`] to the backchannel
pub struct BackchannelConsumer(pub InboundHandler);

#[async_trait]
impl MessageHandler for BackchannelConsumer {
    async fn handle(&self, message: InboundMessage) {
        self.0.handle_message(message).await
    }
}

/// Subscribes [`InboundHandler::handle_error`] to the error queue
pub struct ErrorQueueConsumer(pub InboundHandler);

#[async_trait]
impl MessageHandler for ErrorQueueConsumer {
    async fn handle(&self, message: InboundMessage) {
        self.0.handle_error(message).await
    }
}
