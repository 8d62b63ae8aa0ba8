//! Message dispatch
//!
//! Publishes the input message of a flow step: the step's inbound counter is
//! bumped, a continuation token is signed, the envelope is normalised and the
//! message goes to the step's queue. Both side effects run through
//! [`ExecutionJournal::execute_step`], so a replay after a crash between the
//! two publishes without counting again.

use std::sync::Arc;

use futures::future::join_all;
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};
use tributary_core::{
    Component, ComponentId, ComponentRegistry, CoreError, ExecutionId, ExecutionJournal, Flow,
    FlowExecId, FlowExecutionCounters, FlowId, FlowNode, MessageId, ProgressCounterStore, StepId,
};

use crate::broker::{MessagePublisher, MessageRecord, QueueProvisioner};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::snapshots::SnapshotStore;
use crate::token::{ContinuationClaims, TokenSigner};

const ENVELOPE_FIELDS: [&str; 4] = ["attachments", "data", "metadata", "passthrough"];

const HTTP_OBJECT_FIELDS: [&str; 3] = ["headers", "params", "query"];

const HTTP_STRING_FIELDS: [&str; 3] = ["url", "originalUrl", "pathSuffix"];

fn present(value: Option<&Value>) -> Option<&Value> {
    value.filter(|v| !v.is_null() && v.as_str() != Some(""))
}

/// Normalise a step message into the envelope every step expects
///
/// Messages triggered over HTTP carry a `method`; for those the request
/// fields are kept as well.
pub fn build_envelope(message: &Value) -> Value {
    let mut envelope = Map::new();
    for field in ENVELOPE_FIELDS {
        let value = present(message.get(field))
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new()));
        envelope.insert(field.to_string(), value);
    }

    if let Some(method) = present(message.get("method")) {
        envelope.insert("method".to_string(), method.clone());
        for field in HTTP_OBJECT_FIELDS {
            let value = present(message.get(field))
                .cloned()
                .unwrap_or_else(|| Value::Object(Map::new()));
            envelope.insert(field.to_string(), value);
        }
        for field in HTTP_STRING_FIELDS {
            let value = present(message.get(field))
                .cloned()
                .unwrap_or_else(|| Value::String(String::new()));
            envelope.insert(field.to_string(), value);
        }
    }

    Value::Object(envelope)
}

/// Claims for the token handed to `node`
pub fn continuation_claims(
    flow: &Flow,
    node: &FlowNode,
    component: &Component,
    flow_exec_id: &FlowExecId,
    api_key: Option<&str>,
) -> ContinuationClaims {
    ContinuationClaims {
        flow_id: flow.id.clone(),
        step_id: node.id.clone(),
        user_id: flow.started_by.clone(),
        function: node.function.clone(),
        flow_exec_id: flow_exec_id.clone(),
        secret_id: node.credentials_id.clone(),
        fields: if node.fields.is_null() {
            Value::Object(Map::new())
        } else {
            node.fields.clone()
        },
        api_key: api_key.map(str::to_string),
        node_settings: if node.node_settings.is_null() {
            Value::Object(Map::new())
        } else {
            node.node_settings.clone()
        },
        special_flags: component.special_flags.clone(),
        tenant: flow.tenant.clone(),
    }
}

/// A step to publish to
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchTarget {
    pub flow: Flow,
    pub step_id: StepId,
    pub component: Component,
}

impl DispatchTarget {
    /// Journal key of the target; qualified by flow so equal step ids of different flows stay apart
    pub fn step_key(&self) -> StepId {
        StepId::from(format!("{}:{}", self.flow.id, self.step_id))
    }
}

/// What the steps of one dispatch share
#[derive(Debug, Clone, Copy)]
pub struct DispatchContext<'a> {
    pub execution_id: &'a ExecutionId,
    pub flow_exec_id: &'a FlowExecId,
    pub api_key: Option<&'a str>,
    pub message: &'a Value,
}

/// Publishes step input messages under the journal
#[derive(Clone)]
pub struct MessageDispatcher {
    journal: ExecutionJournal,
    counters: ProgressCounterStore,
    components: Arc<dyn ComponentRegistry>,
    queues: Arc<dyn QueueProvisioner>,
    publisher: Arc<dyn MessagePublisher>,
    snapshots: Arc<dyn SnapshotStore>,
    signer: TokenSigner,
}

impl MessageDispatcher {
    pub fn new(
        journal: ExecutionJournal,
        counters: ProgressCounterStore,
        components: Arc<dyn ComponentRegistry>,
        queues: Arc<dyn QueueProvisioner>,
        publisher: Arc<dyn MessagePublisher>,
        snapshots: Arc<dyn SnapshotStore>,
        signer: TokenSigner,
    ) -> Self {
        Self {
            journal,
            counters,
            components,
            queues,
            publisher,
            snapshots,
            signer,
        }
    }

    pub fn signer(&self) -> &TokenSigner {
        &self.signer
    }

    /// Look up a component, failing if it is unknown
    pub async fn resolve_component(&self, component_id: &ComponentId) -> OrchestratorResult<Component> {
        self.components
            .find_by_id(component_id)
            .await?
            .ok_or_else(|| CoreError::ComponentNotFound(component_id.to_string()).into())
    }

    /// Targets for the graph successors of `step_id`
    pub async fn next_step_targets(&self, flow: &Flow, step_id: &StepId) -> OrchestratorResult<Vec<DispatchTarget>> {
        let mut targets = Vec::new();
        for next in flow.next_steps(step_id) {
            let node = flow
                .node(&next)
                .ok_or_else(|| CoreError::NodeNotFound(next.to_string()))?;
            let component = self.resolve_component(&node.component_id).await?;
            targets.push(DispatchTarget {
                flow: flow.clone(),
                step_id: next,
                component,
            });
        }
        Ok(targets)
    }

    /// Dispatch every target concurrently
    ///
    /// Every target runs to the end even when a sibling fails; the first
    /// failure is returned afterwards.
    pub async fn dispatch_all(&self, context: DispatchContext<'_>, targets: &[DispatchTarget]) -> OrchestratorResult<()> {
        let results = join_all(targets.iter().map(|target| self.dispatch_step(context, target))).await;

        let mut first_error = None;
        for (target, result) in targets.iter().zip(results) {
            if let Err(err) = result {
                error!(
                    flow_id = %target.flow.id,
                    step_id = %target.step_id,
                    error = %err,
                    "Failed to dispatch step"
                );
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Count and publish one step, each at most once per execution
    pub async fn dispatch_step(&self, context: DispatchContext<'_>, target: &DispatchTarget) -> OrchestratorResult<()> {
        let node = target
            .flow
            .node(&target.step_id)
            .ok_or_else(|| CoreError::NodeNotFound(target.step_id.to_string()))?;
        let step_key = target.step_key();
        let message_id = MessageId::from(format!("{}:{}", context.execution_id, step_key));

        self.journal
            .execute_step(
                context.execution_id,
                &step_key,
                || async {
                    let processed = self
                        .counters
                        .process_step(context.flow_exec_id, &target.step_id, &message_id, context.message)
                        .await?;
                    if !processed {
                        debug!(
                            flow_exec_id = %context.flow_exec_id,
                            step_id = %target.step_id,
                            "Step input not counted"
                        );
                    }
                    Ok::<(), OrchestratorError>(())
                },
                || self.publish(context, target, node),
            )
            .await
    }

    async fn publish(&self, context: DispatchContext<'_>, target: &DispatchTarget, node: &FlowNode) -> OrchestratorResult<()> {
        let flow = &target.flow;
        let claims = continuation_claims(flow, node, &target.component, context.flow_exec_id, context.api_key);
        let record = MessageRecord {
            task_id: flow.id.to_string(),
            exec_id: uuid::Uuid::new_v4().simple().to_string(),
            user_id: flow.started_by.clone().unwrap_or_default(),
            step_id: target.step_id.clone(),
            orchestrator_token: self.signer.sign(&claims)?,
        };

        let config = if target.component.is_global {
            self.queues.global_step_config(&target.component)
        } else {
            self.queues.step_config(flow, &target.step_id)
        };
        self.queues.assert_messages_queue(&config).await?;

        let envelope = build_envelope(context.message);
        self.publisher
            .publish_step_input(&config.exchange_name, &config.input_routing_key, &envelope, &record)
            .await?;

        debug!(
            flow_id = %flow.id,
            step_id = %target.step_id,
            queue = %config.messages_queue,
            "Published step input"
        );
        Ok(())
    }

    /// Purge snapshots and counters once every started step succeeded
    ///
    /// Returns whether the execution was complete. Safe to repeat. The
    /// snapshot purge is best effort and never fails the check.
    pub async fn check_flow_progress(
        &self,
        flow_id: &FlowId,
        step_id: &StepId,
        counters: &FlowExecutionCounters,
    ) -> OrchestratorResult<bool> {
        info!(flow_id = %flow_id, step_id = %step_id, flow_exec_id = %counters.flow_exec_id, "Step done");
        if !counters.is_complete() {
            return Ok(false);
        }

        info!(
            flow_id = %flow_id,
            flow_exec_id = %counters.flow_exec_id,
            started = counters.started,
            succeeded = counters.succeeded,
            "Flow fully progressed"
        );
        match self.snapshots.delete_snapshots(&counters.flow_exec_id).await {
            Ok(purged) => info!(flow_exec_id = %counters.flow_exec_id, purged, "Snapshots purged"),
            Err(err) => warn!(
                flow_exec_id = %counters.flow_exec_id,
                error = %err,
                "Failed to purge snapshots"
            ),
        }
        self.counters.delete(&counters.flow_exec_id).await?;
        Ok(true)
    }
}
