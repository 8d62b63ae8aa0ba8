//! Component orchestrator
//!
//! Wires the reconciler, the inbound handler and message dispatch to one set
//! of collaborators and runs them: backchannel subscriptions react to step
//! output, and a tick loop keeps workloads converged and expires old records.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, info_span, Instrument};
use tributary_core::{
    Component, ComponentRegistry, CoreError, ExecutionId, ExecutionJournal,
    ExecutionStateRepository, FlowExecId, FlowId, FlowRegistry, FlowStateRepository,
    ProgressCounterStore,
};

use crate::broker::{MessagePublisher, QueueProvisioner};
use crate::config::OrchestratorConfig;
use crate::credentials::TokenStore;
use crate::dispatch::{DispatchContext, DispatchTarget, MessageDispatcher};
use crate::driver::{DeploymentDriver, WorkloadOptions};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::events::EventBus;
use crate::inbound::{states, BackchannelConsumer, ErrorQueueConsumer, InboundHandler};
use crate::reconciler::{Reconciler, TickReport};
use crate::snapshots::SnapshotStore;
use crate::token::TokenSigner;

/// Stores, registries and platform clients the orchestrator works with
#[derive(Clone)]
pub struct Collaborators {
    pub executions: Arc<dyn ExecutionStateRepository>,
    pub flow_states: Arc<dyn FlowStateRepository>,
    pub flows: Arc<dyn FlowRegistry>,
    pub components: Arc<dyn ComponentRegistry>,
    pub driver: Arc<dyn DeploymentDriver>,
    pub queues: Arc<dyn QueueProvisioner>,
    pub publisher: Arc<dyn MessagePublisher>,
    pub events: Arc<dyn EventBus>,
    pub tokens: Arc<dyn TokenStore>,
    pub snapshots: Arc<dyn SnapshotStore>,
}

/// Summary of one retention sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub executions_purged: usize,
    pub duplicates_purged: usize,
}

/// The orchestrator service
#[derive(Clone)]
pub struct ComponentOrchestrator {
    flows: Arc<dyn FlowRegistry>,
    queues: Arc<dyn QueueProvisioner>,
    tokens: Arc<dyn TokenStore>,
    journal: ExecutionJournal,
    counters: ProgressCounterStore,
    dispatcher: MessageDispatcher,
    reconciler: Reconciler,
    inbound: InboundHandler,
    tick_interval: Duration,
    journal_retention: chrono::Duration,
    duplicate_retention: chrono::Duration,
}

impl ComponentOrchestrator {
    pub fn new(config: &OrchestratorConfig, deps: Collaborators) -> OrchestratorResult<Self> {
        let signer = TokenSigner::new(&config.token_secret)?;
        let journal = ExecutionJournal::new(deps.executions.clone());
        let counters = ProgressCounterStore::with_retry(deps.flow_states.clone(), config.counter_retry());

        let dispatcher = MessageDispatcher::new(
            journal.clone(),
            counters.clone(),
            deps.components.clone(),
            deps.queues.clone(),
            deps.publisher.clone(),
            deps.snapshots.clone(),
            signer,
        );

        let reconciler = Reconciler::new(
            config.orchestrator_id.clone(),
            deps.flows.clone(),
            deps.components.clone(),
            deps.driver.clone(),
            deps.queues.clone(),
            deps.tokens.clone(),
            deps.events.clone(),
            WorkloadOptions {
                replicas: config.replicas,
                image_pull_policy: config.image_pull_policy.clone(),
            },
        );

        let inbound = InboundHandler::new(
            deps.flows.clone(),
            journal.clone(),
            counters.clone(),
            dispatcher.clone(),
        );

        Ok(Self {
            flows: deps.flows,
            queues: deps.queues,
            tokens: deps.tokens,
            journal,
            counters,
            dispatcher,
            reconciler,
            inbound,
            tick_interval: config.tick_interval(),
            journal_retention: config.journal_retention(),
            duplicate_retention: config.duplicate_retention(),
        })
    }

    pub fn journal(&self) -> &ExecutionJournal {
        &self.journal
    }

    pub fn counters(&self) -> &ProgressCounterStore {
        &self.counters
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn inbound(&self) -> &InboundHandler {
        &self.inbound
    }

    /// Subscribe to the backchannel and error queue, then start ticking
    ///
    /// The returned task runs until aborted.
    pub async fn start(&self) -> OrchestratorResult<JoinHandle<()>> {
        self.queues.setup_backchannel().await?;
        self.queues
            .subscribe_backchannel(Arc::new(BackchannelConsumer(self.inbound.clone())))
            .await?;
        self.queues
            .subscribe_error_queue(Arc::new(ErrorQueueConsumer(self.inbound.clone())))
            .await?;

        info!(
            orchestrator_id = self.reconciler.orchestrator_id(),
            tick_interval_ms = self.tick_interval.as_millis() as u64,
            "Orchestrator started"
        );

        let this = self.clone();
        Ok(tokio::spawn(async move { this.run_loop().await }))
    }

    async fn run_loop(&self) {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            // a slow tick must not hold back the next one
            let this = self.clone();
            tokio::spawn(async move {
                this.run_tick().await;
            });
        }
    }

    /// Reconcile once and sweep expired records; errors are logged
    pub async fn run_tick(&self) -> Option<TickReport> {
        info!("Reconciliation tick");
        let report = match self.reconciler.tick().await {
            Ok(report) => Some(report),
            Err(err) => {
                error!(error = %err, "Reconciliation tick failed");
                None
            }
        };

        if let Err(err) = self.sweep_retention(Utc::now()).await {
            error!(error = %err, "Retention sweep failed");
        }
        report
    }

    /// Delete completed executions and duplicate audit rows past retention
    pub async fn sweep_retention(&self, now: DateTime<Utc>) -> OrchestratorResult<RetentionReport> {
        let report = RetentionReport {
            executions_purged: self
                .journal
                .purge_completed_before(now - self.journal_retention)
                .await?,
            duplicates_purged: self
                .counters
                .purge_duplicates_before(now - self.duplicate_retention)
                .await?,
        };
        if report != RetentionReport::default() {
            info!(
                executions = report.executions_purged,
                duplicates = report.duplicates_purged,
                "Expired records purged"
            );
        }
        Ok(report)
    }

    /// Start a flow execution by publishing `message` to the first step
    ///
    /// The flow execution id is taken from `metadata.source.externalExecId`
    /// when present.
    pub async fn execute_flow(&self, flow_id: &FlowId, message: Value) -> OrchestratorResult<FlowExecId> {
        let flow = self
            .flows
            .find_by_id(flow_id)
            .await?
            .ok_or_else(|| CoreError::FlowNotFound(flow_id.to_string()))?;
        let api_key = self.tokens.get_token_by_flow_id(&flow.id).await?;

        let first = flow
            .first_node()
            .ok_or_else(|| OrchestratorError::ValidationError(format!("Flow {} has no first node", flow.id)))?;
        let component = self.dispatcher.resolve_component(&first.component_id).await?;

        let flow_exec_id = message
            .pointer("/metadata/source/externalExecId")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(FlowExecId::from)
            .unwrap_or_else(|| FlowExecId::from(uuid::Uuid::new_v4().to_string()));
        let execution_id = ExecutionId::from(format!("flow-{}-{}", flow.id, uuid::Uuid::new_v4()));

        let span = info_span!(
            "execute_flow",
            flow_id = %flow.id,
            flow_exec_id = %flow_exec_id,
            execution_id = %execution_id,
        );

        let target = DispatchTarget {
            step_id: first.id.clone(),
            flow: flow.clone(),
            component,
        };

        async {
            self.journal
                .initialize_execution(&execution_id, &flow_exec_id, &message)
                .await?;

            self.journal
                .execute_state(&execution_id, states::FLOW_STATE_CREATE, || async {
                    self.counters
                        .upsert_state(&flow.id, &flow_exec_id, flow.tenant.as_deref())
                        .await?;
                    Ok::<(), OrchestratorError>(())
                })
                .await?;

            let context = DispatchContext {
                execution_id: &execution_id,
                flow_exec_id: &flow_exec_id,
                api_key: Some(api_key.as_str()),
                message: &message,
            };
            self.journal
                .execute_state(&execution_id, states::FIRST_STEP_DISPATCH, || {
                    self.dispatcher.dispatch_step(context, &target)
                })
                .await?;

            self.journal.complete_execution(&execution_id).await?;
            info!("Flow execution started");
            Ok::<(), OrchestratorError>(())
        }
        .instrument(span)
        .await
        .map_err(|err| {
            error!(flow_id = %flow_id, error = %err, "Failed to execute flow");
            err
        })?;

        Ok(flow_exec_id)
    }

    /// Provision and start a global component
    pub async fn start_component(&self, component: &Component) -> OrchestratorResult<()> {
        self.reconciler.start_component(component).await
    }

    /// Tear down a global component
    pub async fn stop_component(&self, component: &Component) -> OrchestratorResult<()> {
        self.reconciler.stop_component(component).await
    }
}
