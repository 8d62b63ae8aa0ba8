//! Reconciler
//!
//! Converges the workloads on the deployment platform with the flows in the
//! registry. Each tick reads every flow and every workload, reconciles the
//! flows concurrently and then destroys flow workloads nobody declares any
//! more. Ticks are idempotent: a failed flow is simply picked up again on the
//! next tick and workloads that already exist are skipped.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};
use tributary_core::{
    Component, ComponentId, ComponentRegistry, CoreError, Flow, FlowId, FlowRegistry, StepId,
    Workload,
};

use crate::broker::{QueueProvisioner, QueueSettings};
use crate::credentials::TokenStore;
use crate::driver::{CreateWorkload, DeploymentDriver, WorkloadOptions};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::events::{EventBus, EventName, OrchestratorEvent};

/// Workloads of one tick, indexed by flow node and by global component
#[derive(Debug, Clone, Default)]
pub struct WorkloadIndex {
    flows: HashMap<FlowId, HashMap<StepId, Workload>>,
    globals: HashMap<ComponentId, Workload>,
}

impl WorkloadIndex {
    pub fn build(workloads: &[Workload]) -> Self {
        let mut index = Self::default();
        for workload in workloads {
            if workload.is_global() {
                index
                    .globals
                    .insert(workload.component_id.clone(), workload.clone());
                continue;
            }
            // stray flow workloads are left to garbage collection
            if let (Some(flow_id), Some(node_id)) = (&workload.flow_id, &workload.node_id) {
                index
                    .flows
                    .entry(flow_id.clone())
                    .or_default()
                    .insert(node_id.clone(), workload.clone());
            }
        }
        index
    }

    pub fn has_node(&self, flow_id: &FlowId, node_id: &StepId) -> bool {
        self.flows
            .get(flow_id)
            .is_some_and(|nodes| nodes.contains_key(node_id))
    }

    pub fn has_global(&self, component_id: &ComponentId) -> bool {
        self.globals.contains_key(component_id)
    }

    /// Flow-scoped workloads of `flow_id`
    pub fn flow_workloads(&self, flow_id: &FlowId) -> impl Iterator<Item = &Workload> {
        self.flows.get(flow_id).into_iter().flat_map(HashMap::values)
    }
}

/// Marks a flow as being reconciled until dropped
pub struct InFlightGuard {
    in_flight: Arc<DashMap<FlowId, ()>>,
    flow_id: FlowId,
}

impl InFlightGuard {
    fn try_acquire(in_flight: &Arc<DashMap<FlowId, ()>>, flow_id: &FlowId) -> Option<Self> {
        match in_flight.entry(flow_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => None,
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(());
                Some(Self {
                    in_flight: in_flight.clone(),
                    flow_id: flow_id.clone(),
                })
            }
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.remove(&self.flow_id);
    }
}

/// Result of reconciling one flow
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowOutcome {
    /// Workloads, queues and token of a stopping flow were removed
    Stopped,
    /// Another orchestrator owns the preparation
    NotOwner,
    /// Missing workloads were provisioned
    Converged {
        created: Vec<String>,
        globals_started: Vec<ComponentId>,
        /// The flow finished preparing and was reported started
        started: bool,
    },
    /// Provisioning aborted; retried on the next tick
    Failed(String),
}

/// Summary of one tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub outcomes: Vec<(FlowId, FlowOutcome)>,
    /// Flows skipped because an earlier tick is still reconciling them
    pub skipped: Vec<FlowId>,
    /// Workloads destroyed by garbage collection
    pub collected: Vec<String>,
}

impl TickReport {
    pub fn outcome(&self, flow_id: &FlowId) -> Option<&FlowOutcome> {
        self.outcomes
            .iter()
            .find(|(id, _)| id == flow_id)
            .map(|(_, outcome)| outcome)
    }
}

/// Periodic convergence of flows and workloads
#[derive(Clone)]
pub struct Reconciler {
    orchestrator_id: String,
    flows: Arc<dyn FlowRegistry>,
    components: Arc<dyn ComponentRegistry>,
    driver: Arc<dyn DeploymentDriver>,
    queues: Arc<dyn QueueProvisioner>,
    tokens: Arc<dyn TokenStore>,
    events: Arc<dyn EventBus>,
    options: WorkloadOptions,
    in_flight: Arc<DashMap<FlowId, ()>>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("orchestrator_id", &self.orchestrator_id)
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        orchestrator_id: String,
        flows: Arc<dyn FlowRegistry>,
        components: Arc<dyn ComponentRegistry>,
        driver: Arc<dyn DeploymentDriver>,
        queues: Arc<dyn QueueProvisioner>,
        tokens: Arc<dyn TokenStore>,
        events: Arc<dyn EventBus>,
        options: WorkloadOptions,
    ) -> Self {
        Self {
            orchestrator_id,
            flows,
            components,
            driver,
            queues,
            tokens,
            events,
            options,
            in_flight: Arc::new(DashMap::new()),
        }
    }

    pub fn orchestrator_id(&self) -> &str {
        &self.orchestrator_id
    }

    /// Flows currently being reconciled
    pub fn in_flight(&self) -> Vec<FlowId> {
        self.in_flight.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Mark a flow as in flight, as a running reconcile would
    pub fn claim_flow(&self, flow_id: &FlowId) -> Option<InFlightGuard> {
        InFlightGuard::try_acquire(&self.in_flight, flow_id)
    }

    /// One reconciliation pass
    pub async fn tick(&self) -> OrchestratorResult<TickReport> {
        let flows: Vec<Flow> = self
            .flows
            .find_all()
            .await?
            .into_iter()
            .filter(Flow::is_managed)
            .collect();
        trace!(flows_count = flows.len(), "Fetched all flows");

        let workloads = self.driver.list_workloads().await?;
        trace!(workloads_count = workloads.len(), "Fetched all workloads");

        let index = WorkloadIndex::build(&workloads);
        let started_globals: DashMap<ComponentId, ()> = DashMap::new();

        let mut report = TickReport::default();
        let mut pending = Vec::new();
        for flow in &flows {
            match self.claim_flow(&flow.id) {
                Some(guard) => pending.push(self.reconcile_guarded(guard, flow, &index, &started_globals)),
                None => {
                    debug!(flow_id = %flow.id, "Flow is still being reconciled, skipping");
                    report.skipped.push(flow.id.clone());
                }
            }
        }
        report.outcomes = join_all(pending).await;

        report.collected = self.remove_lost_workloads(&workloads, &flows).await;
        Ok(report)
    }

    async fn reconcile_guarded(
        &self,
        guard: InFlightGuard,
        flow: &Flow,
        index: &WorkloadIndex,
        started_globals: &DashMap<ComponentId, ()>,
    ) -> (FlowId, FlowOutcome) {
        let span = info_span!("reconcile_flow", flow_id = %flow.id);
        let outcome = async {
            match self.reconcile_flow(flow, index, started_globals).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    error!(error = %err, "Failed to process flow");
                    FlowOutcome::Failed(err.to_string())
                }
            }
        }
        .instrument(span)
        .await;
        drop(guard);
        (flow.id.clone(), outcome)
    }

    /// Reconcile one flow against the tick's workload index
    pub async fn reconcile_flow(
        &self,
        flow: &Flow,
        index: &WorkloadIndex,
        started_globals: &DashMap<ComponentId, ()>,
    ) -> OrchestratorResult<FlowOutcome> {
        if flow.is_stopping() {
            self.stop_flow(flow, index).await?;
            return Ok(FlowOutcome::Stopped);
        }

        let claimed = if flow.is_preparing() {
            self.flows.preparing_by(&flow.id, &self.orchestrator_id).await?
        } else if flow.is_starting() {
            self.flows.on_starting(&flow.id, &self.orchestrator_id).await?
        } else {
            false
        };
        if (flow.is_preparing() || flow.is_starting()) && !claimed {
            debug!("Flow is prepared by another orchestrator");
            return Ok(FlowOutcome::NotOwner);
        }

        let (created, globals_started) = match self.provision(flow, index, started_globals).await {
            Ok(provisioned) => provisioned,
            Err((component_id, err)) => {
                error!(error = %err, component_id = %component_id, "Component startup failed");
                error!("Flow startup failed");
                self.emit_failure(EventName::ComponentFailed, component_id.as_str()).await;
                self.emit_failure(EventName::FlowFailed, flow.id.as_str()).await;
                return Ok(FlowOutcome::Failed(err.to_string()));
            }
        };

        let started = claimed;
        if started {
            self.complete_preparation(flow).await?;
        }

        Ok(FlowOutcome::Converged {
            created,
            globals_started,
            started,
        })
    }

    async fn stop_flow(&self, flow: &Flow, index: &WorkloadIndex) -> OrchestratorResult<()> {
        for workload in index.flow_workloads(&flow.id) {
            trace!(workload = %workload.name, "Going to delete flow node");
            self.driver.destroy_workload(workload).await?;
        }
        self.queues.delete_for_flow(flow).await?;
        if let Some(user_id) = &flow.started_by {
            self.tokens
                .delete_token_for_flow_and_user(&flow.id, user_id)
                .await?;
        }
        self.events
            .publish(OrchestratorEvent::new(EventName::FlowStopped, &flow.id))
            .await?;
        self.flows.on_stopped(&flow.id).await?;
        info!("Flow stopped");
        Ok(())
    }

    /// Create every missing workload of the flow
    ///
    /// Components of all nodes are resolved before anything is created. A
    /// failure carries the component it happened on.
    async fn provision(
        &self,
        flow: &Flow,
        index: &WorkloadIndex,
        started_globals: &DashMap<ComponentId, ()>,
    ) -> Result<(Vec<String>, Vec<ComponentId>), (ComponentId, OrchestratorError)> {
        let missing: Vec<_> = flow
            .nodes()
            .iter()
            .filter(|node| !index.has_global(&node.component_id) && !index.has_node(&flow.id, &node.id))
            .collect();
        if missing.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }

        let mut components: HashMap<ComponentId, Component> = HashMap::new();
        let mut wanted = HashSet::new();
        for node in flow.nodes() {
            if !wanted.insert(node.component_id.clone()) {
                continue;
            }
            let component = self
                .resolve_component(&node.component_id)
                .await
                .map_err(|err| (node.component_id.clone(), err))?;
            trace!(component_id = %component.id, "Found component");
            components.insert(component.id.clone(), component);
        }

        let first_local = missing
            .iter()
            .map(|node| &node.component_id)
            .find(|id| components.get(*id).is_some_and(|c| !c.is_global));
        let settings = match first_local {
            Some(component_id) => self
                .queues
                .prepare_queues(flow, &components)
                .await
                .map_err(|err| (component_id.clone(), err))?,
            None => QueueSettings::new(),
        };

        let mut created = Vec::new();
        let mut globals_started = Vec::new();

        for node in missing {
            let component = components.get(&node.component_id).cloned().ok_or_else(|| {
                (
                    node.component_id.clone(),
                    OrchestratorError::from(CoreError::ComponentNotFound(node.component_id.to_string())),
                )
            })?;

            if component.is_global {
                if started_globals.insert(component.id.clone(), ()).is_none() {
                    warn!(component_id = %component.id, "Global component is not running");
                    self.start_component(&component)
                        .await
                        .map_err(|err| (component.id.clone(), err))?;
                    globals_started.push(component.id.clone());
                }
                continue;
            }

            trace!(node_id = %node.id, component_id = %component.id, "Going to deploy a flow node");
            let env_vars = self
                .queues
                .settings_for_node_execution(flow, node, &settings)
                .await
                .map_err(|err| (component.id.clone(), err))?;

            let request = CreateWorkload::for_node(
                &flow.id,
                &node.id,
                component.clone(),
                env_vars,
                self.options.clone(),
            );
            let workload = self
                .driver
                .create_workload(request)
                .await
                .map_err(|err| (component.id.clone(), err))?;
            created.push(workload.name);
        }

        Ok((created, globals_started))
    }

    async fn resolve_component(&self, component_id: &ComponentId) -> OrchestratorResult<Component> {
        self.components
            .find_by_id(component_id)
            .await?
            .ok_or_else(|| CoreError::ComponentNotFound(component_id.to_string()).into())
    }

    async fn complete_preparation(&self, flow: &Flow) -> OrchestratorResult<()> {
        if let Some(user_id) = &flow.started_by {
            if let Err(err) = self.tokens.get_token_for_flow_and_user(&flow.id, user_id).await {
                error!(error = %err, "Failed to get access token");
            }
        }
        self.flows.on_prepared(&flow.id).await?;
        self.events
            .publish(OrchestratorEvent::new(EventName::FlowStarted, &flow.id))
            .await?;
        self.flows.on_started(&flow.id).await?;
        info!("Flow started");
        Ok(())
    }

    async fn emit_failure(&self, name: EventName, subject: &str) {
        if let Err(err) = self.events.publish(OrchestratorEvent::new(name, subject)).await {
            error!(error = %err, event = %name, "Failed to publish event");
        }
    }

    /// Destroy flow workloads whose flow or node no longer exists
    async fn remove_lost_workloads(&self, workloads: &[Workload], flows: &[Flow]) -> Vec<String> {
        let declared: HashSet<(&FlowId, &StepId)> = flows
            .iter()
            .flat_map(|flow| flow.nodes().iter().map(move |node| (&flow.id, &node.id)))
            .collect();

        let mut collected = Vec::new();
        for workload in workloads.iter().filter(|w| !w.is_global()) {
            let known = match (&workload.flow_id, &workload.node_id) {
                (Some(flow_id), Some(node_id)) => declared.contains(&(flow_id, node_id)),
                _ => false,
            };
            if known {
                continue;
            }

            match self.driver.destroy_workload(workload).await {
                Ok(()) => {
                    info!(workload = %workload.name, "Destroyed lost workload");
                    collected.push(workload.name.clone());
                }
                Err(err) => error!(error = %err, workload = %workload.name, "Failed to destroy lost workload"),
            }
        }
        collected
    }

    /// Provision and start a global component
    pub async fn start_component(&self, component: &Component) -> OrchestratorResult<()> {
        let settings = self.queues.prepare_global_queues(component).await?;
        let env_vars = self
            .queues
            .settings_for_global_component(component, &settings)
            .await?;
        self.driver
            .create_workload(CreateWorkload::for_global(
                component.clone(),
                env_vars,
                self.options.clone(),
            ))
            .await?;
        self.events
            .publish(OrchestratorEvent::new(EventName::ComponentStarted, &component.id))
            .await?;
        info!(component_id = %component.id, "Global component started");
        Ok(())
    }

    /// Tear down a global component
    pub async fn stop_component(&self, component: &Component) -> OrchestratorResult<()> {
        self.queues.delete_for_global_component(component).await?;
        self.driver
            .destroy_workload(&Workload::for_global(&component.id))
            .await?;
        self.events
            .publish(OrchestratorEvent::new(EventName::ComponentStopped, &component.id))
            .await?;
        info!(component_id = %component.id, "Global component stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tributary_core::WorkloadKind;

    #[test]
    fn test_index_separates_flows_and_globals() {
        let node = Workload::for_node(&FlowId::from("f1"), &StepId::from("a"), &ComponentId::from("c1"));
        let global = Workload::for_global(&ComponentId::from("f1"));
        let index = WorkloadIndex::build(&[node, global]);

        assert!(index.has_node(&FlowId::from("f1"), &StepId::from("a")));
        assert!(!index.has_node(&FlowId::from("f1"), &StepId::from("b")));
        assert!(index.has_global(&ComponentId::from("f1")));
        assert!(!index.has_global(&ComponentId::from("c1")));
        assert_eq!(index.flow_workloads(&FlowId::from("f1")).count(), 1);
    }

    #[test]
    fn test_workload_without_node_is_not_a_flow_node() {
        let odd = Workload {
            name: "odd".to_string(),
            flow_id: Some(FlowId::from("f1")),
            node_id: None,
            component_id: ComponentId::from("c1"),
            kind: WorkloadKind::Flow,
        };
        let index = WorkloadIndex::build(&[odd]);
        assert_eq!(index.flow_workloads(&FlowId::from("f1")).count(), 0);
    }

    #[test]
    fn test_stray_flow_workload_is_not_a_global() {
        let stray = Workload {
            name: "stray".to_string(),
            flow_id: None,
            node_id: None,
            component_id: ComponentId::from("c1"),
            kind: WorkloadKind::Flow,
        };
        let index = WorkloadIndex::build(&[stray]);
        assert!(!index.has_global(&ComponentId::from("c1")));
    }

    #[test]
    fn test_in_flight_guard_releases_on_drop() {
        let in_flight = Arc::new(DashMap::new());
        let flow_id = FlowId::from("f1");

        let guard = InFlightGuard::try_acquire(&in_flight, &flow_id);
        assert!(guard.is_some());
        assert!(InFlightGuard::try_acquire(&in_flight, &flow_id).is_none());

        drop(guard);
        assert!(InFlightGuard::try_acquire(&in_flight, &flow_id).is_some());
    }
}
