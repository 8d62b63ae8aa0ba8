//! Test fixtures for tributary-orchestrator tests.
//! Shared harness, flow builders and a mocked deployment driver.

#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use mockall::mock;
use serde_json::{json, Value};
use tracing_subscriber::{fmt, EnvFilter};

use tributary_core::{
    Component, Flow, FlowEdge, FlowExecId, FlowGraph, FlowNode, FlowStatus, SpecialFlags, StepId,
    Workload,
};
use tributary_orchestrator::{
    broker::{InMemoryBroker, InboundMessage, INPUT_ROUTING_KEY, ORCHESTRATOR_TOKEN_HEADER, STEP_STATE_ROUTING_KEY},
    credentials::InMemoryTokenStore,
    driver::{CreateWorkload, DeploymentDriver, InMemoryDeploymentDriver},
    error::OrchestratorResult,
    events::InMemoryEventBus,
    snapshots::InMemorySnapshotStore,
    token::{ContinuationClaims, TokenSigner},
    Collaborators, ComponentOrchestrator, OrchestratorConfig,
};
use tributary_state_inmemory::{InMemoryComponentRegistry, InMemoryFlowRegistry, InMemoryStateStoreProvider};

pub const TEST_SECRET: &str = "test-secret";
pub const ORCHESTRATOR_ID: &str = "orchestrator-test";
pub const USER_ID: &str = "user-1";

/// Initialize test tracing
pub fn init_test_tracing() {
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::from_default_env()
            .add_directive("tributary_orchestrator=debug".parse().unwrap())
            .add_directive("test=debug".parse().unwrap()))
        .with_test_writer()
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

// Mock the deployment platform
mock! {
    #[derive(Debug)]
    pub Driver {}

    #[async_trait]
    impl DeploymentDriver for Driver {
        async fn list_workloads(&self) -> OrchestratorResult<Vec<Workload>>;
        async fn create_workload(&self, request: CreateWorkload) -> OrchestratorResult<Workload>;
        async fn destroy_workload(&self, workload: &Workload) -> OrchestratorResult<()>;
    }
}

pub fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        token_secret: TEST_SECRET.to_string(),
        orchestrator_id: ORCHESTRATOR_ID.to_string(),
        tick_interval_ms: 20,
        counter_retry_attempts: 3,
        counter_retry_backoff_ms: 1,
        ..OrchestratorConfig::default()
    }
}

/// An orchestrator wired to in-memory collaborators the test can inspect
pub struct Harness {
    pub provider: InMemoryStateStoreProvider,
    pub driver: InMemoryDeploymentDriver,
    pub broker: InMemoryBroker,
    pub events: InMemoryEventBus,
    pub tokens: InMemoryTokenStore,
    pub snapshots: InMemorySnapshotStore,
    pub signer: TokenSigner,
    pub config: OrchestratorConfig,
    pub orchestrator: ComponentOrchestrator,
}

impl Harness {
    pub fn new() -> Self {
        let driver = InMemoryDeploymentDriver::new();
        Self::build(driver.clone(), Arc::new(driver))
    }

    /// Harness whose orchestrator talks to `driver` instead of the in-memory one
    pub fn with_driver(driver: Arc<dyn DeploymentDriver>) -> Self {
        Self::build(InMemoryDeploymentDriver::new(), driver)
    }

    fn build(memory_driver: InMemoryDeploymentDriver, driver: Arc<dyn DeploymentDriver>) -> Self {
        let config = test_config();
        let provider = InMemoryStateStoreProvider::new();
        let broker = InMemoryBroker::new();
        let events = InMemoryEventBus::new();
        let tokens = InMemoryTokenStore::new();
        let snapshots = InMemorySnapshotStore::new();

        let (executions, flow_states, flows, components) = provider.create_repositories();
        let collaborators = Collaborators {
            executions,
            flow_states,
            flows,
            components,
            driver,
            queues: Arc::new(broker.clone()),
            publisher: Arc::new(broker.clone()),
            events: Arc::new(events.clone()),
            tokens: Arc::new(tokens.clone()),
            snapshots: Arc::new(snapshots.clone()),
        };

        let orchestrator = ComponentOrchestrator::new(&config, collaborators)
            .expect("Failed to create orchestrator");
        let signer = TokenSigner::new(TEST_SECRET).expect("Failed to create signer");

        Self {
            provider,
            driver: memory_driver,
            broker,
            events,
            tokens,
            snapshots,
            signer,
            config,
            orchestrator,
        }
    }

    pub fn flows(&self) -> InMemoryFlowRegistry {
        self.provider.flow_registry()
    }

    pub fn components(&self) -> InMemoryComponentRegistry {
        self.provider.component_registry()
    }

    pub async fn save_flow(&self, flow: Flow) {
        self.flows().save(flow).await;
    }

    pub async fn save_components(&self, components: &[Component]) {
        let registry = self.components();
        for component in components {
            registry.save(component.clone()).await;
        }
    }

    /// Current registry copy of a flow
    pub async fn flow(&self, id: &str) -> Flow {
        use tributary_core::FlowRegistry;
        self.flows()
            .find_by_id(&id.into())
            .await
            .expect("Failed to read flow")
            .expect("Flow not found")
    }

    /// A backchannel delivery signed for `claims`
    pub fn delivery(&self, routing_key: &str, claims: &ContinuationClaims, body: Value) -> InboundMessage {
        let token = self.signer.sign(claims).expect("Failed to sign token");
        InboundMessage::new(routing_key, body.to_string())
            .with_header(ORCHESTRATOR_TOKEN_HEADER, token)
    }

    /// Step output published on the data routing key
    pub fn step_output(&self, claims: &ContinuationClaims, body: Value, message_id: &str) -> InboundMessage {
        self.delivery(INPUT_ROUTING_KEY, claims, body)
            .with_message_id(message_id)
    }

    /// Step-state notification of a finished step
    pub fn step_state(&self, claims: &ContinuationClaims, message_id: &str) -> InboundMessage {
        self.delivery(STEP_STATE_ROUTING_KEY, claims, json!({}))
            .with_message_id(message_id)
    }
}

/// A flow whose nodes run one after another
///
/// `steps` are `(node id, component id)` pairs.
pub fn linear_flow(id: &str, status: FlowStatus, steps: &[(&str, &str)]) -> Flow {
    let nodes: Vec<FlowNode> = steps
        .iter()
        .map(|(node, component)| FlowNode::new(*node, *component, "process"))
        .collect();
    let edges = steps
        .windows(2)
        .map(|pair| FlowEdge {
            source: StepId::from(pair[0].0),
            target: StepId::from(pair[1].0),
        })
        .collect();

    let mut flow = Flow::new(id, FlowGraph { nodes, edges }, status);
    flow.started_by = Some(USER_ID.to_string());
    flow
}

/// A flow whose first node fans out to every other node
pub fn fan_out_flow(id: &str, status: FlowStatus, root: (&str, &str), branches: &[(&str, &str)]) -> Flow {
    let mut nodes = vec![FlowNode::new(root.0, root.1, "process")];
    nodes.extend(
        branches
            .iter()
            .map(|(node, component)| FlowNode::new(*node, *component, "process")),
    );
    let edges = branches
        .iter()
        .map(|(node, _)| FlowEdge {
            source: StepId::from(root.0),
            target: StepId::from(*node),
        })
        .collect();

    let mut flow = Flow::new(id, FlowGraph { nodes, edges }, status);
    flow.started_by = Some(USER_ID.to_string());
    flow
}

pub fn privileged(id: &str) -> Component {
    Component {
        special_flags: SpecialFlags {
            privileged_component: true,
        },
        ..Component::local(id)
    }
}

/// Claims a step token carries
pub fn claims_for(flow: &Flow, step_id: &str, flow_exec_id: &str, privileged: bool) -> ContinuationClaims {
    ContinuationClaims {
        flow_id: flow.id.clone(),
        step_id: StepId::from(step_id),
        user_id: flow.started_by.clone(),
        function: "process".to_string(),
        flow_exec_id: FlowExecId::from(flow_exec_id),
        secret_id: None,
        fields: json!({}),
        api_key: Some("api-key".to_string()),
        node_settings: json!({}),
        special_flags: SpecialFlags {
            privileged_component: privileged,
        },
        tenant: flow.tenant.clone(),
    }
}
