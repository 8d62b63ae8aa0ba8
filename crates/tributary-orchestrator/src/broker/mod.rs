//! Message broker integration
//!
//! Queue topology is provisioned through [`QueueProvisioner`]; step input
//! messages leave through [`MessagePublisher`]; backchannel and error queue
//! deliveries arrive at a [`MessageHandler`].

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tributary_core::{Component, ComponentId, Flow, FlowNode, StepId};

use crate::error::OrchestratorResult;

/// Exchange that step workloads report back to
pub const BACKCHANNEL_EXCHANGE: &str = "orchestrator_backchannel";

/// Routing key of step-state notifications
pub const STEP_STATE_ROUTING_KEY: &str = "orchestrator_backchannel.step_state";

/// Routing key of step output messages
pub const INPUT_ROUTING_KEY: &str = "orchestrator_backchannel.input";

/// Header carrying the continuation token
pub const ORCHESTRATOR_TOKEN_HEADER: &str = "orchestratorToken";

/// Header set by the error queue when a message was rebounded
pub const REBOUND_REASON_HEADER: &str = "reboundReason";

/// Header some step runtimes use for their own message id
pub const MESSAGE_ID_HEADER: &str = "messageId";

/// A broker delivery
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub routing_key: String,

    /// Broker-assigned message id, if any
    pub message_id: Option<String>,

    pub headers: HashMap<String, String>,

    pub body: Vec<u8>,
}

impl InboundMessage {
    pub fn new(routing_key: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            routing_key: routing_key.into(),
            message_id: None,
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_string(), value.into());
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn is_step_state(&self) -> bool {
        self.routing_key == STEP_STATE_ROUTING_KEY
    }
}

/// Consumer of broker deliveries
///
/// Handlers never fail: errors are logged and redelivery is left to the broker.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: InboundMessage);
}

/// Queue settings of a flow or global component, as environment variables
pub type QueueSettings = HashMap<String, String>;

/// Where input messages of one step are published
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepQueueConfig {
    pub messages_queue: String,
    pub exchange_name: String,
    pub dead_letter_routing_key: String,
    pub input_routing_key: String,
}

/// Headers of a published step input message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub task_id: String,
    pub exec_id: String,
    pub user_id: String,
    pub step_id: StepId,
    pub orchestrator_token: String,
}

/// Interface for queue topology operations
#[async_trait]
pub trait QueueProvisioner: Send + Sync + Debug {
    /// Declare the backchannel exchange, queues and bindings
    async fn setup_backchannel(&self) -> OrchestratorResult<()>;

    async fn subscribe_backchannel(&self, handler: Arc<dyn MessageHandler>) -> OrchestratorResult<()>;

    async fn subscribe_error_queue(&self, handler: Arc<dyn MessageHandler>) -> OrchestratorResult<()>;

    /// Declare the queues of every local node of a flow
    async fn prepare_queues(
        &self,
        flow: &Flow,
        components: &HashMap<ComponentId, Component>,
    ) -> OrchestratorResult<QueueSettings>;

    /// Declare the queues of a global component
    async fn prepare_global_queues(&self, component: &Component) -> OrchestratorResult<QueueSettings>;

    /// Environment of one node workload
    async fn settings_for_node_execution(
        &self,
        flow: &Flow,
        node: &FlowNode,
        settings: &QueueSettings,
    ) -> OrchestratorResult<HashMap<String, String>>;

    /// Environment of a global component workload
    async fn settings_for_global_component(
        &self,
        component: &Component,
        settings: &QueueSettings,
    ) -> OrchestratorResult<HashMap<String, String>>;

    fn step_config(&self, flow: &Flow, step_id: &StepId) -> StepQueueConfig;

    fn global_step_config(&self, component: &Component) -> StepQueueConfig;

    /// Make sure the step's messages queue exists before publishing to it
    async fn assert_messages_queue(&self, config: &StepQueueConfig) -> OrchestratorResult<()>;

    async fn delete_for_flow(&self, flow: &Flow) -> OrchestratorResult<()>;

    async fn delete_for_global_component(&self, component: &Component) -> OrchestratorResult<()>;
}

/// Interface for publishing step input messages
#[async_trait]
pub trait MessagePublisher: Send + Sync + Debug {
    async fn publish_step_input(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &Value,
        record: &MessageRecord,
    ) -> OrchestratorResult<()>;
}

pub mod memory;

pub use memory::{InMemoryBroker, PublishedMessage};
