//! In-memory broker
//!
//! Tracks declared queues, published messages and the two subscriptions.
//! Deliveries are pushed into the subscribed handlers by hand, which makes
//! redelivery trivial to simulate.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info};
use tributary_core::{Component, ComponentId, Flow, FlowNode, StepId};

use super::{
    InboundMessage, MessageHandler, MessagePublisher, MessageRecord, QueueProvisioner,
    QueueSettings, StepQueueConfig, BACKCHANNEL_EXCHANGE, INPUT_ROUTING_KEY,
    STEP_STATE_ROUTING_KEY,
};
use crate::error::{OrchestratorError, OrchestratorResult};

const ERROR_ROUTING_KEY: &str = "orchestrator_backchannel.error";

/// A message handed to [`MessagePublisher::publish_step_input`]
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub message: Value,
    pub record: MessageRecord,
}

#[derive(Default)]
struct Subscriptions {
    backchannel: Option<Arc<dyn MessageHandler>>,
    errors: Option<Arc<dyn MessageHandler>>,
}

/// In-memory implementation of QueueProvisioner and MessagePublisher
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    queues: Arc<RwLock<HashSet<String>>>,
    published: Arc<RwLock<Vec<PublishedMessage>>>,
    subscriptions: Arc<RwLock<Subscriptions>>,
    backchannel_ready: Arc<RwLock<bool>>,
    failing_publishes: Arc<AtomicUsize>,
    failing_routes: Arc<RwLock<HashMap<String, usize>>>,
    slow_routes: Arc<RwLock<HashMap<String, Duration>>>,
}

impl std::fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBroker").finish_non_exhaustive()
    }
}

fn flow_exchange(flow: &Flow) -> String {
    format!("flow-{}", flow.id)
}

fn component_exchange(component_id: &ComponentId) -> String {
    format!("component-{}", component_id)
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` publishes
    pub fn fail_next_publishes(&self, count: usize) {
        self.failing_publishes.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` publishes to `routing_key`
    pub async fn fail_next_publishes_to(&self, routing_key: &str, count: usize) {
        self.failing_routes
            .write()
            .await
            .insert(routing_key.to_string(), count);
    }

    /// Hold every publish to `routing_key` for `delay` after it is recorded
    pub async fn delay_publishes_to(&self, routing_key: &str, delay: Duration) {
        self.slow_routes
            .write()
            .await
            .insert(routing_key.to_string(), delay);
    }

    pub async fn published(&self) -> Vec<PublishedMessage> {
        self.published.read().await.clone()
    }

    pub async fn queues(&self) -> HashSet<String> {
        self.queues.read().await.clone()
    }

    pub async fn backchannel_ready(&self) -> bool {
        *self.backchannel_ready.read().await
    }

    /// Push a delivery into the backchannel subscriber; `false` if none is subscribed
    pub async fn deliver_backchannel(&self, message: InboundMessage) -> bool {
        let handler = self.subscriptions.read().await.backchannel.clone();
        match handler {
            Some(handler) => {
                handler.handle(message).await;
                true
            }
            None => false,
        }
    }

    /// Push a delivery into the error queue subscriber; `false` if none is subscribed
    pub async fn deliver_error(&self, message: InboundMessage) -> bool {
        let handler = self.subscriptions.read().await.errors.clone();
        match handler {
            Some(handler) => {
                handler.handle(message).await;
                true
            }
            None => false,
        }
    }

    async fn take_publish_failure(&self, routing_key: &str) -> bool {
        if self
            .failing_publishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return true;
        }

        let mut routes = self.failing_routes.write().await;
        match routes.get_mut(routing_key) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl QueueProvisioner for InMemoryBroker {
    async fn setup_backchannel(&self) -> OrchestratorResult<()> {
        let mut queues = self.queues.write().await;
        queues.insert(STEP_STATE_ROUTING_KEY.to_string());
        queues.insert(INPUT_ROUTING_KEY.to_string());
        queues.insert(ERROR_ROUTING_KEY.to_string());
        *self.backchannel_ready.write().await = true;
        info!(exchange = BACKCHANNEL_EXCHANGE, "Backchannel ready");
        Ok(())
    }

    async fn subscribe_backchannel(&self, handler: Arc<dyn MessageHandler>) -> OrchestratorResult<()> {
        self.subscriptions.write().await.backchannel = Some(handler);
        Ok(())
    }

    async fn subscribe_error_queue(&self, handler: Arc<dyn MessageHandler>) -> OrchestratorResult<()> {
        self.subscriptions.write().await.errors = Some(handler);
        Ok(())
    }

    async fn prepare_queues(
        &self,
        flow: &Flow,
        components: &HashMap<ComponentId, Component>,
    ) -> OrchestratorResult<QueueSettings> {
        let mut queues = self.queues.write().await;
        for node in flow.nodes() {
            let component = components.get(&node.component_id).ok_or_else(|| {
                OrchestratorError::NotFound(format!("Component {}", node.component_id))
            })?;
            if !component.is_global {
                queues.insert(self.step_config(flow, &node.id).messages_queue);
            }
        }

        let mut settings = QueueSettings::new();
        settings.insert("EXCHANGE_NAME".to_string(), flow_exchange(flow));
        Ok(settings)
    }

    async fn prepare_global_queues(&self, component: &Component) -> OrchestratorResult<QueueSettings> {
        let config = self.global_step_config(component);
        self.queues.write().await.insert(config.messages_queue);

        let mut settings = QueueSettings::new();
        settings.insert("EXCHANGE_NAME".to_string(), config.exchange_name);
        Ok(settings)
    }

    async fn settings_for_node_execution(
        &self,
        flow: &Flow,
        node: &FlowNode,
        settings: &QueueSettings,
    ) -> OrchestratorResult<HashMap<String, String>> {
        let config = self.step_config(flow, &node.id);
        let mut env = settings.clone();
        env.insert("FLOW_ID".to_string(), flow.id.to_string());
        env.insert("STEP_ID".to_string(), node.id.to_string());
        env.insert("COMPONENT_ID".to_string(), node.component_id.to_string());
        env.insert("FUNCTION".to_string(), node.function.clone());
        env.insert("LISTEN_MESSAGES_ON".to_string(), config.messages_queue);
        env.insert("PUBLISH_MESSAGES_TO".to_string(), BACKCHANNEL_EXCHANGE.to_string());
        env.insert("DATA_ROUTING_KEY".to_string(), INPUT_ROUTING_KEY.to_string());
        env.insert("STEP_STATE_ROUTING_KEY".to_string(), STEP_STATE_ROUTING_KEY.to_string());
        env.insert("ERROR_ROUTING_KEY".to_string(), ERROR_ROUTING_KEY.to_string());
        Ok(env)
    }

    async fn settings_for_global_component(
        &self,
        component: &Component,
        settings: &QueueSettings,
    ) -> OrchestratorResult<HashMap<String, String>> {
        let config = self.global_step_config(component);
        let mut env = settings.clone();
        env.insert("COMPONENT_ID".to_string(), component.id.to_string());
        env.insert("LISTEN_MESSAGES_ON".to_string(), config.messages_queue);
        env.insert("PUBLISH_MESSAGES_TO".to_string(), BACKCHANNEL_EXCHANGE.to_string());
        env.insert("DATA_ROUTING_KEY".to_string(), INPUT_ROUTING_KEY.to_string());
        env.insert("STEP_STATE_ROUTING_KEY".to_string(), STEP_STATE_ROUTING_KEY.to_string());
        env.insert("ERROR_ROUTING_KEY".to_string(), ERROR_ROUTING_KEY.to_string());
        Ok(env)
    }

    fn step_config(&self, flow: &Flow, step_id: &StepId) -> StepQueueConfig {
        let exchange = flow_exchange(flow);
        StepQueueConfig {
            messages_queue: format!("{}:{}:messages", exchange, step_id),
            dead_letter_routing_key: format!("{}.{}.dead-letter", exchange, step_id),
            input_routing_key: format!("{}.{}.input", exchange, step_id),
            exchange_name: exchange,
        }
    }

    fn global_step_config(&self, component: &Component) -> StepQueueConfig {
        let exchange = component_exchange(&component.id);
        StepQueueConfig {
            messages_queue: format!("{}:messages", exchange),
            dead_letter_routing_key: format!("{}.dead-letter", exchange),
            input_routing_key: format!("{}.input", exchange),
            exchange_name: exchange,
        }
    }

    async fn assert_messages_queue(&self, config: &StepQueueConfig) -> OrchestratorResult<()> {
        self.queues.write().await.insert(config.messages_queue.clone());
        Ok(())
    }

    async fn delete_for_flow(&self, flow: &Flow) -> OrchestratorResult<()> {
        let prefix = format!("{}:", flow_exchange(flow));
        let mut queues = self.queues.write().await;
        queues.retain(|queue| !queue.starts_with(&prefix));
        debug!(flow_id = %flow.id, "Deleted flow queues");
        Ok(())
    }

    async fn delete_for_global_component(&self, component: &Component) -> OrchestratorResult<()> {
        let prefix = format!("{}:", component_exchange(&component.id));
        let mut queues = self.queues.write().await;
        queues.retain(|queue| !queue.starts_with(&prefix));
        debug!(component_id = %component.id, "Deleted global component queues");
        Ok(())
    }
}

#[async_trait]
impl MessagePublisher for InMemoryBroker {
    async fn publish_step_input(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &Value,
        record: &MessageRecord,
    ) -> OrchestratorResult<()> {
        if self.take_publish_failure(routing_key).await {
            return Err(OrchestratorError::BrokerError(format!(
                "Publish to {} rejected",
                routing_key
            )));
        }

        self.published.write().await.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            message: message.clone(),
            record: record.clone(),
        });

        let delay = self.slow_routes.read().await.get(routing_key).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tributary_core::{FlowGraph, FlowStatus};

    fn flow() -> Flow {
        let graph = FlowGraph {
            nodes: vec![
                FlowNode::new("a", "local", "run"),
                FlowNode::new("b", "shared", "run"),
            ],
            edges: vec![],
        };
        Flow::new("f1", graph, FlowStatus::Starting)
    }

    #[tokio::test]
    async fn test_prepare_and_delete_flow_queues() {
        let broker = InMemoryBroker::new();
        let mut components = HashMap::new();
        components.insert(ComponentId::from("local"), Component::local("local"));
        components.insert(ComponentId::from("shared"), Component::global("shared"));

        let settings = broker.prepare_queues(&flow(), &components).await.unwrap();
        assert_eq!(settings.get("EXCHANGE_NAME").map(String::as_str), Some("flow-f1"));

        let queues = broker.queues().await;
        assert!(queues.contains("flow-f1:a:messages"));
        assert!(!queues.contains("flow-f1:b:messages"));

        broker.delete_for_flow(&flow()).await.unwrap();
        assert!(broker.queues().await.is_empty());
    }

    #[tokio::test]
    async fn test_prepare_requires_every_component() {
        let broker = InMemoryBroker::new();
        let result = broker.prepare_queues(&flow(), &HashMap::new()).await;
        assert!(matches!(result, Err(OrchestratorError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_publish_failure_injection() {
        let broker = InMemoryBroker::new();
        let record = MessageRecord {
            task_id: "f1".to_string(),
            exec_id: "x".to_string(),
            user_id: "u".to_string(),
            step_id: StepId::from("a"),
            orchestrator_token: "t".to_string(),
        };
        broker.fail_next_publishes(1);

        assert!(broker.publish_step_input("ex", "rk", &Value::Null, &record).await.is_err());
        assert!(broker.publish_step_input("ex", "rk", &Value::Null, &record).await.is_ok());
        assert_eq!(broker.published().await.len(), 1);
    }

    #[tokio::test]
    async fn test_publish_failure_per_route() {
        let broker = InMemoryBroker::new();
        let record = MessageRecord {
            task_id: "f1".to_string(),
            exec_id: "x".to_string(),
            user_id: "u".to_string(),
            step_id: StepId::from("a"),
            orchestrator_token: "t".to_string(),
        };
        broker.fail_next_publishes_to("rk-b", 1).await;

        assert!(broker.publish_step_input("ex", "rk-a", &Value::Null, &record).await.is_ok());
        assert!(broker.publish_step_input("ex", "rk-b", &Value::Null, &record).await.is_err());
        assert!(broker.publish_step_input("ex", "rk-b", &Value::Null, &record).await.is_ok());
        assert_eq!(broker.published().await.len(), 2);
    }

    #[tokio::test]
    async fn test_delivery_without_subscriber() {
        let broker = InMemoryBroker::new();
        assert!(!broker.deliver_backchannel(InboundMessage::new(STEP_STATE_ROUTING_KEY, b"{}".to_vec())).await);
    }
}
