//! Domain events
//!
//! Lifecycle transitions and provisioning failures are announced on an event
//! bus for other services to consume.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::OrchestratorResult;

/// Names of the events the orchestrator emits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventName {
    #[serde(rename = "flow.started")]
    FlowStarted,
    #[serde(rename = "flow.stopped")]
    FlowStopped,
    #[serde(rename = "flow.failed")]
    FlowFailed,
    #[serde(rename = "component.started")]
    ComponentStarted,
    #[serde(rename = "component.stopped")]
    ComponentStopped,
    #[serde(rename = "component.failed")]
    ComponentFailed,
}

impl EventName {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventName::FlowStarted => "flow.started",
            EventName::FlowStopped => "flow.stopped",
            EventName::FlowFailed => "flow.failed",
            EventName::ComponentStarted => "component.started",
            EventName::ComponentStopped => "component.stopped",
            EventName::ComponentFailed => "component.failed",
        }
    }
}

impl std::fmt::Display for EventName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventHeaders {
    pub name: EventName,
}

/// An event with `{ id }` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorEvent {
    pub headers: EventHeaders,
    pub payload: Value,
}

impl OrchestratorEvent {
    pub fn new(name: EventName, id: impl std::fmt::Display) -> Self {
        Self {
            headers: EventHeaders { name },
            payload: json!({ "id": id.to_string() }),
        }
    }

    pub fn name(&self) -> EventName {
        self.headers.name
    }

    /// The `id` of the payload
    pub fn subject(&self) -> Option<&str> {
        self.payload.get("id").and_then(Value::as_str)
    }
}

/// Interface for event publication
#[async_trait]
pub trait EventBus: Send + Sync + Debug {
    async fn publish(&self, event: OrchestratorEvent) -> OrchestratorResult<()>;
}

/// Event bus that keeps every published event
#[derive(Debug, Clone, Default)]
pub struct InMemoryEventBus {
    events: Arc<RwLock<Vec<OrchestratorEvent>>>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<OrchestratorEvent> {
        self.events.read().await.clone()
    }

    /// Subjects of the events named `name`, in publication order
    pub async fn subjects(&self, name: EventName) -> Vec<String> {
        self.events
            .read()
            .await
            .iter()
            .filter(|event| event.name() == name)
            .filter_map(|event| event.subject().map(str::to_string))
            .collect()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, event: OrchestratorEvent) -> OrchestratorResult<()> {
        debug!(event = %event.name(), subject = ?event.subject(), "Publishing event");
        self.events.write().await.push(event);
        Ok(())
    }
}
