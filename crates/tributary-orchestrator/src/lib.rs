//!
//! Tributary Orchestrator - keeps flow workloads converged and drives flow executions
//!
//! This crate exports the reconciler, the inbound message handler, message
//! dispatch and the collaborator contracts they run against.

use std::sync::Arc;

/// Configuration module
pub mod config;

/// Error module
pub mod error;

/// Continuation token module
pub mod token;

/// Deployment driver module
pub mod driver;

/// Broker module
pub mod broker;

/// Domain event module
pub mod events;

/// Access token module
pub mod credentials;

/// Snapshot store module
pub mod snapshots;

/// Message dispatch module
pub mod dispatch;

/// Reconciler module
pub mod reconciler;

/// Inbound message module
pub mod inbound;

/// Orchestrator module
pub mod orchestrator;

// Re-export key types
pub use config::OrchestratorConfig;
pub use error::{OrchestratorError, OrchestratorResult};
pub use orchestrator::{Collaborators, ComponentOrchestrator};
pub use reconciler::{FlowOutcome, Reconciler, TickReport};

use broker::InMemoryBroker;
use credentials::InMemoryTokenStore;
use driver::InMemoryDeploymentDriver;
use events::InMemoryEventBus;
use snapshots::InMemorySnapshotStore;
use tributary_state_inmemory::InMemoryStateStoreProvider;

/// Run function
pub async fn run(config: OrchestratorConfig) -> OrchestratorResult<()> {
    // Initialize logging
    init_logging(&config);

    // Create dependencies
    let collaborators = create_collaborators(&config);

    let orchestrator = ComponentOrchestrator::new(&config, collaborators)?;
    let ticker = orchestrator.start().await?;

    tokio::signal::ctrl_c()
        .await
        .map_err(|err| OrchestratorError::InternalError(format!("Signal handler error: {}", err)))?;

    tracing::info!("Shutting down orchestrator");
    ticker.abort();
    Ok(())
}

/// Initialize logging
pub fn init_logging(config: &OrchestratorConfig) {
    use tracing_subscriber::{fmt, EnvFilter};

    // Create filter based on config
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    // Initialize subscriber
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

/// In-memory stores and platform clients
pub fn create_collaborators(config: &OrchestratorConfig) -> Collaborators {
    tracing::info!(
        orchestrator_id = %config.orchestrator_id,
        "Using in-memory stores and platform clients"
    );

    let provider = InMemoryStateStoreProvider::new();
    let (executions, flow_states, flows, components) = provider.create_repositories();
    let broker = Arc::new(InMemoryBroker::new());

    Collaborators {
        executions,
        flow_states,
        flows,
        components,
        driver: Arc::new(InMemoryDeploymentDriver::new()),
        queues: broker.clone(),
        publisher: broker,
        events: Arc::new(InMemoryEventBus::new()),
        tokens: Arc::new(InMemoryTokenStore::new()),
        snapshots: Arc::new(InMemorySnapshotStore::new()),
    }
}
