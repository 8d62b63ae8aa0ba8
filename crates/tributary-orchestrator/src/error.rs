//! Error types for the Tributary orchestrator
//!
//! This module contains the error types used throughout the service.

use thiserror::Error;
use tributary_core::CoreError;

/// Orchestrator error types
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Resource not found
    #[error("{0} not found")]
    NotFound(String),

    /// Validation error
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Continuation token could not be signed or verified
    #[error("Token error: {0}")]
    TokenError(String),

    /// Deployment driver failure
    #[error("Driver error: {0}")]
    DriverError(String),

    /// Broker or queue provisioning failure
    #[error("Broker error: {0}")]
    BrokerError(String),

    /// Event bus failure
    #[error("Event bus error: {0}")]
    EventBusError(String),

    /// Token store failure
    #[error("Credential error: {0}")]
    CredentialError(String),

    /// Store or registry failure
    #[error("State error: {0}")]
    StateError(#[from] CoreError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Internal error
    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Result type for orchestrator operations
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        OrchestratorError::ValidationError(format!("JSON error: {}", err))
    }
}

impl From<jsonwebtoken::errors::Error> for OrchestratorError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        OrchestratorError::TokenError(err.to_string())
    }
}

impl From<config::ConfigError> for OrchestratorError {
    fn from(err: config::ConfigError) -> Self {
        OrchestratorError::ConfigError(err.to_string())
    }
}

impl OrchestratorError {
    /// Check if the error is a missing flow, node or component
    pub fn is_not_found(&self) -> bool {
        match self {
            OrchestratorError::NotFound(_) => true,
            OrchestratorError::StateError(err) => err.is_not_found(),
            _ => false,
        }
    }

    /// Check if the error rejects a mutation of a terminal execution
    pub fn is_execution_completed(&self) -> bool {
        matches!(self, OrchestratorError::StateError(CoreError::ExecutionCompleted(_)))
    }
}
