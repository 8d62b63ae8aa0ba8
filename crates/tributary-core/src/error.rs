use thiserror::Error;

/// Core error type for the Tributary orchestrator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Flow not found in the registry
    #[error("Flow not found: {0}")]
    FlowNotFound(String),

    /// Flow node not found in a flow graph
    #[error("Flow node not found: {0}")]
    NodeNotFound(String),

    /// Component not found
    #[error("Component not found: {0}")]
    ComponentNotFound(String),

    /// Execution record not found in the journal
    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    /// Execution record is terminal and rejects further mutation
    #[error("Execution already completed: {0}")]
    ExecutionCompleted(String),

    /// Unique index violated by a concurrent creator
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// Validation error
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// State store error
    #[error("State store error: {0}")]
    StateStoreError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Work wrapped by the journal failed
    #[error("State execution error: {0}")]
    StateExecutionError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl CoreError {
    /// Check if the error is a unique-index violation that may be retried
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, CoreError::DuplicateKey(_))
    }

    /// Check if the error is a lookup failure
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            CoreError::FlowNotFound(_)
                | CoreError::NodeNotFound(_)
                | CoreError::ComponentNotFound(_)
                | CoreError::ExecutionNotFound(_)
        )
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::SerializationError(err.to_string())
    }
}

impl From<String> for CoreError {
    fn from(err: String) -> Self {
        CoreError::Other(err)
    }
}

impl From<&str> for CoreError {
    fn from(err: &str) -> Self {
        CoreError::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let errors = vec![
            (CoreError::FlowNotFound("flow1".to_string()), "Flow not found: flow1"),
            (CoreError::NodeNotFound("step_1".to_string()), "Flow node not found: step_1"),
            (CoreError::ComponentNotFound("comp1".to_string()), "Component not found: comp1"),
            (CoreError::ExecutionNotFound("exec1".to_string()), "Execution not found: exec1"),
            (CoreError::ExecutionCompleted("exec1".to_string()), "Execution already completed: exec1"),
            (CoreError::DuplicateKey("flowExecId".to_string()), "Duplicate key: flowExecId"),
            (CoreError::ValidationError("invalid".to_string()), "Validation error: invalid"),
            (CoreError::StateStoreError("db_err".to_string()), "State store error: db_err"),
            (CoreError::SerializationError("ser_err".to_string()), "Serialization error: ser_err"),
            (CoreError::StateExecutionError("boom".to_string()), "State execution error: boom"),
            (CoreError::Other("other_err".to_string()), "other_err"),
        ];

        for (error, expected_msg) in errors {
            assert_eq!(error.to_string(), expected_msg);
        }
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_error = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let error: CoreError = json_error.into();

        match error {
            CoreError::SerializationError(msg) => {
                assert!(msg.contains("expected value"));
            }
            _ => panic!("Expected SerializationError variant"),
        }
    }

    #[test]
    fn test_error_classification() {
        assert!(CoreError::DuplicateKey("k".into()).is_duplicate_key());
        assert!(!CoreError::StateStoreError("k".into()).is_duplicate_key());
        assert!(CoreError::ComponentNotFound("c".into()).is_not_found());
        assert!(!CoreError::ExecutionCompleted("e".into()).is_not_found());
    }

    #[test]
    fn test_from_str() {
        let error: CoreError = "test error message".into();
        assert_eq!(error, CoreError::Other("test error message".to_string()));
    }
}
