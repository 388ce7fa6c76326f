use thiserror::Error;

/// Core error type for the Conveyor engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConveyorError {
    /// Workflow definition not found
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    /// Run not found (absent or TTL-expired)
    #[error("Run not found: {0}")]
    RunNotFound(String),

    /// A child step's validation hook rejected a response
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// The wrapped primitive call itself errored
    #[error("Primitive failure: {0}")]
    PrimitiveFailure(String),

    /// The resilience proxy fast-failed the call
    #[error("Circuit open: {0}")]
    CircuitOpen(String),

    /// Step or execution deadline exceeded
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The run lock is held by another worker
    #[error("Lock contention: {0}")]
    LockContention(String),

    /// Message channel publish/subscribe error
    #[error("Transport failure: {0}")]
    TransportFailure(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// State store error
    #[error("State store error: {0}")]
    StateStoreError(String),

    /// Workflow execution error
    #[error("Execution error: {0}")]
    ExecutionError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl ConveyorError {
    /// Machine-readable classification, surfaced alongside the
    /// human-readable message on terminal `Failed` runs.
    pub fn classification(&self) -> &'static str {
        match self {
            ConveyorError::WorkflowNotFound(_) | ConveyorError::RunNotFound(_) => "not_found",
            ConveyorError::ValidationFailed(_) => "validation_failed",
            ConveyorError::PrimitiveFailure(_) => "primitive_failure",
            ConveyorError::CircuitOpen(_) => "circuit_open",
            ConveyorError::Timeout(_) => "timeout",
            ConveyorError::LockContention(_) => "lock_contention",
            ConveyorError::TransportFailure(_) => "transport_failure",
            ConveyorError::SerializationError(_) => "serialization_error",
            ConveyorError::StateStoreError(_) => "state_store_error",
            ConveyorError::ExecutionError(_) => "execution_error",
            ConveyorError::Other(_) => "internal",
        }
    }

    /// Whether the error classifies as a missing workflow/run
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ConveyorError::WorkflowNotFound(_) | ConveyorError::RunNotFound(_)
        )
    }
}

impl From<serde_json::Error> for ConveyorError {
    fn from(err: serde_json::Error) -> Self {
        ConveyorError::SerializationError(err.to_string())
    }
}

impl From<std::io::Error> for ConveyorError {
    fn from(err: std::io::Error) -> Self {
        ConveyorError::TransportFailure(err.to_string())
    }
}

impl From<String> for ConveyorError {
    fn from(err: String) -> Self {
        ConveyorError::Other(err)
    }
}

impl From<&str> for ConveyorError {
    fn from(err: &str) -> Self {
        ConveyorError::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let errors = vec![
            (
                ConveyorError::WorkflowNotFound("etl".to_string()),
                "Workflow not found: etl",
            ),
            (
                ConveyorError::RunNotFound("run1".to_string()),
                "Run not found: run1",
            ),
            (
                ConveyorError::ValidationFailed("missing key".to_string()),
                "Validation failed: missing key",
            ),
            (
                ConveyorError::PrimitiveFailure("boom".to_string()),
                "Primitive failure: boom",
            ),
            (
                ConveyorError::CircuitOpen("antifraud".to_string()),
                "Circuit open: antifraud",
            ),
            (
                ConveyorError::Timeout("step deadline".to_string()),
                "Timeout: step deadline",
            ),
            (
                ConveyorError::LockContention("run1".to_string()),
                "Lock contention: run1",
            ),
            (
                ConveyorError::TransportFailure("publish".to_string()),
                "Transport failure: publish",
            ),
            (ConveyorError::Other("other".to_string()), "other"),
        ];

        for (error, expected) in errors {
            assert_eq!(error.to_string(), expected);
        }
    }

    #[test]
    fn test_classification() {
        assert_eq!(
            ConveyorError::WorkflowNotFound("x".into()).classification(),
            "not_found"
        );
        assert_eq!(
            ConveyorError::RunNotFound("x".into()).classification(),
            "not_found"
        );
        assert_eq!(
            ConveyorError::ValidationFailed("x".into()).classification(),
            "validation_failed"
        );
        assert_eq!(
            ConveyorError::CircuitOpen("x".into()).classification(),
            "circuit_open"
        );
        assert_eq!(ConveyorError::Timeout("x".into()).classification(), "timeout");
        assert_eq!(ConveyorError::Other("x".into()).classification(), "internal");
    }

    #[test]
    fn test_is_not_found() {
        assert!(ConveyorError::WorkflowNotFound("x".into()).is_not_found());
        assert!(ConveyorError::RunNotFound("x".into()).is_not_found());
        assert!(!ConveyorError::Timeout("x".into()).is_not_found());
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_error = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let error: ConveyorError = json_error.into();
        assert!(matches!(error, ConveyorError::SerializationError(_)));
    }

    #[test]
    fn test_from_string() {
        let error: ConveyorError = "plain message".into();
        assert_eq!(error, ConveyorError::Other("plain message".to_string()));
    }
}
