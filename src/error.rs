//! Error types for the Tundra marketplace.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type for the marketplace engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),
}

/// Configuration errors, raised at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    /// The database stayed locked by another connection past the busy
    /// timeout and every retry.
    #[error("Database busy: {0}")]
    Busy(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Job lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: Uuid },

    #[error("Job {id} in state {state} cannot transition to {target}")]
    InvalidTransition {
        id: Uuid,
        state: String,
        target: String,
    },
}

/// Validation errors raised at submission. No job is created when one of
/// these is returned.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("Unknown task type: {0}")]
    UnknownTaskType(String),

    #[error("Task type {task_type} requires payload field '{field}'")]
    MissingField { task_type: String, field: String },

    #[error("Invalid payload field '{field}': {reason}")]
    InvalidField { field: String, reason: String },

    #[error("Budget must be positive, got {0}")]
    InvalidBudget(String),

    #[error("Requester identity must not be empty")]
    EmptyRequester,

    #[error("Goal must not be empty")]
    EmptyGoal,

    #[error("Marketplace is disabled")]
    MarketplaceDisabled,

    #[error("Routing failed: {0}")]
    Router(#[from] RouterError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Provider registration errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Provider id must not be empty")]
    EmptyId,

    #[error("Provider name must not be empty")]
    EmptyName,

    #[error("Provider must declare at least one capability")]
    NoCapabilities,

    #[error("Unknown capability: {0}")]
    UnknownCapability(String),

    #[error("Rate must be positive, got {0}")]
    InvalidRate(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Ledger errors.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Amount must be positive, got {0}")]
    NonPositiveAmount(String),

    #[error("Identity must not be empty")]
    EmptyIdentity,

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Capability executor failures. These never escape a provider loop; they
/// are recorded on the job as its error payload.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecutorError {
    #[error("No executor registered for task type {0}")]
    Unsupported(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Network failure: {0}")]
    Network(String),

    #[error("Execution timed out after {0:?}")]
    Timeout(Duration),

    #[error("Malformed output: {0}")]
    MalformedOutput(String),

    #[error("Execution failed: {0}")]
    Failed(String),
}

impl ExecutorError {
    /// Short machine-readable kind, stored alongside the message.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unsupported(_) => "unsupported",
            Self::InvalidPayload(_) => "invalid_payload",
            Self::Network(_) => "network",
            Self::Timeout(_) => "timeout",
            Self::MalformedOutput(_) => "malformed_output",
            Self::Failed(_) => "failed",
        }
    }

    /// Error payload attached to a failed job.
    pub fn to_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "kind": self.kind(),
            "message": self.to_string(),
        })
    }
}

/// Routing oracle errors.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("Router {router} could not decide: {reason}")]
    Undecided { router: String, reason: String },
}

/// Result type alias for the marketplace.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn executor_error_payload_has_kind_and_message() {
        let err = ExecutorError::Network("connection reset".into());
        let payload = err.to_payload();
        assert_eq!(payload["kind"], "network");
        assert_eq!(payload["message"], "Network failure: connection reset");
    }

    #[test]
    fn timeout_kind() {
        let err = ExecutorError::Timeout(Duration::from_secs(3));
        assert_eq!(err.kind(), "timeout");
    }

    #[test]
    fn submit_error_wraps_router_error() {
        let err: SubmitError = RouterError::Undecided {
            router: "keyword".into(),
            reason: "empty goal".into(),
        }
        .into();
        assert!(err.to_string().contains("Routing failed"));
    }
}
