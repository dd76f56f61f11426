//! Error types for the triage workflow.

use std::time::Duration;

/// Configuration-related errors. Always fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

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

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Checkpoint version conflict for message {message_id}: expected version {expected}")]
    VersionConflict { message_id: String, expected: i64 },
}

/// Reply channel errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Failed to send response on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("HTTP error: {0}")]
    Http(String),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Provider {provider} timed out after {timeout:?}")]
    Timeout { provider: String, timeout: Duration },
}

/// Errors raised while advancing a single message's workflow.
///
/// Every variant is contained to the message it names; none of them stop the
/// driver loop.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    /// Generation or send kept failing until the attempt ceiling was hit.
    #[error("Transient failure for message {message_id}: {reason}")]
    Transient { message_id: String, reason: String },

    /// Checkpoint missing or at the wrong node, feedback missing, or an
    /// interrupted send. Needs manual review.
    #[error("Consistency failure for message {message_id}: {reason}")]
    Consistency { message_id: String, reason: String },

    /// Lost an optimistic race. Nothing was sent; safe to retry next cycle.
    #[error("Conflict for message {message_id}: {reason}")]
    Conflict { message_id: String, reason: String },

    #[error("Database error: {0}")]
    Database(DatabaseError),
}

impl WorkflowError {
    /// Whether the driver should hand the message back for another cycle
    /// instead of marking it failed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::Database(_))
    }
}

impl From<DatabaseError> for WorkflowError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::VersionConflict {
                message_id,
                expected,
            } => Self::Conflict {
                message_id,
                reason: format!("checkpoint moved past version {expected}"),
            },
            other => Self::Database(other),
        }
    }
}
