//! Error types for the CRM agent.

use std::time::Duration;

use crate::conversation::ConversationStatus;

/// Top-level error type for the agent.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("External service error: {0}")]
    Service(#[from] ServiceError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
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
}

/// Conversation store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The conversation was queried before `get_or_create`.
    #[error("No conversation for customer {customer_id}")]
    NotFound { customer_id: String },

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition {
        from: ConversationStatus,
        to: ConversationStatus,
    },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Mail channel errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Failed to fetch from channel {name}: {reason}")]
    FetchFailed { name: String, reason: String },

    #[error("Failed to send response on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Invalid recipient address: {0}")]
    InvalidRecipient(String),

    #[error("Channel health check failed: {name}")]
    HealthCheckFailed { name: String },
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failures of the external collaborators (certificate portal, premium API,
/// spreadsheet, mail, language model).
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("{service} failed: {reason}")]
    External { service: String, reason: String },

    #[error("{service} timed out after {timeout:?}")]
    Timeout { service: String, timeout: Duration },
}

impl ServiceError {
    pub fn external(service: &str, reason: impl std::fmt::Display) -> Self {
        Self::External {
            service: service.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn timeout(service: &str, timeout: Duration) -> Self {
        Self::Timeout {
            service: service.to_string(),
            timeout,
        }
    }
}

impl From<ChannelError> for ServiceError {
    fn from(e: ChannelError) -> Self {
        Self::external("mail", e)
    }
}

/// Pipeline-related errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Channel fetch failed: {0}")]
    ChannelFetch(String),
}

/// Result type alias for the agent.
pub type Result<T> = std::result::Result<T, Error>;
