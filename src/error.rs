//! Error types for Deskflow.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Service error: {0}")]
    Service(#[from] ServiceError),
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

/// Persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Failed to open database: {0}")]
    Open(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DatabaseError {
    pub fn ticket_not_found(id: Uuid) -> Self {
        Self::NotFound {
            entity: "ticket".into(),
            id: id.to_string(),
        }
    }
}

/// Channel connector errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Connector {name} failed to start: {reason}")]
    StartupFailed { name: String, reason: String },

    #[error("Connector {name} is not connected")]
    NotConnected { name: String },

    #[error("Authentication failed for connector {name}: {reason}")]
    AuthFailed { name: String, reason: String },

    #[error("Failed to send on connector {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("No connector registered for source {channel}")]
    UnknownSource { channel: String },

    #[error("Invalid inbound payload: {0}")]
    InvalidPayload(String),
}

/// Durable queue errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Consumer group {group} does not exist on stream {stream}")]
    NoSuchGroup { stream: String, group: String },

    #[error("Entry {entry_id} not pending for group {group} on stream {stream}")]
    NotPending {
        stream: String,
        group: String,
        entry_id: u64,
    },

    #[error("Queue backend error: {0}")]
    Backend(String),

    #[error("Payload serialization error: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Decision pipeline errors. Every stage has a fallback; these surface
/// only when the fallback itself cannot produce a result.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Classification failed: {0}")]
    Classification(String),

    #[error("Triage failed: {0}")]
    Triage(String),

    #[error("Response drafting failed: {0}")]
    Drafting(String),

    #[error("Stage {stage} timed out after {timeout:?}")]
    StageTimeout { stage: &'static str, timeout: Duration },
}

/// Errors from the black-box search/completion collaborators.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Completion request failed: {0}")]
    Completion(String),

    #[error("Search request failed: {0}")]
    Search(String),

    #[error("Invalid service response: {0}")]
    InvalidResponse(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
