//! Error types for the worker orchestrator.

use crate::dispatcher::TaskStatus;

/// Top-level error type for the orchestration core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Hub error: {0}")]
    Hub(#[from] HubError),

    #[error("Spawn error: {0}")]
    Spawn(#[from] SpawnError),

    #[error("Token error: {0}")]
    Token(#[from] TokenError),

    #[error("Federation error: {0}")]
    Federation(#[from] FederationError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Queue/registry store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<libsql::Error> for StoreError {
    fn from(e: libsql::Error) -> Self {
        Self::Query(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Task dispatcher errors.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Task {id} not found")]
    NotFound { id: String },

    #[error("Task {id} is {state}, cannot {action}")]
    InvalidTransition {
        id: String,
        state: TaskStatus,
        action: String,
    },

    #[error("Invalid task: {0}")]
    InvalidTask(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Worker hub errors.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("Authentication failed: {reason}")]
    AuthFailed { reason: String },

    #[error("Worker {id} not connected")]
    WorkerNotFound { id: String },

    #[error("Worker {id} is not available for assignment")]
    WorkerUnavailable { id: String },

    #[error("Failed to send to worker {id}")]
    SendFailed { id: String },
}

/// Worker process manager errors.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("No worker runtime available: {0}")]
    RuntimeUnavailable(String),

    #[error("Worker limit reached ({current}/{max})")]
    CapacityReached { current: usize, max: usize },

    #[error("Failed to spawn worker process: {0}")]
    Io(#[from] std::io::Error),

    #[error("Spawned worker {id} not found")]
    NotFound { id: String },
}

/// Worker token errors.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("Invalid token request: {0}")]
    InvalidRequest(String),

    #[error("Token {id} not found")]
    NotFound { id: String },

    #[error("Token has been revoked")]
    Revoked,

    #[error("Token has expired")]
    Expired,

    #[error("Unknown token")]
    Unknown,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Hub federation errors.
#[derive(Debug, thiserror::Error)]
pub enum FederationError {
    #[error("Hub {id} not found")]
    NotFound { id: String },

    #[error("Built-in hub cannot be {action}")]
    BuiltinImmutable { action: String },

    #[error("Invalid hub definition: {0}")]
    InvalidHub(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result type alias for the orchestrator.
pub type Result<T> = std::result::Result<T, Error>;
