//! WebSocket wire protocol shared by worker and dashboard connections.
//!
//! Every frame is a JSON text message tagged by `type`. `auth` must be the first
//! message on a connection; anything else before it is answered with
//! `auth:failed` and the socket is closed.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::dispatcher::Task;
use crate::events::OrchestratorEvent;

/// Identity details a worker reports during its handshake.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerMetadata {
    /// Correlates a locally spawned process with its hub connection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spawned_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Free-form agent label (provider/model profile).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// Stable machine identity, recorded on token registrations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_id: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
}

/// Client → server messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "auth")]
    Auth {
        #[serde(default)]
        token: Option<String>,
        #[serde(default)]
        capabilities: Vec<String>,
        #[serde(default)]
        metadata: WorkerMetadata,
    },
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "subscribe")]
    Subscribe { channels: Vec<String> },
    #[serde(rename = "unsubscribe")]
    Unsubscribe { channels: Vec<String> },
    #[serde(rename = "task:started", rename_all = "camelCase")]
    TaskStarted { task_id: String },
    #[serde(rename = "task:progress", rename_all = "camelCase")]
    TaskProgress {
        task_id: String,
        #[serde(default)]
        progress: Option<f64>,
        #[serde(default)]
        message: Option<String>,
    },
    #[serde(rename = "task:complete", rename_all = "camelCase")]
    TaskComplete {
        task_id: String,
        #[serde(default)]
        result: serde_json::Value,
    },
    #[serde(rename = "task:error", rename_all = "camelCase")]
    TaskError { task_id: String, error: String },
}

impl ClientMessage {
    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Auth { .. } => "auth",
            Self::Ping => "ping",
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
            Self::TaskStarted { .. } => "task:started",
            Self::TaskProgress { .. } => "task:progress",
            Self::TaskComplete { .. } => "task:complete",
            Self::TaskError { .. } => "task:error",
        }
    }
}

/// Server → client messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "auth:success", rename_all = "camelCase")]
    AuthSuccess {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        worker_id: Option<String>,
        #[serde(default)]
        capabilities: Vec<String>,
    },
    #[serde(rename = "auth:failed")]
    AuthFailed { reason: String },
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "subscribed")]
    Subscribed { channels: Vec<String> },
    #[serde(rename = "unsubscribed")]
    Unsubscribed { channels: Vec<String> },
    #[serde(rename = "event")]
    Event { event: OrchestratorEvent },
    #[serde(rename = "task:assign")]
    TaskAssign { task: Box<Task> },
    #[serde(rename = "shutdown")]
    Shutdown { reason: String },
    #[serde(rename = "error")]
    Error { message: String },
}
