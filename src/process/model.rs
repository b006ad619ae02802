//! Spawned worker process records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a locally spawned worker process.
///
/// `starting → running → stopping → stopped`, or `crashed` on an exit nobody asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
}

impl ProcessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Crashed => "crashed",
        }
    }

    /// Whether the OS process is still alive (or believed to be).
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Profile for one spawned worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnConfig {
    /// Provider/model profile handed to the child.
    #[serde(default)]
    pub provider: Option<String>,
    /// Overrides the configured capability list when non-empty.
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl SpawnConfig {
    pub fn with_provider(provider: impl Into<String>) -> Self {
        Self {
            provider: Some(provider.into()),
            capabilities: Vec::new(),
        }
    }
}

/// A locally managed worker process.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnedWorkerProcess {
    pub id: String,
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    pub status: ProcessStatus,
    pub spawned_at: DateTime<Utc>,
    /// Hub worker id, set once the child completes its handshake.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_worker_id: Option<String>,
    pub pending_termination: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exited_at: Option<DateTime<Utc>>,
}
