//! Connected worker records owned by the hub.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use super::protocol::{ServerMessage, WorkerMetadata};
use crate::dispatcher::{Task, TaskType};
use crate::federation::{ScopeDecision, TokenScope};

/// Per-worker shutdown state machine.
///
/// `Active → TerminationRequested → Terminating → Terminated`, or straight from
/// `Active` to `Terminating` when the worker is idle. Only the hub moves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationState {
    Active,
    /// Shutdown deferred until the current task finishes.
    TerminationRequested,
    /// Ready to stop; no further assignments.
    Terminating,
    Terminated,
}

/// Outcome of asking the hub to terminate a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationDecision {
    /// The worker was idle and is now `Terminating`.
    Immediate,
    /// The worker is busy; `ReadyForTermination` fires once it goes idle.
    Deferred,
    /// Termination was already underway.
    AlreadyTerminating,
}

/// A live worker connection.
#[derive(Debug)]
pub struct ConnectedWorker {
    pub id: String,
    pub capabilities: Vec<String>,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub current_task_id: Option<String>,
    pub current_task_type: Option<TaskType>,
    /// When the worker last became idle; `None` while busy.
    pub idle_since: Option<DateTime<Utc>>,
    pub termination: TerminationState,
    pub metadata: WorkerMetadata,
    pub scope: ScopeDecision,
    /// Audit record created when the worker joined under a token.
    pub registration_id: Option<String>,
    pub(super) outbound: mpsc::Sender<ServerMessage>,
}

impl ConnectedWorker {
    pub fn is_idle(&self) -> bool {
        self.current_task_id.is_none()
    }

    /// Idle and not on its way out.
    pub fn is_available(&self) -> bool {
        self.is_idle() && self.termination == TerminationState::Active
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }

    /// Whether this worker may be offered tasks for `project`.
    pub fn serves_project(&self, project: Option<&str>) -> bool {
        self.scope.allows_project(project)
    }

    pub fn token_id(&self) -> Option<&str> {
        self.scope.token_id.as_deref()
    }

    pub fn spawned_id(&self) -> Option<&str> {
        self.metadata.spawned_id.as_deref()
    }

    pub(super) fn mark_busy(&mut self, task: &Task) {
        self.current_task_id = Some(task.id.clone());
        self.current_task_type = Some(task.task_type);
        self.idle_since = None;
    }

    pub(super) fn mark_idle(&mut self, now: DateTime<Utc>) {
        self.current_task_id = None;
        self.current_task_type = None;
        self.idle_since = Some(now);
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            id: self.id.clone(),
            capabilities: self.capabilities.clone(),
            connected_at: self.connected_at,
            last_heartbeat: self.last_heartbeat,
            current_task_id: self.current_task_id.clone(),
            current_task_type: self.current_task_type,
            termination: self.termination,
            metadata: self.metadata.clone(),
            token_id: self.scope.token_id.clone(),
            scope: self.scope.scope,
            project_filter: self
                .scope
                .project_filter
                .as_ref()
                .map(|g| g.as_str().to_string()),
        }
    }
}

/// Read-only view of a connected worker.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSnapshot {
    pub id: String,
    pub capabilities: Vec<String>,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_task_type: Option<TaskType>,
    pub termination: TerminationState,
    pub metadata: WorkerMetadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_id: Option<String>,
    pub scope: TokenScope,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_filter: Option<String>,
}

impl WorkerSnapshot {
    pub fn is_idle(&self) -> bool {
        self.current_task_id.is_none()
    }
}
