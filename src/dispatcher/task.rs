//! Task model and status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DispatchError;

/// Kind of job a task carries. The payload itself is opaque to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Summarize,
    Embedding,
    Document,
    Cleanup,
}

impl TaskType {
    pub const ALL: [TaskType; 4] = [
        TaskType::Summarize,
        TaskType::Embedding,
        TaskType::Document,
        TaskType::Cleanup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Summarize => "summarize",
            Self::Embedding => "embedding",
            Self::Document => "document",
            Self::Cleanup => "cleanup",
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "summarize" => Ok(Self::Summarize),
            "embedding" => Ok(Self::Embedding),
            "document" => Ok(Self::Document),
            "cleanup" => Ok(Self::Cleanup),
            _ => Err(format!("Unknown task type: {s}")),
        }
    }
}

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for an eligible idle worker.
    Pending,
    /// Handed to a worker, not yet acknowledged.
    Assigned,
    /// Worker acknowledged and is executing.
    Processing,
    Completed,
    Failed,
    /// Exceeded its processing window with no retries left.
    Timeout,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Pending,
        TaskStatus::Assigned,
        TaskStatus::Processing,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Timeout,
    ];

    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            (Pending, Assigned) | (Pending, Failed) |
            // Assignment reverted or retried
            (Assigned, Pending) | (Assigned, Processing) | (Assigned, Completed) |
            (Assigned, Failed) | (Assigned, Timeout) |
            (Processing, Pending) | (Processing, Completed) |
            (Processing, Failed) | (Processing, Timeout)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Timeout)
    }

    /// Statuses in which a task holds a worker.
    pub fn holds_assignment(&self) -> bool {
        matches!(self, Self::Assigned | Self::Processing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "assigned" => Ok(Self::Assigned),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "timeout" => Ok(Self::Timeout),
            _ => Err(format!("Unknown task status: {s}")),
        }
    }
}

/// Submission request for a new task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    #[serde(rename = "type")]
    pub task_type: TaskType,
    /// Defaults to the task type name.
    #[serde(default)]
    pub required_capability: Option<String>,
    #[serde(default)]
    pub fallback_capabilities: Vec<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub project: Option<String>,
    /// Defaults to the dispatcher's configured retry budget.
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub deduplication_key: Option<String>,
}

impl TaskRequest {
    pub fn new(task_type: TaskType) -> Self {
        Self {
            task_type,
            required_capability: None,
            fallback_capabilities: Vec::new(),
            priority: 0,
            payload: serde_json::Value::Null,
            project: None,
            max_retries: None,
            deduplication_key: None,
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.required_capability = Some(capability.into());
        self
    }

    pub fn with_fallbacks(mut self, fallbacks: Vec<String>) -> Self {
        self.fallback_capabilities = fallbacks;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
        self.deduplication_key = Some(key.into());
        self
    }
}

/// A unit of work.
///
/// `assigned_worker_id` is `Some` exactly while the status is `assigned` or
/// `processing`; every mutator below preserves that.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub required_capability: String,
    pub fallback_capabilities: Vec<String>,
    pub priority: i32,
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_worker_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deduplication_key: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Earliest time a requeued task is eligible again.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<DateTime<Utc>>,
}

impl Task {
    /// Build a pending task from a submission request.
    pub fn from_request(request: TaskRequest, default_max_retries: u32) -> Self {
        let required_capability = request
            .required_capability
            .filter(|c| !c.trim().is_empty())
            .unwrap_or_else(|| request.task_type.as_str().to_string());

        Self {
            id: Uuid::new_v4().to_string(),
            task_type: request.task_type,
            status: TaskStatus::Pending,
            required_capability,
            fallback_capabilities: request.fallback_capabilities,
            priority: request.priority,
            payload: request.payload,
            project: request.project,
            result: None,
            error: None,
            retry_count: 0,
            max_retries: request.max_retries.unwrap_or(default_max_retries),
            assigned_worker_id: None,
            deduplication_key: request.deduplication_key.filter(|k| !k.is_empty()),
            created_at: Utc::now(),
            assigned_at: None,
            started_at: None,
            completed_at: None,
            retry_after: None,
        }
    }

    fn check(&self, target: TaskStatus, action: &str) -> Result<(), DispatchError> {
        if self.status.can_transition_to(target) {
            Ok(())
        } else {
            Err(DispatchError::InvalidTransition {
                id: self.id.clone(),
                state: self.status,
                action: action.to_string(),
            })
        }
    }

    /// Whether a pending task may be offered to a worker at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending && self.retry_after.is_none_or(|at| at <= now)
    }

    /// Whether `worker_id` currently holds this task.
    pub fn is_held_by(&self, worker_id: &str) -> bool {
        self.status.holds_assignment() && self.assigned_worker_id.as_deref() == Some(worker_id)
    }

    pub fn assign(&mut self, worker_id: &str, now: DateTime<Utc>) -> Result<(), DispatchError> {
        self.check(TaskStatus::Assigned, "assign")?;
        self.status = TaskStatus::Assigned;
        self.assigned_worker_id = Some(worker_id.to_string());
        self.assigned_at = Some(now);
        self.started_at = None;
        Ok(())
    }

    /// Undo an assignment the hub refused. Does not consume a retry.
    pub fn revert_assignment(&mut self) -> Result<(), DispatchError> {
        if self.status != TaskStatus::Assigned {
            return Err(DispatchError::InvalidTransition {
                id: self.id.clone(),
                state: self.status,
                action: "revert assignment".to_string(),
            });
        }
        self.status = TaskStatus::Pending;
        self.assigned_worker_id = None;
        self.assigned_at = None;
        Ok(())
    }

    pub fn start_processing(&mut self, now: DateTime<Utc>) -> Result<(), DispatchError> {
        self.check(TaskStatus::Processing, "start processing")?;
        self.status = TaskStatus::Processing;
        self.started_at = Some(now);
        Ok(())
    }

    pub fn complete(
        &mut self,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<(), DispatchError> {
        self.check(TaskStatus::Completed, "complete")?;
        self.status = TaskStatus::Completed;
        self.result = Some(result);
        self.error = None;
        self.assigned_worker_id = None;
        self.completed_at = Some(now);
        Ok(())
    }

    /// Whether another attempt is allowed after a failure.
    pub fn has_retries_left(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Return a failed attempt to the queue, eligible again at `retry_after`.
    pub fn requeue(
        &mut self,
        error: impl Into<String>,
        retry_after: DateTime<Utc>,
    ) -> Result<(), DispatchError> {
        self.check(TaskStatus::Pending, "requeue")?;
        self.status = TaskStatus::Pending;
        self.retry_count += 1;
        self.error = Some(error.into());
        self.assigned_worker_id = None;
        self.assigned_at = None;
        self.started_at = None;
        self.retry_after = Some(retry_after);
        Ok(())
    }

    /// Move to a terminal failure status (`failed` or `timeout`).
    pub fn fail(
        &mut self,
        status: TaskStatus,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), DispatchError> {
        debug_assert!(matches!(status, TaskStatus::Failed | TaskStatus::Timeout));
        self.check(status, "fail")?;
        self.status = status;
        self.error = Some(error.into());
        self.assigned_worker_id = None;
        self.completed_at = Some(now);
        Ok(())
    }

    /// Operator re-queue of a terminal task with a fresh retry budget.
    pub fn reset_for_retry(&mut self) -> Result<(), DispatchError> {
        if !self.status.is_terminal() {
            return Err(DispatchError::InvalidTransition {
                id: self.id.clone(),
                state: self.status,
                action: "retry".to_string(),
            });
        }
        self.status = TaskStatus::Pending;
        self.retry_count = 0;
        self.error = None;
        self.result = None;
        self.assigned_worker_id = None;
        self.assigned_at = None;
        self.started_at = None;
        self.completed_at = None;
        self.retry_after = None;
        Ok(())
    }

    /// When the task entered its current in-flight status.
    pub fn in_state_since(&self) -> Option<DateTime<Utc>> {
        match self.status {
            TaskStatus::Assigned => self.assigned_at,
            TaskStatus::Processing => self.started_at.or(self.assigned_at),
            _ => None,
        }
    }

    /// Compact JSON summary carried by lifecycle events.
    pub fn event_data(&self) -> serde_json::Value {
        serde_json::json!({
            "taskId": self.id,
            "type": self.task_type,
            "status": self.status,
            "workerId": self.assigned_worker_id,
            "retryCount": self.retry_count,
            "maxRetries": self.max_retries,
            "error": self.error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(max_retries: u32) -> Task {
        Task::from_request(
            TaskRequest::new(TaskType::Summarize).with_max_retries(max_retries),
            3,
        )
    }

    fn assignment_invariant(task: &Task) -> bool {
        task.assigned_worker_id.is_some() == task.status.holds_assignment()
    }

    #[test]
    fn request_defaults() {
        let task = Task::from_request(TaskRequest::new(TaskType::Embedding), 5);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.required_capability, "embedding");
        assert_eq!(task.max_retries, 5);
        assert!(task.is_eligible(Utc::now()));
    }

    #[test]
    fn valid_and_invalid_transitions() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Assigned));
        assert!(TaskStatus::Assigned.can_transition_to(TaskStatus::Processing));
        assert!(TaskStatus::Processing.can_transition_to(TaskStatus::Timeout));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Processing));
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Pending));
        assert!(!TaskStatus::Failed.can_transition_to(TaskStatus::Assigned));
    }

    #[test]
    fn lifecycle_keeps_assignment_invariant() {
        let mut task = pending(1);
        let now = Utc::now();
        assert!(assignment_invariant(&task));

        task.assign("w-1", now).unwrap();
        assert!(assignment_invariant(&task));
        assert!(task.is_held_by("w-1"));

        task.start_processing(now).unwrap();
        assert!(assignment_invariant(&task));

        task.requeue("boom", now).unwrap();
        assert!(assignment_invariant(&task));
        assert_eq!(task.retry_count, 1);

        task.assign("w-2", now).unwrap();
        task.complete(serde_json::json!({"ok": true}), now).unwrap();
        assert!(assignment_invariant(&task));
        assert!(task.completed_at.is_some());
    }

    #[test]
    fn terminal_tasks_are_not_mutated() {
        let mut task = pending(0);
        let now = Utc::now();
        task.assign("w-1", now).unwrap();
        task.fail(TaskStatus::Failed, "nope", now).unwrap();

        assert!(task.assign("w-2", now).is_err());
        assert!(task.requeue("again", now).is_err());
        assert!(task.complete(serde_json::Value::Null, now).is_err());
    }

    #[test]
    fn retry_after_gates_eligibility() {
        let mut task = pending(2);
        let now = Utc::now();
        task.assign("w-1", now).unwrap();
        task.requeue("err", now + chrono::Duration::seconds(30)).unwrap();

        assert!(!task.is_eligible(now));
        assert!(task.is_eligible(now + chrono::Duration::seconds(31)));
    }

    #[test]
    fn reset_only_from_terminal() {
        let mut task = pending(0);
        assert!(task.reset_for_retry().is_err());

        let now = Utc::now();
        task.assign("w-1", now).unwrap();
        task.fail(TaskStatus::Timeout, "slow", now).unwrap();
        task.reset_for_retry().unwrap();

        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 0);
        assert!(task.error.is_none());
    }

    #[test]
    fn wire_format_is_camel_case() {
        let task = pending(2);
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["type"], "summarize");
        assert_eq!(json["status"], "pending");
        assert_eq!(json["requiredCapability"], "summarize");
        assert_eq!(json["maxRetries"], 2);
        assert!(json.get("assignedWorkerId").is_none());
    }
}
