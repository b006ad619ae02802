//! Task dispatcher: owns the task queue and every task status transition.
//!
//! All transitions run under one async mutex so a worker's completion report and
//! the timeout sweep can never both act on the same task. The dispatcher is the
//! only writer of task status and assignment fields; workers are marked busy and
//! idle exclusively through [`WorkerHub`].

pub mod matching;
pub mod retry;
pub mod task;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub use matching::{capability_candidates, dispatch_order};
pub use retry::{BackoffPolicy, ExponentialBackoff, FixedBackoff};
pub use task::{Task, TaskRequest, TaskStatus, TaskType};

use crate::config::DispatcherConfig;
use crate::error::{DispatchError, HubError};
use crate::events::{EventBroadcaster, EventKind};
use crate::hub::WorkerHub;
use crate::store::QueueStore;

/// Why an attempt ended without a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCause {
    /// The worker reported an execution error.
    Error,
    /// The task exceeded its processing window.
    Timeout,
    /// The worker disconnected or missed heartbeats.
    WorkerLost,
    /// The worker process exited unexpectedly.
    Crashed,
}

impl FailureCause {
    /// Terminal status once retries are exhausted.
    fn terminal_status(self) -> TaskStatus {
        match self {
            Self::Timeout => TaskStatus::Timeout,
            _ => TaskStatus::Failed,
        }
    }
}

/// Task counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStats {
    pub pending: u64,
    pub assigned: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub timeout: u64,
    pub total: u64,
}

impl From<HashMap<TaskStatus, u64>> for TaskStats {
    fn from(counts: HashMap<TaskStatus, u64>) -> Self {
        let get = |s: TaskStatus| counts.get(&s).copied().unwrap_or(0);
        Self {
            pending: get(TaskStatus::Pending),
            assigned: get(TaskStatus::Assigned),
            processing: get(TaskStatus::Processing),
            completed: get(TaskStatus::Completed),
            failed: get(TaskStatus::Failed),
            timeout: get(TaskStatus::Timeout),
            total: counts.values().sum(),
        }
    }
}

pub struct TaskDispatcher {
    store: Arc<dyn QueueStore>,
    hub: Arc<WorkerHub>,
    events: EventBroadcaster,
    config: DispatcherConfig,
    backoff: Arc<dyn BackoffPolicy>,
    /// Serializes every task transition.
    transitions: Mutex<()>,
}

impl TaskDispatcher {
    pub fn new(
        store: Arc<dyn QueueStore>,
        hub: Arc<WorkerHub>,
        events: EventBroadcaster,
        config: DispatcherConfig,
    ) -> Self {
        let backoff = Arc::new(config.backoff);
        Self {
            store,
            hub,
            events,
            config,
            backoff,
            transitions: Mutex::new(()),
        }
    }

    /// Replace the retry backoff curve.
    pub fn with_backoff(mut self, backoff: Arc<dyn BackoffPolicy>) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    // ── Submission ──────────────────────────────────────────────────

    /// Queue a task and try to dispatch it.
    ///
    /// A submission whose deduplication key matches a non-terminal task returns
    /// that task instead of creating another.
    pub async fn submit(&self, request: TaskRequest) -> Result<Task, DispatchError> {
        let task = {
            let _guard = self.transitions.lock().await;

            if let Some(key) = request.deduplication_key.as_deref().filter(|k| !k.is_empty()) {
                if let Some(existing) = self.store.find_active_by_dedup_key(key).await? {
                    debug!(task_id = %existing.id, dedup_key = key, "Duplicate submission collapsed");
                    return Ok(existing);
                }
            }

            if request
                .fallback_capabilities
                .iter()
                .any(|c| c.trim().is_empty())
            {
                return Err(DispatchError::InvalidTask(
                    "fallback capabilities must be non-empty".into(),
                ));
            }

            let task = Task::from_request(request, self.config.default_max_retries);
            self.store.insert_task(&task).await?;
            info!(
                task_id = %task.id,
                task_type = %task.task_type,
                priority = task.priority,
                capability = %task.required_capability,
                "Task queued"
            );
            self.events.emit(EventKind::TaskQueued, task.event_data());
            task
        };

        self.dispatch_pending().await?;
        Ok(task)
    }

    // ── Assignment ──────────────────────────────────────────────────

    /// Assign the best eligible pending task to an idle capable worker.
    ///
    /// Returns the `(task_id, worker_id)` pair, or `None` when nothing can be
    /// assigned right now.
    pub async fn assign_next(&self) -> Result<Option<(String, String)>, DispatchError> {
        let _guard = self.transitions.lock().await;
        self.assign_next_locked().await
    }

    /// Assign until no eligible task/worker pair remains; returns how many.
    pub async fn dispatch_pending(&self) -> Result<usize, DispatchError> {
        let _guard = self.transitions.lock().await;
        let mut assigned = 0;
        while self.assign_next_locked().await?.is_some() {
            assigned += 1;
        }
        if assigned > 0 {
            debug!(assigned, "Dispatch cycle complete");
        }
        Ok(assigned)
    }

    async fn assign_next_locked(&self) -> Result<Option<(String, String)>, DispatchError> {
        let now = Utc::now();
        let mut pending: Vec<Task> = self
            .store
            .list_tasks(Some(TaskStatus::Pending))
            .await?
            .into_iter()
            .filter(|t| t.is_eligible(now))
            .collect();
        pending.sort_by(dispatch_order);

        'tasks: for mut task in pending {
            let candidates: Vec<String> = capability_candidates(&task)
                .into_iter()
                .map(String::from)
                .collect();
            for capability in &candidates {
                let Some(worker_id) = self
                    .hub
                    .find_idle_worker_with_capability(capability, task.project.as_deref())
                    .await
                else {
                    continue;
                };

                task.assign(&worker_id, now)?;
                self.store.update_task(&task).await?;

                if let Err(e) = self.hub.assign_task(&worker_id, &task).await {
                    // Worker went away between lookup and assignment; retried next cycle.
                    warn!(task_id = %task.id, worker_id = %worker_id, error = %e, "Assignment refused, reverting");
                    task.revert_assignment()?;
                    self.store.update_task(&task).await?;
                    if matches!(e, HubError::SendFailed { .. }) {
                        self.hub.remove_worker(&worker_id, "connection closed").await;
                    }
                    continue 'tasks;
                }

                info!(
                    task_id = %task.id,
                    worker_id = %worker_id,
                    capability = %capability,
                    "Task assigned"
                );
                self.events.emit(EventKind::TaskAssigned, task.event_data());
                return Ok(Some((task.id, worker_id)));
            }
        }
        Ok(None)
    }

    // ── Worker reports ──────────────────────────────────────────────

    /// Load a task and check that `worker_id` holds it. Stale reports yield `None`.
    async fn held_task(
        &self,
        task_id: &str,
        worker_id: &str,
    ) -> Result<Option<Task>, DispatchError> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| DispatchError::NotFound {
                id: task_id.to_string(),
            })?;
        if task.is_held_by(worker_id) {
            Ok(Some(task))
        } else {
            debug!(
                task_id = %task_id,
                worker_id = %worker_id,
                status = %task.status,
                "Ignoring report for a task this worker does not hold"
            );
            Ok(None)
        }
    }

    /// The worker acknowledged the task and began executing it.
    pub async fn mark_processing(
        &self,
        task_id: &str,
        worker_id: &str,
    ) -> Result<bool, DispatchError> {
        let _guard = self.transitions.lock().await;
        let Some(mut task) = self.held_task(task_id, worker_id).await? else {
            return Ok(false);
        };
        if task.status == TaskStatus::Processing {
            return Ok(true);
        }

        task.start_processing(Utc::now())?;
        self.store.update_task(&task).await?;
        debug!(task_id = %task_id, worker_id = %worker_id, "Task processing");
        self.events.emit(EventKind::TaskProcessing, task.event_data());
        Ok(true)
    }

    /// Relay a progress update. Does not change task state.
    pub async fn report_progress(
        &self,
        task_id: &str,
        worker_id: &str,
        progress: Option<f64>,
        message: Option<String>,
    ) -> Result<bool, DispatchError> {
        let _guard = self.transitions.lock().await;
        if self.held_task(task_id, worker_id).await?.is_none() {
            return Ok(false);
        }
        self.events.emit(
            EventKind::TaskProgress,
            serde_json::json!({
                "taskId": task_id,
                "workerId": worker_id,
                "progress": progress,
                "message": message,
            }),
        );
        Ok(true)
    }

    /// Record a successful result and free the worker.
    pub async fn complete(
        &self,
        task_id: &str,
        worker_id: &str,
        result: serde_json::Value,
    ) -> Result<bool, DispatchError> {
        let _guard = self.transitions.lock().await;
        let Some(mut task) = self.held_task(task_id, worker_id).await? else {
            return Ok(false);
        };

        task.complete(result, Utc::now())?;
        self.store.update_task(&task).await?;
        info!(task_id = %task_id, worker_id = %worker_id, "Task completed");

        let mut data = task.event_data();
        data["workerId"] = serde_json::json!(worker_id);
        self.events.emit(EventKind::TaskCompleted, data);

        self.release_worker(worker_id).await;
        Ok(true)
    }

    /// Record an execution error: retry with backoff or fail terminally.
    pub async fn fail(
        &self,
        task_id: &str,
        worker_id: &str,
        error: &str,
    ) -> Result<bool, DispatchError> {
        let _guard = self.transitions.lock().await;
        let Some(task) = self.held_task(task_id, worker_id).await? else {
            return Ok(false);
        };

        self.retry_or_fail(task, error, FailureCause::Error).await?;
        self.release_worker(worker_id).await;
        Ok(true)
    }

    /// Route the task a vanished worker held through retry-or-fail.
    pub async fn release_worker_task(
        &self,
        worker_id: &str,
        task_id: &str,
        cause: FailureCause,
    ) -> Result<bool, DispatchError> {
        let _guard = self.transitions.lock().await;
        let Some(task) = self.held_task(task_id, worker_id).await? else {
            return Ok(false);
        };

        let error = match cause {
            FailureCause::Crashed => "worker process crashed",
            FailureCause::Timeout => "task timed out",
            _ => "worker disconnected",
        };
        self.retry_or_fail(task, error, cause).await?;
        Ok(true)
    }

    async fn release_worker(&self, worker_id: &str) {
        match self.hub.mark_idle(worker_id).await {
            Ok(()) | Err(HubError::WorkerNotFound { .. }) => {}
            Err(e) => warn!(worker_id = %worker_id, error = %e, "Failed to release worker"),
        }
    }

    /// Requeue with backoff while retries remain, otherwise move to a terminal status.
    async fn retry_or_fail(
        &self,
        mut task: Task,
        error: &str,
        cause: FailureCause,
    ) -> Result<(), DispatchError> {
        let now = Utc::now();
        let worker_id = task.assigned_worker_id.clone();

        if task.has_retries_left() {
            let delay = self.backoff.delay(task.retry_count);
            let retry_after =
                now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            task.requeue(error, retry_after)?;
            self.store.update_task(&task).await?;

            info!(
                task_id = %task.id,
                worker_id = ?worker_id,
                retry_count = task.retry_count,
                max_retries = task.max_retries,
                delay_ms = delay.as_millis() as u64,
                cause = ?cause,
                "Task requeued for retry"
            );
            let mut data = task.event_data();
            data["retryAfter"] = serde_json::json!(task.retry_after);
            self.events.emit(EventKind::TaskQueued, data);
        } else {
            task.fail(cause.terminal_status(), error, now)?;
            self.store.update_task(&task).await?;

            warn!(
                task_id = %task.id,
                worker_id = ?worker_id,
                status = %task.status,
                retry_count = task.retry_count,
                error = error,
                "Task failed"
            );
            let mut data = task.event_data();
            data["workerId"] = serde_json::json!(worker_id);
            self.events.emit(EventKind::TaskFailed, data);
        }
        Ok(())
    }

    // ── Sweeps ──────────────────────────────────────────────────────

    /// Time out in-flight tasks past their window and recover orphans whose
    /// worker is no longer connected. Returns how many tasks were released.
    pub async fn check_timeouts(&self) -> Result<usize, DispatchError> {
        let _guard = self.transitions.lock().await;
        let now = Utc::now();

        let mut in_flight = self.store.list_tasks(Some(TaskStatus::Assigned)).await?;
        in_flight.extend(self.store.list_tasks(Some(TaskStatus::Processing)).await?);

        let mut released = 0;
        for task in in_flight {
            let Some(worker_id) = task.assigned_worker_id.clone() else {
                continue;
            };

            if !self.hub.is_connected(&worker_id).await {
                self.retry_or_fail(task, "worker disconnected", FailureCause::WorkerLost)
                    .await?;
                released += 1;
                continue;
            }

            let Some(since) = task.in_state_since() else {
                continue;
            };
            let window = self.config.timeout_for(task.task_type);
            let elapsed = (now - since).to_std().unwrap_or_default();
            if elapsed > window {
                warn!(
                    task_id = %task.id,
                    worker_id = %worker_id,
                    elapsed_secs = elapsed.as_secs(),
                    "Task exceeded its processing window"
                );
                self.retry_or_fail(task, "task timed out", FailureCause::Timeout)
                    .await?;
                self.release_worker(&worker_id).await;
                released += 1;
            }
        }
        Ok(released)
    }

    /// Purge terminal tasks older than the retention window.
    pub async fn cleanup_finished(&self) -> Result<usize, DispatchError> {
        let retention = chrono::Duration::from_std(self.config.completed_retention)
            .unwrap_or_else(|_| chrono::Duration::days(1));
        let removed = self
            .store
            .delete_finished_before(Utc::now() - retention)
            .await?;
        if removed > 0 {
            info!(removed, "Purged finished tasks");
        }
        Ok(removed)
    }

    // ── Operator actions ────────────────────────────────────────────

    /// Re-queue a terminal task with a fresh retry budget.
    pub async fn retry(&self, task_id: &str) -> Result<Task, DispatchError> {
        let task = {
            let _guard = self.transitions.lock().await;
            let mut task = self.require(task_id).await?;
            task.reset_for_retry()?;
            self.store.update_task(&task).await?;
            info!(task_id = %task_id, "Task manually retried");
            self.events.emit(EventKind::TaskQueued, task.event_data());
            task
        };
        self.dispatch_pending().await?;
        Ok(task)
    }

    /// Cancel a pending task. In-flight tasks are not interrupted.
    pub async fn cancel(&self, task_id: &str) -> Result<Task, DispatchError> {
        let _guard = self.transitions.lock().await;
        let mut task = self.require(task_id).await?;
        if task.status != TaskStatus::Pending {
            return Err(DispatchError::InvalidTransition {
                id: task.id,
                state: task.status,
                action: "cancel".to_string(),
            });
        }
        task.fail(TaskStatus::Failed, "cancelled", Utc::now())?;
        self.store.update_task(&task).await?;
        info!(task_id = %task_id, "Task cancelled");
        self.events.emit(EventKind::TaskFailed, task.event_data());
        Ok(task)
    }

    // ── Queries ─────────────────────────────────────────────────────

    async fn require(&self, task_id: &str) -> Result<Task, DispatchError> {
        self.store
            .get_task(task_id)
            .await?
            .ok_or_else(|| DispatchError::NotFound {
                id: task_id.to_string(),
            })
    }

    pub async fn get(&self, task_id: &str) -> Result<Option<Task>, DispatchError> {
        Ok(self.store.get_task(task_id).await?)
    }

    pub async fn list(&self, status: Option<TaskStatus>) -> Result<Vec<Task>, DispatchError> {
        Ok(self.store.list_tasks(status).await?)
    }

    pub async fn stats(&self) -> Result<TaskStats, DispatchError> {
        Ok(self.store.count_by_status().await?.into())
    }
}
