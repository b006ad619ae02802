//! `WorkerHub`: sole owner of connected worker records.
//!
//! Other components never touch a [`ConnectedWorker`] directly: the dispatcher
//! finds candidates and marks workers busy/idle through this API, the process
//! manager requests termination, and everything the hub observes is published on
//! a typed [`HubSignal`] channel the orchestrator routes.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use secrecy::ExposeSecret;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::protocol::{ServerMessage, WorkerMetadata};
use super::worker::{ConnectedWorker, TerminationDecision, TerminationState, WorkerSnapshot};
use crate::config::HubConfig;
use crate::dispatcher::Task;
use crate::error::{HubError, TokenError};
use crate::events::{EventBroadcaster, EventKind};
use crate::federation::{ScopeDecision, TokenRegistry, WorkerToken, secret_matches};

/// A task report forwarded from a worker connection.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskReport {
    Started {
        task_id: String,
    },
    Progress {
        task_id: String,
        progress: Option<f64>,
        message: Option<String>,
    },
    Complete {
        task_id: String,
        result: serde_json::Value,
    },
    Error {
        task_id: String,
        error: String,
    },
}

impl TaskReport {
    pub fn task_id(&self) -> &str {
        match self {
            Self::Started { task_id }
            | Self::Progress { task_id, .. }
            | Self::Complete { task_id, .. }
            | Self::Error { task_id, .. } => task_id,
        }
    }
}

/// Everything the hub tells the rest of the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum HubSignal {
    WorkerConnected {
        worker_id: String,
        capabilities: Vec<String>,
        spawned_id: Option<String>,
    },
    /// The worker can take another task.
    WorkerIdle { worker_id: String },
    WorkerDisconnected {
        worker_id: String,
        spawned_id: Option<String>,
        /// Task the worker held when it went away.
        held_task: Option<String>,
        reason: String,
    },
    /// A deferred termination may now proceed. Fires at most once per worker.
    ReadyForTermination {
        worker_id: String,
        spawned_id: Option<String>,
    },
    TaskReport {
        worker_id: String,
        report: TaskReport,
    },
}

/// Registry of live worker connections.
pub struct WorkerHub {
    config: HubConfig,
    workers: RwLock<HashMap<String, ConnectedWorker>>,
    events: EventBroadcaster,
    tokens: Arc<TokenRegistry>,
    signals: mpsc::UnboundedSender<HubSignal>,
}

impl WorkerHub {
    /// Build a hub and the receiving end of its signal channel.
    pub fn new(
        config: HubConfig,
        events: EventBroadcaster,
        tokens: Arc<TokenRegistry>,
    ) -> (Self, mpsc::UnboundedReceiver<HubSignal>) {
        let (signals, rx) = mpsc::unbounded_channel();
        let hub = Self {
            config,
            workers: RwLock::new(HashMap::new()),
            events,
            tokens,
            signals,
        };
        (hub, rx)
    }

    pub fn hub_id(&self) -> &str {
        &self.config.hub_id
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    fn signal(&self, signal: HubSignal) {
        if self.signals.send(signal).is_err() {
            debug!("Hub signal dropped; no receiver");
        }
    }

    // ── Authentication ──────────────────────────────────────────────

    /// Decide whether a presented credential may join this hub.
    ///
    /// The hub's shared secret grants instance scope. Any other credential must be
    /// a valid worker token admitted to this hub. No credential is accepted only
    /// when anonymous workers are allowed.
    pub async fn authenticate(&self, token: Option<&str>) -> Result<ScopeDecision, HubError> {
        let token = token.filter(|t| !t.is_empty());

        if let (Some(secret), Some(given)) = (&self.config.auth_token, token) {
            if secret_matches(secret.expose_secret(), given) {
                return Ok(ScopeDecision::unrestricted());
            }
        }

        match token {
            Some(given) => {
                let decision =
                    self.tokens
                        .validate(given)
                        .await
                        .map_err(|e| HubError::AuthFailed {
                            reason: e.to_string(),
                        })?;
                if !decision.admits_hub(&self.config.hub_id) {
                    return Err(HubError::AuthFailed {
                        reason: "token is not valid for this hub".to_string(),
                    });
                }
                Ok(decision)
            }
            None if self.config.allow_anonymous => Ok(ScopeDecision::unrestricted()),
            None => Err(HubError::AuthFailed {
                reason: "credential required".to_string(),
            }),
        }
    }

    /// Create the worker record for an authenticated connection.
    ///
    /// Returns the worker id and the capabilities actually granted.
    pub async fn register(
        &self,
        scope: ScopeDecision,
        capabilities: Vec<String>,
        metadata: WorkerMetadata,
        outbound: mpsc::Sender<ServerMessage>,
    ) -> (String, Vec<String>) {
        let worker_id = Uuid::new_v4().to_string();
        let mut granted = scope.restrict_capabilities(capabilities);
        granted.sort();
        granted.dedup();

        let registration_id = match scope.token_id.as_deref() {
            Some(token_id) => match self
                .tokens
                .record_registration(token_id, &self.config.hub_id, &worker_id, &granted, &metadata)
                .await
            {
                Ok(registration) => Some(registration.id),
                Err(e) => {
                    warn!(worker_id = %worker_id, error = %e, "Failed to record worker registration");
                    None
                }
            },
            None => None,
        };

        let now = Utc::now();
        let worker = ConnectedWorker {
            id: worker_id.clone(),
            capabilities: granted.clone(),
            connected_at: now,
            last_heartbeat: now,
            current_task_id: None,
            current_task_type: None,
            idle_since: Some(now),
            termination: TerminationState::Active,
            metadata,
            scope,
            registration_id,
            outbound,
        };
        let spawned_id = worker.metadata.spawned_id.clone();

        {
            let mut workers = self.workers.write().await;
            info!(
                worker_id = %worker_id,
                capabilities = ?granted,
                spawned_id = ?spawned_id,
                "Worker connected"
            );
            self.events.emit(
                EventKind::WorkerConnected,
                serde_json::json!({
                    "workerId": worker_id,
                    "capabilities": granted,
                    "spawnedId": spawned_id,
                    "tokenId": worker.scope.token_id,
                }),
            );
            workers.insert(worker_id.clone(), worker);
        }

        self.signal(HubSignal::WorkerConnected {
            worker_id: worker_id.clone(),
            capabilities: granted.clone(),
            spawned_id,
        });
        (worker_id, granted)
    }

    // ── Liveness ────────────────────────────────────────────────────

    /// Record a heartbeat. Fails if the worker is gone or its token no longer valid.
    pub async fn heartbeat(&self, worker_id: &str) -> Result<(), HubError> {
        self.check_credentials(worker_id).await?;

        let registration_id = {
            let mut workers = self.workers.write().await;
            let worker = workers
                .get_mut(worker_id)
                .ok_or_else(|| HubError::WorkerNotFound {
                    id: worker_id.to_string(),
                })?;
            worker.last_heartbeat = Utc::now();
            worker.registration_id.clone()
        };
        debug!(worker_id = %worker_id, "Heartbeat");

        if let Some(registration_id) = registration_id {
            if let Err(e) = self.tokens.touch_registration(&registration_id).await {
                debug!(worker_id = %worker_id, error = %e, "Registration heartbeat not recorded");
            }
        }
        Ok(())
    }

    /// Re-check a worker's token. Every inbound message goes through this.
    pub async fn check_credentials(&self, worker_id: &str) -> Result<(), HubError> {
        let token_id = {
            let workers = self.workers.read().await;
            let worker = workers.get(worker_id).ok_or_else(|| HubError::WorkerNotFound {
                id: worker_id.to_string(),
            })?;
            worker.token_id().map(str::to_string)
        };

        match token_id {
            Some(token_id) => {
                self.tokens
                    .check_active(&token_id)
                    .await
                    .map_err(|e| HubError::AuthFailed {
                        reason: e.to_string(),
                    })
            }
            None => Ok(()),
        }
    }

    /// Remove workers whose last heartbeat is older than the grace window.
    pub async fn sweep_heartbeats(&self, now: DateTime<Utc>) -> Vec<String> {
        let grace = chrono::Duration::from_std(self.config.heartbeat_grace)
            .unwrap_or_else(|_| chrono::Duration::seconds(90));
        let stale: Vec<String> = {
            let workers = self.workers.read().await;
            workers
                .values()
                .filter(|w| now - w.last_heartbeat > grace)
                .map(|w| w.id.clone())
                .collect()
        };

        for worker_id in &stale {
            warn!(worker_id = %worker_id, "Worker missed heartbeats");
            self.remove_worker(worker_id, "heartbeat timeout").await;
        }
        stale
    }

    // ── Assignment ──────────────────────────────────────────────────

    /// Longest-idle available worker holding `capability` that may serve `project`.
    pub async fn find_idle_worker_with_capability(
        &self,
        capability: &str,
        project: Option<&str>,
    ) -> Option<String> {
        let workers = self.workers.read().await;
        workers
            .values()
            .filter(|w| {
                w.is_available() && w.has_capability(capability) && w.serves_project(project)
            })
            .min_by(|a, b| a.idle_since.cmp(&b.idle_since).then_with(|| a.id.cmp(&b.id)))
            .map(|w| w.id.clone())
    }

    /// Mark `worker_id` busy with `task` and deliver `task:assign`.
    ///
    /// Both happen under one write lock; if delivery fails the worker stays idle.
    pub async fn assign_task(&self, worker_id: &str, task: &Task) -> Result<(), HubError> {
        let mut workers = self.workers.write().await;
        let worker = workers
            .get_mut(worker_id)
            .ok_or_else(|| HubError::WorkerNotFound {
                id: worker_id.to_string(),
            })?;

        if !worker.is_available() || !worker.serves_project(task.project.as_deref()) {
            return Err(HubError::WorkerUnavailable {
                id: worker_id.to_string(),
            });
        }

        worker
            .outbound
            .try_send(ServerMessage::TaskAssign {
                task: Box::new(task.clone()),
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => HubError::WorkerUnavailable {
                    id: worker_id.to_string(),
                },
                mpsc::error::TrySendError::Closed(_) => HubError::SendFailed {
                    id: worker_id.to_string(),
                },
            })?;

        worker.mark_busy(task);
        debug!(worker_id = %worker_id, task_id = %task.id, "Worker marked busy");
        Ok(())
    }

    /// Release a worker after its task ends.
    ///
    /// A worker with a pending termination moves to `Terminating` and
    /// `ReadyForTermination` is signalled instead of `WorkerIdle`.
    pub async fn mark_idle(&self, worker_id: &str) -> Result<(), HubError> {
        let signal = {
            let mut workers = self.workers.write().await;
            let worker = workers
                .get_mut(worker_id)
                .ok_or_else(|| HubError::WorkerNotFound {
                    id: worker_id.to_string(),
                })?;
            worker.mark_idle(Utc::now());

            match worker.termination {
                TerminationState::TerminationRequested => {
                    worker.termination = TerminationState::Terminating;
                    info!(worker_id = %worker_id, "Worker finished its task; ready for termination");
                    Some(HubSignal::ReadyForTermination {
                        worker_id: worker_id.to_string(),
                        spawned_id: worker.spawned_id().map(str::to_string),
                    })
                }
                TerminationState::Active => Some(HubSignal::WorkerIdle {
                    worker_id: worker_id.to_string(),
                }),
                TerminationState::Terminating | TerminationState::Terminated => None,
            }
        };

        if let Some(signal) = signal {
            self.signal(signal);
        }
        Ok(())
    }

    /// Task currently held by a worker.
    pub async fn current_task(&self, worker_id: &str) -> Option<String> {
        self.workers
            .read()
            .await
            .get(worker_id)
            .and_then(|w| w.current_task_id.clone())
    }

    // ── Termination ─────────────────────────────────────────────────

    /// Ask a worker to stop. Idle workers stop now; busy ones after their task.
    pub async fn request_termination(
        &self,
        worker_id: &str,
    ) -> Result<TerminationDecision, HubError> {
        let mut workers = self.workers.write().await;
        let worker = workers
            .get_mut(worker_id)
            .ok_or_else(|| HubError::WorkerNotFound {
                id: worker_id.to_string(),
            })?;

        let decision = match worker.termination {
            TerminationState::Active if worker.is_idle() => {
                worker.termination = TerminationState::Terminating;
                TerminationDecision::Immediate
            }
            TerminationState::Active => {
                worker.termination = TerminationState::TerminationRequested;
                TerminationDecision::Deferred
            }
            TerminationState::TerminationRequested => TerminationDecision::Deferred,
            TerminationState::Terminating | TerminationState::Terminated => {
                TerminationDecision::AlreadyTerminating
            }
        };
        info!(worker_id = %worker_id, decision = ?decision, "Termination requested");
        Ok(decision)
    }

    /// Send `shutdown` to a worker so it can exit on its own.
    pub async fn request_shutdown(&self, worker_id: &str, reason: &str) -> Result<(), HubError> {
        let workers = self.workers.read().await;
        let worker = workers.get(worker_id).ok_or_else(|| HubError::WorkerNotFound {
            id: worker_id.to_string(),
        })?;
        worker
            .outbound
            .try_send(ServerMessage::Shutdown {
                reason: reason.to_string(),
            })
            .map_err(|_| HubError::SendFailed {
                id: worker_id.to_string(),
            })
    }

    /// Drop a worker record. Closing its outbound channel ends the connection.
    pub async fn remove_worker(&self, worker_id: &str, reason: &str) -> Option<WorkerSnapshot> {
        let (mut worker, snapshot) = {
            let mut workers = self.workers.write().await;
            let mut worker = workers.remove(worker_id)?;
            worker.termination = TerminationState::Terminated;
            let snapshot = worker.snapshot();

            info!(
                worker_id = %worker_id,
                reason = reason,
                held_task = ?worker.current_task_id,
                "Worker disconnected"
            );
            self.events.emit(
                EventKind::WorkerDisconnected,
                serde_json::json!({
                    "workerId": worker_id,
                    "reason": reason,
                    "taskId": worker.current_task_id,
                    "spawnedId": worker.metadata.spawned_id,
                }),
            );
            (worker, snapshot)
        };

        if let Some(registration_id) = worker.registration_id.take() {
            if let Err(e) = self.tokens.close_registration(&registration_id).await {
                warn!(worker_id = %worker_id, error = %e, "Failed to close registration");
            }
        }

        self.signal(HubSignal::WorkerDisconnected {
            worker_id: worker_id.to_string(),
            spawned_id: worker.metadata.spawned_id.clone(),
            held_task: worker.current_task_id.clone(),
            reason: reason.to_string(),
        });
        Some(snapshot)
    }

    /// Disconnect every worker authenticated with `token_id`.
    pub async fn disconnect_by_token(&self, token_id: &str) -> usize {
        let ids: Vec<String> = {
            let workers = self.workers.read().await;
            workers
                .values()
                .filter(|w| w.token_id() == Some(token_id))
                .map(|w| w.id.clone())
                .collect()
        };

        for worker_id in &ids {
            if let Err(e) = self.request_shutdown(worker_id, "token revoked").await {
                debug!(worker_id = %worker_id, error = %e, "Shutdown message not delivered");
            }
            self.remove_worker(worker_id, "token revoked").await;
        }
        ids.len()
    }

    /// Revoke a token and drop every worker that joined with it.
    pub async fn revoke_token(
        &self,
        token_id: &str,
    ) -> Result<(WorkerToken, usize), TokenError> {
        let token = self.tokens.revoke(token_id).await?;
        let disconnected = self.disconnect_by_token(token_id).await;
        if disconnected > 0 {
            info!(token_id = %token_id, disconnected, "Disconnected workers of revoked token");
        }
        Ok((token, disconnected))
    }

    pub fn tokens(&self) -> &Arc<TokenRegistry> {
        &self.tokens
    }

    /// Forward a worker's task report to the orchestrator.
    pub async fn report(&self, worker_id: &str, report: TaskReport) -> Result<(), HubError> {
        if !self.workers.read().await.contains_key(worker_id) {
            return Err(HubError::WorkerNotFound {
                id: worker_id.to_string(),
            });
        }
        self.signal(HubSignal::TaskReport {
            worker_id: worker_id.to_string(),
            report,
        });
        Ok(())
    }

    // ── Introspection ───────────────────────────────────────────────

    pub async fn get(&self, worker_id: &str) -> Option<WorkerSnapshot> {
        self.workers.read().await.get(worker_id).map(|w| w.snapshot())
    }

    pub async fn is_connected(&self, worker_id: &str) -> bool {
        self.workers.read().await.contains_key(worker_id)
    }

    /// Connected worker that reported `spawned_id` in its handshake.
    pub async fn find_by_spawned_id(&self, spawned_id: &str) -> Option<String> {
        self.workers
            .read()
            .await
            .values()
            .find(|w| w.spawned_id() == Some(spawned_id))
            .map(|w| w.id.clone())
    }

    /// All connected workers, oldest connection first.
    pub async fn snapshot(&self) -> Vec<WorkerSnapshot> {
        let mut workers: Vec<WorkerSnapshot> =
            self.workers.read().await.values().map(|w| w.snapshot()).collect();
        workers.sort_by(|a, b| a.connected_at.cmp(&b.connected_at).then_with(|| a.id.cmp(&b.id)));
        workers
    }

    /// `(connected, busy)` worker counts.
    pub async fn counts(&self) -> (usize, usize) {
        let workers = self.workers.read().await;
        let busy = workers.values().filter(|w| !w.is_idle()).count();
        (workers.len(), busy)
    }

    /// Tell every worker to shut down and drop all connections.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.workers.read().await.keys().cloned().collect();
        info!(workers = ids.len(), "Hub shutting down");
        for worker_id in &ids {
            if let Err(e) = self.request_shutdown(worker_id, "hub shutting down").await {
                debug!(worker_id = %worker_id, error = %e, "Shutdown message not delivered");
            }
            self.remove_worker(worker_id, "hub shutdown").await;
        }
    }
}
