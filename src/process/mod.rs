//! Worker process manager: launches local worker programs and tracks their lifecycle.
//!
//! Each child is told where the hub lives and which spawn id it carries; the hub
//! reports the registration back (`on_worker_registered`) and the process flips to
//! `running`. Termination of a busy worker is deferred through the hub's
//! termination state and completed from `complete_termination`.

pub mod model;

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use secrecy::ExposeSecret;
use tokio::process::{Child, Command};
use tokio::sync::{RwLock, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use model::{ProcessStatus, SpawnConfig, SpawnedWorkerProcess};

use crate::config::ProcessConfig;
use crate::error::{HubError, SpawnError};
use crate::events::{EventBroadcaster, EventKind};
use crate::hub::{TerminationDecision, WorkerHub};

struct ManagedProcess {
    info: SpawnedWorkerProcess,
    /// Asks the monitor to stop the child within the given grace period.
    stop: Option<oneshot::Sender<Duration>>,
    monitor: Option<JoinHandle<()>>,
}

type ProcessTable = Arc<RwLock<HashMap<String, ManagedProcess>>>;

pub struct WorkerProcessManager {
    config: ProcessConfig,
    hub: Arc<WorkerHub>,
    events: EventBroadcaster,
    processes: ProcessTable,
}

impl WorkerProcessManager {
    pub fn new(config: ProcessConfig, hub: Arc<WorkerHub>, events: EventBroadcaster) -> Self {
        Self {
            config,
            hub,
            events,
            processes: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn resolve_command(&self) -> Result<PathBuf, SpawnError> {
        let command = self
            .config
            .worker_command
            .as_deref()
            .ok_or_else(|| SpawnError::RuntimeUnavailable("no worker command configured".into()))?;
        which::which(command)
            .map_err(|e| SpawnError::RuntimeUnavailable(format!("{command}: {e}")))
    }

    /// A worker runtime is installed and the process cap has room.
    pub async fn can_spawn_workers(&self) -> bool {
        if self.resolve_command().is_err() {
            return false;
        }
        self.active_count().await < self.config.max_workers
    }

    pub async fn active_count(&self) -> usize {
        self.processes
            .read()
            .await
            .values()
            .filter(|p| p.info.status.is_active())
            .count()
    }

    /// Launch a worker process that connects back to this hub.
    ///
    /// Rejected synchronously when no runtime is available or the cap is reached;
    /// nothing is recorded in that case.
    pub async fn spawn(&self, spawn: SpawnConfig) -> Result<SpawnedWorkerProcess, SpawnError> {
        let program = self.resolve_command()?;

        let mut processes = self.processes.write().await;
        let current = processes.values().filter(|p| p.info.status.is_active()).count();
        if current >= self.config.max_workers {
            return Err(SpawnError::CapacityReached {
                current,
                max: self.config.max_workers,
            });
        }

        let id = Uuid::new_v4().to_string();
        let capabilities = if spawn.capabilities.is_empty() {
            &self.config.worker_capabilities
        } else {
            &spawn.capabilities
        };

        let mut command = Command::new(&program);
        command
            .args(&self.config.worker_args)
            .env("ORCH_HUB_URL", &self.config.hub_url)
            .env("ORCH_SPAWNED_ID", &id)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(provider) = &spawn.provider {
            command.env("ORCH_WORKER_PROVIDER", provider);
        }
        if !capabilities.is_empty() {
            command.env("ORCH_WORKER_CAPABILITIES", capabilities.join(","));
        }
        if let Some(secret) = &self.hub.config().auth_token {
            command.env("ORCH_WORKER_TOKEN", secret.expose_secret());
        }

        let child = command.spawn()?;
        let pid = child.id();

        let info = SpawnedWorkerProcess {
            id: id.clone(),
            pid,
            provider: spawn.provider.clone(),
            status: ProcessStatus::Starting,
            spawned_at: Utc::now(),
            connected_worker_id: None,
            pending_termination: false,
            exit_code: None,
            exited_at: None,
        };

        let (stop_tx, stop_rx) = oneshot::channel();
        let monitor = tokio::spawn(monitor(
            id.clone(),
            child,
            stop_rx,
            self.processes.clone(),
            self.hub.clone(),
            self.events.clone(),
        ));
        processes.insert(
            id.clone(),
            ManagedProcess {
                info: info.clone(),
                stop: Some(stop_tx),
                monitor: Some(monitor),
            },
        );
        drop(processes);

        self.watch_startup(id.clone());

        info!(
            spawned_id = %id,
            pid = ?pid,
            provider = ?spawn.provider,
            program = %program.display(),
            "Worker process spawned"
        );
        self.events.emit(
            EventKind::WorkerSpawned,
            serde_json::json!({
                "spawnedId": id,
                "pid": pid,
                "provider": spawn.provider,
            }),
        );
        Ok(info)
    }

    /// Log a process that never completed its hub handshake.
    fn watch_startup(&self, id: String) {
        let processes = self.processes.clone();
        let timeout = self.config.startup_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let guard = processes.read().await;
            if let Some(p) = guard.get(&id) {
                if p.info.status == ProcessStatus::Starting {
                    warn!(
                        spawned_id = %id,
                        pid = ?p.info.pid,
                        timeout_secs = timeout.as_secs(),
                        "Worker process has not registered with the hub"
                    );
                }
            }
        });
    }

    /// Spawn `auto_spawn_count` workers, cycling through the provider list.
    /// Individual failures are logged and skipped.
    pub async fn auto_spawn(&self) -> Vec<SpawnedWorkerProcess> {
        let count = self.config.auto_spawn_count;
        let providers = &self.config.auto_spawn_providers;
        let mut spawned = Vec::with_capacity(count);

        for i in 0..count {
            let spawn = SpawnConfig {
                provider: (!providers.is_empty()).then(|| providers[i % providers.len()].clone()),
                capabilities: Vec::new(),
            };
            match self.spawn(spawn).await {
                Ok(process) => spawned.push(process),
                Err(e) => warn!(attempt = i + 1, of = count, error = %e, "Auto-spawn failed"),
            }
        }
        if count > 0 {
            info!(spawned = spawned.len(), requested = count, "Auto-spawn complete");
        }
        spawned
    }

    // ── Hub notifications ───────────────────────────────────────────

    /// A connected worker reported `spawned_id` in its handshake.
    pub async fn on_worker_registered(&self, spawned_id: &str, worker_id: &str) -> bool {
        let mut processes = self.processes.write().await;
        let Some(p) = processes.get_mut(spawned_id) else {
            debug!(spawned_id = %spawned_id, "Registration for an unknown spawned id");
            return false;
        };
        p.info.connected_worker_id = Some(worker_id.to_string());
        if p.info.status == ProcessStatus::Starting {
            p.info.status = ProcessStatus::Running;
            info!(spawned_id = %spawned_id, worker_id = %worker_id, "Worker process running");
        }
        true
    }

    /// The child's hub connection went away. The process itself may still be alive.
    pub async fn on_worker_disconnected(&self, spawned_id: &str) {
        if let Some(p) = self.processes.write().await.get_mut(spawned_id) {
            p.info.connected_worker_id = None;
        }
    }

    // ── Termination ─────────────────────────────────────────────────

    /// Stop a spawned worker. A busy worker finishes its task first.
    pub async fn terminate(&self, id: &str) -> Result<TerminationDecision, SpawnError> {
        let (status, worker_id) = {
            let processes = self.processes.read().await;
            let p = processes.get(id).ok_or_else(|| SpawnError::NotFound { id: id.to_string() })?;
            (p.info.status, p.info.connected_worker_id.clone())
        };
        if !status.is_active() || status == ProcessStatus::Stopping {
            return Ok(TerminationDecision::AlreadyTerminating);
        }

        let decision = match worker_id.as_deref() {
            Some(worker_id) => match self.hub.request_termination(worker_id).await {
                Ok(decision) => decision,
                Err(HubError::WorkerNotFound { .. }) => TerminationDecision::Immediate,
                Err(e) => {
                    warn!(spawned_id = %id, error = %e, "Termination request failed; stopping now");
                    TerminationDecision::Immediate
                }
            },
            None => TerminationDecision::Immediate,
        };

        match decision {
            TerminationDecision::Immediate => self.stop(id, self.config.shutdown_grace).await,
            TerminationDecision::Deferred => {
                if let Some(p) = self.processes.write().await.get_mut(id) {
                    p.info.pending_termination = true;
                }
                info!(spawned_id = %id, "Termination deferred until the current task finishes");
            }
            TerminationDecision::AlreadyTerminating => {}
        }
        Ok(decision)
    }

    /// The hub reports the worker behind `spawned_id` went idle with a pending
    /// termination. Stops the process once.
    pub async fn complete_termination(&self, spawned_id: &str) -> bool {
        let pending = {
            let mut processes = self.processes.write().await;
            match processes.get_mut(spawned_id) {
                Some(p) if p.info.pending_termination => {
                    p.info.pending_termination = false;
                    true
                }
                _ => false,
            }
        };
        if pending {
            info!(spawned_id = %spawned_id, "Completing deferred termination");
            self.stop(spawned_id, self.config.shutdown_grace).await;
        }
        pending
    }

    /// Stop every active process without deferral and wait for them to exit.
    pub async fn terminate_all(&self) {
        let ids: Vec<String> = self
            .processes
            .read()
            .await
            .iter()
            .filter(|(_, p)| p.info.status.is_active())
            .map(|(id, _)| id.clone())
            .collect();
        if ids.is_empty() {
            return;
        }
        info!(count = ids.len(), "Terminating all worker processes");

        for id in &ids {
            self.stop(id, self.config.shutdown_grace).await;
        }

        let monitors: Vec<JoinHandle<()>> = {
            let mut processes = self.processes.write().await;
            ids.iter()
                .filter_map(|id| processes.get_mut(id).and_then(|p| p.monitor.take()))
                .collect()
        };
        let bound = self.config.shutdown_grace + Duration::from_secs(5);
        if tokio::time::timeout(bound, futures::future::join_all(monitors))
            .await
            .is_err()
        {
            warn!("Worker processes did not exit within the shutdown bound");
        }
    }

    /// Move to `stopping`, ask the worker to shut down, and arm the monitor's kill timer.
    async fn stop(&self, id: &str, grace: Duration) {
        let (stop, worker_id) = {
            let mut processes = self.processes.write().await;
            let Some(p) = processes.get_mut(id) else {
                return;
            };
            if !p.info.status.is_active() {
                return;
            }
            p.info.status = ProcessStatus::Stopping;
            p.info.pending_termination = false;
            (p.stop.take(), p.info.connected_worker_id.clone())
        };

        if let Some(worker_id) = worker_id {
            if let Err(e) = self.hub.request_shutdown(&worker_id, "terminated").await {
                debug!(spawned_id = %id, error = %e, "Shutdown message not delivered");
            }
        }
        if let Some(stop) = stop {
            let _ = stop.send(grace);
        }
        info!(spawned_id = %id, grace_secs = grace.as_secs(), "Stopping worker process");
    }

    // ── Introspection ───────────────────────────────────────────────

    pub async fn get(&self, id: &str) -> Option<SpawnedWorkerProcess> {
        self.processes.read().await.get(id).map(|p| p.info.clone())
    }

    /// All spawned processes, oldest first.
    pub async fn list(&self) -> Vec<SpawnedWorkerProcess> {
        let mut list: Vec<SpawnedWorkerProcess> = self
            .processes
            .read()
            .await
            .values()
            .map(|p| p.info.clone())
            .collect();
        list.sort_by(|a, b| a.spawned_at.cmp(&b.spawned_at));
        list
    }
}

/// Wait for the child to exit, or stop it on request: give it `grace` to exit
/// after the shutdown message, then kill.
async fn monitor(
    id: String,
    mut child: Child,
    mut stop: oneshot::Receiver<Duration>,
    processes: ProcessTable,
    hub: Arc<WorkerHub>,
    events: EventBroadcaster,
) {
    let exit = tokio::select! {
        status = child.wait() => status,
        Ok(grace) = &mut stop => {
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    debug!(spawned_id = %id, "Grace period elapsed; killing worker process");
                    if let Err(e) = child.start_kill() {
                        warn!(spawned_id = %id, error = %e, "Failed to kill worker process");
                    }
                    child.wait().await
                }
            }
        }
    };

    let exit_code = match &exit {
        Ok(status) => status.code(),
        Err(e) => {
            warn!(spawned_id = %id, error = %e, "Failed to wait on worker process");
            None
        }
    };

    let (status, pid, worker_id) = {
        let mut processes = processes.write().await;
        let Some(p) = processes.get_mut(&id) else {
            return;
        };
        p.info.status = if p.info.status == ProcessStatus::Stopping {
            ProcessStatus::Stopped
        } else {
            ProcessStatus::Crashed
        };
        p.info.exit_code = exit_code;
        p.info.exited_at = Some(Utc::now());
        p.info.pending_termination = false;
        p.stop = None;
        (p.info.status, p.info.pid, p.info.connected_worker_id.take())
    };

    if status == ProcessStatus::Crashed {
        warn!(spawned_id = %id, pid = ?pid, exit_code = ?exit_code, "Worker process crashed");
        // The connection may outlive the process briefly; drop it so its task is released.
        if let Some(worker_id) = worker_id {
            hub.remove_worker(&worker_id, "worker process crashed").await;
        }
    } else {
        info!(spawned_id = %id, pid = ?pid, exit_code = ?exit_code, "Worker process stopped");
    }

    events.emit(
        EventKind::WorkerExited,
        serde_json::json!({
            "spawnedId": id,
            "pid": pid,
            "exitCode": exit_code,
            "status": status,
        }),
    );
}
