//! Orchestrator: builds every component, routes hub signals, runs the sweeps.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::{Json, Router, response::IntoResponse, routing::get};
use chrono::Utc;
use secrecy::SecretString;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use crate::api::{ApiState, api_routes};
use crate::config::OrchestratorConfig;
use crate::dispatcher::{FailureCause, TaskDispatcher};
use crate::error::{DispatchError, Result};
use crate::events::ws::{DashboardState, dashboard_routes};
use crate::events::EventBroadcaster;
use crate::federation::{HubRegistry, TokenRegistry};
use crate::hub::{HubSignal, TaskReport, WorkerHub, worker_routes};
use crate::process::{ProcessStatus, WorkerProcessManager};
use crate::store::QueueStore;

/// Routes [`HubSignal`]s to the dispatcher and the process manager.
#[derive(Clone)]
pub struct SignalRouter {
    hub: Arc<WorkerHub>,
    dispatcher: Arc<TaskDispatcher>,
    processes: Arc<WorkerProcessManager>,
}

impl SignalRouter {
    pub async fn route(&self, signal: HubSignal) {
        match signal {
            HubSignal::WorkerConnected {
                worker_id,
                spawned_id,
                ..
            } => {
                if let Some(spawned_id) = spawned_id {
                    self.processes
                        .on_worker_registered(&spawned_id, &worker_id)
                        .await;
                }
                self.dispatch().await;
            }

            HubSignal::WorkerIdle { .. } => self.dispatch().await,

            HubSignal::WorkerDisconnected {
                worker_id,
                spawned_id,
                held_task,
                reason,
            } => {
                let crashed = match spawned_id.as_deref() {
                    Some(id) => {
                        self.processes.on_worker_disconnected(id).await;
                        self.processes
                            .get(id)
                            .await
                            .is_some_and(|p| p.status == ProcessStatus::Crashed)
                    }
                    None => false,
                };
                if let Some(task_id) = held_task {
                    let cause = if crashed {
                        FailureCause::Crashed
                    } else {
                        FailureCause::WorkerLost
                    };
                    debug!(worker_id = %worker_id, task_id = %task_id, reason = %reason, "Releasing task of departed worker");
                    if let Err(e) = self
                        .dispatcher
                        .release_worker_task(&worker_id, &task_id, cause)
                        .await
                    {
                        warn!(worker_id = %worker_id, task_id = %task_id, error = %e, "Failed to release task");
                    }
                    self.dispatch().await;
                }
            }

            HubSignal::ReadyForTermination {
                worker_id,
                spawned_id,
            } => match spawned_id {
                Some(spawned_id) => {
                    self.processes.complete_termination(&spawned_id).await;
                }
                None => {
                    if let Err(e) = self.hub.request_shutdown(&worker_id, "terminated").await {
                        debug!(worker_id = %worker_id, error = %e, "Shutdown message not delivered");
                    }
                }
            },

            HubSignal::TaskReport { worker_id, report } => {
                self.route_report(&worker_id, report).await
            }
        }
    }

    async fn route_report(&self, worker_id: &str, report: TaskReport) {
        let task_id = report.task_id().to_string();
        let result = match report {
            TaskReport::Started { task_id } => {
                self.dispatcher.mark_processing(&task_id, worker_id).await
            }
            TaskReport::Progress {
                task_id,
                progress,
                message,
            } => {
                self.dispatcher
                    .report_progress(&task_id, worker_id, progress, message)
                    .await
            }
            TaskReport::Complete { task_id, result } => {
                self.dispatcher.complete(&task_id, worker_id, result).await
            }
            TaskReport::Error { task_id, error } => {
                self.dispatcher.fail(&task_id, worker_id, &error).await
            }
        };

        match result {
            Ok(_) => {}
            Err(DispatchError::NotFound { .. }) => {
                warn!(worker_id = %worker_id, task_id = %task_id, "Report for an unknown task");
            }
            Err(e) => {
                warn!(worker_id = %worker_id, task_id = %task_id, error = %e, "Task report not applied");
            }
        }
    }

    async fn dispatch(&self) {
        if let Err(e) = self.dispatcher.dispatch_pending().await {
            warn!(error = %e, "Dispatch cycle failed");
        }
    }
}

/// Owns the orchestration core.
pub struct Orchestrator {
    config: OrchestratorConfig,
    events: EventBroadcaster,
    hubs: Arc<HubRegistry>,
    hub: Arc<WorkerHub>,
    dispatcher: Arc<TaskDispatcher>,
    processes: Arc<WorkerProcessManager>,
    dashboard_token: Option<Arc<SecretString>>,
    admin_token: Option<Arc<SecretString>>,
    signals: Mutex<Option<mpsc::UnboundedReceiver<HubSignal>>>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(mut config: OrchestratorConfig, store: Arc<dyn QueueStore>) -> Self {
        let events = EventBroadcaster::default();
        let tokens = Arc::new(TokenRegistry::new(store.clone(), events.clone()));
        let hubs = Arc::new(HubRegistry::new(
            store.clone(),
            events.clone(),
            config.federation.clone(),
            config.hub.hub_id.clone(),
        ));
        // The admin surface falls back to the dashboard credential, then to the
        // hub's shared secret.
        let admin_token = config
            .hub
            .admin_token
            .take()
            .or_else(|| config.hub.dashboard_token.clone())
            .or_else(|| config.hub.auth_token.clone())
            .map(Arc::new);
        let dashboard_token = config.hub.dashboard_token.take().map(Arc::new);

        let (hub, signals) = WorkerHub::new(config.hub.clone(), events.clone(), tokens);
        let hub = Arc::new(hub);
        let dispatcher = Arc::new(TaskDispatcher::new(
            store,
            hub.clone(),
            events.clone(),
            config.dispatcher.clone(),
        ));
        let processes = Arc::new(WorkerProcessManager::new(
            config.process.clone(),
            hub.clone(),
            events.clone(),
        ));

        Self {
            config,
            events,
            hubs,
            hub,
            dispatcher,
            processes,
            dashboard_token,
            admin_token,
            signals: Mutex::new(Some(signals)),
            background: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBroadcaster {
        &self.events
    }

    pub fn hub(&self) -> &Arc<WorkerHub> {
        &self.hub
    }

    pub fn hubs(&self) -> &Arc<HubRegistry> {
        &self.hubs
    }

    pub fn tokens(&self) -> &Arc<TokenRegistry> {
        self.hub.tokens()
    }

    pub fn dispatcher(&self) -> &Arc<TaskDispatcher> {
        &self.dispatcher
    }

    pub fn processes(&self) -> &Arc<WorkerProcessManager> {
        &self.processes
    }

    pub fn signal_router(&self) -> SignalRouter {
        SignalRouter {
            hub: self.hub.clone(),
            dispatcher: self.dispatcher.clone(),
            processes: self.processes.clone(),
        }
    }

    /// Load persisted state, start routing hub signals, and start the sweeps.
    pub async fn start(&self) -> Result<()> {
        let Some(mut signals) = self.signals.lock().await.take() else {
            warn!("Orchestrator already started");
            return Ok(());
        };

        let tokens = self.tokens().load().await?;
        self.hubs.ensure_builtin().await?;
        info!(hub_id = %self.hub.hub_id(), tokens, "Orchestrator starting");

        let mut background = self.background.lock().await;

        let router = self.signal_router();
        background.push(tokio::spawn(async move {
            while let Some(signal) = signals.recv().await {
                router.route(signal).await;
            }
            debug!("Hub signal channel closed");
        }));

        let dispatcher = self.dispatcher.clone();
        background.push(every(self.config.dispatcher.timeout_check_interval, move || {
            let dispatcher = dispatcher.clone();
            async move {
                match dispatcher.check_timeouts().await {
                    Ok(0) => {}
                    Ok(released) => info!(released, "Timeout sweep released tasks"),
                    Err(e) => warn!(error = %e, "Timeout sweep failed"),
                }
            }
        }));

        let dispatcher = self.dispatcher.clone();
        background.push(every(self.config.dispatcher.dispatch_interval, move || {
            let dispatcher = dispatcher.clone();
            async move {
                if let Err(e) = dispatcher.dispatch_pending().await {
                    warn!(error = %e, "Dispatch cycle failed");
                }
            }
        }));

        let hub = self.hub.clone();
        background.push(every(self.config.hub.heartbeat_check_interval, move || {
            let hub = hub.clone();
            async move {
                hub.sweep_heartbeats(Utc::now()).await;
            }
        }));

        let (hub, hubs) = (self.hub.clone(), self.hubs.clone());
        background.push(every(self.config.federation.hub_health_interval, move || {
            let (hub, hubs) = (hub.clone(), hubs.clone());
            async move {
                let (connected, busy) = hub.counts().await;
                if let Err(e) = hubs.update_builtin(connected as u32, busy as u32).await {
                    warn!(error = %e, "Failed to refresh built-in hub");
                }
                if let Err(e) = hubs.refresh_health().await {
                    warn!(error = %e, "Hub health sweep failed");
                }
            }
        }));

        let dispatcher = self.dispatcher.clone();
        background.push(every(self.config.dispatcher.cleanup_interval, move || {
            let dispatcher = dispatcher.clone();
            async move {
                if let Err(e) = dispatcher.cleanup_finished().await {
                    warn!(error = %e, "Cleanup sweep failed");
                }
            }
        }));

        Ok(())
    }

    /// Stop the sweeps, stop every spawned worker, and close all connections.
    pub async fn stop(&self) {
        info!("Orchestrator stopping");
        for handle in self.background.lock().await.drain(..) {
            handle.abort();
        }
        self.processes.terminate_all().await;
        self.hub.shutdown().await;
    }

    /// Every HTTP and WebSocket route the orchestrator serves.
    pub fn router(&self) -> Router {
        let api = ApiState {
            dispatcher: self.dispatcher.clone(),
            hub: self.hub.clone(),
            hubs: self.hubs.clone(),
            processes: self.processes.clone(),
            admin_token: self.admin_token.clone(),
        };
        let dashboard = DashboardState {
            events: self.events.clone(),
            token: self.dashboard_token.clone(),
        };

        Router::new()
            .route("/health", get(health))
            .merge(worker_routes(self.hub.clone(), self.events.clone()))
            .merge(dashboard_routes(dashboard))
            .merge(api_routes(api))
            .layer(CorsLayer::permissive())
    }
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "worker-orchestrator"
    }))
}

/// Run `tick` every `period`, starting one period from now.
fn every<F, Fut>(period: Duration, mut tick: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period.max(Duration::from_millis(10)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;
        loop {
            interval.tick().await;
            tick().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{ExponentialBackoff, Task, TaskRequest, TaskStatus, TaskType};
    use crate::federation::ScopeDecision;
    use crate::hub::{ServerMessage, WorkerMetadata};
    use crate::store::MemoryStore;

    fn orchestrator() -> Orchestrator {
        let mut config = OrchestratorConfig::default();
        config.dispatcher.backoff = ExponentialBackoff {
            first: Duration::ZERO,
            max: Duration::ZERO,
            factor: 1.0,
        };
        Orchestrator::new(config, Arc::new(MemoryStore::new()))
    }

    async fn connect(
        o: &Orchestrator,
        caps: &[&str],
    ) -> (String, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(16);
        let (id, _) = o
            .hub()
            .register(
                ScopeDecision::unrestricted(),
                caps.iter().map(|c| c.to_string()).collect(),
                WorkerMetadata::default(),
                tx,
            )
            .await;
        (id, rx)
    }

    async fn wait_for(o: &Orchestrator, task_id: &str, done: impl Fn(&Task) -> bool) -> Task {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let task = o.dispatcher().get(task_id).await.unwrap().unwrap();
                if done(&task) {
                    return task;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("task did not reach expected state")
    }

    #[tokio::test]
    async fn worker_reports_drive_task_to_completion() {
        let o = orchestrator();
        o.start().await.unwrap();
        let (worker, mut rx) = connect(&o, &["summarize"]).await;

        let task = o
            .dispatcher()
            .submit(TaskRequest::new(TaskType::Summarize))
            .await
            .unwrap();
        match rx.recv().await {
            Some(ServerMessage::TaskAssign { task: assigned }) => assert_eq!(assigned.id, task.id),
            other => panic!("Expected task:assign, got {other:?}"),
        }

        o.hub()
            .report(&worker, TaskReport::Started { task_id: task.id.clone() })
            .await
            .unwrap();
        wait_for(&o, &task.id, |t| t.status == TaskStatus::Processing).await;

        o.hub()
            .report(
                &worker,
                TaskReport::Complete {
                    task_id: task.id.clone(),
                    result: serde_json::json!({"ok": true}),
                },
            )
            .await
            .unwrap();
        let done = wait_for(&o, &task.id, |t| t.status == TaskStatus::Completed).await;
        assert_eq!(done.result, Some(serde_json::json!({"ok": true})));
        o.stop().await;
    }

    #[tokio::test]
    async fn disconnected_workers_task_moves_to_another_worker() {
        let o = orchestrator();
        o.start().await.unwrap();
        let (first, _rx1) = connect(&o, &["embedding"]).await;

        let task = o
            .dispatcher()
            .submit(TaskRequest::new(TaskType::Embedding))
            .await
            .unwrap();
        assert_eq!(
            o.dispatcher().get(&task.id).await.unwrap().unwrap().assigned_worker_id,
            Some(first.clone())
        );

        let (second, _rx2) = connect(&o, &["embedding"]).await;
        o.hub().remove_worker(&first, "connection closed").await;

        let reassigned = wait_for(&o, &task.id, |t| {
            t.assigned_worker_id.as_deref() == Some(second.as_str())
        })
        .await;
        assert_eq!(reassigned.status, TaskStatus::Assigned);
        assert_eq!(reassigned.retry_count, 1);
        o.stop().await;
    }

    #[tokio::test]
    async fn start_registers_builtin_hub() {
        let o = orchestrator();
        o.start().await.unwrap();
        let hubs = o.hubs().list().await.unwrap();
        assert_eq!(hubs.len(), 1);
        assert!(hubs[0].is_builtin());
        // A second start is a no-op.
        o.start().await.unwrap();
        o.stop().await;
    }
}
