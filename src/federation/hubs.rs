//! Dispatch hubs: the built-in local hub plus federated external peers.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::FederationConfig;
use crate::error::FederationError;
use crate::events::{EventBroadcaster, EventKind};
use crate::store::QueueStore;

/// Id of the local hub when none is configured.
pub const BUILTIN_HUB_ID: &str = "builtin";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HubType {
    Builtin,
    External,
}

/// Derived health of a hub. Never set directly by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HubHealth {
    Healthy,
    Degraded,
    Unhealthy,
    Offline,
}

impl HubHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
            Self::Offline => "offline",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hub {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub hub_type: HubType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    pub priority: i32,
    pub weight: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub status: HubHealth,
    pub connected_workers: u32,
    pub active_workers: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_latency_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Hub {
    /// The local hub record. It is always healthy while the process runs.
    pub fn builtin(id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            name: "Local hub".to_string(),
            hub_type: HubType::Builtin,
            endpoint: None,
            priority: 0,
            weight: 100,
            region: None,
            labels: HashMap::new(),
            capabilities: Vec::new(),
            status: HubHealth::Healthy,
            connected_workers: 0,
            active_workers: 0,
            avg_latency_ms: None,
            error_rate: None,
            last_heartbeat: Some(now),
            created_at: now,
        }
    }

    pub fn is_builtin(&self) -> bool {
        self.hub_type == HubType::Builtin
    }
}

/// Administrative request to register an external hub.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateHubRequest {
    pub name: String,
    pub endpoint: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

fn default_weight() -> u32 {
    100
}

impl CreateHubRequest {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            priority: 0,
            weight: default_weight(),
            region: None,
            labels: HashMap::new(),
            capabilities: Vec::new(),
        }
    }
}

/// Status report pushed by an external hub.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubHeartbeat {
    #[serde(default)]
    pub latency_ms: Option<f64>,
    #[serde(default)]
    pub error_rate: Option<f64>,
    #[serde(default)]
    pub connected_workers: u32,
    #[serde(default)]
    pub active_workers: u32,
}

/// Health from heartbeat recency first, then reported latency and error rate.
pub fn derive_health(hub: &Hub, now: DateTime<Utc>, config: &FederationConfig) -> HubHealth {
    if hub.is_builtin() {
        return HubHealth::Healthy;
    }

    let Some(last) = hub.last_heartbeat else {
        return HubHealth::Offline;
    };
    let silent = (now - last).to_std().unwrap_or_default();
    if silent > config.hub_health_grace {
        return HubHealth::Offline;
    }

    let latency = hub.avg_latency_ms.unwrap_or(0.0);
    let errors = hub.error_rate.unwrap_or(0.0);
    if latency > config.unhealthy_latency_ms || errors > config.unhealthy_error_rate {
        HubHealth::Unhealthy
    } else if latency > config.degraded_latency_ms || errors > config.degraded_error_rate {
        HubHealth::Degraded
    } else {
        HubHealth::Healthy
    }
}

/// Registry of hubs backed by the queue store.
pub struct HubRegistry {
    store: Arc<dyn QueueStore>,
    events: EventBroadcaster,
    config: FederationConfig,
    local_id: String,
}

impl HubRegistry {
    pub fn new(
        store: Arc<dyn QueueStore>,
        events: EventBroadcaster,
        config: FederationConfig,
        local_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            events,
            config,
            local_id: local_id.into(),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Create the local hub record if the store doesn't have it yet.
    pub async fn ensure_builtin(&self) -> Result<Hub, FederationError> {
        if let Some(hub) = self.store.get_hub(&self.local_id).await? {
            return Ok(hub);
        }
        let hub = Hub::builtin(&self.local_id);
        self.store.insert_hub(&hub).await?;
        info!(hub_id = %hub.id, "Registered built-in hub");
        Ok(hub)
    }

    pub async fn create(&self, request: CreateHubRequest) -> Result<Hub, FederationError> {
        let name = request.name.trim();
        if name.is_empty() {
            return Err(FederationError::InvalidHub("name is required".into()));
        }
        let endpoint = request.endpoint.trim();
        if endpoint.is_empty() {
            return Err(FederationError::InvalidHub("endpoint is required".into()));
        }

        let hub = Hub {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            hub_type: HubType::External,
            endpoint: Some(endpoint.to_string()),
            priority: request.priority,
            weight: request.weight,
            region: request.region,
            labels: request.labels,
            capabilities: request.capabilities,
            // Offline until it first reports in.
            status: HubHealth::Offline,
            connected_workers: 0,
            active_workers: 0,
            avg_latency_ms: None,
            error_rate: None,
            last_heartbeat: None,
            created_at: Utc::now(),
        };
        self.store.insert_hub(&hub).await?;
        info!(hub_id = %hub.id, name = %hub.name, endpoint = %endpoint, "Registered external hub");
        Ok(hub)
    }

    pub async fn delete(&self, hub_id: &str) -> Result<(), FederationError> {
        let hub = self.require(hub_id).await?;
        if hub.is_builtin() {
            return Err(FederationError::BuiltinImmutable {
                action: "deleted".into(),
            });
        }
        self.store.delete_hub(hub_id).await?;
        info!(hub_id = %hub_id, "Removed external hub");
        Ok(())
    }

    /// Health on read is always derived from the current time.
    pub async fn get(&self, hub_id: &str) -> Result<Option<Hub>, FederationError> {
        let now = Utc::now();
        Ok(self
            .store
            .get_hub(hub_id)
            .await?
            .map(|hub| self.with_current_health(hub, now)))
    }

    /// All hubs, built-in first, then by priority descending and name.
    pub async fn list(&self) -> Result<Vec<Hub>, FederationError> {
        let now = Utc::now();
        let mut hubs: Vec<Hub> = self
            .store
            .list_hubs()
            .await?
            .into_iter()
            .map(|hub| self.with_current_health(hub, now))
            .collect();
        hubs.sort_by(|a, b| {
            b.is_builtin()
                .cmp(&a.is_builtin())
                .then_with(|| b.priority.cmp(&a.priority))
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(hubs)
    }

    /// Apply an external hub's status report and re-derive its health.
    pub async fn record_heartbeat(
        &self,
        hub_id: &str,
        report: HubHeartbeat,
    ) -> Result<Hub, FederationError> {
        let mut hub = self.require(hub_id).await?;
        if hub.is_builtin() {
            return Err(FederationError::BuiltinImmutable {
                action: "sent heartbeats".into(),
            });
        }

        let now = Utc::now();
        hub.last_heartbeat = Some(now);
        hub.avg_latency_ms = report.latency_ms;
        hub.error_rate = report.error_rate;
        hub.connected_workers = report.connected_workers;
        hub.active_workers = report.active_workers;

        let previous = hub.status;
        hub.status = derive_health(&hub, now, &self.config);
        self.store.update_hub(&hub).await?;
        debug!(hub_id = %hub_id, status = hub.status.as_str(), "Hub heartbeat");

        if previous != hub.status {
            self.emit_status(&hub, previous);
        }
        Ok(hub)
    }

    /// Refresh the built-in hub's counts from the live worker registry.
    pub async fn update_builtin(&self, connected: u32, active: u32) -> Result<(), FederationError> {
        let mut hub = self.ensure_builtin().await?;
        hub.connected_workers = connected;
        hub.active_workers = active;
        hub.last_heartbeat = Some(Utc::now());
        hub.status = HubHealth::Healthy;
        self.store.update_hub(&hub).await?;
        Ok(())
    }

    /// Re-derive health for every hub; returns how many changed.
    pub async fn refresh_health(&self) -> Result<usize, FederationError> {
        let now = Utc::now();
        let mut changed = 0;
        for mut hub in self.store.list_hubs().await? {
            let next = derive_health(&hub, now, &self.config);
            if next != hub.status {
                let previous = hub.status;
                hub.status = next;
                self.store.update_hub(&hub).await?;
                self.emit_status(&hub, previous);
                changed += 1;
            }
        }
        Ok(changed)
    }

    fn with_current_health(&self, mut hub: Hub, now: DateTime<Utc>) -> Hub {
        hub.status = derive_health(&hub, now, &self.config);
        hub
    }

    async fn require(&self, hub_id: &str) -> Result<Hub, FederationError> {
        self.store
            .get_hub(hub_id)
            .await?
            .ok_or_else(|| FederationError::NotFound {
                id: hub_id.to_string(),
            })
    }

    fn emit_status(&self, hub: &Hub, previous: HubHealth) {
        info!(
            hub_id = %hub.id,
            from = previous.as_str(),
            to = hub.status.as_str(),
            "Hub health changed"
        );
        self.events.emit(
            EventKind::HubStatus,
            serde_json::json!({
                "hubId": hub.id,
                "name": hub.name,
                "status": hub.status,
                "previous": previous,
                "connectedWorkers": hub.connected_workers,
                "activeWorkers": hub.active_workers,
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn registry() -> HubRegistry {
        HubRegistry::new(
            Arc::new(MemoryStore::new()),
            EventBroadcaster::default(),
            FederationConfig::default(),
            BUILTIN_HUB_ID,
        )
    }

    fn external(latency: Option<f64>, error_rate: Option<f64>, age_secs: i64) -> Hub {
        let mut hub = Hub::builtin("x");
        hub.hub_type = HubType::External;
        hub.avg_latency_ms = latency;
        hub.error_rate = error_rate;
        hub.last_heartbeat = Some(Utc::now() - chrono::Duration::seconds(age_secs));
        hub
    }

    #[test]
    fn health_is_derived_from_recency_then_thresholds() {
        let config = FederationConfig::default();
        let now = Utc::now();

        assert_eq!(derive_health(&external(Some(10.0), None, 1), now, &config), HubHealth::Healthy);
        assert_eq!(derive_health(&external(Some(800.0), None, 1), now, &config), HubHealth::Degraded);
        assert_eq!(
            derive_health(&external(Some(10.0), Some(0.5), 1), now, &config),
            HubHealth::Unhealthy
        );
        assert_eq!(derive_health(&external(Some(10.0), None, 600), now, &config), HubHealth::Offline);

        let mut never = external(None, None, 0);
        never.last_heartbeat = None;
        assert_eq!(derive_health(&never, now, &config), HubHealth::Offline);
    }

    #[tokio::test]
    async fn builtin_cannot_be_deleted() {
        let registry = registry();
        registry.ensure_builtin().await.unwrap();
        assert!(matches!(
            registry.delete(BUILTIN_HUB_ID).await,
            Err(FederationError::BuiltinImmutable { .. })
        ));
    }

    #[tokio::test]
    async fn external_hub_lifecycle() {
        let registry = registry();
        registry.ensure_builtin().await.unwrap();
        let mut rx = registry.events.subscribe();

        let hub = registry
            .create(CreateHubRequest::new("edge", "wss://edge.example/ws"))
            .await
            .unwrap();
        assert_eq!(hub.status, HubHealth::Offline);

        let hub = registry
            .record_heartbeat(
                &hub.id,
                HubHeartbeat {
                    latency_ms: Some(20.0),
                    connected_workers: 3,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(hub.status, HubHealth::Healthy);
        assert_eq!(hub.connected_workers, 3);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::HubStatus);
        assert_eq!(event.data["status"], "healthy");

        let hubs = registry.list().await.unwrap();
        assert_eq!(hubs.len(), 2);
        assert!(hubs[0].is_builtin());

        registry.delete(&hub.id).await.unwrap();
        assert!(registry.get(&hub.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn silent_hub_reads_offline_before_the_sweep() {
        let registry = HubRegistry::new(
            Arc::new(MemoryStore::new()),
            EventBroadcaster::default(),
            FederationConfig {
                hub_health_grace: std::time::Duration::from_millis(50),
                ..Default::default()
            },
            BUILTIN_HUB_ID,
        );
        let hub = registry
            .create(CreateHubRequest::new("edge", "wss://edge.example/ws"))
            .await
            .unwrap();
        let hub = registry
            .record_heartbeat(&hub.id, HubHeartbeat::default())
            .await
            .unwrap();
        assert_eq!(hub.status, HubHealth::Healthy);

        tokio::time::sleep(std::time::Duration::from_millis(150)).await;

        let read = registry.get(&hub.id).await.unwrap().unwrap();
        assert_eq!(read.status, HubHealth::Offline);
        let listed = registry.list().await.unwrap();
        assert_eq!(listed[0].status, HubHealth::Offline);
    }

    #[tokio::test]
    async fn create_requires_name_and_endpoint() {
        let registry = registry();
        assert!(registry.create(CreateHubRequest::new("", "wss://x")).await.is_err());
        assert!(registry.create(CreateHubRequest::new("edge", " ")).await.is_err());
    }
}
