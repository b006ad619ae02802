//! Configuration types.
//!
//! Every section has a `Default` and a `from_env()` constructor reading `ORCH_*`
//! variables. Absent or unparseable values fall back to the defaults.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::dispatcher::TaskType;
use crate::dispatcher::retry::ExponentialBackoff;
use crate::error::ConfigError;

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, Default)]
pub struct OrchestratorConfig {
    pub server: ServerConfig,
    pub hub: HubConfig,
    pub dispatcher: DispatcherConfig,
    pub process: ProcessConfig,
    pub federation: FederationConfig,
    pub database: DatabaseConfig,
}

impl OrchestratorConfig {
    /// Load every section from the environment.
    pub fn from_env() -> Self {
        Self {
            server: ServerConfig::from_env(),
            hub: HubConfig::from_env(),
            dispatcher: DispatcherConfig::from_env(),
            process: ProcessConfig::from_env(),
            federation: FederationConfig::from_env(),
            database: DatabaseConfig::from_env(),
        }
    }

    /// Reject combinations the components cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hub.hub_id.trim().is_empty() {
            return Err(invalid("ORCH_HUB_ID", "must not be empty"));
        }
        if self.hub.outbound_buffer == 0 {
            return Err(invalid("ORCH_OUTBOUND_BUFFER", "must be at least 1"));
        }
        if self.dispatcher.backoff.factor < 1.0 {
            return Err(invalid("ORCH_BACKOFF_FACTOR", "must be at least 1.0"));
        }
        if self.dispatcher.backoff.first > self.dispatcher.backoff.max {
            return Err(invalid(
                "ORCH_BACKOFF_FIRST_SECS",
                "must not exceed ORCH_BACKOFF_MAX_SECS",
            ));
        }
        if self.process.auto_spawn_count > self.process.max_workers {
            return Err(invalid(
                "ORCH_AUTO_SPAWN",
                format!("exceeds ORCH_MAX_WORKERS ({})", self.process.max_workers),
            ));
        }
        let f = &self.federation;
        if f.degraded_latency_ms > f.unhealthy_latency_ms {
            return Err(invalid(
                "ORCH_HUB_DEGRADED_LATENCY_MS",
                "must not exceed the unhealthy threshold",
            ));
        }
        if f.degraded_error_rate > f.unhealthy_error_rate {
            return Err(invalid(
                "ORCH_HUB_DEGRADED_ERROR_RATE",
                "must not exceed the unhealthy threshold",
            ));
        }
        Ok(())
    }
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}

/// HTTP/WebSocket listener settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 37780,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind: std::env::var("ORCH_BIND").unwrap_or(defaults.bind),
            port: env_parse("ORCH_PORT").unwrap_or(defaults.port),
        }
    }

    /// `bind:port` socket address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// Worker hub settings.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Identity of this hub in the federation (group-scoped tokens match against it).
    pub hub_id: String,
    /// Shared secret accepted from locally spawned workers (instance scope).
    pub auth_token: Option<SecretString>,
    /// Credential required from dashboard subscribers, if any.
    pub dashboard_token: Option<SecretString>,
    /// Bearer credential for `/api/*`. Unset falls back to the dashboard
    /// credential, then the shared secret.
    pub admin_token: Option<SecretString>,
    /// Accept workers that present no credential at all.
    pub allow_anonymous: bool,
    /// A worker silent for longer than this is treated as disconnected.
    pub heartbeat_grace: Duration,
    /// How often the liveness sweep runs.
    pub heartbeat_check_interval: Duration,
    /// Per-connection outbound message buffer.
    pub outbound_buffer: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            hub_id: crate::federation::BUILTIN_HUB_ID.to_string(),
            auth_token: None,
            dashboard_token: None,
            admin_token: None,
            allow_anonymous: true,
            heartbeat_grace: Duration::from_secs(90),
            heartbeat_check_interval: Duration::from_secs(15),
            outbound_buffer: 64,
        }
    }
}

impl HubConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let auth_token = env_secret("ORCH_HUB_TOKEN");
        // Anonymous workers are only admitted when no shared secret is configured,
        // unless explicitly overridden.
        let allow_anonymous =
            env_parse::<bool>("ORCH_ALLOW_ANONYMOUS").unwrap_or(auth_token.is_none());

        Self {
            hub_id: std::env::var("ORCH_HUB_ID").unwrap_or(defaults.hub_id),
            auth_token,
            dashboard_token: env_secret("ORCH_DASHBOARD_TOKEN"),
            admin_token: env_secret("ORCH_ADMIN_TOKEN"),
            allow_anonymous,
            heartbeat_grace: env_secs("ORCH_HEARTBEAT_GRACE_SECS")
                .unwrap_or(defaults.heartbeat_grace),
            heartbeat_check_interval: env_secs("ORCH_HEARTBEAT_CHECK_SECS")
                .unwrap_or(defaults.heartbeat_check_interval),
            outbound_buffer: env_parse("ORCH_OUTBOUND_BUFFER").unwrap_or(defaults.outbound_buffer),
        }
    }
}

/// Task dispatcher settings.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Retries granted to tasks submitted without an explicit `maxRetries`.
    pub default_max_retries: u32,
    /// Processing window applied to task types without an override.
    pub task_timeout: Duration,
    /// Per-type processing window overrides.
    pub task_timeouts: HashMap<TaskType, Duration>,
    pub timeout_check_interval: Duration,
    /// How often pending tasks are re-offered, so retries leave their backoff.
    pub dispatch_interval: Duration,
    pub backoff: ExponentialBackoff,
    /// Terminal tasks older than this are purged by the cleanup sweep.
    pub completed_retention: Duration,
    pub cleanup_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            default_max_retries: 3,
            task_timeout: Duration::from_secs(300),
            task_timeouts: HashMap::new(),
            timeout_check_interval: Duration::from_secs(30),
            dispatch_interval: Duration::from_secs(5),
            backoff: ExponentialBackoff::default(),
            completed_retention: Duration::from_secs(24 * 3600),
            cleanup_interval: Duration::from_secs(3600),
        }
    }
}

impl DispatcherConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let mut task_timeouts = HashMap::new();
        for task_type in TaskType::ALL {
            let key = format!("ORCH_TASK_TIMEOUT_{}", task_type.as_str().to_uppercase());
            if let Some(timeout) = env_secs(&key) {
                task_timeouts.insert(task_type, timeout);
            }
        }

        let backoff = ExponentialBackoff {
            first: env_secs("ORCH_BACKOFF_FIRST_SECS").unwrap_or(defaults.backoff.first),
            max: env_secs("ORCH_BACKOFF_MAX_SECS").unwrap_or(defaults.backoff.max),
            factor: env_parse("ORCH_BACKOFF_FACTOR").unwrap_or(defaults.backoff.factor),
        };

        Self {
            default_max_retries: env_parse("ORCH_MAX_RETRIES")
                .unwrap_or(defaults.default_max_retries),
            task_timeout: env_secs("ORCH_TASK_TIMEOUT_SECS").unwrap_or(defaults.task_timeout),
            task_timeouts,
            timeout_check_interval: env_secs("ORCH_TIMEOUT_CHECK_SECS")
                .unwrap_or(defaults.timeout_check_interval),
            dispatch_interval: env_secs("ORCH_DISPATCH_INTERVAL_SECS")
                .unwrap_or(defaults.dispatch_interval),
            backoff,
            completed_retention: env_secs("ORCH_COMPLETED_RETENTION_SECS")
                .unwrap_or(defaults.completed_retention),
            cleanup_interval: env_secs("ORCH_CLEANUP_INTERVAL_SECS")
                .unwrap_or(defaults.cleanup_interval),
        }
    }

    /// Processing window for a task type.
    pub fn timeout_for(&self, task_type: TaskType) -> Duration {
        self.task_timeouts
            .get(&task_type)
            .copied()
            .unwrap_or(self.task_timeout)
    }
}

/// Local worker process settings.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// Program launched for each local worker (resolved through `PATH`).
    pub worker_command: Option<String>,
    pub worker_args: Vec<String>,
    pub max_workers: usize,
    /// URL children are told to connect back to.
    pub hub_url: String,
    pub auto_spawn_count: usize,
    /// Providers cycled round-robin by auto-spawn.
    pub auto_spawn_providers: Vec<String>,
    /// Capabilities advertised by spawned workers (empty = worker's own default).
    pub worker_capabilities: Vec<String>,
    pub startup_timeout: Duration,
    /// Bound on graceful shutdown before a child is killed.
    pub shutdown_grace: Duration,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            worker_command: None,
            worker_args: Vec::new(),
            max_workers: 4,
            hub_url: "ws://127.0.0.1:37780/ws/worker".to_string(),
            auto_spawn_count: 0,
            auto_spawn_providers: Vec::new(),
            worker_capabilities: Vec::new(),
            startup_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl ProcessConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            worker_command: std::env::var("ORCH_WORKER_COMMAND")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            worker_args: std::env::var("ORCH_WORKER_ARGS")
                .map(|s| s.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            max_workers: env_parse("ORCH_MAX_WORKERS").unwrap_or(defaults.max_workers),
            hub_url: std::env::var("ORCH_HUB_URL").unwrap_or(defaults.hub_url),
            auto_spawn_count: env_parse("ORCH_AUTO_SPAWN").unwrap_or(defaults.auto_spawn_count),
            auto_spawn_providers: env_list("ORCH_AUTO_SPAWN_PROVIDERS"),
            worker_capabilities: env_list("ORCH_WORKER_CAPABILITIES"),
            startup_timeout: env_secs("ORCH_WORKER_STARTUP_SECS")
                .unwrap_or(defaults.startup_timeout),
            shutdown_grace: env_secs("ORCH_WORKER_SHUTDOWN_GRACE_SECS")
                .unwrap_or(defaults.shutdown_grace),
        }
    }
}

/// Hub federation health thresholds.
#[derive(Debug, Clone)]
pub struct FederationConfig {
    /// No heartbeat within this window marks a hub offline.
    pub hub_health_grace: Duration,
    pub degraded_latency_ms: f64,
    pub unhealthy_latency_ms: f64,
    pub degraded_error_rate: f64,
    pub unhealthy_error_rate: f64,
    pub hub_health_interval: Duration,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            hub_health_grace: Duration::from_secs(60),
            degraded_latency_ms: 500.0,
            unhealthy_latency_ms: 2000.0,
            degraded_error_rate: 0.05,
            unhealthy_error_rate: 0.25,
            hub_health_interval: Duration::from_secs(30),
        }
    }
}

impl FederationConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            hub_health_grace: env_secs("ORCH_HUB_HEALTH_GRACE_SECS")
                .unwrap_or(defaults.hub_health_grace),
            degraded_latency_ms: env_parse("ORCH_HUB_DEGRADED_LATENCY_MS")
                .unwrap_or(defaults.degraded_latency_ms),
            unhealthy_latency_ms: env_parse("ORCH_HUB_UNHEALTHY_LATENCY_MS")
                .unwrap_or(defaults.unhealthy_latency_ms),
            degraded_error_rate: env_parse("ORCH_HUB_DEGRADED_ERROR_RATE")
                .unwrap_or(defaults.degraded_error_rate),
            unhealthy_error_rate: env_parse("ORCH_HUB_UNHEALTHY_ERROR_RATE")
                .unwrap_or(defaults.unhealthy_error_rate),
            hub_health_interval: env_secs("ORCH_HUB_HEALTH_INTERVAL_SECS")
                .unwrap_or(defaults.hub_health_interval),
        }
    }
}

/// Queue/registry store location.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// libSQL file path; `None` keeps everything in memory.
    pub path: Option<PathBuf>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: Some(PathBuf::from("./data/orchestrator.db")),
        }
    }
}

impl DatabaseConfig {
    pub fn from_env() -> Self {
        match std::env::var("ORCH_DB_PATH") {
            Ok(p) if p == ":memory:" => Self { path: None },
            Ok(p) => Self {
                path: Some(PathBuf::from(p)),
            },
            Err(_) => Self::default(),
        }
    }
}

// ── env helpers ─────────────────────────────────────────────────────────

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn env_secs(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_secs)
}

fn env_secret(key: &str) -> Option<SecretString> {
    std::env::var(key)
        .ok()
        .filter(|s| !s.is_empty())
        .map(SecretString::from)
}

fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.hub.hub_id, "builtin");
        assert!(config.hub.allow_anonymous);
        assert_eq!(config.dispatcher.default_max_retries, 3);
        assert_eq!(config.process.max_workers, 4);
        assert_eq!(config.server.addr(), "0.0.0.0:37780");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_inverted_thresholds() {
        let mut config = OrchestratorConfig::default();
        config.federation.degraded_latency_ms = 5000.0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("ORCH_HUB_DEGRADED_LATENCY_MS"));

        let mut config = OrchestratorConfig::default();
        config.process.auto_spawn_count = 10;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { key, .. }) if key == "ORCH_AUTO_SPAWN"
        ));
    }

    #[test]
    fn per_type_timeout_overrides_default() {
        let mut config = DispatcherConfig::default();
        config
            .task_timeouts
            .insert(TaskType::Embedding, Duration::from_secs(30));

        assert_eq!(config.timeout_for(TaskType::Embedding), Duration::from_secs(30));
        assert_eq!(config.timeout_for(TaskType::Summarize), Duration::from_secs(300));
    }
}
