use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use worker_orchestrator::config::OrchestratorConfig;
use worker_orchestrator::orchestrator::Orchestrator;
use worker_orchestrator::store::{LibSqlStore, MemoryStore, QueueStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Optional daily log file next to stderr output. The guard must outlive main.
    let (file_layer, _log_guard) = match std::env::var("ORCH_LOG_DIR") {
        Ok(dir) if !dir.is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, "orchestrator.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    let config = OrchestratorConfig::from_env();
    config.validate().context("invalid configuration")?;
    let addr = config.server.addr();

    eprintln!("Worker orchestrator v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Hub id: {}", config.hub.hub_id);
    eprintln!("   Worker WS: ws://{addr}/ws/worker");
    eprintln!("   Events WS: ws://{addr}/ws/events");
    eprintln!("   Admin API: http://{addr}/api");

    // ── Store ───────────────────────────────────────────────────────────
    let store: Arc<dyn QueueStore> = match &config.database.path {
        Some(path) => {
            let store = LibSqlStore::new_local(path)
                .await
                .with_context(|| format!("failed to open database at {}", path.display()))?;
            eprintln!("   Database: {}", path.display());
            Arc::new(store)
        }
        None => {
            eprintln!("   Database: in-memory");
            Arc::new(MemoryStore::new())
        }
    };

    // ── Orchestrator ────────────────────────────────────────────────────
    let orchestrator = Arc::new(Orchestrator::new(config, store));
    orchestrator
        .start()
        .await
        .context("failed to start orchestrator")?;

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(addr = %addr, "Orchestrator listening");

    let app = orchestrator.router();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "Server exited");
        }
    });

    if orchestrator.config().process.auto_spawn_count > 0 {
        if orchestrator.processes().can_spawn_workers().await {
            orchestrator.processes().auto_spawn().await;
        } else {
            tracing::warn!("Auto-spawn requested but no worker runtime is available");
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    eprintln!("\nShutting down...");

    orchestrator.stop().await;
    server.abort();
    Ok(())
}
