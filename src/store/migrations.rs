//! Version-tracked schema migrations for the libSQL backend.
//!
//! Migrations are numbered steps applied in order; `_migrations` records which
//! have run.

use libsql::Connection;
use tracing::{debug, info};

use crate::error::StoreError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "task_queue",
        sql: r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                deduplication_key TEXT,
                created_at TEXT NOT NULL,
                completed_at TEXT,
                body TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
            CREATE INDEX IF NOT EXISTS idx_tasks_dedup ON tasks(deduplication_key);
            CREATE INDEX IF NOT EXISTS idx_tasks_completed ON tasks(completed_at);
        "#,
    },
    Migration {
        version: 2,
        name: "federation",
        sql: r#"
            CREATE TABLE IF NOT EXISTS hubs (
                id TEXT PRIMARY KEY,
                hub_type TEXT NOT NULL,
                created_at TEXT NOT NULL,
                body TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS worker_tokens (
                id TEXT PRIMARY KEY,
                token_hash TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL,
                body TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS worker_registrations (
                id TEXT PRIMARY KEY,
                token_id TEXT NOT NULL REFERENCES worker_tokens(id),
                hub_id TEXT NOT NULL,
                status TEXT NOT NULL,
                connected_at TEXT NOT NULL,
                body TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_registrations_token ON worker_registrations(token_id);
            CREATE INDEX IF NOT EXISTS idx_registrations_hub ON worker_registrations(hub_id);
        "#,
    },
];

const LEDGER_DDL: &str = "CREATE TABLE IF NOT EXISTS _migrations (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
)";

fn failed(step: String) -> impl FnOnce(libsql::Error) -> StoreError {
    move |e| StoreError::Migration(format!("{step}: {e}"))
}

/// Apply every migration newer than the recorded version.
///
/// Each step runs in its own transaction together with its ledger row, so a failed
/// step leaves the schema at the previous version.
pub async fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute(LEDGER_DDL, ())
        .await
        .map_err(failed("create _migrations".into()))?;

    let applied = get_current_version(conn).await?;
    let mut version = applied;

    for migration in MIGRATIONS.iter().filter(|m| m.version > applied) {
        let step = format!("migration V{} ({})", migration.version, migration.name);
        info!(version = migration.version, name = migration.name, "Applying store migration");

        let tx = conn.transaction().await.map_err(failed(step.clone()))?;
        tx.execute_batch(migration.sql)
            .await
            .map_err(failed(step.clone()))?;
        tx.execute(
            "INSERT INTO _migrations (version, name) VALUES (?1, ?2)",
            libsql::params![migration.version, migration.name],
        )
        .await
        .map_err(failed(step.clone()))?;
        tx.commit().await.map_err(failed(step))?;
        version = migration.version;
    }

    debug!(from = applied, to = version, "Store schema ready");
    Ok(())
}

/// Highest applied migration version, or 0 on a fresh database.
async fn get_current_version(conn: &Connection) -> Result<i64, StoreError> {
    let step = || "read schema version".to_string();
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(failed(step()))?;
    match rows.next().await.map_err(failed(step()))? {
        Some(row) => row.get::<i64>(0).map_err(failed(step())),
        None => Ok(0),
    }
}
