//! libSQL backend: async `QueueStore` implementation.
//!
//! Each table keeps the columns it is queried by plus a JSON `body` holding the
//! full record. Timestamps are fixed-width RFC 3339 so text comparison orders them.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::params::IntoParams;
use libsql::{Connection, Database as LibSqlDatabase, params};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::dispatcher::{Task, TaskStatus};
use crate::error::StoreError;
use crate::federation::{Hub, WorkerRegistration, WorkerToken};
use crate::store::migrations;
use crate::store::traits::QueueStore;

/// libSQL queue store.
///
/// Stores a single connection that is reused for all operations.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Connection(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Connection(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db).await?;
        info!(path = %path.display(), "Queue store opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                StoreError::Connection(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, StoreError> {
        let conn = db
            .connect()
            .map_err(|e| StoreError::Connection(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(&store.conn).await?;
        Ok(store)
    }

    /// Run a query whose first column is a JSON body and decode every row.
    async fn query_bodies<T: DeserializeOwned>(
        &self,
        op: &str,
        sql: &str,
        params: impl IntoParams,
    ) -> Result<Vec<T>, StoreError> {
        let mut rows = self
            .conn
            .query(sql, params)
            .await
            .map_err(|e| StoreError::Query(format!("{op}: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("{op}: {e}")))?
        {
            let body: String = row.get(0)?;
            out.push(serde_json::from_str(&body)?);
        }
        Ok(out)
    }

    async fn query_body<T: DeserializeOwned>(
        &self,
        op: &str,
        sql: &str,
        params: impl IntoParams,
    ) -> Result<Option<T>, StoreError> {
        Ok(self.query_bodies(op, sql, params).await?.into_iter().next())
    }

    /// Token rows carry the hash outside the body; it is never serialized.
    async fn query_tokens(
        &self,
        op: &str,
        sql: &str,
        params: impl IntoParams,
    ) -> Result<Vec<WorkerToken>, StoreError> {
        let mut rows = self
            .conn
            .query(sql, params)
            .await
            .map_err(|e| StoreError::Query(format!("{op}: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("{op}: {e}")))?
        {
            let body: String = row.get(0)?;
            let mut token: WorkerToken = serde_json::from_str(&body)?;
            token.token_hash = row.get(1)?;
            out.push(token);
        }
        Ok(out)
    }

    async fn execute_update(
        &self,
        entity: &str,
        id: &str,
        sql: &str,
        params: impl IntoParams,
    ) -> Result<(), StoreError> {
        let changed = self
            .conn
            .execute(sql, params)
            .await
            .map_err(|e| StoreError::Query(format!("update {entity}: {e}")))?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                entity: entity.to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }
}

// ── Helper functions ────────────────────────────────────────────────

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Convert `Option<String>` to libsql Value.
fn opt_text(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

const ACTIVE_STATUSES: &str = "('pending', 'assigned', 'processing')";
const TERMINAL_STATUSES: &str = "('completed', 'failed', 'timeout')";

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl QueueStore for LibSqlStore {
    // ── Tasks ───────────────────────────────────────────────────────

    async fn insert_task(&self, task: &Task) -> Result<(), StoreError> {
        self.conn
            .execute(
                "INSERT INTO tasks (id, status, priority, deduplication_key, created_at, completed_at, body) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    task.id.as_str(),
                    task.status.as_str(),
                    i64::from(task.priority),
                    opt_text(task.deduplication_key.clone()),
                    ts(task.created_at),
                    opt_text(task.completed_at.map(ts)),
                    serde_json::to_string(task)?,
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("insert_task: {e}")))?;

        debug!(task_id = %task.id, "Task inserted");
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>, StoreError> {
        self.query_body("get_task", "SELECT body FROM tasks WHERE id = ?1", params![id])
            .await
    }

    async fn update_task(&self, task: &Task) -> Result<(), StoreError> {
        self.execute_update(
            "task",
            &task.id,
            "UPDATE tasks SET status = ?1, priority = ?2, completed_at = ?3, body = ?4 WHERE id = ?5",
            params![
                task.status.as_str(),
                i64::from(task.priority),
                opt_text(task.completed_at.map(ts)),
                serde_json::to_string(task)?,
                task.id.as_str(),
            ],
        )
        .await
    }

    async fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<Task>, StoreError> {
        match status {
            Some(status) => {
                self.query_bodies(
                    "list_tasks",
                    "SELECT body FROM tasks WHERE status = ?1 ORDER BY created_at, id",
                    params![status.as_str()],
                )
                .await
            }
            None => {
                self.query_bodies("list_tasks", "SELECT body FROM tasks ORDER BY created_at, id", ())
                    .await
            }
        }
    }

    async fn count_by_status(&self) -> Result<HashMap<TaskStatus, u64>, StoreError> {
        let mut rows = self
            .conn
            .query("SELECT status, COUNT(*) FROM tasks GROUP BY status", ())
            .await
            .map_err(|e| StoreError::Query(format!("count_by_status: {e}")))?;

        let mut counts = HashMap::new();
        while let Some(row) = rows.next().await? {
            let status: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            let status: TaskStatus = status.parse().map_err(StoreError::Serialization)?;
            counts.insert(status, u64::try_from(count).unwrap_or(0));
        }
        Ok(counts)
    }

    async fn find_active_by_dedup_key(&self, key: &str) -> Result<Option<Task>, StoreError> {
        self.query_body(
            "find_active_by_dedup_key",
            &format!(
                "SELECT body FROM tasks WHERE deduplication_key = ?1 AND status IN {ACTIVE_STATUSES} ORDER BY created_at LIMIT 1"
            ),
            params![key],
        )
        .await
    }

    async fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let removed = self
            .conn
            .execute(
                &format!(
                    "DELETE FROM tasks WHERE status IN {TERMINAL_STATUSES} AND completed_at IS NOT NULL AND completed_at < ?1"
                ),
                params![ts(cutoff)],
            )
            .await
            .map_err(|e| StoreError::Query(format!("delete_finished_before: {e}")))?;
        Ok(removed as usize)
    }

    // ── Worker tokens ───────────────────────────────────────────────

    async fn insert_token(&self, token: &WorkerToken) -> Result<(), StoreError> {
        self.conn
            .execute(
                "INSERT INTO worker_tokens (id, token_hash, created_at, body) VALUES (?1, ?2, ?3, ?4)",
                params![
                    token.id.as_str(),
                    token.token_hash.as_str(),
                    ts(token.created_at),
                    serde_json::to_string(token)?,
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("insert_token: {e}")))?;
        Ok(())
    }

    async fn get_token(&self, id: &str) -> Result<Option<WorkerToken>, StoreError> {
        Ok(self
            .query_tokens(
                "get_token",
                "SELECT body, token_hash FROM worker_tokens WHERE id = ?1",
                params![id],
            )
            .await?
            .into_iter()
            .next())
    }

    async fn find_token_by_hash(&self, hash: &str) -> Result<Option<WorkerToken>, StoreError> {
        Ok(self
            .query_tokens(
                "find_token_by_hash",
                "SELECT body, token_hash FROM worker_tokens WHERE token_hash = ?1",
                params![hash],
            )
            .await?
            .into_iter()
            .next())
    }

    async fn list_tokens(&self) -> Result<Vec<WorkerToken>, StoreError> {
        self.query_tokens(
            "list_tokens",
            "SELECT body, token_hash FROM worker_tokens ORDER BY created_at",
            (),
        )
        .await
    }

    async fn update_token(&self, token: &WorkerToken) -> Result<(), StoreError> {
        self.execute_update(
            "token",
            &token.id,
            "UPDATE worker_tokens SET body = ?1 WHERE id = ?2",
            params![serde_json::to_string(token)?, token.id.as_str()],
        )
        .await
    }

    // ── Worker registrations ────────────────────────────────────────

    async fn insert_registration(&self, registration: &WorkerRegistration) -> Result<(), StoreError> {
        self.conn
            .execute(
                "INSERT INTO worker_registrations (id, token_id, hub_id, status, connected_at, body) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    registration.id.as_str(),
                    registration.token_id.as_str(),
                    registration.hub_id.as_str(),
                    registration.status.as_str(),
                    ts(registration.connected_at),
                    serde_json::to_string(registration)?,
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("insert_registration: {e}")))?;
        Ok(())
    }

    async fn get_registration(&self, id: &str) -> Result<Option<WorkerRegistration>, StoreError> {
        self.query_body(
            "get_registration",
            "SELECT body FROM worker_registrations WHERE id = ?1",
            params![id],
        )
        .await
    }

    async fn update_registration(&self, registration: &WorkerRegistration) -> Result<(), StoreError> {
        self.execute_update(
            "registration",
            &registration.id,
            "UPDATE worker_registrations SET status = ?1, body = ?2 WHERE id = ?3",
            params![
                registration.status.as_str(),
                serde_json::to_string(registration)?,
                registration.id.as_str(),
            ],
        )
        .await
    }

    async fn list_registrations_by_token(
        &self,
        token_id: &str,
    ) -> Result<Vec<WorkerRegistration>, StoreError> {
        self.query_bodies(
            "list_registrations_by_token",
            "SELECT body FROM worker_registrations WHERE token_id = ?1 ORDER BY connected_at DESC",
            params![token_id],
        )
        .await
    }

    async fn list_registrations_by_hub(
        &self,
        hub_id: &str,
    ) -> Result<Vec<WorkerRegistration>, StoreError> {
        self.query_bodies(
            "list_registrations_by_hub",
            "SELECT body FROM worker_registrations WHERE hub_id = ?1 ORDER BY connected_at DESC",
            params![hub_id],
        )
        .await
    }

    // ── Hubs ────────────────────────────────────────────────────────

    async fn insert_hub(&self, hub: &Hub) -> Result<(), StoreError> {
        self.conn
            .execute(
                "INSERT INTO hubs (id, hub_type, created_at, body) VALUES (?1, ?2, ?3, ?4)",
                params![
                    hub.id.as_str(),
                    if hub.is_builtin() { "builtin" } else { "external" },
                    ts(hub.created_at),
                    serde_json::to_string(hub)?,
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("insert_hub: {e}")))?;
        Ok(())
    }

    async fn get_hub(&self, id: &str) -> Result<Option<Hub>, StoreError> {
        self.query_body("get_hub", "SELECT body FROM hubs WHERE id = ?1", params![id])
            .await
    }

    async fn list_hubs(&self) -> Result<Vec<Hub>, StoreError> {
        self.query_bodies("list_hubs", "SELECT body FROM hubs ORDER BY created_at", ())
            .await
    }

    async fn update_hub(&self, hub: &Hub) -> Result<(), StoreError> {
        self.execute_update(
            "hub",
            &hub.id,
            "UPDATE hubs SET body = ?1 WHERE id = ?2",
            params![serde_json::to_string(hub)?, hub.id.as_str()],
        )
        .await
    }

    async fn delete_hub(&self, id: &str) -> Result<bool, StoreError> {
        let removed = self
            .conn
            .execute("DELETE FROM hubs WHERE id = ?1", params![id])
            .await
            .map_err(|e| StoreError::Query(format!("delete_hub: {e}")))?;
        Ok(removed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{TaskRequest, TaskType};
    use crate::federation::{BUILTIN_HUB_ID, TokenScope};

    async fn test_store() -> LibSqlStore {
        LibSqlStore::new_memory().await.unwrap()
    }

    fn token(hash: &str) -> WorkerToken {
        WorkerToken {
            id: uuid::Uuid::new_v4().to_string(),
            name: "ci".into(),
            token_prefix: "wkt_abcdefgh".into(),
            token_hash: hash.into(),
            scope: TokenScope::Instance,
            hub_id: None,
            project_filter: None,
            capabilities: None,
            labels: HashMap::new(),
            created_at: Utc::now(),
            expires_at: None,
            last_used_at: None,
            revoked_at: None,
            registration_count: 0,
        }
    }

    #[tokio::test]
    async fn task_insert_update_and_filter() {
        let store = test_store().await;
        let mut task = Task::from_request(
            TaskRequest::new(TaskType::Embedding)
                .with_priority(4)
                .with_payload(serde_json::json!({"doc": 7}))
                .with_dedup_key("doc-7"),
            2,
        );
        store.insert_task(&task).await.unwrap();

        let loaded = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(loaded, task);

        task.assign("w-1", Utc::now()).unwrap();
        store.update_task(&task).await.unwrap();

        assert!(store.list_tasks(Some(TaskStatus::Pending)).await.unwrap().is_empty());
        assert_eq!(store.list_tasks(Some(TaskStatus::Assigned)).await.unwrap().len(), 1);
        assert_eq!(
            store.count_by_status().await.unwrap().get(&TaskStatus::Assigned),
            Some(&1)
        );
        assert_eq!(
            store.find_active_by_dedup_key("doc-7").await.unwrap().map(|t| t.id),
            Some(task.id.clone())
        );
    }

    #[tokio::test]
    async fn update_missing_task_is_not_found() {
        let store = test_store().await;
        let task = Task::from_request(TaskRequest::new(TaskType::Cleanup), 0);
        assert!(matches!(
            store.update_task(&task).await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn finished_tasks_are_purged_by_age() {
        let store = test_store().await;
        let now = Utc::now();
        let mut old = Task::from_request(TaskRequest::new(TaskType::Cleanup), 0);
        old.assign("w", now).unwrap();
        old.fail(TaskStatus::Failed, "x", now - chrono::Duration::days(3))
            .unwrap();
        let pending = Task::from_request(TaskRequest::new(TaskType::Cleanup), 0);
        store.insert_task(&old).await.unwrap();
        store.insert_task(&pending).await.unwrap();

        let removed = store
            .delete_finished_before(now - chrono::Duration::days(1))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.get_task(&pending.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn token_hash_survives_round_trip() {
        let store = test_store().await;
        let t = token("deadbeef");
        store.insert_token(&t).await.unwrap();

        let by_id = store.get_token(&t.id).await.unwrap().unwrap();
        assert_eq!(by_id.token_hash, "deadbeef");
        let by_hash = store.find_token_by_hash("deadbeef").await.unwrap().unwrap();
        assert_eq!(by_hash.id, t.id);

        // Hashes are unique.
        let mut dup = token("deadbeef");
        dup.name = "other".into();
        assert!(store.insert_token(&dup).await.is_err());
    }

    #[tokio::test]
    async fn hubs_crud() {
        let store = test_store().await;
        let mut hub = Hub::builtin(BUILTIN_HUB_ID);
        store.insert_hub(&hub).await.unwrap();

        hub.connected_workers = 3;
        store.update_hub(&hub).await.unwrap();
        let loaded = store.get_hub(BUILTIN_HUB_ID).await.unwrap().unwrap();
        assert_eq!(loaded.connected_workers, 3);

        assert!(store.delete_hub(BUILTIN_HUB_ID).await.unwrap());
        assert!(store.list_hubs().await.unwrap().is_empty());
    }
}
