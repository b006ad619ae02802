//! `QueueStore`: the single async interface the orchestration core persists through.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::dispatcher::{Task, TaskStatus};
use crate::error::StoreError;
use crate::federation::{Hub, RegistrationStatus, WorkerRegistration, WorkerToken};

/// Backend-agnostic store for tasks, worker tokens, registrations, and hubs.
///
/// `update_*` calls fail with [`StoreError::NotFound`] when the record is missing.
#[async_trait]
pub trait QueueStore: Send + Sync {
    // ── Tasks ───────────────────────────────────────────────────────

    async fn insert_task(&self, task: &Task) -> Result<(), StoreError>;

    async fn get_task(&self, id: &str) -> Result<Option<Task>, StoreError>;

    async fn update_task(&self, task: &Task) -> Result<(), StoreError>;

    /// Tasks, optionally filtered by status, oldest first.
    async fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<Task>, StoreError>;

    async fn count_by_status(&self) -> Result<HashMap<TaskStatus, u64>, StoreError>;

    /// The non-terminal task carrying `key`, if any.
    async fn find_active_by_dedup_key(&self, key: &str) -> Result<Option<Task>, StoreError>;

    /// Remove terminal tasks completed before `cutoff`; returns how many.
    async fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;

    // ── Worker tokens ───────────────────────────────────────────────

    async fn insert_token(&self, token: &WorkerToken) -> Result<(), StoreError>;

    async fn get_token(&self, id: &str) -> Result<Option<WorkerToken>, StoreError>;

    async fn find_token_by_hash(&self, hash: &str) -> Result<Option<WorkerToken>, StoreError>;

    async fn list_tokens(&self) -> Result<Vec<WorkerToken>, StoreError>;

    async fn update_token(&self, token: &WorkerToken) -> Result<(), StoreError>;

    // ── Worker registrations ────────────────────────────────────────

    async fn insert_registration(&self, registration: &WorkerRegistration) -> Result<(), StoreError>;

    async fn get_registration(&self, id: &str) -> Result<Option<WorkerRegistration>, StoreError>;

    async fn update_registration(&self, registration: &WorkerRegistration) -> Result<(), StoreError>;

    /// Most recent first.
    async fn list_registrations_by_token(
        &self,
        token_id: &str,
    ) -> Result<Vec<WorkerRegistration>, StoreError>;

    /// Most recent first.
    async fn list_registrations_by_hub(
        &self,
        hub_id: &str,
    ) -> Result<Vec<WorkerRegistration>, StoreError>;

    async fn list_online_registrations(
        &self,
        token_id: &str,
    ) -> Result<Vec<WorkerRegistration>, StoreError> {
        Ok(self
            .list_registrations_by_token(token_id)
            .await?
            .into_iter()
            .filter(|r| r.status == RegistrationStatus::Online)
            .collect())
    }

    // ── Hubs ────────────────────────────────────────────────────────

    async fn insert_hub(&self, hub: &Hub) -> Result<(), StoreError>;

    async fn get_hub(&self, id: &str) -> Result<Option<Hub>, StoreError>;

    async fn list_hubs(&self) -> Result<Vec<Hub>, StoreError>;

    async fn update_hub(&self, hub: &Hub) -> Result<(), StoreError>;

    async fn delete_hub(&self, id: &str) -> Result<bool, StoreError>;
}
