//! In-memory `QueueStore` for tests and ephemeral runs.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::dispatcher::{Task, TaskStatus};
use crate::error::StoreError;
use crate::federation::{Hub, WorkerRegistration, WorkerToken};
use crate::store::traits::QueueStore;

#[derive(Default)]
pub struct MemoryStore {
    tasks: RwLock<HashMap<String, Task>>,
    tokens: RwLock<HashMap<String, WorkerToken>>,
    registrations: RwLock<HashMap<String, WorkerRegistration>>,
    hubs: RwLock<HashMap<String, Hub>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn not_found(entity: &str, id: &str) -> StoreError {
    StoreError::NotFound {
        entity: entity.to_string(),
        id: id.to_string(),
    }
}

fn duplicate(entity: &str, id: &str) -> StoreError {
    StoreError::Constraint(format!("{entity} {id} already exists"))
}

fn newest_first(mut registrations: Vec<WorkerRegistration>) -> Vec<WorkerRegistration> {
    registrations.sort_by(|a, b| b.connected_at.cmp(&a.connected_at));
    registrations
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn insert_task(&self, task: &Task) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            return Err(duplicate("task", &task.id));
        }
        tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>, StoreError> {
        Ok(self.tasks.read().await.get(id).cloned())
    }

    async fn update_task(&self, task: &Task) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write().await;
        let slot = tasks.get_mut(&task.id).ok_or_else(|| not_found("task", &task.id))?;
        *slot = task.clone();
        Ok(())
    }

    async fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<Task>, StoreError> {
        let mut tasks: Vec<Task> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| status.is_none_or(|s| t.status == s))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(tasks)
    }

    async fn count_by_status(&self) -> Result<HashMap<TaskStatus, u64>, StoreError> {
        let mut counts = HashMap::new();
        for task in self.tasks.read().await.values() {
            *counts.entry(task.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn find_active_by_dedup_key(&self, key: &str) -> Result<Option<Task>, StoreError> {
        Ok(self
            .tasks
            .read()
            .await
            .values()
            .find(|t| !t.status.is_terminal() && t.deduplication_key.as_deref() == Some(key))
            .cloned())
    }

    async fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut tasks = self.tasks.write().await;
        let before = tasks.len();
        tasks.retain(|_, t| {
            !(t.status.is_terminal() && t.completed_at.is_some_and(|at| at < cutoff))
        });
        Ok(before - tasks.len())
    }

    async fn insert_token(&self, token: &WorkerToken) -> Result<(), StoreError> {
        let mut tokens = self.tokens.write().await;
        if tokens.contains_key(&token.id) {
            return Err(duplicate("token", &token.id));
        }
        tokens.insert(token.id.clone(), token.clone());
        Ok(())
    }

    async fn get_token(&self, id: &str) -> Result<Option<WorkerToken>, StoreError> {
        Ok(self.tokens.read().await.get(id).cloned())
    }

    async fn find_token_by_hash(&self, hash: &str) -> Result<Option<WorkerToken>, StoreError> {
        Ok(self
            .tokens
            .read()
            .await
            .values()
            .find(|t| t.token_hash == hash)
            .cloned())
    }

    async fn list_tokens(&self) -> Result<Vec<WorkerToken>, StoreError> {
        let mut tokens: Vec<WorkerToken> = self.tokens.read().await.values().cloned().collect();
        tokens.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tokens)
    }

    async fn update_token(&self, token: &WorkerToken) -> Result<(), StoreError> {
        let mut tokens = self.tokens.write().await;
        let slot = tokens.get_mut(&token.id).ok_or_else(|| not_found("token", &token.id))?;
        *slot = token.clone();
        Ok(())
    }

    async fn insert_registration(&self, registration: &WorkerRegistration) -> Result<(), StoreError> {
        let mut registrations = self.registrations.write().await;
        if registrations.contains_key(&registration.id) {
            return Err(duplicate("registration", &registration.id));
        }
        registrations.insert(registration.id.clone(), registration.clone());
        Ok(())
    }

    async fn get_registration(&self, id: &str) -> Result<Option<WorkerRegistration>, StoreError> {
        Ok(self.registrations.read().await.get(id).cloned())
    }

    async fn update_registration(&self, registration: &WorkerRegistration) -> Result<(), StoreError> {
        let mut registrations = self.registrations.write().await;
        let slot = registrations
            .get_mut(&registration.id)
            .ok_or_else(|| not_found("registration", &registration.id))?;
        *slot = registration.clone();
        Ok(())
    }

    async fn list_registrations_by_token(
        &self,
        token_id: &str,
    ) -> Result<Vec<WorkerRegistration>, StoreError> {
        let matching = self
            .registrations
            .read()
            .await
            .values()
            .filter(|r| r.token_id == token_id)
            .cloned()
            .collect();
        Ok(newest_first(matching))
    }

    async fn list_registrations_by_hub(
        &self,
        hub_id: &str,
    ) -> Result<Vec<WorkerRegistration>, StoreError> {
        let matching = self
            .registrations
            .read()
            .await
            .values()
            .filter(|r| r.hub_id == hub_id)
            .cloned()
            .collect();
        Ok(newest_first(matching))
    }

    async fn insert_hub(&self, hub: &Hub) -> Result<(), StoreError> {
        let mut hubs = self.hubs.write().await;
        if hubs.contains_key(&hub.id) {
            return Err(duplicate("hub", &hub.id));
        }
        hubs.insert(hub.id.clone(), hub.clone());
        Ok(())
    }

    async fn get_hub(&self, id: &str) -> Result<Option<Hub>, StoreError> {
        Ok(self.hubs.read().await.get(id).cloned())
    }

    async fn list_hubs(&self) -> Result<Vec<Hub>, StoreError> {
        let mut hubs: Vec<Hub> = self.hubs.read().await.values().cloned().collect();
        hubs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(hubs)
    }

    async fn update_hub(&self, hub: &Hub) -> Result<(), StoreError> {
        let mut hubs = self.hubs.write().await;
        let slot = hubs.get_mut(&hub.id).ok_or_else(|| not_found("hub", &hub.id))?;
        *slot = hub.clone();
        Ok(())
    }

    async fn delete_hub(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.hubs.write().await.remove(id).is_some())
    }
}
