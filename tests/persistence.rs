//! Restart behavior against an on-disk libSQL store.

use std::sync::Arc;

use worker_orchestrator::config::OrchestratorConfig;
use worker_orchestrator::dispatcher::{TaskRequest, TaskStatus, TaskType};
use worker_orchestrator::federation::{CreateHubRequest, CreateTokenRequest, TokenScope};
use worker_orchestrator::orchestrator::Orchestrator;
use worker_orchestrator::store::LibSqlStore;

async fn open(path: &std::path::Path) -> Orchestrator {
    let store = LibSqlStore::new_local(path).await.expect("open store");
    let orchestrator = Orchestrator::new(OrchestratorConfig::default(), Arc::new(store));
    orchestrator.start().await.expect("start");
    orchestrator
}

#[tokio::test]
async fn queue_tokens_and_hubs_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("orchestrator.db");

    let (task_id, token_id, secret) = {
        let orchestrator = open(&path).await;
        let task = orchestrator
            .dispatcher()
            .submit(
                TaskRequest::new(TaskType::Summarize)
                    .with_priority(4)
                    .with_dedup_key("daily-digest"),
            )
            .await
            .unwrap();
        let mut request = CreateTokenRequest::new("edge", TokenScope::Project);
        request.project_filter = Some("site-*".into());
        let created = orchestrator.tokens().create_token(request).await.unwrap();
        orchestrator
            .hubs()
            .create(CreateHubRequest::new("edge", "wss://edge.internal/ws"))
            .await
            .unwrap();
        orchestrator.stop().await;
        (task.id, created.id, created.token)
    };

    let orchestrator = open(&path).await;

    let task = orchestrator.dispatcher().get(&task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.priority, 4);

    // The dedup key still collapses onto the persisted task.
    let again = orchestrator
        .dispatcher()
        .submit(TaskRequest::new(TaskType::Summarize).with_dedup_key("daily-digest"))
        .await
        .unwrap();
    assert_eq!(again.id, task_id);

    let decision = orchestrator.tokens().validate(&secret).await.unwrap();
    assert_eq!(decision.token_id.as_deref(), Some(token_id.as_str()));
    assert!(decision.allows_project(Some("site-a")));

    let hubs = orchestrator.hubs().list().await.unwrap();
    assert_eq!(hubs.len(), 2);
    assert!(hubs.iter().any(|h| h.name == "edge"));

    let stats = orchestrator.dispatcher().stats().await.unwrap();
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.total, 1);
}

#[tokio::test]
async fn revocation_persists() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("orchestrator.db");

    let secret = {
        let orchestrator = open(&path).await;
        let created = orchestrator
            .tokens()
            .create_token(CreateTokenRequest::new("ci", TokenScope::Instance))
            .await
            .unwrap();
        orchestrator.hub().revoke_token(&created.id).await.unwrap();
        orchestrator.stop().await;
        created.token
    };

    let orchestrator = open(&path).await;
    assert!(orchestrator.tokens().validate(&secret).await.is_err());
}
