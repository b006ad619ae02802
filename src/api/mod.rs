//! Administrative REST surface. Handlers delegate straight to the components.

mod federation;
mod tasks;
mod workers;

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Request, State},
    http::{StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, warn};

use crate::dispatcher::TaskDispatcher;
use crate::error::{DispatchError, FederationError, HubError, SpawnError, TokenError};
use crate::federation::{HubRegistry, secret_matches};
use crate::hub::WorkerHub;
use crate::process::WorkerProcessManager;

/// Components the admin routes delegate to.
#[derive(Clone)]
pub struct ApiState {
    pub dispatcher: Arc<TaskDispatcher>,
    pub hub: Arc<WorkerHub>,
    pub hubs: Arc<HubRegistry>,
    pub processes: Arc<WorkerProcessManager>,
    /// Bearer credential every `/api/*` request must carry; `None` leaves the
    /// surface open.
    pub admin_token: Option<Arc<SecretString>>,
}

/// Build the router for `/api/*`.
pub fn api_routes(state: ApiState) -> Router {
    Router::new()
        .route("/api/tasks", get(tasks::list).post(tasks::submit))
        .route("/api/tasks/stats", get(tasks::stats))
        .route("/api/tasks/{id}", get(tasks::get))
        .route("/api/tasks/{id}/retry", post(tasks::retry))
        .route("/api/tasks/{id}/cancel", post(tasks::cancel))
        .route("/api/workers", get(workers::list))
        .route("/api/workers/spawned", get(workers::list_spawned).post(workers::spawn))
        .route("/api/workers/spawned/available", get(workers::available))
        .route("/api/workers/spawned/{id}/terminate", post(workers::terminate))
        .route("/api/tokens", get(federation::list_tokens).post(federation::create_token))
        .route("/api/tokens/{id}", delete(federation::revoke_token))
        .route("/api/tokens/{id}/registrations", get(federation::token_registrations))
        .route("/api/hubs", get(federation::list_hubs).post(federation::create_hub))
        .route("/api/hubs/{id}", delete(federation::delete_hub))
        .route("/api/hubs/{id}/heartbeat", post(federation::hub_heartbeat))
        .route("/api/hubs/{id}/registrations", get(federation::hub_registrations))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin))
        .with_state(state)
}

/// Reject admin requests without the configured bearer credential.
async fn require_admin(
    State(state): State<ApiState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = &state.admin_token else {
        return Ok(next.run(request).await);
    };

    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim_start_matches("Bearer ").trim())
        .is_some_and(|given| secret_matches(expected.expose_secret(), given));

    if authorized {
        Ok(next.run(request).await)
    } else {
        debug!(path = %request.uri().path(), "Admin request rejected");
        Err(ApiError::new(
            StatusCode::UNAUTHORIZED,
            "admin credential required",
        ))
    }
}

/// Error response: `{"error": "..."}` with a mapped status.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            warn!(status = %self.status, error = %self.message, "Admin request failed");
        }
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

impl From<DispatchError> for ApiError {
    fn from(e: DispatchError) -> Self {
        let status = match &e {
            DispatchError::NotFound { .. } => StatusCode::NOT_FOUND,
            DispatchError::InvalidTransition { .. } => StatusCode::CONFLICT,
            DispatchError::InvalidTask(_) => StatusCode::BAD_REQUEST,
            DispatchError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl From<SpawnError> for ApiError {
    fn from(e: SpawnError) -> Self {
        let status = match &e {
            SpawnError::RuntimeUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            SpawnError::CapacityReached { .. } => StatusCode::TOO_MANY_REQUESTS,
            SpawnError::NotFound { .. } => StatusCode::NOT_FOUND,
            SpawnError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl From<TokenError> for ApiError {
    fn from(e: TokenError) -> Self {
        let status = match &e {
            TokenError::NotFound { .. } => StatusCode::NOT_FOUND,
            TokenError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        };
        Self::new(status, e.to_string())
    }
}

impl From<FederationError> for ApiError {
    fn from(e: FederationError) -> Self {
        let status = match &e {
            FederationError::NotFound { .. } => StatusCode::NOT_FOUND,
            FederationError::BuiltinImmutable { .. } => StatusCode::CONFLICT,
            FederationError::InvalidHub(_) => StatusCode::BAD_REQUEST,
            FederationError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl From<HubError> for ApiError {
    fn from(e: HubError) -> Self {
        let status = match &e {
            HubError::WorkerNotFound { .. } => StatusCode::NOT_FOUND,
            _ => StatusCode::CONFLICT,
        };
        Self::new(status, e.to_string())
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::orchestrator::Orchestrator;
    use crate::store::MemoryStore;

    async fn call(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        call_as(app, None, method, uri, body).await
    }

    async fn call_as(
        app: &Router,
        bearer: Option<&str>,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(token) = bearer {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let request = builder
            .body(match body {
                Some(json) => Body::from(json.to_string()),
                None => Body::empty(),
            })
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    async fn app() -> Router {
        let orchestrator =
            Orchestrator::new(OrchestratorConfig::default(), Arc::new(MemoryStore::new()));
        orchestrator.start().await.unwrap();
        orchestrator.router()
    }

    #[tokio::test]
    async fn admin_routes_require_the_configured_credential() {
        let mut config = OrchestratorConfig::default();
        config.hub.auth_token = Some("hub-secret".to_string().into());
        config.hub.allow_anonymous = false;
        let orchestrator = Orchestrator::new(config, Arc::new(MemoryStore::new()));
        orchestrator.start().await.unwrap();
        let app = orchestrator.router();

        let request = serde_json::json!({"name": "ci", "scope": "instance"});
        let (status, body) = call(&app, "POST", "/api/tokens", Some(request.clone())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "admin credential required");

        let (status, _) = call_as(&app, Some("wrong"), "GET", "/api/tokens", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(orchestrator.tokens().list_tokens().await.is_empty());

        let (status, _) = call_as(&app, Some("hub-secret"), "POST", "/api/tokens", Some(request)).await;
        assert_eq!(status, StatusCode::CREATED);

        // Liveness stays public.
        let (status, _) = call(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn task_submit_get_cancel_retry() {
        let app = app().await;

        let (status, task) = call(
            &app,
            "POST",
            "/api/tasks",
            Some(serde_json::json!({"type": "summarize", "priority": 3, "deduplicationKey": "k"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(task["status"], "pending");
        let id = task["id"].as_str().unwrap().to_string();

        let (_, again) = call(
            &app,
            "POST",
            "/api/tasks",
            Some(serde_json::json!({"type": "summarize", "deduplicationKey": "k"})),
        )
        .await;
        assert_eq!(again["id"], id.as_str());

        let (status, _) = call(&app, "POST", &format!("/api/tasks/{id}/retry"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, cancelled) = call(&app, "POST", &format!("/api/tasks/{id}/cancel"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(cancelled["status"], "failed");

        let (_, stats) = call(&app, "GET", "/api/tasks/stats", None).await;
        assert_eq!(stats["failed"], 1);
        assert_eq!(stats["total"], 1);

        let (status, _) = call(&app, "GET", "/api/tasks?status=bogus", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = call(&app, "GET", "/api/tasks/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn token_lifecycle() {
        let app = app().await;

        let (status, created) = call(
            &app,
            "POST",
            "/api/tokens",
            Some(serde_json::json!({"name": "ci", "scope": "project", "projectFilter": "demo-*"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert!(created["token"].as_str().unwrap().starts_with("wkt_"));
        let id = created["id"].as_str().unwrap().to_string();

        let (_, tokens) = call(&app, "GET", "/api/tokens", None).await;
        assert_eq!(tokens.as_array().unwrap().len(), 1);
        assert!(tokens[0].get("token").is_none());
        assert!(tokens[0].get("tokenHash").is_none());

        let (status, revoked) = call(&app, "DELETE", &format!("/api/tokens/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(revoked["token"]["revokedAt"].is_string());

        let (status, _) = call(
            &app,
            "POST",
            "/api/tokens",
            Some(serde_json::json!({"name": "bad", "scope": "project"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn hub_lifecycle() {
        let app = app().await;

        let (status, hub) = call(
            &app,
            "POST",
            "/api/hubs",
            Some(serde_json::json!({"name": "edge", "endpoint": "wss://edge.example/ws"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(hub["status"], "offline");
        let id = hub["id"].as_str().unwrap().to_string();

        let (status, hub) = call(
            &app,
            "POST",
            &format!("/api/hubs/{id}/heartbeat"),
            Some(serde_json::json!({"latencyMs": 800.0, "connectedWorkers": 2})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(hub["status"], "degraded");

        let (status, _) = call(&app, "DELETE", "/api/hubs/builtin", None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = call(&app, "DELETE", &format!("/api/hubs/{id}"), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (_, hubs) = call(&app, "GET", "/api/hubs", None).await;
        assert_eq!(hubs.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn spawn_without_runtime_is_unavailable() {
        let app = app().await;
        let (_, available) = call(&app, "GET", "/api/workers/spawned/available", None).await;
        assert_eq!(available["available"], false);

        let (status, body) =
            call(&app, "POST", "/api/workers/spawned", Some(serde_json::json!({}))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body["error"].as_str().unwrap().contains("runtime"));

        let (status, workers) = call(&app, "GET", "/api/workers", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(workers.as_array().unwrap().is_empty());
    }
}
