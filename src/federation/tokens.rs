//! Worker tokens: scoped credentials authorizing workers to join a hub.
//!
//! The raw secret is returned once from [`TokenRegistry::create_token`]; only its
//! SHA-256 hash and a display prefix are kept. Validation runs against an
//! in-memory cache so revocation takes effect on the very next check.

use std::collections::HashMap;
use std::sync::Arc;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use super::glob::GlobPattern;
use crate::error::TokenError;
use crate::events::{EventBroadcaster, EventKind};
use crate::hub::protocol::WorkerMetadata;
use crate::store::QueueStore;

/// Prefix on every issued secret, so leaked tokens are recognizable.
const TOKEN_PREFIX: &str = "wkt_";

/// Characters of the secret kept for display.
const DISPLAY_PREFIX_LEN: usize = 12;

/// Breadth of access a token grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenScope {
    /// No restriction.
    Instance,
    /// Admits workers to one hub only.
    Group,
    /// Workers only receive tasks whose project matches a glob.
    Project,
}

impl TokenScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Instance => "instance",
            Self::Group => "group",
            Self::Project => "project",
        }
    }
}

impl std::str::FromStr for TokenScope {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "instance" => Ok(Self::Instance),
            "group" => Ok(Self::Group),
            "project" => Ok(Self::Project),
            _ => Err(format!("Unknown token scope: {s}")),
        }
    }
}

/// A stored worker credential. The secret itself is never kept.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerToken {
    pub id: String,
    pub name: String,
    pub token_prefix: String,
    /// Hex SHA-256 of the secret. Never serialized to clients.
    #[serde(skip)]
    pub token_hash: String,
    pub scope: TokenScope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hub_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_filter: Option<String>,
    /// Capability allow-list; `None` allows whatever the worker advertises.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Vec<String>>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
    pub registration_count: u64,
}

impl WorkerToken {
    /// A token is usable iff it is not revoked and not past its expiry.
    pub fn check_usable(&self, now: DateTime<Utc>) -> Result<(), TokenError> {
        if self.revoked_at.is_some() {
            return Err(TokenError::Revoked);
        }
        if self.expires_at.is_some_and(|at| at <= now) {
            return Err(TokenError::Expired);
        }
        Ok(())
    }

    fn decision(&self) -> Result<ScopeDecision, TokenError> {
        let project_filter = self
            .project_filter
            .as_deref()
            .map(GlobPattern::new)
            .transpose()
            .map_err(|e| TokenError::InvalidRequest(format!("stored project filter: {e}")))?;

        Ok(ScopeDecision {
            token_id: Some(self.id.clone()),
            scope: self.scope,
            hub_id: self.hub_id.clone(),
            project_filter,
            capabilities: self.capabilities.clone(),
            labels: self.labels.clone(),
        })
    }
}

/// Administrative request to mint a token.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTokenRequest {
    pub name: String,
    pub scope: TokenScope,
    #[serde(default)]
    pub hub_id: Option<String>,
    #[serde(default)]
    pub project_filter: Option<String>,
    #[serde(default)]
    pub capabilities: Option<Vec<String>>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl CreateTokenRequest {
    pub fn new(name: impl Into<String>, scope: TokenScope) -> Self {
        Self {
            name: name.into(),
            scope,
            hub_id: None,
            project_filter: None,
            capabilities: None,
            labels: HashMap::new(),
            expires_at: None,
        }
    }
}

/// Result of minting a token. `token` is the only copy of the secret.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedToken {
    pub id: String,
    pub token: String,
    pub prefix: String,
}

/// Constraints the hub enforces for a worker that authenticated.
#[derive(Debug, Clone)]
pub struct ScopeDecision {
    /// `None` for the hub's shared secret or anonymous workers.
    pub token_id: Option<String>,
    pub scope: TokenScope,
    pub hub_id: Option<String>,
    pub project_filter: Option<GlobPattern>,
    pub capabilities: Option<Vec<String>>,
    pub labels: HashMap<String, String>,
}

impl ScopeDecision {
    /// Instance-wide access with no token behind it.
    pub fn unrestricted() -> Self {
        Self {
            token_id: None,
            scope: TokenScope::Instance,
            hub_id: None,
            project_filter: None,
            capabilities: None,
            labels: HashMap::new(),
        }
    }

    /// Group tokens only admit workers to their own hub.
    pub fn admits_hub(&self, hub_id: &str) -> bool {
        self.scope != TokenScope::Group || self.hub_id.as_deref() == Some(hub_id)
    }

    /// A project filter never matches a task without a project.
    pub fn allows_project(&self, project: Option<&str>) -> bool {
        match &self.project_filter {
            None => true,
            Some(glob) => project.is_some_and(|p| glob.matches(p)),
        }
    }

    /// Intersect advertised capabilities with the token's allow-list.
    pub fn restrict_capabilities(&self, requested: Vec<String>) -> Vec<String> {
        match &self.capabilities {
            None => requested,
            Some(allowed) => requested
                .into_iter()
                .filter(|cap| allowed.contains(cap))
                .collect(),
        }
    }
}

/// Online/offline state of a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationStatus {
    Online,
    Offline,
}

impl RegistrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }
}

/// Audit record of one worker instance having joined under a token.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRegistration {
    pub id: String,
    pub token_id: String,
    pub hub_id: String,
    /// Hub connection id of the worker.
    pub worker_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub capabilities: Vec<String>,
    pub status: RegistrationStatus,
    pub connected_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disconnected_at: Option<DateTime<Utc>>,
    pub last_heartbeat: DateTime<Utc>,
}

impl WorkerRegistration {
    fn go_offline(&mut self, now: DateTime<Utc>) {
        self.status = RegistrationStatus::Offline;
        self.disconnected_at = Some(now);
    }
}

#[derive(Default)]
struct TokenCache {
    by_id: HashMap<String, WorkerToken>,
    /// Secret hash → token id.
    by_hash: HashMap<String, String>,
}

impl TokenCache {
    fn insert(&mut self, token: WorkerToken) {
        self.by_hash.insert(token.token_hash.clone(), token.id.clone());
        self.by_id.insert(token.id.clone(), token);
    }
}

/// Issues, validates, and revokes worker tokens.
pub struct TokenRegistry {
    store: Arc<dyn QueueStore>,
    events: EventBroadcaster,
    cache: RwLock<TokenCache>,
}

impl TokenRegistry {
    pub fn new(store: Arc<dyn QueueStore>, events: EventBroadcaster) -> Self {
        Self {
            store,
            events,
            cache: RwLock::new(TokenCache::default()),
        }
    }

    /// Load persisted tokens into the validation cache.
    pub async fn load(&self) -> Result<usize, TokenError> {
        let tokens = self.store.list_tokens().await?;
        let count = tokens.len();
        let mut cache = self.cache.write().await;
        for token in tokens {
            cache.insert(token);
        }
        Ok(count)
    }

    /// Mint a token. The returned secret is not recoverable afterwards.
    pub async fn create_token(&self, request: CreateTokenRequest) -> Result<CreatedToken, TokenError> {
        self.validate_request(&request).await?;

        let raw = generate_secret();
        let prefix: String = raw.chars().take(DISPLAY_PREFIX_LEN).collect();
        let token = WorkerToken {
            id: Uuid::new_v4().to_string(),
            name: request.name.trim().to_string(),
            token_prefix: prefix.clone(),
            token_hash: hash_secret(&raw),
            scope: request.scope,
            hub_id: request.hub_id,
            project_filter: request.project_filter,
            capabilities: request.capabilities,
            labels: request.labels,
            created_at: Utc::now(),
            expires_at: request.expires_at,
            last_used_at: None,
            revoked_at: None,
            registration_count: 0,
        };

        self.store.insert_token(&token).await?;
        let id = token.id.clone();
        info!(
            token_id = %id,
            prefix = %prefix,
            scope = token.scope.as_str(),
            "Created worker token"
        );
        self.cache.write().await.insert(token);

        Ok(CreatedToken {
            id,
            token: raw,
            prefix,
        })
    }

    async fn validate_request(&self, request: &CreateTokenRequest) -> Result<(), TokenError> {
        if request.name.trim().is_empty() {
            return Err(TokenError::InvalidRequest("name is required".into()));
        }
        if request.expires_at.is_some_and(|at| at <= Utc::now()) {
            return Err(TokenError::InvalidRequest("expiresAt is in the past".into()));
        }

        let has_hub = request.hub_id.as_deref().is_some_and(|h| !h.is_empty());
        let has_filter = request
            .project_filter
            .as_deref()
            .is_some_and(|p| !p.trim().is_empty());

        match request.scope {
            TokenScope::Instance => {
                if has_hub || has_filter {
                    return Err(TokenError::InvalidRequest(
                        "instance tokens take neither hubId nor projectFilter".into(),
                    ));
                }
            }
            TokenScope::Group => {
                let hub_id = request
                    .hub_id
                    .as_deref()
                    .filter(|_| has_hub)
                    .ok_or_else(|| TokenError::InvalidRequest("group tokens require hubId".into()))?;
                if has_filter {
                    return Err(TokenError::InvalidRequest(
                        "group tokens take no projectFilter".into(),
                    ));
                }
                if self.store.get_hub(hub_id).await?.is_none() {
                    return Err(TokenError::InvalidRequest(format!("unknown hub {hub_id}")));
                }
            }
            TokenScope::Project => {
                let filter = request.project_filter.as_deref().filter(|_| has_filter).ok_or_else(
                    || TokenError::InvalidRequest("project tokens require projectFilter".into()),
                )?;
                GlobPattern::new(filter)
                    .map_err(|e| TokenError::InvalidRequest(format!("invalid projectFilter: {e}")))?;
                if has_hub {
                    return Err(TokenError::InvalidRequest("project tokens take no hubId".into()));
                }
            }
        }
        Ok(())
    }

    /// Check a presented secret and return the scope it grants.
    pub async fn validate(&self, presented: &str) -> Result<ScopeDecision, TokenError> {
        let hash = hash_secret(presented);
        let cache = self.cache.read().await;
        let token = cache
            .by_hash
            .get(&hash)
            .and_then(|id| cache.by_id.get(id))
            .ok_or(TokenError::Unknown)?;

        token.check_usable(Utc::now())?;
        token.decision()
    }

    /// Re-check a token by id (used on every message from a token-scoped worker).
    pub async fn check_active(&self, token_id: &str) -> Result<(), TokenError> {
        let cache = self.cache.read().await;
        let token = cache.by_id.get(token_id).ok_or_else(|| TokenError::NotFound {
            id: token_id.to_string(),
        })?;
        token.check_usable(Utc::now())
    }

    /// Permanently revoke a token and take its registrations offline.
    pub async fn revoke(&self, token_id: &str) -> Result<WorkerToken, TokenError> {
        let now = Utc::now();
        let revoked = {
            let mut cache = self.cache.write().await;
            let token = cache
                .by_id
                .get_mut(token_id)
                .ok_or_else(|| TokenError::NotFound {
                    id: token_id.to_string(),
                })?;
            if token.revoked_at.is_some() {
                return Ok(token.clone());
            }
            token.revoked_at = Some(now);
            token.clone()
        };

        self.store.update_token(&revoked).await?;

        let online = self.store.list_online_registrations(token_id).await?;
        let closed = online.len();
        for mut registration in online {
            registration.go_offline(now);
            self.store.update_registration(&registration).await?;
        }

        info!(token_id = %token_id, registrations = closed, "Revoked worker token");
        self.events.emit(
            EventKind::TokenRevoked,
            serde_json::json!({
                "tokenId": revoked.id,
                "name": revoked.name,
                "registrationsClosed": closed,
            }),
        );
        Ok(revoked)
    }

    pub async fn get_token(&self, token_id: &str) -> Option<WorkerToken> {
        self.cache.read().await.by_id.get(token_id).cloned()
    }

    /// All tokens, oldest first.
    pub async fn list_tokens(&self) -> Vec<WorkerToken> {
        let mut tokens: Vec<WorkerToken> = self.cache.read().await.by_id.values().cloned().collect();
        tokens.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        tokens
    }

    /// Record a worker joining under a token and bump the token's usage counters.
    pub async fn record_registration(
        &self,
        token_id: &str,
        hub_id: &str,
        worker_id: &str,
        capabilities: &[String],
        metadata: &WorkerMetadata,
    ) -> Result<WorkerRegistration, TokenError> {
        let now = Utc::now();
        let registration = WorkerRegistration {
            id: Uuid::new_v4().to_string(),
            token_id: token_id.to_string(),
            hub_id: hub_id.to_string(),
            worker_id: worker_id.to_string(),
            system_id: metadata.system_id.clone(),
            hostname: metadata.hostname.clone(),
            labels: metadata.labels.clone(),
            capabilities: capabilities.to_vec(),
            status: RegistrationStatus::Online,
            connected_at: now,
            disconnected_at: None,
            last_heartbeat: now,
        };
        self.store.insert_registration(&registration).await?;

        let updated = {
            let mut cache = self.cache.write().await;
            cache.by_id.get_mut(token_id).map(|token| {
                token.registration_count += 1;
                token.last_used_at = Some(now);
                token.clone()
            })
        };
        if let Some(token) = updated {
            self.store.update_token(&token).await?;
        }

        Ok(registration)
    }

    /// Refresh a registration's heartbeat timestamp.
    pub async fn touch_registration(&self, registration_id: &str) -> Result<(), TokenError> {
        if let Some(mut registration) = self.store.get_registration(registration_id).await? {
            if registration.status == RegistrationStatus::Online {
                registration.last_heartbeat = Utc::now();
                self.store.update_registration(&registration).await?;
            }
        }
        Ok(())
    }

    /// Flip a registration offline. Registrations are never deleted.
    pub async fn close_registration(&self, registration_id: &str) -> Result<(), TokenError> {
        match self.store.get_registration(registration_id).await? {
            Some(mut registration) if registration.status == RegistrationStatus::Online => {
                registration.go_offline(Utc::now());
                self.store.update_registration(&registration).await?;
            }
            Some(_) => {}
            None => warn!(registration_id = %registration_id, "Closing unknown registration"),
        }
        Ok(())
    }

    pub async fn registrations_for_token(
        &self,
        token_id: &str,
    ) -> Result<Vec<WorkerRegistration>, TokenError> {
        Ok(self.store.list_registrations_by_token(token_id).await?)
    }

    pub async fn registrations_for_hub(
        &self,
        hub_id: &str,
    ) -> Result<Vec<WorkerRegistration>, TokenError> {
        Ok(self.store.list_registrations_by_hub(hub_id).await?)
    }
}

/// 32 random bytes, URL-safe base64, with the recognizable prefix.
fn generate_secret() -> String {
    let bytes: [u8; 32] = rand::random();
    format!("{TOKEN_PREFIX}{}", URL_SAFE_NO_PAD.encode(bytes))
}

/// Hex SHA-256 of a secret.
pub fn hash_secret(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    hex::encode(hasher.finalize())
}

/// Compare a presented credential to a configured secret without an early exit
/// on the first differing byte. Both sides are hashed first so lengths match.
pub fn secret_matches(expected: &str, given: &str) -> bool {
    let expected = Sha256::digest(expected.as_bytes());
    let given = Sha256::digest(given.as_bytes());
    expected
        .iter()
        .zip(given.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federation::hubs::{BUILTIN_HUB_ID, Hub};
    use crate::store::MemoryStore;

    async fn registry() -> (TokenRegistry, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        store.insert_hub(&Hub::builtin(BUILTIN_HUB_ID)).await.unwrap();
        let registry = TokenRegistry::new(store.clone(), EventBroadcaster::default());
        (registry, store)
    }

    #[test]
    fn secret_matches_only_identical_credentials() {
        assert!(secret_matches("hub-secret", "hub-secret"));
        assert!(!secret_matches("hub-secret", "hub-secreT"));
        assert!(!secret_matches("hub-secret", "hub-secret-longer"));
        assert!(!secret_matches("hub-secret", ""));
    }

    #[tokio::test]
    async fn secret_is_shown_once_and_only_hash_is_stored() {
        let (registry, store) = registry().await;
        let created = registry
            .create_token(CreateTokenRequest::new("ci", TokenScope::Instance))
            .await
            .unwrap();

        assert!(created.token.starts_with(TOKEN_PREFIX));
        assert!(created.token.starts_with(&created.prefix));

        let stored = store.get_token(&created.id).await.unwrap().unwrap();
        assert_ne!(stored.token_hash, created.token);
        assert_eq!(stored.token_hash, hash_secret(&created.token));

        let json = serde_json::to_value(&stored).unwrap();
        assert!(json.get("tokenHash").is_none());
    }

    #[tokio::test]
    async fn validate_returns_scope() {
        let (registry, _) = registry().await;
        let mut request = CreateTokenRequest::new("demo", TokenScope::Project);
        request.project_filter = Some("demo-*".into());
        request.capabilities = Some(vec!["summarize".into()]);
        let created = registry.create_token(request).await.unwrap();

        let decision = registry.validate(&created.token).await.unwrap();
        assert_eq!(decision.scope, TokenScope::Project);
        assert!(decision.allows_project(Some("demo-site")));
        assert!(!decision.allows_project(Some("other")));
        assert!(!decision.allows_project(None));
        assert_eq!(
            decision.restrict_capabilities(vec!["summarize".into(), "embedding".into()]),
            vec!["summarize".to_string()]
        );

        assert!(matches!(
            registry.validate("wkt_nope").await,
            Err(TokenError::Unknown)
        ));
    }

    #[tokio::test]
    async fn revocation_is_immediate_and_closes_registrations() {
        let (registry, store) = registry().await;
        let created = registry
            .create_token(CreateTokenRequest::new("w", TokenScope::Instance))
            .await
            .unwrap();

        let registration = registry
            .record_registration(
                &created.id,
                BUILTIN_HUB_ID,
                "worker-1",
                &["summarize".to_string()],
                &WorkerMetadata::default(),
            )
            .await
            .unwrap();
        assert!(registry.validate(&created.token).await.is_ok());

        registry.revoke(&created.id).await.unwrap();

        assert!(matches!(
            registry.validate(&created.token).await,
            Err(TokenError::Revoked)
        ));
        assert!(registry.check_active(&created.id).await.is_err());

        let stored = store.get_registration(&registration.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RegistrationStatus::Offline);
        assert!(stored.disconnected_at.is_some());

        let token = registry.get_token(&created.id).await.unwrap();
        assert_eq!(token.registration_count, 1);
        assert!(token.last_used_at.is_some());
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let (registry, store) = registry().await;
        let mut request = CreateTokenRequest::new("short", TokenScope::Instance);
        request.expires_at = Some(Utc::now() + chrono::Duration::milliseconds(50));
        let created = registry.create_token(request).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(80)).await;
        assert!(matches!(
            registry.validate(&created.token).await,
            Err(TokenError::Expired)
        ));

        // Reloading from the store keeps the hash-based lookup working.
        let reloaded = TokenRegistry::new(store, EventBroadcaster::default());
        assert_eq!(reloaded.load().await.unwrap(), 1);
        assert!(matches!(
            reloaded.validate(&created.token).await,
            Err(TokenError::Expired)
        ));
    }

    #[tokio::test]
    async fn scope_shape_is_validated() {
        let (registry, _) = registry().await;

        let missing_hub = CreateTokenRequest::new("g", TokenScope::Group);
        assert!(registry.create_token(missing_hub).await.is_err());

        let mut unknown_hub = CreateTokenRequest::new("g", TokenScope::Group);
        unknown_hub.hub_id = Some("nowhere".into());
        assert!(registry.create_token(unknown_hub).await.is_err());

        let mut group = CreateTokenRequest::new("g", TokenScope::Group);
        group.hub_id = Some(BUILTIN_HUB_ID.into());
        let created = registry.create_token(group).await.unwrap();
        let decision = registry.validate(&created.token).await.unwrap();
        assert!(decision.admits_hub(BUILTIN_HUB_ID));
        assert!(!decision.admits_hub("edge-1"));

        let missing_filter = CreateTokenRequest::new("p", TokenScope::Project);
        assert!(registry.create_token(missing_filter).await.is_err());

        let mut instance_with_hub = CreateTokenRequest::new("i", TokenScope::Instance);
        instance_with_hub.hub_id = Some(BUILTIN_HUB_ID.into());
        assert!(registry.create_token(instance_with_hub).await.is_err());
    }
}
