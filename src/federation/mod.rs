//! Hub federation and token-scoped worker authentication.

pub mod glob;
pub mod hubs;
pub mod tokens;

pub use glob::GlobPattern;
pub use hubs::{
    BUILTIN_HUB_ID, CreateHubRequest, Hub, HubHealth, HubHeartbeat, HubRegistry, HubType,
    derive_health,
};
pub use tokens::{
    CreateTokenRequest, CreatedToken, RegistrationStatus, ScopeDecision, TokenRegistry,
    TokenScope, WorkerRegistration, WorkerToken, secret_matches,
};
