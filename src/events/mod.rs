//! Event fan-out for live dashboards.

pub mod broadcaster;
pub mod ws;

pub use broadcaster::{ChannelFilter, EventBroadcaster, EventKind, OrchestratorEvent};
