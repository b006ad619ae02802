//! Worker orchestrator: task dispatch, worker hub, local worker processes,
//! hub federation, and live event fan-out.

pub mod api;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod federation;
pub mod hub;
pub mod orchestrator;
pub mod process;
pub mod store;
