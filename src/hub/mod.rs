//! Worker hub: authenticated worker connections, liveness, and assignment.

pub mod protocol;
pub mod registry;
pub mod worker;
pub mod ws;

pub use protocol::{ClientMessage, ServerMessage, WorkerMetadata};
pub use registry::{HubSignal, TaskReport, WorkerHub};
pub use worker::{ConnectedWorker, TerminationDecision, TerminationState, WorkerSnapshot};
pub use ws::worker_routes;
