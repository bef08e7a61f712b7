//! Indexplane: control plane for per-project search indexes.
//!
//! Every lifecycle transition (build, refresh, delete, reschedule) flows
//! through a single control queue and is handled by the command dispatcher.
//! Build completions re-enter the queue as new commands, so each transition
//! is replayable and observable at the same boundary.

pub mod api;
pub mod blob;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod fleet;
pub mod logging;
pub mod model;
pub mod orchestrator;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod worker;

pub use error::{Error, Result};

/// Unique identifier of a registered project.
pub type ProjectId = String;

/// Monotonically increasing index version within a project.
pub type Version = u64;

/// Identifier of a build job tracked by the orchestrator.
pub type JobId = uuid::Uuid;

/// Identifier assigned by the control queue on send.
pub type MessageId = String;

/// Index of a query-serving slot within its class (`0..N`).
pub type SlotId = usize;
