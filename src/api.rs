//! HTTP API for the control plane.
//!
//! Lets clients enqueue control commands, register projects, inspect index
//! versions and fleet slots, and resolve query routing.

mod commands;
mod fleet;
mod projects;
mod server;
mod state;

pub use server::{router, start_http_server};
pub use state::ApiState;
