#![forbid(unsafe_code)]

//! Container-backed coding-agent sessions.
//!
//! The orchestrator (`agent-fleet`) owns session records, containers, and
//! the HTTP API. Inside every session container a runner
//! (`agent-fleet-runner`) drives the agent CLI, sequences its output into a
//! message log, and serves a local control socket.

pub mod agent;
pub mod api;
pub mod bootstrap;
pub mod config;
pub mod errors;
pub mod events;
pub mod ipc;
pub mod locks;
pub mod models;
pub mod orchestrator;
pub mod persistence;
pub mod runtime;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
