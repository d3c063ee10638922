//! Runner control channel.
//!
//! The in-container runner serves JSON-line commands on a local socket; the
//! orchestrator reaches it through the bind-mounted session data directory.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::{EventStream, RunnerClient};
pub use protocol::{ControlRequest, ControlResponse};
pub use server::{spawn_control_server, ControlState};
