//! Driving one agent CLI process per query inside the session container.

pub mod parser;
pub mod process;
pub mod runner;

pub use runner::{AgentRunner, RunnerStatus};
