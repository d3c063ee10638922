//! Session orchestration.
//!
//! Covers workspace checkouts, the session lifecycle, the registry of
//! attached runners, and reconciliation against the container engine.

pub mod lifecycle;
pub mod logs;
pub mod reconciler;
pub mod runners;
pub mod workspace;

pub use lifecycle::{CreateSession, Provisioning, SessionManager};
pub use reconciler::{spawn_reconciler, ReconcileReport};
pub use workspace::{GitWorkspaces, WorkspaceProvider};
