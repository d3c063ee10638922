//! Reconciliation of session records against the container engine.
//!
//! Runs once at startup and then on a fixed interval. Drift is never an
//! error: it is resolved by a status transition written with an optimistic
//! check on the stored status and container id, so a pass never clobbers a
//! concurrent user-initiated transition. Sessions whose lock is held are
//! skipped and picked up on the next pass.

use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::lifecycle::SessionManager;
use crate::models::session::{Session, SessionStatus};
use crate::runtime::ContainerState;
use crate::Result;

/// Status message of a running session whose container went away.
pub const CONTAINER_GONE_MESSAGE: &str =
    "Container is no longer running; the session was stopped.";
/// Status message of a creating session whose provisioning never finished.
pub const PROVISIONING_INTERRUPTED_MESSAGE: &str =
    "Provisioning was interrupted before the container started.";

/// Counters of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    /// Sessions inspected.
    pub checked: usize,
    /// Status transitions written.
    pub transitions: usize,
    /// Runners re-attached in still-running containers.
    pub reattached: usize,
    /// Orphaned containers stopped and removed.
    pub orphans_removed: usize,
    /// Sessions or containers whose check failed.
    pub failures: usize,
}

enum Outcome {
    Unchanged,
    Reattached,
    Transitioned,
}

impl SessionManager {
    /// Run one reconciliation pass. Failures are counted and logged, never
    /// propagated; one session's failure does not stop the others.
    pub async fn reconcile_once(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        match self
            .repo
            .list_by_status(&[SessionStatus::Creating, SessionStatus::Running])
            .await
        {
            Ok(sessions) => {
                for session in sessions {
                    report.checked += 1;
                    let Some(_guard) = self.locks.try_lock(&session.id) else {
                        debug!(session_id = %session.id, "session busy, skipping");
                        continue;
                    };
                    let span = info_span!("reconcile_session", session_id = %session.id);
                    match self.reconcile_session(&session.id).instrument(span).await {
                        Ok(Outcome::Unchanged) => {}
                        Ok(Outcome::Reattached) => report.reattached += 1,
                        Ok(Outcome::Transitioned) => report.transitions += 1,
                        Err(err) => {
                            warn!(session_id = %session.id, %err, "session reconciliation failed");
                            report.failures += 1;
                        }
                    }
                }
            }
            Err(err) => {
                warn!(%err, "failed to list sessions for reconciliation");
                report.failures += 1;
            }
        }

        self.remove_orphans(&mut report).await;
        report
    }

    async fn reconcile_session(&self, session_id: &str) -> Result<Outcome> {
        // Re-read under the lock; the listing may be stale.
        let session = self.repo.get_by_id(session_id).await?;
        let state = match &session.container_id {
            Some(container_id) => self.runtime.inspect(container_id).await?,
            None => ContainerState::NotFound,
        };

        match (session.status, session.container_id.as_deref(), state) {
            (SessionStatus::Running, Some(container_id), ContainerState::Running) => {
                let attached = self.runners.is_attached(session_id, container_id);
                if attached && self.runners.client_for(session_id).health().await.is_ok() {
                    return Ok(Outcome::Unchanged);
                }
                self.ensure_runner(session_id, container_id).await?;
                Ok(if attached {
                    Outcome::Unchanged
                } else {
                    info!(%container_id, "runner re-attached");
                    Outcome::Reattached
                })
            }
            (SessionStatus::Running, _, _) => {
                self.runners.detach(session_id);
                self.drift(&session, SessionStatus::Stopped, Some(CONTAINER_GONE_MESSAGE))
                    .await
            }
            (SessionStatus::Creating, Some(container_id), ContainerState::Running) => {
                self.ensure_runner(session_id, container_id).await?;
                self.drift(&session, SessionStatus::Running, None).await
            }
            (SessionStatus::Creating, _, _) => {
                self.drift(
                    &session,
                    SessionStatus::Error,
                    Some(PROVISIONING_INTERRUPTED_MESSAGE),
                )
                .await
            }
            _ => Ok(Outcome::Unchanged),
        }
    }

    async fn drift(
        &self,
        session: &Session,
        next: SessionStatus,
        message: Option<&str>,
    ) -> Result<Outcome> {
        let Some(updated) = self
            .repo
            .transition_if(
                &session.id,
                session.status,
                session.container_id.as_deref(),
                next,
                message,
            )
            .await?
        else {
            debug!("session changed concurrently, leaving it");
            return Ok(Outcome::Unchanged);
        };

        info!(from = %session.status, to = %next, "session drift resolved");
        self.dispatcher.publish_session(&updated);
        Ok(Outcome::Transitioned)
    }

    async fn remove_orphans(&self, report: &mut ReconcileReport) {
        let containers = match self.runtime.list_managed().await {
            Ok(containers) => containers,
            Err(err) => {
                warn!(%err, "failed to list managed containers");
                report.failures += 1;
                return;
            }
        };

        for container in containers {
            let owner = match &container.session_id {
                Some(session_id) => match self.repo.find(session_id).await {
                    Ok(owner) => owner,
                    Err(err) => {
                        warn!(
                            container_id = %container.id,
                            %err,
                            "failed to look up container owner"
                        );
                        report.failures += 1;
                        continue;
                    }
                },
                None => None,
            };

            let orphan = match &owner {
                None => true,
                Some(session) if session.is_archived() => true,
                Some(session) => {
                    session.container_id.as_deref() != Some(container.id.as_str())
                        && !self.locks.is_locked(&session.id)
                }
            };
            if !orphan {
                continue;
            }

            info!(
                container_id = %container.id,
                name = %container.name,
                "removing orphaned container"
            );
            if container.state == ContainerState::Running {
                if let Err(err) = self
                    .runtime
                    .stop(&container.id, self.config.stop_grace())
                    .await
                {
                    warn!(container_id = %container.id, %err, "failed to stop orphan");
                }
            }
            match self.runtime.remove(&container.id, true).await {
                Ok(()) => report.orphans_removed += 1,
                Err(err) => {
                    warn!(container_id = %container.id, %err, "failed to remove orphan");
                    report.failures += 1;
                }
            }
        }
    }
}

/// Run [`SessionManager::reconcile_once`] every `interval` until cancelled.
///
/// The first pass happens one `interval` after the call; run the startup
/// pass explicitly before spawning.
#[must_use]
pub fn spawn_reconciler(
    manager: SessionManager,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        info!("reconciler shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        let report = manager.reconcile_once().await;
                        if report.transitions + report.orphans_removed + report.failures > 0 {
                            info!(?report, "reconciliation pass");
                        } else {
                            debug!(?report, "reconciliation pass");
                        }
                    }
                }
            }
        }
        .instrument(info_span!("reconciler")),
    )
}
