//! In-memory registry of attached runners.
//!
//! Never persisted: reconciliation rebuilds it after an orchestrator
//! restart by probing each running container for its runner process.
//! Every attached runner gets a relay task that subscribes to the runner's
//! control channel and republishes its events into the orchestrator's
//! [`Dispatcher`]. A relay starts after the last sequence the dispatcher has
//! seen, falling back to the host log, so messages the runner persisted
//! while nothing was attached still reach waiting subscribers.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::logs::LogStore;
use crate::events::Dispatcher;
use crate::ipc::RunnerClient;
use crate::models::event::StreamEvent;

/// Delay before a relay reconnects to its runner.
const RELAY_RETRY: Duration = Duration::from_secs(1);

/// Socket file name inside the session data directory.
pub const RUNNER_SOCKET_FILE: &str = "runner.sock";

struct RunnerLink {
    container_id: String,
    pid: Option<u32>,
    client: RunnerClient,
    cancel: CancellationToken,
    relay: JoinHandle<()>,
}

/// Session id → attached runner.
#[derive(Clone)]
pub struct RunnerRegistry {
    links: Arc<Mutex<HashMap<String, RunnerLink>>>,
    dispatcher: Dispatcher,
    logs: LogStore,
    data_root: PathBuf,
}

impl RunnerRegistry {
    /// Registry relaying into `dispatcher`, resuming relays from `logs`.
    #[must_use]
    pub fn new(dispatcher: Dispatcher, logs: LogStore, data_root: impl Into<PathBuf>) -> Self {
        Self {
            links: Arc::new(Mutex::new(HashMap::new())),
            dispatcher,
            logs,
            data_root: data_root.into(),
        }
    }

    /// Host path of the control socket for `session_id`.
    #[must_use]
    pub fn socket_path(&self, session_id: &str) -> PathBuf {
        self.data_root.join(session_id).join(RUNNER_SOCKET_FILE)
    }

    /// Client for the control socket of `session_id`, attached or not.
    #[must_use]
    pub fn client_for(&self, session_id: &str) -> RunnerClient {
        RunnerClient::new(self.socket_path(session_id))
    }

    /// Attach the runner of `session_id` living in `container_id`.
    ///
    /// Re-attaching the same container keeps the existing relay; a different
    /// container replaces it.
    pub fn attach(&self, session_id: &str, container_id: &str, pid: Option<u32>) -> RunnerClient {
        let mut links = self.lock();
        if let Some(link) = links.get_mut(session_id) {
            if link.container_id == container_id && !link.relay.is_finished() {
                if pid.is_some() {
                    link.pid = pid;
                }
                return link.client.clone();
            }
        }

        let client = self.client_for(session_id);
        let cancel = CancellationToken::new();
        let relay = tokio::spawn(
            relay(
                session_id.to_owned(),
                client.clone(),
                self.dispatcher.clone(),
                self.logs.clone(),
                cancel.clone(),
            )
            .instrument(info_span!("runner_relay", session_id, container_id)),
        );
        info!(session_id, container_id, ?pid, "runner attached");

        let previous = links.insert(
            session_id.to_owned(),
            RunnerLink {
                container_id: container_id.to_owned(),
                pid,
                client: client.clone(),
                cancel,
                relay,
            },
        );
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }
        client
    }

    /// Forget the runner of `session_id` and stop its relay.
    pub fn detach(&self, session_id: &str) -> bool {
        let Some(link) = self.lock().remove(session_id) else {
            return false;
        };
        link.cancel.cancel();
        info!(session_id, container_id = %link.container_id, "runner detached");
        true
    }

    /// Client of the attached runner, if any.
    #[must_use]
    pub fn client(&self, session_id: &str) -> Option<RunnerClient> {
        self.lock().get(session_id).map(|link| link.client.clone())
    }

    /// Whether a runner in `container_id` is attached for `session_id`.
    #[must_use]
    pub fn is_attached(&self, session_id: &str, container_id: &str) -> bool {
        self.lock()
            .get(session_id)
            .is_some_and(|link| link.container_id == container_id && !link.relay.is_finished())
    }

    /// Probed process id of the attached runner.
    #[must_use]
    pub fn pid(&self, session_id: &str) -> Option<u32> {
        self.lock().get(session_id).and_then(|link| link.pid)
    }

    /// Session ids with an attached runner.
    #[must_use]
    pub fn attached(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Stop every relay.
    pub fn shutdown(&self) {
        for (_, link) in self.lock().drain() {
            link.cancel.cancel();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, RunnerLink>> {
        self.links.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Republish one runner's events until cancelled, reconnecting with the
/// last relayed sequence as cursor.
///
/// A `lagged` notice from the runner means this relay fell behind; it
/// reconnects at once instead of forwarding the notice.
async fn relay(
    session_id: String,
    client: RunnerClient,
    dispatcher: Dispatcher,
    logs: LogStore,
    cancel: CancellationToken,
) {
    let persisted = logs.last_sequence(&session_id).await;
    let mut after = dispatcher.resume_point(&session_id, persisted);
    loop {
        let connected = tokio::select! {
            () = cancel.cancelled() => return,
            connected = client.subscribe(after) => connected,
        };

        match connected {
            Ok(mut events) => {
                debug!(after, "relay connected");
                let mut lagged = false;
                loop {
                    let next = tokio::select! {
                        () = cancel.cancelled() => return,
                        next = events.next() => next,
                    };
                    match next {
                        Ok(Some(StreamEvent::Lagged { resume_after, .. })) => {
                            warn!(after, resume_after, "relay lagged behind runner");
                            lagged = true;
                            break;
                        }
                        Ok(Some(event)) => {
                            if let Some(sequence) = event.sequence() {
                                after = after.max(sequence);
                            }
                            dispatcher.publish(&session_id, &event);
                        }
                        Ok(None) => break,
                        Err(err) => {
                            debug!(%err, "relay stream ended");
                            break;
                        }
                    }
                }
                if lagged {
                    continue;
                }
            }
            Err(err) => debug!(%err, "runner not reachable"),
        }

        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(RELAY_RETRY) => {}
        }
    }
}
