//! Event dispatcher with cursor-based catch-up.
//!
//! A subscriber is registered before the log is replayed, so nothing
//! published during the replay can fall between the two. Live complete
//! messages at or below the replay cursor are discarded, which makes the
//! hand-over exactly-once. Partials are coalesced to the newest one
//! available when the subscriber asks for its next event.
//!
//! Publishing never blocks: each subscriber owns a bounded buffer and is
//! dropped once that buffer is full. A dropped subscriber receives a final
//! `{lagged, resumeAfter}` event so it can reconnect from its cursor.
//!
//! The dispatcher also remembers the highest message sequence published per
//! session, which lets a relay that feeds it pick up where the previous one
//! stopped.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::models::event::{PartialMessage, StreamEvent};
use crate::models::message::MessageRange;
use crate::models::session::Session;
use crate::persistence::message_log::MessageLog;
use crate::Result;

const REPLAY_PAGE: u32 = 200;
const UPDATES_CAPACITY: usize = 1024;

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<StreamEvent>,
    /// Sequence the subscriber already holds; it needs everything above.
    floor: i64,
}

#[derive(Default)]
struct Topic {
    subscribers: Vec<Subscriber>,
    /// Highest complete-message sequence published so far.
    published: i64,
}

struct Inner {
    sessions: Mutex<HashMap<String, Topic>>,
    next_id: AtomicU64,
    buffer: usize,
    updates: broadcast::Sender<Session>,
}

/// Fan-out hub keyed by session id. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    /// Create a dispatcher whose subscribers each buffer up to `buffer` events.
    #[must_use]
    pub fn new(buffer: usize) -> Self {
        let (updates, _) = broadcast::channel(UPDATES_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                sessions: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                buffer: buffer.max(1),
                updates,
            }),
        }
    }

    /// Deliver `event` to every live subscriber of `session_id`.
    ///
    /// Subscribers whose buffer is full or whose receiver is gone are removed.
    pub fn publish(&self, session_id: &str, event: &StreamEvent) {
        let mut sessions = self
            .inner
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(sequence) = event.sequence() {
            let topic = sessions.entry(session_id.to_owned()).or_default();
            topic.published = topic.published.max(sequence);
        }
        let Some(topic) = sessions.get_mut(session_id) else {
            return;
        };

        topic.subscribers.retain(|sub| match sub.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(session_id, subscriber = sub.id, "subscriber buffer full, dropping subscriber");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(session_id, subscriber = sub.id, "subscriber gone");
                false
            }
        });

        if topic.subscribers.is_empty() && topic.published == 0 {
            sessions.remove(session_id);
        }
    }

    /// Publish a session record change to that session's subscribers and
    /// to the global update feed.
    pub fn publish_session(&self, session: &Session) {
        self.publish(
            &session.id,
            &StreamEvent::Session {
                session: session.clone(),
            },
        );
        // No receivers is fine.
        let _ = self.inner.updates.send(session.clone());
    }

    /// Receive every session record change across all sessions.
    #[must_use]
    pub fn subscribe_updates(&self) -> broadcast::Receiver<Session> {
        self.inner.updates.subscribe()
    }

    /// Subscribe to `session_id`, replaying persisted messages after `after`
    /// from `log` before live delivery.
    ///
    /// Without a log only live events are delivered, still filtered by `after`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the replay cannot be read.
    pub async fn subscribe(
        &self,
        session_id: &str,
        after: i64,
        log: Option<&MessageLog>,
    ) -> Result<Subscription> {
        let (id, rx) = self.register(session_id, after);

        let mut replay = VecDeque::new();
        let mut cursor = after;
        if let Some(log) = log {
            loop {
                let page = log
                    .get_range(session_id, MessageRange::after(cursor, REPLAY_PAGE))
                    .await?;
                for message in page.messages {
                    cursor = message.sequence;
                    replay.push_back(StreamEvent::message(message));
                }
                if !page.has_more {
                    break;
                }
            }
            self.raise_floor(session_id, id, cursor);
        }

        debug!(session_id, after, replayed = replay.len(), "subscriber registered");
        Ok(Subscription {
            replay,
            rx,
            cursor,
            pending: None,
            closed: false,
        })
    }

    /// Subscribe to events published from now on, without replay.
    #[must_use]
    pub fn subscribe_live(&self, session_id: &str) -> Subscription {
        Subscription {
            replay: VecDeque::new(),
            rx: self.register(session_id, 0).1,
            cursor: 0,
            pending: None,
            closed: false,
        }
    }

    /// Number of live subscribers for `session_id`.
    #[must_use]
    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.inner
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .map_or(0, |topic| topic.subscribers.len())
    }

    /// Sequence after which a feed into this dispatcher should resume.
    ///
    /// Once messages have been published that is the highest one. Before
    /// that, waiting subscribers may need messages below `persisted`, so the
    /// lowest sequence any of them holds wins.
    #[must_use]
    pub fn resume_point(&self, session_id: &str, persisted: i64) -> i64 {
        let sessions = self
            .inner
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match sessions.get(session_id) {
            Some(topic) if topic.published > 0 => topic.published,
            Some(topic) => topic
                .subscribers
                .iter()
                .map(|sub| sub.floor)
                .fold(persisted, i64::min),
            None => persisted,
        }
    }

    fn register(&self, session_id: &str, floor: i64) -> (u64, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(self.inner.buffer);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(session_id.to_owned())
            .or_default()
            .subscribers
            .push(Subscriber { id, tx, floor });
        (id, rx)
    }

    fn raise_floor(&self, session_id: &str, id: u64, floor: i64) {
        let mut sessions = self
            .inner
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let subscriber = sessions
            .get_mut(session_id)
            .and_then(|topic| topic.subscribers.iter_mut().find(|sub| sub.id == id));
        if let Some(subscriber) = subscriber {
            subscriber.floor = subscriber.floor.max(floor);
        }
    }
}

/// One subscriber's ordered view of a session stream.
pub struct Subscription {
    replay: VecDeque<StreamEvent>,
    rx: mpsc::Receiver<StreamEvent>,
    cursor: i64,
    pending: Option<StreamEvent>,
    closed: bool,
}

impl Subscription {
    /// Highest complete-message sequence delivered or queued for replay.
    #[must_use]
    pub fn cursor(&self) -> i64 {
        self.cursor
    }

    /// Next event, or `None` once the subscription has ended.
    ///
    /// When the dispatcher drops this subscriber (buffer overflow) a final
    /// non-terminal `{lagged, resumeAfter}` event carrying the cursor is
    /// yielded so the consumer can reconnect from it.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        if let Some(event) = self.replay.pop_front() {
            return Some(event);
        }

        loop {
            let event = match self.pending.take() {
                Some(event) => event,
                None => match self.rx.recv().await {
                    Some(event) => event,
                    None => return self.close(),
                },
            };

            match event {
                StreamEvent::Message { sequence, .. } if sequence <= self.cursor => {}
                StreamEvent::Message { sequence, .. } => {
                    self.cursor = sequence;
                    return Some(event);
                }
                StreamEvent::Partial { partial } => {
                    if let Some(latest) = self.coalesce(partial) {
                        return Some(StreamEvent::Partial { partial: latest });
                    }
                }
                other => return Some(other),
            }
        }
    }

    /// Keep only the newest immediately available partial.
    fn coalesce(&mut self, first: PartialMessage) -> Option<PartialMessage> {
        let mut latest = first;
        loop {
            match self.rx.try_recv() {
                Ok(StreamEvent::Partial { partial }) => latest = partial,
                Ok(other) => {
                    self.pending = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        // A partial previewing an already delivered or queued slot is stale.
        let superseded = matches!(
            self.pending,
            Some(StreamEvent::Message { sequence, .. }) if sequence >= latest.sequence
        );
        (latest.sequence > self.cursor && !superseded).then_some(latest)
    }

    fn close(&mut self) -> Option<StreamEvent> {
        if self.closed {
            return None;
        }
        self.closed = true;
        Some(StreamEvent::lagged(self.cursor))
    }
}
