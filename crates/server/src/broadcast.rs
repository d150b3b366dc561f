//! Snapshot fan-out.
//!
//! Each subscriber owns a bounded queue. Publishing never waits: a subscriber
//! whose queue is full is evicted and must resynchronize from
//! `Coordinator::get_snapshot` instead of replaying a partial backlog. Evicted
//! and dropped subscribers are reported back so the coordinator can mark the
//! participant disconnected.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::task::{Context, Poll};

use futures::Stream;
use parking_lot::Mutex;
use serde::Deserialize;
use strokesync_store::{SessionId, SessionSnapshot, UserId};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// Snapshots a subscriber may have queued before it is evicted.
    pub subscriber_buffer: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: 64,
        }
    }
}

/// Why a snapshot stream stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CloseReason {
    /// The session reached a terminal state. Queued snapshots, including the
    /// final one, are still delivered.
    SessionEnded = 1,
    Unsubscribed = 2,
    Disconnected = 3,
    /// The subscriber fell more than a full buffer behind.
    Lagged = 4,
    /// The same participant subscribed again.
    Replaced = 5,
}

impl CloseReason {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::SessionEnded),
            2 => Some(Self::Unsubscribed),
            3 => Some(Self::Disconnected),
            4 => Some(Self::Lagged),
            5 => Some(Self::Replaced),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SessionEnded => "session_ended",
            Self::Unsubscribed => "unsubscribed",
            Self::Disconnected => "disconnected",
            Self::Lagged => "lagged",
            Self::Replaced => "replaced",
        }
    }

    /// Whether the client must fetch a full snapshot before trusting its view.
    pub fn requires_resync(self) -> bool {
        matches!(self, Self::Lagged)
    }
}

#[derive(Debug, Default)]
struct SubscriberShared {
    close_reason: AtomicU8,
}

impl SubscriberShared {
    fn close(&self, reason: CloseReason) {
        // First reason wins.
        let _ = self.close_reason.compare_exchange(
            0,
            reason as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn reason(&self) -> Option<CloseReason> {
        CloseReason::from_u8(self.close_reason.load(Ordering::Acquire))
    }
}

#[derive(Debug)]
struct Subscriber {
    tx: mpsc::Sender<Arc<SessionSnapshot>>,
    shared: Arc<SubscriberShared>,
}

/// Ordered, non-restartable stream of snapshots for one participant.
#[derive(Debug)]
pub struct SnapshotStream {
    session_id: SessionId,
    user_id: UserId,
    rx: mpsc::Receiver<Arc<SessionSnapshot>>,
    shared: Arc<SubscriberShared>,
}

impl SnapshotStream {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// `None` while the stream is open.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.reason()
    }
}

impl Stream for SnapshotStream {
    type Item = Arc<SessionSnapshot>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.shared.reason() {
            None | Some(CloseReason::SessionEnded) => this.rx.poll_recv(cx),
            Some(_) => Poll::Ready(None),
        }
    }
}

/// Outcome of one [`Broadcaster::publish`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    /// Subscribers evicted for falling behind.
    pub lagged: usize,
    /// Subscribers whose stream had been dropped.
    pub closed: usize,
    /// Participants that lost their stream in this publish, lagged or closed.
    pub dropped: Vec<UserId>,
}

#[derive(Debug)]
pub struct Broadcaster {
    config: BroadcastConfig,
    sessions: Mutex<HashMap<SessionId, HashMap<UserId, Subscriber>>>,
}

impl Broadcaster {
    pub fn new(config: BroadcastConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Register `user_id` and queue `current` as its first item.
    ///
    /// An existing subscription for the same participant is closed with
    /// [`CloseReason::Replaced`].
    pub fn subscribe(
        &self,
        session_id: SessionId,
        user_id: UserId,
        current: Arc<SessionSnapshot>,
    ) -> SnapshotStream {
        let (tx, rx) = mpsc::channel(self.config.subscriber_buffer.max(1));
        let shared = Arc::new(SubscriberShared::default());
        // Fresh queue with capacity >= 1, cannot be full.
        let _ = tx.try_send(current);

        let previous = self.sessions.lock().entry(session_id).or_default().insert(
            user_id,
            Subscriber {
                tx,
                shared: Arc::clone(&shared),
            },
        );
        if let Some(previous) = previous {
            previous.shared.close(CloseReason::Replaced);
            debug!(session_id, user_id, "subscription replaced");
        }

        SnapshotStream {
            session_id,
            user_id,
            rx,
            shared,
        }
    }

    /// Queue `snapshot` for every subscriber of the session.
    pub fn publish(&self, session_id: SessionId, snapshot: &Arc<SessionSnapshot>) -> PublishReport {
        let mut report = PublishReport::default();
        let mut sessions = self.sessions.lock();
        let Some(subscribers) = sessions.get_mut(&session_id) else {
            return report;
        };

        subscribers.retain(|&user_id, subscriber| {
            match subscriber.tx.try_send(Arc::clone(snapshot)) {
                Ok(()) => {
                    report.delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    subscriber.shared.close(CloseReason::Lagged);
                    report.lagged += 1;
                    report.dropped.push(user_id);
                    warn!(
                        session_id,
                        user_id,
                        sequence = snapshot.sequence,
                        buffer = self.config.subscriber_buffer,
                        "subscriber lagged, evicting"
                    );
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    report.closed += 1;
                    report.dropped.push(user_id);
                    debug!(session_id, user_id, "subscriber stream dropped, pruning");
                    false
                }
            }
        });

        if subscribers.is_empty() {
            sessions.remove(&session_id);
        }
        report
    }

    /// Close one participant's stream. Returns whether it was subscribed.
    pub fn unsubscribe(&self, session_id: SessionId, user_id: UserId, reason: CloseReason) -> bool {
        let mut sessions = self.sessions.lock();
        let Some(subscribers) = sessions.get_mut(&session_id) else {
            return false;
        };
        let removed = subscribers.remove(&user_id);
        if subscribers.is_empty() {
            sessions.remove(&session_id);
        }

        match removed {
            Some(subscriber) => {
                subscriber.shared.close(reason);
                debug!(session_id, user_id, reason = reason.as_str(), "unsubscribed");
                true
            }
            None => false,
        }
    }

    /// Close every stream of a session with [`CloseReason::SessionEnded`].
    /// Returns how many were open.
    pub fn close_session(&self, session_id: SessionId) -> usize {
        let Some(subscribers) = self.sessions.lock().remove(&session_id) else {
            return 0;
        };
        for subscriber in subscribers.values() {
            subscriber.shared.close(CloseReason::SessionEnded);
        }
        subscribers.len()
    }

    pub fn subscriber_count(&self, session_id: SessionId) -> usize {
        self.sessions
            .lock()
            .get(&session_id)
            .map_or(0, HashMap::len)
    }
}
