//! Live session ownership.
//!
//! Each session sits behind its own async mutex, so mutations of one session
//! are serialized while different sessions proceed in parallel. The latest
//! committed snapshot is also published into a `watch` channel, which lets
//! readers skip the mutex entirely.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use strokesync_replay::{LogEntry, LogHeader, LogRecorder};
use strokesync_store::{
    LifecycleState, SessionId, SessionSnapshot, SessionState, StoreError, Timestamp,
};
use tokio::sync::{Mutex, MutexGuard, watch};

use crate::broadcast::{Broadcaster, PublishReport};
use crate::error::{CoordinatorError, Result};
use crate::intake::IntakeTracker;
use crate::validation::ValidationConfig;

/// Mutable per-session data, guarded by [`SessionHandle`].
#[derive(Debug)]
pub struct SessionEntry {
    pub state: SessionState,
    pub recorder: LogRecorder,
    pub intake: IntakeTracker,
    /// When the session last became Active/Paused with nobody connected.
    unattended_since: Option<Timestamp>,
}

impl SessionEntry {
    pub fn new(state: SessionState, validation: ValidationConfig) -> Self {
        Self {
            recorder: LogRecorder::new(
                LogHeader::of(&state).with_payload_limits(validation.payload_limits()),
            ),
            intake: IntakeTracker::new(validation),
            state,
            unattended_since: None,
        }
    }

    /// Apply a mutation and record it if it changed anything.
    ///
    /// Returns whether the state changed. A rejected mutation leaves both the
    /// state and the log untouched.
    pub fn apply(&mut self, entry: LogEntry) -> Result<bool, StoreError> {
        let before = self.state.revision();
        entry.apply(&mut self.state)?;
        if self.state.revision() == before {
            return Ok(false);
        }
        let at = entry.at();
        self.recorder.record(entry);
        self.refresh_attendance(at);
        Ok(true)
    }

    fn refresh_attendance(&mut self, now: Timestamp) {
        let running = matches!(
            self.state.state(),
            LifecycleState::Active | LifecycleState::Paused
        );
        self.unattended_since = if running && self.state.connected_count() == 0 {
            Some(self.unattended_since.unwrap_or(now))
        } else {
            None
        };
    }

    pub fn unattended_since(&self) -> Option<Timestamp> {
        self.unattended_since
    }

    /// Nobody has been connected for at least `timeout_ms`.
    pub fn is_unattended_for(&self, now: Timestamp, timeout_ms: u64) -> bool {
        self.unattended_since
            .is_some_and(|since| now.saturating_sub(since) >= timeout_ms)
    }
}

#[derive(Debug)]
pub struct SessionHandle {
    id: SessionId,
    entry: Mutex<SessionEntry>,
    latest: watch::Sender<Arc<SessionSnapshot>>,
}

impl SessionHandle {
    pub fn new(entry: SessionEntry) -> Self {
        let (latest, _) = watch::channel(Arc::new(entry.state.snapshot()));
        Self {
            id: entry.state.id(),
            entry: Mutex::new(entry),
            latest,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Wait for exclusive access. Fails once the session is terminal.
    pub async fn lock(&self, operation: &'static str) -> Result<MutexGuard<'_, SessionEntry>> {
        let entry = self.entry.lock().await;
        let state = entry.state.state();
        if state.is_terminal() {
            return Err(CoordinatorError::SessionClosed {
                session_id: self.id,
                state,
                operation,
            });
        }
        Ok(entry)
    }

    /// Latest committed snapshot; never waits on in-flight mutations.
    pub fn latest(&self) -> Arc<SessionSnapshot> {
        Arc::clone(&self.latest.borrow())
    }

    /// Publish the entry's current state. Call with the entry lock held so
    /// subscribers observe snapshots in commit order.
    pub fn commit(
        &self,
        entry: &SessionEntry,
        broadcaster: &Broadcaster,
    ) -> (Arc<SessionSnapshot>, PublishReport) {
        let snapshot = Arc::new(entry.state.snapshot());
        self.latest.send_replace(Arc::clone(&snapshot));
        let report = broadcaster.publish(self.id, &snapshot);
        (snapshot, report)
    }
}

/// Result of looking a session up in the arena.
#[derive(Debug)]
pub enum Lookup {
    Live(Arc<SessionHandle>),
    /// Terminated; carries the terminal state.
    Ended(LifecycleState),
    Unknown,
}

/// Registry of live sessions plus a bounded record of ended ones.
#[derive(Debug)]
pub struct SessionArena {
    live: HashMap<SessionId, Arc<SessionHandle>>,
    ended: HashMap<SessionId, LifecycleState>,
    ended_order: VecDeque<SessionId>,
    tombstone_capacity: usize,
    next_id: SessionId,
}

impl SessionArena {
    pub fn new(tombstone_capacity: usize) -> Self {
        Self {
            live: HashMap::new(),
            ended: HashMap::new(),
            ended_order: VecDeque::new(),
            tombstone_capacity,
            next_id: 1,
        }
    }

    pub fn allocate_id(&mut self) -> SessionId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn insert(&mut self, handle: Arc<SessionHandle>) {
        self.live.insert(handle.id(), handle);
    }

    pub fn lookup(&self, session_id: SessionId) -> Lookup {
        if let Some(handle) = self.live.get(&session_id) {
            return Lookup::Live(Arc::clone(handle));
        }
        match self.ended.get(&session_id) {
            Some(&state) => Lookup::Ended(state),
            None => Lookup::Unknown,
        }
    }

    /// Drop a terminated session and remember how it ended.
    pub fn retire(&mut self, session_id: SessionId, final_state: LifecycleState) {
        if self.live.remove(&session_id).is_none() {
            return;
        }
        if self.tombstone_capacity == 0 {
            return;
        }
        while self.ended_order.len() >= self.tombstone_capacity {
            if let Some(oldest) = self.ended_order.pop_front() {
                self.ended.remove(&oldest);
            }
        }
        self.ended.insert(session_id, final_state);
        self.ended_order.push_back(session_id);
    }

    pub fn live_handles(&self) -> Vec<Arc<SessionHandle>> {
        self.live.values().cloned().collect()
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn ended_count(&self) -> usize {
        self.ended.len()
    }
}
