//! Strokesync Coordinator
//!
//! Coordinates live rowing sessions. It owns:
//! - The registry of live sessions and their canonical state
//! - Telemetry ingestion: validation, sequencing and server timestamps
//! - Snapshot fan-out to subscribed participants
//! - The session lifecycle, including abandonment of unattended sessions
//! - The session log handed to the archive when a session ends
//!
//! # Concurrency
//!
//! All mutations of one session are serialized behind that session's lock;
//! different sessions never contend. Snapshot reads are served from the
//! latest committed state and never wait for in-flight mutations.

#![deny(unsafe_code)]

pub mod archive;
pub mod broadcast;
pub mod clock;
pub mod config;
pub mod error;
pub mod intake;
pub mod lifecycle;
pub mod session;
pub mod validation;

use std::sync::Arc;

use parking_lot::RwLock;
use strokesync_replay::LogEntry;
use strokesync_store::{LifecycleState, SessionId, SessionSnapshot, TelemetryEvent, UserId};
use strokesync_wire::RawTelemetryProto;
use tracing::{debug, info, warn};

pub use archive::{
    FileArchive, FinishedSession, MemoryArchive, NullArchive, SessionArchive, TeeArchive,
};
pub use broadcast::{BroadcastConfig, CloseReason, PublishReport, SnapshotStream};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, ServerConfig};
pub use error::{CoordinatorError, Result};
pub use lifecycle::LifecycleConfig;
pub use validation::{ValidationConfig, ValidationError};

use broadcast::Broadcaster;
use session::{Lookup, SessionArena, SessionEntry, SessionHandle};
use validation::validate_submission;

// ============================================================================
// Session End Reason
// ============================================================================

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    Completed,
    Abandoned,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Abandoned => "abandoned",
        }
    }

    /// Terminal lifecycle state for this reason.
    pub fn state(&self) -> LifecycleState {
        match self {
            Self::Completed => LifecycleState::Completed,
            Self::Abandoned => LifecycleState::Abandoned,
        }
    }

    fn operation(&self) -> &'static str {
        match self {
            Self::Completed => "complete",
            Self::Abandoned => "abandon",
        }
    }
}

// ============================================================================
// Coordinator
// ============================================================================

pub struct Coordinator {
    config: ServerConfig,
    arena: RwLock<SessionArena>,
    broadcaster: Broadcaster,
    archive: Arc<dyn SessionArchive>,
    clock: Arc<dyn Clock>,
}

impl Coordinator {
    /// Coordinator on the system clock. Finished sessions are written under
    /// `config.archive_dir` when set, otherwise dropped.
    pub fn new(config: ServerConfig) -> Self {
        let archive: Arc<dyn SessionArchive> = match &config.archive_dir {
            Some(dir) => Arc::new(FileArchive::new(dir)),
            None => Arc::new(NullArchive),
        };
        Self::with_parts(config, Arc::new(SystemClock), archive)
    }

    pub fn with_parts(
        config: ServerConfig,
        clock: Arc<dyn Clock>,
        archive: Arc<dyn SessionArchive>,
    ) -> Self {
        Self {
            arena: RwLock::new(SessionArena::new(config.lifecycle.tombstone_capacity)),
            broadcaster: Broadcaster::new(config.broadcast),
            archive,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn live_session_count(&self) -> usize {
        self.arena.read().live_count()
    }

    pub fn subscriber_count(&self, session_id: SessionId) -> usize {
        self.broadcaster.subscriber_count(session_id)
    }

    /// Latest committed snapshot. Does not wait for in-flight mutations.
    ///
    /// Terminated sessions are reported as not found.
    pub fn get_snapshot(&self, session_id: SessionId) -> Result<Arc<SessionSnapshot>> {
        let lookup = self.arena.read().lookup(session_id);
        match lookup {
            Lookup::Live(handle) => {
                let snapshot = handle.latest();
                if snapshot.state.is_terminal() {
                    return Err(CoordinatorError::SessionNotFound { session_id });
                }
                Ok(snapshot)
            }
            Lookup::Ended(_) | Lookup::Unknown => {
                Err(CoordinatorError::SessionNotFound { session_id })
            }
        }
    }

    /// Validate, sequence and apply one telemetry report.
    ///
    /// Checks run in order: session exists, session is `Active`, `user_id` is
    /// a participant, payload ranges, client timestamp and rate limit. The
    /// sequence number is assigned under the session lock, so concurrent
    /// submissions never share or skip a number. A rejected report changes
    /// nothing.
    pub async fn submit(
        &self,
        session_id: SessionId,
        user_id: UserId,
        raw: RawTelemetryProto,
    ) -> Result<TelemetryEvent> {
        let handle = self.handle(session_id, "submit")?;
        let mut entry = handle.lock("submit").await?;

        let state = entry.state.state();
        if !state.accepts_events() {
            return Err(CoordinatorError::SessionClosed {
                session_id,
                state,
                operation: "submit",
            });
        }
        if !entry.state.is_member(user_id) {
            return Err(CoordinatorError::ParticipantNotFound {
                session_id,
                user_id,
            });
        }

        let now = self.clock.now_ms();
        let payload = validate_submission(&raw, now, &entry.intake, user_id).inspect_err(|err| {
            debug!(session_id, user_id, error = %err, "telemetry rejected");
        })?;

        let event = TelemetryEvent {
            session_id,
            participant_id: user_id,
            sequence: entry.state.next_sequence(),
            client_timestamp: raw.client_timestamp_ms,
            server_timestamp: now,
            payload,
        };
        self.commit_entry(&handle, &mut entry, LogEntry::Event(event.clone()), "submit")?;
        entry.intake.record(user_id, raw.client_timestamp_ms, now);
        debug!(session_id, user_id, sequence = event.sequence, "telemetry accepted");

        let finished = self.complete_if_all_finished(&handle, &mut entry)?;
        drop(entry);
        if let Some(finished) = finished {
            self.archive_finished(finished).await;
        }
        Ok(event)
    }

    /// Open a snapshot stream for a participant and mark it connected.
    ///
    /// The first item is the snapshot current at subscription time; every
    /// later commit follows in order. Subscribing again replaces the previous
    /// stream.
    pub async fn subscribe(
        &self,
        session_id: SessionId,
        user_id: UserId,
    ) -> Result<SnapshotStream> {
        let handle = self.handle(session_id, "subscribe")?;
        let mut entry = handle.lock("subscribe").await?;
        let at = self.clock.now_ms();

        // The old stream must not see the reconnect, or a full queue would
        // evict it and mark the participant disconnected again.
        self.broadcaster
            .unsubscribe(session_id, user_id, CloseReason::Replaced);
        self.commit_entry(
            &handle,
            &mut entry,
            LogEntry::Connection {
                user_id,
                connected: true,
                at,
            },
            "subscribe",
        )?;
        let stream = self
            .broadcaster
            .subscribe(session_id, user_id, handle.latest());
        drop(entry);

        debug!(session_id, user_id, "subscribed");
        Ok(stream)
    }

    /// Close a participant's stream without changing its connection status.
    /// Returns whether a stream was open.
    pub fn unsubscribe(&self, session_id: SessionId, user_id: UserId) -> Result<bool> {
        self.handle(session_id, "unsubscribe")?;
        Ok(self
            .broadcaster
            .unsubscribe(session_id, user_id, CloseReason::Unsubscribed))
    }

    fn handle(
        &self,
        session_id: SessionId,
        operation: &'static str,
    ) -> Result<Arc<SessionHandle>> {
        let lookup = self.arena.read().lookup(session_id);
        match lookup {
            Lookup::Live(handle) => Ok(handle),
            Lookup::Ended(state) => Err(CoordinatorError::SessionClosed {
                session_id,
                state,
                operation,
            }),
            Lookup::Unknown => Err(CoordinatorError::SessionNotFound { session_id }),
        }
    }

    /// Apply `log_entry` and publish the result. Returns the committed
    /// snapshot, or the latest one if nothing changed.
    ///
    /// Participants whose stream lagged or was dropped during the publish are
    /// marked disconnected and the result is published again.
    fn commit_entry(
        &self,
        handle: &SessionHandle,
        entry: &mut SessionEntry,
        log_entry: LogEntry,
        operation: &'static str,
    ) -> Result<Arc<SessionSnapshot>> {
        let changed = entry
            .apply(log_entry)
            .map_err(|err| CoordinatorError::from_store(err, handle.id(), operation))?;
        if !changed {
            return Ok(handle.latest());
        }

        let (mut snapshot, mut report) = handle.commit(entry, &self.broadcaster);
        while self.disconnect_dropped(handle.id(), entry, &report.dropped) {
            (snapshot, report) = handle.commit(entry, &self.broadcaster);
        }
        Ok(snapshot)
    }

    /// Returns whether any participant changed.
    fn disconnect_dropped(
        &self,
        session_id: SessionId,
        entry: &mut SessionEntry,
        dropped: &[UserId],
    ) -> bool {
        if dropped.is_empty() || entry.state.state().is_terminal() {
            return false;
        }
        let at = self.clock.now_ms();
        let mut changed = false;
        for &user_id in dropped {
            if !entry.state.is_member(user_id) {
                continue;
            }
            let lost = LogEntry::Connection {
                user_id,
                connected: false,
                at,
            };
            match entry.apply(lost) {
                Ok(updated) => {
                    changed |= updated;
                    debug!(session_id, user_id, "stream lost, participant disconnected");
                }
                Err(err) => {
                    warn!(
                        session_id,
                        user_id,
                        error = %err,
                        "failed to mark participant disconnected"
                    );
                }
            }
        }
        changed
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("config", &self.config)
            .field("live_sessions", &self.live_session_count())
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

/// Log a one-line summary of the configuration in effect.
pub fn log_config(config: &ServerConfig) {
    info!(
        subscriber_buffer = config.broadcast.subscriber_buffer,
        abandon_timeout_ms = config.lifecycle.abandon_timeout_ms,
        sweep_interval_ms = config.lifecycle.sweep_interval_ms,
        max_events_per_sec = config.validation.max_events_per_sec,
        archive_dir = ?config.archive_dir,
        "coordinator configuration"
    );
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub const START_MS: u64 = 1_700_000_000_000;

    pub fn coordinator_with(
        config: ServerConfig,
    ) -> (Coordinator, Arc<ManualClock>, Arc<MemoryArchive>) {
        let clock = Arc::new(ManualClock::new(START_MS));
        let archive = Arc::new(MemoryArchive::new());
        let coordinator = Coordinator::with_parts(
            config,
            Arc::clone(&clock) as Arc<dyn Clock>,
            Arc::clone(&archive) as Arc<dyn SessionArchive>,
        );
        (coordinator, clock, archive)
    }

    pub fn coordinator() -> (Coordinator, Arc<ManualClock>, Arc<MemoryArchive>) {
        coordinator_with(ServerConfig::default())
    }
}

// ============================================================================
// Tests
// ============================================================================
