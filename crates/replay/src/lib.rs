//! Strokesync Session Log
//!
//! Every mutation the coordinator commits to a session is also appended to a
//! [`LogRecorder`]. When the session ends the recorder is sealed into a
//! [`SessionLogProto`], which can be persisted and later replayed into a fresh
//! [`SessionState`] to prove the recorded outcome.
//!
//! # Verification
//!
//! [`verify_log`] checks, in order:
//! 1. Format version and digest algorithm
//! 2. SHA-256 integrity of the entry stream
//! 3. Every entry decodes, and every event payload is finite, non-negative
//!    and inside the payload limits the log was recorded under
//! 4. Every entry re-applies cleanly (sequence gaps or reorders fail as stale)
//! 5. Final sequence, revision and state digest match the sealed values

#![deny(unsafe_code)]

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use prost::Message;
use sha2::{Digest, Sha256};
use strokesync_store::{
    LifecycleState, PayloadLimits, STATE_DIGEST_ALGO_ID, SessionId, SessionSnapshot,
    SessionState, StoreError, TelemetryEvent, Timestamp, UserId,
};
use strokesync_wire::{
    ConnectionRecordProto, JoinRecordProto, LeaveRecordProto, LifecycleStateProto, LogEntryProto,
    SessionLogProto, TelemetryEventProto, TransitionRecordProto, lifecycle_state_from_wire,
    log_entry_proto::Entry,
};

/// Current session log schema version.
pub const LOG_FORMAT_VERSION: u32 = 1;

// ============================================================================
// Log Entries
// ============================================================================

/// One committed mutation of a session.
#[derive(Debug, Clone, PartialEq)]
pub enum LogEntry {
    Join { user_id: UserId, at: Timestamp },
    Leave { user_id: UserId, at: Timestamp },
    Connection {
        user_id: UserId,
        connected: bool,
        at: Timestamp,
    },
    Transition { to: LifecycleState, at: Timestamp },
    Event(TelemetryEvent),
}

impl LogEntry {
    /// Server time at which the mutation was committed.
    pub fn at(&self) -> Timestamp {
        match self {
            Self::Join { at, .. }
            | Self::Leave { at, .. }
            | Self::Connection { at, .. }
            | Self::Transition { at, .. } => *at,
            Self::Event(event) => event.server_timestamp,
        }
    }

    /// Re-apply this mutation to `state`.
    pub fn apply(&self, state: &mut SessionState) -> Result<(), StoreError> {
        match self {
            Self::Join { user_id, at } => state.join(*user_id, *at).map(drop),
            Self::Leave { user_id, .. } => state.leave(*user_id),
            Self::Connection {
                user_id, connected, ..
            } => state.set_connected(*user_id, *connected).map(drop),
            Self::Transition { to, .. } => state.transition(*to).map(drop),
            Self::Event(event) => state.apply_event(event).map(drop),
        }
    }
}

impl From<&LogEntry> for LogEntryProto {
    fn from(entry: &LogEntry) -> Self {
        let entry = match entry {
            LogEntry::Join { user_id, at } => Entry::Join(JoinRecordProto {
                user_id: *user_id,
                at_ms: *at,
            }),
            LogEntry::Leave { user_id, at } => Entry::Leave(LeaveRecordProto {
                user_id: *user_id,
                at_ms: *at,
            }),
            LogEntry::Connection {
                user_id,
                connected,
                at,
            } => Entry::Connection(ConnectionRecordProto {
                user_id: *user_id,
                connected: *connected,
                at_ms: *at,
            }),
            LogEntry::Transition { to, at } => Entry::Transition(TransitionRecordProto {
                state: LifecycleStateProto::from(*to) as i32,
                at_ms: *at,
            }),
            LogEntry::Event(event) => Entry::Event(TelemetryEventProto::from(event)),
        };
        Self { entry: Some(entry) }
    }
}

impl TryFrom<&LogEntryProto> for LogEntry {
    type Error = String;

    fn try_from(proto: &LogEntryProto) -> Result<Self, Self::Error> {
        match &proto.entry {
            Some(Entry::Join(j)) => Ok(Self::Join {
                user_id: j.user_id,
                at: j.at_ms,
            }),
            Some(Entry::Leave(l)) => Ok(Self::Leave {
                user_id: l.user_id,
                at: l.at_ms,
            }),
            Some(Entry::Connection(c)) => Ok(Self::Connection {
                user_id: c.user_id,
                connected: c.connected,
                at: c.at_ms,
            }),
            Some(Entry::Transition(t)) => Ok(Self::Transition {
                to: lifecycle_state_from_wire(t.state).map_err(|e| e.to_string())?,
                at: t.at_ms,
            }),
            Some(Entry::Event(e)) => Ok(Self::Event(e.clone().into())),
            None => Err("empty log entry".to_string()),
        }
    }
}

// ============================================================================
// Recorder
// ============================================================================

/// Identity of the session a log belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct LogHeader {
    pub session_id: SessionId,
    pub owner_id: UserId,
    pub created_at: Timestamp,
    pub target_distance_m: Option<f64>,
    /// Bounds every recorded event payload must respect.
    pub payload_limits: Option<PayloadLimits>,
}

impl LogHeader {
    pub fn of(state: &SessionState) -> Self {
        Self {
            session_id: state.id(),
            owner_id: state.owner_id(),
            created_at: state.created_at(),
            target_distance_m: state.target_distance_m(),
            payload_limits: None,
        }
    }

    pub fn with_payload_limits(mut self, limits: PayloadLimits) -> Self {
        self.payload_limits = Some(limits);
        self
    }

    /// Header recorded in a sealed log.
    pub fn from_log(log: &SessionLogProto) -> Self {
        Self {
            session_id: log.session_id,
            owner_id: log.owner_id,
            created_at: log.created_at_ms,
            target_distance_m: log.target_distance_m,
            payload_limits: log.payload_limits.as_ref().map(PayloadLimits::from),
        }
    }

    /// Reject event payloads no ingestion path could have accepted.
    fn check_entry(&self, entry: &LogEntry) -> Result<(), String> {
        let LogEntry::Event(event) = entry else {
            return Ok(());
        };
        if !event.payload.is_well_formed() {
            return Err(format!(
                "event {} carries a non-finite or negative payload",
                event.sequence
            ));
        }
        match self.payload_limits {
            Some(limits) if !event.payload.is_within(&limits) => Err(format!(
                "event {} is outside the recorded payload limits",
                event.sequence
            )),
            _ => Ok(()),
        }
    }

    /// A fresh state matching this header, before any entry is applied.
    pub fn initial_state(&self) -> SessionState {
        SessionState::new(
            self.session_id,
            self.owner_id,
            self.created_at,
            self.target_distance_m,
        )
    }
}

/// Appends committed mutations in order.
#[derive(Debug, Clone)]
pub struct LogRecorder {
    header: LogHeader,
    entries: Vec<LogEntry>,
}

impl LogRecorder {
    pub fn new(header: LogHeader) -> Self {
        Self {
            header,
            entries: Vec::new(),
        }
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn record(&mut self, entry: LogEntry) {
        self.entries.push(entry);
    }

    /// Seal the log against the final snapshot.
    pub fn finalize(&self, snapshot: &SessionSnapshot, end_reason: &str) -> SessionLogProto {
        let entries: Vec<LogEntryProto> = self.entries.iter().map(Into::into).collect();
        let entries_sha256 = entries_sha256(&entries);

        SessionLogProto {
            format_version: LOG_FORMAT_VERSION,
            session_id: self.header.session_id,
            owner_id: self.header.owner_id,
            created_at_ms: self.header.created_at,
            target_distance_m: self.header.target_distance_m,
            state_digest_algo_id: STATE_DIGEST_ALGO_ID.to_string(),
            entries,
            entries_sha256,
            final_sequence: snapshot.sequence,
            final_revision: snapshot.revision,
            final_digest: snapshot.digest,
            end_reason: end_reason.to_string(),
            payload_limits: self.header.payload_limits.map(Into::into),
        }
    }
}

/// Hex SHA-256 over the length-delimited encoding of each entry.
pub fn entries_sha256(entries: &[LogEntryProto]) -> String {
    let mut hasher = Sha256::new();
    for entry in entries {
        hasher.update(entry.encode_length_delimited_to_vec());
    }
    format!("{:x}", hasher.finalize())
}

// ============================================================================
// Replay & Verification
// ============================================================================

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum VerifyError {
    #[error("unsupported log format version {found}")]
    UnsupportedFormat { found: u32 },

    #[error("unsupported state digest algorithm {found:?}")]
    UnsupportedDigestAlgorithm { found: String },

    #[error("entry stream hash mismatch: sealed {expected}, computed {actual}")]
    IntegrityMismatch { expected: String, actual: String },

    #[error("entry {index} is malformed: {reason}")]
    MalformedEntry { index: usize, reason: String },

    #[error("entry {index} was rejected on replay: {source}")]
    Rejected {
        index: usize,
        #[source]
        source: StoreError,
    },

    #[error("final sequence mismatch: expected {expected}, got {actual}")]
    FinalSequenceMismatch { expected: u64, actual: u64 },

    #[error("final revision mismatch: expected {expected}, got {actual}")]
    FinalRevisionMismatch { expected: u64, actual: u64 },

    #[error("final digest mismatch: expected {expected:#x}, got {actual:#x}")]
    FinalDigestMismatch { expected: u64, actual: u64 },
}

/// Apply an ordered event list to `state`.
///
/// Returns the snapshot after the last event, or `None` for an empty list.
/// Stops at the first rejected event.
pub fn replay_events(
    state: &mut SessionState,
    events: &[TelemetryEvent],
) -> Result<Option<SessionSnapshot>, StoreError> {
    let mut last = None;
    for event in events {
        last = Some(state.apply_event(event)?);
    }
    Ok(last)
}

/// Rebuild the session state recorded in `log` without checking the seal.
pub fn rebuild(log: &SessionLogProto) -> Result<SessionState, VerifyError> {
    let header = LogHeader::from_log(log);
    let mut state = header.initial_state();

    for (index, proto) in log.entries.iter().enumerate() {
        let entry = LogEntry::try_from(proto)
            .and_then(|entry| header.check_entry(&entry).map(|()| entry))
            .map_err(|reason| VerifyError::MalformedEntry { index, reason })?;
        entry
            .apply(&mut state)
            .map_err(|source| VerifyError::Rejected { index, source })?;
    }

    Ok(state)
}

/// Verify that `log` replays to exactly its sealed outcome.
///
/// Returns the replayed final snapshot.
pub fn verify_log(log: &SessionLogProto) -> Result<SessionSnapshot, VerifyError> {
    if log.format_version != LOG_FORMAT_VERSION {
        return Err(VerifyError::UnsupportedFormat {
            found: log.format_version,
        });
    }
    if log.state_digest_algo_id != STATE_DIGEST_ALGO_ID {
        return Err(VerifyError::UnsupportedDigestAlgorithm {
            found: log.state_digest_algo_id.clone(),
        });
    }

    let actual_sha = entries_sha256(&log.entries);
    if actual_sha != log.entries_sha256 {
        return Err(VerifyError::IntegrityMismatch {
            expected: log.entries_sha256.clone(),
            actual: actual_sha,
        });
    }

    let state = rebuild(log)?;

    if state.sequence() != log.final_sequence {
        return Err(VerifyError::FinalSequenceMismatch {
            expected: log.final_sequence,
            actual: state.sequence(),
        });
    }
    if state.revision() != log.final_revision {
        return Err(VerifyError::FinalRevisionMismatch {
            expected: log.final_revision,
            actual: state.revision(),
        });
    }
    let snapshot = state.snapshot();
    if snapshot.digest != log.final_digest {
        return Err(VerifyError::FinalDigestMismatch {
            expected: log.final_digest,
            actual: snapshot.digest,
        });
    }

    Ok(snapshot)
}

// ============================================================================
// Log I/O
// ============================================================================

/// Write a sealed log. Refuses to overwrite an existing file.
pub fn write_log(log: &SessionLogProto, path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let encoded = log.encode_to_vec();
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| match e.kind() {
            io::ErrorKind::AlreadyExists => io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("Session log already exists at {}", path.display()),
            ),
            _ => e,
        })?;
    file.write_all(&encoded)?;
    file.sync_all()?;

    Ok(())
}

pub fn read_log(path: &Path) -> io::Result<SessionLogProto> {
    let data = fs::read(path)?;
    SessionLogProto::decode(data.as_slice()).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Failed to decode session log: {e}"),
        )
    })
}

// ============================================================================
// Tests
// ============================================================================
