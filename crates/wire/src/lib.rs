//! Strokesync Wire Protocol Types
//!
//! Protobuf message types shared by the coordinator, its transports and the
//! session log. Clients and the server must both depend on this crate so the
//! schema cannot drift.
//!
//! # Message Categories
//!
//! - **Client submissions**: [`RawTelemetryProto`] (participant-bound by the
//!   server, never carried in the message)
//! - **Broadcast**: [`SessionSnapshotProto`]
//! - **Session log**: [`SessionLogProto`] and its [`LogEntryProto`] records

#![deny(unsafe_code)]

use strokesync_store::{
    LifecycleState, ParticipantMetrics, ParticipantSnapshot, PayloadLimits, SessionSnapshot,
    StrokePayload, TelemetryEvent,
};

// ============================================================================
// Errors
// ============================================================================

/// Failure converting a decoded message into a store type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("unknown lifecycle state {0}")]
    UnknownLifecycleState(i32),
}

// ============================================================================
// Lifecycle
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum LifecycleStateProto {
    Unspecified = 0,
    Created = 1,
    Active = 2,
    Paused = 3,
    Completed = 4,
    Abandoned = 5,
}

impl From<LifecycleState> for LifecycleStateProto {
    fn from(state: LifecycleState) -> Self {
        match state {
            LifecycleState::Created => Self::Created,
            LifecycleState::Active => Self::Active,
            LifecycleState::Paused => Self::Paused,
            LifecycleState::Completed => Self::Completed,
            LifecycleState::Abandoned => Self::Abandoned,
        }
    }
}

/// Decode the raw enum value carried in a message field.
pub fn lifecycle_state_from_wire(value: i32) -> Result<LifecycleState, WireError> {
    match LifecycleStateProto::try_from(value) {
        Ok(LifecycleStateProto::Created) => Ok(LifecycleState::Created),
        Ok(LifecycleStateProto::Active) => Ok(LifecycleState::Active),
        Ok(LifecycleStateProto::Paused) => Ok(LifecycleState::Paused),
        Ok(LifecycleStateProto::Completed) => Ok(LifecycleState::Completed),
        Ok(LifecycleStateProto::Abandoned) => Ok(LifecycleState::Abandoned),
        Ok(LifecycleStateProto::Unspecified) | Err(_) => {
            Err(WireError::UnknownLifecycleState(value))
        }
    }
}

// ============================================================================
// Client Submissions
// ============================================================================

/// Telemetry as sent by a client, before validation and sequencing.
///
/// Note: no session or participant id; the transport binds both.
#[derive(Clone, PartialEq, prost::Message)]
pub struct RawTelemetryProto {
    /// Client device clock, ms since epoch.
    #[prost(uint64, tag = "1")]
    pub client_timestamp_ms: u64,

    #[prost(double, tag = "2")]
    pub distance_delta_m: f64,

    #[prost(double, tag = "3")]
    pub stroke_rate_spm: f64,

    #[prost(uint32, tag = "4")]
    pub strokes: u32,
}

// ============================================================================
// Accepted Telemetry
// ============================================================================

#[derive(Clone, PartialEq, prost::Message)]
pub struct TelemetryEventProto {
    #[prost(uint64, tag = "1")]
    pub session_id: u64,

    #[prost(uint64, tag = "2")]
    pub participant_id: u64,

    #[prost(uint64, tag = "3")]
    pub sequence: u64,

    #[prost(uint64, tag = "4")]
    pub client_timestamp_ms: u64,

    #[prost(uint64, tag = "5")]
    pub server_timestamp_ms: u64,

    #[prost(double, tag = "6")]
    pub distance_delta_m: f64,

    #[prost(double, tag = "7")]
    pub stroke_rate_spm: f64,

    #[prost(uint32, tag = "8")]
    pub strokes: u32,
}

impl From<&TelemetryEvent> for TelemetryEventProto {
    fn from(e: &TelemetryEvent) -> Self {
        Self {
            session_id: e.session_id,
            participant_id: e.participant_id,
            sequence: e.sequence,
            client_timestamp_ms: e.client_timestamp,
            server_timestamp_ms: e.server_timestamp,
            distance_delta_m: e.payload.distance_delta_m,
            stroke_rate_spm: e.payload.stroke_rate_spm,
            strokes: e.payload.strokes,
        }
    }
}

impl From<TelemetryEventProto> for TelemetryEvent {
    fn from(e: TelemetryEventProto) -> Self {
        Self {
            session_id: e.session_id,
            participant_id: e.participant_id,
            sequence: e.sequence,
            client_timestamp: e.client_timestamp_ms,
            server_timestamp: e.server_timestamp_ms,
            payload: StrokePayload {
                distance_delta_m: e.distance_delta_m,
                stroke_rate_spm: e.stroke_rate_spm,
                strokes: e.strokes,
            },
        }
    }
}

// ============================================================================
// Snapshots
// ============================================================================

#[derive(Clone, PartialEq, prost::Message)]
pub struct ParticipantSnapshotProto {
    #[prost(uint64, tag = "1")]
    pub user_id: u64,

    #[prost(uint64, tag = "2")]
    pub joined_at_ms: u64,

    #[prost(double, tag = "3")]
    pub distance_m: f64,

    #[prost(uint64, tag = "4")]
    pub stroke_count: u64,

    #[prost(uint64, tag = "5")]
    pub elapsed_ms: u64,

    #[prost(double, tag = "6")]
    pub last_stroke_rate_spm: f64,

    #[prost(bool, tag = "7")]
    pub connected: bool,

    #[prost(bool, tag = "8")]
    pub finished: bool,
}

/// Snapshot broadcast to every subscriber of a session.
///
/// Receivers order snapshots by `revision`; `sequence` counts accepted events.
#[derive(Clone, PartialEq, prost::Message)]
pub struct SessionSnapshotProto {
    #[prost(uint64, tag = "1")]
    pub session_id: u64,

    #[prost(uint64, tag = "2")]
    pub owner_id: u64,

    #[prost(enumeration = "LifecycleStateProto", tag = "3")]
    pub state: i32,

    #[prost(uint64, tag = "4")]
    pub created_at_ms: u64,

    #[prost(double, optional, tag = "5")]
    pub target_distance_m: Option<f64>,

    #[prost(uint64, tag = "6")]
    pub sequence: u64,

    #[prost(uint64, tag = "7")]
    pub revision: u64,

    /// Join order.
    #[prost(message, repeated, tag = "8")]
    pub participants: Vec<ParticipantSnapshotProto>,

    #[prost(uint64, tag = "9")]
    pub digest: u64,
}

impl From<&ParticipantSnapshot> for ParticipantSnapshotProto {
    fn from(p: &ParticipantSnapshot) -> Self {
        Self {
            user_id: p.user_id,
            joined_at_ms: p.joined_at,
            distance_m: p.metrics.distance_m,
            stroke_count: p.metrics.stroke_count,
            elapsed_ms: p.metrics.elapsed_ms,
            last_stroke_rate_spm: p.metrics.last_stroke_rate_spm,
            connected: p.connected,
            finished: p.finished,
        }
    }
}

impl From<ParticipantSnapshotProto> for ParticipantSnapshot {
    fn from(p: ParticipantSnapshotProto) -> Self {
        Self {
            user_id: p.user_id,
            joined_at: p.joined_at_ms,
            metrics: ParticipantMetrics {
                distance_m: p.distance_m,
                stroke_count: p.stroke_count,
                elapsed_ms: p.elapsed_ms,
                last_stroke_rate_spm: p.last_stroke_rate_spm,
            },
            connected: p.connected,
            finished: p.finished,
        }
    }
}

impl From<&SessionSnapshot> for SessionSnapshotProto {
    fn from(s: &SessionSnapshot) -> Self {
        Self {
            session_id: s.session_id,
            owner_id: s.owner_id,
            state: LifecycleStateProto::from(s.state) as i32,
            created_at_ms: s.created_at,
            target_distance_m: s.target_distance_m,
            sequence: s.sequence,
            revision: s.revision,
            participants: s.participants.iter().map(Into::into).collect(),
            digest: s.digest,
        }
    }
}

impl TryFrom<SessionSnapshotProto> for SessionSnapshot {
    type Error = WireError;

    fn try_from(s: SessionSnapshotProto) -> Result<Self, Self::Error> {
        Ok(Self {
            session_id: s.session_id,
            owner_id: s.owner_id,
            state: lifecycle_state_from_wire(s.state)?,
            created_at: s.created_at_ms,
            target_distance_m: s.target_distance_m,
            sequence: s.sequence,
            revision: s.revision,
            participants: s.participants.into_iter().map(Into::into).collect(),
            digest: s.digest,
        })
    }
}

// ============================================================================
// Session Log
// ============================================================================

#[derive(Clone, PartialEq, prost::Message)]
pub struct JoinRecordProto {
    #[prost(uint64, tag = "1")]
    pub user_id: u64,

    #[prost(uint64, tag = "2")]
    pub at_ms: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct LeaveRecordProto {
    #[prost(uint64, tag = "1")]
    pub user_id: u64,

    #[prost(uint64, tag = "2")]
    pub at_ms: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ConnectionRecordProto {
    #[prost(uint64, tag = "1")]
    pub user_id: u64,

    #[prost(bool, tag = "2")]
    pub connected: bool,

    #[prost(uint64, tag = "3")]
    pub at_ms: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct TransitionRecordProto {
    /// Target state of the transition.
    #[prost(enumeration = "LifecycleStateProto", tag = "1")]
    pub state: i32,

    #[prost(uint64, tag = "2")]
    pub at_ms: u64,
}

/// One mutation of a session, in the order it was committed.
#[derive(Clone, PartialEq, prost::Message)]
pub struct LogEntryProto {
    #[prost(oneof = "log_entry_proto::Entry", tags = "1, 2, 3, 4, 5")]
    pub entry: Option<log_entry_proto::Entry>,
}

pub mod log_entry_proto {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Entry {
        #[prost(message, tag = "1")]
        Join(super::JoinRecordProto),

        #[prost(message, tag = "2")]
        Leave(super::LeaveRecordProto),

        #[prost(message, tag = "3")]
        Connection(super::ConnectionRecordProto),

        #[prost(message, tag = "4")]
        Transition(super::TransitionRecordProto),

        #[prost(message, tag = "5")]
        Event(super::TelemetryEventProto),
    }
}

/// Complete, replayable record of a finished session.
#[derive(Clone, PartialEq, prost::Message)]
pub struct SessionLogProto {
    /// Schema version (starts at 1).
    #[prost(uint32, tag = "1")]
    pub format_version: u32,

    #[prost(uint64, tag = "2")]
    pub session_id: u64,

    #[prost(uint64, tag = "3")]
    pub owner_id: u64,

    #[prost(uint64, tag = "4")]
    pub created_at_ms: u64,

    #[prost(double, optional, tag = "5")]
    pub target_distance_m: Option<f64>,

    #[prost(string, tag = "6")]
    pub state_digest_algo_id: String,

    /// Mutations in commit order.
    #[prost(message, repeated, tag = "7")]
    pub entries: Vec<LogEntryProto>,

    /// Hex SHA-256 over the length-delimited encoding of `entries`.
    #[prost(string, tag = "8")]
    pub entries_sha256: String,

    #[prost(uint64, tag = "9")]
    pub final_sequence: u64,

    #[prost(uint64, tag = "10")]
    pub final_revision: u64,

    #[prost(uint64, tag = "11")]
    pub final_digest: u64,

    /// "completed" or "abandoned".
    #[prost(string, tag = "12")]
    pub end_reason: String,

    /// Payload bounds enforced while the session ran.
    #[prost(message, optional, tag = "13")]
    pub payload_limits: Option<PayloadLimitsProto>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PayloadLimitsProto {
    #[prost(double, tag = "1")]
    pub max_distance_delta_m: f64,

    #[prost(double, tag = "2")]
    pub max_stroke_rate_spm: f64,

    #[prost(uint32, tag = "3")]
    pub max_strokes_per_event: u32,
}

impl From<PayloadLimits> for PayloadLimitsProto {
    fn from(limits: PayloadLimits) -> Self {
        Self {
            max_distance_delta_m: limits.max_distance_delta_m,
            max_stroke_rate_spm: limits.max_stroke_rate_spm,
            max_strokes_per_event: limits.max_strokes_per_event,
        }
    }
}

impl From<&PayloadLimitsProto> for PayloadLimits {
    fn from(proto: &PayloadLimitsProto) -> Self {
        Self {
            max_distance_delta_m: proto.max_distance_delta_m,
            max_stroke_rate_spm: proto.max_stroke_rate_spm,
            max_strokes_per_event: proto.max_strokes_per_event,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    fn sample_snapshot() -> SessionSnapshot {
        SessionSnapshot {
            session_id: 3,
            owner_id: 9,
            state: LifecycleState::Paused,
            created_at: 1_700_000_000_000,
            target_distance_m: Some(2_000.0),
            sequence: 12,
            revision: 19,
            participants: vec![ParticipantSnapshot {
                user_id: 9,
                joined_at: 1_700_000_000_100,
                metrics: ParticipantMetrics {
                    distance_m: 118.25,
                    stroke_count: 12,
                    elapsed_ms: 30_500,
                    last_stroke_rate_spm: 26.5,
                },
                connected: true,
                finished: false,
            }],
            digest: 0xfeed_face,
        }
    }

    #[test]
    fn test_snapshot_survives_encoding() {
        let snapshot = sample_snapshot();
        let bytes = SessionSnapshotProto::from(&snapshot).encode_to_vec();
        let decoded = SessionSnapshotProto::decode(bytes.as_slice()).unwrap();
        let back = SessionSnapshot::try_from(decoded).unwrap();
        assert_eq!(back, snapshot);
    }

    #[test]
    fn test_untargeted_snapshot_keeps_none() {
        let snapshot = SessionSnapshot {
            target_distance_m: None,
            ..sample_snapshot()
        };
        let proto = SessionSnapshotProto::from(&snapshot);
        let decoded = SessionSnapshotProto::decode(proto.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded.target_distance_m, None);
    }

    #[test]
    fn test_unknown_state_rejected() {
        let mut proto = SessionSnapshotProto::from(&sample_snapshot());
        proto.state = 42;
        assert_eq!(
            SessionSnapshot::try_from(proto.clone()),
            Err(WireError::UnknownLifecycleState(42))
        );

        proto.state = LifecycleStateProto::Unspecified as i32;
        assert!(SessionSnapshot::try_from(proto).is_err());
    }

    #[test]
    fn test_event_conversion_keeps_sequence_and_times() {
        let event = TelemetryEvent {
            session_id: 1,
            participant_id: 2,
            sequence: 3,
            client_timestamp: 4,
            server_timestamp: 5,
            payload: StrokePayload {
                distance_delta_m: 8.75,
                stroke_rate_spm: 31.0,
                strokes: 1,
            },
        };
        let proto = TelemetryEventProto::from(&event);
        assert_eq!(proto.sequence, 3);
        assert_eq!(proto.client_timestamp_ms, 4);
        assert_eq!(proto.server_timestamp_ms, 5);
        assert_eq!(TelemetryEvent::from(proto), event);
    }

    #[test]
    fn test_log_entry_oneof_encoding() {
        let entry = LogEntryProto {
            entry: Some(log_entry_proto::Entry::Transition(TransitionRecordProto {
                state: LifecycleStateProto::Active as i32,
                at_ms: 77,
            })),
        };
        let decoded = LogEntryProto::decode(entry.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded, entry);
    }
}
