//! Strokesync Session State Store
//!
//! This crate holds the canonical, authoritative state of one live rowing
//! session and applies validated telemetry to it. It is deliberately pure:
//!
//! - No I/O (file, network, channels)
//! - No wall-clock reads; every timestamp is supplied by the caller
//! - No locking; callers serialize mutations per session
//!
//! Everything that talks to the outside world (ingestion, fan-out, lifecycle
//! timers, persistence) lives in `strokesync-server`. Keeping the store pure
//! is what makes an ordered session log replayable into an identical
//! [`SessionSnapshot`].

#![deny(unsafe_code)]

use std::fmt;

// ============================================================================
// Type Aliases
// ============================================================================

/// Session identifier, assigned by the coordinator.
pub type SessionId = u64;

/// User identifier, supplied by the auth backend.
///
/// A participant is addressed by its user id; a user joins a session at most
/// once at a time.
pub type UserId = u64;

/// Per-session event sequence number. The first accepted event is 1.
pub type Sequence = u64;

/// Per-session snapshot revision. Bumped on every state mutation.
pub type Revision = u64;

/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;

// ============================================================================
// Lifecycle
// ============================================================================

/// Lifecycle state of a session.
///
/// ```text
/// Created -> Active <-> Paused
///    |         |          |
///    +---------+----------+--> Completed
///              |          |
///              +----------+--> Abandoned
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Created,
    Active,
    Paused,
    Completed,
    Abandoned,
}

impl LifecycleState {
    /// Terminal states accept nothing and broadcast nothing further.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Abandoned)
    }

    /// Only an active session accepts telemetry.
    pub const fn accepts_events(self) -> bool {
        matches!(self, Self::Active)
    }

    pub const fn accepts_joins(self) -> bool {
        matches!(self, Self::Created | Self::Active)
    }

    /// Whether `self -> to` is an edge of the lifecycle state machine.
    pub const fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Created, Self::Active)
                | (Self::Active, Self::Paused)
                | (Self::Paused, Self::Active)
                | (
                    Self::Created | Self::Active | Self::Paused,
                    Self::Completed
                )
                | (Self::Active | Self::Paused, Self::Abandoned)
        )
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Abandoned => "abandoned",
        }
    }

    /// Stable one-byte code used by the state digest.
    const fn digest_code(self) -> u8 {
        match self {
            Self::Created => 1,
            Self::Active => 2,
            Self::Paused => 3,
            Self::Completed => 4,
            Self::Abandoned => 5,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Telemetry
// ============================================================================

/// Incremental progress reported by a participant.
///
/// Configured range checks happen at ingestion. The store itself only
/// refuses payloads that are not finite and non-negative.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StrokePayload {
    /// Distance covered since the previous report, in metres.
    pub distance_delta_m: f64,
    /// Instantaneous stroke rate, strokes per minute.
    pub stroke_rate_spm: f64,
    /// Strokes completed in this report (normally 1).
    pub strokes: u32,
}

impl StrokePayload {
    /// Finite, non-negative distance and stroke rate.
    pub fn is_well_formed(&self) -> bool {
        let non_negative = |v: f64| v.is_finite() && v >= 0.0;
        non_negative(self.distance_delta_m) && non_negative(self.stroke_rate_spm)
    }

    /// Well formed and inside `limits`.
    pub fn is_within(&self, limits: &PayloadLimits) -> bool {
        self.is_well_formed()
            && self.distance_delta_m <= limits.max_distance_delta_m
            && self.stroke_rate_spm <= limits.max_stroke_rate_spm
            && self.strokes <= limits.max_strokes_per_event
    }
}

/// Upper bounds an accepted payload was checked against.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PayloadLimits {
    pub max_distance_delta_m: f64,
    pub max_stroke_rate_spm: f64,
    pub max_strokes_per_event: u32,
}

/// An accepted telemetry record. Immutable once sequenced.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryEvent {
    pub session_id: SessionId,
    pub participant_id: UserId,
    /// Server-assigned; equals the session's next sequence when applied.
    pub sequence: Sequence,
    /// As reported by the client device.
    pub client_timestamp: Timestamp,
    /// Assigned by the server at acceptance.
    pub server_timestamp: Timestamp,
    pub payload: StrokePayload,
}

// ============================================================================
// Snapshots
// ============================================================================

/// Cumulative metrics for one participant.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ParticipantMetrics {
    pub distance_m: f64,
    pub stroke_count: u64,
    /// Client-clock time between the participant's first and latest report.
    pub elapsed_ms: u64,
    pub last_stroke_rate_spm: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParticipantSnapshot {
    pub user_id: UserId,
    pub joined_at: Timestamp,
    pub metrics: ParticipantMetrics,
    pub connected: bool,
    /// True once a target distance is set and reached.
    pub finished: bool,
}

/// Read-only aggregate view of a session, regenerated after each mutation.
///
/// `participants` are in join order.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub owner_id: UserId,
    pub state: LifecycleState,
    pub created_at: Timestamp,
    pub target_distance_m: Option<f64>,
    pub sequence: Sequence,
    pub revision: Revision,
    pub participants: Vec<ParticipantSnapshot>,
    pub digest: u64,
}

impl SessionSnapshot {
    pub fn participant(&self, user_id: UserId) -> Option<&ParticipantSnapshot> {
        self.participants.iter().find(|p| p.user_id == user_id)
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Sequence is not the expected next value; caller must refresh and retry.
    #[error("stale event: expected sequence {expected}, got {actual}")]
    StaleEvent { expected: Sequence, actual: Sequence },

    #[error("user {user_id} is not a participant of session {session_id}")]
    UnknownParticipant {
        session_id: SessionId,
        user_id: UserId,
    },

    #[error("invalid lifecycle transition {from} -> {to}")]
    InvalidTransition {
        from: LifecycleState,
        to: LifecycleState,
    },

    #[error("session is {state}; telemetry is not accepted")]
    NotAccepting { state: LifecycleState },

    #[error("session is {state}; joins are not accepted")]
    JoinClosed { state: LifecycleState },

    #[error("session is {state}")]
    Terminal { state: LifecycleState },

    #[error("event addressed to session {actual}, store holds session {expected}")]
    WrongSession {
        expected: SessionId,
        actual: SessionId,
    },

    #[error("event {sequence} carries a non-finite or negative payload")]
    MalformedPayload { sequence: Sequence },
}

// ============================================================================
// State Digest
// ============================================================================

/// Digest algorithm identifier, recorded in session logs.
pub const STATE_DIGEST_ALGO_ID: &str = "strokesync-digest-v1-fnv1a64-le-f64canon";

const FNV1A_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
const FNV1A_PRIME: u64 = 0x100000001b3;

#[derive(Debug, Clone)]
struct Fnv1a64 {
    state: u64,
}

impl Fnv1a64 {
    fn new() -> Self {
        Self {
            state: FNV1A_OFFSET_BASIS,
        }
    }

    fn update(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.state ^= u64::from(byte);
            self.state = self.state.wrapping_mul(FNV1A_PRIME);
        }
    }

    fn u64(&mut self, value: u64) {
        self.update(&value.to_le_bytes());
    }

    fn f64(&mut self, value: f64) {
        self.update(&canonicalize_f64(value).to_le_bytes());
    }

    fn flag(&mut self, value: bool) {
        self.update(&[u8::from(value)]);
    }

    fn finish(self) -> u64 {
        self.state
    }
}

/// `-0.0` hashes as `+0.0`; every NaN hashes as the quiet NaN pattern.
fn canonicalize_f64(value: f64) -> u64 {
    const QUIET_NAN_BITS: u64 = 0x7ff8000000000000;

    if value.is_nan() {
        QUIET_NAN_BITS
    } else if value == 0.0 {
        0u64
    } else {
        value.to_bits()
    }
}

// ============================================================================
// Participant
// ============================================================================

#[derive(Debug, Clone)]
struct Participant {
    user_id: UserId,
    joined_at: Timestamp,
    metrics: ParticipantMetrics,
    connected: bool,
    first_client_timestamp: Option<Timestamp>,
}

impl Participant {
    fn new(user_id: UserId, joined_at: Timestamp) -> Self {
        Self {
            user_id,
            joined_at,
            metrics: ParticipantMetrics::default(),
            connected: true,
            first_client_timestamp: None,
        }
    }

    fn record(&mut self, event: &TelemetryEvent) {
        let payload = &event.payload;
        self.metrics.distance_m += payload.distance_delta_m;
        self.metrics.stroke_count += u64::from(payload.strokes);
        self.metrics.last_stroke_rate_spm = payload.stroke_rate_spm;

        let first = *self
            .first_client_timestamp
            .get_or_insert(event.client_timestamp);
        let elapsed = event.client_timestamp.saturating_sub(first);
        self.metrics.elapsed_ms = self.metrics.elapsed_ms.max(elapsed);
    }

    fn is_finished(&self, target_distance_m: Option<f64>) -> bool {
        target_distance_m.is_some_and(|target| self.metrics.distance_m >= target)
    }

    fn to_snapshot(&self, target_distance_m: Option<f64>) -> ParticipantSnapshot {
        ParticipantSnapshot {
            user_id: self.user_id,
            joined_at: self.joined_at,
            metrics: self.metrics,
            connected: self.connected,
            finished: self.is_finished(target_distance_m),
        }
    }
}

// ============================================================================
// Session State
// ============================================================================

/// Canonical state of one session.
///
/// Mutations must be serialized by the owner. Each successful mutation bumps
/// the revision; only [`SessionState::apply_event`] advances the sequence.
#[derive(Debug, Clone)]
pub struct SessionState {
    id: SessionId,
    owner_id: UserId,
    created_at: Timestamp,
    target_distance_m: Option<f64>,
    state: LifecycleState,
    /// Join order is preserved for deterministic snapshots.
    participants: Vec<Participant>,
    sequence: Sequence,
    revision: Revision,
}

impl SessionState {
    /// Create a session in `Created` with no participants.
    pub fn new(
        id: SessionId,
        owner_id: UserId,
        created_at: Timestamp,
        target_distance_m: Option<f64>,
    ) -> Self {
        Self {
            id,
            owner_id,
            created_at,
            target_distance_m,
            state: LifecycleState::Created,
            participants: Vec::new(),
            sequence: 0,
            revision: 0,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn owner_id(&self) -> UserId {
        self.owner_id
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    pub fn target_distance_m(&self) -> Option<f64> {
        self.target_distance_m
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Sequence of the last accepted event (0 if none).
    pub fn sequence(&self) -> Sequence {
        self.sequence
    }

    /// The only sequence number [`SessionState::apply_event`] will accept.
    pub fn next_sequence(&self) -> Sequence {
        self.sequence + 1
    }

    pub fn revision(&self) -> Revision {
        self.revision
    }

    pub fn is_member(&self, user_id: UserId) -> bool {
        self.participants.iter().any(|p| p.user_id == user_id)
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    pub fn connected_count(&self) -> usize {
        self.participants.iter().filter(|p| p.connected).count()
    }

    /// True when a target is set, there is at least one participant, and all
    /// of them reached it.
    pub fn all_finished(&self) -> bool {
        !self.participants.is_empty()
            && self
                .participants
                .iter()
                .all(|p| p.is_finished(self.target_distance_m))
    }

    /// Add a participant.
    ///
    /// Returns `false` if the user was already a member; in that case the
    /// participant is only marked connected.
    pub fn join(&mut self, user_id: UserId, at: Timestamp) -> Result<bool, StoreError> {
        if !self.state.accepts_joins() {
            return Err(StoreError::JoinClosed { state: self.state });
        }

        if let Some(existing) = self.participant_mut(user_id) {
            if !existing.connected {
                existing.connected = true;
                self.revision += 1;
            }
            return Ok(false);
        }

        self.participants.push(Participant::new(user_id, at));
        self.revision += 1;
        Ok(true)
    }

    /// Remove a participant and its metrics.
    pub fn leave(&mut self, user_id: UserId) -> Result<(), StoreError> {
        self.ensure_live()?;

        let index = self
            .participants
            .iter()
            .position(|p| p.user_id == user_id)
            .ok_or(StoreError::UnknownParticipant {
                session_id: self.id,
                user_id,
            })?;
        self.participants.remove(index);
        self.revision += 1;
        Ok(())
    }

    /// Set a participant's connection status. Returns whether it changed.
    pub fn set_connected(&mut self, user_id: UserId, connected: bool) -> Result<bool, StoreError> {
        self.ensure_live()?;

        let session_id = self.id;
        let participant =
            self.participant_mut(user_id)
                .ok_or(StoreError::UnknownParticipant {
                    session_id,
                    user_id,
                })?;
        if participant.connected == connected {
            return Ok(false);
        }
        participant.connected = connected;
        self.revision += 1;
        Ok(true)
    }

    /// Move along one edge of the lifecycle state machine.
    ///
    /// Returns the previous state.
    pub fn transition(&mut self, to: LifecycleState) -> Result<LifecycleState, StoreError> {
        let from = self.state;
        if !from.can_transition_to(to) {
            return Err(StoreError::InvalidTransition { from, to });
        }
        self.state = to;
        self.revision += 1;
        Ok(from)
    }

    /// Apply an accepted event and return the resulting snapshot.
    ///
    /// The event must carry exactly [`SessionState::next_sequence`]; anything
    /// else is rejected as stale and leaves the state untouched. Events are
    /// never reordered here.
    pub fn apply_event(&mut self, event: &TelemetryEvent) -> Result<SessionSnapshot, StoreError> {
        if event.session_id != self.id {
            return Err(StoreError::WrongSession {
                expected: self.id,
                actual: event.session_id,
            });
        }
        if !self.state.accepts_events() {
            return Err(StoreError::NotAccepting { state: self.state });
        }
        let expected = self.next_sequence();
        if event.sequence != expected {
            return Err(StoreError::StaleEvent {
                expected,
                actual: event.sequence,
            });
        }

        if !event.payload.is_well_formed() {
            return Err(StoreError::MalformedPayload {
                sequence: event.sequence,
            });
        }

        let session_id = self.id;
        let participant =
            self.participant_mut(event.participant_id)
                .ok_or(StoreError::UnknownParticipant {
                    session_id,
                    user_id: event.participant_id,
                })?;
        participant.record(event);

        self.sequence = expected;
        self.revision += 1;
        Ok(self.snapshot())
    }

    /// Current aggregate view.
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.id,
            owner_id: self.owner_id,
            state: self.state,
            created_at: self.created_at,
            target_distance_m: self.target_distance_m,
            sequence: self.sequence,
            revision: self.revision,
            participants: self
                .participants
                .iter()
                .map(|p| p.to_snapshot(self.target_distance_m))
                .collect(),
            digest: self.state_digest(),
        }
    }

    /// FNV-1a 64 over the canonical little-endian encoding of the state.
    ///
    /// Participants are hashed in join order, f64 values canonicalized.
    pub fn state_digest(&self) -> u64 {
        let mut hasher = Fnv1a64::new();

        hasher.u64(self.id);
        hasher.u64(self.owner_id);
        hasher.u64(self.created_at);
        hasher.update(&[self.state.digest_code()]);
        hasher.flag(self.target_distance_m.is_some());
        if let Some(target) = self.target_distance_m {
            hasher.f64(target);
        }
        hasher.u64(self.sequence);
        hasher.u64(self.revision);
        hasher.u64(self.participants.len() as u64);

        for participant in &self.participants {
            hasher.u64(participant.user_id);
            hasher.u64(participant.joined_at);
            hasher.f64(participant.metrics.distance_m);
            hasher.u64(participant.metrics.stroke_count);
            hasher.u64(participant.metrics.elapsed_ms);
            hasher.f64(participant.metrics.last_stroke_rate_spm);
            hasher.flag(participant.connected);
            hasher.flag(participant.first_client_timestamp.is_some());
            if let Some(first) = participant.first_client_timestamp {
                hasher.u64(first);
            }
        }

        hasher.finish()
    }

    // ========================================================================
    // Internal Methods
    // ========================================================================

    fn participant_mut(&mut self, user_id: UserId) -> Option<&mut Participant> {
        self.participants.iter_mut().find(|p| p.user_id == user_id)
    }

    fn ensure_live(&self) -> Result<(), StoreError> {
        if self.state.is_terminal() {
            return Err(StoreError::Terminal { state: self.state });
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SESSION: SessionId = 7;
    const OWNER: UserId = 100;
    const ALICE: UserId = 1;
    const BOB: UserId = 2;

    fn stroke(
        state: &SessionState,
        participant_id: UserId,
        client_timestamp: Timestamp,
        distance: f64,
    ) -> TelemetryEvent {
        TelemetryEvent {
            session_id: state.id(),
            participant_id,
            sequence: state.next_sequence(),
            client_timestamp,
            server_timestamp: client_timestamp + 5,
            payload: StrokePayload {
                distance_delta_m: distance,
                stroke_rate_spm: 24.0,
                strokes: 1,
            },
        }
    }

    fn active_session(target: Option<f64>) -> SessionState {
        let mut state = SessionState::new(SESSION, OWNER, 1_000, target);
        state.join(ALICE, 1_001).unwrap();
        state.join(BOB, 1_002).unwrap();
        state.transition(LifecycleState::Active).unwrap();
        state
    }

    #[test]
    fn test_new_session_starts_created() {
        let state = SessionState::new(SESSION, OWNER, 1_000, None);
        assert_eq!(state.state(), LifecycleState::Created);
        assert_eq!(state.sequence(), 0);
        assert_eq!(state.next_sequence(), 1);
        assert_eq!(state.revision(), 0);
        assert_eq!(state.participant_count(), 0);
    }

    #[test]
    fn test_three_and_two_strokes() {
        let mut state = active_session(None);

        for i in 0..3 {
            let event = stroke(&state, ALICE, 10_000 + i * 2_500, 9.5);
            state.apply_event(&event).unwrap();
        }
        for i in 0..2 {
            let event = stroke(&state, BOB, 20_000 + i * 2_500, 10.0);
            state.apply_event(&event).unwrap();
        }

        let snapshot = state.snapshot();
        assert_eq!(snapshot.sequence, 5);
        assert_eq!(snapshot.participant(ALICE).unwrap().metrics.stroke_count, 3);
        assert_eq!(snapshot.participant(BOB).unwrap().metrics.stroke_count, 2);
        assert_eq!(snapshot.participant(ALICE).unwrap().metrics.distance_m, 28.5);
        assert_eq!(snapshot.participant(ALICE).unwrap().metrics.elapsed_ms, 5_000);
        assert_eq!(snapshot.participant(BOB).unwrap().metrics.elapsed_ms, 2_500);
    }

    #[test]
    fn test_stale_sequence_rejected_without_mutation() {
        let mut state = active_session(None);
        let first = stroke(&state, ALICE, 10_000, 10.0);
        state.apply_event(&first).unwrap();
        let digest_before = state.state_digest();

        // Replayed sequence 1.
        let replayed = TelemetryEvent {
            sequence: 1,
            ..first.clone()
        };
        assert_eq!(
            state.apply_event(&replayed),
            Err(StoreError::StaleEvent {
                expected: 2,
                actual: 1
            })
        );

        // Skipping ahead is stale too; nothing is reordered.
        let skipped = TelemetryEvent {
            sequence: 5,
            ..first
        };
        assert!(matches!(
            state.apply_event(&skipped),
            Err(StoreError::StaleEvent { expected: 2, .. })
        ));

        assert_eq!(state.state_digest(), digest_before);
        assert_eq!(state.sequence(), 1);
    }

    #[test]
    fn test_paused_session_does_not_accept_events() {
        let mut state = active_session(None);
        state.transition(LifecycleState::Paused).unwrap();
        let digest_before = state.state_digest();

        let event = stroke(&state, ALICE, 10_000, 10.0);
        assert_eq!(
            state.apply_event(&event),
            Err(StoreError::NotAccepting {
                state: LifecycleState::Paused
            })
        );
        assert_eq!(state.state_digest(), digest_before);
    }

    #[test]
    fn test_unknown_participant_rejected() {
        let mut state = active_session(None);
        let event = stroke(&state, 999, 10_000, 10.0);
        assert!(matches!(
            state.apply_event(&event),
            Err(StoreError::UnknownParticipant { user_id: 999, .. })
        ));
        assert_eq!(state.sequence(), 0);
    }

    #[test]
    fn test_malformed_payload_rejected_without_mutation() {
        let mut state = active_session(None);
        let digest_before = state.state_digest();

        for distance in [f64::NAN, f64::INFINITY, -1.0] {
            let event = stroke(&state, ALICE, 10_000, distance);
            assert_eq!(
                state.apply_event(&event),
                Err(StoreError::MalformedPayload { sequence: 1 })
            );
        }
        let mut event = stroke(&state, ALICE, 10_000, 10.0);
        event.payload.stroke_rate_spm = f64::NEG_INFINITY;
        assert!(state.apply_event(&event).is_err());

        assert_eq!(state.state_digest(), digest_before);
        assert_eq!(state.sequence(), 0);
    }

    #[test]
    fn test_payload_limits() {
        let limits = PayloadLimits {
            max_distance_delta_m: 50.0,
            max_stroke_rate_spm: 60.0,
            max_strokes_per_event: 2,
        };
        let ok = StrokePayload {
            distance_delta_m: 50.0,
            stroke_rate_spm: 0.0,
            strokes: 2,
        };
        assert!(ok.is_within(&limits));
        assert!(!StrokePayload { strokes: 3, ..ok }.is_within(&limits));
        assert!(!StrokePayload { distance_delta_m: 50.5, ..ok }.is_within(&limits));
        assert!(!StrokePayload { stroke_rate_spm: f64::NAN, ..ok }.is_within(&limits));
    }

    #[test]
    fn test_wrong_session_rejected() {
        let mut state = active_session(None);
        let mut event = stroke(&state, ALICE, 10_000, 10.0);
        event.session_id = SESSION + 1;
        assert!(matches!(
            state.apply_event(&event),
            Err(StoreError::WrongSession { .. })
        ));
    }

    #[test]
    fn test_lifecycle_edges() {
        use LifecycleState::*;

        let all = [Created, Active, Paused, Completed, Abandoned];
        let allowed = [
            (Created, Active),
            (Active, Paused),
            (Paused, Active),
            (Created, Completed),
            (Active, Completed),
            (Paused, Completed),
            (Active, Abandoned),
            (Paused, Abandoned),
        ];

        for from in all {
            for to in all {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn test_invalid_transition_leaves_state() {
        let mut state = SessionState::new(SESSION, OWNER, 0, None);
        assert_eq!(
            state.transition(LifecycleState::Paused),
            Err(StoreError::InvalidTransition {
                from: LifecycleState::Created,
                to: LifecycleState::Paused
            })
        );
        assert_eq!(state.state(), LifecycleState::Created);
        assert_eq!(state.revision(), 0);
    }

    #[test]
    fn test_join_closed_when_paused_or_terminal() {
        let mut state = active_session(None);
        state.transition(LifecycleState::Paused).unwrap();
        assert_eq!(
            state.join(3, 5_000),
            Err(StoreError::JoinClosed {
                state: LifecycleState::Paused
            })
        );

        state.transition(LifecycleState::Completed).unwrap();
        assert!(matches!(
            state.join(3, 5_000),
            Err(StoreError::JoinClosed { .. })
        ));
        assert!(matches!(
            state.set_connected(ALICE, false),
            Err(StoreError::Terminal { .. })
        ));
    }

    #[test]
    fn test_rejoin_only_reconnects() {
        let mut state = active_session(None);
        state.set_connected(ALICE, false).unwrap();
        assert_eq!(state.connected_count(), 1);

        let added = state.join(ALICE, 9_999).unwrap();
        assert!(!added);
        assert_eq!(state.participant_count(), 2);
        assert_eq!(state.connected_count(), 2);
        // Original join timestamp is kept.
        assert_eq!(state.snapshot().participant(ALICE).unwrap().joined_at, 1_001);
    }

    #[test]
    fn test_leave_removes_participant() {
        let mut state = active_session(None);
        state.leave(ALICE).unwrap();
        assert!(!state.is_member(ALICE));
        assert_eq!(state.snapshot().participants.len(), 1);
        assert!(matches!(
            state.leave(ALICE),
            Err(StoreError::UnknownParticipant { .. })
        ));
    }

    #[test]
    fn test_set_connected_reports_change() {
        let mut state = active_session(None);
        let revision = state.revision();
        assert!(state.set_connected(BOB, false).unwrap());
        assert!(!state.set_connected(BOB, false).unwrap());
        assert_eq!(state.revision(), revision + 1);
    }

    #[test]
    fn test_all_finished_needs_target() {
        let mut open = active_session(None);
        let event = stroke(&open, ALICE, 0, 5_000.0);
        open.apply_event(&event).unwrap();
        assert!(!open.all_finished());

        let mut race = active_session(Some(500.0));
        let event = stroke(&race, ALICE, 0, 250.0);
        race.apply_event(&event).unwrap();
        let event = stroke(&race, ALICE, 1_000, 250.0);
        let snapshot = race.apply_event(&event).unwrap();
        assert!(snapshot.participant(ALICE).unwrap().finished);
        assert!(!race.all_finished());

        let event = stroke(&race, BOB, 0, 600.0);
        race.apply_event(&event).unwrap();
        assert!(race.all_finished());
    }

    #[test]
    fn test_elapsed_never_decreases() {
        let mut state = active_session(None);
        for ts in [1_000, 4_000, 3_500] {
            let event = stroke(&state, ALICE, ts, 1.0);
            state.apply_event(&event).unwrap();
        }
        assert_eq!(
            state.snapshot().participant(ALICE).unwrap().metrics.elapsed_ms,
            3_000
        );
    }

    #[test]
    fn test_digest_changes_with_state() {
        let mut state = active_session(None);
        let before = state.state_digest();
        let event = stroke(&state, ALICE, 0, 10.0);
        state.apply_event(&event).unwrap();
        assert_ne!(before, state.state_digest());
    }

    #[test]
    fn test_f64_canonicalization() {
        assert_eq!(canonicalize_f64(-0.0), canonicalize_f64(0.0));
        assert_eq!(canonicalize_f64(-0.0), 0u64);

        let other_nan = f64::from_bits(0x7ff0000000000001);
        assert_eq!(canonicalize_f64(f64::NAN), canonicalize_f64(other_nan));
        assert_eq!(canonicalize_f64(f64::NAN), 0x7ff8000000000000);

        assert_eq!(canonicalize_f64(1.5), 1.5f64.to_bits());
    }

    // ========================================================================
    // Replay properties
    // ========================================================================

    fn run_log(log: &[(usize, f64, u32, u64)]) -> (SessionSnapshot, Vec<Sequence>) {
        let members = [ALICE, BOB, 3];
        let mut state = SessionState::new(SESSION, OWNER, 0, Some(2_000.0));
        for (i, &user) in members.iter().enumerate() {
            state.join(user, i as u64).unwrap();
        }
        state.transition(LifecycleState::Active).unwrap();

        let mut clock = [0u64; 3];
        let mut sequences = Vec::new();
        for &(who, distance, strokes, gap) in log {
            clock[who] += gap;
            let event = TelemetryEvent {
                session_id: SESSION,
                participant_id: members[who],
                sequence: state.next_sequence(),
                client_timestamp: clock[who],
                server_timestamp: clock[who],
                payload: StrokePayload {
                    distance_delta_m: distance,
                    stroke_rate_spm: 30.0,
                    strokes,
                },
            };
            let snapshot = state.apply_event(&event).unwrap();
            sequences.push(snapshot.sequence);
        }
        (state.snapshot(), sequences)
    }

    proptest! {
        #[test]
        fn replay_is_deterministic(
            log in prop::collection::vec((0usize..3, 0.0f64..50.0, 0u32..3, 0u64..5_000), 0..64)
        ) {
            let (first, _) = run_log(&log);
            let (second, _) = run_log(&log);
            prop_assert_eq!(first, second);
        }

        #[test]
        fn sequences_are_gap_free(
            log in prop::collection::vec((0usize..3, 0.0f64..50.0, 0u32..3, 0u64..5_000), 1..64)
        ) {
            let (snapshot, sequences) = run_log(&log);
            let expected: Vec<Sequence> = (1..=log.len() as u64).collect();
            prop_assert_eq!(sequences, expected);
            prop_assert_eq!(snapshot.sequence, log.len() as u64);
        }
    }
}
