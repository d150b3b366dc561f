//! Coordinator error taxonomy.

use strokesync_store::{LifecycleState, Sequence, SessionId, StoreError, UserId};

use crate::validation::ValidationError;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CoordinatorError {
    #[error("session {session_id} not found")]
    SessionNotFound { session_id: SessionId },

    #[error("user {user_id} is not a participant of session {session_id}")]
    ParticipantNotFound {
        session_id: SessionId,
        user_id: UserId,
    },

    /// The caller should refresh its view and retry.
    #[error("stale event: expected sequence {expected}, got {actual}")]
    StaleEvent { expected: Sequence, actual: Sequence },

    #[error("cannot {operation} session {session_id}: session is {state}")]
    SessionClosed {
        session_id: SessionId,
        state: LifecycleState,
        operation: &'static str,
    },

    #[error("invalid telemetry: {0}")]
    Validation(#[from] ValidationError),
}

impl CoordinatorError {
    /// Map a store rejection raised while running `operation`.
    pub fn from_store(err: StoreError, session_id: SessionId, operation: &'static str) -> Self {
        match err {
            StoreError::StaleEvent { expected, actual } => Self::StaleEvent { expected, actual },
            StoreError::UnknownParticipant {
                session_id,
                user_id,
            } => Self::ParticipantNotFound {
                session_id,
                user_id,
            },
            StoreError::InvalidTransition { from: state, .. }
            | StoreError::NotAccepting { state }
            | StoreError::JoinClosed { state }
            | StoreError::Terminal { state } => Self::SessionClosed {
                session_id,
                state,
                operation,
            },
            StoreError::WrongSession { actual, .. } => Self::SessionNotFound { session_id: actual },
            StoreError::MalformedPayload { .. } => {
                Self::Validation(ValidationError::MalformedPayload)
            }
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::SessionNotFound { .. } | Self::ParticipantNotFound { .. }
        )
    }

    /// Errors handed back to the calling participant for a local retry or
    /// backoff: every validation failure and stale sequences.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StaleEvent { .. } | Self::Validation(_))
    }

    /// Lifecycle violations shown to the user as a denial.
    pub fn is_user_visible_denial(&self) -> bool {
        matches!(self, Self::SessionClosed { .. })
    }
}

pub type Result<T, E = CoordinatorError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_mapping() {
        let stale = CoordinatorError::from_store(
            StoreError::StaleEvent {
                expected: 3,
                actual: 5,
            },
            1,
            "submit",
        );
        assert_eq!(
            stale,
            CoordinatorError::StaleEvent {
                expected: 3,
                actual: 5
            }
        );
        assert!(stale.is_retryable());

        let paused = CoordinatorError::from_store(
            StoreError::NotAccepting {
                state: LifecycleState::Paused,
            },
            1,
            "submit",
        );
        assert!(paused.is_user_visible_denial());
        assert_eq!(
            paused.to_string(),
            "cannot submit session 1: session is paused"
        );

        let transition = CoordinatorError::from_store(
            StoreError::InvalidTransition {
                from: LifecycleState::Completed,
                to: LifecycleState::Active,
            },
            4,
            "resume",
        );
        assert!(matches!(
            transition,
            CoordinatorError::SessionClosed {
                state: LifecycleState::Completed,
                ..
            }
        ));

        let unknown = CoordinatorError::from_store(
            StoreError::UnknownParticipant {
                session_id: 1,
                user_id: 9,
            },
            1,
            "leave",
        );
        assert!(unknown.is_not_found());
    }

    #[test]
    fn test_validation_conversion() {
        let err: CoordinatorError = ValidationError::NegativeDistance { delta: -1.0 }.into();
        assert!(!err.is_not_found());
        assert!(!err.is_user_visible_denial());
        assert!(err.to_string().starts_with("invalid telemetry"));
    }

    #[test]
    fn test_validation_and_staleness_are_retryable() {
        let rejected = [
            ValidationError::RateLimited { limit: 20 },
            ValidationError::TimestampRegressed {
                timestamp: 1_000,
                newest: 5_000,
                tolerance_ms: 2_000,
            },
            ValidationError::TooManyStrokes { strokes: 9, max: 4 },
        ];
        for err in rejected {
            assert!(CoordinatorError::from(err).is_retryable());
        }

        let malformed = CoordinatorError::from_store(
            StoreError::MalformedPayload { sequence: 2 },
            1,
            "submit",
        );
        assert_eq!(
            malformed,
            CoordinatorError::Validation(ValidationError::MalformedPayload)
        );
        assert!(malformed.is_retryable());

        let closed = CoordinatorError::SessionClosed {
            session_id: 1,
            state: LifecycleState::Completed,
            operation: "submit",
        };
        assert!(!closed.is_retryable());
        assert!(!CoordinatorError::SessionNotFound { session_id: 1 }.is_retryable());
    }
}
