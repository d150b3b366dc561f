//! Per-participant intake history.
//!
//! - Newest accepted client timestamp, for the monotonicity check
//! - Fixed one-second server-time windows for rate limiting
//!
//! `check` is pure; `record` is called only after the event was applied, so a
//! rejected report leaves no trace.

use std::collections::HashMap;

use strokesync_store::{Timestamp, UserId};

use crate::validation::{ValidationConfig, ValidationError};

const RATE_WINDOW_MS: u64 = 1_000;

#[derive(Debug, Clone, Default)]
struct ParticipantIntake {
    newest_client_timestamp: Option<Timestamp>,
    window_start: Timestamp,
    window_count: u32,
}

impl ParticipantIntake {
    fn count_at(&self, now: Timestamp) -> u32 {
        if now.saturating_sub(self.window_start) >= RATE_WINDOW_MS {
            0
        } else {
            self.window_count
        }
    }
}

#[derive(Debug, Clone)]
pub struct IntakeTracker {
    config: ValidationConfig,
    participants: HashMap<UserId, ParticipantIntake>,
}

impl IntakeTracker {
    pub fn new(config: ValidationConfig) -> Self {
        Self {
            config,
            participants: HashMap::new(),
        }
    }

    pub fn config(&self) -> &ValidationConfig {
        &self.config
    }

    /// Would a report stamped `client_timestamp`, arriving at `now`, pass?
    pub fn check(
        &self,
        user_id: UserId,
        client_timestamp: Timestamp,
        now: Timestamp,
    ) -> Result<(), ValidationError> {
        let Some(intake) = self.participants.get(&user_id) else {
            return Ok(());
        };

        if let Some(newest) = intake.newest_client_timestamp
            && client_timestamp.saturating_add(self.config.timestamp_tolerance_ms) < newest
        {
            return Err(ValidationError::TimestampRegressed {
                timestamp: client_timestamp,
                newest,
                tolerance_ms: self.config.timestamp_tolerance_ms,
            });
        }

        if intake.count_at(now) >= self.config.max_events_per_sec {
            return Err(ValidationError::RateLimited {
                limit: self.config.max_events_per_sec,
            });
        }

        Ok(())
    }

    /// Record an accepted report.
    pub fn record(&mut self, user_id: UserId, client_timestamp: Timestamp, now: Timestamp) {
        let intake = self.participants.entry(user_id).or_default();

        intake.newest_client_timestamp = Some(
            intake
                .newest_client_timestamp
                .map_or(client_timestamp, |newest| newest.max(client_timestamp)),
        );

        if intake.count_at(now) == 0 {
            intake.window_start = now;
            intake.window_count = 0;
        }
        intake.window_count += 1;
    }

    /// Drop history for a participant that left.
    pub fn forget(&mut self, user_id: UserId) {
        self.participants.remove(&user_id);
    }

    #[cfg(test)]
    pub fn has_history(&self, user_id: UserId) -> bool {
        self.participants.contains_key(&user_id)
    }
}
