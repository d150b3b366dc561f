//! Telemetry validation for the coordinator.
//!
//! Rejections never mutate session state:
//! - NaN/Inf in distance or stroke rate: REJECT
//! - Negative or oversized distance delta: REJECT
//! - Stroke rate outside `[0, max]`: REJECT
//! - Too many strokes in one report: REJECT
//! - Client timestamp behind the newest accepted one beyond tolerance: REJECT
//! - Report rate limit exceeded: REJECT

use serde::Deserialize;
use strokesync_store::{PayloadLimits, StrokePayload, Timestamp, UserId};
use strokesync_wire::RawTelemetryProto;

use crate::intake::IntakeTracker;

/// Validation configuration.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub max_distance_delta_m: f64,
    pub max_stroke_rate_spm: f64,
    pub max_strokes_per_event: u32,
    /// How far a client timestamp may fall behind the participant's newest
    /// accepted one before the report is rejected.
    pub timestamp_tolerance_ms: u64,
    pub max_events_per_sec: u32,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_distance_delta_m: 100.0,
            max_stroke_rate_spm: 80.0,
            max_strokes_per_event: 4,
            timestamp_tolerance_ms: 2_000,
            max_events_per_sec: 20,
        }
    }
}

impl ValidationConfig {
    /// Payload bounds in force, recorded with each session log.
    pub fn payload_limits(&self) -> PayloadLimits {
        PayloadLimits {
            max_distance_delta_m: self.max_distance_delta_m,
            max_stroke_rate_spm: self.max_stroke_rate_spm,
            max_strokes_per_event: self.max_strokes_per_event,
        }
    }
}

/// Why a report was refused.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("{field} is not a finite number")]
    NonFinite { field: &'static str },

    #[error("distance delta {delta} is negative")]
    NegativeDistance { delta: f64 },

    #[error("distance delta {delta} exceeds {max}")]
    DistanceTooLarge { delta: f64, max: f64 },

    #[error("stroke rate {rate} is outside [0, {max}]")]
    StrokeRateOutOfRange { rate: f64, max: f64 },

    #[error("{strokes} strokes in one report exceeds {max}")]
    TooManyStrokes { strokes: u32, max: u32 },

    #[error("client timestamp {timestamp} is more than {tolerance_ms}ms behind {newest}")]
    TimestampRegressed {
        timestamp: Timestamp,
        newest: Timestamp,
        tolerance_ms: u64,
    },

    #[error("more than {limit} reports per second")]
    RateLimited { limit: u32 },

    #[error("target distance {target} must be a positive finite number")]
    InvalidTarget { target: f64 },

    #[error("payload is not finite and non-negative")]
    MalformedPayload,
}

/// Range-check a raw report and turn it into a store payload.
pub fn validate_payload(
    raw: &RawTelemetryProto,
    config: &ValidationConfig,
) -> Result<StrokePayload, ValidationError> {
    let delta = raw.distance_delta_m;
    let rate = raw.stroke_rate_spm;

    if !delta.is_finite() {
        return Err(ValidationError::NonFinite {
            field: "distance_delta_m",
        });
    }
    if !rate.is_finite() {
        return Err(ValidationError::NonFinite {
            field: "stroke_rate_spm",
        });
    }

    if delta < 0.0 {
        return Err(ValidationError::NegativeDistance { delta });
    }
    if delta > config.max_distance_delta_m {
        return Err(ValidationError::DistanceTooLarge {
            delta,
            max: config.max_distance_delta_m,
        });
    }

    if !(0.0..=config.max_stroke_rate_spm).contains(&rate) {
        return Err(ValidationError::StrokeRateOutOfRange {
            rate,
            max: config.max_stroke_rate_spm,
        });
    }

    if raw.strokes > config.max_strokes_per_event {
        return Err(ValidationError::TooManyStrokes {
            strokes: raw.strokes,
            max: config.max_strokes_per_event,
        });
    }

    // -0.0 passes the sign check above; store it as +0.0.
    Ok(StrokePayload {
        distance_delta_m: delta + 0.0,
        stroke_rate_spm: rate + 0.0,
        strokes: raw.strokes,
    })
}

/// Validate a report from `user_id` received at server time `now`.
///
/// Membership and lifecycle are checked by the caller; this covers payload
/// ranges, timestamp monotonicity and rate limiting. Nothing is recorded.
pub fn validate_submission(
    raw: &RawTelemetryProto,
    now: Timestamp,
    intake: &IntakeTracker,
    user_id: UserId,
) -> Result<StrokePayload, ValidationError> {
    let payload = validate_payload(raw, intake.config())?;
    intake.check(user_id, raw.client_timestamp_ms, now)?;
    Ok(payload)
}

/// Validate a session's target distance at creation.
pub fn validate_target(target_distance_m: Option<f64>) -> Result<(), ValidationError> {
    match target_distance_m {
        Some(target) if !(target.is_finite() && target > 0.0) => {
            Err(ValidationError::InvalidTarget { target })
        }
        _ => Ok(()),
    }
}
