//! Coordinator configuration: defaults, then an optional TOML file, then
//! environment variables.
//!
//! Environment convention: `STROKESYNC_<SECTION>_<FIELD>`, for example
//! `STROKESYNC_LIFECYCLE_ABANDON_TIMEOUT_MS`.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;
use tracing::debug;

use crate::broadcast::BroadcastConfig;
use crate::lifecycle::LifecycleConfig;
use crate::validation::ValidationConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {}: {source}", path.display())]
    TomlParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value for {key}: {message}")]
    InvalidEnv { key: String, message: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub validation: ValidationConfig,
    pub broadcast: BroadcastConfig,
    pub lifecycle: LifecycleConfig,
    /// Where finished session logs are written. No archive when unset.
    pub archive_dir: Option<PathBuf>,
}

impl ServerConfig {
    /// Load from `path` (if given) and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                debug!("no config file, using defaults");
                Self::default()
            }
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = %path.display(), "loading config file");
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::TomlParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `STROKESYNC_*` overrides read through `lookup`.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let env = |key: &str| lookup(key).filter(|v| !v.is_empty());

        let v = &mut self.validation;
        override_parsed(
            &env,
            "STROKESYNC_VALIDATION_MAX_DISTANCE_DELTA_M",
            &mut v.max_distance_delta_m,
        )?;
        override_parsed(
            &env,
            "STROKESYNC_VALIDATION_MAX_STROKE_RATE_SPM",
            &mut v.max_stroke_rate_spm,
        )?;
        override_parsed(
            &env,
            "STROKESYNC_VALIDATION_MAX_STROKES_PER_EVENT",
            &mut v.max_strokes_per_event,
        )?;
        override_parsed(
            &env,
            "STROKESYNC_VALIDATION_TIMESTAMP_TOLERANCE_MS",
            &mut v.timestamp_tolerance_ms,
        )?;
        override_parsed(
            &env,
            "STROKESYNC_VALIDATION_MAX_EVENTS_PER_SEC",
            &mut v.max_events_per_sec,
        )?;

        override_parsed(
            &env,
            "STROKESYNC_BROADCAST_SUBSCRIBER_BUFFER",
            &mut self.broadcast.subscriber_buffer,
        )?;

        let l = &mut self.lifecycle;
        override_parsed(
            &env,
            "STROKESYNC_LIFECYCLE_ABANDON_TIMEOUT_MS",
            &mut l.abandon_timeout_ms,
        )?;
        override_parsed(&env, "STROKESYNC_LIFECYCLE_SWEEP_INTERVAL_MS", &mut l.sweep_interval_ms)?;
        override_parsed(
            &env,
            "STROKESYNC_LIFECYCLE_TOMBSTONE_CAPACITY",
            &mut l.tombstone_capacity,
        )?;

        if let Some(dir) = env("STROKESYNC_ARCHIVE_DIR") {
            self.archive_dir = Some(PathBuf::from(dir));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let v = &self.validation;
        if !(v.max_distance_delta_m.is_finite() && v.max_distance_delta_m > 0.0) {
            return Err(ConfigError::Invalid(
                "validation.max_distance_delta_m must be a positive number".into(),
            ));
        }
        if !(v.max_stroke_rate_spm.is_finite() && v.max_stroke_rate_spm > 0.0) {
            return Err(ConfigError::Invalid(
                "validation.max_stroke_rate_spm must be a positive number".into(),
            ));
        }
        if v.max_events_per_sec == 0 {
            return Err(ConfigError::Invalid(
                "validation.max_events_per_sec must be greater than 0".into(),
            ));
        }
        if self.broadcast.subscriber_buffer == 0 {
            return Err(ConfigError::Invalid(
                "broadcast.subscriber_buffer must be greater than 0".into(),
            ));
        }
        if self.lifecycle.abandon_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "lifecycle.abandon_timeout_ms must be greater than 0".into(),
            ));
        }
        if self.lifecycle.sweep_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "lifecycle.sweep_interval_ms must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

fn override_parsed<T: FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) -> Result<(), ConfigError> {
    if let Some(raw) = env(key) {
        *target = raw.parse().map_err(|_| ConfigError::InvalidEnv {
            key: key.to_string(),
            message: format!("cannot parse '{raw}'"),
        })?;
    }
    Ok(())
}
