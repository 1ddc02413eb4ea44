//! Engine configuration.
//!
//! Every tunable is externally supplied: build an [`EngineConfig`] in code,
//! or load it from JSON. Missing fields take their defaults.

use crate::error::ConfigError;
use chrono::Duration;
use h3o::Resolution;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Position-history admission and retention limits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryLimits {
    /// Maximum samples kept per entity (default: 100)
    pub max_entries: usize,

    /// Samples older than this are dropped (default: 3600 s)
    pub max_age_secs: f64,

    /// A sample this far from the last one is always admitted (default: 5 m)
    pub min_distance_m: f64,

    /// A sample this long after the last one is always admitted (default: 30 s)
    pub min_interval_secs: f64,
}

impl Default for HistoryLimits {
    fn default() -> Self {
        Self {
            max_entries: 100,
            max_age_secs: 3600.0,
            min_distance_m: 5.0,
            min_interval_secs: 30.0,
        }
    }
}

impl HistoryLimits {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_entries == 0 {
            return Err(ConfigError::invalid("history.max_entries", "must be at least 1"));
        }
        window_secs("history.max_age_secs", self.max_age_secs, false)?;
        non_negative("history.min_distance_m", self.min_distance_m)?;
        window_secs("history.min_interval_secs", self.min_interval_secs, true)?;
        Ok(())
    }

    pub(crate) fn max_age(&self) -> Duration {
        secs_to_duration(self.max_age_secs)
    }

    pub(crate) fn min_interval(&self) -> Duration {
        secs_to_duration(self.min_interval_secs)
    }
}

/// Configuration for the entity store, query engine and background loops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum resident entities (default: 10,000)
    pub capacity: usize,

    /// How long an entity stays `Stale` before deletion (default: 60 s)
    pub retention_window_secs: f64,

    /// Substituted validity when a report has `stale_at <= observed_at` (default: 300 s)
    pub default_validity_secs: f64,

    /// UI-level "stale but still shown" threshold, independent of the
    /// lifecycle retention window (default: 900 s)
    pub display_stale_after_secs: f64,

    /// Cadence of the background sweep (default: 5 s)
    pub sweep_interval_secs: f64,

    pub history: HistoryLimits,

    /// Bound of the inbound coalescing queue (default: 4096)
    pub inbound_queue_capacity: usize,

    /// Records applied per write-lock acquisition when draining (default: 256)
    pub ingest_chunk_size: usize,

    /// Buffer of the change-notification channel (default: 1024)
    pub event_channel_capacity: usize,

    /// H3 resolution of the proximity index (default: 8, ~530 m edges)
    pub h3_resolution: u8,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            retention_window_secs: 60.0,
            default_validity_secs: 300.0,
            display_stale_after_secs: 900.0,
            sweep_interval_secs: 5.0,
            history: HistoryLimits::default(),
            inbound_queue_capacity: 4096,
            ingest_chunk_size: 256,
            event_channel_capacity: 1024,
            h3_resolution: 8,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::invalid("capacity", "must be at least 1"));
        }
        window_secs("retention_window_secs", self.retention_window_secs, true)?;
        window_secs("default_validity_secs", self.default_validity_secs, false)?;
        window_secs("display_stale_after_secs", self.display_stale_after_secs, true)?;
        window_secs("sweep_interval_secs", self.sweep_interval_secs, false)?;
        self.history.validate()?;
        if self.inbound_queue_capacity == 0 {
            return Err(ConfigError::invalid("inbound_queue_capacity", "must be at least 1"));
        }
        if self.ingest_chunk_size == 0 {
            return Err(ConfigError::invalid("ingest_chunk_size", "must be at least 1"));
        }
        if self.event_channel_capacity == 0 {
            return Err(ConfigError::invalid("event_channel_capacity", "must be at least 1"));
        }
        self.resolution()?;
        Ok(())
    }

    pub fn resolution(&self) -> Result<Resolution, ConfigError> {
        Resolution::try_from(self.h3_resolution)
            .map_err(|e| ConfigError::invalid("h3_resolution", format!("{:?}", e)))
    }

    pub(crate) fn retention_window(&self) -> Duration {
        secs_to_duration(self.retention_window_secs)
    }

    pub(crate) fn default_validity(&self) -> Duration {
        secs_to_duration(self.default_validity_secs)
    }

    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.sweep_interval_secs)
    }
}

/// Upper bound for every configured time window (100 years).
pub const MAX_WINDOW_SECS: f64 = 100.0 * 365.25 * 86_400.0;

/// Converts fractional seconds to a chrono duration at millisecond precision.
pub(crate) fn secs_to_duration(secs: f64) -> Duration {
    Duration::milliseconds((secs * 1000.0).round() as i64)
}

pub(crate) fn positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, format!("must be a positive number, got {}", value)))
    }
}

/// A time window in seconds: finite, within [`MAX_WINDOW_SECS`], and
/// positive unless `allow_zero`.
pub(crate) fn window_secs(field: &'static str, value: f64, allow_zero: bool) -> Result<(), ConfigError> {
    if allow_zero {
        non_negative(field, value)?;
    } else {
        positive(field, value)?;
    }
    if value > MAX_WINDOW_SECS {
        return Err(ConfigError::invalid(
            field,
            format!("must be at most {} s, got {}", MAX_WINDOW_SECS, value),
        ));
    }
    Ok(())
}

pub(crate) fn non_negative(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, format!("must be a non-negative number, got {}", value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.capacity, 10_000);
        assert_eq!(config.retention_window_secs, 60.0);
        assert_eq!(config.default_validity_secs, 300.0);
        assert_eq!(config.sweep_interval_secs, 5.0);
        assert_eq!(config.history.max_entries, 100);
        assert_eq!(config.history.min_distance_m, 5.0);
        assert_eq!(config.history.min_interval_secs, 30.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = EngineConfig::from_json_str(r#"{"capacity": 2, "history": {"max_entries": 10}}"#).unwrap();
        assert_eq!(config.capacity, 2);
        assert_eq!(config.history.max_entries, 10);
        assert_eq!(config.history.min_interval_secs, 30.0);
        assert_eq!(config.retention_window_secs, 60.0);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = EngineConfig::from_json_str(r#"{"capacity": 0}"#).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field: "capacity", .. }));

        let err = EngineConfig::from_json_str(r#"{"h3_resolution": 16}"#).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field: "h3_resolution", .. }));

        let err = EngineConfig::from_json_str(r#"{"sweep_interval_secs": -1.0}"#).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let err = EngineConfig::from_json_str("not json").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_time_windows_are_bounded() {
        let limits = HistoryLimits {
            max_age_secs: 1e13,
            ..HistoryLimits::default()
        };
        let err = limits.validate().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field: "history.max_age_secs", .. }));

        let err = EngineConfig::from_json_str(r#"{"default_validity_secs": 1e300}"#).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field: "default_validity_secs", .. }));

        let config = EngineConfig {
            retention_window_secs: MAX_WINDOW_SECS,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file() {
        let err = EngineConfig::from_json_file("/nonexistent/tacview.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn test_secs_to_duration() {
        assert_eq!(secs_to_duration(1.5), Duration::milliseconds(1500));
        assert_eq!(secs_to_duration(300.0), Duration::minutes(5));
    }
}
