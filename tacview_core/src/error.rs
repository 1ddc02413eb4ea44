//! Error and rejection types.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why an inbound record was dropped at the ingestion boundary.
///
/// These are counted, never propagated: the engine keeps serving.
#[derive(Debug, Clone, Copy, PartialEq, Error, Serialize, Deserialize)]
pub enum RejectReason {
    #[error("empty uid")]
    EmptyUid,

    #[error("latitude out of range: {0}")]
    LatitudeOutOfRange(f64),

    #[error("longitude out of range: {0}")]
    LongitudeOutOfRange(f64),

    #[error("non-finite coordinate")]
    NonFiniteCoordinate,

    /// The validity window cannot be represented (timestamps at the edge of time)
    #[error("timestamp out of range")]
    TimestampOutOfRange,
}

/// Why a valid record was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IgnoreReason {
    /// Observed before the entity's current `last_updated_at`
    OutOfOrder,
    /// The entity is already withdrawn and awaiting deletion
    PendingRemoval,
}

/// Errors raised while building or changing configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}
