//! Diagnostic counters.
//!
//! Every rejection, repair, eviction and expiry bumps a counter so an
//! operator can spot a misbehaving upstream source without the engine
//! itself failing. The store owns a [`Diagnostics`] (single writer); the
//! inbound queue keeps its own counters; both are merged into a
//! serializable [`DiagnosticsSnapshot`] on request.

use crate::error::{IgnoreReason, RejectReason};
use serde::{Deserialize, Serialize};

/// Counters owned by the entity store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostics {
    /// Records that passed validation and were applied
    pub ingested: u64,
    pub created: u64,
    pub updated: u64,
    /// `Stale -> Active` transitions caused by a fresh report
    pub refreshed: u64,

    pub rejected_empty_uid: u64,
    pub rejected_latitude: u64,
    pub rejected_longitude: u64,
    pub rejected_non_finite: u64,
    pub rejected_timestamp: u64,

    /// Reports whose `stale_at <= observed_at` had their validity repaired
    pub validity_repaired: u64,

    pub ignored_out_of_order: u64,
    pub ignored_pending_removal: u64,

    pub marked_stale: u64,
    pub expired: u64,
    pub evicted: u64,
    pub withdrawn: u64,
}

impl Diagnostics {
    pub fn record_rejection(&mut self, reason: RejectReason) {
        match reason {
            RejectReason::EmptyUid => self.rejected_empty_uid += 1,
            RejectReason::LatitudeOutOfRange(_) => self.rejected_latitude += 1,
            RejectReason::LongitudeOutOfRange(_) => self.rejected_longitude += 1,
            RejectReason::NonFiniteCoordinate => self.rejected_non_finite += 1,
            RejectReason::TimestampOutOfRange => self.rejected_timestamp += 1,
        }
    }

    pub fn record_ignored(&mut self, reason: IgnoreReason) {
        match reason {
            IgnoreReason::OutOfOrder => self.ignored_out_of_order += 1,
            IgnoreReason::PendingRemoval => self.ignored_pending_removal += 1,
        }
    }

    pub fn rejected_total(&self) -> u64 {
        self.rejected_empty_uid
            + self.rejected_latitude
            + self.rejected_longitude
            + self.rejected_non_finite
            + self.rejected_timestamp
    }
}

/// Counters owned by the inbound queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounters {
    pub enqueued: u64,
    /// A newer record replaced a pending one for the same uid
    pub coalesced: u64,
    /// An older record arrived while a newer one was pending and was discarded
    pub superseded: u64,
    /// Overflow drops of the oldest pending record
    pub dropped_overflow: u64,
}

/// Point-in-time view of every counter plus residency figures.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticsSnapshot {
    pub store: Diagnostics,
    pub queue: QueueCounters,
    pub resident: usize,
    pub pending_inbound: usize,
}

impl DiagnosticsSnapshot {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_counters() {
        let mut diag = Diagnostics::default();
        diag.record_rejection(RejectReason::EmptyUid);
        diag.record_rejection(RejectReason::LatitudeOutOfRange(91.0));
        diag.record_rejection(RejectReason::LatitudeOutOfRange(-95.0));
        diag.record_rejection(RejectReason::LongitudeOutOfRange(181.0));

        assert_eq!(diag.rejected_empty_uid, 1);
        assert_eq!(diag.rejected_latitude, 2);
        assert_eq!(diag.rejected_longitude, 1);
        assert_eq!(diag.rejected_total(), 4);
    }

    #[test]
    fn test_ignored_counters() {
        let mut diag = Diagnostics::default();
        diag.record_ignored(IgnoreReason::OutOfOrder);
        diag.record_ignored(IgnoreReason::PendingRemoval);
        diag.record_ignored(IgnoreReason::OutOfOrder);
        assert_eq!(diag.ignored_out_of_order, 2);
        assert_eq!(diag.ignored_pending_removal, 1);
    }

    #[test]
    fn test_snapshot_serializes() {
        let snapshot = DiagnosticsSnapshot {
            resident: 3,
            ..Default::default()
        };
        let json = snapshot.to_json().unwrap();
        assert!(json.contains("\"resident\": 3"));
        assert!(json.contains("validity_repaired"));
    }
}
