//! Bounded inbound queue between the transport and `ingest`.
//!
//! The queue holds at most one pending record per uid. A newer position
//! supersedes an older one, so when a uid is already queued the pending
//! record is replaced in place (it keeps its place in line). When the queue
//! is full and a record for a new uid arrives, the oldest pending record is
//! dropped to make room.

use crate::diagnostics::QueueCounters;
use crate::entity::EventRecord;
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Replaced the pending record for the same uid
    Coalesced,
    /// Older than the pending record for the same uid; discarded
    Superseded,
    /// Queued after dropping the oldest pending record (its uid is returned)
    DroppedOldest(String),
}

#[derive(Debug)]
pub struct InboundQueue {
    capacity: usize,
    /// Arrival order of pending uids
    order: VecDeque<String>,
    pending: HashMap<String, EventRecord>,
    counters: QueueCounters,
}

impl InboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            pending: HashMap::new(),
            counters: QueueCounters::default(),
        }
    }

    pub fn push(&mut self, record: EventRecord) -> PushOutcome {
        if let Some(existing) = self.pending.get_mut(&record.uid) {
            if record.observed_at < existing.observed_at {
                self.counters.superseded += 1;
                return PushOutcome::Superseded;
            }
            *existing = record;
            self.counters.coalesced += 1;
            return PushOutcome::Coalesced;
        }

        let mut outcome = PushOutcome::Queued;
        if self.pending.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.pending.remove(&oldest);
                self.counters.dropped_overflow += 1;
                outcome = PushOutcome::DroppedOldest(oldest);
            }
        }

        self.order.push_back(record.uid.clone());
        self.pending.insert(record.uid.clone(), record);
        self.counters.enqueued += 1;
        outcome
    }

    /// Removes up to `max` records in arrival order.
    pub fn drain(&mut self, max: usize) -> Vec<EventRecord> {
        let take = max.min(self.order.len());
        let mut records = Vec::with_capacity(take);
        for uid in self.order.drain(..take) {
            if let Some(record) = self.pending.remove(&uid) {
                records.push(record);
            }
        }
        records
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn counters(&self) -> QueueCounters {
        self.counters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn record(uid: &str, secs: i64, lat: f64) -> EventRecord {
        EventRecord::new(uid, "a-f-G", lat, 0.0, t(secs), t(secs + 60))
    }

    #[test]
    fn test_fifo_drain() {
        let mut queue = InboundQueue::new(8);
        queue.push(record("A", 0, 1.0));
        queue.push(record("B", 1, 1.0));
        queue.push(record("C", 2, 1.0));

        let first = queue.drain(2);
        assert_eq!(first.iter().map(|r| r.uid.as_str()).collect::<Vec<_>>(), vec!["A", "B"]);
        assert_eq!(queue.len(), 1);
        let rest = queue.drain(10);
        assert_eq!(rest[0].uid, "C");
        assert!(queue.is_empty());
    }

    #[test]
    fn test_coalesce_keeps_newest_in_place() {
        let mut queue = InboundQueue::new(8);
        queue.push(record("A", 0, 1.0));
        queue.push(record("B", 1, 1.0));
        assert_eq!(queue.push(record("A", 5, 2.0)), PushOutcome::Coalesced);

        let drained = queue.drain(10);
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].uid, "A");
        assert_eq!(drained[0].lat, 2.0);
        assert_eq!(queue.counters().coalesced, 1);
    }

    #[test]
    fn test_older_record_is_superseded() {
        let mut queue = InboundQueue::new(8);
        queue.push(record("A", 10, 1.0));
        assert_eq!(queue.push(record("A", 5, 9.0)), PushOutcome::Superseded);

        let drained = queue.drain(10);
        assert_eq!(drained[0].lat, 1.0);
        assert_eq!(queue.counters().superseded, 1);
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let mut queue = InboundQueue::new(2);
        queue.push(record("A", 0, 1.0));
        queue.push(record("B", 1, 1.0));
        assert_eq!(queue.push(record("C", 2, 1.0)), PushOutcome::DroppedOldest("A".to_string()));
        assert_eq!(queue.len(), 2);

        // Same uid never overflows, it coalesces
        assert_eq!(queue.push(record("B", 3, 1.0)), PushOutcome::Coalesced);

        let uids: Vec<String> = queue.drain(10).into_iter().map(|r| r.uid).collect();
        assert_eq!(uids, vec!["B".to_string(), "C".to_string()]);
        assert_eq!(queue.counters().dropped_overflow, 1);
    }
}
