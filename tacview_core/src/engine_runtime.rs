//! Engine Runtime - the shared engine handle.
//!
//! Wraps the [`EntityStore`] for concurrent use and wires it to an
//! environment context:
//!
//! ```text
//! transport ──submit──▶ InboundQueue ──drain (chunks)──┐
//!                                                      ▼
//!                          ┌──────────── RwLock<EntityStore> ◀── sweeper (every sweep_interval)
//!                          │ write: ingest / sweep / setters
//!                          │ read:  clone Arc handles, then filter outside the lock
//!                          ▼
//! rendering ◀── apply / statistics / get_entity / entities_in_bounds
//!           ◀── broadcast<EntityEvent>
//! ```
//!
//! Writers are serialized by the lock. Readers copy the entity handles
//! under a short read lock and do all filtering, enrichment and sorting
//! without holding it, so a query never blocks ingestion for longer than
//! the copy of the handle vector.
//!
//! # Usage
//!
//! ```ignore
//! use tacview_core::{EngineConfig, FilterSpec, TacticalEngine};
//! use tacview_env::TokioContext;
//!
//! let engine = Arc::new(TacticalEngine::new(TokioContext::shared(), EngineConfig::default())?);
//! let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
//! engine.spawn_background(stop_rx);
//!
//! engine.submit(record);
//! let view = engine.apply(&FilterSpec::default(), Some(own_position));
//! ```

use crate::config::{EngineConfig, HistoryLimits};
use crate::diagnostics::DiagnosticsSnapshot;
use crate::entity::{EventRecord, TacticalEntity};
use crate::error::ConfigError;
use crate::events::EntityEvent;
use crate::inbound::{InboundQueue, PushOutcome};
use crate::tacview_geo::{BoundingBox, GeoPoint};
use crate::tacview_query::{FilterSpec, QueryConfig, QueryEngine, QueryResult, QueryStatistics};
use crate::tacview_store::{BatchSummary, EntityStore, IngestOutcome, SweepReport};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tacview_env::TacticalContext;
use tokio::sync::{broadcast, watch, Notify};
use tracing::{debug, info};

/// Tactical engine generic over its environment context.
///
/// One instance is built by the application and shared by handle
/// (`Arc<TacticalEngine<_>>`) with the transport and rendering sides.
pub struct TacticalEngine<Ctx: TacticalContext> {
    context: Arc<Ctx>,
    store: RwLock<EntityStore>,
    inbound: Mutex<InboundQueue>,
    inbound_ready: Notify,
    events: broadcast::Sender<EntityEvent>,
    query: QueryEngine,
    chunk_size: usize,
}

impl<Ctx: TacticalContext> TacticalEngine<Ctx> {
    pub fn new(context: Arc<Ctx>, config: EngineConfig) -> Result<Self, ConfigError> {
        let query = QueryEngine::new(QueryConfig {
            display_stale_after_secs: config.display_stale_after_secs,
        });
        let inbound = InboundQueue::new(config.inbound_queue_capacity);
        let (events, _) = broadcast::channel(config.event_channel_capacity);
        let chunk_size = config.ingest_chunk_size;
        let store = EntityStore::new(config)?;

        Ok(Self {
            context,
            store: RwLock::new(store),
            inbound: Mutex::new(inbound),
            inbound_ready: Notify::new(),
            events,
            query,
            chunk_size,
        })
    }

    pub fn context(&self) -> &Arc<Ctx> {
        &self.context
    }

    /// Wall-clock "now" as seen by the context.
    pub fn now_utc(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.context.system_time())
    }

    // ========================================================================
    // LOCKING
    // ========================================================================

    // Every store mutation is per-entity atomic, so a panic in another
    // holder cannot leave a half-merged entity behind.
    fn read_store(&self) -> RwLockReadGuard<'_, EntityStore> {
        self.store.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_store(&self) -> RwLockWriteGuard<'_, EntityStore> {
        self.store.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_inbound(&self) -> MutexGuard<'_, InboundQueue> {
        self.inbound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` under the write lock and publishes what it changed before
    /// releasing it, so subscribers see events in mutation order.
    fn mutate<R>(&self, f: impl FnOnce(&mut EntityStore, DateTime<Utc>) -> R) -> R {
        let now = self.now_utc();
        let mut store = self.write_store();
        let result = f(&mut store, now);
        for event in store.drain_events() {
            // No subscribers is fine
            let _ = self.events.send(event);
        }
        result
    }

    // ========================================================================
    // INGESTION
    // ========================================================================

    pub fn ingest(&self, record: EventRecord) -> IngestOutcome {
        self.mutate(|store, now| store.ingest(record, now))
    }

    /// Applies records in `ingest_chunk_size` chunks, releasing the write
    /// lock between chunks so readers are never starved by a burst.
    pub fn ingest_batch(&self, records: Vec<EventRecord>) -> BatchSummary {
        let mut summary = BatchSummary::default();
        let mut records = records.into_iter();
        loop {
            let chunk: Vec<EventRecord> = records.by_ref().take(self.chunk_size).collect();
            if chunk.is_empty() {
                break;
            }
            summary.absorb(self.mutate(|store, now| store.ingest_batch(chunk, now)));
        }
        summary
    }

    /// Queues a record for the ingest worker. Never blocks on the store.
    pub fn submit(&self, record: EventRecord) -> PushOutcome {
        let outcome = self.lock_inbound().push(record);
        if let PushOutcome::DroppedOldest(uid) = &outcome {
            debug!(uid = %uid, "inbound queue full, dropped oldest pending record");
        }
        self.inbound_ready.notify_one();
        outcome
    }

    /// Applies everything currently queued.
    pub fn drain_inbound(&self) -> BatchSummary {
        let mut summary = BatchSummary::default();
        loop {
            let chunk = self.lock_inbound().drain(self.chunk_size);
            if chunk.is_empty() {
                break;
            }
            summary.absorb(self.mutate(|store, now| store.ingest_batch(chunk, now)));
        }
        summary
    }

    // ========================================================================
    // LIFECYCLE & CONTROL
    // ========================================================================

    pub fn sweep(&self) -> SweepReport {
        self.mutate(|store, now| store.sweep(now))
    }

    pub fn withdraw(&self, uid: &str) -> bool {
        self.mutate(|store, _| store.withdraw(uid))
    }

    pub fn set_selected(&self, uid: &str, selected: bool) -> bool {
        self.mutate(|store, _| store.set_selected(uid, selected))
    }

    /// Returns how many entities were evicted by the new bound.
    pub fn set_capacity(&self, capacity: usize) -> Result<usize, ConfigError> {
        self.mutate(|store, _| store.set_capacity(capacity))
    }

    pub fn set_retention_window(&self, secs: f64) -> Result<(), ConfigError> {
        self.mutate(|store, _| store.set_retention_window(secs))
    }

    pub fn set_history_limits(&self, limits: HistoryLimits) -> Result<(), ConfigError> {
        self.mutate(|store, _| store.set_history_limits(limits))
    }

    pub fn restore(&self, entities: Vec<TacticalEntity>) -> usize {
        self.mutate(|store, now| store.restore(entities, now))
    }

    pub fn config(&self) -> EngineConfig {
        self.read_store().config().clone()
    }

    // ========================================================================
    // READERS
    // ========================================================================

    /// Filtered, enriched, sorted view over a consistent snapshot.
    pub fn apply(&self, spec: &FilterSpec, reference: Option<GeoPoint>) -> Vec<QueryResult> {
        let entities = self.read_store().entities();
        self.query.apply(entities, spec, reference, self.now_utc())
    }

    pub fn statistics(&self, results: &[QueryResult]) -> QueryStatistics {
        QueryEngine::statistics(results)
    }

    pub fn get_entity(&self, uid: &str) -> Option<Arc<TacticalEntity>> {
        self.read_store().get(uid)
    }

    pub fn entities_in_bounds(&self, bounds: &BoundingBox) -> Vec<Arc<TacticalEntity>> {
        self.read_store().entities_in_bounds(bounds)
    }

    pub fn entities_within_radius(&self, center: GeoPoint, radius_m: f64) -> Vec<Arc<TacticalEntity>> {
        self.read_store().entities_within_radius(center, radius_m)
    }

    /// Owned copies of every resident entity, ordered by uid.
    pub fn snapshot(&self) -> Vec<TacticalEntity> {
        self.read_store().snapshot()
    }

    pub fn len(&self) -> usize {
        self.read_store().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_store().is_empty()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EntityEvent> {
        self.events.subscribe()
    }

    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        let (queue, pending_inbound) = {
            let inbound = self.lock_inbound();
            (inbound.counters(), inbound.len())
        };
        let store = self.read_store();
        DiagnosticsSnapshot {
            store: store.diagnostics().clone(),
            queue,
            resident: store.len(),
            pending_inbound,
        }
    }

    // ========================================================================
    // BACKGROUND LOOPS
    // ========================================================================

    /// Starts the sweeper and the ingest worker on the context.
    ///
    /// Both loops exit once `shutdown` holds `true` or its sender is dropped.
    pub fn spawn_background(self: &Arc<Self>, shutdown: watch::Receiver<bool>) {
        let engine = Arc::clone(self);
        let mut stop = shutdown.clone();
        self.context.spawn("tacview-sweeper", async move {
            let interval = engine.config().sweep_interval();
            info!(interval_ms = interval.as_millis() as u64, "sweeper started");
            while !*stop.borrow() {
                tokio::select! {
                    _ = engine.context.sleep(interval) => {
                        engine.sweep();
                    }
                    changed = stop.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            info!("sweeper stopped");
        });

        let engine = Arc::clone(self);
        let mut stop = shutdown;
        self.context.spawn("tacview-ingest", async move {
            info!("ingest worker started");
            while !*stop.borrow() {
                tokio::select! {
                    _ = engine.inbound_ready.notified() => {
                        let summary = engine.drain_inbound();
                        if summary.applied() > 0 {
                            debug!(
                                created = summary.created,
                                updated = summary.updated,
                                rejected = summary.rejected,
                                "drained inbound queue"
                            );
                        }
                    }
                    changed = stop.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            info!("ingest worker stopped");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classification::Affiliation;
    use crate::entity::EntityState;
    use crate::events::RemovalReason;
    use crate::tacview_query::{SortDirection, SortKey};
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;
    use tacview_env::TokioContext;

    fn engine_with(config: EngineConfig) -> Arc<TacticalEngine<TokioContext>> {
        Arc::new(TacticalEngine::new(TokioContext::shared(), config).unwrap())
    }

    fn fresh(engine: &TacticalEngine<TokioContext>, uid: &str, class: &str, age_secs: i64) -> EventRecord {
        let observed = engine.now_utc() - ChronoDuration::seconds(age_secs);
        EventRecord::new(uid, class, 38.9, -77.0, observed, observed + ChronoDuration::minutes(5))
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = EngineConfig {
            h3_resolution: 42,
            ..EngineConfig::default()
        };
        assert!(TacticalEngine::new(TokioContext::shared(), config).is_err());
    }

    #[tokio::test]
    async fn test_ingest_publishes_events() {
        let engine = engine_with(EngineConfig::default());
        let mut rx = engine.subscribe();

        engine.ingest(fresh(&engine, "A", "a-f-G", 0));
        engine.ingest(fresh(&engine, "A", "a-f-G", 0));
        assert!(engine.withdraw("A"));
        engine.sweep();

        assert_eq!(rx.recv().await.unwrap(), EntityEvent::Created { uid: "A".into() });
        assert_eq!(rx.recv().await.unwrap(), EntityEvent::Updated { uid: "A".into() });
        assert!(matches!(
            rx.recv().await.unwrap(),
            EntityEvent::StateChanged { to: EntityState::PendingRemoval, .. }
        ));
        assert_eq!(
            rx.recv().await.unwrap(),
            EntityEvent::Removed {
                uid: "A".into(),
                reason: RemovalReason::Withdrawn
            }
        );
        assert!(engine.is_empty());
    }

    #[test]
    fn test_submit_coalesces_per_uid() {
        let engine = engine_with(EngineConfig::default());
        let first = fresh(&engine, "A", "a-f-G", 10);
        let mut second = fresh(&engine, "A", "a-f-G", 1);
        second.lat = 39.0;

        assert_eq!(engine.submit(first), PushOutcome::Queued);
        assert_eq!(engine.submit(second), PushOutcome::Coalesced);
        assert_eq!(engine.diagnostics().pending_inbound, 1);

        let summary = engine.drain_inbound();
        assert_eq!(summary.created, 1);
        assert_eq!(engine.get_entity("A").unwrap().position.lat, 39.0);

        let diagnostics = engine.diagnostics();
        assert_eq!(diagnostics.queue.coalesced, 1);
        assert_eq!(diagnostics.pending_inbound, 0);
        assert_eq!(diagnostics.resident, 1);
    }

    #[test]
    fn test_ingest_batch_is_chunked_and_bounded() {
        let engine = engine_with(EngineConfig {
            capacity: 5,
            ingest_chunk_size: 3,
            ..EngineConfig::default()
        });
        let records: Vec<EventRecord> = (0..10)
            .map(|i| fresh(&engine, &format!("U{:02}", i), "a-h-G", 100 - i))
            .collect();

        let summary = engine.ingest_batch(records);
        assert_eq!(summary.created, 10);
        assert_eq!(summary.evicted, 5);
        assert_eq!(engine.len(), 5);
        assert!(engine.get_entity("U09").is_some());
    }

    #[test]
    fn test_apply_filter_scenario() {
        let engine = engine_with(EngineConfig::default());
        engine.ingest(fresh(&engine, "A", "hostile", 10));
        let observed = engine.now_utc() - ChronoDuration::seconds(3600);
        engine.ingest(EventRecord::new("B", "friendly", 38.9, -77.0, observed, observed + ChronoDuration::seconds(60)));
        engine.ingest(fresh(&engine, "C", "friendly", 5));
        engine.sweep();

        let spec = FilterSpec::default()
            .affiliation(Affiliation::Friendly)
            .include_stale(false)
            .sort_by(SortKey::Age, SortDirection::Ascending);
        let results = engine.apply(&spec, None);
        let uids: Vec<&str> = results.iter().map(|r| r.uid()).collect();
        assert_eq!(uids, vec!["C"]);

        let stats = engine.statistics(&results);
        assert_eq!(stats.total, 1);
    }

    #[test]
    fn test_readers_never_see_half_merged_entity() {
        let engine = engine_with(EngineConfig::default());
        engine.ingest(fresh(&engine, "X", "a-f-G", 0).with_hae(0.0).with_display_name("0"));

        let writer = {
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || {
                let base = engine.now_utc();
                for i in 1..=500 {
                    let observed = base + ChronoDuration::milliseconds(i);
                    let record = EventRecord::new("X", "a-f-G", 38.9, -77.0, observed, observed + ChronoDuration::minutes(5))
                        .with_hae(i as f64)
                        .with_display_name(i.to_string());
                    engine.ingest(record);
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let engine = Arc::clone(&engine);
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        for result in engine.apply(&FilterSpec::default(), None) {
                            let name: f64 = result.entity.label().parse().unwrap();
                            assert_eq!(Some(name), result.entity.position.hae);
                        }
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(engine.get_entity("X").unwrap().label(), "500");
    }

    #[test]
    fn test_events_follow_mutation_order_across_writers() {
        const UNITS: usize = 2000;
        let engine = engine_with(EngineConfig {
            capacity: UNITS,
            event_channel_capacity: 1 << 16,
            ..EngineConfig::default()
        });
        let mut rx = engine.subscribe();
        let base = engine.now_utc();

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for i in 0..UNITS {
                    let observed = base + ChronoDuration::milliseconds(i as i64);
                    engine.ingest(EventRecord::new(
                        format!("U{i}"),
                        "a-f-G",
                        38.9,
                        -77.0,
                        observed,
                        observed + ChronoDuration::minutes(5),
                    ));
                }
            });
            scope.spawn(|| {
                for i in 0..UNITS {
                    let uid = format!("U{i}");
                    while !engine.withdraw(&uid) {
                        std::thread::yield_now();
                    }
                }
            });
        });

        let mut created = std::collections::HashSet::new();
        let mut seen = 0;
        while let Ok(event) = rx.try_recv() {
            seen += 1;
            match &event {
                EntityEvent::Created { uid } => assert!(created.insert(uid.clone()), "{uid} created twice"),
                other => assert!(created.contains(other.uid()), "{:?} published before Created", other),
            }
        }
        assert_eq!(created.len(), UNITS);
        assert!(seen > UNITS);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_background_loops_ingest_and_expire() {
        let engine = engine_with(EngineConfig {
            sweep_interval_secs: 0.02,
            retention_window_secs: 0.0,
            ..EngineConfig::default()
        });
        let mut rx = engine.subscribe();
        let (stop_tx, stop_rx) = watch::channel(false);
        engine.spawn_background(stop_rx);

        let observed = engine.now_utc();
        engine.submit(EventRecord::new(
            "A",
            "a-f-G",
            38.9,
            -77.0,
            observed,
            observed + ChronoDuration::milliseconds(50),
        ));

        let removed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match rx.recv().await {
                    Ok(EntityEvent::Removed { uid, reason }) => break (uid, reason),
                    Ok(_) => continue,
                    Err(e) => panic!("event channel closed: {e}"),
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(removed, ("A".to_string(), RemovalReason::Expired));
        assert!(engine.is_empty());
        assert_eq!(engine.diagnostics().store.marked_stale, 1);
        stop_tx.send(true).unwrap();
    }
}
