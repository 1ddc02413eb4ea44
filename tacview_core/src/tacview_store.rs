//! The "STORE" Engine - Entity Lifecycle Manager
//!
//! Single source of truth for every tracked entity. Ingests an unordered,
//! possibly duplicated stream of reports and keeps a canonical model of
//! who is where and how stale they are:
//! 1. Validation & repair (reject bad coordinates, repair bad validity windows)
//! 2. Merge-on-update (last-known-good for absent optional fields)
//! 3. History admission (distance OR time rule)
//! 4. Sweep (Active -> Stale -> deleted) and capacity eviction
//!
//! Entities are held behind `Arc` and replaced copy-on-write, so a reader
//! holding an `Arc<TacticalEntity>` always sees a whole entity, either from
//! before a merge or after it.

use crate::config::{EngineConfig, HistoryLimits};
use crate::diagnostics::Diagnostics;
use crate::entity::{EntityState, EventRecord, HistorySample, TacticalEntity};
use crate::error::{ConfigError, IgnoreReason, RejectReason};
use crate::events::{EntityEvent, RemovalReason};
use crate::tacview_geo::{distance_m, normalize_degrees, BoundingBox, GeoPoint};
use chrono::{DateTime, Utc};
use h3o::{CellIndex, LatLng, Resolution};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace};

/// Beyond this many k-rings a radius query falls back to a linear scan.
const MAX_KRING: u32 = 64;

// ============================================================================
// OUTCOMES
// ============================================================================

/// Result of applying one record. Ingestion never fails; it reports.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IngestOutcome {
    Created,
    Updated,
    /// Updated and brought back from `Stale` to `Active`
    Refreshed,
    Ignored(IgnoreReason),
    Rejected(RejectReason),
}

/// Aggregate of a batch ingestion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub created: usize,
    pub updated: usize,
    pub refreshed: usize,
    pub ignored: usize,
    pub rejected: usize,
    pub evicted: usize,
}

impl BatchSummary {
    fn record(&mut self, outcome: IngestOutcome) {
        match outcome {
            IngestOutcome::Created => self.created += 1,
            IngestOutcome::Updated => self.updated += 1,
            IngestOutcome::Refreshed => self.refreshed += 1,
            IngestOutcome::Ignored(_) => self.ignored += 1,
            IngestOutcome::Rejected(_) => self.rejected += 1,
        }
    }

    pub fn applied(&self) -> usize {
        self.created + self.updated + self.refreshed
    }

    pub fn absorb(&mut self, other: BatchSummary) {
        self.created += other.created;
        self.updated += other.updated;
        self.refreshed += other.refreshed;
        self.ignored += other.ignored;
        self.rejected += other.rejected;
        self.evicted += other.evicted;
    }
}

/// What one sweep changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub marked_stale: usize,
    pub expired: usize,
    pub withdrawn: usize,
    pub evicted: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.marked_stale + self.expired + self.withdrawn + self.evicted == 0
    }
}

/// Statistics about the proximity index.
#[derive(Debug, Clone, Serialize)]
pub struct SpatialIndexStats {
    pub total_cells: usize,
    pub total_entries: usize,
    pub avg_per_cell: f64,
}

// ============================================================================
// ENTITY STORE
// ============================================================================

#[derive(Debug, Clone)]
struct Slot {
    entity: Arc<TacticalEntity>,
    cell: CellIndex,
}

/// Owns all resident entities. Every mutation goes through `&mut self`;
/// the engine runtime serializes writers.
pub struct EntityStore {
    // === Entity Table ===
    /// All resident entities keyed by uid
    entities: HashMap<String, Slot>,

    // === Spatial Index (H3 -> uids) ===
    spatial_index: HashMap<CellIndex, HashSet<String>>,
    resolution: Resolution,

    // === Bookkeeping ===
    config: EngineConfig,
    diagnostics: Diagnostics,
    /// Notifications not yet handed to the runtime
    events: Vec<EntityEvent>,
    /// uid of the most recently applied report; never evicted
    most_recent: Option<String>,
}

impl EntityStore {
    pub fn new(config: EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let resolution = config.resolution()?;
        Ok(Self {
            entities: HashMap::new(),
            spatial_index: HashMap::new(),
            resolution,
            config,
            diagnostics: Diagnostics::default(),
            events: Vec::new(),
            most_recent: None,
        })
    }

    pub fn with_defaults() -> Self {
        let config = EngineConfig::default();
        let resolution = config.resolution().unwrap_or(Resolution::Eight);
        Self {
            entities: HashMap::new(),
            spatial_index: HashMap::new(),
            resolution,
            config,
            diagnostics: Diagnostics::default(),
            events: Vec::new(),
            most_recent: None,
        }
    }

    // ========================================================================
    // SPATIAL INDEX OPERATIONS
    // ========================================================================

    fn position_to_cell(&self, lat: f64, lon: f64) -> Result<CellIndex, RejectReason> {
        let latlng = LatLng::new(lat, lon).map_err(|_| RejectReason::NonFiniteCoordinate)?;
        Ok(latlng.to_cell(self.resolution))
    }

    fn spatial_index_insert(&mut self, cell: CellIndex, uid: &str) {
        self.spatial_index
            .entry(cell)
            .or_default()
            .insert(uid.to_string());
    }

    fn spatial_index_remove(&mut self, cell: CellIndex, uid: &str) {
        if let Some(set) = self.spatial_index.get_mut(&cell) {
            set.remove(uid);
            if set.is_empty() {
                self.spatial_index.remove(&cell);
            }
        }
    }

    fn reindex(&mut self, uid: &str, old_cell: CellIndex, new_cell: CellIndex) {
        if old_cell != new_cell {
            self.spatial_index_remove(old_cell, uid);
            self.spatial_index_insert(new_cell, uid);
        }
    }

    // ========================================================================
    // INGESTION
    // ========================================================================

    /// Applies one report, then enforces the capacity bound.
    pub fn ingest(&mut self, record: EventRecord, now: DateTime<Utc>) -> IngestOutcome {
        let outcome = self.apply_record(record, now);
        self.enforce_capacity();
        outcome
    }

    /// Applies a burst of reports, enforcing capacity once at the end.
    pub fn ingest_batch(
        &mut self,
        records: impl IntoIterator<Item = EventRecord>,
        now: DateTime<Utc>,
    ) -> BatchSummary {
        let mut summary = BatchSummary::default();
        for record in records {
            summary.record(self.apply_record(record, now));
        }
        summary.evicted = self.enforce_capacity();
        summary
    }

    fn apply_record(&mut self, mut record: EventRecord, now: DateTime<Utc>) -> IngestOutcome {
        if let Err(reason) = validate(&record) {
            self.diagnostics.record_rejection(reason);
            debug!(uid = %record.uid, %reason, "rejected report");
            return IngestOutcome::Rejected(reason);
        }
        sanitize_motion(&mut record);

        if record.stale_at <= record.observed_at {
            let Some(repaired) = record.observed_at.checked_add_signed(self.config.default_validity()) else {
                let reason = RejectReason::TimestampOutOfRange;
                self.diagnostics.record_rejection(reason);
                debug!(uid = %record.uid, observed_at = %record.observed_at, "rejected report");
                return IngestOutcome::Rejected(reason);
            };
            record.stale_at = repaired;
            self.diagnostics.validity_repaired += 1;
            debug!(uid = %record.uid, stale_at = %record.stale_at, "repaired validity window");
        }

        let cell = match self.position_to_cell(record.lat, record.lon) {
            Ok(cell) => cell,
            Err(reason) => {
                self.diagnostics.record_rejection(reason);
                return IngestOutcome::Rejected(reason);
            }
        };

        let outcome = if self.entities.contains_key(&record.uid) {
            self.update_entity(&record, cell, now)
        } else {
            self.create_entity(&record, cell);
            IngestOutcome::Created
        };

        if !matches!(outcome, IngestOutcome::Ignored(_)) {
            self.diagnostics.ingested += 1;
            self.most_recent = Some(record.uid);
        }
        outcome
    }

    fn create_entity(&mut self, record: &EventRecord, cell: CellIndex) {
        let entity = TacticalEntity::from_record(record);
        self.spatial_index_insert(cell, &record.uid);
        self.entities.insert(
            record.uid.clone(),
            Slot {
                entity: Arc::new(entity),
                cell,
            },
        );
        self.diagnostics.created += 1;
        self.events.push(EntityEvent::Created {
            uid: record.uid.clone(),
        });
        trace!(uid = %record.uid, "created entity");
    }

    fn update_entity(&mut self, record: &EventRecord, cell: CellIndex, now: DateTime<Utc>) -> IngestOutcome {
        let limits = self.config.history;
        let (old_cell, refreshed) = {
            let Some(slot) = self.entities.get_mut(&record.uid) else {
                return IngestOutcome::Ignored(IgnoreReason::OutOfOrder);
            };

            let ignore = if slot.entity.state == EntityState::PendingRemoval {
                Some(IgnoreReason::PendingRemoval)
            } else if record.observed_at < slot.entity.last_updated_at {
                Some(IgnoreReason::OutOfOrder)
            } else {
                None
            };
            if let Some(reason) = ignore {
                self.diagnostics.record_ignored(reason);
                debug!(uid = %record.uid, ?reason, "ignored report");
                return IngestOutcome::Ignored(reason);
            }

            let entity = Arc::make_mut(&mut slot.entity);
            let previous = HistorySample {
                lat: entity.position.lat,
                lon: entity.position.lon,
                hae: entity.position.hae,
                timestamp: entity.last_updated_at,
            };
            entity.merge(record);
            admit_history(entity, previous, &limits);

            let refreshed = entity.state == EntityState::Stale && entity.stale_at > now;
            if refreshed {
                entity.state = EntityState::Active;
                entity.stale_since = None;
            }

            let old_cell = slot.cell;
            slot.cell = cell;
            (old_cell, refreshed)
        };

        self.reindex(&record.uid, old_cell, cell);
        self.events.push(EntityEvent::Updated {
            uid: record.uid.clone(),
        });

        if refreshed {
            self.diagnostics.refreshed += 1;
            self.events.push(EntityEvent::StateChanged {
                uid: record.uid.clone(),
                from: EntityState::Stale,
                to: EntityState::Active,
            });
            debug!(uid = %record.uid, "stale entity refreshed");
            IngestOutcome::Refreshed
        } else {
            self.diagnostics.updated += 1;
            IngestOutcome::Updated
        }
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Periodic lifecycle pass.
    ///
    /// Active entities past `stale_at` become Stale; Stale entities older
    /// than the retention window and withdrawn entities are deleted; then
    /// capacity is enforced (it may have been lowered since the last pass).
    pub fn sweep(&mut self, now: DateTime<Utc>) -> SweepReport {
        let retention = self.config.retention_window();
        let mut to_stale = Vec::new();
        let mut to_remove = Vec::new();

        for (uid, slot) in &self.entities {
            let entity = &slot.entity;
            match entity.state {
                EntityState::Active if now > entity.stale_at => to_stale.push(uid.clone()),
                EntityState::Stale => {
                    let since = entity.stale_since.unwrap_or(entity.stale_at);
                    if now - since > retention {
                        to_remove.push((uid.clone(), RemovalReason::Expired));
                    }
                }
                EntityState::PendingRemoval => to_remove.push((uid.clone(), RemovalReason::Withdrawn)),
                EntityState::Active => {}
            }
        }

        let mut report = SweepReport::default();

        for uid in to_stale {
            if let Some(slot) = self.entities.get_mut(&uid) {
                let entity = Arc::make_mut(&mut slot.entity);
                entity.state = EntityState::Stale;
                entity.stale_since = Some(now);
                self.diagnostics.marked_stale += 1;
                report.marked_stale += 1;
                self.events.push(EntityEvent::StateChanged {
                    uid,
                    from: EntityState::Active,
                    to: EntityState::Stale,
                });
            }
        }

        for (uid, reason) in to_remove {
            if self.remove_entity(&uid, reason).is_some() {
                match reason {
                    RemovalReason::Expired => report.expired += 1,
                    RemovalReason::Withdrawn => report.withdrawn += 1,
                    RemovalReason::Evicted => report.evicted += 1,
                }
            }
        }

        report.evicted += self.enforce_capacity();

        if !report.is_empty() {
            debug!(
                marked_stale = report.marked_stale,
                expired = report.expired,
                withdrawn = report.withdrawn,
                evicted = report.evicted,
                resident = self.entities.len(),
                "sweep complete"
            );
        }
        report
    }

    /// Marks an entity for deletion on the next sweep.
    ///
    /// Returns false if the uid is unknown or already withdrawn.
    pub fn withdraw(&mut self, uid: &str) -> bool {
        let Some(slot) = self.entities.get_mut(uid) else {
            return false;
        };
        let from = slot.entity.state;
        if from == EntityState::PendingRemoval {
            return false;
        }
        Arc::make_mut(&mut slot.entity).state = EntityState::PendingRemoval;
        self.events.push(EntityEvent::StateChanged {
            uid: uid.to_string(),
            from,
            to: EntityState::PendingRemoval,
        });
        true
    }

    /// Sets the UI-owned highlight flag.
    pub fn set_selected(&mut self, uid: &str, selected: bool) -> bool {
        let Some(slot) = self.entities.get_mut(uid) else {
            return false;
        };
        if slot.entity.selected != selected {
            Arc::make_mut(&mut slot.entity).selected = selected;
            self.events.push(EntityEvent::Updated { uid: uid.to_string() });
        }
        true
    }

    fn remove_entity(&mut self, uid: &str, reason: RemovalReason) -> Option<Arc<TacticalEntity>> {
        let slot = self.entities.remove(uid)?;
        self.spatial_index_remove(slot.cell, uid);
        if self.most_recent.as_deref() == Some(uid) {
            self.most_recent = None;
        }

        match reason {
            RemovalReason::Expired => self.diagnostics.expired += 1,
            RemovalReason::Evicted => self.diagnostics.evicted += 1,
            RemovalReason::Withdrawn => self.diagnostics.withdrawn += 1,
        }
        self.events.push(EntityEvent::Removed {
            uid: uid.to_string(),
            reason,
        });
        trace!(uid = %uid, ?reason, "removed entity");
        Some(slot.entity)
    }

    // ========================================================================
    // EVICTION
    // ========================================================================

    /// Evicts until resident count is within capacity.
    ///
    /// Order: PendingRemoval, then Stale oldest-first, then Active
    /// oldest-first (by `last_updated_at`, uid breaks ties). The most
    /// recently updated entity is never chosen.
    pub fn enforce_capacity(&mut self) -> usize {
        let capacity = self.config.capacity;
        if self.entities.len() <= capacity {
            return 0;
        }
        let excess = self.entities.len() - capacity;

        let mut candidates: Vec<(u8, DateTime<Utc>, &str)> = self
            .entities
            .iter()
            .filter(|(uid, _)| self.most_recent.as_deref() != Some(uid.as_str()))
            .map(|(uid, slot)| {
                (
                    slot.entity.state.eviction_rank(),
                    slot.entity.last_updated_at,
                    uid.as_str(),
                )
            })
            .collect();
        candidates.sort_unstable();

        let victims: Vec<String> = candidates
            .into_iter()
            .take(excess)
            .map(|(_, _, uid)| uid.to_string())
            .collect();

        let evicted = victims
            .iter()
            .filter(|uid| self.remove_entity(uid, RemovalReason::Evicted).is_some())
            .count();
        debug!(evicted, capacity, "capacity eviction");
        evicted
    }

    // ========================================================================
    // CONFIGURATION
    // ========================================================================

    /// Changes the capacity bound, evicting immediately if it shrank.
    pub fn set_capacity(&mut self, capacity: usize) -> Result<usize, ConfigError> {
        if capacity == 0 {
            return Err(ConfigError::invalid("capacity", "must be at least 1"));
        }
        self.config.capacity = capacity;
        Ok(self.enforce_capacity())
    }

    pub fn set_retention_window(&mut self, secs: f64) -> Result<(), ConfigError> {
        crate::config::window_secs("retention_window_secs", secs, true)?;
        self.config.retention_window_secs = secs;
        Ok(())
    }

    /// Replaces the history limits; they apply from the next report of each entity.
    pub fn set_history_limits(&mut self, limits: HistoryLimits) -> Result<(), ConfigError> {
        limits.validate()?;
        self.config.history = limits;
        Ok(())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    pub fn get(&self, uid: &str) -> Option<Arc<TacticalEntity>> {
        self.entities.get(uid).map(|slot| Arc::clone(&slot.entity))
    }

    /// Shared handles to every resident entity, unordered.
    pub fn entities(&self) -> Vec<Arc<TacticalEntity>> {
        self.entities.values().map(|slot| Arc::clone(&slot.entity)).collect()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Entities inside a viewport, unordered.
    pub fn entities_in_bounds(&self, bounds: &BoundingBox) -> Vec<Arc<TacticalEntity>> {
        self.entities
            .values()
            .filter(|slot| bounds.contains(slot.entity.point()))
            .map(|slot| Arc::clone(&slot.entity))
            .collect()
    }

    /// Entities within `radius_m` of `center`, ordered by uid.
    ///
    /// Prunes with an H3 k-ring, then confirms with Haversine distance.
    pub fn entities_within_radius(&self, center: GeoPoint, radius_m: f64) -> Vec<Arc<TacticalEntity>> {
        if !radius_m.is_finite() || radius_m < 0.0 {
            return Vec::new();
        }
        let Ok(center_cell) = self.position_to_cell(center.lat, center.lon) else {
            return Vec::new();
        };

        let within = |entity: &TacticalEntity| distance_m(center, entity.point()) <= radius_m;
        let rings = (radius_m / self.resolution.edge_length_m()).ceil();

        let mut found: Vec<Arc<TacticalEntity>> = if rings >= f64::from(MAX_KRING) {
            self.entities
                .values()
                .filter(|slot| within(&*slot.entity))
                .map(|slot| Arc::clone(&slot.entity))
                .collect()
        } else {
            let k = rings as u32 + 1;
            center_cell
                .grid_disk_safe(k)
                .filter_map(|cell| self.spatial_index.get(&cell))
                .flatten()
                .filter_map(|uid| self.entities.get(uid))
                .filter(|slot| within(&*slot.entity))
                .map(|slot| Arc::clone(&slot.entity))
                .collect()
        };
        found.sort_by(|a, b| a.uid.cmp(&b.uid));
        found
    }

    /// Owned copies of every resident entity, ordered by uid.
    pub fn snapshot(&self) -> Vec<TacticalEntity> {
        let mut all: Vec<TacticalEntity> = self
            .entities
            .values()
            .map(|slot| TacticalEntity::clone(&slot.entity))
            .collect();
        all.sort_by(|a, b| a.uid.cmp(&b.uid));
        all
    }

    /// Re-seeds the store from a previous snapshot.
    ///
    /// Entities that fail validation or whose uid is already resident are
    /// skipped. Returns how many were restored.
    pub fn restore(&mut self, entities: Vec<TacticalEntity>, now: DateTime<Utc>) -> usize {
        let mut restored = 0;
        for mut entity in entities {
            if self.entities.contains_key(&entity.uid) {
                continue;
            }
            let point = entity.point();
            if entity.uid.trim().is_empty() || !point.is_valid() {
                continue;
            }
            let Ok(cell) = self.position_to_cell(point.lat, point.lon) else {
                continue;
            };
            if entity.stale_at <= entity.created_at {
                let Some(repaired) = entity.created_at.checked_add_signed(self.config.default_validity()) else {
                    continue;
                };
                entity.stale_at = repaired;
            }
            if entity.state == EntityState::Stale && entity.stale_since.is_none() {
                entity.stale_since = Some(now);
            }

            let uid = entity.uid.clone();
            self.spatial_index_insert(cell, &uid);
            self.entities.insert(
                uid.clone(),
                Slot {
                    entity: Arc::new(entity),
                    cell,
                },
            );
            self.events.push(EntityEvent::Created { uid });
            restored += 1;
        }
        self.enforce_capacity();
        debug!(restored, resident = self.entities.len(), "restored snapshot");
        restored
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Hands pending notifications to the caller.
    pub fn drain_events(&mut self) -> Vec<EntityEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn spatial_stats(&self) -> SpatialIndexStats {
        let total_cells = self.spatial_index.len();
        let total_entries: usize = self.spatial_index.values().map(|s| s.len()).sum();
        let avg_per_cell = if total_cells > 0 {
            total_entries as f64 / total_cells as f64
        } else {
            0.0
        };

        SpatialIndexStats {
            total_cells,
            total_entries,
            avg_per_cell,
        }
    }
}

// ============================================================================
// HELPERS
// ============================================================================

fn validate(record: &EventRecord) -> Result<(), RejectReason> {
    if record.uid.trim().is_empty() {
        return Err(RejectReason::EmptyUid);
    }
    if !record.lat.is_finite() || !record.lon.is_finite() {
        return Err(RejectReason::NonFiniteCoordinate);
    }
    if !(-90.0..=90.0).contains(&record.lat) {
        return Err(RejectReason::LatitudeOutOfRange(record.lat));
    }
    if !(-180.0..=180.0).contains(&record.lon) {
        return Err(RejectReason::LongitudeOutOfRange(record.lon));
    }
    Ok(())
}

/// Drops unusable motion values instead of rejecting the whole report.
fn sanitize_motion(record: &mut EventRecord) {
    record.speed = record.speed.filter(|s| s.is_finite() && *s >= 0.0);
    record.course = record.course.filter(|c| c.is_finite()).map(normalize_degrees);
    for value in [&mut record.hae, &mut record.ce, &mut record.le] {
        *value = value.filter(|v| v.is_finite());
    }
}

/// Appends the entity's current position to its trail when it moved at
/// least `min_distance_m` or `min_interval` elapsed since the last sample,
/// then prunes by age and count.
fn admit_history(entity: &mut TacticalEntity, previous: HistorySample, limits: &HistoryLimits) {
    let sample = HistorySample {
        lat: entity.position.lat,
        lon: entity.position.lon,
        hae: entity.position.hae,
        timestamp: entity.last_updated_at,
    };
    let reference = entity.position_history.back().copied().unwrap_or(previous);

    if sample.timestamp > reference.timestamp {
        let moved = distance_m(reference.point(), sample.point());
        let elapsed = sample.timestamp - reference.timestamp;
        if moved >= limits.min_distance_m || elapsed >= limits.min_interval() {
            entity.position_history.push_back(sample);
        }
    }

    // No cutoff when the window reaches back past the earliest representable time
    if let Some(cutoff) = sample.timestamp.checked_sub_signed(limits.max_age()) {
        while entity
            .position_history
            .front()
            .is_some_and(|oldest| oldest.timestamp < cutoff)
        {
            entity.position_history.pop_front();
        }
    }
    while entity.position_history.len() > limits.max_entries {
        entity.position_history.pop_front();
    }
}

// ============================================================================
// TESTS
// ============================================================================
