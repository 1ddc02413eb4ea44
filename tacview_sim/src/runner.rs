//! Scenario runner - drives the engine against the oracle and checks invariants.

use crate::context::SimContext;
use crate::exporter::{EntityFrame, SimExport, SimFrame, UnitPosition};
use crate::oracle::{Malformation, Oracle};
use crate::scenarios::ScenarioId;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tacview_core::{
    BatchSummary, DiagnosticsSnapshot, EngineConfig, EntityEvent, EntityState, EventRecord, FilterSpec, GeoPoint,
    IngestOutcome, PushOutcome, QueryResult, SortDirection, SortKey, TacticalEngine, TacticalEntity,
};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{debug, info};

/// Local frame anchor for every scenario.
const ORIGIN: GeoPoint = GeoPoint {
    lat: 38.8977,
    lon: -77.0365,
};

/// Ticks between exported frames.
const EXPORT_EVERY: u64 = 5;

// ============================================================================
// RESULTS
// ============================================================================

/// Results from running a scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    pub scenario: ScenarioId,
    pub seed: u64,
    /// Whether the scenario passed all assertions and invariants
    pub passed: bool,
    pub total_ticks: u64,
    pub final_time_secs: f64,
    /// Resident entities at the end of the run
    pub final_entity_count: usize,
    pub failure_reason: Option<String>,
    pub metrics: ScenarioMetrics,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScenarioMetrics {
    /// Records handed to the engine (valid or not)
    pub reports_sent: u64,
    pub malformed_sent: u64,
    pub max_resident: usize,
    pub events_observed: u64,
    pub invariant_checks: u64,
    /// Engine counters at the end of the run
    pub diagnostics: DiagnosticsSnapshot,
}

// ============================================================================
// INVARIANT MONITOR
// ============================================================================

/// Watches the notification stream and periodic snapshots for violations
/// of the store's invariants.
#[derive(Debug, Default)]
pub struct InvariantMonitor {
    /// State of each resident uid as told by the notifications
    states: HashMap<String, EntityState>,
    violations: Vec<String>,
    checks: u64,
}

impl InvariantMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, event: &EntityEvent) {
        match event {
            EntityEvent::Created { uid } => {
                if self.states.insert(uid.clone(), EntityState::Active).is_some() {
                    self.violation(format!("{} created twice", uid));
                }
            }
            EntityEvent::Updated { uid } => {
                if !self.states.contains_key(uid) {
                    self.violation(format!("update for unknown {}", uid));
                }
            }
            EntityEvent::StateChanged { uid, from, to } => {
                let current = self.states.get(uid).copied();
                if current != Some(*from) {
                    self.violation(format!("{} changed from {} but was {:?}", uid, from, current));
                }
                if !transition_allowed(*from, *to) {
                    self.violation(format!("{} moved backwards {} -> {}", uid, from, to));
                }
                self.states.insert(uid.clone(), *to);
            }
            EntityEvent::Removed { uid, .. } => {
                if self.states.remove(uid).is_none() {
                    self.violation(format!("removal of unknown {}", uid));
                }
            }
        }
    }

    /// Checks a uid-ordered snapshot against the capacity bound, uid
    /// uniqueness, history ordering and the notification-derived states.
    pub fn check_store(&mut self, snapshot: &[TacticalEntity], capacity: usize) {
        self.checks += 1;
        if snapshot.len() > capacity {
            self.violation(format!("{} resident exceeds capacity {}", snapshot.len(), capacity));
        }
        if snapshot.windows(2).any(|pair| pair[0].uid >= pair[1].uid) {
            self.violation("duplicate uid in snapshot".to_string());
        }
        if snapshot.len() != self.states.len() {
            self.violation(format!(
                "snapshot has {} entities, notifications imply {}",
                snapshot.len(),
                self.states.len()
            ));
        }
        for entity in snapshot {
            if self.states.get(&entity.uid) != Some(&entity.state) {
                self.violation(format!("{} is {} but notifications disagree", entity.uid, entity.state));
            }
            let history = &entity.position_history;
            if history.iter().zip(history.iter().skip(1)).any(|(a, b)| a.timestamp >= b.timestamp) {
                self.violation(format!("{} history not strictly ascending", entity.uid));
            }
        }
    }

    /// Two applications of the same filter must agree exactly.
    pub fn check_determinism(&mut self, first: &[QueryResult], second: &[QueryResult]) {
        self.checks += 1;
        let same = first.len() == second.len() && first.iter().zip(second).all(|(a, b)| a.uid() == b.uid());
        if !same {
            self.violation("query results differ between identical calls".to_string());
        }
    }

    pub fn violation(&mut self, message: String) {
        debug!(%message, "invariant violation");
        self.violations.push(message);
    }

    pub fn violations(&self) -> &[String] {
        &self.violations
    }

    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn checks(&self) -> u64 {
        self.checks
    }
}

fn transition_allowed(from: EntityState, to: EntityState) -> bool {
    matches!(
        (from, to),
        (EntityState::Active, EntityState::Stale)
            | (EntityState::Stale, EntityState::Active)
            | (EntityState::Active, EntityState::PendingRemoval)
            | (EntityState::Stale, EntityState::PendingRemoval)
    )
}

// ============================================================================
// SIM RUN
// ============================================================================

/// One engine + oracle pair advanced in lock-step.
struct SimRun {
    context: Arc<SimContext>,
    engine: TacticalEngine<SimContext>,
    events: broadcast::Receiver<EntityEvent>,
    oracle: Oracle,
    monitor: InvariantMonitor,
    metrics: ScenarioMetrics,
    capacity: usize,
    sweep_every: u64,
    tick: u64,
    tick_secs: f64,
    export: Option<SimExport>,
}

impl SimRun {
    fn new(seed: u64, config: EngineConfig, tick_secs: f64, export: Option<SimExport>) -> Result<Self, String> {
        let physics_seed = seed.wrapping_mul(0x9e3779b97f4a7c15);
        let context = SimContext::shared(seed);
        let capacity = config.capacity;
        let sweep_every = ((config.sweep_interval_secs / tick_secs).round() as u64).max(1);
        let engine = TacticalEngine::new(Arc::clone(&context), config).map_err(|e| e.to_string())?;
        let events = engine.subscribe();

        Ok(Self {
            context,
            engine,
            events,
            oracle: Oracle::new(physics_seed, ORIGIN),
            monitor: InvariantMonitor::new(),
            metrics: ScenarioMetrics::default(),
            capacity,
            sweep_every,
            tick: 0,
            tick_secs,
            export,
        })
    }

    fn advance(&mut self) {
        self.tick += 1;
        self.oracle.step(self.tick_secs);
        self.context.advance_time(Duration::from_secs_f64(self.tick_secs));
    }

    fn now(&self) -> DateTime<Utc> {
        self.context.now_utc()
    }

    fn every(&self, ticks: u64) -> bool {
        self.tick % ticks.max(1) == 0
    }

    fn ingest(&mut self, records: Vec<EventRecord>) -> BatchSummary {
        self.metrics.reports_sent += records.len() as u64;
        let summary = self.engine.ingest_batch(records);
        self.after_write();
        summary
    }

    fn ingest_one(&mut self, record: EventRecord) -> IngestOutcome {
        self.metrics.reports_sent += 1;
        let outcome = self.engine.ingest(record);
        self.after_write();
        outcome
    }

    fn submit(&mut self, record: EventRecord) -> PushOutcome {
        self.metrics.reports_sent += 1;
        self.engine.submit(record)
    }

    fn drain(&mut self) -> BatchSummary {
        let summary = self.engine.drain_inbound();
        self.after_write();
        summary
    }

    fn set_capacity(&mut self, capacity: usize) {
        match self.engine.set_capacity(capacity) {
            Ok(evicted) => {
                self.capacity = capacity;
                debug!(capacity, evicted, "capacity lowered");
            }
            Err(e) => self.monitor.violation(format!("set_capacity rejected: {}", e)),
        }
        self.after_write();
    }

    fn after_write(&mut self) {
        self.pump_events();
        let resident = self.engine.len();
        self.metrics.max_resident = self.metrics.max_resident.max(resident);
        if resident > self.capacity {
            self.monitor
                .violation(format!("{} resident exceeds capacity {}", resident, self.capacity));
        }
    }

    fn pump_events(&mut self) {
        loop {
            match self.events.try_recv() {
                Ok(event) => {
                    self.metrics.events_observed += 1;
                    self.monitor.observe(&event);
                }
                Err(TryRecvError::Lagged(missed)) => {
                    self.monitor.violation(format!("notification stream lagged by {}", missed));
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
    }

    /// Sweeps on the configured cadence, then checks invariants.
    fn maybe_sweep(&mut self) {
        if !self.every(self.sweep_every) {
            return;
        }
        let report = self.engine.sweep();
        self.after_write();
        if !report.is_empty() {
            debug!(
                tick = self.tick,
                marked_stale = report.marked_stale,
                expired = report.expired,
                evicted = report.evicted,
                "sweep"
            );
        }

        let snapshot = self.engine.snapshot();
        self.monitor.check_store(&snapshot, self.capacity);

        let spec = FilterSpec::default().sort_by(SortKey::Distance, SortDirection::Ascending);
        let first = self.engine.apply(&spec, Some(ORIGIN));
        let second = self.engine.apply(&spec, Some(ORIGIN));
        self.monitor.check_determinism(&first, &second);
    }

    fn maybe_export(&mut self, notes: Vec<String>) {
        if self.export.is_none() || !(self.every(EXPORT_EVERY) || !notes.is_empty()) {
            return;
        }
        let ground_truth = self
            .oracle
            .active_units()
            .map(|unit| {
                let point = self.oracle.to_geo(&unit.position);
                UnitPosition {
                    uid: unit.uid(),
                    lat: point.lat,
                    lon: point.lon,
                }
            })
            .collect();
        let entities = self.engine.snapshot().iter().map(EntityFrame::from).collect();
        let frame = SimFrame {
            time_sec: self.oracle.time(),
            ground_truth,
            entities,
            events: notes,
        };
        if let Some(export) = self.export.as_mut() {
            export.add_frame(frame);
        }
    }

    fn finish(mut self, scenario: ScenarioId, seed: u64, mut failures: Vec<String>) -> (ScenarioResult, Option<SimExport>) {
        self.pump_events();
        self.metrics.diagnostics = self.engine.diagnostics();
        self.metrics.invariant_checks = self.monitor.checks();
        failures.extend(self.monitor.violations().iter().take(5).cloned());

        let passed = failures.is_empty();
        let failure_reason = (!passed).then(|| failures.join("; "));
        if let Some(export) = self.export.as_mut() {
            export.finalize(passed, failure_reason.clone());
        }

        let result = ScenarioResult {
            scenario,
            seed,
            passed,
            total_ticks: self.tick,
            final_time_secs: self.oracle.time(),
            final_entity_count: self.engine.len(),
            failure_reason,
            metrics: self.metrics,
        };
        (result, self.export)
    }
}

/// Records a failure message when `ok` is false.
fn expect_that(failures: &mut Vec<String>, ok: bool, message: impl FnOnce() -> String) {
    if !ok {
        failures.push(message());
    }
}

// ============================================================================
// SCENARIO RUNNER
// ============================================================================

/// Runs chaos scenarios.
pub struct ScenarioRunner {
    seed: u64,
    /// Seconds of virtual time per tick
    tick_secs: f64,
    /// Requested duration; some scenarios extend it to see their full cycle
    max_duration_secs: f64,
}

impl ScenarioRunner {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            tick_secs: 1.0,
            max_duration_secs: 120.0,
        }
    }

    pub fn with_duration(mut self, secs: f64) -> Self {
        self.max_duration_secs = secs;
        self
    }

    /// Non-positive or non-finite values keep the current tick.
    pub fn with_tick(mut self, secs: f64) -> Self {
        if secs.is_finite() && secs > 0.0 {
            self.tick_secs = secs;
        }
        self
    }

    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        self.execute(scenario, None).0
    }

    /// Runs a scenario and records frames for export.
    pub fn run_with_export(&self, scenario: ScenarioId) -> (ScenarioResult, SimExport) {
        let (result, export) = self.execute(scenario, Some(SimExport::new(scenario.name(), self.seed)));
        let export = export.unwrap_or_else(|| SimExport::new(scenario.name(), self.seed));
        (result, export)
    }

    fn execute(&self, scenario: ScenarioId, export: Option<SimExport>) -> (ScenarioResult, Option<SimExport>) {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);

        let config = scenario_config(scenario);
        let mut run = match SimRun::new(self.seed, config, self.tick_secs, export) {
            Ok(run) => run,
            Err(reason) => return (self.setup_failure(scenario, reason), None),
        };

        let failures = match scenario {
            ScenarioId::SteadyPatrol => self.run_steady_patrol(&mut run),
            ScenarioId::StaleChurn => self.run_stale_churn(&mut run),
            ScenarioId::CapacityFlood => self.run_capacity_flood(&mut run),
            ScenarioId::MalformedFeed => self.run_malformed_feed(&mut run),
            ScenarioId::BurstCoalesce => self.run_burst_coalesce(&mut run),
        };
        run.finish(scenario, self.seed, failures)
    }

    fn setup_failure(&self, scenario: ScenarioId, reason: String) -> ScenarioResult {
        ScenarioResult {
            scenario,
            seed: self.seed,
            passed: false,
            total_ticks: 0,
            final_time_secs: 0.0,
            final_entity_count: 0,
            failure_reason: Some(reason),
            metrics: ScenarioMetrics::default(),
        }
    }

    fn ticks_for(&self, min_secs: f64) -> u64 {
        (self.max_duration_secs.max(min_secs) / self.tick_secs).ceil() as u64
    }

    /// SIM-001: SteadyPatrol - regular reporting keeps everyone Active.
    ///
    /// **Assertion**: nothing goes stale, every unit is resident and found
    /// by a radius query, and histories grow.
    fn run_steady_patrol(&self, run: &mut SimRun) -> Vec<String> {
        const UNITS: usize = 40;
        const MAX_SPEED: f64 = 10.0;
        run.oracle.spawn_random_units(UNITS, 5_000.0, MAX_SPEED);
        let ticks = self.ticks_for(40.0);
        let report_every = (5.0 / self.tick_secs).round() as u64;

        for _ in 0..ticks {
            run.advance();
            if run.every(report_every) {
                let now = run.now();
                let reports = run.oracle.reports(now);
                run.ingest(reports);
            }
            run.maybe_sweep();
            run.maybe_export(Vec::new());
        }

        let mut failures = Vec::new();
        let diagnostics = run.engine.diagnostics();
        expect_that(&mut failures, diagnostics.store.marked_stale == 0, || {
            format!("{} entities went stale", diagnostics.store.marked_stale)
        });
        expect_that(&mut failures, run.engine.len() == UNITS, || {
            format!("{} resident, expected {}", run.engine.len(), UNITS)
        });

        let radius = 5_000.0 + MAX_SPEED * ticks as f64 * self.tick_secs + 500.0;
        let nearby = run.engine.entities_within_radius(ORIGIN, radius).len();
        expect_that(&mut failures, nearby == UNITS, || format!("radius query found {} of {}", nearby, UNITS));

        let results = run.engine.apply(&FilterSpec::default().sort_by(SortKey::Distance, SortDirection::Ascending), Some(ORIGIN));
        let sorted = results
            .windows(2)
            .all(|pair| pair[0].distance_m.unwrap_or(0.0) <= pair[1].distance_m.unwrap_or(0.0));
        expect_that(&mut failures, sorted, || "distance sort out of order".to_string());

        let thin = run
            .engine
            .snapshot()
            .iter()
            .filter(|e| e.position_history.len() < 2)
            .count();
        expect_that(&mut failures, thin == 0, || format!("{} entities without history", thin));
        failures
    }

    /// SIM-002: StaleChurn - units fall silent, some come back, some never do.
    ///
    /// **Assertion**: silent units go Stale and are refreshed on return,
    /// departed units expire after the retention window, a withdrawn unit
    /// is deleted.
    fn run_stale_churn(&self, run: &mut SimRun) -> Vec<String> {
        run.oracle.set_validity(ChronoDuration::seconds(20));
        let ids = run.oracle.spawn_random_units(30, 3_000.0, 8.0);
        let (silent, rest) = ids.split_at(10);
        let (departed, steady) = rest.split_at(10);
        let ticks = self.ticks_for(120.0);
        let report_every = (5.0 / self.tick_secs).round() as u64;
        let silence_start = (20.0 / self.tick_secs).round() as u64;
        let silence_end = (50.0 / self.tick_secs).round() as u64;
        let withdraw_at = (30.0 / self.tick_secs).round() as u64;

        for _ in 0..ticks {
            run.advance();
            let mut notes = Vec::new();

            if run.tick == silence_start + 1 {
                for &id in silent.iter().chain(departed) {
                    run.oracle.remove_unit(id);
                }
                notes.push("20 units fell silent".to_string());
            }
            if run.tick == silence_end {
                for &id in silent {
                    run.oracle.resume_unit(id);
                }
                notes.push("10 units resumed".to_string());
            }
            if run.tick == withdraw_at {
                if let Some(uid) = steady.first().and_then(|&id| run.oracle.unit(id)).map(|u| u.uid()) {
                    run.engine.withdraw(&uid);
                    run.after_write();
                    notes.push(format!("{} withdrawn", uid));
                }
            }

            if run.every(report_every) {
                let now = run.now();
                let reports = run.oracle.reports(now);
                run.ingest(reports);
            }
            run.maybe_sweep();
            run.maybe_export(notes);
        }

        let mut failures = Vec::new();
        let store = run.engine.diagnostics().store;
        expect_that(&mut failures, store.refreshed >= silent.len() as u64, || {
            format!("{} refreshed, expected {}", store.refreshed, silent.len())
        });
        expect_that(&mut failures, store.expired >= departed.len() as u64, || {
            format!("{} expired, expected at least {}", store.expired, departed.len())
        });
        expect_that(&mut failures, store.withdrawn == 1, || format!("{} withdrawn, expected 1", store.withdrawn));

        let lingering = departed
            .iter()
            .filter_map(|&id| run.oracle.unit(id))
            .filter(|unit| run.engine.get_entity(&unit.uid()).is_some())
            .count();
        expect_that(&mut failures, lingering == 0, || format!("{} departed units still resident", lingering));

        let expected = silent.len() + steady.len();
        expect_that(&mut failures, run.engine.len() == expected, || {
            format!("{} resident, expected {}", run.engine.len(), expected)
        });
        failures
    }

    /// SIM-003: CapacityFlood - 5x more units than capacity.
    ///
    /// **Assertion**: resident count never exceeds capacity (also after it
    /// is lowered mid-run) and the most recently reported unit survives.
    fn run_capacity_flood(&self, run: &mut SimRun) -> Vec<String> {
        let ids = run.oracle.spawn_random_units(500, 10_000.0, 20.0);
        let ticks = self.ticks_for(20.0);
        let mut failures = Vec::new();
        let mut newest_missing = 0;

        for _ in 0..ticks {
            run.advance();
            let mut notes = Vec::new();
            if run.tick == ticks / 2 {
                run.set_capacity(50);
                notes.push("capacity lowered to 50".to_string());
            }

            let now = run.now();
            let reports = run.oracle.reports(now);
            let newest = reports.last().map(|r| r.uid.clone());
            run.ingest(reports);
            if let Some(uid) = newest {
                if run.engine.get_entity(&uid).is_none() {
                    newest_missing += 1;
                }
            }

            run.maybe_sweep();
            run.maybe_export(notes);
        }

        let store = run.engine.diagnostics().store;
        expect_that(&mut failures, newest_missing == 0, || {
            format!("most recent report evicted {} times", newest_missing)
        });
        expect_that(&mut failures, store.evicted as usize >= ids.len() - 100, || {
            format!("only {} evictions", store.evicted)
        });
        expect_that(&mut failures, run.engine.len() <= 50, || {
            format!("{} resident after lowering capacity", run.engine.len())
        });
        failures
    }

    /// SIM-004: MalformedFeed - one malformed report per tick.
    ///
    /// **Assertion**: every malformed report is counted under the right
    /// reason and no valid unit is lost.
    fn run_malformed_feed(&self, run: &mut SimRun) -> Vec<String> {
        const UNITS: usize = 20;
        run.oracle.spawn_random_units(UNITS, 2_000.0, 5.0);
        let mut chaos = ChaCha8Rng::seed_from_u64(self.seed ^ 0x5eed_bad0);
        let kinds = [
            Malformation::EmptyUid,
            Malformation::LatitudeOutOfRange,
            Malformation::NonFinite,
            Malformation::ZeroValidity,
        ];
        let ticks = self.ticks_for(20.0);
        let mut expected_rejected = 0u64;
        let mut expected_repaired = 0u64;

        for _ in 0..ticks {
            run.advance();
            let now = run.now();
            let mut reports = run.oracle.reports(now);

            let kind = kinds[chaos.gen_range(0..kinds.len())];
            let bad = run.oracle.malformed(kind, now);
            match kind {
                Malformation::ZeroValidity => expected_repaired += 1,
                _ => expected_rejected += 1,
            }
            let at = chaos.gen_range(0..=reports.len());
            reports.insert(at, bad);
            run.metrics.malformed_sent += 1;

            run.ingest(reports);
            run.maybe_sweep();
            run.maybe_export(Vec::new());
        }

        let mut failures = Vec::new();
        let store = run.engine.diagnostics().store;
        expect_that(&mut failures, store.rejected_total() == expected_rejected, || {
            format!("{} rejected, expected {}", store.rejected_total(), expected_rejected)
        });
        expect_that(&mut failures, store.validity_repaired == expected_repaired, || {
            format!("{} repaired, expected {}", store.validity_repaired, expected_repaired)
        });

        let valid = run
            .oracle
            .active_units()
            .filter(|unit| run.engine.get_entity(&unit.uid()).is_some())
            .count();
        expect_that(&mut failures, valid == UNITS, || format!("{} of {} units resident", valid, UNITS));
        failures
    }

    /// SIM-005: BurstCoalesce - duplicate, superseded and late reports.
    ///
    /// **Assertion**: the queue keeps only the newest record per uid, late
    /// reports are ignored, and every unit ends on its latest position.
    fn run_burst_coalesce(&self, run: &mut SimRun) -> Vec<String> {
        const UNITS: usize = 20;
        const BURST: usize = 80;
        run.oracle.spawn_random_units(UNITS, 2_000.0, 12.0);
        let ticks = self.ticks_for(20.0);
        let burst_at = ticks / 2;
        let lag = ChronoDuration::seconds(2);
        let mut latest: HashMap<String, EventRecord> = HashMap::new();
        let mut late_ignored = 0u64;
        let mut dropped = 0u64;

        for _ in 0..ticks {
            run.advance();
            let now = run.now();
            let mut notes = Vec::new();

            for report in run.oracle.reports(now) {
                let mut older = report.clone();
                older.observed_at = report.observed_at - lag;
                older.lat += 0.001;

                run.submit(older.clone());
                run.submit(report.clone());
                run.submit(older);
                latest.insert(report.uid.clone(), report);
            }

            if run.tick == burst_at {
                for i in 0..BURST {
                    let record = EventRecord::new(format!("BURST-{:03}", i), "a-u-A", ORIGIN.lat, ORIGIN.lon, now, now + lag);
                    if let PushOutcome::DroppedOldest(_) = run.submit(record) {
                        dropped += 1;
                    }
                }
                notes.push(format!("burst of {} unknown tracks", BURST));
            }

            run.drain();

            if let Some(record) = latest.values().min_by(|a, b| a.uid.cmp(&b.uid)).cloned() {
                let mut late = record;
                late.observed_at = late.observed_at - lag - lag;
                if matches!(run.ingest_one(late), IngestOutcome::Ignored(_)) {
                    late_ignored += 1;
                }
            }

            run.maybe_sweep();
            run.maybe_export(notes);
        }

        let mut failures = Vec::new();
        let diagnostics = run.engine.diagnostics();
        let expected_pairs = UNITS as u64 * ticks;
        expect_that(&mut failures, diagnostics.queue.coalesced >= expected_pairs - dropped, || {
            format!("{} coalesced, expected at least {}", diagnostics.queue.coalesced, expected_pairs - dropped)
        });
        expect_that(&mut failures, diagnostics.queue.superseded > 0, || "nothing superseded".to_string());
        expect_that(&mut failures, diagnostics.queue.dropped_overflow == dropped && dropped > 0, || {
            format!("{} overflow drops, expected {}", diagnostics.queue.dropped_overflow, dropped)
        });
        expect_that(&mut failures, late_ignored == ticks, || {
            format!("{} of {} late reports ignored", late_ignored, ticks)
        });

        let mismatched = latest
            .values()
            .filter(|record| {
                run.engine.get_entity(&record.uid).map_or(true, |entity| {
                    entity.last_updated_at != record.observed_at || entity.position.lat != record.lat
                })
            })
            .count();
        expect_that(&mut failures, mismatched == 0, || format!("{} units not on their latest report", mismatched));
        failures
    }
}

fn scenario_config(scenario: ScenarioId) -> EngineConfig {
    let base = EngineConfig {
        event_channel_capacity: 1 << 16,
        ..EngineConfig::default()
    };
    match scenario {
        ScenarioId::CapacityFlood => EngineConfig { capacity: 100, ..base },
        ScenarioId::BurstCoalesce => EngineConfig {
            inbound_queue_capacity: 64,
            ingest_chunk_size: 16,
            ..base
        },
        _ => base,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_scenarios_pass() {
        for scenario in ScenarioId::all() {
            let result = ScenarioRunner::new(42).run(scenario);
            assert!(
                result.passed,
                "{} failed: {}",
                scenario,
                result.failure_reason.unwrap_or_default()
            );
            assert!(result.metrics.invariant_checks > 0);
        }
    }

    #[test]
    fn test_same_seed_same_outcome() {
        let a = ScenarioRunner::new(7).with_duration(30.0).run(ScenarioId::MalformedFeed);
        let b = ScenarioRunner::new(7).with_duration(30.0).run(ScenarioId::MalformedFeed);
        assert_eq!(a.metrics.diagnostics, b.metrics.diagnostics);
        assert_eq!(a.final_entity_count, b.final_entity_count);
    }

    #[test]
    fn test_half_second_ticks() {
        let result = ScenarioRunner::new(11).with_tick(0.5).run(ScenarioId::StaleChurn);
        assert!(result.passed, "{}", result.failure_reason.unwrap_or_default());
        assert_eq!(result.total_ticks, 240);
    }

    #[test]
    fn test_export_collects_frames() {
        let (result, export) = ScenarioRunner::new(3).with_duration(20.0).run_with_export(ScenarioId::SteadyPatrol);
        assert_eq!(export.passed, result.passed);
        assert!(!export.frames.is_empty());
        assert!(export.frames.iter().all(|f| f.entities.len() <= 40));
    }

    #[test]
    fn test_monitor_flags_backwards_transition() {
        let mut monitor = InvariantMonitor::new();
        monitor.observe(&EntityEvent::Created { uid: "A".into() });
        monitor.observe(&EntityEvent::StateChanged {
            uid: "A".into(),
            from: EntityState::Active,
            to: EntityState::PendingRemoval,
        });
        assert!(monitor.is_clean());

        monitor.observe(&EntityEvent::StateChanged {
            uid: "A".into(),
            from: EntityState::PendingRemoval,
            to: EntityState::Active,
        });
        assert!(!monitor.is_clean());
    }

    #[test]
    fn test_monitor_flags_duplicate_create() {
        let mut monitor = InvariantMonitor::new();
        monitor.observe(&EntityEvent::Created { uid: "A".into() });
        monitor.observe(&EntityEvent::Created { uid: "A".into() });
        assert_eq!(monitor.violations().len(), 1);
    }
}
