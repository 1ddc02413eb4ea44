//! Query/Filter Engine
//!
//! Turns a set of entity handles plus a [`FilterSpec`] into an ordered,
//! enriched view for the rendering layer. Pure: takes handles in, never
//! touches the store.
//!
//! Filtering is conjunctive across dimensions and disjunctive within a
//! multi-valued one. Ordering is the requested key, then `uid` ascending,
//! so repeated calls on unchanged data return identical results.

use crate::classification::{Affiliation, Category};
use crate::entity::{EntityState, TacticalEntity};
use crate::tacview_geo::{bearing_deg, cardinal, distance_m, relative_bearing, Cardinal, GeoPoint};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

// ============================================================================
// FILTERS
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    Distance,
    #[default]
    Age,
    DisplayName,
    Affiliation,
    Category,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

/// Closed interval `[min, max]`. An inverted interval matches nothing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

impl ValueRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: f64) -> bool {
        self.min <= value && value <= self.max
    }
}

/// What the user asked to see. The default shows everything except
/// withdrawn entities, newest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterSpec {
    /// Case-insensitive substring of display name or uid
    pub search_text: Option<String>,
    /// Empty means any affiliation
    pub affiliations: BTreeSet<Affiliation>,
    /// Empty means any category
    pub categories: BTreeSet<Category>,
    /// Meters from the reference location; skipped without one
    pub distance_range: Option<ValueRange>,
    /// Seconds since `last_updated_at`
    pub age_range: Option<ValueRange>,
    pub include_stale: bool,
    pub sort_key: SortKey,
    pub sort_direction: SortDirection,
}

impl Default for FilterSpec {
    fn default() -> Self {
        Self {
            search_text: None,
            affiliations: BTreeSet::new(),
            categories: BTreeSet::new(),
            distance_range: None,
            age_range: None,
            include_stale: true,
            sort_key: SortKey::default(),
            sort_direction: SortDirection::default(),
        }
    }
}

impl FilterSpec {
    pub fn search(mut self, text: impl Into<String>) -> Self {
        self.search_text = Some(text.into());
        self
    }

    pub fn affiliation(mut self, affiliation: Affiliation) -> Self {
        self.affiliations.insert(affiliation);
        self
    }

    pub fn category(mut self, category: Category) -> Self {
        self.categories.insert(category);
        self
    }

    pub fn within_distance(mut self, min_m: f64, max_m: f64) -> Self {
        self.distance_range = Some(ValueRange::new(min_m, max_m));
        self
    }

    pub fn within_age(mut self, min_secs: f64, max_secs: f64) -> Self {
        self.age_range = Some(ValueRange::new(min_secs, max_secs));
        self
    }

    pub fn include_stale(mut self, include: bool) -> Self {
        self.include_stale = include;
        self
    }

    pub fn sort_by(mut self, key: SortKey, direction: SortDirection) -> Self {
        self.sort_key = key;
        self.sort_direction = direction;
        self
    }
}

// ============================================================================
// RESULTS
// ============================================================================

/// One entity as seen from the reference location at query time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    pub entity: Arc<TacticalEntity>,
    pub distance_m: Option<f64>,
    pub bearing_deg: Option<f64>,
    pub age_secs: f64,
    /// Older than the display threshold; the UI may dim it
    pub display_stale: bool,
}

impl QueryResult {
    pub fn uid(&self) -> &str {
        &self.entity.uid
    }

    pub fn cardinal(&self) -> Option<Cardinal> {
        self.bearing_deg.map(cardinal)
    }

    /// Direction to the entity relative to the observer's heading.
    pub fn relative_bearing(&self, heading_deg: f64) -> Option<f64> {
        self.bearing_deg.map(|b| relative_bearing(heading_deg, b))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryStatistics {
    pub total: usize,
    pub by_affiliation: BTreeMap<Affiliation, usize>,
    pub by_category: BTreeMap<Category, usize>,
    /// Absent when no result carries a distance
    pub average_distance_m: Option<f64>,
    /// Zero for an empty result
    pub average_age_secs: f64,
}

// ============================================================================
// QUERY ENGINE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QueryConfig {
    pub display_stale_after_secs: f64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            display_stale_after_secs: 900.0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueryEngine {
    config: QueryConfig,
}

impl QueryEngine {
    pub fn new(config: QueryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> QueryConfig {
        self.config
    }

    /// Filters, enriches and sorts `entities`.
    ///
    /// Without a reference location the distance range is ignored and a
    /// distance sort falls back to display name.
    pub fn apply(
        &self,
        entities: impl IntoIterator<Item = Arc<TacticalEntity>>,
        spec: &FilterSpec,
        reference: Option<GeoPoint>,
        now: DateTime<Utc>,
    ) -> Vec<QueryResult> {
        let needle = spec
            .search_text
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .map(str::to_lowercase);

        let mut results: Vec<QueryResult> = entities
            .into_iter()
            .filter(|entity| state_admitted(entity.state, spec.include_stale))
            .filter(|entity| spec.affiliations.is_empty() || spec.affiliations.contains(&entity.affiliation))
            .filter(|entity| spec.categories.is_empty() || spec.categories.contains(&entity.category))
            .filter(|entity| needle.as_deref().map_or(true, |n| matches_text(entity, n)))
            .map(|entity| self.enrich(entity, reference, now))
            .filter(|result| spec.age_range.map_or(true, |r| r.contains(result.age_secs)))
            .filter(|result| match (spec.distance_range, result.distance_m) {
                (Some(range), Some(d)) => range.contains(d),
                _ => true,
            })
            .collect();

        let key = match (spec.sort_key, reference) {
            (SortKey::Distance, None) => SortKey::DisplayName,
            (key, _) => key,
        };
        results.sort_by(|a, b| {
            let primary = compare_by(key, a, b);
            let primary = match spec.sort_direction {
                SortDirection::Ascending => primary,
                SortDirection::Descending => primary.reverse(),
            };
            primary.then_with(|| a.entity.uid.cmp(&b.entity.uid))
        });
        results
    }

    fn enrich(&self, entity: Arc<TacticalEntity>, reference: Option<GeoPoint>, now: DateTime<Utc>) -> QueryResult {
        let age_secs = entity.age_secs(now);
        let (distance_m, bearing_deg) = match reference {
            Some(origin) => {
                let target = entity.point();
                (Some(distance_m(origin, target)), Some(bearing_deg(origin, target)))
            }
            None => (None, None),
        };
        QueryResult {
            display_stale: age_secs > self.config.display_stale_after_secs,
            entity,
            distance_m,
            bearing_deg,
            age_secs,
        }
    }

    /// Aggregates over an already filtered result.
    pub fn statistics(results: &[QueryResult]) -> QueryStatistics {
        let mut stats = QueryStatistics {
            total: results.len(),
            ..QueryStatistics::default()
        };

        let mut distance_sum = 0.0;
        let mut distance_count = 0usize;
        let mut age_sum = 0.0;

        for result in results {
            *stats.by_affiliation.entry(result.entity.affiliation).or_insert(0) += 1;
            *stats.by_category.entry(result.entity.category).or_insert(0) += 1;
            if let Some(d) = result.distance_m {
                distance_sum += d;
                distance_count += 1;
            }
            age_sum += result.age_secs;
        }

        if distance_count > 0 {
            stats.average_distance_m = Some(distance_sum / distance_count as f64);
        }
        if !results.is_empty() {
            stats.average_age_secs = age_sum / results.len() as f64;
        }
        stats
    }
}

fn state_admitted(state: EntityState, include_stale: bool) -> bool {
    match state {
        EntityState::Active => true,
        EntityState::Stale => include_stale,
        EntityState::PendingRemoval => false,
    }
}

fn matches_text(entity: &TacticalEntity, needle: &str) -> bool {
    entity.uid.to_lowercase().contains(needle)
        || entity
            .display_name
            .as_deref()
            .is_some_and(|name| name.to_lowercase().contains(needle))
}

fn compare_by(key: SortKey, a: &QueryResult, b: &QueryResult) -> Ordering {
    match key {
        SortKey::Distance => match (a.distance_m, b.distance_m) {
            (Some(x), Some(y)) => x.total_cmp(&y),
            _ => compare_labels(&a.entity, &b.entity),
        },
        SortKey::Age => a.age_secs.total_cmp(&b.age_secs),
        SortKey::DisplayName => compare_labels(&a.entity, &b.entity),
        SortKey::Affiliation => a.entity.affiliation.cmp(&b.entity.affiliation),
        SortKey::Category => a.entity.category.cmp(&b.entity.category),
    }
}

fn compare_labels(a: &TacticalEntity, b: &TacticalEntity) -> Ordering {
    let a = a.label().chars().flat_map(char::to_lowercase);
    let b = b.label().chars().flat_map(char::to_lowercase);
    a.cmp(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EventRecord;
    use crate::tacview_store::EntityStore;
    use approx::assert_relative_eq;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn ago(secs: i64) -> DateTime<Utc> {
        now() - Duration::seconds(secs)
    }

    fn uids(results: &[QueryResult]) -> Vec<&str> {
        results.iter().map(|r| r.uid()).collect()
    }

    /// A hostile (10 s old), B friendly and stale (1 h old), C friendly (5 s old).
    fn scenario_store() -> EntityStore {
        let mut store = EntityStore::with_defaults();
        store.ingest(EventRecord::new("A", "hostile", 38.90, -77.03, ago(10), ago(10) + Duration::minutes(5)), now());
        store.ingest(EventRecord::new("B", "friendly", 38.91, -77.03, ago(3600), ago(3300)), now());
        store.ingest(EventRecord::new("C", "friendly", 38.92, -77.03, ago(5), ago(5) + Duration::minutes(5)), now());
        store.sweep(now());
        store
    }

    #[test]
    fn test_filter_scenario_returns_only_c() {
        let store = scenario_store();
        let spec = FilterSpec::default()
            .affiliation(Affiliation::Friendly)
            .include_stale(false)
            .sort_by(SortKey::Age, SortDirection::Ascending);

        let results = QueryEngine::default().apply(store.entities(), &spec, None, now());
        assert_eq!(uids(&results), vec!["C"]);
        assert_relative_eq!(results[0].age_secs, 5.0);
    }

    #[test]
    fn test_include_stale_never_includes_pending_removal() {
        let mut store = scenario_store();
        store.withdraw("C");
        let spec = FilterSpec::default().include_stale(true).sort_by(SortKey::Age, SortDirection::Ascending);

        let results = QueryEngine::default().apply(store.entities(), &spec, None, now());
        assert_eq!(uids(&results), vec!["A", "B"]);
        assert!(results[1].display_stale);
        assert!(!results[0].display_stale);
    }

    #[test]
    fn test_search_text_matches_uid_and_name() {
        let mut store = EntityStore::with_defaults();
        store.ingest(EventRecord::new("ANDROID-17", "a-f-G", 0.0, 0.0, ago(1), now() + Duration::minutes(5)).with_display_name("Viper"), now());
        store.ingest(EventRecord::new("ANDROID-18", "a-f-G", 0.0, 0.0, ago(1), now() + Duration::minutes(5)).with_display_name("Cobra"), now());

        let engine = QueryEngine::default();
        let by_name = engine.apply(store.entities(), &FilterSpec::default().search("vIp"), None, now());
        assert_eq!(uids(&by_name), vec!["ANDROID-17"]);

        let by_uid = engine.apply(store.entities(), &FilterSpec::default().search("android"), None, now());
        assert_eq!(by_uid.len(), 2);

        let blank = engine.apply(store.entities(), &FilterSpec::default().search("   "), None, now());
        assert_eq!(blank.len(), 2);
    }

    #[test]
    fn test_search_text_keeps_surrounding_whitespace() {
        let mut store = EntityStore::with_defaults();
        store.ingest(EventRecord::new("A", "a-f-G", 0.0, 0.0, ago(1), now() + Duration::minutes(5)).with_display_name("Alpha 17"), now());
        store.ingest(EventRecord::new("B", "a-f-G", 0.0, 0.0, ago(1), now() + Duration::minutes(5)).with_display_name("Unit17"), now());

        let engine = QueryEngine::default();
        let spaced = engine.apply(store.entities(), &FilterSpec::default().search(" 17"), None, now());
        assert_eq!(uids(&spaced), vec!["A"]);

        let bare = engine.apply(store.entities(), &FilterSpec::default().search("17"), None, now());
        assert_eq!(bare.len(), 2);

        let padded = engine.apply(store.entities(), &FilterSpec::default().search("alpha "), None, now());
        assert_eq!(uids(&padded), vec!["A"]);
        let trailing = engine.apply(store.entities(), &FilterSpec::default().search("unit17 "), None, now());
        assert!(trailing.is_empty());
    }

    #[test]
    fn test_distance_filter_and_sort_with_reference() {
        let store = scenario_store();
        let reference = GeoPoint::new(38.90, -77.03);
        let spec = FilterSpec::default()
            .within_distance(500.0, 5_000.0)
            .sort_by(SortKey::Distance, SortDirection::Descending);

        let results = QueryEngine::default().apply(store.entities(), &spec, Some(reference), now());
        assert_eq!(uids(&results), vec!["C", "B"]);
        assert!(results[0].distance_m.unwrap() > results[1].distance_m.unwrap());
        assert_eq!(results[0].cardinal(), Some(Cardinal::N));
    }

    #[test]
    fn test_no_reference_skips_distance_filter_and_sorts_by_name() {
        let mut store = EntityStore::with_defaults();
        for (uid, name) in [("U1", "charlie"), ("U2", "Alpha"), ("U3", "bravo")] {
            store.ingest(
                EventRecord::new(uid, "a-f-G", 1.0, 1.0, ago(1), now() + Duration::minutes(5)).with_display_name(name),
                now(),
            );
        }
        let spec = FilterSpec::default()
            .within_distance(0.0, 1.0)
            .sort_by(SortKey::Distance, SortDirection::Ascending);

        let results = QueryEngine::default().apply(store.entities(), &spec, None, now());
        assert_eq!(uids(&results), vec!["U2", "U3", "U1"]);
        assert!(results.iter().all(|r| r.distance_m.is_none() && r.bearing_deg.is_none()));
    }

    #[test]
    fn test_ties_break_by_uid_ascending_in_both_directions() {
        let mut store = EntityStore::with_defaults();
        for uid in ["D", "B", "C", "A"] {
            store.ingest(EventRecord::new(uid, "a-h-A", 1.0, 1.0, ago(7), now() + Duration::minutes(5)), now());
        }
        let engine = QueryEngine::default();
        for direction in [SortDirection::Ascending, SortDirection::Descending] {
            let spec = FilterSpec::default().sort_by(SortKey::Affiliation, direction);
            let results = engine.apply(store.entities(), &spec, None, now());
            assert_eq!(uids(&results), vec!["A", "B", "C", "D"]);
        }
    }

    #[test]
    fn test_age_range_and_category() {
        let store = scenario_store();
        let engine = QueryEngine::default();

        let recent = engine.apply(store.entities(), &FilterSpec::default().within_age(0.0, 60.0), None, now());
        assert_eq!(uids(&recent), vec!["C", "A"]);

        let air = engine.apply(store.entities(), &FilterSpec::default().category(Category::Air), None, now());
        assert!(air.is_empty());
    }

    #[test]
    fn test_repeated_apply_is_deterministic() {
        let store = scenario_store();
        let engine = QueryEngine::default();
        let spec = FilterSpec::default().sort_by(SortKey::Category, SortDirection::Descending);
        let first = engine.apply(store.entities(), &spec, Some(GeoPoint::new(38.9, -77.0)), now());
        let second = engine.apply(store.entities(), &spec, Some(GeoPoint::new(38.9, -77.0)), now());
        assert_eq!(first, second);
    }

    #[test]
    fn test_statistics() {
        let store = scenario_store();
        let results = QueryEngine::default().apply(
            store.entities(),
            &FilterSpec::default(),
            Some(GeoPoint::new(38.90, -77.03)),
            now(),
        );
        let stats = QueryEngine::statistics(&results);

        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_affiliation.get(&Affiliation::Friendly), Some(&2));
        assert_eq!(stats.by_affiliation.get(&Affiliation::Hostile), Some(&1));
        assert_eq!(stats.by_category.get(&Category::Other), Some(&3));
        assert_relative_eq!(stats.average_age_secs, (10.0 + 3600.0 + 5.0) / 3.0);
        assert!(stats.average_distance_m.unwrap() > 1_000.0);

        let empty = QueryEngine::statistics(&[]);
        assert_eq!(empty.total, 0);
        assert_eq!(empty.average_distance_m, None);
        assert_eq!(empty.average_age_secs, 0.0);
    }
}
