//! Tactical entity data model.
//!
//! An [`EventRecord`] is what the transport hands us (one parsed report);
//! a [`TacticalEntity`] is the canonical, merged view of one `uid`.

use crate::classification::{Affiliation, Category, Classification};
use crate::tacview_geo::GeoPoint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

// ============================================================================
// INBOUND RECORD
// ============================================================================

/// A fully parsed position/identity report from the transport layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub uid: String,
    pub classification: String,
    pub lat: f64,
    pub lon: f64,
    pub hae: Option<f64>,
    pub ce: Option<f64>,
    pub le: Option<f64>,
    pub speed: Option<f64>,
    pub course: Option<f64>,
    pub display_name: Option<String>,
    pub team: Option<String>,
    pub remarks: Option<String>,
    pub observed_at: DateTime<Utc>,
    pub stale_at: DateTime<Utc>,
}

impl EventRecord {
    /// Minimal record with every optional field absent.
    pub fn new(
        uid: impl Into<String>,
        classification: impl Into<String>,
        lat: f64,
        lon: f64,
        observed_at: DateTime<Utc>,
        stale_at: DateTime<Utc>,
    ) -> Self {
        Self {
            uid: uid.into(),
            classification: classification.into(),
            lat,
            lon,
            hae: None,
            ce: None,
            le: None,
            speed: None,
            course: None,
            display_name: None,
            team: None,
            remarks: None,
            observed_at,
            stale_at,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_team(mut self, team: impl Into<String>) -> Self {
        self.team = Some(team.into());
        self
    }

    pub fn with_remarks(mut self, remarks: impl Into<String>) -> Self {
        self.remarks = Some(remarks.into());
        self
    }

    pub fn with_motion(mut self, speed: f64, course: f64) -> Self {
        self.speed = Some(speed);
        self.course = Some(course);
        self
    }

    pub fn with_hae(mut self, hae: f64) -> Self {
        self.hae = Some(hae);
        self
    }

    pub fn with_errors(mut self, ce: f64, le: f64) -> Self {
        self.ce = Some(ce);
        self.le = Some(le);
        self
    }

    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.lat, self.lon)
    }
}

// ============================================================================
// ENTITY STATE
// ============================================================================

/// Lifecycle state. Transitions only move forward, except that a fresh
/// report can bring a `Stale` entity back to `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityState {
    Active,
    Stale,
    PendingRemoval,
}

impl EntityState {
    /// Eviction priority: lower ranks are evicted first.
    pub(crate) fn eviction_rank(&self) -> u8 {
        match self {
            EntityState::PendingRemoval => 0,
            EntityState::Stale => 1,
            EntityState::Active => 2,
        }
    }
}

impl fmt::Display for EntityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityState::Active => write!(f, "active"),
            EntityState::Stale => write!(f, "stale"),
            EntityState::PendingRemoval => write!(f, "pending_removal"),
        }
    }
}

/// Geographic position plus optional height and error estimates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub lat: f64,
    pub lon: f64,
    /// Height above ellipsoid, meters
    pub hae: Option<f64>,
    /// Circular error, meters
    pub ce: Option<f64>,
    /// Linear error, meters
    pub le: Option<f64>,
}

impl Position {
    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.lat, self.lon)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Motion {
    /// Meters per second
    pub speed: Option<f64>,
    /// Degrees true, [0, 360)
    pub course: Option<f64>,
}

/// One recorded trail point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistorySample {
    pub lat: f64,
    pub lon: f64,
    pub hae: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl HistorySample {
    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.lat, self.lon)
    }
}

// ============================================================================
// TACTICAL ENTITY
// ============================================================================

/// Canonical merged state of one tracked unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TacticalEntity {
    // === Identity ===
    pub uid: String,
    pub classification: String,
    pub affiliation: Affiliation,
    pub category: Category,

    // === Kinematics ===
    pub position: Position,
    pub motion: Motion,

    // === Labels ===
    pub display_name: Option<String>,
    pub team: Option<String>,
    pub remarks: Option<String>,

    // === Lifecycle ===
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub stale_at: DateTime<Utc>,
    /// When the sweep marked this entity stale; drives the retention window
    pub stale_since: Option<DateTime<Utc>>,
    pub state: EntityState,

    /// Time-ascending trail, oldest first
    pub position_history: VecDeque<HistorySample>,

    /// Owned by the UI for highlighting; the engine never reads it
    pub selected: bool,
}

impl TacticalEntity {
    /// Builds a new `Active` entity from its first (already validated) report.
    pub(crate) fn from_record(record: &EventRecord) -> Self {
        let class = Classification::parse(&record.classification);
        let position = Position {
            lat: record.lat,
            lon: record.lon,
            hae: record.hae,
            ce: record.ce,
            le: record.le,
        };
        let mut position_history = VecDeque::new();
        position_history.push_back(HistorySample {
            lat: record.lat,
            lon: record.lon,
            hae: record.hae,
            timestamp: record.observed_at,
        });

        Self {
            uid: record.uid.clone(),
            classification: record.classification.clone(),
            affiliation: class.affiliation,
            category: class.category,
            position,
            motion: Motion {
                speed: record.speed,
                course: record.course,
            },
            display_name: record.display_name.clone(),
            team: record.team.clone(),
            remarks: record.remarks.clone(),
            created_at: record.observed_at,
            last_updated_at: record.observed_at,
            stale_at: record.stale_at,
            stale_since: None,
            state: EntityState::Active,
            position_history,
            selected: false,
        }
    }

    /// Overwrites every field present in `record`; absent optionals keep
    /// their last known value.
    pub(crate) fn merge(&mut self, record: &EventRecord) {
        if self.classification != record.classification {
            let class = Classification::parse(&record.classification);
            self.classification = record.classification.clone();
            self.affiliation = class.affiliation;
            self.category = class.category;
        }

        self.position.lat = record.lat;
        self.position.lon = record.lon;
        merge_opt(&mut self.position.hae, record.hae);
        merge_opt(&mut self.position.ce, record.ce);
        merge_opt(&mut self.position.le, record.le);
        merge_opt(&mut self.motion.speed, record.speed);
        merge_opt(&mut self.motion.course, record.course);
        merge_opt_clone(&mut self.display_name, &record.display_name);
        merge_opt_clone(&mut self.team, &record.team);
        merge_opt_clone(&mut self.remarks, &record.remarks);

        self.last_updated_at = record.observed_at;
        self.stale_at = record.stale_at;
    }

    /// Label shown to users: display name, falling back to the uid.
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.uid)
    }

    pub fn point(&self) -> GeoPoint {
        self.position.point()
    }

    /// Seconds since the last report, never negative.
    pub fn age_secs(&self, now: DateTime<Utc>) -> f64 {
        let millis = (now - self.last_updated_at).num_milliseconds().max(0);
        millis as f64 / 1000.0
    }
}

fn merge_opt<T: Copy>(slot: &mut Option<T>, incoming: Option<T>) {
    if incoming.is_some() {
        *slot = incoming;
    }
}

fn merge_opt_clone(slot: &mut Option<String>, incoming: &Option<String>) {
    if let Some(value) = incoming {
        *slot = Some(value.clone());
    }
}
