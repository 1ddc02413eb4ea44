//! Ground truth oracle for simulation.
//!
//! The Oracle maintains the "God's eye view" of the simulated picture:
//! - True positions of all units in a local east/north/up frame (meters)
//! - Constant-velocity kinematics
//! - Report generation with Gaussian position noise, plus deliberately
//!   malformed reports for the chaos scenarios

use chrono::{DateTime, Duration, Utc};
use nalgebra::Vector3;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tacview_core::tacview_geo::{destination, normalize_degrees};
use tacview_core::{EventRecord, GeoPoint};

const CLASSIFICATIONS: [&str; 6] = ["a-f-G-U-C", "a-f-A-M-F", "a-h-G", "a-h-S", "a-n-A", "a-u-G"];

/// A ground truth unit in the simulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimUnit {
    pub id: u64,
    pub callsign: String,
    pub classification: String,

    /// Position [east, north, up] in meters from the origin
    pub position: Vector3<f64>,

    /// Velocity [east, north, up] in m/s
    pub velocity: Vector3<f64>,

    /// Still reporting
    pub active: bool,
}

impl SimUnit {
    pub fn uid(&self) -> String {
        format!("SIM-{:04}", self.id)
    }

    pub fn speed(&self) -> f64 {
        self.velocity.xy().norm()
    }

    /// Degrees true of horizontal motion
    pub fn course(&self) -> f64 {
        normalize_degrees(self.velocity.x.atan2(self.velocity.y).to_degrees())
    }
}

/// Kinds of bad input the oracle can inject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Malformation {
    EmptyUid,
    LatitudeOutOfRange,
    NonFinite,
    /// `stale_at == observed_at`; accepted with a repaired validity window
    ZeroValidity,
}

/// The Oracle - maintains ground truth and generates reports.
pub struct Oracle {
    rng: ChaCha8Rng,

    /// Geographic anchor of the local frame
    origin: GeoPoint,

    /// Ordered so report generation is deterministic
    units: BTreeMap<u64, SimUnit>,

    next_id: u64,

    /// Seconds since simulation start
    current_time: f64,

    /// None means noiseless reports
    position_noise: Option<Normal<f64>>,

    /// Validity window stamped on each report
    validity: Duration,
}

impl Oracle {
    pub fn new(seed: u64, origin: GeoPoint) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            origin,
            units: BTreeMap::new(),
            next_id: 0,
            current_time: 0.0,
            position_noise: Normal::new(0.0, 3.0).ok(),
            validity: Duration::seconds(60),
        }
    }

    /// Sets the position noise standard deviation in meters.
    pub fn set_position_noise(&mut self, std_dev: f64) {
        self.position_noise = Normal::new(0.0, std_dev).ok().filter(|_| std_dev > 0.0);
    }

    pub fn set_validity(&mut self, validity: Duration) {
        self.validity = validity;
    }

    pub fn origin(&self) -> GeoPoint {
        self.origin
    }

    pub fn spawn_unit(&mut self, position: Vector3<f64>, velocity: Vector3<f64>, classification: &str) -> u64 {
        let id = self.next_id;
        self.next_id += 1;

        let unit = SimUnit {
            id,
            callsign: format!("Unit {}", id),
            classification: classification.to_string(),
            position,
            velocity,
            active: true,
        };
        self.units.insert(id, unit);
        id
    }

    /// Spawns `count` units scattered within `radius_m` of the origin.
    pub fn spawn_random_units(&mut self, count: usize, radius_m: f64, max_speed: f64) -> Vec<u64> {
        (0..count)
            .map(|_| {
                let range = self.rng.gen_range(0.0..=radius_m);
                let angle = self.rng.gen_range(0.0..std::f64::consts::TAU);
                let speed = self.rng.gen_range(0.0..=max_speed);
                let heading = self.rng.gen_range(0.0..std::f64::consts::TAU);
                let class = CLASSIFICATIONS.choose(&mut self.rng).copied().unwrap_or("a-u-G");

                let position = Vector3::new(range * angle.sin(), range * angle.cos(), 0.0);
                let velocity = Vector3::new(speed * heading.sin(), speed * heading.cos(), 0.0);
                self.spawn_unit(position, velocity, class)
            })
            .collect()
    }

    /// Stops a unit from reporting.
    pub fn remove_unit(&mut self, id: u64) {
        if let Some(unit) = self.units.get_mut(&id) {
            unit.active = false;
        }
    }

    /// Lets a removed unit report again under the same uid.
    pub fn resume_unit(&mut self, id: u64) {
        if let Some(unit) = self.units.get_mut(&id) {
            unit.active = true;
        }
    }

    /// Advances physics by dt seconds.
    pub fn step(&mut self, dt: f64) {
        self.current_time += dt;
        for unit in self.units.values_mut().filter(|u| u.active) {
            unit.position += unit.velocity * dt;
        }
    }

    pub fn time(&self) -> f64 {
        self.current_time
    }

    pub fn active_units(&self) -> impl Iterator<Item = &SimUnit> {
        self.units.values().filter(|u| u.active)
    }

    pub fn unit(&self, id: u64) -> Option<&SimUnit> {
        self.units.get(&id)
    }

    /// True geographic position of a unit.
    pub fn truth(&self, id: u64) -> Option<GeoPoint> {
        self.units.get(&id).map(|u| self.to_geo(&u.position))
    }

    /// Converts a local east/north offset to a geographic point.
    pub fn to_geo(&self, position: &Vector3<f64>) -> GeoPoint {
        let range = position.xy().norm();
        let bearing = normalize_degrees(position.x.atan2(position.y).to_degrees());
        destination(self.origin, bearing, range)
    }

    /// Generates a noisy report for one active unit.
    pub fn report(&mut self, id: u64, now: DateTime<Utc>) -> Option<EventRecord> {
        let unit = self.units.get(&id).filter(|u| u.active)?.clone();
        let noise = match self.position_noise {
            Some(normal) => Vector3::new(normal.sample(&mut self.rng), normal.sample(&mut self.rng), 0.0),
            None => Vector3::zeros(),
        };
        let point = self.to_geo(&(unit.position + noise));

        Some(
            EventRecord::new(unit.uid(), unit.classification.clone(), point.lat, point.lon, now, now + self.validity)
                .with_display_name(unit.callsign.clone())
                .with_motion(unit.speed(), unit.course())
                .with_hae(unit.position.z),
        )
    }

    /// Reports for every active unit, in id order.
    pub fn reports(&mut self, now: DateTime<Utc>) -> Vec<EventRecord> {
        let ids: Vec<u64> = self.active_units().map(|u| u.id).collect();
        ids.into_iter().filter_map(|id| self.report(id, now)).collect()
    }

    /// A report that exercises one of the ingestion boundary rules.
    pub fn malformed(&mut self, kind: Malformation, now: DateTime<Utc>) -> EventRecord {
        let serial = self.rng.gen_range(0..10_000u32);
        let uid = format!("BAD-{:04}", serial);
        let origin = self.origin;
        match kind {
            Malformation::EmptyUid => EventRecord::new("", "a-h-G", origin.lat, origin.lon, now, now + self.validity),
            Malformation::LatitudeOutOfRange => EventRecord::new(uid, "a-h-G", 91.0, origin.lon, now, now + self.validity),
            Malformation::NonFinite => EventRecord::new(uid, "a-h-G", f64::NAN, origin.lon, now, now + self.validity),
            Malformation::ZeroValidity => EventRecord::new(uid, "a-u-G", origin.lat, origin.lon, now, now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tacview_core::tacview_geo::distance_m;

    fn origin() -> GeoPoint {
        GeoPoint::new(38.8977, -77.0365)
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_oracle_physics_step() {
        let mut oracle = Oracle::new(42, origin());
        let id = oracle.spawn_unit(Vector3::zeros(), Vector3::new(0.0, 20.0, 0.0), "a-f-G");

        oracle.step(1.0);

        let unit = oracle.unit(id).unwrap();
        assert!((unit.position.y - 20.0).abs() < 1e-9);
        assert!((unit.course() - 0.0).abs() < 1e-9);
        let moved = distance_m(origin(), oracle.truth(id).unwrap());
        assert!((moved - 20.0).abs() < 0.01);
    }

    #[test]
    fn test_oracle_deterministic_reports() {
        let mut a = Oracle::new(42, origin());
        let mut b = Oracle::new(42, origin());
        a.spawn_random_units(5, 2_000.0, 10.0);
        b.spawn_random_units(5, 2_000.0, 10.0);

        assert_eq!(a.reports(t0()), b.reports(t0()));
    }

    #[test]
    fn test_noiseless_report_matches_truth() {
        let mut oracle = Oracle::new(1, origin());
        oracle.set_position_noise(0.0);
        let id = oracle.spawn_unit(Vector3::new(300.0, -400.0, 12.0), Vector3::zeros(), "a-h-G");

        let report = oracle.report(id, t0()).unwrap();
        let truth = oracle.truth(id).unwrap();
        assert!(distance_m(report.point(), truth) < 1e-6);
        assert!((distance_m(origin(), truth) - 500.0).abs() < 0.1);
        assert_eq!(report.hae, Some(12.0));
        assert_eq!(report.stale_at - report.observed_at, Duration::seconds(60));
    }

    #[test]
    fn test_removed_unit_stops_reporting() {
        let mut oracle = Oracle::new(9, origin());
        let id = oracle.spawn_unit(Vector3::zeros(), Vector3::zeros(), "a-f-G");
        oracle.remove_unit(id);
        assert!(oracle.report(id, t0()).is_none());
        assert!(oracle.reports(t0()).is_empty());

        oracle.resume_unit(id);
        assert_eq!(oracle.reports(t0()).len(), 1);
    }

    #[test]
    fn test_malformed_reports() {
        let mut oracle = Oracle::new(5, origin());
        assert!(oracle.malformed(Malformation::EmptyUid, t0()).uid.is_empty());
        assert_eq!(oracle.malformed(Malformation::LatitudeOutOfRange, t0()).lat, 91.0);
        assert!(oracle.malformed(Malformation::NonFinite, t0()).lat.is_nan());
        let zero = oracle.malformed(Malformation::ZeroValidity, t0());
        assert_eq!(zero.stale_at, zero.observed_at);
    }

    proptest::proptest! {
        #[test]
        fn prop_spawned_units_stay_inside_radius(seed in 0u64..10_000, radius in 10.0f64..20_000.0) {
            let mut oracle = Oracle::new(seed, origin());
            let ids = oracle.spawn_random_units(16, radius, 15.0);
            for id in ids {
                let unit = oracle.unit(id).unwrap();
                proptest::prop_assert!(unit.speed() <= 15.0 + 1e-9);
                let range = distance_m(origin(), oracle.truth(id).unwrap());
                proptest::prop_assert!(range <= radius * 1.001 + 0.01);
            }
        }
    }
}
