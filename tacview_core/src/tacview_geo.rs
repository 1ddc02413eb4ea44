//! The "GEO" Calculator - Spherical-Earth Geometry for Tactical Ranges
//!
//! Pure functions used by the store (history admission, proximity index)
//! and by the query engine (distance/bearing enrichment):
//! - Haversine great-circle distance
//! - Initial great-circle bearing and heading-relative bearing
//! - 16-point compass labels
//! - Destination point and lat/lon bounding boxes
//!
//! All formulas assume a sphere of radius 6,371,000 m. Over tactical
//! distances (< 100 km) the error against the WGS84 ellipsoid stays well
//! under 0.5%.

use geo::{coord, Intersects, Rect};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Mean spherical Earth radius in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// A latitude/longitude pair in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// True when both coordinates are finite and inside their WGS84 ranges.
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }
}

impl From<GeoPoint> for geo::Point<f64> {
    fn from(p: GeoPoint) -> Self {
        geo::Point::new(p.lon, p.lat)
    }
}

// ============================================================================
// DISTANCE & BEARING
// ============================================================================

/// Great-circle distance between two points in meters (Haversine).
pub fn distance_m(a: GeoPoint, b: GeoPoint) -> f64 {
    let phi1 = a.lat.to_radians();
    let phi2 = b.lat.to_radians();
    let d_phi = (b.lat - a.lat).to_radians();
    let d_lambda = (b.lon - a.lon).to_radians();

    let h = (d_phi / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);

    // Clamp guards asin against rounding just above 1.0 for antipodal points
    2.0 * EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
}

/// Initial great-circle bearing from `a` to `b`, degrees in [0, 360).
pub fn bearing_deg(a: GeoPoint, b: GeoPoint) -> f64 {
    let phi1 = a.lat.to_radians();
    let phi2 = b.lat.to_radians();
    let d_lambda = (b.lon - a.lon).to_radians();

    let y = d_lambda.sin() * phi2.cos();
    let x = phi1.cos() * phi2.sin() - phi1.sin() * phi2.cos() * d_lambda.cos();

    normalize_degrees(y.atan2(x).to_degrees())
}

/// Signed angle from `heading` to `bearing`, degrees in (-180, 180].
///
/// Positive values are clockwise (target to the right of the heading).
pub fn relative_bearing(heading: f64, bearing: f64) -> f64 {
    let diff = normalize_degrees(bearing - heading);
    if diff > 180.0 {
        diff - 360.0
    } else {
        diff
    }
}

/// Wraps any angle into [0, 360).
pub fn normalize_degrees(deg: f64) -> f64 {
    let wrapped = deg.rem_euclid(360.0);
    // rem_euclid can return exactly 360.0 for tiny negative inputs
    if wrapped >= 360.0 {
        0.0
    } else {
        wrapped
    }
}

/// Point reached by travelling `distance_m` from `origin` on initial `bearing`.
pub fn destination(origin: GeoPoint, bearing: f64, distance_m: f64) -> GeoPoint {
    let delta = distance_m / EARTH_RADIUS_M;
    let theta = bearing.to_radians();
    let phi1 = origin.lat.to_radians();
    let lambda1 = origin.lon.to_radians();

    let phi2 = (phi1.sin() * delta.cos() + phi1.cos() * delta.sin() * theta.cos()).asin();
    let lambda2 = lambda1
        + (theta.sin() * delta.sin() * phi1.cos()).atan2(delta.cos() - phi1.sin() * phi2.sin());

    let lon = (lambda2.to_degrees() + 540.0).rem_euclid(360.0) - 180.0;
    GeoPoint::new(phi2.to_degrees(), lon)
}

// ============================================================================
// COMPASS LABELS
// ============================================================================

/// The 16 compass points, clockwise from north.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Cardinal {
    N,
    NNE,
    NE,
    ENE,
    E,
    ESE,
    SE,
    SSE,
    S,
    SSW,
    SW,
    WSW,
    W,
    WNW,
    NW,
    NNW,
}

impl Cardinal {
    const ALL: [Cardinal; 16] = [
        Cardinal::N,
        Cardinal::NNE,
        Cardinal::NE,
        Cardinal::ENE,
        Cardinal::E,
        Cardinal::ESE,
        Cardinal::SE,
        Cardinal::SSE,
        Cardinal::S,
        Cardinal::SSW,
        Cardinal::SW,
        Cardinal::WSW,
        Cardinal::W,
        Cardinal::WNW,
        Cardinal::NW,
        Cardinal::NNW,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Cardinal::N => "N",
            Cardinal::NNE => "NNE",
            Cardinal::NE => "NE",
            Cardinal::ENE => "ENE",
            Cardinal::E => "E",
            Cardinal::ESE => "ESE",
            Cardinal::SE => "SE",
            Cardinal::SSE => "SSE",
            Cardinal::S => "S",
            Cardinal::SSW => "SSW",
            Cardinal::SW => "SW",
            Cardinal::WSW => "WSW",
            Cardinal::W => "W",
            Cardinal::WNW => "WNW",
            Cardinal::NW => "NW",
            Cardinal::NNW => "NNW",
        }
    }
}

impl fmt::Display for Cardinal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Compass label for a bearing using 22.5° sectors centred on each point.
///
/// A bearing exactly on a sector edge goes to the clockwise neighbour.
pub fn cardinal(bearing: f64) -> Cardinal {
    let sector = ((normalize_degrees(bearing) + 11.25) / 22.5).floor() as usize % 16;
    Cardinal::ALL[sector]
}

// ============================================================================
// BOUNDING BOX
// ============================================================================

/// A lat/lon viewport.
///
/// When `west > east` the box wraps the antimeridian and is stored as two
/// rectangles.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundingBox {
    parts: Vec<Rect<f64>>,
}

impl BoundingBox {
    pub fn new(south: f64, west: f64, north: f64, east: f64) -> Self {
        let (south, north) = if south <= north { (south, north) } else { (north, south) };
        let parts = if west <= east {
            vec![Rect::new(coord! { x: west, y: south }, coord! { x: east, y: north })]
        } else {
            vec![
                Rect::new(coord! { x: west, y: south }, coord! { x: 180.0, y: north }),
                Rect::new(coord! { x: -180.0, y: south }, coord! { x: east, y: north }),
            ]
        };
        Self { parts }
    }

    /// Inclusive containment test.
    pub fn contains(&self, point: GeoPoint) -> bool {
        let c = coord! { x: point.lon, y: point.lat };
        self.parts.iter().any(|rect| rect.intersects(&c))
    }

    pub fn wraps_antimeridian(&self) -> bool {
        self.parts.len() > 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const WHITE_HOUSE: GeoPoint = GeoPoint { lat: 38.8977, lon: -77.0365 };
    const WASHINGTON_MONUMENT: GeoPoint = GeoPoint { lat: 38.8895, lon: -77.0353 };

    #[test]
    fn test_distance_white_house_to_monument() {
        let d = distance_m(WHITE_HOUSE, WASHINGTON_MONUMENT);
        assert!((d - 920.0).abs() < 920.0 * 0.05, "distance was {}", d);
    }

    #[test]
    fn test_distance_zero_and_symmetric() {
        assert_relative_eq!(distance_m(WHITE_HOUSE, WHITE_HOUSE), 0.0);
        assert_relative_eq!(
            distance_m(WHITE_HOUSE, WASHINGTON_MONUMENT),
            distance_m(WASHINGTON_MONUMENT, WHITE_HOUSE),
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_one_degree_of_latitude() {
        let d = distance_m(GeoPoint::new(0.0, 0.0), GeoPoint::new(1.0, 0.0));
        assert_relative_eq!(d, EARTH_RADIUS_M * 1f64.to_radians(), epsilon = 1e-6);
    }

    #[test]
    fn test_bearing_cardinal_directions() {
        let origin = GeoPoint::new(0.0, 0.0);
        assert_relative_eq!(bearing_deg(origin, GeoPoint::new(1.0, 0.0)), 0.0, epsilon = 1e-9);
        assert_relative_eq!(bearing_deg(origin, GeoPoint::new(0.0, 1.0)), 90.0, epsilon = 1e-9);
        assert_relative_eq!(bearing_deg(origin, GeoPoint::new(-1.0, 0.0)), 180.0, epsilon = 1e-9);
        assert_relative_eq!(bearing_deg(origin, GeoPoint::new(0.0, -1.0)), 270.0, epsilon = 1e-9);
    }

    #[test]
    fn test_bearing_white_house_to_monument_is_southerly() {
        let b = bearing_deg(WHITE_HOUSE, WASHINGTON_MONUMENT);
        assert!(b > 170.0 && b < 180.0, "bearing was {}", b);
        assert_eq!(cardinal(b), Cardinal::S);
    }

    #[test]
    fn test_relative_bearing_range() {
        assert_relative_eq!(relative_bearing(350.0, 10.0), 20.0, epsilon = 1e-9);
        assert_relative_eq!(relative_bearing(10.0, 350.0), -20.0, epsilon = 1e-9);
        assert_relative_eq!(relative_bearing(0.0, 180.0), 180.0, epsilon = 1e-9);
        assert_relative_eq!(relative_bearing(90.0, 270.0), 180.0, epsilon = 1e-9);
        assert_relative_eq!(relative_bearing(45.0, 45.0), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_cardinal_sectors_and_boundaries() {
        assert_eq!(cardinal(0.0), Cardinal::N);
        assert_eq!(cardinal(11.24), Cardinal::N);
        assert_eq!(cardinal(11.25), Cardinal::NNE);
        assert_eq!(cardinal(22.5), Cardinal::NNE);
        assert_eq!(cardinal(90.0), Cardinal::E);
        assert_eq!(cardinal(348.75), Cardinal::N);
        assert_eq!(cardinal(348.74), Cardinal::NNW);
        assert_eq!(cardinal(-90.0), Cardinal::W);
        assert_eq!(cardinal(720.0 + 45.0), Cardinal::NE);
        assert_eq!(Cardinal::SSW.to_string(), "SSW");
    }

    #[test]
    fn test_destination_round_trip_distance() {
        let dest = destination(WHITE_HOUSE, 135.0, 2_500.0);
        assert_relative_eq!(distance_m(WHITE_HOUSE, dest), 2_500.0, epsilon = 1e-3);
        assert_relative_eq!(bearing_deg(WHITE_HOUSE, dest), 135.0, epsilon = 0.05);
    }

    #[test]
    fn test_destination_wraps_longitude() {
        let dest = destination(GeoPoint::new(0.0, 179.99), 90.0, 5_000.0);
        assert!(dest.lon < -179.0, "lon was {}", dest.lon);
        assert!(dest.is_valid());
    }

    #[test]
    fn test_geo_point_validity() {
        assert!(GeoPoint::new(90.0, -180.0).is_valid());
        assert!(!GeoPoint::new(90.1, 0.0).is_valid());
        assert!(!GeoPoint::new(0.0, 180.5).is_valid());
        assert!(!GeoPoint::new(f64::NAN, 0.0).is_valid());
    }

    #[test]
    fn test_bounding_box_inclusive() {
        let bbox = BoundingBox::new(38.0, -78.0, 39.0, -77.0);
        assert!(bbox.contains(WHITE_HOUSE));
        assert!(bbox.contains(GeoPoint::new(39.0, -77.0)));
        assert!(!bbox.contains(GeoPoint::new(39.01, -77.5)));
        assert!(!bbox.wraps_antimeridian());
    }

    #[test]
    fn test_bounding_box_antimeridian() {
        let bbox = BoundingBox::new(-10.0, 170.0, 10.0, -170.0);
        assert!(bbox.wraps_antimeridian());
        assert!(bbox.contains(GeoPoint::new(0.0, 175.0)));
        assert!(bbox.contains(GeoPoint::new(0.0, -175.0)));
        assert!(!bbox.contains(GeoPoint::new(0.0, 0.0)));
    }
}
