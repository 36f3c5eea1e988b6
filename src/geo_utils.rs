//! # Geographic Utilities
//!
//! Distance and extent computations shared by the live uploader and the
//! historical reconciler.
//!
//! ## Overview
//!
//! | Function | Description |
//! |----------|-------------|
//! | [`haversine_km`] | Great-circle distance between two lat/lng pairs, in km |
//! | [`fix_distance_km`] | Same, over two [`LocationFix`] values |
//! | [`fix_distance_meters`] | Same, in meters (movement filtering) |
//! | [`compute_bounds`] | Bounding box of a sequence of fixes |
//! | [`compute_center`] | Centroid of a sequence of fixes |
//!
//! ## Example
//!
//! ```rust
//! use aq_tracker::geo_utils;
//!
//! // Dublin city centre to a point 0.003 degrees north
//! let d = geo_utils::haversine_km(53.3498, -6.2603, 53.3528, -6.2603);
//! assert!((d - 0.3336).abs() < 0.001);
//! ```
//!
//! ## Algorithm Notes
//!
//! The haversine formula uses a spherical Earth of radius 6371 km. Values are
//! reproduced exactly from the formula rather than taken from `geo`'s
//! [`Haversine`](geo::Haversine) metric, whose mean radius differs in the seventh
//! significant digit; stored feeds were derived with the 6371 km constant.
//!
//! All functions expect WGS84 coordinates in degrees.

use geo::{BoundingRect, Centroid, MultiPoint, Point};
use crate::{Bounds, LocationFix};

/// Earth radius used by every distance computation in this crate.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

// =============================================================================
// Distance Functions
// =============================================================================

/// Great-circle distance in kilometers between two points given in degrees.
///
/// Total for finite input; identical points give exactly `0.0`.
///
/// # Example
///
/// ```rust
/// use aq_tracker::geo_utils::haversine_km;
///
/// let london_paris = haversine_km(51.5074, -0.1278, 48.8566, 2.3522);
/// assert!((london_paris - 343.5).abs() < 1.0);
/// ```
#[inline]
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    // Rounding can push `a` just past 1 for near-antipodal pairs
    let a = a.clamp(0.0, 1.0);
    EARTH_RADIUS_KM * 2.0 * a.sqrt().atan2((1.0 - a).sqrt())
}

/// Great-circle distance between two fixes in kilometers.
#[inline]
pub fn fix_distance_km(a: &LocationFix, b: &LocationFix) -> f64 {
    haversine_km(a.latitude, a.longitude, b.latitude, b.longitude)
}

/// Great-circle distance between two fixes in meters.
#[inline]
pub fn fix_distance_meters(a: &LocationFix, b: &LocationFix) -> f64 {
    fix_distance_km(a, b) * 1000.0
}

/// Total length of a track of fixes in kilometers.
///
/// Empty or single-fix tracks return 0.0.
pub fn track_length_km(fixes: &[LocationFix]) -> f64 {
    if fixes.len() < 2 {
        return 0.0;
    }

    fixes
        .windows(2)
        .map(|w| fix_distance_km(&w[0], &w[1]))
        .sum()
}

// =============================================================================
// Extent Functions
// =============================================================================

fn to_multipoint(fixes: &[LocationFix]) -> MultiPoint<f64> {
    MultiPoint::new(
        fixes
            .iter()
            .filter(|f| f.is_valid())
            .map(|f| Point::new(f.longitude, f.latitude))
            .collect(),
    )
}

/// Compute the bounding box of a sequence of fixes.
///
/// Invalid fixes are skipped. Returns `None` when no valid fix remains.
///
/// # Example
///
/// ```rust
/// use aq_tracker::{LocationFix, geo_utils};
///
/// let track = vec![
///     LocationFix::new(53.340, -6.270, 0),
///     LocationFix::new(53.350, -6.260, 1_000),
///     LocationFix::new(53.345, -6.265, 2_000),
/// ];
///
/// let bounds = geo_utils::compute_bounds(&track).unwrap();
/// assert_eq!(bounds.min_lat, 53.340);
/// assert_eq!(bounds.max_lng, -6.260);
/// ```
pub fn compute_bounds(fixes: &[LocationFix]) -> Option<Bounds> {
    let rect = to_multipoint(fixes).bounding_rect()?;
    Some(Bounds {
        min_lat: rect.min().y,
        max_lat: rect.max().y,
        min_lng: rect.min().x,
        max_lng: rect.max().x,
    })
}

/// Arithmetic centroid of a sequence of fixes.
///
/// Suitable for the small areas a single session covers; tracks crossing the
/// antimeridian will produce a meaningless center.
pub fn compute_center(fixes: &[LocationFix]) -> Option<(f64, f64)> {
    let centroid = to_multipoint(fixes).centroid()?;
    Some((centroid.y(), centroid.x()))
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: f64, b: f64, epsilon: f64) -> bool {
        (a - b).abs() < epsilon
    }

    #[test]
    fn test_haversine_same_point() {
        assert_eq!(haversine_km(53.3498, -6.2603, 53.3498, -6.2603), 0.0);
    }

    #[test]
    fn test_haversine_symmetric() {
        let ab = haversine_km(53.3498, -6.2603, 51.5074, -0.1278);
        let ba = haversine_km(51.5074, -0.1278, 53.3498, -6.2603);
        assert!(approx_eq(ab, ba, 1e-9));
    }

    #[test]
    fn test_haversine_short_hop_north() {
        // 0.003 degrees of latitude is roughly 333m
        let d = haversine_km(53.3498, -6.2603, 53.3528, -6.2603);
        assert!(d > 0.27 && d < 0.37, "got {}", d);
    }

    #[test]
    fn test_haversine_reference_value() {
        // One degree of latitude on a 6371km sphere
        let expected = EARTH_RADIUS_KM * 1.0_f64.to_radians();
        let d = haversine_km(0.0, 0.0, 1.0, 0.0);
        assert!(((d - expected) / expected).abs() < 1e-6);
    }

    #[test]
    fn test_haversine_near_antipodal_is_finite() {
        let half_circumference = EARTH_RADIUS_KM * std::f64::consts::PI;
        for i in 0..2000 {
            let lat = -90.0 + 180.0 * i as f64 / 1999.0;
            let d = haversine_km(lat, 10.0, -lat, -170.0);
            assert!(d.is_finite(), "NaN at lat {}", lat);
            assert!(approx_eq(d, half_circumference, 1e-3), "got {} at lat {}", d, lat);
        }
    }

    #[test]
    fn test_fix_distance_meters() {
        let a = LocationFix::new(53.3498, -6.2603, 0);
        let b = LocationFix::new(53.3528, -6.2603, 0);
        assert!(approx_eq(fix_distance_meters(&a, &b), fix_distance_km(&a, &b) * 1000.0, 1e-9));
    }

    #[test]
    fn test_track_length_short_tracks() {
        assert_eq!(track_length_km(&[]), 0.0);
        assert_eq!(track_length_km(&[LocationFix::new(53.0, -6.0, 0)]), 0.0);
    }

    #[test]
    fn test_track_length_sums_legs() {
        let track = vec![
            LocationFix::new(53.3498, -6.2603, 0),
            LocationFix::new(53.3528, -6.2603, 60_000),
            LocationFix::new(53.3528, -6.2553, 120_000),
        ];
        let expected = fix_distance_km(&track[0], &track[1]) + fix_distance_km(&track[1], &track[2]);
        assert!(approx_eq(track_length_km(&track), expected, 1e-12));
        assert!(track_length_km(&track) > track_length_km(&track[..2]));
    }

    #[test]
    fn test_compute_bounds_skips_invalid() {
        let track = vec![
            LocationFix::new(53.34, -6.27, 0),
            LocationFix::new(f64::NAN, -6.0, 0),
            LocationFix::new(53.35, -6.26, 0),
        ];
        let bounds = compute_bounds(&track).unwrap();
        assert_eq!(bounds.min_lat, 53.34);
        assert_eq!(bounds.max_lat, 53.35);
        assert_eq!(bounds.min_lng, -6.27);
        assert_eq!(bounds.max_lng, -6.26);
    }

    #[test]
    fn test_compute_bounds_empty() {
        assert!(compute_bounds(&[]).is_none());
    }

    #[test]
    fn test_compute_center() {
        let track = vec![
            LocationFix::new(53.30, -6.20, 0),
            LocationFix::new(53.40, -6.30, 0),
        ];
        let (lat, lng) = compute_center(&track).unwrap();
        assert!(approx_eq(lat, 53.35, 1e-9));
        assert!(approx_eq(lng, -6.25, 1e-9));
    }
}
