//! # Historical Reconciliation
//!
//! Pairs sensor readings with the nearest-in-time location fix and derives
//! distance, speed and air quality along the matched track.
//!
//! ## Algorithm
//! 1. Drop readings with no finite measurement and fixes with bad coordinates
//! 2. For each reading (in input order) pick the fix minimising |Δt|; the first
//!    fix in input order wins an exact tie
//! 3. Accept the match only if |Δt| is within the window
//! 4. Walk the matches in order, accumulating haversine legs between consecutive
//!    matched fixes and the speed over each leg
//!
//! Everything is kept at full precision here; rounding for display happens in
//! [`crate::export`].

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::aqi::air_quality_index;
use crate::feed::{classify_rows, FeedRow};
use crate::geo_utils::fix_distance_km;
use crate::{LocationFix, SensorReading};

/// Below this many fixes a linear scan beats building the sorted index.
const INDEX_THRESHOLD: usize = 64;

const MS_PER_HOUR: f64 = 3_600_000.0;

/// Configuration for feed reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
#[serde(default)]
pub struct MergeConfig {
    /// Maximum |Δt| between a reading and its fix, in seconds.
    /// Default: 90
    pub window_secs: u32,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self { window_secs: 90 }
    }
}

impl MergeConfig {
    pub fn window_ms(&self) -> i64 {
        i64::from(self.window_secs) * 1000
    }
}

/// A sensor reading joined to its location fix, with derived metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct MergedRecord {
    pub created_at_label: String,
    /// Reading timestamp (epoch ms)
    pub captured_at_ms: i64,
    pub pm1: Option<f64>,
    pub pm25: Option<f64>,
    pub pm10: Option<f64>,
    pub co2: Option<f64>,
    pub temperature_c: Option<f64>,
    pub humidity_pct: Option<f64>,
    /// Coordinates of the matched fix
    pub latitude: f64,
    pub longitude: f64,
    /// |Δt| between reading and fix, whole seconds
    pub match_delta_secs: i64,
    /// Speed over the leg from the previous match (km/h)
    pub instant_speed_kmh: Option<f64>,
    /// Length of the leg from the previous match (km); `None` on the first record
    pub segment_km: Option<f64>,
    /// Running sum of all legs so far (km)
    pub cumulative_km: f64,
    pub aqi: Option<i32>,
}

// =============================================================================
// Nearest-fix lookup
// =============================================================================

/// |a - b| in ms, saturating instead of overflowing for far-apart stamps.
fn time_delta(a: i64, b: i64) -> i64 {
    i64::try_from(a.abs_diff(b)).unwrap_or(i64::MAX)
}

/// Index of the fix closest in time to `at_ms`, with its |Δt| in ms.
///
/// Exhaustive scan; ties resolve to the earliest fix in slice order. Returns
/// `None` when the closest fix is farther than `window_ms`.
pub fn nearest_fix(at_ms: i64, fixes: &[LocationFix], window_ms: i64) -> Option<(usize, i64)> {
    let mut best: Option<(usize, i64)> = None;
    for (i, fix) in fixes.iter().enumerate() {
        let delta = time_delta(at_ms, fix.captured_at_ms);
        if delta <= window_ms && best.map_or(true, |(_, d)| delta < d) {
            best = Some((i, delta));
        }
    }
    best
}

/// Fixes sorted by time for logarithmic nearest lookups.
///
/// Returns exactly what [`nearest_fix`] returns over the original slice,
/// including the earliest-in-slice tie break.
#[derive(Debug, Clone)]
pub struct FixIndex {
    /// (timestamp, original position), sorted lexicographically
    entries: Vec<(i64, usize)>,
}

impl FixIndex {
    pub fn new(fixes: &[LocationFix]) -> Self {
        let mut entries: Vec<(i64, usize)> = fixes
            .iter()
            .enumerate()
            .map(|(i, f)| (f.captured_at_ms, i))
            .collect();
        entries.sort_unstable();
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Earliest original position among entries stamped exactly `ts`.
    fn first_at(&self, ts: i64) -> Option<(usize, i64)> {
        let start = self.entries.partition_point(|&(t, _)| t < ts);
        self.entries
            .get(start)
            .filter(|&&(t, _)| t == ts)
            .map(|&(t, i)| (i, t))
    }

    pub fn nearest(&self, at_ms: i64, window_ms: i64) -> Option<(usize, i64)> {
        let pos = self.entries.partition_point(|&(t, _)| t < at_ms);

        let after = self.entries.get(pos).map(|&(t, i)| (i, time_delta(t, at_ms)));
        let before = pos
            .checked_sub(1)
            .and_then(|p| self.first_at(self.entries[p].0))
            .map(|(i, t)| (i, time_delta(at_ms, t)));

        let best = match (before, after) {
            (Some(b), Some(a)) => {
                if b.1 < a.1 || (b.1 == a.1 && b.0 < a.0) {
                    b
                } else {
                    a
                }
            }
            (Some(b), None) => b,
            (None, Some(a)) => a,
            (None, None) => return None,
        };

        (best.1 <= window_ms).then_some(best)
    }
}

enum Lookup<'a> {
    Scan(&'a [LocationFix]),
    Indexed(FixIndex),
}

impl Lookup<'_> {
    fn nearest(&self, at_ms: i64, window_ms: i64) -> Option<(usize, i64)> {
        match self {
            Lookup::Scan(fixes) => nearest_fix(at_ms, fixes, window_ms),
            Lookup::Indexed(index) => index.nearest(at_ms, window_ms),
        }
    }
}

// =============================================================================
// Reconciliation
// =============================================================================

fn valid_inputs(
    readings: &[SensorReading],
    fixes: &[LocationFix],
) -> (Vec<SensorReading>, Vec<LocationFix>) {
    let readings: Vec<SensorReading> = readings
        .iter()
        .filter(|r| r.has_measurement())
        .cloned()
        .collect();
    let fixes: Vec<LocationFix> = fixes.iter().filter(|f| f.is_valid()).copied().collect();
    (readings, fixes)
}

/// Walk matched pairs in order and compute legs, speed, running total and AQI.
fn derive_records(
    readings: &[SensorReading],
    matches: &[Option<(usize, i64)>],
    fixes: &[LocationFix],
) -> Vec<MergedRecord> {
    let mut out = Vec::with_capacity(readings.len());
    let mut previous: Option<(LocationFix, i64)> = None;
    let mut total_km = 0.0;

    for (reading, matched) in readings.iter().zip(matches) {
        let Some((fix_idx, delta_ms)) = *matched else {
            continue;
        };
        let fix = fixes[fix_idx];

        let (segment_km, instant_speed_kmh) = match previous {
            Some((prev_fix, prev_at)) => {
                let segment = fix_distance_km(&prev_fix, &fix);
                total_km += segment;
                let hours = reading.captured_at_ms.saturating_sub(prev_at) as f64 / MS_PER_HOUR;
                let speed = (hours > 0.0).then(|| segment / hours);
                (Some(segment), speed)
            }
            None => (None, None),
        };

        out.push(MergedRecord {
            created_at_label: reading.created_at_label.clone(),
            captured_at_ms: reading.captured_at_ms,
            pm1: reading.pm1,
            pm25: reading.pm25,
            pm10: reading.pm10,
            co2: reading.co2,
            temperature_c: reading.temperature_c,
            humidity_pct: reading.humidity_pct,
            latitude: fix.latitude,
            longitude: fix.longitude,
            match_delta_secs: (delta_ms as f64 / 1000.0).round() as i64,
            instant_speed_kmh,
            segment_km,
            cumulative_km: total_km,
            aqi: reading.pm25.and_then(|pm| air_quality_index(pm, reading.co2)),
        });

        previous = Some((fix, reading.captured_at_ms));
    }

    out
}

/// Reconcile sensor readings against location fixes.
///
/// Invalid readings and fixes are dropped first; readings with no fix inside
/// the window produce no record. Output follows reading order.
///
/// # Example
///
/// ```rust
/// use aq_tracker::{LocationFix, SensorReading, MergeConfig, reconcile};
///
/// let fixes = vec![
///     LocationFix::new(53.3498, -6.2603, 0),
///     LocationFix::new(53.3528, -6.2603, 60_000),
/// ];
/// let readings = vec![
///     SensorReading { pm25: Some(6.0), ..SensorReading::new(5_000, "t0") },
///     SensorReading { pm25: Some(6.0), ..SensorReading::new(65_000, "t1") },
/// ];
///
/// let merged = reconcile(&readings, &fixes, &MergeConfig::default());
/// assert_eq!(merged.len(), 2);
/// assert_eq!(merged[0].segment_km, None);
/// assert!(merged[1].cumulative_km > 0.3);
/// assert_eq!(merged[1].aqi, Some(25));
/// ```
pub fn reconcile(
    readings: &[SensorReading],
    fixes: &[LocationFix],
    config: &MergeConfig,
) -> Vec<MergedRecord> {
    let (readings, fixes) = valid_inputs(readings, fixes);
    let window_ms = config.window_ms();

    let lookup = if fixes.len() >= INDEX_THRESHOLD {
        Lookup::Indexed(FixIndex::new(&fixes))
    } else {
        Lookup::Scan(&fixes)
    };

    let matches: Vec<Option<(usize, i64)>> = readings
        .iter()
        .map(|r| lookup.nearest(r.captured_at_ms, window_ms))
        .collect();

    let records = derive_records(&readings, &matches, &fixes);
    debug!(
        "[Reconcile] {} readings x {} fixes (window {}s) -> {} records",
        readings.len(),
        fixes.len(),
        config.window_secs,
        records.len()
    );
    records
}

/// Reconcile using parallel nearest-fix lookups.
///
/// Same output as [`reconcile`]; only the per-reading lookup runs on rayon, the
/// distance walk stays sequential. Recommended for feeds with thousands of rows.
#[cfg(feature = "parallel")]
pub fn reconcile_parallel(
    readings: &[SensorReading],
    fixes: &[LocationFix],
    config: &MergeConfig,
) -> Vec<MergedRecord> {
    use rayon::prelude::*;

    let (readings, fixes) = valid_inputs(readings, fixes);
    let window_ms = config.window_ms();
    let index = FixIndex::new(&fixes);

    let matches: Vec<Option<(usize, i64)>> = readings
        .par_iter()
        .map(|r| index.nearest(r.captured_at_ms, window_ms))
        .collect();

    derive_records(&readings, &matches, &fixes)
}

/// Classify raw feed rows and reconcile them as one channel.
pub fn merge_feed_rows(rows: &[FeedRow], config: &MergeConfig) -> Vec<MergedRecord> {
    let (readings, fixes) = classify_rows(rows);
    info!(
        "[Reconcile] {} rows: {} sensor readings, {} fixes",
        rows.len(),
        readings.len(),
        fixes.len()
    );
    reconcile(&readings, &fixes, config)
}

/// Reconcile a sensor feed against a separate location feed.
pub fn merge_split_feeds(
    sensor_rows: &[FeedRow],
    location_rows: &[FeedRow],
    config: &MergeConfig,
) -> Vec<MergedRecord> {
    let readings: Vec<SensorReading> = sensor_rows.iter().filter_map(FeedRow::sensor_reading).collect();
    let fixes: Vec<LocationFix> = location_rows.iter().filter_map(FeedRow::location_fix).collect();
    info!(
        "[Reconcile] split feeds: {} sensor readings, {} fixes",
        readings.len(),
        fixes.len()
    );
    reconcile(&readings, &fixes, config)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: i64 = 1000;

    fn reading(at_ms: i64, pm25: f64) -> SensorReading {
        SensorReading {
            pm25: Some(pm25),
            ..SensorReading::new(at_ms, format!("t{}", at_ms))
        }
    }

    /// One kilometre of latitude on the 6371 km sphere, in degrees.
    fn km_deg() -> f64 {
        (1.0_f64 / 6371.0).to_degrees()
    }

    fn round3(v: f64) -> f64 {
        (v * 1000.0).round() / 1000.0
    }

    #[test]
    fn test_closer_fix_wins() {
        let fixes = vec![
            LocationFix::new(53.0, -6.0, 100 * SEC - 50 * SEC),
            LocationFix::new(53.1, -6.1, 100 * SEC + 10 * SEC),
        ];
        let config = MergeConfig { window_secs: 30 };
        let merged = reconcile(&[reading(100 * SEC, 5.0)], &fixes, &config);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].latitude, 53.1);
        assert_eq!(merged[0].match_delta_secs, 10);
    }

    #[test]
    fn test_out_of_window_reading_dropped() {
        let fixes = vec![LocationFix::new(53.0, -6.0, 50 * SEC)];
        let config = MergeConfig { window_secs: 30 };
        assert!(reconcile(&[reading(0, 5.0)], &fixes, &config).is_empty());
    }

    #[test]
    fn test_window_is_inclusive() {
        let fixes = vec![LocationFix::new(53.0, -6.0, 30 * SEC)];
        let config = MergeConfig { window_secs: 30 };
        let merged = reconcile(&[reading(0, 5.0)], &fixes, &config);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].match_delta_secs, 30);
    }

    #[test]
    fn test_exact_tie_prefers_first_fix() {
        let fixes = vec![
            LocationFix::new(10.0, 10.0, 20 * SEC),
            LocationFix::new(20.0, 20.0, 0),
            LocationFix::new(30.0, 30.0, 20 * SEC),
        ];
        assert_eq!(nearest_fix(10 * SEC, &fixes, 60 * SEC), Some((0, 10 * SEC)));

        let index = FixIndex::new(&fixes);
        assert_eq!(index.nearest(10 * SEC, 60 * SEC), Some((0, 10 * SEC)));
    }

    #[test]
    fn test_index_matches_scan() {
        // Irregular spacing with duplicate timestamps and out-of-order input
        let fixes: Vec<LocationFix> = (0..200)
            .map(|i: i64| {
                let t = ((i * 7919) % 263) * 3 * SEC;
                LocationFix::new(53.0 + i as f64 * 1e-4, -6.0, t)
            })
            .collect();
        let index = FixIndex::new(&fixes);
        assert_eq!(index.len(), 200);

        for probe in (-20..900).map(|s| s * SEC + 500) {
            for window in [0, 1 * SEC, 2 * SEC, 90 * SEC] {
                assert_eq!(
                    index.nearest(probe, window),
                    nearest_fix(probe, &fixes, window),
                    "probe {} window {}",
                    probe,
                    window
                );
            }
        }
    }

    #[test]
    fn test_invalid_inputs_are_excluded() {
        let fixes = vec![
            LocationFix::new(f64::NAN, -6.0, 0),
            LocationFix::new(53.0, -6.0, 40 * SEC),
        ];
        let readings = vec![
            SensorReading::new(0, "empty"),
            reading(0, 5.0),
        ];
        let merged = reconcile(&readings, &fixes, &MergeConfig::default());
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].created_at_label, "t0");
        assert_eq!(merged[0].latitude, 53.0);
    }

    #[test]
    fn test_extreme_timestamps_do_not_overflow() {
        let fixes = vec![
            LocationFix::new(53.0, -6.0, i64::MIN),
            LocationFix::new(53.1, -6.0, i64::MAX),
        ];
        assert_eq!(nearest_fix(i64::MAX, &fixes, 0), Some((1, 0)));
        assert_eq!(nearest_fix(0, &fixes, 1_000), None);

        let index = FixIndex::new(&fixes);
        assert_eq!(index.nearest(i64::MIN, 0), Some((0, 0)));
        assert_eq!(index.nearest(0, 1_000), None);

        let readings = vec![reading(i64::MIN, 5.0), reading(i64::MAX, 5.0)];
        let merged = reconcile(&readings, &fixes, &MergeConfig::default());
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[1].match_delta_secs, 0);
        assert!(merged[1].cumulative_km.is_finite());
    }

    #[test]
    fn test_triangle_cumulative_distance() {
        let d = km_deg();
        let fixes = vec![
            LocationFix::new(0.0, 0.0, 0),
            LocationFix::new(d, 0.0, 60 * SEC),
            LocationFix::new(d, d, 120 * SEC),
        ];
        let readings = vec![reading(0, 5.0), reading(60 * SEC, 5.0), reading(120 * SEC, 5.0)];
        let merged = reconcile(&readings, &fixes, &MergeConfig::default());

        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].segment_km, None);
        assert_eq!(merged[0].instant_speed_kmh, None);
        let totals: Vec<f64> = merged.iter().map(|r| round3(r.cumulative_km)).collect();
        assert_eq!(totals, vec![0.0, 1.0, 2.0]);

        // 1 km in one minute
        let speed = merged[1].instant_speed_kmh.unwrap();
        assert!((speed - 60.0).abs() < 1e-6);
    }

    #[test]
    fn test_cumulative_is_monotonic() {
        let fixes: Vec<LocationFix> = (0..20)
            .map(|i| LocationFix::new(53.0 + (i % 3) as f64 * 0.001, -6.0 + (i % 5) as f64 * 0.001, i * 10 * SEC))
            .collect();
        let readings: Vec<SensorReading> = (0..40).map(|i| reading(i * 5 * SEC, 10.0)).collect();
        let merged = reconcile(&readings, &fixes, &MergeConfig { window_secs: 5 });
        assert!(!merged.is_empty());
        for w in merged.windows(2) {
            assert!(w[1].cumulative_km >= w[0].cumulative_km);
        }
        assert!(merged.iter().all(|r| r.match_delta_secs <= 5));
    }

    #[test]
    fn test_same_timestamp_has_no_speed() {
        let fixes = vec![
            LocationFix::new(53.0, -6.0, 0),
            LocationFix::new(53.01, -6.0, 1),
        ];
        let readings = vec![reading(0, 5.0), reading(0, 5.0)];
        let merged = reconcile(&readings, &fixes, &MergeConfig::default());
        assert_eq!(merged.len(), 2);
        // Both readings pick the first fix, zero-length leg at zero elapsed time
        assert_eq!(merged[1].segment_km, Some(0.0));
        assert_eq!(merged[1].instant_speed_kmh, None);
    }

    #[test]
    fn test_aqi_uses_reading_co2() {
        let fixes = vec![LocationFix::new(53.0, -6.0, 0)];
        let readings = vec![SensorReading {
            pm25: Some(35.4),
            co2: Some(2500.0),
            ..SensorReading::new(0, "t")
        }];
        let merged = reconcile(&readings, &fixes, &MergeConfig::default());
        assert_eq!(merged[0].aqi, Some(120));

        let no_pm = vec![SensorReading { co2: Some(2500.0), ..SensorReading::new(0, "t") }];
        assert_eq!(reconcile(&no_pm, &fixes, &MergeConfig::default())[0].aqi, None);
    }

    #[test]
    fn test_reconcile_is_deterministic() {
        let fixes: Vec<LocationFix> = (0..100)
            .map(|i| LocationFix::new(53.0 + i as f64 * 0.0005, -6.0, i * 7 * SEC))
            .collect();
        let readings: Vec<SensorReading> = (0..150).map(|i| reading(i * 5 * SEC, i as f64)).collect();
        let a = reconcile(&readings, &fixes, &MergeConfig::default());
        let b = reconcile(&readings, &fixes, &MergeConfig::default());
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[test]
    fn test_merge_feed_rows_same_channel() {
        let json = r#"[
            {"created_at": "2024-05-01T12:00:00+01:00", "field7": "53.3498", "field8": "-6.2603"},
            {"created_at": "2024-05-01T12:00:20+01:00", "field2": "6.0", "field4": "450"},
            {"created_at": "2024-05-01T12:01:00+01:00", "field7": "53.3528", "field8": "-6.2603"},
            {"created_at": "2024-05-01T12:01:10+01:00", "field2": "12.1"},
            {"created_at": "2024-05-01T12:10:00+01:00", "field2": "50"}
        ]"#;
        let rows: Vec<FeedRow> = serde_json::from_str(json).unwrap();
        let merged = merge_feed_rows(&rows, &MergeConfig { window_secs: 30 });

        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].match_delta_secs, 20);
        assert_eq!(merged[0].aqi, Some(25));
        assert_eq!(merged[1].latitude, 53.3528);
        assert_eq!(merged[1].aqi, Some(51));
        assert!(merged[1].segment_km.unwrap() > 0.3);
    }

    #[test]
    fn test_merge_split_feeds() {
        let sensors: Vec<FeedRow> = serde_json::from_str(
            r#"[{"created_at": "2024-05-01T12:00:00Z", "field1": "2", "field7": "1.0", "field8": "1.0"}]"#,
        )
        .unwrap();
        let locations: Vec<FeedRow> = serde_json::from_str(
            r#"[{"created_at": "2024-05-01T12:00:03Z", "field7": "53.0", "field8": "-6.0"}]"#,
        )
        .unwrap();
        let merged = merge_split_feeds(&sensors, &locations, &MergeConfig::default());
        assert_eq!(merged.len(), 1);
        // Coordinates on the sensor channel are ignored in split mode
        assert_eq!(merged[0].latitude, 53.0);
        assert_eq!(merged[0].match_delta_secs, 3);
    }

    #[cfg(feature = "parallel")]
    #[test]
    fn test_parallel_matches_sequential() {
        let fixes: Vec<LocationFix> = (0..300)
            .map(|i| LocationFix::new(53.0 + i as f64 * 0.0002, -6.0, ((i * 31) % 300) * 4 * SEC))
            .collect();
        let readings: Vec<SensorReading> = (0..500).map(|i| reading(i * 3 * SEC, 8.0)).collect();
        let config = MergeConfig::default();
        assert_eq!(
            reconcile(&readings, &fixes, &config),
            reconcile_parallel(&readings, &fixes, &config)
        );
    }
}
