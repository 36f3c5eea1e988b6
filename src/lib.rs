//! # AQ Tracker
//!
//! Air-quality telemetry relay: couples a moving location source with a particulate/CO2
//! sensor and a remote time-series ingestion store.
//!
//! This library provides:
//! - Haversine distance and track geometry
//! - A PM2.5 AQI with a CO2 penalty
//! - Historical reconciliation: nearest-in-time matching of sensor readings to
//!   location fixes, with segment distance, cumulative distance and speed
//! - A rate/period upload gate with a movement filter and an async live uploader
//!
//! ## Features
//!
//! - **`live`** - Async live uploader on tokio (default)
//! - **`parallel`** - Enable parallel reconciliation with rayon
//! - **`http`** - Enable the ThingSpeak client and sensor board source
//! - **`ffi`** - Enable FFI bindings for mobile platforms (iOS/Android)
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use aq_tracker::{reconcile, LocationFix, MergeConfig, SensorReading};
//!
//! let fixes = vec![
//!     LocationFix::new(53.3498, -6.2603, 0),
//!     LocationFix::new(53.3588, -6.2603, 60_000),
//! ];
//! let readings = vec![
//!     SensorReading { pm25: Some(8.0), ..SensorReading::new(2_000, "12:00:02") },
//!     SensorReading { pm25: Some(40.0), co2: Some(1200.0), ..SensorReading::new(61_000, "12:01:01") },
//! ];
//!
//! let merged = reconcile(&readings, &fixes, &MergeConfig::default());
//! assert_eq!(merged.len(), 2);
//! assert_eq!(merged[0].aqi, Some(33));
//! assert!(merged[1].cumulative_km > 0.99);
//! ```

use serde::{Deserialize, Serialize};

pub mod error;
pub use error::{RelayError, Result};

pub mod geo_utils;
pub use geo_utils::{haversine_km, EARTH_RADIUS_KM};

pub mod aqi;
pub use aqi::{air_quality_index, aqi_for_pm25};

pub mod feed;
pub use feed::{CompositeRecord, FeedRow};

pub mod reconcile;
pub use reconcile::{merge_feed_rows, merge_split_feeds, reconcile, MergeConfig, MergedRecord};

pub mod export;
pub use export::{to_csv, ExportRow, MergeSummary};

// Upload gating (runtime-agnostic state machine)
pub mod gate;
pub use gate::{Schedule, Trigger, UploadConfig, UploadGate};

#[cfg(feature = "live")]
pub mod live;

#[cfg(feature = "live")]
pub use live::{live_channel, IngestionSink, LiveUploader, SensorSource, UploadStatus};

// HTTP module for the ingestion store and sensor board
#[cfg(feature = "http")]
pub mod http;

#[cfg(feature = "http")]
pub use http::{fetch_and_merge, DeviceSensorClient, FeedSource, ThingSpeakClient, ThingSpeakConfig};

#[cfg(feature = "ffi")]
uniffi::setup_scaffolding!();

/// Initialize logging for Android (only used in FFI)
#[cfg(all(feature = "ffi", target_os = "android"))]
fn init_logging() {
    use android_logger::Config;
    use log::LevelFilter;

    android_logger::init_once(
        Config::default()
            .with_max_level(LevelFilter::Debug)
            .with_tag("AqTrackerRust")
    );
}

#[cfg(all(feature = "ffi", not(target_os = "android")))]
fn init_logging() {
    // No-op on non-Android platforms
}

// ============================================================================
// Core Types
// ============================================================================

/// A timestamped position from the location source.
///
/// # Example
/// ```
/// use aq_tracker::LocationFix;
/// let fix = LocationFix::new(53.3498, -6.2603, 1_714_564_800_000).with_accuracy(8.0);
/// assert!(fix.is_valid());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct LocationFix {
    pub latitude: f64,
    pub longitude: f64,
    /// Reported horizontal accuracy, if the source gives one
    #[serde(default)]
    pub accuracy_meters: Option<f64>,
    /// Unix epoch milliseconds
    pub captured_at_ms: i64,
}

impl LocationFix {
    pub fn new(latitude: f64, longitude: f64, captured_at_ms: i64) -> Self {
        Self { latitude, longitude, accuracy_meters: None, captured_at_ms }
    }

    pub fn with_accuracy(mut self, meters: f64) -> Self {
        self.accuracy_meters = Some(meters);
        self
    }

    /// Check if both coordinates are finite numbers.
    ///
    /// Range is not checked: the positioning source is trusted on that.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite() && self.longitude.is_finite()
    }
}

/// One sample from the air-quality sensor. Every measurement is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct SensorReading {
    /// Unix epoch milliseconds
    pub captured_at_ms: i64,
    /// Timestamp exactly as the store rendered it
    pub created_at_label: String,
    pub pm1: Option<f64>,
    pub pm25: Option<f64>,
    pub pm10: Option<f64>,
    /// ppm
    pub co2: Option<f64>,
    pub temperature_c: Option<f64>,
    pub humidity_pct: Option<f64>,
}

impl SensorReading {
    /// A reading with no measurements; fill fields with struct update syntax.
    pub fn new(captured_at_ms: i64, created_at_label: impl Into<String>) -> Self {
        Self {
            captured_at_ms,
            created_at_label: created_at_label.into(),
            ..Self::default()
        }
    }

    /// True if at least one of the six measurements is a finite number.
    pub fn has_measurement(&self) -> bool {
        [self.pm1, self.pm25, self.pm10, self.co2, self.temperature_c, self.humidity_pct]
            .iter()
            .any(|v| v.is_some_and(f64::is_finite))
    }
}

/// Bounding box of a track.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct Bounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl Bounds {
    /// Midpoint of the box as (lat, lng).
    pub fn center(&self) -> (f64, f64) {
        (
            (self.min_lat + self.max_lat) / 2.0,
            (self.min_lng + self.max_lng) / 2.0,
        )
    }
}

// ============================================================================
// FFI Exports (only when feature enabled)
// ============================================================================

#[cfg(feature = "ffi")]
mod ffi {
    use super::*;
    use log::{debug, info};

    /// Reconcile raw store rows into merged records.
    #[uniffi::export]
    pub fn ffi_merge_feed_rows(rows: Vec<FeedRow>, config: MergeConfig) -> Vec<MergedRecord> {
        init_logging();
        info!("[AqTrackerRust] merge_feed_rows called with {} rows", rows.len());

        let start = std::time::Instant::now();
        let records = merge_feed_rows(&rows, &config);

        info!(
            "[AqTrackerRust] merged {} rows into {} records in {:?}",
            rows.len(),
            records.len(),
            start.elapsed()
        );
        records
    }

    /// Reconcile pre-split readings and fixes.
    #[uniffi::export]
    pub fn ffi_reconcile(
        readings: Vec<SensorReading>,
        fixes: Vec<LocationFix>,
        config: MergeConfig,
    ) -> Vec<MergedRecord> {
        init_logging();
        debug!(
            "[AqTrackerRust] reconcile: {} readings, {} fixes",
            readings.len(),
            fixes.len()
        );

        #[cfg(feature = "parallel")]
        let records = crate::reconcile::reconcile_parallel(&readings, &fixes, &config);

        #[cfg(not(feature = "parallel"))]
        let records = reconcile(&readings, &fixes, &config);

        records
    }

    #[uniffi::export]
    pub fn ffi_air_quality_index(pm25: f64, co2: Option<f64>) -> Option<i32> {
        air_quality_index(pm25, co2)
    }

    #[uniffi::export]
    pub fn ffi_haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
        haversine_km(lat1, lon1, lat2, lon2)
    }

    /// Get default merge configuration.
    #[uniffi::export]
    pub fn default_merge_config() -> MergeConfig {
        init_logging();
        MergeConfig::default()
    }

    /// Render merged records as CSV text for sharing.
    #[uniffi::export]
    pub fn ffi_export_csv(records: Vec<MergedRecord>) -> Option<String> {
        init_logging();
        match to_csv(&records) {
            Ok(csv) => Some(csv),
            Err(e) => {
                log::warn!("[AqTrackerRust] CSV export of {} records failed: {}", records.len(), e);
                None
            }
        }
    }

    /// Headline stats and map bounds for merged records.
    #[uniffi::export]
    pub fn ffi_merge_summary(records: Vec<MergedRecord>) -> MergeSummary {
        MergeSummary::from_records(&records)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_fix_validation() {
        assert!(LocationFix::new(53.3498, -6.2603, 0).is_valid());
        assert!(LocationFix::new(0.0, 0.0, 0).is_valid());
        assert!(LocationFix::new(91.0, 0.0, 0).is_valid());
        assert!(LocationFix::new(0.0, 181.0, 0).is_valid());
        assert!(!LocationFix::new(f64::NAN, 0.0, 0).is_valid());
        assert!(!LocationFix::new(0.0, f64::INFINITY, 0).is_valid());
    }

    #[test]
    fn test_sensor_reading_needs_one_finite_measurement() {
        assert!(!SensorReading::new(0, "t").has_measurement());
        assert!(!SensorReading { pm25: Some(f64::NAN), ..SensorReading::new(0, "t") }.has_measurement());
        assert!(SensorReading { humidity_pct: Some(0.0), ..SensorReading::new(0, "t") }.has_measurement());
    }

    #[test]
    fn test_bounds_center() {
        let b = Bounds { min_lat: 53.0, max_lat: 54.0, min_lng: -7.0, max_lng: -6.0 };
        assert_eq!(b.center(), (53.5, -6.5));
    }

    #[test]
    fn test_location_fix_deserializes_without_accuracy() {
        let fix: LocationFix =
            serde_json::from_str(r#"{"latitude": 53.1, "longitude": -6.2, "captured_at_ms": 5}"#).unwrap();
        assert_eq!(fix, LocationFix::new(53.1, -6.2, 5));
    }

    #[test]
    fn test_feed_rows_to_csv() {
        let rows: Vec<FeedRow> = serde_json::from_str(
            r#"[
                {"created_at": "2024-05-01T12:00:00Z", "entry_id": 1, "field7": "53.3498", "field8": "-6.2603"},
                {"created_at": "2024-05-01T12:00:10Z", "entry_id": 2, "field2": "8.0", "field4": "600"}
            ]"#,
        )
        .unwrap();

        let merged = merge_feed_rows(&rows, &MergeConfig::default());
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].match_delta_secs, 10);

        let csv = to_csv(&merged).unwrap();
        assert_eq!(csv.lines().count(), 2);
        assert!(csv.lines().last().unwrap().ends_with(",8.0,,600.0,,,53.3498,-6.2603,10,,,0.0,33"));
    }
}
