//! Display/export boundary for merged records.
//!
//! Reconciliation works at full precision; this is the only place values are
//! rounded: speed to 0.1 km/h, distances to metres (3 dp in km).

use serde::Serialize;

use crate::error::{RelayError, Result};
use crate::geo_utils::{compute_bounds, compute_center};
use crate::reconcile::MergedRecord;
use crate::{Bounds, LocationFix};

/// Column order of the CSV export.
pub const CSV_COLUMNS: [&str; 14] = [
    "created_at", "pm1", "pm25", "pm10", "co2", "temp", "hum",
    "lat", "lon", "dt_s", "speed_kmh", "seg_km", "total_km", "aqi",
];

/// Round half away from zero to `decimals` places.
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// A merged record as shown to a user. Field order matches [`CSV_COLUMNS`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportRow {
    pub created_at: String,
    pub pm1: Option<f64>,
    pub pm25: Option<f64>,
    pub pm10: Option<f64>,
    pub co2: Option<f64>,
    pub temp: Option<f64>,
    pub hum: Option<f64>,
    pub lat: f64,
    pub lon: f64,
    pub dt_s: i64,
    pub speed_kmh: Option<f64>,
    pub seg_km: Option<f64>,
    pub total_km: f64,
    pub aqi: Option<i32>,
}

impl From<&MergedRecord> for ExportRow {
    fn from(r: &MergedRecord) -> Self {
        Self {
            created_at: r.created_at_label.clone(),
            pm1: r.pm1,
            pm25: r.pm25,
            pm10: r.pm10,
            co2: r.co2,
            temp: r.temperature_c,
            hum: r.humidity_pct,
            lat: r.latitude,
            lon: r.longitude,
            dt_s: r.match_delta_secs,
            speed_kmh: r.instant_speed_kmh.map(|v| round_to(v, 1)),
            seg_km: r.segment_km.map(|v| round_to(v, 3)),
            total_km: round_to(r.cumulative_km, 3),
            aqi: r.aqi,
        }
    }
}

/// Rounded rows for a merged sequence.
pub fn export_rows(records: &[MergedRecord]) -> Vec<ExportRow> {
    records.iter().map(ExportRow::from).collect()
}

fn export_error(e: impl std::fmt::Display) -> RelayError {
    RelayError::Export(e.to_string())
}

/// Render merged records as CSV with a header line; absent values are empty cells.
///
/// ```rust
/// use aq_tracker::export::to_csv;
///
/// let csv = to_csv(&[]).unwrap();
/// assert!(csv.starts_with("created_at,pm1,pm25"));
/// ```
pub fn to_csv(records: &[MergedRecord]) -> Result<String> {
    // Header written by hand so an empty export still carries it
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());

    writer.write_record(CSV_COLUMNS).map_err(export_error)?;
    for row in export_rows(records) {
        writer.serialize(&row).map_err(export_error)?;
    }

    let bytes = writer.into_inner().map_err(export_error)?;
    String::from_utf8(bytes).map_err(export_error)
}

/// Aggregate view of a merged track, used to fit a map view and headline stats.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct MergeSummary {
    pub record_count: u32,
    /// Final cumulative distance (km, full precision)
    pub total_km: f64,
    pub peak_speed_kmh: Option<f64>,
    pub peak_aqi: Option<i32>,
    /// Elapsed time from first to last record
    pub duration_secs: i64,
    pub bounds: Option<Bounds>,
    pub center_lat: Option<f64>,
    pub center_lng: Option<f64>,
}

impl MergeSummary {
    pub fn from_records(records: &[MergedRecord]) -> Self {
        let track: Vec<LocationFix> = records
            .iter()
            .map(|r| LocationFix::new(r.latitude, r.longitude, r.captured_at_ms))
            .collect();
        let center = compute_center(&track);

        let duration_secs = match (records.first(), records.last()) {
            (Some(first), Some(last)) => (last.captured_at_ms - first.captured_at_ms) / 1000,
            _ => 0,
        };

        Self {
            record_count: records.len() as u32,
            total_km: records.last().map_or(0.0, |r| r.cumulative_km),
            peak_speed_kmh: records
                .iter()
                .filter_map(|r| r.instant_speed_kmh)
                .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.max(v)))),
            peak_aqi: records.iter().filter_map(|r| r.aqi).max(),
            duration_secs,
            bounds: compute_bounds(&track),
            center_lat: center.map(|c| c.0),
            center_lng: center.map(|c| c.1),
        }
    }
}
