//! Channel field layout and feed-row coercion.
//!
//! Every record travels through an ingestion channel with eight field slots:
//!
//! | Slot | Meaning |
//! |------|---------|
//! | `field1` | PM1.0 (µg/m³) |
//! | `field2` | PM2.5 (µg/m³) |
//! | `field3` | PM10 (µg/m³) |
//! | `field4` | CO2 (ppm) |
//! | `field5` | Temperature (°C) |
//! | `field6` | Relative humidity (%) |
//! | `field7` | Latitude |
//! | `field8` | Longitude |
//!
//! Stored rows come back as loosely typed JSON: slots may be strings, numbers or
//! null, and a single row can carry sensor fields, coordinates, both, or neither.
//! [`FeedRow::sensor_reading`] and [`FeedRow::location_fix`] classify a row for
//! each role independently.

use chrono::DateTime;
use serde::{Deserialize, Deserializer, Serialize};

use crate::{LocationFix, SensorReading};

pub const FIELD_PM1: &str = "field1";
pub const FIELD_PM25: &str = "field2";
pub const FIELD_PM10: &str = "field3";
pub const FIELD_CO2: &str = "field4";
pub const FIELD_TEMPERATURE: &str = "field5";
pub const FIELD_HUMIDITY: &str = "field6";
pub const FIELD_LATITUDE: &str = "field7";
pub const FIELD_LONGITUDE: &str = "field8";

/// One raw row from a channel feed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct FeedRow {
    /// RFC 3339 timestamp as returned by the store
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub entry_id: Option<u64>,
    #[serde(default, deserialize_with = "lenient_slot")]
    pub field1: Option<String>,
    #[serde(default, deserialize_with = "lenient_slot")]
    pub field2: Option<String>,
    #[serde(default, deserialize_with = "lenient_slot")]
    pub field3: Option<String>,
    #[serde(default, deserialize_with = "lenient_slot")]
    pub field4: Option<String>,
    #[serde(default, deserialize_with = "lenient_slot")]
    pub field5: Option<String>,
    #[serde(default, deserialize_with = "lenient_slot")]
    pub field6: Option<String>,
    #[serde(default, deserialize_with = "lenient_slot")]
    pub field7: Option<String>,
    #[serde(default, deserialize_with = "lenient_slot")]
    pub field8: Option<String>,
}

/// Envelope of a channel feed response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelFeed {
    #[serde(default)]
    pub channel: Option<ChannelInfo>,
    #[serde(default)]
    pub feeds: Vec<FeedRow>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelInfo {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub last_entry_id: Option<u64>,
}

// Slots arrive as strings, bare numbers or null; keep the text either way.
fn lenient_slot<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<serde_json::Value> = Option::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Parse the leading decimal literal of a slot value.
///
/// Leading whitespace is skipped and trailing garbage ignored, so `"12.5 ug"`
/// reads as 12.5. Empty, non-numeric and non-finite values give `None`.
///
/// ```rust
/// use aq_tracker::feed::parse_numeric;
///
/// assert_eq!(parse_numeric(" 12.5ug"), Some(12.5));
/// assert_eq!(parse_numeric("-6.26"), Some(-6.26));
/// assert_eq!(parse_numeric("abc"), None);
/// ```
pub fn parse_numeric(raw: &str) -> Option<f64> {
    let s = raw.trim_start();
    let bytes = s.as_bytes();
    let mut end = 0;

    if end < bytes.len() && (bytes[end] == b'+' || bytes[end] == b'-') {
        end += 1;
    }
    let int_start = end;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    let mut digits = end - int_start;
    if end < bytes.len() && bytes[end] == b'.' {
        let frac_start = end + 1;
        let mut frac_end = frac_start;
        while frac_end < bytes.len() && bytes[frac_end].is_ascii_digit() {
            frac_end += 1;
        }
        digits += frac_end - frac_start;
        if digits > 0 {
            end = frac_end;
        }
    }
    if digits == 0 {
        return None;
    }
    // Exponent only counts when at least one digit follows it
    if end < bytes.len() && (bytes[end] == b'e' || bytes[end] == b'E') {
        let mut exp_end = end + 1;
        if exp_end < bytes.len() && (bytes[exp_end] == b'+' || bytes[exp_end] == b'-') {
            exp_end += 1;
        }
        let exp_digits_start = exp_end;
        while exp_end < bytes.len() && bytes[exp_end].is_ascii_digit() {
            exp_end += 1;
        }
        if exp_end > exp_digits_start {
            end = exp_end;
        }
    }

    s[..end].parse::<f64>().ok().filter(|v| v.is_finite())
}

fn slot_value(slot: &Option<String>) -> Option<f64> {
    slot.as_deref().and_then(parse_numeric)
}

/// Parse an RFC 3339 timestamp to epoch milliseconds.
pub fn parse_timestamp_ms(raw: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|dt| dt.timestamp_millis())
}

impl FeedRow {
    /// Epoch milliseconds of `created_at`, if it parses.
    pub fn captured_at_ms(&self) -> Option<i64> {
        parse_timestamp_ms(&self.created_at)
    }

    /// The sensor view of this row.
    ///
    /// `None` when the timestamp is unparseable or none of the six sensor slots
    /// holds a finite number.
    pub fn sensor_reading(&self) -> Option<SensorReading> {
        let captured_at_ms = self.captured_at_ms()?;
        let reading = SensorReading {
            captured_at_ms,
            created_at_label: self.created_at.clone(),
            pm1: slot_value(&self.field1),
            pm25: slot_value(&self.field2),
            pm10: slot_value(&self.field3),
            co2: slot_value(&self.field4),
            temperature_c: slot_value(&self.field5),
            humidity_pct: slot_value(&self.field6),
        };
        reading.has_measurement().then_some(reading)
    }

    /// The location view of this row.
    ///
    /// `None` when the timestamp is unparseable or either coordinate is missing
    /// or not finite.
    pub fn location_fix(&self) -> Option<LocationFix> {
        let captured_at_ms = self.captured_at_ms()?;
        let fix = LocationFix::new(
            slot_value(&self.field7)?,
            slot_value(&self.field8)?,
            captured_at_ms,
        );
        fix.is_valid().then_some(fix)
    }
}

/// Split rows into sensor readings and location fixes, each in feed order.
///
/// A row may contribute to both lists, one, or neither.
pub fn classify_rows(rows: &[FeedRow]) -> (Vec<SensorReading>, Vec<LocationFix>) {
    let readings = rows.iter().filter_map(FeedRow::sensor_reading).collect();
    let fixes = rows.iter().filter_map(FeedRow::location_fix).collect();
    (readings, fixes)
}

/// Outbound record: the current fix plus whatever the sensor board reported.
#[derive(Debug, Clone, PartialEq)]
pub struct CompositeRecord {
    pub fix: LocationFix,
    pub reading: Option<SensorReading>,
}

impl CompositeRecord {
    pub fn location_only(fix: LocationFix) -> Self {
        Self { fix, reading: None }
    }

    pub fn with_reading(fix: LocationFix, reading: SensorReading) -> Self {
        Self { fix, reading: Some(reading) }
    }

    /// Slot/value pairs to send, omitting absent sensor values.
    pub fn field_values(&self) -> Vec<(&'static str, String)> {
        let mut fields = Vec::with_capacity(8);
        if let Some(r) = &self.reading {
            let sensor_slots = [
                (FIELD_PM1, r.pm1),
                (FIELD_PM25, r.pm25),
                (FIELD_PM10, r.pm10),
                (FIELD_CO2, r.co2),
                (FIELD_TEMPERATURE, r.temperature_c),
                (FIELD_HUMIDITY, r.humidity_pct),
            ];
            for (slot, value) in sensor_slots {
                if let Some(v) = value.filter(|v| v.is_finite()) {
                    fields.push((slot, v.to_string()));
                }
            }
        }
        fields.push((FIELD_LATITUDE, self.fix.latitude.to_string()));
        fields.push((FIELD_LONGITUDE, self.fix.longitude.to_string()));
        fields
    }
}
