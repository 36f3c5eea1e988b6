//! Air Quality Index from PM2.5 concentration, with a CO2 penalty.
//!
//! Piecewise-linear interpolation over the EPA PM2.5 breakpoint table.

/// One row of the breakpoint table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Breakpoint {
    pub c_low: f64,
    pub c_high: f64,
    pub aqi_low: i32,
    pub aqi_high: i32,
}

/// PM2.5 breakpoints (µg/m³ → AQI), lowest band first.
pub const PM25_BREAKPOINTS: [Breakpoint; 6] = [
    Breakpoint { c_low: 0.0, c_high: 12.0, aqi_low: 0, aqi_high: 50 },
    Breakpoint { c_low: 12.1, c_high: 35.4, aqi_low: 51, aqi_high: 100 },
    Breakpoint { c_low: 35.5, c_high: 55.4, aqi_low: 101, aqi_high: 150 },
    Breakpoint { c_low: 55.5, c_high: 150.4, aqi_low: 151, aqi_high: 200 },
    Breakpoint { c_low: 150.5, c_high: 250.4, aqi_low: 201, aqi_high: 300 },
    Breakpoint { c_low: 250.5, c_high: 500.4, aqi_low: 301, aqi_high: 500 },
];

/// CO2 level (ppm) above which the first penalty applies.
pub const CO2_ELEVATED_PPM: f64 = 1000.0;
/// CO2 level (ppm) above which the second penalty applies on top of the first.
pub const CO2_HIGH_PPM: f64 = 2000.0;
pub const CO2_ELEVATED_PENALTY: i32 = 5;
pub const CO2_HIGH_PENALTY: i32 = 15;

/// Find the band a concentration belongs to.
///
/// Both bounds are inclusive. A value in the 0.1 µg/m³ gap between two rows
/// (e.g. 12.05) belongs to no band.
fn band_for(pm25: f64) -> Option<&'static Breakpoint> {
    PM25_BREAKPOINTS
        .iter()
        .find(|bp| bp.c_low <= pm25 && pm25 <= bp.c_high)
}

/// AQI for a PM2.5 concentration alone.
///
/// Returns `None` when the concentration is not a number, negative, above the
/// top of the table (500.4 µg/m³), or between two rows.
pub fn aqi_for_pm25(pm25: f64) -> Option<i32> {
    let bp = band_for(pm25)?;
    let slope = f64::from(bp.aqi_high - bp.aqi_low) / (bp.c_high - bp.c_low);
    let value = slope * (pm25 - bp.c_low) + f64::from(bp.aqi_low);
    Some(value.round() as i32)
}

/// AQI for a PM2.5 concentration with the CO2 penalty applied.
///
/// The penalty is additive: +5 above 1000 ppm and a further +15 above 2000 ppm.
/// It is only applied when the PM2.5 value itself falls in a band, so the result
/// can exceed 500 but a missing PM2.5 index never becomes a number.
///
/// # Example
///
/// ```rust
/// use aq_tracker::aqi::air_quality_index;
///
/// assert_eq!(air_quality_index(6.0, None), Some(25));
/// assert_eq!(air_quality_index(35.4, Some(1500.0)), Some(105));
/// assert_eq!(air_quality_index(35.4, Some(2500.0)), Some(120));
/// assert_eq!(air_quality_index(600.0, Some(0.0)), None);
/// ```
pub fn air_quality_index(pm25: f64, co2_ppm: Option<f64>) -> Option<i32> {
    let mut aqi = aqi_for_pm25(pm25)?;
    if let Some(co2) = co2_ppm {
        if co2 > CO2_ELEVATED_PPM {
            aqi += CO2_ELEVATED_PENALTY;
        }
        if co2 > CO2_HIGH_PPM {
            aqi += CO2_HIGH_PENALTY;
        }
    }
    Some(aqi)
}
