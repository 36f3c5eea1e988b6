//! Offline reconciliation of a captured channel feed.
//!
//! Run with: cargo run --example merge_feed
//! Or pass a saved feeds.json: cargo run --example merge_feed -- feeds.json

use aq_tracker::feed::ChannelFeed;
use aq_tracker::{merge_feed_rows, to_csv, MergeConfig, MergeSummary};

// A short walk north along O'Connell St: location rows and sensor rows interleaved
const SAMPLE_FEED: &str = r#"{
  "channel": {"id": 2345678, "name": "aq-walk", "last_entry_id": 8},
  "feeds": [
    {"created_at": "2024-05-01T12:00:00+01:00", "entry_id": 1, "field7": "53.3472", "field8": "-6.2592"},
    {"created_at": "2024-05-01T12:00:04+01:00", "entry_id": 2, "field1": "3", "field2": "6.1", "field3": "9", "field4": "540", "field5": "14.2", "field6": "71"},
    {"created_at": "2024-05-01T12:01:20+01:00", "entry_id": 3, "field7": "53.3498", "field8": "-6.2603"},
    {"created_at": "2024-05-01T12:01:26+01:00", "entry_id": 4, "field1": "5", "field2": "18.4", "field3": "24", "field4": "1130", "field5": "14.4", "field6": "70"},
    {"created_at": "2024-05-01T12:02:40+01:00", "entry_id": 5, "field7": "53.3521", "field8": "-6.2611"},
    {"created_at": "2024-05-01T12:02:41+01:00", "entry_id": 6, "field2": "41.0", "field4": "2210"},
    {"created_at": "2024-05-01T12:09:00+01:00", "entry_id": 7, "field2": "7.5"},
    {"created_at": "not a timestamp", "entry_id": 8, "field7": "53.36", "field8": "-6.26"}
  ]
}"#;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let text = match std::env::args().nth(1) {
        Some(path) => std::fs::read_to_string(path)?,
        None => SAMPLE_FEED.to_string(),
    };
    let feed: ChannelFeed = serde_json::from_str(&text)?;

    let config = MergeConfig::default();
    println!("Feed Reconciliation\n");
    println!("Rows: {}, window: {}s\n", feed.feeds.len(), config.window_secs);

    let merged = merge_feed_rows(&feed.feeds, &config);

    println!("{}", to_csv(&merged)?);

    let summary = MergeSummary::from_records(&merged);
    println!("Matched records: {}", summary.record_count);
    println!("Distance:        {:.3} km", summary.total_km);
    println!("Duration:        {} s", summary.duration_secs);
    if let Some(speed) = summary.peak_speed_kmh {
        println!("Peak speed:      {:.1} km/h", speed);
    }
    if let Some(aqi) = summary.peak_aqi {
        println!("Peak AQI:        {}", aqi);
    }
    if let (Some(lat), Some(lng)) = (summary.center_lat, summary.center_lng) {
        println!("Centre:          {:.5}, {:.5}", lat, lng);
    }

    Ok(())
}
