//! Fetch a channel's history from the store and reconcile it.
//!
//! Run with:
//!   THINGSPEAK_CHANNEL=2345678 cargo run --example fetch_and_merge --features http
//!
//! Set THINGSPEAK_LOCATION_CHANNEL as well when coordinates live on a second channel,
//! and THINGSPEAK_READ_KEY for private channels.

use std::time::Instant;

use aq_tracker::{
    fetch_and_merge, to_csv, FeedSource, MergeConfig, MergeSummary, ThingSpeakClient,
    ThingSpeakConfig,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let channel = std::env::var("THINGSPEAK_CHANNEL")?;
    let source = match std::env::var("THINGSPEAK_LOCATION_CHANNEL") {
        Ok(location_channel) => FeedSource::Split {
            sensor_channel: channel.clone(),
            location_channel,
        },
        Err(_) => FeedSource::Channel(channel.clone()),
    };

    let config = ThingSpeakConfig {
        channel_id: channel,
        read_key: std::env::var("THINGSPEAK_READ_KEY").ok(),
        ..ThingSpeakConfig::default()
    };
    println!("Fetch and Merge");
    println!("===============");
    println!("Source: {:?}", source);
    println!("Results: {} ({})\n", config.results, config.timezone);

    let client = ThingSpeakClient::new(config)?;
    let start = Instant::now();
    let merged = fetch_and_merge(&client, &source, &MergeConfig::default()).await?;
    let elapsed = start.elapsed();

    println!("{}", to_csv(&merged)?);

    let summary = MergeSummary::from_records(&merged);
    println!(
        "{} records, {:.3} km, peak AQI {:?} in {:.2}s",
        summary.record_count,
        summary.total_km,
        summary.peak_aqi,
        elapsed.as_secs_f64()
    );

    Ok(())
}
