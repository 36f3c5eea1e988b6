//! Simulated live session: a walk streamed through the uploader into a console sink.
//!
//! Run with: RUST_LOG=info cargo run --example live_session

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use aq_tracker::live::{IngestionSink, SensorSource, StatusCallback, UploadStatus};
use aq_tracker::{live_channel, CompositeRecord, LiveUploader, LocationFix, SensorReading, UploadConfig};

/// Prints each record's form fields instead of posting them.
struct ConsoleSink {
    next_id: AtomicU64,
}

impl IngestionSink for ConsoleSink {
    async fn publish(&self, record: &CompositeRecord) -> aq_tracker::Result<u64> {
        tokio::time::sleep(Duration::from_millis(120)).await;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let fields: Vec<String> = record
            .field_values()
            .into_iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect();
        println!("  -> entry {}: {}", id, fields.join("&"));
        Ok(id)
    }
}

/// Sensor whose PM2.5 climbs as the walk heads into traffic.
struct RampSensor {
    reads: AtomicU64,
}

impl SensorSource for RampSensor {
    async fn read(&self) -> aq_tracker::Result<Option<SensorReading>> {
        let n = self.reads.fetch_add(1, Ordering::SeqCst) as f64;
        let now = chrono::Utc::now();
        Ok(Some(SensorReading {
            pm25: Some(6.0 + n * 9.5),
            co2: Some(480.0 + n * 260.0),
            temperature_c: Some(14.0),
            ..SensorReading::new(now.timestamp_millis(), now.to_rfc3339())
        }))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = UploadConfig {
        period_ms: 2_000,
        movement_threshold_meters: 5.0,
        ..UploadConfig::default()
    };
    println!("Live Session");
    println!("============");
    println!("Period: {}ms, movement threshold: {}m\n", config.period_ms, config.movement_threshold_meters);

    let on_status: StatusCallback = Arc::new(|status: &UploadStatus| println!("{}", status));
    let uploader = LiveUploader::new(config, ConsoleSink { next_id: AtomicU64::new(1) })?
        .with_sensor(RampSensor { reads: AtomicU64::new(0) })
        .with_status_callback(on_status);

    let (handle, inputs) = live_channel(16);
    let session = tokio::spawn(uploader.run(inputs));

    // ~11 m steps north every 500ms, with one positioning timeout and a manual send
    for step in 0..16 {
        let now = chrono::Utc::now().timestamp_millis();
        if step == 7 {
            handle.push_position_error("position timeout").await;
        } else {
            let fix = LocationFix::new(53.3472 + step as f64 * 0.0001, -6.2592, now).with_accuracy(6.0);
            handle.push_fix(fix).await;
        }
        if step == 10 {
            handle.manual().await;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    handle.stop();
    let stats = session.await?;

    println!("\nSession stats");
    println!("  fixes:     {}", stats.fixes);
    println!("  attempts:  {}", stats.attempts);
    println!("  uploaded:  {}", stats.uploaded);
    println!("  skipped:   {}", stats.skipped);
    println!("  abandoned: {}", stats.abandoned);

    Ok(())
}
