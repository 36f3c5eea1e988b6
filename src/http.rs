//! HTTP collaborators: the ThingSpeak-style ingestion store and the sensor board.
//!
//! This module provides:
//! - Channel feed reads with retry and backoff on 429
//! - Record uploads as form posts, with the store's `0` reply mapped to a rejection
//! - Concurrent fetch of split sensor/location channels before reconciliation
//! - A sensor source backed by the board's JSON endpoint
//!
//! Uploads are never retried here; the live gate's next trigger is the retry.

use std::time::{Duration, Instant};

use log::{debug, info, warn};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};
use crate::feed::{ChannelFeed, CompositeRecord, FeedRow};
use crate::live::{IngestionSink, SensorSource};
use crate::reconcile::{merge_feed_rows, merge_split_feeds, MergeConfig, MergedRecord};
use crate::SensorReading;

const MAX_RETRIES: u32 = 3;
const SENSOR_TIMEOUT_SECS: u64 = 5;

/// Connection settings for the ingestion store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThingSpeakConfig {
    /// Default: https://api.thingspeak.com
    pub base_url: String,
    pub channel_id: String,
    /// Needed for private channels only
    pub read_key: Option<String>,
    /// Needed for uploads
    pub write_key: Option<String>,
    /// Number of most recent rows to read. Default: 200
    pub results: u32,
    /// Time zone the store renders `created_at` in. Default: Europe/Dublin
    pub timezone: String,
    /// Default: 30
    pub timeout_secs: u64,
}

impl Default for ThingSpeakConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.thingspeak.com".to_string(),
            channel_id: String::new(),
            read_key: None,
            write_key: None,
            results: 200,
            timezone: "Europe/Dublin".to_string(),
            timeout_secs: 30,
        }
    }
}

/// Which channels hold the history to reconcile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedSource {
    /// Sensor and location rows interleaved on one channel
    Channel(String),
    /// Sensor rows and location rows on separate channels
    Split { sensor_channel: String, location_channel: String },
}

/// Interpret the body of an update reply.
///
/// The store answers with the new entry as JSON, or a bare `0` when it refuses
/// the write (bad key, rate limit).
pub fn parse_update_reply(body: &str) -> Result<u64> {
    let body = body.trim();
    if let Ok(id) = body.parse::<i64>() {
        return if id > 0 { Ok(id as u64) } else { Err(RelayError::Rejected) };
    }

    #[derive(Deserialize)]
    struct EntryReply {
        entry_id: Option<i64>,
    }

    let reply: EntryReply = serde_json::from_str(body)
        .map_err(|e| RelayError::Decode(format!("update reply: {}", e)))?;
    match reply.entry_id {
        Some(id) if id > 0 => Ok(id as u64),
        _ => Err(RelayError::Rejected),
    }
}

/// Client for channel reads and writes.
pub struct ThingSpeakClient {
    client: Client,
    config: ThingSpeakConfig,
}

impl ThingSpeakClient {
    pub fn new(config: ThingSpeakConfig) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .tcp_keepalive(Duration::from_secs(30))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RelayError::InvalidConfig(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &ThingSpeakConfig {
        &self.config
    }

    /// Read the most recent rows of a channel, oldest first.
    pub async fn read_channel_feeds(
        &self,
        channel_id: &str,
        read_key: Option<&str>,
        results: u32,
        timezone: &str,
    ) -> Result<Vec<FeedRow>> {
        let url = format!(
            "{}/channels/{}/feeds.json",
            self.config.base_url.trim_end_matches('/'),
            channel_id
        );
        let mut query: Vec<(&str, String)> = vec![
            ("results", results.to_string()),
            ("timezone", timezone.to_string()),
        ];
        if let Some(key) = read_key.filter(|k| !k.is_empty()) {
            query.push(("api_key", key.to_string()));
        }

        let mut retries = 0;
        let req_start = Instant::now();

        loop {
            let response = self.client.get(&url).query(&query).send().await;

            match response {
                Ok(resp) => {
                    let status = resp.status();

                    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                        retries += 1;
                        if retries > MAX_RETRIES {
                            return Err(RelayError::Http { status: status.as_u16() });
                        }
                        // Exponential backoff: 1s, 2s, 4s
                        let wait = Duration::from_millis(500 * (1 << retries.min(3)));
                        warn!(
                            "[ThingSpeak] 429 reading channel {}, retry {} after {:?}",
                            channel_id, retries, wait
                        );
                        tokio::time::sleep(wait).await;
                        continue;
                    }

                    if !status.is_success() {
                        return Err(RelayError::Http { status: status.as_u16() });
                    }

                    let bytes = resp
                        .bytes()
                        .await
                        .map_err(|e| RelayError::Transport(format!("Body download error: {}", e)))?;
                    let feed: ChannelFeed = serde_json::from_slice(&bytes)
                        .map_err(|e| RelayError::Decode(format!("feed JSON: {}", e)))?;

                    info!(
                        "[ThingSpeak] channel {}: {} rows ({:.1}KB) in {:?}",
                        channel_id,
                        feed.feeds.len(),
                        bytes.len() as f64 / 1024.0,
                        req_start.elapsed()
                    );
                    return Ok(feed.feeds);
                }
                Err(e) => {
                    retries += 1;
                    if retries > MAX_RETRIES {
                        return Err(RelayError::Transport(format!("Request error: {}", e)));
                    }

                    let wait = Duration::from_millis(200 * (1 << retries));
                    warn!(
                        "[ThingSpeak] read error on channel {}: {}, retry {} after {:?}",
                        channel_id, e, retries, wait
                    );
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    async fn post_update(&self, record: &CompositeRecord) -> Result<u64> {
        let write_key = self
            .config
            .write_key
            .as_deref()
            .ok_or_else(|| RelayError::InvalidConfig("write_key is required to upload".to_string()))?;

        let url = format!("{}/update.json", self.config.base_url.trim_end_matches('/'));
        let mut form: Vec<(&str, String)> = vec![("api_key", write_key.to_string())];
        form.extend(record.field_values());

        let resp = self
            .client
            .post(&url)
            .form(&form)
            .send()
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(RelayError::Http { status: status.as_u16() });
        }
        let body = resp
            .text()
            .await
            .map_err(|e| RelayError::Transport(format!("Body download error: {}", e)))?;

        debug!("[ThingSpeak] update reply: {}", body);
        parse_update_reply(&body)
    }
}

impl IngestionSink for ThingSpeakClient {
    async fn publish(&self, record: &CompositeRecord) -> Result<u64> {
        self.post_update(record).await
    }
}

/// Fetch history from the store and reconcile it.
pub async fn fetch_and_merge(
    client: &ThingSpeakClient,
    source: &FeedSource,
    merge: &MergeConfig,
) -> Result<Vec<MergedRecord>> {
    let config = client.config();
    let read_key = config.read_key.as_deref();
    let start = Instant::now();

    let records = match source {
        FeedSource::Channel(channel) => {
            let rows = client
                .read_channel_feeds(channel, read_key, config.results, &config.timezone)
                .await?;
            merge_feed_rows(&rows, merge)
        }
        FeedSource::Split { sensor_channel, location_channel } => {
            let (sensor_rows, location_rows) = futures::future::try_join(
                client.read_channel_feeds(sensor_channel, read_key, config.results, &config.timezone),
                client.read_channel_feeds(location_channel, read_key, config.results, &config.timezone),
            )
            .await?;
            merge_split_feeds(&sensor_rows, &location_rows, merge)
        }
    };

    info!(
        "[ThingSpeak] merged {} records in {:.2}s",
        records.len(),
        start.elapsed().as_secs_f64()
    );
    Ok(records)
}

// ============================================================================
// Sensor board
// ============================================================================

/// JSON reading as served by the sensor board.
#[derive(Debug, Clone, Default, Deserialize)]
struct BoardReading {
    #[serde(default)]
    pm1: Option<f64>,
    #[serde(default, alias = "pm2_5", alias = "pm25_0")]
    pm25: Option<f64>,
    #[serde(default)]
    pm10: Option<f64>,
    #[serde(default)]
    co2: Option<f64>,
    #[serde(default, alias = "temperature")]
    temp: Option<f64>,
    #[serde(default, alias = "humidity", alias = "rh")]
    hum: Option<f64>,
}

impl BoardReading {
    fn into_reading(self, captured_at_ms: i64, label: String) -> SensorReading {
        SensorReading {
            captured_at_ms,
            created_at_label: label,
            pm1: self.pm1,
            pm25: self.pm25,
            pm10: self.pm10,
            co2: self.co2,
            temperature_c: self.temp,
            humidity_pct: self.hum,
        }
    }
}

/// Sensor source polling the board on the local network.
pub struct DeviceSensorClient {
    client: Client,
    url: String,
}

impl DeviceSensorClient {
    /// `url` is the full address of the board's reading endpoint.
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(SENSOR_TIMEOUT_SECS))
            .build()
            .map_err(|e| RelayError::InvalidConfig(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client, url: url.into() })
    }
}

/// Decode a board reply, stamping it with the time it was taken.
pub fn parse_board_reading(body: &[u8], captured_at_ms: i64, label: String) -> Result<SensorReading> {
    let board: BoardReading = serde_json::from_slice(body)
        .map_err(|e| RelayError::Decode(format!("sensor JSON: {}", e)))?;
    Ok(board.into_reading(captured_at_ms, label))
}

impl SensorSource for DeviceSensorClient {
    async fn read(&self) -> Result<Option<SensorReading>> {
        let resp = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| RelayError::SensorUnavailable(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(RelayError::SensorUnavailable(format!("HTTP {}", resp.status())));
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| RelayError::SensorUnavailable(e.to_string()))?;

        let now = chrono::Utc::now();
        let reading = parse_board_reading(&bytes, now.timestamp_millis(), now.to_rfc3339())?;
        Ok(Some(reading))
    }
}
