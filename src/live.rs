//! # Live Uploader
//!
//! Turns a stream of position events into rate-limited uploads.
//!
//! Three producers feed one dispatch loop: the positioning source (fix and
//! error events), the caller (manual triggers) and an internal periodic timer.
//! The loop owns the [`UploadGate`], so every gate check and update happens on a
//! single task; the gate's in-flight flag covers callers that drive the handlers
//! directly.
//!
//! ## Example
//!
//! ```rust,no_run
//! use aq_tracker::live::{live_channel, LiveUploader};
//! use aq_tracker::{LocationFix, UploadConfig};
//! # use aq_tracker::live::IngestionSink;
//! # async fn demo<K: IngestionSink>(sink: K) -> aq_tracker::Result<()> {
//! let uploader = LiveUploader::new(UploadConfig::default(), sink)?;
//! let (handle, inputs) = live_channel(32);
//!
//! handle.push_fix(LocationFix::new(53.3498, -6.2603, 0)).await;
//! handle.stop();
//! let stats = uploader.run(inputs).await;
//! println!("uploaded {} records", stats.uploaded);
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::{RelayError, Result};
use crate::feed::CompositeRecord;
use crate::gate::{Attempt, Clock, FixDisposition, GateDecision, SkipReason, SystemClock, Trigger, UploadGate};
use crate::{LocationFix, SensorReading, UploadConfig};

// ============================================================================
// Collaborators
// ============================================================================

/// Where composite records are sent.
pub trait IngestionSink: Send + Sync {
    /// Send one record. `Ok` carries the positive entry id assigned by the sink;
    /// a refusal must surface as [`RelayError::Rejected`].
    fn publish(&self, record: &CompositeRecord) -> impl Future<Output = Result<u64>> + Send;
}

/// On-demand ambient sensor reading.
pub trait SensorSource: Send + Sync {
    /// `Ok(None)` means "no sensor attached"; errors degrade the upload to
    /// location only.
    fn read(&self) -> impl Future<Output = Result<Option<SensorReading>>> + Send;
}

/// Sensor source for location-only sessions.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSensor;

impl SensorSource for NoSensor {
    async fn read(&self) -> Result<Option<SensorReading>> {
        Ok(None)
    }
}

/// Events from the positioning subscription and the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveEvent {
    Fix(LocationFix),
    /// Timeout/denial from the positioning source; treated as "no new fix"
    PositionError(String),
    Manual,
}

// ============================================================================
// Status reporting
// ============================================================================

/// Outcome of one trigger, for display and logging.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadStatus {
    Uploaded {
        trigger: Trigger,
        entry_id: u64,
        latitude: f64,
        longitude: f64,
        with_sensor: bool,
    },
    Rejected { trigger: Trigger },
    Failed { trigger: Trigger, error: RelayError },
    Skipped { trigger: Trigger, reason: SkipReason },
}

impl UploadStatus {
    pub fn is_uploaded(&self) -> bool {
        matches!(self, UploadStatus::Uploaded { .. })
    }

    /// Whether an attempt actually went out to the sink.
    pub fn attempted(&self) -> bool {
        !matches!(self, UploadStatus::Skipped { .. })
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadStatus::Uploaded { latitude, longitude, with_sensor, .. } => {
                let what = if *with_sensor { "GPS+sensor" } else { "GPS" };
                write!(f, "{} uploaded: {:.6}, {:.6}", what, latitude, longitude)
            }
            UploadStatus::Rejected { .. } => write!(f, "Upload rejected by sink"),
            UploadStatus::Failed { error, .. } => write!(f, "Upload error: {}", error),
            UploadStatus::Skipped { trigger, reason } => write!(f, "Skipped {} trigger: {}", trigger, reason),
        }
    }
}

/// Status callback type
pub type StatusCallback = Arc<dyn Fn(&UploadStatus) + Send + Sync>;

/// Counters for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub fixes: u32,
    pub position_errors: u32,
    pub attempts: u32,
    pub uploaded: u32,
    pub rejected: u32,
    pub failed: u32,
    pub skipped: u32,
    pub sensor_failures: u32,
    /// Attempts dropped because the session stopped mid-flight
    pub abandoned: u32,
}

// ============================================================================
// Uploader
// ============================================================================

pub struct LiveUploader<K, S = NoSensor, C = SystemClock> {
    gate: UploadGate,
    sink: K,
    sensor: S,
    clock: C,
    stats: SessionStats,
    on_status: Option<StatusCallback>,
}

impl<K: IngestionSink> LiveUploader<K, NoSensor, SystemClock> {
    /// Location-only uploader on the wall clock.
    pub fn new(config: UploadConfig, sink: K) -> Result<Self> {
        Ok(Self {
            gate: UploadGate::new(config)?,
            sink,
            sensor: NoSensor,
            clock: SystemClock,
            stats: SessionStats::default(),
            on_status: None,
        })
    }
}

impl<K: IngestionSink, S: SensorSource, C: Clock> LiveUploader<K, S, C> {
    pub fn with_sensor<S2: SensorSource>(self, sensor: S2) -> LiveUploader<K, S2, C> {
        LiveUploader {
            gate: self.gate,
            sink: self.sink,
            sensor,
            clock: self.clock,
            stats: self.stats,
            on_status: self.on_status,
        }
    }

    pub fn with_clock<C2: Clock>(self, clock: C2) -> LiveUploader<K, S, C2> {
        LiveUploader {
            gate: self.gate,
            sink: self.sink,
            sensor: self.sensor,
            clock,
            stats: self.stats,
            on_status: self.on_status,
        }
    }

    pub fn with_status_callback(mut self, callback: StatusCallback) -> Self {
        self.on_status = Some(callback);
        self
    }

    pub fn gate(&self) -> &UploadGate {
        &self.gate
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Feed a fix. Returns a status only if the fix moved far enough to trigger
    /// an evaluation.
    pub async fn handle_fix(&mut self, fix: LocationFix) -> Option<UploadStatus> {
        match self.gate.observe_fix(fix) {
            FixDisposition::Invalid => {
                debug!("[LiveUploader] ignoring invalid fix {:?}", fix);
                None
            }
            FixDisposition::BelowThreshold => {
                self.stats.fixes += 1;
                None
            }
            FixDisposition::Accepted => {
                self.stats.fixes += 1;
                Some(self.attempt(Trigger::Movement).await)
            }
        }
    }

    pub fn handle_position_error(&mut self, message: &str) {
        self.stats.position_errors += 1;
        warn!("[LiveUploader] position error: {} (no new fix)", message);
    }

    pub async fn handle_timer(&mut self) -> UploadStatus {
        self.attempt(Trigger::Timer).await
    }

    pub async fn handle_manual(&mut self) -> UploadStatus {
        self.attempt(Trigger::Manual).await
    }

    async fn attempt(&mut self, trigger: Trigger) -> UploadStatus {
        match self.begin(trigger) {
            Ok(attempt) => self.execute(&attempt).await,
            Err(skipped) => skipped,
        }
    }

    fn begin(&mut self, trigger: Trigger) -> std::result::Result<Attempt, UploadStatus> {
        match self.gate.evaluate(trigger, self.clock.now_ms()) {
            GateDecision::Proceed(attempt) => {
                self.stats.attempts += 1;
                Ok(attempt)
            }
            GateDecision::Skip(reason) => {
                self.stats.skipped += 1;
                let status = UploadStatus::Skipped { trigger, reason };
                self.report(&status);
                Err(status)
            }
        }
    }

    async fn execute(&mut self, attempt: &Attempt) -> UploadStatus {
        let reading = match self.sensor.read().await {
            Ok(reading) => reading.filter(SensorReading::has_measurement),
            Err(e) => {
                self.stats.sensor_failures += 1;
                warn!("[LiveUploader] sensor read failed, sending location only: {}", e);
                None
            }
        };
        let with_sensor = reading.is_some();
        let record = CompositeRecord { fix: attempt.fix, reading };

        // Entry id 0 is the sink's rejection sentinel
        let result = match self.sink.publish(&record).await {
            Ok(0) => Err(RelayError::Rejected),
            other => other,
        };
        self.gate.complete(attempt, result.is_ok());

        let trigger = attempt.trigger;
        let status = match result {
            Ok(entry_id) => {
                self.stats.uploaded += 1;
                info!(
                    "[LiveUploader] {} upload #{} ok (entry {}): {:.6}, {:.6}",
                    trigger, self.stats.uploaded, entry_id, record.fix.latitude, record.fix.longitude
                );
                UploadStatus::Uploaded {
                    trigger,
                    entry_id,
                    latitude: record.fix.latitude,
                    longitude: record.fix.longitude,
                    with_sensor,
                }
            }
            Err(RelayError::Rejected) => {
                self.stats.rejected += 1;
                warn!("[LiveUploader] {} upload rejected by sink", trigger);
                UploadStatus::Rejected { trigger }
            }
            Err(error) => {
                self.stats.failed += 1;
                warn!("[LiveUploader] {} upload failed: {}", trigger, error);
                UploadStatus::Failed { trigger, error }
            }
        };
        self.report(&status);
        status
    }

    fn report(&self, status: &UploadStatus) {
        if let Some(ref cb) = self.on_status {
            cb(status);
        }
    }

    /// Run an attempt unless the session stops first; `None` when stopped.
    async fn attempt_or_stop(
        &mut self,
        trigger: Trigger,
        stop: &mut watch::Receiver<bool>,
    ) -> Option<UploadStatus> {
        let attempt = match self.begin(trigger) {
            Ok(attempt) => attempt,
            Err(skipped) => return Some(skipped),
        };

        let outcome = tokio::select! {
            biased;
            Ok(()) = stop.changed() => None,
            status = self.execute(&attempt) => Some(status),
        };
        if outcome.is_none() {
            // Whatever the sink eventually says, it no longer affects the session
            self.gate.abandon();
            self.stats.abandoned += 1;
            info!("[LiveUploader] stopped with {} attempt in flight, result discarded", trigger);
        }
        outcome
    }

    /// Dispatch loop. Returns when stopped or when every event sender is gone.
    pub async fn run(mut self, inputs: LiveInputs) -> SessionStats {
        let LiveInputs { mut events, mut stop } = inputs;
        let period = Duration::from_millis(self.gate.config().period_ms.max(1) as u64);
        let mut timer = tokio::time::interval_at(Instant::now() + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let timer_enabled = self.gate.config().timer_backstop;

        info!(
            "[LiveUploader] started (period {:?}, timer backstop {})",
            period, timer_enabled
        );

        loop {
            let stopped = tokio::select! {
                biased;
                Ok(()) = stop.changed() => true,
                event = events.recv() => match event {
                    None => true,
                    Some(LiveEvent::Fix(fix)) => match self.gate.observe_fix(fix) {
                        FixDisposition::Accepted => {
                            self.stats.fixes += 1;
                            self.attempt_or_stop(Trigger::Movement, &mut stop).await.is_none()
                        }
                        FixDisposition::BelowThreshold => {
                            self.stats.fixes += 1;
                            false
                        }
                        FixDisposition::Invalid => false,
                    },
                    Some(LiveEvent::PositionError(message)) => {
                        self.handle_position_error(&message);
                        false
                    }
                    Some(LiveEvent::Manual) => {
                        self.attempt_or_stop(Trigger::Manual, &mut stop).await.is_none()
                    }
                },
                _ = timer.tick(), if timer_enabled => {
                    self.attempt_or_stop(Trigger::Timer, &mut stop).await.is_none()
                }
            };
            if stopped {
                break;
            }
        }

        info!("[LiveUploader] stopped: {:?}", self.stats);
        self.stats
    }
}

// ============================================================================
// Channels
// ============================================================================

/// Caller side of a live session.
#[derive(Debug, Clone)]
pub struct UploaderHandle {
    events: mpsc::Sender<LiveEvent>,
    stop: Arc<watch::Sender<bool>>,
}

/// Loop side of a live session.
#[derive(Debug)]
pub struct LiveInputs {
    events: mpsc::Receiver<LiveEvent>,
    stop: watch::Receiver<bool>,
}

/// Create the event queue and stop signal for one session.
pub fn live_channel(buffer: usize) -> (UploaderHandle, LiveInputs) {
    let (event_tx, event_rx) = mpsc::channel(buffer.max(1));
    let (stop_tx, stop_rx) = watch::channel(false);
    (
        UploaderHandle { events: event_tx, stop: Arc::new(stop_tx) },
        LiveInputs { events: event_rx, stop: stop_rx },
    )
}

impl UploaderHandle {
    /// Queue a fix. Returns false once the session has ended.
    pub async fn push_fix(&self, fix: LocationFix) -> bool {
        self.events.send(LiveEvent::Fix(fix)).await.is_ok()
    }

    pub async fn push_position_error(&self, message: impl Into<String>) -> bool {
        self.events.send(LiveEvent::PositionError(message.into())).await.is_ok()
    }

    pub async fn manual(&self) -> bool {
        self.events.send(LiveEvent::Manual).await.is_ok()
    }

    /// Stop the session: the loop exits and any in-flight attempt is dropped.
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }
}
