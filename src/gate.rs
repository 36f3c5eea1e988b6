//! # Upload Gate
//!
//! Decides when a composite record may be sent, under a fixed-period budget.
//!
//! ```text
//!   Idle ──first valid fix──▶ Ready ──eligible trigger──▶ Sending
//!                               ▲                           │
//!                               └── failure / rejection ────┤
//!                                                           ▼
//!                      Sent ◀──────────── success ──────────┘
//! ```
//!
//! A trigger is eligible when it is [`Trigger::Manual`], or when the schedule
//! allows it: under [`Schedule::Periodic`] at least `period_ms` must have passed
//! since the last successful upload; under [`Schedule::Slotted`] the current
//! wall-clock slot must have the configured parity and not have been used yet.
//! Only a confirmed success moves the timer. While an attempt is in flight every
//! other trigger is skipped, so two triggers can never both pass the check.
//!
//! The gate holds no clock; callers pass `now_ms` so tests drive time directly.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};
use crate::geo_utils::fix_distance_meters;
use crate::LocationFix;

// ============================================================================
// Clock
// ============================================================================

/// Source of the current time in epoch milliseconds.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to. Used for replay and tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self { now: AtomicI64::new(start_ms) }
    }

    pub fn set(&self, ms: i64) {
        self.now.store(ms, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: i64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

impl<C: Clock + ?Sized> Clock for std::sync::Arc<C> {
    fn now_ms(&self) -> i64 {
        (**self).now_ms()
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// How automatic triggers are spaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Schedule {
    /// At most one upload per `period_ms` since the last success.
    Periodic,
    /// Wall-clock slots of `period_ms`; only slots with `slot % 2 == parity`
    /// are used, once each. Two producers sharing a channel take opposite parities.
    Slotted { parity: u8 },
}

/// Configuration for the live upload path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Minimum spacing between successful uploads (ms).
    /// Default: 80_000
    pub period_ms: i64,
    /// A fix must move farther than this from the last accepted fix to trigger
    /// an evaluation. 0 accepts every fix.
    /// Default: 0.0
    pub movement_threshold_meters: f64,
    /// Default: periodic
    pub schedule: Schedule,
    /// Fire timer triggers every `period_ms` as a backstop for sparse movement.
    /// Default: true
    pub timer_backstop: bool,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            period_ms: 80_000,
            movement_threshold_meters: 0.0,
            schedule: Schedule::Periodic,
            timer_backstop: true,
        }
    }
}

impl UploadConfig {
    pub fn validate(&self) -> Result<()> {
        if self.period_ms <= 0 {
            return Err(RelayError::InvalidConfig(format!(
                "period_ms must be positive, got {}",
                self.period_ms
            )));
        }
        if !self.movement_threshold_meters.is_finite() || self.movement_threshold_meters < 0.0 {
            return Err(RelayError::InvalidConfig(format!(
                "movement_threshold_meters must be >= 0, got {}",
                self.movement_threshold_meters
            )));
        }
        if let Schedule::Slotted { parity } = self.schedule {
            if parity > 1 {
                return Err(RelayError::InvalidConfig(format!(
                    "slot parity must be 0 or 1, got {}",
                    parity
                )));
            }
        }
        Ok(())
    }
}

// ============================================================================
// State machine
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    /// No valid fix yet
    Idle,
    /// Has a fix, waiting for an eligible trigger
    Ready,
    /// An attempt is in flight
    Sending,
    /// Last attempt succeeded; behaves like `Ready` for new triggers
    Sent,
}

/// Why an evaluation was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// A fix moved past the movement threshold
    Movement,
    /// Periodic backstop timer
    Timer,
    /// User/caller request; bypasses the schedule once
    Manual,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Movement => write!(f, "movement"),
            Trigger::Timer => write!(f, "timer"),
            Trigger::Manual => write!(f, "manual"),
        }
    }
}

/// Why a trigger did not produce an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoFix,
    InFlight,
    PeriodNotElapsed { remaining_ms: i64 },
    WrongSlotParity { slot: i64 },
    SlotAlreadyUsed { slot: i64 },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NoFix => write!(f, "no fix yet"),
            SkipReason::InFlight => write!(f, "upload already in flight"),
            SkipReason::PeriodNotElapsed { remaining_ms } => {
                write!(f, "next upload in {}s", (remaining_ms + 999) / 1000)
            }
            SkipReason::WrongSlotParity { slot } => write!(f, "slot {} belongs to the other producer", slot),
            SkipReason::SlotAlreadyUsed { slot } => write!(f, "slot {} already sent", slot),
        }
    }
}

/// Permission to send, carrying what to send and when it started.
#[derive(Debug, Clone, PartialEq)]
pub struct Attempt {
    pub trigger: Trigger,
    pub started_at_ms: i64,
    pub fix: LocationFix,
    slot: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    Proceed(Attempt),
    Skip(SkipReason),
}

/// What the gate did with an incoming fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixDisposition {
    /// Bad coordinates, ignored
    Invalid,
    /// Stored as latest position, but too close to the last accepted fix
    BelowThreshold,
    /// Moved far enough; an evaluation should follow
    Accepted,
}

/// Per-session upload state.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadState {
    pub last_known_fix: Option<LocationFix>,
    pub last_accepted_fix: Option<LocationFix>,
    pub last_upload_at_ms: Option<i64>,
    pub last_slot_sent: Option<i64>,
    pub in_flight: bool,
}

/// The rate/period gate. One per live session.
#[derive(Debug, Clone)]
pub struct UploadGate {
    config: UploadConfig,
    state: UploadState,
    phase: GateState,
}

impl UploadGate {
    pub fn new(config: UploadConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            state: UploadState {
                last_known_fix: None,
                last_accepted_fix: None,
                last_upload_at_ms: None,
                last_slot_sent: None,
                in_flight: false,
            },
            phase: GateState::Idle,
        })
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    pub fn state(&self) -> GateState {
        self.phase
    }

    pub fn upload_state(&self) -> &UploadState {
        &self.state
    }

    pub fn slot_of(&self, now_ms: i64) -> i64 {
        now_ms.div_euclid(self.config.period_ms)
    }

    /// Record a new fix and decide whether it warrants an evaluation.
    pub fn observe_fix(&mut self, fix: LocationFix) -> FixDisposition {
        if !fix.is_valid() {
            return FixDisposition::Invalid;
        }
        self.state.last_known_fix = Some(fix);
        if self.phase == GateState::Idle {
            self.phase = GateState::Ready;
        }

        let moved = match self.state.last_accepted_fix {
            None => true,
            Some(prev) => fix_distance_meters(&prev, &fix) > self.config.movement_threshold_meters,
        };
        // Zero threshold accepts every fix, even a stationary one
        if moved || self.config.movement_threshold_meters == 0.0 {
            self.state.last_accepted_fix = Some(fix);
            FixDisposition::Accepted
        } else {
            FixDisposition::BelowThreshold
        }
    }

    /// Check a trigger against the schedule; on success the gate enters `Sending`.
    pub fn evaluate(&mut self, trigger: Trigger, now_ms: i64) -> GateDecision {
        let decision = self.check(trigger, now_ms);
        match &decision {
            GateDecision::Proceed(attempt) => {
                self.state.in_flight = true;
                self.phase = GateState::Sending;
                debug!("[UploadGate] {} trigger at {} -> sending", attempt.trigger, now_ms);
            }
            GateDecision::Skip(reason) => {
                debug!("[UploadGate] {} trigger at {} skipped: {}", trigger, now_ms, reason);
            }
        }
        decision
    }

    fn check(&self, trigger: Trigger, now_ms: i64) -> GateDecision {
        let Some(fix) = self.state.last_known_fix else {
            return GateDecision::Skip(SkipReason::NoFix);
        };
        if self.state.in_flight {
            return GateDecision::Skip(SkipReason::InFlight);
        }

        let slot = self.slot_of(now_ms);
        if trigger != Trigger::Manual {
            match self.config.schedule {
                Schedule::Periodic => {
                    if let Some(last) = self.state.last_upload_at_ms {
                        let elapsed = now_ms - last;
                        if elapsed < self.config.period_ms {
                            return GateDecision::Skip(SkipReason::PeriodNotElapsed {
                                remaining_ms: self.config.period_ms - elapsed,
                            });
                        }
                    }
                }
                Schedule::Slotted { parity } => {
                    if self.state.last_slot_sent == Some(slot) {
                        return GateDecision::Skip(SkipReason::SlotAlreadyUsed { slot });
                    }
                    if slot.rem_euclid(2) != i64::from(parity) {
                        return GateDecision::Skip(SkipReason::WrongSlotParity { slot });
                    }
                }
            }
        }

        GateDecision::Proceed(Attempt { trigger, started_at_ms: now_ms, fix, slot })
    }

    /// Close an attempt. Only success moves the upload timer.
    pub fn complete(&mut self, attempt: &Attempt, succeeded: bool) {
        self.state.in_flight = false;
        if succeeded {
            self.state.last_upload_at_ms = Some(attempt.started_at_ms);
            self.state.last_slot_sent = Some(attempt.slot);
            self.phase = GateState::Sent;
        } else {
            self.phase = GateState::Ready;
        }
    }

    /// Drop an in-flight attempt without touching the timer (session stopped).
    pub fn abandon(&mut self) {
        if self.state.in_flight {
            self.state.in_flight = false;
            self.phase = if self.state.last_known_fix.is_some() {
                GateState::Ready
            } else {
                GateState::Idle
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: i64 = 1000;

    fn gate(period_ms: i64) -> UploadGate {
        UploadGate::new(UploadConfig { period_ms, ..UploadConfig::default() }).unwrap()
    }

    fn dublin(at_ms: i64) -> LocationFix {
        LocationFix::new(53.3498, -6.2603, at_ms)
    }

    fn send(gate: &mut UploadGate, trigger: Trigger, now_ms: i64, ok: bool) -> bool {
        match gate.evaluate(trigger, now_ms) {
            GateDecision::Proceed(attempt) => {
                gate.complete(&attempt, ok);
                true
            }
            GateDecision::Skip(_) => false,
        }
    }

    #[test]
    fn test_idle_until_first_fix() {
        let mut g = gate(80 * SEC);
        assert_eq!(g.state(), GateState::Idle);
        assert_eq!(g.evaluate(Trigger::Manual, 0), GateDecision::Skip(SkipReason::NoFix));

        assert_eq!(g.observe_fix(LocationFix::new(f64::NAN, 0.0, 0)), FixDisposition::Invalid);
        assert_eq!(g.state(), GateState::Idle);

        assert_eq!(g.observe_fix(dublin(0)), FixDisposition::Accepted);
        assert_eq!(g.state(), GateState::Ready);
    }

    #[test]
    fn test_first_upload_is_always_eligible() {
        let mut g = gate(80 * SEC);
        g.observe_fix(dublin(0));
        assert!(send(&mut g, Trigger::Timer, 1, true));
        assert_eq!(g.state(), GateState::Sent);
        assert_eq!(g.upload_state().last_upload_at_ms, Some(1));
    }

    #[test]
    fn test_timer_triggers_wait_for_period() {
        let mut g = gate(80 * SEC);
        g.observe_fix(dublin(0));
        let t0 = 1_000_000;
        assert!(send(&mut g, Trigger::Timer, t0, true));

        assert!(!send(&mut g, Trigger::Timer, t0 + 10 * SEC, true));
        assert!(!send(&mut g, Trigger::Timer, t0 + 20 * SEC, true));
        assert_eq!(
            g.evaluate(Trigger::Timer, t0 + 70 * SEC),
            GateDecision::Skip(SkipReason::PeriodNotElapsed { remaining_ms: 10 * SEC })
        );
        assert!(send(&mut g, Trigger::Timer, t0 + 80 * SEC, true));
        assert!(!send(&mut g, Trigger::Timer, t0 + 90 * SEC, true));
    }

    #[test]
    fn test_manual_bypasses_and_resets_timer() {
        let mut g = gate(80 * SEC);
        g.observe_fix(dublin(0));
        let t0 = 1_000_000;
        assert!(send(&mut g, Trigger::Timer, t0, true));

        assert!(send(&mut g, Trigger::Manual, t0 + 5 * SEC, true));
        assert_eq!(g.upload_state().last_upload_at_ms, Some(t0 + 5 * SEC));

        // Timer restarts from the manual send
        assert!(!send(&mut g, Trigger::Timer, t0 + 80 * SEC, true));
        assert!(send(&mut g, Trigger::Timer, t0 + 85 * SEC, true));
    }

    #[test]
    fn test_failure_does_not_move_timer() {
        let mut g = gate(80 * SEC);
        g.observe_fix(dublin(0));
        let t0 = 1_000_000;
        assert!(send(&mut g, Trigger::Timer, t0, true));

        assert!(send(&mut g, Trigger::Timer, t0 + 80 * SEC, false));
        assert_eq!(g.state(), GateState::Ready);
        assert_eq!(g.upload_state().last_upload_at_ms, Some(t0));

        // Immediately retriable on the next trigger
        assert!(send(&mut g, Trigger::Movement, t0 + 81 * SEC, true));
    }

    #[test]
    fn test_in_flight_blocks_other_triggers() {
        let mut g = gate(80 * SEC);
        g.observe_fix(dublin(0));
        let attempt = match g.evaluate(Trigger::Timer, 0) {
            GateDecision::Proceed(a) => a,
            other => panic!("expected proceed, got {:?}", other),
        };
        assert_eq!(g.state(), GateState::Sending);
        assert_eq!(g.evaluate(Trigger::Timer, 0), GateDecision::Skip(SkipReason::InFlight));
        assert_eq!(g.evaluate(Trigger::Manual, 0), GateDecision::Skip(SkipReason::InFlight));

        g.complete(&attempt, true);
        assert!(!g.upload_state().in_flight);
    }

    #[test]
    fn test_abandon_keeps_timer() {
        let mut g = gate(80 * SEC);
        g.observe_fix(dublin(0));
        assert!(matches!(g.evaluate(Trigger::Manual, 10), GateDecision::Proceed(_)));
        g.abandon();
        assert_eq!(g.state(), GateState::Ready);
        assert_eq!(g.upload_state().last_upload_at_ms, None);
        assert!(matches!(g.evaluate(Trigger::Timer, 20), GateDecision::Proceed(_)));
    }

    #[test]
    fn test_movement_threshold() {
        let mut g = UploadGate::new(UploadConfig {
            movement_threshold_meters: 50.0,
            ..UploadConfig::default()
        })
        .unwrap();

        assert_eq!(g.observe_fix(LocationFix::new(53.3498, -6.2603, 0)), FixDisposition::Accepted);
        // ~11 m north
        let near = LocationFix::new(53.3499, -6.2603, 1_000);
        assert_eq!(g.observe_fix(near), FixDisposition::BelowThreshold);
        assert_eq!(g.upload_state().last_known_fix, Some(near));
        assert_eq!(g.upload_state().last_accepted_fix.unwrap().captured_at_ms, 0);

        // ~111 m north of the accepted fix
        assert_eq!(g.observe_fix(LocationFix::new(53.3508, -6.2603, 2_000)), FixDisposition::Accepted);
    }

    #[test]
    fn test_zero_threshold_accepts_stationary_fixes() {
        let mut g = gate(80 * SEC);
        assert_eq!(g.observe_fix(dublin(0)), FixDisposition::Accepted);
        assert_eq!(g.observe_fix(dublin(1_000)), FixDisposition::Accepted);
    }

    #[test]
    fn test_slotted_schedule() {
        let mut g = UploadGate::new(UploadConfig {
            period_ms: 40 * SEC,
            schedule: Schedule::Slotted { parity: 1 },
            ..UploadConfig::default()
        })
        .unwrap();
        g.observe_fix(dublin(0));

        // Slot 2 is even
        assert_eq!(
            g.evaluate(Trigger::Timer, 80 * SEC),
            GateDecision::Skip(SkipReason::WrongSlotParity { slot: 2 })
        );
        // Slot 3 is ours, once
        assert!(send(&mut g, Trigger::Timer, 121 * SEC, true));
        assert_eq!(
            g.evaluate(Trigger::Timer, 130 * SEC),
            GateDecision::Skip(SkipReason::SlotAlreadyUsed { slot: 3 })
        );
        // A failed attempt leaves the slot open
        assert!(send(&mut g, Trigger::Timer, 205 * SEC, false));
        assert!(send(&mut g, Trigger::Timer, 210 * SEC, true));
        // Manual ignores parity
        assert!(send(&mut g, Trigger::Manual, 240 * SEC, true));
    }

    #[test]
    fn test_config_validation() {
        assert!(UploadConfig::default().validate().is_ok());
        assert!(UploadConfig { period_ms: 0, ..UploadConfig::default() }.validate().is_err());
        assert!(UploadConfig { movement_threshold_meters: -1.0, ..UploadConfig::default() }
            .validate()
            .is_err());
        assert!(UploadConfig { schedule: Schedule::Slotted { parity: 2 }, ..UploadConfig::default() }
            .validate()
            .is_err());
    }

    #[test]
    fn test_config_from_json() {
        let config: UploadConfig = serde_json::from_str(
            r#"{"period_ms": 40000, "schedule": {"mode": "slotted", "parity": 0}}"#,
        )
        .unwrap();
        assert_eq!(config.period_ms, 40_000);
        assert_eq!(config.schedule, Schedule::Slotted { parity: 0 });
        assert!(config.timer_backstop);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(10);
        clock.advance(5);
        assert_eq!(clock.now_ms(), 15);
        clock.set(100);
        assert_eq!(clock.now_ms(), 100);
        assert!(SystemClock.now_ms() > 1_600_000_000_000);
    }
}
