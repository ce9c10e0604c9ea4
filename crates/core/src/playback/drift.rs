//! Drift correction
//!
//! Compares the local playback position with the position implied by the
//! latest snapshot and picks the least disruptive correction: nothing, a
//! small playback-rate change, or a hard seek.

use crate::config::DriftConfig;
use crate::protocol::PlayState;
use crate::time::TimestampMs;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Correction {
    /// Within tolerance, rate already nominal
    None,
    /// Inside a guard window after a seek or transition
    Suppressed,
    /// Jump to the expected position
    HardSeek { to: f64 },
    /// Play slightly faster or slower until caught up
    Nudge { rate: f64 },
    /// Back within tolerance; return to normal speed
    RestoreRate,
}

#[derive(Debug)]
pub struct DriftCorrector {
    config: DriftConfig,
    guard_until: Option<TimestampMs>,
    rate: f64,
}

impl DriftCorrector {
    pub fn new(config: DriftConfig) -> Self {
        Self {
            config,
            guard_until: None,
            rate: 1.0,
        }
    }

    /// Position a snapshot implies at `server_now`
    ///
    /// The one-way delay credited to a playing snapshot is clamped so a
    /// stale snapshot cannot push the estimate far ahead.
    pub fn expected_position(&self, snapshot: &PlayState, server_now: TimestampMs) -> f64 {
        if !snapshot.is_playing {
            return snapshot.current_time;
        }
        let delay_ms = server_now
            .saturating_sub(snapshot.server_timestamp)
            .min(self.config.max_network_delay_ms);
        snapshot.current_time + delay_ms as f64 / 1000.0
    }

    /// Suppress corrections for the guard window starting at `now`
    pub fn arm_guard(&mut self, now: TimestampMs) {
        self.guard_until = Some(now + self.config.guard_window_ms);
    }

    pub fn in_guard(&self, now: TimestampMs) -> bool {
        self.guard_until.is_some_and(|until| now < until)
    }

    /// Current playback rate chosen by the corrector
    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn evaluate(&mut self, expected: f64, local: f64, now: TimestampMs) -> Correction {
        if self.in_guard(now) {
            return Correction::Suppressed;
        }

        let drift = expected - local;
        let magnitude = drift.abs();

        if magnitude > self.config.hard_threshold_secs {
            self.rate = 1.0;
            self.arm_guard(now);
            return Correction::HardSeek { to: expected };
        }

        if magnitude > self.config.soft_threshold_secs {
            // Positive drift means we are behind
            let target = if drift > 0.0 {
                1.0 + self.config.rate_nudge
            } else {
                1.0 - self.config.rate_nudge
            };
            if (self.rate - target).abs() < f64::EPSILON {
                return Correction::None;
            }
            self.rate = target;
            return Correction::Nudge { rate: target };
        }

        if (self.rate - 1.0).abs() > f64::EPSILON {
            self.rate = 1.0;
            return Correction::RestoreRate;
        }
        Correction::None
    }

    pub fn reset(&mut self) {
        self.guard_until = None;
        self.rate = 1.0;
    }
}
