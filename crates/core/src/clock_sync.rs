//! Client clock synchronization
//!
//! Estimates the offset between the local clock and the server clock from
//! ping/pong exchanges. Each accepted exchange yields a [`ClockSample`]; the
//! estimate is the median offset over a bounded window so a single delayed
//! packet cannot drag it.

use crate::config::ClockSyncConfig;
use crate::protocol::ClientMessage;
use crate::time::TimestampMs;
use std::collections::VecDeque;
use std::time::Duration;

/// Outstanding pings remembered for matching pongs
const MAX_OUTSTANDING: usize = 32;

/// One accepted ping/pong exchange
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockSample {
    pub rtt_ms: f64,
    pub offset_ms: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// Pinging quickly to build an initial estimate
    Calibrating,
    /// Pinging slowly to follow clock drift
    Steady,
}

/// Offset estimator for one connection
#[derive(Debug)]
pub struct ClockSync {
    config: ClockSyncConfig,
    samples: VecDeque<ClockSample>,
    accepted: usize,
    outstanding: VecDeque<(u64, TimestampMs)>,
    next_id: u64,
    phase: SyncPhase,
    phase_switched: bool,
}

impl ClockSync {
    pub fn new(config: ClockSyncConfig) -> Self {
        Self {
            samples: VecDeque::with_capacity(config.window_size),
            config,
            accepted: 0,
            outstanding: VecDeque::new(),
            next_id: 1,
            phase: SyncPhase::Calibrating,
            phase_switched: false,
        }
    }

    /// Build the next ping, remembering when it was sent
    pub fn next_ping(&mut self, local_now: TimestampMs) -> ClientMessage {
        let id = self.next_id;
        self.next_id += 1;

        if self.outstanding.len() == MAX_OUTSTANDING {
            self.outstanding.pop_front();
        }
        self.outstanding.push_back((id, local_now));

        ClientMessage::Ping {
            id,
            ts: local_now,
            rtt_ms: self.median_rtt(),
        }
    }

    /// Feed a pong received at `local_now`
    ///
    /// Returns the sample when it was accepted. Pongs for unknown pings and
    /// exchanges with an implausible round trip are dropped.
    pub fn handle_pong(
        &mut self,
        id: u64,
        server_time: TimestampMs,
        local_now: TimestampMs,
    ) -> Option<ClockSample> {
        let index = self.outstanding.iter().position(|(pid, _)| *pid == id);
        let Some(index) = index else {
            tracing::trace!(ping_id = id, "Pong does not match an outstanding ping");
            return None;
        };
        let (_, sent_at) = self.outstanding.remove(index)?;
        self.record(sent_at, server_time, local_now)
    }

    /// Record an exchange directly from its three timestamps
    pub fn record(
        &mut self,
        sent_at: TimestampMs,
        server_time: TimestampMs,
        received_at: TimestampMs,
    ) -> Option<ClockSample> {
        let rtt_ms = received_at as f64 - sent_at as f64;
        if rtt_ms < 0.0 || rtt_ms > self.config.max_rtt_ms {
            tracing::trace!(rtt_ms, "Discarding clock sample");
            return None;
        }

        let offset_ms = server_time as f64 - (sent_at as f64 + rtt_ms / 2.0);
        let sample = ClockSample { rtt_ms, offset_ms };

        if self.samples.len() >= self.config.window_size.max(1) {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        self.accepted += 1;

        if self.phase == SyncPhase::Calibrating && self.accepted >= self.config.calibration_samples
        {
            self.phase = SyncPhase::Steady;
            self.phase_switched = true;
            tracing::debug!(
                offset_ms = self.offset_ms().unwrap_or_default(),
                samples = self.accepted,
                "Clock calibrated"
            );
        }

        Some(sample)
    }

    /// Median offset of the retained samples
    pub fn offset_ms(&self) -> Option<f64> {
        median(self.samples.iter().map(|s| s.offset_ms))
    }

    /// Median round trip of the retained samples
    pub fn median_rtt(&self) -> Option<f64> {
        median(self.samples.iter().map(|s| s.rtt_ms))
    }

    /// Estimated server time for a local timestamp
    pub fn server_time(&self, local_now: TimestampMs) -> TimestampMs {
        let estimate = local_now as f64 + self.offset_ms().unwrap_or(0.0);
        estimate.round().max(0.0) as TimestampMs
    }

    pub fn is_calibrated(&self) -> bool {
        self.accepted >= self.config.calibration_samples
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    /// Interval until the next ping for the current phase
    pub fn ping_interval(&self) -> Duration {
        match self.phase {
            SyncPhase::Calibrating => self.config.calibration_interval(),
            SyncPhase::Steady => self.config.steady_interval(),
        }
    }

    /// Returns true exactly once after calibration completes
    pub fn take_phase_switch(&mut self) -> bool {
        std::mem::take(&mut self.phase_switched)
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Forget everything, as on a new connection
    pub fn reset(&mut self) {
        self.samples.clear();
        self.outstanding.clear();
        self.accepted = 0;
        self.phase = SyncPhase::Calibrating;
        self.phase_switched = false;
    }
}

/// Median of a sequence of finite values
pub fn median<I>(values: I) -> Option<f64>
where
    I: IntoIterator<Item = f64>,
{
    let mut values: Vec<f64> = values.into_iter().collect();
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2.0)
    } else {
        Some(values[mid])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> ClockSync {
        ClockSync::new(ClockSyncConfig::default())
    }

    #[test]
    fn test_median() {
        assert_eq!(median(vec![3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(vec![4.0, 1.0, 3.0, 2.0]), Some(2.5));
        assert_eq!(median(Vec::<f64>::new()), None);
    }

    #[test]
    fn test_offset_from_symmetric_exchange() {
        let mut sync = engine();
        // Local clock 500 ms behind the server, 40 ms round trip
        let sample = sync.record(1_000, 1_520, 1_040).unwrap();
        assert_eq!(sample.rtt_ms, 40.0);
        assert_eq!(sample.offset_ms, 500.0);
        assert_eq!(sync.server_time(2_000), 2_500);
    }

    #[test]
    fn test_implausible_samples_dropped() {
        let mut sync = engine();
        assert!(sync.record(1_000, 5_000, 900).is_none());
        assert!(sync.record(0, 5_000, 20_000).is_none());
        assert_eq!(sync.sample_count(), 0);
    }

    #[test]
    fn test_pong_must_match_outstanding_ping() {
        let mut sync = engine();
        let ClientMessage::Ping { id, ts, rtt_ms } = sync.next_ping(100) else {
            panic!("expected ping");
        };
        assert_eq!(ts, 100);
        assert!(rtt_ms.is_none());

        assert!(sync.handle_pong(id + 7, 200, 120).is_none());
        assert!(sync.handle_pong(id, 200, 120).is_some());
        // A duplicate pong for the same ping is not counted twice
        assert!(sync.handle_pong(id, 200, 120).is_none());
        assert_eq!(sync.sample_count(), 1);
    }

    #[test]
    fn test_phase_switches_once() {
        let mut sync = engine();
        assert_eq!(sync.ping_interval(), Duration::from_millis(50));
        for i in 0..8u64 {
            assert!(!sync.is_calibrated());
            sync.record(i * 100, i * 100 + 10, i * 100 + 20);
        }
        assert!(sync.is_calibrated());
        assert_eq!(sync.phase(), SyncPhase::Steady);
        assert!(sync.take_phase_switch());
        assert!(!sync.take_phase_switch());

        sync.record(1_000, 1_010, 1_020);
        assert!(!sync.take_phase_switch());
        assert_eq!(sync.ping_interval(), Duration::from_millis(5_000));
    }

    #[test]
    fn test_window_is_bounded() {
        let mut sync = engine();
        for i in 0..50u64 {
            sync.record(i, i + 10, i + 20);
        }
        assert_eq!(sync.sample_count(), 20);
    }

    #[test]
    fn test_reset() {
        let mut sync = engine();
        for i in 0..10u64 {
            sync.record(i, i + 10, i + 20);
        }
        sync.take_phase_switch();
        sync.reset();
        assert!(!sync.is_calibrated());
        assert_eq!(sync.phase(), SyncPhase::Calibrating);
        assert_eq!(sync.offset_ms(), None);
    }
}
