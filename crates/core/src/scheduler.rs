//! Server-side scheduling of playback transitions
//!
//! A transition is broadcast ahead of time with the server timestamp at
//! which every client should apply it. The lead time covers the slowest
//! member's round trip, bounded on both ends.

use crate::config::SchedulingConfig;
use crate::protocol::{ActionKind, PlayState, ScheduledAction};
use crate::time::TimestampMs;

/// Playback transition requested by a privileged actor
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PlaybackCommand {
    /// Start the current track from the beginning
    Play,
    Pause,
    Resume,
    Seek(f64),
}

impl PlaybackCommand {
    pub fn kind(&self) -> ActionKind {
        match self {
            PlaybackCommand::Play => ActionKind::Play,
            PlaybackCommand::Pause => ActionKind::Pause,
            PlaybackCommand::Resume => ActionKind::Resume,
            PlaybackCommand::Seek(_) => ActionKind::Seek,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Scheduler {
    config: SchedulingConfig,
}

impl Scheduler {
    pub fn new(config: SchedulingConfig) -> Self {
        Self { config }
    }

    /// Lead time for a room whose slowest member reported `worst_rtt_ms`
    pub fn margin_ms(&self, worst_rtt_ms: Option<f64>) -> u64 {
        let min = self.config.min_margin_ms;
        let max = self.config.max_margin_ms;
        match worst_rtt_ms {
            Some(rtt) if rtt.is_finite() && rtt > 0.0 => {
                let scaled = (rtt * self.config.rtt_multiplier).ceil() as u64;
                scaled.clamp(min, max)
            }
            _ => min,
        }
    }

    /// Compute the transition and the state it leaves behind
    ///
    /// The new state is stamped at the execution time, which is never
    /// earlier than the current stamp.
    pub fn schedule(
        &self,
        current: &PlayState,
        command: PlaybackCommand,
        now: TimestampMs,
        worst_rtt_ms: Option<f64>,
    ) -> ScheduledAction {
        let execute_at = (now + self.margin_ms(worst_rtt_ms)).max(current.server_timestamp);

        let play_state = match command {
            PlaybackCommand::Play => PlayState::playing(0.0, execute_at),
            PlaybackCommand::Pause => PlayState::paused(current.position_at(execute_at), execute_at),
            PlaybackCommand::Resume => {
                PlayState::playing(current.position_at(execute_at), execute_at)
            }
            PlaybackCommand::Seek(position) => PlayState {
                is_playing: current.is_playing,
                current_time: position.max(0.0),
                server_timestamp: execute_at,
            },
        };

        ScheduledAction {
            kind: command.kind(),
            play_state,
            server_time_to_execute: execute_at,
        }
    }

    /// Apply a host position report received at `now`
    ///
    /// Returns `None` when the report predates the current stamp, which
    /// means a scheduled transition is still in flight.
    pub fn accept_host_report(
        &self,
        current: &PlayState,
        current_time: f64,
        is_playing: bool,
        now: TimestampMs,
    ) -> Option<PlayState> {
        if now < current.server_timestamp {
            return None;
        }
        Some(PlayState {
            is_playing,
            current_time: current_time.max(0.0),
            server_timestamp: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler() -> Scheduler {
        Scheduler::new(SchedulingConfig::default())
    }

    #[test]
    fn test_margin_bounds() {
        let s = scheduler();
        assert_eq!(s.margin_ms(None), 300);
        assert_eq!(s.margin_ms(Some(50.0)), 300);
        assert_eq!(s.margin_ms(Some(400.0)), 600);
        assert_eq!(s.margin_ms(Some(5_000.0)), 2_000);
    }

    #[test]
    fn test_pause_freezes_position_at_execution() {
        let s = scheduler();
        let current = PlayState::playing(10.0, 1_000);
        let action = s.schedule(&current, PlaybackCommand::Pause, 3_000, None);

        assert_eq!(action.kind, ActionKind::Pause);
        assert_eq!(action.server_time_to_execute, 3_300);
        assert!(!action.play_state.is_playing);
        assert!((action.play_state.current_time - 12.3).abs() < 1e-9);
        assert_eq!(action.play_state.server_timestamp, 3_300);
    }

    #[test]
    fn test_seek_keeps_playing_flag() {
        let s = scheduler();
        let paused = PlayState::paused(3.0, 0);
        let action = s.schedule(&paused, PlaybackCommand::Seek(-4.0), 100, None);
        assert!(!action.play_state.is_playing);
        assert_eq!(action.play_state.current_time, 0.0);
    }

    #[test]
    fn test_stamp_never_decreases() {
        let s = scheduler();
        // A slow room scheduled far ahead, then a fast one right after
        let first = s.schedule(&PlayState::default(), PlaybackCommand::Play, 1_000, Some(2_000.0));
        let second = s.schedule(&first.play_state, PlaybackCommand::Pause, 1_010, None);
        assert!(second.server_time_to_execute >= first.server_time_to_execute);
    }

    #[test]
    fn test_stale_host_report_dropped() {
        let s = scheduler();
        let pending = PlayState::playing(0.0, 5_000);
        assert!(s.accept_host_report(&pending, 1.0, true, 4_900).is_none());

        let accepted = s.accept_host_report(&pending, 1.0, true, 6_000).unwrap();
        assert_eq!(accepted.server_timestamp, 6_000);
    }
}
