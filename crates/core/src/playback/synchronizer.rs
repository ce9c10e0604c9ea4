use super::{AudioOutput, Correction, DriftCorrector, PlaybackPhase};
use crate::config::DriftConfig;
use crate::protocol::{ActionKind, PlayState, ResolvedTrack, ScheduledAction};
use crate::time::TimestampMs;
use crate::timer::CancelableTask;
use std::time::Duration;
use tokio::sync::mpsc;

/// Applies scheduled actions and snapshot corrections to an output
///
/// Only one scheduled action is ever armed. A newly received action
/// replaces the armed one and gets a fresh sequence number; when a timer
/// fires, its sequence number is posted on the channel given to [`new`]
/// and the owner calls [`fire`], which applies the action only if that
/// number is still the latest.
///
/// All `server_now` arguments are the caller's estimate of the server
/// clock.
///
/// [`new`]: PlaybackSynchronizer::new
/// [`fire`]: PlaybackSynchronizer::fire
pub struct PlaybackSynchronizer {
    output: Box<dyn AudioOutput>,
    phase: PlaybackPhase,
    drift: DriftCorrector,
    timer: CancelableTask,
    pending: Option<(u64, ScheduledAction)>,
    fired_tx: mpsc::UnboundedSender<u64>,
}

impl PlaybackSynchronizer {
    pub fn new(
        config: DriftConfig,
        output: Box<dyn AudioOutput>,
        fired_tx: mpsc::UnboundedSender<u64>,
    ) -> Self {
        Self {
            output,
            phase: PlaybackPhase::Idle,
            drift: DriftCorrector::new(config),
            timer: CancelableTask::new(),
            pending: None,
            fired_tx,
        }
    }

    pub fn phase(&self) -> &PlaybackPhase {
        &self.phase
    }

    pub fn position(&self) -> f64 {
        self.output.position()
    }

    pub fn has_pending_action(&self) -> bool {
        self.pending.is_some()
    }

    /// The room switched tracks
    ///
    /// Any armed action belonged to the previous track and is dropped.
    pub fn track_changed(&mut self, track: Option<&ResolvedTrack>) {
        self.cancel_pending();
        self.drift.reset();
        match track {
            Some(track) => {
                self.output.load(track);
                self.phase = PlaybackPhase::Loading {
                    track_id: track.track.id.clone(),
                };
                tracing::debug!(track_id = %track.track.id, "Track loading");
            }
            None => {
                self.output.pause();
                self.phase = PlaybackPhase::Idle;
            }
        }
    }

    /// Bring playback in line with a room's state on join or reconnect
    pub fn sync_to(&mut self, play_state: &PlayState, server_now: TimestampMs) {
        let Some(track_id) = self.phase.track_id().cloned() else {
            return;
        };
        self.output.seek(play_state.position_at(server_now));
        if play_state.is_playing {
            self.output.play();
            self.phase = PlaybackPhase::Playing { track_id };
        } else {
            self.output.pause();
            self.phase = PlaybackPhase::Paused { track_id };
        }
        self.drift.arm_guard(server_now);
    }

    /// Arm a scheduled action, replacing any armed one
    ///
    /// Returns the action's sequence number.
    pub fn schedule(&mut self, action: ScheduledAction, server_now: TimestampMs) -> u64 {
        let delay_ms = action.server_time_to_execute.saturating_sub(server_now);
        let tx = self.fired_tx.clone();
        let sequence = self.timer.replace(Duration::from_millis(delay_ms), move |seq| {
            let _ = tx.send(seq);
        });
        self.pending = Some((sequence, action));
        tracing::trace!(sequence, delay_ms, kind = ?action.kind, "Scheduled action armed");
        sequence
    }

    /// Apply the armed action if `sequence` is still the latest
    pub fn fire(&mut self, sequence: u64, server_now: TimestampMs) -> bool {
        if !self.timer.accept(sequence) {
            tracing::trace!(sequence, "Ignoring superseded action");
            return false;
        }
        match self.pending.take() {
            Some((seq, action)) if seq == sequence => {
                self.apply(&action, server_now);
                true
            }
            _ => false,
        }
    }

    /// Apply a transition now, compensating for lateness
    pub fn apply(&mut self, action: &ScheduledAction, server_now: TimestampMs) {
        let Some(track_id) = self.phase.track_id().cloned() else {
            tracing::debug!(kind = ?action.kind, "No track loaded, dropping action");
            return;
        };
        let state = &action.play_state;

        match action.kind {
            ActionKind::Play | ActionKind::Resume => {
                self.output.seek(state.position_at(server_now));
                self.output.play();
                self.phase = PlaybackPhase::Playing { track_id };
            }
            ActionKind::Pause => {
                self.output.pause();
                self.output.seek(state.current_time);
                self.phase = PlaybackPhase::Paused { track_id };
            }
            ActionKind::Seek => {
                self.output.seek(state.position_at(server_now));
                if state.is_playing {
                    self.output.play();
                    self.phase = PlaybackPhase::Playing { track_id };
                } else {
                    self.output.pause();
                    self.phase = PlaybackPhase::Paused { track_id };
                }
            }
        }

        if self.output.rate() != 1.0 {
            self.output.set_rate(1.0);
        }
        self.drift.reset();
        self.drift.arm_guard(server_now);
    }

    /// Reconcile with a position snapshot
    ///
    /// Snapshots are ignored unless playing.
    pub fn on_snapshot(&mut self, snapshot: &PlayState, server_now: TimestampMs) -> Correction {
        if !self.phase.is_playing() {
            return Correction::None;
        }

        let expected = self.drift.expected_position(snapshot, server_now);
        let local = self.output.position();
        let correction = self.drift.evaluate(expected, local, server_now);

        match correction {
            Correction::HardSeek { to } => {
                tracing::debug!(drift = expected - local, "Hard seek");
                self.output.seek(to);
                if self.output.rate() != 1.0 {
                    self.output.set_rate(1.0);
                }
            }
            Correction::Nudge { rate } => {
                tracing::trace!(drift = expected - local, rate, "Nudging rate");
                self.output.set_rate(rate);
            }
            Correction::RestoreRate => self.output.set_rate(1.0),
            Correction::None | Correction::Suppressed => {}
        }
        correction
    }

    /// Local playback reached the end of the track
    pub fn track_finished(&mut self) {
        self.cancel_pending();
        self.output.pause();
        self.phase = PlaybackPhase::Idle;
    }

    fn cancel_pending(&mut self) {
        self.timer.cancel();
        self.pending = None;
    }
}

impl std::fmt::Debug for PlaybackSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackSynchronizer")
            .field("phase", &self.phase)
            .field("pending", &self.pending)
            .finish()
    }
}
