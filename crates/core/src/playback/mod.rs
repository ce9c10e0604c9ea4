//! Client-side playback
//!
//! [`PlaybackSynchronizer`] turns scheduled actions and snapshots into
//! calls on an [`AudioOutput`]. Rendering itself is external.

mod drift;
mod synchronizer;

pub use drift::{Correction, DriftCorrector};
pub use synchronizer::PlaybackSynchronizer;

use crate::protocol::{ResolvedTrack, TrackId};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::time::Instant;

/// Something that can play a resolved track
pub trait AudioOutput: Send {
    fn load(&mut self, track: &ResolvedTrack);
    fn play(&mut self);
    fn pause(&mut self);
    fn seek(&mut self, position: f64);
    /// Current position in seconds
    fn position(&self) -> f64;
    fn set_rate(&mut self, rate: f64);
    fn rate(&self) -> f64;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackPhase {
    Idle,
    Loading { track_id: TrackId },
    Playing { track_id: TrackId },
    Paused { track_id: TrackId },
}

impl PlaybackPhase {
    pub fn track_id(&self) -> Option<&TrackId> {
        match self {
            PlaybackPhase::Idle => None,
            PlaybackPhase::Loading { track_id }
            | PlaybackPhase::Playing { track_id }
            | PlaybackPhase::Paused { track_id } => Some(track_id),
        }
    }

    pub fn is_playing(&self) -> bool {
        matches!(self, PlaybackPhase::Playing { .. })
    }
}

#[derive(Debug)]
struct SimulatedState {
    track: Option<ResolvedTrack>,
    playing: bool,
    base_position: f64,
    anchor: Instant,
    rate: f64,
    seeks: usize,
    rate_changes: usize,
}

impl SimulatedState {
    fn position(&self) -> f64 {
        let position = if self.playing {
            self.base_position + self.anchor.elapsed().as_secs_f64() * self.rate
        } else {
            self.base_position
        };
        match self.track.as_ref().and_then(|t| t.track.duration_secs) {
            Some(duration) => position.min(duration),
            None => position,
        }
    }

    fn rebase(&mut self) {
        self.base_position = self.position();
        self.anchor = Instant::now();
    }
}

/// Output that only tracks where playback would be
///
/// Position advances with tokio time multiplied by the playback rate.
/// Clones share state, so a test can keep a handle while the synchronizer
/// owns another.
#[derive(Debug, Clone)]
pub struct SimulatedOutput {
    state: Arc<Mutex<SimulatedState>>,
}

impl SimulatedOutput {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimulatedState {
                track: None,
                playing: false,
                base_position: 0.0,
                anchor: Instant::now(),
                rate: 1.0,
                seeks: 0,
                rate_changes: 0,
            })),
        }
    }

    pub fn is_playing(&self) -> bool {
        self.state.lock().playing
    }

    pub fn loaded_track(&self) -> Option<TrackId> {
        self.state.lock().track.as_ref().map(|t| t.track.id.clone())
    }

    /// Whether the loaded track has played to its end
    pub fn is_finished(&self) -> bool {
        let state = self.state.lock();
        match state.track.as_ref().and_then(|t| t.track.duration_secs) {
            Some(duration) => state.position() >= duration,
            None => false,
        }
    }

    pub fn seek_count(&self) -> usize {
        self.state.lock().seeks
    }

    pub fn rate_change_count(&self) -> usize {
        self.state.lock().rate_changes
    }

    /// Shift the position without counting a seek, as a drifting device would
    pub fn skew(&self, delta_secs: f64) {
        let mut state = self.state.lock();
        state.rebase();
        state.base_position = (state.base_position + delta_secs).max(0.0);
    }
}

impl Default for SimulatedOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioOutput for SimulatedOutput {
    fn load(&mut self, track: &ResolvedTrack) {
        let mut state = self.state.lock();
        state.track = Some(track.clone());
        state.playing = false;
        state.base_position = 0.0;
        state.anchor = Instant::now();
    }

    fn play(&mut self) {
        let mut state = self.state.lock();
        state.rebase();
        state.playing = true;
    }

    fn pause(&mut self) {
        let mut state = self.state.lock();
        state.rebase();
        state.playing = false;
    }

    fn seek(&mut self, position: f64) {
        let mut state = self.state.lock();
        state.base_position = position.max(0.0);
        state.anchor = Instant::now();
        state.seeks += 1;
    }

    fn position(&self) -> f64 {
        self.state.lock().position()
    }

    fn set_rate(&mut self, rate: f64) {
        let mut state = self.state.lock();
        state.rebase();
        state.rate = rate;
        state.rate_changes += 1;
    }

    fn rate(&self) -> f64 {
        self.state.lock().rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Track;
    use std::time::Duration;

    pub(crate) fn resolved(id: &str, duration: f64) -> ResolvedTrack {
        ResolvedTrack {
            track: Track {
                id: id.to_string(),
                source: "demo".to_string(),
                title: id.to_string(),
                artist: String::new(),
                duration_secs: Some(duration),
            },
            stream_url: format!("https://cdn.example/{id}.mp3"),
            cover_url: None,
            lyric: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulated_output_advances_with_rate() {
        let mut output = SimulatedOutput::new();
        output.load(&resolved("t1", 100.0));
        output.play();

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!((output.position() - 10.0).abs() < 1e-6);

        output.set_rate(1.5);
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!((output.position() - 13.0).abs() < 1e-6);

        output.pause();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!((output.position() - 13.0).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulated_output_finishes() {
        let mut output = SimulatedOutput::new();
        output.load(&resolved("t1", 3.0));
        output.play();
        assert!(!output.is_finished());

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(output.is_finished());
        assert_eq!(output.position(), 3.0);
    }

    #[test]
    fn test_phase_track_id() {
        let phase = PlaybackPhase::Paused {
            track_id: "t1".into(),
        };
        assert_eq!(phase.track_id().map(String::as_str), Some("t1"));
        assert!(!phase.is_playing());
        assert_eq!(PlaybackPhase::Idle.track_id(), None);
    }
}
