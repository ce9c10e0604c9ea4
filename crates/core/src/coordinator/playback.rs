//! Playback, queue and track selection

use super::{Coordinator, CoordinatorEvent};
use crate::collaborators::resolve_track;
use crate::permissions::{self, Action, Capability, Subject};
use crate::protocol::{
    ChatMessage, PlayState, ResolvedTrack, ServerMessage, Track, TrackId, VoteAction,
};
use crate::room::{Advance, ConnectionId, PendingSelection, Room};
use crate::scheduler::PlaybackCommand;
use crate::{Error, Result};
use tracing::{debug, info, warn};

impl Coordinator {
    /// A direct privileged command from a connection
    pub(super) fn request_action(&mut self, conn: ConnectionId, action: VoteAction) -> Result<()> {
        let member = self.member(&conn)?;
        permissions::require(member.role, permissions::capability_for(&action))?;
        self.execute_action(&member.room_id, action)
    }

    /// Reject actions that could never succeed in the room's current state
    pub(super) fn validate_action(room: &Room, action: &VoteAction) -> Result<()> {
        if let VoteAction::Seek { position } = action {
            if !position.is_finite() || *position < 0.0 {
                return Err(Error::InvalidMessage(
                    "seek position must be a non-negative number".to_string(),
                ));
            }
        }
        match action {
            VoteAction::PlayTrack { track_id } | VoteAction::RemoveTrack { track_id } => {
                if room.queue_position(track_id).is_none() {
                    return Err(Error::UnknownTrack(track_id.clone()));
                }
            }
            VoteAction::Pause | VoteAction::Resume | VoteAction::Seek { .. } => {
                if room.current_track.is_none() {
                    return Err(Error::InvalidMessage("nothing is playing".to_string()));
                }
            }
            VoteAction::Skip | VoteAction::SetPlayMode { .. } => {}
        }
        Ok(())
    }

    /// The privileged path shared by direct commands and passed votes
    pub(super) fn execute_action(&mut self, room_id: &str, action: VoteAction) -> Result<()> {
        let now = self.clock.now_ms();
        let limits = self.config.limits.clone();
        let room = self.registry.room_mut(room_id).ok_or(Error::NotInRoom)?;
        Self::validate_action(room, &action)?;

        match action {
            VoteAction::Skip => {
                if !room.debounce.allow_skip(now, limits.skip_debounce_ms) {
                    debug!(room_id = %room_id, "Skip debounced");
                    return Ok(());
                }
                self.advance(room_id, Advance::Skip);
            }
            VoteAction::PlayTrack { track_id } => {
                if !room
                    .debounce
                    .allow_play(&track_id, now, limits.duplicate_play_window_ms)
                {
                    debug!(room_id = %room_id, track_id = %track_id, "Duplicate play ignored");
                    return Ok(());
                }
                self.advance(room_id, Advance::Select(track_id));
            }
            VoteAction::Pause => self.schedule(room_id, PlaybackCommand::Pause),
            VoteAction::Resume => self.schedule(room_id, PlaybackCommand::Resume),
            VoteAction::Seek { position } => self.schedule(room_id, PlaybackCommand::Seek(position)),
            VoteAction::RemoveTrack { track_id } => {
                let was_current = room
                    .current_track
                    .as_ref()
                    .is_some_and(|t| t.track.id == track_id);
                // Successors are picked before the removal so the order
                // continues from the removed track's position
                let successors = was_current.then(|| room.candidates(&Advance::Skip));
                room.queue.retain(|t| t.id != track_id);
                if let Some(pending) = room.pending_selection.as_mut() {
                    pending.candidates.retain(|t| t.id != track_id);
                }
                debug!(room_id = %room_id, track_id = %track_id, "Track removed from queue");
                self.broadcast_queue(room_id);

                if let Some(mut successors) = successors {
                    successors.retain(|t| t.id != track_id);
                    info!(room_id = %room_id, track_id = %track_id, "Current track removed");
                    self.begin_selection(room_id, successors);
                }
            }
            VoteAction::SetPlayMode { mode } => {
                room.play_mode = mode;
                info!(room_id = %room_id, mode = ?mode, "Play mode changed");
                self.broadcast_queue(room_id);
                self.persist(room_id);
            }
        }
        Ok(())
    }

    /// Compute a transition, store the resulting state and broadcast it
    fn schedule(&mut self, room_id: &str, command: PlaybackCommand) {
        let now = self.clock.now_ms();
        let Some(room) = self.registry.room_mut(room_id) else {
            return;
        };
        let action = self
            .scheduler
            .schedule(&room.play_state, command, now, room.worst_rtt());
        room.play_state = action.play_state;

        debug!(
            room_id = %room_id,
            kind = ?action.kind,
            execute_at = action.server_time_to_execute,
            lead_ms = action.server_time_to_execute.saturating_sub(now),
            "Action scheduled"
        );
        self.metrics.action_scheduled();
        self.registry
            .broadcast(room_id, &ServerMessage::ScheduledAction(action));
    }

    fn broadcast_queue(&self, room_id: &str) {
        if let Some(room) = self.registry.room(room_id) {
            self.registry.broadcast(
                room_id,
                &ServerMessage::QueueUpdated {
                    queue: room.queue.clone(),
                    play_mode: room.play_mode,
                },
            );
        }
    }

    pub(super) fn add_track(&mut self, conn: ConnectionId, track: Track) -> Result<()> {
        let member = self.member(&conn)?;
        permissions::require(member.role, Capability::new(Action::Add, Subject::Queue))?;
        if track.id.is_empty() {
            return Err(Error::InvalidMessage("track id must not be empty".to_string()));
        }

        let max_queue_len = self.config.limits.max_queue_len;
        let room = self
            .registry
            .room_mut(&member.room_id)
            .ok_or(Error::NotInRoom)?;
        if room.queue.len() >= max_queue_len {
            return Err(Error::InvalidMessage(format!(
                "queue is full ({max_queue_len} tracks)"
            )));
        }
        if room.queue_position(&track.id).is_some() {
            return Err(Error::InvalidMessage(format!(
                "track {} is already queued",
                track.id
            )));
        }

        let track_id = track.id.clone();
        room.queue.push(track);
        let idle = room.current_track.is_none() && room.pending_selection.is_none();
        debug!(room_id = %member.room_id, track_id = %track_id, "Track queued");

        self.broadcast_queue(&member.room_id);
        if idle {
            self.advance(&member.room_id, Advance::Select(track_id));
        }
        Ok(())
    }

    pub(super) fn host_report(
        &mut self,
        conn: ConnectionId,
        current_time: f64,
        is_playing: bool,
    ) -> Result<()> {
        let member = self.member(&conn)?;
        permissions::require(member.role, Capability::new(Action::Report, Subject::Position))?;
        if !current_time.is_finite() {
            return Err(Error::InvalidMessage("current_time must be finite".to_string()));
        }

        let now = self.clock.now_ms();
        let room = self
            .registry
            .room_mut(&member.room_id)
            .ok_or(Error::NotInRoom)?;
        if room.current_track.is_none() {
            return Ok(());
        }
        let Some(state) =
            self.scheduler
                .accept_host_report(&room.play_state, current_time, is_playing, now)
        else {
            debug!(room_id = %member.room_id, "Stale host report dropped");
            return Ok(());
        };
        room.play_state = state;

        self.metrics.snapshot_sent();
        self.registry.broadcast_except(
            &member.room_id,
            Some(&member.user_id),
            &ServerMessage::SyncSnapshot(state),
        );
        Ok(())
    }

    pub(super) fn sync_request(&mut self, conn: ConnectionId) -> Result<()> {
        let member = self.member(&conn)?;
        let now = self.clock.now_ms();
        let room = self.registry.room(&member.room_id).ok_or(Error::NotInRoom)?;
        let snapshot = room.play_state.snapshot_at(now);
        self.registry.send(&conn, ServerMessage::SyncSnapshot(snapshot));
        self.metrics.snapshot_sent();
        Ok(())
    }

    /// Periodic snapshot for every room with a current track
    pub(super) fn broadcast_snapshots(&mut self) {
        let now = self.clock.now_ms();
        for room in self.registry.rooms() {
            if room.current_track.is_none() || room.online_count() == 0 {
                continue;
            }
            let snapshot = ServerMessage::SyncSnapshot(room.play_state.snapshot_at(now));
            self.registry.broadcast(&room.id, &snapshot);
            self.metrics.snapshot_sent();
        }
    }

    pub(super) fn track_ended(&mut self, conn: ConnectionId, track_id: TrackId) -> Result<()> {
        let member = self.member(&conn)?;
        permissions::require(member.role, Capability::new(Action::Report, Subject::Position))?;

        let room = self
            .registry
            .room_mut(&member.room_id)
            .ok_or(Error::NotInRoom)?;
        let is_current = room
            .current_track
            .as_ref()
            .is_some_and(|t| t.track.id == track_id);
        if !is_current || !room.debounce.accept_track_end(&track_id) {
            debug!(room_id = %member.room_id, track_id = %track_id, "Ignoring track end");
            return Ok(());
        }

        self.advance(&member.room_id, Advance::Ended);
        Ok(())
    }

    /// Start choosing the next track
    fn advance(&mut self, room_id: &str, advance: Advance) {
        let Some(room) = self.registry.room_mut(room_id) else {
            return;
        };
        let candidates = room.candidates(&advance);
        debug!(room_id = %room_id, ?advance, "Selecting next track");
        self.begin_selection(room_id, candidates);
    }

    /// Supersede any selection in flight and walk `candidates` in order
    fn begin_selection(&mut self, room_id: &str, candidates: Vec<Track>) {
        let Some(room) = self.registry.room_mut(room_id) else {
            return;
        };
        room.selection_generation += 1;
        room.pending_selection = Some(PendingSelection {
            generation: room.selection_generation,
            candidates: candidates.into(),
        });
        self.try_next_candidate(room_id);
    }

    /// Resolve the next candidate on a spawned task, or stop if none are left
    fn try_next_candidate(&mut self, room_id: &str) {
        let Some(room) = self.registry.room_mut(room_id) else {
            return;
        };
        let Some(pending) = room.pending_selection.as_mut() else {
            return;
        };

        match pending.candidates.pop_front() {
            Some(track) => {
                let generation = pending.generation;
                let resolver = self.resolver.clone();
                let events = self.events_tx.clone();
                let room_id = room_id.to_string();
                tokio::spawn(async move {
                    let result = resolve_track(resolver.as_ref(), &track).await;
                    let _ = events.send(CoordinatorEvent::TrackResolved {
                        room_id,
                        generation,
                        track,
                        result,
                    });
                });
            }
            None => {
                room.pending_selection = None;
                self.set_current_track(room_id, None);
            }
        }
    }

    pub(super) fn on_track_resolved(
        &mut self,
        room_id: &str,
        generation: u64,
        track: Track,
        result: Result<Option<ResolvedTrack>>,
    ) {
        let current = self.registry.room(room_id).is_some_and(|room| {
            room.selection_generation == generation && room.pending_selection.is_some()
        });
        if !current {
            debug!(room_id = %room_id, track_id = %track.id, "Discarding superseded resolution");
            return;
        }

        match result {
            Ok(Some(resolved)) => {
                if let Some(room) = self.registry.room_mut(room_id) {
                    room.pending_selection = None;
                }
                self.set_current_track(room_id, Some(resolved));
            }
            Ok(None) => {
                self.metrics.resolution_failed();
                warn!(room_id = %room_id, track_id = %track.id, "Track unavailable, skipping");
                self.try_next_candidate(room_id);
            }
            Err(err) => {
                self.metrics.resolution_failed();
                warn!(room_id = %room_id, track_id = %track.id, error = %err, "Track resolution failed, skipping");
                self.try_next_candidate(room_id);
            }
        }
    }

    fn set_current_track(&mut self, room_id: &str, track: Option<ResolvedTrack>) {
        let now = self.clock.now_ms();
        let Some(room) = self.registry.room_mut(room_id) else {
            return;
        };
        room.current_track = track.clone();
        room.debounce.track_started();

        let playing = track.is_some();
        match &track {
            Some(t) => info!(room_id = %room_id, track_id = %t.track.id, "Track changed"),
            None => {
                let stamp = now.max(room.play_state.server_timestamp);
                room.play_state = PlayState::paused(0.0, stamp);
                info!(room_id = %room_id, "Queue exhausted");
            }
        }

        self.registry
            .broadcast(room_id, &ServerMessage::TrackChanged { track });
        if playing {
            self.schedule(room_id, PlaybackCommand::Play);
        }
    }

    pub(super) fn search(
        &mut self,
        conn: ConnectionId,
        source: String,
        keyword: String,
        page: u32,
    ) -> Result<()> {
        self.member(&conn)?;
        let resolver = self.resolver.clone();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let tracks = match resolver.search(&source, &keyword, page).await {
                Ok(tracks) => tracks,
                Err(err) => {
                    warn!(source = %source, keyword = %keyword, error = %err, "Search failed");
                    Vec::new()
                }
            };
            let _ = events.send(CoordinatorEvent::SearchCompleted { conn, tracks });
        });
        Ok(())
    }

    pub(super) fn chat(&mut self, conn: ConnectionId, text: String) -> Result<()> {
        let member = self.member(&conn)?;
        let text = text.trim().to_string();
        if text.is_empty() {
            return Err(Error::InvalidMessage("chat text must not be empty".to_string()));
        }

        let now = self.clock.now_ms();
        let limit = self.config.limits.chat_history_limit;
        let room = self
            .registry
            .room_mut(&member.room_id)
            .ok_or(Error::NotInRoom)?;
        let nickname = room
            .user(&member.user_id)
            .map(|u| u.nickname.clone())
            .unwrap_or_default();
        let message = ChatMessage {
            user_id: member.user_id,
            nickname,
            text,
            sent_at: now,
        };
        room.push_chat(message.clone(), limit);
        self.registry
            .broadcast(&member.room_id, &ServerMessage::Chat { message });
        Ok(())
    }
}
