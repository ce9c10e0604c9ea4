//! Server coordinator
//!
//! One [`Coordinator`] owns every room and every server-side timer. It runs
//! on a single task and receives all of its inputs as [`CoordinatorEvent`]s
//! on one channel: client commands, connection open/close, timer expiries,
//! completions of spawned lookups, inspection queries and shutdown. Nothing
//! else touches room state, so no locks guard it.
//!
//! Spawned work (track resolution, search) posts its result back as an
//! event and is re-validated against the room's current state before it is
//! applied.

mod membership;
mod playback;
mod voting;

use crate::collaborators::{RoomRecord, RoomRepository, TrackResolver};
use crate::config::CoordinationConfig;
use crate::metrics::Metrics;
use crate::permissions::Role;
use crate::protocol::{
    ClientMessage, PlayMode, PlayState, ResolvedTrack, RoomId, ServerMessage, Track, TrackId,
    UserId, UserView, VoteId, VoteStarted,
};
use crate::room::{ConnectionId, Outbox, RoomRegistry};
use crate::scheduler::Scheduler;
use crate::time::{Clock, TimestampMs};
use crate::timer::TimerSet;
use crate::{Error, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

/// Server-side timers, keyed by what they guard
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimerKey {
    RoomDeletion(RoomId),
    RoleGrace(RoomId, UserId),
    VoteTimeout(RoomId, VoteId),
}

impl TimerKey {
    pub fn room_id(&self) -> &RoomId {
        match self {
            TimerKey::RoomDeletion(room)
            | TimerKey::RoleGrace(room, _)
            | TimerKey::VoteTimeout(room, _) => room,
        }
    }
}

/// Everything the coordinator reacts to
#[derive(Debug)]
pub enum CoordinatorEvent {
    Connected {
        conn: ConnectionId,
        outbox: Outbox,
    },
    Command {
        conn: ConnectionId,
        message: ClientMessage,
    },
    /// Round trip reported alongside a ping answered by the transport
    RttReported {
        conn: ConnectionId,
        rtt_ms: f64,
    },
    Disconnected {
        conn: ConnectionId,
    },
    TimerFired {
        key: TimerKey,
        generation: u64,
    },
    TrackResolved {
        room_id: RoomId,
        generation: u64,
        track: Track,
        result: Result<Option<ResolvedTrack>>,
    },
    SearchCompleted {
        conn: ConnectionId,
        tracks: Vec<Track>,
    },
    Inspect(InspectRequest),
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

#[derive(Debug)]
pub enum InspectRequest {
    Rooms(oneshot::Sender<Vec<RoomSummary>>),
    Room(RoomId, oneshot::Sender<Option<RoomDetail>>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoomSummary {
    pub room_id: RoomId,
    pub host_id: UserId,
    pub online_users: usize,
    pub listed_users: usize,
    pub current_track: Option<TrackId>,
    pub queue_len: usize,
    pub play_mode: PlayMode,
    pub vote_active: bool,
    pub pending_graces: usize,
    pub created_at: TimestampMs,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoomDetail {
    #[serde(flatten)]
    pub summary: RoomSummary,
    pub users: Vec<UserView>,
    pub queue: Vec<Track>,
    pub current: Option<ResolvedTrack>,
    /// Play state re-stamped at the time of the query
    pub snapshot: PlayState,
    pub active_vote: Option<VoteStarted>,
}

/// Cloneable front door to a running coordinator
#[derive(Clone)]
pub struct CoordinatorHandle {
    events: mpsc::UnboundedSender<CoordinatorEvent>,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
}

impl CoordinatorHandle {
    fn send(&self, event: CoordinatorEvent) -> Result<()> {
        self.events
            .send(event)
            .map_err(|_| Error::CoordinatorStopped)
    }

    /// Register a new connection; messages for it arrive on `outbox`
    pub fn connect(&self, outbox: Outbox) -> Result<ConnectionId> {
        let conn = uuid::Uuid::new_v4();
        self.send(CoordinatorEvent::Connected { conn, outbox })?;
        Ok(conn)
    }

    pub fn command(&self, conn: ConnectionId, message: ClientMessage) -> Result<()> {
        self.send(CoordinatorEvent::Command { conn, message })
    }

    pub fn report_rtt(&self, conn: ConnectionId, rtt_ms: f64) -> Result<()> {
        self.send(CoordinatorEvent::RttReported { conn, rtt_ms })
    }

    pub fn disconnect(&self, conn: ConnectionId) -> Result<()> {
        self.send(CoordinatorEvent::Disconnected { conn })
    }

    pub async fn rooms(&self) -> Result<Vec<RoomSummary>> {
        let (tx, rx) = oneshot::channel();
        self.send(CoordinatorEvent::Inspect(InspectRequest::Rooms(tx)))?;
        rx.await.map_err(|_| Error::CoordinatorStopped)
    }

    pub async fn room(&self, room_id: impl Into<RoomId>) -> Result<Option<RoomDetail>> {
        let (tx, rx) = oneshot::channel();
        self.send(CoordinatorEvent::Inspect(InspectRequest::Room(
            room_id.into(),
            tx,
        )))?;
        rx.await.map_err(|_| Error::CoordinatorStopped)
    }

    /// Stop the coordinator, cancelling every timer and releasing all rooms
    pub async fn shutdown(&self) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.send(CoordinatorEvent::Shutdown { done })?;
        rx.await.map_err(|_| Error::CoordinatorStopped)
    }

    /// Current server time, for answering pings without queueing
    pub fn now_ms(&self) -> TimestampMs {
        self.clock.now_ms()
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }
}

impl std::fmt::Debug for CoordinatorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorHandle").finish_non_exhaustive()
    }
}

/// Resolved membership of the connection issuing a command
#[derive(Debug, Clone)]
pub(crate) struct Member {
    pub room_id: RoomId,
    pub user_id: UserId,
    pub role: Role,
}

pub struct Coordinator {
    config: CoordinationConfig,
    clock: Arc<dyn Clock>,
    resolver: Arc<dyn TrackResolver>,
    repository: Arc<dyn RoomRepository>,
    metrics: Arc<Metrics>,
    scheduler: Scheduler,
    registry: RoomRegistry,
    timers: TimerSet<TimerKey>,
    events_tx: mpsc::UnboundedSender<CoordinatorEvent>,
    events_rx: mpsc::UnboundedReceiver<CoordinatorEvent>,
}

impl Coordinator {
    pub fn new(
        config: CoordinationConfig,
        clock: Arc<dyn Clock>,
        resolver: Arc<dyn TrackResolver>,
        repository: Arc<dyn RoomRepository>,
    ) -> (Self, CoordinatorHandle) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let metrics = Arc::new(Metrics::new());

        let handle = CoordinatorHandle {
            events: events_tx.clone(),
            clock: clock.clone(),
            metrics: metrics.clone(),
        };

        let coordinator = Self {
            scheduler: Scheduler::new(config.scheduling.clone()),
            config,
            clock,
            resolver,
            repository,
            metrics,
            registry: RoomRegistry::new(),
            timers: TimerSet::new(),
            events_tx,
            events_rx,
        };

        (coordinator, handle)
    }

    /// Create a coordinator and run it on its own task
    pub fn spawn(
        config: CoordinationConfig,
        clock: Arc<dyn Clock>,
        resolver: Arc<dyn TrackResolver>,
        repository: Arc<dyn RoomRepository>,
    ) -> (CoordinatorHandle, JoinHandle<()>) {
        let (coordinator, handle) = Self::new(config, clock, resolver, repository);
        let task = tokio::spawn(coordinator.run());
        (handle, task)
    }

    /// Process events until shutdown
    pub async fn run(mut self) {
        let mut snapshot_tick =
            tokio::time::interval(self.config.scheduling.snapshot_broadcast_interval());
        snapshot_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        snapshot_tick.tick().await;

        info!("Coordinator started");

        loop {
            tokio::select! {
                event = self.events_rx.recv() => {
                    match event {
                        Some(CoordinatorEvent::Shutdown { done }) => {
                            self.shutdown();
                            let _ = done.send(());
                            break;
                        }
                        Some(event) => self.handle_event(event),
                        None => break,
                    }
                }
                _ = snapshot_tick.tick() => self.broadcast_snapshots(),
            }
        }

        info!("Coordinator stopped");
    }

    fn handle_event(&mut self, event: CoordinatorEvent) {
        match event {
            CoordinatorEvent::Connected { conn, outbox } => {
                self.registry.add_connection(conn, outbox);
                self.metrics.connection_opened();
                debug!(conn_id = %conn, "Connection registered");
            }
            CoordinatorEvent::Command { conn, message } => self.handle_command(conn, message),
            CoordinatorEvent::RttReported { conn, rtt_ms } => self.record_rtt(&conn, rtt_ms),
            CoordinatorEvent::Disconnected { conn } => self.handle_disconnect(conn),
            CoordinatorEvent::TimerFired { key, generation } => {
                self.handle_timer(key, generation)
            }
            CoordinatorEvent::TrackResolved {
                room_id,
                generation,
                track,
                result,
            } => self.on_track_resolved(&room_id, generation, track, result),
            CoordinatorEvent::SearchCompleted { conn, tracks } => {
                self.registry
                    .send(&conn, ServerMessage::SearchResults { tracks });
            }
            CoordinatorEvent::Inspect(request) => self.handle_inspect(request),
            CoordinatorEvent::Shutdown { done } => {
                self.shutdown();
                let _ = done.send(());
            }
        }
    }

    fn handle_command(&mut self, conn: ConnectionId, message: ClientMessage) {
        let name = message.name();
        trace!(conn_id = %conn, message = name, "Command received");

        if let Err(err) = self.dispatch(conn, message) {
            self.metrics.command_rejected();
            if err.is_protocol_misuse() {
                debug!(conn_id = %conn, message = name, error = %err, "Command rejected");
            } else {
                warn!(conn_id = %conn, message = name, error = %err, "Command failed");
            }
            self.registry.send(&conn, ServerMessage::error(&err));
        }
    }

    fn dispatch(&mut self, conn: ConnectionId, message: ClientMessage) -> Result<()> {
        match message {
            ClientMessage::Join {
                room_id,
                user_id,
                nickname,
            } => self.join(conn, room_id, user_id, nickname),
            ClientMessage::Leave => self.leave(conn),
            ClientMessage::Ping { id, rtt_ms, .. } => {
                if let Some(rtt_ms) = rtt_ms {
                    self.record_rtt(&conn, rtt_ms);
                }
                let server_time = self.clock.now_ms();
                self.registry
                    .send(&conn, ServerMessage::Pong { id, server_time });
                Ok(())
            }
            ClientMessage::Pause
            | ClientMessage::Resume
            | ClientMessage::Seek { .. }
            | ClientMessage::PlayTrack { .. }
            | ClientMessage::Skip
            | ClientMessage::RemoveTrack { .. }
            | ClientMessage::SetPlayMode { .. } => {
                let action = message.as_vote_action().ok_or_else(|| {
                    Error::InvalidMessage(format!("{} is not a playback action", message.name()))
                })?;
                self.request_action(conn, action)
            }
            ClientMessage::AddTrack { track } => self.add_track(conn, track),
            ClientMessage::HostReport {
                current_time,
                is_playing,
            } => self.host_report(conn, current_time, is_playing),
            ClientMessage::TrackEnded { track_id } => self.track_ended(conn, track_id),
            ClientMessage::SyncRequest => self.sync_request(conn),
            ClientMessage::Propose { action } => self.propose(conn, action),
            ClientMessage::CastVote { vote_id, approve } => self.cast_vote(conn, vote_id, approve),
            ClientMessage::SetRole { user_id, role } => self.set_role(conn, user_id, role),
            ClientMessage::TransferHost { user_id } => self.transfer_host(conn, user_id),
            ClientMessage::Search {
                source,
                keyword,
                page,
            } => self.search(conn, source, keyword, page),
            ClientMessage::Chat { text } => self.chat(conn, text),
        }
    }

    /// Room, user and role behind a joined connection
    pub(crate) fn member(&self, conn: &ConnectionId) -> Result<Member> {
        let (room_id, user_id) = self.registry.binding(conn).ok_or(Error::NotInRoom)?;
        let role = self
            .registry
            .room(&room_id)
            .and_then(|room| room.user(&user_id))
            .map(|user| user.role)
            .ok_or(Error::NotInRoom)?;
        Ok(Member {
            room_id,
            user_id,
            role,
        })
    }

    fn record_rtt(&mut self, conn: &ConnectionId, rtt_ms: f64) {
        if !rtt_ms.is_finite() || rtt_ms < 0.0 {
            return;
        }
        let Some((room_id, user_id)) = self.registry.binding(conn) else {
            return;
        };
        if let Some(user) = self
            .registry
            .room_mut(&room_id)
            .and_then(|room| room.user_mut(&user_id))
        {
            user.rtt_ms = Some(rtt_ms);
        }
    }

    fn arm_timer(&mut self, key: TimerKey, delay: Duration) {
        let events = self.events_tx.clone();
        self.timers.replace(key, delay, move |key, generation| {
            let _ = events.send(CoordinatorEvent::TimerFired { key, generation });
        });
    }

    fn handle_timer(&mut self, key: TimerKey, generation: u64) {
        if !self.timers.accept(&key, generation) {
            trace!(?key, generation, "Ignoring stale timer");
            return;
        }
        match key {
            TimerKey::RoomDeletion(room_id) => self.on_room_deletion_timer(&room_id),
            TimerKey::RoleGrace(room_id, user_id) => self.on_role_grace_expired(&room_id, &user_id),
            TimerKey::VoteTimeout(room_id, vote_id) => self.on_vote_timeout(&room_id, &vote_id),
        }
    }

    /// Mirror a room's summary into the repository
    fn persist(&self, room_id: &str) {
        if let Some(room) = self.registry.room(room_id) {
            self.repository.set(RoomRecord {
                room_id: room.id.clone(),
                host_id: room.host_id.clone(),
                member_count: room.online_count(),
                play_mode: room.play_mode,
                created_at: room.created_at,
            });
        }
    }

    fn summary(&self, room_id: &str) -> Option<RoomSummary> {
        let room = self.registry.room(room_id)?;
        Some(RoomSummary {
            room_id: room.id.clone(),
            host_id: room.host_id.clone(),
            online_users: room.online_count(),
            listed_users: room.users().len(),
            current_track: room.current_track.as_ref().map(|t| t.track.id.clone()),
            queue_len: room.queue.len(),
            play_mode: room.play_mode,
            vote_active: room.active_vote.is_some(),
            pending_graces: room.graces.len(),
            created_at: room.created_at,
        })
    }

    fn handle_inspect(&self, request: InspectRequest) {
        match request {
            InspectRequest::Rooms(reply) => {
                let mut rooms: Vec<RoomSummary> = self
                    .registry
                    .rooms()
                    .filter_map(|room| self.summary(&room.id))
                    .collect();
                rooms.sort_by(|a, b| a.room_id.cmp(&b.room_id));
                let _ = reply.send(rooms);
            }
            InspectRequest::Room(room_id, reply) => {
                let now = self.clock.now_ms();
                let detail = self.summary(&room_id).and_then(|summary| {
                    let room = self.registry.room(&room_id)?;
                    Some(RoomDetail {
                        summary,
                        users: room.user_views(),
                        queue: room.queue.clone(),
                        current: room.current_track.clone(),
                        snapshot: room.play_state.snapshot_at(now),
                        active_vote: room.active_vote.as_ref().map(|v| v.started()),
                    })
                });
                let _ = reply.send(detail);
            }
        }
    }

    fn shutdown(&mut self) {
        let cancelled = self.timers.cancel_all();
        for conn in self.registry.connection_ids() {
            self.repository.remove_socket_mapping(&conn);
        }
        let rooms = self.registry.clear();
        for room in &rooms {
            self.repository.delete(&room.id);
            self.metrics.room_deleted();
        }
        info!(
            timers = cancelled,
            rooms = rooms.len(),
            "Coordinator shut down"
        );
    }
}
