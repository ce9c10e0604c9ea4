//! Server-side room state
//!
//! [`Room`] is plain data plus the queries the coordinator needs. It never
//! arms timers or sends messages itself.

mod registry;

pub use registry::{Connection, Outbox, RoomRegistry};

use crate::consensus::Vote;
use crate::permissions::Role;
use crate::protocol::{
    ChatMessage, PlayMode, PlayState, ResolvedTrack, RoomId, RoomState, Track, TrackId, UserId,
    UserView,
};
use crate::time::TimestampMs;
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet, VecDeque};

/// Identifies one transport connection
pub type ConnectionId = uuid::Uuid;

#[derive(Debug, Clone)]
pub struct User {
    pub id: UserId,
    pub nickname: String,
    pub role: Role,
    /// `None` while the user is offline inside a grace period
    pub connection: Option<ConnectionId>,
    /// Position in join order
    pub joined_seq: u64,
    /// Last round trip reported by the user's client
    pub rtt_ms: Option<f64>,
}

impl User {
    pub fn is_online(&self) -> bool {
        self.connection.is_some()
    }

    pub fn view(&self) -> UserView {
        UserView {
            user_id: self.id.clone(),
            nickname: self.nickname.clone(),
            role: self.role,
            online: self.is_online(),
        }
    }
}

/// A disconnected privileged user whose role is being held
#[derive(Debug, Clone)]
pub struct GracePeriod {
    pub user_id: UserId,
    pub role: Role,
    pub started_at: TimestampMs,
}

/// Per-room debounce state for queue commands
#[derive(Debug, Default)]
pub struct Debounce {
    last_skip_at: Option<TimestampMs>,
    last_play: Option<(TrackId, TimestampMs)>,
    ended_track: Option<TrackId>,
}

impl Debounce {
    /// Whether a skip at `now` is outside the debounce window
    pub fn allow_skip(&mut self, now: TimestampMs, window_ms: u64) -> bool {
        if let Some(last) = self.last_skip_at {
            if now.saturating_sub(last) < window_ms {
                return false;
            }
        }
        self.last_skip_at = Some(now);
        true
    }

    /// Whether a play request for `track_id` is not a duplicate
    pub fn allow_play(&mut self, track_id: &str, now: TimestampMs, window_ms: u64) -> bool {
        if let Some((last_id, last_at)) = &self.last_play {
            if last_id == track_id && now.saturating_sub(*last_at) < window_ms {
                return false;
            }
        }
        self.last_play = Some((track_id.to_string(), now));
        true
    }

    /// True the first time a given track is reported ended
    pub fn accept_track_end(&mut self, track_id: &str) -> bool {
        if self.ended_track.as_deref() == Some(track_id) {
            return false;
        }
        self.ended_track = Some(track_id.to_string());
        true
    }

    /// Forget the ended track when a new selection starts playing
    pub fn track_started(&mut self) {
        self.ended_track = None;
    }
}

/// Why the next track is being chosen
#[derive(Debug, Clone, PartialEq)]
pub enum Advance {
    /// A specific queued track was requested
    Select(TrackId),
    /// Explicit skip
    Skip,
    /// The current track finished
    Ended,
}

/// Track resolution in flight
#[derive(Debug)]
pub struct PendingSelection {
    pub generation: u64,
    /// Remaining tracks to try if the current one fails
    pub candidates: VecDeque<Track>,
}

#[derive(Debug)]
pub struct Room {
    pub id: RoomId,
    /// Always set; may name a user who is no longer present (orphaned)
    pub host_id: UserId,
    users: Vec<User>,
    pub current_track: Option<ResolvedTrack>,
    pub queue: Vec<Track>,
    pub play_state: PlayState,
    pub play_mode: PlayMode,
    pub active_vote: Option<Vote>,
    pub graces: HashMap<UserId, GracePeriod>,
    /// Hosts whose grace expired; they come back as admins
    pub former_hosts: HashSet<UserId>,
    pub debounce: Debounce,
    chat: VecDeque<ChatMessage>,
    next_join_seq: u64,
    pub selection_generation: u64,
    pub pending_selection: Option<PendingSelection>,
    /// Deletion timer fired while a role grace was pending
    pub deletion_deferred: bool,
    pub created_at: TimestampMs,
}

impl Room {
    pub fn new(id: RoomId, host_id: UserId, now: TimestampMs) -> Self {
        Self {
            id,
            host_id,
            users: Vec::new(),
            current_track: None,
            queue: Vec::new(),
            play_state: PlayState::paused(0.0, now),
            play_mode: PlayMode::default(),
            active_vote: None,
            graces: HashMap::new(),
            former_hosts: HashSet::new(),
            debounce: Debounce::default(),
            chat: VecDeque::new(),
            next_join_seq: 0,
            selection_generation: 0,
            pending_selection: None,
            deletion_deferred: false,
            created_at: now,
        }
    }

    pub fn users(&self) -> &[User] {
        &self.users
    }

    pub fn user(&self, user_id: &str) -> Option<&User> {
        self.users.iter().find(|u| u.id == user_id)
    }

    pub fn user_mut(&mut self, user_id: &str) -> Option<&mut User> {
        self.users.iter_mut().find(|u| u.id == user_id)
    }

    pub fn add_user(
        &mut self,
        user_id: UserId,
        nickname: String,
        role: Role,
        connection: ConnectionId,
    ) -> &User {
        let joined_seq = self.next_join_seq;
        self.next_join_seq += 1;
        self.users.push(User {
            id: user_id,
            nickname,
            role,
            connection: Some(connection),
            joined_seq,
            rtt_ms: None,
        });
        &self.users[self.users.len() - 1]
    }

    pub fn remove_user(&mut self, user_id: &str) -> Option<User> {
        let index = self.users.iter().position(|u| u.id == user_id)?;
        Some(self.users.remove(index))
    }

    pub fn online_users(&self) -> impl Iterator<Item = &User> {
        self.users.iter().filter(|u| u.is_online())
    }

    pub fn online_count(&self) -> usize {
        self.online_users().count()
    }

    /// Connections of every online member
    pub fn connections(&self) -> Vec<ConnectionId> {
        self.users.iter().filter_map(|u| u.connection).collect()
    }

    /// The host is neither online nor held by a grace period
    pub fn host_is_orphaned(&self) -> bool {
        match self.user(&self.host_id) {
            Some(host) => !host.is_online() && !self.graces.contains_key(&self.host_id),
            None => true,
        }
    }

    /// Best online successor for the host seat
    ///
    /// The earliest-joined online admin, else the earliest-joined online
    /// member.
    pub fn host_candidate(&self) -> Option<UserId> {
        let mut candidates: Vec<&User> = self
            .online_users()
            .filter(|u| u.id != self.host_id)
            .collect();
        candidates.sort_by_key(|u| u.joined_seq);
        candidates
            .iter()
            .find(|u| u.role == Role::Admin)
            .or_else(|| candidates.iter().find(|u| u.role == Role::Member))
            .map(|u| u.id.clone())
    }

    /// Highest round trip reported by an online member
    pub fn worst_rtt(&self) -> Option<f64> {
        self.online_users()
            .filter_map(|u| u.rtt_ms)
            .fold(None, |worst, rtt| match worst {
                Some(w) if w >= rtt => Some(w),
                _ => Some(rtt),
            })
    }

    pub fn user_views(&self) -> Vec<UserView> {
        self.users.iter().map(User::view).collect()
    }

    pub fn push_chat(&mut self, message: ChatMessage, limit: usize) {
        self.chat.push_back(message);
        while self.chat.len() > limit {
            self.chat.pop_front();
        }
    }

    pub fn chat_history(&self) -> Vec<ChatMessage> {
        self.chat.iter().cloned().collect()
    }

    pub fn queue_position(&self, track_id: &str) -> Option<usize> {
        self.queue.iter().position(|t| t.id == track_id)
    }

    /// Tracks to try, in order, for the next selection
    ///
    /// Covers the queue at most once; the caller walks the list until one
    /// resolves.
    pub fn candidates(&self, advance: &Advance) -> Vec<Track> {
        let len = self.queue.len();
        if len == 0 {
            return Vec::new();
        }
        let current = self
            .current_track
            .as_ref()
            .and_then(|t| self.queue_position(&t.track.id));
        let rotated = |start: usize| -> Vec<Track> {
            (0..len)
                .map(|i| self.queue[(start + i) % len].clone())
                .collect()
        };

        match advance {
            Advance::Select(track_id) => match self.queue_position(track_id) {
                Some(start) => rotated(start),
                None => Vec::new(),
            },
            Advance::Ended if self.play_mode == PlayMode::RepeatOne => {
                rotated(current.unwrap_or(0))
            }
            _ => match self.play_mode {
                PlayMode::Sequential => {
                    let start = current.map(|i| i + 1).unwrap_or(0);
                    self.queue[start.min(len)..].to_vec()
                }
                PlayMode::RepeatAll | PlayMode::RepeatOne => {
                    rotated(current.map(|i| (i + 1) % len).unwrap_or(0))
                }
                PlayMode::Shuffle => {
                    let mut others: Vec<Track> = self
                        .queue
                        .iter()
                        .enumerate()
                        .filter(|(i, _)| Some(*i) != current)
                        .map(|(_, t)| t.clone())
                        .collect();
                    others.shuffle(&mut rand::thread_rng());
                    if others.is_empty() {
                        self.queue.clone()
                    } else {
                        others
                    }
                }
            },
        }
    }

    /// Snapshot for a user who just joined
    pub fn state_for(&self, user_id: &str, now: TimestampMs) -> RoomState {
        RoomState {
            room_id: self.id.clone(),
            user_id: user_id.to_string(),
            host_id: self.host_id.clone(),
            users: self.user_views(),
            current_track: self.current_track.clone(),
            queue: self.queue.clone(),
            play_mode: self.play_mode,
            play_state: self.play_state.snapshot_at(now),
            active_vote: self.active_vote.as_ref().map(Vote::started),
            chat_history: self.chat_history(),
            server_time: now,
        }
    }
}
