//! Wire protocol
//!
//! JSON text frames tagged by `type`. Timestamps are server-clock epoch
//! milliseconds; positions are seconds.

use crate::error::ErrorCode;
use crate::permissions::Role;
use crate::time::TimestampMs;
use crate::Result;
use serde::{Deserialize, Serialize};

pub type RoomId = String;
pub type UserId = String;
pub type TrackId = String;
pub type VoteId = String;

/// Reference playback position
///
/// The actual position at time `t` is `current_time + (t - server_timestamp)`
/// while playing (elapsed clamped at zero) and `current_time` otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlayState {
    pub is_playing: bool,
    pub current_time: f64,
    pub server_timestamp: TimestampMs,
}

impl PlayState {
    pub fn paused(current_time: f64, server_timestamp: TimestampMs) -> Self {
        Self {
            is_playing: false,
            current_time,
            server_timestamp,
        }
    }

    pub fn playing(current_time: f64, server_timestamp: TimestampMs) -> Self {
        Self {
            is_playing: true,
            current_time,
            server_timestamp,
        }
    }

    /// Estimated position at server time `now`
    pub fn position_at(&self, now: TimestampMs) -> f64 {
        if self.is_playing {
            let elapsed_ms = now.saturating_sub(self.server_timestamp);
            self.current_time + elapsed_ms as f64 / 1000.0
        } else {
            self.current_time
        }
    }

    /// The same state re-stamped at `now`, for snapshots
    ///
    /// A state stamped in the future (a transition still in flight) is
    /// returned unchanged.
    pub fn snapshot_at(&self, now: TimestampMs) -> PlayState {
        if now <= self.server_timestamp {
            return *self;
        }
        PlayState {
            is_playing: self.is_playing,
            current_time: self.position_at(now),
            server_timestamp: now,
        }
    }
}

impl Default for PlayState {
    fn default() -> Self {
        Self::paused(0.0, 0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Play,
    Pause,
    Seek,
    Resume,
}

/// A playback transition to be applied at `server_time_to_execute`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScheduledAction {
    pub kind: ActionKind,
    /// State after the transition, stamped at the execution time
    pub play_state: PlayState,
    pub server_time_to_execute: TimestampMs,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: TrackId,
    pub source: String,
    pub title: String,
    #[serde(default)]
    pub artist: String,
    #[serde(default)]
    pub duration_secs: Option<f64>,
}

/// A track with everything needed to play it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedTrack {
    pub track: Track,
    pub stream_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lyric: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayMode {
    #[default]
    Sequential,
    RepeatAll,
    RepeatOne,
    Shuffle,
}

/// Action that can be proposed for a vote
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VoteAction {
    Skip,
    PlayTrack { track_id: TrackId },
    Pause,
    Resume,
    Seek { position: f64 },
    RemoveTrack { track_id: TrackId },
    SetPlayMode { mode: PlayMode },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailReason {
    HostVeto,
    Rejected,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteStarted {
    pub id: VoteId,
    pub action: VoteAction,
    pub initiator_id: UserId,
    /// Approvals so far
    pub votes: usize,
    pub required_votes: usize,
    pub total_users: usize,
    pub expires_at: TimestampMs,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteResult {
    pub id: VoteId,
    pub passed: bool,
    pub action: VoteAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailReason>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserView {
    pub user_id: UserId,
    pub nickname: String,
    pub role: Role,
    pub online: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub user_id: UserId,
    pub nickname: String,
    pub text: String,
    pub sent_at: TimestampMs,
}

/// Full room state sent to a connection after it joins
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomState {
    pub room_id: RoomId,
    /// The receiving user
    pub user_id: UserId,
    pub host_id: UserId,
    pub users: Vec<UserView>,
    pub current_track: Option<ResolvedTrack>,
    pub queue: Vec<Track>,
    pub play_mode: PlayMode,
    pub play_state: PlayState,
    pub active_vote: Option<VoteStarted>,
    pub chat_history: Vec<ChatMessage>,
    pub server_time: TimestampMs,
}

/// Messages sent by clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    Join {
        room_id: RoomId,
        user_id: UserId,
        nickname: String,
    },
    Leave,
    Ping {
        id: u64,
        ts: TimestampMs,
        /// Sender's current median round trip, for margin sizing
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rtt_ms: Option<f64>,
    },
    Pause,
    Resume,
    Seek {
        position: f64,
    },
    PlayTrack {
        track_id: TrackId,
    },
    Skip,
    AddTrack {
        track: Track,
    },
    RemoveTrack {
        track_id: TrackId,
    },
    SetPlayMode {
        mode: PlayMode,
    },
    HostReport {
        current_time: f64,
        is_playing: bool,
    },
    TrackEnded {
        track_id: TrackId,
    },
    SyncRequest,
    Propose {
        action: VoteAction,
    },
    CastVote {
        vote_id: VoteId,
        approve: bool,
    },
    SetRole {
        user_id: UserId,
        role: Role,
    },
    TransferHost {
        user_id: UserId,
    },
    Search {
        source: String,
        keyword: String,
        #[serde(default = "default_page")]
        page: u32,
    },
    Chat {
        text: String,
    },
}

fn default_page() -> u32 {
    1
}

impl ClientMessage {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Message type name, for logging
    pub fn name(&self) -> &'static str {
        match self {
            ClientMessage::Join { .. } => "JOIN",
            ClientMessage::Leave => "LEAVE",
            ClientMessage::Ping { .. } => "PING",
            ClientMessage::Pause => "PAUSE",
            ClientMessage::Resume => "RESUME",
            ClientMessage::Seek { .. } => "SEEK",
            ClientMessage::PlayTrack { .. } => "PLAY_TRACK",
            ClientMessage::Skip => "SKIP",
            ClientMessage::AddTrack { .. } => "ADD_TRACK",
            ClientMessage::RemoveTrack { .. } => "REMOVE_TRACK",
            ClientMessage::SetPlayMode { .. } => "SET_PLAY_MODE",
            ClientMessage::HostReport { .. } => "HOST_REPORT",
            ClientMessage::TrackEnded { .. } => "TRACK_ENDED",
            ClientMessage::SyncRequest => "SYNC_REQUEST",
            ClientMessage::Propose { .. } => "PROPOSE",
            ClientMessage::CastVote { .. } => "CAST_VOTE",
            ClientMessage::SetRole { .. } => "SET_ROLE",
            ClientMessage::TransferHost { .. } => "TRANSFER_HOST",
            ClientMessage::Search { .. } => "SEARCH",
            ClientMessage::Chat { .. } => "CHAT",
        }
    }

    /// The privileged action this command maps to, if it is one that a
    /// member may propose as a vote instead
    pub fn as_vote_action(&self) -> Option<VoteAction> {
        match self {
            ClientMessage::Pause => Some(VoteAction::Pause),
            ClientMessage::Resume => Some(VoteAction::Resume),
            ClientMessage::Seek { position } => Some(VoteAction::Seek {
                position: *position,
            }),
            ClientMessage::PlayTrack { track_id } => Some(VoteAction::PlayTrack {
                track_id: track_id.clone(),
            }),
            ClientMessage::Skip => Some(VoteAction::Skip),
            ClientMessage::RemoveTrack { track_id } => Some(VoteAction::RemoveTrack {
                track_id: track_id.clone(),
            }),
            ClientMessage::SetPlayMode { mode } => Some(VoteAction::SetPlayMode { mode: *mode }),
            _ => None,
        }
    }
}

/// Messages sent by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    Pong {
        id: u64,
        server_time: TimestampMs,
    },
    RoomState(RoomState),
    ScheduledAction(ScheduledAction),
    SyncSnapshot(PlayState),
    TrackChanged {
        track: Option<ResolvedTrack>,
    },
    QueueUpdated {
        queue: Vec<Track>,
        play_mode: PlayMode,
    },
    VoteStarted(VoteStarted),
    VoteUpdated {
        id: VoteId,
        approvals: usize,
        rejections: usize,
    },
    VoteResult(VoteResult),
    UserJoined {
        user: UserView,
    },
    UserLeft {
        user_id: UserId,
    },
    RoleChanged {
        user_id: UserId,
        role: Role,
    },
    SearchResults {
        tracks: Vec<Track>,
    },
    Chat {
        message: ChatMessage,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
}

impl ServerMessage {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn error(err: &crate::Error) -> Self {
        ServerMessage::Error {
            code: err.code(),
            message: err.to_string(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ServerMessage::Pong { .. } => "PONG",
            ServerMessage::RoomState(_) => "ROOM_STATE",
            ServerMessage::ScheduledAction(_) => "SCHEDULED_ACTION",
            ServerMessage::SyncSnapshot(_) => "SYNC_SNAPSHOT",
            ServerMessage::TrackChanged { .. } => "TRACK_CHANGED",
            ServerMessage::QueueUpdated { .. } => "QUEUE_UPDATED",
            ServerMessage::VoteStarted(_) => "VOTE_STARTED",
            ServerMessage::VoteUpdated { .. } => "VOTE_UPDATED",
            ServerMessage::VoteResult(_) => "VOTE_RESULT",
            ServerMessage::UserJoined { .. } => "USER_JOINED",
            ServerMessage::UserLeft { .. } => "USER_LEFT",
            ServerMessage::RoleChanged { .. } => "ROLE_CHANGED",
            ServerMessage::SearchResults { .. } => "SEARCH_RESULTS",
            ServerMessage::Chat { .. } => "CHAT",
            ServerMessage::Error { .. } => "ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_estimate() {
        let state = PlayState::playing(10.0, 1_000);
        assert_eq!(state.position_at(3_500), 12.5);
        // Clamped when asked about a time before the stamp
        assert_eq!(state.position_at(500), 10.0);

        let paused = PlayState::paused(42.0, 1_000);
        assert_eq!(paused.position_at(99_000), 42.0);
    }

    #[test]
    fn test_client_message_tags() {
        let msg = ClientMessage::from_json(
            r#"{"type":"JOIN","room_id":"r1","user_id":"u1","nickname":"Ann"}"#,
        )
        .unwrap();
        assert_eq!(msg.name(), "JOIN");

        let json = ClientMessage::CastVote {
            vote_id: "v1".into(),
            approve: true,
        }
        .to_json()
        .unwrap();
        assert!(json.contains(r#""type":"CAST_VOTE""#));

        let search = ClientMessage::from_json(r#"{"type":"SEARCH","source":"demo","keyword":"x"}"#)
            .unwrap();
        assert!(matches!(search, ClientMessage::Search { page: 1, .. }));
    }

    #[test]
    fn test_propose_payload() {
        let msg = ClientMessage::from_json(
            r#"{"type":"PROPOSE","action":{"kind":"seek","position":30.5}}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::Propose {
                action: VoteAction::Seek { position: 30.5 }
            }
        );
    }

    #[test]
    fn test_scheduled_action_is_flat() {
        let msg = ServerMessage::ScheduledAction(ScheduledAction {
            kind: ActionKind::Pause,
            play_state: PlayState::paused(5.0, 2_000),
            server_time_to_execute: 2_000,
        });
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "SCHEDULED_ACTION");
        assert_eq!(value["kind"], "pause");
        assert_eq!(value["server_time_to_execute"], 2_000);
        assert_eq!(value["play_state"]["current_time"], 5.0);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let err = ClientMessage::from_json(r#"{"type":"SELF_DESTRUCT"}"#).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidMessage);
    }
}
