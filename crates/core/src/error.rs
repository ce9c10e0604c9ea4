//! Error types for cosync core

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for cosync core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur while coordinating a room
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration value out of range or inconsistent
    #[error("Configuration error: {0}")]
    InvalidConfig(String),

    /// Configuration file could not be read
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be parsed
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Wire message could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Frame was well-formed JSON but not a valid command in this context
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Connection has not joined a room yet
    #[error("Not in a room")]
    NotInRoom,

    /// Role lacks the capability for the requested action
    #[error("Permission denied: {role} cannot {action}")]
    PermissionDenied {
        /// Role of the requester
        role: String,
        /// Human readable action name
        action: String,
    },

    /// A vote is already running in this room
    #[error("A vote is already in progress in room {room_id}")]
    VoteInProgress {
        /// Room the vote belongs to
        room_id: String,
    },

    /// No vote is running, or the ballot references a finished vote
    #[error("No active vote with id {vote_id}")]
    NoActiveVote {
        /// Vote id named by the ballot
        vote_id: String,
    },

    /// User already cast a ballot in this vote
    #[error("User {user_id} already voted")]
    AlreadyVoted {
        /// Voter id
        user_id: String,
    },

    /// Track id is neither queued nor current
    #[error("Unknown track: {0}")]
    UnknownTrack(String),

    /// Target user is not a member of the room
    #[error("Unknown user: {0}")]
    UnknownUser(String),

    /// External collaborator (track resolver, repository) failed
    #[error("Collaborator error: {0}")]
    Collaborator(String),

    /// Coordinator event loop has stopped
    #[error("Coordinator stopped")]
    CoordinatorStopped,
}

impl Error {
    /// Wire code reported to the originating client
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::InvalidConfig(_) | Error::Io(_) | Error::ConfigParse(_) => {
                ErrorCode::InvalidConfig
            }
            Error::Serialization(_) | Error::InvalidMessage(_) => ErrorCode::InvalidMessage,
            Error::NotInRoom | Error::UnknownUser(_) => ErrorCode::NotInRoom,
            Error::PermissionDenied { .. } => ErrorCode::PermissionDenied,
            Error::VoteInProgress { .. } => ErrorCode::VoteInProgress,
            Error::NoActiveVote { .. } => ErrorCode::NoActiveVote,
            Error::AlreadyVoted { .. } => ErrorCode::AlreadyVoted,
            Error::UnknownTrack(_) => ErrorCode::UnknownTrack,
            Error::Collaborator(_) | Error::CoordinatorStopped => ErrorCode::Internal,
        }
    }

    /// Whether this error is protocol misuse by the client
    ///
    /// Misuse is reported back to the originating connection only and never
    /// broadcast or escalated.
    pub fn is_protocol_misuse(&self) -> bool {
        matches!(
            self,
            Error::InvalidMessage(_)
                | Error::NotInRoom
                | Error::UnknownUser(_)
                | Error::PermissionDenied { .. }
                | Error::VoteInProgress { .. }
                | Error::NoActiveVote { .. }
                | Error::AlreadyVoted { .. }
                | Error::UnknownTrack(_)
        )
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Collaborator(err.to_string())
    }
}

/// Reason codes carried by `ERROR` frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    AlreadyVoted,
    VoteInProgress,
    NoActiveVote,
    PermissionDenied,
    NotInRoom,
    UnknownTrack,
    InvalidMessage,
    InvalidConfig,
    Internal,
}
