//! cosync core - coordination engine for synchronized listening rooms
//!
//! This crate holds everything a cosync deployment needs apart from the
//! wire transport: the message protocol, clock synchronization, scheduled
//! playback, room membership with role grace periods, and quorum voting.
//!
//! # Architecture
//!
//! The server side is a single [`Coordinator`] task that owns all room
//! state. Transports talk to it through a cloneable [`CoordinatorHandle`]:
//! - `connect` registers a connection and its outbound queue
//! - `command` forwards a decoded [`ClientMessage`]
//! - `disconnect` starts the departure path (grace periods, host failover)
//!
//! The client side is made of [`ClockSync`], which estimates the server
//! clock from ping round trips, and [`PlaybackSynchronizer`], which applies
//! scheduled actions at the right moment and corrects drift against
//! periodic snapshots.
//!
//! Track lookup and room persistence are external collaborators behind the
//! [`TrackResolver`] and [`RoomRepository`] traits.
//!
//! # Example
//!
//! ```ignore
//! use cosync_core::{Coordinator, CoordinationConfig, InMemoryRoomRepository, MonotonicClock, StaticResolver};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> cosync_core::Result<()> {
//!     let (handle, _task) = Coordinator::spawn(
//!         CoordinationConfig::default(),
//!         Arc::new(MonotonicClock::new()),
//!         Arc::new(StaticResolver::new()),
//!         Arc::new(InMemoryRoomRepository::new()),
//!     );
//!
//!     let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
//!     let conn = handle.connect(tx)?;
//!     handle.command(conn, cosync_core::ClientMessage::SyncRequest)?;
//!     println!("{:?}", rx.recv().await);
//!     Ok(())
//! }
//! ```

#![warn(clippy::all)]

pub mod clock_sync;
pub mod collaborators;
pub mod config;
pub mod consensus;
pub mod coordinator;
pub mod error;
pub mod metrics;
pub mod permissions;
pub mod playback;
pub mod protocol;
pub mod room;
pub mod scheduler;
pub mod time;
pub mod timer;

pub use clock_sync::{ClockSample, ClockSync, SyncPhase};
pub use collaborators::{
    InMemoryRoomRepository, RoomRecord, RoomRepository, SocketMapping, StaticResolver,
    TrackResolver,
};
pub use config::CoordinationConfig;
pub use coordinator::{Coordinator, CoordinatorHandle, RoomDetail, RoomSummary};
pub use error::{Error, ErrorCode, Result};
pub use metrics::{Metrics, MetricsSnapshot};
pub use permissions::Role;
pub use playback::{AudioOutput, Correction, PlaybackPhase, PlaybackSynchronizer, SimulatedOutput};
pub use protocol::{
    ClientMessage, PlayMode, PlayState, ResolvedTrack, RoomState, ScheduledAction, ServerMessage,
    Track, VoteAction,
};
pub use time::{Clock, ManualClock, MonotonicClock, SystemClock, TimestampMs};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
