//! WebSocket transport for cosync
//!
//! - [`SyncServer`] accepts WebSocket connections and bridges JSON text
//!   frames to a running coordinator through its [`CoordinatorHandle`].
//! - [`SyncClient`] connects to a server, keeps its clock estimate current
//!   and drives an [`AudioOutput`] through a [`PlaybackSynchronizer`].
//!
//! [`CoordinatorHandle`]: cosync_core::CoordinatorHandle
//! [`AudioOutput`]: cosync_core::AudioOutput
//! [`PlaybackSynchronizer`]: cosync_core::PlaybackSynchronizer

pub mod client;
pub mod error;
pub mod handler;
pub mod server;

pub use client::{ClientOptions, ClientStatus, SyncClient};
pub use error::{Error, Result};
pub use server::{SyncServer, SyncServerHandle};
