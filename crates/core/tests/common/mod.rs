//! Shared harness for coordinator integration tests
//!
//! Tests run on a paused tokio clock; `wait` lets every pending event and
//! timer settle before returning.

#![allow(dead_code)]

use cosync_core::room::ConnectionId;
use cosync_core::{
    ClientMessage, CoordinationConfig, Coordinator, CoordinatorHandle, InMemoryRoomRepository,
    MonotonicClock, ServerMessage, StaticResolver, Track,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub const ROOM: &str = "room-1";

pub fn track(id: &str) -> Track {
    Track {
        id: id.to_string(),
        source: "local".to_string(),
        title: format!("Track {id}"),
        artist: "Test Artist".to_string(),
        duration_secs: Some(180.0),
    }
}

pub struct Harness {
    pub handle: CoordinatorHandle,
    pub resolver: Arc<StaticResolver>,
    pub repository: Arc<InMemoryRoomRepository>,
}

impl Harness {
    pub fn start() -> Self {
        Self::with_config(CoordinationConfig::default())
    }

    pub fn with_config(config: CoordinationConfig) -> Self {
        Self::with_parts(config, StaticResolver::new())
    }

    pub fn with_parts(config: CoordinationConfig, resolver: StaticResolver) -> Self {
        init_tracing();
        let resolver = Arc::new(resolver);
        let repository = Arc::new(InMemoryRoomRepository::new());
        let (handle, _task) = Coordinator::spawn(
            config,
            Arc::new(MonotonicClock::starting_at(1_000_000)),
            resolver.clone(),
            repository.clone(),
        );
        Self {
            handle,
            resolver,
            repository,
        }
    }

    /// Make `ids` playable
    pub fn catalog(&self, ids: &[&str]) {
        for id in ids {
            self.resolver.add(track(id), format!("https://cdn.test/{id}.mp3"));
        }
    }

    pub fn connect(&self) -> TestClient {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = self.handle.connect(tx).expect("coordinator running");
        TestClient {
            conn,
            user_id: String::new(),
            handle: self.handle.clone(),
            rx,
        }
    }

    /// Connect and join `ROOM`, consuming the initial ROOM_STATE
    pub async fn join(&self, user_id: &str) -> TestClient {
        let mut client = self.connect();
        client.join(user_id).await;
        client
    }
}

pub struct TestClient {
    pub conn: ConnectionId,
    pub user_id: String,
    handle: CoordinatorHandle,
    rx: mpsc::UnboundedReceiver<ServerMessage>,
}

impl TestClient {
    pub fn send(&self, message: ClientMessage) {
        self.handle
            .command(self.conn, message)
            .expect("coordinator running");
    }

    pub async fn join(&mut self, user_id: &str) -> cosync_core::RoomState {
        self.user_id = user_id.to_string();
        self.send(ClientMessage::Join {
            room_id: ROOM.to_string(),
            user_id: user_id.to_string(),
            nickname: user_id.to_uppercase(),
        });
        self.expect(|m| match m {
            ServerMessage::RoomState(state) => Some(state.clone()),
            _ => None,
        })
        .await
    }

    /// Wait for the first message `pick` accepts, skipping others
    pub async fn expect<T>(&mut self, mut pick: impl FnMut(&ServerMessage) -> Option<T>) -> T {
        let deadline = Duration::from_secs(300);
        let found = tokio::time::timeout(deadline, async {
            while let Some(message) = self.rx.recv().await {
                if let Some(value) = pick(&message) {
                    return Some(value);
                }
            }
            None
        })
        .await;
        match found {
            Ok(Some(value)) => value,
            Ok(None) => panic!("{}: outbox closed", self.user_id),
            Err(_) => panic!("{}: expected message never arrived", self.user_id),
        }
    }

    pub async fn expect_error(&mut self) -> cosync_core::ErrorCode {
        self.expect(|m| match m {
            ServerMessage::Error { code, .. } => Some(*code),
            _ => None,
        })
        .await
    }

    /// Everything received so far
    pub fn drain(&mut self) -> Vec<ServerMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = self.rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    pub fn disconnect(&self) {
        self.handle
            .disconnect(self.conn)
            .expect("coordinator running");
    }
}

/// Route coordinator logs to the test output; `RUST_LOG` picks the level
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Let virtual time pass, processing everything due on the way
pub async fn wait(duration: Duration) {
    tokio::time::sleep(duration).await;
}

/// Let queued events settle without moving the clock noticeably
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
