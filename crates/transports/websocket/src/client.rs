//! WebSocket sync client
//!
//! A [`SyncClient`] owns one background session task that:
//! - pings the server on the [`ClockSync`] cadence and folds pongs into
//!   the offset estimate
//! - feeds room state, track changes, scheduled actions and snapshots to a
//!   [`PlaybackSynchronizer`]
//! - reports the local position while it holds the host seat, and polls
//!   for snapshots otherwise
//! - notices the local end of a track and reports it
//!
//! Every decoded server message is also handed to the owner through
//! [`SyncClient::next_message`].

use crate::{Error, Result};
use cosync_core::config::{ClockSyncConfig, DriftConfig};
use cosync_core::{
    AudioOutput, ClientMessage, Clock, ClockSync, PlaybackPhase, PlaybackSynchronizer,
    ResolvedTrack, Role, ServerMessage, SystemClock, TimestampMs,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// How often local playback is checked against the track duration
const END_CHECK_INTERVAL: Duration = Duration::from_millis(250);

/// Positions this close to the duration count as finished
const END_TOLERANCE_SECS: f64 = 0.05;

/// Who to join as, and how to keep in sync
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub room_id: String,
    pub user_id: String,
    pub nickname: String,
    pub clock: ClockSyncConfig,
    pub drift: DriftConfig,
}

impl ClientOptions {
    pub fn new(
        room_id: impl Into<String>,
        user_id: impl Into<String>,
        nickname: impl Into<String>,
    ) -> Self {
        Self {
            room_id: room_id.into(),
            user_id: user_id.into(),
            nickname: nickname.into(),
            clock: ClockSyncConfig::default(),
            drift: DriftConfig::default(),
        }
    }
}

/// Latest view of the session, published after every change
#[derive(Debug, Clone, PartialEq)]
pub struct ClientStatus {
    pub joined: bool,
    pub is_host: bool,
    pub calibrated: bool,
    pub offset_ms: Option<f64>,
    pub median_rtt_ms: Option<f64>,
    pub phase: PlaybackPhase,
}

impl Default for ClientStatus {
    fn default() -> Self {
        Self {
            joined: false,
            is_host: false,
            calibrated: false,
            offset_ms: None,
            median_rtt_ms: None,
            phase: PlaybackPhase::Idle,
        }
    }
}

/// Connected client session
pub struct SyncClient {
    outgoing: mpsc::UnboundedSender<ClientMessage>,
    messages: mpsc::UnboundedReceiver<ServerMessage>,
    status: watch::Receiver<ClientStatus>,
    task: JoinHandle<Result<()>>,
}

impl SyncClient {
    /// Connect to `url` and join the room named in `options`
    pub async fn connect(
        url: &str,
        options: ClientOptions,
        output: Box<dyn AudioOutput>,
    ) -> Result<Self> {
        Self::connect_with_clock(url, options, output, Arc::new(SystemClock)).await
    }

    /// Like [`connect`](Self::connect) with an explicit local clock
    pub async fn connect_with_clock(
        url: &str,
        options: ClientOptions,
        output: Box<dyn AudioOutput>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        info!("Connecting to sync server: {}", url);
        let (ws_stream, _) = connect_async(url).await?;
        let (write, read) = ws_stream.split();

        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (messages_tx, messages_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ClientStatus::default());
        let (fired_tx, fired_rx) = mpsc::unbounded_channel();

        let session = Session {
            clock_sync: ClockSync::new(options.clock.clone()),
            playback: PlaybackSynchronizer::new(options.drift.clone(), output, fired_tx),
            options,
            clock,
            current: None,
            end_reported: false,
            joined: false,
            is_host: false,
            status_tx,
            messages_tx,
        };
        let task = tokio::spawn(session.run(write, read, outgoing_rx, fired_rx));

        Ok(Self {
            outgoing: outgoing_tx,
            messages: messages_rx,
            status: status_rx,
            task,
        })
    }

    /// Queue a command for the server
    pub fn send(&self, message: ClientMessage) -> Result<()> {
        self.outgoing
            .send(message)
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Next message received from the server
    ///
    /// Returns `None` once the session has ended.
    pub async fn next_message(&mut self) -> Option<ServerMessage> {
        self.messages.recv().await
    }

    pub fn status(&self) -> ClientStatus {
        self.status.borrow().clone()
    }

    /// Wait until the published status satisfies `ready`
    pub async fn wait_for_status(
        &self,
        ready: impl FnMut(&ClientStatus) -> bool,
    ) -> Result<ClientStatus> {
        let mut status = self.status.clone();
        let current = status
            .wait_for(ready)
            .await
            .map_err(|_| Error::ConnectionClosed)?
            .clone();
        Ok(current)
    }

    /// Leave the room and close the socket
    pub async fn close(self) -> Result<()> {
        let _ = self.outgoing.send(ClientMessage::Leave);
        drop(self.outgoing);
        self.task.await?
    }
}

struct Session {
    options: ClientOptions,
    clock: Arc<dyn Clock>,
    clock_sync: ClockSync,
    playback: PlaybackSynchronizer,
    current: Option<ResolvedTrack>,
    end_reported: bool,
    joined: bool,
    is_host: bool,
    status_tx: watch::Sender<ClientStatus>,
    messages_tx: mpsc::UnboundedSender<ServerMessage>,
}

impl Session {
    async fn run(
        mut self,
        mut write: WsSink,
        mut read: SplitStream<WsStream>,
        mut outgoing: mpsc::UnboundedReceiver<ClientMessage>,
        mut fired: mpsc::UnboundedReceiver<u64>,
    ) -> Result<()> {
        let join = ClientMessage::Join {
            room_id: self.options.room_id.clone(),
            user_id: self.options.user_id.clone(),
            nickname: self.options.nickname.clone(),
        };
        send(&mut write, &join).await?;

        let mut next_ping = Instant::now();
        let mut host_report = interval(self.options.drift.host_report_interval());
        host_report.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut poll = interval(self.options.drift.poll_interval());
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut end_check = interval(END_CHECK_INTERVAL);
        end_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = sleep_until(next_ping) => {
                    let ping = self.clock_sync.next_ping(self.clock.now_ms());
                    send(&mut write, &ping).await?;
                    next_ping = Instant::now() + self.clock_sync.ping_interval();
                }
                Some(sequence) = fired.recv() => {
                    let server_now = self.server_now();
                    self.playback.fire(sequence, server_now);
                    self.publish();
                }
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => match ServerMessage::from_json(&text) {
                        Ok(message) => {
                            self.on_message(&message);
                            let _ = self.messages_tx.send(message);
                        }
                        Err(e) => warn!("Undecodable server frame: {}", e),
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Sync server closed the connection");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        self.playback.track_changed(None);
                        return Err(e.into());
                    }
                },
                command = outgoing.recv() => match command {
                    Some(message) => send(&mut write, &message).await?,
                    None => {
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                },
                _ = host_report.tick() => {
                    if let Some(report) = self.host_report() {
                        send(&mut write, &report).await?;
                    }
                }
                _ = poll.tick() => {
                    if !self.is_host && self.current.is_some() {
                        send(&mut write, &ClientMessage::SyncRequest).await?;
                    }
                }
                _ = end_check.tick() => {
                    if let Some(ended) = self.check_track_end() {
                        send(&mut write, &ended).await?;
                    }
                }
            }
        }

        self.playback.track_changed(None);
        debug!(user_id = %self.options.user_id, "Client session ended");
        Ok(())
    }

    fn server_now(&self) -> TimestampMs {
        self.clock_sync.server_time(self.clock.now_ms())
    }

    fn on_message(&mut self, message: &ServerMessage) {
        match message {
            ServerMessage::Pong { id, server_time } => {
                let local_now = self.clock.now_ms();
                if self
                    .clock_sync
                    .handle_pong(*id, *server_time, local_now)
                    .is_some()
                    && self.clock_sync.take_phase_switch()
                {
                    info!(
                        offset_ms = self.clock_sync.offset_ms().unwrap_or_default(),
                        rtt_ms = self.clock_sync.median_rtt().unwrap_or_default(),
                        "Clock calibrated"
                    );
                }
            }
            ServerMessage::RoomState(state) => {
                self.joined = true;
                self.is_host = state.host_id == self.options.user_id;
                self.set_track(state.current_track.as_ref());
                if self.current.is_some() {
                    let server_now = self.server_now();
                    self.playback.sync_to(&state.play_state, server_now);
                }
                info!(
                    room_id = %state.room_id,
                    host_id = %state.host_id,
                    users = state.users.len(),
                    "Joined room"
                );
            }
            ServerMessage::TrackChanged { track } => self.set_track(track.as_ref()),
            ServerMessage::ScheduledAction(action) => {
                let server_now = self.server_now();
                self.playback.schedule(*action, server_now);
            }
            ServerMessage::SyncSnapshot(snapshot) => {
                let server_now = self.server_now();
                self.playback.on_snapshot(snapshot, server_now);
            }
            ServerMessage::RoleChanged { user_id, role } => {
                if *user_id == self.options.user_id {
                    self.is_host = *role == Role::Host;
                } else if *role == Role::Host {
                    self.is_host = false;
                }
            }
            ServerMessage::Error { code, message } => {
                warn!(?code, %message, "Server rejected request");
            }
            _ => {}
        }
        self.publish();
    }

    fn set_track(&mut self, track: Option<&ResolvedTrack>) {
        self.playback.track_changed(track);
        self.current = track.cloned();
        self.end_reported = false;
    }

    /// Position report, sent only from the host seat
    fn host_report(&self) -> Option<ClientMessage> {
        if !self.is_host {
            return None;
        }
        let is_playing = match self.playback.phase() {
            PlaybackPhase::Playing { .. } => true,
            PlaybackPhase::Paused { .. } => false,
            PlaybackPhase::Idle | PlaybackPhase::Loading { .. } => return None,
        };
        Some(ClientMessage::HostReport {
            current_time: self.playback.position(),
            is_playing,
        })
    }

    fn check_track_end(&mut self) -> Option<ClientMessage> {
        if self.end_reported || !self.playback.phase().is_playing() {
            return None;
        }
        let track = self.current.as_ref()?;
        let duration = track.track.duration_secs?;
        if self.playback.position() + END_TOLERANCE_SECS < duration {
            return None;
        }

        let track_id = track.track.id.clone();
        self.end_reported = true;
        self.playback.track_finished();
        self.publish();
        debug!(%track_id, "Track finished locally");

        // Only the host's report advances the room
        self.is_host.then_some(ClientMessage::TrackEnded { track_id })
    }

    fn publish(&self) {
        let status = ClientStatus {
            joined: self.joined,
            is_host: self.is_host,
            calibrated: self.clock_sync.is_calibrated(),
            offset_ms: self.clock_sync.offset_ms(),
            median_rtt_ms: self.clock_sync.median_rtt(),
            phase: self.playback.phase().clone(),
        };
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}

async fn send(write: &mut WsSink, message: &ClientMessage) -> Result<()> {
    let text = serde_json::to_string(message)?;
    write.send(Message::Text(text)).await?;
    Ok(())
}
