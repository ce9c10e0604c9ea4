//! Sync server binary entry point
//!
//! # Usage
//!
//! ```bash
//! # Serve rooms on ws://0.0.0.0:8787 with the inspection API on :8788
//! cargo run -p cosync-server -- --config ./cosync.toml --catalog ./catalog.json
//!
//! # Join a room with a simulated output and log what it plays
//! cargo run -p cosync-server -- --mode client \
//!   --url ws://localhost:8787 --room lobby --user alice
//! ```

use anyhow::Context;
use clap::Parser;
use cosync_core::{
    AudioOutput, Coordinator, InMemoryRoomRepository, MonotonicClock, ServerMessage, SimulatedOutput,
    StaticResolver,
};
use cosync_server::{build_router, AppState, Config};
use cosync_websocket::{ClientOptions, SyncClient, SyncServer};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// cosync sync server
///
/// Keeps listening rooms in sync over WebSocket. Can also run as a headless
/// client that joins a room and follows its playback.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 'server' to host rooms, 'client' to join one
    #[arg(short, long, default_value = "server", env = "COSYNC_MODE")]
    mode: Mode,

    /// TOML configuration file
    #[arg(short, long, env = "COSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Bind host (server mode), overrides the config file
    #[arg(long)]
    host: Option<String>,

    /// WebSocket port (server mode), overrides the config file
    #[arg(long)]
    ws_port: Option<u16>,

    /// HTTP inspection port (server mode), overrides the config file
    #[arg(long)]
    http_port: Option<u16>,

    /// JSON track catalog (server mode), overrides the config file
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// Server URL (client mode)
    #[arg(long, default_value = "ws://127.0.0.1:8787", env = "COSYNC_URL")]
    url: String,

    /// Room to join (client mode)
    #[arg(long, default_value = "lobby", env = "COSYNC_ROOM")]
    room: String,

    /// Persistent user id (client mode)
    #[arg(long, env = "COSYNC_USER")]
    user: Option<String>,

    /// Display name (client mode), defaults to the user id
    #[arg(long)]
    nickname: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, default_value_t = false, env = "COSYNC_JSON_LOGS")]
    json_logs: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum Mode {
    /// Host rooms
    Server,
    /// Join a room with a simulated output
    Client,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_handler = Arc::clone(&shutdown_flag);

    ctrlc::set_handler(move || {
        eprintln!("\nCtrl+C received, shutting down...");
        if shutdown_flag_handler.swap(true, Ordering::SeqCst) {
            eprintln!("Shutdown already in progress, forcing exit");
            std::process::exit(0);
        }

        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_secs(5));
            eprintln!("Graceful shutdown timed out, forcing exit");
            std::process::exit(0);
        });
    })
    .context("Failed to set Ctrl+C handler")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .thread_name("cosync-worker")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(args, shutdown_flag))
}

async fn async_main(args: Args, shutdown_flag: Arc<AtomicBool>) -> anyhow::Result<()> {
    init_tracing(args.json_logs);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        mode = ?args.mode,
        "cosync sync server starting"
    );

    let mut config = Config::load(args.config.as_ref()).context("Failed to load configuration")?;
    if let Some(host) = &args.host {
        config.server.host = host.clone();
    }
    if let Some(port) = args.ws_port {
        config.server.ws_port = port;
    }
    if let Some(port) = args.http_port {
        config.server.http_port = port;
    }
    if let Some(catalog) = &args.catalog {
        config.server.catalog = Some(catalog.clone());
    }
    config.validate()?;

    match args.mode {
        Mode::Server => run_server(config, shutdown_flag).await,
        Mode::Client => run_client(args, config, shutdown_flag).await,
    }
}

async fn run_server(config: Config, shutdown_flag: Arc<AtomicBool>) -> anyhow::Result<()> {
    let resolver = match &config.server.catalog {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read catalog {}", path.display()))?;
            let resolver = StaticResolver::from_json(&json)?;
            info!(tracks = resolver.len(), catalog = %path.display(), "Catalog loaded");
            resolver
        }
        None => {
            warn!("No catalog configured, every track will be unavailable");
            StaticResolver::new()
        }
    };

    let (coordinator, coordinator_task) = Coordinator::spawn(
        config.coordination.clone(),
        Arc::new(MonotonicClock::new()),
        Arc::new(resolver),
        Arc::new(InMemoryRoomRepository::new()),
    );

    let ws_server = SyncServer::new(config.server.ws_addr()?, coordinator.clone())
        .start()
        .await?;
    info!("WebSocket endpoint: {}", ws_server.url());

    let http_addr = config.server.http_addr()?;
    let listener = tokio::net::TcpListener::bind(http_addr)
        .await
        .with_context(|| format!("Failed to bind HTTP API to {}", http_addr))?;
    info!("HTTP inspection API listening on http://{}", listener.local_addr()?);

    let router = build_router(AppState::new(coordinator.clone()));
    let http_flag = Arc::clone(&shutdown_flag);
    let http_task = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(wait_for_shutdown(http_flag))
            .await
    });

    info!("Server running. Press Ctrl+C to shutdown.");
    wait_for_shutdown(shutdown_flag).await;
    info!("Shutdown signal received, cleaning up...");

    ws_server.shutdown().await;
    if let Err(e) = coordinator.shutdown().await {
        warn!("Coordinator already stopped: {}", e);
    }
    if let Err(e) = coordinator_task.await {
        error!("Coordinator task failed: {}", e);
    }
    match http_task.await {
        Ok(Err(e)) => error!("HTTP API failed: {}", e),
        Err(e) => error!("HTTP API task failed: {}", e),
        Ok(Ok(())) => {}
    }

    info!("Sync server shut down gracefully");
    Ok(())
}

async fn run_client(
    args: Args,
    config: Config,
    shutdown_flag: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let user = args
        .user
        .context("--user is required in client mode")?;
    let nickname = args.nickname.unwrap_or_else(|| user.clone());

    let mut options = ClientOptions::new(args.room.clone(), user, nickname);
    options.clock = config.coordination.clock.clone();
    options.drift = config.coordination.drift.clone();

    let output = SimulatedOutput::new();
    let mut client = SyncClient::connect(&args.url, options, Box::new(output.clone())).await?;
    info!(url = %args.url, room = %args.room, "Client connected");

    let shutdown = wait_for_shutdown(shutdown_flag);
    tokio::pin!(shutdown);
    let mut status_tick = tokio::time::interval(Duration::from_secs(5));

    loop {
        tokio::select! {
            message = client.next_message() => match message {
                Some(message) => log_message(&message),
                None => {
                    warn!("Session ended by the server");
                    return Ok(());
                }
            },
            _ = status_tick.tick() => {
                let status = client.status();
                info!(
                    phase = ?status.phase,
                    position = output.position(),
                    host = status.is_host,
                    calibrated = status.calibrated,
                    offset_ms = status.offset_ms.unwrap_or_default(),
                    "Client status"
                );
            }
            _ = &mut shutdown => break,
        }
    }

    info!("Shutdown signal received, leaving room...");
    client.close().await?;
    Ok(())
}

fn log_message(message: &ServerMessage) {
    match message {
        ServerMessage::TrackChanged { track } => match track {
            Some(track) => info!(track_id = %track.track.id, title = %track.track.title, "Now playing"),
            None => info!("Queue finished"),
        },
        ServerMessage::ScheduledAction(action) => info!(
            kind = ?action.kind,
            at = action.server_time_to_execute,
            "Action scheduled"
        ),
        ServerMessage::VoteStarted(vote) => info!(
            vote_id = %vote.id,
            initiator = %vote.initiator_id,
            required = vote.required_votes,
            "Vote started"
        ),
        ServerMessage::VoteResult(result) => info!(
            vote_id = %result.id,
            passed = result.passed,
            reason = ?result.reason,
            "Vote finished"
        ),
        ServerMessage::Chat { message } => {
            info!(from = %message.nickname, "{}", message.text)
        }
        ServerMessage::Error { code, message } => warn!(?code, "{}", message),
        other => debug!(kind = other.name(), "Server message"),
    }
}

/// Resolves once Ctrl+C has set the flag
async fn wait_for_shutdown(shutdown_flag: Arc<AtomicBool>) {
    while !shutdown_flag.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
