//! WebSocket sync server
//!
//! Binds a TCP listener and hands every accepted socket to
//! [`handle_connection`] on its own task.

use crate::handler::handle_connection;
use crate::{Error, Result};
use cosync_core::CoordinatorHandle;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info};

/// WebSocket front end for a coordinator
pub struct SyncServer {
    addr: SocketAddr,
    coordinator: CoordinatorHandle,
}

impl SyncServer {
    pub fn new(addr: SocketAddr, coordinator: CoordinatorHandle) -> Self {
        Self { addr, coordinator }
    }

    /// Bind and start accepting connections
    ///
    /// Resolves once the listener is bound, so a port of 0 can be read back
    /// from [`SyncServerHandle::local_addr`].
    pub async fn start(self) -> Result<SyncServerHandle> {
        let (startup_tx, startup_rx) = oneshot::channel::<std::io::Result<SocketAddr>>();
        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let mut shutdown_rx = shutdown_tx.subscribe();

        let addr = self.addr;
        let coordinator = self.coordinator;

        let task = tokio::spawn(async move {
            let listener = match TcpListener::bind(addr).await {
                Ok(listener) => listener,
                Err(e) => {
                    error!("Failed to bind sync server to {}: {}", addr, e);
                    let _ = startup_tx.send(Err(e));
                    return;
                }
            };
            let local_addr = match listener.local_addr() {
                Ok(a) => a,
                Err(e) => {
                    let _ = startup_tx.send(Err(e));
                    return;
                }
            };
            info!("Sync server listening on ws://{}", local_addr);
            let _ = startup_tx.send(Ok(local_addr));

            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, peer_addr)) => {
                                let coordinator = coordinator.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = handle_connection(stream, coordinator).await {
                                        error!("WebSocket connection error from {}: {}", peer_addr, e);
                                    }
                                });
                            }
                            Err(e) => {
                                error!("Failed to accept connection: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Sync server received shutdown signal");
                        break;
                    }
                }
            }

            info!("Sync server accept loop exited");
        });

        match startup_rx.await {
            Ok(Ok(local_addr)) => Ok(SyncServerHandle {
                local_addr,
                shutdown_tx,
                task,
            }),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(Error::Startup(
                "startup channel closed unexpectedly".to_string(),
            )),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

/// Running server
pub struct SyncServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl SyncServerHandle {
    /// Address actually bound
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// WebSocket URL clients should connect to
    pub fn url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    /// Stop accepting connections
    ///
    /// Open connections keep running until they close or the coordinator
    /// shuts down.
    pub async fn shutdown(self) {
        info!("Stopping sync server");
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.task.await {
            error!("Sync server task failed: {}", e);
        }
    }
}
