//! Per-connection WebSocket handler
//!
//! Each accepted socket gets one connection id on the coordinator. Frames
//! flow in both directions as JSON text:
//! - inbound frames are decoded into [`ClientMessage`]s and forwarded
//! - everything the coordinator queues on the connection's outbox is
//!   written back by a dedicated forward task
//!
//! Pings are answered here, on the connection task, so a busy coordinator
//! never inflates the measured round trip.

use crate::Result;
use cosync_core::room::ConnectionId;
use cosync_core::{ClientMessage, CoordinatorHandle, Error as CoreError, ServerMessage};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Serve one WebSocket connection until either side closes it
pub async fn handle_connection(stream: TcpStream, coordinator: CoordinatorHandle) -> Result<()> {
    let addr = stream.peer_addr()?;
    let ws_stream = accept_async(stream).await?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let conn = coordinator.connect(tx.clone())?;
    info!(%addr, %conn, "WebSocket connection established");

    let forward_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let text = match message.to_json() {
                Ok(text) => text,
                Err(e) => {
                    error!(kind = message.name(), "Failed to encode message: {}", e);
                    continue;
                }
            };
            if let Err(e) = ws_tx.send(Message::Text(text)).await {
                debug!("Failed to send WebSocket message: {}", e);
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    while let Some(frame) = ws_rx.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                if let Err(e) = handle_frame(&text, conn, &coordinator, &tx) {
                    if matches!(e, CoreError::CoordinatorStopped) {
                        warn!(%conn, "Coordinator stopped, closing connection");
                        break;
                    }
                    let _ = tx.send(ServerMessage::error(&e));
                }
            }
            Ok(Message::Close(_)) => {
                info!(%addr, %conn, "WebSocket connection closed by client");
                break;
            }
            Ok(Message::Binary(_)) => {
                let err = CoreError::InvalidMessage("binary frames are not supported".into());
                let _ = tx.send(ServerMessage::error(&err));
            }
            // Control frames are answered by tungstenite
            Ok(_) => {}
            Err(e) => {
                debug!(%addr, "WebSocket read error: {}", e);
                break;
            }
        }
    }

    if let Err(e) = coordinator.disconnect(conn) {
        debug!(%conn, "Disconnect not delivered: {}", e);
    }
    forward_task.abort();
    info!(%addr, %conn, "WebSocket connection finished");
    Ok(())
}

fn handle_frame(
    text: &str,
    conn: ConnectionId,
    coordinator: &CoordinatorHandle,
    tx: &mpsc::UnboundedSender<ServerMessage>,
) -> cosync_core::Result<()> {
    let message = ClientMessage::from_json(text)?;

    match message {
        ClientMessage::Ping { id, rtt_ms, .. } => {
            let server_time = coordinator.now_ms();
            let _ = tx.send(ServerMessage::Pong { id, server_time });
            if let Some(rtt_ms) = rtt_ms {
                coordinator.report_rtt(conn, rtt_ms)?;
            }
            Ok(())
        }
        message => {
            debug!(%conn, kind = message.name(), "Forwarding command");
            coordinator.command(conn, message)
        }
    }
}
