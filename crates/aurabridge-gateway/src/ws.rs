//! WebSocket connection handling
//!
//! Commands are read and answered one at a time. Push messages are forwarded
//! from the acquisition event bus by a separate task, so they keep flowing
//! while a slow command (training, a bounded stop) is still running. Both
//! paths feed one writer task that owns the socket sink.

use crate::rpc::{self, event_to_push};
use crate::server::GatewayState;
use aurabridge_acquisition::AcquisitionEvent;
use aurabridge_core::PushMessage;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

const OUTBOUND_CAPACITY: usize = 256;

/// Handle one control client until it disconnects or the gateway shuts down.
pub async fn handle_connection(socket: WebSocket, state: Arc<GatewayState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<WsMessage>(OUTBOUND_CAPACITY);

    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break; // Client disconnected
            }
        }
        let _ = ws_tx.close().await;
    });

    // Subscribe before announcing so no event is missed.
    let events = state.controller.events().subscribe();
    send_json(&out_tx, &PushMessage::info(env!("CARGO_PKG_VERSION"))).await;
    let forwarder = tokio::spawn(forward_events(events, out_tx.clone()));
    info!("Control client connected");

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                let _ = out_tx.send(WsMessage::Close(None)).await;
                break;
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        let response = rpc::handle_text(&text, &state).await;
                        if !send_json(&out_tx, &response).await {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) => {
                        info!("Client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error: {}", e);
                        break;
                    }
                    None => break, // Stream ended
                    _ => {} // Binary, Ping, Pong: ignore
                }
            }
        }
    }

    forwarder.abort();
    drop(out_tx);
    let _ = writer.await;
    debug!("Connection closed");
}

/// Forward acquisition events to the client as push messages.
async fn forward_events(
    mut events: broadcast::Receiver<AcquisitionEvent>,
    out_tx: mpsc::Sender<WsMessage>,
) {
    loop {
        match events.recv().await {
            Ok(event) => {
                if !send_json(&out_tx, &event_to_push(&event)).await {
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Client lagged, dropped {} events", n);
            }
            Err(broadcast::error::RecvError::Closed) => {
                info!("Event bus closed");
                return;
            }
        }
    }
}

/// Queue a JSON message. Returns `false` once the writer is gone.
async fn send_json<T: Serialize>(out_tx: &mpsc::Sender<WsMessage>, value: &T) -> bool {
    match serde_json::to_string(value) {
        Ok(json) => out_tx.send(WsMessage::Text(json)).await.is_ok(),
        Err(e) => {
            warn!("Failed to encode message: {}", e);
            true
        }
    }
}
