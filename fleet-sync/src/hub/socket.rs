//! WebSocket connection driver
//!
//! Splits the socket: a writer task drains the hub's outbound channel and a
//! reader loop feeds text frames to the hub. Whichever side finishes first
//! ends the connection.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tracing::{debug, warn};

use super::FanOutHub;

pub async fn serve_socket(socket: WebSocket, hub: Arc<FanOutHub>) {
    let (id, mut outbound) = hub.register().await;
    let (mut sink, mut stream) = socket.split();

    let mut writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(e) => {
                    warn!("Failed to encode socket frame: {}", e);
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let reader_hub = hub.clone();
    let mut reader = tokio::spawn(async move {
        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Text(text)) => reader_hub.handle_text(id, &text).await,
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!(connection_id = %id, "Socket read error: {}", e);
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }

    hub.unregister(id).await;
}
