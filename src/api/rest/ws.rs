use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::SinkExt;
use futures::StreamExt;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::session::DispatchSession;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(session): State<Arc<DispatchSession>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, session))
}

/// Streams lifecycle events to a local UI client as JSON text frames.
async fn handle_socket(socket: WebSocket, session: Arc<DispatchSession>) {
    let (mut sender, mut receiver) = socket.split();
    let mut rx = session.subscribe();

    info!("lifecycle event client connected");

    let send_task = tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "lifecycle event client lagging");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(err) => {
                    warn!(error = %err, "failed to serialize lifecycle event for ws");
                    continue;
                }
            };

            if sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    let recv_task = tokio::spawn(async move {
        while let Some(Ok(_msg)) = receiver.next().await {}
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }

    info!("lifecycle event client disconnected");
}
