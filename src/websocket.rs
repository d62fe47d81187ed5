//! WebSocket push channel for dashboard observers

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

use crate::publisher::Push;
use crate::AppState;

/// WebSocket handler
pub async fn handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    // Subscribe before greeting so nothing published after the greeting is missed
    let mut pushes = BroadcastStream::new(state.publisher.subscribe());

    if send_push(&mut sender, &Push::connected()).await.is_err() {
        tracing::debug!("observer left before greeting");
        return;
    }
    tracing::debug!(
        observers = state.publisher.observer_count(),
        "observer connected"
    );

    loop {
        tokio::select! {
            push = pushes.next() => match push {
                Some(Ok(push)) => {
                    if let Err(e) = send_push(&mut sender, &push).await {
                        tracing::debug!("dropping observer: {}", e);
                        break;
                    }
                }
                Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                    tracing::warn!(skipped, "observer lagged, pushes dropped");
                }
                None => break,
            },
            msg = receiver.next() => match msg {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    tracing::debug!("WebSocket error: {}", e);
                    break;
                }
            },
        }
    }

    tracing::debug!("observer disconnected");
}

async fn send_push(
    sender: &mut futures::stream::SplitSink<WebSocket, Message>,
    push: &Push,
) -> Result<(), axum::Error> {
    let text = match serde_json::to_string(push) {
        Ok(text) => text,
        Err(e) => {
            tracing::error!("Failed to encode push: {}", e);
            return Ok(());
        }
    };
    sender.send(Message::Text(text.into())).await
}
