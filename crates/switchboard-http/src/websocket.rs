//! WebSocket event streaming.
//!
//! Clients connect to `/ws/events` and receive every bus event as
//! `{"topic": ..., "event": {...}}`. Sending `{"subscribe": pattern}` or
//! `{"unsubscribe": pattern}` narrows the stream; with no subscriptions the
//! client receives everything.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use switchboard_core::bus::topic_matches;
use tokio::sync::broadcast::error::RecvError;

use crate::SharedState;

#[derive(Debug, PartialEq, Deserialize)]
#[serde(untagged)]
enum ClientMessage {
    Subscribe { subscribe: String },
    Unsubscribe { unsubscribe: String },
}

/// Handler for GET /ws/events
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<SharedState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<SharedState>) {
    let (mut sender, mut receiver) = socket.split();
    let patterns: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
    let mut events = state.conductor.bus.receiver();

    let recv_patterns = Arc::clone(&patterns);
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            let Message::Text(text) = msg else {
                continue;
            };
            match serde_json::from_str::<ClientMessage>(&text) {
                Ok(message) => {
                    if let Ok(mut patterns) = recv_patterns.lock() {
                        apply(&mut patterns, message);
                    }
                }
                Err(e) => log::debug!("Ignoring WebSocket message: {}", e),
            }
        }
    });

    let send_task = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let wanted = patterns
                        .lock()
                        .map(|p| accepts(&p, &event.topic))
                        .unwrap_or(false);
                    if !wanted {
                        continue;
                    }
                    let json = match serde_json::to_string(&event) {
                        Ok(json) => json,
                        Err(e) => {
                            log::warn!("Cannot serialize {} event: {}", event.topic, e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(count)) => {
                    log::warn!("WebSocket client lagged by {} events", count);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    tokio::select! {
        _ = recv_task => {},
        _ = send_task => {},
    }
    log::debug!("WebSocket connection closed");
}

fn apply(patterns: &mut HashSet<String>, message: ClientMessage) {
    match message {
        ClientMessage::Subscribe { subscribe } => {
            log::debug!("WebSocket subscribed to {}", subscribe);
            patterns.insert(subscribe);
        }
        ClientMessage::Unsubscribe { unsubscribe } => {
            log::debug!("WebSocket unsubscribed from {}", unsubscribe);
            patterns.remove(&unsubscribe);
        }
    }
}

fn accepts(patterns: &HashSet<String>, topic: &str) -> bool {
    patterns.is_empty() || patterns.iter().any(|p| topic_matches(topic, p))
}
