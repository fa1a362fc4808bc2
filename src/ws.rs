use axum::extract::ws::{Message, WebSocket};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tokio::sync::broadcast;

use crate::publish::{EVENT_MESSAGE, EVENT_STATUS};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsEvent {
    pub event: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WsCommand {
    #[serde(rename = "connect")]
    Connect { token: Option<String> },
    #[serde(rename = "subscribe")]
    Subscribe {
        events: Option<Vec<String>>,
        rooms: Option<Vec<String>>,
    },
    #[serde(rename = "ping")]
    Ping,
}

/// Whether an event passes the observer's subscription filters. Room
/// scoping applies to per-room traffic only; a `room_created` composite is
/// always delivered, otherwise an observer could receive messages for a
/// conversation it was never told about.
pub fn event_matches(
    event: &WsEvent,
    events: Option<&HashSet<String>>,
    rooms: Option<&HashSet<String>>,
) -> bool {
    if let Some(events) = events {
        if !events.contains(&event.event) {
            return false;
        }
    }
    if let Some(rooms) = rooms {
        if event.event == EVENT_MESSAGE || event.event == EVENT_STATUS {
            let room_id = event
                .payload
                .get("room_id")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            if !rooms.contains(room_id) {
                return false;
            }
        }
    }
    true
}

pub async fn handle_ws(
    mut socket: WebSocket,
    mut rx: broadcast::Receiver<WsEvent>,
    auth_token: Option<String>,
) {
    let mut authorized = auth_token.is_none();
    let mut event_subscriptions: Option<HashSet<String>> = None;
    let mut room_subscriptions: Option<HashSet<String>> = None;

    loop {
        tokio::select! {
            msg = socket.recv() => {
                if msg.is_none() {
                    break;
                }
                if let Some(Ok(Message::Close(_))) = msg {
                    break;
                }
                if let Some(Ok(Message::Text(text))) = msg {
                    if let Ok(cmd) = serde_json::from_str::<WsCommand>(&text) {
                        match cmd {
                            WsCommand::Connect { token } => {
                                if let Some(expected) = auth_token.as_ref() {
                                    if token.as_deref() != Some(expected.as_str()) {
                                        let _ = socket.send(Message::Close(None)).await;
                                        break;
                                    }
                                }
                                authorized = true;
                                let ack = WsEvent {
                                    event: "presence".to_string(),
                                    payload: serde_json::json!({"status": "connected"}),
                                };
                                let _ = socket.send(Message::Text(serde_json::to_string(&ack).unwrap_or_default())).await;
                            }
                            WsCommand::Subscribe { events, rooms } => {
                                event_subscriptions = events.map(|items| items.into_iter().collect());
                                room_subscriptions = rooms.map(|items| items.into_iter().collect());
                            }
                            WsCommand::Ping => {
                                let health = WsEvent {
                                    event: "health".to_string(),
                                    payload: serde_json::json!({"status": "ok"}),
                                };
                                let _ = socket.send(Message::Text(serde_json::to_string(&health).unwrap_or_default())).await;
                            }
                        }
                    }
                }
            }
            evt = rx.recv() => {
                if let Ok(evt) = evt {
                    if !authorized {
                        continue;
                    }
                    if !event_matches(&evt, event_subscriptions.as_ref(), room_subscriptions.as_ref()) {
                        continue;
                    }
                    let text = serde_json::to_string(&evt).unwrap_or_default();
                    if socket.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}
