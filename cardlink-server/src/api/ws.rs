//! WebSocket stream of event-bus events as JSON lines.

use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::{self, WebSocket, WebSocketUpgrade};
use axum::response::Response;

use crate::api::ApiState;
use crate::services::event_bus::EventStream;

pub(crate) async fn stream(
    State(state): State<Arc<ApiState>>,
    upgrade: WebSocketUpgrade,
) -> Response {
    // subscribe before the upgrade so no event between upgrade and the
    // first poll is lost
    let events = state.bus.subscribe();
    upgrade.on_upgrade(move |socket| forward_events(socket, events))
}

async fn forward_events(mut socket: WebSocket, mut events: EventStream) {
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                let json = serde_json::to_string(&event).expect("events serialize");
                if socket.send(ws::Message::text(json)).await.is_err() {
                    // subscriber went away; nothing left to do
                    return;
                }
            }
            incoming = socket.recv() => match incoming {
                Some(Ok(ws::Message::Close(_))) | Some(Err(_)) | None => return,
                _ => {}
            }
        }
    }
    let _ = socket.send(ws::Message::Close(None)).await;
}
