use std::borrow::Cow;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::event::ClientEvent;
use crate::handlers::AppState;
use crate::registry::{ConnectionHandle, Outbound};
use crate::relay::Relay;

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    /// Session issued on an earlier connection, for identity continuity
    #[serde(default)]
    pub session_id: Option<String>,
}

/// WebSocket upgrade handler
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<ConnectQuery>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, query.session_id, state.relay))
}

/// Handle a WebSocket connection
async fn handle_socket(socket: WebSocket, requested: Option<String>, relay: Relay) {
    let (mut sender, mut receiver) = socket.split();
    let (handle, mut rx) = relay.registry().open();
    let resource_id = handle.resource_id();

    // Spawn task to forward queued frames to the WebSocket
    let mut writer = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            match outbound {
                Outbound::Event(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close(reason) => {
                    let _ = sender
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::POLICY,
                            reason: Cow::Owned(reason),
                        })))
                        .await;
                    break;
                }
            }
        }
        debug!(resource_id, "writer task finished");
    });

    let session_id = match relay.admit(&handle, requested.as_deref()).await {
        Ok(session_id) => session_id,
        Err(err) => {
            warn!(resource_id, error = %err, "connection not admitted");
            counter!(
                "chat_relay_admissions_refused_total",
                1,
                "reason" => err.metric_label()
            );
            handle.close("session unavailable");
            let _ = writer.await;
            return;
        }
    };
    counter!("chat_relay_connections_total", 1);
    gauge!("chat_relay_connections_active", relay.registry().len() as f64);

    loop {
        tokio::select! {
            frame = receiver.next() => {
                let Some(frame) = frame else {
                    break;
                };
                let message = match frame {
                    Ok(message) => message,
                    Err(err) => {
                        warn!(resource_id, error = %err, "websocket error");
                        break;
                    }
                };
                match message {
                    Message::Text(text) => {
                        handle_text(&relay, &handle, &session_id, &text).await;
                    }
                    Message::Binary(data) => match String::from_utf8(data) {
                        Ok(text) => handle_text(&relay, &handle, &session_id, &text).await,
                        Err(_) => debug!(resource_id, "ignoring non-UTF8 binary frame"),
                    },
                    Message::Close(_) => {
                        debug!(resource_id, "received close frame");
                        break;
                    }
                    Message::Ping(_) | Message::Pong(_) => {}
                }
            }
            _ = &mut writer => {
                debug!(resource_id, "writer ended; dropping connection");
                break;
            }
        }
    }

    relay.disconnect(&handle).await;
    writer.abort();
    counter!("chat_relay_connections_closed_total", 1);
    gauge!("chat_relay_connections_active", relay.registry().len() as f64);
}

async fn handle_text(relay: &Relay, handle: &ConnectionHandle, session_id: &str, text: &str) {
    let event = match ClientEvent::parse(text) {
        Ok(event) => event,
        Err(err) => {
            warn!(resource_id = handle.resource_id(), error = %err, "ignoring client event");
            counter!(
                "chat_relay_client_errors_total",
                1,
                "reason" => err.metric_label()
            );
            return;
        }
    };
    if let Err(err) = relay.handle_client_event(handle, session_id, event).await {
        warn!(
            resource_id = handle.resource_id(),
            session_id = %session_id,
            error = %err,
            "failed to handle client event"
        );
        counter!(
            "chat_relay_client_errors_total",
            1,
            "reason" => err.metric_label()
        );
    }
}
