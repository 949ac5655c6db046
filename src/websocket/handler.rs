use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{
    sink::SinkExt,
    stream::{SplitSink, StreamExt},
};
use tokio::select;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use super::messages::{ClientMessage, WsMessage};
use crate::api::AppState;
use crate::models::SessionId;
use crate::session::SessionSubscriptionHandler;

type WsSender = SplitSink<WebSocket, Message>;

/// Handle WebSocket upgrade request
pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Handle one downstream session from upgrade to close
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let session = SessionId::new();
    let handler = state.sessions.as_ref();

    let mut updates = handler.on_connect(session);
    let mut heartbeat = interval(state.heartbeat);

    if send_json(&mut sender, &WsMessage::Welcome { session_id: session })
        .await
        .is_err()
    {
        handler.on_disconnect(session);
        return;
    }

    loop {
        select! {
            // Handle incoming messages from client
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let reply = handle_client_message(&text, session, handler);
                        if send_json(&mut sender, &reply).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("WebSocket session {} sent close", session);
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        error!("WebSocket error on session {}: {}", session, e);
                        break;
                    }
                    None => break,
                    _ => {}
                }
            }

            // Ticks fanned out to this session
            update = updates.recv() => {
                let Some(update) = update else {
                    warn!("Sink for session {} closed by the broadcaster", session);
                    break;
                };
                if send_json(&mut sender, &WsMessage::market_update(update)).await.is_err() {
                    break;
                }
            }

            // Send heartbeat
            _ = heartbeat.tick() => {
                let ping = WsMessage::Ping {
                    timestamp: chrono::Utc::now(),
                };
                if send_json(&mut sender, &ping).await.is_err() {
                    break;
                }
            }
        }
    }

    handler.on_disconnect(session);
    info!("WebSocket connection closed");
}

/// Apply one client message and build the reply
fn handle_client_message(text: &str, session: SessionId, handler: &SessionSubscriptionHandler) -> WsMessage {
    let client_msg: ClientMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            debug!("Unparseable message from session {}: {}", session, e);
            return WsMessage::Error {
                message: format!("Invalid message: {}", e),
            };
        }
    };

    match client_msg {
        ClientMessage::Subscribe { tokens } => {
            let report = handler.on_subscribe(session, tokens);
            info!(
                "Session {} subscribed to {} instruments ({} rejected)",
                session,
                report.accepted.len(),
                report.rejected.len()
            );
            WsMessage::subscribed(report)
        }
        ClientMessage::Unsubscribe { tokens } => {
            let report = handler.on_unsubscribe(session, tokens);
            info!("Session {} unsubscribed from {} instruments", session, report.accepted.len());
            WsMessage::unsubscribed(report)
        }
        ClientMessage::Ping => WsMessage::Pong {
            timestamp: chrono::Utc::now(),
        },
    }
}

async fn send_json(sender: &mut WsSender, msg: &WsMessage) -> Result<(), axum::Error> {
    match serde_json::to_string(msg) {
        Ok(json) => sender.send(Message::Text(json)).await,
        Err(e) => {
            error!("Failed to encode WebSocket message: {}", e);
            Ok(())
        }
    }
}
