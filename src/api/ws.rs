// =============================================================================
// WebSocket Handler — live candle stream
// =============================================================================
//
// Clients connect to `/v1/stream/start` and must send, as their first message:
//   {"type":"auth","data":{"channel":"ch:...","token":"..."}}
// After a successful auth every closed candle for the channel's size is pushed
// as a JSON text frame. `{"type":"stop"}` ends the stream explicitly.
//
// The handler also:
//   - Closes the connection on any message before a successful auth.
//   - Ignores a second auth on an authenticated connection.
//   - Answers Ping frames with Pong frames.
//   - Deregisters the stream when the socket goes away, so a stream never
//     outlives its connection, expired registration or not.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::app_state::ApiState;

/// Candles buffered per connection before emission for its size blocks.
const SUBSCRIBER_BUFFER: usize = 64;

// =============================================================================
// Client messages
// =============================================================================

#[derive(Debug, Deserialize)]
struct ClientMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
struct StreamAuth {
    channel: String,
    token: String,
}

/// What the read side decided after one client text frame.
enum Step {
    Continue,
    Authenticated(StreamAuth),
    Close(&'static str),
    Stop,
}

// =============================================================================
// Upgrade handler
// =============================================================================

/// Axum handler: `GET /v1/stream/start`.
pub async fn stream_start(ws: WebSocketUpgrade, State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_stream_socket(socket, state))
}

async fn handle_stream_socket(socket: WebSocket, state: Arc<ApiState>) {
    let conn_id = Uuid::new_v4();
    info!(conn = %conn_id, "candle stream socket opened");

    let (mut sender, mut receiver) = socket.split();
    let (sink, mut candles) = mpsc::channel::<String>(SUBSCRIBER_BUFFER);
    let mut sink = Some(sink);
    let mut session: Option<StreamAuth> = None;
    let mut stopped = false;

    loop {
        tokio::select! {
            // ── Push: candles from the streamer ─────────────────────────
            candle = candles.recv(), if session.is_some() => {
                match candle {
                    Some(payload) => {
                        if let Err(e) = sender.send(Message::Text(payload)).await {
                            debug!(conn = %conn_id, error = %e, "candle send failed, disconnecting");
                            break;
                        }
                    }
                    None => {
                        info!(conn = %conn_id, "stream sink closed by streamer");
                        stopped = true;
                        break;
                    }
                }
            }

            // ── Recv: client control messages ───────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => match read_client_text(&text, session.is_some()) {
                        Step::Continue => {}
                        Step::Authenticated(auth) => {
                            let Some(tx) = sink.take() else { continue };
                            match state.streamer.connect(&auth.channel, &auth.token, tx) {
                                Ok(()) => {
                                    info!(conn = %conn_id, channel = %auth.channel, "candle stream authenticated");
                                    session = Some(auth);
                                }
                                Err(e) => {
                                    warn!(conn = %conn_id, error = %e, "candle stream auth rejected");
                                    let _ = sender
                                        .send(Message::Text(json!({"type": "error", "data": {"message": e.to_string()}}).to_string()))
                                        .await;
                                    break;
                                }
                            }
                        }
                        Step::Stop => {
                            if let Some(auth) = &session {
                                if let Err(e) = state.streamer.stop(&auth.channel, &auth.token) {
                                    warn!(conn = %conn_id, error = %e, "explicit stop failed");
                                }
                            }
                            stopped = true;
                            break;
                        }
                        Step::Close(reason) => {
                            warn!(conn = %conn_id, reason, "closing candle stream socket");
                            break;
                        }
                    },
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sender.send(Message::Pong(data)).await {
                            debug!(conn = %conn_id, error = %e, "failed to send Pong, disconnecting");
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!(conn = %conn_id, "close frame received");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(conn = %conn_id, error = %e, "websocket receive error, disconnecting");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    // Close our receiver first so the streamer sees the sink as dead even when
    // its registration has already expired and `stop` can no longer find it.
    drop(candles);
    if let Some(auth) = &session {
        if !stopped {
            if let Err(e) = state.streamer.stop(&auth.channel, &auth.token) {
                debug!(conn = %conn_id, error = %e, "stream registration already gone at disconnect");
            }
        }
        state.streamer.disconnect(&auth.channel);
    }
    let _ = sender.send(Message::Close(None)).await;

    info!(
        conn = %conn_id,
        channel = session.as_ref().map(|s| s.channel.as_str()).unwrap_or("-"),
        "candle stream socket closed"
    );
}

/// Interpret one client text frame given whether the socket is authenticated.
fn read_client_text(text: &str, authenticated: bool) -> Step {
    let msg: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            warn!(error = %e, raw = %text, "unreadable client message ignored");
            return Step::Continue;
        }
    };

    match (msg.kind.as_str(), authenticated) {
        ("auth", true) => {
            warn!("auth message on an authenticated stream ignored");
            Step::Continue
        }
        ("auth", false) => match serde_json::from_value::<StreamAuth>(msg.data) {
            Ok(auth) => Step::Authenticated(auth),
            Err(_) => Step::Close("malformed auth data"),
        },
        (_, false) => Step::Close("message before auth"),
        ("stop", true) => Step::Stop,
        (other, true) => {
            debug!(kind = other, "unsupported client message ignored");
            Step::Continue
        }
    }
}
