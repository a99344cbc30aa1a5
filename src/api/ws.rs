// =============================================================================
// WebSocket Handler — push-based chart updates
// =============================================================================
//
// Clients connect to `/api/v1/ws` and receive:
//   1. An immediate LiveUpdate on connect (tracked set, stream health, and
//      the latest bar of every tracked pair).
//   2. A fresh LiveUpdate every 500 ms whenever the data version has changed
//      since the last push.
//
// Full candle series are not pushed — consumers pull them over REST. The
// handler answers Ping frames with Pong and cleans up on disconnect.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use crate::app_state::AppState;

// =============================================================================
// WebSocket upgrade handler
// =============================================================================

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    info!("chart feed WebSocket accepted — upgrading");
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
}

// =============================================================================
// Connection handler
// =============================================================================

/// Manages a single WebSocket connection lifecycle: a 500 ms version-gated
/// push loop and a recv loop for control frames, multiplexed with
/// `tokio::select!`.
async fn handle_ws_connection(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    use futures_util::{SinkExt, StreamExt};

    // Send the initial update immediately.
    if let Err(e) = send_update(&mut sender, &state).await {
        warn!(error = %e, "failed to send initial live update");
        return;
    }
    let mut last_sent_version = state.current_version();

    let mut push_interval = interval(Duration::from_millis(500));

    loop {
        tokio::select! {
            // ── Push loop: check for version changes every 500 ms ───────
            _ = push_interval.tick() => {
                let current_version = state.current_version();
                if current_version != last_sent_version {
                    match send_update(&mut sender, &state).await {
                        Ok(()) => {
                            last_sent_version = current_version;
                        }
                        Err(e) => {
                            debug!(error = %e, "live update send failed — disconnecting");
                            break;
                        }
                    }
                }
            }

            // ── Recv loop: process incoming control frames ──────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sender.send(Message::Pong(data)).await {
                            debug!(error = %e, "failed to send Pong — disconnecting");
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("chart feed WebSocket closed by client");
                        break;
                    }
                    Some(Ok(_)) => {
                        // Text / Binary / Pong — nothing to do.
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "chart feed WebSocket receive error");
                        break;
                    }
                    None => {
                        info!("chart feed WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    info!("chart feed WebSocket connection closed");
}

// =============================================================================
// Helpers
// =============================================================================

/// Serialise and send the current LiveUpdate over the WebSocket.
async fn send_update<S>(sender: &mut S, state: &Arc<AppState>) -> Result<(), axum::Error>
where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin,
{
    use futures_util::SinkExt;

    let update = state.build_live_update();

    match serde_json::to_string(&update) {
        Ok(json) => {
            sender.send(Message::Text(json)).await?;
            debug!(version = update.state_version, "live update pushed");
            Ok(())
        }
        Err(e) => {
            warn!(error = %e, "failed to serialise live update");
            // Serialisation errors are not network errors; don't disconnect.
            Ok(())
        }
    }
}
