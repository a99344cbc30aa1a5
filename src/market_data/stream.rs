// =============================================================================
// Kline stream subscriber
// =============================================================================
//
// One long-lived WebSocket connection carries the kline channels for every
// tracked symbol across the fixed interval set. The connection walks
// Disconnected -> Connecting -> Subscribed and falls back to Disconnected on
// any transport error or close, with exponential reconnect backoff between
// attempts (floored so a flapping endpoint can never busy-loop us).
//
// On every (re)connect the subscriber sends one SUBSCRIBE for the *current*
// full symbol set — not the delta since the last connect — so resubscription
// stays correct no matter what changed while we were down. While subscribed,
// set changes arrive as StreamCommands and go out as incremental
// SUBSCRIBE/UNSUBSCRIBE control messages.
//
// A malformed frame is dropped with a warning; it never terminates the
// connection.
// =============================================================================

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::types::Interval;

use super::candle::{parse_delta_frame, DeltaEvent};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Smallest reconnect delay we will ever accept, whatever the config says.
const MIN_BACKOFF_FLOOR: Duration = Duration::from_millis(250);

// ---------------------------------------------------------------------------
// Health flag
// ---------------------------------------------------------------------------

/// Stream connection health as seen by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamHealth {
    /// Connected and subscribed; deltas are flowing.
    Connected,
    /// Between connections (startup, reconnect backoff). Buffers still serve
    /// reads; they are just not receiving live updates right now.
    Degraded,
}

impl std::fmt::Display for StreamHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connected => write!(f, "connected"),
            Self::Degraded => write!(f, "degraded"),
        }
    }
}

/// Lock-free health flag shared between the subscriber task and readers.
pub struct StreamHealthFlag {
    connected: AtomicBool,
}

impl StreamHealthFlag {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
        }
    }

    fn set(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn get(&self) -> StreamHealth {
        if self.connected.load(Ordering::SeqCst) {
            StreamHealth::Connected
        } else {
            StreamHealth::Degraded
        }
    }
}

impl Default for StreamHealthFlag {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Incremental subscription change sent by the aggregator while the shared
/// symbol set is already updated. The subscriber turns it into a control
/// message when connected; when disconnected the command is superseded by
/// the full resubscribe of the next connect.
#[derive(Debug, Clone)]
pub enum StreamCommand {
    Subscribe(String),
    Unsubscribe(String),
}

// ---------------------------------------------------------------------------
// Subscriber
// ---------------------------------------------------------------------------

pub struct StreamSubscriber {
    ws_url: String,
    /// Current tracked symbol set, shared with the aggregator (the single
    /// writer); read here to build the full subscribe payload on connect.
    symbols: Arc<RwLock<HashSet<String>>>,
    deltas: mpsc::UnboundedSender<DeltaEvent>,
    commands: mpsc::UnboundedReceiver<StreamCommand>,
    health: Arc<StreamHealthFlag>,
    backoff_floor: Duration,
    backoff_cap: Duration,
}

impl StreamSubscriber {
    pub fn new(
        ws_url: String,
        symbols: Arc<RwLock<HashSet<String>>>,
        deltas: mpsc::UnboundedSender<DeltaEvent>,
        commands: mpsc::UnboundedReceiver<StreamCommand>,
        health: Arc<StreamHealthFlag>,
        backoff_floor: Duration,
        backoff_cap: Duration,
    ) -> Self {
        let backoff_floor = backoff_floor.max(MIN_BACKOFF_FLOOR);
        Self {
            ws_url,
            symbols,
            deltas,
            commands,
            health,
            backoff_floor,
            backoff_cap: backoff_cap.max(backoff_floor),
        }
    }

    /// Drive the connection state machine until the command channel closes
    /// (aggregator gone), reconnecting forever on failure.
    pub async fn run(mut self) {
        let mut backoff = self.backoff_floor;
        loop {
            self.health.set(false);
            debug!(url = %self.ws_url, "kline stream connecting");

            match connect_async(&self.ws_url).await {
                Ok((ws, _response)) => {
                    info!(url = %self.ws_url, "kline stream connected");
                    backoff = self.backoff_floor;
                    match self.drive_connection(ws).await {
                        Ok(()) => {
                            info!("kline stream subscriber shutting down");
                            return;
                        }
                        Err(reason) => {
                            warn!(reason = %reason, "kline stream disconnected");
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "kline stream connect failed");
                }
            }

            self.health.set(false);
            debug!(delay_ms = backoff.as_millis() as u64, "kline stream reconnect scheduled");
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.backoff_cap);
        }
    }

    /// Run one established connection. `Err(reason)` means the transport
    /// dropped and the caller should reconnect; `Ok(())` means the command
    /// channel closed and the subscriber should stop for good.
    async fn drive_connection(&mut self, ws: WsStream) -> Result<(), String> {
        let (mut write, mut read) = ws.split();

        // Commands queued while disconnected are already reflected in the
        // shared symbol set; the full resubscribe below supersedes them.
        while let Ok(cmd) = self.commands.try_recv() {
            debug!(command = ?cmd, "stale command superseded by full resubscribe");
        }

        let mut next_id: u64 = 0;
        let channels = {
            let symbols = self.symbols.read();
            kline_channels(&symbols)
        };
        if !channels.is_empty() {
            next_id += 1;
            let msg = control_message("SUBSCRIBE", &channels, next_id);
            write
                .send(Message::Text(msg))
                .await
                .map_err(|e| format!("subscribe send failed: {e}"))?;
            info!(channels = channels.len(), id = next_id, "kline channels subscribed");
        }
        self.health.set(true);

        let deltas = self.deltas.clone();

        loop {
            tokio::select! {
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => match parse_delta_frame(&text) {
                        Ok(Some(event)) => {
                            if deltas.send(event).is_err() {
                                // Aggregator side is gone; nothing left to feed.
                                return Ok(());
                            }
                        }
                        Ok(None) => debug!("non-kline frame ignored"),
                        Err(e) => warn!(error = %e, "malformed stream frame dropped"),
                    },
                    Some(Ok(Message::Ping(payload))) => {
                        if let Err(e) = write.send(Message::Pong(payload)).await {
                            return Err(format!("pong send failed: {e}"));
                        }
                    }
                    Some(Ok(Message::Close(_))) => return Err("closed by server".into()),
                    Some(Ok(_)) => {} // Pong / Binary frames — nothing to do.
                    Some(Err(e)) => return Err(format!("read error: {e}")),
                    None => return Err("stream ended".into()),
                },
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => {
                        let (method, symbol) = match &cmd {
                            StreamCommand::Subscribe(symbol) => ("SUBSCRIBE", symbol),
                            StreamCommand::Unsubscribe(symbol) => ("UNSUBSCRIBE", symbol),
                        };
                        let channels = symbol_channels(symbol);
                        next_id += 1;
                        let msg = control_message(method, &channels, next_id);
                        if let Err(e) = write.send(Message::Text(msg)).await {
                            return Err(format!("{method} send failed: {e}"));
                        }
                        info!(symbol = %symbol, method, id = next_id, "subscription updated");
                    }
                    None => return Ok(()),
                },
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Channel / control message helpers
// ---------------------------------------------------------------------------

/// Channel names for one symbol across the fixed interval set:
/// `{symbol}@kline_{interval}`, lower-cased symbol.
fn symbol_channels(symbol: &str) -> Vec<String> {
    let lower = symbol.to_lowercase();
    Interval::ALL
        .iter()
        .map(|interval| format!("{lower}@kline_{interval}"))
        .collect()
}

/// Channel names for the whole tracked set, sorted for deterministic
/// subscribe payloads.
fn kline_channels(symbols: &HashSet<String>) -> Vec<String> {
    let mut channels: Vec<String> = symbols
        .iter()
        .flat_map(|symbol| symbol_channels(symbol))
        .collect();
    channels.sort();
    channels
}

fn control_message(method: &str, channels: &[String], id: u64) -> String {
    json!({
        "method": method,
        "params": channels,
        "id": id,
    })
    .to_string()
}
