// =============================================================================
// Candle, series key, and stream frame parsing
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::types::Interval;

use super::error::FeedError;

/// A single OHLCV candle, timestamped with the exchange-reported bucket open
/// time in epoch milliseconds.
///
/// `volume` is absent on derived series (Heikin-Ashi has no meaningful
/// volume of its own).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
}

impl Candle {
    pub fn new(
        open_time: i64,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: Option<f64>,
    ) -> Self {
        Self {
            open_time,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// OHLC envelope invariant: `low <= open,close <= high`.
    pub fn is_well_formed(&self) -> bool {
        self.low <= self.open
            && self.low <= self.close
            && self.open <= self.high
            && self.close <= self.high
    }
}

/// Composite key that identifies a unique candle series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct CandleKey {
    pub symbol: String,
    pub interval: Interval,
}

impl std::fmt::Display for CandleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.interval)
    }
}

/// A parsed push update for one (symbol, interval) bar.
///
/// `is_final` mirrors the exchange's bar-closed flag. It is advisory only
/// (UI hint, log line): the merge algorithm never consults it.
#[derive(Debug, Clone, PartialEq)]
pub struct DeltaEvent {
    pub key: CandleKey,
    pub candle: Candle,
    pub is_final: bool,
}

// ---------------------------------------------------------------------------
// Stream frame parsing
// ---------------------------------------------------------------------------

/// Parse one text frame from the kline stream.
///
/// Accepts both the combined-stream envelope and the direct payload:
/// ```json
/// { "stream": "btcusdt@kline_1m", "data": { "e": "kline", "s": "BTCUSDT", "k": { ... } } }
/// { "e": "kline", "s": "BTCUSDT", "k": { ... } }
/// ```
///
/// Returns `Ok(None)` for frames that are valid but not ours (subscribe
/// acks, other event types, intervals outside the fixed set) and `Err` for
/// malformed frames. Either way the caller drops the frame without touching
/// any buffer.
pub fn parse_delta_frame(text: &str) -> Result<Option<DeltaEvent>, FeedError> {
    let root: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| FeedError::Protocol(format!("frame is not valid JSON: {e}")))?;

    // Combined-stream envelope or direct single-stream payload.
    let data = if root.get("data").is_some() {
        &root["data"]
    } else {
        &root
    };

    // Subscribe acks ({"result":null,"id":1}) and non-kline events.
    if data.get("e").and_then(|v| v.as_str()) != Some("kline") {
        return Ok(None);
    }

    let symbol = data["s"]
        .as_str()
        .ok_or_else(|| FeedError::Protocol("kline frame missing field s".into()))?
        .to_uppercase();

    let k = &data["k"];

    let interval = match k["i"].as_str() {
        Some(s) => match Interval::parse(s) {
            Some(interval) => interval,
            // An interval we never subscribe to — not ours.
            None => return Ok(None),
        },
        None => return Err(FeedError::Protocol("kline frame missing field k.i".into())),
    };

    let open_time = k["t"]
        .as_i64()
        .ok_or_else(|| FeedError::Protocol("kline frame missing field k.t".into()))?;

    let open = parse_json_f64(&k["o"], "k.o")?;
    let high = parse_json_f64(&k["h"], "k.h")?;
    let low = parse_json_f64(&k["l"], "k.l")?;
    let close = parse_json_f64(&k["c"], "k.c")?;
    let volume = parse_json_f64(&k["v"], "k.v")?;

    let is_final = k["x"]
        .as_bool()
        .ok_or_else(|| FeedError::Protocol("kline frame missing field k.x".into()))?;

    let candle = Candle::new(open_time, open, high, low, close, Some(volume));
    if !candle.is_well_formed() {
        return Err(FeedError::Validation(format!(
            "kline at {open_time} violates low <= open,close <= high"
        )));
    }

    Ok(Some(DeltaEvent {
        key: CandleKey { symbol, interval },
        candle,
        is_final,
    }))
}

/// The exchange sends numeric values as JSON strings inside kline objects;
/// accept either a string or a number.
pub fn parse_json_f64(val: &serde_json::Value, name: &str) -> Result<f64, FeedError> {
    match val {
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .map_err(|_| FeedError::Validation(format!("field {name} is not a number: {s}"))),
        serde_json::Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| FeedError::Validation(format!("field {name} is not a valid f64"))),
        _ => Err(FeedError::Protocol(format!(
            "field {name} has unexpected JSON type"
        ))),
    }
}
