// =============================================================================
// Binance REST API Client — public market-data endpoints only
// =============================================================================
//
// Every endpoint chartfeed consumes (klines, ticker prices) is public and
// unsigned, so the client carries no credentials. All requests share one
// bounded timeout; a fetch that exceeds it is reported as FeedError::Timeout
// and the caller treats it like any other failed seed.
// =============================================================================

use std::time::Duration;

use tracing::{debug, warn};

use crate::market_data::candle::{parse_json_f64, Candle};
use crate::market_data::error::FeedError;
use crate::types::Interval;

/// Binance REST client for public market data.
#[derive(Debug, Clone)]
pub struct BinanceClient {
    base_url: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl BinanceClient {
    /// Create a new client against `base_url` with a per-request `timeout`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build reqwest client");

        Self {
            base_url: base_url.into(),
            timeout,
            client,
        }
    }

    // -------------------------------------------------------------------------
    // Historical snapshot
    // -------------------------------------------------------------------------

    /// GET /api/v3/klines — fetch up to `limit` candles closing at or before
    /// `end_time` (exclusive upper bound, epoch millis), ascending by
    /// openTime.
    ///
    /// Array indices of each row:
    ///   [0] openTime, [1] open, [2] high, [3] low, [4] close, [5] volume,
    ///   [6] closeTime, ...
    ///
    /// A malformed row is skipped with a warning; a malformed body is a
    /// protocol error. The method never retries — retry policy belongs to
    /// the caller's track/refresh cycle.
    pub async fn fetch_klines(
        &self,
        symbol: &str,
        interval: Interval,
        end_time: i64,
        limit: u32,
    ) -> Result<Vec<Candle>, FeedError> {
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&endTime={}&limit={}",
            self.base_url, symbol, interval, end_time, limit
        );

        let body = self.get_json(&url, "/api/v3/klines").await?;
        let raw = body
            .as_array()
            .ok_or_else(|| FeedError::Protocol("klines response is not an array".into()))?;

        let mut candles = Vec::with_capacity(raw.len());
        for entry in raw {
            match parse_kline_row(entry) {
                Ok(candle) => candles.push(candle),
                Err(e) => {
                    warn!(symbol, interval = %interval, error = %e, "skipping malformed kline row");
                }
            }
        }

        debug!(symbol, interval = %interval, count = candles.len(), "klines fetched");
        Ok(candles)
    }

    // -------------------------------------------------------------------------
    // Symbol directory
    // -------------------------------------------------------------------------

    /// GET /api/v3/ticker/price — every tradable symbol whose name contains
    /// "USDT", sorted. Feeds the consumer's symbol picker.
    pub async fn list_usdt_symbols(&self) -> Result<Vec<String>, FeedError> {
        let url = format!("{}/api/v3/ticker/price", self.base_url);

        let body = self.get_json(&url, "/api/v3/ticker/price").await?;
        let raw = body
            .as_array()
            .ok_or_else(|| FeedError::Protocol("ticker response is not an array".into()))?;

        let mut symbols: Vec<String> = raw
            .iter()
            .filter_map(|entry| entry["symbol"].as_str())
            .filter(|s| s.contains("USDT"))
            .map(str::to_string)
            .collect();
        symbols.sort();

        debug!(count = symbols.len(), "USDT symbols listed");
        Ok(symbols)
    }

    // -------------------------------------------------------------------------
    // Internal helpers
    // -------------------------------------------------------------------------

    async fn get_json(&self, url: &str, endpoint: &str) -> Result<serde_json::Value, FeedError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = resp.status();
        let body: serde_json::Value = resp.json().await.map_err(|e| self.classify(e))?;

        if !status.is_success() {
            return Err(FeedError::Protocol(format!(
                "GET {endpoint} returned {status}: {body}"
            )));
        }
        Ok(body)
    }

    fn classify(&self, e: reqwest::Error) -> FeedError {
        if e.is_timeout() {
            FeedError::Timeout(self.timeout)
        } else if e.is_decode() {
            FeedError::Protocol(e.to_string())
        } else {
            FeedError::Transport(e.to_string())
        }
    }
}

/// Parse one kline row from the array-of-arrays response format.
fn parse_kline_row(entry: &serde_json::Value) -> Result<Candle, FeedError> {
    let arr = entry
        .as_array()
        .ok_or_else(|| FeedError::Protocol("kline row is not an array".into()))?;

    if arr.len() < 6 {
        return Err(FeedError::Protocol(format!(
            "kline row has {} elements, expected at least 6",
            arr.len()
        )));
    }

    let open_time = arr[0]
        .as_i64()
        .ok_or_else(|| FeedError::Protocol("kline row openTime is not an integer".into()))?;
    let open = parse_json_f64(&arr[1], "open")?;
    let high = parse_json_f64(&arr[2], "high")?;
    let low = parse_json_f64(&arr[3], "low")?;
    let close = parse_json_f64(&arr[4], "close")?;
    let volume = parse_json_f64(&arr[5], "volume")?;

    let candle = Candle::new(open_time, open, high, low, close, Some(volume));
    if !candle.is_well_formed() {
        return Err(FeedError::Validation(format!(
            "kline row at {open_time} violates low <= open,close <= high"
        )));
    }
    Ok(candle)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_kline_row_ok() {
        let row = serde_json::json!([
            1700000000000i64,
            "37000.00",
            "37050.00",
            "36990.00",
            "37020.00",
            "123.456",
            1700000059999i64,
            "4567890.12",
            1500,
            "60.123",
            "2224455.66",
            "0"
        ]);
        let candle = parse_kline_row(&row).expect("should parse");
        assert_eq!(candle.open_time, 1_700_000_000_000);
        assert!((candle.open - 37_000.0).abs() < f64::EPSILON);
        assert!((candle.close - 37_020.0).abs() < f64::EPSILON);
        assert_eq!(candle.volume, Some(123.456));
    }

    #[test]
    fn parse_kline_row_numeric_values() {
        // Some proxies re-encode the string fields as raw numbers.
        let row = serde_json::json!([1000i64, 1.0, 2.0, 0.5, 1.5, 10.0]);
        let candle = parse_kline_row(&row).expect("should parse");
        assert!((candle.high - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn short_row_is_a_protocol_error() {
        let row = serde_json::json!([1000i64, "1.0", "2.0"]);
        assert!(matches!(
            parse_kline_row(&row),
            Err(FeedError::Protocol(_))
        ));
    }

    #[test]
    fn bad_number_is_a_validation_error() {
        let row = serde_json::json!([1000i64, "abc", "2.0", "0.5", "1.5", "10"]);
        assert!(matches!(
            parse_kline_row(&row),
            Err(FeedError::Validation(_))
        ));
    }

    #[test]
    fn broken_envelope_is_a_validation_error() {
        // close above high.
        let row = serde_json::json!([1000i64, "1.0", "2.0", "0.5", "3.0", "10"]);
        assert!(matches!(
            parse_kline_row(&row),
            Err(FeedError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn unroutable_endpoint_is_a_transport_error() {
        let client = BinanceClient::new("http://127.0.0.1:9", Duration::from_millis(250));
        let err = client
            .fetch_klines("BTCUSDT", Interval::OneMinute, 1_700_000_000_000, 10)
            .await
            .unwrap_err();
        assert!(
            matches!(err, FeedError::Transport(_) | FeedError::Timeout(_)),
            "unexpected error kind: {err:?}"
        );
    }
}
