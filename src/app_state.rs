// =============================================================================
// Central Application State — chartfeed
// =============================================================================
//
// Thin shared state for the consumer API: the aggregator owns all market
// data; AppState just ties it to the runtime config and builds the payload
// the push feed sends. Wrapped in Arc and shared across all handler tasks.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::binance::BinanceClient;
use crate::market_data::{Aggregator, Candle};
use crate::runtime_config::RuntimeConfig;
use crate::types::Interval;

/// Shared state handed to every API handler.
pub struct AppState {
    pub runtime_config: Arc<RwLock<RuntimeConfig>>,
    pub aggregator: Arc<Aggregator>,
    pub client: Arc<BinanceClient>,
    /// Instant when the engine was started. Used for uptime reporting.
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(
        config: RuntimeConfig,
        aggregator: Arc<Aggregator>,
        client: Arc<BinanceClient>,
    ) -> Self {
        Self {
            runtime_config: Arc::new(RwLock::new(config)),
            aggregator,
            client,
            start_time: std::time::Instant::now(),
        }
    }

    /// Data version the push feed polls; bumped by the aggregator on every
    /// buffer mutation.
    pub fn current_version(&self) -> u64 {
        self.aggregator.data_version()
    }

    /// Build the compact payload pushed to WebSocket consumers: stream
    /// health plus the latest (possibly still-forming) bar of every tracked
    /// pair. Full series stay pull-only over REST.
    pub fn build_live_update(&self) -> LiveUpdate {
        let tracked = self.aggregator.tracked_symbols();

        let mut latest: HashMap<String, HashMap<&'static str, Candle>> = HashMap::new();
        for symbol in &tracked {
            let mut per_interval = HashMap::new();
            for interval in Interval::ALL {
                if let Some(candle) = self.aggregator.latest(symbol, interval) {
                    per_interval.insert(interval.as_str(), candle);
                }
            }
            latest.insert(symbol.clone(), per_interval);
        }

        LiveUpdate {
            state_version: self.current_version(),
            server_time: Utc::now().timestamp_millis(),
            stream: self.aggregator.stream_health().to_string(),
            last_seed_error: self.aggregator.last_seed_error(),
            tracked,
            latest,
        }
    }
}

/// Payload sent to push-feed consumers.
#[derive(Debug, Clone, Serialize)]
pub struct LiveUpdate {
    pub state_version: u64,
    pub server_time: i64,
    /// "connected" or "degraded".
    pub stream: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seed_error: Option<String>,
    pub tracked: Vec<String>,
    /// symbol -> interval -> latest candle.
    pub latest: HashMap<String, HashMap<&'static str, Candle>>,
}
