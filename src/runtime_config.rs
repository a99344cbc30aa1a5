// =============================================================================
// Runtime Configuration — chartfeed settings with atomic save
// =============================================================================
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
//
// The `symbols` field doubles as the persisted tracked set: main loads it at
// startup to seed the aggregator and writes the aggregator's final tracked
// set back on shutdown. The pipeline itself never touches this file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<String> {
    vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]
}

fn default_rest_base_url() -> String {
    "https://api.binance.com".to_string()
}

fn default_ws_url() -> String {
    "wss://stream.binance.com:9443/ws".to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_max_candles() -> usize {
    4096
}

fn default_snapshot_timeout_secs() -> u64 {
    10
}

fn default_refresh_secs() -> u64 {
    900
}

fn default_reconnect_floor_ms() -> u64 {
    1_000
}

fn default_reconnect_cap_ms() -> u64 {
    30_000
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the chartfeed engine.
///
/// Every field has a serde default so that older JSON files missing new
/// fields will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Tracked instruments -------------------------------------------------

    /// Symbols tracked at startup; rewritten with the live tracked set on
    /// shutdown.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    // --- Endpoints -----------------------------------------------------------

    /// REST base URL for snapshot fetches and the symbol directory.
    #[serde(default = "default_rest_base_url")]
    pub rest_base_url: String,

    /// WebSocket URL for the kline delta stream.
    #[serde(default = "default_ws_url")]
    pub ws_url: String,

    /// Address the consumer API listens on.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    // --- Pipeline tuning -----------------------------------------------------

    /// Per-buffer candle cap; the oldest bars are trimmed past it.
    #[serde(default = "default_max_candles")]
    pub max_candles: usize,

    /// Deadline for a single snapshot fetch, in seconds.
    #[serde(default = "default_snapshot_timeout_secs")]
    pub snapshot_timeout_secs: u64,

    /// Period of the background refresh sweep over all tracked pairs, in
    /// seconds. 0 disables the sweep (refresh stays available on demand).
    #[serde(default = "default_refresh_secs")]
    pub refresh_secs: u64,

    /// Smallest delay between stream reconnect attempts, in milliseconds.
    #[serde(default = "default_reconnect_floor_ms")]
    pub reconnect_floor_ms: u64,

    /// Largest delay between stream reconnect attempts, in milliseconds.
    #[serde(default = "default_reconnect_cap_ms")]
    pub reconnect_cap_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            rest_base_url: default_rest_base_url(),
            ws_url: default_ws_url(),
            bind_addr: default_bind_addr(),
            max_candles: default_max_candles(),
            snapshot_timeout_secs: default_snapshot_timeout_secs(),
            refresh_secs: default_refresh_secs(),
            reconnect_floor_ms: default_reconnect_floor_ms(),
            reconnect_cap_ms: default_reconnect_cap_ms(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }
}
