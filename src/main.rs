// =============================================================================
// Chartfeed — Main Entry Point
// =============================================================================
//
// Boot order: config, market-data pipeline (stream subscriber + delta pump),
// initial tracking, background refresh sweep, consumer API. On Ctrl+C the
// current tracked set is written back to the config file so the next start
// resumes where this one left off.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod binance;
mod market_data;
mod runtime_config;
mod types;

use std::collections::HashSet;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::binance::BinanceClient;
use crate::market_data::{Aggregator, StreamHealthFlag, StreamSubscriber};
use crate::runtime_config::RuntimeConfig;
use crate::types::Interval;

const CONFIG_PATH: &str = "chartfeed_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Chartfeed starting up");

    let mut config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });

    // Override tracked symbols from env if available.
    if let Ok(syms) = std::env::var("CHARTFEED_SYMBOLS") {
        config.symbols = syms
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }
    if config.symbols.is_empty() {
        config.symbols = vec!["BTCUSDT".into(), "ETHUSDT".into()];
    }

    info!(
        symbols = ?config.symbols,
        intervals = ?Interval::ALL.iter().map(|i| i.as_str()).collect::<Vec<_>>(),
        "Configured chart feed"
    );

    // ── 2. Pipeline plumbing ─────────────────────────────────────────────
    let client = Arc::new(BinanceClient::new(
        config.rest_base_url.clone(),
        Duration::from_secs(config.snapshot_timeout_secs),
    ));

    let (delta_tx, delta_rx) = tokio::sync::mpsc::unbounded_channel();
    let (command_tx, command_rx) = tokio::sync::mpsc::unbounded_channel();
    let tracked = Arc::new(RwLock::new(HashSet::new()));
    let health = Arc::new(StreamHealthFlag::new());
    let version = Arc::new(AtomicU64::new(1));

    let aggregator = Arc::new(Aggregator::new(
        client.clone(),
        tracked.clone(),
        command_tx,
        health.clone(),
        version,
        config.max_candles,
    ));

    // ── 3. Stream subscriber ─────────────────────────────────────────────
    let subscriber = StreamSubscriber::new(
        config.ws_url.clone(),
        tracked,
        delta_tx,
        command_rx,
        health,
        Duration::from_millis(config.reconnect_floor_ms),
        Duration::from_millis(config.reconnect_cap_ms),
    );
    tokio::spawn(subscriber.run());

    // ── 4. Delta pump (the single live-update merge path) ────────────────
    tokio::spawn(aggregator.clone().run_delta_pump(delta_rx));

    // ── 5. Track the configured symbols ──────────────────────────────────
    for symbol in &config.symbols {
        aggregator.clone().track(symbol);
    }
    info!(count = config.symbols.len(), "Initial symbols tracked");

    // ── 6. Background refresh sweep ──────────────────────────────────────
    if config.refresh_secs > 0 {
        let refresh_agg = aggregator.clone();
        let period = Duration::from_secs(config.refresh_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick fires immediately; the track() seeds just ran.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                for symbol in refresh_agg.tracked_symbols() {
                    for interval in Interval::ALL {
                        if let Err(e) = refresh_agg.refresh(&symbol, interval).await {
                            warn!(
                                symbol = %symbol,
                                interval = %interval,
                                error = %e,
                                "periodic refresh failed"
                            );
                        }
                    }
                }
            }
        });
        info!(period_s = config.refresh_secs, "Refresh sweep scheduled");
    }

    // ── 7. Consumer API server ───────────────────────────────────────────
    let state = Arc::new(AppState::new(config, aggregator.clone(), client));

    let bind_addr = std::env::var("CHARTFEED_BIND_ADDR")
        .unwrap_or_else(|_| state.runtime_config.read().bind_addr.clone());
    let api_state = state.clone();
    let bind_addr_clone = bind_addr.clone();

    tokio::spawn(async move {
        let app = api::rest::router(api_state);
        let listener = tokio::net::TcpListener::bind(&bind_addr_clone)
            .await
            .expect("Failed to bind API server");
        info!(addr = %bind_addr_clone, "API server listening");
        axum::serve(listener, app)
            .await
            .expect("API server failed");
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 8. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    // Persist the live tracked set so the next start resumes it.
    {
        let mut cfg = state.runtime_config.write();
        cfg.symbols = aggregator.tracked_symbols();
    }
    if let Err(e) = state.runtime_config.read().save(CONFIG_PATH) {
        error!(error = %e, "Failed to save runtime config on shutdown");
    }

    info!("Chartfeed shut down complete.");
    Ok(())
}
