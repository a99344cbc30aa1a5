// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. The surface is read-mostly and
// unauthenticated; CORS is configured permissively for development.
//
// This layer is the consumer boundary: chart-row timestamps leave here
// shifted by the fixed display offset and scaled to seconds, matching what
// the rendering side feeds its chart library. Buffers never see that offset.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use crate::app_state::AppState;
use crate::market_data::Candle;
use crate::types::{ChartKind, Interval};

/// Fixed presentation shift applied to outgoing chart rows: UTC+5:30.
const DISPLAY_OFFSET_MS: i64 = 19_800_000;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/symbols", get(symbols))
        .route("/api/v1/tracked", get(tracked).post(track))
        .route("/api/v1/tracked/:symbol", delete(untrack))
        .route("/api/v1/refresh", post(refresh))
        .route("/api/v1/candles", get(candles))
        .route("/api/v1/latest", get(latest))
        // ── WebSocket push feed (handled in the ws module) ──────────────
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health
// =============================================================================

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "stream": state.aggregator.stream_health().to_string(),
        "last_seed_error": state.aggregator.last_seed_error(),
        "state_version": state.current_version(),
        "server_time": chrono::Utc::now().timestamp_millis(),
        "uptime_s": state.start_time.elapsed().as_secs(),
    }))
}

// =============================================================================
// Symbol directory
// =============================================================================

async fn symbols(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.client.list_usdt_symbols().await {
        Ok(list) => Json(json!({ "symbols": list })).into_response(),
        Err(e) => {
            warn!(error = %e, "symbol directory fetch failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

// =============================================================================
// Tracking
// =============================================================================

async fn tracked(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({ "tracked": state.aggregator.tracked_symbols() }))
}

#[derive(Deserialize)]
struct TrackRequest {
    symbol: String,
}

async fn track(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TrackRequest>,
) -> impl IntoResponse {
    let symbol = req.symbol.trim().to_uppercase();
    if symbol.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "symbol must not be empty" })),
        )
            .into_response();
    }

    let added = state.aggregator.clone().track(&symbol);
    Json(json!({
        "symbol": symbol,
        "added": added,
        "tracked": state.aggregator.tracked_symbols(),
    }))
    .into_response()
}

async fn untrack(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
) -> impl IntoResponse {
    if state.aggregator.untrack(&symbol) {
        Json(json!({
            "symbol": symbol.to_uppercase(),
            "removed": true,
            "tracked": state.aggregator.tracked_symbols(),
        }))
        .into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("{symbol} is not tracked") })),
        )
            .into_response()
    }
}

// =============================================================================
// Refresh
// =============================================================================

#[derive(Deserialize)]
struct RefreshRequest {
    symbol: String,
    /// Single interval to refresh; all intervals when omitted.
    interval: Option<String>,
}

async fn refresh(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RefreshRequest>,
) -> impl IntoResponse {
    if !state.aggregator.is_tracked(&req.symbol) {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("{} is not tracked", req.symbol) })),
        )
            .into_response();
    }

    let intervals: Vec<Interval> = match &req.interval {
        Some(s) => match Interval::parse(s) {
            Some(interval) => vec![interval],
            None => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "error": format!("unknown interval: {s}") })),
                )
                    .into_response();
            }
        },
        None => Interval::ALL.to_vec(),
    };

    let mut refreshed = Vec::new();
    let mut failures = Vec::new();
    for interval in intervals {
        match state.aggregator.refresh(&req.symbol, interval).await {
            Ok(()) => refreshed.push(interval.as_str()),
            Err(e) => failures.push(json!({
                "interval": interval.as_str(),
                "error": e.to_string(),
            })),
        }
    }

    Json(json!({
        "symbol": req.symbol.trim().to_uppercase(),
        "refreshed": refreshed,
        "failures": failures,
    }))
    .into_response()
}

// =============================================================================
// Series reads
// =============================================================================

#[derive(Deserialize)]
struct SeriesQuery {
    symbol: String,
    interval: String,
    /// candlestick | bar | line | area | heikinashi; defaults to candlestick.
    kind: Option<String>,
}

async fn candles(
    State(state): State<Arc<AppState>>,
    Query(q): Query<SeriesQuery>,
) -> impl IntoResponse {
    let interval = match Interval::parse(&q.interval) {
        Some(interval) => interval,
        None => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("unknown interval: {}", q.interval) })),
            )
                .into_response();
        }
    };

    let kind = match &q.kind {
        None => ChartKind::default(),
        Some(s) => match ChartKind::parse(s) {
            Some(kind) => kind,
            None => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "error": format!("unknown chart kind: {s}") })),
                )
                    .into_response();
            }
        },
    };

    match state.aggregator.snapshot_as(&q.symbol, interval, kind) {
        Some(series) => Json(json!({
            "symbol": q.symbol.trim().to_uppercase(),
            "interval": interval.as_str(),
            "kind": kind.as_str(),
            "rows": to_chart_rows(&series, kind),
        }))
        .into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("{} is not tracked", q.symbol) })),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
struct LatestQuery {
    symbol: String,
    interval: String,
}

async fn latest(
    State(state): State<Arc<AppState>>,
    Query(q): Query<LatestQuery>,
) -> impl IntoResponse {
    let interval = match Interval::parse(&q.interval) {
        Some(interval) => interval,
        None => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("unknown interval: {}", q.interval) })),
            )
                .into_response();
        }
    };

    match state.aggregator.latest(&q.symbol, interval) {
        Some(candle) => Json(json!({
            "symbol": q.symbol.trim().to_uppercase(),
            "interval": interval.as_str(),
            "candle": to_chart_rows(&[candle], ChartKind::Candlestick)
                .pop()
                .unwrap_or(serde_json::Value::Null),
        }))
        .into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("no data for {}@{}", q.symbol, interval) })),
        )
            .into_response(),
    }
}

// =============================================================================
// Chart row shaping (the consumer boundary)
// =============================================================================

/// Display timestamp: offset shift, then epoch seconds — the resolution the
/// chart library expects.
fn display_time(open_time: i64) -> i64 {
    (open_time + DISPLAY_OFFSET_MS) / 1000
}

/// Serialise a series into rows for the requested representation. OHLC kinds
/// keep the full bar (plus volume when the series carries it); line/area
/// collapse to close-price points.
fn to_chart_rows(series: &[Candle], kind: ChartKind) -> Vec<serde_json::Value> {
    series
        .iter()
        .map(|c| match kind {
            ChartKind::Line | ChartKind::Area => json!({
                "time": display_time(c.open_time),
                "value": c.close,
            }),
            _ => {
                let mut row = json!({
                    "time": display_time(c.open_time),
                    "open": c.open,
                    "high": c.high,
                    "low": c.low,
                    "close": c.close,
                });
                if let Some(volume) = c.volume {
                    row["volume"] = json!(volume);
                }
                row
            }
        })
        .collect()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_time_applies_offset_and_seconds() {
        // 1970-01-01T00:00:00Z shifts to +5:30 in seconds.
        assert_eq!(display_time(0), 19_800);
        assert_eq!(display_time(1_700_000_000_000), (1_700_000_000_000 + 19_800_000) / 1000);
    }

    #[test]
    fn ohlc_rows_keep_the_full_bar() {
        let series = [Candle::new(60_000, 1.0, 2.0, 0.5, 1.5, Some(10.0))];
        let rows = to_chart_rows(&series, ChartKind::Candlestick);
        assert_eq!(rows[0]["time"], json!((60_000 + DISPLAY_OFFSET_MS) / 1000));
        assert_eq!(rows[0]["open"], json!(1.0));
        assert_eq!(rows[0]["volume"], json!(10.0));
    }

    #[test]
    fn derived_rows_omit_volume() {
        let series = [Candle::new(60_000, 1.0, 2.0, 0.5, 1.5, None)];
        let rows = to_chart_rows(&series, ChartKind::HeikinAshi);
        assert!(rows[0].get("volume").is_none());
        assert_eq!(rows[0]["close"], json!(1.5));
    }

    #[test]
    fn line_rows_are_close_points() {
        let series = [
            Candle::new(0, 1.0, 2.0, 0.5, 1.5, Some(10.0)),
            Candle::new(60_000, 1.5, 2.5, 1.0, 2.0, Some(11.0)),
        ];
        let rows = to_chart_rows(&series, ChartKind::Line);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["value"], json!(1.5));
        assert_eq!(rows[1]["value"], json!(2.0));
        assert!(rows[0].get("open").is_none());
    }
}
