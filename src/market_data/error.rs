// =============================================================================
// Market-data error taxonomy
// =============================================================================
//
// Containment policy lives at the call sites, not here:
//   - a failed snapshot fetch degrades to an empty seed plus a visible error
//     flag on the aggregator, retried on the next track/refresh;
//   - a bad stream frame is dropped (logged) without touching any buffer;
//   - a stream transport error triggers the reconnect path and is surfaced
//     to consumers only as the degraded health flag.
// Nothing in this taxonomy is allowed to take the process down.
// =============================================================================

use std::time::Duration;

use thiserror::Error;

/// Errors produced at the snapshot-fetch and stream boundaries.
#[derive(Debug, Error)]
pub enum FeedError {
    /// Connection-level failure: refused, reset, DNS, TLS.
    #[error("transport error: {0}")]
    Transport(String),

    /// The peer answered, but not with what the protocol promises
    /// (non-2xx status, missing field, wrong JSON shape).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A bounded fetch exceeded its deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// A numeric field failed to parse, or a candle violates its own
    /// OHLC envelope.
    #[error("validation error: {0}")]
    Validation(String),
}
