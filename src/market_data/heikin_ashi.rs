// =============================================================================
// Heikin-Ashi derivation
// =============================================================================
//
// Pure transform over a raw OHLC series, recomputed in full on every read.
// The derived series is never stored: keeping it as independent mutable
// state would give updates to the still-forming tail bar two sources of
// truth to drift between.
//
// Recurrence:
//   haOpen[0]  = (open[0] + close[0]) / 2
//   haClose[0] = close[0]
//   haOpen[i]  = (haOpen[i-1] + haClose[i-1]) / 2
//   haClose[i] = (haOpen[i] + open[i] + high[i] + close[i]) / 4
//   haHigh[i]  = max(high[i], haOpen[i], haClose[i])
//   haLow[i]   = min(low[i],  haOpen[i], haClose[i])
// =============================================================================

use super::candle::Candle;

/// Derive the Heikin-Ashi series from `candles` (ascending by timestamp).
///
/// Output candles carry the source timestamps and no volume. Empty input
/// produces empty output.
pub fn derive_heikin_ashi(candles: &[Candle]) -> Vec<Candle> {
    let first = match candles.first() {
        Some(first) => first,
        None => return Vec::new(),
    };

    let mut out = Vec::with_capacity(candles.len());

    let mut ha_open = (first.open + first.close) / 2.0;
    let mut ha_close = first.close;
    out.push(Candle::new(
        first.open_time,
        ha_open,
        first.high.max(ha_open).max(ha_close),
        first.low.min(ha_open).min(ha_close),
        ha_close,
        None,
    ));

    for c in &candles[1..] {
        let open = (ha_open + ha_close) / 2.0;
        let close = (open + c.open + c.high + c.close) / 4.0;
        out.push(Candle::new(
            c.open_time,
            open,
            c.high.max(open).max(close),
            c.low.min(open).min(close),
            close,
            None,
        ));
        ha_open = open;
        ha_close = close;
    }

    out
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn ohlc(open_time: i64, open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle::new(open_time, open, high, low, close, Some(1.0))
    }

    #[test]
    fn empty_input_empty_output() {
        assert!(derive_heikin_ashi(&[]).is_empty());
    }

    #[test]
    fn known_two_bar_series() {
        let raw = [ohlc(0, 10.0, 12.0, 9.0, 11.0), ohlc(1, 11.0, 13.0, 10.0, 12.0)];
        let ha = derive_heikin_ashi(&raw);
        assert_eq!(ha.len(), 2);

        assert!((ha[0].open - 10.5).abs() < 1e-12);
        assert!((ha[0].close - 11.0).abs() < 1e-12);
        assert!((ha[0].high - 12.0).abs() < 1e-12);
        assert!((ha[0].low - 9.0).abs() < 1e-12);

        assert!((ha[1].open - 10.75).abs() < 1e-12);
        // (10.75 + 11 + 13 + 12) / 4
        assert!((ha[1].close - 11.6875).abs() < 1e-12);
        assert!((ha[1].high - 13.0).abs() < 1e-12);
        assert!((ha[1].low - 10.0).abs() < 1e-12);
    }

    #[test]
    fn deterministic_across_calls() {
        let raw: Vec<Candle> = (0..50)
            .map(|i| {
                let base = 100.0 + (i as f64) * 0.7;
                ohlc(i, base, base + 2.0, base - 1.5, base + 0.5)
            })
            .collect();
        assert_eq!(derive_heikin_ashi(&raw), derive_heikin_ashi(&raw));
    }

    #[test]
    fn derived_candles_keep_their_envelope() {
        let raw = [
            ohlc(0, 50.0, 55.0, 48.0, 54.0),
            ohlc(1, 54.0, 54.5, 40.0, 41.0),
            ohlc(2, 41.0, 60.0, 41.0, 59.0),
        ];
        for c in derive_heikin_ashi(&raw) {
            assert!(c.is_well_formed(), "derived candle broke its envelope: {c:?}");
            assert!(c.volume.is_none());
        }
    }

    #[test]
    fn timestamps_are_preserved() {
        let raw = [ohlc(100, 1.0, 2.0, 0.5, 1.5), ohlc(200, 1.5, 2.5, 1.0, 2.0)];
        let ha = derive_heikin_ashi(&raw);
        assert_eq!(ha[0].open_time, 100);
        assert_eq!(ha[1].open_time, 200);
    }
}
