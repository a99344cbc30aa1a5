// =============================================================================
// IntervalBuffer — ordered, deduplicated candle series for one (symbol,
// interval) pair
// =============================================================================
//
// The tail entry is the current, possibly still-forming bar. Timestamps are
// strictly increasing by construction: the only mutation is the merge below,
// which appends, replaces the tail, or rejects. The lock is per-buffer and
// scoped to a single mutation or read, never held across I/O, so operations
// on different symbols do not contend.
// =============================================================================

use std::collections::VecDeque;

use parking_lot::RwLock;

use super::candle::Candle;

/// What a merge call did to the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// A new bar was appended; the previous tail is now implicitly final.
    Appended,
    /// The still-forming tail bar was overwritten with fresher values.
    ReplacedTail,
    /// The candle was older than the tail — dropped, no mutation.
    Rejected,
}

/// Thread-safe candle ring for one (symbol, interval) pair, trimmed to
/// `max_candles` from the front as new bars open.
pub struct IntervalBuffer {
    max_candles: usize,
    candles: RwLock<VecDeque<Candle>>,
}

impl IntervalBuffer {
    pub fn new(max_candles: usize) -> Self {
        Self {
            max_candles,
            candles: RwLock::new(VecDeque::new()),
        }
    }

    /// Merge one candle into the series.
    ///
    /// * Empty buffer — append.
    /// * Same timestamp as the tail — replace the tail (the open bar is
    ///   being updated; the newest version is authoritative).
    /// * Newer than the tail — append and trim the front past the cap.
    /// * Older than the tail — reject as an idempotent no-op; reordering
    ///   would break the strictly-increasing invariant.
    ///
    /// Seeding and live updates can race on the same buffer; this single
    /// merge law makes either arrival order converge to the same tail.
    pub fn merge(&self, candle: Candle) -> MergeOutcome {
        let mut candles = self.candles.write();

        let last_time = match candles.back() {
            Some(last) => last.open_time,
            None => {
                candles.push_back(candle);
                return MergeOutcome::Appended;
            }
        };

        if candle.open_time == last_time {
            if let Some(last) = candles.back_mut() {
                *last = candle;
            }
            MergeOutcome::ReplacedTail
        } else if candle.open_time > last_time {
            candles.push_back(candle);
            while candles.len() > self.max_candles {
                candles.pop_front();
            }
            MergeOutcome::Appended
        } else {
            MergeOutcome::Rejected
        }
    }

    /// Read-only copy of the current series, oldest first. Never blocks on
    /// anything but the momentary buffer lock.
    pub fn snapshot(&self) -> Vec<Candle> {
        self.candles.read().iter().copied().collect()
    }

    /// The current (possibly still-forming) tail bar, if any.
    pub fn latest(&self) -> Option<Candle> {
        self.candles.read().back().copied()
    }

    pub fn len(&self) -> usize {
        self.candles.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.read().is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn bar(open_time: i64, close: f64) -> Candle {
        Candle::new(open_time, close, close + 1.0, close - 1.0, close, Some(10.0))
    }

    #[test]
    fn empty_buffer_appends() {
        let buf = IntervalBuffer::new(100);
        assert_eq!(buf.merge(bar(100, 1.0)), MergeOutcome::Appended);
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn same_timestamp_replaces_tail() {
        let buf = IntervalBuffer::new(100);
        buf.merge(bar(100, 1.0));
        assert_eq!(buf.merge(bar(100, 2.0)), MergeOutcome::ReplacedTail);
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.latest().map(|c| c.close), Some(2.0));
    }

    #[test]
    fn replace_tail_is_idempotent() {
        let buf = IntervalBuffer::new(100);
        buf.merge(bar(100, 1.0));
        buf.merge(bar(200, 2.0));
        let once = {
            buf.merge(bar(200, 3.0));
            buf.snapshot()
        };
        // Merging the identical candle again leaves the buffer unchanged.
        buf.merge(bar(200, 3.0));
        buf.merge(bar(200, 3.0));
        assert_eq!(buf.snapshot(), once);
    }

    #[test]
    fn out_of_order_is_rejected_without_mutation() {
        let buf = IntervalBuffer::new(100);
        buf.merge(bar(100, 1.0));
        buf.merge(bar(200, 2.0));
        let before = buf.snapshot();
        assert_eq!(buf.merge(bar(150, 9.0)), MergeOutcome::Rejected);
        assert_eq!(buf.merge(bar(100, 9.0)), MergeOutcome::Rejected);
        assert_eq!(buf.snapshot(), before);
    }

    #[test]
    fn timestamps_stay_strictly_increasing() {
        let buf = IntervalBuffer::new(100);
        // Interleave appends, tail updates, and stale candles.
        for (t, c) in [
            (100, 1.0),
            (100, 1.5),
            (200, 2.0),
            (150, 9.0),
            (200, 2.5),
            (300, 3.0),
            (100, 9.0),
        ] {
            buf.merge(bar(t, c));
        }
        let series = buf.snapshot();
        for pair in series.windows(2) {
            assert!(pair[0].open_time < pair[1].open_time);
        }
        assert_eq!(series.len(), 3);
    }

    #[test]
    fn front_trimming_respects_cap() {
        let buf = IntervalBuffer::new(3);
        for t in 0..5 {
            buf.merge(bar(t * 60_000, t as f64));
        }
        assert_eq!(buf.len(), 3);
        let series = buf.snapshot();
        assert_eq!(series[0].open_time, 2 * 60_000);
        assert_eq!(series[2].open_time, 4 * 60_000);
    }

    #[test]
    fn snapshot_then_delta_scenario() {
        // Seed five one-unit bars at t=100..104, then live updates.
        let buf = IntervalBuffer::new(100);
        for t in 100..105 {
            buf.merge(bar(t, t as f64));
        }
        assert_eq!(buf.len(), 5);

        // Delta updating the open bar: length unchanged, close updated.
        buf.merge(bar(104, 42.0));
        assert_eq!(buf.len(), 5);
        assert_eq!(buf.latest().map(|c| c.close), Some(42.0));

        // Delta opening a new bar: length grows.
        buf.merge(bar(105, 43.0));
        assert_eq!(buf.len(), 6);
        assert_eq!(buf.latest().map(|c| c.open_time), Some(105));
    }

    #[test]
    fn empty_accessors() {
        let buf = IntervalBuffer::new(10);
        assert!(buf.is_empty());
        assert!(buf.latest().is_none());
        assert!(buf.snapshot().is_empty());
    }
}
