// =============================================================================
// Aggregator — tracked symbols × fixed intervals, one buffer per pair
// =============================================================================
//
// The aggregator is the single writer of every IntervalBuffer. Live deltas
// are merged on the delta-pump task; snapshot seeds run as independent
// parallel fetch tasks that each terminate by handing their rows to the same
// merge law, so the seed/live race converges either way (stale rows are
// rejected as no-ops).
//
// Consumers only ever get copies: `snapshot`/`latest` never block on network
// activity and hand out no mutable handles.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::binance::client::BinanceClient;
use crate::types::{ChartKind, Interval};

use super::candle::{Candle, CandleKey, DeltaEvent};
use super::error::FeedError;
use super::heikin_ashi::derive_heikin_ashi;
use super::interval_buffer::{IntervalBuffer, MergeOutcome};
use super::stream::{StreamCommand, StreamHealth, StreamHealthFlag};

pub struct Aggregator {
    client: Arc<BinanceClient>,
    /// One buffer per (tracked symbol, interval) pair. The map lock is held
    /// only to look up / insert / remove `Arc`s; all candle mutation happens
    /// under the per-buffer lock, so symbols never contend with each other.
    buffers: RwLock<HashMap<CandleKey, Arc<IntervalBuffer>>>,
    /// Tracked symbol set, shared with the stream subscriber.
    tracked: Arc<RwLock<HashSet<String>>>,
    commands: mpsc::UnboundedSender<StreamCommand>,
    health: Arc<StreamHealthFlag>,
    /// Bumped on every buffer mutation; the push feed polls it.
    version: Arc<AtomicU64>,
    max_candles: usize,

    /// Seed fetches still in flight, keyed by symbol; aborted on untrack.
    seed_tasks: Mutex<HashMap<String, Vec<JoinHandle<()>>>>,
    /// Per-symbol tracking epoch. A seed fetch captures the epoch at spawn
    /// time and its rows are discarded unless the epoch still matches when
    /// it completes — a straggler from before an untrack (or re-track)
    /// cannot resurrect or pollute a buffer.
    epoch_counter: AtomicU64,
    epochs: RwLock<HashMap<String, u64>>,

    /// Most recent snapshot-seed failure, surfaced via the health endpoint.
    last_seed_error: RwLock<Option<String>>,
}

impl Aggregator {
    pub fn new(
        client: Arc<BinanceClient>,
        tracked: Arc<RwLock<HashSet<String>>>,
        commands: mpsc::UnboundedSender<StreamCommand>,
        health: Arc<StreamHealthFlag>,
        version: Arc<AtomicU64>,
        max_candles: usize,
    ) -> Self {
        Self {
            client,
            buffers: RwLock::new(HashMap::new()),
            tracked,
            commands,
            health,
            version,
            max_candles,
            seed_tasks: Mutex::new(HashMap::new()),
            epoch_counter: AtomicU64::new(0),
            epochs: RwLock::new(HashMap::new()),
            last_seed_error: RwLock::new(None),
        }
    }

    // -------------------------------------------------------------------------
    // Tracking
    // -------------------------------------------------------------------------

    /// Start tracking `symbol`: create empty buffers for every interval,
    /// subscribe its stream channels, and seed each buffer from the snapshot
    /// endpoint (one independent fetch per interval).
    ///
    /// Idempotent — returns `false` without side effects when the symbol is
    /// already tracked.
    ///
    /// Takes an `Arc` receiver because the seed tasks it spawns outlive the
    /// call; callers keep their handle with `aggregator.clone().track(..)`.
    pub fn track(self: Arc<Self>, symbol: &str) -> bool {
        let symbol = normalize(symbol);
        {
            let mut tracked = self.tracked.write();
            if !tracked.insert(symbol.clone()) {
                debug!(symbol = %symbol, "track ignored — already tracked");
                return false;
            }
        }

        let epoch = self.epoch_counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.epochs.write().insert(symbol.clone(), epoch);

        {
            let mut buffers = self.buffers.write();
            for interval in Interval::ALL {
                buffers.insert(
                    CandleKey {
                        symbol: symbol.clone(),
                        interval,
                    },
                    Arc::new(IntervalBuffer::new(self.max_candles)),
                );
            }
        }

        if self.commands.send(StreamCommand::Subscribe(symbol.clone())).is_err() {
            warn!(symbol = %symbol, "stream subscriber is gone — no live updates");
        }

        // Seed in parallel: the per-interval fetches are independent.
        let end_time = chrono::Utc::now().timestamp_millis();
        let mut handles = Vec::with_capacity(Interval::ALL.len());
        for interval in Interval::ALL {
            let agg = Arc::clone(&self);
            let sym = symbol.clone();
            handles.push(tokio::spawn(async move {
                agg.seed(&sym, interval, end_time, epoch).await;
            }));
        }
        self.seed_tasks.lock().insert(symbol.clone(), handles);

        self.bump_version();
        info!(symbol = %symbol, intervals = Interval::ALL.len(), "tracking symbol");
        true
    }

    /// Stop tracking `symbol`: cancel in-flight seeds, drop every buffer,
    /// and unsubscribe its stream channels. Returns `false` if it was not
    /// tracked. (Asking the user for confirmation is the consumer's job.)
    pub fn untrack(&self, symbol: &str) -> bool {
        let symbol = normalize(symbol);
        if !self.tracked.write().remove(&symbol) {
            return false;
        }

        self.epochs.write().remove(&symbol);
        if let Some(handles) = self.seed_tasks.lock().remove(&symbol) {
            for handle in &handles {
                handle.abort();
            }
        }

        {
            let mut buffers = self.buffers.write();
            for interval in Interval::ALL {
                buffers.remove(&CandleKey {
                    symbol: symbol.clone(),
                    interval,
                });
            }
        }

        let _ = self.commands.send(StreamCommand::Unsubscribe(symbol.clone()));
        self.bump_version();
        info!(symbol = %symbol, "untracked symbol — buffers dropped");
        true
    }

    pub fn is_tracked(&self, symbol: &str) -> bool {
        self.tracked.read().contains(&normalize(symbol))
    }

    /// Sorted copy of the tracked set.
    pub fn tracked_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.tracked.read().iter().cloned().collect();
        symbols.sort();
        symbols
    }

    // -------------------------------------------------------------------------
    // Seeding / refresh
    // -------------------------------------------------------------------------

    async fn seed(&self, symbol: &str, interval: Interval, end_time: i64, epoch: u64) {
        let limit = interval.snapshot_limit();
        match self.client.fetch_klines(symbol, interval, end_time, limit).await {
            Ok(rows) => self.merge_seed(symbol, interval, rows, epoch),
            Err(e) => {
                // Degrade to an empty seed; the next track/refresh retries.
                warn!(
                    symbol = %symbol,
                    interval = %interval,
                    error = %e,
                    "snapshot seed failed — buffer stays empty until refreshed"
                );
                *self.last_seed_error.write() = Some(format!("{symbol}@{interval}: {e}"));
                self.bump_version();
            }
        }
    }

    /// Explicit, idempotent re-seed of one (symbol, interval) pair. Safe to
    /// call on a timer or on demand: merging a snapshot we already have is a
    /// pile of replace/reject no-ops.
    pub async fn refresh(&self, symbol: &str, interval: Interval) -> Result<(), FeedError> {
        let symbol = normalize(symbol);
        let epoch = match self.epochs.read().get(&symbol).copied() {
            Some(epoch) => epoch,
            None => {
                debug!(symbol = %symbol, "refresh ignored — not tracked");
                return Ok(());
            }
        };

        let end_time = chrono::Utc::now().timestamp_millis();
        match self
            .client
            .fetch_klines(&symbol, interval, end_time, interval.snapshot_limit())
            .await
        {
            Ok(rows) => {
                self.merge_seed(&symbol, interval, rows, epoch);
                *self.last_seed_error.write() = None;
                Ok(())
            }
            Err(e) => {
                *self.last_seed_error.write() = Some(format!("{symbol}@{interval}: {e}"));
                Err(e)
            }
        }
    }

    fn merge_seed(&self, symbol: &str, interval: Interval, mut rows: Vec<Candle>, epoch: u64) {
        // Stale-seed guard: untrack (or re-track) bumped the epoch while the
        // fetch was in flight.
        if self.epochs.read().get(symbol) != Some(&epoch) {
            debug!(symbol = %symbol, interval = %interval, "stale seed discarded");
            return;
        }

        let key = CandleKey {
            symbol: symbol.to_string(),
            interval,
        };
        let buffer = match self.buffers.read().get(&key) {
            Some(buffer) => Arc::clone(buffer),
            None => return,
        };

        // The endpoint promises ascending openTime; a stable sort keeps the
        // merge law the only ordering authority even if it lies.
        rows.sort_by_key(|c| c.open_time);

        let mut applied = 0usize;
        for candle in rows {
            if buffer.merge(candle) != MergeOutcome::Rejected {
                applied += 1;
            }
        }
        if applied > 0 {
            self.bump_version();
        }
        debug!(
            symbol = %symbol,
            interval = %interval,
            applied,
            total = buffer.len(),
            "snapshot merged"
        );
    }

    // -------------------------------------------------------------------------
    // Live deltas
    // -------------------------------------------------------------------------

    /// Merge one stream delta into its buffer. Deltas for untracked symbols
    /// are discarded.
    pub fn apply_delta(&self, event: DeltaEvent) {
        if !self.tracked.read().contains(&event.key.symbol) {
            debug!(key = %event.key, "delta for untracked symbol discarded");
            return;
        }
        let buffer = match self.buffers.read().get(&event.key) {
            Some(buffer) => Arc::clone(buffer),
            None => return,
        };
        if buffer.merge(event.candle) == MergeOutcome::Rejected {
            debug!(key = %event.key, "out-of-order delta rejected");
            return;
        }
        if event.is_final {
            debug!(key = %event.key, close = event.candle.close, "bar closed");
        }
        self.bump_version();
    }

    /// Consume the subscriber's delta sequence until the stream side closes.
    /// This is the single mutation path for live updates.
    pub async fn run_delta_pump(self: Arc<Self>, mut deltas: mpsc::UnboundedReceiver<DeltaEvent>) {
        while let Some(event) = deltas.recv().await {
            self.apply_delta(event);
        }
        info!("delta pump stopped — stream channel closed");
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Read-only copy of the raw series for a pair, oldest first. `None` when
    /// the pair is not tracked. Never blocks on network activity.
    pub fn snapshot(&self, symbol: &str, interval: Interval) -> Option<Vec<Candle>> {
        let key = CandleKey {
            symbol: normalize(symbol),
            interval,
        };
        let buffer = Arc::clone(self.buffers.read().get(&key)?);
        Some(buffer.snapshot())
    }

    /// The series re-expressed in the requested representation. Heikin-Ashi
    /// is recomputed from the canonical buffer on every call; all other kinds
    /// share the raw rows (line/area value extraction is the consumer
    /// boundary's job).
    pub fn snapshot_as(
        &self,
        symbol: &str,
        interval: Interval,
        kind: ChartKind,
    ) -> Option<Vec<Candle>> {
        let raw = self.snapshot(symbol, interval)?;
        Some(match kind {
            ChartKind::HeikinAshi => derive_heikin_ashi(&raw),
            _ => raw,
        })
    }

    /// The current (possibly still-forming) bar for a pair.
    pub fn latest(&self, symbol: &str, interval: Interval) -> Option<Candle> {
        let key = CandleKey {
            symbol: normalize(symbol),
            interval,
        };
        let buffer = Arc::clone(self.buffers.read().get(&key)?);
        buffer.latest()
    }

    // -------------------------------------------------------------------------
    // Status
    // -------------------------------------------------------------------------

    pub fn stream_health(&self) -> StreamHealth {
        self.health.get()
    }

    pub fn last_seed_error(&self) -> Option<String> {
        self.last_seed_error.read().clone()
    }

    pub fn data_version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    fn bump_version(&self) {
        self.version.fetch_add(1, Ordering::SeqCst);
    }
}

fn normalize(symbol: &str) -> String {
    symbol.trim().to_uppercase()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    /// Aggregator wired to an unroutable REST endpoint: seed fetches fail
    /// fast through the error path, everything else behaves normally.
    fn test_aggregator() -> (Arc<Aggregator>, mpsc::UnboundedReceiver<StreamCommand>) {
        let client = Arc::new(BinanceClient::new(
            "http://127.0.0.1:9",
            Duration::from_millis(250),
        ));
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let aggregator = Aggregator::new(
            client,
            Arc::new(RwLock::new(HashSet::new())),
            command_tx,
            Arc::new(StreamHealthFlag::new()),
            Arc::new(AtomicU64::new(1)),
            100,
        );
        (Arc::new(aggregator), command_rx)
    }

    fn delta(symbol: &str, interval: Interval, open_time: i64, close: f64) -> DeltaEvent {
        DeltaEvent {
            key: CandleKey {
                symbol: symbol.into(),
                interval,
            },
            candle: Candle::new(open_time, close, close + 1.0, close - 1.0, close, Some(5.0)),
            is_final: false,
        }
    }

    #[tokio::test]
    async fn track_is_idempotent() {
        let (agg, mut commands) = test_aggregator();
        assert!(agg.clone().track("btcusdt"));
        assert!(!agg.clone().track("BTCUSDT"));
        assert_eq!(agg.tracked_symbols(), vec!["BTCUSDT"]);

        // Exactly one subscribe went out.
        assert!(matches!(
            commands.try_recv(),
            Ok(StreamCommand::Subscribe(s)) if s == "BTCUSDT"
        ));
        assert!(commands.try_recv().is_err());
    }

    #[tokio::test]
    async fn track_creates_a_buffer_per_interval() {
        let (agg, _commands) = test_aggregator();
        agg.clone().track("ETHUSDT");
        for interval in Interval::ALL {
            let series = agg.snapshot("ETHUSDT", interval);
            assert!(series.is_some(), "missing buffer for {interval}");
        }
        assert!(agg.snapshot("SOLUSDT", Interval::OneMinute).is_none());
    }

    #[tokio::test]
    async fn untrack_drops_buffers_and_unsubscribes() {
        let (agg, mut commands) = test_aggregator();
        agg.clone().track("BTCUSDT");
        assert!(agg.untrack("btcusdt"));
        assert!(!agg.untrack("BTCUSDT"));

        assert!(!agg.is_tracked("BTCUSDT"));
        assert!(agg.tracked_symbols().is_empty());
        for interval in Interval::ALL {
            assert!(agg.snapshot("BTCUSDT", interval).is_none());
        }

        assert!(matches!(commands.try_recv(), Ok(StreamCommand::Subscribe(_))));
        assert!(matches!(
            commands.try_recv(),
            Ok(StreamCommand::Unsubscribe(s)) if s == "BTCUSDT"
        ));
    }

    #[tokio::test]
    async fn track_untrack_leaves_nothing_behind() {
        // The in-flight seed (failing against the unroutable endpoint) must
        // not resurrect a buffer after untrack.
        let (agg, _commands) = test_aggregator();
        agg.clone().track("BTCUSDT");
        agg.untrack("BTCUSDT");
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!agg.is_tracked("BTCUSDT"));
        for interval in Interval::ALL {
            assert!(agg.snapshot("BTCUSDT", interval).is_none());
        }
    }

    #[tokio::test]
    async fn deltas_for_untracked_symbols_are_discarded() {
        let (agg, _commands) = test_aggregator();
        let before = agg.data_version();
        agg.apply_delta(delta("BTCUSDT", Interval::OneMinute, 100, 1.0));
        assert_eq!(agg.data_version(), before);
        assert!(agg.latest("BTCUSDT", Interval::OneMinute).is_none());
    }

    #[tokio::test]
    async fn delta_merge_updates_and_appends() {
        let (agg, _commands) = test_aggregator();
        agg.clone().track("BTCUSDT");

        for t in 100..105 {
            agg.apply_delta(delta("BTCUSDT", Interval::OneMinute, t, t as f64));
        }
        let series = agg.snapshot("BTCUSDT", Interval::OneMinute).unwrap();
        assert_eq!(series.len(), 5);

        // Update to the open bar keeps the length; a new bar extends it.
        agg.apply_delta(delta("BTCUSDT", Interval::OneMinute, 104, 42.0));
        assert_eq!(agg.snapshot("BTCUSDT", Interval::OneMinute).unwrap().len(), 5);
        assert_eq!(
            agg.latest("BTCUSDT", Interval::OneMinute).map(|c| c.close),
            Some(42.0)
        );
        agg.apply_delta(delta("BTCUSDT", Interval::OneMinute, 105, 43.0));
        assert_eq!(agg.snapshot("BTCUSDT", Interval::OneMinute).unwrap().len(), 6);

        // Other intervals are untouched.
        assert!(agg.snapshot("BTCUSDT", Interval::OneDay).unwrap().is_empty());
    }

    #[tokio::test]
    async fn version_bumps_on_merge() {
        let (agg, _commands) = test_aggregator();
        agg.clone().track("BTCUSDT");
        let before = agg.data_version();
        agg.apply_delta(delta("BTCUSDT", Interval::OneMinute, 100, 1.0));
        assert!(agg.data_version() > before);

        // A rejected (stale) delta does not bump.
        agg.apply_delta(delta("BTCUSDT", Interval::OneMinute, 200, 2.0));
        let at = agg.data_version();
        agg.apply_delta(delta("BTCUSDT", Interval::OneMinute, 150, 9.0));
        assert_eq!(agg.data_version(), at);
    }

    #[tokio::test]
    async fn heikin_ashi_snapshot_is_derived_not_stored() {
        let (agg, _commands) = test_aggregator();
        agg.clone().track("BTCUSDT");
        agg.apply_delta(DeltaEvent {
            key: CandleKey {
                symbol: "BTCUSDT".into(),
                interval: Interval::OneMinute,
            },
            candle: Candle::new(0, 10.0, 12.0, 9.0, 11.0, Some(1.0)),
            is_final: true,
        });

        let ha = agg
            .snapshot_as("BTCUSDT", Interval::OneMinute, ChartKind::HeikinAshi)
            .unwrap();
        assert_eq!(ha.len(), 1);
        assert!((ha[0].open - 10.5).abs() < 1e-12);
        assert!(ha[0].volume.is_none());

        // The canonical buffer still holds the raw bar.
        let raw = agg
            .snapshot_as("BTCUSDT", Interval::OneMinute, ChartKind::Candlestick)
            .unwrap();
        assert!((raw[0].open - 10.0).abs() < 1e-12);
        assert_eq!(raw[0].volume, Some(1.0));
    }

    #[tokio::test]
    async fn failed_seed_sets_the_error_flag() {
        let (agg, _commands) = test_aggregator();
        agg.clone().track("BTCUSDT");
        // Give the doomed seed fetches time to fail.
        tokio::time::sleep(Duration::from_millis(600)).await;
        let flag = agg.last_seed_error();
        assert!(flag.is_some(), "expected a seed error against an unroutable endpoint");
        assert!(flag.unwrap().contains("BTCUSDT@"));
    }

    #[tokio::test]
    async fn refresh_of_untracked_symbol_is_a_no_op() {
        let (agg, _commands) = test_aggregator();
        assert!(agg.refresh("BTCUSDT", Interval::OneMinute).await.is_ok());
        assert!(agg.snapshot("BTCUSDT", Interval::OneMinute).is_none());
    }

    #[tokio::test]
    async fn refresh_failure_is_reported() {
        let (agg, _commands) = test_aggregator();
        agg.clone().track("BTCUSDT");
        let err = agg.refresh("BTCUSDT", Interval::OneMinute).await;
        assert!(err.is_err());
        assert!(agg.last_seed_error().is_some());
    }
}
