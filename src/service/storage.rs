// =============================================================================
// Trade Storage — buffered batch persistence with 1-minute candle rollup
// =============================================================================
//
// Trades accumulate in memory and are flushed either by the periodic timer
// (only when something is buffered) or by the "buffer full" signal (only when
// the buffer is still at or over the threshold). A flush swaps the buffer out
// under the lock and does all repository work after releasing it.
//
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::StorageConfig;
use crate::market_data::CandleSize;
use crate::repository::{CandleRepository, TradeRepository};
use crate::types::{Candle, Trade};

/// Counters for one processed snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub trades: usize,
    pub trades_persisted: bool,
    pub candles_inserted: usize,
    pub candles_updated: usize,
    pub buckets_skipped: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BucketKey {
    exchange: String,
    pair: String,
    epoch: i64,
}

pub struct TradeStorage {
    trades: Arc<dyn TradeRepository>,
    candles: Arc<dyn CandleRepository>,
    buffer: Mutex<Vec<Trade>>,
    flush_threshold: usize,
    flush_interval: Duration,
    full: Notify,
}

impl TradeStorage {
    pub fn new(
        trades: Arc<dyn TradeRepository>,
        candles: Arc<dyn CandleRepository>,
        config: &StorageConfig,
    ) -> Self {
        Self {
            trades,
            candles,
            buffer: Mutex::new(Vec::new()),
            flush_threshold: config.flush_threshold.max(1),
            flush_interval: config.flush_interval(),
            full: Notify::new(),
        }
    }

    /// Spawn the ingest task and the flush loop.
    pub fn start(self: Arc<Self>, mut trades: mpsc::Receiver<Trade>) -> Vec<JoinHandle<()>> {
        let ingest = {
            let storage = self.clone();
            tokio::spawn(async move {
                info!("storage ingesting trade activity");
                while let Some(trade) = trades.recv().await {
                    storage.ingest(trade);
                }
                warn!("storage trade channel closed, flushing remaining buffer");
                storage.on_tick().await;
            })
        };

        let flush = tokio::spawn(async move {
            info!(
                threshold = self.flush_threshold,
                interval_secs = self.flush_interval.as_secs(),
                "storage flush loop ready"
            );
            let mut ticker = interval_at(Instant::now() + self.flush_interval, self.flush_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.on_tick().await;
                    }
                    _ = self.full.notified() => {
                        self.on_full_signal().await;
                    }
                }
            }
        });

        vec![ingest, flush]
    }

    /// Append one trade. Returns true when this append raised the full signal.
    pub fn ingest(&self, trade: Trade) -> bool {
        let len = {
            let mut buffer = self.buffer.lock();
            buffer.push(trade);
            buffer.len()
        };

        if len >= self.flush_threshold {
            self.full.notify_one();
            return true;
        }
        false
    }

    pub fn buffered(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Timer path: flush whatever is buffered, if anything.
    pub async fn on_tick(&self) -> Option<FlushReport> {
        let snapshot = self.take_snapshot_if(|len| len > 0)?;
        Some(self.process_snapshot(snapshot).await)
    }

    /// Signal path: flush only if the buffer is still over the threshold.
    pub async fn on_full_signal(&self) -> Option<FlushReport> {
        let threshold = self.flush_threshold;
        let snapshot = self.take_snapshot_if(|len| len >= threshold)?;
        Some(self.process_snapshot(snapshot).await)
    }

    fn take_snapshot_if(&self, should_flush: impl Fn(usize) -> bool) -> Option<Vec<Trade>> {
        let mut buffer = self.buffer.lock();
        if !should_flush(buffer.len()) {
            return None;
        }
        Some(std::mem::take(&mut *buffer))
    }

    /// Persist the batch, then roll it up into 1-minute candles. A failed
    /// trade insert is logged and does not stop the rollup.
    pub async fn process_snapshot(&self, trades: Vec<Trade>) -> FlushReport {
        let mut report = FlushReport {
            trades: trades.len(),
            ..FlushReport::default()
        };

        match self.trades.insert_trades(&trades).await {
            Ok(()) => {
                report.trades_persisted = true;
                info!(length = trades.len(), "trades stored");
            }
            Err(e) => error!(error = %e, length = trades.len(), "failed to store trades batch"),
        }

        self.roll_up_minutes(&trades, &mut report).await;
        report
    }

    async fn roll_up_minutes(&self, trades: &[Trade], report: &mut FlushReport) {
        let minute = CandleSize::ONE_MINUTE;
        let mut order: Vec<BucketKey> = Vec::new();
        let mut buckets: HashMap<BucketKey, Candle> = HashMap::new();
        let mut skipped: HashSet<BucketKey> = HashSet::new();

        for trade in trades {
            let key = BucketKey {
                exchange: trade.exchange.clone(),
                pair: trade.pair.clone(),
                epoch: minute.bucket(trade.epoch),
            };

            if skipped.contains(&key) {
                continue;
            }
            if let Some(candle) = buckets.get_mut(&key) {
                candle.apply_trade(trade);
                continue;
            }

            let candle = match self.candles.get_candle(key.epoch, &key.exchange, &key.pair).await {
                Ok(Some(mut stored)) => {
                    stored.dirty = true;
                    stored.apply_trade(trade);
                    stored
                }
                Ok(None) => Candle::from_trade(key.epoch, trade),
                Err(e) => {
                    error!(
                        error = %e,
                        exchange = %key.exchange,
                        pair = %key.pair,
                        epoch = key.epoch,
                        "failed to load 1m candle, bucket skipped"
                    );
                    report.buckets_skipped += 1;
                    skipped.insert(key);
                    continue;
                }
            };

            buckets.insert(key.clone(), candle);
            order.push(key);
        }

        for key in order {
            let Some(candle) = buckets.remove(&key) else {
                continue;
            };

            let result = if candle.dirty {
                self.candles.update_candle(&candle).await
            } else {
                self.candles.insert_candle(&candle).await
            };

            match result {
                Ok(()) if candle.dirty => {
                    report.candles_updated += 1;
                    debug!(exchange = %key.exchange, pair = %key.pair, epoch = key.epoch, "updated 1m candle");
                }
                Ok(()) => {
                    report.candles_inserted += 1;
                    debug!(exchange = %key.exchange, pair = %key.pair, epoch = key.epoch, "inserted 1m candle");
                }
                Err(e) => {
                    report.buckets_skipped += 1;
                    error!(
                        error = %e,
                        exchange = %key.exchange,
                        pair = %key.pair,
                        epoch = key.epoch,
                        dirty = candle.dirty,
                        "failed to persist 1m candle"
                    );
                }
            }
        }
    }
}
