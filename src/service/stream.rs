// =============================================================================
// Candle Streamer — live candle aggregation and token-gated subscriptions
// =============================================================================
//
// One accumulator per configured candle size. Trades update the live candle
// (event path); a 1 s ticker closes idle buckets (clock path). Both paths take
// the accumulator's lock for the read-compare-write of the current bucket, so
// any bucket is closed by exactly one of them.
//
// Closed candles go to every subscriber registered for that size. Emission
// awaits each subscriber in turn: a slow subscriber stalls its size.
//
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::token::{constant_time_eq, random_token, ChannelIdGenerator};
use crate::config::StreamConfig;
use crate::error::StreamError;
use crate::market_data::{roll_over_idle, update_candle, CandleSize, CandleUpdate};
use crate::types::{Candle, Trade};

/// Delivery sink for serialized candles.
pub type CandleSink = mpsc::Sender<String>;

/// Returned by [`CandleStreamer::create_stream`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamCredentials {
    pub channel: String,
    pub token: String,
}

#[derive(Debug, Clone)]
struct StreamRegistration {
    token: String,
    size: CandleSize,
    /// Unix seconds after which the sweep removes the registration.
    expires_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum SeriesKey {
    /// Every pair feeds one series.
    Shared,
    Pair { exchange: String, pair: String },
}

struct Accumulator {
    size: CandleSize,
    series: Mutex<HashMap<SeriesKey, Option<Candle>>>,
}

pub struct CandleStreamer {
    accumulators: Vec<Accumulator>,
    partition_by_pair: bool,
    registration_ttl_secs: i64,
    token_len: usize,
    tick_interval: std::time::Duration,
    reaper_interval: std::time::Duration,
    registrations: Mutex<HashMap<String, StreamRegistration>>,
    subscribers: Mutex<HashMap<CandleSize, HashMap<String, CandleSink>>>,
    channel_ids: ChannelIdGenerator,
}

impl CandleStreamer {
    pub fn new(config: &StreamConfig) -> Self {
        let mut sizes = config.candle_sizes.clone();
        sizes.sort();
        sizes.dedup();

        Self {
            accumulators: sizes
                .into_iter()
                .map(|size| Accumulator {
                    size,
                    series: Mutex::new(HashMap::new()),
                })
                .collect(),
            partition_by_pair: config.partition_by_pair,
            registration_ttl_secs: config.registration_ttl_secs,
            token_len: config.token_len,
            tick_interval: config.tick_interval(),
            reaper_interval: config.reaper_interval(),
            registrations: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            channel_ids: ChannelIdGenerator::new(),
        }
    }

    pub fn candle_sizes(&self) -> Vec<CandleSize> {
        self.accumulators.iter().map(|a| a.size).collect()
    }

    // -------------------------------------------------------------------------
    // Run loops
    // -------------------------------------------------------------------------

    /// Spawn the trade/tick loop and the expiry reaper.
    pub fn start(self: Arc<Self>, mut trades: mpsc::Receiver<Trade>) -> Vec<JoinHandle<()>> {
        let reaper = {
            let streamer = self.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(streamer.reaper_interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let removed = streamer.sweep_expired_at(Utc::now().timestamp());
                    if removed > 0 {
                        info!(removed, "expired stream registrations removed");
                    }
                }
            })
        };

        let main = tokio::spawn(async move {
            info!(sizes = ?self.candle_sizes(), partition_by_pair = self.partition_by_pair, "candle streamer started");
            let mut ticker = tokio::time::interval(self.tick_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    trade = trades.recv() => match trade {
                        Some(trade) => {
                            self.handle_trade(&trade).await;
                        }
                        None => {
                            warn!("candle streamer trade channel closed");
                            break;
                        }
                    },
                    _ = ticker.tick() => {
                        self.handle_tick(Utc::now().timestamp()).await;
                    }
                }
            }
        });

        vec![main, reaper]
    }

    // -------------------------------------------------------------------------
    // Aggregation
    // -------------------------------------------------------------------------

    fn series_key(&self, trade: &Trade) -> SeriesKey {
        if self.partition_by_pair {
            SeriesKey::Pair {
                exchange: trade.exchange.clone(),
                pair: trade.pair.clone(),
            }
        } else {
            SeriesKey::Shared
        }
    }

    /// Event path. Returns the number of candles closed by this trade.
    pub async fn handle_trade(&self, trade: &Trade) -> usize {
        let key = self.series_key(trade);
        let mut closed: Vec<(CandleSize, Candle)> = Vec::new();

        for acc in &self.accumulators {
            let mut series = acc.series.lock();
            let live = series.entry(key.clone()).or_default();
            match update_candle(live, acc.size, trade) {
                CandleUpdate::Closed(candle) => closed.push((acc.size, candle)),
                CandleUpdate::Late => {
                    debug!(size = %acc.size, epoch = trade.epoch, pair = %trade.pair, "late trade dropped");
                }
                CandleUpdate::Initialized | CandleUpdate::Merged => {}
            }
        }

        let count = closed.len();
        for (size, candle) in closed {
            self.emit(size, &candle).await;
        }
        count
    }

    /// Clock path. Returns the number of candles closed at `now`.
    pub async fn handle_tick(&self, now: i64) -> usize {
        let mut closed: Vec<(CandleSize, Candle)> = Vec::new();

        for acc in &self.accumulators {
            let mut series = acc.series.lock();
            for live in series.values_mut() {
                if let Some(candle) = roll_over_idle(live, acc.size, now) {
                    closed.push((acc.size, candle));
                }
            }
        }

        let count = closed.len();
        for (size, candle) in closed {
            self.emit(size, &candle).await;
        }
        count
    }

    /// Send `candle` to every subscriber of `size`. Returns deliveries made.
    async fn emit(&self, size: CandleSize, candle: &Candle) -> usize {
        let payload = match serde_json::to_string(candle) {
            Ok(p) => p,
            Err(e) => {
                error!(error = %e, "failed to serialise candle");
                return 0;
            }
        };

        let sinks: Vec<(String, CandleSink)> = self
            .subscribers
            .lock()
            .get(&size)
            .map(|subs| subs.iter().map(|(ch, sink)| (ch.clone(), sink.clone())).collect())
            .unwrap_or_default();

        let mut delivered = 0;
        let mut gone = Vec::new();
        for (channel, sink) in sinks {
            match sink.send(payload.clone()).await {
                Ok(()) => {
                    delivered += 1;
                    info!(channel = %channel, size = %size, epoch = candle.epoch, "candle emitted");
                }
                Err(_) => {
                    debug!(channel = %channel, "subscriber gone, candle not delivered");
                    gone.push(channel);
                }
            }
        }
        for channel in gone {
            self.disconnect(&channel);
        }
        delivered
    }

    // -------------------------------------------------------------------------
    // Subscription API
    // -------------------------------------------------------------------------

    pub fn create_stream(&self, size: CandleSize) -> StreamCredentials {
        let now = Utc::now();
        if !self.accumulators.iter().any(|a| a.size == size) {
            warn!(size = %size, "stream created for a candle size with no accumulator");
        }

        let channel = self.channel_ids.next(size, now.timestamp_millis());
        let token = random_token(self.token_len);

        self.registrations.lock().insert(
            channel.clone(),
            StreamRegistration {
                token: token.clone(),
                size,
                expires_at: now.timestamp() + self.registration_ttl_secs,
            },
        );

        info!(channel = %channel, size = %size, "candle stream created");
        StreamCredentials { channel, token }
    }

    /// Validate the token and register `sink` for the channel's size.
    pub fn connect(&self, channel: &str, token: &str, sink: CandleSink) -> Result<(), StreamError> {
        let size = self.authorize(channel, token)?;

        let replaced = self
            .subscribers
            .lock()
            .entry(size)
            .or_default()
            .insert(channel.to_string(), sink);
        if replaced.is_some() {
            warn!(channel = %channel, "channel reconnected, previous subscriber replaced");
        }

        info!(channel = %channel, size = %size, "channel subscribed");
        Ok(())
    }

    /// Validate the token, then drop the sink (closing it) and the
    /// registration. A failed check changes nothing.
    pub fn stop(&self, channel: &str, token: &str) -> Result<(), StreamError> {
        let size = self.authorize(channel, token)?;

        if let Some(subs) = self.subscribers.lock().get_mut(&size) {
            subs.remove(channel);
        }
        self.registrations.lock().remove(channel);

        info!(channel = %channel, "stream unsubscribed");
        Ok(())
    }

    /// Drop the channel's sink if its receiving end is gone. No token check:
    /// the caller is the connection that owned the sink, and the registration
    /// may already have been swept. A live sink (the channel reconnected
    /// elsewhere) is left in place. Returns whether a sink was removed.
    pub fn disconnect(&self, channel: &str) -> bool {
        let mut subscribers = self.subscribers.lock();
        let mut removed = false;
        for subs in subscribers.values_mut() {
            if subs.get(channel).is_some_and(|sink| sink.is_closed()) {
                subs.remove(channel);
                removed = true;
            }
        }
        if removed {
            debug!(channel = %channel, "closed subscriber removed");
        }
        removed
    }

    fn authorize(&self, channel: &str, token: &str) -> Result<CandleSize, StreamError> {
        let registrations = self.registrations.lock();
        let Some(reg) = registrations.get(channel) else {
            warn!(channel = %channel, "stream not found");
            return Err(StreamError::NotFound(channel.to_string()));
        };
        if !constant_time_eq(reg.token.as_bytes(), token.as_bytes()) {
            warn!(channel = %channel, "invalid stream token");
            return Err(StreamError::Unauthorized(channel.to_string()));
        }
        Ok(reg.size)
    }

    /// Drop registrations whose expiry is at or before `now`. Connected sinks
    /// are left alone.
    pub fn sweep_expired_at(&self, now: i64) -> usize {
        let mut registrations = self.registrations.lock();
        let before = registrations.len();
        registrations.retain(|_, reg| now < reg.expires_at);
        before - registrations.len()
    }

    pub fn subscriber_count(&self, size: CandleSize) -> usize {
        self.subscribers.lock().get(&size).map_or(0, HashMap::len)
    }

    pub fn registration_count(&self) -> usize {
        self.registrations.lock().len()
    }
}
