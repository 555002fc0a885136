// =============================================================================
// Indodax market-data feed
// =============================================================================
//
// One `IndodaxFeed` serves every connection shard. Shared state is limited to
// the pair metadata map and the order-book store; each shard owns its socket.
// =============================================================================

mod listener;
pub mod normalize;
pub mod rest;
pub mod wire;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::RwLock;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::IndodaxConfig;
use crate::error::FeedError;
use crate::market_data::{LossyBroadcast, OrderBookStore};
use crate::types::{OrderBook, PairMeta, Trade};

use self::normalize::{convert_orderbook, decode_trade_batch, traded_currency_for, RawOrderBook};
use self::rest::IndodaxRest;
use self::wire::WsResponse;

pub const EXCHANGE_ID: &str = "indodax";

/// What a single decoded websocket value turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    OrderBook { pair: String },
    Trades { count: usize },
    /// Acks, auth replies and channels we did not subscribe to.
    Ignored,
}

pub struct IndodaxFeed {
    config: IndodaxConfig,
    rest: IndodaxRest,
    pairs: RwLock<HashMap<String, PairMeta>>,
    orderbooks: Arc<OrderBookStore>,
    orderbook_out: LossyBroadcast<OrderBook>,
    trade_out: LossyBroadcast<Trade>,
}

impl IndodaxFeed {
    pub fn new(
        config: IndodaxConfig,
        orderbooks: Arc<OrderBookStore>,
        orderbook_sinks: Vec<mpsc::Sender<OrderBook>>,
        trade_sinks: Vec<mpsc::Sender<Trade>>,
    ) -> Result<Self> {
        let rest = IndodaxRest::new(config.base_url.clone(), config.request_timeout())?;
        let orderbook_out = LossyBroadcast::new("indodax.orderbook", orderbook_sinks);
        let trade_out = LossyBroadcast::new("indodax.trade", trade_sinks);
        info!(
            orderbook_sinks = orderbook_out.sink_count(),
            trade_sinks = trade_out.sink_count(),
            "indodax feed consumers registered"
        );
        Ok(Self {
            config,
            rest,
            pairs: RwLock::new(HashMap::new()),
            orderbooks,
            orderbook_out,
            trade_out,
        })
    }

    /// Fetch pair metadata from the REST API. On failure the feed keeps
    /// whatever it had and falls back to suffix-derived currencies.
    pub async fn load_pairs(&self) -> usize {
        match self.rest.get_pairs().await {
            Ok(list) => {
                let count = list.len();
                let mut pairs = self.pairs.write();
                for meta in list {
                    pairs.insert(meta.id.clone(), meta);
                }
                info!(count, "indodax pair metadata loaded");
                count
            }
            Err(e) => {
                warn!(error = %e, "indodax pair metadata unavailable, deriving currencies from symbols");
                0
            }
        }
    }

    pub fn orderbooks(&self) -> &Arc<OrderBookStore> {
        &self.orderbooks
    }

    /// Dispatch one decoded value by channel prefix.
    pub fn route(&self, msg: &WsResponse) -> Result<Routed, FeedError> {
        let channel = msg.result.channel.as_str();

        if let Some(pair) = channel.strip_prefix(&self.config.orderbook_channel_prefix) {
            debug!(channel, "orderbook message");
            self.process_orderbook(&msg.result.data.data, pair)?;
            return Ok(Routed::OrderBook { pair: pair.to_string() });
        }

        if channel.starts_with(&self.config.trade_channel_prefix) {
            debug!(channel, "trade activity message");
            let count = self.process_trades(&msg.result.data.data)?;
            return Ok(Routed::Trades { count });
        }

        Ok(Routed::Ignored)
    }

    /// Replace the stored book for `pair` and broadcast it.
    fn process_orderbook(&self, data: &serde_json::Value, pair: &str) -> Result<(), FeedError> {
        let raw = RawOrderBook::deserialize(data)?;
        let traded = traded_currency_for(pair, self.pairs.read().get(pair));
        let book = convert_orderbook(&raw, &traded, EXCHANGE_ID);

        self.orderbooks.replace(pair, book.clone());
        let outcome = self.orderbook_out.publish(book);
        if outcome.closed > 0 {
            debug!(pair, closed = outcome.closed, "order-book consumer gone");
        }
        Ok(())
    }

    /// Decode, dedup and broadcast a trade batch. Returns the number published.
    fn process_trades(&self, data: &serde_json::Value) -> Result<usize, FeedError> {
        let trades = decode_trade_batch(data, EXCHANGE_ID)?;
        let count = trades.len();
        let mut dropped = 0;
        for trade in trades {
            dropped += self.trade_out.publish(trade).dropped;
        }
        if dropped > 0 {
            debug!(
                batch = count,
                dropped,
                dropped_total = self.trade_out.dropped_total(),
                "trade batch partially dropped by lagging consumers"
            );
        }
        Ok(count)
    }

    /// True once every trade consumer has gone away.
    pub(crate) fn consumers_gone(&self) -> bool {
        self.trade_out.all_closed()
    }
}
