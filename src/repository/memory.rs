//! Process-local repository. Used when `storage.backend` is `memory` and by
//! the storage service tests.

use std::collections::HashMap;

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;

use super::{CandleRepository, TradeRepository};
use crate::types::{Candle, Trade};

type CandleKey = (i64, String, String);

#[derive(Default)]
pub struct MemoryRepository {
    trades: Mutex<Vec<Trade>>,
    candles: Mutex<HashMap<CandleKey, Candle>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trade_count(&self) -> usize {
        self.trades.lock().len()
    }

    /// All stored candles ordered by (epoch, exchange, pair).
    pub fn candles(&self) -> Vec<Candle> {
        let mut out: Vec<Candle> = self.candles.lock().values().cloned().collect();
        out.sort_by(|a, b| (a.epoch, &a.exchange, &a.pair).cmp(&(b.epoch, &b.exchange, &b.pair)));
        out
    }
}

fn key(candle: &Candle) -> CandleKey {
    (candle.epoch, candle.exchange.clone(), candle.pair.clone())
}

#[async_trait]
impl TradeRepository for MemoryRepository {
    async fn insert_trades(&self, trades: &[Trade]) -> Result<()> {
        self.trades.lock().extend_from_slice(trades);
        Ok(())
    }
}

#[async_trait]
impl CandleRepository for MemoryRepository {
    async fn get_candle(&self, epoch: i64, exchange: &str, pair: &str) -> Result<Option<Candle>> {
        let key = (epoch, exchange.to_string(), pair.to_string());
        Ok(self.candles.lock().get(&key).cloned())
    }

    async fn insert_candle(&self, candle: &Candle) -> Result<()> {
        let mut candles = self.candles.lock();
        let key = key(candle);
        if candles.contains_key(&key) {
            bail!("candle {}/{}@{} already exists", candle.exchange, candle.pair, candle.epoch);
        }
        let mut stored = candle.clone();
        stored.dirty = false;
        candles.insert(key, stored);
        Ok(())
    }

    async fn update_candle(&self, candle: &Candle) -> Result<()> {
        let mut candles = self.candles.lock();
        match candles.get_mut(&key(candle)) {
            Some(stored) => {
                *stored = candle.clone();
                stored.dirty = false;
                Ok(())
            }
            None => bail!("candle {}/{}@{} not found", candle.exchange, candle.pair, candle.epoch),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn candle(epoch: i64) -> Candle {
        Candle {
            epoch,
            pair: "btcidr".into(),
            exchange: "indodax".into(),
            open: dec!(1),
            high: dec!(2),
            low: dec!(1),
            close: dec!(2),
            volume: dec!(3),
            dirty: false,
        }
    }

    #[tokio::test]
    async fn insert_then_get_and_update() {
        let repo = MemoryRepository::new();
        repo.insert_candle(&candle(60)).await.unwrap();
        assert!(repo.insert_candle(&candle(60)).await.is_err());

        let mut stored = repo.get_candle(60, "indodax", "btcidr").await.unwrap().unwrap();
        stored.volume = dec!(10);
        stored.dirty = true;
        repo.update_candle(&stored).await.unwrap();

        let reread = repo.get_candle(60, "indodax", "btcidr").await.unwrap().unwrap();
        assert_eq!(reread.volume, dec!(10));
        assert!(!reread.dirty);
        assert!(repo.get_candle(120, "indodax", "btcidr").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_of_missing_candle_fails() {
        let repo = MemoryRepository::new();
        assert!(repo.update_candle(&candle(0)).await.is_err());
    }
}
