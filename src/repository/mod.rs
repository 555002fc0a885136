// =============================================================================
// Persistence contracts for trades and 1-minute candles
// =============================================================================

pub mod memory;
pub mod sqlite;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::StorageBackend;
use crate::types::{Candle, Trade};

pub use memory::MemoryRepository;
pub use sqlite::SqliteRepository;

#[async_trait]
pub trait TradeRepository: Send + Sync {
    /// Persist a whole batch in one call.
    async fn insert_trades(&self, trades: &[Trade]) -> Result<()>;
}

#[async_trait]
pub trait CandleRepository: Send + Sync {
    /// Stored 1-minute candle for the bucket starting at `epoch`, if any.
    async fn get_candle(&self, epoch: i64, exchange: &str, pair: &str) -> Result<Option<Candle>>;

    async fn insert_candle(&self, candle: &Candle) -> Result<()>;

    /// Overwrite OHLCV of an existing row identified by (epoch, exchange, pair).
    async fn update_candle(&self, candle: &Candle) -> Result<()>;
}

/// Both repositories backed by the same store.
pub struct Repositories {
    pub trades: Arc<dyn TradeRepository>,
    pub candles: Arc<dyn CandleRepository>,
}

impl Repositories {
    pub fn open(backend: &StorageBackend) -> Result<Self> {
        match backend {
            StorageBackend::Sqlite { path } => {
                let repo = Arc::new(SqliteRepository::open(path)?);
                Ok(Self {
                    trades: repo.clone(),
                    candles: repo,
                })
            }
            StorageBackend::Memory => {
                let repo = Arc::new(MemoryRepository::new());
                Ok(Self {
                    trades: repo.clone(),
                    candles: repo,
                })
            }
        }
    }
}
