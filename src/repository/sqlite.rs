//! SQLite-backed trade and candle repository.
//!
//! Decimals are stored as TEXT to keep full precision; timestamps are epoch
//! seconds. Every call runs on the blocking pool.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use rust_decimal::Decimal;
use tracing::{debug, info};

use super::{CandleRepository, TradeRepository};
use crate::types::{Candle, Trade};

// =============================================================================
// SCHEMA
// =============================================================================

const MARKET_SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS trades (
    timestamp INTEGER NOT NULL,
    exchange TEXT NOT NULL,
    symbol TEXT NOT NULL,
    price TEXT NOT NULL,
    quantity TEXT NOT NULL,
    side TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_trades_symbol_ts
    ON trades(exchange, symbol, timestamp);

CREATE TABLE IF NOT EXISTS candles_1m (
    timestamp INTEGER NOT NULL,
    exchange TEXT NOT NULL,
    symbol TEXT NOT NULL,
    open TEXT NOT NULL,
    high TEXT NOT NULL,
    low TEXT NOT NULL,
    close TEXT NOT NULL,
    volume TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_candles_1m_bucket
    ON candles_1m(exchange, symbol, timestamp);
"#;

// =============================================================================
// REPOSITORY
// =============================================================================

pub struct SqliteRepository {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRepository {
    /// Open or create the database at `db_path`.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let path = db_path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.exists() && !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(path, flags)
            .with_context(|| format!("failed to open market database: {}", path.display()))?;
        conn.execute_batch(MARKET_SCHEMA)?;

        info!(path = %path.display(), "market database opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database (tests).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(MARKET_SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await
        .context("sqlite task panicked")?
    }
}

fn parse_decimal(column: &str, text: &str) -> Result<Decimal> {
    Decimal::from_str(text).with_context(|| format!("column {column} holds non-decimal {text:?}"))
}

#[async_trait]
impl TradeRepository for SqliteRepository {
    async fn insert_trades(&self, trades: &[Trade]) -> Result<()> {
        if trades.is_empty() {
            return Ok(());
        }
        let trades = trades.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO trades (timestamp, exchange, symbol, price, quantity, side)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )?;
                for t in &trades {
                    stmt.execute(params![
                        t.epoch,
                        t.exchange,
                        t.pair,
                        t.filled_price.to_string(),
                        t.traded_volume.to_string(),
                        t.side.as_str(),
                    ])?;
                }
            }
            tx.commit().context("commit trades batch")?;
            debug!(count = trades.len(), "trades inserted");
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl CandleRepository for SqliteRepository {
    async fn get_candle(&self, epoch: i64, exchange: &str, pair: &str) -> Result<Option<Candle>> {
        let exchange = exchange.to_string();
        let pair = pair.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT timestamp, exchange, symbol, open, high, low, close, volume
                     FROM candles_1m
                     WHERE exchange = ?1 AND symbol = ?2 AND timestamp = ?3",
                    params![exchange, pair, epoch],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, String>(5)?,
                            row.get::<_, String>(6)?,
                            row.get::<_, String>(7)?,
                        ))
                    },
                )
                .optional()?;

            let Some((epoch, exchange, pair, open, high, low, close, volume)) = row else {
                return Ok(None);
            };

            Ok(Some(Candle {
                epoch,
                pair,
                exchange,
                open: parse_decimal("open", &open)?,
                high: parse_decimal("high", &high)?,
                low: parse_decimal("low", &low)?,
                close: parse_decimal("close", &close)?,
                volume: parse_decimal("volume", &volume)?,
                dirty: false,
            }))
        })
        .await
    }

    async fn insert_candle(&self, candle: &Candle) -> Result<()> {
        let c = candle.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO candles_1m (timestamp, exchange, symbol, open, high, low, close, volume)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    c.epoch,
                    c.exchange,
                    c.pair,
                    c.open.to_string(),
                    c.high.to_string(),
                    c.low.to_string(),
                    c.close.to_string(),
                    c.volume.to_string(),
                ],
            )
            .with_context(|| format!("insert candle {}/{}@{}", c.exchange, c.pair, c.epoch))?;
            Ok(())
        })
        .await
    }

    async fn update_candle(&self, candle: &Candle) -> Result<()> {
        let c = candle.clone();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE candles_1m
                 SET open = ?1, high = ?2, low = ?3, close = ?4, volume = ?5
                 WHERE exchange = ?6 AND symbol = ?7 AND timestamp = ?8",
                params![
                    c.open.to_string(),
                    c.high.to_string(),
                    c.low.to_string(),
                    c.close.to_string(),
                    c.volume.to_string(),
                    c.exchange,
                    c.pair,
                    c.epoch,
                ],
            )?;
            if changed == 0 {
                anyhow::bail!("candle {}/{}@{} not found", c.exchange, c.pair, c.epoch);
            }
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TradeKey, TradeSide};
    use rust_decimal_macros::dec;

    fn trade(epoch: i64, seq: i64) -> Trade {
        Trade {
            epoch,
            pair: "btcidr".into(),
            side: TradeSide::Sell,
            exchange: "indodax".into(),
            filled_price: dec!(1000000000.5),
            base_volume: dec!(100),
            traded_volume: dec!(0.00000123),
            notional: dec!(1230.000000615),
            key: TradeKey { epoch, sequence: seq },
        }
    }

    fn candle(epoch: i64) -> Candle {
        Candle {
            epoch,
            pair: "btcidr".into(),
            exchange: "indodax".into(),
            open: dec!(10.25),
            high: dec!(11),
            low: dec!(9.5),
            close: dec!(10.75),
            volume: dec!(0.123456789),
            dirty: false,
        }
    }

    #[tokio::test]
    async fn trades_batch_is_inserted() {
        let repo = SqliteRepository::open_memory().unwrap();
        repo.insert_trades(&[trade(60, 1), trade(61, 2)]).await.unwrap();

        let (count, quantity): (i64, String) = repo
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*), MAX(quantity) FROM trades WHERE side = 'sell'",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?)
            })
            .await
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(quantity, "0.00000123");
    }

    #[tokio::test]
    async fn candle_round_trip_keeps_precision() {
        let repo = SqliteRepository::open_memory().unwrap();
        assert!(repo.get_candle(60, "indodax", "btcidr").await.unwrap().is_none());

        repo.insert_candle(&candle(60)).await.unwrap();
        let stored = repo.get_candle(60, "indodax", "btcidr").await.unwrap().unwrap();
        assert_eq!(stored, candle(60));
    }

    #[tokio::test]
    async fn duplicate_bucket_insert_fails_and_update_applies() {
        let repo = SqliteRepository::open_memory().unwrap();
        repo.insert_candle(&candle(120)).await.unwrap();
        assert!(repo.insert_candle(&candle(120)).await.is_err());

        let mut updated = candle(120);
        updated.high = dec!(20);
        updated.volume = dec!(5);
        repo.update_candle(&updated).await.unwrap();

        let stored = repo.get_candle(120, "indodax", "btcidr").await.unwrap().unwrap();
        assert_eq!(stored.high, dec!(20));
        assert_eq!(stored.volume, dec!(5));
        assert!(repo.update_candle(&candle(180)).await.is_err());
    }

    #[test]
    fn opens_file_database_creating_parent_dirs() {
        let dir = std::env::temp_dir().join(format!("market-ingestor-{}", uuid::Uuid::new_v4()));
        let path = dir.join("nested").join("market.db");
        SqliteRepository::open(&path).unwrap();
        assert!(path.exists());
        let _ = std::fs::remove_dir_all(dir);
    }
}
