// =============================================================================
// Shared types used across the market ingestor
// =============================================================================

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Aggressor side of a trade as reported by the venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }
}

impl fmt::Display for TradeSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TradeSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "buy" => Ok(Self::Buy),
            "sell" => Ok(Self::Sell),
            other => Err(format!("unknown trade side {other:?}")),
        }
    }
}

/// Identifies a trade within one inbound message: `(epoch, venue sequence)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TradeKey {
    pub epoch: i64,
    pub sequence: i64,
}

impl fmt::Display for TradeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.epoch, self.sequence)
    }
}

/// A normalized trade. Built once by the normalization layer, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub epoch: i64,
    pub pair: String,
    pub side: TradeSide,
    pub exchange: String,
    pub filled_price: Decimal,
    pub base_volume: Decimal,
    pub traded_volume: Decimal,
    /// `filled_price * traded_volume`.
    pub notional: Decimal,
    pub key: TradeKey,
}

/// One price level of an order book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: Decimal,
    pub qty: Decimal,
}

/// Full order-book snapshot for one pair. Both sides sorted ascending by price.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBook {
    pub pair: String,
    pub exchange: String,
    pub bid: Vec<BookLevel>,
    pub ask: Vec<BookLevel>,
}

/// OHLCV candle. `epoch` is the bucket start, always a multiple of the size.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candle {
    pub epoch: i64,
    pub pair: String,
    pub exchange: String,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    /// Set when the candle was loaded from the repository and must be updated
    /// rather than inserted.
    #[serde(skip)]
    pub dirty: bool,
}

/// Static metadata the venue publishes for a tradable pair.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PairMeta {
    pub id: String,
    pub base_currency: String,
    pub traded_currency: String,
    pub price_precision: Decimal,
    pub volume_precision: Decimal,
    pub min_base_trade: Decimal,
    pub is_suspended: bool,
    pub is_maintenance: bool,
}
