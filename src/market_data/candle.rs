use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::types::{Candle, Trade};

// ---------------------------------------------------------------------------
// CandleSize
// ---------------------------------------------------------------------------

/// Width of a candle bucket in whole seconds.
///
/// Textual form is `<n><unit>` with unit one of `s`, `m`, `h`, `d`
/// (`"30s"`, `"1m"`, `"4h"`). Deserialisation also accepts a bare number of
/// seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CandleSize {
    secs: i64,
}

impl CandleSize {
    pub const ONE_MINUTE: CandleSize = CandleSize { secs: 60 };

    pub fn from_secs(secs: i64) -> Option<Self> {
        (secs > 0).then_some(Self { secs })
    }

    pub fn secs(&self) -> i64 {
        self.secs
    }

    /// Start of the bucket containing `ts`.
    pub fn bucket(&self, ts: i64) -> i64 {
        ts - ts.rem_euclid(self.secs)
    }
}

impl fmt::Display for CandleSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: [(i64, &str); 3] = [(86_400, "d"), (3_600, "h"), (60, "m")];
        for (unit_secs, suffix) in UNITS {
            if self.secs % unit_secs == 0 {
                return write!(f, "{}{}", self.secs / unit_secs, suffix);
            }
        }
        write!(f, "{}s", self.secs)
    }
}

impl FromStr for CandleSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let split = s
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| format!("candle size {s:?} has no unit"))?;
        let (digits, unit) = s.split_at(split);
        let n: i64 = digits
            .parse()
            .map_err(|_| format!("candle size {s:?} has no leading number"))?;
        let multiplier = match unit {
            "s" => 1,
            "m" => 60,
            "h" => 3_600,
            "d" => 86_400,
            other => return Err(format!("unknown candle size unit {other:?}")),
        };
        n.checked_mul(multiplier)
            .and_then(CandleSize::from_secs)
            .ok_or_else(|| format!("candle size {s:?} must be positive"))
    }
}

impl Serialize for CandleSize {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CandleSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Secs(i64),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
            Raw::Secs(secs) => CandleSize::from_secs(secs)
                .ok_or_else(|| serde::de::Error::custom("candle size must be positive")),
        }
    }
}

// ---------------------------------------------------------------------------
// Candle arithmetic
// ---------------------------------------------------------------------------

impl Candle {
    /// Fresh candle for `bucket` seeded entirely from one trade.
    pub fn from_trade(bucket: i64, trade: &Trade) -> Self {
        Self {
            epoch: bucket,
            pair: trade.pair.clone(),
            exchange: trade.exchange.clone(),
            open: trade.filled_price,
            high: trade.filled_price,
            low: trade.filled_price,
            close: trade.filled_price,
            volume: trade.base_volume,
            dirty: false,
        }
    }

    /// Candle for an idle bucket: every price carries `prev.close`, no volume.
    pub fn carried_forward(prev: &Candle, bucket: i64) -> Self {
        Self {
            epoch: bucket,
            pair: prev.pair.clone(),
            exchange: prev.exchange.clone(),
            open: prev.close,
            high: prev.close,
            low: prev.close,
            close: prev.close,
            volume: Decimal::ZERO,
            dirty: false,
        }
    }

    /// Fold a trade belonging to this bucket into the candle.
    pub fn apply_trade(&mut self, trade: &Trade) {
        self.volume += trade.base_volume;
        self.close = trade.filled_price;
        if trade.filled_price > self.high {
            self.high = trade.filled_price;
        }
        if trade.filled_price < self.low {
            self.low = trade.filled_price;
        }
    }
}

/// Outcome of feeding one trade to a live candle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandleUpdate {
    /// No candle was live; one was started from the trade.
    Initialized,
    /// The trade landed in the live bucket.
    Merged,
    /// The trade belongs to an earlier bucket and was dropped.
    Late,
    /// The trade opened a later bucket; the previous candle is closed.
    Closed(Candle),
}

/// Event-driven update of a live candle.
///
/// `None` means the series has not seen a trade yet.
pub fn update_candle(live: &mut Option<Candle>, size: CandleSize, trade: &Trade) -> CandleUpdate {
    let bucket = size.bucket(trade.epoch);

    let Some(current) = live.as_mut() else {
        *live = Some(Candle::from_trade(bucket, trade));
        return CandleUpdate::Initialized;
    };

    if bucket < current.epoch {
        return CandleUpdate::Late;
    }

    if bucket > current.epoch {
        let closed = std::mem::replace(current, Candle::from_trade(bucket, trade));
        return CandleUpdate::Closed(closed);
    }

    current.apply_trade(trade);
    CandleUpdate::Merged
}

/// Clock-driven rollover. If wall-clock time `now` has moved past the live
/// bucket, the live candle is closed and replaced by a carried-forward one.
pub fn roll_over_idle(live: &mut Option<Candle>, size: CandleSize, now: i64) -> Option<Candle> {
    let current = live.as_mut()?;
    let bucket = size.bucket(now);
    if bucket <= current.epoch {
        return None;
    }
    let next = Candle::carried_forward(current, bucket);
    Some(std::mem::replace(current, next))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
