// =============================================================================
// Indodax normalization — wire payloads into canonical records
// =============================================================================
//
// Pure functions, no state. Order-book values are lenient (unparseable numbers
// become zero); trade tuples go through a strict positional schema and a bad
// tuple rejects the whole batch.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;

use crate::error::FeedError;
use crate::types::{BookLevel, OrderBook, PairMeta, Trade, TradeKey, TradeSide};

/// Quote currencies recognised when pair metadata is unavailable.
const KNOWN_QUOTES: [&str; 2] = ["idr", "usdt"];

/// Arity of one trade tuple:
/// `[pair, epoch, sequence, side, price, base_volume, traded_volume]`.
pub const TRADE_TUPLE_LEN: usize = 7;

// ---------------------------------------------------------------------------
// Value coercion
// ---------------------------------------------------------------------------

/// Best-effort decimal from a JSON string or number. Anything else is zero.
pub fn lenient_decimal(value: &Value) -> Decimal {
    match value {
        Value::String(s) => Decimal::from_str(s.trim()).unwrap_or(Decimal::ZERO),
        Value::Number(_) => number_to_decimal(value).unwrap_or(Decimal::ZERO),
        _ => Decimal::ZERO,
    }
}

fn number_to_decimal(value: &Value) -> Option<Decimal> {
    if let Some(i) = value.as_i64() {
        return Some(Decimal::from(i));
    }
    if let Some(u) = value.as_u64() {
        return Some(Decimal::from(u));
    }
    value.as_f64().and_then(Decimal::from_f64)
}

/// Integer from a JSON number; floats are accepted only when integral.
fn integral(value: &Value) -> Option<i64> {
    if let Some(i) = value.as_i64() {
        return Some(i);
    }
    let f = value.as_f64()?;
    if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
        Some(f as i64)
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Order book
// ---------------------------------------------------------------------------

/// Order-book publication as sent by the venue. Each level is an object keyed
/// by `price` and `<traded currency>_volume`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawOrderBook {
    pub pair: String,
    pub bid: Vec<HashMap<String, Value>>,
    pub ask: Vec<HashMap<String, Value>>,
}

/// Convert a raw book into an [`OrderBook`] with both sides sorted ascending.
pub fn convert_orderbook(raw: &RawOrderBook, traded_currency: &str, exchange: &str) -> OrderBook {
    let qty_field = format!("{traded_currency}_volume");
    OrderBook {
        pair: raw.pair.clone(),
        exchange: exchange.to_string(),
        bid: convert_side(&raw.bid, &qty_field),
        ask: convert_side(&raw.ask, &qty_field),
    }
}

fn convert_side(levels: &[HashMap<String, Value>], qty_field: &str) -> Vec<BookLevel> {
    let mut side: Vec<BookLevel> = levels
        .iter()
        .map(|level| BookLevel {
            price: level.get("price").map(lenient_decimal).unwrap_or(Decimal::ZERO),
            qty: level.get(qty_field).map(lenient_decimal).unwrap_or(Decimal::ZERO),
        })
        .collect();
    side.sort_by(|a, b| a.price.cmp(&b.price));
    side
}

/// Traded currency of `pair`, used to name the order-book quantity field.
///
/// Falls back to stripping a known quote suffix when no metadata was loaded.
pub fn traded_currency_for(pair: &str, meta: Option<&PairMeta>) -> String {
    if let Some(meta) = meta.filter(|m| !m.traded_currency.is_empty()) {
        return meta.traded_currency.to_lowercase();
    }
    KNOWN_QUOTES
        .iter()
        .find_map(|quote| pair.strip_suffix(quote).filter(|base| !base.is_empty()))
        .unwrap_or(pair)
        .to_string()
}

// ---------------------------------------------------------------------------
// Trades
// ---------------------------------------------------------------------------

/// Decode one positional trade tuple.
pub fn decode_trade_tuple(value: &Value, exchange: &str) -> Result<Trade, FeedError> {
    let fields = value
        .as_array()
        .ok_or_else(|| FeedError::Decode("trade tuple is not an array".into()))?;
    if fields.len() != TRADE_TUPLE_LEN {
        return Err(FeedError::Decode(format!(
            "trade tuple has {} fields, expected {TRADE_TUPLE_LEN}",
            fields.len()
        )));
    }

    let field_err = |idx: usize, what: &str| FeedError::Decode(format!("trade field {idx}: expected {what}"));

    let pair = fields[0].as_str().ok_or_else(|| field_err(0, "pair string"))?;
    let epoch = integral(&fields[1]).ok_or_else(|| field_err(1, "integer epoch"))?;
    let sequence = integral(&fields[2]).ok_or_else(|| field_err(2, "integer sequence"))?;
    let side: TradeSide = fields[3]
        .as_str()
        .ok_or_else(|| field_err(3, "side string"))?
        .parse()
        .map_err(FeedError::Decode)?;
    let filled_price = if fields[4].is_number() {
        number_to_decimal(&fields[4]).ok_or_else(|| field_err(4, "finite price"))?
    } else {
        return Err(field_err(4, "numeric price"));
    };
    let base_volume = decimal_string(&fields[5]).ok_or_else(|| field_err(5, "decimal string"))?;
    let traded_volume = decimal_string(&fields[6]).ok_or_else(|| field_err(6, "decimal string"))?;

    Ok(Trade {
        epoch,
        pair: pair.to_string(),
        side,
        exchange: exchange.to_string(),
        filled_price,
        base_volume,
        traded_volume,
        notional: filled_price * traded_volume,
        key: TradeKey { epoch, sequence },
    })
}

fn decimal_string(value: &Value) -> Option<Decimal> {
    value.as_str().and_then(|s| Decimal::from_str(s.trim()).ok())
}

/// Decode a trade publication (an array of tuples) and drop in-batch
/// duplicates. Any tuple failing the schema rejects the batch.
pub fn decode_trade_batch(data: &Value, exchange: &str) -> Result<Vec<Trade>, FeedError> {
    let tuples = data
        .as_array()
        .ok_or_else(|| FeedError::Decode("trade payload is not an array".into()))?;

    let trades = tuples
        .iter()
        .map(|tuple| decode_trade_tuple(tuple, exchange))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(dedup_trades(trades))
}

/// Keep the first trade per [`TradeKey`], preserving arrival order.
pub fn dedup_trades(trades: Vec<Trade>) -> Vec<Trade> {
    let mut seen = HashSet::with_capacity(trades.len());
    trades.into_iter().filter(|t| seen.insert(t.key)).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn orderbook_levels_are_sorted_and_use_traded_volume_field() {
        let raw: RawOrderBook = serde_json::from_value(json!({
            "pair": "btcidr",
            "bid": [
                {"price": "101", "btc_volume": "0.5", "idr_volume": "50"},
                {"price": "99", "btc_volume": "1.5"},
                {"price": "100", "btc_volume": "2"}
            ],
            "ask": [
                {"price": "105", "btc_volume": "0.1"},
                {"price": "103", "btc_volume": "0.2"}
            ]
        }))
        .unwrap();

        let book = convert_orderbook(&raw, "btc", "indodax");
        let bid_prices: Vec<Decimal> = book.bid.iter().map(|l| l.price).collect();
        assert_eq!(bid_prices, vec![dec!(99), dec!(100), dec!(101)]);
        assert_eq!(book.bid[2].qty, dec!(0.5));
        assert_eq!(book.ask[0].price, dec!(103));
        assert_eq!(book.exchange, "indodax");
        assert_eq!(book.pair, "btcidr");
    }

    #[test]
    fn unparseable_orderbook_values_degrade_to_zero() {
        let raw: RawOrderBook = serde_json::from_value(json!({
            "pair": "ethidr",
            "bid": [{"price": "abc", "eth_volume": null}, {"price": 12, "eth_volume": "1"}],
            "ask": []
        }))
        .unwrap();

        let book = convert_orderbook(&raw, "eth", "indodax");
        assert_eq!(book.bid[0].price, Decimal::ZERO);
        assert_eq!(book.bid[0].qty, Decimal::ZERO);
        assert_eq!(book.bid[1].price, dec!(12));
        assert!(book.ask.is_empty());
    }

    #[test]
    fn traded_currency_prefers_metadata() {
        let meta = PairMeta {
            id: "usdtidr".into(),
            traded_currency: "USDT".into(),
            ..PairMeta::default()
        };
        assert_eq!(traded_currency_for("usdtidr", Some(&meta)), "usdt");
    }

    #[test]
    fn traded_currency_falls_back_to_suffix_strip() {
        assert_eq!(traded_currency_for("btcidr", None), "btc");
        assert_eq!(traded_currency_for("ethusdt", None), "eth");
        // Only the suffix is removed, never characters inside the base.
        assert_eq!(traded_currency_for("dridr", None), "dr");
        assert_eq!(traded_currency_for("idr", None), "idr");
        assert_eq!(traded_currency_for("xyz", None), "xyz");
    }

    #[test]
    fn trade_tuple_decodes_all_fields() {
        let trade = decode_trade_tuple(
            &json!(["btcidr", 1_700_000_000, 55, "sell", 1_000_000_000, "500000", "0.0005"]),
            "indodax",
        )
        .unwrap();
        assert_eq!(trade.pair, "btcidr");
        assert_eq!(trade.epoch, 1_700_000_000);
        assert_eq!(trade.key, TradeKey { epoch: 1_700_000_000, sequence: 55 });
        assert_eq!(trade.side, TradeSide::Sell);
        assert_eq!(trade.filled_price, dec!(1000000000));
        assert_eq!(trade.base_volume, dec!(500000));
        assert_eq!(trade.traded_volume, dec!(0.0005));
        assert_eq!(trade.notional, dec!(500000));
    }

    #[test]
    fn fractional_price_is_accepted() {
        let trade = decode_trade_tuple(&json!(["dogeidr", 10, 1, "buy", 1523.5, "10", "2"]), "indodax").unwrap();
        assert_eq!(trade.filled_price, dec!(1523.5));
        assert_eq!(trade.notional, dec!(3047));
    }

    #[test]
    fn schema_mismatches_are_decode_errors() {
        let bad = [
            json!(["btcidr", 1, 2, "buy", 100, "1"]),
            json!(["btcidr", "1", 2, "buy", 100, "1", "1"]),
            json!(["btcidr", 1, 2.5, "buy", 100, "1", "1"]),
            json!(["btcidr", 1, 2, "hold", 100, "1", "1"]),
            json!(["btcidr", 1, 2, "buy", "100", "1", "1"]),
            json!(["btcidr", 1, 2, "buy", 100, 1, "1"]),
            json!(["btcidr", 1, 2, "buy", 100, "1", "x"]),
            json!({"pair": "btcidr"}),
        ];
        for tuple in bad {
            let err = decode_trade_tuple(&tuple, "indodax").unwrap_err();
            assert!(matches!(err, FeedError::Decode(_)), "{tuple}");
        }
    }

    #[test]
    fn batch_dedups_by_key_keeping_first_seen_order() {
        let batch = json!([
            ["btcidr", 100, 1, "buy", 10, "1", "1"],
            ["btcidr", 100, 2, "buy", 11, "1", "1"],
            ["btcidr", 100, 1, "sell", 99, "9", "9"],
            ["btcidr", 101, 1, "buy", 12, "1", "1"],
            ["btcidr", 100, 2, "buy", 11, "1", "1"]
        ]);
        let trades = decode_trade_batch(&batch, "indodax").unwrap();
        let keys: Vec<String> = trades.iter().map(|t| t.key.to_string()).collect();
        assert_eq!(keys, vec!["100-1", "100-2", "101-1"]);
        assert_eq!(trades[0].side, TradeSide::Buy);
        assert_eq!(trades[0].filled_price, dec!(10));
    }

    #[test]
    fn one_bad_tuple_rejects_the_batch() {
        let batch = json!([
            ["btcidr", 100, 1, "buy", 10, "1", "1"],
            ["btcidr", 100, 2, "buy"]
        ]);
        assert!(decode_trade_batch(&batch, "indodax").is_err());
        assert!(decode_trade_batch(&json!({"not": "an array"}), "indodax").is_err());
    }

    #[test]
    fn empty_batch_is_ok() {
        assert!(decode_trade_batch(&json!([]), "indodax").unwrap().is_empty());
    }
}
