// =============================================================================
// Indodax public REST client — pair metadata
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use super::normalize::lenient_decimal;
use crate::types::PairMeta;

#[derive(Clone)]
pub struct IndodaxRest {
    base_url: String,
    client: reqwest::Client,
}

impl IndodaxRest {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build reqwest client")?;

        let base_url = base_url.into().trim_end_matches('/').to_string();
        debug!(base_url = %base_url, "IndodaxRest initialised");

        Ok(Self { base_url, client })
    }

    /// GET /api/pairs: every tradable pair with its currencies and limits.
    #[instrument(skip(self), name = "indodax::get_pairs")]
    pub async fn get_pairs(&self) -> Result<Vec<PairMeta>> {
        let url = format!("{}/api/pairs", self.base_url);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /api/pairs request failed")?;

        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .context("failed to parse pairs response")?;

        if !status.is_success() {
            anyhow::bail!("Indodax GET /api/pairs returned {}: {}", status, body);
        }

        let entries = body
            .as_array()
            .context("pairs response is not an array")?;

        let pairs: Vec<PairMeta> = entries.iter().filter_map(parse_pair_meta).collect();
        if pairs.len() < entries.len() {
            warn!(
                skipped = entries.len() - pairs.len(),
                "pairs without id or currencies ignored"
            );
        }

        debug!(count = pairs.len(), "pair metadata retrieved");
        Ok(pairs)
    }
}

/// Build a [`PairMeta`] from one `/api/pairs` entry. Entries missing the id or
/// either currency are rejected.
pub fn parse_pair_meta(entry: &Value) -> Option<PairMeta> {
    let text = |key: &str| {
        entry[key]
            .as_str()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
    };

    Some(PairMeta {
        id: text("id")?,
        base_currency: text("base_currency")?,
        traded_currency: text("traded_currency")?,
        price_precision: lenient_decimal(&entry["price_precision"]),
        volume_precision: lenient_decimal(&entry["volume_precision"]),
        min_base_trade: lenient_decimal(&entry["trade_min_base_currency"]),
        is_suspended: flag(&entry["is_market_suspended"]),
        is_maintenance: flag(&entry["is_maintenance"]),
    })
}

/// Venue flags arrive as booleans or 0/1 integers.
fn flag(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_i64().is_some_and(|n| n != 0),
        Value::String(s) => s == "1" || s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}
