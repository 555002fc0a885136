// =============================================================================
// Application Configuration — JSON file with serde defaults and env overrides
// =============================================================================
//
// Every field carries a serde default so that a partial (or empty) config file
// still loads. The file path comes from `MARKET_INGESTOR_CONFIG`; a handful of
// deployment-specific values can be overridden from the environment.
//
// =============================================================================

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::exchange::ReconnectPolicy;
use crate::market_data::CandleSize;

pub const CONFIG_PATH_ENV: &str = "MARKET_INGESTOR_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config.json";

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_base_url() -> String {
    "https://indodax.com".to_string()
}

fn default_ws_url() -> String {
    "wss://ws3.indodax.com/ws/".to_string()
}

fn default_orderbook_prefix() -> String {
    "market:order-book-".to_string()
}

fn default_trade_prefix() -> String {
    "market:trade-activity-".to_string()
}

fn default_pairs_to_listen() -> BTreeMap<String, bool> {
    BTreeMap::from([("btcidr".to_string(), true)])
}

fn default_max_pairs_per_connection() -> usize {
    10
}

fn default_subscribe_delay_ms() -> u64 {
    500
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_channel_capacity() -> usize {
    50
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/market.db")
}

fn default_flush_threshold() -> usize {
    100_000
}

fn default_flush_interval_secs() -> u64 {
    60
}

fn default_candle_sizes() -> Vec<CandleSize> {
    vec![CandleSize::ONE_MINUTE]
}

fn default_tick_interval_ms() -> u64 {
    1_000
}

fn default_registration_ttl_secs() -> i64 {
    24 * 3_600
}

fn default_token_len() -> usize {
    20
}

fn default_reaper_interval_secs() -> u64 {
    3_600
}

// =============================================================================
// Sections
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// CORS origins. Empty means any origin.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            allowed_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Filter used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Connection settings for the Indodax market-data websocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndodaxConfig {
    /// REST base, used for pair metadata.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_ws_url")]
    pub ws_url: String,

    /// Token sent in the websocket auth handshake.
    #[serde(default)]
    pub public_ws_token: String,

    #[serde(default = "default_orderbook_prefix")]
    pub orderbook_channel_prefix: String,

    #[serde(default = "default_trade_prefix")]
    pub trade_channel_prefix: String,

    /// Pair symbol -> whether to subscribe to it.
    #[serde(default = "default_pairs_to_listen")]
    pub pairs_to_listen: BTreeMap<String, bool>,

    #[serde(default = "default_max_pairs_per_connection")]
    pub max_pairs_per_connection: usize,

    /// Pause after subscribing each pair, protecting against venue rate limits.
    #[serde(default = "default_subscribe_delay_ms")]
    pub subscribe_delay_ms: u64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default)]
    pub reconnect: ReconnectPolicy,

    /// Buffer size of each feed output channel.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for IndodaxConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            ws_url: default_ws_url(),
            public_ws_token: String::new(),
            orderbook_channel_prefix: default_orderbook_prefix(),
            trade_channel_prefix: default_trade_prefix(),
            pairs_to_listen: default_pairs_to_listen(),
            max_pairs_per_connection: default_max_pairs_per_connection(),
            subscribe_delay_ms: default_subscribe_delay_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            reconnect: ReconnectPolicy::default(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl IndodaxConfig {
    /// Enabled pairs in a stable (sorted) order.
    pub fn enabled_pairs(&self) -> Vec<String> {
        self.pairs_to_listen
            .iter()
            .filter(|(_, listen)| **listen)
            .map(|(pair, _)| pair.clone())
            .collect()
    }

    pub fn subscribe_delay(&self) -> Duration {
        Duration::from_millis(self.subscribe_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExchangeConfig {
    #[serde(default)]
    pub indodax: IndodaxConfig,
}

/// Where trades and 1-minute candles are persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StorageBackend {
    Sqlite {
        #[serde(default = "default_db_path")]
        path: PathBuf,
    },
    /// Process-local; contents are lost on exit.
    Memory,
}

impl Default for StorageBackend {
    fn default() -> Self {
        Self::Sqlite {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    /// Buffer length that forces a flush without waiting for the timer.
    #[serde(default = "default_flush_threshold")]
    pub flush_threshold: usize,

    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            flush_threshold: default_flush_threshold(),
            flush_interval_secs: default_flush_interval_secs(),
        }
    }
}

impl StorageConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// One live accumulator is kept per size.
    #[serde(default = "default_candle_sizes")]
    pub candle_sizes: Vec<CandleSize>,

    /// When false every pair feeds the same series per size. When true each
    /// (exchange, pair) gets its own series.
    #[serde(default)]
    pub partition_by_pair: bool,

    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    #[serde(default = "default_registration_ttl_secs")]
    pub registration_ttl_secs: i64,

    #[serde(default = "default_token_len")]
    pub token_len: usize,

    #[serde(default = "default_reaper_interval_secs")]
    pub reaper_interval_secs: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            candle_sizes: default_candle_sizes(),
            partition_by_pair: false,
            tick_interval_ms: default_tick_interval_ms(),
            registration_ttl_secs: default_registration_ttl_secs(),
            token_len: default_token_len(),
            reaper_interval_secs: default_reaper_interval_secs(),
        }
    }
}

impl StreamConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }
}

// =============================================================================
// AppConfig
// =============================================================================

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub exchange: ExchangeConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub stream: StreamConfig,
}

impl AppConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(
            path = %path.display(),
            pairs = ?config.exchange.indodax.enabled_pairs(),
            "config loaded"
        );

        Ok(config)
    }

    /// Path named by `MARKET_INGESTOR_CONFIG`, or `config.json`.
    pub fn path_from_env() -> PathBuf {
        std::env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Apply `INGESTOR_PAIRS`, `INGESTOR_BIND_ADDR` and `INDODAX_WS_TOKEN`.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(pairs) = lookup("INGESTOR_PAIRS") {
            let pairs: BTreeMap<String, bool> = pairs
                .split(',')
                .map(|p| p.trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .map(|p| (p, true))
                .collect();
            if !pairs.is_empty() {
                self.exchange.indodax.pairs_to_listen = pairs;
            }
        }
        if let Some(addr) = lookup("INGESTOR_BIND_ADDR") {
            self.server.bind_addr = addr;
        }
        if let Some(token) = lookup("INDODAX_WS_TOKEN") {
            self.exchange.indodax.public_ws_token = token;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: AppConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.server.bind_addr, "0.0.0.0:8080");
        assert_eq!(cfg.storage.flush_threshold, 100_000);
        assert_eq!(cfg.storage.flush_interval(), Duration::from_secs(60));
        assert_eq!(cfg.stream.candle_sizes, vec![CandleSize::ONE_MINUTE]);
        assert!(!cfg.stream.partition_by_pair);
        assert_eq!(cfg.stream.registration_ttl_secs, 86_400);
        assert_eq!(cfg.exchange.indodax.max_pairs_per_connection, 10);
        assert_eq!(cfg.exchange.indodax.channel_capacity, 50);
        assert_eq!(cfg.exchange.indodax.reconnect, ReconnectPolicy::Immediate);
        assert!(matches!(cfg.storage.backend, StorageBackend::Sqlite { .. }));
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{
            "exchange": { "indodax": {
                "pairs_to_listen": { "ethidr": true, "btcidr": false, "solidr": true },
                "reconnect": { "kind": "exponential", "base_ms": 100, "max_ms": 1000 }
            } },
            "storage": { "backend": { "kind": "memory" } },
            "stream": { "candle_sizes": ["1m", "5m"], "partition_by_pair": true }
        }"#;
        let cfg: AppConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.exchange.indodax.enabled_pairs(), vec!["ethidr", "solidr"]);
        assert_eq!(cfg.exchange.indodax.trade_channel_prefix, "market:trade-activity-");
        assert_eq!(
            cfg.exchange.indodax.reconnect,
            ReconnectPolicy::Exponential { base_ms: 100, max_ms: 1000 }
        );
        assert_eq!(cfg.storage.backend, StorageBackend::Memory);
        assert_eq!(cfg.stream.candle_sizes.len(), 2);
        assert!(cfg.stream.partition_by_pair);
    }

    #[test]
    fn env_overrides_replace_pairs_and_token() {
        let mut cfg = AppConfig::default();
        cfg.apply_overrides(|key| match key {
            "INGESTOR_PAIRS" => Some("BTCIDR, ethidr,,".to_string()),
            "INDODAX_WS_TOKEN" => Some("secret".to_string()),
            _ => None,
        });
        assert_eq!(cfg.exchange.indodax.enabled_pairs(), vec!["btcidr", "ethidr"]);
        assert_eq!(cfg.exchange.indodax.public_ws_token, "secret");
        assert_eq!(cfg.server.bind_addr, "0.0.0.0:8080");
    }

    #[test]
    fn load_missing_file_is_an_error() {
        assert!(AppConfig::load("/definitely/not/here.json").is_err());
    }
}
