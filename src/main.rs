// =============================================================================
// Market Ingestor — Main Entry Point
// =============================================================================
//
// Wires the Indodax feed to its consumers:
//   feed ──trades──▶ storage (buffer + minute roll-up)
//        ──trades──▶ candle streamer ──▶ WebSocket subscribers
//        ──books───▶ order-book log consumer
// and serves the stream/order-book API.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod config;
mod error;
mod exchange;
mod market_data;
mod repository;
mod service;
mod types;

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::ApiState;
use crate::config::AppConfig;
use crate::exchange::indodax::IndodaxFeed;
use crate::market_data::OrderBookStore;
use crate::repository::Repositories;
use crate::service::{CandleStreamer, TradeStorage};
use crate::types::{OrderBook, Trade};

const SHUTDOWN_FLUSH_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    let config_path = AppConfig::path_from_env();
    let config_result = AppConfig::load(&config_path);
    let mut config = match &config_result {
        Ok(cfg) => cfg.clone(),
        Err(_) => AppConfig::default(),
    };
    config.apply_env_overrides();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.level)),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Market Ingestor — Starting Up                     ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    if let Err(e) = config_result {
        warn!(path = %config_path.display(), error = %e, "Failed to load config, using defaults");
    }

    let indodax = config.exchange.indodax.clone();
    let pairs = indodax.enabled_pairs();
    if pairs.is_empty() {
        warn!("No pairs enabled, the feed will not connect");
    }
    info!(pairs = ?pairs, "Configured pairs");

    // ── 2. Channels ──────────────────────────────────────────────────────
    let (storage_tx, storage_rx) = mpsc::channel::<Trade>(indodax.channel_capacity);
    let (stream_tx, stream_rx) = mpsc::channel::<Trade>(indodax.channel_capacity);
    let (book_tx, book_rx) = mpsc::channel::<OrderBook>(indodax.channel_capacity);

    // ── 3. Storage ───────────────────────────────────────────────────────
    let repos = Repositories::open(&config.storage.backend)?;
    let storage = Arc::new(TradeStorage::new(repos.trades, repos.candles, &config.storage));
    let mut storage_tasks = storage.clone().start(storage_rx);
    let storage_ingest = storage_tasks.remove(0);

    // ── 4. Candle streamer ───────────────────────────────────────────────
    let streamer = Arc::new(CandleStreamer::new(&config.stream));
    let _stream_tasks = streamer.clone().start(stream_rx);

    // ── 5. Order-book consumer ───────────────────────────────────────────
    tokio::spawn(log_orderbooks(book_rx));

    // ── 6. Indodax feed ──────────────────────────────────────────────────
    let orderbooks = Arc::new(OrderBookStore::new());
    let feed = Arc::new(IndodaxFeed::new(
        indodax.clone(),
        orderbooks.clone(),
        vec![book_tx],
        vec![storage_tx, stream_tx],
    )?);
    feed.load_pairs().await;
    let feed_tasks = exchange::listen_partitioned(feed, &pairs, indodax.max_pairs_per_connection);
    info!(connections = feed_tasks.len(), "Feed connections launched");

    // ── 7. Start the API server ──────────────────────────────────────────
    let api_state = Arc::new(ApiState::new(streamer, orderbooks));
    let app = api::rest::router(api_state, &config.server);
    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr).await?;
    info!(addr = %config.server.bind_addr, "API server listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server failed");
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 8. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received, stopping feed connections");

    // Aborted feed tasks drop their trade senders; the storage ingest task
    // then sees its channel close and flushes what is still buffered.
    for task in feed_tasks {
        task.abort();
    }
    match tokio::time::timeout(SHUTDOWN_FLUSH_TIMEOUT, storage_ingest).await {
        Ok(Ok(())) => info!("Final storage flush complete"),
        Ok(Err(e)) => error!(error = %e, "Storage ingest task failed during shutdown"),
        Err(_) => warn!("Timed out waiting for the final storage flush"),
    }

    info!(buffered = storage.buffered(), "Market Ingestor shut down complete.");
    Ok(())
}

async fn log_orderbooks(mut books: mpsc::Receiver<OrderBook>) {
    while let Some(book) = books.recv().await {
        debug!(
            pair = %book.pair,
            bids = book.bid.len(),
            asks = book.ask.len(),
            "order book updated"
        );
    }
}
