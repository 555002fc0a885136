// =============================================================================
// API State — handles shared between the HTTP/WS layer and the services
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use crate::market_data::OrderBookStore;
use crate::service::CandleStreamer;

/// Everything a request handler may touch. Cloned per request as `Arc`.
pub struct ApiState {
    pub streamer: Arc<CandleStreamer>,
    pub orderbooks: Arc<OrderBookStore>,
    started_at: Instant,
}

impl ApiState {
    pub fn new(streamer: Arc<CandleStreamer>, orderbooks: Arc<OrderBookStore>) -> Self {
        Self {
            streamer,
            orderbooks,
            started_at: Instant::now(),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
