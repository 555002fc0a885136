// =============================================================================
// Exchange feeds — venue adapters producing normalized market events
// =============================================================================

pub mod indodax;
pub mod reconnect;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{error, info};

pub use reconnect::ReconnectPolicy;

/// A venue connection that pushes normalized trades and order books to its
/// registered output channels.
#[async_trait]
pub trait MarketDataFeed: Send + Sync {
    /// Venue identifier stamped on every emitted record.
    fn name(&self) -> &'static str;

    /// Stream `pairs` over one connection, restarting the session after every
    /// failure. Returns only once nothing downstream is listening any more.
    async fn listen(&self, connection_id: usize, pairs: Vec<String>) -> anyhow::Result<()>;
}

/// Split `pairs` into shards of at most `max_pairs_per_connection` and run one
/// `listen` task per shard. Connection ids start at 1.
pub fn listen_partitioned<F>(
    feed: Arc<F>,
    pairs: &[String],
    max_pairs_per_connection: usize,
) -> Vec<JoinHandle<()>>
where
    F: MarketDataFeed + 'static,
{
    shard_pairs(pairs, max_pairs_per_connection)
        .into_iter()
        .enumerate()
        .map(|(idx, shard)| {
            let feed = feed.clone();
            let connection_id = idx + 1;
            tokio::spawn(async move {
                info!(
                    exchange = feed.name(),
                    connection = connection_id,
                    pairs = ?shard,
                    "feed shard starting"
                );
                match feed.listen(connection_id, shard).await {
                    Ok(()) => info!(exchange = feed.name(), connection = connection_id, "feed shard finished"),
                    Err(e) => error!(
                        exchange = feed.name(),
                        connection = connection_id,
                        error = %e,
                        "feed shard stopped"
                    ),
                }
            })
        })
        .collect()
}

fn shard_pairs(pairs: &[String], max_pairs_per_connection: usize) -> Vec<Vec<String>> {
    pairs
        .chunks(max_pairs_per_connection.max(1))
        .map(|chunk| chunk.to_vec())
        .collect()
}
