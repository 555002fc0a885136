// =============================================================================
// Stream credentials — channel ids and access tokens
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};

use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha512};

use crate::market_data::CandleSize;

/// Compare two byte strings without short-circuiting on the first mismatch.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        // Token length is fixed by configuration, so the length itself is not
        // a secret.
        return false;
    }

    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// Random alphanumeric token of `len` characters.
pub fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Produces `ch:<sha512 hex>` channel ids from the candle size and creation
/// time. A process-wide counter is mixed in so two ids minted in the same
/// millisecond still differ.
#[derive(Default)]
pub struct ChannelIdGenerator {
    seq: AtomicU64,
}

impl ChannelIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self, size: CandleSize, created_at_ms: i64) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let digest = Sha512::digest(format!("{size}{created_at_ms}{seq}").as_bytes());
        format!("ch:{}", hex::encode(digest))
    }
}
