// =============================================================================
// Order Book Store — latest full snapshot per pair
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::types::OrderBook;

/// Latest order-book snapshot for every pair a feed has seen.
///
/// Snapshots are not diffs: each `replace` overwrites whatever was stored for
/// the pair. The lock is held only for the map read or write itself.
pub struct OrderBookStore {
    books: RwLock<HashMap<String, OrderBook>>,
}

impl OrderBookStore {
    pub fn new() -> Self {
        Self {
            books: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the stored snapshot for `pair`.
    pub fn replace(&self, pair: &str, book: OrderBook) {
        self.books.write().insert(pair.to_string(), book);
    }

    /// Get the current snapshot for a pair.
    pub fn get(&self, pair: &str) -> Option<OrderBook> {
        self.books.read().get(pair).cloned()
    }

    /// All pairs with a stored snapshot, sorted.
    pub fn pairs(&self) -> Vec<String> {
        let mut pairs: Vec<String> = self.books.read().keys().cloned().collect();
        pairs.sort();
        pairs
    }
}

impl Default for OrderBookStore {
    fn default() -> Self {
        Self::new()
    }
}
