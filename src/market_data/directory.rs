// =============================================================================
// Book Directory — Per-symbol book registry
// =============================================================================
//
// Owns every per-symbol `OrderBookState`. Mutation goes through the feed
// dispatcher only (single writer per symbol); all other subsystems read
// immutable snapshots.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::market_data::order_book::{BookError, BookSnapshot, OrderBookState};
use crate::types::DepthUpdate;

/// Book construction parameters, fixed at startup from config.
#[derive(Debug, Clone, Copy)]
pub struct BookParams {
    pub max_depth: usize,
    pub stale_window_ms: i64,
    pub tape_window_ms: i64,
}

/// Registry of reconstructed books keyed by symbol.
pub struct BookDirectory {
    params: BookParams,
    books: RwLock<HashMap<String, OrderBookState>>,
}

impl BookDirectory {
    pub fn new(params: BookParams) -> Self {
        Self {
            params,
            books: RwLock::new(HashMap::new()),
        }
    }

    /// Apply a depth update, creating the book on first contact.
    pub fn apply_depth(&self, update: &DepthUpdate) -> Result<(), BookError> {
        let mut books = self.books.write();
        let book = books
            .entry(update.symbol.clone())
            .or_insert_with(|| self.new_book(&update.symbol));
        book.apply_depth(update)
    }

    /// Record a trade print, creating the book on first contact.
    pub fn record_trade(
        &self,
        symbol: &str,
        event_ts_ms: i64,
        recv_ts_ms: i64,
        price: f64,
        size: f64,
    ) {
        let mut books = self.books.write();
        let book = books
            .entry(symbol.to_string())
            .or_insert_with(|| self.new_book(symbol));
        book.record_trade(event_ts_ms, recv_ts_ms, price, size);
    }

    fn new_book(&self, symbol: &str) -> OrderBookState {
        OrderBookState::new(
            symbol,
            self.params.max_depth,
            self.params.stale_window_ms,
            self.params.tape_window_ms,
        )
    }

    /// Immutable view of one symbol's book, if it exists.
    pub fn snapshot(&self, symbol: &str, now_ms: i64) -> Option<BookSnapshot> {
        self.books.read().get(symbol).map(|b| b.snapshot(now_ms))
    }

    /// Snapshot with the coordinator's configured warmup window.
    pub fn snapshot_with_warmup(
        &self,
        symbol: &str,
        now_ms: i64,
        warmup_window_ms: i64,
    ) -> Option<BookSnapshot> {
        self.books
            .read()
            .get(symbol)
            .map(|b| b.snapshot_with_warmup(now_ms, warmup_window_ms))
    }

    /// Receipt timestamp of the symbol's most recent print.
    pub fn last_tape_recv_ms(&self, symbol: &str) -> Option<i64> {
        self.books.read().get(symbol).and_then(|b| b.last_tape_recv_ms())
    }

    /// Replay determinism digest for one symbol.
    pub fn fingerprint(&self, symbol: &str) -> Option<u64> {
        self.books.read().get(symbol).map(|b| b.fingerprint())
    }

    /// Drop book state for a symbol that left the universe.
    pub fn remove(&self, symbol: &str) {
        self.books.write().remove(symbol);
    }

    pub fn symbols(&self) -> Vec<String> {
        self.books.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.books.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.books.read().is_empty()
    }
}
