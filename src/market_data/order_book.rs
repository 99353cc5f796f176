// =============================================================================
// Order Book State — Position-indexed L2 reconstruction for one symbol
// =============================================================================
//
// The broker delivers incremental insert/update/delete operations addressed
// by 0-based level index. Each side is a bounded vector kept sorted by the
// side's direction (bids descending, asks ascending).
//
// Invariants maintained by construction:
//   - strict price monotonicity per side, no duplicates
//   - every stored level has price > 0 and size > 0
//   - a level driven to size 0 is removed, never carried
//
// When an operation would violate price order the book cannot be trusted:
// the affected side is cleared and marked reset-pending, and only a fresh
// burst of inserts starting at position 0 rebuilds it.
// =============================================================================

use std::collections::VecDeque;

use serde::Serialize;
use thiserror::Error;
use tracing::error;

use crate::types::{DepthOp, DepthUpdate, Side, TradePrint};

use super::tape::{TapeRing, TapeStats};

/// Rolling window for book-delta aggregates (adds/cancels).
const DELTA_WINDOW_MS: i64 = 3_000;

/// Hard cap on retained delta events per side.
const MAX_DELTA_EVENTS: usize = 8_192;

/// Prints carried into journal snapshots.
const SNAPSHOT_PRINTS: usize = 12;

// =============================================================================
// Errors & validity
// =============================================================================

/// A depth operation that could not be applied. All variants are recoverable:
/// the update is dropped (and on `OrderViolation` the side resets).
#[derive(Debug, Error)]
pub enum BookError {
    #[error("{side} position {position} out of range (len {len})")]
    PositionOutOfRange {
        side: Side,
        position: usize,
        len: usize,
    },

    #[error("invalid price {price} at {side} position {position}")]
    InvalidPrice {
        side: Side,
        position: usize,
        price: f64,
    },

    #[error("negative size {size} at {side} position {position}")]
    NegativeSize {
        side: Side,
        position: usize,
        size: f64,
    },

    #[error("{side} price order violated at position {position} (price {price})")]
    OrderViolation {
        side: Side,
        position: usize,
        price: f64,
    },

    #[error("{side} side is reset-pending, update dropped")]
    ResetPending { side: Side },
}

/// Why a book is currently unusable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InvalidReason {
    EmptyBid,
    EmptyAsk,
    Crossed,
    Stale,
    ResetPending,
    Corrupt,
}

impl InvalidReason {
    /// The rejection reason string journaled by the coordinator.
    pub fn as_rejection(&self) -> &'static str {
        match self {
            Self::Crossed => "BookInvalid_Crossed",
            Self::EmptyBid | Self::EmptyAsk | Self::ResetPending => "BookInvalid_Empty",
            Self::Stale => "BookInvalid_Stale",
            Self::Corrupt => "BookInvalid_Corrupt",
        }
    }
}

// =============================================================================
// Levels & deltas
// =============================================================================

/// One price level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BookLevel {
    pub price: f64,
    pub size: f64,
}

/// A size change on one side, recorded for the rolling delta metrics.
#[derive(Debug, Clone, Copy)]
struct DeltaEvent {
    ts_ms: i64,
    at_best: bool,
    /// Positive = size added, negative = size cancelled.
    size_delta: f64,
}

/// Aggregated adds/cancels for one side over the rolling windows.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SideDeltas {
    pub adds_1s: usize,
    pub cancels_1s: usize,
    pub adds_3s: usize,
    pub cancels_3s: usize,
    pub added_size_3s: f64,
    pub cancelled_size_3s: f64,
    /// Counterparts restricted to the best level.
    pub best_adds_3s: usize,
    pub best_cancels_3s: usize,
    pub best_added_size_3s: f64,
    pub best_cancelled_size_3s: f64,
}

/// Last-change tracker for the best level of one side.
#[derive(Debug, Clone, Copy, Default)]
struct WallTracker {
    price: f64,
    size: f64,
    since_ms: i64,
}

// =============================================================================
// Snapshot
// =============================================================================

/// Cheap immutable view of one symbol's book + tape, safe to hand to any
/// reader. All metric computation downstream is a pure function of this.
#[derive(Debug, Clone, Serialize)]
pub struct BookSnapshot {
    pub symbol: String,
    pub captured_at_ms: i64,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    pub best_bid: Option<BookLevel>,
    pub best_ask: Option<BookLevel>,
    pub spread: Option<f64>,
    pub mid: Option<f64>,
    /// Age of the last depth receipt; None before any depth arrived.
    pub depth_age_ms: Option<i64>,
    /// Age of the last change to best price/size, per side.
    pub bid_wall_age_ms: Option<i64>,
    pub ask_wall_age_ms: Option<i64>,
    pub bid_deltas: SideDeltas,
    pub ask_deltas: SideDeltas,
    pub tape: TapeStats,
    pub recent_prints: Vec<TradePrint>,
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invalid_reason: Option<InvalidReason>,
}

// =============================================================================
// OrderBookState
// =============================================================================

/// Reconstructed book + tape ring for a single symbol.
///
/// Single-writer: only the feed dispatcher mutates this; everyone else reads
/// through `snapshot()`.
#[derive(Debug)]
pub struct OrderBookState {
    symbol: String,
    max_depth: usize,
    stale_window_ms: i64,
    bids: Vec<BookLevel>,
    asks: Vec<BookLevel>,
    last_depth_recv_ms: Option<i64>,
    reset_pending_bid: bool,
    reset_pending_ask: bool,
    bid_wall: Option<WallTracker>,
    ask_wall: Option<WallTracker>,
    bid_deltas: VecDeque<DeltaEvent>,
    ask_deltas: VecDeque<DeltaEvent>,
    tape: TapeRing,
    /// Transient feed errors observed (dropped updates). Counted, never
    /// propagated.
    dropped_updates: u64,
}

impl OrderBookState {
    pub fn new(
        symbol: impl Into<String>,
        max_depth: usize,
        stale_window_ms: i64,
        tape_window_ms: i64,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            max_depth,
            stale_window_ms,
            bids: Vec::with_capacity(max_depth + 1),
            asks: Vec::with_capacity(max_depth + 1),
            last_depth_recv_ms: None,
            reset_pending_bid: false,
            reset_pending_ask: false,
            bid_wall: None,
            ask_wall: None,
            bid_deltas: VecDeque::new(),
            ask_deltas: VecDeque::new(),
            tape: TapeRing::new(tape_window_ms),
            dropped_updates: 0,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn dropped_updates(&self) -> u64 {
        self.dropped_updates
    }

    // ── Depth application ───────────────────────────────────────────────

    /// Apply one incremental depth operation atomically.
    ///
    /// On error the update is dropped and the counter bumped; on an order
    /// violation the affected side is additionally cleared and marked
    /// reset-pending. The caller decides the log level.
    pub fn apply_depth(&mut self, update: &DepthUpdate) -> Result<(), BookError> {
        self.last_depth_recv_ms = Some(update.recv_ts_ms);

        let result = self.apply_inner(update);
        if result.is_err() {
            self.dropped_updates += 1;
        }

        self.refresh_wall(Side::Bid, update.recv_ts_ms);
        self.refresh_wall(Side::Ask, update.recv_ts_ms);
        self.prune_deltas(update.recv_ts_ms);

        result
    }

    fn apply_inner(&mut self, update: &DepthUpdate) -> Result<(), BookError> {
        let side = update.side;
        let pos = update.position;

        if update.size < 0.0 {
            return Err(BookError::NegativeSize {
                side,
                position: pos,
                size: update.size,
            });
        }

        if self.reset_pending(side) {
            // Only a fresh insert at the top restarts the side.
            if update.op == DepthOp::Insert && pos == 0 && update.size > 0.0 {
                self.clear_reset(side);
            } else {
                return Err(BookError::ResetPending { side });
            }
        }

        match update.op {
            DepthOp::Insert => {
                if update.size == 0.0 {
                    // Size-0 insert degenerates to a delete when addressable.
                    if pos < self.levels(side).len() {
                        return self.delete_at(side, pos, update.recv_ts_ms);
                    }
                    return Ok(());
                }
                self.insert_at(side, pos, update.price, update.size, update.recv_ts_ms)
            }
            DepthOp::Update => {
                if update.size == 0.0 {
                    return self.delete_at(side, pos, update.recv_ts_ms);
                }
                self.update_at(side, pos, update.price, update.size, update.recv_ts_ms)
            }
            DepthOp::Delete => self.delete_at(side, pos, update.recv_ts_ms),
        }
    }

    fn insert_at(
        &mut self,
        side: Side,
        pos: usize,
        price: f64,
        size: f64,
        ts_ms: i64,
    ) -> Result<(), BookError> {
        if price <= 0.0 {
            return Err(BookError::InvalidPrice {
                side,
                position: pos,
                price,
            });
        }

        let len = self.levels(side).len();
        if pos > len {
            return Err(BookError::PositionOutOfRange {
                side,
                position: pos,
                len,
            });
        }

        if !self.insert_preserves_order(side, pos, price) {
            self.signal_reset(side, pos, price);
            return Err(BookError::OrderViolation {
                side,
                position: pos,
                price,
            });
        }

        let max_depth = self.max_depth;
        let levels = self.levels_mut(side);
        levels.insert(pos, BookLevel { price, size });
        levels.truncate(max_depth);

        self.record_delta(side, ts_ms, pos == 0, size);
        Ok(())
    }

    fn update_at(
        &mut self,
        side: Side,
        pos: usize,
        price: f64,
        size: f64,
        ts_ms: i64,
    ) -> Result<(), BookError> {
        let len = self.levels(side).len();
        if pos >= len {
            return Err(BookError::PositionOutOfRange {
                side,
                position: pos,
                len,
            });
        }

        let existing = self.levels(side)[pos];
        if (existing.price - price).abs() > f64::EPSILON {
            // Price moved at this index: re-slot as delete + insert so the
            // order check runs against the shifted neighbours.
            self.delete_at(side, pos, ts_ms)?;
            return self.insert_at(side, pos.min(self.levels(side).len()), price, size, ts_ms);
        }

        self.levels_mut(side)[pos].size = size;
        self.record_delta(side, ts_ms, pos == 0, size - existing.size);
        Ok(())
    }

    fn delete_at(&mut self, side: Side, pos: usize, ts_ms: i64) -> Result<(), BookError> {
        let len = self.levels(side).len();
        if pos >= len {
            return Err(BookError::PositionOutOfRange {
                side,
                position: pos,
                len,
            });
        }

        let removed = self.levels_mut(side).remove(pos);
        self.record_delta(side, ts_ms, pos == 0, -removed.size);
        Ok(())
    }

    fn insert_preserves_order(&self, side: Side, pos: usize, price: f64) -> bool {
        let levels = self.levels(side);
        let better = pos.checked_sub(1).and_then(|i| levels.get(i));
        let worse = levels.get(pos);
        match side {
            Side::Bid => {
                better.map_or(true, |l| l.price > price) && worse.map_or(true, |l| price > l.price)
            }
            Side::Ask => {
                better.map_or(true, |l| l.price < price) && worse.map_or(true, |l| price < l.price)
            }
        }
    }

    fn signal_reset(&mut self, side: Side, pos: usize, price: f64) {
        error!(
            symbol = %self.symbol,
            side = %side,
            position = pos,
            price,
            "price order violated, clearing side and awaiting rebuild"
        );
        self.levels_mut(side).clear();
        match side {
            Side::Bid => self.reset_pending_bid = true,
            Side::Ask => self.reset_pending_ask = true,
        }
    }

    fn reset_pending(&self, side: Side) -> bool {
        match side {
            Side::Bid => self.reset_pending_bid,
            Side::Ask => self.reset_pending_ask,
        }
    }

    fn clear_reset(&mut self, side: Side) {
        match side {
            Side::Bid => self.reset_pending_bid = false,
            Side::Ask => self.reset_pending_ask = false,
        }
    }

    fn levels(&self, side: Side) -> &Vec<BookLevel> {
        match side {
            Side::Bid => &self.bids,
            Side::Ask => &self.asks,
        }
    }

    fn levels_mut(&mut self, side: Side) -> &mut Vec<BookLevel> {
        match side {
            Side::Bid => &mut self.bids,
            Side::Ask => &mut self.asks,
        }
    }

    // ── Deltas & walls ──────────────────────────────────────────────────

    fn record_delta(&mut self, side: Side, ts_ms: i64, at_best: bool, size_delta: f64) {
        if size_delta.abs() <= f64::EPSILON {
            return;
        }
        let queue = match side {
            Side::Bid => &mut self.bid_deltas,
            Side::Ask => &mut self.ask_deltas,
        };
        queue.push_back(DeltaEvent {
            ts_ms,
            at_best,
            size_delta,
        });
        while queue.len() > MAX_DELTA_EVENTS {
            queue.pop_front();
        }
    }

    fn prune_deltas(&mut self, now_ms: i64) {
        let cutoff = now_ms - DELTA_WINDOW_MS;
        for queue in [&mut self.bid_deltas, &mut self.ask_deltas] {
            while let Some(front) = queue.front() {
                if front.ts_ms < cutoff {
                    queue.pop_front();
                } else {
                    break;
                }
            }
        }
    }

    fn refresh_wall(&mut self, side: Side, ts_ms: i64) {
        let best = self.levels(side).first().copied();
        let tracker = match side {
            Side::Bid => &mut self.bid_wall,
            Side::Ask => &mut self.ask_wall,
        };
        match (best, tracker.as_mut()) {
            (Some(level), Some(t)) => {
                if (t.price - level.price).abs() > f64::EPSILON
                    || (t.size - level.size).abs() > f64::EPSILON
                {
                    t.price = level.price;
                    t.size = level.size;
                    t.since_ms = ts_ms;
                }
            }
            (Some(level), None) => {
                *tracker = Some(WallTracker {
                    price: level.price,
                    size: level.size,
                    since_ms: ts_ms,
                });
            }
            (None, _) => *tracker = None,
        }
    }

    fn side_deltas(&self, side: Side, now_ms: i64) -> SideDeltas {
        let queue = match side {
            Side::Bid => &self.bid_deltas,
            Side::Ask => &self.ask_deltas,
        };
        let cutoff_1s = now_ms - 1_000;
        let cutoff_3s = now_ms - DELTA_WINDOW_MS;

        let mut out = SideDeltas::default();
        for ev in queue {
            if ev.ts_ms < cutoff_3s || ev.ts_ms > now_ms {
                continue;
            }
            let is_add = ev.size_delta > 0.0;
            let magnitude = ev.size_delta.abs();

            if is_add {
                out.adds_3s += 1;
                out.added_size_3s += magnitude;
                if ev.ts_ms >= cutoff_1s {
                    out.adds_1s += 1;
                }
                if ev.at_best {
                    out.best_adds_3s += 1;
                    out.best_added_size_3s += magnitude;
                }
            } else {
                out.cancels_3s += 1;
                out.cancelled_size_3s += magnitude;
                if ev.ts_ms >= cutoff_1s {
                    out.cancels_1s += 1;
                }
                if ev.at_best {
                    out.best_cancels_3s += 1;
                    out.best_cancelled_size_3s += magnitude;
                }
            }
        }
        out
    }

    // ── Tape ────────────────────────────────────────────────────────────

    /// Append a trade print to the tape ring.
    pub fn record_trade(&mut self, event_ts_ms: i64, recv_ts_ms: i64, price: f64, size: f64) {
        self.tape.record(TradePrint {
            symbol: self.symbol.clone(),
            event_ts_ms,
            recv_ts_ms,
            price,
            size,
        });
    }

    pub fn last_tape_recv_ms(&self) -> Option<i64> {
        self.tape.last_recv_ms()
    }

    // ── Derived state ───────────────────────────────────────────────────

    pub fn best_bid(&self) -> Option<BookLevel> {
        self.bids.first().copied()
    }

    pub fn best_ask(&self) -> Option<BookLevel> {
        self.asks.first().copied()
    }

    /// Book usability as of `now_ms`. Never panics; downstream gates reject
    /// on the returned reason.
    pub fn is_valid(&self, now_ms: i64) -> (bool, Option<InvalidReason>) {
        if self.reset_pending_bid || self.reset_pending_ask {
            return (false, Some(InvalidReason::ResetPending));
        }
        if self.bids.is_empty() {
            return (false, Some(InvalidReason::EmptyBid));
        }
        if self.asks.is_empty() {
            return (false, Some(InvalidReason::EmptyAsk));
        }
        if let Some(reason) = self.detect_corruption() {
            return (false, Some(reason));
        }
        let best_bid = self.bids[0].price;
        let best_ask = self.asks[0].price;
        if best_bid >= best_ask {
            return (false, Some(InvalidReason::Crossed));
        }
        match self.last_depth_recv_ms {
            Some(ts) if now_ms - ts <= self.stale_window_ms => (true, None),
            _ => (false, Some(InvalidReason::Stale)),
        }
    }

    /// Duplicate price or non-positive level state is impossible if the
    /// mutation path is correct, so finding one is a bug.
    fn detect_corruption(&self) -> Option<InvalidReason> {
        for (side, levels) in [(Side::Bid, &self.bids), (Side::Ask, &self.asks)] {
            for pair in levels.windows(2) {
                let ordered = match side {
                    Side::Bid => pair[0].price > pair[1].price,
                    Side::Ask => pair[0].price < pair[1].price,
                };
                if !ordered {
                    error!(symbol = %self.symbol, side = %side, "book invariant violated: order/duplicate");
                    return Some(InvalidReason::Corrupt);
                }
            }
            if levels.iter().any(|l| l.price <= 0.0 || l.size <= 0.0) {
                error!(symbol = %self.symbol, side = %side, "book invariant violated: non-positive level");
                return Some(InvalidReason::Corrupt);
            }
        }
        None
    }

    /// Build the immutable view consumed by metrics, validator, coordinator
    /// and the admin API.
    pub fn snapshot(&self, now_ms: i64) -> BookSnapshot {
        let best_bid = self.best_bid();
        let best_ask = self.best_ask();
        let spread = match (best_bid, best_ask) {
            (Some(b), Some(a)) => Some(a.price - b.price),
            _ => None,
        };
        let mid = match (best_bid, best_ask) {
            (Some(b), Some(a)) => Some((a.price + b.price) / 2.0),
            _ => None,
        };
        let (valid, invalid_reason) = self.is_valid(now_ms);

        let tape = self.tape.stats(
            now_ms,
            best_bid.map(|l| l.price),
            best_ask.map(|l| l.price),
            DELTA_WINDOW_MS,
            self.stale_window_ms.max(DELTA_WINDOW_MS),
        );

        BookSnapshot {
            symbol: self.symbol.clone(),
            captured_at_ms: now_ms,
            bids: self.bids.clone(),
            asks: self.asks.clone(),
            best_bid,
            best_ask,
            spread,
            mid,
            depth_age_ms: self.last_depth_recv_ms.map(|ts| now_ms - ts),
            bid_wall_age_ms: self.bid_wall.map(|w| now_ms - w.since_ms),
            ask_wall_age_ms: self.ask_wall.map(|w| now_ms - w.since_ms),
            bid_deltas: self.side_deltas(Side::Bid, now_ms),
            ask_deltas: self.side_deltas(Side::Ask, now_ms),
            tape,
            recent_prints: self.tape.recent(SNAPSHOT_PRINTS),
            valid,
            invalid_reason,
        }
    }

    /// Snapshot with an explicit warmup window for the tape stats. Used by
    /// the coordinator so the warmup gate matches configuration.
    pub fn snapshot_with_warmup(&self, now_ms: i64, warmup_window_ms: i64) -> BookSnapshot {
        let mut snap = self.snapshot(now_ms);
        snap.tape = self.tape.stats(
            now_ms,
            snap.best_bid.map(|l| l.price),
            snap.best_ask.map(|l| l.price),
            DELTA_WINDOW_MS,
            warmup_window_ms,
        );
        snap
    }

    /// Order-sensitive digest of (best quotes, top-4 sizes, tape ring).
    /// Replay verifies per-step equality of this against the original run.
    pub fn fingerprint(&self) -> u64 {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        let mut mix = |bytes: &[u8]| {
            for b in bytes {
                hash ^= u64::from(*b);
                hash = hash.wrapping_mul(0x100_0000_01b3);
            }
        };
        for level in [self.best_bid(), self.best_ask()].into_iter().flatten() {
            mix(&level.price.to_bits().to_le_bytes());
            mix(&level.size.to_bits().to_le_bytes());
        }
        for levels in [&self.bids, &self.asks] {
            for level in levels.iter().take(4) {
                mix(&level.size.to_bits().to_le_bytes());
            }
        }
        mix(&self.tape.fingerprint().to_le_bytes());
        hash
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn book() -> OrderBookState {
        OrderBookState::new("TEST", 5, 3_000, 60_000)
    }

    fn update(side: Side, op: DepthOp, pos: usize, price: f64, size: f64) -> DepthUpdate {
        update_at(side, op, pos, price, size, 1_000)
    }

    fn update_at(
        side: Side,
        op: DepthOp,
        pos: usize,
        price: f64,
        size: f64,
        recv_ts_ms: i64,
    ) -> DepthUpdate {
        DepthUpdate {
            symbol: "TEST".to_string(),
            side,
            op,
            position: pos,
            price,
            size,
            recv_ts_ms,
        }
    }

    fn seed_two_sided(b: &mut OrderBookState) {
        b.apply_depth(&update(Side::Bid, DepthOp::Insert, 0, 10.00, 100.0))
            .unwrap();
        b.apply_depth(&update(Side::Bid, DepthOp::Insert, 1, 9.99, 200.0))
            .unwrap();
        b.apply_depth(&update(Side::Ask, DepthOp::Insert, 0, 10.05, 150.0))
            .unwrap();
        b.apply_depth(&update(Side::Ask, DepthOp::Insert, 1, 10.06, 250.0))
            .unwrap();
    }

    #[test]
    fn inserts_keep_monotone_order() {
        let mut b = book();
        seed_two_sided(&mut b);
        assert_eq!(b.best_bid().unwrap().price, 10.00);
        assert_eq!(b.best_ask().unwrap().price, 10.05);
        let (valid, reason) = b.is_valid(1_000);
        assert!(valid, "reason: {reason:?}");
    }

    #[test]
    fn crossed_book_invalidates() {
        // Scenario: bid insert above the ask.
        let mut b = book();
        b.apply_depth(&update(Side::Bid, DepthOp::Insert, 0, 10.00, 100.0))
            .unwrap();
        b.apply_depth(&update(Side::Ask, DepthOp::Insert, 0, 10.05, 100.0))
            .unwrap();
        b.apply_depth(&update(Side::Bid, DepthOp::Insert, 0, 10.06, 50.0))
            .unwrap();

        let (valid, reason) = b.is_valid(1_000);
        assert!(!valid);
        assert_eq!(reason, Some(InvalidReason::Crossed));
        assert_eq!(reason.unwrap().as_rejection(), "BookInvalid_Crossed");
    }

    #[test]
    fn insert_then_delete_restores_prior_state() {
        let mut b = book();
        seed_two_sided(&mut b);
        let before: Vec<BookLevel> = b.levels(Side::Bid).clone();

        b.apply_depth(&update(Side::Bid, DepthOp::Insert, 1, 9.995, 40.0))
            .unwrap();
        b.apply_depth(&update(Side::Bid, DepthOp::Delete, 1, 0.0, 0.0))
            .unwrap();

        assert_eq!(*b.levels(Side::Bid), before);
    }

    #[test]
    fn insert_at_bound_truncates_tail() {
        let mut b = OrderBookState::new("TEST", 3, 3_000, 60_000);
        b.apply_depth(&update(Side::Bid, DepthOp::Insert, 0, 10.00, 1.0))
            .unwrap();
        b.apply_depth(&update(Side::Bid, DepthOp::Insert, 1, 9.99, 1.0))
            .unwrap();
        b.apply_depth(&update(Side::Bid, DepthOp::Insert, 2, 9.98, 1.0))
            .unwrap();
        // Book full. Insert at the top evicts the deepest level.
        b.apply_depth(&update(Side::Bid, DepthOp::Insert, 0, 10.01, 1.0))
            .unwrap();
        let levels = b.levels(Side::Bid);
        assert_eq!(levels.len(), 3);
        assert_eq!(levels[0].price, 10.01);
        assert_eq!(levels[2].price, 9.99);
    }

    #[test]
    fn out_of_range_position_is_dropped() {
        let mut b = book();
        let err = b
            .apply_depth(&update(Side::Bid, DepthOp::Insert, 3, 10.00, 100.0))
            .unwrap_err();
        assert!(matches!(err, BookError::PositionOutOfRange { .. }));
        assert_eq!(b.dropped_updates(), 1);
    }

    #[test]
    fn size_zero_update_removes_level() {
        let mut b = book();
        seed_two_sided(&mut b);
        b.apply_depth(&update(Side::Ask, DepthOp::Update, 0, 10.05, 0.0))
            .unwrap();
        assert_eq!(b.best_ask().unwrap().price, 10.06);
    }

    #[test]
    fn update_with_new_price_reslots() {
        let mut b = book();
        seed_two_sided(&mut b);
        // Best bid price improves in place.
        b.apply_depth(&update(Side::Bid, DepthOp::Update, 0, 10.01, 80.0))
            .unwrap();
        let levels = b.levels(Side::Bid);
        assert_eq!(levels[0].price, 10.01);
        assert_eq!(levels[0].size, 80.0);
        assert_eq!(levels[1].price, 9.99);
        let (valid, _) = b.is_valid(1_000);
        assert!(valid);
    }

    #[test]
    fn order_violation_clears_side_and_requires_rebuild() {
        let mut b = book();
        seed_two_sided(&mut b);
        // Inserting a higher price below the best violates descending order.
        let err = b
            .apply_depth(&update(Side::Bid, DepthOp::Insert, 1, 10.50, 10.0))
            .unwrap_err();
        assert!(matches!(err, BookError::OrderViolation { .. }));
        assert!(b.levels(Side::Bid).is_empty());

        let (valid, reason) = b.is_valid(1_000);
        assert!(!valid);
        assert_eq!(reason, Some(InvalidReason::ResetPending));

        // Non-rebuild ops are dropped while pending.
        let err = b
            .apply_depth(&update(Side::Bid, DepthOp::Update, 0, 10.00, 10.0))
            .unwrap_err();
        assert!(matches!(err, BookError::ResetPending { .. }));

        // A fresh insert at position 0 rebuilds.
        b.apply_depth(&update(Side::Bid, DepthOp::Insert, 0, 10.00, 100.0))
            .unwrap();
        let (valid, reason) = b.is_valid(1_000);
        assert!(valid, "reason: {reason:?}");
    }

    #[test]
    fn ask_side_order_violation_also_resets() {
        let mut b = book();
        seed_two_sided(&mut b);
        let err = b
            .apply_depth(&update(Side::Ask, DepthOp::Insert, 1, 10.01, 10.0))
            .unwrap_err();
        assert!(matches!(err, BookError::OrderViolation { side: Side::Ask, .. }));
        assert!(b.levels(Side::Ask).is_empty());
    }

    #[test]
    fn stale_book_invalidates() {
        let mut b = book();
        seed_two_sided(&mut b);
        let (valid, _) = b.is_valid(1_000);
        assert!(valid);
        let (valid, reason) = b.is_valid(10_000);
        assert!(!valid);
        assert_eq!(reason, Some(InvalidReason::Stale));
    }

    #[test]
    fn empty_side_invalidates() {
        let mut b = book();
        b.apply_depth(&update(Side::Bid, DepthOp::Insert, 0, 10.00, 100.0))
            .unwrap();
        let (valid, reason) = b.is_valid(1_000);
        assert!(!valid);
        assert_eq!(reason, Some(InvalidReason::EmptyAsk));
    }

    #[test]
    fn negative_size_is_rejected() {
        let mut b = book();
        let err = b
            .apply_depth(&update(Side::Bid, DepthOp::Insert, 0, 10.00, -5.0))
            .unwrap_err();
        assert!(matches!(err, BookError::NegativeSize { .. }));
    }

    #[test]
    fn wall_age_tracks_best_level_changes() {
        let mut b = book();
        b.apply_depth(&update_at(Side::Bid, DepthOp::Insert, 0, 10.00, 100.0, 1_000))
            .unwrap();
        b.apply_depth(&update_at(Side::Ask, DepthOp::Insert, 0, 10.05, 100.0, 1_000))
            .unwrap();
        // Deep insert does not touch the best bid.
        b.apply_depth(&update_at(Side::Bid, DepthOp::Insert, 1, 9.99, 50.0, 3_000))
            .unwrap();

        let snap = b.snapshot(4_000);
        assert_eq!(snap.bid_wall_age_ms, Some(3_000));

        // Best bid size change resets the wall clock.
        b.apply_depth(&update_at(Side::Bid, DepthOp::Update, 0, 10.00, 70.0, 4_500))
            .unwrap();
        let snap = b.snapshot(5_000);
        assert_eq!(snap.bid_wall_age_ms, Some(500));
    }

    #[test]
    fn delta_aggregates_count_adds_and_cancels() {
        let mut b = book();
        b.apply_depth(&update_at(Side::Bid, DepthOp::Insert, 0, 10.00, 100.0, 1_000))
            .unwrap();
        b.apply_depth(&update_at(Side::Bid, DepthOp::Insert, 1, 9.99, 50.0, 1_200))
            .unwrap();
        b.apply_depth(&update_at(Side::Bid, DepthOp::Update, 0, 10.00, 60.0, 1_400))
            .unwrap();

        let snap = b.snapshot(1_500);
        assert_eq!(snap.bid_deltas.adds_3s, 2);
        assert_eq!(snap.bid_deltas.cancels_3s, 1);
        assert!((snap.bid_deltas.cancelled_size_3s - 40.0).abs() < 1e-9);
        assert_eq!(snap.bid_deltas.best_cancels_3s, 1);
    }

    #[test]
    fn snapshot_reflects_tape_and_quotes() {
        let mut b = book();
        seed_two_sided(&mut b);
        b.record_trade(900, 950, 10.05, 30.0);
        let snap = b.snapshot(1_000);
        assert_eq!(snap.tape.last_recv_ms, Some(950));
        assert!((snap.spread.unwrap() - 0.05).abs() < 1e-9);
        assert!((snap.mid.unwrap() - 10.025).abs() < 1e-9);
        assert!((snap.tape.traded_size_at_ask - 30.0).abs() < 1e-9);
        assert_eq!(snap.recent_prints.len(), 1);
    }

    #[test]
    fn fingerprint_changes_with_book_state() {
        let mut a = book();
        let mut b = book();
        seed_two_sided(&mut a);
        seed_two_sided(&mut b);
        assert_eq!(a.fingerprint(), b.fingerprint());
        b.apply_depth(&update(Side::Bid, DepthOp::Update, 0, 10.00, 99.0))
            .unwrap();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}
