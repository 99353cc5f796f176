// =============================================================================
// Metrics Engine — Microstructure metrics from book snapshots
// =============================================================================
//
// Every metric is a pure function of a `BookSnapshot`; the engine only caches
// the latest result per symbol for downstream readers (validator, admin API,
// gate traces).
//
// When the book is invalid the engine emits zeroed metrics carrying the
// invalidity reason so the validator short-circuits instead of reasoning
// about garbage.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::Serialize;

use crate::market_data::order_book::{BookSnapshot, InvalidReason, SideDeltas};

/// Ratio cap applied where a denominator can collapse to zero (absorption,
/// spoof score). Keeps the JSON output finite.
const RATIO_CAP: f64 = 100.0;

/// Computed microstructure metrics for one symbol at one instant.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub symbol: String,
    pub computed_at_ms: i64,

    pub book_valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invalid_reason: Option<InvalidReason>,

    /// Σ bid size / Σ ask size over the top-K levels. None when the ask sum
    /// is zero (undefined, treated as no-signal).
    pub queue_imbalance: Option<f64>,

    pub bid_wall_age_ms: Option<i64>,
    pub ask_wall_age_ms: Option<i64>,

    /// Traded size into the side / net size added at the side. >= 1 means
    /// the side is absorbing. Capped.
    pub bid_absorption: Option<f64>,
    pub ask_absorption: Option<f64>,

    /// Cancels/adds ratio at the best levels, by count and by size. The
    /// headline spoof score is the worse of the two. Capped.
    pub spoof_count_ratio: f64,
    pub spoof_size_ratio: f64,
    pub spoof_score: f64,

    /// Trades/sec in the last 1s over trades/sec in the prior 2s window.
    pub tape_acceleration: Option<f64>,

    pub spread: Option<f64>,
    pub mid: Option<f64>,
    pub best_bid_size: Option<f64>,
    pub best_ask_size: Option<f64>,

    pub bid_deltas: SideDeltas,
    pub ask_deltas: SideDeltas,
}

impl MetricsSnapshot {
    /// Zeroed metrics for an invalid book.
    pub fn zeroed(symbol: &str, now_ms: i64, reason: Option<InvalidReason>) -> Self {
        Self {
            symbol: symbol.to_string(),
            computed_at_ms: now_ms,
            book_valid: false,
            invalid_reason: reason,
            queue_imbalance: None,
            bid_wall_age_ms: None,
            ask_wall_age_ms: None,
            bid_absorption: None,
            ask_absorption: None,
            spoof_count_ratio: 0.0,
            spoof_size_ratio: 0.0,
            spoof_score: 0.0,
            tape_acceleration: None,
            spread: None,
            mid: None,
            best_bid_size: None,
            best_ask_size: None,
            bid_deltas: SideDeltas::default(),
            ask_deltas: SideDeltas::default(),
        }
    }

    /// Compute all metrics from a snapshot. `imbalance_levels` is the K of
    /// the queue-imbalance sum.
    pub fn compute(snap: &BookSnapshot, imbalance_levels: usize) -> Self {
        if !snap.valid {
            return Self::zeroed(&snap.symbol, snap.captured_at_ms, snap.invalid_reason);
        }

        let bid_sum: f64 = snap
            .bids
            .iter()
            .take(imbalance_levels)
            .map(|l| l.size)
            .sum();
        let ask_sum: f64 = snap
            .asks
            .iter()
            .take(imbalance_levels)
            .map(|l| l.size)
            .sum();
        let queue_imbalance = if ask_sum > 0.0 {
            Some(bid_sum / ask_sum)
        } else {
            None
        };

        let bid_absorption = absorption(snap.tape.traded_size_at_bid, &snap.bid_deltas);
        let ask_absorption = absorption(snap.tape.traded_size_at_ask, &snap.ask_deltas);

        let (spoof_count_ratio, spoof_size_ratio) = spoof_ratios(&snap.bid_deltas, &snap.ask_deltas);
        let spoof_score = spoof_count_ratio.max(spoof_size_ratio);

        Self {
            symbol: snap.symbol.clone(),
            computed_at_ms: snap.captured_at_ms,
            book_valid: true,
            invalid_reason: None,
            queue_imbalance,
            bid_wall_age_ms: snap.bid_wall_age_ms,
            ask_wall_age_ms: snap.ask_wall_age_ms,
            bid_absorption,
            ask_absorption,
            spoof_count_ratio,
            spoof_size_ratio,
            spoof_score,
            tape_acceleration: snap.tape.acceleration(),
            spread: snap.spread,
            mid: snap.mid,
            best_bid_size: snap.best_bid.map(|l| l.size),
            best_ask_size: snap.best_ask.map(|l| l.size),
            bid_deltas: snap.bid_deltas.clone(),
            ask_deltas: snap.ask_deltas.clone(),
        }
    }
}

/// Traded size into a side over the window divided by the net size added at
/// that side. An exhausted or shrinking side with trades flowing in is full
/// absorption: the ratio saturates at the cap.
fn absorption(traded_size: f64, deltas: &SideDeltas) -> Option<f64> {
    let net_added = deltas.added_size_3s - deltas.cancelled_size_3s;
    if traded_size <= f64::EPSILON && net_added.abs() <= f64::EPSILON {
        return None;
    }
    if net_added <= f64::EPSILON {
        if traded_size > f64::EPSILON {
            return Some(RATIO_CAP);
        }
        return Some(0.0);
    }
    Some((traded_size / net_added).min(RATIO_CAP))
}

/// Cancels/adds at the best levels of both sides, by count and by size.
fn spoof_ratios(bid: &SideDeltas, ask: &SideDeltas) -> (f64, f64) {
    let adds_count = (bid.best_adds_3s + ask.best_adds_3s) as f64;
    let cancels_count = (bid.best_cancels_3s + ask.best_cancels_3s) as f64;
    let adds_size = bid.best_added_size_3s + ask.best_added_size_3s;
    let cancels_size = bid.best_cancelled_size_3s + ask.best_cancelled_size_3s;

    let count_ratio = ratio_or_cap(cancels_count, adds_count);
    let size_ratio = ratio_or_cap(cancels_size, adds_size);
    (count_ratio, size_ratio)
}

fn ratio_or_cap(numerator: f64, denominator: f64) -> f64 {
    if denominator <= f64::EPSILON {
        if numerator > f64::EPSILON {
            RATIO_CAP
        } else {
            0.0
        }
    } else {
        (numerator / denominator).min(RATIO_CAP)
    }
}

// =============================================================================
// Engine (latest-snapshot cache)
// =============================================================================

/// Caches the latest metrics per symbol for downstream read.
pub struct MetricsEngine {
    imbalance_levels: usize,
    latest: RwLock<HashMap<String, MetricsSnapshot>>,
}

impl MetricsEngine {
    pub fn new(imbalance_levels: usize) -> Self {
        Self {
            imbalance_levels,
            latest: RwLock::new(HashMap::new()),
        }
    }

    /// Compute metrics for a snapshot and cache the result.
    pub fn update(&self, snap: &BookSnapshot) -> MetricsSnapshot {
        let metrics = MetricsSnapshot::compute(snap, self.imbalance_levels);
        self.latest
            .write()
            .insert(metrics.symbol.clone(), metrics.clone());
        metrics
    }

    pub fn latest(&self, symbol: &str) -> Option<MetricsSnapshot> {
        self.latest.read().get(symbol).cloned()
    }

    pub fn remove(&self, symbol: &str) {
        self.latest.write().remove(symbol);
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::order_book::OrderBookState;
    use crate::types::{DepthOp, DepthUpdate, Side};

    fn apply(
        b: &mut OrderBookState,
        side: Side,
        op: DepthOp,
        pos: usize,
        price: f64,
        size: f64,
        ts: i64,
    ) {
        b.apply_depth(&DepthUpdate {
            symbol: "TEST".to_string(),
            side,
            op,
            position: pos,
            price,
            size,
            recv_ts_ms: ts,
        })
        .unwrap();
    }

    fn seeded_book(ts: i64) -> OrderBookState {
        let mut b = OrderBookState::new("TEST", 5, 3_000, 60_000);
        apply(&mut b, Side::Bid, DepthOp::Insert, 0, 10.00, 300.0, ts);
        apply(&mut b, Side::Bid, DepthOp::Insert, 1, 9.99, 100.0, ts);
        apply(&mut b, Side::Ask, DepthOp::Insert, 0, 10.05, 100.0, ts);
        apply(&mut b, Side::Ask, DepthOp::Insert, 1, 10.06, 100.0, ts);
        b
    }

    #[test]
    fn queue_imbalance_over_top_levels() {
        let b = seeded_book(1_000);
        let m = MetricsSnapshot::compute(&b.snapshot(1_000), 4);
        // (300 + 100) / (100 + 100) = 2.0
        assert!((m.queue_imbalance.unwrap() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn queue_imbalance_respects_level_limit() {
        let b = seeded_book(1_000);
        let m = MetricsSnapshot::compute(&b.snapshot(1_000), 1);
        // 300 / 100 at the top level only.
        assert!((m.queue_imbalance.unwrap() - 3.0).abs() < 1e-9);
    }

    #[test]
    fn zeroed_metrics_for_invalid_book() {
        let b = OrderBookState::new("TEST", 5, 3_000, 60_000);
        let m = MetricsSnapshot::compute(&b.snapshot(1_000), 4);
        assert!(!m.book_valid);
        assert_eq!(m.invalid_reason, Some(InvalidReason::EmptyBid));
        assert!(m.queue_imbalance.is_none());
        assert!((m.spoof_score - 0.0).abs() < 1e-9);
    }

    #[test]
    fn absorption_trades_over_net_adds() {
        let mut b = seeded_book(1_000);
        // 60 more added to the bid side within the window.
        apply(&mut b, Side::Bid, DepthOp::Update, 1, 9.99, 160.0, 1_200);
        // 90 traded into the bid.
        b.record_trade(1_250, 1_250, 10.00, 90.0);
        let m = MetricsSnapshot::compute(&b.snapshot(1_300), 4);
        // Seeding added 400 to the bid side, plus 60 = 460 net added.
        let expected = 90.0 / 460.0;
        assert!((m.bid_absorption.unwrap() - expected).abs() < 1e-9);
    }

    #[test]
    fn absorption_caps_when_side_not_replenishing() {
        let mut b = seeded_book(1_000);
        // Cancel more than was added at the bid, then trade into it, with
        // the snapshot window past the seeding adds.
        apply(&mut b, Side::Bid, DepthOp::Update, 0, 10.00, 100.0, 5_000);
        b.record_trade(5_100, 5_100, 10.00, 50.0);
        let m = MetricsSnapshot::compute(&b.snapshot(5_200), 4);
        assert!((m.bid_absorption.unwrap() - RATIO_CAP).abs() < 1e-9);
    }

    #[test]
    fn spoof_score_counts_best_level_cancels() {
        let mut b = seeded_book(1_000);
        // Three adds then three cancels at the best bid.
        apply(&mut b, Side::Bid, DepthOp::Update, 0, 10.00, 400.0, 1_100);
        apply(&mut b, Side::Bid, DepthOp::Update, 0, 10.00, 500.0, 1_150);
        apply(&mut b, Side::Bid, DepthOp::Update, 0, 10.00, 350.0, 1_200);
        apply(&mut b, Side::Bid, DepthOp::Update, 0, 10.00, 200.0, 1_250);
        apply(&mut b, Side::Bid, DepthOp::Update, 0, 10.00, 120.0, 1_300);
        let m = MetricsSnapshot::compute(&b.snapshot(1_400), 4);
        assert!(m.spoof_score > 0.0);
        assert!(m.spoof_count_ratio > 0.0);
        assert!(m.spoof_size_ratio > 0.0);
    }

    #[test]
    fn engine_caches_latest_per_symbol() {
        let engine = MetricsEngine::new(4);
        let b = seeded_book(1_000);
        engine.update(&b.snapshot(1_000));
        let cached = engine.latest("TEST").unwrap();
        assert!(cached.book_valid);
        assert!(engine.latest("OTHER").is_none());
        engine.remove("TEST");
        assert!(engine.latest("TEST").is_none());
    }
}
