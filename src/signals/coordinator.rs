// =============================================================================
// Signal Coordinator — Per-snapshot gating, scarcity, blueprint emission
// =============================================================================
//
// Every depth/tape update on an evaluated symbol funnels through here:
//
//   1. active-universe gate (silent drop)
//   2. per-symbol evaluation throttle (silent drop)
//   3. book-validity gate
//   4. tape-freshness + warmup gate (local receipt time)
//   5. metrics + validator
//   6. optional rank-window staging
//   7. scarcity controller
//   8. blueprint synthesis + journal emission
//
// Gates 3+ journal a Rejection with the concrete reason (and a gate trace
// when configured); a snapshot with no candidate is not a rejection and
// stays silent.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info};

use crate::journal::{
    AcceptanceContext, AcceptanceEntry, GateThresholds, GateTrace, Journal, JournalEntry,
    RejectionEntry, market_timestamp_utc, DECISION_SCHEMA_VERSION, NESTED_SCHEMA_VERSION,
};
use crate::market_data::order_book::BookSnapshot;
use crate::market_data::BookDirectory;
use crate::metrics::MetricsEngine;
use crate::runtime_config::RuntimeConfig;
use crate::signals::scarcity::{FlushedBucket, RankWindow, ScarcityController, ScarcityVerdict};
use crate::signals::validator::SignalValidator;
use crate::types::{Direction, TradeBlueprint};

/// Decision-id source: wall-clock UUIDs live, a seeded stream in replay so
/// identical inputs produce identical ids.
pub enum DecisionIds {
    Wall,
    Seeded(ChaCha8Rng),
}

impl DecisionIds {
    pub fn wall() -> Self {
        Self::Wall
    }

    pub fn seeded(seed: u64) -> Self {
        Self::Seeded(ChaCha8Rng::seed_from_u64(seed))
    }

    fn next(&mut self) -> String {
        match self {
            Self::Wall => uuid::Uuid::new_v4().to_string(),
            Self::Seeded(rng) => {
                let mut bytes = [0u8; 16];
                rng.fill_bytes(&mut bytes);
                uuid::Builder::from_random_bytes(bytes)
                    .into_uuid()
                    .to_string()
            }
        }
    }
}

/// Outcome of one processed snapshot, for the caller (notify, window exit).
#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    Accepted(AcceptanceEntry),
    Rejected { symbol: String, reason: String },
}

/// Context pinned when a candidate is staged into the rank window.
struct StagedContext {
    direction: Direction,
    confidence: f64,
    snapshot: BookSnapshot,
}

struct RankState {
    window: RankWindow,
    contexts: HashMap<String, StagedContext>,
}

pub struct SignalCoordinator {
    cfg: RuntimeConfig,
    books: Arc<BookDirectory>,
    metrics: Arc<MetricsEngine>,
    journal: Arc<Journal>,
    validator: Mutex<SignalValidator>,
    scarcity: Mutex<ScarcityController>,
    rank: Mutex<RankState>,
    last_eval_ms: Mutex<HashMap<String, i64>>,
    ids: Mutex<DecisionIds>,
}

impl SignalCoordinator {
    pub fn new(
        cfg: RuntimeConfig,
        books: Arc<BookDirectory>,
        metrics: Arc<MetricsEngine>,
        journal: Arc<Journal>,
        ids: DecisionIds,
    ) -> Self {
        let validator = SignalValidator::new(cfg.signals.clone());
        let scarcity = ScarcityController::new(cfg.scarcity.clone());
        let window = RankWindow::new(cfg.scarcity.rank_window_seconds);
        Self {
            cfg,
            books,
            metrics,
            journal,
            validator: Mutex::new(validator),
            scarcity: Mutex::new(scarcity),
            rank: Mutex::new(RankState {
                window,
                contexts: HashMap::new(),
            }),
            last_eval_ms: Mutex::new(HashMap::new()),
            ids: Mutex::new(ids),
        }
    }

    /// Blueprints accepted against the current UTC day's quota.
    pub fn accepted_today(&self) -> usize {
        self.scarcity.lock().accepted_today()
    }

    /// Drop rising-edge/throttle state for a symbol leaving the universe.
    pub fn forget_symbol(&self, symbol: &str) {
        self.validator.lock().forget_symbol(symbol);
        self.last_eval_ms.lock().remove(symbol);
        self.metrics.remove(symbol);
    }

    // ── Snapshot processing ─────────────────────────────────────────────

    /// Run the gate sequence for one symbol. `active` is the caller's
    /// Eval-and-ready verdict; inactive symbols drop silently.
    pub fn process_snapshot(
        &self,
        symbol: &str,
        now_ms: i64,
        active: bool,
    ) -> Vec<CoordinatorEvent> {
        if !active {
            return Vec::new();
        }

        // Per-symbol evaluation throttle.
        {
            let mut last = self.last_eval_ms.lock();
            if let Some(prev) = last.get(symbol) {
                if now_ms - prev < self.cfg.throttle_ms {
                    return Vec::new();
                }
            }
            last.insert(symbol.to_string(), now_ms);
        }

        let Some(snap) =
            self.books
                .snapshot_with_warmup(symbol, now_ms, self.cfg.tape.warmup_window_ms)
        else {
            return vec![self.reject(symbol, "NotReady_NoDepth", None, 0.0, None, now_ms)];
        };

        // Book-validity gate.
        if !snap.valid {
            let reason = snap
                .invalid_reason
                .map(|r| r.as_rejection())
                .unwrap_or("BookInvalid_Empty");
            let trace = self.gate_trace(&snap, now_ms);
            return vec![self.reject(symbol, reason, None, 0.0, trace, now_ms)];
        }

        // Tape-freshness gate: local receipt time, plus warmup.
        let tape_fresh = snap
            .tape
            .last_recv_ms
            .map(|last| now_ms - last <= self.cfg.tape.stale_window_ms)
            .unwrap_or(false);
        let warmup_ok = snap.tape.prints_in_warmup >= self.cfg.tape.warmup_min_trades;
        if !tape_fresh || !warmup_ok {
            let trace = self.gate_trace(&snap, now_ms);
            return vec![self.reject(symbol, "NotReady_TapeStale", None, 0.0, trace, now_ms)];
        }

        // Metrics + validator.
        let metrics = self.metrics.update(&snap);
        let decision = self.validator.lock().evaluate(&metrics, now_ms);

        if let Some(reason) = decision.rejection_reason {
            let trace = self.gate_trace(&snap, now_ms);
            return vec![self.reject(
                symbol,
                reason,
                decision.direction,
                decision.confidence,
                trace,
                now_ms,
            )];
        }
        if !decision.accepted {
            return Vec::new();
        }

        let direction = match decision.direction {
            Some(d) => d,
            None => return Vec::new(),
        };

        // Rank-window staging, or straight to scarcity.
        let staged_flush = {
            let mut rank = self.rank.lock();
            if rank.window.enabled() {
                let flushed = rank.window.stage(symbol, decision.confidence, now_ms);
                rank.contexts.insert(
                    symbol.to_string(),
                    StagedContext {
                        direction,
                        confidence: decision.confidence,
                        snapshot: snap.clone(),
                    },
                );
                debug!(symbol = %symbol, confidence = decision.confidence, "candidate staged into rank window");
                Some(flushed)
            } else {
                None
            }
        };

        match staged_flush {
            Some(flushed) => flushed
                .map(|bucket| self.process_flush(bucket, now_ms))
                .unwrap_or_default(),
            None => {
                let verdict = self.scarcity.lock().check(symbol, now_ms, now_ms);
                match verdict {
                    ScarcityVerdict::Allow => {
                        match self.accept(symbol, direction, decision.confidence, &snap, now_ms, now_ms)
                        {
                            Some(event) => vec![event],
                            None => vec![self.reject(
                                symbol,
                                "BookInvalid_Crossed",
                                Some(direction),
                                decision.confidence,
                                None,
                                now_ms,
                            )],
                        }
                    }
                    other => vec![self.reject(
                        symbol,
                        other.as_rejection(),
                        Some(direction),
                        decision.confidence,
                        None,
                        now_ms,
                    )],
                }
            }
        }
    }

    /// Timer hook: flush the rank window when its bucket rolled over without
    /// a staging event.
    pub fn poll_rank_window(&self, now_ms: i64) -> Vec<CoordinatorEvent> {
        let flushed = self.rank.lock().window.poll(now_ms);
        flushed
            .map(|bucket| self.process_flush(bucket, now_ms))
            .unwrap_or_default()
    }

    /// Unconditional flush (shutdown, replay end-of-stream).
    pub fn flush_rank_window(&self, now_ms: i64) -> Vec<CoordinatorEvent> {
        let flushed = self.rank.lock().window.flush();
        flushed
            .map(|bucket| self.process_flush(bucket, now_ms))
            .unwrap_or_default()
    }

    /// Greedily accept a flushed bucket from the top; after the first
    /// scarcity rejection every remaining candidate is ranked out.
    fn process_flush(&self, bucket: FlushedBucket, now_ms: i64) -> Vec<CoordinatorEvent> {
        let contexts: HashMap<String, StagedContext> = {
            let mut rank = self.rank.lock();
            bucket
                .ranked
                .iter()
                .filter_map(|c| rank.contexts.remove(&c.symbol).map(|ctx| (c.symbol.clone(), ctx)))
                .collect()
        };

        let mut events = Vec::with_capacity(bucket.ranked.len());
        let mut ranked_out = false;

        for candidate in &bucket.ranked {
            let Some(ctx) = contexts.get(&candidate.symbol) else {
                continue;
            };

            if ranked_out {
                events.push(self.reject(
                    &candidate.symbol,
                    "RejectedRankedOut",
                    Some(ctx.direction),
                    ctx.confidence,
                    None,
                    now_ms,
                ));
                continue;
            }

            let verdict = self
                .scarcity
                .lock()
                .check(&candidate.symbol, bucket.anchor_ms, now_ms);
            match verdict {
                ScarcityVerdict::Allow => {
                    match self.accept(
                        &candidate.symbol,
                        ctx.direction,
                        ctx.confidence,
                        &ctx.snapshot,
                        bucket.anchor_ms,
                        now_ms,
                    ) {
                        Some(event) => events.push(event),
                        None => {
                            events.push(self.reject(
                                &candidate.symbol,
                                "BookInvalid_Crossed",
                                Some(ctx.direction),
                                ctx.confidence,
                                None,
                                now_ms,
                            ));
                        }
                    }
                }
                other => {
                    events.push(self.reject(
                        &candidate.symbol,
                        other.as_rejection(),
                        Some(ctx.direction),
                        ctx.confidence,
                        None,
                        now_ms,
                    ));
                    ranked_out = true;
                }
            }
        }

        events
    }

    // ── Emission ────────────────────────────────────────────────────────

    fn accept(
        &self,
        symbol: &str,
        direction: Direction,
        confidence: f64,
        snap: &BookSnapshot,
        anchor_ms: i64,
        now_ms: i64,
    ) -> Option<CoordinatorEvent> {
        let best_bid = snap.best_bid?.price;
        let best_ask = snap.best_ask?.price;
        let blueprint = TradeBlueprint::synthesize(
            symbol,
            direction,
            best_bid,
            best_ask,
            self.cfg.signals.stop_spread_ratio,
            self.cfg.signals.target_spread_ratio,
            self.cfg.signals.risk_budget,
        )?;

        self.scarcity.lock().commit(symbol, anchor_ms, now_ms);

        let entry = AcceptanceEntry {
            schema_version: DECISION_SCHEMA_VERSION,
            session_id: self.journal.session_id().to_string(),
            market_timestamp_utc: market_timestamp_utc(now_ms),
            decision_id: self.ids.lock().next(),
            symbol: symbol.to_string(),
            direction,
            confidence,
            blueprint,
            context: AcceptanceContext {
                bids: snap.bids.clone(),
                asks: snap.asks.clone(),
                spread: snap.spread,
                mid: snap.mid,
                recent_prints: snap.recent_prints.clone(),
            },
        };

        info!(
            symbol = %symbol,
            direction = %direction,
            confidence = format!("{confidence:.1}"),
            decision_id = %entry.decision_id,
            "blueprint accepted"
        );

        self.journal
            .write(&JournalEntry::Acceptance(entry.clone()), now_ms);
        Some(CoordinatorEvent::Accepted(entry))
    }

    fn reject(
        &self,
        symbol: &str,
        reason: impl Into<String>,
        direction: Option<Direction>,
        confidence: f64,
        gate_trace: Option<GateTrace>,
        now_ms: i64,
    ) -> CoordinatorEvent {
        let reason = reason.into();
        let entry = RejectionEntry {
            schema_version: DECISION_SCHEMA_VERSION,
            session_id: self.journal.session_id().to_string(),
            market_timestamp_utc: market_timestamp_utc(now_ms),
            symbol: symbol.to_string(),
            reason: reason.clone(),
            direction,
            confidence,
            gate_trace,
        };
        self.journal.write(&JournalEntry::Rejection(entry), now_ms);
        CoordinatorEvent::Rejected {
            symbol: symbol.to_string(),
            reason,
        }
    }

    fn gate_trace(&self, snap: &BookSnapshot, now_ms: i64) -> Option<GateTrace> {
        if !self.cfg.journal.emit_gate_trace {
            return None;
        }
        Some(GateTrace {
            schema_version: NESTED_SCHEMA_VERSION,
            now_ms,
            last_trade_ms: snap.tape.last_recv_ms,
            trades_in_warmup_window: snap.tape.prints_in_warmup,
            warmup_ok: snap.tape.prints_in_warmup >= self.cfg.tape.warmup_min_trades,
            stale_age_ms: snap.tape.last_recv_ms.map(|last| now_ms - last),
            depth_age_ms: snap.depth_age_ms,
            depth_levels_known: snap.bids.len() + snap.asks.len(),
            thresholds: GateThresholds {
                max_spoof_score: self.cfg.signals.hard_gates.max_spoof_score,
                min_tape_acceleration: self.cfg.signals.hard_gates.min_tape_acceleration,
                min_wall_persistence_ms: self.cfg.signals.hard_gates.min_wall_persistence_ms,
                tape_stale_window_ms: self.cfg.tape.stale_window_ms,
                warmup_min_trades: self.cfg.tape.warmup_min_trades,
                warmup_window_ms: self.cfg.tape.warmup_window_ms,
            },
        })
    }
}
