// =============================================================================
// Evaluation-Window Controller — Time-boxed depth evaluations
// =============================================================================
//
// Owns the Probe→Eval upgrade decision and every evaluation exit. An
// evaluation ends for exactly one of: SignalEmitted, TimeoutExpired,
// DataInvalid, Aborted. On exit the depth and tick-by-tick streams are
// cancelled, the cooldown is stamped, an EvaluationExit entry is journaled,
// and the next best Probe is upgraded immediately.
//
// Candidate ranking before depth exists is necessarily cheap: tape rate over
// the last ten seconds, print recency, and a spread-tightness proxy.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::journal::{
    market_timestamp_utc, EvaluationExitEntry, Journal, JournalEntry, DECISION_SCHEMA_VERSION,
};
use crate::market_data::BookDirectory;
use crate::runtime_config::RuntimeConfig;
use crate::subscription::manager::{SubscriptionManager, UpgradeError};
use crate::subscription::registry::StreamKind;
use crate::types::{ExitReason, SubscriptionTier};

/// Window used by the pre-depth activity score.
const ACTIVITY_WINDOW_MS: i64 = 10_000;

struct ControllerState {
    /// Start of the current continuous-invalid stretch per eval symbol.
    invalid_since: HashMap<String, i64>,
    /// Symbols whose signal fired before the minimum window elapsed.
    pending_signal_exit: HashSet<String>,
}

pub struct EvaluationController {
    cfg: RuntimeConfig,
    sm: Arc<SubscriptionManager>,
    books: Arc<BookDirectory>,
    journal: Arc<Journal>,
    state: Mutex<ControllerState>,
}

impl EvaluationController {
    pub fn new(
        cfg: RuntimeConfig,
        sm: Arc<SubscriptionManager>,
        books: Arc<BookDirectory>,
        journal: Arc<Journal>,
    ) -> Self {
        Self {
            cfg,
            sm,
            books,
            journal,
            state: Mutex::new(ControllerState {
                invalid_since: HashMap::new(),
                pending_signal_exit: HashSet::new(),
            }),
        }
    }

    // ── Periodic tick ───────────────────────────────────────────────────

    /// One pass of the window timer: close expired or broken evaluations,
    /// then fill any free slots.
    pub async fn tick(&self, now_ms: i64) {
        let registry = self.sm.registry();

        // Forbidden state: the budget can never be exceeded.
        let eval_count = registry.eval_count();
        if eval_count > self.cfg.depth_slots {
            error!(
                eval_count,
                depth_slots = self.cfg.depth_slots,
                "evaluation slots exceeded, closing newest evaluations"
            );
        }

        let mut exits: Vec<(String, ExitReason)> = Vec::new();

        for record in registry.all_records() {
            if record.tier != SubscriptionTier::Eval {
                continue;
            }
            let Some(started) = record.eval_started_ms else {
                error!(symbol = %record.symbol, "depth active without an evaluation timer");
                exits.push((record.symbol.clone(), ExitReason::Aborted));
                continue;
            };
            let elapsed = now_ms - started;

            // A signal that fired inside the minimum window exits once the
            // minimum has elapsed.
            let signal_pending = self.state.lock().pending_signal_exit.contains(&record.symbol);
            if signal_pending && elapsed >= self.cfg.evaluation_window.min_ms {
                exits.push((record.symbol.clone(), ExitReason::SignalEmitted));
                continue;
            }

            if elapsed >= self.cfg.evaluation_window.max_ms {
                exits.push((record.symbol.clone(), ExitReason::TimeoutExpired));
                continue;
            }

            // Continuous book invalidity beyond the grace period.
            let valid = self
                .books
                .snapshot(&record.symbol, now_ms)
                .map(|s| s.valid)
                .unwrap_or(false);
            let mut state = self.state.lock();
            if valid {
                state.invalid_since.remove(&record.symbol);
            } else {
                let since = *state
                    .invalid_since
                    .entry(record.symbol.clone())
                    .or_insert(now_ms);
                if now_ms - since >= self.cfg.book.invalid_grace_ms {
                    drop(state);
                    exits.push((record.symbol.clone(), ExitReason::DataInvalid));
                }
            }
        }

        for (symbol, reason) in exits {
            self.exit(&symbol, reason, now_ms).await;
        }

        self.fill_slots(now_ms).await;
    }

    /// The coordinator accepted a blueprint for this symbol; close its
    /// window (immediately, or at the minimum bound if that hasn't passed).
    pub async fn note_signal_emitted(&self, symbol: &str, now_ms: i64) {
        let Some(record) = self.sm.registry().get(symbol) else {
            return;
        };
        if record.tier != SubscriptionTier::Eval {
            error!(symbol = %symbol, "signal emitted for a symbol not under evaluation");
            return;
        }
        let elapsed = record
            .eval_started_ms
            .map(|started| now_ms - started)
            .unwrap_or(i64::MAX);
        if elapsed >= self.cfg.evaluation_window.min_ms {
            self.exit(symbol, ExitReason::SignalEmitted, now_ms).await;
            self.fill_slots(now_ms).await;
        } else {
            debug!(symbol = %symbol, elapsed, "signal inside minimum window, exit deferred");
            self.state
                .lock()
                .pending_signal_exit
                .insert(symbol.to_string());
        }
    }

    /// The broker demoted depth capability while the evaluation was live.
    pub async fn note_depth_lost(&self, symbol: &str, now_ms: i64) {
        let is_eval = self
            .sm
            .registry()
            .get(symbol)
            .map(|r| r.tier == SubscriptionTier::Eval)
            .unwrap_or(false);
        if is_eval {
            self.exit(symbol, ExitReason::DataInvalid, now_ms).await;
            self.fill_slots(now_ms).await;
        }
    }

    /// Abort every live evaluation (shutdown, connection loss).
    pub async fn abort_all(&self, now_ms: i64) {
        for symbol in self
            .sm
            .registry()
            .symbols_in_tier(SubscriptionTier::Eval)
        {
            self.exit(&symbol, ExitReason::Aborted, now_ms).await;
        }
    }

    // ── Exit path ───────────────────────────────────────────────────────

    async fn exit(&self, symbol: &str, reason: ExitReason, now_ms: i64) {
        let Some(record) = self.sm.registry().get(symbol) else {
            warn!(symbol = %symbol, "exit for untracked symbol, ignoring");
            return;
        };
        let started = record.eval_started_ms.unwrap_or(now_ms);
        let duration_ms = (now_ms - started).max(0);

        {
            let mut state = self.state.lock();
            state.invalid_since.remove(symbol);
            state.pending_signal_exit.remove(symbol);
        }

        self.sm.downgrade_from_eval(symbol, now_ms).await;

        let entry = EvaluationExitEntry {
            schema_version: DECISION_SCHEMA_VERSION,
            session_id: self.journal.session_id().to_string(),
            market_timestamp_utc: market_timestamp_utc(now_ms),
            symbol: symbol.to_string(),
            started_ts_ms: started,
            ended_ts_ms: now_ms,
            duration_ms,
            exit_reason: reason,
            depth_minutes_consumed: duration_ms as f64 / 60_000.0,
        };
        self.journal
            .write(&JournalEntry::EvaluationExit(entry), now_ms);

        info!(
            symbol = %symbol,
            reason = %reason,
            duration_ms,
            "evaluation window closed"
        );
    }

    // ── Upgrades ────────────────────────────────────────────────────────

    /// Upgrade the best-ranked eligible Probes until the slots are full.
    pub async fn fill_slots(&self, now_ms: i64) {
        loop {
            if self.sm.registry().eval_count() >= self.cfg.depth_slots {
                return;
            }
            let Some(symbol) = self.select_upgrade_candidate(now_ms) else {
                return;
            };
            match self.sm.upgrade_to_eval(&symbol, now_ms).await {
                Ok(()) => {}
                Err(UpgradeError::NoSlotFree) => return,
                Err(e) => {
                    // Ineligible or broker-refused: the selector will not
                    // offer this symbol again within the TTL.
                    debug!(symbol = %symbol, error = %e, "upgrade attempt failed, trying next");
                }
            }
        }
    }

    /// Rank eligible Probes by the cheap pre-depth activity score.
    /// Ties break by score, then earliest Probe entry, then symbol.
    pub fn select_upgrade_candidate(&self, now_ms: i64) -> Option<String> {
        let registry = self.sm.registry();
        let mut best: Option<(f64, i64, String)> = None;

        for record in registry.all_records() {
            if record.tier != SubscriptionTier::Probe {
                continue;
            }
            if !record.contract.is_pipeline_eligible() {
                continue;
            }
            if registry.in_cooldown(&record.symbol, now_ms) {
                continue;
            }
            if registry.is_ineligible(&record.symbol, StreamKind::Depth, now_ms) {
                continue;
            }

            let score = self.activity_score(&record.symbol, now_ms);
            let candidate = (score, record.probe_since_ms, record.symbol.clone());
            best = match best {
                None => Some(candidate),
                Some(current) => {
                    let (cur_score, cur_since, ref cur_symbol) = current;
                    let better = score > cur_score
                        || (score == cur_score
                            && (candidate.1 < cur_since
                                || (candidate.1 == cur_since && candidate.2 < *cur_symbol)));
                    if better {
                        Some(candidate)
                    } else {
                        Some(current)
                    }
                }
            };
        }

        best.map(|(_, _, symbol)| symbol)
    }

    /// Prints/sec over the last 10s, plus recency and spread-tightness
    /// bonuses. Pre-depth, so it leans entirely on the probe tape.
    fn activity_score(&self, symbol: &str, now_ms: i64) -> f64 {
        let Some(snap) = self
            .books
            .snapshot_with_warmup(symbol, now_ms, ACTIVITY_WINDOW_MS)
        else {
            return 0.0;
        };

        let rate = snap.tape.prints_in_warmup as f64 / (ACTIVITY_WINDOW_MS as f64 / 1_000.0);
        let recency = match snap.tape.last_recv_ms {
            Some(last) if now_ms - last <= 2_000 => 1.0,
            _ => 0.0,
        };
        let tightness = match snap.spread {
            Some(spread) if spread > 0.0 => 1.0 / (1.0 + spread),
            _ => 0.0,
        };
        rate + recency + tightness
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::BrokerRequests;
    use crate::market_data::BookParams;
    use crate::subscription::registry::SubscriptionRegistry;
    use crate::types::{ContractInfo, StockType};
    use async_trait::async_trait;

    struct NullBroker;

    #[async_trait]
    impl BrokerRequests for NullBroker {
        async fn subscribe_l1(&self, _: i64, _: &str, _: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn cancel_l1(&self, _: i64) -> anyhow::Result<()> {
            Ok(())
        }
        async fn subscribe_depth(&self, _: i64, _: &str, _: usize, _: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn cancel_depth(&self, _: i64) -> anyhow::Result<()> {
            Ok(())
        }
        async fn subscribe_tbt(&self, _: i64, _: &str, _: &str, _: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn cancel_tbt(&self, _: i64) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn contract(symbol: &str) -> ContractInfo {
        ContractInfo {
            symbol: symbol.to_string(),
            contract_id: 7,
            security_type: "STK".to_string(),
            primary_exchange: "NASDAQ".to_string(),
            currency: "USD".to_string(),
            stock_type: StockType::Common,
            local_symbol: symbol.to_string(),
            trading_class: symbol.to_string(),
        }
    }

    struct Harness {
        controller: EvaluationController,
        sm: Arc<SubscriptionManager>,
        books: Arc<BookDirectory>,
        journal_dir: tempfile::TempDir,
    }

    fn harness(cfg: RuntimeConfig) -> Harness {
        let journal_dir = tempfile::tempdir().unwrap();
        let journal = Arc::new(
            Journal::open(journal_dir.path().join("decisions.jsonl"), "test-session").unwrap(),
        );
        let registry = Arc::new(SubscriptionRegistry::new());
        let sm = Arc::new(SubscriptionManager::new(
            cfg.clone(),
            registry,
            Arc::new(NullBroker),
        ));
        let books = Arc::new(BookDirectory::new(BookParams {
            max_depth: cfg.market_data.depth_rows,
            stale_window_ms: cfg.book.stale_window_ms,
            tape_window_ms: cfg.tape.window_ms,
        }));
        let controller =
            EvaluationController::new(cfg, sm.clone(), books.clone(), journal);
        Harness {
            controller,
            sm,
            books,
            journal_dir,
        }
    }

    fn journal_entries(h: &Harness) -> Vec<serde_json::Value> {
        let content =
            std::fs::read_to_string(h.journal_dir.path().join("decisions.jsonl")).unwrap();
        content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    /// Seed a symbol's book so DataInvalid never triggers.
    fn keep_book_valid(h: &Harness, symbol: &str, now_ms: i64) {
        use crate::types::{DepthOp, DepthUpdate, Side};
        for (side, price) in [(Side::Bid, 10.00), (Side::Ask, 10.05)] {
            h.books
                .apply_depth(&DepthUpdate {
                    symbol: symbol.to_string(),
                    side,
                    op: DepthOp::Insert,
                    position: 0,
                    price,
                    size: 100.0,
                    recv_ts_ms: now_ms,
                })
                .unwrap();
        }
    }

    /// Refresh an already-seeded book with size-only updates.
    fn refresh_book(h: &Harness, symbol: &str, now_ms: i64) {
        use crate::types::{DepthOp, DepthUpdate, Side};
        for (side, price) in [(Side::Bid, 10.00), (Side::Ask, 10.05)] {
            h.books
                .apply_depth(&DepthUpdate {
                    symbol: symbol.to_string(),
                    side,
                    op: DepthOp::Update,
                    position: 0,
                    price,
                    size: 120.0,
                    recv_ts_ms: now_ms,
                })
                .unwrap();
        }
    }

    #[tokio::test]
    async fn timeout_exit_journals_cooldowns_and_promotes_next() {
        // NVDA times out, the exit is journaled, the cooldown lands,
        // and the next-best probe takes the slot immediately.
        let mut cfg = RuntimeConfig::default();
        cfg.depth_slots = 1;
        cfg.evaluation_window.max_ms = 60_000;
        let h = harness(cfg);

        h.sm.apply_universe(&[contract("NVDA"), contract("MSFT")], 0)
            .await;
        h.sm.upgrade_to_eval("NVDA", 0).await.unwrap();
        keep_book_valid(&h, "NVDA", 0);

        // Just inside the bound: nothing happens.
        h.controller.tick(59_999).await;
        assert_eq!(
            h.sm.registry().get("NVDA").unwrap().tier,
            SubscriptionTier::Eval
        );

        h.controller.tick(60_001).await;

        let nvda = h.sm.registry().get("NVDA").unwrap();
        assert_eq!(nvda.tier, SubscriptionTier::Probe);
        assert!(nvda.depth_req_id.is_none());
        assert!(nvda.tbt_req_id.is_none());
        let cooldown = RuntimeConfig::default().evaluation_window.cooldown_ms;
        assert_eq!(nvda.cooldown_until_ms, Some(60_001 + cooldown));

        // The freed slot went to MSFT in the same tick.
        assert_eq!(
            h.sm.registry().get("MSFT").unwrap().tier,
            SubscriptionTier::Eval
        );

        let entries = journal_entries(&h);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["EntryType"], "EvaluationExit");
        assert_eq!(entries[0]["Symbol"], "NVDA");
        assert_eq!(entries[0]["ExitReason"], "TimeoutExpired");
        assert_eq!(entries[0]["DurationMs"], 60_001);
    }

    #[tokio::test]
    async fn persistent_invalid_book_exits_data_invalid() {
        let mut cfg = RuntimeConfig::default();
        cfg.book.invalid_grace_ms = 5_000;
        let h = harness(cfg);

        h.sm.apply_universe(&[contract("AAPL")], 0).await;
        h.sm.upgrade_to_eval("AAPL", 0).await.unwrap();
        // No book data at all: invalid from the start.

        h.controller.tick(1_000).await;
        assert_eq!(
            h.sm.registry().get("AAPL").unwrap().tier,
            SubscriptionTier::Eval
        );

        h.controller.tick(7_000).await;
        assert_eq!(
            h.sm.registry().get("AAPL").unwrap().tier,
            SubscriptionTier::Probe
        );

        let entries = journal_entries(&h);
        assert_eq!(entries[0]["ExitReason"], "DataInvalid");
    }

    #[tokio::test]
    async fn recovered_book_clears_invalid_stretch() {
        let mut cfg = RuntimeConfig::default();
        cfg.book.invalid_grace_ms = 5_000;
        let h = harness(cfg);

        h.sm.apply_universe(&[contract("AAPL")], 0).await;
        h.sm.upgrade_to_eval("AAPL", 0).await.unwrap();

        h.controller.tick(1_000).await;
        // Book recovers inside the grace period.
        keep_book_valid(&h, "AAPL", 4_000);
        h.controller.tick(4_500).await;
        // A new invalid stretch must run the full grace again.
        h.controller.tick(7_000).await;
        assert_eq!(
            h.sm.registry().get("AAPL").unwrap().tier,
            SubscriptionTier::Eval
        );
    }

    #[tokio::test]
    async fn signal_exit_respects_minimum_window() {
        let mut cfg = RuntimeConfig::default();
        cfg.evaluation_window.min_ms = 60_000;
        let h = harness(cfg);

        h.sm.apply_universe(&[contract("AAPL")], 0).await;
        h.sm.upgrade_to_eval("AAPL", 0).await.unwrap();
        keep_book_valid(&h, "AAPL", 0);

        // Signal inside the minimum window: deferred.
        h.controller.note_signal_emitted("AAPL", 30_000).await;
        assert_eq!(
            h.sm.registry().get("AAPL").unwrap().tier,
            SubscriptionTier::Eval
        );

        refresh_book(&h, "AAPL", 60_500);
        h.controller.tick(61_000).await;
        assert_eq!(
            h.sm.registry().get("AAPL").unwrap().tier,
            SubscriptionTier::Probe
        );
        let entries = journal_entries(&h);
        assert_eq!(entries[0]["ExitReason"], "SignalEmitted");
    }

    #[tokio::test]
    async fn signal_exit_after_minimum_is_immediate() {
        let h = harness(RuntimeConfig::default());
        h.sm.apply_universe(&[contract("AAPL")], 0).await;
        h.sm.upgrade_to_eval("AAPL", 0).await.unwrap();

        h.controller.note_signal_emitted("AAPL", 61_000).await;
        assert_eq!(
            h.sm.registry().get("AAPL").unwrap().tier,
            SubscriptionTier::Probe
        );
        let entries = journal_entries(&h);
        assert_eq!(entries[0]["ExitReason"], "SignalEmitted");
    }

    #[tokio::test]
    async fn candidate_selection_ranks_by_tape_activity() {
        let h = harness(RuntimeConfig::default());
        h.sm.apply_universe(&[contract("QUIET"), contract("BUSY")], 0)
            .await;

        let now = 20_000;
        for i in 0..20 {
            h.books
                .record_trade("BUSY", now - 9_000 + i * 400, now - 9_000 + i * 400, 10.0, 5.0);
        }
        h.books.record_trade("QUIET", now - 9_000, now - 9_000, 10.0, 5.0);

        assert_eq!(
            h.controller.select_upgrade_candidate(now),
            Some("BUSY".to_string())
        );
    }

    #[tokio::test]
    async fn candidate_selection_tie_breaks_by_probe_entry_then_symbol() {
        let h = harness(RuntimeConfig::default());
        // No tape at all: every score is zero.
        h.sm.apply_universe(&[contract("BBB"), contract("AAA")], 0)
            .await;
        // Same probe_since for both (applied in the same cycle): symbol
        // decides.
        assert_eq!(
            h.controller.select_upgrade_candidate(1_000),
            Some("AAA".to_string())
        );
    }

    #[tokio::test]
    async fn cooldown_suppresses_reupgrade_but_not_probe() {
        let mut cfg = RuntimeConfig::default();
        cfg.depth_slots = 1;
        cfg.evaluation_window.max_ms = 60_000;
        let h = harness(cfg);

        h.sm.apply_universe(&[contract("AAPL")], 0).await;
        h.sm.upgrade_to_eval("AAPL", 0).await.unwrap();
        keep_book_valid(&h, "AAPL", 0);

        h.controller.tick(60_001).await;
        let record = h.sm.registry().get("AAPL").unwrap();
        assert_eq!(record.tier, SubscriptionTier::Probe);
        assert!(record.l1_req_id.is_some());

        // Still in cooldown: the empty slot stays empty.
        h.controller.tick(70_000).await;
        assert_eq!(h.sm.registry().eval_count(), 0);
    }

    #[tokio::test]
    async fn slot_exhaustion_leaves_candidate_in_probe() {
        let mut cfg = RuntimeConfig::default();
        cfg.depth_slots = 1;
        let h = harness(cfg);

        h.sm.apply_universe(&[contract("AAPL"), contract("MSFT")], 0)
            .await;
        h.controller.fill_slots(1_000).await;

        assert_eq!(h.sm.registry().eval_count(), 1);
        let probes = h.sm.registry().symbols_in_tier(SubscriptionTier::Probe);
        assert_eq!(probes.len(), 1);
    }

    #[tokio::test]
    async fn abort_all_closes_every_window() {
        let h = harness(RuntimeConfig::default());
        h.sm.apply_universe(&[contract("AAPL"), contract("MSFT")], 0)
            .await;
        h.sm.upgrade_to_eval("AAPL", 0).await.unwrap();
        h.sm.upgrade_to_eval("MSFT", 0).await.unwrap();

        h.controller.abort_all(5_000).await;
        assert_eq!(h.sm.registry().eval_count(), 0);

        let entries = journal_entries(&h);
        assert_eq!(entries.len(), 2);
        for entry in entries {
            assert_eq!(entry["ExitReason"], "Aborted");
        }
    }
}
