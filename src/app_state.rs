// =============================================================================
// Central Application State — Meridian Flow Sentinel
// =============================================================================
//
// Ties the engine's subsystems together for the admin API and the heartbeat.
// Subsystems own their interior mutability behind Arcs; AppState composes
// them and builds read-only snapshots. Nothing here sits on a hot path.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::journal::{HeartbeatSource, Journal};
use crate::market_data::BookDirectory;
use crate::metrics::{MetricsEngine, MetricsSnapshot};
use crate::runtime_config::RuntimeConfig;
use crate::signals::SignalCoordinator;
use crate::subscription::{SubscriptionManager, SubscriptionRecord};
use crate::types::{now_ms, SubscriptionTier};

/// Maximum number of recent errors retained for the error log endpoint.
const MAX_RECENT_ERRORS: usize = 50;

/// A recorded error event for the admin error log.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    pub code: Option<String>,
    pub at: String,
}

pub struct AppState {
    pub cfg: RuntimeConfig,
    pub sm: Arc<SubscriptionManager>,
    pub books: Arc<BookDirectory>,
    pub metrics: Arc<MetricsEngine>,
    pub coordinator: Arc<SignalCoordinator>,
    pub journal: Arc<Journal>,
    pub recent_errors: RwLock<Vec<ErrorRecord>>,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(
        cfg: RuntimeConfig,
        sm: Arc<SubscriptionManager>,
        books: Arc<BookDirectory>,
        metrics: Arc<MetricsEngine>,
        coordinator: Arc<SignalCoordinator>,
        journal: Arc<Journal>,
    ) -> Self {
        Self {
            cfg,
            sm,
            books,
            metrics,
            coordinator,
            journal,
            recent_errors: RwLock::new(Vec::new()),
            start_time: std::time::Instant::now(),
        }
    }

    /// Record an error for the admin log, oldest evicted past the cap.
    pub fn push_error(&self, message: String, code: Option<String>) {
        let mut errors = self.recent_errors.write();
        errors.push(ErrorRecord {
            message,
            code,
            at: Utc::now().to_rfc3339(),
        });
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
    }

    /// Build the full admin snapshot.
    pub fn build_snapshot(&self) -> StateSnapshot {
        let now = now_ms();
        let records = self.sm.registry().all_records();

        let mut probes = Vec::new();
        let mut evals = Vec::new();
        for record in &records {
            match record.tier {
                SubscriptionTier::Probe => probes.push(record.symbol.clone()),
                SubscriptionTier::Eval => evals.push(EvalSnapshot {
                    symbol: record.symbol.clone(),
                    started_ms: record.eval_started_ms,
                    elapsed_ms: record.eval_started_ms.map(|s| now - s),
                    active: self.sm.is_active(&record.symbol),
                }),
            }
        }
        probes.sort();
        evals.sort_by(|a, b| a.symbol.cmp(&b.symbol));

        let mut market = HashMap::new();
        for record in &records {
            if let Some(snap) = self.books.snapshot(&record.symbol, now) {
                market.insert(
                    record.symbol.clone(),
                    SymbolMarket {
                        best_bid: snap.best_bid.map(|l| l.price),
                        best_ask: snap.best_ask.map(|l| l.price),
                        spread: snap.spread,
                        valid: snap.valid,
                        last_tape_age_ms: snap.tape.last_recv_ms.map(|l| now - l),
                        metrics: self.metrics.latest(&record.symbol),
                    },
                );
            }
        }

        StateSnapshot {
            session_id: self.journal.session_id().to_string(),
            server_time: now,
            uptime_seconds: self.start_time.elapsed().as_secs(),
            journal_impaired: self.journal.is_impaired(),
            accepted_today: self.coordinator.accepted_today(),
            universe: UniverseSnapshot {
                tracked: records.len(),
                max_lines: self.cfg.market_data.max_lines,
                depth_slots: self.cfg.depth_slots,
                probes,
                evals,
            },
            market,
            recent_errors: self.recent_errors.read().clone(),
        }
    }

    /// Raw subscription records for the universe endpoint.
    pub fn subscription_records(&self) -> Vec<SubscriptionRecord> {
        let mut records = self.sm.registry().all_records();
        records.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        records
    }
}

impl HeartbeatSource for AppState {
    fn probe_count(&self) -> usize {
        self.sm
            .registry()
            .symbols_in_tier(SubscriptionTier::Probe)
            .len()
    }

    fn eval_count(&self) -> usize {
        self.sm.registry().eval_count()
    }

    fn accepted_today(&self) -> usize {
        self.coordinator.accepted_today()
    }
}

// =============================================================================
// Serialisable snapshot types
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub session_id: String,
    pub server_time: i64,
    pub uptime_seconds: u64,
    pub journal_impaired: bool,
    pub accepted_today: usize,
    pub universe: UniverseSnapshot,
    pub market: HashMap<String, SymbolMarket>,
    pub recent_errors: Vec<ErrorRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UniverseSnapshot {
    pub tracked: usize,
    pub max_lines: usize,
    pub depth_slots: usize,
    pub probes: Vec<String>,
    pub evals: Vec<EvalSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvalSnapshot {
    pub symbol: String,
    pub started_ms: Option<i64>,
    pub elapsed_ms: Option<i64>,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SymbolMarket {
    pub best_bid: Option<f64>,
    pub best_ask: Option<f64>,
    pub spread: Option<f64>,
    pub valid: bool,
    pub last_tape_age_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsSnapshot>,
}
