// =============================================================================
// Scarcity Controller — Daily quotas, cooldowns, and the rank window
// =============================================================================
//
// Accepted blueprints are deliberately scarce. The controller enforces the
// daily quotas and cooldowns, and optionally stages candidates into
// fixed-duration rank-window buckets so that the best candidate of a bucket
// is accepted first rather than the earliest.
//
// Daily counters are scoped to the UTC day of the bucket's anchor timestamp,
// so a bucket that straddles midnight counts entirely against the day it was
// anchored in.
// =============================================================================

use std::collections::HashMap;

use chrono::{TimeZone, Utc};
use serde::Serialize;

use crate::runtime_config::ScarcityConfig;

/// Verdict for one acceptance candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScarcityVerdict {
    Allow,
    DailyQuota,
    SymbolQuota,
    GlobalCooldown,
    SymbolCooldown,
}

impl ScarcityVerdict {
    pub fn as_rejection(&self) -> &'static str {
        match self {
            Self::Allow => "Allow",
            Self::DailyQuota => "DailyQuotaReached",
            Self::SymbolQuota => "SymbolQuotaReached",
            Self::GlobalCooldown => "GlobalCooldown",
            Self::SymbolCooldown => "SymbolCooldown",
        }
    }
}

/// UTC calendar day of an epoch-ms timestamp, as YYYYMMDD.
fn utc_day_key(ts_ms: i64) -> i64 {
    match Utc.timestamp_millis_opt(ts_ms).single() {
        Some(dt) => {
            let date = dt.date_naive();
            i64::from(chrono::Datelike::year(&date)) * 10_000
                + i64::from(chrono::Datelike::month(&date)) * 100
                + i64::from(chrono::Datelike::day(&date))
        }
        None => 0,
    }
}

// =============================================================================
// ScarcityController
// =============================================================================

/// Enforces daily quotas and inter-acceptance cooldowns.
pub struct ScarcityController {
    cfg: ScarcityConfig,
    day_key: i64,
    accepted_today: usize,
    per_symbol_today: HashMap<String, usize>,
    last_accept_ms: Option<i64>,
    per_symbol_last_ms: HashMap<String, i64>,
}

impl ScarcityController {
    pub fn new(cfg: ScarcityConfig) -> Self {
        Self {
            cfg,
            day_key: 0,
            accepted_today: 0,
            per_symbol_today: HashMap::new(),
            last_accept_ms: None,
            per_symbol_last_ms: HashMap::new(),
        }
    }

    /// Roll the daily counters when the anchor day changes.
    fn roll_day(&mut self, anchor_ms: i64) {
        let key = utc_day_key(anchor_ms);
        if key != self.day_key {
            self.day_key = key;
            self.accepted_today = 0;
            self.per_symbol_today.clear();
        }
    }

    /// Check a candidate against quotas and cooldowns. `anchor_ms` is the
    /// rank-window anchor (or the decision time when staging is disabled).
    pub fn check(&mut self, symbol: &str, anchor_ms: i64, now_ms: i64) -> ScarcityVerdict {
        self.roll_day(anchor_ms);

        if self.accepted_today >= self.cfg.max_blueprints_per_day {
            return ScarcityVerdict::DailyQuota;
        }

        let symbol_count = self.per_symbol_today.get(symbol).copied().unwrap_or(0);
        if symbol_count >= self.cfg.max_per_symbol_per_day {
            return ScarcityVerdict::SymbolQuota;
        }

        let global_cooldown_ms = self.cfg.global_cooldown_minutes as i64 * 60_000;
        if global_cooldown_ms > 0 {
            if let Some(last) = self.last_accept_ms {
                if now_ms - last < global_cooldown_ms {
                    return ScarcityVerdict::GlobalCooldown;
                }
            }
        }

        let symbol_cooldown_ms = self.cfg.symbol_cooldown_minutes as i64 * 60_000;
        if symbol_cooldown_ms > 0 {
            if let Some(last) = self.per_symbol_last_ms.get(symbol) {
                if now_ms - last < symbol_cooldown_ms {
                    return ScarcityVerdict::SymbolCooldown;
                }
            }
        }

        ScarcityVerdict::Allow
    }

    /// Record an acceptance against the quotas.
    pub fn commit(&mut self, symbol: &str, anchor_ms: i64, now_ms: i64) {
        self.roll_day(anchor_ms);
        self.accepted_today += 1;
        *self.per_symbol_today.entry(symbol.to_string()).or_insert(0) += 1;
        self.last_accept_ms = Some(now_ms);
        self.per_symbol_last_ms.insert(symbol.to_string(), now_ms);
    }

    pub fn accepted_today(&self) -> usize {
        self.accepted_today
    }
}

// =============================================================================
// Rank window
// =============================================================================

/// One staged acceptance candidate awaiting its bucket flush.
#[derive(Debug, Clone)]
pub struct StagedCandidate {
    pub symbol: String,
    pub score: f64,
    pub staged_at_ms: i64,
    /// Arrival order within the process; the third tiebreak.
    pub seq: u64,
}

/// A flushed bucket: the anchor timestamp plus candidates in final order.
#[derive(Debug)]
pub struct FlushedBucket {
    pub anchor_ms: i64,
    pub ranked: Vec<StagedCandidate>,
}

/// Stages candidates into fixed-duration buckets. Disabled (pass-through)
/// when the window length is zero.
pub struct RankWindow {
    window_ms: i64,
    current_anchor_ms: Option<i64>,
    staged: Vec<StagedCandidate>,
    next_seq: u64,
}

impl RankWindow {
    pub fn new(window_seconds: u64) -> Self {
        Self {
            window_ms: window_seconds as i64 * 1_000,
            current_anchor_ms: None,
            staged: Vec::new(),
            next_seq: 0,
        }
    }

    pub fn enabled(&self) -> bool {
        self.window_ms > 0
    }

    fn anchor_for(&self, now_ms: i64) -> i64 {
        (now_ms / self.window_ms) * self.window_ms
    }

    /// Stage a candidate. Returns the bucket flushed by rollover, if any.
    pub fn stage(&mut self, symbol: &str, score: f64, now_ms: i64) -> Option<FlushedBucket> {
        debug_assert!(self.enabled());
        let anchor = self.anchor_for(now_ms);
        let flushed = match self.current_anchor_ms {
            Some(current) if current != anchor => self.flush_inner(),
            _ => None,
        };
        self.current_anchor_ms = Some(anchor);
        self.staged.push(StagedCandidate {
            symbol: symbol.to_string(),
            score,
            staged_at_ms: now_ms,
            seq: self.next_seq,
        });
        self.next_seq += 1;
        flushed
    }

    /// Flush when the bucket containing `now_ms` is past the current one.
    /// Called from the coordinator's periodic tick.
    pub fn poll(&mut self, now_ms: i64) -> Option<FlushedBucket> {
        if !self.enabled() {
            return None;
        }
        match self.current_anchor_ms {
            Some(current) if self.anchor_for(now_ms) != current => self.flush_inner(),
            _ => None,
        }
    }

    /// Unconditional flush (shutdown, replay end-of-stream).
    pub fn flush(&mut self) -> Option<FlushedBucket> {
        self.flush_inner()
    }

    fn flush_inner(&mut self) -> Option<FlushedBucket> {
        let anchor_ms = self.current_anchor_ms.take()?;
        if self.staged.is_empty() {
            return None;
        }
        let mut ranked = std::mem::take(&mut self.staged);
        // Score desc, then timestamp asc, then symbol, then arrival order.
        // Symbol before arrival keeps equal-score equal-timestamp buckets
        // deterministic regardless of staging order.
        ranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.staged_at_ms.cmp(&b.staged_at_ms))
                .then(a.symbol.cmp(&b.symbol))
                .then(a.seq.cmp(&b.seq))
        });
        Some(FlushedBucket { anchor_ms, ranked })
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> ScarcityConfig {
        ScarcityConfig::default()
    }

    #[test]
    fn daily_quota_enforced() {
        let mut cfg = cfg();
        cfg.max_blueprints_per_day = 2;
        cfg.max_per_symbol_per_day = 5;
        let mut c = ScarcityController::new(cfg);

        let t = 1_700_000_000_000;
        assert_eq!(c.check("A", t, t), ScarcityVerdict::Allow);
        c.commit("A", t, t);
        assert_eq!(c.check("B", t, t), ScarcityVerdict::Allow);
        c.commit("B", t, t);
        assert_eq!(c.check("C", t, t), ScarcityVerdict::DailyQuota);
    }

    #[test]
    fn per_symbol_quota_enforced() {
        let mut c = ScarcityController::new(cfg());
        let t = 1_700_000_000_000;
        c.commit("AAPL", t, t);
        assert_eq!(c.check("AAPL", t, t), ScarcityVerdict::SymbolQuota);
        assert_eq!(c.check("MSFT", t, t), ScarcityVerdict::Allow);
    }

    #[test]
    fn counters_reset_on_new_utc_day() {
        let mut cfg = cfg();
        cfg.max_blueprints_per_day = 1;
        let mut c = ScarcityController::new(cfg);

        let t = 1_700_000_000_000;
        c.commit("AAPL", t, t);
        assert_eq!(c.check("MSFT", t, t), ScarcityVerdict::DailyQuota);

        let next_day = t + 86_400_000;
        assert_eq!(c.check("MSFT", next_day, next_day), ScarcityVerdict::Allow);
    }

    #[test]
    fn day_scoped_to_anchor_not_decision_time() {
        // An acceptance decided just after midnight but anchored before it
        // counts against the anchor's day.
        let mut cfg = cfg();
        cfg.max_blueprints_per_day = 1;
        let mut c = ScarcityController::new(cfg);

        // 2023-11-14 23:59:58 UTC anchors this bucket.
        let anchor = 1_700_006_398_000;
        let decided = anchor + 4_000; // past midnight
        c.commit("AAPL", anchor, decided);

        // Same anchor day: quota consumed.
        assert_eq!(c.check("MSFT", anchor, decided), ScarcityVerdict::DailyQuota);
        // Next bucket anchors in the new day: quota fresh.
        let next_anchor = anchor + 10_000;
        assert_eq!(
            c.check("MSFT", next_anchor, next_anchor),
            ScarcityVerdict::Allow
        );
    }

    #[test]
    fn global_cooldown_between_accepts() {
        let mut cfg = cfg();
        cfg.global_cooldown_minutes = 10;
        cfg.max_blueprints_per_day = 10;
        cfg.max_per_symbol_per_day = 10;
        let mut c = ScarcityController::new(cfg);

        let t = 1_700_000_000_000;
        c.commit("AAPL", t, t);
        assert_eq!(
            c.check("MSFT", t + 60_000, t + 60_000),
            ScarcityVerdict::GlobalCooldown
        );
        assert_eq!(
            c.check("MSFT", t + 600_000, t + 600_000),
            ScarcityVerdict::Allow
        );
    }

    #[test]
    fn rank_window_orders_score_then_lex() {
        // Scenario: three candidates in one 2s bucket; MSFT and TSLA tie
        // at 8.0 and the tie breaks lexicographically.
        let mut w = RankWindow::new(2);
        let base = 1_700_000_000_000;
        assert!(w.stage("AAPL", 7.5, base + 100).is_none());
        assert!(w.stage("TSLA", 8.0, base + 100).is_none());
        assert!(w.stage("MSFT", 8.0, base + 100).is_none());

        let bucket = w.poll(base + 2_000).unwrap();
        let symbols: Vec<&str> = bucket.ranked.iter().map(|c| c.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["MSFT", "TSLA", "AAPL"]);
        assert_eq!(bucket.anchor_ms, (base + 100) / 2_000 * 2_000);
    }

    #[test]
    fn rank_window_equal_score_and_ts_breaks_by_symbol() {
        let mut w = RankWindow::new(2);
        let base = 1_700_000_000_000;
        // Identical score and timestamp: lexicographic, not arrival order.
        w.stage("ZZZ", 5.0, base + 50);
        w.stage("AAA", 5.0, base + 50);
        let bucket = w.flush().unwrap();
        let symbols: Vec<&str> = bucket.ranked.iter().map(|c| c.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["AAA", "ZZZ"]);
    }

    #[test]
    fn rank_window_flushes_on_rollover_during_stage() {
        let mut w = RankWindow::new(2);
        let base = 1_700_000_000_000;
        w.stage("AAPL", 5.0, base + 100);
        let flushed = w.stage("MSFT", 6.0, base + 2_100).unwrap();
        assert_eq!(flushed.ranked.len(), 1);
        assert_eq!(flushed.ranked[0].symbol, "AAPL");
    }

    #[test]
    fn empty_bucket_does_not_flush() {
        let mut w = RankWindow::new(2);
        assert!(w.poll(1_700_000_002_000).is_none());
        assert!(w.flush().is_none());
    }
}
