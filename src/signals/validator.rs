// =============================================================================
// Signal Validator — Candidate detection, hard gates, confidence
// =============================================================================
//
// A liquidity-failure candidate needs every leg at once: a one-sided queue,
// a persistent wall, absorption on the pressured side, and an accelerating
// tape. The validator detects the pattern, applies the hard gates, and
// scores confidence; scarcity beyond its own cooldowns belongs to the
// coordinator.
//
// Acceptances fire on the rising edge only: a symbol must leave and re-enter
// the signal state between evaluations before it can emit again.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use serde::Serialize;

use crate::metrics::MetricsSnapshot;
use crate::runtime_config::SignalsConfig;
use crate::types::Direction;

/// Sliding window for the validator-local global acceptance cap.
const GLOBAL_WINDOW_MS: i64 = 3_600_000;

/// A detected liquidity-failure candidate with its evidence.
#[derive(Debug, Clone, Serialize)]
pub struct SignalCandidate {
    pub symbol: String,
    pub direction: Direction,
    pub confidence: f64,
    pub queue_imbalance: f64,
    pub wall_age_ms: i64,
    pub absorption: f64,
    pub tape_acceleration: f64,
    pub spoof_score: f64,
}

/// Validator verdict for one metrics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    pub has_candidate: bool,
    pub accepted: bool,
    /// Set when a candidate was found and rejected. A no-candidate snapshot
    /// carries no reason and is not journaled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<SignalCandidate>,
}

impl Decision {
    fn none() -> Self {
        Self {
            has_candidate: false,
            accepted: false,
            rejection_reason: None,
            direction: None,
            confidence: 0.0,
            signal: None,
        }
    }

    fn rejected(reason: impl Into<String>, direction: Option<Direction>, confidence: f64) -> Self {
        Self {
            has_candidate: true,
            accepted: false,
            rejection_reason: Some(reason.into()),
            direction,
            confidence,
            signal: None,
        }
    }
}

/// Stateful validator: rising-edge tracking plus its own anti-spam cooldowns.
pub struct SignalValidator {
    cfg: SignalsConfig,
    /// Whether the symbol was in signal state at the previous evaluation.
    in_signal_state: HashMap<String, bool>,
    /// Last acceptance per symbol (validator-local cooldown).
    last_accept_ms: HashMap<String, i64>,
    /// Acceptance timestamps within the last hour (global cap).
    recent_accepts: VecDeque<i64>,
}

impl SignalValidator {
    pub fn new(cfg: SignalsConfig) -> Self {
        Self {
            cfg,
            in_signal_state: HashMap::new(),
            last_accept_ms: HashMap::new(),
            recent_accepts: VecDeque::new(),
        }
    }

    /// Evaluate one metrics snapshot.
    pub fn evaluate(&mut self, metrics: &MetricsSnapshot, now_ms: i64) -> Decision {
        if !metrics.book_valid {
            let reason = metrics
                .invalid_reason
                .map(|r| r.as_rejection())
                .unwrap_or("BookInvalid_Empty");
            return Decision::rejected(reason, None, 0.0);
        }

        let Some(qi) = metrics.queue_imbalance else {
            // Undefined imbalance is no-signal, not an error.
            self.set_signal_state(&metrics.symbol, false);
            return Decision::none();
        };

        let Some(candidate) = self.detect(metrics, qi) else {
            self.set_signal_state(&metrics.symbol, false);
            return Decision::none();
        };

        // Rising edge: still-a-signal snapshots do not re-emit.
        let was_in_signal = self
            .in_signal_state
            .insert(metrics.symbol.clone(), true)
            .unwrap_or(false);
        if was_in_signal {
            return Decision {
                has_candidate: true,
                accepted: false,
                rejection_reason: None,
                direction: Some(candidate.direction),
                confidence: candidate.confidence,
                signal: None,
            };
        }

        // Hard gates, in a fixed order so gate traces are comparable.
        if candidate.spoof_score >= self.cfg.hard_gates.max_spoof_score {
            return Decision::rejected(
                "HardGate_SpoofScore",
                Some(candidate.direction),
                candidate.confidence,
            );
        }
        if candidate.tape_acceleration < self.cfg.hard_gates.min_tape_acceleration {
            return Decision::rejected(
                "HardGate_TapeAcceleration",
                Some(candidate.direction),
                candidate.confidence,
            );
        }
        if candidate.wall_age_ms < self.cfg.hard_gates.min_wall_persistence_ms {
            return Decision::rejected(
                "HardGate_WallPersistence",
                Some(candidate.direction),
                candidate.confidence,
            );
        }

        if candidate.confidence < self.cfg.min_confidence {
            return Decision::rejected(
                "Score_BelowThreshold",
                Some(candidate.direction),
                candidate.confidence,
            );
        }

        // Validator-local anti-spam.
        let cooldown_ms = self.cfg.symbol_cooldown_minutes as i64 * 60_000;
        if let Some(last) = self.last_accept_ms.get(&metrics.symbol) {
            if cooldown_ms > 0 && now_ms - last < cooldown_ms {
                return Decision::rejected(
                    "CooldownActive",
                    Some(candidate.direction),
                    candidate.confidence,
                );
            }
        }

        while let Some(front) = self.recent_accepts.front() {
            if now_ms - front >= GLOBAL_WINDOW_MS {
                self.recent_accepts.pop_front();
            } else {
                break;
            }
        }
        if self.recent_accepts.len() >= self.cfg.max_signals_per_hour {
            return Decision::rejected(
                "GlobalRateLimit",
                Some(candidate.direction),
                candidate.confidence,
            );
        }

        self.last_accept_ms.insert(metrics.symbol.clone(), now_ms);
        self.recent_accepts.push_back(now_ms);

        Decision {
            has_candidate: true,
            accepted: true,
            rejection_reason: None,
            direction: Some(candidate.direction),
            confidence: candidate.confidence,
            signal: Some(candidate),
        }
    }

    /// Forget rising-edge and cooldown state for a dropped symbol.
    pub fn forget_symbol(&mut self, symbol: &str) {
        self.in_signal_state.remove(symbol);
        self.last_accept_ms.remove(symbol);
    }

    fn set_signal_state(&mut self, symbol: &str, state: bool) {
        self.in_signal_state.insert(symbol.to_string(), state);
    }

    /// Detect a buy- or sell-side liquidity failure.
    fn detect(&self, metrics: &MetricsSnapshot, qi: f64) -> Option<SignalCandidate> {
        let accel = metrics.tape_acceleration?;
        if accel <= 1.0 {
            return None;
        }

        let buy_threshold = self.cfg.qi_buy_threshold;
        let sell_threshold = 1.0 / buy_threshold;

        let (direction, strength, wall_age_ms, absorption) = if qi >= buy_threshold {
            (
                Direction::Buy,
                qi / buy_threshold,
                metrics.bid_wall_age_ms?,
                metrics.bid_absorption?,
            )
        } else if qi <= sell_threshold {
            (
                Direction::Sell,
                sell_threshold / qi,
                metrics.ask_wall_age_ms?,
                metrics.ask_absorption?,
            )
        } else {
            return None;
        };

        if absorption < self.cfg.min_absorption {
            return None;
        }

        let confidence = self.confidence(strength, wall_age_ms, accel, metrics.spoof_score);

        Some(SignalCandidate {
            symbol: metrics.symbol.clone(),
            direction,
            confidence,
            queue_imbalance: qi,
            wall_age_ms,
            absorption,
            tape_acceleration: accel,
            spoof_score: metrics.spoof_score,
        })
    }

    /// Weighted additive confidence, bounded to 0..=100.
    ///
    /// Components: imbalance strength above threshold (40), wall persistence
    /// (20), tape acceleration (25), inverse spoof score (15).
    fn confidence(&self, strength: f64, wall_age_ms: i64, accel: f64, spoof: f64) -> f64 {
        let gates = &self.cfg.hard_gates;

        let qi_pts = 40.0 * (strength - 1.0).clamp(0.0, 1.0);

        let wall_target = (gates.min_wall_persistence_ms * 2).max(1) as f64;
        let wall_pts = 20.0 * (wall_age_ms as f64 / wall_target).clamp(0.0, 1.0);

        let accel_floor = gates.min_tape_acceleration.max(1.0);
        let accel_pts = 25.0 * ((accel - accel_floor) / accel_floor).clamp(0.0, 1.0);

        let spoof_pts = 15.0 * (1.0 - spoof / gates.max_spoof_score).clamp(0.0, 1.0);

        (qi_pts + wall_pts + accel_pts + spoof_pts).clamp(0.0, 100.0)
    }
}
