// =============================================================================
// Signals Module
// =============================================================================
//
// The decision pipeline, from metrics to journaled blueprints:
// - validator: candidate detection, hard gates, rising edge, confidence
// - scarcity: daily quotas, cooldowns, rank-window staging
// - coordinator: per-snapshot gate sequence and journal emission

pub mod coordinator;
pub mod scarcity;
pub mod validator;

pub use coordinator::{CoordinatorEvent, DecisionIds, SignalCoordinator};
pub use scarcity::{RankWindow, ScarcityController, ScarcityVerdict};
pub use validator::{Decision, SignalCandidate, SignalValidator};
