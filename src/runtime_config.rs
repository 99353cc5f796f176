// =============================================================================
// Runtime Configuration — Engine settings with atomic save
// =============================================================================
//
// Central configuration hub for the Meridian engine. Every tunable parameter
// lives here, grouped by subsystem.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields never
// breaks loading an older config file.
//
// Configuration errors are the only fatal errors in the process: `validate()`
// runs once at startup and a violation exits with code 1.
// =============================================================================

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_depth_slots() -> usize {
    3
}

fn default_max_lines() -> usize {
    80
}

fn default_depth_rows() -> usize {
    5
}

fn default_tbt_max_symbols() -> usize {
    6
}

fn default_receipt_timeout_ms() -> i64 {
    15_000
}

fn default_refresh_minutes() -> u64 {
    5
}

fn default_static_symbols() -> Vec<String> {
    vec!["AAPL".to_string(), "MSFT".to_string(), "NVDA".to_string()]
}

fn default_max_spoof_score() -> f64 {
    3.0
}

fn default_min_tape_acceleration() -> f64 {
    1.2
}

fn default_min_wall_persistence_ms() -> i64 {
    3_000
}

fn default_qi_buy_threshold() -> f64 {
    2.0
}

fn default_min_absorption() -> f64 {
    1.0
}

fn default_imbalance_levels() -> usize {
    4
}

fn default_min_confidence() -> f64 {
    60.0
}

fn default_symbol_signal_cooldown_minutes() -> u64 {
    10
}

fn default_max_signals_per_hour() -> usize {
    3
}

fn default_stop_spread_ratio() -> f64 {
    2.0
}

fn default_target_spread_ratio() -> f64 {
    4.0
}

fn default_risk_budget() -> f64 {
    50.0
}

fn default_max_blueprints_per_day() -> usize {
    6
}

fn default_max_per_symbol_per_day() -> usize {
    1
}

fn default_eval_min_ms() -> i64 {
    60_000
}

fn default_eval_max_ms() -> i64 {
    180_000
}

fn default_eval_cooldown_ms() -> i64 {
    3_600_000
}

fn default_tape_stale_window_ms() -> i64 {
    5_000
}

fn default_warmup_min_trades() -> usize {
    5
}

fn default_warmup_window_ms() -> i64 {
    10_000
}

fn default_tape_window_ms() -> i64 {
    60_000
}

fn default_book_stale_window_ms() -> i64 {
    3_000
}

fn default_invalid_grace_ms() -> i64 {
    5_000
}

fn default_throttle_ms() -> i64 {
    250
}

fn default_journal_path() -> String {
    "journal/decisions.jsonl".to_string()
}

fn default_heartbeat_seconds() -> u64 {
    60
}

fn default_bridge_addr() -> String {
    "ws://127.0.0.1:4001/feed".to_string()
}

fn default_eligibility_ttl_minutes() -> u64 {
    240
}

fn default_record_dir() -> String {
    "recordings".to_string()
}

fn default_replay_seed() -> u64 {
    7
}

// =============================================================================
// Sections
// =============================================================================

/// Broker data-line budgets and receipt timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketDataConfig {
    /// Total broker data-line budget (Probe + Eval).
    #[serde(default = "default_max_lines")]
    pub max_lines: usize,

    /// Depth rows requested per evaluation slot (1..=10).
    #[serde(default = "default_depth_rows")]
    pub depth_rows: usize,

    /// Broker-side cap on concurrent tick-by-tick subscriptions.
    #[serde(default = "default_tbt_max_symbols")]
    pub tick_by_tick_max_symbols: usize,

    /// Zero-data timeout before an L1 subscription falls back to the smart
    /// router. Minimum 5000.
    #[serde(default = "default_receipt_timeout_ms")]
    pub l1_receipt_timeout_ms: i64,

    /// Zero-data timeout before a tick-by-tick subscription falls back to
    /// the smart router. Minimum 5000.
    #[serde(default = "default_receipt_timeout_ms")]
    pub tick_by_tick_receipt_timeout_ms: i64,
}

impl Default for MarketDataConfig {
    fn default() -> Self {
        Self {
            max_lines: default_max_lines(),
            depth_rows: default_depth_rows(),
            tick_by_tick_max_symbols: default_tbt_max_symbols(),
            l1_receipt_timeout_ms: default_receipt_timeout_ms(),
            tick_by_tick_receipt_timeout_ms: default_receipt_timeout_ms(),
        }
    }
}

/// Where candidate symbols come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UniverseSource {
    Static,
    Scanner,
}

impl Default for UniverseSource {
    fn default() -> Self {
        Self::Static
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniverseConfig {
    #[serde(default)]
    pub source: UniverseSource,

    /// Refresh cadence for the candidate universe.
    #[serde(default = "default_refresh_minutes")]
    pub refresh_minutes: u64,

    /// Candidate list used when `source` is Static, in rank order.
    #[serde(default = "default_static_symbols")]
    pub static_symbols: Vec<String>,

    /// Scanner endpoint returning an ordered candidate list (Scanner source).
    #[serde(default)]
    pub scanner_url: Option<String>,
}

impl Default for UniverseConfig {
    fn default() -> Self {
        Self {
            source: UniverseSource::Static,
            refresh_minutes: default_refresh_minutes(),
            static_symbols: default_static_symbols(),
            scanner_url: None,
        }
    }
}

/// Hard gates applied before any acceptance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardGatesConfig {
    #[serde(default = "default_max_spoof_score")]
    pub max_spoof_score: f64,

    #[serde(default = "default_min_tape_acceleration")]
    pub min_tape_acceleration: f64,

    #[serde(default = "default_min_wall_persistence_ms")]
    pub min_wall_persistence_ms: i64,
}

impl Default for HardGatesConfig {
    fn default() -> Self {
        Self {
            max_spoof_score: default_max_spoof_score(),
            min_tape_acceleration: default_min_tape_acceleration(),
            min_wall_persistence_ms: default_min_wall_persistence_ms(),
        }
    }
}

/// Signal detection thresholds and blueprint geometry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalsConfig {
    #[serde(default)]
    pub hard_gates: HardGatesConfig,

    /// Queue-imbalance threshold for the buy side; sell is symmetric at the
    /// reciprocal.
    #[serde(default = "default_qi_buy_threshold")]
    pub qi_buy_threshold: f64,

    /// Minimum absorption ratio on the pressured side.
    #[serde(default = "default_min_absorption")]
    pub min_absorption: f64,

    /// Book levels summed per side for queue imbalance.
    #[serde(default = "default_imbalance_levels")]
    pub imbalance_levels: usize,

    /// Confidence floor (0-100) below which candidates are rejected.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,

    /// Validator-local per-symbol cooldown after an acceptance.
    #[serde(default = "default_symbol_signal_cooldown_minutes")]
    pub symbol_cooldown_minutes: u64,

    /// Validator-local global sliding-window cap.
    #[serde(default = "default_max_signals_per_hour")]
    pub max_signals_per_hour: usize,

    /// Stop distance as a multiple of the spread.
    #[serde(default = "default_stop_spread_ratio")]
    pub stop_spread_ratio: f64,

    /// Target distance as a multiple of the spread.
    #[serde(default = "default_target_spread_ratio")]
    pub target_spread_ratio: f64,

    /// Dollar risk per blueprint; share count = budget / stop distance.
    #[serde(default = "default_risk_budget")]
    pub risk_budget: f64,
}

impl Default for SignalsConfig {
    fn default() -> Self {
        Self {
            hard_gates: HardGatesConfig::default(),
            qi_buy_threshold: default_qi_buy_threshold(),
            min_absorption: default_min_absorption(),
            imbalance_levels: default_imbalance_levels(),
            min_confidence: default_min_confidence(),
            symbol_cooldown_minutes: default_symbol_signal_cooldown_minutes(),
            max_signals_per_hour: default_max_signals_per_hour(),
            stop_spread_ratio: default_stop_spread_ratio(),
            target_spread_ratio: default_target_spread_ratio(),
            risk_budget: default_risk_budget(),
        }
    }
}

/// Daily quotas and cooldowns bounding accepted signals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScarcityConfig {
    #[serde(default = "default_max_blueprints_per_day")]
    pub max_blueprints_per_day: usize,

    #[serde(default = "default_max_per_symbol_per_day")]
    pub max_per_symbol_per_day: usize,

    /// Minimum minutes between any two acceptances. 0 disables.
    #[serde(default)]
    pub global_cooldown_minutes: u64,

    /// Coordinator-level per-symbol cooldown, separate from the validator's.
    /// 0 disables.
    #[serde(default)]
    pub symbol_cooldown_minutes: u64,

    /// Rank-window bucket length in seconds. 0 disables staging.
    #[serde(default)]
    pub rank_window_seconds: u64,
}

impl Default for ScarcityConfig {
    fn default() -> Self {
        Self {
            max_blueprints_per_day: default_max_blueprints_per_day(),
            max_per_symbol_per_day: default_max_per_symbol_per_day(),
            global_cooldown_minutes: 0,
            symbol_cooldown_minutes: 0,
            rank_window_seconds: 0,
        }
    }
}

/// Evaluation window bounds and the post-exit cooldown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationWindowConfig {
    /// Earliest a SignalEmitted exit may close the window.
    #[serde(default = "default_eval_min_ms")]
    pub min_ms: i64,

    /// Hard window bound; overrun exits TimeoutExpired.
    #[serde(default = "default_eval_max_ms")]
    pub max_ms: i64,

    /// Cooldown stamped on evaluation exit; suppresses re-upgrade.
    #[serde(default = "default_eval_cooldown_ms")]
    pub cooldown_ms: i64,
}

impl Default for EvaluationWindowConfig {
    fn default() -> Self {
        Self {
            min_ms: default_eval_min_ms(),
            max_ms: default_eval_max_ms(),
            cooldown_ms: default_eval_cooldown_ms(),
        }
    }
}

/// Tape freshness and warmup gates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TapeConfig {
    /// Max age of the last print (local receipt time) before the tape is
    /// considered stale.
    #[serde(default = "default_tape_stale_window_ms")]
    pub stale_window_ms: i64,

    /// Minimum prints within the warmup window.
    #[serde(default = "default_warmup_min_trades")]
    pub warmup_min_trades: usize,

    #[serde(default = "default_warmup_window_ms")]
    pub warmup_window_ms: i64,

    /// Retention window of the tape ring.
    #[serde(default = "default_tape_window_ms")]
    pub window_ms: i64,
}

impl Default for TapeConfig {
    fn default() -> Self {
        Self {
            stale_window_ms: default_tape_stale_window_ms(),
            warmup_min_trades: default_warmup_min_trades(),
            warmup_window_ms: default_warmup_window_ms(),
            window_ms: default_tape_window_ms(),
        }
    }
}

/// Book freshness and the grace period for persistent invalidity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookConfig {
    /// Max age of the last depth receipt before the book is stale.
    #[serde(default = "default_book_stale_window_ms")]
    pub stale_window_ms: i64,

    /// Continuous invalidity beyond this exits the evaluation DataInvalid.
    #[serde(default = "default_invalid_grace_ms")]
    pub invalid_grace_ms: i64,
}

impl Default for BookConfig {
    fn default() -> Self {
        Self {
            stale_window_ms: default_book_stale_window_ms(),
            invalid_grace_ms: default_invalid_grace_ms(),
        }
    }
}

/// Decision journal location and verbosity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalConfig {
    #[serde(default = "default_journal_path")]
    pub file_path: String,

    /// Attach a structured gate trace to every rejection.
    #[serde(default = "default_true")]
    pub emit_gate_trace: bool,

    /// Heartbeat cadence; absence of data must itself be observable.
    #[serde(default = "default_heartbeat_seconds")]
    pub heartbeat_seconds: u64,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            file_path: default_journal_path(),
            emit_gate_trace: true,
            heartbeat_seconds: default_heartbeat_seconds(),
        }
    }
}

/// How the tape stream's event timestamps are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TapeTimestampUnit {
    /// `< 10^10` means seconds, otherwise milliseconds.
    Auto,
    Seconds,
    Millis,
}

impl Default for TapeTimestampUnit {
    fn default() -> Self {
        Self::Auto
    }
}

/// Gateway-bridge connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// WebSocket address of the external broker gateway bridge.
    #[serde(default = "default_bridge_addr")]
    pub bridge_addr: String,

    #[serde(default)]
    pub tape_timestamp_unit: TapeTimestampUnit,

    /// TTL for depth/tbt ineligibility stamps (broker codes 10092/10190).
    #[serde(default = "default_eligibility_ttl_minutes")]
    pub eligibility_ttl_minutes: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            bridge_addr: default_bridge_addr(),
            tape_timestamp_unit: TapeTimestampUnit::Auto,
            eligibility_ttl_minutes: default_eligibility_ttl_minutes(),
        }
    }
}

/// Record-mode inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordConfig {
    #[serde(default)]
    pub symbol: Option<String>,

    #[serde(default = "default_record_dir")]
    pub output_dir: String,
}

impl Default for RecordConfig {
    fn default() -> Self {
        Self {
            symbol: None,
            output_dir: default_record_dir(),
        }
    }
}

/// Replay-mode inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayConfig {
    #[serde(default)]
    pub depth_file: Option<String>,

    #[serde(default)]
    pub tape_file: Option<String>,

    /// Seed for the deterministic decision-id generator.
    #[serde(default = "default_replay_seed")]
    pub seed: u64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            depth_file: None,
            tape_file: None,
            seed: default_replay_seed(),
        }
    }
}

/// Notification sink settings. Delivery is best-effort.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifyConfig {
    #[serde(default)]
    pub discord_webhook_url: Option<String>,
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the Meridian engine.
///
/// Every field has a serde default so that older JSON files missing new
/// fields will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Simultaneous evaluation slots (depth + tick-by-tick), system-wide.
    #[serde(default = "default_depth_slots")]
    pub depth_slots: usize,

    /// Per-symbol gap between coordinator evaluations.
    #[serde(default = "default_throttle_ms")]
    pub throttle_ms: i64,

    #[serde(default)]
    pub market_data: MarketDataConfig,

    #[serde(default)]
    pub universe: UniverseConfig,

    #[serde(default)]
    pub signals: SignalsConfig,

    #[serde(default)]
    pub scarcity: ScarcityConfig,

    #[serde(default)]
    pub evaluation_window: EvaluationWindowConfig,

    #[serde(default)]
    pub tape: TapeConfig,

    #[serde(default)]
    pub book: BookConfig,

    #[serde(default)]
    pub journal: JournalConfig,

    #[serde(default)]
    pub feed: FeedConfig,

    #[serde(default)]
    pub record: RecordConfig,

    #[serde(default)]
    pub replay: ReplayConfig,

    #[serde(default)]
    pub notify: NotifyConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            depth_slots: default_depth_slots(),
            throttle_ms: default_throttle_ms(),
            market_data: MarketDataConfig::default(),
            universe: UniverseConfig::default(),
            signals: SignalsConfig::default(),
            scarcity: ScarcityConfig::default(),
            evaluation_window: EvaluationWindowConfig::default(),
            tape: TapeConfig::default(),
            book: BookConfig::default(),
            journal: JournalConfig::default(),
            feed: FeedConfig::default(),
            record: RecordConfig::default(),
            replay: ReplayConfig::default(),
            notify: NotifyConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            depth_slots = config.depth_slots,
            max_lines = config.market_data.max_lines,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Startup validation. Any violation here is fatal (exit code 1).
    pub fn validate(&self) -> Result<()> {
        if self.depth_slots == 0 {
            bail!("depth_slots must be >= 1");
        }
        if self.market_data.max_lines == 0 {
            bail!("market_data.max_lines must be >= 1");
        }
        if self.depth_slots > self.market_data.max_lines {
            bail!(
                "depth_slots ({}) exceeds market_data.max_lines ({})",
                self.depth_slots,
                self.market_data.max_lines
            );
        }
        if !(1..=10).contains(&self.market_data.depth_rows) {
            bail!(
                "market_data.depth_rows must be within 1..=10, got {}",
                self.market_data.depth_rows
            );
        }
        if self.market_data.l1_receipt_timeout_ms < 5_000 {
            bail!(
                "market_data.l1_receipt_timeout_ms must be >= 5000, got {}",
                self.market_data.l1_receipt_timeout_ms
            );
        }
        if self.market_data.tick_by_tick_receipt_timeout_ms < 5_000 {
            bail!(
                "market_data.tick_by_tick_receipt_timeout_ms must be >= 5000, got {}",
                self.market_data.tick_by_tick_receipt_timeout_ms
            );
        }
        if self.evaluation_window.min_ms <= 0 || self.evaluation_window.max_ms <= 0 {
            bail!("evaluation_window bounds must be positive");
        }
        if self.evaluation_window.min_ms > self.evaluation_window.max_ms {
            bail!(
                "evaluation_window.min_ms ({}) exceeds max_ms ({})",
                self.evaluation_window.min_ms,
                self.evaluation_window.max_ms
            );
        }
        if self.evaluation_window.cooldown_ms < 0 {
            bail!("evaluation_window.cooldown_ms must be >= 0");
        }
        if self.signals.qi_buy_threshold <= 1.0 {
            bail!(
                "signals.qi_buy_threshold must be > 1.0, got {}",
                self.signals.qi_buy_threshold
            );
        }
        if self.signals.imbalance_levels == 0
            || self.signals.imbalance_levels > self.market_data.depth_rows
        {
            bail!(
                "signals.imbalance_levels must be within 1..=depth_rows ({}), got {}",
                self.market_data.depth_rows,
                self.signals.imbalance_levels
            );
        }
        if self.signals.stop_spread_ratio <= 0.0 || self.signals.target_spread_ratio <= 0.0 {
            bail!("blueprint spread ratios must be positive");
        }
        if self.signals.risk_budget <= 0.0 {
            bail!("signals.risk_budget must be positive");
        }
        if self.scarcity.max_blueprints_per_day == 0 {
            bail!("scarcity.max_blueprints_per_day must be >= 1");
        }
        if self.tape.stale_window_ms <= 0 || self.tape.window_ms <= 0 {
            bail!("tape windows must be positive");
        }
        if self.universe.source == UniverseSource::Scanner && self.universe.scanner_url.is_none() {
            bail!("universe.source is Scanner but universe.scanner_url is unset");
        }
        Ok(())
    }
}
