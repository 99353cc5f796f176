// =============================================================================
// Shared types used across the Meridian flow engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Current time as milliseconds since the Unix epoch.
///
/// All hot-path timestamps in the engine are epoch milliseconds taken from
/// the local clock at receipt. Exchange event time is carried separately and
/// only used for analytics.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// =============================================================================
// Wire-level enums
// =============================================================================

/// Book side. Wire encoding: 0 = Ask, 1 = Bid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Bid,
    Ask,
}

impl Side {
    /// Decode the broker wire encoding (0 = Ask, 1 = Bid).
    pub fn from_wire(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Self::Ask),
            1 => Some(Self::Bid),
            _ => None,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Self::Bid => Self::Ask,
            Self::Ask => Self::Bid,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bid => write!(f, "Bid"),
            Self::Ask => write!(f, "Ask"),
        }
    }
}

/// Depth operation. Wire encoding: 0 = Insert, 1 = Update, 2 = Delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DepthOp {
    Insert,
    Update,
    Delete,
}

impl DepthOp {
    /// Decode the broker wire encoding (0 = Insert, 1 = Update, 2 = Delete).
    pub fn from_wire(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Self::Insert),
            1 => Some(Self::Update),
            2 => Some(Self::Delete),
            _ => None,
        }
    }
}

impl std::fmt::Display for DepthOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Insert => write!(f, "Insert"),
            Self::Update => write!(f, "Update"),
            Self::Delete => write!(f, "Delete"),
        }
    }
}

// =============================================================================
// Contract classification
// =============================================================================

/// Security classification produced once by the universe service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StockType {
    Common,
    Etf,
    Etn,
    Other,
    Unknown,
}

impl Default for StockType {
    fn default() -> Self {
        Self::Unknown
    }
}

impl StockType {
    /// Classify the scanner's free-text stock type field.
    pub fn classify(raw: &str) -> Self {
        match raw.trim().to_uppercase().as_str() {
            "COMMON" | "COMMON STOCK" | "CS" => Self::Common,
            "ETF" => Self::Etf,
            "ETN" => Self::Etn,
            "" => Self::Unknown,
            _ => Self::Other,
        }
    }
}

impl std::fmt::Display for StockType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Common => write!(f, "Common"),
            Self::Etf => write!(f, "ETF"),
            Self::Etn => write!(f, "ETN"),
            Self::Other => write!(f, "Other"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Immutable per-symbol contract record. Produced by the universe service,
/// read-only downstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractInfo {
    pub symbol: String,
    #[serde(default)]
    pub contract_id: i64,
    #[serde(default)]
    pub security_type: String,
    #[serde(default)]
    pub primary_exchange: String,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub stock_type: StockType,
    #[serde(default)]
    pub local_symbol: String,
    #[serde(default)]
    pub trading_class: String,
}

impl ContractInfo {
    /// Only Common stock is eligible for the signal pipeline.
    pub fn is_pipeline_eligible(&self) -> bool {
        self.stock_type == StockType::Common
    }
}

// =============================================================================
// Market events
// =============================================================================

/// One incremental depth operation as delivered by the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepthUpdate {
    pub symbol: String,
    pub side: Side,
    pub op: DepthOp,
    pub position: usize,
    pub price: f64,
    pub size: f64,
    /// Local receipt timestamp (authoritative for freshness).
    pub recv_ts_ms: i64,
}

/// One trade print from the tick-by-tick stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradePrint {
    pub symbol: String,
    /// Exchange event timestamp, kept for analytics only.
    pub event_ts_ms: i64,
    /// Local receipt timestamp (authoritative for freshness).
    pub recv_ts_ms: i64,
    pub price: f64,
    pub size: f64,
}

// =============================================================================
// Lifecycle enums
// =============================================================================

/// Subscription tier of a tracked symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionTier {
    /// L1 quote + tape only.
    Probe,
    /// Depth + tick-by-tick added; bounded by the depth-slot budget.
    Eval,
}

impl std::fmt::Display for SubscriptionTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Probe => write!(f, "Probe"),
            Self::Eval => write!(f, "Eval"),
        }
    }
}

/// Why an evaluation window ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    SignalEmitted,
    TimeoutExpired,
    DataInvalid,
    Aborted,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SignalEmitted => write!(f, "SignalEmitted"),
            Self::TimeoutExpired => write!(f, "TimeoutExpired"),
            Self::DataInvalid => write!(f, "DataInvalid"),
            Self::Aborted => write!(f, "Aborted"),
        }
    }
}

/// Trade direction of an accepted signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Buy,
    Sell,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "Buy"),
            Self::Sell => write!(f, "Sell"),
        }
    }
}

// =============================================================================
// Blueprint
// =============================================================================

/// The (entry, stop, target, share-count) plan synthesized at acceptance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeBlueprint {
    pub symbol: String,
    pub direction: Direction,
    pub entry: f64,
    pub stop: f64,
    pub target: f64,
    pub shares: u64,
}

impl TradeBlueprint {
    /// Synthesize a blueprint from the current best quotes.
    ///
    /// Entry is the price we would cross the spread to: best ask for a buy,
    /// best bid for a sell. Stop and target are spread multiples; share count
    /// is the risk budget divided by the stop distance, floored.
    pub fn synthesize(
        symbol: &str,
        direction: Direction,
        best_bid: f64,
        best_ask: f64,
        stop_spread_ratio: f64,
        target_spread_ratio: f64,
        risk_budget: f64,
    ) -> Option<Self> {
        let spread = best_ask - best_bid;
        if spread <= 0.0 || best_bid <= 0.0 {
            return None;
        }

        let (entry, stop, target) = match direction {
            Direction::Buy => {
                let entry = best_ask;
                (
                    entry,
                    entry - stop_spread_ratio * spread,
                    entry + target_spread_ratio * spread,
                )
            }
            Direction::Sell => {
                let entry = best_bid;
                (
                    entry,
                    entry + stop_spread_ratio * spread,
                    entry - target_spread_ratio * spread,
                )
            }
        };

        let stop_distance = (entry - stop).abs();
        if stop_distance <= f64::EPSILON {
            return None;
        }
        let shares = (risk_budget / stop_distance).floor() as u64;

        Some(Self {
            symbol: symbol.to_string(),
            direction,
            entry,
            stop,
            target,
            shares,
        })
    }
}

// =============================================================================
// Run mode
// =============================================================================

/// Process run mode, selected by a single CLI argument or env variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Serve the admin API and run the full signal loop.
    Default,
    /// Subscribe one symbol and write raw depth + tape streams.
    Record,
    /// Read recorded streams and drive the coordinator deterministically.
    Replay,
    /// Read a journal file and emit a rollup.
    Report,
}

impl RunMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "" | "default" => Some(Self::Default),
            "record" => Some(Self::Record),
            "replay" => Some(Self::Replay),
            "report" => Some(Self::Report),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::Record => write!(f, "record"),
            Self::Replay => write!(f, "replay"),
            Self::Report => write!(f, "report"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_wire_encoding() {
        assert_eq!(Side::from_wire(0), Some(Side::Ask));
        assert_eq!(Side::from_wire(1), Some(Side::Bid));
        assert_eq!(Side::from_wire(2), None);
    }

    #[test]
    fn depth_op_wire_encoding() {
        assert_eq!(DepthOp::from_wire(0), Some(DepthOp::Insert));
        assert_eq!(DepthOp::from_wire(1), Some(DepthOp::Update));
        assert_eq!(DepthOp::from_wire(2), Some(DepthOp::Delete));
        assert_eq!(DepthOp::from_wire(3), None);
    }

    #[test]
    fn stock_type_classification() {
        assert_eq!(StockType::classify("COMMON"), StockType::Common);
        assert_eq!(StockType::classify("common stock"), StockType::Common);
        assert_eq!(StockType::classify("ETF"), StockType::Etf);
        assert_eq!(StockType::classify("ETN"), StockType::Etn);
        assert_eq!(StockType::classify("REIT"), StockType::Other);
        assert_eq!(StockType::classify(""), StockType::Unknown);
    }

    #[test]
    fn blueprint_buy_geometry() {
        let bp = TradeBlueprint::synthesize("AAPL", Direction::Buy, 10.00, 10.04, 2.0, 4.0, 50.0)
            .unwrap();
        assert!((bp.entry - 10.04).abs() < 1e-9);
        assert!((bp.stop - 9.96).abs() < 1e-9);
        assert!((bp.target - 10.20).abs() < 1e-9);
        // risk 50.0 / stop distance 0.08 = 625 shares
        assert_eq!(bp.shares, 625);
    }

    #[test]
    fn blueprint_sell_geometry() {
        let bp = TradeBlueprint::synthesize("AAPL", Direction::Sell, 10.00, 10.04, 2.0, 4.0, 50.0)
            .unwrap();
        assert!((bp.entry - 10.00).abs() < 1e-9);
        assert!(bp.stop > bp.entry);
        assert!(bp.target < bp.entry);
    }

    #[test]
    fn blueprint_rejects_crossed_quotes() {
        assert!(
            TradeBlueprint::synthesize("AAPL", Direction::Buy, 10.05, 10.00, 2.0, 4.0, 50.0)
                .is_none()
        );
    }

    #[test]
    fn run_mode_parsing() {
        assert_eq!(RunMode::parse("default"), Some(RunMode::Default));
        assert_eq!(RunMode::parse(""), Some(RunMode::Default));
        assert_eq!(RunMode::parse("RECORD"), Some(RunMode::Record));
        assert_eq!(RunMode::parse("replay"), Some(RunMode::Replay));
        assert_eq!(RunMode::parse("report"), Some(RunMode::Report));
        assert_eq!(RunMode::parse("bogus"), None);
    }
}
