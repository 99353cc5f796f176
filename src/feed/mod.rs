// =============================================================================
// Feed Module — Broker event enum and outbound request trait
// =============================================================================
//
// The broker wire client lives outside this process (the gateway bridge).
// Inbound traffic is the small `FeedEvent` enum covering exactly what the
// core consumes; outbound traffic is the `BrokerRequests` trait covering
// subscribe/cancel for L1, depth, and tick-by-tick. Request-ids are chosen
// by the core and echoed back on every inbound event.

pub mod bridge;
pub mod dispatcher;

use anyhow::Result;
use async_trait::async_trait;

pub use bridge::BridgeClient;
pub use dispatcher::FeedDispatcher;

/// Broker error codes that are purely informational (farm status etc.).
pub const INFORMATIONAL_CODES: [i32; 4] = [2104, 2106, 2158, 2176];

/// The symbol is not eligible for depth data.
pub const CODE_DEPTH_INELIGIBLE: i32 = 10092;
/// The symbol is not eligible for tick-by-tick data.
pub const CODE_TBT_INELIGIBLE: i32 = 10190;

/// One inbound broker event, already stamped with local receipt time.
#[derive(Debug, Clone)]
pub enum FeedEvent {
    Depth {
        req_id: i64,
        position: usize,
        /// Raw wire op (0=Insert, 1=Update, 2=Delete); decoded downstream so
        /// an unknown code can be counted and dropped with a warning.
        op_raw: i32,
        /// Raw wire side (0=Ask, 1=Bid).
        side_raw: i32,
        price: f64,
        size: f64,
        recv_ts_ms: i64,
    },
    Trade {
        req_id: i64,
        /// Exchange event time, in seconds or milliseconds depending on the
        /// broker version.
        event_ts_raw: i64,
        price: f64,
        size: f64,
        recv_ts_ms: i64,
    },
    Error {
        req_id: i64,
        code: i32,
        message: String,
    },
    ConnectionClosed,
}

/// Outbound subscribe/cancel primitives. The core chooses the request-id.
#[async_trait]
pub trait BrokerRequests: Send + Sync {
    async fn subscribe_l1(&self, req_id: i64, symbol: &str, exchange: &str) -> Result<()>;
    async fn cancel_l1(&self, req_id: i64) -> Result<()>;

    async fn subscribe_depth(
        &self,
        req_id: i64,
        symbol: &str,
        rows: usize,
        exchange: &str,
    ) -> Result<()>;
    async fn cancel_depth(&self, req_id: i64) -> Result<()>;

    async fn subscribe_tbt(
        &self,
        req_id: i64,
        symbol: &str,
        tick_type: &str,
        exchange: &str,
    ) -> Result<()>;
    async fn cancel_tbt(&self, req_id: i64) -> Result<()>;
}

/// Broker handle that survives reconnects. Long-lived owners (subscription
/// manager, controller) hold this; each successful bridge connect swaps the
/// live client in.
pub struct SharedBroker {
    inner: parking_lot::RwLock<Option<std::sync::Arc<dyn BrokerRequests>>>,
}

impl SharedBroker {
    pub fn new() -> Self {
        Self {
            inner: parking_lot::RwLock::new(None),
        }
    }

    pub fn set(&self, broker: std::sync::Arc<dyn BrokerRequests>) {
        *self.inner.write() = Some(broker);
    }

    pub fn clear(&self) {
        *self.inner.write() = None;
    }

    fn current(&self) -> Result<std::sync::Arc<dyn BrokerRequests>> {
        self.inner
            .read()
            .clone()
            .ok_or_else(|| anyhow::anyhow!("broker not connected"))
    }
}

impl Default for SharedBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerRequests for SharedBroker {
    async fn subscribe_l1(&self, req_id: i64, symbol: &str, exchange: &str) -> Result<()> {
        self.current()?.subscribe_l1(req_id, symbol, exchange).await
    }

    async fn cancel_l1(&self, req_id: i64) -> Result<()> {
        self.current()?.cancel_l1(req_id).await
    }

    async fn subscribe_depth(
        &self,
        req_id: i64,
        symbol: &str,
        rows: usize,
        exchange: &str,
    ) -> Result<()> {
        self.current()?
            .subscribe_depth(req_id, symbol, rows, exchange)
            .await
    }

    async fn cancel_depth(&self, req_id: i64) -> Result<()> {
        self.current()?.cancel_depth(req_id).await
    }

    async fn subscribe_tbt(
        &self,
        req_id: i64,
        symbol: &str,
        tick_type: &str,
        exchange: &str,
    ) -> Result<()> {
        self.current()?
            .subscribe_tbt(req_id, symbol, tick_type, exchange)
            .await
    }

    async fn cancel_tbt(&self, req_id: i64) -> Result<()> {
        self.current()?.cancel_tbt(req_id).await
    }
}

/// Normalize a raw tape event timestamp to milliseconds.
///
/// The broker reports seconds or milliseconds depending on version; below
/// 10^10 the value can only be seconds. An explicit unit override skips the
/// heuristic.
pub fn normalize_event_ts(
    raw: i64,
    unit: crate::runtime_config::TapeTimestampUnit,
) -> i64 {
    use crate::runtime_config::TapeTimestampUnit;
    match unit {
        TapeTimestampUnit::Seconds => raw * 1_000,
        TapeTimestampUnit::Millis => raw,
        TapeTimestampUnit::Auto => {
            if raw < 10_000_000_000 {
                raw * 1_000
            } else {
                raw
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime_config::TapeTimestampUnit;

    #[test]
    fn event_ts_heuristic() {
        // 2023-11-14 in seconds vs millis.
        assert_eq!(
            normalize_event_ts(1_700_000_000, TapeTimestampUnit::Auto),
            1_700_000_000_000
        );
        assert_eq!(
            normalize_event_ts(1_700_000_000_000, TapeTimestampUnit::Auto),
            1_700_000_000_000
        );
    }

    #[test]
    fn event_ts_explicit_units() {
        assert_eq!(
            normalize_event_ts(1_700_000_000_000, TapeTimestampUnit::Seconds),
            1_700_000_000_000_000
        );
        assert_eq!(
            normalize_event_ts(1_700_000_000, TapeTimestampUnit::Millis),
            1_700_000_000
        );
    }
}
