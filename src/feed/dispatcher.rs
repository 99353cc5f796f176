// =============================================================================
// Feed Dispatcher — Inbound event application
// =============================================================================
//
// The single consumer of the bridge event stream. Owns the fan-out from raw
// events to the per-symbol books and onward to the coordinator, so per-symbol
// book mutation is strictly serial in broker-delivery order.
//
// Event handling never unwinds: malformed events are counted and dropped,
// broker errors are routed to the subscription manager, and only a closed
// connection stops the loop.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::feed::{normalize_event_ts, FeedEvent};
use crate::market_data::order_book::BookError;
use crate::market_data::BookDirectory;
use crate::notify::SignalSink;
use crate::runtime_config::RuntimeConfig;
use crate::signals::{CoordinatorEvent, SignalCoordinator};
use crate::subscription::manager::BrokerErrorOutcome;
use crate::subscription::{EvaluationController, StreamKind, SubscriptionManager};
use crate::types::{DepthOp, DepthUpdate, Side};

pub struct FeedDispatcher {
    cfg: RuntimeConfig,
    sm: Arc<SubscriptionManager>,
    books: Arc<BookDirectory>,
    coordinator: Arc<SignalCoordinator>,
    controller: Arc<EvaluationController>,
    sink: Arc<dyn SignalSink>,
    /// Transient feed errors: invalid op/side codes, orphan ids, dropped
    /// book updates. Counted, never propagated.
    dropped_events: AtomicU64,
}

impl FeedDispatcher {
    pub fn new(
        cfg: RuntimeConfig,
        sm: Arc<SubscriptionManager>,
        books: Arc<BookDirectory>,
        coordinator: Arc<SignalCoordinator>,
        controller: Arc<EvaluationController>,
        sink: Arc<dyn SignalSink>,
    ) -> Self {
        Self {
            cfg,
            sm,
            books,
            coordinator,
            controller,
            sink,
            dropped_events: AtomicU64::new(0),
        }
    }

    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    fn drop_event(&self) {
        self.dropped_events.fetch_add(1, Ordering::Relaxed);
    }

    /// Apply one inbound event. Returns false when the connection closed and
    /// the caller should reconnect.
    pub async fn handle_event(&self, event: FeedEvent) -> bool {
        match event {
            FeedEvent::Depth {
                req_id,
                position,
                op_raw,
                side_raw,
                price,
                size,
                recv_ts_ms,
            } => {
                self.on_depth(req_id, position, op_raw, side_raw, price, size, recv_ts_ms)
                    .await;
                true
            }
            FeedEvent::Trade {
                req_id,
                event_ts_raw,
                price,
                size,
                recv_ts_ms,
            } => {
                self.on_trade(req_id, event_ts_raw, price, size, recv_ts_ms)
                    .await;
                true
            }
            FeedEvent::Error {
                req_id,
                code,
                message,
            } => {
                self.on_error(req_id, code, &message).await;
                true
            }
            FeedEvent::ConnectionClosed => false,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn on_depth(
        &self,
        req_id: i64,
        position: usize,
        op_raw: i32,
        side_raw: i32,
        price: f64,
        size: f64,
        recv_ts_ms: i64,
    ) {
        let registry = self.sm.registry();
        let Some((symbol, kind)) = registry.resolve_req_id(req_id) else {
            warn!(req_id, "depth for unknown request-id dropped");
            self.drop_event();
            return;
        };
        if kind != StreamKind::Depth {
            warn!(req_id, symbol = %symbol, kind = %kind, "depth on a non-depth request-id dropped");
            self.drop_event();
            return;
        }
        registry.note_data(req_id, recv_ts_ms);

        let (Some(op), Some(side)) = (DepthOp::from_wire(op_raw), Side::from_wire(side_raw)) else {
            warn!(symbol = %symbol, op_raw, side_raw, "invalid depth op/side code dropped");
            self.drop_event();
            return;
        };

        let update = DepthUpdate {
            symbol: symbol.clone(),
            side,
            op,
            position,
            price,
            size,
            recv_ts_ms,
        };

        if let Err(e) = self.books.apply_depth(&update) {
            self.drop_event();
            match e {
                // The book already cleared the side and logged at error.
                BookError::OrderViolation { .. } => {}
                BookError::ResetPending { .. } => {
                    debug!(symbol = %symbol, "depth dropped while side rebuild pending");
                }
                other => {
                    warn!(symbol = %symbol, error = %other, "depth update dropped");
                }
            }
        }

        self.evaluate(&symbol, recv_ts_ms).await;
    }

    async fn on_trade(&self, req_id: i64, event_ts_raw: i64, price: f64, size: f64, recv_ts_ms: i64) {
        let registry = self.sm.registry();
        let Some((symbol, _kind)) = registry.resolve_req_id(req_id) else {
            warn!(req_id, "trade for unknown request-id dropped");
            self.drop_event();
            return;
        };
        registry.note_data(req_id, recv_ts_ms);

        let event_ts_ms = normalize_event_ts(event_ts_raw, self.cfg.feed.tape_timestamp_unit);
        let skew_ms = (recv_ts_ms - event_ts_ms).abs();
        if skew_ms > 60_000 {
            // Large skew is not a failure; receipt time stays authoritative.
            debug!(symbol = %symbol, skew_ms, "large event-clock skew on trade print");
        }

        self.books
            .record_trade(&symbol, event_ts_ms, recv_ts_ms, price, size);

        self.evaluate(&symbol, recv_ts_ms).await;
    }

    async fn on_error(&self, req_id: i64, code: i32, message: &str) {
        let now = crate::types::now_ms();
        match self.sm.handle_broker_error(req_id, code, message, now) {
            BrokerErrorOutcome::DepthIneligible {
                symbol,
                rolled_back: false,
            } => {
                // Depth died under a live evaluation: the controller closes
                // the window as DataInvalid.
                self.controller.note_depth_lost(&symbol, now).await;
            }
            BrokerErrorOutcome::Orphan => self.drop_event(),
            _ => {}
        }
    }

    /// Run the coordinator for a symbol and fan out any acceptances.
    async fn evaluate(&self, symbol: &str, now_ms: i64) {
        let active = self.sm.is_active(symbol);
        let events = self.coordinator.process_snapshot(symbol, now_ms, active);
        self.handle_coordinator_events(events, now_ms).await;
    }

    /// Shared with the control plane's rank-window poll.
    pub async fn handle_coordinator_events(&self, events: Vec<CoordinatorEvent>, now_ms: i64) {
        for event in events {
            match event {
                CoordinatorEvent::Accepted(entry) => {
                    self.sink.notify_acceptance(&entry);
                    self.controller.note_signal_emitted(&entry.symbol, now_ms).await;
                }
                CoordinatorEvent::Rejected { symbol, reason } => {
                    debug!(symbol = %symbol, reason = %reason, "candidate rejected");
                }
            }
        }
    }
}
