// =============================================================================
// Subscription Manager — Line budget, tier lifecycle, broker error routing
// =============================================================================
//
// Owns every structural change to the subscription set:
//
//   - apply_universe reconciles the Probe set against the MaxLines budget
//   - upgrade_to_eval / downgrade_from_eval move symbols between tiers,
//     preserving the L1 request-id across the upgrade
//   - handle_broker_error routes the special broker codes (depth/tbt
//     ineligibility, informational farm chatter)
//   - the fallback pass re-routes subscriptions that produced no data
//     within the receipt timeout onto the smart router
//
// The registry lock is never held across a broker RPC: mutations are staged
// first, the RPC issued after.
// =============================================================================

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::feed::{BrokerRequests, CODE_DEPTH_INELIGIBLE, CODE_TBT_INELIGIBLE, INFORMATIONAL_CODES};
use crate::runtime_config::RuntimeConfig;
use crate::subscription::registry::{StreamKind, SubscriptionRegistry};
use crate::types::{ContractInfo, SubscriptionTier};

/// Exchanges we subscribe on directly; everything else smart-routes.
const DIRECT_ROUTED: [&str; 5] = ["NASDAQ", "NYSE", "AMEX", "CBOE", "BOX"];
pub const SMART_ROUTER: &str = "SMART";

/// Tick type requested for the tick-by-tick stream.
const TBT_TICK_TYPE: &str = "Last";

/// Outcome of a universe reconciliation.
#[derive(Debug, Default)]
pub struct UniverseDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub kept: Vec<String>,
    /// Candidates dropped because the line budget was exhausted, in the
    /// universe source's rank order.
    pub over_budget: Vec<String>,
}

#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error("symbol is not tracked")]
    NotTracked,
    #[error("symbol is not in Probe")]
    NotProbe,
    #[error("no evaluation slot free")]
    NoSlotFree,
    #[error("symbol is cooling down")]
    CoolingDown,
    #[error("symbol is depth-ineligible")]
    DepthIneligible,
    #[error("depth subscription failed: {0}")]
    Broker(#[source] anyhow::Error),
}

/// What a routed broker error means for the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerErrorOutcome {
    /// Farm status chatter; logged at debug.
    Informational,
    /// 10092. `rolled_back` is true when the upgrade was unwound before any
    /// depth data arrived (the evaluation never started).
    DepthIneligible { symbol: String, rolled_back: bool },
    /// 10190: tick-by-tick unsupported; the tbt id was cleared.
    TbtIneligible { symbol: String },
    /// An id we no longer track; idempotent no-op.
    Orphan,
    /// Any other code; surfaced to the error log.
    Other,
}

pub struct SubscriptionManager {
    cfg: RuntimeConfig,
    registry: Arc<SubscriptionRegistry>,
    broker: Arc<dyn BrokerRequests>,
}

impl SubscriptionManager {
    pub fn new(
        cfg: RuntimeConfig,
        registry: Arc<SubscriptionRegistry>,
        broker: Arc<dyn BrokerRequests>,
    ) -> Self {
        Self {
            cfg,
            registry,
            broker,
        }
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    fn eligibility_ttl_ms(&self) -> i64 {
        self.cfg.feed.eligibility_ttl_minutes as i64 * 60_000
    }

    /// Quote/tick routing: direct on the big boards, otherwise smart.
    fn quote_exchange(contract: &ContractInfo) -> &str {
        let primary = contract.primary_exchange.as_str();
        if DIRECT_ROUTED.contains(&primary) {
            primary
        } else {
            SMART_ROUTER
        }
    }

    /// Depth routing: the contract's primary when present, otherwise smart.
    fn depth_exchange(contract: &ContractInfo) -> &str {
        if contract.primary_exchange.is_empty() {
            SMART_ROUTER
        } else {
            contract.primary_exchange.as_str()
        }
    }

    // ── Universe reconciliation ─────────────────────────────────────────

    /// Reconcile the tracked set against a fresh ordered candidate list.
    /// Surplus beyond MaxLines is dropped in source order.
    pub async fn apply_universe(
        &self,
        candidates: &[ContractInfo],
        now_ms: i64,
    ) -> UniverseDiff {
        let mut diff = UniverseDiff::default();

        let budget = self.cfg.market_data.max_lines;
        let mut desired: Vec<&ContractInfo> = Vec::with_capacity(budget);
        for contract in candidates {
            if desired.len() < budget {
                desired.push(contract);
            } else {
                diff.over_budget.push(contract.symbol.clone());
            }
        }

        let desired_symbols: std::collections::HashSet<&str> =
            desired.iter().map(|c| c.symbol.as_str()).collect();

        // Removals first, freeing lines for the additions.
        for record in self.registry.all_records() {
            if !desired_symbols.contains(record.symbol.as_str()) {
                self.drop_symbol(&record.symbol).await;
                diff.removed.push(record.symbol);
            }
        }

        for contract in desired {
            if self.registry.contains(&contract.symbol) {
                diff.kept.push(contract.symbol.clone());
                continue;
            }
            if self.subscribe_probe(contract, now_ms).await {
                diff.added.push(contract.symbol.clone());
            }
        }

        info!(
            added = diff.added.len(),
            removed = diff.removed.len(),
            kept = diff.kept.len(),
            over_budget = diff.over_budget.len(),
            "universe applied"
        );
        diff
    }

    /// Subscribe a fresh Probe: L1 quotes + tape on the routed exchange.
    async fn subscribe_probe(&self, contract: &ContractInfo, now_ms: i64) -> bool {
        if !self.registry.insert_probe(contract.clone(), now_ms) {
            return false;
        }
        let exchange = Self::quote_exchange(contract).to_string();
        let req_id = self.registry.allocate_req_id();
        self.registry
            .bind_req_id(&contract.symbol, StreamKind::L1, req_id, now_ms);
        self.registry
            .update(&contract.symbol, |r| r.l1_exchange = Some(exchange.clone()));

        match self
            .broker
            .subscribe_l1(req_id, &contract.symbol, &exchange)
            .await
        {
            Ok(()) => {
                debug!(symbol = %contract.symbol, req_id, exchange = %exchange, "L1 subscribed");
                true
            }
            Err(e) => {
                warn!(symbol = %contract.symbol, error = %e, "L1 subscribe failed, dropping symbol");
                self.registry.unbind_req_id(req_id);
                self.registry.remove(&contract.symbol);
                false
            }
        }
    }

    /// Cancel every stream for a symbol and forget it.
    async fn drop_symbol(&self, symbol: &str) {
        let Some(record) = self.registry.remove(symbol) else {
            return;
        };
        if let Some(id) = record.depth_req_id {
            let _ = self.broker.cancel_depth(id).await;
        }
        if let Some(id) = record.tbt_req_id {
            let _ = self.broker.cancel_tbt(id).await;
        }
        if let Some(id) = record.l1_req_id {
            let _ = self.broker.cancel_l1(id).await;
        }
        debug!(symbol = %symbol, "symbol dropped from universe");
    }

    /// Forget everything without issuing cancels. Used after a connection
    /// loss, when the broker-side subscriptions are already gone.
    pub fn clear_all(&self) {
        for record in self.registry.all_records() {
            self.registry.remove(&record.symbol);
        }
        info!("subscription state cleared after connection loss");
    }

    // ── Tier transitions ────────────────────────────────────────────────

    /// Attach depth + tick-by-tick to a Probe. The existing L1 request-id
    /// (and any existing tbt id) must survive unchanged.
    pub async fn upgrade_to_eval(&self, symbol: &str, now_ms: i64) -> Result<(), UpgradeError> {
        let record = self.registry.get(symbol).ok_or(UpgradeError::NotTracked)?;
        if record.tier != SubscriptionTier::Probe {
            return Err(UpgradeError::NotProbe);
        }
        if self.registry.eval_count() >= self.cfg.depth_slots {
            return Err(UpgradeError::NoSlotFree);
        }
        if self.registry.in_cooldown(symbol, now_ms) {
            return Err(UpgradeError::CoolingDown);
        }
        if self
            .registry
            .is_ineligible(symbol, StreamKind::Depth, now_ms)
        {
            debug!(symbol = %symbol, "upgrade short-circuited: depth-ineligible TTL active");
            return Err(UpgradeError::DepthIneligible);
        }

        // Depth first; only a successful depth subscription consumes a slot.
        let exchange = Self::depth_exchange(&record.contract).to_string();
        let exchange = match self.subscribe_depth_with_retry(symbol, &exchange, now_ms).await {
            Ok(exchange) => exchange,
            Err(e) => {
                let until = now_ms + self.eligibility_ttl_ms();
                self.registry.mark_ineligible(symbol, StreamKind::Depth, until);
                warn!(symbol = %symbol, error = %e, "depth subscribe failed on both routes, marked depth-unsupported");
                return Err(UpgradeError::Broker(e));
            }
        };
        self.registry
            .update(symbol, |r| r.depth_exchange = Some(exchange));

        // Tick-by-tick, preserving a pre-existing id.
        if record.tbt_req_id.is_none() {
            self.attach_tbt(symbol, &record.contract, now_ms).await;
        }

        self.registry.update(symbol, |r| {
            r.tier = SubscriptionTier::Eval;
            r.eval_started_ms = Some(now_ms);
        });
        info!(symbol = %symbol, "upgraded to evaluation");
        Ok(())
    }

    async fn subscribe_depth_with_retry(
        &self,
        symbol: &str,
        exchange: &str,
        now_ms: i64,
    ) -> anyhow::Result<String> {
        let rows = self.cfg.market_data.depth_rows;

        let req_id = self.registry.allocate_req_id();
        self.registry
            .bind_req_id(symbol, StreamKind::Depth, req_id, now_ms);
        match self.broker.subscribe_depth(req_id, symbol, rows, exchange).await {
            Ok(()) => return Ok(exchange.to_string()),
            Err(e) => {
                self.registry.unbind_req_id(req_id);
                if exchange == SMART_ROUTER {
                    return Err(e);
                }
                debug!(symbol = %symbol, error = %e, "depth subscribe failed on primary, retrying smart");
            }
        }

        // One retry on the smart router.
        let retry_id = self.registry.allocate_req_id();
        self.registry
            .bind_req_id(symbol, StreamKind::Depth, retry_id, now_ms);
        match self
            .broker
            .subscribe_depth(retry_id, symbol, rows, SMART_ROUTER)
            .await
        {
            Ok(()) => Ok(SMART_ROUTER.to_string()),
            Err(e) => {
                self.registry.unbind_req_id(retry_id);
                Err(e)
            }
        }
    }

    async fn attach_tbt(&self, symbol: &str, contract: &ContractInfo, now_ms: i64) {
        if self
            .registry
            .is_ineligible(symbol, StreamKind::Tbt, now_ms)
        {
            debug!(symbol = %symbol, "tick-by-tick skipped: ineligible TTL active");
            return;
        }
        if self.registry.stream_count(StreamKind::Tbt)
            >= self.cfg.market_data.tick_by_tick_max_symbols
        {
            debug!(symbol = %symbol, "tick-by-tick skipped: broker-side cap reached");
            return;
        }

        let exchange = Self::quote_exchange(contract).to_string();
        let req_id = self.registry.allocate_req_id();
        self.registry
            .bind_req_id(symbol, StreamKind::Tbt, req_id, now_ms);
        match self
            .broker
            .subscribe_tbt(req_id, symbol, TBT_TICK_TYPE, &exchange)
            .await
        {
            Ok(()) => {
                self.registry
                    .update(symbol, |r| r.tbt_exchange = Some(exchange));
            }
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "tick-by-tick subscribe failed, continuing without");
                self.registry.unbind_req_id(req_id);
            }
        }
    }

    /// Cancel depth + tbt, return to Probe, stamp the cooldown. L1 survives.
    pub async fn downgrade_from_eval(&self, symbol: &str, now_ms: i64) {
        let Some((depth_id, tbt_id)) = self.registry.update(symbol, |r| {
            let ids = (r.depth_req_id, r.tbt_req_id);
            r.tier = SubscriptionTier::Probe;
            r.eval_started_ms = None;
            r.depth_exchange = None;
            r.tbt_exchange = None;
            ids
        }) else {
            warn!(symbol = %symbol, "downgrade for untracked symbol, ignoring");
            return;
        };

        self.registry
            .stamp_cooldown(symbol, now_ms + self.cfg.evaluation_window.cooldown_ms);

        if let Some(id) = depth_id {
            self.registry.unbind_req_id(id);
            let _ = self.broker.cancel_depth(id).await;
        }
        if let Some(id) = tbt_id {
            self.registry.unbind_req_id(id);
            let _ = self.broker.cancel_tbt(id).await;
        }
        debug!(symbol = %symbol, "downgraded from evaluation");
    }

    /// True iff the symbol is in Eval and its depth stream has produced
    /// data. Only active symbols may reach the coordinator.
    pub fn is_active(&self, symbol: &str) -> bool {
        self.registry
            .get(symbol)
            .map(|r| r.tier == SubscriptionTier::Eval && r.depth_first_recv_ms.is_some())
            .unwrap_or(false)
    }

    // ── Broker error routing ────────────────────────────────────────────

    pub fn handle_broker_error(
        &self,
        req_id: i64,
        code: i32,
        message: &str,
        now_ms: i64,
    ) -> BrokerErrorOutcome {
        if INFORMATIONAL_CODES.contains(&code) {
            debug!(req_id, code, message, "broker informational");
            return BrokerErrorOutcome::Informational;
        }

        match code {
            CODE_DEPTH_INELIGIBLE => {
                let Some((symbol, _kind)) = self.registry.resolve_req_id(req_id) else {
                    warn!(req_id, code, "depth-ineligible for unknown request-id");
                    return BrokerErrorOutcome::Orphan;
                };
                let until = now_ms + self.eligibility_ttl_ms();
                self.registry
                    .mark_ineligible(&symbol, StreamKind::Depth, until);

                // The broker-side subscription is already dead; unbind only.
                self.registry.unbind_req_id(req_id);

                // If no depth data ever arrived the upgrade is unwound and
                // the evaluation never started: no slot held, no journal.
                let rolled_back = self
                    .registry
                    .update(&symbol, |r| {
                        if r.tier == SubscriptionTier::Eval && r.depth_first_recv_ms.is_none() {
                            r.tier = SubscriptionTier::Probe;
                            r.eval_started_ms = None;
                            r.depth_exchange = None;
                            true
                        } else {
                            false
                        }
                    })
                    .unwrap_or(false);

                warn!(symbol = %symbol, code, rolled_back, "depth-ineligible, capability demoted");
                BrokerErrorOutcome::DepthIneligible { symbol, rolled_back }
            }
            CODE_TBT_INELIGIBLE => {
                let Some((symbol, _kind)) = self.registry.resolve_req_id(req_id) else {
                    warn!(req_id, code, "tbt-ineligible for unknown request-id");
                    return BrokerErrorOutcome::Orphan;
                };
                let until = now_ms + self.eligibility_ttl_ms();
                self.registry.mark_ineligible(&symbol, StreamKind::Tbt, until);
                self.registry.unbind_req_id(req_id);
                warn!(symbol = %symbol, code, "tick-by-tick ineligible, id cleared");
                BrokerErrorOutcome::TbtIneligible { symbol }
            }
            _ => {
                if self.registry.resolve_req_id(req_id).is_none() && req_id >= 0 {
                    warn!(req_id, code, message, "broker error for unknown request-id");
                    return BrokerErrorOutcome::Orphan;
                }
                warn!(req_id, code, message, "broker error");
                BrokerErrorOutcome::Other
            }
        }
    }

    // ── Receipt-timeout fallback ────────────────────────────────────────

    /// One pass of the fallback monitor: any L1 or tbt subscription that has
    /// produced zero data within its receipt timeout is re-issued on the
    /// smart router under a fresh request-id.
    pub async fn run_fallback_pass(&self, now_ms: i64) {
        for record in self.registry.all_records() {
            // L1 fallback.
            if let (Some(req_id), Some(subscribed)) = (record.l1_req_id, record.l1_subscribed_ms) {
                let timed_out = record.l1_first_recv_ms.is_none()
                    && now_ms - subscribed >= self.cfg.market_data.l1_receipt_timeout_ms;
                let on_direct = record.l1_exchange.as_deref() != Some(SMART_ROUTER);
                if timed_out && on_direct {
                    self.fallback_l1(&record.symbol, req_id, now_ms).await;
                }
            }

            // Tick-by-tick fallback.
            if let (Some(req_id), Some(subscribed)) = (record.tbt_req_id, record.tbt_subscribed_ms)
            {
                let timed_out = record.tbt_first_recv_ms.is_none()
                    && now_ms - subscribed
                        >= self.cfg.market_data.tick_by_tick_receipt_timeout_ms;
                let on_direct = record.tbt_exchange.as_deref() != Some(SMART_ROUTER);
                if timed_out && on_direct {
                    self.fallback_tbt(&record.symbol, req_id, now_ms).await;
                }
            }
        }
    }

    async fn fallback_l1(&self, symbol: &str, old_id: i64, now_ms: i64) {
        info!(symbol = %symbol, old_id, "L1 silent past receipt timeout, falling back to smart router");
        self.registry.unbind_req_id(old_id);
        let _ = self.broker.cancel_l1(old_id).await;

        let new_id = self.registry.allocate_req_id();
        self.registry.bind_req_id(symbol, StreamKind::L1, new_id, now_ms);
        self.registry
            .update(symbol, |r| r.l1_exchange = Some(SMART_ROUTER.to_string()));
        if let Err(e) = self.broker.subscribe_l1(new_id, symbol, SMART_ROUTER).await {
            warn!(symbol = %symbol, error = %e, "smart-router L1 fallback failed");
            self.registry.unbind_req_id(new_id);
        }
    }

    async fn fallback_tbt(&self, symbol: &str, old_id: i64, now_ms: i64) {
        info!(symbol = %symbol, old_id, "tick-by-tick silent past receipt timeout, falling back to smart router");
        self.registry.unbind_req_id(old_id);
        let _ = self.broker.cancel_tbt(old_id).await;

        let new_id = self.registry.allocate_req_id();
        self.registry.bind_req_id(symbol, StreamKind::Tbt, new_id, now_ms);
        self.registry
            .update(symbol, |r| r.tbt_exchange = Some(SMART_ROUTER.to_string()));
        if let Err(e) = self
            .broker
            .subscribe_tbt(new_id, symbol, TBT_TICK_TYPE, SMART_ROUTER)
            .await
        {
            warn!(symbol = %symbol, error = %e, "smart-router tbt fallback failed");
            self.registry.unbind_req_id(new_id);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use crate::types::StockType;

    /// Records every call; optionally fails depth subscriptions per exchange.
    #[derive(Default)]
    struct MockBroker {
        calls: Mutex<Vec<String>>,
        fail_depth_exchanges: Mutex<HashSet<String>>,
    }

    impl MockBroker {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        fn fail_depth_on(&self, exchange: &str) {
            self.fail_depth_exchanges.lock().insert(exchange.to_string());
        }
    }

    #[async_trait]
    impl BrokerRequests for MockBroker {
        async fn subscribe_l1(&self, req_id: i64, symbol: &str, exchange: &str) -> anyhow::Result<()> {
            self.calls.lock().push(format!("l1:{req_id}:{symbol}:{exchange}"));
            Ok(())
        }
        async fn cancel_l1(&self, req_id: i64) -> anyhow::Result<()> {
            self.calls.lock().push(format!("cancel_l1:{req_id}"));
            Ok(())
        }
        async fn subscribe_depth(
            &self,
            req_id: i64,
            symbol: &str,
            rows: usize,
            exchange: &str,
        ) -> anyhow::Result<()> {
            self.calls
                .lock()
                .push(format!("depth:{req_id}:{symbol}:{rows}:{exchange}"));
            if self.fail_depth_exchanges.lock().contains(exchange) {
                return Err(anyhow!("depth unavailable on {exchange}"));
            }
            Ok(())
        }
        async fn cancel_depth(&self, req_id: i64) -> anyhow::Result<()> {
            self.calls.lock().push(format!("cancel_depth:{req_id}"));
            Ok(())
        }
        async fn subscribe_tbt(
            &self,
            req_id: i64,
            symbol: &str,
            tick_type: &str,
            exchange: &str,
        ) -> anyhow::Result<()> {
            self.calls
                .lock()
                .push(format!("tbt:{req_id}:{symbol}:{tick_type}:{exchange}"));
            Ok(())
        }
        async fn cancel_tbt(&self, req_id: i64) -> anyhow::Result<()> {
            self.calls.lock().push(format!("cancel_tbt:{req_id}"));
            Ok(())
        }
    }

    fn contract(symbol: &str, primary: &str) -> ContractInfo {
        ContractInfo {
            symbol: symbol.to_string(),
            contract_id: 42,
            security_type: "STK".to_string(),
            primary_exchange: primary.to_string(),
            currency: "USD".to_string(),
            stock_type: StockType::Common,
            local_symbol: symbol.to_string(),
            trading_class: symbol.to_string(),
        }
    }

    fn manager(cfg: RuntimeConfig) -> (SubscriptionManager, Arc<MockBroker>) {
        let broker = Arc::new(MockBroker::default());
        let registry = Arc::new(SubscriptionRegistry::new());
        (
            SubscriptionManager::new(cfg, registry, broker.clone()),
            broker,
        )
    }

    #[tokio::test]
    async fn apply_universe_respects_line_budget() {
        let mut cfg = RuntimeConfig::default();
        cfg.market_data.max_lines = 2;
        let (sm, _broker) = manager(cfg);

        let candidates = vec![
            contract("AAPL", "NASDAQ"),
            contract("MSFT", "NASDAQ"),
            contract("NVDA", "NASDAQ"),
        ];
        let diff = sm.apply_universe(&candidates, 1_000).await;

        assert_eq!(diff.added, vec!["AAPL", "MSFT"]);
        assert_eq!(diff.over_budget, vec!["NVDA"]);
        assert_eq!(sm.registry.tracked_count(), 2);
    }

    #[tokio::test]
    async fn apply_universe_removes_departed_symbols() {
        let (sm, broker) = manager(RuntimeConfig::default());

        sm.apply_universe(&[contract("AAPL", "NASDAQ"), contract("MSFT", "NYSE")], 1_000)
            .await;
        let diff = sm.apply_universe(&[contract("MSFT", "NYSE")], 2_000).await;

        assert_eq!(diff.removed, vec!["AAPL"]);
        assert_eq!(diff.kept, vec!["MSFT"]);
        assert!(broker
            .calls()
            .iter()
            .any(|c| c.starts_with("cancel_l1:")));
    }

    #[tokio::test]
    async fn exchange_routing_direct_vs_smart() {
        let (sm, broker) = manager(RuntimeConfig::default());
        sm.apply_universe(
            &[contract("AAPL", "NASDAQ"), contract("PINK", "OTC")],
            1_000,
        )
        .await;

        let calls = broker.calls();
        assert!(calls.iter().any(|c| c.contains(":AAPL:NASDAQ")));
        assert!(calls.iter().any(|c| c.contains(":PINK:SMART")));
    }

    #[tokio::test]
    async fn upgrade_preserves_l1_req_id() {
        // The L1 id must survive the Probe→Eval upgrade untouched.
        let (sm, _broker) = manager(RuntimeConfig::default());
        sm.apply_universe(&[contract("AAPL", "NASDAQ")], 1_000).await;
        let l1_before = sm.registry.get("AAPL").unwrap().l1_req_id.unwrap();

        sm.upgrade_to_eval("AAPL", 2_000).await.unwrap();

        let record = sm.registry.get("AAPL").unwrap();
        assert_eq!(record.tier, SubscriptionTier::Eval);
        assert_eq!(record.l1_req_id, Some(l1_before));
        assert!(record.depth_req_id.is_some());
        assert!(record.tbt_req_id.is_some());
        assert_eq!(record.eval_started_ms, Some(2_000));
    }

    #[tokio::test]
    async fn upgrade_blocked_when_slots_full() {
        let mut cfg = RuntimeConfig::default();
        cfg.depth_slots = 1;
        let (sm, _broker) = manager(cfg);
        sm.apply_universe(&[contract("AAPL", "NASDAQ"), contract("MSFT", "NYSE")], 1_000)
            .await;

        sm.upgrade_to_eval("AAPL", 2_000).await.unwrap();
        let err = sm.upgrade_to_eval("MSFT", 2_000).await.unwrap_err();
        assert!(matches!(err, UpgradeError::NoSlotFree));
        // The candidate remains a Probe.
        assert_eq!(
            sm.registry.get("MSFT").unwrap().tier,
            SubscriptionTier::Probe
        );
    }

    #[tokio::test]
    async fn upgrade_blocked_during_cooldown() {
        let (sm, _broker) = manager(RuntimeConfig::default());
        sm.apply_universe(&[contract("AAPL", "NASDAQ")], 1_000).await;
        sm.registry.stamp_cooldown("AAPL", 100_000);

        let err = sm.upgrade_to_eval("AAPL", 2_000).await.unwrap_err();
        assert!(matches!(err, UpgradeError::CoolingDown));
    }

    #[tokio::test]
    async fn depth_failure_retries_smart_then_demotes() {
        // Synchronous flavour: depth refused on both routes leaves the
        // symbol in Probe with a depth-ineligibility stamp and no slot used.
        let (sm, broker) = manager(RuntimeConfig::default());
        broker.fail_depth_on("NASDAQ");
        broker.fail_depth_on(SMART_ROUTER);
        sm.apply_universe(&[contract("ABC", "NASDAQ")], 1_000).await;

        let err = sm.upgrade_to_eval("ABC", 2_000).await.unwrap_err();
        assert!(matches!(err, UpgradeError::Broker(_)));

        let record = sm.registry.get("ABC").unwrap();
        assert_eq!(record.tier, SubscriptionTier::Probe);
        assert!(record.depth_req_id.is_none());
        assert_eq!(sm.registry.eval_count(), 0);
        assert!(sm.registry.is_ineligible("ABC", StreamKind::Depth, 3_000));

        // Both routes were attempted.
        let depth_calls: Vec<_> = broker
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("depth:"))
            .collect();
        assert_eq!(depth_calls.len(), 2);
        assert!(depth_calls[1].ends_with(":SMART"));

        // Within the TTL further upgrades short-circuit without an RPC.
        let err = sm.upgrade_to_eval("ABC", 3_000).await.unwrap_err();
        assert!(matches!(err, UpgradeError::DepthIneligible));
    }

    #[tokio::test]
    async fn depth_failure_on_primary_succeeds_on_smart() {
        let (sm, broker) = manager(RuntimeConfig::default());
        broker.fail_depth_on("NASDAQ");
        sm.apply_universe(&[contract("AAPL", "NASDAQ")], 1_000).await;

        sm.upgrade_to_eval("AAPL", 2_000).await.unwrap();
        let record = sm.registry.get("AAPL").unwrap();
        assert_eq!(record.depth_exchange.as_deref(), Some(SMART_ROUTER));
    }

    #[tokio::test]
    async fn error_10092_after_upgrade_rolls_back_unstarted_eval() {
        // Asynchronous flavour: the depth subscription was accepted at
        // transport level but the broker rejects it with 10092 before any
        // data arrives.
        let (sm, _broker) = manager(RuntimeConfig::default());
        sm.apply_universe(&[contract("ABC", "NASDAQ")], 1_000).await;
        sm.upgrade_to_eval("ABC", 2_000).await.unwrap();
        let depth_id = sm.registry.get("ABC").unwrap().depth_req_id.unwrap();

        let outcome = sm.handle_broker_error(depth_id, CODE_DEPTH_INELIGIBLE, "no depth", 3_000);
        assert_eq!(
            outcome,
            BrokerErrorOutcome::DepthIneligible {
                symbol: "ABC".to_string(),
                rolled_back: true
            }
        );

        let record = sm.registry.get("ABC").unwrap();
        assert_eq!(record.tier, SubscriptionTier::Probe);
        assert!(record.eval_started_ms.is_none());
        assert_eq!(sm.registry.eval_count(), 0);
        assert!(sm.registry.is_ineligible("ABC", StreamKind::Depth, 4_000));
    }

    #[tokio::test]
    async fn error_10092_with_live_data_defers_to_controller() {
        let (sm, _broker) = manager(RuntimeConfig::default());
        sm.apply_universe(&[contract("ABC", "NASDAQ")], 1_000).await;
        sm.upgrade_to_eval("ABC", 2_000).await.unwrap();
        let depth_id = sm.registry.get("ABC").unwrap().depth_req_id.unwrap();
        sm.registry.note_data(depth_id, 2_500);

        let outcome = sm.handle_broker_error(depth_id, CODE_DEPTH_INELIGIBLE, "no depth", 3_000);
        assert_eq!(
            outcome,
            BrokerErrorOutcome::DepthIneligible {
                symbol: "ABC".to_string(),
                rolled_back: false
            }
        );
        // Still Eval: the window controller owns the DataInvalid exit.
        assert_eq!(sm.registry.get("ABC").unwrap().tier, SubscriptionTier::Eval);
    }

    #[tokio::test]
    async fn error_10190_clears_tbt_id() {
        let (sm, _broker) = manager(RuntimeConfig::default());
        sm.apply_universe(&[contract("AAPL", "NASDAQ")], 1_000).await;
        sm.upgrade_to_eval("AAPL", 2_000).await.unwrap();
        let tbt_id = sm.registry.get("AAPL").unwrap().tbt_req_id.unwrap();

        let outcome = sm.handle_broker_error(tbt_id, CODE_TBT_INELIGIBLE, "no tbt", 3_000);
        assert_eq!(
            outcome,
            BrokerErrorOutcome::TbtIneligible {
                symbol: "AAPL".to_string()
            }
        );
        assert!(sm.registry.get("AAPL").unwrap().tbt_req_id.is_none());
    }

    #[tokio::test]
    async fn informational_and_orphan_codes() {
        let (sm, _broker) = manager(RuntimeConfig::default());
        assert_eq!(
            sm.handle_broker_error(-1, 2104, "market data farm ok", 1_000),
            BrokerErrorOutcome::Informational
        );
        assert_eq!(
            sm.handle_broker_error(9_999, 300, "not subscribed", 1_000),
            BrokerErrorOutcome::Orphan
        );
    }

    #[tokio::test]
    async fn downgrade_cancels_depth_and_tbt_keeps_l1() {
        let (sm, broker) = manager(RuntimeConfig::default());
        sm.apply_universe(&[contract("AAPL", "NASDAQ")], 1_000).await;
        sm.upgrade_to_eval("AAPL", 2_000).await.unwrap();
        let record = sm.registry.get("AAPL").unwrap();
        let (depth_id, tbt_id) = (record.depth_req_id.unwrap(), record.tbt_req_id.unwrap());

        sm.downgrade_from_eval("AAPL", 10_000).await;

        let record = sm.registry.get("AAPL").unwrap();
        assert_eq!(record.tier, SubscriptionTier::Probe);
        assert!(record.l1_req_id.is_some());
        assert!(record.depth_req_id.is_none());
        assert!(record.tbt_req_id.is_none());
        // Cooldown stamped at now + configured cooldown.
        let cooldown = RuntimeConfig::default().evaluation_window.cooldown_ms;
        assert_eq!(record.cooldown_until_ms, Some(10_000 + cooldown));

        let calls = broker.calls();
        assert!(calls.contains(&format!("cancel_depth:{depth_id}")));
        assert!(calls.contains(&format!("cancel_tbt:{tbt_id}")));
        assert!(!calls.iter().any(|c| c.starts_with("cancel_l1:")));
    }

    #[tokio::test]
    async fn fallback_pass_moves_silent_l1_to_smart() {
        let (sm, broker) = manager(RuntimeConfig::default());
        sm.apply_universe(&[contract("AAPL", "NASDAQ")], 1_000).await;
        let old_id = sm.registry.get("AAPL").unwrap().l1_req_id.unwrap();

        // Before the timeout: nothing happens.
        sm.run_fallback_pass(10_000).await;
        assert_eq!(sm.registry.get("AAPL").unwrap().l1_req_id, Some(old_id));

        // Past the 15s receipt timeout with zero data observed.
        sm.run_fallback_pass(16_001).await;
        let record = sm.registry.get("AAPL").unwrap();
        let new_id = record.l1_req_id.unwrap();
        assert_ne!(new_id, old_id);
        assert_eq!(record.l1_exchange.as_deref(), Some(SMART_ROUTER));

        let calls = broker.calls();
        assert!(calls.contains(&format!("cancel_l1:{old_id}")));
        assert!(calls.iter().any(|c| c == &format!("l1:{new_id}:AAPL:SMART")));
    }

    #[tokio::test]
    async fn fallback_pass_skips_symbols_with_data() {
        let (sm, _broker) = manager(RuntimeConfig::default());
        sm.apply_universe(&[contract("AAPL", "NASDAQ")], 1_000).await;
        let old_id = sm.registry.get("AAPL").unwrap().l1_req_id.unwrap();
        sm.registry.note_data(old_id, 1_500);

        sm.run_fallback_pass(100_000).await;
        assert_eq!(sm.registry.get("AAPL").unwrap().l1_req_id, Some(old_id));
    }

    #[tokio::test]
    async fn is_active_requires_eval_and_depth_data() {
        let (sm, _broker) = manager(RuntimeConfig::default());
        sm.apply_universe(&[contract("AAPL", "NASDAQ")], 1_000).await;
        assert!(!sm.is_active("AAPL"));

        sm.upgrade_to_eval("AAPL", 2_000).await.unwrap();
        assert!(!sm.is_active("AAPL"));

        let depth_id = sm.registry.get("AAPL").unwrap().depth_req_id.unwrap();
        sm.registry.note_data(depth_id, 2_500);
        assert!(sm.is_active("AAPL"));
    }
}
