// =============================================================================
// Subscription Registry — Single-lock subscription state
// =============================================================================
//
// Consolidates the three maps that together describe broker-line usage:
// symbol → subscription record, request-id → (symbol, stream), and the
// depth/tbt ineligibility cache. One mutex guards all three so they can
// never disagree; nothing inside is ever handed out by reference.
//
// The lock is never held across a broker RPC. Mutations are staged under the
// lock and the RPC issued after it drops.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

use crate::types::{ContractInfo, SubscriptionTier};

/// Which stream a request-id belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StreamKind {
    L1,
    Depth,
    Tbt,
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::L1 => write!(f, "L1"),
            Self::Depth => write!(f, "Depth"),
            Self::Tbt => write!(f, "TickByTick"),
        }
    }
}

/// Per-symbol subscription state. Unique on the normalized symbol.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionRecord {
    pub symbol: String,
    pub contract: ContractInfo,
    pub tier: SubscriptionTier,

    pub l1_req_id: Option<i64>,
    pub depth_req_id: Option<i64>,
    pub tbt_req_id: Option<i64>,

    pub l1_exchange: Option<String>,
    pub depth_exchange: Option<String>,
    pub tbt_exchange: Option<String>,

    /// When each stream was last (re)subscribed; drives receipt timeouts.
    pub l1_subscribed_ms: Option<i64>,
    pub tbt_subscribed_ms: Option<i64>,

    /// First data receipt per stream; None means nothing arrived yet.
    pub l1_first_recv_ms: Option<i64>,
    pub depth_first_recv_ms: Option<i64>,
    pub tbt_first_recv_ms: Option<i64>,

    pub probe_since_ms: i64,
    pub eval_started_ms: Option<i64>,
    pub cooldown_until_ms: Option<i64>,
}

impl SubscriptionRecord {
    fn new(contract: ContractInfo, now_ms: i64) -> Self {
        Self {
            symbol: contract.symbol.clone(),
            contract,
            tier: SubscriptionTier::Probe,
            l1_req_id: None,
            depth_req_id: None,
            tbt_req_id: None,
            l1_exchange: None,
            depth_exchange: None,
            tbt_exchange: None,
            l1_subscribed_ms: None,
            tbt_subscribed_ms: None,
            l1_first_recv_ms: None,
            depth_first_recv_ms: None,
            tbt_first_recv_ms: None,
            probe_since_ms: now_ms,
            eval_started_ms: None,
            cooldown_until_ms: None,
        }
    }
}

struct RegistryInner {
    records: HashMap<String, SubscriptionRecord>,
    req_index: HashMap<i64, (String, StreamKind)>,
    depth_ineligible_until: HashMap<String, i64>,
    tbt_ineligible_until: HashMap<String, i64>,
}

/// The single owner of all subscription state.
pub struct SubscriptionRegistry {
    next_req_id: AtomicI64,
    inner: Mutex<RegistryInner>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            next_req_id: AtomicI64::new(1_000),
            inner: Mutex::new(RegistryInner {
                records: HashMap::new(),
                req_index: HashMap::new(),
                depth_ineligible_until: HashMap::new(),
                tbt_ineligible_until: HashMap::new(),
            }),
        }
    }

    /// Allocate the next request-id. Monotonic for the process lifetime.
    pub fn allocate_req_id(&self) -> i64 {
        self.next_req_id.fetch_add(1, Ordering::SeqCst)
    }

    // ── Records ─────────────────────────────────────────────────────────

    /// Insert a fresh Probe record for a symbol. Returns false if the symbol
    /// is already tracked.
    pub fn insert_probe(&self, contract: ContractInfo, now_ms: i64) -> bool {
        let mut inner = self.inner.lock();
        let symbol = contract.symbol.clone();
        if inner.records.contains_key(&symbol) {
            return false;
        }
        inner.records.insert(symbol, SubscriptionRecord::new(contract, now_ms));
        true
    }

    /// Remove a symbol entirely, returning its record (ids included) so the
    /// caller can cancel the streams outside the lock.
    pub fn remove(&self, symbol: &str) -> Option<SubscriptionRecord> {
        let mut inner = self.inner.lock();
        let record = inner.records.remove(symbol)?;
        for id in [record.l1_req_id, record.depth_req_id, record.tbt_req_id]
            .into_iter()
            .flatten()
        {
            inner.req_index.remove(&id);
        }
        Some(record)
    }

    pub fn get(&self, symbol: &str) -> Option<SubscriptionRecord> {
        self.inner.lock().records.get(symbol).cloned()
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.inner.lock().records.contains_key(symbol)
    }

    /// Mutate one record in place under the lock. The closure must not
    /// block; the registry hands out no references.
    pub fn update<R>(
        &self,
        symbol: &str,
        f: impl FnOnce(&mut SubscriptionRecord) -> R,
    ) -> Option<R> {
        let mut inner = self.inner.lock();
        inner.records.get_mut(symbol).map(f)
    }

    /// Bind a request-id to (symbol, stream) and store it on the record.
    pub fn bind_req_id(&self, symbol: &str, kind: StreamKind, req_id: i64, now_ms: i64) {
        let mut inner = self.inner.lock();
        inner.req_index.insert(req_id, (symbol.to_string(), kind));
        if let Some(record) = inner.records.get_mut(symbol) {
            match kind {
                StreamKind::L1 => {
                    record.l1_req_id = Some(req_id);
                    record.l1_subscribed_ms = Some(now_ms);
                    record.l1_first_recv_ms = None;
                }
                StreamKind::Depth => {
                    record.depth_req_id = Some(req_id);
                    record.depth_first_recv_ms = None;
                }
                StreamKind::Tbt => {
                    record.tbt_req_id = Some(req_id);
                    record.tbt_subscribed_ms = Some(now_ms);
                    record.tbt_first_recv_ms = None;
                }
            }
        }
    }

    /// Unbind a request-id, clearing the record field that referenced it.
    /// Idempotent: unknown ids are a warning-level no-op.
    pub fn unbind_req_id(&self, req_id: i64) -> Option<(String, StreamKind)> {
        let mut inner = self.inner.lock();
        let Some((symbol, kind)) = inner.req_index.remove(&req_id) else {
            warn!(req_id, "unbind for unknown request-id, ignoring");
            return None;
        };
        if let Some(record) = inner.records.get_mut(&symbol) {
            match kind {
                StreamKind::L1 => {
                    if record.l1_req_id == Some(req_id) {
                        record.l1_req_id = None;
                    }
                }
                StreamKind::Depth => {
                    if record.depth_req_id == Some(req_id) {
                        record.depth_req_id = None;
                    }
                }
                StreamKind::Tbt => {
                    if record.tbt_req_id == Some(req_id) {
                        record.tbt_req_id = None;
                    }
                }
            }
        }
        Some((symbol, kind))
    }

    /// Resolve a request-id to its (symbol, stream).
    pub fn resolve_req_id(&self, req_id: i64) -> Option<(String, StreamKind)> {
        self.inner.lock().req_index.get(&req_id).cloned()
    }

    /// Stamp first-data receipt for the stream behind a request-id.
    pub fn note_data(&self, req_id: i64, now_ms: i64) {
        let mut inner = self.inner.lock();
        let Some((symbol, kind)) = inner.req_index.get(&req_id).cloned() else {
            return;
        };
        if let Some(record) = inner.records.get_mut(&symbol) {
            let slot = match kind {
                StreamKind::L1 => &mut record.l1_first_recv_ms,
                StreamKind::Depth => &mut record.depth_first_recv_ms,
                StreamKind::Tbt => &mut record.tbt_first_recv_ms,
            };
            if slot.is_none() {
                *slot = Some(now_ms);
            }
        }
    }

    // ── Views ───────────────────────────────────────────────────────────

    pub fn all_records(&self) -> Vec<SubscriptionRecord> {
        self.inner.lock().records.values().cloned().collect()
    }

    pub fn symbols_in_tier(&self, tier: SubscriptionTier) -> Vec<String> {
        self.inner
            .lock()
            .records
            .values()
            .filter(|r| r.tier == tier)
            .map(|r| r.symbol.clone())
            .collect()
    }

    pub fn tracked_count(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn eval_count(&self) -> usize {
        self.inner
            .lock()
            .records
            .values()
            .filter(|r| r.tier == SubscriptionTier::Eval)
            .count()
    }

    /// Count of records with a live subscription of the given stream.
    pub fn stream_count(&self, kind: StreamKind) -> usize {
        let inner = self.inner.lock();
        inner
            .records
            .values()
            .filter(|r| match kind {
                StreamKind::L1 => r.l1_req_id.is_some(),
                StreamKind::Depth => r.depth_req_id.is_some(),
                StreamKind::Tbt => r.tbt_req_id.is_some(),
            })
            .count()
    }

    // ── Eligibility cache ───────────────────────────────────────────────

    /// Stamp a capability demotion until `until_ms`.
    pub fn mark_ineligible(&self, symbol: &str, kind: StreamKind, until_ms: i64) {
        let mut inner = self.inner.lock();
        match kind {
            StreamKind::Depth => {
                inner
                    .depth_ineligible_until
                    .insert(symbol.to_string(), until_ms);
            }
            StreamKind::Tbt => {
                inner
                    .tbt_ineligible_until
                    .insert(symbol.to_string(), until_ms);
            }
            StreamKind::L1 => {}
        }
    }

    pub fn is_ineligible(&self, symbol: &str, kind: StreamKind, now_ms: i64) -> bool {
        let inner = self.inner.lock();
        let map = match kind {
            StreamKind::Depth => &inner.depth_ineligible_until,
            StreamKind::Tbt => &inner.tbt_ineligible_until,
            StreamKind::L1 => return false,
        };
        map.get(symbol).map(|until| now_ms < *until).unwrap_or(false)
    }

    // ── Cooldowns ───────────────────────────────────────────────────────

    pub fn stamp_cooldown(&self, symbol: &str, until_ms: i64) {
        self.update(symbol, |r| r.cooldown_until_ms = Some(until_ms));
    }

    pub fn in_cooldown(&self, symbol: &str, now_ms: i64) -> bool {
        self.get(symbol)
            .and_then(|r| r.cooldown_until_ms)
            .map(|until| now_ms < until)
            .unwrap_or(false)
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StockType;

    pub(crate) fn contract(symbol: &str) -> ContractInfo {
        ContractInfo {
            symbol: symbol.to_string(),
            contract_id: 1,
            security_type: "STK".to_string(),
            primary_exchange: "NASDAQ".to_string(),
            currency: "USD".to_string(),
            stock_type: StockType::Common,
            local_symbol: symbol.to_string(),
            trading_class: symbol.to_string(),
        }
    }

    #[test]
    fn request_ids_are_monotonic() {
        let reg = SubscriptionRegistry::new();
        let a = reg.allocate_req_id();
        let b = reg.allocate_req_id();
        let c = reg.allocate_req_id();
        assert!(a < b && b < c);
    }

    #[test]
    fn insert_is_unique_per_symbol() {
        let reg = SubscriptionRegistry::new();
        assert!(reg.insert_probe(contract("AAPL"), 1_000));
        assert!(!reg.insert_probe(contract("AAPL"), 2_000));
        assert_eq!(reg.tracked_count(), 1);
    }

    #[test]
    fn bind_and_resolve_req_ids() {
        let reg = SubscriptionRegistry::new();
        reg.insert_probe(contract("AAPL"), 1_000);
        let id = reg.allocate_req_id();
        reg.bind_req_id("AAPL", StreamKind::L1, id, 1_000);

        assert_eq!(
            reg.resolve_req_id(id),
            Some(("AAPL".to_string(), StreamKind::L1))
        );
        assert_eq!(reg.get("AAPL").unwrap().l1_req_id, Some(id));
        assert_eq!(reg.stream_count(StreamKind::L1), 1);
    }

    #[test]
    fn unbind_clears_record_and_index() {
        let reg = SubscriptionRegistry::new();
        reg.insert_probe(contract("AAPL"), 1_000);
        let id = reg.allocate_req_id();
        reg.bind_req_id("AAPL", StreamKind::Depth, id, 1_000);

        assert_eq!(
            reg.unbind_req_id(id),
            Some(("AAPL".to_string(), StreamKind::Depth))
        );
        assert!(reg.get("AAPL").unwrap().depth_req_id.is_none());
        assert!(reg.resolve_req_id(id).is_none());
        // Double-unbind is an idempotent no-op.
        assert!(reg.unbind_req_id(id).is_none());
    }

    #[test]
    fn remove_returns_record_and_clears_index() {
        let reg = SubscriptionRegistry::new();
        reg.insert_probe(contract("AAPL"), 1_000);
        let l1 = reg.allocate_req_id();
        let depth = reg.allocate_req_id();
        reg.bind_req_id("AAPL", StreamKind::L1, l1, 1_000);
        reg.bind_req_id("AAPL", StreamKind::Depth, depth, 1_000);

        let record = reg.remove("AAPL").unwrap();
        assert_eq!(record.l1_req_id, Some(l1));
        assert!(reg.resolve_req_id(l1).is_none());
        assert!(reg.resolve_req_id(depth).is_none());
        assert_eq!(reg.tracked_count(), 0);
    }

    #[test]
    fn first_data_stamped_once() {
        let reg = SubscriptionRegistry::new();
        reg.insert_probe(contract("AAPL"), 1_000);
        let id = reg.allocate_req_id();
        reg.bind_req_id("AAPL", StreamKind::Tbt, id, 1_000);

        reg.note_data(id, 1_500);
        reg.note_data(id, 2_500);
        assert_eq!(reg.get("AAPL").unwrap().tbt_first_recv_ms, Some(1_500));
    }

    #[test]
    fn eligibility_cache_expires() {
        let reg = SubscriptionRegistry::new();
        reg.mark_ineligible("ABC", StreamKind::Depth, 10_000);
        assert!(reg.is_ineligible("ABC", StreamKind::Depth, 5_000));
        assert!(!reg.is_ineligible("ABC", StreamKind::Depth, 10_000));
        assert!(!reg.is_ineligible("ABC", StreamKind::Tbt, 5_000));
    }

    #[test]
    fn cooldown_stamps_and_expires() {
        let reg = SubscriptionRegistry::new();
        reg.insert_probe(contract("AAPL"), 1_000);
        reg.stamp_cooldown("AAPL", 61_000);
        assert!(reg.in_cooldown("AAPL", 60_999));
        assert!(!reg.in_cooldown("AAPL", 61_000));
    }
}
