// =============================================================================
// Universe Service — Candidate discovery, classification filter, refresh loop
// =============================================================================
//
// Candidates come from a static config list or an external scanner endpoint
// returning an ordered list. Only Common stock passes the classification
// filter; everything else is excluded with a reason and journaled in the
// cycle's UniverseUpdate entry.
//
// A failed scanner fetch falls back to the last good candidate list so a
// flaky scanner cannot empty the universe.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{info, warn};

use crate::journal::{
    market_timestamp_utc, Journal, JournalEntry, UniverseCounts, UniverseExclusion,
    UniverseUpdateEntry, NESTED_SCHEMA_VERSION,
};
use crate::market_data::BookDirectory;
use crate::runtime_config::{RuntimeConfig, UniverseSource};
use crate::signals::SignalCoordinator;
use crate::subscription::{StreamKind, SubscriptionManager};
use crate::types::{ContractInfo, StockType};

/// Candidates listed in the journal's UniverseUpdate entry.
const TOP_CANDIDATES_JOURNALED: usize = 10;

/// One row from the scanner endpoint.
#[derive(Debug, Clone, Deserialize)]
struct ScannerRow {
    symbol: String,
    #[serde(default)]
    contract_id: i64,
    #[serde(default)]
    security_type: String,
    #[serde(default)]
    primary_exchange: String,
    #[serde(default)]
    currency: String,
    #[serde(default)]
    stock_type: String,
    #[serde(default)]
    local_symbol: String,
    #[serde(default)]
    trading_class: String,
}

impl ScannerRow {
    fn into_contract(self) -> ContractInfo {
        let stock_type = StockType::classify(&self.stock_type);
        let symbol = self.symbol.trim().to_uppercase();
        ContractInfo {
            local_symbol: if self.local_symbol.is_empty() {
                symbol.clone()
            } else {
                self.local_symbol
            },
            symbol,
            contract_id: self.contract_id,
            security_type: self.security_type,
            primary_exchange: self.primary_exchange,
            currency: self.currency,
            stock_type,
            trading_class: self.trading_class,
        }
    }
}

/// Split candidates into pipeline-eligible contracts and exclusions.
fn classify_candidates(
    candidates: Vec<ContractInfo>,
) -> (Vec<ContractInfo>, Vec<UniverseExclusion>) {
    let mut eligible = Vec::with_capacity(candidates.len());
    let mut exclusions = Vec::new();
    for contract in candidates {
        if contract.is_pipeline_eligible() {
            eligible.push(contract);
        } else {
            exclusions.push(UniverseExclusion {
                symbol: contract.symbol,
                reason: format!("StockType_{}", contract.stock_type),
            });
        }
    }
    (eligible, exclusions)
}

pub struct UniverseService {
    cfg: RuntimeConfig,
    http: reqwest::Client,
    sm: Arc<SubscriptionManager>,
    books: Arc<BookDirectory>,
    coordinator: Arc<SignalCoordinator>,
    journal: Arc<Journal>,
    last_good: Mutex<Vec<ContractInfo>>,
}

impl UniverseService {
    pub fn new(
        cfg: RuntimeConfig,
        sm: Arc<SubscriptionManager>,
        books: Arc<BookDirectory>,
        coordinator: Arc<SignalCoordinator>,
        journal: Arc<Journal>,
    ) -> Self {
        Self {
            cfg,
            http: reqwest::Client::new(),
            sm,
            books,
            coordinator,
            journal,
            last_good: Mutex::new(Vec::new()),
        }
    }

    /// Fetch, classify, reconcile, and journal one refresh cycle.
    pub async fn refresh(&self, now_ms: i64) {
        let candidates = match self.fetch_candidates().await {
            Ok(candidates) => {
                *self.last_good.lock() = candidates.clone();
                candidates
            }
            Err(e) => {
                let cached = self.last_good.lock().clone();
                warn!(
                    error = %e,
                    cached = cached.len(),
                    "universe fetch failed, reusing last good list"
                );
                cached
            }
        };

        let candidate_count = candidates.len();
        let (eligible, exclusions) = classify_candidates(candidates);

        let diff = self.sm.apply_universe(&eligible, now_ms).await;

        // Forget engine state for departed symbols.
        for symbol in &diff.removed {
            self.books.remove(symbol);
            self.coordinator.forget_symbol(symbol);
        }

        self.journal_cycle(&eligible, exclusions, candidate_count, now_ms);

        info!(
            candidates = candidate_count,
            eligible = eligible.len(),
            tracked = self.sm.registry().tracked_count(),
            "universe refreshed"
        );
    }

    async fn fetch_candidates(&self) -> Result<Vec<ContractInfo>> {
        match self.cfg.universe.source {
            UniverseSource::Static => Ok(self
                .cfg
                .universe
                .static_symbols
                .iter()
                .map(|s| static_contract(s))
                .collect()),
            UniverseSource::Scanner => {
                let url = self
                    .cfg
                    .universe
                    .scanner_url
                    .as_deref()
                    .context("scanner source without a scanner_url")?;
                let rows: Vec<ScannerRow> = self
                    .http
                    .get(url)
                    .send()
                    .await
                    .context("scanner request failed")?
                    .error_for_status()
                    .context("scanner returned an error status")?
                    .json()
                    .await
                    .context("scanner response was not valid JSON")?;
                Ok(rows.into_iter().map(ScannerRow::into_contract).collect())
            }
        }
    }

    fn journal_cycle(
        &self,
        eligible: &[ContractInfo],
        exclusions: Vec<UniverseExclusion>,
        candidate_count: usize,
        now_ms: i64,
    ) {
        let registry = self.sm.registry();
        let eval_set = registry.symbols_in_tier(crate::types::SubscriptionTier::Eval);
        let active = eval_set
            .iter()
            .filter(|s| self.sm.is_active(s))
            .count();

        let entry = UniverseUpdateEntry {
            schema_version: NESTED_SCHEMA_VERSION,
            session_id: self.journal.session_id().to_string(),
            market_timestamp_utc: market_timestamp_utc(now_ms),
            top_candidates: eligible
                .iter()
                .take(TOP_CANDIDATES_JOURNALED)
                .map(|c| c.symbol.clone())
                .collect(),
            eval_set,
            exclusions,
            counts: UniverseCounts {
                candidates: candidate_count,
                active,
                depth: registry.stream_count(StreamKind::Depth),
                tbt: registry.stream_count(StreamKind::Tbt),
                tape: self.books.len(),
            },
        };
        self.journal
            .write(&JournalEntry::UniverseUpdate(entry), now_ms);
    }

    /// Periodic refresh loop.
    pub async fn run(
        self: Arc<Self>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let interval = std::time::Duration::from_secs(self.cfg.universe.refresh_minutes.max(1) * 60);
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.refresh(crate::types::now_ms()).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}

/// Contract record for a statically configured symbol. The stock type is
/// asserted Common (the operator vouched for the list); routing smart.
fn static_contract(symbol: &str) -> ContractInfo {
    let symbol = symbol.trim().to_uppercase();
    ContractInfo {
        local_symbol: symbol.clone(),
        symbol,
        contract_id: 0,
        security_type: "STK".to_string(),
        primary_exchange: String::new(),
        currency: "USD".to_string(),
        stock_type: StockType::Common,
        trading_class: String::new(),
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scanner_row_classifies_stock_type() {
        let row: ScannerRow = serde_json::from_str(
            r#"{"symbol":"aapl","stock_type":"COMMON","primary_exchange":"NASDAQ"}"#,
        )
        .unwrap();
        let contract = row.into_contract();
        assert_eq!(contract.symbol, "AAPL");
        assert_eq!(contract.stock_type, StockType::Common);
        assert_eq!(contract.local_symbol, "AAPL");
        assert!(contract.is_pipeline_eligible());
    }

    #[test]
    fn classification_filter_excludes_non_common() {
        let candidates = vec![
            static_contract("AAPL"),
            ContractInfo {
                stock_type: StockType::Etf,
                ..static_contract("SPY")
            },
            ContractInfo {
                stock_type: StockType::Etn,
                ..static_contract("VXX")
            },
            ContractInfo {
                stock_type: StockType::Unknown,
                ..static_contract("WEIRD")
            },
        ];

        let (eligible, exclusions) = classify_candidates(candidates);
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].symbol, "AAPL");
        assert_eq!(exclusions.len(), 3);
        assert_eq!(exclusions[0].symbol, "SPY");
        assert_eq!(exclusions[0].reason, "StockType_ETF");
        assert_eq!(exclusions[2].reason, "StockType_Unknown");
    }

    #[test]
    fn static_contracts_are_common_and_ordered() {
        let symbols = ["nvda", " msft "];
        let contracts: Vec<ContractInfo> =
            symbols.iter().map(|s| static_contract(s)).collect();
        assert_eq!(contracts[0].symbol, "NVDA");
        assert_eq!(contracts[1].symbol, "MSFT");
        assert!(contracts.iter().all(|c| c.is_pipeline_eligible()));
    }
}
