// =============================================================================
// Notifier — Best-effort delivery of accepted blueprints
// =============================================================================
//
// Delivery is an external concern; the pipeline only sees the `SignalSink`
// trait. The webhook sink posts a Discord-style embed and drops failures
// after logging them. Notification must never block or fail the decision
// path.
// =============================================================================

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, warn};

use crate::journal::AcceptanceEntry;
use crate::types::Direction;

/// Consumer of accepted signals.
pub trait SignalSink: Send + Sync {
    fn notify_acceptance(&self, entry: &AcceptanceEntry);
}

/// Sink that drops everything. Used in replay and when no webhook is set.
pub struct NullSink;

impl SignalSink for NullSink {
    fn notify_acceptance(&self, entry: &AcceptanceEntry) {
        debug!(symbol = %entry.symbol, "acceptance (no sink configured)");
    }
}

/// Discord-style webhook sink. Posts fire-and-forget from a spawned task.
pub struct DiscordWebhook {
    url: String,
    http: reqwest::Client,
}

impl DiscordWebhook {
    pub fn new(url: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            url: url.into(),
            http: reqwest::Client::new(),
        })
    }
}

impl SignalSink for DiscordWebhook {
    fn notify_acceptance(&self, entry: &AcceptanceEntry) {
        let payload = build_payload(entry);
        let url = self.url.clone();
        let http = self.http.clone();
        let symbol = entry.symbol.clone();
        tokio::spawn(async move {
            match http.post(&url).json(&payload).send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!(symbol = %symbol, "acceptance notified");
                }
                Ok(resp) => {
                    warn!(symbol = %symbol, status = %resp.status(), "webhook rejected notification");
                }
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "webhook delivery failed");
                }
            }
        });
    }
}

/// Shape the embed payload. Split out so the formatting is testable without
/// a network.
fn build_payload(entry: &AcceptanceEntry) -> serde_json::Value {
    let bp = &entry.blueprint;
    let color = match entry.direction {
        Direction::Buy => 0x2e_cc71,
        Direction::Sell => 0xe7_4c3c,
    };
    json!({
        "embeds": [{
            "title": format!("{} {} — confidence {:.0}", entry.direction, entry.symbol, entry.confidence),
            "color": color,
            "fields": [
                { "name": "Entry", "value": format!("{:.2}", bp.entry), "inline": true },
                { "name": "Stop", "value": format!("{:.2}", bp.stop), "inline": true },
                { "name": "Target", "value": format!("{:.2}", bp.target), "inline": true },
                { "name": "Shares", "value": bp.shares.to_string(), "inline": true },
                { "name": "Decision", "value": entry.decision_id.clone(), "inline": false },
            ],
            "timestamp": entry.market_timestamp_utc.clone(),
        }]
    })
}
