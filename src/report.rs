// =============================================================================
// Report — Journal rollup
// =============================================================================
//
// Report mode reads a decision journal and prints an aggregate JSON rollup:
// entry counts, acceptances by symbol and direction, rejection reasons, and
// evaluation exit reasons. The journal stays the source of truth; this is a
// read-only view over it.
// =============================================================================

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::warn;

/// Aggregates over one journal file.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReportRollup {
    pub total_lines: usize,
    pub bad_lines: usize,
    pub entries_by_type: BTreeMap<String, usize>,
    pub acceptances_by_symbol: BTreeMap<String, usize>,
    pub acceptances_by_direction: BTreeMap<String, usize>,
    pub rejections_by_reason: BTreeMap<String, usize>,
    pub evaluation_exits_by_reason: BTreeMap<String, usize>,
    pub sessions_seen: usize,
    pub first_timestamp_utc: Option<String>,
    pub last_timestamp_utc: Option<String>,
}

/// Build the rollup from journal lines.
pub fn build_rollup<'a>(lines: impl Iterator<Item = &'a str>) -> ReportRollup {
    let mut rollup = ReportRollup::default();
    let mut sessions = std::collections::BTreeSet::new();

    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        rollup.total_lines += 1;

        let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
            rollup.bad_lines += 1;
            continue;
        };
        let Some(entry_type) = value["EntryType"].as_str() else {
            rollup.bad_lines += 1;
            continue;
        };

        *rollup
            .entries_by_type
            .entry(entry_type.to_string())
            .or_insert(0) += 1;

        if let Some(session) = value["SessionId"].as_str() {
            sessions.insert(session.to_string());
        }
        if let Some(ts) = value["MarketTimestampUtc"].as_str() {
            if rollup.first_timestamp_utc.is_none() {
                rollup.first_timestamp_utc = Some(ts.to_string());
            }
            rollup.last_timestamp_utc = Some(ts.to_string());
        }

        match entry_type {
            "Acceptance" => {
                if let Some(symbol) = value["Symbol"].as_str() {
                    *rollup
                        .acceptances_by_symbol
                        .entry(symbol.to_string())
                        .or_insert(0) += 1;
                }
                if let Some(direction) = value["Direction"].as_str() {
                    *rollup
                        .acceptances_by_direction
                        .entry(direction.to_string())
                        .or_insert(0) += 1;
                }
            }
            "Rejection" => {
                if let Some(reason) = value["Reason"].as_str() {
                    *rollup
                        .rejections_by_reason
                        .entry(reason.to_string())
                        .or_insert(0) += 1;
                }
            }
            "EvaluationExit" => {
                if let Some(reason) = value["ExitReason"].as_str() {
                    *rollup
                        .evaluation_exits_by_reason
                        .entry(reason.to_string())
                        .or_insert(0) += 1;
                }
            }
            _ => {}
        }
    }

    rollup.sessions_seen = sessions.len();
    rollup
}

/// Read and aggregate a journal file.
pub fn rollup_file(path: impl AsRef<Path>) -> Result<ReportRollup> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read journal {}", path.display()))?;
    Ok(build_rollup(content.lines()))
}

/// Run report mode against the configured journal path.
pub fn run(journal_path: &str) -> i32 {
    match rollup_file(journal_path) {
        Ok(rollup) => {
            match serde_json::to_string_pretty(&rollup) {
                Ok(text) => println!("{text}"),
                Err(e) => {
                    warn!(error = %e, "failed to render rollup");
                    return 1;
                }
            }
            0
        }
        Err(e) => {
            tracing::error!(error = %e, "report failed");
            1
        }
    }
}
