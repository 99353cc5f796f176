// =============================================================================
// Decision Journal — Append-only JSON-lines event log
// =============================================================================
//
// One JSON object per line, UTF-8, LF terminated, flushed after every entry
// so a crash never loses an acknowledged decision. Entries carry the session
// id and a schema version; schema changes bump the version.
//
// Rotation happens on UTC date change: the current file is renamed to
// `<name>-YYYYMMDD.jsonl` (appended if the target already exists) and a new
// file starts. Empty files are not rotated.
//
// A write failure is retried once; failing again marks the session
// journal-impaired and the engine keeps running. The journal must never take
// the process down during market hours.
// =============================================================================

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::market_data::order_book::BookLevel;
use crate::types::{Direction, ExitReason, TradeBlueprint, TradePrint};

/// Schema version stamped on decision entries.
pub const DECISION_SCHEMA_VERSION: u32 = 2;
/// Schema version of nested structures (universe updates, gate traces).
pub const NESTED_SCHEMA_VERSION: u32 = 1;

// =============================================================================
// Entry types
// =============================================================================

/// Format an epoch-ms timestamp as the journal's UTC timestamp string.
pub fn market_timestamp_utc(ts_ms: i64) -> String {
    Utc.timestamp_millis_opt(ts_ms)
        .single()
        .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
        .unwrap_or_else(|| format!("invalid-ms:{ts_ms}"))
}

/// Structured diagnostic attached to rejections for forensic analysis.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct GateTrace {
    pub schema_version: u32,
    pub now_ms: i64,
    pub last_trade_ms: Option<i64>,
    pub trades_in_warmup_window: usize,
    pub warmup_ok: bool,
    pub stale_age_ms: Option<i64>,
    pub depth_age_ms: Option<i64>,
    pub depth_levels_known: usize,
    pub thresholds: GateThresholds,
}

/// Snapshot of the thresholds in force when a gate fired.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct GateThresholds {
    pub max_spoof_score: f64,
    pub min_tape_acceleration: f64,
    pub min_wall_persistence_ms: i64,
    pub tape_stale_window_ms: i64,
    pub warmup_min_trades: usize,
    pub warmup_window_ms: i64,
}

/// Universe reconciliation summary, one per apply cycle.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct UniverseUpdateEntry {
    pub schema_version: u32,
    pub session_id: String,
    pub market_timestamp_utc: String,
    pub top_candidates: Vec<String>,
    pub eval_set: Vec<String>,
    pub exclusions: Vec<UniverseExclusion>,
    pub counts: UniverseCounts,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct UniverseExclusion {
    pub symbol: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct UniverseCounts {
    pub candidates: usize,
    pub active: usize,
    pub depth: usize,
    pub tbt: usize,
    pub tape: usize,
}

/// A candidate that did not produce a blueprint, with the concrete reason.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RejectionEntry {
    pub schema_version: u32,
    pub session_id: String,
    pub market_timestamp_utc: String,
    pub symbol: String,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gate_trace: Option<GateTrace>,
}

/// Depth + tape context captured at acceptance.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct AcceptanceContext {
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    pub spread: Option<f64>,
    pub mid: Option<f64>,
    pub recent_prints: Vec<TradePrint>,
}

/// An accepted signal with its synthesized blueprint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct AcceptanceEntry {
    pub schema_version: u32,
    pub session_id: String,
    pub market_timestamp_utc: String,
    pub decision_id: String,
    pub symbol: String,
    pub direction: Direction,
    pub confidence: f64,
    pub blueprint: TradeBlueprint,
    pub context: AcceptanceContext,
}

/// Closure of one evaluation window.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct EvaluationExitEntry {
    pub schema_version: u32,
    pub session_id: String,
    pub market_timestamp_utc: String,
    pub symbol: String,
    pub started_ts_ms: i64,
    pub ended_ts_ms: i64,
    pub duration_ms: i64,
    pub exit_reason: ExitReason,
    pub depth_minutes_consumed: f64,
}

/// Periodic liveness marker: the absence of decisions is itself observable.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct HeartbeatEntry {
    pub schema_version: u32,
    pub session_id: String,
    pub market_timestamp_utc: String,
    pub probe_count: usize,
    pub eval_count: usize,
    pub accepted_today: usize,
    pub journal_impaired: bool,
}

/// Every journal line is one of these, tagged by `EntryType`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "EntryType")]
pub enum JournalEntry {
    UniverseUpdate(UniverseUpdateEntry),
    Rejection(RejectionEntry),
    Acceptance(AcceptanceEntry),
    EvaluationExit(EvaluationExitEntry),
    Heartbeat(HeartbeatEntry),
}

// =============================================================================
// Writer
// =============================================================================

struct JournalInner {
    file: Option<File>,
    /// UTC day (YYYYMMDD) the open file belongs to.
    open_day: String,
    bytes_written: u64,
    impaired: bool,
}

/// Serialized append-only writer. All writes go through one mutex so the
/// journal stays strictly append-ordered across worker tasks.
pub struct Journal {
    path: PathBuf,
    session_id: String,
    inner: Mutex<JournalInner>,
}

impl Journal {
    /// Open (or create) the journal file, creating parent directories.
    pub fn open(path: impl AsRef<Path>, session_id: impl Into<String>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create journal directory {}", parent.display())
                })?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open journal at {}", path.display()))?;

        let bytes_written = file.metadata().map(|m| m.len()).unwrap_or(0);
        let session_id = session_id.into();

        info!(path = %path.display(), session_id = %session_id, "journal opened");

        Ok(Self {
            path,
            session_id,
            inner: Mutex::new(JournalInner {
                file: Some(file),
                open_day: utc_day_string(crate::types::now_ms()),
                bytes_written,
                impaired: false,
            }),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_impaired(&self) -> bool {
        self.inner.lock().impaired
    }

    /// Append one entry. `entry_ts_ms` drives rotation so that replay runs
    /// rotate on recorded time, not wall clock.
    pub fn write(&self, entry: &JournalEntry, entry_ts_ms: i64) {
        let line = match serde_json::to_string(entry) {
            Ok(line) => line,
            Err(e) => {
                error!(error = %e, "journal entry failed to serialise, dropped");
                return;
            }
        };

        let mut inner = self.inner.lock();
        self.rotate_if_needed(&mut inner, entry_ts_ms);

        if self.try_write_line(&mut inner, &line).is_err() {
            // Retry once with a freshly opened handle.
            inner.file = None;
            if self.try_write_line(&mut inner, &line).is_err() {
                if !inner.impaired {
                    inner.impaired = true;
                    error!(
                        path = %self.path.display(),
                        "journal write failed twice, session is journal-impaired"
                    );
                }
                return;
            }
        }
        inner.impaired = false;
    }

    fn try_write_line(&self, inner: &mut JournalInner, line: &str) -> std::io::Result<()> {
        let file = match inner.file.as_mut() {
            Some(file) => file,
            None => {
                let opened = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)?;
                inner.file.insert(opened)
            }
        };
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()?;
        inner.bytes_written += line.len() as u64 + 1;
        Ok(())
    }

    /// On a UTC date change, move the current file aside under the old day's
    /// suffix. Re-running on the same day appends-or-noops, never duplicates.
    fn rotate_if_needed(&self, inner: &mut JournalInner, entry_ts_ms: i64) {
        let today = utc_day_string(entry_ts_ms);
        if today == inner.open_day {
            return;
        }

        if inner.bytes_written == 0 {
            // Nothing to preserve.
            inner.open_day = today;
            return;
        }

        let rotated = self.rotated_path(&inner.open_day);
        inner.file = None;

        let result = if rotated.exists() {
            append_file(&self.path, &rotated).and_then(|_| {
                std::fs::remove_file(&self.path)
                    .with_context(|| format!("failed to remove {}", self.path.display()))
            })
        } else {
            std::fs::rename(&self.path, &rotated).with_context(|| {
                format!(
                    "failed to rotate {} to {}",
                    self.path.display(),
                    rotated.display()
                )
            })
        };

        match result {
            Ok(()) => {
                info!(rotated = %rotated.display(), "journal rotated");
                inner.open_day = today;
                inner.bytes_written = 0;
            }
            Err(e) => {
                warn!(error = %e, "journal rotation failed, continuing on current file");
                inner.open_day = today;
            }
        }
    }

    fn rotated_path(&self, day: &str) -> PathBuf {
        let stem = self
            .path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("journal");
        let ext = self
            .path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or("jsonl");
        self.path.with_file_name(format!("{stem}-{day}.{ext}"))
    }
}

fn utc_day_string(ts_ms: i64) -> String {
    Utc.timestamp_millis_opt(ts_ms)
        .single()
        .map(|dt| dt.format("%Y%m%d").to_string())
        .unwrap_or_else(|| "00000000".to_string())
}

fn append_file(from: &Path, to: &Path) -> Result<()> {
    let content = std::fs::read(from)
        .with_context(|| format!("failed to read {} for rotation", from.display()))?;
    let mut target = OpenOptions::new()
        .append(true)
        .open(to)
        .with_context(|| format!("failed to open {} for rotation append", to.display()))?;
    target
        .write_all(&content)
        .with_context(|| format!("failed to append into {}", to.display()))?;
    Ok(())
}

// =============================================================================
// Heartbeat task
// =============================================================================

/// Counters sampled into each heartbeat.
pub trait HeartbeatSource: Send + Sync {
    fn probe_count(&self) -> usize;
    fn eval_count(&self) -> usize;
    fn accepted_today(&self) -> usize;
}

/// Emit a heartbeat every `interval_seconds` until cancelled.
pub async fn run_heartbeat(
    journal: std::sync::Arc<Journal>,
    source: std::sync::Arc<dyn HeartbeatSource>,
    interval_seconds: u64,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(tokio::time::Duration::from_secs(
        interval_seconds.max(1),
    ));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = crate::types::now_ms();
                let entry = JournalEntry::Heartbeat(HeartbeatEntry {
                    schema_version: DECISION_SCHEMA_VERSION,
                    session_id: journal.session_id().to_string(),
                    market_timestamp_utc: market_timestamp_utc(now),
                    probe_count: source.probe_count(),
                    eval_count: source.eval_count(),
                    accepted_today: source.accepted_today(),
                    journal_impaired: journal.is_impaired(),
                });
                journal.write(&entry, now);
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}
