// =============================================================================
// Replayer — Deterministic reconstruction from recorded streams
// =============================================================================
//
// Reads the depth and tape capture files, merges them in receipt-time order,
// and drives the exact same `apply_depth` / `record_trade` / coordinator
// calls the live path uses. The clock is the recorded receipt timestamp and
// the decision-id generator is seeded, so identical inputs plus identical
// config produce a byte-identical journal. This is the primary debugging
// substrate.
// =============================================================================

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use tracing::{info, warn};

use crate::journal::Journal;
use crate::market_data::{BookDirectory, BookParams};
use crate::metrics::MetricsEngine;
use crate::runtime_config::RuntimeConfig;
use crate::signals::{CoordinatorEvent, DecisionIds, SignalCoordinator};
use crate::types::{DepthUpdate, TradePrint};

/// One recorded event in the merged stream.
#[derive(Debug, Clone)]
pub enum ReplayEvent {
    Depth(DepthUpdate),
    Tape(TradePrint),
}

impl ReplayEvent {
    pub fn recv_ts_ms(&self) -> i64 {
        match self {
            Self::Depth(d) => d.recv_ts_ms,
            Self::Tape(t) => t.recv_ts_ms,
        }
    }

    pub fn symbol(&self) -> &str {
        match self {
            Self::Depth(d) => &d.symbol,
            Self::Tape(t) => &t.symbol,
        }
    }
}

/// Totals from one replay run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReplayStats {
    pub depth_events: usize,
    pub tape_events: usize,
    pub skipped_lines: usize,
    pub accepted: usize,
    pub rejected: usize,
    /// Final per-symbol book digests, for cross-run comparison.
    pub fingerprints: std::collections::BTreeMap<String, u64>,
}

/// Parse one capture file, skipping unparseable lines with a warning.
fn load_lines<T: serde::de::DeserializeOwned>(path: &Path) -> Result<(Vec<T>, usize)> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read capture file {}", path.display()))?;
    let mut records = Vec::new();
    let mut skipped = 0usize;
    for (idx, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<T>(line) {
            Ok(record) => records.push(record),
            Err(e) => {
                warn!(path = %path.display(), line = idx + 1, error = %e, "bad capture line skipped");
                skipped += 1;
            }
        }
    }
    Ok((records, skipped))
}

/// Merge the two streams by receipt time. Ties resolve depth-first, then by
/// original file order, so the merge itself is deterministic.
pub fn merge_streams(depth: Vec<DepthUpdate>, tape: Vec<TradePrint>) -> Vec<ReplayEvent> {
    let mut merged = Vec::with_capacity(depth.len() + tape.len());
    let mut depth_iter = depth.into_iter().peekable();
    let mut tape_iter = tape.into_iter().peekable();

    loop {
        let take_depth = match (depth_iter.peek(), tape_iter.peek()) {
            (Some(d), Some(t)) => d.recv_ts_ms <= t.recv_ts_ms,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => break,
        };
        if take_depth {
            if let Some(d) = depth_iter.next() {
                merged.push(ReplayEvent::Depth(d));
            }
        } else if let Some(t) = tape_iter.next() {
            merged.push(ReplayEvent::Tape(t));
        }
    }
    merged
}

/// Deterministic session id derived from the replay seed, so even the
/// journal's SessionId field is identical across runs.
fn seeded_session_id(seed: u64) -> String {
    let mut rng = ChaCha8Rng::seed_from_u64(seed ^ 0x5e55_1d00);
    let mut bytes = [0u8; 16];
    rng.fill_bytes(&mut bytes);
    uuid::Builder::from_random_bytes(bytes).into_uuid().to_string()
}

/// Replay a merged stream into a fresh engine, writing the journal at
/// `journal_path`.
pub fn run_stream(
    cfg: &RuntimeConfig,
    events: &[ReplayEvent],
    journal_path: &Path,
) -> Result<ReplayStats> {
    let journal = Arc::new(Journal::open(
        journal_path,
        seeded_session_id(cfg.replay.seed),
    )?);
    let books = Arc::new(BookDirectory::new(BookParams {
        max_depth: cfg.market_data.depth_rows,
        stale_window_ms: cfg.book.stale_window_ms,
        tape_window_ms: cfg.tape.window_ms,
    }));
    let metrics = Arc::new(MetricsEngine::new(cfg.signals.imbalance_levels));
    let coordinator = SignalCoordinator::new(
        cfg.clone(),
        books.clone(),
        metrics,
        journal,
        DecisionIds::seeded(cfg.replay.seed),
    );

    let mut stats = ReplayStats::default();
    let mut last_ts = 0i64;

    for event in events {
        let now_ms = event.recv_ts_ms();
        last_ts = now_ms;
        match event {
            ReplayEvent::Depth(update) => {
                stats.depth_events += 1;
                if books.apply_depth(update).is_err() {
                    stats.skipped_lines += 1;
                }
            }
            ReplayEvent::Tape(print) => {
                stats.tape_events += 1;
                books.record_trade(
                    &print.symbol,
                    print.event_ts_ms,
                    print.recv_ts_ms,
                    print.price,
                    print.size,
                );
            }
        }

        // Every replayed symbol is treated as active: the live subscription
        // gates do not apply to recorded data.
        let outcomes = coordinator.process_snapshot(event.symbol(), now_ms, true);
        tally(&mut stats, &outcomes);
    }

    // Close out a partially filled rank-window bucket.
    let outcomes = coordinator.flush_rank_window(last_ts);
    tally(&mut stats, &outcomes);

    for symbol in books.symbols() {
        if let Some(fp) = books.fingerprint(&symbol) {
            stats.fingerprints.insert(symbol, fp);
        }
    }

    Ok(stats)
}

fn tally(stats: &mut ReplayStats, outcomes: &[CoordinatorEvent]) {
    for outcome in outcomes {
        match outcome {
            CoordinatorEvent::Accepted(_) => stats.accepted += 1,
            CoordinatorEvent::Rejected { .. } => stats.rejected += 1,
        }
    }
}

/// Run replay mode from the configured capture files.
pub fn run(cfg: RuntimeConfig) -> i32 {
    let (Some(depth_file), Some(tape_file)) = (
        cfg.replay.depth_file.clone(),
        cfg.replay.tape_file.clone(),
    ) else {
        eprintln!("replay mode requires replay.depth_file and replay.tape_file");
        return 1;
    };

    let result = (|| -> Result<ReplayStats> {
        let (depth, depth_skipped) = load_lines::<DepthUpdate>(Path::new(&depth_file))?;
        let (tape, tape_skipped) = load_lines::<TradePrint>(Path::new(&tape_file))?;
        let events = merge_streams(depth, tape);
        info!(
            events = events.len(),
            depth_skipped, tape_skipped, "replaying recorded streams"
        );
        let mut stats = run_stream(&cfg, &events, Path::new(&cfg.journal.file_path))?;
        stats.skipped_lines += depth_skipped + tape_skipped;
        Ok(stats)
    })();

    match result {
        Ok(stats) => {
            match serde_json::to_string_pretty(&stats) {
                Ok(summary) => println!("{summary}"),
                Err(e) => warn!(error = %e, "failed to render replay summary"),
            }
            0
        }
        Err(e) => {
            tracing::error!(error = %e, "replay failed");
            1
        }
    }
}
