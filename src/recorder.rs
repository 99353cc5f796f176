// =============================================================================
// Recorder — Raw depth + tape capture for offline replay
// =============================================================================
//
// Record mode subscribes a single configured symbol and writes every raw
// event to two line-delimited JSON streams:
//
//   depth-<date>-<time>.jsonl   one line per depth update
//   tape-<date>-<time>.jsonl    one line per trade print
//
// Receipt timestamps are captured at message arrival and written verbatim;
// the decision-emission path is not exercised in this mode.
// =============================================================================

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::feed::{self, normalize_event_ts, BrokerRequests, FeedEvent};
use crate::runtime_config::RuntimeConfig;
use crate::subscription::manager::SMART_ROUTER;
use crate::types::{DepthOp, DepthUpdate, Side, TradePrint};

/// Fixed request-ids for the recording session's two streams.
const DEPTH_REQ_ID: i64 = 1;
const TAPE_REQ_ID: i64 = 2;

/// Writes the two capture streams, flushing per line.
pub struct RecordingWriter {
    symbol: String,
    depth_path: PathBuf,
    tape_path: PathBuf,
    depth_file: File,
    tape_file: File,
    depth_lines: u64,
    tape_lines: u64,
}

impl RecordingWriter {
    /// Create `depth-<stamp>.jsonl` and `tape-<stamp>.jsonl` under `dir`.
    pub fn create(dir: impl AsRef<Path>, symbol: &str, stamp: &str) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create recording dir {}", dir.display()))?;

        let depth_path = dir.join(format!("depth-{stamp}.jsonl"));
        let tape_path = dir.join(format!("tape-{stamp}.jsonl"));

        let open = |path: &Path| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open recording file {}", path.display()))
        };

        info!(
            symbol = %symbol,
            depth = %depth_path.display(),
            tape = %tape_path.display(),
            "recording started"
        );

        Ok(Self {
            symbol: symbol.to_string(),
            depth_file: open(&depth_path)?,
            tape_file: open(&tape_path)?,
            depth_path,
            tape_path,
            depth_lines: 0,
            tape_lines: 0,
        })
    }

    pub fn depth_path(&self) -> &Path {
        &self.depth_path
    }

    pub fn tape_path(&self) -> &Path {
        &self.tape_path
    }

    pub fn write_depth(&mut self, update: &DepthUpdate) -> Result<()> {
        let line = serde_json::to_string(update).context("failed to serialise depth record")?;
        self.depth_file.write_all(line.as_bytes())?;
        self.depth_file.write_all(b"\n")?;
        self.depth_file.flush()?;
        self.depth_lines += 1;
        Ok(())
    }

    pub fn write_tape(&mut self, print: &TradePrint) -> Result<()> {
        let line = serde_json::to_string(print).context("failed to serialise tape record")?;
        self.tape_file.write_all(line.as_bytes())?;
        self.tape_file.write_all(b"\n")?;
        self.tape_file.flush()?;
        self.tape_lines += 1;
        Ok(())
    }

    pub fn counts(&self) -> (u64, u64) {
        (self.depth_lines, self.tape_lines)
    }

    /// Translate one raw feed event into the matching stream.
    pub fn capture(&mut self, event: &FeedEvent, cfg: &RuntimeConfig) -> Result<()> {
        match event {
            FeedEvent::Depth {
                req_id: DEPTH_REQ_ID,
                position,
                op_raw,
                side_raw,
                price,
                size,
                recv_ts_ms,
            } => {
                let (Some(op), Some(side)) =
                    (DepthOp::from_wire(*op_raw), Side::from_wire(*side_raw))
                else {
                    warn!(op_raw, side_raw, "invalid depth codes skipped in recording");
                    return Ok(());
                };
                self.write_depth(&DepthUpdate {
                    symbol: self.symbol.clone(),
                    side,
                    op,
                    position: *position,
                    price: *price,
                    size: *size,
                    recv_ts_ms: *recv_ts_ms,
                })
            }
            FeedEvent::Trade {
                req_id: TAPE_REQ_ID,
                event_ts_raw,
                price,
                size,
                recv_ts_ms,
            } => {
                let event_ts_ms = normalize_event_ts(*event_ts_raw, cfg.feed.tape_timestamp_unit);
                self.write_tape(&TradePrint {
                    symbol: self.symbol.clone(),
                    event_ts_ms,
                    recv_ts_ms: *recv_ts_ms,
                    price: *price,
                    size: *size,
                })
            }
            FeedEvent::Error {
                req_id,
                code,
                message,
            } => {
                warn!(req_id, code, message, "broker error during recording");
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// Run record mode until shutdown or disconnect. Exit code 2 when the bridge
/// connection cannot be established.
pub async fn run(cfg: RuntimeConfig, mut shutdown: tokio::sync::watch::Receiver<bool>) -> i32 {
    let Some(symbol) = cfg.record.symbol.clone() else {
        eprintln!("record mode requires record.symbol in the config");
        return 1;
    };
    let symbol = symbol.to_uppercase();

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let client = match feed::bridge::connect(&cfg.feed.bridge_addr, events_tx).await {
        Ok(client) => client,
        Err(e) => {
            tracing::error!(error = %e, "bridge connect failed");
            return 2;
        }
    };

    if let Err(e) = client
        .subscribe_depth(
            DEPTH_REQ_ID,
            &symbol,
            cfg.market_data.depth_rows,
            SMART_ROUTER,
        )
        .await
    {
        tracing::error!(error = %e, "depth subscribe failed");
        return 2;
    }
    if let Err(e) = client
        .subscribe_tbt(TAPE_REQ_ID, &symbol, "Last", SMART_ROUTER)
        .await
    {
        tracing::error!(error = %e, "tape subscribe failed");
        return 2;
    }

    let stamp = Utc::now().format("%Y%m%d-%H%M%S").to_string();
    let mut writer = match RecordingWriter::create(&cfg.record.output_dir, &symbol, &stamp) {
        Ok(writer) => writer,
        Err(e) => {
            tracing::error!(error = %e, "failed to open recording files");
            return 1;
        }
    };

    loop {
        tokio::select! {
            event = events_rx.recv() => {
                match event {
                    Some(FeedEvent::ConnectionClosed) | None => {
                        warn!("bridge connection closed, recording stops");
                        break;
                    }
                    Some(event) => {
                        if let Err(e) = writer.capture(&event, &cfg) {
                            tracing::error!(error = %e, "recording write failed");
                            break;
                        }
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    let (depth_lines, tape_lines) = writer.counts();
    info!(depth_lines, tape_lines, "recording finished");
    0
}
