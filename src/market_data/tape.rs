// =============================================================================
// Tape Ring — Time-bounded buffer of trade prints
// =============================================================================
//
// Prints are keyed on local receipt time, which is authoritative for
// freshness. The exchange event timestamp is stored alongside for analytics
// but never used for gating: broker and exchange clocks are skewed.
// =============================================================================

use std::collections::VecDeque;

use serde::Serialize;

use crate::types::TradePrint;

/// Hard cap on retained prints, independent of the time window. Bounds memory
/// under bursty feeds.
const MAX_PRINTS: usize = 4096;

/// Aggregate view of the tape, computed at snapshot time.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TapeStats {
    /// Receipt timestamp of the most recent print, if any.
    pub last_recv_ms: Option<i64>,
    /// Last traded price.
    pub last_price: Option<f64>,
    /// Prints received in the most recent 1s.
    pub prints_1s: usize,
    /// Prints received in the 2s window immediately before that.
    pub prints_prior_2s: usize,
    /// Prints received within the warmup window.
    pub prints_in_warmup: usize,
    /// Total traded size executed at or below the bid over the delta window.
    pub traded_size_at_bid: f64,
    /// Total traded size executed at or above the ask over the delta window.
    pub traded_size_at_ask: f64,
}

impl TapeStats {
    /// Trades/sec ratio of the recent 1s against the prior 2s window.
    /// `None` when the prior window is empty (no baseline to compare).
    pub fn acceleration(&self) -> Option<f64> {
        if self.prints_prior_2s == 0 {
            return None;
        }
        let recent_rate = self.prints_1s as f64 / 1.0;
        let prior_rate = self.prints_prior_2s as f64 / 2.0;
        Some(recent_rate / prior_rate)
    }
}

/// Circular FIFO of trade prints bounded by a receipt-time window.
#[derive(Debug)]
pub struct TapeRing {
    window_ms: i64,
    prints: VecDeque<TradePrint>,
}

impl TapeRing {
    pub fn new(window_ms: i64) -> Self {
        Self {
            window_ms,
            prints: VecDeque::new(),
        }
    }

    /// Append a print and evict everything older than the window.
    pub fn record(&mut self, print: TradePrint) {
        let now = print.recv_ts_ms;
        self.prints.push_back(print);
        self.evict(now);
        while self.prints.len() > MAX_PRINTS {
            self.prints.pop_front();
        }
    }

    fn evict(&mut self, now_ms: i64) {
        let cutoff = now_ms - self.window_ms;
        while let Some(front) = self.prints.front() {
            if front.recv_ts_ms < cutoff {
                self.prints.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.prints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prints.is_empty()
    }

    pub fn last_recv_ms(&self) -> Option<i64> {
        self.prints.back().map(|p| p.recv_ts_ms)
    }

    /// The most recent `n` prints, oldest first. Used for journal context.
    pub fn recent(&self, n: usize) -> Vec<TradePrint> {
        let skip = self.prints.len().saturating_sub(n);
        self.prints.iter().skip(skip).cloned().collect()
    }

    /// Compute aggregate stats as of `now_ms`.
    ///
    /// Trades are attributed to a side against the current best quotes:
    /// executions at or below the bid are hitting the bid, at or above the
    /// ask are lifting the ask. `delta_window_ms` bounds the side-attribution
    /// sums; the warmup count uses `warmup_window_ms`.
    pub fn stats(
        &self,
        now_ms: i64,
        best_bid: Option<f64>,
        best_ask: Option<f64>,
        delta_window_ms: i64,
        warmup_window_ms: i64,
    ) -> TapeStats {
        let mut stats = TapeStats {
            last_recv_ms: self.last_recv_ms(),
            last_price: self.prints.back().map(|p| p.price),
            ..TapeStats::default()
        };

        let recent_cutoff = now_ms - 1_000;
        let prior_cutoff = now_ms - 3_000;
        let warmup_cutoff = now_ms - warmup_window_ms;
        let delta_cutoff = now_ms - delta_window_ms;

        for p in &self.prints {
            let ts = p.recv_ts_ms;
            if ts > now_ms {
                continue;
            }
            if ts >= recent_cutoff {
                stats.prints_1s += 1;
            } else if ts >= prior_cutoff {
                stats.prints_prior_2s += 1;
            }
            if ts >= warmup_cutoff {
                stats.prints_in_warmup += 1;
            }
            if ts >= delta_cutoff {
                if let Some(bid) = best_bid {
                    if p.price <= bid {
                        stats.traded_size_at_bid += p.size;
                    }
                }
                if let Some(ask) = best_ask {
                    if p.price >= ask {
                        stats.traded_size_at_ask += p.size;
                    }
                }
            }
        }

        stats
    }

    /// Order-sensitive FNV-1a fold over (recv_ts, price, size) of every
    /// retained print. Used by the replay fingerprint.
    pub fn fingerprint(&self) -> u64 {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        let mut mix = |bytes: &[u8]| {
            for b in bytes {
                hash ^= u64::from(*b);
                hash = hash.wrapping_mul(0x100_0000_01b3);
            }
        };
        for p in &self.prints {
            mix(&p.recv_ts_ms.to_le_bytes());
            mix(&p.price.to_bits().to_le_bytes());
            mix(&p.size.to_bits().to_le_bytes());
        }
        hash
    }
}
