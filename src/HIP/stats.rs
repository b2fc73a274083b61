// Counters for operational tooling. Nothing in the transport reads these
// back to make decisions.

use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::Buffer::layout::MIF_HIP_CFG_Q_NUM;

pub const MAX_HISTORY_RECORDS: usize = 32;

/// Bottom-half scheduling latency buckets, upper bounds in nanoseconds.
pub const LATENCY_BUCKETS_NS: [u64; 5] = [1_000, 10_000, 100_000, 1_000_000, 10_000_000];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    FromHost,
    ToHost,
}

#[derive(Debug, Clone, Copy)]
pub struct HistoryRecord {
    pub dir: Direction,
    pub signal: u16,
    pub cnt: u32,
    pub last_time: Instant,
}

/// Ring of the last signals seen. Repeats of the same signal in the same
/// direction only bump the count.
#[derive(Debug)]
pub struct History {
    records: Vec<Option<HistoryRecord>>,
    cursor: usize,
}

impl History {
    fn new() -> Self {
        Self {
            records: vec![None; MAX_HISTORY_RECORDS],
            cursor: 0,
        }
    }

    pub fn add(&mut self, dir: Direction, signal: u16) {
        if let Some(rec) = self.records[self.cursor].as_mut() {
            if rec.signal == signal && rec.dir == dir {
                rec.cnt += 1;
                rec.last_time = Instant::now();
                return;
            }
        }
        self.cursor = (self.cursor + 1) & (MAX_HISTORY_RECORDS - 1);
        self.records[self.cursor] = Some(HistoryRecord {
            dir,
            signal,
            cnt: 1,
            last_time: Instant::now(),
        });
    }

    /// Oldest first.
    pub fn records(&self) -> Vec<HistoryRecord> {
        (1..=MAX_HISTORY_RECORDS)
            .filter_map(|i| self.records[(self.cursor + i) & (MAX_HISTORY_RECORDS - 1)])
            .collect()
    }
}

#[derive(Debug)]
pub struct HipStats {
    pub irqs: AtomicU64,
    pub spurious_irqs: AtomicU64,
    pub q_num_frames: [AtomicU64; MIF_HIP_CFG_Q_NUM],
    pub rx_dropped: AtomicU64,
    pub tx_no_space: AtomicU64,
    pub fb_retries: AtomicU64,
    pub fb_deferred: AtomicU64,
    pub backpressure_skips: AtomicU64,
    pub watchdog_recoveries: AtomicU64,
    pub irq_storms: AtomicU64,
    pub bh_latency: [AtomicU64; LATENCY_BUCKETS_NS.len() + 1],
    pub max_bh_latency_ns: AtomicU64,
    pub history: Mutex<History>,
}

impl Default for HipStats {
    fn default() -> Self {
        Self {
            irqs: AtomicU64::new(0),
            spurious_irqs: AtomicU64::new(0),
            q_num_frames: Default::default(),
            rx_dropped: AtomicU64::new(0),
            tx_no_space: AtomicU64::new(0),
            fb_retries: AtomicU64::new(0),
            fb_deferred: AtomicU64::new(0),
            backpressure_skips: AtomicU64::new(0),
            watchdog_recoveries: AtomicU64::new(0),
            irq_storms: AtomicU64::new(0),
            bh_latency: Default::default(),
            max_bh_latency_ns: AtomicU64::new(0),
            history: Mutex::new(History::new()),
        }
    }
}

/// Point-in-time copy of [`HipStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub irqs: u64,
    pub spurious_irqs: u64,
    pub q_num_frames: [u64; MIF_HIP_CFG_Q_NUM],
    pub rx_dropped: u64,
    pub tx_no_space: u64,
    pub fb_retries: u64,
    pub fb_deferred: u64,
    pub backpressure_skips: u64,
    pub watchdog_recoveries: u64,
    pub irq_storms: u64,
    pub bh_latency: [u64; LATENCY_BUCKETS_NS.len() + 1],
    pub max_bh_latency_ns: u64,
}

impl HipStats {
    pub fn count_frame(&self, q: usize) {
        if let Some(c) = self.q_num_frames.get(q) {
            c.fetch_add(1, Relaxed);
        }
    }

    pub fn record_latency(&self, latency: Duration) {
        let ns = latency.as_nanos().min(u64::MAX as u128) as u64;
        let bucket = LATENCY_BUCKETS_NS
            .iter()
            .position(|&limit| ns <= limit)
            .unwrap_or(LATENCY_BUCKETS_NS.len());
        self.bh_latency[bucket].fetch_add(1, Relaxed);
        self.max_bh_latency_ns.fetch_max(ns, Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |a: &AtomicU64| a.load(Relaxed);
        StatsSnapshot {
            irqs: load(&self.irqs),
            spurious_irqs: load(&self.spurious_irqs),
            q_num_frames: std::array::from_fn(|i| load(&self.q_num_frames[i])),
            rx_dropped: load(&self.rx_dropped),
            tx_no_space: load(&self.tx_no_space),
            fb_retries: load(&self.fb_retries),
            fb_deferred: load(&self.fb_deferred),
            backpressure_skips: load(&self.backpressure_skips),
            watchdog_recoveries: load(&self.watchdog_recoveries),
            irq_storms: load(&self.irq_storms),
            bh_latency: std::array::from_fn(|i| load(&self.bh_latency[i])),
            max_bh_latency_ns: load(&self.max_bh_latency_ns),
        }
    }
}
