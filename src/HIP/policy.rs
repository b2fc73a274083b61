// Throughput-driven tuning: QoS level requests and verbose logging.

use std::sync::atomic::{AtomicBool, Ordering};

use log::info;
use parking_lot::Mutex;

use super::collab::{PowerPolicy, QosLevel};

/// Per-frame debug logging that is switched off while throughput is high.
///
/// `$policy` is anything with a `verbose()` method, normally a [`FlowPolicy`].
macro_rules! hip_dbg {
    ($policy:expr, $($arg:tt)+) => {
        if $policy.verbose() {
            log::debug!($($arg)+);
        }
    };
}
pub(crate) use hip_dbg;

#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    pub med_bps: u64,
    pub max_bps: u64,
    pub logging_bps: u64,
}

#[derive(Debug)]
pub struct FlowPolicy {
    thresholds: Thresholds,
    verbose: AtomicBool,
    level: Mutex<QosLevel>,
}

impl FlowPolicy {
    pub fn new(thresholds: Thresholds) -> Self {
        Self {
            thresholds,
            verbose: AtomicBool::new(true),
            level: Mutex::new(QosLevel::Disabled),
        }
    }

    #[inline]
    pub fn verbose(&self) -> bool {
        self.verbose.load(Ordering::Relaxed)
    }

    pub fn level(&self) -> QosLevel {
        *self.level.lock()
    }

    pub fn level_for(&self, bps: u64) -> QosLevel {
        if bps > self.thresholds.max_bps {
            QosLevel::Max
        } else if bps > self.thresholds.med_bps {
            QosLevel::Medium
        } else {
            QosLevel::Disabled
        }
    }

    /// Feed one throughput sample. The power collaborator only hears about
    /// level changes.
    pub fn on_throughput(&self, tx_bps: u64, rx_bps: u64, power: &dyn PowerPolicy) {
        let total = tx_bps.saturating_add(rx_bps);

        let verbose = total <= self.thresholds.logging_bps;
        if self.verbose.swap(verbose, Ordering::Relaxed) != verbose {
            info!(
                "hip: verbose logging {} at {} bps",
                if verbose { "enabled" } else { "disabled" },
                total
            );
        }

        let next = self.level_for(total);
        let changed = {
            let mut level = self.level.lock();
            let changed = *level != next;
            *level = next;
            changed
        };
        if changed {
            info!("hip: QoS level {:?} (tx {} rx {} bps)", next, tx_bps, rx_bps);
            power.request_level(next);
        }
    }
}
