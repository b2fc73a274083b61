// Interrupt top halves and the matching completion step.
//
// A top half only records, masks and hands off. Everything else happens on
// the source's worker.

use std::sync::atomic::Ordering::{Relaxed, SeqCst};
use std::time::Duration;

use log::{trace, warn};

use super::collab::WakeReason;
use super::transport::HipInner;
use crate::HIP::Buffer::QueueId;

/// The three to-host interrupt sources the host drains.
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RxSource {
    /// Peer returning host buffers on FH_RFB
    Rfb = 0,
    Ctrl = 1,
    Data = 2,
}

impl RxSource {
    pub const ALL: [RxSource; 3] = [RxSource::Rfb, RxSource::Ctrl, RxSource::Data];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn queue(self) -> QueueId {
        match self {
            RxSource::Rfb => QueueId::FhRfb,
            RxSource::Ctrl => QueueId::ThCtrl,
            RxSource::Data => QueueId::ThDat,
        }
    }

    pub fn wake_reason(self) -> WakeReason {
        match self {
            RxSource::Rfb => WakeReason::Tx,
            RxSource::Ctrl => WakeReason::Ctrl,
            RxSource::Data => WakeReason::Data,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            RxSource::Rfb => "rfb",
            RxSource::Ctrl => "ctrl",
            RxSource::Data => "data",
        }
    }
}

impl HipInner {
    /// To-host interrupt for `src`. With a v5 peer every queue shares the
    /// control bit, so that bit schedules all three drains.
    pub(crate) fn top_half(&self, src: RxSource) {
        let bit = self.irq.th[src.index()];
        self.stats.irqs.fetch_add(1, Relaxed);

        if self.closing.load(SeqCst) {
            self.mif.mask(bit);
            self.mif.clear(bit);
            return;
        }

        let sources: &[RxSource] = if self.single_irq.load(Relaxed) && src == RxSource::Ctrl {
            &RxSource::ALL
        } else {
            std::slice::from_ref(&src)
        };

        for &s in sources {
            self.mark_pending(s);
        }

        if !self.watchdog.arm(self.config.watchdog_tick) {
            trace!("hip: watchdog already armed");
        }

        self.mif.mask(bit);
        self.mif.clear(bit);
        for &s in sources {
            self.workers[s.index()].kick();
        }
    }

    fn mark_pending(&self, src: RxSource) {
        self.intr_received[src.index()].store(self.now_ns(), SeqCst);
        self.collab
            .power
            .wake_hold(src.wake_reason(), self.config.wake_timeout);

        let storm = &self.storm_count[src.index()];
        if self.pending[src.index()].swap(true, SeqCst) {
            // Fired again before its drain started
            if storm.fetch_add(1, Relaxed) + 1 >= self.config.max_storm {
                storm.store(0, Relaxed);
                self.stats.irq_storms.fetch_add(1, Relaxed);
                warn!("hip: interrupt storm on {} source", src.name());
            }
        } else {
            storm.store(0, Relaxed);
        }
    }

    /// SMAPPER refill request from the peer.
    pub(crate) fn smapper_top_half(&self) {
        let Some(bit) = self.irq.smapper_req else {
            return;
        };
        self.stats.irqs.fetch_add(1, Relaxed);
        self.mif.mask(bit);
        self.mif.clear(bit);
        if !self.closing.load(SeqCst) {
            self.smapper_worker.kick();
        }
    }

    /// The to-host bit that actually signals `src`.
    pub(crate) fn line_bit(&self, src: RxSource) -> u32 {
        if self.single_irq.load(Relaxed) {
            self.irq.th[RxSource::Ctrl.index()]
        } else {
            self.irq.th[src.index()]
        }
    }

    /// End of a drain that caught up: let the source interrupt again.
    ///
    /// With a shared line only the control drain unmasks it; the other
    /// sources' own bits are never raised by a v5 peer.
    pub(crate) fn complete(&self, src: RxSource) {
        let bit = self.irq.th[src.index()];
        let owns_line = !self.single_irq.load(Relaxed) || src == RxSource::Ctrl;
        if !self.pending.iter().any(|p| p.load(SeqCst)) {
            self.watchdog.set_active(false);
        }

        if owns_line && !self.closing.load(SeqCst) {
            self.mif.unmask(bit);
            // A new interrupt re-masks the line but also marks it pending.
            // Masked without that means the unmask was lost, so leave it
            // for the watchdog.
            if self.mif.is_masked(bit) && !self.pending[src.index()].load(SeqCst) {
                warn!("hip: {} interrupt still masked after unmask", src.name());
                self.pending[src.index()].store(true, SeqCst);
                self.watchdog.arm(self.config.watchdog_tick);
            }
        }

        match src {
            RxSource::Rfb => {
                if self.host_buffers_outstanding() == 0 {
                    self.collab.power.wake_release(WakeReason::Tx);
                }
            }
            _ => self.collab.power.wake_release(src.wake_reason()),
        }
    }

    /// Time since the last interrupt for `src`, if it ever fired.
    pub(crate) fn interrupt_age(&self, src: RxSource) -> Option<Duration> {
        match self.intr_received[src.index()].load(SeqCst) {
            0 => None,
            at => Some(Duration::from_nanos(self.now_ns().saturating_sub(at))),
        }
    }

    #[inline]
    pub(crate) fn now_ns(&self) -> u64 {
        // 0 is reserved for "never", so count from one
        self.epoch.elapsed().as_nanos() as u64 + 1
    }
}
