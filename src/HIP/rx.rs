//! Bottom halves: draining the to-host queues and the return queue.
//!
//! Every consumed reference goes back to the peer on TH_RFB. If that queue
//! stays full past the retry budget the reference is parked in a backlog. The
//! next drain pushes it out first, and the watchdog keeps retrying while the
//! backlog is non-empty, so returns reach the peer even when no more traffic
//! arrives. [`Transport::flush_returns`] does the same on demand.
//!
//! [`Transport::flush_returns`]: super::transport::Transport::flush_returns

use std::sync::atomic::Ordering::{Relaxed, SeqCst};
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};

use super::irq::RxSource;
use super::policy::hip_dbg;
use super::stats::Direction;
use super::transport::HipInner;
use super::worker::{DrainOutcome, Policy};
use crate::error::{HipError, HipResult};
use crate::Core::mbulk::{Segment, MBULK_F_WAKEUP, MBULK_MAX_CHAIN, MBULK_POOL_ID_DATA};
use crate::Core::region::{MifRef, MifRegion};
use crate::HIP::Buffer::QueueId;
use crate::HIP::Structs::{Frame, FW_HEADER_OFFSET, MA_UNITDATA_IND};

/// Copy the signal out of a segment's signal area, dropping the firmware
/// prefix.
fn read_signal(seg: &Segment) -> HipResult<Vec<u8>> {
    if !seg.has_signal() {
        return Err(HipError::Malformed(format!("{:?} carries no signal", seg.mif_ref())));
    }
    let area = seg.signal();
    if area.len() < FW_HEADER_OFFSET {
        return Err(HipError::Malformed(format!(
            "{:?} signal area of {} bytes",
            seg.mif_ref(),
            area.len()
        )));
    }
    let len = u16::from_le_bytes([area[0], area[1]]) as usize;
    if FW_HEADER_OFFSET + len > area.len() {
        return Err(HipError::Malformed(format!(
            "{:?} declares a {} byte signal in a {} byte area",
            seg.mif_ref(),
            len,
            area.len() - FW_HEADER_OFFSET
        )));
    }
    Ok(area[FW_HEADER_OFFSET..FW_HEADER_OFFSET + len].to_vec())
}

/// Rebuild the frame that starts at `r`.
///
/// Also returns every reference that resolved to a segment, head first, so
/// the caller can hand them back whether or not the frame was usable.
pub fn frame_from_ref(region: &MifRegion, r: MifRef) -> (HipResult<Frame>, Vec<MifRef>) {
    let mut consumed = Vec::new();
    let head = match Segment::at(region, r) {
        Ok(seg) => seg,
        Err(e) => return (Err(e), consumed),
    };
    consumed.push(r);

    let signal = match read_signal(&head) {
        Ok(signal) => signal,
        Err(e) => return (Err(e), consumed),
    };

    let mut payload = head.data().to_vec();
    if head.is_chain_head() {
        let mut next = head.chain_next();
        while !next.is_null() {
            if consumed.len() >= MBULK_MAX_CHAIN {
                return (
                    Err(HipError::Malformed(format!(
                        "chain from {:?} longer than {} segments",
                        r, MBULK_MAX_CHAIN
                    ))),
                    consumed,
                );
            }
            let seg = match Segment::at(region, next) {
                Ok(seg) => seg,
                Err(e) => return (Err(e), consumed),
            };
            consumed.push(next);
            if !seg.is_chained() {
                return (
                    Err(HipError::Malformed(format!("{:?} linked from a chain but not chained", next))),
                    consumed,
                );
            }
            payload.extend_from_slice(seg.data());
            next = seg.chain_next();
        }
    }

    let frame = Frame {
        signal,
        fragments: if payload.is_empty() { Vec::new() } else { vec![payload] },
        csum_partial: false,
        wakeup: head.has_flag(MBULK_F_WAKEUP),
    };
    (Ok(frame), consumed)
}

impl HipInner {
    /// One wake-up of the worker for `src`.
    pub(crate) fn bottom_half(&self, src: RxSource, policy: Policy) -> DrainOutcome {
        let was_pending = self.pending[src.index()].swap(false, SeqCst);
        if was_pending {
            if let Some(age) = self.interrupt_age(src) {
                self.stats.record_latency(age);
            }
        }
        if self.closing.load(SeqCst) {
            return DrainOutcome::Done;
        }

        self.flush_returns();

        let count_spurious = |n: usize| {
            let shared = self.single_irq.load(Relaxed) && src != RxSource::Ctrl;
            if n == 0 && was_pending && !shared {
                self.stats.spurious_irqs.fetch_add(1, Relaxed);
            }
        };

        match src {
            RxSource::Rfb => {
                count_spurious(self.drain_rfb());
            }
            RxSource::Ctrl => {
                count_spurious(self.drain_to_host(src, usize::MAX));
            }
            RxSource::Data => {
                if self.backpressured() {
                    self.stats.backpressure_skips.fetch_add(1, Relaxed);
                    hip_dbg!(self.policy, "hip: downstream full, data queue skipped");
                    self.complete(src);
                    return DrainOutcome::Retrigger(self.config.backpressure_retrigger);
                }
                let budget = policy.budget();
                let done = self.drain_to_host(src, budget);
                count_spurious(done);
                if done >= budget && self.queues.pending(QueueId::ThDat) > 0 && !self.closing.load(SeqCst) {
                    // Line stays masked until the queue is caught up
                    return DrainOutcome::MoreWork;
                }
            }
        }
        self.complete(src);
        DrainOutcome::Done
    }

    fn backpressured(&self) -> bool {
        self.collab.downstream.pending_frames() > self.config.max_buffered_frames
    }

    /// Drain TH_CTRL or TH_DAT, at most `budget` entries.
    fn drain_to_host(&self, src: RxSource, budget: usize) -> usize {
        let q = src.queue();
        let is_control = src == RxSource::Ctrl;
        let delay = if is_control {
            self.config.fb_retry_delay_ctrl
        } else {
            self.config.fb_retry_delay_data
        };

        let mut done = 0;
        while done < budget && !self.closing.load(SeqCst) {
            let r = match self.queues.dequeue(q) {
                Ok(Some(r)) => r,
                Ok(None) => break,
                Err(e) => {
                    error!("hip: dequeue from {} failed: {}", q, e);
                    break;
                }
            };
            done += 1;
            self.stats.count_frame(q.index());

            let (frame, consumed) = frame_from_ref(&self.region, r);
            match frame.and_then(|f| self.resolve_smapper(f)) {
                Ok(frame) => self.deliver(frame, is_control),
                Err(e) => {
                    self.stats.rx_dropped.fetch_add(1, Relaxed);
                    error!("hip: dropping {:?} from {}: {}", r, q, e);
                    self.dump("malformed frame");
                }
            }
            self.return_refs(&consumed, delay);
        }
        done
    }

    /// Replace a SMAPPER descriptor signal with the payload it points at.
    fn resolve_smapper(&self, mut frame: Frame) -> HipResult<Frame> {
        let Some(smapper) = self.smapper.as_ref() else {
            return Ok(frame);
        };
        if !frame.fragments.is_empty() || frame.signal_id() != MA_UNITDATA_IND {
            return Ok(frame);
        }
        let Some(payload) = smapper.consume(&frame.signal)? else {
            return Ok(frame);
        };
        frame.fragments = vec![payload];
        Ok(frame)
    }

    fn deliver(&self, frame: Frame, is_control: bool) {
        let id = frame.signal_id();
        if frame.wakeup {
            info!("hip: woken by signal {:#06x}", id);
        }
        self.stats.history.lock().add(Direction::ToHost, id);
        hip_dbg!(
            self.policy,
            "hip: rx {} signal {:#06x}, {} byte payload",
            if is_control { "ctrl" } else { "data" },
            id,
            frame.payload_len()
        );
        if let Err(e) = self.collab.dispatch.dispatch(frame, is_control) {
            self.stats.rx_dropped.fetch_add(1, Relaxed);
            warn!("hip: dispatch of signal {:#06x} failed: {}", id, e);
            self.dump("dispatch failure");
        }
    }

    /// Hand consumed references back on TH_RFB, retrying while it is full.
    fn return_refs(&self, refs: &[MifRef], delay: Duration) {
        if refs.is_empty() {
            return;
        }
        self.flush_returns();

        let mut returned = false;
        let mut deferred = false;
        for &r in refs {
            // Behind an existing backlog the queue is known to be full
            let queued = self.return_backlog.lock().is_empty() && self.enqueue_return(r, delay);
            if queued {
                returned = true;
                continue;
            }
            self.stats.fb_deferred.fetch_add(1, Relaxed);
            self.return_backlog.lock().push_back(r);
            deferred = true;
            error!("hip: {} full, deferring return of {:?}", QueueId::ThRfb, r);
        }
        if returned {
            self.mif.raise_fromhost(self.irq.fh);
        }
        if deferred {
            // The backlog is retried on every expiry until it empties
            self.watchdog.arm(self.config.watchdog_tick);
        }
    }

    fn enqueue_return(&self, r: MifRef, delay: Duration) -> bool {
        let attempts = self.config.fb_retry_count;
        for attempt in 1..=attempts {
            match self.queues.enqueue(QueueId::ThRfb, r) {
                Ok(()) => return true,
                Err(HipError::NoSpace(_)) => {}
                Err(e) => {
                    error!("hip: returning {:?} failed: {}", r, e);
                    return false;
                }
            }
            if attempt == attempts || self.closing.load(SeqCst) {
                break;
            }
            self.stats.fb_retries.fetch_add(1, Relaxed);
            // Raise again so a peer that missed the last one drains TH_RFB
            self.mif.raise_fromhost(self.irq.fh);
            thread::sleep(delay);
        }
        false
    }

    /// Push deferred returns onto TH_RFB. Returns how many are still waiting.
    pub(crate) fn flush_returns(&self) -> usize {
        let (moved, left) = {
            let mut backlog = self.return_backlog.lock();
            let mut moved = 0;
            while let Some(&r) = backlog.front() {
                if self.queues.enqueue(QueueId::ThRfb, r).is_err() {
                    break;
                }
                backlog.pop_front();
                moved += 1;
            }
            (moved, backlog.len())
        };
        if moved > 0 {
            debug!("hip: flushed {} deferred returns, {} left", moved, left);
            self.mif.raise_fromhost(self.irq.fh);
        }
        left
    }

    /// Free host buffers the peer is done with.
    fn drain_rfb(&self) -> usize {
        let mut done = 0;
        while !self.closing.load(SeqCst) {
            let r = match self.queues.dequeue(QueueId::FhRfb) {
                Ok(Some(r)) => r,
                Ok(None) => break,
                Err(e) => {
                    error!("hip: dequeue from {} failed: {}", QueueId::FhRfb, e);
                    break;
                }
            };
            done += 1;
            self.stats.count_frame(QueueId::FhRfb.index());

            let seg = match self.allocator.lookup(r) {
                Ok(seg) => seg,
                Err(e) => {
                    error!("hip: peer returned {:?}: {}", r, e);
                    self.dump("bad return");
                    continue;
                }
            };
            if seg.is_free() {
                warn!("hip: peer returned {:?} which is already free", r);
                continue;
            }
            let first = seg.is_chain_head() || !seg.is_chained();
            if first && self.allocator.pool_of(r) == Some(MBULK_POOL_ID_DATA) {
                if let Some(colour) = self.allocator.get_colour(MBULK_POOL_ID_DATA, &seg) {
                    self.collab
                        .tx_completion
                        .tx_done(colour.vif(), colour.peer(), colour.ac());
                }
            }
            self.allocator.free(seg);
        }
        done
    }
}
