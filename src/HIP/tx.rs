// Transmit path: frame -> mbulk -> FH_CTRL / FH_DAT -> peer interrupt.

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::{Relaxed, SeqCst};

use log::error;

use super::checksum::fixup_l4_checksum;
use super::collab::WakeReason;
use super::policy::hip_dbg;
use super::stats::Direction;
use super::transport::HipInner;
use crate::error::{HipError, HipResult};
use crate::Core::mbulk::{
    round_up, Buffer, Colour, MbulkClass, MBULK_F_OBOUND, MBULK_POOL_ID_CTRL, MBULK_POOL_ID_DATA,
    MBULK_SIG_ALIGN,
};
use crate::HIP::Buffer::QueueId;
use crate::HIP::Structs::{Frame, FW_HEADER_OFFSET};

/// Lay `frame` out in `buf`: the signal behind the firmware prefix in the
/// head segment, then the payload across the data areas in order.
pub fn write_frame(buf: &Buffer, frame: &Frame, headroom: usize) -> HipResult<()> {
    let head = buf.head();
    let sig_len = frame.signal.len();
    let area = head.signal_mut();
    if sig_len > u16::MAX as usize || area.len() < FW_HEADER_OFFSET + sig_len {
        return Err(HipError::InvalidArgument(format!(
            "{} byte signal does not fit a {} byte signal area",
            sig_len,
            area.len()
        )));
    }
    area[0..2].copy_from_slice(&(sig_len as u16).to_le_bytes());
    area[2..FW_HEADER_OFFSET].fill(0);
    area[FW_HEADER_OFFSET..FW_HEADER_OFFSET + sig_len].copy_from_slice(&frame.signal);

    if frame.fragments.is_empty() {
        return Ok(());
    }
    if headroom > 0 && !head.reserve_head(headroom) {
        return Err(HipError::NoSpace("segment too small for headroom"));
    }
    let copied = if frame.csum_partial {
        let mut payload = frame.payload();
        fixup_l4_checksum(&mut payload);
        buf.append(&payload)
    } else {
        frame.fragments.iter().all(|frag| buf.append(frag))
    };
    if !copied {
        return Err(HipError::NoSpace("payload larger than buffer"));
    }
    Ok(())
}

/// Counts a transmit for as long as it runs, so teardown can wait it out.
struct InflightGuard<'a>(&'a AtomicUsize);

impl<'a> InflightGuard<'a> {
    fn enter(count: &'a AtomicUsize) -> Self {
        count.fetch_add(1, SeqCst);
        Self(count)
    }
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, SeqCst);
    }
}

impl HipInner {
    pub(crate) fn transmit(&self, frame: Frame, is_control: bool, vif: u8, peer: u8, ac: u8) -> HipResult<()> {
        let _inflight = InflightGuard::enter(&self.inflight_tx);
        if self.closing.load(SeqCst) || !self.started.load(SeqCst) {
            return Err(HipError::Closing);
        }

        let (pool_id, clas, q) = if is_control {
            (MBULK_POOL_ID_CTRL, MbulkClass::FromHostCtl, QueueId::FhCtrl)
        } else {
            (MBULK_POOL_ID_DATA, MbulkClass::FromHostDat, QueueId::FhDat)
        };
        let colour = if is_control {
            Colour::default()
        } else {
            Colour::new(vif, peer, ac)
        };

        let sig_len = FW_HEADER_OFFSET + frame.signal.len();
        let payload_len = frame.payload_len();
        let (headroom, dat_bufsz) = if payload_len == 0 {
            (0, 0)
        } else {
            let headroom = self.unidat_headroom.load(Relaxed);
            (headroom, payload_len + headroom + self.unidat_tailroom.load(Relaxed))
        };

        let Some(buf) = self.alloc_tx(pool_id, clas, colour, sig_len, dat_bufsz) else {
            self.stats.tx_no_space.fetch_add(1, Relaxed);
            hip_dbg!(self.policy, "hip: no buffer for {} byte {} frame", payload_len, q);
            return Err(HipError::NoSpace("no free segment"));
        };
        if let Err(e) = write_frame(&buf, &frame, headroom) {
            self.allocator.free_buffer(buf);
            return Err(e);
        }
        let head = buf.head();
        head.set_flags(MBULK_F_OBOUND);

        let r = match self.region.ptr_to_ref(head.as_ptr()) {
            Ok(r) => r,
            Err(e) => {
                error!("hip: tx buffer {:p} not in region: {}", head.as_ptr(), e);
                self.allocator.free_buffer(buf);
                return Err(e);
            }
        };
        if let Err(e) = self.queues.enqueue(q, r) {
            self.allocator.free_buffer(buf);
            self.stats.tx_no_space.fetch_add(1, Relaxed);
            return Err(e);
        }

        let id = frame.signal_id();
        self.stats.history.lock().add(Direction::FromHost, id);
        self.stats.count_frame(q.index());
        self.collab.power.wake_hold(WakeReason::Tx, self.config.wake_timeout);
        hip_dbg!(
            self.policy,
            "hip: tx signal {:#06x} on {} as {:?} ({} byte payload)",
            id,
            q,
            r,
            payload_len
        );
        self.mif.raise_fromhost(self.irq.fh);
        Ok(())
    }

    fn alloc_tx(&self, pool_id: u8, clas: MbulkClass, colour: Colour, sig_len: usize, dat_bufsz: usize) -> Option<Buffer> {
        let seg_size = self.allocator.seg_size(pool_id)?;
        if round_up(sig_len, MBULK_SIG_ALIGN) + dat_bufsz <= seg_size {
            return self
                .allocator
                .alloc(pool_id, clas, colour, sig_len, dat_bufsz)
                .map(Buffer::Single);
        }
        if self.config.tx_allow_chain && dat_bufsz > 0 {
            return self.allocator.alloc_chain(pool_id, clas, colour, sig_len, dat_bufsz);
        }
        None
    }

    /// Free segments left in the control pool.
    pub(crate) fn free_ctrl_slots(&self) -> usize {
        self.allocator.free_count(MBULK_POOL_ID_CTRL).unwrap_or(0)
    }

    pub(crate) fn host_buffers_outstanding(&self) -> usize {
        [MBULK_POOL_ID_DATA, MBULK_POOL_ID_CTRL]
            .iter()
            .filter_map(|&pid| self.allocator.in_use(pid))
            .sum()
    }
}
