use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use std::ptr::{addr_of, addr_of_mut};
use std::sync::atomic::{fence, AtomicU32, AtomicU8};
use std::sync::Arc;

use parking_lot::RwLock;

use super::layout::{HipConfigV4, HipConfigV5, HipControl, HipInit, MAX_NUM, Q_IDX_LAYOUT};
use super::Buffer::{HipQueues, Index, QueueId, QueueSide};
use crate::error::{HipError, HipResult};
use crate::Core::region::{MifRef, MifRegion};

const Q_MASK: u8 = (MAX_NUM - 1) as u8;

impl HipQueues {
    /// Create a view over the control block at offset 0 of `region`.
    pub fn new(region: Arc<MifRegion>, side: QueueSide) -> HipResult<Self> {
        if !region.contains(0, std::mem::size_of::<HipControl>()) {
            return Err(HipError::InvalidArgument(format!(
                "region of {} bytes cannot hold the {} byte control block",
                region.size(),
                std::mem::size_of::<HipControl>()
            )));
        }
        let control = unsafe { region.at::<HipControl>(0) } as *const HipControl;
        Ok(Self {
            region,
            control,
            side,
            rw_scoreboard: RwLock::new(()),
            producer: Default::default(),
        })
    }

    #[inline]
    pub fn control(&self) -> &HipControl {
        unsafe { &*self.control }
    }

    pub fn region(&self) -> &Arc<MifRegion> {
        &self.region
    }

    pub fn side(&self) -> QueueSide {
        self.side
    }

    #[inline]
    fn idx_cell(&self, q: QueueId, which: Index) -> &AtomicU8 {
        &self.control().scoreboard.idx[Q_IDX_LAYOUT[q.index()][which as usize]]
    }

    /// Read one scoreboard index, then an acquire fence so anything the
    /// writer published before it is visible.
    pub fn read_index(&self, q: QueueId, which: Index) -> u8 {
        let _guard = self.rw_scoreboard.read();
        let value = self.idx_cell(q, which).load(Relaxed);
        fence(Acquire);
        value
    }

    /// Publish one scoreboard index after a release fence, so array writes
    /// made before it are visible to the other side first.
    pub fn update_index(&self, q: QueueId, which: Index, value: u8) {
        let _guard = self.rw_scoreboard.write();
        fence(Release);
        self.idx_cell(q, which).store(value, Relaxed);
    }

    /// Clear every scoreboard index. Only used while nobody is running.
    pub fn reset_indices(&self) {
        let _guard = self.rw_scoreboard.write();
        for cell in self.control().scoreboard.idx.iter() {
            cell.store(0, Relaxed);
        }
        fence(Release);
    }

    fn check_owner(&self, q: QueueId, produce: bool) -> HipResult<()> {
        if self.side.produces(q) != produce {
            return Err(HipError::InvalidArgument(format!(
                "{:?} side does not {} {}",
                self.side,
                if produce { "produce into" } else { "consume from" },
                q
            )));
        }
        Ok(())
    }

    pub fn is_full(&self, q: QueueId) -> bool {
        let w = self.read_index(q, Index::Write);
        let r = self.read_index(q, Index::Read);
        r == (w.wrapping_add(1) & Q_MASK)
    }

    /// Entries published but not yet consumed.
    pub fn pending(&self, q: QueueId) -> usize {
        let w = self.read_index(q, Index::Write);
        let r = self.read_index(q, Index::Read);
        w.wrapping_sub(r) as usize
    }

    /// Append `r` to `q`. The caller raises the peer interrupt.
    pub fn enqueue(&self, q: QueueId, r: MifRef) -> HipResult<()> {
        self.check_owner(q, true)?;
        let _producer = self.producer[q.index()].lock();

        let w = self.read_index(q, Index::Write);
        let rd = self.read_index(q, Index::Read);
        if rd == (w.wrapping_add(1) & Q_MASK) {
            return Err(HipError::NoSpace("queue full"));
        }

        let queue = &self.control().q[q.index()];
        queue.array[w as usize].store(r.0, Relaxed);
        let next = w.wrapping_add(1) & Q_MASK;
        // update_index fences before publishing
        self.update_index(q, Index::Write, next);
        queue.idx_write.store(next, Relaxed);
        Ok(())
    }

    /// Take the oldest entry from `q`, or `None` when it is empty.
    pub fn dequeue(&self, q: QueueId) -> HipResult<Option<MifRef>> {
        self.check_owner(q, false)?;
        let r = self.read_index(q, Index::Read);
        let w = self.read_index(q, Index::Write);
        if r == w {
            return Ok(None);
        }
        let queue = &self.control().q[q.index()];
        let value = queue.array[r as usize].load(Relaxed);
        let next = r.wrapping_add(1) & Q_MASK;
        self.update_index(q, Index::Read, next);
        queue.idx_read.store(next, Relaxed);
        Ok(Some(MifRef(value)))
    }

    /// Look at the entry at `idx` without consuming it.
    pub fn peek(&self, q: QueueId, idx: u8) -> MifRef {
        let value = self.control().q[q.index()].array[idx as usize].load(Relaxed);
        fence(Acquire);
        MifRef(value)
    }

    /// `(write, read)` for every queue, for dumps.
    pub fn snapshot(&self) -> [(u8, u8); 6] {
        let mut out = [(0u8, 0u8); 6];
        for q in QueueId::ALL {
            out[q.index()] = (self.read_index(q, Index::Write), self.read_index(q, Index::Read));
        }
        out
    }

    // Records are packed and written by both sides, so they are only ever
    // copied in and out whole, never referenced.

    pub fn init_record(&self) -> HipInit {
        fence(Acquire);
        unsafe { addr_of!((*self.control).init).read_volatile() }
    }

    pub fn write_init_record(&self, init: HipInit) {
        unsafe { addr_of_mut!((*(self.control as *mut HipControl)).init).write_volatile(init) }
        fence(Release);
    }

    pub fn config_v4(&self) -> HipConfigV4 {
        fence(Acquire);
        unsafe { addr_of!((*self.control).config_v4.0).read_volatile() }
    }

    pub fn write_config_v4(&self, cfg: HipConfigV4) {
        unsafe { addr_of_mut!((*(self.control as *mut HipControl)).config_v4.0).write_volatile(cfg) }
        fence(Release);
    }

    pub fn config_v5(&self) -> HipConfigV5 {
        fence(Acquire);
        unsafe { addr_of!((*self.control).config_v5.0).read_volatile() }
    }

    pub fn write_config_v5(&self, cfg: HipConfigV5) {
        unsafe { addr_of_mut!((*(self.control as *mut HipControl)).config_v5.0).write_volatile(cfg) }
        fence(Release);
    }

    /// Scoreboard word `scb_index`, e.g. the SMAPPER mailbox.
    pub fn mailbox(&self, scb_index: u8) -> Option<&AtomicU32> {
        self.control().scoreboard.word(scb_index)
    }
}
