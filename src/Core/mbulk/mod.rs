//! mbulk: fixed-size segment slabs carved out of the shared region.
//!
//! Each pool slices a contiguous area into `byte_per_block` sized segments.
//! The free list is a host-side index stack and the colour tag table is a
//! side vector, so nothing the peer can scribble on affects allocator state.
//! Segment headers still live in the region because the peer reads them.

use std::ptr::NonNull;
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::error::{HipError, HipResult};
use crate::Core::region::{MifRef, MifRegion};

mod debug;
mod getters;
mod pool;
pub mod segment;

use pool::MbulkPool;
pub use segment::{
    Buffer, MbulkHeader, Segment, MBULK_F_CHAIN, MBULK_F_CHAIN_HEAD, MBULK_F_FREE,
    MBULK_F_OBOUND, MBULK_F_READONLY, MBULK_F_SIG, MBULK_F_WAKEUP, MBULK_HEADER_SIZE,
};

/// Segment stride alignment.
pub const MBULK_ALIGN: usize = 64;

/// `header + signal` is rounded up to this, so data starts aligned.
pub const MBULK_SIG_ALIGN: usize = 16;

/// Request "all remaining room" for the data area.
pub const MBULK_DAT_BUFSZ_REQ_BEST_MAGIC: usize = u32::MAX as usize - 1;

/// Longest chain the allocator builds or the receive path follows.
pub const MBULK_MAX_CHAIN: usize = 16;

pub const MBULK_POOL_ID_DATA: u8 = 0;
pub const MBULK_POOL_ID_CTRL: u8 = 1;
/// Pool id used by the peer for its receive buffers.
pub const MBULK_POOL_ID_PEER: u8 = 2;
pub const MBULK_POOL_ID_MAX: usize = 4;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MbulkClass {
    Control = 0,
    HostIo = 1,
    Debug = 2,
    DebugCrit = 3,
    FromHostDat = 4,
    FromHostCtl = 5,
    FromRadio = 6,
    Dplp = 7,
    Others = 8,
    FromRadioForwarded = 9,
}

pub const MBULK_CLASS_MAX: usize = 10;

/// Round `value` up to a power-of-two `align`. Saturates instead of wrapping,
/// so an absurd size still compares as too large.
#[inline]
pub const fn round_up(value: usize, align: usize) -> usize {
    match checked_round_up(value, align) {
        Some(v) => v,
        None => usize::MAX & !(align - 1),
    }
}

#[inline]
pub const fn checked_round_up(value: usize, align: usize) -> Option<usize> {
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

/// Accounting tag recorded with every allocation: `(ac << 16) | (peer << 8) | vif`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Colour(pub u32);

impl Colour {
    pub fn new(vif: u8, peer: u8, ac: u8) -> Self {
        Colour(((ac as u32) << 16) | ((peer as u32) << 8) | vif as u32)
    }

    pub fn vif(self) -> u8 {
        (self.0 & 0xff) as u8
    }

    pub fn peer(self) -> u8 {
        ((self.0 >> 8) & 0xff) as u8
    }

    pub fn ac(self) -> u8 {
        ((self.0 >> 16) & 0xff) as u8
    }
}

/// Allocator over up to [`MBULK_POOL_ID_MAX`] pools in one region.
pub struct MbulkAllocator {
    region: Arc<MifRegion>,
    // Short critical sections only; nothing blocking happens under this lock
    pools: Mutex<[Option<MbulkPool>; MBULK_POOL_ID_MAX]>,
}

impl MbulkAllocator {
    pub fn new(region: Arc<MifRegion>) -> Self {
        Self {
            region,
            pools: Mutex::new(Default::default()),
        }
    }

    /// Slice `[base, base + size)` of the region into segments of `seg_size`
    /// usable bytes. Fails if `base` is not aligned or not even one segment fits.
    pub fn pool_add(&self, pool_id: u8, base: usize, size: usize, seg_size: usize, guard: u32) -> HipResult<()> {
        if pool_id as usize >= MBULK_POOL_ID_MAX {
            return Err(HipError::InvalidArgument(format!("pool id {} out of range", pool_id)));
        }
        if base % MBULK_ALIGN != 0 || (self.region.base() as usize) % MBULK_ALIGN != 0 {
            return Err(HipError::InvalidArgument(format!(
                "pool {} base {:#x} not {}-byte aligned",
                pool_id, base, MBULK_ALIGN
            )));
        }
        if base == 0 {
            return Err(HipError::InvalidArgument("pool cannot start at the null reference".into()));
        }
        if seg_size == 0 || seg_size > u16::MAX as usize {
            return Err(HipError::InvalidArgument(format!("segment size {} unsupported", seg_size)));
        }
        if !self.region.contains(base, size) {
            return Err(HipError::InvalidArgument(format!(
                "pool {} [{:#x}, +{:#x}) exceeds region",
                pool_id, base, size
            )));
        }

        let byte_per_block = round_up(MBULK_HEADER_SIZE + seg_size, MBULK_ALIGN);
        let seg_count = size / byte_per_block;
        if seg_count == 0 {
            return Err(HipError::InvalidArgument(format!(
                "pool {} of {} bytes cannot hold a {} byte segment",
                pool_id, size, byte_per_block
            )));
        }

        let pool = MbulkPool::new(base, seg_count as u32, seg_size, byte_per_block, guard);
        for index in 0..pool.tot_seg_num {
            let seg = self.segment_at(pool.offset_of(index), seg_size)?;
            seg.write_header(MbulkHeader {
                flag: MBULK_F_FREE,
                pid: pool_id,
                ..Default::default()
            });
        }

        let mut pools = self.pools.lock();
        if pools[pool_id as usize].is_some() {
            return Err(HipError::InvalidArgument(format!("pool {} already added", pool_id)));
        }
        debug!(
            "mbulk pool {}: base {:#x} {} segments x {} bytes (guard {})",
            pool_id, base, seg_count, byte_per_block, guard
        );
        pools[pool_id as usize] = Some(pool);
        Ok(())
    }

    /// Invalidate a pool. Outstanding segments are simply forgotten.
    pub fn pool_remove(&self, pool_id: u8) {
        if let Some(slot) = self.pools.lock().get_mut(pool_id as usize) {
            *slot = None;
        }
    }

    fn segment_at(&self, offset: usize, seg_size: usize) -> HipResult<Segment> {
        let ptr = self.region.ref_to_ptr(MifRef(offset as u32))? as *mut MbulkHeader;
        let hdr = NonNull::new(ptr).ok_or_else(|| HipError::Translation(format!("{:#x}", offset)))?;
        Ok(Segment::new(hdr, MifRef(offset as u32), seg_size))
    }

    /// Allocate one segment with an in-line signal area.
    ///
    /// `dat_bufsz` may be [`MBULK_DAT_BUFSZ_REQ_BEST_MAGIC`] to take all the
    /// remaining room. A zero `dat_bufsz` allocates a signal-only segment
    /// with a reference count of 0.
    pub fn alloc(
        &self,
        pool_id: u8,
        clas: MbulkClass,
        colour: Colour,
        sig_bufsz_req: usize,
        dat_bufsz: usize,
    ) -> Option<Segment> {
        let sig_bufsz =
            checked_round_up(MBULK_HEADER_SIZE.checked_add(sig_bufsz_req)?, MBULK_SIG_ALIGN)? - MBULK_HEADER_SIZE;

        let (offset, seg_size) = {
            let mut pools = self.pools.lock();
            let pool = pools.get_mut(pool_id as usize)?.as_mut()?;
            if sig_bufsz > pool.seg_size {
                return None;
            }
            if dat_bufsz != MBULK_DAT_BUFSZ_REQ_BEST_MAGIC
                && !matches!(sig_bufsz.checked_add(dat_bufsz), Some(total) if total <= pool.seg_size)
            {
                return None;
            }
            let index = pool.get(clas as u8, colour)?;
            (pool.offset_of(index), pool.seg_size)
        };

        let seg = match self.segment_at(offset, seg_size) {
            Ok(seg) => seg,
            Err(e) => {
                warn!("mbulk pool {}: {}", pool_id, e);
                return None;
            }
        };

        let (dat, refcnt) = match dat_bufsz {
            0 => (0, 0),
            MBULK_DAT_BUFSZ_REQ_BEST_MAGIC => (seg_size - sig_bufsz, 1),
            n => (n, 1),
        };
        seg.write_header(MbulkHeader {
            flag: if sig_bufsz > 0 { MBULK_F_SIG } else { 0 },
            clas: clas as u8,
            pid: pool_id,
            refcnt,
            dat_bufsz: dat as u32,
            sig_bufsz: sig_bufsz as u16,
            head: sig_bufsz as u16,
            len: 0,
            chain_next: 0,
            reserved: [0; 3],
        });
        Some(seg)
    }

    /// Allocate a head segment plus signal-less followers until the summed
    /// tailroom covers `dat_bufsz`. Either the whole chain is returned or
    /// nothing is allocated.
    pub fn alloc_chain(
        &self,
        pool_id: u8,
        clas: MbulkClass,
        colour: Colour,
        sig_bufsz: usize,
        dat_bufsz: usize,
    ) -> Option<Buffer> {
        let head = self.alloc(pool_id, clas, colour, sig_bufsz, MBULK_DAT_BUFSZ_REQ_BEST_MAGIC)?;
        if head.tailroom() >= dat_bufsz {
            return Some(Buffer::Single(head));
        }

        head.set_flags(MBULK_F_CHAIN_HEAD | MBULK_F_CHAIN);
        let mut total = head.tailroom();
        let mut chain = vec![head];

        while total < dat_bufsz {
            if chain.len() >= MBULK_MAX_CHAIN {
                warn!("mbulk chain for {} bytes exceeds {} segments", dat_bufsz, MBULK_MAX_CHAIN);
                break;
            }
            let Some(seg) = self.alloc(pool_id, clas, colour, 0, MBULK_DAT_BUFSZ_REQ_BEST_MAGIC) else {
                break;
            };
            seg.set_flags(MBULK_F_CHAIN);
            total += seg.tailroom();
            if let Some(prev) = chain.last() {
                prev.set_chain_next(seg.mif_ref());
            }
            chain.push(seg);
        }

        if total < dat_bufsz {
            self.free_buffer(Buffer::Chained(chain));
            return None;
        }
        Some(Buffer::Chained(chain))
    }

    /// Return a segment to its pool. Freeing a free segment does nothing.
    /// Returns whether the segment was actually released.
    pub fn free(&self, seg: Segment) -> bool {
        let offset = seg.mif_ref().offset();
        let mut pools = self.pools.lock();
        let found = pools
            .iter_mut()
            .enumerate()
            .find_map(|(id, p)| p.as_mut().filter(|p| p.contains(offset)).map(|p| (id as u8, p)));
        let Some((pid, pool)) = found else {
            warn!("mbulk free of {:?} outside every pool", seg.mif_ref());
            return false;
        };
        let Some(index) = pool.index_of(offset) else {
            warn!("mbulk free of misaligned {:?}", seg.mif_ref());
            return false;
        };
        if !pool.put(index) {
            return false;
        }
        seg.write_header(MbulkHeader {
            flag: MBULK_F_FREE,
            pid,
            ..Default::default()
        });
        true
    }

    /// Free a segment known only by its peer reference.
    pub fn free_ref(&self, r: MifRef) -> HipResult<bool> {
        let seg = self.lookup(r)?;
        Ok(self.free(seg))
    }

    pub fn free_buffer(&self, buf: Buffer) {
        for seg in buf.segments() {
            seg.clear_flags(MBULK_F_CHAIN | MBULK_F_CHAIN_HEAD);
            self.free(*seg);
        }
    }

    /// Resolve a reference to a segment start owned by one of our pools.
    pub fn lookup(&self, r: MifRef) -> HipResult<Segment> {
        let seg_size = self
            .pools
            .lock()
            .iter()
            .flatten()
            .find_map(|p| p.index_of(r.offset()).map(|_| p.seg_size));
        let Some(seg_size) = seg_size else {
            return Err(HipError::Translation(format!("{:?} is not a segment of any pool", r)));
        };
        self.segment_at(r.offset(), seg_size)
    }

    /// Colour recorded when `seg` was allocated from `pool_id`.
    pub fn get_colour(&self, pool_id: u8, seg: &Segment) -> Option<Colour> {
        let pools = self.pools.lock();
        let pool = pools.get(pool_id as usize)?.as_ref()?;
        pool.colour(pool.index_of(seg.mif_ref().offset())?)
    }

    pub fn free_count(&self, pool_id: u8) -> Option<usize> {
        let pools = self.pools.lock();
        pools.get(pool_id as usize)?.as_ref().map(|p| p.free_cnt())
    }

    pub fn in_use(&self, pool_id: u8) -> Option<usize> {
        let pools = self.pools.lock();
        pools.get(pool_id as usize)?.as_ref().map(|p| p.in_use())
    }

    pub fn class_usage(&self, pool_id: u8, clas: MbulkClass) -> Option<u32> {
        let pools = self.pools.lock();
        pools.get(pool_id as usize)?.as_ref().map(|p| p.usage(clas as u8))
    }

    /// Usable bytes (signal + data) of one segment in `pool_id`.
    pub fn seg_size(&self, pool_id: u8) -> Option<usize> {
        let pools = self.pools.lock();
        pools.get(pool_id as usize)?.as_ref().map(|p| p.seg_size)
    }

    pub fn region(&self) -> &Arc<MifRegion> {
        &self.region
    }
}
