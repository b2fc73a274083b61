// Segment header as the peer sees it, plus the host-side handle types.

use std::fmt;
use std::ptr::NonNull;

use crate::error::{HipError, HipResult};
use crate::Core::region::{MifRef, MifRegion};

use super::MBULK_ALIGN;

pub const MBULK_F_FREE: u8 = 0x01;
pub const MBULK_F_READONLY: u8 = 0x02;
pub const MBULK_F_SIG: u8 = 0x04;
pub const MBULK_F_OBOUND: u8 = 0x08;
pub const MBULK_F_WAKEUP: u8 = 0x10;
pub const MBULK_F_CHAIN_HEAD: u8 = 0x20;
pub const MBULK_F_CHAIN: u8 = 0x40;

/// Per-segment header at the start of every segment in the shared region.
///
/// ```text
///  0      1      2      3      4            8          10     12         16           20          32
///  +------+------+------+------+------------+----------+------+----------+------------+-----------+
///  | flag | clas | pid  |refcnt| dat_bufsz  |sig_bufsz | head |   len    | chain_next | reserved  |
///  +------+------+------+------+------------+----------+------+----------+------------+-----------+
/// ```
///
/// The signal area follows the header; `head` is measured from the start of
/// the signal area, so `head - sig_bufsz` is the data headroom.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct MbulkHeader {
    pub flag: u8,
    pub clas: u8,
    pub pid: u8,
    pub refcnt: u8,
    pub dat_bufsz: u32,
    pub sig_bufsz: u16,
    pub head: u16,
    pub len: u32,
    pub chain_next: u32,
    pub reserved: [u32; 3],
}

pub const MBULK_HEADER_SIZE: usize = std::mem::size_of::<MbulkHeader>();

/// Handle to one segment living in the shared region.
///
/// A `Segment` is a view: it holds a pointer into the region and stays valid
/// for as long as the region does. Ownership of the bytes is decided by the
/// queue protocol, not by this type.
///
/// The header is writable by the peer, so every accessor reads it once and
/// clamps what it finds to `limit`, the number of bytes after the header this
/// handle was validated for.
#[derive(Clone, Copy)]
pub struct Segment {
    hdr: NonNull<MbulkHeader>,
    mif: MifRef,
    limit: u32,
}

/// Header fields clamped to the handle's limit. Offsets are from the start of
/// the signal area.
#[derive(Debug, Clone, Copy)]
struct View {
    sig: usize,
    head: usize,
    len: usize,
    end: usize,
}

impl PartialEq for Segment {
    fn eq(&self, other: &Self) -> bool {
        self.hdr == other.hdr && self.mif == other.mif
    }
}

impl Eq for Segment {}

unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    pub(crate) fn new(hdr: NonNull<MbulkHeader>, mif: MifRef, limit: usize) -> Self {
        Self {
            hdr,
            mif,
            limit: limit.min(u32::MAX as usize) as u32,
        }
    }

    /// Resolve a peer reference into a segment, checking that the header and
    /// both buffer areas it declares fit inside the region.
    pub fn at(region: &MifRegion, r: MifRef) -> HipResult<Self> {
        if r.offset() % MBULK_ALIGN != 0 {
            return Err(HipError::Malformed(format!("{:?} not segment aligned", r)));
        }
        if !region.contains(r.offset(), MBULK_HEADER_SIZE) {
            return Err(HipError::Translation(format!("{:?} outside region", r)));
        }
        let ptr = region.ref_to_ptr(r)? as *mut MbulkHeader;
        let hdr = NonNull::new(ptr)
            .ok_or_else(|| HipError::Translation(format!("{:?} resolved to null", r)))?;

        // One snapshot is validated and its extent becomes the handle's limit
        let h = unsafe { std::ptr::read_volatile(ptr) };
        let area = h.sig_bufsz as usize + h.dat_bufsz as usize;
        if !region.contains(r.offset(), MBULK_HEADER_SIZE + area) {
            return Err(HipError::Malformed(format!(
                "{:?} declares {} bytes past region end",
                r,
                MBULK_HEADER_SIZE + area
            )));
        }
        let headroom = (h.head as usize).checked_sub(h.sig_bufsz as usize);
        match headroom {
            Some(headroom) if headroom + h.len as usize <= h.dat_bufsz as usize => {}
            _ => {
                return Err(HipError::Malformed(format!(
                    "{:?} head {} len {} exceed dat_bufsz {}",
                    r, h.head, h.len, h.dat_bufsz
                )))
            }
        }
        Ok(Self::new(hdr, r, area))
    }

    #[inline]
    pub fn mif_ref(&self) -> MifRef {
        self.mif
    }

    /// Local address of the segment start.
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.hdr.as_ptr() as *const u8
    }

    #[inline]
    pub fn header(&self) -> MbulkHeader {
        unsafe { std::ptr::read_volatile(self.hdr.as_ptr()) }
    }

    #[inline]
    fn hdr_mut(&self) -> &mut MbulkHeader {
        unsafe { &mut *self.hdr.as_ptr() }
    }

    /// Bytes after the header this handle may touch.
    #[inline]
    pub fn limit(&self) -> usize {
        self.limit as usize
    }

    fn view(&self) -> View {
        let h = self.header();
        let limit = self.limit as usize;
        let sig = (h.sig_bufsz as usize).min(limit);
        let end = (sig + h.dat_bufsz as usize).min(limit);
        let head = (h.head as usize).clamp(sig, end);
        let len = (h.len as usize).min(end - head);
        View { sig, head, len, end }
    }

    pub(crate) fn write_header(&self, h: MbulkHeader) {
        unsafe { std::ptr::write_volatile(self.hdr.as_ptr(), h) }
    }

    pub fn pool_id(&self) -> u8 {
        self.header().pid
    }

    pub fn class(&self) -> u8 {
        self.header().clas
    }

    pub fn flags(&self) -> u8 {
        self.header().flag
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags() & flag == flag
    }

    pub fn set_flags(&self, flag: u8) {
        self.hdr_mut().flag |= flag;
    }

    pub fn clear_flags(&self, flag: u8) {
        self.hdr_mut().flag &= !flag;
    }

    pub fn is_free(&self) -> bool {
        self.has_flag(MBULK_F_FREE)
    }

    pub fn has_signal(&self) -> bool {
        self.has_flag(MBULK_F_SIG)
    }

    /// Head of a scatter-gather chain.
    pub fn is_chain_head(&self) -> bool {
        self.has_flag(MBULK_F_CHAIN_HEAD)
    }

    pub fn is_chained(&self) -> bool {
        self.has_flag(MBULK_F_CHAIN)
    }

    pub fn refcnt(&self) -> u8 {
        self.header().refcnt
    }

    pub fn sig_bufsz(&self) -> usize {
        self.view().sig
    }

    pub fn dat_bufsz(&self) -> usize {
        let v = self.view();
        v.end - v.sig
    }

    /// Valid data length.
    pub fn len(&self) -> usize {
        self.view().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn headroom(&self) -> usize {
        let v = self.view();
        v.head - v.sig
    }

    pub fn tailroom(&self) -> usize {
        let v = self.view();
        v.end - v.head - v.len
    }

    pub fn chain_next(&self) -> MifRef {
        MifRef(self.header().chain_next)
    }

    pub fn set_chain_next(&self, next: MifRef) {
        self.hdr_mut().chain_next = next.0;
    }

    /// Move the data start forward by `n` bytes. Only valid on an empty segment.
    pub fn reserve_head(&self, n: usize) -> bool {
        let v = self.view();
        if v.len != 0 || v.end - v.head < n || v.head + n > u16::MAX as usize {
            return false;
        }
        self.hdr_mut().head = (v.head + n) as u16;
        true
    }

    /// Grow the valid data by `n` bytes at the tail.
    pub fn append_tail(&self, n: usize) -> bool {
        let v = self.view();
        if v.end - v.head - v.len < n {
            return false;
        }
        self.hdr_mut().len = (v.len + n) as u32;
        true
    }

    #[inline]
    fn sig_base(&self) -> *mut u8 {
        unsafe { (self.hdr.as_ptr() as *mut u8).add(MBULK_HEADER_SIZE) }
    }

    pub fn signal(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.sig_base(), self.view().sig) }
    }

    #[allow(clippy::mut_from_ref)]
    pub fn signal_mut(&self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.sig_base(), self.view().sig) }
    }

    /// Valid data bytes.
    pub fn data(&self) -> &[u8] {
        let v = self.view();
        unsafe { std::slice::from_raw_parts(self.sig_base().add(v.head), v.len) }
    }

    #[allow(clippy::mut_from_ref)]
    pub fn data_mut(&self) -> &mut [u8] {
        let v = self.view();
        unsafe { std::slice::from_raw_parts_mut(self.sig_base().add(v.head), v.len) }
    }

    /// Writable space after the valid data.
    #[allow(clippy::mut_from_ref)]
    pub fn tail_mut(&self) -> &mut [u8] {
        let v = self.view();
        let tail = v.head + v.len;
        unsafe { std::slice::from_raw_parts_mut(self.sig_base().add(tail), v.end - tail) }
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        crate::Debug::StructDebug::debug_segment(self, f)
    }
}

/// Owned buffer handed out by the allocator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Buffer {
    Single(Segment),
    Chained(Vec<Segment>),
}

impl Buffer {
    /// The segment carrying the signal.
    pub fn head(&self) -> Segment {
        match self {
            Buffer::Single(seg) => *seg,
            Buffer::Chained(segs) => segs[0],
        }
    }

    pub fn segments(&self) -> &[Segment] {
        match self {
            Buffer::Single(seg) => std::slice::from_ref(seg),
            Buffer::Chained(segs) => segs,
        }
    }

    pub fn is_chained(&self) -> bool {
        matches!(self, Buffer::Chained(_))
    }

    pub fn tailroom(&self) -> usize {
        self.segments().iter().map(Segment::tailroom).sum()
    }

    pub fn len(&self) -> usize {
        self.segments().iter().map(Segment::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy `src` into the tailroom of the segments in order.
    pub fn append(&self, mut src: &[u8]) -> bool {
        if src.len() > self.tailroom() {
            return false;
        }
        for seg in self.segments() {
            if src.is_empty() {
                break;
            }
            let room = seg.tailroom();
            if room == 0 {
                continue;
            }
            let n = room.min(src.len());
            seg.tail_mut()[..n].copy_from_slice(&src[..n]);
            seg.append_tail(n);
            src = &src[n..];
        }
        src.is_empty()
    }
}
