//! The memory interface (MIF) region shared by host and peer.
//!
//! Host code holds local pointers, the peer only ever sees [`MifRef`]s: byte
//! offsets from the region base. Every conversion between the two goes through
//! [`MifRegion`], so the moments where ownership crosses the boundary stay
//! visible in the code.

use std::fmt;

use crate::error::{HipError, HipResult};
use crate::Core::SharedMemory::{create_shared_memory, SharedMemoryBackend};

/// Peer-visible reference to a location in the shared region.
///
/// Offset 0 holds the control block, so `MifRef(0)` doubles as the null reference.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(transparent)]
pub struct MifRef(pub u32);

impl MifRef {
    pub const NULL: MifRef = MifRef(0);

    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn offset(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for MifRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MifRef({:#x})", self.0)
    }
}

pub struct MifRegion {
    shm: Box<dyn SharedMemoryBackend>,
}

// The region is only touched through raw pointers whose ordering is managed by
// the queue protocol.
unsafe impl Send for MifRegion {}
unsafe impl Sync for MifRegion {}

impl MifRegion {
    pub fn new(shm: Box<dyn SharedMemoryBackend>) -> HipResult<Self> {
        if shm.size() > u32::MAX as usize {
            return Err(HipError::InvalidArgument(format!(
                "region of {} bytes cannot be addressed with 32-bit references",
                shm.size()
            )));
        }
        Ok(Self { shm })
    }

    /// Anonymous region, zero filled.
    pub fn anonymous(size: usize) -> HipResult<Self> {
        Self::new(create_shared_memory(size, None)?)
    }

    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.shm.as_ptr()
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.shm.size()
    }

    pub fn backend(&self) -> &dyn SharedMemoryBackend {
        self.shm.as_ref()
    }

    /// Local pointer to peer-visible reference.
    pub fn ptr_to_ref(&self, ptr: *const u8) -> HipResult<MifRef> {
        let base = self.base() as usize;
        let addr = ptr as usize;
        if addr <= base || addr >= base + self.size() {
            return Err(HipError::Translation(format!(
                "{:p} outside region [{:#x}, {:#x})",
                ptr,
                base,
                base + self.size()
            )));
        }
        Ok(MifRef((addr - base) as u32))
    }

    /// Peer-visible reference to local pointer.
    pub fn ref_to_ptr(&self, r: MifRef) -> HipResult<*mut u8> {
        if r.is_null() || r.offset() >= self.size() {
            return Err(HipError::Translation(format!(
                "{:?} outside region of {} bytes",
                r,
                self.size()
            )));
        }
        Ok(unsafe { self.base().add(r.offset()) })
    }

    /// Checks that `[offset, offset + len)` lies inside the region.
    pub fn contains(&self, offset: usize, len: usize) -> bool {
        offset
            .checked_add(len)
            .map(|end| end <= self.size())
            .unwrap_or(false)
    }

    /// Pointer to `offset` without the null-reference rule; used for the
    /// control block which lives at offset 0.
    ///
    /// # Safety
    /// `offset + size_of::<T>()` must be inside the region and suitably aligned.
    pub unsafe fn at<T>(&self, offset: usize) -> *mut T {
        self.base().add(offset) as *mut T
    }

    /// Copy `data` into the region at `offset`.
    pub fn write_bytes(&self, offset: usize, data: &[u8]) -> HipResult<()> {
        if !self.contains(offset, data.len()) {
            return Err(HipError::Translation(format!(
                "write of {} bytes at {:#x} exceeds region",
                data.len(),
                offset
            )));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.base().add(offset), data.len());
        }
        Ok(())
    }

    /// Copy `len` bytes out of the region at `offset`.
    pub fn read_bytes(&self, offset: usize, len: usize) -> HipResult<Vec<u8>> {
        if !self.contains(offset, len) {
            return Err(HipError::Translation(format!(
                "read of {} bytes at {:#x} exceeds region",
                len, offset
            )));
        }
        let mut out = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(self.base().add(offset), out.as_mut_ptr(), len);
        }
        Ok(out)
    }
}

impl fmt::Debug for MifRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        crate::Debug::StructDebug::debug_mif_region(self, f)
    }
}
