// Shared memory backends for the host/peer region.
// The region is carved up by the transport; the backend only provides bytes.

use std::alloc::{self, Layout};
use std::fmt::Debug;
use std::io;
use std::ptr::NonNull;

#[cfg(target_os = "linux")]
use std::fs::OpenOptions;
#[cfg(target_os = "linux")]
use std::os::fd::{AsRawFd, IntoRawFd};
#[cfg(target_os = "linux")]
use std::os::unix::fs::OpenOptionsExt;

/// Every backend hands out memory aligned to this many bytes.
pub const REGION_ALIGN: usize = 4096;

/// Shared memory backend trait for the memory both sides of the link can see
pub trait SharedMemoryBackend: Send + Sync + Debug {
    /// Get a pointer to the mapped memory region
    fn as_ptr(&self) -> *mut u8;

    /// Get the size of the mapped region in bytes
    fn size(&self) -> usize;

    /// Get the underlying OS handle, if any
    fn raw_handle(&self) -> RawHandle;
}

/// Platform-specific handle type
#[derive(Debug, Clone, Copy)]
pub enum RawHandle {
    /// Unix file descriptor (Linux)
    Fd(i32),
    /// Process-private heap memory, no handle to pass around
    Anonymous,
}

/// Create a region. With a name it is backed by `/dev/shm/<name>` so an
/// out-of-process peer can map it; without one it is zeroed process memory.
pub fn create_shared_memory(
    size: usize,
    name: Option<&str>,
) -> io::Result<Box<dyn SharedMemoryBackend>> {
    match name {
        #[cfg(target_os = "linux")]
        Some(name) => Ok(Box::new(LinuxSharedMemory::create(size, name)?)),
        #[cfg(not(target_os = "linux"))]
        Some(_) => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "Named shared memory only supported on Linux",
        )),
        None => Ok(Box::new(HeapSharedMemory::new(size)?)),
    }
}

/// Attach to a region previously created with a name.
#[cfg(target_os = "linux")]
pub fn attach_shared_memory(name: &str, size: usize) -> io::Result<Box<dyn SharedMemoryBackend>> {
    Ok(Box::new(LinuxSharedMemory::attach(name, size)?))
}

#[cfg(not(target_os = "linux"))]
pub fn attach_shared_memory(_name: &str, _size: usize) -> io::Result<Box<dyn SharedMemoryBackend>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "Shared memory only supported on Linux",
    ))
}

/// Zeroed, page aligned process memory.
#[derive(Debug)]
pub struct HeapSharedMemory {
    ptr: NonNull<u8>,
    layout: Layout,
}

unsafe impl Send for HeapSharedMemory {}
unsafe impl Sync for HeapSharedMemory {}

impl HeapSharedMemory {
    pub fn new(size: usize) -> io::Result<Self> {
        if size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "HeapSharedMemory::new(): zero sized region",
            ));
        }
        let aligned = (size + REGION_ALIGN - 1) & !(REGION_ALIGN - 1);
        let layout = Layout::from_size_align(aligned, REGION_ALIGN)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;

        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::OutOfMemory,
                format!("Failed to allocate {} byte region", aligned),
            )
        })?;

        Ok(Self { ptr, layout })
    }
}

impl Drop for HeapSharedMemory {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

impl SharedMemoryBackend for HeapSharedMemory {
    fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn size(&self) -> usize {
        self.layout.size()
    }

    fn raw_handle(&self) -> RawHandle {
        RawHandle::Anonymous
    }
}

#[cfg(target_os = "linux")]
#[derive(Debug)]
pub struct LinuxSharedMemory {
    ptr: NonNull<u8>,
    size: usize,
    fd: i32,
    mapping: (*mut u8, usize),
}

#[cfg(target_os = "linux")]
unsafe impl Send for LinuxSharedMemory {}
#[cfg(target_os = "linux")]
unsafe impl Sync for LinuxSharedMemory {}

#[cfg(target_os = "linux")]
impl LinuxSharedMemory {
    /// Create (or truncate) `/dev/shm/<name>` and map it
    pub fn create(size: usize, name: &str) -> io::Result<Self> {
        let path = format!("/dev/shm/{}", name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)
            .map_err(|e| {
                io::Error::new(
                    e.kind(),
                    format!("Failed to create shared memory file at {}: {}", path, e),
                )
            })?;

        if unsafe { libc::ftruncate(file.as_raw_fd(), size as libc::off_t) } != 0 {
            return Err(io::Error::last_os_error());
        }

        Self::map(file.into_raw_fd(), size)
    }

    /// Map an existing `/dev/shm/<name>` of at least `size` bytes
    pub fn attach(name: &str, size: usize) -> io::Result<Self> {
        let path = format!("/dev/shm/{}", name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("Failed to open shared memory at {}: {}", path, e),
                )
            })?;

        let file_size = file.metadata()?.len() as usize;
        if file_size < size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "Shared memory size too small: expected at least {} bytes, got {}",
                    size, file_size
                ),
            ));
        }

        Self::map(file.into_raw_fd(), file_size)
    }

    fn map(fd: i32, size: usize) -> io::Result<Self> {
        // Extra space so the region base can be aligned
        let total_size = size + REGION_ALIGN - 1;
        let raw = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }

        let aligned = ((raw as usize + REGION_ALIGN - 1) & !(REGION_ALIGN - 1)) as *mut u8;
        let ptr = match NonNull::new(aligned) {
            Some(ptr) => ptr,
            None => {
                unsafe {
                    libc::munmap(raw, total_size);
                    libc::close(fd);
                }
                return Err(io::Error::new(io::ErrorKind::Other, "mmap returned null"));
            }
        };

        Ok(Self {
            ptr,
            size,
            fd,
            mapping: (raw as *mut u8, total_size),
        })
    }
}

#[cfg(target_os = "linux")]
impl Drop for LinuxSharedMemory {
    fn drop(&mut self) {
        unsafe {
            let (ptr, len) = self.mapping;
            libc::munmap(ptr as *mut libc::c_void, len);
            libc::close(self.fd);
        }
    }
}

#[cfg(target_os = "linux")]
impl SharedMemoryBackend for LinuxSharedMemory {
    fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn size(&self) -> usize {
        self.size
    }

    fn raw_handle(&self) -> RawHandle {
        RawHandle::Fd(self.fd)
    }
}
