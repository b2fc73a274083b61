// Shared memory backend tests
// Run with: cargo test --test shared_memory -- --nocapture

use dmxp_hip::Core::{create_shared_memory, RawHandle, SharedMemoryBackend};
use dmxp_hip::Core::SharedMemory::REGION_ALIGN;
use dmxp_hip::Core::{MifRef, MifRegion};

#[test]
fn test_anonymous_region_is_zeroed_and_aligned() {
    let sizes = vec![1024, 4096, 65536, 1024 * 1024];

    for size in sizes {
        let shm = create_shared_memory(size, None).unwrap();
        assert!(shm.size() >= size);
        assert_eq!(shm.as_ptr() as usize % REGION_ALIGN, 0);
        let slice = unsafe { std::slice::from_raw_parts(shm.as_ptr(), shm.size()) };
        assert!(slice.iter().all(|&b| b == 0));
        assert!(matches!(shm.raw_handle(), RawHandle::Anonymous));
    }
}

#[test]
fn test_zero_sized_region_rejected() {
    let err = create_shared_memory(0, None).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
}

#[test]
fn test_ref_translation() {
    let region = MifRegion::anonymous(64 * 1024).unwrap();
    let base = region.base();

    let r = region.ptr_to_ref(unsafe { base.add(0x1040) }).unwrap();
    assert_eq!(r, MifRef(0x1040));
    assert_eq!(region.ref_to_ptr(r).unwrap(), unsafe { base.add(0x1040) });

    // Offset 0 is the null reference in both directions
    assert!(region.ptr_to_ref(base).is_err());
    assert!(region.ref_to_ptr(MifRef::NULL).is_err());

    // Past the end
    assert!(region.ref_to_ptr(MifRef(64 * 1024)).is_err());
    assert!(region.ptr_to_ref(unsafe { base.add(64 * 1024) }).is_err());
}

#[test]
fn test_region_read_write_bounds() {
    let region = MifRegion::anonymous(8192).unwrap();
    region.write_bytes(100, b"hip").unwrap();
    assert_eq!(region.read_bytes(100, 3).unwrap(), b"hip");

    assert!(region.write_bytes(8190, b"xyz").is_err());
    assert!(region.read_bytes(usize::MAX, 2).is_err());
    assert!(!region.contains(8000, 500));
}

#[cfg(target_os = "linux")]
mod linux_tests {
    use dmxp_hip::Core::{attach_shared_memory, create_shared_memory, RawHandle, SharedMemoryBackend};
    use std::io;

    // Named regions live in one /dev/shm namespace
    static TEST_LOCK: parking_lot::Mutex<()> = parking_lot::const_mutex(());

    fn cleanup(name: &str) {
        let _ = std::fs::remove_file(format!("/dev/shm/{}", name));
    }

    #[test]
    fn test_create_named_shared_memory() -> io::Result<()> {
        let _guard = TEST_LOCK.lock();
        let name = "dmxp_hip_test_create";
        let size = 4096;
        let shm = create_shared_memory(size, Some(name))?;

        assert_eq!(shm.size(), size);
        assert!(!shm.as_ptr().is_null());
        match shm.raw_handle() {
            RawHandle::Fd(fd) => assert!(fd > 0, "File descriptor should be positive"),
            RawHandle::Anonymous => panic!("named region must carry a descriptor"),
        }

        unsafe {
            let slice = std::slice::from_raw_parts_mut(shm.as_ptr(), size);
            slice[0] = 0x42;
            assert_eq!(slice[0], 0x42);
        }
        drop(shm);
        cleanup(name);
        Ok(())
    }

    #[test]
    fn test_attach_sees_writes() -> io::Result<()> {
        let _guard = TEST_LOCK.lock();
        let name = "dmxp_hip_test_attach";
        let size = 8192;
        let shm = create_shared_memory(size, Some(name))?;
        unsafe {
            let slice = std::slice::from_raw_parts_mut(shm.as_ptr(), size);
            for (i, b) in slice.iter_mut().take(100).enumerate() {
                *b = (i % 256) as u8;
            }
        }

        let peer = attach_shared_memory(name, size)?;
        let seen = unsafe { std::slice::from_raw_parts(peer.as_ptr(), size) };
        for (i, b) in seen.iter().take(100).enumerate() {
            assert_eq!(*b, (i % 256) as u8);
        }
        drop(peer);
        drop(shm);
        cleanup(name);
        Ok(())
    }

    #[test]
    fn test_attach_missing_region() {
        let _guard = TEST_LOCK.lock();
        let result = attach_shared_memory("dmxp_hip_test_missing", 4096);
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_attach_too_small() -> io::Result<()> {
        let _guard = TEST_LOCK.lock();
        let name = "dmxp_hip_test_small";
        let shm = create_shared_memory(4096, Some(name))?;
        let result = attach_shared_memory(name, 1024 * 1024);
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::InvalidData);
        drop(shm);
        cleanup(name);
        Ok(())
    }

    #[test]
    fn test_named_transport_region() -> io::Result<()> {
        use dmxp_hip::HIP::TransportBuilder;

        let _guard = TEST_LOCK.lock();
        let name = "dmxp_hip_test_transport";
        let transport = TransportBuilder::new().with_region_name(name).build()?;
        let map = transport.region_map();
        assert!(matches!(transport.region().backend().raw_handle(), RawHandle::Fd(_)));

        // An out-of-process peer would see the same records
        let peer = attach_shared_memory(name, map.total_size())?;
        let magic = unsafe { std::ptr::read_unaligned(peer.as_ptr() as *const u32) };
        assert_eq!(magic, dmxp_hip::HIP::Buffer::layout::HIP4_INIT_MAGIC);

        drop(peer);
        transport.teardown()?;
        drop(transport);
        cleanup(name);
        Ok(())
    }
}
