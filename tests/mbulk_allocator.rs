// tests/mbulk_allocator.rs
//
// Pool carving, alloc/free bookkeeping, chains and concurrent use of the
// mbulk allocator over an anonymous region.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use dmxp_hip::Core::mbulk::{
    checked_round_up, round_up, Buffer, Colour, MbulkAllocator, MbulkClass, MbulkHeader,
    MBULK_DAT_BUFSZ_REQ_BEST_MAGIC, MBULK_HEADER_SIZE, MBULK_MAX_CHAIN,
};
use dmxp_hip::Core::{MifRef, MifRegion};
use dmxp_hip::HipError;
use parking_lot::Mutex;

const SEG: usize = 2048;
// 32 byte header + 2048, rounded to 64
const STRIDE: usize = 2112;
const BASE: usize = 4096;

fn allocator(segments: usize, guard: u32) -> MbulkAllocator {
    let region = Arc::new(MifRegion::anonymous(BASE + segments * STRIDE + 4096).unwrap());
    let allocator = MbulkAllocator::new(region);
    allocator.pool_add(0, BASE, segments * STRIDE, SEG, guard).unwrap();
    allocator
}

#[test]
fn test_alloc_and_free() {
    let a = allocator(64, 0);
    assert_eq!(a.free_count(0), Some(64));
    assert_eq!(a.pool_geometry(0), Some((BASE, BASE + 64 * STRIDE, STRIDE, 64, 0)));

    let colour = Colour::new(1, 2, 3);
    let seg = a.alloc(0, MbulkClass::FromHostDat, colour, 20, 100).expect("segment");
    println!("allocated {:?}", seg);
    assert_eq!(seg.sig_bufsz(), 32);
    assert_eq!(seg.dat_bufsz(), 100);
    assert_eq!(seg.refcnt(), 1);
    assert!(seg.has_signal());
    assert!(!seg.is_free());
    assert_eq!(seg.pool_id(), 0);
    assert_eq!((seg.mif_ref().offset() - BASE) % STRIDE, 0);

    assert_eq!(a.in_use(0), Some(1));
    assert_eq!(a.get_colour(0, &seg), Some(colour));
    assert_eq!(a.class_usage(0, MbulkClass::FromHostDat), Some(1));
    assert_eq!(a.pool_of(seg.mif_ref()), Some(0));

    assert!(a.free(seg));
    assert!(seg.is_free());
    assert!(!a.free(seg), "second free must be a no-op");
    assert_eq!(a.in_use(0), Some(0));
    assert_eq!(a.class_usage(0, MbulkClass::FromHostDat), Some(0));
    assert_eq!(a.get_colour(0, &seg), None);
}

#[test]
fn test_signal_only_segment() {
    let a = allocator(4, 0);
    let seg = a.alloc(0, MbulkClass::Control, Colour::default(), 14, 0).unwrap();
    assert_eq!(seg.refcnt(), 0);
    assert_eq!(seg.dat_bufsz(), 0);
    assert_eq!(seg.tailroom(), 0);

    let best = a
        .alloc(0, MbulkClass::Control, Colour::default(), 14, MBULK_DAT_BUFSZ_REQ_BEST_MAGIC)
        .unwrap();
    assert_eq!(best.sig_bufsz() + best.dat_bufsz(), SEG);
}

#[test]
fn test_guard_reserves_segments() {
    let a = allocator(10, 5);
    let mut got = Vec::new();
    while let Some(seg) = a.alloc(0, MbulkClass::FromHostDat, Colour::default(), 8, 64) {
        got.push(seg);
    }
    assert_eq!(got.len(), 5);
    assert_eq!(a.free_count(0), Some(5));
    for seg in got {
        a.free(seg);
    }
    assert_eq!(a.free_count(0), Some(10));
}

#[test]
fn test_oversized_request_fails() {
    let a = allocator(4, 0);
    assert!(a.alloc(0, MbulkClass::FromHostDat, Colour::default(), 20, SEG).is_none());
    assert!(a.alloc(0, MbulkClass::FromHostDat, Colour::default(), SEG + 1, 0).is_none());
    assert!(a.alloc(3, MbulkClass::FromHostDat, Colour::default(), 8, 8).is_none());
    assert_eq!(a.in_use(0), Some(0));
}

#[test]
fn test_huge_request_is_rejected_not_overflowed() {
    let a = allocator(4, 0);
    let huge_sig = a.alloc(0, MbulkClass::Control, Colour::default(), usize::MAX - 8, 16);
    assert!(huge_sig.is_none());
    let huge_dat = a.alloc(0, MbulkClass::Control, Colour::default(), 64, usize::MAX - 8);
    assert!(huge_dat.is_none());
    assert!(a
        .alloc_chain(0, MbulkClass::FromHostDat, Colour::default(), usize::MAX, 16)
        .is_none());
    assert!(a
        .alloc_chain(0, MbulkClass::FromHostDat, Colour::default(), 20, usize::MAX)
        .is_none());
    assert_eq!(a.in_use(0), Some(0));

    assert_eq!(round_up(usize::MAX - 3, 64) % 64, 0);
    assert_eq!(checked_round_up(usize::MAX - 3, 64), None);
    assert_eq!(checked_round_up(100, 64), Some(128));
}

#[test]
fn test_chain_alloc_and_fill() {
    let a = allocator(32, 0);
    let buf = a
        .alloc_chain(0, MbulkClass::FromHostDat, Colour::default(), 20, 5000)
        .expect("chain");
    let Buffer::Chained(segs) = &buf else {
        panic!("5000 bytes cannot fit one segment");
    };
    assert_eq!(segs.len(), 3);
    assert!(segs[0].is_chain_head());
    assert!(segs[0].has_signal());
    for pair in segs.windows(2) {
        assert_eq!(pair[0].chain_next(), pair[1].mif_ref());
        assert!(pair[1].is_chained());
        assert!(!pair[1].has_signal());
    }
    assert!(segs[2].chain_next().is_null());

    let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    assert!(buf.append(&payload));
    assert_eq!(buf.len(), 5000);
    let joined: Vec<u8> = segs.iter().flat_map(|s| s.data().to_vec()).collect();
    assert_eq!(joined, payload);

    segs[1].data_mut()[0] = 0xee;
    assert_eq!(segs[1].data()[0], 0xee);
    assert_eq!(segs[1].len(), segs[1].data().len());

    a.free_buffer(buf);
    assert_eq!(a.in_use(0), Some(0));
}

#[test]
fn test_chain_fits_one_segment() {
    let a = allocator(4, 0);
    let buf = a
        .alloc_chain(0, MbulkClass::FromHostDat, Colour::default(), 20, 100)
        .unwrap();
    assert!(!buf.is_chained());
    a.free_buffer(buf);
}

#[test]
fn test_chain_limit_and_rollback() {
    let a = allocator(64, 0);
    let too_long = (MBULK_MAX_CHAIN + 1) * SEG;
    assert!(a
        .alloc_chain(0, MbulkClass::FromHostDat, Colour::default(), 20, too_long)
        .is_none());
    assert_eq!(a.in_use(0), Some(0), "failed chain must release every segment");

    // Not enough segments left in the pool
    let small = allocator(2, 0);
    assert!(small
        .alloc_chain(0, MbulkClass::FromHostDat, Colour::default(), 20, 3 * SEG)
        .is_none());
    assert_eq!(small.in_use(0), Some(0));
}

#[test]
fn test_lookup_rejects_foreign_refs() {
    let a = allocator(8, 0);
    let seg = a.alloc(0, MbulkClass::FromHostDat, Colour::default(), 8, 8).unwrap();
    let found = a.lookup(seg.mif_ref()).unwrap();
    assert_eq!(found.mif_ref(), seg.mif_ref());

    let misaligned = MifRef(seg.mif_ref().0 + 64);
    assert!(matches!(a.lookup(misaligned), Err(HipError::Translation(_))));
    assert!(a.lookup(MifRef(64)).is_err());
    assert!(a.lookup(MifRef::NULL).is_err());
    assert_eq!(a.pool_of(misaligned), None);
    assert!(a.free_ref(seg.mif_ref()).unwrap());
    assert!(!a.free_ref(seg.mif_ref()).unwrap());
}

#[test]
fn test_peer_written_header_cannot_widen_views() {
    let a = allocator(8, 0);
    let seg = a.alloc(0, MbulkClass::FromHostDat, Colour::default(), 20, 100).unwrap();
    assert!(seg.append_tail(40));
    let found = a.lookup(seg.mif_ref()).unwrap();
    assert_eq!(found.limit(), SEG);

    // Peer rewrites the header after the host resolved the reference
    let hdr = seg.as_ptr() as *mut MbulkHeader;
    unsafe {
        (*hdr).dat_bufsz = u32::MAX;
        (*hdr).len = u32::MAX;
    }
    for s in [seg, found] {
        assert!(s.headroom() + s.len() + s.tailroom() <= SEG - s.sig_bufsz());
        assert!(s.sig_bufsz() + s.data().len() <= SEG);
        assert_eq!(s.tail_mut().len(), 0);
        assert!(!s.append_tail(1));
    }

    unsafe { (*hdr).head = u16::MAX };
    assert_eq!(found.data().len(), 0);
    assert!(found.sig_bufsz() + found.headroom() <= SEG);
    assert!(a.free(found));
}

#[test]
fn test_resolved_segment_keeps_validated_extent() {
    let region = MifRegion::anonymous(64 * 1024).unwrap();
    let offset = 4096;
    let hdr = unsafe { region.base().add(offset) } as *mut MbulkHeader;
    unsafe {
        *hdr = MbulkHeader {
            sig_bufsz: 32,
            head: 32,
            dat_bufsz: 256,
            len: 200,
            ..Default::default()
        };
    }
    let seg = dmxp_hip::Core::mbulk::Segment::at(&region, MifRef(offset as u32)).unwrap();
    assert_eq!(seg.limit(), 32 + 256);
    assert_eq!(seg.data().len(), 200);

    // Grown after validation: the handle still stops at the checked extent
    unsafe {
        (*hdr).dat_bufsz = 60_000;
        (*hdr).len = 50_000;
    }
    assert_eq!(seg.data().len(), 256);
    assert!(MBULK_HEADER_SIZE + seg.limit() <= 64 * 1024 - offset);

    // Inconsistent headers are refused up front
    unsafe { (*hdr).head = 8 };
    assert!(matches!(
        dmxp_hip::Core::mbulk::Segment::at(&region, MifRef(offset as u32)),
        Err(HipError::Malformed(_))
    ));
}

#[test]
fn test_pool_add_validation() {
    let region = Arc::new(MifRegion::anonymous(64 * 1024).unwrap());
    let a = MbulkAllocator::new(region);
    assert!(a.pool_add(0, 0, 8 * STRIDE, SEG, 0).is_err(), "null base");
    assert!(a.pool_add(0, 4100, 8 * STRIDE, SEG, 0).is_err(), "misaligned base");
    assert!(a.pool_add(0, 4096, STRIDE - 1, SEG, 0).is_err(), "no whole segment");
    assert!(a.pool_add(0, 4096, 1024 * 1024, SEG, 0).is_err(), "past region end");
    assert!(a.pool_add(9, 4096, 8 * STRIDE, SEG, 0).is_err(), "bad pool id");

    a.pool_add(0, 4096, 8 * STRIDE, SEG, 0).unwrap();
    assert!(a.pool_add(0, 4096 + 8 * STRIDE, 8 * STRIDE, SEG, 0).is_err(), "duplicate id");
    a.pool_add(1, 4096 + 8 * STRIDE, 4 * 1024, 1024, 0).unwrap();
    assert_eq!(a.pool_ids(), vec![0, 1]);

    a.pool_remove(0);
    assert_eq!(a.pool_ids(), vec![1]);
    assert!(a.alloc(0, MbulkClass::FromHostDat, Colour::default(), 8, 8).is_none());
}

#[test]
fn test_free_uses_address_not_header() {
    let a = allocator(8, 0);
    let seg = a.alloc(0, MbulkClass::FromHostDat, Colour::default(), 8, 8).unwrap();
    // Peer scribbles over the pool id
    unsafe { *(seg.as_ptr() as *mut u8).add(2) = 3 };
    assert!(a.free(seg));
    assert_eq!(a.in_use(0), Some(0));
    assert_eq!(seg.pool_id(), 0);
}

#[test]
fn test_random_alloc_free_bookkeeping() {
    let a = allocator(48, 3);
    let mut rng = fastrand::Rng::with_seed(0x5eed);
    let mut live: Vec<dmxp_hip::Core::mbulk::Segment> = Vec::new();
    let mut refs: HashSet<MifRef> = HashSet::new();

    for step in 0..5000 {
        if rng.bool() || live.is_empty() {
            let sig = rng.usize(0..64);
            let dat = rng.usize(0..SEG - 96);
            if let Some(seg) = a.alloc(0, MbulkClass::FromHostDat, Colour::new(rng.u8(..), 0, 0), sig, dat) {
                assert!(refs.insert(seg.mif_ref()), "step {}: {:?} handed out twice", step, seg);
                live.push(seg);
            } else {
                assert!(live.len() >= 45 || sig + dat + 32 > SEG);
            }
        } else {
            let seg = live.swap_remove(rng.usize(..live.len()));
            refs.remove(&seg.mif_ref());
            assert!(a.free(seg));
        }
        assert_eq!(a.in_use(0), Some(live.len()));
        assert_eq!(a.free_count(0), Some(48 - live.len()));
    }

    for seg in live.drain(..) {
        a.free(seg);
    }
    assert_eq!(a.in_use(0), Some(0));
}

#[test]
fn test_concurrent_alloc_free() {
    let a = Arc::new(allocator(64, 0));
    let held: Arc<Mutex<HashSet<MifRef>>> = Arc::new(Mutex::new(HashSet::new()));

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let a = a.clone();
            let held = held.clone();
            thread::spawn(move || {
                let mut rng = fastrand::Rng::with_seed(t);
                let mut mine = Vec::new();
                for _ in 0..2000 {
                    if rng.bool() {
                        if let Some(seg) = a.alloc(0, MbulkClass::FromHostDat, Colour::default(), 8, 64) {
                            assert!(held.lock().insert(seg.mif_ref()), "segment owned twice");
                            mine.push(seg);
                        }
                    } else if let Some(seg) = mine.pop() {
                        assert!(held.lock().remove(&seg.mif_ref()));
                        assert!(a.free(seg));
                    }
                }
                for seg in mine {
                    held.lock().remove(&seg.mif_ref());
                    a.free(seg);
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(a.in_use(0), Some(0));
    assert!(held.lock().is_empty());
}
