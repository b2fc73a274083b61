// Allocation tracking tests for the queue and mbulk hot paths
//
// Note: every test here is #[serial_test::serial]. dhat only allows one
// profiler at a time, and its counters see allocations from any thread.
//
// # Run all allocation tracking tests
// cargo test --test allocation_tracking -- --nocapture

use dmxp_hip::Core::mbulk::{Colour, MbulkAllocator, MbulkClass};
use dmxp_hip::Core::MifRegion;
use dmxp_hip::HIP::Buffer::{HipQueues, QueueId, QueueSide};
use dmxp_hip::HIP::mif::SoftMif;
use dmxp_hip::HIP::Structs::{Frame, SignalHeader, MA_UNITDATA_REQ};
use dmxp_hip::HIP::{PeerEndpoint, TransportBuilder};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[global_allocator]
static ALLOC: dhat::Alloc = dhat::Alloc;

fn queue_pair() -> (HipQueues, HipQueues) {
    let region = Arc::new(MifRegion::anonymous(64 * 1024).unwrap());
    let host = HipQueues::new(region.clone(), QueueSide::Host).unwrap();
    host.reset_indices();
    let peer = HipQueues::new(region, QueueSide::Peer).unwrap();
    (host, peer)
}

#[test]
#[serial_test::serial]
fn test_queue_ops_do_not_allocate() {
    println!("\n--- Queue enqueue/dequeue under dhat ---");
    let _dhat = dhat::Profiler::builder().testing().build();
    let (host, peer) = queue_pair();

    let before = dhat::HeapStats::get();
    for i in 0..10_000u32 {
        host.enqueue(QueueId::FhDat, dmxp_hip::Core::MifRef(0x1000 + (i % 200) * 64))
            .unwrap();
        let got = peer.dequeue(QueueId::FhDat).unwrap();
        assert!(got.is_some());
    }
    let after = dhat::HeapStats::get();

    println!("blocks before {} after {}", before.total_blocks, after.total_blocks);
    assert_eq!(after.total_blocks, before.total_blocks, "queue hot path allocated");
}

#[test]
#[serial_test::serial]
fn test_mbulk_alloc_free_do_not_allocate() {
    println!("\n--- mbulk alloc/free under dhat ---");
    let _dhat = dhat::Profiler::builder().testing().build();
    let region = Arc::new(MifRegion::anonymous(256 * 1024).unwrap());
    let allocator = MbulkAllocator::new(region);
    allocator.pool_add(0, 4096, 64 * 2112, 2048, 0).unwrap();

    let before = dhat::HeapStats::get();
    for i in 0..10_000 {
        let seg = allocator
            .alloc(0, MbulkClass::FromHostDat, Colour::new(0, 0, (i % 4) as u8), 14, 1500)
            .expect("segment");
        assert!(allocator.free(seg));
    }
    let after = dhat::HeapStats::get();

    println!("blocks before {} after {}", before.total_blocks, after.total_blocks);
    assert_eq!(after.total_blocks, before.total_blocks, "mbulk hot path allocated");
}

#[test]
#[serial_test::serial]
fn test_transport_round_trips_with_memory_stats() {
    println!("\n--- Transport loopback with memory-stats ---");
    use memory_stats::memory_stats;

    let mif = SoftMif::new();
    let transport = TransportBuilder::new().with_interrupts(mif.clone()).build().unwrap();
    let peer = PeerEndpoint::attach(&transport, mif, 4, 0, 0).unwrap();
    transport.setup().unwrap();

    let before = memory_stats();
    println!("Memory before: {:?}", before);

    let signal = SignalHeader {
        id: MA_UNITDATA_REQ,
        ..Default::default()
    }
    .to_bytes()
    .to_vec();
    for i in 0..5_000u32 {
        transport
            .transmit(Frame::new(signal.clone(), vec![(i % 256) as u8; 512]), false, 0, 0, 0)
            .unwrap();
        let (_frame, refs) = peer.recv_frame(QueueId::FhDat).unwrap().unwrap();
        peer.return_to_host(&refs).unwrap();
        // Keep FH_RFB from filling while the host catches up
        if i % 128 == 0 {
            let deadline = Instant::now() + Duration::from_secs(5);
            while transport.allocator().in_use(0) != Some(0) {
                assert!(Instant::now() < deadline, "returns not drained");
                std::thread::yield_now();
            }
        }
    }

    let after = memory_stats();
    println!("Memory after: {:?}", after);
    if let (Some(b), Some(a)) = (before, after) {
        let delta = a.physical_mem as i64 - b.physical_mem as i64;
        println!("Memory delta: {} bytes ({:.2} KB)", delta, delta as f64 / 1024.0);
        println!("  Note: frames are owned Vecs, so the heap churns, but the region does not grow.");
    }
    assert_eq!(transport.stats().q_num_frames[QueueId::FhDat.index()], 5_000);
}
