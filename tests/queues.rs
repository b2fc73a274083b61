// tests/queues.rs
//
// The six scoreboard queues seen from both ends of one region.

use std::sync::Arc;
use std::thread;

use dmxp_hip::Core::{MifRef, MifRegion};
use dmxp_hip::HIP::Buffer::layout::{MAX_NUM, SMAPPER_MBOX_SCB};
use dmxp_hip::HIP::Buffer::{HipQueues, Index, QueueId, QueueSide};
use dmxp_hip::HipError;

fn pair() -> (HipQueues, HipQueues) {
    let region = Arc::new(MifRegion::anonymous(64 * 1024).unwrap());
    let host = HipQueues::new(region.clone(), QueueSide::Host).unwrap();
    host.reset_indices();
    let peer = HipQueues::new(region, QueueSide::Peer).unwrap();
    (host, peer)
}

fn r(i: usize) -> MifRef {
    MifRef(0x1_0000 + (i as u32) * 64)
}

#[test]
fn test_fifo_across_sides() {
    let (host, peer) = pair();
    for i in 0..10 {
        host.enqueue(QueueId::FhDat, r(i)).unwrap();
    }
    assert_eq!(peer.pending(QueueId::FhDat), 10);
    for i in 0..10 {
        assert_eq!(peer.dequeue(QueueId::FhDat).unwrap(), Some(r(i)));
    }
    assert_eq!(peer.dequeue(QueueId::FhDat).unwrap(), None);
    assert_eq!(host.pending(QueueId::FhDat), 0);
}

#[test]
fn test_capacity_is_255() {
    let (host, peer) = pair();
    for i in 0..MAX_NUM - 1 {
        host.enqueue(QueueId::FhCtrl, r(i)).unwrap();
    }
    assert!(host.is_full(QueueId::FhCtrl));
    assert!(matches!(
        host.enqueue(QueueId::FhCtrl, r(999)),
        Err(HipError::NoSpace(_))
    ));
    // The failed enqueue left nothing behind
    assert_eq!(peer.pending(QueueId::FhCtrl), 255);

    assert_eq!(peer.dequeue(QueueId::FhCtrl).unwrap(), Some(r(0)));
    host.enqueue(QueueId::FhCtrl, r(255)).unwrap();
    for i in 1..=255 {
        assert_eq!(peer.dequeue(QueueId::FhCtrl).unwrap(), Some(r(i)));
    }
    assert_eq!(peer.dequeue(QueueId::FhCtrl).unwrap(), None);
}

#[test]
fn test_indices_wrap() {
    let (host, peer) = pair();
    for round in 0..3 * MAX_NUM {
        peer.enqueue(QueueId::ThDat, r(round % 1000)).unwrap();
        assert_eq!(host.dequeue(QueueId::ThDat).unwrap(), Some(r(round % 1000)));
    }
    let w = host.read_index(QueueId::ThDat, Index::Write);
    assert_eq!(w as usize, (3 * MAX_NUM) % MAX_NUM);
    assert_eq!(host.pending(QueueId::ThDat), 0);
}

#[test]
fn test_sides_own_their_queues() {
    let (host, peer) = pair();
    for q in QueueId::ALL {
        let (producer, consumer) = if q.host_produces() { (&host, &peer) } else { (&peer, &host) };
        assert!(consumer.enqueue(q, r(1)).is_err(), "{} consumer enqueued", q);
        assert!(producer.dequeue(q).is_err(), "{} producer dequeued", q);
        producer.enqueue(q, r(1)).unwrap();
        assert_eq!(consumer.dequeue(q).unwrap(), Some(r(1)));
    }
}

#[test]
fn test_queues_are_independent() {
    let (host, peer) = pair();
    host.enqueue(QueueId::FhCtrl, r(1)).unwrap();
    host.enqueue(QueueId::ThRfb, r(2)).unwrap();
    peer.enqueue(QueueId::FhRfb, r(3)).unwrap();

    let snap = host.snapshot();
    assert_eq!(snap[QueueId::FhCtrl.index()], (1, 0));
    assert_eq!(snap[QueueId::FhDat.index()], (0, 0));
    assert_eq!(snap[QueueId::ThRfb.index()], (1, 0));
    assert_eq!(snap[QueueId::FhRfb.index()], (1, 0));

    assert_eq!(host.dequeue(QueueId::FhRfb).unwrap(), Some(r(3)));
    assert_eq!(peer.dequeue(QueueId::ThRfb).unwrap(), Some(r(2)));
    assert_eq!(peer.dequeue(QueueId::FhCtrl).unwrap(), Some(r(1)));
    println!("{:?}", host);
}

#[test]
fn test_producer_consumer_threads() {
    let region = Arc::new(MifRegion::anonymous(64 * 1024).unwrap());
    let host = Arc::new(HipQueues::new(region.clone(), QueueSide::Host).unwrap());
    host.reset_indices();
    let peer = HipQueues::new(region, QueueSide::Peer).unwrap();
    const N: usize = 20_000;

    let producer = {
        let host = host.clone();
        thread::spawn(move || {
            let mut i = 0;
            while i < N {
                match host.enqueue(QueueId::FhDat, r(i % 4096)) {
                    Ok(()) => i += 1,
                    Err(HipError::NoSpace(_)) => thread::yield_now(),
                    Err(e) => panic!("enqueue failed: {}", e),
                }
            }
        })
    };

    let mut next = 0;
    while next < N {
        match peer.dequeue(QueueId::FhDat).unwrap() {
            Some(got) => {
                assert_eq!(got, r(next % 4096), "out of order at {}", next);
                next += 1;
            }
            None => thread::yield_now(),
        }
    }
    producer.join().unwrap();
}

#[test]
fn test_mailbox_word() {
    let (host, peer) = pair();
    let mbox = host.mailbox(SMAPPER_MBOX_SCB).unwrap();
    mbox.store(0b0110, std::sync::atomic::Ordering::SeqCst);
    assert_eq!(
        peer.mailbox(SMAPPER_MBOX_SCB).unwrap().load(std::sync::atomic::Ordering::SeqCst),
        0b0110
    );
    // Index bytes are not mailbox words
    assert!(host.mailbox(0).is_none());
    assert!(host.mailbox(255).is_some());
}
