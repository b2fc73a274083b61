// tests/smapper.rs
//
// SMAPPER banks: refill handshake through the mailbox word, descriptor
// frames resolved into payloads, and recovery from mapping failures.
//
// Run with: cargo test --test smapper -- --nocapture

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use dmxp_hip::HIP::collab::FrameDispatch;
use dmxp_hip::HIP::config::{HipConfig, SmapperConfig};
use dmxp_hip::HIP::mif::SoftMif;
use dmxp_hip::HIP::smapper::{
    mapped_bit, owner_bit, SmapperDescriptor, SoftSmapper, BULK_DATA_DESCRIPTOR_INLINE,
    BULK_DATA_DESCRIPTOR_SMAPPER,
};
use dmxp_hip::HIP::Structs::{Frame, SignalHeader, MA_UNITDATA_IND};
use dmxp_hip::HIP::{PeerEndpoint, Transport, TransportBuilder};
use dmxp_hip::{HipError, HipResult};
use parking_lot::Mutex;

#[derive(Default)]
struct Collector(Mutex<Vec<Frame>>);

impl FrameDispatch for Collector {
    fn dispatch(&self, frame: Frame, _is_control: bool) -> HipResult<()> {
        self.0.lock().push(frame);
        Ok(())
    }
}

struct Link {
    transport: Transport,
    peer: PeerEndpoint,
    hw: Arc<SoftSmapper>,
    rx: Arc<Collector>,
}

const BANKS: u8 = 2;
const ENTRIES: u8 = 4;
const ENTRY_SIZE: usize = 4096;

fn link() -> Link {
    let mif = SoftMif::new();
    let hw = SoftSmapper::new(ENTRIES as usize);
    let rx = Arc::new(Collector::default());
    let transport = TransportBuilder::new()
        .with_interrupts(mif.clone())
        .with_dispatch(rx.clone())
        .with_smapper(SmapperConfig::uniform(BANKS, ENTRIES), hw.clone())
        .build()
        .expect("transport");
    let peer = PeerEndpoint::attach(&transport, mif, 4, 0, 0).expect("peer");
    transport.setup().expect("setup");
    Link {
        transport,
        peer,
        hw,
        rx,
    }
}

fn all_banks_mapped() -> u32 {
    (0..BANKS).map(|b| owner_bit(b) | mapped_bit(b)).fold(0, |a, b| a | b)
}

fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(1));
    }
}

fn refilled() -> Link {
    let l = link();
    assert!(l.peer.raise_smapper_refill());
    wait_for("banks handed over", || l.peer.mailbox() == all_banks_mapped());
    l
}

fn descriptor_signal(desc: SmapperDescriptor) -> Vec<u8> {
    let mut signal = SignalHeader {
        id: MA_UNITDATA_IND,
        ..Default::default()
    }
    .to_bytes()
    .to_vec();
    signal.extend_from_slice(&desc.to_bytes());
    signal
}

#[test]
fn test_config_advertises_banks() {
    let l = link();
    let v4 = l.transport.queues().config_v4();
    let (entries, pow_sz) = (v4.smapper_entries_banks, v4.smapper_pow_sz);
    let (req, ind) = (v4.smapper_th_req, v4.smapper_fh_ind);
    assert_eq!(&entries[..3], &[ENTRIES, ENTRIES, 0]);
    assert_eq!(&pow_sz[..3], &[12, 12, 0]);
    assert_ne!(req, 0xff);
    assert_ne!(ind, 0xff);
    assert_eq!(l.transport.smapper_mailbox(), Some(0));
}

#[test]
fn test_refill_hands_banks_to_peer() {
    let l = refilled();
    assert_eq!(l.hw.mapped_count(), (BANKS * ENTRIES) as usize);
    let smapper = l.transport.smapper().expect("smapper");
    for bank in 0..BANKS {
        assert_eq!(smapper.mapped_entries(bank), ENTRIES as usize);
    }
    // Banks the peer owns are left alone
    assert_eq!(l.transport.smapper_refill(), 0);
    assert_eq!(l.hw.mapped_count(), (BANKS * ENTRIES) as usize);
}

#[test]
fn test_send_requires_ownership() {
    let l = link();
    let res = l.peer.send_smapper_frame(&l.hw, 0, 0, 0, b"too early");
    assert!(matches!(res, Err(HipError::Smapper(_))));
}

#[test]
fn test_single_entry_frame() {
    let l = refilled();
    let data = b"payload written straight into a host buffer".to_vec();
    l.peer.send_smapper_frame(&l.hw, 0, 1, 64, &data).unwrap();

    wait_for("descriptor frame", || l.rx.0.lock().len() == 1);
    let frame = l.rx.0.lock()[0].clone();
    assert_eq!(frame.signal_id(), MA_UNITDATA_IND);
    assert_eq!(frame.payload(), data);

    // The consumed entry was backfilled
    assert_eq!(l.transport.smapper().unwrap().mapped_entries(0), ENTRIES as usize);
    assert_eq!(l.hw.mapped_count(), (BANKS * ENTRIES) as usize);
}

#[test]
fn test_multi_entry_frame() {
    let l = refilled();
    let data: Vec<u8> = (0..6000u32).map(|i| (i * 7) as u8).collect();
    l.peer.send_smapper_frame(&l.hw, 1, 0, 100, &data).unwrap();

    wait_for("spanning frame", || l.rx.0.lock().len() == 1);
    assert_eq!(l.rx.0.lock()[0].payload(), data);
    assert_eq!(l.transport.smapper().unwrap().mapped_entries(1), ENTRIES as usize);
}

#[test]
fn test_failed_mapping_retried_on_next_refill() {
    let l = link();
    l.hw.fail_next_maps(1);
    assert_eq!(l.transport.smapper_refill(), 1);

    // Bank 0 is handed over unmapped, bank 1 is fine
    let mbox = l.peer.mailbox();
    assert_eq!(mbox & (owner_bit(0) | mapped_bit(0)), owner_bit(0));
    assert_eq!(mbox & (owner_bit(1) | mapped_bit(1)), owner_bit(1) | mapped_bit(1));
    assert_eq!(l.transport.smapper().unwrap().mapped_entries(0), 0);

    l.peer.return_bank(0);
    assert!(l.peer.raise_smapper_refill());
    wait_for("bank 0 mapped", || l.peer.mailbox() == all_banks_mapped());
    assert_eq!(l.hw.mapped_count(), (BANKS * ENTRIES) as usize);
}

#[test]
fn test_bad_descriptors_dropped() {
    let l = refilled();
    let bad = [
        // Unknown bank
        SmapperDescriptor { bank: 7, entry: 0, len: 10, headroom: 0 },
        // Headroom swallows the whole entry
        SmapperDescriptor { bank: 0, entry: 0, len: 10, headroom: ENTRY_SIZE as u16 },
        // Runs past the last entry
        SmapperDescriptor { bank: 0, entry: ENTRIES - 1, len: 9000, headroom: 0 },
        SmapperDescriptor { bank: 0, entry: 0, len: 0, headroom: 0 },
    ];
    for desc in bad {
        l.peer
            .send_to_host(&Frame::signal_only(descriptor_signal(desc)), false)
            .unwrap();
    }
    wait_for("drops counted", || l.transport.stats().rx_dropped == bad.len() as u64);
    assert!(l.rx.0.lock().is_empty());
    assert_eq!(l.hw.mapped_count(), (BANKS * ENTRIES) as usize);

    // Still usable afterwards
    l.peer.send_smapper_frame(&l.hw, 0, 0, 0, b"ok").unwrap();
    wait_for("good frame", || l.rx.0.lock().len() == 1);
}

#[test]
fn test_inline_indication_is_not_a_descriptor() {
    let l = refilled();
    let header = SignalHeader {
        id: MA_UNITDATA_IND,
        ..Default::default()
    }
    .to_bytes()
    .to_vec();

    // Zeroed body: the bulk data descriptor field reads INLINE
    let mut inline = header.clone();
    inline.extend_from_slice(&[0u8; 8]);
    assert_eq!(&inline[header.len()..header.len() + 2], &BULK_DATA_DESCRIPTOR_INLINE.to_le_bytes());
    assert_eq!(SmapperDescriptor::parse(&inline), None);
    l.peer.send_to_host(&Frame::signal_only(inline.clone()), false).unwrap();

    // Too short to carry the field at all
    l.peer.send_to_host(&Frame::signal_only(header.clone()), false).unwrap();

    wait_for("inline indications", || l.rx.0.lock().len() == 2);
    let got = l.rx.0.lock().clone();
    assert_eq!(got[0].signal, inline);
    assert!(got[0].payload().is_empty());
    assert_eq!(got[1].signal, header);
    assert_eq!(l.transport.stats().rx_dropped, 0);
    // No entry was consumed
    assert_eq!(l.hw.mapped_count(), (BANKS * ENTRIES) as usize);
    for bank in 0..BANKS {
        assert_eq!(l.transport.smapper().unwrap().mapped_entries(bank), ENTRIES as usize);
    }
}

#[test]
fn test_truncated_descriptor_dropped() {
    let l = refilled();
    let mut signal = SignalHeader {
        id: MA_UNITDATA_IND,
        ..Default::default()
    }
    .to_bytes()
    .to_vec();
    signal.extend_from_slice(&BULK_DATA_DESCRIPTOR_SMAPPER.to_le_bytes());
    signal.extend_from_slice(&[0, 0]);
    l.peer.send_to_host(&Frame::signal_only(signal), false).unwrap();

    wait_for("drop counted", || l.transport.stats().rx_dropped == 1);
    assert!(l.rx.0.lock().is_empty());
}

#[test]
fn test_refill_ignored_while_suspended() {
    let l = link();
    l.transport.suspend().unwrap();
    assert_eq!(l.transport.smapper_refill(), 0);
    assert_eq!(l.peer.mailbox(), 0);

    l.transport.resume().unwrap();
    assert_eq!(l.transport.smapper_refill(), BANKS as usize);
    assert_eq!(l.peer.mailbox(), all_banks_mapped());
}

#[test]
fn test_teardown_unmaps_everything() {
    let l = refilled();
    l.transport.teardown().unwrap();
    assert_eq!(l.hw.mapped_count(), 0);
    assert_eq!(l.peer.mailbox(), 0);
}

#[test]
fn test_smapper_config_checked() {
    let config = HipConfig {
        smapper: Some(SmapperConfig::uniform(1, 4)),
        ..Default::default()
    };
    let res = TransportBuilder::new().with_config(config).build();
    assert!(matches!(res, Err(HipError::InvalidArgument(_))));

    let res = TransportBuilder::new()
        .with_smapper(SmapperConfig::uniform(1, 8), SoftSmapper::new(4))
        .build();
    assert!(matches!(res, Err(HipError::Smapper(_))));
}
