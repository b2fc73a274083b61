// Layout conformance tests for the host/peer contract.
// These tests assert sizes, alignments, and field offsets of everything the
// peer reads out of the shared region. They also print the observed values
// to aid debugging when a mismatch occurs on a given platform.
use dmxp_hip::Core::mbulk::{MbulkHeader, MBULK_HEADER_SIZE};
use dmxp_hip::HIP::Buffer::layout::{
    HipConfigV4, HipConfigV5, HipControl, HipInit, HipQueue, RegionMap, Scoreboard, HIP4_WLAN_CONFIG_SIZE,
    SMAPPER_MBOX_SCB,
};
use dmxp_hip::HIP::Structs::SignalHeader;
use memoffset::offset_of;
use std::mem::{align_of, size_of};

#[test]
fn test_mbulk_header_layout() {
    let size = size_of::<MbulkHeader>();
    let off_flag = offset_of!(MbulkHeader, flag);
    let off_clas = offset_of!(MbulkHeader, clas);
    let off_pid = offset_of!(MbulkHeader, pid);
    let off_refcnt = offset_of!(MbulkHeader, refcnt);
    let off_dat_bufsz = offset_of!(MbulkHeader, dat_bufsz);
    let off_sig_bufsz = offset_of!(MbulkHeader, sig_bufsz);
    let off_head = offset_of!(MbulkHeader, head);
    let off_len = offset_of!(MbulkHeader, len);
    let off_chain_next = offset_of!(MbulkHeader, chain_next);

    println!(
        "MbulkHeader => size: {size}, offsets: [flag:{off_flag}, clas:{off_clas}, pid:{off_pid}, refcnt:{off_refcnt}, dat_bufsz:{off_dat_bufsz}, sig_bufsz:{off_sig_bufsz}, head:{off_head}, len:{off_len}, chain_next:{off_chain_next}]"
    );

    assert_eq!(size, 32);
    assert_eq!(size, MBULK_HEADER_SIZE);
    assert_eq!(off_flag, 0);
    assert_eq!(off_clas, 1);
    assert_eq!(off_pid, 2);
    assert_eq!(off_refcnt, 3);
    assert_eq!(off_dat_bufsz, 4);
    assert_eq!(off_sig_bufsz, 8);
    assert_eq!(off_head, 10);
    assert_eq!(off_len, 12);
    assert_eq!(off_chain_next, 16);
}

#[test]
fn test_config_records_layout() {
    println!(
        "HipInit {} HipConfigV5 {} HipConfigV4 {}",
        size_of::<HipInit>(),
        size_of::<HipConfigV5>(),
        size_of::<HipConfigV4>()
    );
    assert_eq!(size_of::<HipInit>(), 16);
    assert_eq!(size_of::<HipConfigV5>(), 120);
    assert_eq!(size_of::<HipConfigV4>(), 227);

    // Fields both records share sit at the same place
    assert_eq!(offset_of!(HipConfigV5, unidat_req_headroom), 28);
    assert_eq!(offset_of!(HipConfigV4, unidat_req_headroom), 28);
    assert_eq!(offset_of!(HipConfigV5, host_buf_loc), 32);
    assert_eq!(offset_of!(HipConfigV4, host_buf_loc), 32);
    assert_eq!(offset_of!(HipConfigV5, mif_fh_int_n), 64);
    assert_eq!(offset_of!(HipConfigV4, mif_fh_int_n), 64);

    assert_eq!(offset_of!(HipConfigV5, scbrd_loc), 68);
    assert_eq!(offset_of!(HipConfigV5, q_loc), 80);
    assert_eq!(offset_of!(HipConfigV4, mif_th_int_n), 68);
    assert_eq!(offset_of!(HipConfigV4, scbrd_loc), 76);
    assert_eq!(offset_of!(HipConfigV4, q_loc), 88);
    assert_eq!(offset_of!(HipConfigV4, smapper_th_req), 112);
    assert_eq!(offset_of!(HipConfigV4, smapper_entries_banks), 115);
    assert_eq!(offset_of!(HipConfigV4, smapper_bank_addr), 147);
}

#[test]
fn test_control_block_layout() {
    let off_init = offset_of!(HipControl, init);
    let off_v5 = offset_of!(HipControl, config_v5);
    let off_v4 = offset_of!(HipControl, config_v4);
    let off_scoreboard = offset_of!(HipControl, scoreboard);
    let off_q = offset_of!(HipControl, q);
    println!(
        "HipControl => size: {}, align: {}, offsets: [init:{off_init}, config_v5:{off_v5}, config_v4:{off_v4}, scoreboard:{off_scoreboard}, q:{off_q}]",
        size_of::<HipControl>(),
        align_of::<HipControl>()
    );

    assert_eq!(off_init, 0);
    assert_eq!(off_v5, 32);
    assert_eq!(off_v4, 160);
    assert_eq!(off_scoreboard, 448);
    assert_eq!(off_q, 1472);

    assert_eq!(size_of::<Scoreboard>(), 1024);
    assert_eq!(align_of::<Scoreboard>(), 64);
    assert_eq!(size_of::<HipQueue>(), 1088);
    assert_eq!(size_of::<HipControl>(), 8192);
    assert!(size_of::<HipControl>() <= HIP4_WLAN_CONFIG_SIZE);

    // The mailbox is the first spare word after the index bytes
    assert_eq!(SMAPPER_MBOX_SCB, 32);
}

#[test]
fn test_region_map_order() {
    let map = RegionMap::new(0x8000, 0x10_0000, 0x1_0000, 0x10_0000);
    assert_eq!(map.config_offset, 0);
    assert_eq!(map.mib_offset, map.config_size);
    assert_eq!(map.tx_dat_offset, map.mib_offset + map.mib_size);
    assert_eq!(map.tx_ctl_offset, map.tx_dat_offset + map.tx_dat_size);
    assert_eq!(map.rx_offset, map.tx_ctl_offset + map.tx_ctl_size);
    assert_eq!(map.total_size(), 0x2000 + 0x8000 + 0x10_0000 + 0x1_0000 + 0x10_0000);
    assert_eq!(map.host_buf(), (map.tx_dat_offset, 0x11_0000));

    // Odd sizes round up to whole pages
    let odd = RegionMap::new(100, 5000, 1, 4097);
    assert_eq!(odd.mib_size, 4096);
    assert_eq!(odd.tx_dat_size, 8192);
    assert_eq!(odd.tx_ctl_size, 4096);
    assert_eq!(odd.rx_size, 8192);
    assert_eq!(odd.tx_dat_offset % 4096, 0);
}

#[test]
fn test_signal_header_wire_format() {
    let h = SignalHeader {
        id: 0x1002,
        receiver_pid: 0x0102,
        sender_pid: 0x0304,
        fw_reference: 0x0a0b0c0d,
    };
    let bytes = h.to_bytes();
    assert_eq!(bytes, [0x02, 0x10, 0x02, 0x01, 0x04, 0x03, 0x0d, 0x0c, 0x0b, 0x0a]);
    assert_eq!(SignalHeader::parse(&bytes), Some(h));
    assert_eq!(SignalHeader::parse(&bytes[..9]), None);
}
