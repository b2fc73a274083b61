//! Wire layout of the control block at the start of the shared region.
//!
//! ```text
//! offset 0      +-------------------------+
//!               | HipInit (16 B)          |  magic, peer version, config refs
//!        32     | HipConfigV5 (align 32)  |
//!        160    | HipConfigV4 (align 32)  |
//!        448    | Scoreboard  (align 64)  |  queue indices + mailbox words
//!        1472   | HipQueue x 6 (align 64) |  256 references each
//!        8192   +-------------------------+
//! ```
//!
//! The peer reads this once at start-up, so every struct here is
//! byte-for-byte part of the host/peer contract.

use std::sync::atomic::{AtomicU32, AtomicU8};

pub const HIP4_INIT_MAGIC: u32 = 0xcaaa0400;
pub const HIP4_CONFIG_MAGIC: u32 = 0xcaba0401;

/// Number of queues shared with the peer.
pub const MIF_HIP_CFG_Q_NUM: usize = 6;

/// Entries per queue. Indices are `u8`, so this is fixed.
pub const MAX_NUM: usize = 256;

/// Peer-owned indices sit this many bytes after host-owned ones.
pub const FW_OWN_OFS: usize = 64;

/// Interrupt bit value meaning "no interrupt for this queue".
pub const MIF_NO_IRQ: u8 = 0xff;

// Default region map
pub const HIP4_WLAN_CONFIG_OFFSET: usize = 0x0000_0000;
pub const HIP4_WLAN_CONFIG_SIZE: usize = 0x2000;
pub const HIP4_WLAN_MIB_OFFSET: usize = HIP4_WLAN_CONFIG_OFFSET + HIP4_WLAN_CONFIG_SIZE;
pub const HIP4_WLAN_MIB_SIZE: usize = 0x8000;
pub const HIP4_WLAN_TX_DAT_SIZE: usize = 0x10_0000;
pub const HIP4_WLAN_TX_CTL_SIZE: usize = 0x1_0000;
pub const HIP4_WLAN_RX_SIZE: usize = 0x10_0000;

/// Usable bytes in each host segment.
pub const HIP4_DAT_MBULK_SIZE: usize = 2 * 1024;
pub const HIP4_CTL_MBULK_SIZE: usize = 2 * 1024;

/// Scoreboard byte offsets `[write, read]` per queue.
///
/// Host owns: FH_CTRL/FH_DAT write, FH_RFB read, TH_CTRL/TH_DAT read, TH_RFB write.
/// Everything the host owns is below `FW_OWN_OFS`.
pub const Q_IDX_LAYOUT: [[usize; 2]; MIF_HIP_CFG_Q_NUM] = [
    [0, FW_OWN_OFS],     // FH_CTRL
    [1, 1 + FW_OWN_OFS], // FH_DAT
    [2 + FW_OWN_OFS, 2], // FH_RFB
    [3 + FW_OWN_OFS, 3], // TH_CTRL
    [4 + FW_OWN_OFS, 4], // TH_DAT
    [5, 5 + FW_OWN_OFS], // TH_RFB
];

pub const SCOREBOARD_IDX_BYTES: usize = 128;
pub const SCOREBOARD_WORDS: usize = 256 - SCOREBOARD_IDX_BYTES / 4;

/// Scoreboard word (counting from the start of the scoreboard in `u32`s)
/// holding the SMAPPER mailbox.
pub const SMAPPER_MBOX_SCB: u8 = (SCOREBOARD_IDX_BYTES / 4) as u8;

pub const SMAPPER_MAX_BANKS: usize = 16;

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Default)]
pub struct HipInit {
    /// Host owned
    pub magic_number: u32,
    /// Peer owned: which config record it accepted (4 or 5)
    pub conf_hip4_ver: u32,
    /// Region offset of the v4 record
    pub version_a_ref: u32,
    /// Region offset of the v5 record
    pub version_b_ref: u32,
}

/// Config record, version 5 (single to-host interrupt).
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Default)]
pub struct HipConfigV5 {
    pub magic_number: u32,
    pub hip_config_ver: u16,
    pub config_len: u16,

    // peer owned
    pub compat_flag: u32,
    pub sap_mlme_ver: u16,
    pub sap_ma_ver: u16,
    pub sap_debug_ver: u16,
    pub sap_test_ver: u16,
    pub fw_build_id: u32,
    pub fw_patch_id: u32,
    pub unidat_req_headroom: u8,
    pub unidat_req_tailroom: u8,
    pub bulk_buffer_align: u8,

    // host owned
    pub host_cache_line: u8,
    pub host_buf_loc: u32,
    pub host_buf_sz: u32,
    pub fw_buf_loc: u32,
    pub fw_buf_sz: u32,
    pub mib_loc: u32,
    pub mib_sz: u32,
    pub log_config_loc: u32,
    pub log_config_sz: u32,
    pub mif_fh_int_n: u8,
    pub mif_th_int_n: u8,
    pub reserved: [u8; 2],
    pub scbrd_loc: u32,
    pub q_num: u16,
    pub q_len: u16,
    pub q_idx_sz: u16,
    pub reserved2: [u8; 2],
    pub q_loc: [u32; MIF_HIP_CFG_Q_NUM],
    pub reserved3: [u8; 16],
}

/// Config record, version 4 (per-queue to-host interrupts, SMAPPER fields).
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Default)]
pub struct HipConfigV4 {
    pub magic_number: u32,
    pub hip_config_ver: u16,
    pub config_len: u16,

    // peer owned
    pub compat_flag: u32,
    pub sap_mlme_ver: u16,
    pub sap_ma_ver: u16,
    pub sap_debug_ver: u16,
    pub sap_test_ver: u16,
    pub fw_build_id: u32,
    pub fw_patch_id: u32,
    pub unidat_req_headroom: u8,
    pub unidat_req_tailroom: u8,
    pub bulk_buffer_align: u8,

    // host owned
    pub host_cache_line: u8,
    pub host_buf_loc: u32,
    pub host_buf_sz: u32,
    pub fw_buf_loc: u32,
    pub fw_buf_sz: u32,
    pub mib_loc: u32,
    pub mib_sz: u32,
    pub log_config_loc: u32,
    pub log_config_sz: u32,
    pub mif_fh_int_n: u8,
    pub reserved1: [u8; 3],
    pub mif_th_int_n: [u8; MIF_HIP_CFG_Q_NUM],
    pub reserved2: [u8; 2],
    pub scbrd_loc: u32,
    pub q_num: u16,
    pub q_len: u16,
    pub q_idx_sz: u16,
    pub reserved3: [u8; 2],
    pub q_loc: [u32; MIF_HIP_CFG_Q_NUM],

    pub smapper_th_req: u8,
    pub smapper_fh_ind: u8,
    pub smapper_mbox_scb: u8,
    pub smapper_entries_banks: [u8; SMAPPER_MAX_BANKS],
    /// log2 of the entry size, 12 = 4 KiB
    pub smapper_pow_sz: [u8; SMAPPER_MAX_BANKS],
    pub smapper_bank_addr: [u32; SMAPPER_MAX_BANKS],
    pub reserved4: [u8; 16],
}

#[repr(C, align(32))]
#[derive(Debug, Clone, Copy)]
pub struct Aligned32<T>(pub T);

/// Queue cursors plus spare words.
///
/// Index bytes are addressed through [`Q_IDX_LAYOUT`]. The trailing words
/// carry side channels such as the SMAPPER mailbox.
#[repr(C, align(64))]
pub struct Scoreboard {
    pub idx: [AtomicU8; SCOREBOARD_IDX_BYTES],
    pub words: [AtomicU32; SCOREBOARD_WORDS],
}

impl Scoreboard {
    /// Mailbox word addressed the way the config record does, in `u32`
    /// units from the scoreboard start.
    pub fn word(&self, scb_index: u8) -> Option<&AtomicU32> {
        (scb_index as usize)
            .checked_sub(SCOREBOARD_IDX_BYTES / 4)
            .and_then(|i| self.words.get(i))
    }
}

#[repr(C, align(64))]
pub struct HipQueue {
    pub array: [AtomicU32; MAX_NUM],
    /// Mirrors kept for peer-side tooling; the scoreboard is authoritative
    pub idx_read: AtomicU8,
    pub idx_write: AtomicU8,
    pub total: AtomicU8,
}

#[repr(C, align(4096))]
pub struct HipControl {
    pub init: HipInit,
    pub config_v5: Aligned32<HipConfigV5>,
    pub config_v4: Aligned32<HipConfigV4>,
    pub scoreboard: Scoreboard,
    pub q: [HipQueue; MIF_HIP_CFG_Q_NUM],
}

/// Where each area of the shared region starts. Built from the sizes in the
/// transport configuration; offsets follow the fixed order
/// CONFIG, MIB, TX_DAT, TX_CTL, RX.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionMap {
    pub config_offset: usize,
    pub config_size: usize,
    pub mib_offset: usize,
    pub mib_size: usize,
    pub tx_dat_offset: usize,
    pub tx_dat_size: usize,
    pub tx_ctl_offset: usize,
    pub tx_ctl_size: usize,
    pub rx_offset: usize,
    pub rx_size: usize,
}

impl RegionMap {
    pub fn new(mib_size: usize, tx_dat_size: usize, tx_ctl_size: usize, rx_size: usize) -> Self {
        let align = |v: usize| (v + 4095) & !4095;
        let config_size = align(HIP4_WLAN_CONFIG_SIZE.max(std::mem::size_of::<HipControl>()));
        let mib_offset = HIP4_WLAN_CONFIG_OFFSET + config_size;
        let mib_size = align(mib_size);
        let tx_dat_offset = mib_offset + mib_size;
        let tx_dat_size = align(tx_dat_size);
        let tx_ctl_offset = tx_dat_offset + tx_dat_size;
        let tx_ctl_size = align(tx_ctl_size);
        let rx_offset = tx_ctl_offset + tx_ctl_size;
        Self {
            config_offset: HIP4_WLAN_CONFIG_OFFSET,
            config_size,
            mib_offset,
            mib_size,
            tx_dat_offset,
            tx_dat_size,
            tx_ctl_offset,
            tx_ctl_size,
            rx_offset,
            rx_size: align(rx_size),
        }
    }

    pub fn total_size(&self) -> usize {
        self.rx_offset + self.rx_size
    }

    /// Host buffer area as published in the config record.
    pub fn host_buf(&self) -> (usize, usize) {
        (self.tx_dat_offset, self.tx_dat_size + self.tx_ctl_size)
    }
}

impl Default for RegionMap {
    fn default() -> Self {
        Self::new(
            HIP4_WLAN_MIB_SIZE,
            HIP4_WLAN_TX_DAT_SIZE,
            HIP4_WLAN_TX_CTL_SIZE,
            HIP4_WLAN_RX_SIZE,
        )
    }
}
