use std::time::Duration;

use crate::error::{HipError, HipResult};
use crate::HIP::Buffer::layout::{
    HIP4_CTL_MBULK_SIZE, HIP4_DAT_MBULK_SIZE, HIP4_WLAN_MIB_SIZE, HIP4_WLAN_RX_SIZE,
    HIP4_WLAN_TX_CTL_SIZE, HIP4_WLAN_TX_DAT_SIZE, SMAPPER_MAX_BANKS,
};

/// Frames the data drain handles per run before yielding.
pub const DEFAULT_DATA_BUDGET: usize = 64;

/// Attempts to put one consumed reference on the return queue.
pub const FB_NO_SPC_NUM_RET: u32 = 100;
pub const FB_NO_SPC_SLEEP_MS_CTRL: u64 = 10;
pub const FB_NO_SPC_SLEEP_MS_DATA: u64 = 1;

pub const MAX_STORM: u32 = 5;
pub const MAX_BUFFERED_FRAMES: usize = 10000;

/// One SMAPPER bank offered to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmapperBankConfig {
    pub bank: u8,
    pub entries: u8,
    /// log2 of the entry size
    pub pow_sz: u8,
}

impl SmapperBankConfig {
    pub fn entry_size(&self) -> usize {
        1usize << self.pow_sz
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SmapperConfig {
    pub banks: Vec<SmapperBankConfig>,
}

impl SmapperConfig {
    /// `count` banks of `entries` 4 KiB entries each.
    pub fn uniform(count: u8, entries: u8) -> Self {
        Self {
            banks: (0..count)
                .map(|bank| SmapperBankConfig {
                    bank,
                    entries,
                    pow_sz: 12,
                })
                .collect(),
        }
    }
}

/// Everything tunable about a transport. Timing constants default to values
/// that suit the reference firmware; nothing else depends on them.
#[derive(Debug, Clone)]
pub struct HipConfig {
    /// Named `/dev/shm` region, or an anonymous heap region when `None`
    pub region_name: Option<String>,
    pub mib_size: usize,
    pub tx_dat_size: usize,
    pub tx_ctl_size: usize,
    pub rx_size: usize,
    pub dat_mbulk_size: usize,
    pub ctl_mbulk_size: usize,
    pub dat_guard: u32,
    pub ctl_guard: u32,

    pub data_budget: usize,
    pub fb_retry_count: u32,
    pub fb_retry_delay_ctrl: Duration,
    pub fb_retry_delay_data: Duration,
    pub watchdog_tick: Duration,
    pub wake_timeout: Duration,
    pub max_storm: u32,

    pub max_buffered_frames: usize,
    pub backpressure_retrigger: Duration,
    pub qos_med_bps: u64,
    pub qos_max_bps: u64,
    pub logging_threshold_bps: u64,

    /// Build chains for payloads that do not fit one segment
    pub tx_allow_chain: bool,
    pub mib: Vec<Vec<u8>>,
    pub smapper: Option<SmapperConfig>,
}

impl Default for HipConfig {
    fn default() -> Self {
        Self {
            region_name: None,
            mib_size: HIP4_WLAN_MIB_SIZE,
            tx_dat_size: HIP4_WLAN_TX_DAT_SIZE,
            tx_ctl_size: HIP4_WLAN_TX_CTL_SIZE,
            rx_size: HIP4_WLAN_RX_SIZE,
            dat_mbulk_size: HIP4_DAT_MBULK_SIZE,
            ctl_mbulk_size: HIP4_CTL_MBULK_SIZE,
            dat_guard: 5,
            ctl_guard: 0,
            data_budget: DEFAULT_DATA_BUDGET,
            fb_retry_count: FB_NO_SPC_NUM_RET,
            fb_retry_delay_ctrl: Duration::from_millis(FB_NO_SPC_SLEEP_MS_CTRL),
            fb_retry_delay_data: Duration::from_millis(FB_NO_SPC_SLEEP_MS_DATA),
            watchdog_tick: Duration::from_secs(1),
            wake_timeout: Duration::from_millis(1000),
            max_storm: MAX_STORM,
            max_buffered_frames: MAX_BUFFERED_FRAMES,
            backpressure_retrigger: Duration::from_millis(20),
            qos_med_bps: 150_000_000,
            qos_max_bps: 250_000_000,
            logging_threshold_bps: 150_000_000,
            tx_allow_chain: true,
            mib: Vec::new(),
            smapper: None,
        }
    }
}

impl HipConfig {
    pub fn mib_len(&self) -> usize {
        self.mib.iter().map(Vec::len).sum()
    }

    pub fn validate(&self) -> HipResult<()> {
        let invalid = |msg: String| Err(HipError::InvalidArgument(msg));

        if self.tx_dat_size == 0 || self.tx_ctl_size == 0 || self.rx_size == 0 {
            return invalid("pool areas must be non-empty".into());
        }
        if self.dat_mbulk_size == 0 || self.ctl_mbulk_size == 0 {
            return invalid("segment sizes must be non-zero".into());
        }
        if self.mib_len() > self.mib_size {
            return invalid(format!(
                "MIB blobs of {} bytes exceed the {} byte MIB area",
                self.mib_len(),
                self.mib_size
            ));
        }
        if self.data_budget == 0 {
            return invalid("data budget must be at least 1".into());
        }
        if self.fb_retry_count == 0 {
            return invalid("return queue needs at least one attempt".into());
        }
        if self.watchdog_tick.is_zero() {
            return invalid("watchdog tick must be non-zero".into());
        }
        if self.qos_med_bps > self.qos_max_bps {
            return invalid(format!(
                "medium QoS threshold {} above max threshold {}",
                self.qos_med_bps, self.qos_max_bps
            ));
        }
        if let Some(smapper) = &self.smapper {
            for bank in &smapper.banks {
                if bank.bank as usize >= SMAPPER_MAX_BANKS {
                    return invalid(format!("smapper bank {} out of range", bank.bank));
                }
                if bank.entries == 0 || !(6..=16).contains(&bank.pow_sz) {
                    return invalid(format!("smapper bank {} has an unusable geometry", bank.bank));
                }
            }
            let mut ids: Vec<u8> = smapper.banks.iter().map(|b| b.bank).collect();
            ids.sort_unstable();
            ids.dedup();
            if ids.len() != smapper.banks.len() {
                return invalid("smapper bank listed twice".into());
            }
        }
        Ok(())
    }
}
