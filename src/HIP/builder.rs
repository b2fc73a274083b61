use std::sync::Arc;
use std::time::Duration;

use super::collab::{Collaborators, DownstreamDepth, FrameDispatch, PowerPolicy, TxCompletion};
use super::config::{HipConfig, SmapperConfig};
use super::mif::{MifInterrupts, SoftMif};
use super::smapper::SmapperHw;
use super::transport::Transport;
use crate::error::HipResult;

pub struct TransportBuilder {
    config: HipConfig,
    mif: Option<Arc<dyn MifInterrupts>>,
    collab: Collaborators,
    smapper_hw: Option<Arc<dyn SmapperHw>>,
}

impl Default for TransportBuilder {
    fn default() -> Self {
        Self {
            config: HipConfig::default(),
            mif: None, // in-process SoftMif
            collab: Collaborators::default(),
            smapper_hw: None,
        }
    }
}

impl TransportBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: HipConfig) -> Self {
        self.config = config;
        self
    }

    /// Back the region with `/dev/shm/<name>` so another process can attach.
    pub fn with_region_name(mut self, name: impl Into<String>) -> Self {
        self.config.region_name = Some(name.into());
        self
    }

    pub fn with_pool_sizes(mut self, tx_dat: usize, tx_ctl: usize, rx: usize) -> Self {
        self.config.tx_dat_size = tx_dat;
        self.config.tx_ctl_size = tx_ctl;
        self.config.rx_size = rx;
        self
    }

    pub fn with_segment_sizes(mut self, dat: usize, ctl: usize) -> Self {
        self.config.dat_mbulk_size = dat;
        self.config.ctl_mbulk_size = ctl;
        self
    }

    pub fn with_mib(mut self, blob: Vec<u8>) -> Self {
        self.config.mib.push(blob);
        self
    }

    pub fn with_data_budget(mut self, budget: usize) -> Self {
        self.config.data_budget = budget;
        self
    }

    pub fn with_return_retries(mut self, count: u32, ctrl_delay: Duration, data_delay: Duration) -> Self {
        self.config.fb_retry_count = count;
        self.config.fb_retry_delay_ctrl = ctrl_delay;
        self.config.fb_retry_delay_data = data_delay;
        self
    }

    pub fn with_watchdog_tick(mut self, tick: Duration) -> Self {
        self.config.watchdog_tick = tick;
        self
    }

    pub fn with_max_buffered_frames(mut self, frames: usize) -> Self {
        self.config.max_buffered_frames = frames;
        self
    }

    pub fn with_tx_chaining(mut self, allow: bool) -> Self {
        self.config.tx_allow_chain = allow;
        self
    }

    pub fn with_interrupts(mut self, mif: Arc<dyn MifInterrupts>) -> Self {
        self.mif = Some(mif);
        self
    }

    pub fn with_dispatch(mut self, dispatch: Arc<dyn FrameDispatch>) -> Self {
        self.collab.dispatch = dispatch;
        self
    }

    pub fn with_tx_completion(mut self, tx_completion: Arc<dyn TxCompletion>) -> Self {
        self.collab.tx_completion = tx_completion;
        self
    }

    pub fn with_downstream(mut self, downstream: Arc<dyn DownstreamDepth>) -> Self {
        self.collab.downstream = downstream;
        self
    }

    pub fn with_power_policy(mut self, power: Arc<dyn PowerPolicy>) -> Self {
        self.collab.power = power;
        self
    }

    pub fn with_smapper(mut self, config: SmapperConfig, hw: Arc<dyn SmapperHw>) -> Self {
        self.config.smapper = Some(config);
        self.smapper_hw = Some(hw);
        self
    }

    /// Initialise the transport. It is left in `Initialised`; call
    /// [`Transport::setup`] once the peer has answered.
    pub fn build(self) -> HipResult<Transport> {
        let mif = self.mif.unwrap_or_else(|| SoftMif::new() as Arc<dyn MifInterrupts>);
        Transport::init(self.config, mif, self.collab, self.smapper_hw)
    }
}
