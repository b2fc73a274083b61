//! The transport context and its lifecycle.
//!
//! ```text
//!  Idle --init--> Initialised --setup--> Started <--suspend/resume--> Suspended
//!                      |                    |                             |
//!                      +------freeze--------+-----------freeze------------+--> Closing
//!  any --teardown--> Closing --> Closed
//! ```
//!
//! Everything the interrupt handlers, workers and watchdog touch lives in
//! [`HipInner`]. They hold it weakly, so dropping the [`Transport`] tears the
//! whole thing down.

use std::collections::VecDeque;
use std::fmt;
use std::mem::{offset_of, size_of};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering::Relaxed, Ordering::SeqCst};
use std::sync::{Arc, OnceLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;
use log::{debug, error, info, warn};
use parking_lot::Mutex;

use super::collab::{Collaborators, QosLevel};
use super::config::HipConfig;
use super::irq::RxSource;
use super::mif::{IrqHandler, MifInterrupts};
use super::policy::{FlowPolicy, Thresholds};
use super::smapper::{Smapper, SmapperHw};
use super::stats::{HipStats, HistoryRecord, StatsSnapshot};
use super::watchdog::Watchdog;
use super::worker::{DrainOutcome, Policy, Worker};
use crate::error::{HipError, HipResult};
use crate::Core::mbulk::{MbulkAllocator, MBULK_POOL_ID_CTRL, MBULK_POOL_ID_DATA};
use crate::Core::region::{MifRef, MifRegion};
use crate::Core::SharedMemory::create_shared_memory;
use crate::HIP::Buffer::layout::{
    HipConfigV4, HipConfigV5, HipControl, HipInit, HipQueue, RegionMap, HIP4_CONFIG_MAGIC,
    HIP4_INIT_MAGIC, MAX_NUM, MIF_HIP_CFG_Q_NUM, MIF_NO_IRQ, SMAPPER_MAX_BANKS, SMAPPER_MBOX_SCB,
};
use crate::HIP::Buffer::{HipQueues, QueueId, QueueSide};
use crate::HIP::Structs::Frame;

/// Alignment the peer must use for bulk data.
const BULK_BUFFER_ALIGN: u8 = 4;
const HOST_CACHE_LINE: u8 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Idle,
    Initialised,
    Started,
    Suspended,
    Closing,
    Closed,
}

impl TransportState {
    pub fn name(self) -> &'static str {
        match self {
            TransportState::Idle => "idle",
            TransportState::Initialised => "initialised",
            TransportState::Started => "started",
            TransportState::Suspended => "suspended",
            TransportState::Closing => "closing",
            TransportState::Closed => "closed",
        }
    }
}

/// Interrupt bits in use, fixed at init.
#[derive(Debug, Clone, Copy)]
pub(crate) struct IrqBits {
    /// To-host bit per [`RxSource`]
    pub th: [u32; 3],
    /// From-host bit for every queue
    pub fh: u32,
    pub smapper_req: Option<u32>,
    pub smapper_ind: Option<u32>,
}

pub(crate) struct HipInner {
    pub(crate) config: HipConfig,
    pub(crate) map: RegionMap,
    pub(crate) region: Arc<MifRegion>,
    pub(crate) allocator: MbulkAllocator,
    pub(crate) queues: HipQueues,
    pub(crate) mif: Arc<dyn MifInterrupts>,
    pub(crate) collab: Collaborators,
    pub(crate) stats: HipStats,
    pub(crate) policy: FlowPolicy,
    pub(crate) smapper: Option<Smapper>,
    pub(crate) watchdog: Watchdog,
    /// Indexed by [`RxSource`]
    pub(crate) workers: [Worker; 3],
    pub(crate) smapper_worker: Worker,
    pub(crate) irq: IrqBits,

    pub(crate) state: Mutex<TransportState>,
    pub(crate) closing: AtomicBool,
    pub(crate) started: AtomicBool,
    pub(crate) suspended: AtomicBool,
    /// Peer accepted the v5 record: one to-host interrupt for everything
    pub(crate) single_irq: AtomicBool,
    /// Written by top halves and workers on different threads
    pub(crate) pending: [CachePadded<AtomicBool>; 3],
    pub(crate) storm_count: [AtomicU32; 3],
    /// Nanoseconds after `epoch` plus one, 0 when never
    pub(crate) intr_received: [CachePadded<AtomicU64>; 3],
    pub(crate) epoch: Instant,
    pub(crate) return_backlog: Mutex<VecDeque<MifRef>>,
    pub(crate) inflight_tx: AtomicUsize,
    pub(crate) unidat_headroom: AtomicUsize,
    pub(crate) unidat_tailroom: AtomicUsize,
}

impl HipInner {
    /// Mailbox word shared with the peer for SMAPPER banks.
    pub(crate) fn smapper_mailbox(&self) -> Option<&AtomicU32> {
        self.queues.mailbox(SMAPPER_MBOX_SCB)
    }

    /// SMAPPER refill. Ignored while suspended or closing.
    pub(crate) fn smapper_refill(&self) -> usize {
        let Some(smapper) = self.smapper.as_ref() else {
            return 0;
        };
        if self.suspended.load(SeqCst) || self.closing.load(SeqCst) {
            debug!("smapper: refill ignored while {}", self.state.lock().name());
            return 0;
        }
        let Some(mailbox) = self.smapper_mailbox() else {
            return 0;
        };
        let mapped = smapper.refill(mailbox);
        if let Some(bit) = self.irq.smapper_ind {
            self.mif.raise_fromhost(bit);
        }
        mapped
    }

    fn smapper_bottom_half(&self) -> DrainOutcome {
        self.smapper_refill();
        if let Some(bit) = self.irq.smapper_req {
            if !self.closing.load(SeqCst) {
                self.mif.unmask(bit);
            }
        }
        DrainOutcome::Done
    }

    fn all_bits(&self) -> Vec<u32> {
        self.irq.th.iter().copied().chain(self.irq.smapper_req).collect()
    }

    pub(crate) fn dump_state(&self) -> String {
        let snap = self.queues.snapshot();
        let mut out = String::new();
        for q in QueueId::ALL {
            let (w, r) = snap[q.index()];
            out.push_str(&format!("{}: w {:3} r {:3}; ", q, w, r));
        }
        let masked: Vec<bool> = self.irq.th.iter().map(|&b| self.mif.is_masked(b)).collect();
        let pending: Vec<bool> = self.pending.iter().map(|p| p.load(Relaxed)).collect();
        out.push_str(&format!(
            "masked {:?} pending {:?} watchdog {} backlog {} host in use {}",
            masked,
            pending,
            self.watchdog.is_active(),
            self.return_backlog.lock().len(),
            self.host_buffers_outstanding()
        ));
        out
    }

    pub(crate) fn dump(&self, why: &str) {
        error!("hip: {}: {}", why, self.dump_state());
    }

    fn write_config_records(&self) {
        let map = &self.map;
        let q_base = offset_of!(HipControl, q);
        let mut q_loc = [0u32; MIF_HIP_CFG_Q_NUM];
        for (i, loc) in q_loc.iter_mut().enumerate() {
            *loc = (q_base + i * size_of::<HipQueue>()) as u32;
        }
        let (host_buf_loc, host_buf_sz) = map.host_buf();
        let mib_sz = self.config.mib_len() as u32;
        let scbrd_loc = offset_of!(HipControl, scoreboard) as u32;

        let mut th_per_q = [MIF_NO_IRQ; MIF_HIP_CFG_Q_NUM];
        for src in RxSource::ALL {
            th_per_q[src.queue().index()] = self.irq.th[src.index()] as u8;
        }

        let mut v4 = HipConfigV4 {
            magic_number: HIP4_CONFIG_MAGIC,
            hip_config_ver: 4,
            config_len: size_of::<HipConfigV4>() as u16,
            bulk_buffer_align: BULK_BUFFER_ALIGN,
            host_cache_line: HOST_CACHE_LINE,
            host_buf_loc: host_buf_loc as u32,
            host_buf_sz: host_buf_sz as u32,
            fw_buf_loc: map.rx_offset as u32,
            fw_buf_sz: map.rx_size as u32,
            mib_loc: map.mib_offset as u32,
            mib_sz,
            mif_fh_int_n: self.irq.fh as u8,
            mif_th_int_n: th_per_q,
            scbrd_loc,
            q_num: MIF_HIP_CFG_Q_NUM as u16,
            q_len: MAX_NUM as u16,
            q_idx_sz: 1,
            q_loc,
            smapper_th_req: self.irq.smapper_req.map_or(MIF_NO_IRQ, |b| b as u8),
            smapper_fh_ind: self.irq.smapper_ind.map_or(MIF_NO_IRQ, |b| b as u8),
            smapper_mbox_scb: SMAPPER_MBOX_SCB,
            ..Default::default()
        };
        if let Some(smapper) = &self.smapper {
            let mut entries = [0u8; SMAPPER_MAX_BANKS];
            let mut pow_sz = [0u8; SMAPPER_MAX_BANKS];
            for bank in smapper.banks() {
                entries[bank.bank as usize] = bank.entries;
                pow_sz[bank.bank as usize] = bank.pow_sz;
            }
            v4.smapper_entries_banks = entries;
            v4.smapper_pow_sz = pow_sz;
        }

        let v5 = HipConfigV5 {
            magic_number: HIP4_CONFIG_MAGIC,
            hip_config_ver: 5,
            config_len: size_of::<HipConfigV5>() as u16,
            bulk_buffer_align: BULK_BUFFER_ALIGN,
            host_cache_line: HOST_CACHE_LINE,
            host_buf_loc: host_buf_loc as u32,
            host_buf_sz: host_buf_sz as u32,
            fw_buf_loc: map.rx_offset as u32,
            fw_buf_sz: map.rx_size as u32,
            mib_loc: map.mib_offset as u32,
            mib_sz,
            mif_fh_int_n: self.irq.fh as u8,
            mif_th_int_n: self.irq.th[RxSource::Ctrl.index()] as u8,
            scbrd_loc,
            q_num: MIF_HIP_CFG_Q_NUM as u16,
            q_len: MAX_NUM as u16,
            q_idx_sz: 1,
            q_loc,
            ..Default::default()
        };

        self.queues.write_config_v4(v4);
        self.queues.write_config_v5(v5);
        self.queues.write_init_record(HipInit {
            magic_number: HIP4_INIT_MAGIC,
            conf_hip4_ver: 0,
            version_a_ref: offset_of!(HipControl, config_v4) as u32,
            version_b_ref: offset_of!(HipControl, config_v5) as u32,
        });
    }
}

fn register_interrupts(
    mif: &Arc<dyn MifInterrupts>,
    slot: &Arc<OnceLock<Weak<HipInner>>>,
    with_smapper: bool,
) -> HipResult<IrqBits> {
    let mut th_bits: Vec<u32> = Vec::with_capacity(3);
    let mut fh_bits: Vec<u32> = Vec::with_capacity(2);
    let undo = |th: &[u32], fh: &[u32]| {
        th.iter().for_each(|&b| mif.unregister_tohost(b));
        fh.iter().for_each(|&b| mif.free_fromhost(b));
    };

    let mut handlers: Vec<IrqHandler> = RxSource::ALL
        .iter()
        .map(|&src| {
            let slot = slot.clone();
            Arc::new(move |_bit: u32| {
                if let Some(inner) = slot.get().and_then(Weak::upgrade) {
                    inner.top_half(src);
                }
            }) as IrqHandler
        })
        .collect();
    if with_smapper {
        let slot = slot.clone();
        handlers.push(Arc::new(move |_bit: u32| {
            if let Some(inner) = slot.get().and_then(Weak::upgrade) {
                inner.smapper_top_half();
            }
        }));
    }

    for handler in handlers {
        match mif.register_tohost(handler) {
            Ok(bit) => th_bits.push(bit),
            Err(e) => {
                undo(&th_bits, &fh_bits);
                return Err(e);
            }
        }
    }
    let fh_count = if with_smapper { 2 } else { 1 };
    for _ in 0..fh_count {
        match mif.alloc_fromhost() {
            Ok(bit) => fh_bits.push(bit),
            Err(e) => {
                undo(&th_bits, &fh_bits);
                return Err(e);
            }
        }
    }

    Ok(IrqBits {
        th: [th_bits[0], th_bits[1], th_bits[2]],
        fh: fh_bits[0],
        smapper_req: th_bits.get(3).copied(),
        smapper_ind: fh_bits.get(1).copied(),
    })
}

/// The host end of a HIP link.
pub struct Transport {
    inner: Arc<HipInner>,
}

impl Transport {
    /// Build the region, pools and records, register interrupts (masked) and
    /// start the workers. The peer can attach once this returns.
    pub(crate) fn init(
        config: HipConfig,
        mif: Arc<dyn MifInterrupts>,
        collab: Collaborators,
        smapper_hw: Option<Arc<dyn SmapperHw>>,
    ) -> HipResult<Self> {
        config.validate()?;

        let map = RegionMap::new(config.mib_size, config.tx_dat_size, config.tx_ctl_size, config.rx_size);
        if map.config_size < size_of::<HipControl>() {
            return Err(HipError::InvalidArgument(format!(
                "control block of {} bytes does not fit the {} byte config area",
                size_of::<HipControl>(),
                map.config_size
            )));
        }

        let shm = create_shared_memory(map.total_size(), config.region_name.as_deref())?;
        let region = Arc::new(MifRegion::new(shm)?);

        let mut mib_at = map.mib_offset;
        for blob in &config.mib {
            region.write_bytes(mib_at, blob)?;
            mib_at += blob.len();
        }

        let allocator = MbulkAllocator::new(region.clone());
        allocator.pool_add(
            MBULK_POOL_ID_DATA,
            map.tx_dat_offset,
            map.tx_dat_size,
            config.dat_mbulk_size,
            config.dat_guard,
        )?;
        allocator.pool_add(
            MBULK_POOL_ID_CTRL,
            map.tx_ctl_offset,
            map.tx_ctl_size,
            config.ctl_mbulk_size,
            config.ctl_guard,
        )?;

        let queues = HipQueues::new(region.clone(), QueueSide::Host)?;
        queues.reset_indices();

        let smapper = match (&config.smapper, smapper_hw) {
            (Some(cfg), Some(hw)) => Some(Smapper::new(cfg, hw)?),
            (Some(_), None) => {
                return Err(HipError::InvalidArgument("smapper configured without mapping hardware".into()))
            }
            (None, _) => None,
        };
        if let Some(mailbox) = queues.mailbox(SMAPPER_MBOX_SCB) {
            mailbox.store(0, SeqCst);
        }

        let slot: Arc<OnceLock<Weak<HipInner>>> = Arc::new(OnceLock::new());
        let irq = register_interrupts(&mif, &slot, smapper.is_some())?;

        let policy = FlowPolicy::new(Thresholds {
            med_bps: config.qos_med_bps,
            max_bps: config.qos_max_bps,
            logging_bps: config.logging_threshold_bps,
        });

        let inner = Arc::new(HipInner {
            config,
            map,
            region,
            allocator,
            queues,
            mif,
            collab,
            stats: HipStats::default(),
            policy,
            smapper,
            watchdog: Watchdog::new(),
            workers: [Worker::new("hip-rfb"), Worker::new("hip-ctrl"), Worker::new("hip-data")],
            smapper_worker: Worker::new("hip-smapper"),
            irq,
            state: Mutex::new(TransportState::Idle),
            closing: AtomicBool::new(false),
            started: AtomicBool::new(false),
            suspended: AtomicBool::new(false),
            single_irq: AtomicBool::new(false),
            pending: Default::default(),
            storm_count: Default::default(),
            intr_received: Default::default(),
            epoch: Instant::now(),
            return_backlog: Mutex::new(VecDeque::new()),
            inflight_tx: AtomicUsize::new(0),
            unidat_headroom: AtomicUsize::new(0),
            unidat_tailroom: AtomicUsize::new(0),
        });
        let _ = slot.set(Arc::downgrade(&inner));
        inner.write_config_records();

        let transport = Transport { inner };
        transport.start_threads()?;
        *transport.inner.state.lock() = TransportState::Initialised;
        info!(
            "hip: initialised, region {} bytes, to-host bits {:?}, from-host bit {}",
            transport.inner.region.size(),
            transport.inner.irq.th,
            transport.inner.irq.fh
        );
        Ok(transport)
    }

    fn start_threads(&self) -> HipResult<()> {
        let inner = &self.inner;
        for src in RxSource::ALL {
            let policy = match src {
                RxSource::Data => Policy::Budgeted {
                    budget: inner.config.data_budget,
                },
                _ => Policy::RunOnce,
            };
            let weak = Arc::downgrade(inner);
            inner.workers[src.index()].start(policy, move |policy| match weak.upgrade() {
                Some(inner) => inner.bottom_half(src, policy),
                None => DrainOutcome::Done,
            })?;
        }
        if inner.smapper.is_some() {
            let weak = Arc::downgrade(inner);
            inner.smapper_worker.start(Policy::RunOnce, move |_| match weak.upgrade() {
                Some(inner) => inner.smapper_bottom_half(),
                None => DrainOutcome::Done,
            })?;
        }
        inner.watchdog.start(Arc::downgrade(inner))?;
        Ok(())
    }

    fn transition(&self, allowed: &[TransportState], to: TransportState) -> HipResult<TransportState> {
        let mut state = self.inner.state.lock();
        if !allowed.contains(&*state) {
            return Err(HipError::State {
                from: state.name(),
                to: to.name(),
            });
        }
        let from = *state;
        *state = to;
        Ok(from)
    }

    /// Pick up what the peer wrote during its start-up and open the
    /// interrupts.
    pub fn setup(&self) -> HipResult<()> {
        let inner = &self.inner;
        {
            let mut state = inner.state.lock();
            if *state != TransportState::Initialised {
                return Err(HipError::State {
                    from: state.name(),
                    to: TransportState::Started.name(),
                });
            }

            let init = inner.queues.init_record();
            let version = init.conf_hip4_ver;
            let (headroom, tailroom) = match version {
                4 => {
                    let c = inner.queues.config_v4();
                    (c.unidat_req_headroom, c.unidat_req_tailroom)
                }
                5 => {
                    let c = inner.queues.config_v5();
                    (c.unidat_req_headroom, c.unidat_req_tailroom)
                }
                other => {
                    error!("hip: peer accepted unsupported config version {}", other);
                    return Err(HipError::Version(other));
                }
            };
            inner.unidat_headroom.store(headroom as usize, Relaxed);
            inner.unidat_tailroom.store(tailroom as usize, Relaxed);
            inner.single_irq.store(version == 5, SeqCst);
            inner.closing.store(false, SeqCst);
            inner.started.store(true, SeqCst);
            *state = TransportState::Started;
            info!(
                "hip: started with config v{}, headroom {} tailroom {}",
                version, headroom, tailroom
            );
        }

        // Handlers can run from inside unmask, so no locks held here
        for bit in inner.all_bits() {
            inner.mif.unmask(bit);
        }
        Ok(())
    }

    pub fn suspend(&self) -> HipResult<()> {
        self.transition(&[TransportState::Started], TransportState::Suspended)?;
        self.inner.suspended.store(true, SeqCst);
        debug!("hip: suspended");
        Ok(())
    }

    pub fn resume(&self) -> HipResult<()> {
        self.transition(&[TransportState::Suspended], TransportState::Started)?;
        self.inner.suspended.store(false, SeqCst);
        debug!("hip: resumed");
        // Anything queued while suspended gets a drain
        for worker in &self.inner.workers {
            worker.kick();
        }
        Ok(())
    }

    /// Stop all processing but keep the region intact for inspection.
    pub fn freeze(&self) -> HipResult<()> {
        self.transition(
            &[
                TransportState::Initialised,
                TransportState::Started,
                TransportState::Suspended,
            ],
            TransportState::Closing,
        )?;
        let inner = &self.inner;
        inner.closing.store(true, SeqCst);
        inner.started.store(false, SeqCst);
        for bit in inner.all_bits() {
            inner.mif.mask(bit);
        }
        inner.watchdog.stop();
        warn!("hip: frozen: {}", inner.dump_state());
        Ok(())
    }

    /// Mask everything, wait for in-flight work, join the workers and
    /// release the pools. Calling it again is a no-op.
    pub fn teardown(&self) -> HipResult<()> {
        let inner = &self.inner;
        {
            let mut state = inner.state.lock();
            if *state == TransportState::Closed {
                return Ok(());
            }
            *state = TransportState::Closing;
        }
        inner.closing.store(true, SeqCst);
        inner.started.store(false, SeqCst);
        for bit in inner.all_bits() {
            inner.mif.mask(bit);
        }

        while inner.inflight_tx.load(SeqCst) > 0 {
            thread::sleep(Duration::from_millis(1));
        }
        for worker in &inner.workers {
            worker.shutdown();
        }
        inner.smapper_worker.shutdown();
        inner.watchdog.stop();

        for bit in inner.all_bits() {
            inner.mif.unregister_tohost(bit);
        }
        inner.mif.free_fromhost(inner.irq.fh);
        if let Some(bit) = inner.irq.smapper_ind {
            inner.mif.free_fromhost(bit);
        }
        if let Some(smapper) = &inner.smapper {
            smapper.release(inner.smapper_mailbox());
        }

        let dropped = {
            let mut backlog = inner.return_backlog.lock();
            let n = backlog.len();
            backlog.clear();
            n
        };
        if dropped > 0 {
            warn!("hip: {} deferred returns dropped at teardown", dropped);
        }

        inner.allocator.pool_remove(MBULK_POOL_ID_DATA);
        inner.allocator.pool_remove(MBULK_POOL_ID_CTRL);
        *inner.state.lock() = TransportState::Closed;
        info!("hip: closed");
        Ok(())
    }

    pub fn state(&self) -> TransportState {
        *self.inner.state.lock()
    }

    /// Send one frame. The frame is consumed whatever the outcome; on
    /// `NoSpace` the caller decides whether to retry.
    pub fn transmit(&self, frame: Frame, is_control: bool, vif: u8, peer: u8, ac: u8) -> HipResult<()> {
        self.inner.transmit(frame, is_control, vif, peer, ac)
    }

    pub fn free_ctrl_slots(&self) -> usize {
        self.inner.free_ctrl_slots()
    }

    /// Throughput sample from the monitor.
    pub fn on_throughput(&self, tx_bps: u64, rx_bps: u64) {
        self.inner
            .policy
            .on_throughput(tx_bps, rx_bps, self.inner.collab.power.as_ref());
    }

    pub fn qos_level(&self) -> QosLevel {
        self.inner.policy.level()
    }

    pub fn verbose(&self) -> bool {
        self.inner.policy.verbose()
    }

    /// Run the data drain again, e.g. once downstream has room.
    pub fn sched_data_retrigger(&self) {
        if self.inner.closing.load(SeqCst) {
            return;
        }
        self.inner
            .collab
            .power
            .wake_hold(super::collab::WakeReason::Retrigger, self.inner.config.wake_timeout);
        self.inner.workers[RxSource::Data.index()].kick();
    }

    /// Refill SMAPPER banks now. Returns the banks handed to the peer.
    pub fn smapper_refill(&self) -> usize {
        self.inner.smapper_refill()
    }

    pub fn smapper_mailbox(&self) -> Option<u32> {
        self.inner.smapper_mailbox().map(|m| m.load(SeqCst))
    }

    pub fn smapper(&self) -> Option<&Smapper> {
        self.inner.smapper.as_ref()
    }

    /// Push deferred returns to the peer. Returns how many are still waiting.
    pub fn flush_returns(&self) -> usize {
        self.inner.flush_returns()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn history(&self) -> Vec<HistoryRecord> {
        self.inner.stats.history.lock().records()
    }

    pub fn dump_state(&self) -> String {
        self.inner.dump_state()
    }

    pub fn region(&self) -> &Arc<MifRegion> {
        &self.inner.region
    }

    pub fn region_map(&self) -> RegionMap {
        self.inner.map
    }

    pub fn allocator(&self) -> &MbulkAllocator {
        &self.inner.allocator
    }

    pub fn queues(&self) -> &HipQueues {
        &self.inner.queues
    }

    pub fn config(&self) -> &HipConfig {
        &self.inner.config
    }

    pub fn interrupts(&self) -> &Arc<dyn MifInterrupts> {
        &self.inner.mif
    }

    /// To-host interrupt bit of each [`RxSource`].
    pub fn tohost_bit(&self, src: RxSource) -> u32 {
        self.inner.irq.th[src.index()]
    }

    pub fn fromhost_bit(&self) -> u32 {
        self.inner.irq.fh
    }

    pub fn headroom(&self) -> usize {
        self.inner.unidat_headroom.load(Relaxed)
    }

    pub fn tailroom(&self) -> usize {
        self.inner.unidat_tailroom.load(Relaxed)
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            warn!("hip: teardown on drop failed: {}", e);
        }
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        crate::Debug::StructDebug::debug_transport(self, f)
    }
}
