//! The far end of the link, driven in-process.
//!
//! `PeerEndpoint` plays the firmware's part of the protocol against a live
//! [`Transport`]: it answers the config handshake, consumes FH_CTRL/FH_DAT,
//! returns host buffers on FH_RFB, produces into TH_CTRL/TH_DAT from its own
//! pool in the RX area and reclaims what the host hands back on TH_RFB.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::{debug, warn};

use super::irq::RxSource;
use super::mif::SoftMif;
use super::rx::frame_from_ref;
use super::smapper::{owner_bit, SmapperDescriptor, SoftSmapper};
use super::transport::Transport;
use super::tx::write_frame;
use crate::error::{HipError, HipResult};
use crate::Core::mbulk::{
    round_up, Buffer, Colour, MbulkAllocator, MbulkClass, MBULK_F_WAKEUP, MBULK_POOL_ID_PEER,
    MBULK_SIG_ALIGN,
};
use crate::Core::region::{MifRef, MifRegion};
use crate::HIP::Buffer::layout::{HIP4_CONFIG_MAGIC, HIP4_DAT_MBULK_SIZE, HIP4_INIT_MAGIC, MIF_NO_IRQ};
use crate::HIP::Buffer::{HipQueues, QueueId, QueueSide};
use crate::HIP::Structs::{Frame, SignalHeader, FW_HEADER_OFFSET, MA_UNITDATA_IND};

pub struct PeerEndpoint {
    region: Arc<MifRegion>,
    queues: HipQueues,
    allocator: MbulkAllocator,
    mif: Arc<SoftMif>,
    version: u32,
    /// To-host bit per [`RxSource`]
    th: [u32; 3],
    fh: u32,
    smapper_req: Option<u32>,
    smapper_pow_sz: [u8; 16],
    mbox_scb: u8,
}

fn irq_bit(raw: u8) -> Option<u32> {
    (raw != MIF_NO_IRQ).then_some(raw as u32)
}

impl PeerEndpoint {
    /// Answer the handshake with config `version` and the unitdata
    /// headroom/tailroom the host must leave. Any version is written back
    /// as given, so a host can be shown one it does not support.
    pub fn attach(transport: &Transport, mif: Arc<SoftMif>, version: u32, headroom: u8, tailroom: u8) -> HipResult<Self> {
        let region = transport.region().clone();
        let queues = HipQueues::new(region.clone(), QueueSide::Peer)?;

        let mut init = queues.init_record();
        let magic = init.magic_number;
        if magic != HIP4_INIT_MAGIC {
            return Err(HipError::Malformed(format!("init magic {:#x}", magic)));
        }

        let mut v4 = queues.config_v4();
        let v4_magic = v4.magic_number;
        if v4_magic != HIP4_CONFIG_MAGIC {
            return Err(HipError::Malformed(format!("config magic {:#x}", v4_magic)));
        }
        let (fw_buf_loc, fw_buf_sz) = (v4.fw_buf_loc as usize, v4.fw_buf_sz as usize);
        let fh = v4.mif_fh_int_n as u32;
        let th_q = v4.mif_th_int_n;
        let smapper_req = irq_bit(v4.smapper_th_req);
        let smapper_pow_sz = v4.smapper_pow_sz;
        let mbox_scb = v4.smapper_mbox_scb;

        let th = match version {
            5 => {
                let mut v5 = queues.config_v5();
                v5.unidat_req_headroom = headroom;
                v5.unidat_req_tailroom = tailroom;
                let bit = v5.mif_th_int_n as u32;
                queues.write_config_v5(v5);
                [bit; 3]
            }
            _ => {
                if version == 4 {
                    v4.unidat_req_headroom = headroom;
                    v4.unidat_req_tailroom = tailroom;
                    queues.write_config_v4(v4);
                }
                RxSource::ALL.map(|src| th_q[src.queue().index()] as u32)
            }
        };

        init.conf_hip4_ver = version;
        queues.write_init_record(init);

        let allocator = MbulkAllocator::new(region.clone());
        allocator.pool_add(MBULK_POOL_ID_PEER, fw_buf_loc, fw_buf_sz, HIP4_DAT_MBULK_SIZE, 0)?;
        debug!("peer: attached with config v{}, to-host bits {:?}", version, th);

        Ok(Self {
            region,
            queues,
            allocator,
            mif,
            version,
            th,
            fh,
            smapper_req,
            smapper_pow_sz,
            mbox_scb,
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn tohost_bit(&self, src: RxSource) -> u32 {
        self.th[src.index()]
    }

    pub fn fromhost_bit(&self) -> u32 {
        self.fh
    }

    pub fn queues(&self) -> &HipQueues {
        &self.queues
    }

    /// Peer buffers not yet returned by the host.
    pub fn in_use(&self) -> usize {
        self.allocator.in_use(MBULK_POOL_ID_PEER).unwrap_or(0)
    }

    pub fn recv_from_host(&self, q: QueueId) -> HipResult<Option<MifRef>> {
        self.queues.dequeue(q)
    }

    pub fn read_frame(&self, r: MifRef) -> (HipResult<Frame>, Vec<MifRef>) {
        frame_from_ref(&self.region, r)
    }

    /// Next frame on FH_CTRL or FH_DAT plus the references it occupied. The
    /// references are returned to the host straight away if the frame is
    /// unreadable.
    pub fn recv_frame(&self, q: QueueId) -> HipResult<Option<(Frame, Vec<MifRef>)>> {
        let Some(r) = self.recv_from_host(q)? else {
            return Ok(None);
        };
        let (frame, refs) = self.read_frame(r);
        match frame {
            Ok(frame) => Ok(Some((frame, refs))),
            Err(e) => {
                warn!("peer: unreadable frame at {:?}: {}", r, e);
                self.return_to_host(&refs)?;
                Err(e)
            }
        }
    }

    /// Give host buffers back on FH_RFB and interrupt the host.
    pub fn return_to_host(&self, refs: &[MifRef]) -> HipResult<()> {
        for &r in refs {
            self.queues.enqueue(QueueId::FhRfb, r)?;
        }
        if !refs.is_empty() {
            self.mif.raise_tohost(self.tohost_bit(RxSource::Rfb));
        }
        Ok(())
    }

    fn alloc(&self, clas: MbulkClass, sig_len: usize, dat_len: usize) -> Option<Buffer> {
        let seg_size = self.allocator.seg_size(MBULK_POOL_ID_PEER)?;
        if round_up(sig_len, MBULK_SIG_ALIGN) + dat_len <= seg_size {
            return self
                .allocator
                .alloc(MBULK_POOL_ID_PEER, clas, Colour::default(), sig_len, dat_len)
                .map(Buffer::Single);
        }
        self.allocator
            .alloc_chain(MBULK_POOL_ID_PEER, clas, Colour::default(), sig_len, dat_len)
    }

    /// Put `frame` on TH_CTRL or TH_DAT and interrupt the host.
    pub fn send_to_host(&self, frame: &Frame, is_control: bool) -> HipResult<MifRef> {
        let (clas, q, src) = if is_control {
            (MbulkClass::Control, QueueId::ThCtrl, RxSource::Ctrl)
        } else {
            (MbulkClass::FromRadio, QueueId::ThDat, RxSource::Data)
        };
        let buf = self
            .alloc(clas, FW_HEADER_OFFSET + frame.signal.len(), frame.payload_len())
            .ok_or(HipError::NoSpace("peer pool exhausted"))?;
        if let Err(e) = write_frame(&buf, frame, 0) {
            self.allocator.free_buffer(buf);
            return Err(e);
        }
        let head = buf.head();
        if frame.wakeup {
            head.set_flags(MBULK_F_WAKEUP);
        }
        let r = head.mif_ref();
        if let Err(e) = self.queues.enqueue(q, r) {
            self.allocator.free_buffer(buf);
            return Err(e);
        }
        self.mif.raise_tohost(self.tohost_bit(src));
        Ok(r)
    }

    /// Free whatever the host handed back on TH_RFB.
    pub fn reclaim(&self) -> HipResult<usize> {
        let mut n = 0;
        while let Some(r) = self.queues.dequeue(QueueId::ThRfb)? {
            if !self.allocator.free_ref(r)? {
                warn!("peer: host returned {:?} twice", r);
            }
            n += 1;
        }
        Ok(n)
    }

    /// Echo one frame from `q` back to the host on the matching to-host
    /// queue, returning the host's buffers first.
    pub fn mirror_one(&self, q: QueueId) -> HipResult<bool> {
        let Some((frame, refs)) = self.recv_frame(q)? else {
            return Ok(false);
        };
        self.return_to_host(&refs)?;
        self.send_to_host(&frame, q == QueueId::FhCtrl)?;
        Ok(true)
    }

    /// Echo everything waiting on FH_CTRL then FH_DAT.
    pub fn mirror_all(&self) -> HipResult<usize> {
        let mut n = 0;
        for q in [QueueId::FhCtrl, QueueId::FhDat] {
            while self.mirror_one(q)? {
                n += 1;
            }
        }
        Ok(n)
    }

    pub fn mailbox(&self) -> u32 {
        self.queues
            .mailbox(self.mbox_scb)
            .map(|m| m.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Hand a used-up bank back to the host.
    pub fn return_bank(&self, bank: u8) {
        if let Some(m) = self.queues.mailbox(self.mbox_scb) {
            m.fetch_and(!owner_bit(bank), Ordering::AcqRel);
        }
    }

    /// Ask the host for a SMAPPER refill.
    pub fn raise_smapper_refill(&self) -> bool {
        match self.smapper_req {
            Some(bit) => {
                self.mif.raise_tohost(bit);
                true
            }
            None => false,
        }
    }

    /// Write `data` into bank entries starting at `entry` (after `headroom`
    /// bytes) and tell the host with a descriptor on TH_DAT.
    pub fn send_smapper_frame(
        &self,
        hw: &SoftSmapper,
        bank: u8,
        entry: u8,
        headroom: u16,
        data: &[u8],
    ) -> HipResult<MifRef> {
        if self.mailbox() & owner_bit(bank) == 0 {
            return Err(HipError::Smapper(format!("bank {} is not owned by the peer", bank)));
        }
        let pow_sz = *self
            .smapper_pow_sz
            .get(bank as usize)
            .ok_or_else(|| HipError::Smapper(format!("bank {} out of range", bank)))?;
        let entry_size = 1usize << pow_sz;
        let len = u16::try_from(data.len())
            .map_err(|_| HipError::InvalidArgument(format!("{} bytes too long for a descriptor", data.len())))?;

        let mut rest = data;
        let mut index = entry;
        let mut offset = headroom as usize;
        while !rest.is_empty() {
            let n = rest.len().min(entry_size.saturating_sub(offset));
            hw.write_entry(bank, index, offset, &rest[..n])?;
            rest = &rest[n..];
            index = index.wrapping_add(1);
            offset = 0;
        }

        let desc = SmapperDescriptor {
            bank,
            entry,
            len,
            headroom,
        };
        let mut signal = SignalHeader {
            id: MA_UNITDATA_IND,
            ..Default::default()
        }
        .to_bytes()
        .to_vec();
        signal.extend_from_slice(&desc.to_bytes());
        self.send_to_host(&Frame::signal_only(signal), false)
    }
}
