// Interrupt bits between host and peer.
//
// `MifInterrupts` is what the transport needs from an interrupt controller.
// `SoftMif` implements it in-process: to-host bits latch while masked and are
// delivered on unmask, from-host bits are counted and forwarded on a channel
// the peer can wait on.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{trace, warn};
use parking_lot::Mutex;

use crate::error::{HipError, HipResult};

/// Bits available in each direction.
pub const MIF_INTR_BITS: u32 = 16;

pub type IrqHandler = Arc<dyn Fn(u32) + Send + Sync>;

pub trait MifInterrupts: Send + Sync {
    /// Reserve a to-host bit, attach `handler`, leave it masked.
    fn register_tohost(&self, handler: IrqHandler) -> HipResult<u32>;
    fn unregister_tohost(&self, bit: u32);
    /// Reserve a from-host bit.
    fn alloc_fromhost(&self) -> HipResult<u32>;
    fn free_fromhost(&self, bit: u32);
    fn mask(&self, bit: u32);
    fn unmask(&self, bit: u32);
    fn is_masked(&self, bit: u32) -> bool;
    /// Acknowledge a to-host bit.
    fn clear(&self, bit: u32);
    /// Interrupt the peer.
    fn raise_fromhost(&self, bit: u32);
}

#[derive(Default)]
struct SoftState {
    tohost: Vec<Option<IrqHandler>>,
    masked: u32,
    latched: u32,
    drop_unmask: u32,
    fromhost_used: u32,
}

pub struct SoftMif {
    state: Mutex<SoftState>,
    fromhost_tx: Sender<u32>,
    fromhost_rx: Receiver<u32>,
    fromhost_count: [AtomicU64; MIF_INTR_BITS as usize],
}

impl SoftMif {
    pub fn new() -> Arc<Self> {
        let (fromhost_tx, fromhost_rx) = unbounded();
        Arc::new(Self {
            state: Mutex::new(SoftState {
                tohost: vec![None; MIF_INTR_BITS as usize],
                masked: u32::MAX,
                ..Default::default()
            }),
            fromhost_tx,
            fromhost_rx,
            fromhost_count: Default::default(),
        })
    }

    /// Peer side: raise a to-host bit. Delivered now if unmasked, otherwise
    /// latched until the bit is unmasked.
    pub fn raise_tohost(&self, bit: u32) {
        if bit >= MIF_INTR_BITS {
            return;
        }
        let handler = {
            let mut st = self.state.lock();
            st.latched |= 1 << bit;
            if st.masked & (1 << bit) != 0 {
                trace!("mif: to-host bit {} latched while masked", bit);
                return;
            }
            st.tohost[bit as usize].clone()
        };
        if let Some(handler) = handler {
            handler(bit);
        }
    }

    /// Peer side: from-host interrupts in the order they were raised.
    pub fn fromhost_events(&self) -> Receiver<u32> {
        self.fromhost_rx.clone()
    }

    pub fn fromhost_count(&self, bit: u32) -> u64 {
        self.fromhost_count
            .get(bit as usize)
            .map(|c| c.load(Relaxed))
            .unwrap_or(0)
    }

    pub fn mask_status(&self) -> u32 {
        self.state.lock().masked
    }

    pub fn is_latched(&self, bit: u32) -> bool {
        bit < MIF_INTR_BITS && self.state.lock().latched & (1 << bit) != 0
    }

    /// Fault injection: the next unmask of `bit` is silently lost.
    pub fn drop_next_unmask(&self, bit: u32) {
        if bit < MIF_INTR_BITS {
            self.state.lock().drop_unmask |= 1 << bit;
        }
    }
}

impl MifInterrupts for SoftMif {
    fn register_tohost(&self, handler: IrqHandler) -> HipResult<u32> {
        let mut st = self.state.lock();
        let bit = st
            .tohost
            .iter()
            .position(Option::is_none)
            .ok_or(HipError::NoSpace("no free to-host interrupt bit"))? as u32;
        st.tohost[bit as usize] = Some(handler);
        st.masked |= 1 << bit;
        st.latched &= !(1 << bit);
        Ok(bit)
    }

    fn unregister_tohost(&self, bit: u32) {
        if bit >= MIF_INTR_BITS {
            return;
        }
        let mut st = self.state.lock();
        st.tohost[bit as usize] = None;
        st.masked |= 1 << bit;
    }

    fn alloc_fromhost(&self) -> HipResult<u32> {
        let mut st = self.state.lock();
        let bit = (0..MIF_INTR_BITS)
            .find(|b| st.fromhost_used & (1 << b) == 0)
            .ok_or(HipError::NoSpace("no free from-host interrupt bit"))?;
        st.fromhost_used |= 1 << bit;
        Ok(bit)
    }

    fn free_fromhost(&self, bit: u32) {
        if bit < MIF_INTR_BITS {
            self.state.lock().fromhost_used &= !(1 << bit);
        }
    }

    fn mask(&self, bit: u32) {
        if bit < MIF_INTR_BITS {
            self.state.lock().masked |= 1 << bit;
        }
    }

    fn unmask(&self, bit: u32) {
        if bit >= MIF_INTR_BITS {
            return;
        }
        let handler = {
            let mut st = self.state.lock();
            if st.drop_unmask & (1 << bit) != 0 {
                st.drop_unmask &= !(1 << bit);
                warn!("mif: unmask of to-host bit {} dropped", bit);
                return;
            }
            st.masked &= !(1 << bit);
            if st.latched & (1 << bit) == 0 {
                return;
            }
            st.tohost[bit as usize].clone()
        };
        if let Some(handler) = handler {
            handler(bit);
        }
    }

    fn is_masked(&self, bit: u32) -> bool {
        bit >= MIF_INTR_BITS || self.state.lock().masked & (1 << bit) != 0
    }

    fn clear(&self, bit: u32) {
        if bit < MIF_INTR_BITS {
            self.state.lock().latched &= !(1 << bit);
        }
    }

    fn raise_fromhost(&self, bit: u32) {
        if let Some(c) = self.fromhost_count.get(bit as usize) {
            c.fetch_add(1, Relaxed);
            // The receiver lives as long as self, so this cannot fail
            let _ = self.fromhost_tx.send(bit);
        }
    }
}

impl fmt::Debug for SoftMif {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state.lock();
        f.debug_struct("SoftMif")
            .field("masked", &format_args!("{:#06x}", st.masked & 0xffff))
            .field("latched", &format_args!("{:#06x}", st.latched))
            .finish_non_exhaustive()
    }
}
