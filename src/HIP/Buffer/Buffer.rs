// The six HIP queues, viewed from one side of the link.

use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::layout::{HipControl, MIF_HIP_CFG_Q_NUM};
use crate::Core::region::MifRegion;

#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueueId {
    FhCtrl = 0,
    FhDat = 1,
    FhRfb = 2,
    ThCtrl = 3,
    ThDat = 4,
    ThRfb = 5,
}

impl QueueId {
    pub const ALL: [QueueId; MIF_HIP_CFG_Q_NUM] = [
        QueueId::FhCtrl,
        QueueId::FhDat,
        QueueId::FhRfb,
        QueueId::ThCtrl,
        QueueId::ThDat,
        QueueId::ThRfb,
    ];

    /// Queues the peer signals the host about.
    pub const TO_HOST: [QueueId; 3] = [QueueId::FhRfb, QueueId::ThCtrl, QueueId::ThDat];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            QueueId::FhCtrl => "FH_CTRL",
            QueueId::FhDat => "FH_DAT",
            QueueId::FhRfb => "FH_RFB",
            QueueId::ThCtrl => "TH_CTRL",
            QueueId::ThDat => "TH_DAT",
            QueueId::ThRfb => "TH_RFB",
        }
    }

    /// Whether the host writes this queue's write index.
    pub fn host_produces(self) -> bool {
        matches!(self, QueueId::FhCtrl | QueueId::FhDat | QueueId::ThRfb)
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which end of the link a [`HipQueues`] view belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueSide {
    Host,
    Peer,
}

impl QueueSide {
    /// Whether this side produces into `q`.
    pub fn produces(self, q: QueueId) -> bool {
        match self {
            QueueSide::Host => q.host_produces(),
            QueueSide::Peer => !q.host_produces(),
        }
    }
}

/// Scoreboard index selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Index {
    Write = 0,
    Read = 1,
}

/// View over the queue arrays and scoreboard in the control block.
///
/// Not stored in shared memory. Both locks only serialize callers on this
/// side of the link; ordering against the other side comes from fences.
pub struct HipQueues {
    pub(crate) region: Arc<MifRegion>,
    pub(crate) control: *const HipControl,
    pub(crate) side: QueueSide,
    /// Serializes the local view of scoreboard reads and writes
    pub(crate) rw_scoreboard: RwLock<()>,
    /// One producer lock per queue so local enqueuers do not race on the
    /// read-modify-write of the write index
    pub(crate) producer: [Mutex<()>; MIF_HIP_CFG_Q_NUM],
}

unsafe impl Send for HipQueues {}
unsafe impl Sync for HipQueues {}

impl fmt::Debug for HipQueues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        crate::Debug::StructDebug::debug_hip_queues(self, f)
    }
}
