use std::fmt;

use crate::Core::mbulk::{MbulkAllocator, Segment};
use crate::Core::region::MifRegion;
use crate::HIP::transport::Transport;
use crate::HIP::Buffer::{HipQueues, QueueId};

/// Debug function for MifRegion
///
/// Shows the mapping without dumping its contents:
/// - Base address and size
/// - Backend handle
pub fn debug_mif_region(region: &MifRegion, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MifRegion")
        .field("base", &format_args!("{:p}", region.base()))
        .field("size", &format_args!("{:#x}", region.size()))
        .field("handle", &region.backend().raw_handle())
        .finish()
}

/// Debug function for Segment
///
/// Reads the header once; the peer may be changing it underneath.
pub fn debug_segment(seg: &Segment, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let h = seg.header();
    let (flag, pid, refcnt, len, head, next) = (h.flag, h.pid, h.refcnt, h.len, h.head, h.chain_next);
    f.debug_struct("Segment")
        .field("ref", &seg.mif_ref())
        .field("flag", &format_args!("{:#04x}", flag))
        .field("pid", &pid)
        .field("refcnt", &refcnt)
        .field("head", &head)
        .field("len", &len)
        .field("chain_next", &format_args!("{:#x}", next))
        .finish()
}

/// Debug function for MbulkAllocator
///
/// One entry per live pool: `(id, free, in use)`.
pub fn debug_mbulk_allocator(allocator: &MbulkAllocator, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let pools: Vec<(u8, usize, usize)> = allocator
        .pool_ids()
        .into_iter()
        .map(|id| {
            (
                id,
                allocator.free_count(id).unwrap_or(0),
                allocator.in_use(id).unwrap_or(0),
            )
        })
        .collect();
    f.debug_struct("MbulkAllocator")
        .field("region", &format_args!("{:p}", allocator.region().base()))
        .field("pools", &pools)
        .finish()
}

pub fn debug_hip_queues(queues: &HipQueues, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let snap = queues.snapshot();
    let mut d = f.debug_struct("HipQueues");
    d.field("side", &queues.side());
    for q in QueueId::ALL {
        d.field(q.name(), &format_args!("w {} r {}", snap[q.index()].0, snap[q.index()].1));
    }
    d.finish()
}

pub fn debug_transport(transport: &Transport, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Transport")
        .field("state", &transport.state())
        .field("qos", &transport.qos_level())
        .field("region", transport.region())
        .field("queues", transport.queues())
        .field("allocator", transport.allocator())
        .finish_non_exhaustive()
}
