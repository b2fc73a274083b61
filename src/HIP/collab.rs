//! Interfaces to the layers around the transport.
//!
//! The transport only ever calls out through these traits; none of them is
//! required for correctness and every one has a no-op default.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::HipResult;
use crate::HIP::Structs::Frame;

/// Receives reassembled inbound frames. An error drops the frame.
pub trait FrameDispatch: Send + Sync {
    fn dispatch(&self, frame: Frame, is_control: bool) -> HipResult<()>;
}

/// Told once per outbound data buffer the peer has finished with.
pub trait TxCompletion: Send + Sync {
    fn tx_done(&self, vif: u8, peer: u8, ac: u8);
}

/// Approximate number of inbound frames still queued above the transport.
pub trait DownstreamDepth: Send + Sync {
    fn pending_frames(&self) -> usize;
}

/// Coarse latency/power request derived from throughput.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum QosLevel {
    #[default]
    Disabled,
    Medium,
    Max,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WakeReason {
    Tx,
    Ctrl,
    Data,
    Retrigger,
}

pub trait PowerPolicy: Send + Sync {
    fn request_level(&self, level: QosLevel);
    fn wake_hold(&self, reason: WakeReason, timeout: Duration);
    fn wake_release(&self, reason: WakeReason);
}

#[derive(Debug, Default)]
pub struct NoDispatch;

impl FrameDispatch for NoDispatch {
    fn dispatch(&self, _frame: Frame, _is_control: bool) -> HipResult<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct NoCompletion;

impl TxCompletion for NoCompletion {
    fn tx_done(&self, _vif: u8, _peer: u8, _ac: u8) {}
}

#[derive(Debug, Default)]
pub struct NoBacklog;

impl DownstreamDepth for NoBacklog {
    fn pending_frames(&self) -> usize {
        0
    }
}

#[derive(Debug, Default)]
pub struct NoPowerPolicy;

impl PowerPolicy for NoPowerPolicy {
    fn request_level(&self, _level: QosLevel) {}
    fn wake_hold(&self, _reason: WakeReason, _timeout: Duration) {}
    fn wake_release(&self, _reason: WakeReason) {}
}

/// The full set of collaborators a transport talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub dispatch: Arc<dyn FrameDispatch>,
    pub tx_completion: Arc<dyn TxCompletion>,
    pub downstream: Arc<dyn DownstreamDepth>,
    pub power: Arc<dyn PowerPolicy>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            dispatch: Arc::new(NoDispatch),
            tx_completion: Arc::new(NoCompletion),
            downstream: Arc::new(NoBacklog),
            power: Arc::new(NoPowerPolicy),
        }
    }
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
