//! Deferred work: one thread per queue, woken through a channel.
//!
//! Kicks go through a `bounded(1)` channel with `try_send`, so any number of
//! interrupts arriving while a drain is queued collapse into one run.

use std::io;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use log::{debug, warn};
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerMsg {
    Kick,
    Shutdown,
}

/// How a worker runs its drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Drain until empty in one go.
    RunOnce,
    /// Handle at most `budget` entries per run, then go round again.
    Budgeted { budget: usize },
}

impl Policy {
    pub fn budget(self) -> usize {
        match self {
            Policy::RunOnce => usize::MAX,
            Policy::Budgeted { budget } => budget,
        }
    }
}

/// What a drain wants to happen next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Caught up; sleep until kicked.
    Done,
    /// Budget exhausted with work left; run again straight away.
    MoreWork,
    /// Run again after the delay unless kicked sooner.
    Retrigger(Duration),
}

pub struct Worker {
    name: String,
    tx: Sender<WorkerMsg>,
    rx: Mutex<Option<Receiver<WorkerMsg>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    pub fn new(name: impl Into<String>) -> Self {
        let (tx, rx) = bounded(1);
        Self {
            name: name.into(),
            tx,
            rx: Mutex::new(Some(rx)),
            handle: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawn the thread. `drain` is called once per wake-up.
    pub fn start<F>(&self, policy: Policy, mut drain: F) -> io::Result<()>
    where
        F: FnMut(Policy) -> DrainOutcome + Send + 'static,
    {
        let rx = self.rx.lock().take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::AlreadyExists, format!("worker {} already started", self.name))
        })?;
        let name = self.name.clone();
        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            let mut deadline: Option<Instant> = None;
            'run: loop {
                let msg = match deadline {
                    Some(at) => match rx.recv_deadline(at) {
                        Ok(msg) => msg,
                        Err(RecvTimeoutError::Timeout) => WorkerMsg::Kick,
                        Err(RecvTimeoutError::Disconnected) => break,
                    },
                    None => match rx.recv() {
                        Ok(msg) => msg,
                        Err(_) => break,
                    },
                };
                if msg == WorkerMsg::Shutdown {
                    break;
                }
                deadline = None;

                loop {
                    match drain(policy) {
                        DrainOutcome::Done => break,
                        DrainOutcome::Retrigger(after) => {
                            deadline = Some(Instant::now() + after);
                            break;
                        }
                        DrainOutcome::MoreWork => match rx.try_recv() {
                            Ok(WorkerMsg::Shutdown) | Err(TryRecvError::Disconnected) => break 'run,
                            // a kick is already covered by going round again
                            Ok(WorkerMsg::Kick) | Err(TryRecvError::Empty) => thread::yield_now(),
                        },
                    }
                }
            }
            debug!("worker {} exiting", name);
        })?;
        *self.handle.lock() = Some(handle);
        Ok(())
    }

    /// Schedule a run. Returns false only once the worker is gone.
    pub fn kick(&self) -> bool {
        match self.tx.try_send(WorkerMsg::Kick) {
            Ok(()) | Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Stop the thread after its current run and wait for it.
    pub fn shutdown(&self) {
        let Some(handle) = self.handle.lock().take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            // Nobody else reads the channel, so do not block on it
            let _ = self.tx.try_send(WorkerMsg::Shutdown);
            warn!("worker {} asked to join itself, detaching", self.name);
            return;
        }
        let _ = self.tx.send(WorkerMsg::Shutdown);
        if handle.join().is_err() {
            warn!("worker {} panicked", self.name);
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.lock().is_some()
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}
