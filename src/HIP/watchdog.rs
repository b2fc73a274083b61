// Liveness net for interrupts that stay masked after their drain finished,
// and for returns parked while TH_RFB was full.
//
// The timer is a thread waiting on a command channel with a deadline. What to
// do on expiry lives on the transport (`HipInner::watchdog_expired`).

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Weak;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, warn};
use parking_lot::Mutex;

use super::irq::RxSource;
use super::transport::HipInner;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogMsg {
    /// Fire once after the delay.
    Arm(Duration),
    Stop,
}

pub struct Watchdog {
    active: AtomicBool,
    tx: Sender<WatchdogMsg>,
    rx: Mutex<Option<Receiver<WatchdogMsg>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Watchdog {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            active: AtomicBool::new(false),
            tx,
            rx: Mutex::new(Some(rx)),
            handle: Mutex::new(None),
        }
    }

    pub(crate) fn start(&self, inner: Weak<HipInner>) -> io::Result<()> {
        let rx = self.rx.lock().take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::AlreadyExists, "watchdog already started")
        })?;
        let handle = thread::Builder::new().name("hip-watchdog".into()).spawn(move || {
            let mut deadline: Option<Instant> = None;
            loop {
                let msg = match deadline {
                    Some(at) => rx.recv_deadline(at),
                    None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
                };
                match msg {
                    Ok(WatchdogMsg::Arm(after)) => {
                        // An armed timer is not pushed out by a second arm
                        if deadline.is_none() {
                            deadline = Some(Instant::now() + after);
                        }
                    }
                    Ok(WatchdogMsg::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {
                        deadline = None;
                        let Some(inner) = inner.upgrade() else {
                            break;
                        };
                        if let Some(after) = inner.watchdog_expired() {
                            deadline = Some(Instant::now() + after);
                        }
                    }
                }
            }
            debug!("watchdog exiting");
        })?;
        *self.handle.lock() = Some(handle);
        Ok(())
    }

    /// Arm the timer unless it already is. Returns whether this call armed it.
    pub fn arm(&self, after: Duration) -> bool {
        if self.active.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self.tx.send(WatchdogMsg::Arm(after));
        true
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
        let Some(handle) = self.handle.lock().take() else {
            return;
        };
        let _ = self.tx.send(WatchdogMsg::Stop);
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            warn!("watchdog thread panicked");
        }
    }
}

impl Default for Watchdog {
    fn default() -> Self {
        Self::new()
    }
}

impl HipInner {
    /// Timer expiry. Returns the delay before the next check, or `None` to
    /// leave the watchdog disarmed.
    pub(crate) fn watchdog_expired(&self) -> Option<Duration> {
        if !self.watchdog.is_active() {
            return None;
        }
        if self.closing.load(Ordering::SeqCst) {
            self.watchdog.set_active(false);
            return None;
        }

        let tick = self.config.watchdog_tick;
        let mut rearm = false;
        for src in RxSource::ALL {
            let pending = &self.pending[src.index()];
            if !pending.swap(false, Ordering::SeqCst) {
                continue;
            }
            let bit = self.line_bit(src);
            let age = self.interrupt_age(src).unwrap_or(tick);
            if age < tick || !self.mif.is_masked(bit) {
                // Recent, or the line is live and a drain is on its way
                pending.store(true, Ordering::SeqCst);
                rearm = true;
                continue;
            }

            warn!(
                "hip: watchdog recovering {} interrupt, masked for {:?} with work pending",
                src.name(),
                age
            );
            self.dump("watchdog");
            self.stats.watchdog_recoveries.fetch_add(1, Ordering::Relaxed);
            // Delivers anything latched while masked, which marks the
            // source pending again
            self.mif.unmask(bit);
            rearm = true;
        }

        if self.flush_returns() > 0 {
            rearm = true;
        }

        if rearm {
            return Some(tick / 2);
        }
        self.watchdog.set_active(false);
        // A return deferred after the flush above found the timer still active
        // and did not arm it
        if !self.return_backlog.lock().is_empty() {
            self.watchdog.set_active(true);
            return Some(tick / 2);
        }
        None
    }
}
