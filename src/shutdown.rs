//! Cooperative cancellation shared by every pipeline thread.
//!
//! A [`ShutdownTrigger`] owns the only sender of a zero-capacity channel. Firing
//! (or dropping) it disconnects the channel, which wakes every blocked
//! `recv`/`select!` on the matching [`ShutdownSignal`] at once.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub struct ShutdownTrigger {
    _tx: Sender<()>,
    flag: Arc<AtomicBool>,
}

#[derive(Clone)]
pub struct ShutdownSignal {
    rx: Receiver<()>,
    flag: Arc<AtomicBool>,
}

/// Create a connected trigger/signal pair.
pub fn channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = crossbeam_channel::bounded(0);
    let flag = Arc::new(AtomicBool::new(false));
    (
        ShutdownTrigger {
            _tx: tx,
            flag: flag.clone(),
        },
        ShutdownSignal { rx, flag },
    )
}

impl ShutdownTrigger {
    /// Fire the signal. Consumes the trigger; dropping it has the same effect.
    pub fn trigger(self) {}
}

impl Drop for ShutdownTrigger {
    fn drop(&mut self) {
        self.flag.store(true, Ordering::SeqCst);
    }
}

impl ShutdownSignal {
    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Sleep for `duration` unless shutdown fires first.
    ///
    /// Returns `true` when the full duration elapsed, `false` when cancelled.
    pub fn sleep(&self, duration: Duration) -> bool {
        match self.rx.recv_timeout(duration) {
            Err(RecvTimeoutError::Timeout) => !self.is_triggered(),
            _ => false,
        }
    }

    /// Receiver that becomes disconnected on shutdown, for use in `select!`.
    pub fn receiver(&self) -> &Receiver<()> {
        &self.rx
    }
}
