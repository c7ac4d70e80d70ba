//! Coalesced per-table change notifications.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

/// A change-notification channel bound to one or more tables.
///
/// The channel holds at most one pending notification: if one is already
/// queued when another watched table commits, no second notification is
/// enqueued. Dropping the trigger (or calling [`Trigger::stop`]) marks it
/// stopped; the store removes it on its next alert pass.
pub struct Trigger {
    /// Receive side. One `recv` per reconciliation pass.
    pub c: mpsc::Receiver<()>,
    stopped: Arc<AtomicBool>,
}

impl Trigger {
    pub(crate) fn new(c: mpsc::Receiver<()>, stopped: Arc<AtomicBool>) -> Self {
        Trigger { c, stopped }
    }

    /// Stop the trigger. Idempotent.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }
}

impl Drop for Trigger {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The store's handle on one registered trigger.
pub(crate) struct TriggerEntry {
    pub(crate) tx: mpsc::Sender<()>,
    pub(crate) stopped: Arc<AtomicBool>,
}

impl TriggerEntry {
    /// Deliver a coalesced notification. Returns false once the receiver is
    /// gone or stopped, at which point the entry should be dropped.
    pub(crate) fn fire(&self) -> bool {
        if self.stopped.load(Ordering::Relaxed) {
            return false;
        }
        match self.tx.try_send(()) {
            Ok(()) => true,
            // A notification is already pending; coalesce.
            Err(mpsc::error::TrySendError::Full(())) => true,
            Err(mpsc::error::TrySendError::Closed(())) => false,
        }
    }
}
