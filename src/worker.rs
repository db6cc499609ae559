//! Cooperative worker handles.
//!
//! Every long-lived loop in the agent is one tokio task paired with a
//! [`CancellationToken`]; stopping means cancel, then join. Components keep
//! their current worker in a `Mutex<Option<Worker>>` slot so there is at
//! most one live worker per component at any time.

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct Worker {
    pub cancel: CancellationToken,
    pub handle: JoinHandle<()>,
}

impl Worker {
    /// Cancel the task and wait for it to finish.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

/// Take the worker out of `slot` (if any), cancel it and join it.
pub async fn stop_slot(slot: &Mutex<Option<Worker>>) {
    let worker = slot.lock().take();
    if let Some(worker) = worker {
        worker.stop().await;
    }
}

/// Whether the slot currently holds a live (not yet finished) worker.
pub fn slot_alive(slot: &Mutex<Option<Worker>>) -> bool {
    slot.lock().as_ref().map(|w| !w.handle.is_finished()).unwrap_or(false)
}
