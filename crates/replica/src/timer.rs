//! Cancellable one-shot timers that post back into a replica's message queue.

use std::time::Duration;

use tokio::sync::mpsc::WeakUnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Token identifying one arming of a [`TimerSlot`].
pub(crate) type TimerToken = u64;

/// A slot holding at most one pending timer.
///
/// Arming always cancels the previous timer first. Messages from a canceled
/// timer that were already queued are recognized by their stale token.
#[derive(Debug, Default)]
pub(crate) struct TimerSlot {
    handle: Option<JoinHandle<()>>,
    token: TimerToken,
}

impl TimerSlot {
    pub(crate) fn arm<M: Send + 'static>(
        &mut self,
        delay: Duration,
        tx: WeakUnboundedSender<M>,
        message: impl FnOnce(TimerToken) -> M + Send + 'static,
    ) {
        self.cancel();
        let token = self.token;
        self.handle = Some(tokio::spawn(async move {
            sleep(delay).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(message(token));
            }
        }));
    }

    pub(crate) fn cancel(&mut self) {
        self.token = self.token.wrapping_add(1);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.handle.is_some()
    }

    /// Consume a fired token. Returns true if it belongs to the current arming.
    pub(crate) fn fire(&mut self, token: TimerToken) -> bool {
        if self.handle.is_some() && token == self.token {
            self.handle = None;
            true
        } else {
            false
        }
    }
}

impl Drop for TimerSlot {
    fn drop(&mut self) {
        self.cancel();
    }
}
