//! Fresh/stale bookkeeping with a stale timer.

use std::time::Duration;

use tokio::sync::mpsc::WeakUnboundedSender;

use crate::state::ReplicaData;
use crate::timer::{TimerSlot, TimerToken};

/// Outcome of a freshness transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FreshnessChange {
    BecameFresh,
    BecameStale,
}

/// Flips data between fresh and stale and owns the stale timer.
#[derive(Debug)]
pub(crate) struct FreshnessController {
    stale_time: Option<Duration>,
    timer: TimerSlot,
}

impl FreshnessController {
    pub(crate) fn new(stale_time: Option<Duration>) -> Self {
        Self {
            stale_time,
            timer: TimerSlot::default(),
        }
    }

    /// Mark data fresh and arm the stale timer.
    ///
    /// Returns `BecameFresh` only if data was previously stale. The timer is
    /// re-armed whenever data is present.
    pub(crate) fn make_fresh<T, M: Send + 'static>(
        &mut self,
        data: Option<&mut ReplicaData<T>>,
        tx: WeakUnboundedSender<M>,
        message: impl FnOnce(TimerToken) -> M + Send + 'static,
    ) -> Option<FreshnessChange> {
        let data = data?;
        let was_fresh = data.is_fresh;
        data.is_fresh = true;

        match self.stale_time {
            Some(stale_time) => self.timer.arm(stale_time, tx, message),
            None => self.timer.cancel(),
        }

        (!was_fresh).then_some(FreshnessChange::BecameFresh)
    }

    /// Mark data stale and disarm the timer.
    pub(crate) fn invalidate<T>(
        &mut self,
        data: Option<&mut ReplicaData<T>>,
    ) -> Option<FreshnessChange> {
        self.timer.cancel();
        let data = data?;
        if !data.is_fresh {
            return None;
        }
        data.is_fresh = false;
        Some(FreshnessChange::BecameStale)
    }

    /// Handle a fired stale timer. Stale tokens are ignored.
    pub(crate) fn on_timer<T>(
        &mut self,
        token: TimerToken,
        data: Option<&mut ReplicaData<T>>,
    ) -> Option<FreshnessChange> {
        if !self.timer.fire(token) {
            return None;
        }
        self.invalidate(data)
    }

    pub(crate) fn cancel(&mut self) {
        self.timer.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test(start_paused = true)]
    async fn test_stale_timer_invalidates() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut controller = FreshnessController::new(Some(Duration::from_secs(5)));
        let mut data = ReplicaData::new("a", false);

        let change = controller.make_fresh(Some(&mut data), tx.downgrade(), |t| t);
        assert_eq!(change, Some(FreshnessChange::BecameFresh));
        assert!(data.is_fresh);

        let token = rx.recv().await.unwrap();
        assert_eq!(
            controller.on_timer(token, Some(&mut data)),
            Some(FreshnessChange::BecameStale)
        );
        assert!(!data.is_fresh);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_stale_time_stays_fresh() {
        let (tx, mut rx) = mpsc::unbounded_channel::<TimerToken>();
        let mut controller = FreshnessController::new(None);
        let mut data = ReplicaData::new(1, false);

        controller.make_fresh(Some(&mut data), tx.downgrade(), |t| t);
        tokio::time::sleep(Duration::from_secs(3600)).await;

        assert!(rx.try_recv().is_err());
        assert!(data.is_fresh);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearming_drops_old_timer() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut controller = FreshnessController::new(Some(Duration::from_secs(1)));
        let mut data = ReplicaData::new(1, false);

        controller.make_fresh(Some(&mut data), tx.downgrade(), |t| t);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(
            controller.make_fresh(Some(&mut data), tx.downgrade(), |t| t),
            None
        );

        let token = rx.recv().await.unwrap();
        assert!(controller.on_timer(token, Some(&mut data)).is_some());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_invalidate_without_data() {
        let mut controller = FreshnessController::new(None);
        assert_eq!(controller.invalidate::<i32>(None), None);
    }
}
