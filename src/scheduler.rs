//! C6: a single-shot, replaceable deferred event per FSM instance.
//!
//! Each FSM owns exactly one [`DelayedCommandScheduler`]. Calling
//! [`DelayedCommandScheduler::replace_work`] cancels whatever delivery was
//! previously pending and arms a new one; dropping the scheduler (on FSM
//! shutdown) cancels any pending delivery, since the spawned task holds only
//! a [`tokio::sync::mpsc::Sender`] whose receiver is dropped along with the
//! FSM's input queue.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Policy default: the wallet's MPP collection timeout. Exact duration is a
/// tuning knob, not a correctness property, provided it outlives realistic
/// peer retransmission delays.
pub const DEFAULT_RECEIVE_GRACE_PERIOD: Duration = Duration::from_secs(60);

/// Schedules delivery of a `T` back onto an FSM's input queue after a fixed
/// delay, cancelling any previously-scheduled delivery.
pub struct DelayedCommandScheduler<T> {
    grace_period: Duration,
    out: mpsc::UnboundedSender<T>,
    pending: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> DelayedCommandScheduler<T> {
    pub fn new(out: mpsc::UnboundedSender<T>) -> Self {
        Self::with_grace_period(out, DEFAULT_RECEIVE_GRACE_PERIOD)
    }

    pub fn with_grace_period(out: mpsc::UnboundedSender<T>, grace_period: Duration) -> Self {
        Self {
            grace_period,
            out,
            pending: None,
        }
    }

    /// Schedule `token` for delivery after the grace period, replacing (and
    /// thus cancelling) any previously pending delivery.
    pub fn replace_work(&mut self, token: T) {
        if let Some(old) = self.pending.take() {
            old.abort();
        }

        let out = self.out.clone();
        let grace_period = self.grace_period;
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(grace_period).await;
            // If the FSM already shut down, the receiver is gone; dropping
            // the token on the floor is fine.
            let _ = out.send(token);
        }));
    }
}

impl<T> Drop for DelayedCommandScheduler<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_grace_period() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut sched =
            DelayedCommandScheduler::with_grace_period(tx, Duration::from_secs(1));

        sched.replace_work("first");
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::advance(Duration::from_millis(600)).await;
        assert_eq!(rx.try_recv().unwrap(), "first");
    }

    #[tokio::test(start_paused = true)]
    async fn replace_cancels_prior_delivery() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut sched =
            DelayedCommandScheduler::with_grace_period(tx, Duration::from_secs(1));

        sched.replace_work("stale");
        tokio::time::advance(Duration::from_millis(900)).await;
        sched.replace_work("fresh");
        tokio::time::advance(Duration::from_millis(1100)).await;

        assert_eq!(rx.try_recv().unwrap(), "fresh");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn drop_cancels_pending_delivery() {
        let (tx, mut rx) = mpsc::unbounded_channel::<&'static str>();
        {
            let mut sched = DelayedCommandScheduler::with_grace_period(
                tx,
                Duration::from_secs(1),
            );
            sched.replace_work("never");
        }
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(rx.try_recv().is_err());
    }
}
