//! Readiness gate: predicate waits woken by coalesced signals.
//!
//! Writers call [`ReadinessGate::signal`] from anywhere (it never blocks or
//! suspends).  Waiters call [`ReadinessGate::wait`] with their own predicate
//! and re-check it every time a signal is delivered.
//!
//! ```text
//!  slot write ─┐
//!  slot write ─┼─► signal() ──(pending? skip)──► spawn deliver ─► notify_waiters()
//!  slot write ─┘                                                    │
//!                               waiter A: predicate()? ◄────────────┤
//!                               waiter B: predicate()? ◄────────────┘
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use crate::error::{NodeSdkError, Result};

/// Condition-style wait/notify primitive shared by everything that waits on
/// a client's behaviors.
#[derive(Clone, Default)]
pub struct ReadinessGate {
    inner: Arc<GateInner>,
}

#[derive(Default)]
struct GateInner {
    notify: Notify,
    /// Set while a delivery is scheduled but has not run yet.
    pending: AtomicBool,
    delivered: AtomicU64,
}

impl GateInner {
    fn deliver(&self) {
        // Clear first: a write racing with this delivery schedules a new one.
        self.pending.store(false, Ordering::Release);
        self.delivered.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_waiters();
    }
}

/// Delivers on drop, whether its task ran or was discarded.
struct Delivery(Arc<GateInner>);

impl Drop for Delivery {
    fn drop(&mut self) {
        self.0.deliver();
    }
}

impl ReadinessGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule a wake-up of every current waiter.
    ///
    /// Coalesced: while one delivery is pending, further calls are no-ops.
    /// Inside a tokio runtime the delivery runs as a separate task; outside
    /// of one it happens immediately.  A delivery task dropped unpolled
    /// (runtime shutting down) still delivers, so `pending` never sticks.
    pub fn signal(&self) {
        if self.inner.pending.swap(true, Ordering::AcqRel) {
            return;
        }

        let delivery = Delivery(self.inner.clone());
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { drop(delivery) });
            }
            Err(_) => drop(delivery),
        }
    }

    /// Whether a delivery is scheduled but not yet run.
    pub fn is_pending(&self) -> bool {
        self.inner.pending.load(Ordering::Acquire)
    }

    /// Number of deliveries so far (each wakes all waiters once).
    pub fn signals_delivered(&self) -> u64 {
        self.inner.delivered.load(Ordering::Relaxed)
    }

    /// Forget a scheduled delivery.  [`Client::reset`](crate::Client::reset)
    /// calls this before the next run starts, possibly on another runtime.
    pub(crate) fn clear_pending(&self) {
        self.inner.pending.store(false, Ordering::Release);
    }

    /// Suspend until `predicate` returns `true`.
    ///
    /// The predicate runs once up front and again after every delivered
    /// signal; it must be cheap and free of side effects.  With a `timeout`
    /// the wait fails with [`NodeSdkError::Timeout`].
    pub async fn wait<P>(&self, predicate: P, timeout: Option<Duration>) -> Result<()>
    where
        P: Fn() -> bool,
    {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, self.wait_until(predicate))
                .await
                .map_err(|_| NodeSdkError::Timeout(limit)),
            None => {
                self.wait_until(predicate).await;
                Ok(())
            }
        }
    }

    async fn wait_until<P>(&self, predicate: P)
    where
        P: Fn() -> bool,
    {
        loop {
            // Register interest before checking, so a signal landing between
            // the check and the await is not lost.
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if predicate() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for ReadinessGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadinessGate")
            .field("pending", &self.is_pending())
            .field("delivered", &self.signals_delivered())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn drain(gate: &ReadinessGate) {
        while gate.is_pending() {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn bursts_of_signals_coalesce() {
        let gate = ReadinessGate::new();
        gate.signal();
        gate.signal();
        gate.signal();
        assert!(gate.is_pending());

        drain(&gate).await;
        assert_eq!(gate.signals_delivered(), 1);

        gate.signal();
        drain(&gate).await;
        assert_eq!(gate.signals_delivered(), 2);
    }

    #[test]
    fn signal_outside_runtime_delivers_immediately() {
        let gate = ReadinessGate::new();
        gate.signal();
        assert!(!gate.is_pending());
        assert_eq!(gate.signals_delivered(), 1);
    }

    #[test]
    fn delivery_dropped_by_runtime_shutdown_is_not_lost() {
        let gate = ReadinessGate::new();
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        // The delivery task is queued but never polled before shutdown.
        rt.block_on(async { gate.signal() });
        drop(rt);

        assert!(!gate.is_pending());
        assert_eq!(gate.signals_delivered(), 1);

        gate.signal();
        assert_eq!(gate.signals_delivered(), 2, "later signals are not swallowed");
    }

    #[tokio::test]
    async fn wait_returns_at_once_when_predicate_holds() {
        let gate = ReadinessGate::new();
        gate.wait(|| true, Some(Duration::from_millis(1)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn every_waiter_wakes_on_signal() {
        let gate = ReadinessGate::new();
        let flag = Arc::new(AtomicBool::new(false));

        let mut waiters = Vec::new();
        for _ in 0..4 {
            let gate = gate.clone();
            let flag = flag.clone();
            waiters.push(tokio::spawn(async move {
                gate.wait(move || flag.load(Ordering::SeqCst), None).await
            }));
        }
        tokio::task::yield_now().await;

        flag.store(true, Ordering::SeqCst);
        gate.signal();

        for w in waiters {
            tokio::time::timeout(Duration::from_secs(5), w)
                .await
                .expect("waiter never woke")
                .unwrap()
                .unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_without_touching_predicate_state() {
        let gate = ReadinessGate::new();
        let flag = Arc::new(AtomicBool::new(false));
        let f = flag.clone();

        let err = gate
            .wait(move || f.load(Ordering::SeqCst), Some(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(!flag.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn signal_without_state_change_keeps_waiter_parked() {
        let gate = ReadinessGate::new();
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait(|| false, None).await })
        };
        tokio::task::yield_now().await;

        gate.signal();
        drain(&gate).await;
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        waiter.abort();
    }
}
