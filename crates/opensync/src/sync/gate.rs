//! Admission control for transfers.
//!
//! Every transfer holds a [`TransferPermit`] from the moment it starts until
//! its ledger entry is written. Pausing the gate refuses new permits; draining
//! waits for the in-flight count to reach zero.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::timeout_at;
use tracing::{debug, info, warn};

use super::{DrainOutcome, DrainRequest, SyncControl};

/// Admission gate shared by the pipeline and the shutdown coordinator.
#[derive(Debug)]
pub struct TransferGate {
    accepting: watch::Sender<bool>,
    in_flight: watch::Sender<usize>,
}

impl Default for TransferGate {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferGate {
    /// Create an open gate with nothing in flight.
    #[must_use]
    pub fn new() -> Self {
        Self {
            accepting: watch::Sender::new(true),
            in_flight: watch::Sender::new(0),
        }
    }

    /// Whether the gate refuses new transfers.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        !*self.accepting.borrow()
    }

    /// Number of transfers holding a permit.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        *self.in_flight.borrow()
    }

    /// Admit one transfer, or `None` once paused.
    #[must_use]
    pub fn begin(self: &Arc<Self>) -> Option<TransferPermit> {
        // Count first, then check: a drain that has seen the pause will
        // also see this increment.
        self.in_flight.send_modify(|n| *n += 1);
        if self.is_paused() {
            self.finish();
            return None;
        }
        Some(TransferPermit { gate: self.clone() })
    }

    fn finish(&self) {
        self.in_flight.send_modify(|n| *n = n.saturating_sub(1));
    }

    /// Stop admitting transfers. Returns `true` on the first call.
    pub fn close(&self) -> bool {
        self.accepting.send_replace(false)
    }

    /// Resolves once the gate has been paused.
    pub async fn paused(&self) {
        let mut rx = self.accepting.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|accepting| !accepting).await.map(|_| ());
    }
}

#[async_trait]
impl SyncControl for TransferGate {
    async fn pause(&self) {
        if self.close() {
            info!(in_flight = self.in_flight(), "sync pipeline paused");
        }
    }

    async fn drain(&self, request: DrainRequest) -> DrainOutcome {
        self.pause().await;

        let mut rx = self.in_flight.subscribe();
        let waited = timeout_at(request.deadline, rx.wait_for(|n| *n == 0))
            .await
            .map(|r| r.map(|_| ()));

        match waited {
            Ok(_) => {
                debug!("sync pipeline drained");
                DrainOutcome::Completed
            }
            Err(_) => {
                let in_flight = self.in_flight();
                warn!(in_flight, "sync drain deadline reached");
                DrainOutcome::TimedOut { in_flight }
            }
        }
    }
}

/// Proof that one transfer is in flight. Dropping it marks the transfer done.
#[derive(Debug)]
pub struct TransferPermit {
    gate: Arc<TransferGate>,
}

impl Drop for TransferPermit {
    fn drop(&mut self) {
        self.gate.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::{sleep, Instant};

    #[test]
    fn test_permits_count_in_flight() {
        let gate = Arc::new(TransferGate::new());
        let a = gate.begin().unwrap();
        let b = gate.begin().unwrap();
        assert_eq!(gate.in_flight(), 2);
        drop(a);
        assert_eq!(gate.in_flight(), 1);
        drop(b);
        assert_eq!(gate.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_paused_gate_refuses_permits() {
        let gate = Arc::new(TransferGate::new());
        gate.pause().await;
        assert!(gate.is_paused());
        assert!(gate.begin().is_none());
        assert_eq!(gate.in_flight(), 0);
    }

    #[test]
    fn test_close_reports_first_call() {
        let gate = TransferGate::new();
        assert!(gate.close());
        assert!(!gate.close());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_with_nothing_in_flight() {
        let gate = Arc::new(TransferGate::new());
        let outcome = gate.drain(DrainRequest::within(Duration::from_secs(5))).await;
        assert_eq!(outcome, DrainOutcome::Completed);
        assert!(gate.is_paused());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_waits_for_permit() {
        let gate = Arc::new(TransferGate::new());
        let permit = gate.begin().unwrap();
        tokio::spawn(async move {
            sleep(Duration::from_secs(2)).await;
            drop(permit);
        });

        let start = Instant::now();
        let outcome = gate.drain(DrainRequest::within(Duration::from_secs(5))).await;
        assert_eq!(outcome, DrainOutcome::Completed);
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_times_out() {
        let gate = Arc::new(TransferGate::new());
        let _stuck = gate.begin().unwrap();

        let start = Instant::now();
        let outcome = gate.drain(DrainRequest::within(Duration::from_secs(5))).await;
        assert_eq!(outcome, DrainOutcome::TimedOut { in_flight: 1 });
        assert_eq!(start.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_resolves() {
        let gate = Arc::new(TransferGate::new());
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.paused().await })
        };
        sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        gate.close();
        waiter.await.unwrap();
    }
}
