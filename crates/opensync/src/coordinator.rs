//! Shutdown coordinator.
//!
//! Waits for a confirmed critical power status, takes the heartbeat over from
//! the sequencer, drains the sync pipeline against a hard deadline and then
//! releases the heartbeat so the UPS can cut power. It runs once per process:
//! [`ShutdownCoordinator::run`] consumes the coordinator.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::power::{CoordinatorHeartbeat, Heartbeat, PowerStatus};
use crate::sync::{DrainOutcome, DrainRequest, SyncControl};

/// Observable phase of the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinatorPhase {
    /// Waiting for critical power.
    Running,
    /// Draining the sync pipeline; the coordinator owns the heartbeat.
    Draining,
    /// Heartbeat released. Terminal.
    Released,
}

impl std::fmt::Display for CoordinatorPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Draining => write!(f, "draining"),
            Self::Released => write!(f, "released"),
        }
    }
}

/// What happened between entering the drain and releasing the heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseReport {
    /// How the drain ended.
    pub outcome: DrainOutcome,
    /// Time from entering the drain to the release, in milliseconds.
    pub elapsed_ms: u64,
    /// Wall-clock time of the release.
    pub released_at: DateTime<Utc>,
    /// Error reported by the facility while releasing the line, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_error: Option<String>,
}

impl ReleaseReport {
    /// Time from entering the drain to the release.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms)
    }
}

enum CoordinatorState {
    Running,
    Draining {
        heartbeat: CoordinatorHeartbeat,
        started: Instant,
        deadline: Instant,
    },
    Released(ReleaseReport),
}

/// The shutdown coordinator.
pub struct ShutdownCoordinator<S: SyncControl + ?Sized> {
    sync: Arc<S>,
    heartbeat: Heartbeat,
    drain_deadline: Duration,
    drive_interval: Duration,
    phase: watch::Sender<CoordinatorPhase>,
}

impl<S: SyncControl + ?Sized> std::fmt::Debug for ShutdownCoordinator<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("drain_deadline", &self.drain_deadline)
            .field("drive_interval", &self.drive_interval)
            .field("phase", &*self.phase.borrow())
            .finish_non_exhaustive()
    }
}

impl<S: SyncControl + ?Sized> ShutdownCoordinator<S> {
    /// Create a coordinator.
    ///
    /// `drive_interval` is how often the heartbeat is refreshed while
    /// draining; use the sequencer's poll interval.
    #[must_use]
    pub fn new(
        sync: Arc<S>,
        heartbeat: Heartbeat,
        drain_deadline: Duration,
        drive_interval: Duration,
    ) -> Self {
        Self {
            sync,
            heartbeat,
            drain_deadline,
            drive_interval,
            phase: watch::Sender::new(CoordinatorPhase::Running),
        }
    }

    /// Subscribe to phase changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<CoordinatorPhase> {
        self.phase.subscribe()
    }

    /// Run to completion.
    ///
    /// Returns `Ok(None)` if the status channel closes before power turns
    /// critical, otherwise the report of the one and only release.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if the heartbeat was already handed off.
    /// A failed hardware release is logged and kept in the report's
    /// `release_error`; nothing will ever write the line again.
    pub async fn run(
        self,
        mut status: watch::Receiver<PowerStatus>,
    ) -> Result<Option<ReleaseReport>> {
        let mut state = CoordinatorState::Running;
        loop {
            state = match state {
                CoordinatorState::Running => {
                    let closed = status
                        .wait_for(|s| *s == PowerStatus::Critical)
                        .await
                        .is_err();
                    if closed {
                        debug!("power status channel closed, coordinator exiting");
                        return Ok(None);
                    }

                    let heartbeat = self.heartbeat.hand_off().ok_or_else(|| {
                        Error::internal("heartbeat was handed off before the coordinator ran")
                    })?;
                    let started = Instant::now();
                    self.phase.send_replace(CoordinatorPhase::Draining);
                    warn!(
                        deadline_ms = self.drain_deadline.as_millis(),
                        "power critical, draining sync pipeline"
                    );
                    CoordinatorState::Draining {
                        heartbeat,
                        started,
                        deadline: started + self.drain_deadline,
                    }
                }

                CoordinatorState::Draining {
                    heartbeat,
                    started,
                    deadline,
                } => {
                    let outcome = self.drain(&heartbeat, deadline).await;
                    let elapsed = started.elapsed();
                    let elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);

                    if outcome.is_completed() {
                        info!(elapsed_ms, "sync pipeline drained");
                    } else {
                        warn!(elapsed_ms, %outcome, "drain deadline reached, releasing anyway");
                    }

                    // The token is consumed even if the write fails; the line
                    // is never driven again either way.
                    let release_error = heartbeat.release().err().map(|e| e.to_string());
                    self.phase.send_replace(CoordinatorPhase::Released);
                    info!(%outcome, "heartbeat released, host may lose power");

                    CoordinatorState::Released(ReleaseReport {
                        outcome,
                        elapsed_ms,
                        released_at: Utc::now(),
                        release_error,
                    })
                }

                CoordinatorState::Released(report) => return Ok(Some(report)),
            };
        }
    }

    async fn drain(&self, heartbeat: &CoordinatorHeartbeat, deadline: Instant) -> DrainOutcome {
        let work = async {
            self.sync.pause().await;
            self.sync.drain(DrainRequest { deadline }).await
        };
        tokio::pin!(work);

        let expired = sleep_until(deadline);
        tokio::pin!(expired);

        let mut ticker = interval(self.drive_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                outcome = &mut work => return outcome,
                () = &mut expired => return DrainOutcome::Unanswered,
                _ = ticker.tick() => {
                    if let Err(e) = heartbeat.drive() {
                        warn!(error = %e, "heartbeat write failed while draining");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpio::{GpioBank, SimulatedGpio, WriteEvent};
    use crate::power::{HeartbeatOwner, PowerLines, PowerSequencer};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::time::sleep;

    /// Sync control whose drain finishes after a fixed time, or never.
    #[derive(Debug, Default)]
    struct ScriptedSync {
        finish_after: Option<Duration>,
        paused: AtomicBool,
        drains: AtomicUsize,
    }

    #[async_trait]
    impl SyncControl for ScriptedSync {
        async fn pause(&self) {
            self.paused.store(true, Ordering::SeqCst);
        }

        async fn drain(&self, request: DrainRequest) -> DrainOutcome {
            self.drains.fetch_add(1, Ordering::SeqCst);
            match self.finish_after {
                Some(after) if Instant::now() + after <= request.deadline => {
                    sleep(after).await;
                    DrainOutcome::Completed
                }
                _ => {
                    sleep_until(request.deadline).await;
                    DrainOutcome::TimedOut { in_flight: 1 }
                }
            }
        }
    }

    /// Sync control that ignores the deadline.
    #[derive(Debug)]
    struct HungSync;

    #[async_trait]
    impl SyncControl for HungSync {
        async fn pause(&self) {
            std::future::pending::<()>().await;
        }

        async fn drain(&self, _request: DrainRequest) -> DrainOutcome {
            std::future::pending().await
        }
    }

    struct Rig {
        sim: Arc<SimulatedGpio>,
        heartbeat: Heartbeat,
        status: watch::Receiver<PowerStatus>,
    }

    /// Sequencer with default wiring, 500 ms poll and two-sample debounce,
    /// running in the background.
    fn start(fault: bool, online: bool) -> Rig {
        let sim = Arc::new(SimulatedGpio::new());
        sim.set_input(17, fault);
        sim.set_input(27, online);
        let bank = Arc::new(GpioBank::new(sim.clone()));
        let lines = PowerLines::default();
        lines.setup(&bank).unwrap();
        let heartbeat = Heartbeat::new(bank.clone(), lines.host_alive);
        let sequencer = PowerSequencer::new(
            bank,
            lines,
            heartbeat.clone(),
            Duration::from_millis(500),
            2,
        )
        .unwrap();
        let status = sequencer.subscribe();
        tokio::spawn(sequencer.run());
        Rig {
            sim,
            heartbeat,
            status,
        }
    }

    fn coordinator<S: SyncControl + ?Sized>(sync: Arc<S>, rig: &Rig) -> ShutdownCoordinator<S> {
        ShutdownCoordinator::new(
            sync,
            rig.heartbeat.clone(),
            Duration::from_secs(5),
            Duration::from_millis(500),
        )
    }

    fn value_writes_after_unexport(sim: &SimulatedGpio) -> usize {
        sim.writes()
            .iter()
            .skip_while(|w| **w != WriteEvent::Unexport { pin: 18 })
            .filter(|w| matches!(w, WriteEvent::Value { pin: 18, .. }))
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn test_normal_keeps_running() {
        let rig = start(false, false);
        let sync = Arc::new(ScriptedSync::default());
        let coordinator = coordinator(sync.clone(), &rig);
        let phase = coordinator.subscribe();
        let task = tokio::spawn(coordinator.run(rig.status.clone()));

        sleep(Duration::from_secs(3)).await;
        assert!(!task.is_finished());
        assert_eq!(*phase.borrow(), CoordinatorPhase::Running);
        assert!(rig.sim.level(18));
        assert_eq!(rig.heartbeat.owner(), HeartbeatOwner::Sequencer);
        assert!(!sync.paused.load(Ordering::SeqCst));
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_battery_does_not_drain() {
        let rig = start(false, false);
        let sync = Arc::new(ScriptedSync::default());
        let task = tokio::spawn(coordinator(sync.clone(), &rig).run(rig.status.clone()));

        rig.sim.set_input(17, true);
        rig.sim.set_input(27, true);
        sleep(Duration::from_secs(3)).await;

        assert_eq!(*rig.status.borrow(), PowerStatus::OnBattery);
        assert!(!task.is_finished());
        assert!(rig.sim.level(18));
        assert_eq!(sync.drains.load(Ordering::SeqCst), 0);
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_drains_then_releases() {
        let rig = start(true, true);
        let sync = Arc::new(ScriptedSync {
            finish_after: Some(Duration::from_secs(2)),
            ..ScriptedSync::default()
        });
        let task = tokio::spawn(coordinator(sync.clone(), &rig).run(rig.status.clone()));

        rig.sim.set_input(27, false);
        let report = task.await.unwrap().unwrap().unwrap();

        assert_eq!(report.outcome, DrainOutcome::Completed);
        assert!(report.release_error.is_none());
        assert!(report.elapsed() >= Duration::from_secs(2));
        assert!(report.elapsed() < Duration::from_millis(2_100));
        assert!(sync.paused.load(Ordering::SeqCst));
        assert_eq!(rig.heartbeat.owner(), HeartbeatOwner::Released);
        assert!(!rig.sim.is_driven(18));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_pipeline_released_at_deadline() {
        let rig = start(true, false);
        let sync = Arc::new(ScriptedSync::default());
        let report = coordinator(sync, &rig)
            .run(rig.status.clone())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(report.outcome, DrainOutcome::TimedOut { in_flight: 1 });
        assert_eq!(report.elapsed(), Duration::from_secs(5));
        assert_eq!(rig.heartbeat.owner(), HeartbeatOwner::Released);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresponsive_pipeline_released_at_deadline() {
        let rig = start(true, false);
        let report = coordinator(Arc::new(HungSync), &rig)
            .run(rig.status.clone())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(report.outcome, DrainOutcome::Unanswered);
        assert_eq!(report.elapsed(), Duration::from_secs(5));
        assert!(!rig.sim.is_driven(18));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_driven_while_draining() {
        let rig = start(true, false);
        let sync = Arc::new(ScriptedSync::default());
        let coordinator = coordinator(sync, &rig);
        let mut phase = coordinator.subscribe();
        let task = tokio::spawn(coordinator.run(rig.status.clone()));

        phase
            .wait_for(|p| *p == CoordinatorPhase::Draining)
            .await
            .unwrap();
        let at_handoff = rig.sim.value_writes(18);
        sleep(Duration::from_millis(2_100)).await;

        assert_eq!(rig.heartbeat.owner(), HeartbeatOwner::Coordinator);
        assert!(rig.sim.value_writes(18) >= at_handoff + 4);
        assert!(rig.sim.level(18));
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_writes_after_release() {
        let rig = start(true, false);
        let sync = Arc::new(ScriptedSync {
            finish_after: Some(Duration::from_millis(300)),
            ..ScriptedSync::default()
        });
        coordinator(sync, &rig)
            .run(rig.status.clone())
            .await
            .unwrap()
            .unwrap();

        // Keep the sequencer ticking well past the release.
        sleep(Duration::from_secs(5)).await;
        assert_eq!(value_writes_after_unexport(&rig.sim), 0);
        assert_eq!(
            rig.sim.writes().last(),
            Some(&WriteEvent::Unexport { pin: 18 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_failure_is_reported() {
        let rig = start(true, false);
        rig.sim.fail_next_unexport(18);
        let sync = Arc::new(ScriptedSync {
            finish_after: Some(Duration::ZERO),
            ..ScriptedSync::default()
        });
        let report = coordinator(sync, &rig)
            .run(rig.status.clone())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(report.outcome, DrainOutcome::Completed);
        let error = report.release_error.unwrap();
        assert!(error.contains("simulated unexport failure"));
        assert_eq!(rig.heartbeat.owner(), HeartbeatOwner::Released);
    }

    #[tokio::test(start_paused = true)]
    async fn test_return_to_normal_does_not_rearm() {
        let rig = start(true, false);
        let sync = Arc::new(ScriptedSync {
            finish_after: Some(Duration::ZERO),
            ..ScriptedSync::default()
        });
        coordinator(sync.clone(), &rig)
            .run(rig.status.clone())
            .await
            .unwrap()
            .unwrap();

        rig.sim.set_input(17, false);
        sleep(Duration::from_secs(2)).await;
        assert_eq!(*rig.status.borrow(), PowerStatus::Normal);

        // Ownership is gone for good: no new hand-off, no writes.
        assert!(rig.heartbeat.hand_off().is_none());
        assert_eq!(rig.heartbeat.owner(), HeartbeatOwner::Released);
        assert_eq!(value_writes_after_unexport(&rig.sim), 0);
        assert_eq!(sync.drains.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_glitch_at_boot_does_not_release() {
        let rig = start(true, false);
        rig.sim.set_input(27, true);
        let sync = Arc::new(ScriptedSync::default());
        let task = tokio::spawn(coordinator(sync.clone(), &rig).run(rig.status.clone()));

        sleep(Duration::from_secs(3)).await;
        assert!(!task.is_finished());
        assert_eq!(*rig.status.borrow(), PowerStatus::OnBattery);
        assert_eq!(rig.heartbeat.owner(), HeartbeatOwner::Sequencer);
        assert!(rig.sim.is_driven(18));
        assert_eq!(sync.drains.load(Ordering::SeqCst), 0);
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_status_channel() {
        let rig = start(false, false);
        let (tx, rx) = watch::channel(PowerStatus::Normal);
        drop(tx);
        let result = coordinator(Arc::new(ScriptedSync::default()), &rig)
            .run(rx)
            .await
            .unwrap();
        assert!(result.is_none());
        assert_eq!(rig.heartbeat.owner(), HeartbeatOwner::Sequencer);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_already_taken() {
        let rig = start(true, false);
        let _stolen = rig.heartbeat.hand_off().unwrap();
        let err = coordinator(Arc::new(ScriptedSync::default()), &rig)
            .run(rig.status.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }
}
