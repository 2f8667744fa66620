//! Power state sequencer.
//!
//! Samples the two UPS inputs on a fixed tick (and immediately on wake-up
//! events), debounces the derived status, publishes confirmed changes on a
//! watch channel and keeps the heartbeat driven for as long as it owns it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::{Debouncer, Heartbeat, PowerLines, PowerStatus, Transition};
use crate::error::Result;
use crate::gpio::GpioBank;

/// Attempts at the very first sample before giving up at startup.
const INITIAL_SAMPLE_ATTEMPTS: u32 = 3;

/// Stop handle for a running sequencer.
#[derive(Debug, Clone, Default)]
pub struct SequencerHandle {
    stop_signal: Arc<AtomicBool>,
}

impl SequencerHandle {
    /// Signal the sequencer to stop after its current tick.
    pub fn stop(&self) {
        self.stop_signal.store(true, Ordering::SeqCst);
    }

    /// Check if the stop signal has been sent.
    #[must_use]
    pub fn should_stop(&self) -> bool {
        self.stop_signal.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wake {
    Tick,
    Edge,
    Closed,
}

/// The power state sequencer.
#[derive(Debug)]
pub struct PowerSequencer {
    bank: Arc<GpioBank>,
    lines: PowerLines,
    heartbeat: Heartbeat,
    debouncer: Debouncer,
    status_tx: watch::Sender<PowerStatus>,
    poll_interval: Duration,
    handle: SequencerHandle,
    wake: Option<mpsc::Receiver<()>>,
}

impl PowerSequencer {
    /// Create a sequencer over configured lines.
    ///
    /// Takes the first sample immediately; that sample is the initial
    /// confirmed status and is never reported as a transition. A critical
    /// first sample is the exception: it starts out as on-battery and must
    /// be confirmed by the debouncer like any other change, so a glitch at
    /// boot cannot trigger a shutdown.
    ///
    /// # Errors
    ///
    /// Returns the read error if the inputs cannot be sampled at all.
    pub fn new(
        bank: Arc<GpioBank>,
        lines: PowerLines,
        heartbeat: Heartbeat,
        poll_interval: Duration,
        debounce_samples: u32,
    ) -> Result<Self> {
        let mut attempt = 1;
        let sampled = loop {
            match lines.sample(&bank) {
                Ok(status) => break status,
                Err(e) if e.is_transient() && attempt < INITIAL_SAMPLE_ATTEMPTS => {
                    warn!(error = %e, attempt, "initial power sample failed, retrying");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        };
        let initial = if sampled == PowerStatus::Critical {
            warn!("first power sample is critical, waiting for confirmation");
            PowerStatus::OnBattery
        } else {
            sampled
        };
        info!(status = %initial, "initial power status");

        let (status_tx, _) = watch::channel(initial);
        Ok(Self {
            bank,
            lines,
            heartbeat,
            debouncer: Debouncer::new(initial, debounce_samples),
            status_tx,
            poll_interval,
            handle: SequencerHandle::default(),
            wake: None,
        })
    }

    /// Resample immediately whenever a message arrives on `rx`
    /// (edge notifications, simulated power events).
    #[must_use]
    pub fn with_wakeups(mut self, rx: mpsc::Receiver<()>) -> Self {
        self.wake = Some(rx);
        self
    }

    /// The confirmed power status.
    #[must_use]
    pub fn status(&self) -> PowerStatus {
        self.debouncer.confirmed()
    }

    /// Subscribe to confirmed status changes. Only the latest value is kept.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<PowerStatus> {
        self.status_tx.subscribe()
    }

    /// Handle that stops [`PowerSequencer::run`].
    #[must_use]
    pub fn handle(&self) -> SequencerHandle {
        self.handle.clone()
    }

    /// One sample: read, debounce, publish, drive the heartbeat.
    ///
    /// # Errors
    ///
    /// Returns fatal GPIO errors (wrong direction, unconfigured line).
    /// Transient read or write failures are logged and skipped.
    pub fn tick(&mut self) -> Result<Option<Transition>> {
        let transition = match self.lines.sample(&self.bank) {
            Ok(sample) => self.debouncer.observe(sample),
            Err(e) if e.is_transient() => {
                warn!(error = %e, "power sample failed, retrying next tick");
                self.debouncer.reset();
                None
            }
            Err(e) => return Err(e),
        };

        if let Some(t) = transition {
            info!(from = %t.from, to = %t.to, "power status changed");
            self.status_tx.send_replace(t.to);
        }

        match self.heartbeat.drive() {
            Ok(_) => {}
            Err(e) if e.is_transient() => warn!(error = %e, "heartbeat write failed"),
            Err(e) => return Err(e),
        }

        Ok(transition)
    }

    /// Run until stopped through the [`SequencerHandle`].
    ///
    /// # Errors
    ///
    /// Returns the first fatal error from [`PowerSequencer::tick`].
    pub async fn run(mut self) -> Result<()> {
        debug!(
            interval_ms = self.poll_interval.as_millis(),
            "Starting power sequencer"
        );

        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.handle.should_stop() {
            let wake = tokio::select! {
                _ = ticker.tick() => Wake::Tick,
                msg = recv_wake(&mut self.wake) => match msg {
                    Some(()) => Wake::Edge,
                    None => Wake::Closed,
                },
            };

            match wake {
                Wake::Closed => {
                    self.wake = None;
                    continue;
                }
                Wake::Edge => debug!("power sequencer woken early"),
                Wake::Tick => {}
            }

            if let Err(e) = self.tick() {
                error!(error = %e, "power sequencer stopping on fatal error");
                return Err(e);
            }
        }

        debug!("Power sequencer stopped");
        Ok(())
    }
}

async fn recv_wake(rx: &mut Option<mpsc::Receiver<()>>) -> Option<()> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
