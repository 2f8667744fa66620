//! UPS power state.
//!
//! The UPS HAT reports two levels: `power-fault` (utility power has failed
//! and the UPS runs on battery) and `ups-online` (the UPS can still supply
//! the host). The host answers on `host-alive`.
//!
//! | fault | online | status       |
//! |-------|--------|--------------|
//! | 0     | *      | `Normal`     |
//! | 1     | 1      | `OnBattery`  |
//! | 1     | 0      | `Critical`   |

pub mod heartbeat;
pub mod sequencer;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

use crate::config::GpioConfig;
use crate::error::Result;
use crate::gpio::{Direction, GpioBank, GpioLine};

pub use heartbeat::{CoordinatorHeartbeat, Heartbeat, HeartbeatOutput, HeartbeatOwner};
pub use sequencer::{PowerSequencer, SequencerHandle};

/// Power status derived from the two UPS input lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerStatus {
    /// Utility power present.
    Normal,
    /// Utility power failed; the UPS is supplying the host from battery.
    OnBattery,
    /// The UPS can no longer guarantee supply. Last warning before power loss.
    Critical,
}

impl PowerStatus {
    /// Compute the status from sampled `power-fault` and `ups-online` levels.
    #[must_use]
    pub const fn from_inputs(fault: bool, online: bool) -> Self {
        match (fault, online) {
            (false, _) => Self::Normal,
            (true, true) => Self::OnBattery,
            (true, false) => Self::Critical,
        }
    }
}

impl std::fmt::Display for PowerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::OnBattery => write!(f, "on_battery"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// A confirmed change of power status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    /// Status before the change.
    pub from: PowerStatus,
    /// Status after the change.
    pub to: PowerStatus,
}

/// The three UPS lines in the configured wiring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerLines {
    /// Utility power fault input.
    pub power_fault: GpioLine,
    /// UPS online input.
    pub ups_online: GpioLine,
    /// Host-alive heartbeat output.
    pub host_alive: GpioLine,
}

impl Default for PowerLines {
    fn default() -> Self {
        Self::from_config(&GpioConfig::default())
    }
}

impl PowerLines {
    /// Bind the line names to the configured pins.
    #[must_use]
    pub fn from_config(config: &GpioConfig) -> Self {
        Self {
            power_fault: GpioLine::new("power-fault", config.power_fault_pin),
            ups_online: GpioLine::new("ups-online", config.ups_online_pin),
            host_alive: GpioLine::new("host-alive", config.heartbeat_pin),
        }
    }

    /// Export and direction-configure all three lines.
    ///
    /// Safe to run on every boot and again from the daemon; a second call
    /// changes nothing.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::GpioConfig`] if any line cannot be configured.
    pub fn setup(&self, bank: &GpioBank) -> Result<()> {
        bank.configure(&self.power_fault, Direction::In)?;
        bank.configure(&self.ups_online, Direction::In)?;
        bank.configure(&self.host_alive, Direction::Out)?;
        info!(
            backend = bank.backend(),
            power_fault = self.power_fault.pin,
            ups_online = self.ups_online.pin,
            host_alive = self.host_alive.pin,
            "UPS lines configured"
        );
        Ok(())
    }

    /// Sample both inputs and compute the status.
    ///
    /// # Errors
    ///
    /// Propagates the read error of either line.
    pub fn sample(&self, bank: &GpioBank) -> Result<PowerStatus> {
        let fault = bank.read(&self.power_fault)?;
        let online = bank.read(&self.ups_online)?;
        Ok(PowerStatus::from_inputs(fault, online))
    }
}

/// Requires a changed status to be seen on consecutive samples before it is
/// accepted.
#[derive(Debug, Clone)]
pub struct Debouncer {
    required: u32,
    confirmed: PowerStatus,
    candidate: Option<(PowerStatus, u32)>,
}

impl Debouncer {
    /// Start from an already confirmed status. `required` is clamped to at least 1.
    #[must_use]
    pub fn new(initial: PowerStatus, required: u32) -> Self {
        Self {
            required: required.max(1),
            confirmed: initial,
            candidate: None,
        }
    }

    /// The currently confirmed status.
    #[must_use]
    pub fn confirmed(&self) -> PowerStatus {
        self.confirmed
    }

    /// Feed one sample. Returns the transition when a new status is confirmed.
    pub fn observe(&mut self, sample: PowerStatus) -> Option<Transition> {
        if sample == self.confirmed {
            self.candidate = None;
            return None;
        }

        let seen = match self.candidate {
            Some((status, count)) if status == sample => count + 1,
            _ => 1,
        };

        if seen >= self.required {
            let transition = Transition {
                from: self.confirmed,
                to: sample,
            };
            self.confirmed = sample;
            self.candidate = None;
            Some(transition)
        } else {
            self.candidate = Some((sample, seen));
            None
        }
    }

    /// Forget any pending candidate, e.g. after a failed sample.
    pub fn reset(&mut self) {
        self.candidate = None;
    }
}

/// What the UPS-online line looked like during the startup probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsProbe {
    /// The line toggled; the HAT signals a charged battery this way.
    Toggling,
    /// The line stayed high.
    SteadyHigh,
    /// The line stayed low; there is probably no battery.
    SteadyLow,
}

impl UpsProbe {
    /// Whether the UPS is expected to keep the host alive after utility power loss.
    #[must_use]
    pub fn battery_present(self) -> bool {
        !matches!(self, Self::SteadyLow)
    }
}

/// Watch the UPS-online line for `window` to find out whether a battery is fitted.
///
/// # Errors
///
/// Propagates non-transient read errors. Transient failures are skipped.
pub async fn probe_ups(bank: &GpioBank, lines: &PowerLines, window: Duration) -> Result<UpsProbe> {
    const STEP: Duration = Duration::from_millis(100);

    let deadline = Instant::now() + window;
    let mut first = None;
    loop {
        match bank.read(&lines.ups_online) {
            Ok(level) => match first {
                None => first = Some(level),
                Some(initial) if initial != level => {
                    info!("UPS online line is toggling, battery detected");
                    return Ok(UpsProbe::Toggling);
                }
                Some(_) => {}
            },
            Err(e) if e.is_transient() => warn!(error = %e, "UPS probe sample failed"),
            Err(e) => return Err(e),
        }
        if Instant::now() >= deadline {
            break;
        }
        sleep(STEP).await;
    }

    let probe = if first == Some(true) {
        UpsProbe::SteadyHigh
    } else {
        UpsProbe::SteadyLow
    };
    if !probe.battery_present() {
        warn!("No UPS battery detected, pending files will not be processed on shutdown");
    }
    Ok(probe)
}
