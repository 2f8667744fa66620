//! Digital line abstraction over a platform GPIO facility.
//!
//! The [`GpioFacility`] trait is the thin platform seam (sysfs on Linux, an
//! in-memory simulation everywhere else). [`GpioBank`] sits on top of it and
//! enforces the line contract: a line must be configured before use, inputs
//! can only be read, outputs can only be written or released, and
//! re-configuring a line identically is a no-op.

pub mod sim;
#[cfg(target_os = "linux")]
mod sysfs;

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

pub use sim::{SimulatedGpio, WriteEvent};

/// Direction of a digital line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Input (sampled, never driven by the host).
    In,
    /// Output (driven by the host).
    Out,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::In => write!(f, "in"),
            Self::Out => write!(f, "out"),
        }
    }
}

/// Identity of a digital line: a logical name bound to a platform pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GpioLine {
    /// Logical name used in logs and errors.
    pub name: &'static str,
    /// Platform pin identifier (BCM numbering on a Raspberry Pi).
    pub pin: u32,
}

impl GpioLine {
    /// Create a new line identity.
    #[must_use]
    pub const fn new(name: &'static str, pin: u32) -> Self {
        Self { name, pin }
    }
}

impl std::fmt::Display for GpioLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (pin {})", self.name, self.pin)
    }
}

/// Configured state of a line as tracked by the bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineState {
    /// Configured direction.
    pub direction: Direction,
    /// Last driven value for outputs, last sampled value for inputs.
    pub value: Option<bool>,
}

/// Platform GPIO operations, addressed by pin number.
///
/// Implementations must be cheap to call from a polling loop; every method is
/// a single blocking attribute read or write.
pub trait GpioFacility: Send + Sync + std::fmt::Debug {
    /// Short name of the backend, for logs.
    fn name(&self) -> &'static str;

    /// Whether the pin is currently exported.
    ///
    /// # Errors
    ///
    /// Returns an error if the facility itself cannot be queried.
    fn is_exported(&self, pin: u32) -> io::Result<bool>;

    /// Export the pin so it can be configured.
    ///
    /// # Errors
    ///
    /// Returns an error if the pin cannot be exported.
    fn export(&self, pin: u32) -> io::Result<()>;

    /// Current direction of an exported pin.
    ///
    /// # Errors
    ///
    /// Returns an error if the direction cannot be read.
    fn direction(&self, pin: u32) -> io::Result<Direction>;

    /// Set the direction of an exported pin.
    ///
    /// # Errors
    ///
    /// Returns an error if the direction cannot be written.
    fn set_direction(&self, pin: u32, direction: Direction) -> io::Result<()>;

    /// Sample the pin.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be read.
    fn read_value(&self, pin: u32) -> io::Result<bool>;

    /// Drive the pin.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be written.
    fn write_value(&self, pin: u32, high: bool) -> io::Result<()>;

    /// Unexport the pin.
    ///
    /// # Errors
    ///
    /// Returns an error if the pin cannot be unexported.
    fn unexport(&self, pin: u32) -> io::Result<()>;
}

/// Shared handle to the configured lines of one facility.
///
/// Passed explicitly to the sequencer and the heartbeat; there is no global
/// GPIO state.
#[derive(Debug)]
pub struct GpioBank {
    facility: Arc<dyn GpioFacility>,
    lines: Mutex<HashMap<u32, LineState>>,
}

impl GpioBank {
    /// Create a bank over the given facility. No line is configured yet.
    #[must_use]
    pub fn new(facility: Arc<dyn GpioFacility>) -> Self {
        Self {
            facility,
            lines: Mutex::new(HashMap::new()),
        }
    }

    /// Name of the underlying facility.
    #[must_use]
    pub fn backend(&self) -> &'static str {
        self.facility.name()
    }

    fn lines(&self) -> MutexGuard<'_, HashMap<u32, LineState>> {
        self.lines.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ensure the line is exported and set to `direction`.
    ///
    /// Calling this again with the same direction succeeds without touching
    /// the hardware direction, so an output that is already being driven
    /// does not glitch.
    ///
    /// # Errors
    ///
    /// Returns [`Error::GpioConfig`] if the facility cannot export or
    /// configure the line.
    pub fn configure(&self, line: &GpioLine, direction: Direction) -> Result<()> {
        let config_err = |e: io::Error| Error::gpio_config(line.name, line.pin, e.to_string());

        let mut lines = self.lines();

        if !self.facility.is_exported(line.pin).map_err(config_err)? {
            self.facility.export(line.pin).map_err(config_err)?;
        }

        let current = self.facility.direction(line.pin).map_err(config_err)?;
        if current == direction {
            debug!(line = line.name, pin = line.pin, %direction, "GPIO line already configured");
        } else {
            self.facility
                .set_direction(line.pin, direction)
                .map_err(config_err)?;
            info!(line = line.name, pin = line.pin, %direction, "GPIO line configured");
        }

        let value = lines
            .get(&line.pin)
            .filter(|state| state.direction == direction)
            .and_then(|state| state.value);
        lines.insert(line.pin, LineState { direction, value });
        Ok(())
    }

    /// Current tracked state of a line, if configured.
    #[must_use]
    pub fn state(&self, line: &GpioLine) -> Option<LineState> {
        self.lines().get(&line.pin).copied()
    }

    fn checked(&self, line: &GpioLine, requested: Direction) -> Result<LineState> {
        let state = self
            .state(line)
            .ok_or_else(|| Error::LineNotConfigured {
                line: line.name.to_string(),
            })?;
        if state.direction != requested {
            return Err(Error::Direction {
                line: line.name.to_string(),
                actual: state.direction,
                requested,
            });
        }
        Ok(state)
    }

    /// Sample an input line.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Direction`] for an output line,
    /// [`Error::LineNotConfigured`] for an unconfigured line and
    /// [`Error::GpioIo`] if the sample fails.
    pub fn read(&self, line: &GpioLine) -> Result<bool> {
        self.checked(line, Direction::In)?;
        let value = self
            .facility
            .read_value(line.pin)
            .map_err(|e| Error::gpio_io(line.name, e))?;
        if let Some(state) = self.lines().get_mut(&line.pin) {
            state.value = Some(value);
        }
        Ok(value)
    }

    /// Drive an output line.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Direction`] for an input line,
    /// [`Error::LineNotConfigured`] for an unconfigured or released line and
    /// [`Error::GpioIo`] if the write fails.
    pub fn write(&self, line: &GpioLine, value: bool) -> Result<()> {
        self.checked(line, Direction::Out)?;
        self.facility
            .write_value(line.pin, value)
            .map_err(|e| Error::gpio_io(line.name, e))?;
        if let Some(state) = self.lines().get_mut(&line.pin) {
            state.value = Some(value);
        }
        Ok(())
    }

    /// Return an output line to high impedance.
    ///
    /// This is not the same as writing `false`: the line stops being driven
    /// at all (direction back to input, then unexported). The bank forgets
    /// the line first, so even a failed release leaves no path for further
    /// writes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Direction`] for an input line,
    /// [`Error::LineNotConfigured`] for an unconfigured line and
    /// [`Error::GpioIo`] if the facility rejects the release.
    pub fn release(&self, line: &GpioLine) -> Result<()> {
        self.checked(line, Direction::Out)?;
        self.lines().remove(&line.pin);

        self.facility
            .set_direction(line.pin, Direction::In)
            .map_err(|e| Error::gpio_io(line.name, e))?;
        self.facility
            .unexport(line.pin)
            .map_err(|e| Error::gpio_io(line.name, e))?;
        info!(line = line.name, pin = line.pin, "GPIO line released");
        Ok(())
    }
}

/// Open the sysfs facility rooted at `root`.
///
/// # Errors
///
/// Returns [`Error::GpioConfig`] when the host has no sysfs GPIO support
/// (including every non-Linux target).
#[cfg(target_os = "linux")]
pub fn open_sysfs(root: &std::path::Path) -> Result<Arc<dyn GpioFacility>> {
    let gpio = opensync_linux::SysfsGpio::new(root);
    if !gpio.is_available() {
        return Err(Error::gpio_config(
            "sysfs",
            0,
            format!("{} does not exist", root.display()),
        ));
    }
    Ok(Arc::new(gpio))
}

/// Open the sysfs facility rooted at `root`.
///
/// # Errors
///
/// Always fails: sysfs GPIO only exists on Linux.
#[cfg(not(target_os = "linux"))]
pub fn open_sysfs(root: &std::path::Path) -> Result<Arc<dyn GpioFacility>> {
    Err(Error::gpio_config(
        "sysfs",
        0,
        format!("{} requires Linux", root.display()),
    ))
}
