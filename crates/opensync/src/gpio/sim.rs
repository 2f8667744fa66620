//! In-memory GPIO facility.
//!
//! Used off-target (development machines, CI) and by tests. Input levels are
//! injected by the caller; every hardware-affecting operation is appended to
//! a write log so tests can prove what was, and was not, driven.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{Direction, GpioFacility};

/// One hardware-affecting operation performed on the simulated facility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteEvent {
    /// A pin was exported.
    Export {
        /// Pin number.
        pin: u32,
    },
    /// A pin's direction was set.
    Direction {
        /// Pin number.
        pin: u32,
        /// New direction.
        direction: Direction,
    },
    /// An output value was driven.
    Value {
        /// Pin number.
        pin: u32,
        /// Driven level.
        high: bool,
    },
    /// A pin was unexported.
    Unexport {
        /// Pin number.
        pin: u32,
    },
}

#[derive(Debug, Clone, Copy)]
struct SimPin {
    exported: bool,
    direction: Direction,
    level: bool,
}

impl Default for SimPin {
    fn default() -> Self {
        Self {
            exported: false,
            direction: Direction::In,
            level: false,
        }
    }
}

#[derive(Debug, Default)]
struct SimState {
    pins: HashMap<u32, SimPin>,
    writes: Vec<WriteEvent>,
    read_failures: HashMap<u32, u32>,
    unexport_failures: HashSet<u32>,
}

/// Simulated GPIO facility.
#[derive(Debug)]
pub struct SimulatedGpio {
    state: Mutex<SimState>,
    available: bool,
}

impl Default for SimulatedGpio {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedGpio {
    /// Create a facility with every pin unexported and low.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState::default()),
            available: true,
        }
    }

    /// Create a facility that refuses every export, like a host without GPIO support.
    #[must_use]
    pub fn unavailable() -> Self {
        Self {
            state: Mutex::new(SimState::default()),
            available: false,
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set the externally applied level of an input pin.
    pub fn set_input(&self, pin: u32, high: bool) {
        self.state().pins.entry(pin).or_default().level = high;
    }

    /// Flip the externally applied level of an input pin, returning the new level.
    pub fn toggle_input(&self, pin: u32) -> bool {
        let mut state = self.state();
        let sim_pin = state.pins.entry(pin).or_default();
        sim_pin.level = !sim_pin.level;
        sim_pin.level
    }

    /// Make the next `count` reads of `pin` fail with an I/O error.
    pub fn fail_next_reads(&self, pin: u32, count: u32) {
        self.state().read_failures.insert(pin, count);
    }

    /// Make the next unexport of `pin` fail with an I/O error.
    pub fn fail_next_unexport(&self, pin: u32) {
        self.state().unexport_failures.insert(pin);
    }

    /// Current level of a pin (driven or applied).
    #[must_use]
    pub fn level(&self, pin: u32) -> bool {
        self.state().pins.get(&pin).is_some_and(|p| p.level)
    }

    /// Whether the host is currently driving the pin.
    #[must_use]
    pub fn is_driven(&self, pin: u32) -> bool {
        self.state()
            .pins
            .get(&pin)
            .is_some_and(|p| p.exported && p.direction == Direction::Out)
    }

    /// Every hardware-affecting operation so far, oldest first.
    #[must_use]
    pub fn writes(&self) -> Vec<WriteEvent> {
        self.state().writes.clone()
    }

    /// Number of value writes to `pin`.
    #[must_use]
    pub fn value_writes(&self, pin: u32) -> usize {
        self.state()
            .writes
            .iter()
            .filter(|w| matches!(w, WriteEvent::Value { pin: p, .. } if *p == pin))
            .count()
    }

    /// Number of times `pin` has been exported.
    #[must_use]
    pub fn exports(&self, pin: u32) -> usize {
        self.state()
            .writes
            .iter()
            .filter(|w| matches!(w, WriteEvent::Export { pin: p } if *p == pin))
            .count()
    }

    fn not_exported(pin: u32) -> io::Error {
        io::Error::new(io::ErrorKind::NotFound, format!("gpio{pin} is not exported"))
    }
}

impl GpioFacility for SimulatedGpio {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn is_exported(&self, pin: u32) -> io::Result<bool> {
        Ok(self.state().pins.get(&pin).is_some_and(|p| p.exported))
    }

    fn export(&self, pin: u32) -> io::Result<()> {
        if !self.available {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "GPIO facility unavailable",
            ));
        }
        let mut state = self.state();
        let sim_pin = state.pins.entry(pin).or_default();
        sim_pin.exported = true;
        sim_pin.direction = Direction::In;
        state.writes.push(WriteEvent::Export { pin });
        Ok(())
    }

    fn direction(&self, pin: u32) -> io::Result<Direction> {
        self.state()
            .pins
            .get(&pin)
            .filter(|p| p.exported)
            .map(|p| p.direction)
            .ok_or_else(|| Self::not_exported(pin))
    }

    fn set_direction(&self, pin: u32, direction: Direction) -> io::Result<()> {
        let mut state = self.state();
        let sim_pin = state
            .pins
            .get_mut(&pin)
            .filter(|p| p.exported)
            .ok_or_else(|| Self::not_exported(pin))?;
        sim_pin.direction = direction;
        if direction == Direction::Out {
            // sysfs drives a freshly switched output low.
            sim_pin.level = false;
        }
        state.writes.push(WriteEvent::Direction { pin, direction });
        Ok(())
    }

    fn read_value(&self, pin: u32) -> io::Result<bool> {
        let mut state = self.state();
        if let Some(remaining) = state.read_failures.get_mut(&pin) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(io::Error::new(
                    io::ErrorKind::Interrupted,
                    format!("simulated read failure on gpio{pin}"),
                ));
            }
        }
        state
            .pins
            .get(&pin)
            .filter(|p| p.exported)
            .map(|p| p.level)
            .ok_or_else(|| Self::not_exported(pin))
    }

    fn write_value(&self, pin: u32, high: bool) -> io::Result<()> {
        let mut state = self.state();
        let sim_pin = state
            .pins
            .get_mut(&pin)
            .filter(|p| p.exported && p.direction == Direction::Out)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    format!("gpio{pin} is not an exported output"),
                )
            })?;
        sim_pin.level = high;
        state.writes.push(WriteEvent::Value { pin, high });
        Ok(())
    }

    fn unexport(&self, pin: u32) -> io::Result<()> {
        let mut state = self.state();
        if state.unexport_failures.remove(&pin) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("simulated unexport failure on gpio{pin}"),
            ));
        }
        let sim_pin = state
            .pins
            .get_mut(&pin)
            .filter(|p| p.exported)
            .ok_or_else(|| Self::not_exported(pin))?;
        sim_pin.exported = false;
        state.writes.push(WriteEvent::Unexport { pin });
        Ok(())
    }
}
