//! The host-alive heartbeat line and its ownership.
//!
//! The sequencer owns the line while power is healthy. When the shutdown
//! coordinator starts draining it takes the line over exactly once through
//! [`Heartbeat::hand_off`], and [`CoordinatorHeartbeat::release`] ends the
//! line's life for the rest of the process. Owner check and hardware write
//! happen under the same lock, so two writers can never interleave.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::error::Result;
use crate::gpio::{GpioBank, GpioLine};

/// Electrical state of the heartbeat output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatOutput {
    /// Driven low.
    DrivenLow,
    /// Driven high: "host alive".
    DrivenHigh,
    /// High impedance: "host gone, proceed with power-down".
    Released,
}

/// Who may write the heartbeat line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatOwner {
    /// The power sequencer (normal operation).
    Sequencer,
    /// The shutdown coordinator (draining).
    Coordinator,
    /// Nobody, ever again.
    Released,
}

#[derive(Debug)]
struct Inner {
    owner: HeartbeatOwner,
    output: HeartbeatOutput,
}

/// Shared handle to the heartbeat line.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    bank: Arc<GpioBank>,
    line: GpioLine,
    inner: Arc<Mutex<Inner>>,
}

impl Heartbeat {
    /// Wrap a configured output line. The sequencer starts as owner.
    #[must_use]
    pub fn new(bank: Arc<GpioBank>, line: GpioLine) -> Self {
        Self {
            bank,
            line,
            inner: Arc::new(Mutex::new(Inner {
                owner: HeartbeatOwner::Sequencer,
                output: HeartbeatOutput::DrivenLow,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current owner.
    #[must_use]
    pub fn owner(&self) -> HeartbeatOwner {
        self.lock().owner
    }

    /// Current output state.
    #[must_use]
    pub fn output(&self) -> HeartbeatOutput {
        self.lock().output
    }

    /// Drive the line high on behalf of the sequencer.
    ///
    /// Returns `false` without touching the line once the sequencer no
    /// longer owns it.
    ///
    /// # Errors
    ///
    /// Propagates the write error.
    pub fn drive(&self) -> Result<bool> {
        let mut inner = self.lock();
        if inner.owner != HeartbeatOwner::Sequencer {
            return Ok(false);
        }
        self.bank.write(&self.line, true)?;
        inner.output = HeartbeatOutput::DrivenHigh;
        Ok(true)
    }

    /// Move ownership from the sequencer to the coordinator.
    ///
    /// Succeeds at most once per process; later calls return `None`.
    #[must_use]
    pub fn hand_off(&self) -> Option<CoordinatorHeartbeat> {
        let mut inner = self.lock();
        if inner.owner != HeartbeatOwner::Sequencer {
            return None;
        }
        inner.owner = HeartbeatOwner::Coordinator;
        info!(line = self.line.name, "heartbeat ownership handed to shutdown coordinator");
        Some(CoordinatorHeartbeat {
            heartbeat: self.clone(),
        })
    }
}

/// The coordinator's exclusive grip on the heartbeat line.
///
/// Only one of these can ever exist. Releasing consumes it.
#[derive(Debug)]
pub struct CoordinatorHeartbeat {
    heartbeat: Heartbeat,
}

impl CoordinatorHeartbeat {
    /// Keep the line driven high while draining.
    ///
    /// # Errors
    ///
    /// Propagates the write error.
    pub fn drive(&self) -> Result<()> {
        let hb = &self.heartbeat;
        let mut inner = hb.lock();
        hb.bank.write(&hb.line, true)?;
        inner.output = HeartbeatOutput::DrivenHigh;
        Ok(())
    }

    /// Release the line to high impedance. Irreversible.
    ///
    /// Ownership becomes [`HeartbeatOwner::Released`] even if the facility
    /// reports an error, so nothing writes the line afterwards.
    ///
    /// # Errors
    ///
    /// Propagates the release error.
    pub fn release(self) -> Result<()> {
        let hb = &self.heartbeat;
        let mut inner = hb.lock();
        inner.owner = HeartbeatOwner::Released;
        inner.output = HeartbeatOutput::Released;
        match hb.bank.release(&hb.line) {
            Ok(()) => {
                debug!(line = hb.line.name, "heartbeat released");
                Ok(())
            }
            Err(e) => {
                error!(line = hb.line.name, error = %e, "heartbeat release failed");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpio::{Direction, SimulatedGpio, WriteEvent};

    const LINE: GpioLine = GpioLine::new("host-alive", 18);

    fn heartbeat() -> (Arc<SimulatedGpio>, Heartbeat) {
        let sim = Arc::new(SimulatedGpio::new());
        let bank = Arc::new(GpioBank::new(sim.clone()));
        bank.configure(&LINE, Direction::Out).unwrap();
        (sim, Heartbeat::new(bank, LINE))
    }

    #[test]
    fn test_initial_state() {
        let (_sim, hb) = heartbeat();
        assert_eq!(hb.owner(), HeartbeatOwner::Sequencer);
        assert_eq!(hb.output(), HeartbeatOutput::DrivenLow);
    }

    #[test]
    fn test_sequencer_drives() {
        let (sim, hb) = heartbeat();
        assert!(hb.drive().unwrap());
        assert!(sim.level(18));
        assert_eq!(hb.output(), HeartbeatOutput::DrivenHigh);
    }

    #[test]
    fn test_hand_off_is_one_shot() {
        let (_sim, hb) = heartbeat();
        let token = hb.hand_off();
        assert!(token.is_some());
        assert!(hb.hand_off().is_none());
        assert_eq!(hb.owner(), HeartbeatOwner::Coordinator);
    }

    #[test]
    fn test_sequencer_stops_after_hand_off() {
        let (sim, hb) = heartbeat();
        hb.drive().unwrap();
        let token = hb.hand_off().unwrap();
        let writes = sim.value_writes(18);

        assert!(!hb.drive().unwrap());
        assert_eq!(sim.value_writes(18), writes);

        token.drive().unwrap();
        assert_eq!(sim.value_writes(18), writes + 1);
    }

    #[test]
    fn test_release_is_terminal() {
        let (sim, hb) = heartbeat();
        hb.drive().unwrap();
        hb.hand_off().unwrap().release().unwrap();

        assert_eq!(hb.owner(), HeartbeatOwner::Released);
        assert_eq!(hb.output(), HeartbeatOutput::Released);
        assert!(!sim.is_driven(18));
        assert!(hb.hand_off().is_none());
        assert!(!hb.drive().unwrap());

        let last = *sim.writes().last().unwrap();
        assert_eq!(last, WriteEvent::Unexport { pin: 18 });
    }

    #[test]
    fn test_clones_share_ownership() {
        let (_sim, hb) = heartbeat();
        let other = hb.clone();
        let _token = hb.hand_off().unwrap();
        assert_eq!(other.owner(), HeartbeatOwner::Coordinator);
        assert!(other.hand_off().is_none());
    }
}
