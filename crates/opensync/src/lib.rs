//! `opensync` - power sequencing and flight-log sync for a UPS-backed flight computer
//!
//! The [`power`] sequencer watches the UPS HAT's input lines and keeps the
//! host-alive heartbeat driven. When power turns critical the
//! [`coordinator`] drains the [`sync`] pipeline and releases the heartbeat,
//! letting the UPS cut power once in-flight uploads are done.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

pub mod cli;
pub mod config;
pub mod coordinator;
pub mod daemon;
pub mod error;
pub mod gpio;
pub mod logging;
pub mod power;
pub mod status;
pub mod storage;
pub mod sync;

pub use config::Config;
pub use error::{Error, Result};
pub use logging::init_logging;
pub use storage::{LedgerStats, Storage};
