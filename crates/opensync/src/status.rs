//! Operator status file.
//!
//! The daemon keeps a small JSON document up to date so `opensync status`
//! (and anyone with `cat`) can see what the power sequencer is doing.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::coordinator::{CoordinatorPhase, ReleaseReport};
use crate::error::{Error, Result};
use crate::power::{HeartbeatOutput, HeartbeatOwner, PowerStatus, UpsProbe};

/// Snapshot of the daemon's state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Daemon process id.
    pub pid: u32,
    /// GPIO backend in use.
    pub backend: String,
    /// Confirmed power status.
    pub power: PowerStatus,
    /// Shutdown coordinator phase.
    pub phase: CoordinatorPhase,
    /// Heartbeat output state.
    pub heartbeat: HeartbeatOutput,
    /// Heartbeat owner.
    pub heartbeat_owner: HeartbeatOwner,
    /// Result of the startup UPS probe, if it ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ups: Option<UpsProbe>,
    /// Transfers currently in flight.
    pub in_flight: usize,
    /// Release details once the heartbeat has been released.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release: Option<ReleaseReport>,
    /// When this snapshot was taken.
    pub updated_at: DateTime<Utc>,
}

impl StatusReport {
    /// Write the report to `path` atomically (temp file, then rename).
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the file
    /// cannot be written.
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| Error::DirectoryCreate {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        let json = serde_json::to_vec_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Read a report written by [`StatusReport::write`].
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or not a status report.
    pub fn read(path: &Path) -> Result<Self> {
        let json = std::fs::read(path)?;
        Ok(serde_json::from_slice(&json)?)
    }

    /// One-line human summary.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut line = format!(
            "power {} | coordinator {} | heartbeat {:?} ({:?}) | {} in flight",
            self.power, self.phase, self.heartbeat, self.heartbeat_owner, self.in_flight
        );
        if let Some(release) = &self.release {
            line.push_str(&format!(
                " | released after {} ms, drain {}",
                release.elapsed_ms, release.outcome
            ));
            if let Some(error) = &release.release_error {
                line.push_str(&format!(" | release error: {error}"));
            }
        }
        line
    }
}
