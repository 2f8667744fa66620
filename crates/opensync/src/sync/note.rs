//! Flight log notes.
//!
//! The avionics unit names its logs `log_<date>_<time>_<origin>.csv`. A
//! note carries the metadata of one log across the uplink.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Origin used when the file name carries none.
pub const UNKNOWN_ORIGIN: &str = "UNK";

/// Matches flight log file names and extracts the origin airport.
#[derive(Debug, Clone)]
pub struct LogNamePattern {
    regex: Regex,
}

impl LogNamePattern {
    /// Compile a file name pattern. The first capture group is the origin.
    ///
    /// The pattern must match the whole file name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigValidation`] if the pattern is not a valid
    /// regex or has no capture group.
    pub fn new(pattern: &str) -> Result<Self> {
        let regex = Regex::new(&format!("^(?:{pattern})$")).map_err(|e| Error::ConfigValidation {
            message: format!("invalid sync.file_pattern: {e}"),
        })?;
        if regex.captures_len() < 2 {
            return Err(Error::ConfigValidation {
                message: "sync.file_pattern needs a capture group for the origin".to_string(),
            });
        }
        Ok(Self { regex })
    }

    /// Check if a file name is a flight log.
    #[must_use]
    pub fn matches(&self, file_name: &str) -> bool {
        self.regex.is_match(file_name)
    }

    /// The origin encoded in a flight log name, or `None` if the name does not match.
    #[must_use]
    pub fn origin(&self, file_name: &str) -> Option<String> {
        let caps = self.regex.captures(file_name)?;
        let origin = caps
            .get(1)
            .map(|m| m.as_str())
            .filter(|s| !s.is_empty())
            .unwrap_or(UNKNOWN_ORIGIN);
        Some(origin.to_string())
    }
}

/// Metadata sent with a flight log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlightNote {
    /// Base name of the log file.
    pub file_name: String,

    /// Departure airport parsed from the file name.
    pub origin: String,

    /// Payload size in bytes.
    pub size_bytes: u64,

    /// BLAKE3 hash of the payload.
    pub content_hash: String,

    /// When the relay first picked the file up.
    pub discovered_at: DateTime<Utc>,
}

impl FlightNote {
    /// Build the note for a payload.
    #[must_use]
    pub fn new(file_name: impl Into<String>, origin: impl Into<String>, payload: &[u8]) -> Self {
        Self {
            file_name: file_name.into(),
            origin: origin.into(),
            size_bytes: payload.len() as u64,
            content_hash: Self::compute_hash(payload),
            discovered_at: Utc::now(),
        }
    }

    /// Compute the BLAKE3 hash of a payload.
    #[must_use]
    pub fn compute_hash(payload: &[u8]) -> String {
        blake3::hash(payload).to_hex().to_string()
    }

    /// Short hash prefix for log lines.
    #[must_use]
    pub fn short_hash(&self) -> &str {
        self.content_hash.get(..12).unwrap_or(&self.content_hash)
    }
}
