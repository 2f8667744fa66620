//! Error types for opensync.
//!
//! This module defines all error types used throughout the opensync crate.
//! GPIO errors are split by how the caller must react: configuration errors
//! are fatal at startup, direction errors are programming errors, and I/O
//! errors on an already-configured line are transient.

use std::path::PathBuf;
use thiserror::Error;

use crate::gpio::Direction;

/// The main error type for opensync operations.
#[derive(Error, Debug)]
pub enum Error {
    // === GPIO Errors ===
    /// A line could not be exported or direction-configured.
    #[error("failed to configure GPIO line '{line}' (pin {pin}): {message}")]
    GpioConfig {
        /// Logical name of the line.
        line: String,
        /// Platform pin number.
        pin: u32,
        /// Description of what went wrong.
        message: String,
    },

    /// A line was accessed against its configured direction.
    #[error("GPIO line '{line}' is configured as {actual}, cannot be used as {requested}")]
    Direction {
        /// Logical name of the line.
        line: String,
        /// The direction the line is configured with.
        actual: Direction,
        /// The direction the operation needs.
        requested: Direction,
    },

    /// A line was read or written before being configured, or after release.
    #[error("GPIO line '{line}' is not configured")]
    LineNotConfigured {
        /// Logical name of the line.
        line: String,
    },

    /// A read or write on a configured line failed.
    #[error("I/O error on GPIO line '{line}': {source}")]
    GpioIo {
        /// Logical name of the line.
        line: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    // === Storage Errors ===
    /// Failed to open or create the ledger database.
    #[error("failed to open database at {path}: {source}")]
    DatabaseOpen {
        /// Path to the database file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: rusqlite::Error,
    },

    /// A database query failed.
    #[error("database query failed: {0}")]
    DatabaseQuery(#[from] rusqlite::Error),

    /// The ledger schema version is unusable.
    #[error("database migration failed: {message}")]
    DatabaseMigration {
        /// Description of what went wrong.
        message: String,
    },

    // === Configuration Errors ===
    /// Failed to load configuration.
    #[error("failed to load configuration: {0}")]
    ConfigLoad(Box<figment::Error>),

    /// Configuration validation failed.
    #[error("invalid configuration: {message}")]
    ConfigValidation {
        /// Description of the validation failure.
        message: String,
    },

    // === Sync Errors ===
    /// The uplink refused or failed to accept a note.
    #[error("uplink failed for '{file_name}': {message}")]
    Uplink {
        /// The flight log being sent.
        file_name: String,
        /// Description of what went wrong.
        message: String,
    },

    // === I/O Errors ===
    /// File system operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to create a required directory.
    #[error("failed to create directory {path}: {source}")]
    DirectoryCreate {
        /// Path that couldn't be created.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    // === Serialization Errors ===
    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Generic Errors ===
    /// An operation timed out.
    #[error("operation timed out: {operation}")]
    Timeout {
        /// Description of the operation that timed out.
        operation: String,
    },

    /// An internal error occurred (bug).
    #[error("internal error: {0}")]
    Internal(String),
}

/// A specialized Result type for opensync operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::ConfigLoad(Box::new(err))
    }
}

impl Error {
    /// Create a new GPIO configuration error.
    #[must_use]
    pub fn gpio_config(line: impl Into<String>, pin: u32, message: impl Into<String>) -> Self {
        Self::GpioConfig {
            line: line.into(),
            pin,
            message: message.into(),
        }
    }

    /// Create a new GPIO I/O error.
    #[must_use]
    pub fn gpio_io(line: impl Into<String>, source: std::io::Error) -> Self {
        Self::GpioIo {
            line: line.into(),
            source,
        }
    }

    /// Create a new uplink error.
    #[must_use]
    pub fn uplink(file_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Uplink {
            file_name: file_name.into(),
            message: message.into(),
        }
    }

    /// Create a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Check if this error may clear up on the next poll tick.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::GpioIo { .. })
    }

    /// Check if this error means the process cannot safely keep running.
    ///
    /// Wrong-direction access and use of an unconfigured line are programming
    /// errors; configuration errors leave the power state unknown.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::GpioConfig { .. } | Self::Direction { .. } | Self::LineNotConfigured { .. }
        )
    }
}
