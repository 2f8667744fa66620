//! Delivery of flight logs to the notecard bridge.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::FlightNote;
use crate::error::{Error, Result};

/// Destination for flight logs.
///
/// `send` returns only once the note and payload are durable on the other
/// side; the pipeline records the transfer in the ledger right after.
#[async_trait]
pub trait Uplink: Send + Sync + std::fmt::Debug {
    /// Deliver one flight log.
    async fn send(&self, note: &FlightNote, payload: &[u8]) -> Result<()>;
}

/// Spools notes into an outbox directory for the notecard bridge.
///
/// The payload lands as `<file_name>` and the note as `<file_name>.json`.
/// The note is written last, so its presence means the payload is complete.
#[derive(Debug, Clone)]
pub struct SpoolUplink {
    outbox: PathBuf,
}

impl SpoolUplink {
    /// Use `outbox`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DirectoryCreate`] if the directory cannot be created.
    pub fn new(outbox: impl Into<PathBuf>) -> Result<Self> {
        let outbox = outbox.into();
        std::fs::create_dir_all(&outbox).map_err(|source| Error::DirectoryCreate {
            path: outbox.clone(),
            source,
        })?;
        Ok(Self { outbox })
    }

    /// The outbox directory.
    #[must_use]
    pub fn outbox(&self) -> &Path {
        &self.outbox
    }

    async fn write_atomic(&self, name: &str, bytes: &[u8]) -> std::io::Result<()> {
        let tmp = self.outbox.join(format!(".{name}.tmp"));
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, self.outbox.join(name)).await
    }
}

#[async_trait]
impl Uplink for SpoolUplink {
    async fn send(&self, note: &FlightNote, payload: &[u8]) -> Result<()> {
        let body = serde_json::to_vec_pretty(note)?;
        self.write_atomic(&note.file_name, payload)
            .await
            .map_err(|e| Error::uplink(&note.file_name, e.to_string()))?;
        self.write_atomic(&format!("{}.json", note.file_name), &body)
            .await
            .map_err(|e| Error::uplink(&note.file_name, e.to_string()))?;
        debug!(file = %note.file_name, outbox = %self.outbox.display(), "note spooled");
        Ok(())
    }
}
