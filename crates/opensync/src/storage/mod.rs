//! Transfer ledger.
//!
//! `SQLite` record of every flight log that made it across the uplink, so a
//! log is sent once even though it stays on the storage card for weeks.

pub mod schema;

use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::sync::FlightNote;

/// One sent flight log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    /// Row id.
    pub id: i64,
    /// Base name of the log file.
    pub file_name: String,
    /// Departure airport.
    pub origin: String,
    /// Payload size in bytes.
    pub size_bytes: u64,
    /// BLAKE3 hash of the payload.
    pub content_hash: String,
    /// When the relay first picked the file up.
    pub discovered_at: DateTime<Utc>,
    /// When the uplink accepted it.
    pub sent_at: DateTime<Utc>,
}

/// Ledger statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerStats {
    /// Number of sent logs.
    pub total_transfers: i64,
    /// Sum of payload sizes.
    pub total_bytes: u64,
    /// Oldest send time.
    pub oldest_sent: Option<DateTime<Utc>>,
    /// Newest send time.
    pub newest_sent: Option<DateTime<Utc>>,
    /// Size of the database file.
    pub db_size_bytes: u64,
}

/// The ledger database.
#[derive(Debug)]
pub struct Storage {
    path: PathBuf,
    conn: Connection,
}

const SELECT_COLUMNS: &str =
    "SELECT id, file_name, origin, size_bytes, content_hash, discovered_at, sent_at FROM transfers";

impl Storage {
    /// Open or create the ledger at `path`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or schema initialization fails.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|source| Error::DirectoryCreate {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        debug!("Opening ledger at {}", path.display());
        let conn = Connection::open(&path).map_err(|source| Error::DatabaseOpen {
            path: path.clone(),
            source,
        })?;

        // A power cut must never leave a half-written ledger.
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")?;
        schema::initialize(&conn)?;

        info!("Ledger opened at {}", path.display());
        Ok(Self { path, conn })
    }

    /// Create an in-memory ledger.
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory database cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|source| Error::DatabaseOpen {
            path: PathBuf::from(":memory:"),
            source,
        })?;
        schema::initialize(&conn)?;
        Ok(Self {
            path: PathBuf::from(":memory:"),
            conn,
        })
    }

    /// Path to the database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if a log with this file name has been sent.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn is_sent(&self, file_name: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM transfers WHERE file_name = ?1",
            [file_name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Record a log as sent. A re-send replaces the earlier record.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn mark_sent(&self, note: &FlightNote) -> Result<i64> {
        let size = i64::try_from(note.size_bytes).unwrap_or(i64::MAX);
        self.conn.execute(
            r"
            INSERT INTO transfers (file_name, origin, size_bytes, content_hash, discovered_at, sent_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(file_name) DO UPDATE SET
                origin = excluded.origin,
                size_bytes = excluded.size_bytes,
                content_hash = excluded.content_hash,
                discovered_at = excluded.discovered_at,
                sent_at = excluded.sent_at
            ",
            params![
                note.file_name,
                note.origin,
                size,
                note.content_hash,
                format_timestamp(note.discovered_at),
                format_timestamp(Utc::now()),
            ],
        )?;

        let id = self.conn.query_row(
            "SELECT id FROM transfers WHERE file_name = ?1",
            [&note.file_name],
            |row| row.get(0),
        )?;
        debug!(id, file = %note.file_name, "transfer recorded");
        Ok(id)
    }

    /// Look up the record for a file name.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn get(&self, file_name: &str) -> Result<Option<TransferRecord>> {
        let record = self
            .conn
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE file_name = ?1"),
                [file_name],
                Self::row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Most recent transfers, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn recent(&self, limit: usize) -> Result<Vec<TransferRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{SELECT_COLUMNS} ORDER BY sent_at DESC, id DESC LIMIT ?1"))?;
        let limit_i64 = i64::try_from(limit).unwrap_or(i64::MAX);
        let records = stmt
            .query_map([limit_i64], Self::row_to_record)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Number of sent logs.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn count(&self) -> Result<i64> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM transfers", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Ledger statistics.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn stats(&self) -> Result<LedgerStats> {
        let (total_transfers, total_bytes, oldest, newest): (
            i64,
            i64,
            Option<String>,
            Option<String>,
        ) = self.conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(size_bytes), 0), MIN(sent_at), MAX(sent_at) FROM transfers",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;

        let db_size_bytes = if self.path.to_string_lossy() == ":memory:" {
            0
        } else {
            std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
        };

        Ok(LedgerStats {
            total_transfers,
            total_bytes: u64::try_from(total_bytes).unwrap_or(0),
            oldest_sent: oldest.as_deref().and_then(parse_timestamp),
            newest_sent: newest.as_deref().and_then(parse_timestamp),
            db_size_bytes,
        })
    }

    fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<TransferRecord> {
        let size: i64 = row.get(3)?;
        let discovered_at: String = row.get(5)?;
        let sent_at: String = row.get(6)?;
        Ok(TransferRecord {
            id: row.get(0)?,
            file_name: row.get(1)?,
            origin: row.get(2)?,
            size_bytes: u64::try_from(size).unwrap_or(0),
            content_hash: row.get(4)?,
            discovered_at: parse_timestamp(&discovered_at).unwrap_or_default(),
            sent_at: parse_timestamp(&sent_at).unwrap_or_default(),
        })
    }
}

// Fixed precision keeps the text columns sortable.
fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(name: &str, payload: &[u8]) -> FlightNote {
        FlightNote::new(name, "KBED", payload)
    }

    #[test]
    fn test_open_in_memory() {
        let storage = Storage::open_in_memory().unwrap();
        assert_eq!(storage.count().unwrap(), 0);
        assert_eq!(storage.path(), Path::new(":memory:"));
    }

    #[test]
    fn test_mark_and_check_sent() {
        let storage = Storage::open_in_memory().unwrap();
        assert!(!storage.is_sent("log_1_2_KBED.csv").unwrap());

        storage.mark_sent(&note("log_1_2_KBED.csv", b"abc")).unwrap();
        assert!(storage.is_sent("log_1_2_KBED.csv").unwrap());
        assert!(!storage.is_sent("log_1_3_KBED.csv").unwrap());
    }

    #[test]
    fn test_get_record() {
        let storage = Storage::open_in_memory().unwrap();
        let n = note("log_1_2_KBED.csv", b"abc");
        let id = storage.mark_sent(&n).unwrap();

        let record = storage.get("log_1_2_KBED.csv").unwrap().unwrap();
        assert_eq!(record.id, id);
        assert_eq!(record.origin, "KBED");
        assert_eq!(record.size_bytes, 3);
        assert_eq!(record.content_hash, n.content_hash);
        assert!(storage.get("missing.csv").unwrap().is_none());
    }

    #[test]
    fn test_resend_replaces_record() {
        let storage = Storage::open_in_memory().unwrap();
        let first = storage.mark_sent(&note("log_1_2_KBED.csv", b"abc")).unwrap();
        let second = storage.mark_sent(&note("log_1_2_KBED.csv", b"abcdef")).unwrap();

        assert_eq!(first, second);
        assert_eq!(storage.count().unwrap(), 1);
        assert_eq!(storage.get("log_1_2_KBED.csv").unwrap().unwrap().size_bytes, 6);
    }

    #[test]
    fn test_recent_newest_first() {
        let storage = Storage::open_in_memory().unwrap();
        for i in 0..5 {
            storage.mark_sent(&note(&format!("log_1_{i}_KBED.csv"), b"x")).unwrap();
        }

        let recent = storage.recent(3).unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].file_name, "log_1_4_KBED.csv");
    }

    #[test]
    fn test_stats() {
        let storage = Storage::open_in_memory().unwrap();
        let empty = storage.stats().unwrap();
        assert_eq!(empty.total_transfers, 0);
        assert_eq!(empty.total_bytes, 0);
        assert!(empty.oldest_sent.is_none());

        storage.mark_sent(&note("log_1_1_KBED.csv", b"abc")).unwrap();
        storage.mark_sent(&note("log_1_2_KBOS.csv", b"de")).unwrap();
        let stats = storage.stats().unwrap();
        assert_eq!(stats.total_transfers, 2);
        assert_eq!(stats.total_bytes, 5);
        assert!(stats.oldest_sent.is_some());
        assert!(stats.newest_sent >= stats.oldest_sent);
    }

    #[test]
    fn test_open_file_persists() {
        let dir = std::env::temp_dir().join(format!("opensync-ledger-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let path = dir.join("nested").join("ledger.db");

        {
            let storage = Storage::open(&path).unwrap();
            storage.mark_sent(&note("log_1_2_KBED.csv", b"abc")).unwrap();
        }
        let storage = Storage::open(&path).unwrap();
        assert!(storage.is_sent("log_1_2_KBED.csv").unwrap());
        assert!(storage.stats().unwrap().db_size_bytes > 0);

        drop(storage);
        std::fs::remove_dir_all(dir).unwrap();
    }
}
