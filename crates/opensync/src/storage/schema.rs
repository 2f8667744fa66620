//! `SQLite` schema for the transfer ledger.

use rusqlite::{Connection, OptionalExtension};

use crate::error::{Error, Result};

/// Schema version written by this build.
pub const SCHEMA_VERSION: u32 = 1;

const VERSION_KEY: &str = "schema_version";

/// SQL statement to create the transfers table.
pub const CREATE_TRANSFERS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS transfers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    file_name TEXT NOT NULL UNIQUE,
    origin TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    content_hash TEXT NOT NULL,
    discovered_at TEXT NOT NULL,
    sent_at TEXT NOT NULL
)
";

/// Index on `sent_at` for listing recent transfers.
pub const CREATE_SENT_AT_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_transfers_sent_at ON transfers(sent_at DESC)
";

/// Index on `content_hash`.
pub const CREATE_HASH_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_transfers_hash ON transfers(content_hash)
";

/// SQL statement to create the metadata table for storing key-value pairs.
pub const CREATE_METADATA_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
";

/// All schema creation statements in order.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    CREATE_TRANSFERS_TABLE,
    CREATE_SENT_AT_INDEX,
    CREATE_HASH_INDEX,
    CREATE_METADATA_TABLE,
];

/// Create the tables if needed and stamp the schema version.
///
/// A ledger written by a newer build is refused.
///
/// # Errors
///
/// Returns [`Error::DatabaseMigration`] for a newer or unreadable version,
/// and database errors from table creation.
pub fn initialize(conn: &Connection) -> Result<()> {
    for statement in SCHEMA_STATEMENTS {
        conn.execute(statement, [])?;
    }

    let stored: Option<String> = conn
        .query_row(
            "SELECT value FROM metadata WHERE key = ?1",
            [VERSION_KEY],
            |row| row.get(0),
        )
        .optional()?;

    match stored {
        None => {
            conn.execute(
                "INSERT INTO metadata (key, value) VALUES (?1, ?2)",
                (VERSION_KEY, SCHEMA_VERSION.to_string()),
            )?;
            Ok(())
        }
        Some(raw) => match raw.parse::<u32>() {
            Ok(version) if version <= SCHEMA_VERSION => Ok(()),
            Ok(version) => Err(Error::DatabaseMigration {
                message: format!(
                    "ledger schema version {version} is newer than supported version {SCHEMA_VERSION}"
                ),
            }),
            Err(_) => Err(Error::DatabaseMigration {
                message: format!("invalid ledger schema version: {raw}"),
            }),
        },
    }
}
