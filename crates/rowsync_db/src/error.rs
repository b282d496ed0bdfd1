//! Error types for the database crate.

use thiserror::Error;

/// Result type for watcher operations.
pub type DbResult<T> = Result<T, WatcherError>;

/// Errors that can occur while watching or mutating the local database.
#[derive(Error, Debug)]
pub enum WatcherError {
    /// A SQL statement failed outside any table context.
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A SQL statement failed while operating on a specific table.
    /// The table's meta row has been flipped to Corrupted.
    #[error("database error on table {table}: {source}")]
    Database {
        /// The affected table.
        table: String,
        /// The underlying SQL error.
        source: rusqlite::Error,
    },

    /// The table's meta row is marked Corrupted; it will not sync until
    /// re-added after operator attention.
    #[error("table {table} is corrupted")]
    TableCorrupted {
        /// The affected table.
        table: String,
    },

    /// The table has no columns besides its primary key.
    #[error("table {table} has no columns to synchronize")]
    TableEmpty {
        /// The affected table.
        table: String,
    },

    /// The table name collides with the watcher's private prefix.
    #[error("table name {table} is reserved")]
    ReservedName {
        /// The offending name.
        table: String,
    },

    /// The table is not known to the watcher.
    #[error("table {table} is not synchronized")]
    UnknownTable {
        /// The requested table.
        table: String,
    },

    /// The table's primary key cannot be used for synchronization.
    #[error("unusable primary key on table {table}: {reason}")]
    UnsupportedPrimaryKey {
        /// The affected table.
        table: String,
        /// Why the key is unusable.
        reason: String,
    },

    /// Malformed persisted data (timestamps, cursors).
    #[error(transparent)]
    Protocol(#[from] rowsync_protocol::ProtocolError),
}

impl WatcherError {
    /// The table this error concerns, when one is known.
    pub fn table(&self) -> Option<&str> {
        match self {
            WatcherError::Database { table, .. }
            | WatcherError::TableCorrupted { table }
            | WatcherError::TableEmpty { table }
            | WatcherError::ReservedName { table }
            | WatcherError::UnknownTable { table }
            | WatcherError::UnsupportedPrimaryKey { table, .. } => Some(table),
            _ => None,
        }
    }
}
