//! Error taxonomy and routing.

use rowsync_db::WatcherError;
use rowsync_protocol::{ObjectKey, ProtocolError};
use thiserror::Error;

/// Result type for engine operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Category of an error as surfaced to the embedder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    /// Transient; the engine retries on its own.
    Temporary,
    /// Connection or protocol failure; the connector reconnects.
    Network,
    /// A single record could not be processed.
    Entry,
    /// A table stopped synchronizing.
    Table,
    /// A database-wide failure.
    Database,
    /// A transaction failed and was rolled back.
    Transaction,
    /// Record encryption or decryption failed.
    Transform,
    /// Authenticator, keystore, or other environment failure.
    System,
}

/// Errors that can occur during synchronization.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Socket or protocol-peer failure.
    #[error("network error: {0}")]
    Network(String),

    /// Local database failure.
    #[error(transparent)]
    Database(#[from] WatcherError),

    /// Wire data could not be encoded or decoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Record transformation failed; the key is marked Corrupted.
    #[error("transform failed for {key}: {message}")]
    Transform {
        /// The offending record.
        key: ObjectKey,
        /// What went wrong.
        message: String,
    },

    /// Authenticator failure; fatal for the engine.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// An operation was requested in a state that cannot serve it.
    #[error("cannot {operation} while {state}")]
    InvalidState {
        /// The requested operation.
        operation: &'static str,
        /// The engine state it was requested in.
        state: String,
    },

    /// A setup name was registered twice.
    #[error("setup {name} is already registered")]
    DuplicateSetup {
        /// The colliding name.
        name: String,
    },
}

impl SyncError {
    /// Routes this error to the category the embedder sees.
    pub fn error_type(&self) -> ErrorType {
        match self {
            SyncError::Network(_) => ErrorType::Network,
            SyncError::Database(e) => {
                if e.table().is_some() {
                    ErrorType::Table
                } else {
                    ErrorType::Database
                }
            }
            SyncError::Protocol(_) => ErrorType::Network,
            SyncError::Transform { .. } => ErrorType::Transform,
            SyncError::Auth(_) => ErrorType::System,
            SyncError::InvalidState { .. } => ErrorType::Temporary,
            SyncError::DuplicateSetup { .. } => ErrorType::System,
        }
    }

    /// True if the engine must enter its Error state rather than retry.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Auth(_))
    }
}

/// One error occurrence as delivered to the embedder's error handler.
#[derive(Debug, Clone)]
pub struct ErrorEvent {
    /// The routed category.
    pub error_type: ErrorType,
    /// Human-readable message.
    pub message: String,
    /// The affected table or key, when one is known.
    pub context: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watcher_errors_route_by_table_presence() {
        let with_table = SyncError::Database(WatcherError::TableCorrupted {
            table: "notes".into(),
        });
        assert_eq!(with_table.error_type(), ErrorType::Table);

        let no_table =
            SyncError::Database(WatcherError::Sqlite(rusqlite_error()));
        assert_eq!(no_table.error_type(), ErrorType::Database);
    }

    fn rusqlite_error() -> rusqlite::Error {
        rusqlite::Error::InvalidQuery
    }

    #[test]
    fn auth_errors_are_fatal_system_errors() {
        let err = SyncError::Auth("token expired".into());
        assert_eq!(err.error_type(), ErrorType::System);
        assert!(err.is_fatal());
    }

    #[test]
    fn network_errors_are_not_fatal() {
        let err = SyncError::Network("connection reset".into());
        assert_eq!(err.error_type(), ErrorType::Network);
        assert!(!err.is_fatal());
    }
}
