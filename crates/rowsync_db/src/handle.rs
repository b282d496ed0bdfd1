//! Reference-counted database handles for embedder threads.
//!
//! The watcher's own connection stays bound to the engine task; code on
//! other threads acquires a [`DatabaseRef`], which opens its own
//! connection to the same file and registers itself with the shared
//! counter. The handle releases on drop, so it is scoped to wherever the
//! borrowing code keeps it.

use crate::error::DbResult;
use rusqlite::Connection;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Hands out reference-counted connections to one database file.
#[derive(Debug, Clone)]
pub struct SharedDatabase {
    path: PathBuf,
    refs: Arc<AtomicUsize>,
}

impl SharedDatabase {
    /// Creates a sharing point for the database at `path`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            refs: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// The shared database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Opens a new handle. Each handle has its own connection; SQLite
    /// serializes writers between them.
    pub fn acquire(&self) -> DbResult<DatabaseRef> {
        let conn = Connection::open(&self.path)?;
        self.refs.fetch_add(1, Ordering::SeqCst);
        debug!(path = %self.path.display(), refs = self.active_refs(), "database handle acquired");
        Ok(DatabaseRef {
            conn,
            refs: Arc::clone(&self.refs),
        })
    }

    /// Number of handles currently alive.
    pub fn active_refs(&self) -> usize {
        self.refs.load(Ordering::SeqCst)
    }
}

/// A borrowed, reference-counted database connection.
///
/// Dereferences to [`rusqlite::Connection`]; the count drops when the
/// handle does.
pub struct DatabaseRef {
    conn: Connection,
    refs: Arc<AtomicUsize>,
}

impl Deref for DatabaseRef {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl Drop for DatabaseRef {
    fn drop(&mut self) {
        self.refs.fetch_sub(1, Ordering::SeqCst);
        debug!("database handle released");
    }
}
