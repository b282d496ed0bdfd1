//! # Rowsync DB
//!
//! Local database instrumentation for rowsync.
//!
//! This crate provides:
//! - `DatabaseWatcher`: trigger-based change tracking on user tables
//! - The event log and its cursor
//! - Reference-counted database handles for embedder threads
//!
//! The watcher owns one `rusqlite::Connection`; everything it does happens
//! in bounded transactions on that connection.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod event_log;
mod handle;
mod watcher;

pub use error::{DbResult, WatcherError};
pub use event_log::{EventCursor, EventEntry};
pub use handle::{DatabaseRef, SharedDatabase};
pub use watcher::{ChangeState, DatabaseWatcher, TableState, META_TABLE, TABLE_PREFIX};
