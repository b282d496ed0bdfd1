//! Optional change journal and its cursor.
//!
//! When active, every committed download is appended to the `EventLog`
//! table. Embedders walk the log with an [`EventCursor`], which can be
//! persisted across runs via [`EventCursor::save`] / [`EventCursor::load`].

use crate::error::DbResult;
use rowsync_protocol::{ProtocolError, Timestamp};
use rusqlite::{params, Connection, OptionalExtension};

const LOG_TABLE: &str = "EventLog";

/// Creates the log table if it does not exist yet.
pub(crate) fn create_log(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS \"{LOG_TABLE}\" (\
            \"SeqId\" INTEGER PRIMARY KEY AUTOINCREMENT, \
            \"Type\" TEXT NOT NULL, \
            \"Id\" TEXT NOT NULL, \
            \"Version\" INTEGER NOT NULL, \
            \"Removed\" INTEGER NOT NULL, \
            \"Timestamp\" TEXT NOT NULL);"
    ))
}

/// Appends one entry; `Version` counts writes per (Type, Id).
pub(crate) fn append(
    conn: &Connection,
    type_name: &str,
    id: &str,
    removed: bool,
    timestamp: &Timestamp,
) -> rusqlite::Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO \"{LOG_TABLE}\" (\"Type\", \"Id\", \"Version\", \"Removed\", \"Timestamp\") \
             VALUES (?1, ?2, \
                COALESCE((SELECT MAX(\"Version\") FROM \"{LOG_TABLE}\" \
                          WHERE \"Type\" = ?1 AND \"Id\" = ?2), 0) + 1, \
                ?3, ?4)"
        ),
        params![type_name, id, removed as i64, timestamp.to_iso()],
    )?;
    Ok(())
}

/// One row of the event log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventEntry {
    /// Position in the log.
    pub index: u64,
    /// Object-key type name.
    pub type_name: String,
    /// Object-key id.
    pub id: String,
    /// Per-key write counter.
    pub version: u64,
    /// True if this entry recorded a deletion.
    pub removed: bool,
    /// The record's `modified` timestamp.
    pub timestamp: Timestamp,
}

/// A movable position in the event log.
///
/// With `skip_obsolete` set, [`EventCursor::next`] passes over entries
/// that a later write of the same key has superseded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventCursor {
    /// Current log position (a `SeqId`).
    pub index: u64,
    /// Skip entries superseded by newer writes of the same key.
    pub skip_obsolete: bool,
}

impl EventCursor {
    /// Positions at the oldest entry, if any.
    pub fn first(conn: &Connection) -> DbResult<Option<Self>> {
        Self::edge(conn, "ASC")
    }

    /// Positions at the newest entry, if any.
    pub fn last(conn: &Connection) -> DbResult<Option<Self>> {
        Self::edge(conn, "DESC")
    }

    fn edge(conn: &Connection, order: &str) -> DbResult<Option<Self>> {
        let index: Option<u64> = conn
            .query_row(
                &format!("SELECT \"SeqId\" FROM \"{LOG_TABLE}\" ORDER BY \"SeqId\" {order} LIMIT 1"),
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(index.map(|index| Self {
            index,
            skip_obsolete: true,
        }))
    }

    /// Positions at an explicit index.
    pub fn at(index: u64) -> Self {
        Self {
            index,
            skip_obsolete: true,
        }
    }

    /// Reads the entry under the cursor, if the position still exists.
    pub fn entry(&self, conn: &Connection) -> DbResult<Option<EventEntry>> {
        let row = conn
            .query_row(
                &format!(
                    "SELECT \"SeqId\", \"Type\", \"Id\", \"Version\", \"Removed\", \"Timestamp\" \
                     FROM \"{LOG_TABLE}\" WHERE \"SeqId\" = ?1"
                ),
                params![self.index],
                |row| {
                    Ok((
                        row.get::<_, u64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, u64>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?;
        match row {
            None => Ok(None),
            Some((index, type_name, id, version, removed, iso)) => Ok(Some(EventEntry {
                index,
                type_name,
                id,
                version,
                removed: removed != 0,
                timestamp: Timestamp::parse_iso(&iso)?,
            })),
        }
    }

    /// Advances to the next entry; returns false at the end of the log.
    pub fn next(&mut self, conn: &Connection) -> DbResult<bool> {
        let sql = if self.skip_obsolete {
            format!(
                "SELECT e.\"SeqId\" FROM \"{LOG_TABLE}\" e \
                 WHERE e.\"SeqId\" > ?1 AND NOT EXISTS (\
                    SELECT 1 FROM \"{LOG_TABLE}\" n \
                    WHERE n.\"Type\" = e.\"Type\" AND n.\"Id\" = e.\"Id\" \
                      AND n.\"SeqId\" > e.\"SeqId\") \
                 ORDER BY e.\"SeqId\" ASC LIMIT 1"
            )
        } else {
            format!(
                "SELECT \"SeqId\" FROM \"{LOG_TABLE}\" WHERE \"SeqId\" > ?1 \
                 ORDER BY \"SeqId\" ASC LIMIT 1"
            )
        };
        let next: Option<u64> = conn
            .query_row(&sql, params![self.index], |row| row.get(0))
            .optional()?;
        match next {
            Some(index) => {
                self.index = index;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Serializes as little-endian `(u64 index, bool skip_obsolete)`.
    pub fn save(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(9);
        out.extend_from_slice(&self.index.to_le_bytes());
        out.push(u8::from(self.skip_obsolete));
        out
    }

    /// Restores a cursor from [`Self::save`] output.
    pub fn load(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() != 9 {
            return Err(ProtocolError::invalid(
                "event cursor",
                format!("expected 9 bytes, got {}", bytes.len()),
            ));
        }
        let index = u64::from_le_bytes(bytes[..8].try_into().expect("checked length"));
        Ok(Self {
            index,
            skip_obsolete: bytes[8] != 0,
        })
    }

    /// Deletes log entries strictly below `self.index - offset`.
    pub fn clear_log(&self, conn: &Connection, offset: u64) -> DbResult<usize> {
        let bound = self.index.saturating_sub(offset);
        let removed = conn.execute(
            &format!("DELETE FROM \"{LOG_TABLE}\" WHERE \"SeqId\" < ?1"),
            params![bound],
        )?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        create_log(&conn).unwrap();
        conn
    }

    fn push(conn: &Connection, type_name: &str, id: &str, removed: bool, millis: i64) {
        append(conn, type_name, id, removed, &Timestamp::from_millis(millis)).unwrap();
    }

    #[test]
    fn versions_count_per_key() {
        let conn = log_conn();
        push(&conn, "__qtds_notes", "1", false, 10);
        push(&conn, "__qtds_notes", "1", false, 20);
        push(&conn, "__qtds_notes", "2", false, 30);

        let cursor = EventCursor::first(&conn).unwrap().unwrap();
        let entry = cursor.entry(&conn).unwrap().unwrap();
        assert_eq!(entry.version, 1);

        let last = EventCursor::last(&conn).unwrap().unwrap();
        let entry = last.entry(&conn).unwrap().unwrap();
        assert_eq!(entry.id, "2");
        assert_eq!(entry.version, 1);
    }

    #[test]
    fn walk_full_log() {
        let conn = log_conn();
        push(&conn, "__qtds_notes", "1", false, 10);
        push(&conn, "__qtds_notes", "2", false, 20);
        push(&conn, "__qtds_notes", "1", true, 30);

        let mut cursor = EventCursor::first(&conn).unwrap().unwrap();
        cursor.skip_obsolete = false;
        let mut seen = vec![cursor.entry(&conn).unwrap().unwrap().index];
        while cursor.next(&conn).unwrap() {
            seen.push(cursor.index);
        }
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[test]
    fn skip_obsolete_passes_superseded_entries() {
        let conn = log_conn();
        push(&conn, "__qtds_notes", "1", false, 10);
        push(&conn, "__qtds_notes", "2", false, 20);
        push(&conn, "__qtds_notes", "1", true, 30);

        // Entry 1 is superseded by entry 3 (same key), so the walk from
        // entry 1 goes 2 then 3.
        let mut cursor = EventCursor::at(1);
        assert!(cursor.next(&conn).unwrap());
        assert_eq!(cursor.index, 2);
        assert!(cursor.next(&conn).unwrap());
        assert_eq!(cursor.index, 3);
        assert!(!cursor.next(&conn).unwrap());
    }

    #[test]
    fn save_load_roundtrip() {
        let cursor = EventCursor {
            index: 0x0102_0304_0506_0708,
            skip_obsolete: true,
        };
        let bytes = cursor.save();
        assert_eq!(bytes.len(), 9);
        assert_eq!(bytes[0], 0x08, "little-endian");
        assert_eq!(EventCursor::load(&bytes).unwrap(), cursor);

        assert!(EventCursor::load(&bytes[..5]).is_err());
    }

    #[test]
    fn clear_log_is_exclusive() {
        let conn = log_conn();
        for i in 0..5 {
            push(&conn, "__qtds_notes", &i.to_string(), false, i * 10);
        }

        let cursor = EventCursor::at(4);
        let removed = cursor.clear_log(&conn, 1).unwrap();
        // Bound is 4 - 1 = 3, exclusive: entries 1 and 2 go, 3 stays.
        assert_eq!(removed, 2);
        let remaining: i64 = conn
            .query_row("SELECT MIN(SeqId) FROM EventLog", [], |r| r.get(0))
            .unwrap();
        assert_eq!(remaining, 3);
    }
}
