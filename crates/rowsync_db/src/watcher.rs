//! Trigger-based change tracking on user tables.
//!
//! For every synced table `T` the watcher keeps a shadow table
//! `__qtds_T` with one row per user row (or tombstone), three AFTER
//! triggers feeding it, and one row in the `__qtds_meta` table. Download
//! writes run with a marker row present in `__qtds_nosync`; the triggers'
//! WHEN clause checks that table, so the engine's own writes never loop
//! back into the change log.

use crate::error::{DbResult, WatcherError};
use rowsync_protocol::{FieldValue, Fields, LocalData, ObjectKey, Timestamp};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::collections::HashMap;
use std::fmt::Write as _;
use tracing::{debug, warn};

/// Prefix of every table, trigger, and key type the watcher owns.
pub const TABLE_PREFIX: &str = "__qtds_";

/// Name of the per-database metadata table.
pub const META_TABLE: &str = "__qtds_meta";

/// Guard table consulted by the triggers; a row present means "writes in
/// this transaction are downloads, do not log them".
const NOSYNC_TABLE: &str = "__qtds_nosync";

/// SQL expression producing the current UTC time in the shared
/// millisecond ISO-8601 format.
const SQL_NOW: &str = "strftime('%Y-%m-%dT%H:%M:%fZ','now')";

/// Synchronization state of a table, as stored in the meta table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableState {
    /// Known but not currently synchronized.
    Inactive = 0,
    /// Synchronizing.
    Active = 1,
    /// Excluded from sync pending operator attention.
    Corrupted = 2,
}

impl TableState {
    fn from_i64(value: i64) -> Self {
        match value {
            1 => TableState::Active,
            2 => TableState::Corrupted,
            _ => TableState::Inactive,
        }
    }
}

/// Change state of a shadow row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeState {
    /// In sync with the cloud.
    Unchanged = 0,
    /// Awaiting upload.
    Changed = 1,
    /// Excluded from sync.
    Corrupted = 2,
}

#[derive(Debug, Clone)]
struct TableInfo {
    pkey_col: String,
    fields: Vec<String>,
}

/// Instruments user tables and converts rows to and from sync records.
///
/// The watcher exclusively owns its connection; embedder threads that need
/// the same database file use [`crate::SharedDatabase`] handles instead.
pub struct DatabaseWatcher {
    conn: Connection,
    tables: HashMap<String, TableInfo>,
    log_active: bool,
}

impl DatabaseWatcher {
    /// Creates a watcher on the given connection, creating the private
    /// bookkeeping tables if needed.
    pub fn new(conn: Connection) -> DbResult<Self> {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS \"{META_TABLE}\" (\
                \"table\" TEXT PRIMARY KEY NOT NULL, \
                \"pkeyType\" TEXT NOT NULL, \
                \"state\" INTEGER NOT NULL, \
                \"lastSync\" TEXT NOT NULL, \
                \"version\" INTEGER NOT NULL); \
             CREATE TABLE IF NOT EXISTS \"{NOSYNC_TABLE}\" (\"flag\" INTEGER); \
             DELETE FROM \"{NOSYNC_TABLE}\";"
        ))?;
        Ok(Self {
            conn,
            tables: HashMap::new(),
            log_active: false,
        })
    }

    /// Read access to the underlying connection, for cursors and
    /// introspection. Mutating statements stay inside the watcher.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// The shadow-table (and object-key type) name for a user table.
    pub fn sync_table_name(table: &str) -> String {
        format!("{TABLE_PREFIX}{table}")
    }

    /// Maps an object-key type name back to the user table it came from.
    pub fn table_for_type(type_name: &str) -> DbResult<&str> {
        type_name
            .strip_prefix(TABLE_PREFIX)
            .ok_or_else(|| WatcherError::UnknownTable {
                table: type_name.to_owned(),
            })
    }

    /// Returns true if at least one table is registered for sync.
    pub fn has_tables(&self) -> DbResult<bool> {
        let count: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM \"{META_TABLE}\" WHERE \"state\" = 1"),
            [],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Names of all actively synchronized tables.
    pub fn tables(&self) -> DbResult<Vec<String>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT \"table\" FROM \"{META_TABLE}\" WHERE \"state\" = 1 ORDER BY \"table\""
        ))?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }

    /// Registers a table for synchronization.
    ///
    /// `fields` limits change tracking to the given columns (all non-key
    /// columns when empty); `pkey_type` overrides the declared type of the
    /// primary-key column in the shadow table. Idempotent for identical
    /// parameters; reactivates an Inactive table, resuming from its
    /// previous last-sync; fails with [`WatcherError::TableCorrupted`] on
    /// a Corrupted one.
    pub fn add_table(
        &mut self,
        name: &str,
        fields: &[String],
        pkey_type: Option<&str>,
    ) -> DbResult<()> {
        if name.starts_with(TABLE_PREFIX) || name == "EventLog" {
            return Err(WatcherError::ReservedName {
                table: name.to_owned(),
            });
        }

        let (pkey_col, declared_type, all_fields) = self.introspect(name)?;
        let tracked: Vec<String> = if fields.is_empty() {
            all_fields
        } else {
            fields.to_vec()
        };
        if tracked.is_empty() {
            return Err(WatcherError::TableEmpty {
                table: name.to_owned(),
            });
        }
        let pk_type = pkey_type.unwrap_or(&declared_type).to_owned();

        let meta: Option<i64> = self
            .conn
            .query_row(
                &format!("SELECT \"state\" FROM \"{META_TABLE}\" WHERE \"table\" = ?1"),
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        if meta.map(TableState::from_i64) == Some(TableState::Corrupted) {
            return Err(WatcherError::TableCorrupted {
                table: name.to_owned(),
            });
        }

        let result = (|| -> rusqlite::Result<()> {
            let tx = self.conn.transaction()?;
            match meta {
                None => {
                    tx.execute(
                        &format!(
                            "INSERT INTO \"{META_TABLE}\" \
                             (\"table\", \"pkeyType\", \"state\", \"lastSync\", \"version\") \
                             VALUES (?1, ?2, 1, ?3, 1)"
                        ),
                        params![name, pk_type, Timestamp::epoch().to_iso()],
                    )?;
                }
                Some(_) => {
                    // Reactivation counts as a schema step; a re-add of an
                    // already active table does not.
                    tx.execute(
                        &format!(
                            "UPDATE \"{META_TABLE}\" SET \
                             \"version\" = \"version\" + (\"state\" = 0), \
                             \"state\" = 1, \"pkeyType\" = ?2 \
                             WHERE \"table\" = ?1"
                        ),
                        params![name, pk_type],
                    )?;
                }
            }
            create_shadow(&tx, name, &pk_type)?;
            create_triggers(&tx, name, &pkey_col, &tracked)?;
            seed_shadow(&tx, name, &pkey_col)?;
            tx.commit()
        })();

        match result {
            Ok(()) => {
                debug!(table = name, "table registered for sync");
                self.tables.insert(
                    name.to_owned(),
                    TableInfo {
                        pkey_col,
                        fields: tracked,
                    },
                );
                Ok(())
            }
            Err(e) => Err(self.corrupt_table(name, e)),
        }
    }

    /// Registers every user table in the database.
    pub fn add_all_tables(&mut self) -> DbResult<()> {
        let names: Vec<String> = {
            let mut stmt = self.conn.prepare(
                "SELECT name FROM sqlite_master WHERE type = 'table' \
                 AND name NOT LIKE '\\_\\_qtds\\_%' ESCAPE '\\' \
                 AND name NOT LIKE 'sqlite\\_%' ESCAPE '\\' \
                 AND name != 'EventLog' ORDER BY name",
            )?;
            let rows = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        for name in names {
            self.add_table(&name, &[], None)?;
        }
        Ok(())
    }

    /// Re-asserts shadow tables and triggers for every Active meta row.
    ///
    /// Self-healing after a schema rollback or a fresh process start; the
    /// previous last-sync values are kept.
    pub fn reactivate_tables(&mut self) -> DbResult<()> {
        let active: Vec<(String, String)> = {
            let mut stmt = self.conn.prepare(&format!(
                "SELECT \"table\", \"pkeyType\" FROM \"{META_TABLE}\" WHERE \"state\" = 1"
            ))?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        for (name, pk_type) in active {
            let (pkey_col, _, all_fields) = self.introspect(&name)?;
            let result = (|| -> rusqlite::Result<()> {
                let tx = self.conn.transaction()?;
                create_shadow(&tx, &name, &pk_type)?;
                create_triggers(&tx, &name, &pkey_col, &all_fields)?;
                tx.commit()
            })();
            match result {
                Ok(()) => {
                    self.tables.insert(
                        name.clone(),
                        TableInfo {
                            pkey_col,
                            fields: all_fields,
                        },
                    );
                }
                Err(e) => return Err(self.corrupt_table(&name, e)),
            }
        }
        Ok(())
    }

    /// Stops tracking a table: drops triggers and the shadow table, keeps
    /// the meta row (Inactive) so a later `add_table` resumes from the
    /// prior last-sync. Safe on tables that were never added.
    pub fn remove_table(&mut self, name: &str) -> DbResult<()> {
        self.drop_instrumentation(name, false)
    }

    /// Stops tracking every active table.
    pub fn remove_all_tables(&mut self) -> DbResult<()> {
        for name in self.tables()? {
            self.remove_table(&name)?;
        }
        Ok(())
    }

    /// Like [`Self::remove_table`] but also forgets the meta row, so the
    /// table's sync history is gone.
    pub fn unsync_table(&mut self, name: &str) -> DbResult<()> {
        self.drop_instrumentation(name, true)
    }

    /// Unsyncs every known table and drops the event log.
    pub fn unsync_all_tables(&mut self) -> DbResult<()> {
        let names: Vec<String> = {
            let mut stmt = self
                .conn
                .prepare(&format!("SELECT \"table\" FROM \"{META_TABLE}\""))?;
            let rows = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        for name in names {
            self.unsync_table(&name)?;
        }
        self.conn
            .execute_batch("DROP TABLE IF EXISTS \"EventLog\";")?;
        self.log_active = false;
        Ok(())
    }

    fn drop_instrumentation(&mut self, name: &str, drop_meta: bool) -> DbResult<()> {
        let result = (|| -> rusqlite::Result<()> {
            let tx = self.conn.transaction()?;
            for op in ["insert", "update", "delete"] {
                tx.execute_batch(&format!(
                    "DROP TRIGGER IF EXISTS \"{}\";",
                    trigger_name(name, op)
                ))?;
            }
            tx.execute_batch(&format!(
                "DROP TABLE IF EXISTS \"{}\";",
                Self::sync_table_name(name)
            ))?;
            if drop_meta {
                tx.execute(
                    &format!("DELETE FROM \"{META_TABLE}\" WHERE \"table\" = ?1"),
                    params![name],
                )?;
            } else {
                tx.execute(
                    &format!("UPDATE \"{META_TABLE}\" SET \"state\" = 0 WHERE \"table\" = ?1"),
                    params![name],
                )?;
            }
            tx.commit()
        })();
        self.tables.remove(name);
        result.map_err(|e| self.corrupt_table(name, e))?;
        debug!(table = name, drop_meta, "table removed from sync");
        Ok(())
    }

    /// The greatest `modified` this table has accepted from the cloud.
    pub fn last_sync(&self, table: &str) -> DbResult<Timestamp> {
        let iso: Option<String> = self
            .conn
            .query_row(
                &format!("SELECT \"lastSync\" FROM \"{META_TABLE}\" WHERE \"table\" = ?1"),
                params![table],
                |row| row.get(0),
            )
            .optional()?;
        match iso {
            Some(iso) => Ok(Timestamp::parse_iso(&iso)?),
            None => Err(WatcherError::UnknownTable {
                table: table.to_owned(),
            }),
        }
    }

    /// Applies one downloaded record.
    ///
    /// Last-writer-wins: a locally Changed row with a `modified` at or
    /// above the record's is kept, and the table's last-sync is not
    /// advanced for that key. Otherwise the user row is written (or
    /// deleted for a tombstone) with the triggers suppressed, the shadow
    /// row is set Unchanged at the record's `modified`, and last-sync
    /// advances. Replaying an already-applied record is a no-op.
    pub fn store_data(&mut self, data: &LocalData) -> DbResult<()> {
        let table = Self::table_for_type(&data.key.type_name)?.to_owned();
        let info = self
            .tables
            .get(&table)
            .cloned()
            .ok_or_else(|| WatcherError::UnknownTable {
                table: table.clone(),
            })?;
        let log_active = self.log_active;

        let result = (|| -> DbResult<()> {
            let tx = self.conn.transaction()?;
            let shadow = load_shadow(&tx, &table, &data.key.id)?;

            let apply = match &shadow {
                None => !data.is_tombstone(),
                Some(row) => {
                    if row.changed == ChangeState::Changed as i64 && data.modified <= row.modified {
                        // Local row wins; leave it pending upload.
                        debug!(key = %data.key, "download lost against local change");
                        tx.commit()?;
                        return Ok(());
                    }
                    true
                }
            };

            if apply {
                tx.execute(
                    &format!("INSERT INTO \"{NOSYNC_TABLE}\" (\"flag\") VALUES (1)"),
                    [],
                )?;
                if data.is_tombstone() {
                    tx.execute(
                        &format!(
                            "DELETE FROM {} WHERE {} = ?1",
                            quote(&table),
                            quote(&info.pkey_col)
                        ),
                        params![data.key.id],
                    )?;
                } else {
                    upsert_user_row(&tx, &table, &info, data)?;
                }
                tx.execute(&format!("DELETE FROM \"{NOSYNC_TABLE}\""), [])?;

                tx.execute(
                    &format!(
                        "INSERT INTO \"{}\" (\"pkey\", \"changed\", \"modified\", \"tombstone\") \
                         VALUES (?1, 0, ?2, ?3) \
                         ON CONFLICT(\"pkey\") DO UPDATE SET \
                         \"changed\" = 0, \
                         \"modified\" = excluded.\"modified\", \
                         \"tombstone\" = excluded.\"tombstone\"",
                        Self::sync_table_name(&table)
                    ),
                    params![
                        data.key.id,
                        data.modified.to_iso(),
                        data.is_tombstone() as i64
                    ],
                )?;

                if log_active {
                    crate::event_log::append(
                        &tx,
                        &data.key.type_name,
                        &data.key.id,
                        data.is_tombstone(),
                        &data.modified,
                    )?;
                }
            }

            tx.execute(
                &format!(
                    "UPDATE \"{META_TABLE}\" SET \"lastSync\" = ?1 \
                     WHERE \"table\" = ?2 AND \"lastSync\" < ?1"
                ),
                params![data.modified.to_iso(), table],
            )?;
            tx.commit()?;
            Ok(())
        })();

        result.map_err(|e| self.corrupt_on_sql_error(&table, e))
    }

    /// Returns the oldest pending local change for `table`, or `None`.
    pub fn load_data(&mut self, table: &str) -> DbResult<Option<LocalData>> {
        let info = self
            .tables
            .get(table)
            .cloned()
            .ok_or_else(|| WatcherError::UnknownTable {
                table: table.to_owned(),
            })?;

        let result = (|| -> DbResult<Option<LocalData>> {
            let pending: Option<(SqlValue, String, i64)> = self
                .conn
                .query_row(
                    &format!(
                        "SELECT \"pkey\", \"modified\", \"tombstone\" FROM \"{}\" \
                         WHERE \"changed\" = 1 ORDER BY \"modified\" ASC LIMIT 1",
                        Self::sync_table_name(table)
                    ),
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;

            let Some((pkey, modified_iso, tombstone)) = pending else {
                return Ok(None);
            };
            let key = ObjectKey::new(Self::sync_table_name(table), render_pkey(&pkey));
            let modified = Timestamp::parse_iso(&modified_iso)?;

            if tombstone != 0 {
                return Ok(Some(LocalData::tombstone(key, modified)));
            }

            let column_list = info
                .fields
                .iter()
                .map(|f| quote(f))
                .collect::<Vec<_>>()
                .join(", ");
            let row: Option<Fields> = self
                .conn
                .query_row(
                    &format!(
                        "SELECT {column_list} FROM {} WHERE {} = ?1",
                        quote(table),
                        quote(&info.pkey_col)
                    ),
                    params![pkey],
                    |row| {
                        let mut fields = Fields::new();
                        for (i, name) in info.fields.iter().enumerate() {
                            fields.insert(name.clone(), field_from_sql(row.get_ref(i)?));
                        }
                        Ok(fields)
                    },
                )
                .optional()?;

            match row {
                Some(fields) => Ok(Some(LocalData::new(key, modified, fields))),
                None => {
                    // Shadow without a user row: the row vanished without
                    // its delete trigger firing. Surface it as a deletion.
                    warn!(key = %key, "pending row missing from user table");
                    Ok(Some(LocalData::tombstone(key, modified)))
                }
            }
        })();

        result.map_err(|e| self.corrupt_on_sql_error(table, e))
    }

    /// Commits a successful upload.
    ///
    /// If the row was modified again while the upload was in flight
    /// (shadow `modified` newer than the acknowledged one) it stays
    /// Changed and will be uploaded again.
    pub fn mark_unchanged(&mut self, key: &ObjectKey, ack_modified: &Timestamp) -> DbResult<()> {
        let table = Self::table_for_type(&key.type_name)?.to_owned();
        let result = (|| -> DbResult<()> {
            let tx = self.conn.transaction()?;
            let shadow = load_shadow(&tx, &table, &key.id)?;
            match shadow {
                None => warn!(key = %key, "acknowledged a row without a shadow entry"),
                Some(row) if row.modified > *ack_modified => {
                    warn!(key = %key, "row changed during upload, staying dirty");
                }
                Some(_) => {
                    tx.execute(
                        &format!(
                            "UPDATE \"{}\" SET \"changed\" = 0 WHERE \"pkey\" = ?1",
                            Self::sync_table_name(&table)
                        ),
                        params![key.id],
                    )?;
                }
            }
            tx.commit()?;
            Ok(())
        })();
        result.map_err(|e| self.corrupt_on_sql_error(&table, e))
    }

    /// Moves a row to Corrupted: it is never uploaded again and surfaces
    /// no further changes, but blocks nothing else.
    pub fn mark_corrupted(&mut self, key: &ObjectKey, modified: &Timestamp) -> DbResult<()> {
        let table = Self::table_for_type(&key.type_name)?.to_owned();
        let result = self.conn.execute(
            &format!(
                "INSERT INTO \"{}\" (\"pkey\", \"changed\", \"modified\", \"tombstone\") \
                 VALUES (?1, 2, ?2, 0) \
                 ON CONFLICT(\"pkey\") DO UPDATE SET \"changed\" = 2",
                Self::sync_table_name(&table)
            ),
            params![key.id, modified.to_iso()],
        );
        result
            .map(|_| ())
            .map_err(|e| self.corrupt_table(&table, e))
    }

    /// Change state of a single shadow row; `None` when the row has no
    /// shadow entry.
    pub fn change_state(&self, key: &ObjectKey) -> DbResult<Option<ChangeState>> {
        let table = Self::table_for_type(&key.type_name)?;
        let changed: Option<i64> = self
            .conn
            .query_row(
                &format!(
                    "SELECT \"changed\" FROM \"{}\" WHERE \"pkey\" = ?1",
                    Self::sync_table_name(table)
                ),
                params![key.id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(changed.map(|c| match c {
            1 => ChangeState::Changed,
            2 => ChangeState::Corrupted,
            _ => ChangeState::Unchanged,
        }))
    }

    /// Turns the event log on or off, creating its table on first use.
    pub fn set_event_log_active(&mut self, active: bool) -> DbResult<()> {
        if active {
            crate::event_log::create_log(&self.conn)?;
        }
        self.log_active = active;
        Ok(())
    }

    /// Whether store operations currently journal into the event log.
    pub fn event_log_active(&self) -> bool {
        self.log_active
    }

    fn introspect(&self, table: &str) -> DbResult<(String, String, Vec<String>)> {
        let mut stmt = self
            .conn
            .prepare(&format!("PRAGMA table_info({})", quote(table)))?;
        let mut pk_cols: Vec<(String, String)> = Vec::new();
        let mut fields: Vec<String> = Vec::new();
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(5)?,
            ))
        })?;
        for row in rows {
            let (name, decl_type, pk) = row?;
            if pk > 0 {
                pk_cols.push((name, decl_type));
            } else {
                fields.push(name);
            }
        }
        if pk_cols.is_empty() && fields.is_empty() {
            return Err(WatcherError::UnknownTable {
                table: table.to_owned(),
            });
        }
        match pk_cols.len() {
            0 => Err(WatcherError::UnsupportedPrimaryKey {
                table: table.to_owned(),
                reason: "no primary key".into(),
            }),
            1 => {
                let (name, decl_type) = pk_cols.into_iter().next().expect("checked length");
                let decl_type = if decl_type.is_empty() {
                    "TEXT".to_owned()
                } else {
                    decl_type
                };
                Ok((name, decl_type, fields))
            }
            _ => Err(WatcherError::UnsupportedPrimaryKey {
                table: table.to_owned(),
                reason: "composite primary key".into(),
            }),
        }
    }

    fn corrupt_table(&self, table: &str, source: rusqlite::Error) -> WatcherError {
        let _ = self.conn.execute(
            &format!("UPDATE \"{META_TABLE}\" SET \"state\" = 2 WHERE \"table\" = ?1"),
            params![table],
        );
        tracing::error!(table, error = %source, "table flipped to corrupted");
        WatcherError::Database {
            table: table.to_owned(),
            source,
        }
    }

    fn corrupt_on_sql_error(&self, table: &str, error: WatcherError) -> WatcherError {
        match error {
            WatcherError::Sqlite(source) => self.corrupt_table(table, source),
            other => other,
        }
    }
}

#[derive(Debug)]
struct ShadowRow {
    changed: i64,
    modified: Timestamp,
}

fn load_shadow(tx: &Transaction<'_>, table: &str, id: &str) -> DbResult<Option<ShadowRow>> {
    let row: Option<(i64, String)> = tx
        .query_row(
            &format!(
                "SELECT \"changed\", \"modified\" FROM \"{}\" WHERE \"pkey\" = ?1",
                DatabaseWatcher::sync_table_name(table)
            ),
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    match row {
        None => Ok(None),
        Some((changed, iso)) => Ok(Some(ShadowRow {
            changed,
            modified: Timestamp::parse_iso(&iso)?,
        })),
    }
}

fn upsert_user_row(
    tx: &Transaction<'_>,
    table: &str,
    info: &TableInfo,
    data: &LocalData,
) -> DbResult<()> {
    let fields = data.data.as_ref().expect("caller checked tombstone");
    let mut columns = vec![quote(&info.pkey_col)];
    let mut binds: Vec<SqlValue> = vec![SqlValue::Text(data.key.id.clone())];
    for name in &info.fields {
        if let Some(value) = fields.get(name) {
            columns.push(quote(name));
            binds.push(field_to_sql(value));
        }
    }
    for name in fields.keys() {
        if !info.fields.contains(name) && name != &info.pkey_col {
            warn!(table, field = name.as_str(), "ignoring untracked field");
        }
    }

    let mut sql = format!("INSERT INTO {} (", quote(table));
    sql.push_str(&columns.join(", "));
    sql.push_str(") VALUES (");
    for i in 1..=columns.len() {
        if i > 1 {
            sql.push_str(", ");
        }
        let _ = write!(sql, "?{i}");
    }
    sql.push(')');
    if columns.len() == 1 {
        sql.push_str(&format!(
            " ON CONFLICT({}) DO NOTHING",
            quote(&info.pkey_col)
        ));
    } else {
        sql.push_str(&format!(" ON CONFLICT({}) DO UPDATE SET ", quote(&info.pkey_col)));
        let updates = columns[1..]
            .iter()
            .map(|c| format!("{c} = excluded.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        sql.push_str(&updates);
    }

    tx.execute(&sql, rusqlite::params_from_iter(binds))?;
    Ok(())
}

fn create_shadow(tx: &Transaction<'_>, table: &str, pk_type: &str) -> rusqlite::Result<()> {
    tx.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS \"{}\" (\
            \"pkey\" {pk_type} PRIMARY KEY, \
            \"changed\" INTEGER NOT NULL, \
            \"modified\" TEXT NOT NULL, \
            \"tombstone\" INTEGER NOT NULL DEFAULT 0);",
        DatabaseWatcher::sync_table_name(table)
    ))
}

fn create_triggers(
    tx: &Transaction<'_>,
    table: &str,
    pkey_col: &str,
    fields: &[String],
) -> rusqlite::Result<()> {
    let shadow = DatabaseWatcher::sync_table_name(table);
    let suppressed = format!("NOT EXISTS (SELECT 1 FROM \"{NOSYNC_TABLE}\")");
    let mark = |key_ref: &str, tombstone: u8| {
        format!(
            "INSERT INTO \"{shadow}\" (\"pkey\", \"changed\", \"modified\", \"tombstone\") \
             VALUES ({key_ref}.{pk}, 1, {SQL_NOW}, {tombstone}) \
             ON CONFLICT(\"pkey\") DO UPDATE SET \
             \"changed\" = 1, \
             \"modified\" = excluded.\"modified\", \
             \"tombstone\" = {tombstone};",
            pk = quote(pkey_col),
        )
    };
    // Skips updates that touch none of the tracked columns.
    let any_field_changed = fields
        .iter()
        .map(|f| format!("OLD.{c} IS NOT NEW.{c}", c = quote(f)))
        .collect::<Vec<_>>()
        .join(" OR ");

    for op in ["insert", "update", "delete"] {
        tx.execute_batch(&format!(
            "DROP TRIGGER IF EXISTS \"{}\";",
            trigger_name(table, op)
        ))?;
    }
    tx.execute_batch(&format!(
        "CREATE TRIGGER \"{name}\" AFTER INSERT ON {table} \
         WHEN {suppressed} BEGIN {body} END;",
        name = trigger_name(table, "insert"),
        table = quote(table),
        body = mark("NEW", 0),
    ))?;
    tx.execute_batch(&format!(
        "CREATE TRIGGER \"{name}\" AFTER UPDATE ON {table} \
         WHEN {suppressed} AND ({any_field_changed}) BEGIN {body} END;",
        name = trigger_name(table, "update"),
        table = quote(table),
        body = mark("NEW", 0),
    ))?;
    tx.execute_batch(&format!(
        "CREATE TRIGGER \"{name}\" AFTER DELETE ON {table} \
         WHEN {suppressed} BEGIN {body} END;",
        name = trigger_name(table, "delete"),
        table = quote(table),
        body = mark("OLD", 1),
    ))?;
    Ok(())
}

fn seed_shadow(tx: &Transaction<'_>, table: &str, pkey_col: &str) -> rusqlite::Result<()> {
    tx.execute(
        &format!(
            "INSERT INTO \"{shadow}\" (\"pkey\", \"changed\", \"modified\", \"tombstone\") \
             SELECT {pk}, 1, {SQL_NOW}, 0 FROM {table} WHERE true \
             ON CONFLICT(\"pkey\") DO NOTHING",
            shadow = DatabaseWatcher::sync_table_name(table),
            pk = quote(pkey_col),
            table = quote(table),
        ),
        [],
    )?;
    Ok(())
}

fn trigger_name(table: &str, op: &str) -> String {
    format!("{TABLE_PREFIX}{table}_{op}")
}

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn render_pkey(value: &SqlValue) -> String {
    match value {
        SqlValue::Integer(i) => i.to_string(),
        SqlValue::Real(r) => r.to_string(),
        SqlValue::Text(t) => t.clone(),
        SqlValue::Blob(b) => b.iter().fold(String::new(), |mut acc, byte| {
            let _ = write!(acc, "{byte:02x}");
            acc
        }),
        SqlValue::Null => String::new(),
    }
}

fn field_from_sql(value: ValueRef<'_>) -> FieldValue {
    match value {
        ValueRef::Null => FieldValue::Null,
        ValueRef::Integer(i) => FieldValue::Integer(i),
        ValueRef::Real(r) => FieldValue::Real(r),
        ValueRef::Text(t) => FieldValue::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => FieldValue::Blob(b.to_vec()),
    }
}

fn field_to_sql(value: &FieldValue) -> SqlValue {
    match value {
        FieldValue::Null => SqlValue::Null,
        FieldValue::Integer(i) => SqlValue::Integer(*i),
        FieldValue::Real(r) => SqlValue::Real(*r),
        FieldValue::Text(t) => SqlValue::Text(t.clone()),
        FieldValue::Blob(b) => SqlValue::Blob(b.clone()),
    }
}
