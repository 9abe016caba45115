//! The local replica store.
//!
//! A [`Replica`] owns one SQLite database holding the tracked data tables,
//! the change log, and the resolver's per-record state. Local mutations go
//! through [`WriteTxn`], which writes the data row and the matching log
//! entry in one SQL transaction - that transaction is the capture layer.
//! Remote entries come in through [`Replica::apply_remote`], which routes
//! each entry through the conflict resolver and appends it to the same
//! log, tagged synced, so a third replica can catch up transitively.

use crate::{
    log,
    resolve::{resolve, RecordVersion, Resolution},
    stream::{BatchOrigin, ChangeBatch, ChangeStream, Subscription},
    ChangeEntry, Error, FieldMap, GlobalId, Op, Result, TableDef, TableRegistry, Timestamp,
};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

const REPLICA_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS record_meta (
    table_name TEXT NOT NULL,
    target     BLOB NOT NULL,
    ts         REAL NOT NULL,
    entry_id   BLOB NOT NULL,
    deleted    INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (table_name, target)
);
CREATE TABLE IF NOT EXISTS pending_entries (
    global_id  BLOB PRIMARY KEY,
    table_name TEXT NOT NULL,
    op         INTEGER NOT NULL,
    target     BLOB NOT NULL,
    fields     TEXT NOT NULL,
    ts         REAL NOT NULL
);
";

const REPLICA_ID_KEY: &str = "replica_id";

/// Outcome of applying a remote batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyReport {
    /// Entries that changed record state
    pub applied: Vec<GlobalId>,
    /// Entries that lost conflict resolution (an expected outcome)
    pub rejected: Vec<GlobalId>,
    /// Duplicates and redundant tombstones
    pub skipped: Vec<GlobalId>,
    /// Entries for tables this replica has not registered yet; retained
    /// and retried when the table is registered
    pub parked: Vec<GlobalId>,
}

/// One replica's store: tracked tables, change log, resolver state.
pub struct Replica {
    conn: Connection,
    registry: TableRegistry,
    stream: ChangeStream,
    replica_id: String,
}

impl Replica {
    /// Open (or create) a replica database on disk.
    pub fn open(path: impl AsRef<Path>, registry: TableRegistry) -> Result<Self> {
        Self::from_conn(Connection::open(path)?, registry)
    }

    /// Open an in-memory replica, mostly for tests.
    pub fn open_in_memory(registry: TableRegistry) -> Result<Self> {
        Self::from_conn(Connection::open_in_memory()?, registry)
    }

    fn from_conn(conn: Connection, registry: TableRegistry) -> Result<Self> {
        log::init(&conn)?;
        conn.execute_batch(REPLICA_SCHEMA)?;
        for name in registry.names() {
            create_data_table(&conn, name)?;
        }
        let replica_id = load_replica_id(&conn)?;

        Ok(Self {
            conn,
            registry,
            stream: ChangeStream::default(),
            replica_id,
        })
    }

    /// Stable identifier of this replica, generated on first open.
    pub fn replica_id(&self) -> &str {
        &self.replica_id
    }

    /// The tracked-table registry.
    pub fn registry(&self) -> &TableRegistry {
        &self.registry
    }

    /// Wall-clock capture timestamp, seconds since epoch.
    pub fn now() -> Timestamp {
        chrono::Utc::now().timestamp_micros() as f64 / 1e6
    }

    /// Register a table after open and retry any entries parked for it.
    pub fn register_table(&mut self, def: TableDef) -> Result<ApplyReport> {
        create_data_table(&self.conn, &def.name)?;
        let name = def.name.clone();
        self.registry.register(def);
        self.retry_parked(&name)
    }

    /// Subscribe to this replica's change stream.
    pub fn subscribe(&self) -> Subscription {
        self.stream.subscribe()
    }

    /// The change stream itself.
    pub fn stream(&self) -> &ChangeStream {
        &self.stream
    }

    /// Begin a local write transaction.
    ///
    /// Dropping the transaction without committing rolls back the data
    /// rows and the captured log entries together.
    pub fn begin_write(&mut self) -> Result<WriteTxn<'_>> {
        let Self {
            conn,
            registry,
            stream,
            ..
        } = self;
        let tx = conn.transaction()?;
        Ok(WriteTxn {
            tx,
            registry,
            stream,
            entries: Vec::new(),
        })
    }

    /// Read the current fields of a record, if it exists.
    pub fn get(&self, table: &str, target: GlobalId) -> Result<Option<FieldMap>> {
        if !self.registry.contains(table) {
            return Err(Error::TableNotRegistered(table.to_string()));
        }
        read_fields(&self.conn, table, target)
    }

    /// Number of rows currently in a tracked table.
    pub fn count(&self, table: &str) -> Result<u64> {
        if !self.registry.contains(table) {
            return Err(Error::TableNotRegistered(table.to_string()));
        }
        let n: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", quoted(table)),
            [],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    /// Apply a batch of remote entries in one local transaction.
    ///
    /// Re-applying an entry already present in the log is a no-op, so the
    /// relay redelivering after a reconnect is harmless. One change-stream
    /// batch is published for the commit, containing exactly the entries
    /// that changed record state.
    pub fn apply_remote(&mut self, entries: &[ChangeEntry]) -> Result<ApplyReport> {
        let Self {
            conn,
            registry,
            stream,
            ..
        } = self;
        let tx = conn.transaction()?;

        let mut report = ApplyReport::default();
        let mut applied = Vec::new();

        for entry in entries {
            if log::contains(&tx, entry.global_id)? {
                report.skipped.push(entry.global_id);
                continue;
            }

            if !registry.contains(&entry.table) {
                park_entry(&tx, entry)?;
                tracing::warn!(
                    table = %entry.table,
                    entry = %entry.global_id,
                    "parked entry for unregistered table"
                );
                report.parked.push(entry.global_id);
                continue;
            }

            // Normalize before logging: local keys never travel, and an
            // entry received from the relay is synchronized by definition.
            let mut logged = entry.clone();
            logged.row_id = None;
            logged.synced = true;

            let current = read_meta(&tx, &entry.table, entry.target)?;
            match resolve(entry, current.as_ref()) {
                Resolution::Apply => {
                    apply_entry(&tx, &logged)?;
                    log::append(&tx, &logged)?;
                    report.applied.push(entry.global_id);
                    applied.push(logged);
                }
                Resolution::Reject => {
                    log::append(&tx, &logged)?;
                    report.rejected.push(entry.global_id);
                }
                Resolution::Skip => {
                    log::append(&tx, &logged)?;
                    report.skipped.push(entry.global_id);
                }
            }
        }

        tx.commit()?;
        stream.publish(ChangeBatch {
            entries: applied,
            origin: BatchOrigin::Remote,
        });
        Ok(report)
    }

    /// Log entries not yet acknowledged by the relay, in creation order.
    pub fn unsynchronized(&self) -> Result<Vec<ChangeEntry>> {
        log::unsynchronized(&self.conn)
    }

    /// Record relay acknowledgment for the given entries.
    pub fn mark_synchronized(&self, ids: &[GlobalId]) -> Result<usize> {
        log::mark_synchronized(&self.conn, ids)
    }

    /// The persisted download watermark.
    pub fn watermark(&self) -> Result<Option<GlobalId>> {
        log::watermark(&self.conn)
    }

    /// Persist the download watermark.
    pub fn set_watermark(&self, id: GlobalId) -> Result<()> {
        log::set_watermark(&self.conn, id)
    }

    /// Total number of change log entries.
    pub fn log_len(&self) -> Result<u64> {
        log::len(&self.conn)
    }

    /// Log entries after a watermark, for serving transitive catch-up.
    pub fn entries_after(&self, watermark: Option<GlobalId>) -> Result<Vec<ChangeEntry>> {
        log::entries_after(&self.conn, watermark)
    }

    fn retry_parked(&mut self, table: &str) -> Result<ApplyReport> {
        let parked = {
            let mut stmt = self.conn.prepare(
                "SELECT global_id, table_name, op, target, fields, ts
                 FROM pending_entries WHERE table_name = ?1 ORDER BY rowid ASC",
            )?;
            let rows = stmt.query_map(params![table], parked_from_row)?;
            let mut entries = Vec::new();
            for row in rows {
                entries.push(row?);
            }
            entries
        };

        if parked.is_empty() {
            return Ok(ApplyReport::default());
        }

        self.conn.execute(
            "DELETE FROM pending_entries WHERE table_name = ?1",
            params![table],
        )?;
        tracing::info!(table, count = parked.len(), "retrying parked entries");
        self.apply_remote(&parked)
    }
}

/// An open local write transaction; data rows and log entries commit or
/// roll back together.
pub struct WriteTxn<'a> {
    tx: rusqlite::Transaction<'a>,
    registry: &'a TableRegistry,
    stream: &'a ChangeStream,
    entries: Vec<ChangeEntry>,
}

impl WriteTxn<'_> {
    /// Insert a new row, capturing every field. Returns the new row's
    /// stable identifier.
    pub fn insert(&mut self, table: &str, fields: FieldMap, at: Timestamp) -> Result<GlobalId> {
        self.ensure_tracked(table)?;
        let target = GlobalId::random();

        self.tx.execute(
            &format!(
                "INSERT INTO {} (global_id, fields) VALUES (?1, ?2)",
                quoted(table)
            ),
            params![
                target.as_bytes(),
                serde_json::Value::Object(fields.clone()).to_string()
            ],
        )?;
        let row_id = self.tx.last_insert_rowid();

        let mut entry = ChangeEntry::insert(table, target, fields, at);
        entry.row_id = Some(row_id);
        self.record(entry)?;
        Ok(target)
    }

    /// Update a row, capturing only the fields in `changed`.
    pub fn update(
        &mut self,
        table: &str,
        target: GlobalId,
        changed: FieldMap,
        at: Timestamp,
    ) -> Result<()> {
        self.ensure_tracked(table)?;

        let row: Option<(i64, String)> = self
            .tx
            .query_row(
                &format!(
                    "SELECT row_id, fields FROM {} WHERE global_id = ?1",
                    quoted(table)
                ),
                params![target.as_bytes()],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let Some((row_id, stored)) = row else {
            return Err(Error::RecordNotFound {
                table: table.to_string(),
                target,
            });
        };

        let mut merged: FieldMap = serde_json::from_str(&stored)
            .map_err(|e| Error::Decode(format!("stored fields: {e}")))?;
        for (name, value) in &changed {
            merged.insert(name.clone(), value.clone());
        }

        self.tx.execute(
            &format!("UPDATE {} SET fields = ?1 WHERE global_id = ?2", quoted(table)),
            params![
                serde_json::Value::Object(merged).to_string(),
                target.as_bytes()
            ],
        )?;

        let mut entry = ChangeEntry::update(table, target, changed, at);
        entry.row_id = Some(row_id);
        self.record(entry)
    }

    /// Delete a row. The row disappears from the data table; the log keeps
    /// the tombstone.
    pub fn delete(&mut self, table: &str, target: GlobalId, at: Timestamp) -> Result<()> {
        self.ensure_tracked(table)?;

        let removed = self.tx.execute(
            &format!("DELETE FROM {} WHERE global_id = ?1", quoted(table)),
            params![target.as_bytes()],
        )?;
        if removed == 0 {
            return Err(Error::RecordNotFound {
                table: table.to_string(),
                target,
            });
        }

        self.record(ChangeEntry::delete(table, target, at))
    }

    /// Commit the transaction and publish one change-stream batch with
    /// every captured entry.
    pub fn commit(self) -> Result<Vec<ChangeEntry>> {
        let WriteTxn {
            tx,
            stream,
            entries,
            ..
        } = self;
        tx.commit()?;
        stream.publish(ChangeBatch {
            entries: entries.clone(),
            origin: BatchOrigin::Local,
        });
        Ok(entries)
    }

    /// Entries captured so far in this transaction.
    pub fn captured(&self) -> &[ChangeEntry] {
        &self.entries
    }

    fn ensure_tracked(&self, table: &str) -> Result<()> {
        if self.registry.contains(table) {
            Ok(())
        } else {
            Err(Error::TableNotRegistered(table.to_string()))
        }
    }

    fn record(&mut self, entry: ChangeEntry) -> Result<()> {
        upsert_meta(&self.tx, &entry.table, entry.target, &RecordVersion::from_entry(&entry))?;
        log::append(&self.tx, &entry)?;
        self.entries.push(entry);
        Ok(())
    }
}

fn create_data_table(conn: &Connection, name: &str) -> Result<()> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {} (
            row_id    INTEGER PRIMARY KEY AUTOINCREMENT,
            global_id BLOB NOT NULL UNIQUE,
            fields    TEXT NOT NULL
        );",
        quoted(name)
    ))?;
    Ok(())
}

fn quoted(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn load_replica_id(conn: &Connection) -> Result<String> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT value FROM sync_meta WHERE key = ?1",
            params![REPLICA_ID_KEY],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(id) = existing {
        return Ok(id);
    }

    let id = GlobalId::random().to_string();
    conn.execute(
        "INSERT INTO sync_meta (key, value) VALUES (?1, ?2)",
        params![REPLICA_ID_KEY, id],
    )?;
    Ok(id)
}

fn read_fields(conn: &Connection, table: &str, target: GlobalId) -> Result<Option<FieldMap>> {
    let stored: Option<String> = conn
        .query_row(
            &format!("SELECT fields FROM {} WHERE global_id = ?1", quoted(table)),
            params![target.as_bytes()],
            |row| row.get(0),
        )
        .optional()?;
    stored
        .map(|s| serde_json::from_str(&s).map_err(|e| Error::Decode(format!("stored fields: {e}"))))
        .transpose()
}

fn read_meta(conn: &Connection, table: &str, target: GlobalId) -> Result<Option<RecordVersion>> {
    let version = conn
        .query_row(
            "SELECT ts, entry_id, deleted FROM record_meta
             WHERE table_name = ?1 AND target = ?2",
            params![table, target.as_bytes()],
            |row| {
                Ok(RecordVersion {
                    timestamp: row.get(0)?,
                    entry_id: log::id_column(row, 1)?,
                    deleted: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(version)
}

fn upsert_meta(
    conn: &Connection,
    table: &str,
    target: GlobalId,
    version: &RecordVersion,
) -> Result<()> {
    conn.execute(
        "INSERT INTO record_meta (table_name, target, ts, entry_id, deleted)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(table_name, target) DO UPDATE SET
            ts = excluded.ts,
            entry_id = excluded.entry_id,
            deleted = excluded.deleted",
        params![
            table,
            target.as_bytes(),
            version.timestamp,
            version.entry_id.as_bytes(),
            version.deleted,
        ],
    )?;
    Ok(())
}

fn apply_entry(conn: &Connection, entry: &ChangeEntry) -> Result<()> {
    match entry.op {
        Op::Insert => {
            conn.execute(
                &format!(
                    "INSERT INTO {} (global_id, fields) VALUES (?1, ?2)
                     ON CONFLICT(global_id) DO UPDATE SET fields = excluded.fields",
                    quoted(&entry.table)
                ),
                params![
                    entry.target.as_bytes(),
                    serde_json::Value::Object(entry.fields.clone()).to_string()
                ],
            )?;
        }
        Op::Update => {
            let merged = match read_fields(conn, &entry.table, entry.target)? {
                Some(mut stored) => {
                    for (name, value) in &entry.fields {
                        stored.insert(name.clone(), value.clone());
                    }
                    stored
                }
                // Partial state from a transitively-relayed update; the
                // matching insert will not arrive out of order from the
                // same origin, so keep what we have.
                None => entry.fields.clone(),
            };
            conn.execute(
                &format!(
                    "INSERT INTO {} (global_id, fields) VALUES (?1, ?2)
                     ON CONFLICT(global_id) DO UPDATE SET fields = excluded.fields",
                    quoted(&entry.table)
                ),
                params![
                    entry.target.as_bytes(),
                    serde_json::Value::Object(merged).to_string()
                ],
            )?;
        }
        Op::Delete => {
            conn.execute(
                &format!("DELETE FROM {} WHERE global_id = ?1", quoted(&entry.table)),
                params![entry.target.as_bytes()],
            )?;
        }
    }
    upsert_meta(conn, &entry.table, entry.target, &RecordVersion::from_entry(entry))
}

fn park_entry(conn: &Connection, entry: &ChangeEntry) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO pending_entries (global_id, table_name, op, target, fields, ts)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            entry.global_id.as_bytes(),
            entry.table,
            entry.op.code(),
            entry.target.as_bytes(),
            serde_json::Value::Object(entry.fields.clone()).to_string(),
            entry.timestamp,
        ],
    )?;
    Ok(())
}

fn parked_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChangeEntry> {
    let global_id = log::id_column(row, 0)?;
    let table: String = row.get(1)?;
    let op_code: u8 = row.get(2)?;
    let target = log::id_column(row, 3)?;
    let fields_json: String = row.get(4)?;
    let timestamp: f64 = row.get(5)?;

    let op = Op::from_code(op_code).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Integer,
            format!("invalid op {op_code}").into(),
        )
    })?;
    let fields = serde_json::from_str(&fields_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Text,
            format!("invalid fields: {e}").into(),
        )
    })?;

    Ok(ChangeEntry {
        global_id,
        table,
        op,
        target,
        row_id: None,
        fields,
        timestamp,
        synced: true,
    })
}
