//! The durable change log.
//!
//! An append-only sequence of [`ChangeEntry`] rows persisted in the same
//! SQLite database as the data they describe, so capture and data writes
//! commit or roll back together. `seq` records creation order, the unique
//! index on `global_id` is the dedup key, and `synced` is the only column
//! that ever changes after insert. Entries are never deleted.
//!
//! Every function takes a [`rusqlite::Connection`] so it can run inside a
//! caller-owned transaction; both the replica and the relay store share
//! this table shape, which is what lets a third replica catch up
//! transitively from entries another replica downloaded.

use crate::{ChangeEntry, Error, GlobalId, Op, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};

pub(crate) const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS change_log (
    seq        INTEGER PRIMARY KEY AUTOINCREMENT,
    global_id  BLOB NOT NULL UNIQUE,
    table_name TEXT NOT NULL,
    op         INTEGER NOT NULL,
    target     BLOB NOT NULL,
    row_id     INTEGER,
    fields     TEXT NOT NULL,
    ts         REAL NOT NULL,
    synced     INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS change_log_synced ON change_log(synced);
CREATE INDEX IF NOT EXISTS change_log_target ON change_log(table_name, target);
CREATE TABLE IF NOT EXISTS sync_meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

const WATERMARK_KEY: &str = "watermark";

/// Create the change log tables if they do not exist.
pub fn init(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

/// Append one entry. Returns its sequence number.
pub fn append(conn: &Connection, entry: &ChangeEntry) -> Result<i64> {
    conn.execute(
        "INSERT INTO change_log (global_id, table_name, op, target, row_id, fields, ts, synced)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            entry.global_id.as_bytes(),
            entry.table,
            entry.op.code(),
            entry.target.as_bytes(),
            entry.row_id,
            serde_json::Value::Object(entry.fields.clone()).to_string(),
            entry.timestamp,
            entry.synced,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Whether an entry with this global id has already been logged.
pub fn contains(conn: &Connection, id: GlobalId) -> Result<bool> {
    let found: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM change_log WHERE global_id = ?1)",
        params![id.as_bytes()],
        |row| row.get(0),
    )?;
    Ok(found)
}

/// All entries not yet acknowledged by the relay, in creation order.
pub fn unsynchronized(conn: &Connection) -> Result<Vec<ChangeEntry>> {
    select_entries(
        conn,
        "SELECT global_id, table_name, op, target, row_id, fields, ts, synced
         FROM change_log WHERE synced = 0 ORDER BY seq ASC",
        params![],
    )
}

/// Flip the synced flag for the given entries. Returns how many rows
/// actually changed.
pub fn mark_synchronized(conn: &Connection, ids: &[GlobalId]) -> Result<usize> {
    let mut stmt =
        conn.prepare_cached("UPDATE change_log SET synced = 1 WHERE global_id = ?1")?;
    let mut changed = 0;
    for id in ids {
        changed += stmt.execute(params![id.as_bytes()])?;
    }
    Ok(changed)
}

/// Entries created after the given watermark, in creation order.
///
/// `None` - and a watermark this log has never seen - both mean full
/// history; receiver-side dedup makes over-delivery harmless.
pub fn entries_after(conn: &Connection, watermark: Option<GlobalId>) -> Result<Vec<ChangeEntry>> {
    let since_seq = match watermark {
        Some(id) => conn
            .query_row(
                "SELECT seq FROM change_log WHERE global_id = ?1",
                params![id.as_bytes()],
                |row| row.get::<_, i64>(0),
            )
            .optional()?,
        None => None,
    };

    select_entries(
        conn,
        "SELECT global_id, table_name, op, target, row_id, fields, ts, synced
         FROM change_log WHERE seq > ?1 ORDER BY seq ASC",
        params![since_seq.unwrap_or(0)],
    )
}

/// Total number of logged entries.
pub fn len(conn: &Connection) -> Result<u64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM change_log", [], |row| row.get(0))?;
    Ok(count as u64)
}

/// The global id of the last relay entry this replica applied, if any.
pub fn watermark(conn: &Connection) -> Result<Option<GlobalId>> {
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM sync_meta WHERE key = ?1",
            params![WATERMARK_KEY],
            |row| row.get(0),
        )
        .optional()?;

    value
        .map(|s| GlobalId::parse(&s).map_err(|_| Error::Decode(format!("bad watermark: {s}"))))
        .transpose()
}

/// Persist the watermark.
pub fn set_watermark(conn: &Connection, id: GlobalId) -> Result<()> {
    conn.execute(
        "INSERT INTO sync_meta (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![WATERMARK_KEY, id.to_string()],
    )?;
    Ok(())
}

fn select_entries(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<ChangeEntry>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt.query_map(params, entry_from_row)?;

    let mut entries = Vec::new();
    for row in rows {
        entries.push(row?);
    }
    Ok(entries)
}

pub(crate) fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<ChangeEntry> {
    let global_id = id_column(row, 0)?;
    let table: String = row.get(1)?;
    let op_code: u8 = row.get(2)?;
    let target = id_column(row, 3)?;
    let row_id: Option<i64> = row.get(4)?;
    let fields_json: String = row.get(5)?;
    let timestamp: f64 = row.get(6)?;
    let synced: bool = row.get(7)?;

    let op = Op::from_code(op_code).ok_or_else(|| bad_column(2, format!("op {op_code}")))?;
    let fields = serde_json::from_str(&fields_json)
        .map_err(|e| bad_column(5, format!("fields: {e}")))?;

    Ok(ChangeEntry {
        global_id,
        table,
        op,
        target,
        row_id,
        fields,
        timestamp,
        synced,
    })
}

pub(crate) fn id_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<GlobalId> {
    let bytes: Vec<u8> = row.get(idx)?;
    let raw: [u8; 16] = bytes
        .try_into()
        .map_err(|_| bad_column(idx, "global id length".into()))?;
    Ok(GlobalId::from_bytes(raw))
}

fn bad_column(idx: usize, what: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Blob,
        format!("invalid {what}").into(),
    )
}
