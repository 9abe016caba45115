//! Datasets: one authoritative store plus one peer set per dataset.
//!
//! The hub lazily opens a dataset the first time a replica connects to
//! it. Each dataset is fully isolated - its own SQLite database, its own
//! connections - so many datasets share one relay process without
//! cross-talk. Concurrent writers to one dataset serialize through the
//! store's mutex and the SQLite transaction beneath it, so the resolver
//! always sees a consistent snapshot.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use ferry_engine::{
    log, resolve, ChangeEntry, GlobalId, Op, RecordVersion, Resolution, Result,
};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use crate::peer::PeerSet;

const RELAY_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS records (
    table_name TEXT NOT NULL,
    target     BLOB NOT NULL,
    fields     TEXT NOT NULL,
    ts         REAL NOT NULL,
    entry_id   BLOB NOT NULL,
    deleted    INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (table_name, target)
);
";

/// Outcome of ingesting one inbound batch.
#[derive(Debug, Default)]
pub struct Ingest {
    /// Every entry durably received: applied, rejected, or duplicate.
    /// These global ids go back to the sender as the acknowledgment.
    pub processed: Vec<GlobalId>,
    /// Entries that won resolution; these are persisted to the relay log
    /// and rebroadcast to the other replicas.
    pub accepted: Vec<ChangeEntry>,
}

/// The authoritative store for one dataset.
pub struct RelayStore {
    conn: Connection,
}

impl RelayStore {
    /// Open (or create) a dataset database on disk.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_conn(Connection::open(path)?)
    }

    /// Open an in-memory dataset, mostly for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_conn(Connection::open_in_memory()?)
    }

    fn from_conn(conn: Connection) -> Result<Self> {
        log::init(&conn)?;
        conn.execute_batch(RELAY_SCHEMA)?;
        Ok(Self { conn })
    }

    /// Apply one inbound batch in one transaction.
    ///
    /// Duplicates (redelivered after a reconnect) are acknowledged again
    /// without being re-applied or rebroadcast. Entries that lose
    /// resolution are acknowledged - receipt, not acceptance - and kept
    /// out of the authoritative history; the losing replica converges by
    /// applying the winner it receives in turn.
    pub fn apply(&mut self, entries: &[ChangeEntry]) -> Result<Ingest> {
        let tx = self.conn.transaction()?;
        let mut ingest = Ingest::default();

        for entry in entries {
            if log::contains(&tx, entry.global_id)? {
                ingest.processed.push(entry.global_id);
                continue;
            }

            let current = read_version(&tx, &entry.table, entry.target)?;
            match resolve(entry, current.as_ref()) {
                Resolution::Apply => {
                    let mut accepted = entry.clone();
                    accepted.row_id = None;
                    accepted.synced = true;
                    apply_record(&tx, &accepted)?;
                    log::append(&tx, &accepted)?;
                    ingest.processed.push(entry.global_id);
                    ingest.accepted.push(accepted);
                }
                Resolution::Reject | Resolution::Skip => {
                    ingest.processed.push(entry.global_id);
                }
            }
        }

        tx.commit()?;
        Ok(ingest)
    }

    /// Entries after the given watermark, in creation order, for catch-up.
    pub fn entries_after(&self, watermark: Option<GlobalId>) -> Result<Vec<ChangeEntry>> {
        log::entries_after(&self.conn, watermark)
    }

    /// Total entries in the authoritative log.
    pub fn log_len(&self) -> Result<u64> {
        log::len(&self.conn)
    }
}

fn read_version(
    conn: &Connection,
    table: &str,
    target: GlobalId,
) -> Result<Option<RecordVersion>> {
    let version = conn
        .query_row(
            "SELECT ts, entry_id, deleted FROM records
             WHERE table_name = ?1 AND target = ?2",
            params![table, target.as_bytes()],
            |row| {
                Ok(RecordVersion {
                    timestamp: row.get(0)?,
                    entry_id: id_column(row, 1)?,
                    deleted: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(version)
}

fn id_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<GlobalId> {
    let bytes: Vec<u8> = row.get(idx)?;
    let raw: [u8; 16] = bytes.try_into().map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Blob,
            "invalid global id length".into(),
        )
    })?;
    Ok(GlobalId::from_bytes(raw))
}

fn apply_record(conn: &Connection, entry: &ChangeEntry) -> Result<()> {
    let fields = match entry.op {
        Op::Insert => serde_json::Value::Object(entry.fields.clone()).to_string(),
        Op::Update => {
            let stored: Option<String> = conn
                .query_row(
                    "SELECT fields FROM records WHERE table_name = ?1 AND target = ?2",
                    params![entry.table, entry.target.as_bytes()],
                    |row| row.get(0),
                )
                .optional()?;
            let mut merged: ferry_engine::FieldMap = match stored {
                Some(json) => serde_json::from_str(&json)
                    .map_err(|e| ferry_engine::Error::Decode(format!("stored fields: {e}")))?,
                None => ferry_engine::FieldMap::new(),
            };
            for (name, value) in &entry.fields {
                merged.insert(name.clone(), value.clone());
            }
            serde_json::Value::Object(merged).to_string()
        }
        // Tombstone rows keep resolver state but carry no data.
        Op::Delete => "{}".to_string(),
    };

    conn.execute(
        "INSERT INTO records (table_name, target, fields, ts, entry_id, deleted)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(table_name, target) DO UPDATE SET
            fields = excluded.fields,
            ts = excluded.ts,
            entry_id = excluded.entry_id,
            deleted = excluded.deleted",
        params![
            entry.table,
            entry.target.as_bytes(),
            fields,
            entry.timestamp,
            entry.global_id.as_bytes(),
            entry.is_delete(),
        ],
    )?;
    Ok(())
}

/// One dataset: its store and its connected replicas.
pub struct Dataset {
    pub name: String,
    pub peers: PeerSet,
    pub store: Mutex<RelayStore>,
}

/// Opens and caches datasets by name.
pub struct DatasetHub {
    /// `None` keeps datasets in memory (tests)
    data_dir: Option<PathBuf>,
    datasets: DashMap<String, Arc<Dataset>>,
}

impl DatasetHub {
    /// A hub persisting each dataset under `data_dir`.
    pub fn new(data_dir: PathBuf) -> std::io::Result<Self> {
        std::fs::create_dir_all(&data_dir)?;
        Ok(Self {
            data_dir: Some(data_dir),
            datasets: DashMap::new(),
        })
    }

    /// A hub keeping every dataset in memory.
    pub fn in_memory() -> Self {
        Self {
            data_dir: None,
            datasets: DashMap::new(),
        }
    }

    /// Get a dataset, opening its store on first use.
    pub fn get_or_open(&self, name: &str) -> Result<Arc<Dataset>> {
        if let Some(existing) = self.datasets.get(name) {
            return Ok(existing.clone());
        }

        let store = match &self.data_dir {
            Some(dir) => RelayStore::open(dir.join(format!("{name}.db")))?,
            None => RelayStore::open_in_memory()?,
        };
        let dataset = Arc::new(Dataset {
            name: name.to_string(),
            peers: PeerSet::new(),
            store: Mutex::new(store),
        });

        // First insert wins if two connections race the open.
        let entry = self
            .datasets
            .entry(name.to_string())
            .or_insert(dataset);
        Ok(entry.clone())
    }

    /// Number of open datasets.
    pub fn len(&self) -> usize {
        self.datasets.len()
    }

    /// Whether no dataset has been opened.
    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }
}

/// Dataset names become file names; keep them to a safe alphabet.
pub fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: serde_json::Value) -> ferry_engine::FieldMap {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn apply_persists_and_accepts() {
        let mut store = RelayStore::open_in_memory().unwrap();
        let entry = ChangeEntry::insert("notes", GlobalId::random(), fields(json!({"v": 1})), 100.0);

        let ingest = store.apply(std::slice::from_ref(&entry)).unwrap();
        assert_eq!(ingest.processed, vec![entry.global_id]);
        assert_eq!(ingest.accepted.len(), 1);
        assert_eq!(store.log_len().unwrap(), 1);
    }

    #[test]
    fn redelivery_is_acked_but_not_rebroadcast() {
        let mut store = RelayStore::open_in_memory().unwrap();
        let entry = ChangeEntry::insert("notes", GlobalId::random(), fields(json!({"v": 1})), 100.0);

        store.apply(std::slice::from_ref(&entry)).unwrap();
        let again = store.apply(std::slice::from_ref(&entry)).unwrap();

        assert_eq!(again.processed, vec![entry.global_id]);
        assert!(again.accepted.is_empty());
        assert_eq!(store.log_len().unwrap(), 1);
    }

    #[test]
    fn stale_entry_is_acked_but_kept_out_of_history() {
        let mut store = RelayStore::open_in_memory().unwrap();
        let target = GlobalId::random();

        let insert = ChangeEntry::insert("notes", target, fields(json!({"v": 1})), 100.0);
        let newer = ChangeEntry::update("notes", target, fields(json!({"v": 2})), 200.0);
        let stale = ChangeEntry::update("notes", target, fields(json!({"v": 3})), 150.0);

        store.apply(&[insert, newer]).unwrap();
        let ingest = store.apply(std::slice::from_ref(&stale)).unwrap();

        assert_eq!(ingest.processed, vec![stale.global_id]);
        assert!(ingest.accepted.is_empty());
        assert_eq!(store.log_len().unwrap(), 2);
    }

    #[test]
    fn catch_up_is_in_creation_order() {
        let mut store = RelayStore::open_in_memory().unwrap();
        let a = ChangeEntry::insert("notes", GlobalId::random(), fields(json!({"v": 1})), 100.0);
        let b = ChangeEntry::insert("notes", GlobalId::random(), fields(json!({"v": 2})), 90.0);
        store.apply(&[a.clone(), b.clone()]).unwrap();

        let all = store.entries_after(None).unwrap();
        assert_eq!(
            all.iter().map(|e| e.global_id).collect::<Vec<_>>(),
            vec![a.global_id, b.global_id]
        );

        let tail = store.entries_after(Some(a.global_id)).unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].global_id, b.global_id);
    }

    #[test]
    fn delete_tombstone_blocks_stale_reinsert() {
        let mut store = RelayStore::open_in_memory().unwrap();
        let target = GlobalId::random();

        let insert = ChangeEntry::insert("notes", target, fields(json!({"v": 1})), 100.0);
        let tombstone = ChangeEntry::delete("notes", target, 300.0);
        store.apply(&[insert, tombstone]).unwrap();

        let late_edit = ChangeEntry::update("notes", target, fields(json!({"v": 9})), 250.0);
        let ingest = store.apply(std::slice::from_ref(&late_edit)).unwrap();
        assert!(ingest.accepted.is_empty());
        assert_eq!(ingest.processed, vec![late_edit.global_id]);
    }

    #[test]
    fn hub_isolates_datasets() {
        let hub = DatasetHub::in_memory();
        let a = hub.get_or_open("team-a").unwrap();
        let b = hub.get_or_open("team-b").unwrap();
        assert_eq!(hub.len(), 2);

        let entry = ChangeEntry::insert("notes", GlobalId::random(), fields(json!({"v": 1})), 1.0);
        futures::executor::block_on(async {
            a.store.lock().await.apply(std::slice::from_ref(&entry)).unwrap();
            assert_eq!(a.store.lock().await.log_len().unwrap(), 1);
            assert_eq!(b.store.lock().await.log_len().unwrap(), 0);
        });

        // Reopening by name returns the same dataset.
        let again = hub.get_or_open("team-a").unwrap();
        assert!(Arc::ptr_eq(&a, &again));
    }

    #[test]
    fn dataset_log_survives_hub_restart() {
        let dir = tempfile::tempdir().unwrap();
        let entry =
            ChangeEntry::insert("notes", GlobalId::random(), fields(json!({"v": 1})), 100.0);

        {
            let hub = DatasetHub::new(dir.path().to_path_buf()).unwrap();
            let dataset = hub.get_or_open("team-a").unwrap();
            futures::executor::block_on(async {
                dataset
                    .store
                    .lock()
                    .await
                    .apply(std::slice::from_ref(&entry))
                    .unwrap();
            });
        }

        // A fresh hub reopens the same database file and can still serve
        // full-history catch-up from it.
        let hub = DatasetHub::new(dir.path().to_path_buf()).unwrap();
        let dataset = hub.get_or_open("team-a").unwrap();
        futures::executor::block_on(async {
            let store = dataset.store.lock().await;
            assert_eq!(store.log_len().unwrap(), 1);
            let replayed = store.entries_after(None).unwrap();
            assert_eq!(replayed[0].global_id, entry.global_id);
        });
    }

    #[test]
    fn dataset_names_are_restricted() {
        assert!(valid_name("team-a_1"));
        assert!(!valid_name(""));
        assert!(!valid_name("../escape"));
        assert!(!valid_name("a b"));
    }
}
