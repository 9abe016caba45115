//! # Ferry Engine
//!
//! Change-capture and replication for embedded SQLite stores.
//!
//! Every mutation on a tracked table is captured as an ordered, durable
//! change-log entry in the same transaction as the data it describes, and
//! replicated to other replicas through a relay over a binary WebSocket
//! protocol. Replicas that apply the same set of entries converge: the
//! resolver picks winners by timestamp with a global-id tiebreak, so the
//! outcome is identical regardless of delivery order.
//!
//! ## Core Concepts
//!
//! ### Change entries
//!
//! One [`ChangeEntry`] per committed insert, update, or delete, carrying a
//! unique [`GlobalId`], the target row's stable id, the changed fields,
//! and the capture timestamp. Link-table rows replicate exactly like
//! entity rows.
//!
//! ### The replica
//!
//! A [`Replica`] owns the SQLite database: tracked data tables, the
//! append-only change log, and the resolver's per-record state. Local
//! writes go through [`Replica::begin_write`]; remote entries through
//! [`Replica::apply_remote`].
//!
//! ### The change stream
//!
//! Observers call [`Replica::subscribe`] and receive exactly one
//! [`ChangeBatch`] per commit, whether the commit was a local write or the
//! application of a remote batch.
//!
//! ### The synchronizer
//!
//! [`Synchronizer::spawn`] runs the connection to a relay: uploads
//! unsynchronized entries in creation order, applies downloads through
//! the resolver, tracks the watermark, and reconnects with backoff.
//! Local operations never block while disconnected.
//!
//! ## Quick Start
//!
//! ```rust
//! use ferry_engine::{Replica, TableDef, TableRegistry};
//! use serde_json::json;
//!
//! let registry = TableRegistry::new().with_table(TableDef::entity("notes"));
//! let mut replica = Replica::open_in_memory(registry).unwrap();
//!
//! let mut write = replica.begin_write().unwrap();
//! let fields = json!({"title": "hello"}).as_object().unwrap().clone();
//! let id = write.insert("notes", fields, Replica::now()).unwrap();
//! write.commit().unwrap();
//!
//! assert!(replica.get("notes", id).unwrap().is_some());
//! assert_eq!(replica.unsynchronized().unwrap().len(), 1);
//! ```

pub mod entry;
pub mod error;
pub mod log;
pub mod replica;
pub mod resolve;
pub mod schema;
pub mod stream;
pub mod sync;
pub mod wire;

// Re-export main types at crate root
pub use entry::{ChangeEntry, FieldMap, GlobalId, Op};
pub use error::{Error, Result};
pub use replica::{ApplyReport, Replica, WriteTxn};
pub use resolve::{resolve, RecordVersion, Resolution};
pub use schema::{TableDef, TableKind, TableRegistry};
pub use stream::{BatchOrigin, ChangeBatch, ChangeStream, StreamError, Subscription};
pub use sync::{SyncOptions, SyncStatus, Synchronizer};
pub use wire::Frame;

/// Wall-clock seconds since epoch, the conflict-resolution ordering key.
pub type Timestamp = f64;
