//! Namespaced keys, payload compression, pipelined bulk operations, namespace
//! snapshots and keyspace change notifications over a Redis-compatible store.

pub mod bulk;
pub mod client;
pub mod config;
pub mod error;
pub mod keys;
pub mod notify;
pub mod snapshot;
pub mod stats;
pub mod store;
pub mod transform;

pub use bulk::{chunked, BulkExecutor, EntryOutcome};
pub use client::{Pipeline, Stash};
pub use config::{ConnectionConfig, ConnectionTarget, StashConfig};
pub use error::{Error, Result};
pub use keys::KeyCodec;
pub use notify::{ChangeEvent, ChangeKind, NotificationRouter, RouterState};
pub use snapshot::{CleanSnapshot, Snapshot, SnapshotEngine, SnapshotFormat};
pub use stats::PerformanceStats;
pub use store::{Command, KvStore, MemoryStore, RedisStore, Reply, ValueType};
pub use transform::{parse_if_json, ValueCodec};
