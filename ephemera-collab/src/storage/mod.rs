//! Durable per-document records.
//!
//! Architecture:
//! ```text
//! ┌───────────────┐  get / put / delete_all  ┌───────────────────────────┐
//! │ DocumentActor │ ───────────────────────► │ Storage                   │
//! └───────────────┘                          │  records: <key:16><name>  │
//! ┌───────────────┐  put_alarm / alarms      │  alarms:  <key:16> → at   │
//! │AlarmScheduler │ ───────────────────────► │                           │
//! └───────────────┘                          └───────────────────────────┘
//! ```
//!
//! Every record belongs to exactly one document key. `put` is atomic across
//! all of its entries, which is what keeps `meta` and `state` consistent.

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

use crate::document::DocumentKey;

/// Record holding the bincode-encoded [`DocumentMeta`](crate::document::DocumentMeta).
pub const META_KEY: &str = "meta";
/// Record holding the full CRDT state blob.
pub const STATE_KEY: &str = "state";

/// Storage errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Key-value storage scoped by document.
pub trait Storage: Send + Sync + 'static {
    /// Read one named record of a document.
    fn get(&self, doc: DocumentKey, name: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Write several named records of a document in one atomic batch.
    fn put(&self, doc: DocumentKey, entries: &[(&str, &[u8])]) -> Result<(), StoreError>;

    /// Remove every record of a document, including its alarm.
    fn delete_all(&self, doc: DocumentKey) -> Result<(), StoreError>;

    /// Persist the wake-up time of a document, replacing any previous one.
    fn put_alarm(&self, doc: DocumentKey, at_ms: u64) -> Result<(), StoreError>;

    fn delete_alarm(&self, doc: DocumentKey) -> Result<(), StoreError>;

    /// All persisted alarms, used to re-arm timers on startup.
    fn alarms(&self) -> Result<Vec<(DocumentKey, u64)>, StoreError>;
}
