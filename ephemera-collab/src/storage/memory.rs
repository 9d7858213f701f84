//! In-memory storage for tests and throwaway deployments.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{Storage, StoreError};
use crate::document::DocumentKey;

#[derive(Default)]
struct Tables {
    records: HashMap<DocumentKey, HashMap<String, Vec<u8>>>,
    alarms: HashMap<DocumentKey, u64>,
}

/// HashMap-backed [`Storage`] with write accounting.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    writes: AtomicU64,
    fail_writes: AtomicBool,
    fail_alarms: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `put` batches so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Make every subsequent write fail (simulates an unavailable backend).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make only alarm writes fail.
    pub fn set_fail_alarms(&self, fail: bool) {
        self.fail_alarms.store(fail, Ordering::SeqCst);
    }

    /// Number of records currently stored for a document.
    pub fn record_count(&self, doc: DocumentKey) -> usize {
        self.read()
            .map(|t| t.records.get(&doc).map_or(0, HashMap::len))
            .unwrap_or(0)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, StoreError> {
        self.tables
            .read()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes disabled".into()));
        }
        self.tables
            .write()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
    }
}

impl Storage for MemoryStore {
    fn get(&self, doc: DocumentKey, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .read()?
            .records
            .get(&doc)
            .and_then(|records| records.get(name))
            .cloned())
    }

    fn put(&self, doc: DocumentKey, entries: &[(&str, &[u8])]) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        let records = tables.records.entry(doc).or_default();
        for (name, value) in entries {
            records.insert((*name).to_string(), value.to_vec());
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn delete_all(&self, doc: DocumentKey) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        tables.records.remove(&doc);
        tables.alarms.remove(&doc);
        Ok(())
    }

    fn put_alarm(&self, doc: DocumentKey, at_ms: u64) -> Result<(), StoreError> {
        if self.fail_alarms.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("alarm writes disabled".into()));
        }
        self.write()?.alarms.insert(doc, at_ms);
        Ok(())
    }

    fn delete_alarm(&self, doc: DocumentKey) -> Result<(), StoreError> {
        self.write()?.alarms.remove(&doc);
        Ok(())
    }

    fn alarms(&self) -> Result<Vec<(DocumentKey, u64)>, StoreError> {
        Ok(self.read()?.alarms.iter().map(|(k, at)| (*k, *at)).collect())
    }
}
