//! RocksDB-backed persistent storage.
//!
//! Column families:
//! - `records`: named per-document records, LZ4 compressed,
//!   keyed by `<doc_key:16 bytes><name>`
//! - `alarms` : pending wake-up time per document, keyed by `<doc_key:16 bytes>`,
//!   value is the time in ms (8 bytes big-endian)
//!
//! The 16-byte document prefix lets `delete_all` find every record of a
//! document with one forward scan.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use std::path::{Path, PathBuf};

use super::{Storage, StoreError};
use crate::document::DocumentKey;

const CF_RECORDS: &str = "records";
const CF_ALARMS: &str = "alarms";

const COLUMN_FAMILIES: &[&str] = &[CF_RECORDS, CF_ALARMS];

/// Length of the document-key prefix of every stored key.
const KEY_PREFIX_LEN: usize = 16;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("ephemera_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, caller-provided directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// RocksDB-backed [`Storage`].
pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open the store at the configured path, creating it if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.set_max_total_wal_size(64 * 1024 * 1024);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened document store at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_RECORDS => {
                // Values are already LZ4 framed by us
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(
                    KEY_PREFIX_LEN,
                ));
            }
            CF_ALARMS => {
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn write_opts(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }

    /// `<doc_key:16 bytes><name>`
    fn record_key(doc: DocumentKey, name: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(KEY_PREFIX_LEN + name.len());
        key.extend_from_slice(doc.as_bytes());
        key.extend_from_slice(name.as_bytes());
        key
    }
}

impl Storage for RocksStore {
    fn get(&self, doc: DocumentKey, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_RECORDS)?;
        match self.db.get_cf(cf, Self::record_key(doc, name))? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map(Some)
                .map_err(|e| StoreError::Compression(e.to_string())),
            None => Ok(None),
        }
    }

    fn put(&self, doc: DocumentKey, entries: &[(&str, &[u8])]) -> Result<(), StoreError> {
        let cf = self.cf(CF_RECORDS)?;
        let mut batch = WriteBatch::default();
        for (name, value) in entries {
            let compressed = lz4_flex::compress_prepend_size(value);
            batch.put_cf(cf, Self::record_key(doc, name), compressed);
        }
        self.db.write_opt(batch, &self.write_opts())?;
        Ok(())
    }

    fn delete_all(&self, doc: DocumentKey) -> Result<(), StoreError> {
        let cf_records = self.cf(CF_RECORDS)?;
        let cf_alarms = self.cf(CF_ALARMS)?;
        let prefix = doc.as_bytes();

        let mut batch = WriteBatch::default();
        let iter = self
            .db
            .iterator_cf(cf_records, IteratorMode::From(prefix, Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            if key.len() < KEY_PREFIX_LEN || &key[..KEY_PREFIX_LEN] != prefix {
                break;
            }
            batch.delete_cf(cf_records, &key);
        }
        batch.delete_cf(cf_alarms, prefix);

        self.db.write_opt(batch, &self.write_opts())?;
        Ok(())
    }

    fn put_alarm(&self, doc: DocumentKey, at_ms: u64) -> Result<(), StoreError> {
        let cf = self.cf(CF_ALARMS)?;
        self.db
            .put_cf_opt(cf, doc.as_bytes(), at_ms.to_be_bytes(), &self.write_opts())?;
        Ok(())
    }

    fn delete_alarm(&self, doc: DocumentKey) -> Result<(), StoreError> {
        let cf = self.cf(CF_ALARMS)?;
        self.db.delete_cf_opt(cf, doc.as_bytes(), &self.write_opts())?;
        Ok(())
    }

    fn alarms(&self) -> Result<Vec<(DocumentKey, u64)>, StoreError> {
        let cf = self.cf(CF_ALARMS)?;
        let mut alarms = Vec::new();

        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = item?;
            let key: [u8; KEY_PREFIX_LEN] = key
                .as_ref()
                .try_into()
                .map_err(|_| StoreError::Deserialization("Invalid alarm key".into()))?;
            let at: [u8; 8] = value
                .as_ref()
                .try_into()
                .map_err(|_| StoreError::Deserialization("Invalid alarm value".into()))?;
            alarms.push((
                DocumentKey::from_uuid(uuid::Uuid::from_bytes(key)),
                u64::from_be_bytes(at),
            ));
        }

        Ok(alarms)
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{META_KEY, STATE_KEY};

    fn open_temp() -> (tempfile::TempDir, RocksStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        (dir, store)
    }

    #[test]
    fn test_store_open() {
        let (_dir, store) = open_temp();
        assert!(store.path().exists());
    }

    #[test]
    fn test_put_get_records() {
        let (_dir, store) = open_temp();
        let doc = DocumentKey::from_name("doc");

        store.put(doc, &[(META_KEY, &b"meta-bytes"[..]), (STATE_KEY, &b"state-bytes"[..])]).unwrap();
        assert_eq!(store.get(doc, META_KEY).unwrap(), Some(b"meta-bytes".to_vec()));
        assert_eq!(store.get(doc, STATE_KEY).unwrap(), Some(b"state-bytes".to_vec()));
        assert_eq!(store.get(doc, "other").unwrap(), None);
    }

    #[test]
    fn test_missing_document() {
        let (_dir, store) = open_temp();
        assert_eq!(store.get(DocumentKey::from_name("nope"), META_KEY).unwrap(), None);
    }

    #[test]
    fn test_delete_all_is_scoped() {
        let (_dir, store) = open_temp();
        let a = DocumentKey::from_name("a");
        let b = DocumentKey::from_name("b");

        store.put(a, &[(META_KEY, &b"a"[..]), (STATE_KEY, &b"a"[..])]).unwrap();
        store.put(b, &[(META_KEY, &b"b"[..]), (STATE_KEY, &b"b"[..])]).unwrap();
        store.put_alarm(a, 100).unwrap();
        store.put_alarm(b, 200).unwrap();

        store.delete_all(a).unwrap();
        assert_eq!(store.get(a, META_KEY).unwrap(), None);
        assert_eq!(store.get(a, STATE_KEY).unwrap(), None);
        assert_eq!(store.get(b, STATE_KEY).unwrap(), Some(b"b".to_vec()));
        assert_eq!(store.alarms().unwrap(), vec![(b, 200)]);
    }

    #[test]
    fn test_alarm_overwrite_and_delete() {
        let (_dir, store) = open_temp();
        let doc = DocumentKey::from_name("doc");

        store.put_alarm(doc, 1_000).unwrap();
        store.put_alarm(doc, 2_000).unwrap();
        assert_eq!(store.alarms().unwrap(), vec![(doc, 2_000)]);

        store.delete_alarm(doc).unwrap();
        assert!(store.alarms().unwrap().is_empty());
    }

    #[test]
    fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let doc = DocumentKey::from_name("durable");
        {
            let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
            store.put(doc, &[(STATE_KEY, &[7u8; 4096][..])]).unwrap();
            store.put_alarm(doc, 42).unwrap();
        }
        let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        assert_eq!(store.get(doc, STATE_KEY).unwrap(), Some(vec![7u8; 4096]));
        assert_eq!(store.alarms().unwrap(), vec![(doc, 42)]);
    }

    #[test]
    fn test_large_record() {
        let (_dir, store) = open_temp();
        let doc = DocumentKey::from_name("large");
        let data = vec![42u8; 1_000_000];

        store.put(doc, &[(STATE_KEY, data.as_slice())]).unwrap();
        let loaded = store.get(doc, STATE_KEY).unwrap().unwrap();
        assert_eq!(loaded.len(), 1_000_000);
        assert_eq!(loaded[999_999], 42);
    }

    #[test]
    fn test_store_config_default() {
        let config = StoreConfig::default();
        assert_eq!(config.bloom_filter_bits, 10);
        assert!(!config.sync_writes);
    }
}
