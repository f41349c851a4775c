//! Thin RocksDB wrapper.
//!
//! Pure key-value plumbing with column families; no domain logic. The index
//! in [`crate::store::index`] builds its tables on top of this.

use crate::error::{Result, WeftError};
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, MultiThreaded, Options,
};
use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{trace, warn};

/// RocksDB tuning knobs.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Maximum number of open files.
    pub max_open_files: i32,
    /// Maximum WAL size in bytes.
    pub max_wal_size: u64,
    /// Write buffer size in bytes.
    pub write_buffer_size: usize,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            max_open_files: 128,
            max_wal_size: 16 * 1024 * 1024,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl DbConfig {
    fn build_options(&self) -> Options {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.set_max_open_files(self.max_open_files);
        opts.set_max_total_wal_size(self.max_wal_size);
        opts.set_write_buffer_size(self.write_buffer_size);
        opts.increase_parallelism(num_cpus::get() as i32);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }
}

/// Builds a composite key `{part1}:{part2}` for prefix iteration.
pub fn composite_key(part1: &[u8], part2: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(part1.len() + 1 + part2.len());
    key.extend_from_slice(part1);
    key.push(b':');
    key.extend_from_slice(part2);
    key
}

/// A handle to an open database with named column families.
pub struct DbHandle {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
}

impl DbHandle {
    /// Opens (or creates) a database with the given column families.
    pub fn open(
        path: impl AsRef<Path>,
        config: &DbConfig,
        column_families: &[&str],
    ) -> Result<Self> {
        let opts = config.build_options();
        let cf_opts = Options::default();

        let descriptors: Vec<_> = column_families
            .iter()
            .map(|cf| ColumnFamilyDescriptor::new(*cf, cf_opts.clone()))
            .collect();

        let db =
            DBWithThreadMode::<MultiThreaded>::open_cf_descriptors(&opts, path.as_ref(), descriptors)
                .map_err(|e| WeftError::storage(format!("Failed to open database: {}", e)))?;

        Ok(Self { db: Arc::new(db) })
    }

    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| WeftError::storage(format!("Column family '{}' not found", name)))
    }

    /// Stores a serializable value at the given key.
    pub fn put<T: Serialize>(&self, cf_name: &str, key: &[u8], value: &T) -> Result<()> {
        let cf = self.cf(cf_name)?;
        let bytes = bincode::serialize(value)
            .map_err(|e| WeftError::serialization(format!("Failed to serialize row: {}", e)))?;

        trace!(cf = cf_name, key_len = key.len(), value_bytes = bytes.len(), "db put");

        self.db
            .put_cf(&cf, key, &bytes)
            .map_err(|e| WeftError::storage(format!("Failed to write: {}", e)))
    }

    /// Loads and deserializes a value from the given key.
    pub fn get<T: DeserializeOwned>(&self, cf_name: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf(cf_name)?;
        match self.db.get_cf(&cf, key) {
            Ok(Some(bytes)) => {
                let value: T = bincode::deserialize(&bytes).map_err(|e| {
                    WeftError::serialization(format!("Failed to deserialize row: {}", e))
                })?;
                Ok(Some(value))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(WeftError::storage(format!("Failed to read: {}", e))),
        }
    }

    /// Stores raw bytes at the given key.
    pub fn put_raw(&self, cf_name: &str, key: &[u8], value: &[u8]) -> Result<()> {
        let cf = self.cf(cf_name)?;
        self.db
            .put_cf(&cf, key, value)
            .map_err(|e| WeftError::storage(format!("Failed to write: {}", e)))
    }

    /// Checks whether a key exists.
    pub fn exists(&self, cf_name: &str, key: &[u8]) -> Result<bool> {
        let cf = self.cf(cf_name)?;
        self.db
            .get_cf(&cf, key)
            .map(|v| v.is_some())
            .map_err(|e| WeftError::storage(format!("Failed to check key: {}", e)))
    }

    /// Deletes a key.
    pub fn delete(&self, cf_name: &str, key: &[u8]) -> Result<()> {
        let cf = self.cf(cf_name)?;
        self.db
            .delete_cf(&cf, key)
            .map_err(|e| WeftError::storage(format!("Failed to delete: {}", e)))
    }

    /// Iterates entries whose key starts with `prefix`, in key order.
    ///
    /// The callback returns `true` to continue or `false` to stop.
    pub fn prefix_iterate<F>(&self, cf_name: &str, prefix: &[u8], mut callback: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        let cf = self.cf(cf_name)?;
        for item in self.db.prefix_iterator_cf(&cf, prefix) {
            match item {
                Ok((key, value)) => {
                    if !key.starts_with(prefix) {
                        break;
                    }
                    if !callback(&key, &value) {
                        break;
                    }
                }
                Err(e) => warn!("Iterator error: {}", e),
            }
        }
        Ok(())
    }

    /// Iterates every entry in a column family, in key order.
    pub fn iterate_all<F>(&self, cf_name: &str, mut callback: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        let cf = self.cf(cf_name)?;
        for item in self.db.iterator_cf(&cf, rocksdb::IteratorMode::Start) {
            match item {
                Ok((key, value)) => {
                    if !callback(&key, &value) {
                        break;
                    }
                }
                Err(e) => warn!("Iterator error: {}", e),
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for DbHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbHandle").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Row {
        name: String,
        value: u64,
    }

    fn open_test_db() -> (DbHandle, TempDir) {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let db = DbHandle::open(dir.path().join("db"), &DbConfig::default(), &["a", "b"])
            .expect("Failed to open db");
        (db, dir)
    }

    #[test]
    fn test_put_and_get() {
        let (db, _dir) = open_test_db();
        let row = Row {
            name: "x".to_string(),
            value: 3,
        };
        db.put("a", b"key", &row).unwrap();
        let loaded: Row = db.get("a", b"key").unwrap().unwrap();
        assert_eq!(loaded, row);
    }

    #[test]
    fn test_missing_key_is_none() {
        let (db, _dir) = open_test_db();
        let loaded: Option<Row> = db.get("a", b"missing").unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_exists_and_delete() {
        let (db, _dir) = open_test_db();
        db.put_raw("b", b"key", b"value").unwrap();
        assert!(db.exists("b", b"key").unwrap());
        db.delete("b", b"key").unwrap();
        assert!(!db.exists("b", b"key").unwrap());
    }

    #[test]
    fn test_prefix_iterate_in_order() {
        let (db, _dir) = open_test_db();
        db.put_raw("a", b"p:2", b"two").unwrap();
        db.put_raw("a", b"p:1", b"one").unwrap();
        db.put_raw("a", b"q:1", b"other").unwrap();

        let mut seen = Vec::new();
        db.prefix_iterate("a", b"p:", |_, value| {
            seen.push(value.to_vec());
            true
        })
        .unwrap();

        assert_eq!(seen, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[test]
    fn test_composite_key() {
        assert_eq!(composite_key(b"thread", b"peer"), b"thread:peer");
    }
}
