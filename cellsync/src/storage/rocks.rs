//! RocksDB-backed durable mirror.
//!
//! Column families:
//! - `cells`:    key (UTF-8 bytes) → bincode `StoredCell`
//! - `metadata`: schema version marker
//!
//! Writes are single puts; the relay never needs multi-key atomicity.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteOptions,
};
use std::path::PathBuf;

use super::{DurableStore, StoreError, StoredCell};
use crate::protocol::CellState;

/// Column family names.
const CF_CELLS: &str = "cells";
const CF_METADATA: &str = "metadata";

/// All column family names for initialization.
const COLUMN_FAMILIES: &[&str] = &[CF_CELLS, CF_METADATA];

const SCHEMA_KEY: &[u8] = b"schema_version";
const SCHEMA_VERSION: u32 = 1;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 32MB)
    pub block_cache_size: usize,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("cellsync_data"),
            block_cache_size: 32 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 256,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 64,
        }
    }
}

/// RocksDB implementation of [`DurableStore`].
pub struct RocksStore {
    /// RocksDB instance (single-threaded mode: writes come from one persistence task)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open the store at the configured path.
    ///
    /// Creates the database and column families if they don't exist.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let store = Self { db, config };
        store.check_schema()?;
        Ok(store)
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);

        match name {
            CF_CELLS => {
                // Small values, overwritten in place, point lookups
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::None);
            }
            _ => {}
        }

        opts
    }

    /// Stamp a fresh database with the schema version, reject unknown ones.
    fn check_schema(&self) -> Result<(), StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, SCHEMA_KEY)? {
            Some(bytes) => {
                let found = bytes
                    .as_slice()
                    .try_into()
                    .map(u32::from_be_bytes)
                    .map_err(|_| StoreError::DeserializationError("bad schema marker".into()))?;
                if found != SCHEMA_VERSION {
                    return Err(StoreError::DeserializationError(format!(
                        "unsupported schema version {found}"
                    )));
                }
            }
            None => {
                self.db.put_cf(cf, SCHEMA_KEY, SCHEMA_VERSION.to_be_bytes())?;
            }
        }
        Ok(())
    }

    /// Number of persisted keys (full scan; introspection only).
    pub fn len(&self) -> Result<usize, StoreError> {
        let cf = self.cf(CF_CELLS)?;
        let mut count = 0;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            item?;
            count += 1;
        }
        Ok(count)
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    /// Get the database path.
    pub fn path(&self) -> &std::path::Path {
        &self.config.path
    }

    fn write_options(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }
}

impl DurableStore for RocksStore {
    fn persist(&self, state: &CellState) -> Result<(), StoreError> {
        let cf = self.cf(CF_CELLS)?;
        let encoded = StoredCell::encode(state)?;
        self.db
            .put_cf_opt(cf, state.key.as_bytes(), encoded, &self.write_options())?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool, StoreError> {
        let cf = self.cf(CF_CELLS)?;
        let existed = self.db.get_cf(cf, key.as_bytes())?.is_some();
        if existed {
            self.db.delete_cf_opt(cf, key.as_bytes(), &self.write_options())?;
        }
        Ok(existed)
    }

    fn load_all(&self) -> Result<Vec<CellState>, StoreError> {
        let cf = self.cf(CF_CELLS)?;
        let mut cells = Vec::new();

        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = item?;
            let key = match std::str::from_utf8(&key) {
                Ok(k) => k,
                Err(_) => {
                    log::warn!("Skipping persisted cell with non-UTF-8 key");
                    continue;
                }
            };
            match StoredCell::decode(key, &value) {
                Ok(cell) => cells.push(cell),
                Err(e) => log::warn!("Skipping corrupt persisted cell {key}: {e}"),
            }
        }

        Ok(cells)
    }
}
