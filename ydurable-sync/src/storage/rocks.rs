//! RocksDB-backed key-value substrate.
//!
//! All keys live in the default column family; the `"v1"` / `"v1_sv"`
//! prefixes of the key encoding already partition updates from state
//! summaries, and RocksDB's sorted iteration gives the range scans for free.
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (LSM Trees, SSTables)

use std::path::{Path, PathBuf};

use rocksdb::{
    BlockBasedOptions, Cache, DBCompressionType, Direction, IteratorMode, Options, WriteBatch,
    WriteOptions, DB,
};

use super::kv::{KeyRange, KvStore, StoreError};

/// RocksDB tuning.
#[derive(Debug, Clone)]
pub struct RocksConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for RocksConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("ydurable_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl RocksConfig {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Small caches for tests.
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

pub struct RocksKv {
    db: DB,
    config: RocksConfig,
}

impl RocksKv {
    /// Open (or create) the database at the configured path.
    pub fn open(config: RocksConfig) -> Result<Self, StoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_max_open_files(config.max_open_files);
        opts.set_keep_log_file_num(5);
        opts.set_max_total_wal_size(128 * 1024 * 1024);
        opts.increase_parallelism(num_cpus());

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        // Deltas are small and repetitive
        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        let db = DB::open(&opts, &config.path)?;
        log::info!("Opened RocksDB store at {}", config.path.display());
        Ok(Self { db, config })
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    fn utf8_key(raw: &[u8]) -> Result<String, StoreError> {
        String::from_utf8(raw.to_vec()).map_err(|e| StoreError::Corrupt {
            key: String::from_utf8_lossy(raw).into_owned(),
            reason: e.to_string(),
        })
    }
}

impl KvStore for RocksKv {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.db.get(key.as_bytes())?)
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.db.put_opt(key.as_bytes(), value, &self.write_options())?;
        Ok(())
    }

    fn delete(&self, keys: &[String]) -> Result<usize, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut batch = WriteBatch::default();
        for key in keys {
            batch.delete(key.as_bytes());
        }
        self.db.write_opt(batch, &self.write_options())?;
        Ok(keys.len())
    }

    fn list(&self, range: &KeyRange) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let mode = match (range.reverse, range.start.as_deref(), range.end.as_deref()) {
            (false, Some(start), _) => IteratorMode::From(start.as_bytes(), Direction::Forward),
            (false, None, _) => IteratorMode::Start,
            (true, _, Some(end)) => IteratorMode::From(end.as_bytes(), Direction::Reverse),
            (true, _, None) => IteratorMode::End,
        };
        let limit = range.limit.unwrap_or(usize::MAX);

        let mut out = Vec::new();
        for item in self.db.iterator(mode) {
            if out.len() >= limit {
                break;
            }
            let (raw_key, value) = item?;
            let key = Self::utf8_key(&raw_key)?;
            if range.reverse {
                // Reverse seek lands on the end key itself when it exists.
                if range.is_past(&key) {
                    continue;
                }
                if range.is_before(&key) {
                    break;
                }
            } else if range.is_past(&key) {
                break;
            }
            out.push((key, value.to_vec()));
        }
        Ok(out)
    }

    fn delete_all(&self) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        let mut count = 0usize;
        for item in self.db.iterator(IteratorMode::Start) {
            let (key, _) = item?;
            batch.delete(&key);
            count += 1;
        }
        if count > 0 {
            self.db.write_opt(batch, &self.write_options())?;
        }
        log::info!("Cleared {count} keys from {}", self.config.path.display());
        Ok(())
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
