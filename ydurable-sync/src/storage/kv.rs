//! Ordered key-value substrate.
//!
//! The update log only needs five primitives from the backing store: point
//! get/put, a batched delete, a bounded range listing, and a wipe. Each call
//! is atomic on its own; there are no multi-call transactions, so callers
//! serialize read-modify-write sequences themselves (see `UpdateLogStore`).

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;

use super::keys::KeyError;

/// Storage errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Backend failure
    #[error("Database error: {0}")]
    Database(String),
    #[error("Key error: {0}")]
    Key(#[from] KeyError),
    /// Compaction refused because the delete set is over the per-pass cap
    #[error("Too many keys to clear: {count} (limit {limit})")]
    TooManyKeys { count: usize, limit: usize },
    /// A stored payload could not be decoded or merged
    #[error("CRDT error: {0}")]
    Crdt(String),
    /// A stored record has an unexpected layout
    #[error("Corrupt record {key}: {reason}")]
    Corrupt { key: String, reason: String },
    #[error("Update clock overflow for document {0:?}")]
    ClockOverflow(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<yrs::encoding::read::Error> for StoreError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        StoreError::Crdt(e.to_string())
    }
}

/// A half-open key interval `[start, end)` with optional direction and limit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyRange {
    pub start: Option<String>,
    pub end: Option<String>,
    pub reverse: bool,
    pub limit: Option<usize>,
}

impl KeyRange {
    pub fn between(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            start: Some(start.into()),
            end: Some(end.into()),
            ..Self::default()
        }
    }

    /// Every key, up to `limit`.
    pub fn all(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    pub fn reversed(mut self) -> Self {
        self.reverse = true;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// True if `key` sorts before the range's start.
    pub fn is_before(&self, key: &str) -> bool {
        self.start.as_deref().is_some_and(|start| key < start)
    }

    /// True if `key` sorts at or past the range's (exclusive) end.
    pub fn is_past(&self, key: &str) -> bool {
        self.end.as_deref().is_some_and(|end| key >= end)
    }

    fn max_items(&self) -> usize {
        self.limit.unwrap_or(usize::MAX)
    }
}

/// A raw ordered key-value store.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    /// Delete every key in `keys` in one atomic batch. Returns the number of keys submitted.
    fn delete(&self, keys: &[String]) -> Result<usize, StoreError>;

    /// List entries inside `range`, in key order (or reverse key order).
    fn list(&self, range: &KeyRange) -> Result<Vec<(String, Vec<u8>)>, StoreError>;

    fn delete_all(&self) -> Result<(), StoreError>;
}

/// In-memory substrate backed by a `BTreeMap`.
///
/// Used when no storage path is configured, and by tests.
#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// All stored keys in order.
    pub fn keys(&self) -> Vec<String> {
        self.entries().keys().cloned().collect()
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl KvStore for MemoryKv {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.entries().get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.entries().insert(key.to_owned(), value.to_vec());
        Ok(())
    }

    fn delete(&self, keys: &[String]) -> Result<usize, StoreError> {
        let mut entries = self.entries();
        for key in keys {
            entries.remove(key);
        }
        Ok(keys.len())
    }

    fn list(&self, range: &KeyRange) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let entries = self.entries();
        let lower = match range.start.as_deref() {
            Some(start) => Bound::Included(start),
            None => Bound::Unbounded,
        };
        let upper = match range.end.as_deref() {
            Some(end) => Bound::Excluded(end),
            None => Bound::Unbounded,
        };
        // An inverted interval would make BTreeMap::range panic.
        if let (Some(start), Some(end)) = (range.start.as_deref(), range.end.as_deref()) {
            if start >= end {
                return Ok(Vec::new());
            }
        }
        let iter = entries
            .range::<str, _>((lower, upper))
            .map(|(k, v)| (k.clone(), v.clone()));
        let out: Vec<_> = if range.reverse {
            iter.rev().take(range.max_items()).collect()
        } else {
            iter.take(range.max_items()).collect()
        };
        Ok(out)
    }

    fn delete_all(&self) -> Result<(), StoreError> {
        self.entries().clear();
        Ok(())
    }
}
