//! Durable update log for collaborative documents.
//!
//! Architecture:
//! ```text
//! ┌────────────────┐  store_update   ┌────────────────┐   get/put/list   ┌──────────┐
//! │ DocumentSession│ ──────────────► │ UpdateLogStore │ ───────────────► │ KvStore  │
//! │ (live Doc)     │ ◄────────────── │ (one queue)    │                  │ Rocks/Mem│
//! └────────────────┘  get_document   └────────────────┘                  └──────────┘
//! ```
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 3

pub mod keys;
pub mod kv;
pub mod rocks;
pub mod update_log;

pub use keys::{KeyError, KeyPart, StorageKey, MAX_CLOCK};
pub use kv::{KeyRange, KvStore, MemoryKv, StoreError};
pub use rocks::{RocksConfig, RocksKv};
pub use update_log::{
    Queued, UpdateLogStore, DEFAULT_COMPACTION_THRESHOLD, DEFAULT_KEY_PAGE, MAX_CLEAR_KEYS,
};
