//! # ydurable-sync — CRDT document sync with a durable update log
//!
//! Serves Yjs-compatible documents over WebSocket and persists every
//! update to an append-only, periodically compacted log in a key-value
//! store.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ Yjs client  │ ◄────────────────► │ SyncServer  │
//! │ (per user)  │  sync + awareness  │             │
//! └─────────────┘                    └──────┬──────┘
//!                                           │ open_session
//!                                    ┌──────┴──────────┐
//!                                    │ SessionRegistry │
//!                                    └──────┬──────────┘
//!                                           │ one per document
//!                                   ┌───────┴─────────┐
//!                                   │ DocumentSession │──► BroadcastGroup
//!                                   │ (Yrs Doc)       │──► Notifier
//!                                   └───────┬─────────┘
//!                                           │ store_update / get_document
//!                                    ┌──────┴─────────┐
//!                                    │ UpdateLogStore │──► KvStore (RocksDB)
//!                                    └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`storage`] — Key encoding, key-value substrates and the update log
//! - [`protocol`] — Sync / awareness framing over `yrs::sync`
//! - [`awareness`] — Ephemeral presence state
//! - [`broadcast`] — Per-document fan-out
//! - [`session`] — Live documents and their connections
//! - [`notify`] — Debounced change webhooks
//! - [`server`] — WebSocket server
//! - [`config`] — Configuration and environment loading

pub mod awareness;
pub mod broadcast;
pub mod config;
pub mod notify;
pub mod protocol;
pub mod server;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use awareness::{Awareness, AwarenessChange, ClientId, Clock};
pub use broadcast::{BroadcastGroup, BroadcastStats};
pub use config::{ConfigError, NotifyConfig, ServerConfig};
pub use notify::{Debouncer, Notifier, NotifyError, SharedObjectKind};
pub use protocol::{AwarenessUpdate, Message, ProtocolError, SyncMessage};
pub use server::{RequestContext, ServerError, ServerStats, SessionOptions, SyncServer};
pub use session::{Attachment, ConnectionId, DocumentSession, SessionRegistry};
pub use storage::{
    KeyRange, KvStore, MemoryKv, RocksConfig, RocksKv, StorageKey, StoreError, UpdateLogStore,
};
