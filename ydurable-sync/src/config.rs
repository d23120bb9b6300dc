//! Server configuration.
//!
//! Defaults live in the `Default` impls; `ServerConfig::from_env` overlays
//! `YDURABLE_*` environment variables (and a `.env` file, if present).
//!
//! | Variable                                 | Default          |
//! |------------------------------------------|------------------|
//! | `YDURABLE_BIND_ADDR`                     | `127.0.0.1:1234` |
//! | `YDURABLE_STORAGE_PATH`                  | in-memory        |
//! | `YDURABLE_BROADCAST_CAPACITY`            | 256              |
//! | `YDURABLE_HEARTBEAT_INTERVAL_MS`         | 30000            |
//! | `YDURABLE_GC`                            | true             |
//! | `YDURABLE_COMPACTION_THRESHOLD`          | 300              |
//! | `YDURABLE_CALLBACK_URL`                  | disabled         |
//! | `YDURABLE_CALLBACK_TIMEOUT_MS`           | 5000             |
//! | `YDURABLE_CALLBACK_DEBOUNCE_WAIT_MS`     | 2000             |
//! | `YDURABLE_CALLBACK_DEBOUNCE_MAXWAIT_MS`  | 10000            |
//! | `YDURABLE_CALLBACK_OBJECTS`              | `{}` (JSON)      |

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::storage::DEFAULT_COMPACTION_THRESHOLD;

pub const ENV_PREFIX: &str = "YDURABLE_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment variable error: {0}")]
    Env(#[from] envy::Error),
    #[error("YDURABLE_CALLBACK_OBJECTS must be a JSON object of name to kind: {0}")]
    InvalidCallbackObjects(String),
    #[error("A callback URL is set but no callback objects are declared")]
    MissingCallbackObjects,
}

/// Webhook notification settings.
#[derive(Debug, Clone)]
pub struct NotifyConfig {
    pub url: String,
    /// Request timeout
    pub timeout: Duration,
    pub debounce_wait: Duration,
    /// Upper bound on the delay of a notification during continuous edits
    pub debounce_max_wait: Duration,
    /// Shared object name → kind (`Array`, `Map`, `Text`, `XmlFragment`, `XmlElement`)
    pub objects: BTreeMap<String, String>,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            timeout: Duration::from_millis(5000),
            debounce_wait: Duration::from_millis(2000),
            debounce_max_wait: Duration::from_millis(10_000),
            objects: BTreeMap::new(),
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// RocksDB directory (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Broadcast channel capacity per document
    pub broadcast_capacity: usize,
    /// WebSocket ping interval in milliseconds
    pub heartbeat_interval_ms: u64,
    /// Default garbage collection for newly created documents
    pub gc: bool,
    /// Update count above which opening a document compacts its log
    pub compaction_threshold: usize,
    /// Change notifications (None = disabled)
    pub notify: Option<NotifyConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:1234".to_string(),
            storage_path: None,
            broadcast_capacity: 256,
            heartbeat_interval_ms: 30_000,
            gc: true,
            compaction_threshold: DEFAULT_COMPACTION_THRESHOLD,
            notify: None,
        }
    }
}

impl ServerConfig {
    /// Load from `.env` and the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        match dotenvy::dotenv() {
            Ok(path) => log::debug!("Loaded {}", path.display()),
            Err(e) if e.not_found() => {}
            Err(e) => log::warn!("Ignoring unreadable .env file: {e}"),
        }
        Self::from_vars(std::env::vars())
    }

    /// Build from explicit `(name, value)` pairs; unprefixed names are ignored.
    pub fn from_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let env: EnvConfig = envy::prefixed(ENV_PREFIX).from_iter(vars)?;
        let config = env.into_config()?;
        log::debug!("Configuration: {config:?}");
        Ok(config)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

/// Flat, env-shaped mirror of [`ServerConfig`].
#[derive(Debug, Deserialize)]
struct EnvConfig {
    #[serde(default = "default_bind_addr")]
    bind_addr: String,
    storage_path: Option<PathBuf>,
    #[serde(default = "default_broadcast_capacity")]
    broadcast_capacity: usize,
    #[serde(default = "default_heartbeat_interval_ms")]
    heartbeat_interval_ms: u64,
    #[serde(default = "default_gc")]
    gc: bool,
    #[serde(default = "default_compaction_threshold")]
    compaction_threshold: usize,
    callback_url: Option<String>,
    #[serde(default = "default_callback_timeout_ms")]
    callback_timeout_ms: u64,
    #[serde(default = "default_callback_debounce_wait_ms")]
    callback_debounce_wait_ms: u64,
    #[serde(default = "default_callback_debounce_maxwait_ms")]
    callback_debounce_maxwait_ms: u64,
    callback_objects: Option<String>,
}

impl EnvConfig {
    fn into_config(self) -> Result<ServerConfig, ConfigError> {
        let notify = match self.callback_url.filter(|url| !url.trim().is_empty()) {
            None => None,
            Some(url) => {
                let objects: BTreeMap<String, String> = match self.callback_objects.as_deref() {
                    None => BTreeMap::new(),
                    Some(raw) => serde_json::from_str(raw)
                        .map_err(|e| ConfigError::InvalidCallbackObjects(e.to_string()))?,
                };
                if objects.is_empty() {
                    return Err(ConfigError::MissingCallbackObjects);
                }
                let debounce_wait = Duration::from_millis(self.callback_debounce_wait_ms);
                Some(NotifyConfig {
                    url,
                    timeout: Duration::from_millis(self.callback_timeout_ms),
                    debounce_wait,
                    debounce_max_wait: Duration::from_millis(self.callback_debounce_maxwait_ms)
                        .max(debounce_wait),
                    objects,
                })
            }
        };
        Ok(ServerConfig {
            bind_addr: self.bind_addr,
            storage_path: self.storage_path,
            broadcast_capacity: self.broadcast_capacity,
            heartbeat_interval_ms: self.heartbeat_interval_ms,
            gc: self.gc,
            compaction_threshold: self.compaction_threshold,
            notify,
        })
    }
}

fn default_bind_addr() -> String {
    ServerConfig::default().bind_addr
}

fn default_broadcast_capacity() -> usize {
    256
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_gc() -> bool {
    true
}

fn default_compaction_threshold() -> usize {
    DEFAULT_COMPACTION_THRESHOLD
}

fn default_callback_timeout_ms() -> u64 {
    5000
}

fn default_callback_debounce_wait_ms() -> u64 {
    2000
}

fn default_callback_debounce_maxwait_ms() -> u64 {
    10_000
}
