//! WebSocket sync server with path-based document routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐   ws://host/<doc>
//!            ├── open_session ── SessionRegistry ── DocumentSession ── BroadcastGroup
//! Client B ──┘                        │                   │
//!                                     │                   ├── Awareness
//!                                     ▼                   └── Debouncer → webhook
//!                               UpdateLogStore
//!                                     │
//!                                     ▼
//!                           KvStore (RocksDB / memory)
//! ```
//!
//! Connection lifecycle: `Connecting → Attached → Closed`. On attach the
//! server sends sync step 1 and, when presence exists, an awareness
//! snapshot. On close the connection's awareness clients are removed and
//! the last connection out flushes and evicts the document.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapters 3 & 8

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tokio::time::{Instant, Interval};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

use crate::config::ServerConfig;
use crate::notify::{Notifier, NotifyError};
use crate::session::{Attachment, SessionRegistry};
use crate::storage::{KvStore, MemoryKv, RocksConfig, RocksKv, StoreError, UpdateLogStore};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
    #[error("Notifier error: {0}")]
    Notify(#[from] NotifyError),
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_sessions: usize,
}

/// What the upgrade request told us about a connection.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Request target, e.g. `/my-doc?token=abc`
    pub uri: String,
    pub remote_addr: Option<SocketAddr>,
}

impl RequestContext {
    pub fn new(uri: impl Into<String>, remote_addr: Option<SocketAddr>) -> Self {
        Self {
            uri: uri.into(),
            remote_addr,
        }
    }

    /// The request path without its leading `/` and query string.
    pub fn doc_name(&self) -> String {
        let path = self.uri.split('?').next().unwrap_or_default();
        path.strip_prefix('/').unwrap_or(path).to_string()
    }

    fn peer(&self) -> String {
        self.remote_addr
            .map_or_else(|| "unknown peer".to_string(), |addr| addr.to_string())
    }
}

/// Per-connection overrides for [`SyncServer::open_session`].
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Document to attach to; defaults to [`RequestContext::doc_name`].
    pub doc_name: Option<String>,
    /// Garbage collection for a newly created document; defaults to the
    /// server configuration.
    pub gc: Option<bool>,
}

/// The sync server. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct SyncServer {
    config: Arc<ServerConfig>,
    registry: Arc<SessionRegistry>,
    /// Server-wide statistics
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Open the configured storage and build the server. Must be called
    /// inside a tokio runtime.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let kv: Arc<dyn KvStore> = match &config.storage_path {
            Some(path) => {
                let kv = RocksKv::open(RocksConfig::at(path))?;
                log::info!("Persisting documents to {}", path.display());
                Arc::new(kv)
            }
            None => {
                log::warn!("No storage path configured; documents are kept in memory only");
                Arc::new(MemoryKv::new())
            }
        };
        Self::with_store(config, kv)
    }

    /// Build the server over an existing key-value store.
    pub fn with_store(config: ServerConfig, kv: Arc<dyn KvStore>) -> Result<Self, ServerError> {
        let store = UpdateLogStore::new(kv).with_compaction_threshold(config.compaction_threshold);
        let mut registry = SessionRegistry::new(store, config.broadcast_capacity);
        if let Some(notify) = &config.notify {
            let notifier = Notifier::new(notify)?;
            log::info!("Change notifications go to {}", notifier.url());
            registry = registry.with_notifier(Arc::new(notifier), notify.clone());
        }
        Ok(Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
            stats: Arc::new(RwLock::new(ServerStats::default())),
        })
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Accept connections from `listener`, one task per connection.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Upgrade a TCP stream, capturing the request target on the way.
    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), ServerError> {
        let mut uri = String::new();
        let capture_uri = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            uri = req.uri().to_string();
            Ok(resp)
        };
        let ws = tokio_tungstenite::accept_hdr_async(stream, capture_uri).await?;
        let request = RequestContext::new(uri, Some(addr));
        self.open_session(ws, request, SessionOptions::default()).await
    }

    /// Serve one upgraded connection until it closes.
    pub async fn open_session<S>(
        &self,
        ws: WebSocketStream<S>,
        request: RequestContext,
        options: SessionOptions,
    ) -> Result<(), ServerError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let doc_name = options.doc_name.unwrap_or_else(|| request.doc_name());
        let gc = options.gc.unwrap_or(self.config.gc);

        let mut attachment = self.registry.attach(&doc_name, gc).await;
        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
            s.active_sessions = self.registry.len();
        }
        log::info!(
            "Connection {} from {} attached to {doc_name:?}",
            attachment.conn_id,
            request.peer()
        );

        let result = self.run_connection(ws, &mut attachment, &request).await;

        let Attachment {
            session,
            conn_id,
            receiver,
        } = attachment;
        drop(receiver);
        if let Some(flushed) = self.registry.detach(&session, conn_id) {
            match flushed.await {
                Some(clock) => log::info!("Flushed {doc_name:?} at clock {clock}"),
                None => log::error!("Final flush of {doc_name:?} failed"),
            }
        }
        {
            let mut s = self.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
            s.active_sessions = self.registry.len();
        }
        log::info!("Connection {conn_id} from {} closed", request.peer());
        result
    }

    async fn run_connection<S>(
        &self,
        ws: WebSocketStream<S>,
        attachment: &mut Attachment,
        request: &RequestContext,
    ) -> Result<(), ServerError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut ws_sender, mut ws_receiver) = ws.split();
        let session = Arc::clone(&attachment.session);
        let conn_id = attachment.conn_id;

        ws_sender
            .send(WsMessage::Binary(session.sync_step1_frame().into()))
            .await?;
        if let Some(snapshot) = session.awareness_snapshot_frame() {
            ws_sender.send(WsMessage::Binary(snapshot.into())).await?;
        }

        let mut heartbeat = heartbeat(self.config.heartbeat_interval());
        let mut awaiting_pong = false;

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(WsMessage::Binary(data))) => {
                            {
                                let mut s = self.stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += data.len() as u64;
                            }
                            if let Some(reply) = session.handle_message(conn_id, &data) {
                                ws_sender.send(WsMessage::Binary(reply.into())).await?;
                            }
                        }
                        Some(Ok(WsMessage::Text(_))) => {
                            log::warn!("Dropping text frame from {}", request.peer());
                        }
                        Some(Ok(WsMessage::Ping(data))) => {
                            ws_sender.send(WsMessage::Pong(data)).await?;
                        }
                        Some(Ok(WsMessage::Pong(_))) => awaiting_pong = false,
                        Some(Ok(WsMessage::Close(_))) | None => break,
                        Some(Ok(WsMessage::Frame(_))) => {}
                        Some(Err(e)) => {
                            log::warn!("WebSocket error from {}: {e}", request.peer());
                            break;
                        }
                    }
                }

                msg = attachment.receiver.recv() => {
                    match msg {
                        Ok(frame) => {
                            ws_sender.send(WsMessage::Binary(frame.to_vec().into())).await?;
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            session.broadcast().record_lag(skipped);
                            log::warn!("Connection {conn_id} lagged by {skipped} frames; resending full state");
                            ws_sender
                                .send(WsMessage::Binary(session.full_state_frame().into()))
                                .await?;
                        }
                        Err(RecvError::Closed) => break,
                    }
                }

                _ = next_tick(&mut heartbeat) => {
                    if awaiting_pong {
                        log::info!("Connection {conn_id} from {} missed a heartbeat", request.peer());
                        break;
                    }
                    awaiting_pong = true;
                    ws_sender.send(WsMessage::Ping(Default::default())).await?;
                }
            }
        }

        // The peer may already be gone.
        let _ = ws_sender.close().await;
        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &UpdateLogStore {
        self.registry.store()
    }
}

/// `None` disables pings.
fn heartbeat(period: Duration) -> Option<Interval> {
    if period.is_zero() {
        return None;
    }
    Some(tokio::time::interval_at(Instant::now() + period, period))
}

async fn next_tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NotifyConfig;
    use crate::protocol::{self, Message, SyncMessage};
    use std::collections::BTreeMap;
    use tokio::io::DuplexStream;
    use tokio::task::JoinHandle;
    use tokio_tungstenite::tungstenite::protocol::Role;
    use uuid::Uuid;
    use yrs::{Doc, GetString, ReadTxn, Text, Transact};

    type Peer = WebSocketStream<DuplexStream>;

    /// Serve `doc` over an in-memory pipe, as `handle_connection` would.
    async fn open_in_memory(
        server: &SyncServer,
        doc: &str,
    ) -> (JoinHandle<Result<(), ServerError>>, Peer) {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let server = server.clone();
        let uri = format!("/{doc}");
        let task = tokio::spawn(async move {
            let ws = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
            server
                .open_session(ws, RequestContext::new(uri, None), SessionOptions::default())
                .await
        });
        let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        (task, client)
    }

    async fn wait_attached(server: &SyncServer, doc: &str) -> Arc<crate::session::DocumentSession> {
        loop {
            if let Some(session) = server.registry().session(doc) {
                if session.connection_count() == 1 && session.is_primed() {
                    return session;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[test]
    fn test_doc_name_from_path() {
        let request = RequestContext::new("/my-doc?token=abc", None);
        assert_eq!(request.doc_name(), "my-doc");
        assert_eq!(RequestContext::new("/a/b", None).doc_name(), "a/b");
        assert_eq!(RequestContext::new("/", None).doc_name(), "");
        assert_eq!(RequestContext::new("plain", None).doc_name(), "plain");
    }

    #[test]
    fn test_session_options_default() {
        let options = SessionOptions::default();
        assert!(options.doc_name.is_none());
        assert!(options.gc.is_none());
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = SyncServer::new(ServerConfig::default()).unwrap();
        assert_eq!(server.bind_addr(), "127.0.0.1:1234");
        assert!(server.registry().is_empty());
        assert_eq!(server.store().compaction_threshold(), 300);
    }

    #[tokio::test]
    async fn test_server_with_storage() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            storage_path: Some(dir.path().join("db")),
            compaction_threshold: 10,
            ..ServerConfig::default()
        };
        let server = SyncServer::new(config).unwrap();
        assert_eq!(server.store().compaction_threshold(), 10);
        assert!(dir.path().join("db").exists());
    }

    #[tokio::test]
    async fn test_server_with_notifier() {
        let config = ServerConfig {
            notify: Some(NotifyConfig {
                url: "http://127.0.0.1:9/hook".to_string(),
                objects: BTreeMap::from([("t".to_string(), "Text".to_string())]),
                ..NotifyConfig::default()
            }),
            ..ServerConfig::default()
        };
        assert!(SyncServer::new(config).is_ok());
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = SyncServer::new(ServerConfig::default()).unwrap();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_messages, 0);
        assert_eq!(stats.total_bytes, 0);
        assert_eq!(stats.active_sessions, 0);
    }

    #[tokio::test]
    async fn test_heartbeat_disabled_never_ticks() {
        let mut disabled = heartbeat(Duration::ZERO);
        assert!(disabled.is_none());
        let ticked = tokio::time::timeout(Duration::from_millis(20), next_tick(&mut disabled)).await;
        assert!(ticked.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missed_pong_closes_connection() {
        let server = SyncServer::new(ServerConfig::default()).unwrap();
        // The peer never reads, so it never answers a ping.
        let (task, _silent) = open_in_memory(&server, "quiet").await;
        wait_attached(&server, "quiet").await;

        let result = tokio::time::timeout(Duration::from_secs(120), task)
            .await
            .expect("connection outlived two heartbeats")
            .unwrap();
        assert!(result.is_ok());
        assert!(server.registry().is_empty());
        assert_eq!(server.stats().await.active_connections, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_answered_pings_keep_connection() {
        let server = SyncServer::new(ServerConfig::default()).unwrap();
        let (task, mut client) = open_in_memory(&server, "chatty").await;
        tokio::spawn(async move {
            while let Some(Ok(msg)) = client.next().await {
                if let WsMessage::Ping(data) = msg {
                    if client.send(WsMessage::Pong(data)).await.is_err() {
                        break;
                    }
                }
            }
        });
        wait_attached(&server, "chatty").await;

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert!(!task.is_finished());
        assert_eq!(server.registry().len(), 1);
    }

    #[tokio::test]
    async fn test_lagged_connection_gets_full_state() {
        let config = ServerConfig {
            broadcast_capacity: 2,
            heartbeat_interval_ms: 0,
            ..ServerConfig::default()
        };
        let server = SyncServer::new(config).unwrap();
        let (_task, mut client) = open_in_memory(&server, "burst").await;
        let session = wait_attached(&server, "burst").await;

        // Twenty updates land before the connection task runs again.
        let author = Doc::with_client_id(4);
        let text = author.get_or_insert_text("t");
        let chunk = "x".repeat(50);
        for _ in 0..20 {
            let before = author.transact().state_vector();
            {
                let mut txn = author.transact_mut();
                let len = text.len(&txn);
                text.insert(&mut txn, len, &chunk);
            }
            let update = author.transact().encode_diff_v1(&before);
            let frame = protocol::encode(&Message::Sync(SyncMessage::Update(update)));
            session.handle_message(Uuid::new_v4(), &frame);
        }

        let peer = Doc::new();
        let expected = chunk.repeat(20);
        tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(Ok(msg)) = client.next().await {
                let WsMessage::Binary(data) = msg else {
                    continue;
                };
                if let Some(Message::Sync(SyncMessage::SyncStep2(state))) =
                    protocol::decode(&data).unwrap()
                {
                    protocol::handle_sync(&peer, &SyncMessage::SyncStep2(state)).unwrap();
                    break;
                }
            }
        })
        .await
        .expect("full state was not resent");

        let text = peer.get_or_insert_text("t");
        assert_eq!(text.get_string(&peer.transact()), expected);
        assert!(session.broadcast().stats().messages_dropped > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_first_tick_after_period() {
        let mut beat = heartbeat(Duration::from_secs(30));
        let start = Instant::now();
        next_tick(&mut beat).await;
        assert!(start.elapsed() >= Duration::from_secs(30));
    }
}
