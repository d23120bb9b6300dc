//! Live documents and the connections attached to them.
//!
//! ```text
//!                 ┌──────────────────── DocumentSession ───────────────────┐
//! conn A ──┐      │ Doc ── observe_update ──┬── persist  → UpdateLogStore   │
//!          ├──────┤                         ├── fan-out  → BroadcastGroup   │
//! conn B ──┘      │ Awareness               └── notify   → Debouncer        │
//!                 │ conn → controlled awareness client ids                 │
//!                 └────────────────────────────────────────────────────────┘
//! ```
//!
//! Lock order: registry map, then a session's own locks. The document,
//! awareness and connection locks of one session are never nested with each
//! other, and no lock is held across an `.await`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, OnceCell};
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::{Doc, Options, ReadTxn, StateVector, Subscription, Transact, Update};

use crate::awareness::{Awareness, ClientId, OUTDATED_TIMEOUT};
use crate::broadcast::BroadcastGroup;
use crate::config::NotifyConfig;
use crate::notify::{Debouncer, Notifier};
use crate::protocol::{self, AwarenessUpdate, Message, ProtocolError, SyncMessage};
use crate::storage::{Queued, UpdateLogStore};

pub type ConnectionId = Uuid;

const ERROR_CHANNEL_CAPACITY: usize = 16;
const AWARENESS_SWEEP_INTERVAL: Duration = Duration::from_secs(3);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One live document: the CRDT, its presence state and its connections.
pub struct DocumentSession {
    name: String,
    doc: Arc<Mutex<Doc>>,
    awareness: Mutex<Awareness>,
    conns: Mutex<HashMap<ConnectionId, HashSet<ClientId>>>,
    broadcast: Arc<BroadcastGroup>,
    debouncer: Option<Debouncer>,
    primed: OnceCell<()>,
    subscriptions: Mutex<Vec<Subscription>>,
    errors: broadcast::Sender<ProtocolError>,
}

impl DocumentSession {
    fn new(name: &str, gc: bool, broadcast_capacity: usize, notify: Option<&NotifyHook>) -> Self {
        let doc = Doc::with_options(Options {
            skip_gc: !gc,
            ..Options::default()
        });
        let doc = Arc::new(Mutex::new(doc));
        let debouncer = notify
            .map(|hook| hook.notifier.debouncer(&hook.config, name.to_owned(), Arc::clone(&doc)));
        let (errors, _) = broadcast::channel(ERROR_CHANNEL_CAPACITY);
        Self {
            name: name.to_owned(),
            doc,
            awareness: Mutex::new(Awareness::new()),
            conns: Mutex::new(HashMap::new()),
            broadcast: Arc::new(BroadcastGroup::new(broadcast_capacity)),
            debouncer,
            primed: OnceCell::new(),
            subscriptions: Mutex::new(Vec::new()),
            errors,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn broadcast(&self) -> &Arc<BroadcastGroup> {
        &self.broadcast
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.conns).len()
    }

    /// Awareness client ids currently controlled by `conn`.
    pub fn controlled_clients(&self, conn: ConnectionId) -> HashSet<ClientId> {
        lock(&self.conns).get(&conn).cloned().unwrap_or_default()
    }

    pub fn awareness_clients(&self) -> Vec<ClientId> {
        lock(&self.awareness).client_ids()
    }

    /// Malformed frames reported by any connection of this document.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<ProtocolError> {
        self.errors.subscribe()
    }

    /// Run `f` against the live document.
    pub fn with_doc<R>(&self, f: impl FnOnce(&Doc) -> R) -> R {
        f(&lock(&self.doc))
    }

    pub fn is_primed(&self) -> bool {
        self.primed.initialized()
    }

    /// Load the persisted state, then start capturing local updates.
    /// Runs once; concurrent callers wait for the first.
    async fn prime(&self, store: &UpdateLogStore) {
        self.primed
            .get_or_init(|| async {
                let persisted = store.get_document(&self.name).await;
                let doc = lock(&self.doc);
                match persisted {
                    Some(persisted) => {
                        let state = persisted
                            .transact()
                            .encode_state_as_update_v1(&StateVector::default());
                        let applied = Update::decode_v1(&state)
                            .map_err(|e| e.to_string())
                            .and_then(|u| {
                                doc.transact_mut().apply_update(u).map_err(|e| e.to_string())
                            });
                        match applied {
                            Ok(()) => log::info!("Primed {:?} from storage", self.name),
                            Err(e) => log::error!("Could not apply stored state of {:?}: {e}", self.name),
                        }
                    }
                    None => log::error!(
                        "Could not load {:?}; new edits are still appended to its log",
                        self.name
                    ),
                }
                self.register_observers(&doc, store.clone());
            })
            .await;
    }

    /// Persist, broadcast and notify every update applied to the document.
    /// The three observers are independent of each other.
    fn register_observers(&self, doc: &Doc, store: UpdateLogStore) {
        let mut subscriptions = lock(&self.subscriptions);

        let name = self.name.clone();
        let persist = doc.observe_update_v1(move |_, event| {
            // Enqueued immediately; the clock is assigned in apply order.
            drop(store.store_update(&name, event.update.clone()));
        });

        let group = Arc::clone(&self.broadcast);
        let fan_out = doc.observe_update_v1(move |_, event| {
            let frame = protocol::encode(&Message::Sync(SyncMessage::Update(event.update.clone())));
            group.broadcast_raw(Arc::new(frame));
        });

        let debouncer = self.debouncer.clone();
        let notify = doc.observe_update_v1(move |_, _| {
            if let Some(debouncer) = &debouncer {
                debouncer.trigger();
            }
        });

        for subscription in [persist, fan_out, notify] {
            match subscription {
                Ok(subscription) => subscriptions.push(subscription),
                Err(e) => log::error!("Failed to observe {:?}: {e}", self.name),
            }
        }
    }

    /// Handle one binary frame from `conn`. Returns a frame to send back to
    /// it, if any. A malformed frame is reported and dropped.
    pub fn handle_message(&self, conn: ConnectionId, frame: &[u8]) -> Option<Vec<u8>> {
        let dispatched = protocol::decode(frame).and_then(|msg| match msg {
            Some(msg) => self.dispatch(conn, msg),
            None => {
                log::debug!("Ignoring unknown opcode on {:?}", self.name);
                Ok(None)
            }
        });
        match dispatched {
            Ok(reply) => reply,
            Err(e) => {
                log::warn!("Dropping malformed frame on {:?} from {conn}: {e}", self.name);
                let _ = self.errors.send(e);
                None
            }
        }
    }

    fn dispatch(&self, conn: ConnectionId, msg: Message) -> Result<Option<Vec<u8>>, ProtocolError> {
        match msg {
            Message::Sync(sync) => {
                let reply = protocol::handle_sync(&lock(&self.doc), &sync)?;
                Ok(reply.map(|r| protocol::encode(&Message::Sync(r))))
            }
            Message::Awareness(update) => {
                self.apply_awareness(Some(conn), update)?;
                Ok(None)
            }
            Message::AwarenessQuery => Ok(self.awareness_snapshot_frame()),
            _ => {
                log::debug!("Ignoring unsupported message on {:?}", self.name);
                Ok(None)
            }
        }
    }

    /// Apply an awareness update and broadcast the touched client ids to every
    /// connection. Ids added or removed by `origin` are tracked as its own.
    pub fn apply_awareness(
        &self,
        origin: Option<ConnectionId>,
        update: AwarenessUpdate,
    ) -> Result<(), ProtocolError> {
        let (change, frame) = {
            let mut awareness = lock(&self.awareness);
            let change = awareness.apply_update(update)?;
            if change.is_empty() {
                return Ok(());
            }
            let update = awareness.update_with_clients(&change.changed_clients());
            let frame = protocol::encode(&Message::Awareness(update));
            (change, frame)
        };
        if let Some(conn) = origin {
            if let Some(controlled) = lock(&self.conns).get_mut(&conn) {
                controlled.extend(change.added.iter().copied());
                for id in &change.removed {
                    controlled.remove(id);
                }
            }
        }
        self.broadcast.broadcast_raw(Arc::new(frame));
        Ok(())
    }

    fn remove_awareness(&self, client_ids: &[ClientId]) -> Vec<ClientId> {
        let (frame, removed) = {
            let mut awareness = lock(&self.awareness);
            let removed = awareness.remove_states(client_ids);
            if removed.is_empty() {
                return removed;
            }
            let update = awareness.update_with_clients(&removed);
            (protocol::encode(&Message::Awareness(update)), removed)
        };
        self.broadcast.broadcast_raw(Arc::new(frame));
        removed
    }

    /// Drop stale presence entries, broadcasting their removal.
    pub fn sweep_awareness(&self) -> Vec<ClientId> {
        let (frame, removed) = {
            let mut awareness = lock(&self.awareness);
            let removed = awareness.remove_outdated_at(std::time::Instant::now(), OUTDATED_TIMEOUT);
            if removed.is_empty() {
                return removed;
            }
            let update = awareness.update_with_clients(&removed);
            (protocol::encode(&Message::Awareness(update)), removed)
        };
        log::debug!("Timed out awareness clients {removed:?} on {:?}", self.name);
        self.broadcast.broadcast_raw(Arc::new(frame));
        removed
    }

    fn add_connection(&self, conn: ConnectionId) {
        lock(&self.conns).insert(conn, HashSet::new());
    }

    /// Forget `conn` and the awareness states it controlled.
    fn remove_connection(&self, conn: ConnectionId) {
        let controlled = lock(&self.conns).remove(&conn).unwrap_or_default();
        let controlled: Vec<ClientId> = controlled.into_iter().collect();
        let removed = self.remove_awareness(&controlled);
        if !removed.is_empty() {
            log::debug!("Removed awareness clients {removed:?} of {conn}");
        }
    }

    /// Sync step 1 advertising the document's state vector.
    pub fn sync_step1_frame(&self) -> Vec<u8> {
        protocol::encode(&Message::Sync(protocol::sync_step1(&lock(&self.doc))))
    }

    /// Every known awareness state, if there are any.
    pub fn awareness_snapshot_frame(&self) -> Option<Vec<u8>> {
        let awareness = lock(&self.awareness);
        if awareness.is_empty() {
            return None;
        }
        let update = awareness.update_with_clients(&awareness.client_ids());
        Some(protocol::encode(&Message::Awareness(update)))
    }

    /// The whole document as a sync step 2, for peers that missed broadcasts.
    pub fn full_state_frame(&self) -> Vec<u8> {
        protocol::encode(&Message::Sync(SyncMessage::SyncStep2(self.encode_state())))
    }

    pub fn encode_state(&self) -> Vec<u8> {
        lock(&self.doc)
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }

    fn close(&self) {
        lock(&self.subscriptions).clear();
    }
}

struct NotifyHook {
    notifier: Arc<Notifier>,
    config: NotifyConfig,
}

/// A connection's membership in a session.
pub struct Attachment {
    pub session: Arc<DocumentSession>,
    pub conn_id: ConnectionId,
    pub receiver: broadcast::Receiver<Arc<Vec<u8>>>,
}

/// Document name → live session. At most one session per name.
pub struct SessionRegistry {
    store: UpdateLogStore,
    sessions: Mutex<HashMap<String, Arc<DocumentSession>>>,
    broadcast_capacity: usize,
    notify: Option<NotifyHook>,
}

impl SessionRegistry {
    pub fn new(store: UpdateLogStore, broadcast_capacity: usize) -> Self {
        Self {
            store,
            sessions: Mutex::new(HashMap::new()),
            broadcast_capacity,
            notify: None,
        }
    }

    /// Notify `notifier` after edits to any document settle.
    pub fn with_notifier(mut self, notifier: Arc<Notifier>, config: NotifyConfig) -> Self {
        self.notify = Some(NotifyHook { notifier, config });
        self
    }

    pub fn store(&self) -> &UpdateLogStore {
        &self.store
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        lock(&self.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The live session for `name`, without creating one.
    pub fn session(&self, name: &str) -> Option<Arc<DocumentSession>> {
        lock(&self.sessions).get(name).cloned()
    }

    /// The primed session for `name`, created and loaded from storage if
    /// needed. `gc` only applies when the session is created.
    pub async fn get_session(&self, name: &str, gc: bool) -> Arc<DocumentSession> {
        let session = {
            let mut sessions = lock(&self.sessions);
            self.get_or_create(&mut sessions, name, gc)
        };
        session.prime(&self.store).await;
        session
    }

    /// Register a new connection on `name`.
    pub async fn attach(&self, name: &str, gc: bool) -> Attachment {
        let conn_id = Uuid::new_v4();
        let (session, receiver) = {
            let mut sessions = lock(&self.sessions);
            let session = self.get_or_create(&mut sessions, name, gc);
            session.add_connection(conn_id);
            let receiver = session.broadcast.subscribe();
            (session, receiver)
        };
        session.prime(&self.store).await;
        log::debug!("Connection {conn_id} attached to {name:?}");
        Attachment {
            session,
            conn_id,
            receiver,
        }
    }

    /// Remove a connection; the last one out releases the session.
    pub fn detach(&self, session: &Arc<DocumentSession>, conn_id: ConnectionId) -> Option<Queued<u32>> {
        session.remove_connection(conn_id);
        log::debug!("Connection {conn_id} detached from {:?}", session.name);
        self.release_session(session)
    }

    /// Flush and evict `name` if no connection is attached to it.
    pub fn release(&self, name: &str) -> Option<Queued<u32>> {
        let session = self.session(name)?;
        self.release_session(&session)
    }

    fn release_session(&self, session: &Arc<DocumentSession>) -> Option<Queued<u32>> {
        let flushed = {
            let mut sessions = lock(&self.sessions);
            let current = sessions.get(&session.name)?;
            if !Arc::ptr_eq(current, session) || session.connection_count() > 0 {
                return None;
            }
            sessions.remove(&session.name);
            session.close();
            // Enqueued under the registry lock, so a later session for this
            // name can only queue its load behind it.
            self.store.write_state(&session.name, session.encode_state())
        };
        log::info!("Released {:?}", session.name);
        Some(flushed)
    }

    fn get_or_create(
        &self,
        sessions: &mut HashMap<String, Arc<DocumentSession>>,
        name: &str,
        gc: bool,
    ) -> Arc<DocumentSession> {
        if let Some(session) = sessions.get(name) {
            return Arc::clone(session);
        }
        let session = Arc::new(DocumentSession::new(
            name,
            gc,
            self.broadcast_capacity,
            self.notify.as_ref(),
        ));
        sessions.insert(name.to_owned(), Arc::clone(&session));
        spawn_awareness_sweeper(Arc::downgrade(&session));
        log::info!("Created session {name:?} (gc: {gc})");
        session
    }
}

fn spawn_awareness_sweeper(session: Weak<DocumentSession>) {
    tokio::spawn(async move {
        let mut ticks = tokio::time::interval(AWARENESS_SWEEP_INTERVAL);
        ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticks.tick().await;
            let Some(session) = session.upgrade() else {
                break;
            };
            session.sweep_awareness();
        }
    });
}
