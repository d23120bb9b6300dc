//! Clock-indexed update log with compaction and a cached state summary.
//!
//! Every operation on a store handle runs on one worker task, strictly after
//! the previous one finished. A failed (or panicking) job resolves its caller
//! to `None` and the queue moves on.
//!
//! ```text
//! "v1"#"doc"#"update"#000000000   ─┐
//! "v1"#"doc"#"update"#000000001    ├─ replayed in clock order
//! "v1"#"doc"#"update"#000000002   ─┘
//! "v1_sv"#"doc"                   ── varuint clock ++ varbuf state vector
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::{mpsc, oneshot};
use yrs::encoding::read::{Cursor, Read};
use yrs::encoding::write::Write;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use super::keys::{StorageKey, CLOCK_UPPER_BOUND, MAX_CLOCK, STATE_VECTOR_PREFIX};
use super::kv::{KeyRange, KvStore, StoreError};

/// Backlog size above which opening a document compacts its log.
pub const DEFAULT_COMPACTION_THRESHOLD: usize = 300;
/// Upper bound on keys deleted by a single compaction pass.
pub const MAX_CLEAR_KEYS: usize = 128;
/// Default page size for [`UpdateLogStore::list_keys`].
pub const DEFAULT_KEY_PAGE: usize = 200;

type Job = Box<dyn FnOnce(&dyn KvStore) + Send>;

/// Result of a queued storage operation.
///
/// The job is enqueued when the handle is created, not when it is first
/// polled, so dropping a `Queued` does not cancel the write.
#[must_use = "the operation runs regardless, but its result is only observable by awaiting"]
pub struct Queued<T> {
    rx: Option<oneshot::Receiver<Option<T>>>,
}

impl<T> Future for Queued<T> {
    type Output = Option<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match this.rx.as_mut() {
            // The worker is gone.
            None => Poll::Ready(None),
            Some(rx) => Pin::new(rx).poll(cx).map(|res| res.ok().flatten()),
        }
    }
}

/// Serialized, compacting update log over a [`KvStore`].
///
/// Cheap to clone; all clones share the same queue.
#[derive(Clone)]
pub struct UpdateLogStore {
    jobs: mpsc::UnboundedSender<Job>,
    compaction_threshold: usize,
}

impl UpdateLogStore {
    /// Wrap `kv` and start its queue worker. Must be called inside a Tokio runtime.
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        let (jobs, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_queue(kv, rx));
        Self {
            jobs,
            compaction_threshold: DEFAULT_COMPACTION_THRESHOLD,
        }
    }

    pub fn with_compaction_threshold(mut self, threshold: usize) -> Self {
        self.compaction_threshold = threshold;
        self
    }

    pub fn compaction_threshold(&self) -> usize {
        self.compaction_threshold
    }

    /// Append `update` after the document's current maximum clock.
    pub fn store_update(&self, doc_name: &str, update: Vec<u8>) -> Queued<u32> {
        let name = doc_name.to_owned();
        self.transact("store_update", doc_name, move |kv| {
            store_update_in(kv, &name, &update)
        })
    }

    /// Replay the whole log into a fresh document.
    ///
    /// A backlog longer than the compaction threshold is compacted before
    /// returning; a failed compaction is logged and the document still returned.
    pub fn get_document(&self, doc_name: &str) -> Queued<Doc> {
        let name = doc_name.to_owned();
        let threshold = self.compaction_threshold;
        self.transact("get_document", doc_name, move |kv| {
            let updates = read_updates(kv, &name)?;
            let doc = Doc::new();
            {
                let mut txn = doc.transact_mut();
                for (_, update) in &updates {
                    apply(&mut txn, update)?;
                }
            }
            if updates.len() > threshold {
                let txn = doc.transact();
                let state = txn.encode_state_as_update_v1(&StateVector::default());
                let sv = txn.state_vector().encode_v1();
                drop(txn);
                if let Err(e) = compact_bounded(kv, &name, &updates, &state, &sv, None) {
                    log::warn!("Compaction of {name:?} on open failed: {e}");
                }
            }
            Ok(doc)
        })
    }

    /// The document's state vector, recomputed (and the log compacted) when
    /// the cached one is older than the newest update.
    pub fn get_state_summary(&self, doc_name: &str) -> Queued<Vec<u8>> {
        let name = doc_name.to_owned();
        self.transact("get_state_summary", doc_name, move |kv| {
            get_state_summary_in(kv, &name)
        })
    }

    /// Merge every logged update into one entry. Refuses (resolving to `None`)
    /// when more than [`MAX_CLEAR_KEYS`] entries would have to be deleted.
    ///
    /// Resolves to `Some(None)` when the document has no updates.
    pub fn flush_document(&self, doc_name: &str) -> Queued<Option<u32>> {
        let name = doc_name.to_owned();
        self.transact("flush_document", doc_name, move |kv| {
            let updates = read_updates(kv, &name)?;
            if updates.is_empty() {
                log::debug!("Nothing to flush for {name:?}");
                return Ok(None);
            }
            let (merged, sv) = merge_updates(updates.iter().map(|(_, u)| u.as_slice()))?;
            compact_in(kv, &name, &updates, &merged, &sv).map(Some)
        })
    }

    /// Persist a full document state and compact the log around it.
    ///
    /// Used when a session is released. Falls back to compacting the oldest
    /// [`MAX_CLEAR_KEYS`] entries when the backlog is larger than that.
    pub fn write_state(&self, doc_name: &str, state: Vec<u8>) -> Queued<u32> {
        let name = doc_name.to_owned();
        self.transact("write_state", doc_name, move |kv| {
            let updates = read_updates(kv, &name)?;
            let (merged, sv) = merge_updates(
                updates
                    .iter()
                    .map(|(_, u)| u.as_slice())
                    .chain(std::iter::once(state.as_slice())),
            )?;
            compact_bounded(kv, &name, &updates, &merged, &sv, Some(&state))
        })
    }

    /// Up to `limit` stored keys, decoded, in key order.
    pub fn list_keys(&self, limit: usize) -> Queued<Vec<StorageKey>> {
        self.transact("list_keys", "*", move |kv| {
            kv.list(&KeyRange::all(limit))?
                .into_iter()
                .map(|(key, _)| StorageKey::decode(&key).map_err(StoreError::from))
                .collect()
        })
    }

    /// Names of every document that has a state-summary record.
    pub fn list_documents(&self, limit: usize) -> Queued<Vec<String>> {
        self.transact("list_documents", "*", move |kv| {
            let prefix = StorageKey::new(vec![STATE_VECTOR_PREFIX.into()]).encode();
            // '$' is the byte after '#'.
            let range = KeyRange::between(format!("{prefix}#"), format!("{prefix}$")).limit(limit);
            let mut names = Vec::new();
            for (key, _) in kv.list(&range)? {
                let decoded = StorageKey::decode(&key)?;
                if let Some(name) = decoded.doc_name() {
                    names.push(name.to_owned());
                }
            }
            Ok(names)
        })
    }

    /// Delete every stored key.
    pub fn clear_all(&self) -> Queued<()> {
        self.transact("clear_all", "*", |kv| kv.delete_all())
    }

    fn transact<T, F>(&self, op: &'static str, doc_name: &str, f: F) -> Queued<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn KvStore) -> Result<T, StoreError> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let name = doc_name.to_owned();
        let job: Job = Box::new(move |kv| {
            let out = match f(kv) {
                Ok(value) => Some(value),
                Err(e) => {
                    log::warn!("Storage operation {op} on {name:?} failed: {e}");
                    None
                }
            };
            let _ = tx.send(out);
        });
        match self.jobs.send(job) {
            Ok(()) => Queued { rx: Some(rx) },
            Err(_) => {
                log::error!("Storage queue closed, dropping {op} on {doc_name:?}");
                Queued { rx: None }
            }
        }
    }
}

async fn run_queue(kv: Arc<dyn KvStore>, mut jobs: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = jobs.recv().await {
        let kv = Arc::clone(&kv);
        if let Err(e) = tokio::task::spawn_blocking(move || job(kv.as_ref())).await {
            log::error!("Storage job panicked: {e}");
        }
    }
    log::debug!("Storage queue drained and closed");
}

fn update_range(doc_name: &str) -> KeyRange {
    KeyRange::between(
        StorageKey::update(doc_name, 0).encode(),
        StorageKey::update(doc_name, CLOCK_UPPER_BOUND).encode(),
    )
}

fn clock_of(key: &str) -> Result<u32, StoreError> {
    StorageKey::decode(key)?
        .clock()
        .ok_or_else(|| StoreError::Corrupt {
            key: key.to_owned(),
            reason: "update key without clock".into(),
        })
}

/// Highest clock in the log, `None` for a document never written.
fn current_clock(kv: &dyn KvStore, doc_name: &str) -> Result<Option<u32>, StoreError> {
    let last = kv.list(&update_range(doc_name).reversed().limit(1))?;
    last.first().map(|(key, _)| clock_of(key)).transpose()
}

fn read_updates(kv: &dyn KvStore, doc_name: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
    kv.list(&update_range(doc_name))
}

fn apply(txn: &mut yrs::TransactionMut<'_>, update: &[u8]) -> Result<(), StoreError> {
    let update = Update::decode_v1(update)?;
    txn.apply_update(update)
        .map_err(|e| StoreError::Crdt(e.to_string()))
}

/// Merge updates into one through a scratch document. Returns
/// `(state as update, state vector)`.
fn merge_updates<'a>(
    updates: impl IntoIterator<Item = &'a [u8]>,
) -> Result<(Vec<u8>, Vec<u8>), StoreError> {
    let doc = Doc::new();
    {
        let mut txn = doc.transact_mut();
        for update in updates {
            apply(&mut txn, update)?;
        }
    }
    let txn = doc.transact();
    Ok((
        txn.encode_state_as_update_v1(&StateVector::default()),
        txn.state_vector().encode_v1(),
    ))
}

fn write_state_vector(
    kv: &dyn KvStore,
    doc_name: &str,
    sv: &[u8],
    clock: u32,
) -> Result<(), StoreError> {
    let mut record = Vec::with_capacity(sv.len() + 8);
    record.write_var(clock);
    record.write_buf(sv);
    kv.put(&StorageKey::state_vector(doc_name).encode(), &record)
}

fn read_state_vector(
    kv: &dyn KvStore,
    doc_name: &str,
) -> Result<Option<(u32, Vec<u8>)>, StoreError> {
    let key = StorageKey::state_vector(doc_name).encode();
    let Some(raw) = kv.get(&key)? else {
        return Ok(None);
    };
    let corrupt = |reason: String| StoreError::Corrupt {
        key: key.clone(),
        reason,
    };
    let mut cursor = Cursor::new(&raw);
    let clock: u32 = cursor.read_var().map_err(|e| corrupt(e.to_string()))?;
    let sv = cursor.read_buf().map_err(|e| corrupt(e.to_string()))?;
    Ok(Some((clock, sv.to_vec())))
}

fn store_update_in(kv: &dyn KvStore, doc_name: &str, update: &[u8]) -> Result<u32, StoreError> {
    let clock = match current_clock(kv, doc_name)? {
        Some(current) => current
            .checked_add(1)
            .filter(|next| *next <= MAX_CLOCK)
            .ok_or_else(|| StoreError::ClockOverflow(doc_name.to_owned()))?,
        None => {
            // First write: make the document discoverable through its summary key.
            let (_, sv) = merge_updates([update])?;
            write_state_vector(kv, doc_name, &sv, 0)?;
            0
        }
    };
    kv.put(&StorageKey::update(doc_name, clock).encode(), update)?;
    Ok(clock)
}

/// Replace `superseded` with one `merged` entry at the next clock.
///
/// Refuses before writing anything when more than [`MAX_CLEAR_KEYS`] keys
/// would be deleted. A log that already consists of exactly the merged
/// state with a matching summary is left untouched.
fn compact_in(
    kv: &dyn KvStore,
    doc_name: &str,
    superseded: &[(String, Vec<u8>)],
    merged: &[u8],
    sv: &[u8],
) -> Result<u32, StoreError> {
    if superseded.len() > MAX_CLEAR_KEYS {
        return Err(StoreError::TooManyKeys {
            count: superseded.len(),
            limit: MAX_CLEAR_KEYS,
        });
    }
    if let [(key, _)] = superseded {
        let clock = clock_of(key)?;
        if let Some((sv_clock, cached)) = read_state_vector(kv, doc_name)? {
            if sv_clock == clock && cached == sv {
                log::debug!("{doc_name:?} already compacted at clock {clock}");
                return Ok(clock);
            }
        }
    }
    let clock = store_update_in(kv, doc_name, merged)?;
    write_state_vector(kv, doc_name, sv, clock)?;
    let keys: Vec<String> = superseded.iter().map(|(key, _)| key.clone()).collect();
    let deleted = kv.delete(&keys)?;
    log::info!("Compacted {doc_name:?} at clock {clock}, cleared {deleted} updates");
    Ok(clock)
}

/// Compact the whole log, or only its oldest [`MAX_CLEAR_KEYS`] entries
/// when the full pass is refused. `extra` is merged into the partial entry.
fn compact_bounded(
    kv: &dyn KvStore,
    doc_name: &str,
    updates: &[(String, Vec<u8>)],
    merged: &[u8],
    sv: &[u8],
    extra: Option<&[u8]>,
) -> Result<u32, StoreError> {
    if updates.len() <= MAX_CLEAR_KEYS {
        return compact_in(kv, doc_name, updates, merged, sv);
    }
    log::info!(
        "{doc_name:?} has {} updates, compacting the oldest {MAX_CLEAR_KEYS}",
        updates.len()
    );
    let oldest = &updates[..MAX_CLEAR_KEYS];
    let (partial, _) = merge_updates(
        oldest
            .iter()
            .map(|(_, u)| u.as_slice())
            .chain(extra),
    )?;
    // The summary still covers the whole log, which now ends at the new entry.
    compact_in(kv, doc_name, oldest, &partial, sv)
}

fn get_state_summary_in(kv: &dyn KvStore, doc_name: &str) -> Result<Vec<u8>, StoreError> {
    let cached = read_state_vector(kv, doc_name)?;
    if let Some((clock, sv)) = cached {
        if current_clock(kv, doc_name)? == Some(clock) {
            return Ok(sv);
        }
    }
    let updates = read_updates(kv, doc_name)?;
    let (merged, sv) = merge_updates(updates.iter().map(|(_, u)| u.as_slice()))?;
    if updates.is_empty() {
        return Ok(sv);
    }
    compact_bounded(kv, doc_name, &updates, &merged, &sv, None)?;
    Ok(sv)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryKv;
    use yrs::{GetString, Text};

    fn store(threshold: usize) -> (Arc<MemoryKv>, UpdateLogStore) {
        let kv = Arc::new(MemoryKv::new());
        let store = UpdateLogStore::new(kv.clone()).with_compaction_threshold(threshold);
        (kv, store)
    }

    /// Deltas produced by inserting each chunk at the end of text "t".
    fn text_deltas(chunks: &[&str]) -> Vec<Vec<u8>> {
        let doc = Doc::with_client_id(7);
        let text = doc.get_or_insert_text("t");
        let mut out = Vec::new();
        for chunk in chunks {
            let before = doc.transact().state_vector();
            {
                let mut txn = doc.transact_mut();
                let len = text.len(&txn);
                text.insert(&mut txn, len, chunk);
            }
            out.push(doc.transact().encode_diff_v1(&before));
        }
        out
    }

    fn text_of(doc: &Doc) -> String {
        let text = doc.get_or_insert_text("t");
        let txn = doc.transact();
        text.get_string(&txn)
    }

    fn update_keys(kv: &MemoryKv, doc: &str) -> Vec<u32> {
        kv.keys()
            .iter()
            .filter_map(|k| StorageKey::decode(k).ok())
            .filter(|k| k.doc_name() == Some(doc))
            .filter_map(|k| k.clock())
            .collect()
    }

    #[tokio::test]
    async fn test_clocks_are_dense_from_zero() {
        let (_kv, store) = store(DEFAULT_COMPACTION_THRESHOLD);
        let deltas = text_deltas(&["a", "b", "c"]);
        for (expected, delta) in deltas.into_iter().enumerate() {
            let clock = store.store_update("doc1", delta).await.unwrap();
            assert_eq!(clock, expected as u32);
        }
    }

    #[tokio::test]
    async fn test_first_write_seeds_summary() {
        let (kv, store) = store(DEFAULT_COMPACTION_THRESHOLD);
        let delta = text_deltas(&["hello"]).remove(0);
        store.store_update("fresh", delta).await.unwrap();
        let key = StorageKey::state_vector("fresh").encode();
        assert!(kv.get(&key).unwrap().is_some());
        let docs = store.list_documents(DEFAULT_KEY_PAGE).await.unwrap();
        assert_eq!(docs, vec!["fresh".to_string()]);
    }

    #[tokio::test]
    async fn test_replay_matches_direct_merge() {
        let (kv, store) = store(2);
        for delta in text_deltas(&["A", "B", "C"]) {
            store.store_update("doc1", delta).await.unwrap();
        }
        let doc = store.get_document("doc1").await.unwrap();
        assert_eq!(text_of(&doc), "ABC");
        // Three entries exceed the threshold of two: one merged entry remains.
        assert_eq!(update_keys(&kv, "doc1"), vec![3]);
    }

    #[tokio::test]
    async fn test_below_threshold_keeps_log() {
        let (kv, store) = store(DEFAULT_COMPACTION_THRESHOLD);
        for delta in text_deltas(&["x", "y"]) {
            store.store_update("doc", delta).await.unwrap();
        }
        let doc = store.get_document("doc").await.unwrap();
        assert_eq!(text_of(&doc), "xy");
        assert_eq!(update_keys(&kv, "doc"), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_clocks_continue_after_compaction() {
        let (_kv, store) = store(DEFAULT_COMPACTION_THRESHOLD);
        let mut deltas = text_deltas(&["a", "b", "c"]).into_iter();
        store.store_update("d", deltas.next().unwrap()).await.unwrap();
        store.store_update("d", deltas.next().unwrap()).await.unwrap();
        let flushed = store.flush_document("d").await.unwrap();
        assert_eq!(flushed, Some(2));
        let next = store.store_update("d", deltas.next().unwrap()).await.unwrap();
        assert_eq!(next, 3);
    }

    #[tokio::test]
    async fn test_flush_is_idempotent() {
        let (kv, store) = store(DEFAULT_COMPACTION_THRESHOLD);
        for delta in text_deltas(&["one", "two"]) {
            store.store_update("doc", delta).await.unwrap();
        }
        let first = store.flush_document("doc").await.unwrap();
        let summary = store.get_state_summary("doc").await.unwrap();
        let second = store.flush_document("doc").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.get_state_summary("doc").await.unwrap(), summary);
        assert_eq!(update_keys(&kv, "doc").len(), 1);
    }

    #[tokio::test]
    async fn test_flush_empty_document() {
        let (kv, store) = store(DEFAULT_COMPACTION_THRESHOLD);
        assert_eq!(store.flush_document("nothing").await, Some(None));
        assert!(kv.is_empty());
    }

    #[tokio::test]
    async fn test_stale_summary_is_recomputed() {
        let (kv, store) = store(DEFAULT_COMPACTION_THRESHOLD);
        let deltas = text_deltas(&["a", "b"]);
        store.store_update("doc", deltas[0].clone()).await.unwrap();
        store.store_update("doc", deltas[1].clone()).await.unwrap();

        let summary = store.get_state_summary("doc").await.unwrap();
        let (_, expected) = merge_updates(deltas.iter().map(Vec::as_slice)).unwrap();
        assert_eq!(summary, expected);

        // The recompute compacted the log and left a summary at the max clock.
        let max = update_keys(&kv, "doc").into_iter().max().unwrap();
        let (clock, _) = read_state_vector(kv.as_ref(), "doc").unwrap().unwrap();
        assert_eq!(clock, max);
    }

    #[tokio::test]
    async fn test_summary_of_unknown_document_writes_nothing() {
        let (kv, store) = store(DEFAULT_COMPACTION_THRESHOLD);
        let summary = store.get_state_summary("ghost").await.unwrap();
        assert_eq!(summary, StateVector::default().encode_v1());
        assert!(kv.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_flush_deletes_nothing() {
        let (kv, store) = store(usize::MAX);
        let chunks: Vec<String> = (0..MAX_CLEAR_KEYS + 1).map(|i| format!("{i},")).collect();
        let refs: Vec<&str> = chunks.iter().map(String::as_str).collect();
        for delta in text_deltas(&refs) {
            store.store_update("big", delta).await.unwrap();
        }
        let before = kv.keys();
        assert_eq!(store.flush_document("big").await, None);
        assert_eq!(kv.keys(), before);
    }

    #[tokio::test]
    async fn test_large_backlog_compacts_oldest_on_open() {
        let (kv, store) = store(MAX_CLEAR_KEYS);
        let chunks: Vec<String> = (0..MAX_CLEAR_KEYS + 10).map(|i| format!("{i};")).collect();
        let refs: Vec<&str> = chunks.iter().map(String::as_str).collect();
        for delta in text_deltas(&refs) {
            store.store_update("big", delta).await.unwrap();
        }
        let doc = store.get_document("big").await.unwrap();
        assert_eq!(text_of(&doc), chunks.concat());
        // 128 oldest entries folded into one.
        assert_eq!(update_keys(&kv, "big").len(), 11);

        let reopened = store.get_document("big").await.unwrap();
        assert_eq!(text_of(&reopened), chunks.concat());
    }

    #[tokio::test]
    async fn test_write_state_persists_full_state() {
        let (kv, store) = store(DEFAULT_COMPACTION_THRESHOLD);
        let deltas = text_deltas(&["p", "q"]);
        store.store_update("doc", deltas[0].clone()).await.unwrap();
        let (state, _) = merge_updates(deltas.iter().map(Vec::as_slice)).unwrap();
        store.write_state("doc", state).await.unwrap();
        assert_eq!(update_keys(&kv, "doc").len(), 1);
        let doc = store.get_document("doc").await.unwrap();
        assert_eq!(text_of(&doc), "pq");
    }

    #[tokio::test]
    async fn test_corrupt_update_does_not_stall_queue() {
        let (kv, store) = store(DEFAULT_COMPACTION_THRESHOLD);
        kv.put(&StorageKey::update("bad", 0).encode(), &[0xFF, 0xFF, 0xFF])
            .unwrap();
        assert!(store.get_document("bad").await.is_none());
        let delta = text_deltas(&["ok"]).remove(0);
        assert_eq!(store.store_update("good", delta).await, Some(0));
    }

    #[tokio::test]
    async fn test_panicking_substrate_is_isolated() {
        struct Exploding;
        impl KvStore for Exploding {
            fn get(&self, _: &str) -> Result<Option<Vec<u8>>, StoreError> {
                panic!("boom")
            }
            fn put(&self, _: &str, _: &[u8]) -> Result<(), StoreError> {
                panic!("boom")
            }
            fn delete(&self, _: &[String]) -> Result<usize, StoreError> {
                Ok(0)
            }
            fn list(&self, _: &KeyRange) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
                panic!("boom")
            }
            fn delete_all(&self) -> Result<(), StoreError> {
                Ok(())
            }
        }
        let store = UpdateLogStore::new(Arc::new(Exploding));
        assert!(store.store_update("doc", vec![0, 0]).await.is_none());
        assert_eq!(store.clear_all().await, Some(()));
    }

    #[tokio::test]
    async fn test_dropped_handle_still_runs() {
        let (kv, store) = store(DEFAULT_COMPACTION_THRESHOLD);
        let delta = text_deltas(&["late"]).remove(0);
        drop(store.store_update("doc", delta));
        // Queue order guarantees the earlier write has landed.
        let keys = store.list_keys(DEFAULT_KEY_PAGE).await.unwrap();
        assert!(keys.contains(&StorageKey::update("doc", 0)));
        assert!(!kv.is_empty());
    }

    #[tokio::test]
    async fn test_clock_overflow_refuses_write() {
        let (kv, store) = store(DEFAULT_COMPACTION_THRESHOLD);
        let mut deltas = text_deltas(&["a", "b"]).into_iter();
        kv.put(
            &StorageKey::update("full", MAX_CLOCK).encode(),
            &deltas.next().unwrap(),
        )
        .unwrap();
        let before = kv.keys();
        assert!(store.store_update("full", deltas.next().unwrap()).await.is_none());
        assert_eq!(kv.keys(), before);
    }

    #[tokio::test]
    async fn test_last_valid_clock_is_seen() {
        let (kv, store) = store(DEFAULT_COMPACTION_THRESHOLD);
        let mut deltas = text_deltas(&["a", "b"]).into_iter();
        kv.put(
            &StorageKey::update("edge", MAX_CLOCK - 1).encode(),
            &deltas.next().unwrap(),
        )
        .unwrap();
        let clock = store.store_update("edge", deltas.next().unwrap()).await.unwrap();
        assert_eq!(clock, MAX_CLOCK);
        let doc = store.get_document("edge").await.unwrap();
        assert_eq!(text_of(&doc), "ab");
    }

    #[tokio::test]
    async fn test_clear_all() {
        let (kv, store) = store(DEFAULT_COMPACTION_THRESHOLD);
        for delta in text_deltas(&["a"]) {
            store.store_update("doc", delta).await.unwrap();
        }
        store.clear_all().await.unwrap();
        assert!(kv.is_empty());
        assert!(store.list_keys(10).await.unwrap().is_empty());
    }
}
