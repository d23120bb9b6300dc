//! Fan-out of encoded frames to every connection on a document.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers.
//! Each connection gets an independent receiver that buffers up to
//! `capacity` frames. The sender's own connection is not filtered out:
//! updates and awareness entries are idempotent to re-receive.
//!
//! Reference: Patterson & Hennessy, Section 6.4 — Interconnection Networks

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::protocol::{self, Message};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    /// Frames skipped by lagging receivers.
    pub messages_dropped: u64,
    pub receivers: usize,
}

/// Atomic broadcast stats, read via [`BroadcastGroup::stats`].
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// The broadcast channel of a single document.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    capacity: usize,
    stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// `capacity` is how many frames a receiver may fall behind before it lags.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity: capacity.max(1),
            stats: AtomicBroadcastStats::default(),
        }
    }

    /// Receiver for one connection.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.sender.subscribe()
    }

    /// Encode once and send to every receiver. Returns the receiver count.
    pub fn broadcast(&self, msg: &Message) -> usize {
        self.broadcast_raw(Arc::new(protocol::encode(msg)))
    }

    /// Broadcast pre-encoded bytes.
    pub fn broadcast_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(encoded).unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record `skipped` frames lost by a lagging receiver.
    pub fn record_lag(&self, skipped: u64) {
        self.stats
            .messages_dropped
            .fetch_add(skipped, Ordering::Relaxed);
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            receivers: self.receiver_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SyncMessage;

    #[tokio::test]
    async fn test_broadcast_fan_out_includes_origin() {
        let group = BroadcastGroup::new(16);
        let mut origin = group.subscribe();
        let mut peer1 = group.subscribe();
        let mut peer2 = group.subscribe();

        let msg = Message::Sync(SyncMessage::Update(vec![1, 2, 3]));
        assert_eq!(group.broadcast(&msg), 3);

        let expected = protocol::encode(&msg);
        assert_eq!(*origin.recv().await.unwrap(), expected);
        assert_eq!(*peer1.recv().await.unwrap(), expected);
        assert_eq!(*peer2.recv().await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_broadcast_raw_zero_copy() {
        let group = BroadcastGroup::new(16);
        let mut rx = group.subscribe();

        let data = Arc::new(vec![10, 20, 30]);
        assert_eq!(group.broadcast_raw(data.clone()), 1);

        let received = rx.recv().await.unwrap();
        assert!(Arc::ptr_eq(&received, &data));
    }

    #[tokio::test]
    async fn test_broadcast_without_receivers() {
        let group = BroadcastGroup::new(4);
        assert_eq!(group.broadcast_raw(Arc::new(vec![1])), 0);
        assert_eq!(group.stats().messages_sent, 1);
    }

    #[tokio::test]
    async fn test_lagging_receiver() {
        let group = BroadcastGroup::new(2);
        let mut rx = group.subscribe();
        for i in 0..5u8 {
            group.broadcast_raw(Arc::new(vec![i]));
        }
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(skipped)) => group.record_lag(skipped),
            other => panic!("expected lag, got {other:?}"),
        }
        assert_eq!(group.stats().messages_dropped, 3);
        assert_eq!(*rx.recv().await.unwrap(), vec![3]);
    }

    #[tokio::test]
    async fn test_stats() {
        let group = BroadcastGroup::new(32);
        let _rx = group.subscribe();
        group.broadcast(&Message::AwarenessQuery);
        group.broadcast(&Message::AwarenessQuery);

        let stats = group.stats();
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.receivers, 1);
        assert_eq!(group.capacity(), 32);
    }
}
