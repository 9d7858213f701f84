//! Live editor channels, grouped per document.
//!
//! The registry is owned by the transport layer, not by document actors, so
//! a channel stays attached while its actor is evicted and reactivated. A
//! reactivated actor finds the same group under its key and keeps fanning
//! out to it.
//!
//! Each connection gets an unbounded outbound queue drained by its socket
//! task; a failed send only means the socket is already gone.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::document::DocumentKey;

/// Identifier of one attached channel.
pub type ConnectionId = Uuid;

/// A message queued for one socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Pre-encoded sync frame, shared across recipients
    Binary(Arc<Vec<u8>>),
    /// JSON control message
    Text(String),
    /// Close the socket with this code; nothing is sent after it
    Close { code: u16, reason: String },
}

/// Counters for monitoring fan-out health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_channels: usize,
}

/// Receiving side of an attached channel.
#[derive(Debug)]
pub struct ChannelAttachment {
    pub id: ConnectionId,
    pub group: Arc<ChannelGroup>,
    pub outbound: mpsc::UnboundedReceiver<Outbound>,
}

/// The channels attached to a single document.
#[derive(Default)]
pub struct ChannelGroup {
    channels: RwLock<HashMap<ConnectionId, mpsc::UnboundedSender<Outbound>>>,
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl std::fmt::Debug for ChannelGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelGroup")
            .field("messages_sent", &self.messages_sent.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ChannelGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new channel and return its id and outbound queue.
    pub async fn attach(&self) -> (ConnectionId, mpsc::UnboundedReceiver<Outbound>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels.write().await.insert(id, tx);
        (id, rx)
    }

    /// Detach a channel. Returns false if it was not attached.
    pub async fn detach(&self, id: ConnectionId) -> bool {
        self.channels.write().await.remove(&id).is_some()
    }

    pub async fn count(&self) -> usize {
        self.channels.read().await.len()
    }

    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.channels.read().await.contains_key(&id)
    }

    /// Queue a message for one channel.
    pub async fn send_to(&self, id: ConnectionId, msg: Outbound) -> bool {
        let channels = self.channels.read().await;
        let delivered = channels.get(&id).is_some_and(|tx| tx.send(msg).is_ok());
        self.record(delivered);
        delivered
    }

    /// Queue a message for every channel except `exclude`.
    ///
    /// Channels whose socket already went away are skipped. Returns the
    /// number of channels the message was queued for.
    pub async fn broadcast(&self, msg: Outbound, exclude: Option<ConnectionId>) -> usize {
        let channels = self.channels.read().await;
        let mut delivered = 0;
        for (id, tx) in channels.iter() {
            if Some(*id) == exclude {
                continue;
            }
            let ok = tx.send(msg.clone()).is_ok();
            self.record(ok);
            if ok {
                delivered += 1;
            }
        }
        delivered
    }

    /// Send `last_words` then a close to every channel and detach them all.
    ///
    /// Returns the number of channels that were attached.
    pub async fn close_all(&self, last_words: Option<String>, code: u16, reason: &str) -> usize {
        let drained: Vec<_> = self.channels.write().await.drain().collect();
        for (_, tx) in &drained {
            if let Some(text) = &last_words {
                let _ = tx.send(Outbound::Text(text.clone()));
            }
            let _ = tx.send(Outbound::Close {
                code,
                reason: reason.to_string(),
            });
        }
        drained.len()
    }

    pub async fn stats(&self) -> ChannelStats {
        ChannelStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            active_channels: self.count().await,
        }
    }

    fn record(&self, delivered: bool) {
        if delivered {
            self.messages_sent.fetch_add(1, Ordering::Relaxed);
        } else {
            self.messages_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Maps document keys to their channel groups.
#[derive(Default)]
pub struct ChannelRegistry {
    groups: RwLock<HashMap<DocumentKey, Arc<ChannelGroup>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the group for a document, if one exists.
    pub async fn get(&self, doc: DocumentKey) -> Option<Arc<ChannelGroup>> {
        self.groups.read().await.get(&doc).cloned()
    }

    /// Get or create the group for a document.
    pub async fn get_or_create(&self, doc: DocumentKey) -> Arc<ChannelGroup> {
        // Fast path: read lock
        if let Some(group) = self.groups.read().await.get(&doc) {
            return group.clone();
        }

        let mut groups = self.groups.write().await;
        groups
            .entry(doc)
            .or_insert_with(|| Arc::new(ChannelGroup::new()))
            .clone()
    }

    /// Drop the group of a document once nothing is attached to it.
    pub async fn remove_if_empty(&self, doc: DocumentKey) -> bool {
        let mut groups = self.groups.write().await;
        if let Some(group) = groups.get(&doc) {
            if group.count().await == 0 {
                groups.remove(&doc);
                return true;
            }
        }
        false
    }

    /// Number of documents with a channel group.
    pub async fn room_count(&self) -> usize {
        self.groups.read().await.len()
    }
}
