//! The per-document synchronization actor.
//!
//! One tokio task owns one document: its metadata, its CRDT replica, the
//! dirty flag and the pending persist timer. Every request for the document
//! arrives as an [`ActorCommand`] on a single mailbox and is handled to
//! completion before the next one, so merges, broadcasts, persists and
//! destruction never interleave.
//!
//! ```text
//!  mailbox ──► ensure_live ──► handle ──► ChannelGroup (fan-out)
//!                  │              │
//!                  ▼              ▼
//!              Storage ◄──── persist (debounced via PersistDue)
//! ```
//!
//! Live channels are not owned here: they are looked up in the
//! [`ChannelRegistry`] on every broadcast, so they survive eviction.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::alarm::AlarmScheduler;
use crate::channels::{ChannelAttachment, ChannelRegistry, ConnectionId, Outbound};
use crate::clock::Clock;
use crate::document::{DocumentKey, DocumentMeta, Ttl};
use crate::engine::TextEngine;
use crate::error::DocumentError;
use crate::protocol::{ClientMessage, ServerMessage, SyncFrame};
use crate::storage::{Storage, META_KEY, STATE_KEY};

/// Close code sent to every channel of a destroyed document.
pub const EXPIRED_CLOSE_CODE: u16 = 1000;
pub const EXPIRED_CLOSE_REASON: &str = "Document expired";

/// One-shot reply slot of a request command.
pub type Reply<T> = oneshot::Sender<Result<T, DocumentError>>;

/// A frame received on an editor channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Binary(Vec<u8>),
    Text(String),
}

/// Everything a document actor can be asked to do.
#[derive(Debug)]
pub enum ActorCommand {
    /// Start a fresh lifecycle with the given TTL string
    Create { ttl: String, reply: Reply<CreatedDocument> },
    Meta { reply: Reply<DocumentMeta> },
    /// Current text of the document
    Raw { reply: Reply<String> },
    /// Admit a new editor channel
    Connect { reply: Reply<ChannelAttachment> },
    Frame { conn: ConnectionId, frame: InboundFrame },
    /// A channel went away (already detached from its group)
    ChannelClosed { conn: ConnectionId, errored: bool },
    /// The debounce timer with this generation elapsed
    PersistDue { generation: u64 },
    /// The expiry alarm fired
    Alarm,
    /// Flush and stop; the next command reactivates the document
    Evict,
}

/// Global per-document limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocumentLimits {
    /// Live channels per document (default: 100)
    pub max_connections: usize,
    /// Largest full-state blob that will be persisted (default: 512 KiB)
    pub max_document_bytes: usize,
    /// Quiet period between the first unsaved edit and the write (default: 2s)
    pub persist_debounce: Duration,
}

impl Default for DocumentLimits {
    fn default() -> Self {
        Self {
            max_connections: 100,
            max_document_bytes: 512 * 1024,
            persist_debounce: Duration::from_millis(2000),
        }
    }
}

impl DocumentLimits {
    fn size_limit_message(&self) -> String {
        format!(
            "Document size limit exceeded ({}KB)",
            self.max_document_bytes / 1024
        )
    }
}

/// Result of a successful create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedDocument {
    pub success: bool,
    pub expires_at: u64,
}

/// Collaborators shared by every actor of a host.
#[derive(Clone)]
pub(crate) struct ActorContext {
    pub storage: Arc<dyn Storage>,
    pub alarms: Arc<AlarmScheduler>,
    pub clock: Arc<dyn Clock>,
    pub channels: Arc<ChannelRegistry>,
    pub limits: DocumentLimits,
    pub idle_eviction: Option<Duration>,
}

struct LiveDocument {
    meta: DocumentMeta,
    engine: TextEngine,
}

struct DocumentActor {
    key: DocumentKey,
    ctx: ActorContext,
    /// Used by the persist timer to post back into our own mailbox
    mailbox: mpsc::WeakUnboundedSender<ActorCommand>,
    initialized: bool,
    state: Option<LiveDocument>,
    dirty: bool,
    persist_timer: Option<JoinHandle<()>>,
    persist_generation: u64,
}

/// Start the actor for `key` and return its mailbox and a flag that turns
/// true once the actor has stopped and flushed.
pub(crate) fn spawn(
    key: DocumentKey,
    ctx: ActorContext,
) -> (mpsc::UnboundedSender<ActorCommand>, watch::Receiver<bool>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let actor = DocumentActor {
        key,
        ctx,
        mailbox: tx.downgrade(),
        initialized: false,
        state: None,
        dirty: false,
        persist_timer: None,
        persist_generation: 0,
    };
    let (stopped_tx, stopped) = watch::channel(false);
    tokio::spawn(async move {
        actor.run(rx).await;
        let _ = stopped_tx.send(true);
    });
    (tx, stopped)
}

impl DocumentActor {
    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<ActorCommand>) {
        log::debug!("Activated actor for {}", self.key);

        loop {
            let next = match self.ctx.idle_eviction {
                // Never idle out while edits are unsaved, including ones held
                // back by the size cap
                Some(idle) if self.persist_timer.is_none() && !self.dirty => {
                    match tokio::time::timeout(idle, inbox.recv()).await {
                        Ok(cmd) => cmd,
                        Err(_) => {
                            log::debug!("Actor for {} idle for {idle:?}, evicting", self.key);
                            None
                        }
                    }
                }
                _ => inbox.recv().await,
            };

            match next {
                Some(ActorCommand::Evict) | None => break,
                Some(cmd) => self.handle(cmd).await,
            }
        }

        self.shutdown(&mut inbox).await;
        log::debug!("Actor for {} stopped", self.key);
    }

    /// Refuse new commands, finish the queued ones and flush unsaved edits.
    async fn shutdown(&mut self, inbox: &mut mpsc::UnboundedReceiver<ActorCommand>) {
        inbox.close();
        while let Some(cmd) = inbox.recv().await {
            if !matches!(cmd, ActorCommand::Evict) {
                self.handle(cmd).await;
            }
        }
        self.cancel_persist_timer();
        if self.dirty {
            self.persist().await;
        }
    }

    async fn handle(&mut self, cmd: ActorCommand) {
        match cmd {
            ActorCommand::Create { ttl, reply } => {
                let _ = reply.send(self.create(&ttl).await);
            }
            ActorCommand::Meta { reply } => {
                let result = match self.ensure_live().await {
                    Ok(()) => self.live().map(|live| live.meta),
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            ActorCommand::Raw { reply } => {
                let result = match self.ensure_live().await {
                    Ok(()) => self.live().map(|live| live.engine.text_content()),
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            ActorCommand::Connect { reply } => {
                let _ = reply.send(self.connect().await);
            }
            ActorCommand::Frame { conn, frame } => self.on_frame(conn, frame).await,
            ActorCommand::ChannelClosed { conn, errored } => {
                if errored {
                    log::warn!("Channel {conn} on {} closed with an error", self.key);
                } else {
                    log::debug!("Channel {conn} on {} closed", self.key);
                }
                self.broadcast_presence().await;
                self.ctx.channels.remove_if_empty(self.key).await;
            }
            ActorCommand::PersistDue { generation } => {
                if generation != self.persist_generation {
                    return;
                }
                self.persist_timer = None;
                if self.dirty {
                    self.persist().await;
                }
            }
            ActorCommand::Alarm => {
                log::info!("Expiry alarm fired for {}", self.key);
                self.destroy().await;
            }
            ActorCommand::Evict => {}
        }
    }

    // ─── Lifecycle ────────────────────────────────────────────────────

    /// Load persisted state once per activation and check expiry.
    async fn ensure_live(&mut self) -> Result<(), DocumentError> {
        if !self.initialized {
            self.initialize().await?;
        }
        let now = self.ctx.clock.now_ms();
        let expired = match &self.state {
            None => return Err(DocumentError::NotFound),
            Some(live) => live.meta.is_expired(now),
        };
        if expired {
            log::info!("Document {} expired on access", self.key);
            self.destroy().await;
            return Err(DocumentError::NotFound);
        }
        Ok(())
    }

    fn live(&self) -> Result<&LiveDocument, DocumentError> {
        self.state.as_ref().ok_or(DocumentError::NotFound)
    }

    async fn initialize(&mut self) -> Result<(), DocumentError> {
        let Some(raw_meta) = self.ctx.storage.get(self.key, META_KEY)? else {
            self.initialized = true;
            return Ok(());
        };
        let meta = DocumentMeta::decode(&raw_meta)?;

        if meta.is_expired(self.ctx.clock.now_ms()) {
            log::info!("Document {} found expired while loading", self.key);
            self.destroy().await;
            return Ok(());
        }

        let engine = match self.ctx.storage.get(self.key, STATE_KEY)? {
            Some(blob) => TextEngine::from_state(&blob)?,
            None => TextEngine::new(),
        };
        self.state = Some(LiveDocument { meta, engine });
        self.initialized = true;
        log::debug!("Loaded document {}", self.key);
        Ok(())
    }

    async fn create(&mut self, ttl: &str) -> Result<CreatedDocument, DocumentError> {
        let ttl: Ttl = ttl.parse()?;
        let meta = DocumentMeta::new(ttl, self.ctx.clock.now_ms());
        let engine = TextEngine::new();

        self.cancel_persist_timer();
        self.dirty = false;

        if let Err(e) = self.write_fresh(&meta, &engine) {
            // Whatever reached storage is reloaded on the next access
            self.initialized = false;
            self.state = None;
            log::error!("Failed to create document {}: {e}", self.key);
            return Err(e);
        }

        self.state = Some(LiveDocument { meta, engine });
        self.initialized = true;
        log::info!(
            "Created document {} (ttl {ttl}, expires at {})",
            self.key,
            meta.expires_at
        );
        Ok(CreatedDocument {
            success: true,
            expires_at: meta.expires_at,
        })
    }

    fn write_fresh(&self, meta: &DocumentMeta, engine: &TextEngine) -> Result<(), DocumentError> {
        let encoded = meta.encode()?;
        let state = engine.encode_full_state();
        self.ctx.storage.put(
            self.key,
            &[(META_KEY, encoded.as_slice()), (STATE_KEY, state.as_slice())],
        )?;
        if let Err(e) = self.ctx.alarms.set_alarm(self.key, meta.expires_at) {
            // Without an alarm nothing would ever clean these records up
            if let Err(cleanup) = self.ctx.storage.delete_all(self.key) {
                log::warn!("Failed to remove records of {} after alarm error: {cleanup}", self.key);
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Close every channel, wipe storage and forget the in-memory state.
    ///
    /// Safe to call any number of times.
    async fn destroy(&mut self) {
        self.cancel_persist_timer();
        self.dirty = false;
        let had_state = self.state.take().is_some();
        self.initialized = true;

        if let Some(group) = self.ctx.channels.get(self.key).await {
            let closed = group
                .close_all(
                    Some(ServerMessage::Expired.to_json()),
                    EXPIRED_CLOSE_CODE,
                    EXPIRED_CLOSE_REASON,
                )
                .await;
            if closed > 0 {
                log::info!("Closed {closed} channels of expired document {}", self.key);
            }
        }
        self.ctx.channels.remove_if_empty(self.key).await;

        if let Err(e) = self.ctx.storage.delete_all(self.key) {
            log::error!("Failed to delete records of {}: {e}", self.key);
        }
        if let Err(e) = self.ctx.alarms.cancel(self.key) {
            log::warn!("Failed to cancel alarm of {}: {e}", self.key);
        }

        if had_state {
            log::info!("Destroyed document {}", self.key);
        }
    }

    // ─── Connections ──────────────────────────────────────────────────

    async fn connect(&mut self) -> Result<ChannelAttachment, DocumentError> {
        self.ensure_live().await?;
        let (meta, state) = {
            let live = self.live()?;
            (live.meta, live.engine.encode_full_state())
        };

        let group = self.ctx.channels.get_or_create(self.key).await;
        let max = self.ctx.limits.max_connections;
        if group.count().await >= max {
            log::warn!("Refusing connection to {}: {max} channels already live", self.key);
            return Err(DocumentError::Capacity { max });
        }

        let (id, outbound) = group.attach().await;
        let hello = ServerMessage::Meta {
            expires_at: meta.expires_at,
            ttl: meta.ttl,
        };
        group.send_to(id, Outbound::Text(hello.to_json())).await;
        group
            .send_to(id, Outbound::Binary(Arc::new(SyncFrame::SyncStep2(state).encode())))
            .await;
        self.broadcast_presence().await;

        log::info!(
            "Admitted channel {id} to {} ({} live)",
            self.key,
            group.count().await
        );
        Ok(ChannelAttachment {
            id,
            group,
            outbound,
        })
    }

    async fn broadcast_presence(&self) {
        if let Some(group) = self.ctx.channels.get(self.key).await {
            let count = group.count().await;
            let msg = ServerMessage::Presence { count };
            group.broadcast(Outbound::Text(msg.to_json()), None).await;
        }
    }

    // ─── Sync protocol ────────────────────────────────────────────────

    async fn on_frame(&mut self, conn: ConnectionId, frame: InboundFrame) {
        if let Err(e) = self.ensure_live().await {
            log::debug!("Dropping frame from {conn} for {}: {e}", self.key);
            return;
        }

        match frame {
            InboundFrame::Binary(bytes) => self.on_sync_frame(conn, &bytes).await,
            InboundFrame::Text(text) => match ClientMessage::parse(&text) {
                // Cursor sharing is not relayed
                Some(ClientMessage::Awareness { .. }) => {}
                None => log::debug!("Ignoring unrecognized text frame from {conn}"),
            },
        }
    }

    async fn on_sync_frame(&mut self, conn: ConnectionId, bytes: &[u8]) {
        let frame = match SyncFrame::decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Ignoring bad frame from {conn} on {}: {e}", self.key);
                return;
            }
        };

        match frame {
            SyncFrame::SyncStep1 => {
                let Ok(state) = self.live().map(|live| live.engine.encode_full_state()) else {
                    return;
                };
                let reply = SyncFrame::SyncStep2(state).encode();
                if let Some(group) = self.ctx.channels.get(self.key).await {
                    group.send_to(conn, Outbound::Binary(Arc::new(reply))).await;
                }
            }
            SyncFrame::SyncStep2(update) | SyncFrame::Update(update) => {
                self.merge(conn, &update).await;
            }
        }
    }

    /// Merge an update from `origin`, fan out the delta and schedule a persist.
    async fn merge(&mut self, origin: ConnectionId, update: &[u8]) {
        let merged = match self.live() {
            Ok(live) => live.engine.apply_update(update),
            Err(_) => return,
        };
        let delta = match merged {
            Ok(Some(delta)) => delta,
            Ok(None) => return,
            Err(e) => {
                log::warn!("Rejected update from {origin} on {}: {e}", self.key);
                return;
            }
        };

        log::debug!("Merged {} byte delta from {origin} on {}", delta.len(), self.key);
        if let Some(group) = self.ctx.channels.get(self.key).await {
            let frame = Arc::new(SyncFrame::Update(delta).encode());
            group.broadcast(Outbound::Binary(frame), Some(origin)).await;
        }
        self.schedule_persist();
    }

    // ─── Persistence ──────────────────────────────────────────────────

    fn schedule_persist(&mut self) {
        self.dirty = true;
        if self.persist_timer.is_some() {
            return;
        }

        self.persist_generation += 1;
        let generation = self.persist_generation;
        let mailbox = self.mailbox.clone();
        let delay = self.ctx.limits.persist_debounce;
        self.persist_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = mailbox.upgrade() {
                let _ = tx.send(ActorCommand::PersistDue { generation });
            }
        }));
    }

    fn cancel_persist_timer(&mut self) {
        if let Some(timer) = self.persist_timer.take() {
            timer.abort();
        }
        self.persist_generation += 1;
    }

    /// Write meta and full state in one batch, unless over the size cap.
    async fn persist(&mut self) {
        let Ok((meta, state)) = self
            .live()
            .map(|live| (live.meta, live.engine.encode_full_state()))
        else {
            self.dirty = false;
            return;
        };

        let limits = self.ctx.limits;
        if state.len() > limits.max_document_bytes {
            log::warn!(
                "Document {} is {} bytes, over the {} byte limit; edits kept in memory only",
                self.key,
                state.len(),
                limits.max_document_bytes
            );
            if let Some(group) = self.ctx.channels.get(self.key).await {
                let msg = ServerMessage::Error {
                    message: limits.size_limit_message(),
                };
                group.broadcast(Outbound::Text(msg.to_json()), None).await;
            }
            return;
        }

        let meta = match meta.encode() {
            Ok(meta) => meta,
            Err(e) => {
                log::error!("Failed to encode metadata of {}: {e}", self.key);
                return;
            }
        };
        match self
            .ctx
            .storage
            .put(self.key, &[(META_KEY, meta.as_slice()), (STATE_KEY, state.as_slice())])
        {
            Ok(()) => {
                self.dirty = false;
                log::debug!("Persisted {} ({} bytes)", self.key, state.len());
            }
            Err(e) => log::error!("Failed to persist {}: {e}", self.key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let limits = DocumentLimits::default();
        assert_eq!(limits.max_connections, 100);
        assert_eq!(limits.max_document_bytes, 524_288);
        assert_eq!(limits.persist_debounce, Duration::from_secs(2));
        assert_eq!(
            limits.size_limit_message(),
            "Document size limit exceeded (512KB)"
        );
    }

    #[test]
    fn test_created_document_json() {
        let created = CreatedDocument {
            success: true,
            expires_at: 99,
        };
        assert_eq!(
            serde_json::to_value(created).unwrap(),
            serde_json::json!({"success": true, "expiresAt": 99})
        );
    }
}
