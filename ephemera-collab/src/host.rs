//! Actor activation and request dispatch.
//!
//! The host maps each [`DocumentKey`] to the mailbox of its actor. A command
//! for a key without a running actor (never activated, evicted, or idled
//! out) spawns a fresh one, which reloads the document from storage on its
//! first command. A stopping actor keeps its slot until it has flushed:
//! commands that arrive meanwhile wait for it (outside the map lock) and
//! only then spawn the replacement, so the final flush always lands before
//! the reload and a key never has two live actors.
//!
//! The host also owns the channel registry and drains fired alarms into
//! `Alarm` commands.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch, Mutex};

use crate::actor::{
    self, ActorCommand, ActorContext, CreatedDocument, DocumentLimits, InboundFrame, Reply,
};
use crate::alarm::{AlarmError, AlarmScheduler};
use crate::channels::{ChannelAttachment, ChannelRegistry, ConnectionId};
use crate::clock::Clock;
use crate::document::{DocumentKey, DocumentMeta};
use crate::error::DocumentError;
use crate::id::DocumentId;
use crate::storage::Storage;

/// Host configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostConfig {
    pub limits: DocumentLimits,
    /// Evict an actor after this long without commands (default: 5 minutes)
    pub idle_eviction: Option<Duration>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            limits: DocumentLimits::default(),
            idle_eviction: Some(Duration::from_secs(300)),
        }
    }
}

struct ActorSlot {
    tx: mpsc::UnboundedSender<ActorCommand>,
    stopped: watch::Receiver<bool>,
}

impl ActorSlot {
    /// The actor has finished its final flush (or panicked).
    fn is_stopped(&self) -> bool {
        *self.stopped.borrow() || self.stopped.has_changed().is_err()
    }

    /// Resolves once the actor has stopped. Holds no borrow of the slot.
    fn wait_stopped(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut stopped = self.stopped.clone();
        async move {
            let _ = stopped.wait_for(|done| *done).await;
        }
    }
}

struct HostInner {
    ctx: ActorContext,
    actors: Mutex<HashMap<DocumentKey, ActorSlot>>,
    activations: AtomicU64,
    /// Set by `shutdown`; no new actors are spawned afterwards
    closing: AtomicBool,
}

/// Routes every request for a document to its single actor.
#[derive(Clone)]
pub struct DocumentHost {
    inner: Arc<HostInner>,
}

impl DocumentHost {
    /// Create a host. Must be called from within a tokio runtime.
    pub fn new(storage: Arc<dyn Storage>, clock: Arc<dyn Clock>, config: HostConfig) -> Self {
        let (alarms, fired) = AlarmScheduler::new(storage.clone(), clock.clone());
        let inner = Arc::new(HostInner {
            ctx: ActorContext {
                storage,
                alarms,
                clock,
                channels: Arc::new(ChannelRegistry::new()),
                limits: config.limits,
                idle_eviction: config.idle_eviction,
            },
            actors: Mutex::new(HashMap::new()),
            activations: AtomicU64::new(0),
            closing: AtomicBool::new(false),
        });
        tokio::spawn(deliver_alarms(Arc::downgrade(&inner), fired));
        Self { inner }
    }

    /// Re-arm persisted alarms after a restart.
    pub fn recover(&self) -> Result<usize, AlarmError> {
        self.inner.ctx.alarms.recover()
    }

    /// Handle for the document behind a public identifier.
    pub fn document(&self, id: &DocumentId) -> DocumentHandle {
        self.handle(DocumentKey::from_id(id))
    }

    pub fn handle(&self, key: DocumentKey) -> DocumentHandle {
        DocumentHandle {
            host: self.clone(),
            key,
        }
    }

    pub fn channels(&self) -> &Arc<ChannelRegistry> {
        &self.inner.ctx.channels
    }

    pub fn alarms(&self) -> &Arc<AlarmScheduler> {
        &self.inner.ctx.alarms
    }

    /// Total number of actors spawned so far.
    pub fn activations(&self) -> u64 {
        self.inner.activations.load(Ordering::SeqCst)
    }

    /// Number of actors currently running.
    pub async fn resident(&self) -> usize {
        self.inner
            .actors
            .lock()
            .await
            .values()
            .filter(|slot| !slot.is_stopped())
            .count()
    }

    /// Stop the actor of `key` after it flushes. Returns false if none was running.
    ///
    /// The slot stays in place until the actor has stopped, so a concurrent
    /// request either reaches the old actor before it closes its mailbox or
    /// waits for the flush before a replacement loads from storage.
    pub async fn evict(&self, key: DocumentKey) -> bool {
        let stopping = {
            let actors = self.inner.actors.lock().await;
            match actors.get(&key) {
                Some(slot) if !slot.is_stopped() => {
                    let _ = slot.tx.send(ActorCommand::Evict);
                    slot.wait_stopped()
                }
                _ => return false,
            }
        };
        stopping.await;
        self.forget_stopped(key).await;
        log::debug!("Evicted actor for {key}");
        true
    }

    /// Evict every actor, flushing unsaved edits. Commands arriving after
    /// this point are dropped instead of activating new actors.
    pub async fn shutdown(&self) {
        self.inner.closing.store(true, Ordering::SeqCst);
        let stopping: Vec<_> = {
            let actors = self.inner.actors.lock().await;
            actors
                .values()
                .map(|slot| {
                    let _ = slot.tx.send(ActorCommand::Evict);
                    slot.wait_stopped()
                })
                .collect()
        };
        let count = stopping.len();
        futures_util::future::join_all(stopping).await;
        self.inner
            .actors
            .lock()
            .await
            .retain(|_, slot| !slot.is_stopped());
        log::info!("Stopped {count} document actors");
    }

    /// Drop the slot of `key` if its actor has stopped.
    async fn forget_stopped(&self, key: DocumentKey) {
        let mut actors = self.inner.actors.lock().await;
        if actors.get(&key).is_some_and(ActorSlot::is_stopped) {
            actors.remove(&key);
        }
    }

    async fn dispatch(&self, key: DocumentKey, mut cmd: ActorCommand) {
        loop {
            let previous = {
                let mut actors = self.inner.actors.lock().await;
                let stopping = match actors.get(&key) {
                    Some(slot) => match slot.tx.send(cmd) {
                        Ok(()) => return,
                        Err(mpsc::error::SendError(returned)) => {
                            cmd = returned;
                            (!slot.is_stopped()).then(|| slot.wait_stopped())
                        }
                    },
                    None => None,
                };

                match stopping {
                    Some(wait) => wait,
                    None => {
                        if self.inner.closing.load(Ordering::SeqCst) {
                            log::debug!("Host shutting down, dropping command for {key}");
                            return;
                        }
                        let (tx, stopped) = actor::spawn(key, self.inner.ctx.clone());
                        self.inner.activations.fetch_add(1, Ordering::SeqCst);
                        let _ = tx.send(cmd);
                        actors.insert(key, ActorSlot { tx, stopped });
                        return;
                    }
                }
            };

            // The previous actor is still flushing; other keys stay unblocked
            previous.await;
        }
    }

    async fn request<T>(
        &self,
        key: DocumentKey,
        make: impl FnOnce(Reply<T>) -> ActorCommand,
    ) -> Result<T, DocumentError> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(key, make(reply)).await;
        rx.await.map_err(|_| DocumentError::Unavailable)?
    }
}

async fn deliver_alarms(host: Weak<HostInner>, mut fired: mpsc::UnboundedReceiver<DocumentKey>) {
    while let Some(key) = fired.recv().await {
        let Some(inner) = host.upgrade() else { break };
        DocumentHost { inner }.dispatch(key, ActorCommand::Alarm).await;
    }
}

/// Address of one document on a host.
#[derive(Clone)]
pub struct DocumentHandle {
    host: DocumentHost,
    key: DocumentKey,
}

impl DocumentHandle {
    pub fn key(&self) -> DocumentKey {
        self.key
    }

    pub async fn create(&self, ttl: &str) -> Result<CreatedDocument, DocumentError> {
        let ttl = ttl.to_string();
        self.host
            .request(self.key, |reply| ActorCommand::Create { ttl, reply })
            .await
    }

    pub async fn meta(&self) -> Result<DocumentMeta, DocumentError> {
        self.host
            .request(self.key, |reply| ActorCommand::Meta { reply })
            .await
    }

    /// Current text content.
    pub async fn raw(&self) -> Result<String, DocumentError> {
        self.host
            .request(self.key, |reply| ActorCommand::Raw { reply })
            .await
    }

    /// Admit a new channel.
    pub async fn connect(&self) -> Result<ChannelAttachment, DocumentError> {
        self.host
            .request(self.key, |reply| ActorCommand::Connect { reply })
            .await
    }

    pub async fn send_frame(&self, conn: ConnectionId, frame: InboundFrame) {
        self.host
            .dispatch(self.key, ActorCommand::Frame { conn, frame })
            .await;
    }

    /// Detach a channel and let the actor announce the new presence count.
    pub async fn detach(&self, conn: ConnectionId, errored: bool) {
        let Some(group) = self.host.channels().get(self.key).await else {
            return;
        };
        if group.detach(conn).await {
            self.host
                .dispatch(self.key, ActorCommand::ChannelClosed { conn, errored })
                .await;
        }
    }

    /// Deliver the expiry alarm now.
    pub async fn alarm(&self) {
        self.host.dispatch(self.key, ActorCommand::Alarm).await;
    }

    pub async fn evict(&self) -> bool {
        self.host.evict(self.key).await
    }
}
