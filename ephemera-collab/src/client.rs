//! Headless editor client.
//!
//! Speaks the editor wire protocol over a WebSocket and keeps a local
//! [`TextEngine`] replica in step with the server:
//! - sends `SyncStep1` as soon as the channel opens
//! - merges the `SyncStep2` answer and every relayed `Update`
//! - pushes local edits as `Update` frames
//! - surfaces control messages as [`EditorEvent`]s

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::document::Ttl;
use crate::engine::{MergeError, TextEngine};
use crate::protocol::{ServerMessage, SyncFrame};

/// Client errors.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("server refused the channel with status {0}")]
    Rejected(u16),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("connection closed")]
    Closed,
    #[error(transparent)]
    Merge(#[from] MergeError),
}

/// What happened on the channel.
#[derive(Debug, Clone, PartialEq)]
pub enum EditorEvent {
    Meta { expires_at: u64, ttl: Ttl },
    /// Live editors on the document, this one included
    Presence(usize),
    /// The server's full state has been merged
    Synced,
    /// A remote edit was merged into the local replica
    RemoteUpdate,
    Expired,
    ServerError(String),
    /// The channel ended; `code` is the close code if the server sent one
    Closed { code: Option<u16> },
}

/// One editor attached to one document.
pub struct EditorClient {
    engine: Arc<Mutex<TextEngine>>,
    outgoing: mpsc::UnboundedSender<Message>,
    events: mpsc::UnboundedReceiver<EditorEvent>,
    synced: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl EditorClient {
    /// Open a channel to `url` (e.g. `ws://host/d/{id}/ws`) and request the
    /// document state.
    pub async fn connect(url: &str) -> Result<Self, ClientError> {
        let (socket, _) = match tokio_tungstenite::connect_async(url).await {
            Ok(connected) => connected,
            Err(tungstenite::Error::Http(response)) => {
                return Err(ClientError::Rejected(response.status().as_u16()))
            }
            Err(e) => return Err(e.into()),
        };
        let (mut sink, mut stream) = socket.split();

        let (outgoing, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let writer = tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if sink.send(message).await.is_err() || closing {
                    break;
                }
            }
        });

        let engine = Arc::new(Mutex::new(TextEngine::new()));
        let synced = Arc::new(AtomicBool::new(false));
        let (event_tx, events) = mpsc::unbounded_channel();

        let reader = {
            let engine = engine.clone();
            let synced = synced.clone();
            let outgoing = outgoing.clone();
            tokio::spawn(async move {
                let mut code = None;
                while let Some(incoming) = stream.next().await {
                    let event = match incoming {
                        Ok(Message::Binary(bytes)) => {
                            on_binary(&bytes, &engine, &synced, &outgoing).await
                        }
                        Ok(Message::Text(text)) => on_text(text.as_str()),
                        Ok(Message::Close(frame)) => {
                            code = frame.map(|f| u16::from(f.code));
                            break;
                        }
                        Ok(_) => None,
                        Err(e) => {
                            log::debug!("Editor channel errored: {e}");
                            break;
                        }
                    };
                    if let Some(event) = event {
                        let _ = event_tx.send(event);
                    }
                }
                let _ = event_tx.send(EditorEvent::Closed { code });
            })
        };

        outgoing
            .send(Message::Binary(SyncFrame::SyncStep1.encode().into()))
            .map_err(|_| ClientError::Closed)?;

        Ok(Self {
            engine,
            outgoing,
            events,
            synced,
            reader,
            writer,
        })
    }

    /// Insert `chunk` at `index` and push the edit.
    pub async fn insert(&self, index: u32, chunk: &str) -> Result<(), ClientError> {
        let update = self.engine.lock().await.insert(index, chunk);
        self.push(update)
    }

    /// Remove `len` characters starting at `index` and push the edit.
    pub async fn remove(&self, index: u32, len: u32) -> Result<(), ClientError> {
        let update = self.engine.lock().await.remove(index, len);
        self.push(update)
    }

    /// Current text of the local replica.
    pub async fn text(&self) -> String {
        self.engine.lock().await.text_content()
    }

    /// Whether the server's full state has been merged.
    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    /// Next event from the channel, or `None` once the channel is gone and
    /// every event has been read.
    pub async fn next_event(&mut self) -> Option<EditorEvent> {
        self.events.recv().await
    }

    /// Next event if one is already queued.
    pub fn try_next_event(&mut self) -> Option<EditorEvent> {
        self.events.try_recv().ok()
    }

    /// Ask the server for its full state again.
    pub fn request_sync(&self) -> Result<(), ClientError> {
        self.send_binary(SyncFrame::SyncStep1.encode())
    }

    /// Send arbitrary bytes as a binary frame.
    pub fn send_binary(&self, bytes: Vec<u8>) -> Result<(), ClientError> {
        self.outgoing
            .send(Message::Binary(bytes.into()))
            .map_err(|_| ClientError::Closed)
    }

    /// Send arbitrary text as a text frame.
    pub fn send_text(&self, text: impl Into<String>) -> Result<(), ClientError> {
        self.outgoing
            .send(Message::Text(text.into().into()))
            .map_err(|_| ClientError::Closed)
    }

    /// Close the channel normally and wait for both socket halves to finish.
    pub async fn close(self) {
        let _ = self.outgoing.send(Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        })));
        let _ = self.writer.await;
        let _ = self.reader.await;
    }

    fn push(&self, update: Vec<u8>) -> Result<(), ClientError> {
        self.send_binary(SyncFrame::Update(update).encode())
    }
}

async fn on_binary(
    bytes: &[u8],
    engine: &Mutex<TextEngine>,
    synced: &AtomicBool,
    outgoing: &mpsc::UnboundedSender<Message>,
) -> Option<EditorEvent> {
    let frame = match SyncFrame::decode(bytes) {
        Ok(frame) => frame,
        Err(e) => {
            log::debug!("Ignoring frame from server: {e}");
            return None;
        }
    };
    let engine = engine.lock().await;
    match frame {
        SyncFrame::SyncStep2(state) => {
            let had_local_edits = !synced.load(Ordering::SeqCst) && !engine.is_empty();
            if let Err(e) = engine.apply_update(&state) {
                log::warn!("Server state could not be merged: {e}");
                return None;
            }
            // Edits made before the first sync may have raced the server snapshot
            if had_local_edits {
                let frame = SyncFrame::Update(engine.encode_full_state());
                let _ = outgoing.send(Message::Binary(frame.encode().into()));
            }
            synced.store(true, Ordering::SeqCst);
            Some(EditorEvent::Synced)
        }
        SyncFrame::Update(update) => match engine.apply_update(&update) {
            Ok(_) => Some(EditorEvent::RemoteUpdate),
            Err(e) => {
                log::warn!("Remote update could not be merged: {e}");
                None
            }
        },
        // Servers never ask editors for state
        SyncFrame::SyncStep1 => None,
    }
}

fn on_text(text: &str) -> Option<EditorEvent> {
    match serde_json::from_str::<ServerMessage>(text) {
        Ok(ServerMessage::Meta { expires_at, ttl }) => Some(EditorEvent::Meta { expires_at, ttl }),
        Ok(ServerMessage::Presence { count }) => Some(EditorEvent::Presence(count)),
        Ok(ServerMessage::Expired) => Some(EditorEvent::Expired),
        Ok(ServerMessage::Error { message }) => Some(EditorEvent::ServerError(message)),
        Err(e) => {
            log::debug!("Ignoring control message {text:?}: {e}");
            None
        }
    }
}
