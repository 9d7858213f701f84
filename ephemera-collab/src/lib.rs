//! # ephemera-collab: Ephemeral link-shared collaborative documents
//!
//! Every document lives for a fixed TTL (24h, 7d or 30d), is edited in real
//! time by anyone holding its link, and is wiped once the TTL elapses.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  HTTP / WebSocket  ┌──────────────┐
//! │ EditorClient │ ◄────────────────► │ router (axum)│
//! │ (per user)   │   varint frames    └──────┬───────┘
//! └──────────────┘                           │ DocumentHandle
//!                                            ▼
//!                                    ┌──────────────┐
//!                                    │ DocumentHost │── AlarmScheduler
//!                                    └──────┬───────┘
//!                           one mailbox per │ document key
//!                                           ▼
//!                                    ┌──────────────┐     ┌──────────────┐
//!                                    │DocumentActor │────►│ Storage      │
//!                                    │ (TextEngine) │     │ (RocksDB)    │
//!                                    └──────┬───────┘     └──────────────┘
//!                                           │ fan-out
//!                                    ┌──────┴───────┐
//!                                    │ ChannelGroup │ (survives eviction)
//!                                    └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: binary sync frames and JSON control messages
//! - [`engine`]: yrs text replica with the `"content"` container
//! - [`document`]: TTLs, metadata and document keys
//! - [`storage`]: per-document key-value records and durable alarms
//! - [`alarm`]: expiry alarms on top of tokio timers
//! - [`channels`]: transport-owned registry of live editor channels
//! - [`actor`]: the per-document synchronization actor
//! - [`host`]: actor activation, eviction and request dispatch
//! - [`router`]: public HTTP surface and WebSocket pumping
//! - [`server`]: server configuration and startup
//! - [`client`]: headless editor client

pub mod actor;
pub mod alarm;
pub mod channels;
pub mod client;
pub mod clock;
pub mod document;
pub mod engine;
pub mod error;
pub mod host;
pub mod id;
pub mod protocol;
pub mod rate_limit;
pub mod router;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use actor::{ActorCommand, CreatedDocument, DocumentLimits, InboundFrame};
pub use alarm::{AlarmError, AlarmScheduler};
pub use channels::{ChannelAttachment, ChannelGroup, ChannelRegistry, ConnectionId, Outbound};
pub use client::{ClientError, EditorClient, EditorEvent};
pub use clock::{Clock, ManualClock, SystemClock};
pub use document::{DocumentKey, DocumentMeta, Ttl};
pub use engine::{MergeError, TextEngine};
pub use error::DocumentError;
pub use host::{DocumentHandle, DocumentHost, HostConfig};
pub use id::DocumentId;
pub use protocol::{ClientMessage, MessageType, ProtocolError, ServerMessage, SyncFrame};
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use server::{ServerConfig, SyncServer};
pub use storage::{MemoryStore, RocksStore, Storage, StoreConfig, StoreError};
