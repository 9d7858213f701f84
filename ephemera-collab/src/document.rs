//! Document data model: TTLs, metadata records and store keys.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::DocumentError;
use crate::id::DocumentId;
use crate::storage::StoreError;

const HOUR_MS: u64 = 60 * 60 * 1000;

/// Namespace for hashing public identifiers into document keys.
const KEY_NAMESPACE: Uuid = Uuid::from_u128(0x6570_6865_6d65_7261_2d64_6f63_7300_0001);

/// Time-to-live chosen at creation. Never extended afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Ttl {
    #[serde(rename = "24h")]
    Day,
    #[serde(rename = "7d")]
    Week,
    #[serde(rename = "30d")]
    Month,
}

impl Ttl {
    pub const ALL: [Ttl; 3] = [Ttl::Day, Ttl::Week, Ttl::Month];

    pub fn duration_ms(self) -> u64 {
        match self {
            Ttl::Day => 24 * HOUR_MS,
            Ttl::Week => 7 * 24 * HOUR_MS,
            Ttl::Month => 30 * 24 * HOUR_MS,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Ttl::Day => "24h",
            Ttl::Week => "7d",
            Ttl::Month => "30d",
        }
    }
}

impl fmt::Display for Ttl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Ttl {
    type Err = DocumentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "24h" => Ok(Ttl::Day),
            "7d" => Ok(Ttl::Week),
            "30d" => Ok(Ttl::Month),
            _ => Err(DocumentError::Validation(
                "Invalid TTL. Use 24h, 7d, or 30d".to_string(),
            )),
        }
    }
}

/// Metadata stored alongside the CRDT state.
///
/// `expires_at` is fixed at creation: editing never renews a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMeta {
    /// Creation timestamp (ms since epoch)
    pub created_at: u64,
    /// Expiry timestamp (ms since epoch)
    pub expires_at: u64,
    pub ttl: Ttl,
}

impl DocumentMeta {
    pub fn new(ttl: Ttl, now_ms: u64) -> Self {
        Self {
            created_at: now_ms,
            expires_at: now_ms + ttl.duration_ms(),
            ttl,
        }
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at
    }

    pub(crate) fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(meta)
    }
}

/// Internal address of a document: a UUIDv5 of its public identifier.
///
/// The same identifier always maps to the same key, so every request for a
/// document reaches the same actor and the same store prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentKey(Uuid);

impl DocumentKey {
    pub fn from_id(id: &DocumentId) -> Self {
        Self::from_name(id.as_str())
    }

    pub fn from_name(name: &str) -> Self {
        Self(Uuid::new_v5(&KEY_NAMESPACE, name.as_bytes()))
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
