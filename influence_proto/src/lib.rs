//! Wire contracts shared by every client taking part in influence replication.
//!
//! Messages travel as JSON inside a [`SyncEnvelope`]. Field names are camelCase
//! to match the host message bus.

use std::borrow::Borrow;
use std::fmt;
use std::hash::{BuildHasher, Hasher};

use ahash::RandomState;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// Cache key for one logical NPC presence (token id or character id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityKey(pub String);

impl IdentityKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for IdentityKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for IdentityKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for IdentityKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identifier of a connected client (GM or player session).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub String);

impl ClientId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Cached and replicated influence of one NPC presence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InfluenceRecord {
    pub identity_key: IdentityKey,
    pub npc_id: String,
    pub npc_name: String,
    #[serde(default)]
    pub token_id: Option<String>,
    #[serde(default)]
    pub token_name: Option<String>,
    #[serde(default)]
    pub actor_link: bool,
    pub tag_influence: i64,
    pub status_influence: i64,
    pub total_influence: i64,
    /// Wall-clock milliseconds at computation time. Debug only.
    #[serde(default)]
    pub timestamp: u64,
}

impl InfluenceRecord {
    /// `total_influence == tag_influence + status_influence`, without
    /// overflow.
    pub fn is_consistent(&self) -> bool {
        self.component_total() == Some(self.total_influence)
    }

    /// Sum of the two components, `None` when it does not fit in an `i64`.
    pub fn component_total(&self) -> Option<i64> {
        self.tag_influence.checked_add(self.status_influence)
    }

    /// Rewrites `total_influence` from its two components. Records whose
    /// components overflow have no valid total and yield `None`.
    pub fn normalized(mut self) -> Option<Self> {
        self.total_influence = self.component_total()?;
        Some(self)
    }

    pub fn has_influence(&self) -> bool {
        self.total_influence != 0
    }

    /// Compares the three influence fields, ignoring identity and timestamp.
    pub fn same_influence(&self, other: &InfluenceRecord) -> bool {
        self.tag_influence == other.tag_influence
            && self.status_influence == other.status_influence
            && self.total_influence == other.total_influence
    }
}

/// Replication messages exchanged over the broadcast channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncMessage {
    #[serde(rename_all = "camelCase")]
    InfluenceUpdate {
        identity_key: IdentityKey,
        record: InfluenceRecord,
    },
    #[serde(rename_all = "camelCase")]
    InfluenceDelete { identity_key: IdentityKey },
    #[serde(rename_all = "camelCase")]
    RequestSnapshot { requester_id: ClientId },
    #[serde(rename_all = "camelCase")]
    BulkSnapshot {
        requester_id: ClientId,
        #[serde(default, deserialize_with = "lenient_records")]
        records: Vec<InfluenceRecord>,
    },
    RefreshSignal,
}

impl SyncMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            SyncMessage::InfluenceUpdate { .. } => "influenceUpdate",
            SyncMessage::InfluenceDelete { .. } => "influenceDelete",
            SyncMessage::RequestSnapshot { .. } => "requestSnapshot",
            SyncMessage::BulkSnapshot { .. } => "bulkSnapshot",
            SyncMessage::RefreshSignal => "refreshSignal",
        }
    }

    /// Key targeted by per-identity messages (updates and deletes).
    pub fn identity_key(&self) -> Option<&IdentityKey> {
        match self {
            SyncMessage::InfluenceUpdate { identity_key, .. }
            | SyncMessage::InfluenceDelete { identity_key } => Some(identity_key),
            _ => None,
        }
    }
}

/// Snapshot payloads from older or buggy peers may carry a non-array `records`
/// field or entries that do not parse. Both collapse to whatever parses.
fn lenient_records<'de, D>(deserializer: D) -> Result<Vec<InfluenceRecord>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    let serde_json::Value::Array(entries) = value else {
        return Ok(Vec::new());
    };
    Ok(entries
        .into_iter()
        .filter_map(|entry| serde_json::from_value(entry).ok())
        .collect())
}

/// Message plus sender metadata as it travels on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncEnvelope {
    pub sender: ClientId,
    /// Per-sender counter, for ordering diagnostics only.
    pub seq: u64,
    pub message: SyncMessage,
}

impl SyncEnvelope {
    pub fn new(sender: ClientId, seq: u64, message: SyncMessage) -> Self {
        Self {
            sender,
            seq,
            message,
        }
    }
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("envelope encode failed: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("envelope decode failed: {0}")]
    Decode(#[source] serde_json::Error),
}

pub fn encode_envelope(envelope: &SyncEnvelope) -> Result<Vec<u8>, WireError> {
    serde_json::to_vec(envelope).map_err(WireError::Encode)
}

pub fn decode_envelope(data: &[u8]) -> Result<SyncEnvelope, WireError> {
    serde_json::from_slice(data).map_err(WireError::Decode)
}

pub fn encode_envelope_json(envelope: &SyncEnvelope) -> Result<String, WireError> {
    serde_json::to_string(envelope).map_err(WireError::Encode)
}

pub fn decode_envelope_json(data: &str) -> Result<SyncEnvelope, WireError> {
    serde_json::from_str(data).map_err(WireError::Decode)
}

/// Order-independent digest over the influence content of a record set.
///
/// Timestamps are excluded so that two clients holding the same values agree
/// even when each computed them locally.
pub fn hash_records<'a, I>(records: I) -> u64
where
    I: IntoIterator<Item = &'a InfluenceRecord>,
{
    let mut sorted: Vec<&InfluenceRecord> = records.into_iter().collect();
    sorted.sort_unstable_by(|a, b| a.identity_key.cmp(&b.identity_key));

    let mut hasher = RandomState::with_seeds(0, 0, 0, 0).build_hasher();
    for record in sorted {
        write_str(&mut hasher, record.identity_key.as_str());
        write_str(&mut hasher, &record.npc_id);
        write_str(&mut hasher, record.token_id.as_deref().unwrap_or(""));
        hasher.write_u8(record.actor_link as u8);
        hasher.write_i64(record.tag_influence);
        hasher.write_i64(record.status_influence);
        hasher.write_i64(record.total_influence);
    }
    hasher.finish()
}

fn write_str(hasher: &mut impl Hasher, value: &str) {
    hasher.write(value.as_bytes());
    hasher.write_u8(0xff);
}
