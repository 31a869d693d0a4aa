//! Data models for the recall context engine.
//!
//! An [`Exchange`] is one recorded unit of conversation, keyed by
//! `(tenant_id, sequence_id)`. The same pair is encoded into a stable
//! UUID for the vector index so that re-upserts overwrite in place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Namespace for deriving vector-index point ids from exchange keys.
const POINT_NAMESPACE: Uuid = Uuid::from_u128(0x8f1c_62d4_9b3a_4e07_a6d5_20c1_7e49_b3f2);

/// Who authored an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorKind {
    Human,
    Agent,
}

impl AuthorKind {
    /// Display label used when rendering context transcripts.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Human => "User",
            Self::Agent => "Assistant",
        }
    }
}

impl std::str::FromStr for AuthorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "human" => Ok(Self::Human),
            "agent" => Ok(Self::Agent),
            _ => Err(format!("Unknown author kind: {}", s)),
        }
    }
}

/// One recorded message or response unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exchange {
    /// Chat/conversation identifier (partition key).
    pub tenant_id: i64,
    /// Monotonically increasing per tenant, assigned at append time.
    pub sequence_id: u64,
    pub author_kind: AuthorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author_name: Option<String>,
    pub text: String,
    pub created_at: DateTime<Utc>,
    /// Present only in flight; the durable log never stores vectors.
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
}

impl Exchange {
    /// Stable point id for this exchange in the vector index.
    pub fn point_id(&self) -> Uuid {
        point_id(self.tenant_id, self.sequence_id)
    }

    /// Bounded prefix of `text`, cut on a char boundary.
    pub fn excerpt(&self, max_chars: usize) -> &str {
        truncate_chars(&self.text, max_chars)
    }
}

/// An exchange as submitted by the transport layer, before the log
/// assigns its sequence number and timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewExchange {
    pub author_kind: AuthorKind,
    #[serde(default)]
    pub author_id: Option<i64>,
    #[serde(default)]
    pub author_name: Option<String>,
    pub text: String,
}

/// Query-time retrieval result; never persisted.
#[derive(Debug, Clone)]
pub struct RetrievalResult {
    pub exchange: Exchange,
    pub score: f32,
}

/// Result of an index health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexHealth {
    /// Reachable and the collection is ready.
    Healthy,
    /// Reachable but not fully serviceable (e.g. collection missing).
    Degraded,
    Unreachable,
}

/// Derive the vector-index point id for `(tenant_id, sequence_id)`.
///
/// UUIDv5 over the pair, so the id is a pure function of the key and
/// re-upserting the same exchange overwrites the existing point.
pub fn point_id(tenant_id: i64, sequence_id: u64) -> Uuid {
    let name = format!("{}:{}", tenant_id, sequence_id);
    Uuid::new_v5(&POINT_NAMESPACE, name.as_bytes())
}

/// Head-preserving truncation on a char boundary.
pub fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
