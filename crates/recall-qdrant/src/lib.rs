//! Qdrant client for the semantic exchange index.
//!
//! One collection holds every tenant's points; every search carries a
//! mandatory `tenant_id` filter, because cross-tenant leakage is a
//! correctness violation, not just a privacy concern. Point ids are
//! derived from `(tenant_id, sequence_id)` so upserts are idempotent
//! and retries are safe.
//!
//! The index is a best-effort secondary store; the exchange log is the
//! source of truth and this client holds no state beyond a connection.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use qdrant_client::qdrant::{
    condition::ConditionOneOf, r#match::MatchValue, value::Kind, Condition,
    CreateCollectionBuilder, Distance, FieldCondition, Filter, Match, ScoredPoint, PointStruct,
    SearchPointsBuilder, UpsertPointsBuilder, Value as QdrantValue, VectorParamsBuilder,
};
use qdrant_client::Qdrant;
use recall_models::{AuthorKind, Exchange, IndexHealth, RetrievalResult};
use tracing::{debug, info, warn};

/// Error types for the index client.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Vector store error: {0}")]
    VectorStore(String),
}

/// Result type for the index client.
pub type Result<T> = std::result::Result<T, Error>;

/// Configuration for the index client.
#[derive(Debug, Clone)]
pub struct QdrantConfig {
    pub url: String,
    pub collection: String,
}

impl QdrantConfig {
    pub fn new(url: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            collection: collection.into(),
        }
    }
}

/// Point payload key names
const KEY_TENANT_ID: &str = "tenant_id";
const KEY_SEQUENCE_ID: &str = "sequence_id";
const KEY_AUTHOR_KIND: &str = "author_kind";
const KEY_AUTHOR_NAME: &str = "author_name";
const KEY_CREATED_AT: &str = "created_at";
const KEY_TEXT: &str = "text";

/// Payload text excerpt bound, so results render without a log lookup
/// while keeping point payloads small.
const EXCERPT_MAX_CHARS: usize = 1000;

/// Typed wrapper over the Qdrant vector index.
pub struct QdrantIndex {
    client: Qdrant,
    collection: String,
}

impl QdrantIndex {
    /// Create a client for the configured Qdrant instance.
    ///
    /// Does not require the server to be reachable yet; startup must
    /// survive an index outage, so reachability is the health probe's
    /// concern.
    pub fn connect(config: &QdrantConfig) -> Result<Self> {
        let client = Qdrant::from_url(&config.url)
            .build()
            .map_err(|e| Error::VectorStore(format!("Failed to build Qdrant client: {}", e)))?;

        info!(url = %config.url, collection = %config.collection, "Qdrant index client created");

        Ok(Self {
            client,
            collection: config.collection.clone(),
        })
    }

    /// Create the collection if it doesn't exist.
    /// If the collection exists but has a different dimension, it will
    /// be deleted and recreated with the correct dimension.
    pub async fn ensure_collection(&self, dimension: usize) -> Result<()> {
        let exists = self
            .client
            .collection_exists(&self.collection)
            .await
            .map_err(|e| Error::VectorStore(format!("Failed to check collection: {}", e)))?;

        if exists {
            let existing_dim = self.collection_dimension().await?;

            if existing_dim == dimension {
                debug!(collection = %self.collection, dimension, "Collection already exists with correct dimension");
                return Ok(());
            }

            info!(
                collection = %self.collection,
                existing_dim,
                new_dim = dimension,
                "Collection dimension mismatch - recreating"
            );

            self.client
                .delete_collection(&self.collection)
                .await
                .map_err(|e| {
                    Error::VectorStore(format!("Failed to delete mismatched collection: {}", e))
                })?;
        }

        self.client
            .create_collection(
                CreateCollectionBuilder::new(&self.collection)
                    .vectors_config(VectorParamsBuilder::new(dimension as u64, Distance::Cosine)),
            )
            .await
            .map_err(|e| Error::VectorStore(format!("Failed to create collection: {}", e)))?;

        info!(collection = %self.collection, dimension, "Created Qdrant collection");

        Ok(())
    }

    /// Upsert one exchange point. Idempotent: the point id is derived
    /// from `(tenant_id, sequence_id)`, so re-upserting overwrites.
    pub async fn upsert(&self, exchange: &Exchange, vector: Vec<f32>) -> Result<()> {
        let point = PointStruct::new(
            exchange.point_id().to_string(),
            vector,
            exchange_payload(exchange),
        );

        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection, vec![point]))
            .await
            .map_err(|e| Error::VectorStore(format!("Failed to upsert point: {}", e)))?;

        debug!(
            collection = %self.collection,
            tenant_id = exchange.tenant_id,
            sequence_id = exchange.sequence_id,
            "Upserted exchange point"
        );

        Ok(())
    }

    /// Search one tenant's exchanges by vector similarity.
    ///
    /// Results come back in descending score order; the score
    /// threshold and tenant filter are applied server-side.
    pub async fn search(
        &self,
        tenant_id: i64,
        vector: Vec<f32>,
        limit: usize,
        min_score: f32,
    ) -> Result<Vec<RetrievalResult>> {
        let builder = SearchPointsBuilder::new(&self.collection, vector, limit as u64)
            .filter(tenant_filter(tenant_id))
            .score_threshold(min_score)
            .with_payload(true);

        let response = self
            .client
            .search_points(builder)
            .await
            .map_err(|e| Error::VectorStore(format!("Search failed: {}", e)))?;

        let results: Vec<RetrievalResult> = response
            .result
            .into_iter()
            .filter_map(scored_point_to_result)
            .collect();

        debug!(
            collection = %self.collection,
            tenant_id,
            count = results.len(),
            "Index search completed"
        );

        Ok(results)
    }

    /// Cheap, bounded-latency health probe (not a full query).
    pub async fn health(&self, timeout: Duration) -> IndexHealth {
        let probe = async {
            self.client
                .health_check()
                .await
                .map_err(|e| Error::VectorStore(e.to_string()))?;

            self.client
                .collection_exists(&self.collection)
                .await
                .map_err(|e| Error::VectorStore(e.to_string()))
        };

        match tokio::time::timeout(timeout, probe).await {
            Ok(Ok(true)) => IndexHealth::Healthy,
            Ok(Ok(false)) => IndexHealth::Degraded,
            Ok(Err(e)) => {
                debug!(error = %e, "Index health probe failed");
                IndexHealth::Unreachable
            }
            Err(_) => IndexHealth::Unreachable,
        }
    }

    async fn collection_dimension(&self) -> Result<usize> {
        let info = self
            .client
            .collection_info(&self.collection)
            .await
            .map_err(|e| Error::VectorStore(format!("Failed to get collection info: {}", e)))?;

        Ok(info
            .result
            .as_ref()
            .and_then(|r| r.config.as_ref())
            .and_then(|c| c.params.as_ref())
            .and_then(|p| p.vectors_config.as_ref())
            .and_then(|vc| match vc.config.as_ref() {
                Some(qdrant_client::qdrant::vectors_config::Config::Params(params)) => {
                    Some(params.size as usize)
                }
                _ => None,
            })
            .unwrap_or(0))
    }
}

/// Mandatory tenant isolation filter for search.
fn tenant_filter(tenant_id: i64) -> Filter {
    Filter {
        must: vec![make_match_condition(KEY_TENANT_ID, &tenant_id.to_string())],
        ..Default::default()
    }
}

/// Create a keyword match condition for a field.
fn make_match_condition(key: &str, value: &str) -> Condition {
    Condition {
        condition_one_of: Some(ConditionOneOf::Field(FieldCondition {
            key: key.to_string(),
            r#match: Some(Match {
                match_value: Some(MatchValue::Keyword(value.to_string())),
            }),
            ..Default::default()
        })),
    }
}

/// Build the point payload for an exchange.
///
/// Carries enough to render a context line without a log lookup;
/// text is bounded to an excerpt.
fn exchange_payload(exchange: &Exchange) -> HashMap<String, QdrantValue> {
    let mut payload = HashMap::new();
    payload.insert(
        KEY_TENANT_ID.to_string(),
        QdrantValue::from(exchange.tenant_id.to_string()),
    );
    payload.insert(
        KEY_SEQUENCE_ID.to_string(),
        QdrantValue::from(exchange.sequence_id as i64),
    );
    payload.insert(
        KEY_AUTHOR_KIND.to_string(),
        QdrantValue::from(match exchange.author_kind {
            AuthorKind::Human => "human",
            AuthorKind::Agent => "agent",
        }),
    );
    if let Some(name) = &exchange.author_name {
        payload.insert(KEY_AUTHOR_NAME.to_string(), QdrantValue::from(name.clone()));
    }
    payload.insert(
        KEY_CREATED_AT.to_string(),
        QdrantValue::from(exchange.created_at.to_rfc3339()),
    );
    payload.insert(
        KEY_TEXT.to_string(),
        QdrantValue::from(exchange.excerpt(EXCERPT_MAX_CHARS).to_string()),
    );
    payload
}

/// Rebuild a retrieval result from a scored point.
///
/// Malformed payloads are logged and skipped rather than failing the
/// whole search.
fn scored_point_to_result(point: ScoredPoint) -> Option<RetrievalResult> {
    let payload = &point.payload;

    let tenant_id: i64 = match get_str(payload, KEY_TENANT_ID).and_then(|s| s.parse().ok()) {
        Some(id) => id,
        None => {
            warn!("Skipping index point without a valid tenant_id");
            return None;
        }
    };

    let sequence_id = match get_i64(payload, KEY_SEQUENCE_ID) {
        Some(id) if id > 0 => id as u64,
        _ => {
            warn!(tenant_id, "Skipping index point without a valid sequence_id");
            return None;
        }
    };

    let author_kind = match get_str(payload, KEY_AUTHOR_KIND).and_then(|s| s.parse().ok()) {
        Some(kind) => kind,
        None => {
            warn!(tenant_id, sequence_id, "Skipping index point with unknown author kind");
            return None;
        }
    };

    let created_at = get_str(payload, KEY_CREATED_AT)
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    let text = get_str(payload, KEY_TEXT).unwrap_or_default();
    if text.is_empty() {
        warn!(tenant_id, sequence_id, "Skipping index point without text");
        return None;
    }

    Some(RetrievalResult {
        exchange: Exchange {
            tenant_id,
            sequence_id,
            author_kind,
            author_id: None,
            author_name: get_str(payload, KEY_AUTHOR_NAME),
            text,
            created_at,
            embedding: None,
        },
        score: point.score,
    })
}

fn get_str(payload: &HashMap<String, QdrantValue>, key: &str) -> Option<String> {
    match payload.get(key).and_then(|v| v.kind.as_ref()) {
        Some(Kind::StringValue(s)) => Some(s.clone()),
        _ => None,
    }
}

fn get_i64(payload: &HashMap<String, QdrantValue>, key: &str) -> Option<i64> {
    match payload.get(key).and_then(|v| v.kind.as_ref()) {
        Some(Kind::IntegerValue(i)) => Some(*i),
        _ => None,
    }
}
