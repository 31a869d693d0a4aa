//! Vector index seam.
//!
//! The engine only ever talks to the index through this trait; the
//! Qdrant client implements it in production and tests substitute
//! in-memory doubles.

use std::time::Duration;

use recall_models::{Exchange, IndexHealth, RetrievalResult};
use recall_qdrant::QdrantIndex;

use crate::Result;

#[async_trait::async_trait]
pub trait VectorIndex: Send + Sync {
    /// Idempotent write of one exchange point.
    async fn upsert(&self, exchange: &Exchange, vector: Vec<f32>) -> Result<()>;

    /// Similarity search within one tenant, descending score order,
    /// filtered server-side to `score >= min_score`.
    async fn search(
        &self,
        tenant_id: i64,
        vector: Vec<f32>,
        limit: usize,
        min_score: f32,
    ) -> Result<Vec<RetrievalResult>>;

    /// Bounded-latency health probe.
    async fn health(&self, timeout: Duration) -> IndexHealth;

    /// Create or repair the backing collection for `dimension`.
    async fn ensure_ready(&self, dimension: usize) -> Result<()>;
}

#[async_trait::async_trait]
impl VectorIndex for QdrantIndex {
    async fn upsert(&self, exchange: &Exchange, vector: Vec<f32>) -> Result<()> {
        QdrantIndex::upsert(self, exchange, vector).await?;
        Ok(())
    }

    async fn search(
        &self,
        tenant_id: i64,
        vector: Vec<f32>,
        limit: usize,
        min_score: f32,
    ) -> Result<Vec<RetrievalResult>> {
        Ok(QdrantIndex::search(self, tenant_id, vector, limit, min_score).await?)
    }

    async fn health(&self, timeout: Duration) -> IndexHealth {
        QdrantIndex::health(self, timeout).await
    }

    async fn ensure_ready(&self, dimension: usize) -> Result<()> {
        QdrantIndex::ensure_collection(self, dimension).await?;
        Ok(())
    }
}
