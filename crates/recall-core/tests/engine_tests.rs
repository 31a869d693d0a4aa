//! Engine integration tests over in-memory index and embedder doubles.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use recall_core::config::{IndexingConfig, RetrievalConfig};
use recall_core::services::{
    spawn_index_worker, BreakerConfig, CircuitBreaker, ContextService, ContextSource, VectorIndex,
};
use recall_core::{Error, Result};
use recall_embeddings::Embedder;
use recall_log::ExchangeLog;
use recall_models::{AuthorKind, Exchange, IndexHealth, NewExchange, RetrievalResult};

// ============================================================================
// Test doubles
// ============================================================================

/// In-memory index: canned search hits, point store keyed by
/// `(tenant_id, sequence_id)`, and call counters.
#[derive(Default)]
struct MockIndex {
    hits: Mutex<Vec<RetrievalResult>>,
    points: Mutex<HashMap<(i64, u64), Exchange>>,
    search_calls: AtomicUsize,
    upsert_calls: AtomicUsize,
}

impl MockIndex {
    fn seed_hit(&self, exchange: Exchange, score: f32) {
        self.hits
            .lock()
            .unwrap()
            .push(RetrievalResult { exchange, score });
    }
}

#[async_trait::async_trait]
impl VectorIndex for MockIndex {
    async fn upsert(&self, exchange: &Exchange, _vector: Vec<f32>) -> Result<()> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        self.points
            .lock()
            .unwrap()
            .insert((exchange.tenant_id, exchange.sequence_id), exchange.clone());
        Ok(())
    }

    async fn search(
        &self,
        tenant_id: i64,
        _vector: Vec<f32>,
        limit: usize,
        min_score: f32,
    ) -> Result<Vec<RetrievalResult>> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        let mut hits: Vec<RetrievalResult> = self
            .hits
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.exchange.tenant_id == tenant_id && r.score >= min_score)
            .cloned()
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn health(&self, _timeout: Duration) -> IndexHealth {
        IndexHealth::Healthy
    }

    async fn ensure_ready(&self, _dimension: usize) -> Result<()> {
        Ok(())
    }
}

/// Fixed-vector embedder with an optional artificial delay.
struct MockEmbedder {
    delay: Option<Duration>,
}

impl MockEmbedder {
    fn instant() -> Arc<Self> {
        Arc::new(Self { delay: None })
    }

    fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self { delay: Some(delay) })
    }
}

#[async_trait::async_trait]
impl Embedder for MockEmbedder {
    async fn embed(&self, _text: &str) -> recall_embeddings::Result<Vec<f32>> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(vec![0.1; 8])
    }

    fn dimension(&self) -> usize {
        8
    }
}

// ============================================================================
// Harness
// ============================================================================

struct Engine {
    service: ContextService,
    index: Arc<MockIndex>,
    breaker: Arc<CircuitBreaker>,
    _dir: tempfile::TempDir,
}

fn retrieval() -> RetrievalConfig {
    RetrievalConfig {
        top_k: 10,
        min_score: 0.3,
        max_context_chars: 6000,
        search_timeout: Duration::from_secs(1),
        embed_timeout: Duration::from_millis(100),
    }
}

fn indexing() -> IndexingConfig {
    IndexingConfig {
        queue_capacity: 16,
        max_attempts: 3,
        retry_delay: Duration::from_millis(10),
        upsert_timeout: Duration::from_secs(1),
    }
}

async fn engine_with(embedder: Arc<dyn Embedder>, retrieval: RetrievalConfig) -> Engine {
    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(ExchangeLog::open(dir.path()).await.unwrap());
    let index = Arc::new(MockIndex::default());
    let breaker = Arc::new(CircuitBreaker::new(BreakerConfig::default()));

    let queue = spawn_index_worker(
        index.clone(),
        embedder.clone(),
        breaker.clone(),
        indexing(),
    );

    let service = ContextService::new(
        log,
        index.clone(),
        embedder,
        breaker.clone(),
        queue,
        retrieval,
        Duration::from_secs(5),
    );

    Engine {
        service,
        index,
        breaker,
        _dir: dir,
    }
}

async fn engine() -> Engine {
    engine_with(MockEmbedder::instant(), retrieval()).await
}

fn new_exchange(text: &str) -> NewExchange {
    NewExchange {
        author_kind: AuthorKind::Human,
        author_id: Some(42),
        author_name: Some("Alice".to_string()),
        text: text.to_string(),
    }
}

fn stored_exchange(tenant_id: i64, sequence_id: u64, text: &str) -> Exchange {
    Exchange {
        tenant_id,
        sequence_id,
        author_kind: AuthorKind::Human,
        author_id: None,
        author_name: Some("Alice".to_string()),
        text: text.to_string(),
        created_at: Utc::now(),
        embedding: None,
    }
}

async fn wait_for_upserts(index: &MockIndex, count: usize) {
    for _ in 0..200 {
        if index.upsert_calls.load(Ordering::SeqCst) >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "Expected {} upserts, saw {}",
        count,
        index.upsert_calls.load(Ordering::SeqCst)
    );
}

fn open_circuit(breaker: &CircuitBreaker) {
    breaker.record_health(IndexHealth::Unreachable);
    breaker.record_health(IndexHealth::Unreachable);
    breaker.record_health(IndexHealth::Unreachable);
}

// ============================================================================
// Write path
// ============================================================================

#[tokio::test]
async fn test_record_assigns_sequence_and_indexes() {
    let engine = engine().await;

    let first = engine.service.record(7, new_exchange("hello")).await.unwrap();
    let second = engine.service.record(7, new_exchange("world")).await.unwrap();
    assert_eq!(first.sequence_id, 1);
    assert_eq!(second.sequence_id, 2);

    wait_for_upserts(&engine.index, 2).await;
    let points = engine.index.points.lock().unwrap();
    assert_eq!(points.len(), 2);
    assert!(points.contains_key(&(7, 1)));
    assert!(points.contains_key(&(7, 2)));
}

#[tokio::test]
async fn test_concurrent_records_get_distinct_sequences() {
    let engine = engine().await;
    let service_a = engine.service.clone();
    let service_b = engine.service.clone();

    let a = tokio::spawn(async move { service_a.record(7, new_exchange("first")).await });
    let b = tokio::spawn(async move { service_b.record(7, new_exchange("second")).await });

    let mut seqs = vec![
        a.await.unwrap().unwrap().sequence_id,
        b.await.unwrap().unwrap().sequence_id,
    ];
    seqs.sort_unstable();
    assert_eq!(seqs, vec![1, 2]);
}

#[tokio::test]
async fn test_empty_text_rejected_before_logging() {
    let engine = engine().await;
    let result = engine.service.record(7, new_exchange("   ")).await;
    assert!(matches!(result, Err(Error::InvalidInput(_))));
}

#[tokio::test]
async fn test_reindexing_same_exchange_overwrites() {
    let engine = engine().await;
    let recorded = engine.service.record(7, new_exchange("hello")).await.unwrap();
    wait_for_upserts(&engine.index, 1).await;

    // A redelivered exchange lands on the same point.
    engine.index.upsert(&recorded, vec![0.1; 8]).await.unwrap();
    assert_eq!(engine.index.points.lock().unwrap().len(), 1);
    assert_eq!(engine.index.upsert_calls.load(Ordering::SeqCst), 2);
}

// ============================================================================
// Read path: semantic
// ============================================================================

#[tokio::test]
async fn test_semantic_hits_filtered_by_threshold() {
    let engine = engine().await;
    engine
        .index
        .seed_hit(stored_exchange(7, 1, "the relevant answer"), 0.8);
    engine
        .index
        .seed_hit(stored_exchange(7, 2, "noise far below"), 0.2);

    let assembled = engine.service.build_context(7, "question", None).await.unwrap();
    assert_eq!(assembled.source, ContextSource::Semantic);
    assert!(assembled.context.contains("the relevant answer"));
    assert!(!assembled.context.contains("noise far below"));
}

#[tokio::test]
async fn test_semantic_context_in_chronological_order() {
    let engine = engine().await;
    // Higher score but later in the conversation.
    engine.index.seed_hit(stored_exchange(7, 5, "newer"), 0.9);
    engine.index.seed_hit(stored_exchange(7, 2, "older"), 0.5);

    let assembled = engine.service.build_context(7, "question", None).await.unwrap();
    let lines: Vec<&str> = assembled.context.lines().collect();
    assert!(lines[0].contains("older"));
    assert!(lines[1].contains("newer"));
}

#[tokio::test]
async fn test_no_hits_above_threshold_falls_back_to_recency() {
    let engine = engine().await;
    engine.index.seed_hit(stored_exchange(7, 1, "weak match"), 0.1);
    engine.service.record(7, new_exchange("logged message")).await.unwrap();

    let assembled = engine.service.build_context(7, "question", None).await.unwrap();
    assert_eq!(assembled.source, ContextSource::Recent);
    assert!(assembled.context.contains("logged message"));
}

#[tokio::test]
async fn test_budget_respected_on_semantic_path() {
    let engine = engine().await;
    for i in 1..=20 {
        engine.index.seed_hit(
            stored_exchange(7, i, &format!("candidate message {}", i)),
            0.9,
        );
    }

    let assembled = engine
        .service
        .build_context(7, "question", Some(200))
        .await
        .unwrap();
    assert!(assembled.context.chars().count() <= 200);
    // No exchange is cut mid-text: every line is a complete rendering.
    for line in assembled.context.lines() {
        assert!(line.contains("candidate message"));
    }
}

#[tokio::test]
async fn test_requested_budget_clamped_to_configured_max() {
    let mut config = retrieval();
    config.max_context_chars = 120;
    let engine = engine_with(MockEmbedder::instant(), config).await;
    for i in 1..=10 {
        engine.index.seed_hit(
            stored_exchange(7, i, &format!("candidate message {}", i)),
            0.9,
        );
    }

    let assembled = engine
        .service
        .build_context(7, "question", Some(50_000))
        .await
        .unwrap();
    assert!(assembled.context.chars().count() <= 120);
}

// ============================================================================
// Read path: degraded modes
// ============================================================================

#[tokio::test]
async fn test_open_circuit_skips_index_entirely() {
    let engine = engine().await;
    engine.index.seed_hit(stored_exchange(7, 1, "indexed"), 0.9);
    engine.service.record(7, new_exchange("from the log")).await.unwrap();

    open_circuit(&engine.breaker);
    let searches_before = engine.index.search_calls.load(Ordering::SeqCst);

    let assembled = engine.service.build_context(7, "question", None).await.unwrap();
    assert_eq!(assembled.source, ContextSource::Recent);
    assert!(assembled.context.contains("from the log"));
    assert_eq!(
        engine.index.search_calls.load(Ordering::SeqCst),
        searches_before
    );
}

#[tokio::test]
async fn test_slow_embedder_falls_back_to_recency() {
    let engine = engine_with(MockEmbedder::slow(Duration::from_secs(5)), retrieval()).await;
    engine.service.record(7, new_exchange("still reachable")).await.unwrap();

    let assembled = engine.service.build_context(7, "question", None).await.unwrap();
    assert_eq!(assembled.source, ContextSource::Recent);
    assert!(assembled.context.contains("still reachable"));
}

#[tokio::test]
async fn test_empty_query_rejected() {
    let engine = engine().await;
    let result = engine.service.build_context(7, "  ", None).await;
    assert!(matches!(result, Err(Error::InvalidInput(_))));
}

#[tokio::test]
async fn test_unknown_tenant_yields_empty_context() {
    let engine = engine().await;
    let assembled = engine.service.build_context(999, "question", None).await.unwrap();
    assert_eq!(assembled.source, ContextSource::Recent);
    assert!(assembled.context.is_empty());
}

// ============================================================================
// Tenant isolation
// ============================================================================

#[tokio::test]
async fn test_fallback_context_is_tenant_scoped() {
    let engine = engine().await;
    engine.service.record(7, new_exchange("for tenant seven")).await.unwrap();
    engine.service.record(8, new_exchange("for tenant eight")).await.unwrap();
    open_circuit(&engine.breaker);

    let assembled = engine.service.build_context(7, "question", None).await.unwrap();
    assert!(assembled.context.contains("for tenant seven"));
    assert!(!assembled.context.contains("for tenant eight"));
}

#[tokio::test]
async fn test_semantic_context_is_tenant_scoped() {
    let engine = engine().await;
    engine.index.seed_hit(stored_exchange(7, 1, "for tenant seven"), 0.9);
    engine.index.seed_hit(stored_exchange(8, 1, "for tenant eight"), 0.9);

    let assembled = engine.service.build_context(7, "question", None).await.unwrap();
    assert_eq!(assembled.source, ContextSource::Semantic);
    assert!(assembled.context.contains("for tenant seven"));
    assert!(!assembled.context.contains("for tenant eight"));
}

// ============================================================================
// Health
// ============================================================================

#[tokio::test]
async fn test_health_reflects_circuit_state() {
    let engine = engine().await;
    assert!(engine.service.health().log_ok);
    assert_eq!(engine.service.health().circuit.as_str(), "closed");

    open_circuit(&engine.breaker);
    assert_eq!(engine.service.health().circuit.as_str(), "open");
}
