//! Context assembly over the log and the index.
//!
//! The write path appends to the durable log and hands the exchange to
//! the index worker. The read path tries semantic retrieval first and
//! falls back to recency when the query cannot be embedded, the
//! circuit is open, or the search fails or returns nothing. One
//! response always comes from exactly one of the two sources.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use recall_embeddings::Embedder;
use recall_log::ExchangeLog;
use recall_models::{Exchange, NewExchange, RetrievalResult};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::RetrievalConfig;
use crate::services::breaker::{CircuitBreaker, CircuitState};
use crate::services::index::VectorIndex;
use crate::services::indexer::IndexQueue;
use crate::{Error, Result};

/// Which path produced a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextSource {
    Semantic,
    Recent,
}

/// A rendered context transcript.
#[derive(Debug, Clone, Serialize)]
pub struct AssembledContext {
    pub context: String,
    pub source: ContextSource,
}

/// Engine health snapshot for the health endpoint.
#[derive(Debug, Clone, Copy)]
pub struct EngineHealth {
    pub log_ok: bool,
    pub circuit: CircuitState,
}

/// The engine facade handlers talk to.
#[derive(Clone)]
pub struct ContextService {
    inner: Arc<Inner>,
}

struct Inner {
    log: Arc<ExchangeLog>,
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn Embedder>,
    breaker: Arc<CircuitBreaker>,
    queue: IndexQueue,
    retrieval: RetrievalConfig,
    log_read_timeout: Duration,
}

impl ContextService {
    pub fn new(
        log: Arc<ExchangeLog>,
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn Embedder>,
        breaker: Arc<CircuitBreaker>,
        queue: IndexQueue,
        retrieval: RetrievalConfig,
        log_read_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                log,
                index,
                embedder,
                breaker,
                queue,
                retrieval,
                log_read_timeout,
            }),
        }
    }

    /// Record one exchange: durable append first, then hand it to the
    /// index worker. The append alone decides success.
    pub async fn record(&self, tenant_id: i64, new: NewExchange) -> Result<Exchange> {
        let exchange = self.inner.log.append(tenant_id, new).await?;
        self.inner.queue.enqueue(exchange.clone());
        Ok(exchange)
    }

    /// Assemble a context transcript for a query.
    ///
    /// Semantic retrieval when the full path works and finds hits;
    /// recency fallback otherwise. Only a log failure is fatal.
    pub async fn build_context(
        &self,
        tenant_id: i64,
        query: &str,
        max_chars: Option<usize>,
    ) -> Result<AssembledContext> {
        let query = query.trim();
        if query.is_empty() {
            return Err(Error::InvalidInput("Query must not be empty".to_string()));
        }

        let budget = max_chars
            .unwrap_or(self.inner.retrieval.max_context_chars)
            .min(self.inner.retrieval.max_context_chars);

        if let Some(hits) = self.semantic_candidates(tenant_id, query).await {
            if !hits.is_empty() {
                let candidates: Vec<Exchange> = hits.into_iter().map(|r| r.exchange).collect();
                return Ok(AssembledContext {
                    context: assemble(candidates, budget),
                    source: ContextSource::Semantic,
                });
            }
            debug!(tenant_id, "No semantic hits above threshold - falling back to recency");
        }

        let recent = tokio::time::timeout(
            self.inner.log_read_timeout,
            self.inner.log.read_recent(tenant_id, self.inner.retrieval.top_k),
        )
        .await
        .map_err(|_| Error::Timeout("Durable log read timed out".to_string()))??;

        // Most recent exchanges get budget priority.
        let candidates: Vec<Exchange> = recent.into_iter().rev().collect();
        Ok(AssembledContext {
            context: assemble(candidates, budget),
            source: ContextSource::Recent,
        })
    }

    pub fn health(&self) -> EngineHealth {
        EngineHealth {
            log_ok: self.inner.log.is_healthy(),
            circuit: self.inner.breaker.state(),
        }
    }

    /// Run the semantic path end to end. `None` means the path is
    /// unavailable and the caller should fall back; `Some(vec![])`
    /// means the path worked but nothing scored above the floor.
    async fn semantic_candidates(
        &self,
        tenant_id: i64,
        query: &str,
    ) -> Option<Vec<RetrievalResult>> {
        let retrieval = &self.inner.retrieval;

        let vector = match tokio::time::timeout(
            retrieval.embed_timeout,
            self.inner.embedder.embed(query),
        )
        .await
        {
            Ok(Ok(v)) => v,
            Ok(Err(e)) => {
                warn!(tenant_id, error = %e, "Query embedding failed - falling back to recency");
                return None;
            }
            Err(_) => {
                warn!(tenant_id, "Query embedding timed out - falling back to recency");
                return None;
            }
        };

        let Some(call) = self.inner.breaker.try_acquire() else {
            debug!(tenant_id, "Circuit open - skipping semantic search");
            return None;
        };

        match tokio::time::timeout(
            retrieval.search_timeout,
            self.inner
                .index
                .search(tenant_id, vector, retrieval.top_k, retrieval.min_score),
        )
        .await
        {
            Ok(Ok(hits)) => {
                self.inner.breaker.record_success(call);
                debug!(tenant_id, count = hits.len(), "Semantic search completed");
                Some(hits)
            }
            Ok(Err(e)) => {
                self.inner.breaker.record_failure(call);
                warn!(tenant_id, error = %e, "Semantic search failed - falling back to recency");
                None
            }
            Err(_) => {
                self.inner.breaker.record_failure(call);
                warn!(tenant_id, "Semantic search timed out - falling back to recency");
                None
            }
        }
    }
}

/// Select whole exchanges into the budget, then render chronologically.
///
/// Candidates arrive in priority order (score or recency). Selection
/// is greedy and stops at the first exchange that would overflow, so
/// a context never contains a truncated exchange.
fn assemble(candidates: Vec<Exchange>, max_chars: usize) -> String {
    let mut seen = HashSet::new();
    let mut selected: Vec<Exchange> = Vec::new();
    let mut total = 0usize;

    for exchange in candidates {
        if !seen.insert(exchange.sequence_id) {
            continue;
        }
        let line_len = render_line(&exchange).chars().count();
        let sep = usize::from(!selected.is_empty());
        if total + sep + line_len > max_chars {
            break;
        }
        total += sep + line_len;
        selected.push(exchange);
    }

    selected.sort_by_key(|e| e.sequence_id);

    let lines: Vec<String> = selected.iter().map(render_line).collect();
    lines.join("\n")
}

/// One transcript line: `[timestamp] Role (name): text`.
fn render_line(exchange: &Exchange) -> String {
    let timestamp = exchange.created_at.format("%Y-%m-%d %H:%M:%S");
    let label = exchange.author_kind.label();
    match &exchange.author_name {
        Some(name) => format!("[{}] {} ({}): {}", timestamp, label, name, exchange.text),
        None => format!("[{}] {}: {}", timestamp, label, exchange.text),
    }
}
