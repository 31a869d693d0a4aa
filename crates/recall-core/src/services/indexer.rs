//! Background index writer and health monitor.
//!
//! Appends to the durable log are acknowledged before the index sees
//! anything; indexing happens here, off the request path, through a
//! bounded queue. A full queue or a dead index never fails a write:
//! the exchange stays in the log and can be found again via the
//! recency fallback or a later replay.

use std::sync::Arc;
use std::time::Duration;

use recall_embeddings::Embedder;
use recall_models::{Exchange, IndexHealth};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{IndexingConfig, ResilienceConfig};
use crate::services::breaker::CircuitBreaker;
use crate::services::index::VectorIndex;

/// Producer handle to the index worker's queue.
#[derive(Clone)]
pub struct IndexQueue {
    tx: mpsc::Sender<Exchange>,
}

impl IndexQueue {
    /// Hand an exchange to the worker. Never blocks; overflow is
    /// dropped with a warning because the log already holds the data.
    pub fn enqueue(&self, exchange: Exchange) {
        let tenant_id = exchange.tenant_id;
        let sequence_id = exchange.sequence_id;
        if self.tx.try_send(exchange).is_err() {
            warn!(
                tenant_id,
                sequence_id, "Index queue full - exchange logged but not indexed"
            );
        }
    }
}

/// Start the background index worker and return its queue handle.
pub fn spawn_index_worker(
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn Embedder>,
    breaker: Arc<CircuitBreaker>,
    config: IndexingConfig,
) -> IndexQueue {
    let (tx, mut rx) = mpsc::channel::<Exchange>(config.queue_capacity);

    tokio::spawn(async move {
        info!(
            queue_capacity = config.queue_capacity,
            "Index worker started"
        );
        while let Some(exchange) = rx.recv().await {
            index_exchange(&*index, &*embedder, &breaker, &config, exchange).await;
        }
        debug!("Index queue closed - worker exiting");
    });

    IndexQueue { tx }
}

/// Embed and upsert one exchange, retrying with backoff.
///
/// Gives up after `max_attempts`; the exchange then stays unindexed
/// until a reindex replays the log.
async fn index_exchange(
    index: &dyn VectorIndex,
    embedder: &dyn Embedder,
    breaker: &CircuitBreaker,
    config: &IndexingConfig,
    exchange: Exchange,
) {
    let tenant_id = exchange.tenant_id;
    let sequence_id = exchange.sequence_id;

    let mut delay = config.retry_delay;
    for attempt in 1..=config.max_attempts {
        if attempt > 1 {
            tokio::time::sleep(delay).await;
            delay *= 2;
        }

        let vector = match embedder.embed(&exchange.text).await {
            Ok(v) => v,
            Err(e) => {
                warn!(tenant_id, sequence_id, attempt, error = %e, "Embedding failed");
                continue;
            }
        };

        // Upserts respect the breaker too: hammering a dead index
        // from the worker would keep it from recovering.
        let Some(call) = breaker.try_acquire() else {
            debug!(tenant_id, sequence_id, attempt, "Circuit open - deferring upsert");
            continue;
        };

        match tokio::time::timeout(config.upsert_timeout, index.upsert(&exchange, vector)).await {
            Ok(Ok(())) => {
                breaker.record_success(call);
                debug!(tenant_id, sequence_id, "Exchange indexed");
                return;
            }
            Ok(Err(e)) => {
                breaker.record_failure(call);
                warn!(tenant_id, sequence_id, attempt, error = %e, "Index upsert failed");
            }
            Err(_) => {
                breaker.record_failure(call);
                warn!(tenant_id, sequence_id, attempt, "Index upsert timed out");
            }
        }
    }

    warn!(
        tenant_id,
        sequence_id,
        attempts = config.max_attempts,
        "Exchange remains unindexed - reindex will pick it up from the log"
    );
}

/// Start the periodic index health monitor.
///
/// Every interval: probe the index, feed the result to the breaker,
/// and repair a missing collection when the index is reachable but
/// degraded.
pub fn spawn_health_monitor(
    index: Arc<dyn VectorIndex>,
    breaker: Arc<CircuitBreaker>,
    config: ResilienceConfig,
    dimension: usize,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.health_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let health = index.health(config.health_timeout).await;
            breaker.record_health(health);

            if health == IndexHealth::Degraded {
                match index.ensure_ready(dimension).await {
                    Ok(()) => info!("Repaired degraded index collection"),
                    Err(e) => warn!(error = %e, "Failed to repair index collection"),
                }
            }
        }
    });
}
