//! Application state.
//!
//! Wires the log, embedder, index, breaker, and background workers
//! into the one service handlers see.

use std::sync::Arc;

use recall_embeddings::{build_embedder, Embedder};
use recall_log::ExchangeLog;
use recall_qdrant::QdrantIndex;
use tracing::warn;

use crate::config::{Config, Profile};
use crate::services::{
    spawn_health_monitor, spawn_index_worker, BreakerConfig, CircuitBreaker, ContextService,
    VectorIndex,
};
use crate::{Error, Result};

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// The context engine facade.
    pub context: ContextService,
}

impl AppState {
    /// Create a new application state, initializing all services.
    ///
    /// Starts even when the index is down; the health monitor and the
    /// breaker handle it from there.
    pub async fn new(config: &Config) -> Result<Self> {
        let log = Arc::new(ExchangeLog::open(&config.log.dir).await?);

        let embedder = build_embedder(&config.embedding)?;
        check_embedder_profile(config.profile, embedder.as_ref())?;

        let index: Arc<dyn VectorIndex> = Arc::new(QdrantIndex::connect(&config.qdrant)?);

        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig {
            window: config.resilience.window,
            failure_rate: config.resilience.failure_rate,
            min_calls: config.resilience.min_calls,
            cooldown: config.resilience.cooldown,
            max_cooldown: config.resilience.max_cooldown,
            unreachable_trips: config.resilience.unreachable_trips,
        }));

        // Best effort; a down index must not block startup.
        if let Err(e) = index.ensure_ready(embedder.dimension()).await {
            warn!(error = %e, "Index collection not ready at startup - health monitor will retry");
        }

        let queue = spawn_index_worker(
            index.clone(),
            embedder.clone(),
            breaker.clone(),
            config.indexing.clone(),
        );
        spawn_health_monitor(
            index.clone(),
            breaker.clone(),
            config.resilience.clone(),
            embedder.dimension(),
        );

        let context = ContextService::new(
            log,
            index,
            embedder,
            breaker,
            queue,
            config.retrieval.clone(),
            config.log.read_timeout,
        );

        Ok(Self { context })
    }
}

/// A production deployment must never run on the hash placeholder;
/// its vectors are not semantic and retrieval would be garbage.
pub fn check_embedder_profile(profile: Profile, embedder: &dyn Embedder) -> Result<()> {
    if profile.is_production() && embedder.is_placeholder() {
        return Err(Error::Configuration(
            "Placeholder embedder is not allowed in production".to_string(),
        ));
    }
    Ok(())
}
