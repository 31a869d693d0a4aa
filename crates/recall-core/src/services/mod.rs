//! Service layer: the engine proper, behind the HTTP surface.

pub mod breaker;
pub mod context;
pub mod index;
pub mod indexer;

pub use breaker::{BreakerConfig, CircuitBreaker, CircuitState};
pub use context::{AssembledContext, ContextService, ContextSource, EngineHealth};
pub use index::VectorIndex;
pub use indexer::{spawn_health_monitor, spawn_index_worker, IndexQueue};
