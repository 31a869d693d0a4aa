//! Configuration management for the recall engine.
//!
//! Loads configuration from environment variables with support for:
//! - Embedding provider auto-detection from API key presence
//! - Retrieval and resilience tuning knobs with sensible defaults
//! - A deployment profile that gates the placeholder embedder

use std::env;
use std::time::Duration;

use recall_embeddings::{
    default_dimension, default_endpoint, default_model, EmbeddingConfig, ProviderConfig,
    ProviderKind,
};
use recall_qdrant::QdrantConfig;

use crate::{Error, Result};

/// Deployment profile, from `RECALL_ENV`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    Development,
    Production,
}

impl Profile {
    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }
}

impl std::str::FromStr for Profile {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            _ => Err(format!("Unknown profile: {}", s)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub profile: Profile,
    pub server: ServerConfig,
    pub log: LogConfig,
    pub qdrant: QdrantConfig,
    pub embedding: EmbeddingConfig,
    pub retrieval: RetrievalConfig,
    pub resilience: ResilienceConfig,
    pub indexing: IndexingConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Directory holding the per-tenant exchange files.
    pub dir: String,
    /// Bound on fallback log reads during context assembly.
    pub read_timeout: Duration,
}

/// Knobs for context assembly.
#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    /// Candidate count for both semantic search and recency fallback.
    pub top_k: usize,
    /// Similarity floor applied server-side by the index.
    pub min_score: f32,
    /// Upper bound on the rendered context, in characters.
    pub max_context_chars: usize,
    /// Bound on the index search call.
    pub search_timeout: Duration,
    /// Bound on embedding the query text.
    pub embed_timeout: Duration,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 10,
            min_score: 0.3,
            max_context_chars: 6000,
            search_timeout: Duration::from_secs(5),
            embed_timeout: Duration::from_secs(10),
        }
    }
}

/// Circuit breaker and health monitoring knobs.
#[derive(Debug, Clone)]
pub struct ResilienceConfig {
    /// Rolling window over which call outcomes are counted.
    pub window: Duration,
    /// Failure fraction that opens the circuit.
    pub failure_rate: f32,
    /// Minimum calls in the window before the rate is meaningful.
    pub min_calls: usize,
    /// Initial open-state cooldown before a probe is allowed.
    pub cooldown: Duration,
    /// Cap on the doubled cooldown after repeated failed probes.
    pub max_cooldown: Duration,
    /// Consecutive unreachable health probes that open the circuit.
    pub unreachable_trips: u32,
    /// Interval between background health probes.
    pub health_interval: Duration,
    /// Bound on a single health probe.
    pub health_timeout: Duration,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            failure_rate: 0.5,
            min_calls: 4,
            cooldown: Duration::from_secs(30),
            max_cooldown: Duration::from_secs(300),
            unreachable_trips: 3,
            health_interval: Duration::from_secs(15),
            health_timeout: Duration::from_secs(3),
        }
    }
}

/// Background index-writer knobs.
#[derive(Debug, Clone)]
pub struct IndexingConfig {
    /// Bounded queue between the write path and the index worker.
    pub queue_capacity: usize,
    /// Attempts per exchange before it is left unindexed.
    pub max_attempts: u32,
    /// Base retry delay; doubled per attempt.
    pub retry_delay: Duration,
    /// Bound on a single upsert call.
    pub upsert_timeout: Duration,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            max_attempts: 5,
            retry_delay: Duration::from_millis(500),
            upsert_timeout: Duration::from_secs(5),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let profile: Profile = env_or("RECALL_ENV", "development")
            .parse()
            .map_err(Error::Configuration)?;

        let embedding = Self::parse_embedding_config()?;

        let config = Self {
            profile,
            server: ServerConfig {
                host: env_or("HOST", "0.0.0.0"),
                port: parse_env("PORT", "8780")?,
            },
            log: LogConfig {
                dir: env_or("LOG_DIR", "./data/log"),
                read_timeout: Duration::from_secs(parse_env("LOG_READ_TIMEOUT", "5")?),
            },
            qdrant: QdrantConfig::new(
                env_or("QDRANT_URL", "http://localhost:6334"),
                env_or("QDRANT_COLLECTION", "chat_context"),
            ),
            embedding,
            retrieval: RetrievalConfig {
                top_k: parse_env("RETRIEVAL_TOP_K", "10")?,
                min_score: parse_env("RETRIEVAL_MIN_SCORE", "0.3")?,
                max_context_chars: parse_env("MAX_CONTEXT_CHARS", "6000")?,
                search_timeout: Duration::from_secs(parse_env("SEARCH_TIMEOUT", "5")?),
                embed_timeout: Duration::from_secs(parse_env("EMBED_TIMEOUT", "10")?),
            },
            resilience: ResilienceConfig {
                window: Duration::from_secs(parse_env("BREAKER_WINDOW", "60")?),
                failure_rate: parse_env("BREAKER_FAILURE_RATE", "0.5")?,
                min_calls: parse_env("BREAKER_MIN_CALLS", "4")?,
                cooldown: Duration::from_secs(parse_env("BREAKER_COOLDOWN", "30")?),
                max_cooldown: Duration::from_secs(parse_env("BREAKER_MAX_COOLDOWN", "300")?),
                unreachable_trips: parse_env("BREAKER_UNREACHABLE_TRIPS", "3")?,
                health_interval: Duration::from_secs(parse_env("HEALTH_INTERVAL", "15")?),
                health_timeout: Duration::from_secs(parse_env("HEALTH_TIMEOUT", "3")?),
            },
            indexing: IndexingConfig {
                queue_capacity: parse_env("INDEX_QUEUE_CAPACITY", "1024")?,
                max_attempts: parse_env("INDEX_MAX_ATTEMPTS", "5")?,
                retry_delay: Duration::from_millis(parse_env("INDEX_RETRY_DELAY_MS", "500")?),
                upsert_timeout: Duration::from_secs(parse_env("INDEX_UPSERT_TIMEOUT", "5")?),
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Parse the embedding provider from environment.
    ///
    /// `EMBEDDING_PROVIDER` selects explicitly; otherwise the provider
    /// is detected from API key presence (Gemini, then OpenAI, then
    /// Ollama). No provider at all yields the hash placeholder, which
    /// `validate` rejects in production.
    fn parse_embedding_config() -> Result<EmbeddingConfig> {
        let kind = match env::var("EMBEDDING_PROVIDER") {
            Ok(name) => Some(name.parse::<ProviderKind>().map_err(Error::Configuration)?),
            Err(_) => {
                if env::var("GOOGLE_API_KEY").is_ok() {
                    Some(ProviderKind::Gemini)
                } else if env::var("OPENAI_API_KEY").is_ok() {
                    Some(ProviderKind::OpenAi)
                } else if env::var("OLLAMA_URL").is_ok() {
                    Some(ProviderKind::Ollama)
                } else {
                    None
                }
            }
        };

        let provider = match kind {
            None => None,
            Some(kind) => {
                let api_key = match kind {
                    ProviderKind::Gemini => env::var("GOOGLE_API_KEY").map_err(|_| {
                        Error::Configuration("Gemini embeddings need GOOGLE_API_KEY".to_string())
                    })?,
                    ProviderKind::OpenAi => env::var("OPENAI_API_KEY").map_err(|_| {
                        Error::Configuration("OpenAI embeddings need OPENAI_API_KEY".to_string())
                    })?,
                    // Local, unauthenticated
                    ProviderKind::Ollama => String::new(),
                };

                let base_url = match kind {
                    ProviderKind::Ollama => env_or("OLLAMA_URL", default_endpoint(kind)),
                    _ => env_or("EMBEDDING_BASE_URL", default_endpoint(kind)),
                };

                Some(ProviderConfig {
                    kind,
                    base_url,
                    model: env_or("EMBEDDING_MODEL", default_model(kind)),
                    api_key,
                })
            }
        };

        let default_dim = provider
            .as_ref()
            .map(|p| default_dimension(&p.model))
            .unwrap_or(384);

        Ok(EmbeddingConfig {
            dimension: parse_env("EMBEDDING_DIMENSION", &default_dim.to_string())?,
            max_input_chars: parse_env("EMBEDDING_MAX_INPUT_CHARS", "8000")?,
            timeout_secs: parse_env("EMBEDDING_TIMEOUT", "30")?,
            provider,
        })
    }

    fn validate(&self) -> Result<()> {
        if self.profile.is_production() && self.embedding.provider.is_none() {
            return Err(Error::Configuration(
                "Production requires a real embedding provider; the hash placeholder is \
                 not semantic"
                    .to_string(),
            ));
        }
        if self.retrieval.top_k == 0 {
            return Err(Error::Configuration(
                "RETRIEVAL_TOP_K must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.resilience.failure_rate) {
            return Err(Error::Configuration(
                "BREAKER_FAILURE_RATE must be between 0 and 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: &str) -> Result<T> {
    let raw = env_or(key, default);
    raw.parse()
        .map_err(|_| Error::Configuration(format!("Invalid {}: {}", key, raw)))
}
