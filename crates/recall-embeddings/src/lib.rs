//! Embedding gateway with pluggable providers.
//!
//! Wraps external text-to-vector APIs (Gemini, OpenAI, Ollama) behind
//! the [`Embedder`] capability trait. The provider is chosen once, at
//! construction time, from configuration. A hash-based placeholder
//! exists for tests and development only; production setups must
//! configure a real provider.
//!
//! Every call is timeout-bounded, input is truncated head-first to a
//! configured character budget, and the returned vector's dimension is
//! validated - a mismatch is a protocol error, fatal to that request
//! but not to the service.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Maximum retries per request before giving up
const MAX_RETRIES: u32 = 2;

/// Delay between retries (doubles each time)
const RETRY_DELAY_MS: u64 = 500;

// ============================================================================
// Error types
// ============================================================================

/// Errors that can occur in the embedding gateway.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Internal error (HTTP client, parsing, timeout)
    #[error("Internal error: {0}")]
    Internal(String),

    /// Provider API error
    #[error("Provider error: {0}")]
    Provider(String),

    /// Malformed provider response (e.g. wrong vector dimension)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Input text empty after trimming
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// No credentials configured
    #[error("No credentials configured")]
    NoCredentials,
}

/// Result type for embedding operations.
pub type Result<T> = std::result::Result<T, Error>;

// ============================================================================
// Configuration types
// ============================================================================

/// Configuration for the embedding gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Configured provider. `None` selects the hash placeholder,
    /// which is only acceptable outside production.
    pub provider: Option<ProviderConfig>,
    /// Expected vector dimension; responses are validated against it.
    pub dimension: usize,
    /// Character budget; longer input is truncated head-preserving.
    pub max_input_chars: usize,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: None,
            dimension: 384,
            max_input_chars: 8000,
            timeout_secs: 30,
        }
    }
}

/// Configuration for a single embedding provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    /// Base URL for the API.
    pub base_url: String,
    /// Model name to use.
    pub model: String,
    /// API key for authentication (empty for local providers).
    pub api_key: String,
}

/// Supported embedding providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Gemini,
    OpenAi,
    Ollama,
}

impl std::str::FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gemini" => Ok(Self::Gemini),
            "openai" => Ok(Self::OpenAi),
            "ollama" => Ok(Self::Ollama),
            _ => Err(format!("Unknown embedding provider: {}", s)),
        }
    }
}

/// Get default endpoint for a provider.
pub fn default_endpoint(kind: ProviderKind) -> &'static str {
    match kind {
        ProviderKind::Gemini => "https://generativelanguage.googleapis.com/v1beta",
        ProviderKind::OpenAi => "https://api.openai.com/v1",
        ProviderKind::Ollama => "http://localhost:11434",
    }
}

/// Get default model for a provider.
pub fn default_model(kind: ProviderKind) -> &'static str {
    match kind {
        ProviderKind::Gemini => "text-embedding-004",
        ProviderKind::OpenAi => "text-embedding-3-small",
        ProviderKind::Ollama => "nomic-embed-text",
    }
}

/// Get default dimension for a model.
pub fn default_dimension(model: &str) -> usize {
    if model.contains("text-embedding-004") || model.contains("embedding-001") {
        768
    } else if model.contains("text-embedding-3-small") {
        1536
    } else if model.contains("text-embedding-3-large") {
        3072
    } else if model.contains("nomic-embed-text") {
        768
    } else if model.contains("all-minilm") || model.contains("MiniLM-L6") {
        384
    } else {
        384 // Default
    }
}

// ============================================================================
// Capability trait
// ============================================================================

/// Text-to-vector capability.
///
/// Implementations are selected by configuration at construction; the
/// rest of the system only ever sees this trait.
#[async_trait::async_trait]
pub trait Embedder: Send + Sync {
    /// Embed one text into a fixed-dimension vector.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// The fixed output dimensionality.
    fn dimension(&self) -> usize;

    /// Whether this embedder is the non-semantic test placeholder.
    fn is_placeholder(&self) -> bool {
        false
    }
}

/// Build the configured embedder.
///
/// `None` provider yields the hash placeholder; callers enforcing a
/// production profile must reject that before calling.
pub fn build_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match &config.provider {
        Some(provider) => Ok(Arc::new(HttpEmbedder::new(provider.clone(), config)?)),
        None => {
            warn!(
                dimension = config.dimension,
                "No embedding provider configured - using hash-based placeholder"
            );
            Ok(Arc::new(HashEmbedder::new(config.dimension)))
        }
    }
}

// ============================================================================
// API response types
// ============================================================================

/// Gemini embedding response.
#[derive(Debug, Deserialize)]
struct GeminiEmbedResponse {
    embedding: Option<GeminiEmbedding>,
    error: Option<GeminiError>,
}

#[derive(Debug, Deserialize)]
struct GeminiEmbedding {
    values: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct GeminiError {
    message: String,
    code: Option<i32>,
}

/// OpenAI embedding response.
#[derive(Debug, Deserialize)]
struct OpenAiEmbedResponse {
    data: Option<Vec<OpenAiEmbedding>>,
    error: Option<OpenAiError>,
}

#[derive(Debug, Deserialize)]
struct OpenAiEmbedding {
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct OpenAiError {
    message: String,
}

/// Ollama embedding response.
#[derive(Debug, Deserialize)]
struct OllamaEmbedResponse {
    embedding: Option<Vec<f32>>,
    error: Option<String>,
}

// ============================================================================
// HTTP embedder
// ============================================================================

/// Embedder backed by an external HTTP provider.
pub struct HttpEmbedder {
    provider: ProviderConfig,
    client: Client,
    dimension: usize,
    max_input_chars: usize,
}

impl HttpEmbedder {
    pub fn new(provider: ProviderConfig, config: &EmbeddingConfig) -> Result<Self> {
        if provider.kind != ProviderKind::Ollama && provider.api_key.is_empty() {
            return Err(Error::NoCredentials);
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            provider,
            client,
            dimension: config.dimension,
            max_input_chars: config.max_input_chars,
        })
    }

    /// Trim, reject empty input, and apply the character budget.
    fn prepare<'a>(&self, text: &'a str) -> Result<&'a str> {
        let text = text.trim();
        if text.is_empty() {
            return Err(Error::InvalidInput(
                "Cannot embed empty text".to_string(),
            ));
        }
        Ok(truncate_chars(text, self.max_input_chars))
    }

    /// Validate the returned vector against the configured dimension.
    fn validate(&self, vector: Vec<f32>) -> Result<Vec<f32>> {
        if vector.len() != self.dimension {
            return Err(Error::Protocol(format!(
                "Embedding dimension mismatch: expected {}, got {}",
                self.dimension,
                vector.len()
            )));
        }
        Ok(vector)
    }

    async fn call(&self, text: &str) -> Result<Vec<f32>> {
        match self.provider.kind {
            ProviderKind::Gemini => self.call_gemini(text).await,
            ProviderKind::OpenAi => self.call_openai(text).await,
            ProviderKind::Ollama => self.call_ollama(text).await,
        }
    }

    /// Call Gemini embedding API.
    async fn call_gemini(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!(
            "{}/models/{}:embedContent?key={}",
            self.provider.base_url, self.provider.model, self.provider.api_key
        );

        let body = json!({
            "model": format!("models/{}", self.provider.model),
            "content": {
                "parts": [{"text": text}]
            }
        });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Internal(format!("Gemini request failed: {}", e)))?;

        let status = response.status();
        let resp: GeminiEmbedResponse = response
            .json()
            .await
            .map_err(|e| Error::Protocol(format!("Failed to parse Gemini response: {}", e)))?;

        if let Some(error) = resp.error {
            return Err(Error::Provider(format!(
                "Gemini error ({}): {}",
                error.code.unwrap_or(status.as_u16() as i32),
                error.message
            )));
        }

        resp.embedding
            .map(|e| e.values)
            .ok_or_else(|| Error::Protocol("No embedding in Gemini response".to_string()))
    }

    /// Call OpenAI embedding API.
    async fn call_openai(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/embeddings", self.provider.base_url);

        let body = json!({
            "model": self.provider.model,
            "input": text,
        });

        let response = self
            .client
            .post(&url)
            .header(
                "Authorization",
                format!("Bearer {}", self.provider.api_key),
            )
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Internal(format!("OpenAI request failed: {}", e)))?;

        let resp: OpenAiEmbedResponse = response
            .json()
            .await
            .map_err(|e| Error::Protocol(format!("Failed to parse OpenAI response: {}", e)))?;

        if let Some(error) = resp.error {
            return Err(Error::Provider(format!("OpenAI error: {}", error.message)));
        }

        resp.data
            .and_then(|d| d.into_iter().next())
            .map(|e| e.embedding)
            .ok_or_else(|| Error::Protocol("No embedding in OpenAI response".to_string()))
    }

    /// Call Ollama embedding API.
    async fn call_ollama(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/api/embeddings", self.provider.base_url);

        let body = json!({
            "model": self.provider.model,
            "prompt": text
        });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Internal(format!("Ollama request failed: {}", e)))?;

        let resp: OllamaEmbedResponse = response
            .json()
            .await
            .map_err(|e| Error::Protocol(format!("Failed to parse Ollama response: {}", e)))?;

        if let Some(error) = resp.error {
            return Err(Error::Provider(format!("Ollama error: {}", error)));
        }

        resp.embedding
            .ok_or_else(|| Error::Protocol("No embedding in Ollama response".to_string()))
    }

    /// Check if an error is retryable (rate limit, temporary failure).
    fn is_retryable(error: &Error) -> bool {
        let msg = error.to_string().to_lowercase();
        matches!(error, Error::Internal(_) | Error::Provider(_))
            && (msg.contains("rate")
                || msg.contains("limit")
                || msg.contains("429")
                || msg.contains("503")
                || msg.contains("timeout")
                || msg.contains("temporarily"))
    }
}

#[async_trait::async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let text = self.prepare(text)?;

        let mut delay = Duration::from_millis(RETRY_DELAY_MS);
        let mut attempt = 0;

        loop {
            match self.call(text).await {
                Ok(vector) => return self.validate(vector),
                Err(e) if Self::is_retryable(&e) && attempt < MAX_RETRIES - 1 => {
                    debug!(
                        provider = ?self.provider.kind,
                        attempt,
                        delay_ms = delay.as_millis(),
                        "Retrying after error"
                    );
                    sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

// ============================================================================
// Hash placeholder
// ============================================================================

/// Deterministic, normalized embedding from hashing.
///
/// NOT semantic - for tests and development bootstrapping only, and
/// flagged as such via [`Embedder::is_placeholder`].
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

#[async_trait::async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let text = text.trim();
        if text.is_empty() {
            return Err(Error::InvalidInput(
                "Cannot embed empty text".to_string(),
            ));
        }
        Ok(hash_embed(text, self.dimension))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn is_placeholder(&self) -> bool {
        true
    }
}

/// Generate a deterministic embedding from text using hashing.
pub fn hash_embed(text: &str, dim: usize) -> Vec<f32> {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut embedding = vec![0.0f32; dim];

    // Use multiple hash seeds to fill the embedding
    for (i, slot) in embedding.iter_mut().enumerate() {
        let mut hasher = DefaultHasher::new();
        text.hash(&mut hasher);
        (i as u64).hash(&mut hasher);
        let hash = hasher.finish();

        // Convert to float in [-1, 1] range
        *slot = ((hash as f64 / u64::MAX as f64) * 2.0 - 1.0) as f32;
    }

    // Normalize to unit length
    let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut embedding {
            *x /= norm;
        }
    }

    embedding
}

/// Head-preserving truncation on a char boundary.
fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

// ============================================================================
// Tests
// ============================================================================
