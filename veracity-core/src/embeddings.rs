//! Pluggable embedding providers for semantic verification.
//!
//! The local feature-hashing embedder is always available and fully
//! deterministic. The OpenAI and Ollama embedders call their HTTP APIs and
//! surface failures as [`EmbeddingError`] so that a single failed call can
//! degrade one claim without aborting the batch.

use crate::config::EmbeddingConfig;
use crate::error::EmbeddingError;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// An external text-embedding model.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text into a fixed-dimension vector.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Dimensionality of returned vectors.
    fn dimensions(&self) -> usize;

    fn provider_name(&self) -> &str;
}

pub type SharedEmbedder = Arc<dyn EmbeddingProvider>;

/// Feature-hashed bag of words, L2-normalized. No network access.
///
/// Each lowercased alphanumeric token lands in a bucket picked by its SHA-256
/// digest, with a digest bit choosing the sign so that unrelated tokens
/// sharing a bucket tend to cancel rather than inflate similarity.
#[derive(Debug, Clone)]
pub struct LocalEmbedder {
    dimensions: usize,
}

impl LocalEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    /// Synchronous embedding, shared by the async trait impl.
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut buckets = vec![0.0f32; self.dimensions];
        let lowered = text.to_lowercase();
        let tokens = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|token| !token.is_empty());
        for token in tokens {
            let (slot, sign) = self.bucket(token);
            buckets[slot] += sign;
        }

        let length = buckets.iter().map(|b| b * b).sum::<f32>().sqrt();
        if length > 0.0 {
            buckets.iter_mut().for_each(|b| *b /= length);
        }
        buckets
    }

    fn bucket(&self, token: &str) -> (usize, f32) {
        let digest = Sha256::digest(token.as_bytes());
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        let slot = (u64::from_le_bytes(head) % self.dimensions as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        (slot, sign)
    }
}

#[async_trait]
impl EmbeddingProvider for LocalEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Ok(self.embed_text(text))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn provider_name(&self) -> &str {
        "local"
    }
}

/// Connection details shared by the HTTP-backed providers.
struct HttpEndpoint {
    provider: &'static str,
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl HttpEndpoint {
    fn new(
        provider: &'static str,
        base_url: Option<String>,
        fallback_url: &str,
        model: String,
    ) -> Self {
        let base_url = base_url.unwrap_or_else(|| fallback_url.to_string());
        Self {
            provider,
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
        }
    }

    /// POST `{"model", "input"}` to `path` and return the decoded JSON body.
    async fn post_input(
        &self,
        path: &str,
        input: &str,
        bearer: Option<&str>,
    ) -> Result<serde_json::Value, EmbeddingError> {
        let payload = serde_json::json!({ "model": &self.model, "input": input });
        let mut request = self
            .client
            .post(format!("{}{path}", self.base_url))
            .json(&payload);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| request_error(self.provider, e))?;
        read_json(self.provider, response).await
    }
}

/// OpenAI embeddings API (`text-embedding-3-small` unless configured otherwise).
pub struct OpenAiEmbedder {
    endpoint: HttpEndpoint,
    api_key: String,
    width: usize,
}

impl OpenAiEmbedder {
    pub fn new(api_key: String, model: Option<String>, base_url: Option<String>) -> Self {
        let model = model.unwrap_or_else(|| "text-embedding-3-small".to_string());
        let width = if model == "text-embedding-3-large" { 3072 } else { 1536 };
        Self {
            endpoint: HttpEndpoint::new("openai", base_url, "https://api.openai.com", model),
            api_key,
            width,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let body = self
            .endpoint
            .post_input("/v1/embeddings", text, Some(&self.api_key))
            .await?;
        parse_vector(self.endpoint.provider, &body["data"][0]["embedding"])
    }

    fn dimensions(&self) -> usize {
        self.width
    }

    fn provider_name(&self) -> &str {
        self.endpoint.provider
    }
}

/// Embeddings from a local Ollama daemon (`/api/embed`).
pub struct OllamaEmbedder {
    endpoint: HttpEndpoint,
    width: usize,
}

impl OllamaEmbedder {
    pub fn new(model: Option<String>, base_url: Option<String>) -> Self {
        let model = model.unwrap_or_else(|| "nomic-embed-text".to_string());
        let width = match model.as_str() {
            "mxbai-embed-large" => 1024,
            "all-minilm" => 384,
            _ => 768,
        };
        Self {
            endpoint: HttpEndpoint::new("ollama", base_url, "http://localhost:11434", model),
            width,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let body = self.endpoint.post_input("/api/embed", text, None).await?;
        parse_vector(self.endpoint.provider, &body["embeddings"][0])
    }

    fn dimensions(&self) -> usize {
        self.width
    }

    fn provider_name(&self) -> &str {
        self.endpoint.provider
    }
}

fn request_error(provider: &str, e: reqwest::Error) -> EmbeddingError {
    EmbeddingError::Request {
        provider: provider.into(),
        message: e.to_string(),
    }
}

async fn read_json(
    provider: &str,
    response: reqwest::Response,
) -> Result<serde_json::Value, EmbeddingError> {
    let status = response.status();
    if !status.is_success() {
        let detail = response.text().await.unwrap_or_default();
        return Err(EmbeddingError::Request {
            provider: provider.into(),
            message: format!("HTTP {status}: {}", crate::text::truncate_chars(&detail, 200)),
        });
    }
    response
        .json::<serde_json::Value>()
        .await
        .map_err(|e| EmbeddingError::InvalidResponse {
            provider: provider.into(),
            message: e.to_string(),
        })
}

fn parse_vector(provider: &str, value: &serde_json::Value) -> Result<Vec<f32>, EmbeddingError> {
    let values = value
        .as_array()
        .ok_or_else(|| EmbeddingError::InvalidResponse {
            provider: provider.into(),
            message: "missing embedding array".into(),
        })?;
    let vector: Vec<f32> = values
        .iter()
        .filter_map(|v| v.as_f64().map(|f| f as f32))
        .collect();
    if vector.is_empty() || vector.len() != values.len() {
        return Err(EmbeddingError::InvalidResponse {
            provider: provider.into(),
            message: "embedding contains non-numeric or no values".into(),
        });
    }
    Ok(vector)
}

/// Build the provider named in `config`.
pub fn create_embedder(config: &EmbeddingConfig) -> Result<SharedEmbedder, EmbeddingError> {
    match config.provider.as_str() {
        "local" => Ok(Arc::new(LocalEmbedder::new(config.dimensions))),
        "openai" => {
            let api_key = std::env::var(&config.api_key_env).map_err(|_| {
                EmbeddingError::NotConfigured {
                    provider: "openai".into(),
                    reason: format!("{} not set", config.api_key_env),
                }
            })?;
            Ok(Arc::new(OpenAiEmbedder::new(
                api_key,
                config.model.clone(),
                config.base_url.clone(),
            )))
        }
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(
            config.model.clone(),
            config.base_url.clone(),
        ))),
        other => Err(EmbeddingError::NotConfigured {
            provider: other.into(),
            reason: "unknown embedding provider".into(),
        }),
    }
}

/// Cosine similarity; 0 for mismatched lengths or zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_embedder_dimensions_and_norm() {
        let local = LocalEmbedder::new(128);
        let v = local.embed("Hello world hello").await.unwrap();
        assert_eq!(v.len(), 128);
        let length: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((length - 1.0).abs() < 1e-5);
        assert_eq!(local.provider_name(), "local");
    }

    #[tokio::test]
    async fn test_local_embedder_is_deterministic() {
        let local = LocalEmbedder::new(64);
        let a = local.embed("price per lookup").await.unwrap();
        let b = local.embed("price per lookup").await.unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_local_embedder_empty_text_is_zero_vector() {
        let v = LocalEmbedder::new(16).embed_text("  ...  ");
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn test_similar_texts_score_higher() {
        let embedder = LocalEmbedder::new(256);
        let claim = embedder.embed_text("the citizens endpoint returns document data");
        let near = embedder.embed_text("citizens endpoint returns the document data fields");
        let far = embedder.embed_text("weather forecast for tomorrow afternoon");
        assert!(cosine_similarity(&claim, &near) > cosine_similarity(&claim, &far));
    }

    #[test]
    fn test_cosine_similarity_edge_cases() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert!((cosine_similarity(&[1.0, 2.0], &[2.0, 4.0]) - 1.0).abs() < 1e-9);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_create_embedder_local() {
        let embedder = create_embedder(&EmbeddingConfig::default()).unwrap();
        assert_eq!(embedder.provider_name(), "local");
        assert_eq!(embedder.dimensions(), 256);
    }

    #[test]
    fn test_create_embedder_openai_requires_key() {
        let config = EmbeddingConfig {
            provider: "openai".into(),
            api_key_env: "VERACITY_TEST_KEY_THAT_IS_NEVER_SET".into(),
            ..Default::default()
        };
        let err = create_embedder(&config).err().unwrap();
        assert!(matches!(err, EmbeddingError::NotConfigured { .. }));
    }

    #[test]
    fn test_create_embedder_unknown() {
        let config = EmbeddingConfig {
            provider: "mystery".into(),
            ..Default::default()
        };
        assert!(create_embedder(&config).is_err());
    }

    #[test]
    fn test_parse_vector_rejects_garbage() {
        let err = parse_vector("openai", &serde_json::json!(null)).unwrap_err();
        assert!(matches!(err, EmbeddingError::InvalidResponse { .. }));
        let err = parse_vector("openai", &serde_json::json!(["a", 1.0])).unwrap_err();
        assert!(matches!(err, EmbeddingError::InvalidResponse { .. }));
        let v = parse_vector("openai", &serde_json::json!([0.5, -0.25])).unwrap();
        assert_eq!(v, vec![0.5, -0.25]);
    }

    #[tokio::test]
    async fn test_openai_unreachable_is_request_error() {
        let embedder = OpenAiEmbedder::new("k".into(), None, Some("http://127.0.0.1:9".into()));
        let err = embedder.embed("hello").await.unwrap_err();
        assert!(matches!(err, EmbeddingError::Request { .. }));
        assert_eq!(embedder.dimensions(), 1536);
    }
}
