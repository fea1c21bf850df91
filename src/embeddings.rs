// Embeddings Module - Pluggable base embedding providers
// The contextual-embedding engine delegates to one of these once per element.
// Providers: a deterministic feature-hash model (dev/test, no network) and an
// OpenAI-compatible HTTP endpoint.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::config::EmbeddingSettings;

/// Result of embedding generation.
#[derive(Debug, Clone)]
pub struct EmbeddingResult {
    pub embeddings: Vec<Vec<f32>>,
    pub model_used: String,
    pub tokens_used: Option<usize>,
}

/// Trait for embedding providers.
#[async_trait::async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate embeddings for a batch of texts.
    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult>;

    /// Generate embedding for a single text.
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        let batch = [text.to_string()];
        let mut result = self.embed_texts(&batch).await?;
        match result.embeddings.pop() {
            Some(embedding) => Ok(embedding),
            None => Err(anyhow!("Provider returned an empty batch for a single input")),
        }
    }

    /// Dimension of embeddings produced by this provider.
    fn dimension(&self) -> usize;

    fn model_name(&self) -> &str;

    /// Largest batch `embed_texts` accepts in one call.
    fn max_batch_size(&self) -> usize;
}

/// Deterministic feature-hash provider.
///
/// Each whitespace token is hashed into a bucket with a signed contribution
/// and the vector is L2-normalized. Identical text always produces the same
/// vector, which is what the tests and the smart-update embedding
/// preservation checks rely on.
#[derive(Debug)]
pub struct HashEmbeddingProvider {
    model_name: String,
    dimension: usize,
}

impl HashEmbeddingProvider {
    pub fn new(model_name: impl Into<String>, dimension: usize) -> Result<Self> {
        anyhow::ensure!(dimension > 0, "Embedding dimension must be positive");
        Ok(Self {
            model_name: model_name.into(),
            dimension,
        })
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        for token in text.split_whitespace() {
            let digest = Sha256::digest(token.to_lowercase().as_bytes());
            let bucket = u64::from_le_bytes(digest[0..8].try_into().expect("8-byte slice"))
                as usize
                % self.dimension;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

#[async_trait::async_trait]
impl EmbeddingProvider for HashEmbeddingProvider {
    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult> {
        let embeddings = texts.iter().map(|t| self.embed_one(t)).collect();
        Ok(EmbeddingResult {
            embeddings,
            model_used: self.model_name.clone(),
            tokens_used: Some(texts.iter().map(|t| t.split_whitespace().count()).sum()),
        })
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn max_batch_size(&self) -> usize {
        256
    }
}

/// OpenAI-compatible HTTP embedding provider.
#[derive(Debug)]
pub struct OpenAiEmbeddingProvider {
    model_name: String,
    dimension: usize,
    client: reqwest::Client,
    api_key: String,
    api_base: String,
}

/// Wire format of the `/embeddings` endpoint. The response carries one
/// vector per input, tagged with the input's position.
#[derive(Serialize)]
struct BatchRequest<'a> {
    model: &'a str,
    input: &'a [String],
    encoding_format: &'static str,
}

#[derive(Deserialize)]
struct BatchResponse {
    data: Vec<BatchVector>,
    usage: TokenUsage,
}

#[derive(Deserialize)]
struct BatchVector {
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct TokenUsage {
    total_tokens: usize,
}

impl OpenAiEmbeddingProvider {
    pub fn new(
        model_name: impl Into<String>,
        dimension: usize,
        api_key: String,
        api_base: Option<String>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;

        Ok(Self {
            model_name: model_name.into(),
            dimension,
            client,
            api_key,
            api_base: api_base.unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
        })
    }
}

#[async_trait::async_trait]
impl EmbeddingProvider for OpenAiEmbeddingProvider {
    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult> {
        if texts.is_empty() {
            return Ok(EmbeddingResult {
                embeddings: Vec::new(),
                model_used: self.model_name.clone(),
                tokens_used: Some(0),
            });
        }

        let endpoint = format!("{}/embeddings", self.api_base);
        let response = self
            .client
            .post(&endpoint)
            .bearer_auth(&self.api_key)
            .json(&BatchRequest {
                model: &self.model_name,
                input: texts,
                encoding_format: "float",
            })
            .send()
            .await
            .with_context(|| format!("Embedding request to {endpoint} failed"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Embedding endpoint returned {status}: {body}");
        }

        let parsed: BatchResponse = response
            .json()
            .await
            .context("Malformed embedding response body")?;
        anyhow::ensure!(
            parsed.data.len() == texts.len(),
            "Embedding endpoint returned {} vectors for {} inputs",
            parsed.data.len(),
            texts.len()
        );

        // The endpoint may answer out of order; place each vector into
        // its input's slot instead of trusting response order.
        let mut embeddings = vec![Vec::new(); texts.len()];
        for vector in parsed.data {
            let slot = embeddings
                .get_mut(vector.index)
                .with_context(|| format!("Embedding index {} out of range", vector.index))?;
            *slot = vector.embedding;
        }

        Ok(EmbeddingResult {
            embeddings,
            model_used: self.model_name.clone(),
            tokens_used: Some(parsed.usage.total_tokens),
        })
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn max_batch_size(&self) -> usize {
        2048
    }
}

/// Embedding service that owns a provider and caches single-text results.
pub struct EmbeddingService {
    provider: Box<dyn EmbeddingProvider>,
    cache: RwLock<HashMap<String, Vec<f32>>>,
}

impl EmbeddingService {
    /// Build the provider named in the embedding settings.
    pub fn from_settings(settings: &EmbeddingSettings) -> Result<Self> {
        let provider: Box<dyn EmbeddingProvider> = match settings.provider.as_str() {
            "hash" => Box::new(HashEmbeddingProvider::new(
                settings.model.clone(),
                settings.dimension,
            )?),
            "openai" => {
                let env_name = settings
                    .api_key_env
                    .as_deref()
                    .unwrap_or("OPENAI_API_KEY");
                let api_key = std::env::var(env_name).with_context(|| {
                    format!("Embedding provider requires API key in ${env_name}")
                })?;
                Box::new(OpenAiEmbeddingProvider::new(
                    settings.model.clone(),
                    settings.dimension,
                    api_key,
                    settings.api_base.clone(),
                )?)
            }
            other => return Err(anyhow!("Unknown embedding provider: {other}")),
        };

        Ok(Self {
            provider,
            cache: RwLock::new(HashMap::new()),
        })
    }

    pub fn with_provider(provider: Box<dyn EmbeddingProvider>) -> Self {
        Self {
            provider,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Generate embedding for a single text with caching.
    pub async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        {
            let cache = self.cache.read().await;
            if let Some(embedding) = cache.get(text) {
                return Ok(embedding.clone());
            }
        }

        let embedding = self.provider.embed_text(text).await?;

        {
            let mut cache = self.cache.write().await;
            cache.insert(text.to_string(), embedding.clone());
        }

        Ok(embedding)
    }

    /// Generate embeddings for multiple texts, chunked to the provider's
    /// batch limit. Results are in input order.
    pub async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut all = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(self.provider.max_batch_size().max(1)) {
            let result = self.provider.embed_texts(chunk).await?;
            anyhow::ensure!(
                result.embeddings.len() == chunk.len(),
                "Provider returned {} embeddings for {} inputs",
                result.embeddings.len(),
                chunk.len()
            );
            all.extend(result.embeddings);
        }
        Ok(all)
    }

    pub fn dimension(&self) -> usize {
        self.provider.dimension()
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    pub async fn clear_cache(&self) {
        let mut cache = self.cache.write().await;
        cache.clear();
    }
}

/// Cosine similarity between two vectors of equal dimension.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| (*x as f64) * (*y as f64)).sum();
    let norm_a: f64 = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hash_provider_is_deterministic() -> Result<()> {
        let provider = HashEmbeddingProvider::new("test-hash", 64)?;
        let a = provider.embed_text("the quarterly report").await?;
        let b = provider.embed_text("the quarterly report").await?;
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        let c = provider.embed_text("something else entirely").await?;
        assert_ne!(a, c);
        Ok(())
    }

    #[tokio::test]
    async fn test_hash_provider_normalizes() -> Result<()> {
        let provider = HashEmbeddingProvider::new("test-hash", 32)?;
        let v = provider.embed_text("alpha beta gamma").await?;
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
        Ok(())
    }

    #[tokio::test]
    async fn test_service_caches_single_texts() -> Result<()> {
        let service =
            EmbeddingService::with_provider(Box::new(HashEmbeddingProvider::new("t", 16)?));
        let a = service.embed_text("hello").await?;
        let b = service.embed_text("hello").await?;
        assert_eq!(a, b);
        Ok(())
    }

    #[tokio::test]
    async fn test_batch_embedding_preserves_order() -> Result<()> {
        let service =
            EmbeddingService::with_provider(Box::new(HashEmbeddingProvider::new("t", 16)?));
        let texts: Vec<String> = (0..10).map(|i| format!("text number {i}")).collect();
        let batched = service.embed_texts(&texts).await?;
        assert_eq!(batched.len(), 10);
        for (i, text) in texts.iter().enumerate() {
            let single = service.embed_text(text).await?;
            assert_eq!(batched[i], single, "order mismatch at {i}");
        }
        Ok(())
    }

    #[test]
    fn test_cosine_similarity_bounds() {
        let a = vec![1.0f32, 0.0, 0.0];
        let b = vec![1.0f32, 0.0, 0.0];
        let c = vec![0.0f32, 1.0, 0.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-9);
        assert!(cosine_similarity(&a, &c).abs() < 1e-9);
        assert_eq!(cosine_similarity(&a, &[]), 0.0);
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let mut settings = EmbeddingSettings::default();
        settings.provider = "quantum".to_string();
        assert!(EmbeddingService::from_settings(&settings).is_err());
    }
}
