//! LLM and embedding collaborators used by the HMLR pipeline.
//!
//! The pipeline never talks to a provider directly — every stage that needs
//! a completion or a vector goes through [`LlmClient`] / [`EmbeddingClient`].
//! This keeps `hmlr-memory` testable without a network call and keeps the
//! provider wiring (base URL, model name, retries) in one place.

use std::hash::{Hash, Hasher};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{Value, json};

/// How the caller expects the completion to be shaped.
///
/// `Json` asks the provider for strict JSON output (used by the Fact
/// Scrubber, Governor and Gardener, which all parse structured responses
/// out of the model).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFormat {
    Text,
    Json,
}

/// A chat/completion provider. Implementors own their own HTTP client and
/// retry policy; callers only see `query`.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Sends `prompt` to `model` and returns the raw text response.
    ///
    /// When `response_format` is [`ResponseFormat::Json`] the implementation
    /// should ask the provider for strict JSON mode where supported; callers
    /// are still responsible for parsing/validating the returned string.
    async fn query(
        &self,
        prompt: &str,
        model: &str,
        response_format: ResponseFormat,
    ) -> Result<String>;
}

/// A text embedding provider.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Embedding dimensionality this client produces.
    fn dimensions(&self) -> usize;

    /// Encodes `text` into a fixed-length vector.
    async fn encode(&self, text: &str) -> Result<Vec<f32>>;
}

/// HTTP [`LlmClient`] targeting an Ollama-compatible `/api/generate`
/// endpoint, mirroring the request/response shape the teacher's
/// `OllamaClient` uses.
#[derive(Debug, Clone)]
pub struct OllamaLlmClient {
    client: reqwest::Client,
    base_url: String,
}

impl OllamaLlmClient {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("building reqwest client for OllamaLlmClient")?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }
}

#[async_trait]
impl LlmClient for OllamaLlmClient {
    async fn query(
        &self,
        prompt: &str,
        model: &str,
        response_format: ResponseFormat,
    ) -> Result<String> {
        let endpoint = format!("{}/api/generate", self.base_url.trim_end_matches('/'));

        let mut payload = json!({
            "model": model,
            "prompt": prompt,
            "stream": false,
        });
        if response_format == ResponseFormat::Json {
            payload["format"] = Value::String("json".to_string());
        }

        let response = self
            .client
            .post(&endpoint)
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("calling {endpoint}"))?;

        let status = response.status();
        let body: Value = response.json().await.context("parsing ollama response body")?;

        if !status.is_success() {
            anyhow::bail!("ollama error ({status}): {body}");
        }

        body.get("response")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .with_context(|| format!("ollama response missing 'response' field: {body}"))
    }
}

/// Deterministic, non-semantic [`EmbeddingClient`] used when no real
/// embedding model is configured (and throughout the test suite, where a
/// reproducible vector matters more than semantic accuracy).
///
/// Hashes words and character trigrams into fixed buckets and normalizes to
/// unit length, so cosine similarity still rewards lexical overlap.
#[derive(Debug, Clone, Copy)]
pub struct HashEmbeddingClient {
    dimensions: usize,
}

impl HashEmbeddingClient {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }

    fn hash_token(token: &str) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        token.hash(&mut hasher);
        hasher.finish()
    }

    fn generate(&self, text: &str) -> Vec<f32> {
        let mut embedding = vec![0.0f32; self.dimensions];

        let normalized: String = text
            .chars()
            .map(|c| if c.is_alphanumeric() || c.is_whitespace() { c.to_ascii_lowercase() } else { ' ' })
            .collect();
        let words: Vec<&str> = normalized.split_whitespace().collect();

        for word in &words {
            let hash = Self::hash_token(word);
            let idx = (hash as usize) % self.dimensions;
            let sign = if (hash >> 32) & 1 == 0 { 1.0 } else { -1.0 };
            let magnitude = 1.0 + ((hash >> 16) & 0xFF) as f32 / 255.0;
            embedding[idx] += sign * magnitude;
        }

        let chars: Vec<char> = normalized.chars().collect();
        if chars.len() >= 3 {
            for window in chars.windows(3) {
                let trigram: String = window.iter().collect();
                let hash = Self::hash_token(&trigram);
                let idx = (hash as usize) % self.dimensions;
                let sign = if (hash >> 32) & 1 == 0 { 0.5 } else { -0.5 };
                embedding[idx] += sign;
            }
        }

        let magnitude: f32 = embedding.iter().map(|v| v * v).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut embedding {
                *value /= magnitude;
            }
        }
        embedding
    }
}

#[async_trait]
impl EmbeddingClient for HashEmbeddingClient {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn encode(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.generate(text))
    }
}

/// Cosine similarity between two equal-length vectors. Returns 0.0 if
/// either is zero-length or the lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hash_embedding_is_deterministic() {
        let client = HashEmbeddingClient::new(384);
        let a = client.encode("hello world").await.unwrap();
        let b = client.encode("hello world").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 384);
    }

    #[tokio::test]
    async fn hash_embedding_is_normalized() {
        let client = HashEmbeddingClient::new(384);
        let emb = client.encode("some text to embed").await.unwrap();
        let magnitude: f32 = emb.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((magnitude - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn similar_text_scores_higher_than_unrelated_text() {
        let client = HashEmbeddingClient::new(384);
        let base = client.encode("the quick brown fox").await.unwrap();
        let similar = client.encode("the quick brown dog").await.unwrap();
        let unrelated = client.encode("completely unrelated sentence").await.unwrap();

        let sim_similar = cosine_similarity(&base, &similar);
        let sim_unrelated = cosine_similarity(&base, &unrelated);
        assert!(sim_similar > sim_unrelated);
    }

    #[test]
    fn cosine_similarity_mismatched_lengths_is_zero() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0, 0.0]), 0.0);
    }
}
