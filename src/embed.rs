//! Embedding generation with ordered provider failover.
//!
//! Providers implement one capability interface; the stack tries them in
//! priority order, retries transient errors with backoff, and raises
//! `AllProvidersExhausted` only when nothing is left to try. Vectors come
//! back tagged with the model and provider that produced them — callers
//! must not assume bit-for-bit determinism across calls, only similarity.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::Credentials;
use crate::error::MnemoError;
use crate::thresholds::{EMBED_MAX_ATTEMPTS, EMBED_TIMEOUT_SECS, MAX_EMBED_INPUT_CHARS};

/// A single failed provider call. `retryable` distinguishes rate limits and
/// transient upstream errors from hard failures like a response parse error.
#[derive(Debug, Clone, thiserror::Error)]
#[error("provider {provider}: {message}")]
pub struct ProviderError {
    pub provider: String,
    pub message: String,
    pub retryable: bool,
}

impl ProviderError {
    fn transient(provider: &str, message: impl Into<String>) -> Self {
        Self { provider: provider.into(), message: message.into(), retryable: true }
    }

    fn hard(provider: &str, message: impl Into<String>) -> Self {
        Self { provider: provider.into(), message: message.into(), retryable: false }
    }
}

/// An embedding vector plus where it came from.
#[derive(Debug, Clone)]
pub struct TaggedVector {
    pub vector: Vec<f32>,
    pub model: String,
    pub provider: String,
}

/// One embedding backend. Adding a provider means implementing this and
/// appending it to the stack — no branching logic anywhere else.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn name(&self) -> &str;
    fn model(&self) -> &str;
    fn dimensions(&self) -> usize;

    /// Largest batch a single request may carry.
    fn max_batch(&self) -> usize {
        64
    }

    /// Minimum gap between consecutive requests, for providers with a
    /// request-rate ceiling. Zero means no spacing.
    fn call_spacing(&self) -> Duration {
        Duration::ZERO
    }

    async fn try_generate(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError>;
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedData>,
}

#[derive(Deserialize)]
struct EmbedData {
    #[serde(default)]
    index: Option<usize>,
    embedding: Vec<f32>,
}

/// OpenAI-compatible `/embeddings` endpoint. Covers OpenAI itself and the
/// many gateways that speak the same shape.
pub struct OpenAiCompatProvider {
    name: String,
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    dims: usize,
    batch: usize,
    spacing: Duration,
}

impl OpenAiCompatProvider {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        dims: usize,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(EMBED_TIMEOUT_SECS))
            .build()
            .expect("failed to build HTTP client");
        Self {
            name: name.into(),
            client,
            url: url.into(),
            api_key: api_key.into(),
            model: model.into(),
            dims,
            batch: 64,
            spacing: Duration::ZERO,
        }
    }

    pub fn with_batch(mut self, batch: usize) -> Self {
        self.batch = batch.max(1);
        self
    }

    pub fn with_spacing(mut self, spacing: Duration) -> Self {
        self.spacing = spacing;
        self
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn max_batch(&self) -> usize {
        self.batch
    }

    fn call_spacing(&self) -> Duration {
        self.spacing
    }

    async fn try_generate(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let req = EmbedRequest { model: &self.model, input: texts };
        let mut builder = self.client.post(&self.url).json(&req);
        if !self.api_key.is_empty() {
            builder = builder.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let resp = builder.send().await.map_err(|e| {
            // network/timeout errors are worth a retry
            ProviderError::transient(&self.name, format!("request failed: {e}"))
        })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let retryable = status.as_u16() == 429 || status.is_server_error();
            return Err(ProviderError {
                provider: self.name.clone(),
                message: format!("HTTP {status}: {body}"),
                retryable,
            });
        }

        let parsed: EmbedResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::hard(&self.name, format!("response parse failed: {e}")))?;

        // Responses may arrive out of order; restore input order by index.
        let mut indexed: Vec<(usize, Vec<f32>)> = parsed
            .data
            .into_iter()
            .enumerate()
            .map(|(fallback, d)| (d.index.unwrap_or(fallback), d.embedding))
            .collect();
        indexed.sort_by_key(|(i, _)| *i);
        let embeddings: Vec<Vec<f32>> = indexed.into_iter().map(|(_, v)| v).collect();

        if embeddings.len() != texts.len() {
            return Err(ProviderError::hard(
                &self.name,
                format!("sent {} texts, got {} embeddings", texts.len(), embeddings.len()),
            ));
        }
        Ok(embeddings)
    }
}

#[derive(Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct OllamaResponse {
    embedding: Vec<f32>,
}

/// Local Ollama daemon. No credential, one text per request.
pub struct OllamaProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
    dims: usize,
}

impl OllamaProvider {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, dims: usize) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(EMBED_TIMEOUT_SECS))
            .build()
            .expect("failed to build HTTP client");
        Self {
            client,
            base_url: base_url.into(),
            model: model.into(),
            dims,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn max_batch(&self) -> usize {
        // the /api/embeddings endpoint takes one prompt at a time
        1
    }

    async fn try_generate(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            let req = OllamaRequest { model: &self.model, prompt: text };
            let url = format!("{}/api/embeddings", self.base_url.trim_end_matches('/'));
            let resp = self
                .client
                .post(&url)
                .json(&req)
                .send()
                .await
                .map_err(|e| ProviderError::transient("ollama", format!("request failed: {e}")))?;

            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(ProviderError {
                    provider: "ollama".into(),
                    message: format!("HTTP {status}: {body}"),
                    retryable: status.is_server_error(),
                });
            }

            let parsed: OllamaResponse = resp
                .json()
                .await
                .map_err(|e| ProviderError::hard("ollama", format!("response parse failed: {e}")))?;
            if parsed.embedding.is_empty() {
                return Err(ProviderError::hard("ollama", "empty embedding in response"));
            }
            out.push(parsed.embedding);
        }
        Ok(out)
    }
}

/// Base delay for retry backoff; doubles per attempt, plus jitter.
const RETRY_BASE_MS: u64 = 500;

/// Ordered providers with per-provider retry and cross-provider failover.
pub struct EmbedderStack {
    providers: Vec<Arc<dyn EmbeddingProvider>>,
    max_attempts: u32,
}

impl EmbedderStack {
    pub fn new(providers: Vec<Arc<dyn EmbeddingProvider>>) -> Self {
        Self { providers, max_attempts: EMBED_MAX_ATTEMPTS }
    }

    /// Build the stack from the credential lookup. Providers without a
    /// credential are skipped here — the capability check of the contract.
    ///
    /// Priority order: custom endpoint, OpenAI, local Ollama.
    pub fn from_credentials(creds: &Credentials) -> Self {
        let mut providers: Vec<Arc<dyn EmbeddingProvider>> = Vec::new();

        if let Some(url) = creds.get("MNEMO_EMBED_URL") {
            let key = creds.get("MNEMO_EMBED_KEY").unwrap_or_default();
            let model = creds
                .get("MNEMO_EMBED_MODEL")
                .unwrap_or_else(|| "text-embedding-3-small".into());
            let dims = creds
                .get("MNEMO_EMBED_DIMENSIONS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(1536);
            providers.push(Arc::new(OpenAiCompatProvider::new("primary", url, key, model, dims)));
        } else {
            debug!("MNEMO_EMBED_URL not set, skipping primary endpoint");
        }

        if let Some(key) = creds.get("OPENAI_API_KEY") {
            providers.push(Arc::new(OpenAiCompatProvider::new(
                "openai",
                "https://api.openai.com/v1/embeddings",
                key,
                "text-embedding-3-small",
                1536,
            )));
        } else {
            debug!("OPENAI_API_KEY not set, skipping openai");
        }

        if let Some(url) = creds.get("MNEMO_OLLAMA_URL") {
            let model = creds
                .get("MNEMO_OLLAMA_EMBED_MODEL")
                .unwrap_or_else(|| "nomic-embed-text".into());
            let dims = creds
                .get("MNEMO_OLLAMA_EMBED_DIMENSIONS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(768);
            providers.push(Arc::new(OllamaProvider::new(url, model, dims)));
        } else {
            debug!("MNEMO_OLLAMA_URL not set, skipping ollama");
        }

        Self::new(providers)
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    /// Model of the highest-priority provider; what fresh embeddings are
    /// written under when nothing fails over.
    pub fn default_model(&self) -> Option<&str> {
        self.providers.first().map(|p| p.model())
    }

    /// Embedding dimensionality for a model, if any provider serves it.
    pub fn dimensions(&self, model: &str) -> Option<usize> {
        self.providers.iter().find(|p| p.model() == model).map(|p| p.dimensions())
    }

    /// Embed a single text. Fails over across providers in order.
    pub async fn embed(&self, text: &str) -> Result<TaggedVector, MnemoError> {
        let chars = text.chars().count();
        if chars > MAX_EMBED_INPUT_CHARS {
            return Err(MnemoError::OversizedInput { chars, max: MAX_EMBED_INPUT_CHARS });
        }
        let texts = vec![text.to_string()];
        let mut out = self.embed_batch_inner(&texts).await?;
        out.pop().ok_or_else(|| MnemoError::Internal("empty embed batch result".into()))
    }

    /// Embed many texts. Each provider gets the whole job, split into its
    /// batch-size limit with rate spacing between requests; on failure the
    /// next provider starts over so all vectors in a run share one model.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<TaggedVector>, MnemoError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        if let Some(big) = texts.iter().find(|t| t.chars().count() > MAX_EMBED_INPUT_CHARS) {
            return Err(MnemoError::OversizedInput {
                chars: big.chars().count(),
                max: MAX_EMBED_INPUT_CHARS,
            });
        }
        self.embed_batch_inner(texts).await
    }

    async fn embed_batch_inner(&self, texts: &[String]) -> Result<Vec<TaggedVector>, MnemoError> {
        let mut last_err: Option<ProviderError> = None;

        for provider in &self.providers {
            match self.run_provider(provider.as_ref(), texts).await {
                Ok(vectors) => {
                    let tagged = vectors
                        .into_iter()
                        .map(|vector| TaggedVector {
                            vector,
                            model: provider.model().to_string(),
                            provider: provider.name().to_string(),
                        })
                        .collect();
                    return Ok(tagged);
                }
                Err(e) => {
                    warn!(provider = provider.name(), error = %e, "provider failed, trying next");
                    last_err = Some(e);
                }
            }
        }

        match last_err {
            Some(e) => {
                debug!(error = %e, "no provider succeeded");
                Err(MnemoError::AllProvidersExhausted)
            }
            None => Err(MnemoError::AllProvidersExhausted),
        }
    }

    /// Drive one provider through the full text list: batch splitting, rate
    /// spacing, bounded retries with exponential backoff + jitter.
    async fn run_provider(
        &self,
        provider: &dyn EmbeddingProvider,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>, ProviderError> {
        let mut out = Vec::with_capacity(texts.len());
        let mut first = true;

        for group in texts.chunks(provider.max_batch()) {
            if !first && !provider.call_spacing().is_zero() {
                tokio::time::sleep(provider.call_spacing()).await;
            }
            first = false;

            let mut attempt = 0;
            let vectors = loop {
                attempt += 1;
                match provider.try_generate(group).await {
                    Ok(v) => break v,
                    Err(e) if e.retryable && attempt < self.max_attempts => {
                        let backoff = RETRY_BASE_MS * 2u64.pow(attempt - 1);
                        let jitter = rand::thread_rng().gen_range(0..=backoff / 2);
                        warn!(
                            provider = provider.name(),
                            attempt,
                            delay_ms = backoff + jitter,
                            error = %e,
                            "retrying after transient error"
                        );
                        tokio::time::sleep(Duration::from_millis(backoff + jitter)).await;
                    }
                    Err(e) => return Err(e),
                }
            };
            out.extend(vectors);
        }
        Ok(out)
    }
}

/// Cosine similarity between two vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut na, mut nb) = (0.0f64, 0.0f64, 0.0f64);
    for i in 0..a.len() {
        let (ai, bi) = (a[i] as f64, b[i] as f64);
        dot += ai * bi;
        na += ai * ai;
        nb += bi * bi;
    }
    let denom = na.sqrt() * nb.sqrt();
    if denom == 0.0 {
        0.0
    } else {
        dot / denom
    }
}

/// Serialize an f32 vector to bytes (little-endian) for SQLite BLOB storage.
pub fn vector_to_bytes(v: &[f32]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(v.len() * 4);
    for &f in v {
        buf.extend_from_slice(&f.to_le_bytes());
    }
    buf
}

/// Deserialize bytes back to an f32 vector.
pub fn bytes_to_vector(b: &[u8]) -> Vec<f32> {
    b.chunks_exact(4)
        .map(|chunk| {
            let arr: [u8; 4] = chunk.try_into().expect("4 bytes");
            f32::from_le_bytes(arr)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_same_vec() {
        let v: Vec<f32> = vec![1.0, 2.0, 3.0];
        let sim = cosine_similarity(&v, &v);
        assert!((sim - 1.0).abs() < 1e-10);
    }

    #[test]
    fn cosine_perpendicular() {
        let a: Vec<f32> = vec![1.0, 0.0];
        let b: Vec<f32> = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-10);
    }

    #[test]
    fn cosine_length_mismatch() {
        let a: Vec<f32> = vec![1.0, 0.0];
        let b: Vec<f32> = vec![1.0];
        assert_eq!(cosine_similarity(&a, &b), 0.0);
    }

    #[test]
    fn cosine_empty() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn vector_roundtrip() {
        let original: Vec<f32> = vec![1.0, -2.5, 3.125, 0.0, f32::MAX];
        let bytes = vector_to_bytes(&original);
        assert_eq!(bytes.len(), original.len() * 4);
        assert_eq!(bytes_to_vector(&bytes), original);
    }

    #[test]
    fn stack_without_credentials_is_empty() {
        let creds = Credentials::from_map(Default::default());
        let stack = EmbedderStack::from_credentials(&creds);
        assert!(stack.is_empty());
        assert_eq!(stack.default_model(), None);
    }

    #[test]
    fn stack_priority_order() {
        let mut map = std::collections::HashMap::new();
        map.insert("MNEMO_EMBED_URL".to_string(), "http://localhost:9999/v1/embeddings".to_string());
        map.insert("OPENAI_API_KEY".to_string(), "sk-test".to_string());
        let stack = EmbedderStack::from_credentials(&Credentials::from_map(map));
        assert_eq!(stack.provider_names(), vec!["primary", "openai"]);
    }

    #[tokio::test]
    async fn oversized_input_rejected_before_any_call() {
        // An empty stack would raise AllProvidersExhausted; oversize must win.
        let stack = EmbedderStack::new(vec![]);
        let big = "x".repeat(MAX_EMBED_INPUT_CHARS + 1);
        match stack.embed(&big).await {
            Err(MnemoError::OversizedInput { .. }) => {}
            other => panic!("expected OversizedInput, got {other:?}"),
        }
    }
}
