#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use mnemo::db::IndexDB;
use mnemo::embed::{EmbeddingProvider, ProviderError};
use mnemo::SharedDB;

pub fn test_db() -> SharedDB {
    Arc::new(IndexDB::open(":memory:").expect("in-memory db"))
}

pub fn stop_flag() -> Arc<std::sync::atomic::AtomicBool> {
    Arc::new(std::sync::atomic::AtomicBool::new(false))
}

/// Deterministic embedding provider for tests. Maps texts to fixed vectors
/// by keyword rule (first match wins); unmatched texts get the fallback.
/// Can be told to fail its first N calls, transiently or hard.
pub struct StubProvider {
    name: String,
    model: String,
    dims: usize,
    batch: usize,
    rules: Vec<(String, Vec<f32>)>,
    fallback: Vec<f32>,
    calls: AtomicUsize,
    fail_first: usize,
    fail_retryable: bool,
}

impl StubProvider {
    pub fn new(name: &str, model: &str, dims: usize) -> Self {
        let mut fallback = vec![0.0; dims];
        if let Some(last) = fallback.last_mut() {
            *last = 1.0;
        }
        Self {
            name: name.into(),
            model: model.into(),
            dims,
            batch: 64,
            rules: Vec::new(),
            fallback,
            calls: AtomicUsize::new(0),
            fail_first: 0,
            fail_retryable: false,
        }
    }

    /// Texts containing `keyword` (case-insensitive) map to `vector`.
    pub fn rule(mut self, keyword: &str, vector: Vec<f32>) -> Self {
        self.rules.push((keyword.to_lowercase(), vector));
        self
    }

    pub fn fail_first(mut self, n: usize, retryable: bool) -> Self {
        self.fail_first = n;
        self.fail_retryable = retryable;
        self
    }

    pub fn with_batch(mut self, batch: usize) -> Self {
        self.batch = batch;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        let lower = text.to_lowercase();
        self.rules
            .iter()
            .find(|(k, _)| lower.contains(k))
            .map(|(_, v)| v.clone())
            .unwrap_or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl EmbeddingProvider for StubProvider {
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

    async fn try_generate(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.fail_first {
            return Err(ProviderError {
                provider: self.name.clone(),
                message: "injected failure".into(),
                retryable: self.fail_retryable,
            });
        }
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }
}

/// A provider that always fails.
pub fn broken_provider(name: &str, model: &str, dims: usize) -> StubProvider {
    StubProvider::new(name, model, dims).fail_first(usize::MAX, false)
}

/// Build a stack from stub providers (handles the trait-object coercion).
pub fn stack_of(providers: Vec<Arc<StubProvider>>) -> mnemo::embed::EmbedderStack {
    mnemo::embed::EmbedderStack::new(
        providers
            .into_iter()
            .map(|p| p as Arc<dyn EmbeddingProvider>)
            .collect(),
    )
}
