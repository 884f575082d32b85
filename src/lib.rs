//! mnemo — semantic memory engine.
//! Incremental transcript indexing, embedding with provider failover,
//! hybrid vector/lexical recall, and a verified-knowledge cache.

pub mod api;
pub mod chunker;
pub mod config;
pub mod db;
pub mod embed;
pub mod error;
pub mod indexer;
pub mod retrieve;
pub mod thresholds;
pub mod util;

use std::num::NonZeroUsize;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use lru::LruCache;

pub type SharedDB = Arc<db::IndexDB>;

/// Run a blocking DB operation on tokio's blocking thread pool.
///
/// All synchronous IndexDB calls in async context MUST go through this
/// to avoid starving tokio worker threads.
pub async fn db_call<F, T>(db: &SharedDB, f: F) -> Result<T, error::MnemoError>
where
    F: FnOnce(&db::IndexDB) -> T + Send + 'static,
    T: Send + 'static,
{
    let db = Arc::clone(db);
    tokio::task::spawn_blocking(move || f(&db))
        .await
        .map_err(|e| error::MnemoError::Internal(e.to_string()))
}

#[derive(Clone)]
pub struct AppState {
    pub db: SharedDB,
    pub stack: Arc<embed::EmbedderStack>,
    pub gen: Option<config::GenConfig>,
    pub api_key: Option<String>,
    pub embed_cache: EmbedCache,
    pub sources_dir: Option<std::path::PathBuf>,
    /// Raised on shutdown: running embed passes stop issuing provider calls.
    pub stop: Arc<AtomicBool>,
    pub started_at: std::time::Instant,
}

/// Small LRU cache for query embeddings to avoid repeated provider calls.
/// Key = model + query text, value = embedding vector.
#[derive(Clone)]
pub struct EmbedCache {
    inner: Arc<parking_lot::Mutex<EmbedCacheInner>>,
}

struct EmbedCacheInner {
    cache: LruCache<String, Vec<f32>>,
    hits: u64,
    misses: u64,
}

impl EmbedCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(parking_lot::Mutex::new(EmbedCacheInner {
                cache: LruCache::new(
                    NonZeroUsize::new(capacity.max(1)).expect("nonzero cache capacity"),
                ),
                hits: 0,
                misses: 0,
            })),
        }
    }

    pub fn get(&self, key: &str) -> Option<Vec<f32>> {
        let mut inner = self.inner.lock();
        match inner.cache.get(key).cloned() {
            Some(v) => {
                inner.hits += 1;
                Some(v)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    pub fn put(&self, key: String, value: Vec<f32>) {
        self.inner.lock().cache.put(key, value);
    }

    /// (len, capacity, hits, misses)
    pub fn stats(&self) -> (usize, usize, u64, u64) {
        let inner = self.inner.lock();
        (inner.cache.len(), inner.cache.cap().get(), inner.hits, inner.misses)
    }
}
