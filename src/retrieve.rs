//! Query-time orchestration: vector search first, lexical as the escape
//! hatch.
//!
//! The two paths keep their native scores — cosine similarity on one side,
//! BM25 on the other — with an origin tag instead of a fused ranking.
//! Normalizing across them would manufacture comparability that isn't
//! there; when both paths surface the same owner, the vector score wins.

use serde::Serialize;

use crate::db::{IndexDB, OWNER_CHUNK, OWNER_KNOWLEDGE, OWNER_MEMORY};
use crate::embed::EmbedderStack;
use crate::error::MnemoError;
use crate::thresholds::{
    DEFAULT_SEARCH_LIMIT, DEFAULT_SEARCH_THRESHOLD, EXCERPT_CHARS, MIN_VECTOR_RESULTS,
};
use crate::util::truncate_chars;
use crate::{EmbedCache, SharedDB};

/// Explicit per-query configuration. Defaults are documented on the
/// thresholds module.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    /// Embedding model to search under; defaults to the stack's primary.
    pub model: Option<String>,
    /// Maximum results returned.
    pub limit: usize,
    /// Minimum cosine similarity for vector hits.
    pub threshold: f64,
    /// Exclude owners created before this timestamp (unix ms).
    pub after: Option<i64>,
    /// Restrict to one owner type ("chunk", "knowledge", "memory").
    pub owner_type: Option<String>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            model: None,
            limit: DEFAULT_SEARCH_LIMIT,
            threshold: DEFAULT_SEARCH_THRESHOLD,
            after: None,
            owner_type: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchOrigin {
    Vector,
    Lexical,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub owner_id: String,
    pub owner_type: String,
    /// Cosine similarity for vector hits, BM25 for lexical — see origin.
    pub score: f64,
    pub origin: SearchOrigin,
    pub excerpt: String,
    pub created_at: i64,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub hits: Vec<SearchHit>,
    /// "vector", "vector+lexical", or "lexical".
    pub search_mode: String,
    pub vector_available: bool,
}

/// The owner record behind a hit: its creation time and display text.
/// `None` when the owner is gone or superseded — the hit is dropped.
fn resolve_owner(db: &IndexDB, owner_id: &str, owner_type: &str) -> Option<(i64, String)> {
    match owner_type {
        OWNER_CHUNK => db
            .get_chunk(owner_id)
            .ok()
            .flatten()
            .map(|c| (c.created_at, c.raw_text)),
        OWNER_KNOWLEDGE => db
            .get_knowledge(owner_id)
            .ok()
            .map(|k| (k.created_at, format!("{}: {}", k.title, k.summary))),
        OWNER_MEMORY => db
            .get_memory(owner_id)
            .ok()
            .filter(|m| m.superseded_by.is_none())
            .map(|m| (m.created_at, m.content)),
        _ => None,
    }
}

/// Run a search query.
///
/// Embeds the query and searches the vector store; when embedding is
/// impossible (no providers, all exhausted) or the vector path under-returns,
/// lexical results fill the remainder, deduplicated by owner.
pub async fn query(
    db: &SharedDB,
    stack: &EmbedderStack,
    cache: &EmbedCache,
    text: &str,
    opts: SearchOptions,
) -> Result<SearchResponse, MnemoError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(MnemoError::EmptyQuery);
    }
    let limit = opts.limit.max(1);

    // query embedding, through the cache
    let mut vector_available = false;
    let mut query_vec: Option<(String, Vec<f32>)> = None;

    if let Some(model) = opts.model.clone().or_else(|| stack.default_model().map(String::from)) {
        let cache_key = format!("{model}\u{1f}{text}");
        if let Some(vec) = cache.get(&cache_key) {
            vector_available = true;
            query_vec = Some((model, vec));
        } else {
            match stack.embed(text).await {
                Ok(tagged) => {
                    cache.put(format!("{}\u{1f}{text}", tagged.model), tagged.vector.clone());
                    vector_available = true;
                    query_vec = Some((tagged.model, tagged.vector));
                }
                Err(MnemoError::AllProvidersExhausted) => {
                    tracing::warn!("query embedding unavailable, lexical-only search");
                }
                Err(e) => return Err(e),
            }
        }
    }

    let mut hits: Vec<SearchHit> = Vec::new();

    if let Some((model, qvec)) = query_vec {
        let threshold = opts.threshold;
        let owner_type = opts.owner_type.clone();
        let vector_hits = crate::db_call(db, move |db| {
            db.search_embeddings(&model, &qvec, limit, threshold, owner_type.as_deref())
        })
        .await??;

        for vh in vector_hits {
            let (owner_id, owner_type) = (vh.owner_id.clone(), vh.owner_type.clone());
            let resolved = crate::db_call(db, move |db| {
                resolve_owner(db, &owner_id, &owner_type)
            })
            .await?;
            let Some((created_at, display)) = resolved else { continue };
            if opts.after.is_some_and(|after| created_at < after) {
                continue;
            }
            hits.push(SearchHit {
                owner_id: vh.owner_id,
                owner_type: vh.owner_type,
                score: vh.similarity,
                origin: SearchOrigin::Vector,
                excerpt: truncate_chars(&display, EXCERPT_CHARS),
                created_at,
            });
        }
    }

    // lexical supplement: vector path missing or under-returning
    let mut used_lexical = false;
    if !vector_available || hits.len() < MIN_VECTOR_RESULTS.min(limit) {
        let lex_limit = limit * 2;
        let query_text = text.to_string();
        let owner_type = opts.owner_type.clone();
        let lex_hits = crate::db_call(db, move |db| {
            db.search_lexical(&query_text, lex_limit, owner_type.as_deref())
        })
        .await??;

        for (owner_id, owner_type, score) in lex_hits {
            if hits.len() >= limit {
                break;
            }
            if hits.iter().any(|h| h.owner_id == owner_id && h.owner_type == owner_type) {
                // vector already found it — vector similarity wins
                continue;
            }
            let (oid, oty) = (owner_id.clone(), owner_type.clone());
            let resolved =
                crate::db_call(db, move |db| resolve_owner(db, &oid, &oty)).await?;
            let Some((created_at, display)) = resolved else { continue };
            if opts.after.is_some_and(|after| created_at < after) {
                continue;
            }
            used_lexical = true;
            hits.push(SearchHit {
                owner_id,
                owner_type,
                score,
                origin: SearchOrigin::Lexical,
                excerpt: truncate_chars(&display, EXCERPT_CHARS),
                created_at,
            });
        }
    }

    hits.truncate(limit);
    let search_mode = match (vector_available, used_lexical) {
        (true, true) => "vector+lexical",
        (true, false) => "vector",
        (false, _) => "lexical",
    }
    .to_string();

    Ok(SearchResponse { hits, search_mode, vector_available })
}

/// Semantic search scoped to the knowledge cache: same threshold/limit
/// contract as the vector store, results joined back to full entries.
/// Purely vector — an exhausted provider stack surfaces as an error here,
/// not a silent lexical downgrade (that path is `search_lexical`).
pub async fn semantic_search_knowledge(
    db: &SharedDB,
    stack: &EmbedderStack,
    cache: &EmbedCache,
    text: &str,
    opts: SearchOptions,
) -> Result<Vec<(crate::db::KnowledgeEntry, f64)>, MnemoError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(MnemoError::EmptyQuery);
    }
    let model = opts
        .model
        .clone()
        .or_else(|| stack.default_model().map(String::from))
        .ok_or(MnemoError::AllProvidersExhausted)?;

    let cache_key = format!("{model}\u{1f}{text}");
    // a failover can answer under a different model; search its rows, not
    // the requested model's
    let (model, qvec) = match cache.get(&cache_key) {
        Some(vec) => (model, vec),
        None => {
            let tagged = stack.embed(text).await?;
            cache.put(format!("{}\u{1f}{text}", tagged.model), tagged.vector.clone());
            (tagged.model, tagged.vector)
        }
    };

    let (limit, threshold) = (opts.limit.max(1), opts.threshold);
    let vector_hits = crate::db_call(db, move |db| {
        db.search_embeddings(&model, &qvec, limit, threshold, Some(OWNER_KNOWLEDGE))
    })
    .await??;

    let mut out = Vec::with_capacity(vector_hits.len());
    for hit in vector_hits {
        let id = hit.owner_id.clone();
        if let Ok(entry) = crate::db_call(db, move |db| db.get_knowledge(&id)).await? {
            out.push((entry, hit.similarity));
        }
    }
    Ok(out)
}
