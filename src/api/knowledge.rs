//! Knowledge cache and memory record handlers.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;

use super::blocking;
use crate::db::{
    KnowledgeEntry, KnowledgeFilter, KnowledgeInput, KnowledgePatch, MemoryInput, MemoryRecord,
    OWNER_KNOWLEDGE,
};
use crate::error::MnemoError;
use crate::retrieve::{self, SearchOptions};
use crate::thresholds::{DEFAULT_SEARCH_LIMIT, DEFAULT_SEARCH_THRESHOLD};
use crate::AppState;

/// POST /knowledge
pub(super) async fn create_knowledge(
    State(state): State<AppState>,
    Json(input): Json<KnowledgeInput>,
) -> Result<Json<KnowledgeEntry>, MnemoError> {
    let db = state.db.clone();
    let entry = blocking(move || db.add_knowledge(input)).await??;
    Ok(Json(entry))
}

/// GET /knowledge/{id}
pub(super) async fn get_knowledge_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<KnowledgeEntry>, MnemoError> {
    let db = state.db.clone();
    let entry = blocking(move || db.get_knowledge(&id)).await??;
    Ok(Json(entry))
}

/// GET /knowledge
pub(super) async fn list_knowledge_handler(
    State(state): State<AppState>,
    Query(filter): Query<KnowledgeFilter>,
) -> Result<Json<Vec<KnowledgeEntry>>, MnemoError> {
    let db = state.db.clone();
    let entries = blocking(move || db.list_knowledge(&filter)).await??;
    Ok(Json(entries))
}

/// PATCH /knowledge/{id}
pub(super) async fn update_knowledge_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<KnowledgePatch>,
) -> Result<Json<KnowledgeEntry>, MnemoError> {
    let db = state.db.clone();
    let entry = blocking(move || db.update_knowledge(&id, patch)).await??;
    Ok(Json(entry))
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct VerifyRequest {
    confidence: Option<f64>,
}

/// POST /knowledge/{id}/verify
pub(super) async fn verify_knowledge_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<VerifyRequest>>,
) -> Result<Json<KnowledgeEntry>, MnemoError> {
    let confidence = body.and_then(|Json(r)| r.confidence);
    let db = state.db.clone();
    let entry = blocking(move || db.verify_knowledge(&id, confidence)).await??;
    Ok(Json(entry))
}

#[derive(Debug, Deserialize)]
pub(super) struct LexicalSearchParams {
    q: String,
    limit: Option<usize>,
}

/// GET /knowledge/search — lexical, no embeddings involved.
pub(super) async fn knowledge_search(
    State(state): State<AppState>,
    Query(params): Query<LexicalSearchParams>,
) -> Result<Json<Vec<KnowledgeEntry>>, MnemoError> {
    if params.q.trim().is_empty() {
        return Err(MnemoError::EmptyQuery);
    }
    let limit = params.limit.unwrap_or(DEFAULT_SEARCH_LIMIT).min(100);
    let db = state.db.clone();
    let entries = blocking(move || -> Result<Vec<KnowledgeEntry>, MnemoError> {
        let hits = db.search_lexical(&params.q, limit, Some(OWNER_KNOWLEDGE))?;
        let mut out = Vec::with_capacity(hits.len());
        for (id, _, _) in hits {
            if let Ok(entry) = db.get_knowledge(&id) {
                out.push(entry);
            }
        }
        Ok(out)
    })
    .await??;
    Ok(Json(entries))
}

#[derive(Debug, Deserialize)]
pub(super) struct SemanticSearchRequest {
    query: String,
    limit: Option<usize>,
    threshold: Option<f64>,
    model: Option<String>,
}

#[derive(Debug, serde::Serialize)]
pub(super) struct ScoredEntry {
    #[serde(flatten)]
    entry: KnowledgeEntry,
    similarity: f64,
}

/// POST /knowledge/semantic-search
pub(super) async fn knowledge_semantic_search(
    State(state): State<AppState>,
    Json(req): Json<SemanticSearchRequest>,
) -> Result<Json<Vec<ScoredEntry>>, MnemoError> {
    let opts = SearchOptions {
        model: req.model,
        limit: req.limit.unwrap_or(DEFAULT_SEARCH_LIMIT).min(100),
        threshold: req.threshold.unwrap_or(DEFAULT_SEARCH_THRESHOLD),
        after: None,
        owner_type: None,
    };
    let scored = retrieve::semantic_search_knowledge(
        &state.db,
        &state.stack,
        &state.embed_cache,
        &req.query,
        opts,
    )
    .await?;
    Ok(Json(
        scored
            .into_iter()
            .map(|(entry, similarity)| ScoredEntry { entry, similarity })
            .collect(),
    ))
}

/// GET /knowledge/stats
pub(super) async fn knowledge_stats_handler(
    State(state): State<AppState>,
) -> Result<Json<crate::db::KnowledgeStats>, MnemoError> {
    let db = state.db.clone();
    let stats = blocking(move || db.knowledge_stats()).await??;
    Ok(Json(stats))
}

/// POST /memories
pub(super) async fn create_memory(
    State(state): State<AppState>,
    Json(input): Json<MemoryInput>,
) -> Result<Json<MemoryRecord>, MnemoError> {
    let db = state.db.clone();
    let record = blocking(move || db.insert_memory(input)).await??;
    Ok(Json(record))
}

/// GET /memories/{id}
pub(super) async fn get_memory_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<MemoryRecord>, MnemoError> {
    let db = state.db.clone();
    let record = blocking(move || db.get_memory(&id)).await??;
    Ok(Json(record))
}

#[derive(Debug, Deserialize)]
pub(super) struct ListMemoriesParams {
    #[serde(default)]
    include_superseded: bool,
    limit: Option<usize>,
    offset: Option<usize>,
}

/// GET /memories
pub(super) async fn list_memories_handler(
    State(state): State<AppState>,
    Query(params): Query<ListMemoriesParams>,
) -> Result<Json<Vec<MemoryRecord>>, MnemoError> {
    let limit = params.limit.unwrap_or(50).min(500);
    let offset = params.offset.unwrap_or(0);
    let db = state.db.clone();
    let records =
        blocking(move || db.list_memories(params.include_superseded, limit, offset)).await??;
    Ok(Json(records))
}

#[derive(Debug, Deserialize)]
pub(super) struct ReviseRequest {
    content: String,
}

/// POST /memories/{id}/revise — new version, old row superseded.
pub(super) async fn revise_memory_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ReviseRequest>,
) -> Result<Json<MemoryRecord>, MnemoError> {
    let db = state.db.clone();
    let record = blocking(move || db.revise_memory(&id, &req.content)).await??;
    Ok(Json(record))
}
