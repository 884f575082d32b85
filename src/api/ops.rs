//! Indexing, embedding, enrichment, and search handlers.

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;

use super::blocking;
use crate::chunker;
use crate::error::MnemoError;
use crate::indexer;
use crate::retrieve::{self, SearchOptions};
use crate::thresholds::{DEFAULT_SEARCH_LIMIT, DEFAULT_SEARCH_THRESHOLD};
use crate::AppState;

/// POST /scan — index all new/changed sources under the configured dir.
pub(super) async fn do_scan(
    State(state): State<AppState>,
) -> Result<Json<chunker::ScanReport>, MnemoError> {
    let Some(dir) = state.sources_dir.clone() else {
        return Err(MnemoError::Validation(
            "no sources directory configured (set --sources or MNEMO_SOURCES)".into(),
        ));
    };
    let db = state.db.clone();
    let report = blocking(move || chunker::scan_dir(&db, &dir)).await??;
    Ok(Json(report))
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct EmbedRequest {
    #[serde(default)]
    retry_failed: bool,
}

/// POST /embed — run pending embeddings.
pub(super) async fn do_embed(
    State(state): State<AppState>,
    body: Option<Json<EmbedRequest>>,
) -> Result<Json<indexer::EmbedRunReport>, MnemoError> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    if req.retry_failed {
        let retried = crate::db_call(&state.db, |db| db.retry_failed_chunks()).await??;
        tracing::info!(retried, "failed chunks requeued");
    }
    let report = indexer::embed_all(&state.db, &state.stack, &state.stop).await?;
    Ok(Json(report))
}

/// GET /embed/status — backlog counts by status.
pub(super) async fn embed_status_handler(
    State(state): State<AppState>,
) -> Result<Json<crate::db::EmbedStatusReport>, MnemoError> {
    let report = indexer::embed_status(&state.db, &state.stack).await?;
    Ok(Json(report))
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct EnrichRequest {
    #[serde(default)]
    batch_size: usize,
}

/// POST /enrich — backfill contextual enrichment.
pub(super) async fn do_enrich(
    State(state): State<AppState>,
    body: Option<Json<EnrichRequest>>,
) -> Result<Json<chunker::EnrichReport>, MnemoError> {
    let Some(ref gen) = state.gen else {
        return Err(MnemoError::Validation(
            "enrichment not configured (set MNEMO_LLM_URL)".into(),
        ));
    };
    let batch = body.map(|Json(r)| r.batch_size).unwrap_or(0);
    let report = chunker::enrich_backfill(&state.db, gen, batch).await?;
    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
pub(super) struct SearchParams {
    q: String,
    limit: Option<usize>,
    threshold: Option<f64>,
    /// Unix ms lower bound on owner creation time.
    after: Option<i64>,
    model: Option<String>,
    owner_type: Option<String>,
}

/// GET /search — orchestrated hybrid search.
pub(super) async fn do_search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<retrieve::SearchResponse>, MnemoError> {
    let opts = SearchOptions {
        model: params.model,
        limit: params.limit.unwrap_or(DEFAULT_SEARCH_LIMIT).min(100),
        threshold: params.threshold.unwrap_or(DEFAULT_SEARCH_THRESHOLD),
        after: params.after,
        owner_type: params.owner_type,
    };
    let response =
        retrieve::query(&state.db, &state.stack, &state.embed_cache, &params.q, opts).await?;
    Ok(Json(response))
}
