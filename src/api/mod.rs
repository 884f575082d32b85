use axum::extract::State;
use axum::http::Request;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use subtle::ConstantTimeEq;
use tower_http::limit::RequestBodyLimitLayer;

use crate::error::MnemoError;
use crate::AppState;

mod knowledge;
mod ops;

use knowledge::*;
use ops::*;

/// Run a blocking closure on the spawn_blocking pool and map JoinError.
async fn blocking<T, F>(f: F) -> Result<T, MnemoError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| MnemoError::Internal(e.to_string()))
}

/// Auth middleware: checks Bearer token if MNEMO_API_KEY is configured.
async fn require_auth(
    State(state): State<AppState>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, MnemoError> {
    let Some(ref expected) = state.api_key else {
        return Ok(next.run(req).await);
    };

    let unauthorized = || MnemoError::Unauthorized;

    let header = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(unauthorized)?;

    let token = header.strip_prefix("Bearer ").ok_or_else(unauthorized)?;

    // constant-time comparison to prevent timing attacks
    if token.as_bytes().ct_eq(expected.as_bytes()).into() {
        Ok(next.run(req).await)
    } else {
        Err(unauthorized())
    }
}

pub fn router(state: AppState) -> Router {
    let public = Router::new()
        .route("/", get(index))
        .route("/health", get(health_only))
        .route("/stats", get(stats));

    let protected = Router::new()
        .route("/scan", post(do_scan))
        .route("/embed", post(do_embed))
        .route("/embed/status", get(embed_status_handler))
        .route("/enrich", post(do_enrich))
        .route("/search", get(do_search))
        .route("/knowledge", post(create_knowledge).get(list_knowledge_handler))
        .route("/knowledge/stats", get(knowledge_stats_handler))
        .route("/knowledge/search", get(knowledge_search))
        .route("/knowledge/semantic-search", post(knowledge_semantic_search))
        .route("/knowledge/{id}", get(get_knowledge_handler).patch(update_knowledge_handler))
        .route("/knowledge/{id}/verify", post(verify_knowledge_handler))
        .route("/memories", post(create_memory).get(list_memories_handler))
        .route("/memories/{id}", get(get_memory_handler))
        .route("/memories/{id}/revise", post(revise_memory_handler))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    // 256KB covers every body on this surface
    public
        .merge(protected)
        .layer(RequestBodyLimitLayer::new(256 * 1024))
        .with_state(state)
}

/// Shared health data used by both `/` and `/health`.
async fn health_data(state: &AppState) -> serde_json::Value {
    let db = state.db.clone();
    let model = state.stack.default_model().map(str::to_string);
    let (backlog, knowledge, chunk_count, memory_count, db_size_mb) = blocking(move || {
        let backlog = db.embed_status(model.as_deref()).unwrap_or_default();
        let knowledge = db.knowledge_stats().unwrap_or_default();
        let bytes = db.db_size_bytes();
        let mb = (bytes as f64 / 1048576.0 * 10.0).round() / 10.0;
        (backlog, knowledge, db.chunk_count(), db.memory_count(), mb)
    })
    .await
    .unwrap_or_default();

    let uptime_secs = state.started_at.elapsed().as_secs();
    let (cache_len, cache_cap, cache_hits, cache_misses) = state.embed_cache.stats();

    serde_json::json!({
        "name": "mnemo",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": uptime_secs,
        "db_size_mb": db_size_mb,
        "providers": state.stack.provider_names(),
        "enrichment_enabled": state.gen.is_some(),
        "embed_cache": {
            "size": cache_len, "capacity": cache_cap,
            "hits": cache_hits, "misses": cache_misses,
        },
        "chunks": chunk_count,
        "memories": memory_count,
        "embed_backlog": backlog,
        "knowledge": knowledge,
    })
}

/// GET / — health data + endpoint list.
async fn index(State(state): State<AppState>) -> Json<serde_json::Value> {
    let mut data = health_data(&state).await;
    if let Some(obj) = data.as_object_mut() {
        obj.insert("endpoints".to_string(), serde_json::json!({
            "GET /": "index with health data + endpoint list",
            "GET /health": "health only",
            "GET /stats": "chunk/knowledge/memory counts",
            "POST /scan": "incrementally index all new/changed sources",
            "POST /embed": "run pending embeddings (body: {retry_failed: bool}?)",
            "GET /embed/status": "embedding backlog by status",
            "POST /enrich": "backfill contextual enrichment (body: {batch_size: N}?)",
            "GET /search?q=term": "hybrid search (&limit=&threshold=&after=&model=&owner_type=)",
            "POST /knowledge": "add a knowledge entry",
            "GET /knowledge": "list entries (?source_type=&tag=&verified=&limit=&offset=)",
            "GET /knowledge/{id}": "get an entry",
            "PATCH /knowledge/{id}": "update summary/tags/confidence",
            "POST /knowledge/{id}/verify": "mark verified (body: {confidence: x}?)",
            "GET /knowledge/search?q=term": "lexical search over entries",
            "POST /knowledge/semantic-search": "vector search over entries",
            "GET /knowledge/stats": "totals, verified, with_embeddings",
            "POST /memories": "store a memory record",
            "GET /memories": "list records (?include_superseded=&limit=&offset=)",
            "GET /memories/{id}": "get a record",
            "POST /memories/{id}/revise": "new version of a record (body: {content})",
        }));
    }
    Json(data)
}

/// GET /health — health data only (no endpoint list).
async fn health_only(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(health_data(&state).await)
}

async fn stats(State(state): State<AppState>) -> Result<Json<serde_json::Value>, MnemoError> {
    let db = state.db.clone();
    let model = state.stack.default_model().map(str::to_string);
    let value = blocking(move || -> Result<serde_json::Value, MnemoError> {
        Ok(serde_json::json!({
            "chunks": db.chunk_count(),
            "memories": db.memory_count(),
            "embeddings": db.embeddings_total(),
            "knowledge": db.knowledge_stats()?,
            "embed_backlog": db.embed_status(model.as_deref())?,
            "sources": db.list_source_ids().len(),
        }))
    })
    .await??;
    Ok(Json(value))
}
