//! The embedding run: drain pending chunks through the provider stack and
//! backfill vectors for knowledge entries and memory records.
//!
//! Coordination is entirely through the database — a chunk is claimed by
//! the conditional pending→in_progress update, so overlapping runs never
//! double-process. Cancellation stops new provider calls between batches;
//! whatever is in flight completes or times out and settles its claims.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::db::{EmbedStatusReport, EmbeddingStatus, OWNER_CHUNK, OWNER_KNOWLEDGE, OWNER_MEMORY};
use crate::embed::EmbedderStack;
use crate::error::MnemoError;
use crate::thresholds::{EMBED_BATCH, MAX_EMBED_INPUT_CHARS, STALE_CLAIM_MS};
use crate::SharedDB;

#[derive(Debug, Default, Serialize)]
pub struct EmbedRunReport {
    pub embedded: usize,
    pub failed: usize,
    pub skipped_oversized: usize,
    pub reclaimed: usize,
    pub knowledge_embedded: usize,
    pub memories_embedded: usize,
    pub cancelled: bool,
}

/// Run pending embeddings to completion (or cancellation).
pub async fn embed_all(
    db: &SharedDB,
    stack: &EmbedderStack,
    stop: &Arc<AtomicBool>,
) -> Result<EmbedRunReport, MnemoError> {
    let mut report = EmbedRunReport::default();

    if stack.is_empty() {
        warn!("no embedding provider configured, nothing to run");
        return Ok(report);
    }

    report.reclaimed = crate::db_call(db, |db| db.reclaim_stale_claims(STALE_CLAIM_MS)).await??;
    if report.reclaimed > 0 {
        info!(reclaimed = report.reclaimed, "reset stale in-progress claims");
    }

    loop {
        if stop.load(Ordering::Relaxed) {
            report.cancelled = true;
            break;
        }

        let batch = crate::db_call(db, |db| db.pending_chunks(EMBED_BATCH)).await??;
        if batch.is_empty() {
            break;
        }

        // claim each candidate; losers belong to an overlapping run
        let mut claimed = Vec::with_capacity(batch.len());
        for chunk in batch {
            let id = chunk.id.clone();
            if crate::db_call(db, move |db| db.claim_chunk(&id)).await?? {
                claimed.push(chunk);
            }
        }
        if claimed.is_empty() {
            continue;
        }

        // a chunk can outgrow the limit via enrichment; catch it here so it
        // never reaches a provider
        let mut embeddable = Vec::with_capacity(claimed.len());
        for chunk in claimed {
            if chunk.embed_text().chars().count() > MAX_EMBED_INPUT_CHARS {
                let id = chunk.id.clone();
                crate::db_call(db, move |db| {
                    db.mark_chunk(&id, EmbeddingStatus::SkippedOversized)
                })
                .await??;
                report.skipped_oversized += 1;
            } else {
                embeddable.push(chunk);
            }
        }
        if embeddable.is_empty() {
            continue;
        }

        let texts: Vec<String> = embeddable.iter().map(|c| c.embed_text().to_string()).collect();
        match stack.embed_batch(&texts).await {
            Ok(tagged) => {
                for (chunk, tv) in embeddable.iter().zip(tagged) {
                    let id = chunk.id.clone();
                    let stored = crate::db_call(db, move |db| {
                        db.store_embedding(&id, OWNER_CHUNK, &tv.model, &tv.provider, &tv.vector)
                    })
                    .await?;
                    let id = chunk.id.clone();
                    match stored {
                        Ok(()) => {
                            crate::db_call(db, move |db| {
                                db.mark_chunk(&id, EmbeddingStatus::Embedded)
                            })
                            .await??;
                            report.embedded += 1;
                        }
                        Err(e) => {
                            warn!(chunk = %chunk.id, error = %e, "embedding write rejected");
                            crate::db_call(db, move |db| {
                                db.mark_chunk(&id, EmbeddingStatus::Failed)
                            })
                            .await??;
                            report.failed += 1;
                        }
                    }
                }
            }
            Err(e) => {
                // AllProvidersExhausted (or a stray hard failure): every
                // chunk in the batch records failed and the run moves on —
                // failed rows leave the pending pool, so the queue drains
                // instead of spinning.
                warn!(error = %e, count = embeddable.len(), "batch embedding failed");
                for chunk in &embeddable {
                    let id = chunk.id.clone();
                    crate::db_call(db, move |db| db.mark_chunk(&id, EmbeddingStatus::Failed))
                        .await??;
                    report.failed += 1;
                }
            }
        }
    }

    if !report.cancelled {
        report.knowledge_embedded = backfill_owner(db, stack, stop, OWNER_KNOWLEDGE).await?;
        report.memories_embedded = backfill_owner(db, stack, stop, OWNER_MEMORY).await?;
        if stop.load(Ordering::Relaxed) {
            report.cancelled = true;
        }
    }

    info!(
        embedded = report.embedded,
        failed = report.failed,
        skipped_oversized = report.skipped_oversized,
        knowledge = report.knowledge_embedded,
        memories = report.memories_embedded,
        cancelled = report.cancelled,
        "embedding run complete"
    );
    Ok(report)
}

/// Embed knowledge entries / memory records that have no vector under the
/// stack's current model. No claim protocol here — the write is an
/// idempotent upsert, so a rare double-embed is harmless.
async fn backfill_owner(
    db: &SharedDB,
    stack: &EmbedderStack,
    stop: &Arc<AtomicBool>,
    owner_type: &'static str,
) -> Result<usize, MnemoError> {
    let Some(model) = stack.default_model().map(str::to_string) else {
        return Ok(0);
    };
    let mut done = 0usize;

    loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        let model_q = model.clone();
        let missing = crate::db_call(db, move |db| match owner_type {
            OWNER_KNOWLEDGE => db.missing_knowledge_embeddings(&model_q, EMBED_BATCH),
            _ => db.missing_memory_embeddings(&model_q, EMBED_BATCH),
        })
        .await?;
        if missing.is_empty() {
            break;
        }

        let texts: Vec<String> = missing.iter().map(|(_, t)| t.clone()).collect();
        let tagged = match stack.embed_batch(&texts).await {
            Ok(t) => t,
            Err(e) => {
                warn!(owner_type, error = %e, "backfill batch failed, leaving for next run");
                break;
            }
        };

        // A failover can produce vectors under a different model than the
        // one we queried missing-ness against; if so, the same owners would
        // come back forever. Stop after storing in that case.
        let fell_over = tagged.first().map(|tv| tv.model != model).unwrap_or(false);

        for ((owner_id, _), tv) in missing.iter().zip(tagged) {
            let owner_id = owner_id.clone();
            let stored = crate::db_call(db, move |db| {
                db.store_embedding(&owner_id, owner_type, &tv.model, &tv.provider, &tv.vector)
            })
            .await?;
            match stored {
                Ok(()) => done += 1,
                Err(e) => warn!(owner_type, error = %e, "backfill write rejected"),
            }
        }
        if fell_over {
            break;
        }
    }
    Ok(done)
}

/// Current backlog, measured against the stack's primary model.
pub async fn embed_status(
    db: &SharedDB,
    stack: &EmbedderStack,
) -> Result<EmbedStatusReport, MnemoError> {
    let model = stack.default_model().map(str::to_string);
    crate::db_call(db, move |db| db.embed_status(model.as_deref())).await?
}
