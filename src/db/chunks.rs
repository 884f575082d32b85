//! Chunk rows and the claim state machine.

use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use super::*;

const CHUNK_COLS: &str = "id, source_id, sequence_index, content_hash, raw_text, \
    enriched_text, token_count, embedding_status, claimed_at, created_at";

impl IndexDB {
    /// True when an identical unit (same source, position, and hash) is
    /// already stored — the incremental-scan skip condition.
    pub fn chunk_hash_exists(
        &self,
        source_id: &str,
        sequence_index: i64,
        content_hash: &str,
    ) -> Result<bool, MnemoError> {
        let conn = self.conn()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM chunks \
                 WHERE source_id = ?1 AND sequence_index = ?2 AND content_hash = ?3",
                params![source_id, sequence_index, content_hash],
                |r| r.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Insert a fresh chunk and index its raw text lexically.
    pub fn insert_chunk(
        &self,
        source_id: &str,
        sequence_index: i64,
        content_hash: &str,
        raw_text: &str,
        token_count: i64,
        status: EmbeddingStatus,
    ) -> Result<ChunkRecord, MnemoError> {
        let id = Uuid::new_v4().to_string();
        let now = now_ms();
        self.conn()?.execute(
            "INSERT INTO chunks \
             (id, source_id, sequence_index, content_hash, raw_text, token_count, \
              embedding_status, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![id, source_id, sequence_index, content_hash, raw_text, token_count,
                status.as_str(), now],
        )?;
        self.lex_upsert(&id, OWNER_CHUNK, raw_text)?;

        Ok(ChunkRecord {
            id,
            source_id: source_id.to_string(),
            sequence_index,
            content_hash: content_hash.to_string(),
            raw_text: raw_text.to_string(),
            enriched_text: None,
            token_count,
            embedding_status: status,
            claimed_at: None,
            created_at: now,
        })
    }

    pub fn get_chunk(&self, id: &str) -> Result<Option<ChunkRecord>, MnemoError> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                &format!("SELECT {CHUNK_COLS} FROM chunks WHERE id = ?1"),
                [id],
                row_to_chunk,
            )
            .optional()?)
    }

    /// Chunks stored at a source position, any hash. More than one row here
    /// means a superseded version survived a crash mid-replace.
    pub fn chunks_at_position(
        &self,
        source_id: &str,
        sequence_index: i64,
    ) -> Result<Vec<ChunkRecord>, MnemoError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CHUNK_COLS} FROM chunks \
             WHERE source_id = ?1 AND sequence_index = ?2"
        ))?;
        let rows = stmt
            .query_map(params![source_id, sequence_index], row_to_chunk)?
            .filter_map(|r| r.map_err(|e| tracing::warn!("row parse: {e}")).ok())
            .collect();
        Ok(rows)
    }

    /// Delete a chunk along with its embeddings and lexical entry.
    pub fn delete_chunk(&self, id: &str) -> Result<bool, MnemoError> {
        let n = self.conn()?.execute("DELETE FROM chunks WHERE id = ?1", [id])?;
        if n > 0 {
            self.delete_embeddings(id, OWNER_CHUNK)?;
            self.lex_delete(id, OWNER_CHUNK)?;
        }
        Ok(n > 0)
    }

    /// Drop chunks of a source at positions >= `from_index` (source shrank).
    pub fn prune_chunks_from(&self, source_id: &str, from_index: i64) -> Result<usize, MnemoError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id FROM chunks WHERE source_id = ?1 AND sequence_index >= ?2",
        )?;
        let ids: Vec<String> = stmt
            .query_map(params![source_id, from_index], |r| r.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        drop(stmt);
        drop(conn);
        for id in &ids {
            self.delete_chunk(id)?;
        }
        Ok(ids.len())
    }

    /// Claim a pending chunk for embedding. The conditional UPDATE is the
    /// whole coordination protocol: exactly one overlapping run wins, the
    /// loser sees zero rows changed and skips.
    pub fn claim_chunk(&self, id: &str) -> Result<bool, MnemoError> {
        let n = self.conn()?.execute(
            "UPDATE chunks SET embedding_status = 'in_progress', claimed_at = ?2 \
             WHERE id = ?1 AND embedding_status = 'pending'",
            params![id, now_ms()],
        )?;
        Ok(n == 1)
    }

    /// Settle a claimed (or any) chunk into a status, clearing the claim.
    pub fn mark_chunk(&self, id: &str, status: EmbeddingStatus) -> Result<(), MnemoError> {
        self.conn()?.execute(
            "UPDATE chunks SET embedding_status = ?2, claimed_at = NULL WHERE id = ?1",
            params![id, status.as_str()],
        )?;
        Ok(())
    }

    /// Reset `in_progress` claims older than `max_age_ms` back to pending.
    /// Makes a crashed run's chunks reclaimable by the next one.
    pub fn reclaim_stale_claims(&self, max_age_ms: i64) -> Result<usize, MnemoError> {
        let cutoff = now_ms() - max_age_ms;
        let n = self.conn()?.execute(
            "UPDATE chunks SET embedding_status = 'pending', claimed_at = NULL \
             WHERE embedding_status = 'in_progress' AND claimed_at < ?1",
            params![cutoff],
        )?;
        Ok(n)
    }

    /// Flip failed chunks back to pending for an explicit retry.
    pub fn retry_failed_chunks(&self) -> Result<usize, MnemoError> {
        let n = self.conn()?.execute(
            "UPDATE chunks SET embedding_status = 'pending' WHERE embedding_status = 'failed'",
            [],
        )?;
        Ok(n)
    }

    pub fn pending_chunks(&self, limit: usize) -> Result<Vec<ChunkRecord>, MnemoError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CHUNK_COLS} FROM chunks \
             WHERE embedding_status = 'pending' \
             ORDER BY created_at LIMIT ?1"
        ))?;
        let rows = stmt
            .query_map(params![limit as i64], row_to_chunk)?
            .filter_map(|r| r.map_err(|e| tracing::warn!("row parse: {e}")).ok())
            .collect();
        Ok(rows)
    }

    /// Chunks still lacking enrichment, oldest first. Oversized chunks are
    /// excluded — they never reach a provider, so there is nothing to gain.
    pub fn unenriched_chunks(&self, limit: usize) -> Result<Vec<ChunkRecord>, MnemoError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CHUNK_COLS} FROM chunks \
             WHERE enriched_text IS NULL AND embedding_status != 'skipped_oversized' \
             ORDER BY created_at LIMIT ?1"
        ))?;
        let rows = stmt
            .query_map(params![limit as i64], row_to_chunk)?
            .filter_map(|r| r.map_err(|e| tracing::warn!("row parse: {e}")).ok())
            .collect();
        Ok(rows)
    }

    /// Set enrichment exactly once. Returns false if the chunk already had
    /// enriched text (idempotent backfill) or does not exist.
    pub fn set_enriched_text(&self, id: &str, enriched: &str) -> Result<bool, MnemoError> {
        let n = self.conn()?.execute(
            "UPDATE chunks SET enriched_text = ?2 WHERE id = ?1 AND enriched_text IS NULL",
            params![id, enriched],
        )?;
        Ok(n == 1)
    }

    /// Backlog counts by status, plus non-chunk owners missing vectors
    /// under the given model (when known).
    pub fn embed_status(&self, model: Option<&str>) -> Result<EmbedStatusReport, MnemoError> {
        let conn = self.conn()?;
        let mut report = EmbedStatusReport::default();
        let mut stmt =
            conn.prepare("SELECT embedding_status, COUNT(*) FROM chunks GROUP BY embedding_status")?;
        let rows: Vec<(String, i64)> = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
            .filter_map(|r| r.ok())
            .collect();
        drop(stmt);
        drop(conn);

        for (status, count) in rows {
            let count = count as usize;
            report.total += count;
            match EmbeddingStatus::parse(&status) {
                Ok(EmbeddingStatus::Pending) => report.pending = count,
                Ok(EmbeddingStatus::InProgress) => report.in_progress = count,
                Ok(EmbeddingStatus::Embedded) => report.embedded = count,
                Ok(EmbeddingStatus::SkippedOversized) => report.skipped_oversized = count,
                Ok(EmbeddingStatus::Failed) => report.failed = count,
                Err(_) => tracing::warn!(status, "unknown embedding status in chunks table"),
            }
        }

        if let Some(model) = model {
            report.knowledge_missing =
                self.missing_knowledge_embeddings(model, usize::MAX >> 1).len();
            report.memories_missing = self.missing_memory_embeddings(model, usize::MAX >> 1).len();
        }
        Ok(report)
    }

    pub fn chunk_count(&self) -> usize {
        self.conn()
            .ok()
            .and_then(|c| c.query_row("SELECT COUNT(*) FROM chunks", [], |r| r.get::<_, i64>(0)).ok())
            .unwrap_or(0) as usize
    }
}
