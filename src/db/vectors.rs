//! Vector store: embeddings keyed by (owner, owner type, model).
//!
//! Rows are additive across models — re-embedding under a new model writes
//! a new row and leaves the old one alone, so a model switch never loses
//! data. Within one key, INSERT OR REPLACE refreshes the vector.

use rusqlite::{params, OptionalExtension};

use super::*;
use crate::embed::{bytes_to_vector, cosine_similarity, vector_to_bytes};

/// One nearest-neighbor hit.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VectorHit {
    pub owner_id: String,
    pub owner_type: String,
    pub similarity: f64,
    pub created_at: i64,
}

impl IndexDB {
    /// Dimensionality recorded for a model, if any row exists.
    pub fn model_dimensions(&self, model: &str) -> Result<Option<usize>, MnemoError> {
        let conn = self.conn()?;
        let dims: Option<i64> = conn
            .query_row(
                "SELECT dimensions FROM embeddings WHERE model = ?1 LIMIT 1",
                [model],
                |r| r.get(0),
            )
            .optional()?;
        Ok(dims.map(|d| d as usize))
    }

    /// Store an embedding. The first write for a model fixes its
    /// dimensionality; later writes with a different length are rejected
    /// without touching existing rows.
    pub fn store_embedding(
        &self,
        owner_id: &str,
        owner_type: &str,
        model: &str,
        provider: &str,
        vector: &[f32],
    ) -> Result<(), MnemoError> {
        if vector.is_empty() {
            return Err(MnemoError::Validation("empty embedding vector".into()));
        }
        if let Some(expected) = self.model_dimensions(model)? {
            if vector.len() != expected {
                return Err(MnemoError::DimensionMismatch {
                    model: model.to_string(),
                    expected,
                    got: vector.len(),
                });
            }
        }
        let bytes = vector_to_bytes(vector);
        self.conn()?.execute(
            "INSERT OR REPLACE INTO embeddings \
             (owner_id, owner_type, model, dimensions, vector, provider, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![owner_id, owner_type, model, vector.len() as i64, bytes, provider, now_ms()],
        )?;
        Ok(())
    }

    /// Brute-force cosine search over all rows for a model.
    ///
    /// O(n) over the model's embeddings — fine up to ~10k owners; beyond
    /// that an ANN index would be the next step. Results carry only
    /// `similarity >= threshold`, sorted descending, ties broken by
    /// most-recent `created_at`, capped at `limit`.
    pub fn search_embeddings(
        &self,
        model: &str,
        query: &[f32],
        limit: usize,
        threshold: f64,
        owner_type: Option<&str>,
    ) -> Result<Vec<VectorHit>, MnemoError> {
        let conn = self.conn()?;
        let mut scored: Vec<VectorHit> = Vec::new();

        let mut collect = |rows: Vec<(String, String, Vec<u8>, i64)>| {
            for (owner_id, ot, blob, created_at) in rows {
                let emb = bytes_to_vector(&blob);
                let similarity = cosine_similarity(query, &emb);
                if similarity >= threshold {
                    scored.push(VectorHit { owner_id, owner_type: ot, similarity, created_at });
                }
            }
        };

        if let Some(ot) = owner_type {
            let mut stmt = conn.prepare(
                "SELECT owner_id, owner_type, vector, created_at FROM embeddings \
                 WHERE model = ?1 AND owner_type = ?2",
            )?;
            let rows = stmt
                .query_map(params![model, ot], |r| {
                    Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
                })?
                .filter_map(|r| r.map_err(|e| tracing::warn!("row parse: {e}")).ok())
                .collect();
            collect(rows);
        } else {
            let mut stmt = conn.prepare(
                "SELECT owner_id, owner_type, vector, created_at FROM embeddings WHERE model = ?1",
            )?;
            let rows = stmt
                .query_map(params![model], |r| {
                    Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
                })?
                .filter_map(|r| r.map_err(|e| tracing::warn!("row parse: {e}")).ok())
                .collect();
            collect(rows);
        }

        scored.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.created_at.cmp(&a.created_at))
        });
        scored.truncate(limit);
        Ok(scored)
    }

    pub fn has_embedding(&self, owner_id: &str, owner_type: &str, model: &str) -> bool {
        self.conn()
            .ok()
            .and_then(|c| {
                c.query_row(
                    "SELECT 1 FROM embeddings WHERE owner_id = ?1 AND owner_type = ?2 AND model = ?3",
                    params![owner_id, owner_type, model],
                    |_| Ok(()),
                )
                .optional()
                .ok()
                .flatten()
            })
            .is_some()
    }

    /// Remove all embedding rows (every model) for an owner. Used when the
    /// owning text changes or the owner is deleted.
    pub fn delete_embeddings(&self, owner_id: &str, owner_type: &str) -> Result<usize, MnemoError> {
        let n = self.conn()?.execute(
            "DELETE FROM embeddings WHERE owner_id = ?1 AND owner_type = ?2",
            params![owner_id, owner_type],
        )?;
        Ok(n)
    }

    pub fn embeddings_total(&self) -> usize {
        self.conn()
            .ok()
            .and_then(|c| {
                c.query_row("SELECT COUNT(*) FROM embeddings", [], |r| r.get::<_, i64>(0)).ok()
            })
            .unwrap_or(0) as usize
    }

    /// Knowledge entries with no embedding under the given model.
    /// Returns `(id, embeddable text)`.
    pub fn missing_knowledge_embeddings(
        &self,
        model: &str,
        limit: usize,
    ) -> Vec<(String, String)> {
        let Ok(conn) = self.conn() else { return vec![] };
        let Ok(mut stmt) = conn.prepare(
            "SELECT k.id, k.title, k.summary FROM knowledge_entries k \
             WHERE NOT EXISTS (SELECT 1 FROM embeddings e \
                 WHERE e.owner_id = k.id AND e.owner_type = ?1 AND e.model = ?2) \
             LIMIT ?3",
        ) else {
            return vec![];
        };
        stmt.query_map(params![OWNER_KNOWLEDGE, model, limit as i64], |r| {
            let title: String = r.get(1)?;
            let summary: String = r.get(2)?;
            Ok((r.get::<_, String>(0)?, format!("{title}\n{summary}")))
        })
        .map(|rows| rows.filter_map(|r| r.ok()).collect())
        .unwrap_or_default()
    }

    /// Active memory records with no embedding under the given model.
    pub fn missing_memory_embeddings(&self, model: &str, limit: usize) -> Vec<(String, String)> {
        let Ok(conn) = self.conn() else { return vec![] };
        let Ok(mut stmt) = conn.prepare(
            "SELECT m.id, m.subject, m.content FROM memories m \
             WHERE m.superseded_by IS NULL \
               AND NOT EXISTS (SELECT 1 FROM embeddings e \
                   WHERE e.owner_id = m.id AND e.owner_type = ?1 AND e.model = ?2) \
             LIMIT ?3",
        ) else {
            return vec![];
        };
        stmt.query_map(params![OWNER_MEMORY, model, limit as i64], |r| {
            let subject: String = r.get(1)?;
            let content: String = r.get(2)?;
            Ok((r.get::<_, String>(0)?, format!("{subject}\n{content}")))
        })
        .map(|rows| rows.filter_map(|r| r.ok()).collect())
        .unwrap_or_default()
    }

    /// Distinct owners of a given type that have at least one embedding.
    pub fn embedded_owner_count(&self, owner_type: &str) -> usize {
        self.conn()
            .ok()
            .and_then(|c| {
                c.query_row(
                    "SELECT COUNT(DISTINCT owner_id) FROM embeddings WHERE owner_type = ?1",
                    [owner_type],
                    |r| r.get::<_, i64>(0),
                )
                .ok()
            })
            .unwrap_or(0) as usize
    }
}

#[cfg(test)]
#[path = "vec_tests.rs"]
mod tests;
