//! Knowledge cache: distilled facts with confidence and verification.

use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use super::*;

const KNOWLEDGE_COLS: &str =
    "id, title, summary, source_type, tags, confidence, verified, created_at, updated_at";

impl IndexDB {
    pub fn add_knowledge(&self, input: KnowledgeInput) -> Result<KnowledgeEntry, MnemoError> {
        validate_knowledge_input(&input)?;

        let id = Uuid::new_v4().to_string();
        let now = now_ms();
        let source_type = input.source_type.unwrap_or_else(|| "manual".into());
        let tags = input.tags.unwrap_or_default();
        let confidence = input.confidence.unwrap_or(0.5);
        let tags_json = serde_json::to_string(&tags).unwrap_or_else(|_| "[]".into());

        self.conn()?.execute(
            "INSERT INTO knowledge_entries \
             (id, title, summary, source_type, tags, confidence, verified, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?7)",
            params![id, input.title, input.summary, source_type, tags_json, confidence, now],
        )?;
        self.lex_upsert(&id, OWNER_KNOWLEDGE, &format!("{}\n{}", input.title, input.summary))?;

        Ok(KnowledgeEntry {
            id,
            title: input.title,
            summary: input.summary,
            source_type,
            tags,
            confidence,
            verified: false,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn get_knowledge(&self, id: &str) -> Result<KnowledgeEntry, MnemoError> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {KNOWLEDGE_COLS} FROM knowledge_entries WHERE id = ?1"),
            [id],
            row_to_knowledge,
        )
        .optional()?
        .ok_or(MnemoError::NotFound)
    }

    /// Apply a partial update. A changed summary invalidates verification
    /// and drops the entry's embeddings so the next run re-embeds the new
    /// text; tags/confidence alone touch neither.
    pub fn update_knowledge(
        &self,
        id: &str,
        patch: KnowledgePatch,
    ) -> Result<KnowledgeEntry, MnemoError> {
        let existing = self.get_knowledge(id)?;

        if let Some(ref summary) = patch.summary {
            if summary.trim().is_empty() {
                return Err(MnemoError::EmptyContent);
            }
            if summary.chars().count() > MAX_SUMMARY_LEN {
                return Err(MnemoError::Validation("summary too long".into()));
            }
        }
        if let Some(c) = patch.confidence {
            if !(0.0..=1.0).contains(&c) {
                return Err(MnemoError::Validation(format!("confidence {c} outside [0,1]")));
            }
        }
        if let Some(ref tags) = patch.tags {
            validate_tags(tags)?;
        }

        let summary_changed = patch
            .summary
            .as_ref()
            .is_some_and(|s| s != &existing.summary);
        let summary = patch.summary.unwrap_or_else(|| existing.summary.clone());
        let tags = patch.tags.unwrap_or_else(|| existing.tags.clone());
        let confidence = patch.confidence.unwrap_or(existing.confidence);
        let verified = if summary_changed { false } else { existing.verified };
        let now = now_ms();
        let tags_json = serde_json::to_string(&tags).unwrap_or_else(|_| "[]".into());

        self.conn()?.execute(
            "UPDATE knowledge_entries \
             SET summary = ?2, tags = ?3, confidence = ?4, verified = ?5, updated_at = ?6 \
             WHERE id = ?1",
            params![id, summary, tags_json, confidence, verified as i64, now],
        )?;

        if summary_changed {
            self.lex_upsert(id, OWNER_KNOWLEDGE, &format!("{}\n{}", existing.title, summary))?;
            let dropped = self.delete_embeddings(id, OWNER_KNOWLEDGE)?;
            tracing::debug!(id, dropped, "summary changed, embeddings invalidated");
        }

        Ok(KnowledgeEntry {
            summary,
            tags,
            confidence,
            verified,
            updated_at: now,
            ..existing
        })
    }

    /// Mark an entry verified. Idempotent; confidence only moves when an
    /// explicit new value is supplied.
    pub fn verify_knowledge(
        &self,
        id: &str,
        new_confidence: Option<f64>,
    ) -> Result<KnowledgeEntry, MnemoError> {
        let existing = self.get_knowledge(id)?;
        if let Some(c) = new_confidence {
            if !(0.0..=1.0).contains(&c) {
                return Err(MnemoError::Validation(format!("confidence {c} outside [0,1]")));
            }
        }
        let confidence = new_confidence.unwrap_or(existing.confidence);
        let now = now_ms();
        self.conn()?.execute(
            "UPDATE knowledge_entries SET verified = 1, confidence = ?2, updated_at = ?3 \
             WHERE id = ?1",
            params![id, confidence, now],
        )?;
        Ok(KnowledgeEntry {
            verified: true,
            confidence,
            updated_at: now,
            ..existing
        })
    }

    pub fn list_knowledge(&self, filter: &KnowledgeFilter) -> Result<Vec<KnowledgeEntry>, MnemoError> {
        let limit = filter.limit.unwrap_or(50).min(500) as i64;
        let offset = filter.offset.unwrap_or(0) as i64;
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {KNOWLEDGE_COLS} FROM knowledge_entries \
             ORDER BY updated_at DESC LIMIT ?1 OFFSET ?2"
        ))?;
        let mut rows: Vec<KnowledgeEntry> = stmt
            .query_map(params![limit, offset], row_to_knowledge)?
            .filter_map(|r| r.map_err(|e| tracing::warn!("row parse: {e}")).ok())
            .collect();

        // post-filters: tag is a JSON array in SQLite, cheaper to filter here
        if let Some(ref st) = filter.source_type {
            rows.retain(|e| &e.source_type == st);
        }
        if let Some(ref tag) = filter.tag {
            rows.retain(|e| e.tags.iter().any(|t| t == tag));
        }
        if let Some(v) = filter.verified {
            rows.retain(|e| e.verified == v);
        }
        Ok(rows)
    }

    pub fn knowledge_stats(&self) -> Result<KnowledgeStats, MnemoError> {
        let conn = self.conn()?;
        let (total, verified): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(verified), 0) FROM knowledge_entries",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        drop(conn);
        Ok(KnowledgeStats {
            total: total as usize,
            verified: verified as usize,
            with_embeddings: self.embedded_owner_count(OWNER_KNOWLEDGE),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> IndexDB {
        IndexDB::open(":memory:").expect("in-memory db")
    }

    #[test]
    fn add_get_roundtrip() {
        let db = test_db();
        let entry = db
            .add_knowledge(
                KnowledgeInput::new("Deploy ritual", "Always run the smoke suite before deploys")
                    .tags(vec!["ops".into()])
                    .confidence(0.8),
            )
            .unwrap();

        let got = db.get_knowledge(&entry.id).unwrap();
        assert_eq!(got.title, "Deploy ritual");
        assert_eq!(got.tags, vec!["ops".to_string()]);
        assert!((got.confidence - 0.8).abs() < 1e-9);
        assert!(!got.verified);
    }

    #[test]
    fn get_missing_is_not_found() {
        let db = test_db();
        assert!(matches!(db.get_knowledge("nope"), Err(MnemoError::NotFound)));
    }

    #[test]
    fn verify_missing_is_not_found() {
        let db = test_db();
        assert!(matches!(db.verify_knowledge("nope", None), Err(MnemoError::NotFound)));
    }

    #[test]
    fn verify_is_idempotent_and_keeps_confidence() {
        let db = test_db();
        let e = db
            .add_knowledge(KnowledgeInput::new("t", "summary text").confidence(0.6))
            .unwrap();

        let v1 = db.verify_knowledge(&e.id, None).unwrap();
        assert!(v1.verified);
        assert!((v1.confidence - 0.6).abs() < 1e-9, "confidence must not drop");

        let v2 = db.verify_knowledge(&e.id, None).unwrap();
        assert!(v2.verified);

        // an explicit value moves it, in either direction
        let v3 = db.verify_knowledge(&e.id, Some(0.3)).unwrap();
        assert!((v3.confidence - 0.3).abs() < 1e-9);
    }

    #[test]
    fn summary_change_resets_verified() {
        let db = test_db();
        let e = db.add_knowledge(KnowledgeInput::new("t", "old summary").confidence(0.6)).unwrap();
        db.verify_knowledge(&e.id, None).unwrap();

        let updated = db
            .update_knowledge(&e.id, KnowledgePatch {
                summary: Some("new summary".into()),
                ..Default::default()
            })
            .unwrap();
        assert!(!updated.verified, "changed summary must clear verification");
        assert_eq!(db.get_knowledge(&e.id).unwrap().summary, "new summary");
    }

    #[test]
    fn tag_confidence_update_keeps_verified() {
        let db = test_db();
        let e = db.add_knowledge(KnowledgeInput::new("t", "stable summary")).unwrap();
        db.verify_knowledge(&e.id, None).unwrap();

        let updated = db
            .update_knowledge(&e.id, KnowledgePatch {
                tags: Some(vec!["x".into()]),
                confidence: Some(0.9),
                ..Default::default()
            })
            .unwrap();
        assert!(updated.verified, "tags/confidence alone must not clear verification");
    }

    #[test]
    fn unchanged_summary_keeps_verified() {
        let db = test_db();
        let e = db.add_knowledge(KnowledgeInput::new("t", "same summary")).unwrap();
        db.verify_knowledge(&e.id, None).unwrap();

        let updated = db
            .update_knowledge(&e.id, KnowledgePatch {
                summary: Some("same summary".into()),
                ..Default::default()
            })
            .unwrap();
        assert!(updated.verified, "identical summary is not a change");
    }

    #[test]
    fn summary_change_drops_embeddings() {
        let db = test_db();
        let e = db.add_knowledge(KnowledgeInput::new("t", "original")).unwrap();
        db.store_embedding(&e.id, OWNER_KNOWLEDGE, "m1", "stub", &[1.0, 0.0]).unwrap();

        db.update_knowledge(&e.id, KnowledgePatch {
            summary: Some("rewritten".into()),
            ..Default::default()
        })
        .unwrap();
        assert!(!db.has_embedding(&e.id, OWNER_KNOWLEDGE, "m1"));
    }

    #[test]
    fn confidence_out_of_range_rejected() {
        let db = test_db();
        assert!(db.add_knowledge(KnowledgeInput::new("t", "s").confidence(1.5)).is_err());
        let e = db.add_knowledge(KnowledgeInput::new("t", "s")).unwrap();
        assert!(db.verify_knowledge(&e.id, Some(-0.1)).is_err());
    }

    #[test]
    fn list_filters() {
        let db = test_db();
        let a = db
            .add_knowledge(KnowledgeInput::new("a", "s").source_type("distilled").tags(vec!["x".into()]))
            .unwrap();
        db.add_knowledge(KnowledgeInput::new("b", "s")).unwrap();
        db.verify_knowledge(&a.id, None).unwrap();

        let verified = db
            .list_knowledge(&KnowledgeFilter { verified: Some(true), ..Default::default() })
            .unwrap();
        assert_eq!(verified.len(), 1);
        assert_eq!(verified[0].id, a.id);

        let tagged = db
            .list_knowledge(&KnowledgeFilter { tag: Some("x".into()), ..Default::default() })
            .unwrap();
        assert_eq!(tagged.len(), 1);

        let distilled = db
            .list_knowledge(&KnowledgeFilter {
                source_type: Some("distilled".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(distilled.len(), 1);
    }

    #[test]
    fn stats_counts() {
        let db = test_db();
        let a = db.add_knowledge(KnowledgeInput::new("a", "s")).unwrap();
        db.add_knowledge(KnowledgeInput::new("b", "s")).unwrap();
        db.verify_knowledge(&a.id, None).unwrap();
        db.store_embedding(&a.id, OWNER_KNOWLEDGE, "m1", "stub", &[1.0]).unwrap();

        let stats = db.knowledge_stats().unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.verified, 1);
        assert_eq!(stats.with_embeddings, 1);
    }
}
