//! Durable memory records with copy-on-write revisions.
//!
//! Content is immutable once a record may have been embedded: a revision
//! inserts a new row and points the old one at it via `superseded_by`,
//! so stored vectors always describe the text they were computed from.

use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use super::*;

const MEMORY_COLS: &str =
    "id, category, subject, content, importance, source, superseded_by, created_at";

impl IndexDB {
    pub fn insert_memory(&self, input: MemoryInput) -> Result<MemoryRecord, MnemoError> {
        validate_memory_input(&input)?;

        let id = Uuid::new_v4().to_string();
        let now = now_ms();
        let category = input.category.unwrap_or_else(|| "general".into());
        let subject = input.subject.unwrap_or_default();
        let importance = input.importance.unwrap_or(5);
        let source = input.source.unwrap_or_else(|| "manual".into());

        self.conn()?.execute(
            "INSERT INTO memories (id, category, subject, content, importance, source, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![id, category, subject, input.content, importance, source, now],
        )?;
        self.lex_upsert(&id, OWNER_MEMORY, &format!("{subject}\n{}", input.content))?;

        Ok(MemoryRecord {
            id,
            category,
            subject,
            content: input.content,
            importance,
            source,
            superseded_by: None,
            created_at: now,
        })
    }

    pub fn get_memory(&self, id: &str) -> Result<MemoryRecord, MnemoError> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {MEMORY_COLS} FROM memories WHERE id = ?1"),
            [id],
            row_to_memory,
        )
        .optional()?
        .ok_or(MnemoError::NotFound)
    }

    /// Replace a record's content by versioning: a new row is created, the
    /// old one is marked superseded and leaves the search surface (lexical
    /// entry and embeddings dropped).
    pub fn revise_memory(&self, id: &str, new_content: &str) -> Result<MemoryRecord, MnemoError> {
        if new_content.trim().is_empty() {
            return Err(MnemoError::EmptyContent);
        }
        let old = self.get_memory(id)?;
        if old.superseded_by.is_some() {
            return Err(MnemoError::Validation(format!("memory {id} is already superseded")));
        }

        let replacement = self.insert_memory(MemoryInput {
            content: new_content.to_string(),
            category: Some(old.category.clone()),
            subject: Some(old.subject.clone()),
            importance: Some(old.importance),
            source: Some(old.source.clone()),
        })?;

        self.conn()?.execute(
            "UPDATE memories SET superseded_by = ?2 WHERE id = ?1",
            params![id, replacement.id],
        )?;
        self.lex_delete(id, OWNER_MEMORY)?;
        self.delete_embeddings(id, OWNER_MEMORY)?;

        Ok(replacement)
    }

    pub fn list_memories(
        &self,
        include_superseded: bool,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<MemoryRecord>, MnemoError> {
        let conn = self.conn()?;
        let filter = if include_superseded { "" } else { "WHERE superseded_by IS NULL " };
        let mut stmt = conn.prepare(&format!(
            "SELECT {MEMORY_COLS} FROM memories {filter}ORDER BY created_at DESC LIMIT ?1 OFFSET ?2"
        ))?;
        let rows = stmt
            .query_map(params![limit as i64, offset as i64], row_to_memory)?
            .filter_map(|r| r.map_err(|e| tracing::warn!("row parse: {e}")).ok())
            .collect();
        Ok(rows)
    }

    pub fn memory_count(&self) -> usize {
        self.conn()
            .ok()
            .and_then(|c| {
                c.query_row(
                    "SELECT COUNT(*) FROM memories WHERE superseded_by IS NULL",
                    [],
                    |r| r.get::<_, i64>(0),
                )
                .ok()
            })
            .unwrap_or(0) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> IndexDB {
        IndexDB::open(":memory:").expect("in-memory db")
    }

    #[test]
    fn insert_defaults() {
        let db = test_db();
        let m = db.insert_memory(MemoryInput::new("prefers short replies")).unwrap();
        assert_eq!(m.category, "general");
        assert_eq!(m.importance, 5);
        assert_eq!(m.source, "manual");
        assert!(m.superseded_by.is_none());
    }

    #[test]
    fn importance_bounds() {
        let db = test_db();
        assert!(db.insert_memory(MemoryInput::new("x").importance(0)).is_err());
        assert!(db.insert_memory(MemoryInput::new("x").importance(11)).is_err());
        assert!(db.insert_memory(MemoryInput::new("x").importance(10)).is_ok());
    }

    #[test]
    fn revise_creates_version() {
        let db = test_db();
        let m = db
            .insert_memory(MemoryInput::new("lives in Lisbon").subject("ana").importance(7))
            .unwrap();
        db.store_embedding(&m.id, OWNER_MEMORY, "m1", "stub", &[1.0, 0.0]).unwrap();

        let replacement = db.revise_memory(&m.id, "lives in Porto").unwrap();
        assert_ne!(replacement.id, m.id);
        assert_eq!(replacement.subject, "ana");
        assert_eq!(replacement.importance, 7);

        let old = db.get_memory(&m.id).unwrap();
        assert_eq!(old.superseded_by.as_deref(), Some(replacement.id.as_str()));
        assert_eq!(old.content, "lives in Lisbon", "old content is never mutated");

        // old version left the search surface
        assert!(!db.has_embedding(&m.id, OWNER_MEMORY, "m1"));
        let hits = db.search_lexical("Lisbon", 10, None).unwrap();
        assert!(hits.is_empty());
        let hits = db.search_lexical("Porto", 10, None).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, replacement.id);
    }

    #[test]
    fn revise_superseded_rejected() {
        let db = test_db();
        let m = db.insert_memory(MemoryInput::new("v1")).unwrap();
        db.revise_memory(&m.id, "v2").unwrap();
        assert!(db.revise_memory(&m.id, "v3").is_err());
    }

    #[test]
    fn revise_missing_is_not_found() {
        let db = test_db();
        assert!(matches!(db.revise_memory("nope", "text"), Err(MnemoError::NotFound)));
    }

    #[test]
    fn list_excludes_superseded_by_default() {
        let db = test_db();
        let m = db.insert_memory(MemoryInput::new("v1")).unwrap();
        db.revise_memory(&m.id, "v2").unwrap();

        assert_eq!(db.list_memories(false, 50, 0).unwrap().len(), 1);
        assert_eq!(db.list_memories(true, 50, 0).unwrap().len(), 2);
        assert_eq!(db.memory_count(), 1);
    }
}
