//! FTS5 lexical index over raw text.
//!
//! Derived and disposable: every entry can be rebuilt from the owning
//! tables, so the index is never a source of truth. No network, no
//! embeddings — this is the path that always works.

use rusqlite::params;

use super::*;

impl IndexDB {
    /// Insert or replace the lexical entry for an owner.
    pub(crate) fn lex_upsert(
        &self,
        owner_id: &str,
        owner_type: &str,
        text: &str,
    ) -> Result<(), MnemoError> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM search_fts WHERE owner_id = ?1 AND owner_type = ?2",
            params![owner_id, owner_type],
        )?;
        conn.execute(
            "INSERT INTO search_fts(owner_id, owner_type, content) VALUES (?1, ?2, ?3)",
            params![owner_id, owner_type, text],
        )?;
        Ok(())
    }

    pub(crate) fn lex_delete(&self, owner_id: &str, owner_type: &str) -> Result<(), MnemoError> {
        self.conn()?.execute(
            "DELETE FROM search_fts WHERE owner_id = ?1 AND owner_type = ?2",
            params![owner_id, owner_type],
        )?;
        Ok(())
    }

    /// Term search over the lexical index. Returns
    /// `(owner_id, owner_type, score)` with BM25 rank surfaced as a
    /// positive score (higher = better).
    pub fn search_lexical(
        &self,
        query: &str,
        limit: usize,
        owner_type: Option<&str>,
    ) -> Result<Vec<(String, String, f64)>, MnemoError> {
        let Some(fts_query) = build_match_query(query) else {
            return Ok(vec![]);
        };

        let conn = self.conn()?;
        if let Some(ot) = owner_type {
            let mut stmt = conn.prepare(
                "SELECT owner_id, owner_type, rank FROM search_fts \
                 WHERE search_fts MATCH ?1 AND owner_type = ?3 \
                 ORDER BY rank LIMIT ?2",
            )?;
            Ok(stmt
                .query_map(params![fts_query, limit as i64, ot], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, f64>(2)?))
                })
                .map(|iter| {
                    iter.filter_map(|r| r.map_err(|e| tracing::warn!("row parse: {e}")).ok())
                        .map(|(id, ot, rank)| (id, ot, -rank))
                        .collect()
                })
                .unwrap_or_default())
        } else {
            let mut stmt = conn.prepare(
                "SELECT owner_id, owner_type, rank FROM search_fts \
                 WHERE search_fts MATCH ?1 ORDER BY rank LIMIT ?2",
            )?;
            Ok(stmt
                .query_map(params![fts_query, limit as i64], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, f64>(2)?))
                })
                .map(|iter| {
                    iter.filter_map(|r| r.map_err(|e| tracing::warn!("row parse: {e}")).ok())
                        .map(|(id, ot, rank)| (id, ot, -rank))
                        .collect()
                })
                .unwrap_or_default())
        }
    }

    /// Rebuild the lexical index from the owning tables when row counts
    /// disagree (crash between a row write and its FTS write, or a schema
    /// upgrade). Runs on open.
    pub(crate) fn rebuild_lexical_if_needed(&self) -> Result<(), MnemoError> {
        let conn = self.conn()?;
        let fts_count: i64 = conn.query_row("SELECT COUNT(*) FROM search_fts", [], |r| r.get(0))?;
        let owner_count: i64 = conn.query_row(
            "SELECT (SELECT COUNT(*) FROM chunks) \
             + (SELECT COUNT(*) FROM knowledge_entries) \
             + (SELECT COUNT(*) FROM memories WHERE superseded_by IS NULL)",
            [],
            |r| r.get(0),
        )?;
        drop(conn);

        if fts_count == owner_count {
            return Ok(());
        }
        let rebuilt = self.force_rebuild_lexical()?;
        tracing::info!(fts_count, owner_count, rebuilt, "rebuilt lexical index");
        Ok(())
    }

    /// Drop and rebuild the entire lexical index. Returns rows indexed.
    pub fn force_rebuild_lexical(&self) -> Result<usize, MnemoError> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM search_fts", [])?;

        let mut rebuilt = 0usize;

        let mut stmt = conn.prepare("SELECT id, raw_text FROM chunks")?;
        let chunks: Vec<(String, String)> = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
            .filter_map(|r| r.map_err(|e| tracing::warn!("row parse: {e}")).ok())
            .collect();
        for (id, text) in &chunks {
            conn.execute(
                "INSERT INTO search_fts(owner_id, owner_type, content) VALUES (?1, ?2, ?3)",
                params![id, OWNER_CHUNK, text],
            )?;
            rebuilt += 1;
        }

        let mut stmt = conn.prepare("SELECT id, title, summary FROM knowledge_entries")?;
        let entries: Vec<(String, String, String)> = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?
            .filter_map(|r| r.map_err(|e| tracing::warn!("row parse: {e}")).ok())
            .collect();
        for (id, title, summary) in &entries {
            conn.execute(
                "INSERT INTO search_fts(owner_id, owner_type, content) VALUES (?1, ?2, ?3)",
                params![id, OWNER_KNOWLEDGE, format!("{title}\n{summary}")],
            )?;
            rebuilt += 1;
        }

        let mut stmt =
            conn.prepare("SELECT id, subject, content FROM memories WHERE superseded_by IS NULL")?;
        let memories: Vec<(String, String, String)> = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?
            .filter_map(|r| r.map_err(|e| tracing::warn!("row parse: {e}")).ok())
            .collect();
        for (id, subject, content) in &memories {
            conn.execute(
                "INSERT INTO search_fts(owner_id, owner_type, content) VALUES (?1, ?2, ?3)",
                params![id, OWNER_MEMORY, format!("{subject}\n{content}")],
            )?;
            rebuilt += 1;
        }

        Ok(rebuilt)
    }
}

/// Sanitize free text into an FTS5 OR query: keep alphanumerics, drop
/// stopwords, join with OR so partial matches still rank.
fn build_match_query(query: &str) -> Option<String> {
    let mut sanitized = String::with_capacity(query.len());
    for c in query.chars() {
        if c.is_alphanumeric() {
            sanitized.push(c);
        } else {
            sanitized.push(' ');
        }
    }
    let terms: Vec<String> = sanitized
        .split_whitespace()
        .map(str::to_lowercase)
        .filter(|w| !is_stopword(w))
        .collect();
    if terms.is_empty() {
        return None;
    }
    Some(terms.join(" OR "))
}

/// Ubiquitous function words that match nearly everything and add noise.
pub fn is_stopword(word: &str) -> bool {
    matches!(
        word,
        "the" | "a" | "an" | "is" | "are" | "was" | "were" | "be" | "been" | "and" | "or"
            | "but" | "in" | "on" | "at" | "to" | "for" | "of" | "it" | "as" | "if" | "no"
            | "not" | "so" | "this" | "that" | "with" | "by" | "my" | "i" | "you" | "we"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> IndexDB {
        IndexDB::open(":memory:").expect("in-memory db")
    }

    #[test]
    fn lexical_search_finds_content() {
        let db = test_db();
        db.lex_upsert("c1", OWNER_CHUNK, "the quick brown fox jumps").unwrap();

        let results = db.search_lexical("quick fox", 10, None).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "c1");
        assert!(results[0].2 > 0.0, "score should be positive");
    }

    #[test]
    fn lexical_upsert_replaces() {
        let db = test_db();
        db.lex_upsert("c1", OWNER_CHUNK, "original words here").unwrap();
        db.lex_upsert("c1", OWNER_CHUNK, "replacement tokens instead").unwrap();

        assert!(db.search_lexical("original", 10, None).unwrap().is_empty());
        assert_eq!(db.search_lexical("replacement", 10, None).unwrap().len(), 1);
    }

    #[test]
    fn owner_type_filter() {
        let db = test_db();
        db.lex_upsert("c1", OWNER_CHUNK, "shared token alpha").unwrap();
        db.lex_upsert("k1", OWNER_KNOWLEDGE, "shared token alpha").unwrap();

        let all = db.search_lexical("alpha", 10, None).unwrap();
        assert_eq!(all.len(), 2);
        let knowledge_only = db.search_lexical("alpha", 10, Some(OWNER_KNOWLEDGE)).unwrap();
        assert_eq!(knowledge_only.len(), 1);
        assert_eq!(knowledge_only[0].0, "k1");
    }

    #[test]
    fn stopword_only_query_returns_empty() {
        let db = test_db();
        db.lex_upsert("c1", OWNER_CHUNK, "the and of it").unwrap();
        assert!(db.search_lexical("the and of", 10, None).unwrap().is_empty());
    }

    #[test]
    fn punctuation_sanitized() {
        let db = test_db();
        db.lex_upsert("c1", OWNER_CHUNK, "deploy pipeline config").unwrap();
        let results = db.search_lexical("deploy-pipeline?!", 10, None).unwrap();
        assert!(!results.is_empty());
    }
}
