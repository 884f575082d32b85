//! SQLite-backed index storage: chunks, embeddings, knowledge entries,
//! memory records, and the FTS5 lexical index.

mod chunks;
mod knowledge;
mod lexical;
mod memory;
mod vectors;

pub use vectors::VectorHit;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use serde::{Deserialize, Serialize};

use crate::error::MnemoError;

/// Set busy_timeout on every connection handed out by the pool.
/// Prevents SQLITE_BUSY when a background run overlaps API writes.
#[derive(Debug)]
struct BusyTimeoutCustomizer;
impl r2d2::CustomizeConnection<rusqlite::Connection, rusqlite::Error> for BusyTimeoutCustomizer {
    fn on_acquire(&self, conn: &mut rusqlite::Connection) -> Result<(), rusqlite::Error> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(())
    }
}

type PooledConn = r2d2::PooledConnection<SqliteConnectionManager>;

pub const OWNER_CHUNK: &str = "chunk";
pub const OWNER_KNOWLEDGE: &str = "knowledge";
pub const OWNER_MEMORY: &str = "memory";

const MAX_TITLE_LEN: usize = 256;
const MAX_SUMMARY_LEN: usize = 8192;
const MAX_TAGS: usize = 20;
const MAX_TAG_LEN: usize = 32;

/// Lifecycle of a chunk's embedding.
///
/// `Pending` and `InProgress` are transient; `Embedded` and
/// `SkippedOversized` are terminal; `Failed` may be retried explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingStatus {
    Pending,
    InProgress,
    Embedded,
    SkippedOversized,
    Failed,
}

impl EmbeddingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Embedded => "embedded",
            Self::SkippedOversized => "skipped_oversized",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Result<Self, MnemoError> {
        match value {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "embedded" => Ok(Self::Embedded),
            "skipped_oversized" => Ok(Self::SkippedOversized),
            "failed" => Ok(Self::Failed),
            _ => Err(MnemoError::Internal(format!("unknown embedding status: {value}"))),
        }
    }
}

/// One bounded unit of source text — the unit of embedding and of
/// incremental indexing.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkRecord {
    pub id: String,
    pub source_id: String,
    pub sequence_index: i64,
    pub content_hash: String,
    pub raw_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enriched_text: Option<String>,
    pub token_count: i64,
    pub embedding_status: EmbeddingStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<i64>,
    pub created_at: i64,
}

impl ChunkRecord {
    /// Text that actually goes to the embedding provider.
    pub fn embed_text(&self) -> &str {
        self.enriched_text.as_deref().unwrap_or(&self.raw_text)
    }
}

/// A distilled fact with confidence and verification state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    pub id: String,
    pub title: String,
    pub summary: String,
    pub source_type: String,
    pub tags: Vec<String>,
    pub confidence: f64,
    pub verified: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Default, Deserialize)]
pub struct KnowledgeInput {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub summary: String,
    pub source_type: Option<String>,
    pub tags: Option<Vec<String>>,
    pub confidence: Option<f64>,
}

impl KnowledgeInput {
    pub fn new(title: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            summary: summary.into(),
            ..Default::default()
        }
    }

    pub fn source_type(mut self, s: impl Into<String>) -> Self {
        self.source_type = Some(s.into());
        self
    }

    pub fn tags(mut self, t: Vec<String>) -> Self {
        self.tags = Some(t);
        self
    }

    pub fn confidence(mut self, c: f64) -> Self {
        self.confidence = Some(c);
        self
    }
}

/// Partial update for a knowledge entry. A changed summary resets
/// `verified`; tags/confidence alone do not.
#[derive(Debug, Default, Deserialize)]
pub struct KnowledgePatch {
    pub summary: Option<String>,
    pub tags: Option<Vec<String>>,
    pub confidence: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct KnowledgeFilter {
    pub source_type: Option<String>,
    pub tag: Option<String>,
    pub verified: Option<bool>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// A durable memory record. Content is immutable once embedded — revisions
/// insert a new row and mark the old one superseded, keeping text and
/// vectors in sync.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryRecord {
    pub id: String,
    pub category: String,
    pub subject: String,
    pub content: String,
    pub importance: i64,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Default, Deserialize)]
pub struct MemoryInput {
    #[serde(default)]
    pub content: String,
    pub category: Option<String>,
    pub subject: Option<String>,
    pub importance: Option<i64>,
    pub source: Option<String>,
}

impl MemoryInput {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn category(mut self, c: impl Into<String>) -> Self {
        self.category = Some(c.into());
        self
    }

    pub fn subject(mut self, s: impl Into<String>) -> Self {
        self.subject = Some(s.into());
        self
    }

    pub fn importance(mut self, i: i64) -> Self {
        self.importance = Some(i);
        self
    }

    pub fn source(mut self, s: impl Into<String>) -> Self {
        self.source = Some(s.into());
        self
    }
}

/// Backlog counts by embedding status, plus owners still missing vectors.
#[derive(Debug, Default, Serialize)]
pub struct EmbedStatusReport {
    pub pending: usize,
    pub in_progress: usize,
    pub embedded: usize,
    pub skipped_oversized: usize,
    pub failed: usize,
    pub total: usize,
    pub knowledge_missing: usize,
    pub memories_missing: usize,
}

#[derive(Debug, Default, Serialize)]
pub struct KnowledgeStats {
    pub total: usize,
    pub verified: usize,
    pub with_embeddings: usize,
}

fn validate_knowledge_input(input: &KnowledgeInput) -> Result<(), MnemoError> {
    if input.title.trim().is_empty() || input.summary.trim().is_empty() {
        return Err(MnemoError::EmptyContent);
    }
    if input.title.chars().count() > MAX_TITLE_LEN {
        return Err(MnemoError::Validation("title too long".into()));
    }
    if input.summary.chars().count() > MAX_SUMMARY_LEN {
        return Err(MnemoError::Validation("summary too long".into()));
    }
    if let Some(c) = input.confidence {
        if !(0.0..=1.0).contains(&c) {
            return Err(MnemoError::Validation(format!("confidence {c} outside [0,1]")));
        }
    }
    if let Some(ref tags) = input.tags {
        validate_tags(tags)?;
    }
    Ok(())
}

fn validate_tags(tags: &[String]) -> Result<(), MnemoError> {
    if tags.len() > MAX_TAGS {
        return Err(MnemoError::Validation(format!("too many tags (max {MAX_TAGS})")));
    }
    if let Some(t) = tags.iter().find(|t| t.chars().count() > MAX_TAG_LEN) {
        return Err(MnemoError::Validation(format!("tag '{t}' too long (max {MAX_TAG_LEN})")));
    }
    Ok(())
}

fn validate_memory_input(input: &MemoryInput) -> Result<(), MnemoError> {
    if input.content.trim().is_empty() {
        return Err(MnemoError::EmptyContent);
    }
    if input.content.chars().count() > MAX_SUMMARY_LEN {
        return Err(MnemoError::Validation("content too long".into()));
    }
    if let Some(i) = input.importance {
        if !(1..=10).contains(&i) {
            return Err(MnemoError::Validation(format!("importance {i} outside 1-10")));
        }
    }
    Ok(())
}

pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_millis() as i64
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS chunks (
    id TEXT PRIMARY KEY,
    source_id TEXT NOT NULL,
    sequence_index INTEGER NOT NULL,
    content_hash TEXT NOT NULL,
    raw_text TEXT NOT NULL,
    enriched_text TEXT,
    token_count INTEGER NOT NULL DEFAULT 0,
    embedding_status TEXT NOT NULL DEFAULT 'pending',
    claimed_at INTEGER,
    created_at INTEGER NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_chunks_identity
    ON chunks(source_id, sequence_index, content_hash);
CREATE INDEX IF NOT EXISTS idx_chunks_source ON chunks(source_id);
CREATE INDEX IF NOT EXISTS idx_chunks_status ON chunks(embedding_status);

CREATE TABLE IF NOT EXISTS embeddings (
    owner_id TEXT NOT NULL,
    owner_type TEXT NOT NULL,
    model TEXT NOT NULL,
    dimensions INTEGER NOT NULL,
    vector BLOB NOT NULL,
    provider TEXT NOT NULL DEFAULT '',
    created_at INTEGER NOT NULL,
    PRIMARY KEY (owner_id, owner_type, model)
);
CREATE INDEX IF NOT EXISTS idx_embeddings_model ON embeddings(model);

CREATE TABLE IF NOT EXISTS knowledge_entries (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    summary TEXT NOT NULL,
    source_type TEXT NOT NULL DEFAULT 'manual',
    tags TEXT NOT NULL DEFAULT '[]',
    confidence REAL NOT NULL DEFAULT 0.5,
    verified INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS memories (
    id TEXT PRIMARY KEY,
    category TEXT NOT NULL DEFAULT 'general',
    subject TEXT NOT NULL DEFAULT '',
    content TEXT NOT NULL,
    importance INTEGER NOT NULL DEFAULT 5,
    source TEXT NOT NULL DEFAULT 'manual',
    superseded_by TEXT,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_memories_category ON memories(category);

CREATE TABLE IF NOT EXISTS sources (
    id TEXT PRIMARY KEY,
    content_hash TEXT NOT NULL,
    scanned_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS mnemo_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

// External-content FTS — inserts/deletes are managed manually so the lexical
// index stays a derived structure rebuildable from raw text.
const FTS_SCHEMA: &str =
    "CREATE VIRTUAL TABLE IF NOT EXISTS search_fts USING fts5(\
     owner_id UNINDEXED, owner_type UNINDEXED, content, tokenize='unicode61')";

/// SQLite-backed index store.
pub struct IndexDB {
    pool: Pool<SqliteConnectionManager>,
}

impl IndexDB {
    fn conn(&self) -> Result<PooledConn, MnemoError> {
        self.pool.get().map_err(|e| MnemoError::Internal(format!("pool: {e}")))
    }

    /// Open (or create) a database at the given path.
    /// Pool size defaults to 8 (1 writer + 7 readers in WAL mode).
    pub fn open(path: &str) -> Result<Self, MnemoError> {
        let pool_size = if path == ":memory:" { 2 } else { 8 };
        let manager = if path == ":memory:" {
            // Shared cache so all pool connections see the same in-memory DB.
            // Each open gets a unique name to avoid cross-test pollution.
            let name = uuid::Uuid::new_v4().to_string();
            SqliteConnectionManager::file(format!("file:{name}?mode=memory&cache=shared"))
        } else {
            SqliteConnectionManager::file(path)
        };
        let pool = Pool::builder()
            .max_size(pool_size)
            .connection_customizer(Box::new(BusyTimeoutCustomizer))
            .build(manager)
            .map_err(|e| MnemoError::Internal(format!("pool: {e}")))?;

        let conn = pool.get().map_err(|e| MnemoError::Internal(e.to_string()))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;
        conn.execute(FTS_SCHEMA, [])?;
        if conn.prepare("SELECT provider FROM embeddings LIMIT 0").is_err() {
            conn.execute("ALTER TABLE embeddings ADD COLUMN provider TEXT NOT NULL DEFAULT ''", [])?;
        }
        if conn.prepare("SELECT claimed_at FROM chunks LIMIT 0").is_err() {
            conn.execute("ALTER TABLE chunks ADD COLUMN claimed_at INTEGER", [])?;
        }
        drop(conn);

        let db = Self { pool };
        db.rebuild_lexical_if_needed()?;
        Ok(db)
    }

    /// Database file size in bytes (via SQLite pragma).
    pub fn db_size_bytes(&self) -> i64 {
        self.conn()
            .and_then(|c| {
                c.query_row(
                    "SELECT page_count * page_size FROM pragma_page_count, pragma_page_size",
                    [],
                    |r| r.get(0),
                )
                .map_err(|e| MnemoError::Internal(e.to_string()))
            })
            .unwrap_or(0)
    }

    pub fn get_meta(&self, key: &str) -> Option<String> {
        self.conn().ok().and_then(|c| {
            c.query_row("SELECT value FROM mnemo_meta WHERE key = ?1", [key], |r| r.get(0)).ok()
        })
    }

    pub fn set_meta(&self, key: &str, value: &str) -> Result<(), MnemoError> {
        self.conn()?.execute(
            "INSERT OR REPLACE INTO mnemo_meta (key, value) VALUES (?1, ?2)",
            rusqlite::params![key, value],
        )?;
        Ok(())
    }

    /// Recorded whole-source digest from the last scan, if any.
    pub fn source_hash(&self, source_id: &str) -> Option<String> {
        self.conn().ok().and_then(|c| {
            c.query_row("SELECT content_hash FROM sources WHERE id = ?1", [source_id], |r| r.get(0))
                .ok()
        })
    }

    pub fn record_source_scan(&self, source_id: &str, hash: &str) -> Result<(), MnemoError> {
        self.conn()?.execute(
            "INSERT OR REPLACE INTO sources (id, content_hash, scanned_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![source_id, hash, now_ms()],
        )?;
        Ok(())
    }

    pub fn list_source_ids(&self) -> Vec<String> {
        let Ok(conn) = self.conn() else { return vec![] };
        let Ok(mut stmt) = conn.prepare("SELECT id FROM sources ORDER BY id") else {
            return vec![];
        };
        stmt.query_map([], |r| r.get::<_, String>(0))
            .map(|rows| rows.filter_map(|r| r.ok()).collect())
            .unwrap_or_default()
    }
}

fn row_to_chunk(row: &rusqlite::Row) -> rusqlite::Result<ChunkRecord> {
    let status_str: String = row.get("embedding_status")?;
    Ok(ChunkRecord {
        id: row.get("id")?,
        source_id: row.get("source_id")?,
        sequence_index: row.get("sequence_index")?,
        content_hash: row.get("content_hash")?,
        raw_text: row.get("raw_text")?,
        enriched_text: row.get("enriched_text")?,
        token_count: row.get("token_count")?,
        embedding_status: EmbeddingStatus::parse(&status_str)
            .unwrap_or(EmbeddingStatus::Pending),
        claimed_at: row.get("claimed_at")?,
        created_at: row.get("created_at")?,
    })
}

fn row_to_knowledge(row: &rusqlite::Row) -> rusqlite::Result<KnowledgeEntry> {
    let tags_str: String = row.get("tags")?;
    Ok(KnowledgeEntry {
        id: row.get("id")?,
        title: row.get("title")?,
        summary: row.get("summary")?,
        source_type: row.get("source_type")?,
        tags: serde_json::from_str(&tags_str).unwrap_or_default(),
        confidence: row.get("confidence")?,
        verified: row.get::<_, i64>("verified")? != 0,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn row_to_memory(row: &rusqlite::Row) -> rusqlite::Result<MemoryRecord> {
    Ok(MemoryRecord {
        id: row.get("id")?,
        category: row.get("category")?,
        subject: row.get("subject")?,
        content: row.get("content")?,
        importance: row.get("importance")?,
        source: row.get("source")?,
        superseded_by: row.get("superseded_by")?,
        created_at: row.get("created_at")?,
    })
}

#[cfg(test)]
mod meta_tests {
    use super::*;

    #[test]
    fn meta_get_set() {
        let db = IndexDB::open(":memory:").unwrap();
        assert_eq!(db.get_meta("nonexistent"), None);
        db.set_meta("last_scan_ms", "1234567890").unwrap();
        assert_eq!(db.get_meta("last_scan_ms"), Some("1234567890".to_string()));
        db.set_meta("last_scan_ms", "9999999999").unwrap();
        assert_eq!(db.get_meta("last_scan_ms"), Some("9999999999".to_string()));
    }

    #[test]
    fn status_roundtrip() {
        for s in [
            EmbeddingStatus::Pending,
            EmbeddingStatus::InProgress,
            EmbeddingStatus::Embedded,
            EmbeddingStatus::SkippedOversized,
            EmbeddingStatus::Failed,
        ] {
            assert_eq!(EmbeddingStatus::parse(s.as_str()).unwrap(), s);
        }
        assert!(EmbeddingStatus::parse("bogus").is_err());
    }
}
