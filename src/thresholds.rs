/// Tunables shared across the indexing and retrieval paths.
///
/// Kept in one place so the relationships are visible: a chunk must fit the
/// embed input limit, a search must clear the similarity threshold, and a
/// claim must go stale before another run may take it over.

/// Target chunk size when splitting a source. Paragraphs are packed up to
/// this many characters; a single longer paragraph is split hard.
pub const MAX_CHUNK_CHARS: usize = 1200;

/// Anything above this never goes to an embedding provider — persisted as
/// `skipped_oversized` and reachable through lexical search only.
pub const MAX_EMBED_INPUT_CHARS: usize = 8000;

/// Default minimum cosine similarity for vector search results.
pub const DEFAULT_SEARCH_THRESHOLD: f64 = 0.30;

/// Default result cap for search operations.
pub const DEFAULT_SEARCH_LIMIT: usize = 10;

/// Vector search returning fewer hits than this pulls in lexical results.
pub const MIN_VECTOR_RESULTS: usize = 3;

/// An `in_progress` claim older than this is treated as abandoned and
/// reset to `pending` at the start of the next run.
pub const STALE_CLAIM_MS: i64 = 10 * 60 * 1000;

/// Chunks claimed per embedding round.
pub const EMBED_BATCH: usize = 32;

/// Attempts per provider before failing over to the next one.
pub const EMBED_MAX_ATTEMPTS: u32 = 3;

/// Per-call timeout for embedding provider requests.
pub const EMBED_TIMEOUT_SECS: u64 = 30;

/// Query-embedding LRU capacity.
pub const QUERY_CACHE_CAP: usize = 128;

/// Excerpt length returned with search hits.
pub const EXCERPT_CHARS: usize = 240;

/// Default batch size for the enrichment backfill pass.
pub const ENRICH_BATCH: usize = 16;
