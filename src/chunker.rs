//! Source splitting and incremental indexing.
//!
//! A scan is cheap to repeat: the whole-source digest short-circuits
//! unchanged files, and per-unit hashes skip everything that survived an
//! edit. Only new or changed units enter the embedding queue.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::GenConfig;
use crate::db::{ChunkRecord, EmbeddingStatus, IndexDB};
use crate::error::MnemoError;
use crate::thresholds::{ENRICH_BATCH, MAX_CHUNK_CHARS, MAX_EMBED_INPUT_CHARS};
use crate::util::estimate_tokens;
use crate::SharedDB;

/// BLAKE3 digest of a text, hex-encoded. Deterministic chunk identity.
pub fn content_hash(text: &str) -> String {
    blake3::hash(text.as_bytes()).to_hex().to_string()
}

/// Split text into ordered, size-bounded units.
///
/// Paragraphs (blank-line separated) are packed greedily up to
/// `max_chars`; a longer paragraph is re-split on sentence boundaries.
/// A single sentence with no boundary to cut at (minified blobs, dumps)
/// stays whole — cutting mid-sentence degrades the vector more than
/// skipping embedding does, and the lexical index still covers it.
pub fn split_chunks(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut units: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut current_chars = 0usize;

    let mut flush = |current: &mut String, current_chars: &mut usize, units: &mut Vec<String>| {
        let trimmed = current.trim();
        if !trimmed.is_empty() {
            units.push(trimmed.to_string());
        }
        current.clear();
        *current_chars = 0;
    };

    for para in text.split("\n\n") {
        let para = para.trim();
        if para.is_empty() {
            continue;
        }
        let para_chars = para.chars().count();

        if para_chars > max_chars {
            flush(&mut current, &mut current_chars, &mut units);
            units.extend(split_long_paragraph(para, max_chars));
            continue;
        }

        if current_chars + para_chars + 2 > max_chars && current_chars > 0 {
            flush(&mut current, &mut current_chars, &mut units);
        }
        if !current.is_empty() {
            current.push_str("\n\n");
            current_chars += 2;
        }
        current.push_str(para);
        current_chars += para_chars;
    }
    flush(&mut current, &mut current_chars, &mut units);
    units.retain(|u| !u.is_empty());
    units
}

/// Pack a paragraph's sentences into units of at most `max_chars`.
/// A single sentence beyond the budget is emitted as-is.
fn split_long_paragraph(para: &str, max_chars: usize) -> Vec<String> {
    let mut units = Vec::new();
    let mut current = String::new();
    let mut current_chars = 0usize;

    for sentence in split_sentences(para) {
        let len = sentence.chars().count();
        if current_chars + len > max_chars && current_chars > 0 {
            units.push(current.trim().to_string());
            current.clear();
            current_chars = 0;
        }
        current.push_str(sentence);
        current_chars += len;
    }
    if !current.trim().is_empty() {
        units.push(current.trim().to_string());
    }
    units.retain(|u| !u.is_empty());
    units
}

/// Split on sentence-ending punctuation or line breaks, keeping the
/// delimiter with the preceding piece.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0usize;
    let mut prev_end = false;
    for (i, c) in text.char_indices() {
        let is_end = matches!(c, '.' | '!' | '?' | '\n');
        if prev_end && !is_end {
            out.push(&text[start..i]);
            start = i;
        }
        prev_end = is_end;
    }
    if start < text.len() {
        out.push(&text[start..]);
    }
    out
}

#[derive(Deserialize)]
struct TranscriptLine {
    #[serde(default)]
    role: Option<String>,
    #[serde(alias = "content")]
    text: String,
}

/// Flatten a JSONL transcript to plain "role: text" lines.
/// Malformed lines are skipped with a warning; the count comes back so
/// callers can surface the loss.
pub fn flatten_transcript(raw: &str) -> (String, usize) {
    let mut out = String::with_capacity(raw.len());
    let mut malformed = 0usize;
    for (lineno, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<TranscriptLine>(line) {
            Ok(parsed) => {
                let role = parsed.role.as_deref().unwrap_or("unknown");
                out.push_str(role);
                out.push_str(": ");
                out.push_str(&parsed.text);
                out.push_str("\n\n");
            }
            Err(e) => {
                malformed += 1;
                warn!(lineno = lineno + 1, error = %e, "skipping malformed transcript line");
            }
        }
    }
    (out, malformed)
}

/// A text source on disk. `id` is the path relative to the scan root.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub id: String,
    pub path: PathBuf,
}

const SOURCE_EXTENSIONS: [&str; 3] = ["txt", "md", "jsonl"];

/// Enumerate indexable files under a directory, sorted by id for stable
/// scan order.
pub fn list_sources(dir: &Path) -> Result<Vec<SourceFile>, MnemoError> {
    let mut out = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let entries = std::fs::read_dir(&current)
            .map_err(|e| MnemoError::Internal(format!("read_dir {}: {e}", current.display())))?;
        for entry in entries {
            let entry = entry.map_err(|e| MnemoError::Internal(e.to_string()))?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
                continue;
            }
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
            if !SOURCE_EXTENSIONS.contains(&ext) {
                continue;
            }
            let id = path
                .strip_prefix(dir)
                .unwrap_or(&path)
                .to_string_lossy()
                .to_string();
            out.push(SourceFile { id, path });
        }
    }
    out.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(out)
}

/// Read a source into indexable text. JSONL transcripts are flattened;
/// everything else is taken verbatim. Returns malformed-line count.
pub fn read_source(sf: &SourceFile) -> Result<(String, usize), MnemoError> {
    let raw = std::fs::read_to_string(&sf.path)
        .map_err(|e| MnemoError::MalformedSource(format!("{}: {e}", sf.id)))?;
    if sf.path.extension().and_then(|e| e.to_str()) == Some("jsonl") {
        Ok(flatten_transcript(&raw))
    } else {
        Ok((raw, 0))
    }
}

/// What one source scan did.
#[derive(Debug, Default, Serialize)]
pub struct ScanOutcome {
    pub chunks_created: usize,
    pub chunks_skipped: usize,
    pub unchanged: bool,
}

/// What a full scan pass did.
#[derive(Debug, Default, Serialize)]
pub struct ScanReport {
    pub sources_scanned: usize,
    pub sources_unchanged: usize,
    pub sources_failed: usize,
    pub chunks_created: usize,
    pub chunks_skipped: usize,
    pub malformed_lines: usize,
}

/// Incrementally index one source's text.
///
/// Unchanged whole source → no-op. Per unit: an existing row with the same
/// `(source_id, sequence_index, content_hash)` is skipped; a changed unit
/// replaces its predecessor (row, embeddings, lexical entry) and enters the
/// queue as `pending`, or `skipped_oversized` when it exceeds the embed
/// input limit. Positions past the new end are pruned.
pub fn scan_source(db: &IndexDB, source_id: &str, text: &str) -> Result<ScanOutcome, MnemoError> {
    let whole_hash = content_hash(text);
    if db.source_hash(source_id).as_deref() == Some(whole_hash.as_str()) {
        debug!(source_id, "source unchanged, skipping");
        return Ok(ScanOutcome { unchanged: true, ..Default::default() });
    }

    let units = split_chunks(text, MAX_CHUNK_CHARS);
    let mut outcome = ScanOutcome::default();

    for (i, unit) in units.iter().enumerate() {
        let seq = i as i64;
        let hash = content_hash(unit);
        if db.chunk_hash_exists(source_id, seq, &hash)? {
            outcome.chunks_skipped += 1;
            continue;
        }
        // changed unit: retire whatever sat at this position before
        for old in db.chunks_at_position(source_id, seq)? {
            db.delete_chunk(&old.id)?;
        }
        let status = if unit.chars().count() > MAX_EMBED_INPUT_CHARS {
            EmbeddingStatus::SkippedOversized
        } else {
            EmbeddingStatus::Pending
        };
        let tokens = estimate_tokens(unit) as i64;
        db.insert_chunk(source_id, seq, &hash, unit, tokens, status)?;
        outcome.chunks_created += 1;
    }

    db.prune_chunks_from(source_id, units.len() as i64)?;
    db.record_source_scan(source_id, &whole_hash)?;
    Ok(outcome)
}

/// Scan every source under a directory. Per-source failures are isolated;
/// the pass always completes.
pub fn scan_dir(db: &IndexDB, dir: &Path) -> Result<ScanReport, MnemoError> {
    let sources = list_sources(dir)?;
    let mut report = ScanReport::default();

    for sf in &sources {
        let (text, malformed) = match read_source(sf) {
            Ok(v) => v,
            Err(e) => {
                warn!(source = %sf.id, error = %e, "source unreadable, skipping");
                report.sources_failed += 1;
                continue;
            }
        };
        report.malformed_lines += malformed;
        match scan_source(db, &sf.id, &text) {
            Ok(outcome) => {
                if outcome.unchanged {
                    report.sources_unchanged += 1;
                } else {
                    report.sources_scanned += 1;
                }
                report.chunks_created += outcome.chunks_created;
                report.chunks_skipped += outcome.chunks_skipped;
            }
            Err(e) => {
                warn!(source = %sf.id, error = %e, "scan failed, skipping source");
                report.sources_failed += 1;
            }
        }
    }

    info!(
        scanned = report.sources_scanned,
        unchanged = report.sources_unchanged,
        created = report.chunks_created,
        skipped = report.chunks_skipped,
        "scan pass complete"
    );
    Ok(report)
}

const ENRICH_PROMPT: &str = "You situate a fragment of a larger transcript. \
    Given the fragment, write ONE short sentence (under 30 words) naming what \
    the surrounding conversation is about, so the fragment makes sense on its \
    own. Output only that sentence — no preamble, no quotes.";

#[derive(Debug, Default, Serialize)]
pub struct EnrichReport {
    pub enriched: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Prepend a generated context sentence to one chunk's text.
/// Returns false when the chunk already had enrichment.
pub async fn enrich_chunk(
    db: &SharedDB,
    gen: &GenConfig,
    chunk: &ChunkRecord,
) -> Result<bool, MnemoError> {
    if chunk.enriched_text.is_some() {
        return Ok(false);
    }

    let user = format!("Source: {}\n\nFragment:\n{}", chunk.source_id, chunk.raw_text);
    let context = gen.generate(ENRICH_PROMPT, &user).await?;
    let context = context.trim();
    if context.is_empty() {
        return Err(MnemoError::Internal("empty enrichment response".into()));
    }

    let enriched = format!("{context}\n\n{}", chunk.raw_text);
    let id = chunk.id.clone();
    let was_embedded = chunk.embedding_status == EmbeddingStatus::Embedded;
    let applied = crate::db_call(db, move |db| -> Result<bool, MnemoError> {
        let set = db.set_enriched_text(&id, &enriched)?;
        if set && was_embedded {
            // embedded under the raw text — requeue so the vector catches up
            db.mark_chunk(&id, EmbeddingStatus::Pending)?;
        }
        Ok(set)
    })
    .await??;
    Ok(applied)
}

/// Retrofit enrichment onto chunks that lack it, `batch_size` at a time.
/// Resumable and idempotent: already-enriched chunks are skipped, failures
/// are isolated and left for the next pass.
pub async fn enrich_backfill(
    db: &SharedDB,
    gen: &GenConfig,
    batch_size: usize,
) -> Result<EnrichReport, MnemoError> {
    let batch_size = if batch_size == 0 { ENRICH_BATCH } else { batch_size };
    let candidates =
        crate::db_call(db, move |db| db.unenriched_chunks(batch_size)).await??;

    let mut report = EnrichReport::default();
    for chunk in candidates {
        match enrich_chunk(db, gen, &chunk).await {
            Ok(true) => report.enriched += 1,
            Ok(false) => report.skipped += 1,
            Err(e) => {
                warn!(chunk = %chunk.id, error = %e, "enrichment failed");
                report.failed += 1;
            }
        }
    }
    info!(
        enriched = report.enriched,
        skipped = report.skipped,
        failed = report.failed,
        "enrichment pass complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        assert_eq!(content_hash("abc"), content_hash("abc"));
        assert_ne!(content_hash("abc"), content_hash("abd"));
    }

    #[test]
    fn split_packs_paragraphs() {
        let text = "first para\n\nsecond para\n\nthird para";
        let units = split_chunks(text, 30);
        assert_eq!(units.len(), 2);
        assert!(units[0].contains("first para"));
        assert!(units[0].contains("second para"));
        assert_eq!(units[1], "third para");
    }

    #[test]
    fn split_bounds_units_with_sentence_breaks() {
        let long = "This is a sentence. ".repeat(300); // ~6000 chars
        let units = split_chunks(&long, 1200);
        assert!(units.len() >= 5);
        for u in &units {
            assert!(u.chars().count() <= 1200, "unit exceeded budget: {} chars", u.chars().count());
        }
    }

    #[test]
    fn unbreakable_blob_stays_whole() {
        // no sentence boundaries at all — must come through as one unit
        let blob = "x".repeat(5000);
        let units = split_chunks(&blob, 1200);
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].chars().count(), 5000);
    }

    #[test]
    fn sentence_splitter_keeps_delimiters() {
        let pieces = split_sentences("One. Two! Three");
        assert_eq!(pieces, vec!["One.", " Two!", " Three"]);
        assert_eq!(pieces.concat(), "One. Two! Three");
    }

    #[test]
    fn split_empty_input() {
        assert!(split_chunks("", 100).is_empty());
        assert!(split_chunks("\n\n\n\n", 100).is_empty());
    }

    #[test]
    fn transcript_flattening_skips_malformed() {
        let raw = r#"{"role": "user", "text": "hello there"}
not json at all
{"role": "assistant", "text": "hi"}
{"text": "no role"}"#;
        let (flat, malformed) = flatten_transcript(raw);
        assert_eq!(malformed, 1);
        assert!(flat.contains("user: hello there"));
        assert!(flat.contains("assistant: hi"));
        assert!(flat.contains("unknown: no role"));
    }

    #[test]
    fn transcript_content_alias() {
        let raw = r#"{"role": "user", "content": "aliased field"}"#;
        let (flat, malformed) = flatten_transcript(raw);
        assert_eq!(malformed, 0);
        assert!(flat.contains("user: aliased field"));
    }
}
