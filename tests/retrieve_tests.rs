mod common;

use std::sync::Arc;

use common::{broken_provider, stack_of, stop_flag, test_db, StubProvider};
use mnemo::chunker::scan_source;
use mnemo::db::now_ms;
use mnemo::error::MnemoError;
use mnemo::indexer::embed_all;
use mnemo::retrieve::{query, SearchOptions, SearchOrigin};
use mnemo::EmbedCache;

fn cache() -> EmbedCache {
    EmbedCache::new(16)
}

/// Provider whose rules reproduce the fox/programming corpus: the animal
/// query lands nearly parallel to the fox chunk and orthogonal to the
/// programming chunk.
fn fox_provider() -> StubProvider {
    StubProvider::new("stub", "test-model", 3)
        .rule("fox", vec![1.0, 0.0, 0.0])
        .rule("programming", vec![0.0, 1.0, 0.0])
        .rule("animal", vec![0.95, 0.05, 0.0])
}

#[tokio::test]
async fn end_to_end_fox_query() {
    let db = test_db();
    scan_source(&db, "animals.txt", "The quick brown fox jumps over the lazy dog").unwrap();
    scan_source(&db, "code.txt", "Programming is fun and challenging").unwrap();

    let stack = stack_of(vec![Arc::new(fox_provider())]);
    embed_all(&db, &stack, &stop_flag()).await.unwrap();

    let opts = SearchOptions { threshold: 0.7, limit: 3, ..Default::default() };
    let response = query(
        &db,
        &stack,
        &cache(),
        "fast animal jumping over a sleeping dog",
        opts,
    )
    .await
    .unwrap();

    assert!(response.vector_available);
    let vector_hits: Vec<_> =
        response.hits.iter().filter(|h| h.origin == SearchOrigin::Vector).collect();
    assert_eq!(vector_hits.len(), 1, "only the fox chunk clears 0.7");
    assert!(vector_hits[0].score >= 0.7);
    assert!(vector_hits[0].excerpt.contains("fox"));
    assert!(
        !response.hits.iter().any(|h| h.excerpt.contains("Programming")),
        "programming chunk sits far below the threshold"
    );
}

#[tokio::test]
async fn vector_results_respect_threshold_monotonicity() {
    let db = test_db();
    scan_source(&db, "animals.txt", "The quick brown fox jumps over the lazy dog").unwrap();
    scan_source(&db, "code.txt", "Programming is fun and challenging").unwrap();

    let stack = stack_of(vec![Arc::new(fox_provider())]);
    embed_all(&db, &stack, &stop_flag()).await.unwrap();

    let mut prev = usize::MAX;
    for threshold in [0.0, 0.5, 0.9, 0.999] {
        let opts = SearchOptions { threshold, limit: 10, ..Default::default() };
        let response =
            query(&db, &stack, &cache(), "fast animal jumping", opts).await.unwrap();
        let vector_count =
            response.hits.iter().filter(|h| h.origin == SearchOrigin::Vector).count();
        for h in response.hits.iter().filter(|h| h.origin == SearchOrigin::Vector) {
            assert!(h.score >= threshold);
        }
        assert!(vector_count <= prev, "raising threshold grew the vector result set");
        prev = vector_count;
    }
}

#[tokio::test]
async fn lexical_only_when_no_providers() {
    let db = test_db();
    scan_source(&db, "notes.md", "the migration plan for the billing cluster").unwrap();

    let stack = stack_of(vec![]);
    let response = query(
        &db,
        &stack,
        &cache(),
        "billing migration",
        SearchOptions::default(),
    )
    .await
    .unwrap();

    assert!(!response.vector_available);
    assert_eq!(response.search_mode, "lexical");
    assert_eq!(response.hits.len(), 1);
    assert_eq!(response.hits[0].origin, SearchOrigin::Lexical);
}

#[tokio::test]
async fn lexical_fallback_when_all_providers_exhausted() {
    let db = test_db();
    scan_source(&db, "notes.md", "the migration plan for the billing cluster").unwrap();

    let stack = stack_of(vec![Arc::new(broken_provider("dead", "m", 3))]);
    let response = query(
        &db,
        &stack,
        &cache(),
        "billing migration",
        SearchOptions::default(),
    )
    .await
    .unwrap();

    assert!(!response.vector_available, "exhausted stack downgrades to lexical");
    assert_eq!(response.search_mode, "lexical");
    assert_eq!(response.hits.len(), 1);
}

#[tokio::test]
async fn lexical_supplements_underfilled_vector_results() {
    let db = test_db();
    scan_source(&db, "animals.txt", "The quick brown fox jumps over the lazy dog").unwrap();
    // lexically findable, but embedded orthogonal to the query
    scan_source(&db, "other.txt", "a second document about jumping spiders").unwrap();

    let stack = stack_of(vec![Arc::new(fox_provider())]);
    embed_all(&db, &stack, &stop_flag()).await.unwrap();

    let opts = SearchOptions { threshold: 0.7, limit: 5, ..Default::default() };
    let response =
        query(&db, &stack, &cache(), "fast animal jumping", opts).await.unwrap();

    assert_eq!(response.search_mode, "vector+lexical");
    let origins: Vec<_> = response.hits.iter().map(|h| h.origin).collect();
    assert!(origins.contains(&SearchOrigin::Vector));
    assert!(origins.contains(&SearchOrigin::Lexical));
}

#[tokio::test]
async fn merged_owner_prefers_vector_score() {
    let db = test_db();
    // one chunk that both paths will surface
    scan_source(&db, "animals.txt", "The quick brown fox jumps over the lazy dog").unwrap();

    let stack = stack_of(vec![Arc::new(fox_provider())]);
    embed_all(&db, &stack, &stop_flag()).await.unwrap();

    // vector returns 1 hit (< MIN_VECTOR_RESULTS) → lexical supplement runs
    // and surfaces the same chunk; the merge must keep one vector-origin hit
    let opts = SearchOptions { threshold: 0.5, limit: 5, ..Default::default() };
    let response =
        query(&db, &stack, &cache(), "fox jumps", opts).await.unwrap();

    assert_eq!(response.hits.len(), 1, "same owner must not appear twice");
    assert_eq!(response.hits[0].origin, SearchOrigin::Vector);
}

#[tokio::test]
async fn after_filter_excludes_older_owners() {
    let db = test_db();
    scan_source(&db, "old.txt", "the quick brown fox, older document").unwrap();
    std::thread::sleep(std::time::Duration::from_millis(10));
    let cutoff = now_ms();
    std::thread::sleep(std::time::Duration::from_millis(10));
    scan_source(&db, "new.txt", "the quick brown fox, newer document").unwrap();

    let stack = stack_of(vec![Arc::new(fox_provider())]);
    embed_all(&db, &stack, &stop_flag()).await.unwrap();

    let opts = SearchOptions { threshold: 0.5, limit: 10, after: Some(cutoff), ..Default::default() };
    let response = query(&db, &stack, &cache(), "fox", opts).await.unwrap();

    assert!(!response.hits.is_empty());
    for hit in &response.hits {
        assert!(hit.created_at >= cutoff, "owner created before `after` leaked through");
        assert!(hit.excerpt.contains("newer"));
    }
}

#[tokio::test]
async fn empty_query_rejected() {
    let db = test_db();
    let stack = stack_of(vec![]);
    assert!(matches!(
        query(&db, &stack, &cache(), "   ", SearchOptions::default()).await,
        Err(MnemoError::EmptyQuery)
    ));
}

#[tokio::test]
async fn query_embedding_is_cached() {
    let db = test_db();
    scan_source(&db, "animals.txt", "The quick brown fox jumps over the lazy dog").unwrap();

    let stub = Arc::new(fox_provider());
    let stack = stack_of(vec![stub.clone()]);
    embed_all(&db, &stack, &stop_flag()).await.unwrap();
    let calls_after_index = stub.calls();

    let shared_cache = cache();
    for _ in 0..3 {
        query(&db, &stack, &shared_cache, "fast animal jumping", SearchOptions::default())
            .await
            .unwrap();
    }
    assert_eq!(
        stub.calls(),
        calls_after_index + 1,
        "repeat queries must hit the embedding cache"
    );
}
