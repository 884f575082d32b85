mod common;

use std::sync::Arc;

use common::{broken_provider, stack_of, stop_flag, test_db, StubProvider};
use mnemo::db::{KnowledgeFilter, KnowledgeInput, KnowledgePatch};
use mnemo::error::MnemoError;
use mnemo::indexer::embed_all;
use mnemo::retrieve::{semantic_search_knowledge, SearchOptions};
use mnemo::EmbedCache;

fn cache() -> EmbedCache {
    EmbedCache::new(16)
}

fn provider() -> StubProvider {
    StubProvider::new("stub", "test-model", 3)
        .rule("postgres", vec![1.0, 0.0, 0.0])
        .rule("database", vec![0.9, 0.1, 0.0])
        .rule("kubernetes", vec![0.0, 1.0, 0.0])
}

#[tokio::test]
async fn semantic_search_returns_similar_entries() {
    let db = test_db();
    let pg = db
        .add_knowledge(KnowledgeInput::new(
            "Postgres tuning",
            "Increase shared_buffers for the postgres analytics workload",
        ))
        .unwrap();
    db.add_knowledge(KnowledgeInput::new(
        "Cluster rollout",
        "The kubernetes upgrade goes node pool by node pool",
    ))
    .unwrap();

    let stack = stack_of(vec![Arc::new(provider())]);
    let report = embed_all(&db, &stack, &stop_flag()).await.unwrap();
    assert_eq!(report.knowledge_embedded, 2);

    let opts = SearchOptions { threshold: 0.7, limit: 5, ..Default::default() };
    let results = semantic_search_knowledge(&db, &stack, &cache(), "database sizing", opts)
        .await
        .unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].0.id, pg.id);
    assert!(results[0].1 >= 0.7);
}

#[tokio::test]
async fn semantic_search_surfaces_exhaustion() {
    let db = test_db();
    db.add_knowledge(KnowledgeInput::new("t", "some summary")).unwrap();

    let stack = stack_of(vec![Arc::new(broken_provider("dead", "m", 3))]);
    let result = semantic_search_knowledge(
        &db,
        &stack,
        &cache(),
        "anything",
        SearchOptions::default(),
    )
    .await;
    assert!(matches!(result, Err(MnemoError::AllProvidersExhausted)));
}

#[tokio::test]
async fn updated_summary_is_reembedded_before_serving() {
    let db = test_db();
    let entry = db
        .add_knowledge(KnowledgeInput::new("Notes", "all about postgres internals"))
        .unwrap();

    let stack = stack_of(vec![Arc::new(provider())]);
    embed_all(&db, &stack, &stop_flag()).await.unwrap();

    // summary pivots to a different topic → old vector must not survive
    db.update_knowledge(&entry.id, KnowledgePatch {
        summary: Some("now all about kubernetes scheduling".into()),
        ..Default::default()
    })
    .unwrap();

    let opts = SearchOptions { threshold: 0.7, limit: 5, ..Default::default() };
    let stale = semantic_search_knowledge(&db, &stack, &cache(), "postgres sizing", opts.clone())
        .await
        .unwrap();
    assert!(stale.is_empty(), "stale vector served after summary change");

    embed_all(&db, &stack, &stop_flag()).await.unwrap();
    let fresh = semantic_search_knowledge(&db, &stack, &cache(), "kubernetes rollout", opts)
        .await
        .unwrap();
    assert_eq!(fresh.len(), 1);
    assert_eq!(fresh[0].0.id, entry.id);
}

#[tokio::test]
async fn stats_track_embeddings() {
    let db = test_db();
    db.add_knowledge(KnowledgeInput::new("a", "summary about postgres")).unwrap();
    db.add_knowledge(KnowledgeInput::new("b", "summary about kubernetes")).unwrap();

    assert_eq!(db.knowledge_stats().unwrap().with_embeddings, 0);

    let stack = stack_of(vec![Arc::new(provider())]);
    embed_all(&db, &stack, &stop_flag()).await.unwrap();

    let stats = db.knowledge_stats().unwrap();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.with_embeddings, 2);
}

#[test]
fn lexical_search_path_needs_no_provider() {
    let db = test_db();
    db.add_knowledge(KnowledgeInput::new(
        "Deploy ritual",
        "Always run the smoke suite before deploys",
    ))
    .unwrap();

    let hits = db.search_lexical("smoke suite", 10, Some(mnemo::db::OWNER_KNOWLEDGE)).unwrap();
    assert_eq!(hits.len(), 1);
}

#[test]
fn verify_then_update_flow() {
    // verification must not survive a summary rewrite
    let db = test_db();
    let entry = db
        .add_knowledge(KnowledgeInput::new("fact", "original summary").confidence(0.6))
        .unwrap();

    let verified = db.verify_knowledge(&entry.id, None).unwrap();
    assert!(verified.verified);
    assert!((verified.confidence - 0.6).abs() < 1e-9);

    let updated = db
        .update_knowledge(&entry.id, KnowledgePatch {
            summary: Some("a different summary".into()),
            ..Default::default()
        })
        .unwrap();
    assert!(!updated.verified);

    let listed = db
        .list_knowledge(&KnowledgeFilter { verified: Some(false), ..Default::default() })
        .unwrap();
    assert_eq!(listed.len(), 1);
}
