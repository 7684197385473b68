//! The full pipeline over SQLite: cache, store and ledger persistence
//! across two "runs" sharing one database file.

mod common;

use std::sync::Arc;

use tempfile::TempDir;

use maintenance_intel::cache::{ExtractionCache, SqliteCacheBackend};
use maintenance_intel::config::Config;
use maintenance_intel::ledger::{CostLedger, OperationKind};
use maintenance_intel::migrate;
use maintenance_intel::models::{Document, DocumentStatus};
use maintenance_intel::orchestrator::ExtractionSource;
use maintenance_intel::pipeline::Pipeline;
use maintenance_intel::store::sqlite::SqliteStore;
use maintenance_intel::store::{EventFilters, Store};

use common::{FakeEmbedder, FakeExtractor};

const RECORD: &str = "P-12 bearing overheating on drive end\n\
                      P-13 bearing overheating after restart\n\
                      P-14 bearing noise and overheating\n\
                      V-7 control valve stuck closed";

struct Run {
    store: Arc<SqliteStore>,
    ledger: Arc<CostLedger>,
    extractor: Arc<FakeExtractor>,
    embedder: Arc<FakeEmbedder>,
    pipeline: Arc<Pipeline>,
    flushed: usize,
}

async fn open(config: &Config) -> Run {
    let pool = migrate::init_database(config).await.unwrap();
    let store = Arc::new(SqliteStore::new(pool.clone()));
    let history = store.cost_entries().await.unwrap();
    let flushed = history.len();
    let ledger = Arc::new(CostLedger::from_entries(config.costs.clone(), history));
    let cache = Arc::new(ExtractionCache::new(
        Arc::new(SqliteCacheBackend::new(pool)),
        ledger.clone(),
    ));
    let extractor = Arc::new(FakeExtractor::new());
    let embedder = Arc::new(FakeEmbedder::new());

    let pipeline = Pipeline::new(
        config,
        store.clone(),
        cache,
        ledger.clone(),
        extractor.clone(),
        Some(embedder.clone()),
    )
    .unwrap();

    Run {
        store,
        ledger,
        extractor,
        embedder,
        pipeline: Arc::new(pipeline),
        flushed,
    }
}

async fn close(run: Run) {
    let fresh = run.ledger.entries_since(run.flushed);
    run.store.append_costs(&fresh).await.unwrap();
    run.store.pool().close().await;
}

fn config(tmp: &TempDir) -> Config {
    let mut config = Config::with_db_path(tmp.path().join("mintel.sqlite"));
    config.embedding.min_text_length = 10;
    config.extraction.backoff_base_ms = 1;
    config.embedding.backoff_base_ms = 1;
    config
}

#[tokio::test]
async fn test_cache_and_vectors_survive_restart() {
    let tmp = TempDir::new().unwrap();
    let config = config(&tmp);

    let first = open(&config).await;
    let doc = Document::new("wo-1.txt", "plant-a", RECORD);
    let report = first.pipeline.process_document(doc.clone()).await;
    assert_eq!(report.extraction, Ok(ExtractionSource::Service));
    assert_eq!(report.embeddings.as_ref().unwrap().succeeded(), 4);
    assert_eq!(first.extractor.calls(), 1);
    close(first).await;

    let second = open(&config).await;
    let again = Document::new("wo-1-copy.txt", "plant-a", RECORD);
    let report = second.pipeline.process_document(again.clone()).await;
    assert_eq!(report.extraction, Ok(ExtractionSource::Cache));
    assert_eq!(second.extractor.calls(), 0);

    let stored = second.store.get_document(&doc.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DocumentStatus::Extracted);
    let stored = second.store.get_document(&again.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DocumentStatus::Cached);

    let embedded = second
        .store
        .embedded_events(&EventFilters::default())
        .await
        .unwrap();
    assert_eq!(embedded.len(), 8);
    assert!(second.embedder.calls() >= 1);
    close(second).await;
}

#[tokio::test]
async fn test_ledger_persists_across_runs() {
    let tmp = TempDir::new().unwrap();
    let config = config(&tmp);

    let first = open(&config).await;
    first
        .pipeline
        .process_document(Document::new("a.txt", "plant-a", RECORD))
        .await;
    let spent = first.ledger.total_cost();
    assert!(spent > 0.0);
    close(first).await;

    let second = open(&config).await;
    second
        .pipeline
        .process_document(Document::new("b.txt", "plant-a", RECORD))
        .await;
    let summary = second.ledger.summary();
    assert_eq!(summary.count(OperationKind::ExtractionCall), 1);
    assert_eq!(summary.count(OperationKind::ExtractionCacheHit), 1);
    assert!(second.ledger.total_cost() >= spent);
    close(second).await;

    let third = open(&config).await;
    // One extraction and one embedding call, then a cache hit and one
    // embedding call from the fresh batcher.
    let persisted = third.store.cost_entries().await.unwrap();
    assert_eq!(persisted.len(), 4);
    assert_eq!(third.ledger.len(), 4);
    close(third).await;
}

#[tokio::test]
async fn test_patterns_detected_from_sqlite() {
    let tmp = TempDir::new().unwrap();
    let config = config(&tmp);

    let run = open(&config).await;
    run.pipeline
        .process_document(Document::new("wo-12.txt", "plant-a", RECORD))
        .await;

    let detector = run.pipeline.pattern_detector();
    let first = detector.detect_recent().await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].member_count(), 3);

    let second = detector.detect_recent().await.unwrap();
    assert_eq!(second[0].id, first[0].id);
    assert_eq!(run.store.patterns().await.unwrap().len(), 1);
    close(run).await;
}

#[tokio::test]
async fn test_embed_pending_backfills_stale_vectors() {
    let tmp = TempDir::new().unwrap();
    let mut config = config(&tmp);

    // First run without an embedder leaves every event unembedded.
    {
        let pool = migrate::init_database(&config).await.unwrap();
        let store = Arc::new(SqliteStore::new(pool.clone()));
        let ledger = Arc::new(CostLedger::new(config.costs.clone()));
        let cache = Arc::new(ExtractionCache::new(
            Arc::new(SqliteCacheBackend::new(pool)),
            ledger.clone(),
        ));
        let pipeline = Pipeline::new(
            &config,
            store.clone(),
            cache,
            ledger,
            Arc::new(FakeExtractor::new()),
            None,
        )
        .unwrap();
        let report = pipeline
            .process_document(Document::new("wo-2.txt", "plant-a", RECORD))
            .await;
        assert!(report.is_ok());
        assert!(report.embeddings.is_none());
        assert!(pipeline.embed_pending(None).await.is_err());
        assert_eq!(store.events_missing_embeddings(None).await.unwrap().len(), 4);
        store.pool().close().await;
    }

    config.embedding.batch_size = 3;
    let run = open(&config).await;
    let outcome = run.pipeline.embed_pending(Some(10)).await.unwrap();
    assert_eq!(outcome.submitted(), 4);
    assert_eq!(outcome.succeeded(), 4);
    assert_eq!(run.embedder.calls(), 2);
    assert!(run
        .store
        .events_missing_embeddings(None)
        .await
        .unwrap()
        .is_empty());
    close(run).await;
}
