//! Document processing pipeline.
//!
//! Wires the orchestrator, batcher and index together and runs documents
//! through them:
//!
//! ```text
//! Document ─► ExtractionOrchestrator ─► failure events ─► EmbeddingBatcher ─► SimilarityIndex
//! ```
//!
//! Within one document, extraction finishes (success or failure) before
//! any of its texts are submitted for embedding. Documents are independent
//! and [`Pipeline::process_all`] runs up to `extraction.concurrency` of
//! them at once.

use std::sync::Arc;

use anyhow::{bail, Result};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::batcher::{BatchOutcome, EmbeddingBatcher, VectorSink};
use crate::cache::ExtractionCache;
use crate::config::Config;
use crate::embedding::EmbeddingService;
use crate::error::ExtractionFailure;
use crate::extractor::StructuredExtractor;
use crate::index::{IndexHit, SimilarityIndex};
use crate::ledger::CostLedger;
use crate::models::{Document, DocumentStatus, FailureEvent};
use crate::orchestrator::{ExtractionOrchestrator, ExtractionSource};
use crate::patterns::PatternDetector;
use crate::store::{EventFilters, Store};

/// What happened to one document.
#[derive(Debug)]
pub struct DocumentReport {
    pub document_id: String,
    pub extraction: Result<ExtractionSource, ExtractionFailure>,
    /// `None` when extraction failed, produced no events, or embeddings
    /// are disabled.
    pub embeddings: Option<BatchOutcome>,
}

impl DocumentReport {
    pub fn is_ok(&self) -> bool {
        self.extraction.is_ok()
    }
}

pub struct Pipeline {
    store: Arc<dyn Store>,
    ledger: Arc<CostLedger>,
    index: Arc<SimilarityIndex>,
    orchestrator: ExtractionOrchestrator,
    batcher: Option<EmbeddingBatcher>,
    config: Config,
}

impl Pipeline {
    /// Assemble a pipeline. With `embedder = None` documents are only
    /// extracted.
    pub fn new(
        config: &Config,
        store: Arc<dyn Store>,
        cache: Arc<ExtractionCache>,
        ledger: Arc<CostLedger>,
        extractor: Arc<dyn StructuredExtractor>,
        embedder: Option<Arc<dyn EmbeddingService>>,
    ) -> Result<Self> {
        let index = Arc::new(SimilarityIndex::from_config(store.clone(), &config.index)?);
        let orchestrator = ExtractionOrchestrator::new(
            extractor,
            cache,
            store.clone(),
            ledger.clone(),
            config.extraction.clone(),
        );
        let batcher = embedder.map(|service| {
            let sink: Arc<dyn VectorSink> = index.clone();
            EmbeddingBatcher::new(service, ledger.clone(), Some(sink), config.embedding.clone())
        });

        Ok(Self {
            store,
            ledger,
            index,
            orchestrator,
            batcher,
            config: config.clone(),
        })
    }

    pub fn index(&self) -> Arc<SimilarityIndex> {
        self.index.clone()
    }

    pub fn ledger(&self) -> Arc<CostLedger> {
        self.ledger.clone()
    }

    /// A detector over this pipeline's index and store.
    pub fn pattern_detector(&self) -> PatternDetector {
        PatternDetector::new(
            self.index.clone(),
            self.store.clone(),
            self.config.patterns.clone(),
        )
    }

    /// Store `doc`, extract it, then embed its failure events.
    pub async fn process_document(&self, doc: Document) -> DocumentReport {
        let document_id = doc.id.clone();

        if let Err(e) = self.store.upsert_document(&doc).await {
            return DocumentReport {
                document_id,
                extraction: Err(e.into()),
                embeddings: None,
            };
        }

        let outcome = match self.orchestrator.extract(&doc).await {
            Ok(outcome) => outcome,
            Err(failure) => {
                return DocumentReport {
                    document_id,
                    extraction: Err(failure),
                    embeddings: None,
                };
            }
        };

        let embeddings = self.embed_events(&outcome.events).await;
        DocumentReport {
            document_id,
            extraction: Ok(outcome.source),
            embeddings,
        }
    }

    /// Process `docs` on a bounded worker pool. Reports come back in input
    /// order.
    pub async fn process_all(self: &Arc<Self>, docs: Vec<Document>) -> Vec<DocumentReport> {
        let permits = Arc::new(Semaphore::new(self.config.extraction.concurrency.max(1)));
        let mut tasks = JoinSet::new();
        let total = docs.len();
        let ids: Vec<String> = docs.iter().map(|d| d.id.clone()).collect();

        for (position, doc) in docs.into_iter().enumerate() {
            let pipeline = self.clone();
            let permits = permits.clone();
            let document_id = doc.id.clone();
            tasks.spawn(async move {
                let report = match permits.acquire_owned().await {
                    Ok(_permit) => pipeline.process_document(doc).await,
                    Err(e) => DocumentReport {
                        document_id,
                        extraction: Err(ExtractionFailure::Storage(e.to_string())),
                        embeddings: None,
                    },
                };
                (position, report)
            });
        }

        let mut reports: Vec<Option<DocumentReport>> = (0..total).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((position, report)) => reports[position] = Some(report),
                Err(e) => warn!(error = %e, "document task did not complete"),
            }
        }

        // A task that panicked still gets a report in its slot.
        let reports: Vec<DocumentReport> = reports
            .into_iter()
            .zip(ids)
            .map(|(report, document_id)| {
                report.unwrap_or_else(|| DocumentReport {
                    document_id,
                    extraction: Err(ExtractionFailure::Aborted(
                        "document task did not complete".into(),
                    )),
                    embeddings: None,
                })
            })
            .collect();
        info!(
            documents = total,
            succeeded = reports.iter().filter(|r| r.is_ok()).count(),
            "batch processed"
        );
        reports
    }

    /// Re-run a `failed` document.
    pub async fn retry(&self, document_id: &str) -> Result<DocumentReport> {
        let Some(mut doc) = self.store.get_document(document_id).await? else {
            bail!("Document not found: {}", document_id);
        };
        if doc.status != DocumentStatus::Failed {
            bail!(
                "Document {} is {}, only failed documents can be retried",
                document_id,
                doc.status
            );
        }

        self.store
            .set_document_status(document_id, DocumentStatus::Pending, None)
            .await?;
        doc.status = DocumentStatus::Pending;
        doc.failure_reason = None;

        info!(document_id, "retrying document");
        Ok(self.process_document(doc).await)
    }

    /// Embed stored failure events whose embedding is absent or stale.
    pub async fn embed_pending(&self, limit: Option<usize>) -> Result<BatchOutcome> {
        if self.batcher.is_none() {
            bail!("Embedding provider is disabled. Set [embedding] provider in config.");
        }
        let events = self.store.events_missing_embeddings(limit).await?;
        Ok(self.embed_events(&events).await.unwrap_or_default())
    }

    /// The `k` failure events most similar to `query` among those
    /// matching `filters`.
    pub async fn search(
        &self,
        query: &str,
        k: usize,
        filters: &EventFilters,
    ) -> Result<Vec<IndexHit>> {
        let Some(batcher) = self.batcher.as_ref() else {
            bail!("Embedding provider is disabled. Set [embedding] provider in config.");
        };
        if query.trim().is_empty() {
            bail!("Search query must not be empty");
        }
        let vector = batcher.embed_query(query.trim()).await?;
        self.index.query(&vector, k, filters).await
    }

    async fn embed_events(&self, events: &[FailureEvent]) -> Option<BatchOutcome> {
        let batcher = self.batcher.as_ref()?;
        if events.is_empty() {
            return None;
        }
        let items: Vec<(String, String)> = events
            .iter()
            .map(|e| (e.id.clone(), e.embedding_text()))
            .collect();
        Some(batcher.embed(items).await)
    }
}
