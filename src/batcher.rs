//! Embedding batcher: filter, dedup, batch and dispatch.
//!
//! # Pipeline
//!
//! ```text
//! submit(items)
//!   ├─ text shorter than min_text_length ─► Filtered (no call)
//!   ├─ fingerprint seen in the recent window ─► reused vector (no call)
//!   ├─ same fingerprint twice in one submission ─► embedded once, fanned out
//!   └─ remaining unique texts ─► batches of ≤ batch_size
//!                                   │  one semaphore permit per batch
//!                                   ▼
//!                         spawned dispatch task
//!                           call (timeout, wholesale retry)
//!                           └─ still failing ─► per-item calls
//!                           vectors ─► VectorSink (owning failure event)
//! ```
//!
//! `submit` waits for a permit before spawning each batch, so a caller
//! that outruns the service blocks instead of piling up requests. At most
//! `max_in_flight` batches run at once; in the `Conserve` throttle tier
//! each batch takes every permit and batches run one at a time.
//!
//! Every submitted item ends up in exactly one of `Embedded`, `Failed`
//! or `Filtered`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::EmbeddingConfig;
use crate::embedding::{EmbedResponse, EmbeddingService};
use crate::error::{EmbedFailure, ServiceError};
use crate::fingerprint::{fingerprint, ContentFingerprint};
use crate::index::SimilarityIndex;
use crate::ledger::{CostLedger, ThrottleTier};
use crate::store::VectorMetadata;

/// Destination for computed vectors.
#[async_trait]
pub trait VectorSink: Send + Sync {
    /// Returns `false` when the owner no longer accepts this vector.
    async fn write(
        &self,
        owner_id: &str,
        vector: &[f32],
        text_fingerprint: &ContentFingerprint,
        model: &str,
    ) -> Result<bool>;
}

#[async_trait]
impl VectorSink for SimilarityIndex {
    async fn write(
        &self,
        owner_id: &str,
        vector: &[f32],
        text_fingerprint: &ContentFingerprint,
        model: &str,
    ) -> Result<bool> {
        let metadata = VectorMetadata {
            text_fingerprint: text_fingerprint.clone(),
            model: model.to_string(),
        };
        self.upsert(owner_id, vector, &metadata).await
    }
}

/// Final state of one submitted item.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    Embedded(Vec<f32>),
    /// Skipped as low-signal. Not an error.
    Filtered,
    Failed(EmbedFailure),
}

impl ItemOutcome {
    pub fn vector(&self) -> Option<&[f32]> {
        match self {
            ItemOutcome::Embedded(v) => Some(v),
            _ => None,
        }
    }
}

/// Per-item results of a job, in submission order.
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    pub items: Vec<(String, ItemOutcome)>,
}

impl BatchOutcome {
    pub fn submitted(&self) -> usize {
        self.items.len()
    }

    pub fn succeeded(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Embedded(_)))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Failed(_)))
    }

    pub fn filtered(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Filtered))
    }

    /// Some items succeeded while others failed.
    pub fn is_partial(&self) -> bool {
        self.succeeded() > 0 && self.failed() > 0
    }

    /// Outcomes keyed by entity id. When an id was submitted more than
    /// once the last outcome wins.
    pub fn by_id(&self) -> HashMap<&str, &ItemOutcome> {
        self.items
            .iter()
            .map(|(id, outcome)| (id.as_str(), outcome))
            .collect()
    }

    fn count(&self, pred: impl Fn(&ItemOutcome) -> bool) -> usize {
        self.items.iter().filter(|(_, o)| pred(o)).count()
    }
}

enum Slot {
    Done(ItemOutcome),
    /// Waiting on unique text `position` of dispatched batch `batch`.
    Dispatched { batch: usize, position: usize },
}

type BatchResult = Vec<Result<Vec<f32>, EmbedFailure>>;

/// Handle to a submitted set of items. Pass to [`EmbeddingBatcher::wait`].
pub struct EmbeddingBatchJob {
    ids: Vec<String>,
    slots: Vec<Slot>,
    batches: Vec<JoinHandle<BatchResult>>,
}

impl EmbeddingBatchJob {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Number of batches sent to the embedding service.
    pub fn dispatched_batches(&self) -> usize {
        self.batches.len()
    }
}

/// A text to embed together with the entities it belongs to.
struct UniqueText {
    fingerprint: ContentFingerprint,
    text: String,
    owners: Vec<String>,
}

struct RecentEntry {
    vector: Vec<f32>,
    at: Instant,
}

/// Fingerprint → vector for texts embedded within the recent window.
struct RecentCache {
    entries: DashMap<ContentFingerprint, RecentEntry>,
    window: Duration,
    capacity: usize,
}

impl RecentCache {
    fn get(&self, fp: &ContentFingerprint) -> Option<Vec<f32>> {
        let fresh = self
            .entries
            .get(fp)
            .filter(|e| e.at.elapsed() <= self.window)
            .map(|e| e.vector.clone());
        if fresh.is_none() {
            self.entries.remove(fp);
        }
        fresh
    }

    fn insert(&self, fp: ContentFingerprint, vector: Vec<f32>) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() >= self.capacity {
            self.entries.retain(|_, e| e.at.elapsed() <= self.window);
        }
        if self.entries.len() >= self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|e| e.at)
                .map(|e| e.key().clone());
            if let Some(key) = oldest {
                self.entries.remove(&key);
            }
        }
        self.entries.insert(
            fp,
            RecentEntry {
                vector,
                at: Instant::now(),
            },
        );
    }
}

struct Inner {
    service: Arc<dyn EmbeddingService>,
    ledger: Arc<CostLedger>,
    sink: Option<Arc<dyn VectorSink>>,
    recent: RecentCache,
    config: EmbeddingConfig,
}

pub struct EmbeddingBatcher {
    inner: Arc<Inner>,
    permits: Arc<Semaphore>,
}

impl EmbeddingBatcher {
    /// With a `sink`, every computed vector is written to its owners
    /// before the item counts as embedded.
    pub fn new(
        service: Arc<dyn EmbeddingService>,
        ledger: Arc<CostLedger>,
        sink: Option<Arc<dyn VectorSink>>,
        config: EmbeddingConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_in_flight.max(1)));
        let recent = RecentCache {
            entries: DashMap::new(),
            window: Duration::from_secs(config.recent_window_secs),
            capacity: config.recent_capacity,
        };
        Self {
            inner: Arc::new(Inner {
                service,
                ledger,
                sink,
                recent,
                config,
            }),
            permits,
        }
    }

    /// Submit `(entity id, text)` pairs for embedding.
    ///
    /// Returns once every batch has been dispatched. Blocks while
    /// `max_in_flight` batches are already running.
    pub async fn submit(&self, items: Vec<(String, String)>) -> EmbeddingBatchJob {
        let config = &self.inner.config;
        let mut ids = Vec::with_capacity(items.len());
        let mut slots: Vec<Option<Slot>> = Vec::with_capacity(items.len());
        let mut unique: Vec<UniqueText> = Vec::new();
        let mut unique_slots: Vec<Vec<usize>> = Vec::new();
        let mut by_fingerprint: HashMap<ContentFingerprint, usize> = HashMap::new();
        let mut reused = 0u64;

        for (i, (id, text)) in items.into_iter().enumerate() {
            if text.trim().chars().count() < config.min_text_length {
                ids.push(id);
                slots.push(Some(Slot::Done(ItemOutcome::Filtered)));
                continue;
            }

            let fp = fingerprint(&text);
            if let Some(vector) = self.inner.recent.get(&fp) {
                reused += 1;
                let outcome = self.inner.write_owner(&id, &vector, &fp).await;
                ids.push(id);
                slots.push(Some(Slot::Done(outcome)));
                continue;
            }

            match by_fingerprint.get(&fp) {
                Some(&u) => {
                    reused += 1;
                    unique[u].owners.push(id.clone());
                    unique_slots[u].push(i);
                }
                None => {
                    by_fingerprint.insert(fp.clone(), unique.len());
                    unique.push(UniqueText {
                        fingerprint: fp,
                        text,
                        owners: vec![id.clone()],
                    });
                    unique_slots.push(vec![i]);
                }
            }
            ids.push(id);
            slots.push(None);
        }

        if reused > 0 {
            self.inner.ledger.record_embedding_reuse(reused);
        }

        let batch_size = config.batch_size.max(1);
        let mut batches = Vec::new();
        let mut unique_iter = unique.into_iter().zip(unique_slots).peekable();

        while unique_iter.peek().is_some() {
            let chunk: Vec<(UniqueText, Vec<usize>)> =
                unique_iter.by_ref().take(batch_size).collect();
            let (texts, owner_slots): (Vec<UniqueText>, Vec<Vec<usize>>) = chunk.into_iter().unzip();

            let tier = self.inner.ledger.tier();
            if tier == ThrottleTier::Suspended {
                warn!(items = texts.len(), "hard budget reached, embedding batch not dispatched");
                for owners in owner_slots {
                    for slot in owners {
                        slots[slot] = Some(Slot::Done(ItemOutcome::Failed(EmbedFailure::BudgetExhausted)));
                    }
                }
                continue;
            }

            let wanted = if tier == ThrottleTier::Conserve {
                config.max_in_flight.max(1) as u32
            } else {
                1
            };
            let permit = match self.permits.clone().acquire_many_owned(wanted).await {
                Ok(permit) => permit,
                Err(e) => {
                    for owners in owner_slots {
                        for slot in owners {
                            slots[slot] = Some(Slot::Done(ItemOutcome::Failed(
                                EmbedFailure::Aborted(e.to_string()),
                            )));
                        }
                    }
                    continue;
                }
            };

            let batch = batches.len();
            for (position, owners) in owner_slots.into_iter().enumerate() {
                for slot in owners {
                    slots[slot] = Some(Slot::Dispatched { batch, position });
                }
            }

            debug!(batch, batch_size = texts.len(), ?tier, "dispatching embedding batch");
            let inner = self.inner.clone();
            batches.push(tokio::spawn(async move {
                let _permit = permit;
                inner.dispatch(texts).await
            }));
        }

        EmbeddingBatchJob {
            ids,
            slots: slots
                .into_iter()
                .map(|s| {
                    s.unwrap_or(Slot::Done(ItemOutcome::Failed(EmbedFailure::Aborted(
                        "not dispatched".into(),
                    ))))
                })
                .collect(),
            batches,
        }
    }

    /// Wait for every batch of `job` and collect per-item outcomes.
    pub async fn wait(&self, job: EmbeddingBatchJob) -> BatchOutcome {
        let mut results: Vec<BatchResult> = Vec::with_capacity(job.batches.len());
        for handle in job.batches {
            match handle.await {
                Ok(result) => results.push(result),
                Err(e) => {
                    warn!(error = %e, "embedding batch task did not complete");
                    results.push(Vec::new());
                }
            }
        }

        let items: Vec<(String, ItemOutcome)> = job
            .ids
            .into_iter()
            .zip(job.slots)
            .map(|(id, slot)| {
                let outcome = match slot {
                    Slot::Done(outcome) => outcome,
                    Slot::Dispatched { batch, position } => {
                        match results.get(batch).and_then(|r| r.get(position)) {
                            Some(Ok(vector)) => ItemOutcome::Embedded(vector.clone()),
                            Some(Err(failure)) => ItemOutcome::Failed(failure.clone()),
                            None => ItemOutcome::Failed(EmbedFailure::Aborted(
                                "batch task did not complete".into(),
                            )),
                        }
                    }
                };
                (id, outcome)
            })
            .collect();

        let outcome = BatchOutcome { items };
        info!(
            submitted = outcome.submitted(),
            succeeded = outcome.succeeded(),
            failed = outcome.failed(),
            filtered = outcome.filtered(),
            "embedding job finished"
        );
        outcome
    }

    /// [`submit`](Self::submit) then [`wait`](Self::wait).
    pub async fn embed(&self, items: Vec<(String, String)>) -> BatchOutcome {
        let job = self.submit(items).await;
        self.wait(job).await
    }

    /// Embed a search query. Not subject to the minimum length and not
    /// written to the sink.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbedFailure> {
        let fp = fingerprint(text);
        if let Some(vector) = self.inner.recent.get(&fp) {
            self.inner.ledger.record_embedding_reuse(1);
            return Ok(vector);
        }

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| EmbedFailure::Aborted(e.to_string()))?;
        let inputs = vec![text.to_string()];
        let response = self.inner.call_with_retry(&inputs).await?;
        let vector = self
            .inner
            .attribute(response, 1)
            .pop()
            .unwrap_or_else(|| Err(EmbedFailure::Rejected("empty response".into())))?;
        self.inner.recent.insert(fp, vector.clone());
        Ok(vector)
    }
}

impl Inner {
    async fn dispatch(&self, texts: Vec<UniqueText>) -> BatchResult {
        let inputs: Vec<String> = texts.iter().map(|t| t.text.clone()).collect();

        let mut results = match self.call_with_retry(&inputs).await {
            Ok(response) => self.attribute(response, inputs.len()),
            Err(EmbedFailure::BudgetExhausted) => inputs
                .iter()
                .map(|_| Err(EmbedFailure::BudgetExhausted))
                .collect(),
            Err(failure) if inputs.len() > 1 => {
                warn!(
                    batch_size = inputs.len(),
                    error = %failure,
                    "embedding batch failed, retrying items individually"
                );
                let mut per_item = Vec::with_capacity(inputs.len());
                for input in &inputs {
                    per_item.push(match self.call_with_retry(std::slice::from_ref(input)).await {
                        Ok(response) => self
                            .attribute(response, 1)
                            .pop()
                            .unwrap_or_else(|| Err(EmbedFailure::Rejected("empty response".into()))),
                        Err(failure) => Err(failure),
                    });
                }
                per_item
            }
            Err(failure) => vec![Err(failure)],
        };

        for (text, result) in texts.iter().zip(results.iter_mut()) {
            let mut write_failure = None;
            if let Ok(vector) = &*result {
                self.recent.insert(text.fingerprint.clone(), vector.clone());
                for owner in &text.owners {
                    if let ItemOutcome::Failed(failure) =
                        self.write_owner(owner, vector, &text.fingerprint).await
                    {
                        write_failure = Some(failure);
                        break;
                    }
                }
            }
            if let Some(failure) = write_failure {
                *result = Err(failure);
            }
        }
        results
    }

    /// Call the service with the per-call timeout, retrying transient
    /// failures with backoff. Records ledger spend for each completed call.
    async fn call_with_retry(&self, inputs: &[String]) -> Result<EmbedResponse, EmbedFailure> {
        let max_attempts = self.config.max_retries + 1;
        let timeout = Duration::from_secs(self.config.timeout_secs);
        let mut attempt = 0;

        loop {
            if self.ledger.tier() == ThrottleTier::Suspended {
                return Err(EmbedFailure::BudgetExhausted);
            }
            attempt += 1;

            let result = match tokio::time::timeout(timeout, self.service.embed(inputs)).await {
                Ok(result) => result,
                Err(_) => Err(ServiceError::transient(format!(
                    "embedding timed out after {}s",
                    timeout.as_secs()
                ))),
            };

            match result {
                Ok(response) => {
                    let tokens = response.tokens.unwrap_or_else(|| estimate_tokens(inputs));
                    self.ledger.record_embedding(tokens);
                    return Ok(response);
                }
                Err(ServiceError::Permanent(msg)) => return Err(EmbedFailure::Rejected(msg)),
                Err(ServiceError::InvalidOutput { message, .. }) => {
                    return Err(EmbedFailure::Rejected(message));
                }
                Err(err) if attempt >= max_attempts => {
                    return Err(EmbedFailure::Exhausted {
                        attempts: attempt,
                        cause: err,
                    });
                }
                Err(err) => {
                    let delay = err.backoff_delay(self.config.backoff_base_ms, attempt);
                    debug!(
                        attempt,
                        batch_size = inputs.len(),
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient embedding error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Turn a service response into per-item results.
    fn attribute(&self, response: EmbedResponse, expected: usize) -> BatchResult {
        let dims = self.service.dims();
        let mut vectors = response.vectors.into_iter();
        (0..expected)
            .map(|_| match vectors.next() {
                Some(Ok(v)) if dims > 0 && v.len() != dims => Err(EmbedFailure::Rejected(format!(
                    "expected {} dimensions, got {}",
                    dims,
                    v.len()
                ))),
                Some(Ok(v)) => Ok(v),
                Some(Err(msg)) => Err(EmbedFailure::Rejected(msg)),
                None => Err(EmbedFailure::Rejected("missing from response".into())),
            })
            .collect()
    }

    async fn write_owner(&self, owner: &str, vector: &[f32], fp: &ContentFingerprint) -> ItemOutcome {
        let Some(sink) = &self.sink else {
            return ItemOutcome::Embedded(vector.to_vec());
        };
        match sink
            .write(owner, vector, fp, self.service.model_name())
            .await
        {
            Ok(_) => ItemOutcome::Embedded(vector.to_vec()),
            Err(e) => {
                warn!(owner, error = %e, "failed to store embedding");
                ItemOutcome::Failed(EmbedFailure::Storage(format!("{:#}", e)))
            }
        }
    }
}

/// Rough token count for services that do not report usage.
fn estimate_tokens(inputs: &[String]) -> u64 {
    inputs
        .iter()
        .map(|t| (t.chars().count() as u64).div_ceil(4))
        .sum()
}
