//! Extraction orchestrator: cache first, external service on miss.
//!
//! # Flow
//!
//! ```text
//! document text ─► fingerprint ─► cache lookup ──hit──► persist, status = cached
//!                                      │
//!                                     miss
//!                                      ▼
//!                         throttle tier check (suspended → BudgetExhausted)
//!                                      ▼
//!                    extract_structured (timeout, retry w/ backoff)
//!                                      ▼
//!                 validate ─► ledger ─► cache store ─► persist, status = extracted
//! ```
//!
//! Status is written only once the external call has finished. A call
//! that is cancelled (its future dropped) or times out leaves the document
//! in its pre-call status, so nothing is persisted as succeeded.
//!
//! Two concurrent extractions of the same fingerprint may both miss and
//! both call the service. Both store the same key; the later write wins.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::cache::ExtractionCache;
use crate::config::ExtractionConfig;
use crate::error::{ExtractionFailure, ServiceError};
use crate::extractor::{ExtractorOutput, StructuredExtractor};
use crate::fingerprint::{fingerprint, ContentFingerprint};
use crate::ledger::{CostLedger, ThrottleTier};
use crate::models::{Document, DocumentStatus, FailureEvent, StructuredExtraction};
use crate::store::Store;

/// Where an extraction result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionSource {
    Cache,
    Service,
}

/// A successful extraction and the records persisted from it.
#[derive(Debug, Clone)]
pub struct ExtractionOutcome {
    pub fingerprint: ContentFingerprint,
    pub extraction: StructuredExtraction,
    /// Failure events saved for the document, in extraction order.
    pub events: Vec<FailureEvent>,
    pub source: ExtractionSource,
}

pub struct ExtractionOrchestrator {
    extractor: Arc<dyn StructuredExtractor>,
    cache: Arc<ExtractionCache>,
    store: Arc<dyn Store>,
    ledger: Arc<CostLedger>,
    config: ExtractionConfig,
}

impl ExtractionOrchestrator {
    pub fn new(
        extractor: Arc<dyn StructuredExtractor>,
        cache: Arc<ExtractionCache>,
        store: Arc<dyn Store>,
        ledger: Arc<CostLedger>,
        config: ExtractionConfig,
    ) -> Self {
        Self {
            extractor,
            cache,
            store,
            ledger,
            config,
        }
    }

    pub fn extractor_version(&self) -> &str {
        &self.config.extractor_version
    }

    /// Extract structured records from `doc` and persist them.
    ///
    /// # Errors
    ///
    /// - [`ExtractionFailure::Permanent`] / [`ExtractionFailure::Transient`]:
    ///   the document is marked `failed` with the cause.
    /// - [`ExtractionFailure::BudgetExhausted`]: no call made; the
    ///   document stays `pending`.
    /// - [`ExtractionFailure::Storage`]: status untouched.
    pub async fn extract(&self, doc: &Document) -> Result<ExtractionOutcome, ExtractionFailure> {
        if doc.text.len() > self.config.max_document_bytes {
            let reason = format!(
                "document is {} bytes, limit is {}",
                doc.text.len(),
                self.config.max_document_bytes
            );
            return Err(self.fail(doc, ExtractionFailure::Permanent(reason)).await);
        }

        let fp = fingerprint(&doc.text);
        let version = self.config.extractor_version.as_str();

        if let Some(extraction) = self.cache.lookup(&fp, version).await? {
            debug!(document_id = %doc.id, fingerprint = fp.short(), "extraction served from cache");
            let events = self.persist(doc, &extraction).await?;
            self.transition(doc, DocumentStatus::Cached, None).await?;
            return Ok(ExtractionOutcome {
                fingerprint: fp,
                extraction,
                events,
                source: ExtractionSource::Cache,
            });
        }

        if self.ledger.tier() == ThrottleTier::Suspended {
            let spent_usd = self.ledger.total_cost();
            warn!(document_id = %doc.id, spent_usd, "hard budget reached, extraction deferred");
            return Err(ExtractionFailure::BudgetExhausted { spent_usd });
        }

        let output = match self.call_with_retry(doc).await {
            Ok(output) => output,
            Err(failure) => return Err(self.fail(doc, failure).await),
        };

        // The call completed and is billed whether or not its output is usable.
        self.ledger.record_extraction(output.usage);

        if let Err(reason) = validate(&output.extraction) {
            return Err(self
                .fail(
                    doc,
                    ExtractionFailure::Permanent(format!("invalid extraction: {}", reason)),
                )
                .await);
        }

        self.cache.store(&fp, version, &output.extraction).await?;
        let events = self.persist(doc, &output.extraction).await?;
        self.transition(doc, DocumentStatus::Extracted, None).await?;

        info!(
            document_id = %doc.id,
            fingerprint = fp.short(),
            work_orders = output.extraction.work_orders.len(),
            failure_events = events.len(),
            input_tokens = output.usage.input_tokens,
            output_tokens = output.usage.output_tokens,
            "document extracted"
        );

        Ok(ExtractionOutcome {
            fingerprint: fp,
            extraction: output.extraction,
            events,
            source: ExtractionSource::Service,
        })
    }

    async fn call_with_retry(&self, doc: &Document) -> Result<ExtractorOutput, ExtractionFailure> {
        let max_attempts = self.config.max_retries + 1;
        let timeout = Duration::from_secs(self.config.timeout_secs);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let result = match tokio::time::timeout(
                timeout,
                self.extractor.extract_structured(&doc.text),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ServiceError::transient(format!(
                    "extraction timed out after {}s",
                    timeout.as_secs()
                ))),
            };

            match result {
                Ok(output) => return Ok(output),
                Err(ServiceError::Permanent(msg)) => {
                    return Err(ExtractionFailure::Permanent(msg));
                }
                Err(ServiceError::InvalidOutput { message, usage }) => {
                    self.ledger.record_extraction(usage);
                    return Err(ExtractionFailure::Permanent(format!(
                        "invalid extraction: {}",
                        message
                    )));
                }
                Err(err) if attempt >= max_attempts => {
                    return Err(ExtractionFailure::Transient {
                        attempts: attempt,
                        cause: err,
                    });
                }
                Err(err) => {
                    let delay = err.backoff_delay(self.config.backoff_base_ms, attempt);
                    warn!(
                        document_id = %doc.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient extraction error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn persist(
        &self,
        doc: &Document,
        extraction: &StructuredExtraction,
    ) -> anyhow::Result<Vec<FailureEvent>> {
        let events: Vec<FailureEvent> = extraction
            .failure_events
            .iter()
            .enumerate()
            .map(|(i, f)| FailureEvent::from_extracted(doc, i, f))
            .collect();
        self.store
            .save_extraction(&doc.id, &extraction.work_orders, &events)
            .await?;
        Ok(events)
    }

    async fn transition(
        &self,
        doc: &Document,
        next: DocumentStatus,
        reason: Option<&str>,
    ) -> anyhow::Result<()> {
        if !doc.status.can_transition_to(next) {
            debug!(
                document_id = %doc.id,
                from = %doc.status,
                to = %next,
                "status transition skipped"
            );
            return Ok(());
        }
        self.store.set_document_status(&doc.id, next, reason).await
    }

    /// Mark `doc` failed with `failure` as its reason and hand the failure back.
    async fn fail(&self, doc: &Document, failure: ExtractionFailure) -> ExtractionFailure {
        let reason = failure.to_string();
        warn!(document_id = %doc.id, error = %reason, "extraction failed");
        match self
            .transition(doc, DocumentStatus::Failed, Some(&reason))
            .await
        {
            Ok(()) => failure,
            Err(e) => ExtractionFailure::Storage(format!(
                "{} (and could not mark document failed: {:#})",
                reason, e
            )),
        }
    }
}

/// Schema checks beyond what deserialization enforces.
fn validate(extraction: &StructuredExtraction) -> Result<(), String> {
    for equipment in &extraction.equipment {
        if equipment.tag.trim().is_empty() {
            return Err("equipment reference with empty tag".into());
        }
    }
    for (i, wo) in extraction.work_orders.iter().enumerate() {
        if wo.description.trim().is_empty() {
            return Err(format!("work order {} has no description", i));
        }
        if let Some(tag) = &wo.equipment_tag {
            if !extraction.resolves_equipment(tag) {
                return Err(format!("work order {} references unknown equipment '{}'", i, tag));
            }
        }
    }
    for (i, failure) in extraction.failure_events.iter().enumerate() {
        if failure.description.trim().is_empty() {
            return Err(format!("failure event {} has no description", i));
        }
        if failure.equipment_tag.trim().is_empty() {
            return Err(format!("failure event {} has no equipment tag", i));
        }
        if !extraction.resolves_equipment(&failure.equipment_tag) {
            return Err(format!(
                "failure event {} references unknown equipment '{}'",
                i, failure.equipment_tag
            ));
        }
    }
    Ok(())
}
