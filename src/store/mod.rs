//! Storage abstraction for the maintenance pipeline.
//!
//! The [`Store`] trait is the persistent-store collaborator: documents and
//! their statuses, extracted records, failure-event vectors, derived
//! patterns and the persisted cost ledger. Two implementations exist:
//! [`memory::InMemoryStore`] for tests and [`sqlite::SqliteStore`] for the
//! CLI.
//!
//! Writers use per-key upserts (document id, event id); the only
//! multi-row write is [`replace_patterns`](Store::replace_patterns),
//! which must be atomic.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::fingerprint::ContentFingerprint;
use crate::ledger::CostLedgerEntry;
use crate::models::{Document, DocumentStatus, FailureEvent, FailurePattern, WorkOrder};

/// Restricts which failure events a vector query or snapshot considers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFilters {
    pub plant_id: Option<String>,
    /// Compared case-insensitively.
    pub equipment_tag: Option<String>,
    /// Inclusive lower bound on `reported_at`.
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `reported_at`.
    pub until: Option<DateTime<Utc>>,
}

impl EventFilters {
    pub fn matches(&self, event: &FailureEvent) -> bool {
        if let Some(plant) = &self.plant_id {
            if &event.plant_id != plant {
                return false;
            }
        }
        if let Some(tag) = &self.equipment_tag {
            if !event.equipment_tag.eq_ignore_ascii_case(tag) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.reported_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.reported_at >= until {
                return false;
            }
        }
        true
    }
}

/// Metadata written alongside a vector.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorMetadata {
    /// Fingerprint of the text the vector was computed from.
    pub text_fingerprint: ContentFingerprint,
    pub model: String,
}

/// Abstract storage backend.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert_document`](Store::upsert_document) | Insert or update a document |
/// | [`set_document_status`](Store::set_document_status) | Record a status transition |
/// | [`save_extraction`](Store::save_extraction) | Replace a document's derived records |
/// | [`upsert_vector`](Store::upsert_vector) | Attach a vector to a failure event |
/// | [`embedded_events`](Store::embedded_events) | Events with current vectors, filtered |
/// | [`replace_patterns`](Store::replace_patterns) | Swap superseded patterns for new ones |
/// | [`append_costs`](Store::append_costs) | Persist ledger entries |
#[async_trait]
pub trait Store: Send + Sync {
    async fn upsert_document(&self, doc: &Document) -> Result<()>;

    async fn get_document(&self, id: &str) -> Result<Option<Document>>;

    async fn documents_with_status(&self, status: DocumentStatus) -> Result<Vec<Document>>;

    async fn set_document_status(
        &self,
        id: &str,
        status: DocumentStatus,
        reason: Option<&str>,
    ) -> Result<()>;

    /// Replace all work orders and failure events owned by `document_id`.
    ///
    /// Stored vectors of events whose text is unchanged are kept.
    async fn save_extraction(
        &self,
        document_id: &str,
        work_orders: &[WorkOrder],
        events: &[FailureEvent],
    ) -> Result<()>;

    async fn work_orders_for_document(&self, document_id: &str) -> Result<Vec<WorkOrder>>;

    async fn get_failure_event(&self, id: &str) -> Result<Option<FailureEvent>>;

    async fn events_for_document(&self, document_id: &str) -> Result<Vec<FailureEvent>>;

    /// Events whose embedding is absent or stale, oldest first.
    async fn events_missing_embeddings(&self, limit: Option<usize>) -> Result<Vec<FailureEvent>>;

    /// Attach `vector` to event `event_id`. Idempotent per id.
    ///
    /// Returns `false` without writing if the event does not exist or its
    /// current text no longer matches `metadata.text_fingerprint`.
    async fn upsert_vector(
        &self,
        event_id: &str,
        vector: &[f32],
        metadata: &VectorMetadata,
    ) -> Result<bool>;

    /// Events carrying a current embedding that match `filters`.
    async fn embedded_events(&self, filters: &EventFilters) -> Result<Vec<FailureEvent>>;

    async fn patterns(&self) -> Result<Vec<FailurePattern>>;

    /// Atomically delete `superseded` pattern ids and upsert `patterns`.
    async fn replace_patterns(
        &self,
        superseded: &[String],
        patterns: &[FailurePattern],
    ) -> Result<()>;

    async fn append_costs(&self, entries: &[CostLedgerEntry]) -> Result<()>;

    async fn cost_entries(&self) -> Result<Vec<CostLedgerEntry>>;
}
