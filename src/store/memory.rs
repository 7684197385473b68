//! In-memory [`Store`] implementation for tests.
//!
//! Documents, work orders and events live in `DashMap`s so unrelated keys
//! never contend. Patterns sit behind one async `RwLock` because
//! supersession replaces several rows at once.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock};

use crate::ledger::CostLedgerEntry;
use crate::models::{Document, DocumentStatus, FailureEvent, FailurePattern, WorkOrder};

use super::{EventFilters, Store, VectorMetadata};

#[derive(Default)]
pub struct InMemoryStore {
    documents: DashMap<String, Document>,
    work_orders: DashMap<String, Vec<WorkOrder>>,
    events: DashMap<String, FailureEvent>,
    patterns: RwLock<HashMap<String, FailurePattern>>,
    costs: Mutex<Vec<CostLedgerEntry>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn upsert_document(&self, doc: &Document) -> Result<()> {
        self.documents.insert(doc.id.clone(), doc.clone());
        Ok(())
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        Ok(self.documents.get(id).map(|d| d.value().clone()))
    }

    async fn documents_with_status(&self, status: DocumentStatus) -> Result<Vec<Document>> {
        let mut docs: Vec<Document> = self
            .documents
            .iter()
            .filter(|d| d.status == status)
            .map(|d| d.value().clone())
            .collect();
        docs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(docs)
    }

    async fn set_document_status(
        &self,
        id: &str,
        status: DocumentStatus,
        reason: Option<&str>,
    ) -> Result<()> {
        let mut doc = self
            .documents
            .get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("Document not found: {}", id))?;
        doc.status = status;
        doc.failure_reason = reason.map(str::to_string);
        doc.updated_at = Utc::now();
        Ok(())
    }

    async fn save_extraction(
        &self,
        document_id: &str,
        work_orders: &[WorkOrder],
        events: &[FailureEvent],
    ) -> Result<()> {
        self.work_orders
            .insert(document_id.to_string(), work_orders.to_vec());

        let keep: Vec<&str> = events.iter().map(|e| e.id.as_str()).collect();
        self.events
            .retain(|id, e| e.document_id != document_id || keep.contains(&id.as_str()));

        for event in events {
            let mut incoming = event.clone();
            if incoming.embedding().is_none() {
                if let Some(existing) = self.events.get(&event.id) {
                    if let (Some(v), Some(fp)) =
                        (existing.embedding(), existing.embedding_fingerprint())
                    {
                        incoming.attach_embedding(v.to_vec(), fp.clone());
                    }
                }
            }
            self.events.insert(incoming.id.clone(), incoming);
        }
        Ok(())
    }

    async fn work_orders_for_document(&self, document_id: &str) -> Result<Vec<WorkOrder>> {
        Ok(self
            .work_orders
            .get(document_id)
            .map(|w| w.value().clone())
            .unwrap_or_default())
    }

    async fn get_failure_event(&self, id: &str) -> Result<Option<FailureEvent>> {
        Ok(self.events.get(id).map(|e| e.value().clone()))
    }

    async fn events_for_document(&self, document_id: &str) -> Result<Vec<FailureEvent>> {
        let mut events: Vec<FailureEvent> = self
            .events
            .iter()
            .filter(|e| e.document_id == document_id)
            .map(|e| e.value().clone())
            .collect();
        events.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(events)
    }

    async fn events_missing_embeddings(&self, limit: Option<usize>) -> Result<Vec<FailureEvent>> {
        let mut events: Vec<FailureEvent> = self
            .events
            .iter()
            .filter(|e| e.embedding().is_none())
            .map(|e| e.value().clone())
            .collect();
        events.sort_by(|a, b| a.reported_at.cmp(&b.reported_at).then_with(|| a.id.cmp(&b.id)));
        if let Some(limit) = limit {
            events.truncate(limit);
        }
        Ok(events)
    }

    async fn upsert_vector(
        &self,
        event_id: &str,
        vector: &[f32],
        metadata: &VectorMetadata,
    ) -> Result<bool> {
        match self.events.get_mut(event_id) {
            Some(mut event) => {
                Ok(event.attach_embedding(vector.to_vec(), metadata.text_fingerprint.clone()))
            }
            None => Ok(false),
        }
    }

    async fn embedded_events(&self, filters: &EventFilters) -> Result<Vec<FailureEvent>> {
        Ok(self
            .events
            .iter()
            .filter(|e| e.embedding().is_some() && filters.matches(e.value()))
            .map(|e| e.value().clone())
            .collect())
    }

    async fn patterns(&self) -> Result<Vec<FailurePattern>> {
        let mut patterns: Vec<FailurePattern> =
            self.patterns.read().await.values().cloned().collect();
        patterns.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(patterns)
    }

    async fn replace_patterns(
        &self,
        superseded: &[String],
        patterns: &[FailurePattern],
    ) -> Result<()> {
        let mut guard = self.patterns.write().await;
        for id in superseded {
            guard.remove(id);
        }
        for p in patterns {
            guard.insert(p.id.clone(), p.clone());
        }
        Ok(())
    }

    async fn append_costs(&self, entries: &[CostLedgerEntry]) -> Result<()> {
        self.costs.lock().await.extend_from_slice(entries);
        Ok(())
    }

    async fn cost_entries(&self) -> Result<Vec<CostLedgerEntry>> {
        Ok(self.costs.lock().await.clone())
    }
}
