//! Similarity index over failure-event vectors.
//!
//! A thin contract over the [`Store`]: vectors live on their failure-event
//! rows, candidates are narrowed by [`EventFilters`] on the store side and
//! scored in Rust with the configured [`Metric`].
//!
//! # Ordering
//!
//! Results are sorted deterministically:
//! 1. score descending
//! 2. `reported_at` descending (more recent occurrence wins ties)
//! 3. event id ascending
//!
//! Queries read whatever the store holds at call time. A concurrent
//! upsert may or may not be visible, but never yields a torn row.

use std::cmp::Ordering;
use std::sync::Arc;

use anyhow::Result;
use tracing::debug;

use crate::config::IndexConfig;
use crate::embedding::Metric;
use crate::models::FailureEvent;
use crate::store::{EventFilters, Store, VectorMetadata};

/// One query result.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexHit {
    pub event: FailureEvent,
    pub score: f32,
}

pub struct SimilarityIndex {
    store: Arc<dyn Store>,
    metric: Metric,
    min_score: Option<f32>,
}

impl SimilarityIndex {
    pub fn new(store: Arc<dyn Store>, metric: Metric) -> Self {
        Self {
            store,
            metric,
            min_score: None,
        }
    }

    pub fn from_config(store: Arc<dyn Store>, config: &IndexConfig) -> Result<Self> {
        Ok(Self::new(store, config.metric.parse()?).with_min_score(config.min_score))
    }

    /// Drop query hits scoring below `min_score`.
    pub fn with_min_score(mut self, min_score: Option<f32>) -> Self {
        self.min_score = min_score;
        self
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn score(&self, a: &[f32], b: &[f32]) -> f32 {
        self.metric.score(a, b)
    }

    /// Attach `vector` to event `id`. Idempotent per id; returns `false`
    /// when the event is gone or its text changed since `metadata` was
    /// computed.
    pub async fn upsert(&self, id: &str, vector: &[f32], metadata: &VectorMetadata) -> Result<bool> {
        let stored = self.store.upsert_vector(id, vector, metadata).await?;
        if !stored {
            debug!(event_id = id, "vector not stored: event missing or text changed");
        }
        Ok(stored)
    }

    /// The `k` events nearest to `vector` among those matching `filters`.
    pub async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filters: &EventFilters,
    ) -> Result<Vec<IndexHit>> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let candidates = self.store.embedded_events(filters).await?;
        let candidate_count = candidates.len();

        let mut hits: Vec<IndexHit> = candidates
            .into_iter()
            .filter_map(|event| {
                let score = self.metric.score(vector, event.embedding()?);
                Some(IndexHit { event, score })
            })
            .filter(|hit| self.min_score.map_or(true, |min| hit.score >= min))
            .collect();

        hits.sort_by(compare_hits);
        hits.truncate(k);

        debug!(
            candidates = candidate_count,
            returned = hits.len(),
            metric = %self.metric,
            "similarity query"
        );
        Ok(hits)
    }

    /// All embedded events matching `filters`, sorted by id.
    ///
    /// The pattern detector clusters over this snapshot so concurrent
    /// upserts cannot change the event set mid-run.
    pub async fn snapshot(&self, filters: &EventFilters) -> Result<Vec<FailureEvent>> {
        let mut events = self.store.embedded_events(filters).await?;
        events.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(events)
    }
}

fn compare_hits(a: &IndexHit, b: &IndexHit) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then(b.event.reported_at.cmp(&a.event.reported_at))
        .then(a.event.id.cmp(&b.event.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Document;
    use crate::store::memory::InMemoryStore;
    use chrono::{Duration, Utc};

    async fn seed(store: &InMemoryStore, doc: &Document, items: &[(&str, &str, Vec<f32>, i64)]) {
        let now = Utc::now();
        let events: Vec<FailureEvent> = items
            .iter()
            .map(|(id, tag, _, age_days)| {
                FailureEvent::new(
                    *id,
                    doc.id.clone(),
                    doc.plant_id.clone(),
                    *tag,
                    format!("failure {}", id),
                    now - Duration::days(*age_days),
                )
            })
            .collect();
        store.save_extraction(&doc.id, &[], &events).await.unwrap();
        for (event, (_, _, vector, _)) in events.iter().zip(items) {
            let meta = VectorMetadata {
                text_fingerprint: event.text_fingerprint(),
                model: "test".into(),
            };
            assert!(store.upsert_vector(&event.id, vector, &meta).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_query_nearest_first() {
        let store = Arc::new(InMemoryStore::new());
        let doc = Document::new("a.txt", "plant-a", "text");
        seed(
            &store,
            &doc,
            &[
                ("far", "P-1", vec![0.0, 1.0], 1),
                ("near", "P-1", vec![1.0, 0.1], 1),
                ("mid", "P-2", vec![0.7, 0.7], 1),
            ],
        )
        .await;

        let index = SimilarityIndex::new(store, Metric::Cosine);
        let hits = index
            .query(&[1.0, 0.0], 2, &EventFilters::default())
            .await
            .unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.event.id.as_str()).collect();
        assert_eq!(ids, vec!["near", "mid"]);
        assert!(hits[0].score >= hits[1].score);
    }

    #[tokio::test]
    async fn test_ties_prefer_recent_then_id() {
        let store = Arc::new(InMemoryStore::new());
        let doc = Document::new("a.txt", "plant-a", "text");
        seed(
            &store,
            &doc,
            &[
                ("b-old", "P-1", vec![1.0, 0.0], 10),
                ("a-new", "P-1", vec![1.0, 0.0], 1),
                ("c-new", "P-1", vec![1.0, 0.0], 1),
            ],
        )
        .await;

        let index = SimilarityIndex::new(store, Metric::Cosine);
        let hits = index
            .query(&[1.0, 0.0], 10, &EventFilters::default())
            .await
            .unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.event.id.as_str()).collect();
        assert_eq!(ids[2], "b-old");
        assert!(ids[..2].contains(&"a-new") && ids[..2].contains(&"c-new"));
    }

    #[tokio::test]
    async fn test_filters_and_min_score() {
        let store = Arc::new(InMemoryStore::new());
        let doc = Document::new("a.txt", "plant-a", "text");
        seed(
            &store,
            &doc,
            &[
                ("x", "P-1", vec![1.0, 0.0], 1),
                ("y", "P-2", vec![0.0, 1.0], 1),
            ],
        )
        .await;

        let index = SimilarityIndex::new(store, Metric::Cosine).with_min_score(Some(0.5));
        let all = index
            .query(&[1.0, 0.0], 10, &EventFilters::default())
            .await
            .unwrap();
        assert_eq!(all.len(), 1);

        let p2 = EventFilters {
            equipment_tag: Some("P-2".into()),
            ..Default::default()
        };
        assert!(index.query(&[1.0, 0.0], 10, &p2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upsert_idempotent() {
        let store = Arc::new(InMemoryStore::new());
        let doc = Document::new("a.txt", "plant-a", "text");
        let event = FailureEvent::new("e1", doc.id.clone(), "plant-a", "P-1", "seal leak", Utc::now());
        store.save_extraction(&doc.id, &[], &[event.clone()]).await.unwrap();

        let index = SimilarityIndex::new(store, Metric::Dot);
        let meta = VectorMetadata {
            text_fingerprint: event.text_fingerprint(),
            model: "test".into(),
        };
        assert!(index.upsert("e1", &[1.0, 2.0], &meta).await.unwrap());
        assert!(index.upsert("e1", &[1.0, 2.0], &meta).await.unwrap());
        assert!(!index.upsert("missing", &[1.0, 2.0], &meta).await.unwrap());
        assert_eq!(index.snapshot(&EventFilters::default()).await.unwrap().len(), 1);
    }
}
