//! SQLite-backed [`Store`] implementation.
//!
//! Vectors are little-endian f32 BLOBs on the `failure_events` row they
//! annotate. Each row also carries `text_fingerprint`, the fingerprint of
//! its current embedding text, so a vector is "current" exactly when
//! `embedding_fingerprint = text_fingerprint`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::ledger::{CostLedgerEntry, OperationKind};
use crate::models::{Document, DocumentStatus, FailureEvent, FailurePattern, WorkOrder};

use super::{EventFilters, Store, VectorMetadata};

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn ts(dt: DateTime<Utc>) -> i64 {
    dt.timestamp()
}

fn from_ts(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

fn row_to_document(row: &SqliteRow) -> Result<Document> {
    let status: String = row.get("status");
    Ok(Document {
        id: row.get("id"),
        source_id: row.get("source_id"),
        plant_id: row.get("plant_id"),
        text: row.get("text"),
        status: status.parse()?,
        failure_reason: row.get("failure_reason"),
        created_at: from_ts(row.get("created_at")),
        updated_at: from_ts(row.get("updated_at")),
    })
}

fn row_to_event(row: &SqliteRow) -> Result<FailureEvent> {
    let mut event = FailureEvent::new(
        row.get::<String, _>("id"),
        row.get::<String, _>("document_id"),
        row.get::<String, _>("plant_id"),
        row.get::<String, _>("equipment_tag"),
        row.get::<String, _>("description"),
        from_ts(row.get("reported_at")),
    );
    event.set_root_cause(row.get("root_cause"));
    event.set_repair_action(row.get("repair_action"));

    let blob: Option<Vec<u8>> = row.get("embedding");
    let fp: Option<String> = row.get("embedding_fingerprint");
    if let (Some(blob), Some(fp)) = (blob, fp) {
        event.restore_embedding(blob_to_vec(&blob), fp.parse()?);
    }
    Ok(event)
}

fn row_to_pattern(row: &SqliteRow) -> Result<FailurePattern> {
    let members: String = row.get("member_ids");
    let tags: String = row.get("equipment_tags");
    let centroid: Vec<u8> = row.get("centroid");
    Ok(FailurePattern {
        id: row.get("id"),
        member_ids: serde_json::from_str(&members).context("Invalid pattern member_ids")?,
        centroid: blob_to_vec(&centroid),
        first_occurrence: from_ts(row.get("first_occurrence")),
        last_occurrence: from_ts(row.get("last_occurrence")),
        equipment_tags: serde_json::from_str(&tags).context("Invalid pattern equipment_tags")?,
        summary: row.get("summary"),
        detected_at: from_ts(row.get("detected_at")),
    })
}

const EVENT_COLUMNS: &str = "id, document_id, plant_id, equipment_tag, description, root_cause, \
     repair_action, reported_at, embedding, embedding_fingerprint";

#[async_trait]
impl Store for SqliteStore {
    async fn upsert_document(&self, doc: &Document) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO documents (id, source_id, plant_id, text, status, failure_reason, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                source_id = excluded.source_id,
                plant_id = excluded.plant_id,
                text = excluded.text,
                status = excluded.status,
                failure_reason = excluded.failure_reason,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.source_id)
        .bind(&doc.plant_id)
        .bind(&doc.text)
        .bind(doc.status.as_str())
        .bind(&doc.failure_reason)
        .bind(ts(doc.created_at))
        .bind(ts(doc.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_document).transpose()
    }

    async fn documents_with_status(&self, status: DocumentStatus) -> Result<Vec<Document>> {
        let rows = sqlx::query("SELECT * FROM documents WHERE status = ? ORDER BY created_at, id")
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_document).collect()
    }

    async fn set_document_status(
        &self,
        id: &str,
        status: DocumentStatus,
        reason: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE documents SET status = ?, failure_reason = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(reason)
        .bind(Utc::now().timestamp())
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("Document not found: {}", id);
        }
        Ok(())
    }

    async fn save_extraction(
        &self,
        document_id: &str,
        work_orders: &[WorkOrder],
        events: &[FailureEvent],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM work_orders WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        for (position, wo) in work_orders.iter().enumerate() {
            sqlx::query("INSERT INTO work_orders (document_id, position, payload) VALUES (?, ?, ?)")
                .bind(document_id)
                .bind(position as i64)
                .bind(serde_json::to_string(wo)?)
                .execute(&mut *tx)
                .await?;
        }

        let existing: Vec<String> =
            sqlx::query_scalar("SELECT id FROM failure_events WHERE document_id = ?")
                .bind(document_id)
                .fetch_all(&mut *tx)
                .await?;
        for id in existing {
            if !events.iter().any(|e| e.id == id) {
                sqlx::query("DELETE FROM failure_events WHERE id = ?")
                    .bind(&id)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        for event in events {
            let embedding = event.embedding().map(vec_to_blob);
            let embedding_fp = event
                .embedding()
                .and(event.embedding_fingerprint())
                .map(|fp| fp.as_str().to_string());
            sqlx::query(
                r#"
                INSERT INTO failure_events (id, document_id, plant_id, equipment_tag, description,
                                            root_cause, repair_action, reported_at, text_fingerprint,
                                            embedding, embedding_fingerprint)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    document_id = excluded.document_id,
                    plant_id = excluded.plant_id,
                    equipment_tag = excluded.equipment_tag,
                    description = excluded.description,
                    root_cause = excluded.root_cause,
                    repair_action = excluded.repair_action,
                    reported_at = excluded.reported_at,
                    embedding = CASE
                        WHEN excluded.embedding IS NOT NULL THEN excluded.embedding
                        WHEN failure_events.embedding_fingerprint = excluded.text_fingerprint THEN failure_events.embedding
                        ELSE NULL END,
                    embedding_fingerprint = CASE
                        WHEN excluded.embedding IS NOT NULL THEN excluded.embedding_fingerprint
                        WHEN failure_events.embedding_fingerprint = excluded.text_fingerprint THEN failure_events.embedding_fingerprint
                        ELSE NULL END,
                    text_fingerprint = excluded.text_fingerprint
                "#,
            )
            .bind(&event.id)
            .bind(&event.document_id)
            .bind(&event.plant_id)
            .bind(&event.equipment_tag)
            .bind(event.description())
            .bind(event.root_cause())
            .bind(event.repair_action())
            .bind(ts(event.reported_at))
            .bind(event.text_fingerprint().as_str())
            .bind(embedding)
            .bind(embedding_fp)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn work_orders_for_document(&self, document_id: &str) -> Result<Vec<WorkOrder>> {
        let payloads: Vec<String> = sqlx::query_scalar(
            "SELECT payload FROM work_orders WHERE document_id = ? ORDER BY position",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        payloads
            .iter()
            .map(|p| serde_json::from_str(p).context("Invalid work order payload"))
            .collect()
    }

    async fn get_failure_event(&self, id: &str) -> Result<Option<FailureEvent>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM failure_events WHERE id = ?",
            EVENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_event).transpose()
    }

    async fn events_for_document(&self, document_id: &str) -> Result<Vec<FailureEvent>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM failure_events WHERE document_id = ? ORDER BY id",
            EVENT_COLUMNS
        ))
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_event).collect()
    }

    async fn events_missing_embeddings(&self, limit: Option<usize>) -> Result<Vec<FailureEvent>> {
        let limit_val = limit.map(|l| l as i64).unwrap_or(-1);
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM failure_events
            WHERE embedding IS NULL
               OR embedding_fingerprint IS NULL
               OR embedding_fingerprint != text_fingerprint
            ORDER BY reported_at, id
            LIMIT ?
            "#,
            EVENT_COLUMNS
        ))
        .bind(limit_val)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_event).collect()
    }

    async fn upsert_vector(
        &self,
        event_id: &str,
        vector: &[f32],
        metadata: &VectorMetadata,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE failure_events
            SET embedding = ?, embedding_fingerprint = ?, embedding_model = ?
            WHERE id = ? AND text_fingerprint = ?
            "#,
        )
        .bind(vec_to_blob(vector))
        .bind(metadata.text_fingerprint.as_str())
        .bind(&metadata.model)
        .bind(event_id)
        .bind(metadata.text_fingerprint.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn embedded_events(&self, filters: &EventFilters) -> Result<Vec<FailureEvent>> {
        let since = filters.since.map(ts);
        let until = filters.until.map(ts);
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM failure_events
            WHERE embedding IS NOT NULL
              AND embedding_fingerprint = text_fingerprint
              AND (? IS NULL OR plant_id = ?)
              AND (? IS NULL OR equipment_tag = ? COLLATE NOCASE)
              AND (? IS NULL OR reported_at >= ?)
              AND (? IS NULL OR reported_at < ?)
            "#,
            EVENT_COLUMNS
        ))
        .bind(&filters.plant_id)
        .bind(&filters.plant_id)
        .bind(&filters.equipment_tag)
        .bind(&filters.equipment_tag)
        .bind(since)
        .bind(since)
        .bind(until)
        .bind(until)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_event).collect()
    }

    async fn patterns(&self) -> Result<Vec<FailurePattern>> {
        let rows = sqlx::query("SELECT * FROM failure_patterns ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_pattern).collect()
    }

    async fn replace_patterns(
        &self,
        superseded: &[String],
        patterns: &[FailurePattern],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for id in superseded {
            sqlx::query("DELETE FROM failure_patterns WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        for p in patterns {
            sqlx::query(
                r#"
                INSERT INTO failure_patterns (id, member_ids, centroid, first_occurrence,
                                              last_occurrence, equipment_tags, summary, detected_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    member_ids = excluded.member_ids,
                    centroid = excluded.centroid,
                    first_occurrence = excluded.first_occurrence,
                    last_occurrence = excluded.last_occurrence,
                    equipment_tags = excluded.equipment_tags,
                    summary = excluded.summary,
                    detected_at = excluded.detected_at
                "#,
            )
            .bind(&p.id)
            .bind(serde_json::to_string(&p.member_ids)?)
            .bind(vec_to_blob(&p.centroid))
            .bind(ts(p.first_occurrence))
            .bind(ts(p.last_occurrence))
            .bind(serde_json::to_string(&p.equipment_tags)?)
            .bind(&p.summary)
            .bind(ts(p.detected_at))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn append_costs(&self, entries: &[CostLedgerEntry]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for e in entries {
            sqlx::query(
                "INSERT INTO cost_ledger (kind, units, cost_usd, recorded_at) VALUES (?, ?, ?, ?)",
            )
            .bind(e.kind.as_str())
            .bind(e.units as i64)
            .bind(e.cost_usd)
            .bind(e.recorded_at.timestamp_millis())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn cost_entries(&self) -> Result<Vec<CostLedgerEntry>> {
        let rows = sqlx::query("SELECT kind, units, cost_usd, recorded_at FROM cost_ledger ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                let kind: String = row.get("kind");
                let units: i64 = row.get("units");
                let recorded_at: i64 = row.get("recorded_at");
                Ok(CostLedgerEntry {
                    kind: OperationKind::parse(&kind)
                        .ok_or_else(|| anyhow::anyhow!("Unknown ledger kind: {}", kind))?,
                    units: units.max(0) as u64,
                    cost_usd: row.get("cost_usd"),
                    recorded_at: DateTime::from_timestamp_millis(recorded_at).unwrap_or_default(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::{db, migrate};
    use tempfile::TempDir;

    async fn setup() -> (TempDir, SqliteStore) {
        let tmp = TempDir::new().unwrap();
        let config = Config::with_db_path(tmp.path().join("mintel.sqlite"));
        let pool = db::connect(&config).await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        (tmp, SqliteStore::new(pool))
    }

    fn event(doc: &Document, id: &str, text: &str) -> FailureEvent {
        FailureEvent::new(id, doc.id.clone(), doc.plant_id.clone(), "P-12", text, doc.created_at)
            .with_root_cause("lubrication")
    }

    #[tokio::test]
    async fn test_document_roundtrip_and_status() {
        let (_tmp, store) = setup().await;
        let doc = Document::new("wo-1.txt", "plant-a", "Pump P-12 bearing failure");
        store.upsert_document(&doc).await.unwrap();
        store
            .set_document_status(&doc.id, DocumentStatus::Extracted, None)
            .await
            .unwrap();
        let got = store.get_document(&doc.id).await.unwrap().unwrap();
        assert_eq!(got.status, DocumentStatus::Extracted);
        assert_eq!(got.text, doc.text);
        assert!(store
            .set_document_status("missing", DocumentStatus::Failed, None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_vector_upsert_and_filtering() {
        let (_tmp, store) = setup().await;
        let doc = Document::new("wo-1.txt", "plant-a", "text");
        store.upsert_document(&doc).await.unwrap();
        let e = event(&doc, "e1", "Drive-end bearing overheated and seized");
        store.save_extraction(&doc.id, &[], &[e.clone()]).await.unwrap();

        assert_eq!(store.events_missing_embeddings(None).await.unwrap().len(), 1);

        let meta = VectorMetadata {
            text_fingerprint: e.text_fingerprint(),
            model: "test".into(),
        };
        assert!(store.upsert_vector("e1", &[0.5, 0.5], &meta).await.unwrap());
        assert!(store.events_missing_embeddings(None).await.unwrap().is_empty());

        let all = store.embedded_events(&EventFilters::default()).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].embedding(), Some(&[0.5f32, 0.5][..]));
        assert_eq!(all[0].root_cause(), Some("lubrication"));

        let other_plant = EventFilters {
            plant_id: Some("plant-b".into()),
            ..Default::default()
        };
        assert!(store.embedded_events(&other_plant).await.unwrap().is_empty());

        let by_tag = EventFilters {
            equipment_tag: Some("p-12".into()),
            ..Default::default()
        };
        assert_eq!(store.embedded_events(&by_tag).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_text_change_invalidates_vector() {
        let (_tmp, store) = setup().await;
        let doc = Document::new("wo-1.txt", "plant-a", "text");
        store.upsert_document(&doc).await.unwrap();
        let e = event(&doc, "e1", "Drive-end bearing overheated and seized");
        store.save_extraction(&doc.id, &[], &[e.clone()]).await.unwrap();
        let meta = VectorMetadata {
            text_fingerprint: e.text_fingerprint(),
            model: "test".into(),
        };
        store.upsert_vector("e1", &[1.0], &meta).await.unwrap();

        let changed = event(&doc, "e1", "Mechanical seal leaking");
        store.save_extraction(&doc.id, &[], &[changed]).await.unwrap();
        let got = store.get_failure_event("e1").await.unwrap().unwrap();
        assert!(got.embedding().is_none());
        assert!(store
            .embedded_events(&EventFilters::default())
            .await
            .unwrap()
            .is_empty());
        // A vector for the old text is refused.
        assert!(!store.upsert_vector("e1", &[1.0], &meta).await.unwrap());
    }

    #[tokio::test]
    async fn test_patterns_replace_atomically() {
        let (_tmp, store) = setup().await;
        let now = Utc::now();
        let p = |id: &str, members: &[&str]| FailurePattern {
            id: id.into(),
            member_ids: members.iter().map(|m| m.to_string()).collect(),
            centroid: vec![1.0, 0.0],
            first_occurrence: now,
            last_occurrence: now,
            equipment_tags: vec!["P-12".into()],
            summary: "s".into(),
            detected_at: now,
        };
        store
            .replace_patterns(&[], &[p("a", &["1", "2", "3"]), p("b", &["4", "5", "6"])])
            .await
            .unwrap();
        store
            .replace_patterns(&["a".into()], &[p("c", &["1", "2", "3", "7"])])
            .await
            .unwrap();
        let ids: Vec<String> = store.patterns().await.unwrap().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["b".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn test_cost_entries_persist() {
        let (_tmp, store) = setup().await;
        let entry = CostLedgerEntry {
            kind: OperationKind::EmbeddingCall,
            units: 1200,
            cost_usd: 0.00012,
            recorded_at: Utc::now(),
        };
        store.append_costs(&[entry.clone()]).await.unwrap();
        let got = store.cost_entries().await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].kind, OperationKind::EmbeddingCall);
        assert_eq!(got[0].units, 1200);
    }
}
