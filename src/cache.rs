//! Extraction cache keyed by content fingerprint.
//!
//! [`ExtractionCache`] implements the lookup/store contract on top of a
//! pluggable [`CacheBackend`]:
//!
//! - a hit requires the stored extractor version to equal the requested
//!   one; anything else is a miss
//! - a payload that no longer deserializes is a miss, never an error
//! - entries older than the optional TTL are misses
//! - every hit is appended to the [`CostLedger`] as an avoided call
//!
//! Backends must give per-key atomic upserts. [`InMemoryCacheBackend`]
//! uses a sharded `DashMap`; [`SqliteCacheBackend`] uses a single-row
//! `INSERT … ON CONFLICT DO UPDATE`.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use sqlx::{Row, SqlitePool};
use tracing::{debug, warn};

use crate::fingerprint::ContentFingerprint;
use crate::ledger::CostLedger;
use crate::models::StructuredExtraction;

/// A stored extraction result.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionCacheEntry {
    pub fingerprint: ContentFingerprint,
    pub extractor_version: String,
    /// Serialized [`StructuredExtraction`].
    pub payload: String,
    pub created_at: DateTime<Utc>,
}

/// Raw key-value storage behind the cache.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, fingerprint: &ContentFingerprint) -> Result<Option<ExtractionCacheEntry>>;

    /// Insert or overwrite the entry for `entry.fingerprint`.
    async fn put(&self, entry: ExtractionCacheEntry) -> Result<()>;
}

pub struct ExtractionCache {
    backend: Arc<dyn CacheBackend>,
    ledger: Arc<CostLedger>,
    ttl: Option<Duration>,
}

impl ExtractionCache {
    pub fn new(backend: Arc<dyn CacheBackend>, ledger: Arc<CostLedger>) -> Self {
        Self {
            backend,
            ledger,
            ttl: None,
        }
    }

    pub fn in_memory(ledger: Arc<CostLedger>) -> Self {
        Self::new(Arc::new(InMemoryCacheBackend::new()), ledger)
    }

    /// Treat entries older than `days` as misses.
    pub fn with_ttl_days(mut self, days: Option<u64>) -> Self {
        self.ttl = days.map(|d| Duration::days(d as i64));
        self
    }

    pub async fn lookup(
        &self,
        fingerprint: &ContentFingerprint,
        extractor_version: &str,
    ) -> Result<Option<StructuredExtraction>> {
        let Some(entry) = self.backend.get(fingerprint).await? else {
            return Ok(None);
        };

        if entry.extractor_version != extractor_version {
            debug!(
                fingerprint = fingerprint.short(),
                stored = %entry.extractor_version,
                requested = extractor_version,
                "cache entry from another extractor version"
            );
            return Ok(None);
        }

        if let Some(ttl) = self.ttl {
            if Utc::now() - entry.created_at > ttl {
                debug!(fingerprint = fingerprint.short(), "cache entry expired");
                return Ok(None);
            }
        }

        match serde_json::from_str::<StructuredExtraction>(&entry.payload) {
            Ok(extraction) => {
                self.ledger.record_cache_hit();
                debug!(fingerprint = fingerprint.short(), "extraction cache hit");
                Ok(Some(extraction))
            }
            Err(e) => {
                warn!(
                    fingerprint = fingerprint.short(),
                    error = %e,
                    "unreadable cache payload, treating as miss"
                );
                Ok(None)
            }
        }
    }

    /// Store `extraction`. Storing the same key twice overwrites silently.
    pub async fn store(
        &self,
        fingerprint: &ContentFingerprint,
        extractor_version: &str,
        extraction: &StructuredExtraction,
    ) -> Result<()> {
        let payload =
            serde_json::to_string(extraction).context("Failed to serialize extraction")?;
        self.backend
            .put(ExtractionCacheEntry {
                fingerprint: fingerprint.clone(),
                extractor_version: extractor_version.to_string(),
                payload,
                created_at: Utc::now(),
            })
            .await
    }
}

// ============ In-memory backend ============

#[derive(Default)]
pub struct InMemoryCacheBackend {
    entries: DashMap<ContentFingerprint, ExtractionCacheEntry>,
}

impl InMemoryCacheBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CacheBackend for InMemoryCacheBackend {
    async fn get(&self, fingerprint: &ContentFingerprint) -> Result<Option<ExtractionCacheEntry>> {
        Ok(self.entries.get(fingerprint).map(|e| e.value().clone()))
    }

    async fn put(&self, entry: ExtractionCacheEntry) -> Result<()> {
        self.entries.insert(entry.fingerprint.clone(), entry);
        Ok(())
    }
}

// ============ SQLite backend ============

pub struct SqliteCacheBackend {
    pool: SqlitePool,
}

impl SqliteCacheBackend {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CacheBackend for SqliteCacheBackend {
    async fn get(&self, fingerprint: &ContentFingerprint) -> Result<Option<ExtractionCacheEntry>> {
        let row = sqlx::query(
            "SELECT extractor_version, payload, created_at FROM extraction_cache WHERE fingerprint = ?",
        )
        .bind(fingerprint.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| {
            let created_at: i64 = row.get("created_at");
            ExtractionCacheEntry {
                fingerprint: fingerprint.clone(),
                extractor_version: row.get("extractor_version"),
                payload: row.get("payload"),
                created_at: DateTime::from_timestamp(created_at, 0).unwrap_or_default(),
            }
        }))
    }

    async fn put(&self, entry: ExtractionCacheEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO extraction_cache (fingerprint, extractor_version, payload, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(fingerprint) DO UPDATE SET
                extractor_version = excluded.extractor_version,
                payload = excluded.payload,
                created_at = excluded.created_at
            "#,
        )
        .bind(entry.fingerprint.as_str())
        .bind(&entry.extractor_version)
        .bind(&entry.payload)
        .bind(entry.created_at.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CostConfig;
    use crate::fingerprint::fingerprint;
    use crate::ledger::OperationKind;
    use crate::models::EquipmentRef;

    fn sample() -> StructuredExtraction {
        StructuredExtraction {
            equipment: vec![EquipmentRef {
                tag: "P-12".into(),
                name: Some("Feed pump".into()),
                equipment_type: None,
                location: None,
            }],
            ..Default::default()
        }
    }

    fn setup() -> (Arc<InMemoryCacheBackend>, Arc<CostLedger>, ExtractionCache) {
        let backend = Arc::new(InMemoryCacheBackend::new());
        let ledger = Arc::new(CostLedger::new(CostConfig::default()));
        let cache = ExtractionCache::new(backend.clone(), ledger.clone());
        (backend, ledger, cache)
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let (_, ledger, cache) = setup();
        let fp = fingerprint("Pump P-12 bearing failure");
        assert!(cache.lookup(&fp, "v1").await.unwrap().is_none());

        cache.store(&fp, "v1", &sample()).await.unwrap();
        assert_eq!(cache.lookup(&fp, "v1").await.unwrap(), Some(sample()));
        assert_eq!(ledger.summary().count(OperationKind::ExtractionCacheHit), 1);
        assert_eq!(ledger.total_cost(), 0.0);
    }

    #[tokio::test]
    async fn test_version_mismatch_is_miss() {
        let (_, ledger, cache) = setup();
        let fp = fingerprint("text");
        cache.store(&fp, "v1", &sample()).await.unwrap();
        assert!(cache.lookup(&fp, "v2").await.unwrap().is_none());
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn test_store_twice_overwrites() {
        let (backend, _, cache) = setup();
        let fp = fingerprint("text");
        cache.store(&fp, "v1", &sample()).await.unwrap();
        cache.store(&fp, "v1", &sample()).await.unwrap();
        assert_eq!(backend.len(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_payload_is_miss() {
        let (backend, _, cache) = setup();
        let fp = fingerprint("text");
        backend
            .put(ExtractionCacheEntry {
                fingerprint: fp.clone(),
                extractor_version: "v1".into(),
                payload: "{\"work_orders\": 7}".into(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        assert!(cache.lookup(&fp, "v1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_entry_is_miss() {
        let (backend, _, cache) = setup();
        let cache = cache.with_ttl_days(Some(30));
        let fp = fingerprint("text");
        backend
            .put(ExtractionCacheEntry {
                fingerprint: fp.clone(),
                extractor_version: "v1".into(),
                payload: serde_json::to_string(&sample()).unwrap(),
                created_at: Utc::now() - Duration::days(31),
            })
            .await
            .unwrap();
        assert!(cache.lookup(&fp, "v1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_stores_distinct_keys() {
        let (backend, _, cache) = setup();
        let cache = Arc::new(cache);
        let mut handles = Vec::new();
        for i in 0..32 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                let fp = fingerprint(&format!("document {}", i));
                cache.store(&fp, "v1", &sample()).await.unwrap();
                cache.lookup(&fp, "v1").await.unwrap()
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap(), Some(sample()));
        }
        assert_eq!(backend.len(), 32);
    }
}
