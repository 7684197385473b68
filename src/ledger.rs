//! Process-wide cost accounting.
//!
//! The [`CostLedger`] is created once at startup and passed around as an
//! `Arc` handle. Entries are append-only and are written only after the
//! external call they describe has completed. Cache hits and reused
//! embeddings are recorded as zero-cost "avoided" entries so savings show
//! up next to spend.
//!
//! The ledger also maps cumulative spend onto a [`ThrottleTier`], which
//! the orchestrator and batcher consult before every external call.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::CostConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    ExtractionCall,
    ExtractionCacheHit,
    EmbeddingCall,
    EmbeddingReuse,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::ExtractionCall => "extraction_call",
            OperationKind::ExtractionCacheHit => "extraction_cache_hit",
            OperationKind::EmbeddingCall => "embedding_call",
            OperationKind::EmbeddingReuse => "embedding_reuse",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "extraction_call" => Some(OperationKind::ExtractionCall),
            "extraction_cache_hit" => Some(OperationKind::ExtractionCacheHit),
            "embedding_call" => Some(OperationKind::EmbeddingCall),
            "embedding_reuse" => Some(OperationKind::EmbeddingReuse),
            _ => None,
        }
    }

    /// Whether this kind represents a call that was avoided.
    pub fn is_avoided(&self) -> bool {
        matches!(
            self,
            OperationKind::ExtractionCacheHit | OperationKind::EmbeddingReuse
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostLedgerEntry {
    pub kind: OperationKind,
    /// Tokens (or items, for reuse entries) accounted by this entry.
    pub units: u64,
    pub cost_usd: f64,
    pub recorded_at: DateTime<Utc>,
}

/// Token counts reported by the extraction service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// How freely external calls may be made given spend so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ThrottleTier {
    Normal,
    /// Soft budget reached: dispatch serially.
    Conserve,
    /// Hard budget reached: no new external calls.
    Suspended,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KindTotals {
    pub entries: u64,
    pub units: u64,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LedgerSummary {
    pub by_kind: BTreeMap<OperationKind, KindTotals>,
    pub total_cost_usd: f64,
}

impl LedgerSummary {
    pub fn count(&self, kind: OperationKind) -> u64 {
        self.by_kind.get(&kind).map(|t| t.entries).unwrap_or(0)
    }
}

pub struct CostLedger {
    pricing: CostConfig,
    entries: Mutex<Vec<CostLedgerEntry>>,
}

impl CostLedger {
    pub fn new(pricing: CostConfig) -> Self {
        Self {
            pricing,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// A ledger that continues from previously persisted `entries`, so
    /// budgets apply to cumulative spend across runs.
    pub fn from_entries(pricing: CostConfig, entries: Vec<CostLedgerEntry>) -> Self {
        Self {
            pricing,
            entries: Mutex::new(entries),
        }
    }

    // Entries are plain data; a panic mid-push cannot leave them inconsistent.
    fn lock(&self) -> MutexGuard<'_, Vec<CostLedgerEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn append(&self, kind: OperationKind, units: u64, cost_usd: f64) -> CostLedgerEntry {
        let entry = CostLedgerEntry {
            kind,
            units,
            cost_usd,
            recorded_at: Utc::now(),
        };
        self.lock().push(entry.clone());
        entry
    }

    pub fn record_extraction(&self, usage: TokenUsage) -> CostLedgerEntry {
        let cost = usage.input_tokens as f64 / 1000.0 * self.pricing.extraction_input_per_1k
            + usage.output_tokens as f64 / 1000.0 * self.pricing.extraction_output_per_1k;
        self.append(
            OperationKind::ExtractionCall,
            usage.input_tokens + usage.output_tokens,
            cost,
        )
    }

    pub fn record_cache_hit(&self) -> CostLedgerEntry {
        self.append(OperationKind::ExtractionCacheHit, 0, 0.0)
    }

    pub fn record_embedding(&self, tokens: u64) -> CostLedgerEntry {
        let cost = tokens as f64 / 1000.0 * self.pricing.embedding_per_1k;
        self.append(OperationKind::EmbeddingCall, tokens, cost)
    }

    /// `items` embeddings were served without an external call.
    pub fn record_embedding_reuse(&self, items: u64) -> CostLedgerEntry {
        self.append(OperationKind::EmbeddingReuse, items, 0.0)
    }

    pub fn entries(&self) -> Vec<CostLedgerEntry> {
        self.lock().clone()
    }

    /// Entries from position `offset` onwards, for incremental flushing.
    pub fn entries_since(&self, offset: usize) -> Vec<CostLedgerEntry> {
        self.lock().iter().skip(offset).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_cost(&self) -> f64 {
        self.lock().iter().map(|e| e.cost_usd).sum()
    }

    pub fn summary(&self) -> LedgerSummary {
        summarize(&self.lock())
    }

    pub fn tier(&self) -> ThrottleTier {
        let spent = self.total_cost();
        if self.pricing.hard_budget_usd.is_some_and(|hard| spent >= hard) {
            ThrottleTier::Suspended
        } else if self.pricing.soft_budget_usd.is_some_and(|soft| spent >= soft) {
            ThrottleTier::Conserve
        } else {
            ThrottleTier::Normal
        }
    }
}

pub fn summarize(entries: &[CostLedgerEntry]) -> LedgerSummary {
    let mut summary = LedgerSummary::default();
    for e in entries {
        let totals = summary.by_kind.entry(e.kind).or_default();
        totals.entries += 1;
        totals.units += e.units;
        totals.cost_usd += e.cost_usd;
        summary.total_cost_usd += e.cost_usd;
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger(soft: Option<f64>, hard: Option<f64>) -> CostLedger {
        CostLedger::new(CostConfig {
            soft_budget_usd: soft,
            hard_budget_usd: hard,
            ..CostConfig::default()
        })
    }

    #[test]
    fn test_extraction_cost_uses_both_prices() {
        let l = ledger(None, None);
        let e = l.record_extraction(TokenUsage {
            input_tokens: 2000,
            output_tokens: 1000,
        });
        // 2 × 0.003 + 1 × 0.015
        assert!((e.cost_usd - 0.021).abs() < 1e-9);
        assert_eq!(e.units, 3000);
    }

    #[test]
    fn test_cache_hits_are_free() {
        let l = ledger(None, None);
        l.record_cache_hit();
        l.record_embedding_reuse(4);
        assert_eq!(l.total_cost(), 0.0);
        let s = l.summary();
        assert_eq!(s.count(OperationKind::ExtractionCacheHit), 1);
        assert_eq!(s.by_kind[&OperationKind::EmbeddingReuse].units, 4);
    }

    #[test]
    fn test_tiers_follow_budgets() {
        let l = ledger(Some(0.01), Some(0.02));
        assert_eq!(l.tier(), ThrottleTier::Normal);
        l.append(OperationKind::EmbeddingCall, 0, 0.015);
        assert_eq!(l.tier(), ThrottleTier::Conserve);
        l.append(OperationKind::EmbeddingCall, 0, 0.01);
        assert_eq!(l.tier(), ThrottleTier::Suspended);
    }

    #[test]
    fn test_no_budget_never_throttles() {
        let l = ledger(None, None);
        l.append(OperationKind::ExtractionCall, 0, 1_000.0);
        assert_eq!(l.tier(), ThrottleTier::Normal);
    }

    #[test]
    fn test_entries_since_offset() {
        let l = ledger(None, None);
        l.record_cache_hit();
        l.record_embedding(100);
        l.record_embedding(200);
        let tail = l.entries_since(1);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].units, 100);
    }

    #[test]
    fn test_kind_names_roundtrip() {
        for kind in [
            OperationKind::ExtractionCall,
            OperationKind::ExtractionCacheHit,
            OperationKind::EmbeddingCall,
            OperationKind::EmbeddingReuse,
        ] {
            assert_eq!(OperationKind::parse(kind.as_str()), Some(kind));
        }
    }
}
