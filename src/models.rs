//! Core data models used throughout the maintenance pipeline.
//!
//! These types represent the documents, extracted records, failure events
//! and derived patterns that flow through extraction, embedding and
//! pattern detection.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::fingerprint::{fingerprint, ContentFingerprint};

/// Processing state of an ingested document.
///
/// Transitions only move forward (`pending → cached | extracted | failed`),
/// except that a `failed` document may be reset to `pending` for a retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Pending,
    Cached,
    Extracted,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Cached => "cached",
            DocumentStatus::Extracted => "extracted",
            DocumentStatus::Failed => "failed",
        }
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(&self, next: DocumentStatus) -> bool {
        use DocumentStatus::*;
        matches!(
            (self, next),
            (Pending, Cached) | (Pending, Extracted) | (Pending, Failed) | (Failed, Pending)
        )
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DocumentStatus::Pending),
            "cached" => Ok(DocumentStatus::Cached),
            "extracted" => Ok(DocumentStatus::Extracted),
            "failed" => Ok(DocumentStatus::Failed),
            other => anyhow::bail!("Unknown document status: '{}'", other),
        }
    }
}

/// A raw maintenance document handed over by the ingestion layer.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    /// Where the text came from (file path, upload id, ...).
    pub source_id: String,
    /// Plant or site the record belongs to.
    pub plant_id: String,
    pub text: String,
    pub status: DocumentStatus,
    /// Cause of the last failure, if `status` is `failed`.
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    pub fn new(source_id: impl Into<String>, plant_id: impl Into<String>, text: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source_id: source_id.into(),
            plant_id: plant_id.into(),
            text: text.into(),
            status: DocumentStatus::Pending,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A piece of equipment named by a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquipmentRef {
    /// Asset tag, e.g. `P-12`.
    pub tag: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub equipment_type: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkOrder {
    #[serde(default)]
    pub number: Option<String>,
    #[serde(default)]
    pub equipment_tag: Option<String>,
    pub description: String,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub opened_on: Option<NaiveDate>,
    #[serde(default)]
    pub completed_on: Option<NaiveDate>,
}

/// A failure as reported by the extraction service, before persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedFailure {
    pub equipment_tag: String,
    pub description: String,
    #[serde(default)]
    pub failure_mode: Option<String>,
    #[serde(default)]
    pub root_cause: Option<String>,
    #[serde(default)]
    pub repair_action: Option<String>,
    #[serde(default)]
    pub occurred_on: Option<NaiveDate>,
    #[serde(default)]
    pub downtime_hours: Option<f64>,
}

/// Typed records derived from one document.
///
/// This is also the payload stored in the extraction cache, so its serde
/// shape is part of the cache format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructuredExtraction {
    #[serde(default)]
    pub work_orders: Vec<WorkOrder>,
    #[serde(default)]
    pub failure_events: Vec<ExtractedFailure>,
    #[serde(default)]
    pub equipment: Vec<EquipmentRef>,
}

impl StructuredExtraction {
    /// Whether `tag` resolves to an entry in [`equipment`](Self::equipment).
    /// Tags compare case-insensitively.
    pub fn resolves_equipment(&self, tag: &str) -> bool {
        self.equipment
            .iter()
            .any(|e| e.tag.trim().eq_ignore_ascii_case(tag.trim()))
    }
}

/// A persisted failure event, owned by the document it was extracted from.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureEvent {
    pub id: String,
    pub document_id: String,
    pub plant_id: String,
    pub equipment_tag: String,
    description: String,
    root_cause: Option<String>,
    repair_action: Option<String>,
    pub reported_at: DateTime<Utc>,
    embedding: Option<Vec<f32>>,
    embedding_fingerprint: Option<ContentFingerprint>,
}

impl FailureEvent {
    pub fn new(
        id: impl Into<String>,
        document_id: impl Into<String>,
        plant_id: impl Into<String>,
        equipment_tag: impl Into<String>,
        description: impl Into<String>,
        reported_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            document_id: document_id.into(),
            plant_id: plant_id.into(),
            equipment_tag: equipment_tag.into(),
            description: description.into(),
            root_cause: None,
            repair_action: None,
            reported_at,
            embedding: None,
            embedding_fingerprint: None,
        }
    }

    /// Build the persisted event for the `index`-th failure of a document.
    ///
    /// Event ids are derived from the document id and position, so
    /// re-extracting the same document yields the same ids.
    pub fn from_extracted(doc: &Document, index: usize, failure: &ExtractedFailure) -> Self {
        let name = format!("{}:{}", doc.id, index);
        let id = uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, name.as_bytes()).to_string();
        let reported_at = failure
            .occurred_on
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc())
            .unwrap_or(doc.created_at);
        let mut event = Self::new(
            id,
            doc.id.clone(),
            doc.plant_id.clone(),
            failure.equipment_tag.trim(),
            failure.description.trim(),
            reported_at,
        );
        event.root_cause = failure.root_cause.clone();
        event.repair_action = failure.repair_action.clone();
        event
    }

    pub fn with_root_cause(mut self, root_cause: impl Into<String>) -> Self {
        self.set_root_cause(Some(root_cause.into()));
        self
    }

    pub fn with_repair_action(mut self, repair_action: impl Into<String>) -> Self {
        self.set_repair_action(Some(repair_action.into()));
        self
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn root_cause(&self) -> Option<&str> {
        self.root_cause.as_deref()
    }

    pub fn repair_action(&self) -> Option<&str> {
        self.repair_action.as_deref()
    }

    /// Replace the description. Drops any stored embedding.
    pub fn set_description(&mut self, description: impl Into<String>) {
        self.description = description.into();
        self.clear_embedding();
    }

    /// Replace the root cause. Drops any stored embedding.
    pub fn set_root_cause(&mut self, root_cause: Option<String>) {
        self.root_cause = root_cause;
        self.clear_embedding();
    }

    /// Replace the repair action. Drops any stored embedding.
    pub fn set_repair_action(&mut self, repair_action: Option<String>) {
        self.repair_action = repair_action;
        self.clear_embedding();
    }

    /// The text that gets embedded for this event.
    pub fn embedding_text(&self) -> String {
        let mut text = self.description.trim().to_string();
        if let Some(rc) = self.root_cause.as_deref().filter(|s| !s.trim().is_empty()) {
            text.push_str("\nRoot cause: ");
            text.push_str(rc.trim());
        }
        if let Some(ra) = self.repair_action.as_deref().filter(|s| !s.trim().is_empty()) {
            text.push_str("\nRepair: ");
            text.push_str(ra.trim());
        }
        text
    }

    /// Fingerprint of [`embedding_text`](Self::embedding_text).
    pub fn text_fingerprint(&self) -> ContentFingerprint {
        fingerprint(&self.embedding_text())
    }

    /// The stored embedding, if it was computed from the current text.
    pub fn embedding(&self) -> Option<&[f32]> {
        match (&self.embedding, &self.embedding_fingerprint) {
            (Some(v), Some(fp)) if *fp == self.text_fingerprint() => Some(v.as_slice()),
            _ => None,
        }
    }

    /// Fingerprint of the text the stored embedding was computed from.
    pub fn embedding_fingerprint(&self) -> Option<&ContentFingerprint> {
        self.embedding_fingerprint.as_ref()
    }

    /// Attach an embedding computed from text with fingerprint `source`.
    ///
    /// Returns `false` (and stores nothing) when `source` does not match
    /// the event's current text.
    pub fn attach_embedding(&mut self, vector: Vec<f32>, source: ContentFingerprint) -> bool {
        if source != self.text_fingerprint() {
            return false;
        }
        self.embedding = Some(vector);
        self.embedding_fingerprint = Some(source);
        true
    }

    /// Load a previously persisted embedding as-is. Staleness is still
    /// checked by [`embedding`](Self::embedding) on read.
    pub(crate) fn restore_embedding(&mut self, vector: Vec<f32>, source: ContentFingerprint) {
        self.embedding = Some(vector);
        self.embedding_fingerprint = Some(source);
    }

    fn clear_embedding(&mut self) {
        self.embedding = None;
        self.embedding_fingerprint = None;
    }
}

/// A cluster of similar failure events representing one recurring issue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailurePattern {
    pub id: String,
    /// Member event ids, sorted ascending.
    pub member_ids: Vec<String>,
    pub centroid: Vec<f32>,
    pub first_occurrence: DateTime<Utc>,
    pub last_occurrence: DateTime<Utc>,
    pub equipment_tags: Vec<String>,
    pub summary: String,
    pub detected_at: DateTime<Utc>,
}

impl FailurePattern {
    pub fn member_count(&self) -> usize {
        self.member_ids.len()
    }
}
