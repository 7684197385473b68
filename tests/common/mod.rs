//! Counting fake services shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use maintenance_intel::embedding::{EmbedResponse, EmbeddingService};
use maintenance_intel::error::ServiceError;
use maintenance_intel::extractor::{ExtractorOutput, StructuredExtractor};
use maintenance_intel::ledger::TokenUsage;
use maintenance_intel::models::{EquipmentRef, ExtractedFailure, StructuredExtraction};

/// Each line naming a tag (a word containing `-`, e.g. `P-12`) becomes one
/// failure event on that tag. Fails permanently while `reject_next` > 0.
/// Panics on text containing `PANIC`.
pub struct FakeExtractor {
    calls: AtomicUsize,
    reject_next: AtomicUsize,
}

impl FakeExtractor {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            reject_next: AtomicUsize::new(0),
        }
    }

    pub fn rejecting(times: usize) -> Self {
        let extractor = Self::new();
        extractor.reject_next.store(times, Ordering::SeqCst);
        extractor
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StructuredExtractor for FakeExtractor {
    fn model_name(&self) -> &str {
        "fake-extractor"
    }

    async fn extract_structured(&self, text: &str) -> Result<ExtractorOutput, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if text.contains("PANIC") {
            panic!("extractor crashed on {:?}", text);
        }
        if self
            .reject_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ServiceError::permanent("policy rejection"));
        }

        let mut extraction = StructuredExtraction::default();
        for line in text.lines() {
            let Some(tag) = line
                .split_whitespace()
                .map(|w| w.trim_matches(|c: char| c == ',' || c == '.' || c == ':'))
                .find(|w| w.contains('-'))
            else {
                continue;
            };
            if !extraction.resolves_equipment(tag) {
                extraction.equipment.push(EquipmentRef {
                    tag: tag.to_string(),
                    name: None,
                    equipment_type: None,
                    location: None,
                });
            }
            extraction.failure_events.push(ExtractedFailure {
                equipment_tag: tag.to_string(),
                description: line.trim().to_string(),
                failure_mode: None,
                root_cause: None,
                repair_action: None,
                occurred_on: None,
                downtime_hours: None,
            });
        }

        Ok(ExtractorOutput {
            extraction,
            usage: TokenUsage {
                input_tokens: 400,
                output_tokens: 120,
            },
        })
    }
}

/// Texts mentioning "bearing" land near `[1, 0, 0]`, everything else near
/// `[0, 0, 1]`. A small length-dependent offset keeps vectors distinct.
pub struct FakeEmbedder {
    calls: AtomicUsize,
}

impl FakeEmbedder {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn vector_for(text: &str) -> Vec<f32> {
        let offset = (text.len() % 7) as f32 * 0.02;
        if text.contains("bearing") {
            vec![1.0, offset, 0.0]
        } else {
            vec![0.0, offset, 1.0]
        }
    }
}

#[async_trait]
impl EmbeddingService for FakeEmbedder {
    fn model_name(&self) -> &str {
        "fake-embedder"
    }

    fn dims(&self) -> usize {
        3
    }

    async fn embed(&self, texts: &[String]) -> Result<EmbedResponse, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(EmbedResponse {
            vectors: texts
                .iter()
                .map(|t| {
                    if t.contains("poison") {
                        Err("content policy".to_string())
                    } else {
                        Ok(Self::vector_for(t))
                    }
                })
                .collect(),
            tokens: Some(texts.len() as u64 * 10),
        })
    }
}
