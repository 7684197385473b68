//! Structured-extraction service clients.
//!
//! Defines the [`StructuredExtractor`] trait the orchestrator calls and
//! the concrete clients:
//! - **[`DisabledExtractor`]**: always fails permanently; used when no
//!   provider is configured.
//! - **[`AnthropicExtractor`]**: calls the Anthropic Messages API and
//!   parses the JSON document the model returns.
//!
//! Clients make exactly one attempt per call and classify failures as
//! transient or permanent. Retry and backoff belong to the orchestrator.

use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::config::ExtractionConfig;
use crate::error::ServiceError;
use crate::ledger::TokenUsage;
use crate::models::StructuredExtraction;

/// Result of one successful extraction call.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractorOutput {
    pub extraction: StructuredExtraction,
    pub usage: TokenUsage,
}

#[async_trait]
pub trait StructuredExtractor: Send + Sync {
    /// Identifier of the model behind this extractor.
    fn model_name(&self) -> &str;

    async fn extract_structured(&self, text: &str) -> Result<ExtractorOutput, ServiceError>;
}

// ============ Disabled Extractor ============

pub struct DisabledExtractor;

#[async_trait]
impl StructuredExtractor for DisabledExtractor {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn extract_structured(&self, _text: &str) -> Result<ExtractorOutput, ServiceError> {
        Err(ServiceError::permanent("Extraction provider is disabled"))
    }
}

// ============ Anthropic Extractor ============

const ANTHROPIC_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

const EXTRACTION_PROMPT: &str = r#"You extract structured data from industrial maintenance records.
Return ONLY a JSON object with this shape and no commentary:
{
  "equipment": [{"tag": string, "name": string|null, "equipment_type": string|null, "location": string|null}],
  "work_orders": [{"number": string|null, "equipment_tag": string|null, "description": string,
                   "priority": string|null, "opened_on": "YYYY-MM-DD"|null, "completed_on": "YYYY-MM-DD"|null}],
  "failure_events": [{"equipment_tag": string, "description": string, "failure_mode": string|null,
                      "root_cause": string|null, "repair_action": string|null,
                      "occurred_on": "YYYY-MM-DD"|null, "downtime_hours": number|null}]
}
Every equipment_tag used in work_orders or failure_events must appear in "equipment".
Use empty arrays when nothing applies.

Record:
"#;

pub struct AnthropicExtractor {
    client: reqwest::Client,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl AnthropicExtractor {
    /// # Errors
    ///
    /// Returns an error if `ANTHROPIC_API_KEY` is not in the environment.
    pub fn new(config: &ExtractionConfig) -> Result<Self> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| anyhow::anyhow!("ANTHROPIC_API_KEY environment variable not set"))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            api_key,
            model: config.model.clone(),
            max_tokens: config.max_tokens,
        })
    }
}

#[async_trait]
impl StructuredExtractor for AnthropicExtractor {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn extract_structured(&self, text: &str) -> Result<ExtractorOutput, ServiceError> {
        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "messages": [
                {"role": "user", "content": format!("{}{}", EXTRACTION_PROMPT, text)}
            ],
        });

        let response = self
            .client
            .post(ANTHROPIC_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            let body_text = response.text().await.unwrap_or_default();
            return Err(match ServiceError::from_status(status.as_u16(), &body_text) {
                ServiceError::Transient { message, .. } => ServiceError::Transient {
                    message,
                    retry_after,
                },
                permanent => permanent,
            });
        }

        let json: serde_json::Value = response.json().await?;
        parse_anthropic_response(&json)
    }
}

/// Parse a Messages API response into an [`ExtractorOutput`].
///
/// The model's text block may wrap the JSON in a Markdown code fence.
/// Output that is not the expected JSON is a
/// [`ServiceError::InvalidOutput`] carrying the tokens the call used.
fn parse_anthropic_response(json: &serde_json::Value) -> Result<ExtractorOutput, ServiceError> {
    let usage = json.get("usage");
    let tokens = |field: &str| {
        usage
            .and_then(|u| u.get(field))
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
    };
    let usage = TokenUsage {
        input_tokens: tokens("input_tokens"),
        output_tokens: tokens("output_tokens"),
    };

    let text = json
        .get("content")
        .and_then(|c| c.as_array())
        .and_then(|blocks| {
            blocks
                .iter()
                .find(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
        })
        .and_then(|b| b.get("text"))
        .and_then(|t| t.as_str())
        .ok_or_else(|| ServiceError::InvalidOutput {
            message: "Invalid Anthropic response: missing text content".to_string(),
            usage,
        })?;

    let extraction: StructuredExtraction =
        serde_json::from_str(strip_code_fence(text)).map_err(|e| ServiceError::InvalidOutput {
            message: format!("Extractor returned invalid JSON: {}", e),
            usage,
        })?;

    Ok(ExtractorOutput { extraction, usage })
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Create the configured [`StructuredExtractor`].
///
/// | Config Value | Extractor |
/// |-------------|-----------|
/// | `"disabled"` | [`DisabledExtractor`] |
/// | `"anthropic"` | [`AnthropicExtractor`] |
pub fn create_extractor(config: &ExtractionConfig) -> Result<Box<dyn StructuredExtractor>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledExtractor)),
        "anthropic" => Ok(Box::new(AnthropicExtractor::new(config)?)),
        other => bail!("Unknown extraction provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_response_with_fence_and_usage() {
        let json = serde_json::json!({
            "content": [{"type": "text", "text": "```json\n{\"equipment\":[{\"tag\":\"P-12\"}],\"failure_events\":[{\"equipment_tag\":\"P-12\",\"description\":\"bearing failure\",\"root_cause\":\"lubrication\"}]}\n```"}],
            "usage": {"input_tokens": 120, "output_tokens": 45}
        });
        let out = parse_anthropic_response(&json).unwrap();
        assert_eq!(out.extraction.equipment[0].tag, "P-12");
        assert_eq!(
            out.extraction.failure_events[0].root_cause.as_deref(),
            Some("lubrication")
        );
        assert_eq!(out.usage.input_tokens, 120);
        assert_eq!(out.usage.output_tokens, 45);
    }

    #[test]
    fn test_parse_response_rejects_prose() {
        let json = serde_json::json!({
            "content": [{"type": "text", "text": "I could not find any failures."}]
        });
        let err = parse_anthropic_response(&json).unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn test_invalid_json_keeps_billed_usage() {
        let json = serde_json::json!({
            "content": [{"type": "text", "text": "Here are the failures: pump seized."}],
            "usage": {"input_tokens": 3500, "output_tokens": 900}
        });
        let err = parse_anthropic_response(&json).unwrap_err();
        assert_eq!(
            err.billed_usage(),
            Some(TokenUsage {
                input_tokens: 3500,
                output_tokens: 900
            })
        );
    }

    #[test]
    fn test_parse_response_missing_content() {
        assert!(parse_anthropic_response(&serde_json::json!({})).is_err());
    }

    #[test]
    fn test_strip_code_fence() {
        assert_eq!(strip_code_fence("```json\n{}\n```"), "{}");
        assert_eq!(strip_code_fence("```\n[]\n```"), "[]");
        assert_eq!(strip_code_fence("  {}  "), "{}");
    }

    #[tokio::test]
    async fn test_disabled_extractor_is_permanent() {
        let err = DisabledExtractor.extract_structured("x").await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn test_create_disabled() {
        let e = create_extractor(&ExtractionConfig::default()).unwrap();
        assert_eq!(e.model_name(), "disabled");
    }
}
