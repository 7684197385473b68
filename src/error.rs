//! Error types for the extraction and embedding stages.
//!
//! External collaborators report [`ServiceError`]s; the orchestrator and
//! batcher own the retry policy and surface [`ExtractionFailure`] or
//! [`EmbedFailure`] once it is exhausted. A filtered item is not an error
//! and is reported through `ItemOutcome::Filtered` instead.

use std::time::Duration;

use thiserror::Error;

use crate::ledger::TokenUsage;

/// Failure reported by an external AI service.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ServiceError {
    /// Timeouts, rate limits, 5xx. Eligible for retry.
    #[error("transient service error: {message}")]
    Transient {
        message: String,
        retry_after: Option<Duration>,
    },

    /// Malformed input, schema violations, policy rejection. Never retried.
    #[error("permanent service error: {0}")]
    Permanent(String),

    /// The call completed and was billed, but its output could not be
    /// parsed. Never retried.
    #[error("service returned unusable output: {message}")]
    InvalidOutput { message: String, usage: TokenUsage },
}

impl ServiceError {
    pub fn transient(message: impl Into<String>) -> Self {
        ServiceError::Transient {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        ServiceError::Permanent(message.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ServiceError::Transient { .. })
    }

    /// Tokens consumed by a call that completed despite failing.
    pub fn billed_usage(&self) -> Option<TokenUsage> {
        match self {
            ServiceError::InvalidOutput { usage, .. } => Some(*usage),
            _ => None,
        }
    }

    /// Delay before retrying after failed attempt `attempt` (1-based):
    /// `base * 2^(attempt - 1)`, raised to the service's retry hint if longer.
    pub fn backoff_delay(&self, base_ms: u64, attempt: u32) -> Duration {
        let exp = base_ms.saturating_mul(1u64 << attempt.saturating_sub(1).min(16));
        let delay = Duration::from_millis(exp);
        match self {
            ServiceError::Transient {
                retry_after: Some(hint),
                ..
            } => delay.max(*hint),
            _ => delay,
        }
    }

    /// Classify an HTTP status the way both AI providers need it:
    /// 408, 429 and 5xx are transient, other 4xx are permanent.
    pub fn from_status(status: u16, body: &str) -> Self {
        let message = format!("HTTP {}: {}", status, body);
        if status == 408 || status == 429 || (500..600).contains(&status) {
            ServiceError::transient(message)
        } else {
            ServiceError::permanent(message)
        }
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            return ServiceError::transient(err.to_string());
        }
        match err.status() {
            Some(status) => ServiceError::from_status(status.as_u16(), &err.to_string()),
            None => ServiceError::permanent(err.to_string()),
        }
    }
}

/// Why a document could not be extracted.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtractionFailure {
    /// Retry ceiling reached on transient errors. The document is `failed`.
    #[error("extraction failed after {attempts} attempts: {cause}")]
    Transient { attempts: u32, cause: ServiceError },

    /// Rejected input or invalid output. The document is `failed`.
    #[error("extraction rejected: {0}")]
    Permanent(String),

    /// The cost ledger reached the hard budget; no call was made and the
    /// document stays `pending`.
    #[error("extraction budget exhausted (spent ${spent_usd:.4})")]
    BudgetExhausted { spent_usd: f64 },

    /// Reading or writing the cache or store failed. Document status is
    /// left as it was.
    #[error("extraction storage error: {0}")]
    Storage(String),

    /// The worker processing the document panicked or was cancelled.
    #[error("extraction task aborted: {0}")]
    Aborted(String),
}

impl From<anyhow::Error> for ExtractionFailure {
    fn from(err: anyhow::Error) -> Self {
        ExtractionFailure::Storage(format!("{:#}", err))
    }
}

impl ExtractionFailure {
    pub fn is_transient(&self) -> bool {
        matches!(self, ExtractionFailure::Transient { .. })
    }
}

/// Why one embedding item did not get a vector.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EmbedFailure {
    #[error("embedding rejected: {0}")]
    Rejected(String),

    #[error("embedding failed after {attempts} attempts: {cause}")]
    Exhausted { attempts: u32, cause: ServiceError },

    #[error("embedding budget exhausted")]
    BudgetExhausted,

    #[error("embedding task aborted: {0}")]
    Aborted(String),

    /// The vector was computed but could not be written to the store.
    #[error("embedding storage error: {0}")]
    Storage(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(ServiceError::from_status(429, "slow down").is_transient());
        assert!(ServiceError::from_status(503, "").is_transient());
        assert!(ServiceError::from_status(408, "").is_transient());
        assert!(!ServiceError::from_status(400, "bad").is_transient());
        assert!(!ServiceError::from_status(403, "policy").is_transient());
    }

    #[test]
    fn test_backoff_grows_and_honors_hint() {
        let plain = ServiceError::transient("x");
        assert_eq!(plain.backoff_delay(100, 1), Duration::from_millis(100));
        assert_eq!(plain.backoff_delay(100, 3), Duration::from_millis(400));
        let hinted = ServiceError::Transient {
            message: "x".into(),
            retry_after: Some(Duration::from_secs(2)),
        };
        assert_eq!(hinted.backoff_delay(100, 1), Duration::from_secs(2));
    }

    #[test]
    fn test_failure_messages_carry_cause() {
        let f = ExtractionFailure::Transient {
            attempts: 3,
            cause: ServiceError::transient("timeout"),
        };
        let msg = f.to_string();
        assert!(msg.contains("3 attempts"));
        assert!(msg.contains("timeout"));
    }
}
