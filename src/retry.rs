//! Retry policy
//!
//! Error classification, remediation hints, exponential backoff with jitter,
//! and the per-request retry context. The orchestration loop itself lives in
//! `agent`; everything here is policy and bookkeeping.

use crate::error::QueryError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Failure taxonomy surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCategory {
    ExtractionFailed,
    SyntaxError,
    PolicyViolation,
    StorageError,
    GeneratorUnreachable,
    GeneratorMalformedResponse,
    Timeout,
    Unknown,
}

impl ErrorCategory {
    /// Connectivity and format problems often resolve on a fresh call;
    /// syntactically broken or policy-violating SQL is a generator-quality
    /// problem that retrying blindly rarely fixes.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCategory::ExtractionFailed
                | ErrorCategory::GeneratorUnreachable
                | ErrorCategory::GeneratorMalformedResponse
                | ErrorCategory::Timeout
        )
    }

    /// Hints fed back into the next prompt to steer the generator.
    pub fn remediation_hints(&self) -> Vec<String> {
        match self {
            ErrorCategory::ExtractionFailed => vec![
                "respond with a JSON object containing a sql_query field".to_string(),
                "wrap the JSON response in a ```json code block".to_string(),
            ],
            ErrorCategory::SyntaxError => vec![
                "check the SQL against SQLite syntax".to_string(),
                "use only the tables CO01M, CO02M, CO03M, CO18H".to_string(),
                "dates use the YYYYMMDD text format".to_string(),
            ],
            ErrorCategory::PolicyViolation => vec![
                "use a single SELECT statement only".to_string(),
                "do not reference protected fields such as the national ID".to_string(),
                "add a LIMIT clause".to_string(),
            ],
            ErrorCategory::StorageError => vec![
                "verify table and column names against the schema".to_string(),
            ],
            ErrorCategory::GeneratorUnreachable => vec![
                "check that the model service is running and reachable".to_string(),
            ],
            ErrorCategory::GeneratorMalformedResponse => vec![
                "return valid JSON with the required fields".to_string(),
            ],
            ErrorCategory::Timeout => vec![
                "simplify the query so it completes within the time budget".to_string(),
            ],
            ErrorCategory::Unknown => vec!["review the error details".to_string()],
        }
    }
}

/// Classify a pipeline error into the taxonomy.
pub fn classify(error: &QueryError) -> ErrorCategory {
    match error {
        QueryError::Extraction(_) => ErrorCategory::ExtractionFailed,
        QueryError::Syntax(_) => ErrorCategory::SyntaxError,
        QueryError::Policy(_) => ErrorCategory::PolicyViolation,
        QueryError::Storage(_) => ErrorCategory::StorageError,
        QueryError::GeneratorUnreachable(_) => ErrorCategory::GeneratorUnreachable,
        QueryError::MalformedResponse(_) => ErrorCategory::GeneratorMalformedResponse,
        QueryError::Timeout(_) => ErrorCategory::Timeout,
        QueryError::Config(_) | QueryError::Io(_) | QueryError::Json(_) | QueryError::Unknown(_) => {
            ErrorCategory::Unknown
        }
    }
}

/// One failed attempt, appended to the retry context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub category: ErrorCategory,
    pub message: String,
    pub is_retryable: bool,
    pub remediation_hints: Vec<String>,
}

impl ErrorRecord {
    pub fn from_error(error: &QueryError) -> Self {
        let category = classify(error);
        Self {
            category,
            message: error.to_string(),
            is_retryable: category.is_retryable(),
            remediation_hints: category.remediation_hints(),
        }
    }
}

/// Orchestrator state for one user request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryState {
    Idle,
    Attempting,
    Retrying,
    Succeeded,
    Exhausted,
    Fatal,
}

/// Per-request retry bookkeeping. Owned exclusively by the orchestrator and
/// discarded once the request completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryContext {
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub state: RetryState,
    pub errors: Vec<ErrorRecord>,
    pub last_sql: Option<String>,
}

impl RetryContext {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempt_count: 0,
            max_attempts,
            state: RetryState::Idle,
            errors: Vec::new(),
            last_sql: None,
        }
    }

    pub fn record_failure(&mut self, error: &QueryError) -> &ErrorRecord {
        self.errors.push(ErrorRecord::from_error(error));
        self.errors.last().expect("just pushed")
    }

    pub fn last_error(&self) -> Option<&ErrorRecord> {
        self.errors.last()
    }
}

/// Backoff configuration for retryable failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryStrategy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub growth_rate: f64,
    pub jitter: bool,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            growth_rate: 2.0,
            jitter: true,
        }
    }
}

impl RetryStrategy {
    /// Deterministic backoff before jitter:
    /// `min(max_delay, base_delay * growth_rate^attempt_index)`.
    pub fn base_backoff(&self, attempt_index: u32) -> Duration {
        let factor = self.growth_rate.powi(attempt_index as i32);
        let delay = self.base_delay.as_secs_f64() * factor;
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }

    /// Backoff with bounded random jitter (uniform, 0 to 10% of the delay)
    /// so concurrent failures do not retry in lockstep.
    pub fn backoff(&self, attempt_index: u32) -> Duration {
        let base = self.base_backoff(attempt_index);
        if !self.jitter {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(0.0..=0.1) * base.as_secs_f64();
        base + Duration::from_secs_f64(jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_categories() {
        assert!(ErrorCategory::ExtractionFailed.is_retryable());
        assert!(ErrorCategory::GeneratorUnreachable.is_retryable());
        assert!(ErrorCategory::GeneratorMalformedResponse.is_retryable());
        assert!(ErrorCategory::Timeout.is_retryable());

        assert!(!ErrorCategory::SyntaxError.is_retryable());
        assert!(!ErrorCategory::PolicyViolation.is_retryable());
        assert!(!ErrorCategory::StorageError.is_retryable());
        assert!(!ErrorCategory::Unknown.is_retryable());
    }

    #[test]
    fn test_classification() {
        assert_eq!(
            classify(&QueryError::Extraction("no SQL found".to_string())),
            ErrorCategory::ExtractionFailed
        );
        assert_eq!(
            classify(&QueryError::Policy("forbidden keyword: DROP".to_string())),
            ErrorCategory::PolicyViolation
        );
        assert_eq!(
            classify(&QueryError::Timeout("inference timed out".to_string())),
            ErrorCategory::Timeout
        );
        assert_eq!(
            classify(&QueryError::Unknown("?".to_string())),
            ErrorCategory::Unknown
        );
    }

    #[test]
    fn test_storage_timeout_classifies_retryable() {
        // A busy/timeout storage failure surfaces as Timeout, which the
        // orchestrator retries; other storage failures stay fatal.
        let err = QueryError::from(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is busy".to_string()),
        ));
        assert_eq!(classify(&err), ErrorCategory::Timeout);
    }

    #[test]
    fn test_backoff_monotonic_before_jitter() {
        let strategy = RetryStrategy::default();
        for i in 0..8u32 {
            assert!(strategy.base_backoff(i) <= strategy.base_backoff(i + 1));
        }
    }

    #[test]
    fn test_backoff_capped_at_max_delay() {
        let strategy = RetryStrategy::default();
        assert_eq!(strategy.base_backoff(20), strategy.max_delay);
    }

    #[test]
    fn test_jitter_bounded() {
        let strategy = RetryStrategy::default();
        for i in 0..5u32 {
            let base = strategy.base_backoff(i);
            for _ in 0..20 {
                let jittered = strategy.backoff(i);
                assert!(jittered >= base);
                assert!(jittered.as_secs_f64() <= base.as_secs_f64() * 1.1 + f64::EPSILON);
            }
        }
    }

    #[test]
    fn test_context_records_failures_in_order() {
        let mut ctx = RetryContext::new(3);
        ctx.record_failure(&QueryError::Extraction("first".to_string()));
        ctx.record_failure(&QueryError::Timeout("second".to_string()));
        assert_eq!(ctx.errors.len(), 2);
        assert_eq!(ctx.errors[0].category, ErrorCategory::ExtractionFailed);
        assert_eq!(ctx.errors[1].category, ErrorCategory::Timeout);
        assert_eq!(ctx.last_error().unwrap().category, ErrorCategory::Timeout);
    }
}
