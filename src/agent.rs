//! Retry Orchestrator
//!
//! Drives one user request through the pipeline: prompt, generate, extract,
//! validate, execute. Retryable failures re-enter the loop with backoff and
//! an enriched recovery prompt; fatal failures and the per-request deadline
//! end it. All collaborators are injected; the orchestrator owns no global
//! state.

use crate::db::{DatabaseManager, ExecutionResult};
use crate::error::{QueryError, Result};
use crate::extractor::{ExtractionMethod, SqlExtractor};
use crate::llm::SqlGenerator;
use crate::models::SqlQueryResponse;
use crate::prompts::PromptBuilder;
use crate::retry::{ErrorRecord, RetryContext, RetryState, RetryStrategy};
use crate::validator::{SqlValidator, ValidationOutcome};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Final answer for one user request, success or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryOutcome {
    pub request_id: String,
    pub success: bool,
    /// The executed statement. Set only on success; SQL that failed
    /// validation stays internal to the retry prompts.
    pub sql: Option<String>,
    pub execution: Option<ExecutionResult>,
    /// Structured metadata, present when the generator honored the contract.
    pub structured: Option<SqlQueryResponse>,
    pub extraction_method: Option<ExtractionMethod>,
    pub attempts: u32,
    pub state: RetryState,
    pub errors: Vec<ErrorRecord>,
    /// Advisory findings from validation (missing LIMIT, wildcard, ...).
    pub suggestions: Vec<String>,
    /// One human-readable summary line for display layers.
    pub interpretation: String,
    pub elapsed: Duration,
}

/// Aggregate counters across all requests handled by one agent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AgentStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub total_retries: u64,
}

struct AttemptSuccess {
    sql: String,
    execution: ExecutionResult,
    structured: Option<SqlQueryResponse>,
    method: Option<ExtractionMethod>,
    suggestions: Vec<String>,
}

pub struct QueryAgent {
    generator: Arc<dyn SqlGenerator>,
    db: Arc<DatabaseManager>,
    extractor: SqlExtractor,
    validator: SqlValidator,
    prompts: PromptBuilder,
    strategy: RetryStrategy,
    request_deadline: Duration,
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    total_retries: AtomicU64,
}

impl QueryAgent {
    pub fn new(
        generator: Arc<dyn SqlGenerator>,
        db: Arc<DatabaseManager>,
        strategy: RetryStrategy,
        request_deadline: Duration,
    ) -> Self {
        Self {
            generator,
            db,
            extractor: SqlExtractor::new(),
            validator: SqlValidator::new(),
            prompts: PromptBuilder::new(),
            strategy,
            request_deadline,
            total_requests: AtomicU64::new(0),
            successful_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            total_retries: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> AgentStats {
        AgentStats {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successful_requests: self.successful_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            total_retries: self.total_retries.load(Ordering::Relaxed),
        }
    }

    /// Process one natural-language request end to end.
    pub async fn process_query(&self, user_query: &str, user_id: &str) -> QueryOutcome {
        let started = Instant::now();
        let request_id = uuid::Uuid::new_v4().to_string();
        let mut context = RetryContext::new(self.strategy.max_attempts);
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        info!(%request_id, user_id, query = user_query, "processing request");

        loop {
            context.attempt_count += 1;
            context.state = if context.attempt_count == 1 {
                RetryState::Attempting
            } else {
                RetryState::Retrying
            };
            debug!(
                attempt = context.attempt_count,
                max = context.max_attempts,
                "starting attempt"
            );

            let remaining = self
                .request_deadline
                .checked_sub(started.elapsed())
                .unwrap_or(Duration::ZERO);
            match self
                .run_attempt(user_query, user_id, remaining, &mut context)
                .await
            {
                Ok(success) => {
                    context.state = RetryState::Succeeded;
                    self.successful_requests.fetch_add(1, Ordering::Relaxed);
                    self.total_retries
                        .fetch_add(u64::from(context.attempt_count - 1), Ordering::Relaxed);
                    info!(
                        attempts = context.attempt_count,
                        rows = success.execution.row_count,
                        "request succeeded"
                    );
                    let interpretation = interpret_success(&success.execution);
                    return QueryOutcome {
                        request_id,
                        success: true,
                        sql: Some(success.sql),
                        execution: Some(success.execution),
                        structured: success.structured,
                        extraction_method: success.method,
                        attempts: context.attempt_count,
                        state: context.state,
                        errors: context.errors,
                        suggestions: success.suggestions,
                        interpretation,
                        elapsed: started.elapsed(),
                    };
                }
                Err(error) => {
                    let (category, is_retryable) = {
                        let record = context.record_failure(&error);
                        (record.category, record.is_retryable)
                    };
                    warn!(
                        attempt = context.attempt_count,
                        category = ?category,
                        error = %error,
                        "attempt failed"
                    );

                    if !is_retryable {
                        context.state = RetryState::Fatal;
                        return self.failed_outcome(request_id, context, started);
                    }
                    if context.attempt_count >= context.max_attempts {
                        context.state = RetryState::Exhausted;
                        return self.failed_outcome(request_id, context, started);
                    }

                    // Backoff is bounded by the per-request deadline: a wait
                    // that would start or end past it is not taken.
                    let delay = self.strategy.backoff(context.attempt_count - 1);
                    let remaining = self
                        .request_deadline
                        .checked_sub(started.elapsed())
                        .unwrap_or(Duration::ZERO);
                    if remaining <= delay {
                        warn!(
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "request deadline reached, not retrying"
                        );
                        context.state = RetryState::Exhausted;
                        return self.failed_outcome(request_id, context, started);
                    }
                    debug!(delay_ms = delay.as_millis() as u64, "backing off");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn run_attempt(
        &self,
        user_query: &str,
        user_id: &str,
        remaining: Duration,
        context: &mut RetryContext,
    ) -> Result<AttemptSuccess> {
        let system_prompt = self.prompts.system_prompt();
        let retry_view = if context.attempt_count > 1 {
            Some(&*context)
        } else {
            None
        };
        let user_prompt = self.prompts.user_prompt(user_query, retry_view);

        // The generation call may not outlive what is left of the request
        // deadline, whatever the client's own timeout says.
        let raw = tokio::time::timeout(
            remaining,
            self.generator.generate(&system_prompt, &user_prompt),
        )
        .await
        .map_err(|_| QueryError::Timeout("request deadline reached during generation".to_string()))??;

        let extraction = self.extractor.extract(&raw);
        let sql = match extraction.sql_query {
            Some(sql) if extraction.success => sql,
            _ => {
                return Err(QueryError::Extraction(
                    extraction
                        .error_message
                        .unwrap_or_else(|| "no SQL statement found in response".to_string()),
                ))
            }
        };
        context.last_sql = Some(sql.clone());

        let outcome = self.validator.validate(&sql);
        check_validation(&sql, &outcome)?;

        let execution = self.db.execute_query(&sql, user_id)?;
        Ok(AttemptSuccess {
            sql,
            execution,
            structured: extraction.structured,
            method: extraction.method,
            suggestions: outcome.suggestions,
        })
    }

    fn failed_outcome(
        &self,
        request_id: String,
        context: RetryContext,
        started: Instant,
    ) -> QueryOutcome {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
        self.total_retries
            .fetch_add(u64::from(context.attempt_count.saturating_sub(1)), Ordering::Relaxed);
        let interpretation = interpret_failure(&context);
        QueryOutcome {
            request_id,
            success: false,
            sql: None,
            execution: None,
            structured: None,
            extraction_method: None,
            attempts: context.attempt_count,
            state: context.state,
            errors: context.errors,
            suggestions: Vec::new(),
            interpretation,
            elapsed: started.elapsed(),
        }
    }
}

fn interpret_success(execution: &ExecutionResult) -> String {
    let mut line = match execution.row_count {
        0 => "No matching records found".to_string(),
        1 => "Found 1 matching record".to_string(),
        n => format!("Found {} matching records", n),
    };
    if execution.truncated {
        line.push_str(" (result capped, narrow the query for the full set)");
    }
    if execution.from_cache {
        line.push_str(" (cached)");
    }
    line
}

fn interpret_failure(context: &RetryContext) -> String {
    match context.last_error() {
        Some(record) => format!(
            "Request failed after {} attempt(s): {}",
            context.attempt_count, record.message
        ),
        None => format!("Request failed after {} attempt(s)", context.attempt_count),
    }
}

fn check_validation(sql: &str, outcome: &ValidationOutcome) -> Result<()> {
    if !outcome.is_syntactically_valid {
        return Err(QueryError::Syntax(
            outcome
                .message
                .clone()
                .unwrap_or_else(|| "SQL failed to parse".to_string()),
        ));
    }
    if !outcome.is_policy_safe {
        debug!(sql, violation = ?outcome.violation, "statement rejected");
        return Err(QueryError::Policy(
            outcome
                .message
                .clone()
                .unwrap_or_else(|| "statement violates the read-only policy".to_string()),
        ));
    }
    Ok(())
}
