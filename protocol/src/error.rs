//! Fault taxonomy shared across the workspace.
//!
//! Variants group into the five families the pipeline reasons about:
//! input, external service, resource, safety, and lifecycle. Retry policy
//! keys off [`TriageErr::is_retryable`]; user-facing replies key off
//! [`TriageErr::user_message`], which never leaks internal detail.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TriageErr>;

#[derive(Debug, Error)]
pub enum TriageErr {
    // Input faults. Terminal for the message; never retried.
    #[error("failed to parse traceback: {0}")]
    Parse(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("policy violation: {0}")]
    PolicyViolation(String),

    // External-service faults.
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rate limited (retry after {retry_after:?})")]
    RateLimit { retry_after: Option<Duration> },

    #[error("command timed out after {timeout:?}")]
    CommandTimeout { timeout: Duration },

    #[error("network error: {0}")]
    Network(String),

    #[error("service returned HTTP {status}: {detail}")]
    Http { status: u16, detail: String },

    /// Exit-status failure from an external binary. `stderr` has already
    /// been through the redactor by the time it is stored here.
    #[error("command failed with exit code {exit_code}: {stderr}")]
    CommandFailure { exit_code: i32, stderr: String },

    // Resource faults.
    #[error("clone size {size_bytes} exceeds limit {limit_bytes}")]
    CloneTooLarge { size_bytes: u64, limit_bytes: u64 },

    #[error("path traversal detected: {0}")]
    PathTraversal(PathBuf),

    #[error("code context exceeds the model token budget")]
    TokenBudgetExceeded,

    // Safety faults. Fail closed: callers must not forward original input.
    #[error("redaction failed: {0}")]
    RedactionFailure(String),

    #[error("LLM output failed validation: {0}")]
    LlmOutputInvalid(String),

    #[error("prompt injection suspected: {0}")]
    PromptInjectionSuspected(String),

    // Lifecycle.
    #[error("operation cancelled")]
    Cancelled,

    #[error("processing timed out")]
    TimedOut,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TriageErr {
    /// Short stable label for metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            TriageErr::Parse(_) => "parse",
            TriageErr::InvalidInput(_) => "invalid_input",
            TriageErr::PolicyViolation(_) => "policy_violation",
            TriageErr::Authentication(_) => "authentication",
            TriageErr::Permission(_) => "permission",
            TriageErr::NotFound(_) => "not_found",
            TriageErr::RateLimit { .. } => "rate_limit",
            TriageErr::CommandTimeout { .. } => "command_timeout",
            TriageErr::Network(_) => "network",
            TriageErr::Http { .. } => "http",
            TriageErr::CommandFailure { .. } => "command_failure",
            TriageErr::CloneTooLarge { .. } => "clone_too_large",
            TriageErr::PathTraversal(_) => "path_traversal",
            TriageErr::TokenBudgetExceeded => "token_budget_exceeded",
            TriageErr::RedactionFailure(_) => "redaction_failure",
            TriageErr::LlmOutputInvalid(_) => "llm_output_invalid",
            TriageErr::PromptInjectionSuspected(_) => "prompt_injection",
            TriageErr::Cancelled => "cancelled",
            TriageErr::TimedOut => "timed_out",
            TriageErr::Io(_) => "io",
        }
    }

    /// Whether the retry loop may attempt the operation again.
    ///
    /// Network failures, command timeouts, and 5xx-family responses are
    /// retryable. Rate limits are handled separately via
    /// [`TriageErr::retry_after`]; everything else is terminal.
    pub fn is_retryable(&self) -> bool {
        match self {
            TriageErr::Network(_) | TriageErr::CommandTimeout { .. } => true,
            TriageErr::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Server-directed wait before the next attempt, when the fault carries
    /// one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            TriageErr::RateLimit { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Category-only text safe to echo back to chat. Never includes stack
    /// detail, service bodies, or any unredacted byte.
    pub fn user_message(&self) -> &'static str {
        match self {
            TriageErr::Parse(_) | TriageErr::InvalidInput(_) => "couldn't parse the traceback",
            TriageErr::PolicyViolation(_) => "this repository is not allowed by the agent's policy",
            TriageErr::Authentication(_)
            | TriageErr::Permission(_)
            | TriageErr::NotFound(_)
            | TriageErr::RateLimit { .. }
            | TriageErr::CommandTimeout { .. }
            | TriageErr::Network(_)
            | TriageErr::Http { .. }
            | TriageErr::CommandFailure { .. } => "couldn't reach the issue service",
            TriageErr::CloneTooLarge { .. }
            | TriageErr::PathTraversal(_)
            | TriageErr::TokenBudgetExceeded => "couldn't analyze the repository",
            TriageErr::RedactionFailure(_)
            | TriageErr::LlmOutputInvalid(_)
            | TriageErr::PromptInjectionSuspected(_) => "internal safety check failed — see logs",
            TriageErr::Cancelled | TriageErr::TimedOut => "processing timed out",
            TriageErr::Io(_) => "internal error — see logs",
        }
    }
}
