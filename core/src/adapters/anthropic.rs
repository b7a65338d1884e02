//! Anthropic provider over the Messages API.
//!
//! Redaction happens before every request; prompts are assembled only
//! through `prompts::*` builders, so user-derived content always sits in
//! tagged regions. Responses are parsed against the fixed schema here and
//! validated again by the pipeline. Transport retries are owned by the
//! pipeline's retry policy, not by this adapter.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use serde_json::json;
use tracebot_protocol::Result;
use tracebot_protocol::TriageErr;
use tracebot_protocol::models::CodeContext;
use tracebot_protocol::models::ErrorAnalysis;
use tracebot_protocol::models::Issue;
use tracebot_protocol::models::ParsedTraceback;
use tracing::debug;

use crate::config::LlmConfig;
use crate::prompts;
use crate::providers::LlmProvider;
use crate::redact::SecretRedactor;

const API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const API_KEY_ENV: &str = "ANTHROPIC_API_KEY";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Hard cap on accepted response length.
const MAX_RESPONSE_CHARS: usize = 50_000;

/// Known context windows; anything unknown gets the conservative default.
const MODEL_CONTEXT_WINDOWS: &[(&str, usize)] = &[
    ("claude-3-opus", 200_000),
    ("claude-3-5-sonnet", 200_000),
    ("claude-3-5-haiku", 200_000),
    ("claude-sonnet-4", 200_000),
];
const DEFAULT_CONTEXT_WINDOW: usize = 200_000;

pub struct AnthropicLlm {
    client: reqwest::Client,
    api_key: String,
    model: String,
    max_output_tokens: u32,
    redactor: Arc<SecretRedactor>,
}

impl AnthropicLlm {
    pub fn new(api_key: String, config: &LlmConfig, redactor: Arc<SecretRedactor>) -> Result<Self> {
        if api_key.is_empty() {
            return Err(TriageErr::Authentication("empty Anthropic API key".to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| TriageErr::Network(err.to_string()))?;
        Ok(Self {
            client,
            api_key,
            model: config.model.clone(),
            max_output_tokens: config.max_output_tokens,
            redactor,
        })
    }

    pub fn from_env(config: &LlmConfig, redactor: Arc<SecretRedactor>) -> Result<Self> {
        let api_key = std::env::var(API_KEY_ENV)
            .map_err(|_| TriageErr::Authentication(format!("missing {API_KEY_ENV}")))?;
        Self::new(api_key, config, redactor)
    }

    async fn complete(&self, system: &str, user_content: String) -> Result<String> {
        let payload = json!({
            "model": self.model,
            "max_tokens": self.max_output_tokens,
            "system": system,
            "messages": [{ "role": "user", "content": user_content }],
        });

        let response = self
            .client
            .post(API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&payload)
            .send()
            .await
            .map_err(|err| TriageErr::Network(format!("Anthropic request failed: {err}")))?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(map_status(status, retry_after));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|err| TriageErr::Network(format!("Anthropic returned non-JSON: {err}")))?;
        let text = extract_text(&body);
        if text.chars().count() > MAX_RESPONSE_CHARS {
            return Err(TriageErr::LlmOutputInvalid(format!(
                "response exceeds {MAX_RESPONSE_CHARS} characters"
            )));
        }
        debug!(model = self.model.as_str(), chars = text.len(), "LLM response received");
        Ok(text)
    }

    fn redacted_traceback(&self, traceback: &ParsedTraceback) -> Result<String> {
        self.redactor.redact(&prompts::format_traceback(traceback))
    }
}

#[async_trait]
impl LlmProvider for AnthropicLlm {
    async fn analyze_error(
        &self,
        traceback: &ParsedTraceback,
        code_context: &[CodeContext],
        additional_context: Option<&str>,
    ) -> Result<ErrorAnalysis> {
        let redacted_traceback = self.redacted_traceback(traceback)?;
        let redacted_code = self
            .redactor
            .redact(&prompts::format_code_context(code_context))?;

        // The strict reminder is a pipeline signal, not user data.
        let strict = additional_context == Some(prompts::STRICT_RETRY_REMINDER);
        let extra = match additional_context {
            Some(extra) if !strict => Some(self.redactor.redact(extra)?),
            _ => None,
        };

        let content = prompts::analysis_request(
            &redacted_traceback,
            &redacted_code,
            extra.as_deref(),
            strict,
        );
        let response = self
            .complete(prompts::ANALYSIS_SYSTEM_PROMPT, content)
            .await?;
        parse_analysis(&response)
    }

    async fn generate_issue_title(
        &self,
        traceback: &ParsedTraceback,
        analysis: &ErrorAnalysis,
    ) -> Result<String> {
        let signature = self.redactor.redact(&traceback.signature())?;
        let root_cause = self.redactor.redact(&analysis.root_cause)?;
        let content = format!(
            "{}\n\n{}\n\n<instructions>\nWrite the issue title.\n</instructions>",
            prompts::user_data("error_signature", &signature),
            prompts::user_data("root_cause", &root_cause),
        );
        let response = self.complete(prompts::TITLE_SYSTEM_PROMPT, content).await?;
        Ok(response.lines().next().unwrap_or_default().trim().to_string())
    }

    async fn generate_issue_body(
        &self,
        traceback: &ParsedTraceback,
        analysis: &ErrorAnalysis,
        code_context: &[CodeContext],
    ) -> Result<String> {
        let redacted_traceback = self.redacted_traceback(traceback)?;
        let redacted_code = self
            .redactor
            .redact(&prompts::format_code_context(code_context))?;
        let analysis_json = serde_json::to_string_pretty(analysis)
            .map_err(|err| TriageErr::InvalidInput(err.to_string()))?;
        let redacted_analysis = self.redactor.redact(&analysis_json)?;

        let content = format!(
            "{}\n\n{}\n\n{}\n\n<instructions>\nWrite the issue body.\n</instructions>",
            prompts::user_data("traceback", &redacted_traceback),
            prompts::user_data("analysis", &redacted_analysis),
            prompts::user_data("code_context", &redacted_code),
        );
        let response = self.complete(prompts::BODY_SYSTEM_PROMPT, content).await?;
        Ok(strip_code_fences(&response).to_string())
    }

    async fn calculate_similarity(
        &self,
        traceback: &ParsedTraceback,
        issues: &[Issue],
    ) -> Result<Vec<(Issue, f64)>> {
        if issues.is_empty() {
            return Ok(Vec::new());
        }
        let redacted_traceback = self.redacted_traceback(traceback)?;
        let content = prompts::similarity_request(&redacted_traceback, issues);
        let response = self
            .complete(prompts::SIMILARITY_SYSTEM_PROMPT, content)
            .await?;
        parse_similarity(&response, issues)
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn max_context_tokens(&self) -> usize {
        MODEL_CONTEXT_WINDOWS
            .iter()
            .find(|(prefix, _)| self.model.starts_with(prefix))
            .map(|(_, window)| *window)
            .unwrap_or(DEFAULT_CONTEXT_WINDOW)
    }
}

fn map_status(status: u16, retry_after: Option<Duration>) -> TriageErr {
    match status {
        401 => TriageErr::Authentication("Anthropic rejected the API key".to_string()),
        403 => TriageErr::Permission("Anthropic permission denied".to_string()),
        404 => TriageErr::NotFound("Anthropic endpoint or model not found".to_string()),
        429 => TriageErr::RateLimit { retry_after },
        status => TriageErr::Http {
            status,
            detail: "Anthropic Messages API".to_string(),
        },
    }
}

/// Concatenate the text blocks of a Messages API response.
fn extract_text(body: &Value) -> String {
    body.get("content")
        .and_then(Value::as_array)
        .map(|blocks| {
            blocks
                .iter()
                .filter_map(|block| block.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}

/// Models wrap JSON in markdown fences often enough to be worth tolerating.
fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.strip_prefix('\n').unwrap_or(rest);
    rest.strip_suffix("```").map(str::trim).unwrap_or(trimmed)
}

fn parse_analysis(response: &str) -> Result<ErrorAnalysis> {
    serde_json::from_str(strip_code_fences(response))
        .map_err(|err| TriageErr::LlmOutputInvalid(format!("analysis JSON invalid: {err}")))
}

fn parse_similarity(response: &str, issues: &[Issue]) -> Result<Vec<(Issue, f64)>> {
    #[derive(serde::Deserialize)]
    struct Entry {
        number: u64,
        score: f64,
    }

    let entries: Vec<Entry> = serde_json::from_str(strip_code_fences(response))
        .map_err(|err| TriageErr::LlmOutputInvalid(format!("similarity JSON invalid: {err}")))?;

    let mut scored: Vec<(Issue, f64)> = issues
        .iter()
        .map(|issue| {
            let score = entries
                .iter()
                .find(|entry| entry.number == issue.number)
                .map(|entry| entry.score.clamp(0.0, 1.0))
                .unwrap_or(0.0);
            (issue.clone(), score)
        })
        .collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    Ok(scored)
}
