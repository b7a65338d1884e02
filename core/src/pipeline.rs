//! Per-message processing pipeline.
//!
//! `handle()` drives one chat message through the state machine:
//!
//! ```text
//! RECEIVED → [dedup?] → ACK → PARSING → NO_TRACEBACK | SEARCHING
//! SEARCHING → MATCHED → REPLYING_LINK
//! SEARCHING → ANALYZING → LLM_ANALYZE → LLM_DRAFT → CREATING → REPLYING_NEW
//! any error → REPLYING_ERROR
//! ```
//!
//! Two dedup layers guard side effects: a per-message-id TTL set rejects
//! chat replays before any reaction is touched, and a `(repo, signature)`
//! fingerprint registry keeps issue creation at-most-once within its TTL.
//! The whole invocation is bounded by `processing_timeout`; reactions are
//! best-effort and never affect the outcome.

use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracebot_protocol::Result;
use tracebot_protocol::TriageErr;
use tracebot_protocol::models::ChatMessage;
use tracebot_protocol::models::Issue;
use tracebot_protocol::models::IssueCreate;
use tracebot_protocol::models::IssueMatch;
use tracebot_protocol::models::ParsedTraceback;
use tracebot_protocol::models::ProcessingResult;
use tracing::debug;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use crate::analyzer::CodeAnalyzer;
use crate::config::AgentConfig;
use crate::dedup::TtlMap;
use crate::dedup::TtlSet;
use crate::matcher::IssueMatcher;
use crate::metrics::MetricsRegistry;
use crate::prompts;
use crate::providers::ChatProvider;
use crate::providers::LlmProvider;
use crate::providers::VcsProvider;
use crate::redact::SecretRedactor;
use crate::retry::RetryPolicy;
use crate::retry::with_retry;
use crate::traceback::TracebackParser;

/// TTL for both the message-id idempotency set and the creation
/// fingerprint registry.
const DEDUP_TTL: Duration = Duration::from_secs(300);

/// How long a pipeline waits on a concurrent creator for the same
/// fingerprint before assuming it failed and taking over.
const FINGERPRINT_WAIT: Duration = Duration::from_secs(30);
const FINGERPRINT_POLL: Duration = Duration::from_millis(250);

pub struct MessageHandler {
    chat: Arc<dyn ChatProvider>,
    vcs: Arc<dyn VcsProvider>,
    llm: Arc<dyn LlmProvider>,
    parser: TracebackParser,
    matcher: IssueMatcher,
    analyzer: CodeAnalyzer,
    redactor: Arc<SecretRedactor>,
    config: Arc<AgentConfig>,
    retry: RetryPolicy,
    message_dedup: TtlSet<(String, String)>,
    fingerprint_issues: TtlMap<(String, String), Issue>,
    fingerprint_creating: TtlSet<(String, String)>,
    metrics: Arc<MetricsRegistry>,
}

impl MessageHandler {
    #[expect(clippy::too_many_arguments)]
    pub fn new(
        chat: Arc<dyn ChatProvider>,
        vcs: Arc<dyn VcsProvider>,
        llm: Arc<dyn LlmProvider>,
        parser: TracebackParser,
        matcher: IssueMatcher,
        analyzer: CodeAnalyzer,
        redactor: Arc<SecretRedactor>,
        config: Arc<AgentConfig>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        let retry = config.retry.policy();
        Self {
            chat,
            vcs,
            llm,
            parser,
            matcher,
            analyzer,
            redactor,
            config,
            retry,
            message_dedup: TtlSet::new(DEDUP_TTL),
            fingerprint_issues: TtlMap::new(DEDUP_TTL),
            fingerprint_creating: TtlSet::new(DEDUP_TTL),
            metrics,
        }
    }

    /// Process one message to a terminal state. Never panics, never leaks
    /// internal detail to chat, always returns within
    /// `processing_timeout` (plus reply latency).
    pub async fn handle(&self, message: &ChatMessage, cancel: &CancellationToken) -> ProcessingResult {
        let dedup_key = (message.channel_id.clone(), message.message_id.clone());
        if !self.message_dedup.insert(dedup_key) {
            debug!(
                channel = message.channel_id.as_str(),
                message_id = message.message_id.as_str(),
                "duplicate delivery ignored"
            );
            self.metrics.inc_counter("messages_deduplicated_total", &[], 1);
            return ProcessingResult::NoTraceback;
        }

        let started = Instant::now();
        let correlation = Uuid::new_v4();
        let child_cancel = cancel.child_token();
        let timeout = self.config.runtime.processing_timeout();

        info!(
            channel = message.channel_id.as_str(),
            message_id = message.message_id.as_str(),
            user = crate::redact::sanitize_for_logging(&message.user_name).as_str(),
            %correlation,
            "processing message"
        );

        let outcome = tokio::select! {
            result = self.run(message, &child_cancel) => result,
            _ = tokio::time::sleep(timeout) => {
                child_cancel.cancel();
                Err(TriageErr::TimedOut)
            }
            _ = cancel.cancelled() => {
                child_cancel.cancel();
                Err(TriageErr::Cancelled)
            }
        };

        let result = match outcome {
            Ok(result) => result,
            Err(TriageErr::Cancelled) => {
                // Silent beyond reaction cleanup.
                self.remove_reaction(message, &self.config.reactions.processing_reaction)
                    .await;
                ProcessingResult::Error
            }
            Err(err) => {
                warn!(%correlation, kind = err.kind(), error = %err, "pipeline failed");
                self.metrics
                    .inc_counter("pipeline_errors_total", &[("kind", err.kind())], 1);
                self.reply_error(message, &err, correlation).await;
                ProcessingResult::Error
            }
        };

        self.metrics.inc_counter(
            "messages_processed_total",
            &[("result", result.as_str())],
            1,
        );
        self.metrics
            .observe_duration("pipeline_duration_seconds", &[], started.elapsed());
        info!(
            %correlation,
            result = result.as_str(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "message processing complete"
        );
        result
    }

    async fn run(
        &self,
        message: &ChatMessage,
        cancel: &CancellationToken,
    ) -> Result<ProcessingResult> {
        self.transition("ack");
        self.add_reaction(message, &self.config.reactions.processing_reaction)
            .await;

        self.transition("parsing");
        if !self.parser.contains_traceback(&message.text) {
            self.remove_reaction(message, &self.config.reactions.processing_reaction)
                .await;
            return Ok(ProcessingResult::NoTraceback);
        }
        let traceback = self.parser.parse(&message.text)?;
        debug!(
            exception_type = traceback.exception_type.as_str(),
            frames = traceback.frames.len(),
            chained = traceback.is_chained,
            "traceback parsed"
        );

        let repo = self.resolve_repository(message)?;

        self.transition("searching");
        let matches = self.matcher.find_matches(&repo, &traceback, cancel).await?;
        if let Some(best) = matches.first()
            && best.confidence >= self.config.matching.confidence_threshold
        {
            self.transition("matched");
            self.reply_link(message, best).await;
            self.finish_reactions(message, &self.config.reactions.complete_reaction)
                .await;
            return Ok(ProcessingResult::ExistingIssueLinked);
        }

        // Creation dedup: a recently created issue for the same
        // fingerprint turns this into a link, not a second issue.
        let fingerprint = (repo.clone(), traceback.signature());
        if let Some(issue) = self.remembered_issue(&fingerprint).await {
            self.transition("matched");
            let link = remembered_match(issue);
            self.reply_link(message, &link).await;
            self.finish_reactions(message, &self.config.reactions.complete_reaction)
                .await;
            return Ok(ProcessingResult::ExistingIssueLinked);
        }

        self.transition("analyzing");
        let contexts = self.analyzer.analyze(&repo, &traceback, cancel).await?;
        let contexts = self
            .analyzer
            .fit_to_token_budget(contexts, self.llm.max_context_tokens())?;

        self.transition("llm_analyze");
        let analysis = self.analyze_with_validation(&traceback, &contexts, cancel).await?;

        self.transition("llm_draft");
        let title = self.draft_title(&traceback, &analysis, cancel).await?;
        let body = self.draft_body(&traceback, &analysis, &contexts, cancel).await?;

        self.transition("creating");
        let created = match self.create_once(&repo, &fingerprint, title, body, cancel).await? {
            CreateOutcome::Created(issue) => issue,
            CreateOutcome::AlreadyExists(issue) => {
                self.transition("matched");
                let link = remembered_match(issue);
                self.reply_link(message, &link).await;
                self.finish_reactions(message, &self.config.reactions.complete_reaction)
                    .await;
                return Ok(ProcessingResult::ExistingIssueLinked);
            }
        };

        self.transition("replying_new");
        self.reply_new(message, &created, &analysis).await;
        self.finish_reactions(message, &self.config.reactions.complete_reaction)
            .await;
        Ok(ProcessingResult::NewIssueCreated)
    }

    fn resolve_repository(&self, message: &ChatMessage) -> Result<String> {
        let Some(repo) = self.config.routing.repo_for_channel(&message.channel_id) else {
            return Err(TriageErr::PolicyViolation(format!(
                "no repository configured for channel {}",
                message.channel_id
            )));
        };
        if !self.config.routing.is_repo_allowed(repo) {
            return Err(TriageErr::PolicyViolation(format!(
                "repository {repo} is not in the allowlist"
            )));
        }
        crate::safe_cmd::ensure_valid_repo(repo)?;
        Ok(repo.to_string())
    }

    /// Look up a recently created issue for this fingerprint, refreshing
    /// its state from the VCS when possible.
    async fn remembered_issue(&self, fingerprint: &(String, String)) -> Option<Issue> {
        let issue = self.fingerprint_issues.get(fingerprint)?;
        match self.vcs.get_issue(&fingerprint.0, issue.number).await {
            Ok(Some(fresh)) => Some(fresh),
            _ => Some(issue),
        }
    }

    /// Create the issue at most once per fingerprint: the creating-set is
    /// the reservation, the issue map is the published result. A loser
    /// waits for the winner's issue and links to it instead.
    async fn create_once(
        &self,
        repo: &str,
        fingerprint: &(String, String),
        title: String,
        body: String,
        cancel: &CancellationToken,
    ) -> Result<CreateOutcome> {
        let deadline = Instant::now() + FINGERPRINT_WAIT;
        while !self.fingerprint_creating.insert(fingerprint.clone()) {
            if let Some(issue) = self.fingerprint_issues.get(fingerprint) {
                return Ok(CreateOutcome::AlreadyExists(issue));
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(TriageErr::Cancelled),
                _ = tokio::time::sleep(FINGERPRINT_POLL) => {}
            }
        }
        if let Some(issue) = self.fingerprint_issues.get(fingerprint) {
            self.fingerprint_creating.remove(fingerprint);
            return Ok(CreateOutcome::AlreadyExists(issue));
        }

        let draft = IssueCreate {
            title,
            body,
            labels: self.config.routing.default_labels.clone(),
            assignees: Vec::new(),
        };
        let created = match with_retry(
            &self.retry,
            cancel,
            "create_issue",
            Some(self.metrics.as_ref()),
            || self.vcs.create_issue(repo, &draft),
        )
        .await
        {
            Ok(issue) => issue,
            Err(err) => {
                // Release the reservation so another message can try.
                self.fingerprint_creating.remove(fingerprint);
                return Err(err);
            }
        };

        info!(
            repo,
            number = created.number,
            url = created.url.as_str(),
            "issue created"
        );
        self.metrics.inc_counter("issues_created_total", &[], 1);
        self.fingerprint_issues
            .insert(fingerprint.clone(), created.clone());
        Ok(CreateOutcome::Created(created))
    }

    /// LLM analysis with schema validation and the single strict retry.
    async fn analyze_with_validation(
        &self,
        traceback: &ParsedTraceback,
        contexts: &[tracebot_protocol::models::CodeContext],
        cancel: &CancellationToken,
    ) -> Result<tracebot_protocol::models::ErrorAnalysis> {
        let analysis = with_retry(&self.retry, cancel, "analyze_error", Some(self.metrics.as_ref()), || {
            self.llm.analyze_error(traceback, contexts, None)
        })
        .await?;

        match prompts::validate_analysis(&analysis) {
            Ok(()) => Ok(analysis),
            Err(first_err) => {
                warn!(error = %first_err, "LLM analysis failed validation, strict retry");
                self.metrics
                    .inc_counter("llm_output_invalid_total", &[("op", "analyze")], 1);
                let retried = with_retry(
                    &self.retry,
                    cancel,
                    "analyze_error_strict",
                    Some(self.metrics.as_ref()),
                    || {
                        self.llm
                            .analyze_error(traceback, contexts, Some(prompts::STRICT_RETRY_REMINDER))
                    },
                )
                .await?;
                prompts::validate_analysis(&retried)?;
                Ok(retried)
            }
        }
    }

    async fn draft_title(
        &self,
        traceback: &ParsedTraceback,
        analysis: &tracebot_protocol::models::ErrorAnalysis,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let title = with_retry(&self.retry, cancel, "generate_title", Some(self.metrics.as_ref()), || {
            self.llm.generate_issue_title(traceback, analysis)
        })
        .await?;
        let title = match prompts::validate_issue_title(&title) {
            Ok(()) => title,
            Err(_) => {
                self.metrics
                    .inc_counter("llm_output_invalid_total", &[("op", "title")], 1);
                let retried = self.llm.generate_issue_title(traceback, analysis).await?;
                prompts::validate_issue_title(&retried)?;
                retried
            }
        };
        self.redactor.redact(title.trim())
    }

    async fn draft_body(
        &self,
        traceback: &ParsedTraceback,
        analysis: &tracebot_protocol::models::ErrorAnalysis,
        contexts: &[tracebot_protocol::models::CodeContext],
        cancel: &CancellationToken,
    ) -> Result<String> {
        let body = with_retry(&self.retry, cancel, "generate_body", Some(self.metrics.as_ref()), || {
            self.llm.generate_issue_body(traceback, analysis, contexts)
        })
        .await?;
        let body = match prompts::validate_issue_body(&body) {
            Ok(()) => body,
            Err(_) => {
                self.metrics
                    .inc_counter("llm_output_invalid_total", &[("op", "body")], 1);
                let retried = self
                    .llm
                    .generate_issue_body(traceback, analysis, contexts)
                    .await?;
                prompts::validate_issue_body(&retried)?;
                retried
            }
        };
        self.redactor.redact(&body)
    }

    async fn reply_link(&self, message: &ChatMessage, link: &IssueMatch) {
        let issue = &link.issue;
        let confidence_pct = (link.confidence * 100.0).round() as u32;
        let mut text = format!(
            "This error matches an existing issue (confidence {confidence_pct}%):\n#{}: {}\n{}\nState: {}",
            issue.number,
            issue.title,
            issue.url,
            issue.state.as_str()
        );
        if !link.match_reasons.is_empty() {
            text.push_str(&format!("\nWhy: {}", link.match_reasons.join(", ")));
        }
        self.send_reply(message, &text).await;
    }

    async fn reply_new(
        &self,
        message: &ChatMessage,
        issue: &Issue,
        analysis: &tracebot_protocol::models::ErrorAnalysis,
    ) {
        let text = format!(
            "Created a new issue for this error:\n#{}: {}\n{}\nRoot cause: {}\nSeverity: {}",
            issue.number,
            issue.title,
            issue.url,
            analysis.root_cause,
            analysis.severity.as_str()
        );
        self.send_reply(message, &text).await;
    }

    /// User-safe error reply: category only, plus a correlation id that
    /// links to the full detail in the structured log.
    async fn reply_error(&self, message: &ChatMessage, err: &TriageErr, correlation: Uuid) {
        let text = format!("{} (ref {correlation})", err.user_message());
        self.send_reply(message, &text).await;
        self.finish_reactions(message, &self.config.reactions.error_reaction)
            .await;
    }

    async fn send_reply(&self, message: &ChatMessage, text: &str) {
        let thread_id = message
            .thread_id
            .as_deref()
            .unwrap_or(message.message_id.as_str());
        if let Err(err) = self
            .chat
            .send_reply(&message.channel_id, text, Some(thread_id))
            .await
        {
            warn!(error = %err, "failed to send reply");
            self.metrics.inc_counter("reply_failures_total", &[], 1);
        }
    }

    async fn add_reaction(&self, message: &ChatMessage, name: &str) {
        if let Err(err) = self
            .chat
            .add_reaction(&message.channel_id, &message.message_id, name)
            .await
        {
            warn!(reaction = name, error = %err, "failed to add reaction");
            self.metrics.inc_counter("reaction_failures_total", &[], 1);
        }
    }

    async fn remove_reaction(&self, message: &ChatMessage, name: &str) {
        if let Err(err) = self
            .chat
            .remove_reaction(&message.channel_id, &message.message_id, name)
            .await
        {
            warn!(reaction = name, error = %err, "failed to remove reaction");
            self.metrics.inc_counter("reaction_failures_total", &[], 1);
        }
    }

    /// Terminal reaction update: drop the processing marker, add the
    /// outcome marker.
    async fn finish_reactions(&self, message: &ChatMessage, outcome: &str) {
        self.remove_reaction(message, &self.config.reactions.processing_reaction)
            .await;
        self.add_reaction(message, outcome).await;
    }

    fn transition(&self, state: &'static str) {
        debug!(state, "pipeline transition");
        self.metrics
            .inc_counter("pipeline_transitions_total", &[("state", state)], 1);
    }
}

enum CreateOutcome {
    Created(Issue),
    AlreadyExists(Issue),
}

fn remembered_match(issue: Issue) -> IssueMatch {
    IssueMatch {
        issue,
        confidence: 1.0,
        match_reasons: vec!["recently created for the same error signature".to_string()],
    }
}
