//! Capability traits for the three external collaborators.
//!
//! The core consumes chat, VCS, and LLM transports through these seams and
//! nothing else. New providers implement a trait; there is no adapter
//! hierarchy. Inbound chat messages arrive on the channel returned by
//! [`ChatProvider::connect`]; the provider owns reconnection.

use std::path::Path;
use std::path::PathBuf;

use async_trait::async_trait;
use tracebot_protocol::Result;
use tracebot_protocol::models::ChatMessage;
use tracebot_protocol::models::CodeContext;
use tracebot_protocol::models::ErrorAnalysis;
use tracebot_protocol::models::Issue;
use tracebot_protocol::models::IssueCreate;
use tracebot_protocol::models::IssueSearchResult;
use tracebot_protocol::models::IssueStateFilter;
use tracebot_protocol::models::ParsedTraceback;

#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Establish the connection and return the inbound message stream.
    /// The stream is restartable; reconnection is the provider's problem.
    async fn connect(&self) -> Result<async_channel::Receiver<ChatMessage>>;

    async fn disconnect(&self) -> Result<()>;

    async fn send_reply(&self, channel_id: &str, text: &str, thread_id: Option<&str>)
    -> Result<()>;

    async fn add_reaction(&self, channel_id: &str, message_id: &str, name: &str) -> Result<()>;

    async fn remove_reaction(&self, channel_id: &str, message_id: &str, name: &str) -> Result<()>;
}

#[async_trait]
pub trait VcsProvider: Send + Sync {
    async fn search_issues(
        &self,
        repo: &str,
        query: &str,
        state: IssueStateFilter,
        max_results: usize,
    ) -> Result<Vec<IssueSearchResult>>;

    async fn get_issue(&self, repo: &str, number: u64) -> Result<Option<Issue>>;

    async fn create_issue(&self, repo: &str, draft: &IssueCreate) -> Result<Issue>;

    /// Read a single file without a local clone. `None` when the file does
    /// not exist at the given ref.
    async fn get_file_content(
        &self,
        repo: &str,
        path: &str,
        reference: Option<&str>,
    ) -> Result<Option<String>>;

    async fn get_default_branch(&self, repo: &str) -> Result<String>;

    /// Clone `repo` into `dest`. Implementations must disable hooks and
    /// default to a shallow clone; see `safe_cmd::SafeCommand::git_clone`.
    async fn clone_repository(
        &self,
        repo: &str,
        dest: &Path,
        branch: Option<&str>,
        shallow: bool,
    ) -> Result<PathBuf>;
}

/// The LLM is untrusted output: everything returned through this trait is
/// schema-validated and length-capped by `prompts::validate_*` before the
/// pipeline consumes it.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn analyze_error(
        &self,
        traceback: &ParsedTraceback,
        code_context: &[CodeContext],
        additional_context: Option<&str>,
    ) -> Result<ErrorAnalysis>;

    /// One-line issue title, at most 80 characters.
    async fn generate_issue_title(
        &self,
        traceback: &ParsedTraceback,
        analysis: &ErrorAnalysis,
    ) -> Result<String>;

    /// Markdown issue body, at most 10 000 characters.
    async fn generate_issue_body(
        &self,
        traceback: &ParsedTraceback,
        analysis: &ErrorAnalysis,
        code_context: &[CodeContext],
    ) -> Result<String>;

    /// Semantic similarity of `traceback` to each issue, in `[0, 1]`.
    async fn calculate_similarity(
        &self,
        traceback: &ParsedTraceback,
        issues: &[Issue],
    ) -> Result<Vec<(Issue, f64)>>;

    fn model_name(&self) -> &str;

    fn max_context_tokens(&self) -> usize;
}
