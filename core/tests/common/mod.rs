//! In-memory providers and fixtures for end-to-end pipeline tests.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracebot_core::ChatProvider;
use tracebot_core::LlmProvider;
use tracebot_core::VcsProvider;
use tracebot_core::clone_cache::Cloner;
use tracebot_protocol::Result;
use tracebot_protocol::TriageErr;
use tracebot_protocol::models::ChatMessage;
use tracebot_protocol::models::CodeContext;
use tracebot_protocol::models::ErrorAnalysis;
use tracebot_protocol::models::Issue;
use tracebot_protocol::models::IssueCreate;
use tracebot_protocol::models::IssueSearchResult;
use tracebot_protocol::models::IssueState;
use tracebot_protocol::models::IssueStateFilter;
use tracebot_protocol::models::ParsedTraceback;
use tracebot_protocol::models::Severity;

pub const SIMPLE_TRACEBACK: &str = r#"Traceback (most recent call last):
  File "src/app/main.py", line 42, in run
    value = to_int(raw)
  File "src/app/convert.py", line 7, in to_int
    return int(raw)
ValueError: bad int
"#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReactionEvent {
    Added(String),
    Removed(String),
}

/// Chat provider whose inbound stream is fed by the test.
pub struct MockChat {
    tx: async_channel::Sender<ChatMessage>,
    rx: async_channel::Receiver<ChatMessage>,
    pub replies: Mutex<Vec<String>>,
    pub reactions: Mutex<Vec<ReactionEvent>>,
}

impl Default for MockChat {
    fn default() -> Self {
        let (tx, rx) = async_channel::bounded(64);
        Self {
            tx,
            rx,
            replies: Mutex::new(Vec::new()),
            reactions: Mutex::new(Vec::new()),
        }
    }
}

impl MockChat {
    pub async fn deliver(&self, message: ChatMessage) {
        self.tx.send(message).await.expect("inbound channel open");
    }

    pub fn replies(&self) -> Vec<String> {
        self.replies.lock().unwrap().clone()
    }

    pub fn reactions(&self) -> Vec<ReactionEvent> {
        self.reactions.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatProvider for MockChat {
    async fn connect(&self) -> Result<async_channel::Receiver<ChatMessage>> {
        Ok(self.rx.clone())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn send_reply(
        &self,
        _channel_id: &str,
        text: &str,
        _thread_id: Option<&str>,
    ) -> Result<()> {
        self.replies.lock().unwrap().push(text.to_string());
        Ok(())
    }

    async fn add_reaction(&self, _channel_id: &str, _message_id: &str, name: &str) -> Result<()> {
        self.reactions
            .lock()
            .unwrap()
            .push(ReactionEvent::Added(name.to_string()));
        Ok(())
    }

    async fn remove_reaction(
        &self,
        _channel_id: &str,
        _message_id: &str,
        name: &str,
    ) -> Result<()> {
        self.reactions
            .lock()
            .unwrap()
            .push(ReactionEvent::Removed(name.to_string()));
        Ok(())
    }
}

/// VCS provider with preloaded search results and a created-issue log.
/// Created issues are numbered from 100.
pub struct MockVcs {
    pub search_results: Mutex<Vec<IssueSearchResult>>,
    pub created: Mutex<Vec<(String, IssueCreate)>>,
    pub search_calls: AtomicU32,
    next_number: AtomicU64,
}

impl Default for MockVcs {
    fn default() -> Self {
        Self {
            search_results: Mutex::new(Vec::new()),
            created: Mutex::new(Vec::new()),
            search_calls: AtomicU32::new(0),
            next_number: AtomicU64::new(100),
        }
    }
}

impl MockVcs {
    pub fn with_search_results(results: Vec<IssueSearchResult>) -> Self {
        Self {
            search_results: Mutex::new(results),
            ..Self::default()
        }
    }

    pub fn created(&self) -> Vec<(String, IssueCreate)> {
        self.created.lock().unwrap().clone()
    }
}

pub fn issue(number: u64, title: &str, body: &str, state: IssueState) -> Issue {
    Issue {
        number,
        title: title.to_string(),
        body: body.to_string(),
        url: format!("https://github.com/acme/api/issues/{number}"),
        state,
        labels: Vec::new(),
        created_at: Utc::now(),
        updated_at: Utc::now(),
        author: "octocat".to_string(),
    }
}

pub fn search_result(issue: Issue) -> IssueSearchResult {
    IssueSearchResult {
        issue,
        relevance_score: 0.9,
        matched_terms: Vec::new(),
    }
}

#[async_trait]
impl VcsProvider for MockVcs {
    async fn search_issues(
        &self,
        _repo: &str,
        _query: &str,
        _state: IssueStateFilter,
        _max_results: usize,
    ) -> Result<Vec<IssueSearchResult>> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.search_results.lock().unwrap().clone())
    }

    async fn get_issue(&self, _repo: &str, number: u64) -> Result<Option<Issue>> {
        let created = self.created.lock().unwrap();
        Ok(created
            .iter()
            .enumerate()
            .find(|(idx, _)| 100 + *idx as u64 == number)
            .map(|(idx, (_, draft))| {
                let mut issue = issue(100 + idx as u64, &draft.title, &draft.body, IssueState::Open);
                issue.labels = draft.labels.clone();
                issue
            }))
    }

    async fn create_issue(&self, repo: &str, draft: &IssueCreate) -> Result<Issue> {
        let number = self.next_number.fetch_add(1, Ordering::SeqCst);
        let mut created = issue(number, &draft.title, &draft.body, IssueState::Open);
        created.labels = draft.labels.clone();
        self.created
            .lock()
            .unwrap()
            .push((repo.to_string(), draft.clone()));
        Ok(created)
    }

    async fn get_file_content(
        &self,
        _repo: &str,
        _path: &str,
        _reference: Option<&str>,
    ) -> Result<Option<String>> {
        Ok(None)
    }

    async fn get_default_branch(&self, _repo: &str) -> Result<String> {
        Ok("main".to_string())
    }

    async fn clone_repository(
        &self,
        _repo: &str,
        dest: &Path,
        _branch: Option<&str>,
        _shallow: bool,
    ) -> Result<PathBuf> {
        Ok(dest.to_path_buf())
    }
}

/// LLM provider returning canned analysis; records call counts and echoes
/// the raw exception message into the generated body so redaction at the
/// issue boundary is observable.
#[derive(Default)]
pub struct MockLlm {
    pub analyze_calls: AtomicU32,
    pub title_calls: AtomicU32,
    pub body_calls: AtomicU32,
    pub similarity_calls: AtomicU32,
}

#[async_trait]
impl LlmProvider for MockLlm {
    async fn analyze_error(
        &self,
        _traceback: &ParsedTraceback,
        _code_context: &[CodeContext],
        _additional_context: Option<&str>,
    ) -> Result<ErrorAnalysis> {
        self.analyze_calls.fetch_add(1, Ordering::SeqCst);
        Ok(ErrorAnalysis {
            root_cause: "raw user input is not numeric".to_string(),
            explanation: "int() received a non-numeric string".to_string(),
            suggested_fixes: Vec::new(),
            related_documentation: Vec::new(),
            severity: Severity::Medium,
            confidence: 0.9,
        })
    }

    async fn generate_issue_title(
        &self,
        traceback: &ParsedTraceback,
        _analysis: &ErrorAnalysis,
    ) -> Result<String> {
        self.title_calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("{}: automated triage", traceback.exception_type))
    }

    async fn generate_issue_body(
        &self,
        traceback: &ParsedTraceback,
        analysis: &ErrorAnalysis,
        _code_context: &[CodeContext],
    ) -> Result<String> {
        self.body_calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!(
            "## Summary\n\n{}\n\n```\n{}: {}\n```\n",
            analysis.root_cause, traceback.exception_type, traceback.exception_message
        ))
    }

    async fn calculate_similarity(
        &self,
        _traceback: &ParsedTraceback,
        issues: &[Issue],
    ) -> Result<Vec<(Issue, f64)>> {
        self.similarity_calls.fetch_add(1, Ordering::SeqCst);
        Ok(issues.iter().map(|issue| (issue.clone(), 0.0)).collect())
    }

    fn model_name(&self) -> &str {
        "mock-model"
    }

    fn max_context_tokens(&self) -> usize {
        200_000
    }
}

/// Cloner that writes a tiny Python tree matching [`SIMPLE_TRACEBACK`].
#[derive(Default)]
pub struct MockCloner {
    pub calls: AtomicU32,
}

#[async_trait]
impl Cloner for MockCloner {
    async fn clone_into(&self, _repo: &str, dest: &Path, _cancel: &CancellationToken) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::fs::create_dir_all(dest.join("src/app")).map_err(TriageErr::Io)?;
        let main_py: String = (1..=60)
            .map(|i| format!("# main line {i}\n"))
            .collect();
        let convert_py: String = (1..=20)
            .map(|i| format!("# convert line {i}\n"))
            .collect();
        std::fs::write(dest.join("src/app/main.py"), main_py).map_err(TriageErr::Io)?;
        std::fs::write(dest.join("src/app/convert.py"), convert_py).map_err(TriageErr::Io)?;
        std::fs::write(dest.join("README.md"), "# acme api\n").map_err(TriageErr::Io)?;
        Ok(())
    }
}

pub fn chat_message(channel: &str, message_id: &str, text: &str) -> ChatMessage {
    ChatMessage {
        channel_id: channel.to_string(),
        message_id: message_id.to_string(),
        thread_id: None,
        user_id: "U1".to_string(),
        user_name: "dev".to_string(),
        text: text.to_string(),
        timestamp: Utc::now(),
        raw_event: serde_json::Value::Null,
    }
}

/// Poll `condition` until it holds or the timeout elapses.
pub async fn wait_until<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
