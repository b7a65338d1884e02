//! Structural records exchanged between the pipeline stages.
//!
//! All types here are immutable values with structural equality. Derived
//! fields (`signature`, `project_frames`, `normalized_path`) are pure
//! functions over the primary fields and are never stored.

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

/// Path fragments that mark a frame as coming from the Python standard
/// library rather than project code.
const STDLIB_MARKERS: &[&str] = &[
    "/lib/python",
    "/lib64/python",
    "\\lib\\python",
    "<frozen",
    "<built-in",
];

/// Absolute prefixes stripped when normalizing frame paths back to something
/// project-relative.
const ABSOLUTE_PREFIXES: &[&str] = &["/usr/local/", "/usr/", "/home/", "/Users/", "C:\\", "C:/"];

/// A single `File "...", line N, in func` record from a Python traceback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    /// File path exactly as it appeared in the traceback.
    pub file_path: String,
    /// 1-based line number.
    pub line_number: u32,
    pub function_name: String,
    /// The source line printed under the frame header, if present.
    pub code_line: Option<String>,
}

impl StackFrame {
    /// True when the frame points into the Python standard library.
    pub fn is_stdlib(&self) -> bool {
        STDLIB_MARKERS
            .iter()
            .any(|marker| self.file_path.contains(marker))
    }

    /// True when the frame points into an installed third-party package.
    pub fn is_site_packages(&self) -> bool {
        self.file_path.contains("site-packages") || self.file_path.contains("dist-packages")
    }

    /// Final path component, used for search-query and overlap scoring.
    pub fn basename(&self) -> &str {
        self.file_path
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(self.file_path.as_str())
    }

    /// Path with common absolute prefixes dropped back to something
    /// project-relative. Paths that already look relative pass through
    /// unchanged.
    pub fn normalized_path(&self) -> String {
        let path = self.file_path.as_str();
        for prefix in ABSOLUTE_PREFIXES {
            if path.starts_with(prefix) {
                let parts: Vec<&str> = path.split(['/', '\\']).collect();
                if parts.len() > 2 {
                    return parts[parts.len() - 3..].join("/");
                }
                break;
            }
        }
        path.to_string()
    }
}

/// A fully parsed Python traceback.
///
/// `frames` runs outermost to innermost, matching the source text order.
/// `cause` points at the exception that preceded a chain marker line; by
/// construction the chain is finite and acyclic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedTraceback {
    pub exception_type: String,
    /// Possibly multi-line. The first line participates in the signature.
    pub exception_message: String,
    pub frames: Vec<StackFrame>,
    /// Original raw text the traceback was parsed out of.
    pub raw_text: String,
    pub is_chained: bool,
    pub cause: Option<Box<ParsedTraceback>>,
}

impl ParsedTraceback {
    /// The frame the exception was raised from (last frame).
    pub fn innermost_frame(&self) -> Option<&StackFrame> {
        self.frames.last()
    }

    /// Frames from project code: neither stdlib nor site-packages.
    pub fn project_frames(&self) -> Vec<&StackFrame> {
        self.frames
            .iter()
            .filter(|frame| !frame.is_stdlib() && !frame.is_site_packages())
            .collect()
    }

    /// Deduplication key: `"<ExceptionType>: <first line of message>"`.
    ///
    /// Stable across whitespace and path variation as long as the exception
    /// type and message are stable.
    pub fn signature(&self) -> String {
        let first_line = self.exception_message.lines().next().unwrap_or("");
        format!("{}: {}", self.exception_type, first_line)
    }
}

/// State of a VCS issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueState {
    Open,
    Closed,
}

impl IssueState {
    pub fn as_str(self) -> &'static str {
        match self {
            IssueState::Open => "open",
            IssueState::Closed => "closed",
        }
    }
}

/// Search scope passed to the VCS provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueStateFilter {
    Open,
    Closed,
    All,
}

impl IssueStateFilter {
    pub fn as_str(self) -> &'static str {
        match self {
            IssueStateFilter::Open => "open",
            IssueStateFilter::Closed => "closed",
            IssueStateFilter::All => "all",
        }
    }
}

/// Immutable snapshot of a VCS issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub url: String,
    pub state: IssueState,
    pub labels: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub author: String,
}

/// An issue returned from search, with the backend's own relevance score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueSearchResult {
    pub issue: Issue,
    /// Backend relevance in `[0, 1]`.
    pub relevance_score: f64,
    pub matched_terms: Vec<String>,
}

/// A scored candidate match between a traceback and an existing issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueMatch {
    pub issue: Issue,
    /// Composite confidence in `[0, 1]`.
    pub confidence: f64,
    /// Human-readable reasons for the non-trivial scoring signals.
    pub match_reasons: Vec<String>,
}

/// Draft for a new issue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IssueCreate {
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub assignees: Vec<String>,
}

/// An incoming message from the chat platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub channel_id: String,
    pub message_id: String,
    /// `None` when the message is not in a thread.
    pub thread_id: Option<String>,
    pub user_id: String,
    pub user_name: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    /// Original platform event, kept opaque.
    pub raw_event: serde_json::Value,
}

/// A code snippet with surrounding context, already redacted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeContext {
    pub file_path: String,
    /// Inclusive, 1-based.
    pub start_line: u32,
    /// Inclusive, 1-based.
    pub end_line: u32,
    pub content: String,
    /// Line to emphasize (the error site), when it falls inside the range.
    pub highlight_line: Option<u32>,
}

impl CodeContext {
    pub fn line_count(&self) -> u32 {
        self.end_line - self.start_line + 1
    }
}

/// A suggested code fix from the LLM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuggestedFix {
    pub description: String,
    pub file_path: String,
    pub original_code: String,
    pub fixed_code: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

/// LLM analysis of an error, schema-validated before it reaches the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorAnalysis {
    pub root_cause: String,
    pub explanation: String,
    #[serde(default)]
    pub suggested_fixes: Vec<SuggestedFix>,
    #[serde(default)]
    pub related_documentation: Vec<String>,
    pub severity: Severity,
    pub confidence: f64,
}

/// Terminal outcome of processing one chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingResult {
    NoTraceback,
    ExistingIssueLinked,
    NewIssueCreated,
    Error,
}

impl ProcessingResult {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessingResult::NoTraceback => "no_traceback",
            ProcessingResult::ExistingIssueLinked => "existing_issue_linked",
            ProcessingResult::NewIssueCreated => "new_issue_created",
            ProcessingResult::Error => "error",
        }
    }
}
