//! GitHub provider backed by the `gh` CLI.
//!
//! Every invocation goes through [`SafeCommand`]: argv arrays, validated
//! repo specs, sanitized free-form strings, wall-clock timeouts, and
//! classified stderr. Issue payloads come back as `--json` output.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracebot_protocol::Result;
use tracebot_protocol::TriageErr;
use tracebot_protocol::models::Issue;
use tracebot_protocol::models::IssueCreate;
use tracebot_protocol::models::IssueSearchResult;
use tracebot_protocol::models::IssueState;
use tracebot_protocol::models::IssueStateFilter;
use tracing::debug;

use crate::providers::VcsProvider;
use crate::redact::SecretRedactor;
use crate::safe_cmd::CloneOptions;
use crate::safe_cmd::SafeCommand;
use crate::safe_cmd::ensure_valid_repo;
use crate::safe_cmd::sanitize_argument;

const ISSUE_JSON_FIELDS: &str = "number,title,body,state,labels,createdAt,updatedAt,author,url";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GhIssue {
    number: u64,
    title: String,
    #[serde(default)]
    body: String,
    state: String,
    #[serde(default)]
    labels: Vec<GhLabel>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    author: Option<GhAuthor>,
    url: String,
}

#[derive(Debug, Deserialize)]
struct GhLabel {
    name: String,
}

#[derive(Debug, Deserialize)]
struct GhAuthor {
    login: String,
}

impl GhIssue {
    fn into_issue(self) -> Result<Issue> {
        let state = match self.state.to_ascii_lowercase().as_str() {
            "open" => IssueState::Open,
            "closed" => IssueState::Closed,
            other => {
                return Err(TriageErr::InvalidInput(format!(
                    "unrecognized issue state: {other}"
                )));
            }
        };
        Ok(Issue {
            number: self.number,
            title: self.title,
            body: self.body,
            url: self.url,
            state,
            labels: self.labels.into_iter().map(|label| label.name).collect(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            author: self.author.map(|author| author.login).unwrap_or_default(),
        })
    }
}

pub struct GhCliVcs {
    gh: SafeCommand,
    git: SafeCommand,
    cancel: CancellationToken,
}

impl GhCliVcs {
    pub fn new(redactor: Arc<SecretRedactor>) -> Self {
        Self {
            gh: SafeCommand::new("gh", Arc::clone(&redactor)),
            git: SafeCommand::new("git", redactor),
            cancel: CancellationToken::new(),
        }
    }

    async fn run_gh(&self, args: Vec<String>) -> Result<String> {
        let output = self.gh.run(&args, None, None, &self.cancel).await?;
        Ok(output.stdout)
    }
}

#[async_trait]
impl VcsProvider for GhCliVcs {
    async fn search_issues(
        &self,
        repo: &str,
        query: &str,
        state: IssueStateFilter,
        max_results: usize,
    ) -> Result<Vec<IssueSearchResult>> {
        ensure_valid_repo(repo)?;
        let query = sanitize_argument(query, self.gh.max_arg_len());
        let limit = max_results.clamp(1, 100);

        let args = vec![
            "issue".to_string(),
            "list".to_string(),
            "--repo".to_string(),
            repo.to_string(),
            "--search".to_string(),
            query.clone(),
            "--state".to_string(),
            state.as_str().to_string(),
            "--limit".to_string(),
            limit.to_string(),
            "--json".to_string(),
            ISSUE_JSON_FIELDS.to_string(),
        ];
        let stdout = self.run_gh(args).await?;
        let issues = parse_issue_list(&stdout)?;
        debug!(repo, count = issues.len(), "issue search complete");
        Ok(rank_search_results(issues, &query))
    }

    async fn get_issue(&self, repo: &str, number: u64) -> Result<Option<Issue>> {
        ensure_valid_repo(repo)?;
        let args = vec![
            "issue".to_string(),
            "view".to_string(),
            number.to_string(),
            "--repo".to_string(),
            repo.to_string(),
            "--json".to_string(),
            ISSUE_JSON_FIELDS.to_string(),
        ];
        match self.run_gh(args).await {
            Ok(stdout) => {
                let parsed: GhIssue = serde_json::from_str(&stdout)
                    .map_err(|err| TriageErr::InvalidInput(format!("bad gh payload: {err}")))?;
                Ok(Some(parsed.into_issue()?))
            }
            Err(TriageErr::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn create_issue(&self, repo: &str, draft: &IssueCreate) -> Result<Issue> {
        ensure_valid_repo(repo)?;
        let mut args = vec![
            "issue".to_string(),
            "create".to_string(),
            "--repo".to_string(),
            repo.to_string(),
            "--title".to_string(),
            draft.title.clone(),
            "--body".to_string(),
            draft.body.clone(),
        ];
        for label in &draft.labels {
            args.push("--label".to_string());
            args.push(sanitize_argument(label, 100));
        }
        for assignee in &draft.assignees {
            args.push("--assignee".to_string());
            args.push(sanitize_argument(assignee, 100));
        }

        // `gh issue create` prints the new issue URL on stdout.
        let stdout = self.run_gh(args).await?;
        let url = stdout.trim().to_string();
        let number = issue_number_from_url(&url).ok_or_else(|| {
            TriageErr::InvalidInput(format!("could not parse issue number from: {url}"))
        })?;

        match self.get_issue(repo, number).await? {
            Some(issue) => Ok(issue),
            None => Ok(Issue {
                number,
                title: draft.title.clone(),
                body: draft.body.clone(),
                url,
                state: IssueState::Open,
                labels: draft.labels.clone(),
                created_at: Utc::now(),
                updated_at: Utc::now(),
                author: String::new(),
            }),
        }
    }

    async fn get_file_content(
        &self,
        repo: &str,
        path: &str,
        reference: Option<&str>,
    ) -> Result<Option<String>> {
        ensure_valid_repo(repo)?;
        let clean_path = sanitize_argument(path, 512);
        let mut api_path = format!("repos/{repo}/contents/{clean_path}");
        if let Some(reference) = reference {
            api_path.push_str(&format!("?ref={}", sanitize_argument(reference, 100)));
        }
        let args = vec![
            "api".to_string(),
            api_path,
            "--jq".to_string(),
            ".content".to_string(),
        ];
        match self.run_gh(args).await {
            Ok(stdout) => Ok(decode_content(&stdout)),
            Err(TriageErr::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn get_default_branch(&self, repo: &str) -> Result<String> {
        ensure_valid_repo(repo)?;
        let args = vec![
            "repo".to_string(),
            "view".to_string(),
            repo.to_string(),
            "--json".to_string(),
            "defaultBranchRef".to_string(),
            "--jq".to_string(),
            ".defaultBranchRef.name".to_string(),
        ];
        let stdout = self.run_gh(args).await?;
        Ok(stdout.trim().to_string())
    }

    async fn clone_repository(
        &self,
        repo: &str,
        dest: &Path,
        branch: Option<&str>,
        shallow: bool,
    ) -> Result<PathBuf> {
        let options = CloneOptions {
            branch: branch.map(str::to_string),
            shallow,
            max_size_bytes: None,
        };
        self.git.git_clone(repo, dest, &options, &self.cancel).await?;
        Ok(dest.to_path_buf())
    }
}

fn parse_issue_list(stdout: &str) -> Result<Vec<Issue>> {
    let parsed: Vec<GhIssue> = serde_json::from_str(stdout.trim())
        .map_err(|err| TriageErr::InvalidInput(format!("bad gh payload: {err}")))?;
    parsed.into_iter().map(GhIssue::into_issue).collect()
}

/// The CLI returns results in relevance order but without scores; derive a
/// positional score and record which query terms actually appear.
fn rank_search_results(issues: Vec<Issue>, query: &str) -> Vec<IssueSearchResult> {
    let terms: Vec<String> = query
        .split_whitespace()
        .map(|term| term.trim_matches('"').to_ascii_lowercase())
        .filter(|term| !term.is_empty())
        .collect();
    let total = issues.len().max(1) as f64;
    issues
        .into_iter()
        .enumerate()
        .map(|(idx, issue)| {
            let haystack = format!("{} {}", issue.title, issue.body).to_ascii_lowercase();
            let matched_terms: Vec<String> = terms
                .iter()
                .filter(|term| haystack.contains(term.as_str()))
                .cloned()
                .collect();
            IssueSearchResult {
                issue,
                relevance_score: (total - idx as f64) / total,
                matched_terms,
            }
        })
        .collect()
}

fn issue_number_from_url(url: &str) -> Option<u64> {
    url.rsplit('/').next()?.trim().parse().ok()
}

fn decode_content(stdout: &str) -> Option<String> {
    let cleaned: String = stdout
        .trim()
        .trim_matches('"')
        .chars()
        .filter(|ch| !ch.is_whitespace())
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    let bytes = BASE64.decode(cleaned.as_bytes()).ok()?;
    String::from_utf8(bytes).ok()
}
