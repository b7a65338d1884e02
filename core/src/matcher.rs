//! Multi-signal ranking of candidate issues against a parsed traceback.
//!
//! One search query goes out per traceback (shielded by a TTL cache); each
//! candidate is then scored on four signals — exception-type word match,
//! message token overlap, project-frame basename overlap, and LLM semantic
//! similarity — combined with configurable weights that sum to one.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracebot_protocol::Result;
use tracebot_protocol::models::IssueMatch;
use tracebot_protocol::models::IssueSearchResult;
use tracebot_protocol::models::IssueState;
use tracebot_protocol::models::IssueStateFilter;
use tracebot_protocol::models::ParsedTraceback;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::MatchingConfig;
use crate::dedup::TtlMap;
use crate::metrics::MetricsRegistry;
use crate::providers::LlmProvider;
use crate::providers::VcsProvider;
use crate::retry::RetryPolicy;
use crate::retry::with_retry;
use crate::safe_cmd::sanitize_argument;

/// Signals below this level do not contribute a human-readable reason.
const REASON_THRESHOLD: f64 = 0.2;

/// Query budget for the quoted message fragment.
const QUERY_MESSAGE_CHARS: usize = 80;

/// Distinct innermost project-frame basenames included in the query.
const QUERY_MAX_BASENAMES: usize = 3;

pub struct IssueMatcher {
    vcs: Arc<dyn VcsProvider>,
    llm: Option<Arc<dyn LlmProvider>>,
    config: MatchingConfig,
    retry: RetryPolicy,
    search_cache: TtlMap<(String, String), Vec<IssueSearchResult>>,
    metrics: Arc<MetricsRegistry>,
}

impl IssueMatcher {
    pub fn new(
        vcs: Arc<dyn VcsProvider>,
        llm: Option<Arc<dyn LlmProvider>>,
        config: MatchingConfig,
        retry: RetryPolicy,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        let search_cache = TtlMap::new(config.search_cache_ttl());
        Self {
            vcs,
            llm,
            config,
            retry,
            search_cache,
            metrics,
        }
    }

    /// Search and rank candidate issues, best first. The returned list is
    /// capped at `max_search_results` and every confidence is in `[0, 1]`.
    pub async fn find_matches(
        &self,
        repo: &str,
        traceback: &ParsedTraceback,
        cancel: &CancellationToken,
    ) -> Result<Vec<IssueMatch>> {
        let query = self.build_search_query(traceback);
        info!(
            repo,
            exception_type = traceback.exception_type.as_str(),
            query = query.as_str(),
            "searching for matching issues"
        );

        let results = self.search(repo, &query, cancel).await?;
        if results.is_empty() {
            debug!(repo, "no candidate issues found");
            return Ok(Vec::new());
        }

        let candidates: Vec<IssueSearchResult> = if self.config.include_closed {
            results
        } else {
            results
                .into_iter()
                .filter(|result| result.issue.state == IssueState::Open)
                .collect()
        };

        let semantic_scores = self.semantic_scores(traceback, &candidates).await;
        let mut matches = self.score_candidates(traceback, &candidates, &semantic_scores);

        matches.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| state_rank(a.issue.state).cmp(&state_rank(b.issue.state)))
                .then_with(|| a.issue.number.cmp(&b.issue.number))
        });
        matches.truncate(self.config.max_search_results);

        info!(repo, matches = matches.len(), "issue matching complete");
        Ok(matches)
    }

    /// Mandatory exception-type term, the quoted message head with search
    /// metacharacters removed, and up to three distinct innermost
    /// project-frame basenames.
    pub fn build_search_query(&self, traceback: &ParsedTraceback) -> String {
        let mut parts = vec![traceback.exception_type.clone()];

        let first_line = traceback.exception_message.lines().next().unwrap_or("");
        let head: String = first_line.chars().take(QUERY_MESSAGE_CHARS).collect();
        let cleaned = sanitize_argument(&head, QUERY_MESSAGE_CHARS).replace(['"', '\''], "");
        if !cleaned.trim().is_empty() {
            parts.push(format!("\"{}\"", cleaned.trim()));
        }

        let mut basenames: Vec<String> = Vec::new();
        for frame in traceback.project_frames().into_iter().rev() {
            let basename = frame.basename().to_string();
            if basename.is_empty() || basenames.contains(&basename) {
                continue;
            }
            basenames.push(basename);
            if basenames.len() == QUERY_MAX_BASENAMES {
                break;
            }
        }
        parts.extend(basenames);
        parts.join(" ")
    }

    async fn search(
        &self,
        repo: &str,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<IssueSearchResult>> {
        let cache_key = (repo.to_string(), query.to_string());
        if let Some(cached) = self.search_cache.get(&cache_key) {
            self.metrics.inc_counter("search_cache_hits_total", &[], 1);
            return Ok(cached);
        }
        self.metrics.inc_counter("search_cache_misses_total", &[], 1);

        let state = if self.config.include_closed {
            IssueStateFilter::All
        } else {
            IssueStateFilter::Open
        };
        let max_results = self.config.max_search_results;
        let results = with_retry(
            &self.retry,
            cancel,
            "search_issues",
            Some(self.metrics.as_ref()),
            || self.vcs.search_issues(repo, query, state, max_results),
        )
        .await?;

        self.search_cache.insert(cache_key, results.clone());
        Ok(results)
    }

    /// Semantic similarity per issue number; empty when no LLM is wired in
    /// or the call fails (the signal reads as zero).
    async fn semantic_scores(
        &self,
        traceback: &ParsedTraceback,
        candidates: &[IssueSearchResult],
    ) -> HashMap<u64, f64> {
        let Some(llm) = &self.llm else {
            return HashMap::new();
        };
        let issues: Vec<_> = candidates
            .iter()
            .map(|result| result.issue.clone())
            .collect();
        match llm.calculate_similarity(traceback, &issues).await {
            Ok(scores) => scores
                .into_iter()
                .map(|(issue, score)| (issue.number, score.clamp(0.0, 1.0)))
                .collect(),
            Err(err) => {
                warn!(error = %err, "semantic similarity unavailable, scoring without it");
                HashMap::new()
            }
        }
    }

    fn score_candidates(
        &self,
        traceback: &ParsedTraceback,
        candidates: &[IssueSearchResult],
        semantic_scores: &HashMap<u64, f64>,
    ) -> Vec<IssueMatch> {
        let weights = &self.config.weights;
        let message_tokens = tokenize(&traceback.exception_message);
        let basenames: HashSet<String> = traceback
            .project_frames()
            .iter()
            .map(|frame| frame.basename().to_ascii_lowercase())
            .collect();

        candidates
            .iter()
            .map(|candidate| {
                let issue = &candidate.issue;
                let issue_tokens = tokenize(&format!("{} {}", issue.title, issue.body));
                let title_tokens = tokenize(&issue.title);

                let type_match = f64::from(
                    issue_tokens.contains(&traceback.exception_type.to_ascii_lowercase()),
                );

                let mut msg_match = jaccard(&message_tokens, &title_tokens);
                if type_match == 1.0 {
                    msg_match = msg_match.max(0.1);
                }

                let frame_overlap = if basenames.is_empty() {
                    0.0
                } else {
                    let hits = basenames
                        .iter()
                        .filter(|basename| issue_tokens.contains(*basename))
                        .count();
                    hits as f64 / basenames.len() as f64
                };

                let semantic = semantic_scores.get(&issue.number).copied().unwrap_or(0.0);

                let confidence = (weights.type_match * type_match
                    + weights.msg_match * msg_match
                    + weights.frame_overlap * frame_overlap
                    + weights.semantic * semantic)
                    .clamp(0.0, 1.0);

                let mut reasons = Vec::new();
                if type_match > REASON_THRESHOLD {
                    reasons.push("exact exception type".to_string());
                }
                if msg_match > REASON_THRESHOLD {
                    reasons.push("similar message".to_string());
                }
                if frame_overlap > REASON_THRESHOLD {
                    reasons.push("overlapping file basenames".to_string());
                }
                if semantic > REASON_THRESHOLD {
                    reasons.push("semantic similarity".to_string());
                }
                if issue.state == IssueState::Closed {
                    for reason in &mut reasons {
                        reason.push_str(" (closed)");
                    }
                }

                IssueMatch {
                    issue: issue.clone(),
                    confidence,
                    match_reasons: reasons,
                }
            })
            .collect()
    }
}

fn state_rank(state: IssueState) -> u8 {
    match state {
        IssueState::Open => 0,
        IssueState::Closed => 1,
    }
}

/// Lowercased tokens split on everything except alphanumerics, `.`, `_`,
/// and `-`, so file basenames like `convert.py` survive intact.
fn tokenize(text: &str) -> HashSet<String> {
    text.to_ascii_lowercase()
        .split(|ch: char| !(ch.is_alphanumeric() || ch == '.' || ch == '_' || ch == '-'))
        .map(|token| token.trim_matches(['.', '-']))
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    intersection as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use std::path::Path;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;
    use tracebot_protocol::TriageErr;
    use tracebot_protocol::models::Issue;
    use tracebot_protocol::models::IssueCreate;
    use tracebot_protocol::models::StackFrame;

    fn issue(number: u64, title: &str, body: &str, state: IssueState) -> Issue {
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

    fn search_result(issue: Issue) -> IssueSearchResult {
        IssueSearchResult {
            issue,
            relevance_score: 0.5,
            matched_terms: Vec::new(),
        }
    }

    fn traceback() -> ParsedTraceback {
        ParsedTraceback {
            exception_type: "ValueError".to_string(),
            exception_message: "bad int".to_string(),
            frames: vec![
                StackFrame {
                    file_path: "src/app/main.py".to_string(),
                    line_number: 42,
                    function_name: "run".to_string(),
                    code_line: None,
                },
                StackFrame {
                    file_path: "src/app/convert.py".to_string(),
                    line_number: 7,
                    function_name: "to_int".to_string(),
                    code_line: None,
                },
            ],
            raw_text: String::new(),
            is_chained: false,
            cause: None,
        }
    }

    struct StubVcs {
        results: Vec<IssueSearchResult>,
        calls: AtomicU32,
    }

    impl StubVcs {
        fn new(results: Vec<IssueSearchResult>) -> Self {
            Self {
                results,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl VcsProvider for StubVcs {
        async fn search_issues(
            &self,
            _repo: &str,
            _query: &str,
            _state: IssueStateFilter,
            _max_results: usize,
        ) -> Result<Vec<IssueSearchResult>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.results.clone())
        }
        async fn get_issue(&self, _repo: &str, _number: u64) -> Result<Option<Issue>> {
            Ok(None)
        }
        async fn create_issue(&self, _repo: &str, _draft: &IssueCreate) -> Result<Issue> {
            Err(TriageErr::InvalidInput("unused".into()))
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

    fn matcher_with(vcs: Arc<StubVcs>, config: MatchingConfig) -> IssueMatcher {
        IssueMatcher::new(
            vcs,
            None,
            config,
            RetryPolicy::default(),
            Arc::new(MetricsRegistry::new()),
        )
    }

    #[test]
    fn query_contains_type_quoted_message_and_basenames() {
        let matcher = matcher_with(
            Arc::new(StubVcs::new(Vec::new())),
            MatchingConfig::default(),
        );
        let query = matcher.build_search_query(&traceback());
        assert_eq!(query, "ValueError \"bad int\" convert.py main.py");
    }

    #[test]
    fn query_strips_metacharacters_and_caps_message() {
        let matcher = matcher_with(
            Arc::new(StubVcs::new(Vec::new())),
            MatchingConfig::default(),
        );
        let mut tb = traceback();
        tb.exception_message = format!("boom; `$(rm)` {}", "x".repeat(200));
        let query = matcher.build_search_query(&tb);
        assert!(!query.contains(';'));
        assert!(!query.contains('`'));
        assert!(!query.contains('$'));
        // Type + quoted fragment stays within the 80-char message budget.
        let quoted = query.split('"').nth(1).unwrap();
        assert!(quoted.chars().count() <= 80);
    }

    #[tokio::test]
    async fn exact_title_match_scores_highest() {
        let results = vec![
            search_result(issue(1, "ValueError: bad int", "seen in convert.py", IssueState::Open)),
            search_result(issue(2, "unrelated flaky test", "timeouts", IssueState::Open)),
        ];
        let matcher = matcher_with(Arc::new(StubVcs::new(results)), MatchingConfig::default());
        let matches = matcher
            .find_matches("acme/api", &traceback(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].issue.number, 1);
        assert!(matches[0].confidence > matches[1].confidence);
        assert!(
            matches[0]
                .match_reasons
                .contains(&"exact exception type".to_string())
        );
        assert!(matches[0].match_reasons.contains(&"similar message".to_string()));
        for m in &matches {
            assert!((0.0..=1.0).contains(&m.confidence));
        }
    }

    #[tokio::test]
    async fn msg_match_floor_applies_when_type_matches() {
        // Title shares no token with the message, but the type is present.
        let results = vec![search_result(issue(
            1,
            "ValueError raised during startup",
            "",
            IssueState::Open,
        ))];
        let matcher = matcher_with(Arc::new(StubVcs::new(results)), MatchingConfig::default());
        let mut tb = traceback();
        tb.exception_message = "completely different words".to_string();
        tb.frames.clear();
        let matches = matcher
            .find_matches("acme/api", &tb, &CancellationToken::new())
            .await
            .unwrap();

        // type_match = 1.0, msg floor = 0.1, frames/semantic = 0.
        let expected = 0.3 * 1.0 + 0.4 * 0.1;
        assert!((matches[0].confidence - expected).abs() < 1e-9);
    }

    #[tokio::test]
    async fn frame_overlap_counts_basenames() {
        let results = vec![search_result(issue(
            1,
            "crash in convert.py",
            "stack shows convert.py and main.py",
            IssueState::Open,
        ))];
        let matcher = matcher_with(Arc::new(StubVcs::new(results)), MatchingConfig::default());
        let mut tb = traceback();
        tb.exception_type = "SomethingElse".to_string();
        tb.exception_message = String::new();
        let matches = matcher
            .find_matches("acme/api", &tb, &CancellationToken::new())
            .await
            .unwrap();
        // Both basenames appear: frame_overlap = 1.0, weighted 0.2.
        assert!((matches[0].confidence - 0.2).abs() < 1e-9);
        assert_eq!(
            matches[0].match_reasons,
            vec!["overlapping file basenames".to_string()]
        );
    }

    #[tokio::test]
    async fn closed_issues_are_dropped_when_not_included() {
        let results = vec![
            search_result(issue(1, "ValueError: bad int", "", IssueState::Closed)),
            search_result(issue(2, "ValueError: bad int", "", IssueState::Open)),
        ];
        let config = MatchingConfig {
            include_closed: false,
            ..MatchingConfig::default()
        };
        let matcher = matcher_with(Arc::new(StubVcs::new(results)), config);
        let matches = matcher
            .find_matches("acme/api", &traceback(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].issue.number, 2);
    }

    #[tokio::test]
    async fn closed_issue_reasons_carry_the_suffix() {
        let results = vec![search_result(issue(
            1,
            "ValueError: bad int",
            "",
            IssueState::Closed,
        ))];
        let matcher = matcher_with(Arc::new(StubVcs::new(results)), MatchingConfig::default());
        let matches = matcher
            .find_matches("acme/api", &traceback(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(
            matches[0]
                .match_reasons
                .iter()
                .all(|reason| reason.ends_with("(closed)"))
        );
    }

    #[tokio::test]
    async fn ties_prefer_open_then_lower_number() {
        let results = vec![
            search_result(issue(7, "ValueError: bad int", "", IssueState::Closed)),
            search_result(issue(9, "ValueError: bad int", "", IssueState::Open)),
            search_result(issue(3, "ValueError: bad int", "", IssueState::Open)),
        ];
        let matcher = matcher_with(Arc::new(StubVcs::new(results)), MatchingConfig::default());
        let mut tb = traceback();
        tb.frames.clear();
        let matches = matcher
            .find_matches("acme/api", &tb, &CancellationToken::new())
            .await
            .unwrap();
        let numbers: Vec<u64> = matches.iter().map(|m| m.issue.number).collect();
        assert_eq!(numbers, vec![3, 9, 7]);
    }

    #[tokio::test]
    async fn repeated_searches_hit_the_ttl_cache() {
        let vcs = Arc::new(StubVcs::new(vec![search_result(issue(
            1,
            "ValueError: bad int",
            "",
            IssueState::Open,
        ))]));
        let matcher = matcher_with(Arc::clone(&vcs), MatchingConfig::default());
        let cancel = CancellationToken::new();

        matcher
            .find_matches("acme/api", &traceback(), &cancel)
            .await
            .unwrap();
        matcher
            .find_matches("acme/api", &traceback(), &cancel)
            .await
            .unwrap();
        assert_eq!(vcs.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn results_are_capped_at_max_search_results() {
        let results: Vec<IssueSearchResult> = (1..=30)
            .map(|n| search_result(issue(n, "ValueError: bad int", "", IssueState::Open)))
            .collect();
        let config = MatchingConfig {
            max_search_results: 5,
            ..MatchingConfig::default()
        };
        let matcher = matcher_with(Arc::new(StubVcs::new(results)), config);
        let matches = matcher
            .find_matches("acme/api", &traceback(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(matches.len(), 5);
    }
}
