//! Agent configuration.
//!
//! The host hands the core a fully parsed [`AgentConfig`]; the CLI reads it
//! from a TOML file. Every recognized option has a default, so an empty
//! section (or an absent one) is always valid. `validate()` enforces the
//! cross-field rules: weights sum to one, repo names are well-formed, and
//! non-loopback Ollama hosts require the explicit opt-in.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use tracebot_protocol::Result;
use tracebot_protocol::TriageErr;

use crate::safe_cmd::validate_repo_name;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub matching: MatchingConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub clone_cache: CloneCacheConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub reactions: ReactionsConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub llm: LlmConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    /// Pipeline worker pool size.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Per-message wall-clock bound, seconds.
    #[serde(default = "default_processing_timeout_secs")]
    pub processing_timeout_secs: u64,
    /// Graceful-stop grace period, seconds.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl RuntimeConfig {
    pub fn processing_timeout(&self) -> Duration {
        Duration::from_secs(self.processing_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            processing_timeout_secs: default_processing_timeout_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

/// Composite-score weights. Must sum to 1.
#[derive(Debug, Clone, Deserialize)]
pub struct MatchWeights {
    pub type_match: f64,
    pub msg_match: f64,
    pub frame_overlap: f64,
    pub semantic: f64,
}

impl MatchWeights {
    pub fn sum(&self) -> f64 {
        self.type_match + self.msg_match + self.frame_overlap + self.semantic
    }
}

impl Default for MatchWeights {
    fn default() -> Self {
        Self {
            type_match: 0.3,
            msg_match: 0.4,
            frame_overlap: 0.2,
            semantic: 0.1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MatchingConfig {
    /// Cutoff for the link-vs-create decision (inclusive).
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    #[serde(default = "default_max_search_results")]
    pub max_search_results: usize,
    #[serde(default = "default_true")]
    pub include_closed: bool,
    #[serde(default = "default_search_cache_ttl_secs")]
    pub search_cache_ttl_secs: u64,
    /// Feed the LLM similarity signal into scoring. Off by default so the
    /// matching path stays free of model calls.
    #[serde(default)]
    pub semantic_scoring: bool,
    #[serde(default)]
    pub weights: MatchWeights,
}

impl MatchingConfig {
    pub fn search_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.search_cache_ttl_secs)
    }
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
            max_search_results: default_max_search_results(),
            include_closed: true,
            search_cache_ttl_secs: default_search_cache_ttl_secs(),
            semantic_scoring: false,
            weights: MatchWeights::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnalysisConfig {
    /// Lines of context on each side of the error line.
    #[serde(default = "default_context_lines")]
    pub context_lines: u32,
    /// Upper bound on emitted CodeContexts per traceback.
    #[serde(default = "default_max_files")]
    pub max_files: usize,
    #[serde(default = "default_skip_paths")]
    pub skip_paths: Vec<String>,
    /// Repo-root files always included when present (e.g. README.md).
    #[serde(default = "default_include_files")]
    pub include_files: Vec<String>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            context_lines: default_context_lines(),
            max_files: default_max_files(),
            skip_paths: default_skip_paths(),
            include_files: default_include_files(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CloneCacheConfig {
    #[serde(default = "default_clone_dir")]
    pub clone_dir: PathBuf,
    /// Maximum age of a cached clone, seconds.
    #[serde(default = "default_clone_cache_ttl_secs")]
    pub clone_cache_ttl_secs: u64,
    /// Per-clone disk quota, MiB.
    #[serde(default = "default_clone_max_size_mb")]
    pub clone_max_size_mb: u64,
    /// Combined quota across all cached clones, MiB.
    #[serde(default = "default_clone_max_total_size_mb")]
    pub max_total_size_mb: u64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

impl CloneCacheConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.clone_cache_ttl_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn max_clone_bytes(&self) -> u64 {
        self.clone_max_size_mb * 1024 * 1024
    }

    pub fn max_total_bytes(&self) -> u64 {
        self.max_total_size_mb * 1024 * 1024
    }
}

impl Default for CloneCacheConfig {
    fn default() -> Self {
        Self {
            clone_dir: default_clone_dir(),
            clone_cache_ttl_secs: default_clone_cache_ttl_secs(),
            clone_max_size_mb: default_clone_max_size_mb(),
            max_total_size_mb: default_clone_max_total_size_mb(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoutingConfig {
    /// Fallback repository when the channel has no mapping.
    #[serde(default)]
    pub default_repo: Option<String>,
    /// channel id -> repository.
    #[serde(default)]
    pub channel_repos: HashMap<String, String>,
    /// When non-empty, only these repos (exact or `org/*`) may be triaged.
    #[serde(default)]
    pub allowed_repos: Vec<String>,
    #[serde(default)]
    pub allow_public_repos: bool,
    #[serde(default = "default_labels")]
    pub default_labels: Vec<String>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            default_repo: None,
            channel_repos: HashMap::new(),
            allowed_repos: Vec::new(),
            allow_public_repos: false,
            default_labels: default_labels(),
        }
    }
}

impl RoutingConfig {
    /// Resolve the repository for a channel: explicit mapping first, then
    /// the default.
    pub fn repo_for_channel(&self, channel_id: &str) -> Option<&str> {
        self.channel_repos
            .get(channel_id)
            .map(String::as_str)
            .or(self.default_repo.as_deref())
    }

    /// An empty allowlist allows everything.
    pub fn is_repo_allowed(&self, repo: &str) -> bool {
        if self.allowed_repos.is_empty() {
            return true;
        }
        self.allowed_repos.iter().any(|allowed| {
            if let Some(org) = allowed.strip_suffix("/*") {
                repo.split('/').next() == Some(org)
            } else {
                allowed == repo
            }
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReactionsConfig {
    #[serde(default = "default_processing_reaction")]
    pub processing_reaction: String,
    #[serde(default = "default_complete_reaction")]
    pub complete_reaction: String,
    #[serde(default = "default_error_reaction")]
    pub error_reaction: String,
}

impl Default for ReactionsConfig {
    fn default() -> Self {
        Self {
            processing_reaction: default_processing_reaction(),
            complete_reaction: default_complete_reaction(),
            error_reaction: default_error_reaction(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_initial_delay_secs")]
    pub initial_delay_secs: f64,
    #[serde(default = "default_retry_max_delay_secs")]
    pub max_delay_secs: f64,
    #[serde(default = "default_retry_factor")]
    pub factor: f64,
}

impl RetryConfig {
    pub fn policy(&self) -> crate::retry::RetryPolicy {
        crate::retry::RetryPolicy {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_secs_f64(self.initial_delay_secs),
            max_delay: Duration::from_secs_f64(self.max_delay_secs),
            factor: self.factor,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_max_attempts(),
            initial_delay_secs: default_retry_initial_delay_secs(),
            max_delay_secs: default_retry_max_delay_secs(),
            factor: default_retry_factor(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    /// Base URL for a local Ollama deployment, when one is used.
    #[serde(default)]
    pub ollama_base_url: Option<String>,
    /// SSRF opt-in: permit non-loopback Ollama hosts.
    #[serde(default)]
    pub allow_remote_ollama_host: bool,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            max_output_tokens: default_max_output_tokens(),
            ollama_base_url: None,
            allow_remote_ollama_host: false,
        }
    }
}

impl AgentConfig {
    /// Cross-field validation; call once at startup before anything runs.
    pub fn validate(&self) -> Result<()> {
        let weights = &self.matching.weights;
        if (weights.sum() - 1.0).abs() > 1e-6 {
            return Err(TriageErr::InvalidInput(format!(
                "matching weights must sum to 1, got {}",
                weights.sum()
            )));
        }
        if !(0.0..=1.0).contains(&self.matching.confidence_threshold) {
            return Err(TriageErr::InvalidInput(
                "confidence_threshold must be within [0, 1]".to_string(),
            ));
        }

        if let Some(repo) = &self.routing.default_repo
            && !validate_repo_name(repo)
        {
            return Err(TriageErr::InvalidInput(format!(
                "invalid default_repo: {repo}"
            )));
        }
        for (channel, repo) in &self.routing.channel_repos {
            if !validate_repo_name(repo) {
                return Err(TriageErr::InvalidInput(format!(
                    "invalid repository for channel {channel}: {repo}"
                )));
            }
        }
        for allowed in &self.routing.allowed_repos {
            let is_wildcard = allowed.ends_with("/*");
            if !is_wildcard && !validate_repo_name(allowed) {
                return Err(TriageErr::InvalidInput(format!(
                    "invalid allowed_repos entry: {allowed}"
                )));
            }
        }

        if let Some(url) = &self.llm.ollama_base_url
            && !ollama_url_allowed(url, self.llm.allow_remote_ollama_host)
        {
            return Err(TriageErr::InvalidInput(format!(
                "ollama host not allowed without allow_remote_ollama_host: {url}"
            )));
        }

        if self.runtime.max_concurrent == 0 {
            return Err(TriageErr::InvalidInput(
                "max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(TriageErr::InvalidInput(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Loopback-only unless the caller opted into remote hosts.
pub fn ollama_url_allowed(url: &str, allow_remote: bool) -> bool {
    let Some(rest) = url.split("://").nth(1) else {
        return false;
    };
    let hostport = rest.split(['/', '?']).next().unwrap_or_default();
    let host = match hostport.strip_prefix('[') {
        // Bracketed IPv6 literal, e.g. `[::1]:11434`.
        Some(stripped) => stripped.split(']').next().unwrap_or_default(),
        None => hostport.split(':').next().unwrap_or_default(),
    };
    if host.is_empty() {
        return false;
    }
    let loopback = host == "localhost" || host == "::1" || host.starts_with("127.");
    loopback || allow_remote
}

fn default_max_concurrent() -> usize {
    5
}
fn default_processing_timeout_secs() -> u64 {
    300
}
fn default_shutdown_timeout_secs() -> u64 {
    30
}
fn default_confidence_threshold() -> f64 {
    0.85
}
fn default_max_search_results() -> usize {
    20
}
fn default_search_cache_ttl_secs() -> u64 {
    300
}
fn default_true() -> bool {
    true
}
fn default_context_lines() -> u32 {
    15
}
fn default_max_files() -> usize {
    10
}
fn default_skip_paths() -> Vec<String> {
    vec!["/usr/lib/python".to_string(), "site-packages".to_string()]
}
fn default_include_files() -> Vec<String> {
    vec!["README.md".to_string()]
}
fn default_clone_dir() -> PathBuf {
    std::env::temp_dir().join("tracebot").join("repos")
}
fn default_clone_cache_ttl_secs() -> u64 {
    3600
}
fn default_clone_max_size_mb() -> u64 {
    512
}
fn default_clone_max_total_size_mb() -> u64 {
    2048
}
fn default_cleanup_interval_secs() -> u64 {
    300
}
fn default_processing_reaction() -> String {
    "eyes".to_string()
}
fn default_complete_reaction() -> String {
    "white_check_mark".to_string()
}
fn default_error_reaction() -> String {
    "x".to_string()
}
fn default_labels() -> Vec<String> {
    vec!["auto-triaged".to_string()]
}
fn default_retry_max_attempts() -> u32 {
    3
}
fn default_retry_initial_delay_secs() -> f64 {
    1.0
}
fn default_retry_max_delay_secs() -> f64 {
    30.0
}
fn default_retry_factor() -> f64 {
    2.0
}
fn default_model() -> String {
    "claude-3-5-sonnet-20241022".to_string()
}
fn default_max_output_tokens() -> u32 {
    4096
}
