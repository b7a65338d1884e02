//! Production implementations of the provider seams.
//!
//! Slack over Socket Mode websockets, GitHub over the `gh` CLI (every
//! invocation goes through `safe_cmd`), and Anthropic over the Messages
//! API. All outbound content passes through the redactor before leaving
//! the process; LLM responses are re-validated by the pipeline regardless
//! of what an adapter returns.

pub mod anthropic;
pub mod github;
pub mod slack;

pub use anthropic::AnthropicLlm;
pub use github::GhCliVcs;
pub use slack::SlackChat;
