//! Root of the `tracebot-core` library.
//!
//! Five tightly coupled subsystems make up the core: the traceback
//! detector/parser, the issue matcher, the code analyzer with its clone
//! cache, the per-message pipeline, and the secret redactor + safe command
//! wrapper that every outbound byte passes through. The [`agent::Agent`]
//! wires them to the chat/VCS/LLM provider seams.

// Library code must not write to stdout/stderr directly; everything
// user-visible goes through the tracing stack or the chat provider.
#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod adapters;
pub mod agent;
pub mod analyzer;
pub mod clone_cache;
pub mod config;
pub mod dedup;
pub mod matcher;
pub mod metrics;
pub mod pipeline;
pub mod prompts;
pub mod providers;
pub mod redact;
pub mod retry;
pub mod safe_cmd;
pub mod traceback;

pub use agent::Agent;
pub use agent::AgentStats;
pub use config::AgentConfig;
pub use pipeline::MessageHandler;
pub use providers::ChatProvider;
pub use providers::LlmProvider;
pub use providers::VcsProvider;
pub use traceback::TracebackParser;
