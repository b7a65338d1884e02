//! `tracebot` binary: configuration loading, tracing setup, and agent
//! lifecycle. Credentials come from the environment (`SLACK_BOT_TOKEN`,
//! `SLACK_APP_TOKEN`, `ANTHROPIC_API_KEY`); everything else from the TOML
//! config file.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use clap::Subcommand;
use tracebot_core::Agent;
use tracebot_core::AgentConfig;
use tracebot_core::adapters::AnthropicLlm;
use tracebot_core::adapters::GhCliVcs;
use tracebot_core::adapters::SlackChat;
use tracebot_core::redact::SecretRedactor;
use tracebot_core::redact::mask_config_value;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tracebot", about = "Chat-driven Python error triage agent")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, short, default_value = "tracebot.toml", global = true)]
    config: PathBuf,

    /// Emit logs as JSON lines instead of human-readable text.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Connect to chat and process messages until interrupted (default).
    Run,
    /// Load and validate the configuration, then exit.
    Check,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: &Path) -> Result<AgentConfig> {
    let config: AgentConfig = if path.exists() {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?
    } else {
        AgentConfig::default()
    };
    config
        .validate()
        .with_context(|| format!("invalid configuration in {}", path.display()))?;
    Ok(config)
}

async fn run(config: AgentConfig) -> Result<()> {
    let redactor = Arc::new(SecretRedactor::new().context("failed to build redactor")?);

    let chat = Arc::new(
        SlackChat::from_env(Arc::clone(&redactor)).context("Slack credentials missing")?,
    );
    let vcs = Arc::new(GhCliVcs::new(Arc::clone(&redactor)));
    let llm = Arc::new(
        AnthropicLlm::from_env(&config.llm, Arc::clone(&redactor))
            .context("Anthropic credentials missing")?,
    );
    if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
        info!(
            model = config.llm.model.as_str(),
            api_key = mask_config_value("api_key", &key).as_str(),
            "LLM provider configured"
        );
    }

    let agent = Arc::new(Agent::new(config, chat, vcs, llm).context("failed to build agent")?);
    agent.start().await.context("failed to start agent")?;

    wait_for_shutdown_signal().await;
    info!("shutdown signal received");
    agent.stop().await;
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::SignalKind;
        use tokio::signal::unix::signal;
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn check(path: &Path) -> Result<()> {
    let config = load_config(path)?;
    println!("configuration OK: {}", path.display());
    if let Some(repo) = &config.routing.default_repo {
        println!("  default repo:     {repo}");
    }
    println!("  channel mappings: {}", config.routing.channel_repos.len());
    println!("  max concurrent:   {}", config.runtime.max_concurrent);
    println!(
        "  match threshold:  {}",
        config.matching.confidence_threshold
    );
    println!("  model:            {}", config.llm.model);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    match cli.command.unwrap_or(Command::Run) {
        Command::Check => check(&cli.config),
        Command::Run => {
            let config = load_config(&cli.config)?;
            run(config).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn missing_config_file_falls_back_to_defaults() {
        let config = load_config(Path::new("/nonexistent/tracebot.toml")).unwrap();
        assert_eq!(config.runtime.max_concurrent, 5);
    }

    #[test]
    fn config_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracebot.toml");
        std::fs::write(
            &path,
            r#"
                [routing]
                default_repo = "acme/api"

                [runtime]
                max_concurrent = 3
            "#,
        )
        .unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.runtime.max_concurrent, 3);
        assert_eq!(config.routing.default_repo.as_deref(), Some("acme/api"));
    }

    #[test]
    fn invalid_config_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracebot.toml");
        std::fs::write(
            &path,
            r#"
                [routing]
                default_repo = "not-a-repo-spec"
            "#,
        )
        .unwrap();
        assert!(load_config(&path).is_err());
    }
}
