//! Agent lifecycle: wiring, bounded concurrency, graceful shutdown.
//!
//! The agent owns the provider handles, the pipeline, the clone cache, and
//! the metrics registry, and passes them by reference — no globals. One
//! drainer task reads the inbound stream; each message runs on its own
//! worker task behind a `Semaphore(max_concurrent)` permit, so a saturated
//! pool applies backpressure to the drainer instead of queueing unbounded
//! work.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracebot_protocol::Result;
use tracebot_protocol::models::ProcessingResult;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::analyzer::CodeAnalyzer;
use crate::clone_cache::CloneCache;
use crate::clone_cache::Cloner;
use crate::config::AgentConfig;
use crate::matcher::IssueMatcher;
use crate::metrics::MetricsRegistry;
use crate::pipeline::MessageHandler;
use crate::providers::ChatProvider;
use crate::providers::LlmProvider;
use crate::providers::VcsProvider;
use crate::redact::SecretRedactor;
use crate::traceback::TracebackParser;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AgentStats {
    pub messages_processed: u64,
    pub errors: u64,
    pub active_workers: u64,
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    errors: AtomicU64,
}

pub struct Agent {
    chat: Arc<dyn ChatProvider>,
    handler: Arc<MessageHandler>,
    clone_cache: Arc<CloneCache>,
    config: Arc<AgentConfig>,
    metrics: Arc<MetricsRegistry>,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
    started: AtomicBool,
    stopped: AtomicBool,
    drainer: StdMutex<Option<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl Agent {
    /// Build a production agent with a `git`-backed clone cache.
    pub fn new(
        config: AgentConfig,
        chat: Arc<dyn ChatProvider>,
        vcs: Arc<dyn VcsProvider>,
        llm: Arc<dyn LlmProvider>,
    ) -> Result<Self> {
        config.validate()?;
        let metrics = Arc::new(MetricsRegistry::new());
        let redactor =
            Arc::new(SecretRedactor::new()?.with_metrics(Arc::clone(&metrics)));
        let clone_cache = Arc::new(CloneCache::with_git(
            config.clone_cache.clone(),
            Arc::clone(&redactor),
            Arc::clone(&metrics),
        ));
        Self::assemble(config, chat, vcs, llm, redactor, clone_cache, metrics)
    }

    /// Build an agent with a caller-supplied cloner (used by tests and
    /// hosts that front cloning differently).
    pub fn with_cloner(
        config: AgentConfig,
        chat: Arc<dyn ChatProvider>,
        vcs: Arc<dyn VcsProvider>,
        llm: Arc<dyn LlmProvider>,
        cloner: Arc<dyn Cloner>,
    ) -> Result<Self> {
        config.validate()?;
        let metrics = Arc::new(MetricsRegistry::new());
        let redactor =
            Arc::new(SecretRedactor::new()?.with_metrics(Arc::clone(&metrics)));
        let clone_cache = Arc::new(CloneCache::new(
            config.clone_cache.clone(),
            cloner,
            Arc::clone(&metrics),
        ));
        Self::assemble(config, chat, vcs, llm, redactor, clone_cache, metrics)
    }

    fn assemble(
        config: AgentConfig,
        chat: Arc<dyn ChatProvider>,
        vcs: Arc<dyn VcsProvider>,
        llm: Arc<dyn LlmProvider>,
        redactor: Arc<SecretRedactor>,
        clone_cache: Arc<CloneCache>,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let semantic_llm = config
            .matching
            .semantic_scoring
            .then(|| Arc::clone(&llm));
        let matcher = IssueMatcher::new(
            Arc::clone(&vcs),
            semantic_llm,
            config.matching.clone(),
            config.retry.policy(),
            Arc::clone(&metrics),
        );
        let analyzer = CodeAnalyzer::new(
            Arc::clone(&clone_cache),
            Arc::clone(&vcs),
            Arc::clone(&redactor),
            config.analysis.clone(),
            Arc::clone(&metrics),
        );
        let handler = Arc::new(MessageHandler::new(
            Arc::clone(&chat),
            vcs,
            llm,
            TracebackParser::new(),
            matcher,
            analyzer,
            redactor,
            Arc::clone(&config),
            Arc::clone(&metrics),
        ));
        let semaphore = Arc::new(Semaphore::new(config.runtime.max_concurrent));

        Ok(Self {
            chat,
            handler,
            clone_cache,
            config,
            metrics,
            semaphore,
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            drainer: StdMutex::new(None),
            counters: Arc::new(Counters::default()),
        })
    }

    pub fn stats(&self) -> AgentStats {
        let available = self.semaphore.available_permits() as u64;
        let max = self.config.runtime.max_concurrent as u64;
        AgentStats {
            messages_processed: self.counters.processed.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            active_workers: max.saturating_sub(available),
        }
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// Connect to chat and spawn the drainer. Returns once the agent is
    /// running; call [`Agent::stop`] to shut down.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("agent already started");
            return Ok(());
        }

        info!("connecting to chat provider");
        let inbound = self.chat.connect().await?;
        info!("chat provider connected, agent running");

        self.clone_cache.start_sweeper();

        let agent = Arc::clone(self);
        let handle = tokio::spawn(async move { agent.drain(inbound).await });
        *self.drainer.lock().expect("agent lock") = Some(handle);
        Ok(())
    }

    /// Drain the inbound stream until cancelled, then wait out in-flight
    /// workers within the shutdown grace period and hard-cancel the rest.
    async fn drain(self: Arc<Self>, inbound: async_channel::Receiver<
        tracebot_protocol::models::ChatMessage,
    >) {
        let mut workers: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,

                received = inbound.recv() => {
                    let Ok(message) = received else {
                        info!("inbound stream closed");
                        break;
                    };

                    // Backpressure: wait for a free permit before
                    // dispatching; new messages queue in the channel.
                    let permit = tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        permit = Arc::clone(&self.semaphore).acquire_owned() => {
                            match permit {
                                Ok(permit) => permit,
                                Err(_) => break,
                            }
                        }
                    };

                    let handler = Arc::clone(&self.handler);
                    let counters = Arc::clone(&self.counters);
                    let cancel = self.cancel.clone();
                    workers.spawn(async move {
                        let result = handler.handle(&message, &cancel).await;
                        counters.processed.fetch_add(1, Ordering::Relaxed);
                        if result == ProcessingResult::Error {
                            counters.errors.fetch_add(1, Ordering::Relaxed);
                        }
                        drop(permit);
                    });
                }

                // Reap finished workers so the set does not grow unbounded.
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    if let Err(err) = joined
                        && !err.is_cancelled()
                    {
                        error!(error = %err, "pipeline worker panicked");
                    }
                }
            }
        }

        let grace = self.config.runtime.shutdown_timeout();
        debug!(in_flight = workers.len(), ?grace, "draining in-flight workers");
        let drained = tokio::time::timeout(grace, async {
            while workers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = workers.len(), "grace period elapsed, aborting workers");
            workers.abort_all();
            while workers.join_next().await.is_some() {}
        }
    }

    /// Graceful stop: refuse new dispatches, wait out in-flight workers,
    /// disconnect, sweep the clone cache. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            debug!("agent already stopped");
            return;
        }
        info!("agent stopping");
        self.cancel.cancel();

        let handle = self.drainer.lock().expect("agent lock").take();
        if let Some(handle) = handle {
            let grace = self.config.runtime.shutdown_timeout() + std::time::Duration::from_secs(5);
            if tokio::time::timeout(grace, handle).await.is_err() {
                warn!("drainer did not stop within grace period");
            }
        }

        if let Err(err) = self.chat.disconnect().await {
            warn!(error = %err, "chat disconnect failed");
        }
        self.clone_cache.shutdown().await;

        let stats = self.stats();
        info!(
            messages_processed = stats.messages_processed,
            errors = stats.errors,
            "agent stopped"
        );
        for sample in self.metrics.snapshot() {
            debug!(metric = sample.name, value = sample.value, ?sample.labels, "final metric");
        }
    }
}
