//! Agent lifecycle behavior: startup, stats, graceful and repeated stop.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tracebot_core::Agent;
use tracebot_core::AgentConfig;
use tracebot_core::ChatProvider;
use tracebot_core::LlmProvider;
use tracebot_core::VcsProvider;
use tracebot_core::clone_cache::Cloner;

use crate::common::MockChat;
use crate::common::MockCloner;
use crate::common::MockLlm;
use crate::common::MockVcs;
use crate::common::chat_message;
use crate::common::wait_until;

const WAIT: Duration = Duration::from_secs(5);

fn test_config(clone_dir: &std::path::Path) -> AgentConfig {
    let mut config = AgentConfig::default();
    config.routing.default_repo = Some("acme/api".to_string());
    config.clone_cache.clone_dir = clone_dir.to_path_buf();
    config.runtime.shutdown_timeout_secs = 2;
    config
}

#[tokio::test]
async fn processes_messages_and_counts_them() {
    let clone_dir = tempfile::tempdir().unwrap();
    let chat = Arc::new(MockChat::default());
    let agent = Arc::new(
        Agent::with_cloner(
            test_config(clone_dir.path()),
            Arc::clone(&chat) as Arc<dyn ChatProvider>,
            Arc::new(MockVcs::default()) as Arc<dyn VcsProvider>,
            Arc::new(MockLlm::default()) as Arc<dyn LlmProvider>,
            Arc::new(MockCloner::default()) as Arc<dyn Cloner>,
        )
        .unwrap(),
    );

    agent.start().await.unwrap();
    chat.deliver(chat_message("C1", "1.0", "nothing interesting")).await;
    chat.deliver(chat_message("C1", "2.0", "still nothing")).await;

    let agent_ref = Arc::clone(&agent);
    assert!(wait_until(move || agent_ref.stats().messages_processed >= 2, WAIT).await);
    assert_eq!(agent.stats().errors, 0);
    agent.stop().await;
}

#[tokio::test]
async fn start_and_stop_are_idempotent() {
    let clone_dir = tempfile::tempdir().unwrap();
    let chat = Arc::new(MockChat::default());
    let agent = Arc::new(
        Agent::with_cloner(
            test_config(clone_dir.path()),
            Arc::clone(&chat) as Arc<dyn ChatProvider>,
            Arc::new(MockVcs::default()) as Arc<dyn VcsProvider>,
            Arc::new(MockLlm::default()) as Arc<dyn LlmProvider>,
            Arc::new(MockCloner::default()) as Arc<dyn Cloner>,
        )
        .unwrap(),
    );

    agent.start().await.unwrap();
    // A second start is a no-op rather than a second drainer.
    agent.start().await.unwrap();

    agent.stop().await;
    agent.stop().await;
}

#[tokio::test]
async fn messages_after_stop_are_not_processed() {
    let clone_dir = tempfile::tempdir().unwrap();
    let chat = Arc::new(MockChat::default());
    let agent = Arc::new(
        Agent::with_cloner(
            test_config(clone_dir.path()),
            Arc::clone(&chat) as Arc<dyn ChatProvider>,
            Arc::new(MockVcs::default()) as Arc<dyn VcsProvider>,
            Arc::new(MockLlm::default()) as Arc<dyn LlmProvider>,
            Arc::new(MockCloner::default()) as Arc<dyn Cloner>,
        )
        .unwrap(),
    );

    agent.start().await.unwrap();
    agent.stop().await;

    chat.deliver(chat_message("C1", "9.0", "hello")).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(agent.stats().messages_processed, 0);
    assert!(chat.reactions().is_empty());
}
