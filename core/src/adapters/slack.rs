//! Slack provider: Socket Mode ingress, Web API egress.
//!
//! The listener task opens a Socket Mode websocket, acks every envelope,
//! normalizes `message` events into [`ChatMessage`]s, and pushes them onto
//! the channel handed out by `connect()`. The connection is restartable:
//! on a disconnect envelope or socket error the listener reconnects after
//! a short delay. Every outbound reply passes through the redactor first.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use futures::SinkExt;
use futures::StreamExt;
use serde_json::Value;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracebot_protocol::Result;
use tracebot_protocol::TriageErr;
use tracebot_protocol::models::ChatMessage;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::providers::ChatProvider;
use crate::redact::SecretRedactor;

const API_BASE: &str = "https://slack.com/api/";
const RECONNECT_DELAY: Duration = Duration::from_secs(2);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const INBOUND_QUEUE: usize = 256;

const BOT_TOKEN_ENV: &str = "SLACK_BOT_TOKEN";
const APP_TOKEN_ENV: &str = "SLACK_APP_TOKEN";

/// Slack API error strings that mean "the state we wanted already holds".
const BENIGN_REACTION_ERRORS: &[&str] = &["already_reacted", "no_reaction"];

pub struct SlackChat {
    bot_token: String,
    app_token: String,
    client: reqwest::Client,
    redactor: Arc<SecretRedactor>,
    cancel: CancellationToken,
    listener: StdMutex<Option<JoinHandle<()>>>,
}

impl SlackChat {
    pub fn new(
        bot_token: String,
        app_token: String,
        redactor: Arc<SecretRedactor>,
    ) -> Result<Self> {
        if !bot_token.starts_with("xoxb-") {
            return Err(TriageErr::InvalidInput(
                "Slack bot token must start with xoxb-".to_string(),
            ));
        }
        if !app_token.starts_with("xapp-") {
            return Err(TriageErr::InvalidInput(
                "Slack app token must start with xapp-".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| TriageErr::Network(err.to_string()))?;
        Ok(Self {
            bot_token,
            app_token,
            client,
            redactor,
            cancel: CancellationToken::new(),
            listener: StdMutex::new(None),
        })
    }

    pub fn from_env(redactor: Arc<SecretRedactor>) -> Result<Self> {
        let bot_token = std::env::var(BOT_TOKEN_ENV)
            .map_err(|_| TriageErr::InvalidInput(format!("missing {BOT_TOKEN_ENV}")))?;
        let app_token = std::env::var(APP_TOKEN_ENV)
            .map_err(|_| TriageErr::InvalidInput(format!("missing {APP_TOKEN_ENV}")))?;
        Self::new(bot_token, app_token, redactor)
    }

    async fn api_call(&self, method: &str, token: &str, payload: Value) -> Result<Value> {
        let url = format!("{API_BASE}{method}");
        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&payload)
            .send()
            .await
            .map_err(|err| TriageErr::Network(format!("Slack request failed: {err}")))?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok())
            .map(Duration::from_secs);
        if status == 429 {
            return Err(TriageErr::RateLimit { retry_after });
        }
        if !(200..300).contains(&status) {
            return Err(TriageErr::Http {
                status,
                detail: format!("Slack API {method}"),
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|err| TriageErr::Network(format!("Slack returned non-JSON: {err}")))?;
        if body.get("ok").and_then(Value::as_bool).unwrap_or(false) {
            return Ok(body);
        }

        let error = body
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown_error")
            .to_string();
        Err(map_slack_error(&error, retry_after))
    }

    async fn open_socket_url(&self) -> Result<String> {
        let body = self
            .api_call("apps.connections.open", &self.app_token, json!({}))
            .await?;
        body.get("url")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| TriageErr::Network("Socket Mode open returned no url".to_string()))
    }

    async fn run_listener(self: Arc<Self>, tx: async_channel::Sender<ChatMessage>) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let url = match self.open_socket_url().await {
                Ok(url) => url,
                Err(err) => {
                    warn!(error = %err, "Socket Mode open failed, retrying");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue;
                }
            };
            if let Err(err) = self.listen_on_socket(&url, &tx).await {
                warn!(error = %err, "Socket Mode connection ended");
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
        debug!("Slack listener stopped");
    }

    async fn listen_on_socket(
        &self,
        url: &str,
        tx: &async_channel::Sender<ChatMessage>,
    ) -> Result<()> {
        let (mut socket, _) = connect_async(url)
            .await
            .map_err(|err| TriageErr::Network(format!("websocket connect failed: {err}")))?;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                next = socket.next() => {
                    let Some(next) = next else { return Ok(()); };
                    let message = next
                        .map_err(|err| TriageErr::Network(format!("websocket read failed: {err}")))?;
                    let Message::Text(text) = message else { continue };
                    let Ok(envelope) = serde_json::from_str::<Value>(&text) else { continue };

                    if let Some(envelope_id) =
                        envelope.get("envelope_id").and_then(Value::as_str)
                    {
                        let ack = json!({ "envelope_id": envelope_id }).to_string();
                        let _ = socket.send(Message::text(ack)).await;
                    }

                    match envelope.get("type").and_then(Value::as_str) {
                        Some("events_api") => {
                            if let Some(message) = normalize_event(&envelope) {
                                if tx.send(message).await.is_err() {
                                    return Ok(());
                                }
                            }
                        }
                        Some("disconnect") => {
                            info!("Slack requested reconnect");
                            return Ok(());
                        }
                        _ => {}
                    }
                }
            }
        }
    }
}

#[async_trait]
impl ChatProvider for SlackChat {
    async fn connect(&self) -> Result<async_channel::Receiver<ChatMessage>> {
        // Verify credentials before claiming to be connected.
        self.api_call("auth.test", &self.bot_token, json!({})).await?;

        let (tx, rx) = async_channel::bounded(INBOUND_QUEUE);
        let this = Arc::new(SlackChat {
            bot_token: self.bot_token.clone(),
            app_token: self.app_token.clone(),
            client: self.client.clone(),
            redactor: Arc::clone(&self.redactor),
            cancel: self.cancel.clone(),
            listener: StdMutex::new(None),
        });
        let handle = tokio::spawn(this.run_listener(tx));
        *self.listener.lock().expect("slack listener lock") = Some(handle);
        info!("Slack Socket Mode listener started");
        Ok(rx)
    }

    async fn disconnect(&self) -> Result<()> {
        self.cancel.cancel();
        let handle = self.listener.lock().expect("slack listener lock").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        Ok(())
    }

    async fn send_reply(
        &self,
        channel_id: &str,
        text: &str,
        thread_id: Option<&str>,
    ) -> Result<()> {
        // Fail closed: if redaction errors, nothing leaves the process.
        let text = self.redactor.redact(text)?;
        let mut payload = json!({ "channel": channel_id, "text": text });
        if let Some(thread_id) = thread_id {
            payload["thread_ts"] = Value::String(thread_id.to_string());
        }
        self.api_call("chat.postMessage", &self.bot_token, payload)
            .await?;
        Ok(())
    }

    async fn add_reaction(&self, channel_id: &str, message_id: &str, name: &str) -> Result<()> {
        let payload = json!({
            "channel": channel_id,
            "timestamp": message_id,
            "name": name,
        });
        match self.api_call("reactions.add", &self.bot_token, payload).await {
            Ok(_) => Ok(()),
            Err(err) if is_benign_reaction_error(&err) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn remove_reaction(&self, channel_id: &str, message_id: &str, name: &str) -> Result<()> {
        let payload = json!({
            "channel": channel_id,
            "timestamp": message_id,
            "name": name,
        });
        match self
            .api_call("reactions.remove", &self.bot_token, payload)
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if is_benign_reaction_error(&err) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

fn map_slack_error(error: &str, retry_after: Option<Duration>) -> TriageErr {
    match error {
        "ratelimited" => TriageErr::RateLimit { retry_after },
        "invalid_auth" | "not_authed" | "token_revoked" | "account_inactive" => {
            TriageErr::Authentication(format!("Slack: {error}"))
        }
        "missing_scope" | "restricted_action" => TriageErr::Permission(format!("Slack: {error}")),
        "channel_not_found" | "message_not_found" | "thread_not_found" => {
            TriageErr::NotFound(format!("Slack: {error}"))
        }
        other => TriageErr::Http {
            status: 200,
            detail: format!("Slack API error: {other}"),
        },
    }
}

fn is_benign_reaction_error(err: &TriageErr) -> bool {
    match err {
        TriageErr::Http { detail, .. } => BENIGN_REACTION_ERRORS
            .iter()
            .any(|benign| detail.contains(benign)),
        _ => false,
    }
}

/// Turn an `events_api` envelope into a [`ChatMessage`]. Bot messages,
/// edits, and other subtypes are dropped; user-name resolution is left to
/// the workspace directory (the id is carried through).
fn normalize_event(envelope: &Value) -> Option<ChatMessage> {
    let event = envelope.get("payload")?.get("event")?;
    if event.get("type").and_then(Value::as_str) != Some("message") {
        return None;
    }
    if event.get("subtype").is_some() || event.get("bot_id").is_some() {
        return None;
    }

    let channel_id = event.get("channel").and_then(Value::as_str)?.to_string();
    let ts = event.get("ts").and_then(Value::as_str)?.to_string();
    let user_id = event.get("user").and_then(Value::as_str)?.to_string();
    let text = event.get("text").and_then(Value::as_str)?.to_string();
    if text.is_empty() {
        return None;
    }

    let message_id = event
        .get("client_msg_id")
        .and_then(Value::as_str)
        .unwrap_or(ts.as_str())
        .to_string();
    let thread_id = event
        .get("thread_ts")
        .and_then(Value::as_str)
        .map(str::to_string);

    Some(ChatMessage {
        channel_id,
        message_id,
        thread_id,
        user_id: user_id.clone(),
        user_name: user_id,
        text,
        timestamp: parse_slack_ts(&ts).unwrap_or_else(Utc::now),
        raw_event: event.clone(),
    })
}

/// Slack timestamps look like `"1712345678.000100"`.
fn parse_slack_ts(ts: &str) -> Option<DateTime<Utc>> {
    let mut parts = ts.splitn(2, '.');
    let secs: i64 = parts.next()?.parse().ok()?;
    let micros: u32 = parts.next().unwrap_or("0").parse().ok()?;
    DateTime::from_timestamp(secs, micros * 1000)
}
