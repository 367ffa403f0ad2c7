use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::scheduler::Shutdown;
use crate::types::InboundMessage;

/// Telegram rejects messages longer than this many characters.
pub const MESSAGE_LIMIT: usize = 4096;

#[derive(Debug, Error)]
pub enum SendError {
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// Push-message API: outbound text plus inbound operator messages.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, chat_id: &str, text: &str, silent: bool) -> Result<(), SendError>;

    /// Messages with `update_id >= offset`, oldest first.
    async fn poll(&self, offset: i64) -> Result<Vec<InboundMessage>>;
}

#[derive(Clone)]
pub struct TelegramTransport {
    http: Client,
    base: String,
    poll_timeout: Duration,
}

impl TelegramTransport {
    pub fn new(token: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| anyhow!("telegram client init failed: {e}"))?;
        Ok(Self {
            http,
            base: format!("https://api.telegram.org/bot{token}"),
            poll_timeout: Duration::from_secs(10),
        })
    }
}

#[derive(Debug, Deserialize)]
struct ApiReply<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    parameters: Option<ApiParameters>,
}

#[derive(Debug, Deserialize)]
struct ApiParameters {
    retry_after: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    message: Option<Message>,
}

#[derive(Debug, Deserialize)]
struct Message {
    chat: Chat,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
}

#[async_trait]
impl Transport for TelegramTransport {
    async fn send(&self, chat_id: &str, text: &str, silent: bool) -> Result<(), SendError> {
        let res = self
            .http
            .post(format!("{}/sendMessage", self.base))
            .json(&json!({
                "chat_id": chat_id,
                "text": text,
                "parse_mode": "HTML",
                "disable_web_page_preview": true,
                "disable_notification": silent,
            }))
            .send()
            .await
            .map_err(|e| SendError::Failed(e.into()))?;

        let status = res.status();
        if status.is_success() {
            return Ok(());
        }

        let reply: Option<ApiReply<serde_json::Value>> = res.json().await.ok();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let secs = reply
                .as_ref()
                .and_then(|r| r.parameters.as_ref())
                .and_then(|p| p.retry_after)
                .unwrap_or(1);
            return Err(SendError::RateLimited {
                retry_after: Duration::from_secs(secs),
            });
        }

        let why = reply.and_then(|r| r.description).unwrap_or_default();
        Err(SendError::Failed(anyhow!("sendMessage http {}: {why}", status.as_u16())))
    }

    async fn poll(&self, offset: i64) -> Result<Vec<InboundMessage>> {
        let reply: ApiReply<Vec<Update>> = self
            .http
            .get(format!("{}/getUpdates", self.base))
            .query(&[
                ("offset", offset.to_string()),
                ("timeout", self.poll_timeout.as_secs().to_string()),
                ("allowed_updates", r#"["message"]"#.to_string()),
            ])
            .timeout(self.poll_timeout + Duration::from_secs(10))
            .send()
            .await?
            .json()
            .await?;

        if !reply.ok {
            return Err(anyhow!(
                "getUpdates failed: {}",
                reply.description.unwrap_or_default()
            ));
        }

        Ok(reply
            .result
            .unwrap_or_default()
            .into_iter()
            .map(|u| {
                let (chat_id, text) = match u.message {
                    Some(m) => (m.chat.id.to_string(), m.text.unwrap_or_default()),
                    None => (String::new(), String::new()),
                };
                InboundMessage {
                    update_id: u.update_id,
                    chat_id,
                    text,
                }
            })
            .collect())
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

/// Delivers text to the configured recipient with chunking and retries.
#[derive(Clone)]
pub struct Notifier {
    transport: std::sync::Arc<dyn Transport>,
    chat_id: String,
    policy: RetryPolicy,
    shutdown: Shutdown,
}

impl Notifier {
    pub fn new(
        transport: std::sync::Arc<dyn Transport>,
        chat_id: impl Into<String>,
        policy: RetryPolicy,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            transport,
            chat_id: chat_id.into(),
            policy,
            shutdown,
        }
    }

    pub fn transport(&self) -> &std::sync::Arc<dyn Transport> {
        &self.transport
    }

    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    /// Sends every chunk of `text`; false if any chunk ran out of retries.
    /// Chunks are independent, so a failure can leave a partial delivery.
    pub async fn notify(&self, text: &str, silent: bool) -> bool {
        let mut delivered = true;
        for chunk in split_message(text, MESSAGE_LIMIT) {
            if !self.send_chunk(&chunk, silent).await {
                delivered = false;
            }
        }
        delivered
    }

    async fn send_chunk(&self, chunk: &str, silent: bool) -> bool {
        let mut failures = 0;
        loop {
            match self.transport.send(&self.chat_id, chunk, silent).await {
                Ok(()) => return true,
                Err(SendError::RateLimited { retry_after }) => {
                    debug!(?retry_after, "rate limited by transport");
                    if !self.shutdown.sleep(retry_after).await {
                        return false;
                    }
                }
                Err(SendError::Failed(e)) => {
                    failures += 1;
                    warn!(error=%e, attempt=failures, "send failed");
                    if failures >= self.policy.attempts {
                        return false;
                    }
                    if !self.shutdown.sleep(self.policy.delay).await {
                        return false;
                    }
                }
            }
        }
    }
}

/// Splits on line boundaries where possible; a single overlong line is cut at
/// character boundaries.
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    if text.chars().count() <= limit {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for line in text.split_inclusive('\n') {
        let line_len = line.chars().count();
        if current_len + line_len > limit && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if line_len > limit {
            let chars: Vec<char> = line.chars().collect();
            for piece in chars.chunks(limit) {
                chunks.push(piece.iter().collect());
            }
            continue;
        }
        current.push_str(line);
        current_len += line_len;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Scripted transport: pops one canned outcome per send, succeeding once empty.
    #[derive(Default)]
    pub(crate) struct ScriptedTransport {
        pub outcomes: Mutex<VecDeque<Result<(), SendError>>>,
        pub sent: Mutex<Vec<(String, bool)>>,
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, _chat_id: &str, text: &str, silent: bool) -> Result<(), SendError> {
            let next = self.outcomes.lock().unwrap().pop_front();
            let outcome = next.unwrap_or(Ok(()));
            if outcome.is_ok() {
                self.sent.lock().unwrap().push((text.to_string(), silent));
            }
            outcome
        }

        async fn poll(&self, _offset: i64) -> Result<Vec<InboundMessage>> {
            Ok(Vec::new())
        }
    }

    fn notifier(t: Arc<ScriptedTransport>) -> Notifier {
        Notifier::new(
            t,
            "42",
            RetryPolicy {
                attempts: 3,
                delay: Duration::from_secs(2),
            },
            Shutdown::new().0,
        )
    }

    #[test]
    fn short_text_is_one_chunk() {
        assert_eq!(split_message("hello", 10), vec!["hello"]);
    }

    #[test]
    fn long_text_splits_on_lines() {
        let text = "aaaa\nbbbb\ncccc\n";
        let chunks = split_message(text, 10);
        assert_eq!(chunks, vec!["aaaa\nbbbb\n", "cccc\n"]);
        assert!(chunks.iter().all(|c| c.chars().count() <= 10));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn overlong_line_is_hard_cut() {
        let text = "x".repeat(25);
        let chunks = split_message(&text, 10);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.concat(), text);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures_then_succeeds() {
        let t = Arc::new(ScriptedTransport::default());
        t.outcomes
            .lock()
            .unwrap()
            .extend([Err(SendError::Failed(anyhow!("boom"))), Err(SendError::Failed(anyhow!("boom")))]);
        assert!(notifier(t.clone()).notify("hi", true).await);
        assert_eq!(t.sent.lock().unwrap().as_slice(), &[("hi".to_string(), true)]);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_retry_budget() {
        let t = Arc::new(ScriptedTransport::default());
        t.outcomes
            .lock()
            .unwrap()
            .extend((0..3).map(|_| Err(SendError::Failed(anyhow!("down")))));
        assert!(!notifier(t.clone()).notify("hi", false).await);
        assert!(t.sent.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_does_not_consume_budget() {
        let t = Arc::new(ScriptedTransport::default());
        {
            let mut q = t.outcomes.lock().unwrap();
            for _ in 0..5 {
                q.push_back(Err(SendError::RateLimited {
                    retry_after: Duration::from_secs(3),
                }));
            }
            q.push_back(Err(SendError::Failed(anyhow!("blip"))));
            q.push_back(Err(SendError::Failed(anyhow!("blip"))));
        }
        let started = tokio::time::Instant::now();
        assert!(notifier(t.clone()).notify("hi", false).await);
        assert_eq!(t.sent.lock().unwrap().len(), 1);
        assert!(started.elapsed() >= Duration::from_secs(15 + 4));
    }
}
