//! Streaming LLM client (OpenAI-compatible chat completions)
//!
//! Opens `POST {base}/v1/chat/completions` with `stream: true` and yields
//! token deltas as they arrive. The HTTP client keeps a bounded keep-alive
//! pool so consecutive utterances reuse connections; time-to-first-token is
//! the metric everything here optimizes for.

use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::config::LlmConfig;
use crate::error::UpstreamError;

const MAX_CONNECTIONS_IDLE: usize = 20;
const KEEPALIVE_EXPIRY: Duration = Duration::from_secs(60);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// One message of the chat-completions payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".to_string(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: "assistant".to_string(), content: content.into() }
    }
}

/// Per-request generation parameters (from the agent profile).
#[derive(Debug, Clone)]
pub struct LlmParams {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Opens streaming completions. The seam lets tests script token sequences
/// without a network.
#[async_trait]
pub trait LlmStreamer: Send + Sync {
    async fn open(
        &self,
        params: &LlmParams,
        messages: &[ChatMessage],
    ) -> Result<Box<dyn TokenStreamer>, UpstreamError>;
}

/// One live token stream.
#[async_trait]
pub trait TokenStreamer: Send {
    /// Next content delta; `Ok(None)` at end of stream.
    async fn next_token(&mut self) -> Result<Option<String>, UpstreamError>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    temperature: f32,
    max_tokens: u32,
}

/// Pooled chat-completions client.
#[derive(Clone)]
pub struct LlmClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl LlmClient {
    pub fn new(config: &LlmConfig) -> Self {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(MAX_CONNECTIONS_IDLE)
            .pool_idle_timeout(KEEPALIVE_EXPIRY)
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        }
    }

    /// Open a streaming completion. The caller drives [`TokenStream`] and
    /// owns cancellation.
    pub async fn open_stream(
        &self,
        params: &LlmParams,
        messages: &[ChatMessage],
    ) -> Result<TokenStream, UpstreamError> {
        let request = ChatRequest {
            model: &params.model,
            messages,
            stream: true,
            temperature: params.temperature,
            max_tokens: params.max_tokens,
        };

        debug!(model = %params.model, messages = messages.len(), "opening LLM stream");
        let response = self
            .http
            .post(format!("{}/v1/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(UpstreamError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::from_status(status.as_u16(), body));
        }

        Ok(TokenStream {
            bytes: Box::pin(response.bytes_stream()),
            line_buf: String::new(),
            pending: VecDeque::new(),
            done: false,
        })
    }
}

#[async_trait]
impl LlmStreamer for LlmClient {
    async fn open(
        &self,
        params: &LlmParams,
        messages: &[ChatMessage],
    ) -> Result<Box<dyn TokenStreamer>, UpstreamError> {
        let stream = self.open_stream(params, messages).await?;
        Ok(Box::new(stream))
    }
}

#[async_trait]
impl TokenStreamer for TokenStream {
    async fn next_token(&mut self) -> Result<Option<String>, UpstreamError> {
        TokenStream::next_token(self).await
    }
}

/// Incremental token reader over the SSE byte stream.
pub struct TokenStream {
    bytes: Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>,
    line_buf: String,
    pending: VecDeque<String>,
    done: bool,
}

impl TokenStream {
    /// Next content delta; `Ok(None)` when the stream is finished
    /// (`data: [DONE]` or HTTP close).
    pub async fn next_token(&mut self) -> Result<Option<String>, UpstreamError> {
        loop {
            if let Some(tok) = self.pending.pop_front() {
                return Ok(Some(tok));
            }
            if self.done {
                return Ok(None);
            }

            match self.bytes.next().await {
                Some(Ok(chunk)) => {
                    self.line_buf.push_str(&String::from_utf8_lossy(&chunk));
                    while let Some(pos) = self.line_buf.find('\n') {
                        let line: String = self.line_buf.drain(..=pos).collect();
                        match parse_sse_line(line.trim_end()) {
                            Some(SseEvent::Token(tok)) => self.pending.push_back(tok),
                            Some(SseEvent::Done) => {
                                self.done = true;
                                break;
                            }
                            None => {}
                        }
                    }
                }
                Some(Err(e)) => {
                    return Err(UpstreamError::Transient(format!("stream read failed: {e}")))
                }
                None => {
                    self.done = true;
                }
            }
        }
    }
}

enum SseEvent {
    Token(String),
    Done,
}

/// Parse one SSE line. Blank lines, `:` keep-alive comments, undecodable
/// chunks and empty deltas are all skipped.
fn parse_sse_line(line: &str) -> Option<SseEvent> {
    if line.is_empty() || line.starts_with(':') {
        return None;
    }
    let data = line.strip_prefix("data:")?.trim();
    if data == "[DONE]" {
        return Some(SseEvent::Done);
    }
    let chunk: Value = serde_json::from_str(data).ok()?;
    let content = chunk
        .get("choices")?
        .as_array()?
        .first()?
        .get("delta")?
        .get("content")?
        .as_str()?;
    if content.is_empty() {
        return None;
    }
    Some(SseEvent::Token(content.to_string()))
}

#[cfg(test)]
pub mod testing {
    //! Scripted streamer for pipeline tests.

    use super::*;
    use std::sync::Mutex;

    /// Replays pre-baked token sequences; each `open` consumes one script.
    pub struct ScriptedLlm {
        scripts: Mutex<VecDeque<Vec<String>>>,
        fail_open: bool,
        token_delay: Duration,
    }

    impl ScriptedLlm {
        pub fn new(scripts: Vec<Vec<&str>>) -> Self {
            Self::with_delay(scripts, Duration::ZERO)
        }

        /// Slow stream: waits `token_delay` before every token, keeping the
        /// generation "in flight" while a test drives the pipeline.
        pub fn with_delay(scripts: Vec<Vec<&str>>, token_delay: Duration) -> Self {
            Self {
                scripts: Mutex::new(
                    scripts
                        .into_iter()
                        .map(|s| s.into_iter().map(str::to_string).collect())
                        .collect(),
                ),
                fail_open: false,
                token_delay,
            }
        }

        pub fn failing() -> Self {
            Self {
                scripts: Mutex::new(VecDeque::new()),
                fail_open: true,
                token_delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl LlmStreamer for ScriptedLlm {
        async fn open(
            &self,
            _params: &LlmParams,
            _messages: &[ChatMessage],
        ) -> Result<Box<dyn TokenStreamer>, UpstreamError> {
            if self.fail_open {
                return Err(UpstreamError::Client {
                    status: 401,
                    body: "invalid key".into(),
                });
            }
            let tokens = self.scripts.lock().unwrap().pop_front().unwrap_or_default();
            Ok(Box::new(ScriptedStream {
                tokens: tokens.into(),
                delay: self.token_delay,
                started: false,
            }))
        }
    }

    pub struct ScriptedStream {
        tokens: VecDeque<String>,
        delay: Duration,
        started: bool,
    }

    #[async_trait]
    impl TokenStreamer for ScriptedStream {
        async fn next_token(&mut self) -> Result<Option<String>, UpstreamError> {
            if !self.started || self.delay.is_zero() {
                // first token lands immediately; yield so queued control
                // events interleave the way a network stream would
                self.started = true;
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(self.delay).await;
            }
            Ok(self.tokens.pop_front())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_content_delta() {
        let line = r#"data: {"choices":[{"delta":{"content":"Привет"}}]}"#;
        match parse_sse_line(line) {
            Some(SseEvent::Token(t)) => assert_eq!(t, "Привет"),
            _ => panic!("expected token"),
        }
    }

    #[test]
    fn recognizes_done_marker() {
        assert!(matches!(parse_sse_line("data: [DONE]"), Some(SseEvent::Done)));
    }

    #[test]
    fn skips_keepalive_and_garbage() {
        assert!(parse_sse_line("").is_none());
        assert!(parse_sse_line(": keep-alive").is_none());
        assert!(parse_sse_line("event: ping").is_none());
        assert!(parse_sse_line("data: {broken json").is_none());
        assert!(parse_sse_line(r#"data: {"choices":[]}"#).is_none());
        assert!(parse_sse_line(r#"data: {"choices":[{"delta":{}}]}"#).is_none());
    }

    #[test]
    fn chat_message_roles() {
        assert_eq!(ChatMessage::system("s").role, "system");
        assert_eq!(ChatMessage::user("u").role, "user");
        assert_eq!(ChatMessage::assistant("a").role, "assistant");
    }
}
