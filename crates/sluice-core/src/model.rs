//! Model API client.
//!
//! [`ModelClient`] is the seam the pipeline talks through; the production
//! implementation speaks the OpenAI-compatible `/v1/chat/completions`
//! streaming protocol over SSE, and [`MockModelClient`] replays canned
//! replies for tests.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            temperature: 0.7,
            max_tokens: None,
        }
    }
}

/// Stream of content deltas from one chat completion.
pub struct DeltaStream {
    rx: mpsc::Receiver<CoreResult<String>>,
}

impl DeltaStream {
    pub fn new(rx: mpsc::Receiver<CoreResult<String>>) -> Self {
        Self { rx }
    }

    /// Drain the stream into one string, failing on the first error.
    pub async fn collect_text(mut self) -> CoreResult<String> {
        let mut out = String::new();
        while let Some(delta) = self.next().await {
            out.push_str(&delta?);
        }
        Ok(out)
    }
}

impl Stream for DeltaStream {
    type Item = CoreResult<String>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Start a streaming chat completion.
    async fn stream_chat(&self, request: ChatRequest) -> CoreResult<DeltaStream>;

    /// Cheap liveness probe.
    async fn health_check(&self) -> bool;
}

/// Connection settings for the OpenAI-compatible endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub base_url: String,
    pub model: String,
    pub request_timeout_ms: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:1234".into(),
            model: "local-model".into(),
            request_timeout_ms: 120_000,
        }
    }
}

/// Production client speaking SSE to an OpenAI-compatible server.
pub struct HttpModelClient {
    config: ModelConfig,
    http: reqwest::Client,
}

#[derive(Serialize)]
struct CompletionBody<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
}

#[derive(Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

impl HttpModelClient {
    pub fn new(config: ModelConfig) -> CoreResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| CoreError::Transport(e.to_string()))?;
        Ok(Self { config, http })
    }

    fn completions_url(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl ModelClient for HttpModelClient {
    async fn stream_chat(&self, request: ChatRequest) -> CoreResult<DeltaStream> {
        let body = CompletionBody {
            model: &self.config.model,
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream: true,
        };
        let response = self
            .http
            .post(self.completions_url())
            .json(&body)
            .send()
            .await
            .map_err(|e| CoreError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(CoreError::Transport(format!(
                "model API returned {}",
                response.status()
            )));
        }

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut bytes = response.bytes_stream();
            let mut buffer = String::new();
            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = tx.send(Err(CoreError::Transport(e.to_string()))).await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));
                // SSE frames are newline-delimited `data: {json}` lines.
                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer.drain(..=pos);
                    let Some(payload) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let payload = payload.trim();
                    if payload == "[DONE]" {
                        return;
                    }
                    if let Ok(parsed) = serde_json::from_str::<StreamChunk>(payload) {
                        for choice in parsed.choices {
                            if let Some(content) = choice.delta.content {
                                if !content.is_empty() && tx.send(Ok(content)).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                }
            }
        });
        Ok(DeltaStream::new(rx))
    }

    async fn health_check(&self) -> bool {
        let url = format!("{}/v1/models", self.config.base_url.trim_end_matches('/'));
        match self.http.get(url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

/// Test double replaying canned replies as small deltas.
pub struct MockModelClient {
    replies: Mutex<VecDeque<CoreResult<String>>>,
    delta_size: usize,
    healthy: bool,
}

impl MockModelClient {
    pub fn new(replies: Vec<CoreResult<String>>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            delta_size: 16,
            healthy: true,
        }
    }

    pub fn with_delta_size(mut self, delta_size: usize) -> Self {
        self.delta_size = delta_size.max(1);
        self
    }

    /// What the health probe reports.
    pub fn with_health(mut self, healthy: bool) -> Self {
        self.healthy = healthy;
        self
    }

    fn next_reply(&self) -> CoreResult<String> {
        let mut replies = self
            .replies
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        replies
            .pop_front()
            .unwrap_or_else(|| Err(CoreError::Transport("mock is out of replies".into())))
    }
}

#[async_trait]
impl ModelClient for MockModelClient {
    async fn stream_chat(&self, _request: ChatRequest) -> CoreResult<DeltaStream> {
        let reply = self.next_reply()?;
        let (tx, rx) = mpsc::channel(64);
        let delta_size = self.delta_size;
        tokio::spawn(async move {
            let chars: Vec<char> = reply.chars().collect();
            for window in chars.chunks(delta_size) {
                let delta: String = window.iter().collect();
                if tx.send(Ok(delta)).await.is_err() {
                    return;
                }
            }
        });
        Ok(DeltaStream::new(rx))
    }

    async fn health_check(&self) -> bool {
        self.healthy
    }
}
