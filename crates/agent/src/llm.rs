//! Model backend boundary: a message list and system instruction in, a
//! stream of assistant text bytes out.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use invoicey_core::config::{LlmConfig, LlmProvider};
use invoicey_core::errors::ApplicationError;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use thiserror::Error;

use crate::conversation::Message;

pub type TextChunkStream = BoxStream<'static, Result<Bytes, TransportError>>;

const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request to model backend failed: {0}")]
    Request(String),
    #[error("model backend returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("model backend reported an error: {0}")]
    Upstream(String),
    #[error("could not decode model backend stream: {0}")]
    Decode(String),
    #[error("model backend did not finish within {0:?}")]
    Timeout(Duration),
    #[error("stream was cancelled")]
    Cancelled,
}

impl TransportError {
    /// Text appended to the conversation in place of the assistant reply.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Timeout(_) => {
                "Sorry, that took too long to answer. Your invoice was not changed; please try again."
            }
            Self::Cancelled => "The reply was cancelled. Your invoice was not changed.",
            Self::Request(_) | Self::Status { .. } | Self::Upstream(_) | Self::Decode(_) => {
                "Sorry, I couldn't reach the assistant just now. Your invoice was not changed; please try again."
            }
        }
    }
}

impl From<TransportError> for ApplicationError {
    fn from(value: TransportError) -> Self {
        Self::Integration(value.to_string())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatRequest {
    pub system: String,
    pub messages: Vec<Message>,
}

#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn stream_chat(&self, request: ChatRequest) -> Result<TextChunkStream, TransportError>;
}

/// Streams chat completions from an OpenAI-compatible, Anthropic or Ollama
/// HTTP API.
pub struct HttpChatBackend {
    client: reqwest::Client,
    provider: LlmProvider,
    base_url: String,
    model: String,
    api_key: Option<SecretString>,
    max_tokens: u32,
}

impl HttpChatBackend {
    pub fn from_config(config: &LlmConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|error| TransportError::Request(error.to_string()))?;

        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| default_base_url(config.provider).to_string())
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            client,
            provider: config.provider,
            base_url,
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            max_tokens: config.max_tokens,
        })
    }

    fn endpoint(&self) -> String {
        match self.provider {
            LlmProvider::OpenAi => format!("{}/v1/chat/completions", self.base_url),
            LlmProvider::Anthropic => format!("{}/v1/messages", self.base_url),
            LlmProvider::Ollama => format!("{}/api/chat", self.base_url),
        }
    }

    fn request_body(&self, request: &ChatRequest) -> Value {
        let history = request
            .messages
            .iter()
            .map(|message| json!({ "role": message.role.as_str(), "content": message.content }))
            .collect::<Vec<_>>();

        match self.provider {
            LlmProvider::Anthropic => json!({
                "model": self.model,
                "max_tokens": self.max_tokens,
                "stream": true,
                "system": request.system,
                "messages": history,
            }),
            LlmProvider::OpenAi | LlmProvider::Ollama => {
                let mut messages = vec![json!({ "role": "system", "content": request.system })];
                messages.extend(history);
                let mut body = json!({
                    "model": self.model,
                    "stream": true,
                    "messages": messages,
                });
                if self.provider == LlmProvider::OpenAi {
                    body["max_tokens"] = json!(self.max_tokens);
                }
                body
            }
        }
    }
}

#[async_trait]
impl ChatBackend for HttpChatBackend {
    async fn stream_chat(&self, request: ChatRequest) -> Result<TextChunkStream, TransportError> {
        let mut builder = self.client.post(self.endpoint()).json(&self.request_body(&request));
        if let Some(api_key) = &self.api_key {
            builder = match self.provider {
                LlmProvider::Anthropic => builder
                    .header("x-api-key", api_key.expose_secret())
                    .header("anthropic-version", ANTHROPIC_VERSION),
                LlmProvider::OpenAi | LlmProvider::Ollama => {
                    builder.bearer_auth(api_key.expose_secret())
                }
            };
        }

        let response =
            builder.send().await.map_err(|error| TransportError::Request(error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(TransportError::Status { status: status.as_u16(), body });
        }

        tracing::debug!(
            event_name = "agent.llm.stream_opened",
            provider = ?self.provider,
            model = %self.model,
            "model backend stream opened"
        );

        Ok(decode_frames(response.bytes_stream().boxed(), self.provider))
    }
}

fn default_base_url(provider: LlmProvider) -> &'static str {
    match provider {
        LlmProvider::OpenAi => "https://api.openai.com",
        LlmProvider::Anthropic => "https://api.anthropic.com",
        LlmProvider::Ollama => "http://localhost:11434",
    }
}

struct FrameState {
    inner: BoxStream<'static, reqwest::Result<Bytes>>,
    decoder: FrameDecoder,
    pending: VecDeque<Bytes>,
    finished: bool,
}

fn decode_frames(
    inner: BoxStream<'static, reqwest::Result<Bytes>>,
    provider: LlmProvider,
) -> TextChunkStream {
    let state = FrameState {
        inner,
        decoder: FrameDecoder::new(provider),
        pending: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(text) = state.pending.pop_front() {
                return Some((Ok(text), state));
            }
            if state.finished {
                return None;
            }

            let decoded = match state.inner.next().await {
                Some(Ok(bytes)) => state.decoder.push(&bytes),
                Some(Err(error)) => Err(TransportError::Request(error.to_string())),
                None => {
                    state.finished = true;
                    state.decoder.finish()
                }
            };

            match decoded {
                Ok(deltas) => state.pending.extend(deltas.into_iter().map(Bytes::from)),
                Err(error) => {
                    state.finished = true;
                    state.pending.clear();
                    return Some((Err(error), state));
                }
            }
        }
    })
    .boxed()
}

/// Splits provider framing into lines and pulls the assistant text delta
/// out of each one.
#[derive(Debug)]
pub(crate) struct FrameDecoder {
    provider: LlmProvider,
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub(crate) fn new(provider: LlmProvider) -> Self {
        Self { provider, buffer: Vec::new() }
    }

    pub(crate) fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>, TransportError> {
        self.buffer.extend_from_slice(chunk);

        let mut deltas = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let line = self.buffer.drain(..=newline).collect::<Vec<_>>();
            if let Some(delta) = self.decode_line(&line[..line.len() - 1])? {
                deltas.push(delta);
            }
        }
        Ok(deltas)
    }

    pub(crate) fn finish(&mut self) -> Result<Vec<String>, TransportError> {
        let line = std::mem::take(&mut self.buffer);
        Ok(self.decode_line(&line)?.into_iter().collect())
    }

    fn decode_line(&self, raw: &[u8]) -> Result<Option<String>, TransportError> {
        let line = std::str::from_utf8(raw)
            .map_err(|error| TransportError::Decode(error.to_string()))?
            .trim_end_matches('\r');
        if line.trim().is_empty() {
            return Ok(None);
        }

        let payload = match self.provider {
            LlmProvider::Ollama => line,
            LlmProvider::OpenAi | LlmProvider::Anthropic => {
                let Some(data) = line.strip_prefix("data:") else {
                    // `event:`, `id:` and `:` comment lines carry no text.
                    return Ok(None);
                };
                let data = data.trim_start();
                if data == "[DONE]" {
                    return Ok(None);
                }
                data
            }
        };

        let value: Value = serde_json::from_str(payload)
            .map_err(|error| TransportError::Decode(format!("{error}: {payload}")))?;

        if let Some(message) = upstream_error(&value) {
            return Err(TransportError::Upstream(message));
        }

        let delta = match self.provider {
            LlmProvider::OpenAi => value.pointer("/choices/0/delta/content"),
            LlmProvider::Anthropic => {
                if value.get("type").and_then(Value::as_str) != Some("content_block_delta") {
                    return Ok(None);
                }
                value.pointer("/delta/text")
            }
            LlmProvider::Ollama => value.pointer("/message/content"),
        };

        Ok(delta.and_then(Value::as_str).filter(|text| !text.is_empty()).map(str::to_string))
    }
}

fn upstream_error(value: &Value) -> Option<String> {
    let error = value.get("error")?;
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .or_else(|| error.as_str())
        .unwrap_or("unknown error");
    Some(message.to_string())
}
