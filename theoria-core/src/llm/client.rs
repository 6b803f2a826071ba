//! Completion client trait and the OpenAI-compatible implementation.

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, Stream, StreamExt};
use reqwest::{header::RETRY_AFTER, Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;
use tracing::debug;

use crate::context::Message;
use crate::error::{Error, Result, TransientKind};

use super::types::{
    CompletionRequest, CompletionResponse, Provider, StopReason, StreamChunk, TokenUsage,
};

/// A finite stream of completion increments.
pub type CompletionStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

/// Completion capability used by every agent phase.
#[async_trait]
pub trait LLMClient: Send + Sync {
    /// Complete a prompt.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse>;

    /// Stream a completion.
    ///
    /// Clients without native streaming yield the whole reply as one chunk.
    async fn stream(&self, request: CompletionRequest) -> Result<CompletionStream> {
        let response = self.complete(request).await?;
        let chunk = StreamChunk {
            content: response.content,
            stop_reason: response.stop_reason.or(Some(StopReason::EndTurn)),
        };
        Ok(Box::pin(stream::once(async move { Ok(chunk) })))
    }

    /// Get the provider for this client.
    fn provider(&self) -> Provider;
}

/// Configuration for completion clients.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub provider: Provider,
    /// API key; optional for local providers
    pub api_key: Option<String>,
    /// Base URL override
    pub base_url: Option<String>,
    /// Default model
    pub default_model: Option<String>,
    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl ClientConfig {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            api_key: None,
            base_url: None,
            default_model: None,
            timeout_secs: 120,
        }
    }

    /// Configuration with the key read from the provider's environment
    /// variable.
    pub fn from_env(provider: Provider) -> Result<Self> {
        let mut config = Self::new(provider);
        if let Some(var) = provider.api_key_env() {
            let key = std::env::var(var).map_err(|_| {
                Error::capability(provider.as_str(), format!("missing API key; set {var}"))
            })?;
            config.api_key = Some(key);
        }
        Ok(config)
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    fn base_url(&self) -> &str {
        self.base_url
            .as_deref()
            .unwrap_or_else(|| self.provider.default_base_url())
            .trim_end_matches('/')
    }

    fn model(&self) -> &str {
        self.default_model
            .as_deref()
            .unwrap_or_else(|| self.provider.default_model())
    }
}

/// Client for any OpenAI-compatible chat completions endpoint.
pub struct OpenAIClient {
    config: ClientConfig,
    http: Client,
}

impl OpenAIClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { config, http })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url())
    }

    fn build_request(&self, request: &CompletionRequest, stream: bool) -> OpenAIRequest {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = request.effective_system() {
            messages.push(OpenAIMessage {
                role: "system".to_string(),
                content: system,
            });
        }
        messages.extend(request.messages.iter().map(OpenAIMessage::from));

        OpenAIRequest {
            model: request
                .model
                .clone()
                .unwrap_or_else(|| self.config.model().to_string()),
            messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            stop: request.stop.clone(),
            stream,
        }
    }

    async fn send(&self, body: &OpenAIRequest) -> Result<reqwest::Response> {
        let provider = self.config.provider;
        let mut builder = self.http.post(self.endpoint()).json(body);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| classify_transport(provider, &e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<f64>().ok());
        let text = response.text().await.unwrap_or_default();
        Err(classify_status(provider, status, retry_after, &text))
    }
}

// OpenAI API types
#[derive(Debug, Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Serialize)]
struct OpenAIMessage {
    role: String,
    content: String,
}

impl From<&Message> for OpenAIMessage {
    fn from(message: &Message) -> Self {
        Self {
            role: message.role.to_string(),
            content: message.content.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    #[serde(default)]
    id: String,
    #[serde(default)]
    model: String,
    choices: Vec<OpenAIChoice>,
    #[serde(default)]
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIReplyMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIReplyMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamEvent {
    #[serde(default)]
    choices: Vec<OpenAIStreamChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamChoice {
    #[serde(default)]
    delta: Option<OpenAIDelta>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIDelta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIError {
    error: OpenAIErrorDetail,
}

#[derive(Debug, Deserialize)]
struct OpenAIErrorDetail {
    message: String,
}

/// Map a transport failure onto the error taxonomy.
fn classify_transport(provider: Provider, error: &reqwest::Error) -> Error {
    if error.is_timeout() {
        Error::transient(TransientKind::Timeout, error.to_string())
    } else if error.is_connect() || error.is_request() || error.is_body() {
        Error::transient(TransientKind::Network, error.to_string())
    } else {
        Error::capability(provider.as_str(), error.to_string())
    }
}

/// Map a non-success HTTP status onto the error taxonomy.
fn classify_status(
    provider: Provider,
    status: StatusCode,
    retry_after_secs: Option<f64>,
    body: &str,
) -> Error {
    let detail = serde_json::from_str::<OpenAIError>(body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| body.trim().to_string());
    let message = format!("{status}: {detail}");

    match status.as_u16() {
        429 => Error::transient(TransientKind::RateLimit { retry_after_secs }, message),
        408 | 504 => Error::transient(TransientKind::Timeout, message),
        500..=599 => Error::transient(TransientKind::Network, message),
        401 | 403 => Error::capability(
            provider.as_str(),
            format!("authentication failed ({message})"),
        ),
        _ => Error::capability(provider.as_str(), message),
    }
}

/// Incremental decoder for `text/event-stream` bodies.
#[derive(Debug)]
struct SseDecoder {
    provider: Provider,
    buffer: Vec<u8>,
    done: bool,
}

impl SseDecoder {
    fn new(provider: Provider) -> Self {
        Self {
            provider,
            buffer: Vec::new(),
            done: false,
        }
    }

    fn is_done(&self) -> bool {
        self.done
    }

    /// Feed raw bytes, returning every chunk completed by them.
    fn push(&mut self, bytes: &[u8]) -> Vec<Result<StreamChunk>> {
        self.buffer.extend_from_slice(bytes);
        let mut out = Vec::new();
        while !self.done {
            let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') else {
                break;
            };
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line);
            if let Some(item) = self.decode_line(line.trim_end()) {
                out.push(item);
            }
        }
        out
    }

    /// Flush a final unterminated line and stop.
    fn finish(&mut self) -> Vec<Result<StreamChunk>> {
        if self.done {
            return Vec::new();
        }
        let rest = std::mem::take(&mut self.buffer);
        let line = String::from_utf8_lossy(&rest);
        let out = self.decode_line(line.trim_end()).into_iter().collect();
        self.done = true;
        out
    }

    fn decode_line(&mut self, line: &str) -> Option<Result<StreamChunk>> {
        let data = line.strip_prefix("data:")?.trim_start();
        if data == "[DONE]" {
            self.done = true;
            return None;
        }

        if let Ok(err) = serde_json::from_str::<OpenAIError>(data) {
            self.done = true;
            return Some(Err(Error::capability(
                self.provider.as_str(),
                err.error.message,
            )));
        }

        match serde_json::from_str::<OpenAIStreamEvent>(data) {
            Ok(event) => {
                let choice = event.choices.into_iter().next()?;
                let content = choice.delta.and_then(|d| d.content).unwrap_or_default();
                let stop_reason = choice
                    .finish_reason
                    .as_deref()
                    .map(StopReason::from_finish_reason);
                if content.is_empty() && stop_reason.is_none() {
                    None
                } else {
                    Some(Ok(StreamChunk {
                        content,
                        stop_reason,
                    }))
                }
            }
            Err(e) => {
                self.done = true;
                Some(Err(Error::capability(
                    self.provider.as_str(),
                    format!("invalid stream event: {e}"),
                )))
            }
        }
    }
}

#[async_trait]
impl LLMClient for OpenAIClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let body = self.build_request(&request, false);
        debug!(
            provider = %self.config.provider,
            model = %body.model,
            phase = request.phase_or_default(),
            messages = body.messages.len(),
            "requesting completion"
        );

        let response = self.send(&body).await?;
        let text = response
            .text()
            .await
            .map_err(|e| classify_transport(self.config.provider, &e))?;

        let api_response: OpenAIResponse = serde_json::from_str(&text).map_err(|e| {
            Error::capability(
                self.config.provider.as_str(),
                format!("failed to parse response: {e}"),
            )
        })?;

        let choice = api_response.choices.into_iter().next().ok_or_else(|| {
            Error::capability(self.config.provider.as_str(), "no choices in response")
        })?;

        let usage = api_response
            .usage
            .map(|u| TokenUsage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            })
            .unwrap_or_default();

        Ok(CompletionResponse {
            id: api_response.id,
            model: if api_response.model.is_empty() {
                body.model
            } else {
                api_response.model
            },
            content: choice.message.content.unwrap_or_default(),
            stop_reason: choice
                .finish_reason
                .as_deref()
                .map(StopReason::from_finish_reason),
            usage,
            timestamp: Utc::now(),
        })
    }

    async fn stream(&self, request: CompletionRequest) -> Result<CompletionStream> {
        let body = self.build_request(&request, true);
        debug!(
            provider = %self.config.provider,
            model = %body.model,
            phase = request.phase_or_default(),
            "requesting streamed completion"
        );

        let provider = self.config.provider;
        let response = self.send(&body).await?;
        let bytes = Box::pin(response.bytes_stream());

        let chunks = stream::unfold(
            (bytes, SseDecoder::new(provider), VecDeque::new()),
            move |(mut bytes, mut decoder, mut pending)| async move {
                loop {
                    if let Some(item) = pending.pop_front() {
                        return Some((item, (bytes, decoder, pending)));
                    }
                    if decoder.is_done() {
                        return None;
                    }
                    match bytes.next().await {
                        Some(Ok(data)) => pending.extend(decoder.push(&data)),
                        Some(Err(e)) => {
                            decoder.finish();
                            pending.push_back(Err(classify_transport(provider, &e)));
                        }
                        None => pending.extend(decoder.finish()),
                    }
                }
            },
        );
        Ok(Box::pin(chunks))
    }

    fn provider(&self) -> Provider {
        self.config.provider
    }
}
