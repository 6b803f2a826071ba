//! Completion capability: the one place agents reach a language model.
//!
//! Agents depend only on the [`LLMClient`] trait. [`OpenAIClient`] speaks the
//! OpenAI chat completions protocol, which OpenAI, OpenRouter, DeepSeek, Groq,
//! Mistral and Ollama all accept, and [`RetryingClient`] adds backoff for
//! transient failures. Clients never retry on their own.
//!
//! ## Example
//!
//! ```rust,ignore
//! use theoria_core::llm::{ClientConfig, CompletionRequest, OpenAIClient, Provider, RetryingClient};
//! use theoria_core::context::Message;
//!
//! let client = RetryingClient::new(OpenAIClient::new(ClientConfig::from_env(Provider::OpenAI)?)?);
//! let request = CompletionRequest::new()
//!     .with_phase("clarify")
//!     .with_message(Message::user("Hello"));
//!
//! let response = client.complete(request).await?;
//! ```

mod client;
#[cfg(test)]
pub(crate) mod mock;
mod retry;
mod types;

pub use client::{ClientConfig, CompletionStream, LLMClient, OpenAIClient};
pub use retry::{RetryPolicy, RetryingClient};
pub use types::{
    CompletionRequest, CompletionResponse, Provider, StopReason, StreamChunk, TokenUsage,
};
