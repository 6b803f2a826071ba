//! Scripted completion client for tests.

use async_trait::async_trait;
use futures::stream;
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::error::{Error, Result};

use super::client::{CompletionStream, LLMClient};
use super::types::{CompletionRequest, CompletionResponse, Provider, StopReason, StreamChunk};

/// Replays queued replies in order and records every request.
#[derive(Default)]
pub(crate) struct ScriptedClient {
    script: Mutex<VecDeque<Result<String>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedClient {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn reply(self, text: impl Into<String>) -> Self {
        self.push(Ok(text.into()));
        self
    }

    pub(crate) fn fail(self, error: Error) -> Self {
        self.push(Err(error));
        self
    }

    pub(crate) fn push(&self, item: Result<String>) {
        self.script.lock().unwrap().push_back(item);
    }

    pub(crate) fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub(crate) fn remaining(&self) -> usize {
        self.script.lock().unwrap().len()
    }

    fn next(&self, request: CompletionRequest) -> Result<String> {
        self.requests.lock().unwrap().push(request);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(Error::Internal("script exhausted".into())))
    }
}

#[async_trait]
impl LLMClient for ScriptedClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let text = self.next(request)?;
        Ok(CompletionResponse::from_text("scripted", text))
    }

    /// Splits the reply after each space so consumers see several increments.
    async fn stream(&self, request: CompletionRequest) -> Result<CompletionStream> {
        let text = self.next(request)?;
        let mut chunks: Vec<Result<StreamChunk>> = text
            .split_inclusive(' ')
            .map(|piece| Ok(StreamChunk::text(piece)))
            .collect();
        chunks.push(Ok(StreamChunk {
            content: String::new(),
            stop_reason: Some(StopReason::EndTurn),
        }));
        Ok(Box::pin(stream::iter(chunks)))
    }

    fn provider(&self) -> Provider {
        Provider::Ollama
    }
}
