//! Retry with exponential backoff for transient completion failures.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

use crate::error::Result;

use super::client::{CompletionStream, LLMClient};
use super::types::{CompletionRequest, CompletionResponse, Provider};

/// Backoff schedule for transient failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first
    #[serde(alias = "max_retries")]
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub multiplier: f64,
    /// Cap on any single wait, including server hints
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Wait before retry number `retry` (0-based), honouring a server hint.
    pub fn delay_for(&self, retry: u32, retry_after_secs: Option<f64>) -> Duration {
        let computed = match retry_after_secs {
            Some(secs) if secs.is_finite() && secs >= 0.0 => secs * 1_000.0,
            _ => self.initial_delay_ms as f64 * self.multiplier.powi(retry as i32),
        };
        Duration::from_millis(computed.min(self.max_delay_ms as f64) as u64)
    }
}

/// Wraps a client and retries its transient failures.
pub struct RetryingClient<C> {
    inner: C,
    policy: RetryPolicy,
}

impl<C: LLMClient> RetryingClient<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    async fn retrying<T, F, Fut>(&self, phase: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: std::future::Future<Output = Result<T>> + Send,
        T: Send,
    {
        let mut retry = 0;
        loop {
            match call().await {
                Err(err) if err.is_transient() && retry + 1 < self.policy.max_attempts => {
                    let delay = self.policy.delay_for(retry, err.retry_after_secs());
                    warn!(
                        phase,
                        attempt = retry + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient completion failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl<C: LLMClient> LLMClient for RetryingClient<C> {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let phase = request.phase_or_default().to_string();
        self.retrying(&phase, || self.inner.complete(request.clone()))
            .await
    }

    /// Retries opening the stream; a failure after the first increment is
    /// passed through.
    async fn stream(&self, request: CompletionRequest) -> Result<CompletionStream> {
        let phase = request.phase_or_default().to_string();
        self.retrying(&phase, || self.inner.stream(request.clone()))
            .await
    }

    fn provider(&self) -> Provider {
        self.inner.provider()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, TransientKind};
    use crate::llm::mock::ScriptedClient;
    use std::time::Duration;

    #[test]
    fn test_default_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0, None), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1, None), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2, None), Duration::from_secs(4));
    }

    #[test]
    fn test_retry_after_overrides_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0, Some(7.5)), Duration::from_millis(7_500));
        assert_eq!(policy.delay_for(0, Some(600.0)), Duration::from_secs(60));
        assert_eq!(policy.delay_for(0, Some(f64::NAN)), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_then_succeeds() {
        let inner = ScriptedClient::new()
            .fail(Error::transient(TransientKind::Network, "reset"))
            .fail(Error::transient(
                TransientKind::RateLimit {
                    retry_after_secs: Some(0.5),
                },
                "429",
            ))
            .reply("finally");
        let client = RetryingClient::new(inner);

        let started = tokio::time::Instant::now();
        let response = client.complete(CompletionRequest::new()).await.unwrap();
        assert_eq!(response.content, "finally");
        assert_eq!(client.inner().calls(), 3);
        assert_eq!(started.elapsed(), Duration::from_millis(1_500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let inner = ScriptedClient::new()
            .fail(Error::transient(TransientKind::Timeout, "slow"))
            .fail(Error::transient(TransientKind::Timeout, "slow"))
            .fail(Error::transient(TransientKind::Timeout, "slow"))
            .reply("never reached");
        let client = RetryingClient::new(inner);

        let err = client.complete(CompletionRequest::new()).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(client.inner().calls(), 3);
        assert_eq!(client.inner().remaining(), 1);
    }

    #[tokio::test]
    async fn test_does_not_retry_permanent_errors() {
        let inner = ScriptedClient::new()
            .fail(Error::capability("openai", "401 Unauthorized"))
            .reply("unused");
        let client = RetryingClient::new(inner);

        let err = client.complete(CompletionRequest::new()).await.unwrap_err();
        assert!(matches!(err, Error::Capability { .. }));
        assert_eq!(client.inner().calls(), 1);
    }

    #[tokio::test]
    async fn test_no_retry_policy() {
        let inner =
            ScriptedClient::new().fail(Error::transient(TransientKind::Network, "down"));
        let client = RetryingClient::new(inner).with_policy(RetryPolicy::none());
        assert!(client.complete(CompletionRequest::new()).await.is_err());
        assert_eq!(client.inner().calls(), 1);
    }
}
