//! Exponential-backoff retry around a [`ProviderAdapter`] stream (§4.2).
//!
//! No adapter retries internally — this wrapper is the single place that decides whether a
//! mid-stream `Error` event is worth retrying, and if so, tears the stream down and restarts
//! it from scratch after a jittered delay. Generalizes the reconnect-with-backoff shape of
//! `http_client_pool.rs`'s connection handling into a stream-level retry that honors the
//! agent prompt's [`AbortSignal`] at every suspension point.

use crate::cloudllm::cancellation::AbortSignal;
use crate::cloudllm::context::AgentContext;
use crate::cloudllm::provider::{EventStream, ProviderAdapter, StreamEvent, StreamOptions};
use futures_util::stream::{self, StreamExt};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

/// Backoff parameters (§4.2 defaults: `maxRetries=3, baseDelay=1s, maxDelay=30s,
/// multiplier=2`).
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

/// `delayMs = min(baseDelay * multiplier^attempt, maxDelay) + uniform(0, 500ms)`, then
/// overridden by a server `Retry-After` if it's larger (still clamped to `maxDelay`).
fn compute_delay_ms(config: &RetryConfig, attempt: u32, retry_after_ms: Option<u64>) -> u64 {
    let exp = config.base_delay_ms as f64 * config.multiplier.powi(attempt as i32);
    let capped = exp.min(config.max_delay_ms as f64) as u64;
    let jitter = rand::thread_rng().gen_range(0..=500u64);
    let mut delay = capped + jitter;
    if let Some(retry_after) = retry_after_ms {
        if retry_after > delay {
            delay = retry_after.min(config.max_delay_ms);
        }
    }
    delay
}

pub struct RetryableStream;

impl RetryableStream {
    /// Wrap `adapter.stream(model_id, context, options)` with retry-on-error per `config`
    /// (§4.2). Returns an [`EventStream`] whose consumer sees the same contract as a plain
    /// adapter stream: `Start` once, `Done` once, or a terminal `Error` once retries are
    /// exhausted.
    pub fn stream(
        adapter: Arc<dyn ProviderAdapter>,
        model_id: String,
        context: AgentContext,
        options: StreamOptions,
        config: RetryConfig,
    ) -> EventStream {
        struct RetryState {
            inner: Option<EventStream>,
            attempt: u32,
        }

        let initial = RetryState { inner: None, attempt: 0 };

        Box::pin(stream::unfold(initial, move |mut state| {
            let adapter = adapter.clone();
            let model_id = model_id.clone();
            let context = context.clone();
            let options = options.clone();
            let config = config.clone();
            async move {
                loop {
                    if state.inner.is_none() {
                        let s = adapter.stream(&model_id, &context, options.clone()).await;
                        state.inner = Some(s);
                    }
                    let next = state.inner.as_mut().unwrap().next().await;
                    match next {
                        None => return None,
                        Some(StreamEvent::Error { error }) => {
                            if options.signal.is_aborted() {
                                log::debug!("retry stream: aborted, propagating error as terminal");
                                return Some((StreamEvent::Error { error }, state));
                            }
                            if !error.retryable || state.attempt >= config.max_retries {
                                log::error!(
                                    "retry stream: exhausted after {} attempt(s): {error}",
                                    state.attempt
                                );
                                return Some((StreamEvent::Error { error }, state));
                            }
                            let delay_ms = compute_delay_ms(&config, state.attempt, error.retry_after_ms);
                            log::warn!(
                                "retry stream: attempt {}/{} in {delay_ms}ms after: {error}",
                                state.attempt + 1,
                                config.max_retries
                            );
                            state.attempt += 1;
                            state.inner = None;
                            tokio::select! {
                                _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                                _ = options.signal.cancelled() => {
                                    return Some((StreamEvent::Error { error }, state));
                                }
                            }
                            continue;
                        }
                        Some(other) => return Some((other, state)),
                    }
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudllm::cancellation::AbortSignal;
    use crate::cloudllm::error::TransportError;
    use crate::cloudllm::provider::{ProviderAdapter, StopReason, Usage};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyAdapter {
        calls: AtomicU32,
        fail_times: u32,
    }

    #[async_trait]
    impl ProviderAdapter for FlakyAdapter {
        fn id(&self) -> &str {
            "flaky"
        }
        fn name(&self) -> &str {
            "flaky"
        }
        fn models(&self) -> &[String] {
            &[]
        }
        async fn stream(&self, _model_id: &str, _context: &AgentContext, _options: StreamOptions) -> EventStream {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_times {
                Box::pin(stream::iter(vec![StreamEvent::Error {
                    error: TransportError {
                        provider_id: "flaky".into(),
                        status_code: Some(503),
                        message: "overloaded".into(),
                        retryable: true,
                        retry_after_ms: None,
                    },
                }]))
            } else {
                Box::pin(stream::iter(vec![
                    StreamEvent::Start { message_id: "m1".into() },
                    StreamEvent::Text { text: "ok".into() },
                    StreamEvent::Done {
                        stop_reason: StopReason::EndTurn,
                        usage: Usage::default(),
                        cost: None,
                    },
                ]))
            }
        }
    }

    #[tokio::test]
    async fn retries_until_success() {
        let adapter = Arc::new(FlakyAdapter {
            calls: AtomicU32::new(0),
            fail_times: 2,
        });
        let mut config = RetryConfig::default();
        config.base_delay_ms = 1;
        config.max_delay_ms = 2;
        let mut s = RetryableStream::stream(
            adapter,
            "m".into(),
            AgentContext::new(),
            StreamOptions::new(AbortSignal::never()),
            config,
        );
        let mut events = Vec::new();
        while let Some(e) = s.next().await {
            events.push(e);
        }
        assert!(matches!(events.last(), Some(StreamEvent::Done { .. })));
    }

    #[tokio::test]
    async fn exhausts_after_max_retries() {
        let adapter = Arc::new(FlakyAdapter {
            calls: AtomicU32::new(0),
            fail_times: 100,
        });
        let mut config = RetryConfig::default();
        config.base_delay_ms = 1;
        config.max_delay_ms = 2;
        config.max_retries = 2;
        let mut s = RetryableStream::stream(
            adapter,
            "m".into(),
            AgentContext::new(),
            StreamOptions::new(AbortSignal::never()),
            config,
        );
        let mut last = None;
        while let Some(e) = s.next().await {
            last = Some(e);
        }
        assert!(matches!(last, Some(StreamEvent::Error { .. })));
    }
}
