use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use hive_core::config::{RateLimitStrategy, RetryConfig};
use hive_core::error::{HiveError, ProviderErrorKind, Result};
use hive_core::event::EventBus;
use hive_core::types::AgentEvent;

/// Retry/backoff policy for model requests.
///
/// Decisions are driven by the [`ProviderErrorKind`] the client attached to
/// the error. Errors that did not come from a provider propagate untouched.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
    event_bus: Option<EventBus>,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            event_bus: None,
        }
    }

    /// Publish an [`AgentEvent::Retry`] before every backoff sleep.
    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Total attempts made before giving up.
    pub fn max_attempts(&self) -> u32 {
        self.config.max_retries + 1
    }

    /// Delay before retrying after `attempt` (0-based) failed with `kind`.
    /// `None` means the error must not be retried.
    pub fn backoff_for(&self, kind: ProviderErrorKind, attempt: u32) -> Option<Duration> {
        match kind {
            ProviderErrorKind::Fatal => None,
            ProviderErrorKind::Transient => Some(self.linear_backoff(attempt)),
            ProviderErrorKind::RateLimited => match self.config.rate_limit_strategy {
                RateLimitStrategy::Fail => None,
                RateLimitStrategy::Queue => Some(self.exponential_backoff(attempt)),
                RateLimitStrategy::Retry => Some(jitter(self.exponential_backoff(attempt))),
            },
        }
    }

    fn linear_backoff(&self, attempt: u32) -> Duration {
        let ms = self.config.backoff_ms.saturating_mul(u64::from(attempt) + 1);
        Duration::from_millis(ms.min(self.config.max_backoff_ms))
    }

    fn exponential_backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        let ms = self.config.backoff_ms.saturating_mul(factor);
        Duration::from_millis(ms.min(self.config.max_backoff_ms))
    }

    /// Run `op` until it succeeds, a non-retryable error occurs, or
    /// `max_retries + 1` attempts have failed.
    ///
    /// `op` receives the 0-based attempt number. Both the operation and the
    /// backoff sleeps race `cancel`.
    pub async fn execute<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_retries = self.config.max_retries;
        let mut attempt = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(HiveError::Cancelled);
            }

            let result = tokio::select! {
                result = op(attempt) => result,
                _ = cancel.cancelled() => return Err(HiveError::Cancelled),
            };

            let err = match result {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            let Some(kind) = err.provider_kind() else {
                return Err(err);
            };
            let Some(delay) = self.backoff_for(kind, attempt) else {
                return Err(err);
            };
            if attempt >= max_retries {
                return Err(HiveError::RetriesExhausted {
                    attempts: attempt + 1,
                    source: Box::new(err),
                });
            }

            warn!(
                attempt = attempt + 1,
                max_retries,
                kind = %kind,
                backoff_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying model request"
            );
            if let Some(bus) = &self.event_bus {
                bus.publish(AgentEvent::Retry {
                    attempt: attempt + 1,
                    delay_ms: delay.as_millis() as u64,
                    error: err.to_string(),
                });
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(HiveError::Cancelled),
            }
            attempt += 1;
        }
    }
}

/// Scale by a random factor in 0.8x..1.2x.
fn jitter(delay: Duration) -> Duration {
    let factor = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((delay.as_millis() as f64 * factor) as u64)
}
