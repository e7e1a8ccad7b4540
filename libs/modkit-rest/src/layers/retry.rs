use crate::config::{ExponentialBackoff, RetryConfig};
use crate::error::{NetworkErrorKind, RestError};
use crate::policy::PolicyFuture;
use crate::request::RequestDescriptor;
use crate::response::{ResponseEnvelope, parse_retry_after};
use http::HeaderValue;
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tower::{Layer, Service, ServiceExt};

/// Header name for retry attempt number (1-indexed).
/// Added to retried requests to indicate which retry attempt this is.
pub const RETRY_ATTEMPT_HEADER: &str = "X-Retry-Attempt";

/// Tower layer that implements retry with exponential backoff and jitter
///
/// Retries responses whose status is in the configured retryable set and,
/// unless disabled, `RestError::Network` failures.
#[derive(Clone, Debug)]
pub struct RetryLayer {
    config: RetryConfig,
    deferred_kinds: Arc<HashSet<NetworkErrorKind>>,
}

impl RetryLayer {
    /// Create a new `RetryLayer` with the specified configuration
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            deferred_kinds: Arc::default(),
        }
    }

    /// Leave network failures of these kinds to an inner policy.
    ///
    /// Used when a system-error retry sits inside this layer and already
    /// retries those kinds.
    #[must_use]
    pub fn defer_network_kinds(mut self, kinds: HashSet<NetworkErrorKind>) -> Self {
        self.deferred_kinds = Arc::new(kinds);
        self
    }
}

impl<S> Layer<S> for RetryLayer {
    type Service = RetryService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RetryService {
            inner,
            config: self.config.clone(),
            deferred_kinds: Arc::clone(&self.deferred_kinds),
        }
    }
}

/// Service that implements retry logic with exponential backoff
///
/// Exhausted retries return the last response (or error) unchanged: a
/// retryable status is never upgraded to an error. Each retry increments the
/// descriptor's retry counter and sets [`RETRY_ATTEMPT_HEADER`].
#[derive(Clone, Debug)]
pub struct RetryService<S> {
    inner: S,
    config: RetryConfig,
    deferred_kinds: Arc<HashSet<NetworkErrorKind>>,
}

impl<S> Service<RequestDescriptor> for RetryService<S>
where
    S: Service<RequestDescriptor, Response = ResponseEnvelope, Error = RestError>
        + Clone
        + Send
        + 'static,
    S::Future: Send,
{
    type Response = ResponseEnvelope;
    type Error = RestError;
    type Future = PolicyFuture;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: RequestDescriptor) -> Self::Future {
        // Swap so we consume the instance that was poll_ready'd,
        // leaving a fresh clone for the next poll_ready cycle.
        let clone = self.inner.clone();
        let mut first = std::mem::replace(&mut self.inner, clone);
        let inner = self.inner.clone();
        let config = self.config.clone();
        let deferred_kinds = Arc::clone(&self.deferred_kinds);

        Box::pin(async move {
            let mut request = req;
            let mut attempt = 0u32;
            loop {
                let outcome = if attempt == 0 {
                    first.call(request.clone()).await
                } else {
                    inner.clone().oneshot(request.clone()).await
                };

                let retryable = match &outcome {
                    Ok(resp) => config.is_retryable_status(resp.status().as_u16()),
                    Err(RestError::Network { kind, .. }) => {
                        config.retry_network_errors && !deferred_kinds.contains(kind)
                    }
                    Err(_) => false,
                };
                if !retryable || attempt >= config.max_retries {
                    return outcome;
                }

                let retry_after = match &outcome {
                    Ok(resp) if !config.ignore_retry_after => {
                        parse_retry_after(resp.headers()).map(|d| d.min(config.backoff.max))
                    }
                    _ => None,
                };
                let backoff =
                    retry_after.unwrap_or_else(|| calculate_backoff(&config.backoff, attempt));

                match &outcome {
                    Ok(resp) => tracing::debug!(
                        retry = attempt + 1,
                        max_retries = config.max_retries,
                        status = resp.status().as_u16(),
                        method = %request.method(),
                        host = request.url().host_str().unwrap_or("unknown"),
                        backoff_ms = backoff.as_millis(),
                        retry_after_used = retry_after.is_some(),
                        "Retrying request after status code"
                    ),
                    Err(err) => tracing::debug!(
                        retry = attempt + 1,
                        max_retries = config.max_retries,
                        error = %err,
                        method = %request.method(),
                        host = request.url().host_str().unwrap_or("unknown"),
                        backoff_ms = backoff.as_millis(),
                        "Retrying request after error"
                    ),
                }

                wait_before_retry(backoff, &request).await?;

                attempt += 1;
                request.increment_retry_count();
                request
                    .headers_mut()
                    .insert(RETRY_ATTEMPT_HEADER, HeaderValue::from(attempt));
            }
        })
    }
}

/// Sleep for `backoff` unless the request's cancellation signal fires first.
///
/// # Errors
/// Returns `RestError::Cancelled` if the signal fired before or during the wait.
pub(crate) async fn wait_before_retry(
    backoff: Duration,
    request: &RequestDescriptor,
) -> Result<(), RestError> {
    let Some(token) = request.cancellation() else {
        tokio::time::sleep(backoff).await;
        return Ok(());
    };
    if token.is_cancelled() {
        return Err(RestError::cancelled(request));
    }

    tokio::select! {
        biased;
        () = token.cancelled() => {
            tracing::debug!(url = %request.url(), "Request cancelled during retry backoff");
            Err(RestError::cancelled(request))
        }
        () = tokio::time::sleep(backoff) => Ok(()),
    }
}

/// Calculate backoff duration for a given attempt
///
/// `min(initial * multiplier^attempt, max)`, plus jitter drawn uniformly
/// from `[0, delay)` when enabled. Safely handles edge cases (NaN, infinity,
/// negative values) to avoid panics.
#[must_use]
pub fn calculate_backoff(backoff: &ExponentialBackoff, attempt: u32) -> Duration {
    // Maximum safe backoff in seconds (1 day - beyond this is unreasonable for retry logic)
    const MAX_BACKOFF_SECS: f64 = 86400.0;

    let attempt_i32 = i32::try_from(attempt).unwrap_or(i32::MAX);

    // Sanitize multiplier: must be finite and >= 0, default to 1.0
    let multiplier = if backoff.multiplier.is_finite() && backoff.multiplier >= 0.0 {
        backoff.multiplier
    } else {
        1.0
    };

    let initial_secs = backoff.initial.as_secs_f64();
    let max_secs = backoff.max.as_secs_f64().min(MAX_BACKOFF_SECS);

    let base_duration = initial_secs * multiplier.powi(attempt_i32);

    // Clamp to valid range for Duration::from_secs_f64 (must be finite, non-negative)
    let clamped = if base_duration.is_finite() {
        base_duration.min(max_secs).max(0.0)
    } else {
        max_secs
    };
    let duration = Duration::from_secs_f64(clamped);

    if backoff.jitter {
        let jitter_factor: f64 = rand::rng().random_range(0.0..1.0);
        duration + duration.mul_f64(jitter_factor)
    } else {
        duration
    }
}
