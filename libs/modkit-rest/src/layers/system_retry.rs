use super::retry::{calculate_backoff, wait_before_retry};
use crate::config::SystemRetryConfig;
use crate::error::RestError;
use crate::policy::PolicyFuture;
use crate::request::RequestDescriptor;
use crate::response::ResponseEnvelope;
use std::task::{Context, Poll};
use tower::{Layer, Service, ServiceExt};

/// Tower layer retrying failures that happened below the HTTP layer
///
/// Only `RestError::Network` errors whose kind is in the configured set are
/// retried; any received response, whatever its status, is returned as-is.
#[derive(Clone, Debug)]
pub struct SystemRetryLayer {
    config: SystemRetryConfig,
}

impl SystemRetryLayer {
    #[must_use]
    pub fn new(config: SystemRetryConfig) -> Self {
        Self { config }
    }
}

impl<S> Layer<S> for SystemRetryLayer {
    type Service = SystemRetryService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        SystemRetryService {
            inner,
            config: self.config.clone(),
        }
    }
}

/// Service created by [`SystemRetryLayer`].
///
/// Keeps its own attempt counter; the descriptor's retry counter is left untouched.
#[derive(Clone, Debug)]
pub struct SystemRetryService<S> {
    inner: S,
    config: SystemRetryConfig,
}

impl<S> Service<RequestDescriptor> for SystemRetryService<S>
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
        // Clone-swap pattern (Tower Service contract).
        let clone = self.inner.clone();
        let mut first = std::mem::replace(&mut self.inner, clone);
        let inner = self.inner.clone();
        let config = self.config.clone();

        Box::pin(async move {
            let mut attempt = 0u32;
            loop {
                let outcome = if attempt == 0 {
                    first.call(req.clone()).await
                } else {
                    inner.clone().oneshot(req.clone()).await
                };

                let err = match outcome {
                    Ok(resp) => return Ok(resp),
                    Err(err) => err,
                };
                let retryable = err
                    .network_kind()
                    .is_some_and(|kind| config.retry_on.contains(&kind));
                if !retryable || attempt >= config.max_retries {
                    return Err(err);
                }

                let backoff = calculate_backoff(&config.backoff, attempt);
                tracing::debug!(
                    retry = attempt + 1,
                    max_retries = config.max_retries,
                    error = %err,
                    method = %req.method(),
                    host = req.url().host_str().unwrap_or("unknown"),
                    backoff_ms = backoff.as_millis(),
                    "Retrying request after network failure"
                );
                wait_before_retry(backoff, &req).await?;
                attempt += 1;
            }
        })
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::config::{ExponentialBackoff, RetryConfig};
    use crate::error::NetworkErrorKind;
    use crate::layers::RetryLayer;
    use crate::testing::{MockTransport, network_error, respond};
    use http::{Method, StatusCode};

    fn request() -> RequestDescriptor {
        RequestDescriptor::new(Method::GET, "https://example.com/items").unwrap()
    }

    fn fast_config() -> SystemRetryConfig {
        SystemRetryConfig {
            backoff: ExponentialBackoff::fast(),
            ..SystemRetryConfig::default()
        }
    }

    #[tokio::test]
    async fn test_connection_reset_retried_to_success() {
        let transport = MockTransport::network_failures(NetworkErrorKind::ConnectionReset, 2);
        let service = SystemRetryLayer::new(fast_config()).layer(transport.clone());

        let resp = service.oneshot(request()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(transport.calls(), 3);
        assert_eq!(resp.request().retry_count(), 0);
    }

    #[tokio::test]
    async fn test_http_status_never_retried() {
        for status in [500, 503, 429] {
            let transport = MockTransport::status(status);
            let service = SystemRetryLayer::new(fast_config()).layer(transport.clone());

            let resp = service.oneshot(request()).await.unwrap();
            assert_eq!(resp.status().as_u16(), status);
            assert_eq!(transport.calls(), 1);
        }
    }

    #[tokio::test]
    async fn test_kind_outside_set_not_retried() {
        let transport = MockTransport::network_failures(NetworkErrorKind::Other, 1);
        let service = SystemRetryLayer::new(fast_config()).layer(transport.clone());

        let err = service.oneshot(request()).await.unwrap_err();
        assert_eq!(err.network_kind(), Some(NetworkErrorKind::Other));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_returns_last_network_error() {
        let transport = MockTransport::network_failures(NetworkErrorKind::Timeout, usize::MAX);
        let service = SystemRetryLayer::new(fast_config()).layer(transport.clone());

        let err = service.oneshot(request()).await.unwrap_err();
        assert_eq!(err.network_kind(), Some(NetworkErrorKind::Timeout));
        assert_eq!(transport.calls(), 4);
    }

    #[tokio::test]
    async fn test_nested_under_exponential_retry() {
        // One network failure, then a retryable status, then success: the
        // inner policy absorbs the failure, the outer one handles the 503.
        let transport = MockTransport::new(|req, n| match n {
            0 => Err(network_error(NetworkErrorKind::ConnectionReset, req)),
            1 => Ok(respond(503, req)),
            _ => Ok(respond(200, req)),
        });
        let service = tower::ServiceBuilder::new()
            .layer(RetryLayer::new(RetryConfig {
                backoff: ExponentialBackoff::fast(),
                ..RetryConfig::default()
            }))
            .layer(SystemRetryLayer::new(fast_config()))
            .service(transport.clone());

        let resp = service.oneshot(request()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(transport.calls(), 3);
        assert_eq!(resp.request().retry_count(), 1);
    }
}
