use crate::credentials::Credential;
use crate::error::RestError;
use crate::policy::PolicyFuture;
use crate::request::RequestDescriptor;
use crate::response::ResponseEnvelope;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};

/// Layer that signs every request with a [`Credential`] before delegating inward
#[derive(Clone)]
pub struct SigningLayer {
    credential: Arc<dyn Credential>,
}

impl SigningLayer {
    #[must_use]
    pub fn new(credential: Arc<dyn Credential>) -> Self {
        Self { credential }
    }
}

impl<S> Layer<S> for SigningLayer {
    type Service = SigningService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        SigningService {
            inner,
            credential: Arc::clone(&self.credential),
        }
    }
}

/// Service created by [`SigningLayer`].
///
/// Signing failures are returned as-is and the inner service is not called.
/// Requests a redirect moved away from the origin they were submitted to
/// are forwarded unsigned.
#[derive(Clone)]
pub struct SigningService<S> {
    inner: S,
    credential: Arc<dyn Credential>,
}

impl<S> Service<RequestDescriptor> for SigningService<S>
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

    fn call(&mut self, mut req: RequestDescriptor) -> Self::Future {
        // Clone-swap pattern (Tower Service contract).
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let credential = Arc::clone(&self.credential);

        Box::pin(async move {
            if req.may_carry_credentials() {
                credential.sign(&mut req).await?;
                tracing::trace!(url = %req.url(), "Request signed");
            } else {
                tracing::debug!(
                    url = %req.url(),
                    "Not signing request redirected to another origin"
                );
            }
            inner.call(req).await
        })
    }
}
