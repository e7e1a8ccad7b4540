use crate::builder::ServiceClientBuilder;
use crate::error::RestError;
use crate::layers::UserAgentTokens;
use crate::policy::RequestPipeline;
use crate::request::{RequestDescriptor, RequestInput, RequestPrepareOptions};
use crate::response::ResponseEnvelope;
use http::HeaderMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

/// Service client running every request through a fixed policy chain
///
/// The chain is composed once by [`ServiceClientBuilder::build`] and never
/// changes afterwards. Each call to [`send_request`](Self::send_request)
/// flows outermost policy first: user agent, redirect, provider
/// registration, exponential retry, system-error retry, signing, then the
/// transport.
///
/// # Thread Safety
///
/// `ServiceClient` is `Clone + Send + Sync`. Clones share the same chain,
/// transport connection pool and user agent token list, so a token added
/// through one clone is visible to all of them. Concurrent requests run
/// independently; no state is shared between in-flight requests.
///
/// # Example
///
/// ```ignore
/// use modkit_rest::{RequestPrepareOptions, ServiceClient, TokenCredentials};
///
/// let client = ServiceClient::builder()
///     .credential(TokenCredentials::new(token))
///     .user_agent("my-tool/1.0")
///     .build()?;
///
/// let resp = client
///     .send_request(RequestPrepareOptions::new(
///         "GET",
///         "https://management.example.com/subscriptions",
///     ))
///     .await?;
/// let body: serde_json::Value = resp.json()?;
/// ```
#[derive(Clone)]
pub struct ServiceClient {
    pub(crate) pipeline: RequestPipeline,
    pub(crate) tokens: UserAgentTokens,
    pub(crate) default_headers: Arc<HeaderMap>,
    pub(crate) default_timeout: Option<Duration>,
}

impl ServiceClient {
    /// Create a client with default configuration and no credential
    ///
    /// # Errors
    /// Returns an error if TLS initialization fails
    pub fn new() -> Result<Self, RestError> {
        ServiceClientBuilder::new().build()
    }

    /// Create a builder for configuring the client
    #[must_use]
    pub fn builder() -> ServiceClientBuilder {
        ServiceClientBuilder::new()
    }

    /// Send a request through the policy chain.
    ///
    /// `input` is either prepare options or an already built
    /// [`RequestDescriptor`]. Default headers from the client's
    /// `RequestOptions` are added when the request lacks them, and the
    /// default timeout applies when the request carries none.
    ///
    /// Any received response, including 4xx and 5xx, is returned as `Ok`.
    ///
    /// # Errors
    /// - `RestError::Configuration` (or another configuration-class error)
    ///   for invalid input; the transport is never reached
    /// - `RestError::Authentication` if the credential fails to sign
    /// - `RestError::Network` when retries are exhausted or disabled
    /// - `RestError::Cancelled` if the request's token fires between attempts
    pub async fn send_request(
        &self,
        input: impl Into<RequestInput>,
    ) -> Result<ResponseEnvelope, RestError> {
        let mut descriptor = input.into().into_descriptor()?;
        self.apply_defaults(&mut descriptor);

        let span = tracing::debug_span!(
            "modkit_rest.request",
            method = %descriptor.method(),
            host = descriptor.url().host_str().unwrap_or("unknown"),
        );

        async {
            let result = self.pipeline.dispatch(descriptor).await;
            match &result {
                Ok(resp) => tracing::debug!(status = resp.status().as_u16(), "Request completed"),
                Err(err) => tracing::debug!(error = %err, "Request failed"),
            }
            result
        }
        .instrument(span)
        .await
    }

    /// Send a request described by untyped options.
    ///
    /// # Errors
    /// Returns `RestError::Configuration` when `options` is not an object
    /// (null, a number, ...) or lacks a valid method and URL. Otherwise
    /// behaves like [`send_request`](Self::send_request).
    pub async fn send_request_value(
        &self,
        options: serde_json::Value,
    ) -> Result<ResponseEnvelope, RestError> {
        let options = RequestPrepareOptions::try_from(options)?;
        self.send_request(options).await
    }

    /// Append a token to the `User-Agent` sent on every later request.
    ///
    /// Adding a token that is already present is a no-op.
    ///
    /// # Errors
    /// Returns `RestError::Configuration` if the token is empty or not a
    /// valid header value.
    pub fn add_user_agent_info(&self, info: &str) -> Result<(), RestError> {
        if self.tokens.add(info)? {
            tracing::debug!(token = info.trim(), "User agent token added");
        }
        Ok(())
    }

    /// Current user agent tokens in the order they are sent
    #[must_use]
    pub fn user_agent_info(&self) -> Vec<String> {
        self.tokens.tokens()
    }

    /// Names of the composed policies, outermost first
    #[must_use]
    pub fn policy_names(&self) -> &[String] {
        self.pipeline.policy_names()
    }

    fn apply_defaults(&self, descriptor: &mut RequestDescriptor) {
        for (name, value) in self.default_headers.iter() {
            if !descriptor.headers().contains_key(name) {
                descriptor.headers_mut().insert(name.clone(), value.clone());
            }
        }
        if descriptor.timeout().is_none()
            && let Some(timeout) = self.default_timeout
        {
            descriptor.set_timeout(timeout);
        }
    }
}

impl std::fmt::Debug for ServiceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceClient")
            .field("pipeline", &self.pipeline)
            .field("user_agent", &self.tokens.tokens())
            .field("default_timeout", &self.default_timeout)
            .finish_non_exhaustive()
    }
}
