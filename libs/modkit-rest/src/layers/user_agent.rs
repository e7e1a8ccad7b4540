use crate::config::DEFAULT_USER_AGENT;
use crate::error::RestError;
use crate::request::RequestDescriptor;
use http::HeaderValue;
use parking_lot::RwLock;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};

/// Append-only, deduplicated list of user agent tokens.
///
/// Clones share the same storage: tokens added through the client are seen
/// by every request serialized afterwards.
#[derive(Clone, Debug)]
pub struct UserAgentTokens {
    tokens: Arc<RwLock<Vec<String>>>,
}

impl Default for UserAgentTokens {
    fn default() -> Self {
        Self::new()
    }
}

impl UserAgentTokens {
    /// Create a token list seeded with the library token
    #[must_use]
    pub fn new() -> Self {
        Self {
            tokens: Arc::new(RwLock::new(vec![DEFAULT_USER_AGENT.to_owned()])),
        }
    }

    /// Append `token` unless already present.
    ///
    /// Returns `true` if the token was added.
    ///
    /// # Errors
    /// Returns `RestError::Configuration` if the token is empty or cannot
    /// appear in a header value.
    pub fn add(&self, token: &str) -> Result<bool, RestError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(RestError::configuration("user agent token cannot be empty"));
        }
        if HeaderValue::from_str(token).is_err() {
            return Err(RestError::configuration(format!(
                "user agent token '{}' contains characters not allowed in a header value",
                token.escape_debug()
            )));
        }

        let mut tokens = self.tokens.write();
        if tokens.iter().any(|t| t == token) {
            return Ok(false);
        }
        tokens.push(token.to_owned());
        Ok(true)
    }

    /// Snapshot of the tokens in insertion order
    #[must_use]
    pub fn tokens(&self) -> Vec<String> {
        self.tokens.read().clone()
    }

    /// Tokens joined with single spaces
    #[must_use]
    pub fn joined(&self) -> String {
        self.tokens.read().join(" ")
    }
}

/// Layer appending the accumulated tokens to the `User-Agent` header
#[derive(Clone)]
pub struct UserAgentLayer {
    tokens: UserAgentTokens,
}

impl UserAgentLayer {
    #[must_use]
    pub fn new(tokens: UserAgentTokens) -> Self {
        Self { tokens }
    }
}

impl<S> Layer<S> for UserAgentLayer {
    type Service = UserAgentService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        UserAgentService {
            inner,
            tokens: self.tokens.clone(),
        }
    }
}

/// Service that sets `User-Agent` before delegating inward
#[derive(Clone)]
pub struct UserAgentService<S> {
    inner: S,
    tokens: UserAgentTokens,
}

impl<S> Service<RequestDescriptor> for UserAgentService<S>
where
    S: Service<RequestDescriptor>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: RequestDescriptor) -> Self::Future {
        let joined = self.tokens.joined();
        // Keep a caller-supplied value in front of the accumulated tokens
        let value = match req.header(http::header::USER_AGENT.as_str()) {
            Some(existing) if !existing.trim().is_empty() => {
                format!("{} {joined}", existing.trim())
            }
            _ => joined,
        };
        match HeaderValue::try_from(value) {
            Ok(value) => {
                req.headers_mut().insert(http::header::USER_AGENT, value);
            }
            Err(e) => tracing::trace!(error = %e, "Leaving User-Agent header unchanged"),
        }
        self.inner.call(req)
    }
}
