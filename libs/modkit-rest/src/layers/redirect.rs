//! Redirect-following policy
//!
//! Each request runs a small state machine: `Sending` delegates inward,
//! `Evaluating` inspects the response, `Redirecting` builds the next hop and
//! `Done` returns the final response. Exceeding the redirect limit is not an
//! error: the last 3xx response is returned and the caller decides.
//!
//! Security controls (see [`RedirectConfig`]):
//! - `Authorization`, `Cookie` and `Proxy-Authorization` are stripped on cross-origin hops,
//!   and the request is pinned to its original origin so the signing policy
//!   does not re-attach credentials elsewhere
//! - HTTPS → HTTP downgrades are not followed

use crate::config::RedirectConfig;
use crate::error::RestError;
use crate::policy::PolicyFuture;
use crate::request::RequestDescriptor;
use crate::response::ResponseEnvelope;
use http::{Method, StatusCode, header};
use std::task::{Context, Poll};
use tower::{Layer, Service, ServiceExt};
use url::Url;

/// Headers that are stripped on cross-origin redirects to prevent credential leakage
const SENSITIVE_HEADERS: &[header::HeaderName] = &[
    header::AUTHORIZATION,
    header::COOKIE,
    header::PROXY_AUTHORIZATION,
];

/// Whether `status` asks the client to re-issue the request elsewhere.
///
/// 304 Not Modified is a cache answer, not a redirect.
#[must_use]
pub fn is_redirect_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 300 | 301 | 302 | 303 | 307 | 308)
}

/// Whether a redirect with `status` keeps the original method and body
fn preserves_method(status: StatusCode) -> bool {
    matches!(status.as_u16(), 300 | 307 | 308)
}

/// Check if the redirect is an HTTPS → HTTP downgrade
fn is_https_downgrade(original: &Url, target: &Url) -> bool {
    original.scheme() == "https" && target.scheme() == "http"
}

/// Same scheme, host and (effective) port
fn is_same_origin(original: &Url, target: &Url) -> bool {
    original.origin() == target.origin()
}

enum RedirectState {
    Sending(RequestDescriptor),
    Evaluating(RequestDescriptor, ResponseEnvelope),
    Redirecting {
        request: RequestDescriptor,
        status: StatusCode,
        target: Url,
    },
    Done(ResponseEnvelope),
}

/// Tower layer that follows HTTP redirects
#[derive(Clone, Debug)]
pub struct RedirectLayer {
    config: RedirectConfig,
}

impl RedirectLayer {
    #[must_use]
    pub fn new(config: RedirectConfig) -> Self {
        Self { config }
    }
}

impl<S> Layer<S> for RedirectLayer {
    type Service = RedirectService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RedirectService {
            inner,
            config: self.config.clone(),
        }
    }
}

/// Service created by [`RedirectLayer`]
#[derive(Clone, Debug)]
pub struct RedirectService<S> {
    inner: S,
    config: RedirectConfig,
}

impl<S> Service<RequestDescriptor> for RedirectService<S>
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
            let mut state = RedirectState::Sending(req);
            let mut first_call = true;
            loop {
                state = match state {
                    RedirectState::Sending(request) => {
                        let resp = if first_call {
                            first_call = false;
                            first.call(request.clone()).await?
                        } else {
                            inner.clone().oneshot(request.clone()).await?
                        };
                        RedirectState::Evaluating(request, resp)
                    }
                    RedirectState::Evaluating(request, resp) => evaluate(&config, request, resp),
                    RedirectState::Redirecting {
                        request,
                        status,
                        target,
                    } => {
                        if request.is_cancelled() {
                            return Err(RestError::cancelled(&request));
                        }
                        RedirectState::Sending(next_hop(&config, request, status, target))
                    }
                    RedirectState::Done(resp) => return Ok(resp),
                };
            }
        })
    }
}

fn evaluate(
    config: &RedirectConfig,
    mut request: RequestDescriptor,
    resp: ResponseEnvelope,
) -> RedirectState {
    let status = resp.status();
    if !is_redirect_status(status) {
        return RedirectState::Done(resp);
    }
    let Some(location) = resp.header(header::LOCATION.as_str()).map(str::to_owned) else {
        return RedirectState::Done(resp);
    };

    request.increment_redirect_count();
    if request.redirect_count() > config.max_redirects {
        tracing::debug!(
            count = request.redirect_count(),
            max = config.max_redirects,
            "Redirect limit reached"
        );
        return RedirectState::Done(resp.with_request(request));
    }

    let target = match request.url().join(&location) {
        Ok(target) if matches!(target.scheme(), "http" | "https") => target,
        Ok(target) => {
            tracing::warn!(target = %target, "Not following redirect to unsupported scheme");
            return RedirectState::Done(resp);
        }
        Err(e) => {
            tracing::warn!(location = %location, error = %e, "Unresolvable redirect location");
            return RedirectState::Done(resp);
        }
    };

    if !config.allow_https_downgrade && is_https_downgrade(request.url(), &target) {
        tracing::warn!(
            original = %request.url(),
            target = %target,
            "Blocking HTTPS to HTTP downgrade redirect"
        );
        return RedirectState::Done(resp);
    }

    RedirectState::Redirecting {
        request,
        status,
        target,
    }
}

fn next_hop(
    config: &RedirectConfig,
    mut request: RequestDescriptor,
    status: StatusCode,
    target: Url,
) -> RequestDescriptor {
    if config.strip_sensitive_headers {
        request.pin_credential_origin();
    }
    if !is_same_origin(request.url(), &target) {
        tracing::debug!(
            original = %request.url(),
            target = %target,
            "Cross-origin redirect detected"
        );
        if config.strip_sensitive_headers {
            let headers = request.headers_mut();
            for header_name in SENSITIVE_HEADERS {
                if headers.remove(header_name).is_some() {
                    tracing::debug!(
                        header = %header_name,
                        "Stripped sensitive header on cross-origin redirect"
                    );
                }
            }
        }
    }

    if !preserves_method(status) {
        request.set_method(Method::GET);
        request.clear_body();
    }

    tracing::debug!(
        status = status.as_u16(),
        method = %request.method(),
        target = %target,
        count = request.redirect_count(),
        "Following redirect"
    );
    request.set_url(target);
    request
}
