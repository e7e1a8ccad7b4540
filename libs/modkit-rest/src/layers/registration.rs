//! Resource provider auto-registration policy
//!
//! A `409 Conflict` whose JSON error code is `MissingSubscriptionRegistration`
//! means the subscription has not activated the resource provider the request
//! targets. The policy registers the provider, polls until the registration
//! state is `Registered`, then re-issues the original request exactly once.
//! Any failure along the way (including the overall timeout) hands the
//! original conflict response back to the caller unchanged.
//! A cancelled request stops before registering, between status polls and
//! before the re-issue, failing with `RestError::Cancelled`.

use super::retry::wait_before_retry;
use crate::config::RegistrationConfig;
use crate::error::RestError;
use crate::policy::PolicyFuture;
use crate::request::RequestDescriptor;
use crate::response::ResponseEnvelope;
use http::{Method, StatusCode};
use regex::Regex;
use std::task::{Context, Poll};
use tower::{Layer, Service, ServiceExt};
use url::Url;

/// Error code identifying an unregistered resource provider
pub const MISSING_REGISTRATION_CODE: &str = "MissingSubscriptionRegistration";

#[allow(clippy::expect_used)] // good regex, it doesn't panic
static QUOTED_TOKEN_REGEX: std::sync::LazyLock<Regex> = std::sync::LazyLock::new(|| {
    Regex::new(r"'([^']+)'").expect("static regex should not panic")
});

/// Provider namespace named by a missing-registration conflict, if `resp` is one
#[must_use]
pub fn unregistered_namespace(resp: &ResponseEnvelope) -> Option<String> {
    if resp.status() != StatusCode::CONFLICT {
        return None;
    }
    let body = resp.parsed_body()?;
    let error = body.get("error")?;
    let code = error.get("code")?.as_str()?;
    if !code.eq_ignore_ascii_case(MISSING_REGISTRATION_CODE) {
        return None;
    }
    let message = error.get("message")?.as_str()?;
    QUOTED_TOKEN_REGEX
        .captures_iter(message)
        .last()
        .map(|caps| caps[1].to_owned())
}

/// Subscription id taken from the path segment following `subscriptions`
#[must_use]
pub fn subscription_id(url: &Url) -> Option<String> {
    let mut segments = url.path_segments()?;
    segments.find(|s| s.eq_ignore_ascii_case("subscriptions"))?;
    segments
        .next()
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned)
}

fn provider_url(
    request: &RequestDescriptor,
    subscription: &str,
    namespace: &str,
    action: Option<&str>,
    api_version: &str,
) -> Result<Url, RestError> {
    let origin = request.url().origin().ascii_serialization();
    let suffix = action.map(|a| format!("/{a}")).unwrap_or_default();
    let raw = format!(
        "{origin}/subscriptions/{}/providers/{}{suffix}?api-version={}",
        urlencoding::encode(subscription),
        urlencoding::encode(namespace),
        urlencoding::encode(api_version),
    );
    Url::parse(&raw).map_err(|e| RestError::configuration(format!("invalid provider url: {e}")))
}

fn is_registered(resp: &ResponseEnvelope) -> bool {
    resp.is_success()
        && resp
            .parsed_body()
            .as_ref()
            .and_then(|b| b.pointer("/properties/registrationState"))
            .and_then(serde_json::Value::as_str)
            .is_some_and(|state| state.eq_ignore_ascii_case("Registered"))
}

/// Tower layer that registers missing resource providers on demand
#[derive(Clone, Debug)]
pub struct RegistrationLayer {
    config: RegistrationConfig,
}

impl RegistrationLayer {
    #[must_use]
    pub fn new(config: RegistrationConfig) -> Self {
        Self { config }
    }
}

impl<S> Layer<S> for RegistrationLayer {
    type Service = RegistrationService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RegistrationService {
            inner,
            config: self.config.clone(),
        }
    }
}

/// Service created by [`RegistrationLayer`]
#[derive(Clone, Debug)]
pub struct RegistrationService<S> {
    inner: S,
    config: RegistrationConfig,
}

impl<S> Service<RequestDescriptor> for RegistrationService<S>
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
            let resp = first.call(req.clone()).await?;

            let Some(namespace) = unregistered_namespace(&resp) else {
                return Ok(resp);
            };
            let Some(subscription) = subscription_id(req.url()) else {
                tracing::warn!(
                    url = %req.url(),
                    namespace = %namespace,
                    "Provider not registered but request has no subscription id"
                );
                return Ok(resp);
            };

            tracing::debug!(
                namespace = %namespace,
                subscription = %subscription,
                "Registering resource provider"
            );
            if req.is_cancelled() {
                return Err(RestError::cancelled(&req));
            }

            let outcome = tokio::time::timeout(
                config.timeout,
                register_and_wait(inner.clone(), &config, &req, &subscription, &namespace),
            )
            .await;

            match outcome {
                Ok(Ok(Registration::Registered)) => {
                    if req.is_cancelled() {
                        return Err(RestError::cancelled(&req));
                    }
                    tracing::debug!(
                        namespace = %namespace,
                        "Provider registered, retrying request"
                    );
                    inner.oneshot(req).await
                }
                Ok(Ok(Registration::Rejected { step, status })) => {
                    tracing::warn!(
                        namespace = %namespace,
                        step,
                        status = status.as_u16(),
                        "Resource provider registration rejected"
                    );
                    Ok(resp)
                }
                Ok(Err(e @ RestError::Cancelled { .. })) => Err(e),
                Ok(Err(e)) => {
                    tracing::warn!(
                        namespace = %namespace,
                        error = %e,
                        "Resource provider registration failed"
                    );
                    Ok(resp)
                }
                Err(_) => {
                    tracing::warn!(
                        namespace = %namespace,
                        timeout_ms = config.timeout.as_millis(),
                        "Resource provider registration timed out"
                    );
                    Ok(resp)
                }
            }
        })
    }
}

/// How a register/poll sequence ended without a transport error
#[derive(Debug)]
enum Registration {
    Registered,
    /// A register or status call answered with a non-success status
    Rejected {
        step: &'static str,
        status: StatusCode,
    },
}

/// Register `namespace` and poll until it reports `Registered`
async fn register_and_wait<S>(
    inner: S,
    config: &RegistrationConfig,
    original: &RequestDescriptor,
    subscription: &str,
    namespace: &str,
) -> Result<Registration, RestError>
where
    S: Service<RequestDescriptor, Response = ResponseEnvelope, Error = RestError> + Clone,
{
    let register_url = provider_url(
        original,
        subscription,
        namespace,
        Some("register"),
        &config.api_version,
    )?;
    let register = original.derive(Method::POST, register_url);
    let resp = inner.clone().oneshot(register).await?;
    if !resp.is_success() {
        return Ok(Registration::Rejected {
            step: "register",
            status: resp.status(),
        });
    }

    let status_url = provider_url(original, subscription, namespace, None, &config.api_version)?;
    loop {
        let poll = original.derive(Method::GET, status_url.clone());
        let resp = inner.clone().oneshot(poll).await?;
        if is_registered(&resp) {
            return Ok(Registration::Registered);
        }
        if !resp.is_success() {
            return Ok(Registration::Rejected {
                step: "status",
                status: resp.status(),
            });
        }
        tracing::trace!(namespace = %namespace, "Provider not registered yet");
        wait_before_retry(config.poll_interval, original).await?;
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::testing::{MockTransport, respond, respond_with};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    const RESOURCE_URL: &str =
        "https://management.example.com/subscriptions/sub-1/resourceGroups/rg/providers/Contoso.Widgets/widgets/w1?api-version=2024-01-01";

    const CONFLICT_BODY: &str = r#"{"error":{"code":"MissingSubscriptionRegistration","message":"The subscription is not registered to use namespace 'Contoso.Widgets'. See https://aka.example/rps-not-found for how to register subscriptions."}}"#;

    fn config() -> RegistrationConfig {
        RegistrationConfig {
            timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(5),
            ..RegistrationConfig::default()
        }
    }

    fn resource_request() -> RequestDescriptor {
        let mut req = RequestDescriptor::new(Method::PUT, RESOURCE_URL).unwrap();
        req.set_json_body(serde_json::json!({"location": "west"}));
        req.set_header("x-tenant", "acme").unwrap();
        req
    }

    /// Server that needs registration; `polls_until_registered` polls answer
    /// `Registering` before `Registered`.
    fn provider_server(polls_until_registered: usize) -> MockTransport {
        let registered = Arc::new(AtomicUsize::new(0));
        let polls = Arc::new(AtomicUsize::new(0));
        MockTransport::new(move |req, _| {
            let path = req.url().path();
            if path.ends_with("/providers/Contoso.Widgets/register") {
                registered.store(1, Ordering::SeqCst);
                return Ok(respond_with(
                    200,
                    &[],
                    r#"{"properties":{"registrationState":"Registering"}}"#,
                    req,
                ));
            }
            if path.ends_with("/providers/Contoso.Widgets") {
                let n = polls.fetch_add(1, Ordering::SeqCst);
                let state = if n >= polls_until_registered {
                    "Registered"
                } else {
                    "Registering"
                };
                return Ok(respond_with(
                    200,
                    &[],
                    &format!(r#"{{"properties":{{"registrationState":"{state}"}}}}"#),
                    req,
                ));
            }
            let done_polling = polls.load(Ordering::SeqCst) > polls_until_registered;
            if registered.load(Ordering::SeqCst) == 1 && done_polling {
                Ok(respond(201, req))
            } else {
                Ok(respond_with(409, &[], CONFLICT_BODY, req))
            }
        })
    }

    #[test]
    fn test_namespace_is_last_quoted_token() {
        let req = resource_request();
        let resp = respond_with(
            409,
            &[],
            r#"{"error":{"code":"MissingSubscriptionRegistration","message":"Subscription 'sub-1' is not registered for 'Contoso.Widgets'."}}"#,
            &req,
        );
        assert_eq!(
            unregistered_namespace(&resp).as_deref(),
            Some("Contoso.Widgets")
        );
    }

    #[test]
    fn test_other_conflicts_not_matched() {
        let req = resource_request();
        let resp = respond_with(
            409,
            &[],
            r#"{"error":{"code":"Conflict","message":"busy 'x'"}}"#,
            &req,
        );
        assert!(unregistered_namespace(&resp).is_none());
        assert!(unregistered_namespace(&respond_with(409, &[], "not json", &req)).is_none());
        assert!(unregistered_namespace(&respond_with(400, &[], CONFLICT_BODY, &req)).is_none());
    }

    #[test]
    fn test_subscription_id_extraction() {
        let url = Url::parse(RESOURCE_URL).unwrap();
        assert_eq!(subscription_id(&url).as_deref(), Some("sub-1"));
        let url = Url::parse("https://example.com/tenants/t1/things").unwrap();
        assert!(subscription_id(&url).is_none());
        let url = Url::parse("https://example.com/subscriptions/").unwrap();
        assert!(subscription_id(&url).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_registration_then_single_retry() {
        let transport = provider_server(1);
        let service = RegistrationLayer::new(config()).layer(transport.clone());

        let resp = service.oneshot(resource_request()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);

        let seen = transport.requests();
        let originals: Vec<_> = seen
            .iter()
            .filter(|r| r.url().path().ends_with("/widgets/w1"))
            .collect();
        assert_eq!(originals.len(), 2, "original retried exactly once");
        assert_eq!(originals[1].method(), Method::PUT);
        assert!(!originals[1].body().is_empty());

        let register = &seen[1];
        assert_eq!(register.method(), Method::POST);
        assert_eq!(
            register.url().as_str(),
            "https://management.example.com/subscriptions/sub-1/providers/Contoso.Widgets/register?api-version=2016-02-01"
        );
        assert_eq!(register.header("x-tenant"), Some("acme"));
        assert!(register.body().is_empty());
        assert!(register.header("content-type").is_none());

        let poll = &seen[2];
        assert_eq!(poll.method(), Method::GET);
        assert_eq!(
            poll.url().as_str(),
            "https://management.example.com/subscriptions/sub-1/providers/Contoso.Widgets?api-version=2016-02-01"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_registration_timeout_returns_original_conflict() {
        let transport = provider_server(usize::MAX);
        let service = RegistrationLayer::new(config()).layer(transport.clone());

        let resp = service.oneshot(resource_request()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert_eq!(resp.text(), CONFLICT_BODY);

        let originals = transport
            .requests()
            .iter()
            .filter(|r| r.url().path().ends_with("/widgets/w1"))
            .count();
        assert_eq!(originals, 1, "original not retried after timeout");
    }

    #[tokio::test]
    async fn test_failed_register_call_returns_original_conflict() {
        let transport = MockTransport::new(|req, _| {
            if req.url().path().ends_with("/register") {
                Ok(respond(403, req))
            } else {
                Ok(respond_with(409, &[], CONFLICT_BODY, req))
            }
        });
        let service = RegistrationLayer::new(config()).layer(transport.clone());

        let resp = service.oneshot(resource_request()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_failed_status_poll_returns_original_conflict() {
        let transport = MockTransport::new(|req, _| {
            let path = req.url().path();
            if path.ends_with("/register") {
                Ok(respond(200, req))
            } else if path.ends_with("/providers/Contoso.Widgets") {
                Ok(respond(500, req))
            } else {
                Ok(respond_with(409, &[], CONFLICT_BODY, req))
            }
        });
        let service = RegistrationLayer::new(config()).layer(transport.clone());

        let resp = service.oneshot(resource_request()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn test_cancelled_request_does_not_register() {
        let transport = provider_server(0);
        let service = RegistrationLayer::new(config()).layer(transport.clone());

        let token = CancellationToken::new();
        token.cancel();
        let req = resource_request().with_cancellation(token);

        let err = service.oneshot(req).await.unwrap_err();
        assert!(matches!(err, RestError::Cancelled { .. }));
        assert_eq!(transport.calls(), 1, "only the original attempt");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_status_polling() {
        let transport = provider_server(usize::MAX);
        let service = RegistrationLayer::new(config()).layer(transport.clone());

        let token = CancellationToken::new();
        let req = resource_request().with_cancellation(token.clone());
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(7)).await;
            token.cancel();
        });

        let start = tokio::time::Instant::now();
        let err = service.oneshot(req).await.unwrap_err();
        assert!(matches!(err, RestError::Cancelled { .. }));
        assert!(start.elapsed() < Duration::from_secs(10));
        // original, register, then the polls at 0s and 5s
        assert_eq!(transport.calls(), 4);
    }

    #[tokio::test]
    async fn test_missing_subscription_returns_conflict() {
        let transport = MockTransport::new(|req, _| Ok(respond_with(409, &[], CONFLICT_BODY, req)));
        let service = RegistrationLayer::new(config()).layer(transport.clone());

        let req = RequestDescriptor::new(Method::GET, "https://example.com/widgets").unwrap();
        let resp = service.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_non_conflict_passes_through() {
        let transport = MockTransport::status(200);
        let service = RegistrationLayer::new(config()).layer(transport.clone());

        let resp = service.oneshot(resource_request()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(transport.calls(), 1);
    }
}
