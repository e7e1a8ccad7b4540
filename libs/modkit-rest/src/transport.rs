//! Built-in transport sender
//!
//! `HttpTransport` is the innermost service of a pipeline: it serializes a
//! [`RequestDescriptor`] onto the wire with a pooled hyper client, decodes
//! compressed bodies and buffers the response into a [`ResponseEnvelope`].
//! It performs exactly one network exchange per call; retries, redirects and
//! signing belong to the policies wrapped around it.

use crate::config::{TlsRootConfig, TransportConfig, TransportSecurity};
use crate::error::{NetworkErrorKind, RestError};
use crate::policy::PolicyFuture;
use crate::request::RequestDescriptor;
use crate::response::{ResponseEnvelope, read_body_limited};
use crate::tls;
use bytes::Bytes;
use http_body_util::Full;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use std::error::Error as StdError;
use std::task::{Context, Poll};
use std::time::Duration;
use tower::{Service, ServiceExt};
use tower_http::decompression::Decompression;

type HyperClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// Transport sender backed by hyper, rustls and tower-http decompression
#[derive(Clone)]
pub struct HttpTransport {
    client: Decompression<HyperClient>,
    request_timeout: Duration,
    max_body_size: usize,
    security: TransportSecurity,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("request_timeout", &self.request_timeout)
            .field("max_body_size", &self.max_body_size)
            .field("security", &self.security)
            .finish_non_exhaustive()
    }
}

impl HttpTransport {
    /// Build a transport from `config`.
    ///
    /// # Errors
    /// Returns `RestError::Tls` if TLS initialization fails.
    pub fn new(config: &TransportConfig) -> Result<Self, RestError> {
        // Warn if insecure HTTP is enabled (should only be used for testing)
        if config.security == TransportSecurity::AllowInsecureHttp {
            tracing::warn!(
                "insecure HTTP enabled (TransportSecurity::AllowInsecureHttp); \
                 use only for testing with mock servers"
            );
        }

        let https = build_https_connector(config.tls_roots, config.security)?;

        let mut client_builder = Client::builder(TokioExecutor::new());

        // CRITICAL: pool_timer is required for pool_idle_timeout to work!
        client_builder
            .pool_timer(TokioTimer::new())
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .http2_only(false); // Allow both HTTP/1 and HTTP/2 via ALPN

        if let Some(idle_timeout) = config.pool_idle_timeout {
            client_builder.pool_idle_timeout(idle_timeout);
        }

        let hyper_client: HyperClient = client_builder.build(https);

        Ok(Self {
            client: Decompression::new(hyper_client),
            request_timeout: config.request_timeout,
            max_body_size: config.max_body_size,
            security: config.security,
        })
    }
}

impl Service<RequestDescriptor> for HttpTransport {
    type Response = ResponseEnvelope;
    type Error = RestError;
    type Future = PolicyFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: RequestDescriptor) -> Self::Future {
        let client = self.client.clone();
        let timeout = req.timeout().unwrap_or(self.request_timeout);
        let max_body_size = self.max_body_size;
        let security = self.security;

        Box::pin(async move {
            if security == TransportSecurity::TlsOnly && req.url().scheme() != "https" {
                return Err(RestError::InvalidScheme {
                    scheme: req.url().scheme().to_owned(),
                    reason: "HTTPS required (transport security is TlsOnly)".to_owned(),
                });
            }

            let http_req = to_http_request(&req)?;

            let exchange = async {
                let resp = client
                    .oneshot(http_req)
                    .await
                    .map_err(|e| map_client_error(e, &req))?;
                let (parts, body) = resp.into_parts();
                let body = read_body_limited(body, max_body_size, |e| {
                    let kind = classify(&*e).unwrap_or(NetworkErrorKind::ConnectionReset);
                    RestError::network(kind, e, &req)
                })
                .await?;
                Ok::<_, RestError>((parts, body))
            };

            match tokio::time::timeout(timeout, exchange).await {
                Ok(Ok((parts, body))) => {
                    tracing::trace!(
                        status = parts.status.as_u16(),
                        url = %req.url(),
                        bytes = body.len(),
                        "Response received"
                    );
                    Ok(ResponseEnvelope::new(parts.status, parts.headers, body, req))
                }
                Ok(Err(e)) => Err(e),
                Err(_) => Err(RestError::network(
                    NetworkErrorKind::Timeout,
                    format!("no response within {timeout:?}"),
                    &req,
                )),
            }
        })
    }
}

fn to_http_request(req: &RequestDescriptor) -> Result<http::Request<Full<Bytes>>, RestError> {
    let uri = http::Uri::try_from(req.url().as_str()).map_err(|e| RestError::InvalidUri {
        url: req.url().to_string(),
        kind: crate::error::InvalidUriKind::ParseError,
        reason: e.to_string(),
    })?;
    let body = req.body().to_bytes()?;

    let mut http_req = http::Request::new(Full::new(body));
    *http_req.method_mut() = req.method().clone();
    *http_req.uri_mut() = uri;
    *http_req.headers_mut() = req.headers().clone();
    Ok(http_req)
}

/// Map a hyper client failure onto a network error of `req`
fn map_client_error(err: hyper_util::client::legacy::Error, req: &RequestDescriptor) -> RestError {
    let kind = classify(&err).unwrap_or(if err.is_connect() {
        if chain_mentions_dns(&err) {
            NetworkErrorKind::Dns
        } else {
            NetworkErrorKind::Connect
        }
    } else {
        NetworkErrorKind::Other
    });
    RestError::network(kind, err, req)
}

/// Failure class from the first recognizable error in the source chain
fn classify(err: &(dyn StdError + 'static)) -> Option<NetworkErrorKind> {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            use std::io::ErrorKind;
            match io.kind() {
                ErrorKind::ConnectionRefused => return Some(NetworkErrorKind::ConnectionRefused),
                ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::BrokenPipe
                | ErrorKind::UnexpectedEof => return Some(NetworkErrorKind::ConnectionReset),
                ErrorKind::TimedOut => return Some(NetworkErrorKind::Timeout),
                ErrorKind::NotConnected | ErrorKind::AddrNotAvailable => {
                    return Some(NetworkErrorKind::Connect);
                }
                _ => {}
            }
        }
        if let Some(hyper_err) = e.downcast_ref::<hyper::Error>()
            && (hyper_err.is_incomplete_message() || hyper_err.is_closed())
        {
            return Some(NetworkErrorKind::ConnectionReset);
        }
        current = e.source();
    }
    None
}

fn chain_mentions_dns(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if e.to_string().to_ascii_lowercase().contains("dns error") {
            return true;
        }
        current = e.source();
    }
    false
}

/// Build the HTTPS connector with the specified TLS root configuration.
///
/// HTTP/2 is enabled via `enable_all_versions()` which configures ALPN to
/// advertise both h2 and http/1.1.
///
/// # Errors
///
/// Returns `RestError::Tls` if `TlsRootConfig::Native` is requested but no
/// valid root certificates are available from the OS certificate store.
fn build_https_connector(
    tls_roots: TlsRootConfig,
    security: TransportSecurity,
) -> Result<HttpsConnector<HttpConnector>, RestError> {
    let allow_http = security == TransportSecurity::AllowInsecureHttp;

    let builder = match tls_roots {
        TlsRootConfig::WebPki => hyper_rustls::HttpsConnectorBuilder::new()
            .with_provider_and_webpki_roots(tls::get_crypto_provider())
            .map_err(|e| RestError::Tls(Box::new(e)))?,
        TlsRootConfig::Native => hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls::native_roots_client_config()?),
    };

    let connector = if allow_http {
        builder.https_or_http().enable_all_versions().build()
    } else {
        builder.https_only().enable_all_versions().build()
    };
    Ok(connector)
}
