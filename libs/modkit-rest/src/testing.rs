//! In-memory transports for unit tests

use crate::error::{NetworkErrorKind, RestError};
use crate::request::RequestDescriptor;
use crate::response::ResponseEnvelope;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use parking_lot::Mutex;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::Service;

type Handler =
    dyn Fn(&RequestDescriptor, usize) -> Result<ResponseEnvelope, RestError> + Send + Sync;

/// Transport answering from a closure and recording every request it sees.
///
/// The closure receives the request and the zero-based call index.
#[derive(Clone)]
pub(crate) struct MockTransport {
    handler: Arc<Handler>,
    seen: Arc<Mutex<Vec<RequestDescriptor>>>,
}

impl MockTransport {
    pub(crate) fn new<F>(handler: F) -> Self
    where
        F: Fn(&RequestDescriptor, usize) -> Result<ResponseEnvelope, RestError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            handler: Arc::new(handler),
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Always answer with `status` and an empty body
    pub(crate) fn status(status: u16) -> Self {
        Self::new(move |req, _| Ok(respond(status, req)))
    }

    /// Answer with the given statuses in order, repeating the last one
    pub(crate) fn sequence(statuses: &'static [u16]) -> Self {
        Self::new(move |req, n| {
            let status = statuses
                .get(n)
                .or_else(|| statuses.last())
                .copied()
                .unwrap_or(200);
            Ok(respond(status, req))
        })
    }

    /// Fail the first `failures` calls with a network error of `kind`, then answer 200
    pub(crate) fn network_failures(kind: NetworkErrorKind, failures: usize) -> Self {
        Self::new(move |req, n| {
            if n < failures {
                Err(network_error(kind, req))
            } else {
                Ok(respond(200, req))
            }
        })
    }

    pub(crate) fn calls(&self) -> usize {
        self.seen.lock().len()
    }

    pub(crate) fn requests(&self) -> Vec<RequestDescriptor> {
        self.seen.lock().clone()
    }
}

impl Service<RequestDescriptor> for MockTransport {
    type Response = ResponseEnvelope;
    type Error = RestError;
    type Future = std::future::Ready<Result<ResponseEnvelope, RestError>>;

    fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: RequestDescriptor) -> Self::Future {
        let index = {
            let mut seen = self.seen.lock();
            seen.push(req.clone());
            seen.len() - 1
        };
        std::future::ready((self.handler)(&req, index))
    }
}

/// Response with `status` and an empty body
pub(crate) fn respond(status: u16, req: &RequestDescriptor) -> ResponseEnvelope {
    respond_with(status, &[], "", req)
}

/// Response with `status`, headers and a text body
pub(crate) fn respond_with(
    status: u16,
    headers: &[(&'static str, &str)],
    body: &str,
    req: &RequestDescriptor,
) -> ResponseEnvelope {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        map.append(
            HeaderName::from_static(name),
            HeaderValue::from_str(value).unwrap(),
        );
    }
    ResponseEnvelope::new(
        StatusCode::from_u16(status).unwrap(),
        map,
        Bytes::from(body.to_owned()),
        req.clone(),
    )
}

pub(crate) fn network_error(kind: NetworkErrorKind, req: &RequestDescriptor) -> RestError {
    RestError::network(
        kind,
        std::io::Error::other(format!("simulated {kind} failure")),
        req,
    )
}
