use crate::error::RestError;
use crate::request::RequestDescriptor;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use http_body_util::BodyExt;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Parse `Retry-After` header value into a `Duration`.
///
/// Supports two formats per RFC 7231:
/// - Seconds: "120" → 120 seconds
/// - HTTP-date (RFC 1123): "Wed, 21 Oct 2015 07:28:00 GMT" → duration until that time
///
/// Returns `None` if the header is missing, unparsable, or already in the past.
#[must_use]
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(http::header::RETRY_AFTER)?.to_str().ok()?;
    let trimmed = value.trim();

    if let Ok(seconds) = trimmed.parse::<i64>() {
        if seconds < 0 {
            return None;
        }
        return Some(Duration::from_secs(seconds.cast_unsigned()));
    }

    parse_http_date(trimmed)
}

fn parse_http_date(value: &str) -> Option<Duration> {
    let parsed = httpdate::parse_http_date(value).ok()?;
    parsed.duration_since(SystemTime::now()).ok()
}

/// Response produced by one attempt of the pipeline.
///
/// The body is fully buffered. `request()` is the descriptor that produced
/// this response, kept read-only for diagnostics and retry decisions.
#[derive(Debug, Clone)]
pub struct ResponseEnvelope {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    request: Arc<RequestDescriptor>,
}

impl ResponseEnvelope {
    #[must_use]
    pub fn new(
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
        request: RequestDescriptor,
    ) -> Self {
        Self {
            status,
            headers,
            body,
            request: Arc::new(request),
        }
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Header value as a string, if present and visible ASCII
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Raw body bytes
    #[must_use]
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Body as text; invalid UTF-8 is replaced with U+FFFD
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Parse the body as JSON.
    ///
    /// # Errors
    /// Returns `RestError::Json` if the body is not valid JSON for `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, RestError> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Body parsed as a JSON value, `None` for empty or non-JSON bodies
    #[must_use]
    pub fn parsed_body(&self) -> Option<serde_json::Value> {
        if self.body.is_empty() {
            return None;
        }
        serde_json::from_slice(&self.body).ok()
    }

    /// Descriptor of the request that produced this response
    #[must_use]
    pub fn request(&self) -> &RequestDescriptor {
        &self.request
    }

    /// Replace the attached request descriptor
    #[must_use]
    pub fn with_request(mut self, request: RequestDescriptor) -> Self {
        self.request = Arc::new(request);
        self
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Read a (possibly decompressed) body into memory, enforcing `limit` on
/// the decoded byte count.
///
/// # Errors
/// Returns `RestError::BodyTooLarge` past the limit, or the mapped body
/// read error from `on_error`.
pub(crate) async fn read_body_limited<B, F>(
    body: B,
    limit: usize,
    on_error: F,
) -> Result<Bytes, RestError>
where
    B: http_body::Body<Data = Bytes>,
    F: Fn(B::Error) -> RestError,
{
    let mut collected = Vec::new();
    let mut body = std::pin::pin!(body);

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(&on_error)?;
        if let Some(chunk) = frame.data_ref() {
            if collected.len() + chunk.len() > limit {
                return Err(RestError::BodyTooLarge {
                    limit,
                    actual: collected.len() + chunk.len(),
                });
            }
            collected.extend_from_slice(chunk);
        }
    }

    Ok(Bytes::from(collected))
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use http::Method;
    use http_body_util::Full;

    fn envelope(status: u16, body: &'static [u8]) -> ResponseEnvelope {
        ResponseEnvelope::new(
            StatusCode::from_u16(status).unwrap(),
            HeaderMap::new(),
            Bytes::from_static(body),
            RequestDescriptor::new(Method::GET, "https://example.com/items").unwrap(),
        )
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::RETRY_AFTER, "120".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_parse_retry_after_seconds_with_whitespace() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::RETRY_AFTER, "  60  ".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_parse_retry_after_invalid_or_negative() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_retry_after(&headers), None);
        headers.insert(http::header::RETRY_AFTER, "not-a-number".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), None);
        headers.insert(http::header::RETRY_AFTER, "-5".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[test]
    fn test_parse_retry_after_http_date() {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::RETRY_AFTER,
            "Wed, 21 Oct 2015 07:28:00 GMT".parse().unwrap(),
        );
        assert_eq!(parse_retry_after(&headers), None);

        let future_time = SystemTime::now() + Duration::from_secs(60);
        let http_date = httpdate::fmt_http_date(future_time);
        headers.insert(http::header::RETRY_AFTER, http_date.parse().unwrap());
        let duration = parse_retry_after(&headers).unwrap();
        assert!(duration.as_secs() >= 58 && duration.as_secs() <= 62);
    }

    #[test]
    fn test_envelope_json_and_text() {
        #[derive(serde::Deserialize)]
        struct Item {
            id: u32,
        }

        let resp = envelope(200, br#"{"id": 7}"#);
        assert!(resp.is_success());
        assert_eq!(resp.json::<Item>().unwrap().id, 7);
        assert_eq!(resp.text(), r#"{"id": 7}"#);
        assert_eq!(resp.parsed_body().unwrap()["id"], 7);
        assert_eq!(resp.request().url().path(), "/items");
    }

    #[test]
    fn test_parsed_body_non_json() {
        assert!(envelope(500, b"").parsed_body().is_none());
        assert!(envelope(500, b"<html>").parsed_body().is_none());
        assert!(matches!(
            envelope(500, b"<html>").json::<serde_json::Value>(),
            Err(RestError::Json(_))
        ));
    }

    #[tokio::test]
    async fn test_read_body_limited() {
        let body = Full::new(Bytes::from_static(b"hello"));
        let bytes = read_body_limited(body, 16, |_| RestError::configuration("unreachable"))
            .await
            .unwrap();
        assert_eq!(bytes, Bytes::from_static(b"hello"));

        let body = Full::new(Bytes::from(vec![0u8; 32]));
        let err = read_body_limited(body, 16, |_| RestError::configuration("unreachable"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RestError::BodyTooLarge {
                limit: 16,
                actual: 32
            }
        ));
    }
}
