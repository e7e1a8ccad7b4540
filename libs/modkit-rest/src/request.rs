use crate::error::{InvalidUriKind, RestError};
use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use http::Method;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::{Origin, Url};

/// Content type applied to structured payloads unless the caller set one
pub const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";

/// Request body states
#[derive(Debug, Clone, Default, PartialEq)]
pub enum RequestBody {
    /// No body
    #[default]
    Empty,
    /// Raw bytes sent verbatim
    Bytes(Bytes),
    /// Structured payload, serialized to JSON by the transport
    Json(serde_json::Value),
}

impl RequestBody {
    /// Whether the body is absent
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Serialize the body into wire bytes.
    ///
    /// # Errors
    /// Returns `RestError::Json` if the structured payload cannot be serialized.
    pub fn to_bytes(&self) -> Result<Bytes, RestError> {
        match self {
            Self::Empty => Ok(Bytes::new()),
            Self::Bytes(b) => Ok(b.clone()),
            Self::Json(value) => Ok(Bytes::from(serde_json::to_vec(value)?)),
        }
    }
}

/// Mutable request description passed through the policy chain.
///
/// Method and URL are validated on construction. The redirect and retry
/// counters only ever grow; there are no setters for them.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: RequestBody,
    timeout: Option<Duration>,
    redirect_count: u32,
    retry_count: u32,
    cancellation: Option<CancellationToken>,
    credential_origin: Option<Origin>,
}

impl RequestDescriptor {
    /// Create a descriptor for `method` and an absolute `url`.
    ///
    /// # Errors
    /// Returns `RestError::InvalidUri` if the URL is not an absolute http(s) URL.
    pub fn new(method: Method, url: &str) -> Result<Self, RestError> {
        let url = parse_absolute_url(url)?;
        Ok(Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: RequestBody::Empty,
            timeout: None,
            redirect_count: 0,
            retry_count: 0,
            cancellation: None,
            credential_origin: None,
        })
    }

    /// Convert a raw option bundle into a validated descriptor.
    ///
    /// # Errors
    /// Returns `RestError::Configuration` for a missing method, missing URL
    /// parts or missing path parameters, and `RestError::InvalidUri` when the
    /// assembled URL is not absolute.
    pub fn prepare(options: RequestPrepareOptions) -> Result<Self, RestError> {
        let method = options
            .method
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .ok_or_else(|| RestError::configuration("method is required"))?;
        let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
            .map_err(|e| RestError::configuration(format!("invalid method '{method}': {e}")))?;

        let raw_url = match (&options.url, &options.base_url, &options.path_template) {
            (Some(url), _, _) => {
                if options.path_template.is_some() {
                    return Err(RestError::configuration(
                        "url and pathTemplate are mutually exclusive",
                    ));
                }
                url.clone()
            }
            (None, Some(base), Some(template)) => {
                let path = expand_path_template(template, &options.path_parameters)?;
                join_base_and_path(base, &path)
            }
            (None, None, Some(_)) => {
                return Err(RestError::configuration(
                    "baseUrl is required when pathTemplate is provided",
                ));
            }
            (None, _, None) => {
                return Err(RestError::configuration(
                    "either url or baseUrl + pathTemplate is required",
                ));
            }
        };

        let with_query = append_query(&raw_url, &options.query_parameters);
        let mut descriptor = Self::new(method, &with_query)?;

        for (name, value) in &options.headers {
            descriptor.set_header(name, value)?;
        }

        if let Some(body) = options.body {
            if options.disable_json_stringify_on_body {
                let raw = match body {
                    serde_json::Value::String(s) => Bytes::from(s),
                    other => Bytes::from(serde_json::to_vec(&other)?),
                };
                descriptor.set_body(RequestBody::Bytes(raw));
            } else {
                descriptor.set_json_body(body);
            }
        }

        if let Some(ms) = options.timeout_ms {
            descriptor.set_timeout(Duration::from_millis(ms));
        }

        Ok(descriptor)
    }

    /// Re-check invariants of a caller-built descriptor
    ///
    /// # Errors
    /// Returns `RestError::InvalidUri` if the URL lost its host or scheme.
    pub fn validate(&self) -> Result<(), RestError> {
        check_absolute(&self.url)
    }

    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn set_method(&mut self, method: Method) {
        self.method = method;
    }

    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn set_url(&mut self, url: Url) {
        self.url = url;
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Set a header, replacing any existing value under the same
    /// (case-insensitive) name.
    ///
    /// # Errors
    /// Returns an error if the name or value is not a valid HTTP header.
    pub fn set_header(&mut self, name: &str, value: &str) -> Result<(), RestError> {
        let name = HeaderName::try_from(name)?;
        let value = HeaderValue::try_from(value)?;
        self.headers.insert(name, value);
        Ok(())
    }

    /// Header value as a string, if present and visible ASCII
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    #[must_use]
    pub fn body(&self) -> &RequestBody {
        &self.body
    }

    pub fn set_body(&mut self, body: RequestBody) {
        self.body = body;
    }

    /// Set a structured body and default the content type to JSON
    pub fn set_json_body(&mut self, body: serde_json::Value) {
        if !self.headers.contains_key(CONTENT_TYPE) {
            self.headers
                .insert(CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT_TYPE));
        }
        self.body = RequestBody::Json(body);
    }

    /// Drop the body together with the headers describing it
    pub fn clear_body(&mut self) {
        self.body = RequestBody::Empty;
        self.headers.remove(CONTENT_TYPE);
        self.headers.remove(http::header::CONTENT_LENGTH);
    }

    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = Some(timeout);
    }

    /// Number of redirects followed to produce this descriptor
    #[must_use]
    pub fn redirect_count(&self) -> u32 {
        self.redirect_count
    }

    pub fn increment_redirect_count(&mut self) {
        self.redirect_count = self.redirect_count.saturating_add(1);
    }

    /// Number of status/network retries issued by the exponential retry policy
    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn increment_retry_count(&mut self) {
        self.retry_count = self.retry_count.saturating_add(1);
    }

    /// Attach a cancellation signal checked by retry policies between attempts
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    #[must_use]
    pub fn cancellation(&self) -> Option<&CancellationToken> {
        self.cancellation.as_ref()
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }

    /// Scope credentials to the current origin.
    ///
    /// Only the first call has an effect, so the origin the caller submitted
    /// to stays the one credentials belong to across redirect hops.
    pub(crate) fn pin_credential_origin(&mut self) {
        if self.credential_origin.is_none() {
            self.credential_origin = Some(self.url.origin());
        }
    }

    /// Whether credentials may be attached for the current URL
    #[must_use]
    pub fn may_carry_credentials(&self) -> bool {
        self.credential_origin
            .as_ref()
            .is_none_or(|origin| *origin == self.url.origin())
    }

    /// Copy of this request without counters, for an out-of-band call
    /// against `url` (same headers, no body).
    pub(crate) fn derive(&self, method: Method, url: Url) -> Self {
        let mut headers = self.headers.clone();
        headers.remove(CONTENT_TYPE);
        headers.remove(http::header::CONTENT_LENGTH);
        Self {
            method,
            url,
            headers,
            body: RequestBody::Empty,
            timeout: self.timeout,
            redirect_count: 0,
            retry_count: 0,
            cancellation: self.cancellation.clone(),
            credential_origin: self.credential_origin.clone(),
        }
    }
}

/// A path or query parameter value with its encoding rule
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    /// Plain value, percent-encoded
    Plain(String),
    /// Repeated query parameter, each value percent-encoded
    Multi(Vec<String>),
    /// Value with an explicit encoding rule
    #[serde(rename_all = "camelCase")]
    Detailed {
        value: String,
        #[serde(default)]
        skip_url_encoding: bool,
    },
}

impl ParameterValue {
    fn encoded_values(&self) -> Vec<String> {
        match self {
            Self::Plain(v) => vec![urlencoding::encode(v).into_owned()],
            Self::Multi(values) => values
                .iter()
                .map(|v| urlencoding::encode(v).into_owned())
                .collect(),
            Self::Detailed {
                value,
                skip_url_encoding: true,
            } => vec![value.clone()],
            Self::Detailed { value, .. } => vec![urlencoding::encode(value).into_owned()],
        }
    }
}

impl From<&str> for ParameterValue {
    fn from(value: &str) -> Self {
        Self::Plain(value.to_owned())
    }
}

/// Raw request-preparation bundle, validated by [`RequestDescriptor::prepare`]
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RequestPrepareOptions {
    pub method: Option<String>,
    pub url: Option<String>,
    pub base_url: Option<String>,
    pub path_template: Option<String>,
    pub path_parameters: BTreeMap<String, ParameterValue>,
    pub query_parameters: BTreeMap<String, ParameterValue>,
    pub headers: BTreeMap<String, String>,
    pub body: Option<serde_json::Value>,
    pub disable_json_stringify_on_body: bool,
    pub timeout_ms: Option<u64>,
}

impl RequestPrepareOptions {
    /// Shorthand for a bundle with only method and URL set
    #[must_use]
    pub fn new(method: &str, url: &str) -> Self {
        Self {
            method: Some(method.to_owned()),
            url: Some(url.to_owned()),
            ..Default::default()
        }
    }
}

impl TryFrom<serde_json::Value> for RequestPrepareOptions {
    type Error = RestError;

    fn try_from(value: serde_json::Value) -> Result<Self, Self::Error> {
        match value {
            serde_json::Value::Object(_) => serde_json::from_value(value)
                .map_err(|e| RestError::configuration(format!("invalid request options: {e}"))),
            serde_json::Value::Null => {
                Err(RestError::configuration("request options cannot be null"))
            }
            other => Err(RestError::configuration(format!(
                "request options must be an object, got {}",
                json_type_name(&other)
            ))),
        }
    }
}

/// Input accepted by `send_request`
#[derive(Debug, Clone)]
pub enum RequestInput {
    /// Raw option bundle, prepared before the chain runs
    Prepare(RequestPrepareOptions),
    /// Already-built descriptor, validated before the chain runs
    Descriptor(RequestDescriptor),
}

impl RequestInput {
    /// Resolve into a validated descriptor
    ///
    /// # Errors
    /// Returns a configuration-class error if validation fails.
    pub fn into_descriptor(self) -> Result<RequestDescriptor, RestError> {
        match self {
            Self::Prepare(options) => RequestDescriptor::prepare(options),
            Self::Descriptor(descriptor) => {
                descriptor.validate()?;
                Ok(descriptor)
            }
        }
    }
}

impl From<RequestPrepareOptions> for RequestInput {
    fn from(options: RequestPrepareOptions) -> Self {
        Self::Prepare(options)
    }
}

impl From<RequestDescriptor> for RequestInput {
    fn from(descriptor: RequestDescriptor) -> Self {
        Self::Descriptor(descriptor)
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

fn expand_path_template(
    template: &str,
    parameters: &BTreeMap<String, ParameterValue>,
) -> Result<String, RestError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let end = after.find('}').ok_or_else(|| {
            RestError::configuration(format!("unterminated placeholder in '{template}'"))
        })?;
        let name = &after[..end];
        let value = parameters.get(name).ok_or_else(|| {
            RestError::configuration(format!("path parameter '{name}' is not provided"))
        })?;
        out.push_str(&value.encoded_values().join(","));
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn join_base_and_path(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{base}{}", &path[1..]),
        (false, false) if !path.is_empty() => format!("{base}/{path}"),
        _ => format!("{base}{path}"),
    }
}

fn append_query(url: &str, parameters: &BTreeMap<String, ParameterValue>) -> String {
    if parameters.is_empty() {
        return url.to_owned();
    }
    let pairs: Vec<String> = parameters
        .iter()
        .flat_map(|(name, value)| {
            let name = urlencoding::encode(name).into_owned();
            value
                .encoded_values()
                .into_iter()
                .map(move |v| format!("{name}={v}"))
        })
        .collect();
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{url}{separator}{}", pairs.join("&"))
}

fn parse_absolute_url(raw: &str) -> Result<Url, RestError> {
    let url = Url::parse(raw).map_err(|e| match e {
        url::ParseError::RelativeUrlWithoutBase => RestError::InvalidUri {
            url: raw.to_owned(),
            kind: InvalidUriKind::MissingScheme,
            reason: "missing scheme".to_owned(),
        },
        url::ParseError::EmptyHost => RestError::InvalidUri {
            url: raw.to_owned(),
            kind: InvalidUriKind::MissingAuthority,
            reason: "missing host/authority".to_owned(),
        },
        other => RestError::InvalidUri {
            url: raw.to_owned(),
            kind: InvalidUriKind::ParseError,
            reason: other.to_string(),
        },
    })?;
    check_absolute(&url)?;
    Ok(url)
}

fn check_absolute(url: &Url) -> Result<(), RestError> {
    if !matches!(url.scheme(), "http" | "https") {
        return Err(RestError::InvalidScheme {
            scheme: url.scheme().to_owned(),
            reason: "only http:// and https:// schemes are supported".to_owned(),
        });
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(RestError::InvalidUri {
            url: url.to_string(),
            kind: InvalidUriKind::MissingAuthority,
            reason: "missing host/authority".to_owned(),
        });
    }
    Ok(())
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_rejects_relative_url() {
        let err = RequestDescriptor::new(Method::GET, "/users").unwrap_err();
        assert!(matches!(
            err,
            RestError::InvalidUri {
                kind: InvalidUriKind::MissingScheme,
                ..
            }
        ));
    }

    #[test]
    fn test_new_rejects_unsupported_scheme() {
        let err = RequestDescriptor::new(Method::GET, "ftp://example.com/file").unwrap_err();
        assert!(matches!(err, RestError::InvalidScheme { .. }));
    }

    #[test]
    fn test_counters_start_at_zero_and_grow() {
        let mut req = RequestDescriptor::new(Method::GET, "https://example.com").unwrap();
        assert_eq!(req.redirect_count(), 0);
        assert_eq!(req.retry_count(), 0);
        req.increment_redirect_count();
        req.increment_retry_count();
        req.increment_retry_count();
        assert_eq!(req.redirect_count(), 1);
        assert_eq!(req.retry_count(), 2);
    }

    #[test]
    fn test_headers_case_insensitive_last_write_wins() {
        let mut req = RequestDescriptor::new(Method::GET, "https://example.com").unwrap();
        req.set_header("X-Custom", "one").unwrap();
        req.set_header("x-custom", "two").unwrap();
        assert_eq!(req.header("X-CUSTOM"), Some("two"));
        assert_eq!(req.headers().get_all("x-custom").iter().count(), 1);
    }

    #[test]
    fn test_prepare_requires_method() {
        let options = RequestPrepareOptions {
            url: Some("https://example.com".to_owned()),
            ..Default::default()
        };
        let err = RequestDescriptor::prepare(options).unwrap_err();
        assert!(matches!(err, RestError::Configuration(_)));
    }

    #[test]
    fn test_prepare_requires_url_or_template() {
        let options = RequestPrepareOptions {
            method: Some("GET".to_owned()),
            ..Default::default()
        };
        assert!(matches!(
            RequestDescriptor::prepare(options),
            Err(RestError::Configuration(_))
        ));
    }

    #[test]
    fn test_prepare_path_template_and_query() {
        let options: RequestPrepareOptions = json!({
            "method": "get",
            "baseUrl": "https://example.com/",
            "pathTemplate": "/users/{userName}/tokens",
            "pathParameters": {"userName": "jane doe"},
            "queryParameters": {
                "api-version": "2024-01-01",
                "filter": {"value": "a+b", "skipUrlEncoding": true},
                "tag": ["x", "y z"]
            }
        })
        .try_into()
        .unwrap();

        let req = RequestDescriptor::prepare(options).unwrap();
        assert_eq!(req.method(), Method::GET);
        assert_eq!(
            req.url().as_str(),
            "https://example.com/users/jane%20doe/tokens?api-version=2024-01-01&filter=a+b&tag=x&tag=y%20z"
        );
    }

    #[test]
    fn test_prepare_missing_path_parameter() {
        let options = RequestPrepareOptions {
            method: Some("GET".to_owned()),
            base_url: Some("https://example.com".to_owned()),
            path_template: Some("/users/{id}".to_owned()),
            ..Default::default()
        };
        let err = RequestDescriptor::prepare(options).unwrap_err();
        assert!(err.to_string().contains("'id'"));
    }

    #[test]
    fn test_prepare_json_body_sets_content_type() {
        let mut options = RequestPrepareOptions::new("POST", "https://example.com/users");
        options.body = Some(json!({"name": "jane"}));
        let req = RequestDescriptor::prepare(options).unwrap();
        assert_eq!(req.header("content-type"), Some(JSON_CONTENT_TYPE));
        assert_eq!(req.body(), &RequestBody::Json(json!({"name": "jane"})));
        assert_eq!(
            req.body().to_bytes().unwrap(),
            Bytes::from_static(br#"{"name":"jane"}"#)
        );
    }

    #[test]
    fn test_prepare_keeps_caller_content_type() {
        let mut options = RequestPrepareOptions::new("PUT", "https://example.com/blob");
        options
            .headers
            .insert("Content-Type".to_owned(), "application/merge-patch+json".to_owned());
        options.body = Some(json!({"a": 1}));
        let req = RequestDescriptor::prepare(options).unwrap();
        assert_eq!(
            req.header("content-type"),
            Some("application/merge-patch+json")
        );
    }

    #[test]
    fn test_prepare_raw_string_body() {
        let mut options = RequestPrepareOptions::new("POST", "https://example.com/raw");
        options.body = Some(json!("plain text"));
        options.disable_json_stringify_on_body = true;
        let req = RequestDescriptor::prepare(options).unwrap();
        assert_eq!(
            req.body(),
            &RequestBody::Bytes(Bytes::from_static(b"plain text"))
        );
    }

    #[test]
    fn test_options_from_non_object_values() {
        assert!(matches!(
            RequestPrepareOptions::try_from(serde_json::Value::Null),
            Err(RestError::Configuration(_))
        ));
        let err = RequestPrepareOptions::try_from(json!(42)).unwrap_err();
        assert!(err.to_string().contains("number"));
    }

    #[test]
    fn test_clear_body_drops_body_headers() {
        let mut req = RequestDescriptor::new(Method::POST, "https://example.com").unwrap();
        req.set_json_body(json!({"a": 1}));
        req.clear_body();
        assert!(req.body().is_empty());
        assert!(req.header("content-type").is_none());
    }

    #[test]
    fn test_cancellation_flag() {
        let token = CancellationToken::new();
        let req = RequestDescriptor::new(Method::GET, "https://example.com")
            .unwrap()
            .with_cancellation(token.clone());
        assert!(!req.is_cancelled());
        token.cancel();
        assert!(req.is_cancelled());
    }

    #[test]
    fn test_credentials_scoped_to_pinned_origin() {
        let mut req = RequestDescriptor::new(Method::GET, "https://example.com/a").unwrap();
        assert!(req.may_carry_credentials());

        req.pin_credential_origin();
        req.set_url(Url::parse("https://example.com/b").unwrap());
        assert!(req.may_carry_credentials());

        req.set_url(Url::parse("https://evil.example.org/x").unwrap());
        req.pin_credential_origin();
        assert!(!req.may_carry_credentials());

        req.set_url(Url::parse("https://example.com/back").unwrap());
        assert!(req.may_carry_credentials());
    }
}
