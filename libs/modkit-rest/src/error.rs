use crate::request::RequestDescriptor;
use std::fmt;
use thiserror::Error;

/// Boxed error used as the source of transport and signing failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Classification of URL validation failures.
///
/// Provides programmatic matching for different failure modes without
/// relying on unstable error message strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum InvalidUriKind {
    /// URL could not be parsed (malformed syntax)
    ParseError,
    /// URL is missing required host/authority component
    MissingAuthority,
    /// URL is missing required scheme (http/https)
    MissingScheme,
}

/// Failure class of an error raised below the HTTP layer.
///
/// Only these errors are eligible for the system-error retry policy; a
/// received HTTP status never maps to a `NetworkErrorKind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum NetworkErrorKind {
    /// Connection could not be established (generic connect failure)
    Connect,
    /// Remote host actively refused the connection
    ConnectionRefused,
    /// Connection was reset, aborted or closed mid-exchange
    ConnectionReset,
    /// Host name resolution failed
    Dns,
    /// No response was received before the attempt timeout elapsed
    Timeout,
    /// Any other failure below the HTTP layer
    Other,
}

impl fmt::Display for NetworkErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connect => "connect",
            Self::ConnectionRefused => "connection refused",
            Self::ConnectionReset => "connection reset",
            Self::Dns => "dns",
            Self::Timeout => "timeout",
            Self::Other => "other",
        };
        f.write_str(name)
    }
}

/// Coarse error taxonomy used by callers to decide how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorClass {
    /// Malformed construction or call arguments; never retried
    Configuration,
    /// Credential could not sign the request; never retried
    Authentication,
    /// Connection-level failure; retried by the system-error retry policy
    TransientNetwork,
    /// Caller-supplied cancellation signal fired between attempts
    Cancelled,
    /// Response could not be read or decoded
    Protocol,
}

/// Error type of every policy in the request pipeline
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RestError {
    /// Malformed client construction or `send_request` arguments
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// Invalid URL (failed to parse or not absolute)
    ///
    /// Use the `kind` field for programmatic matching. The `reason` field contains
    /// a diagnostic message intended for logging only.
    #[error("Invalid URL '{url}': {reason}")]
    InvalidUri {
        /// The URL that failed to parse
        url: String,
        /// Structured failure classification for programmatic matching
        kind: InvalidUriKind,
        /// Diagnostic message (unstable format, for logging only)
        reason: String,
    },

    /// Invalid URL scheme for transport security configuration
    #[error("URL scheme '{scheme}' not allowed: {reason}")]
    InvalidScheme {
        /// The URL scheme that was rejected
        scheme: String,
        /// Reason the scheme was rejected
        reason: String,
    },

    /// Invalid header name
    #[error("Invalid header name: {0}")]
    InvalidHeaderName(#[from] http::header::InvalidHeaderName),

    /// Invalid header value
    #[error("Invalid header value: {0}")]
    InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),

    /// Credential failed to sign the request
    #[error("Authentication failed: {message}")]
    Authentication {
        /// Diagnostic message
        message: String,
        /// Underlying cause, if any
        #[source]
        source: Option<BoxError>,
        /// Request that was being signed
        request: Option<Box<RequestDescriptor>>,
    },

    /// Failure below the HTTP layer (no response was received)
    #[error("Network error ({kind}): {source}")]
    Network {
        /// Failure class used by the system-error retry policy
        kind: NetworkErrorKind,
        /// Underlying transport error
        #[source]
        source: BoxError,
        /// Request whose attempt failed
        request: Option<Box<RequestDescriptor>>,
    },

    /// TLS setup error
    #[error("TLS error: {0}")]
    Tls(#[source] BoxError),

    /// Response body exceeded size limit
    #[error("Response body too large: limit {limit} bytes, got {actual} bytes")]
    BodyTooLarge { limit: usize, actual: usize },

    /// JSON serialization or parsing error
    #[error("JSON processing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// Cancellation signal observed between attempts
    #[error("Request cancelled")]
    Cancelled {
        /// Request that was cancelled
        request: Option<Box<RequestDescriptor>>,
    },
}

impl RestError {
    /// Build a configuration error from any displayable reason
    #[must_use]
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration(reason.into())
    }

    /// Build a network error for a failed attempt of `request`
    #[must_use]
    pub fn network(
        kind: NetworkErrorKind,
        source: impl Into<BoxError>,
        request: &RequestDescriptor,
    ) -> Self {
        Self::Network {
            kind,
            source: source.into(),
            request: Some(Box::new(request.clone())),
        }
    }

    /// Build an authentication error for `request`
    #[must_use]
    pub fn authentication(message: impl Into<String>, request: &RequestDescriptor) -> Self {
        Self::Authentication {
            message: message.into(),
            source: None,
            request: Some(Box::new(request.clone())),
        }
    }

    /// Build a cancellation error for `request`
    #[must_use]
    pub fn cancelled(request: &RequestDescriptor) -> Self {
        Self::Cancelled {
            request: Some(Box::new(request.clone())),
        }
    }

    /// Map this error onto the caller-facing taxonomy
    #[must_use]
    pub fn kind(&self) -> ErrorClass {
        match self {
            Self::Configuration(_)
            | Self::InvalidUri { .. }
            | Self::InvalidScheme { .. }
            | Self::InvalidHeaderName(_)
            | Self::InvalidHeaderValue(_)
            | Self::Tls(_) => ErrorClass::Configuration,
            Self::Authentication { .. } => ErrorClass::Authentication,
            Self::Network { .. } => ErrorClass::TransientNetwork,
            Self::Cancelled { .. } => ErrorClass::Cancelled,
            Self::BodyTooLarge { .. } | Self::Json(_) => ErrorClass::Protocol,
        }
    }

    /// Network failure class, if this is a network error
    #[must_use]
    pub fn network_kind(&self) -> Option<NetworkErrorKind> {
        match self {
            Self::Network { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// The request attached for diagnostics, if any
    #[must_use]
    pub fn request(&self) -> Option<&RequestDescriptor> {
        match self {
            Self::Authentication { request, .. }
            | Self::Network { request, .. }
            | Self::Cancelled { request } => request.as_deref(),
            _ => None,
        }
    }
}
