use crate::error::NetworkErrorKind;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

/// Default User-Agent token identifying this library
pub const DEFAULT_USER_AGENT: &str = concat!("modkit-rest/", env!("CARGO_PKG_VERSION"));

/// Default provider-registration timeout in seconds
pub const DEFAULT_RP_REGISTRATION_TIMEOUT_SECS: u64 = 30;

/// Default API version used by provider registration calls
pub const DEFAULT_REGISTRATION_API_VERSION: &str = "2016-02-01";

/// Default maximum number of redirects followed per request
pub const DEFAULT_MAX_REDIRECTS: u32 = 20;

/// HTTP statuses retried by the exponential retry policy by default
///
/// 408, 429 and every 5xx except 501 (Not Implemented) and 505 (HTTP
/// Version Not Supported).
#[must_use]
pub fn default_retryable_statuses() -> HashSet<u16> {
    let mut statuses: HashSet<u16> = (500..600).filter(|s| *s != 501 && *s != 505).collect();
    statuses.insert(408);
    statuses.insert(429);
    statuses
}

/// Exponential backoff configuration for retries
///
/// Computes delay as: `min(initial * multiplier^attempt, max)`, then adds
/// jitter drawn from `[0, delay)` when enabled.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExponentialBackoff {
    /// Initial backoff duration (default: 100ms)
    #[serde(with = "humantime_serde")]
    pub initial: Duration,

    /// Maximum backoff duration before jitter (default: 10s)
    #[serde(with = "humantime_serde")]
    pub max: Duration,

    /// Backoff multiplier for exponential growth (default: 2.0)
    pub multiplier: f64,

    /// Enable jitter to prevent thundering herd (default: true)
    pub jitter: bool,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl ExponentialBackoff {
    /// Create backoff with custom initial and max durations
    #[must_use]
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            ..Default::default()
        }
    }

    /// Create fast backoff for testing (1ms initial, 100ms max, no jitter)
    #[must_use]
    pub fn fast() -> Self {
        Self {
            initial: Duration::from_millis(1),
            max: Duration::from_millis(100),
            multiplier: 2.0,
            jitter: false,
        }
    }
}

/// Exponential retry policy configuration (HTTP status and network errors)
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    /// Maximum number of retries after the initial attempt (default: 3)
    /// Total attempts = 1 (initial) + `max_retries`
    pub max_retries: u32,

    /// Backoff strategy configuration
    pub backoff: ExponentialBackoff,

    /// HTTP statuses considered transient
    pub retryable_statuses: HashSet<u16>,

    /// Also retry `RestError::Network` outcomes (default: true)
    pub retry_network_errors: bool,

    /// If true, ignore the `Retry-After` header and always use the backoff
    pub ignore_retry_after: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: ExponentialBackoff::default(),
            retryable_statuses: default_retryable_statuses(),
            retry_network_errors: true,
            ignore_retry_after: false,
        }
    }
}

impl RetryConfig {
    /// Create config with no retries
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Whether `status` is in the retryable set
    #[must_use]
    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.retryable_statuses.contains(&status)
    }
}

/// System/network-error retry policy configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SystemRetryConfig {
    /// Maximum number of retries after the initial attempt (default: 3)
    pub max_retries: u32,

    /// Backoff strategy configuration
    pub backoff: ExponentialBackoff,

    /// Network failure classes that trigger a retry
    pub retry_on: HashSet<NetworkErrorKind>,
}

impl Default for SystemRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: ExponentialBackoff::default(),
            retry_on: HashSet::from([
                NetworkErrorKind::Connect,
                NetworkErrorKind::ConnectionRefused,
                NetworkErrorKind::ConnectionReset,
                NetworkErrorKind::Dns,
                NetworkErrorKind::Timeout,
            ]),
        }
    }
}

impl SystemRetryConfig {
    /// Create config with no retries
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }
}

/// Configuration for redirect behavior
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RedirectConfig {
    /// Maximum number of redirects to follow (default: 20)
    ///
    /// Set to `0` to return every 3xx response as-is.
    pub max_redirects: u32,

    /// Strip `Authorization`, `Cookie` and `Proxy-Authorization` on
    /// cross-origin hops (default: true)
    pub strip_sensitive_headers: bool,

    /// Follow HTTPS → HTTP redirects (default: false)
    pub allow_https_downgrade: bool,
}

impl Default for RedirectConfig {
    fn default() -> Self {
        Self {
            max_redirects: DEFAULT_MAX_REDIRECTS,
            strip_sensitive_headers: true,
            allow_https_downgrade: false,
        }
    }
}

impl RedirectConfig {
    /// Create a configuration that disables redirect following
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            max_redirects: 0,
            ..Default::default()
        }
    }

    /// Create a configuration for testing against plain-HTTP mock servers
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            allow_https_downgrade: true,
            ..Default::default()
        }
    }
}

/// Provider auto-registration configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegistrationConfig {
    /// Total time allowed for registration to complete (default: 30s)
    ///
    /// Inside a [`ServiceClientConfig`] this value is ignored and
    /// `rp_registration_retry_timeout` applies instead.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Delay between registration state polls (default: 5s)
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// `api-version` query value of registration calls
    pub api_version: String,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_RP_REGISTRATION_TIMEOUT_SECS),
            poll_interval: Duration::from_secs(5),
            api_version: DEFAULT_REGISTRATION_API_VERSION.to_owned(),
        }
    }
}

/// TLS root certificate configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum TlsRootConfig {
    /// Use Mozilla's root certificates (webpki-roots, no OS dependency)
    #[default]
    WebPki,
    /// Use OS native root certificate store
    Native,
}

/// Transport security configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum TransportSecurity {
    /// Require TLS for all connections (HTTPS only) - default and recommended
    #[default]
    TlsOnly,
    /// Allow insecure HTTP connections (for testing with mock servers only)
    AllowInsecureHttp,
}

/// Configuration of the built-in hyper transport
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportConfig {
    /// Per-attempt timeout when the request carries none (default: 30s)
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Maximum decoded response body size in bytes (default: 10 MB)
    pub max_body_size: usize,

    /// Transport security mode (default: `TlsOnly`)
    pub security: TransportSecurity,

    /// TLS root certificate strategy (default: `WebPki`)
    pub tls_roots: TlsRootConfig,

    /// Timeout for idle pooled connections (default: 90s)
    #[serde(with = "humantime_serde::option")]
    pub pool_idle_timeout: Option<Duration>,

    /// Maximum number of idle connections per host (default: 32)
    pub pool_max_idle_per_host: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            max_body_size: 10 * 1024 * 1024, // 10 MB
            security: TransportSecurity::TlsOnly,
            tls_roots: TlsRootConfig::default(),
            pool_idle_timeout: Some(Duration::from_secs(90)),
            pool_max_idle_per_host: 32,
        }
    }
}

impl TransportConfig {
    /// Create configuration for testing with mock servers (allows insecure HTTP)
    ///
    /// **WARNING**: Use only for local testing, never in production.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            max_body_size: 1024 * 1024, // 1 MB
            security: TransportSecurity::AllowInsecureHttp,
            tls_roots: TlsRootConfig::default(),
            pool_idle_timeout: Some(Duration::from_secs(10)),
            pool_max_idle_per_host: 4,
        }
    }
}

/// Transport-level defaults merged into every request
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RequestOptions {
    /// Headers added when the request does not already carry them
    pub headers: BTreeMap<String, String>,

    /// Per-attempt timeout when the request carries none
    #[serde(with = "humantime_serde::option")]
    pub timeout: Option<Duration>,
}

/// Overall service client configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceClientConfig {
    /// Defaults merged into every request
    pub request_options: RequestOptions,

    /// Omit both retry policies from the chain (default: false)
    pub no_retry_policy: bool,

    /// Provider registration timeout in seconds (default: 30)
    pub rp_registration_retry_timeout: u64,

    /// Exponential retry policy configuration
    pub retry: RetryConfig,

    /// System-error retry policy configuration
    pub system_retry: SystemRetryConfig,

    /// Redirect policy configuration
    pub redirect: RedirectConfig,

    /// Provider registration polling; its `timeout` is overridden by
    /// `rp_registration_retry_timeout`
    pub registration: RegistrationConfig,

    /// Built-in transport configuration
    pub transport: TransportConfig,

    /// Extra user agent tokens appended after the library token
    pub user_agent: Vec<String>,
}

impl Default for ServiceClientConfig {
    fn default() -> Self {
        Self {
            request_options: RequestOptions::default(),
            no_retry_policy: false,
            rp_registration_retry_timeout: DEFAULT_RP_REGISTRATION_TIMEOUT_SECS,
            retry: RetryConfig::default(),
            system_retry: SystemRetryConfig::default(),
            redirect: RedirectConfig::default(),
            registration: RegistrationConfig::default(),
            transport: TransportConfig::default(),
            user_agent: Vec::new(),
        }
    }
}

impl ServiceClientConfig {
    /// Create configuration for testing with mock servers
    ///
    /// Plain HTTP is allowed and backoff is fast and deterministic.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            retry: RetryConfig {
                backoff: ExponentialBackoff::fast(),
                ..RetryConfig::default()
            },
            system_retry: SystemRetryConfig {
                backoff: ExponentialBackoff::fast(),
                ..SystemRetryConfig::default()
            },
            redirect: RedirectConfig::for_testing(),
            transport: TransportConfig::for_testing(),
            ..Self::default()
        }
    }

    /// Registration settings with the effective timeout applied
    ///
    /// `rp_registration_retry_timeout` always wins over `registration.timeout`.
    #[must_use]
    pub fn effective_registration(&self) -> RegistrationConfig {
        RegistrationConfig {
            timeout: Duration::from_secs(self.rp_registration_retry_timeout),
            ..self.registration.clone()
        }
    }
}
