use crate::client::ServiceClient;
use crate::config::{
    RedirectConfig, RequestOptions, RetryConfig, ServiceClientConfig, SystemRetryConfig,
    TransportConfig, TransportSecurity,
};
use crate::credentials::Credential;
use crate::error::RestError;
use crate::layers::{
    RedirectLayer, RegistrationLayer, RetryLayer, SigningLayer, SystemRetryLayer, UserAgentLayer,
    UserAgentTokens,
};
use crate::policy::{BoxPolicy, PipelineBuilder, PolicyFactory};
use crate::request::RequestDescriptor;
use crate::response::ResponseEnvelope;
use crate::transport::HttpTransport;
use http::{HeaderMap, HeaderName, HeaderValue};
use std::fmt;
use std::sync::Arc;
use tower::Service;
use tower::util::BoxCloneSyncService;

/// Name of the user-agent policy in the default chain
pub const USER_AGENT_POLICY: &str = "user-agent";
/// Name of the redirect policy in the default chain
pub const REDIRECT_POLICY: &str = "redirect";
/// Name of the provider-registration policy in the default chain
pub const RP_REGISTRATION_POLICY: &str = "rp-registration";
/// Name of the exponential retry policy in the default chain
pub const EXPONENTIAL_RETRY_POLICY: &str = "exponential-retry";
/// Name of the system-error retry policy in the default chain
pub const SYSTEM_ERROR_RETRY_POLICY: &str = "system-error-retry";
/// Name of the signing policy in the default chain
pub const SIGNING_POLICY: &str = "signing";

type ExtendFn = Box<dyn FnOnce(Vec<PolicyFactory>) -> Vec<PolicyFactory> + Send>;

/// Override of the default policy list
pub enum RequestPolicyCreators {
    /// Use exactly these factories, outermost first
    Replace(Vec<PolicyFactory>),
    /// Edit the default factories (insert, remove, reorder)
    Extend(ExtendFn),
}

impl RequestPolicyCreators {
    /// Build an `Extend` override from a closure
    pub fn extend<F>(f: F) -> Self
    where
        F: FnOnce(Vec<PolicyFactory>) -> Vec<PolicyFactory> + Send + 'static,
    {
        Self::Extend(Box::new(f))
    }

    fn resolve(self, defaults: Vec<PolicyFactory>) -> Vec<PolicyFactory> {
        match self {
            Self::Replace(factories) => factories,
            Self::Extend(f) => f(defaults),
        }
    }
}

impl fmt::Debug for RequestPolicyCreators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Replace(factories) => f.debug_tuple("Replace").field(factories).finish(),
            Self::Extend(_) => f.write_str("Extend(..)"),
        }
    }
}

/// Default policy factories, outermost first.
///
/// Order: user-agent, redirect, provider registration, exponential retry,
/// system-error retry, signing. Both retry policies are left out when
/// `no_retry_policy` is set; signing is left out without a credential.
///
/// Network failure kinds handled by an enabled system-error retry are not
/// retried again by the exponential retry.
#[must_use]
pub fn default_policy_factories(
    config: &ServiceClientConfig,
    credential: Option<Arc<dyn Credential>>,
    tokens: &UserAgentTokens,
) -> Vec<PolicyFactory> {
    let mut factories = vec![
        PolicyFactory::from_layer(USER_AGENT_POLICY, UserAgentLayer::new(tokens.clone())),
        PolicyFactory::from_layer(REDIRECT_POLICY, RedirectLayer::new(config.redirect.clone())),
        PolicyFactory::from_layer(
            RP_REGISTRATION_POLICY,
            RegistrationLayer::new(config.effective_registration()),
        ),
    ];

    if !config.no_retry_policy {
        let mut retry = RetryLayer::new(config.retry.clone());
        if config.system_retry.max_retries > 0 {
            retry = retry.defer_network_kinds(config.system_retry.retry_on.clone());
        }
        factories.push(PolicyFactory::from_layer(EXPONENTIAL_RETRY_POLICY, retry));
        factories.push(PolicyFactory::from_layer(
            SYSTEM_ERROR_RETRY_POLICY,
            SystemRetryLayer::new(config.system_retry.clone()),
        ));
    }

    if let Some(credential) = credential {
        factories.push(PolicyFactory::from_layer(
            SIGNING_POLICY,
            SigningLayer::new(credential),
        ));
    }

    factories
}

/// Builder for constructing a [`ServiceClient`]
#[must_use]
pub struct ServiceClientBuilder {
    config: ServiceClientConfig,
    credential: Option<Arc<dyn Credential>>,
    policy_creators: Option<RequestPolicyCreators>,
    transport: Option<BoxPolicy>,
}

impl ServiceClientBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self::with_config(ServiceClientConfig::default())
    }

    /// Create a builder with a specific configuration
    pub fn with_config(config: ServiceClientConfig) -> Self {
        Self {
            config,
            credential: None,
            policy_creators: None,
            transport: None,
        }
    }

    /// Sign every request with `credential`
    pub fn credential(self, credential: impl Credential + 'static) -> Self {
        self.shared_credential(Arc::new(credential))
    }

    /// Sign every request with a shared credential
    pub fn shared_credential(mut self, credential: Arc<dyn Credential>) -> Self {
        self.credential = Some(credential);
        self
    }

    /// Defaults merged into every request
    pub fn request_options(mut self, options: RequestOptions) -> Self {
        self.config.request_options = options;
        self
    }

    /// Leave both retry policies out of the chain
    pub fn no_retry_policy(mut self, disabled: bool) -> Self {
        self.config.no_retry_policy = disabled;
        self
    }

    /// Provider registration timeout in seconds
    pub fn rp_registration_retry_timeout(mut self, seconds: u64) -> Self {
        self.config.rp_registration_retry_timeout = seconds;
        self
    }

    /// Set the exponential retry configuration
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    /// Set the system-error retry configuration
    pub fn system_retry(mut self, retry: SystemRetryConfig) -> Self {
        self.config.system_retry = retry;
        self
    }

    /// Set the redirect policy configuration
    pub fn redirect(mut self, config: RedirectConfig) -> Self {
        self.config.redirect = config;
        self
    }

    /// Disable redirect following
    ///
    /// Equivalent to `.redirect(RedirectConfig::disabled())`: 3xx responses
    /// are returned to the caller as-is.
    pub fn no_redirects(mut self) -> Self {
        self.config.redirect = RedirectConfig::disabled();
        self
    }

    /// Configure the built-in transport
    pub fn transport_config(mut self, config: TransportConfig) -> Self {
        self.config.transport = config;
        self
    }

    /// Allow insecure HTTP connections (for testing only)
    ///
    /// **WARNING**: This should only be used for local testing with mock servers.
    ///
    /// Only available in debug builds or with the `allow-insecure-http` feature.
    #[cfg(any(debug_assertions, feature = "allow-insecure-http"))]
    pub fn allow_insecure_http(mut self) -> Self {
        tracing::warn!(
            target: "modkit_rest::security",
            "allow_insecure_http() called - HTTP traffic will NOT be encrypted"
        );
        self.config.transport.security = TransportSecurity::AllowInsecureHttp;
        self
    }

    /// Add a user agent token sent after the library token
    pub fn user_agent(mut self, token: impl Into<String>) -> Self {
        self.config.user_agent.push(token.into());
        self
    }

    /// Replace or edit the default policy list
    pub fn request_policy_creators(mut self, creators: RequestPolicyCreators) -> Self {
        self.policy_creators = Some(creators);
        self
    }

    /// Use a custom transport sender instead of [`HttpTransport`]
    pub fn transport<S>(mut self, transport: S) -> Self
    where
        S: Service<RequestDescriptor, Response = ResponseEnvelope, Error = RestError>
            + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        self.transport = Some(BoxCloneSyncService::new(transport));
        self
    }

    /// Build the client with its fixed policy chain
    ///
    /// # Errors
    /// Returns a configuration-class error for invalid user agent tokens or
    /// default headers, and `RestError::Tls` if the built-in transport
    /// cannot initialize TLS.
    pub fn build(self) -> Result<ServiceClient, RestError> {
        let tokens = UserAgentTokens::new();
        for token in &self.config.user_agent {
            tokens.add(token)?;
        }

        let default_headers = parse_default_headers(&self.config.request_options)?;

        let defaults = default_policy_factories(&self.config, self.credential, &tokens);
        let factories = match self.policy_creators {
            Some(creators) => creators.resolve(defaults),
            None => defaults,
        };

        let transport = match self.transport {
            Some(transport) => transport,
            None => BoxCloneSyncService::new(HttpTransport::new(&self.config.transport)?),
        };

        let pipeline = PipelineBuilder::new()
            .policies(factories)
            .transport(transport)
            .build()?;

        tracing::debug!(policies = ?pipeline.policy_names(), "Service client built");

        Ok(ServiceClient {
            pipeline,
            tokens,
            default_headers: Arc::new(default_headers),
            default_timeout: self.config.request_options.timeout,
        })
    }
}

impl Default for ServiceClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_default_headers(options: &RequestOptions) -> Result<HeaderMap, RestError> {
    let mut headers = HeaderMap::new();
    for (name, value) in &options.headers {
        let name = HeaderName::try_from(name.as_str())
            .map_err(|e| RestError::configuration(format!("default header '{name}': {e}")))?;
        let value = HeaderValue::try_from(value.as_str())
            .map_err(|e| RestError::configuration(format!("default header '{name}': {e}")))?;
        headers.insert(name, value);
    }
    Ok(headers)
}
