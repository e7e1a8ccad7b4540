#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![warn(warnings)]

//! Service client request pipeline for `ModKit`
//!
//! This crate provides a REST service client built from a fixed chain of
//! request policies in front of a hyper-based transport:
//! - User-Agent token accumulation
//! - Redirect following with cross-origin header stripping
//! - Automatic resource provider registration on `409 MissingSubscriptionRegistration`
//! - Exponential retry for transient statuses and network errors
//! - System-error retry for connection-level failures
//! - Request signing with pluggable credentials (bearer, basic, API key)
//! - Automatic TLS via rustls (HTTPS only by default)
//! - **Transparent response decompression** (gzip, brotli, deflate)
//!
//! Every policy is a tower `Layer`; the chain is assembled once from an
//! ordered list of [`PolicyFactory`] values and cannot change afterwards.
//!
//! # Example
//!
//! ```ignore
//! use modkit_rest::{RequestPrepareOptions, ServiceClient, TokenCredentials};
//!
//! let client = ServiceClient::builder()
//!     .credential(TokenCredentials::new(token))
//!     .user_agent("my-tool/1.0")
//!     .build()?;
//!
//! // Any received status is a response, not an error
//! let resp = client
//!     .send_request(RequestPrepareOptions::new("GET", "https://management.example.com/subscriptions"))
//!     .await?;
//! if resp.is_success() {
//!     let data: serde_json::Value = resp.json()?;
//! }
//! ```

mod builder;
mod client;
mod config;
mod credentials;
mod error;
mod layers;
mod policy;
mod request;
mod response;
#[cfg(test)]
mod testing;
mod tls;
mod transport;

pub use builder::{
    EXPONENTIAL_RETRY_POLICY, REDIRECT_POLICY, RP_REGISTRATION_POLICY, RequestPolicyCreators,
    SIGNING_POLICY, SYSTEM_ERROR_RETRY_POLICY, ServiceClientBuilder, USER_AGENT_POLICY,
    default_policy_factories,
};
pub use client::ServiceClient;
pub use config::{
    DEFAULT_MAX_REDIRECTS, DEFAULT_REGISTRATION_API_VERSION, DEFAULT_RP_REGISTRATION_TIMEOUT_SECS,
    DEFAULT_USER_AGENT, ExponentialBackoff, RedirectConfig, RegistrationConfig, RequestOptions,
    RetryConfig, ServiceClientConfig, SystemRetryConfig, TlsRootConfig, TransportConfig,
    TransportSecurity, default_retryable_statuses,
};
pub use credentials::{
    ApiKeyCredentials, BasicAuthenticationCredentials, Credential, TokenCredentials,
};
pub use error::{BoxError, ErrorClass, InvalidUriKind, NetworkErrorKind, RestError};
pub use layers::{
    MISSING_REGISTRATION_CODE, RETRY_ATTEMPT_HEADER, RedirectLayer, RedirectService,
    RegistrationLayer, RegistrationService, RetryLayer, RetryService, SigningLayer,
    SigningService, SystemRetryLayer, SystemRetryService, UserAgentLayer, UserAgentService,
    UserAgentTokens, calculate_backoff, is_redirect_status, subscription_id,
    unregistered_namespace,
};
pub use policy::{BoxPolicy, PipelineBuilder, PolicyFactory, PolicyFuture, RequestPipeline};
pub use request::{
    JSON_CONTENT_TYPE, ParameterValue, RequestBody, RequestDescriptor, RequestInput,
    RequestPrepareOptions,
};
pub use response::{ResponseEnvelope, parse_retry_after};
pub use transport::HttpTransport;
