//! Tower layers implementing the request policies
//!
//! Every layer wraps a service with the policy signature
//! (`RequestDescriptor` in, `ResponseEnvelope` or `RestError` out).
//!
//! ## Available Layers
//!
//! - [`UserAgentLayer`] - Appends accumulated tokens to the `User-Agent` header
//! - [`RedirectLayer`] - Follows 3xx redirects with security controls
//! - [`RegistrationLayer`] - Registers missing resource providers and retries once
//! - [`RetryLayer`] - Retries transient statuses and network errors with exponential backoff
//! - [`SystemRetryLayer`] - Retries connection-level failures only
//! - [`SigningLayer`] - Signs every request with a credential

mod redirect;
mod registration;
mod retry;
mod signing;
mod system_retry;
mod user_agent;

pub use redirect::{RedirectLayer, RedirectService, is_redirect_status};
pub use registration::{
    MISSING_REGISTRATION_CODE, RegistrationLayer, RegistrationService, subscription_id,
    unregistered_namespace,
};
pub use retry::{RETRY_ATTEMPT_HEADER, RetryLayer, RetryService, calculate_backoff};
pub use signing::{SigningLayer, SigningService};
pub use system_retry::{SystemRetryLayer, SystemRetryService};
pub use user_agent::{UserAgentLayer, UserAgentService, UserAgentTokens};
