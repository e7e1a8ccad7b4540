//! Credentials used by the signing policy

use crate::error::RestError;
use crate::request::RequestDescriptor;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use http::header::{AUTHORIZATION, HeaderName};
use http::HeaderValue;
use secrecy::{ExposeSecret, SecretString};
use std::collections::BTreeMap;
use std::fmt;
use zeroize::Zeroizing;

/// Capability that attaches authentication material to a request
#[async_trait]
pub trait Credential: Send + Sync {
    /// Sign `request` in place.
    ///
    /// # Errors
    /// Returns `RestError::Authentication` if the signing material is missing,
    /// expired or cannot be expressed on the request.
    async fn sign(&self, request: &mut RequestDescriptor) -> Result<(), RestError>;
}

fn sensitive_value(raw: &str, request: &RequestDescriptor) -> Result<HeaderValue, RestError> {
    let mut value = HeaderValue::from_str(raw).map_err(|e| RestError::Authentication {
        message: "credential produced an invalid header value".to_owned(),
        source: Some(Box::new(e)),
        request: Some(Box::new(request.clone())),
    })?;
    value.set_sensitive(true);
    Ok(value)
}

/// `Authorization: <scheme> <token>` credential
#[derive(Clone)]
pub struct TokenCredentials {
    token: SecretString,
    scheme: String,
}

impl TokenCredentials {
    /// Bearer token credential
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self::with_scheme(token, "Bearer")
    }

    /// Token credential with a custom authorization scheme
    #[must_use]
    pub fn with_scheme(token: impl Into<String>, scheme: impl Into<String>) -> Self {
        Self {
            token: SecretString::from(token.into()),
            scheme: scheme.into(),
        }
    }
}

impl fmt::Debug for TokenCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCredentials")
            .field("scheme", &self.scheme)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

#[async_trait]
impl Credential for TokenCredentials {
    async fn sign(&self, request: &mut RequestDescriptor) -> Result<(), RestError> {
        let token = self.token.expose_secret();
        if token.trim().is_empty() {
            return Err(RestError::authentication("token is empty", request));
        }
        let raw = Zeroizing::new(format!("{} {token}", self.scheme));
        let value = sensitive_value(&raw, request)?;
        request.headers_mut().insert(AUTHORIZATION, value);
        Ok(())
    }
}

/// RFC 7617 `Basic` credential
#[derive(Clone)]
pub struct BasicAuthenticationCredentials {
    user_name: String,
    password: SecretString,
}

impl BasicAuthenticationCredentials {
    #[must_use]
    pub fn new(user_name: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user_name: user_name.into(),
            password: SecretString::from(password.into()),
        }
    }
}

impl fmt::Debug for BasicAuthenticationCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicAuthenticationCredentials")
            .field("user_name", &self.user_name)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

#[async_trait]
impl Credential for BasicAuthenticationCredentials {
    async fn sign(&self, request: &mut RequestDescriptor) -> Result<(), RestError> {
        if self.user_name.is_empty() {
            return Err(RestError::authentication("user name is empty", request));
        }
        if self.user_name.contains(':') {
            return Err(RestError::authentication(
                "user name cannot contain ':'",
                request,
            ));
        }
        let pair = Zeroizing::new(format!(
            "{}:{}",
            self.user_name,
            self.password.expose_secret()
        ));
        let raw = Zeroizing::new(format!("Basic {}", STANDARD.encode(pair.as_bytes())));
        let value = sensitive_value(&raw, request)?;
        request.headers_mut().insert(AUTHORIZATION, value);
        Ok(())
    }
}

/// API key material sent as headers and/or query parameters
#[derive(Clone, Default)]
pub struct ApiKeyCredentials {
    headers: BTreeMap<String, SecretString>,
    query: BTreeMap<String, SecretString>,
}

impl ApiKeyCredentials {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Send `value` in header `name`
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.into(), SecretString::from(value.into()));
        self
    }

    /// Send `value` as query parameter `name`
    #[must_use]
    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), SecretString::from(value.into()));
        self
    }
}

impl fmt::Debug for ApiKeyCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKeyCredentials")
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .field("query", &self.query.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[async_trait]
impl Credential for ApiKeyCredentials {
    async fn sign(&self, request: &mut RequestDescriptor) -> Result<(), RestError> {
        if self.headers.is_empty() && self.query.is_empty() {
            return Err(RestError::authentication(
                "api key credentials carry no key material",
                request,
            ));
        }

        for (name, secret) in &self.headers {
            let name = HeaderName::try_from(name.as_str()).map_err(|e| RestError::Authentication {
                message: format!("invalid api key header name '{name}'"),
                source: Some(Box::new(e)),
                request: Some(Box::new(request.clone())),
            })?;
            let value = sensitive_value(secret.expose_secret(), request)?;
            request.headers_mut().insert(name, value);
        }

        if !self.query.is_empty() {
            let mut url = request.url().clone();
            {
                // Replace any previous value so repeated signing stays idempotent
                let kept: Vec<(String, String)> = url
                    .query_pairs()
                    .filter(|(k, _)| !self.query.contains_key(k.as_ref()))
                    .map(|(k, v)| (k.into_owned(), v.into_owned()))
                    .collect();
                let mut pairs = url.query_pairs_mut();
                pairs.clear();
                pairs.extend_pairs(kept);
                for (name, secret) in &self.query {
                    pairs.append_pair(name, secret.expose_secret());
                }
            }
            request.set_url(url);
        }

        Ok(())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::error::ErrorClass;
    use http::Method;

    fn request() -> RequestDescriptor {
        RequestDescriptor::new(Method::GET, "https://example.com/items?page=2").unwrap()
    }

    #[tokio::test]
    async fn test_bearer_token_signs_authorization() {
        let mut req = request();
        TokenCredentials::new("abc123").sign(&mut req).await.unwrap();
        assert_eq!(req.header("authorization"), Some("Bearer abc123"));
        assert!(req.headers()[AUTHORIZATION].is_sensitive());
    }

    #[tokio::test]
    async fn test_custom_scheme() {
        let mut req = request();
        TokenCredentials::with_scheme("xyz", "SharedKey")
            .sign(&mut req)
            .await
            .unwrap();
        assert_eq!(req.header("authorization"), Some("SharedKey xyz"));
    }

    #[tokio::test]
    async fn test_empty_token_is_authentication_error() {
        let mut req = request();
        let err = TokenCredentials::new("").sign(&mut req).await.unwrap_err();
        assert_eq!(err.kind(), ErrorClass::Authentication);
        assert!(err.request().is_some());
    }

    #[tokio::test]
    async fn test_token_with_newline_is_authentication_error() {
        let mut req = request();
        let err = TokenCredentials::new("abc\n")
            .sign(&mut req)
            .await
            .unwrap_err();
        assert!(matches!(err, RestError::Authentication { .. }));
    }

    #[tokio::test]
    async fn test_basic_credentials() {
        let mut req = request();
        BasicAuthenticationCredentials::new("Aladdin", "open sesame")
            .sign(&mut req)
            .await
            .unwrap();
        assert_eq!(
            req.header("authorization"),
            Some("Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ==")
        );
    }

    #[tokio::test]
    async fn test_basic_rejects_colon_in_user() {
        let mut req = request();
        let err = BasicAuthenticationCredentials::new("a:b", "pw")
            .sign(&mut req)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorClass::Authentication);
    }

    #[tokio::test]
    async fn test_api_key_header_and_query() {
        let credentials = ApiKeyCredentials::new()
            .header("x-api-key", "k1")
            .query("code", "q1");

        let mut req = request();
        credentials.sign(&mut req).await.unwrap();
        credentials.sign(&mut req).await.unwrap();

        assert_eq!(req.header("x-api-key"), Some("k1"));
        assert_eq!(req.url().query(), Some("page=2&code=q1"));
    }

    #[tokio::test]
    async fn test_api_key_without_material_fails() {
        let mut req = request();
        let err = ApiKeyCredentials::new().sign(&mut req).await.unwrap_err();
        assert_eq!(err.kind(), ErrorClass::Authentication);
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let debug = format!("{:?}", TokenCredentials::new("super-secret"));
        assert!(!debug.contains("super-secret"));
        let debug = format!("{:?}", BasicAuthenticationCredentials::new("u", "hunter2"));
        assert!(!debug.contains("hunter2"));
    }
}
