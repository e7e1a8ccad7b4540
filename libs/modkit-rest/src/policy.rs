//! Policy chain composition
//!
//! A policy is any `tower::Service<RequestDescriptor>` that answers with a
//! [`ResponseEnvelope`] or a [`RestError`]. Policies are built from named
//! [`PolicyFactory`] values, each wrapping the policy immediately inward of
//! it. The first factory in a list is the outermost policy; the transport
//! sender is always innermost.

use crate::error::RestError;
use crate::request::{RequestDescriptor, RequestInput};
use crate::response::ResponseEnvelope;
use std::borrow::Cow;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tower::util::BoxCloneSyncService;
use tower::{Layer, Service, ServiceExt};

/// Type-erased policy (or transport) handle
pub type BoxPolicy = BoxCloneSyncService<RequestDescriptor, ResponseEnvelope, RestError>;

/// Future returned by every built-in policy
pub type PolicyFuture = Pin<Box<dyn Future<Output = Result<ResponseEnvelope, RestError>> + Send>>;

type CreateFn = dyn Fn(BoxPolicy) -> BoxPolicy + Send + Sync;

/// Named constructor of one policy instance, given its inward delegate
#[derive(Clone)]
pub struct PolicyFactory {
    name: Cow<'static, str>,
    create: Arc<CreateFn>,
}

impl PolicyFactory {
    /// Create a factory from a closure wrapping the next policy
    pub fn new<F>(name: impl Into<Cow<'static, str>>, create: F) -> Self
    where
        F: Fn(BoxPolicy) -> BoxPolicy + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            create: Arc::new(create),
        }
    }

    /// Adapt a tower layer whose services follow the policy signature
    pub fn from_layer<L>(name: impl Into<Cow<'static, str>>, layer: L) -> Self
    where
        L: Layer<BoxPolicy> + Send + Sync + 'static,
        L::Service: Service<RequestDescriptor, Response = ResponseEnvelope, Error = RestError>
            + Clone
            + Send
            + Sync
            + 'static,
        <L::Service as Service<RequestDescriptor>>::Future: Send + 'static,
    {
        Self::new(name, move |next| BoxCloneSyncService::new(layer.layer(next)))
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Build the policy around `next`
    #[must_use]
    pub fn create(&self, next: BoxPolicy) -> BoxPolicy {
        (self.create)(next)
    }
}

impl fmt::Debug for PolicyFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyFactory")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Builder assembling an ordered policy list around a transport sender
#[derive(Default)]
#[must_use]
pub struct PipelineBuilder {
    factories: Vec<PolicyFactory>,
    transport: Option<BoxPolicy>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a policy; earlier policies are outward of later ones
    pub fn policy(mut self, factory: PolicyFactory) -> Self {
        self.factories.push(factory);
        self
    }

    /// Append several policies in order
    pub fn policies(mut self, factories: impl IntoIterator<Item = PolicyFactory>) -> Self {
        self.factories.extend(factories);
        self
    }

    /// Set the innermost sender that performs the network exchange
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

    /// Compose the chain.
    ///
    /// # Errors
    /// Returns `RestError::Configuration` if no transport sender was set.
    pub fn build(self) -> Result<RequestPipeline, RestError> {
        let transport = self
            .transport
            .ok_or_else(|| RestError::configuration("a transport sender is required"))?;

        let names = self
            .factories
            .iter()
            .map(|f| f.name().to_owned())
            .collect();
        let head = self
            .factories
            .iter()
            .rev()
            .fold(transport, |next, factory| factory.create(next));

        Ok(RequestPipeline { head, names })
    }
}

/// Fixed, composed policy chain
#[derive(Clone)]
pub struct RequestPipeline {
    head: BoxPolicy,
    names: Vec<String>,
}

impl RequestPipeline {
    #[must_use]
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    /// Policy names, outermost first
    #[must_use]
    pub fn policy_names(&self) -> &[String] {
        &self.names
    }

    /// Validate `input` and run it through the chain.
    ///
    /// # Errors
    /// Returns a configuration-class error for invalid input, otherwise
    /// whatever the chain produces.
    pub async fn send_request(
        &self,
        input: impl Into<RequestInput>,
    ) -> Result<ResponseEnvelope, RestError> {
        let descriptor = input.into().into_descriptor()?;
        self.dispatch(descriptor).await
    }

    /// Run an already validated descriptor through the chain
    pub(crate) async fn dispatch(
        &self,
        descriptor: RequestDescriptor,
    ) -> Result<ResponseEnvelope, RestError> {
        self.head.clone().oneshot(descriptor).await
    }
}

impl fmt::Debug for RequestPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestPipeline")
            .field("policies", &self.names)
            .finish_non_exhaustive()
    }
}
