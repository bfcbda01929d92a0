//! Request Resolution
//!
//! A resolver turns a [`ConnectionRequest`] into a [`ConnectionDescriptor`].
//! New request styles are supported by adding a resolver, without touching
//! the pool or the session service.
//!
//! ```text
//!                      ┌───────────────────┐
//!   request ─────────> │ CompositeResolver │
//!                      └─────────┬─────────┘
//!            first resolver whose supports() is true
//!               ┌────────────────┴───────────────┐
//!               ▼                                ▼
//!      ┌────────────────┐              ┌───────────────────────┐
//!      │ TokenResolver  │              │ DirectDescriptorRes.  │
//!      │ token -> store │              │ addr/pw/db -> fields  │
//!      └────────────────┘              └───────────────────────┘
//! ```

use crate::session::descriptor::{parse_address, ConnectionDescriptor, PoolTuning};
use crate::session::error::SessionError;
use crate::session::request::ConnectionRequest;
use crate::session::token::TokenStore;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::trace;

/// Strategy for extracting a descriptor from one request style.
#[async_trait]
pub trait Resolver: Send + Sync {
    fn name(&self) -> &'static str;

    fn supports(&self, request: &dyn ConnectionRequest) -> bool;

    async fn resolve(
        &self,
        request: &dyn ConnectionRequest,
    ) -> Result<ConnectionDescriptor, SessionError>;
}

/// Builds a descriptor from the connection fields carried by the request.
///
/// Absent pool tuning fields take the resolver's defaults. Supplied ones
/// become part of the descriptor and therefore of its identity.
#[derive(Debug, Clone, Default)]
pub struct DirectDescriptorResolver {
    defaults: PoolTuning,
}

impl DirectDescriptorResolver {
    pub fn new(defaults: PoolTuning) -> Self {
        Self { defaults }
    }

    pub fn defaults(&self) -> PoolTuning {
        self.defaults
    }

    /// Synchronous core of [`Resolver::resolve`].
    pub fn descriptor_for(
        &self,
        request: &dyn ConnectionRequest,
    ) -> Result<ConnectionDescriptor, SessionError> {
        let target = request
            .target()
            .ok_or(SessionError::UnsupportedShape(self.name()))?;

        let (host, port) = parse_address(&target.addr)?;
        let tuning = PoolTuning {
            pool_size: target.pool_size.unwrap_or(self.defaults.pool_size),
            min_idle: target.min_idle.unwrap_or(self.defaults.min_idle),
            max_retries: target.max_retries.unwrap_or(self.defaults.max_retries),
        };

        let descriptor = ConnectionDescriptor::new(host, port)
            .with_credential(target.password.clone())
            .with_namespace(target.db)
            .with_tuning(tuning);
        descriptor.validate()?;
        Ok(descriptor)
    }
}

#[async_trait]
impl Resolver for DirectDescriptorResolver {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn supports(&self, request: &dyn ConnectionRequest) -> bool {
        request.target().is_some()
    }

    async fn resolve(
        &self,
        request: &dyn ConnectionRequest,
    ) -> Result<ConnectionDescriptor, SessionError> {
        self.descriptor_for(request)
    }
}

/// Looks bearer tokens up in a [`TokenStore`].
pub struct TokenResolver {
    store: Arc<dyn TokenStore>,
}

impl TokenResolver {
    pub fn new(store: Arc<dyn TokenStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Resolver for TokenResolver {
    fn name(&self) -> &'static str {
        "token"
    }

    fn supports(&self, request: &dyn ConnectionRequest) -> bool {
        request.bearer_token().is_some()
    }

    async fn resolve(
        &self,
        request: &dyn ConnectionRequest,
    ) -> Result<ConnectionDescriptor, SessionError> {
        let token = request
            .bearer_token()
            .ok_or(SessionError::UnsupportedShape(self.name()))?;
        if token.is_empty() {
            return Err(SessionError::TokenNotFound);
        }
        self.store.get(token).await
    }
}

/// Ordered list of resolvers. The first one that supports a request
/// resolves it; later ones are not consulted even if the first fails.
#[derive(Default)]
pub struct CompositeResolver {
    resolvers: Vec<Arc<dyn Resolver>>,
}

impl CompositeResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a resolver. Earlier registrations win ties.
    pub fn with(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolvers.push(resolver);
        self
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.resolvers.iter().map(|r| r.name()).collect()
    }
}

#[async_trait]
impl Resolver for CompositeResolver {
    fn name(&self) -> &'static str {
        "composite"
    }

    fn supports(&self, request: &dyn ConnectionRequest) -> bool {
        self.resolvers.iter().any(|r| r.supports(request))
    }

    async fn resolve(
        &self,
        request: &dyn ConnectionRequest,
    ) -> Result<ConnectionDescriptor, SessionError> {
        let resolver = self
            .resolvers
            .iter()
            .find(|r| r.supports(request))
            .ok_or_else(|| SessionError::UnsupportedRequest(request.describe().to_string()))?;

        trace!(resolver = resolver.name(), "Resolving request");
        resolver.resolve(request).await
    }
}
