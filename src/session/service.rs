//! Session Service
//!
//! Ties resolution, pooling and token storage together:
//!
//! - `get_connection`: request ─> CompositeResolver ─> ConnectionPool
//! - `issue_token`: request ─> DirectDescriptorResolver ─> TokenStore
//! - `refresh_token` / `revoke_token` / `validate_token`: TokenStore
//!
//! Errors from the components are passed through unchanged so front ends
//! can map [`SessionError::code`] to their own status vocabulary.

use crate::backend::ConnectionHandle;
use crate::session::descriptor::PoolTuning;
use crate::session::error::SessionError;
use crate::session::pool::{ConnectionPool, PoolStats};
use crate::session::request::ConnectionRequest;
use crate::session::resolver::{
    CompositeResolver, DirectDescriptorResolver, Resolver, TokenResolver,
};
use crate::session::token::{
    generate_token, unix_seconds, OsRandom, RandomSource, TokenRecord, TokenStats, TokenStore,
    TokenSummary,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info};

/// A freshly minted token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: SystemTime,
    /// `conn_` followed by the short identity of the target
    pub conn_id: String,
}

impl IssuedToken {
    pub fn expires_at_unix(&self) -> u64 {
        unix_seconds(self.expires_at)
    }
}

/// Merged pool and token snapshots.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub pool: PoolStats,
    pub tokens: TokenStats,
}

/// Result of [`SessionService::health_check`].
#[derive(Debug, Clone, Serialize)]
pub struct SessionHealth {
    /// `healthy` when every pool entry answered its probe, else `degraded`
    pub status: &'static str,
    /// Identity hex digest to `ok` or the failure message
    pub connections: BTreeMap<String, String>,
    pub tokens: TokenStats,
}

impl SessionHealth {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

/// Entry point for everything that needs a backend connection or a token.
pub struct SessionService {
    resolver: CompositeResolver,
    direct: DirectDescriptorResolver,
    pool: ConnectionPool,
    tokens: Arc<dyn TokenStore>,
    random: Arc<dyn RandomSource>,
}

impl SessionService {
    /// Builds a service resolving tokens first, then direct targets.
    pub fn new(pool: ConnectionPool, tokens: Arc<dyn TokenStore>, defaults: PoolTuning) -> Self {
        let direct = DirectDescriptorResolver::new(defaults);
        let resolver = CompositeResolver::new()
            .with(Arc::new(TokenResolver::new(Arc::clone(&tokens))))
            .with(Arc::new(direct.clone()));

        Self {
            resolver,
            direct,
            pool,
            tokens,
            random: Arc::new(OsRandom),
        }
    }

    /// Registers an additional resolver after the built-in ones.
    pub fn with_resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = self.resolver.with(resolver);
        self
    }

    /// Replaces the random source used for token suffixes.
    pub fn with_random(mut self, random: Arc<dyn RandomSource>) -> Self {
        self.random = random;
        self
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn tokens(&self) -> &Arc<dyn TokenStore> {
        &self.tokens
    }

    /// Resolves `request` and returns the shared handle for its target.
    pub async fn get_connection(
        &self,
        request: &dyn ConnectionRequest,
    ) -> Result<ConnectionHandle, SessionError> {
        let descriptor = self.resolver.resolve(request).await?;
        self.pool.get(&descriptor).await
    }

    /// Mints a token for the target carried by `request`.
    ///
    /// The backend is not contacted; the first request using the token
    /// creates the pool entry. A zero `ttl` means the store default.
    pub async fn issue_token(
        &self,
        request: &dyn ConnectionRequest,
        ttl: Duration,
    ) -> Result<IssuedToken, SessionError> {
        let descriptor = self.direct.resolve(request).await?;
        let identity = descriptor.identity();
        let token = generate_token(&identity, self.random.as_ref());

        let record = self.tokens.put(&token, descriptor, ttl).await?;
        info!(
            identity = %identity.short(),
            expires_at = record.expires_at_unix(),
            "Token issued"
        );

        Ok(IssuedToken {
            token,
            expires_at: record.expires_at,
            conn_id: format!("conn_{}", identity.short()),
        })
    }

    /// Extends a still-valid token in place and returns its new expiry.
    pub async fn refresh_token(
        &self,
        token: &str,
        ttl: Duration,
    ) -> Result<SystemTime, SessionError> {
        if token.is_empty() {
            return Err(SessionError::TokenNotFound);
        }
        let expires_at = self.tokens.extend(token, ttl).await?;
        debug!(expires_at = unix_seconds(expires_at), "Token refreshed");
        Ok(expires_at)
    }

    /// Deletes a token. Unknown tokens are not an error.
    pub async fn revoke_token(&self, token: &str) -> Result<(), SessionError> {
        self.tokens.delete(token).await?;
        info!("Token revoked");
        Ok(())
    }

    pub async fn validate_token(&self, token: &str) -> bool {
        self.tokens.is_valid(token).await
    }

    /// Stored record for a token, expired or not.
    pub async fn token_info(&self, token: &str) -> Result<TokenRecord, SessionError> {
        self.tokens.record(token).await
    }

    /// Redacted listing of every stored token.
    pub async fn list_tokens(&self) -> Vec<TokenSummary> {
        self.tokens.list().await
    }

    pub async fn stats(&self) -> SessionStats {
        SessionStats {
            pool: self.pool.stats().await,
            tokens: self.tokens.stats().await,
        }
    }

    pub async fn health_check(&self) -> SessionHealth {
        let report = self.pool.health_check().await;
        let healthy = report.values().all(Result::is_ok);
        let connections = report
            .into_iter()
            .map(|(identity, result)| {
                let status = match result {
                    Ok(()) => "ok".to_string(),
                    Err(e) => e.to_string(),
                };
                (identity, status)
            })
            .collect();

        SessionHealth {
            status: if healthy { "healthy" } else { "degraded" },
            connections,
            tokens: self.tokens.stats().await,
        }
    }

    /// Closes every pool entry and stops the token store's background work.
    pub async fn close(&self) -> Result<(), SessionError> {
        let result = self.pool.close_all().await;
        self.tokens.close().await;
        result
    }
}
