//! Request shapes the resolvers understand.
//!
//! Incoming requests advertise what they carry through [`ConnectionRequest`]
//! instead of being inspected at runtime. A request type opts into the
//! direct style by returning a [`TargetSpec`], into the token style by
//! returning a bearer token, or into both.

use serde::{Deserialize, Serialize};

/// Capability interface implemented by every request that needs a backend.
pub trait ConnectionRequest: Send + Sync {
    /// A self-contained description of the backend target, if carried.
    fn target(&self) -> Option<&TargetSpec> {
        None
    }

    /// A bearer token standing in for a descriptor, if carried.
    fn bearer_token(&self) -> Option<&str> {
        None
    }

    /// Short label for error messages.
    fn describe(&self) -> &'static str {
        "request"
    }
}

/// Connection parameters as supplied by a client.
///
/// Pool tuning fields are optional; absent fields take the configured
/// defaults during resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSpec {
    /// `host:port`, `[v6]:port` or a bare host
    pub addr: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub db: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_size: Option<u32>,
    #[serde(default, rename = "min_idle_conns", skip_serializing_if = "Option::is_none")]
    pub min_idle: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

impl TargetSpec {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            ..Self::default()
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    pub fn with_db(mut self, db: i64) -> Self {
        self.db = db;
        self
    }
}

impl ConnectionRequest for TargetSpec {
    fn target(&self) -> Option<&TargetSpec> {
        Some(self)
    }

    fn describe(&self) -> &'static str {
        "direct target"
    }
}

/// A request authenticated by a previously issued token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRequest {
    pub token: String,
}

impl TokenRequest {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl ConnectionRequest for TokenRequest {
    fn bearer_token(&self) -> Option<&str> {
        Some(&self.token)
    }

    fn describe(&self) -> &'static str {
        "token"
    }
}
