//! Connection descriptors and their identity digest.
//!
//! A [`ConnectionDescriptor`] is the normalized identity of one backend
//! target: where to connect, which credential and logical namespace to use,
//! and how the connection group behind it is tuned. Two descriptors with the
//! same fields address the same pool entry; any difference yields a new one.

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;
use thiserror::Error;

/// Default backend port when an address carries none.
pub const DEFAULT_BACKEND_PORT: u16 = 6379;

/// Tuning of the connection group behind one descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PoolTuning {
    /// Upper bound on physical connections in the group
    pub pool_size: u32,
    /// Connections opened eagerly when the group is created
    pub min_idle: u32,
    /// Extra attempts after a transport failure
    pub max_retries: u32,
}

impl Default for PoolTuning {
    fn default() -> Self {
        Self {
            pool_size: 10,
            min_idle: 2,
            max_retries: 3,
        }
    }
}

/// Validation failure, naming the offending field.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("host is required")]
    EmptyHost,

    #[error("invalid port: {0}")]
    InvalidPort(String),

    #[error("invalid namespace: {0}")]
    NegativeNamespace(i64),

    #[error("invalid pool size: {0}")]
    InvalidPoolSize(u32),
}

impl DescriptorError {
    /// Name of the field that failed validation.
    pub fn field(&self) -> &'static str {
        match self {
            DescriptorError::EmptyHost => "host",
            DescriptorError::InvalidPort(_) => "port",
            DescriptorError::NegativeNamespace(_) => "namespace",
            DescriptorError::InvalidPoolSize(_) => "pool_size",
        }
    }
}

/// SHA-256 identity of a descriptor.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; 32]);

impl Digest {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Full lower-case hex form.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 8 hex characters; used in token prefixes and connection ids.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.short())
    }
}

/// Immutable identity of a backend connection target.
///
/// Built with [`ConnectionDescriptor::new`] and the `with_*` methods, then
/// checked with [`validate`](Self::validate) before it reaches the pool.
///
/// ```
/// use kvgate::session::ConnectionDescriptor;
///
/// let a = ConnectionDescriptor::new("cache.internal", 6379).with_namespace(0);
/// let b = ConnectionDescriptor::new("cache.internal", 6379).with_namespace(1);
/// assert_ne!(a.identity(), b.identity());
/// assert!(a.validate().is_ok());
/// ```
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ConnectionDescriptor {
    host: String,
    port: u16,
    credential: String,
    namespace: i64,
    tuning: PoolTuning,
}

impl ConnectionDescriptor {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            credential: String::new(),
            namespace: 0,
            tuning: PoolTuning::default(),
        }
    }

    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = credential.into();
        self
    }

    pub fn with_namespace(mut self, namespace: i64) -> Self {
        self.namespace = namespace;
        self
    }

    pub fn with_tuning(mut self, tuning: PoolTuning) -> Self {
        self.tuning = tuning;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn credential(&self) -> &str {
        &self.credential
    }

    pub fn namespace(&self) -> i64 {
        self.namespace
    }

    pub fn tuning(&self) -> PoolTuning {
        self.tuning
    }

    /// `host:port`, bracketing IPv6 literals.
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Deterministic digest over every pool-affecting field.
    ///
    /// Variable-length fields are length-prefixed so that no two distinct
    /// descriptors share a canonical form.
    pub fn identity(&self) -> Digest {
        let canonical = format!(
            "{}:{}|{}|{}:{}|{}|{}|{}|{}",
            self.host.len(),
            self.host,
            self.port,
            self.credential.len(),
            self.credential,
            self.namespace,
            self.tuning.pool_size,
            self.tuning.min_idle,
            self.tuning.max_retries,
        );
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&Sha256::digest(canonical.as_bytes()));
        Digest(bytes)
    }

    pub fn validate(&self) -> Result<(), DescriptorError> {
        if self.host.trim().is_empty() {
            return Err(DescriptorError::EmptyHost);
        }
        if self.port == 0 {
            return Err(DescriptorError::InvalidPort(self.port.to_string()));
        }
        if self.namespace < 0 {
            return Err(DescriptorError::NegativeNamespace(self.namespace));
        }
        if self.tuning.pool_size == 0 {
            return Err(DescriptorError::InvalidPoolSize(self.tuning.pool_size));
        }
        Ok(())
    }
}

// The credential never reaches logs.
impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("host", &self.host)
            .field("port", &self.port)
            .field(
                "credential",
                &if self.credential.is_empty() { "" } else { "<redacted>" },
            )
            .field("namespace", &self.namespace)
            .field("tuning", &self.tuning)
            .finish()
    }
}

/// Splits `host:port`, `[v6]:port` or a bare host.
pub fn parse_address(addr: &str) -> Result<(String, u16), DescriptorError> {
    let addr = addr.trim();
    if addr.is_empty() {
        return Err(DescriptorError::EmptyHost);
    }

    if let Some(rest) = addr.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| DescriptorError::InvalidPort(addr.to_string()))?;
        return match tail.strip_prefix(':') {
            Some(port) => Ok((host.to_string(), parse_port(port)?)),
            None if tail.is_empty() => Ok((host.to_string(), DEFAULT_BACKEND_PORT)),
            None => Err(DescriptorError::InvalidPort(tail.to_string())),
        };
    }

    match addr.rsplit_once(':') {
        // A bare IPv6 literal has several colons and no port.
        Some((host, _)) if host.contains(':') => Ok((addr.to_string(), DEFAULT_BACKEND_PORT)),
        Some((host, port)) => Ok((host.to_string(), parse_port(port)?)),
        None => Ok((addr.to_string(), DEFAULT_BACKEND_PORT)),
    }
}

fn parse_port(port: &str) -> Result<u16, DescriptorError> {
    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err(DescriptorError::InvalidPort(port.to_string())),
        Ok(port) => Ok(port),
    }
}
