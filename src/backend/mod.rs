//! Backend Connections
//!
//! This module defines what the session layer needs from the outside world
//! to reach a store, and provides the RESP implementation used in
//! production.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐  connect(descriptor)  ┌──────────────────────────┐
//! │  ConnectionPool  │──────────────────────>│  RespConnectionFactory   │
//! │  (session layer) │<──────────────────────│                          │
//! └────────┬─────────┘   ConnectionHandle    └──────────────────────────┘
//!          │
//!          │ ping / execute / close
//!          ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                  ConnectionGroup                         │
//! │  ┌──────────────┐ ┌──────────────┐ ┌──────────────┐      │
//! │  │RespConnection│ │RespConnection│ │     ...      │      │
//! │  │  (TCP + buf) │ │  (TCP + buf) │ │ <= pool_size │      │
//! │  └──────────────┘ └──────────────┘ └──────────────┘      │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! A [`ConnectionHandle`] is shared by every caller that resolves to the same
//! descriptor. Callers never close it themselves; the pool does.

pub mod connection;
pub mod factory;
pub mod group;

#[cfg(test)]
pub(crate) mod testing;

use crate::protocol::{ParseError, RespValue};
use crate::session::ConnectionDescriptor;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub use connection::RespConnection;
pub use factory::RespConnectionFactory;
pub use group::ConnectionGroup;

/// Shared handle to one connection group.
pub type ConnectionHandle = Arc<dyn BackendConnection>;

/// A reusable group of connections to one backend target.
#[async_trait]
pub trait BackendConnection: Send + Sync {
    /// `host:port` this group talks to.
    fn address(&self) -> String;

    /// Liveness check. Never retried.
    async fn ping(&self) -> Result<(), BackendError>;

    /// Sends one command and returns the reply, including error replies.
    async fn execute(&self, command: RespValue) -> Result<RespValue, BackendError>;

    /// Closes every connection in the group.
    async fn close(&self) -> Result<(), BackendError>;

    fn stats(&self) -> GroupStats;
}

impl fmt::Debug for dyn BackendConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendConnection")
            .field("address", &self.address())
            .finish()
    }
}

/// Creates connection groups for descriptors.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<ConnectionHandle, BackendError>;
}

/// Timeouts applied by the RESP backend client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendTimeouts {
    /// TCP connect
    pub dial: Duration,
    /// Each read or write on an established connection
    pub io: Duration,
    /// Waiting for a free slot when the group is at `pool_size`
    pub pool_wait: Duration,
    /// Idle connections older than this are discarded on checkout
    pub idle: Duration,
}

impl Default for BackendTimeouts {
    fn default() -> Self {
        Self {
            dial: Duration::from_secs(5),
            io: Duration::from_secs(3),
            pool_wait: Duration::from_secs(4),
            idle: Duration::from_secs(300),
        }
    }
}

/// Counters for one connection group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GroupStats {
    /// Checkouts served by an idle connection
    pub hits: u64,
    /// Checkouts that had to dial
    pub misses: u64,
    /// Checkouts that gave up waiting for a slot
    pub timeouts: u64,
    /// Open physical connections
    pub total_conns: u32,
    pub idle_conns: u32,
    /// Connections discarded for idling too long
    pub stale_conns: u64,
}

/// Errors raised while talking to a backend.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ParseError),

    #[error("{op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("SELECT {namespace} failed: {reason}")]
    Select { namespace: i64, reason: String },

    #[error("unexpected reply to {command}: {reply}")]
    UnexpectedReply { command: &'static str, reply: String },

    #[error("connection closed by backend")]
    Closed,

    #[error("timed out waiting for a free connection")]
    PoolTimeout,

    #[error("connection group is closed")]
    GroupClosed,
}

impl BackendError {
    /// True when the connection itself is suspect and a fresh one may succeed.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            BackendError::Io(_)
                | BackendError::Protocol(_)
                | BackendError::Timeout { .. }
                | BackendError::Closed
        )
    }
}
