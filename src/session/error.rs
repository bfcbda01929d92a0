//! Error taxonomy for connection and session management.

use crate::session::descriptor::DescriptorError;
use std::time::Duration;
use thiserror::Error;

/// Every failure the session layer reports.
///
/// Components return these kinds directly and the orchestration layer passes
/// them through untouched, so front ends can map [`code`](Self::code) to
/// their own status vocabulary.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The descriptor failed validation; the caller must fix its input.
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(#[from] DescriptorError),

    /// No registered resolver accepts the request.
    #[error("unsupported request: {0}")]
    UnsupportedRequest(String),

    /// A specific resolver was handed a request it cannot read.
    #[error("unsupported request shape for the {0} resolver")]
    UnsupportedShape(&'static str),

    /// Dial or liveness probe failed. Safe to retry with backoff.
    #[error("backend {addr} unreachable: {reason}")]
    BackendUnreachable { addr: String, reason: String },

    #[error("token not found")]
    TokenNotFound,

    #[error("token expired")]
    TokenExpired,

    /// A token lifetime longer than the store accepts.
    #[error("ttl of {}s exceeds the maximum of {}s", .ttl.as_secs(), .max.as_secs())]
    InvalidTtl { ttl: Duration, max: Duration },

    /// The pool has been shut down.
    #[error("connection pool is closed")]
    PoolClosed,

    /// A pool entry failed to close during teardown. The entry is gone
    /// regardless, so there is nothing to retry.
    #[error("closing {addr} failed: {reason}")]
    CloseFailed { addr: String, reason: String },
}

impl SessionError {
    pub fn unreachable(addr: impl Into<String>, reason: impl ToString) -> Self {
        SessionError::BackendUnreachable {
            addr: addr.into(),
            reason: reason.to_string(),
        }
    }

    /// Stable upper-case code, used as the RESP error prefix.
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::InvalidDescriptor(_) => "INVALIDDESCRIPTOR",
            SessionError::UnsupportedRequest(_) | SessionError::UnsupportedShape(_) => {
                "UNSUPPORTED"
            }
            SessionError::BackendUnreachable { .. } => "UNREACHABLE",
            SessionError::TokenNotFound => "NOTOKEN",
            SessionError::TokenExpired => "TOKENEXPIRED",
            SessionError::InvalidTtl { .. } => "INVALIDTTL",
            SessionError::PoolClosed => "POOLCLOSED",
            SessionError::CloseFailed { .. } => "CLOSEFAILED",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, SessionError::BackendUnreachable { .. })
    }
}
