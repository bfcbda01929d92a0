//! Connection and Session Management
//!
//! Decides which backend a request targets, shares one connection group per
//! distinct target, and issues short-lived tokens that stand in for a full
//! descriptor.
//!
//! ## Flow
//!
//! ```text
//!   ConnectionRequest
//!         │
//!         ▼
//!  ┌───────────────────┐     ┌───────────────┐
//!  │ CompositeResolver │────>│  TokenStore   │  (token-shaped requests)
//!  └─────────┬─────────┘     │  + reaper     │
//!            │               └───────────────┘
//!   ConnectionDescriptor
//!            │
//!            ▼
//!  ┌───────────────────┐
//!  │  ConnectionPool   │  identity -> ConnectionHandle
//!  └───────────────────┘
//! ```
//!
//! The pool map and the token map are separate lock domains and no code
//! path holds both at once.

pub mod descriptor;
pub mod error;
pub mod pool;
pub mod reaper;
pub mod request;
pub mod resolver;
pub mod service;
pub mod token;

pub use descriptor::{
    parse_address, ConnectionDescriptor, DescriptorError, Digest, PoolTuning,
    DEFAULT_BACKEND_PORT,
};
pub use error::SessionError;
pub use pool::{ConnectionPool, PoolStats, PoolTimeouts};
pub use reaper::{ReaperConfig, TokenReaper};
pub use request::{ConnectionRequest, TargetSpec, TokenRequest};
pub use resolver::{CompositeResolver, DirectDescriptorResolver, Resolver, TokenResolver};
pub use service::{IssuedToken, SessionHealth, SessionService, SessionStats};
pub use token::{
    generate_token, MemoryTokenStore, OsRandom, RandomSource, TokenRecord, TokenStats,
    TokenStore, TokenSummary, DEFAULT_TOKEN_TTL, MAX_TOKEN_TTL,
};
