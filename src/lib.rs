//! # kvgate - A Session-Aware Gateway for Redis-Compatible Stores
//!
//! kvgate sits between clients and any number of Redis-compatible backends.
//! Clients describe the backend they want (address, credential, logical
//! database, pool tuning) or present a token issued earlier, and kvgate
//! hands them a shared, pooled connection for that exact target.
//!
//! ## Features
//!
//! - **Connection sharing**: One pool per distinct target, created once and
//!   reused by every client that asks for the same thing
//! - **Session tokens**: Opaque bearer tokens stand in for full connection
//!   details and expire on their own
//! - **Pluggable resolution**: Requests are turned into descriptors by an
//!   ordered chain of resolvers
//! - **Async I/O**: Built on Tokio for handling thousands of concurrent clients
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                               kvgate                                    │
//! │                                                                         │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐                  │
//! │  │ TCP Server  │───>│ Connection  │───>│  Command    │                  │
//! │  │ (Listener)  │    │  Handler    │    │  Handler    │                  │
//! │  └─────────────┘    └─────────────┘    └──────┬──────┘                  │
//! │                                               │                         │
//! │                                               ▼                         │
//! │  ┌─────────────┐    ┌──────────────────────────────────────────────┐    │
//! │  │ TokenStore  │<───│              SessionService                  │    │
//! │  │  + Reaper   │    │   CompositeResolver ──> ConnectionPool       │    │
//! │  └─────────────┘    └──────────────────────────────┬───────────────┘    │
//! │                                                    │                    │
//! │                     ┌──────────────────────────────┴───────────────┐    │
//! │                     │  ConnectionGroup per descriptor identity     │    │
//! │                     │  ┌────────┐ ┌────────┐ ┌────────┐            │    │
//! │                     │  │ conn 0 │ │ conn 1 │ │ ...N   │            │    │
//! │                     │  └────────┘ └────────┘ └────────┘            │    │
//! │                     └──────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use kvgate::backend::RespConnectionFactory;
//! use kvgate::gateway::{handle_connection, GatewayStats};
//! use kvgate::session::{
//!     ConnectionPool, MemoryTokenStore, PoolTimeouts, PoolTuning, ReaperConfig, SessionService,
//! };
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let factory = Arc::new(RespConnectionFactory::default());
//!     let pool = ConnectionPool::new(factory, PoolTimeouts::default());
//!     let tokens = Arc::new(MemoryTokenStore::new(ReaperConfig::default()));
//!     let session = Arc::new(SessionService::new(pool, tokens, PoolTuning::default()));
//!     let stats = Arc::new(GatewayStats::new());
//!
//!     let listener = TcpListener::bind("127.0.0.1:11779").await?;
//!     loop {
//!         let (stream, addr) = listener.accept().await?;
//!         tokio::spawn(handle_connection(stream, addr, Arc::clone(&session), Arc::clone(&stats)));
//!     }
//! }
//! ```
//!
//! ## Gateway Commands
//!
//! ### Binding
//! - `CONNECT addr [password] [db]`
//! - `AUTH token`
//!
//! ### Tokens
//! - `TOKEN.ISSUE addr [password] [db] [ttl]`
//! - `TOKEN.REFRESH token [ttl]`
//! - `TOKEN.REVOKE token`
//! - `TOKEN.VALIDATE token`
//! - `TOKEN.LIST`
//!
//! ### Server
//! - `PING [message]`
//! - `GATEWAY.STATS`
//! - `GATEWAY.HEALTH`
//! - `QUIT`
//!
//! Everything else is forwarded to the bound backend.
//!
//! ## Module Overview
//!
//! - [`protocol`]: RESP protocol parser and types
//! - [`session`]: Descriptors, resolvers, the connection pool and tokens
//! - [`backend`]: Pooled RESP connections to the real stores
//! - [`gateway`]: Client connection handling and command dispatch
//! - [`config`]: Command-line and environment configuration
//!
//! ## Design Highlights
//!
//! ### Identity-Keyed Pools
//!
//! Two descriptors share a pool exactly when their SHA-256 identities match.
//! The identity covers every field, including the credential, so clients with
//! different passwords never share connections.
//!
//! ### Single-Flight Creation
//!
//! The first request for a new identity dials and probes the backend while
//! holding the pool's write lock. Concurrent requests for the same identity
//! wait and then find the finished entry, so a target is dialed once.
//!
//! ### Lazy + Active Expiry
//!
//! Tokens expire in two ways:
//! 1. **Lazy**: A lookup of an expired token fails with `TokenExpired`
//! 2. **Active**: A background reaper periodically purges expired tokens

pub mod backend;
pub mod config;
pub mod gateway;
pub mod protocol;
pub mod session;

// Re-export commonly used types for convenience
pub use config::{Config, DEFAULT_HOST, DEFAULT_PORT};
pub use gateway::{handle_connection, CommandHandler, GatewayStats};
pub use protocol::{ParseError, RespParser, RespValue};
pub use session::{
    ConnectionDescriptor, ConnectionPool, MemoryTokenStore, SessionError, SessionService,
    TokenStore,
};

/// Version of kvgate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
