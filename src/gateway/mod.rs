//! RESP Gateway
//!
//! The network front end of kvgate. Clients speak RESP, so any Redis client
//! can connect, bind to a backend with `CONNECT` or `AUTH`, and send
//! ordinary commands that are forwarded over a pooled connection.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     TCP Listener                            │
//! │                    (main.rs)                                │
//! └──────────────────────┬──────────────────────────────────────┘
//!                        │ accept(), spawn task per client
//!                        ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 ConnectionHandler                           │
//! │  ┌─────────────┐    ┌─────────────┐    ┌────────────────┐   │
//! │  │ Read bytes  │───>│ Parse RESP  │───>│ CommandHandler │   │
//! │  └─────────────┘    └─────────────┘    └───────┬────────┘   │
//! └────────────────────────────────────────────────┼────────────┘
//!                                                  ▼
//!                                          SessionService
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use kvgate::gateway::{handle_connection, GatewayStats};
//! use std::sync::Arc;
//!
//! let stats = Arc::new(GatewayStats::new());
//!
//! // For each accepted connection...
//! let (stream, addr) = listener.accept().await?;
//! tokio::spawn(handle_connection(stream, addr, Arc::clone(&session), Arc::clone(&stats)));
//! ```

pub mod commands;
pub mod handler;

pub use commands::{Binding, CommandHandler};
pub use handler::{
    handle_connection, ConnectionHandler, GatewayError, GatewayStats, GatewayStatsSnapshot,
};
