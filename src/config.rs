//! Gateway configuration.
//!
//! Every option can be given on the command line or through a `KVGATE_*`
//! environment variable. Pool tuning here is only the default; clients may
//! override it per target.

use crate::backend::BackendTimeouts;
use crate::session::{PoolTimeouts, PoolTuning, ReaperConfig, MAX_TOKEN_TTL};
use clap::Parser;
use std::time::Duration;

/// The default port the gateway listens on
pub const DEFAULT_PORT: u16 = 11779;

/// The default host the gateway binds to
pub const DEFAULT_HOST: &str = "127.0.0.1";

#[derive(Debug, Clone, Parser)]
#[command(name = "kvgate", version, about = "Session-aware gateway for Redis-compatible stores")]
pub struct Config {
    /// Host to bind to.
    #[arg(long, env = "KVGATE_HOST", default_value = DEFAULT_HOST)]
    pub host: String,

    /// Port to listen on.
    #[arg(short, long, env = "KVGATE_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Default upper bound on connections per backend target.
    #[arg(long, env = "KVGATE_POOL_SIZE", default_value_t = 10)]
    pub pool_size: u32,

    /// Default number of connections opened eagerly per target.
    #[arg(long, env = "KVGATE_MIN_IDLE", default_value_t = 2)]
    pub min_idle: u32,

    /// Default retries after a transport failure.
    #[arg(long, env = "KVGATE_MAX_RETRIES", default_value_t = 3)]
    pub max_retries: u32,

    /// TCP connect timeout in milliseconds.
    #[arg(long, env = "KVGATE_DIAL_TIMEOUT_MS", default_value_t = 5000)]
    pub dial_timeout_ms: u64,

    /// Backend read/write timeout in milliseconds.
    #[arg(long, env = "KVGATE_IO_TIMEOUT_MS", default_value_t = 3000)]
    pub io_timeout_ms: u64,

    /// Wait for a free backend connection, in milliseconds.
    #[arg(long, env = "KVGATE_POOL_TIMEOUT_MS", default_value_t = 4000)]
    pub pool_timeout_ms: u64,

    /// Idle backend connections older than this are closed, in seconds.
    #[arg(long, env = "KVGATE_IDLE_TIMEOUT_SECS", default_value_t = 300)]
    pub idle_timeout_secs: u64,

    /// Liveness probe timeout for new targets, in milliseconds.
    #[arg(long, env = "KVGATE_PROBE_TIMEOUT_MS", default_value_t = 3000)]
    pub probe_timeout_ms: u64,

    /// Token lifetime when a client asks for the default.
    #[arg(long, env = "KVGATE_TOKEN_TTL_SECS", default_value_t = 3600)]
    pub token_ttl_secs: u64,

    /// Seconds between sweeps of expired tokens.
    #[arg(long, env = "KVGATE_REAPER_INTERVAL_SECS", default_value_t = 3600)]
    pub reaper_interval_secs: u64,

    /// Log filter, e.g. `info` or `kvgate=debug`. `RUST_LOG` takes precedence.
    #[arg(long, env = "KVGATE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::parse_from(["kvgate"])
    }
}

impl Config {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn pool_tuning(&self) -> PoolTuning {
        PoolTuning {
            pool_size: self.pool_size,
            min_idle: self.min_idle,
            max_retries: self.max_retries,
        }
    }

    pub fn backend_timeouts(&self) -> BackendTimeouts {
        BackendTimeouts {
            dial: Duration::from_millis(self.dial_timeout_ms),
            io: Duration::from_millis(self.io_timeout_ms),
            pool_wait: Duration::from_millis(self.pool_timeout_ms),
            idle: Duration::from_secs(self.idle_timeout_secs),
        }
    }

    /// The pool's dial deadline covers group warm-up, so it allows one dial
    /// per eagerly opened connection.
    pub fn pool_timeouts(&self) -> PoolTimeouts {
        let dials = u64::from(self.min_idle.clamp(1, self.pool_size.max(1)));
        PoolTimeouts {
            dial: Duration::from_millis(self.dial_timeout_ms.saturating_mul(dials)),
            probe: Duration::from_millis(self.probe_timeout_ms),
        }
    }

    pub fn reaper_config(&self) -> ReaperConfig {
        ReaperConfig {
            interval: Duration::from_secs(self.reaper_interval_secs.max(1)),
        }
    }

    /// Default token TTL, capped at [`MAX_TOKEN_TTL`].
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs).min(MAX_TOKEN_TTL)
    }
}
