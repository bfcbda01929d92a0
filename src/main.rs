//! kvgate - A Session-Aware Gateway for Redis-Compatible Stores
//!
//! This is the main entry point for the gateway server.
//! It sets up the TCP listener, the session service, and handles incoming connections.

use clap::Parser;
use kvgate::backend::RespConnectionFactory;
use kvgate::config::Config;
use kvgate::gateway::{handle_connection, GatewayStats};
use kvgate::session::{ConnectionPool, MemoryTokenStore, SessionService};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn print_banner(config: &Config) {
    println!(
        r#"
kvgate v{} - Session-Aware Gateway for Redis-Compatible Stores
──────────────────────────────────────────────────────────────
Gateway started on {}
Ready to accept connections.

Use Ctrl+C to shutdown gracefully.
"#,
        kvgate::VERSION,
        config.bind_address()
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    // RUST_LOG wins over --log-level
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str())),
        )
        .with_target(false)
        .init();

    print_banner(&config);

    let factory = Arc::new(RespConnectionFactory::new(config.backend_timeouts()));
    let pool = ConnectionPool::new(factory, config.pool_timeouts());

    let tokens = Arc::new(
        MemoryTokenStore::new(config.reaper_config()).with_default_ttl(config.token_ttl()),
    );
    info!(
        interval_secs = config.reaper_interval_secs,
        default_ttl_secs = config.token_ttl_secs,
        "Token store initialized"
    );

    let session = Arc::new(SessionService::new(pool, tokens, config.pool_tuning()));
    let stats = Arc::new(GatewayStats::new());

    let listener = TcpListener::bind(config.bind_address()).await?;
    info!("Listening on {}", config.bind_address());

    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        info!("Shutdown signal received, stopping gateway...");
    };

    tokio::select! {
        _ = accept_loop(listener, Arc::clone(&session), stats) => {}
        _ = shutdown => {}
    }

    if let Err(e) = session.close().await {
        warn!("Error while closing backend pools: {}", e);
    }

    info!("Gateway shutdown complete");
    Ok(())
}

/// Main loop that accepts incoming connections
async fn accept_loop(
    listener: TcpListener,
    session: Arc<SessionService>,
    stats: Arc<GatewayStats>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let session = Arc::clone(&session);
                let stats = Arc::clone(&stats);

                tokio::spawn(async move {
                    handle_connection(stream, addr, session, stats).await;
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}
