//! Gateway Connection Handler
//!
//! Each client gets its own task running a read-parse-execute-respond loop.
//!
//! ## Connection Lifecycle
//!
//! ```text
//! 1. Client connects (TCP handshake)
//!        │
//!        ▼
//! 2. ConnectionHandler spawned (unbound)
//!        │
//!        ▼
//! 3. ┌──────────────────────────────┐
//!    │  Read bytes from socket      │
//!    │  Parse RESP command          │
//!    │  Gateway command or forward  │◄──── CONNECT / AUTH set the binding
//!    │  Send reply                  │
//!    └──────────────────────────────┘
//!        │
//!        ▼
//! 4. QUIT, disconnect or error: task ends
//! ```
//!
//! TCP is a stream protocol: we might receive partial commands, or several
//! commands in a single read. Bytes accumulate in a `BytesMut` until the
//! parser reports a complete command.

use crate::gateway::commands::CommandHandler;
use crate::protocol::parser::MAX_BULK_SIZE;
use crate::protocol::{ParseError, RespParser, RespValue};
use crate::session::SessionService;
use bytes::{Buf, BytesMut};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tracing::{debug, error, info, trace, warn};

/// Maximum size for the read buffer: one maximal bulk value plus room for
/// the rest of the command.
const MAX_BUFFER_SIZE: usize = MAX_BULK_SIZE + 64 * 1024;

/// Initial buffer capacity
const INITIAL_BUFFER_SIZE: usize = 4096;

/// Counters shared by every client connection.
#[derive(Debug, Default)]
pub struct GatewayStats {
    /// Total number of connections accepted
    pub connections_accepted: AtomicU64,
    /// Currently active connections
    pub active_connections: AtomicU64,
    /// Total commands processed, local and forwarded
    pub commands_processed: AtomicU64,
    /// Commands sent on to a backend
    pub commands_forwarded: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
}

/// Point-in-time copy of [`GatewayStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GatewayStatsSnapshot {
    pub connections_accepted: u64,
    pub active_connections: u64,
    pub commands_processed: u64,
    pub commands_forwarded: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

impl GatewayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn command_processed(&self) {
        self.commands_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_forwarded(&self) {
        self.commands_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, count: usize) {
        self.bytes_read.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn bytes_written(&self, count: usize) {
        self.bytes_written.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> GatewayStatsSnapshot {
        GatewayStatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            commands_processed: self.commands_processed.load(Ordering::Relaxed),
            commands_forwarded: self.commands_forwarded.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }
}

/// Handles a single client connection.
pub struct ConnectionHandler {
    stream: BufWriter<TcpStream>,
    /// Client's address (for logging)
    addr: SocketAddr,
    buffer: BytesMut,
    commands: CommandHandler,
    parser: RespParser,
    stats: Arc<GatewayStats>,
}

impl ConnectionHandler {
    pub fn new(
        stream: TcpStream,
        addr: SocketAddr,
        session: Arc<SessionService>,
        stats: Arc<GatewayStats>,
    ) -> Self {
        stats.connection_opened();

        Self {
            stream: BufWriter::new(stream),
            addr,
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            commands: CommandHandler::new(session, Arc::clone(&stats)),
            parser: RespParser::new(),
            stats,
        }
    }

    /// Runs the connection loop until the client quits or disconnects.
    pub async fn run(mut self) -> Result<(), GatewayError> {
        info!(client = %self.addr, "Client connected");

        let result = self.main_loop().await;

        match &result {
            Ok(()) => info!(client = %self.addr, "Client disconnected gracefully"),
            Err(GatewayError::ClientDisconnected) => {
                debug!(client = %self.addr, "Client disconnected")
            }
            Err(GatewayError::Io(io_err))
                if io_err.kind() == std::io::ErrorKind::ConnectionReset =>
            {
                debug!(client = %self.addr, "Connection reset by client")
            }
            Err(e) => warn!(client = %self.addr, error = %e, "Connection error"),
        }

        self.stats.connection_closed();
        result
    }

    async fn main_loop(&mut self) -> Result<(), GatewayError> {
        loop {
            while let Some(command) = self.try_parse_command().await? {
                let quit = command.command_name().as_deref() == Some("QUIT");

                let response = self.commands.execute(command).await;
                self.stats.command_processed();
                self.send_response(&response).await?;

                if quit {
                    return Ok(());
                }
            }

            self.read_more_data().await?;
        }
    }

    /// Parses one command from the buffer. A malformed command gets an
    /// error reply before the connection is dropped.
    async fn try_parse_command(&mut self) -> Result<Option<RespValue>, GatewayError> {
        if self.buffer.is_empty() {
            return Ok(None);
        }

        match self.parser.parse(&self.buffer) {
            Ok(Some((value, consumed))) => {
                self.buffer.advance(consumed);
                trace!(
                    client = %self.addr,
                    consumed = consumed,
                    remaining = self.buffer.len(),
                    "Parsed command"
                );
                Ok(Some(value))
            }
            Ok(None) => {
                trace!(
                    client = %self.addr,
                    buffered = self.buffer.len(),
                    "Incomplete command, need more data"
                );
                Ok(None)
            }
            Err(e) => {
                warn!(client = %self.addr, error = %e, "Parse error");
                let reply = RespValue::error(format!("ERR Protocol error: {}", e));
                self.send_response(&reply).await?;
                Err(GatewayError::Parse(e))
            }
        }
    }

    async fn read_more_data(&mut self) -> Result<(), GatewayError> {
        if self.buffer.len() >= MAX_BUFFER_SIZE {
            error!(
                client = %self.addr,
                size = self.buffer.len(),
                "Buffer size limit exceeded"
            );
            return Err(GatewayError::BufferFull);
        }

        if self.buffer.capacity() - self.buffer.len() < 1024 {
            self.buffer.reserve(INITIAL_BUFFER_SIZE);
        }

        let n = self.stream.get_mut().read_buf(&mut self.buffer).await?;
        if n == 0 {
            if self.buffer.is_empty() {
                return Err(GatewayError::ClientDisconnected);
            }
            return Err(GatewayError::UnexpectedEof);
        }

        self.stats.bytes_read(n);
        trace!(client = %self.addr, bytes = n, "Read data");
        Ok(())
    }

    async fn send_response(&mut self, response: &RespValue) -> Result<(), GatewayError> {
        let bytes = response.serialize();
        self.stream.write_all(&bytes).await?;
        self.stream.flush().await?;
        self.stats.bytes_written(bytes.len());
        trace!(client = %self.addr, bytes = bytes.len(), "Sent response");
        Ok(())
    }
}

/// Errors that end a client connection.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    /// Client disconnected normally
    #[error("Client disconnected")]
    ClientDisconnected,

    /// Connection closed with a partial command buffered
    #[error("Unexpected end of stream")]
    UnexpectedEof,

    #[error("Buffer size limit exceeded")]
    BufferFull,
}

/// Creates a [`ConnectionHandler`] and runs it to completion.
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    session: Arc<SessionService>,
    stats: Arc<GatewayStats>,
) {
    let handler = ConnectionHandler::new(stream, addr, session, stats);
    if let Err(e) = handler.run().await {
        match e {
            GatewayError::ClientDisconnected => {}
            GatewayError::Io(ref io_err)
                if io_err.kind() == std::io::ErrorKind::ConnectionReset => {}
            _ => {
                debug!(client = %addr, error = %e, "Connection ended with error");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::FakeBackend;
    use crate::backend::{BackendTimeouts, RespConnectionFactory};
    use crate::session::{ConnectionPool, MemoryTokenStore, PoolTimeouts, PoolTuning};
    use std::time::Duration;
    use tokio::net::TcpListener;

    async fn create_test_gateway() -> (SocketAddr, Arc<SessionService>, Arc<GatewayStats>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let pool = ConnectionPool::new(
            Arc::new(RespConnectionFactory::new(BackendTimeouts::default())),
            PoolTimeouts::default(),
        );
        let session = Arc::new(SessionService::new(
            pool,
            Arc::new(MemoryTokenStore::without_reaper()),
            PoolTuning::default(),
        ));
        let stats = Arc::new(GatewayStats::new());

        let session_clone = Arc::clone(&session);
        let stats_clone = Arc::clone(&stats);
        tokio::spawn(async move {
            while let Ok((stream, client_addr)) = listener.accept().await {
                tokio::spawn(handle_connection(
                    stream,
                    client_addr,
                    Arc::clone(&session_clone),
                    Arc::clone(&stats_clone),
                ));
            }
        });

        (addr, session, stats)
    }

    /// Sends one command and reads exactly one reply.
    async fn roundtrip(client: &mut TcpStream, args: &[&str]) -> RespValue {
        client
            .write_all(&RespValue::command(args).serialize())
            .await
            .unwrap();

        let mut buf = BytesMut::new();
        loop {
            if let Some((value, _)) = crate::protocol::parse_reply(&buf).unwrap() {
                return value;
            }
            let n = tokio::time::timeout(Duration::from_secs(2), client.read_buf(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert!(n > 0, "gateway closed the connection");
        }
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let (addr, _, _) = create_test_gateway().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client.write_all(b"*1\r\n$4\r\nPING\r\n").await.unwrap();

        let mut buf = [0u8; 64];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"+PONG\r\n");
    }

    #[tokio::test]
    async fn test_inline_ping() {
        let (addr, _, _) = create_test_gateway().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client.write_all(b"PING\r\n").await.unwrap();

        let mut buf = [0u8; 64];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"+PONG\r\n");
    }

    #[tokio::test]
    async fn test_connect_and_forward() {
        let backend = FakeBackend::start().await;
        let (addr, _, stats) = create_test_gateway().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        let reply = roundtrip(&mut client, &["CONNECT", backend.address().as_str()]).await;
        assert_eq!(reply, RespValue::ok());

        let reply = roundtrip(&mut client, &["SET", "name", "kv"]).await;
        assert_eq!(reply, RespValue::ok());
        let reply = roundtrip(&mut client, &["GET", "name"]).await;
        assert_eq!(reply.as_str(), Some("kv"));

        assert_eq!(stats.commands_forwarded.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_forwards_values_larger_than_read_chunk() {
        let backend = FakeBackend::start().await;
        let (addr, _, _) = create_test_gateway().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        let reply = roundtrip(&mut client, &["CONNECT", backend.address().as_str()]).await;
        assert_eq!(reply, RespValue::ok());

        let value = "x".repeat(1024 * 1024);
        let reply = roundtrip(&mut client, &["SET", "big", value.as_str()]).await;
        assert_eq!(reply, RespValue::ok());

        let reply = roundtrip(&mut client, &["GET", "big"]).await;
        assert_eq!(reply.as_bytes().map(<[u8]>::len), Some(value.len()));
    }

    #[tokio::test]
    async fn test_token_flow_across_clients() {
        let backend = FakeBackend::with_password("pw").await;
        let (addr, session, _) = create_test_gateway().await;

        let mut issuer = TcpStream::connect(addr).await.unwrap();
        let reply = roundtrip(
            &mut issuer,
            &["TOKEN.ISSUE", backend.address().as_str(), "pw", "2", "60"],
        )
        .await;
        let token = reply.into_array().unwrap()[0].as_str().unwrap().to_string();

        let mut first = TcpStream::connect(addr).await.unwrap();
        let mut second = TcpStream::connect(addr).await.unwrap();
        assert_eq!(roundtrip(&mut first, &["AUTH", token.as_str()]).await, RespValue::ok());
        assert_eq!(roundtrip(&mut second, &["AUTH", token.as_str()]).await, RespValue::ok());

        roundtrip(&mut first, &["SET", "shared", "yes"]).await;
        let reply = roundtrip(&mut second, &["GET", "shared"]).await;
        assert_eq!(reply.as_str(), Some("yes"));

        // Both clients share one pool entry.
        assert_eq!(session.pool().len().await, 1);
    }

    #[tokio::test]
    async fn test_unreachable_backend_error_code() {
        let (addr, _, _) = create_test_gateway().await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        let nowhere = FakeBackend::unused_address().await;

        let reply = roundtrip(&mut client, &["CONNECT", nowhere.as_str()]).await;
        match reply {
            RespValue::Error(msg) => assert!(msg.starts_with("UNREACHABLE"), "{msg}"),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_quit_closes_connection() {
        let (addr, _, stats) = create_test_gateway().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        assert_eq!(roundtrip(&mut client, &["QUIT"]).await, RespValue::ok());

        let mut buf = [0u8; 16];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(stats.active_connections.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_protocol_error_reply() {
        let (addr, _, _) = create_test_gateway().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client.write_all(b"*1\r\n$abc\r\n").await.unwrap();

        let mut buf = [0u8; 128];
        let n = client.read(&mut buf).await.unwrap();
        assert!(buf[..n].starts_with(b"-ERR Protocol error"));
    }

    #[tokio::test]
    async fn test_connection_stats() {
        let (addr, _, stats) = create_test_gateway().await;

        assert_eq!(stats.active_connections.load(Ordering::Relaxed), 0);

        let mut client = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(stats.connections_accepted.load(Ordering::Relaxed), 1);
        assert_eq!(stats.active_connections.load(Ordering::Relaxed), 1);

        client.write_all(b"*1\r\n$4\r\nPING\r\n").await.unwrap();
        let mut buf = [0u8; 64];
        let _ = client.read(&mut buf).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;

        let snapshot = stats.snapshot();
        assert!(snapshot.commands_processed >= 1);
        assert!(snapshot.bytes_read > 0);
        assert!(snapshot.bytes_written > 0);

        drop(client);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(stats.active_connections.load(Ordering::Relaxed), 0);
    }
}
